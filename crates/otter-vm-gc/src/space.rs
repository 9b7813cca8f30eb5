//! Slab-backed object space with stable indices.
//!
//! Objects never move between slots. A vacated slot goes on the free list and
//! its generation is bumped so stale handles stop resolving.

use crate::handle::{Handle, Weak};

enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
}

impl<T> Slot<T> {
    fn generation(&self) -> u32 {
        match self {
            Slot::Occupied { generation, .. } | Slot::Vacant { generation } => *generation,
        }
    }
}

/// A homogeneous object space.
pub struct Space<T> {
    name: &'static str,
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Space<T> {
    /// Create an empty space
    pub fn new(name: &'static str) -> Self {
        Self::with_capacity(name, 0)
    }

    /// Create an empty space with room for `capacity` objects
    pub fn with_capacity(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Space name, used in GC logs
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Number of live objects
    pub fn len(&self) -> usize {
        self.live
    }

    /// True if the space holds no objects
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Allocate a slot for `value`.
    pub fn insert(&mut self, value: T) -> Handle<T> {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            let generation = slot.generation();
            *slot = Slot::Occupied { generation, value };
            return Handle::new(index, generation);
        }
        assert!(self.slots.len() < u32::MAX as usize, "space index overflow");
        let index = self.slots.len() as u32;
        self.slots.push(Slot::Occupied {
            generation: 0,
            value,
        });
        Handle::new(index, 0)
    }

    /// Resolve a handle; `None` if the object was swept.
    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        match self.slots.get(handle.index() as usize)? {
            Slot::Occupied { generation, value } if *generation == handle.generation() => {
                Some(value)
            }
            _ => None,
        }
    }

    /// Mutable variant of [`Space::get`].
    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        match self.slots.get_mut(handle.index() as usize)? {
            Slot::Occupied { generation, value } if *generation == handle.generation() => {
                Some(value)
            }
            _ => None,
        }
    }

    /// True if `handle` still resolves
    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.get(handle).is_some()
    }

    /// Upgrade a weak reference if its target is still alive.
    pub fn upgrade(&self, weak: Weak<T>) -> Option<Handle<T>> {
        let handle = weak.as_handle_unchecked();
        self.contains(handle).then_some(handle)
    }

    /// Free a single object, returning it.
    pub fn remove(&mut self, handle: Handle<T>) -> Option<T> {
        let slot = self.slots.get_mut(handle.index() as usize)?;
        if !matches!(slot, Slot::Occupied { generation, .. } if *generation == handle.generation())
        {
            return None;
        }
        let vacated = Slot::Vacant {
            generation: handle.generation().wrapping_add(1),
        };
        let Slot::Occupied { value, .. } = std::mem::replace(slot, vacated) else {
            unreachable!("slot checked occupied above");
        };
        self.free.push(handle.index());
        self.live -= 1;
        Some(value)
    }

    /// Iterate over live objects in slot order
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, value } => {
                    Some((Handle::new(index as u32, *generation), value))
                }
                Slot::Vacant { .. } => None,
            })
    }

    /// Mutable iteration over live objects in slot order
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle<T>, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, value } => {
                    Some((Handle::new(index as u32, *generation), value))
                }
                Slot::Vacant { .. } => None,
            })
    }

    /// Handles of all live objects
    pub fn handles(&self) -> Vec<Handle<T>> {
        self.iter().map(|(handle, _)| handle).collect()
    }

    /// Sweep: free every object for which `is_live` returns false.
    ///
    /// Returns the freed objects so the caller can run teardown on them.
    pub fn sweep(&mut self, mut is_live: impl FnMut(Handle<T>) -> bool) -> Vec<(Handle<T>, T)> {
        let dead: Vec<Handle<T>> = self
            .iter()
            .map(|(handle, _)| handle)
            .filter(|handle| !is_live(*handle))
            .collect();
        dead.into_iter()
            .filter_map(|handle| self.remove(handle).map(|value| (handle, value)))
            .collect()
    }
}

impl<T> std::fmt::Debug for Space<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Space")
            .field("name", &self.name)
            .field("live", &self.live)
            .field("slots", &self.slots.len())
            .finish()
    }
}
