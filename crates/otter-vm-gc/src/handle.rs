//! Generational handles into a [`Space`](crate::Space).
//!
//! A handle is an `(index, generation)` pair. Slots are reused after a sweep,
//! but the generation is bumped every time a slot is vacated, so a handle that
//! outlived its object can never observe the slot's next occupant.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Typed, copyable reference to an object living in a `Space<T>`.
///
/// Holding a `Handle` does not keep anything alive by itself; liveness is
/// decided by the tracer from the edges objects declare.
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

// we need custom impls, derive would put bounds on T
impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.index, self.generation).cmp(&(other.index, other.generation))
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

impl<T> Handle<T> {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// Slot index inside the owning space
    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Generation of the slot when this handle was issued
    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    /// Pack into 64 bits: generation in the high half, index in the low half.
    #[inline]
    pub const fn to_bits(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    /// Inverse of [`Handle::to_bits`].
    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self::new(bits as u32, (bits >> 32) as u32)
    }

    /// Downgrade to a weak reference.
    #[inline]
    pub const fn downgrade(self) -> Weak<T> {
        Weak(self)
    }
}

/// A handle the tracer visits with [`Strength::Weak`](crate::Strength::Weak).
///
/// Upgrading goes through the space: once the target has been swept the
/// generation no longer matches and [`Space::upgrade`](crate::Space::upgrade)
/// returns `None`.
pub struct Weak<T>(Handle<T>);

impl<T> Clone for Weak<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Weak<T> {}

impl<T> PartialEq for Weak<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T> Eq for Weak<T> {}

impl<T> Hash for Weak<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl<T> fmt::Debug for Weak<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Weak({}v{})", self.0.index, self.0.generation)
    }
}

impl<T> Weak<T> {
    /// The handle this weak reference was created from, without a liveness check.
    ///
    /// Only meaningful for identity comparisons; use `Space::upgrade` to reach
    /// the object.
    #[inline]
    pub const fn as_handle_unchecked(self) -> Handle<T> {
        self.0
    }
}
