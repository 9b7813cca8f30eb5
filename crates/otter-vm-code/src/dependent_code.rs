//! Dependent code lists
//!
//! Every tracked object carries a list of `(weak code, groups)` entries
//! recording which compiled code assumes something about the object, and
//! why. The list never keeps code alive.
//!
//! Backing storage never shrinks. Removing an entry moves the last live
//! entry into the hole and shortens the logical length, so entry order is
//! not stable.

use bitflags::bitflags;
use otter_vm_gc::{Handle, Space, Strength, Trace, Visitor, Weak};

use crate::code::Code;
use crate::heap::HeapRef;

bitflags! {
    /// Reasons code depends on an object
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DependencyGroups: u32 {
        /// Map has no outgoing transitions
        const TRANSITION = 1 << 0;
        /// Prototype chain shape is stable
        const PROTOTYPE_CHECK = 1 << 1;
        /// Property cell holds a particular value or type
        const PROPERTY_CELL_CHANGED = 1 << 2;
        /// Field is constant
        const FIELD_CONST = 1 << 3;
        /// Field type is fixed
        const FIELD_TYPE = 1 << 4;
        /// Field representation is fixed
        const FIELD_REPRESENTATION = 1 << 5;
        /// Constructor's initial map is unchanged
        const INITIAL_MAP_CHANGED = 1 << 6;
        /// Allocation site tenuring decision
        const ALLOCATION_SITE_TENURING_CHANGED = 1 << 7;
        /// Allocation site elements kind transition
        const ALLOCATION_SITE_TRANSITION_CHANGED = 1 << 8;
    }
}

impl DependencyGroups {
    /// Name of a single group, for logs
    pub fn group_name(self) -> &'static str {
        match self {
            DependencyGroups::TRANSITION => "transition",
            DependencyGroups::PROTOTYPE_CHECK => "prototype-check",
            DependencyGroups::PROPERTY_CELL_CHANGED => "property-cell-changed",
            DependencyGroups::FIELD_CONST => "field-const",
            DependencyGroups::FIELD_TYPE => "field-type",
            DependencyGroups::FIELD_REPRESENTATION => "field-representation",
            DependencyGroups::INITIAL_MAP_CHANGED => "initial-map-changed",
            DependencyGroups::ALLOCATION_SITE_TENURING_CHANGED => "allocation-site-tenuring-changed",
            DependencyGroups::ALLOCATION_SITE_TRANSITION_CHANGED => "allocation-site-transition-changed",
            _ => "multiple",
        }
    }
}

/// One `(code, groups)` pair; `code` is `None` once cleared
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    code: Option<Weak<Code>>,
    groups: DependencyGroups,
}

impl Entry {
    const CLEARED: Entry = Entry {
        code: None,
        groups: DependencyGroups::empty(),
    };
}

/// Weak list of code depending on one object
#[derive(Debug, Clone, Default)]
pub struct DependentCode {
    entries: Vec<Entry>,
    length: usize,
}

impl DependentCode {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Logical length
    pub fn len(&self) -> usize {
        self.length
    }

    /// True if no entry is in use
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Physical capacity; never decreases
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Live entries resolved through `codes`
    pub fn entries<'a>(&'a self, codes: &'a Space<Code>) -> impl Iterator<Item = (Handle<Code>, DependencyGroups)> + 'a {
        self.entries[..self.length].iter().filter_map(move |entry| {
            entry
                .code
                .and_then(|weak| codes.upgrade(weak))
                .map(|handle| (handle, entry.groups))
        })
    }

    /// Record that `code` depends on the owner for `groups`. Duplicates are
    /// kept.
    pub fn insert_weak_code(&mut self, code: Handle<Code>, groups: DependencyGroups, codes: &Space<Code>) {
        debug_assert!(!groups.is_empty());
        if self.length == self.entries.len() {
            // try to make room before growing
            self.iterate_and_compact(codes, |_, _| false);
        }
        let entry = Entry {
            code: Some(code.downgrade()),
            groups,
        };
        if self.length < self.entries.len() {
            self.entries[self.length] = entry;
        } else {
            self.entries.push(entry);
        }
        self.length += 1;
    }

    /// Visit live entries back to front. Entries for which `visit` returns
    /// true are removed, as are entries whose code is gone.
    pub fn iterate_and_compact(
        &mut self,
        codes: &Space<Code>,
        mut visit: impl FnMut(Handle<Code>, DependencyGroups) -> bool,
    ) {
        let mut len = self.length;
        if len == 0 {
            return;
        }
        let mut i = len;
        while i > 0 {
            i -= 1;
            let live = self.entries[i].code.and_then(|weak| codes.upgrade(weak));
            let remove = match live {
                None => true,
                Some(code) => visit(code, self.entries[i].groups),
            };
            if remove {
                len = self.fill_entry_from_back(i, len, codes);
            }
        }
        self.length = len;
    }

    /// Fill slot `index` with the last live entry in `(index, length)`.
    /// Returns the new logical length: the slot the entry came from, or
    /// `index` if there was none.
    fn fill_entry_from_back(&mut self, index: usize, length: usize, codes: &Space<Code>) -> usize {
        let mut i = length;
        while i > index + 1 {
            i -= 1;
            let entry = self.entries[i];
            let live = entry.code.is_some_and(|weak| codes.upgrade(weak).is_some());
            if !live {
                continue;
            }
            self.entries[index] = entry;
            self.entries[i] = Entry::CLEARED;
            return i;
        }
        self.entries[index] = Entry::CLEARED;
        index
    }

    /// Mark every live code depending on `groups` for deoptimization and
    /// drop its entries. Returns true if anything was newly marked.
    pub fn mark_code_for_deoptimization(&mut self, groups: DependencyGroups, codes: &Space<Code>) -> bool {
        let mut marked_something = false;
        self.iterate_and_compact(codes, |handle, entry_groups| {
            if !entry_groups.intersects(groups) {
                return false;
            }
            if let Some(code) = codes.get(handle) {
                if code.set_marked_for_deoptimization("code dependencies") {
                    tracing::debug!(
                        target: "otter::deopt",
                        code = ?handle,
                        kind = %code.kind(),
                        groups = entry_groups.intersection(groups).group_name(),
                        "marked dependent code for deoptimization"
                    );
                    marked_something = true;
                }
            }
            true
        });
        marked_something
    }

    /// Clear entries whose code did not survive marking. Called by the
    /// collector; the slots are compacted on the next traversal.
    pub fn clear_dead(&mut self, is_live: impl Fn(Handle<Code>) -> bool) -> usize {
        let mut cleared = 0;
        for entry in &mut self.entries[..self.length] {
            if let Some(weak) = entry.code {
                if !is_live(weak.as_handle_unchecked()) {
                    *entry = Entry::CLEARED;
                    cleared += 1;
                }
            }
        }
        cleared
    }
}

impl Trace<HeapRef> for DependentCode {
    fn trace(&self, visitor: &mut dyn Visitor<HeapRef>) {
        for entry in &self.entries[..self.length] {
            if let Some(weak) = entry.code {
                visitor.visit(HeapRef::Code(weak.as_handle_unchecked()), Strength::Weak);
            }
        }
    }
}
