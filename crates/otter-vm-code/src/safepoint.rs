//! Safepoint tables
//!
//! Both tables are sorted by pc offset and searched with an exact-match
//! binary search. Asking for a pc that has no entry is a caller bug.
//!
//! ```text
//! safepoint:        [length u32][bitmap_bytes u32]
//!                   { [pc u32][deopt_index i32][tagged_registers u32][bitmap] } * length
//! maglev safepoint: [length u32][num_tagged_slots u32][num_untagged_slots u32]
//!                   { [pc u32][deopt_index i32][num_pushed_registers u8][tagged_register_indexes u32] } * length
//! ```

/// Deopt index of a safepoint without a deoptimization point
pub const NO_DEOPT_INDEX: i32 = -1;

#[inline]
fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// One safepoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafepointEntry {
    /// Pc offset from the instruction start
    pub pc: u32,
    /// Deoptimization entry index or [`NO_DEOPT_INDEX`]
    pub deopt_index: i32,
    /// Bitmap of registers holding tagged values
    pub tagged_registers: u32,
    /// Bitmap of stack slots holding tagged values
    pub tagged_slots: Vec<u8>,
}

impl SafepointEntry {
    /// True if this safepoint is also a deoptimization point
    pub fn has_deoptimization_index(&self) -> bool {
        self.deopt_index != NO_DEOPT_INDEX
    }

    /// True if stack slot `slot` holds a tagged value
    pub fn is_slot_tagged(&self, slot: usize) -> bool {
        self.tagged_slots
            .get(slot / 8)
            .is_some_and(|byte| byte & (1 << (slot % 8)) != 0)
    }
}

/// Collects safepoints while assembling
#[derive(Debug, Clone)]
pub struct SafepointTableBuilder {
    bitmap_bytes: usize,
    entries: Vec<SafepointEntry>,
}

impl SafepointTableBuilder {
    /// Builder for a frame with `stack_slots` spill slots
    pub fn new(stack_slots: usize) -> Self {
        Self {
            bitmap_bytes: stack_slots.div_ceil(8),
            entries: Vec::new(),
        }
    }

    /// Record a safepoint. `tagged_slots` lists the stack slots holding
    /// tagged values.
    pub fn define_safepoint(
        &mut self,
        pc: u32,
        deopt_index: i32,
        tagged_registers: u32,
        tagged_slots: &[usize],
    ) -> &mut Self {
        let mut bitmap = vec![0u8; self.bitmap_bytes];
        for &slot in tagged_slots {
            assert!(slot / 8 < self.bitmap_bytes, "stack slot {slot} outside frame");
            bitmap[slot / 8] |= 1 << (slot % 8);
        }
        self.entries.push(SafepointEntry {
            pc,
            deopt_index,
            tagged_registers,
            tagged_slots: bitmap,
        });
        self
    }

    /// Encode, sorted by pc
    pub fn finish(mut self) -> Vec<u8> {
        self.entries.sort_by_key(|entry| entry.pc);
        self.entries.dedup_by_key(|entry| entry.pc);
        let mut out = Vec::new();
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.bitmap_bytes as u32).to_le_bytes());
        for entry in &self.entries {
            out.extend_from_slice(&entry.pc.to_le_bytes());
            out.extend_from_slice(&entry.deopt_index.to_le_bytes());
            out.extend_from_slice(&entry.tagged_registers.to_le_bytes());
            out.extend_from_slice(&entry.tagged_slots);
        }
        out
    }
}

/// Read-only view of an encoded safepoint table
#[derive(Debug, Clone, Copy)]
pub struct SafepointTable<'a> {
    bytes: &'a [u8],
    length: usize,
    bitmap_bytes: usize,
}

impl<'a> SafepointTable<'a> {
    const HEADER_SIZE: usize = 8;
    const FIXED_ENTRY_SIZE: usize = 12;

    /// Wrap encoded bytes
    pub fn new(bytes: &'a [u8]) -> Self {
        assert!(bytes.len() >= Self::HEADER_SIZE, "safepoint table missing");
        let length = read_u32(bytes, 0) as usize;
        let bitmap_bytes = read_u32(bytes, 4) as usize;
        assert_eq!(
            bytes.len(),
            Self::HEADER_SIZE + length * (Self::FIXED_ENTRY_SIZE + bitmap_bytes),
            "corrupt safepoint table"
        );
        Self {
            bytes,
            length,
            bitmap_bytes,
        }
    }

    /// Number of safepoints
    pub fn len(&self) -> usize {
        self.length
    }

    /// True if there are no safepoints
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    fn entry_start(&self, index: usize) -> usize {
        Self::HEADER_SIZE + index * (Self::FIXED_ENTRY_SIZE + self.bitmap_bytes)
    }

    fn pc_at(&self, index: usize) -> u32 {
        read_u32(self.bytes, self.entry_start(index))
    }

    /// Entry `index`
    pub fn entry(&self, index: usize) -> SafepointEntry {
        assert!(index < self.length);
        let at = self.entry_start(index);
        SafepointEntry {
            pc: read_u32(self.bytes, at),
            deopt_index: read_u32(self.bytes, at + 4) as i32,
            tagged_registers: read_u32(self.bytes, at + 8),
            tagged_slots: self.bytes[at + 12..at + 12 + self.bitmap_bytes].to_vec(),
        }
    }

    /// Entry at exactly `pc_offset`, if any
    pub fn try_find_entry(&self, pc_offset: u32) -> Option<SafepointEntry> {
        find_exact(self.length, pc_offset, |i| self.pc_at(i)).map(|i| self.entry(i))
    }

    /// Entry at exactly `pc_offset`; there must be one.
    pub fn find_entry(&self, pc_offset: u32) -> SafepointEntry {
        match self.try_find_entry(pc_offset) {
            Some(entry) => entry,
            None => panic!("no safepoint at pc offset {pc_offset}"),
        }
    }
}

fn find_exact(length: usize, pc: u32, pc_at: impl Fn(usize) -> u32) -> Option<usize> {
    let (mut lo, mut hi) = (0, length);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match pc_at(mid).cmp(&pc) {
            std::cmp::Ordering::Equal => return Some(mid),
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Greater => hi = mid,
        }
    }
    None
}

/// One maglev safepoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaglevSafepointEntry {
    /// Pc offset from the instruction start
    pub pc: u32,
    /// Deoptimization entry index or [`NO_DEOPT_INDEX`]
    pub deopt_index: i32,
    /// Registers pushed at this point
    pub num_pushed_registers: u8,
    /// Bitmap of pushed registers holding tagged values
    pub tagged_register_indexes: u32,
    /// Tagged stack slots of the frame
    pub num_tagged_slots: u32,
    /// Untagged stack slots of the frame
    pub num_untagged_slots: u32,
}

impl MaglevSafepointEntry {
    /// True if this safepoint is also a deoptimization point
    pub fn has_deoptimization_index(&self) -> bool {
        self.deopt_index != NO_DEOPT_INDEX
    }
}

/// Encodes a maglev safepoint table
#[derive(Debug, Clone, Default)]
pub struct MaglevSafepointTableBuilder {
    num_tagged_slots: u32,
    num_untagged_slots: u32,
    entries: Vec<(u32, i32, u8, u32)>,
}

impl MaglevSafepointTableBuilder {
    /// Builder for a frame with the given slot split
    pub fn new(num_tagged_slots: u32, num_untagged_slots: u32) -> Self {
        Self {
            num_tagged_slots,
            num_untagged_slots,
            entries: Vec::new(),
        }
    }

    /// Record a safepoint
    pub fn define_safepoint(
        &mut self,
        pc: u32,
        deopt_index: i32,
        num_pushed_registers: u8,
        tagged_register_indexes: u32,
    ) -> &mut Self {
        self.entries
            .push((pc, deopt_index, num_pushed_registers, tagged_register_indexes));
        self
    }

    /// Encode, sorted by pc
    pub fn finish(mut self) -> Vec<u8> {
        self.entries.sort_by_key(|entry| entry.0);
        self.entries.dedup_by_key(|entry| entry.0);
        let mut out = Vec::new();
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.num_tagged_slots.to_le_bytes());
        out.extend_from_slice(&self.num_untagged_slots.to_le_bytes());
        for (pc, deopt_index, pushed, tagged) in &self.entries {
            out.extend_from_slice(&pc.to_le_bytes());
            out.extend_from_slice(&deopt_index.to_le_bytes());
            out.push(*pushed);
            out.extend_from_slice(&tagged.to_le_bytes());
        }
        out
    }
}

/// Read-only view of an encoded maglev safepoint table
#[derive(Debug, Clone, Copy)]
pub struct MaglevSafepointTable<'a> {
    bytes: &'a [u8],
    length: usize,
    num_tagged_slots: u32,
    num_untagged_slots: u32,
}

impl<'a> MaglevSafepointTable<'a> {
    const HEADER_SIZE: usize = 12;
    const ENTRY_SIZE: usize = 13;

    /// Wrap encoded bytes
    pub fn new(bytes: &'a [u8]) -> Self {
        assert!(bytes.len() >= Self::HEADER_SIZE, "maglev safepoint table missing");
        let length = read_u32(bytes, 0) as usize;
        assert_eq!(
            bytes.len(),
            Self::HEADER_SIZE + length * Self::ENTRY_SIZE,
            "corrupt maglev safepoint table"
        );
        Self {
            bytes,
            length,
            num_tagged_slots: read_u32(bytes, 4),
            num_untagged_slots: read_u32(bytes, 8),
        }
    }

    /// Number of safepoints
    pub fn len(&self) -> usize {
        self.length
    }

    /// True if there are no safepoints
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    fn entry_start(index: usize) -> usize {
        Self::HEADER_SIZE + index * Self::ENTRY_SIZE
    }

    /// Entry `index`
    pub fn entry(&self, index: usize) -> MaglevSafepointEntry {
        assert!(index < self.length);
        let at = Self::entry_start(index);
        MaglevSafepointEntry {
            pc: read_u32(self.bytes, at),
            deopt_index: read_u32(self.bytes, at + 4) as i32,
            num_pushed_registers: self.bytes[at + 8],
            tagged_register_indexes: read_u32(self.bytes, at + 9),
            num_tagged_slots: self.num_tagged_slots,
            num_untagged_slots: self.num_untagged_slots,
        }
    }

    /// Entry at exactly `pc_offset`; there must be one.
    pub fn find_entry(&self, pc_offset: u32) -> MaglevSafepointEntry {
        match find_exact(self.length, pc_offset, |i| read_u32(self.bytes, Self::entry_start(i))) {
            Some(index) => self.entry(index),
            None => panic!("no maglev safepoint at pc offset {pc_offset}"),
        }
    }
}
