//! Relocation information
//!
//! Every record is five bytes, `[pc_offset u32 LE][mode u8]`. Records are
//! stored in descending pc order, so a reader that starts at the end of the
//! buffer and walks backward sees them in ascending pc order.
//!
//! Payloads live in the instruction bytes at `pc_offset`:
//!
//! | mode                 | payload                                         |
//! |----------------------|-------------------------------------------------|
//! | `CodeTarget`         | i64 displacement from the end of the slot       |
//! | `FullEmbeddedObject` | u64 handle bits                                 |
//! | `InternalReference`  | u64 absolute address into the same instructions |
//! | `ExternalReference`  | u64 absolute address, never patched             |
//! | `DeoptReason`        | none                                            |

use crate::error::{CodeError, Result};
use crate::globals::Address;

/// Size of one encoded record
pub const RELOC_RECORD_SIZE: usize = 5;

/// Value stored in an embedded object slot after the GC cleared it
pub const CLEARED_EMBEDDED_OBJECT: u64 = u64::MAX;

/// Kind of a relocation record
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocMode {
    /// Call or jump to other code, pc-relative
    CodeTarget = 0,
    /// Heap object embedded by handle
    FullEmbeddedObject = 1,
    /// Absolute address inside this code's instructions
    InternalReference = 2,
    /// Absolute address outside the heap
    ExternalReference = 3,
    /// Marks a deoptimization exit
    DeoptReason = 4,
}

impl RelocMode {
    /// Decode a mode byte
    pub const fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => RelocMode::CodeTarget,
            1 => RelocMode::FullEmbeddedObject,
            2 => RelocMode::InternalReference,
            3 => RelocMode::ExternalReference,
            4 => RelocMode::DeoptReason,
            _ => return None,
        })
    }

    /// Bit of this mode in a mode mask
    #[inline]
    pub const fn mask(self) -> u32 {
        1 << self as u32
    }

    /// Bytes of instruction stream the record patches
    #[inline]
    pub const fn payload_size(self) -> usize {
        match self {
            RelocMode::DeoptReason => 0,
            _ => 8,
        }
    }
}

/// Mask accepting every mode
pub const ALL_RELOC_MODES: u32 = (1 << 5) - 1;

/// Records whose payload changes when the instructions move
pub const APPLY_MASK: u32 = RelocMode::CodeTarget.mask() | RelocMode::InternalReference.mask();

/// One decoded relocation record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocInfo {
    /// Offset of the payload from the instruction start
    pub pc_offset: u32,
    /// Record kind
    pub mode: RelocMode,
}

/// Accumulates records while assembling and encodes them in stored order.
#[derive(Debug, Default, Clone)]
pub struct RelocInfoWriter {
    records: Vec<RelocInfo>,
}

impl RelocInfoWriter {
    /// Create an empty writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an entry
    pub fn write(&mut self, pc_offset: u32, mode: RelocMode) {
        self.records.push(RelocInfo { pc_offset, mode });
    }

    /// Number of records so far
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Encoded size in bytes
    pub fn size(&self) -> usize {
        self.records.len() * RELOC_RECORD_SIZE
    }

    /// Encode, highest pc first.
    pub fn finish(mut self) -> Vec<u8> {
        self.records.sort_by(|a, b| b.pc_offset.cmp(&a.pc_offset));
        let mut out = Vec::with_capacity(self.size());
        for record in &self.records {
            out.extend_from_slice(&record.pc_offset.to_le_bytes());
            out.push(record.mode as u8);
        }
        out
    }
}

/// Check that `bytes` is a well-formed relocation buffer for an instruction
/// area of `instruction_size` bytes.
pub fn verify_reloc_info(bytes: &[u8], instruction_size: usize) -> Result<usize> {
    if bytes.len() % RELOC_RECORD_SIZE != 0 {
        return Err(CodeError::MalformedDesc(format!(
            "relocation size {} is not a multiple of {RELOC_RECORD_SIZE}",
            bytes.len()
        )));
    }
    let mut previous: Option<u32> = None;
    for record in bytes.chunks_exact(RELOC_RECORD_SIZE) {
        let pc_offset = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
        let mode = RelocMode::from_u8(record[4]).ok_or_else(|| {
            CodeError::MalformedDesc(format!("unknown relocation mode {}", record[4]))
        })?;
        if pc_offset as usize + mode.payload_size() > instruction_size {
            return Err(CodeError::MalformedDesc(format!(
                "relocation at {pc_offset} overruns {instruction_size} bytes of instructions"
            )));
        }
        if previous.is_some_and(|prev| prev < pc_offset) {
            return Err(CodeError::MalformedDesc(
                "relocation records out of order".to_string(),
            ));
        }
        previous = Some(pc_offset);
    }
    Ok(bytes.len() / RELOC_RECORD_SIZE)
}

/// Walks a verified relocation buffer from its end, yielding records in
/// ascending pc order.
#[derive(Debug, Clone)]
pub struct RelocIterator<'a> {
    bytes: &'a [u8],
    pos: usize,
    mode_mask: u32,
}

impl<'a> RelocIterator<'a> {
    /// Iterate over every record
    pub fn new(bytes: &'a [u8]) -> Self {
        Self::with_mask(bytes, ALL_RELOC_MODES)
    }

    /// Iterate over records whose mode bit is set in `mode_mask`
    pub fn with_mask(bytes: &'a [u8], mode_mask: u32) -> Self {
        assert_eq!(bytes.len() % RELOC_RECORD_SIZE, 0, "unverified relocation info");
        Self {
            bytes,
            pos: bytes.len(),
            mode_mask,
        }
    }
}

impl Iterator for RelocIterator<'_> {
    type Item = RelocInfo;

    fn next(&mut self) -> Option<RelocInfo> {
        while self.pos > 0 {
            self.pos -= RELOC_RECORD_SIZE;
            let record = &self.bytes[self.pos..self.pos + RELOC_RECORD_SIZE];
            let pc_offset = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
            let mode = match RelocMode::from_u8(record[4]) {
                Some(mode) => mode,
                None => panic!("unverified relocation mode {}", record[4]),
            };
            if mode.mask() & self.mode_mask != 0 {
                return Some(RelocInfo { pc_offset, mode });
            }
        }
        None
    }
}

#[inline]
pub(crate) fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

#[inline]
pub(crate) fn write_u64(bytes: &mut [u8], at: usize, value: u64) {
    bytes[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

/// Target of the code-target slot at `pc_offset`, for instructions that
/// start at `instruction_start`.
pub fn code_target_address(instructions: &[u8], instruction_start: Address, pc_offset: u32) -> Address {
    let displacement = read_u64(instructions, pc_offset as usize);
    slot_end(instruction_start, pc_offset).wrapping_add(displacement as usize)
}

/// Point the code-target slot at `pc_offset` to `target`.
pub fn set_code_target_address(
    instructions: &mut [u8],
    instruction_start: Address,
    pc_offset: u32,
    target: Address,
) {
    let displacement = target.wrapping_sub(slot_end(instruction_start, pc_offset));
    write_u64(instructions, pc_offset as usize, displacement as u64);
}

#[inline]
fn slot_end(instruction_start: Address, pc_offset: u32) -> Address {
    instruction_start.wrapping_add(pc_offset as usize + 8)
}

/// Patch every position-dependent payload after the instructions moved by
/// `delta` bytes. Code targets keep pointing at the same absolute address.
pub fn relocate_instructions(instructions: &mut [u8], reloc_info: &[u8], delta: isize) -> usize {
    let mut patched = 0;
    for info in RelocIterator::with_mask(reloc_info, APPLY_MASK) {
        let at = info.pc_offset as usize;
        let value = read_u64(instructions, at);
        let value = match info.mode {
            RelocMode::InternalReference => value.wrapping_add(delta as u64),
            RelocMode::CodeTarget => value.wrapping_sub(delta as u64),
            _ => unreachable!("masked out"),
        };
        write_u64(instructions, at, value);
        patched += 1;
    }
    patched
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backward_iteration_is_ascending() {
        let mut writer = RelocInfoWriter::new();
        writer.write(16, RelocMode::InternalReference);
        writer.write(0, RelocMode::CodeTarget);
        writer.write(8, RelocMode::FullEmbeddedObject);
        let bytes = writer.finish();
        assert_eq!(bytes.len(), 15);
        // highest pc is stored first
        assert_eq!(&bytes[0..5], &[16, 0, 0, 0, 2]);

        let pcs: Vec<u32> = RelocIterator::new(&bytes).map(|info| info.pc_offset).collect();
        assert_eq!(pcs, vec![0, 8, 16]);

        let masked: Vec<RelocMode> = RelocIterator::with_mask(&bytes, APPLY_MASK)
            .map(|info| info.mode)
            .collect();
        assert_eq!(masked, vec![RelocMode::CodeTarget, RelocMode::InternalReference]);
        assert_eq!(verify_reloc_info(&bytes, 24), Ok(3));
    }

    #[test]
    fn test_verify_rejects_bad_input() {
        assert!(verify_reloc_info(&[0; 4], 16).is_err());
        assert!(verify_reloc_info(&[0, 0, 0, 0, 9], 16).is_err());
        // payload would run past the instructions
        assert!(verify_reloc_info(&[12, 0, 0, 0, 1], 16).is_err());
        // ascending stored order is wrong
        let mut bad = vec![0, 0, 0, 0, 1];
        bad.extend_from_slice(&[8, 0, 0, 0, 1]);
        assert!(verify_reloc_info(&bad, 16).is_err());
    }

    #[test]
    fn test_relocate_patches_only_position_dependent_slots() {
        let mut instructions = vec![0u8; 32];
        let start: Address = 0x1000;
        set_code_target_address(&mut instructions, start, 0, 0x9000);
        write_u64(&mut instructions, 8, 0x1000 + 24);
        write_u64(&mut instructions, 16, 0xDEAD_BEEF);

        let mut writer = RelocInfoWriter::new();
        writer.write(0, RelocMode::CodeTarget);
        writer.write(8, RelocMode::InternalReference);
        writer.write(16, RelocMode::ExternalReference);
        let reloc = writer.finish();

        let new_start: Address = 0x5000;
        let patched = relocate_instructions(&mut instructions, &reloc, 0x4000);
        assert_eq!(patched, 2);
        assert_eq!(code_target_address(&instructions, new_start, 0), 0x9000);
        assert_eq!(read_u64(&instructions, 8), 0x5000 + 24);
        assert_eq!(read_u64(&instructions, 16), 0xDEAD_BEEF);
    }
}
