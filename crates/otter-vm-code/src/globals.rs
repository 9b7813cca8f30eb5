//! Machine-level constants shared by every code layout

/// Raw machine address
pub type Address = usize;

/// The address nothing lives at
pub const NULL_ADDRESS: Address = 0;

/// Size of a machine pointer
pub const SYSTEM_POINTER_SIZE: usize = 8;

/// Alignment of instruction bodies and whole code objects
pub const CODE_ALIGNMENT: usize = 32;

/// Alignment of the metadata section that follows the instructions
pub const METADATA_ALIGNMENT: usize = 4;

/// Size of the InstructionStream header; a multiple of [`CODE_ALIGNMENT`] so
/// the body that follows starts aligned.
pub const INSTRUCTION_STREAM_HEADER_SIZE: usize = 64;

/// Round `value` up to a power-of-two `alignment`.
#[inline]
pub const fn round_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}
