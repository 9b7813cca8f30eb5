//! Result of resolving a pc to code
//!
//! The stack walker and the collector both need to ask questions about
//! whatever code a pc belongs to without checking what kind of object they
//! found. Asking anything of [`CodeLookupResult::NotFound`] is a bug.

use otter_vm_gc::Handle;

use crate::code::{Code, CodeView};
use crate::code_reference::CodeReference;
use crate::globals::Address;
use crate::handler_table::CatchPrediction;
use crate::instruction_stream::InstructionStream;
use crate::kind::{Builtin, CodeKind};
use crate::safepoint::{MaglevSafepointEntry, MaglevSafepointTable, SafepointEntry, SafepointTable};

/// What a pc lookup found
#[derive(Debug, Clone, Copy, Default)]
pub enum CodeLookupResult<'a> {
    /// Nothing contains the pc
    #[default]
    NotFound,
    /// An on-heap instruction stream
    InstructionStream(&'a InstructionStream),
    /// A builtin running from an embedded blob
    Code(CodeView<'a>),
}

impl<'a> CodeLookupResult<'a> {
    /// True unless nothing was found
    #[inline]
    pub fn is_found(&self) -> bool {
        !matches!(self, CodeLookupResult::NotFound)
    }

    /// The stream, if a stream was found
    pub fn instruction_stream(&self) -> Option<&'a InstructionStream> {
        match *self {
            CodeLookupResult::InstructionStream(stream) => Some(stream),
            _ => None,
        }
    }

    /// The code, if a builtin was found
    pub fn code(&self) -> Option<CodeView<'a>> {
        match *self {
            CodeLookupResult::Code(view) => Some(view),
            _ => None,
        }
    }

    /// Handle of the Code that owns what was found
    pub fn code_handle(&self) -> Option<Handle<Code>> {
        match *self {
            CodeLookupResult::NotFound => None,
            CodeLookupResult::InstructionStream(stream) => stream.code(),
            CodeLookupResult::Code(view) => Some(view.handle()),
        }
    }

    fn not_found() -> ! {
        panic!("query on an empty code lookup result")
    }

    /// Code kind
    pub fn kind(&self) -> CodeKind {
        match *self {
            CodeLookupResult::NotFound => Self::not_found(),
            CodeLookupResult::InstructionStream(stream) => stream.flags().kind(),
            CodeLookupResult::Code(view) => view.kind(),
        }
    }

    /// Builtin id
    pub fn builtin(&self) -> Option<Builtin> {
        match *self {
            CodeLookupResult::NotFound => Self::not_found(),
            CodeLookupResult::InstructionStream(stream) => stream.builtin(),
            CodeLookupResult::Code(view) => view.builtin(),
        }
    }

    /// True if `pc` is one of the found code's instructions
    pub fn contains(&self, pc: Address) -> bool {
        match *self {
            CodeLookupResult::NotFound => Self::not_found(),
            CodeLookupResult::InstructionStream(stream) => stream.contains(pc),
            CodeLookupResult::Code(view) => view.contains(pc),
        }
    }

    /// Offset of `pc` from the instruction start of the found code
    pub fn get_offset_from_instruction_start(&self, pc: Address) -> usize {
        match *self {
            CodeLookupResult::NotFound => Self::not_found(),
            CodeLookupResult::InstructionStream(stream) => {
                assert!(
                    stream.instruction_start() <= pc && pc <= stream.instruction_end(),
                    "pc {pc:#x} is not in this code"
                );
                pc - stream.instruction_start()
            }
            CodeLookupResult::Code(view) => view.get_offset_from_instruction_start(pc),
        }
    }

    /// Safepoint entry for `pc`
    pub fn safepoint_entry(&self, pc: Address) -> SafepointEntry {
        match *self {
            CodeLookupResult::NotFound => Self::not_found(),
            CodeLookupResult::InstructionStream(stream) => {
                let flags = stream.flags();
                assert!(
                    flags.is_turbofanned() || flags.kind().is_wasm(),
                    "{} code has no safepoint table",
                    flags.kind()
                );
                let offset = self.get_offset_from_instruction_start(pc);
                SafepointTable::new(stream.region().safepoint_table()).find_entry(offset as u32)
            }
            CodeLookupResult::Code(view) => view.safepoint_entry(pc),
        }
    }

    /// Maglev safepoint entry for `pc`
    pub fn maglev_safepoint_entry(&self, pc: Address) -> MaglevSafepointEntry {
        match *self {
            CodeLookupResult::NotFound => Self::not_found(),
            CodeLookupResult::InstructionStream(stream) => {
                assert_eq!(stream.flags().kind(), CodeKind::Maglev, "not maglev code");
                let offset = self.get_offset_from_instruction_start(pc);
                MaglevSafepointTable::new(stream.region().safepoint_table()).find_entry(offset as u32)
            }
            CodeLookupResult::Code(view) => view.maglev_safepoint_entry(pc),
        }
    }

    /// Catch prediction of a builtin frame
    pub fn get_builtin_catch_prediction(&self) -> CatchPrediction {
        match *self {
            CodeLookupResult::NotFound => Self::not_found(),
            // the stream's owner may be mid-collection, go by the builtin id
            CodeLookupResult::InstructionStream(stream) => {
                if stream.builtin().is_some_and(Builtin::is_promise_rejection) {
                    CatchPrediction::Promise
                } else {
                    CatchPrediction::Uncaught
                }
            }
            CodeLookupResult::Code(view) => view.get_builtin_catch_prediction(),
        }
    }

    /// View for tooling
    pub fn to_code_reference(&self) -> CodeReference<'a> {
        match *self {
            CodeLookupResult::NotFound => Self::not_found(),
            CodeLookupResult::InstructionStream(stream) => CodeReference::InstructionStream(stream),
            CodeLookupResult::Code(view) => CodeReference::Code(view),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "empty code lookup result")]
    fn test_not_found_is_a_bug() {
        CodeLookupResult::NotFound.kind();
    }

    #[test]
    fn test_not_found_has_no_payload() {
        let result = CodeLookupResult::default();
        assert!(!result.is_found());
        assert!(result.instruction_stream().is_none());
        assert!(result.code().is_none());
        assert!(result.code_handle().is_none());
    }
}
