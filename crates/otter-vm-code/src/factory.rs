//! Turning assembler output into installed code

use otter_vm_bytecode::BytecodeArray;
use otter_vm_gc::Handle;

use crate::code::Code;
use crate::deoptimization::{BytecodeOffset, DeoptimizationData};
use crate::desc::CodeDesc;
use crate::error::{CodeError, Result};
use crate::flags::{CodeFlags, InstructionStreamFlags};
use crate::instruction_stream::{CodeMetadata, InstructionStream};
use crate::isolate::Isolate;
use crate::kind::{Builtin, CodeKind};

/// Everything needed to install one piece of code.
///
/// Building a `CodeBuilder` never touches the heap, so compilers may do it on
/// any thread and hand the result to an
/// [`InstallQueue`](crate::InstallQueue).
#[derive(Debug)]
pub struct CodeBuilder {
    kind: CodeKind,
    desc: CodeDesc,
    builtin: Option<Builtin>,
    is_turbofanned: bool,
    stack_slots: u32,
    can_have_weak_objects: bool,
    inlined_bytecode_size: u32,
    osr_offset: BytecodeOffset,
    metadata: CodeMetadata,
    source_position_table: Vec<u8>,
}

impl CodeBuilder {
    /// Start a job for `desc`
    pub fn new(kind: CodeKind, desc: CodeDesc) -> Self {
        Self {
            kind,
            desc,
            builtin: None,
            is_turbofanned: false,
            stack_slots: 0,
            can_have_weak_objects: false,
            inlined_bytecode_size: 0,
            osr_offset: BytecodeOffset::NONE,
            metadata: CodeMetadata::None,
            source_position_table: Vec::new(),
        }
    }

    /// Kind of the code being built
    #[inline]
    pub fn kind(&self) -> CodeKind {
        self.kind
    }

    /// The descriptor being installed
    #[inline]
    pub fn desc(&self) -> &CodeDesc {
        &self.desc
    }

    /// Install as an on-heap copy of `builtin`
    pub fn builtin(mut self, builtin: Builtin) -> Self {
        self.builtin = Some(builtin);
        self
    }

    /// Produced by the top-tier optimizer
    pub fn turbofanned(mut self, value: bool) -> Self {
        self.is_turbofanned = value;
        self
    }

    /// Spill slots of each frame
    pub fn stack_slots(mut self, slots: u32) -> Self {
        self.stack_slots = slots;
        self
    }

    /// Embed maps, property cells and receivers weakly
    pub fn can_have_weak_objects(mut self, value: bool) -> Self {
        self.can_have_weak_objects = value;
        self
    }

    /// Bytecode size of everything inlined into this code
    pub fn inlined_bytecode_size(mut self, size: u32) -> Self {
        self.inlined_bytecode_size = size;
        self
    }

    /// Loop entry this code was compiled for
    pub fn osr_offset(mut self, offset: BytecodeOffset) -> Self {
        self.osr_offset = offset;
        self
    }

    /// Deoptimization data of optimized code
    pub fn deoptimization_data(mut self, data: DeoptimizationData) -> Self {
        self.metadata = CodeMetadata::Deoptimization(data);
        self
    }

    /// Baseline pc mapping and the bytecode it was compiled from
    pub fn baseline(mut self, bytecode_offset_table: Vec<u8>, bytecode: Handle<BytecodeArray>) -> Self {
        self.metadata = CodeMetadata::Baseline {
            bytecode_offset_table,
            bytecode,
        };
        self
    }

    /// Source position table
    pub fn source_position_table(mut self, table: Vec<u8>) -> Self {
        self.source_position_table = table;
        self
    }

    fn check_metadata(&self, isolate: &Isolate) -> Result<()> {
        match &self.metadata {
            CodeMetadata::None => Ok(()),
            CodeMetadata::Deoptimization(_) if self.kind.can_deoptimize() => Ok(()),
            CodeMetadata::Deoptimization(_) => Err(CodeError::MalformedDesc(format!(
                "{} code cannot carry deoptimization data",
                self.kind
            ))),
            CodeMetadata::Baseline { bytecode, .. } => {
                if self.kind != CodeKind::Baseline {
                    return Err(CodeError::MalformedDesc(format!(
                        "{} code cannot carry a bytecode offset table",
                        self.kind
                    )));
                }
                if !isolate.heap().bytecodes.contains(*bytecode) {
                    return Err(CodeError::StaleHandle("bytecode"));
                }
                Ok(())
            }
        }
    }

    /// Install into `isolate`: copy instructions and metadata, relocate,
    /// create the owning Code and publish its entry point last.
    pub fn build(self, isolate: &mut Isolate) -> Result<Handle<Code>> {
        self.desc.verify()?;
        let size = InstructionStream::size_for(self.desc.body_size());
        let max = isolate.config().max_code_object_size;
        if size > max {
            return Err(CodeError::TooLarge { size, max });
        }
        self.check_metadata(isolate)?;
        if self.can_have_weak_objects && !self.kind.is_optimized_js_function() {
            return Err(CodeError::MalformedDesc(format!(
                "{} code cannot embed objects weakly",
                self.kind
            )));
        }

        let flags = InstructionStreamFlags::new(self.kind, self.is_turbofanned, self.stack_slots)?;
        let mut stream = InstructionStream::from_desc(&self.desc, flags, self.builtin)?;
        stream.set_inlined_bytecode_size(self.inlined_bytecode_size);
        stream.set_osr_offset(self.osr_offset);
        stream.set_metadata(self.metadata);
        stream.set_source_position_table(self.source_position_table);
        let start = stream.instruction_start();
        let end = stream.instruction_end();

        let code = Code::new(CodeFlags::new(self.kind, self.is_turbofanned, false), self.builtin);
        if self.can_have_weak_objects {
            code.set_can_have_weak_objects(true);
        }
        if self.kind == CodeKind::Builtin && self.builtin.is_some_and(Builtin::is_promise_rejection) {
            code.set_is_promise_rejection(true);
        }

        let heap = isolate.heap_mut();
        let stream_handle = heap.streams.insert(stream);
        let code_handle = heap.codes.insert(code);
        if let Some(stream) = heap.streams.get_mut(stream_handle) {
            stream.set_code(code_handle);
        }
        heap.code_ranges.register(start, end, stream_handle);
        // callers may enter the code as soon as the entry point is visible
        if let Some(code) = heap.codes.get_mut(code_handle) {
            code.set_instruction_stream_and_entry_point(stream_handle, start);
        }
        isolate.note_allocation();
        isolate.note_allocation();

        tracing::debug!(
            target: "otter::code",
            code = ?code_handle,
            kind = %self.kind,
            builtin = ?self.builtin,
            entry = format_args!("{start:#x}"),
            size,
            "installed code"
        );
        Ok(code_handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IsolateConfig;
    use crate::desc::CodeDescBuilder;
    use crate::embedded::EmbeddedData;
    use std::sync::Arc;

    fn isolate(config: IsolateConfig) -> Isolate {
        Isolate::new(config, Arc::new(EmbeddedData::new(Vec::new()).unwrap())).unwrap()
    }

    fn desc(bytes: &[u8]) -> CodeDesc {
        let mut builder = CodeDescBuilder::new();
        builder.emit(bytes);
        builder.finish()
    }

    #[test]
    fn test_install_links_code_and_stream() {
        let mut isolate = isolate(IsolateConfig::default());
        let handle = CodeBuilder::new(CodeKind::Turbofan, desc(&[0x90; 12]))
            .turbofanned(true)
            .stack_slots(4)
            .build(&mut isolate)
            .unwrap();

        let code = isolate.heap().codes.get(handle).unwrap();
        let stream_handle = code.instruction_stream().unwrap();
        let stream = isolate.heap().streams.get(stream_handle).unwrap();
        assert_eq!(stream.code(), Some(handle));
        assert_eq!(code.entry_point(), stream.instruction_start());
        assert_eq!(stream.stack_slots(), 4);
        assert_eq!(isolate.heap().code_ranges.find(stream.instruction_start() + 11), Some(stream_handle));
    }

    #[test]
    fn test_rejects_oversized_code() {
        let config = IsolateConfig {
            max_code_object_size: 64,
            ..IsolateConfig::default()
        };
        let mut isolate = isolate(config);
        let result = CodeBuilder::new(CodeKind::ForTesting, desc(&[0; 40])).build(&mut isolate);
        assert_eq!(result, Err(CodeError::TooLarge { size: 128, max: 64 }));
        assert!(isolate.heap().codes.is_empty());
    }

    #[test]
    fn test_rejects_mismatched_metadata() {
        let mut isolate = isolate(IsolateConfig::default());
        let result = CodeBuilder::new(CodeKind::Baseline, desc(&[0xC3]))
            .deoptimization_data(DeoptimizationData::empty())
            .build(&mut isolate);
        assert!(matches!(result, Err(CodeError::MalformedDesc(_))));

        let result = CodeBuilder::new(CodeKind::Baseline, desc(&[0xC3]))
            .can_have_weak_objects(true)
            .build(&mut isolate);
        assert!(matches!(result, Err(CodeError::MalformedDesc(_))));
    }
}
