//! Embedded builtins blob
//!
//! Builtins are compiled ahead of time into one read-only blob shared by
//! every isolate in the process. The blob has two sections: instructions,
//! each builtin aligned to [`CODE_ALIGNMENT`], and metadata, each builtin's
//! tables aligned to [`METADATA_ALIGNMENT`]. Builtin bodies must be position
//! independent, so the blob can be copied to another address unchanged.

use std::hash::Hasher;
use std::sync::Arc;

use rustc_hash::FxHasher;

use crate::buffer::{CodeBuffer, flush_instruction_cache};
use crate::desc::CodeDesc;
use crate::error::{CodeError, Result};
use crate::globals::{Address, CODE_ALIGNMENT, METADATA_ALIGNMENT, round_up};
use crate::kind::{BUILTIN_COUNT, Builtin};
use crate::layout::{CodeRegion, MetadataLayout};

/// Where one builtin lives inside the blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BuiltinLayout {
    instruction_offset: usize,
    instruction_size: usize,
    metadata_offset: usize,
    metadata: MetadataLayout,
}

/// Read-only instructions and metadata of the builtins
#[derive(Debug)]
pub struct EmbeddedData {
    code: CodeBuffer,
    metadata: CodeBuffer,
    layouts: Vec<Option<BuiltinLayout>>,
    /// Builtins sorted by instruction offset
    by_offset: Vec<(usize, Builtin)>,
}

impl EmbeddedData {
    /// Lay out `builtins` into a fresh blob.
    ///
    /// Builtins are placed in id order regardless of input order, so the same
    /// set always yields the same bytes.
    pub fn new(mut builtins: Vec<(Builtin, CodeDesc)>) -> Result<Self> {
        builtins.sort_by_key(|(builtin, _)| *builtin);
        for pair in builtins.windows(2) {
            if pair[0].0 == pair[1].0 {
                return Err(CodeError::DuplicateBuiltin(pair[0].0));
            }
        }

        let mut layouts = vec![None; BUILTIN_COUNT];
        let mut code_size = 0;
        let mut metadata_size = 0;
        for (builtin, desc) in &builtins {
            desc.verify()?;
            if desc.reloc_size != 0 {
                return Err(CodeError::NotIsolateIndependent(*builtin));
            }
            let instruction_offset = round_up(code_size, CODE_ALIGNMENT);
            let metadata_offset = round_up(metadata_size, METADATA_ALIGNMENT);
            code_size = instruction_offset + desc.instr_size;
            metadata_size = metadata_offset + desc.metadata_size();
            layouts[builtin.id() as usize] = Some(BuiltinLayout {
                instruction_offset,
                instruction_size: desc.instr_size,
                metadata_offset,
                metadata: desc.metadata_layout(),
            });
        }

        let mut code = CodeBuffer::new(code_size)?;
        let mut metadata = CodeBuffer::new(metadata_size)?;
        let mut by_offset = Vec::with_capacity(builtins.len());
        for (builtin, desc) in &builtins {
            let Some(layout) = layouts[builtin.id() as usize] else {
                unreachable!("layout computed above");
            };
            code.as_mut_slice()[layout.instruction_offset..][..layout.instruction_size]
                .copy_from_slice(desc.instructions());
            let in_buffer = desc.metadata();
            let dst = &mut metadata.as_mut_slice()[layout.metadata_offset..][..layout.metadata.metadata_size];
            dst[..in_buffer.len()].copy_from_slice(in_buffer);
            dst[in_buffer.len()..].copy_from_slice(&desc.unwinding_info);
            by_offset.push((layout.instruction_offset, *builtin));
        }
        flush_instruction_cache(code.address(), code.len());

        let data = Self {
            code,
            metadata,
            layouts,
            by_offset,
        };
        tracing::debug!(
            target: "otter::code",
            builtins = data.by_offset.len(),
            code_size,
            metadata_size,
            checksum = format_args!("{:#018x}", data.checksum()),
            "created embedded blob"
        );
        Ok(data)
    }

    /// Copy of this blob at fresh addresses
    pub fn re_embed(&self) -> Result<Self> {
        let code = CodeBuffer::from_slice(self.code.as_slice())?;
        let metadata = CodeBuffer::from_slice(self.metadata.as_slice())?;
        flush_instruction_cache(code.address(), code.len());
        tracing::debug!(
            target: "otter::code",
            from = format_args!("{:#x}", self.code.address()),
            to = format_args!("{:#x}", code.address()),
            "re-embedded builtins"
        );
        Ok(Self {
            code,
            metadata,
            layouts: self.layouts.clone(),
            by_offset: self.by_offset.clone(),
        })
    }

    /// Start of the instruction section
    #[inline]
    pub fn code_start(&self) -> Address {
        self.code.address()
    }

    /// Size of the instruction section
    #[inline]
    pub fn code_size(&self) -> usize {
        self.code.len()
    }

    /// True if `pc` lies in the instruction section
    #[inline]
    pub fn is_in_code_range(&self, pc: Address) -> bool {
        self.code_start() <= pc && pc < self.code_start() + self.code_size()
    }

    /// True if the blob holds `builtin`
    pub fn contains_builtin(&self, builtin: Builtin) -> bool {
        self.layouts[builtin.id() as usize].is_some()
    }

    /// Builtins in the blob, in id order
    pub fn builtins(&self) -> impl Iterator<Item = Builtin> + '_ {
        self.by_offset.iter().map(|&(_, builtin)| builtin)
    }

    fn layout(&self, builtin: Builtin) -> &BuiltinLayout {
        match &self.layouts[builtin.id() as usize] {
            Some(layout) => layout,
            None => panic!("builtin {builtin} is not embedded"),
        }
    }

    /// First instruction of `builtin`
    pub fn instruction_start_of(&self, builtin: Builtin) -> Address {
        self.code_start() + self.layout(builtin).instruction_offset
    }

    /// Instruction size of `builtin`
    pub fn instruction_size_of(&self, builtin: Builtin) -> usize {
        self.layout(builtin).instruction_size
    }

    /// Instructions and metadata of `builtin`
    pub fn region(&self, builtin: Builtin) -> CodeRegion<'_> {
        let layout = self.layout(builtin);
        CodeRegion::split(
            &self.code.as_slice()[layout.instruction_offset..][..layout.instruction_size],
            &self.metadata.as_slice()[layout.metadata_offset..][..layout.metadata.metadata_size],
            layout.metadata,
        )
    }

    /// Builtin whose instructions contain `pc`
    pub fn try_lookup_builtin(&self, pc: Address) -> Option<Builtin> {
        if !self.is_in_code_range(pc) {
            return None;
        }
        let offset = pc - self.code_start();
        let index = self
            .by_offset
            .partition_point(|&(start, _)| start <= offset)
            .checked_sub(1)?;
        let (start, builtin) = self.by_offset[index];
        (offset < start + self.layout(builtin).instruction_size).then_some(builtin)
    }

    /// Content hash of both sections and the layout table
    pub fn checksum(&self) -> u64 {
        let mut hasher = FxHasher::default();
        hasher.write(self.code.as_slice());
        hasher.write(self.metadata.as_slice());
        for &(offset, builtin) in &self.by_offset {
            let layout = self.layout(builtin);
            hasher.write_u16(builtin.id());
            hasher.write_usize(offset);
            hasher.write_usize(layout.instruction_size);
            hasher.write_usize(layout.metadata_offset);
            hasher.write_usize(layout.metadata.metadata_size);
        }
        hasher.finish()
    }
}

/// The blobs an isolate executes builtins from.
///
/// With short builtin calls the isolate also keeps a re-embedded copy close
/// to its own code, and both copies may be on the stack at once.
#[derive(Debug)]
pub struct BuiltinBlobs {
    embedded: Arc<EmbeddedData>,
    re_embedded: Option<EmbeddedData>,
}

impl BuiltinBlobs {
    /// Use the process-wide blob, plus an isolate-local copy if
    /// `short_builtin_calls` is set
    pub fn new(embedded: Arc<EmbeddedData>, short_builtin_calls: bool) -> Result<Self> {
        let re_embedded = if short_builtin_calls {
            Some(embedded.re_embed()?)
        } else {
            None
        };
        Ok(Self {
            embedded,
            re_embedded,
        })
    }

    /// True if an isolate-local copy exists
    #[inline]
    pub fn is_short_builtin_calls_enabled(&self) -> bool {
        self.re_embedded.is_some()
    }

    /// Process-wide blob
    #[inline]
    pub fn process_wide(&self) -> &Arc<EmbeddedData> {
        &self.embedded
    }

    /// Blob new calls go to: the local copy if there is one
    #[inline]
    pub fn canonical(&self) -> &EmbeddedData {
        self.re_embedded.as_ref().unwrap_or(&self.embedded)
    }

    /// Blob that `pc` executes in.
    ///
    /// The canonical blob unless the pc lies only in the process-wide one.
    pub fn embedded_data_for_pc(&self, pc: Address) -> &EmbeddedData {
        let canonical = self.canonical();
        if self.is_short_builtin_calls_enabled()
            && !canonical.is_in_code_range(pc)
            && self.embedded.is_in_code_range(pc)
        {
            return &self.embedded;
        }
        canonical
    }

    /// True if `pc` lies in either blob
    pub fn is_in_code_range(&self, pc: Address) -> bool {
        self.embedded.is_in_code_range(pc)
            || self
                .re_embedded
                .as_ref()
                .is_some_and(|local| local.is_in_code_range(pc))
    }

    /// Builtin executing at `pc`, in either blob
    pub fn try_lookup_builtin(&self, pc: Address) -> Option<Builtin> {
        self.embedded_data_for_pc(pc).try_lookup_builtin(pc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::CodeDescBuilder;
    use crate::handler_table::{CatchPrediction, ReturnAddressTableBuilder};

    fn builtin_desc(body: &[u8]) -> CodeDesc {
        let mut handlers = ReturnAddressTableBuilder::new();
        handlers.add(1, 2, CatchPrediction::Caught);
        let mut builder = CodeDescBuilder::new();
        builder
            .emit(body)
            .handler_table(handlers.finish())
            .code_comments("builtin");
        builder.finish()
    }

    fn blob() -> EmbeddedData {
        EmbeddedData::new(vec![
            (Builtin::CompileLazy, builtin_desc(&[1; 40])),
            (Builtin::InterpreterEntryTrampoline, builtin_desc(&[2; 7])),
            (Builtin::CEntry, builtin_desc(&[3; 3])),
        ])
        .unwrap()
    }

    #[test]
    fn test_layout_in_id_order() {
        let blob = blob();
        let order: Vec<_> = blob.builtins().collect();
        assert_eq!(
            order,
            vec![Builtin::InterpreterEntryTrampoline, Builtin::CompileLazy, Builtin::CEntry]
        );
        for builtin in order {
            assert_eq!(blob.instruction_start_of(builtin) % CODE_ALIGNMENT, 0);
        }
        assert!(!blob.contains_builtin(Builtin::StackCheck));
    }

    #[test]
    fn test_lookup_by_pc() {
        let blob = blob();
        let start = blob.instruction_start_of(Builtin::CompileLazy);
        assert_eq!(blob.try_lookup_builtin(start), Some(Builtin::CompileLazy));
        assert_eq!(blob.try_lookup_builtin(start + 39), Some(Builtin::CompileLazy));
        // alignment gap after the builtin
        assert_eq!(blob.try_lookup_builtin(start + 40), None);
        assert_eq!(blob.try_lookup_builtin(blob.code_start().wrapping_sub(1)), None);
    }

    #[test]
    fn test_region_reads_metadata() {
        let blob = blob();
        let region = blob.region(Builtin::CEntry);
        assert_eq!(region.instructions(), &[3, 3, 3]);
        assert!(region.has_handler_table());
        assert_eq!(region.code_comments_text(), "builtin");
        assert_eq!(region.relocation_size(), 0);
    }

    #[test]
    fn test_rejects_relocations_and_duplicates() {
        let mut builder = CodeDescBuilder::new();
        builder.emit_external_reference(0x1234);
        let err = EmbeddedData::new(vec![(Builtin::StackCheck, builder.finish())]).unwrap_err();
        assert_eq!(err, CodeError::NotIsolateIndependent(Builtin::StackCheck));

        let err = EmbeddedData::new(vec![
            (Builtin::CEntry, builtin_desc(&[0])),
            (Builtin::CEntry, builtin_desc(&[1])),
        ])
        .unwrap_err();
        assert_eq!(err, CodeError::DuplicateBuiltin(Builtin::CEntry));
    }

    #[test]
    fn test_checksum_is_content_based() {
        let a = blob();
        let b = blob();
        assert_eq!(a.checksum(), b.checksum());
        assert_eq!(a.re_embed().unwrap().checksum(), a.checksum());
        let other = EmbeddedData::new(vec![(Builtin::CEntry, builtin_desc(&[9]))]).unwrap();
        assert_ne!(other.checksum(), a.checksum());
    }

    #[test]
    fn test_pc_resolution_with_two_copies() {
        let blobs = BuiltinBlobs::new(Arc::new(blob()), true).unwrap();
        let local = blobs.canonical();
        let global = blobs.process_wide();
        assert_ne!(local.code_start(), global.code_start());

        let local_pc = local.instruction_start_of(Builtin::CEntry) + 1;
        let global_pc = global.instruction_start_of(Builtin::CEntry) + 1;
        assert_eq!(blobs.embedded_data_for_pc(local_pc).code_start(), local.code_start());
        assert_eq!(blobs.embedded_data_for_pc(global_pc).code_start(), global.code_start());
        assert_eq!(blobs.try_lookup_builtin(global_pc), Some(Builtin::CEntry));
        assert_eq!(blobs.try_lookup_builtin(local_pc), Some(Builtin::CEntry));

        let single = BuiltinBlobs::new(Arc::new(blob()), false).unwrap();
        assert!(!single.is_short_builtin_calls_enabled());
        assert_eq!(single.canonical().code_start(), single.process_wide().code_start());
    }
}
