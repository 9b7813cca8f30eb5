//! InstructionStream: the on-heap body of a Code object
//!
//! ```text
//! +--------------------+ 0
//! | header             |
//! +--------------------+ INSTRUCTION_STREAM_HEADER_SIZE (instruction start)
//! | instructions       |
//! | padding            |
//! +--------------------+ metadata start (aligned to 4)
//! | metadata tables    |
//! | padding            |
//! +--------------------+ size_for(body_size)
//! ```
//!
//! The header fields are plain struct fields; only the snapshot writer lays
//! them out in bytes. Relocation info and deoptimization data live outside
//! the body, as they do not need to be executable.

use otter_vm_bytecode::BytecodeArray;
use otter_vm_gc::{Handle, Strength, Trace, Visitor};

use crate::buffer::{CodeBuffer, flush_instruction_cache};
use crate::code::Code;
use crate::deoptimization::{BytecodeOffset, DeoptimizationData};
use crate::desc::CodeDesc;
use crate::error::Result;
use crate::flags::InstructionStreamFlags;
use crate::globals::{Address, CODE_ALIGNMENT, INSTRUCTION_STREAM_HEADER_SIZE, round_up};
use crate::heap::{HeapObject, HeapRef};
use crate::kind::Builtin;
use crate::layout::{CodeRegion, MetadataLayout, metadata_offset_for};
use crate::reloc::{
    CLEARED_EMBEDDED_OBJECT, RelocIterator, RelocMode, code_target_address, read_u64,
    relocate_instructions, set_code_target_address, write_u64,
};

/// Kind-dependent side data of a stream
#[derive(Debug, Clone, Default)]
pub enum CodeMetadata {
    /// Nothing beyond the body
    #[default]
    None,
    /// Optimized code
    Deoptimization(DeoptimizationData),
    /// Baseline code: pc to bytecode mapping and the bytecode it was compiled from
    Baseline {
        /// Encoded bytecode offset table
        bytecode_offset_table: Vec<u8>,
        /// Source bytecode
        bytecode: Handle<BytecodeArray>,
    },
}

/// Installed instructions plus metadata, owned by exactly one Code
#[derive(Debug)]
pub struct InstructionStream {
    body: CodeBuffer,
    instruction_size: usize,
    layout: MetadataLayout,
    flags: InstructionStreamFlags,
    builtin: Option<Builtin>,
    inlined_bytecode_size: u32,
    osr_offset: BytecodeOffset,
    relocation_info: Box<[u8]>,
    code: Option<Handle<Code>>,
    metadata: CodeMetadata,
    source_position_table: Vec<u8>,
}

impl InstructionStream {
    /// Object size for a body of `body_size` bytes
    #[inline]
    pub const fn size_for(body_size: usize) -> usize {
        round_up(INSTRUCTION_STREAM_HEADER_SIZE + body_size, CODE_ALIGNMENT)
    }

    /// Copy `desc` into fresh code memory and fix it up for its new address.
    ///
    /// The desc must have been verified. The result has no owning Code yet.
    pub fn from_desc(
        desc: &CodeDesc,
        flags: InstructionStreamFlags,
        builtin: Option<Builtin>,
    ) -> Result<Self> {
        let layout = desc.metadata_layout();
        let body_size = desc.body_size();
        let mut body = CodeBuffer::new(round_up(body_size, CODE_ALIGNMENT))?;

        let in_buffer = desc.metadata_end();
        {
            let bytes = body.as_mut_slice();
            bytes[..in_buffer].copy_from_slice(&desc.buffer[..in_buffer]);
            bytes[in_buffer..body_size].copy_from_slice(&desc.unwinding_info);
        }

        let mut stream = Self {
            body,
            instruction_size: desc.instruction_size(),
            layout,
            flags,
            builtin,
            inlined_bytecode_size: 0,
            osr_offset: BytecodeOffset::NONE,
            relocation_info: desc.reloc_info().into(),
            code: None,
            metadata: CodeMetadata::None,
            source_position_table: Vec::new(),
        };
        stream.clear_padding();

        let delta = stream.instruction_start().wrapping_sub(desc.origin) as isize;
        let patched = relocate_instructions(
            &mut stream.body.as_mut_slice()[..desc.instr_size],
            &stream.relocation_info,
            delta,
        );
        flush_instruction_cache(stream.instruction_start(), stream.instruction_size);

        tracing::debug!(
            target: "otter::code",
            kind = %flags.kind(),
            builtin = ?builtin,
            start = format_args!("{:#x}", stream.instruction_start()),
            instruction_size = stream.instruction_size,
            metadata_size = layout.metadata_size,
            patched,
            "installed instruction stream"
        );
        Ok(stream)
    }

    /// View over instructions, metadata and relocation info
    pub fn region(&self) -> CodeRegion<'_> {
        CodeRegion::new(
            &self.body.as_slice()[..self.body_size()],
            self.instruction_size,
            self.layout,
            &self.relocation_info,
        )
    }

    /// Flag word
    #[inline]
    pub fn flags(&self) -> InstructionStreamFlags {
        self.flags
    }

    /// Builtin this stream implements, if any
    #[inline]
    pub fn builtin(&self) -> Option<Builtin> {
        self.builtin
    }

    /// Spill slots of the frame
    #[inline]
    pub fn stack_slots(&self) -> u32 {
        self.flags.stack_slots()
    }

    /// Owning Code; `None` only between allocation and installation
    #[inline]
    pub fn code(&self) -> Option<Handle<Code>> {
        self.code
    }

    pub(crate) fn set_code(&mut self, code: Handle<Code>) {
        debug_assert!(self.code.is_none(), "instruction stream already owned");
        self.code = Some(code);
    }

    /// First instruction byte
    #[inline]
    pub fn instruction_start(&self) -> Address {
        self.body.address()
    }

    /// One past the last instruction byte
    #[inline]
    pub fn instruction_end(&self) -> Address {
        self.instruction_start() + self.instruction_size
    }

    /// Size of the instructions
    #[inline]
    pub fn instruction_size(&self) -> usize {
        self.instruction_size
    }

    /// Instructions and metadata, without trailing padding
    #[inline]
    pub fn body_size(&self) -> usize {
        metadata_offset_for(self.instruction_size) + self.layout.metadata_size
    }

    /// Table layout
    #[inline]
    pub fn metadata_layout(&self) -> MetadataLayout {
        self.layout
    }

    /// True if `pc` is one of this stream's instructions
    #[inline]
    pub fn contains(&self, pc: Address) -> bool {
        self.instruction_start() <= pc && pc < self.instruction_end()
    }

    /// Object size: header plus aligned body
    pub fn size(&self) -> usize {
        Self::size_for(self.body_size())
    }

    /// Object size plus out-of-line relocation info and side tables
    pub fn size_including_metadata(&self) -> usize {
        let side = match &self.metadata {
            CodeMetadata::None => 0,
            CodeMetadata::Deoptimization(data) => data.len() * 8 + data.translation_byte_array().len(),
            CodeMetadata::Baseline {
                bytecode_offset_table,
                ..
            } => bytecode_offset_table.len(),
        };
        self.size() + self.relocation_info.len() + side + self.source_position_table.len()
    }

    /// Relocation records
    #[inline]
    pub fn relocation_info(&self) -> &[u8] {
        &self.relocation_info
    }

    /// Bytecode size inlined into this code, a tiering heuristic
    #[inline]
    pub fn inlined_bytecode_size(&self) -> u32 {
        self.inlined_bytecode_size
    }

    /// Set the inlined bytecode size
    pub fn set_inlined_bytecode_size(&mut self, size: u32) {
        self.inlined_bytecode_size = size;
    }

    /// Bytecode offset this code was compiled to enter at via OSR
    #[inline]
    pub fn osr_offset(&self) -> BytecodeOffset {
        self.osr_offset
    }

    /// Set the OSR entry offset
    pub fn set_osr_offset(&mut self, offset: BytecodeOffset) {
        self.osr_offset = offset;
    }

    /// Kind-dependent side data
    #[inline]
    pub fn metadata(&self) -> &CodeMetadata {
        &self.metadata
    }

    /// Replace the side data
    pub fn set_metadata(&mut self, metadata: CodeMetadata) {
        self.metadata = metadata;
    }

    /// Deoptimization data, for optimized code
    pub fn deoptimization_data(&self) -> Option<&DeoptimizationData> {
        match &self.metadata {
            CodeMetadata::Deoptimization(data) => Some(data),
            _ => None,
        }
    }

    pub(crate) fn deoptimization_data_mut(&mut self) -> Option<&mut DeoptimizationData> {
        match &mut self.metadata {
            CodeMetadata::Deoptimization(data) => Some(data),
            _ => None,
        }
    }

    /// Source position table
    pub fn source_position_table(&self) -> &[u8] {
        &self.source_position_table
    }

    /// Set the source position table
    pub fn set_source_position_table(&mut self, table: Vec<u8>) {
        self.source_position_table = table;
    }

    /// True if a deoptimization entry with a bytecode offset sits at `pc`
    pub fn can_deopt_at(&self, pc: Address) -> bool {
        if !self.contains(pc) {
            return false;
        }
        let pc_offset = pc - self.instruction_start();
        self.deoptimization_data()
            .is_some_and(|data| data.has_entry_at(pc_offset))
    }

    /// Zero every byte that is not instructions or metadata
    pub fn clear_padding(&mut self) {
        let instruction_size = self.instruction_size;
        let metadata_offset = metadata_offset_for(instruction_size);
        let body_size = self.body_size();
        let bytes = self.body.as_mut_slice();
        bytes[instruction_size..metadata_offset].fill(0);
        bytes[body_size..].fill(0);
    }

    /// Patch position-dependent slots after the body moved by `delta`
    pub fn relocate(&mut self, delta: isize) {
        let patched = relocate_instructions(
            &mut self.body.as_mut_slice()[..self.instruction_size],
            &self.relocation_info,
            delta,
        );
        flush_instruction_cache(self.instruction_start(), self.instruction_size);
        tracing::trace!(target: "otter::code", delta, patched, "relocated instruction stream");
    }

    /// Copy the body to fresh memory and relocate it there.
    ///
    /// Returns the old body, which the caller keeps alive until every
    /// reference to its addresses has been rewritten so that no new body can
    /// reuse them in the meantime.
    pub(crate) fn move_body(&mut self) -> Result<CodeBuffer> {
        let fresh = CodeBuffer::from_slice(self.body.as_slice())?;
        let old = std::mem::replace(&mut self.body, fresh);
        let delta = self.instruction_start().wrapping_sub(old.address()) as isize;
        self.relocate(delta);
        Ok(old)
    }

    /// Rewrite code targets for which `map` returns a new address.
    /// Returns the number of slots changed.
    pub(crate) fn retarget_code_targets(&mut self, mut map: impl FnMut(Address) -> Option<Address>) -> usize {
        let start = self.instruction_start();
        let mut changed = 0;
        let instructions = &mut self.body.as_mut_slice()[..self.instruction_size];
        for info in RelocIterator::with_mask(&self.relocation_info, RelocMode::CodeTarget.mask()) {
            let target = code_target_address(instructions, start, info.pc_offset);
            if let Some(new_target) = map(target) {
                set_code_target_address(instructions, start, info.pc_offset, new_target);
                changed += 1;
            }
        }
        if changed > 0 {
            flush_instruction_cache(start, self.instruction_size);
        }
        changed
    }

    /// Absolute targets of every code-target slot
    pub fn code_targets(&self) -> impl Iterator<Item = Address> + '_ {
        let start = self.instruction_start();
        let instructions = &self.body.as_slice()[..self.instruction_size];
        RelocIterator::with_mask(&self.relocation_info, RelocMode::CodeTarget.mask())
            .map(move |info| code_target_address(instructions, start, info.pc_offset))
    }

    /// Uncleared embedded objects with the pc offset of their slot
    pub fn embedded_objects(&self) -> impl Iterator<Item = (u32, Handle<HeapObject>)> + '_ {
        let instructions = &self.body.as_slice()[..self.instruction_size];
        RelocIterator::with_mask(&self.relocation_info, RelocMode::FullEmbeddedObject.mask()).filter_map(
            move |info| {
                let bits = read_u64(instructions, info.pc_offset as usize);
                (bits != CLEARED_EMBEDDED_OBJECT).then(|| (info.pc_offset, Handle::from_bits(bits)))
            },
        )
    }

    /// Overwrite every embedded object slot with the cleared sentinel.
    /// Returns how many slots were still set.
    pub(crate) fn clear_embedded_objects(&mut self) -> usize {
        let mut cleared = 0;
        let instructions = &mut self.body.as_mut_slice()[..self.instruction_size];
        for info in RelocIterator::with_mask(&self.relocation_info, RelocMode::FullEmbeddedObject.mask()) {
            let at = info.pc_offset as usize;
            if read_u64(instructions, at) != CLEARED_EMBEDDED_OBJECT {
                write_u64(instructions, at, CLEARED_EMBEDDED_OBJECT);
                cleared += 1;
            }
        }
        if cleared > 0 {
            flush_instruction_cache(self.instruction_start(), self.instruction_size);
        }
        cleared
    }

    /// Serialize the object as a snapshot would store it.
    ///
    /// Output is `header | body | relocation info`. Internal references are
    /// written relative to the instruction start; code targets, external
    /// references and the owner back-pointer are zeroed since the
    /// deserializer rebinds them. Two installs of the same desc produce
    /// identical bytes.
    pub fn write_snapshot(&self, out: &mut Vec<u8>) {
        let start = out.len();
        let words = [
            self.flags.pack(),
            self.instruction_size as u32,
            self.layout.metadata_size as u32,
            self.layout.handler_table_offset as u32,
            self.layout.constant_pool_offset as u32,
            self.layout.code_comments_offset as u32,
            self.layout.unwinding_info_offset as u32,
            self.builtin.map_or(u32::MAX, |builtin| builtin.id() as u32),
            self.inlined_bytecode_size,
            self.osr_offset.to_int() as u32,
            self.relocation_info.len() as u32,
        ];
        for word in words {
            out.extend_from_slice(&word.to_le_bytes());
        }
        // owner back-pointer
        out.extend_from_slice(&0u64.to_le_bytes());
        out.resize(start + INSTRUCTION_STREAM_HEADER_SIZE, 0);

        let body_start = out.len();
        out.extend_from_slice(self.body.as_slice());
        out.resize(start + self.size(), 0);

        let instruction_start = self.instruction_start() as u64;
        let body = &mut out[body_start..body_start + self.instruction_size];
        for info in RelocIterator::new(&self.relocation_info) {
            let at = info.pc_offset as usize;
            match info.mode {
                RelocMode::InternalReference => {
                    let absolute = read_u64(body, at);
                    write_u64(body, at, absolute.wrapping_sub(instruction_start));
                }
                RelocMode::CodeTarget | RelocMode::ExternalReference => write_u64(body, at, 0),
                RelocMode::FullEmbeddedObject | RelocMode::DeoptReason => {}
            }
        }
        out.extend_from_slice(&self.relocation_info);
    }
}

impl Trace<HeapRef> for InstructionStream {
    /// Embedded objects are not reported here: their strength depends on the
    /// owning Code, so the collector visits them itself.
    fn trace(&self, visitor: &mut dyn Visitor<HeapRef>) {
        if let Some(code) = self.code {
            visitor.visit(HeapRef::Code(code), Strength::Strong);
        }
        match &self.metadata {
            CodeMetadata::None => {}
            CodeMetadata::Deoptimization(data) => data.trace(visitor),
            CodeMetadata::Baseline { bytecode, .. } => {
                visitor.visit(HeapRef::Bytecode(*bytecode), Strength::Strong)
            }
        }
    }
}
