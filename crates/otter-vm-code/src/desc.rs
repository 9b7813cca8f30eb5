//! Code descriptors produced by an assembler
//!
//! A [`CodeDesc`] is the only input for creating an InstructionStream. Its
//! buffer is laid out as
//!
//! ```text
//! +--------------------+ 0
//! | instructions       |
//! +--------------------+ instr_size
//! | padding            |
//! +--------------------+ safepoint_table_offset (instr_size rounded up to 4)
//! | safepoint table    |
//! | handler table      |
//! | constant pool      |
//! | code comments      |
//! +--------------------+ code_comments_offset + code_comments_size
//! | free               |
//! +--------------------+ reloc_offset
//! | relocation info    |
//! +--------------------+ buffer.len()
//! ```
//!
//! Unwinding info is carried separately and appended to the metadata on
//! installation. Absolute addresses inside the instructions assume the code
//! starts at `origin`.

use otter_vm_gc::Handle;

use crate::error::{CodeError, Result};
use crate::globals::{Address, METADATA_ALIGNMENT, round_up};
use crate::heap::HeapObject;
use crate::layout::MetadataLayout;
use crate::reloc::{RelocInfoWriter, RelocMode, set_code_target_address, verify_reloc_info, write_u64};

/// Output of an assembler. Offsets are relative to the buffer start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeDesc {
    /// Instructions, metadata and relocation info
    pub buffer: Vec<u8>,
    /// Address the instructions were assembled for
    pub origin: Address,
    /// Size of the executable instructions
    pub instr_size: usize,
    /// Start of the safepoint table, which also starts the metadata
    pub safepoint_table_offset: usize,
    /// Safepoint table size
    pub safepoint_table_size: usize,
    /// Start of the handler table
    pub handler_table_offset: usize,
    /// Handler table size
    pub handler_table_size: usize,
    /// Start of the constant pool
    pub constant_pool_offset: usize,
    /// Constant pool size
    pub constant_pool_size: usize,
    /// Start of the code comments
    pub code_comments_offset: usize,
    /// Code comments size
    pub code_comments_size: usize,
    /// Start of the relocation info
    pub reloc_offset: usize,
    /// Relocation info size
    pub reloc_size: usize,
    /// Unwinding info, placed last in the installed metadata
    pub unwinding_info: Vec<u8>,
}

impl CodeDesc {
    /// Address of the buffer's first byte
    #[inline]
    pub fn buffer_start(&self) -> Address {
        self.buffer.as_ptr() as Address
    }

    /// Size of the executable instructions
    #[inline]
    pub fn instruction_size(&self) -> usize {
        self.instr_size
    }

    /// End of the in-buffer metadata tables
    #[inline]
    pub fn metadata_end(&self) -> usize {
        self.code_comments_offset + self.code_comments_size
    }

    /// Installed metadata size, unwinding info included
    pub fn metadata_size(&self) -> usize {
        self.metadata_end() - self.safepoint_table_offset + self.unwinding_info.len()
    }

    /// Installed body size: padded instructions plus metadata
    pub fn body_size(&self) -> usize {
        self.safepoint_table_offset + self.metadata_size()
    }

    /// The executable instructions
    pub fn instructions(&self) -> &[u8] {
        &self.buffer[..self.instr_size]
    }

    /// In-buffer metadata tables, without unwinding info
    pub fn metadata(&self) -> &[u8] {
        &self.buffer[self.safepoint_table_offset..self.metadata_end()]
    }

    /// The relocation records
    pub fn reloc_info(&self) -> &[u8] {
        &self.buffer[self.reloc_offset..self.reloc_offset + self.reloc_size]
    }

    /// Table offsets relative to the metadata start
    pub fn metadata_layout(&self) -> MetadataLayout {
        let base = self.safepoint_table_offset;
        MetadataLayout {
            handler_table_offset: self.handler_table_offset - base,
            constant_pool_offset: self.constant_pool_offset - base,
            code_comments_offset: self.code_comments_offset - base,
            unwinding_info_offset: self.metadata_end() - base,
            metadata_size: self.metadata_size(),
        }
    }

    /// Check that the layout matches the picture in the module docs.
    pub fn verify(&self) -> Result<()> {
        let malformed = |what: String| Err(CodeError::MalformedDesc(what));
        if self.instr_size > self.buffer.len() {
            return malformed(format!(
                "instr_size {} exceeds buffer of {}",
                self.instr_size,
                self.buffer.len()
            ));
        }
        if self.safepoint_table_offset != round_up(self.instr_size, METADATA_ALIGNMENT) {
            return malformed(format!(
                "metadata starts at {}, expected {}",
                self.safepoint_table_offset,
                round_up(self.instr_size, METADATA_ALIGNMENT)
            ));
        }
        let tables = [
            ("safepoint table", self.safepoint_table_offset, self.safepoint_table_size, self.handler_table_offset),
            ("handler table", self.handler_table_offset, self.handler_table_size, self.constant_pool_offset),
            ("constant pool", self.constant_pool_offset, self.constant_pool_size, self.code_comments_offset),
        ];
        for (name, offset, size, next) in tables {
            if offset + size != next {
                return malformed(format!("{name} at {offset}+{size} does not end at {next}"));
            }
        }
        if self.metadata_end() > self.reloc_offset {
            return malformed(format!(
                "metadata ends at {} past relocation info at {}",
                self.metadata_end(),
                self.reloc_offset
            ));
        }
        if self.reloc_offset + self.reloc_size != self.buffer.len() {
            return malformed(format!(
                "relocation info {}+{} does not end the buffer of {}",
                self.reloc_offset,
                self.reloc_size,
                self.buffer.len()
            ));
        }
        verify_reloc_info(self.reloc_info(), self.instr_size)?;
        Ok(())
    }
}

/// Minimal assembler front end: raw bytes plus the patchable slots a real
/// assembler would emit, then the metadata tables.
#[derive(Debug, Default)]
pub struct CodeDescBuilder {
    instructions: Vec<u8>,
    reloc: RelocInfoWriter,
    safepoint_table: Vec<u8>,
    handler_table: Vec<u8>,
    constant_pool: Vec<u8>,
    code_comments: Vec<u8>,
    unwinding_info: Vec<u8>,
}

impl CodeDescBuilder {
    /// Start an empty descriptor
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset the next byte will be emitted at
    #[inline]
    pub fn pc_offset(&self) -> u32 {
        self.instructions.len() as u32
    }

    /// Emit raw instruction bytes
    pub fn emit(&mut self, bytes: &[u8]) -> &mut Self {
        self.instructions.extend_from_slice(bytes);
        self
    }

    fn reserve_slot(&mut self, mode: RelocMode) -> u32 {
        let pc = self.pc_offset();
        self.reloc.write(pc, mode);
        self.instructions.extend_from_slice(&[0; 8]);
        pc
    }

    /// Call slot pointing at absolute `target`
    pub fn emit_code_target(&mut self, target: Address) -> &mut Self {
        let pc = self.reserve_slot(RelocMode::CodeTarget);
        set_code_target_address(&mut self.instructions, 0, pc, target);
        self
    }

    /// Absolute pointer to `target_offset` within these instructions
    pub fn emit_internal_reference(&mut self, target_offset: u32) -> &mut Self {
        let pc = self.reserve_slot(RelocMode::InternalReference);
        write_u64(&mut self.instructions, pc as usize, target_offset as u64);
        self
    }

    /// Slot holding a heap object
    pub fn emit_embedded_object(&mut self, object: Handle<HeapObject>) -> &mut Self {
        let pc = self.reserve_slot(RelocMode::FullEmbeddedObject);
        write_u64(&mut self.instructions, pc as usize, object.to_bits());
        self
    }

    /// Slot holding an address outside the heap
    pub fn emit_external_reference(&mut self, address: Address) -> &mut Self {
        let pc = self.reserve_slot(RelocMode::ExternalReference);
        write_u64(&mut self.instructions, pc as usize, address as u64);
        self
    }

    /// Mark the current pc as a deoptimization exit
    pub fn record_deopt_reason(&mut self) -> &mut Self {
        let pc = self.pc_offset();
        self.reloc.write(pc, RelocMode::DeoptReason);
        self
    }

    /// Encoded safepoint table
    pub fn safepoint_table(&mut self, bytes: Vec<u8>) -> &mut Self {
        self.safepoint_table = bytes;
        self
    }

    /// Encoded handler table
    pub fn handler_table(&mut self, bytes: Vec<u8>) -> &mut Self {
        self.handler_table = bytes;
        self
    }

    /// Constant pool contents
    pub fn constant_pool(&mut self, bytes: Vec<u8>) -> &mut Self {
        self.constant_pool = bytes;
        self
    }

    /// Code comments
    pub fn code_comments(&mut self, text: &str) -> &mut Self {
        self.code_comments = text.as_bytes().to_vec();
        self
    }

    /// Unwinding info
    pub fn unwinding_info(&mut self, bytes: Vec<u8>) -> &mut Self {
        self.unwinding_info = bytes;
        self
    }

    /// Lay everything out into a descriptor
    pub fn finish(self) -> CodeDesc {
        let instr_size = self.instructions.len();
        let mut buffer = self.instructions;
        buffer.resize(round_up(instr_size, METADATA_ALIGNMENT), 0);

        let safepoint_table_offset = buffer.len();
        buffer.extend_from_slice(&self.safepoint_table);
        let handler_table_offset = buffer.len();
        buffer.extend_from_slice(&self.handler_table);
        let constant_pool_offset = buffer.len();
        buffer.extend_from_slice(&self.constant_pool);
        let code_comments_offset = buffer.len();
        buffer.extend_from_slice(&self.code_comments);

        let reloc_offset = buffer.len();
        let reloc = self.reloc.finish();
        let reloc_size = reloc.len();
        buffer.extend_from_slice(&reloc);

        CodeDesc {
            buffer,
            origin: 0,
            instr_size,
            safepoint_table_offset,
            safepoint_table_size: self.safepoint_table.len(),
            handler_table_offset,
            handler_table_size: self.handler_table.len(),
            constant_pool_offset,
            constant_pool_size: self.constant_pool.len(),
            code_comments_offset,
            code_comments_size: self.code_comments.len(),
            reloc_offset,
            reloc_size,
            unwinding_info: self.unwinding_info,
        }
    }
}
