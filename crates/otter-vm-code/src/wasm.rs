//! WebAssembly module code
//!
//! Wasm code is owned by its module's native code space, not by the heap.
//! Only what tooling needs through [`CodeReference`](crate::CodeReference)
//! is modeled here.

use crate::buffer::{CodeBuffer, flush_instruction_cache};
use crate::desc::CodeDesc;
use crate::error::{CodeError, Result};
use crate::globals::{Address, NULL_ADDRESS};
use crate::kind::CodeKind;
use crate::reloc::relocate_instructions;

/// Externally managed code of one wasm function or wrapper
#[derive(Debug)]
pub struct WasmCode {
    kind: CodeKind,
    body: CodeBuffer,
    instr_size: usize,
    // table offsets are relative to the instruction start
    safepoint_table_offset: usize,
    handler_table_offset: usize,
    constant_pool_offset: usize,
    code_comments_offset: usize,
    unpadded_binary_size: usize,
    reloc_info: Box<[u8]>,
}

impl WasmCode {
    /// Copy `desc` into module code memory
    pub fn from_desc(desc: &CodeDesc, kind: CodeKind) -> Result<Self> {
        if !kind.is_wasm() {
            return Err(CodeError::MalformedDesc(format!("{kind} is not a wasm code kind")));
        }
        desc.verify()?;
        let unpadded_binary_size = desc.metadata_end();
        let mut body = CodeBuffer::from_slice(&desc.buffer[..unpadded_binary_size])?;
        let delta = body.address().wrapping_sub(desc.origin) as isize;
        relocate_instructions(&mut body.as_mut_slice()[..desc.instr_size], desc.reloc_info(), delta);
        flush_instruction_cache(body.address(), desc.instr_size);
        Ok(Self {
            kind,
            body,
            instr_size: desc.instr_size,
            safepoint_table_offset: desc.safepoint_table_offset,
            handler_table_offset: desc.handler_table_offset,
            constant_pool_offset: desc.constant_pool_offset,
            code_comments_offset: desc.code_comments_offset,
            unpadded_binary_size,
            reloc_info: desc.reloc_info().into(),
        })
    }

    /// Code kind
    #[inline]
    pub fn kind(&self) -> CodeKind {
        self.kind
    }

    /// Executable instructions
    pub fn instructions(&self) -> &[u8] {
        &self.body.as_slice()[..self.instr_size]
    }

    /// Relocation records
    pub fn reloc_info(&self) -> &[u8] {
        &self.reloc_info
    }

    /// Safepoint table bytes
    pub fn safepoint_table(&self) -> &[u8] {
        &self.body.as_slice()[self.safepoint_table_offset..self.handler_table_offset]
    }

    /// Handler table bytes
    pub fn handler_table(&self) -> &[u8] {
        &self.body.as_slice()[self.handler_table_offset..self.constant_pool_offset]
    }

    /// Constant pool address, null when there is none
    pub fn constant_pool(&self) -> Address {
        if self.constant_pool_offset < self.code_comments_offset {
            self.body.address() + self.constant_pool_offset
        } else {
            NULL_ADDRESS
        }
    }

    /// Code comments address
    pub fn code_comments(&self) -> Address {
        self.body.address() + self.code_comments_offset
    }

    /// Code comments size
    pub fn code_comments_size(&self) -> usize {
        self.unpadded_binary_size - self.code_comments_offset
    }

    /// True if `pc` is one of the instructions
    pub fn contains(&self, pc: Address) -> bool {
        let start = self.body.address();
        start <= pc && pc < start + self.instr_size
    }
}
