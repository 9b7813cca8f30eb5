//! Uniform read-only access to code from any origin
//!
//! Tools such as disassemblers and profilers only need a handful of
//! properties and must not care whether code is installed, a builtin, wasm
//! module code or still an assembler descriptor.

use crate::code::CodeView;
use crate::desc::CodeDesc;
use crate::globals::Address;
use crate::instruction_stream::InstructionStream;
use crate::wasm::WasmCode;

/// The properties every origin provides
trait CodeOps {
    fn constant_pool(&self) -> Address;
    fn instruction_start(&self) -> Address;
    fn instruction_end(&self) -> Address;
    fn instruction_size(&self) -> usize;
    fn relocation_start(&self) -> Address;
    fn relocation_end(&self) -> Address;
    fn relocation_size(&self) -> usize;
    fn code_comments(&self) -> Address;
    fn code_comments_size(&self) -> usize;
}

impl CodeOps for InstructionStream {
    fn constant_pool(&self) -> Address {
        self.region().constant_pool()
    }
    fn instruction_start(&self) -> Address {
        InstructionStream::instruction_start(self)
    }
    fn instruction_end(&self) -> Address {
        InstructionStream::instruction_end(self)
    }
    fn instruction_size(&self) -> usize {
        InstructionStream::instruction_size(self)
    }
    fn relocation_start(&self) -> Address {
        self.region().relocation_start()
    }
    fn relocation_end(&self) -> Address {
        self.region().relocation_end()
    }
    fn relocation_size(&self) -> usize {
        self.relocation_info().len()
    }
    fn code_comments(&self) -> Address {
        self.region().code_comments()
    }
    fn code_comments_size(&self) -> usize {
        self.region().code_comments_size()
    }
}

impl CodeOps for CodeView<'_> {
    fn constant_pool(&self) -> Address {
        self.region().constant_pool()
    }
    fn instruction_start(&self) -> Address {
        CodeView::instruction_start(self)
    }
    fn instruction_end(&self) -> Address {
        CodeView::instruction_end(self)
    }
    fn instruction_size(&self) -> usize {
        CodeView::instruction_size(self)
    }
    fn relocation_start(&self) -> Address {
        self.region().relocation_start()
    }
    fn relocation_end(&self) -> Address {
        self.region().relocation_end()
    }
    fn relocation_size(&self) -> usize {
        self.region().relocation_size()
    }
    fn code_comments(&self) -> Address {
        self.region().code_comments()
    }
    fn code_comments_size(&self) -> usize {
        self.region().code_comments_size()
    }
}

impl CodeOps for WasmCode {
    fn constant_pool(&self) -> Address {
        WasmCode::constant_pool(self)
    }
    fn instruction_start(&self) -> Address {
        self.instructions().as_ptr() as Address
    }
    fn instruction_end(&self) -> Address {
        self.instruction_start() + self.instructions().len()
    }
    fn instruction_size(&self) -> usize {
        self.instructions().len()
    }
    fn relocation_start(&self) -> Address {
        self.reloc_info().as_ptr() as Address
    }
    fn relocation_end(&self) -> Address {
        self.relocation_start() + self.reloc_info().len()
    }
    fn relocation_size(&self) -> usize {
        self.reloc_info().len()
    }
    fn code_comments(&self) -> Address {
        WasmCode::code_comments(self)
    }
    fn code_comments_size(&self) -> usize {
        WasmCode::code_comments_size(self)
    }
}

// Offsets are taken as recorded, even for absent tables.
impl CodeOps for CodeDesc {
    fn constant_pool(&self) -> Address {
        self.instruction_start() + self.constant_pool_offset
    }
    fn instruction_start(&self) -> Address {
        self.buffer_start()
    }
    fn instruction_end(&self) -> Address {
        self.instruction_start() + self.instr_size
    }
    fn instruction_size(&self) -> usize {
        self.instr_size
    }
    fn relocation_start(&self) -> Address {
        self.buffer_start() + self.reloc_offset
    }
    fn relocation_end(&self) -> Address {
        self.buffer_start() + self.buffer.len()
    }
    fn relocation_size(&self) -> usize {
        self.reloc_size
    }
    fn code_comments(&self) -> Address {
        self.instruction_start() + self.code_comments_offset
    }
    fn code_comments_size(&self) -> usize {
        self.code_comments_size
    }
}

/// Non-owning reference to code of any origin.
///
/// Querying a [`CodeReference::Null`] is a bug and panics.
///
/// Installed origins report a null relocation start when they carry no
/// relocation info, while a descriptor reports its recorded offset. Only
/// relocation sizes are comparable across origins in that case.
#[derive(Debug, Clone, Copy, Default)]
pub enum CodeReference<'a> {
    /// No code
    #[default]
    Null,
    /// Installed instruction stream
    InstructionStream(&'a InstructionStream),
    /// Installed code, possibly an off-heap builtin
    Code(CodeView<'a>),
    /// Externally managed wasm code
    Wasm(&'a WasmCode),
    /// Assembler output not yet installed
    CodeDesc(&'a CodeDesc),
}

macro_rules! dispatch {
    ($($(#[$doc:meta])* $method:ident -> $ret:ty;)*) => {
        $(
            $(#[$doc])*
            pub fn $method(&self) -> $ret {
                match self {
                    CodeReference::Null => panic!(concat!(stringify!($method), " on a null code reference")),
                    CodeReference::InstructionStream(stream) => CodeOps::$method(*stream),
                    CodeReference::Code(view) => CodeOps::$method(view),
                    CodeReference::Wasm(code) => CodeOps::$method(*code),
                    CodeReference::CodeDesc(desc) => CodeOps::$method(*desc),
                }
            }
        )*
    };
}

impl<'a> CodeReference<'a> {
    /// True if no code is referenced
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, CodeReference::Null)
    }

    /// True if this references an installed stream
    #[inline]
    pub fn is_instruction_stream(&self) -> bool {
        matches!(self, CodeReference::InstructionStream(_))
    }

    /// True if this references a Code
    #[inline]
    pub fn is_code(&self) -> bool {
        matches!(self, CodeReference::Code(_))
    }

    /// True if this references wasm code
    #[inline]
    pub fn is_wasm_code(&self) -> bool {
        matches!(self, CodeReference::Wasm(_))
    }

    /// True if this references a descriptor
    #[inline]
    pub fn is_code_desc(&self) -> bool {
        matches!(self, CodeReference::CodeDesc(_))
    }

    dispatch! {
        /// Constant pool address
        constant_pool -> Address;
        /// First instruction
        instruction_start -> Address;
        /// One past the last instruction
        instruction_end -> Address;
        /// Instruction size
        instruction_size -> usize;
        /// Start of the relocation info. Null for installed code without
        /// relocation info.
        relocation_start -> Address;
        /// End of the relocation info
        relocation_end -> Address;
        /// Relocation info size
        relocation_size -> usize;
        /// Code comments address
        code_comments -> Address;
        /// Code comments size
        code_comments_size -> usize;
    }
}

impl<'a> From<&'a InstructionStream> for CodeReference<'a> {
    fn from(stream: &'a InstructionStream) -> Self {
        CodeReference::InstructionStream(stream)
    }
}

impl<'a> From<CodeView<'a>> for CodeReference<'a> {
    fn from(view: CodeView<'a>) -> Self {
        CodeReference::Code(view)
    }
}

impl<'a> From<&'a WasmCode> for CodeReference<'a> {
    fn from(code: &'a WasmCode) -> Self {
        CodeReference::Wasm(code)
    }
}

impl<'a> From<&'a CodeDesc> for CodeReference<'a> {
    fn from(desc: &'a CodeDesc) -> Self {
        CodeReference::CodeDesc(desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "instruction_start on a null code reference")]
    fn test_null_reference_is_a_bug() {
        CodeReference::default().instruction_start();
    }

    #[test]
    fn test_predicates() {
        let desc = CodeDesc::default();
        let reference = CodeReference::from(&desc);
        assert!(reference.is_code_desc());
        assert!(!reference.is_null());
        assert!(CodeReference::Null.is_null());
    }
}
