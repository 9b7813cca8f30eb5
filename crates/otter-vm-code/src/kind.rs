//! Code kinds and builtin identifiers

/// What produced a piece of code and how it is executed.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CodeKind {
    /// Interpreter bytecode handler
    BytecodeHandler = 0,
    /// Code assembled by tests
    ForTesting = 1,
    /// Engine builtin
    Builtin = 2,
    /// Compiled regular expression
    RegExp = 3,
    /// WebAssembly function body
    WasmFunction = 4,
    /// Wasm to C API wrapper
    WasmToCapiFunction = 5,
    /// Wasm to JS wrapper
    WasmToJsFunction = 6,
    /// JS to Wasm wrapper
    JsToWasmFunction = 7,
    /// JS to JS wrapper
    JsToJsFunction = 8,
    /// C to Wasm entry stub
    CWasmEntry = 9,
    /// Function running in the interpreter
    InterpretedFunction = 10,
    /// Baseline (non-optimizing) compiler output
    Baseline = 11,
    /// Mid-tier optimizing compiler output
    Maglev = 12,
    /// Top-tier optimizing compiler output
    Turbofan = 13,
}

/// Number of code kinds; fits the 4-bit kind field
pub const CODE_KIND_COUNT: usize = 14;

impl CodeKind {
    /// Decode a kind from its numeric value
    pub const fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => CodeKind::BytecodeHandler,
            1 => CodeKind::ForTesting,
            2 => CodeKind::Builtin,
            3 => CodeKind::RegExp,
            4 => CodeKind::WasmFunction,
            5 => CodeKind::WasmToCapiFunction,
            6 => CodeKind::WasmToJsFunction,
            7 => CodeKind::JsToWasmFunction,
            8 => CodeKind::JsToJsFunction,
            9 => CodeKind::CWasmEntry,
            10 => CodeKind::InterpretedFunction,
            11 => CodeKind::Baseline,
            12 => CodeKind::Maglev,
            13 => CodeKind::Turbofan,
            _ => return None,
        })
    }

    /// Output of an optimizing JS tier
    #[inline]
    pub const fn is_optimized_js_function(self) -> bool {
        matches!(self, CodeKind::Maglev | CodeKind::Turbofan)
    }

    /// Code of this kind may be marked for deoptimization
    #[inline]
    pub const fn can_deoptimize(self) -> bool {
        self.is_optimized_js_function()
    }

    /// Code of this kind checks the tiering state and may tier up
    #[inline]
    pub const fn can_tier_up(self) -> bool {
        matches!(
            self,
            CodeKind::InterpretedFunction | CodeKind::Baseline | CodeKind::Maglev
        )
    }

    /// WebAssembly function bodies and wrappers
    #[inline]
    pub const fn is_wasm(self) -> bool {
        matches!(
            self,
            CodeKind::WasmFunction
                | CodeKind::WasmToCapiFunction
                | CodeKind::WasmToJsFunction
                | CodeKind::JsToWasmFunction
                | CodeKind::CWasmEntry
        )
    }

    /// Code that runs a JS function (any tier)
    #[inline]
    pub const fn is_js_function(self) -> bool {
        matches!(
            self,
            CodeKind::InterpretedFunction
                | CodeKind::Baseline
                | CodeKind::Maglev
                | CodeKind::Turbofan
        )
    }

    /// Lower-case name for logs
    pub const fn name(self) -> &'static str {
        match self {
            CodeKind::BytecodeHandler => "bytecode_handler",
            CodeKind::ForTesting => "for_testing",
            CodeKind::Builtin => "builtin",
            CodeKind::RegExp => "regexp",
            CodeKind::WasmFunction => "wasm_function",
            CodeKind::WasmToCapiFunction => "wasm_to_capi_function",
            CodeKind::WasmToJsFunction => "wasm_to_js_function",
            CodeKind::JsToWasmFunction => "js_to_wasm_function",
            CodeKind::JsToJsFunction => "js_to_js_function",
            CodeKind::CWasmEntry => "c_wasm_entry",
            CodeKind::InterpretedFunction => "interpreted_function",
            CodeKind::Baseline => "baseline",
            CodeKind::Maglev => "maglev",
            CodeKind::Turbofan => "turbofan",
        }
    }
}

impl std::fmt::Display for CodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

macro_rules! define_builtins {
    ($($name:ident),* $(,)?) => {
        /// Engine builtins, in blob order.
        #[repr(u16)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Builtin {
            $(
                #[allow(missing_docs)]
                $name,
            )*
        }

        impl Builtin {
            /// Every builtin in id order
            pub const ALL: &'static [Builtin] = &[$(Builtin::$name),*];

            /// Name as printed in logs and disassembly
            pub const fn name(self) -> &'static str {
                match self {
                    $(Builtin::$name => stringify!($name),)*
                }
            }
        }
    };
}

define_builtins! {
    InterpreterEntryTrampoline,
    InterpreterEnterAtBytecode,
    InterpreterEnterAtNextBytecode,
    BaselineOutOfLinePrologue,
    BaselineOutOfLinePrologueDeopt,
    BaselineOrInterpreterEnterAtBytecode,
    BaselineOrInterpreterEnterAtNextBytecode,
    BaselineLeaveFrame,
    CompileLazy,
    DeoptimizationEntryEager,
    DeoptimizationEntryLazy,
    CEntry,
    StackCheck,
    PromiseReject,
    PromiseRejectReactionJob,
    PromiseCapabilityDefaultReject,
    AsyncFunctionAwaitRejectClosure,
    ArrayPrototypePush,
    StringPrototypeIndexOf,
}

/// Number of builtins
pub const BUILTIN_COUNT: usize = Builtin::ALL.len();

impl Builtin {
    /// Numeric id
    #[inline]
    pub const fn id(self) -> u16 {
        self as u16
    }

    /// Builtin with the given id
    pub fn from_id(id: u16) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }

    /// Entry trampolines of the interpreter
    pub const fn is_interpreter_trampoline(self) -> bool {
        matches!(
            self,
            Builtin::InterpreterEntryTrampoline
                | Builtin::InterpreterEnterAtBytecode
                | Builtin::InterpreterEnterAtNextBytecode
        )
    }

    /// Trampolines between baseline code and the interpreter
    pub const fn is_baseline_trampoline(self) -> bool {
        matches!(
            self,
            Builtin::BaselineOutOfLinePrologue
                | Builtin::BaselineOutOfLinePrologueDeopt
                | Builtin::BaselineOrInterpreterEnterAtBytecode
                | Builtin::BaselineOrInterpreterEnterAtNextBytecode
        )
    }

    /// Exceptions thrown by these builtins reject a promise
    pub const fn is_promise_rejection(self) -> bool {
        matches!(
            self,
            Builtin::PromiseReject
                | Builtin::PromiseRejectReactionJob
                | Builtin::PromiseCapabilityDefaultReject
                | Builtin::AsyncFunctionAwaitRejectClosure
        )
    }
}

impl std::fmt::Display for Builtin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip_and_count() {
        for value in 0..CODE_KIND_COUNT as u8 {
            let kind = CodeKind::from_u8(value).unwrap();
            assert_eq!(kind as u8, value);
        }
        assert!(CodeKind::from_u8(CODE_KIND_COUNT as u8).is_none());
        assert!(CODE_KIND_COUNT <= 16);
    }

    #[test]
    fn test_kind_predicates() {
        assert!(CodeKind::Turbofan.can_deoptimize());
        assert!(!CodeKind::Baseline.can_deoptimize());
        assert!(CodeKind::Maglev.can_tier_up());
        assert!(!CodeKind::Turbofan.can_tier_up());
        assert!(CodeKind::JsToWasmFunction.is_wasm());
        assert!(!CodeKind::Builtin.is_wasm());
    }

    #[test]
    fn test_builtin_ids_are_dense() {
        for (index, builtin) in Builtin::ALL.iter().enumerate() {
            assert_eq!(builtin.id() as usize, index);
            assert_eq!(Builtin::from_id(index as u16), Some(*builtin));
        }
        assert!(Builtin::from_id(BUILTIN_COUNT as u16).is_none());
        assert!(Builtin::InterpreterEntryTrampoline.is_interpreter_trampoline());
        assert!(Builtin::BaselineOutOfLinePrologue.is_baseline_trampoline());
        assert!(Builtin::PromiseReject.is_promise_rejection());
        assert!(!Builtin::CompileLazy.is_promise_rejection());
    }
}
