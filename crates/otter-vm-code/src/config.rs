//! Isolate configuration
//!
//! Defaults can be overridden from the environment:
//!
//! - `OTTER_SHORT_BUILTIN_CALLS=1` keeps an isolate-local copy of the builtins
//! - `OTTER_COMPACT_CODE_SPACE=1` evacuates code bodies on every full GC
//! - `OTTER_BYTECODE_OLD_AGE=<u16>` sets the age at which bytecode is old

use otter_vm_gc::GcConfig;

/// Age at which bytecode counts as old unless overridden
pub const DEFAULT_BYTECODE_OLD_AGE: u16 = 5;

/// Largest code object the factory accepts unless overridden
pub const DEFAULT_MAX_CODE_OBJECT_SIZE: usize = 256 * 1024 * 1024;

/// Per-isolate configuration
#[derive(Debug, Clone)]
pub struct IsolateConfig {
    /// Keep an isolate-local re-embedded copy of the builtins blob
    pub short_builtin_calls: bool,
    /// Move every live code body during full collections
    pub compact_code_space: bool,
    /// Age at which a BytecodeArray counts as old
    pub bytecode_old_age: u16,
    /// Largest code object the factory accepts
    pub max_code_object_size: usize,
    /// Collector configuration
    pub gc: GcConfig,
}

impl Default for IsolateConfig {
    fn default() -> Self {
        Self {
            short_builtin_calls: false,
            compact_code_space: false,
            bytecode_old_age: DEFAULT_BYTECODE_OLD_AGE,
            max_code_object_size: DEFAULT_MAX_CODE_OBJECT_SIZE,
            gc: GcConfig::default(),
        }
    }
}

impl IsolateConfig {
    /// Defaults with `OTTER_*` environment overrides applied
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults with overrides taken from `lookup`.
    ///
    /// Split out from [`IsolateConfig::from_env`] so overrides can be tested
    /// without touching the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(value) = lookup("OTTER_SHORT_BUILTIN_CALLS") {
            config.short_builtin_calls = parse_env_truthy(&value);
        }
        if let Some(value) = lookup("OTTER_COMPACT_CODE_SPACE") {
            config.compact_code_space = parse_env_truthy(&value);
        }
        if let Some(age) = lookup("OTTER_BYTECODE_OLD_AGE")
            .and_then(|value| value.trim().parse::<u16>().ok())
            .filter(|age| *age > 0)
        {
            config.bytecode_old_age = age;
        }
        config
    }
}

fn parse_env_truthy(value: &str) -> bool {
    !matches!(value.trim(), "" | "0")
        && !value.trim().eq_ignore_ascii_case("false")
        && !value.trim().eq_ignore_ascii_case("off")
        && !value.trim().eq_ignore_ascii_case("no")
}
