//! # Otter VM Code
//!
//! Compiled code objects and their lifecycle on the code heap.
//!
//! ## Design
//!
//! - **Code / InstructionStream split**: a small `Code` handle caches the entry
//!   point, the heavy body lives in an `InstructionStream` or in the embedded
//!   builtins blob
//! - **Uniform access**: `CodeReference` and `CodeLookupResult` answer the same
//!   questions for every origin, so callers never branch on where code lives
//! - **Weak invalidation**: `DependentCode` holds code weakly and marks it for
//!   deoptimization when an assumption about an object breaks
//! - **Explicit context**: every lookup goes through an `Isolate`, there are no
//!   process-wide code tables
//!
//! ## Example
//!
//! ```ignore
//! let embedded = Arc::new(EmbeddedData::new(builtins)?);
//! let mut isolate = Isolate::new(IsolateConfig::from_env(), embedded)?;
//!
//! let mut asm = CodeDescBuilder::new();
//! asm.emit(&bytes);
//! let code = CodeBuilder::new(CodeKind::Maglev, asm.finish()).build(&mut isolate)?;
//!
//! isolate.install_dependency(code, map, DependencyGroups::TRANSITION)?;
//! isolate.deoptimize_dependency_groups(map, DependencyGroups::TRANSITION, &mut deoptimizer);
//! ```

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod baseline;
pub mod buffer;
pub mod code;
pub mod code_reference;
pub mod config;
pub mod dependent_code;
pub mod deoptimization;
pub mod deoptimizer;
pub mod desc;
pub mod embedded;
pub mod error;
pub mod factory;
pub mod flags;
pub mod gc;
pub mod globals;
pub mod handler_table;
pub mod heap;
pub mod install_queue;
pub mod instruction_stream;
pub mod isolate;
pub mod kind;
pub mod layout;
pub mod lookup;
pub mod reloc;
pub mod safepoint;
pub mod translation;
pub mod wasm;

pub use code::{Code, CodeView};
pub use code_reference::CodeReference;
pub use config::IsolateConfig;
pub use dependent_code::{DependencyGroups, DependentCode};
pub use deoptimization::{BytecodeOffset, DeoptimizationData, DeoptimizationLiteralArray};
pub use deoptimizer::{DeoptimizationEvent, DeoptimizationLog, Deoptimizer};
pub use desc::{CodeDesc, CodeDescBuilder};
pub use embedded::{BuiltinBlobs, EmbeddedData};
pub use error::{CodeError, Result};
pub use factory::CodeBuilder;
pub use globals::Address;
pub use handler_table::CatchPrediction;
pub use heap::{Heap, HeapObject, HeapRef, ObjectKind};
pub use install_queue::{InstallQueue, InstallTicket};
pub use instruction_stream::{CodeMetadata, InstructionStream};
pub use isolate::Isolate;
pub use kind::{Builtin, CodeKind};
pub use lookup::CodeLookupResult;
pub use wasm::WasmCode;
