//! # Otter VM Garbage Collector
//!
//! Handle-based tracing collector used by the code heap.
//!
//! ## Design
//!
//! - **Spaces**: Slab storage per object type, addressed by generational handles
//! - **Tracing**: Objects report strong and weak edges through a visitor
//! - **Marking**: Tri-color worklist marker, weak edges never keep targets alive
//! - **Sweeping**: Unmarked slots are vacated and their generation bumped

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod collector;
pub mod handle;
pub mod heap;
pub mod object;
pub mod space;
pub mod trace;

pub use collector::{CycleSummary, GcStats};
pub use handle::{Handle, Weak};
pub use heap::GcConfig;
pub use object::MarkColor;
pub use space::Space;
pub use trace::{Marker, Strength, Trace, Visitor};
