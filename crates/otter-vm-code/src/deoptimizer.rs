//! Hand-off to the deoptimizer
//!
//! Marking code is cheap and happens wherever an assumption breaks. Actually
//! leaving the optimized frames is the deoptimizer's job and happens at the
//! next safe point, so the isolate only tells it that marked code exists.

use otter_vm_gc::Handle;
use rustc_hash::FxHashSet;

use crate::code::Code;
use crate::isolate::Isolate;
use crate::kind::CodeKind;

/// External collaborator that evicts marked code
pub trait Deoptimizer {
    /// Called after at least one code object was newly marked. Implementations
    /// find marked code through the isolate and arrange for its frames to be
    /// left.
    fn deoptimize_marked_code(&mut self, isolate: &Isolate);
}

/// One code object seen marked by [`DeoptimizationLog`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeoptimizationEvent {
    /// The marked code
    pub code: Handle<Code>,
    /// Its kind
    pub kind: CodeKind,
    /// Reason given when it was first marked
    pub reason: String,
}

/// Deoptimizer that records every marked code exactly once.
///
/// Used by tools and tests; it does not touch any frames.
#[derive(Debug, Default)]
pub struct DeoptimizationLog {
    seen: FxHashSet<Handle<Code>>,
    events: Vec<DeoptimizationEvent>,
    requests: usize,
}

impl DeoptimizationLog {
    /// Empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded events in the order they were first seen
    pub fn events(&self) -> &[DeoptimizationEvent] {
        &self.events
    }

    /// How many times the isolate asked for deoptimization
    pub fn requests(&self) -> usize {
        self.requests
    }

    /// True if `code` was recorded
    pub fn contains(&self, code: Handle<Code>) -> bool {
        self.seen.contains(&code)
    }
}

impl Deoptimizer for DeoptimizationLog {
    fn deoptimize_marked_code(&mut self, isolate: &Isolate) {
        self.requests += 1;
        for (handle, code) in isolate.heap().codes.iter() {
            if !code.marked_for_deoptimization() || !self.seen.insert(handle) {
                continue;
            }
            let reason = code.deopt_reason().unwrap_or_default().to_string();
            tracing::debug!(
                target: "otter::deopt",
                code = ?handle,
                kind = %code.kind(),
                reason = %reason,
                "deoptimizing marked code"
            );
            self.events.push(DeoptimizationEvent {
                code: handle,
                kind: code.kind(),
                reason,
            });
        }
    }
}
