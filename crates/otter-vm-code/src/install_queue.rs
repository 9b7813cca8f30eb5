//! Code assembled off the isolate thread, waiting to be installed
//!
//! Background compilers finish with a [`CodeBuilder`]. Installing touches
//! the heap, so only the isolate thread may do it; everyone else pushes the
//! builder here and the isolate drains the queue at its next safe point.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::factory::CodeBuilder;

/// Identifies one queued job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstallTicket(u64);

impl InstallTicket {
    /// Raw ticket number, increasing in submission order
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Multi-producer queue of finished jobs, shared as `Arc<InstallQueue>`
#[derive(Debug, Default)]
pub struct InstallQueue {
    pending: Mutex<VecDeque<(InstallTicket, CodeBuilder)>>,
    next_ticket: AtomicU64,
}

impl InstallQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a finished job. Callable from any thread.
    pub fn submit(&self, job: CodeBuilder) -> InstallTicket {
        let ticket = InstallTicket(self.next_ticket.fetch_add(1, Ordering::Relaxed));
        tracing::trace!(
            target: "otter::code",
            ticket = ticket.0,
            kind = %job.kind(),
            "queued code for installation"
        );
        self.pending.lock().push_back((ticket, job));
        ticket
    }

    /// Take every queued job, oldest first
    pub fn drain(&self) -> Vec<(InstallTicket, CodeBuilder)> {
        self.pending.lock().drain(..).collect()
    }

    /// Number of queued jobs
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// True if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}
