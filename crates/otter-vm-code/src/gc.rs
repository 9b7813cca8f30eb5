//! Full collection of an isolate's heap
//!
//! ```text
//! mark      roots + builtin codes, strong edges only
//! weak      dead weakly embedded objects deoptimize their code,
//!           dead deopt literals and dependent code entries are cleared
//! sweep     every space
//! compact   optionally move every live instruction body
//! ```
//!
//! Code edges come from three places: the [`Trace`] impls, code targets in
//! the instructions (resolved through the code range map) and embedded
//! objects, whose strength depends on the owning Code.

use std::time::Instant;

use otter_vm_gc::{CycleSummary, Handle, Marker, Strength, Trace, Visitor};

use crate::code::Code;
use crate::globals::Address;
use crate::heap::{Heap, HeapRef};
use crate::instruction_stream::InstructionStream;
use crate::isolate::Isolate;

/// Report every outgoing edge of `object`
fn scan(heap: &Heap, object: HeapRef, visitor: &mut dyn Visitor<HeapRef>) {
    match object {
        HeapRef::Object(handle) => {
            if let Some(object) = heap.objects.get(handle) {
                object.trace(visitor);
            }
        }
        HeapRef::Code(handle) => {
            if let Some(code) = heap.codes.get(handle) {
                code.trace(visitor);
            }
        }
        HeapRef::Bytecode(handle) => {
            if let Some(bytecode) = heap.bytecodes.get(handle) {
                bytecode.trace(visitor);
            }
        }
        HeapRef::Stream(handle) => {
            if let Some(stream) = heap.streams.get(handle) {
                scan_stream(heap, stream, visitor);
            }
        }
    }
}

fn scan_stream(heap: &Heap, stream: &InstructionStream, visitor: &mut dyn Visitor<HeapRef>) {
    stream.trace(visitor);
    // calls into the blob need no edge
    for target in stream.code_targets() {
        if let Some(callee) = heap.code_ranges.find(target) {
            visitor.visit(HeapRef::Stream(callee), Strength::Strong);
        }
    }
    let weak_embedding = stream
        .code()
        .and_then(|code| heap.codes.get(code))
        .is_some_and(Code::can_have_weak_objects);
    for (_, object) in stream.embedded_objects() {
        let weak = weak_embedding
            && heap
                .objects
                .get(object)
                .is_some_and(|object| object.kind().is_weak_embedding_target());
        let strength = if weak { Strength::Weak } else { Strength::Strong };
        visitor.visit(HeapRef::Object(object), strength);
    }
}

impl Isolate {
    /// Run a full collection
    pub fn collect_garbage(&mut self) -> CycleSummary {
        let started = Instant::now();
        tracing::debug!(target: "otter::gc", roots = self.roots.len(), "collection started");

        let mut marker = Marker::new();
        for root in &self.roots {
            marker.mark_root(*root);
        }
        for code in self.builtin_codes.iter().flatten() {
            marker.mark_root(HeapRef::Code(*code));
        }
        let heap = &self.heap;
        marker.run(|object, visitor| scan(heap, object, visitor));

        let weak_cleared = self.process_weak_references(&marker);
        let swept = self.sweep(&marker);
        let relocated = if self.config.compact_code_space || self.config.gc.compact {
            self.compact_code_space()
        } else {
            0
        };
        for (_, bytecode) in self.heap.bytecodes.iter() {
            bytecode.make_older(self.config.bytecode_old_age);
        }

        let summary = CycleSummary {
            marked: marker.marked_count(),
            swept,
            weak_cleared,
            relocated,
        };
        let elapsed = started.elapsed();
        self.stats.record(summary, elapsed);
        tracing::debug!(
            target: "otter::gc",
            marked = summary.marked,
            swept = summary.swept,
            weak_cleared = summary.weak_cleared,
            relocated = summary.relocated,
            pause_us = elapsed.as_micros() as u64,
            "collection finished"
        );
        summary
    }

    fn process_weak_references(&mut self, marker: &Marker<HeapRef>) -> usize {
        let is_live = |target: HeapRef| marker.is_live(target);
        let Heap {
            objects,
            codes,
            streams,
            ..
        } = &mut self.heap;
        let mut cleared = 0;

        for (handle, stream) in streams.iter_mut() {
            if !is_live(HeapRef::Stream(handle)) {
                continue;
            }
            if let Some(code) = stream.code().and_then(|code| codes.get(code)) {
                if code.can_have_weak_objects()
                    && !code.embedded_objects_cleared()
                    && stream
                        .embedded_objects()
                        .any(|(_, object)| !is_live(HeapRef::Object(object)))
                {
                    code.set_marked_for_deoptimization("weak objects died");
                    cleared += stream.clear_embedded_objects();
                    code.set_embedded_objects_cleared();
                }
            }
            if let Some(data) = stream.deoptimization_data_mut() {
                cleared += data.literal_array_mut().clear_dead(is_live);
            }
        }

        for (handle, object) in objects.iter_mut() {
            if is_live(HeapRef::Object(handle)) {
                cleared += object
                    .dependent_code_mut()
                    .clear_dead(|code| is_live(HeapRef::Code(code)));
            }
        }
        if cleared > 0 {
            tracing::debug!(target: "otter::gc", cleared, "cleared weak references");
        }
        cleared
    }

    fn sweep(&mut self, marker: &Marker<HeapRef>) -> usize {
        let heap = &mut self.heap;
        let streams = heap
            .streams
            .sweep(|handle| marker.is_live(HeapRef::Stream(handle)));
        for (_, stream) in &streams {
            heap.code_ranges.unregister(stream.instruction_start());
        }
        streams.len()
            + heap.codes.sweep(|handle| marker.is_live(HeapRef::Code(handle))).len()
            + heap.objects.sweep(|handle| marker.is_live(HeapRef::Object(handle))).len()
            + heap
                .bytecodes
                .sweep(|handle| marker.is_live(HeapRef::Bytecode(handle)))
                .len()
    }

    /// Move every live instruction body, fix up calls between them and
    /// republish entry points. Returns the number of bodies moved.
    fn compact_code_space(&mut self) -> usize {
        let heap = &mut self.heap;
        let mut moves: Vec<Move> = Vec::with_capacity(heap.streams.len());
        // old bodies stay allocated until every target is rewritten, so no
        // fresh body can take over an address still being mapped
        let mut old_bodies = Vec::with_capacity(heap.streams.len());

        for handle in heap.streams.handles() {
            let Some(stream) = heap.streams.get_mut(handle) else {
                continue;
            };
            let old_start = stream.instruction_start();
            let old_end = stream.instruction_end();
            match stream.move_body() {
                Ok(old) => {
                    moves.push(Move {
                        stream: handle,
                        old_start,
                        old_end,
                        new_start: stream.instruction_start(),
                    });
                    old_bodies.push(old);
                }
                Err(error) => {
                    tracing::warn!(target: "otter::gc", %error, "code space compaction stopped early");
                    break;
                }
            }
        }
        moves.sort_by_key(|m| m.old_start);

        for (_, stream) in heap.streams.iter_mut() {
            stream.retarget_code_targets(|target| {
                find_move(&moves, target).map(|m| target - m.old_start + m.new_start)
            });
        }
        for m in &moves {
            heap.code_ranges.unregister(m.old_start);
        }
        for m in &moves {
            let Some(stream) = heap.streams.get(m.stream) else {
                continue;
            };
            heap.code_ranges
                .register(m.new_start, stream.instruction_end(), m.stream);
            if let Some(code) = stream.code().and_then(|code| heap.codes.get(code)) {
                code.update_code_entry_point(m.new_start);
            }
        }
        drop(old_bodies);

        tracing::debug!(target: "otter::gc", moved = moves.len(), "compacted code space");
        moves.len()
    }
}

/// One body moved by compaction
#[derive(Debug, Clone, Copy)]
struct Move {
    stream: Handle<InstructionStream>,
    old_start: Address,
    old_end: Address,
    new_start: Address,
}

/// Move whose old instructions contained `target`
fn find_move(moves: &[Move], target: Address) -> Option<&Move> {
    let index = moves
        .partition_point(|m| m.old_start <= target)
        .checked_sub(1)?;
    let m = &moves[index];
    (target < m.old_end).then_some(m)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn moved(old_start: Address, old_end: Address) -> Move {
        Move {
            stream: Handle::from_bits(0),
            old_start,
            old_end,
            new_start: old_start + 0x1000,
        }
    }

    #[test]
    fn test_find_move() {
        let moves = [moved(0x100, 0x120), moved(0x200, 0x240)];
        assert_eq!(find_move(&moves, 0x100).map(|m| m.old_start), Some(0x100));
        assert_eq!(find_move(&moves, 0x23f).map(|m| m.old_start), Some(0x200));
        assert!(find_move(&moves, 0x120).is_none());
        assert!(find_move(&moves, 0x80).is_none());
    }
}
