//! Tracing interface and the tri-color marker.
//!
//! Objects report their outgoing edges through a [`Visitor`]. Strong edges
//! keep the target alive; weak edges are reported so the owner can be
//! revisited after marking, but never gray their target.

use std::hash::Hash;

use rustc_hash::FxHashMap;

use crate::object::MarkColor;

/// How an edge participates in liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strength {
    /// Edge keeps the target alive
    Strong,
    /// Edge is cleared if the target dies
    Weak,
}

/// Receives edges from [`Trace::trace`].
pub trait Visitor<R> {
    /// Report one outgoing edge
    fn visit(&mut self, target: R, strength: Strength);
}

/// Implemented by heap objects that hold references of type `R`.
pub trait Trace<R> {
    /// Report every outgoing edge to `visitor`.
    fn trace(&self, visitor: &mut dyn Visitor<R>);
}

/// Tri-color marker over any copyable reference type.
///
/// Missing entries are white. Roots and newly discovered targets are gray
/// until [`Marker::run`] has scanned them, after which they are black.
#[derive(Debug)]
pub struct Marker<R> {
    colors: FxHashMap<R, MarkColor>,
    worklist: Vec<R>,
    weak_edges: usize,
}

impl<R: Copy + Eq + Hash> Default for Marker<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Copy + Eq + Hash> Marker<R> {
    /// Create a marker with every object white
    pub fn new() -> Self {
        Self {
            colors: FxHashMap::default(),
            worklist: Vec::new(),
            weak_edges: 0,
        }
    }

    /// Color of `target`
    pub fn color(&self, target: R) -> MarkColor {
        self.colors.get(&target).copied().unwrap_or(MarkColor::White)
    }

    /// Gray a root. Already-visited objects are left as they are.
    pub fn mark_root(&mut self, root: R) {
        self.shade(root);
    }

    fn shade(&mut self, target: R) {
        if self.color(target) == MarkColor::White {
            self.colors.insert(target, MarkColor::Gray);
            self.worklist.push(target);
        }
    }

    /// Drain the worklist, calling `scan` for every gray object.
    ///
    /// `scan` is expected to forward the object's edges to the visitor it
    /// receives, usually through [`Trace::trace`].
    pub fn run(&mut self, mut scan: impl FnMut(R, &mut dyn Visitor<R>)) {
        while let Some(object) = self.worklist.pop() {
            scan(object, self);
            self.colors.insert(object, MarkColor::Black);
        }
    }

    /// True once `target` has been reached from a root
    pub fn is_live(&self, target: R) -> bool {
        self.color(target) != MarkColor::White
    }

    /// Number of objects reached so far
    pub fn marked_count(&self) -> usize {
        self.colors.len()
    }

    /// Number of weak edges seen while scanning
    pub fn weak_edge_count(&self) -> usize {
        self.weak_edges
    }
}

impl<R: Copy + Eq + Hash> Visitor<R> for Marker<R> {
    fn visit(&mut self, target: R, strength: Strength) {
        match strength {
            Strength::Strong => self.shade(target),
            Strength::Weak => self.weak_edges += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Graph {
        edges: Vec<(u32, u32, Strength)>,
    }

    impl Graph {
        fn scan(&self, node: u32, visitor: &mut dyn Visitor<u32>) {
            for &(from, to, strength) in &self.edges {
                if from == node {
                    visitor.visit(to, strength);
                }
            }
        }
    }

    #[test]
    fn strong_edges_propagate_and_weak_edges_do_not() {
        let graph = Graph {
            edges: vec![
                (0, 1, Strength::Strong),
                (1, 2, Strength::Strong),
                (1, 3, Strength::Weak),
                (2, 0, Strength::Strong),
            ],
        };
        let mut marker = Marker::new();
        marker.mark_root(0);
        marker.run(|node, visitor| graph.scan(node, visitor));

        assert!(marker.is_live(0));
        assert!(marker.is_live(1));
        assert!(marker.is_live(2));
        assert!(!marker.is_live(3));
        assert_eq!(marker.color(2), MarkColor::Black);
        assert_eq!(marker.marked_count(), 3);
        assert_eq!(marker.weak_edge_count(), 1);
    }

    #[test]
    fn unreachable_cycle_stays_white() {
        let graph = Graph {
            edges: vec![(5, 6, Strength::Strong), (6, 5, Strength::Strong)],
        };
        let mut marker = Marker::new();
        marker.mark_root(1);
        marker.run(|node, visitor| graph.scan(node, visitor));

        assert!(!marker.is_live(5));
        assert!(!marker.is_live(6));
        assert_eq!(marker.color(5), MarkColor::White);
    }
}
