//! GC correctness tests
//!
//! Builds small object graphs in a `Space`, traces them with the `Marker`,
//! sweeps, and checks that weak references observe the outcome.

use otter_vm_gc::{Handle, Marker, Space, Strength, Trace, Visitor, Weak};

struct Node {
    value: i32,
    next: Option<Handle<Node>>,
    cache: Option<Weak<Node>>,
}

impl Node {
    fn leaf(value: i32) -> Self {
        Self {
            value,
            next: None,
            cache: None,
        }
    }
}

impl Trace<Handle<Node>> for Node {
    fn trace(&self, visitor: &mut dyn Visitor<Handle<Node>>) {
        if let Some(next) = self.next {
            visitor.visit(next, Strength::Strong);
        }
        if let Some(cache) = self.cache {
            visitor.visit(cache.as_handle_unchecked(), Strength::Weak);
        }
    }
}

fn collect(space: &mut Space<Node>, roots: &[Handle<Node>]) -> usize {
    let mut marker = Marker::new();
    for &root in roots {
        marker.mark_root(root);
    }
    marker.run(|handle, visitor| {
        if let Some(node) = space.get(handle) {
            node.trace(visitor);
        }
    });
    space.sweep(|handle| marker.is_live(handle)).len()
}

#[test]
fn test_collect_simple_garbage() {
    let mut space = Space::new("nodes");
    space.insert(Node::leaf(42));
    assert_eq!(space.len(), 1);

    let reclaimed = collect(&mut space, &[]);
    assert_eq!(reclaimed, 1);
    assert!(space.is_empty());
}

#[test]
fn test_circular_references_collected() {
    let mut space = Space::new("nodes");
    let a = space.insert(Node::leaf(1));
    let b = space.insert(Node::leaf(2));
    space.get_mut(a).unwrap().next = Some(b);
    space.get_mut(b).unwrap().next = Some(a);

    assert_eq!(collect(&mut space, &[]), 2);
    assert!(space.get(a).is_none());
    assert!(space.get(b).is_none());
}

#[test]
fn test_chain_kept_alive_by_root() {
    let mut space = Space::new("nodes");
    let tail = space.insert(Node::leaf(3));
    let mid = space.insert(Node {
        next: Some(tail),
        ..Node::leaf(2)
    });
    let head = space.insert(Node {
        next: Some(mid),
        ..Node::leaf(1)
    });
    let garbage = space.insert(Node::leaf(99));

    assert_eq!(collect(&mut space, &[head]), 1);
    assert!(space.get(garbage).is_none());
    assert_eq!(space.get(tail).map(|n| n.value), Some(3));
}

#[test]
fn test_weak_reference_does_not_retain() {
    let mut space = Space::new("nodes");
    let target = space.insert(Node::leaf(7));
    let holder = space.insert(Node {
        cache: Some(target.downgrade()),
        ..Node::leaf(0)
    });

    assert_eq!(collect(&mut space, &[holder]), 1);
    let weak = space.get(holder).unwrap().cache.unwrap();
    assert!(space.upgrade(weak).is_none());

    // A new object landing in the vacated slot is not reachable through the
    // stale weak reference.
    let reused = space.insert(Node::leaf(8));
    assert_eq!(reused.index(), target.index());
    assert!(space.upgrade(weak).is_none());
}

#[test]
fn test_weak_reference_survives_when_target_is_rooted() {
    let mut space = Space::new("nodes");
    let target = space.insert(Node::leaf(7));
    let holder = space.insert(Node {
        cache: Some(target.downgrade()),
        ..Node::leaf(0)
    });

    assert_eq!(collect(&mut space, &[holder, target]), 0);
    let weak = space.get(holder).unwrap().cache.unwrap();
    assert_eq!(space.upgrade(weak), Some(target));
}
