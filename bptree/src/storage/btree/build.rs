//! Bulk construction of balanced trees.
//!
//! [`build`] creates a tree of minimal height bottom-up: leaves of
//! `max_node_size` elements (the last one possibly shorter), wrapped in
//! compact inner nodes level by level.
//!
//! # Failure handling
//!
//! A failed build leaves no trace in the arena. Each call frame owns the
//! nodes it has built so far (held in a local child list until they are
//! written into an inner node) and deep-frees them before returning the
//! error. Nested frames have already cleaned up after themselves.

use crate::storage::arena::{Allocator, Ref};
use crate::storage::btree::handler::CreateHandler;
use crate::storage::btree::node::{InnerNode, NodeForm, destroy_deep};
use crate::storage::btree::tree::TreeError;

/// Build a tree over the next `rest_size` elements.
///
/// With `fixed_height == 0` the tree grows until every element is consumed.
/// With `fixed_height > 0` it stops at exactly that height, consuming as many
/// elements as fit; this is how uniform-height siblings are produced.
///
/// Returns the root ref and the number of elements still left to consume.
pub fn build<A, H>(
    rest_size: usize,
    fixed_height: usize,
    arena: &mut A,
    handler: &mut H,
    max_node_size: usize,
) -> Result<(Ref, usize), TreeError>
where
    A: Allocator + ?Sized,
    H: CreateHandler<A> + ?Sized,
{
    debug_assert!(max_node_size >= 2, "fan-out must be at least 2");

    let orig_rest_size = rest_size;
    let mut rest_size = rest_size;
    let mut elems_per_child = max_node_size;
    let leaf_size = max_node_size.min(rest_size);
    rest_size -= leaf_size;
    let mut node = handler.create_leaf(arena, leaf_size)?;
    let mut height = 1;

    loop {
        let done = if fixed_height > 0 {
            fixed_height == height
        } else {
            rest_size == 0
        };
        if done {
            if fixed_height == 0 {
                tracing::debug!(
                    "Built tree of {} elements with height {}",
                    orig_rest_size,
                    height
                );
            }
            return Ok((node, rest_size));
        }

        let mut children = vec![node];
        while rest_size > 0 && children.len() != max_node_size {
            match build(rest_size, height, arena, handler, max_node_size) {
                Ok((child, rest)) => {
                    children.push(child);
                    rest_size = rest;
                }
                Err(e) => {
                    rollback(arena, &children, height, &e);
                    return Err(e);
                }
            }
        }

        let inner = InnerNode {
            form: NodeForm::Compact {
                elems_per_child: elems_per_child as u64,
            },
            children,
            total: (orig_rest_size - rest_size) as u64,
        };
        node = match inner.create(arena) {
            Ok(node_ref) => node_ref,
            Err(e) => {
                rollback(arena, &inner.children, height, &e);
                return Err(e);
            }
        };
        height += 1;
        elems_per_child = elems_per_child.saturating_mul(max_node_size);
    }
}

/// Deep-free the subtrees built so far by a failing frame.
fn rollback<A: Allocator + ?Sized>(arena: &mut A, subtrees: &[Ref], height: usize, error: &TreeError) {
    tracing::debug!(
        "Build failed at height {}: {}; freeing {} subtrees",
        height,
        error,
        subtrees.len()
    );
    for &subtree in subtrees {
        destroy_deep(arena, subtree);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::arena::{NodeSource, SlabArena};
    use crate::storage::btree::leaf::{IntegerCreateHandler, IntegerLeaf};
    use crate::storage::btree::node::{Slot, read_slots};
    use crate::storage::btree::tree::BpTree;
    use crate::storage::btree::NodeType;
    use crate::testing::FaultyArena;

    fn expected_height(n: usize, m: usize) -> usize {
        if n <= m {
            1
        } else {
            1 + expected_height(n.div_ceil(m), m)
        }
    }

    fn build_tree(arena: &mut SlabArena, n: usize, m: usize) -> BpTree<IntegerLeaf> {
        let mut handler = IntegerCreateHandler::new(0);
        let (root, rest) = build(n, 0, arena, &mut handler, m).expect("build");
        assert_eq!(rest, 0);
        BpTree::from_ref(root, m)
    }

    /// Check slot parity of every inner node below `node_ref`.
    fn assert_parity<S: NodeSource>(src: &S, node_ref: Ref) {
        let (header, slots) = read_slots(src, node_ref).expect("read");
        if header.node_type != NodeType::Inner {
            return;
        }
        let last = slots.len() - 1;
        for (i, &raw) in slots.iter().enumerate() {
            if i == 0 || i == last {
                assert_eq!(raw % 2, 1, "slot {i} of {node_ref} must be odd");
            } else {
                assert_eq!(raw % 2, 0, "slot {i} of {node_ref} must be even");
                assert_parity(src, raw as Ref);
            }
        }
    }

    #[test]
    fn test_build_empty() {
        let mut arena = SlabArena::for_node_size(4, 8);
        let tree = build_tree(&mut arena, 0, 4);

        assert!(tree.is_leaf(&arena).expect("is_leaf"));
        assert_eq!(tree.size(&arena).expect("size"), 0);
        assert_eq!(arena.allocated_count(), 1);
    }

    #[test]
    fn test_build_single_leaf() {
        let mut arena = SlabArena::for_node_size(4, 8);
        let tree = build_tree(&mut arena, 4, 4);

        assert!(tree.is_leaf(&arena).expect("is_leaf"));
        assert_eq!(tree.size(&arena).expect("size"), 4);
    }

    #[test]
    fn test_build_five_with_fan_out_two() {
        let mut arena = SlabArena::for_node_size(2, 32);
        let tree = build_tree(&mut arena, 5, 2);
        assert_eq!(tree.height(&arena).expect("height"), 3);

        let root = InnerNode::read(&arena, tree.root_ref()).expect("root");
        assert_eq!(root.form, NodeForm::Compact { elems_per_child: 4 });
        assert_eq!(root.total, 5);
        assert_eq!(root.children.len(), 2);

        let left = InnerNode::read(&arena, root.children[0]).expect("left");
        assert_eq!(left.form, NodeForm::Compact { elems_per_child: 2 });
        assert_eq!(left.total, 4);
        assert_eq!(left.children.len(), 2);

        // The short tail keeps uniform depth under a one-child inner node
        let right = InnerNode::read(&arena, root.children[1]).expect("right");
        assert_eq!(right.form, NodeForm::Compact { elems_per_child: 2 });
        assert_eq!(right.total, 1);
        assert_eq!(right.children.len(), 1);

        let mut leaf_sizes = Vec::new();
        tree.for_each_leaf(&arena, |_, size| leaf_sizes.push(size))
            .expect("leaves");
        assert_eq!(leaf_sizes, vec![2, 2, 1]);
    }

    #[test]
    fn test_build_heights_and_sizes() {
        for m in [2usize, 3, 4, 7] {
            for n in 0..120usize {
                let mut arena = SlabArena::for_node_size(m, 512);
                let tree = build_tree(&mut arena, n, m);

                assert_eq!(tree.height(&arena).expect("height"), expected_height(n, m), "n={n} m={m}");
                assert_eq!(tree.size(&arena).expect("size"), n as u64);

                let mut counted = 0;
                tree.for_each_leaf(&arena, |_, size| counted += size)
                    .expect("leaves");
                assert_eq!(counted, n as u64);

                tree.verify(&arena).expect("verify");
                assert_parity(&arena, tree.root_ref());
            }
        }
    }

    #[test]
    fn test_build_with_fixed_height() {
        let mut arena = SlabArena::for_node_size(2, 64);
        let mut handler = IntegerCreateHandler::new(0);

        // Height 2 with fan-out 2 holds at most 4 elements
        let (root, rest) = build(10, 2, &mut arena, &mut handler, 2).expect("build");
        assert_eq!(rest, 6);
        let node = InnerNode::read(&arena, root).expect("inner");
        assert_eq!(node.total, 4);

        // Fixed height is honored even when elements run out early
        let (root, rest) = build(1, 3, &mut arena, &mut handler, 2).expect("build");
        assert_eq!(rest, 0);
        let tree = BpTree::<IntegerLeaf>::from_ref(root, 2);
        assert_eq!(tree.height(&arena).expect("height"), 3);
        assert_eq!(tree.size(&arena).expect("size"), 1);
    }

    #[test]
    fn test_inner_nodes_hold_tagged_counts() {
        let mut arena = SlabArena::for_node_size(3, 64);
        let tree = build_tree(&mut arena, 20, 3);
        let (_, slots) = read_slots(&arena, tree.root_ref()).expect("slots");

        assert_eq!(Slot::decode(slots[0]), Ok(Slot::Count(9)));
        assert_eq!(Slot::decode(slots[slots.len() - 1]), Ok(Slot::Count(20)));
    }

    #[test]
    fn test_failed_build_leaks_nothing() {
        for m in [2usize, 3] {
            let n = 23;
            let mut fail_after = 0;
            loop {
                let mut arena = FaultyArena::failing_after(SlabArena::for_node_size(m, 256), fail_after);
                let mut handler = IntegerCreateHandler::new(0);
                match build(n, 0, &mut arena, &mut handler, m) {
                    Ok((root, _)) => {
                        assert!(arena.injected_failures() == 0);
                        let tree = BpTree::<IntegerLeaf>::from_ref(root, m);
                        assert_eq!(tree.size(&arena).expect("size"), n as u64);
                        break;
                    }
                    Err(e) => {
                        assert!(matches!(e, TreeError::Arena(_)));
                        assert_eq!(
                            arena.allocated_count(),
                            0,
                            "leak after failing allocation #{fail_after} with m={m}"
                        );
                    }
                }
                fail_after += 1;
            }
            assert!(fail_after > 0);
        }
    }
}
