//! Root ownership and root replacement.
//!
//! A tree is owned through its root ref. The owner is a numbered slot in the
//! arena's root directory; the tree only remembers the slot index (a weak
//! link) and writes the new root ref there whenever the root changes.

#![allow(clippy::cast_possible_wrap)]

use crate::storage::arena::{Allocator, Ref};
use crate::storage::btree::handler::TreeInsert;
use crate::storage::btree::node::{
    InnerNode, NodeError, NodeForm, NodeType, Slot, create_node, read_header, read_slot,
};
use crate::storage::btree::tree::TreeError;

/// Weak back-reference from a root to the directory slot that records it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentLink {
    pub root_slot: usize,
}

/// The root of a tree together with its parent link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeRoot {
    pub node: Ref,
    pub parent: Option<ParentLink>,
}

impl TreeRoot {
    #[must_use]
    pub const fn new(node: Ref) -> Self {
        Self { node, parent: None }
    }

    /// Attach the root to directory slot `root_slot` and record it there.
    pub fn bind<A: Allocator + ?Sized>(&mut self, arena: &mut A, root_slot: usize) {
        self.parent = Some(ParentLink { root_slot });
        arena.set_root_slot(root_slot, self.node);
    }

    /// Make `new_root` the root of the tree.
    ///
    /// The parent link moves over to the new root and the owner is updated.
    /// The old root is not destroyed; it usually lives on as a child.
    pub fn replace<A: Allocator + ?Sized>(&mut self, arena: &mut A, new_root: Ref) {
        if let Some(link) = self.parent {
            arena.set_root_slot(link.root_slot, new_root);
        }
        self.node = new_root;
    }

    /// Grow the tree by one level after the root split into itself and
    /// `new_sibling`.
    ///
    /// The new root is compact only when the split came from an append and the
    /// old root was a leaf or a compact inner node; in that case every element
    /// of the old root is a full child. Otherwise an offsets node records the
    /// split point. Nothing is left allocated if this fails, and the root is
    /// unchanged.
    pub fn introduce_new_root<A: Allocator + ?Sized>(
        &mut self,
        arena: &mut A,
        new_sibling: Ref,
        state: &TreeInsert,
        is_append: bool,
    ) -> Result<Ref, TreeError> {
        let orig_root = self.node;
        let root_is_compact_or_leaf = match read_header(&*arena, orig_root)?.node_type {
            NodeType::Leaf => true,
            NodeType::Inner => matches!(Slot::decode(read_slot(&*arena, orig_root, 0)?)?, Slot::Count(_)),
            NodeType::Offsets => return Err(NodeError::WrongNodeType.into()),
        };
        let compact = is_append && root_is_compact_or_leaf;
        // A compact root only ever records full children
        debug_assert!(!compact || is_append, "compact root from a non-append split");

        let form = if compact {
            NodeForm::Compact {
                elems_per_child: state.split_offset,
            }
        } else {
            let offsets = create_node(arena, NodeType::Offsets, &[state.split_offset as i64])?;
            NodeForm::General { offsets }
        };

        let root = InnerNode {
            form,
            children: vec![orig_root, new_sibling],
            total: state.split_size,
        };
        let new_root = match root.create(arena) {
            Ok(new_root) => new_root,
            Err(e) => {
                if let NodeForm::General { offsets } = form {
                    arena.free(offsets);
                }
                return Err(e);
            }
        };

        tracing::debug!(
            "Introduced new root {} over {} and {} ({} elements, compact: {})",
            new_root,
            orig_root,
            new_sibling,
            state.split_size,
            compact
        );
        self.replace(arena, new_root);
        Ok(new_root)
    }
}
