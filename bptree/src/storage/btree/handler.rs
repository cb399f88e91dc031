//! Leaf plug-in points.
//!
//! The tree algorithms never look inside a leaf. Column types supply:
//! - a [`CreateHandler`] to make leaves during bulk builds,
//! - a [`SliceHandler`] to copy part of a leaf into an output stream,
//! - a [`LeafType`] for per-element access and insertion.

use crate::storage::arena::{Allocator, NodeSource, Ref};
use crate::storage::btree::tree::TreeError;
use crate::storage::stream::OutputStream;

/// Split bookkeeping passed up from a node that had to split.
///
/// After a split, the original node holds the first `split_offset` elements
/// and original plus new sibling together hold `split_size` elements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeInsert {
    pub split_offset: u64,
    pub split_size: u64,
}

/// Creates leaves for the tree builder.
pub trait CreateHandler<A: Allocator + ?Sized> {
    /// Create a leaf holding `size` elements and return its ref.
    fn create_leaf(&mut self, arena: &mut A, size: usize) -> Result<Ref, TreeError>;
}

/// Writes leaf sub-ranges for the subtree writer.
pub trait SliceHandler<S: NodeSource + ?Sized> {
    /// Write elements `offset..offset + size` of `leaf` to `out` as a new leaf.
    fn write_leaf_slice<O: OutputStream + ?Sized>(
        &mut self,
        src: &S,
        leaf: Ref,
        offset: u64,
        size: u64,
        out: &mut O,
    ) -> Result<Ref, TreeError>;
}

/// Element-level access to one kind of leaf.
pub trait LeafType {
    type Value: Copy;

    /// Create a leaf holding `values`.
    fn create<A: Allocator + ?Sized>(arena: &mut A, values: &[Self::Value]) -> Result<Ref, TreeError>;

    /// Number of elements in `leaf`.
    fn size<S: NodeSource + ?Sized>(src: &S, leaf: Ref) -> Result<u64, TreeError>;

    /// Element `ndx` of `leaf`.
    fn get<S: NodeSource + ?Sized>(src: &S, leaf: Ref, ndx: u64) -> Result<Self::Value, TreeError>;

    /// Overwrite element `ndx` of `leaf` in place.
    fn set<A: Allocator + ?Sized>(
        arena: &mut A,
        leaf: Ref,
        ndx: u64,
        value: Self::Value,
    ) -> Result<(), TreeError>;

    /// Insert `value` before element `ndx`.
    ///
    /// A leaf that already holds `max_node_size` elements splits: the new
    /// sibling's ref is returned and `state` describes the split. A split
    /// allocates exactly one node, the sibling, and allocates before it
    /// changes `leaf`; other inserts allocate nothing.
    fn insert<A: Allocator + ?Sized>(
        arena: &mut A,
        leaf: Ref,
        ndx: u64,
        value: Self::Value,
        max_node_size: usize,
        state: &mut TreeInsert,
    ) -> Result<Option<Ref>, TreeError>;
}
