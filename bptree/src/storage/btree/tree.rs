//! Tree accessor: element access, insertion and structural checks.
//!
//! [`BpTree`] wraps a root ref and interprets the nodes below it. It does not
//! own an arena; every operation takes the storage it needs, `&` for reads and
//! `&mut` for mutations.
//!
//! # Insertion
//!
//! Inserting at `ndx == size` is an append. Appends keep compact nodes compact
//! as long as every split happens at a full child boundary. Any other insert
//! converts the compact nodes on its path to general form first, so that the
//! offsets node can absorb an uneven split.
//!
//! A node that overflows splits at the insertion point: the original keeps
//! everything up to and including the child that split, the new sibling gets
//! the rest. A split that reaches the root introduces a new root.
//!
//! The nodes an insert may allocate are reserved before any node changes, so
//! an insert that fails for lack of space leaves the tree as it was.

#![allow(clippy::cast_possible_truncation)]

use std::marker::PhantomData;

use crate::storage::arena::{Allocator, ArenaError, NodeSource, Ref, block_size_for};
use crate::storage::btree::build::build;
use crate::storage::btree::handler::{CreateHandler, LeafType, SliceHandler, TreeInsert};
use crate::storage::btree::node::{
    InnerNode, NodeError, NodeForm, NodeType, create_node, cumulative_offsets, destroy_deep,
    offsets_slots, read_header, read_offsets, write_node,
};
use crate::storage::btree::reserve::Reservation;
use crate::storage::btree::root::{ParentLink, TreeRoot};
use crate::storage::btree::write::write_subtree;
use crate::storage::stream::OutputStream;

/// A B+-tree of `L` leaves living in an arena.
#[derive(Debug)]
pub struct BpTree<L> {
    root: TreeRoot,
    max_node_size: usize,
    _leaf: PhantomData<L>,
}

impl<L: LeafType> BpTree<L> {
    /// Create an empty tree: a single empty leaf.
    pub fn create<A: Allocator + ?Sized>(arena: &mut A, max_node_size: usize) -> Result<Self, TreeError> {
        let root = L::create(arena, &[])?;
        Ok(Self::from_ref(root, max_node_size))
    }

    /// Bulk-build a tree of `size` elements produced by `handler`.
    pub fn build<A, H>(
        arena: &mut A,
        handler: &mut H,
        size: usize,
        max_node_size: usize,
    ) -> Result<Self, TreeError>
    where
        A: Allocator + ?Sized,
        H: CreateHandler<A> + ?Sized,
    {
        let (root, _) = build(size, 0, arena, handler, max_node_size)?;
        Ok(Self::from_ref(root, max_node_size))
    }

    /// Attach to an existing tree.
    #[must_use]
    pub const fn from_ref(root: Ref, max_node_size: usize) -> Self {
        Self {
            root: TreeRoot::new(root),
            max_node_size,
            _leaf: PhantomData,
        }
    }

    /// Attach to the tree recorded in directory slot `root_slot`.
    pub fn from_parent<A: Allocator + ?Sized>(
        arena: &A,
        root_slot: usize,
        max_node_size: usize,
    ) -> Result<Self, TreeError> {
        let root = arena.root_slot(root_slot).ok_or(ArenaError::InvalidRef(0))?;
        let mut tree = Self::from_ref(root, max_node_size);
        tree.root.parent = Some(ParentLink { root_slot });
        Ok(tree)
    }

    /// Record the root in directory slot `root_slot` and keep it updated.
    pub fn bind<A: Allocator + ?Sized>(&mut self, arena: &mut A, root_slot: usize) {
        self.root.bind(arena, root_slot);
    }

    #[must_use]
    pub const fn root_ref(&self) -> Ref {
        self.root.node
    }

    #[must_use]
    pub const fn parent(&self) -> Option<ParentLink> {
        self.root.parent
    }

    #[must_use]
    pub const fn max_node_size(&self) -> usize {
        self.max_node_size
    }

    /// Check if the root is a leaf.
    pub fn is_leaf<S: NodeSource + ?Sized>(&self, src: &S) -> Result<bool, TreeError> {
        Ok(read_header(src, self.root.node)?.node_type == NodeType::Leaf)
    }

    /// Number of elements in the tree.
    pub fn size<S: NodeSource + ?Sized>(&self, src: &S) -> Result<u64, TreeError> {
        node_size::<L, S>(src, self.root.node)
    }

    /// Number of levels; a leaf root has height 1.
    pub fn height<S: NodeSource + ?Sized>(&self, src: &S) -> Result<usize, TreeError> {
        let mut node = self.root.node;
        let mut height = 1;
        while read_header(src, node)?.node_type == NodeType::Inner {
            node = InnerNode::read(src, node)?.children[0];
            height += 1;
        }
        Ok(height)
    }

    /// Element `ndx`.
    pub fn get<S: NodeSource + ?Sized>(&self, src: &S, ndx: u64) -> Result<L::Value, TreeError> {
        let (leaf, leaf_ndx) = find_leaf(src, self.root.node, ndx)?;
        L::get(src, leaf, leaf_ndx)
    }

    /// Overwrite element `ndx`.
    pub fn set<A: Allocator + ?Sized>(&self, arena: &mut A, ndx: u64, value: L::Value) -> Result<(), TreeError> {
        let (leaf, leaf_ndx) = find_leaf(&*arena, self.root.node, ndx)?;
        L::set(arena, leaf, leaf_ndx, value)
    }

    /// Append `value` after the last element.
    pub fn append<A: Allocator + ?Sized>(&mut self, arena: &mut A, value: L::Value) -> Result<(), TreeError> {
        let size = self.size(&*arena)?;
        self.insert(arena, size, value)
    }

    /// Insert `value` before element `ndx`; `ndx == size` appends.
    pub fn insert<A: Allocator + ?Sized>(
        &mut self,
        arena: &mut A,
        ndx: u64,
        value: L::Value,
    ) -> Result<(), TreeError> {
        let size = self.size(&*arena)?;
        if ndx > size {
            return Err(TreeError::IndexOutOfBounds { index: ndx, size });
        }
        let is_append = ndx == size;
        let mut state = TreeInsert::default();

        // Every block the insert may need is claimed before any node changes
        let needed = insert_allocations::<L, A>(&*arena, self.root.node, ndx, is_append, self.max_node_size)?;
        let mut reserved = Reservation::new(arena, needed, block_size_for(self.max_node_size))?;

        let Some(sibling) = insert_into::<L, _>(
            &mut reserved,
            self.root.node,
            ndx,
            value,
            is_append,
            self.max_node_size,
            &mut state,
        )?
        else {
            return Ok(());
        };
        if let Err(e) = self.root.introduce_new_root(&mut reserved, sibling, &state, is_append) {
            destroy_deep(&mut reserved, sibling);
            return Err(e);
        }
        Ok(())
    }

    /// Visit every leaf in element order with its element count.
    pub fn for_each_leaf<S, F>(&self, src: &S, mut visit: F) -> Result<(), TreeError>
    where
        S: NodeSource + ?Sized,
        F: FnMut(Ref, u64),
    {
        visit_leaves::<L, S, F>(src, self.root.node, &mut visit)
    }

    /// Collect every element in order.
    pub fn to_vec<S: NodeSource + ?Sized>(&self, src: &S) -> Result<Vec<L::Value>, TreeError> {
        let mut leaves = Vec::new();
        self.for_each_leaf(src, |leaf, size| leaves.push((leaf, size)))?;
        let mut values = Vec::new();
        for (leaf, size) in leaves {
            for ndx in 0..size {
                values.push(L::get(src, leaf, ndx)?);
            }
        }
        Ok(values)
    }

    /// Check the structure of the whole tree.
    ///
    /// Verifies uniform leaf depth, child counts, node forms and that every
    /// recorded element count matches the leaves below it. Returns the size.
    pub fn verify<S: NodeSource + ?Sized>(&self, src: &S) -> Result<u64, TreeError> {
        let mut leaf_depth = None;
        verify_node::<L, S>(src, self.root.node, self.max_node_size, 1, true, &mut leaf_depth)
    }

    /// Free every node of the tree and clear its directory slot.
    pub fn destroy<A: Allocator + ?Sized>(self, arena: &mut A) {
        destroy_deep(arena, self.root.node);
        if let Some(link) = self.root.parent {
            arena.set_root_slot(link.root_slot, 0);
        }
    }

    /// Write elements `offset..offset + size` to `out` as a standalone tree.
    ///
    /// Returns the ref of the written root within `out`.
    pub fn write<S, H, O>(
        &self,
        src: &S,
        offset: u64,
        size: u64,
        handler: &mut H,
        out: &mut O,
    ) -> Result<Ref, TreeError>
    where
        S: NodeSource + ?Sized,
        H: SliceHandler<S> + ?Sized,
        O: OutputStream + ?Sized,
    {
        let table_size = self.size(src)?;
        if self.is_leaf(src)? {
            let end = offset.checked_add(size).unwrap_or(u64::MAX);
            if end > table_size {
                return Err(TreeError::IndexOutOfBounds {
                    index: end,
                    size: table_size,
                });
            }
            return handler.write_leaf_slice(src, self.root.node, offset, size, out);
        }
        write_subtree(
            src,
            self.root.node,
            offset,
            size,
            table_size,
            handler,
            out,
            self.max_node_size,
        )
    }
}

fn node_size<L: LeafType, S: NodeSource + ?Sized>(src: &S, node: Ref) -> Result<u64, TreeError> {
    match read_header(src, node)?.node_type {
        NodeType::Leaf => L::size(src, node),
        NodeType::Inner => Ok(InnerNode::read(src, node)?.total),
        NodeType::Offsets => Err(NodeError::WrongNodeType.into()),
    }
}

/// Descend to the leaf holding element `ndx`.
fn find_leaf<S: NodeSource + ?Sized>(src: &S, root: Ref, ndx: u64) -> Result<(Ref, u64), TreeError> {
    let mut node = root;
    let mut ndx = ndx;
    while read_header(src, node)?.node_type == NodeType::Inner {
        let inner = InnerNode::read(src, node)?;
        let (child, child_ndx) = inner.find_child(src, ndx)?;
        node = inner.children[child];
        ndx = child_ndx;
    }
    Ok((node, ndx))
}

/// Upper bound on the number of nodes an insert at `ndx` allocates.
///
/// Walks the insert path without changing anything:
/// - a non-append converts every compact node on the path (one offsets node each)
/// - a full leaf splits off one sibling
/// - an inner node taking a sibling may need a new offsets node; if it is
///   full it also splits (right node plus its offsets node)
/// - a split reaching the root adds the new root and its offsets node
fn insert_allocations<L: LeafType, S: NodeSource + ?Sized>(
    src: &S,
    root: Ref,
    ndx: u64,
    is_append: bool,
    max_node_size: usize,
) -> Result<usize, TreeError> {
    let mut path = Vec::new();
    let mut node = root;
    let mut ndx = ndx;
    while read_header(src, node)?.node_type == NodeType::Inner {
        let inner = InnerNode::read(src, node)?;
        let (child, child_ndx) = if is_append {
            let last = inner.children.len() - 1;
            (last, inner.child_sizes(src)?[last])
        } else {
            inner.find_child(src, ndx)?
        };
        path.push((inner.is_compact(), inner.children.len()));
        node = inner.children[child];
        ndx = child_ndx;
    }

    let mut count = if is_append {
        0
    } else {
        path.iter().filter(|&&(compact, _)| compact).count()
    };
    let mut splits = L::size(src, node)? >= max_node_size as u64;
    if splits {
        count += 1;
    }
    for &(compact, children) in path.iter().rev() {
        if !splits {
            break;
        }
        // Non-appends have converted the whole path to general form
        let compact = compact && is_append;
        if children < max_node_size {
            count += usize::from(compact);
            splits = false;
        } else {
            count += if compact { 3 } else { 2 };
        }
    }
    if splits {
        count += 2;
    }
    Ok(count)
}

fn visit_leaves<L, S, F>(src: &S, node: Ref, visit: &mut F) -> Result<(), TreeError>
where
    L: LeafType,
    S: NodeSource + ?Sized,
    F: FnMut(Ref, u64),
{
    if read_header(src, node)?.node_type == NodeType::Leaf {
        visit(node, L::size(src, node)?);
        return Ok(());
    }
    for child in InnerNode::read(src, node)?.children {
        visit_leaves::<L, S, F>(src, child, visit)?;
    }
    Ok(())
}

/// Insert into the subtree at `node`. Returns the new sibling if `node` split.
fn insert_into<L: LeafType, A: Allocator + ?Sized>(
    arena: &mut A,
    node: Ref,
    ndx: u64,
    value: L::Value,
    is_append: bool,
    max_node_size: usize,
    state: &mut TreeInsert,
) -> Result<Option<Ref>, TreeError> {
    if read_header(&*arena, node)?.node_type == NodeType::Leaf {
        return L::insert(arena, node, ndx, value, max_node_size, state);
    }

    let mut inner = InnerNode::read(&*arena, node)?;
    if !is_append && inner.is_compact() {
        convert_to_general(arena, node, &mut inner)?;
    }
    let mut sizes = inner.child_sizes(&*arena)?;
    let (child, child_ndx) = if is_append {
        let last = inner.children.len() - 1;
        (last, sizes[last])
    } else {
        inner.find_child(&*arena, ndx)?
    };

    let split = insert_into::<L, A>(
        arena,
        inner.children[child],
        child_ndx,
        value,
        is_append,
        max_node_size,
        state,
    )?;
    let Some(sibling) = split else {
        sizes[child] += 1;
        inner.total += 1;
        store_inner(arena, node, &inner, &sizes)?;
        return Ok(None);
    };

    match absorb_split(
        arena,
        node,
        inner,
        sizes,
        child,
        sibling,
        is_append,
        max_node_size,
        state,
    ) {
        Ok(new_sibling) => Ok(new_sibling),
        Err(e) => {
            destroy_deep(arena, sibling);
            Err(e)
        }
    }
}

/// Give a compact node an offsets node describing its current children.
fn convert_to_general<A: Allocator + ?Sized>(
    arena: &mut A,
    node: Ref,
    inner: &mut InnerNode,
) -> Result<(), TreeError> {
    let sizes = inner.child_sizes(&*arena)?;
    let offsets = create_node(arena, NodeType::Offsets, &offsets_slots(&cumulative_offsets(&sizes)))?;
    let general = InnerNode {
        form: NodeForm::General { offsets },
        children: inner.children.clone(),
        total: inner.total,
    };
    if let Err(e) = general.write(arena, node) {
        arena.free(offsets);
        return Err(e);
    }
    *inner = general;
    Ok(())
}

/// Rewrite `node` in its current form with updated child sizes.
fn store_inner<A: Allocator + ?Sized>(
    arena: &mut A,
    node: Ref,
    inner: &InnerNode,
    sizes: &[u64],
) -> Result<(), TreeError> {
    if let NodeForm::General { offsets } = inner.form {
        write_node(arena, offsets, NodeType::Offsets, &offsets_slots(&cumulative_offsets(sizes)))?;
    }
    inner.write(arena, node)
}

/// Link `sibling` in after child `child`, splitting `node` if it overflows.
///
/// On failure nothing allocated here survives and `sibling` is left to the
/// caller.
#[allow(clippy::too_many_arguments)]
fn absorb_split<A: Allocator + ?Sized>(
    arena: &mut A,
    node: Ref,
    inner: InnerNode,
    mut sizes: Vec<u64>,
    child: usize,
    sibling: Ref,
    is_append: bool,
    max_node_size: usize,
    state: &mut TreeInsert,
) -> Result<Option<Ref>, TreeError> {
    let elems_before: u64 = sizes[..child].iter().sum();
    let old_form = inner.form;
    let mut children = inner.children;
    let total = inner.total + 1;

    sizes[child] = state.split_offset;
    sizes.insert(child + 1, state.split_size - state.split_offset);
    children.insert(child + 1, sibling);

    let stays_compact = matches!(
        old_form,
        NodeForm::Compact { elems_per_child } if is_append && state.split_offset == elems_per_child
    );

    if children.len() <= max_node_size {
        let form = if stays_compact {
            old_form
        } else {
            general_form(arena, old_form, &sizes)?
        };
        let updated = InnerNode {
            form,
            children,
            total,
        };
        return write_or_release(arena, node, &updated, old_form).map(|()| None);
    }

    // Split at the insertion point
    let right_children = children.split_off(child + 1);
    let right_sizes = sizes.split_off(child + 1);
    let left_total = elems_before + state.split_offset;

    // The right node is fully allocated before the left one is touched
    let right_form = if stays_compact {
        old_form
    } else {
        let offsets = create_node(
            arena,
            NodeType::Offsets,
            &offsets_slots(&cumulative_offsets(&right_sizes)),
        )?;
        NodeForm::General { offsets }
    };
    let right = InnerNode {
        form: right_form,
        children: right_children,
        total: total - left_total,
    };
    let right_ref = match right.create(arena) {
        Ok(right_ref) => right_ref,
        Err(e) => {
            if let NodeForm::General { offsets } = right_form {
                arena.free(offsets);
            }
            return Err(e);
        }
    };
    // Only the sibling's own nodes are freed on failure; its children are
    // still referenced by the unsplit node.
    let release_right = move |arena: &mut A| {
        arena.free(right_ref);
        if let NodeForm::General { offsets } = right_form {
            arena.free(offsets);
        }
    };

    let left_form = if stays_compact {
        old_form
    } else {
        match general_form(arena, old_form, &sizes) {
            Ok(form) => form,
            Err(e) => {
                release_right(arena);
                return Err(e);
            }
        }
    };
    let left = InnerNode {
        form: left_form,
        children,
        total: left_total,
    };
    if let Err(e) = write_or_release(arena, node, &left, old_form) {
        release_right(arena);
        return Err(e);
    }

    state.split_offset = left_total;
    state.split_size = total;
    Ok(Some(right_ref))
}

/// General form for a node with child `sizes`, reusing its offsets node when
/// it already has one.
fn general_form<A: Allocator + ?Sized>(arena: &mut A, old_form: NodeForm, sizes: &[u64]) -> Result<NodeForm, TreeError> {
    let slots = offsets_slots(&cumulative_offsets(sizes));
    match old_form {
        NodeForm::General { offsets } => {
            write_node(arena, offsets, NodeType::Offsets, &slots)?;
            Ok(old_form)
        }
        NodeForm::Compact { .. } => {
            let offsets = create_node(arena, NodeType::Offsets, &slots)?;
            Ok(NodeForm::General { offsets })
        }
    }
}

/// Free an offsets node created by [`general_form`] for a formerly compact node.
fn release_new_offsets<A: Allocator + ?Sized>(arena: &mut A, new_form: NodeForm, old_form: NodeForm) {
    if let (NodeForm::General { offsets }, NodeForm::Compact { .. }) = (new_form, old_form) {
        arena.free(offsets);
    }
}

fn write_or_release<A: Allocator + ?Sized>(
    arena: &mut A,
    node: Ref,
    inner: &InnerNode,
    old_form: NodeForm,
) -> Result<(), TreeError> {
    inner.write(arena, node).inspect_err(|_| release_new_offsets(arena, inner.form, old_form))
}

fn inconsistent(node: Ref, reason: impl Into<String>) -> TreeError {
    TreeError::Inconsistent {
        node,
        reason: reason.into(),
    }
}

/// Verify the subtree at `node` and return its element count.
fn verify_node<L: LeafType, S: NodeSource + ?Sized>(
    src: &S,
    node: Ref,
    max_node_size: usize,
    depth: usize,
    is_root: bool,
    leaf_depth: &mut Option<usize>,
) -> Result<u64, TreeError> {
    let header = read_header(src, node)?;
    match header.node_type {
        NodeType::Leaf => {
            let size = L::size(src, node)?;
            if size > max_node_size as u64 {
                return Err(inconsistent(node, format!("leaf holds {size} elements")));
            }
            if size == 0 && !is_root {
                return Err(inconsistent(node, "empty non-root leaf"));
            }
            match *leaf_depth {
                None => *leaf_depth = Some(depth),
                Some(expected) if expected != depth => {
                    return Err(inconsistent(
                        node,
                        format!("leaf at depth {depth}, expected {expected}"),
                    ));
                }
                Some(_) => {}
            }
            Ok(size)
        }
        NodeType::Inner => {
            if !header.has_refs() {
                return Err(inconsistent(node, "inner node without has-refs flag"));
            }
            let inner = InnerNode::read(src, node)?;
            if inner.children.len() > max_node_size {
                return Err(inconsistent(
                    node,
                    format!("{} children", inner.children.len()),
                ));
            }

            let mut actual = Vec::with_capacity(inner.children.len());
            for &child in &inner.children {
                actual.push(verify_node::<L, S>(
                    src,
                    child,
                    max_node_size,
                    depth + 1,
                    false,
                    leaf_depth,
                )?);
            }
            let total: u64 = actual.iter().sum();
            if total != inner.total {
                return Err(inconsistent(
                    node,
                    format!("records {} elements, children hold {total}", inner.total),
                ));
            }

            match inner.form {
                NodeForm::Compact { elems_per_child } => {
                    let (last, rest) = actual
                        .split_last()
                        .ok_or_else(|| inconsistent(node, "no children"))?;
                    if rest.iter().any(|&size| size != elems_per_child) || *last > elems_per_child {
                        return Err(inconsistent(
                            node,
                            format!("compact node with {elems_per_child} per child holds {actual:?}"),
                        ));
                    }
                }
                NodeForm::General { offsets } => {
                    if read_header(src, offsets)?.has_refs() {
                        return Err(inconsistent(offsets, "offsets node with has-refs flag"));
                    }
                    let recorded = read_offsets(src, offsets)?;
                    if recorded != cumulative_offsets(&actual) {
                        return Err(inconsistent(
                            node,
                            format!("offsets {recorded:?} do not match child sizes {actual:?}"),
                        ));
                    }
                }
            }
            Ok(total)
        }
        NodeType::Offsets => Err(NodeError::WrongNodeType.into()),
    }
}

/// Errors that can occur in tree operations.
#[derive(Debug)]
pub enum TreeError {
    /// Arena error (allocation failure, bad ref).
    Arena(ArenaError),
    /// Node decoding error.
    Node(NodeError),
    /// Element index past the end.
    IndexOutOfBounds { index: u64, size: u64 },
    /// Structural check failed.
    Inconsistent { node: Ref, reason: String },
}

impl std::fmt::Display for TreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Arena(e) => write!(f, "arena error: {e}"),
            Self::Node(e) => write!(f, "node error: {e}"),
            Self::IndexOutOfBounds { index, size } => {
                write!(f, "index {index} out of bounds (size {size})")
            }
            Self::Inconsistent { node, reason } => {
                write!(f, "inconsistent node {node}: {reason}")
            }
        }
    }
}

impl std::error::Error for TreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Arena(e) => Some(e),
            Self::Node(e) => Some(e),
            Self::IndexOutOfBounds { .. } | Self::Inconsistent { .. } => None,
        }
    }
}

impl From<ArenaError> for TreeError {
    fn from(e: ArenaError) -> Self {
        Self::Arena(e)
    }
}

impl From<NodeError> for TreeError {
    fn from(e: NodeError) -> Self {
        Self::Node(e)
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::storage::arena::SlabArena;
    use crate::storage::btree::leaf::{IntegerCreateHandler, IntegerLeaf, IntegerSliceHandler};
    use crate::storage::stream::MemoryOutputStream;
    use crate::testing::{FaultConfig, FaultyArena};

    type IntTree = BpTree<IntegerLeaf>;

    fn filled(arena: &mut SlabArena, n: usize, m: usize) -> IntTree {
        let mut tree = IntTree::create(arena, m).expect("create");
        for v in 0..n as i64 {
            tree.append(arena, v).expect("append");
        }
        tree
    }

    #[test]
    fn test_empty_tree() {
        let mut arena = SlabArena::for_node_size(4, 16);
        let tree = IntTree::create(&mut arena, 4).expect("create");

        assert!(tree.is_leaf(&arena).expect("is_leaf"));
        assert_eq!(tree.size(&arena).expect("size"), 0);
        assert_eq!(tree.height(&arena).expect("height"), 1);
        assert!(matches!(
            tree.get(&arena, 0),
            Err(TreeError::IndexOutOfBounds { index: 0, size: 0 })
        ));
        assert_eq!(tree.verify(&arena).expect("verify"), 0);
    }

    #[test]
    fn test_appends_stay_compact() {
        let mut arena = SlabArena::for_node_size(2, 256);
        let tree = filled(&mut arena, 37, 2);

        assert_eq!(tree.to_vec(&arena).expect("values"), (0..37).collect::<Vec<_>>());
        assert_eq!(tree.verify(&arena).expect("verify"), 37);

        // No offsets nodes anywhere: every inner node is compact
        fn all_compact(arena: &SlabArena, node: Ref) -> bool {
            let Ok(inner) = InnerNode::read(arena, node) else {
                return true;
            };
            inner.is_compact() && inner.children.iter().all(|&c| all_compact(arena, c))
        }
        assert!(all_compact(&arena, tree.root_ref()));
    }

    #[test]
    fn test_first_append_split_introduces_compact_root() {
        let mut arena = SlabArena::for_node_size(2, 16);
        let tree = filled(&mut arena, 3, 2);

        let root = InnerNode::read(&arena, tree.root_ref()).expect("root");
        assert_eq!(root.form, NodeForm::Compact { elems_per_child: 2 });
        assert_eq!(root.total, 3);
        assert_eq!(tree.height(&arena).expect("height"), 2);
    }

    #[test]
    fn test_middle_insert_converts_to_general() {
        let mut arena = SlabArena::for_node_size(2, 64);
        let mut tree = filled(&mut arena, 4, 2);

        tree.insert(&mut arena, 1, 100).expect("insert");
        assert_eq!(tree.to_vec(&arena).expect("values"), vec![0, 100, 1, 2, 3]);
        assert!(!InnerNode::read(&arena, tree.root_ref()).expect("root").is_compact());
        tree.verify(&arena).expect("verify");
    }

    #[test]
    fn test_insert_into_leaf_root_split() {
        let mut arena = SlabArena::for_node_size(3, 16);
        let mut tree = filled(&mut arena, 3, 3);

        tree.insert(&mut arena, 0, -1).expect("insert");
        assert_eq!(tree.to_vec(&arena).expect("values"), vec![-1, 0, 1, 2]);

        let root = InnerNode::read(&arena, tree.root_ref()).expect("root");
        assert_eq!(root.child_sizes(&arena).expect("sizes"), vec![1, 3]);
        assert!(!root.is_compact());
    }

    #[test]
    fn test_set_and_get_across_leaves() {
        let mut arena = SlabArena::for_node_size(3, 128);
        let tree = filled(&mut arena, 50, 3);

        for ndx in (0..50).step_by(7) {
            tree.set(&mut arena, ndx, -(ndx as i64)).expect("set");
        }
        for ndx in 0..50u64 {
            let expected = if ndx % 7 == 0 { -(ndx as i64) } else { ndx as i64 };
            assert_eq!(tree.get(&arena, ndx).expect("get"), expected);
        }
        assert!(tree.set(&mut arena, 50, 0).is_err());
    }

    #[test]
    fn test_insert_out_of_bounds() {
        let mut arena = SlabArena::for_node_size(2, 16);
        let mut tree = filled(&mut arena, 3, 2);
        assert!(matches!(
            tree.insert(&mut arena, 4, 0),
            Err(TreeError::IndexOutOfBounds { index: 4, size: 3 })
        ));
    }

    #[test]
    fn test_root_changes_are_tracked_in_directory() {
        let mut arena = SlabArena::for_node_size(2, 64);
        let mut tree = IntTree::create(&mut arena, 2).expect("create");
        tree.bind(&mut arena, 5);

        for v in 0..10 {
            tree.append(&mut arena, v).expect("append");
            assert_eq!(arena.root_slot(5), Some(tree.root_ref()));
        }

        let reopened = IntTree::from_parent(&arena, 5, 2).expect("reopen");
        assert_eq!(reopened.to_vec(&arena).expect("values"), (0..10).collect::<Vec<_>>());
        assert_eq!(reopened.parent(), Some(ParentLink { root_slot: 5 }));

        reopened.destroy(&mut arena);
        assert_eq!(arena.allocated_count(), 0);
        assert_eq!(arena.root_slot(5), None);
    }

    #[test]
    fn test_random_inserts_match_vec() {
        for (seed, m) in [(1u64, 2usize), (2, 3), (3, 4), (4, 5)] {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut arena = SlabArena::for_node_size(m, 4096);
            let mut tree = IntTree::create(&mut arena, m).expect("create");
            let mut oracle: Vec<i64> = Vec::new();

            for step in 0..400 {
                let value = rng.random_range(-1000..1000);
                let ndx = if rng.random::<f64>() < 0.3 {
                    oracle.len()
                } else {
                    rng.random_range(0..=oracle.len())
                };
                tree.insert(&mut arena, ndx as u64, value).expect("insert");
                oracle.insert(ndx, value);

                let size = tree.verify(&arena).unwrap_or_else(|e| panic!("seed {seed} step {step}: {e}"));
                assert_eq!(size, oracle.len() as u64);
            }
            assert_eq!(tree.to_vec(&arena).expect("values"), oracle);
            for probe in 0..20 {
                let ndx = rng.random_range(0..oracle.len());
                assert_eq!(tree.get(&arena, ndx as u64).expect("get"), oracle[ndx], "probe {probe}");
            }

            tree.destroy(&mut arena);
            assert_eq!(arena.allocated_count(), 0);
        }
    }

    #[test]
    fn test_inserts_into_built_tree() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut arena = SlabArena::for_node_size(3, 2048);
        let mut handler = IntegerCreateHandler::new(7);
        let mut tree = IntTree::build(&mut arena, &mut handler, 40, 3).expect("build");
        let mut oracle = vec![7i64; 40];

        for _ in 0..200 {
            let ndx = rng.random_range(0..=oracle.len());
            let value = rng.random_range(0..100);
            tree.insert(&mut arena, ndx as u64, value).expect("insert");
            oracle.insert(ndx, value);
        }
        tree.verify(&arena).expect("verify");
        assert_eq!(tree.to_vec(&arena).expect("values"), oracle);
    }

    /// Fail the insert at every allocation it makes, one attempt per
    /// allocation count, and check that each failure leaves the tree exactly
    /// as it was. Returns the height after the first attempt that succeeds.
    fn insert_under_faults(make: impl Fn() -> (SlabArena, IntTree), ndx: u64, value: i64) -> (usize, usize) {
        for successes in 0..64 {
            let (base, mut tree) = make();
            let before = tree.to_vec(&base).expect("values");
            let before_nodes = base.allocated_count();
            let before_height = tree.height(&base).expect("height");

            let mut arena = FaultyArena::failing_after(base, successes);
            match tree.insert(&mut arena, ndx, value) {
                Ok(()) => {
                    let mut expected = before;
                    expected.insert(ndx as usize, value);
                    assert_eq!(tree.to_vec(&arena).expect("values"), expected);
                    assert_eq!(tree.verify(&arena).expect("verify"), expected.len() as u64);
                    let mut reachable = 0;
                    count_nodes(&arena, tree.root_ref(), &mut reachable);
                    assert_eq!(arena.allocated_count(), reachable);
                    return (before_height, tree.height(&arena).expect("height"));
                }
                Err(e) => {
                    assert!(matches!(e, TreeError::Arena(_)), "after {successes}: {e}");
                    assert_eq!(tree.to_vec(&arena).expect("values"), before, "after {successes}");
                    assert_eq!(tree.verify(&arena).expect("verify"), before.len() as u64, "after {successes}");
                    assert_eq!(arena.allocated_count(), before_nodes, "after {successes}");
                }
            }
        }
        panic!("insert at {ndx} never succeeded");
    }

    #[test]
    fn test_failed_inserts_leave_tree_unchanged() {
        // Full two-level tree of fan-out 2: most inserts split up to the root
        let full = || {
            let mut arena = SlabArena::for_node_size(2, 128);
            let tree = filled(&mut arena, 8, 2);
            (arena, tree)
        };
        for ndx in [0, 1, 3, 4, 7] {
            let (before, after) = insert_under_faults(full, ndx, 100);
            assert_eq!(after, before + 1, "insert at {ndx}");
        }
        // Append through compact nodes, splitting every level
        let (before, after) = insert_under_faults(full, 8, 100);
        assert_eq!(after, before + 1);

        // A full leaf root
        let leaf_root = || {
            let mut arena = SlabArena::for_node_size(3, 16);
            let tree = filled(&mut arena, 3, 3);
            (arena, tree)
        };
        assert_eq!(insert_under_faults(leaf_root, 0, -1), (1, 2));
        assert_eq!(insert_under_faults(leaf_root, 3, -1), (1, 2));

        // The root has room, so splits stop below it
        let partial = || {
            let mut arena = SlabArena::for_node_size(4, 64);
            let tree = filled(&mut arena, 20, 4);
            (arena, tree)
        };
        for ndx in [0, 5, 13, 19, 20] {
            let (before, after) = insert_under_faults(partial, ndx, 100);
            assert_eq!(after, before, "insert at {ndx}");
        }

        let built = || {
            let mut arena = SlabArena::for_node_size(3, 256);
            let mut handler = IntegerCreateHandler::new(7);
            let mut tree = IntTree::build(&mut arena, &mut handler, 27, 3).expect("build");
            for ndx in 0..27 {
                tree.set(&mut arena, ndx, ndx as i64).expect("set");
            }
            (arena, tree)
        };
        for ndx in [0, 13, 26, 27] {
            let (before, after) = insert_under_faults(built, ndx, 100);
            assert_eq!(after, before + 1, "insert at {ndx}");
        }
    }

    #[test]
    fn test_random_failed_inserts_leave_tree_unchanged() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut arena = FaultyArena::new(SlabArena::for_node_size(3, 1024), 7, FaultConfig::no_faults());
        let mut tree = IntTree::create(&mut arena, 3).expect("create");
        let mut oracle = Vec::new();
        arena.set_fault_config(FaultConfig::random(0.3));

        for _ in 0..400 {
            let ndx = rng.random_range(0..=oracle.len());
            let value = rng.random_range(0..1000);
            match tree.insert(&mut arena, ndx as u64, value) {
                Ok(()) => oracle.insert(ndx, value),
                Err(e) => assert!(matches!(e, TreeError::Arena(_)), "{e}"),
            }
            assert_eq!(tree.to_vec(&arena).expect("values"), oracle);
        }
        assert_eq!(tree.verify(&arena).expect("verify"), oracle.len() as u64);
        let mut reachable = 0;
        count_nodes(&arena, tree.root_ref(), &mut reachable);
        assert_eq!(arena.allocated_count(), reachable);
    }

    fn count_nodes<S: NodeSource>(src: &S, node: Ref, count: &mut usize) {
        *count += 1;
        if let Ok(inner) = InnerNode::read(src, node) {
            if let NodeForm::General { .. } = inner.form {
                *count += 1;
            }
            for child in inner.children {
                count_nodes(src, child, count);
            }
        }
    }

    #[test]
    fn test_write_leaf_root() {
        let mut arena = SlabArena::for_node_size(8, 16);
        let tree = filled(&mut arena, 5, 8);
        let mut out = MemoryOutputStream::new();

        let written = tree
            .write(&arena, 1, 3, &mut IntegerSliceHandler, &mut out)
            .expect("write");
        let copy = IntTree::from_ref(written, 8);
        assert_eq!(copy.to_vec(&out).expect("values"), vec![1, 2, 3]);

        assert!(matches!(
            tree.write(&arena, 3, 3, &mut IntegerSliceHandler, &mut out),
            Err(TreeError::IndexOutOfBounds { index: 6, size: 5 })
        ));
    }

    #[test]
    fn test_error_display() {
        let error = TreeError::IndexOutOfBounds { index: 5, size: 3 };
        assert_eq!(error.to_string(), "index 5 out of bounds (size 3)");

        let error = TreeError::from(NodeError::NodeFull);
        assert_eq!(error.to_string(), "node error: node is full");
    }
}
