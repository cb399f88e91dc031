//! Subtree writer: serialize a contiguous slice of a tree.
//!
//! Used for compaction. Only the leaves overlapping the slice are visited;
//! the slice handler copies the overlapping part of each one to the output
//! stream. Parents are then rebuilt level by level from the written pieces,
//! at most `max_node_size` children per node, until a single root remains.

use crate::storage::arena::{NodeSource, Ref};
use crate::storage::btree::handler::SliceHandler;
use crate::storage::btree::node::{
    InnerNode, NodeError, NodeForm, NodeType, cumulative_offsets, encode_node, offsets_slots,
    read_header,
};
use crate::storage::btree::tree::TreeError;
use crate::storage::stream::OutputStream;

/// A node already written to the output stream.
#[derive(Debug, Clone, Copy)]
struct Written {
    node: Ref,
    size: u64,
    /// Leaf or compact inner node.
    compact: bool,
}

/// Write elements `offset..offset + size` of the tree rooted at the inner
/// node `root` to `out`.
///
/// `table_size` must be the number of elements in the tree. Returns the ref
/// of the new root within `out`; a slice that fits in one leaf is returned as
/// that leaf, and an empty slice as an empty leaf.
#[allow(clippy::too_many_arguments)]
pub fn write_subtree<S, H, O>(
    src: &S,
    root: Ref,
    offset: u64,
    size: u64,
    table_size: u64,
    handler: &mut H,
    out: &mut O,
    max_node_size: usize,
) -> Result<Ref, TreeError>
where
    S: NodeSource + ?Sized,
    H: SliceHandler<S> + ?Sized,
    O: OutputStream + ?Sized,
{
    if read_header(src, root)?.node_type != NodeType::Inner {
        return Err(NodeError::WrongNodeType.into());
    }
    let tree = InnerNode::read(src, root)?;
    if table_size != tree.total {
        return Err(TreeError::IndexOutOfBounds {
            index: table_size,
            size: tree.total,
        });
    }
    let end = offset.checked_add(size).unwrap_or(u64::MAX);
    if end > table_size {
        return Err(TreeError::IndexOutOfBounds {
            index: end,
            size: table_size,
        });
    }

    if size == 0 {
        let leaf = first_leaf(src, root)?;
        return handler.write_leaf_slice(src, leaf, 0, 0, out);
    }

    let mut level = Vec::new();
    write_leaves(src, root, 0, offset, end, handler, out, &mut level)?;
    let leaves = level.len();

    let mut height = 1;
    while level.len() > 1 {
        level = level
            .chunks(max_node_size)
            .map(|chunk| write_parent(chunk, out))
            .collect();
        height += 1;
    }

    tracing::debug!(
        "Wrote slice {}..{} as {} leaves, height {}",
        offset,
        end,
        leaves,
        height
    );
    // The slice is non-empty, so at least one leaf was written
    level
        .first()
        .map(|written| written.node)
        .ok_or(NodeError::InvalidHeader.into())
}

fn first_leaf<S: NodeSource + ?Sized>(src: &S, root: Ref) -> Result<Ref, TreeError> {
    let mut node = root;
    while read_header(src, node)?.node_type == NodeType::Inner {
        node = InnerNode::read(src, node)?.children[0];
    }
    Ok(node)
}

/// Write the parts of the leaves below `node` that overlap `start..end`.
///
/// `node_start` is the element index of the first element below `node`.
#[allow(clippy::too_many_arguments)]
fn write_leaves<S, H, O>(
    src: &S,
    node: Ref,
    node_start: u64,
    start: u64,
    end: u64,
    handler: &mut H,
    out: &mut O,
    written: &mut Vec<Written>,
) -> Result<(), TreeError>
where
    S: NodeSource + ?Sized,
    H: SliceHandler<S> + ?Sized,
    O: OutputStream + ?Sized,
{
    match read_header(src, node)?.node_type {
        NodeType::Leaf => {
            let from = start.max(node_start) - node_start;
            let to = end - node_start;
            let leaf = handler.write_leaf_slice(src, node, from, to - from, out)?;
            written.push(Written {
                node: leaf,
                size: to - from,
                compact: true,
            });
            Ok(())
        }
        NodeType::Inner => {
            let inner = InnerNode::read(src, node)?;
            let sizes = inner.child_sizes(src)?;
            let mut child_start = node_start;
            for (&child, &child_size) in inner.children.iter().zip(&sizes) {
                let child_end = child_start + child_size;
                if child_end > start && child_start < end {
                    write_leaves(
                        src,
                        child,
                        child_start,
                        start,
                        end.min(child_end),
                        handler,
                        out,
                        written,
                    )?;
                }
                if child_end >= end {
                    break;
                }
                child_start = child_end;
            }
            Ok(())
        }
        NodeType::Offsets => Err(NodeError::WrongNodeType.into()),
    }
}

/// Write one parent over `children`.
///
/// The parent is compact when every child is a leaf or compact node, all
/// but the last hold the same count and the last holds no more. Otherwise an
/// offsets node is written first.
fn write_parent<O: OutputStream + ?Sized>(children: &[Written], out: &mut O) -> Written {
    let sizes: Vec<u64> = children.iter().map(|c| c.size).collect();
    let total = sizes.iter().sum();
    let elems_per_child = sizes[0];
    let compact = children.iter().all(|c| c.compact)
        && sizes
            .split_last()
            .is_some_and(|(last, rest)| rest.iter().all(|&s| s == elems_per_child) && *last <= elems_per_child);

    let form = if compact {
        NodeForm::Compact { elems_per_child }
    } else {
        let offsets = out.append(&encode_node(
            NodeType::Offsets,
            &offsets_slots(&cumulative_offsets(&sizes)),
        ));
        NodeForm::General { offsets }
    };
    let parent = InnerNode {
        form,
        children: children.iter().map(|c| c.node).collect(),
        total,
    };
    let node = out.append(&encode_node(NodeType::Inner, &parent.to_slots()));
    Written {
        node,
        size: total,
        compact,
    }
}
