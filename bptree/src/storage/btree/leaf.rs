//! 64-bit integer leaves.
//!
//! An integer leaf is a [`NodeType::Leaf`] node with one slot per element.

#![allow(clippy::cast_possible_truncation)]

use crate::storage::arena::{Allocator, NodeSource, Ref};
use crate::storage::btree::handler::{CreateHandler, LeafType, SliceHandler, TreeInsert};
use crate::storage::btree::node::{
    NodeError, NodeType, create_node, destroy_deep, encode_node, read_slots, write_node,
};
use crate::storage::btree::tree::TreeError;
use crate::storage::stream::OutputStream;

/// Leaf type storing `i64` elements.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegerLeaf;

/// Read all values of an integer leaf.
fn read_values<S: NodeSource + ?Sized>(src: &S, leaf: Ref) -> Result<Vec<i64>, TreeError> {
    let (header, values) = read_slots(src, leaf)?;
    if header.node_type != NodeType::Leaf {
        return Err(NodeError::WrongNodeType.into());
    }
    Ok(values)
}

impl LeafType for IntegerLeaf {
    type Value = i64;

    fn create<A: Allocator + ?Sized>(arena: &mut A, values: &[i64]) -> Result<Ref, TreeError> {
        create_node(arena, NodeType::Leaf, values)
    }

    fn size<S: NodeSource + ?Sized>(src: &S, leaf: Ref) -> Result<u64, TreeError> {
        Ok(read_values(src, leaf)?.len() as u64)
    }

    fn get<S: NodeSource + ?Sized>(src: &S, leaf: Ref, ndx: u64) -> Result<i64, TreeError> {
        let values = read_values(src, leaf)?;
        values
            .get(ndx as usize)
            .copied()
            .ok_or(TreeError::IndexOutOfBounds {
                index: ndx,
                size: values.len() as u64,
            })
    }

    fn set<A: Allocator + ?Sized>(arena: &mut A, leaf: Ref, ndx: u64, value: i64) -> Result<(), TreeError> {
        let mut values = read_values(&*arena, leaf)?;
        let size = values.len() as u64;
        let slot = values
            .get_mut(ndx as usize)
            .ok_or(TreeError::IndexOutOfBounds { index: ndx, size })?;
        *slot = value;
        write_node(arena, leaf, NodeType::Leaf, &values)
    }

    fn insert<A: Allocator + ?Sized>(
        arena: &mut A,
        leaf: Ref,
        ndx: u64,
        value: i64,
        max_node_size: usize,
        state: &mut TreeInsert,
    ) -> Result<Option<Ref>, TreeError> {
        let mut values = read_values(&*arena, leaf)?;
        let size = values.len();
        let ndx = ndx as usize;
        if ndx > size {
            return Err(TreeError::IndexOutOfBounds {
                index: ndx as u64,
                size: size as u64,
            });
        }

        if size < max_node_size {
            values.insert(ndx, value);
            write_node(arena, leaf, NodeType::Leaf, &values)?;
            return Ok(None);
        }

        // Full leaf: split
        if ndx == size {
            let sibling = create_node(arena, NodeType::Leaf, &[value])?;
            state.split_offset = size as u64;
            state.split_size = size as u64 + 1;
            return Ok(Some(sibling));
        }

        let tail = values.split_off(ndx);
        let sibling = create_node(arena, NodeType::Leaf, &tail)?;
        values.push(value);
        if let Err(e) = write_node(arena, leaf, NodeType::Leaf, &values) {
            destroy_deep(arena, sibling);
            return Err(e);
        }
        state.split_offset = ndx as u64 + 1;
        state.split_size = size as u64 + 1;
        Ok(Some(sibling))
    }
}

/// Creates integer leaves filled with one value.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegerCreateHandler {
    pub value: i64,
}

impl IntegerCreateHandler {
    #[must_use]
    pub const fn new(value: i64) -> Self {
        Self { value }
    }
}

impl<A: Allocator + ?Sized> CreateHandler<A> for IntegerCreateHandler {
    fn create_leaf(&mut self, arena: &mut A, size: usize) -> Result<Ref, TreeError> {
        create_node(arena, NodeType::Leaf, &vec![self.value; size])
    }
}

/// Copies integer leaf sub-ranges into an output stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegerSliceHandler;

impl<S: NodeSource + ?Sized> SliceHandler<S> for IntegerSliceHandler {
    fn write_leaf_slice<O: OutputStream + ?Sized>(
        &mut self,
        src: &S,
        leaf: Ref,
        offset: u64,
        size: u64,
        out: &mut O,
    ) -> Result<Ref, TreeError> {
        let values = read_values(src, leaf)?;
        let end = offset + size;
        if end > values.len() as u64 {
            return Err(TreeError::IndexOutOfBounds {
                index: end,
                size: values.len() as u64,
            });
        }
        let bytes = encode_node(NodeType::Leaf, &values[offset as usize..end as usize]);
        Ok(out.append(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::arena::SlabArena;
    use crate::storage::stream::MemoryOutputStream;

    #[test]
    fn test_create_get_set() {
        let mut arena = SlabArena::for_node_size(4, 8);
        let leaf = IntegerLeaf::create(&mut arena, &[5, 6, 7]).expect("create");

        assert_eq!(IntegerLeaf::size(&arena, leaf).expect("size"), 3);
        assert_eq!(IntegerLeaf::get(&arena, leaf, 1).expect("get"), 6);

        IntegerLeaf::set(&mut arena, leaf, 1, 60).expect("set");
        assert_eq!(IntegerLeaf::get(&arena, leaf, 1).expect("get"), 60);

        assert!(matches!(
            IntegerLeaf::get(&arena, leaf, 3),
            Err(TreeError::IndexOutOfBounds { index: 3, size: 3 })
        ));
    }

    #[test]
    fn test_insert_without_split() {
        let mut arena = SlabArena::for_node_size(4, 8);
        let leaf = IntegerLeaf::create(&mut arena, &[1, 3]).expect("create");
        let mut state = TreeInsert::default();

        let split = IntegerLeaf::insert(&mut arena, leaf, 1, 2, 4, &mut state).expect("insert");
        assert_eq!(split, None);
        assert_eq!(read_values(&arena, leaf).expect("values"), vec![1, 2, 3]);
    }

    #[test]
    fn test_append_split() {
        let mut arena = SlabArena::for_node_size(2, 8);
        let leaf = IntegerLeaf::create(&mut arena, &[1, 2]).expect("create");
        let mut state = TreeInsert::default();

        let sibling = IntegerLeaf::insert(&mut arena, leaf, 2, 3, 2, &mut state)
            .expect("insert")
            .expect("should split");
        assert_eq!(read_values(&arena, leaf).expect("left"), vec![1, 2]);
        assert_eq!(read_values(&arena, sibling).expect("right"), vec![3]);
        assert_eq!(
            state,
            TreeInsert {
                split_offset: 2,
                split_size: 3
            }
        );
    }

    #[test]
    fn test_middle_split() {
        let mut arena = SlabArena::for_node_size(4, 8);
        let leaf = IntegerLeaf::create(&mut arena, &[1, 2, 4, 5]).expect("create");
        let mut state = TreeInsert::default();

        let sibling = IntegerLeaf::insert(&mut arena, leaf, 2, 3, 4, &mut state)
            .expect("insert")
            .expect("should split");
        assert_eq!(read_values(&arena, leaf).expect("left"), vec![1, 2, 3]);
        assert_eq!(read_values(&arena, sibling).expect("right"), vec![4, 5]);
        assert_eq!(
            state,
            TreeInsert {
                split_offset: 3,
                split_size: 5
            }
        );
    }

    #[test]
    fn test_failed_split_leaves_leaf_untouched() {
        let mut arena = SlabArena::for_node_size(2, 2);
        let leaf = IntegerLeaf::create(&mut arena, &[1, 2]).expect("create");
        let mut state = TreeInsert::default();

        let result = IntegerLeaf::insert(&mut arena, leaf, 0, 0, 2, &mut state);
        assert!(matches!(result, Err(TreeError::Arena(_))));
        assert_eq!(read_values(&arena, leaf).expect("values"), vec![1, 2]);
        assert_eq!(arena.allocated_count(), 1);
    }

    #[test]
    fn test_create_handler_fills_value() {
        let mut arena = SlabArena::for_node_size(4, 8);
        let mut handler = IntegerCreateHandler::new(9);
        let leaf = handler.create_leaf(&mut arena, 3).expect("create");
        assert_eq!(read_values(&arena, leaf).expect("values"), vec![9, 9, 9]);
    }

    #[test]
    fn test_slice_handler_copies_range() {
        let mut arena = SlabArena::for_node_size(4, 8);
        let leaf = IntegerLeaf::create(&mut arena, &[1, 2, 3, 4]).expect("create");
        let mut out = MemoryOutputStream::new();

        let copy = IntegerSliceHandler
            .write_leaf_slice(&arena, leaf, 1, 2, &mut out)
            .expect("slice");
        assert_eq!(read_values(&out, copy).expect("values"), vec![2, 3]);

        assert!(
            IntegerSliceHandler
                .write_leaf_slice(&arena, leaf, 3, 2, &mut out)
                .is_err()
        );
    }
}
