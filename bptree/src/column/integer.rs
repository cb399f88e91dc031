//! 64-bit integer columns.

use crate::column::{Column, ColumnError, LogicError};
use crate::storage::arena::{Allocator, NodeSource, Ref};
use crate::storage::btree::{BpTree, IntegerCreateHandler, IntegerLeaf, IntegerSliceHandler};
use crate::storage::stream::OutputStream;

/// Stored value representing null in a nullable integer column.
pub const NULL_VALUE: i64 = i64::MIN;

/// A column of `i64` values, optionally nullable.
///
/// In a nullable column [`NULL_VALUE`] is reserved for null.
#[derive(Debug)]
pub struct IntegerColumn {
    tree: BpTree<IntegerLeaf>,
    column_index: usize,
    nullable: bool,
}

impl IntegerColumn {
    /// Create a column of `size` rows, each holding `value`, and record it
    /// in root-directory slot `column_index`.
    pub fn create(
        arena: &mut dyn Allocator,
        column_index: usize,
        size: usize,
        value: i64,
        max_node_size: usize,
    ) -> Result<Self, ColumnError> {
        let mut handler = IntegerCreateHandler::new(value);
        let mut tree = BpTree::build(arena, &mut handler, size, max_node_size)?;
        tree.bind(arena, column_index);
        tracing::debug!(
            "Created integer column {} with {} rows (root {})",
            column_index,
            size,
            tree.root_ref()
        );
        Ok(Self {
            tree,
            column_index,
            nullable: false,
        })
    }

    /// Create a nullable column of `size` null rows.
    pub fn create_nullable(
        arena: &mut dyn Allocator,
        column_index: usize,
        size: usize,
        max_node_size: usize,
    ) -> Result<Self, ColumnError> {
        let mut column = Self::create(arena, column_index, size, NULL_VALUE, max_node_size)?;
        column.nullable = true;
        Ok(column)
    }

    /// Attach to the column recorded in root-directory slot `column_index`.
    pub fn attach(
        arena: &dyn Allocator,
        column_index: usize,
        nullable: bool,
        max_node_size: usize,
    ) -> Result<Self, ColumnError> {
        let tree = BpTree::from_parent(arena, column_index, max_node_size)?;
        Ok(Self {
            tree,
            column_index,
            nullable,
        })
    }

    #[must_use]
    pub const fn root_ref(&self) -> Ref {
        self.tree.root_ref()
    }

    #[must_use]
    pub const fn tree(&self) -> &BpTree<IntegerLeaf> {
        &self.tree
    }

    /// Stored value of row `ndx`.
    pub fn get(&self, src: &dyn NodeSource, ndx: u64) -> Result<i64, ColumnError> {
        Ok(self.tree.get(src, ndx)?)
    }

    /// Value of row `ndx`, `None` for null.
    pub fn get_option(&self, src: &dyn NodeSource, ndx: u64) -> Result<Option<i64>, ColumnError> {
        let value = self.get(src, ndx)?;
        Ok(if self.nullable && value == NULL_VALUE {
            None
        } else {
            Some(value)
        })
    }

    pub fn set(&self, arena: &mut dyn Allocator, ndx: u64, value: i64) -> Result<(), ColumnError> {
        Ok(self.tree.set(arena, ndx, value)?)
    }

    /// Insert `value` before row `ndx`; `ndx == size` appends.
    pub fn insert(&mut self, arena: &mut dyn Allocator, ndx: u64, value: i64) -> Result<(), ColumnError> {
        Ok(self.tree.insert(arena, ndx, value)?)
    }

    /// Append `value` as a new last row.
    pub fn add(&mut self, arena: &mut dyn Allocator, value: i64) -> Result<(), ColumnError> {
        Ok(self.tree.append(arena, value)?)
    }

    /// Write rows `offset..offset + size` to `out` as a standalone tree and
    /// return its root ref.
    pub fn write_slice(
        &self,
        src: &dyn NodeSource,
        offset: u64,
        size: u64,
        out: &mut dyn OutputStream,
    ) -> Result<Ref, ColumnError> {
        let root = self.tree.write(src, offset, size, &mut IntegerSliceHandler, out)?;
        tracing::debug!(
            "Wrote rows {}..{} of column {} (root {})",
            offset,
            offset + size,
            self.column_index,
            root
        );
        Ok(root)
    }
}

impl Column for IntegerColumn {
    fn column_index(&self) -> usize {
        self.column_index
    }

    fn set_column_index(&mut self, column_index: usize) {
        self.column_index = column_index;
    }

    fn size(&self, src: &dyn NodeSource) -> Result<u64, ColumnError> {
        Ok(self.tree.size(src)?)
    }

    fn is_nullable(&self) -> bool {
        self.nullable
    }

    fn is_null(&self, src: &dyn NodeSource, index: u64) -> Result<bool, ColumnError> {
        Ok(self.get_option(src, index)?.is_none())
    }

    fn set_null(&mut self, arena: &mut dyn Allocator, index: u64) -> Result<(), ColumnError> {
        if !self.nullable {
            return Err(LogicError::ColumnNotNullable.into());
        }
        self.set(arena, index, NULL_VALUE)
    }

    fn verify(&self, src: &dyn NodeSource) {
        if let Err(e) = self.tree.verify(src) {
            panic!("integer column {} is corrupt: {e}", self.column_index);
        }
    }

    fn move_assign(&mut self, arena: &mut dyn Allocator, other: Self) {
        let old = std::mem::replace(&mut self.tree, other.tree);
        self.nullable = other.nullable;
        destroy_tree(arena, old);
        if let Some(link) = self.tree.parent().filter(|link| link.root_slot != self.column_index) {
            arena.set_root_slot(link.root_slot, 0);
        }
        self.tree.bind(arena, self.column_index);
    }

    fn destroy(self, arena: &mut dyn Allocator) {
        self.tree.destroy(arena);
    }
}

/// Free the nodes of `tree` without touching any directory slot.
fn destroy_tree(arena: &mut dyn Allocator, tree: BpTree<IntegerLeaf>) {
    let max_node_size = tree.max_node_size();
    BpTree::<IntegerLeaf>::from_ref(tree.root_ref(), max_node_size).destroy(arena);
}
