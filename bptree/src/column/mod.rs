//! Column accessors.
//!
//! A column owns one tree: its root ref lives in the arena's root directory
//! at the slot numbered by the column index. The [`Column`] trait is the
//! contract every column type shares; most operations have defaults that
//! only make sense to override for specific value types.

mod integer;

pub use integer::{IntegerColumn, NULL_VALUE};

use crate::schema::TableSpec;
use crate::storage::arena::{Allocator, ArenaError, NodeSource};
use crate::storage::btree::{NodeError, TreeError};

/// Rows collected while breaking links during a cascading delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CascadeState {
    /// `(column index, row)` pairs whose links were broken.
    pub rows: Vec<(usize, u64)>,
}

/// The shared column contract.
pub trait Column {
    /// Index of this column within its table.
    fn column_index(&self) -> usize;

    /// Rebind the cached column index.
    fn set_column_index(&mut self, column_index: usize);

    /// Number of rows.
    fn size(&self, src: &dyn NodeSource) -> Result<u64, ColumnError>;

    fn is_nullable(&self) -> bool {
        false
    }

    fn is_null(&self, _src: &dyn NodeSource, _index: u64) -> Result<bool, ColumnError> {
        Ok(false)
    }

    fn set_null(&mut self, _arena: &mut dyn Allocator, _index: u64) -> Result<(), ColumnError> {
        Err(LogicError::ColumnNotNullable.into())
    }

    fn set_string(
        &mut self,
        _arena: &mut dyn Allocator,
        _index: u64,
        _value: Option<&str>,
    ) -> Result<(), ColumnError> {
        Err(LogicError::TypeMismatch.into())
    }

    /// Break the backlinks pointing at `row`. Only link columns hold any.
    fn cascade_break_backlinks_to(&mut self, _row: u64, _state: &mut CascadeState) {}

    /// Break the backlinks pointing at any of the first `num_rows` rows.
    fn cascade_break_backlinks_to_all_rows(&mut self, _num_rows: u64, _state: &mut CascadeState) {}

    /// Structural self-check.
    ///
    /// # Panics
    ///
    /// Panics if the column is corrupt.
    fn verify(&self, src: &dyn NodeSource);

    /// Structural self-check that also checks the column sits at
    /// `column_index` in `table`.
    ///
    /// # Panics
    ///
    /// Panics if the recorded index differs or the column is corrupt.
    fn verify_in_table(&self, src: &dyn NodeSource, table: &TableSpec, column_index: usize) {
        assert_eq!(
            self.column_index(),
            column_index,
            "column of table {} is recorded at the wrong index",
            table.name
        );
        assert!(
            column_index < table.column_count(),
            "table {} has no column {column_index}",
            table.name
        );
        self.verify(src);
    }

    /// Called after the table's columns moved: the column now lives at
    /// `new_column_index`.
    fn refresh_accessor_tree(&mut self, new_column_index: usize, _table: &TableSpec) {
        self.set_column_index(new_column_index);
    }

    /// Destroy this column's tree and take over the tree of `other`.
    fn move_assign(&mut self, arena: &mut dyn Allocator, other: Self)
    where
        Self: Sized;

    /// Free every node of the column.
    fn destroy(self, arena: &mut dyn Allocator)
    where
        Self: Sized;
}

/// A column operation that is not valid for this column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogicError {
    /// Null written to a column that does not allow it.
    ColumnNotNullable,
    /// Value of the wrong type for this column.
    TypeMismatch,
}

impl std::fmt::Display for LogicError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ColumnNotNullable => write!(f, "column is not nullable"),
            Self::TypeMismatch => write!(f, "value type does not match column type"),
        }
    }
}

impl std::error::Error for LogicError {}

/// Errors that can occur in column operations.
#[derive(Debug)]
pub enum ColumnError {
    /// Invalid operation for this column.
    Logic(LogicError),
    /// Underlying tree error.
    Tree(TreeError),
}

impl std::fmt::Display for ColumnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Logic(e) => write!(f, "logic error: {e}"),
            Self::Tree(e) => write!(f, "tree error: {e}"),
        }
    }
}

impl std::error::Error for ColumnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Logic(e) => Some(e),
            Self::Tree(e) => Some(e),
        }
    }
}

impl From<LogicError> for ColumnError {
    fn from(e: LogicError) -> Self {
        Self::Logic(e)
    }
}

impl From<TreeError> for ColumnError {
    fn from(e: TreeError) -> Self {
        Self::Tree(e)
    }
}

impl From<ArenaError> for ColumnError {
    fn from(e: ArenaError) -> Self {
        Self::Tree(TreeError::Arena(e))
    }
}

impl From<NodeError> for ColumnError {
    fn from(e: NodeError) -> Self {
        Self::Tree(TreeError::Node(e))
    }
}
