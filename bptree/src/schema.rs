//! Table and column descriptions.
//!
//! Columns are verified against the table that holds them, and the query
//! description helpers turn column indices back into names. Both only need
//! the shape of a table, which is what this module records.

/// The type of a column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Int,
    Bool,
    String,
    Binary,
    Timestamp,
    /// Single link to a row of `target_table`.
    Link { target_table: String },
    /// List of links to rows of `target_table`.
    LinkList { target_table: String },
    /// Hidden reverse side of the link column `origin_column` in `origin_table`.
    Backlink {
        origin_table: String,
        origin_column: usize,
    },
}

impl ColumnType {
    /// Check if this is a forward link column.
    #[must_use]
    pub const fn is_link(&self) -> bool {
        matches!(self, Self::Link { .. } | Self::LinkList { .. })
    }

    /// Target table of a forward link column.
    #[must_use]
    pub fn link_target(&self) -> Option<&str> {
        match self {
            Self::Link { target_table } | Self::LinkList { target_table } => Some(target_table),
            _ => None,
        }
    }
}

/// A named, typed column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
}

impl ColumnSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
        }
    }

    #[must_use]
    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// A named table and its columns, in index order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
}

impl TableSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, columns: Vec<ColumnSpec>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec::len() is not const-stable
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn column(&self, ndx: usize) -> Option<&ColumnSpec> {
        self.columns.get(ndx)
    }

    /// Index of the column called `name`.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

/// All tables of a database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    pub tables: Vec<TableSpec>,
}

impl Schema {
    #[must_use]
    pub const fn new(tables: Vec<TableSpec>) -> Self {
        Self { tables }
    }

    #[must_use]
    pub fn table(&self, name: &str) -> Option<&TableSpec> {
        self.tables.iter().find(|t| t.name == name)
    }
}
