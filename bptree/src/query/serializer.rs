//! Textual rendering of query values and column references.
//!
//! Values print the way the query language reads them back: `NULL`,
//! `true`/`false`, decimal numbers, quoted strings and `T<secs>:<nanos>`
//! timestamps. Strings containing characters the parser cannot take
//! literally are base64 encoded as `B64"..."`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::schema::{ColumnType, Schema, TableSpec};

/// Separator between the parts of a column path.
pub const VALUE_SEPARATOR: &str = ".";

/// Characters printed literally besides ASCII letters and digits.
const LITERAL_WHITELIST: &[u8] = b" {|}~:;<=>?@!#$%&()*+,-./[]^_`";

/// A point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanoseconds: i32,
}

/// A reference to a row, as compared against in a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowRef {
    /// The row accessor is no longer attached to a table.
    Detached,
    /// The null link.
    Null,
    /// A specific row.
    Row(u64),
}

/// A value appearing in a query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value<'a> {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(Option<&'a str>),
    Binary(Option<&'a [u8]>),
    Timestamp(Option<Timestamp>),
    Row(RowRef),
}

/// Render `value` as query text.
///
/// # Errors
///
/// Comparisons against specific rows have no textual form.
pub fn print_value(value: &Value<'_>) -> Result<String, SerialisationError> {
    let text = match value {
        Value::Null
        | Value::String(None)
        | Value::Binary(None)
        | Value::Timestamp(None)
        | Value::Row(RowRef::Null) => "NULL".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Double(d) => d.to_string(),
        Value::String(Some(s)) => print_bytes(s.as_bytes()),
        Value::Binary(Some(b)) => print_bytes(b),
        Value::Timestamp(Some(t)) => format!("T{}:{}", t.seconds, t.nanoseconds),
        Value::Row(RowRef::Detached | RowRef::Row(_)) => {
            return Err(SerialisationError::new(
                "Serialisation of object comparisons is not supported",
            ));
        }
    };
    Ok(text)
}

fn contains_invalids(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .any(|b| !b.is_ascii_alphanumeric() && !LITERAL_WHITELIST.contains(b))
}

fn print_bytes(bytes: &[u8]) -> String {
    if contains_invalids(bytes) {
        format!("B64\"{}\"", STANDARD.encode(bytes))
    } else {
        // Only ASCII is left at this point
        format!("\"{}\"", String::from_utf8_lossy(bytes))
    }
}

/// A chain of link columns followed from a starting table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkChain {
    /// Each hop: the table it starts in and the link column followed.
    pub hops: Vec<(String, usize)>,
}

impl LinkChain {
    #[must_use]
    pub const fn new(hops: Vec<(String, usize)>) -> Self {
        Self { hops }
    }

    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec::is_empty() is not const-stable
    pub fn links_exist(&self) -> bool {
        !self.hops.is_empty()
    }

    /// Table reached at the end of the chain, or the starting table of an
    /// empty chain.
    #[must_use]
    pub fn target_table<'s>(&self, schema: &'s Schema, start: &str) -> Option<&'s TableSpec> {
        let Some((table, column)) = self.hops.last() else {
            return schema.table(start);
        };
        let column_type = &schema.table(table)?.column(*column)?.column_type;
        match column_type {
            ColumnType::Backlink { origin_table, .. } => schema.table(origin_table),
            other => schema.table(other.link_target()?),
        }
    }

    /// Column names of the hops joined with [`VALUE_SEPARATOR`].
    #[must_use]
    pub fn description(&self, state: &SerialisationState<'_>) -> String {
        self.hops
            .iter()
            .map(|(table, column)| {
                state
                    .schema
                    .table(table)
                    .map(|t| state.get_column_name(t, *column))
                    .unwrap_or_default()
            })
            .collect::<Vec<_>>()
            .join(VALUE_SEPARATOR)
    }
}

/// Naming state while describing a (possibly nested) query.
#[derive(Debug, Clone)]
pub struct SerialisationState<'a> {
    pub schema: &'a Schema,
    /// Variable names of the enclosing subqueries, innermost last.
    pub subquery_prefix_list: Vec<String>,
}

impl<'a> SerialisationState<'a> {
    #[must_use]
    pub const fn new(schema: &'a Schema) -> Self {
        Self {
            schema,
            subquery_prefix_list: Vec::new(),
        }
    }

    /// Pick a variable name for a subquery over `table`.
    ///
    /// Names are tried in the order `$x`, `$y`, `$z`, `$a`, ... `$w`, then
    /// `$xx`, `$xy`, and so on. The result differs from every variable of the
    /// enclosing subqueries and from every column name of `table`.
    #[must_use]
    pub fn get_variable_name(&self, table: &TableSpec) -> String {
        const START_CHAR: u8 = b'x';
        let mut prefix = String::from("$");
        let mut add_char = START_CHAR;

        loop {
            let guess = format!("{prefix}{}", char::from(add_char));
            let taken = self.subquery_prefix_list.contains(&guess) || table.column_index(&guess).is_some();
            if !taken {
                return guess;
            }
            add_char = (add_char + 1 - b'a') % (b'z' - b'a' + 1) + b'a';
            if add_char == START_CHAR {
                prefix.push(char::from(add_char));
            }
        }
    }

    /// Enter a subquery over `table`, returning its variable name.
    pub fn push_subquery(&mut self, table: &TableSpec) -> String {
        let name = self.get_variable_name(table);
        self.subquery_prefix_list.push(name.clone());
        name
    }

    /// Leave the innermost subquery.
    pub fn pop_subquery(&mut self) -> Option<String> {
        self.subquery_prefix_list.pop()
    }

    /// Name of column `col_ndx` of `table`.
    ///
    /// Backlink columns are named after the link they mirror:
    /// `@links.<origin table>.<origin column>`. Unknown columns give `""`.
    #[must_use]
    pub fn get_column_name(&self, table: &TableSpec, col_ndx: usize) -> String {
        let Some(column) = table.column(col_ndx) else {
            return String::new();
        };
        match &column.column_type {
            ColumnType::Backlink {
                origin_table,
                origin_column,
            } => {
                let origin_column_name = self
                    .schema
                    .table(origin_table)
                    .and_then(|t| t.column(*origin_column))
                    .map(|c| c.name.as_str())
                    .unwrap_or_default();
                ["@links", origin_table.as_str(), origin_column_name].join(VALUE_SEPARATOR)
            }
            _ => column.name.clone(),
        }
    }

    /// Name of the backlink column mirroring link column `col_ndx` of `from`.
    ///
    /// # Panics
    ///
    /// Panics if `col_ndx` is not a link column.
    #[must_use]
    pub fn get_backlink_column_name(&self, from: &TableSpec, col_ndx: usize) -> String {
        let column_type = from.column(col_ndx).map(|c| &c.column_type);
        let target = column_type.and_then(ColumnType::link_target);
        assert!(
            target.is_some(),
            "column {col_ndx} of {} is not a link column: {column_type:?}",
            from.name
        );
        let Some(target) = target.and_then(|name| self.schema.table(name)) else {
            return String::new();
        };
        let backlink = target.columns.iter().position(|c| {
            matches!(
                &c.column_type,
                ColumnType::Backlink { origin_table, origin_column }
                    if *origin_table == from.name && *origin_column == col_ndx
            )
        });
        backlink.map_or_else(String::new, |ndx| self.get_column_name(target, ndx))
    }

    /// Column reference as seen from inside the innermost subquery.
    #[must_use]
    pub fn describe_column(&self, table: Option<&TableSpec>, col_ndx: Option<usize>) -> String {
        let (Some(table), Some(col_ndx)) = (table, col_ndx) else {
            return String::new();
        };
        let mut desc = String::new();
        if let Some(variable) = self.subquery_prefix_list.last() {
            desc.push_str(variable);
            desc.push_str(VALUE_SEPARATOR);
        }
        desc.push_str(&self.get_column_name(table, col_ndx));
        desc
    }

    /// Column reference reached through `link_chain` from `start_table`.
    #[must_use]
    pub fn describe_columns(&self, link_chain: &LinkChain, start_table: &str, target_col_ndx: Option<usize>) -> String {
        let mut parts = Vec::new();
        if let Some(variable) = self.subquery_prefix_list.last() {
            parts.push(variable.clone());
        }
        if link_chain.links_exist() {
            parts.push(link_chain.description(self));
        }
        if let (Some(target), Some(col_ndx)) = (link_chain.target_table(self.schema, start_table), target_col_ndx) {
            parts.push(self.get_column_name(target, col_ndx));
        }
        parts.join(VALUE_SEPARATOR)
    }
}

/// A value or query that has no textual representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialisationError {
    message: String,
}

impl SerialisationError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SerialisationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "serialisation error: {}", self.message)
    }
}

impl std::error::Error for SerialisationError {}
