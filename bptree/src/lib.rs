// Forbid unwrap() in production code to prevent panics from corrupt data.
// Test code is allowed to use unwrap() for convenience.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]

// Life of a column:
// 1. Bulk load: the tree builder creates a balanced tree of full leaves
// 2. Mutation: appends keep nodes compact, inserts elsewhere switch the
//    affected nodes to explicit offsets; root splits grow the tree
// 3. Compaction: the subtree writer copies a slice of the tree into an
//    output stream, rebuilding the inner nodes above the copied leaves
//
// System components:
//  - Node arena and output streams
//  - B+-tree algorithms over tagged-integer nodes
//  - Column accessors and query-description helpers

pub mod column;
pub mod config;
pub mod query;
pub mod schema;
pub mod storage;
pub mod testing;

pub use column::{Column, ColumnError, IntegerColumn, LogicError};
pub use config::{ConfigError, EngineConfig};
pub use storage::btree::{BpTree, TreeError};
pub use storage::{MemoryOutputStream, SlabArena};
