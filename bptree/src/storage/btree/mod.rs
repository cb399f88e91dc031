//! B+-tree over arena nodes.
//!
//! # Structure
//!
//! The tree consists of:
//! - Leaves: opaque payload nodes, interpreted only by a [`LeafType`]
//! - Inner nodes: child refs framed by two tagged slots (see [`node`])
//! - Offsets nodes: cumulative child sizes for inner nodes in general form
//!
//! All leaves sit at the same depth. Element positions are found by dividing
//! by `elems_per_child` (compact form) or by searching the offsets node
//! (general form).
//!
//! # Usage
//!
//! ```
//! use bptree::storage::SlabArena;
//! use bptree::storage::btree::{BpTree, IntegerCreateHandler, IntegerLeaf};
//!
//! let mut arena = SlabArena::for_node_size(4, 64);
//! let mut handler = IntegerCreateHandler::new(0);
//! let mut tree = BpTree::<IntegerLeaf>::build(&mut arena, &mut handler, 10, 4).unwrap();
//!
//! tree.insert(&mut arena, 3, 42).unwrap();
//! assert_eq!(tree.size(&arena).unwrap(), 11);
//! assert_eq!(tree.get(&arena, 3).unwrap(), 42);
//! ```

mod build;
mod handler;
mod leaf;
pub mod node;
mod reserve;
mod root;
mod tree;
mod write;

pub use build::build;
pub use handler::{CreateHandler, LeafType, SliceHandler, TreeInsert};
pub use leaf::{IntegerCreateHandler, IntegerLeaf, IntegerSliceHandler};
pub use node::{
    InnerNode, NODE_HEADER_SIZE, NodeError, NodeForm, NodeHeader, NodeType, SLOT_SIZE, Slot,
    decode_count, destroy_deep, encode_count, encode_node, is_ref, read_slots,
};
pub use root::{ParentLink, TreeRoot};
pub use tree::{BpTree, TreeError};
pub use write::write_subtree;
