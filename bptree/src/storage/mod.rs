//! Node storage: the arena, the output stream and the B+-tree on top of them.
//!
//! # Layers
//!
//! - `arena`: fixed-size blocks addressed by refs, plus the root directory
//! - `stream`: append-only output for serialized (compacted) trees
//! - `btree`: node encoding and all tree algorithms

pub mod arena;
pub mod btree;
pub mod stream;

pub use arena::{Allocator, ArenaError, NodeSource, REF_ALIGNMENT, Ref, SlabArena, block_size_for};
pub use stream::{ByteImage, MemoryOutputStream, OutputStream};
