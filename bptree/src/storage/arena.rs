//! Fixed-block arena backing the B+-tree nodes.
//!
//! Nodes live in equally sized blocks carved out of one contiguous buffer. A
//! block is addressed by the byte offset of its first byte (a [`Ref`]).
//!
//! - Block 0 is reserved, so no valid ref is ever 0.
//! - The block size is a multiple of [`REF_ALIGNMENT`], so every ref is even.
//!   Inner nodes rely on this to tell child refs from tagged counts.
//!
//! Free/used blocks are tracked by a bitmap: 0 = free, 1 = used.
//!
//! The arena also hosts the root directory: a handful of numbered slots that
//! hold the current root ref of each column. A column's parent link is an
//! index into this directory.

// Refs are u64 but block indices are usize. On 64-bit targets these are the same size.
#![allow(clippy::cast_possible_truncation)]

use crate::config::EngineConfig;
use crate::storage::btree::{NODE_HEADER_SIZE, SLOT_SIZE};

/// A node handle: byte offset of a node inside an arena or an output stream.
pub type Ref = u64;

/// Alignment of every block, and therefore of every ref.
pub const REF_ALIGNMENT: usize = 8;

/// Number of bits per byte.
const BITS_PER_BYTE: usize = 8;

/// Read-only access to serialized nodes.
pub trait NodeSource {
    /// Bytes of the node at `node_ref`, starting at its header.
    ///
    /// The returned slice covers at least the header and all slots of the node.
    fn node_bytes(&self, node_ref: Ref) -> Result<&[u8], ArenaError>;
}

/// Storage that can allocate, free and mutate node blocks.
///
/// All tree mutations go through this trait. Implementations must hand out
/// even, non-zero refs.
pub trait Allocator: NodeSource {
    /// Allocate a zeroed block able to hold `size` bytes.
    fn allocate(&mut self, size: usize) -> Result<Ref, ArenaError>;

    /// Return a block to the free pool. Unknown refs are ignored.
    fn free(&mut self, node_ref: Ref);

    /// Mutable bytes of the block at `node_ref`.
    fn node_bytes_mut(&mut self, node_ref: Ref) -> Result<&mut [u8], ArenaError>;

    /// Root ref stored in directory slot `ndx`, if any.
    fn root_slot(&self, ndx: usize) -> Option<Ref>;

    /// Store `node_ref` in directory slot `ndx`.
    fn set_root_slot(&mut self, ndx: usize, node_ref: Ref);

    /// Number of blocks currently in use.
    fn allocated_count(&self) -> usize;
}

/// Calculate the block size needed for nodes with up to `max_node_size` entries.
///
/// Inner nodes are the largest: one slot per child plus the two tagged slots.
#[must_use]
pub const fn block_size_for(max_node_size: usize) -> usize {
    (NODE_HEADER_SIZE + (max_node_size + 2) * SLOT_SIZE).next_multiple_of(REF_ALIGNMENT)
}

/// An in-memory arena of fixed-size node blocks.
///
/// # Invariants
/// - `free_count + allocated_count() == total_blocks - 1` (block 0 is reserved)
/// - every allocated ref is a non-zero multiple of `block_size`
#[derive(Debug)]
pub struct SlabArena {
    /// Backing storage for all blocks.
    data: Vec<u8>,
    /// Size of one block in bytes.
    block_size: usize,
    /// Allocation bitmap.
    bitmap: Vec<u8>,
    /// Total number of blocks, including the reserved one.
    total_blocks: usize,
    /// Number of free blocks.
    free_count: usize,
    /// Hint for next free block search.
    next_search_hint: usize,
    /// Root directory.
    roots: Vec<Ref>,
}

impl SlabArena {
    /// Create an arena of `total_blocks` blocks of `block_size` bytes each.
    ///
    /// # Panics
    /// Panics if `block_size` is not a positive multiple of [`REF_ALIGNMENT`]
    /// large enough for a node header, or if fewer than two blocks are requested.
    #[must_use]
    pub fn new(block_size: usize, total_blocks: usize) -> Self {
        assert!(
            block_size >= NODE_HEADER_SIZE && block_size % REF_ALIGNMENT == 0,
            "block size must be a multiple of {REF_ALIGNMENT} holding at least a node header"
        );
        assert!(total_blocks >= 2, "arena needs at least one usable block");

        let mut bitmap = vec![0u8; total_blocks.div_ceil(BITS_PER_BYTE)];
        // Block 0 is reserved so that ref 0 can mean "no node".
        set_bit(&mut bitmap, 0);

        Self {
            data: vec![0u8; block_size * total_blocks],
            block_size,
            bitmap,
            total_blocks,
            free_count: total_blocks - 1,
            next_search_hint: 1,
            roots: Vec::new(),
        }
    }

    /// Create an arena sized for trees with fan-out `max_node_size`.
    #[must_use]
    pub fn for_node_size(max_node_size: usize, total_blocks: usize) -> Self {
        Self::new(block_size_for(max_node_size), total_blocks)
    }

    /// Create an arena from the engine configuration.
    #[must_use]
    pub fn with_config(config: &EngineConfig) -> Self {
        Self::for_node_size(config.max_node_size, config.arena_blocks)
    }

    /// Size of one block in bytes.
    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of free blocks.
    #[must_use]
    pub const fn free_count(&self) -> usize {
        self.free_count
    }

    /// Total number of blocks, including the reserved block 0.
    #[must_use]
    pub const fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    /// Check if `node_ref` addresses an allocated block.
    #[must_use]
    pub fn is_allocated(&self, node_ref: Ref) -> bool {
        self.block_index(node_ref).is_ok()
    }

    /// Translate a ref into the index of an allocated block.
    fn block_index(&self, node_ref: Ref) -> Result<usize, ArenaError> {
        let offset = node_ref as usize;
        if node_ref == 0 || offset % self.block_size != 0 {
            return Err(ArenaError::InvalidRef(node_ref));
        }
        let block = offset / self.block_size;
        if block >= self.total_blocks || !get_bit(&self.bitmap, block) {
            return Err(ArenaError::InvalidRef(node_ref));
        }
        Ok(block)
    }

    fn claim(&mut self, block: usize) -> Ref {
        set_bit(&mut self.bitmap, block);
        self.free_count -= 1;
        self.next_search_hint = block + 1;
        let start = block * self.block_size;
        self.data[start..start + self.block_size].fill(0);
        (block * self.block_size) as Ref
    }
}

impl NodeSource for SlabArena {
    fn node_bytes(&self, node_ref: Ref) -> Result<&[u8], ArenaError> {
        let start = self.block_index(node_ref)? * self.block_size;
        Ok(&self.data[start..start + self.block_size])
    }
}

impl Allocator for SlabArena {
    fn allocate(&mut self, size: usize) -> Result<Ref, ArenaError> {
        if size > self.block_size {
            return Err(ArenaError::NodeTooLarge {
                size,
                max: self.block_size,
            });
        }
        if self.free_count == 0 {
            tracing::warn!(
                "Arena exhausted: all {} blocks in use",
                self.total_blocks - 1
            );
            return Err(ArenaError::Exhausted {
                total_blocks: self.total_blocks,
            });
        }

        // Search from hint, then wrap around
        let found = (self.next_search_hint..self.total_blocks)
            .chain(1..self.next_search_hint)
            .find(|&block| !get_bit(&self.bitmap, block));

        found
            .map(|block| self.claim(block))
            .ok_or(ArenaError::Exhausted {
                total_blocks: self.total_blocks,
            })
    }

    fn free(&mut self, node_ref: Ref) {
        let Ok(block) = self.block_index(node_ref) else {
            return;
        };
        clear_bit(&mut self.bitmap, block);
        self.free_count += 1;

        if block < self.next_search_hint {
            self.next_search_hint = block;
        }
    }

    fn node_bytes_mut(&mut self, node_ref: Ref) -> Result<&mut [u8], ArenaError> {
        let start = self.block_index(node_ref)? * self.block_size;
        Ok(&mut self.data[start..start + self.block_size])
    }

    fn root_slot(&self, ndx: usize) -> Option<Ref> {
        self.roots.get(ndx).copied().filter(|&r| r != 0)
    }

    fn set_root_slot(&mut self, ndx: usize, node_ref: Ref) {
        if ndx >= self.roots.len() {
            self.roots.resize(ndx + 1, 0);
        }
        self.roots[ndx] = node_ref;
    }

    fn allocated_count(&self) -> usize {
        self.total_blocks - 1 - self.free_count
    }
}

/// Errors raised by arena operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArenaError {
    /// No free block is left.
    Exhausted { total_blocks: usize },
    /// The requested size does not fit in one block.
    NodeTooLarge { size: usize, max: usize },
    /// The ref does not address an allocated node.
    InvalidRef(Ref),
    /// Failure injected by a test allocator.
    InjectedFault(String),
}

impl std::fmt::Display for ArenaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exhausted { total_blocks } => {
                write!(f, "arena exhausted ({total_blocks} blocks)")
            }
            Self::NodeTooLarge { size, max } => {
                write!(f, "node of {size} bytes exceeds block size {max}")
            }
            Self::InvalidRef(r) => write!(f, "invalid node ref: {r}"),
            Self::InjectedFault(msg) => write!(f, "injected fault: {msg}"),
        }
    }
}

impl std::error::Error for ArenaError {}

/// Get a bit from the bitmap.
fn get_bit(bitmap: &[u8], index: usize) -> bool {
    let byte_index = index / BITS_PER_BYTE;
    let bit_index = index % BITS_PER_BYTE;

    if byte_index >= bitmap.len() {
        return false;
    }

    (bitmap[byte_index] & (1 << bit_index)) != 0
}

/// Set a bit in the bitmap (mark as used).
fn set_bit(bitmap: &mut [u8], index: usize) {
    let byte_index = index / BITS_PER_BYTE;
    let bit_index = index % BITS_PER_BYTE;

    if byte_index < bitmap.len() {
        bitmap[byte_index] |= 1 << bit_index;
    }
}

/// Clear a bit in the bitmap (mark as free).
fn clear_bit(bitmap: &mut [u8], index: usize) {
    let byte_index = index / BITS_PER_BYTE;
    let bit_index = index % BITS_PER_BYTE;

    if byte_index < bitmap.len() {
        bitmap[byte_index] &= !(1 << bit_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_size_for() {
        // header + (M + 2) slots
        assert_eq!(block_size_for(2), 8 + 4 * 8);
        assert_eq!(block_size_for(1000), 8 + 1002 * 8);
        assert_eq!(block_size_for(4) % REF_ALIGNMENT, 0);
    }

    #[test]
    fn test_new_arena() {
        let arena = SlabArena::for_node_size(4, 10);

        assert_eq!(arena.total_blocks(), 10);
        assert_eq!(arena.free_count(), 9); // block 0 reserved
        assert_eq!(arena.allocated_count(), 0);
        assert!(!arena.is_allocated(0));
    }

    #[test]
    fn test_refs_are_even_and_non_zero() {
        let mut arena = SlabArena::for_node_size(3, 20);

        while let Ok(r) = arena.allocate(16) {
            assert_ne!(r, 0);
            assert_eq!(r % 2, 0);
            assert!(arena.is_allocated(r));
        }
        assert_eq!(arena.free_count(), 0);
    }

    #[test]
    fn test_allocate_and_free() {
        let mut arena = SlabArena::for_node_size(4, 10);

        let r1 = arena.allocate(8).expect("allocate 1");
        let r2 = arena.allocate(8).expect("allocate 2");
        let r3 = arena.allocate(8).expect("allocate 3");
        assert_eq!(arena.allocated_count(), 3);

        arena.free(r2);
        assert!(arena.is_allocated(r1));
        assert!(!arena.is_allocated(r2));
        assert!(arena.is_allocated(r3));
        assert_eq!(arena.allocated_count(), 2);

        // Next allocation should reuse the hole
        let r4 = arena.allocate(8).expect("allocate 4");
        assert_eq!(r4, r2);
    }

    #[test]
    fn test_allocated_block_is_zeroed() {
        let mut arena = SlabArena::for_node_size(2, 4);
        let r = arena.allocate(8).expect("allocate");
        arena.node_bytes_mut(r).expect("bytes")[..4].copy_from_slice(&[1, 2, 3, 4]);
        arena.free(r);

        let again = arena.allocate(8).expect("allocate again");
        assert_eq!(again, r);
        assert!(arena.node_bytes(again).expect("bytes").iter().all(|&b| b == 0));
    }

    #[test]
    fn test_exhaustion() {
        let mut arena = SlabArena::for_node_size(2, 3);
        arena.allocate(8).expect("first");
        arena.allocate(8).expect("second");

        assert_eq!(
            arena.allocate(8),
            Err(ArenaError::Exhausted { total_blocks: 3 })
        );
    }

    #[test]
    fn test_node_too_large() {
        let mut arena = SlabArena::for_node_size(2, 3);
        let max = arena.block_size();
        assert_eq!(
            arena.allocate(max + 1),
            Err(ArenaError::NodeTooLarge { size: max + 1, max })
        );
    }

    #[test]
    fn test_invalid_refs() {
        let mut arena = SlabArena::for_node_size(2, 4);
        let r = arena.allocate(8).expect("allocate");

        assert!(arena.node_bytes(r).is_ok());
        assert_eq!(arena.node_bytes(0), Err(ArenaError::InvalidRef(0)));
        assert_eq!(arena.node_bytes(r + 2), Err(ArenaError::InvalidRef(r + 2)));

        arena.free(r);
        assert_eq!(arena.node_bytes(r), Err(ArenaError::InvalidRef(r)));

        // Freeing twice is harmless
        arena.free(r);
        assert_eq!(arena.allocated_count(), 0);
    }

    #[test]
    fn test_root_slots() {
        let mut arena = SlabArena::for_node_size(2, 4);
        assert_eq!(arena.root_slot(3), None);

        arena.set_root_slot(3, 96);
        assert_eq!(arena.root_slot(3), Some(96));
        assert_eq!(arena.root_slot(0), None);

        arena.set_root_slot(3, 0);
        assert_eq!(arena.root_slot(3), None);
    }

    #[test]
    fn test_bit_operations() {
        let mut bitmap = vec![0u8; 10];

        assert!(!get_bit(&bitmap, 0));
        assert!(!get_bit(&bitmap, 79));

        set_bit(&mut bitmap, 0);
        set_bit(&mut bitmap, 7);
        set_bit(&mut bitmap, 8);
        set_bit(&mut bitmap, 79);
        assert!(get_bit(&bitmap, 0));
        assert!(get_bit(&bitmap, 7));
        assert!(get_bit(&bitmap, 8));
        assert!(get_bit(&bitmap, 79));

        clear_bit(&mut bitmap, 7);
        assert!(!get_bit(&bitmap, 7));
        assert!(get_bit(&bitmap, 0)); // Others unchanged
    }
}
