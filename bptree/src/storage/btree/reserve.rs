//! Up-front block reservation for multi-node mutations.
//!
//! An insert may rewrite nodes on its way back up the tree (a split moves
//! elements out of the original node into the sibling). Once that has happened
//! an allocation failure higher up can no longer be undone, so every block the
//! insert may need is claimed before any existing node is touched.

use crate::storage::arena::{Allocator, ArenaError, NodeSource, Ref};

/// An allocator that serves allocations from blocks claimed in advance.
///
/// Allocations up to `block_bytes` are taken from the reserve; anything else
/// goes to the wrapped arena. Unused blocks are returned when dropped.
pub struct Reservation<'a, A: Allocator + ?Sized> {
    arena: &'a mut A,
    blocks: Vec<Ref>,
    block_bytes: usize,
}

impl<'a, A: Allocator + ?Sized> Reservation<'a, A> {
    /// Claim `count` blocks of `block_bytes` bytes each.
    ///
    /// Either all blocks are claimed or none are.
    pub fn new(arena: &'a mut A, count: usize, block_bytes: usize) -> Result<Self, ArenaError> {
        let mut reservation = Self {
            arena,
            blocks: Vec::with_capacity(count),
            block_bytes,
        };
        for _ in 0..count {
            // On error the drop returns what was claimed so far
            let block = reservation.arena.allocate(block_bytes)?;
            reservation.blocks.push(block);
        }
        Ok(reservation)
    }

    /// Number of blocks not handed out yet.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec::len() is not const-stable
    pub fn remaining(&self) -> usize {
        self.blocks.len()
    }
}

impl<A: Allocator + ?Sized> Drop for Reservation<'_, A> {
    fn drop(&mut self) {
        for block in self.blocks.drain(..) {
            self.arena.free(block);
        }
    }
}

impl<A: Allocator + ?Sized> NodeSource for Reservation<'_, A> {
    fn node_bytes(&self, node_ref: Ref) -> Result<&[u8], ArenaError> {
        self.arena.node_bytes(node_ref)
    }
}

impl<A: Allocator + ?Sized> Allocator for Reservation<'_, A> {
    fn allocate(&mut self, size: usize) -> Result<Ref, ArenaError> {
        let reserved = if size <= self.block_bytes {
            self.blocks.pop()
        } else {
            None
        };
        match reserved {
            Some(block) => Ok(block),
            None => self.arena.allocate(size),
        }
    }

    fn free(&mut self, node_ref: Ref) {
        self.arena.free(node_ref);
    }

    fn node_bytes_mut(&mut self, node_ref: Ref) -> Result<&mut [u8], ArenaError> {
        self.arena.node_bytes_mut(node_ref)
    }

    fn root_slot(&self, ndx: usize) -> Option<Ref> {
        self.arena.root_slot(ndx)
    }

    fn set_root_slot(&mut self, ndx: usize, node_ref: Ref) {
        self.arena.set_root_slot(ndx, node_ref);
    }

    fn allocated_count(&self) -> usize {
        self.arena.allocated_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::arena::SlabArena;
    use crate::testing::FaultyArena;

    #[test]
    fn test_unused_blocks_are_returned() {
        let mut arena = SlabArena::for_node_size(2, 16);
        {
            let mut reservation = Reservation::new(&mut arena, 3, 16).expect("reserve");
            assert_eq!(reservation.remaining(), 3);
            assert_eq!(reservation.allocated_count(), 3);

            let used = reservation.allocate(8).expect("allocate");
            assert_eq!(reservation.remaining(), 2);
            assert!(reservation.node_bytes(used).is_ok());
        }
        // Only the block handed out survives
        assert_eq!(arena.allocated_count(), 1);
    }

    #[test]
    fn test_partial_reservation_claims_nothing() {
        let mut arena = FaultyArena::failing_after(SlabArena::for_node_size(2, 16), 2);
        assert!(matches!(
            Reservation::new(&mut arena, 4, 16),
            Err(ArenaError::InjectedFault(_))
        ));
        assert_eq!(arena.allocated_count(), 0);
    }

    #[test]
    fn test_oversized_or_exhausted_requests_go_to_the_arena() {
        let mut arena = SlabArena::for_node_size(4, 16);
        let mut reservation = Reservation::new(&mut arena, 1, 16).expect("reserve");

        reservation.allocate(32).expect("oversized");
        assert_eq!(reservation.remaining(), 1);
        reservation.allocate(16).expect("reserved");
        reservation.allocate(16).expect("from arena");
        assert_eq!(reservation.remaining(), 0);
        assert_eq!(reservation.allocated_count(), 3);
    }
}
