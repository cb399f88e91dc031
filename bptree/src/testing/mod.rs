//! Test support: an arena wrapper that injects allocation failures.
//!
//! Failures are either scheduled (every allocation after the first `n`
//! fails) or random with a seeded RNG, so a failing run can be replayed
//! from its seed.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::storage::arena::{Allocator, ArenaError, NodeSource, Ref};

/// Configuration for fault injection.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Number of allocations that succeed before every further one fails.
    pub fail_after: Option<usize>,
    /// Probability of an allocation failure (0.0 - 1.0).
    pub allocation_failure_rate: f64,
}

impl FaultConfig {
    /// Create a fault config with no faults (for baseline testing).
    #[must_use]
    pub fn no_faults() -> Self {
        Self::default()
    }

    /// Fail every allocation after the first `successes`.
    #[must_use]
    pub const fn fail_after(successes: usize) -> Self {
        Self {
            fail_after: Some(successes),
            allocation_failure_rate: 0.0,
        }
    }

    /// Fail allocations at random with probability `rate`.
    #[must_use]
    pub const fn random(rate: f64) -> Self {
        Self {
            fail_after: None,
            allocation_failure_rate: rate,
        }
    }
}

/// An [`Allocator`] that forwards to `inner` but fails allocations on demand.
#[derive(Debug)]
pub struct FaultyArena<A> {
    inner: A,
    config: FaultConfig,
    rng: StdRng,
    allocations: usize,
    injected_failures: usize,
}

impl<A: Allocator> FaultyArena<A> {
    /// Wrap `inner` with the given fault configuration.
    #[must_use]
    pub fn new(inner: A, seed: u64, config: FaultConfig) -> Self {
        Self {
            inner,
            config,
            rng: StdRng::seed_from_u64(seed),
            allocations: 0,
            injected_failures: 0,
        }
    }

    /// Wrap `inner` so that only the next `successes` allocations succeed.
    #[must_use]
    pub fn failing_after(inner: A, successes: usize) -> Self {
        Self::new(inner, 0, FaultConfig::fail_after(successes))
    }

    /// Number of failures injected so far.
    #[must_use]
    pub const fn injected_failures(&self) -> usize {
        self.injected_failures
    }

    /// Update the fault configuration.
    pub fn set_fault_config(&mut self, config: FaultConfig) {
        self.config = config;
        self.allocations = 0;
    }

    /// Unwrap the underlying arena.
    pub fn into_inner(self) -> A {
        self.inner
    }

    fn should_inject_fault(&mut self) -> bool {
        if self
            .config
            .fail_after
            .is_some_and(|successes| self.allocations >= successes)
        {
            return true;
        }
        let rate = self.config.allocation_failure_rate;
        rate > 0.0 && self.rng.random::<f64>() < rate
    }
}

impl<A: Allocator> NodeSource for FaultyArena<A> {
    fn node_bytes(&self, node_ref: Ref) -> Result<&[u8], ArenaError> {
        self.inner.node_bytes(node_ref)
    }
}

impl<A: Allocator> Allocator for FaultyArena<A> {
    fn allocate(&mut self, size: usize) -> Result<Ref, ArenaError> {
        if self.should_inject_fault() {
            self.injected_failures += 1;
            return Err(ArenaError::InjectedFault(format!(
                "allocation #{} failed",
                self.allocations + 1
            )));
        }
        let node_ref = self.inner.allocate(size)?;
        self.allocations += 1;
        Ok(node_ref)
    }

    fn free(&mut self, node_ref: Ref) {
        self.inner.free(node_ref);
    }

    fn node_bytes_mut(&mut self, node_ref: Ref) -> Result<&mut [u8], ArenaError> {
        self.inner.node_bytes_mut(node_ref)
    }

    fn root_slot(&self, ndx: usize) -> Option<Ref> {
        self.inner.root_slot(ndx)
    }

    fn set_root_slot(&mut self, ndx: usize, node_ref: Ref) {
        self.inner.set_root_slot(ndx, node_ref);
    }

    fn allocated_count(&self) -> usize {
        self.inner.allocated_count()
    }
}
