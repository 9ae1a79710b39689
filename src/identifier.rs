//! WAMP global-scope identifier allocation.
//!
//! Compatible with WAMP Document Revision: RC3, 2014/08/25. IDs in the global
//! scope MUST be drawn randomly from a uniform distribution over the complete
//! range `[0, 2^53]` and must not collide with any ID currently in use.

use std::collections::HashSet;
use std::sync::Mutex;

use rand::Rng;

use crate::ID;

pub const MIN_ID: ID = 0;
pub const MAX_ID: ID = 1 << 53;

/// Draws global-scope IDs, retrying on collision against the set of IDs it
/// has handed out and not yet had released back to it.
///
/// The random source is injectable so tests can run deterministically; the
/// default constructor uses the thread-local RNG.
pub struct IdAllocator<R = rand::rngs::ThreadRng> {
    in_use: Mutex<HashSet<ID>>,
    rng: Mutex<R>,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdAllocator {
    /// Create an allocator backed by the thread-local RNG.
    pub fn new() -> Self {
        IdAllocator {
            in_use: Mutex::new(HashSet::new()),
            rng: Mutex::new(rand::thread_rng()),
        }
    }
}

impl<R: Rng> IdAllocator<R> {
    /// Create an allocator backed by a caller-supplied random source, for
    /// deterministic tests.
    pub fn with_rng(rng: R) -> Self {
        IdAllocator {
            in_use: Mutex::new(HashSet::new()),
            rng: Mutex::new(rng),
        }
    }

    /// Return an ID not currently in use, and record it as in use.
    ///
    /// Collisions are expected to be astronomically rare (the ID space is
    /// `2^53`) but are handled by loop-and-retry rather than assumed away.
    pub fn allocate(&self) -> ID {
        let mut in_use = self.in_use.lock().unwrap();
        let mut rng = self.rng.lock().unwrap();
        loop {
            let candidate = rng.gen_range(MIN_ID..=MAX_ID);
            if in_use.insert(candidate) {
                return candidate;
            }
        }
    }

    /// Release an ID, allowing it to be drawn again later. The allocator
    /// never shrinks this set on its own — callers that own the ID's
    /// lifetime (a closed session, a dropped subscription) are responsible
    /// for calling this.
    pub fn release(&self, id: ID) {
        self.in_use.lock().unwrap().remove(&id);
    }

    /// Number of IDs currently considered in use. Exposed for tests.
    #[cfg(test)]
    fn len(&self) -> usize {
        self.in_use.lock().unwrap().len()
    }
}
