//! The big-memory allocator: one ledger spanning the whole heap.
//!
//! Two kinds of requests land here, both under the single global lock:
//! pages for the slab layer, and any user request whose size class reaches
//! the page size. User requests are served at their exact size rather than
//! a rounded class.

use alloc::vec::Vec;

use log::{debug, error, trace};

use crate::arena::Arena;
use crate::header::{AllocHeader, Owner, HEADER_SIZE};
use crate::ledger::{alloc_floor, Ledger, LedgerStats, Validity};
use crate::sync::SpinLock;

struct GlobalState {
    ledger: Ledger,
    /// Live allocations served from here, pages included.
    live: usize,
}

pub(crate) struct GlobalHeap {
    state: SpinLock<GlobalState>,
}

impl GlobalHeap {
    /// Seed the global ledger with one node spanning the whole arena.
    pub fn new(arena: &Arena) -> GlobalHeap {
        let ledger = Ledger::seed(arena, 0, arena.len());
        GlobalHeap {
            state: SpinLock::new(GlobalState { ledger, live: 0 }),
        }
    }

    /// Allocate exactly `size` bytes (plus a header slot). Returns the data
    /// offset, or `None` when no free node can hold the request; the
    /// allocator itself stays fully usable.
    pub fn alloc(&self, arena: &Arena, size: usize) -> Option<usize> {
        let size = alloc_floor(size);
        let mut state = self.state.lock();
        let at = match state.ledger.find_first_fit(arena, size) {
            Some(at) => at,
            None => {
                debug!("global arena exhausted for a {} byte request", size);
                return None;
            }
        };
        let slot = state.ledger.carve(arena, at, size);
        // Safety: the slot was carved under the global lock and is ours.
        unsafe { AllocHeader::write(arena, slot, Owner::Global, size) };
        state.live += 1;
        trace!("global alloc: {} bytes at {}", size, slot + HEADER_SIZE);
        Some(slot + HEADER_SIZE)
    }

    /// Free the allocation whose header sits at `slot`. Routing already
    /// established the owner is the global arena; the header is validated
    /// again under the lock so that a handle freed twice dies here instead
    /// of corrupting the ledger.
    pub fn free(&self, arena: &Arena, slot: usize) {
        let mut state = self.state.lock();
        // Safety: the global lock is held and the slot is in global range.
        let header = match unsafe { AllocHeader::read(arena, slot) } {
            Some(header) => header,
            None => {
                error!("global free at {}: header failed validation", slot + HEADER_SIZE);
                panic!("invalid free of a global allocation");
            }
        };
        debug_assert_eq!(header.owner, Owner::Global);
        state
            .ledger
            .insert_and_coalesce(arena, slot, header.len + HEADER_SIZE);
        state.live -= 1;
        trace!("global free: {} bytes at {}", header.len, slot + HEADER_SIZE);
    }

    /// Audit the global ledger. Quiescent use only.
    pub fn audit(&self, arena: &Arena) -> (Validity, LedgerStats, usize) {
        let state = self.state.lock();
        let (validity, stats) = state.ledger.audit(arena);
        (validity, stats, state.live)
    }

    /// Append the global ledger's free ranges to `out`.
    pub fn ranges(&self, arena: &Arena, out: &mut Vec<(usize, usize)>) {
        let state = self.state.lock();
        state.ledger.ranges(arena, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serves_exact_sizes_and_restores_on_free() {
        let arena = Arena::reserve(64 * 1024);
        let global = GlobalHeap::new(&arena);

        let data = global.alloc(&arena, 10_000).unwrap();
        assert_eq!(data, HEADER_SIZE);
        // Safety: the allocation is live and ours.
        let header = unsafe { AllocHeader::read(&arena, 0) }.unwrap();
        assert_eq!(header.len, 10_000);
        assert_eq!(header.owner, Owner::Global);

        let (validity, stats, live) = global.audit(&arena);
        assert!(validity.is_valid());
        assert_eq!(live, 1);
        assert_eq!(stats.free_bytes, 64 * 1024 - 10_000 - HEADER_SIZE);

        global.free(&arena, 0);
        let (validity, stats, live) = global.audit(&arena);
        assert!(validity.is_valid());
        assert_eq!(live, 0);
        assert_eq!(stats.nodes, 1);
        assert_eq!(stats.free_bytes, 64 * 1024);
    }

    #[test]
    fn exhaustion_is_a_none_not_a_panic() {
        let arena = Arena::reserve(4 * 1024);
        let global = GlobalHeap::new(&arena);
        assert!(global.alloc(&arena, 100 * 1024).is_none());
        // Still healthy and usable afterwards.
        assert!(global.alloc(&arena, 128).is_some());
    }

    #[test]
    #[should_panic(expected = "invalid free of a global allocation")]
    fn freeing_a_dead_slot_is_fatal() {
        let arena = Arena::reserve(4 * 1024);
        let global = GlobalHeap::new(&arena);
        let data = global.alloc(&arena, 128).unwrap();
        global.free(&arena, data - HEADER_SIZE);
        // The first free reconstructed a node over the header; this one
        // must fail validation.
        global.free(&arena, data - HEADER_SIZE);
    }
}
