#![cfg_attr(not(test), no_std)]

//! A concurrent, multi-size-class physical memory allocator.
//!
//! `physalloc` manages one fixed byte arena and serves allocation requests
//! from multiple execution contexts, one per logical CPU, the way a kernel's
//! physical memory manager does. It has no allocator beneath it: all of its
//! bookkeeping lives inside the very bytes it hands out.
//!
//! # Architecture
//!
//! Two layers share one free-list structure:
//!
//! ```text
//!   alloc(cpu, size)                       free(cpu, block)
//!        │                                      │ (routed by header owner)
//!        ▼                                      ▼
//!   ┌───────────────────────────┐    ┌──────────────────────────┐
//!   │ per-CPU slab allocator    │    │ big-memory allocator     │
//!   │ page chains, size classes │───▶│ one ledger, whole heap,  │
//!   │ one spin lock per chain   │    │ one spin lock            │
//!   └───────────────────────────┘    └──────────────────────────┘
//!            pages carved from the global ledger ▲
//! ```
//!
//! Requests whose power-of-two size class stays below the page size are
//! served from the calling CPU's chain of pages, rounded up to the class.
//! Everything else (including the pages themselves) comes from the global
//! ledger at the exact requested size.
//!
//! Free memory is tracked by ledgers: address-ordered doubly linked lists
//! whose node records are serialized into the free ranges they describe, so
//! an idle heap costs nothing beyond the arena itself. Links are arena
//! offsets rather than pointers; every access is bounds-checked against the
//! owned region.
//!
//! # Handles
//!
//! [`alloc`](PhysAlloc::alloc) returns a [`Block`], an opaque handle that
//! cannot be cloned and is consumed by [`free`](PhysAlloc::free). Every
//! allocation carries a hidden header (owner, length, magic constant);
//! `free` validates it before touching any ledger and panics on a mismatch,
//! so double frees and wild handles are caught instead of corrupting the
//! heap. Exhaustion, by contrast, is an ordinary `None`.
//!
//! # Concurrency
//!
//! Each CPU's chain has one spin lock taken by both allocation and free;
//! the global ledger has its own. The only nesting is chain→global (page
//! procurement), so the hierarchy is acyclic. Any CPU may free any block;
//! the header's owner field routes the free to the right lock.

extern crate alloc;

use alloc::vec::Vec;

use core::ptr::NonNull;

use log::{error, info};
use static_assertions::assert_impl_all;

mod arena;
mod global;
mod header;
mod ledger;
mod slab;
pub mod sync;

pub use crate::header::{Owner, HEADER_SIZE};
pub use crate::ledger::{LedgerStats, Validity, NODE_SIZE};
pub use crate::slab::{size_class, ChainStats, MIN_CLASS};

use crate::arena::Arena;
use crate::global::GlobalHeap;
use crate::header::AllocHeader;
use crate::slab::Slabs;

/// Upper bound on configurable CPUs; the owner field in headers and the
/// per-chain lock table are sized for it.
pub const MAX_CPUS: usize = 128;

/// Geometry for one allocator instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Total arena size in bytes.
    pub heap_size: usize,
    /// Slab page size in bytes; also the boundary between the slab and
    /// global layers.
    pub page_size: usize,
    /// Number of per-CPU chains.
    pub cpus: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            heap_size: 1 << 30,
            page_size: 8 << 10,
            cpus: 4,
        }
    }
}

impl Config {
    fn validate(&self) {
        assert!(
            self.page_size.is_power_of_two(),
            "page size {} is not a power of two",
            self.page_size
        );
        // The largest slab class is half a page; a fresh page must be able
        // to hold one of it plus the page's own reserve and slack.
        assert!(
            self.page_size >= 8 * HEADER_SIZE,
            "page size {} is too small for its size classes",
            self.page_size
        );
        assert!(
            self.cpus >= 1 && self.cpus <= MAX_CPUS,
            "cpu count {} outside 1..={}",
            self.cpus,
            MAX_CPUS
        );
        let initial = (self.page_size + HEADER_SIZE)
            .checked_mul(self.cpus)
            .unwrap_or(usize::MAX);
        assert!(
            self.heap_size >= initial,
            "{} byte heap cannot hold {} initial pages",
            self.heap_size,
            self.cpus
        );
    }
}

/// A live allocation: an opaque handle to its data region.
///
/// Handles cannot be cloned and are consumed by [`PhysAlloc::free`], so a
/// safe caller cannot free one twice. Dropping a `Block` without freeing it
/// leaks its range until the allocator itself is dropped.
#[derive(Debug)]
#[must_use = "an unfreed block leaks its arena range"]
pub struct Block {
    offset: usize,
}

impl Block {
    /// Arena offset of the data region; stable for the allocation's
    /// lifetime.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// Counters and sizes across every ledger, from [`PhysAlloc::stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemStats {
    /// Arena size in bytes.
    pub heap_bytes: usize,
    /// Free-space accounting of the global ledger.
    pub global_free: LedgerStats,
    /// Live allocations served by the global arena, pages included.
    pub global_live: usize,
    /// Per-CPU chain accounting, indexed by CPU.
    pub chains: Vec<ChainStats>,
}

impl MemStats {
    /// Free bytes across the global ledger and every page ledger.
    pub fn free_bytes(&self) -> usize {
        self.global_free.free_bytes + self.chains.iter().map(|c| c.free_bytes).sum::<usize>()
    }
}

/// The allocator: an owned arena, the global heap, and the per-CPU chains.
///
/// All methods take `&self`; the instance is meant to be shared across the
/// contexts that call into it.
pub struct PhysAlloc {
    arena: Arena,
    global: GlobalHeap,
    slabs: Slabs,
    page_size: usize,
}

assert_impl_all!(PhysAlloc: Send, Sync);

impl PhysAlloc {
    /// Build an allocator over a freshly reserved heap: the global ledger
    /// spans the whole region, and every CPU starts with one page.
    ///
    /// # Panics
    ///
    /// On a nonsensical `Config`. A failed region reservation aborts
    /// through the allocation-error hook; an allocator without its heap
    /// cannot run.
    pub fn new(config: Config) -> PhysAlloc {
        config.validate();
        let arena = Arena::reserve(config.heap_size);
        let global = GlobalHeap::new(&arena);
        let slabs = Slabs::new(&arena, &global, config.cpus, config.page_size);
        info!(
            "physalloc up: {} KiB heap, {} KiB pages, {} cpus",
            config.heap_size / 1024,
            config.page_size / 1024,
            config.cpus
        );
        PhysAlloc {
            arena,
            global,
            slabs,
            page_size: config.page_size,
        }
    }

    /// Number of configured CPU chains.
    pub fn cpus(&self) -> usize {
        self.slabs.cpus()
    }

    /// The slab page size (and slab/global boundary) in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Arena size in bytes.
    pub fn heap_size(&self) -> usize {
        self.arena.len()
    }

    /// Allocate `size` bytes for `cpu`.
    ///
    /// Sizes whose class stays below the page size come from the CPU's
    /// chain, rounded up to the class; everything else comes from the
    /// global arena at the exact size. `None` means no free node can hold
    /// the request; the allocator remains fully usable.
    ///
    /// # Panics
    ///
    /// If `cpu` is not a configured index.
    pub fn alloc(&self, cpu: usize, size: usize) -> Option<Block> {
        assert!(
            cpu < self.slabs.cpus(),
            "cpu {} out of range (configured {})",
            cpu,
            self.slabs.cpus()
        );
        let offset = if size >= self.page_size {
            self.global.alloc(&self.arena, size)
        } else {
            let class = size_class(size);
            if class >= self.page_size {
                self.global.alloc(&self.arena, size)
            } else {
                self.slabs.alloc(&self.arena, &self.global, cpu, class)
            }
        }?;
        Some(Block { offset })
    }

    /// Release `block`.
    ///
    /// Any CPU may free any block: routing follows the owner recorded in
    /// the block's header, not `cpu`, which is only reported in
    /// diagnostics.
    ///
    /// # Panics
    ///
    /// If the header fails validation, or no page of the owning CPU
    /// contains the block: a double free through a duplicated handle, a
    /// wild handle, or a buffer overrun into the header.
    pub fn free(&self, cpu: usize, block: Block) {
        let Block { offset } = block;
        let slot = match offset.checked_sub(HEADER_SIZE) {
            Some(slot) => slot,
            None => panic!("offset {} cannot front a header", offset),
        };
        // Safety: a live block's header is quiescent; only `free` ever
        // rewrites it, and this call just consumed the handle. Each layer
        // validates again under its lock before mutating a ledger.
        let header = match unsafe { AllocHeader::read(&self.arena, slot) } {
            Some(header) => header,
            None => {
                error!("cpu {} freeing offset {}: header failed validation", cpu, offset);
                panic!("invalid free: not a live allocation");
            }
        };
        match header.owner {
            Owner::Global => self.global.free(&self.arena, slot),
            Owner::Cpu(owner) => {
                assert!(
                    owner < self.slabs.cpus(),
                    "header names cpu {} which is not configured",
                    owner
                );
                self.slabs.free(&self.arena, owner, offset);
            }
        }
    }

    /// Pointer to `block`'s data region, [`usable_size`](Self::usable_size)
    /// bytes long. Writing through it is as unsafe as using any allocator's
    /// memory; staying within the region is the caller's contract.
    pub fn block_ptr(&self, block: &Block) -> NonNull<u8> {
        self.arena.ptr_at(block.offset)
    }

    /// The length recorded for `block`: its size class, or the exact
    /// requested size for global allocations.
    pub fn usable_size(&self, block: &Block) -> usize {
        self.describe(block).1
    }

    /// Owner and recorded length of a live block.
    pub fn describe(&self, block: &Block) -> (Owner, usize) {
        // Safety: `block` is live, so its header is quiescent.
        let header = match unsafe { AllocHeader::read(&self.arena, block.offset - HEADER_SIZE) } {
            Some(header) => header,
            None => panic!("live block at {} has an invalid header", block.offset),
        };
        (header.owner, header.len)
    }

    /// Audit every ledger and snapshot all counters. Meaningful at
    /// quiescent points; locks are taken one at a time (chains in CPU
    /// order, then the global ledger).
    pub fn stats(&self) -> (Validity, MemStats) {
        let (mut validity, chains) = self.slabs.audit(&self.arena);
        let (global_validity, global_free, global_live) = self.global.audit(&self.arena);
        validity.combine(global_validity);
        let stats = MemStats {
            heap_bytes: self.arena.len(),
            global_free,
            global_live,
            chains,
        };
        (validity, stats)
    }

    /// Every free range as `(offset, len)`: the global ledger first, then
    /// each CPU's pages in chain order. A debugging and test aid.
    pub fn free_ranges(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        self.global.ranges(&self.arena, &mut out);
        self.slabs.ranges(&self.arena, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> Config {
        Config {
            heap_size: 1 << 20,
            page_size: 8 << 10,
            cpus: 2,
        }
    }

    #[test]
    fn construction_seeds_a_page_per_cpu() {
        let heap = PhysAlloc::new(small());
        let (validity, stats) = heap.stats();
        assert!(validity.is_valid());
        assert_eq!(stats.chains.len(), 2);
        for chain in &stats.chains {
            assert_eq!(chain.pages, 1);
            assert_eq!(chain.live, 0);
            assert_eq!(chain.nodes, 1);
            assert_eq!(chain.free_bytes, heap.page_size() - HEADER_SIZE);
        }
        // The pages themselves are live global allocations.
        assert_eq!(stats.global_live, 2);
        assert_eq!(
            stats.global_free.free_bytes,
            (1 << 20) - 2 * (heap.page_size() + HEADER_SIZE)
        );
    }

    #[test]
    fn zero_size_requests_get_the_smallest_class() {
        let heap = PhysAlloc::new(small());
        let block = heap.alloc(0, 0).unwrap();
        assert_eq!(heap.describe(&block), (Owner::Cpu(0), MIN_CLASS));
        assert_eq!(heap.usable_size(&block), MIN_CLASS);
        heap.free(0, block);
        let (validity, stats) = heap.stats();
        assert!(validity.is_valid());
        assert_eq!(stats.chains[0].live, 0);
    }

    #[test]
    fn any_cpu_may_free_any_block() {
        let heap = PhysAlloc::new(small());
        let block = heap.alloc(0, 100).unwrap();
        assert_eq!(heap.describe(&block).0, Owner::Cpu(0));
        heap.free(1, block);
        let (validity, stats) = heap.stats();
        assert!(validity.is_valid());
        assert_eq!(stats.chains[0].live, 0);
        assert_eq!(stats.chains[0].free_bytes, heap.page_size() - HEADER_SIZE);
    }

    #[test]
    fn exhaustion_is_recoverable() {
        let heap = PhysAlloc::new(Config {
            heap_size: 64 << 10,
            page_size: 8 << 10,
            cpus: 1,
        });
        // Far larger than the remaining global space.
        assert!(heap.alloc(0, 60_000).is_none());
        // The allocator is untouched and keeps serving.
        let block = heap.alloc(0, 1000).unwrap();
        assert_eq!(heap.usable_size(&block), 1024);
        heap.free(0, block);
        let (validity, _) = heap.stats();
        assert!(validity.is_valid());
    }

    #[test]
    fn writes_through_the_block_pointer_stay_put() {
        let heap = PhysAlloc::new(small());
        let block = heap.alloc(0, 16).unwrap();
        let len = heap.usable_size(&block);
        let ptr = heap.block_ptr(&block).as_ptr();
        // Safety: the region is ours and `len` bytes long.
        unsafe {
            for i in 0..len {
                ptr.add(i).write(0xab);
            }
            for i in 0..len {
                assert_eq!(ptr.add(i).read(), 0xab);
            }
        }
        heap.free(0, block);
        let (validity, _) = heap.stats();
        assert!(validity.is_valid());
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn out_of_range_cpu_is_fatal() {
        let heap = PhysAlloc::new(small());
        let _ = heap.alloc(2, 8);
    }

    #[test]
    #[should_panic(expected = "invalid free")]
    fn double_free_is_fatal() {
        let heap = PhysAlloc::new(small());
        let block = heap.alloc(0, 100).unwrap();
        // Forge a second handle to the same region; safe callers cannot.
        let dup = Block {
            offset: block.offset(),
        };
        heap.free(0, block);
        heap.free(0, dup);
    }

    #[test]
    #[should_panic(expected = "cannot hold")]
    fn config_must_fit_its_initial_pages() {
        let _ = PhysAlloc::new(Config {
            heap_size: 8 << 10,
            page_size: 8 << 10,
            cpus: 1,
        });
    }
}
