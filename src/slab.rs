//! The per-CPU slab layer: power-of-two size classes served from growable
//! chains of fixed-size pages.
//!
//! Each CPU owns one chain. A chain and everything inside it (page table,
//! page ledgers, live counters) sits behind that CPU's `SpinLock`, and both
//! allocation and free take it, so a free landing on any page of the chain
//! cannot race an allocation walking it. Growing a
//! chain allocates the new page from the global heap while the chain lock
//! is held; that chain→global order is the only place two locks nest, and
//! the global heap never takes a chain lock, so the hierarchy is acyclic.
//!
//! Pages are never given back: an emptied page stays in its chain, ready
//! for reuse. Chains only grow.

use alloc::vec::Vec;

use log::{debug, error, trace};

use crate::arena::Arena;
use crate::global::GlobalHeap;
use crate::header::{AllocHeader, Owner, HEADER_SIZE};
use crate::ledger::{Ledger, Validity};
use crate::sync::SpinLock;

/// Smallest size class. Zero-byte requests round up to it.
pub const MIN_CLASS: usize = 2;

/// The class a request rounds to: the smallest power of two, at least
/// [`MIN_CLASS`], that holds it. Requests whose class would reach the page
/// size never get here; they go to the global arena at their exact size.
pub fn size_class(size: usize) -> usize {
    size.next_power_of_two().max(MIN_CLASS)
}

/// Bookkeeping for one slab page. The page's bytes live in the arena: a
/// header-sized reserve at `base`, then the data region its ledger covers.
struct Page {
    base: usize,
    ledger: Ledger,
    live: usize,
}

impl Page {
    fn contains(&self, offset: usize, page_size: usize) -> bool {
        self.base <= offset && offset < self.base + page_size
    }
}

/// One CPU's append-only chain of pages.
struct Chain {
    pages: Vec<Page>,
}

/// All per-CPU chains, one lock each.
pub(crate) struct Slabs {
    chains: Vec<SpinLock<Chain>>,
    page_size: usize,
}

/// Per-chain counters reported by [`Slabs::audit`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChainStats {
    /// Pages in the chain.
    pub pages: usize,
    /// Live objects across the chain's pages.
    pub live: usize,
    /// Free bytes across the chain's page ledgers.
    pub free_bytes: usize,
    /// Free nodes across the chain's page ledgers.
    pub nodes: usize,
}

impl Slabs {
    /// Build `cpus` chains and give each its first page. Fatal if the
    /// global arena cannot supply them; a heap that cannot hold the
    /// initial pages is a configuration error.
    pub fn new(arena: &Arena, global: &GlobalHeap, cpus: usize, page_size: usize) -> Slabs {
        let mut chains = Vec::with_capacity(cpus);
        for cpu in 0..cpus {
            let mut chain = Chain { pages: Vec::new() };
            if Self::grow(arena, global, &mut chain, page_size).is_none() {
                panic!("heap too small for the initial page of cpu {}", cpu);
            }
            chains.push(SpinLock::new(chain));
        }
        Slabs { chains, page_size }
    }

    pub fn cpus(&self) -> usize {
        self.chains.len()
    }

    /// Append one fresh page to `chain` and return its index, or `None` if
    /// the global arena is out of pages.
    fn grow(
        arena: &Arena,
        global: &GlobalHeap,
        chain: &mut Chain,
        page_size: usize,
    ) -> Option<usize> {
        let base = global.alloc(arena, page_size)?;
        let ledger = Ledger::seed(arena, base + HEADER_SIZE, page_size - HEADER_SIZE);
        chain.pages.push(Page {
            base,
            ledger,
            live: 0,
        });
        debug!(
            "chain grew to {} pages (new page at {})",
            chain.pages.len(),
            base
        );
        Some(chain.pages.len() - 1)
    }

    /// Serve one allocation of `class` bytes (a size class below the page
    /// size) from `cpu`'s chain: first fit page by page in chain order,
    /// then append a fresh page and retry on just that page.
    pub fn alloc(
        &self,
        arena: &Arena,
        global: &GlobalHeap,
        cpu: usize,
        class: usize,
    ) -> Option<usize> {
        let mut chain = self.chains[cpu].lock();

        for page in chain.pages.iter_mut() {
            if let Some(at) = page.ledger.find_first_fit(arena, class) {
                return Some(Self::serve(arena, page, at, cpu, class));
            }
        }

        let fresh = Self::grow(arena, global, &mut chain, self.page_size)?;
        let page = &mut chain.pages[fresh];
        let at = page.ledger.find_first_fit(arena, class)?;
        Some(Self::serve(arena, page, at, cpu, class))
    }

    fn serve(arena: &Arena, page: &mut Page, at: usize, cpu: usize, class: usize) -> usize {
        let slot = page.ledger.carve(arena, at, class);
        // Safety: carved under this chain's lock.
        unsafe { AllocHeader::write(arena, slot, Owner::Cpu(cpu), class) };
        page.live += 1;
        trace!("cpu {} allocated class {} at {}", cpu, class, slot + HEADER_SIZE);
        slot + HEADER_SIZE
    }

    /// Free the slab allocation at data offset `data`. `cpu` is the owner
    /// recorded in its header; routing happened before this call. Fatal if
    /// no page of that CPU contains the offset, or if the header fails
    /// validation once the chain lock is held (a double free lands here).
    pub fn free(&self, arena: &Arena, cpu: usize, data: usize) {
        let slot = data - HEADER_SIZE;
        let page_size = self.page_size;
        let mut chain = self.chains[cpu].lock();

        let page = match chain.pages.iter_mut().find(|p| p.contains(slot, page_size)) {
            Some(page) => page,
            None => {
                error!("cpu {} owns no page containing offset {}", cpu, data);
                panic!("freeing an offset outside every page of its owner");
            }
        };
        // Safety: the chain lock is held; the slot lies inside this page.
        let header = match unsafe { AllocHeader::read(arena, slot) } {
            Some(header) => header,
            None => {
                error!("slab free at {}: header failed validation", data);
                panic!("invalid free of a slab allocation");
            }
        };
        debug_assert_eq!(header.owner, Owner::Cpu(cpu));
        page.ledger
            .insert_and_coalesce(arena, slot, header.len + HEADER_SIZE);
        page.live -= 1;
        trace!("cpu {} freed class {} at {}", cpu, header.len, data);
    }

    /// Audit every chain, one lock at a time. Quiescent use only.
    pub fn audit(&self, arena: &Arena) -> (Validity, Vec<ChainStats>) {
        let mut validity = Validity::default();
        let mut all = Vec::with_capacity(self.chains.len());
        for chain in &self.chains {
            let chain = chain.lock();
            let mut stats = ChainStats {
                pages: chain.pages.len(),
                ..ChainStats::default()
            };
            for page in &chain.pages {
                let (v, s) = page.ledger.audit(arena);
                validity.combine(v);
                stats.live += page.live;
                stats.free_bytes += s.free_bytes;
                stats.nodes += s.nodes;
            }
            all.push(stats);
        }
        (validity, all)
    }

    /// Append every page ledger's free ranges to `out`, chains in CPU
    /// order, pages in chain order.
    pub fn ranges(&self, arena: &Arena, out: &mut Vec<(usize, usize)>) {
        for chain in &self.chains {
            let chain = chain.lock();
            for page in &chain.pages {
                page.ledger.ranges(arena, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_are_powers_of_two_from_two() {
        assert_eq!(size_class(0), 2);
        assert_eq!(size_class(1), 2);
        assert_eq!(size_class(2), 2);
        assert_eq!(size_class(3), 4);
        assert_eq!(size_class(100), 128);
        assert_eq!(size_class(128), 128);
        assert_eq!(size_class(129), 256);
        assert_eq!(size_class(4096), 4096);
        assert_eq!(size_class(4097), 8192);
    }

    #[test]
    fn classes_are_monotonic() {
        let mut last = 0;
        for size in 0..=5000 {
            let class = size_class(size);
            assert!(class >= last, "class shrank at size {}", size);
            assert!(class >= size);
            last = class;
        }
    }

    #[test]
    fn chain_serves_and_recovers_a_class() {
        let arena = Arena::reserve(64 * 1024);
        let global = GlobalHeap::new(&arena);
        let slabs = Slabs::new(&arena, &global, 1, 8192);

        let data = slabs.alloc(&arena, &global, 0, 128).unwrap();
        // Safety: live allocation, quiescent test.
        let header = unsafe { AllocHeader::read(&arena, data - HEADER_SIZE) }.unwrap();
        assert_eq!(header.owner, Owner::Cpu(0));
        assert_eq!(header.len, 128);

        let (validity, stats) = slabs.audit(&arena);
        assert!(validity.is_valid());
        assert_eq!(stats[0].pages, 1);
        assert_eq!(stats[0].live, 1);
        assert_eq!(stats[0].free_bytes, 8192 - HEADER_SIZE - 128 - HEADER_SIZE);

        slabs.free(&arena, 0, data);
        let (validity, stats) = slabs.audit(&arena);
        assert!(validity.is_valid());
        assert_eq!(stats[0].live, 0);
        assert_eq!(stats[0].nodes, 1);
        assert_eq!(stats[0].free_bytes, 8192 - HEADER_SIZE);
    }

    #[test]
    fn chain_grows_when_every_page_is_tight() {
        let arena = Arena::reserve(64 * 1024);
        let global = GlobalHeap::new(&arena);
        let slabs = Slabs::new(&arena, &global, 1, 8192);

        // A fresh 8 KiB page holds seven 1 KiB-class objects: each takes
        // 1088 bytes of the 8128-byte ledger, leaving 512, and an eighth
        // would need 1112 free. The eighth allocation must append a page.
        let mut blocks = Vec::new();
        for _ in 0..7 {
            blocks.push(slabs.alloc(&arena, &global, 0, 1024).unwrap());
        }
        let (_, stats) = slabs.audit(&arena);
        assert_eq!(stats[0].pages, 1);

        blocks.push(slabs.alloc(&arena, &global, 0, 1024).unwrap());
        let (validity, stats) = slabs.audit(&arena);
        assert!(validity.is_valid());
        assert_eq!(stats[0].pages, 2);
        assert_eq!(stats[0].live, 8);

        // Freeing everything coalesces each page back to a single node.
        for data in blocks {
            slabs.free(&arena, 0, data);
        }
        let (validity, stats) = slabs.audit(&arena);
        assert!(validity.is_valid());
        assert_eq!(stats[0].live, 0);
        assert_eq!(stats[0].nodes, 2);
        assert_eq!(stats[0].free_bytes, 2 * (8192 - HEADER_SIZE));
    }
}
