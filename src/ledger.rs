//! The free-node ledger: an address-ordered, doubly linked free list whose
//! node records live inside the free ranges they describe.
//!
//! Both allocator layers speak this structure. The global arena keeps one
//! ledger over every byte it has not handed out; each slab page keeps one
//! over its data region. A node is three words (length, previous, next)
//! serialized at the first bytes of its range, with links stored as arena
//! offsets (`NIL` for none). A range's length includes the record itself.
//!
//! All mutating methods take `&mut self`, and every `Ledger` lives inside a
//! `SpinLock`, so holding the owning lock is what makes the raw word traffic
//! underneath these methods race-free.

use alloc::vec::Vec;

use log::trace;
use static_assertions::const_assert;

use crate::arena::Arena;
use crate::header::HEADER_SIZE;

/// Serialized size of one free-node record (length, prev, next).
pub const NODE_SIZE: usize = 24;

// A freed range starts at its dead allocation header and is therefore at
// least one header slot long; the reconstructed node record must fit there,
// and so must the header's own two words.
const_assert!(NODE_SIZE <= HEADER_SIZE);
const_assert!(16 <= HEADER_SIZE);

/// Link word meaning "no node".
const NIL: u64 = u64::MAX;

fn enc(link: Option<usize>) -> u64 {
    match link {
        Some(offset) => offset as u64,
        None => NIL,
    }
}

fn dec(word: u64) -> Option<usize> {
    if word == NIL {
        None
    } else {
        Some(word as usize)
    }
}

/// One decoded free-node record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Node {
    len: usize,
    prev: Option<usize>,
    next: Option<usize>,
}

impl Node {
    fn load(arena: &Arena, at: usize) -> Node {
        // Safety: `at` is a node of a ledger whose lock the caller holds.
        unsafe {
            Node {
                len: arena.read_word(at) as usize,
                prev: dec(arena.read_word(at + 8)),
                next: dec(arena.read_word(at + 16)),
            }
        }
    }

    fn store(self, arena: &Arena, at: usize) {
        // Safety: as in `load`.
        unsafe {
            arena.write_word(at, self.len as u64);
            arena.write_word(at + 8, enc(self.prev));
            arena.write_word(at + 16, enc(self.next));
        }
    }
}

/// Round a request up so that the range freed later (request plus header)
/// can always host a node record.
pub(crate) fn alloc_floor(size: usize) -> usize {
    size.max(NODE_SIZE.saturating_sub(HEADER_SIZE))
}

/// One free-node ledger: a head offset into the arena holding its records.
///
/// The ledger does not know which byte range it covers; the owning layer
/// seeds it and only ever returns ranges to it that were carved from it.
pub(crate) struct Ledger {
    head: Option<usize>,
}

impl Ledger {
    /// Start a ledger with one node spanning `[start, start + len)`.
    pub fn seed(arena: &Arena, start: usize, len: usize) -> Ledger {
        debug_assert!(len >= NODE_SIZE);
        Node {
            len,
            prev: None,
            next: None,
        }
        .store(arena, start);
        Ledger { head: Some(start) }
    }

    /// First node able to hold `size` bytes plus a header, with enough slack
    /// that the remainder is itself a representable node (possibly an empty
    /// one, just the record). `None` if nothing fits.
    pub fn find_first_fit(&self, arena: &Arena, size: usize) -> Option<usize> {
        let want = size.checked_add(HEADER_SIZE + NODE_SIZE)?;
        let mut cursor = self.head;
        while let Some(at) = cursor {
            let node = Node::load(arena, at);
            if node.len >= want {
                return Some(at);
            }
            cursor = node.next;
        }
        None
    }

    /// Carve `size + HEADER_SIZE` bytes off the front of the node at `at`,
    /// relocating its record past the carved range and rewiring its
    /// neighbors (and the head, if `at` was the head). Returns the offset of
    /// the vacated header slot.
    ///
    /// `at` must come from [`find_first_fit`](Self::find_first_fit) for the
    /// same `size`.
    pub fn carve(&mut self, arena: &Arena, at: usize, size: usize) -> usize {
        let node = Node::load(arena, at);
        let consumed = size + HEADER_SIZE;
        debug_assert!(node.len >= consumed + NODE_SIZE);

        let moved = at + consumed;
        Node {
            len: node.len - consumed,
            ..node
        }
        .store(arena, moved);
        trace!("carved {} bytes at {}, node moved to {}", consumed, at, moved);

        match node.prev {
            None => self.head = Some(moved),
            Some(prev) => {
                let mut before = Node::load(arena, prev);
                before.next = Some(moved);
                before.store(arena, prev);
            }
        }
        if let Some(next) = node.next {
            let mut after = Node::load(arena, next);
            after.prev = Some(moved);
            after.store(arena, next);
        }
        at
    }

    /// Return `[at, at + len)` to the ledger: ordered insert (new head, a
    /// gap, or the tail), then adjacency coalescing. Up to three contiguous
    /// regions (predecessor, this range, successor) collapse into one.
    pub fn insert_and_coalesce(&mut self, arena: &Arena, at: usize, len: usize) {
        debug_assert!(len >= NODE_SIZE);
        trace!("returning [{}, {}) to the ledger", at, at + len);

        let (prev, next) = match self.head {
            None => {
                self.head = Some(at);
                (None, None)
            }
            Some(head) if at < head => {
                self.head = Some(at);
                (None, Some(head))
            }
            Some(head) => {
                let mut anchor = head;
                loop {
                    let node = Node::load(arena, anchor);
                    match node.next {
                        Some(follow) if follow < at => anchor = follow,
                        other => break (Some(anchor), other),
                    }
                }
            }
        };
        debug_assert!(prev != Some(at) && next != Some(at), "range is already free");

        Node { len, prev, next }.store(arena, at);
        if let Some(p) = prev {
            let mut before = Node::load(arena, p);
            debug_assert!(p + before.len <= at, "freed range overlaps its predecessor");
            before.next = Some(at);
            before.store(arena, p);
        }
        if let Some(n) = next {
            let mut after = Node::load(arena, n);
            debug_assert!(at + len <= n, "freed range overlaps its successor");
            after.prev = Some(at);
            after.store(arena, n);
        }

        // Fold the new node into a byte-adjacent predecessor, then let
        // whichever node now fronts the range try to swallow its successor.
        let front = match prev {
            Some(p) if p + Node::load(arena, p).len == at => {
                Self::try_merge_next(arena, p);
                p
            }
            _ => at,
        };
        Self::try_merge_next(arena, front);
    }

    /// Merge the node at `at` with its successor if the two are
    /// byte-adjacent. Returns whether a merge happened.
    fn try_merge_next(arena: &Arena, at: usize) -> bool {
        let mut node = Node::load(arena, at);
        let next_at = match node.next {
            Some(n) => n,
            None => return false,
        };
        if at + node.len != next_at {
            return false;
        }
        let next = Node::load(arena, next_at);
        node.len += next.len;
        node.next = next.next;
        node.store(arena, at);
        if let Some(follow) = next.next {
            let mut after = Node::load(arena, follow);
            after.prev = Some(at);
            after.store(arena, follow);
        }
        trace!("merged [{}, {}) into its predecessor", next_at, next_at + next.len);
        true
    }

    /// Walk the ledger, checking structure and accumulating size stats.
    /// Quiescent use only (hold the owning lock).
    pub fn audit(&self, arena: &Arena) -> (Validity, LedgerStats) {
        let mut validity = Validity::default();
        let mut stats = LedgerStats::default();

        // A corrupted ledger could cycle; cap the walk at the most nodes
        // the arena could possibly hold.
        let cap = arena.len() / NODE_SIZE + 1;
        let mut walked = 0;

        let mut previous: Option<(usize, usize)> = None;
        let mut cursor = self.head;
        while let Some(at) = cursor {
            walked += 1;
            if walked > cap {
                validity.out_of_orders += 1;
                break;
            }
            let node = Node::load(arena, at);
            stats.nodes += 1;
            stats.free_bytes += node.len;
            stats.largest = stats.largest.max(node.len);

            if node.prev != previous.map(|(p, _)| p) {
                validity.out_of_orders += 1;
            }
            if let Some((p_at, p_len)) = previous {
                if p_at >= at {
                    validity.out_of_orders += 1;
                } else {
                    let p_end = p_at + p_len;
                    if p_end > at {
                        validity.overlaps += 1;
                    } else if p_end == at {
                        validity.adjacents += 1;
                    }
                }
            }

            previous = Some((at, node.len));
            cursor = node.next;
        }
        (validity, stats)
    }

    /// Append every `(offset, len)` range in walk order to `out`.
    pub fn ranges(&self, arena: &Arena, out: &mut Vec<(usize, usize)>) {
        let mut cursor = self.head;
        while let Some(at) = cursor {
            let node = Node::load(arena, at);
            out.push((at, node.len));
            cursor = node.next;
        }
    }
}

/// Structural findings from auditing ledgers at a quiescent point. All
/// counts are zero for a healthy allocator.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Validity {
    /// Pairs of free nodes whose byte ranges overlap.
    pub overlaps: usize,
    /// Pairs of byte-adjacent free nodes that should have been merged.
    pub adjacents: usize,
    /// Nodes out of ascending-offset order or with broken back-links
    /// (including walk cycles).
    pub out_of_orders: usize,
}

impl Validity {
    pub fn is_valid(&self) -> bool {
        self.overlaps == 0 && self.adjacents == 0 && self.out_of_orders == 0
    }

    pub(crate) fn combine(&mut self, other: Validity) {
        self.overlaps += other.overlaps;
        self.adjacents += other.adjacents;
        self.out_of_orders += other.out_of_orders;
    }
}

/// Size accounting for one ledger (or a sum over several).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LedgerStats {
    /// Number of free nodes.
    pub nodes: usize,
    /// Total free bytes (node records included; they are free space too).
    pub free_bytes: usize,
    /// Length of the largest free node.
    pub largest: usize,
}
