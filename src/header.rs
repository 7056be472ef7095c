//! Allocation headers.
//!
//! Every data region handed out by either layer is preceded by a fixed
//! header slot recording who owns the allocation, how long it is, and a
//! magic constant. The header is written when a free node is carved and
//! stands until `free` validates it and overwrites it with a reconstructed
//! free node. A second free of the same region finds node words where the
//! magic should be and fails validation, which is fatal.

use crate::arena::Arena;

/// Bytes reserved in front of every data region, and at the front of every
/// page. The records stored in a slot are smaller; the full slot keeps the
/// layout arithmetic uniform across both allocator layers.
pub const HEADER_SIZE: usize = 64;

/// Marks a header as live; the constant spells "malc".
pub(crate) const MAGIC: u32 = 0x6d61_6c63;

/// Owner tag for allocations served by the global arena.
const GLOBAL_TAG: u32 = u32::MAX;

/// Who a live allocation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// Served from this CPU's page chain; freed through its chain lock.
    Cpu(usize),
    /// Served by the global arena: large objects, and the pages themselves.
    Global,
}

/// A decoded, validated allocation header.
///
/// [`read`](AllocHeader::read) refuses to produce one unless the magic
/// constant checks out; converting the slot back into a free node is the
/// only way an allocation ever ends.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AllocHeader {
    pub owner: Owner,
    pub len: usize,
}

impl AllocHeader {
    /// Encode a fresh header at `slot`.
    ///
    /// # Safety
    ///
    /// `[slot, slot + 16)` must lie in a range the caller just carved while
    /// holding the owning ledger's lock.
    pub unsafe fn write(arena: &Arena, slot: usize, owner: Owner, len: usize) {
        let tag = match owner {
            Owner::Cpu(cpu) => cpu as u32,
            Owner::Global => GLOBAL_TAG,
        };
        arena.write_word(slot, (u64::from(tag) << 32) | u64::from(MAGIC));
        arena.write_word(slot + 8, len as u64);
    }

    /// Decode the header at `slot`, or `None` if the magic constant does
    /// not match (dead, clobbered, or never a header).
    ///
    /// # Safety
    ///
    /// Same no-concurrent-writer contract as [`Arena::read_word`]: hold the
    /// owning ledger's lock, or own the live allocation the slot fronts.
    pub unsafe fn read(arena: &Arena, slot: usize) -> Option<AllocHeader> {
        let tagged = arena.read_word(slot);
        if tagged as u32 != MAGIC {
            return None;
        }
        let owner = match (tagged >> 32) as u32 {
            GLOBAL_TAG => Owner::Global,
            cpu => Owner::Cpu(cpu as usize),
        };
        let len = arena.read_word(slot + 8) as usize;
        Some(AllocHeader { owner, len })
    }
}
