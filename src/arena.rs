//! The owned heap region.
//!
//! One fixed, contiguous byte range is reserved when the allocator is built
//! and released when it drops. Nothing in the crate holds raw addresses into
//! it: ledgers and headers name bytes by offset, and every record access goes
//! through the bounds-asserted word accessors here. An out-of-range offset is
//! treated as corruption and stops the process rather than touching memory
//! outside the region.

use core::alloc::Layout;
use core::ptr::NonNull;

use alloc::alloc::{alloc_zeroed, dealloc, handle_alloc_error};

// All records are read and written as unaligned words, so the region itself
// only needs a modest alignment.
const REGION_ALIGN: usize = 16;

/// One contiguous, fixed-size byte region.
///
/// Every byte belongs to exactly one free-node ledger or to a live
/// allocation. Mutation of ledger-owned bytes happens only under that
/// ledger's lock; bytes of a live allocation are the caller's until freed.
/// That discipline is what keeps the raw accesses below race-free.
pub(crate) struct Arena {
    base: NonNull<u8>,
    len: usize,
}

// Safety: the arena exclusively owns its region; see the struct docs for the
// locking discipline that serializes access to it.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Reserve a zeroed region of `len` bytes. Fatal if the reservation
    /// fails; an allocator without its heap cannot do anything.
    pub fn reserve(len: usize) -> Arena {
        assert!(len > 0, "heap region cannot be empty");
        let layout = match Layout::from_size_align(len, REGION_ALIGN) {
            Ok(layout) => layout,
            Err(_) => panic!("heap size {} is not a representable region", len),
        };
        // Safety: the layout has non-zero size per the assert above.
        let ptr = unsafe { alloc_zeroed(layout) };
        match NonNull::new(ptr) {
            Some(base) => Arena { base, len },
            None => handle_alloc_error(layout),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Raw pointer to the byte at `offset`.
    pub fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        assert!(offset < self.len, "offset {} outside the heap region", offset);
        // Safety: in bounds per the assert above.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
    }

    /// Read the native-endian word at `offset` (any alignment).
    ///
    /// # Safety
    ///
    /// No other context may be writing `[offset, offset + 8)`. Holding the
    /// lock of the ledger that owns the range satisfies this, as does the
    /// range belonging to a live allocation whose handle the caller holds.
    pub unsafe fn read_word(&self, offset: usize) -> u64 {
        self.bounds_check(offset);
        let mut bytes = [0u8; 8];
        core::ptr::copy_nonoverlapping(self.base.as_ptr().add(offset), bytes.as_mut_ptr(), 8);
        u64::from_ne_bytes(bytes)
    }

    /// Write a native-endian word at `offset` (any alignment).
    ///
    /// # Safety
    ///
    /// No other context may be accessing `[offset, offset + 8)`; same
    /// discipline as [`read_word`](Self::read_word).
    pub unsafe fn write_word(&self, offset: usize, value: u64) {
        self.bounds_check(offset);
        let bytes = value.to_ne_bytes();
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.as_ptr().add(offset), 8);
    }

    fn bounds_check(&self, offset: usize) {
        assert!(
            offset.checked_add(8).is_some_and(|end| end <= self.len),
            "record word at {} overruns the heap region ({} bytes)",
            offset,
            self.len
        );
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // Safety: `base` came from `alloc_zeroed` with this exact layout.
        unsafe {
            let layout = Layout::from_size_align_unchecked(self.len, REGION_ALIGN);
            dealloc(self.base.as_ptr(), layout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_roundtrip_at_any_alignment() {
        let arena = Arena::reserve(128);
        unsafe {
            arena.write_word(0, 0xfeed_beef);
            arena.write_word(3, u64::MAX - 1);
            assert_eq!(arena.read_word(3), u64::MAX - 1);
        }
        // The unaligned write at 3 clobbered the word at 0.
        assert_ne!(unsafe { arena.read_word(0) }, 0);
    }

    #[test]
    fn region_starts_zeroed() {
        let arena = Arena::reserve(64);
        assert_eq!(unsafe { arena.read_word(56) }, 0);
    }

    #[test]
    #[should_panic(expected = "overruns the heap region")]
    fn word_access_is_bounds_checked() {
        let arena = Arena::reserve(64);
        let _ = unsafe { arena.read_word(60) };
    }

    #[test]
    #[should_panic(expected = "outside the heap region")]
    fn pointers_are_bounds_checked() {
        let arena = Arena::reserve(64);
        let _ = arena.ptr_at(64);
    }
}
