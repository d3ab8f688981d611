// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Variable-size heap: first-fit with eager forward coalescing.
//!
//! The heap is a single borrowed region divided into contiguous blocks.
//! Each block starts with a four-byte header encoding the block's total
//! size (header included, always a multiple of four, so the low two bits
//! are spare) and a used flag in bit 0. There is no free list and no
//! footer: the next block is always at `offset + size`, and a free block's
//! size describes the run of unallocated space up to the next used block
//! or the end of the region.
//!
//! Allocation scans from the region head. At each free block it first
//! greedily merges any free blocks that follow -- this is the only
//! coalescing step, so fragmentation is resolved on demand rather than
//! tracked. If the merged block is big enough it is either split (when the
//! remainder can hold a header plus a minimum allocation) or claimed whole.
//!
//! The structure is `&mut`-only; ISR safety comes from the kernel's
//! critical-section wrapper, not from this crate.

#![cfg_attr(not(test), no_std)]

use core::marker::PhantomData;
use core::ptr::NonNull;

/// Bytes of bookkeeping at the start of every block.
pub const HDR_SIZE: usize = 4;

/// Smallest data payload a block is allowed to carry. Splits that would
/// produce a smaller remainder don't happen; the whole block is claimed.
const MIN_DATA: usize = 4;

const USED: u32 = 1;

/// Walk-the-region statistics, as reported by [`Heap::stats`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct HeapStats {
    /// Total allocatable bytes in free blocks (headers excluded).
    pub free_bytes: usize,
    /// Total bytes handed out in used blocks (headers excluded).
    pub used_bytes: usize,
    /// Largest single allocation that could currently succeed.
    pub largest_free: usize,
    /// Number of free blocks. Trends back toward 1 as coalescing catches
    /// up with churn.
    pub fragments: usize,
}

/// A first-fit heap over a borrowed region.
pub struct Heap<'r> {
    base: *mut u8,
    len: usize,
    _region: PhantomData<&'r mut [u8]>,
}

impl<'r> Heap<'r> {
    /// Creates a heap spanning `region`, initialized as one free block.
    ///
    /// The region must be 4-byte aligned; a trailing partial word is left
    /// unused.
    ///
    /// # Panics
    ///
    /// Panics on a misaligned region or one too small for a single minimal
    /// block.
    pub fn new(region: &'r mut [u8]) -> Self {
        assert_eq!(region.as_ptr() as usize % 4, 0);
        let len = region.len() & !3;
        assert!(len >= HDR_SIZE + MIN_DATA);

        let mut heap = Self {
            base: region.as_mut_ptr(),
            len,
            _region: PhantomData,
        };
        heap.set_hdr(0, len as u32);
        heap
    }

    /// Allocates `size` bytes, rounded up to a multiple of four. Returns
    /// `None` for a zero-size request or when no block is big enough.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let mut need = size.checked_add(3)? & !3;
        need = need.checked_add(HDR_SIZE)?;
        if need < HDR_SIZE + MIN_DATA {
            need = HDR_SIZE + MIN_DATA;
        }

        let mut off = 0;
        while off < self.len {
            let info = self.hdr(off);
            if info & USED != 0 {
                off += block_size(info);
                continue;
            }

            let size = self.coalesce_forward(off);
            if size >= need {
                if size - need >= HDR_SIZE + MIN_DATA {
                    // Split: claim exactly `need`, leave the remainder as
                    // a fresh free block.
                    self.set_hdr(off + need, (size - need) as u32);
                    self.set_hdr(off, need as u32 | USED);
                } else {
                    self.set_hdr(off, size as u32 | USED);
                }
                // Safety: off + HDR_SIZE is in bounds and nonzero.
                return Some(unsafe {
                    NonNull::new_unchecked(self.base.add(off + HDR_SIZE))
                });
            }

            off += size;
        }

        None
    }

    /// Returns a block to the heap and merges any free blocks after it.
    ///
    /// The pointer must be one previously returned by [`Self::alloc`].
    /// Anything else -- out-of-range pointers, interior pointers, blocks
    /// already freed -- is detected by walking the block list and ignored.
    pub fn free(&mut self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        let start = self.base as usize;
        if addr < start + HDR_SIZE || addr >= start + self.len {
            return;
        }
        let target = addr - start - HDR_SIZE;

        // Confirm `target` is a real used-block boundary. The walk makes
        // a stale or repeated free harmless instead of corrupting the
        // block chain.
        let mut off = 0;
        while off < self.len {
            let info = self.hdr(off);
            if off == target {
                if info & USED == 0 {
                    return;
                }
                self.set_hdr(off, info & !USED);
                self.coalesce_forward(off);
                return;
            }
            if off > target {
                return;
            }
            off += block_size(info);
        }
    }

    /// Walks the region and totals up free/used bytes and fragmentation.
    pub fn stats(&self) -> HeapStats {
        let mut s = HeapStats::default();
        let mut off = 0;
        while off < self.len {
            let info = self.hdr(off);
            let size = block_size(info);
            let data = size - HDR_SIZE;
            if info & USED != 0 {
                s.used_bytes += data;
            } else {
                s.free_bytes += data;
                s.fragments += 1;
                if data > s.largest_free {
                    s.largest_free = data;
                }
            }
            off += size;
        }
        s
    }

    /// Total region size in bytes, headers included.
    pub fn region_size(&self) -> usize {
        self.len
    }

    /// Merges every free block immediately following the free block at
    /// `off` into it, and returns the resulting size.
    fn coalesce_forward(&mut self, off: usize) -> usize {
        let mut size = block_size(self.hdr(off));
        loop {
            let next = off + size;
            if next >= self.len {
                break;
            }
            let ninfo = self.hdr(next);
            if ninfo & USED != 0 {
                break;
            }
            size += block_size(ninfo);
        }
        self.set_hdr(off, size as u32);
        size
    }

    fn hdr(&self, off: usize) -> u32 {
        debug_assert!(off + HDR_SIZE <= self.len);
        // Safety: headers are always within the region and 4-aligned
        // (offsets advance by multiples of four from an aligned base).
        unsafe { (self.base.add(off) as *const u32).read() }
    }

    fn set_hdr(&mut self, off: usize, v: u32) {
        debug_assert!(off + HDR_SIZE <= self.len);
        // Safety: as in `hdr`.
        unsafe { (self.base.add(off) as *mut u32).write(v) }
    }
}

// Safety: the raw pointer refers only to the borrowed region, which moves
// with the heap.
unsafe impl Send for Heap<'_> {}

fn block_size(info: u32) -> usize {
    (info & !3) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(4))]
    struct Region([u8; 256]);

    fn mem() -> Region {
        Region([0; 256])
    }

    fn assert_conserved(heap: &Heap<'_>) {
        // Block sizes must tile the region exactly; free + used + header
        // overhead equals the region size.
        let s = heap.stats();
        let headers = (s.fragments + used_block_count(heap)) * HDR_SIZE;
        assert_eq!(
            s.free_bytes + s.used_bytes + headers,
            heap.region_size()
        );
    }

    fn used_block_count(heap: &Heap<'_>) -> usize {
        // Derive from stats by walking: stats counts only free fragments,
        // so recompute the used count from totals.
        let mut count = 0;
        let mut off = 0;
        while off < heap.region_size() {
            let info = heap.hdr(off);
            if info & USED != 0 {
                count += 1;
            }
            off += block_size(info);
        }
        count
    }

    #[test]
    fn starts_as_one_free_block() {
        let mut m = mem();
        let heap = Heap::new(&mut m.0);
        let s = heap.stats();
        assert_eq!(s.fragments, 1);
        assert_eq!(s.free_bytes, 256 - HDR_SIZE);
        assert_eq!(s.used_bytes, 0);
        assert_eq!(s.largest_free, 252);
    }

    #[test]
    fn zero_size_alloc_fails() {
        let mut m = mem();
        let mut heap = Heap::new(&mut m.0);
        assert!(heap.alloc(0).is_none());
    }

    #[test]
    fn small_allocs_round_up() {
        let mut m = mem();
        let mut heap = Heap::new(&mut m.0);
        let _ = heap.alloc(1).unwrap();
        let s = heap.stats();
        // 1 byte rounds up to the 4-byte minimum payload.
        assert_eq!(s.used_bytes, 4);
        assert_conserved(&heap);
    }

    #[test]
    fn split_exactly_enough_vs_one_short() {
        // Region: 64 bytes. First grab everything except what we want to
        // test, then check the split boundary.
        let mut m = mem();
        let mut heap = Heap::new(&mut m.0[..64]);

        // need = 24 + 4 = 28; leftover = 64 - 28 = 36 >= 8, so this must
        // split into a 28-byte used block and a 36-byte free block.
        let a = heap.alloc(24).unwrap();
        let s = heap.stats();
        assert_eq!(s.used_bytes, 24);
        assert_eq!(s.free_bytes, 36 - HDR_SIZE);
        assert_eq!(s.fragments, 1);

        // The free block is 36 bytes total. Asking for 28 bytes of data
        // (need = 32) leaves 4 -- one byte short of a minimal block -- so
        // the whole 36-byte block must be claimed.
        let b = heap.alloc(28).unwrap();
        let s = heap.stats();
        assert_eq!(s.fragments, 0);
        assert_eq!(s.used_bytes, 24 + 32);

        heap.free(a);
        heap.free(b);
        assert_conserved(&heap);
    }

    #[test]
    fn exact_split_leaves_minimal_block() {
        let mut m = mem();
        let mut heap = Heap::new(&mut m.0[..64]);
        // need = 52 + 4 = 56; leftover = 8 == HDR + MIN_DATA exactly, so a
        // minimal free block must be split off.
        let _ = heap.alloc(52).unwrap();
        let s = heap.stats();
        assert_eq!(s.fragments, 1);
        assert_eq!(s.free_bytes, MIN_DATA);
    }

    #[test]
    fn free_at_start_middle_end_coalesces() {
        let mut m = mem();
        let mut heap = Heap::new(&mut m.0);
        let a = heap.alloc(32).unwrap();
        let b = heap.alloc(32).unwrap();
        let c = heap.alloc(32).unwrap();

        // Free the middle, then the start: the start block's next alloc
        // scan will merge through the middle hole.
        heap.free(b);
        assert_eq!(heap.stats().fragments, 2);
        heap.free(a);
        // a and b are adjacent frees now; an allocation scan merges them.
        let big = heap.alloc(60).unwrap();
        assert_conserved(&heap);

        heap.free(big);
        heap.free(c);
        // Everything freed; one alloc pass collapses it back to a single
        // block.
        let all = heap.alloc(252).unwrap();
        assert_eq!(heap.stats().fragments, 0);
        heap.free(all);
        let s = heap.stats();
        assert_eq!(s.fragments, 1);
        assert_eq!(s.free_bytes, 256 - HDR_SIZE);
    }

    #[test]
    fn double_free_is_ignored() {
        let mut m = mem();
        let mut heap = Heap::new(&mut m.0);
        let a = heap.alloc(16).unwrap();
        let b = heap.alloc(16).unwrap();
        heap.free(a);
        let before = heap.stats();
        heap.free(a);
        assert_eq!(heap.stats(), before);
        heap.free(b);
        assert_conserved(&heap);
    }

    #[test]
    fn interior_and_foreign_pointers_are_ignored() {
        let mut m = mem();
        let mut heap = Heap::new(&mut m.0);
        let a = heap.alloc(16).unwrap();
        let before = heap.stats();

        // Safety: constructing in-range pointers only to hand them to
        // free(), which validates them.
        let interior = unsafe { NonNull::new_unchecked(a.as_ptr().add(4)) };
        heap.free(interior);
        assert_eq!(heap.stats(), before);

        let mut outside = [0u8; 4];
        let foreign = NonNull::new(outside.as_mut_ptr()).unwrap();
        heap.free(foreign);
        assert_eq!(heap.stats(), before);
    }

    #[test]
    fn oom_returns_none_without_damage() {
        let mut m = mem();
        let mut heap = Heap::new(&mut m.0);
        assert!(heap.alloc(1024).is_none());
        let a = heap.alloc(100).unwrap();
        assert!(heap.alloc(200).is_none());
        heap.free(a);
        assert_conserved(&heap);
    }

    #[test]
    fn churn_trends_back_to_one_fragment() {
        let mut m = mem();
        let mut heap = Heap::new(&mut m.0);

        for _ in 0..50 {
            let a = heap.alloc(24).unwrap();
            let b = heap.alloc(24).unwrap();
            heap.free(a);
            heap.free(b);
        }
        // Force a full coalescing pass.
        let all = heap.alloc(240).unwrap();
        heap.free(all);
        assert_eq!(heap.stats().fragments, 1);
    }

    #[test]
    fn alloc_after_free_of_same_size_succeeds() {
        let mut m = mem();
        let mut heap = Heap::new(&mut m.0);
        let mut blocks: Vec<_> = (0..6).map(|_| heap.alloc(28).unwrap()).collect();
        for p in blocks.drain(..) {
            heap.free(p);
        }
        for _ in 0..6 {
            blocks.push(heap.alloc(28).unwrap());
        }
        assert_conserved(&heap);
    }
}
