// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel-owned allocator instances.
//!
//! The pool and heap data structures themselves are plain `&mut`-only
//! types from `osito-pool` and `osito-heap`; this module gives them their
//! static backing memory and wraps every operation in a critical section,
//! which is what makes them safe to call from ISR context.

use core::cell::UnsafeCell;
use core::ptr::NonNull;

use osito_abi::config::{HEAP_SIZE, POOL_BLOCK_SIZE, POOL_TOTAL_SIZE};
use osito_heap::{Heap, HeapStats};
use osito_ktrace::ktrace_entry;
use osito_pool::BlockPool;

use crate::{Trace, KTRACE};

#[repr(align(8))]
struct PoolRegion([u8; POOL_TOTAL_SIZE]);

#[repr(align(8))]
struct HeapRegion([u8; HEAP_SIZE]);

static mut POOL_MEM: PoolRegion = PoolRegion([0; POOL_TOTAL_SIZE]);
static mut HEAP_MEM: HeapRegion = HeapRegion([0; HEAP_SIZE]);

struct KmemCell(UnsafeCell<KmemState>);

// Safety: the state is only touched inside critical sections.
unsafe impl Sync for KmemCell {}

struct KmemState {
    pool: Option<BlockPool<'static>>,
    heap: Option<Heap<'static>>,
}

static KMEM: KmemCell = KmemCell(UnsafeCell::new(KmemState {
    pool: None,
    heap: None,
}));

/// Builds the pool and heap over their static regions. Call once during
/// boot, before anything allocates.
pub fn init() {
    critical_section::with(|_| {
        // Safety: the regions are only ever handed to these allocator
        // instances, and re-running init replaces the instances wholesale
        // (boot calls this once; hosted tests re-run it with the old
        // instances already discarded).
        let (pool_mem, heap_mem) = unsafe {
            (
                &mut (&mut (*core::ptr::addr_of_mut!(POOL_MEM)).0)[..],
                &mut (&mut (*core::ptr::addr_of_mut!(HEAP_MEM)).0)[..],
            )
        };
        // Safety: critical section; see KmemCell's Sync impl.
        let state = unsafe { &mut *KMEM.0.get() };
        state.pool = Some(BlockPool::new(pool_mem, POOL_BLOCK_SIZE));
        state.heap = Some(Heap::new(heap_mem));
    })
}

/// Pops one zeroed `POOL_BLOCK_SIZE`-byte block, or `None` when the pool
/// is exhausted (or not yet initialized). ISR-safe.
pub fn pool_alloc() -> Option<NonNull<u8>> {
    critical_section::with(|_| {
        // Safety: critical section; see KmemCell's Sync impl.
        let state = unsafe { &mut *KMEM.0.get() };
        state.pool.as_mut()?.alloc()
    })
}

/// Returns a block to the pool. A pointer from outside the pool region is
/// ignored (and traced). ISR-safe.
pub fn pool_free(ptr: NonNull<u8>) {
    critical_section::with(|_| {
        // Safety: critical section; see KmemCell's Sync impl.
        let state = unsafe { &mut *KMEM.0.get() };
        if let Some(pool) = state.pool.as_mut() {
            if pool.free(ptr).is_err() {
                ktrace_entry!(Trace::PoolBadFree(ptr.as_ptr() as usize));
            }
        }
    })
}

/// (free, used) block counts.
pub fn pool_stats() -> (usize, usize) {
    critical_section::with(|_| {
        // Safety: critical section; see KmemCell's Sync impl.
        let state = unsafe { &*KMEM.0.get() };
        match &state.pool {
            Some(p) => (p.free_count(), p.used_count()),
            None => (0, 0),
        }
    })
}

/// First-fit allocation from the kernel heap. ISR-safe.
pub fn heap_alloc(size: usize) -> Option<NonNull<u8>> {
    critical_section::with(|_| {
        // Safety: critical section; see KmemCell's Sync impl.
        let state = unsafe { &mut *KMEM.0.get() };
        state.heap.as_mut()?.alloc(size)
    })
}

/// Frees a heap block. Stale and foreign pointers are ignored by the
/// heap's own validation. ISR-safe.
pub fn heap_free(ptr: NonNull<u8>) {
    critical_section::with(|_| {
        // Safety: critical section; see KmemCell's Sync impl.
        let state = unsafe { &mut *KMEM.0.get() };
        if let Some(heap) = state.heap.as_mut() {
            heap.free(ptr);
        }
    })
}

/// Walks the heap and reports totals.
pub fn heap_stats() -> HeapStats {
    critical_section::with(|_| {
        // Safety: critical section; see KmemCell's Sync impl.
        let state = unsafe { &*KMEM.0.get() };
        match &state.heap {
            Some(h) => h.stats(),
            None => HeapStats::default(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsup::kernel_test;
    use osito_abi::config::POOL_NUM_BLOCKS;

    #[test]
    fn pool_and_heap_work_through_the_wrappers() {
        kernel_test(|| {
            init();

            let (free0, used0) = pool_stats();
            assert_eq!(free0, POOL_NUM_BLOCKS);
            assert_eq!(used0, 0);

            let a = pool_alloc().unwrap();
            let b = pool_alloc().unwrap();
            assert_eq!(pool_stats(), (POOL_NUM_BLOCKS - 2, 2));
            pool_free(a);
            pool_free(b);
            assert_eq!(pool_stats(), (POOL_NUM_BLOCKS, 0));

            let p = heap_alloc(100).unwrap();
            let s = heap_stats();
            assert_eq!(s.used_bytes, 100);
            heap_free(p);
            let s = heap_stats();
            assert_eq!(s.used_bytes, 0);
            assert_eq!(s.free_bytes + s.fragments * 4, HEAP_SIZE);
        });
    }

    #[test]
    fn foreign_pool_free_is_ignored() {
        kernel_test(|| {
            init();
            let mut local = [0u8; 4];
            let bogus = NonNull::new(local.as_mut_ptr()).unwrap();
            let before = pool_stats();
            pool_free(bogus);
            assert_eq!(pool_stats(), before);
        });
    }

    #[test]
    fn uninitialized_kmem_fails_softly() {
        kernel_test(|| {
            // No init() here: reset leaves kmem as the previous test
            // built it, so force the uninitialized state explicitly.
            critical_section::with(|_| {
                // Safety: critical section, test-only reset.
                let state = unsafe { &mut *KMEM.0.get() };
                state.pool = None;
                state.heap = None;
            });
            assert!(pool_alloc().is_none());
            assert!(heap_alloc(8).is_none());
            assert_eq!(heap_stats(), HeapStats::default());
        });
    }
}
