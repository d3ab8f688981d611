// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Single-producer single-consumer byte ring for UART receive.
//!
//! The producer is the UART ISR; the consumer is task code. `head` is
//! written only by the producer and `tail` only by the consumer, so the
//! ring needs no lock for correctness -- the consumer still takes a
//! critical section around its load-and-advance of `tail` so that the pair
//! of index accesses is atomic with respect to preemption, while
//! [`RxRing::available`] reads the indices bare (they are word-sized and
//! word-aligned, so a torn read is impossible).
//!
//! The ring holds `N - 1` bytes: "empty" is `head == tail`, and the
//! producer drops a byte rather than advancing `head` onto `tail`.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

pub struct RxRing<const N: usize> {
    buf: UnsafeCell<[u8; N]>,
    /// Write index; advanced only by the producer.
    head: AtomicUsize,
    /// Read index; advanced only by the consumer.
    tail: AtomicUsize,
}

// Safety: the SPSC discipline documented above keeps producer and consumer
// on disjoint cells; indices are atomics.
unsafe impl<const N: usize> Sync for RxRing<N> {}

impl<const N: usize> RxRing<N> {
    pub const fn new() -> Self {
        Self {
            buf: UnsafeCell::new([0; N]),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Producer side: stores `byte` unless the ring is full, in which case
    /// the byte is dropped and `head` is left unchanged. Never waits -- this
    /// runs in ISR context.
    pub fn push(&self, byte: u8) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let next = (head + 1) % N;
        if next == self.tail.load(Ordering::Acquire) {
            return false;
        }
        // Safety: only the producer writes `buf[head]`, and the consumer
        // will not read it until `head` is published below.
        unsafe {
            (*self.buf.get())[head] = byte;
        }
        self.head.store(next, Ordering::Release);
        true
    }

    /// Consumer side: removes and returns the oldest byte.
    pub fn pop(&self) -> Option<u8> {
        critical_section::with(|_| {
            let tail = self.tail.load(Ordering::Relaxed);
            if self.head.load(Ordering::Acquire) == tail {
                return None;
            }
            // Safety: `tail` points at a published byte the producer will
            // not touch again until we advance `tail`.
            let byte = unsafe { (*self.buf.get())[tail] };
            self.tail.store((tail + 1) % N, Ordering::Release);
            Some(byte)
        })
    }

    /// Cheap emptiness probe, callable from any context without masking.
    pub fn available(&self) -> bool {
        self.head.load(Ordering::Acquire) != self.tail.load(Ordering::Acquire)
    }
}

impl<const N: usize> Default for RxRing<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let ring = RxRing::<8>::new();
        for b in b"hello" {
            assert!(ring.push(*b));
        }
        assert!(ring.available());
        for b in b"hello" {
            assert_eq!(ring.pop(), Some(*b));
        }
        assert_eq!(ring.pop(), None);
        assert!(!ring.available());
    }

    #[test]
    fn drops_when_full_and_head_unchanged() {
        let ring = RxRing::<4>::new();
        // Capacity is N - 1 = 3.
        assert!(ring.push(1));
        assert!(ring.push(2));
        assert!(ring.push(3));
        assert!(!ring.push(4));
        assert!(!ring.push(5));

        // The stored sequence is intact and nothing from the dropped
        // bytes leaked in.
        assert_eq!(ring.pop(), Some(1));
        assert_eq!(ring.pop(), Some(2));
        assert_eq!(ring.pop(), Some(3));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn wraps_around() {
        let ring = RxRing::<4>::new();
        for round in 0..10u8 {
            assert!(ring.push(round));
            assert_eq!(ring.pop(), Some(round));
        }
    }
}
