// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded message queues.
//!
//! The classic two-semaphore construction over a circular buffer of
//! fixed-size messages: `not_full` starts at the capacity and gates
//! senders, `not_empty` starts at zero and gates receivers. The buffer
//! copy and index bump are a few instructions under the interrupt mask,
//! which is cheap enough not to deserve anything fancier.
//!
//! With multiple producers the order between them is the order in which
//! they completed their critical sections; per producer, FIFO order is
//! exact. The queue's current depth is simply `not_empty`'s count.

use core::cell::UnsafeCell;

use osito_abi::InTask;

use crate::sem::{Semaphore, WouldBlock};

/// A bounded queue of fixed-size messages over a caller-provided buffer.
pub struct MessageQueue<'b> {
    inner: UnsafeCell<MqInner<'b>>,
    /// Free slots; senders wait here.
    not_full: Semaphore,
    /// Queued messages; receivers wait here.
    not_empty: Semaphore,
}

// Safety: `inner` is only touched inside critical sections.
unsafe impl Sync for MessageQueue<'_> {}

struct MqInner<'b> {
    buf: &'b mut [u8],
    msg_size: usize,
    capacity: usize,
    head: usize,
    tail: usize,
}

impl<'b> MessageQueue<'b> {
    /// Builds a queue of `capacity` messages of `msg_size` bytes each.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is smaller than `msg_size * capacity`, or either
    /// dimension is zero.
    pub fn new(buf: &'b mut [u8], msg_size: usize, capacity: usize) -> Self {
        assert!(msg_size > 0 && capacity > 0);
        assert!(buf.len() >= msg_size * capacity);
        Self {
            inner: UnsafeCell::new(MqInner {
                buf,
                msg_size,
                capacity,
                head: 0,
                tail: 0,
            }),
            not_full: Semaphore::new(capacity as i32),
            not_empty: Semaphore::new(0),
        }
    }

    /// Enqueues `msg`, blocking while the queue is full. `msg` must be
    /// exactly one message long.
    pub fn send(&self, token: InTask, msg: &[u8]) {
        self.not_full.wait(token);
        self.push(msg);
        self.not_empty.post();
    }

    /// Dequeues into `out`, blocking while the queue is empty. `out` must
    /// be exactly one message long.
    pub fn recv(&self, token: InTask, out: &mut [u8]) {
        self.not_empty.wait(token);
        self.pop(out);
        self.not_full.post();
    }

    /// Non-blocking send; fails if the queue is full.
    pub fn try_send(&self, msg: &[u8]) -> Result<(), WouldBlock> {
        self.not_full.try_wait()?;
        self.push(msg);
        self.not_empty.post();
        Ok(())
    }

    /// Non-blocking receive; fails if the queue is empty.
    pub fn try_recv(&self, out: &mut [u8]) -> Result<(), WouldBlock> {
        self.not_empty.try_wait()?;
        self.pop(out);
        self.not_full.post();
        Ok(())
    }

    /// Messages currently queued, read as `not_empty`'s count. Always in
    /// `0..=capacity`.
    pub fn count(&self) -> usize {
        self.not_empty.count().max(0) as usize
    }

    fn push(&self, msg: &[u8]) {
        critical_section::with(|_| {
            // Safety: critical section; see the Sync impl.
            let q = unsafe { &mut *self.inner.get() };
            assert_eq!(msg.len(), q.msg_size);
            let off = q.head * q.msg_size;
            q.buf[off..off + q.msg_size].copy_from_slice(msg);
            q.head = (q.head + 1) % q.capacity;
        })
    }

    fn pop(&self, out: &mut [u8]) {
        critical_section::with(|_| {
            // Safety: critical section; see the Sync impl.
            let q = unsafe { &mut *self.inner.get() };
            assert_eq!(out.len(), q.msg_size);
            let off = q.tail * q.msg_size;
            out.copy_from_slice(&q.buf[off..off + q.msg_size]);
            q.tail = (q.tail + 1) % q.capacity;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsup::kernel_test;

    fn token() -> InTask {
        // Safety: hosted tests stand in for task context.
        unsafe { InTask::assume_task_context() }
    }

    #[test]
    fn fifo_per_sender() {
        kernel_test(|| {
            let mut storage = [0u8; 4 * 4];
            let q = MessageQueue::new(&mut storage, 4, 4);

            for i in 0u32..4 {
                q.send(token(), &i.to_le_bytes());
                assert_eq!(q.count(), i as usize + 1);
            }

            let mut out = [0u8; 4];
            for i in 0u32..4 {
                q.recv(token(), &mut out);
                assert_eq!(u32::from_le_bytes(out), i);
            }
            assert_eq!(q.count(), 0);
        });
    }

    #[test]
    fn try_variants_on_full_and_empty() {
        kernel_test(|| {
            let mut storage = [0u8; 2];
            let q = MessageQueue::new(&mut storage, 1, 2);
            let mut out = [0u8; 1];

            assert_eq!(q.try_recv(&mut out), Err(WouldBlock));
            assert_eq!(q.try_send(b"a"), Ok(()));
            assert_eq!(q.try_send(b"b"), Ok(()));
            assert_eq!(q.try_send(b"c"), Err(WouldBlock));
            assert_eq!(q.count(), 2);

            assert_eq!(q.try_recv(&mut out), Ok(()));
            assert_eq!(&out, b"a");
            assert_eq!(q.try_recv(&mut out), Ok(()));
            assert_eq!(&out, b"b");
            assert_eq!(q.try_recv(&mut out), Err(WouldBlock));
        });
    }

    #[test]
    fn count_stays_within_capacity() {
        kernel_test(|| {
            let mut storage = [0u8; 3 * 8];
            let q = MessageQueue::new(&mut storage, 8, 3);
            let msg = [0u8; 8];
            let mut out = [0u8; 8];

            for _ in 0..10 {
                let _ = q.try_send(&msg);
                assert!(q.count() <= 3);
            }
            for _ in 0..10 {
                let _ = q.try_recv(&mut out);
            }
            assert_eq!(q.count(), 0);
        });
    }

    #[test]
    fn wraps_cleanly_past_the_buffer_end() {
        kernel_test(|| {
            let mut storage = [0u8; 2 * 2];
            let q = MessageQueue::new(&mut storage, 2, 2);
            let mut out = [0u8; 2];

            for round in 0u8..7 {
                q.send(token(), &[round, round ^ 0xFF]);
                q.recv(token(), &mut out);
                assert_eq!(out, [round, round ^ 0xFF]);
            }
        });
    }

    #[test]
    fn ping_pong_exchange() {
        kernel_test(|| {
            // Two capacity-1 queues, request and reply, driven through ten
            // exchanges: the replies come back strictly in order.
            let mut qs = [0u8; 4];
            let mut rs = [0u8; 4];
            let q = MessageQueue::new(&mut qs, 4, 1);
            let r = MessageQueue::new(&mut rs, 4, 1);
            let mut out = [0u8; 4];

            for i in 0u32..10 {
                // A → Q
                q.send(token(), &i.to_le_bytes());
                // B: recv Q, reply i + 1 on R
                q.recv(token(), &mut out);
                let got = u32::from_le_bytes(out);
                r.send(token(), &(got + 1).to_le_bytes());
                // A: recv R
                r.recv(token(), &mut out);
                assert_eq!(u32::from_le_bytes(out), i + 1);
            }
        });
    }
}
