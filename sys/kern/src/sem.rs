// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Counting semaphores and the binary mutex built on them.
//!
//! The waiter queue is a plain FIFO array of task ids -- with at most
//! `MAX_TASKS` tasks in the system there is nothing a linked list would
//! buy. Blocked waiters are woken by *direct handoff*: a post with waiters
//! present transfers the resource straight to the head of the queue
//! without touching the count, which keeps wakeups strictly FIFO and
//! makes a thundering herd impossible under the round-robin scheduler.
//!
//! `post` is safe from ISR context (it only flips a task state and shifts
//! a bounded array, all under the mask); `wait` is not, which is why it
//! demands the [`InTask`] token.

use core::cell::UnsafeCell;

use osito_abi::config::MAX_TASKS;
use osito_abi::{InTask, TaskId, TaskState};

use crate::sched;

/// Error from the `try_` operations: the resource was not available and
/// the caller declined to block.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WouldBlock;

/// A counting semaphore with a FIFO wait queue.
///
/// # Invariants
///
/// The count never goes negative, and whenever waiters are queued the
/// count is zero. Direct handoff preserves this: posts either bump the
/// count (no waiters) or wake the head waiter (count untouched).
pub struct Semaphore {
    inner: UnsafeCell<SemInner>,
}

// Safety: all access to `inner` happens inside a critical section, which
// on this single-core system excludes tasks and ISRs alike.
unsafe impl Sync for Semaphore {}

struct SemInner {
    count: i32,
    waiters: [TaskId; MAX_TASKS],
    num_waiters: u8,
}

impl Semaphore {
    /// A semaphore holding `initial` units -- 0 for pure signalling, N for
    /// a pool of N resources.
    pub const fn new(initial: i32) -> Self {
        Self {
            inner: UnsafeCell::new(SemInner {
                count: initial,
                waiters: [TaskId(0); MAX_TASKS],
                num_waiters: 0,
            }),
        }
    }

    /// Takes one unit, blocking until a poster provides it.
    ///
    /// When the caller must block it is appended to the waiter FIFO and
    /// yields; by the time it runs again the unit has already been handed
    /// to it, so there is no re-check loop.
    pub fn wait(&self, token: InTask) {
        let blocked = critical_section::with(|_| {
            // Safety: critical section; see the Sync impl.
            let s = unsafe { &mut *self.inner.get() };
            if s.count > 0 {
                s.count -= 1;
                return false;
            }

            let me = sched::current_task_id();
            s.waiters[usize::from(s.num_waiters)] = me;
            s.num_waiters += 1;
            sched::with_task_table(|tasks| {
                tasks[me.index()].state = TaskState::Blocked;
            });
            true
        });

        if blocked {
            sched::yield_now(token);
        }
    }

    /// Takes one unit if immediately available.
    pub fn try_wait(&self) -> Result<(), WouldBlock> {
        critical_section::with(|_| {
            // Safety: critical section; see the Sync impl.
            let s = unsafe { &mut *self.inner.get() };
            if s.count > 0 {
                s.count -= 1;
                Ok(())
            } else {
                Err(WouldBlock)
            }
        })
    }

    /// Returns one unit. With waiters queued, the head waiter is made
    /// `Ready` and the count stays at zero (direct handoff); otherwise the
    /// count is incremented. Never reschedules -- the woken task runs at
    /// the next natural scheduling point. ISR-safe.
    pub fn post(&self) {
        critical_section::with(|_| {
            // Safety: critical section; see the Sync impl.
            let s = unsafe { &mut *self.inner.get() };
            if s.num_waiters > 0 {
                let head = s.waiters[0];
                for i in 1..usize::from(s.num_waiters) {
                    s.waiters[i - 1] = s.waiters[i];
                }
                s.num_waiters -= 1;

                sched::with_task_table(|tasks| {
                    tasks[head.index()].state = TaskState::Ready;
                });
            } else {
                s.count += 1;
            }
        })
    }

    /// Instantaneous count; informational only, it may change the moment
    /// this returns.
    pub fn count(&self) -> i32 {
        critical_section::with(|_| {
            // Safety: critical section; see the Sync impl.
            unsafe { (*self.inner.get()).count }
        })
    }

    #[cfg(test)]
    fn waiter_count(&self) -> u8 {
        critical_section::with(|_| {
            // Safety: critical section; see the Sync impl.
            unsafe { (*self.inner.get()).num_waiters }
        })
    }
}

/// A binary mutex: a semaphore born holding one unit.
///
/// There is no owner tracking -- unlocking from a task that never locked
/// is not prevented, and lock order discipline is on the user. Hold it
/// briefly; there is no priority inheritance to save you.
pub struct Mutex {
    sem: Semaphore,
}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            sem: Semaphore::new(1),
        }
    }

    pub fn lock(&self, token: InTask) {
        self.sem.wait(token);
    }

    pub fn try_lock(&self) -> Result<(), WouldBlock> {
        self.sem.try_wait()
    }

    pub fn unlock(&self) {
        self.sem.post();
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{current_task_id, handle_exception, task_create};
    use crate::testsup::kernel_test;
    use osito_abi::config::INUM_TIMER;

    fn token() -> InTask {
        // Safety: hosted tests stand in for task context.
        unsafe { InTask::assume_task_context() }
    }

    fn nop_entry(_t: InTask, _arg: usize) {}

    fn tick() {
        handle_exception(1 << INUM_TIMER);
    }

    fn state_of(id: TaskId) -> TaskState {
        let mut s = TaskState::Free;
        sched::with_task_table(|tasks| s = tasks[id.index()].state);
        s
    }

    #[test]
    fn uncontended_wait_just_counts_down() {
        kernel_test(|| {
            let sem = Semaphore::new(2);
            sem.wait(token());
            assert_eq!(sem.count(), 1);
            sem.wait(token());
            assert_eq!(sem.count(), 0);
            assert_eq!(sem.waiter_count(), 0);
        });
    }

    #[test]
    fn try_wait_never_blocks() {
        kernel_test(|| {
            let sem = Semaphore::new(1);
            assert_eq!(sem.try_wait(), Ok(()));
            assert_eq!(sem.try_wait(), Err(WouldBlock));
            assert_eq!(sem.waiter_count(), 0);
            sem.post();
            assert_eq!(sem.try_wait(), Ok(()));
        });
    }

    #[test]
    fn post_without_waiters_accumulates() {
        kernel_test(|| {
            let sem = Semaphore::new(0);
            sem.post();
            sem.post();
            assert_eq!(sem.count(), 2);
        });
    }

    #[test]
    fn contended_wait_blocks_the_caller() {
        kernel_test(|| {
            let a = task_create("a", nop_entry, 0, 0).unwrap();
            tick();
            assert_eq!(current_task_id(), a);

            let sem = Semaphore::new(0);
            sem.wait(token());
            // The waiter went to sleep and the CPU moved on.
            assert_eq!(state_of(a), TaskState::Blocked);
            assert_eq!(current_task_id(), TaskId::IDLE);
            assert_eq!(sem.count(), 0);
            assert_eq!(sem.waiter_count(), 1);
        });
    }

    #[test]
    fn handoff_is_fifo_and_leaves_count_at_zero() {
        kernel_test(|| {
            let a = task_create("a", nop_entry, 0, 0).unwrap();
            let b = task_create("b", nop_entry, 0, 0).unwrap();
            let sem = Semaphore::new(0);

            // Dispatch a, block it on the semaphore; then the same for b.
            tick();
            assert_eq!(current_task_id(), a);
            sem.wait(token());
            tick();
            assert_eq!(current_task_id(), b);
            sem.wait(token());
            assert_eq!(sem.waiter_count(), 2);

            // First post wakes a -- the first to wait -- by direct handoff.
            sem.post();
            assert_eq!(state_of(a), TaskState::Ready);
            assert_eq!(state_of(b), TaskState::Blocked);
            assert_eq!(sem.count(), 0, "handoff must not touch the count");

            sem.post();
            assert_eq!(state_of(b), TaskState::Ready);
            assert_eq!(sem.count(), 0);

            // Only with the queue empty does a post accumulate.
            sem.post();
            assert_eq!(sem.count(), 1);
        });
    }

    #[test]
    fn count_invariant_holds() {
        kernel_test(|| {
            let a = task_create("a", nop_entry, 0, 0).unwrap();
            let sem = Semaphore::new(0);
            tick();
            assert_eq!(current_task_id(), a);
            sem.wait(token());

            // waiters > 0 implies count == 0 ...
            assert!(sem.waiter_count() > 0);
            assert_eq!(sem.count(), 0);

            sem.post();
            // ... and count >= 0 implies no waiters.
            assert!(sem.count() >= 0);
            assert_eq!(sem.waiter_count(), 0);
        });
    }

    #[test]
    fn woken_waiter_is_schedulable() {
        kernel_test(|| {
            let a = task_create("a", nop_entry, 0, 0).unwrap();
            let sem = Semaphore::new(0);
            tick();
            sem.wait(token());
            assert_eq!(current_task_id(), TaskId::IDLE);

            sem.post();
            tick();
            assert_eq!(current_task_id(), a);
            assert_eq!(state_of(a), TaskState::Running);
        });
    }

    #[test]
    fn mutex_round_trip() {
        kernel_test(|| {
            let m = Mutex::new();
            m.lock(token());
            assert_eq!(m.try_lock(), Err(WouldBlock));
            m.unlock();
            assert_eq!(m.try_lock(), Ok(()));
            m.unlock();
        });
    }
}
