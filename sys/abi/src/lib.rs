// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Definitions shared between the OsitoK kernel and everything that talks to
//! it: task identity and state, the context-frame layout consumed by the
//! exception-entry assembly, and the compile-time configuration of the
//! system.
//!
//! This crate is deliberately boring. It contains plain data and constants,
//! no behavior, so that drivers, the filesystem, and host-side tests can
//! depend on it without dragging in the kernel proper.

#![cfg_attr(not(test), no_std)]

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub mod config;
pub mod frame;

pub const VERSION_MAJOR: u8 = 0;
pub const VERSION_MINOR: u8 = 1;
pub const VERSION_STRING: &str = "0.1";

/// Names a slot in the task table.
///
/// Task ids are small dense integers; id 0 is always the idle task. Ids are
/// how every other kernel structure (semaphore waiter queues, the
/// scheduler's bookkeeping) refers to a task, so that nothing needs to hold
/// a reference into the task table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct TaskId(pub u8);

impl TaskId {
    /// The idle task's slot. Always present, always last resort.
    pub const IDLE: Self = Self(0);

    /// This id as a table index.
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Life-cycle state of a task table slot.
///
/// The transitions are: `Free → Ready` on create, `Ready ⇄ Running` under
/// the scheduler, `Running → Blocked` on sleep or semaphore wait,
/// `Blocked → Ready` on wake, and `Running → Dead` when the entry function
/// returns. `Dead` is terminal; the slot is never reclaimed.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum TaskState {
    /// Slot is unused and may be claimed by `task_create`.
    #[default]
    Free,
    /// Eligible to be picked by the scheduler.
    Ready,
    /// Currently executing. Outside the scheduler's critical section exactly
    /// one task is in this state.
    Running,
    /// Waiting on a tick deadline or parked in a waiter queue.
    Blocked,
    /// The entry function returned. Terminal.
    Dead,
}

/// Priority recorded for a task.
///
/// Priorities are carried in the task table and reported by introspection,
/// but the round-robin scheduler deliberately does not consult them. That is
/// a contract, not an accident: users of this kernel rely on equal time
/// sharing regardless of the priority byte they pass to `task_create`.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct Priority(pub u8);

/// Capability witness for task context.
///
/// Some kernel operations (yield, sleep, semaphore wait, blocking queue
/// send/receive) may suspend the caller and are therefore only legal from
/// task context, never from an ISR or a software-timer callback. Those
/// operations take an `InTask` by value. The kernel mints the token in the
/// task-entry shim and hands it to the entry function; ISRs never see one,
/// so the constraint is enforced by the type system rather than a runtime
/// flag.
#[derive(Copy, Clone, Debug)]
pub struct InTask {
    _not_isr: (),
}

impl InTask {
    /// Conjures a task-context token out of thin air.
    ///
    /// # Safety
    ///
    /// The caller must actually be running in task context (on a task
    /// stack, below the exception dispatcher). Calling a blocking operation
    /// from an ISR with a token made here will deadlock or corrupt
    /// scheduler state.
    pub unsafe fn assume_task_context() -> Self {
        Self { _not_isr: () }
    }
}
