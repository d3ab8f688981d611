// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! OsitoK kernel.
//!
//! A preemptive round-robin kernel for a single-core LX106-class part:
//! statically allocated task table, one timer interrupt driving the tick, a
//! software interrupt for voluntary yield, and interrupt masking as the
//! universal short-section lock. On top of the scheduler sit counting
//! semaphores with FIFO direct handoff, a binary mutex, bounded message
//! queues, a software-timer registry, and kernel-owned block-pool and heap
//! instances.
//!
//! # Design principles
//!
//! 1. Static configuration: the system takes a single shape fixed at
//!    compile time (`osito_abi::config`); nothing is allocated at runtime
//!    that the kernel itself depends on.
//! 2. Arena plus index: tasks live in one table and every other structure
//!    names them by `TaskId`, never by reference, so there are no
//!    self-referential lifetimes to fight.
//! 3. A preference for safe code; the remaining `unsafe` is concentrated in
//!    the arch layer and a handful of commented static accesses.
//! 4. Everything outside `arch/` builds and runs on the host, where the
//!    test suite drives the dispatcher by hand.

#![cfg_attr(target_os = "none", no_std)]

use osito_ktrace::ktrace;

pub mod arch;

pub mod kmem;
pub mod mq;
pub mod sched;
pub mod sem;
pub mod startup;
pub mod swtimer;
pub mod task;

#[cfg(not(target_os = "none"))]
pub mod testsup;

pub use osito_abi::{InTask, Priority, TaskId, TaskState};

/// Kernel-wide trace events; read the `KTRACE` ring with a debugger.
/// Some variants are only recorded by the target arch backend.
#[allow(dead_code)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) enum Trace {
    None,
    TaskCreated(u8),
    TaskTableFull,
    TaskExited(u8),
    /// A non-interrupt CPU exception reached the dispatcher; the cause
    /// code is recorded and the task resumes at the faulting instruction.
    UnhandledException(u32),
    PoolBadFree(usize),
    KernelStarted,
}

ktrace!(Trace, 32, Trace::None);
