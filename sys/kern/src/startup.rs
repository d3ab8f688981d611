// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel bring-up.
//!
//! The boot ROM and the board's early init (clocks, pins, UART baud) run
//! before any of this; the application's entry point then calls
//! [`init_runtime`], creates its tasks, and finally calls [`start`],
//! which never returns.

use crate::{kmem, sched};

/// Initializes every kernel subsystem that tasks depend on: the trace
/// rings need nothing, the allocators get their regions, the UART gets
/// its RX plumbing, and the scheduler builds the idle task.
///
/// Call exactly once, before `task_create`.
pub fn init_runtime() {
    kmem::init();
    drv_lx106_uart::init();
    sched::init();
}

/// Arms the tick timer and jumps into the first task. The caller's stack
/// is abandoned; from here on only tasks and ISRs run.
#[cfg(target_os = "none")]
pub fn start() -> ! {
    crate::arch::timer_init();
    sched::start()
}
