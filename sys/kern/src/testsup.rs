// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hosted test support.
//!
//! The kernel's state is global by design; the host test harness runs
//! tests on several threads. [`kernel_test`] reconciles the two: it
//! serializes every test that touches kernel statics behind one lock and
//! resets the scheduler and timer registry before the body runs.

use std::sync::Mutex;

static KERNEL_LOCK: Mutex<()> = Mutex::new(());

/// Runs `body` with exclusive access to a freshly reset kernel: the task
/// table holds only the idle task (marked running, as after `start()`),
/// the tick counter is zero, and the timer registry is empty.
pub fn kernel_test(body: impl FnOnce()) {
    let _guard = KERNEL_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    crate::sched::reset_for_test();
    crate::swtimer::reset_for_test();
    body();
}
