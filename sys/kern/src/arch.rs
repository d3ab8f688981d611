// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture backends.
//!
//! The kernel proper is portable; everything that touches registers,
//! exception plumbing, or assembly lives behind this module. On the real
//! part that is the LX106 backend; everywhere else a hosted fake stands
//! in so the rest of the kernel can be unit-tested on the build machine.
//!
//! A backend provides:
//!
//! - `trampoline_address()` -- where EPC1 of a fresh task's frame points;
//! - `raise_soft_interrupt()` -- the voluntary-yield source;
//! - `timer_init()` / `ack_timer()` / `clear_interrupts()` -- tick plumbing;
//! - `feed_watchdog()` -- idle-loop hygiene;
//! - `start_first_task()` -- the no-return jump into the restore path
//!   (target only).

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "xtensa", target_os = "none"))] {
        mod lx106;
        pub use lx106::*;
    } else {
        mod hosted;
        pub use hosted::*;
    }
}
