// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hosted stand-in for the LX106 backend.
//!
//! There is no real exception path here, so "raising" the software
//! interrupt dispatches synchronously: by the time `raise_soft_interrupt`
//! returns, the scheduler has run and the current-task bookkeeping has
//! moved on, exactly as task code would observe after a real yield
//! (minus the actual register switch, which hosted tests don't need).
//! Tests drive the timer the same way, by calling
//! `sched::handle_exception` with the timer bit.

use core::sync::atomic::{AtomicU32, Ordering};

use osito_abi::config::INUM_SOFT;

/// Value planted in EPC1 of synthesized frames. Never jumped through on
/// the host; tests assert it round-trips.
pub const HOSTED_TRAMPOLINE: u32 = 0x4010_0040;

/// Count of timer acks, so tests can observe the dispatcher's hardware
/// side effects.
static TIMER_ACKS: AtomicU32 = AtomicU32::new(0);
static CLEARED_MASKS: AtomicU32 = AtomicU32::new(0);

pub fn trampoline_address() -> u32 {
    HOSTED_TRAMPOLINE
}

/// Synchronous yield: run the dispatcher as if the software interrupt
/// fired immediately.
pub fn raise_soft_interrupt() {
    crate::sched::handle_exception(1 << INUM_SOFT);
}

pub fn timer_init() {}

pub fn ack_timer() {
    TIMER_ACKS.fetch_add(1, Ordering::Relaxed);
}

/// Records the cleared sources; the hosted "hardware" has no latches.
pub fn clear_interrupts(mask: u32) {
    CLEARED_MASKS.fetch_or(mask, Ordering::Relaxed);
}

pub fn feed_watchdog() {}

/// Number of timer acknowledgements seen so far.
pub fn timer_ack_count() -> u32 {
    TIMER_ACKS.load(Ordering::Relaxed)
}
