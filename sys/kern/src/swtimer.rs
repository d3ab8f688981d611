// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Software timers: one-shot and periodic callbacks on the tick.
//!
//! Timers live in a small kernel-owned arena and are addressed by
//! [`TimerId`]; a separate registration list preserves the order in which
//! timers were armed, which is also the order they fire in within one
//! tick pass.
//!
//! Callbacks run in ISR context, between the sleeper wakeup scan and the
//! scheduling decision of the tick that expired them. They must be short,
//! must not block, and must not take mutexes held by tasks. Posting a
//! semaphore is fine -- the registry borrow is released around each
//! callback precisely so that this works.

use core::cell::UnsafeCell;

use crate::sched;

/// Capacity of the timer arena.
pub const SWTIMER_MAX: usize = 8;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TimerMode {
    /// Fire once, then deactivate and drop out of the registry.
    OneShot,
    /// Reload `interval` from the firing tick and stay registered.
    Periodic,
}

/// Timer callback: a plain function pointer plus one word of context, as
/// befits ISR code.
pub type TimerCallback = fn(usize);

/// Handle to an arena slot, returned by [`create`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TimerId(u8);

/// The arena is full; `SWTIMER_MAX` timers already exist.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NoTimerSlot;

#[derive(Copy, Clone)]
struct Slot {
    used: bool,
    active: bool,
    cb: TimerCallback,
    arg: usize,
    interval: u32,
    expire_tick: u32,
    mode: TimerMode,
}

fn unused_cb(_: usize) {}

const FREE_SLOT: Slot = Slot {
    used: false,
    active: false,
    cb: unused_cb,
    arg: 0,
    interval: 0,
    expire_tick: 0,
    mode: TimerMode::OneShot,
};

struct Registry {
    slots: [Slot; SWTIMER_MAX],
    /// Registered timer ids in registration order.
    order: [u8; SWTIMER_MAX],
    registered: u8,
}

struct RegistryCell(UnsafeCell<Registry>);

// Safety: the registry is only touched inside critical sections.
unsafe impl Sync for RegistryCell {}

static REGISTRY: RegistryCell = RegistryCell(UnsafeCell::new(Registry {
    slots: [FREE_SLOT; SWTIMER_MAX],
    order: [0; SWTIMER_MAX],
    registered: 0,
}));

/// Allocates a timer bound to `cb` and `arg`. The timer starts inactive;
/// arm it with [`start`].
pub fn create(cb: TimerCallback, arg: usize) -> Result<TimerId, NoTimerSlot> {
    critical_section::with(|_| {
        // Safety: critical section; see RegistryCell's Sync impl.
        let r = unsafe { &mut *REGISTRY.0.get() };
        let idx = r
            .slots
            .iter()
            .position(|s| !s.used)
            .ok_or(NoTimerSlot)?;
        r.slots[idx] = Slot {
            used: true,
            ..FREE_SLOT
        };
        r.slots[idx].cb = cb;
        r.slots[idx].arg = arg;
        Ok(TimerId(idx as u8))
    })
}

/// Arms `id` to fire `ticks` from now, in the given mode, and registers
/// it (idempotently) at the back of the firing order.
pub fn start(id: TimerId, ticks: u32, mode: TimerMode) {
    critical_section::with(|_| {
        // Safety: critical section; see RegistryCell's Sync impl.
        let r = unsafe { &mut *REGISTRY.0.get() };
        let slot = &mut r.slots[usize::from(id.0)];
        slot.interval = ticks;
        slot.mode = mode;
        slot.expire_tick = sched::ticks_now().wrapping_add(ticks);
        slot.active = true;
        register(r, id.0);
    })
}

/// Disarms `id` and removes it from the firing order.
pub fn stop(id: TimerId) {
    critical_section::with(|_| {
        // Safety: critical section; see RegistryCell's Sync impl.
        let r = unsafe { &mut *REGISTRY.0.get() };
        r.slots[usize::from(id.0)].active = false;
        unregister(r, id.0);
    })
}

/// Number of registered timers.
pub fn active_count() -> usize {
    critical_section::with(|_| {
        // Safety: critical section; see RegistryCell's Sync impl.
        usize::from(unsafe { &*REGISTRY.0.get() }.registered)
    })
}

fn register(r: &mut Registry, id: u8) {
    let n = usize::from(r.registered);
    if r.order[..n].contains(&id) {
        return;
    }
    if n < SWTIMER_MAX {
        r.order[n] = id;
        r.registered += 1;
    }
}

fn unregister(r: &mut Registry, id: u8) {
    let n = usize::from(r.registered);
    if let Some(pos) = r.order[..n].iter().position(|&x| x == id) {
        for i in pos..n - 1 {
            r.order[i] = r.order[i + 1];
        }
        r.registered -= 1;
    }
}

enum Step {
    Done,
    Skip,
    Fire(TimerCallback, usize),
}

/// Runs every expired timer. Called from the timer interrupt with the
/// current tick; the registry borrow is dropped around each callback so
/// callbacks may post semaphores (which take their own look at the task
/// table).
pub(crate) fn tick(now: u32) {
    let mut i = 0;
    loop {
        let step = critical_section::with(|_| {
            // Safety: critical section; see RegistryCell's Sync impl.
            let r = unsafe { &mut *REGISTRY.0.get() };
            if i >= usize::from(r.registered) {
                return Step::Done;
            }
            let id = r.order[i];
            let slot = &mut r.slots[usize::from(id)];
            if !slot.active || (now.wrapping_sub(slot.expire_tick) as i32) < 0 {
                i += 1;
                return Step::Skip;
            }

            let fire = (slot.cb, slot.arg);
            match slot.mode {
                TimerMode::Periodic => {
                    slot.expire_tick = now.wrapping_add(slot.interval);
                    i += 1;
                }
                TimerMode::OneShot => {
                    slot.active = false;
                    unregister(r, id);
                    // The list shifted down over position i; do not
                    // advance.
                }
            }
            Step::Fire(fire.0, fire.1)
        });

        match step {
            Step::Done => break,
            Step::Skip => {}
            Step::Fire(cb, arg) => cb(arg),
        }
    }
}

#[cfg(not(target_os = "none"))]
pub(crate) fn reset_for_test() {
    critical_section::with(|_| {
        // Safety: critical section; see RegistryCell's Sync impl.
        let r = unsafe { &mut *REGISTRY.0.get() };
        r.slots = [FREE_SLOT; SWTIMER_MAX];
        r.order = [0; SWTIMER_MAX];
        r.registered = 0;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::handle_exception;
    use crate::sem::Semaphore;
    use crate::testsup::kernel_test;
    use core::sync::atomic::{AtomicU32, Ordering};
    use osito_abi::config::INUM_TIMER;

    static FIRED_A: AtomicU32 = AtomicU32::new(0);
    static FIRED_B: AtomicU32 = AtomicU32::new(0);

    fn bump_a(_: usize) {
        FIRED_A.fetch_add(1, Ordering::Relaxed);
    }

    fn bump_b(_: usize) {
        FIRED_B.fetch_add(1, Ordering::Relaxed);
    }

    fn tick() {
        handle_exception(1 << INUM_TIMER);
    }

    fn reset_counters() {
        FIRED_A.store(0, Ordering::Relaxed);
        FIRED_B.store(0, Ordering::Relaxed);
    }

    #[test]
    fn one_shot_fires_once_and_unregisters() {
        kernel_test(|| {
            reset_counters();
            let t = create(bump_a, 0).unwrap();
            start(t, 3, TimerMode::OneShot);
            assert_eq!(active_count(), 1);

            tick();
            tick();
            assert_eq!(FIRED_A.load(Ordering::Relaxed), 0);
            tick();
            assert_eq!(FIRED_A.load(Ordering::Relaxed), 1);
            assert_eq!(active_count(), 0);

            // Long after: still exactly once.
            for _ in 0..10 {
                tick();
            }
            assert_eq!(FIRED_A.load(Ordering::Relaxed), 1);
        });
    }

    #[test]
    fn periodic_reloads_from_the_firing_tick() {
        kernel_test(|| {
            reset_counters();
            let t = create(bump_a, 0).unwrap();
            start(t, 3, TimerMode::Periodic);

            for _ in 0..9 {
                tick();
            }
            assert_eq!(FIRED_A.load(Ordering::Relaxed), 3);
            assert_eq!(active_count(), 1);

            stop(t);
            for _ in 0..6 {
                tick();
            }
            assert_eq!(FIRED_A.load(Ordering::Relaxed), 3);
            assert_eq!(active_count(), 0);
        });
    }

    #[test]
    fn coexpiring_timers_fire_in_the_same_pass() {
        kernel_test(|| {
            reset_counters();
            let a = create(bump_a, 0).unwrap();
            let b = create(bump_b, 0).unwrap();
            start(a, 2, TimerMode::OneShot);
            start(b, 2, TimerMode::OneShot);

            tick();
            assert_eq!(FIRED_A.load(Ordering::Relaxed), 0);
            assert_eq!(FIRED_B.load(Ordering::Relaxed), 0);
            tick();
            assert_eq!(FIRED_A.load(Ordering::Relaxed), 1);
            assert_eq!(FIRED_B.load(Ordering::Relaxed), 1);
            assert_eq!(active_count(), 0);
        });
    }

    #[test]
    fn stopped_before_expiry_never_fires() {
        kernel_test(|| {
            reset_counters();
            let t = create(bump_a, 0).unwrap();
            start(t, 2, TimerMode::OneShot);
            stop(t);
            for _ in 0..5 {
                tick();
            }
            assert_eq!(FIRED_A.load(Ordering::Relaxed), 0);
        });
    }

    #[test]
    fn restart_is_idempotent_in_the_registry() {
        kernel_test(|| {
            reset_counters();
            let t = create(bump_a, 0).unwrap();
            start(t, 5, TimerMode::OneShot);
            start(t, 2, TimerMode::OneShot);
            assert_eq!(active_count(), 1);

            tick();
            tick();
            // The re-arm moved the deadline up.
            assert_eq!(FIRED_A.load(Ordering::Relaxed), 1);
        });
    }

    #[test]
    fn arena_exhaustion_is_reported() {
        kernel_test(|| {
            for _ in 0..SWTIMER_MAX {
                create(unused_cb, 0).unwrap();
            }
            assert_eq!(create(unused_cb, 0), Err(NoTimerSlot));
        });
    }

    static TIMER_SEM: Semaphore = Semaphore::new(0);

    fn post_sem(_: usize) {
        TIMER_SEM.post();
    }

    #[test]
    fn callback_may_post_a_semaphore() {
        kernel_test(|| {
            while TIMER_SEM.try_wait().is_ok() {}
            let t = create(post_sem, 0).unwrap();
            start(t, 1, TimerMode::Periodic);

            tick();
            tick();
            tick();
            assert_eq!(TIMER_SEM.count(), 3);
            stop(t);
        });
    }
}
