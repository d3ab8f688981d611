// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Static trace rings for kernel and driver events.
//!
//! OsitoK has no console logging in the kernel or drivers; instead, each
//! crate that wants observability declares a small static ring of `Copy`
//! event payloads and records into it. The rings live at fixed addresses, so
//! they can be read out with a debugger (or, in hosted tests, through
//! [`Ktrace::snapshot`]).
//!
//! Declare a ring with [`ktrace!`], giving the payload type, entry count,
//! and a static initializer for the payload:
//!
//! ```
//! use osito_ktrace::*;
//!
//! #[derive(Copy, Clone, PartialEq)]
//! enum Trace {
//!     None,
//!     TickLost(u32),
//! }
//!
//! ktrace!(Trace, 16, Trace::None);
//!
//! fn tick_overrun(n: u32) {
//!     ktrace_entry!(Trace::TickLost(n));
//! }
//! ```
//!
//! Recording stores the call site's line number with the payload. If the
//! payload and line match the most recent entry, the entry's count is bumped
//! instead of consuming a new slot, so a tight loop of identical events does
//! not wipe out the history around it.
//!
//! Entries may be recorded from ISR context: the ring is guarded by a
//! critical section, and recording never blocks.

#![cfg_attr(not(test), no_std)]

use core::cell::UnsafeCell;

/// One slot of a trace ring.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct KtraceEntry<T> {
    /// Source line of the `ktrace_entry!` call that produced this entry.
    pub line: u16,
    /// Bumped each time the slot is rewritten, so a reader can tell a stale
    /// entry from a fresh one with the same payload.
    pub generation: u16,
    /// Number of consecutive identical records coalesced into this entry.
    pub count: u32,
    pub payload: T,
}

/// A trace ring of parameterized payload type and size. Instantiate with the
/// [`ktrace!`] macro.
pub struct Ktrace<T: Copy + PartialEq, const N: usize> {
    inner: UnsafeCell<Inner<T, N>>,
}

// Safety: all access to `inner` goes through a critical section, which on
// this single-core system excludes both other tasks and ISRs.
unsafe impl<T: Copy + PartialEq + Send, const N: usize> Sync for Ktrace<T, N> {}

struct Inner<T, const N: usize> {
    last: Option<usize>,
    buffer: [KtraceEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ktrace<T, N> {
    /// Creates an empty ring with every payload set to `init`.
    pub const fn new(init: T) -> Self {
        Self {
            inner: UnsafeCell::new(Inner {
                last: None,
                buffer: [KtraceEntry {
                    line: 0,
                    generation: 0,
                    count: 0,
                    payload: init,
                }; N],
            }),
        }
    }

    /// Records an event. Prefer the [`ktrace_entry!`] macro, which fills in
    /// the line number.
    pub fn record(&self, line: u16, payload: T) {
        critical_section::with(|_| {
            // Safety: the critical section makes this the only live access
            // to `inner`; see the `Sync` impl.
            let inner = unsafe { &mut *self.inner.get() };
            inner.record(line, payload);
        })
    }

    /// Copies the ring out for inspection. Intended for hosted tests; on
    /// the target, rings are read with a debugger instead.
    pub fn snapshot(&self) -> (Option<usize>, [KtraceEntry<T>; N]) {
        critical_section::with(|_| {
            // Safety: as in `record`.
            let inner = unsafe { &*self.inner.get() };
            (inner.last, inner.buffer)
        })
    }
}

impl<T: Copy + PartialEq, const N: usize> Inner<T, N> {
    fn record(&mut self, line: u16, payload: T) {
        let ndx = match self.last {
            None => 0,
            Some(last) => {
                let ent = &mut self.buffer[last];
                if ent.line == line && ent.payload == payload {
                    ent.count += 1;
                    return;
                }
                if last + 1 >= N {
                    0
                } else {
                    last + 1
                }
            }
        };

        let ent = &mut self.buffer[ndx];
        ent.line = line;
        ent.payload = payload;
        ent.count = 1;
        ent.generation = ent.generation.wrapping_add(1);
        self.last = Some(ndx);
    }
}

/// Declares a static trace ring named `KTRACE` in the enclosing module, with
/// payload type `$ptype`, `$size` entries, and payload initializer `$pinit`.
#[macro_export]
macro_rules! ktrace {
    ($ptype:ty, $size:expr, $pinit:expr) => {
        static KTRACE: $crate::Ktrace<$ptype, { $size }> =
            $crate::Ktrace::new($pinit);
    };
}

/// Records an entry in the ring declared by [`ktrace!`] in the same module,
/// tagging it with the call site's line number.
#[macro_export]
macro_rules! ktrace_entry {
    ($payload:expr) => {
        KTRACE.record(line!() as u16, $payload)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Copy, Clone, Debug, PartialEq)]
    enum Trace {
        None,
        A(u8),
        B,
    }

    #[test]
    fn records_in_order() {
        let ring = Ktrace::<Trace, 4>::new(Trace::None);
        ring.record(1, Trace::A(0));
        ring.record(2, Trace::A(1));
        let (last, buf) = ring.snapshot();
        assert_eq!(last, Some(1));
        assert_eq!(buf[0].payload, Trace::A(0));
        assert_eq!(buf[1].payload, Trace::A(1));
        assert_eq!(buf[1].count, 1);
    }

    #[test]
    fn coalesces_repeats() {
        let ring = Ktrace::<Trace, 4>::new(Trace::None);
        for _ in 0..5 {
            ring.record(10, Trace::B);
        }
        let (last, buf) = ring.snapshot();
        assert_eq!(last, Some(0));
        assert_eq!(buf[0].count, 5);
        // A different line with the same payload is a distinct event.
        ring.record(11, Trace::B);
        let (last, _) = ring.snapshot();
        assert_eq!(last, Some(1));
    }

    #[test]
    fn wraps_and_bumps_generation() {
        let ring = Ktrace::<Trace, 2>::new(Trace::None);
        for i in 0..4 {
            ring.record(i, Trace::A(i as u8));
        }
        let (last, buf) = ring.snapshot();
        assert_eq!(last, Some(1));
        assert_eq!(buf[0].payload, Trace::A(2));
        assert_eq!(buf[0].generation, 2);
        assert_eq!(buf[1].payload, Trace::A(3));
    }

    // The macros expand against a module-local static; make sure that
    // actually compiles and records.
    mod macro_use {
        use super::super::*;
        use super::Trace;

        ktrace!(Trace, 8, Trace::None);

        #[test]
        fn macro_records() {
            ktrace_entry!(Trace::A(9));
            let (last, buf) = KTRACE.snapshot();
            assert_eq!(buf[last.unwrap()].payload, Trace::A(9));
        }
    }
}
