// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The context frame deposited on a task's stack at exception entry.
//!
//! This layout is consumed by hand-written assembly on both the save and
//! restore paths, so it is a plain byte record with explicit offsets rather
//! than something the compiler is free to rearrange. The byte offsets below
//! are the contract; the `ContextFrame` struct is the Rust view of the same
//! bytes, and a test pins the two together.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Byte offsets of each saved register from the frame base.
///
/// A0 holds the interrupted return address; A1 the stack pointer as it will
/// be after the frame is popped. PS/SAR/EPC1 are the special registers the
/// exception path must preserve; EPC1 is the resume address.
pub const CTX_A0: usize = 0x00;
pub const CTX_A1: usize = 0x04;
pub const CTX_A2: usize = 0x08;
pub const CTX_A3: usize = 0x0C;
pub const CTX_PS: usize = 0x40;
pub const CTX_SAR: usize = 0x44;
pub const CTX_EPC1: usize = 0x48;

/// Total frame size: A0–A15, PS, SAR, EPC1, and one pad word.
pub const FRAME_SIZE: usize = 80;

/// Initial PS for a fresh task: user vector mode with the exception-mask
/// bit set, so that the `rfe` on the restore path clears it and the task
/// starts with interrupts live.
pub const INITIAL_PS: u32 = 0x0000_0030;

/// Rust view of the 80-byte save area.
///
/// `repr(C)` keeps the field order; the `pad` word keeps the frame a
/// multiple of 16 bytes so stack alignment survives a push.
#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ContextFrame {
    pub a: [u32; 16],
    pub ps: u32,
    pub sar: u32,
    pub epc1: u32,
    pub pad: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn frame_layout_matches_assembly() {
        assert_eq!(size_of::<ContextFrame>(), FRAME_SIZE);
        assert_eq!(offset_of!(ContextFrame, a), CTX_A0);
        assert_eq!(offset_of!(ContextFrame, ps), CTX_PS);
        assert_eq!(offset_of!(ContextFrame, sar), CTX_SAR);
        assert_eq!(offset_of!(ContextFrame, epc1), CTX_EPC1);
    }

    #[test]
    fn register_offsets_are_word_indexed() {
        assert_eq!(CTX_A1, CTX_A0 + 4);
        assert_eq!(CTX_A3, CTX_A2 + 4);
    }
}
