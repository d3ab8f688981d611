// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver for UART0 on the LX106.
//!
//! TX is polled: `putc` waits for FIFO space and writes the byte. RX is
//! interrupt-driven: the level-1 exception dispatcher calls [`handle_irq`]
//! when the UART source is pending, and the handler drains the hardware
//! FIFO into a software ring that task code reads with [`getc`].
//!
//! The hardware itself (baud, 8N1, pin mux) is configured by the boot ROM
//! before the kernel starts; [`init`] only sets up the RX interrupt plumbing.
//!
//! On hosted builds the register accesses are replaced by a fake UART
//! (thread-local TX capture and a scripted RX FIFO) so the ring and the
//! formatted-output helpers can be tested off-target.

#![cfg_attr(target_os = "none", no_std)]

use bitflags::bitflags;
use osito_abi::config::UART_RX_BUF_SIZE;

mod ring;
pub use ring::RxRing;

#[cfg(target_os = "none")]
mod device;
#[cfg(not(target_os = "none"))]
mod fakes;
#[cfg(not(target_os = "none"))]
use fakes as device;

bitflags! {
    /// UART interrupt status/enable/clear bits.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct Int: u32 {
        const RXFIFO_FULL = 1 << 0;
        const RXFIFO_TOUT = 1 << 8;
    }
}

/// RX ring shared between the ISR (producer) and task code (consumer).
static RX_RING: RxRing<UART_RX_BUF_SIZE> = RxRing::new();

/// Sets up RX interrupts: one-byte FIFO threshold plus an idle timeout, so
/// single keystrokes arrive promptly and bursts drain efficiently.
pub fn init() {
    device::clear_interrupts(Int::all());
    device::configure_rx(1, 10);
    device::enable_interrupts(Int::RXFIFO_FULL | Int::RXFIFO_TOUT);
}

/// UART interrupt service routine.
///
/// Called from the exception dispatcher with interrupts masked when the
/// UART's level-triggered source is pending. Drains every byte the
/// hardware FIFO holds into the ring -- dropping bytes when the ring is
/// full, because an ISR must not wait -- and acknowledges the interrupt at
/// the peripheral, which is what deasserts the level source.
pub fn handle_irq() {
    let status = device::interrupt_status();
    if status.intersects(Int::RXFIFO_FULL | Int::RXFIFO_TOUT) {
        while device::rx_fifo_count() > 0 {
            let byte = device::read_fifo();
            let _ = RX_RING.push(byte);
        }
    }
    device::clear_interrupts(Int::all());
}

/// Pops one received byte, or `None` when the ring is empty.
pub fn getc() -> Option<u8> {
    RX_RING.pop()
}

/// True when at least one received byte is waiting.
pub fn rx_available() -> bool {
    RX_RING.available()
}

/// Writes one raw byte, waiting for FIFO space.
pub fn putc(byte: u8) {
    device::write_fifo(byte);
}

/// Writes a string, expanding `\n` to `\r\n` for terminals.
pub fn puts(s: &str) {
    for &b in s.as_bytes() {
        if b == b'\n' {
            putc(b'\r');
        }
        putc(b);
    }
}

/// Writes `val` in decimal.
pub fn put_dec(val: u32) {
    let mut buf = [0u8; 10];
    let mut i = 0;
    let mut v = val;

    if v == 0 {
        putc(b'0');
        return;
    }
    while v > 0 {
        buf[i] = b'0' + (v % 10) as u8;
        v /= 10;
        i += 1;
    }
    while i > 0 {
        i -= 1;
        putc(buf[i]);
    }
}

/// Writes `val` as `0x` followed by eight lowercase hex digits.
pub fn put_hex(val: u32) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    puts("0x");
    for shift in (0..=28).rev().step_by(4) {
        putc(HEX[((val >> shift) & 0xF) as usize]);
    }
}

#[cfg(not(target_os = "none"))]
pub use fakes::{rx_inject, take_tx_output};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dec_formatting() {
        take_tx_output();
        put_dec(0);
        put_dec(50000);
        assert_eq!(take_tx_output(), b"050000");
    }

    #[test]
    fn hex_formatting_is_zero_padded_lowercase() {
        take_tx_output();
        put_hex(0xBEEF);
        assert_eq!(take_tx_output(), b"0x0000beef");
        put_hex(0xFFFF_FFFF);
        assert_eq!(take_tx_output(), b"0xffffffff");
    }

    #[test]
    fn puts_expands_newlines() {
        take_tx_output();
        puts("ok\n");
        assert_eq!(take_tx_output(), b"ok\r\n");
    }

    #[test]
    fn irq_drains_fifo_into_ring() {
        // Drain anything a previous test left behind.
        while getc().is_some() {}

        rx_inject(b"abc");
        assert!(!rx_available());
        handle_irq();
        assert!(rx_available());
        assert_eq!(getc(), Some(b'a'));
        assert_eq!(getc(), Some(b'b'));
        assert_eq!(getc(), Some(b'c'));
        assert_eq!(getc(), None);
    }

    #[test]
    fn int_bits_match_hardware() {
        assert_eq!(Int::RXFIFO_FULL.bits(), 1);
        assert_eq!(Int::RXFIFO_TOUT.bits(), 0x100);
    }
}
