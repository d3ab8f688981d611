// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hosted stand-in for the UART registers.
//!
//! TX bytes are captured into a thread-local buffer that tests can drain
//! with [`take_tx_output`]; RX bytes are scripted with [`rx_inject`] and
//! then "arrive" when the driver's `handle_irq` runs, just as a hardware
//! FIFO would present them.

use super::Int;
use std::cell::RefCell;
use std::collections::VecDeque;

thread_local! {
    static TX: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
    static RX_FIFO: RefCell<VecDeque<u8>> = const { RefCell::new(VecDeque::new()) };
}

/// Scripts bytes into the fake hardware RX FIFO.
pub fn rx_inject(bytes: &[u8]) {
    RX_FIFO.with(|f| f.borrow_mut().extend(bytes));
}

/// Drains and returns everything written to the fake TX side.
pub fn take_tx_output() -> Vec<u8> {
    TX.with(|t| std::mem::take(&mut *t.borrow_mut()))
}

pub fn interrupt_status() -> Int {
    let waiting = RX_FIFO.with(|f| !f.borrow().is_empty());
    if waiting {
        Int::RXFIFO_TOUT
    } else {
        Int::empty()
    }
}

pub fn enable_interrupts(_mask: Int) {}

pub fn clear_interrupts(_mask: Int) {}

pub fn configure_rx(_fifo_threshold: u32, _timeout: u32) {}

pub fn rx_fifo_count() -> u32 {
    RX_FIFO.with(|f| f.borrow().len() as u32)
}

pub fn read_fifo() -> u8 {
    RX_FIFO.with(|f| f.borrow_mut().pop_front().unwrap_or(0))
}

pub fn write_fifo(byte: u8) {
    TX.with(|t| t.borrow_mut().push(byte));
}
