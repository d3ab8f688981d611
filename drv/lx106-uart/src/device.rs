// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Raw UART0 register access.
//!
//! There is no vendor PAC for this part; the register map is small enough
//! to spell out. Offsets are from the UART0 block at `0x6000_0000`.

use super::Int;

const UART0_BASE: usize = 0x6000_0000;

const REG_FIFO: usize = UART0_BASE + 0x00;
const REG_INT_ST: usize = UART0_BASE + 0x08;
const REG_INT_ENA: usize = UART0_BASE + 0x0C;
const REG_INT_CLR: usize = UART0_BASE + 0x10;
const REG_STATUS: usize = UART0_BASE + 0x1C;
const REG_CONF1: usize = UART0_BASE + 0x24;

/// Hardware watchdog feed register; poked while spinning on the TX FIFO so
/// long console bursts can't trip a reset.
const WDT_FEED: usize = 0x6000_0914;
const WDT_FEED_MAGIC: u32 = 0x73;

const STATUS_RXFIFO_CNT_MASK: u32 = 0xFF;
const STATUS_TXFIFO_CNT_SHIFT: u32 = 16;
const STATUS_TXFIFO_CNT_MASK: u32 = 0xFF;

/// TX FIFO depth is 128; leave a couple of slots of headroom before
/// stuffing another byte.
const TXFIFO_HIGH_WATER: u32 = 126;

const CONF1_RX_TOUT_EN: u32 = 1 << 31;
const CONF1_RX_TOUT_SHIFT: u32 = 24;

fn read_reg(addr: usize) -> u32 {
    // Safety: `addr` is one of the memory-mapped UART registers named
    // above; volatile access to device memory.
    unsafe { (addr as *const u32).read_volatile() }
}

fn write_reg(addr: usize, value: u32) {
    // Safety: as in `read_reg`.
    unsafe { (addr as *mut u32).write_volatile(value) }
}

pub fn interrupt_status() -> Int {
    Int::from_bits_truncate(read_reg(REG_INT_ST))
}

pub fn enable_interrupts(mask: Int) {
    write_reg(REG_INT_ENA, mask.bits());
}

pub fn clear_interrupts(mask: Int) {
    write_reg(REG_INT_CLR, mask.bits());
}

/// Programs the RX FIFO threshold and the idle timeout (in bit times).
pub fn configure_rx(fifo_threshold: u32, timeout: u32) {
    write_reg(
        REG_CONF1,
        (fifo_threshold & 0x7F)
            | (timeout << CONF1_RX_TOUT_SHIFT)
            | CONF1_RX_TOUT_EN,
    );
}

pub fn rx_fifo_count() -> u32 {
    read_reg(REG_STATUS) & STATUS_RXFIFO_CNT_MASK
}

pub fn read_fifo() -> u8 {
    (read_reg(REG_FIFO) & 0xFF) as u8
}

/// Blocks until the TX FIFO has room, then writes `byte`.
pub fn write_fifo(byte: u8) {
    loop {
        write_reg(WDT_FEED, WDT_FEED_MAGIC);
        let pending =
            (read_reg(REG_STATUS) >> STATUS_TXFIFO_CNT_SHIFT) & STATUS_TXFIFO_CNT_MASK;
        if pending < TXFIFO_HIGH_WATER {
            break;
        }
    }
    write_reg(REG_FIFO, u32::from(byte));
}
