// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Compile-time configuration of the system.
//!
//! The whole system takes a single shape fixed at compile time; there is no
//! runtime configuration. Anything that two crates need to agree on lives
//! here.

/// Number of task table slots, idle task included.
pub const MAX_TASKS: usize = 8;

/// Scheduler tick rate.
pub const TICK_HZ: u32 = 100;

/// Per-task stack size in bytes. Stacks are statically allocated and
/// fixed-size; overflow is not detected.
pub const TASK_STACK_SIZE: usize = 1536;

/// Dedicated stack for the exception dispatcher.
pub const ISR_STACK_SIZE: usize = 512;

/// CPU core clock.
pub const CPU_FREQ_HZ: u32 = 80_000_000;

/// Hardware tick timer prescaler.
pub const TIMER_PRESCALER: u32 = 16;

/// Reload value programmed into the tick timer: one tick every
/// `TIMER_LOAD` prescaled counts (50 000 at the reference clock).
pub const TIMER_LOAD: u32 = CPU_FREQ_HZ / TIMER_PRESCALER / TICK_HZ;

/// Block pool geometry: 256 blocks of 32 bytes, 8 KiB total.
pub const POOL_BLOCK_SIZE: usize = 32;
pub const POOL_NUM_BLOCKS: usize = 256;
pub const POOL_TOTAL_SIZE: usize = POOL_BLOCK_SIZE * POOL_NUM_BLOCKS;

/// Variable-size heap region, in bytes.
pub const HEAP_SIZE: usize = 8192;

/// UART receive ring capacity. One byte of capacity is sacrificed to
/// distinguish full from empty.
pub const UART_RX_BUF_SIZE: usize = 64;

/// Smallest flash erase unit.
pub const FS_SECTOR_SIZE: usize = 4096;

/// Maximum file name length including the terminating NUL.
pub const FS_NAME_LEN: usize = 24;

/// Number of file-table entries.
pub const FS_MAX_FILES: usize = 128;

/// Filesystem window in the flash address space. The window starts with the
/// superblock sector, then the file-table sector, then the data area.
pub const FS_FLASH_BASE: u32 = 0x4_0000;
pub const FS_FLASH_END: u32 = 0x40_0000;

/// Number of data sectors in the window (958 on the reference 4 MiB part).
pub const FS_DATA_SECTORS: usize =
    (FS_FLASH_END - FS_FLASH_BASE) as usize / FS_SECTOR_SIZE - 2;

/// Interrupt numbers multiplexed by the level-1 exception dispatcher.
///
/// These index bits in the interrupt pending/enable/set/clear registers.
pub const INUM_UART: u32 = 5;
pub const INUM_SOFT: u32 = 7;
pub const INUM_TIMER: u32 = 9;
