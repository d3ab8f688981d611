// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Board wiring for the filesystem: the ROM SPI flash shim, the console
//! as an upload port, and the one global `OsitoFs` instance.
//!
//! The filesystem object carries a 4 KiB working buffer, far too big for
//! a 1.5 KiB task stack, so it lives in a static.
//!
//! # Ownership
//!
//! Exactly one task -- the console task -- calls into this module. That
//! single-owner rule is load-bearing: [`with_fs`] masks interrupts for
//! the short metadata sequences, but [`with_fs_for_upload`] must leave
//! interrupts live (reception sleeps on UART bytes that only arrive via
//! the RX ISR), and its exclusive access to the instance holds only
//! because no other task ever touches the filesystem. Do not add a
//! second filesystem-calling task to this image without also funnelling
//! it through the console task.

use core::cell::UnsafeCell;
use core::fmt;

use drv_lx106_uart as uart;
use osito_abi::config::{FS_DATA_SECTORS, FS_FLASH_BASE, FS_SECTOR_SIZE};
use osito_abi::InTask;
use osito_fs::{Flash, OsitoFs, UartPort};
use osito_kern::sched;

// ROM SPI entry points, as the boot ROM exports them.
extern "C" {
    fn SPIRead(addr: u32, dst: *mut u32, len: u32) -> i32;
    fn SPIWrite(addr: u32, src: *const u32, len: u32) -> i32;
    fn SPIEraseSector(sector: u32) -> i32;
}

/// The filesystem window of the SPI flash, addressed from the window
/// base as the filesystem expects.
pub struct RomFlash;

impl Flash for RomFlash {
    fn read(&mut self, offset: u32, buf: &mut [u8]) {
        let mut addr = FS_FLASH_BASE + offset;
        // The ROM routine wants a 4-byte-aligned destination and a
        // 4-byte-multiple length; anything else bounces through an
        // aligned scratch block.
        if buf.as_ptr() as usize % 4 == 0 && buf.len() % 4 == 0 {
            // Safety: destination is aligned, writable, and the length
            // is a multiple of four.
            unsafe {
                SPIRead(addr, buf.as_mut_ptr() as *mut u32, buf.len() as u32);
            }
            return;
        }

        #[repr(align(4))]
        struct Scratch([u8; 64]);
        let mut tmp = Scratch([0; 64]);
        for chunk in buf.chunks_mut(64) {
            let n = chunk.len();
            // Safety: the scratch block is aligned and big enough for the
            // rounded-up transfer.
            unsafe {
                SPIRead(addr, tmp.0.as_mut_ptr() as *mut u32, ((n + 3) & !3) as u32);
            }
            chunk.copy_from_slice(&tmp.0[..n]);
            addr += n as u32;
        }
    }

    fn erase_sector(&mut self, offset: u32) {
        // Safety: erasing within the filesystem window only.
        unsafe {
            SPIEraseSector((FS_FLASH_BASE + offset) / FS_SECTOR_SIZE as u32);
        }
    }

    fn write(&mut self, offset: u32, data: &[u8]) {
        let mut addr = FS_FLASH_BASE + offset;
        // Lengths are 4-byte multiples per the Flash contract, but the
        // source buffer can sit at any address; the ROM routine cannot.
        if data.as_ptr() as usize % 4 == 0 {
            // Safety: aligned source, 4-byte-multiple length.
            unsafe {
                SPIWrite(addr, data.as_ptr() as *const u32, data.len() as u32);
            }
            return;
        }

        #[repr(align(4))]
        struct Scratch([u8; 64]);
        let mut tmp = Scratch([0; 64]);
        for chunk in data.chunks(64) {
            tmp.0[..chunk.len()].copy_from_slice(chunk);
            // Safety: the scratch block is aligned; length rounds up
            // within it.
            unsafe {
                SPIWrite(
                    addr,
                    tmp.0.as_ptr() as *const u32,
                    ((chunk.len() + 3) & !3) as u32,
                );
            }
            addr += chunk.len() as u32;
        }
    }
}

/// The UART as the upload protocol's port: nonblocking reads from the RX
/// ring, polled writes, scheduler ticks for the timeout, yield to wait.
pub struct ConsolePort {
    pub token: InTask,
}

impl UartPort for ConsolePort {
    fn try_read(&mut self) -> Option<u8> {
        uart::getc()
    }

    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            uart::putc(b);
        }
    }

    fn now_tick(&self) -> u32 {
        sched::ticks_now()
    }

    fn idle(&mut self) {
        sched::yield_now(self.token);
    }
}

/// `fmt::Write` view of the console, for `fs list` output.
pub struct Console;

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        uart::puts(s);
        Ok(())
    }
}

struct FsCell(UnsafeCell<Option<OsitoFs<RomFlash>>>);

// Safety: access is confined to `with_fs`'s critical section.
unsafe impl Sync for FsCell {}

static FS: FsCell = FsCell(UnsafeCell::new(None));

/// Runs `body` against the global filesystem with interrupts masked,
/// building the instance on first use. Right for the metadata
/// operations, which are short multi-step sequences over the shared
/// sector buffer. Console task only; see the module docs.
pub fn with_fs<R>(body: impl FnOnce(&mut OsitoFs<RomFlash>) -> R) -> R {
    critical_section::with(|_| {
        // Safety: critical section; see FsCell's Sync impl.
        let slot = unsafe { &mut *FS.0.get() };
        let fs = slot
            .get_or_insert_with(|| OsitoFs::new(RomFlash, FS_DATA_SECTORS as u16));
        body(fs)
    })
}

/// As [`with_fs`], but with interrupts live: an upload sleeps while it
/// owns the instance, waiting on UART bytes that only arrive if the RX
/// interrupt can run. Console task only -- exclusivity rests entirely on
/// that task being the sole filesystem caller (module docs), since
/// nothing here masks the scheduler out of the way.
pub fn with_fs_for_upload<R>(
    _token: InTask,
    body: impl FnOnce(&mut OsitoFs<RomFlash>) -> R,
) -> R {
    critical_section::with(|_| {
        // Safety: brief masked section only to materialize the instance.
        let slot = unsafe { &mut *FS.0.get() };
        slot.get_or_insert_with(|| OsitoFs::new(RomFlash, FS_DATA_SECTORS as u16));
    });
    // Safety: every path into this module runs on the one console task,
    // so no other task-context &mut can exist concurrently, and no ISR
    // touches the filesystem. The &mut therefore cannot alias even
    // though `body` blocks and yields while holding it.
    let fs = unsafe { (*FS.0.get()).as_mut().unwrap_or_else(|| panic!()) };
    body(fs)
}
