// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! OsitoFS: a flat, contiguously-allocated file store on NOR flash.
//!
//! The on-flash layout is three regions inside a fixed window: a superblock
//! sector, a file-table sector (128 fixed-size entries), and a data area
//! addressed by zero-based sector index. Files occupy a run of consecutive
//! data sectors; there are no directories, no indirection, and no journal.
//! An interrupted write can leave the store inconsistent -- that trade for
//! simplicity is deliberate and documented.
//!
//! The filesystem talks to hardware through two seams: [`Flash`] for the
//! SPI flash shim and [`UartPort`] for the upload wire protocol. Hosted
//! tests plug in a RAM-backed flash and a scripted port.
//!
//! # Concurrency
//!
//! One sector-sized working buffer inside [`OsitoFs`] is shared by table
//! reads, superblock writes, overwrite padding, and upload reception. It is
//! not reentrant: operations must be serialised by the caller (in the
//! kernel, by running them from task context under the filesystem's
//! critical-section wrapper), and any step that depends on the buffer
//! re-reads it after a nested use -- `write_super` in particular clobbers
//! it.

#![cfg_attr(not(test), no_std)]

use core::fmt;

use osito_abi::config::{FS_DATA_SECTORS, FS_MAX_FILES, FS_NAME_LEN, FS_SECTOR_SIZE};
use osito_ktrace::{ktrace, ktrace_entry};
use zerocopy::FromBytes;

mod records;
mod upload;

pub use records::{Entry, Superblock, ENTRY_SIZE, FS_MAGIC, FS_VERSION};
pub use upload::UartPort;

/// Smallest erase unit; every allocation is a whole number of these.
pub const SECTOR_SIZE: usize = FS_SECTOR_SIZE;

const BITMAP_BYTES: usize = FS_DATA_SECTORS.div_ceil(8);

/// Access to the flash window the filesystem lives in. Offset 0 is the
/// superblock sector.
///
/// The store is trusted: operations do not report failure, mirroring the
/// ROM SPI routines underneath. `erase_sector` and `write` take
/// sector-aligned / 4-byte-multiple arguments respectively (the filesystem
/// guarantees this); `read` may be called with any offset and length, and
/// implementations are expected to do their own alignment fix-up.
pub trait Flash {
    fn read(&mut self, offset: u32, buf: &mut [u8]);
    fn erase_sector(&mut self, offset: u32);
    fn write(&mut self, offset: u32, data: &[u8]);
}

impl<T: Flash + ?Sized> Flash for &mut T {
    fn read(&mut self, offset: u32, buf: &mut [u8]) {
        (**self).read(offset, buf)
    }
    fn erase_sector(&mut self, offset: u32) {
        (**self).erase_sector(offset)
    }
    fn write(&mut self, offset: u32, data: &[u8]) {
        (**self).write(offset, data)
    }
}

/// Why a filesystem operation could not complete. Plain data, never
/// wrapped; `Ok` covers everything else.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FsError {
    /// No valid filesystem behind the flash window (or `mount` has not
    /// been called). `format` is still allowed.
    NotMounted,
    /// Empty, or longer than a table entry can hold.
    BadName,
    /// Zero-length files are not representable.
    ZeroSize,
    /// Target name already present.
    Exists,
    NotFound,
    /// All 128 table entries are live.
    TableFull,
    /// No contiguous run of free sectors is long enough.
    NoSpace,
    /// Append would need more sectors than the file has; the store never
    /// reallocates in place.
    WontFit,
    /// Upload inter-byte timeout; the partial file has been removed.
    Timeout,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Mounted(u32),
    BadSuperblock,
    Formatted(u32),
    TableFull,
    NoSpace(u16),
    UploadTimeout(u32),
}

ktrace!(Trace, 16, Trace::None);

/// Summary returned by [`OsitoFs::mount`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MountInfo {
    pub files: u32,
    pub total_sectors: u32,
}

/// The filesystem proper, generic over its flash backend.
pub struct OsitoFs<F> {
    flash: F,
    data_sectors: u16,
    mounted: bool,
    /// Shared working buffer; see the crate docs for its discipline.
    buf: [u8; SECTOR_SIZE],
}

impl<F: Flash> OsitoFs<F> {
    /// Wraps `flash`, which exposes `2 + data_sectors` sectors starting at
    /// the superblock. Nothing is read until [`mount`](Self::mount) or
    /// [`format`](Self::format).
    pub fn new(flash: F, data_sectors: u16) -> Self {
        assert!(usize::from(data_sectors) <= FS_DATA_SECTORS);
        Self {
            flash,
            data_sectors,
            mounted: false,
            buf: [0; SECTOR_SIZE],
        }
    }

    /// Reads the superblock and, if it carries the right magic and
    /// version, marks the filesystem mounted.
    pub fn mount(&mut self) -> Result<MountInfo, FsError> {
        let sb = self.read_super();
        if !sb.is_valid() {
            ktrace_entry!(Trace::BadSuperblock);
            self.mounted = false;
            return Err(FsError::NotMounted);
        }
        self.mounted = true;
        ktrace_entry!(Trace::Mounted(sb.file_count.get()));
        Ok(MountInfo {
            files: sb.file_count.get(),
            total_sectors: sb.total_sectors.get(),
        })
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// Erases the metadata sectors and writes a fresh, empty filesystem.
    ///
    /// The table sector is explicitly zero-filled after the erase: erased
    /// flash reads 0xFF, and 0xFF must never appear as a valid first name
    /// byte.
    pub fn format(&mut self) -> Result<MountInfo, FsError> {
        self.flash.erase_sector(Self::SUPER_ADDR);
        self.flash.erase_sector(Self::TABLE_ADDR);

        self.buf.fill(0);
        self.flash.write(Self::TABLE_ADDR, &self.buf);

        let sb = Superblock::fresh(u32::from(self.data_sectors));
        self.write_super(&sb);

        self.mounted = true;
        ktrace_entry!(Trace::Formatted(u32::from(self.data_sectors)));
        Ok(MountInfo {
            files: 0,
            total_sectors: u32::from(self.data_sectors),
        })
    }

    /// Creates `name` holding a copy of `data`, contiguously allocated and
    /// rounded up to whole sectors.
    pub fn create(&mut self, name: &str, data: &[u8]) -> Result<(), FsError> {
        self.require_mounted()?;
        check_name(name)?;
        if data.is_empty() {
            return Err(FsError::ZeroSize);
        }

        self.read_table();
        if self.find_file(name).is_some() {
            return Err(FsError::Exists);
        }
        let slot = self.find_free_slot().ok_or_else(|| {
            ktrace_entry!(Trace::TableFull);
            FsError::TableFull
        })?;

        let nsec = sectors_for(data.len());
        let start = self.alloc_run(nsec)?;

        self.write_data_run(start, data);

        let entry = self.entry_mut(slot);
        entry.clear();
        entry.set_name(name);
        entry.size.set(data.len() as u32);
        entry.start_sector.set(start);
        entry.sector_count.set(nsec);
        self.write_table();

        self.bump_file_count(1);
        Ok(())
    }

    /// Reads `name` into `out`, clamped to the smaller of the file size
    /// and the buffer. Returns the number of bytes read.
    pub fn read(&mut self, name: &str, out: &mut [u8]) -> Result<usize, FsError> {
        self.require_mounted()?;
        self.read_table();
        let idx = self.find_file(name).ok_or(FsError::NotFound)?;
        let e = self.entry(idx);
        let to_read = (e.size.get() as usize).min(out.len());
        let addr = self.data_addr(e.start_sector.get());
        self.flash.read(addr, &mut out[..to_read]);
        Ok(to_read)
    }

    /// Removes `name`'s table entry. Data sectors are not erased; they are
    /// free simply by being unclaimed.
    pub fn delete(&mut self, name: &str) -> Result<(), FsError> {
        self.require_mounted()?;
        self.read_table();
        let idx = self.find_file(name).ok_or(FsError::NotFound)?;
        self.entry_mut(idx).clear();
        self.write_table();
        self.bump_file_count(-1);
        Ok(())
    }

    /// File size in bytes.
    pub fn stat(&mut self, name: &str) -> Result<u32, FsError> {
        self.require_mounted()?;
        self.read_table();
        let idx = self.find_file(name).ok_or(FsError::NotFound)?;
        Ok(self.entry(idx).size.get())
    }

    /// Free space in bytes: unclaimed sectors times the sector size.
    pub fn free_space(&mut self) -> Result<u32, FsError> {
        self.require_mounted()?;
        self.read_table();
        let mut bmap = [0u8; BITMAP_BYTES];
        self.build_bitmap(&mut bmap);
        Ok(self.count_free(&bmap) * SECTOR_SIZE as u32)
    }

    /// Replaces `name`'s contents. When the new data still fits in the
    /// file's allocated sectors the rewrite happens in place (the start
    /// sector is preserved); otherwise the file is deleted and recreated
    /// wherever space allows.
    pub fn overwrite(&mut self, name: &str, data: &[u8]) -> Result<(), FsError> {
        self.require_mounted()?;
        check_name(name)?;
        if data.is_empty() {
            return Err(FsError::ZeroSize);
        }

        self.read_table();
        let idx = match self.find_file(name) {
            Some(idx) => idx,
            None => return self.create(name, data),
        };

        let e = self.entry(idx);
        let start = e.start_sector.get();
        let old_count = e.sector_count.get();
        let new_nsec = sectors_for(data.len());

        if new_nsec <= old_count {
            for s in 0..old_count {
                let addr = self.data_addr(start + s);
                self.flash.erase_sector(addr);
            }
            self.write_data_run_no_erase(start, data);

            let e = self.entry_mut(idx);
            e.size.set(data.len() as u32);
            e.sector_count.set(new_nsec);
            self.write_table();
            return Ok(());
        }

        // Doesn't fit: delete, then take the create path.
        self.entry_mut(idx).clear();
        self.write_table();
        self.bump_file_count(-1);
        self.create(name, data)
    }

    /// Appends `data` to `name`, which must still fit in the sectors the
    /// file already owns -- the store never grows an allocation.
    pub fn append(&mut self, name: &str, data: &[u8]) -> Result<(), FsError> {
        self.require_mounted()?;
        if data.is_empty() {
            return Err(FsError::ZeroSize);
        }

        self.read_table();
        let idx = self.find_file(name).ok_or(FsError::NotFound)?;
        let e = self.entry(idx);
        let old_size = e.size.get() as usize;
        let start = e.start_sector.get();
        let owned = e.sector_count.get();

        let new_total = old_size + data.len();
        if sectors_for(new_total) > owned {
            return Err(FsError::WontFit);
        }

        let mut src = data;
        let mut write_pos = old_size;

        // A partial last sector has live data in front of the append
        // point: read-modify-erase-write through the shared buffer.
        let offset_in_sec = write_pos % SECTOR_SIZE;
        if offset_in_sec != 0 {
            let sec = (write_pos / SECTOR_SIZE) as u16;
            let addr = self.data_addr(start + sec);
            self.flash.read(addr, &mut self.buf);

            let space = SECTOR_SIZE - offset_in_sec;
            let chunk = src.len().min(space);
            self.buf[offset_in_sec..offset_in_sec + chunk]
                .copy_from_slice(&src[..chunk]);

            self.flash.erase_sector(addr);
            self.flash.write(addr, &self.buf);

            src = &src[chunk..];
            write_pos += chunk;
        }

        // Whatever remains starts on a sector boundary.
        while !src.is_empty() {
            let sec = (write_pos / SECTOR_SIZE) as u16;
            let addr = self.data_addr(start + sec);
            let chunk = src.len().min(SECTOR_SIZE);

            self.flash.erase_sector(addr);
            write_padded(&mut self.flash, addr, &src[..chunk]);

            src = &src[chunk..];
            write_pos += chunk;
        }

        // The buffer carried sector data above; reload the table before
        // touching the entry again.
        self.read_table();
        self.entry_mut(idx).size.set(new_total as u32);
        self.write_table();
        Ok(())
    }

    /// Renames `old` to `new` in place; data does not move.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<(), FsError> {
        self.require_mounted()?;
        check_name(old)?;
        check_name(new)?;

        self.read_table();
        let idx = self.find_file(old).ok_or(FsError::NotFound)?;
        if self.find_file(new).is_some() {
            return Err(FsError::Exists);
        }
        self.entry_mut(idx).set_name(new);
        self.write_table();
        Ok(())
    }

    /// Writes a human-readable table listing, one line per file.
    pub fn list(&mut self, out: &mut dyn fmt::Write) -> fmt::Result {
        if !self.mounted {
            return out.write_str("fs: not mounted\n");
        }

        self.read_table();
        out.write_str("Name                     Size  Sec\n")?;
        let mut count = 0;
        for i in 0..FS_MAX_FILES {
            let e = self.entry(i);
            if e.is_free() {
                continue;
            }
            let name = e.name_bytes();
            let size = e.size.get();
            let sectors = e.sector_count.get();
            for &b in name {
                out.write_char(b as char)?;
            }
            for _ in name.len()..25 {
                out.write_char(' ')?;
            }
            writeln!(out, "{}  {}", size, sectors)?;
            count += 1;
        }
        if count == 0 {
            out.write_str("(empty)\n")?;
        }
        Ok(())
    }

    // ===== internals =====

    const SUPER_ADDR: u32 = 0;
    const TABLE_ADDR: u32 = SECTOR_SIZE as u32;

    fn data_addr(&self, sector: u16) -> u32 {
        (2 + u32::from(sector)) * SECTOR_SIZE as u32
    }

    fn require_mounted(&self) -> Result<(), FsError> {
        if self.mounted {
            Ok(())
        } else {
            Err(FsError::NotMounted)
        }
    }

    /// Loads the file table into the shared buffer.
    fn read_table(&mut self) {
        self.flash.read(Self::TABLE_ADDR, &mut self.buf);
    }

    /// Writes the shared buffer back as the file table.
    fn write_table(&mut self) {
        self.flash.erase_sector(Self::TABLE_ADDR);
        self.flash.write(Self::TABLE_ADDR, &self.buf);
    }

    fn entry(&self, i: usize) -> &Entry {
        let off = i * ENTRY_SIZE;
        // An Entry is unaligned plain bytes; a 32-byte slice always
        // converts.
        match Entry::ref_from_bytes(&self.buf[off..off + ENTRY_SIZE]) {
            Ok(e) => e,
            Err(_) => unreachable!(),
        }
    }

    fn entry_mut(&mut self, i: usize) -> &mut Entry {
        let off = i * ENTRY_SIZE;
        match Entry::mut_from_bytes(&mut self.buf[off..off + ENTRY_SIZE]) {
            Ok(e) => e,
            Err(_) => unreachable!(),
        }
    }

    /// Scans the loaded table for `name`.
    fn find_file(&self, name: &str) -> Option<usize> {
        (0..FS_MAX_FILES).find(|&i| self.entry(i).name_matches(name))
    }

    fn find_free_slot(&self) -> Option<usize> {
        (0..FS_MAX_FILES).find(|&i| self.entry(i).is_free())
    }

    fn read_super(&mut self) -> Superblock {
        let mut raw = [0u8; core::mem::size_of::<Superblock>()];
        self.flash.read(Self::SUPER_ADDR, &mut raw);
        match Superblock::read_from_bytes(&raw) {
            Ok(sb) => sb,
            Err(_) => unreachable!(),
        }
    }

    /// Writes a superblock sector. Clobbers the shared buffer -- a
    /// sector-sized local would sink a 1.5 KiB task stack, so the one
    /// buffer is reused and every caller re-reads the table afterwards.
    fn write_super(&mut self, sb: &Superblock) {
        self.buf.fill(0xFF);
        self.buf[..core::mem::size_of::<Superblock>()]
            .copy_from_slice(zerocopy::IntoBytes::as_bytes(sb));
        self.flash.erase_sector(Self::SUPER_ADDR);
        self.flash.write(Self::SUPER_ADDR, &self.buf);
    }

    /// Adjusts the superblock's live-file count. Clobbers the shared
    /// buffer (via `write_super`).
    fn bump_file_count(&mut self, delta: i32) {
        let mut sb = self.read_super();
        let count = sb.file_count.get();
        let count = if delta < 0 {
            count.saturating_sub(delta.unsigned_abs())
        } else {
            count + delta as u32
        };
        sb.file_count.set(count);
        self.write_super(&sb);
    }

    /// Marks every sector claimed by a live entry. The table must be
    /// loaded.
    fn build_bitmap(&self, bmap: &mut [u8; BITMAP_BYTES]) {
        bmap.fill(0);
        for i in 0..FS_MAX_FILES {
            let e = self.entry(i);
            if e.is_free() {
                continue;
            }
            let start = e.start_sector.get();
            for s in 0..e.sector_count.get() {
                let bit = usize::from(start + s);
                if bit < usize::from(self.data_sectors) {
                    bmap[bit / 8] |= 1 << (bit % 8);
                }
            }
        }
    }

    /// First-fit scan for `count` contiguous clear bits.
    fn find_run(&self, bmap: &[u8; BITMAP_BYTES], count: u16) -> Option<u16> {
        let mut run = 0u16;
        let mut start = 0u16;
        for i in 0..self.data_sectors {
            if bmap[usize::from(i) / 8] & (1 << (i % 8)) != 0 {
                run = 0;
                start = i + 1;
            } else {
                run += 1;
                if run >= count {
                    return Some(start);
                }
            }
        }
        None
    }

    fn count_free(&self, bmap: &[u8; BITMAP_BYTES]) -> u32 {
        let mut free = 0;
        for i in 0..self.data_sectors {
            if bmap[usize::from(i) / 8] & (1 << (i % 8)) == 0 {
                free += 1;
            }
        }
        free
    }

    /// Builds the bitmap from the loaded table and allocates a run,
    /// tracing exhaustion.
    fn alloc_run(&mut self, nsec: u16) -> Result<u16, FsError> {
        let mut bmap = [0u8; BITMAP_BYTES];
        self.build_bitmap(&mut bmap);
        self.find_run(&bmap, nsec).ok_or_else(|| {
            ktrace_entry!(Trace::NoSpace(nsec));
            FsError::NoSpace
        })
    }

    /// Erases and writes a run of sectors from `data`.
    fn write_data_run(&mut self, start: u16, data: &[u8]) {
        for (s, chunk) in data.chunks(SECTOR_SIZE).enumerate() {
            let addr = self.data_addr(start + s as u16);
            self.flash.erase_sector(addr);
            write_padded(&mut self.flash, addr, chunk);
        }
    }

    /// As `write_data_run`, for callers that already erased the run.
    fn write_data_run_no_erase(&mut self, start: u16, data: &[u8]) {
        for (s, chunk) in data.chunks(SECTOR_SIZE).enumerate() {
            let addr = self.data_addr(start + s as u16);
            write_padded(&mut self.flash, addr, chunk);
        }
    }
}

/// Whole sectors needed to hold `len` bytes.
fn sectors_for(len: usize) -> u16 {
    len.div_ceil(SECTOR_SIZE) as u16
}

fn check_name(name: &str) -> Result<(), FsError> {
    if name.is_empty() || name.len() > FS_NAME_LEN - 1 {
        return Err(FsError::BadName);
    }
    Ok(())
}

/// Writes `data`, padding the trailing partial word with 0xFF so the flash
/// shim only ever sees 4-byte-multiple writes.
fn write_padded<F: Flash>(flash: &mut F, addr: u32, data: &[u8]) {
    let whole = data.len() & !3;
    if whole > 0 {
        flash.write(addr, &data[..whole]);
    }
    let rest = &data[whole..];
    if !rest.is_empty() {
        let mut tail = [0xFFu8; 4];
        tail[..rest.len()].copy_from_slice(rest);
        flash.write(addr + whole as u32, &tail);
    }
}

/// CRC-16/CCITT as the upload protocol defines it: polynomial 0x1021,
/// initial value 0xFFFF, no reflection, no output xor.
pub fn crc16(data: &[u8]) -> u16 {
    upload::CRC16.checksum(data)
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// RAM-backed NOR flash. Writes AND into the existing contents, as
    /// real NOR does -- a missing erase shows up as corrupted data instead
    /// of passing silently.
    pub struct RamFlash {
        pub mem: Vec<u8>,
    }

    impl RamFlash {
        pub fn new(total_sectors: usize) -> Self {
            Self {
                mem: vec![0xFF; total_sectors * SECTOR_SIZE],
            }
        }
    }

    impl Flash for RamFlash {
        fn read(&mut self, offset: u32, buf: &mut [u8]) {
            let off = offset as usize;
            buf.copy_from_slice(&self.mem[off..off + buf.len()]);
        }

        fn erase_sector(&mut self, offset: u32) {
            let off = offset as usize;
            assert_eq!(off % SECTOR_SIZE, 0, "unaligned erase");
            self.mem[off..off + SECTOR_SIZE].fill(0xFF);
        }

        fn write(&mut self, offset: u32, data: &[u8]) {
            assert_eq!(data.len() % 4, 0, "unaligned write length");
            let off = offset as usize;
            for (dst, src) in self.mem[off..off + data.len()].iter_mut().zip(data) {
                *dst &= src;
            }
        }
    }

    /// Deterministic junk for payloads.
    pub fn pattern(len: usize, seed: u32) -> Vec<u8> {
        let mut state = seed.wrapping_mul(2891336453).wrapping_add(1);
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1103515245).wrapping_add(12345);
                (state >> 16) as u8
            })
            .collect()
    }
}
