// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! On-flash record formats.
//!
//! Everything persistent is little-endian and packed; these structs are the
//! only place the byte layout is spelled out, and `zerocopy` keeps the Rust
//! view and the flash bytes the same thing.

use osito_abi::config::FS_NAME_LEN;
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned};

/// `"OSFT"` read as a little-endian word.
pub const FS_MAGIC: u32 = 0x4F53_4654;

pub const FS_VERSION: u32 = 1;

/// Size of one file-table entry on flash.
pub const ENTRY_SIZE: usize = 32;

/// First sector of the filesystem window.
///
/// The remainder of the sector past these fields is reserved; erased bytes
/// are acceptable there.
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct Superblock {
    pub magic: U32,
    pub version: U32,
    /// Data sectors available behind the table sector.
    pub total_sectors: U32,
    /// Number of live file-table entries.
    pub file_count: U32,
}

impl Superblock {
    pub fn fresh(total_sectors: u32) -> Self {
        Self {
            magic: U32::new(FS_MAGIC),
            version: U32::new(FS_VERSION),
            total_sectors: U32::new(total_sectors),
            file_count: U32::new(0),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic.get() == FS_MAGIC && self.version.get() == FS_VERSION
    }
}

/// One slot of the 128-entry file table.
///
/// A slot is unused iff `name[0]` is `0x00` or `0xFF` -- the latter because
/// erased flash reads all-ones, and a formatter that forgot to zero the
/// table must not conjure 128 phantom files.
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct Entry {
    /// NUL-padded file name.
    pub name: [u8; FS_NAME_LEN],
    /// File size in bytes.
    pub size: U32,
    /// First data sector, counted from the start of the data area.
    pub start_sector: U16,
    /// Contiguous sectors allocated to the file.
    pub sector_count: U16,
}

impl Entry {
    pub fn is_free(&self) -> bool {
        self.name[0] == 0x00 || self.name[0] == 0xFF
    }

    /// The stored name, up to the first NUL.
    pub fn name_bytes(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(FS_NAME_LEN);
        &self.name[..len]
    }

    pub fn name_matches(&self, name: &str) -> bool {
        !self.is_free() && self.name_bytes() == name.as_bytes()
    }

    /// Stores `name` truncated to `FS_NAME_LEN - 1` bytes, NUL-padded.
    pub fn set_name(&mut self, name: &str) {
        let src = name.as_bytes();
        let n = src.len().min(FS_NAME_LEN - 1);
        self.name = [0; FS_NAME_LEN];
        self.name[..n].copy_from_slice(&src[..n]);
    }

    pub fn clear(&mut self) {
        *self = Entry::new_zeroed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn on_flash_sizes() {
        assert_eq!(size_of::<Entry>(), ENTRY_SIZE);
        assert_eq!(size_of::<Superblock>(), 16);
    }

    #[test]
    fn magic_spells_osft() {
        assert_eq!(&FS_MAGIC.to_le_bytes(), b"TFSO");
        // i.e. the bytes "OSFT" read as a little-endian u32.
        assert_eq!(u32::from_le_bytes(*b"TFSO"), FS_MAGIC);
    }

    #[test]
    fn erased_and_zeroed_entries_are_free() {
        let mut e = Entry::new_zeroed();
        assert!(e.is_free());
        e.name = [0xFF; FS_NAME_LEN];
        assert!(e.is_free());
        e.set_name("a");
        assert!(!e.is_free());
    }

    #[test]
    fn name_round_trip_and_truncation() {
        let mut e = Entry::new_zeroed();
        e.set_name("hello.txt");
        assert!(e.name_matches("hello.txt"));
        assert!(!e.name_matches("hello"));

        let long = "x".repeat(40);
        e.set_name(&long);
        assert_eq!(e.name_bytes().len(), FS_NAME_LEN - 1);
    }
}
