// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The framed binary upload protocol.
//!
//! A host pushes a file over the UART in one streamed burst:
//!
//! 1. The device reserves the file in the table (so a concurrent operation
//!    can't claim the sectors), then answers `READY\n`.
//! 2. The host streams exactly `total_size` payload bytes.
//! 3. After committing each sector the device emits a single `#`, which the
//!    host treats as clear-to-send for the next sector's worth of bytes.
//! 4. The device finishes with `\nOK 0xhhhhhhhh\n`, where the hex digits
//!    are the CRC-16/CCITT of the payload, or aborts with `ERR timeout\n`
//!    after a ten-second gap and deletes the partial file.

use crc::{Crc, CRC_16_IBM_3740};

use osito_abi::config::TICK_HZ;
use osito_ktrace::ktrace_entry;

use crate::{sectors_for, FsError, Flash, OsitoFs, Trace, KTRACE, SECTOR_SIZE};

/// The wire format calls this CRC-16/CCITT: polynomial 0x1021, initial
/// value 0xFFFF, no reflection, no output xor. A `static` so the digest
/// can borrow the table across the whole transfer.
pub(crate) static CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Inter-byte timeout, in ticks.
const TIMEOUT_TICKS: u32 = 10 * TICK_HZ;

/// The UART as the upload protocol sees it, plus enough of the kernel to
/// wait politely: the current tick for timeout bookkeeping and a way to
/// yield the CPU between polls.
pub trait UartPort {
    /// Non-blocking read of one received byte.
    fn try_read(&mut self) -> Option<u8>;
    /// Transmit, blocking until the bytes are accepted.
    fn write(&mut self, bytes: &[u8]);
    /// Current scheduler tick.
    fn now_tick(&self) -> u32;
    /// Give up the CPU while waiting for more bytes.
    fn idle(&mut self);
}

impl<F: Flash> OsitoFs<F> {
    /// Receives `total_size` bytes from `port` into a file named `name`,
    /// sector by sector. Returns the CRC of the received payload.
    ///
    /// Any existing file of the same name is replaced. The table entry is
    /// committed *before* the data arrives; an aborted transfer therefore
    /// leaves cleanup to the timeout path, which deletes the entry.
    pub fn upload<P: UartPort>(
        &mut self,
        port: &mut P,
        name: &str,
        total_size: u32,
    ) -> Result<u16, FsError> {
        self.require_mounted()?;
        crate::check_name(name)?;
        if total_size == 0 {
            return Err(FsError::ZeroSize);
        }

        // Replace an existing file outright.
        self.read_table();
        if let Some(idx) = self.find_file(name) {
            self.entry_mut(idx).clear();
            self.write_table();
            self.bump_file_count(-1);
            // write_super went through the shared buffer; get the table
            // back before we touch entries again.
            self.read_table();
        }

        let slot = self.find_free_slot().ok_or(FsError::TableFull)?;
        let nsec = sectors_for(total_size as usize);
        let start = self.alloc_run(nsec)?;

        // Reserve now, receive later.
        let entry = self.entry_mut(slot);
        entry.clear();
        entry.set_name(name);
        entry.size.set(total_size);
        entry.start_sector.set(start);
        entry.sector_count.set(nsec);
        self.write_table();
        self.bump_file_count(1);

        port.write(b"READY\n");

        let mut digest = CRC16.digest();
        let mut received: u32 = 0;

        for sec in 0..nsec {
            let chunk = ((total_size - received) as usize).min(SECTOR_SIZE);

            let mut got = 0;
            let mut last_byte = port.now_tick();
            while got < chunk {
                match port.try_read() {
                    Some(byte) => {
                        self.buf[got] = byte;
                        got += 1;
                        last_byte = port.now_tick();
                    }
                    None => {
                        port.idle();
                        if port.now_tick().wrapping_sub(last_byte) > TIMEOUT_TICKS {
                            ktrace_entry!(Trace::UploadTimeout(received));
                            let _ = self.delete(name);
                            port.write(b"ERR timeout\n");
                            return Err(FsError::Timeout);
                        }
                    }
                }
            }

            digest.update(&self.buf[..got]);
            received += got as u32;

            // Unused tail of the sector stays at the erased value.
            self.buf[got..].fill(0xFF);

            let addr = self.data_addr(start + sec);
            self.flash.erase_sector(addr);
            self.flash.write(addr, &self.buf);

            // Per-sector ACK; the host waits for this before sending more.
            port.write(b"#");
        }

        let crc = digest.finalize();
        port.write(b"\nOK ");
        write_hex(port, u32::from(crc));
        port.write(b"\n");
        Ok(crc)
    }
}

/// `0x` plus eight lowercase hex digits, most significant first.
fn write_hex<P: UartPort>(port: &mut P, val: u32) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    port.write(b"0x");
    for shift in (0..=28).rev().step_by(4) {
        port.write(&[HEX[((val >> shift) & 0xF) as usize]]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{pattern, RamFlash};
    use std::collections::VecDeque;

    /// A host on the other end of the wire, with a manually advanced
    /// clock: every `idle()` is one tick of waiting.
    struct ScriptedPort {
        rx: VecDeque<u8>,
        tx: Vec<u8>,
        now: u32,
    }

    impl ScriptedPort {
        fn new(payload: &[u8]) -> Self {
            Self {
                rx: payload.iter().copied().collect(),
                tx: Vec::new(),
                now: 0,
            }
        }
    }

    impl UartPort for ScriptedPort {
        fn try_read(&mut self) -> Option<u8> {
            self.rx.pop_front()
        }
        fn write(&mut self, bytes: &[u8]) {
            self.tx.extend_from_slice(bytes);
        }
        fn now_tick(&self) -> u32 {
            self.now
        }
        fn idle(&mut self) {
            self.now += 1;
        }
    }

    fn fresh_fs(data_sectors: u16) -> OsitoFs<RamFlash> {
        let flash = RamFlash::new(2 + usize::from(data_sectors));
        let mut fs = OsitoFs::new(flash, data_sectors);
        fs.format().unwrap();
        fs
    }

    #[test]
    fn five_kilobyte_transfer() {
        let mut fs = fresh_fs(16);
        let payload = pattern(5000, 42);
        let mut port = ScriptedPort::new(&payload);

        let crc = fs.upload(&mut port, "blob", 5000).unwrap();
        assert_eq!(crc, crate::crc16(&payload));

        // Framing: READY, one ACK per sector (ceil(5000/4096) = 2), then
        // the receipt.
        let expected = {
            let mut v = b"READY\n".to_vec();
            v.extend_from_slice(b"##");
            v.extend_from_slice(format!("\nOK 0x{:08x}\n", crc).as_bytes());
            v
        };
        assert_eq!(port.tx, expected);

        // And the file is really there.
        let mut buf = vec![0u8; 5000];
        assert_eq!(fs.read("blob", &mut buf), Ok(5000));
        assert_eq!(buf, payload);
        assert_eq!(fs.mount().unwrap().files, 1);
    }

    #[test]
    fn single_partial_sector_transfer() {
        let mut fs = fresh_fs(16);
        let payload = pattern(100, 1);
        let mut port = ScriptedPort::new(&payload);

        let crc = fs.upload(&mut port, "small", 100).unwrap();
        assert_eq!(crc, crate::crc16(&payload));
        assert_eq!(
            port.tx.iter().filter(|&&b| b == b'#').count(),
            1,
            "one sector, one ack"
        );
    }

    #[test]
    fn timeout_removes_partial_file() {
        let mut fs = fresh_fs(16);
        // Announce 200 bytes but only ever send 10.
        let mut port = ScriptedPort::new(&pattern(10, 1));

        assert_eq!(
            fs.upload(&mut port, "gone", 200),
            Err(FsError::Timeout)
        );
        assert!(port.tx.starts_with(b"READY\n"));
        assert!(port.tx.ends_with(b"ERR timeout\n"));

        // The reserved entry must be gone again, sectors and all.
        assert_eq!(fs.stat("gone"), Err(FsError::NotFound));
        assert_eq!(
            fs.free_space().unwrap(),
            16 * SECTOR_SIZE as u32
        );
        assert_eq!(fs.mount().unwrap().files, 0);
    }

    #[test]
    fn upload_replaces_existing_file() {
        let mut fs = fresh_fs(16);
        fs.create("cfg", b"old contents").unwrap();

        let payload = pattern(300, 5);
        let mut port = ScriptedPort::new(&payload);
        fs.upload(&mut port, "cfg", 300).unwrap();

        let mut buf = vec![0u8; 300];
        assert_eq!(fs.read("cfg", &mut buf), Ok(300));
        assert_eq!(buf, payload);
        assert_eq!(fs.mount().unwrap().files, 1);
    }

    #[test]
    fn upload_validates_arguments() {
        let mut fs = fresh_fs(4);
        let mut port = ScriptedPort::new(&[]);
        assert_eq!(fs.upload(&mut port, "", 10), Err(FsError::BadName));
        assert_eq!(fs.upload(&mut port, "f", 0), Err(FsError::ZeroSize));
        assert_eq!(
            fs.upload(&mut port, "f", 5 * SECTOR_SIZE as u32),
            Err(FsError::NoSpace)
        );
        // Nothing was emitted on the wire for any of these.
        assert!(port.tx.is_empty());
    }

    #[test]
    fn exact_sector_multiple_has_no_padding_confusion() {
        let mut fs = fresh_fs(16);
        let payload = pattern(2 * SECTOR_SIZE, 7);
        let mut port = ScriptedPort::new(&payload);

        let crc = fs.upload(&mut port, "even", payload.len() as u32).unwrap();
        assert_eq!(crc, crate::crc16(&payload));
        assert_eq!(port.tx.iter().filter(|&&b| b == b'#').count(), 2);

        let mut buf = vec![0u8; payload.len()];
        assert_eq!(fs.read("even", &mut buf), Ok(payload.len()));
        assert_eq!(buf, payload);
    }
}
