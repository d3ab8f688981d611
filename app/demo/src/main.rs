// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Demo image: boots the kernel and runs a handful of tasks that
//! exercise every kernel surface -- a console task that owns the
//! filesystem (boot counter, listing, echo, upload reception), a
//! ping/pong pair over message queues, and a periodic heartbeat.
//!
//! On the host this builds as a stub; the hosted test suites of the
//! individual crates are where the logic runs off-target.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod image {
    use drv_lx106_uart as uart;
    use osito_abi::config::TICK_HZ;
    use osito_abi::InTask;
    use osito_kern::mq::MessageQueue;
    use osito_kern::sem::Mutex;
    use osito_kern::{sched, startup};

    mod fsio;

    /// Serializes console output between tasks. Held briefly around each
    /// burst of bytes; never across a blocking call.
    static CONSOLE: Mutex = Mutex::new();

    static mut PING_BUF: [u8; 4] = [0; 4];
    static mut PONG_BUF: [u8; 4] = [0; 4];

    /// Entry from the boot shim, on the boot stack, interrupts off.
    #[no_mangle]
    pub extern "C" fn osito_main() -> ! {
        startup::init_runtime();

        uart::puts("\nOsitoK ");
        uart::puts(osito_abi::VERSION_STRING);
        uart::puts("\n");

        sched::task_create("console", console_task, 0, 1)
            .unwrap_or_else(|_| panic!());
        sched::task_create("heartbeat", heartbeat_task, 0, 1)
            .unwrap_or_else(|_| panic!());
        spawn_ping_pong();

        startup::start()
    }

    /// The console task owns the filesystem: every `fsio::with_fs*` call
    /// in this image happens on this task, which is what serialises the
    /// shared sector buffer. On startup it brings the store up and bumps
    /// the boot counter; after that it echoes input, with an ENQ byte
    /// (0x05) switching into upload reception instead of echo.
    fn console_task(token: InTask, _arg: usize) {
        storage_bringup(token);
        loop {
            match uart::getc() {
                Some(0x05) => receive_upload(token),
                Some(byte) => {
                    CONSOLE.lock(token);
                    uart::putc(byte);
                    CONSOLE.unlock();
                }
                None => sched::yield_now(token),
            }
        }
    }

    /// Mounts (formatting a blank part), bumps the boot counter, and
    /// prints the file listing.
    fn storage_bringup(token: InTask) {
        fsio::with_fs(|fs| {
            if fs.mount().is_err() {
                let _ = fs.format();
            }

            let mut buf = [0u8; 4];
            let boots = match fs.read("boot.cnt", &mut buf) {
                Ok(4) => u32::from_le_bytes(buf),
                _ => 0,
            };
            let _ = fs.overwrite("boot.cnt", &(boots + 1).to_le_bytes());
        });

        CONSOLE.lock(token);
        let mut console = fsio::Console;
        fsio::with_fs(|fs| {
            let _ = fs.list(&mut console);
        });
        CONSOLE.unlock();
    }

    /// Raw upload entry: four little-endian size bytes follow the ENQ,
    /// then the framed transfer lands in `upload.bin`.
    fn receive_upload(token: InTask) {
        use osito_fs::UartPort as _;

        let mut port = fsio::ConsolePort { token };
        let mut size = [0u8; 4];
        for slot in &mut size {
            *slot = loop {
                if let Some(b) = port.try_read() {
                    break b;
                }
                sched::yield_now(token);
            };
        }
        let total = u32::from_le_bytes(size);
        let _ = fsio::with_fs_for_upload(token, |fs| {
            fs.upload(&mut port, "upload.bin", total)
        });
    }

    /// Prints one dot a second, forever; also demonstrates sleep.
    fn heartbeat_task(token: InTask, _arg: usize) {
        loop {
            sched::delay_ticks(token, TICK_HZ);
            CONSOLE.lock(token);
            uart::putc(b'.');
            CONSOLE.unlock();
        }
    }

    fn spawn_ping_pong() {
        // One-deep queues are all a strict request/reply pair needs.
        // Safety: these statics are handed out exactly once, here.
        let (ping_buf, pong_buf) = unsafe {
            (
                &mut *core::ptr::addr_of_mut!(PING_BUF),
                &mut *core::ptr::addr_of_mut!(PONG_BUF),
            )
        };
        // Safety: written once, here, before the scheduler starts.
        let queues = unsafe { &mut *core::ptr::addr_of_mut!(QUEUES) };
        *queues = Some((
            MessageQueue::new(ping_buf, 4, 1),
            MessageQueue::new(pong_buf, 4, 1),
        ));
        sched::task_create("ping", ping_task, 0, 2).unwrap_or_else(|_| panic!());
        sched::task_create("pong", pong_task, 0, 2).unwrap_or_else(|_| panic!());
    }

    fn queues() -> &'static (MessageQueue<'static>, MessageQueue<'static>) {
        // Safety: initialized in `spawn_ping_pong` before any task runs.
        unsafe {
            (*core::ptr::addr_of!(QUEUES)).as_ref().unwrap_or_else(|| panic!())
        }
    }

    static mut QUEUES: Option<(MessageQueue<'static>, MessageQueue<'static>)> = None;

    fn ping_task(token: InTask, _arg: usize) {
        let (q, r) = queues();
        let mut n: u32 = 0;
        let mut reply = [0u8; 4];
        loop {
            q.send(token, &n.to_le_bytes());
            r.recv(token, &mut reply);
            n = u32::from_le_bytes(reply);
            sched::delay_ticks(token, TICK_HZ / 10);
        }
    }

    fn pong_task(token: InTask, _arg: usize) {
        let (q, r) = queues();
        let mut msg = [0u8; 4];
        loop {
            q.recv(token, &mut msg);
            let n = u32::from_le_bytes(msg);
            r.send(token, &(n + 1).to_le_bytes());
        }
    }

    #[panic_handler]
    fn panic(_info: &core::panic::PanicInfo<'_>) -> ! {
        uart::puts("\nkernel panic\n");
        loop {
            core::hint::spin_loop();
        }
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("osito-demo is a firmware image; build it for the LX106 target.");
    eprintln!("The hosted test suite lives in the library crates (cargo test).");
}
