// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! LX106 (Xtensa, CALL0 ABI) backend.
//!
//! # Exception model
//!
//! Every level-1 exception -- the tick timer, the UART, and the software
//! interrupt used for yield -- funnels through one entry point,
//! `_osito_user_exc`, which the linker script installs at the user
//! exception vector. The entry sequence:
//!
//! 1. pushes the 80-byte context frame onto the *interrupted task's*
//!    stack (A0–A15, PS, SAR, EPC1, pad -- the layout in
//!    `osito_abi::frame`);
//! 2. stores the resulting stack pointer through `CURRENT_TASK_PTR` at
//!    offset 0 -- the one field the assembly knows about a TCB;
//! 3. switches to the dedicated ISR stack and calls
//!    [`osito_exception_entry`];
//! 4. falls through into `_osito_restore_and_rfe`, which reloads the
//!    frame from whatever TCB `CURRENT_TASK_PTR` *now* names and returns
//!    with `rfe`.
//!
//! Step 4 is the whole context switch: `schedule()` only reassigns the
//! pointer, and the return path does the rest. The same restore code is
//! the kernel's entry into the very first task.
//!
//! A non-interrupt exception cause (illegal instruction, load/store
//! error) is recorded in the kernel trace ring and otherwise ignored; the
//! `rfe` resumes the faulting instruction. Production firmware would want
//! to kill the task instead.

use core::arch::{asm, global_asm};

use osito_abi::config::{
    CPU_FREQ_HZ, INUM_SOFT, INUM_TIMER, INUM_UART, ISR_STACK_SIZE, TICK_HZ,
    TIMER_LOAD, TIMER_PRESCALER,
};
use osito_abi::InTask;
use osito_ktrace::ktrace_entry;

use crate::task::TaskEntry;
use crate::{Trace, KTRACE};

/// EXCCAUSE value for a level-1 interrupt; everything else is a CPU
/// exception.
const EXCCAUSE_LEVEL1_INTERRUPT: u32 = 4;

/// FRC1 timer block.
const FRC1_LOAD: usize = 0x6000_0600;
const FRC1_CTRL: usize = 0x6000_0608;
const FRC1_INT: usize = 0x6000_060C;

/// FRC1_CTRL: /16 prescale, edge interrupt, auto-reload, enable.
const FRC1_CTRL_DIV16: u32 = 1 << 2;
const FRC1_CTRL_AUTOLOAD: u32 = 1 << 6;
const FRC1_CTRL_ENABLE: u32 = 1 << 7;

/// Edge-interrupt routing for FRC1.
const DPORT_EDGE_INT_ENABLE: usize = 0x3FF0_0004;
const DPORT_EDGE_INT_TIMER1: u32 = 1 << 1;

/// Hardware watchdog feed register.
const WDT_FEED: usize = 0x6000_0914;
const WDT_FEED_MAGIC: u32 = 0x73;

fn write_reg(addr: usize, value: u32) {
    // Safety: `addr` is one of the memory-mapped registers named above.
    unsafe { (addr as *mut u32).write_volatile(value) }
}

/// Stack for the exception dispatcher, so ISRs don't eat into task
/// stacks. Referenced by name from the entry assembly.
#[repr(align(16))]
struct IsrStack([u8; ISR_STACK_SIZE]);

#[no_mangle]
static mut OSITO_ISR_STACK: IsrStack = IsrStack([0; ISR_STACK_SIZE]);

pub fn trampoline_address() -> u32 {
    // Defined in the global_asm below.
    extern "C" {
        fn _osito_task_trampoline();
    }
    _osito_task_trampoline as usize as u32
}

/// Triggers the software-yield interrupt source. The exception fires as
/// soon as interrupts are unmasked.
pub fn raise_soft_interrupt() {
    let bit: u32 = 1 << INUM_SOFT;
    // Safety: setting a software interrupt bit has no memory effects.
    unsafe {
        asm!("wsr.intset {0}", in(reg) bit);
    }
}

/// Clears latched edge/software interrupt sources.
pub fn clear_interrupts(mask: u32) {
    // Safety: as in `raise_soft_interrupt`.
    unsafe {
        asm!("wsr.intclear {0}", in(reg) mask);
    }
}

/// Acknowledges the FRC1 edge interrupt at the timer.
pub fn ack_timer() {
    write_reg(FRC1_INT, 1);
}

pub fn feed_watchdog() {
    write_reg(WDT_FEED, WDT_FEED_MAGIC);
}

/// Programs FRC1 for the periodic tick and unmasks the three interrupt
/// sources the dispatcher serves.
pub fn timer_init() {
    // Keep the constant arithmetic honest at compile time.
    const _: () = assert!(TIMER_LOAD == CPU_FREQ_HZ / TIMER_PRESCALER / TICK_HZ);

    write_reg(FRC1_CTRL, 0);
    write_reg(FRC1_LOAD, TIMER_LOAD);
    write_reg(FRC1_INT, 1);

    // Safety: read-modify-write of the DPORT edge-enable register; no
    // memory effects beyond the peripheral.
    unsafe {
        let cur = (DPORT_EDGE_INT_ENABLE as *mut u32).read_volatile();
        (DPORT_EDGE_INT_ENABLE as *mut u32)
            .write_volatile(cur | DPORT_EDGE_INT_TIMER1);
    }

    write_reg(
        FRC1_CTRL,
        FRC1_CTRL_DIV16 | FRC1_CTRL_AUTOLOAD | FRC1_CTRL_ENABLE,
    );

    let mask: u32 = (1 << INUM_TIMER) | (1 << INUM_UART) | (1 << INUM_SOFT);
    // Safety: enabling interrupt sources the dispatcher handles.
    unsafe {
        asm!(
            "rsr.intenable {tmp}",
            "or {tmp}, {tmp}, {mask}",
            "wsr.intenable {tmp}",
            tmp = out(reg) _,
            mask = in(reg) mask,
        );
    }
}

/// Jumps into the restore path for the current task. Never returns.
pub fn start_first_task() -> ! {
    // Safety: the current-task pointer names a TCB whose saved stack
    // pointer addresses a fully formed context frame; the restore path
    // consumes it and leaves kernel code behind for good.
    unsafe {
        asm!("j _osito_restore_and_rfe", options(noreturn));
    }
}

/// C-level exception dispatcher, called from the entry assembly on the
/// ISR stack with interrupts masked.
#[no_mangle]
extern "C" fn osito_exception_entry() {
    let exccause: u32;
    // Safety: special-register read only.
    unsafe {
        asm!("rsr.exccause {0}", out(reg) exccause);
    }

    if exccause != EXCCAUSE_LEVEL1_INTERRUPT {
        // A CPU exception. Record it and resume the faulting instruction;
        // see the module docs for why this is (knowingly) lenient.
        ktrace_entry!(Trace::UnhandledException(exccause));
        return;
    }

    let pending: u32;
    // Safety: special-register read only.
    unsafe {
        asm!("rsr.interrupt {0}", out(reg) pending);
    }

    crate::sched::handle_exception(pending);
}

/// First code a fresh task executes, via the trampoline: mint the task's
/// context token, call the entry function, and route the fall-through
/// into the terminal handler.
#[no_mangle]
extern "C" fn task_entry_shim(entry: u32, arg: u32) -> ! {
    // Safety: this is the opening of a task's own stack and lifetime;
    // definitionally task context.
    let token = unsafe { InTask::assume_task_context() };
    // Safety: `task_create` stashed a `TaskEntry` here; nothing else
    // writes the A2 slot of an initial frame.
    let entry: TaskEntry = unsafe { core::mem::transmute(entry as usize) };
    entry(token, arg as usize);

    // The entry function returned: this task is done forever.
    crate::sched::mark_current_dead();
    loop {
        // Safety: waiting for an interrupt is side-effect free; the
        // scheduler will never pick a Dead task again.
        unsafe {
            asm!("waiti 0");
        }
    }
}

// Exception entry, context restore, and the task trampoline. The frame
// offsets must match `osito_abi::frame` exactly; both sides are pinned by
// tests against those constants.
global_asm! {"
    .section .text._osito_user_exc
    .literal_position
    .globl _osito_user_exc
    .type _osito_user_exc,@function
    .align 4
_osito_user_exc:
    /* Push the context frame onto the interrupted task's stack. */
    addi    a1, a1, -80
    s32i    a0, a1, 0x00
    s32i    a2, a1, 0x08
    s32i    a3, a1, 0x0c
    s32i    a4, a1, 0x10
    s32i    a5, a1, 0x14
    s32i    a6, a1, 0x18
    s32i    a7, a1, 0x1c
    s32i    a8, a1, 0x20
    s32i    a9, a1, 0x24
    s32i    a10, a1, 0x28
    s32i    a11, a1, 0x2c
    s32i    a12, a1, 0x30
    s32i    a13, a1, 0x34
    s32i    a14, a1, 0x38
    s32i    a15, a1, 0x3c
    /* A1 as it will be once the frame is popped. */
    addi    a2, a1, 80
    s32i    a2, a1, 0x04
    rsr.ps  a2
    s32i    a2, a1, 0x40
    rsr.sar a2
    s32i    a2, a1, 0x44
    rsr.epc1 a2
    s32i    a2, a1, 0x48

    /* Publish the stack pointer at offset 0 of the current TCB. */
    movi    a2, CURRENT_TASK_PTR
    l32i    a2, a2, 0
    s32i    a1, a2, 0

    /* Dispatch on the ISR stack. */
    movi    a1, OSITO_ISR_STACK + {isr_stack_size}
    call0   osito_exception_entry

    /* Fall through: return into whichever task is now current. */
    .globl _osito_restore_and_rfe
    .type _osito_restore_and_rfe,@function
_osito_restore_and_rfe:
    movi    a2, CURRENT_TASK_PTR
    l32i    a2, a2, 0
    l32i    a1, a2, 0
    l32i    a2, a1, 0x40
    wsr.ps  a2
    rsync
    l32i    a2, a1, 0x44
    wsr.sar a2
    l32i    a2, a1, 0x48
    wsr.epc1 a2
    l32i    a0, a1, 0x00
    l32i    a2, a1, 0x08
    l32i    a3, a1, 0x0c
    l32i    a4, a1, 0x10
    l32i    a5, a1, 0x14
    l32i    a6, a1, 0x18
    l32i    a7, a1, 0x1c
    l32i    a8, a1, 0x20
    l32i    a9, a1, 0x24
    l32i    a10, a1, 0x28
    l32i    a11, a1, 0x2c
    l32i    a12, a1, 0x30
    l32i    a13, a1, 0x34
    l32i    a14, a1, 0x38
    l32i    a15, a1, 0x3c
    /* The stack pointer itself comes last. */
    l32i    a1, a1, 0x04
    rfe

    /* First entry into a new task: EPC1 of a synthesized frame points
       here, with the entry function in a2 and its argument in a3 --
       already the CALL0 argument registers for the shim. */
    .globl _osito_task_trampoline
    .type _osito_task_trampoline,@function
    .align 4
_osito_task_trampoline:
    call0   task_entry_shim
1:  j       1b
",
    isr_stack_size = const ISR_STACK_SIZE,
}

// The universal short-section lock: masking level-1 interrupts via RSIL,
// with the previous PS carried in the restore state.
struct Lx106CriticalSection;
critical_section::set_impl!(Lx106CriticalSection);

// Safety: rsil masks every source that could preempt on this single-core
// part, and release restores the exact PS it displaced.
unsafe impl critical_section::Impl for Lx106CriticalSection {
    unsafe fn acquire() -> critical_section::RawRestoreState {
        let ps: u32;
        // Safety: raising the interrupt level has no memory effects.
        unsafe {
            asm!("rsil {0}, 3", out(reg) ps);
        }
        ps
    }

    unsafe fn release(ps: critical_section::RawRestoreState) {
        // Safety: writing back the PS captured by acquire.
        unsafe {
            asm!("wsr.ps {0}", "rsync", in(reg) ps);
        }
    }
}
