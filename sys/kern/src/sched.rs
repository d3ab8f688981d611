// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The scheduler: task table, current-task plumbing, tick bookkeeping, and
//! the exception dispatcher's portable core.
//!
//! All scheduler state is static. The task table is guarded by an
//! in-use flag so that exactly one `&mut` to it exists at a time; the
//! current task is published both as an index (for portable code) and as a
//! raw pointer (for the context-switch assembly, which stores the saved
//! stack pointer through it at offset 0).

use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use osito_abi::config::{
    INUM_SOFT, INUM_TIMER, INUM_UART, MAX_TASKS, TASK_STACK_SIZE,
};
use osito_abi::{InTask, Priority, TaskId, TaskState};
use osito_ktrace::ktrace_entry;

use crate::arch;
use crate::swtimer;
use crate::task::{
    make_initial_frame, process_sleepers, select, SavedState, Task, TaskEntry,
    TaskSnapshot,
};
use crate::{Trace, KTRACE};

/// Why `task_create` could not deliver a task.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaskError {
    /// Every slot is `Ready`, `Running`, `Blocked`, or `Dead`. Dead slots
    /// are never reclaimed.
    NoFreeSlot,
}

/// Guards the one `&mut` to the task table; see [`with_task_table`].
static TASK_TABLE_IN_USE: AtomicBool = AtomicBool::new(false);

static mut TASK_TABLE: [Task; MAX_TASKS] = [
    Task::free_slot(0),
    Task::free_slot(1),
    Task::free_slot(2),
    Task::free_slot(3),
    Task::free_slot(4),
    Task::free_slot(5),
    Task::free_slot(6),
    Task::free_slot(7),
];

/// Task stacks, statically sized and 16-byte aligned as the frame layout
/// requires.
#[repr(align(16))]
struct StackPool([[u8; TASK_STACK_SIZE]; MAX_TASKS]);

static mut STACKS: StackPool = StackPool([[0; TASK_STACK_SIZE]; MAX_TASKS]);

/// Current task, as a pointer for the exception-entry assembly. The asm
/// stores the interrupted stack pointer through this at offset 0 and
/// reloads from it on the way out.
#[no_mangle]
pub static CURRENT_TASK_PTR: AtomicPtr<Task> = AtomicPtr::new(core::ptr::null_mut());

/// Current task as a table index, for portable code.
static CURRENT_INDEX: AtomicUsize = AtomicUsize::new(0);

/// Where the last round-robin scan stopped.
static LAST_SCHEDULED: AtomicUsize = AtomicUsize::new(0);

/// Monotonic tick counter, advanced by the timer interrupt.
static TICK_COUNT: AtomicU32 = AtomicU32::new(0);

/// Runs `body` with the one live `&mut` to the task table.
///
/// Recursion is detected and panics: a nested call would alias the table.
/// Code that runs inside (semaphore posts from timer callbacks, for
/// example) must be sequenced outside the borrow, which is why the tick
/// path below runs timer callbacks between two separate table borrows.
pub(crate) fn with_task_table<R>(body: impl FnOnce(&mut [Task; MAX_TASKS]) -> R) -> R {
    if TASK_TABLE_IN_USE.swap(true, Ordering::Acquire) {
        panic!(); // recursive use of the task table
    }
    // Safety: the flag above guarantees no other `&mut` exists, and
    // interrupts that touch the table also go through this gate.
    let tasks = unsafe { &mut *core::ptr::addr_of_mut!(TASK_TABLE) };
    let r = body(tasks);
    TASK_TABLE_IN_USE.store(false, Ordering::Release);
    r
}

/// Hands out the stack region for one slot.
fn stack_mut(slot: usize) -> &'static mut [u8] {
    // Safety: each slot's stack is disjoint, and a slot's stack is only
    // touched while its table entry is being created under the critical
    // section in `task_create` (or by the task itself once running).
    unsafe { &mut (*core::ptr::addr_of_mut!(STACKS)).0[slot] }
}

/// Builds the idle task (slot 0) and makes it current.
///
/// The idle task spends its life feeding the watchdog with interrupts
/// enabled; it is always eligible to run and is chosen only when nothing
/// else is ready.
pub fn init() {
    with_task_table(|tasks| {
        for (i, slot) in tasks.iter_mut().enumerate() {
            *slot = Task::free_slot(i as u8);
        }

        let stack = stack_mut(TaskId::IDLE.index());
        let stack_base = stack.as_ptr() as usize;
        let sp = make_initial_frame(
            stack,
            arch::trampoline_address(),
            idle_main as usize as u32,
            0,
        );
        let idle = &mut tasks[TaskId::IDLE.index()];
        idle.save = SavedState { sp };
        idle.state = TaskState::Ready;
        idle.name = "idle";
        idle.stack_base = stack_base;
        idle.stack_size = TASK_STACK_SIZE;

        set_current(TaskId::IDLE.index(), idle);
    });
    LAST_SCHEDULED.store(TaskId::IDLE.index(), Ordering::Relaxed);
    TICK_COUNT.store(0, Ordering::Relaxed);
}

fn idle_main(_token: InTask, _arg: usize) {
    loop {
        arch::feed_watchdog();
        core::hint::spin_loop();
    }
}

/// Claims a free slot (never slot 0), builds the initial frame, and marks
/// the task `Ready`. The priority byte is recorded for introspection only.
pub fn task_create(
    name: &'static str,
    entry: TaskEntry,
    arg: usize,
    priority: u8,
) -> Result<TaskId, TaskError> {
    critical_section::with(|_| {
        with_task_table(|tasks| {
            let slot = (1..MAX_TASKS)
                .find(|&i| tasks[i].state == TaskState::Free)
                .ok_or_else(|| {
                    ktrace_entry!(Trace::TaskTableFull);
                    TaskError::NoFreeSlot
                })?;

            let stack = stack_mut(slot);
            let stack_base = stack.as_ptr() as usize;
            let sp = make_initial_frame(
                stack,
                arch::trampoline_address(),
                entry as usize as u32,
                arg as u32,
            );

            let t = &mut tasks[slot];
            *t = Task::free_slot(slot as u8);
            t.save = SavedState { sp };
            t.state = TaskState::Ready;
            t.priority = Priority(priority);
            t.name = name;
            t.stack_base = stack_base;
            t.stack_size = TASK_STACK_SIZE;

            ktrace_entry!(Trace::TaskCreated(slot as u8));
            Ok(TaskId(slot as u8))
        })
    })
}

/// Voluntarily gives up the CPU by raising the software interrupt. The
/// caller is logically resumed the next time the scheduler picks it.
pub fn yield_now(_token: InTask) {
    arch::raise_soft_interrupt();
}

/// Sleeps the current task until `ticks` ticks from now. A sleeper whose
/// deadline passes at tick T is eligible to run at tick T.
pub fn delay_ticks(token: InTask, ticks: u32) {
    critical_section::with(|_| {
        let idx = CURRENT_INDEX.load(Ordering::Relaxed);
        with_task_table(|tasks| {
            let t = &mut tasks[idx];
            t.wake_tick = TICK_COUNT.load(Ordering::Relaxed).wrapping_add(ticks);
            t.state = TaskState::Blocked;
        });
    });
    yield_now(token);
}

/// Current tick count.
pub fn ticks_now() -> u32 {
    TICK_COUNT.load(Ordering::Relaxed)
}

/// Id of the task the scheduler last dispatched.
pub fn current_task_id() -> TaskId {
    TaskId(CURRENT_INDEX.load(Ordering::Relaxed) as u8)
}

/// Calls `f` with a snapshot of every non-free slot, for `ps`-style
/// listings.
pub fn for_each_task(mut f: impl FnMut(TaskSnapshot)) {
    critical_section::with(|_| {
        with_task_table(|tasks| {
            for t in tasks.iter() {
                if t.state != TaskState::Free {
                    f(TaskSnapshot {
                        id: t.id,
                        name: t.name,
                        state: t.state,
                        priority: t.priority,
                        ticks_run: t.ticks_run,
                    });
                }
            }
        })
    })
}

/// Marks the current task `Dead`. Called from the exit path when an entry
/// function returns; the slot is never reclaimed.
pub(crate) fn mark_current_dead() {
    critical_section::with(|_| {
        let idx = CURRENT_INDEX.load(Ordering::Relaxed);
        with_task_table(|tasks| tasks[idx].state = TaskState::Dead);
        ktrace_entry!(Trace::TaskExited(idx as u8));
    });
}

/// Picks the next task. Runs with interrupts masked, inside the table
/// borrow.
///
/// The running task, if still `Running`, is demoted to `Ready` first; the
/// round-robin scan then starts after the last scheduled slot. Reassigning
/// the current-task pointer is all that "switching" means here -- the
/// register swap is a consequence of the exception return path reloading
/// through that pointer.
pub(crate) fn schedule(tasks: &mut [Task; MAX_TASKS]) {
    let cur = CURRENT_INDEX.load(Ordering::Relaxed);
    if tasks[cur].state == TaskState::Running {
        tasks[cur].state = TaskState::Ready;
    }

    let next = select(LAST_SCHEDULED.load(Ordering::Relaxed), tasks);
    LAST_SCHEDULED.store(next, Ordering::Relaxed);
    tasks[next].state = TaskState::Running;
    set_current(next, &mut tasks[next]);
}

fn set_current(index: usize, task: &mut Task) {
    CURRENT_INDEX.store(index, Ordering::Relaxed);
    CURRENT_TASK_PTR.store(task as *mut Task, Ordering::Relaxed);
}

/// Portable core of the level-1 exception dispatcher.
///
/// Called with interrupts masked, on the ISR stack, with `pending` holding
/// the pending-source bits. Timer: advance time, charge the interrupted
/// task, wake sleepers, run software timers, reschedule. Soft interrupt:
/// reschedule (that's what yield is). UART: drain the FIFO; no reschedule
/// for UART alone. Edge and software sources are cleared via the
/// interrupt-clear register; the UART's level source is cleared at the
/// peripheral by its own handler.
pub fn handle_exception(pending: u32) {
    let mut resched = false;

    if pending & (1 << INUM_TIMER) != 0 {
        arch::ack_timer();
        let now = TICK_COUNT.load(Ordering::Relaxed).wrapping_add(1);
        TICK_COUNT.store(now, Ordering::Relaxed);

        with_task_table(|tasks| {
            tasks[CURRENT_INDEX.load(Ordering::Relaxed)].ticks_run += 1;
            process_sleepers(tasks, now);
        });

        // Timer callbacks run outside the table borrow so they may post
        // semaphores; they still run with interrupts masked and must not
        // block.
        swtimer::tick(now);

        resched = true;
    }

    if pending & (1 << INUM_SOFT) != 0 {
        resched = true;
    }

    if pending & (1 << INUM_UART) != 0 {
        drv_lx106_uart::handle_irq();
    }

    if resched {
        with_task_table(schedule);
    }

    arch::clear_interrupts(pending & ((1 << INUM_TIMER) | (1 << INUM_SOFT)));
}

/// Marks the idle task running and jumps into the context-restore path.
/// Never returns; from here on the machine belongs to the tasks.
#[cfg(target_os = "none")]
pub fn start() -> ! {
    with_task_table(|tasks| {
        let idle = &mut tasks[TaskId::IDLE.index()];
        idle.state = TaskState::Running;
        set_current(TaskId::IDLE.index(), idle);
    });
    ktrace_entry!(Trace::KernelStarted);
    arch::start_first_task()
}

/// Reinitializes every piece of scheduler state. Hosted tests only; see
/// `testsup`.
#[cfg(not(target_os = "none"))]
pub(crate) fn reset_for_test() {
    // A failed test may have unwound out of `with_task_table`; clear the
    // gate so the next test doesn't inherit the poisoned flag.
    TASK_TABLE_IN_USE.store(false, Ordering::Relaxed);
    init();
    // Emulate `start()`: the idle task is running when the first test
    // event arrives.
    with_task_table(|tasks| {
        tasks[TaskId::IDLE.index()].state = TaskState::Running;
    });
}
