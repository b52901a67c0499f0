//! The scheduler itself (spec 4.D): a single global run queue, a sleepers
//! set, and the operations that move tasks between ready/running/blocked/
//! dead.

extern crate alloc;

use alloc::collections::BTreeMap;

use spin::Mutex;

use super::queue::{ReadyQueues, SleepQueue};
use super::smp;
use super::task::{BlockReason, PriorityClass, Task, TaskId, TaskState};
use crate::arch::ArchThreadContext;
use crate::error::{KernelError, KernelResult, SchedError};
use crate::sync::once_lock::GlobalState;

struct SchedulerState {
    tasks: BTreeMap<TaskId, Task>,
    ready: ReadyQueues,
    sleepers: SleepQueue,
    current: Option<TaskId>,
}

impl SchedulerState {
    fn new() -> Self {
        Self {
            tasks: BTreeMap::new(),
            ready: ReadyQueues::new(),
            sleepers: SleepQueue::new(),
            current: None,
        }
    }
}

static SCHEDULER: GlobalState<Mutex<SchedulerState>> = GlobalState::new();

/// Bring up the scheduler: the bootstrap flow itself becomes the idle task,
/// current from the start but never explicitly switched into. Must run
/// after [`crate::mm::init`]: `spawn` builds each task's kernel stack
/// through the VASM.
pub fn init() {
    SCHEDULER
        .init(Mutex::new(SchedulerState::new()))
        .unwrap_or_else(|_| panic!("scheduler: init called twice"));

    let idle = Task::spawn_kernel(idle_loop, PriorityClass::Idle, "idle")
        .expect("failed to build idle task");
    let id = idle.id;
    with_state(|s| {
        s.tasks.insert(id, idle);
        s.current = Some(id);
    });
    log::info!("sched: scheduler initialized, idle task is {}", id);
}

extern "C" fn idle_loop() -> ! {
    loop {
        crate::arch::idle();
    }
}

fn with_state<R>(f: impl FnOnce(&mut SchedulerState) -> R) -> R {
    SCHEDULER
        .with_mut(|mtx| f(&mut mtx.lock()))
        .expect("scheduler used before init")
}

/// Create a new task, entry running with interrupts disabled on a fresh
/// kernel stack, and place it at the tail of its priority class's ring.
pub fn spawn(
    entry: extern "C" fn() -> !,
    priority: PriorityClass,
    name: &str,
) -> KernelResult<TaskId> {
    let task = Task::spawn_kernel(entry, priority, name)?;
    let id = task.id;
    with_state(|s| {
        s.tasks.insert(id, task);
        s.ready.push_tail(priority, id);
    });
    log::debug!("sched: spawned {} ({:?}, {})", id, priority, name);
    Ok(id)
}

/// Voluntarily give up the CPU. `context_switch` re-enqueues the caller at
/// the tail of its own priority class once a different task is actually
/// picked; if nothing else is ready it simply keeps running.
pub fn yield_now() {
    reschedule();
}

/// Move `task` to the blocked set with the given reason bits. See spec 4.D
/// for the `AwaitTimestamp | AwaitMessage` short-circuit.
pub fn block(
    task: TaskId,
    reasons: BlockReason,
    wake_ms: Option<u64>,
    service: Option<u64>,
) -> KernelResult<()> {
    let is_current = with_state(|s| -> KernelResult<bool> {
        let t = s
            .tasks
            .get_mut(&task)
            .ok_or(KernelError::TaskNotFound { id: task.as_u64() })?;
        t.block(reasons, wake_ms, service);
        s.ready.remove(task);
        if reasons.contains(BlockReason::AWAIT_TIMESTAMP) {
            if let Some(wake) = wake_ms {
                s.sleepers.insert(task, wake);
            }
        }
        Ok(s.current == Some(task))
    })?;
    if is_current {
        reschedule();
    }
    Ok(())
}

/// Block `task` on a specific IRQ line (spec's driver-facing interrupt
/// protocol). Like [`block`], but routes through [`Task::block_on_interrupt`]
/// so the line number is recorded for [`crate::irq::dispatch`] to match
/// against.
pub fn block_on_interrupt(task: TaskId, irq: u8) -> KernelResult<()> {
    let is_current = with_state(|s| -> KernelResult<bool> {
        let t = s
            .tasks
            .get_mut(&task)
            .ok_or(KernelError::TaskNotFound { id: task.as_u64() })?;
        t.block_on_interrupt(irq);
        s.ready.remove(task);
        Ok(s.current == Some(task))
    })?;
    if is_current {
        reschedule();
    }
    Ok(())
}

/// Clear `reason` on `task`; if that fully unblocks it, put it back on the
/// tail of its priority ring.
pub fn unblock(task: TaskId, reason: BlockReason) -> KernelResult<()> {
    with_state(|s| {
        let t = s
            .tasks
            .get_mut(&task)
            .ok_or(KernelError::TaskNotFound { id: task.as_u64() })?;
        if t.state != TaskState::Blocked {
            return Err(KernelError::Sched(SchedError::NotBlocked { id: task.as_u64() }));
        }
        let fully_woken = t.unblock(reason);
        if fully_woken {
            s.sleepers.remove(task);
            let priority = t.priority;
            s.ready.push_tail(priority, task);
        }
        Ok(())
    })
}

/// Called from the timer IRQ. Wakes any sleeper whose `wake_ms` has
/// arrived (earliest wake, then earliest insertion, per spec ordering),
/// then runs the normal preemption decision.
pub fn tick(current_ms: u64) {
    let due = with_state(|s| s.sleepers.drain_due(current_ms));
    for id in due {
        // A woken sleeper always had AWAIT_TIMESTAMP set; unblock() checks
        // the task's own bits to decide whether it is now fully ready.
        let _ = unblock(id, BlockReason::AWAIT_TIMESTAMP);
    }
    reschedule();
}

/// Tear down the current task. Never returns: a reschedule always follows.
pub fn die(_code: i32) -> ! {
    let (task, owned_service) = with_state(|s| {
        let id = s.current.take().expect("die() called with no current task");
        let task = s.tasks.remove(&id).expect("current task missing from table");
        let owned_service = task.owned_service;
        (task, owned_service)
    });
    if let Some(service) = owned_service {
        crate::ipc::registry::service_died(service);
    }
    task.destroy().expect("task teardown failed");
    reschedule();
    unreachable!("reschedule() never returns from die()");
}

/// Id of the task currently running on this CPU, if any.
pub fn current_task_id() -> Option<TaskId> {
    with_state(|s| s.current)
}

/// Run `f` against the live task control block for `id`, if it still
/// exists. Used by the AMC registry to read/write a task's address space
/// and `owned_service` without the registry needing its own lock on the
/// task table.
pub fn with_task<R>(id: TaskId, f: impl FnOnce(&mut Task) -> R) -> Option<R> {
    with_state(|s| s.tasks.get_mut(&id).map(f))
}

/// Like [`with_task`] but for two tasks at once, taken under a single lock
/// acquisition. Used by the AMC registry for shared-memory setup/teardown,
/// which must touch both peers' address spaces together. Returns `None` if
/// either id is missing, or if `a == b` (no caller needs that case, and a
/// map can't hand out two distinct mutable borrows of one entry).
pub fn with_two_tasks<R>(a: TaskId, b: TaskId, f: impl FnOnce(&mut Task, &mut Task) -> R) -> Option<R> {
    if a == b {
        return None;
    }
    with_state(|s| {
        let pa = s.tasks.get_mut(&a)? as *mut Task;
        let pb = s.tasks.get_mut(&b)? as *mut Task;
        // SAFETY: `a != b` so `pa` and `pb` name distinct `BTreeMap` entries;
        // both pointers stay valid for the closure's duration since `s` (and
        // the lock guarding it) is held for the whole call.
        unsafe { Some(f(&mut *pa, &mut *pb)) }
    })
}

/// Called from the timer IRQ. Reads the current uptime off the PIT tick
/// counter itself so the arch-specific handler doesn't need to thread it
/// through.
pub fn timer_tick() {
    tick(crate::arch::x86_64::timer::uptime_ms());
}

/// Pick the next ready task, if any, and switch to it. Called whenever the
/// current task stops being runnable: on yield, block, tick-driven
/// preemption, and die. A reschedule with nothing ready and a live current
/// task is a no-op; with no current task it must find something (even if
/// only the idle task, which is never put back on a ready ring and so is
/// always available as a last resort... except it already IS current in
/// that case, which is why die() always leaves at least the idle task
/// alive in the task table).
fn reschedule() {
    let Some(next) = with_state(|s| s.ready.pop_highest()) else {
        return;
    };
    context_switch(next);
}

/// Save the current task's registers (if any), install the new task's
/// kernel stack in the TSS, and load the new task's registers. Runs with
/// interrupts disabled.
fn context_switch(next: TaskId) {
    let (previous, next_ctx_ptr, prev_ctx_ptr, kernel_stack_top) = with_state(|s| {
        let previous = s.current.replace(next);

        if let Some(prev) = previous {
            if prev != next {
                if let Some(prev_task) = s.tasks.get_mut(&prev) {
                    // Only a task that was still running gets re-enqueued:
                    // block()/block_on_interrupt() already moved it to
                    // Blocked (and off `s.ready`) before reschedule() ever
                    // ran, and die() clears `s.current` entirely, so neither
                    // reaches this branch.
                    if prev_task.state == TaskState::Running {
                        prev_task.state = TaskState::Ready;
                        s.ready.push_tail(prev_task.priority, prev);
                    }
                }
            }
        }

        let kernel_stack_top = {
            let next_task = s.tasks.get_mut(&next).expect("scheduled task missing");
            next_task.state = TaskState::Running;
            next_task.kernel_stack_top()
        };

        let next_ctx_ptr = &s.tasks.get(&next).unwrap().context as *const ArchThreadContext;
        let prev_ctx_ptr = match previous {
            Some(prev) if prev != next => s
                .tasks
                .get_mut(&prev)
                .map(|t| &mut t.context as *mut ArchThreadContext),
            _ => None,
        };

        (previous, next_ctx_ptr, prev_ctx_ptr, kernel_stack_top)
    });

    smp::set_kernel_stack(kernel_stack_top);

    match (previous, prev_ctx_ptr) {
        (Some(prev), Some(prev_ctx_ptr)) if prev != next => {
            // SAFETY: both pointers reference tasks live in the scheduler's
            // table; interrupts are disabled by every call site that can
            // reach `context_switch` (yield/block/tick/die all run with
            // interrupts off on this single CPU).
            unsafe {
                crate::arch::context::switch_context(&mut *prev_ctx_ptr, &*next_ctx_ptr);
            }
        }
        (None, _) => {
            // Nothing to save: the previous occupant of `current` is gone
            // (died). Jump straight into the new task; it never returns
            // here, which is fine, there is nothing left to do.
            unsafe {
                crate::arch::x86_64::context::load_context(next_ctx_ptr);
            }
        }
        _ => {
            // Same task was already current (e.g. the only ready task
            // yielded to itself); nothing to switch.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unblock_unknown_task_is_an_error() {
        with_state(|s| *s = SchedulerState::new());
        let bogus = TaskId::from_raw_for_test(999_999);
        assert!(unblock(bogus, BlockReason::AWAIT_MESSAGE).is_err());
    }
}
