//! Task control block and the pieces it is built from (spec 4.D / 3).

extern crate alloc;

use alloc::string::String;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use crate::arch::ArchThreadContext;
use crate::error::{KernelError, KernelResult};
use crate::mm::{AddressSpace, PageFlags};

/// Number of pages given to a fresh kernel stack. Small by hobbyist-OS
/// standards; tasks that need more must be rewritten, not given more stack.
pub const KERNEL_STACK_PAGES: usize = 4;
pub const KERNEL_STACK_SIZE: usize = KERNEL_STACK_PAGES * crate::mm::FRAME_SIZE;

/// Virtual hint for where kernel stacks live; VASM finds the next free run
/// at or above this address on every call, so a fixed hint is enough.
const KERNEL_STACK_REGION_HINT: u64 = 0xFFFF_FF80_0000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    pub fn as_u64(self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub fn from_raw_for_test(n: u64) -> Self {
        Self(n)
    }

    /// Reconstruct a `TaskId` from the raw value stored in
    /// [`Task::owned_service`] / [`BlockedInfo::service`], both of which
    /// carry a task id as an opaque `u64` handle.
    pub fn from_raw(n: u64) -> Self {
        Self(n)
    }
}

impl core::fmt::Display for TaskId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

fn next_task_id() -> TaskId {
    TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
}

/// A task's priority class. Within a class tasks form a FIFO ring; higher
/// classes are always drained first.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityClass {
    Idle = 0,
    Normal = 1,
    Driver = 2,
    Kernel = 3,
}

impl PriorityClass {
    pub const COUNT: usize = 4;
    /// Scan order for picking the next task to run: highest class first.
    pub const HIGHEST_FIRST: [PriorityClass; 4] = [
        PriorityClass::Kernel,
        PriorityClass::Driver,
        PriorityClass::Normal,
        PriorityClass::Idle,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Blocked,
    Dead,
}

bitflags! {
    /// Reasons a task may be blocked. A task may carry more than one bit at
    /// once; it wakes only when all active reasons clear, except the
    /// `AWAIT_TIMESTAMP | AWAIT_MESSAGE` combination, where either suffices.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlockReason: u8 {
        const AWAIT_MESSAGE   = 1 << 0;
        const AWAIT_TIMESTAMP = 1 << 1;
        const AWAIT_INTERRUPT = 1 << 2;
    }
}

/// Why, and until when, a blocked task is waiting. `service` is an opaque
/// handle interpreted by the AMC layer (the awaited service, if any); the
/// scheduler never looks inside it.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockedInfo {
    pub reasons: BlockReason,
    pub wake_timestamp_ms: Option<u64>,
    pub awaited_interrupt: Option<u8>,
    pub service: Option<u64>,
}

impl BlockedInfo {
    fn is_message_or_timestamp_race(&self) -> bool {
        self.reasons == BlockReason::AWAIT_MESSAGE | BlockReason::AWAIT_TIMESTAMP
    }

    /// Clear `reason`. Returns true if the task is now fully unblocked,
    /// honoring the message/timestamp short-circuit.
    pub fn clear_reason(&mut self, reason: BlockReason) -> bool {
        if self.is_message_or_timestamp_race()
            && (reason.contains(BlockReason::AWAIT_MESSAGE)
                || reason.contains(BlockReason::AWAIT_TIMESTAMP))
        {
            self.reasons = BlockReason::empty();
            return true;
        }
        self.reasons.remove(reason);
        self.reasons.is_empty()
    }
}

/// Which CPUs a task is allowed to run on. This core only schedules
/// correctly for a single bootstrap CPU (spec 9, open question), but the
/// mask is carried so APs have something to consult.
#[derive(Debug, Clone, Copy)]
pub struct CpuAffinity(u64);

impl CpuAffinity {
    pub fn all() -> Self {
        Self(!0)
    }

    pub fn single(cpu: u32) -> Self {
        Self(1 << cpu)
    }

    pub fn contains(&self, cpu: u32) -> bool {
        self.0 & (1 << cpu) != 0
    }
}

/// A resolved (addr, name) pair used to symbolicate a crash backtrace.
#[derive(Debug, Clone)]
pub struct SymbolEntry {
    pub addr: u64,
    pub name: String,
}

/// A snapshot of a task's symbol table, sorted by address so a return
/// address can be resolved to "nearest symbol at or below it".
#[derive(Debug, Clone, Default)]
pub struct SymbolSnapshot {
    entries: alloc::vec::Vec<SymbolEntry>,
}

impl SymbolSnapshot {
    pub fn new(mut entries: alloc::vec::Vec<SymbolEntry>) -> Self {
        entries.sort_by_key(|e| e.addr);
        Self { entries }
    }

    pub fn resolve(&self, addr: u64) -> Option<&str> {
        let idx = self.entries.partition_point(|e| e.addr <= addr);
        if idx == 0 {
            None
        } else {
            Some(self.entries[idx - 1].name.as_str())
        }
    }
}

/// A portable snapshot of a task's saved machine state, used anywhere that
/// needs to read registers without depending on the arch-specific layout
/// (the crash/assert core, in particular). The context-switch primitive
/// itself still works on the concrete [`ArchThreadContext`].
#[derive(Debug, Clone)]
pub enum TaskContext {
    X86_64(crate::arch::x86_64::context::X86_64Context),
}

impl TaskContext {
    pub fn instruction_pointer(&self) -> u64 {
        match self {
            TaskContext::X86_64(c) => c.rip,
        }
    }

    pub fn stack_pointer(&self) -> u64 {
        match self {
            TaskContext::X86_64(c) => c.rsp,
        }
    }

    pub fn frame_pointer(&self) -> u64 {
        match self {
            TaskContext::X86_64(c) => c.rbp,
        }
    }
}

/// A schedulable activity (spec 3, "Task").
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub priority: PriorityClass,
    pub state: TaskState,
    pub kernel_stack_base: u64,
    pub kernel_stack_size: usize,
    pub context: ArchThreadContext,
    pub address_space: AddressSpace,
    pub blocked: Option<BlockedInfo>,
    pub symbols: SymbolSnapshot,
    pub affinity: CpuAffinity,
    pub current_cpu: u32,
    /// AMC service owned by this task, if it has registered one. Set/cleared
    /// by the AMC layer; the scheduler only consults it on `die`.
    pub owned_service: Option<u64>,
}

impl Task {
    /// Build a new kernel task. `entry` is called with interrupts disabled,
    /// on the freshly built kernel stack, in the current (kernel bootstrap)
    /// address space.
    pub fn spawn_kernel(
        entry: extern "C" fn() -> !,
        priority: PriorityClass,
        name: &str,
    ) -> KernelResult<Self> {
        let address_space = AddressSpace::current();
        let stack_base = address_space.alloc_range(
            KERNEL_STACK_REGION_HINT,
            KERNEL_STACK_SIZE,
            PageFlags::KERNEL_DATA,
        )?;
        let stack_top = stack_base + KERNEL_STACK_SIZE as u64;
        let context = ArchThreadContext::new(entry as usize, stack_top as usize);

        Ok(Self {
            id: next_task_id(),
            name: String::from(name),
            priority,
            state: TaskState::Ready,
            kernel_stack_base: stack_base,
            kernel_stack_size: KERNEL_STACK_SIZE,
            context,
            address_space,
            blocked: None,
            symbols: SymbolSnapshot::default(),
            affinity: CpuAffinity::all(),
            current_cpu: 0,
            owned_service: None,
        })
    }

    pub fn kernel_stack_top(&self) -> u64 {
        self.kernel_stack_base + self.kernel_stack_size as u64
    }

    pub fn to_task_context(&self) -> TaskContext {
        self.context.to_task_context()
    }

    pub fn block(&mut self, reasons: BlockReason, wake_ms: Option<u64>, service: Option<u64>) {
        let info = self.blocked.get_or_insert_with(BlockedInfo::default);
        info.reasons.insert(reasons);
        if wake_ms.is_some() {
            info.wake_timestamp_ms = wake_ms;
        }
        if service.is_some() {
            info.service = service;
        }
        self.state = TaskState::Blocked;
    }

    /// Block on a specific IRQ line, per the driver-facing interrupt
    /// protocol (ADI). Distinct from [`Task::block`] because the awaited
    /// line has to be readable back out by the dispatch path to know which
    /// blocked task, if any, a firing interrupt should wake.
    pub fn block_on_interrupt(&mut self, irq: u8) {
        let info = self.blocked.get_or_insert_with(BlockedInfo::default);
        info.reasons.insert(BlockReason::AWAIT_INTERRUPT);
        info.awaited_interrupt = Some(irq);
        self.state = TaskState::Blocked;
    }

    /// Clear `reason`; returns true if the task is now fully runnable.
    pub fn unblock(&mut self, reason: BlockReason) -> bool {
        let Some(info) = self.blocked.as_mut() else {
            return false;
        };
        let fully_woken = info.clear_reason(reason);
        if fully_woken {
            self.blocked = None;
            self.state = TaskState::Ready;
        }
        fully_woken
    }

    /// Tear down everything this task owns. Does not remove it from the
    /// scheduler's task table; the caller does that.
    pub fn destroy(self) -> Result<(), KernelError> {
        self.address_space.destroy();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_scan_order_is_highest_first() {
        assert_eq!(PriorityClass::HIGHEST_FIRST[0], PriorityClass::Kernel);
        assert_eq!(PriorityClass::HIGHEST_FIRST[3], PriorityClass::Idle);
    }

    #[test]
    fn message_timestamp_race_wakes_on_either_reason() {
        let mut info = BlockedInfo {
            reasons: BlockReason::AWAIT_MESSAGE | BlockReason::AWAIT_TIMESTAMP,
            wake_timestamp_ms: Some(1000),
            awaited_interrupt: None,
            service: None,
        };
        assert!(info.clear_reason(BlockReason::AWAIT_MESSAGE));
        assert!(info.reasons.is_empty());
    }

    #[test]
    fn unrelated_reasons_require_all_clear() {
        let mut info = BlockedInfo {
            reasons: BlockReason::AWAIT_MESSAGE | BlockReason::AWAIT_INTERRUPT,
            ..BlockedInfo::default()
        };
        assert!(!info.clear_reason(BlockReason::AWAIT_MESSAGE));
        assert!(info.clear_reason(BlockReason::AWAIT_INTERRUPT));
    }

    #[test]
    fn symbol_snapshot_resolves_nearest_below() {
        let snap = SymbolSnapshot::new(alloc::vec![
            SymbolEntry { addr: 0x1000, name: String::from("a") },
            SymbolEntry { addr: 0x2000, name: String::from("b") },
        ]);
        assert_eq!(snap.resolve(0x1500), Some("a"));
        assert_eq!(snap.resolve(0x2500), Some("b"));
        assert_eq!(snap.resolve(0x500), None);
    }
}
