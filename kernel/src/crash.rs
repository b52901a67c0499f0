//! Crash / assert core (spec 4.F).
//!
//! On a kernel assertion or unhandled user fault: interrupts are already off
//! by the time [`report_and_kill`] runs (every caller reaches it from an
//! exception handler), the faulting task's return-address chain is
//! symbolicated as far as it can be, and a bounded text report is either
//! posted to the user-space crash reporter via AMC or, failing that, banged
//! out to the emergency serial banner before the kernel halts.

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write as _;

use crate::ipc::registry;
use crate::sched::{self, TaskId};

/// Services a report must never be addressed to: each is itself part of the
/// report pipeline (or terminal enough) that posting to it would either loop
/// back on itself or land nowhere useful.
const REPORT_EXCLUDED_SERVICES: &[&str] = &["file-server", "crash-reporter", "window-manager"];
const CRASH_REPORTER_SERVICE: &str = "crash-reporter";

/// Stack frames walked while symbolicating a backtrace, matching the
/// "bounded text report" requirement: an unbounded walk could itself make
/// the report unbounded.
const MAX_BACKTRACE_FRAMES: usize = 32;

/// What drove a task into the crash-report path.
#[derive(Debug, Clone, Copy)]
pub enum CrashCause {
    /// A page fault serviced by [`crate::mm::page_fault`].
    PageFault { addr: u64, ip: u64, write: bool },
    /// A failed `kernel_assert!`/debug assertion.
    Assertion { message: &'static str, ip: u64 },
    /// A task-visible AMC protocol violation (e.g. a send above the max
    /// body size) serious enough to kill the sender.
    InvalidMessage { reason: &'static str },
}

impl CrashCause {
    fn instruction_pointer(&self) -> u64 {
        match *self {
            CrashCause::PageFault { ip, .. } => ip,
            CrashCause::Assertion { ip, .. } => ip,
            CrashCause::InvalidMessage { .. } => 0,
        }
    }
}

/// One resolved backtrace entry.
struct Frame {
    return_address: u64,
    symbol: Option<&'static str>,
}

/// Read the return address and saved frame pointer at `rbp`. `None` if
/// `rbp` doesn't look like a live frame (null, or not 8-byte aligned).
///
/// # Safety
/// `rbp` must be a value actually taken from a register or a previous
/// frame's saved-rbp slot during this same walk; the caller is already on
/// the fatal path so a bad read here faults into the double-fault handler
/// rather than corrupting anything live.
unsafe fn read_frame(rbp: u64) -> Option<(u64, u64)> {
    if rbp == 0 || rbp % 8 != 0 {
        return None;
    }
    // SAFETY: see function doc. `rbp` is treated as `*const [u64; 2]`:
    // saved rbp at offset 0, return address at offset 8, matching the
    // standard x86_64 frame-pointer stack layout this kernel's own
    // prologues use.
    let saved_rbp = unsafe { core::ptr::read_volatile(rbp as *const u64) };
    let return_address = unsafe { core::ptr::read_volatile((rbp + 8) as *const u64) };
    Some((saved_rbp, return_address))
}

/// Walk the frame-pointer chain from `rbp`, resolving each return address
/// through `symbols` (the current task's symbol-table snapshot, spec 3). A
/// kernel build with no ELF symbol table loaded resolves kernel-half
/// addresses to `None`; only a task's own symbol snapshot, when present,
/// yields names (an Open Question resolution, see DESIGN.md).
fn walk_frames(mut rbp: u64, symbols: &crate::sched::task::SymbolSnapshot) -> Vec<Frame> {
    let mut frames = Vec::new();
    for _ in 0..MAX_BACKTRACE_FRAMES {
        // SAFETY: see `read_frame`.
        let Some((saved_rbp, return_address)) = (unsafe { read_frame(rbp) }) else {
            break;
        };
        if return_address == 0 {
            break;
        }
        let symbol = symbols.resolve(return_address);
        let stop = matches!(symbol, Some("_start") | Some("amc_exec_trampoline"));
        frames.push(Frame { return_address, symbol });
        if stop {
            break;
        }
        rbp = saved_rbp;
    }
    frames
}

/// Current frame pointer, used as the walk's starting point.
fn current_rbp() -> u64 {
    let rbp: u64;
    // SAFETY: reads rbp into a register output, no memory access.
    unsafe {
        core::arch::asm!("mov {}, rbp", out(reg) rbp, options(nomem, nostack, preserves_flags));
    }
    rbp
}

fn compose_report(task: Option<TaskId>, cause: CrashCause, frames: &[Frame]) -> String {
    let mut report = String::new();
    let _ = match cause {
        CrashCause::PageFault { addr, ip, write } => write!(
            report,
            "page fault: addr={:#x} ip={:#x} write={}",
            addr, ip, write
        ),
        CrashCause::Assertion { message, ip } => {
            write!(report, "assertion failed: {} ip={:#x}", message, ip)
        }
        CrashCause::InvalidMessage { reason } => write!(report, "invalid message: {}", reason),
    };
    if let Some(task) = task {
        let _ = write!(report, "\ntask: {}", task);
    }
    for (i, frame) in frames.iter().enumerate() {
        let _ = match frame.symbol {
            Some(name) => write!(report, "\n  #{} {:#x} {}", i, frame.return_address, name),
            None => write!(report, "\n  #{} {:#x}", i, frame.return_address),
        };
    }
    report
}

fn emergency_banner(report: &str) {
    crate::serial::_print(format_args!(
        "\n================ KERNEL CRASH ================\n{}\n================================================\n",
        report
    ));
}

/// Report `cause` and terminate the task responsible. Never returns: either
/// the task is killed via the scheduler, or the kernel halts.
///
/// Must be called with interrupts already disabled (true of every exception
/// handler that reaches here).
pub fn report_and_kill(cause: CrashCause) -> ! {
    let task = sched::current_task_id();
    let symbols = task
        .and_then(|t| sched::with_task(t, |t| t.symbols.clone()))
        .unwrap_or_default();

    let frames = walk_frames(current_rbp(), &symbols);
    let report = compose_report(task, cause, &frames);

    let dying_service = task.and_then(registry::owned_service_name);
    let excluded = dying_service
        .as_ref()
        .is_some_and(|name| REPORT_EXCLUDED_SERVICES.contains(&name.as_str()));

    if !excluded && registry::service_exists(CRASH_REPORTER_SERVICE) {
        let posted = registry::deliver_from_core(
            &crate::ipc::ServiceName::new(CRASH_REPORTER_SERVICE)
                .expect("'crash-reporter' is a valid service name"),
            report.as_bytes(),
        )
        .is_ok();
        if posted {
            log::error!("crash: reported and killing {:?}", task);
            match task {
                Some(_) => sched::die(1),
                None => {
                    emergency_banner(&report);
                    crate::arch::halt();
                }
            }
        }
    }

    emergency_banner(&report);
    match task {
        Some(_) => sched::die(1),
        None => crate::arch::halt(),
    }
}

/// Force a backtrace of the current task's stack without killing anything.
/// Used by diagnostic commands and by tests that want to exercise the
/// symbolication path in isolation.
pub fn unwind() -> alloc::vec::Vec<u64> {
    let task = sched::current_task_id();
    let symbols = task
        .and_then(|t| sched::with_task(t, |t| t.symbols.clone()))
        .unwrap_or_default();
    walk_frames(current_rbp(), &symbols)
        .into_iter()
        .map(|f| f.return_address)
        .collect()
}
