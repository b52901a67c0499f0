//! Page fault dispatch (spec 4.C).
//!
//! Decodes the faulting address and the present/write/user/exec bits, then
//! dispatches: a fault in a user task's half goes through the crash-report
//! kill path; a fault in the kernel half, or one that occurs before the
//! scheduler has a running task to blame, is fatal.

#![allow(dead_code)]

use super::vas::KERNEL_SPLIT_INDEX;

/// Reason a page fault occurred, decoded from the CPU error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFaultReason {
    NotPresent,
    ProtectionViolation,
    WriteToReadOnly,
    ExecuteNoExecute,
    UserModeKernelAccess,
}

/// Everything the architecture trap handler collects before handing off.
#[derive(Debug, Clone, Copy)]
pub struct PageFaultInfo {
    pub faulting_address: u64,
    pub reason: PageFaultReason,
    pub was_write: bool,
    pub was_user_mode: bool,
    pub instruction_pointer: u64,
}

impl PageFaultInfo {
    /// Whether the faulting address falls in the kernel half of the
    /// canonical address space (PML4 index >= `KERNEL_SPLIT_INDEX`).
    pub fn in_kernel_half(&self) -> bool {
        (self.faulting_address >> 39) & 0x1FF >= KERNEL_SPLIT_INDEX as u64
    }
}

/// Dispatch a page fault. A fault in the kernel half, or one seen before any
/// task is running, is always fatal. A fault in a user task's half kills
/// that task via the crash-report path (4.F) and never returns to the
/// faulting instruction.
pub fn handle_page_fault(info: PageFaultInfo) -> ! {
    if info.in_kernel_half() || !info.was_user_mode {
        panic!(
            "page fault in kernel half: addr={:#x} ip={:#x} reason={:?} write={}",
            info.faulting_address, info.instruction_pointer, info.reason, info.was_write
        );
    }

    log::error!(
        "page fault in user task: addr={:#x} ip={:#x} reason={:?} write={}",
        info.faulting_address,
        info.instruction_pointer,
        info.reason,
        info.was_write
    );

    crate::crash::report_and_kill(crate::crash::CrashCause::PageFault {
        addr: info.faulting_address,
        ip: info.instruction_pointer,
        write: info.was_write,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_half_addresses_are_detected() {
        let kernel_addr = PageFaultInfo {
            faulting_address: 0xFFFF_8000_0000_1000,
            reason: PageFaultReason::NotPresent,
            was_write: false,
            was_user_mode: false,
            instruction_pointer: 0,
        };
        assert!(kernel_addr.in_kernel_half());

        let user_addr = PageFaultInfo {
            faulting_address: 0x0000_0040_0000_1000,
            ..kernel_addr
        };
        assert!(!user_addr.in_kernel_half());
    }
}
