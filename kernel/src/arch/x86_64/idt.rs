//! Interrupt Descriptor Table.
//!
//! CPU exceptions that the rest of the core knows how to handle (page
//! faults) are routed into [`crate::mm::page_fault`]; anything this core
//! has no recovery story for reaches [`crate::crash::report_and_kill`].
//! Hardware IRQs (vectors 32..=47) are timer (32, handled inline) or routed
//! into [`crate::irq::dispatch`] -- the driver task that owns the line sends
//! its own EOI once it has drained the device, per the ADI contract.

use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use crate::irq::IrqNumber;

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        // SAFETY: the double-fault IST index names a dedicated stack set up
        // by `gdt::init`, which always runs before this table is loaded.
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(crate::arch::x86_64::gdt::DOUBLE_FAULT_IST_INDEX);
        }

        idt[32].set_handler_fn(timer_interrupt_handler);
        idt[33].set_handler_fn(irq1_handler);
        idt[34].set_handler_fn(irq2_handler);
        idt[35].set_handler_fn(irq3_handler);
        idt[36].set_handler_fn(irq4_handler);
        idt[37].set_handler_fn(irq5_handler);
        idt[38].set_handler_fn(irq6_handler);
        idt[39].set_handler_fn(irq7_handler);
        idt[40].set_handler_fn(irq8_handler);
        idt[41].set_handler_fn(irq9_handler);
        idt[42].set_handler_fn(irq10_handler);
        idt[43].set_handler_fn(irq11_handler);
        idt[44].set_handler_fn(irq12_handler);
        idt[45].set_handler_fn(irq13_handler);
        idt[46].set_handler_fn(irq14_handler);
        idt[47].set_handler_fn(irq15_handler);
        idt
    };
}

pub fn init() {
    IDT.load();
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    crate::println!("EXCEPTION: BREAKPOINT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    // A double fault means the kernel stack itself is likely corrupt; there
    // is no task state worth trying to save.
    panic!("EXCEPTION: DOUBLE FAULT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use crate::mm::page_fault::{PageFaultInfo, PageFaultReason};
    use x86_64::registers::control::Cr2;

    let was_write = error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE);
    let was_user_mode = error_code.contains(PageFaultErrorCode::USER_MODE);
    let reason = if !error_code.contains(PageFaultErrorCode::PROTECTION_VIOLATION) {
        PageFaultReason::NotPresent
    } else if error_code.contains(PageFaultErrorCode::INSTRUCTION_FETCH) {
        PageFaultReason::ExecuteNoExecute
    } else if was_write {
        PageFaultReason::WriteToReadOnly
    } else if was_user_mode {
        PageFaultReason::UserModeKernelAccess
    } else {
        PageFaultReason::ProtectionViolation
    };

    crate::mm::page_fault::handle_page_fault(PageFaultInfo {
        faulting_address: Cr2::read().map(|a| a.as_u64()).unwrap_or(0),
        reason,
        was_write,
        was_user_mode,
        instruction_pointer: stack_frame.instruction_pointer.as_u64(),
    });
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) {
    crate::crash::report_and_kill(crate::crash::CrashCause::Assertion {
        message: "general protection fault",
        ip: stack_frame.instruction_pointer.as_u64(),
    });
}

extern "x86-interrupt" fn timer_interrupt_handler(_stack_frame: InterruptStackFrame) {
    crate::arch::x86_64::timer::tick();
    crate::arch::x86_64::pic_eoi(0);
}

macro_rules! irq_handler {
    ($name:ident, $irq:expr) => {
        extern "x86-interrupt" fn $name(_stack_frame: InterruptStackFrame) {
            crate::irq::dispatch(IrqNumber::new($irq));
        }
    };
}

irq_handler!(irq1_handler, 1);
irq_handler!(irq2_handler, 2);
irq_handler!(irq3_handler, 3);
irq_handler!(irq4_handler, 4);
irq_handler!(irq5_handler, 5);
irq_handler!(irq6_handler, 6);
irq_handler!(irq7_handler, 7);
irq_handler!(irq8_handler, 8);
irq_handler!(irq9_handler, 9);
irq_handler!(irq10_handler, 10);
irq_handler!(irq11_handler, 11);
irq_handler!(irq12_handler, 12);
irq_handler!(irq13_handler, 13);
irq_handler!(irq14_handler, 14);
irq_handler!(irq15_handler, 15);
