//! Architecture-independent context management interface
//!
//! The core targets one architecture (spec section 1), so this module is
//! thin: it names the concrete context type and forwards to the x86_64
//! primitives that actually manipulate CPU state.

/// Architecture-specific thread context type. This core targets x86_64
/// only; see `crate::arch` module docs.
#[allow(dead_code)]
pub type ArchThreadContext = crate::arch::x86_64::context::X86_64Context;

/// Perform a context switch between two threads
///
/// # Safety
/// This function must be called with interrupts disabled and
/// both contexts must be valid.
#[allow(dead_code)]
pub unsafe fn switch_context(from: &mut ArchThreadContext, to: &ArchThreadContext) {
    crate::arch::x86_64::context::switch_context(from, to);
}

/// Initialize FPU/SIMD for the current CPU
#[allow(dead_code)]
pub fn init_fpu() {
    crate::arch::x86_64::context::init_fpu();
}

/// Save FPU/SIMD state
#[allow(dead_code)]
pub fn save_fpu_state(state: &mut [u8]) {
    unsafe {
        crate::arch::x86_64::context::save_fpu_state(
            &mut *(state.as_mut_ptr() as *mut crate::arch::x86_64::context::FpuState),
        );
    }
}

/// Restore FPU/SIMD state
#[allow(dead_code)]
pub fn restore_fpu_state(state: &[u8]) {
    unsafe {
        crate::arch::x86_64::context::restore_fpu_state(
            &*(state.as_ptr() as *const crate::arch::x86_64::context::FpuState),
        );
    }
}
