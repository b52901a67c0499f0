//! axle-core: the OS core (boot-info model, physical frame allocator,
//! virtual address space manager, task scheduler, AMC IPC, and the
//! crash/assert path). Everything above this layer -- drivers, servers,
//! userland -- runs as a task talking to these primitives over AMC.

#![no_std]
#![cfg_attr(all(test, target_os = "none"), no_main)]
#![feature(custom_test_frameworks)]
#![feature(abi_x86_interrupt)]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]
// Custom test runner only for bare-metal; host target uses the standard
// #[test] harness so `cargo test` on the host still works for unit tests.
#![cfg_attr(target_os = "none", test_runner(crate::test_runner))]
#![cfg_attr(target_os = "none", reexport_test_harness_main = "test_main")]

#[cfg(feature = "alloc")]
extern crate alloc;

// On bare metal, back the heap with a real allocator once `mm::init` has
// carved out kernel heap space. On the host (x86_64-unknown-linux-gnu), for
// unit tests and tooling, delegate to the system allocator instead.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use linked_list_allocator::LockedHeap;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

/// Reference to the global heap allocator, for `mm::init` to feed frames
/// into once the PFA is up.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn get_allocator() -> &'static LockedHeap {
    &ALLOCATOR
}

#[macro_use]
pub mod print;

mod intrinsics;

pub mod arch;
pub mod bench;
pub mod boot_info;
pub mod crash;
pub mod error;
pub mod ipc;
pub mod irq;
pub mod log_sink;
pub mod mm;
pub mod raii;
pub mod sched;
pub mod serial;
pub mod sync;

mod test_framework;

pub use mm::{AddressSpace, FrameNumber, PageFlags, PhysicalAddress, PhysicalFrame, FRAME_SIZE};
pub use sched::{BlockReason, PriorityClass, Task, TaskId};

#[cfg(test)]
pub use test_framework::test_runner;
pub use test_framework::{
    cycles_to_ns, exit_qemu, read_timestamp, test_panic_handler, BenchmarkRunner, QemuExitCode,
    Testable,
};

#[cfg(all(test, target_os = "none"))]
#[no_mangle]
pub extern "C" fn _start() -> ! {
    test_main();
    loop {
        core::hint::spin_loop();
    }
}

#[cfg(all(test, target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    test_framework::test_panic_handler(info)
}

/// Heap allocation error handler.
///
/// Panic is intentional: heap allocation failure in a no_std kernel is
/// unrecoverable. The alloc_error_handler ABI requires `-> !`.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("allocation error: {:?}", layout);
}
