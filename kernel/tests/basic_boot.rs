//! Smoke test: the full `main.rs` boot sequence, minus enabling
//! interrupts, completes without panicking and leaves every subsystem
//! queryable.

#![no_std]
#![no_main]

use bootloader_api::{entry_point, BootInfo};

use axle_core::{arch, boot_info, exit_qemu, ipc, log_sink, mm, sched, serial_println, test_panic_handler, QemuExitCode};

entry_point!(kernel_test_main);

fn kernel_test_main(raw_boot_info: &'static mut BootInfo) -> ! {
    axle_core::serial::init();
    serial_println!("basic_boot: starting");

    boot_info::init(raw_boot_info);
    log_sink::init(log::LevelFilter::Info);
    log::info!("axle-core v{}", env!("CARGO_PKG_VERSION"));
    boot_info::dump();

    arch::init();
    arch::x86_64::timer::setup_timer();
    mm::init();
    sched::init();
    ipc::init();

    assert!(boot_info::get().physical_memory_offset > 0, "physical memory must be mapped somewhere");
    assert!(sched::current_task_id().is_some(), "scheduler must have an idle task as current");

    serial_println!("basic_boot: all subsystems initialized");
    exit_qemu(QemuExitCode::Success)
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    test_panic_handler(info)
}
