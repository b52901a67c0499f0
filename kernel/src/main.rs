//! Kernel entry point.
//!
//! Boot order matters: serial first (so every later `log::info!` has
//! somewhere to go), then the normalized boot-info singleton, then the
//! logger, then arch (GDT/IDT/PIC), then memory management, then the
//! scheduler, then IPC, then interrupts. Hardware interrupts stay masked
//! until every subsystem a handler could touch is up.

#![no_std]
#![no_main]
#![feature(abi_x86_interrupt)]

use bootloader_api::{entry_point, BootInfo};

use axle_core::{arch, boot_info, crash, ipc, irq, log_sink, mm, sched, serial};

entry_point!(kernel_main);

fn kernel_main(raw_boot_info: &'static mut BootInfo) -> ! {
    serial::init();
    boot_info::init(raw_boot_info);

    log_sink::init(log::LevelFilter::Info);
    log::info!("axle-core v{} ({}, built {})", env!("CARGO_PKG_VERSION"), env!("GIT_HASH"), env!("BUILD_TIMESTAMP"));
    boot_info::dump();

    arch::init();
    arch::x86_64::timer::setup_timer();
    mm::init();
    sched::init();
    ipc::init();
    irq::init().expect("irq manager init failed");
    arch::x86_64::pic_unmask(0);

    log::info!("boot: all subsystems initialized, enabling interrupts");
    arch::enable_interrupts();

    loop {
        arch::idle();
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    log::error!("panic: {}", info);
    if sched::current_task_id().is_some() {
        crash::report_and_kill(crash::CrashCause::Assertion {
            message: "kernel panic",
            ip: 0,
        });
    }
    arch::halt();
}
