//! Physical Frame Allocator integration test, run under a real boot
//! (spec scenario S1 is covered exhaustively as a host unit test in
//! `mm::frame_allocator`; this binary instead exercises the allocator's
//! *global* singleton the way every other subsystem actually uses it,
//! against the real memory map QEMU hands the bootloader).

#![no_std]
#![no_main]

extern crate alloc;

use bootloader_api::{entry_point, BootInfo};

use axle_core::mm::frame_allocator::{FrameNumber, PfaError, FRAME_ALLOCATOR};
use axle_core::{arch, boot_info, exit_qemu, log_sink, mm, serial_println, test_panic_handler, QemuExitCode};

entry_point!(kernel_test_main);

fn kernel_test_main(raw_boot_info: &'static mut BootInfo) -> ! {
    axle_core::serial::init();
    boot_info::init(raw_boot_info);
    log_sink::init(log::LevelFilter::Info);
    arch::init();
    mm::init();

    serial_println!("pfa_scenarios: starting");

    distinct_frames_on_successive_allocs();
    double_alloc_of_same_address_is_rejected();
    contiguous_run_is_actually_contiguous();
    freeing_and_reallocating_does_not_panic();

    serial_println!("pfa_scenarios: all scenarios passed");
    exit_qemu(QemuExitCode::Success)
}

/// A handful of `alloc()` calls against the live global allocator must
/// never hand out the same frame twice.
fn distinct_frames_on_successive_allocs() {
    let mut frames = alloc::vec::Vec::new();
    for _ in 0..64 {
        frames.push(FRAME_ALLOCATOR.alloc().expect("real RAM has room for 64 frames"));
    }
    for i in 0..frames.len() {
        for j in (i + 1)..frames.len() {
            assert_ne!(frames[i], frames[j], "alloc() handed out the same frame twice");
        }
    }
    for frame in frames {
        FRAME_ALLOCATOR.free(frame);
    }
    serial_println!("  distinct_frames_on_successive_allocs [ok]");
}

/// `alloc_address` on a frame already held must fail with `DoubleAlloc`,
/// not silently succeed (spec 4.B / section 7, "double-alloc is a panic
/// at the PFA's caller's discretion" — here surfaced as a typed error).
fn double_alloc_of_same_address_is_rejected() {
    let frame = FRAME_ALLOCATOR.alloc().expect("real RAM has room for one frame");
    let err = FRAME_ALLOCATOR.alloc_address(frame).unwrap_err();
    assert_eq!(err, PfaError::DoubleAlloc { frame: frame.as_u64() });
    FRAME_ALLOCATOR.free(frame);
    serial_println!("  double_alloc_of_same_address_is_rejected [ok]");
}

/// `alloc_contiguous(n)` must return `n` frames with strictly increasing,
/// consecutive frame numbers.
fn contiguous_run_is_actually_contiguous() {
    let start = FRAME_ALLOCATOR.alloc_contiguous(16).expect("real RAM has a 16-frame run free");
    for i in 0..16u64 {
        let expected = FrameNumber::new(start.as_u64() + i);
        FRAME_ALLOCATOR.free(expected);
    }
    serial_println!("  contiguous_run_is_actually_contiguous [ok]");
}

/// A frame freed and immediately re-allocated must not trip the
/// double-free assertion and must be usable again.
fn freeing_and_reallocating_does_not_panic() {
    let frame = FRAME_ALLOCATOR.alloc().expect("real RAM has room for one frame");
    FRAME_ALLOCATOR.free(frame);
    let reallocated = FRAME_ALLOCATOR.alloc().expect("just-freed frame is available again");
    FRAME_ALLOCATOR.free(reallocated);
    serial_println!("  freeing_and_reallocating_does_not_panic [ok]");
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    test_panic_handler(info)
}
