//! Scheduler bookkeeping integration tests, run under a real boot.
//!
//! Every task exercised here is spawned but never made the scheduler's
//! "current" task, so `block`/`unblock` only mutate TCB state and never
//! reach `reschedule()`'s real, inline-asm context switch — see
//! `sched::scheduler::block`. That keeps this binary single-threaded and
//! deterministic while still exercising the real locking, ready-queue
//! removal, and block-reason bookkeeping.

#![no_std]
#![no_main]

use bootloader_api::{entry_point, BootInfo};

use axle_core::sched::task::TaskState;
use axle_core::sched::BlockReason;
use axle_core::{arch, boot_info, exit_qemu, log_sink, mm, sched, serial_println, test_panic_handler, QemuExitCode};
use axle_core::PriorityClass;

entry_point!(kernel_test_main);

fn kernel_test_main(raw_boot_info: &'static mut BootInfo) -> ! {
    axle_core::serial::init();
    boot_info::init(raw_boot_info);
    log_sink::init(log::LevelFilter::Info);
    arch::init();
    mm::init();
    sched::init();

    serial_println!("scheduler_scenarios: starting");

    spawned_task_starts_ready();
    block_and_unblock_round_trips_state();
    message_timestamp_race_wakes_on_either_reason();
    block_on_interrupt_records_the_irq();

    serial_println!("scheduler_scenarios: all scenarios passed");
    exit_qemu(QemuExitCode::Success)
}

extern "C" fn parked_entry() -> ! {
    loop {
        arch::idle();
    }
}

fn spawned_task_starts_ready() {
    let id = sched::spawn(parked_entry, PriorityClass::Normal, "ready-check").expect("spawn");
    let state = sched::with_task(id, |t| t.state).expect("task exists");
    assert_eq!(state, TaskState::Ready);
    serial_println!("  spawned_task_starts_ready [ok]");
}

fn block_and_unblock_round_trips_state() {
    let id = sched::spawn(parked_entry, PriorityClass::Driver, "block-check").expect("spawn");

    sched::block(id, BlockReason::AWAIT_MESSAGE, None, None).expect("block");
    let state = sched::with_task(id, |t| t.state).expect("task exists");
    assert_eq!(state, TaskState::Blocked);

    sched::unblock(id, BlockReason::AWAIT_MESSAGE).expect("unblock");
    let state = sched::with_task(id, |t| t.state).expect("task exists");
    assert_eq!(state, TaskState::Ready);

    serial_println!("  block_and_unblock_round_trips_state [ok]");
}

/// A task blocked on both `AWAIT_MESSAGE` and `AWAIT_TIMESTAMP` wakes as
/// soon as either clears, per `BlockedInfo::clear_reason`'s short-circuit.
fn message_timestamp_race_wakes_on_either_reason() {
    let id = sched::spawn(parked_entry, PriorityClass::Normal, "race-check").expect("spawn");

    sched::block(
        id,
        BlockReason::AWAIT_MESSAGE | BlockReason::AWAIT_TIMESTAMP,
        Some(1_000),
        None,
    )
    .expect("block on message-or-timestamp");

    let state = sched::with_task(id, |t| t.state).expect("task exists");
    assert_eq!(state, TaskState::Blocked);

    // Only the message reason ever clears; the timestamp side never does.
    sched::unblock(id, BlockReason::AWAIT_MESSAGE).expect("unblock on message");

    let state = sched::with_task(id, |t| t.state).expect("task exists");
    assert_eq!(
        state,
        TaskState::Ready,
        "clearing AWAIT_MESSAGE alone must fully wake a message-or-timestamp wait"
    );

    serial_println!("  message_timestamp_race_wakes_on_either_reason [ok]");
}

fn block_on_interrupt_records_the_irq() {
    let id = sched::spawn(parked_entry, PriorityClass::Normal, "irq-check").expect("spawn");

    sched::block_on_interrupt(id, 11).expect("block on irq 11");
    let (state, awaited) = sched::with_task(id, |t| {
        (t.state, t.blocked.expect("blocked info present").awaited_interrupt)
    })
    .expect("task exists");
    assert_eq!(state, TaskState::Blocked);
    assert_eq!(awaited, Some(11));

    sched::unblock(id, BlockReason::AWAIT_INTERRUPT).expect("unblock on irq");
    let state = sched::with_task(id, |t| t.state).expect("task exists");
    assert_eq!(state, TaskState::Ready);

    serial_println!("  block_on_interrupt_records_the_irq [ok]");
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    test_panic_handler(info)
}
