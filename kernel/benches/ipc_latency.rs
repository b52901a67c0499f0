//! AMC round-trip latency under a real boot: `send` + `await_message`,
//! and shared-memory region setup/teardown.
//!
//! Every "task" here is spawned but never scheduled to run (see
//! `tests/amc_scenarios.rs`), so each `await_message` call is guaranteed
//! to find its message already queued and returns without ever touching
//! the scheduler's blocking path.

#![no_std]
#![no_main]

extern crate alloc;

use bootloader_api::{entry_point, BootInfo};

use axle_core::bench::{cycles_to_ns, read_timestamp, BenchmarkResult};
use axle_core::ipc::{registry, AwaitFilter};
use axle_core::{arch, boot_info, exit_qemu, ipc, log_sink, mm, sched, serial_println, PriorityClass, QemuExitCode};

const IPC_TARGET_NS: u64 = 5_000;
const ITERATIONS: u64 = 1_000;

entry_point!(kernel_bench_main);

fn kernel_bench_main(raw_boot_info: &'static mut BootInfo) -> ! {
    axle_core::serial::init();
    boot_info::init(raw_boot_info);
    log_sink::init(log::LevelFilter::Info);
    arch::init();
    mm::init();
    sched::init();
    ipc::init();

    serial_println!("IPC Latency Benchmark");
    serial_println!("=====================");
    serial_println!("Target: < {} ns", IPC_TARGET_NS);
    serial_println!();

    let small = benchmark_small_message_round_trip();
    let large = benchmark_large_message_round_trip();
    let shmem = benchmark_shared_memory_round_trip();

    serial_println!("\nResults:");
    serial_println!("--------");
    print_result(&small);
    print_result(&large);
    print_result(&shmem);

    serial_println!("\nTarget Analysis:");
    serial_println!("----------------");
    check_target(&small, IPC_TARGET_NS);
    check_target(&large, IPC_TARGET_NS);
    check_target(&shmem, IPC_TARGET_NS * 4);

    exit_qemu(QemuExitCode::Success)
}

extern "C" fn parked_entry() -> ! {
    loop {
        arch::idle();
    }
}

fn benchmark_small_message_round_trip() -> BenchmarkResult {
    let sender = sched::spawn(parked_entry, PriorityClass::Normal, "bench-small-sender").expect("spawn");
    registry::register(sender, "bench-small-a").expect("register a");
    let receiver = sched::spawn(parked_entry, PriorityClass::Normal, "bench-small-receiver").expect("spawn");
    registry::register(receiver, "bench-small-b").expect("register b");

    let body = [0u8; 32];
    let start = read_timestamp();
    for _ in 0..ITERATIONS {
        registry::send(sender, "bench-small-b", &body).expect("send");
        let _ = registry::await_message(receiver, AwaitFilter::One("bench-small-a"));
    }
    let end = read_timestamp();

    result_for("Small Message Round Trip", end - start, ITERATIONS)
}

fn benchmark_large_message_round_trip() -> BenchmarkResult {
    let sender = sched::spawn(parked_entry, PriorityClass::Normal, "bench-large-sender").expect("spawn");
    registry::register(sender, "bench-large-a").expect("register a");
    let receiver = sched::spawn(parked_entry, PriorityClass::Normal, "bench-large-receiver").expect("spawn");
    registry::register(receiver, "bench-large-b").expect("register b");

    let body = alloc::vec![0u8; 4096];
    let start = read_timestamp();
    for _ in 0..ITERATIONS {
        registry::send(sender, "bench-large-b", &body).expect("send");
        let _ = registry::await_message(receiver, AwaitFilter::One("bench-large-a"));
    }
    let end = read_timestamp();

    result_for("Large Message Round Trip", end - start, ITERATIONS)
}

fn benchmark_shared_memory_round_trip() -> BenchmarkResult {
    let iterations = ITERATIONS / 10;
    let a = sched::spawn(parked_entry, PriorityClass::Normal, "bench-shmem-a").expect("spawn");
    registry::register(a, "bench-shmem-a").expect("register a");
    let b = sched::spawn(parked_entry, PriorityClass::Normal, "bench-shmem-b").expect("spawn");
    registry::register(b, "bench-shmem-b").expect("register b");

    let start = read_timestamp();
    for _ in 0..iterations {
        let (local, _remote) = registry::shared_memory_create(a, "bench-shmem-b", 4096).expect("shmem create");
        registry::shared_memory_destroy(a, local).expect("shmem destroy");
    }
    let end = read_timestamp();

    result_for("Shared Memory Create+Destroy", end - start, iterations)
}

fn result_for(name: &str, total_cycles: u64, iterations: u64) -> BenchmarkResult {
    let avg_ns = cycles_to_ns(total_cycles / iterations);
    BenchmarkResult {
        name: alloc::string::String::from(name),
        iterations,
        total_time_ns: cycles_to_ns(total_cycles),
        avg_time_ns: avg_ns,
        min_time_ns: avg_ns,
        max_time_ns: avg_ns,
    }
}

fn print_result(result: &BenchmarkResult) {
    serial_println!(
        "{:<30} Avg: {:>6} ns, Min: {:>6} ns, Max: {:>6} ns",
        result.name,
        result.avg_time_ns,
        result.min_time_ns,
        result.max_time_ns
    );
}

fn check_target(result: &BenchmarkResult, target_ns: u64) {
    if result.meets_target(target_ns) {
        serial_println!("{:<30} PASS ({}ns <= {}ns)", result.name, result.avg_time_ns, target_ns);
    } else {
        serial_println!("{:<30} FAIL ({}ns > {}ns)", result.name, result.avg_time_ns, target_ns);
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    serial_println!("Benchmark panic: {}", info);
    exit_qemu(QemuExitCode::Failed)
}
