//! Heap allocator latency under a real boot: small/medium/large
//! allocations and deallocation, against the kernel's actual
//! `linked_list_allocator`-backed global allocator (`mm::heap`).

#![no_std]
#![no_main]

extern crate alloc;

use alloc::vec::Vec;

use bootloader_api::{entry_point, BootInfo};

use axle_core::bench::{black_box, cycles_to_ns, read_timestamp, BenchmarkResult};
use axle_core::{arch, boot_info, exit_qemu, log_sink, mm, serial_println, QemuExitCode};

const TARGET_NS: u64 = 1_000;
const ITERATIONS: u64 = 1_000;

entry_point!(kernel_bench_main);

fn kernel_bench_main(raw_boot_info: &'static mut BootInfo) -> ! {
    axle_core::serial::init();
    boot_info::init(raw_boot_info);
    log_sink::init(log::LevelFilter::Info);
    arch::init();
    mm::heap::init();

    serial_println!("Memory Allocation Benchmark");
    serial_println!("===========================");
    serial_println!("Target: < {} ns", TARGET_NS);
    serial_println!();

    let small = benchmark_allocation("Small Alloc (64B)", 64, ITERATIONS);
    let medium = benchmark_allocation("Medium Alloc (4KB)", 4096, ITERATIONS);
    let large = benchmark_allocation("Large Alloc (64KB)", 65536, ITERATIONS / 10);
    let free = benchmark_deallocation();

    serial_println!("\nResults:");
    serial_println!("--------");
    print_result(&small);
    print_result(&medium);
    print_result(&large);
    print_result(&free);

    serial_println!("\nTarget Analysis:");
    serial_println!("----------------");
    check_target(&small, TARGET_NS);
    check_target(&medium, TARGET_NS);
    check_target(&large, TARGET_NS * 2);
    check_target(&free, TARGET_NS);

    exit_qemu(QemuExitCode::Success)
}

fn benchmark_allocation(name: &str, size: usize, iterations: u64) -> BenchmarkResult {
    let start = read_timestamp();
    for _ in 0..iterations {
        let v: Vec<u8> = Vec::with_capacity(size);
        black_box(&v);
    }
    let end = read_timestamp();

    let total_cycles = end - start;
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

fn benchmark_deallocation() -> BenchmarkResult {
    let mut vectors: Vec<Vec<u8>> = Vec::with_capacity(ITERATIONS as usize);
    for _ in 0..ITERATIONS {
        vectors.push(Vec::with_capacity(64));
    }

    let mut total_cycles = 0u64;
    let mut min_cycles = u64::MAX;
    let mut max_cycles = 0u64;

    for v in vectors {
        let start = read_timestamp();
        drop(v);
        let end = read_timestamp();
        let cycles = end.saturating_sub(start);
        total_cycles += cycles;
        min_cycles = min_cycles.min(cycles);
        max_cycles = max_cycles.max(cycles);
    }

    BenchmarkResult {
        name: alloc::string::String::from("Deallocation"),
        iterations: ITERATIONS,
        total_time_ns: cycles_to_ns(total_cycles),
        avg_time_ns: cycles_to_ns(total_cycles / ITERATIONS),
        min_time_ns: cycles_to_ns(min_cycles),
        max_time_ns: cycles_to_ns(max_cycles),
    }
}

fn print_result(result: &BenchmarkResult) {
    serial_println!(
        "{:<20} Avg: {:>6} ns, Min: {:>6} ns, Max: {:>6} ns",
        result.name,
        result.avg_time_ns,
        result.min_time_ns,
        result.max_time_ns
    );
}

fn check_target(result: &BenchmarkResult, target_ns: u64) {
    if result.meets_target(target_ns) {
        serial_println!("{:<20} PASS ({}ns <= {}ns)", result.name, result.avg_time_ns, target_ns);
    } else {
        serial_println!("{:<20} FAIL ({}ns > {}ns)", result.name, result.avg_time_ns, target_ns);
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    serial_println!("Benchmark panic: {}", info);
    exit_qemu(QemuExitCode::Failed)
}
