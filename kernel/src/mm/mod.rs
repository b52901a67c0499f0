//! Memory management: the Physical Frame Allocator (4.B) and the Virtual
//! Address Space Manager (4.C).

pub mod frame_allocator;
pub mod heap;
pub mod page_fault;
pub mod page_table;
pub mod vas;

pub use frame_allocator::{FrameNumber, PhysicalAddress, PhysicalFrame, FRAME_SIZE};
pub use page_table::PageFlags;
pub use vas::AddressSpace;

/// Back the kernel heap, bring up the PFA from the normalized boot-info
/// memory map, then install the self-map slot into the bootloader's own
/// page tables so the VASM fast path is available from here on. Must run
/// after [`crate::boot_info::init`] and before the scheduler spawns any
/// task. Heap first: the PFA's own bitset storage is itself a heap
/// allocation.
pub fn init() {
    heap::init();
    let boot_info = crate::boot_info::get();
    frame_allocator::init(&boot_info);
    vas::init();
    log::info!("mm: PFA and VASM initialized");
}
