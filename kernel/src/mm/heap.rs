//! Kernel heap backing (ambient stack, not a spec module in its own right):
//! a static byte array identity-backs the crate's `linked_list_allocator`
//! global allocator so `alloc`-gated collections (AMC inboxes, VASM region
//! bookkeeping, the PFA's own bitset storage) have somewhere to live from
//! the very first allocation, well before the VASM exists to carve out
//! heap pages properly.
//!
//! Host builds (`cfg(not(target_os = "none"))`) use `std::alloc::System`
//! instead (see `crate::lib`) and never call [`init`].

/// Kernel heap size. Small by hobbyist-OS standards: the PFA's own bitset
/// storage (~2 MiB for a 64 GiB frame table) is the single largest tenant.
pub const HEAP_SIZE: usize = 8 * 1024 * 1024;

#[repr(align(16))]
struct HeapStorage([u8; HEAP_SIZE]);

static mut HEAP_MEMORY: HeapStorage = HeapStorage([0; HEAP_SIZE]);

/// Back the global allocator with [`HEAP_MEMORY`]. Must run before the PFA
/// or anything else touches `alloc`; safe to call exactly once.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn init() {
    // SAFETY: `HEAP_MEMORY` is referenced only through this pointer, only
    // here, and only once, before any other code can race an allocation
    // against the not-yet-initialized global allocator.
    unsafe {
        let heap_start = core::ptr::addr_of_mut!(HEAP_MEMORY.0) as *mut u8;
        crate::get_allocator().lock().init(heap_start, HEAP_SIZE);
    }
    log::info!("mm: kernel heap initialized, {} KiB", HEAP_SIZE / 1024);
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn init() {}
