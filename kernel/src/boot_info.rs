//! Normalized boot-info singleton (spec 4.A).
//!
//! `bootloader_api::BootInfo` is ingested exactly once, at the very start of
//! [`crate::main`]'s boot sequence, and copied into this crate's own
//! [`BootInfo`] shape so that every later subsystem (PFA, VASM, the APIC/PIC
//! glue) reads a stable, already-validated view instead of reaching back
//! into the bootloader's own struct. Grounded on
//! `kernel/kernel/boot_info.{h,c}`: the physical memory region list, kernel
//! image bounds, initrd bounds and framebuffer description are carried
//! forward unchanged in spirit; ACPI RSDP and the physical-memory-offset
//! (this core's stand-in for `vas_kernel`, since VASM uses a self-map rather
//! than a fixed direct map) are new fields `bootloader_api` exposes that the
//! original toolchain passed some other way.

extern crate alloc;

use alloc::vec::Vec;

use bootloader_api::info::{MemoryRegionKind, MemoryRegions};

use crate::sync::once_lock::GlobalState;

/// Mirrors `physical_memory_region_type` from `boot_info.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegionType {
    Usable,
    Reserved,
    ReservedAcpiNvm,
    ReservedKernelImage,
    ReservedBootloader,
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub region_type: MemoryRegionType,
    pub start: u64,
    pub end: u64,
}

impl MemoryRegion {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    pub phys_addr: u64,
    pub width: usize,
    pub height: usize,
    pub bytes_per_pixel: usize,
    pub stride: usize,
    pub size: usize,
}

/// The core's normalized view of everything the bootloader handed us.
#[derive(Debug, Clone)]
pub struct BootInfo {
    pub kernel_image_start: u64,
    pub kernel_image_end: u64,

    pub initrd_start: Option<u64>,
    pub initrd_end: Option<u64>,

    pub mem_regions: Vec<MemoryRegion>,

    pub framebuffer: Option<FramebufferInfo>,

    /// Offset added to a physical address to reach its identity-mapped
    /// virtual alias in the bootloader's own mappings. VASM's self-map
    /// supersedes this for editing page tables; this offset remains useful
    /// only for the handful of very-early, pre-VASM reads (e.g. walking the
    /// bootloader's own memory map).
    pub physical_memory_offset: u64,

    pub acpi_rsdp: Option<u64>,
}

static BOOT_INFO: GlobalState<BootInfo> = GlobalState::new();

fn region_type(kind: MemoryRegionKind) -> MemoryRegionType {
    match kind {
        MemoryRegionKind::Usable => MemoryRegionType::Usable,
        MemoryRegionKind::Bootloader => MemoryRegionType::ReservedBootloader,
        _ => MemoryRegionType::Reserved,
    }
}

fn normalize_regions(regions: &MemoryRegions) -> Vec<MemoryRegion> {
    regions
        .iter()
        .map(|r| MemoryRegion {
            region_type: region_type(r.kind),
            start: r.start,
            end: r.end,
        })
        .collect()
}

/// Ingest the bootloader's raw `BootInfo` and install the normalized
/// singleton. Must run exactly once, before [`crate::mm::frame_allocator`]
/// init.
pub fn init(raw: &'static mut bootloader_api::BootInfo) {
    let physical_memory_offset = raw
        .physical_memory_offset
        .into_option()
        .expect("bootloader did not map physical memory; required for early boot reads");

    let framebuffer = raw.framebuffer.as_ref().map(|fb| {
        let info = fb.info();
        FramebufferInfo {
            phys_addr: fb.buffer().as_ptr() as u64 - physical_memory_offset,
            width: info.width,
            height: info.height,
            bytes_per_pixel: info.bytes_per_pixel,
            stride: info.stride,
            size: fb.buffer().len(),
        }
    });

    let kernel_image_start = raw.kernel_addr;
    let kernel_image_end = raw.kernel_addr + raw.kernel_len;

    let (initrd_start, initrd_end) = match raw.ramdisk_addr.into_option() {
        Some(addr) => (Some(addr), Some(addr + raw.ramdisk_len)),
        None => (None, None),
    };

    let info = BootInfo {
        kernel_image_start,
        kernel_image_end,
        initrd_start,
        initrd_end,
        mem_regions: normalize_regions(&raw.memory_regions),
        framebuffer,
        physical_memory_offset,
        acpi_rsdp: raw.rsdp_addr.into_option(),
    };

    BOOT_INFO
        .init(info)
        .unwrap_or_else(|_| panic!("boot_info::init called twice"));
}

/// Borrow the normalized boot info. Panics if called before [`init`].
pub fn get() -> BootInfo {
    BOOT_INFO
        .with(|info| info.clone())
        .expect("boot_info::get called before boot_info::init")
}

pub fn dump() {
    let info = get();
    log::info!(
        "boot_info: kernel image [{:#x}, {:#x}), phys_mem_offset={:#x}, {} memory regions",
        info.kernel_image_start,
        info.kernel_image_end,
        info.physical_memory_offset,
        info.mem_regions.len(),
    );
    if let Some(fb) = info.framebuffer {
        log::info!(
            "boot_info: framebuffer {}x{} @ {:#x}",
            fb.width,
            fb.height,
            fb.phys_addr
        );
    }
    if let Some(rsdp) = info.acpi_rsdp {
        log::info!("boot_info: ACPI RSDP @ {:#x}", rsdp);
    }
}
