//! Shared-memory regions (spec 4.E): a contiguous physical range mapped
//! into two services' address spaces at once.
//!
//! `create`/`destroy` are the two entry points; [`crate::ipc::registry`]
//! owns the symmetric bookkeeping (the paired [`SharedMemoryRegion`]
//! records) and calls into this module only for the frame/mapping work.

extern crate alloc;

use crate::error::{IpcError, KernelError};
use crate::mm::{AddressSpace, PageFlags, FRAME_SIZE};
use crate::raii::ScopeGuard;

use super::message::ServiceName;

/// Hint for where shared-memory regions land, well clear of kernel stacks
/// and delivery pools.
const SHARED_MEMORY_REGION_HINT: u64 = 0x0000_3000_0000_0000;

/// One side of a symmetric shared-memory mapping (spec 3, "Shared-Memory
/// Region"). A region always exists as a pair: one `SharedMemoryRegion` in
/// the creator's service, one in the peer's, with matching `base_frame`.
#[derive(Debug, Clone)]
pub struct SharedMemoryRegion {
    /// Name of the service on the other side of this mapping.
    pub peer: ServiceName,
    /// Index of this region's record within the peer's region list, so
    /// `destroy` can remove both sides without a linear name search.
    pub peer_descriptor: usize,
    /// Virtual base of this mapping in the owning service's own address
    /// space. Doubles as the descriptor handed back to callers.
    pub local_va: u64,
    /// Size in bytes, already rounded up to a whole number of pages.
    pub size: usize,
    base_frame: crate::mm::FrameNumber,
}

impl SharedMemoryRegion {
    pub fn pages(&self) -> usize {
        self.size.div_ceil(FRAME_SIZE)
    }
}

/// The two freshly created, not-yet-linked halves of a shared-memory
/// mapping, before the registry records them against each service.
pub struct CreatedPair {
    pub local: SharedMemoryRegion,
    pub remote: SharedMemoryRegion,
}

/// Allocate a contiguous physical range of `size` (rounded up to whole
/// pages) and map it into both `local` and `remote` address spaces at
/// independently chosen free virtual ranges. Rolls back every frame and
/// mapping made so far if any step fails, per the original implementation's
/// full-rollback policy (no half-created region is ever left visible).
pub fn create(
    local: &AddressSpace,
    local_name: &ServiceName,
    local_descriptor: usize,
    remote: &AddressSpace,
    remote_name: &ServiceName,
    remote_descriptor: usize,
    size: usize,
) -> Result<CreatedPair, IpcError> {
    let size = size.div_ceil(FRAME_SIZE) * FRAME_SIZE;
    let pages = size / FRAME_SIZE;

    let base_frame = crate::mm::frame_allocator::FRAME_ALLOCATOR
        .alloc_contiguous(pages)
        .map_err(|_| IpcError::SharedMemoryNotFound)?;

    // Rolled back unless `commit` is reached: frees every frame in the run.
    let frames_guard = ScopeGuard::new(|| {
        for i in 0..pages as u64 {
            crate::mm::frame_allocator::FRAME_ALLOCATOR
                .free(crate::mm::FrameNumber::new(base_frame.as_u64() + i));
        }
    });

    let local_va = map_run(local, base_frame, pages, size).map_err(|_| IpcError::SharedMemoryNotFound)?;
    let local_unmap = ScopeGuard::new(|| {
        let _ = local.unmap_range(local_va, size);
    });

    let remote_va = map_run(remote, base_frame, pages, size).map_err(|_| IpcError::SharedMemoryNotFound)?;
    let remote_unmap = ScopeGuard::new(|| {
        let _ = remote.unmap_range(remote_va, size);
    });

    // Both mappings installed: cancel the rollback guards and hand the
    // frames' ownership to the two SharedMemoryRegion records.
    local_unmap.cancel();
    remote_unmap.cancel();
    frames_guard.cancel();

    Ok(CreatedPair {
        local: SharedMemoryRegion {
            peer: remote_name.clone(),
            peer_descriptor: remote_descriptor,
            local_va,
            size,
            base_frame,
        },
        remote: SharedMemoryRegion {
            peer: local_name.clone(),
            peer_descriptor: local_descriptor,
            local_va: remote_va,
            size,
            base_frame,
        },
    })
}

fn map_run(
    space: &AddressSpace,
    base_frame: crate::mm::FrameNumber,
    pages: usize,
    size: usize,
) -> Result<u64, KernelError> {
    let va = space
        .find_free_region(size, SHARED_MEMORY_REGION_HINT)
        .ok_or(KernelError::AddressSpaceExhausted { size })?;
    for i in 0..pages {
        let paddr = (base_frame.as_u64() + i as u64) * FRAME_SIZE as u64;
        space.map_virt_to_phys(va + (i * FRAME_SIZE) as u64, paddr, PageFlags::USER_DATA)?;
    }
    Ok(va)
}

/// Undo both halves of a shared-memory mapping: clear both sets of page
/// table leaves, then free the shared physical run exactly once.
pub fn destroy(local: &AddressSpace, remote: &AddressSpace, region: &SharedMemoryRegion, remote_va: u64) {
    let _ = local.unmap_range(region.local_va, region.size);
    let _ = remote.unmap_range(remote_va, region.size);
    for i in 0..region.pages() as u64 {
        crate::mm::frame_allocator::FRAME_ALLOCATOR
            .free(crate::mm::FrameNumber::new(region.base_frame.as_u64() + i));
    }
}
