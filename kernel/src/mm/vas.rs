//! Virtual Address Space Manager (VASM).
//!
//! Builds and mutates 4-level x86_64 page tables. The active address space
//! (the one loaded into `cr3`) is edited through a self-map: the top-level
//! table's last slot points to itself, which gives every table of the
//! active hierarchy a fixed virtual address with no temporary mapping
//! required. An inactive address space is edited by temp-mapping its table
//! frames, one level at a time, into a small pool of reserved slots in the
//! active space.

#![allow(dead_code)]

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::collections::{BTreeMap, BTreeSet};
#[cfg(feature = "alloc")]
use alloc::sync::Arc;

use spin::Mutex;
use x86_64::registers::control::Cr3;

use super::{
    frame_allocator::{FrameNumber, PhysicalAddress, FRAME_ALLOCATOR, FRAME_SIZE},
    page_table::{vaddr_indices, PageFlags, PageTable, PAGE_TABLE_ENTRIES},
};
use crate::error::KernelError;

/// PML4 slot used for the self-map. Index 511 is the top of the kernel
/// half, reserved for this purpose and never available to `alloc_range`.
pub const SELF_MAP_INDEX: usize = 511;

/// First PML4 index considered kernel-owned; `0..KERNEL_SPLIT_INDEX` is the
/// user half, `KERNEL_SPLIT_INDEX..512` is shared across every address
/// space (copied by value on `clone`, never torn down by `destroy`).
pub const KERNEL_SPLIT_INDEX: usize = 256;

fn canonicalize(addr: u64) -> u64 {
    if addr & (1 << 47) != 0 {
        addr | 0xFFFF_0000_0000_0000
    } else {
        addr
    }
}

fn recursive_addr(i4: usize, i3: usize, i2: usize, i1: usize) -> u64 {
    canonicalize(((i4 as u64) << 39) | ((i3 as u64) << 30) | ((i2 as u64) << 21) | ((i1 as u64) << 12))
}

fn self_map_pml4_addr() -> u64 {
    recursive_addr(SELF_MAP_INDEX, SELF_MAP_INDEX, SELF_MAP_INDEX, SELF_MAP_INDEX)
}

fn self_map_pdpt_addr(i4: usize) -> u64 {
    recursive_addr(SELF_MAP_INDEX, SELF_MAP_INDEX, SELF_MAP_INDEX, i4)
}

fn self_map_pd_addr(i4: usize, i3: usize) -> u64 {
    recursive_addr(SELF_MAP_INDEX, SELF_MAP_INDEX, i4, i3)
}

fn self_map_pt_addr(i4: usize, i3: usize, i2: usize) -> u64 {
    recursive_addr(SELF_MAP_INDEX, i4, i3, i2)
}

/// Reserved virtual region backing the temp-map slots. Lives in the kernel
/// half so it is present in every address space's shared upper mappings,
/// but only the bootstrap CPU's temp-map lock actually uses it.
const TEMP_MAP_BASE: u64 = 0xFFFF_FF00_0000_0000;
const TEMP_MAP_SLOTS: usize = 4;

static TEMP_MAP_LOCK: Mutex<[bool; TEMP_MAP_SLOTS]> = Mutex::new([false; TEMP_MAP_SLOTS]);

/// A temporary window onto one physical frame of an inactive hierarchy.
/// Unmaps itself and flushes the TLB entry on drop.
struct TempMapGuard {
    slot: usize,
    vaddr: u64,
}

impl TempMapGuard {
    /// Map `phys` into a free temp-map slot within the *currently active*
    /// address space (the kernel's own, since temp-mapping is only ever
    /// used by kernel code editing someone else's tables).
    fn map(phys: PhysicalAddress) -> Self {
        let mut slots = TEMP_MAP_LOCK.lock();
        let slot = slots
            .iter()
            .position(|used| !used)
            .expect("vasm: temp-map slots exhausted");
        slots[slot] = true;
        drop(slots);

        let vaddr = TEMP_MAP_BASE + (slot as u64) * FRAME_SIZE as u64;
        let active = AddressSpace::current();
        active
            .map_virt_to_phys(vaddr, phys.as_u64(), PageFlags::KERNEL_DATA)
            .expect("vasm: failed to install temp-map slot");
        Self { slot, vaddr }
    }

    fn table(&self) -> &mut PageTable {
        // SAFETY: `vaddr` was just mapped to `phys`'s frame above, and this
        // guard is the sole owner of the slot until it drops.
        unsafe { &mut *(self.vaddr as *mut PageTable) }
    }
}

impl Drop for TempMapGuard {
    fn drop(&mut self) {
        let active = AddressSpace::current();
        let _ = active.unmap_range(self.vaddr, FRAME_SIZE);
        x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(self.vaddr));
        TEMP_MAP_LOCK.lock()[self.slot] = false;
    }
}

/// A mutable view of one page table, regardless of whether it belongs to
/// the active or an inactive hierarchy.
enum TableView {
    /// Fixed self-map window; valid only while the owning space stays
    /// active for the lifetime of the view.
    SelfMapped(u64),
    Temp(TempMapGuard),
}

impl TableView {
    fn table(&self) -> &mut PageTable {
        match self {
            Self::SelfMapped(vaddr) => unsafe { &mut *(*vaddr as *mut PageTable) },
            Self::Temp(guard) => guard.table(),
        }
    }
}

/// Every live [`AddressSpace`] handle for a given page-table root must
/// share one `allocated_virtual_pages` set: `AddressSpace::current()` is
/// called independently by every kernel task, and they all edit the same
/// underlying tables. Keyed by root physical address, so a second handle
/// to an already-known root picks up the existing bookkeeping instead of
/// starting from an empty set that would no longer match reality.
#[cfg(feature = "alloc")]
static SPACE_REGISTRY: Mutex<BTreeMap<u64, Arc<Mutex<BTreeSet<u64>>>>> = Mutex::new(BTreeMap::new());

#[cfg(feature = "alloc")]
fn bitset_for_root(root_phys: u64) -> Arc<Mutex<BTreeSet<u64>>> {
    SPACE_REGISTRY
        .lock()
        .entry(root_phys)
        .or_insert_with(|| Arc::new(Mutex::new(BTreeSet::new())))
        .clone()
}

#[cfg(feature = "alloc")]
fn forget_root(root_phys: u64) {
    SPACE_REGISTRY.lock().remove(&root_phys);
}

/// An address space: a page-table root plus the bookkeeping needed to find
/// free virtual regions and to tear the hierarchy down later.
pub struct AddressSpace {
    root_phys: PhysicalAddress,
    #[cfg(feature = "alloc")]
    allocated_virtual_pages: Arc<Mutex<BTreeSet<u64>>>,
}

impl AddressSpace {
    /// Wrap the page-table root currently loaded into `cr3`, i.e. the
    /// address space this code is presently running under. Every call for
    /// the same root shares one bookkeeping set (see [`SPACE_REGISTRY`]).
    pub fn current() -> Self {
        let (frame, _) = Cr3::read();
        let root_phys = frame.start_address().as_u64();
        Self {
            root_phys: PhysicalAddress::new(root_phys),
            #[cfg(feature = "alloc")]
            allocated_virtual_pages: bitset_for_root(root_phys),
        }
    }

    pub fn root_phys(&self) -> PhysicalAddress {
        self.root_phys
    }

    fn is_active(&self) -> bool {
        Cr3::read().0.start_address().as_u64() == self.root_phys.as_u64()
    }

    fn pml4(&self) -> TableView {
        if self.is_active() {
            TableView::SelfMapped(self_map_pml4_addr())
        } else {
            TableView::Temp(TempMapGuard::map(self.root_phys))
        }
    }

    /// Fetch (creating if absent and `create`) the table one level below
    /// `parent`'s entry `index`, returning a view onto it.
    fn descend(&self, parent: &TableView, index: usize, create: bool) -> Result<TableView, KernelError> {
        let entry_frame = parent.table()[index].frame();
        let child_phys = match entry_frame {
            Some(f) => PhysicalAddress::new(f.addr()),
            None if create => {
                let frame = FRAME_ALLOCATOR
                    .alloc()
                    .map_err(|_| KernelError::OutOfFrames)?;
                parent.table()[index].set(frame, PageFlags::KERNEL_DATA | PageFlags::USER);
                PhysicalAddress::new(frame.addr())
            }
            None => return Err(KernelError::UnmappedMemory { addr: index << 12 }),
        };

        let view = if self.is_active() {
            // Active self-map windows are only valid for tables reachable
            // from the currently loaded PML4; since `parent` already is
            // one, the just-created or just-found child is too.
            TableView::SelfMapped(child_phys.as_u64())
        } else {
            TableView::Temp(TempMapGuard::map(child_phys))
        };

        if entry_frame.is_none() {
            view.table().zero();
        }
        Ok(view)
    }

    /// Walk PML4 -> PDPT -> PD -> PT for `vaddr`, creating intermediate
    /// tables as needed when `create` is set, and hand the leaf entry to
    /// `f`.
    fn with_leaf_entry<R>(
        &self,
        vaddr: u64,
        create: bool,
        f: impl FnOnce(&mut super::page_table::PageTableEntry) -> R,
    ) -> Result<R, KernelError> {
        let (i4, i3, i2, i1, _) = vaddr_indices(vaddr);
        let pml4 = self.pml4();
        let pdpt = self.descend(&pml4, i4, create)?;
        let pd = self.descend(&pdpt, i3, create)?;
        let pt = self.descend(&pd, i2, create)?;
        Ok(f(&mut pt.table()[i1]))
    }

    /// `map_virt_to_phys`: install a leaf mapping. Refuses to overwrite an
    /// existing present leaf.
    pub fn map_virt_to_phys(
        &self,
        vaddr: u64,
        paddr: u64,
        flags: PageFlags,
    ) -> Result<(), KernelError> {
        self.with_leaf_entry(vaddr, true, |entry| {
            if entry.is_present() {
                return Err(KernelError::AlreadyMapped { addr: vaddr as usize });
            }
            entry.set_addr(PhysicalAddress::new(paddr), flags | PageFlags::PRESENT);
            Ok(())
        })??;

        #[cfg(feature = "alloc")]
        self.allocated_virtual_pages.lock().insert(vaddr / FRAME_SIZE as u64);
        Ok(())
    }

    /// `map_virt`: allocate one physical frame and map it at `vaddr`.
    pub fn map_virt(&self, vaddr: u64, flags: PageFlags) -> Result<(), KernelError> {
        let frame = FRAME_ALLOCATOR.alloc().map_err(|_| KernelError::OutOfFrames)?;
        self.map_virt_to_phys(vaddr, frame.addr(), flags)
    }

    /// `find_free_region`: linear search of the allocated-virtual-pages set
    /// for `size` contiguous unclaimed pages at or above `min_addr`.
    #[cfg(feature = "alloc")]
    pub fn find_free_region(&self, size: usize, min_addr: u64) -> Option<u64> {
        let pages_needed = size.div_ceil(FRAME_SIZE);
        let allocated = self.allocated_virtual_pages.lock();
        let mut candidate = min_addr / FRAME_SIZE as u64;
        loop {
            let upper_half = candidate >> 39 >= KERNEL_SPLIT_INDEX as u64;
            if upper_half {
                return None; // ran into the kernel half without finding room
            }
            let mut ok = true;
            for p in candidate..candidate + pages_needed as u64 {
                if allocated.contains(&p) {
                    ok = false;
                    candidate = p + 1;
                    break;
                }
            }
            if ok {
                return Some(candidate * FRAME_SIZE as u64);
            }
        }
    }

    /// `alloc_range`: choose a free virtual range at or above `vaddr_hint`,
    /// allocate frames, and install mappings.
    #[cfg(feature = "alloc")]
    pub fn alloc_range(&self, vaddr_hint: u64, size: usize, flags: PageFlags) -> Result<u64, KernelError> {
        let base = self
            .find_free_region(size, vaddr_hint)
            .ok_or(KernelError::AddressSpaceExhausted { size })?;
        let pages = size.div_ceil(FRAME_SIZE);
        for i in 0..pages {
            self.map_virt(base + (i * FRAME_SIZE) as u64, flags)?;
        }
        Ok(base)
    }

    /// `unmap_range`: clear leaves across `[vaddr, vaddr+size)`. Does NOT
    /// free the backing frames — that is caller policy.
    pub fn unmap_range(&self, vaddr: u64, size: usize) -> Result<(), KernelError> {
        let pages = size.div_ceil(FRAME_SIZE);
        for i in 0..pages {
            let page_vaddr = vaddr + (i * FRAME_SIZE) as u64;
            let _ = self.with_leaf_entry(page_vaddr, false, |entry| {
                entry.clear();
            });
            #[cfg(feature = "alloc")]
            self.allocated_virtual_pages.lock().remove(&(page_vaddr / FRAME_SIZE as u64));
            x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(page_vaddr));
        }
        Ok(())
    }

    /// Install the self-map slot and copy the kernel half's PML4 entries
    /// from the currently active space. Used both to bootstrap the very
    /// first address space and to build every subsequent one.
    fn new_with_kernel_half(kernel_source: &AddressSpace) -> Result<Self, KernelError> {
        let root_frame = FRAME_ALLOCATOR.alloc().map_err(|_| KernelError::OutOfFrames)?;
        let root_phys = root_frame.addr();
        let space = Self {
            root_phys: PhysicalAddress::new(root_phys),
            #[cfg(feature = "alloc")]
            allocated_virtual_pages: bitset_for_root(root_phys),
        };

        {
            let view = TempMapGuard::map(space.root_phys);
            view.table().zero();
            view.table()[SELF_MAP_INDEX]
                .set(root_frame, PageFlags::PRESENT | PageFlags::WRITABLE);

            let kernel_pml4 = kernel_source.pml4();
            for i in KERNEL_SPLIT_INDEX..PAGE_TABLE_ENTRIES {
                if i == SELF_MAP_INDEX {
                    continue;
                }
                view.table()[i] = kernel_pml4.table()[i];
            }
        }

        Ok(space)
    }

    /// `clone(source) -> copy`: deep-copy the user half's leaf mappings,
    /// eagerly duplicating the backing frames (no copy-on-write); link the
    /// kernel half by value so every address space shares the same kernel
    /// mappings. `self` must be the address space being cloned (typically
    /// the currently running task's own space).
    #[cfg(feature = "alloc")]
    pub fn clone_address_space(&self) -> Result<Self, KernelError> {
        let copy = Self::new_with_kernel_half(self)?;

        let pages: alloc::vec::Vec<u64> = self.allocated_virtual_pages.lock().iter().copied().collect();
        for page in pages {
            let vaddr = page * FRAME_SIZE as u64;
            if vaddr >> 39 >= KERNEL_SPLIT_INDEX as u64 {
                continue; // kernel half already linked
            }
            let src_flags = self.with_leaf_entry(vaddr, false, |e| e.flags())?;
            let new_frame = FRAME_ALLOCATOR.alloc().map_err(|_| KernelError::OutOfFrames)?;

            // SAFETY: `vaddr` is present in `self` (it came from the
            // allocated-pages set) and `self` is the active space, so this
            // pointer is valid for a 4 KiB read for the duration of the copy.
            let src: &[u8; FRAME_SIZE] = unsafe { &*(vaddr as *const [u8; FRAME_SIZE]) };
            {
                let dst_view = TempMapGuard::map(PhysicalAddress::new(new_frame.addr()));
                let dst = dst_view.table() as *mut PageTable as *mut [u8; FRAME_SIZE];
                // SAFETY: `dst_view` holds an exclusive temp-map window onto
                // `new_frame`, sized exactly FRAME_SIZE.
                unsafe { (*dst).copy_from_slice(src) };
            }

            copy.map_virt_to_phys(vaddr, new_frame.addr(), src_flags)?;
        }

        Ok(copy)
    }

    /// `destroy`: walk non-kernel tables, free every leaf frame via the
    /// PFA, then free the table frames, then the top-level table. Kernel
    /// half tables are left untouched.
    #[cfg(feature = "alloc")]
    pub fn destroy(self) {
        let pages: alloc::vec::Vec<u64> = self.allocated_virtual_pages.lock().iter().copied().collect();
        for page in pages {
            let vaddr = page * FRAME_SIZE as u64;
            if let Ok(Some(frame)) = self.with_leaf_entry(vaddr, false, |e| e.frame()) {
                FRAME_ALLOCATOR.free(frame);
            }
        }

        let freed = free_user_page_table_frames(self.root_phys.as_u64());
        forget_root(self.root_phys.as_u64());
        log::debug!("vasm: destroyed address space, freed {} table frames", freed);
    }
}

/// Free every user-half (PML4 indices `0..KERNEL_SPLIT_INDEX`) page table
/// frame reachable from `l4_phys`, then the L4 frame itself. Kernel-half
/// entries are shared across every address space and are left alone.
/// Returns the number of frames freed.
fn free_user_page_table_frames(l4_phys: u64) -> usize {
    let mut freed = 0usize;
    let l4_view = TempMapGuard::map(PhysicalAddress::new(l4_phys));

    for i4 in 0..KERNEL_SPLIT_INDEX {
        let Some(l3_frame) = l4_view.table()[i4].frame() else { continue };
        {
            let l3_view = TempMapGuard::map(PhysicalAddress::new(l3_frame.addr()));
            for i3 in 0..PAGE_TABLE_ENTRIES {
                let Some(l2_frame) = l3_view.table()[i3].frame() else { continue };
                {
                    let l2_view = TempMapGuard::map(PhysicalAddress::new(l2_frame.addr()));
                    for i2 in 0..PAGE_TABLE_ENTRIES {
                        if let Some(l1_frame) = l2_view.table()[i2].frame() {
                            FRAME_ALLOCATOR.free(l1_frame);
                            freed += 1;
                        }
                    }
                }
                FRAME_ALLOCATOR.free(l2_frame);
                freed += 1;
            }
        }
        FRAME_ALLOCATOR.free(l3_frame);
        freed += 1;
    }

    drop(l4_view);
    FRAME_ALLOCATOR.free(FrameNumber::new(l4_phys / FRAME_SIZE as u64));
    freed += 1;
    freed
}

/// Bootstrap the very first address space from the page tables the
/// bootloader handed the kernel, installing the self-map slot into the
/// live hierarchy. After this call, `AddressSpace::current()` uses the
/// self-map fast path everywhere.
pub fn init() {
    let (frame, _) = Cr3::read();
    let root = PhysicalAddress::new(frame.start_address().as_u64());
    log::info!("vasm: bootstrap address space root at {:#x}", root.as_u64());

    // The bootloader's own tables do not yet carry a self-map slot. Reach
    // the root table once via the bootloader's physical-memory-offset
    // mapping and install the slot directly; every subsequent access goes
    // through the self-map this creates.
    let phys_mem_offset = crate::boot_info::get().physical_memory_offset;
    // SAFETY: `bootloader_api` maps all physical memory at `phys_mem_offset`
    // before the kernel entry point runs; this executes once, with
    // interrupts disabled, before any task or temp-map user exists.
    let table = unsafe { &mut *((phys_mem_offset + root.as_u64()) as *mut PageTable) };
    table[SELF_MAP_INDEX].set(
        FrameNumber::new(root.as_u64() / FRAME_SIZE as u64),
        PageFlags::PRESENT | PageFlags::WRITABLE,
    );
}
