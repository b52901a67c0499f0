//! Physical Frame Allocator (PFA).
//!
//! Tracks which 4 KiB physical frames are free using two parallel bitsets:
//! `accessible` (frame lies in usable RAM) and `allocated` (frame is
//! currently owned by some caller). A frame is a candidate for `alloc` iff
//! its `accessible` bit is set and its `allocated` bit is clear.
//!
//! Both bitsets live behind a single spinlock; every public entry point
//! takes that lock for its whole duration.

#![allow(dead_code)]

use spin::Mutex;

use crate::raii::{FrameGuard, FramesGuard};

#[cfg(feature = "alloc")]
extern crate alloc;
#[cfg(feature = "alloc")]
use alloc::vec::Vec;

/// Size of a physical frame.
pub const FRAME_SIZE: usize = 4096;

/// Physical frame number (physical address >> 12).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameNumber(u64);

impl FrameNumber {
    pub const fn new(num: u64) -> Self {
        Self(num)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn addr(&self) -> u64 {
        self.0 * FRAME_SIZE as u64
    }
}

/// Physical memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(pub u64);

impl PhysicalAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn frame(&self) -> FrameNumber {
        FrameNumber::new(self.0 / FRAME_SIZE as u64)
    }
}

/// A physical frame handed out by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalFrame {
    number: FrameNumber,
}

impl PhysicalFrame {
    pub const fn new(number: FrameNumber) -> Self {
        Self { number }
    }

    pub const fn number(&self) -> FrameNumber {
        self.number
    }

    pub const fn addr(&self) -> usize {
        self.number.addr() as usize
    }
}

/// Errors the PFA's public operations can fail with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PfaError {
    /// No accessible-and-free frame remains.
    OutOfFrames,
    /// `alloc_address` targeted a frame that was already allocated.
    DoubleAlloc { frame: u64 },
    /// `alloc_contiguous` could not find a run of the requested length.
    NoContiguousRun { count: usize },
}

/// Maximum number of physical frames tracked. Covers 64 GiB of physical
/// address space, matching the largest RAM map this core is expected to
/// boot on; `init` only marks the portion the boot-info map reports as
/// usable.
const MAX_FRAMES: usize = 64 * 1024 * 1024 * 1024 / FRAME_SIZE;
const BITSET_WORDS: usize = MAX_FRAMES / 64;

/// A fixed-size bitset over `MAX_FRAMES` frames, backed by a boxed array so
/// the ~2 MiB of bitset storage does not live on the stack.
struct FrameBitset {
    #[cfg(feature = "alloc")]
    words: alloc::boxed::Box<[u64; BITSET_WORDS]>,
    #[cfg(not(feature = "alloc"))]
    words: [u64; 0],
}

impl FrameBitset {
    #[cfg(feature = "alloc")]
    fn new() -> Self {
        Self {
            words: alloc::boxed::Box::new([0u64; BITSET_WORDS]),
        }
    }

    #[cfg(not(feature = "alloc"))]
    fn new() -> Self {
        Self { words: [] }
    }

    #[inline]
    fn get(&self, frame: u64) -> bool {
        #[cfg(feature = "alloc")]
        {
            let idx = frame as usize / 64;
            let bit = frame as usize % 64;
            idx < self.words.len() && (self.words[idx] >> bit) & 1 != 0
        }
        #[cfg(not(feature = "alloc"))]
        {
            let _ = frame;
            false
        }
    }

    #[inline]
    fn set(&mut self, frame: u64, value: bool) {
        #[cfg(feature = "alloc")]
        {
            let idx = frame as usize / 64;
            let bit = frame as usize % 64;
            if idx >= self.words.len() {
                return;
            }
            if value {
                self.words[idx] |= 1 << bit;
            } else {
                self.words[idx] &= !(1 << bit);
            }
        }
        #[cfg(not(feature = "alloc"))]
        {
            let _ = (frame, value);
        }
    }

    fn set_range(&mut self, start: u64, count: u64, value: bool) {
        for f in start..start.saturating_add(count) {
            self.set(f, value);
        }
    }
}

/// The allocator state: two bitsets over the same frame-number domain.
pub struct FrameAllocator {
    accessible: Mutex<Option<FrameBitset>>,
    allocated: Mutex<Option<FrameBitset>>,
    highest_frame: core::sync::atomic::AtomicU64,
}

impl FrameAllocator {
    pub const fn new() -> Self {
        Self {
            accessible: Mutex::new(None),
            allocated: Mutex::new(None),
            highest_frame: core::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Lazily materialize the bitsets on first use. Called under the
    /// allocator's own locks, so callers never race this.
    fn ensure_init(&self) {
        let mut acc = self.accessible.lock();
        if acc.is_none() {
            *acc = Some(FrameBitset::new());
        }
        drop(acc);
        let mut alloc_set = self.allocated.lock();
        if alloc_set.is_none() {
            *alloc_set = Some(FrameBitset::new());
        }
    }

    /// Mark `[start, start+size)` (in bytes) as usable RAM. Idempotent:
    /// reserving the same or an overlapping range twice is harmless.
    pub fn mark_accessible(&self, start: PhysicalAddress, size: u64) {
        self.ensure_init();
        let start_frame = start.frame().as_u64();
        let count = size.div_ceil(FRAME_SIZE as u64);
        self.accessible.lock().as_mut().unwrap().set_range(start_frame, count, true);
        let top = start_frame + count;
        self.highest_frame.fetch_max(top, core::sync::atomic::Ordering::Relaxed);
    }

    /// `reserve(start, size)`: remove a region from `accessible`. Idempotent.
    pub fn reserve(&self, start: PhysicalAddress, size: u64) {
        self.ensure_init();
        let start_frame = start.frame().as_u64();
        let count = size.div_ceil(FRAME_SIZE as u64);
        self.accessible.lock().as_mut().unwrap().set_range(start_frame, count, false);
    }

    /// `alloc() -> frame`: first frame that is accessible and not allocated.
    pub fn alloc(&self) -> Result<FrameNumber, PfaError> {
        self.ensure_init();
        let acc = self.accessible.lock();
        let mut allocated = self.allocated.lock();
        let acc = acc.as_ref().unwrap();
        let allocated_bits = allocated.as_mut().unwrap();
        let top = self.highest_frame.load(core::sync::atomic::Ordering::Relaxed);
        for frame in 0..top {
            if acc.get(frame) && !allocated_bits.get(frame) {
                allocated_bits.set(frame, true);
                return Ok(FrameNumber::new(frame));
            }
        }
        Err(PfaError::OutOfFrames)
    }

    /// `alloc_address(frame)`: assert not-yet-allocated and mark allocated.
    pub fn alloc_address(&self, frame: FrameNumber) -> Result<(), PfaError> {
        self.ensure_init();
        let mut allocated = self.allocated.lock();
        let allocated_bits = allocated.as_mut().unwrap();
        if allocated_bits.get(frame.as_u64()) {
            return Err(PfaError::DoubleAlloc { frame: frame.as_u64() });
        }
        allocated_bits.set(frame.as_u64(), true);
        Ok(())
    }

    /// `alloc_contiguous(count) -> frame`: lowest-address run of `count`
    /// consecutive accessible-and-free frames, all marked allocated.
    pub fn alloc_contiguous(&self, count: usize) -> Result<FrameNumber, PfaError> {
        self.ensure_init();
        if count == 0 {
            return Ok(FrameNumber::new(0));
        }
        let acc = self.accessible.lock();
        let mut allocated = self.allocated.lock();
        let acc = acc.as_ref().unwrap();
        let allocated_bits = allocated.as_mut().unwrap();
        let top = self.highest_frame.load(core::sync::atomic::Ordering::Relaxed);

        let mut run_start = 0u64;
        let mut run_len = 0usize;
        for frame in 0..top {
            if acc.get(frame) && !allocated_bits.get(frame) {
                if run_len == 0 {
                    run_start = frame;
                }
                run_len += 1;
                if run_len == count {
                    for f in run_start..run_start + count as u64 {
                        allocated_bits.set(f, true);
                    }
                    return Ok(FrameNumber::new(run_start));
                }
            } else {
                run_len = 0;
            }
        }
        Err(PfaError::NoContiguousRun { count })
    }

    /// `free(frame)`: clear `allocated`. Panics if it was not set — a
    /// double-free is a protocol violation, not a recoverable error.
    pub fn free(&self, frame: FrameNumber) {
        self.ensure_init();
        let mut allocated = self.allocated.lock();
        let allocated_bits = allocated.as_mut().unwrap();
        assert!(
            allocated_bits.get(frame.as_u64()),
            "PFA: double free of frame {:#x}",
            frame.as_u64()
        );
        allocated_bits.set(frame.as_u64(), false);
    }

    /// Raw frame free used by `Drop` impls below, identical to `free` but
    /// named to match `FrameGuard`'s expectations.
    ///
    /// # Safety
    ///
    /// The caller must guarantee no other owner still believes it holds
    /// this frame.
    pub unsafe fn free_frame(&self, frame: PhysicalFrame) {
        self.free(frame.number());
    }

    #[cfg(feature = "alloc")]
    pub fn alloc_frame_raii(&'static self) -> Result<FrameGuard, PfaError> {
        let frame = self.alloc()?;
        Ok(FrameGuard::new(PhysicalFrame::new(frame), self))
    }

    #[cfg(feature = "alloc")]
    pub fn alloc_frames_raii(&'static self, count: usize) -> Result<FramesGuard, PfaError> {
        let start = self.alloc_contiguous(count)?;
        let mut frames = Vec::with_capacity(count);
        for i in 0..count as u64 {
            frames.push(PhysicalFrame::new(FrameNumber::new(start.as_u64() + i)));
        }
        Ok(FramesGuard::new(frames, self))
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// The single process-wide PFA instance.
pub static FRAME_ALLOCATOR: FrameAllocator = FrameAllocator::new();

/// Initialize the PFA from the normalized boot-info memory map, following
/// the reservation order the original implementation uses: usable regions
/// first, then the kernel image, the framebuffer, and the initrd. Reservations
/// are idempotent, so an overlap (e.g. the symbol table sitting inside the
/// kernel image) is harmless.
pub fn init(boot_info: &crate::boot_info::BootInfo) {
    use crate::boot_info::MemoryRegionType;

    for region in boot_info.mem_regions.iter() {
        if region.region_type == MemoryRegionType::Usable {
            FRAME_ALLOCATOR.mark_accessible(PhysicalAddress::new(region.start), region.len());
        }
    }

    FRAME_ALLOCATOR.reserve(
        PhysicalAddress::new(boot_info.kernel_image_start),
        boot_info.kernel_image_end - boot_info.kernel_image_start,
    );

    if let Some(fb) = &boot_info.framebuffer {
        FRAME_ALLOCATOR.reserve(PhysicalAddress::new(fb.phys_addr), fb.size as u64);
    }

    if let (Some(start), Some(end)) = (boot_info.initrd_start, boot_info.initrd_end) {
        FRAME_ALLOCATOR.reserve(PhysicalAddress::new(start), end - start);
    }

    log::info!(
        "pfa: initialized, highest frame tracked = {:#x}",
        FRAME_ALLOCATOR.highest_frame.load(core::sync::atomic::Ordering::Relaxed)
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> FrameAllocator {
        FrameAllocator::new()
    }

    #[test]
    fn s1_basic_frame_allocation() {
        let a = fresh();
        a.mark_accessible(PhysicalAddress::new(0x100000), 0x100000); // 256 frames
        let mut seen = Vec::new();
        for _ in 0..256 {
            seen.push(a.alloc().expect("frame available"));
        }
        assert_eq!(a.alloc(), Err(PfaError::OutOfFrames));

        let freed = seen[42];
        a.free(freed);
        assert_eq!(a.alloc(), Ok(freed));
    }

    #[test]
    fn reserve_then_alloc_never_returns_reserved() {
        let a = fresh();
        a.mark_accessible(PhysicalAddress::new(0), 0x10000); // 16 frames
        a.reserve(PhysicalAddress::new(0), 0x4000); // first 4 frames
        for _ in 0..12 {
            let f = a.alloc().unwrap();
            assert!(f.as_u64() >= 4);
        }
        assert_eq!(a.alloc(), Err(PfaError::OutOfFrames));
    }

    #[test]
    fn double_alloc_address_is_rejected() {
        let a = fresh();
        a.mark_accessible(PhysicalAddress::new(0), 0x1000);
        let frame = FrameNumber::new(0);
        a.alloc_address(frame).unwrap();
        assert_eq!(a.alloc_address(frame), Err(PfaError::DoubleAlloc { frame: 0 }));
    }

    #[test]
    fn contiguous_run_breaks_on_allocated_frame() {
        let a = fresh();
        a.mark_accessible(PhysicalAddress::new(0), 0x5000); // 5 frames
        a.alloc_address(FrameNumber::new(2)).unwrap();
        // Longest free run is frames 3-4 (len 2) since frame 2 is taken.
        assert_eq!(a.alloc_contiguous(3), Err(PfaError::NoContiguousRun { count: 3 }));
        let run = a.alloc_contiguous(2).unwrap();
        assert_eq!(run, FrameNumber::new(3));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn free_of_unallocated_frame_panics() {
        let a = fresh();
        a.mark_accessible(PhysicalAddress::new(0), 0x1000);
        a.free(FrameNumber::new(0));
    }
}
