//! RAII wrappers for kernel resources.
//!
//! Ensures frames and locks are released on every exit path, including
//! panics that unwind through a guard's scope.

use core::ops::{Deref, DerefMut};

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::vec::Vec;

use spin::MutexGuard;

use crate::mm::frame_allocator::{FrameAllocator, PhysicalFrame};

/// RAII wrapper for a single physical frame. Returns it to the allocator on
/// drop unless `leak`ed.
pub struct FrameGuard {
    frame: PhysicalFrame,
    allocator: &'static FrameAllocator,
}

impl FrameGuard {
    pub fn new(frame: PhysicalFrame, allocator: &'static FrameAllocator) -> Self {
        Self { frame, allocator }
    }

    pub fn addr(&self) -> usize {
        self.frame.addr()
    }

    /// Release ownership of the frame without deallocating it.
    pub fn leak(self) -> PhysicalFrame {
        let frame = self.frame;
        core::mem::forget(self);
        frame
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        // SAFETY: this guard is the sole owner of `self.frame`; dropping it
        // is the one place that relinquishes that ownership.
        unsafe {
            self.allocator.free_frame(self.frame);
        }
    }
}

impl Deref for FrameGuard {
    type Target = PhysicalFrame;

    fn deref(&self) -> &Self::Target {
        &self.frame
    }
}

/// RAII wrapper for a contiguous run of physical frames, as returned by
/// `alloc_contiguous`.
#[cfg(feature = "alloc")]
pub struct FramesGuard {
    frames: Vec<PhysicalFrame>,
    allocator: &'static FrameAllocator,
}

#[cfg(feature = "alloc")]
impl FramesGuard {
    pub fn new(frames: Vec<PhysicalFrame>, allocator: &'static FrameAllocator) -> Self {
        Self { frames, allocator }
    }

    pub fn leak(self) -> Vec<PhysicalFrame> {
        let frames = self.frames.clone();
        core::mem::forget(self);
        frames
    }
}

#[cfg(feature = "alloc")]
impl Drop for FramesGuard {
    fn drop(&mut self) {
        for frame in &self.frames {
            // SAFETY: this guard is the sole owner of every frame in
            // `self.frames`.
            unsafe {
                self.allocator.free_frame(*frame);
            }
        }
    }
}

/// RAII lock guard that logs acquisition and release, for diagnosing lock
/// ordering issues across the PFA / VASM / scheduler / AMC boundary.
pub struct TrackedMutexGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    name: &'static str,
}

impl<'a, T> TrackedMutexGuard<'a, T> {
    pub fn new(guard: MutexGuard<'a, T>, name: &'static str) -> Self {
        log::trace!("lock acquired: {}", name);
        Self { guard, name }
    }
}

impl<T> Drop for TrackedMutexGuard<'_, T> {
    fn drop(&mut self) {
        log::trace!("lock released: {}", self.name);
    }
}

impl<T> Deref for TrackedMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T> DerefMut for TrackedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

/// Macro to create a scope guard that runs an expression when the current
/// scope exits, including via early return or panic unwind.
#[macro_export]
macro_rules! defer {
    ($e:expr) => {
        let _guard = $crate::raii::ScopeGuard::new(|| $e);
    };
}

/// Generic scope guard that runs cleanup code on drop unless cancelled.
pub struct ScopeGuard<F: FnOnce()> {
    cleanup: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub fn new(cleanup: F) -> Self {
        Self { cleanup: Some(cleanup) }
    }

    /// Cancel the cleanup, e.g. once an operation has committed and the
    /// rollback this guard holds is no longer wanted.
    pub fn cancel(mut self) {
        self.cleanup = None;
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_guard_runs_on_drop() {
        let mut cleaned = false;
        {
            let _guard = ScopeGuard::new(|| {
                cleaned = true;
            });
        }
        assert!(cleaned);
    }

    #[test]
    fn scope_guard_cancel_suppresses_cleanup() {
        let mut cleaned = false;
        {
            let guard = ScopeGuard::new(|| {
                cleaned = true;
            });
            guard.cancel();
        }
        assert!(!cleaned);
    }

    #[test]
    fn frame_guard_frees_on_drop() {
        use crate::mm::frame_allocator::{FrameAllocator, PhysicalAddress, PhysicalFrame};

        static ALLOC: FrameAllocator = FrameAllocator::new();
        ALLOC.mark_accessible(PhysicalAddress::new(0), 0x1000);
        let frame = ALLOC.alloc().unwrap();
        {
            let _guard = FrameGuard::new(PhysicalFrame::new(frame), &ALLOC);
        }
        // frame is free again after the guard drops
        assert_eq!(ALLOC.alloc(), Ok(frame));
    }
}
