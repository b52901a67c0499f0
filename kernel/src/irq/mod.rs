//! Driver-facing interrupt protocol (spec 4: interrupts are delivered to
//! driver tasks as a block/wake event, not a callback).
//!
//! A driver task calls [`register_driver`] once to claim an IRQ line, then
//! loops calling [`event_await`] to block until that line fires and
//! [`send_eoi`] once it has drained whatever the device handed it. The
//! arch-specific trap handler never runs driver code directly: it only calls
//! [`dispatch`], which wakes the owning task if it is currently waiting.

extern crate alloc;

use alloc::collections::BTreeMap;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::sched::{self, BlockReason, TaskId};
use crate::sync::once_lock::GlobalState;

/// IRQ line number (0-15 on the legacy PIC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IrqNumber(pub u8);

impl IrqNumber {
    pub const fn new(irq: u8) -> Self {
        Self(irq)
    }

    #[inline]
    pub fn as_u8(self) -> u8 {
        self.0
    }
}

impl From<u8> for IrqNumber {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl core::fmt::Display for IrqNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "IRQ#{}", self.0)
    }
}

const MAX_IRQ: u8 = 16;

struct IrqManager {
    owners: BTreeMap<u8, TaskId>,
    dispatch_count: u64,
}

impl IrqManager {
    fn new() -> Self {
        Self {
            owners: BTreeMap::new(),
            dispatch_count: 0,
        }
    }

    fn register(&mut self, irq: IrqNumber, owner: TaskId) -> KernelResult<()> {
        if irq.0 >= MAX_IRQ {
            return Err(KernelError::InvalidAddress { addr: irq.0 as usize });
        }
        if self.owners.contains_key(&irq.0) {
            return Err(KernelError::LegacyError {
                message: "IRQ line already has an owner",
            });
        }
        self.owners.insert(irq.0, owner);
        Ok(())
    }

    fn unregister(&mut self, irq: IrqNumber, owner: TaskId) -> KernelResult<()> {
        match self.owners.get(&irq.0) {
            Some(&current) if current == owner => {
                self.owners.remove(&irq.0);
                Ok(())
            }
            _ => Err(KernelError::TaskNotFound { id: owner.as_u64() }),
        }
    }

    fn owner(&self, irq: IrqNumber) -> Option<TaskId> {
        self.owners.get(&irq.0).copied()
    }
}

static IRQ_MANAGER: GlobalState<Mutex<IrqManager>> = GlobalState::new();

/// Initialize the IRQ manager. Must run after [`crate::arch::x86_64::init`].
pub fn init() -> KernelResult<()> {
    IRQ_MANAGER
        .init(Mutex::new(IrqManager::new()))
        .map_err(|_| KernelError::LegacyError {
            message: "IRQ manager already initialized",
        })?;
    log::info!("irq: manager initialized");
    Ok(())
}

fn with_manager<R>(f: impl FnOnce(&mut IrqManager) -> R) -> KernelResult<R> {
    IRQ_MANAGER
        .with_mut(|mtx| f(&mut mtx.lock()))
        .ok_or(KernelError::NotInitialized { subsystem: "irq" })
}

/// Claim `irq` for the calling task. Only one task may own a given line at
/// a time; the line is unmasked as soon as it has an owner.
pub fn register_driver(irq: IrqNumber) -> KernelResult<()> {
    let owner = sched::current_task_id().ok_or(KernelError::TaskNotFound { id: 0 })?;
    with_manager(|mgr| mgr.register(irq, owner))??;
    enable_irq(irq)?;
    log::debug!("irq: {} registered to {}", irq, owner);
    Ok(())
}

/// Release ownership of `irq`. Masks the line once released.
pub fn unregister_driver(irq: IrqNumber) -> KernelResult<()> {
    let owner = sched::current_task_id().ok_or(KernelError::TaskNotFound { id: 0 })?;
    with_manager(|mgr| mgr.unregister(irq, owner))??;
    disable_irq(irq)
}

/// Block the calling task until `irq` fires. The caller must already own
/// the line via [`register_driver`].
pub fn event_await(irq: IrqNumber) -> KernelResult<()> {
    let current = sched::current_task_id().ok_or(KernelError::TaskNotFound { id: 0 })?;
    let owns_line = with_manager(|mgr| mgr.owner(irq) == Some(current))?;
    if !owns_line {
        return Err(KernelError::TaskNotFound { id: current.as_u64() });
    }
    sched::block_on_interrupt(current, irq.as_u8())
}

/// Unmask `irq` on the hardware interrupt controller.
pub fn enable_irq(irq: IrqNumber) -> KernelResult<()> {
    crate::arch::x86_64::pic_unmask(irq.0);
    Ok(())
}

/// Mask `irq` on the hardware interrupt controller.
pub fn disable_irq(irq: IrqNumber) -> KernelResult<()> {
    crate::arch::x86_64::pic_mask(irq.0);
    Ok(())
}

/// Send end-of-interrupt for `irq`. Must be called once the driver task has
/// finished servicing the interrupt, per the ADI contract.
pub fn send_eoi(irq: IrqNumber) -> KernelResult<()> {
    crate::arch::x86_64::pic_eoi(irq.0);
    Ok(())
}

/// Wake the line's owner if it is currently blocked on it. Called from the
/// arch-specific trap handler; a no-op for unowned/spurious lines. Does not
/// send EOI -- that remains the owning task's job once it has serviced the
/// device, per the ADI contract.
pub fn dispatch(irq: IrqNumber) {
    let Some(owner) = IRQ_MANAGER
        .with_mut(|mtx| {
            let mut mgr = mtx.lock();
            mgr.dispatch_count += 1;
            mgr.owner(irq)
        })
        .flatten()
    else {
        return;
    };

    let is_waiting = sched::with_task(owner, |t| {
        t.blocked
            .map(|b| b.awaited_interrupt == Some(irq.as_u8()))
            .unwrap_or(false)
    })
    .unwrap_or(false);

    if is_waiting {
        let _ = sched::unblock(owner, BlockReason::AWAIT_INTERRUPT);
    }
}

/// Number of interrupts dispatched since init.
pub fn dispatch_count() -> u64 {
    IRQ_MANAGER
        .with(|mtx| mtx.lock().dispatch_count)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registering_twice_is_rejected() {
        let mut mgr = IrqManager::new();
        let a = TaskId::from_raw_for_test(1);
        let b = TaskId::from_raw_for_test(2);
        assert!(mgr.register(IrqNumber::new(4), a).is_ok());
        assert!(mgr.register(IrqNumber::new(4), b).is_err());
    }

    #[test]
    fn unregister_by_non_owner_fails() {
        let mut mgr = IrqManager::new();
        let a = TaskId::from_raw_for_test(1);
        let b = TaskId::from_raw_for_test(2);
        mgr.register(IrqNumber::new(4), a).unwrap();
        assert!(mgr.unregister(IrqNumber::new(4), b).is_err());
        assert!(mgr.unregister(IrqNumber::new(4), a).is_ok());
    }
}
