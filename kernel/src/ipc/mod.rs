//! Asynchronous Message Channel (AMC) IPC (spec 4.E): named services, FIFO
//! inboxes, per-service delivery pools, and shared-memory regions.

pub mod error;
pub mod message;
pub mod registry;
pub mod shared_memory;

pub use error::{IpcError, Result};
pub use message::{Message, ServiceName, MAX_BODY_LEN, SERVICE_NAME_MAX_LEN};
pub use registry::AwaitFilter;
pub use shared_memory::SharedMemoryRegion;

/// Bring up the AMC registry. Must run after [`crate::sched::init`]: the
/// registry's bookkeeping is keyed by task id.
pub fn init() {
    registry::init();
    log::info!("amc: registry initialized");
}
