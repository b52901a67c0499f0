//! Crate-wide error taxonomy.
//!
//! Scoped to what the four core subsystems (PFA, VASM, scheduler, AMC) can
//! actually fail with. Resource exhaustion is returned as `Err`; protocol
//! violations (bad boot info, name collisions, a double self-map slot) panic
//! through the existing panic handler instead of round-tripping through here.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Physical frame allocator exhausted its accessible region.
    OutOfFrames,
    /// A physical frame was allocated twice without an intervening free.
    DoubleAlloc { frame: u64 },
    /// `alloc_contiguous` could not find `count` adjacent free frames.
    NoContiguousRun { count: usize },
    /// A virtual or physical address fell outside an expected range.
    InvalidAddress { addr: usize },
    /// A page table walk reached a not-present entry where a mapping was
    /// expected.
    UnmappedMemory { addr: usize },
    /// A virtual page was mapped twice without an intervening unmap.
    AlreadyMapped { addr: usize },
    /// The virtual address space has no remaining region of the requested
    /// size.
    AddressSpaceExhausted { size: usize },
    /// General allocator exhaustion (kernel heap, VASM bookkeeping).
    OutOfMemory { requested: usize, available: usize },

    /// No task exists with the given id.
    TaskNotFound { id: u64 },
    /// An operation was attempted from a task state that doesn't allow it
    /// (e.g. unblocking an already-runnable task).
    InvalidState { expected: &'static str, actual: &'static str },

    /// IPC-specific failures, see [`IpcError`].
    Ipc(IpcError),
    /// Scheduler-specific failures, see [`SchedError`].
    Sched(SchedError),

    /// A subsystem was used before its `init()` ran.
    NotInitialized { subsystem: &'static str },
    /// Legacy string error for gradual migration from &'static str patterns.
    LegacyError { message: &'static str },
}

/// AMC-specific errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// A service name failed validation (empty, too long, non-printable).
    InvalidServiceName,
    /// The registering task already owns a service.
    TaskAlreadyHasService,
    /// A service tried to register a name already held by another service.
    NameAlreadyRegistered,
    /// A message was addressed to a name with no registered service.
    UnknownDestination,
    /// A message body exceeded the maximum inline payload size.
    BodyTooLarge { size: usize, max: usize },
    /// A destination's delivery pool is full.
    InboxFull { capacity: usize },
    /// The pending-to-unknown queue for a destination is full.
    PendingPoolFull { capacity: usize },
    /// `shared_memory_create`'s peer service does not exist.
    PeerMissing,
    /// A shared-memory region's two peers disagree on region identity.
    SharedMemoryPeerMismatch,
    /// No shared-memory region exists with the given identity.
    SharedMemoryNotFound,
    /// `launch_service` named something outside the built-in allow-list.
    UnknownService,
}

/// Scheduler-specific errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// `unblock` was called on a task that wasn't blocked.
    NotBlocked { id: u64 },
    /// `spawn` failed to allocate a kernel stack or task structure.
    SpawnFailed,
    /// A priority class value outside `Idle..=Kernel` was used.
    InvalidPriority { priority: u8 },
}

pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfFrames => write!(f, "physical frame allocator exhausted"),
            Self::DoubleAlloc { frame } => write!(f, "frame {:#x} already allocated", frame),
            Self::NoContiguousRun { count } => {
                write!(f, "no contiguous run of {} frames available", count)
            }
            Self::InvalidAddress { addr } => write!(f, "invalid address: {:#x}", addr),
            Self::UnmappedMemory { addr } => write!(f, "unmapped memory at {:#x}", addr),
            Self::AlreadyMapped { addr } => write!(f, "address {:#x} already mapped", addr),
            Self::AddressSpaceExhausted { size } => {
                write!(f, "no free virtual region of size {:#x}", size)
            }
            Self::OutOfMemory { requested, available } => write!(
                f,
                "out of memory: requested {} bytes, {} available",
                requested, available
            ),
            Self::TaskNotFound { id } => write!(f, "task {} not found", id),
            Self::InvalidState { expected, actual } => {
                write!(f, "invalid state: expected {}, got {}", expected, actual)
            }
            Self::Ipc(e) => write!(f, "ipc error: {:?}", e),
            Self::Sched(e) => write!(f, "scheduler error: {:?}", e),
            Self::NotInitialized { subsystem } => {
                write!(f, "subsystem not initialized: {}", subsystem)
            }
            Self::LegacyError { message } => write!(f, "{}", message),
        }
    }
}

impl From<IpcError> for KernelError {
    fn from(err: IpcError) -> Self {
        Self::Ipc(err)
    }
}

impl From<SchedError> for KernelError {
    fn from(err: SchedError) -> Self {
        Self::Sched(err)
    }
}

/// Conversion from legacy &'static str errors to KernelError, for gradual
/// migration from string-based error returns.
impl From<&'static str> for KernelError {
    fn from(msg: &'static str) -> Self {
        Self::LegacyError { message: msg }
    }
}

#[macro_export]
macro_rules! kernel_error {
    (TaskNotFound { id: $id:expr }) => {
        $crate::error::KernelError::TaskNotFound { id: $id }
    };
    (InvalidAddress { addr: $addr:expr }) => {
        $crate::error::KernelError::InvalidAddress { addr: $addr }
    };
    ($variant:ident) => {
        $crate::error::KernelError::$variant
    };
}
