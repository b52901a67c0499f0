//! AMC result alias.
//!
//! The actual error variants live in [`crate::error::IpcError`] alongside
//! the rest of the kernel's error taxonomy; this module exists so that
//! `ipc::*` call sites can write `ipc::error::Result<T>` the way the other
//! subsystems write their local `Result` aliases.

pub use crate::error::IpcError;

pub type Result<T> = core::result::Result<T, IpcError>;
