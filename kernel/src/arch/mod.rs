//! Architecture support. This core targets x86_64 only (spec section 1:
//! GDT/TSS and interrupt dispatch are specified only where the core touches
//! them).

pub mod context;
pub mod x86_64;

pub use context::ArchThreadContext;
pub use x86_64::*;
