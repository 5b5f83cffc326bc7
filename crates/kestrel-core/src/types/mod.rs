//! # Types
//!
//! Small value types shared by every engine component.

pub mod address;
pub mod process;

// Re-export all public types
pub use address::Address;
pub use process::{ProcessId, ThreadId};
