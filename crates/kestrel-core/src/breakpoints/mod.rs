//! Breakpoint bookkeeping and installation.
//!
//! Three independent mechanisms, each with its own table owned by the
//! [`Engine`](crate::engine::Engine):
//!
//! - [`software`]: `INT3` opcode patches, keyed by address
//! - [`hardware`]: DR0-DR3 slots mirrored into every thread, keyed by slot
//! - [`guard`]: `PAGE_GUARD` page ranges, keyed by start address
//!
//! The tables are plain data. Installing, removing and hit handling live in
//! `impl Engine` blocks next to each table, since they need the native API
//! and the session.

pub mod builder;
pub mod guard;
pub mod hardware;
pub mod software;

pub use builder::HardwareBreakpointBuilder;
pub use guard::{MemoryBreakpoint, MemoryBreakpoints};
pub use hardware::{ApplyReport, HardwareBreakpoint, HardwareBreakpoints};
pub use software::{SoftwareBreakpoint, SoftwareBreakpoints, TRAP_OPCODE};
