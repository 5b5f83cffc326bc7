//! # kestrel-core
//!
//! User-mode debugger engine for Windows x86/x64 targets.
//!
//! This crate provides:
//! - Process control: launch under the debugger, attach, detach
//! - The debug event loop and exception dispatcher
//! - Software breakpoints (`INT3` patches with step-over)
//! - Hardware breakpoints (DR0-DR3, mirrored into every thread)
//! - Memory breakpoints (guard pages, re-armed after each hit)
//! - Target memory and thread context access
//!
//! ## Platform Support
//!
//! - **Windows**: [`platform::windows::WindowsApi`] over the Win32 debug API
//! - Everything else compiles on any platform; the engine is generic over
//!   [`platform::DebugApi`] and its tests run against an in-memory backend.
//!
//! ## Why unsafe code is needed
//!
//! The Windows backend calls Win32 functions through the `windows` crate,
//! all of which are `unsafe`. They are wrapped in the safe `DebugApi`
//! methods; nothing above the platform module uses `unsafe`.

#![allow(unsafe_code)] // Required for the Win32 debug API

pub mod breakpoints;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod memory;
pub mod platform;
pub mod registers;
pub mod session;
pub mod threads;
pub mod types;

pub use config::{ApplyPolicy, EngineConfig};
pub use engine::Engine;
// Re-export commonly used types
pub use error::{DebuggerError, Result};
pub use events::{EngineEvent, ExceptionKind};
pub use platform::{ContinueStatus, DebugApi};
pub use types::{Address, ProcessId, ThreadId};
