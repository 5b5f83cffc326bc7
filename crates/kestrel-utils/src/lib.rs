//! # Kestrel Utilities
//!
//! Shared utilities and logging setup for the kestrel debugger engine.
//!
//! The engine itself only emits `tracing` events; embedding applications and
//! the integration tests call into this crate to install a subscriber.

pub mod logging;

// Re-export commonly used logging functions for convenience
pub use logging::{init_logging, init_logging_with_level, LogFormat, LogLevel, LoggingError, LoggingGuard};
pub use tracing::{debug, error, info, trace, warn};
