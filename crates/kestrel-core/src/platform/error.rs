//! # Platform Errors
//!
//! Every native call that can fail reports the platform's last-error code.
//! [`OsError`] keeps that code together with the name of the call, and is
//! attached as the `#[source]` of the matching [`crate::error::DebuggerError`]
//! variant.

use thiserror::Error;

/// `ERROR_ACCESS_DENIED`
pub const ERROR_ACCESS_DENIED: u32 = 5;
/// `ERROR_INVALID_HANDLE`
pub const ERROR_INVALID_HANDLE: u32 = 6;
/// `ERROR_INVALID_PARAMETER`
pub const ERROR_INVALID_PARAMETER: u32 = 87;
/// `ERROR_PARTIAL_COPY`: only part of a `ReadProcessMemory`/`WriteProcessMemory` completed
pub const ERROR_PARTIAL_COPY: u32 = 299;
/// `ERROR_NOACCESS`: invalid access to a memory location
pub const ERROR_NOACCESS: u32 = 998;

/// A failed native call and the last-error code it left behind.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{call} failed: {} (error {code})", describe_code(.code))]
pub struct OsError
{
    /// Native function that failed, e.g. `"ReadProcessMemory"`
    pub call: &'static str,
    /// Value of `GetLastError()` after the failure
    pub code: u32,
}

impl OsError
{
    #[must_use]
    pub const fn new(call: &'static str, code: u32) -> Self
    {
        Self { call, code }
    }
}

/// Short description for the error codes a debugger commonly meets.
fn describe_code(code: &u32) -> &'static str
{
    match *code {
        ERROR_ACCESS_DENIED => "access denied",
        ERROR_INVALID_HANDLE => "invalid handle",
        ERROR_INVALID_PARAMETER => "invalid parameter",
        ERROR_PARTIAL_COPY => "partial copy",
        ERROR_NOACCESS => "invalid memory access",
        _ => "system error",
    }
}
