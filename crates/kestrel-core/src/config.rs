//! # Engine Configuration
//!
//! Policy knobs for the breakpoint managers. Defaults give the stronger
//! guarantees; every knob can be overridden programmatically or from the
//! environment.
//!
//! ## Environment Variables
//!
//! - `KESTREL_APPLY_POLICY`: `atomic` (default) or `best-effort`
//! - `KESTREL_HW_ONE_SHOT`: `true`/`false` (default `false`)
//! - `KESTREL_SW_STEP_OVER`: `true`/`false` (default `true`)
//! - `KESTREL_REARM_GUARDS`: `true`/`false` (default `true`)

use std::env;
use std::str::FromStr;

use crate::error::{DebuggerError, Result};

/// How multi-thread register updates and multi-page protection changes
/// react to a partial failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApplyPolicy
{
    /// Undo everything already applied and fail the operation.
    #[default]
    Atomic,
    /// Log the failure, keep going and record the breakpoint anyway.
    BestEffort,
}

impl FromStr for ApplyPolicy
{
    type Err = DebuggerError;

    fn from_str(s: &str) -> Result<Self>
    {
        match s.to_lowercase().as_str() {
            "atomic" | "strict" => Ok(Self::Atomic),
            "best-effort" | "best_effort" | "besteffort" => Ok(Self::BestEffort),
            _ => Err(DebuggerError::InvalidArgument(format!(
                "apply policy {s} (use 'atomic' or 'best-effort')"
            ))),
        }
    }
}

/// Engine behaviour settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig
{
    pub apply_policy: ApplyPolicy,
    /// Delete hardware breakpoints when they fire, unless overridden per breakpoint.
    pub hardware_one_shot: bool,
    /// Restore the original byte and single-step past a software breakpoint,
    /// then re-insert the trap.
    pub step_over_software_breakpoints: bool,
    /// Re-apply `PAGE_GUARD` after a guarded page has been hit.
    pub rearm_guard_pages: bool,
}

impl Default for EngineConfig
{
    fn default() -> Self
    {
        Self {
            apply_policy: ApplyPolicy::Atomic,
            hardware_one_shot: false,
            step_over_software_breakpoints: true,
            rearm_guard_pages: true,
        }
    }
}

impl EngineConfig
{
    /// Defaults overridden by the `KESTREL_*` environment variables.
    ///
    /// ## Errors
    ///
    /// `InvalidArgument` if a variable is set to an unrecognised value.
    pub fn from_env() -> Result<Self>
    {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`EngineConfig::from_env`] with a custom variable source.
    ///
    /// ## Errors
    ///
    /// `InvalidArgument` if a variable is set to an unrecognised value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(policy) = lookup("KESTREL_APPLY_POLICY") {
            config.apply_policy = policy.parse()?;
        }
        if let Some(value) = lookup("KESTREL_HW_ONE_SHOT") {
            config.hardware_one_shot = parse_flag("KESTREL_HW_ONE_SHOT", &value)?;
        }
        if let Some(value) = lookup("KESTREL_SW_STEP_OVER") {
            config.step_over_software_breakpoints = parse_flag("KESTREL_SW_STEP_OVER", &value)?;
        }
        if let Some(value) = lookup("KESTREL_REARM_GUARDS") {
            config.rearm_guard_pages = parse_flag("KESTREL_REARM_GUARDS", &value)?;
        }
        Ok(config)
    }

    #[must_use]
    pub fn with_apply_policy(mut self, policy: ApplyPolicy) -> Self
    {
        self.apply_policy = policy;
        self
    }

    #[must_use]
    pub fn with_hardware_one_shot(mut self, one_shot: bool) -> Self
    {
        self.hardware_one_shot = one_shot;
        self
    }

    #[must_use]
    pub fn with_software_step_over(mut self, enabled: bool) -> Self
    {
        self.step_over_software_breakpoints = enabled;
        self
    }

    #[must_use]
    pub fn with_guard_rearm(mut self, enabled: bool) -> Self
    {
        self.rearm_guard_pages = enabled;
        self
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool>
{
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(DebuggerError::InvalidArgument(format!("{name}={value} (use 'true' or 'false')"))),
    }
}
