// Error taxonomy for sandboxed execution.
//
// Every failure inside the sandbox collapses into one of five kinds so
// callers can degrade a failed rule to "contributed nothing" without
// inspecting messages:
// - timeout:  wall-clock deadline, step budget or host cancellation
// - memory:   accounted allocation ceiling exceeded
// - security: denied capability, forbidden global or blocking scan issue
// - runtime:  script raised or hit a type error
// - module:   script failed to parse or the worker could not be started

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification of a sandbox failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxErrorKind {
    Timeout,
    Memory,
    Security,
    Runtime,
    Module,
}

impl std::fmt::Display for SandboxErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SandboxErrorKind::Timeout => "timeout",
            SandboxErrorKind::Memory => "memory",
            SandboxErrorKind::Security => "security",
            SandboxErrorKind::Runtime => "runtime",
            SandboxErrorKind::Module => "module",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SandboxError {
    #[error("Execution timed out after {elapsed_ms}ms (limit {limit_ms}ms)")]
    Timeout { limit_ms: u64, elapsed_ms: u64 },

    #[error("Step budget exhausted after {steps} steps")]
    StepBudgetExhausted { steps: u64 },

    #[error("Memory limit exceeded: {used_bytes} bytes requested, limit {limit_bytes} bytes")]
    Memory { limit_bytes: u64, used_bytes: u64 },

    #[error("Security violation: {0}")]
    Security(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Module error: {0}")]
    Module(String),
}

impl SandboxError {
    pub fn kind(&self) -> SandboxErrorKind {
        match self {
            SandboxError::Timeout { .. } | SandboxError::StepBudgetExhausted { .. } => {
                SandboxErrorKind::Timeout
            }
            SandboxError::Memory { .. } => SandboxErrorKind::Memory,
            SandboxError::Security(_) => SandboxErrorKind::Security,
            SandboxError::Runtime(_) => SandboxErrorKind::Runtime,
            SandboxError::Module(_) => SandboxErrorKind::Module,
        }
    }

    pub(crate) fn runtime(msg: impl Into<String>) -> Self {
        SandboxError::Runtime(msg.into())
    }

    pub(crate) fn security(msg: impl Into<String>) -> Self {
        SandboxError::Security(msg.into())
    }
}

/// Invalid limit configuration
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LimitsError {
    #[error("Invalid sandbox limits: {0}")]
    InvalidConfiguration(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            SandboxError::Timeout { limit_ms: 10, elapsed_ms: 11 }.kind(),
            SandboxErrorKind::Timeout
        );
        assert_eq!(
            SandboxError::StepBudgetExhausted { steps: 5 }.kind(),
            SandboxErrorKind::Timeout
        );
        assert_eq!(SandboxError::security("x").kind(), SandboxErrorKind::Security);
        assert_eq!(SandboxErrorKind::Memory.to_string(), "memory");
    }
}
