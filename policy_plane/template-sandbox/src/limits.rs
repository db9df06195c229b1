// Resource limits and the per-run budget that enforces them.
//
// A budget is created fresh for every invocation and owned by the worker
// thread running the script. The host keeps only the cancellation flag.
//
// 1. Wall-clock deadline checked while stepping
// 2. Step (fuel) ceiling so pure CPU loops stop even if the clock is coarse
// 3. Accounted memory: live bindings plus transient allocations

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{LimitsError, SandboxError};

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Caller-specified bounds for a single execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxLimits {
    /// Hard wall-clock timeout in milliseconds
    pub timeout_ms: u64,
    /// Memory ceiling in megabytes
    pub memory_limit_mb: u64,
    /// Maximum interpreter steps
    pub max_steps: u64,
}

impl SandboxLimits {
    pub fn new(timeout_ms: u64, memory_limit_mb: u64) -> Self {
        Self {
            timeout_ms,
            memory_limit_mb,
            ..Self::default()
        }
    }

    /// Limits used for author-supplied validation rules
    pub fn validation_rule() -> Self {
        Self {
            timeout_ms: 1000,
            memory_limit_mb: 16,
            max_steps: 1_000_000,
        }
    }

    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_mb.saturating_mul(BYTES_PER_MB)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<(), LimitsError> {
        if self.timeout_ms == 0 {
            return Err(LimitsError::InvalidConfiguration(
                "timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.memory_limit_mb == 0 {
            return Err(LimitsError::InvalidConfiguration(
                "memory_limit_mb must be greater than 0".to_string(),
            ));
        }
        if self.max_steps == 0 {
            return Err(LimitsError::InvalidConfiguration(
                "max_steps must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            memory_limit_mb: 64,
            max_steps: 10_000_000,
        }
    }
}

/// Runtime budget tracker for one script execution
#[derive(Debug)]
pub struct ExecutionBudget {
    limits: SandboxLimits,
    started: Instant,
    deadline: Instant,
    cancel: Arc<AtomicBool>,
    steps: u64,
    live_bytes: u64,
    peak_bytes: u64,
}

impl ExecutionBudget {
    pub fn new(limits: SandboxLimits, cancel: Arc<AtomicBool>) -> Self {
        let started = Instant::now();
        Self {
            deadline: started + limits.timeout(),
            limits,
            started,
            cancel,
            steps: 0,
            live_bytes: 0,
            peak_bytes: 0,
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn live_bytes(&self) -> u64 {
        self.live_bytes
    }

    pub fn peak_bytes(&self) -> u64 {
        self.peak_bytes
    }

    /// Account one interpreter step
    pub fn tick(&mut self) -> Result<(), SandboxError> {
        self.steps += 1;
        if self.steps > self.limits.max_steps {
            return Err(SandboxError::StepBudgetExhausted { steps: self.steps });
        }
        // Clock reads are batched; the cancel flag is checked every step.
        if self.cancel.load(Ordering::Relaxed)
            || (self.steps & 0x1f == 0 && Instant::now() >= self.deadline)
        {
            return Err(SandboxError::Timeout {
                limit_ms: self.limits.timeout_ms,
                elapsed_ms: self.elapsed_ms(),
            });
        }
        Ok(())
    }

    /// Swap the accounted size of a binding
    pub fn rebind(&mut self, old_bytes: u64, new_bytes: u64) -> Result<(), SandboxError> {
        let next = self.live_bytes.saturating_sub(old_bytes).saturating_add(new_bytes);
        if next > self.limits.memory_limit_bytes() {
            return Err(SandboxError::Memory {
                limit_bytes: self.limits.memory_limit_bytes(),
                used_bytes: next,
            });
        }
        self.live_bytes = next;
        self.peak_bytes = self.peak_bytes.max(next);
        Ok(())
    }

    pub fn release(&mut self, bytes: u64) {
        self.live_bytes = self.live_bytes.saturating_sub(bytes);
    }

    /// Check a temporary allocation before it is made
    pub fn reserve_transient(&mut self, bytes: u64) -> Result<(), SandboxError> {
        let total = self.live_bytes.saturating_add(bytes);
        if total > self.limits.memory_limit_bytes() {
            return Err(SandboxError::Memory {
                limit_bytes: self.limits.memory_limit_bytes(),
                used_bytes: total,
            });
        }
        self.peak_bytes = self.peak_bytes.max(total);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(limits: SandboxLimits) -> ExecutionBudget {
        ExecutionBudget::new(limits, Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn test_limits_validation() {
        assert!(SandboxLimits::default().validate().is_ok());
        assert!(SandboxLimits::new(0, 10).validate().is_err());
        assert!(SandboxLimits::new(10, 0).validate().is_err());
        assert!(SandboxLimits::default().with_max_steps(0).validate().is_err());
    }

    #[test]
    fn test_memory_accounting() {
        let mut b = budget(SandboxLimits::new(1000, 1));
        b.rebind(0, 512 * 1024).unwrap();
        assert_eq!(b.live_bytes(), 512 * 1024);
        assert!(b.reserve_transient(600 * 1024).is_err());
        b.rebind(512 * 1024, 1024).unwrap();
        assert_eq!(b.live_bytes(), 1024);
        assert_eq!(b.peak_bytes(), 512 * 1024);
        assert!(matches!(
            b.rebind(0, 2 * BYTES_PER_MB),
            Err(SandboxError::Memory { .. })
        ));
    }

    #[test]
    fn test_step_budget() {
        let mut b = budget(SandboxLimits::default().with_max_steps(3));
        assert!(b.tick().is_ok());
        assert!(b.tick().is_ok());
        assert!(b.tick().is_ok());
        assert!(matches!(b.tick(), Err(SandboxError::StepBudgetExhausted { .. })));
    }

    #[test]
    fn test_cancellation_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut b = ExecutionBudget::new(SandboxLimits::default(), flag.clone());
        assert!(b.tick().is_ok());
        flag.store(true, Ordering::Relaxed);
        assert!(matches!(b.tick(), Err(SandboxError::Timeout { .. })));
    }
}
