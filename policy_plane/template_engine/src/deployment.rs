// Staged rollout of approved extensions with health-based rollback.
//
// Design Principles:
// 1. All-or-nothing promotion - the extension state only changes after the
//    whole rollout succeeded
// 2. Staged rollout - gradual and canary strategies widen the cohort step by step
// 3. Automatic rollback - failure thresholds and consecutive unhealthy probes
//    abort the rollout
// 4. Cancellable - every stage boundary and every wait checks the token
//
// Architecture:
// - RolloutController: walks the stages of a strategy
// - HealthProbe: measures an extension against a cohort at a given percentage
// - DefaultHealthProbe: resolves the target template, applies the extension
//   to sampled build contexts and validates the result
// - DeploymentRecord: history kept by the extension manager

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::conditions::evaluate_conditions;
use crate::inheritance::InheritanceEngine;
use crate::template::{BuildContext, ExtensionId, TemplateExtension};

// ============================================================================
// Strategy and thresholds
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeploymentStrategy {
    /// Single stage at 100%
    #[default]
    Immediate,
    /// Evenly spaced stages up to 100%
    Gradual { stages: u32, stage_interval_ms: u64 },
    /// One observed canary stage, then 100%
    Canary { percentage: f64, observation_ms: u64 },
}

impl DeploymentStrategy {
    /// Cohort percentage of each stage, paired with the wait after it
    pub fn stages(&self) -> Vec<(f64, Duration)> {
        match self {
            DeploymentStrategy::Immediate => vec![(100.0, Duration::ZERO)],
            DeploymentStrategy::Gradual {
                stages,
                stage_interval_ms,
            } => {
                let count = (*stages).max(1);
                (1..=count)
                    .map(|i| {
                        let wait = if i == count {
                            Duration::ZERO
                        } else {
                            Duration::from_millis(*stage_interval_ms)
                        };
                        (f64::from(i) * 100.0 / f64::from(count), wait)
                    })
                    .collect()
            }
            DeploymentStrategy::Canary {
                percentage,
                observation_ms,
            } => {
                let canary = percentage.clamp(0.0, 100.0);
                if canary >= 100.0 {
                    vec![(100.0, Duration::ZERO)]
                } else {
                    vec![
                        (canary, Duration::from_millis(*observation_ms)),
                        (100.0, Duration::ZERO),
                    ]
                }
            }
        }
    }
}

/// Limits a probe sample must stay within for a stage to advance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    /// Share of sampled contexts allowed to yield an invalid template
    pub max_invalid_ratio: f64,
    /// Mean resolve-and-apply time per context
    pub max_mean_latency_us: u64,
    /// Contexts whose target template could not be resolved at all
    pub max_unresolved: u64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_invalid_ratio: 0.0,
            max_mean_latency_us: 50_000,
            max_unresolved: 0,
        }
    }
}

/// When a rollout gives up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackTriggers {
    /// Failed samples across the whole rollout
    pub failure_threshold: u64,
    /// Unhealthy probes in a row
    pub consecutive_health_failures: u32,
}

impl Default for RollbackTriggers {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            consecutive_health_failures: 3,
        }
    }
}

/// What happened to one sampled build context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleOutcome {
    Valid,
    /// The extended template failed validation
    Invalid,
    /// The target template did not resolve
    Unresolved,
}

/// Aggregated probe samples for one extension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub samples: u64,
    pub invalid: u64,
    pub unresolved: u64,
    pub mean_latency_us: u64,
    pub last_check: DateTime<Utc>,
}

impl HealthMetrics {
    pub fn new() -> Self {
        Self {
            samples: 0,
            invalid: 0,
            unresolved: 0,
            mean_latency_us: 0,
            last_check: Utc::now(),
        }
    }

    pub fn record(&mut self, outcome: SampleOutcome, latency_us: u64) {
        let total_latency = self.mean_latency_us * self.samples + latency_us;
        self.samples += 1;
        match outcome {
            SampleOutcome::Valid => {}
            SampleOutcome::Invalid => self.invalid += 1,
            SampleOutcome::Unresolved => self.unresolved += 1,
        }
        self.mean_latency_us = total_latency / self.samples;
        self.last_check = Utc::now();
    }

    /// Fold another probe window into this one
    pub fn absorb(&mut self, other: &HealthMetrics) {
        let samples = self.samples + other.samples;
        if samples == 0 {
            return;
        }
        self.mean_latency_us =
            (self.mean_latency_us * self.samples + other.mean_latency_us * other.samples) / samples;
        self.samples = samples;
        self.invalid += other.invalid;
        self.unresolved += other.unresolved;
        self.last_check = other.last_check;
    }

    pub fn failures(&self) -> u64 {
        self.invalid + self.unresolved
    }

    pub fn invalid_ratio(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.invalid as f64 / self.samples as f64
        }
    }

    /// First threshold this window breaks, if any
    pub fn violation(&self, thresholds: &HealthThresholds) -> Option<String> {
        if self.unresolved > thresholds.max_unresolved {
            return Some(format!("{} unresolved sample(s)", self.unresolved));
        }
        let ratio = self.invalid_ratio();
        if ratio > thresholds.max_invalid_ratio {
            return Some(format!("{:.0}% of samples invalid", ratio * 100.0));
        }
        if self.mean_latency_us > thresholds.max_mean_latency_us {
            return Some(format!("mean latency {}us", self.mean_latency_us));
        }
        None
    }

    pub fn is_healthy(&self, thresholds: &HealthThresholds) -> bool {
        self.violation(thresholds).is_none()
    }

    /// 0.0-1.0: share of good samples, scaled down when slower than the latency limit
    pub fn performance_score(&self, thresholds: &HealthThresholds) -> f64 {
        if self.samples == 0 {
            return 1.0;
        }
        let good = (self.samples - self.failures().min(self.samples)) as f64 / self.samples as f64;
        let speed = if self.mean_latency_us <= thresholds.max_mean_latency_us {
            1.0
        } else {
            thresholds.max_mean_latency_us as f64 / self.mean_latency_us as f64
        };
        good * speed
    }
}

impl Default for HealthMetrics {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentOptions {
    pub strategy: DeploymentStrategy,
    pub deployed_by: Option<String>,
    pub health_thresholds: Option<HealthThresholds>,
    pub rollback_triggers: Option<RollbackTriggers>,
}

impl DeploymentOptions {
    pub fn new(strategy: DeploymentStrategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    pub fn deployed_by(mut self, actor: impl Into<String>) -> Self {
        self.deployed_by = Some(actor.into());
        self
    }

    pub fn with_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.health_thresholds = Some(thresholds);
        self
    }

    pub fn with_triggers(mut self, triggers: RollbackTriggers) -> Self {
        self.rollback_triggers = Some(triggers);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    InProgress,
    Succeeded,
    Failed,
    Cancelled,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: String,
    pub extension_id: ExtensionId,
    pub strategy: DeploymentStrategy,
    pub status: DeploymentStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub deployed_by: Option<String>,
    pub stages_completed: usize,
    pub health: HealthMetrics,
    pub reason: Option<String>,
}

impl DeploymentRecord {
    pub fn start(extension_id: ExtensionId, options: &DeploymentOptions) -> Self {
        Self {
            id: format!("dep-{}", Uuid::new_v4()),
            extension_id,
            strategy: options.strategy.clone(),
            status: DeploymentStatus::InProgress,
            started_at: Utc::now(),
            completed_at: None,
            deployed_by: options.deployed_by.clone(),
            stages_completed: 0,
            health: HealthMetrics::new(),
            reason: None,
        }
    }

    pub fn finish(&mut self, status: DeploymentStatus, reason: Option<String>) {
        self.status = status;
        self.reason = reason;
        self.completed_at = Some(Utc::now());
    }
}

/// Shared cancellation flag for long-running deployments
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Health probing
// ============================================================================

/// Measures how an extension behaves for a share of the cohort
pub trait HealthProbe: Send + Sync {
    fn probe(&self, extension: &TemplateExtension, percentage: f64) -> HealthMetrics;
}

const DEFAULT_COHORT: [&str; 4] = ["development", "testing", "staging", "production"];

/// Applies the extension to sampled build contexts of its target template
pub struct DefaultHealthProbe {
    engine: Arc<InheritanceEngine>,
    cohort: Vec<BuildContext>,
}

impl DefaultHealthProbe {
    pub fn new(engine: Arc<InheritanceEngine>) -> Self {
        Self {
            engine,
            cohort: DEFAULT_COHORT.iter().map(|env| BuildContext::new(*env)).collect(),
        }
    }

    pub fn with_cohort(mut self, cohort: Vec<BuildContext>) -> Self {
        self.cohort = cohort;
        self
    }

    fn sample(&self, percentage: f64) -> Vec<&BuildContext> {
        if self.cohort.is_empty() {
            return Vec::new();
        }
        let wanted = ((percentage / 100.0) * self.cohort.len() as f64).ceil() as usize;
        let wanted = wanted.clamp(1, self.cohort.len());
        let mut rng = rand::thread_rng();
        self.cohort.choose_multiple(&mut rng, wanted).collect()
    }
}

impl HealthProbe for DefaultHealthProbe {
    fn probe(&self, extension: &TemplateExtension, percentage: f64) -> HealthMetrics {
        let mut metrics = HealthMetrics::new();
        let default_ctx = BuildContext::default();
        let mut sampled = self.sample(percentage);
        if sampled.is_empty() {
            sampled.push(&default_ctx);
        }

        for ctx in sampled {
            let started = Instant::now();
            let outcome = match self
                .engine
                .resolve_template(&extension.target_template_id, ctx)
            {
                Ok(mut template) => {
                    if evaluate_conditions(&extension.conditions, ctx) {
                        template.apply_extension(extension);
                    }
                    let result = self.engine.validator().validate_structure(&template);
                    if !result.is_valid {
                        debug!(
                            "Extension {} produced an invalid template for {}: {:?}",
                            extension.id, ctx.environment, result.errors
                        );
                    }
                    if result.is_valid {
                        SampleOutcome::Valid
                    } else {
                        SampleOutcome::Invalid
                    }
                }
                Err(e) => {
                    debug!("Probe could not resolve {}: {}", extension.target_template_id, e);
                    SampleOutcome::Unresolved
                }
            };
            metrics.record(outcome, started.elapsed().as_micros() as u64);
        }
        metrics
    }
}

// ============================================================================
// Rollout controller
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum RolloutOutcome {
    Completed {
        stages: usize,
        health: HealthMetrics,
    },
    Cancelled {
        stages: usize,
        health: HealthMetrics,
    },
    RolledBack {
        stages: usize,
        reason: String,
        health: HealthMetrics,
    },
}

/// Drives one rollout through the stages of its strategy
pub struct RolloutController<'a> {
    probe: &'a dyn HealthProbe,
    thresholds: HealthThresholds,
    triggers: RollbackTriggers,
}

impl<'a> RolloutController<'a> {
    pub fn new(probe: &'a dyn HealthProbe) -> Self {
        Self {
            probe,
            thresholds: HealthThresholds::default(),
            triggers: RollbackTriggers::default(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_triggers(mut self, triggers: RollbackTriggers) -> Self {
        self.triggers = triggers;
        self
    }

    pub fn run(
        &self,
        extension: &TemplateExtension,
        strategy: &DeploymentStrategy,
        cancel: &CancellationToken,
    ) -> RolloutOutcome {
        let mut health = HealthMetrics::new();
        let mut completed = 0;
        let mut consecutive = 0u32;
        let max_consecutive = self.triggers.consecutive_health_failures.max(1);

        for (percentage, wait) in strategy.stages() {
            loop {
                if cancel.is_cancelled() {
                    warn!("Rollout of {} cancelled at stage {}", extension.id, completed);
                    return RolloutOutcome::Cancelled {
                        stages: completed,
                        health,
                    };
                }

                let sample = self.probe.probe(extension, percentage);
                health.absorb(&sample);

                if health.failures() >= self.triggers.failure_threshold.max(1) {
                    let reason = format!(
                        "{} failed samples reached threshold {}",
                        health.failures(),
                        self.triggers.failure_threshold
                    );
                    warn!("Rolling back {}: {}", extension.id, reason);
                    return RolloutOutcome::RolledBack {
                        stages: completed,
                        reason,
                        health,
                    };
                }

                let Some(violation) = sample.violation(&self.thresholds) else {
                    consecutive = 0;
                    break;
                };

                consecutive += 1;
                debug!("Unhealthy probe of {} at {:.0}%: {}", extension.id, percentage, violation);
                if consecutive >= max_consecutive {
                    let reason = format!(
                        "{} consecutive unhealthy checks at {:.0}% (last: {})",
                        consecutive, percentage, violation
                    );
                    warn!("Rolling back {}: {}", extension.id, reason);
                    return RolloutOutcome::RolledBack {
                        stages: completed,
                        reason,
                        health,
                    };
                }
            }

            completed += 1;
            info!(
                "Extension {} rollout reached {:.0}% (stage {})",
                extension.id, percentage, completed
            );

            if !wait.is_zero() && !sleep_cancellable(wait, cancel) {
                warn!("Rollout of {} cancelled while observing", extension.id);
                return RolloutOutcome::Cancelled {
                    stages: completed,
                    health,
                };
            }
        }

        RolloutOutcome::Completed {
            stages: completed,
            health,
        }
    }
}

/// Sleep in short slices; false when cancelled before the full duration
fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> bool {
    let deadline = Instant::now() + duration;
    let slice = Duration::from_millis(10);
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(slice.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct ScriptedProbe {
        healthy: Vec<bool>,
        calls: AtomicU32,
    }

    impl ScriptedProbe {
        fn new(healthy: Vec<bool>) -> Self {
            Self {
                healthy,
                calls: AtomicU32::new(0),
            }
        }
    }

    impl HealthProbe for ScriptedProbe {
        fn probe(&self, _extension: &TemplateExtension, _percentage: f64) -> HealthMetrics {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            let outcome = if self.healthy.get(n).copied().unwrap_or(true) {
                SampleOutcome::Valid
            } else {
                SampleOutcome::Invalid
            };
            let mut m = HealthMetrics::new();
            m.record(outcome, 50);
            m
        }
    }

    fn ext() -> TemplateExtension {
        TemplateExtension::new("e1", "Ext", "base")
    }

    #[test]
    fn test_strategy_stages() {
        assert_eq!(DeploymentStrategy::Immediate.stages().len(), 1);
        let gradual = DeploymentStrategy::Gradual {
            stages: 4,
            stage_interval_ms: 5,
        }
        .stages();
        let pct: Vec<f64> = gradual.iter().map(|(p, _)| *p).collect();
        assert_eq!(pct, vec![25.0, 50.0, 75.0, 100.0]);
        assert!(gradual[3].1.is_zero());

        let canary = DeploymentStrategy::Canary {
            percentage: 10.0,
            observation_ms: 1,
        }
        .stages();
        assert_eq!(canary[0].0, 10.0);
        assert_eq!(canary[1].0, 100.0);
    }

    #[test]
    fn test_health_metrics() {
        let thresholds = HealthThresholds::default();
        let mut m = HealthMetrics::new();
        m.record(SampleOutcome::Valid, 100);
        m.record(SampleOutcome::Invalid, 300);
        assert_eq!(m.samples, 2);
        assert_eq!(m.mean_latency_us, 200);
        assert!((m.invalid_ratio() - 0.5).abs() < f64::EPSILON);
        assert_eq!(m.violation(&thresholds).as_deref(), Some("50% of samples invalid"));
        assert!((m.performance_score(&thresholds) - 0.5).abs() < f64::EPSILON);

        let fresh = HealthMetrics::new();
        assert!(fresh.is_healthy(&thresholds));
        assert_eq!(fresh.performance_score(&thresholds), 1.0);

        let mut unresolved = HealthMetrics::new();
        unresolved.record(SampleOutcome::Unresolved, 10);
        assert_eq!(unresolved.failures(), 1);
        assert!(unresolved.violation(&thresholds).unwrap().contains("unresolved"));
    }

    #[test]
    fn test_slow_samples_lower_the_score() {
        let thresholds = HealthThresholds {
            max_mean_latency_us: 100,
            ..HealthThresholds::default()
        };
        let mut m = HealthMetrics::new();
        m.record(SampleOutcome::Valid, 400);
        assert!(m.violation(&thresholds).unwrap().contains("latency"));
        assert!((m.performance_score(&thresholds) - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rollout_completes_when_healthy() {
        let probe = ScriptedProbe::new(vec![]);
        let outcome = RolloutController::new(&probe).run(
            &ext(),
            &DeploymentStrategy::Gradual {
                stages: 3,
                stage_interval_ms: 1,
            },
            &CancellationToken::new(),
        );
        assert!(matches!(outcome, RolloutOutcome::Completed { stages: 3, .. }));
    }

    #[test]
    fn test_consecutive_failures_roll_back() {
        let probe = ScriptedProbe::new(vec![false, false]);
        let outcome = RolloutController::new(&probe)
            .with_triggers(RollbackTriggers {
                failure_threshold: 100,
                consecutive_health_failures: 2,
            })
            .run(&ext(), &DeploymentStrategy::Immediate, &CancellationToken::new());
        match outcome {
            RolloutOutcome::RolledBack { stages, .. } => assert_eq!(stages, 0),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_single_unhealthy_probe_is_retried() {
        let probe = ScriptedProbe::new(vec![false, true]);
        let outcome = RolloutController::new(&probe)
            .run(&ext(), &DeploymentStrategy::Immediate, &CancellationToken::new());
        assert!(matches!(outcome, RolloutOutcome::Completed { .. }));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failure_threshold_rolls_back() {
        let probe = ScriptedProbe::new(vec![false, true, false]);
        let outcome = RolloutController::new(&probe)
            .with_triggers(RollbackTriggers {
                failure_threshold: 2,
                consecutive_health_failures: 5,
            })
            .run(
                &ext(),
                &DeploymentStrategy::Gradual {
                    stages: 3,
                    stage_interval_ms: 0,
                },
                &CancellationToken::new(),
            );
        assert!(matches!(outcome, RolloutOutcome::RolledBack { .. }));
    }

    #[test]
    fn test_cancel_during_observation() {
        let probe = ScriptedProbe::new(vec![]);
        let token = CancellationToken::new();
        let remote = token.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            remote.cancel();
        });
        let outcome = RolloutController::new(&probe).run(
            &ext(),
            &DeploymentStrategy::Canary {
                percentage: 5.0,
                observation_ms: 5_000,
            },
            &token,
        );
        handle.join().unwrap();
        assert!(matches!(outcome, RolloutOutcome::Cancelled { stages: 1, .. }));
    }
}
