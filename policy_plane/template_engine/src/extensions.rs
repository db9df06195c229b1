// Extension registry and lifecycle management.
//
// Design Principles:
// 1. Explicit state machine - every transition is looked up in a fixed table
//    before any side effect runs
// 2. Atomic transitions - a rejected transition leaves the entry untouched
// 3. Append-only history - each accepted transition adds a StateTransition
// 4. Failure isolation - one broken extension never blocks the others during
//    application
// 5. Persisted records carry a checksum and are verified on reload
//
// State Transitions:
// - draft      -> testing | archived
// - testing    -> draft | approved | archived
// - approved   -> deployed | deprecated | archived
// - deployed   -> deprecated | approved
// - deprecated -> archived
// - archived is terminal
//
// testing->approved and approved->deployed need an approver unless
// auto-approval is configured.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::cache::content_hash;
use crate::conditions::{evaluate_conditions, Condition};
use crate::config::LifecycleConfig;
use crate::deployment::{
    CancellationToken, DefaultHealthProbe, DeploymentOptions, DeploymentRecord, DeploymentStatus,
    DeploymentStrategy, HealthMetrics, HealthProbe, RolloutController, RolloutOutcome,
};
use crate::inheritance::InheritanceEngine;
use crate::persistence::{ExtensionRecord, ExtensionStorage, StorageError, StorageInfo};
use crate::template::{
    BuildContext, ExtensionId, RulePath, RulesPatch, Template, TemplateExtension, Version,
};

// ============================================================================
// States and transitions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionState {
    Draft,
    Testing,
    Approved,
    Deployed,
    Deprecated,
    Archived,
}

impl ExtensionState {
    pub fn allowed_targets(&self) -> &'static [ExtensionState] {
        use ExtensionState::*;
        match self {
            Draft => &[Testing, Archived],
            Testing => &[Draft, Approved, Archived],
            Approved => &[Deployed, Deprecated, Archived],
            Deployed => &[Deprecated, Approved],
            Deprecated => &[Archived],
            Archived => &[],
        }
    }

    pub fn can_transition_to(&self, to: ExtensionState) -> bool {
        self.allowed_targets().contains(&to)
    }

    pub fn is_terminal(&self) -> bool {
        self.allowed_targets().is_empty()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExtensionState::Draft => "draft",
            ExtensionState::Testing => "testing",
            ExtensionState::Approved => "approved",
            ExtensionState::Deployed => "deployed",
            ExtensionState::Deprecated => "deprecated",
            ExtensionState::Archived => "archived",
        }
    }
}

impl fmt::Display for ExtensionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Side effect bound to a (from, to) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionHandler {
    /// Apply the extension to a synthetic template and validate it
    SelfTest,
    ReturnToDraft,
    Approve,
    Activate,
    Deactivate,
    Retire,
}

impl TransitionHandler {
    pub fn for_transition(from: ExtensionState, to: ExtensionState) -> Option<Self> {
        use ExtensionState::*;
        if !from.can_transition_to(to) {
            return None;
        }
        Some(match (from, to) {
            (Draft, Testing) => TransitionHandler::SelfTest,
            (Testing, Draft) => TransitionHandler::ReturnToDraft,
            (Testing, Approved) => TransitionHandler::Approve,
            (Approved, Deployed) => TransitionHandler::Activate,
            (_, Archived) => TransitionHandler::Retire,
            _ => TransitionHandler::Deactivate,
        })
    }
}

fn requires_approval(from: ExtensionState, to: ExtensionState) -> bool {
    matches!(
        (from, to),
        (ExtensionState::Testing, ExtensionState::Approved)
            | (ExtensionState::Approved, ExtensionState::Deployed)
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: ExtensionState,
    pub to: ExtensionState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
    pub approved_by: Option<String>,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Invalid transition for extension {extension_id}: {from} -> {to}")]
    InvalidTransition {
        extension_id: ExtensionId,
        from: ExtensionState,
        to: ExtensionState,
    },

    #[error("Transition {from} -> {to} of extension {extension_id} requires an approver")]
    ApprovalRequired {
        extension_id: ExtensionId,
        from: ExtensionState,
        to: ExtensionState,
    },

    #[error("Extension not found: {0}")]
    NotFound(ExtensionId),

    #[error("Extension already exists: {0}")]
    AlreadyExists(ExtensionId),

    #[error("Extension {extension_id} is required by {}", .dependents.iter().map(ExtensionId::as_str).collect::<Vec<_>>().join(", "))]
    HasDependents {
        extension_id: ExtensionId,
        dependents: Vec<ExtensionId>,
    },

    #[error("Self-test of extension {extension_id} failed: {reason}")]
    SelfTestFailed { extension_id: ExtensionId, reason: String },

    #[error("Extension {extension_id} is {state}, expected {expected}")]
    InvalidState {
        extension_id: ExtensionId,
        state: ExtensionState,
        expected: String,
    },

    #[error("Invalid extension {extension_id}: {}", .issues.join("; "))]
    InvalidExtension {
        extension_id: ExtensionId,
        issues: Vec<String>,
    },

    #[error("Deployment of extension {extension_id} ended {status:?}: {reason}")]
    Deployment {
        extension_id: ExtensionId,
        status: DeploymentStatus,
        reason: String,
    },

    #[error("Storage failure: {0}")]
    Storage(StorageError),

    #[error("Stored record of extension {extension_id} failed its integrity check")]
    IntegrityCheckFailed {
        extension_id: ExtensionId,
        expected: String,
        actual: String,
    },

    #[error("Extension marketplace is disabled")]
    MarketplaceDisabled,
}

impl From<StorageError> for LifecycleError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::IntegrityCheckFailed {
                extension_id,
                expected,
                actual,
            } => LifecycleError::IntegrityCheckFailed {
                extension_id,
                expected,
                actual,
            },
            other => LifecycleError::Storage(other),
        }
    }
}

// ============================================================================
// Registry types
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtensionMetrics {
    /// Successful deployments
    pub installations: u64,
    pub applications: u64,
    pub failures: u64,
    pub skipped: u64,
    pub usage_count: u64,
    pub last_applied: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_health: Option<HealthMetrics>,
    /// Score of the last rollout's health window, 0.0-1.0
    pub performance_score: Option<f64>,
}

impl ExtensionMetrics {
    /// Failed applications over all attempted ones
    pub fn error_rate(&self) -> f64 {
        let attempts = self.applications + self.failures;
        if attempts == 0 {
            0.0
        } else {
            self.failures as f64 / attempts as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionRegistryEntry {
    pub extension: TemplateExtension,
    pub state: ExtensionState,
    pub state_history: Vec<StateTransition>,
    pub dependencies: Vec<ExtensionId>,
    /// Registered extensions listing this one as a dependency
    #[serde(default)]
    pub dependents: BTreeSet<ExtensionId>,
    pub metrics: ExtensionMetrics,
    /// True while deployed
    pub active: bool,
    pub created_by: Option<String>,
    pub storage: Option<StorageInfo>,
}

/// Partial edit of a draft or testing extension
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub version: Option<Version>,
    pub rules: Option<RulesPatch>,
    pub remove: Option<Vec<RulePath>>,
    pub priority: Option<i32>,
    pub conditions: Option<Vec<Condition>>,
    pub dependencies: Option<Vec<ExtensionId>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedExtension {
    pub extension: TemplateExtension,
    pub publisher: String,
    pub published_at: DateTime<Utc>,
    pub checksum: String,
}

/// Dependency tree; never fails, unhealthy nodes are flagged instead
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyNode {
    pub id: ExtensionId,
    pub state: Option<ExtensionState>,
    pub circular: bool,
    pub missing: bool,
    pub dependencies: Vec<DependencyNode>,
}

impl DependencyNode {
    /// True when any node in the tree is circular or missing
    pub fn is_unhealthy(&self) -> bool {
        self.circular || self.missing || self.dependencies.iter().any(DependencyNode::is_unhealthy)
    }
}

/// Outcome of applying deployed extensions to one template
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyReport {
    pub template: Template,
    pub applied: Vec<ExtensionId>,
    /// Conditions did not hold
    pub skipped: Vec<ExtensionId>,
    pub failed: Vec<(ExtensionId, String)>,
}

/// Records restored by load_from_storage
#[derive(Debug, Default)]
pub struct RestoreSummary {
    pub loaded: Vec<ExtensionId>,
    pub rejected: Vec<(PathBuf, String)>,
}

// ============================================================================
// Manager
// ============================================================================

pub struct ExtensionManager {
    config: LifecycleConfig,
    engine: Arc<InheritanceEngine>,
    probe: Arc<dyn HealthProbe>,
    registry: RwLock<HashMap<ExtensionId, ExtensionRegistryEntry>>,
    deployments: RwLock<HashMap<ExtensionId, Vec<DeploymentRecord>>>,
    marketplace: RwLock<HashMap<ExtensionId, PublishedExtension>>,
    storage: Option<ExtensionStorage>,
}

impl ExtensionManager {
    pub fn new(engine: Arc<InheritanceEngine>) -> Result<Self, LifecycleError> {
        Self::with_config(LifecycleConfig::default(), engine)
    }

    pub fn with_config(config: LifecycleConfig, engine: Arc<InheritanceEngine>) -> Result<Self, LifecycleError> {
        let storage = match &config.storage_dir {
            Some(dir) => Some(ExtensionStorage::open(dir)?),
            None => None,
        };
        Ok(Self {
            probe: Arc::new(DefaultHealthProbe::new(engine.clone())),
            config,
            engine,
            registry: RwLock::new(HashMap::new()),
            deployments: RwLock::new(HashMap::new()),
            marketplace: RwLock::new(HashMap::new()),
            storage,
        })
    }

    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // CRUD
    // ------------------------------------------------------------------------

    pub fn create_extension(
        &self,
        mut extension: TemplateExtension,
        dependencies: Vec<ExtensionId>,
        actor: Option<&str>,
    ) -> Result<ExtensionRegistryEntry, LifecycleError> {
        self.check_extension(&extension)?;

        let mut registry = self.registry.write();
        if registry.contains_key(&extension.id) {
            return Err(LifecycleError::AlreadyExists(extension.id));
        }

        let now = Utc::now();
        if extension.metadata.author.is_empty() {
            extension.metadata.author = actor.unwrap_or_default().to_string();
        }
        extension.metadata.created_at = now;
        extension.metadata.updated_at = now;

        let dependents = dependents_of(&registry, &extension.id);
        let mut entry = ExtensionRegistryEntry {
            extension,
            state: ExtensionState::Draft,
            state_history: Vec::new(),
            dependents,
            dependencies,
            metrics: ExtensionMetrics::default(),
            active: false,
            created_by: actor.map(str::to_string),
            storage: None,
        };
        entry.storage = self.persist(&entry)?;

        info!("Created extension {} for {}", entry.extension.id, entry.extension.target_template_id);
        link_dependencies(&mut registry, &entry.extension.id, &[], &entry.dependencies);
        registry.insert(entry.extension.id.clone(), entry.clone());
        Ok(entry)
    }

    /// Edits are allowed in draft and testing; a testing entry returns to draft
    pub fn update_extension(
        &self,
        id: &ExtensionId,
        update: ExtensionUpdate,
        actor: Option<&str>,
    ) -> Result<ExtensionRegistryEntry, LifecycleError> {
        let mut registry = self.registry.write();
        let current = registry.get(id).ok_or_else(|| LifecycleError::NotFound(id.clone()))?;
        if !matches!(current.state, ExtensionState::Draft | ExtensionState::Testing) {
            return Err(LifecycleError::InvalidState {
                extension_id: id.clone(),
                state: current.state,
                expected: "draft or testing".to_string(),
            });
        }

        let mut entry = current.clone();
        let ext = &mut entry.extension;
        if let Some(name) = update.name {
            ext.name = name;
        }
        if let Some(description) = update.description {
            ext.metadata.description = description;
        }
        if let Some(version) = update.version {
            ext.metadata.version = version;
        }
        if let Some(rules) = update.rules {
            *ext = ext.clone().with_rules(rules);
        }
        if let Some(remove) = update.remove {
            *ext = ext.clone().with_removals(remove);
        }
        if let Some(priority) = update.priority {
            ext.priority = priority;
        }
        if let Some(conditions) = update.conditions {
            ext.conditions = conditions;
        }
        if let Some(dependencies) = update.dependencies {
            entry.dependencies = dependencies;
        }
        entry.extension.metadata.updated_at = Utc::now();
        self.check_extension(&entry.extension)?;

        if entry.state == ExtensionState::Testing {
            entry.state_history.push(StateTransition {
                from: ExtensionState::Testing,
                to: ExtensionState::Draft,
                timestamp: Utc::now(),
                reason: Some(format!("edited by {}", actor.unwrap_or("unknown"))),
                approved_by: None,
            });
            entry.state = ExtensionState::Draft;
        }
        entry.storage = self.persist(&entry)?;

        debug!("Updated extension {}", id);
        let previous = registry
            .get(id)
            .map(|e| e.dependencies.clone())
            .unwrap_or_default();
        link_dependencies(&mut registry, id, &previous, &entry.dependencies);
        registry.insert(id.clone(), entry.clone());
        Ok(entry)
    }

    pub fn delete_extension(&self, id: &ExtensionId, actor: Option<&str>) -> Result<ExtensionRegistryEntry, LifecycleError> {
        let mut registry = self.registry.write();
        let entry = registry.get(id).ok_or_else(|| LifecycleError::NotFound(id.clone()))?;

        if !entry.dependents.is_empty() {
            return Err(LifecycleError::HasDependents {
                extension_id: id.clone(),
                dependents: entry.dependents.iter().cloned().collect(),
            });
        }
        if entry.state == ExtensionState::Deployed {
            return Err(LifecycleError::InvalidState {
                extension_id: id.clone(),
                state: entry.state,
                expected: "not deployed".to_string(),
            });
        }

        if let Some(storage) = &self.storage {
            storage.remove(id)?;
        }
        let removed = registry
            .remove(id)
            .ok_or_else(|| LifecycleError::NotFound(id.clone()))?;
        link_dependencies(&mut registry, id, &removed.dependencies, &[]);
        self.marketplace.write().remove(id);
        info!("Deleted extension {} (by {})", id, actor.unwrap_or("unknown"));
        Ok(removed)
    }

    pub fn get_extension(&self, id: &ExtensionId) -> Option<ExtensionRegistryEntry> {
        self.registry.read().get(id).cloned()
    }

    /// Sorted by id; optionally only one state
    pub fn list_extensions(&self, state: Option<ExtensionState>) -> Vec<ExtensionRegistryEntry> {
        let mut entries: Vec<ExtensionRegistryEntry> = self
            .registry
            .read()
            .values()
            .filter(|e| state.map_or(true, |s| e.state == s))
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.extension.id.cmp(&b.extension.id));
        entries
    }

    pub fn record_usage(&self, id: &ExtensionId) -> Result<u64, LifecycleError> {
        let mut registry = self.registry.write();
        let entry = registry.get_mut(id).ok_or_else(|| LifecycleError::NotFound(id.clone()))?;
        entry.metrics.usage_count += 1;
        Ok(entry.metrics.usage_count)
    }

    pub fn metrics(&self, id: &ExtensionId) -> Option<ExtensionMetrics> {
        self.registry.read().get(id).map(|e| e.metrics.clone())
    }

    pub fn deployments(&self, id: &ExtensionId) -> Vec<DeploymentRecord> {
        self.deployments.read().get(id).cloned().unwrap_or_default()
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    pub fn transition_extension_state(
        &self,
        id: &ExtensionId,
        to: ExtensionState,
        reason: Option<String>,
        approved_by: Option<&str>,
    ) -> Result<ExtensionRegistryEntry, LifecycleError> {
        let snapshot = self.get_extension(id).ok_or_else(|| LifecycleError::NotFound(id.clone()))?;
        let from = snapshot.state;

        // 1. Table lookup
        let handler = TransitionHandler::for_transition(from, to).ok_or_else(|| {
            LifecycleError::InvalidTransition {
                extension_id: id.clone(),
                from,
                to,
            }
        })?;

        // 2. Approval
        if requires_approval(from, to) && approved_by.is_none() && !self.config.auto_approve {
            return Err(LifecycleError::ApprovalRequired {
                extension_id: id.clone(),
                from,
                to,
            });
        }

        // 3. Side effects that can reject the transition
        match handler {
            TransitionHandler::SelfTest => self.self_test(&snapshot.extension)?,
            TransitionHandler::Activate => {
                // approved -> deployed always goes through an immediate rollout
                let mut options = DeploymentOptions::new(DeploymentStrategy::Immediate);
                options.deployed_by = approved_by.map(str::to_string);
                self.deploy_extension(id, options)?;
                return self.get_extension(id).ok_or_else(|| LifecycleError::NotFound(id.clone()));
            }
            _ => {}
        }

        // 4. Commit
        let entry = self.commit_transition(id, from, to, reason, approved_by.map(str::to_string))?;
        if handler == TransitionHandler::Retire && self.marketplace.write().remove(id).is_some() {
            info!("Extension {} withdrawn from the marketplace", id);
        }
        Ok(entry)
    }

    /// Records the transition if the entry is still in `from`
    fn commit_transition(
        &self,
        id: &ExtensionId,
        from: ExtensionState,
        to: ExtensionState,
        reason: Option<String>,
        approved_by: Option<String>,
    ) -> Result<ExtensionRegistryEntry, LifecycleError> {
        let mut registry = self.registry.write();
        let current = registry.get(id).ok_or_else(|| LifecycleError::NotFound(id.clone()))?;
        if current.state != from {
            return Err(LifecycleError::InvalidTransition {
                extension_id: id.clone(),
                from: current.state,
                to,
            });
        }

        let mut entry = current.clone();
        entry.state_history.push(StateTransition {
            from,
            to,
            timestamp: Utc::now(),
            reason,
            approved_by,
        });
        entry.state = to;
        entry.active = to == ExtensionState::Deployed;
        entry.storage = self.persist(&entry)?;

        info!("Extension {} moved {} -> {}", id, from, to);
        registry.insert(id.clone(), entry.clone());
        Ok(entry)
    }

    fn self_test(&self, extension: &TemplateExtension) -> Result<(), LifecycleError> {
        let fail = |reason: String| LifecycleError::SelfTestFailed {
            extension_id: extension.id.clone(),
            reason,
        };

        let issues = self.engine.validator().extension_issues(extension);
        if !issues.is_empty() {
            return Err(fail(issues.join("; ")));
        }

        let mut synthetic = Template::builder()
            .id(extension.target_template_id.clone())
            .name("extension self-test")
            .deny(["__self_test__"])
            .build()
            .map_err(|e| fail(e.to_string()))?;
        let ctx = BuildContext::default();
        synthetic.apply_extension(extension);

        let result = self.engine.validator().validate_template(&synthetic, &ctx);
        if !result.is_valid {
            return Err(fail(result.error_summary()));
        }
        debug!("Extension {} passed its self-test", extension.id);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Deployment
    // ------------------------------------------------------------------------

    pub fn deploy_extension(
        &self,
        id: &ExtensionId,
        options: DeploymentOptions,
    ) -> Result<DeploymentRecord, LifecycleError> {
        self.deploy_extension_cancellable(id, options, &CancellationToken::new())
    }

    /// Runs the rollout; the extension only becomes deployed on success
    pub fn deploy_extension_cancellable(
        &self,
        id: &ExtensionId,
        options: DeploymentOptions,
        cancel: &CancellationToken,
    ) -> Result<DeploymentRecord, LifecycleError> {
        let entry = self.get_extension(id).ok_or_else(|| LifecycleError::NotFound(id.clone()))?;
        if entry.state != ExtensionState::Approved {
            return Err(LifecycleError::InvalidState {
                extension_id: id.clone(),
                state: entry.state,
                expected: ExtensionState::Approved.to_string(),
            });
        }
        if options.deployed_by.is_none() && !self.config.auto_approve {
            return Err(LifecycleError::ApprovalRequired {
                extension_id: id.clone(),
                from: ExtensionState::Approved,
                to: ExtensionState::Deployed,
            });
        }

        let mut record = DeploymentRecord::start(id.clone(), &options);
        let thresholds = options
            .health_thresholds
            .clone()
            .unwrap_or_else(|| self.config.health_thresholds.clone());
        let controller = RolloutController::new(self.probe.as_ref())
            .with_thresholds(thresholds.clone())
            .with_triggers(
                options
                    .rollback_triggers
                    .clone()
                    .unwrap_or_else(|| self.config.rollback_triggers.clone()),
            );
        info!("Deploying extension {} with {:?}", id, options.strategy);

        let (status, stages, health, reason) = match controller.run(&entry.extension, &options.strategy, cancel) {
            RolloutOutcome::Completed { stages, health } => (DeploymentStatus::Succeeded, stages, health, None),
            RolloutOutcome::Cancelled { stages, health } => (
                DeploymentStatus::Cancelled,
                stages,
                health,
                Some("deployment cancelled".to_string()),
            ),
            RolloutOutcome::RolledBack { stages, reason, health } => {
                (DeploymentStatus::Failed, stages, health, Some(reason))
            }
        };
        record.stages_completed = stages;
        record.health = health.clone();

        if let Some(current) = self.registry.write().get_mut(id) {
            current.metrics.performance_score = Some(health.performance_score(&thresholds));
            current.metrics.last_health = Some(health);
        }

        let outcome = match status {
            DeploymentStatus::Succeeded => self
                .commit_transition(
                    id,
                    ExtensionState::Approved,
                    ExtensionState::Deployed,
                    Some(format!("deployed after {} stage(s)", stages)),
                    options.deployed_by.clone(),
                )
                .map(|_| ()),
            _ => Err(LifecycleError::Deployment {
                extension_id: id.clone(),
                status,
                reason: reason.clone().unwrap_or_default(),
            }),
        };

        match &outcome {
            Ok(()) => {
                if let Some(current) = self.registry.write().get_mut(id) {
                    current.metrics.installations += 1;
                }
                record.finish(DeploymentStatus::Succeeded, None);
            }
            Err(LifecycleError::Deployment { status, reason, .. }) => {
                warn!("Deployment of {} ended {:?}: {}", id, status, reason);
                record.finish(*status, Some(reason.clone()));
            }
            Err(e) => {
                warn!("Deployment of {} could not be committed: {}", id, e);
                record.finish(DeploymentStatus::Failed, Some(e.to_string()));
            }
        }
        self.push_deployment(record.clone());
        outcome.map(|()| record)
    }

    /// deployed -> approved, marking the last successful deployment rolled back
    pub fn rollback_extension(
        &self,
        id: &ExtensionId,
        reason: &str,
        actor: Option<&str>,
    ) -> Result<ExtensionRegistryEntry, LifecycleError> {
        let state = self
            .get_extension(id)
            .map(|e| e.state)
            .ok_or_else(|| LifecycleError::NotFound(id.clone()))?;
        if state != ExtensionState::Deployed {
            return Err(LifecycleError::InvalidState {
                extension_id: id.clone(),
                state,
                expected: ExtensionState::Deployed.to_string(),
            });
        }

        let entry = self.commit_transition(
            id,
            ExtensionState::Deployed,
            ExtensionState::Approved,
            Some(format!("rollback: {}", reason)),
            actor.map(str::to_string),
        )?;

        if let Some(history) = self.deployments.write().get_mut(id) {
            if let Some(last) = history
                .iter_mut()
                .rev()
                .find(|r| r.status == DeploymentStatus::Succeeded)
            {
                last.finish(DeploymentStatus::RolledBack, Some(reason.to_string()));
            }
        }
        warn!("Extension {} rolled back: {}", id, reason);
        Ok(entry)
    }

    fn push_deployment(&self, record: DeploymentRecord) {
        let mut deployments = self.deployments.write();
        let history = deployments.entry(record.extension_id.clone()).or_default();
        history.push(record);
        let cap = self.config.max_deployment_history.max(1);
        if history.len() > cap {
            let excess = history.len() - cap;
            history.drain(..excess);
        }
    }

    // ------------------------------------------------------------------------
    // Application
    // ------------------------------------------------------------------------

    /// Apply deployed extensions targeting `template` by ascending priority
    ///
    /// An extension that fails is skipped and counted; the rest still apply.
    pub fn apply_extensions(
        &self,
        template: &Template,
        ctx: &BuildContext,
        only: Option<&[ExtensionId]>,
    ) -> ApplyReport {
        let mut candidates: Vec<TemplateExtension> = self
            .registry
            .read()
            .values()
            .filter(|e| e.state == ExtensionState::Deployed)
            .filter(|e| e.extension.target_template_id == template.id)
            .filter(|e| only.map_or(true, |ids| ids.contains(&e.extension.id)))
            .map(|e| e.extension.clone())
            .collect();
        candidates.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));

        let mut report = ApplyReport {
            template: template.structural_clone(),
            applied: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
        };

        for extension in &candidates {
            if !evaluate_conditions(&extension.conditions, ctx) {
                report.skipped.push(extension.id.clone());
                continue;
            }
            match self.apply_one(&report.template, extension) {
                Ok(next) => {
                    report.template = next;
                    report.applied.push(extension.id.clone());
                }
                Err(reason) => {
                    warn!("Extension {} failed on {}: {}", extension.id, template.id, reason);
                    report.failed.push((extension.id.clone(), reason));
                }
            }
        }

        self.record_application(&report);
        report
    }

    fn apply_one(&self, template: &Template, extension: &TemplateExtension) -> Result<Template, String> {
        let issues = self.engine.validator().extension_issues(extension);
        if !issues.is_empty() {
            return Err(issues.join("; "));
        }
        let mut candidate = template.structural_clone();
        candidate.apply_extension(extension);
        let result = self.engine.validator().validate_structure(&candidate);
        if !result.is_valid {
            return Err(result.error_summary());
        }
        Ok(candidate)
    }

    fn record_application(&self, report: &ApplyReport) {
        let now = Utc::now();
        let mut registry = self.registry.write();
        for id in &report.applied {
            if let Some(entry) = registry.get_mut(id) {
                entry.metrics.applications += 1;
                entry.metrics.last_applied = Some(now);
            }
        }
        for id in &report.skipped {
            if let Some(entry) = registry.get_mut(id) {
                entry.metrics.skipped += 1;
            }
        }
        for (id, reason) in &report.failed {
            if let Some(entry) = registry.get_mut(id) {
                entry.metrics.failures += 1;
                entry.metrics.last_error = Some(reason.clone());
            }
        }
    }

    // ------------------------------------------------------------------------
    // Dependencies
    // ------------------------------------------------------------------------

    pub fn get_dependency_graph(&self, id: &ExtensionId) -> DependencyNode {
        let registry = self.registry.read();
        let mut path = Vec::new();
        build_node(id, &registry, &mut path)
    }

    // ------------------------------------------------------------------------
    // Marketplace
    // ------------------------------------------------------------------------

    pub fn publish_extension(&self, id: &ExtensionId, publisher: &str) -> Result<PublishedExtension, LifecycleError> {
        if !self.config.marketplace_enabled {
            return Err(LifecycleError::MarketplaceDisabled);
        }
        let entry = self.get_extension(id).ok_or_else(|| LifecycleError::NotFound(id.clone()))?;
        if !matches!(entry.state, ExtensionState::Approved | ExtensionState::Deployed) {
            return Err(LifecycleError::InvalidState {
                extension_id: id.clone(),
                state: entry.state,
                expected: "approved or deployed".to_string(),
            });
        }

        let body = serde_json::to_vec(&entry.extension).map_err(StorageError::from)?;
        let published = PublishedExtension {
            checksum: content_hash([body]),
            extension: entry.extension,
            publisher: publisher.to_string(),
            published_at: Utc::now(),
        };
        self.marketplace.write().insert(id.clone(), published.clone());
        info!("Published extension {} by {}", id, publisher);
        Ok(published)
    }

    pub fn list_published(&self) -> Vec<PublishedExtension> {
        let mut published: Vec<PublishedExtension> = self.marketplace.read().values().cloned().collect();
        published.sort_by(|a, b| a.extension.id.cmp(&b.extension.id));
        published
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    fn persist(&self, entry: &ExtensionRegistryEntry) -> Result<Option<StorageInfo>, LifecycleError> {
        let Some(storage) = &self.storage else {
            return Ok(None);
        };
        let record = ExtensionRecord::new(
            entry.extension.clone(),
            entry.state,
            entry.state_history.clone(),
            entry.dependencies.clone(),
        )?;
        Ok(Some(storage.save(&record)?))
    }

    /// Restore registry entries from the storage directory
    ///
    /// Records failing their checksum are rejected and left on disk.
    pub fn load_from_storage(&self) -> Result<RestoreSummary, LifecycleError> {
        let Some(storage) = &self.storage else {
            return Ok(RestoreSummary::default());
        };
        let report = storage.load_all()?;
        let mut summary = RestoreSummary::default();
        let mut registry = self.registry.write();

        for record in report.records {
            let id = record.extension.id.clone();
            let path = storage.path_for(&id);
            let size_bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            let entry = ExtensionRegistryEntry {
                active: record.state == ExtensionState::Deployed,
                storage: Some(StorageInfo {
                    path,
                    checksum: record.checksum.clone(),
                    size_bytes,
                }),
                extension: record.extension,
                state: record.state,
                state_history: record.state_history,
                dependencies: record.dependencies,
                dependents: BTreeSet::new(),
                metrics: ExtensionMetrics::default(),
                created_by: None,
            };
            registry.insert(id.clone(), entry);
            summary.loaded.push(id);
        }
        let ids: Vec<ExtensionId> = registry.keys().cloned().collect();
        for id in ids {
            let dependents = dependents_of(&registry, &id);
            if let Some(entry) = registry.get_mut(&id) {
                entry.dependents = dependents;
            }
        }
        for (path, error) in report.failures {
            summary.rejected.push((path, error.to_string()));
        }
        info!(
            "Restored {} extension(s), rejected {}",
            summary.loaded.len(),
            summary.rejected.len()
        );
        Ok(summary)
    }

    fn check_extension(&self, extension: &TemplateExtension) -> Result<(), LifecycleError> {
        let issues = self.engine.validator().extension_issues(extension);
        if issues.is_empty() {
            Ok(())
        } else {
            Err(LifecycleError::InvalidExtension {
                extension_id: extension.id.clone(),
                issues,
            })
        }
    }
}

impl fmt::Debug for ExtensionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionManager")
            .field("extensions", &self.registry.read().len())
            .field("config", &self.config)
            .field("persistent", &self.storage.is_some())
            .finish()
    }
}

fn dependents_of(
    registry: &HashMap<ExtensionId, ExtensionRegistryEntry>,
    id: &ExtensionId,
) -> BTreeSet<ExtensionId> {
    registry
        .values()
        .filter(|other| other.dependencies.contains(id))
        .map(|other| other.extension.id.clone())
        .collect()
}

/// Move `id` from the dependents of `old` to the dependents of `new`
fn link_dependencies(
    registry: &mut HashMap<ExtensionId, ExtensionRegistryEntry>,
    id: &ExtensionId,
    old: &[ExtensionId],
    new: &[ExtensionId],
) {
    for dep in old.iter().filter(|d| !new.contains(d)) {
        if let Some(entry) = registry.get_mut(dep) {
            entry.dependents.remove(id);
        }
    }
    for dep in new {
        if let Some(entry) = registry.get_mut(dep) {
            entry.dependents.insert(id.clone());
        }
    }
}

fn build_node(
    id: &ExtensionId,
    registry: &HashMap<ExtensionId, ExtensionRegistryEntry>,
    path: &mut Vec<ExtensionId>,
) -> DependencyNode {
    let mut node = DependencyNode {
        id: id.clone(),
        state: None,
        circular: false,
        missing: false,
        dependencies: Vec::new(),
    };
    if path.contains(id) {
        node.circular = true;
        return node;
    }
    let Some(entry) = registry.get(id) else {
        node.missing = true;
        return node;
    };

    node.state = Some(entry.state);
    path.push(id.clone());
    node.dependencies = entry
        .dependencies
        .iter()
        .map(|dep| build_node(dep, registry, path))
        .collect();
    path.pop();
    node
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::SampleOutcome;
    use crate::store::TemplateStore;
    use crate::validator::Validator;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn engine() -> Arc<InheritanceEngine> {
        let store = Arc::new(TemplateStore::new());
        let validator = Arc::new(Validator::default().with_store(store.clone()));
        let engine = InheritanceEngine::new(store, validator);
        engine
            .register_template(Template::builder().id("base").name("Base").deny(["eval("]).build().unwrap())
            .unwrap();
        Arc::new(engine)
    }

    fn manager() -> ExtensionManager {
        ExtensionManager::new(engine()).unwrap()
    }

    fn extension(id: &str, priority: i32, marker: &str) -> TemplateExtension {
        TemplateExtension::new(id, id, "base")
            .with_rules(RulesPatch::new().ask([marker]))
            .with_priority(priority)
    }

    fn deploy(manager: &ExtensionManager, id: &str) {
        let id = ExtensionId::new(id);
        manager
            .transition_extension_state(&id, ExtensionState::Testing, None, None)
            .unwrap();
        manager
            .transition_extension_state(&id, ExtensionState::Approved, None, Some("lead"))
            .unwrap();
        manager
            .deploy_extension(&id, DeploymentOptions::new(DeploymentStrategy::Immediate).deployed_by("ops"))
            .unwrap();
    }

    /// Probe returning a fixed number of failures per call
    struct FailingProbe {
        calls: AtomicUsize,
    }

    impl HealthProbe for FailingProbe {
        fn probe(&self, _: &TemplateExtension, _: f64) -> HealthMetrics {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut m = HealthMetrics::new();
            m.record(SampleOutcome::Invalid, 10);
            m
        }
    }

    #[test]
    fn test_transition_table() {
        use ExtensionState::*;
        assert!(Draft.can_transition_to(Testing));
        assert!(!Deployed.can_transition_to(Testing));
        assert!(Archived.is_terminal());
        assert_eq!(TransitionHandler::for_transition(Draft, Testing), Some(TransitionHandler::SelfTest));
        assert_eq!(TransitionHandler::for_transition(Deployed, Approved), Some(TransitionHandler::Deactivate));
        assert_eq!(TransitionHandler::for_transition(Approved, Archived), Some(TransitionHandler::Retire));
        assert_eq!(TransitionHandler::for_transition(Deployed, Testing), None);
    }

    #[test]
    fn test_full_lifecycle_with_approvals() {
        let manager = manager();
        manager.create_extension(extension("e1", 0, "m"), vec![], Some("dev")).unwrap();
        let id = ExtensionId::new("e1");

        manager.transition_extension_state(&id, ExtensionState::Testing, None, None).unwrap();
        let err = manager
            .transition_extension_state(&id, ExtensionState::Approved, None, None)
            .unwrap_err();
        assert!(matches!(err, LifecycleError::ApprovalRequired { .. }));
        assert_eq!(manager.get_extension(&id).unwrap().state, ExtensionState::Testing);

        manager
            .transition_extension_state(&id, ExtensionState::Approved, None, Some("lead"))
            .unwrap();
        let record = manager
            .deploy_extension(&id, DeploymentOptions::new(DeploymentStrategy::Immediate).deployed_by("ops"))
            .unwrap();
        assert_eq!(record.status, DeploymentStatus::Succeeded);

        let entry = manager.get_extension(&id).unwrap();
        assert_eq!(entry.state, ExtensionState::Deployed);
        assert!(entry.active);
        assert_eq!(entry.state_history.len(), 3);
        assert_eq!(entry.state_history[1].approved_by.as_deref(), Some("lead"));

        let err = manager
            .transition_extension_state(&id, ExtensionState::Testing, None, None)
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidTransition { .. }));

        manager.transition_extension_state(&id, ExtensionState::Deprecated, None, None).unwrap();
        manager.transition_extension_state(&id, ExtensionState::Archived, None, None).unwrap();
        for target in [ExtensionState::Draft, ExtensionState::Testing, ExtensionState::Deployed] {
            assert!(manager.transition_extension_state(&id, target, None, None).is_err());
        }
        assert_eq!(manager.get_extension(&id).unwrap().state_history.len(), 5);
    }

    #[test]
    fn test_auto_approve() {
        let config = LifecycleConfig {
            auto_approve: true,
            ..LifecycleConfig::default()
        };
        let manager = ExtensionManager::with_config(config, engine()).unwrap();
        manager.create_extension(extension("e1", 0, "m"), vec![], None).unwrap();
        let id = ExtensionId::new("e1");
        manager.transition_extension_state(&id, ExtensionState::Testing, None, None).unwrap();
        manager.transition_extension_state(&id, ExtensionState::Approved, None, None).unwrap();
        manager.deploy_extension(&id, DeploymentOptions::default()).unwrap();
        assert_eq!(manager.get_extension(&id).unwrap().state, ExtensionState::Deployed);
    }

    #[test]
    fn test_invalid_extensions_rejected() {
        let manager = manager();
        let empty = TemplateExtension::new("noop", "No-op", "base");
        assert!(matches!(
            manager.create_extension(empty, vec![], None),
            Err(LifecycleError::InvalidExtension { .. })
        ));
        manager.create_extension(extension("e1", 0, "m"), vec![], None).unwrap();
        assert!(matches!(
            manager.create_extension(extension("e1", 0, "m"), vec![], None),
            Err(LifecycleError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_update_returns_testing_to_draft() {
        let manager = manager();
        manager.create_extension(extension("e1", 0, "m"), vec![], None).unwrap();
        let id = ExtensionId::new("e1");
        manager.transition_extension_state(&id, ExtensionState::Testing, None, None).unwrap();

        let updated = manager
            .update_extension(
                &id,
                ExtensionUpdate {
                    priority: Some(7),
                    ..ExtensionUpdate::default()
                },
                Some("dev"),
            )
            .unwrap();
        assert_eq!(updated.state, ExtensionState::Draft);
        assert_eq!(updated.extension.priority, 7);

        deploy(&manager, "e1");
        assert!(matches!(
            manager.update_extension(&id, ExtensionUpdate::default(), None),
            Err(LifecycleError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_failed_deployment_leaves_state_unchanged() {
        let probe = Arc::new(FailingProbe {
            calls: AtomicUsize::new(0),
        });
        let manager = manager().with_probe(probe.clone());
        manager.create_extension(extension("e1", 0, "m"), vec![], None).unwrap();
        let id = ExtensionId::new("e1");
        manager.transition_extension_state(&id, ExtensionState::Testing, None, None).unwrap();
        manager
            .transition_extension_state(&id, ExtensionState::Approved, None, Some("lead"))
            .unwrap();

        let err = manager
            .deploy_extension(
                &id,
                DeploymentOptions::new(DeploymentStrategy::Gradual {
                    stages: 3,
                    stage_interval_ms: 0,
                })
                .deployed_by("ops"),
            )
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Deployment { status: DeploymentStatus::Failed, .. }));
        assert!(probe.calls.load(Ordering::SeqCst) >= 1);
        assert_eq!(manager.get_extension(&id).unwrap().state, ExtensionState::Approved);
        let history = manager.deployments(&id);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, DeploymentStatus::Failed);
    }

    #[test]
    fn test_cancelled_deployment() {
        let manager = manager();
        manager.create_extension(extension("e1", 0, "m"), vec![], None).unwrap();
        let id = ExtensionId::new("e1");
        manager.transition_extension_state(&id, ExtensionState::Testing, None, None).unwrap();
        manager
            .transition_extension_state(&id, ExtensionState::Approved, None, Some("lead"))
            .unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let err = manager
            .deploy_extension_cancellable(
                &id,
                DeploymentOptions::new(DeploymentStrategy::Immediate).deployed_by("ops"),
                &token,
            )
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Deployment { status: DeploymentStatus::Cancelled, .. }));
        assert_eq!(manager.get_extension(&id).unwrap().state, ExtensionState::Approved);
    }

    #[test]
    fn test_rollback() {
        let manager = manager();
        manager.create_extension(extension("e1", 0, "m"), vec![], None).unwrap();
        deploy(&manager, "e1");
        let id = ExtensionId::new("e1");

        let entry = manager.rollback_extension(&id, "error spike", Some("ops")).unwrap();
        assert_eq!(entry.state, ExtensionState::Approved);
        assert!(!entry.active);
        assert_eq!(manager.deployments(&id)[0].status, DeploymentStatus::RolledBack);
        assert!(matches!(
            manager.rollback_extension(&id, "again", None),
            Err(LifecycleError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_apply_extensions_priority_and_isolation() {
        let manager = manager();
        for (id, priority) in [("e10", 10), ("e5", 5), ("e20", 20)] {
            manager
                .create_extension(extension(id, priority, &format!("m{}", priority)), vec![], None)
                .unwrap();
            deploy(&manager, id);
        }
        manager.create_extension(extension("draft", 0, "never"), vec![], None).unwrap();

        let base = manager.engine.get_template(&"base".into()).unwrap();
        let report = manager.apply_extensions(&base, &BuildContext::default(), None);
        assert_eq!(report.template.rules.ask, vec!["m5", "m10", "m20"]);
        assert_eq!(report.applied.len(), 3);
        assert!(report.failed.is_empty());
        assert_eq!(manager.metrics(&"e5".into()).unwrap().applications, 1);

        let only = [ExtensionId::new("e20")];
        let report = manager.apply_extensions(&base, &BuildContext::default(), Some(&only));
        assert_eq!(report.template.rules.ask, vec!["m20"]);
    }

    #[test]
    fn test_apply_isolates_broken_extension() {
        let manager = manager();
        manager.create_extension(extension("good", 1, "ok"), vec![], None).unwrap();
        deploy(&manager, "good");
        manager.create_extension(extension("bad", 0, "x"), vec![], None).unwrap();
        deploy(&manager, "bad");

        // Corrupt the deployed body behind the manager's back
        if let Some(entry) = manager.registry.write().get_mut(&ExtensionId::new("bad")) {
            entry.extension.rules = RulesPatch::new().deny([" "]);
        }

        let base = manager.engine.get_template(&"base".into()).unwrap();
        let report = manager.apply_extensions(&base, &BuildContext::default(), None);
        assert_eq!(report.applied, vec![ExtensionId::new("good")]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.template.rules.ask, vec!["ok"]);
        assert_eq!(manager.metrics(&"bad".into()).unwrap().failures, 1);
    }

    #[test]
    fn test_dependency_graph_and_delete() {
        let manager = manager();
        manager.create_extension(extension("a", 0, "a"), vec!["b".into()], None).unwrap();
        manager.create_extension(extension("b", 0, "b"), vec!["a".into(), "ghost".into()], None).unwrap();
        let dependents = |id: &str| -> Vec<ExtensionId> {
            manager.get_extension(&id.into()).unwrap().dependents.into_iter().collect()
        };
        assert_eq!(dependents("a"), vec![ExtensionId::new("b")]);
        assert_eq!(dependents("b"), vec![ExtensionId::new("a")]);

        let graph = manager.get_dependency_graph(&"a".into());
        assert!(graph.is_unhealthy());
        let b = &graph.dependencies[0];
        assert!(b.dependencies[0].circular);
        assert!(b.dependencies[1].missing);

        assert!(matches!(
            manager.delete_extension(&"b".into(), None),
            Err(LifecycleError::HasDependents { .. })
        ));
        manager
            .update_extension(&"b".into(), ExtensionUpdate { dependencies: Some(vec![]), ..Default::default() }, None)
            .unwrap();
        assert!(dependents("a").is_empty());
        assert!(matches!(
            manager.delete_extension(&"b".into(), None),
            Err(LifecycleError::HasDependents { .. })
        ));
        manager.delete_extension(&"a".into(), None).unwrap();
        assert!(dependents("b").is_empty());
        manager.delete_extension(&"b".into(), None).unwrap();
        assert!(manager.list_extensions(None).is_empty());
    }

    #[test]
    fn test_metrics_track_installs_errors_and_score() {
        let manager = manager();
        manager.create_extension(extension("good", 1, "ok"), vec![], None).unwrap();
        deploy(&manager, "good");
        manager.create_extension(extension("bad", 0, "x"), vec![], None).unwrap();
        deploy(&manager, "bad");
        if let Some(entry) = manager.registry.write().get_mut(&ExtensionId::new("bad")) {
            entry.extension.rules = RulesPatch::new().deny([" "]);
        }

        let base = manager.engine.get_template(&"base".into()).unwrap();
        manager.apply_extensions(&base, &BuildContext::default(), None);
        manager.apply_extensions(&base, &BuildContext::default(), None);

        let good = manager.metrics(&"good".into()).unwrap();
        assert_eq!(good.installations, 1);
        assert_eq!(good.error_rate(), 0.0);
        assert_eq!(good.performance_score, Some(1.0));
        let bad = manager.metrics(&"bad".into()).unwrap();
        assert_eq!(bad.failures, 2);
        assert_eq!(bad.error_rate(), 1.0);

        manager.rollback_extension(&"good".into(), "test", None).unwrap();
        manager
            .deploy_extension(
                &"good".into(),
                DeploymentOptions::new(DeploymentStrategy::Immediate).deployed_by("ops"),
            )
            .unwrap();
        assert_eq!(manager.metrics(&"good".into()).unwrap().installations, 2);
    }

    #[test]
    fn test_activation_through_transition_runs_rollout() {
        let manager = manager();
        manager.create_extension(extension("e1", 0, "m"), vec![], None).unwrap();
        let id = ExtensionId::new("e1");
        manager.transition_extension_state(&id, ExtensionState::Testing, None, None).unwrap();
        manager
            .transition_extension_state(&id, ExtensionState::Approved, None, Some("lead"))
            .unwrap();

        assert!(matches!(
            manager.transition_extension_state(&id, ExtensionState::Deployed, None, None),
            Err(LifecycleError::ApprovalRequired { .. })
        ));
        let entry = manager
            .transition_extension_state(&id, ExtensionState::Deployed, None, Some("ops"))
            .unwrap();
        assert_eq!(entry.state, ExtensionState::Deployed);
        let history = manager.deployments(&id);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, DeploymentStatus::Succeeded);
        assert_eq!(history[0].deployed_by.as_deref(), Some("ops"));

        let failing = Arc::new(FailingProbe {
            calls: AtomicUsize::new(0),
        });
        let manager = ExtensionManager::new(engine()).unwrap().with_probe(failing);
        manager.create_extension(extension("e2", 0, "m"), vec![], None).unwrap();
        let id = ExtensionId::new("e2");
        manager.transition_extension_state(&id, ExtensionState::Testing, None, None).unwrap();
        manager
            .transition_extension_state(&id, ExtensionState::Approved, None, Some("lead"))
            .unwrap();
        assert!(matches!(
            manager.transition_extension_state(&id, ExtensionState::Deployed, None, Some("ops")),
            Err(LifecycleError::Deployment { .. })
        ));
        assert_eq!(manager.get_extension(&id).unwrap().state, ExtensionState::Approved);
        assert_eq!(manager.deployments(&id)[0].status, DeploymentStatus::Failed);
    }

    #[test]
    fn test_marketplace() {
        let manager = manager();
        manager.create_extension(extension("e1", 0, "m"), vec![], None).unwrap();
        assert!(matches!(
            manager.publish_extension(&"e1".into(), "acme"),
            Err(LifecycleError::MarketplaceDisabled)
        ));

        let config = LifecycleConfig {
            marketplace_enabled: true,
            ..LifecycleConfig::default()
        };
        let manager = ExtensionManager::with_config(config, engine()).unwrap();
        manager.create_extension(extension("e1", 0, "m"), vec![], None).unwrap();
        assert!(matches!(
            manager.publish_extension(&"e1".into(), "acme"),
            Err(LifecycleError::InvalidState { .. })
        ));
        deploy(&manager, "e1");
        let published = manager.publish_extension(&"e1".into(), "acme").unwrap();
        assert_eq!(published.checksum.len(), 64);
        assert_eq!(manager.list_published().len(), 1);
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = TempDir::new().unwrap();
        let config = LifecycleConfig {
            storage_dir: Some(dir.path().to_path_buf()),
            ..LifecycleConfig::default()
        };
        let engine = engine();
        let manager = ExtensionManager::with_config(config.clone(), engine.clone()).unwrap();
        manager.create_extension(extension("e1", 0, "m"), vec![], None).unwrap();
        deploy(&manager, "e1");
        manager.create_extension(extension("e2", 0, "n"), vec![], None).unwrap();
        assert!(manager.get_extension(&"e1".into()).unwrap().storage.is_some());

        std::fs::write(dir.path().join("e2.json"), b"{}").unwrap();

        let restored = ExtensionManager::with_config(config, engine).unwrap();
        let summary = restored.load_from_storage().unwrap();
        assert_eq!(summary.loaded, vec![ExtensionId::new("e1")]);
        assert_eq!(summary.rejected.len(), 1);
        let entry = restored.get_extension(&"e1".into()).unwrap();
        assert_eq!(entry.state, ExtensionState::Deployed);
        assert!(entry.active);
        assert_eq!(entry.state_history.len(), 3);
    }
}
