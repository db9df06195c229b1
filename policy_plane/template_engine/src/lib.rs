// Template Engine - hierarchical security rule templates
//
// Templates carry deny/allow/ask rule lists and inherit from each other in a
// base -> organization -> team -> project -> user hierarchy. Resolution walks
// the ancestor chain, folds it with the composer, applies prioritized
// extensions and validates the result. Extensions follow a governed
// lifecycle (draft -> testing -> approved -> deployed) with staged rollout.
//
// Architecture:
// - template: data model (ids, versions, rule sets, extensions, contexts)
// - store: shared template registry with revisions
// - validator: accumulating validation, custom rules run in the sandbox
// - composer: deterministic merging with conflict policies
// - inheritance: registry operations and chain resolution
// - extensions / deployment / persistence: extension lifecycle
// - TemplateEngine: wires everything from one EngineConfig

pub mod cache;
pub mod composer;
pub mod conditions;
pub mod config;
pub mod deployment;
pub mod error;
pub mod extensions;
pub mod inheritance;
pub mod persistence;
pub mod store;
pub mod template;
pub mod validator;

use std::sync::Arc;

use template_sandbox::{Isolator, Sandbox};

pub use cache::{content_hash, CacheStats, ResultCache};
pub use composer::{
    detect_cycles, ArrayMergeMode, Composer, CompositionConfig, CompositionEntry, CompositionError,
    CompositionOutput, CompositionResult, Conflict, ConflictOutcome, ConflictResolution,
    ConflictStrategy, ConflictType, MergeStrategy, ObjectMergeMode, RuleMergeMode,
};
pub use conditions::{evaluate_conditions, ComparisonOp, Condition, ConditionSource};
pub use config::{ConfigError, EngineConfig, InheritanceConfig, LifecycleConfig, ValidationConfig};
pub use deployment::{
    CancellationToken, DefaultHealthProbe, DeploymentOptions, DeploymentRecord, DeploymentStatus,
    DeploymentStrategy, HealthMetrics, HealthProbe, HealthThresholds, RollbackTriggers,
    RolloutController, RolloutOutcome, SampleOutcome,
};
pub use error::{EngineError, EngineResult};
pub use extensions::{
    ApplyReport, DependencyNode, ExtensionManager, ExtensionMetrics, ExtensionRegistryEntry,
    ExtensionState, ExtensionUpdate, LifecycleError, PublishedExtension, RestoreSummary,
    StateTransition, TransitionHandler,
};
pub use inheritance::{InheritanceEngine, InheritanceError, TemplateDraft};
pub use persistence::{ExtensionRecord, ExtensionStorage, StorageError, StorageInfo};
pub use store::{StoredTemplate, TemplateStore};
pub use template::{
    BuildContext, CustomValidationRef, CustomValidationRule, ExtensionId, ExtensionKind,
    ExtensionMetadata, ExtensionType, InheritanceLevel, InheritanceMetadata, ModelError,
    OverridePermissions, ParameterType, RuleCategory, RulePath, RuleSelector, RuleSet, RuleSeverity,
    RulesPatch, Template, TemplateBuilder, TemplateExtension, TemplateId, TemplateLock,
    TemplateMetadata, TemplateParameter, TemplateScope, UserContext, Version,
};
pub use validator::{
    default_utilities, ValidationError, ValidationPerformance, ValidationResult, ValidationWarning,
    Validator,
};

/// All components wired against one store and one sandbox
pub struct TemplateEngine {
    config: EngineConfig,
    store: Arc<TemplateStore>,
    sandbox: Arc<Sandbox>,
    validator: Arc<Validator>,
    composer: Composer,
    inheritance: Arc<InheritanceEngine>,
    extensions: ExtensionManager,
}

impl TemplateEngine {
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;

        let store = Arc::new(TemplateStore::new());
        let sandbox = Arc::new(Sandbox::with_limits(config.sandbox.clone()));
        let isolator: Arc<dyn Isolator> = sandbox.clone();
        let validator = Arc::new(
            Validator::with_config(config.validation.clone(), isolator).with_store(store.clone()),
        );
        let composer = Composer::new();
        let inheritance = Arc::new(
            InheritanceEngine::with_config(config.inheritance.clone(), store.clone(), validator.clone())
                .with_composer(composer.clone()),
        );
        let extensions = ExtensionManager::with_config(config.lifecycle.clone(), inheritance.clone())?;

        log::info!(
            "Template engine ready (auto_approve={}, persistence={})",
            config.lifecycle.auto_approve,
            config.lifecycle.storage_dir.is_some()
        );

        Ok(Self {
            config,
            store,
            sandbox,
            validator,
            composer,
            inheritance,
            extensions,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<TemplateStore> {
        &self.store
    }

    pub fn sandbox(&self) -> &Arc<Sandbox> {
        &self.sandbox
    }

    pub fn validator(&self) -> &Arc<Validator> {
        &self.validator
    }

    pub fn composer(&self) -> &Composer {
        &self.composer
    }

    pub fn inheritance(&self) -> &Arc<InheritanceEngine> {
        &self.inheritance
    }

    pub fn extensions(&self) -> &ExtensionManager {
        &self.extensions
    }

    pub fn register_template(&self, template: Template) -> EngineResult<Arc<Template>> {
        Ok(self.inheritance.register_template(template)?)
    }

    /// Resolve the chain, then apply deployed extensions from the manager
    pub fn build(&self, id: &TemplateId, ctx: &BuildContext) -> EngineResult<ApplyReport> {
        let resolved = self.inheritance.resolve_template(id, ctx)?;
        Ok(self.extensions.apply_extensions(&resolved, ctx, None))
    }

    pub fn compose_from_config(
        &self,
        config: &CompositionConfig,
        ctx: &BuildContext,
    ) -> EngineResult<CompositionResult> {
        Ok(self.composer.compose_from_config(config, &self.store, ctx)?)
    }
}

impl std::fmt::Debug for TemplateEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateEngine")
            .field("templates", &self.store.len())
            .field("inheritance", &self.inheritance)
            .field("extensions", &self.extensions)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_wires_components() {
        let engine = TemplateEngine::new(EngineConfig::default()).unwrap();
        engine
            .register_template(Template::builder().id("base").name("Base").deny(["eval("]).build().unwrap())
            .unwrap();
        assert_eq!(engine.store().len(), 1);
        assert!(engine.inheritance().get_template(&"base".into()).is_some());

        let report = engine.build(&"base".into(), &BuildContext::default()).unwrap();
        assert_eq!(report.template.rules.deny, vec!["eval("]);
        assert!(report.applied.is_empty());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = EngineConfig::default();
        config.inheritance.max_depth = 0;
        assert!(matches!(TemplateEngine::new(config), Err(EngineError::Config(_))));
    }
}
