// Engine configuration.
//
// Every section deserializes with defaults so a partial JSON document (or an
// empty one) yields a working configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use template_sandbox::{LimitsError, SandboxLimits};
use thiserror::Error;

use crate::deployment::{HealthThresholds, RollbackTriggers};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid sandbox limits: {0}")]
    Limits(#[from] LimitsError),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Serialized size above which a performance warning is raised
    pub max_template_bytes: usize,
    /// Chain length above which a depth warning is raised
    pub chain_depth_warning: usize,
    pub cache_enabled: bool,
    pub cache_capacity: usize,
    /// Limits applied to each custom validation rule
    pub custom_rule_limits: SandboxLimits,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_template_bytes: 1024 * 1024,
            chain_depth_warning: 10,
            cache_enabled: true,
            cache_capacity: 1024,
            custom_rule_limits: SandboxLimits::validation_rule(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InheritanceConfig {
    /// Hard limit on chain length during resolution
    pub max_depth: usize,
    pub cache_enabled: bool,
    pub cache_capacity: usize,
}

impl Default for InheritanceConfig {
    fn default() -> Self {
        Self {
            max_depth: 64,
            cache_enabled: true,
            cache_capacity: 512,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Skip the approver requirement on testing->approved and approved->deployed
    pub auto_approve: bool,
    /// Directory for extension records; persistence is off when unset
    pub storage_dir: Option<PathBuf>,
    pub health_thresholds: HealthThresholds,
    pub rollback_triggers: RollbackTriggers,
    pub marketplace_enabled: bool,
    /// Deployment history kept per extension
    pub max_deployment_history: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            auto_approve: false,
            storage_dir: None,
            health_thresholds: HealthThresholds::default(),
            rollback_triggers: RollbackTriggers::default(),
            marketplace_enabled: false,
            max_deployment_history: 20,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sandbox: SandboxLimits,
    pub validation: ValidationConfig,
    pub inheritance: InheritanceConfig,
    pub lifecycle: LifecycleConfig,
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sandbox.validate()?;
        self.validation.custom_rule_limits.validate()?;
        if self.inheritance.max_depth == 0 {
            return Err(ConfigError::InvalidValue {
                field: "inheritance.max_depth",
                reason: "must be at least 1".to_string(),
            });
        }
        let rate = self.lifecycle.health_thresholds.max_invalid_ratio;
        if !(0.0..=1.0).contains(&rate) {
            return Err(ConfigError::InvalidValue {
                field: "lifecycle.health_thresholds.max_invalid_ratio",
                reason: format!("{} is outside 0.0-1.0", rate),
            });
        }
        Ok(())
    }

    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lifecycle.storage_dir = Some(dir.into());
        self
    }

    pub fn with_auto_approve(mut self, auto_approve: bool) -> Self {
        self.lifecycle.auto_approve = auto_approve;
        self
    }

    pub fn with_marketplace(mut self, enabled: bool) -> Self {
        self.lifecycle.marketplace_enabled = enabled;
        self
    }

    pub fn without_caches(mut self) -> Self {
        self.validation.cache_enabled = false;
        self.inheritance.cache_enabled = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.validation.max_template_bytes, 1024 * 1024);
        assert_eq!(config.validation.chain_depth_warning, 10);
        assert_eq!(config.inheritance.max_depth, 64);
        assert!(!config.lifecycle.auto_approve);
        assert_eq!(config.lifecycle.rollback_triggers.consecutive_health_failures, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = EngineConfig::from_json(
            r#"{"lifecycle": {"auto_approve": true}, "inheritance": {"max_depth": 8}}"#,
        )
        .unwrap();
        assert!(config.lifecycle.auto_approve);
        assert_eq!(config.inheritance.max_depth, 8);
        assert!(config.inheritance.cache_enabled);
        assert_eq!(config.validation, ValidationConfig::default());

        let empty = EngineConfig::from_json("{}").unwrap();
        assert_eq!(empty, EngineConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            EngineConfig::from_json(r#"{"inheritance": {"max_depth": 0}}"#),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            EngineConfig::from_json(r#"{"sandbox": {"timeout_ms": 0}}"#),
            Err(ConfigError::Limits(_))
        ));
        assert!(matches!(EngineConfig::from_json("{"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_json_round_trip() {
        let config = EngineConfig::default().with_auto_approve(true).without_caches();
        let back = EngineConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(back, config);
    }
}
