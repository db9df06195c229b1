// Structural and semantic checks for templates.
//
// Design Principles:
// 1. Accumulate, never short-circuit: one call reports every problem
// 2. Author-supplied rules only run through the Isolator
// 3. A failing sandbox degrades to a warning, never to a failed call
// 4. Results are cached by content hash and evicted when the template changes
//
// Validation steps (validate_template):
// 1. Structure: required fields, version, parameters, size
// 2. Inheritance: parent existence, chain depth, chain duplicates
// 3. Configuration schema: non-empty rule patterns
// 4. Security heuristics (warnings only)
// 5. Attached extensions
// 6. Custom rules in the sandbox
// 7. Permissions and scope

use log::{debug, warn};
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use template_sandbox::{ExecutionRequest, Isolator, Sandbox, UtilityRegistry};
use thiserror::Error;

use crate::cache::{content_hash, CacheStats, ResultCache};
use crate::conditions::ComparisonOp;
use crate::config::ValidationConfig;
use crate::store::TemplateStore;
use crate::template::{
    BuildContext, CustomValidationRef, CustomValidationRule, RuleCategory, Template,
    TemplateExtension, TemplateId,
};

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Empty pattern in {category} at index {index}")]
    EmptyPattern { category: RuleCategory, index: usize },

    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("Parent template not found: {0}")]
    ParentNotFound(String),

    #[error("Circular inheritance: {template_id} repeats {repeated} in its chain")]
    CircularChain { template_id: String, repeated: String },

    #[error("Unknown configuration key: {0}")]
    UnknownKey(String),

    #[error("Configuration key {0} must be an array")]
    NotAnArray(String),

    #[error("Configuration entry {key}[{index}] must be a string")]
    NonStringEntry { key: String, index: usize },

    #[error("Configuration must be an object")]
    NotAnObject,

    #[error("Invalid extension {extension_id}: {reason}")]
    InvalidExtension { extension_id: String, reason: String },

    #[error("Custom rule {rule_id} failed: {message}")]
    CustomRuleFailed { rule_id: String, message: String },

    #[error("Organization mismatch: template scoped to {expected}, user belongs to {actual}")]
    ScopeMismatch { expected: String, actual: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValidationWarning {
    OversizedTemplate { bytes: usize, limit: usize },
    DeepChain { depth: usize, threshold: usize },
    EmptyRuleSet,
    WildcardAllow { pattern: String },
    AllowDenyOverlap { pattern: String },
    CustomRuleWarning { rule_id: String, message: String },
    CustomRuleMissing { rule_id: String },
    CustomRuleSkipped { rule_id: String, reason: String },
    MissingParameter { name: String },
    MissingOrganization { expected: String },
    MissingPermission { permission: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationPerformance {
    pub duration_us: u64,
    pub template_bytes: usize,
    pub rule_count: usize,
    pub custom_rules_executed: usize,
    pub cache_hit: bool,
}

/// Validation result with detailed errors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
    pub performance: ValidationPerformance,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            performance: ValidationPerformance::default(),
        }
    }

    pub fn with_error(error: ValidationError) -> Self {
        let mut result = Self::valid();
        result.add_error(error);
        result
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.is_valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    pub fn merge(&mut self, other: ValidationResult) {
        if !other.is_valid {
            self.is_valid = false;
        }
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
        self.performance.custom_rules_executed += other.performance.custom_rules_executed;
    }

    /// One-line summary of the errors, for wrapping into other error types
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::valid()
    }
}

// ============================================================================
// Validator
// ============================================================================

/// Whitelisted helpers offered to custom rules as `utils.*`
pub fn default_utilities() -> UtilityRegistry {
    let mut utilities = UtilityRegistry::new();
    utilities.register("isNonEmptyString", |args: &[Value]| {
        Ok(Value::Bool(
            args.first()
                .and_then(Value::as_str)
                .map(|s| !s.trim().is_empty())
                .unwrap_or(false),
        ))
    });
    utilities.register("matchesRegex", |args: &[Value]| {
        let (Some(pattern), Some(text)) = (
            args.first().and_then(Value::as_str),
            args.get(1).and_then(Value::as_str),
        ) else {
            return Err("matchesRegex(pattern, text) expects two strings".to_string());
        };
        if pattern.len() > 1024 {
            return Err("pattern too long".to_string());
        }
        Regex::new(pattern)
            .map(|re| Value::Bool(re.is_match(text)))
            .map_err(|e| e.to_string())
    });
    utilities.register("uniqueCount", |args: &[Value]| {
        let items = args
            .first()
            .and_then(Value::as_array)
            .ok_or_else(|| "uniqueCount(array) expects an array".to_string())?;
        let distinct: HashSet<String> = items.iter().map(|v| v.to_string()).collect();
        Ok(json!(distinct.len()))
    });
    utilities
}

pub struct Validator {
    config: ValidationConfig,
    isolator: Arc<dyn Isolator>,
    custom_rules: RwLock<HashMap<String, CustomValidationRule>>,
    utilities: RwLock<Arc<UtilityRegistry>>,
    cache: ResultCache<ValidationResult>,
    store: Option<Arc<TemplateStore>>,
}

impl Validator {
    pub fn new(isolator: Arc<dyn Isolator>) -> Self {
        Self::with_config(ValidationConfig::default(), isolator)
    }

    pub fn with_config(config: ValidationConfig, isolator: Arc<dyn Isolator>) -> Self {
        Self {
            cache: ResultCache::new(config.cache_capacity, config.cache_enabled),
            config,
            isolator,
            custom_rules: RwLock::new(HashMap::new()),
            utilities: RwLock::new(Arc::new(default_utilities())),
            store: None,
        }
    }

    /// Resolve parent references against this store
    pub fn with_store(mut self, store: Arc<TemplateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    pub fn register_custom_rule(&self, rule: CustomValidationRule) {
        self.custom_rules.write().insert(rule.id.clone(), rule);
        // Cached results may have recorded the rule as missing
        self.cache.clear();
    }

    pub fn unregister_custom_rule(&self, rule_id: &str) -> Option<CustomValidationRule> {
        let removed = self.custom_rules.write().remove(rule_id);
        if removed.is_some() {
            self.cache.clear();
        }
        removed
    }

    pub fn register_utility<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        {
            let mut utilities = self.utilities.write();
            Arc::make_mut(&mut *utilities).register(name, f);
        }
        self.cache.clear();
    }

    /// Evict cached results tagged with this template
    pub fn invalidate(&self, template_id: &TemplateId) -> usize {
        self.cache.invalidate(template_id)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Full validation against a build context
    pub fn validate_template(&self, template: &Template, ctx: &BuildContext) -> ValidationResult {
        let started = Instant::now();
        let serialized = serde_json::to_vec(template).ok();
        let key = serialized.as_ref().and_then(|bytes| cache_key(bytes, ctx));

        if let Some(key) = &key {
            if let Some(mut cached) = self.cache.get(key) {
                debug!("Validation cache hit for {}", template.id);
                cached.performance.cache_hit = true;
                cached.performance.duration_us = started.elapsed().as_micros() as u64;
                return cached;
            }
        }

        let template_bytes = serialized.as_ref().map(Vec::len).unwrap_or(0);
        let mut result = ValidationResult::valid();

        // 1. Structure
        self.validate_basic(template, template_bytes, &mut result);

        // 2. Inheritance
        self.validate_inheritance(template, &mut result);

        // 3. Configuration schema
        self.validate_rule_patterns(template, &mut result);

        // 4. Security heuristics
        self.check_security(template, &mut result);

        // 5. Attached extensions
        self.validate_attached_extensions(template, &mut result);

        // 6. Custom rules
        self.run_custom_rules(template, ctx, &mut result);

        // 7. Permissions and scope
        self.check_scope(template, ctx, &mut result);

        self.check_parameters(template, ctx, &mut result);

        result.performance.template_bytes = template_bytes;
        result.performance.rule_count = template.rules.rule_count();
        result.performance.duration_us = started.elapsed().as_micros() as u64;

        if let Some(key) = key {
            self.cache.insert(key, result.clone(), cache_tags(template));
        }
        result
    }

    /// Context-free checks used when registering templates
    pub fn validate_structure(&self, template: &Template) -> ValidationResult {
        let template_bytes = serde_json::to_vec(template).map(|b| b.len()).unwrap_or(0);
        let mut result = ValidationResult::valid();
        self.validate_basic(template, template_bytes, &mut result);
        self.validate_chain_shape(template, &mut result);
        self.validate_rule_patterns(template, &mut result);
        self.validate_attached_extensions(template, &mut result);
        result.performance.template_bytes = template_bytes;
        result.performance.rule_count = template.rules.rule_count();
        result
    }

    /// Schema check for an untyped rules document
    pub fn validate_configuration(&self, config: &Value) -> ValidationResult {
        let mut result = ValidationResult::valid();
        let Some(object) = config.as_object() else {
            result.add_error(ValidationError::NotAnObject);
            return result;
        };

        for (key, value) in object {
            let Ok(category) = key.parse::<RuleCategory>() else {
                result.add_error(ValidationError::UnknownKey(key.clone()));
                continue;
            };
            let Some(entries) = value.as_array() else {
                result.add_error(ValidationError::NotAnArray(key.clone()));
                continue;
            };
            for (index, entry) in entries.iter().enumerate() {
                match entry.as_str() {
                    None => result.add_error(ValidationError::NonStringEntry {
                        key: key.clone(),
                        index,
                    }),
                    Some(s) if s.trim().is_empty() => {
                        result.add_error(ValidationError::EmptyPattern { category, index })
                    }
                    Some(_) => {}
                }
            }
        }
        result
    }

    pub fn validate_extension(&self, extension: &TemplateExtension) -> bool {
        self.extension_issues(extension).is_empty()
    }

    /// Every reason an extension is malformed
    pub fn extension_issues(&self, extension: &TemplateExtension) -> Vec<String> {
        let mut issues = Vec::new();

        if extension.id.as_str().trim().is_empty() {
            issues.push("extension id is empty".to_string());
        }
        if extension.name.trim().is_empty() {
            issues.push("extension name is empty".to_string());
        }
        if extension.target_template_id.as_str().trim().is_empty() {
            issues.push("target template id is empty".to_string());
        }
        if extension.rules.is_empty() && extension.remove.is_empty() {
            issues.push("extension neither adds nor removes rules".to_string());
        }
        for category in RuleCategory::ALL {
            if let Some(patterns) = extension.rules.get(category) {
                for (index, pattern) in patterns.iter().enumerate() {
                    if pattern.trim().is_empty() {
                        issues.push(format!("empty pattern in {}[{}]", category, index));
                    }
                }
            }
        }
        for condition in &extension.conditions {
            if condition.operator == ComparisonOp::Regex {
                match condition.value.as_str() {
                    Some(pattern) => {
                        if let Err(e) = Regex::new(pattern) {
                            issues.push(format!("invalid regex on '{}': {}", condition.field, e));
                        }
                    }
                    None => issues.push(format!(
                        "regex condition on '{}' needs a string pattern",
                        condition.field
                    )),
                }
            }
        }
        issues
    }

    // ------------------------------------------------------------------------
    // Steps
    // ------------------------------------------------------------------------

    fn validate_basic(&self, template: &Template, template_bytes: usize, result: &mut ValidationResult) {
        if template.id.as_str().trim().is_empty() {
            result.add_error(ValidationError::MissingField("id".to_string()));
        }
        if template.name.trim().is_empty() {
            result.add_error(ValidationError::MissingField("name".to_string()));
        }

        let mut seen = HashSet::new();
        for param in &template.parameters {
            if param.name.trim().is_empty() {
                result.add_error(ValidationError::InvalidParameter {
                    name: param.name.clone(),
                    reason: "name is empty".to_string(),
                });
            } else if !seen.insert(param.name.as_str()) {
                result.add_error(ValidationError::InvalidParameter {
                    name: param.name.clone(),
                    reason: "declared twice".to_string(),
                });
            }
            if let Some(default) = &param.default {
                if !param.param_type.accepts(default) {
                    result.add_error(ValidationError::InvalidParameter {
                        name: param.name.clone(),
                        reason: format!("default does not match type {:?}", param.param_type),
                    });
                }
            }
        }

        if template.rules.rule_count() == 0 && template.parent_id().is_none() {
            result.add_warning(ValidationWarning::EmptyRuleSet);
        }

        if template_bytes > self.config.max_template_bytes {
            result.add_warning(ValidationWarning::OversizedTemplate {
                bytes: template_bytes,
                limit: self.config.max_template_bytes,
            });
        }
    }

    fn validate_chain_shape(&self, template: &Template, result: &mut ValidationResult) {
        if let Some(repeated) = template.inheritance.duplicate_in_chain(&template.id) {
            result.add_error(ValidationError::CircularChain {
                template_id: template.id.to_string(),
                repeated: repeated.to_string(),
            });
        }
        if template.parent_id() == Some(&template.id) {
            result.add_error(ValidationError::CircularChain {
                template_id: template.id.to_string(),
                repeated: template.id.to_string(),
            });
        }
        let depth = template.inheritance.chain.len();
        if depth > self.config.chain_depth_warning {
            result.add_warning(ValidationWarning::DeepChain {
                depth,
                threshold: self.config.chain_depth_warning,
            });
        }
    }

    fn validate_inheritance(&self, template: &Template, result: &mut ValidationResult) {
        if let (Some(parent), Some(store)) = (template.parent_id(), &self.store) {
            if !store.contains(parent) {
                result.add_error(ValidationError::ParentNotFound(parent.to_string()));
            }
        }
        self.validate_chain_shape(template, result);
    }

    fn validate_rule_patterns(&self, template: &Template, result: &mut ValidationResult) {
        for (category, index) in template.rules.empty_patterns() {
            result.add_error(ValidationError::EmptyPattern { category, index });
        }
    }

    fn check_security(&self, template: &Template, result: &mut ValidationResult) {
        for pattern in &template.rules.allow {
            if pattern.contains('*') {
                result.add_warning(ValidationWarning::WildcardAllow {
                    pattern: pattern.clone(),
                });
            }
        }
        let denied: HashSet<&str> = template.rules.deny.iter().map(String::as_str).collect();
        for pattern in &template.rules.allow {
            if denied.contains(pattern.as_str()) {
                result.add_warning(ValidationWarning::AllowDenyOverlap {
                    pattern: pattern.clone(),
                });
            }
        }
    }

    fn validate_attached_extensions(&self, template: &Template, result: &mut ValidationResult) {
        for extension in &template.extensions {
            for reason in self.extension_issues(extension) {
                result.add_error(ValidationError::InvalidExtension {
                    extension_id: extension.id.to_string(),
                    reason,
                });
            }
        }
    }

    fn run_custom_rules(&self, template: &Template, ctx: &BuildContext, result: &mut ValidationResult) {
        if template.custom_validation.is_empty() {
            return;
        }
        let utilities = self.utilities.read().clone();

        for reference in &template.custom_validation {
            let rule = self.custom_rules.read().get(&reference.rule_id).cloned();
            let Some(rule) = rule else {
                result.add_warning(ValidationWarning::CustomRuleMissing {
                    rule_id: reference.rule_id.clone(),
                });
                continue;
            };

            let request = ExecutionRequest::new(rule.body.clone())
                .bind("context", rule_context(template, ctx, &rule, reference))
                .with_limits(self.config.custom_rule_limits.clone())
                .with_utilities(utilities.clone());
            let execution = self.isolator.run(request);
            result.performance.custom_rules_executed += 1;

            let outcome = match execution.into_result() {
                Ok(value) => interpret_rule_result(&value),
                Err(e) => {
                    warn!(
                        "Custom rule {} for template {} failed in sandbox ({}): {}",
                        rule.id,
                        template.id,
                        e.kind(),
                        e
                    );
                    result.add_warning(ValidationWarning::CustomRuleSkipped {
                        rule_id: rule.id.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            match outcome {
                Some((true, _)) => {}
                Some((false, message)) => {
                    let message = message.unwrap_or_else(|| format!("{} rejected the template", rule.name));
                    if rule.severity.is_error() {
                        result.add_error(ValidationError::CustomRuleFailed {
                            rule_id: rule.id.clone(),
                            message,
                        });
                    } else {
                        result.add_warning(ValidationWarning::CustomRuleWarning {
                            rule_id: rule.id.clone(),
                            message,
                        });
                    }
                }
                None => {
                    warn!("Custom rule {} returned an unsupported result", rule.id);
                    result.add_warning(ValidationWarning::CustomRuleSkipped {
                        rule_id: rule.id.clone(),
                        reason: "result must be a boolean or {isValid, message}".to_string(),
                    });
                }
            }
        }
    }

    fn check_scope(&self, template: &Template, ctx: &BuildContext, result: &mut ValidationResult) {
        let Some(user) = &ctx.user else {
            return;
        };

        if let Some(expected) = &template.scope.organization {
            match &user.organization {
                Some(actual) if actual != expected => {
                    result.add_error(ValidationError::ScopeMismatch {
                        expected: expected.clone(),
                        actual: actual.clone(),
                    });
                }
                Some(_) => {}
                None => result.add_warning(ValidationWarning::MissingOrganization {
                    expected: expected.clone(),
                }),
            }
        }

        for permission in &template.metadata.required_permissions {
            if !user.permissions.contains(permission) {
                result.add_warning(ValidationWarning::MissingPermission {
                    permission: permission.clone(),
                });
            }
        }
    }

    fn check_parameters(&self, template: &Template, ctx: &BuildContext, result: &mut ValidationResult) {
        for param in &template.parameters {
            match ctx.parameters.get(&param.name) {
                Some(value) if !param.param_type.accepts(value) => {
                    result.add_error(ValidationError::InvalidParameter {
                        name: param.name.clone(),
                        reason: format!("supplied value does not match type {:?}", param.param_type),
                    });
                }
                Some(_) => {}
                None if param.required && param.default.is_none() => {
                    result.add_warning(ValidationWarning::MissingParameter {
                        name: param.name.clone(),
                    });
                }
                None => {}
            }
        }
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(Arc::new(Sandbox::new()))
    }
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validator")
            .field("config", &self.config)
            .field("custom_rules", &self.custom_rules.read().len())
            .field("cache", &self.cache.stats())
            .finish()
    }
}

fn cache_key(serialized: &[u8], ctx: &BuildContext) -> Option<String> {
    let parameters = serde_json::to_vec(&ctx.parameters).ok()?;
    let user = serde_json::to_vec(&ctx.user).ok()?;
    let context = serde_json::to_vec(&ctx.context).ok()?;
    Some(content_hash([
        serialized,
        ctx.environment.as_bytes(),
        parameters.as_slice(),
        user.as_slice(),
        context.as_slice(),
    ]))
}

fn cache_tags(template: &Template) -> Vec<TemplateId> {
    let mut tags = vec![template.id.clone()];
    tags.extend(template.parent_id().cloned());
    tags.extend(template.inheritance.chain.iter().cloned());
    tags
}

/// Bounded view of the template handed to a custom rule
fn rule_context(
    template: &Template,
    ctx: &BuildContext,
    rule: &CustomValidationRule,
    reference: &CustomValidationRef,
) -> Value {
    let mut parameters: Map<String, Value> = rule.parameters.clone();
    parameters.extend(reference.parameters.clone());

    let template_parameters: Vec<Value> = template
        .parameters
        .iter()
        .map(|p| json!({"name": p.name, "type": p.param_type, "default": p.default}))
        .collect();

    json!({
        "template": {
            "id": template.id.as_str(),
            "name": template.name,
            "version": template.version.to_string(),
            "rules": {
                "deny": template.rules.deny,
                "allow": template.rules.allow,
                "ask": template.rules.ask,
            },
            "parameters": template_parameters,
        },
        "parameters": parameters,
        "environment": ctx.environment,
    })
}

/// `true`/`false` or `{isValid, message}`
fn interpret_rule_result(value: &Value) -> Option<(bool, Option<String>)> {
    match value {
        Value::Bool(b) => Some((*b, None)),
        Value::Object(map) => {
            let valid = map.get("isValid")?.as_bool()?;
            let message = map.get("message").and_then(Value::as_str).map(str::to_string);
            Some((valid, message))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{RulesPatch, RuleSeverity, TemplateScope, UserContext};

    fn validator() -> Validator {
        Validator::default()
    }

    fn base() -> Template {
        Template::builder()
            .id("base")
            .name("Base")
            .version("1.0.0")
            .deny(["eval("])
            .build()
            .unwrap()
    }

    #[test]
    fn test_valid_template_passes() {
        let result = validator().validate_template(&base(), &BuildContext::default());
        assert!(result.is_valid, "{:?}", result.errors);
        assert_eq!(result.performance.rule_count, 1);
    }

    #[test]
    fn test_errors_accumulate() {
        let mut t = base();
        t.name = String::new();
        t.rules.allow.push("  ".into());
        t.rules.ask.push(String::new());
        let result = validator().validate_template(&t, &BuildContext::default());
        assert!(!result.is_valid);
        assert_eq!(result.errors.len(), 3);
    }

    #[test]
    fn test_security_warnings() {
        let mut t = base();
        t.rules.allow = vec!["Bash(*)".into(), "eval(".into()];
        let result = validator().validate_template(&t, &BuildContext::default());
        assert!(result.is_valid);
        assert!(result
            .warnings
            .contains(&ValidationWarning::WildcardAllow { pattern: "Bash(*)".into() }));
        assert!(result
            .warnings
            .contains(&ValidationWarning::AllowDenyOverlap { pattern: "eval(".into() }));
    }

    #[test]
    fn test_chain_duplicate_is_error_and_depth_warns() {
        let mut t = base();
        t.inheritance.chain = (0..12).map(|i| TemplateId::new(format!("t{}", i))).collect();
        let result = validator().validate_structure(&t);
        assert!(result.is_valid);
        assert!(matches!(result.warnings[0], ValidationWarning::DeepChain { depth: 12, .. }));

        t.inheritance.chain.push("base".into());
        let result = validator().validate_structure(&t);
        assert!(matches!(result.errors[0], ValidationError::CircularChain { .. }));
    }

    #[test]
    fn test_parent_must_exist_in_store() {
        let store = Arc::new(TemplateStore::new());
        let v = Validator::default().with_store(store.clone());
        let child = Template::builder().id("child").name("C").parent("base").build().unwrap();
        let result = v.validate_template(&child, &BuildContext::default());
        assert_eq!(result.errors, vec![ValidationError::ParentNotFound("base".into())]);

        store.put(base());
        v.invalidate(&"base".into());
        assert!(v.validate_template(&child, &BuildContext::default()).is_valid);
    }

    #[test]
    fn test_validate_configuration() {
        let v = validator();
        assert!(v.validate_configuration(&json!({"deny": ["a"], "allow": []})).is_valid);

        let result = v.validate_configuration(&json!({
            "deny": "eval(",
            "allow": ["ok", 3, ""],
            "network": []
        }));
        assert_eq!(result.errors.len(), 4);
        assert!(result.errors.contains(&ValidationError::UnknownKey("network".into())));
        assert!(result.errors.contains(&ValidationError::NotAnArray("deny".into())));
        assert!(!v.validate_configuration(&json!([1])).is_valid);
    }

    #[test]
    fn test_validate_extension() {
        let v = validator();
        let good = TemplateExtension::new("e1", "Harden", "base").with_rules(RulesPatch::new().deny(["x"]));
        assert!(v.validate_extension(&good));

        let empty = TemplateExtension::new("e2", "", "base");
        let issues = v.extension_issues(&empty);
        assert_eq!(issues.len(), 2);
        assert!(!v.validate_extension(&empty));
    }

    #[test]
    fn test_custom_rules_through_sandbox() {
        let v = validator();
        v.register_custom_rule(CustomValidationRule::new(
            "needs-eval-deny",
            "Deny eval",
            RuleSeverity::Error,
            "return context.template.rules.deny.includes('eval(');",
        ));
        v.register_custom_rule(CustomValidationRule::new(
            "few-rules",
            "Few rules",
            RuleSeverity::Warning,
            "return { isValid: len(context.template.rules.deny) > 5, message: 'too few deny rules' };",
        ));
        v.register_custom_rule(CustomValidationRule::new(
            "broken",
            "Broken",
            RuleSeverity::Critical,
            "while (true) { }",
        ));

        let t = Template::builder()
            .id("custom")
            .name("Custom")
            .deny(["eval("])
            .custom_validation("needs-eval-deny", Map::new())
            .custom_validation("few-rules", Map::new())
            .custom_validation("broken", Map::new())
            .custom_validation("not-registered", Map::new())
            .build()
            .unwrap();

        let result = v.validate_template(&t, &BuildContext::default());
        assert!(result.is_valid, "{:?}", result.errors);
        assert_eq!(result.performance.custom_rules_executed, 3);
        assert!(result.warnings.contains(&ValidationWarning::CustomRuleWarning {
            rule_id: "few-rules".into(),
            message: "too few deny rules".into(),
        }));
        assert!(result
            .warnings
            .iter()
            .any(|w| matches!(w, ValidationWarning::CustomRuleSkipped { rule_id, .. } if rule_id == "broken")));
        assert!(result.warnings.contains(&ValidationWarning::CustomRuleMissing {
            rule_id: "not-registered".into()
        }));

        let mut failing = t.clone();
        failing.rules.deny.clear();
        failing.custom_validation.truncate(1);
        let result = v.validate_template(&failing, &BuildContext::default());
        assert!(!result.is_valid);
        assert!(matches!(result.errors[0], ValidationError::CustomRuleFailed { .. }));
    }

    #[test]
    fn test_custom_rule_uses_utilities() {
        let v = validator();
        v.register_utility("maxRules", |_args: &[Value]| Ok(json!(2)));
        v.register_custom_rule(CustomValidationRule::new(
            "bounded",
            "Bounded",
            RuleSeverity::Error,
            "return len(context.template.rules.deny) <= utils.maxRules() && utils.isNonEmptyString(context.template.name);",
        ));
        let t = Template::builder()
            .id("u")
            .name("U")
            .deny(["a", "b", "c"])
            .custom_validation("bounded", Map::new())
            .build()
            .unwrap();
        assert!(!v.validate_template(&t, &BuildContext::default()).is_valid);
    }

    #[test]
    fn test_scope_and_permissions() {
        let v = validator();
        let mut t = base();
        t.scope = TemplateScope::organization("acme");
        t.metadata.required_permissions.push("templates:admin".into());

        let outsider = BuildContext::default().with_user(UserContext {
            id: "u1".into(),
            organization: Some("globex".into()),
            permissions: vec![],
        });
        let result = v.validate_template(&t, &outsider);
        assert!(!result.is_valid);
        assert!(result.warnings.contains(&ValidationWarning::MissingPermission {
            permission: "templates:admin".into()
        }));

        let member = BuildContext::default().with_user(UserContext {
            id: "u2".into(),
            organization: Some("acme".into()),
            permissions: vec!["templates:admin".into()],
        });
        let result = v.validate_template(&t, &member);
        assert!(result.is_valid);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_cache_hit_and_invalidation() {
        let v = validator();
        let t = base();
        let ctx = BuildContext::default();
        assert!(!v.validate_template(&t, &ctx).performance.cache_hit);
        assert!(v.validate_template(&t, &ctx).performance.cache_hit);
        assert!(!v
            .validate_template(&t, &BuildContext::new("production"))
            .performance
            .cache_hit);

        assert_eq!(v.invalidate(&t.id), 2);
        assert!(!v.validate_template(&t, &ctx).performance.cache_hit);
    }
}
