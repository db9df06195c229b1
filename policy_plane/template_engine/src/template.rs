// Core data model for security rule templates
//
// A template is a named, versioned set of deny/allow/ask patterns plus the
// metadata needed to place it in an inheritance hierarchy. Everything here
// is plain data; the engines in the sibling modules own behaviour.
//
// Ownership rules:
// 1. `inheritance.chain` is a snapshot taken when the template is registered
//    or resolved; mutating a parent never rewrites a cached child
// 2. A locked template rejects mutation from anyone but the lock holder

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use template_sandbox::ScriptPayload;
use thiserror::Error;
use uuid::Uuid;

use crate::conditions::Condition;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for a template
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TemplateId(String);

impl TemplateId {
    pub fn new(id: impl Into<String>) -> Self {
        TemplateId(id.into())
    }

    /// Random id for templates created without an explicit one
    pub fn generate() -> Self {
        TemplateId(format!("tpl-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TemplateId {
    fn from(s: &str) -> Self {
        TemplateId(s.to_string())
    }
}

impl From<String> for TemplateId {
    fn from(s: String) -> Self {
        TemplateId(s)
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a template extension
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExtensionId(String);

impl ExtensionId {
    pub fn new(id: impl Into<String>) -> Self {
        ExtensionId(id.into())
    }

    pub fn generate() -> Self {
        ExtensionId(format!("ext-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ExtensionId {
    fn from(s: &str) -> Self {
        ExtensionId(s.to_string())
    }
}

impl From<String> for ExtensionId {
    fn from(s: String) -> Self {
        ExtensionId(s)
    }
}

impl fmt::Display for ExtensionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Malformed model values
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ModelError {
    #[error("Invalid version '{version}': {reason}")]
    InvalidVersion { version: String, reason: String },

    #[error("Invalid rule path: {0}")]
    InvalidRulePath(String),

    #[error("Template {template_id} is locked by {holder}")]
    TemplateLocked { template_id: String, holder: String },

    #[error("Missing required field: {0}")]
    MissingField(String),
}

// ============================================================================
// Version
// ============================================================================

/// Semantic version `major.minor.patch[-pre][+build]`
///
/// Ordering follows semver precedence: build metadata is ignored and a
/// prerelease sorts before its release.
#[derive(Debug, Clone, Eq)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub prerelease: Option<String>,
    pub build: Option<String>,
}

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            prerelease: None,
            build: None,
        }
    }

    pub fn with_prerelease(mut self, prerelease: impl Into<String>) -> Self {
        self.prerelease = Some(prerelease.into());
        self
    }

    pub fn with_build(mut self, build: impl Into<String>) -> Self {
        self.build = Some(build.into());
        self
    }

    pub fn is_prerelease(&self) -> bool {
        self.prerelease.is_some()
    }

    pub fn increment_major(&self) -> Self {
        Self::new(self.major + 1, 0, 0)
    }

    pub fn increment_minor(&self) -> Self {
        Self::new(self.major, self.minor + 1, 0)
    }

    pub fn increment_patch(&self) -> Self {
        Self::new(self.major, self.minor, self.patch + 1)
    }
}

impl Default for Version {
    fn default() -> Self {
        Version::new(1, 0, 0)
    }
}

fn valid_identifiers(s: &str) -> bool {
    !s.is_empty()
        && s.split('.').all(|part| {
            !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

impl FromStr for Version {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ModelError::InvalidVersion {
            version: s.to_string(),
            reason: reason.to_string(),
        };

        let (rest, build) = match s.split_once('+') {
            Some((rest, build)) => {
                if !valid_identifiers(build) {
                    return Err(invalid("invalid build metadata"));
                }
                (rest, Some(build.to_string()))
            }
            None => (s, None),
        };
        let (core, prerelease) = match rest.split_once('-') {
            Some((core, pre)) => {
                if !valid_identifiers(pre) {
                    return Err(invalid("invalid prerelease identifier"));
                }
                (core, Some(pre.to_string()))
            }
            None => (rest, None),
        };

        let parts: Vec<&str> = core.split('.').collect();
        if parts.len() != 3 {
            return Err(invalid("expected major.minor.patch"));
        }
        let mut numbers = [0u64; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
                return Err(invalid("components must be numeric"));
            }
            if part.len() > 1 && part.starts_with('0') {
                return Err(invalid("leading zeros are not allowed"));
            }
            *slot = part.parse().map_err(|_| invalid("component out of range"))?;
        }

        Ok(Version {
            major: numbers[0],
            minor: numbers[1],
            patch: numbers[2],
            prerelease,
            build,
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.prerelease {
            write!(f, "-{}", pre)?;
        }
        if let Some(build) = &self.build {
            write!(f, "+{}", build)?;
        }
        Ok(())
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.patch.cmp(&other.patch))
            .then_with(|| match (&self.prerelease, &other.prerelease) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => compare_prerelease(a, b),
            })
    }
}

fn compare_prerelease(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(n), Ok(m)) => n.cmp(&m),
                    (Ok(_), Err(_)) => Ordering::Less,
                    (Err(_), Ok(_)) => Ordering::Greater,
                    (Err(_), Err(_)) => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Rules
// ============================================================================

/// The three permission categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    Deny,
    Allow,
    Ask,
}

impl RuleCategory {
    pub const ALL: [RuleCategory; 3] = [RuleCategory::Deny, RuleCategory::Allow, RuleCategory::Ask];

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleCategory::Deny => "deny",
            RuleCategory::Allow => "allow",
            RuleCategory::Ask => "ask",
        }
    }
}

impl FromStr for RuleCategory {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deny" => Ok(RuleCategory::Deny),
            "allow" => Ok(RuleCategory::Allow),
            "ask" => Ok(RuleCategory::Ask),
            other => Err(ModelError::InvalidRulePath(format!(
                "unknown rule category '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for RuleCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Permission patterns of a template
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuleSet {
    pub deny: Vec<String>,
    pub allow: Vec<String>,
    pub ask: Vec<String>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, category: RuleCategory) -> &Vec<String> {
        match category {
            RuleCategory::Deny => &self.deny,
            RuleCategory::Allow => &self.allow,
            RuleCategory::Ask => &self.ask,
        }
    }

    pub fn get_mut(&mut self, category: RuleCategory) -> &mut Vec<String> {
        match category {
            RuleCategory::Deny => &mut self.deny,
            RuleCategory::Allow => &mut self.allow,
            RuleCategory::Ask => &mut self.ask,
        }
    }

    pub fn rule_count(&self) -> usize {
        self.deny.len() + self.allow.len() + self.ask.len()
    }

    pub fn contains(&self, category: RuleCategory, pattern: &str) -> bool {
        self.get(category).iter().any(|p| p == pattern)
    }

    /// Union the patch into this set, keeping existing order and appending
    /// patterns not yet present
    pub fn apply_patch(&mut self, patch: &RulesPatch) {
        for category in RuleCategory::ALL {
            if let Some(patterns) = patch.get(category) {
                let target = self.get_mut(category);
                for pattern in patterns {
                    if !target.contains(pattern) {
                        target.push(pattern.clone());
                    }
                }
            }
        }
    }

    /// Delete the rules addressed by `path`, returning how many were removed
    pub fn remove_path(&mut self, path: &RulePath) -> usize {
        let target = self.get_mut(path.category);
        let before = target.len();
        match &path.selector {
            RuleSelector::All => target.clear(),
            RuleSelector::Index(idx) => {
                if *idx < target.len() {
                    target.remove(*idx);
                }
            }
            RuleSelector::Pattern(pattern) => target.retain(|p| p != pattern),
        }
        before - target.len()
    }

    /// Positions of empty or whitespace-only patterns
    pub fn empty_patterns(&self) -> Vec<(RuleCategory, usize)> {
        RuleCategory::ALL
            .iter()
            .flat_map(|&category| {
                self.get(category)
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| p.trim().is_empty())
                    .map(move |(idx, _)| (category, idx))
            })
            .collect()
    }
}

/// Partial rule set merged in by extensions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RulesPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deny: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask: Option<Vec<String>>,
}

impl RulesPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny(mut self, patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.deny = Some(patterns.into_iter().map(Into::into).collect());
        self
    }

    pub fn allow(mut self, patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.allow = Some(patterns.into_iter().map(Into::into).collect());
        self
    }

    pub fn ask(mut self, patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ask = Some(patterns.into_iter().map(Into::into).collect());
        self
    }

    pub fn get(&self, category: RuleCategory) -> Option<&Vec<String>> {
        match category {
            RuleCategory::Deny => self.deny.as_ref(),
            RuleCategory::Allow => self.allow.as_ref(),
            RuleCategory::Ask => self.ask.as_ref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        RuleCategory::ALL
            .iter()
            .all(|c| self.get(*c).map(|p| p.is_empty()).unwrap_or(true))
    }

    pub fn rule_count(&self) -> usize {
        RuleCategory::ALL
            .iter()
            .map(|c| self.get(*c).map(Vec::len).unwrap_or(0))
            .sum()
    }
}

/// Which rules of a category a path addresses
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RuleSelector {
    All,
    Index(usize),
    Pattern(String),
}

/// Address of rules to delete: `deny`, `deny[2]` or `deny:eval(`
///
/// A leading `rules.` is accepted and dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RulePath {
    pub category: RuleCategory,
    pub selector: RuleSelector,
}

impl RulePath {
    pub fn pattern(category: RuleCategory, pattern: impl Into<String>) -> Self {
        Self {
            category,
            selector: RuleSelector::Pattern(pattern.into()),
        }
    }

    pub fn index(category: RuleCategory, idx: usize) -> Self {
        Self {
            category,
            selector: RuleSelector::Index(idx),
        }
    }

    pub fn all(category: RuleCategory) -> Self {
        Self {
            category,
            selector: RuleSelector::All,
        }
    }
}

impl FromStr for RulePath {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("rules.").unwrap_or(s);

        if let Some((category, pattern)) = s.split_once(':') {
            if pattern.is_empty() {
                return Err(ModelError::InvalidRulePath(format!("empty pattern in '{}'", s)));
            }
            return Ok(RulePath::pattern(category.parse()?, pattern));
        }

        if let Some((category, rest)) = s.split_once('[') {
            let idx = rest
                .strip_suffix(']')
                .and_then(|n| n.parse::<usize>().ok())
                .ok_or_else(|| ModelError::InvalidRulePath(format!("bad index in '{}'", s)))?;
            return Ok(RulePath::index(category.parse()?, idx));
        }

        Ok(RulePath::all(s.parse()?))
    }
}

impl fmt::Display for RulePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.selector {
            RuleSelector::All => write!(f, "{}", self.category),
            RuleSelector::Index(idx) => write!(f, "{}[{}]", self.category, idx),
            RuleSelector::Pattern(p) => write!(f, "{}:{}", self.category, p),
        }
    }
}

impl Serialize for RulePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RulePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Metadata, parameters and scope
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateMetadata {
    pub description: String,
    pub tags: Vec<String>,
    /// Compliance frameworks the template claims (e.g. "soc2")
    pub compliance: Vec<String>,
    /// Permissions a requesting user should hold to use the template
    pub required_permissions: Vec<String>,
    pub author: Option<String>,
    /// Shipped with the engine; cannot be inherited with `override`
    pub built_in: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for TemplateMetadata {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            description: String::new(),
            tags: Vec::new(),
            compliance: Vec::new(),
            required_permissions: Vec::new(),
            author: None,
            built_in: false,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParameterType {
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (ParameterType::String, Value::String(_))
                | (ParameterType::Number, Value::Number(_))
                | (ParameterType::Boolean, Value::Bool(_))
                | (ParameterType::Array, Value::Array(_))
                | (ParameterType::Object, Value::Object(_))
        )
    }
}

/// Typed customization point of a template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParameterType,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

impl TemplateParameter {
    pub fn new(name: impl Into<String>, param_type: ParameterType) -> Self {
        Self {
            name: name.into(),
            param_type,
            default: None,
            required: false,
            description: String::new(),
        }
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Organizational scope; unset fields match anything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateScope {
    pub organization: Option<String>,
    pub team: Option<String>,
    pub project: Option<String>,
    pub user: Option<String>,
}

impl TemplateScope {
    pub fn organization(org: impl Into<String>) -> Self {
        Self {
            organization: Some(org.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.organization.is_none()
            && self.team.is_none()
            && self.project.is_none()
            && self.user.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateLock {
    pub holder: String,
    pub locked_at: DateTime<Utc>,
    pub reason: Option<String>,
}

// ============================================================================
// Inheritance metadata
// ============================================================================

/// Position in the hierarchy, ordered base < organization < team < project < user
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum InheritanceLevel {
    #[default]
    Base,
    Organization,
    Team,
    Project,
    User,
}

impl InheritanceLevel {
    /// The level a child of this level lands on
    pub fn next(&self) -> Self {
        match self {
            InheritanceLevel::Base => InheritanceLevel::Organization,
            InheritanceLevel::Organization => InheritanceLevel::Team,
            InheritanceLevel::Team => InheritanceLevel::Project,
            InheritanceLevel::Project | InheritanceLevel::User => InheritanceLevel::User,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionType {
    #[default]
    Inherit,
    Extend,
    Override,
    Compose,
}

/// What a child may change relative to this template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverridePermissions {
    pub can_override_rules: bool,
    pub can_add_rules: bool,
    pub can_remove_rules: bool,
    pub can_modify_metadata: bool,
}

impl Default for OverridePermissions {
    fn default() -> Self {
        Self {
            can_override_rules: true,
            can_add_rules: true,
            can_remove_rules: true,
            can_modify_metadata: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InheritanceMetadata {
    pub parent_id: Option<TemplateId>,
    pub level: InheritanceLevel,
    pub extension_type: ExtensionType,
    /// Ancestor ids, root first, this template excluded
    pub chain: Vec<TemplateId>,
    pub min_parent_version: Option<Version>,
    pub max_parent_version: Option<Version>,
    pub permissions: OverridePermissions,
    /// Sources of a composed template
    pub composed_from: Vec<TemplateId>,
}

impl InheritanceMetadata {
    /// True when `version` falls inside the declared parent bounds (inclusive)
    pub fn accepts_parent_version(&self, version: &Version) -> bool {
        self.min_parent_version.as_ref().map_or(true, |min| version >= min)
            && self.max_parent_version.as_ref().map_or(true, |max| version <= max)
    }

    pub fn describe_bounds(&self) -> String {
        match (&self.min_parent_version, &self.max_parent_version) {
            (Some(min), Some(max)) => format!(">= {}, <= {}", min, max),
            (Some(min), None) => format!(">= {}", min),
            (None, Some(max)) => format!("<= {}", max),
            (None, None) => "any".to_string(),
        }
    }

    /// First id that repeats in the chain or equals `own_id`
    pub fn duplicate_in_chain(&self, own_id: &TemplateId) -> Option<&TemplateId> {
        let mut seen = std::collections::HashSet::new();
        self.chain
            .iter()
            .find(|id| *id == own_id || !seen.insert(*id))
    }
}

// ============================================================================
// Extensions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionKind {
    #[default]
    Add,
    Remove,
    Modify,
    Mixed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionMetadata {
    pub author: String,
    pub version: Version,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for ExtensionMetadata {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            author: String::new(),
            version: Version::default(),
            description: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Prioritized patch applied on top of a target template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateExtension {
    pub id: ExtensionId,
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: ExtensionKind,
    pub target_template_id: TemplateId,
    #[serde(default)]
    pub rules: RulesPatch,
    /// Rule paths deleted after the patch is merged
    #[serde(default)]
    pub remove: Vec<RulePath>,
    /// Lower values are applied first
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub metadata: ExtensionMetadata,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl TemplateExtension {
    pub fn new(
        id: impl Into<ExtensionId>,
        name: impl Into<String>,
        target: impl Into<TemplateId>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: ExtensionKind::Add,
            target_template_id: target.into(),
            rules: RulesPatch::default(),
            remove: Vec::new(),
            priority: 0,
            metadata: ExtensionMetadata::default(),
            conditions: Vec::new(),
        }
    }

    pub fn with_rules(mut self, rules: RulesPatch) -> Self {
        self.rules = rules;
        self.kind = self.derived_kind();
        self
    }

    pub fn with_removals(mut self, paths: impl IntoIterator<Item = RulePath>) -> Self {
        self.remove = paths.into_iter().collect();
        self.kind = self.derived_kind();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_conditions(mut self, conditions: impl IntoIterator<Item = Condition>) -> Self {
        self.conditions = conditions.into_iter().collect();
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.metadata.author = author.into();
        self
    }

    fn derived_kind(&self) -> ExtensionKind {
        match (self.rules.is_empty(), self.remove.is_empty()) {
            (false, true) => ExtensionKind::Add,
            (true, false) => ExtensionKind::Remove,
            (false, false) => ExtensionKind::Mixed,
            (true, true) => self.kind,
        }
    }
}

// ============================================================================
// Custom validation rules
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl RuleSeverity {
    /// Failing rules of this severity invalidate the template
    pub fn is_error(&self) -> bool {
        matches!(self, RuleSeverity::Error | RuleSeverity::Critical)
    }
}

/// Author-supplied validation logic, only ever run inside the sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomValidationRule {
    pub id: String,
    pub name: String,
    pub severity: RuleSeverity,
    #[serde(default)]
    pub category: String,
    pub body: ScriptPayload,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl CustomValidationRule {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        severity: RuleSeverity,
        code: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            severity,
            category: "custom".to_string(),
            body: ScriptPayload::new(code),
            parameters: Map::new(),
        }
    }
}

/// Reference from a template to a registered custom rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomValidationRef {
    pub rule_id: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

// ============================================================================
// Build context
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserContext {
    pub id: String,
    pub organization: Option<String>,
    pub permissions: Vec<String>,
}

/// Inputs a resolution or validation is evaluated against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildContext {
    pub environment: String,
    pub parameters: Map<String, Value>,
    /// Free-form data addressed by `context` conditions
    pub context: Value,
    pub user: Option<UserContext>,
}

impl BuildContext {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            ..Self::default()
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_user(mut self, user: UserContext) -> Self {
        self.user = Some(user);
        self
    }

    pub fn user_id(&self) -> &str {
        self.user.as_ref().map(|u| u.id.as_str()).unwrap_or("")
    }
}

impl Default for BuildContext {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            parameters: Map::new(),
            context: Value::Null,
            user: None,
        }
    }
}

// ============================================================================
// Template
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: TemplateId,
    pub name: String,
    pub version: Version,
    #[serde(default)]
    pub rules: RuleSet,
    #[serde(default)]
    pub metadata: TemplateMetadata,
    #[serde(default)]
    pub parameters: Vec<TemplateParameter>,
    #[serde(default)]
    pub scope: TemplateScope,
    #[serde(default)]
    pub locked: Option<TemplateLock>,
    #[serde(default)]
    pub inheritance: InheritanceMetadata,
    /// Extensions attached directly to this template
    #[serde(default)]
    pub extensions: Vec<TemplateExtension>,
    #[serde(default)]
    pub custom_validation: Vec<CustomValidationRef>,
}

impl Template {
    pub fn builder() -> TemplateBuilder {
        TemplateBuilder::default()
    }

    /// Field-by-field deep copy of the typed model
    pub fn structural_clone(&self) -> Template {
        Template {
            id: self.id.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
            rules: RuleSet {
                deny: self.rules.deny.clone(),
                allow: self.rules.allow.clone(),
                ask: self.rules.ask.clone(),
            },
            metadata: self.metadata.clone(),
            parameters: self.parameters.iter().cloned().collect(),
            scope: self.scope.clone(),
            locked: self.locked.clone(),
            inheritance: InheritanceMetadata {
                chain: self.inheritance.chain.to_vec(),
                composed_from: self.inheritance.composed_from.to_vec(),
                ..self.inheritance.clone()
            },
            extensions: self.extensions.iter().cloned().collect(),
            custom_validation: self.custom_validation.iter().cloned().collect(),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.is_some()
    }

    /// Refuse mutation unless unlocked or `actor` holds the lock
    pub fn ensure_mutable_by(&self, actor: Option<&str>) -> Result<(), ModelError> {
        match &self.locked {
            Some(lock) if actor != Some(lock.holder.as_str()) => Err(ModelError::TemplateLocked {
                template_id: self.id.to_string(),
                holder: lock.holder.clone(),
            }),
            _ => Ok(()),
        }
    }

    pub fn lock(&mut self, holder: impl Into<String>, reason: Option<String>) {
        self.locked = Some(TemplateLock {
            holder: holder.into(),
            locked_at: Utc::now(),
            reason,
        });
    }

    pub fn unlock(&mut self) {
        self.locked = None;
    }

    pub fn touch(&mut self) {
        self.metadata.updated_at = Utc::now();
    }

    pub fn parent_id(&self) -> Option<&TemplateId> {
        self.inheritance.parent_id.as_ref()
    }

    /// Merge an extension's patch, then delete its rule paths
    pub fn apply_extension(&mut self, extension: &TemplateExtension) -> usize {
        self.rules.apply_patch(&extension.rules);
        extension
            .remove
            .iter()
            .map(|path| self.rules.remove_path(path))
            .sum()
    }
}

/// Builder for templates
#[derive(Debug, Default)]
pub struct TemplateBuilder {
    id: Option<TemplateId>,
    name: Option<String>,
    version: Option<String>,
    rules: RuleSet,
    metadata: TemplateMetadata,
    parameters: Vec<TemplateParameter>,
    scope: TemplateScope,
    inheritance: InheritanceMetadata,
    extensions: Vec<TemplateExtension>,
    custom_validation: Vec<CustomValidationRef>,
}

impl TemplateBuilder {
    pub fn id(mut self, id: impl Into<TemplateId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn deny(mut self, patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.rules.deny.extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn allow(mut self, patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.rules.allow.extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn ask(mut self, patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.rules.ask.extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn rules(mut self, rules: RuleSet) -> Self {
        self.rules = rules;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.metadata.description = description.into();
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.metadata.tags.push(tag.into());
        self
    }

    pub fn compliance(mut self, framework: impl Into<String>) -> Self {
        self.metadata.compliance.push(framework.into());
        self
    }

    pub fn required_permission(mut self, permission: impl Into<String>) -> Self {
        self.metadata.required_permissions.push(permission.into());
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.metadata.author = Some(author.into());
        self
    }

    pub fn built_in(mut self, built_in: bool) -> Self {
        self.metadata.built_in = built_in;
        self
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.metadata.created_at = created_at;
        self.metadata.updated_at = created_at;
        self
    }

    pub fn parameter(mut self, parameter: TemplateParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn scope(mut self, scope: TemplateScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn parent(mut self, parent_id: impl Into<TemplateId>) -> Self {
        self.inheritance.parent_id = Some(parent_id.into());
        self
    }

    pub fn level(mut self, level: InheritanceLevel) -> Self {
        self.inheritance.level = level;
        self
    }

    pub fn extension_type(mut self, extension_type: ExtensionType) -> Self {
        self.inheritance.extension_type = extension_type;
        self
    }

    pub fn permissions(mut self, permissions: OverridePermissions) -> Self {
        self.inheritance.permissions = permissions;
        self
    }

    pub fn parent_version_bounds(mut self, min: Option<Version>, max: Option<Version>) -> Self {
        self.inheritance.min_parent_version = min;
        self.inheritance.max_parent_version = max;
        self
    }

    pub fn extension(mut self, extension: TemplateExtension) -> Self {
        self.extensions.push(extension);
        self
    }

    pub fn custom_validation(mut self, rule_id: impl Into<String>, parameters: Map<String, Value>) -> Self {
        self.custom_validation.push(CustomValidationRef {
            rule_id: rule_id.into(),
            parameters,
        });
        self
    }

    pub fn build(self) -> Result<Template, ModelError> {
        let name = self
            .name
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| ModelError::MissingField("name".to_string()))?;
        let version = match self.version {
            Some(v) => v.parse()?,
            None => Version::default(),
        };

        Ok(Template {
            id: self.id.unwrap_or_else(TemplateId::generate),
            name,
            version,
            rules: self.rules,
            metadata: self.metadata,
            parameters: self.parameters,
            scope: self.scope,
            locked: None,
            inheritance: self.inheritance,
            extensions: self.extensions,
            custom_validation: self.custom_validation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_version_parse_and_order() {
        let v: Version = "1.2.3-beta.2+build.7".parse().unwrap();
        assert_eq!(v.major, 1);
        assert_eq!(v.prerelease.as_deref(), Some("beta.2"));
        assert_eq!(v.build.as_deref(), Some("build.7"));
        assert_eq!(v.to_string(), "1.2.3-beta.2+build.7");

        let release: Version = "1.2.3".parse().unwrap();
        let beta11: Version = "1.2.3-beta.11".parse().unwrap();
        assert!(v < beta11);
        assert!(beta11 < release);
        assert_eq!(release, "1.2.3+other".parse::<Version>().unwrap());

        assert!("1.2".parse::<Version>().is_err());
        assert!("01.2.3".parse::<Version>().is_err());
        assert!("1.2.3-".parse::<Version>().is_err());
        assert!("a.b.c".parse::<Version>().is_err());
    }

    #[test]
    fn test_version_serde_as_string() {
        let v = Version::new(2, 0, 1);
        assert_eq!(serde_json::to_value(&v).unwrap(), json!("2.0.1"));
        let back: Version = serde_json::from_value(json!("2.0.1")).unwrap();
        assert_eq!(back, v);
        assert!(serde_json::from_value::<Version>(json!("2.x")).is_err());
    }

    #[test]
    fn test_rule_set_patch_and_remove() {
        let mut rules = RuleSet {
            deny: vec!["eval(".into(), "rm -rf".into()],
            ..RuleSet::default()
        };
        rules.apply_patch(&RulesPatch::new().deny(["rm -rf", "innerHTML ="]).allow(["git status"]));
        assert_eq!(rules.deny, vec!["eval(", "rm -rf", "innerHTML ="]);
        assert_eq!(rules.allow, vec!["git status"]);

        assert_eq!(rules.remove_path(&"deny:rm -rf".parse().unwrap()), 1);
        assert_eq!(rules.remove_path(&"rules.deny[0]".parse().unwrap()), 1);
        assert_eq!(rules.deny, vec!["innerHTML ="]);
        assert_eq!(rules.remove_path(&"allow".parse().unwrap()), 1);
        assert!(rules.allow.is_empty());
        assert_eq!(rules.remove_path(&RulePath::index(RuleCategory::Ask, 5)), 0);
    }

    #[test]
    fn test_rule_path_parse_errors() {
        assert!("network".parse::<RulePath>().is_err());
        assert!("deny[x]".parse::<RulePath>().is_err());
        assert!("deny:".parse::<RulePath>().is_err());
        assert_eq!(
            "ask:Bash(curl:*)".parse::<RulePath>().unwrap(),
            RulePath::pattern(RuleCategory::Ask, "Bash(curl:*)")
        );
    }

    #[test]
    fn test_rule_set_rejects_unknown_keys() {
        let err = serde_json::from_value::<RuleSet>(json!({"deny": [], "network": []}));
        assert!(err.is_err());
        let ok: RuleSet = serde_json::from_value(json!({"allow": ["ls"]})).unwrap();
        assert_eq!(ok.allow, vec!["ls"]);
    }

    #[test]
    fn test_builder_and_lock() {
        let mut t = Template::builder()
            .id("base")
            .name("Base")
            .version("1.0.0")
            .deny(["eval("])
            .build()
            .unwrap();
        assert_eq!(t.id.as_str(), "base");
        assert!(t.ensure_mutable_by(None).is_ok());

        t.lock("alice", Some("audit".to_string()));
        assert!(t.ensure_mutable_by(Some("alice")).is_ok());
        assert!(matches!(
            t.ensure_mutable_by(Some("bob")),
            Err(ModelError::TemplateLocked { .. })
        ));
        t.unlock();
        assert!(t.ensure_mutable_by(None).is_ok());

        assert!(Template::builder().build().is_err());
        assert!(Template::builder().name("x").version("bad").build().is_err());
    }

    #[test]
    fn test_structural_clone_is_independent() {
        let t = Template::builder().id("a").name("A").deny(["x"]).build().unwrap();
        let mut copy = t.structural_clone();
        copy.rules.deny.push("y".into());
        copy.inheritance.chain.push(TemplateId::new("root"));
        assert_eq!(t.rules.deny, vec!["x"]);
        assert!(t.inheritance.chain.is_empty());
        assert_eq!(t, t.structural_clone());
    }

    #[test]
    fn test_chain_duplicates_and_bounds() {
        let mut meta = InheritanceMetadata {
            chain: vec!["a".into(), "b".into()],
            ..Default::default()
        };
        assert!(meta.duplicate_in_chain(&"c".into()).is_none());
        assert_eq!(meta.duplicate_in_chain(&"a".into()), Some(&TemplateId::new("a")));
        meta.chain.push("b".into());
        assert!(meta.duplicate_in_chain(&"c".into()).is_some());

        meta.min_parent_version = Some(Version::new(1, 2, 0));
        meta.max_parent_version = Some(Version::new(2, 0, 0));
        assert!(meta.accepts_parent_version(&Version::new(1, 5, 0)));
        assert!(!meta.accepts_parent_version(&Version::new(1, 1, 9)));
        assert!(!meta.accepts_parent_version(&Version::new(2, 0, 1)));
    }

    #[test]
    fn test_levels_are_ordered() {
        assert!(InheritanceLevel::Base < InheritanceLevel::Organization);
        assert!(InheritanceLevel::Project < InheritanceLevel::User);
        assert_eq!(InheritanceLevel::Team.next(), InheritanceLevel::Project);
        assert_eq!(InheritanceLevel::User.next(), InheritanceLevel::User);
    }

    #[test]
    fn test_extension_kind_derivation() {
        let ext = TemplateExtension::new("e1", "E", "base")
            .with_rules(RulesPatch::new().deny(["x"]))
            .with_removals(["allow:y".parse().unwrap()]);
        assert_eq!(ext.kind, ExtensionKind::Mixed);

        let mut t = Template::builder().id("base").name("B").allow(["y"]).build().unwrap();
        assert_eq!(t.apply_extension(&ext), 1);
        assert_eq!(t.rules.deny, vec!["x"]);
        assert!(t.rules.allow.is_empty());
    }
}
