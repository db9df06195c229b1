// Template composition: merge N templates into one.
//
// Design Principles:
// 1. Deterministic order - inputs are sorted by (level, created_at, id) so the
//    caller's ordering never changes the result
// 2. Cycle check before merge - parent, composed_from and extension target
//    references inside the set are walked first
// 3. Conflicts are data - every primitive disagreement is recorded with its
//    resolution; only the `error` strategy turns them into a failure
// 4. Atomic failure - a failed composition returns no partial template
//
// Identity fields (id, name, version, inheritance metadata, timestamps) come
// from the overlay without being treated as conflicts.

use chrono::Utc;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Display;
use std::hash::Hash;
use thiserror::Error;

use crate::conditions::{evaluate_conditions, Condition};
use crate::store::TemplateStore;
use crate::template::{
    BuildContext, ExtensionType, RuleCategory, RuleSet, Template, TemplateId, TemplateMetadata,
    TemplateScope, Version,
};

// ============================================================================
// Strategies
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleMergeMode {
    /// Per-category union, base order first
    #[default]
    DeepMerge,
    /// Overlay rules replace the base wholesale
    Replace,
    /// Per-category concatenation, duplicates kept
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrayMergeMode {
    /// Keyed union; duplicate keys take the overlay value
    #[default]
    UniqueMerge,
    Append,
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectMergeMode {
    #[default]
    DeepMerge,
    Replace,
}

/// Per-field merge policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeStrategy {
    pub rules: RuleMergeMode,
    pub arrays: ArrayMergeMode,
    pub objects: ObjectMergeMode,
    pub parameters: ArrayMergeMode,
}

impl MergeStrategy {
    pub fn replace_rules() -> Self {
        Self {
            rules: RuleMergeMode::Replace,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Any conflict fails the composition
    Error,
    /// Overlay wins; the conflict is always logged
    Warn,
    /// Overlay wins; objects are merged structurally
    #[default]
    Merge,
    /// Overlay wins
    Override,
    /// Base value is kept
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictResolution {
    pub default_strategy: ConflictStrategy,
    /// Strategy per path; a key also covers every path below it
    pub rule_overrides: BTreeMap<String, ConflictStrategy>,
    pub log_conflicts: bool,
}

impl ConflictResolution {
    pub fn new(default_strategy: ConflictStrategy) -> Self {
        Self {
            default_strategy,
            ..Self::default()
        }
    }

    pub fn with_override(mut self, path: impl Into<String>, strategy: ConflictStrategy) -> Self {
        self.rule_overrides.insert(path.into(), strategy);
        self
    }

    pub fn with_logging(mut self, log_conflicts: bool) -> Self {
        self.log_conflicts = log_conflicts;
        self
    }

    /// Exact match first, then the longest dotted prefix, then the default
    pub fn strategy_for(&self, path: &str) -> ConflictStrategy {
        if let Some(strategy) = self.rule_overrides.get(path) {
            return *strategy;
        }
        self.rule_overrides
            .iter()
            .filter(|(prefix, _)| {
                path.len() > prefix.len()
                    && path.starts_with(prefix.as_str())
                    && path.as_bytes()[prefix.len()] == b'.'
            })
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, strategy)| *strategy)
            .unwrap_or(self.default_strategy)
    }
}

// ============================================================================
// Conflicts and results
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    ValueMismatch,
    TypeMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictOutcome {
    OverlayWins,
    BaseKept,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub path: String,
    pub base: Value,
    pub overlay: Value,
    pub conflict_type: ConflictType,
    pub strategy: ConflictStrategy,
    pub outcome: ConflictOutcome,
    /// Template whose values were being merged in
    pub source: Option<TemplateId>,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CompositionError {
    #[error("Composition failed with {} unresolved conflict(s)", .conflicts.len())]
    Conflicts { conflicts: Vec<Conflict> },

    #[error("Circular reference in composition set: {}", format_cycle(.cycle))]
    CircularReference { cycle: Vec<TemplateId> },

    #[error("Template not found: {0}")]
    TemplateNotFound(TemplateId),

    #[error("Nothing to compose")]
    EmptyComposition,
}

fn format_cycle(cycle: &[TemplateId]) -> String {
    cycle
        .iter()
        .map(TemplateId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompositionResult {
    pub template: Template,
    pub conflicts: Vec<Conflict>,
    /// Config entries dropped because their conditions did not hold
    pub skipped_sources: Vec<TemplateId>,
}

/// One template merged in by `compose_from_config`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositionEntry {
    pub template_id: TemplateId,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl CompositionEntry {
    pub fn new(template_id: impl Into<TemplateId>, priority: i32) -> Self {
        Self {
            template_id: template_id.into(),
            priority,
            conditions: Vec::new(),
        }
    }

    pub fn with_conditions(mut self, conditions: impl IntoIterator<Item = Condition>) -> Self {
        self.conditions = conditions.into_iter().collect();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositionOutput {
    pub id: Option<TemplateId>,
    pub name: String,
    pub description: String,
    pub version: Option<Version>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositionConfig {
    pub base_template_id: TemplateId,
    #[serde(default)]
    pub templates: Vec<CompositionEntry>,
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
    #[serde(default)]
    pub conflict_resolution: ConflictResolution,
    #[serde(default)]
    pub output: CompositionOutput,
}

impl CompositionConfig {
    pub fn new(base_template_id: impl Into<TemplateId>) -> Self {
        Self {
            base_template_id: base_template_id.into(),
            templates: Vec::new(),
            merge_strategy: MergeStrategy::default(),
            conflict_resolution: ConflictResolution::default(),
            output: CompositionOutput::default(),
        }
    }

    pub fn with_entry(mut self, entry: CompositionEntry) -> Self {
        self.templates.push(entry);
        self
    }

    pub fn with_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.merge_strategy = strategy;
        self
    }

    pub fn with_resolution(mut self, resolution: ConflictResolution) -> Self {
        self.conflict_resolution = resolution;
        self
    }

    pub fn with_output(mut self, output: CompositionOutput) -> Self {
        self.output = output;
        self
    }
}

// ============================================================================
// Merge machinery
// ============================================================================

/// Conflict accumulator for one merge step
struct MergeState<'a> {
    resolution: &'a ConflictResolution,
    source: Option<TemplateId>,
    conflicts: Vec<Conflict>,
}

impl<'a> MergeState<'a> {
    fn new(resolution: &'a ConflictResolution, source: Option<TemplateId>) -> Self {
        Self {
            resolution,
            source,
            conflicts: Vec::new(),
        }
    }

    /// Record a disagreement; true when the overlay value should win
    fn conflict(&mut self, path: &str, base: Value, overlay: Value) -> bool {
        let strategy = self.resolution.strategy_for(path);
        let outcome = match strategy {
            ConflictStrategy::Ignore => ConflictOutcome::BaseKept,
            _ => ConflictOutcome::OverlayWins,
        };
        let conflict_type = if same_json_type(&base, &overlay) {
            ConflictType::ValueMismatch
        } else {
            ConflictType::TypeMismatch
        };
        self.conflicts.push(Conflict {
            path: path.to_string(),
            base,
            overlay,
            conflict_type,
            strategy,
            outcome,
            source: self.source.clone(),
        });
        outcome == ConflictOutcome::OverlayWins
    }
}

fn same_json_type(a: &Value, b: &Value) -> bool {
    std::mem::discriminant(a) == std::mem::discriminant(b)
}

fn join_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}

fn merge_json(
    base: &Value,
    overlay: &Value,
    path: &str,
    strategy: &MergeStrategy,
    state: &mut MergeState<'_>,
) -> Value {
    match (base, overlay) {
        (_, Value::Null) => base.clone(),
        (Value::Null, _) => overlay.clone(),
        (Value::Object(b), Value::Object(o)) => match strategy.objects {
            ObjectMergeMode::Replace => overlay.clone(),
            ObjectMergeMode::DeepMerge => {
                let mut merged = Map::new();
                for (key, base_value) in b {
                    let value = match o.get(key) {
                        Some(overlay_value) => merge_json(
                            base_value,
                            overlay_value,
                            &join_path(path, key),
                            strategy,
                            state,
                        ),
                        None => base_value.clone(),
                    };
                    merged.insert(key.clone(), value);
                }
                for (key, overlay_value) in o {
                    if !b.contains_key(key) {
                        merged.insert(key.clone(), overlay_value.clone());
                    }
                }
                Value::Object(merged)
            }
        },
        (Value::Array(b), Value::Array(o)) => match strategy.arrays {
            ArrayMergeMode::Replace => overlay.clone(),
            ArrayMergeMode::Append => Value::Array(b.iter().chain(o).cloned().collect()),
            ArrayMergeMode::UniqueMerge => {
                let mut merged = b.clone();
                for item in o {
                    if !merged.contains(item) {
                        merged.push(item.clone());
                    }
                }
                Value::Array(merged)
            }
        },
        _ if base == overlay => base.clone(),
        _ => {
            if state.conflict(path, base.clone(), overlay.clone()) {
                overlay.clone()
            } else {
                base.clone()
            }
        }
    }
}

fn merge_keyed<T, K, F>(
    base: &[T],
    overlay: &[T],
    key: F,
    mode: ArrayMergeMode,
    field: &str,
    state: &mut MergeState<'_>,
) -> Vec<T>
where
    T: Clone + PartialEq + Serialize,
    K: Eq + Hash + Display,
    F: Fn(&T) -> K,
{
    match mode {
        ArrayMergeMode::Replace => overlay.to_vec(),
        ArrayMergeMode::Append => base.iter().chain(overlay).cloned().collect(),
        ArrayMergeMode::UniqueMerge => {
            let mut merged: Vec<T> = Vec::with_capacity(base.len() + overlay.len());
            let mut positions: HashMap<K, usize> = HashMap::new();
            for item in base {
                let k = key(item);
                match positions.get(&k) {
                    Some(&pos) => merged[pos] = item.clone(),
                    None => {
                        positions.insert(k, merged.len());
                        merged.push(item.clone());
                    }
                }
            }
            for item in overlay {
                let k = key(item);
                match positions.get(&k) {
                    Some(&pos) => {
                        if merged[pos] != *item {
                            let path = join_path(field, &k.to_string());
                            let base_value = serde_json::to_value(&merged[pos]).unwrap_or(Value::Null);
                            let overlay_value = serde_json::to_value(item).unwrap_or(Value::Null);
                            if state.conflict(&path, base_value, overlay_value) {
                                merged[pos] = item.clone();
                            }
                        }
                    }
                    None => {
                        positions.insert(k, merged.len());
                        merged.push(item.clone());
                    }
                }
            }
            merged
        }
    }
}

fn merge_rules(base: &RuleSet, overlay: &RuleSet, mode: RuleMergeMode) -> RuleSet {
    match mode {
        RuleMergeMode::Replace => overlay.clone(),
        RuleMergeMode::DeepMerge | RuleMergeMode::Append => {
            let mut merged = base.clone();
            for category in RuleCategory::ALL {
                let target = merged.get_mut(category);
                for pattern in overlay.get(category) {
                    if mode == RuleMergeMode::Append || !target.contains(pattern) {
                        target.push(pattern.clone());
                    }
                }
            }
            merged
        }
    }
}

fn merge_scope(
    base: &TemplateScope,
    overlay: &TemplateScope,
    strategy: &MergeStrategy,
    state: &mut MergeState<'_>,
) -> TemplateScope {
    let base_value = serde_json::to_value(base).unwrap_or(Value::Null);
    let overlay_value = serde_json::to_value(overlay).unwrap_or(Value::Null);
    let merged = merge_json(&base_value, &overlay_value, "scope", strategy, state);
    serde_json::from_value(merged).unwrap_or_else(|_| overlay.clone())
}

fn merge_metadata(
    base: &TemplateMetadata,
    overlay: &TemplateMetadata,
    strategy: &MergeStrategy,
    state: &mut MergeState<'_>,
) -> TemplateMetadata {
    let by_value = |s: &String| s.clone();
    TemplateMetadata {
        description: if overlay.description.is_empty() {
            base.description.clone()
        } else {
            overlay.description.clone()
        },
        tags: merge_keyed(&base.tags, &overlay.tags, by_value, strategy.arrays, "metadata.tags", state),
        compliance: merge_keyed(
            &base.compliance,
            &overlay.compliance,
            by_value,
            strategy.arrays,
            "metadata.compliance",
            state,
        ),
        required_permissions: merge_keyed(
            &base.required_permissions,
            &overlay.required_permissions,
            by_value,
            strategy.arrays,
            "metadata.required_permissions",
            state,
        ),
        author: overlay.author.clone().or_else(|| base.author.clone()),
        built_in: overlay.built_in,
        created_at: overlay.created_at,
        updated_at: overlay.updated_at,
    }
}

// ============================================================================
// Composer
// ============================================================================

/// Merges templates under a merge strategy and conflict policy
#[derive(Debug, Clone, Default)]
pub struct Composer {
    strategy: MergeStrategy,
    resolution: ConflictResolution,
}

impl Composer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_resolution(mut self, resolution: ConflictResolution) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn strategy(&self) -> &MergeStrategy {
        &self.strategy
    }

    pub fn resolution(&self) -> &ConflictResolution {
        &self.resolution
    }

    /// Compose under this composer's strategy and policy
    pub fn compose(&self, templates: &[Template]) -> Result<CompositionResult, CompositionError> {
        self.compose_with(templates, &self.strategy, &self.resolution)
    }

    pub fn compose_with(
        &self,
        templates: &[Template],
        strategy: &MergeStrategy,
        resolution: &ConflictResolution,
    ) -> Result<CompositionResult, CompositionError> {
        if templates.is_empty() {
            return Err(CompositionError::EmptyComposition);
        }
        detect_cycles(templates.iter())?;

        let mut ordered: Vec<&Template> = templates.iter().collect();
        ordered.sort_by(|a, b| {
            a.inheritance
                .level
                .cmp(&b.inheritance.level)
                .then(a.metadata.created_at.cmp(&b.metadata.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        let (template, conflicts) = self.fold(&ordered, strategy, resolution)?;
        Ok(CompositionResult {
            template,
            conflicts,
            skipped_sources: Vec::new(),
        })
    }

    /// Merge a base template with the configured entries looked up in `store`
    ///
    /// Order is the base first, then entries by ascending `priority` (stable
    /// for equal priorities). Unlike `compose`, inheritance level and creation
    /// time are not consulted: the config's priorities decide.
    pub fn compose_from_config(
        &self,
        config: &CompositionConfig,
        store: &TemplateStore,
        ctx: &BuildContext,
    ) -> Result<CompositionResult, CompositionError> {
        let base = store
            .get(&config.base_template_id)
            .ok_or_else(|| CompositionError::TemplateNotFound(config.base_template_id.clone()))?;

        let mut entries: Vec<&CompositionEntry> = config.templates.iter().collect();
        entries.sort_by_key(|entry| entry.priority);

        let mut sources = vec![base];
        let mut skipped_sources = Vec::new();
        for entry in entries {
            if !evaluate_conditions(&entry.conditions, ctx) {
                debug!(
                    "Skipping {} in composition: conditions not met for {}",
                    entry.template_id, ctx.environment
                );
                skipped_sources.push(entry.template_id.clone());
                continue;
            }
            let template = store
                .get(&entry.template_id)
                .ok_or_else(|| CompositionError::TemplateNotFound(entry.template_id.clone()))?;
            sources.push(template);
        }

        detect_cycles(sources.iter().map(|t| t.as_ref()))?;

        let ordered: Vec<&Template> = sources.iter().map(|t| t.as_ref()).collect();
        let (mut template, conflicts) =
            self.fold(&ordered, &config.merge_strategy, &config.conflict_resolution)?;

        let output = &config.output;
        let now = Utc::now();
        template.id = output.id.clone().unwrap_or_else(TemplateId::generate);
        if !output.name.is_empty() {
            template.name = output.name.clone();
        }
        if !output.description.is_empty() {
            template.metadata.description = output.description.clone();
        }
        template.version = output.version.clone().unwrap_or_default();
        template.metadata.created_at = now;
        template.metadata.updated_at = now;
        template.metadata.built_in = false;
        template.locked = None;
        template.inheritance.parent_id = None;
        template.inheritance.chain.clear();
        template.inheritance.extension_type = ExtensionType::Compose;
        template.inheritance.composed_from = sources.iter().map(|t| t.id.clone()).collect();

        Ok(CompositionResult {
            template,
            conflicts,
            skipped_sources,
        })
    }

    /// Merge `overlay` onto `base`; conflicts are returned, never raised
    pub fn merge_pair(
        &self,
        base: &Template,
        overlay: &Template,
        strategy: &MergeStrategy,
        resolution: &ConflictResolution,
    ) -> (Template, Vec<Conflict>) {
        let mut state = MergeState::new(resolution, Some(overlay.id.clone()));

        let rules = merge_rules(&base.rules, &overlay.rules, strategy.rules);
        let metadata = merge_metadata(&base.metadata, &overlay.metadata, strategy, &mut state);
        let parameters = merge_keyed(
            &base.parameters,
            &overlay.parameters,
            |p| p.name.clone(),
            strategy.parameters,
            "parameters",
            &mut state,
        );
        let scope = match strategy.objects {
            ObjectMergeMode::Replace => overlay.scope.clone(),
            ObjectMergeMode::DeepMerge => merge_scope(&base.scope, &overlay.scope, strategy, &mut state),
        };
        let extensions = merge_keyed(
            &base.extensions,
            &overlay.extensions,
            |e| e.id.clone(),
            strategy.arrays,
            "extensions",
            &mut state,
        );
        let custom_validation = merge_keyed(
            &base.custom_validation,
            &overlay.custom_validation,
            |c| c.rule_id.clone(),
            strategy.arrays,
            "custom_validation",
            &mut state,
        );

        let merged = Template {
            id: overlay.id.clone(),
            name: overlay.name.clone(),
            version: overlay.version.clone(),
            rules,
            metadata,
            parameters,
            scope,
            locked: overlay.locked.clone(),
            inheritance: overlay.inheritance.clone(),
            extensions,
            custom_validation,
        };
        (merged, state.conflicts)
    }

    /// Deep-merge two JSON documents under this composer's policy
    pub fn merge_values(&self, base: &Value, overlay: &Value) -> Result<(Value, Vec<Conflict>), CompositionError> {
        self.merge_values_with(base, overlay, &self.strategy, &self.resolution)
    }

    pub fn merge_values_with(
        &self,
        base: &Value,
        overlay: &Value,
        strategy: &MergeStrategy,
        resolution: &ConflictResolution,
    ) -> Result<(Value, Vec<Conflict>), CompositionError> {
        let mut state = MergeState::new(resolution, None);
        let merged = merge_json(base, overlay, "", strategy, &mut state);
        settle(&state.conflicts, resolution)?;
        Ok((merged, state.conflicts))
    }

    fn fold(
        &self,
        ordered: &[&Template],
        strategy: &MergeStrategy,
        resolution: &ConflictResolution,
    ) -> Result<(Template, Vec<Conflict>), CompositionError> {
        let (first, rest) = ordered.split_first().ok_or(CompositionError::EmptyComposition)?;
        let mut result = first.structural_clone();
        let mut conflicts = Vec::new();

        for overlay in rest {
            let (merged, step_conflicts) = self.merge_pair(&result, overlay, strategy, resolution);
            result = merged;
            conflicts.extend(step_conflicts);
        }

        settle(&conflicts, resolution)?;
        Ok((result, conflicts))
    }
}

/// Fail on conflicts whose effective strategy is `error`, log the rest
fn settle(conflicts: &[Conflict], resolution: &ConflictResolution) -> Result<(), CompositionError> {
    if conflicts.iter().any(|c| c.strategy == ConflictStrategy::Error) {
        return Err(CompositionError::Conflicts {
            conflicts: conflicts.to_vec(),
        });
    }
    for conflict in conflicts {
        if resolution.log_conflicts || conflict.strategy == ConflictStrategy::Warn {
            warn!(
                "Composition conflict at {}: {} vs {} ({:?}, {:?})",
                conflict.path, conflict.base, conflict.overlay, conflict.strategy, conflict.outcome
            );
        }
    }
    Ok(())
}

/// DFS over parent, composed_from and extension-target references inside the set
pub fn detect_cycles<'a>(templates: impl Iterator<Item = &'a Template>) -> Result<(), CompositionError> {
    let nodes: HashMap<&TemplateId, &Template> = templates.map(|t| (&t.id, t)).collect();

    let edges = |t: &'a Template| -> Vec<&'a TemplateId> {
        let mut out: Vec<&TemplateId> = Vec::new();
        out.extend(t.inheritance.parent_id.iter());
        out.extend(t.inheritance.composed_from.iter());
        out.extend(t.extensions.iter().map(|e| &e.target_template_id));
        out.retain(|id| **id != t.id);
        out
    };

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        InProgress,
        Done,
    }

    let mut marks: HashMap<&TemplateId, Mark> = HashMap::new();
    let mut roots: Vec<&TemplateId> = nodes.keys().copied().collect();
    roots.sort();

    for root in roots {
        if marks.contains_key(root) {
            continue;
        }
        // (node, next edge index) stack with the current path
        let mut stack: Vec<(&TemplateId, Vec<&TemplateId>, usize)> = Vec::new();
        let mut path: Vec<&TemplateId> = Vec::new();
        let mut on_path: HashSet<&TemplateId> = HashSet::new();

        marks.insert(root, Mark::InProgress);
        stack.push((root, edges(nodes[root]), 0));
        path.push(root);
        on_path.insert(root);

        while let Some((node, targets, idx)) = stack.last_mut() {
            if *idx >= targets.len() {
                marks.insert(*node, Mark::Done);
                on_path.remove(*node);
                path.pop();
                stack.pop();
                continue;
            }
            let next = targets[*idx];
            *idx += 1;

            let Some(next_template) = nodes.get(next) else {
                continue;
            };
            if on_path.contains(next) {
                let start = path.iter().position(|id| *id == next).unwrap_or(0);
                let mut cycle: Vec<TemplateId> = path[start..].iter().map(|id| (*id).clone()).collect();
                cycle.push(next.clone());
                return Err(CompositionError::CircularReference { cycle });
            }
            if marks.get(next) == Some(&Mark::Done) {
                continue;
            }
            marks.insert(next, Mark::InProgress);
            on_path.insert(next);
            path.push(next);
            stack.push((next, edges(next_template), 0));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::ComparisonOp;
    use crate::template::{InheritanceLevel, ParameterType, TemplateParameter};
    use chrono::TimeZone;
    use serde_json::json;

    fn template(id: &str, level: InheritanceLevel, second: u32) -> Template {
        Template::builder()
            .id(id)
            .name(id)
            .level(level)
            .created_at(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, second).unwrap())
            .build()
            .unwrap()
    }

    #[test]
    fn test_strategy_for_prefix_lookup() {
        let resolution = ConflictResolution::new(ConflictStrategy::Error)
            .with_override("scope", ConflictStrategy::Override)
            .with_override("scope.team", ConflictStrategy::Ignore);
        assert_eq!(resolution.strategy_for("scope.organization"), ConflictStrategy::Override);
        assert_eq!(resolution.strategy_for("scope.team"), ConflictStrategy::Ignore);
        assert_eq!(resolution.strategy_for("scope.team.x"), ConflictStrategy::Ignore);
        assert_eq!(resolution.strategy_for("scoped"), ConflictStrategy::Error);
        assert_eq!(resolution.strategy_for("parameters.x"), ConflictStrategy::Error);
    }

    #[test]
    fn test_merge_values_conflict_accounting() {
        let base = json!({"x": 1, "keep": {"a": true}});
        let overlay = json!({"x": 2, "keep": {"b": false}});

        let strict = Composer::new().with_resolution(ConflictResolution::new(ConflictStrategy::Error));
        match strict.merge_values(&base, &overlay) {
            Err(CompositionError::Conflicts { conflicts }) => {
                assert_eq!(conflicts.len(), 1);
                assert_eq!(conflicts[0].path, "x");
                assert_eq!(conflicts[0].conflict_type, ConflictType::ValueMismatch);
            }
            other => panic!("expected conflicts, got {:?}", other),
        }

        let lenient = Composer::new().with_resolution(ConflictResolution::new(ConflictStrategy::Override));
        let (merged, conflicts) = lenient.merge_values(&base, &overlay).unwrap();
        assert_eq!(merged, json!({"x": 2, "keep": {"a": true, "b": false}}));
        assert_eq!(conflicts.len(), 1);

        let ignore = Composer::new().with_resolution(ConflictResolution::new(ConflictStrategy::Ignore));
        let (merged, _) = ignore.merge_values(&base, &overlay).unwrap();
        assert_eq!(merged["x"], json!(1));
    }

    #[test]
    fn test_type_mismatch_and_replace() {
        let composer = Composer::new();
        let (_, conflicts) = composer.merge_values(&json!({"x": 1}), &json!({"x": "1"})).unwrap();
        assert_eq!(conflicts[0].conflict_type, ConflictType::TypeMismatch);

        let replace = MergeStrategy {
            objects: ObjectMergeMode::Replace,
            ..MergeStrategy::default()
        };
        let (merged, conflicts) = composer
            .merge_values_with(&json!({"a": 1}), &json!({"b": 2}), &replace, &ConflictResolution::default())
            .unwrap();
        assert_eq!(merged, json!({"b": 2}));
        assert!(conflicts.is_empty());
    }

    #[test]
    fn test_compose_is_order_independent() {
        let mut base = template("base", InheritanceLevel::Base, 0);
        base.rules.deny = vec!["eval(".into()];
        base.metadata.tags = vec!["a".into(), "b".into()];
        base.parameters.push(TemplateParameter::new("mode", ParameterType::String).with_default(json!("strict")));

        let mut org = template("org", InheritanceLevel::Organization, 1);
        org.rules.deny = vec!["rm -rf".into(), "eval(".into()];
        org.metadata.tags = vec!["c".into(), "a".into()];
        org.parameters.push(TemplateParameter::new("mode", ParameterType::String).with_default(json!("relaxed")));

        let mut team = template("team", InheritanceLevel::Team, 2);
        team.metadata.tags = vec!["d".into(), "b".into()];

        let composer = Composer::new();
        let forward = composer.compose(&[base.clone(), org.clone(), team.clone()]).unwrap();
        let backward = composer.compose(&[team, org, base]).unwrap();

        assert_eq!(forward.template, backward.template);
        assert_eq!(forward.template.metadata.tags, vec!["a", "b", "c", "d"]);
        assert_eq!(forward.template.rules.deny, vec!["eval(", "rm -rf"]);
        assert_eq!(forward.template.parameters[0].default, Some(json!("relaxed")));
        assert_eq!(forward.template.id.as_str(), "team");
        assert_eq!(forward.conflicts.len(), 1);
        assert_eq!(forward.conflicts[0].path, "parameters.mode");
    }

    #[test]
    fn test_compose_error_policy_is_atomic() {
        let mut a = template("a", InheritanceLevel::Base, 0);
        a.scope = TemplateScope::organization("acme");
        let mut b = template("b", InheritanceLevel::Team, 1);
        b.scope = TemplateScope::organization("globex");

        let strict = Composer::new().with_resolution(ConflictResolution::new(ConflictStrategy::Error));
        match strict.compose(&[a.clone(), b.clone()]) {
            Err(CompositionError::Conflicts { conflicts }) => {
                assert_eq!(conflicts.len(), 1);
                assert_eq!(conflicts[0].path, "scope.organization");
            }
            other => panic!("expected conflicts, got {:?}", other),
        }

        let scoped_override = ConflictResolution::new(ConflictStrategy::Error)
            .with_override("scope", ConflictStrategy::Ignore);
        let result = Composer::new().with_resolution(scoped_override).compose(&[a, b]).unwrap();
        assert_eq!(result.template.scope.organization.as_deref(), Some("acme"));
        assert_eq!(result.conflicts[0].outcome, ConflictOutcome::BaseKept);
    }

    #[test]
    fn test_rule_merge_modes() {
        let base = RuleSet {
            deny: vec!["a".into(), "b".into()],
            ..RuleSet::default()
        };
        let overlay = RuleSet {
            deny: vec!["b".into(), "c".into()],
            ..RuleSet::default()
        };
        assert_eq!(merge_rules(&base, &overlay, RuleMergeMode::DeepMerge).deny, vec!["a", "b", "c"]);
        assert_eq!(merge_rules(&base, &overlay, RuleMergeMode::Append).deny, vec!["a", "b", "b", "c"]);
        assert_eq!(merge_rules(&base, &overlay, RuleMergeMode::Replace).deny, vec!["b", "c"]);
    }

    #[test]
    fn test_cycle_detection() {
        let a = Template::builder().id("a").name("a").parent("b").build().unwrap();
        let b = Template::builder().id("b").name("b").parent("a").build().unwrap();
        let c = Template::builder().id("c").name("c").parent("a").build().unwrap();

        match Composer::new().compose(&[a.clone(), b, c.clone()]) {
            Err(CompositionError::CircularReference { cycle }) => {
                assert_eq!(cycle.first(), cycle.last());
                assert!(cycle.len() >= 3);
            }
            other => panic!("expected cycle, got {:?}", other),
        }

        // References outside the set are not followed
        assert!(Composer::new().compose(&[a, c]).is_ok());
        assert!(matches!(Composer::new().compose(&[]), Err(CompositionError::EmptyComposition)));
    }

    #[test]
    fn test_compose_from_config() {
        let store = TemplateStore::new();
        store.put(Template::builder().id("base").name("Base").deny(["eval("]).build().unwrap());
        store.put(Template::builder().id("net").name("Net").deny(["curl"]).build().unwrap());
        store.put(Template::builder().id("git").name("Git").allow(["git status"]).build().unwrap());
        store.put(Template::builder().id("prod").name("Prod").deny(["ssh"]).build().unwrap());

        let config = CompositionConfig::new("base")
            .with_entry(CompositionEntry::new("git", 20))
            .with_entry(CompositionEntry::new("net", 10))
            .with_entry(CompositionEntry::new("prod", 5).with_conditions([Condition::environment(
                ComparisonOp::Eq,
                json!("production"),
            )]))
            .with_output(CompositionOutput {
                id: Some("combined".into()),
                name: "Combined".into(),
                ..CompositionOutput::default()
            });

        let result = Composer::new()
            .compose_from_config(&config, &store, &BuildContext::new("development"))
            .unwrap();
        assert_eq!(result.template.id.as_str(), "combined");
        assert_eq!(result.template.name, "Combined");
        assert_eq!(result.template.rules.deny, vec!["eval(", "curl"]);
        assert_eq!(result.template.rules.allow, vec!["git status"]);
        assert_eq!(result.skipped_sources, vec![TemplateId::new("prod")]);
        assert_eq!(result.template.inheritance.extension_type, ExtensionType::Compose);
        assert_eq!(
            result.template.inheritance.composed_from,
            vec![TemplateId::new("base"), TemplateId::new("net"), TemplateId::new("git")]
        );

        // Priority decides even against inheritance level
        store.put(
            Template::builder()
                .id("team")
                .name("Team")
                .level(InheritanceLevel::Team)
                .deny(["scp"])
                .build()
                .unwrap(),
        );
        let config = CompositionConfig::new("base")
            .with_entry(CompositionEntry::new("net", 2))
            .with_entry(CompositionEntry::new("team", 1));
        let result = Composer::new()
            .compose_from_config(&config, &store, &BuildContext::default())
            .unwrap();
        assert_eq!(
            result.template.inheritance.composed_from,
            vec![TemplateId::new("base"), TemplateId::new("team"), TemplateId::new("net")]
        );

        let missing = CompositionConfig::new("base").with_entry(CompositionEntry::new("nope", 1));
        assert!(matches!(
            Composer::new().compose_from_config(&missing, &store, &BuildContext::default()),
            Err(CompositionError::TemplateNotFound(_))
        ));
    }
}
