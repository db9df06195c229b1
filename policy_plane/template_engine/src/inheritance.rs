// Template registry operations and ancestor-chain resolution.
//
// Design Principles:
// 1. Fail fast on impossible graphs - cycles, missing parents and version
//    mismatches abort before anything is merged
// 2. Chains are snapshots - registration records the ancestor ids at that
//    moment; reparenting recomputes descendants explicitly
// 3. Parent permissions bound what a child may change
// 4. Invalidate-on-write - every write evicts the template and its
//    descendants from both caches
//
// Resolution (resolve_template):
// 1. Walk parent links from the leaf, checking cycles, depth and version bounds
// 2. Reverse to root-first order
// 3. Fold pairwise with the composer
// 4. Apply attached extensions by ascending priority, honoring conditions
// 5. Validate the result

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

use crate::cache::{content_hash, CacheStats, ResultCache};
use crate::composer::{Composer, ConflictResolution, ConflictStrategy, MergeStrategy};
use crate::conditions::evaluate_conditions;
use crate::config::InheritanceConfig;
use crate::store::TemplateStore;
use crate::template::{
    BuildContext, CustomValidationRef, ExtensionType, InheritanceLevel, ModelError, OverridePermissions,
    RuleCategory, RuleSet, Template, TemplateExtension, TemplateId, TemplateParameter, TemplateScope, Version,
};
use crate::validator::{ValidationError, Validator};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq)]
pub enum InheritanceError {
    #[error("Circular inheritance detected: {}", format_chain(.chain))]
    CircularInheritance { template_id: TemplateId, chain: Vec<TemplateId> },

    #[error("Parent template {parent_id} of {template_id} not found")]
    ParentNotFound { template_id: TemplateId, parent_id: TemplateId },

    #[error("Template {template_id} requires parent {parent_id} {required}, found {found}")]
    VersionIncompatible {
        template_id: TemplateId,
        parent_id: TemplateId,
        required: String,
        found: Version,
    },

    #[error("Template {template_id} failed validation: {}", summarize(.errors))]
    ValidationFailed {
        template_id: TemplateId,
        errors: Vec<ValidationError>,
    },

    #[error("Template not found: {0}")]
    TemplateNotFound(TemplateId),

    #[error("Template already exists: {0}")]
    AlreadyExists(TemplateId),

    #[error("Template {template_id} is locked by {holder}")]
    TemplateLocked { template_id: TemplateId, holder: String },

    #[error("Cannot inherit from {parent_id}: {reason}")]
    InheritanceForbidden { parent_id: TemplateId, reason: String },

    #[error("Template {template_id} still has children: {}", format_chain(.children))]
    HasChildren {
        template_id: TemplateId,
        children: Vec<TemplateId>,
    },

    #[error("Inheritance chain of {template_id} exceeds {max_depth} levels")]
    DepthExceeded { template_id: TemplateId, max_depth: usize },

    #[error(transparent)]
    Structural(#[from] ModelError),
}

fn format_chain(ids: &[TemplateId]) -> String {
    ids.iter().map(TemplateId::as_str).collect::<Vec<_>>().join(" -> ")
}

fn summarize(errors: &[ValidationError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

/// Partial data for a new child template
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateDraft {
    pub id: Option<TemplateId>,
    pub name: String,
    pub version: Option<Version>,
    pub description: String,
    pub rules: RuleSet,
    pub tags: Vec<String>,
    pub parameters: Vec<TemplateParameter>,
    /// Inherited from the parent when unset
    pub scope: Option<TemplateScope>,
    pub permissions: Option<OverridePermissions>,
    pub extensions: Vec<TemplateExtension>,
    pub custom_validation: Vec<CustomValidationRef>,
    pub author: Option<String>,
}

impl TemplateDraft {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<TemplateId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_rules(mut self, rules: RuleSet) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_extension(mut self, extension: TemplateExtension) -> Self {
        self.extensions.push(extension);
        self
    }

    pub fn with_scope(mut self, scope: TemplateScope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn with_permissions(mut self, permissions: OverridePermissions) -> Self {
        self.permissions = Some(permissions);
        self
    }
}

#[derive(Debug, Clone)]
struct CachedResolution {
    template: Template,
    /// Store revision of every chain member at resolution time
    revisions: Vec<(TemplateId, u64)>,
}

// ============================================================================
// Engine
// ============================================================================

pub struct InheritanceEngine {
    store: Arc<TemplateStore>,
    composer: Composer,
    validator: Arc<Validator>,
    config: InheritanceConfig,
    cache: ResultCache<CachedResolution>,
}

impl InheritanceEngine {
    pub fn new(store: Arc<TemplateStore>, validator: Arc<Validator>) -> Self {
        Self::with_config(InheritanceConfig::default(), store, validator)
    }

    pub fn with_config(
        config: InheritanceConfig,
        store: Arc<TemplateStore>,
        validator: Arc<Validator>,
    ) -> Self {
        Self {
            cache: ResultCache::new(config.cache_capacity, config.cache_enabled),
            store,
            composer: Composer::new(),
            validator,
            config,
        }
    }

    pub fn with_composer(mut self, composer: Composer) -> Self {
        self.composer = composer;
        self
    }

    pub fn store(&self) -> &Arc<TemplateStore> {
        &self.store
    }

    pub fn validator(&self) -> &Arc<Validator> {
        &self.validator
    }

    pub fn composer(&self) -> &Composer {
        &self.composer
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    // ------------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------------

    /// Store a new template after structural validation
    ///
    /// The chain snapshot is recomputed from the stored parent.
    pub fn register_template(&self, mut template: Template) -> Result<Arc<Template>, InheritanceError> {
        if self.store.contains(&template.id) {
            return Err(InheritanceError::AlreadyExists(template.id));
        }

        template.inheritance.chain = match template.parent_id().cloned() {
            Some(parent_id) => {
                let parent = self.store.get(&parent_id).ok_or_else(|| InheritanceError::ParentNotFound {
                    template_id: template.id.clone(),
                    parent_id: parent_id.clone(),
                })?;
                self.check_parent(&template, &parent)?;
                let mut chain = parent.inheritance.chain.clone();
                chain.push(parent.id.clone());
                chain
            }
            None => Vec::new(),
        };

        self.ensure_structure(&template)?;

        let id = template.id.clone();
        let stored = self
            .store
            .insert_if_absent(template)
            .ok_or_else(|| InheritanceError::AlreadyExists(id.clone()))?;
        self.invalidate_tree(&id);
        info!("Registered template {}", id);
        Ok(stored)
    }

    /// Replace a template's content; parent links are kept
    pub fn update_template(
        &self,
        mut template: Template,
        actor: Option<&str>,
    ) -> Result<Arc<Template>, InheritanceError> {
        let existing = self
            .store
            .get(&template.id)
            .ok_or_else(|| InheritanceError::TemplateNotFound(template.id.clone()))?;
        check_lock(&existing, actor)?;
        keep_registry_fields(&mut template, &existing);
        template.touch();
        self.ensure_structure(&template)?;

        // Lock and links are re-read under the write lock
        let id = template.id.clone();
        let updated = self
            .store
            .update(&id, |current| {
                check_lock(current, actor)?;
                keep_registry_fields(&mut template, current);
                *current = template;
                Ok::<(), InheritanceError>(())
            })
            .ok_or_else(|| InheritanceError::TemplateNotFound(id.clone()))??;
        self.invalidate_tree(&id);
        debug!("Updated template {}", id);
        Ok(updated)
    }

    /// Build and register a child of `parent_id`
    pub fn create_inherited_template(
        &self,
        parent_id: &TemplateId,
        draft: TemplateDraft,
        extension_type: ExtensionType,
    ) -> Result<Arc<Template>, InheritanceError> {
        let id = draft.id.clone().unwrap_or_else(TemplateId::generate);
        let parent = self
            .store
            .get(parent_id)
            .ok_or_else(|| InheritanceError::ParentNotFound {
                template_id: id.clone(),
                parent_id: parent_id.clone(),
            })?;

        if let Some(lock) = &parent.locked {
            return Err(InheritanceError::TemplateLocked {
                template_id: parent.id.clone(),
                holder: lock.holder.clone(),
            });
        }
        if parent.metadata.built_in && extension_type == ExtensionType::Override {
            return Err(InheritanceError::InheritanceForbidden {
                parent_id: parent.id.clone(),
                reason: "built-in templates cannot be overridden".to_string(),
            });
        }

        let mut template = Template::builder()
            .id(id)
            .name(draft.name)
            .rules(draft.rules)
            .description(draft.description)
            .parent(parent.id.clone())
            .level(parent.inheritance.level.next())
            .extension_type(extension_type)
            .permissions(draft.permissions.unwrap_or_default())
            .parent_version_bounds(Some(parent.version.clone()), None)
            .scope(draft.scope.unwrap_or_else(|| parent.scope.clone()))
            .build()?;
        if let Some(version) = draft.version {
            template.version = version;
        }
        template.metadata.tags = draft.tags;
        template.metadata.author = draft.author;
        template.parameters = draft.parameters;
        template.extensions = draft.extensions;
        template.custom_validation = draft.custom_validation;

        self.register_template(template)
    }

    /// Reparent a template and recompute the chains below it
    pub fn update_inheritance(
        &self,
        id: &TemplateId,
        new_parent: Option<TemplateId>,
        extension_type: ExtensionType,
        actor: Option<&str>,
    ) -> Result<Arc<Template>, InheritanceError> {
        let existing = self
            .store
            .get(id)
            .ok_or_else(|| InheritanceError::TemplateNotFound(id.clone()))?;
        check_lock(&existing, actor)?;

        let mut updated = existing.structural_clone();
        updated.inheritance.extension_type = extension_type;

        match &new_parent {
            Some(parent_id) => {
                let descendants = self.store.descendants(id);
                if parent_id == id || descendants.contains(parent_id) {
                    // id -> new parent -> ... back up to id
                    let mut chain = vec![id.clone()];
                    let mut cursor = Some(parent_id.clone());
                    while let Some(current) = cursor {
                        chain.push(current.clone());
                        if &current == id || chain.len() > self.config.max_depth {
                            break;
                        }
                        cursor = self.store.get(&current).and_then(|t| t.parent_id().cloned());
                    }
                    return Err(InheritanceError::CircularInheritance {
                        template_id: id.clone(),
                        chain,
                    });
                }
                let parent = self.store.get(parent_id).ok_or_else(|| InheritanceError::ParentNotFound {
                    template_id: id.clone(),
                    parent_id: parent_id.clone(),
                })?;
                if let Some(lock) = &parent.locked {
                    return Err(InheritanceError::TemplateLocked {
                        template_id: parent.id.clone(),
                        holder: lock.holder.clone(),
                    });
                }
                if parent.metadata.built_in && extension_type == ExtensionType::Override {
                    return Err(InheritanceError::InheritanceForbidden {
                        parent_id: parent.id.clone(),
                        reason: "built-in templates cannot be overridden".to_string(),
                    });
                }
                updated.inheritance.parent_id = Some(parent.id.clone());
                self.check_parent(&updated, &parent)?;
                updated.inheritance.level = parent.inheritance.level.next();
                let mut chain = parent.inheritance.chain.clone();
                chain.push(parent.id.clone());
                updated.inheritance.chain = chain;
            }
            None => {
                updated.inheritance.parent_id = None;
                updated.inheritance.chain.clear();
                updated.inheritance.level = InheritanceLevel::Base;
            }
        }
        updated.touch();
        self.ensure_structure(&updated)?;

        self.store.put(updated);
        self.rechain_descendants(id);
        self.invalidate_tree(id);
        info!("Template {} now inherits from {:?}", id, new_parent.as_ref().map(TemplateId::as_str));
        self.store.get(id).ok_or_else(|| InheritanceError::TemplateNotFound(id.clone()))
    }

    pub fn lock_template(
        &self,
        id: &TemplateId,
        holder: &str,
        reason: Option<String>,
    ) -> Result<Arc<Template>, InheritanceError> {
        let result = self
            .store
            .update(id, |t| {
                check_lock(t, Some(holder))?;
                t.lock(holder, reason);
                Ok(())
            })
            .ok_or_else(|| InheritanceError::TemplateNotFound(id.clone()))?;
        self.invalidate_tree(id);
        result
    }

    /// Only the lock holder may unlock
    pub fn unlock_template(&self, id: &TemplateId, actor: &str) -> Result<Arc<Template>, InheritanceError> {
        let result = self
            .store
            .update(id, |t| {
                check_lock(t, Some(actor))?;
                t.unlock();
                Ok(())
            })
            .ok_or_else(|| InheritanceError::TemplateNotFound(id.clone()))?;
        self.invalidate_tree(id);
        result
    }

    pub fn find_child_templates(&self, id: &TemplateId, recursive: bool) -> Vec<Arc<Template>> {
        let ids = if recursive {
            self.store.descendants(id)
        } else {
            self.store.children(id)
        };
        ids.iter().filter_map(|child| self.store.get(child)).collect()
    }

    pub fn delete_template(&self, id: &TemplateId, actor: Option<&str>) -> Result<Arc<Template>, InheritanceError> {
        let existing = self
            .store
            .get(id)
            .ok_or_else(|| InheritanceError::TemplateNotFound(id.clone()))?;
        let children = self.store.children(id);
        if !children.is_empty() {
            return Err(InheritanceError::HasChildren {
                template_id: id.clone(),
                children,
            });
        }
        check_lock(&existing, actor)?;

        let removed = self
            .store
            .remove(id)
            .ok_or_else(|| InheritanceError::TemplateNotFound(id.clone()))?;
        self.invalidate_tree(id);
        info!("Deleted template {}", id);
        Ok(removed)
    }

    pub fn get_template(&self, id: &TemplateId) -> Option<Arc<Template>> {
        self.store.get(id)
    }

    pub fn list_templates(&self) -> Vec<Arc<Template>> {
        self.store.list()
    }

    // ------------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------------

    /// Fully resolved template for a build context
    pub fn resolve_template(&self, id: &TemplateId, ctx: &BuildContext) -> Result<Template, InheritanceError> {
        let key = resolution_key(id, ctx);

        if let Some(key) = &key {
            if let Some(cached) = self.cache.get(key) {
                let fresh = cached
                    .revisions
                    .iter()
                    .all(|(member, revision)| self.store.revision(member) == Some(*revision));
                if fresh {
                    debug!("Resolution cache hit for {}", id);
                    return Ok(cached.template);
                }
                self.cache.remove(key);
            }
        }

        // 1. Walk the parent links
        let walked = self.walk_chain(id)?;

        // 2. Root first
        let ordered: Vec<&Template> = walked.iter().rev().map(|(t, _)| t.as_ref()).collect();

        // 3. Fold
        let (root, rest) = ordered
            .split_first()
            .ok_or_else(|| InheritanceError::TemplateNotFound(id.clone()))?;
        let mut resolved = self.fold_chain(root, rest);

        // 4. Extensions
        let can_remove = ordered
            .len()
            .checked_sub(2)
            .map(|i| ordered[i].inheritance.permissions.can_remove_rules)
            .unwrap_or(true);
        apply_attached_extensions(&mut resolved, ctx, can_remove);

        // 5. Validate
        let validation = self.validator.validate_template(&resolved, ctx);
        if !validation.is_valid {
            warn!("Resolved template {} is invalid: {}", id, validation.error_summary());
            return Err(InheritanceError::ValidationFailed {
                template_id: id.clone(),
                errors: validation.errors,
            });
        }

        if let Some(key) = key {
            let revisions: Vec<(TemplateId, u64)> =
                walked.iter().map(|(t, rev)| (t.id.clone(), *rev)).collect();
            let tags = revisions.iter().map(|(member, _)| member.clone()).collect();
            self.cache.insert(
                key,
                CachedResolution {
                    template: resolved.clone(),
                    revisions,
                },
                tags,
            );
        }
        Ok(resolved)
    }

    /// Leaf-first list of (template, revision)
    fn walk_chain(&self, id: &TemplateId) -> Result<Vec<(Arc<Template>, u64)>, InheritanceError> {
        let mut walked: Vec<(Arc<Template>, u64)> = Vec::new();
        let mut in_progress: HashSet<TemplateId> = HashSet::new();
        let mut current = id.clone();

        loop {
            if in_progress.contains(&current) {
                let mut chain: Vec<TemplateId> = walked.iter().map(|(t, _)| t.id.clone()).collect();
                chain.push(current.clone());
                return Err(InheritanceError::CircularInheritance {
                    template_id: id.clone(),
                    chain,
                });
            }
            if walked.len() >= self.config.max_depth {
                return Err(InheritanceError::DepthExceeded {
                    template_id: id.clone(),
                    max_depth: self.config.max_depth,
                });
            }

            let stored = self.store.get_with_revision(&current).ok_or_else(|| match walked.last() {
                None => InheritanceError::TemplateNotFound(current.clone()),
                Some((child, _)) => InheritanceError::ParentNotFound {
                    template_id: child.id.clone(),
                    parent_id: current.clone(),
                },
            })?;

            if let Some((child, _)) = walked.last() {
                if !child.inheritance.accepts_parent_version(&stored.template.version) {
                    return Err(InheritanceError::VersionIncompatible {
                        template_id: child.id.clone(),
                        parent_id: stored.template.id.clone(),
                        required: child.inheritance.describe_bounds(),
                        found: stored.template.version.clone(),
                    });
                }
            }

            in_progress.insert(current.clone());
            let next = stored.template.parent_id().cloned();
            walked.push((stored.template, stored.revision));

            match next {
                Some(parent) => current = parent,
                None => return Ok(walked),
            }
        }
    }

    fn fold_chain(&self, root: &Template, rest: &[&Template]) -> Template {
        let mut resolved = root.structural_clone();
        let mut ancestors = vec![root.id.clone()];
        let mut parent_permissions = root.inheritance.permissions;

        for child in rest {
            let mut overlay = child.structural_clone();
            if !parent_permissions.can_add_rules {
                let base = &resolved.rules;
                for category in RuleCategory::ALL {
                    overlay
                        .rules
                        .get_mut(category)
                        .retain(|p| base.contains(category, p));
                }
            }
            if !parent_permissions.can_modify_metadata {
                overlay.metadata.description = resolved.metadata.description.clone();
                overlay.metadata.tags = resolved.metadata.tags.clone();
                overlay.metadata.compliance = resolved.metadata.compliance.clone();
            }

            let overriding = child.inheritance.extension_type == ExtensionType::Override;
            let (strategy, resolution) = match (overriding, parent_permissions.can_override_rules) {
                (true, true) => (MergeStrategy::default(), ConflictResolution::new(ConflictStrategy::Override)),
                (false, true) => (MergeStrategy::default(), ConflictResolution::new(ConflictStrategy::Merge)),
                (true, false) => {
                    warn!(
                        "Template {} declares override but its parent forbids overriding rules",
                        child.id
                    );
                    (MergeStrategy::default(), ConflictResolution::new(ConflictStrategy::Ignore))
                }
                (false, false) => (MergeStrategy::default(), ConflictResolution::new(ConflictStrategy::Ignore)),
            };

            let (merged, conflicts) = self.composer.merge_pair(&resolved, &overlay, &strategy, &resolution);
            for conflict in &conflicts {
                debug!(
                    "Inheritance conflict in {} at {}: {:?}",
                    child.id, conflict.path, conflict.outcome
                );
            }
            resolved = merged;
            parent_permissions = child.inheritance.permissions;
            ancestors.push(child.id.clone());
        }

        ancestors.pop();
        resolved.inheritance.chain = ancestors;
        resolved
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn check_parent(&self, child: &Template, parent: &Template) -> Result<(), InheritanceError> {
        if parent.inheritance.chain.contains(&child.id) || parent.id == child.id {
            let mut chain = parent.inheritance.chain.clone();
            chain.push(parent.id.clone());
            chain.push(child.id.clone());
            return Err(InheritanceError::CircularInheritance {
                template_id: child.id.clone(),
                chain,
            });
        }
        if !child.inheritance.accepts_parent_version(&parent.version) {
            return Err(InheritanceError::VersionIncompatible {
                template_id: child.id.clone(),
                parent_id: parent.id.clone(),
                required: child.inheritance.describe_bounds(),
                found: parent.version.clone(),
            });
        }
        Ok(())
    }

    fn ensure_structure(&self, template: &Template) -> Result<(), InheritanceError> {
        let result = self.validator.validate_structure(template);
        if result.is_valid {
            Ok(())
        } else {
            Err(InheritanceError::ValidationFailed {
                template_id: template.id.clone(),
                errors: result.errors,
            })
        }
    }

    fn rechain_descendants(&self, id: &TemplateId) {
        for descendant in self.store.descendants(id) {
            let Some(parent_id) = self.store.get(&descendant).and_then(|t| t.parent_id().cloned()) else {
                continue;
            };
            let Some(parent) = self.store.get(&parent_id) else {
                continue;
            };
            let mut chain = parent.inheritance.chain.clone();
            chain.push(parent.id.clone());
            let level = parent.inheritance.level.next();
            self.store.update(&descendant, |t| {
                t.inheritance.chain = chain;
                t.inheritance.level = level;
                Ok::<(), InheritanceError>(())
            });
        }
    }

    /// Evict the template and everything below it from both caches
    pub fn invalidate_tree(&self, id: &TemplateId) {
        let mut evicted = 0;
        for member in std::iter::once(id.clone()).chain(self.store.descendants(id)) {
            evicted += self.cache.invalidate(&member);
            evicted += self.validator.invalidate(&member);
        }
        if evicted > 0 {
            debug!("Evicted {} cached results below {}", evicted, id);
        }
    }
}

impl std::fmt::Debug for InheritanceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InheritanceEngine")
            .field("templates", &self.store.len())
            .field("config", &self.config)
            .field("cache", &self.cache.stats())
            .finish()
    }
}

/// Fields owned by the registry rather than by the caller's edit
fn keep_registry_fields(template: &mut Template, existing: &Template) {
    template.locked = existing.locked.clone();
    template.inheritance.parent_id = existing.inheritance.parent_id.clone();
    template.inheritance.chain = existing.inheritance.chain.clone();
    template.metadata.created_at = existing.metadata.created_at;
}

fn check_lock(template: &Template, actor: Option<&str>) -> Result<(), InheritanceError> {
    template.ensure_mutable_by(actor).map_err(|e| match e {
        ModelError::TemplateLocked { holder, .. } => InheritanceError::TemplateLocked {
            template_id: template.id.clone(),
            holder,
        },
        other => InheritanceError::Structural(other),
    })
}

fn resolution_key(id: &TemplateId, ctx: &BuildContext) -> Option<String> {
    let parameters = serde_json::to_vec(&ctx.parameters).ok()?;
    let user = serde_json::to_vec(&ctx.user).ok()?;
    let context = serde_json::to_vec(&ctx.context).ok()?;
    Some(content_hash([
        id.as_str().as_bytes(),
        ctx.environment.as_bytes(),
        parameters.as_slice(),
        user.as_slice(),
        context.as_slice(),
    ]))
}

/// Apply extensions by ascending priority; equal priorities keep list order
pub fn apply_attached_extensions(template: &mut Template, ctx: &BuildContext, can_remove: bool) {
    let mut extensions = template.extensions.clone();
    extensions.sort_by_key(|e| e.priority);

    for extension in &extensions {
        if !evaluate_conditions(&extension.conditions, ctx) {
            debug!("Extension {} skipped: conditions not met", extension.id);
            continue;
        }
        if !can_remove && !extension.remove.is_empty() {
            warn!(
                "Extension {} removes rules but the parent of {} forbids removal",
                extension.id, template.id
            );
            let mut additive = extension.clone();
            additive.remove.clear();
            template.apply_extension(&additive);
        } else {
            template.apply_extension(extension);
        }
    }
}
