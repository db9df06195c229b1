// Shared template registry.
//
// Design Principles:
// 1. Readers receive Arc snapshots; a read never observes a half-applied write
// 2. Every write bumps a per-template revision so caches can detect staleness
// 3. Parent -> children index is maintained under the same lock as the map
//
// The store is passed explicitly to each component at construction.

use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use crate::template::{Template, TemplateId};

#[derive(Debug, Clone)]
pub struct StoredTemplate {
    pub template: Arc<Template>,
    /// Monotonic store-wide counter value at the last write
    pub revision: u64,
}

#[derive(Debug, Default)]
struct StoreInner {
    templates: HashMap<TemplateId, StoredTemplate>,
    children: HashMap<TemplateId, BTreeSet<TemplateId>>,
    next_revision: u64,
}

impl StoreInner {
    fn unlink(&mut self, template: &Template) {
        if let Some(parent) = template.parent_id() {
            if let Some(set) = self.children.get_mut(parent) {
                set.remove(&template.id);
                if set.is_empty() {
                    self.children.remove(parent);
                }
            }
        }
    }

    fn link(&mut self, template: &Template) {
        if let Some(parent) = template.parent_id() {
            self.children
                .entry(parent.clone())
                .or_default()
                .insert(template.id.clone());
        }
    }

    fn insert(&mut self, template: Template) -> u64 {
        if let Some(old) = self.templates.get(&template.id).map(|s| s.template.clone()) {
            self.unlink(&old);
        }
        self.link(&template);
        self.next_revision += 1;
        let revision = self.next_revision;
        self.templates.insert(
            template.id.clone(),
            StoredTemplate {
                template: Arc::new(template),
                revision,
            },
        );
        revision
    }
}

/// Thread-safe map of templates keyed by id
#[derive(Debug, Default)]
pub struct TemplateStore {
    inner: RwLock<StoreInner>,
}

impl TemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace, returning the new revision
    pub fn put(&self, template: Template) -> u64 {
        self.inner.write().insert(template)
    }

    /// Insert only when the id is free
    ///
    /// Returns `None` without writing when a template already holds the id.
    pub fn insert_if_absent(&self, template: Template) -> Option<Arc<Template>> {
        let mut inner = self.inner.write();
        if inner.templates.contains_key(&template.id) {
            return None;
        }
        let id = template.id.clone();
        inner.insert(template);
        inner.templates.get(&id).map(|s| s.template.clone())
    }

    pub fn get(&self, id: &TemplateId) -> Option<Arc<Template>> {
        self.inner.read().templates.get(id).map(|s| s.template.clone())
    }

    pub fn get_with_revision(&self, id: &TemplateId) -> Option<StoredTemplate> {
        self.inner.read().templates.get(id).cloned()
    }

    pub fn revision(&self, id: &TemplateId) -> Option<u64> {
        self.inner.read().templates.get(id).map(|s| s.revision)
    }

    pub fn contains(&self, id: &TemplateId) -> bool {
        self.inner.read().templates.contains_key(id)
    }

    pub fn remove(&self, id: &TemplateId) -> Option<Arc<Template>> {
        let mut inner = self.inner.write();
        let stored = inner.templates.remove(id)?;
        inner.unlink(&stored.template);
        Some(stored.template)
    }

    /// All templates sorted by id
    pub fn list(&self) -> Vec<Arc<Template>> {
        let inner = self.inner.read();
        let mut all: Vec<Arc<Template>> =
            inner.templates.values().map(|s| s.template.clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn len(&self) -> usize {
        self.inner.read().templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Direct children, sorted by id
    pub fn children(&self, id: &TemplateId) -> Vec<TemplateId> {
        self.inner
            .read()
            .children
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Breadth-first descendants, excluding `id` itself
    pub fn descendants(&self, id: &TemplateId) -> Vec<TemplateId> {
        let inner = self.inner.read();
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        let mut queue: VecDeque<&TemplateId> = VecDeque::from([id]);

        while let Some(current) = queue.pop_front() {
            if let Some(kids) = inner.children.get(current) {
                for kid in kids {
                    if kid != id && seen.insert(kid.clone()) {
                        out.push(kid.clone());
                        queue.push_back(kid);
                    }
                }
            }
        }
        out
    }

    /// Read-modify-write under a single write lock
    ///
    /// Returns `None` when the template does not exist. The closure's error
    /// aborts the write and leaves the stored value untouched.
    pub fn update<F, E>(&self, id: &TemplateId, f: F) -> Option<Result<Arc<Template>, E>>
    where
        F: FnOnce(&mut Template) -> Result<(), E>,
    {
        let mut inner = self.inner.write();
        let current = inner.templates.get(id)?.template.clone();
        let mut next = current.structural_clone();
        if let Err(e) = f(&mut next) {
            return Some(Err(e));
        }
        next.id = id.clone();
        inner.insert(next);
        inner.templates.get(id).map(|s| Ok(s.template.clone()))
    }
}
