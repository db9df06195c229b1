// Invalidate-on-write result cache shared by validation and resolution.
//
// Entries are keyed by a sha256 content hash and tagged with the template
// ids they depend on. Writing a template evicts every entry tagged with it
// before the write becomes visible to new callers.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::template::TemplateId;

/// Hex sha256 over length-prefixed parts
pub fn content_hash<I, P>(parts: I) -> String
where
    I: IntoIterator<Item = P>,
    P: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        let bytes = part.as_ref();
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }
    format!("{:x}", hasher.finalize())
}

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    tags: Vec<TemplateId>,
}

#[derive(Debug)]
struct CacheInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    order: VecDeque<String>,
    by_tag: HashMap<TemplateId, HashSet<String>>,
}

impl<V> CacheInner<V> {
    fn drop_key(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            for tag in entry.tags {
                if let Some(keys) = self.by_tag.get_mut(&tag) {
                    keys.remove(key);
                    if keys.is_empty() {
                        self.by_tag.remove(&tag);
                    }
                }
            }
        }
    }
}

/// Snapshot of cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Bounded FIFO cache with tag-based eviction
#[derive(Debug)]
pub struct ResultCache<V> {
    inner: Mutex<CacheInner<V>>,
    capacity: usize,
    enabled: bool,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> ResultCache<V> {
    pub fn new(capacity: usize, enabled: bool) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                by_tag: HashMap::new(),
            }),
            capacity,
            enabled: enabled && capacity > 0,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0, false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn get(&self, key: &str) -> Option<V> {
        if !self.enabled {
            return None;
        }
        let found = self.inner.lock().entries.get(key).map(|e| e.value.clone());
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    pub fn insert(&self, key: String, value: V, tags: Vec<TemplateId>) {
        if !self.enabled {
            return;
        }
        let mut inner = self.inner.lock();
        inner.drop_key(&key);
        inner.order.retain(|k| k != &key);

        while inner.entries.len() >= self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => inner.drop_key(&oldest),
                None => break,
            }
        }

        for tag in &tags {
            inner.by_tag.entry(tag.clone()).or_default().insert(key.clone());
        }
        inner.order.push_back(key.clone());
        inner.entries.insert(key, CacheEntry { value, tags });
    }

    /// Evict a single key
    pub fn remove(&self, key: &str) {
        let mut inner = self.inner.lock();
        inner.drop_key(key);
        inner.order.retain(|k| k != key);
    }

    /// Evict every entry tagged with `template_id`, returning how many
    pub fn invalidate(&self, template_id: &TemplateId) -> usize {
        let mut inner = self.inner.lock();
        let keys: Vec<String> = inner
            .by_tag
            .get(template_id)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        for key in &keys {
            inner.drop_key(key);
        }
        if !keys.is_empty() {
            let evicted: HashSet<&String> = keys.iter().collect();
            inner.order.retain(|k| !evicted.contains(k));
        }
        keys.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
        inner.by_tag.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.inner.lock().entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
