//! Subject-keyed cache of rebuilt write-model instances.
//!
//! The cache serves command sourcing: a hit lets the router read only the
//! events appended since the cached event id. The merge step is the only
//! mutation and keeps the entry with the numerically higher event id, so
//! concurrent command executions for one subject can both recompute without
//! ever regressing the cache.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use cqrs_engine_client::compare_event_ids;

use crate::command::SourcingMode;
use crate::error::EngineResult;

/// Identifies one cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub subject: String,
    pub instance_type: TypeId,
    pub sourcing_mode: SourcingMode,
}

/// One cached sourcing result: the id of the latest sourced event, the
/// rebuilt instance, and the last seen id per exact subject.
#[derive(Clone, Default)]
pub struct CacheValue {
    pub event_id: Option<String>,
    pub instance: Option<Arc<dyn Any + Send + Sync>>,
    pub sourced_subject_ids: HashMap<String, String>,
}

impl CacheValue {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Storage contract for rebuilt state.
///
/// `fetch` and `merge` are the two halves of the atomic merge protocol; use
/// [`fetch_and_merge`] to run the full sequence.
pub trait StateRebuildingCache: Send + Sync {
    /// Current value for the key, or an empty value when absent. Counts as
    /// an access for eviction purposes.
    fn fetch(&self, key: &CacheKey) -> CacheValue;

    /// Atomically insert or replace the entry, keeping whichever value has
    /// the higher event id. Returns the retained value.
    fn merge(&self, key: CacheKey, proposed: CacheValue) -> CacheValue;
}

/// Fetch the current value, run the caller's merge function on it, and
/// store the proposal. A proposal without an event id is returned to the
/// caller but never stored.
///
/// The merge function runs outside any cache lock; concurrent calls for
/// the same key may both execute, and the atomic `merge` step keeps the
/// stored event id monotonic.
pub async fn fetch_and_merge<F, Fut>(
    cache: &dyn StateRebuildingCache,
    key: CacheKey,
    merge_fn: F,
) -> EngineResult<CacheValue>
where
    F: FnOnce(CacheValue) -> Fut,
    Fut: Future<Output = EngineResult<CacheValue>>,
{
    let current = cache.fetch(&key);
    let proposed = merge_fn(current).await?;
    if proposed.event_id.is_none() {
        return Ok(proposed);
    }
    Ok(cache.merge(key, proposed))
}

struct Entry {
    value: CacheValue,
    last_access: u64,
}

struct LruInner {
    entries: HashMap<CacheKey, Entry>,
    access_counter: u64,
}

/// In-memory LRU cache. Any `fetch` or `merge` of a key counts as an
/// access; inserts beyond capacity evict the least-recently-accessed
/// entry.
pub struct InMemoryStateCache {
    inner: Mutex<LruInner>,
    capacity: usize,
}

impl InMemoryStateCache {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be positive");
        Self {
            inner: Mutex::new(LruInner {
                entries: HashMap::new(),
                access_counter: 0,
            }),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the key currently has an entry; does not count as an access.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner
            .lock()
            .expect("cache lock poisoned")
            .entries
            .contains_key(key)
    }
}

impl LruInner {
    fn touch(&mut self, key: &CacheKey) {
        self.access_counter += 1;
        let counter = self.access_counter;
        if let Some(entry) = self.entries.get_mut(key) {
            entry.last_access = counter;
        }
    }

    fn evict_down_to(&mut self, capacity: usize) {
        while self.entries.len() > capacity {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            tracing::debug!(subject = %oldest.subject, "evicting least-recently-used cache entry");
            self.entries.remove(&oldest);
        }
    }
}

impl StateRebuildingCache for InMemoryStateCache {
    fn fetch(&self, key: &CacheKey) -> CacheValue {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.touch(key);
        inner
            .entries
            .get(key)
            .map(|entry| entry.value.clone())
            .unwrap_or_else(CacheValue::empty)
    }

    fn merge(&self, key: CacheKey, proposed: CacheValue) -> CacheValue {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.access_counter += 1;
        let counter = inner.access_counter;
        let retained = match inner.entries.get_mut(&key) {
            Some(entry) => {
                let keep_proposed = match (&entry.value.event_id, &proposed.event_id) {
                    (Some(current), Some(new)) => compare_event_ids(new, current).is_gt(),
                    (None, Some(_)) => true,
                    _ => false,
                };
                if keep_proposed {
                    entry.value = proposed;
                }
                entry.last_access = counter;
                entry.value.clone()
            }
            None => {
                inner.entries.insert(
                    key,
                    Entry {
                        value: proposed.clone(),
                        last_access: counter,
                    },
                );
                proposed
            }
        };
        inner.evict_down_to(self.capacity);
        retained
    }
}

/// A cache that never stores anything: every fetch is a miss and every
/// merge hands the proposal straight back.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStateCache;

impl StateRebuildingCache for NoopStateCache {
    fn fetch(&self, _key: &CacheKey) -> CacheValue {
        CacheValue::empty()
    }

    fn merge(&self, _key: CacheKey, proposed: CacheValue) -> CacheValue {
        proposed
    }
}
