//! Per-transaction field value cache.
//!
//! One cache per environment/transaction: concurrent transactions never
//! share entries, and dropping the environment discards the cache —
//! that is the whole rollback story for in-memory state.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::value::Value;

type Key = (String, i64, String);

#[derive(Debug, Clone)]
enum Slot {
    Value(Value),
    /// A dependency changed; the cached value is no longer trustworthy
    /// and must be recomputed (not re-read) before the next use.
    Stale,
}

/// Result of a cache probe.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheState {
    Miss,
    Stale,
    Hit(Value),
}

/// In-memory `(model, id, field) → value` cache with stale marking and
/// wildcard invalidation.
pub struct Cache {
    slots: RwLock<BTreeMap<Key, Slot>>,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn get(&self, model: &str, id: i64, field: &str) -> CacheState {
        let slots = self.slots.read().unwrap();
        match slots.get(&(model.to_string(), id, field.to_string())) {
            None => CacheState::Miss,
            Some(Slot::Stale) => CacheState::Stale,
            Some(Slot::Value(v)) => CacheState::Hit(v.clone()),
        }
    }

    pub fn insert(&self, model: &str, id: i64, field: &str, value: Value) {
        let mut slots = self.slots.write().unwrap();
        slots.insert((model.to_string(), id, field.to_string()), Slot::Value(value));
    }

    /// Mark a slot stale. Inserts the marker even when no value was
    /// cached: for stored computed fields an empty slot would fall back
    /// to the outdated persisted value, so the marker must survive.
    pub fn mark_stale(&self, model: &str, id: i64, field: &str) {
        let mut slots = self.slots.write().unwrap();
        slots.insert((model.to_string(), id, field.to_string()), Slot::Stale);
    }

    /// Evict matching entries; any `None` component is a wildcard.
    /// `invalidate(None, None, None)` clears everything — the safety
    /// valve after writes that bypass the normal path. Idempotent and
    /// safe on an empty cache.
    pub fn invalidate(&self, model: Option<&str>, id: Option<i64>, field: Option<&str>) {
        let mut slots = self.slots.write().unwrap();
        slots.retain(|(m, i, f), _| {
            !(model.map_or(true, |mm| mm == m)
                && id.map_or(true, |ii| ii == *i)
                && field.map_or(true, |ff| ff == f))
        });
    }

    pub fn clear(&self) {
        self.slots.write().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.slots.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
