// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Memoized minimal step orders, keyed by graph digest and dirty roots.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use serde::Serialize;

use crate::plan::StepId;
use crate::registry::RootId;

/// Default number of cached plans.
pub const DEFAULT_PLAN_CACHE_CAPACITY: usize = 128;

/// Dirty sets with more roots than this are never cached.
pub const MAX_CACHED_ROOTS: usize = 128;

/// Lookups before the hit rate is judged.
const MIN_LOOKUPS_BEFORE_DISABLE: u64 = 64;

/// Why the cache turned itself off.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheDisableReason {
    /// Capacity is zero.
    ZeroCapacity,
    /// Sustained hit rate at or below one percent.
    LowHitRate,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct PlanKey {
    digest: u64,
    roots: Box<[RootId]>,
}

/// Cache state attached to a convergence outcome.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEvidence {
    /// Configured capacity.
    pub capacity: usize,
    /// Entries held.
    pub size: usize,
    /// Lifetime hits.
    pub hits: u64,
    /// Lifetime misses.
    pub misses: u64,
    /// Lifetime evictions.
    pub evicts: u64,
    /// Whether this convergence hit.
    pub hit: bool,
    /// Whether the cache is off.
    pub disabled: bool,
    /// Why it is off.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_reason: Option<CacheDisableReason>,
}

/// Bounded LRU of minimal step orders.
///
/// Once more than `max(64, capacity + 1)` lookups were made with a hit rate
/// at or below one percent, the cache drops its entries and stays off for
/// the rest of its life.
#[derive(Debug)]
pub struct PlanCache {
    entries: Option<LruCache<PlanKey, Arc<[StepId]>>>,
    capacity: usize,
    hits: u64,
    misses: u64,
    evicts: u64,
    disabled: Option<CacheDisableReason>,
}

impl Default for PlanCache {
    fn default() -> Self {
        Self::new(DEFAULT_PLAN_CACHE_CAPACITY)
    }
}

impl PlanCache {
    /// Creates a cache. A zero capacity creates a disabled cache.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let entries = NonZeroUsize::new(capacity).map(LruCache::new);
        Self {
            disabled: entries.is_none().then_some(CacheDisableReason::ZeroCapacity),
            entries,
            capacity,
            hits: 0,
            misses: 0,
            evicts: 0,
        }
    }

    /// Returns `true` once the cache is off.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled.is_some()
    }

    /// Returns `true` if a dirty set with `roots` may be cached.
    #[must_use]
    pub fn accepts(&self, roots: &[RootId]) -> bool {
        !self.is_disabled() && roots.len() <= MAX_CACHED_ROOTS
    }

    /// Number of entries held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, LruCache::len)
    }

    /// Returns `true` if no entry is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up a plan and updates the counters.
    pub fn get(&mut self, digest: u64, roots: &[RootId]) -> Option<Arc<[StepId]>> {
        if !self.accepts(roots) {
            return None;
        }
        let key = PlanKey {
            digest,
            roots: roots.into(),
        };
        let found = self
            .entries
            .as_mut()
            .and_then(|entries| entries.get(&key).cloned());
        if found.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
            self.maybe_disable();
        }
        found
    }

    /// Stores a plan.
    pub fn insert(&mut self, digest: u64, roots: &[RootId], plan: Arc<[StepId]>) {
        if !self.accepts(roots) {
            return;
        }
        let Some(entries) = self.entries.as_mut() else {
            return;
        };
        let key = PlanKey {
            digest,
            roots: roots.into(),
        };
        if let Some((old, _)) = entries.push(key.clone(), plan) {
            if old != key {
                self.evicts += 1;
            }
        }
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn evidence(&self, hit: bool) -> CacheEvidence {
        CacheEvidence {
            capacity: self.capacity,
            size: self.len(),
            hits: self.hits,
            misses: self.misses,
            evicts: self.evicts,
            hit,
            disabled: self.is_disabled(),
            disable_reason: self.disabled,
        }
    }

    fn maybe_disable(&mut self) {
        let lookups = self.hits + self.misses;
        let threshold = MIN_LOOKUPS_BEFORE_DISABLE.max(self.capacity as u64 + 1);
        if lookups > threshold && self.hits * 100 <= lookups {
            tracing::warn!(
                lookups,
                hits = self.hits,
                capacity = self.capacity,
                "plan cache disabled: low hit rate"
            );
            self.disabled = Some(CacheDisableReason::LowHitRate);
            self.entries = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::FieldPath;
    use crate::registry::FieldPathRegistry;

    fn roots(n: u32) -> Vec<RootId> {
        let paths: Vec<FieldPath> = (0..=n)
            .map(|i| FieldPath::parse(&format!("f{i}")).unwrap())
            .collect();
        let registry = FieldPathRegistry::from_paths(&paths);
        vec![registry.id_of(&paths[n as usize]).unwrap()]
    }

    fn plan(ids: &[u32]) -> Arc<[StepId]> {
        ids.iter().map(|&i| StepId(i)).collect()
    }

    #[test]
    fn hits_misses_and_evictions() {
        let mut cache = PlanCache::new(2);
        assert!(cache.get(1, &roots(0)).is_none());
        cache.insert(1, &roots(0), plan(&[0]));
        cache.insert(1, &roots(1), plan(&[1]));
        assert_eq!(cache.get(1, &roots(0)).as_deref(), Some(&[StepId(0)][..]));
        cache.insert(1, &roots(2), plan(&[2]));
        let evidence = cache.evidence(true);
        assert_eq!(evidence.hits, 1);
        assert_eq!(evidence.misses, 1);
        assert_eq!(evidence.evicts, 1);
        assert_eq!(evidence.size, 2);
        assert!(cache.get(1, &roots(1)).is_none(), "least recently used went");
        assert!(cache.get(2, &roots(0)).is_none(), "digest namespaces keys");
    }

    #[test]
    fn zero_capacity_is_disabled() {
        let mut cache = PlanCache::new(0);
        cache.insert(1, &roots(0), plan(&[0]));
        assert!(cache.get(1, &roots(0)).is_none());
        let evidence = cache.evidence(false);
        assert!(evidence.disabled);
        assert_eq!(evidence.disable_reason, Some(CacheDisableReason::ZeroCapacity));
        assert_eq!(evidence.misses, 0, "a disabled cache is not consulted");
    }

    #[test]
    fn disables_itself_on_low_hit_rate() {
        let mut cache = PlanCache::new(4);
        for i in 0..70 {
            let key = roots(i % 40);
            if cache.get(7, &key).is_none() {
                cache.insert(7, &key, plan(&[i]));
            }
        }
        assert!(cache.is_disabled());
        assert!(cache.is_empty());
        assert_eq!(
            cache.evidence(false).disable_reason,
            Some(CacheDisableReason::LowHitRate)
        );
    }
}
