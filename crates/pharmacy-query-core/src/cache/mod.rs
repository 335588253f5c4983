//! Query Cache: canonical intent → execution result.
//!
//! Entries are tagged with the dataset version they were computed against
//! and are only served while that version is current. A reload bumps the
//! version and clears everything. Identical concurrent computations are
//! collapsed through [`SingleFlight`].

mod single_flight;

pub use single_flight::*;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::error::QueryResult;
use crate::models::ExecutionResult;

/// One memoized result.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub result: ExecutionResult,
    pub stored_at: DateTime<Utc>,
    /// Dataset version the result was computed against
    pub version: u64,
}

/// How a lookup was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOutcome {
    Hit,
    Computed,
    /// Waited on an identical in-flight computation
    Shared,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub computations: u64,
    pub shared: u64,
    pub entries: usize,
    pub version: u64,
}

struct CacheState {
    version: u64,
    fingerprint: String,
    entries: HashMap<String, CacheEntry>,
    /// Insertion order, oldest first
    order: VecDeque<String>,
}

pub struct QueryCache {
    state: Mutex<CacheState>,
    flights: SingleFlight<(u64, String), QueryResult<ExecutionResult>>,
    max_entries: Option<usize>,
    store: Option<Mutex<Database>>,
    hits: AtomicU64,
    misses: AtomicU64,
    computations: AtomicU64,
    shared: AtomicU64,
}

impl QueryCache {
    /// In-memory cache for the dataset with `fingerprint`.
    pub fn new(fingerprint: &str, max_entries: Option<usize>) -> Self {
        Self {
            state: Mutex::new(CacheState {
                version: 1,
                fingerprint: fingerprint.to_string(),
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            flights: SingleFlight::new(),
            max_entries: max_entries.filter(|n| *n > 0),
            store: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            computations: AtomicU64::new(0),
            shared: AtomicU64::new(0),
        }
    }

    /// Back the cache with a SQLite store. Entries from other datasets are purged.
    pub fn with_store(mut self, db: Database) -> Self {
        let fingerprint = self.fingerprint();
        match db.purge_cached_results_except(&fingerprint) {
            Ok(0) => {}
            Ok(removed) => tracing::info!(removed, "purged persisted results of other datasets"),
            Err(e) => tracing::warn!(error = %e, "failed to purge persisted cache"),
        }
        self.store = Some(Mutex::new(db));
        self
    }

    pub fn version(&self) -> u64 {
        self.lock().version
    }

    pub fn fingerprint(&self) -> String {
        self.lock().fingerprint.clone()
    }

    /// Result for `key` at the current version.
    pub fn get(&self, key: &str) -> Option<ExecutionResult> {
        let found = self.lookup(key);
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Store `result` under `key` at the current version.
    pub fn put(&self, key: &str, result: ExecutionResult) {
        let version = self.version();
        self.put_versioned(key, result, version);
    }

    /// Serve `key` from the cache, or run `compute` once across all
    /// concurrent callers. Errors are shared with waiters but never stored.
    pub fn get_or_compute<F>(&self, key: &str, compute: F) -> QueryResult<(ExecutionResult, CacheOutcome)>
    where
        F: FnOnce() -> QueryResult<ExecutionResult>,
    {
        if let Some(result) = self.get(key) {
            tracing::debug!(key, "cache hit");
            return Ok((result, CacheOutcome::Hit));
        }

        let version = self.version();
        let mut reused = false;
        let (result, role) = self.flights.run(&(version, key.to_string()), || {
            // A previous leader may have stored it after our miss
            if let Some(result) = self.lookup(key) {
                reused = true;
                return Ok(result);
            }
            self.computations.fetch_add(1, Ordering::Relaxed);
            let result = compute()?;
            self.put_versioned(key, result.clone(), version);
            Ok(result)
        });

        let outcome = match role {
            Role::Follower => {
                self.shared.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key, "joined in-flight computation");
                CacheOutcome::Shared
            }
            Role::Leader if reused => CacheOutcome::Hit,
            Role::Leader => CacheOutcome::Computed,
        };
        result.map(|r| (r, outcome))
    }

    /// Drop every entry and move to a new dataset. Returns the new version.
    pub fn invalidate(&self, fingerprint: &str) -> u64 {
        let mut state = self.lock();
        state.version += 1;
        state.fingerprint = fingerprint.to_string();
        let dropped = state.entries.len();
        state.entries.clear();
        state.order.clear();
        let version = state.version;
        drop(state);

        if let Some(store) = &self.store {
            let db = store.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = db.purge_cached_results_except(fingerprint) {
                tracing::warn!(error = %e, "failed to purge persisted cache");
            }
        }
        tracing::info!(version, dropped, "query cache invalidated");
        version
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            computations: self.computations.load(Ordering::Relaxed),
            shared: self.shared.load(Ordering::Relaxed),
            entries: state.entries.len(),
            version: state.version,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Memory first, then the persisted store.
    fn lookup(&self, key: &str) -> Option<ExecutionResult> {
        let (version, fingerprint) = {
            let state = self.lock();
            if let Some(entry) = state.entries.get(key) {
                if entry.version == state.version {
                    return Some(entry.result.clone());
                }
            }
            (state.version, state.fingerprint.clone())
        };

        let store = self.store.as_ref()?;
        let stored = {
            let db = store.lock().unwrap_or_else(PoisonError::into_inner);
            db.get_cached_result(&fingerprint, key)
        };
        match stored {
            Ok(Some(stored)) => {
                self.insert(key, stored.result.clone(), stored.stored_at, version);
                Some(stored.result)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key, error = %e, "persisted cache read failed");
                None
            }
        }
    }

    fn put_versioned(&self, key: &str, result: ExecutionResult, version: u64) {
        let stored_at = Utc::now();
        let Some(fingerprint) = self.insert(key, result.clone(), stored_at, version) else {
            tracing::debug!(key, version, "discarding result computed against a replaced dataset");
            return;
        };
        if let Some(store) = &self.store {
            let db = store.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = db.put_cached_result(&fingerprint, key, &result, stored_at) {
                tracing::warn!(key, error = %e, "persisted cache write failed");
            }
        }
    }

    /// Insert into memory if `version` is still current. Returns the
    /// fingerprint the entry belongs to.
    fn insert(&self, key: &str, result: ExecutionResult, stored_at: DateTime<Utc>, version: u64) -> Option<String> {
        let mut state = self.lock();
        if state.version != version {
            return None;
        }

        let entry = CacheEntry {
            result,
            stored_at,
            version,
        };
        if state.entries.insert(key.to_string(), entry).is_none() {
            state.order.push_back(key.to_string());
        }
        if let Some(max) = self.max_entries {
            while state.entries.len() > max {
                let Some(oldest) = state.order.pop_front() else {
                    break;
                };
                state.entries.remove(&oldest);
                tracing::debug!(key = %oldest, "evicted oldest cache entry");
            }
        }
        Some(state.fingerprint.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueryError;
    use crate::models::{Provenance, ResultValue, Unit};
    use proptest::prelude::*;

    fn result(value: f64) -> ExecutionResult {
        ExecutionResult {
            value: ResultValue::Scalar {
                value,
                unit: Unit::Usd,
                label: "latest unit cost of DrugA".into(),
            },
            provenance: Provenance::default(),
        }
    }

    #[test]
    fn test_put_then_get() {
        let cache = QueryCache::new("fp", None);
        assert_eq!(cache.get("k"), None);
        cache.put("k", result(1.0));
        assert_eq!(cache.get("k"), Some(result(1.0)));

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
    }

    #[test]
    fn test_invalidate_drops_entries_and_stale_puts() {
        let cache = QueryCache::new("fp1", None);
        cache.put("k", result(1.0));
        let old_version = cache.version();

        assert_eq!(cache.invalidate("fp2"), old_version + 1);
        assert_eq!(cache.get("k"), None);

        // A computation that started before the reload must not land
        cache.put_versioned("k", result(2.0), old_version);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_get_or_compute_stores_once() {
        let cache = QueryCache::new("fp", None);
        let (first, outcome) = cache.get_or_compute("k", || Ok(result(3.0))).unwrap();
        assert_eq!(outcome, CacheOutcome::Computed);

        let (second, outcome) = cache
            .get_or_compute("k", || panic!("must not recompute"))
            .unwrap();
        assert_eq!(outcome, CacheOutcome::Hit);
        assert_eq!(first, second);
        assert_eq!(cache.stats().computations, 1);
    }

    #[test]
    fn test_errors_are_not_cached() {
        let cache = QueryCache::new("fp", None);
        let err = cache
            .get_or_compute("k", || Err(QueryError::NoMatchingData { filters: vec![] }))
            .unwrap_err();
        assert!(matches!(err, QueryError::NoMatchingData { .. }));
        assert!(cache.is_empty());
        assert!(cache.get_or_compute("k", || Ok(result(1.0))).is_ok());
    }

    #[test]
    fn test_bounded_cache_evicts_oldest() {
        let cache = QueryCache::new("fp", Some(2));
        cache.put("a", result(1.0));
        cache.put("b", result(2.0));
        cache.put("a", result(1.5));
        cache.put("c", result(3.0));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(result(2.0)));
        assert_eq!(cache.get("c"), Some(result(3.0)));
    }

    #[test]
    fn test_store_backs_a_fresh_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");

        let cache = QueryCache::new("fp", None).with_store(Database::open(&path).unwrap());
        cache.put("k", result(4.0));
        drop(cache);

        let reopened = QueryCache::new("fp", None).with_store(Database::open(&path).unwrap());
        assert_eq!(reopened.get("k"), Some(result(4.0)));

        let other = QueryCache::new("other", None).with_store(Database::open(&path).unwrap());
        assert_eq!(other.get("k"), None);
    }

    proptest! {
        #[test]
        fn prop_put_get_idempotent(key in "[A-Z_|=\\[\\]a-z]{1,40}", value in 0.0f64..10_000.0) {
            let cache = QueryCache::new("fp", None);
            cache.put(&key, result(value));
            cache.put(&key, result(value));
            prop_assert_eq!(cache.get(&key), Some(result(value)));
            prop_assert_eq!(cache.len(), 1);
        }
    }
}
