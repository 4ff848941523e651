// File: record-sync/src/cache.rs
// Purpose: Query-cache collaborator used to refresh list and detail views

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Hierarchical query key, e.g. `["items"]` or `["items", "item-1"]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// List query for a whole table
    pub fn list(table: &str) -> Self {
        Self::new([table])
    }

    /// Detail query for one row of a table
    pub fn detail(table: &str, id: &str) -> Self {
        Self::new([table, id])
    }

    /// Detail query indexed under a view-specific namespace
    pub fn namespaced(namespace: &str, id: &str) -> Self {
        Self::new([namespace, id])
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }

    /// Whether this key falls under `prefix`
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl std::fmt::Display for QueryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

/// Cache of query results shared by every subscription in the process.
///
/// Both operations must be idempotent; calling them repeatedly for the
/// same key is always safe.
pub trait QueryCache: Send + Sync {
    /// Mark queries under `key` stale
    fn invalidate_queries(&self, key: &QueryKey);

    /// Refresh queries under `key` immediately
    fn refetch_queries(&self, key: &QueryKey);
}

/// In-memory cache that records every invalidation and refetch
#[derive(Debug, Default)]
pub struct MemoryQueryCache {
    invalidations: Mutex<HashMap<QueryKey, u64>>,
    refetches: Mutex<HashMap<QueryKey, u64>>,
}

impl MemoryQueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidation_count(&self, key: &QueryKey) -> u64 {
        self.invalidations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn refetch_count(&self, key: &QueryKey) -> u64 {
        self.refetches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Total invalidations across all keys
    pub fn total_invalidations(&self) -> u64 {
        self.invalidations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .sum()
    }

    /// Whether `key` was covered by any invalidation so far
    pub fn is_stale(&self, key: &QueryKey) -> bool {
        self.invalidations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .any(|prefix| key.starts_with(prefix))
    }

    pub fn clear(&self) {
        self.invalidations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.refetches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl QueryCache for MemoryQueryCache {
    fn invalidate_queries(&self, key: &QueryKey) {
        tracing::debug!("Invalidating queries {}", key);
        *self
            .invalidations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_insert(0) += 1;
    }

    fn refetch_queries(&self, key: &QueryKey) {
        tracing::debug!("Refetching queries {}", key);
        *self
            .refetches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_constructors() {
        assert_eq!(QueryKey::list("items").parts(), ["items"]);
        assert_eq!(QueryKey::detail("items", "item-1").parts(), ["items", "item-1"]);
        assert_eq!(QueryKey::namespaced("item-detail", "item-1").to_string(), "[item-detail, item-1]");
    }

    #[test]
    fn test_invalidation_counts_and_prefix_staleness() {
        let cache = MemoryQueryCache::new();

        cache.invalidate_queries(&QueryKey::list("items"));
        cache.invalidate_queries(&QueryKey::list("items"));

        assert_eq!(cache.invalidation_count(&QueryKey::list("items")), 2);
        assert!(cache.is_stale(&QueryKey::detail("items", "item-1")));
        assert!(!cache.is_stale(&QueryKey::list("categories")));

        cache.clear();
        assert_eq!(cache.total_invalidations(), 0);
    }

    #[test]
    fn test_refetch_recorded_separately() {
        let cache = MemoryQueryCache::new();

        cache.refetch_queries(&QueryKey::list("items"));

        assert_eq!(cache.refetch_count(&QueryKey::list("items")), 1);
        assert_eq!(cache.invalidation_count(&QueryKey::list("items")), 0);
    }
}
