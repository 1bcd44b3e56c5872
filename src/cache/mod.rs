use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::config::{AppConfig, CACHE_NAMESPACES};
use crate::error::NephroError;
use crate::store::Store;
use crate::store::cache_entries::NamespaceStats;

pub mod key;

pub use key::hashed_key;

/// Derived views and the tables they depend on. A mutation of any listed
/// table purges the mapped namespaces, synchronously with the write.
const DEPENDENCIES: &[(&str, &[&str], &[&str])] = &[
    ("network_analysis_cache", &["gene_annotations"], &["network_analysis"]),
    ("gene_scores_view", &["gene_evidence"], &["annotations"]),
];

struct L1Entry {
    value: String,
    expires_at: Instant,
}

struct L1Namespace {
    entries: LruCache<String, L1Entry>,
    ttl: Duration,
}

/// Two-tier cache: bounded in-process LRU in front of the durable
/// `cache_entries` table.
///
/// Reads check L1, then L2 (repopulating L1 on hit). Writes go through
/// to both tiers; an L2 failure is logged at warning and tolerated — the
/// L1 entry stays authoritative for its lifetime.
pub struct CacheManager {
    store: Arc<Store>,
    l1: Mutex<HashMap<String, L1Namespace>>,
}

impl CacheManager {
    /// Registers every known namespace up front, so admin queries against
    /// an empty namespace succeed with zero counts.
    pub fn new(store: Arc<Store>, config: &AppConfig) -> Self {
        let mut namespaces = HashMap::new();
        for namespace in CACHE_NAMESPACES {
            let ns_config = config.namespace(namespace);
            namespaces.insert(
                (*namespace).to_string(),
                L1Namespace {
                    entries: LruCache::new(
                        NonZeroUsize::new(ns_config.l1_max_entries.max(1))
                            .unwrap_or(NonZeroUsize::MIN),
                    ),
                    ttl: Duration::from_secs(ns_config.ttl_seconds),
                },
            );
        }
        let manager = CacheManager {
            store,
            l1: Mutex::new(namespaces),
        };
        // Opportunistic TTL sweep of the durable tier; expiry is also
        // enforced on every read, so a failed sweep costs nothing.
        match manager.sweep_expired() {
            Ok(swept) if swept > 0 => debug!(swept, "expired cache entries swept"),
            Ok(_) => {}
            Err(err) => warn!(error = %err, "cache sweep failed at startup"),
        }
        manager
    }

    fn check_registered(&self, namespace: &str) -> Result<(), NephroError> {
        let l1 = self
            .l1
            .lock()
            .map_err(|_| NephroError::Cache("cache mutex poisoned".into()))?;
        if l1.contains_key(namespace) {
            Ok(())
        } else {
            Err(NephroError::NotFound {
                entity: "cache namespace".into(),
                id: namespace.to_string(),
                suggestion: format!("Known namespaces: {}", CACHE_NAMESPACES.join(", ")),
            })
        }
    }

    /// Raw read path. `Ok(None)` is a miss; unknown namespaces are an
    /// error, distinct from known-but-empty.
    pub fn get_raw(&self, namespace: &str, key: &str) -> Result<Option<String>, NephroError> {
        {
            let mut l1 = self
                .l1
                .lock()
                .map_err(|_| NephroError::Cache("cache mutex poisoned".into()))?;
            let ns = l1.get_mut(namespace).ok_or_else(|| NephroError::NotFound {
                entity: "cache namespace".into(),
                id: namespace.to_string(),
                suggestion: format!("Known namespaces: {}", CACHE_NAMESPACES.join(", ")),
            })?;
            match ns.entries.get(key) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Ok(Some(entry.value.clone()));
                }
                Some(_) => {
                    // TTL check on read: drop the stale entry.
                    ns.entries.pop(key);
                }
                None => {}
            }
        }

        // L2 hit repopulates L1.
        match self.store.cache_get(namespace, key) {
            Ok(Some(value)) => {
                self.populate_l1(namespace, key, &value, None);
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                warn!(namespace, error = %err, "L2 cache read failed; treating as miss");
                Ok(None)
            }
        }
    }

    /// Write-through to both tiers with the namespace's configured TTL.
    pub fn put_raw(&self, namespace: &str, key: &str, value: &str) -> Result<(), NephroError> {
        self.put_raw_with_ttl(namespace, key, value, None)
    }

    /// Write-through with an explicit TTL overriding the namespace
    /// default (the id-restoration and enrichment paths use this).
    pub fn put_raw_with_ttl(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), NephroError> {
        self.check_registered(namespace)?;
        let ttl = self.populate_l1(namespace, key, value, ttl);
        if let Err(err) = self
            .store
            .cache_put(namespace, key, value, ttl.as_secs())
        {
            warn!(namespace, error = %err, "L2 cache write failed; L1 entry retained");
        }
        Ok(())
    }

    fn populate_l1(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Duration {
        let mut l1 = match self.l1.lock() {
            Ok(guard) => guard,
            Err(_) => return Duration::from_secs(0),
        };
        if let Some(ns) = l1.get_mut(namespace) {
            let ttl = ttl.unwrap_or(ns.ttl);
            ns.entries.put(
                key.to_string(),
                L1Entry {
                    value: value.to_string(),
                    expires_at: Instant::now() + ttl,
                },
            );
            ttl
        } else {
            Duration::from_secs(0)
        }
    }

    /// Typed read: deserializes a hit, treats decode failures as misses.
    pub fn get_json<T: DeserializeOwned>(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<T>, NephroError> {
        match self.get_raw(namespace, key)? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(value) => Ok(Some(value)),
                Err(err) => {
                    debug!(namespace, error = %err, "cached payload failed to decode; miss");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    pub fn put_json<T: Serialize>(
        &self,
        namespace: &str,
        key: &str,
        value: &T,
    ) -> Result<(), NephroError> {
        let raw = serde_json::to_string(value)
            .map_err(|err| NephroError::Cache(format!("cache encoding: {err}")))?;
        self.put_raw(namespace, key, &raw)
    }

    pub fn put_json_with_ttl<T: Serialize>(
        &self,
        namespace: &str,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), NephroError> {
        let raw = serde_json::to_string(value)
            .map_err(|err| NephroError::Cache(format!("cache encoding: {err}")))?;
        self.put_raw_with_ttl(namespace, key, &raw, Some(ttl))
    }

    // ── Dependency-driven invalidation ──────────────────────────────────

    /// Purges every namespace registered as depending on `table`.
    /// Synchronous with the triggering write: once this returns, reads
    /// observe the invalidation.
    pub fn invalidate_for_table(&self, table: &str) -> Result<Vec<&'static str>, NephroError> {
        let mut purged = Vec::new();
        for (view, tables, namespaces) in DEPENDENCIES {
            if tables.contains(&table) {
                for namespace in *namespaces {
                    self.purge_namespace(namespace)?;
                    debug!(view, table, namespace, "dependency invalidation");
                    purged.push(*namespace);
                }
            }
        }
        Ok(purged)
    }

    // ── Admin surface ───────────────────────────────────────────────────

    pub fn stats(&self, namespace: &str) -> Result<NamespaceStats, NephroError> {
        self.check_registered(namespace)?;
        self.store.cache_namespace_stats(namespace)
    }

    pub fn purge_namespace(&self, namespace: &str) -> Result<u64, NephroError> {
        self.check_registered(namespace)?;
        {
            let mut l1 = self
                .l1
                .lock()
                .map_err(|_| NephroError::Cache("cache mutex poisoned".into()))?;
            if let Some(ns) = l1.get_mut(namespace) {
                ns.entries.clear();
            }
        }
        self.store.cache_purge_namespace(namespace)
    }

    pub fn purge_key(&self, namespace: &str, key: &str) -> Result<u64, NephroError> {
        self.check_registered(namespace)?;
        {
            let mut l1 = self
                .l1
                .lock()
                .map_err(|_| NephroError::Cache("cache mutex poisoned".into()))?;
            if let Some(ns) = l1.get_mut(namespace) {
                ns.entries.pop(key);
            }
        }
        self.store.cache_purge_key(namespace, key)
    }

    pub fn purge_all(&self) -> Result<u64, NephroError> {
        {
            let mut l1 = self
                .l1
                .lock()
                .map_err(|_| NephroError::Cache("cache mutex poisoned".into()))?;
            for ns in l1.values_mut() {
                ns.entries.clear();
            }
        }
        self.store.cache_purge_all()
    }

    /// Registered namespaces, for the admin health listing.
    pub fn health(&self) -> Vec<String> {
        let mut names: Vec<String> = CACHE_NAMESPACES.iter().map(|s| (*s).to_string()).collect();
        names.sort();
        names
    }

    /// TTL sweep over the durable tier.
    pub fn sweep_expired(&self) -> Result<u64, NephroError> {
        self.store.cache_sweep_expired()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn manager() -> CacheManager {
        let store = Arc::new(Store::open_in_memory().unwrap());
        CacheManager::new(store, &AppConfig::default())
    }

    #[test]
    fn miss_then_write_then_hit() {
        let cache = manager();
        assert_eq!(cache.get_raw("hgnc", "k").unwrap(), None);
        cache.put_raw("hgnc", "k", "value").unwrap();
        assert_eq!(cache.get_raw("hgnc", "k").unwrap().as_deref(), Some("value"));
    }

    #[test]
    fn l2_survives_l1_eviction() {
        let cache = manager();
        cache.put_raw("hpo", "k", "v").unwrap();
        // Clear only L1; the durable tier must repopulate it.
        cache
            .l1
            .lock()
            .unwrap()
            .get_mut("hpo")
            .unwrap()
            .entries
            .clear();
        assert_eq!(cache.get_raw("hpo", "k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn unknown_namespace_is_not_found_not_empty() {
        let cache = manager();
        let err = cache.stats("bogus").unwrap_err();
        assert!(matches!(err, NephroError::NotFound { .. }));

        // Known-but-empty returns zeros.
        let stats = cache.stats("clingen").unwrap();
        assert_eq!(stats.total_entries, 0);
        assert_eq!(stats.active_entries, 0);
    }

    #[test]
    fn every_registered_namespace_reports_zeros_when_fresh() {
        let cache = manager();
        for namespace in CACHE_NAMESPACES {
            let stats = cache.stats(namespace).unwrap();
            assert_eq!(stats.total_entries, 0, "{namespace}");
        }
    }

    #[test]
    fn annotation_writes_invalidate_network_namespace() {
        let cache = manager();
        cache.put_raw("network_analysis", "build-key", "graph").unwrap();
        let purged = cache.invalidate_for_table("gene_annotations").unwrap();
        assert_eq!(purged, vec!["network_analysis"]);
        assert_eq!(cache.get_raw("network_analysis", "build-key").unwrap(), None);
    }

    #[test]
    fn evidence_writes_invalidate_annotations_namespace() {
        let cache = manager();
        cache.put_raw("annotations", "scores", "payload").unwrap();
        cache.invalidate_for_table("gene_evidence").unwrap();
        assert_eq!(cache.get_raw("annotations", "scores").unwrap(), None);

        // Unrelated tables purge nothing.
        cache.put_raw("annotations", "scores", "payload").unwrap();
        assert!(cache.invalidate_for_table("genes").unwrap().is_empty());
        assert!(cache.get_raw("annotations", "scores").unwrap().is_some());
    }

    #[test]
    fn typed_round_trip_and_json_keying() {
        let cache = manager();
        let key = hashed_key(&vec![3, 1, 2]);
        cache
            .put_json("network_analysis", &key, &vec!["a", "b"])
            .unwrap();
        let back: Option<Vec<String>> = cache.get_json("network_analysis", &key).unwrap();
        assert_eq!(back, Some(vec!["a".to_string(), "b".to_string()]));
    }
}
