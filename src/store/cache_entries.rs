use rusqlite::{OptionalExtension, params};

use crate::error::NephroError;
use crate::store::{Store, now_epoch};

/// Aggregate counters for one cache namespace. All zeros for a
/// registered-but-empty namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct NamespaceStats {
    pub total_entries: u64,
    pub active_entries: u64,
    pub expired_entries: u64,
    pub total_accesses: u64,
    pub size_bytes: u64,
}

impl Store {
    /// L2 read. Expired entries are treated as misses; hits bump the
    /// access counters.
    pub fn cache_get(
        &self,
        namespace: &str,
        hashed_key: &str,
    ) -> Result<Option<String>, NephroError> {
        self.with("cache_get", |conn| {
            let now = now_epoch();
            let value: Option<String> = conn
                .query_row(
                    "SELECT value FROM cache_entries
                     WHERE namespace = ?1 AND hashed_key = ?2 AND expires_at > ?3",
                    params![namespace, hashed_key, now],
                    |row| row.get(0),
                )
                .optional()?;
            if value.is_some() {
                conn.execute(
                    "UPDATE cache_entries
                     SET access_count = access_count + 1, last_accessed_at = ?3
                     WHERE namespace = ?1 AND hashed_key = ?2",
                    params![namespace, hashed_key, now],
                )?;
            }
            Ok(value)
        })
    }

    pub fn cache_put(
        &self,
        namespace: &str,
        hashed_key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<(), NephroError> {
        self.with("cache_put", |conn| {
            let now = now_epoch();
            conn.execute(
                "INSERT INTO cache_entries
                     (namespace, hashed_key, value, created_at, expires_at, access_count, size_bytes)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)
                 ON CONFLICT(namespace, hashed_key) DO UPDATE SET
                     value = excluded.value,
                     created_at = excluded.created_at,
                     expires_at = excluded.expires_at,
                     size_bytes = excluded.size_bytes",
                params![
                    namespace,
                    hashed_key,
                    value,
                    now,
                    now + ttl_seconds as i64,
                    value.len() as i64
                ],
            )?;
            Ok(())
        })
    }

    pub fn cache_purge_namespace(&self, namespace: &str) -> Result<u64, NephroError> {
        self.with("cache_purge_namespace", |conn| {
            Ok(conn.execute(
                "DELETE FROM cache_entries WHERE namespace = ?1",
                [namespace],
            )? as u64)
        })
    }

    pub fn cache_purge_key(&self, namespace: &str, hashed_key: &str) -> Result<u64, NephroError> {
        self.with("cache_purge_key", |conn| {
            Ok(conn.execute(
                "DELETE FROM cache_entries WHERE namespace = ?1 AND hashed_key = ?2",
                params![namespace, hashed_key],
            )? as u64)
        })
    }

    pub fn cache_purge_all(&self) -> Result<u64, NephroError> {
        self.with("cache_purge_all", |conn| {
            Ok(conn.execute("DELETE FROM cache_entries", [])? as u64)
        })
    }

    /// Periodic sweep removing entries past expiry.
    pub fn cache_sweep_expired(&self) -> Result<u64, NephroError> {
        self.with("cache_sweep_expired", |conn| {
            Ok(conn.execute(
                "DELETE FROM cache_entries WHERE expires_at <= ?1",
                [now_epoch()],
            )? as u64)
        })
    }

    pub fn cache_namespace_stats(&self, namespace: &str) -> Result<NamespaceStats, NephroError> {
        self.with("cache_namespace_stats", |conn| {
            let now = now_epoch();
            let stats = conn.query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(CASE WHEN expires_at > ?2 THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN expires_at <= ?2 THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(access_count), 0),
                        COALESCE(SUM(size_bytes), 0)
                 FROM cache_entries WHERE namespace = ?1",
                params![namespace, now],
                |row| {
                    Ok(NamespaceStats {
                        total_entries: row.get(0)?,
                        active_entries: row.get(1)?,
                        expired_entries: row.get(2)?,
                        total_accesses: row.get(3)?,
                        size_bytes: row.get(4)?,
                    })
                },
            )?;
            Ok(stats)
        })
    }
}
