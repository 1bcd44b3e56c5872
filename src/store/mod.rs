use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

use rusqlite::Connection;
use tracing::warn;

use crate::error::NephroError;

pub mod cache_entries;
pub mod evidence;
pub mod genes;
pub mod progress;
pub mod scores;

const SCHEMA_VERSION: i64 = 1;
const BUSY_TIMEOUT_MS: u64 = 5_000;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    key         TEXT PRIMARY KEY,
    value       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS genes (
    id               INTEGER PRIMARY KEY,
    hgnc_id          TEXT NOT NULL UNIQUE,
    approved_symbol  TEXT NOT NULL UNIQUE,
    aliases          TEXT NOT NULL DEFAULT '[]',
    previous_symbols TEXT NOT NULL DEFAULT '[]',
    withdrawn        INTEGER NOT NULL DEFAULT 0,
    created_at       INTEGER NOT NULL,
    updated_at       INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_genes_symbol_upper ON genes (UPPER(approved_symbol));

CREATE TABLE IF NOT EXISTS gene_evidence (
    id            INTEGER PRIMARY KEY,
    gene_id       INTEGER NOT NULL REFERENCES genes(id),
    source_name   TEXT NOT NULL,
    evidence_data TEXT NOT NULL,
    version       TEXT NOT NULL DEFAULT '',
    created_at    INTEGER NOT NULL,
    updated_at    INTEGER NOT NULL,
    UNIQUE (gene_id, source_name, version)
);
CREATE INDEX IF NOT EXISTS idx_evidence_source ON gene_evidence (source_name);
CREATE INDEX IF NOT EXISTS idx_evidence_gene ON gene_evidence (gene_id);

CREATE TABLE IF NOT EXISTS gene_annotations (
    id            INTEGER PRIMARY KEY,
    gene_id       INTEGER NOT NULL REFERENCES genes(id),
    source_name   TEXT NOT NULL,
    annotation    TEXT NOT NULL,
    created_at    INTEGER NOT NULL,
    updated_at    INTEGER NOT NULL,
    UNIQUE (gene_id, source_name)
);
CREATE INDEX IF NOT EXISTS idx_annotations_source ON gene_annotations (source_name);

CREATE TABLE IF NOT EXISTS gene_normalization_staging (
    id                 INTEGER PRIMARY KEY,
    raw_identifier     TEXT NOT NULL,
    raw_source         TEXT NOT NULL,
    status             TEXT NOT NULL DEFAULT 'pending',
    normalized_gene_id INTEGER REFERENCES genes(id),
    attempts           INTEGER NOT NULL DEFAULT 0,
    created_at         INTEGER NOT NULL,
    updated_at         INTEGER NOT NULL,
    UNIQUE (raw_identifier, raw_source)
);

CREATE TABLE IF NOT EXISTS data_source_progress (
    source_name       TEXT PRIMARY KEY,
    status            TEXT NOT NULL DEFAULT 'idle',
    current_page      INTEGER NOT NULL DEFAULT 0,
    total_pages       INTEGER,
    items_processed   INTEGER NOT NULL DEFAULT 0,
    started_at        INTEGER,
    last_heartbeat_at INTEGER,
    error_info        TEXT
);

CREATE TABLE IF NOT EXISTS cache_entries (
    namespace        TEXT NOT NULL,
    hashed_key       TEXT NOT NULL,
    value            TEXT NOT NULL,
    created_at       INTEGER NOT NULL,
    expires_at       INTEGER NOT NULL,
    access_count     INTEGER NOT NULL DEFAULT 0,
    last_accessed_at INTEGER,
    size_bytes       INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (namespace, hashed_key)
);
CREATE INDEX IF NOT EXISTS idx_cache_expiry ON cache_entries (expires_at);

CREATE TABLE IF NOT EXISTS gene_scores (
    gene_id          INTEGER PRIMARY KEY REFERENCES genes(id),
    percentage_score REAL NOT NULL,
    source_count     INTEGER NOT NULL,
    evidence_tier    TEXT NOT NULL,
    source_scores    TEXT NOT NULL DEFAULT '{}',
    refreshed_at     INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_scores_tier ON gene_scores (evidence_tier);
CREATE INDEX IF NOT EXISTS idx_scores_score ON gene_scores (percentage_score);

CREATE TABLE IF NOT EXISTS audit_log (
    id         INTEGER PRIMARY KEY,
    action     TEXT NOT NULL,
    detail     TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL
);
"#;

/// Durable store: genes, evidence, annotations, staging, progress, the
/// L2 cache tier, and the materialized score projection.
///
/// Single embedded SQLite database in WAL mode. Access is serialized
/// through one connection; every call site goes through [`Store::with`]
/// so slow statements get logged with their label, never their values.
pub struct Store {
    conn: Mutex<Connection>,
    slow_query_ms: u64,
}

impl Store {
    pub fn open(path: &Path, slow_query_ms: u64) -> Result<Self, NephroError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn, slow_query_ms)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self, NephroError> {
        Self::init(Connection::open_in_memory()?, 100)
    }

    fn init(conn: Connection, slow_query_ms: u64) -> Result<Self, NephroError> {
        // journal_mode returns the resulting mode as a row; in-memory
        // databases stay on "memory", which is fine for tests.
        let _mode: String =
            conn.query_row("PRAGMA journal_mode = wal", [], |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "normal")?;
        conn.pragma_update(None, "foreign_keys", "on")?;
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
        conn.execute_batch(SCHEMA)?;
        conn.execute(
            "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [SCHEMA_VERSION.to_string()],
        )?;
        Ok(Store {
            conn: Mutex::new(conn),
            slow_query_ms,
        })
    }

    /// Runs `f` against the connection, timing it. Statements slower than
    /// the configured threshold are logged at warning with the label only
    /// (the parameter shape, not values).
    pub(crate) fn with<T>(
        &self,
        label: &str,
        f: impl FnOnce(&Connection) -> Result<T, NephroError>,
    ) -> Result<T, NephroError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| NephroError::Cache("store mutex poisoned".to_string()))?;
        let start = Instant::now();
        let result = f(&conn);
        let elapsed_ms = start.elapsed().as_millis() as u64;
        if elapsed_ms > self.slow_query_ms {
            warn!(query = label, elapsed_ms, "slow query");
        }
        result
    }

    /// Same as [`Store::with`] but with a mutable connection for
    /// explicit transactions.
    pub(crate) fn with_tx<T>(
        &self,
        label: &str,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T, NephroError>,
    ) -> Result<T, NephroError> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| NephroError::Cache("store mutex poisoned".to_string()))?;
        let start = Instant::now();
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let result = f(&tx);
        let result = match result {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                // Transaction dropped here rolls back; the connection is
                // clean for the next caller.
                Err(err)
            }
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;
        if elapsed_ms > self.slow_query_ms {
            warn!(query = label, elapsed_ms, "slow transaction");
        }
        result
    }

    pub fn meta_get(&self, key: &str) -> Result<Option<String>, NephroError> {
        self.with("meta_get", |conn| {
            use rusqlite::OptionalExtension;
            Ok(conn
                .query_row("SELECT value FROM meta WHERE key = ?1", [key], |row| {
                    row.get(0)
                })
                .optional()?)
        })
    }

    pub fn meta_set(&self, key: &str, value: &str) -> Result<(), NephroError> {
        self.with("meta_set", |conn| {
            conn.execute(
                "INSERT INTO meta (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                [key, value],
            )?;
            Ok(())
        })
    }

    pub fn record_audit(&self, action: &str, detail: &str) -> Result<(), NephroError> {
        self.with("record_audit", |conn| {
            conn.execute(
                "INSERT INTO audit_log (action, detail, created_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![action, detail, now_epoch()],
            )?;
            Ok(())
        })
    }
}

pub(crate) fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

pub(crate) fn epoch_to_datetime(epoch: i64) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp(epoch, 0).unwrap_or_else(chrono::Utc::now)
}

#[cfg(test)]
mod tests {
    use super::Store;

    #[test]
    fn schema_initializes_and_meta_round_trips() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.meta_get("schema_version").unwrap().as_deref(), Some("1"));
        assert_eq!(store.meta_get("missing").unwrap(), None);

        store.meta_set("hgnc_snapshot_hash", "abc123").unwrap();
        store.meta_set("hgnc_snapshot_hash", "def456").unwrap();
        assert_eq!(
            store.meta_get("hgnc_snapshot_hash").unwrap().as_deref(),
            Some("def456")
        );
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("db.sqlite3");
        let store = Store::open(&path, 100).unwrap();
        store.record_audit("test", "open").unwrap();
        assert!(path.exists());
    }
}
