use rusqlite::{OptionalExtension, params};

use crate::entities::{Gene, StagingRecord, StagingStatus};
use crate::error::NephroError;
use crate::sources::hgnc::HgncRecord;
use crate::store::{Store, epoch_to_datetime, now_epoch};

const HGNC_SNAPSHOT_HASH_KEY: &str = "hgnc_snapshot_hash";

fn row_to_gene(row: &rusqlite::Row<'_>) -> rusqlite::Result<Gene> {
    let aliases: String = row.get(3)?;
    let previous: String = row.get(4)?;
    Ok(Gene {
        id: row.get(0)?,
        hgnc_id: row.get(1)?,
        approved_symbol: row.get(2)?,
        aliases: serde_json::from_str(&aliases).unwrap_or_default(),
        previous_symbols: serde_json::from_str(&previous).unwrap_or_default(),
        created_at: epoch_to_datetime(row.get(5)?),
        updated_at: epoch_to_datetime(row.get(6)?),
    })
}

const GENE_COLUMNS: &str =
    "id, hgnc_id, approved_symbol, aliases, previous_symbols, created_at, updated_at";

impl Store {
    pub fn gene_by_id(&self, id: i64) -> Result<Option<Gene>, NephroError> {
        self.with("gene_by_id", |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {GENE_COLUMNS} FROM genes WHERE id = ?1"),
                    [id],
                    row_to_gene,
                )
                .optional()?)
        })
    }

    pub fn gene_by_hgnc_id(&self, hgnc_id: &str) -> Result<Option<Gene>, NephroError> {
        self.with("gene_by_hgnc_id", |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {GENE_COLUMNS} FROM genes WHERE hgnc_id = ?1"),
                    [hgnc_id],
                    row_to_gene,
                )
                .optional()?)
        })
    }

    pub fn gene_by_symbol(&self, symbol: &str) -> Result<Option<Gene>, NephroError> {
        self.with("gene_by_symbol", |conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {GENE_COLUMNS} FROM genes WHERE UPPER(approved_symbol) = UPPER(?1)"
                    ),
                    [symbol],
                    row_to_gene,
                )
                .optional()?)
        })
    }

    /// Loads every gene row; the normalizer builds its in-memory lookup
    /// from this.
    pub fn all_genes(&self) -> Result<Vec<Gene>, NephroError> {
        self.with("all_genes", |conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {GENE_COLUMNS} FROM genes ORDER BY id"))?;
            let rows = stmt.query_map([], row_to_gene)?;
            let mut genes = Vec::new();
            for gene in rows {
                genes.push(gene?);
            }
            Ok(genes)
        })
    }

    /// Gene id → withdrawn flag, for the normalizer's index build.
    pub fn withdrawn_flags(&self) -> Result<std::collections::HashMap<i64, bool>, NephroError> {
        self.with("withdrawn_flags", |conn| {
            let mut stmt = conn.prepare("SELECT id, withdrawn FROM genes")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)? != 0))
            })?;
            let mut flags = std::collections::HashMap::new();
            for row in rows {
                let (id, withdrawn) = row?;
                flags.insert(id, withdrawn);
            }
            Ok(flags)
        })
    }

    pub fn gene_count(&self) -> Result<u64, NephroError> {
        self.with("gene_count", |conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM genes", [], |row| row.get(0))?)
        })
    }

    /// Creates or refreshes one canonical gene row. Alias sets are
    /// replaced wholesale. Returns the gene id.
    pub fn upsert_gene(&self, record: &HgncRecord) -> Result<i64, NephroError> {
        self.with("upsert_gene", |conn| upsert_gene_on(conn, record))
    }

    /// Applies a full HGNC snapshot in one transaction: upsert every
    /// approved record, replace alias sets, and flag genes missing from
    /// the snapshot as withdrawn. A snapshot whose content hash matches
    /// the previously applied one performs zero row mutations.
    ///
    /// Returns `(created, updated)` counts, or `None` when the snapshot
    /// was unchanged.
    pub fn apply_hgnc_snapshot(
        &self,
        records: &[HgncRecord],
        content_hash: &str,
    ) -> Result<Option<(u64, u64)>, NephroError> {
        if self.meta_get(HGNC_SNAPSHOT_HASH_KEY)?.as_deref() == Some(content_hash) {
            return Ok(None);
        }

        let counts = self.with_tx("apply_hgnc_snapshot", |tx| {
            let mut created = 0u64;
            let mut updated = 0u64;
            for record in records {
                let existed: bool = tx
                    .query_row(
                        "SELECT 1 FROM genes WHERE hgnc_id = ?1",
                        [&record.hgnc_id],
                        |_| Ok(true),
                    )
                    .optional()?
                    .unwrap_or(false);
                upsert_gene_on(tx, record)?;
                if existed {
                    updated += 1;
                } else {
                    created += 1;
                }
            }

            // Genes absent from the current snapshot are withdrawn, not
            // deleted: evidence may still reference them. A temp table
            // keeps this under the bound-parameter limit at HGNC scale.
            tx.execute_batch(
                "CREATE TEMP TABLE IF NOT EXISTS snapshot_ids (hgnc_id TEXT PRIMARY KEY);
                 DELETE FROM snapshot_ids;",
            )?;
            {
                let mut insert =
                    tx.prepare("INSERT OR IGNORE INTO snapshot_ids (hgnc_id) VALUES (?1)")?;
                for record in records {
                    insert.execute([&record.hgnc_id])?;
                }
            }
            tx.execute(
                "UPDATE genes SET withdrawn = 1, updated_at = ?1
                 WHERE hgnc_id NOT IN (SELECT hgnc_id FROM snapshot_ids)",
                [now_epoch()],
            )?;
            tx.execute_batch("DROP TABLE snapshot_ids;")?;
            Ok((created, updated))
        })?;

        self.meta_set(HGNC_SNAPSHOT_HASH_KEY, content_hash)?;
        Ok(Some(counts))
    }

    // ── Normalization staging ───────────────────────────────────────────

    /// Records an identifier that could not be resolved. Repeated
    /// encounters bump the attempt counter instead of duplicating rows.
    pub fn stage_identifier(&self, raw: &str, source: &str) -> Result<(), NephroError> {
        self.with("stage_identifier", |conn| {
            let now = now_epoch();
            conn.execute(
                "INSERT INTO gene_normalization_staging
                     (raw_identifier, raw_source, status, attempts, created_at, updated_at)
                 VALUES (?1, ?2, 'pending', 1, ?3, ?3)
                 ON CONFLICT(raw_identifier, raw_source) DO UPDATE SET
                     attempts = attempts + 1,
                     updated_at = excluded.updated_at",
                params![raw, source, now],
            )?;
            Ok(())
        })
    }

    pub fn staging_by_status(
        &self,
        status: StagingStatus,
    ) -> Result<Vec<StagingRecord>, NephroError> {
        self.with("staging_by_status", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, raw_identifier, raw_source, status, normalized_gene_id,
                        attempts, created_at, updated_at
                 FROM gene_normalization_staging WHERE status = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map([status.as_str()], |row| {
                let status: String = row.get(3)?;
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    status,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, u32>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                ))
            })?;
            let mut records = Vec::new();
            for row in rows {
                let (id, raw_identifier, raw_source, status, gene_id, attempts, created, updated) =
                    row?;
                records.push(StagingRecord {
                    id,
                    raw_identifier,
                    raw_source,
                    status: StagingStatus::from_str(&status)?,
                    normalized_gene_id: gene_id,
                    attempts,
                    created_at: epoch_to_datetime(created),
                    updated_at: epoch_to_datetime(updated),
                });
            }
            Ok(records)
        })
    }

    pub fn resolve_staging(&self, staging_id: i64, gene_id: i64) -> Result<(), NephroError> {
        self.with("resolve_staging", |conn| {
            conn.execute(
                "UPDATE gene_normalization_staging
                 SET status = 'resolved', normalized_gene_id = ?2, updated_at = ?3
                 WHERE id = ?1",
                params![staging_id, gene_id, now_epoch()],
            )?;
            Ok(())
        })
    }

    pub fn mark_staging_unresolvable(&self, staging_id: i64) -> Result<(), NephroError> {
        self.with("mark_staging_unresolvable", |conn| {
            conn.execute(
                "UPDATE gene_normalization_staging
                 SET status = 'unresolvable', updated_at = ?2
                 WHERE id = ?1",
                params![staging_id, now_epoch()],
            )?;
            Ok(())
        })
    }
}

fn upsert_gene_on(conn: &rusqlite::Connection, record: &HgncRecord) -> Result<i64, NephroError> {
    let now = now_epoch();
    let aliases = serde_json::to_string(&record.aliases)
        .map_err(|err| NephroError::Constraint(format!("alias encoding: {err}")))?;
    let previous = serde_json::to_string(&record.previous_symbols)
        .map_err(|err| NephroError::Constraint(format!("alias encoding: {err}")))?;
    conn.execute(
        "INSERT INTO genes
             (hgnc_id, approved_symbol, aliases, previous_symbols, withdrawn, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)
         ON CONFLICT(hgnc_id) DO UPDATE SET
             approved_symbol = excluded.approved_symbol,
             aliases = excluded.aliases,
             previous_symbols = excluded.previous_symbols,
             withdrawn = 0,
             updated_at = excluded.updated_at",
        params![
            record.hgnc_id,
            record.approved_symbol,
            aliases,
            previous,
            now
        ],
    )?;
    let id: i64 = conn.query_row(
        "SELECT id FROM genes WHERE hgnc_id = ?1",
        [&record.hgnc_id],
        |row| row.get(0),
    )?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use crate::entities::StagingStatus;
    use crate::sources::hgnc::HgncRecord;
    use crate::store::Store;

    fn pkd1() -> HgncRecord {
        HgncRecord {
            hgnc_id: "HGNC:9008".into(),
            approved_symbol: "PKD1".into(),
            name: "polycystin 1".into(),
            aliases: vec!["PBP".into()],
            previous_symbols: vec![],
            ensembl_gene_id: Some("ENSG00000008710".into()),
        }
    }

    #[test]
    fn upsert_is_idempotent_on_hgnc_id() {
        let store = Store::open_in_memory().unwrap();
        let first = store.upsert_gene(&pkd1()).unwrap();
        let second = store.upsert_gene(&pkd1()).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.gene_count().unwrap(), 1);
    }

    #[test]
    fn snapshot_reapply_with_same_hash_is_a_noop() {
        let store = Store::open_in_memory().unwrap();
        let records = vec![pkd1()];
        let applied = store.apply_hgnc_snapshot(&records, "hash-a").unwrap();
        assert_eq!(applied, Some((1, 0)));

        let reapplied = store.apply_hgnc_snapshot(&records, "hash-a").unwrap();
        assert_eq!(reapplied, None);

        let changed = store.apply_hgnc_snapshot(&records, "hash-b").unwrap();
        assert_eq!(changed, Some((0, 1)));
    }

    #[test]
    fn symbol_lookup_is_case_insensitive() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_gene(&pkd1()).unwrap();
        assert!(store.gene_by_symbol("pkd1").unwrap().is_some());
        assert!(store.gene_by_symbol("PKD1").unwrap().is_some());
        assert!(store.gene_by_symbol("PKD2").unwrap().is_none());
    }

    #[test]
    fn staging_deduplicates_and_counts_attempts() {
        let store = Store::open_in_memory().unwrap();
        store.stage_identifier("FAKE1", "panelapp").unwrap();
        store.stage_identifier("FAKE1", "panelapp").unwrap();
        store.stage_identifier("FAKE1", "gencc").unwrap();

        let pending = store.staging_by_status(StagingStatus::Pending).unwrap();
        assert_eq!(pending.len(), 2);
        let panelapp_row = pending
            .iter()
            .find(|r| r.raw_source == "panelapp")
            .unwrap();
        assert_eq!(panelapp_row.attempts, 2);
    }
}
