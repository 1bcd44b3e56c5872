use std::collections::HashSet;

use rusqlite::{OptionalExtension, params};

use crate::entities::SourceName;
use crate::entities::evidence::{EvidenceData, GeneEvidence};
use crate::error::NephroError;
use crate::store::{Store, epoch_to_datetime, now_epoch};

/// PMID membership checks run in chunks of this size so the full PMID
/// set never has to be loaded into memory.
pub const PMID_LOOKUP_BATCH: usize = 100;

/// Outcome of an evidence write, reported back through upload summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    Merged,
}

impl Store {
    /// Replaces the current evidence row for `(gene, source)` in a single
    /// transaction. The old row, regardless of version, is superseded.
    pub fn replace_evidence(
        &self,
        gene_id: i64,
        data: &EvidenceData,
        version: Option<&str>,
    ) -> Result<WriteOutcome, NephroError> {
        let source = data.source_name();
        let payload = encode_evidence(data)?;
        self.with_tx("replace_evidence", |tx| {
            replace_evidence_on(tx, gene_id, source, &payload, version)
        })
    }

    /// Replaces evidence rows for many genes under one transaction per
    /// `transaction_size` records. Used by streaming ingestion so long
    /// runs never hold a single open transaction.
    pub fn replace_evidence_chunk(
        &self,
        rows: &[(i64, EvidenceData)],
        version: Option<&str>,
    ) -> Result<(u64, u64), NephroError> {
        let mut encoded = Vec::with_capacity(rows.len());
        for (gene_id, data) in rows {
            encoded.push((*gene_id, data.source_name(), encode_evidence(data)?));
        }
        self.with_tx("replace_evidence_chunk", |tx| {
            let mut created = 0u64;
            let mut merged = 0u64;
            for (gene_id, source, payload) in &encoded {
                match replace_evidence_on(tx, *gene_id, *source, payload, version)? {
                    WriteOutcome::Created => created += 1,
                    WriteOutcome::Merged => merged += 1,
                }
            }
            Ok((created, merged))
        })
    }

    /// Deletes every evidence row for a source. Full-refresh mode runs
    /// this as its own transaction before streaming inserts.
    pub fn purge_source_evidence(&self, source: SourceName) -> Result<u64, NephroError> {
        self.with_tx("purge_source_evidence", |tx| {
            let evidence = tx.execute(
                "DELETE FROM gene_evidence WHERE source_name = ?1",
                [source.as_str()],
            )?;
            let annotations = tx.execute(
                "DELETE FROM gene_annotations WHERE source_name = ?1",
                [source.as_str()],
            )?;
            Ok((evidence + annotations) as u64)
        })
    }

    pub fn evidence_for_gene(&self, gene_id: i64) -> Result<Vec<GeneEvidence>, NephroError> {
        self.with("evidence_for_gene", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, gene_id, source_name, evidence_data, version, created_at, updated_at
                 FROM gene_evidence WHERE gene_id = ?1 ORDER BY source_name",
            )?;
            let rows = stmt.query_map([gene_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (id, gene_id, payload, version, created, updated) = row?;
                let data = decode_evidence(&payload)?;
                out.push(GeneEvidence {
                    id,
                    gene_id,
                    source_name: data.source_name(),
                    evidence_data: data,
                    version: if version.is_empty() {
                        None
                    } else {
                        Some(version)
                    },
                    created_at: epoch_to_datetime(created),
                    updated_at: epoch_to_datetime(updated),
                });
            }
            Ok(out)
        })
    }

    /// All `(gene_id, payload)` pairs for one source, streamed in id
    /// order. The aggregation engine and the network builder read
    /// through this.
    pub fn evidence_by_source(
        &self,
        source: SourceName,
    ) -> Result<Vec<(i64, EvidenceData)>, NephroError> {
        self.with("evidence_by_source", |conn| {
            let mut stmt = conn.prepare(
                "SELECT gene_id, evidence_data FROM gene_evidence
                 WHERE source_name = ?1 ORDER BY gene_id",
            )?;
            let rows = stmt.query_map([source.as_str()], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (gene_id, payload) = row?;
                out.push((gene_id, decode_evidence(&payload)?));
            }
            Ok(out)
        })
    }

    /// Every evidence row grouped by gene, for the score refresh.
    pub fn all_evidence(&self) -> Result<Vec<(i64, EvidenceData)>, NephroError> {
        self.with("all_evidence", |conn| {
            let mut stmt = conn.prepare(
                "SELECT gene_id, evidence_data FROM gene_evidence ORDER BY gene_id, source_name",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (gene_id, payload) = row?;
                out.push((gene_id, decode_evidence(&payload)?));
            }
            Ok(out)
        })
    }

    pub fn source_gene_count(&self, source: SourceName) -> Result<u64, NephroError> {
        self.with("source_gene_count", |conn| {
            Ok(conn.query_row(
                "SELECT COUNT(DISTINCT gene_id) FROM gene_evidence WHERE source_name = ?1",
                [source.as_str()],
                |row| row.get(0),
            )?)
        })
    }

    /// Gene ids that have no evidence row for `source` — the work list
    /// for `update_missing` runs.
    pub fn genes_missing_source(&self, source: SourceName) -> Result<Vec<i64>, NephroError> {
        self.with("genes_missing_source", |conn| {
            let mut stmt = conn.prepare(
                "SELECT g.id FROM genes g
                 WHERE g.withdrawn = 0
                   AND NOT EXISTS (
                       SELECT 1 FROM gene_evidence e
                       WHERE e.gene_id = g.id AND e.source_name = ?1
                   )
                 ORDER BY g.id",
            )?;
            let rows = stmt.query_map([source.as_str()], |row| row.get(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Which of `candidates` are already present in persisted PubTator
    /// evidence. Looked up in batches of [`PMID_LOOKUP_BATCH`] via the
    /// JSON pmids array, so memory stays flat no matter how large the
    /// stored set is.
    pub fn existing_pmids(&self, candidates: &[String]) -> Result<HashSet<String>, NephroError> {
        let mut found = HashSet::new();
        for chunk in candidates.chunks(PMID_LOOKUP_BATCH) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!(
                "SELECT DISTINCT pmids.value
                 FROM gene_evidence ge, json_each(ge.evidence_data, '$.pmids') pmids
                 WHERE ge.source_name = 'pubtator' AND pmids.value IN ({placeholders})"
            );
            self.with("existing_pmids", |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows =
                    stmt.query_map(rusqlite::params_from_iter(chunk.iter()), |row| {
                        row.get::<_, String>(0)
                    })?;
                for row in rows {
                    found.insert(row?);
                }
                Ok(())
            })?;
        }
        Ok(found)
    }

    // ── Annotations (heavy per-source payloads) ─────────────────────────

    /// Upserts the annotation payload for `(gene, source)`. Annotations
    /// hold the heavy queryable documents (STRING edge lists, HPO term
    /// arrays) the network engine reads.
    pub fn replace_annotation(
        &self,
        gene_id: i64,
        data: &EvidenceData,
    ) -> Result<(), NephroError> {
        let source = data.source_name();
        let payload = encode_evidence(data)?;
        self.with("replace_annotation", |conn| {
            let now = now_epoch();
            conn.execute(
                "INSERT INTO gene_annotations (gene_id, source_name, annotation, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(gene_id, source_name) DO UPDATE SET
                     annotation = excluded.annotation,
                     updated_at = excluded.updated_at",
                params![gene_id, source.as_str(), payload, now],
            )?;
            Ok(())
        })
    }

    pub fn annotations_by_source(
        &self,
        source: SourceName,
    ) -> Result<Vec<(i64, EvidenceData)>, NephroError> {
        self.with("annotations_by_source", |conn| {
            let mut stmt = conn.prepare(
                "SELECT gene_id, annotation FROM gene_annotations
                 WHERE source_name = ?1 ORDER BY gene_id",
            )?;
            let rows = stmt.query_map([source.as_str()], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (gene_id, payload) = row?;
                out.push((gene_id, decode_evidence(&payload)?));
            }
            Ok(out)
        })
    }

    pub fn annotation_for_gene(
        &self,
        gene_id: i64,
        source: SourceName,
    ) -> Result<Option<EvidenceData>, NephroError> {
        self.with("annotation_for_gene", |conn| {
            let payload: Option<String> = conn
                .query_row(
                    "SELECT annotation FROM gene_annotations
                     WHERE gene_id = ?1 AND source_name = ?2",
                    params![gene_id, source.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            payload.map(|p| decode_evidence(&p)).transpose()
        })
    }
}

fn encode_evidence(data: &EvidenceData) -> Result<String, NephroError> {
    serde_json::to_string(data)
        .map_err(|err| NephroError::Constraint(format!("evidence encoding: {err}")))
}

fn decode_evidence(payload: &str) -> Result<EvidenceData, NephroError> {
    serde_json::from_str(payload)
        .map_err(|err| NephroError::Constraint(format!("evidence decoding: {err}")))
}

fn replace_evidence_on(
    tx: &rusqlite::Transaction<'_>,
    gene_id: i64,
    source: SourceName,
    payload: &str,
    version: Option<&str>,
) -> Result<WriteOutcome, NephroError> {
    let now = now_epoch();
    let removed = tx.execute(
        "DELETE FROM gene_evidence WHERE gene_id = ?1 AND source_name = ?2",
        params![gene_id, source.as_str()],
    )?;
    tx.execute(
        "INSERT INTO gene_evidence
             (gene_id, source_name, evidence_data, version, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        params![gene_id, source.as_str(), payload, version.unwrap_or(""), now],
    )?;
    Ok(if removed > 0 {
        WriteOutcome::Merged
    } else {
        WriteOutcome::Created
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::evidence::{PubTatorEvidence, PublicationMention};
    use crate::sources::hgnc::HgncRecord;

    fn seed_gene(store: &Store, hgnc_id: &str, symbol: &str) -> i64 {
        store
            .upsert_gene(&HgncRecord {
                hgnc_id: hgnc_id.into(),
                approved_symbol: symbol.into(),
                name: String::new(),
                aliases: vec![],
                previous_symbols: vec![],
                ensembl_gene_id: None,
            })
            .unwrap()
    }

    fn pubtator_evidence(pmids: &[&str]) -> EvidenceData {
        EvidenceData::PubTator(PubTatorEvidence {
            pmids: pmids.iter().map(|p| (*p).to_string()).collect(),
            publication_count: pmids.len() as u32,
            total_mentions: pmids.len() as u32,
            mentions: pmids
                .iter()
                .map(|p| PublicationMention {
                    pmid: (*p).to_string(),
                    mention_count: 1,
                })
                .collect(),
        })
    }

    #[test]
    fn replace_keeps_one_current_row_per_gene_source() {
        let store = Store::open_in_memory().unwrap();
        let gene = seed_gene(&store, "HGNC:9008", "PKD1");

        let first = store
            .replace_evidence(gene, &pubtator_evidence(&["1"]), Some("2024-01"))
            .unwrap();
        assert_eq!(first, WriteOutcome::Created);

        let second = store
            .replace_evidence(gene, &pubtator_evidence(&["1", "2"]), Some("2024-02"))
            .unwrap();
        assert_eq!(second, WriteOutcome::Merged);

        let rows = store.evidence_for_gene(gene).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].version.as_deref(), Some("2024-02"));
    }

    #[test]
    fn existing_pmids_finds_only_persisted_ids() {
        let store = Store::open_in_memory().unwrap();
        let gene = seed_gene(&store, "HGNC:9008", "PKD1");
        store
            .replace_evidence(gene, &pubtator_evidence(&["100", "200"]), None)
            .unwrap();

        let candidates: Vec<String> = ["100", "200", "300"]
            .iter()
            .map(|s| (*s).to_string())
            .collect();
        let found = store.existing_pmids(&candidates).unwrap();
        assert!(found.contains("100"));
        assert!(found.contains("200"));
        assert!(!found.contains("300"));
    }

    #[test]
    fn existing_pmids_spans_lookup_batches() {
        let store = Store::open_in_memory().unwrap();
        let gene = seed_gene(&store, "HGNC:9008", "PKD1");
        let pmids: Vec<String> = (0..250).map(|i| format!("{i}")).collect();
        let refs: Vec<&str> = pmids.iter().map(String::as_str).collect();
        store
            .replace_evidence(gene, &pubtator_evidence(&refs), None)
            .unwrap();

        let found = store.existing_pmids(&pmids).unwrap();
        assert_eq!(found.len(), 250);
    }

    #[test]
    fn purge_removes_evidence_and_annotations_for_one_source() {
        let store = Store::open_in_memory().unwrap();
        let gene = seed_gene(&store, "HGNC:9008", "PKD1");
        store
            .replace_evidence(gene, &pubtator_evidence(&["1"]), None)
            .unwrap();
        store
            .replace_annotation(gene, &pubtator_evidence(&["1"]))
            .unwrap();

        let removed = store.purge_source_evidence(SourceName::PubTator).unwrap();
        assert_eq!(removed, 2);
        assert!(store.evidence_for_gene(gene).unwrap().is_empty());
    }

    #[test]
    fn genes_missing_source_lists_unfetched_genes() {
        let store = Store::open_in_memory().unwrap();
        let pkd1 = seed_gene(&store, "HGNC:9008", "PKD1");
        let pkd2 = seed_gene(&store, "HGNC:9009", "PKD2");
        store
            .replace_evidence(pkd1, &pubtator_evidence(&["1"]), None)
            .unwrap();

        let missing = store.genes_missing_source(SourceName::PubTator).unwrap();
        assert_eq!(missing, vec![pkd2]);
    }
}
