use std::collections::BTreeMap;

use rusqlite::{OptionalExtension, params};

use crate::entities::score::{EvidenceTier, GeneScore};
use crate::error::NephroError;
use crate::score::ScoreEngine;
use crate::store::{Store, now_epoch};

impl Store {
    /// Re-materializes the score projection from current evidence rows.
    ///
    /// The whole refresh is one `BEGIN IMMEDIATE` transaction, so
    /// concurrent refresh attempts serialize on the writer lock and the
    /// last one wins with a consistent view. Every gene with at least one
    /// evidence row gets exactly one projection row.
    pub fn refresh_scores(&self, engine: &ScoreEngine) -> Result<u64, NephroError> {
        let evidence = self.all_evidence()?;

        let mut by_gene: BTreeMap<i64, Vec<_>> = BTreeMap::new();
        for (gene_id, data) in evidence {
            by_gene.entry(gene_id).or_default().push(data);
        }

        self.with_tx("refresh_scores", |tx| {
            tx.execute("DELETE FROM gene_scores", [])?;
            let now = now_epoch();
            let mut insert = tx.prepare(
                "INSERT INTO gene_scores
                     (gene_id, percentage_score, source_count, evidence_tier, source_scores, refreshed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            let mut written = 0u64;
            for (gene_id, rows) in &by_gene {
                let score = engine.score_gene(*gene_id, rows);
                let source_scores = serde_json::to_string(&score.source_scores)
                    .map_err(|err| NephroError::Constraint(format!("score encoding: {err}")))?;
                insert.execute(params![
                    gene_id,
                    score.percentage_score,
                    score.source_count,
                    score.evidence_tier.as_str(),
                    source_scores,
                    now,
                ])?;
                written += 1;
            }
            Ok(written)
        })
    }

    pub fn score_for_gene(&self, gene_id: i64) -> Result<Option<GeneScore>, NephroError> {
        let raw = self.with("score_for_gene", |conn| {
            Ok(conn
                .query_row(
                    "SELECT gene_id, percentage_score, source_count, evidence_tier, source_scores
                     FROM gene_scores WHERE gene_id = ?1",
                    [gene_id],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, f64>(1)?,
                            row.get::<_, u32>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    },
                )
                .optional()?)
        })?;
        raw.map(|(gene_id, percentage_score, source_count, tier, source_scores)| {
            Ok(GeneScore {
                gene_id,
                percentage_score,
                source_count,
                evidence_tier: EvidenceTier::from_flag(&tier)?,
                source_scores: serde_json::from_str(&source_scores).unwrap_or_default(),
            })
        })
        .transpose()
    }

    /// Tier → gene count over the current projection, for filter
    /// metadata.
    pub fn tier_distribution(&self) -> Result<BTreeMap<String, u64>, NephroError> {
        self.with("tier_distribution", |conn| {
            let mut stmt = conn.prepare(
                "SELECT evidence_tier, COUNT(*) FROM gene_scores GROUP BY evidence_tier",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
            })?;
            let mut out = BTreeMap::new();
            for row in rows {
                let (tier, count) = row?;
                out.insert(tier, count);
            }
            Ok(out)
        })
    }

    pub fn scored_gene_count(&self) -> Result<u64, NephroError> {
        self.with("scored_gene_count", |conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM gene_scores", [], |row| row.get(0))?)
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::config::AppConfig;
    use crate::entities::evidence::{ClinGenEvidence, EvidenceData};
    use crate::score::ScoreEngine;
    use crate::sources::hgnc::HgncRecord;
    use crate::store::Store;

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

    fn clingen(score: f64) -> EvidenceData {
        EvidenceData::ClinGen(ClinGenEvidence {
            classifications: vec!["Definitive".into()],
            validities: vec![],
            expert_panels: vec![],
            max_classification_score: score,
        })
    }

    #[test]
    fn refresh_covers_exactly_the_genes_with_evidence() {
        let store = Store::open_in_memory().unwrap();
        let engine = ScoreEngine::from_config(&AppConfig::default());

        let scored = seed_gene(&store, "HGNC:9008", "PKD1");
        let unscored = seed_gene(&store, "HGNC:9009", "PKD2");
        store.replace_evidence(scored, &clingen(1.0), None).unwrap();

        let written = store.refresh_scores(&engine).unwrap();
        assert_eq!(written, 1);
        assert!(store.score_for_gene(scored).unwrap().is_some());
        assert!(store.score_for_gene(unscored).unwrap().is_none());
    }

    #[test]
    fn refresh_twice_on_unchanged_evidence_is_identical() {
        let store = Store::open_in_memory().unwrap();
        let engine = ScoreEngine::from_config(&AppConfig::default());
        let gene = seed_gene(&store, "HGNC:9008", "PKD1");
        store.replace_evidence(gene, &clingen(0.8), None).unwrap();

        store.refresh_scores(&engine).unwrap();
        let first = store.score_for_gene(gene).unwrap().unwrap();
        store.refresh_scores(&engine).unwrap();
        let second = store.score_for_gene(gene).unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn tier_distribution_counts_projection_rows() {
        let store = Store::open_in_memory().unwrap();
        let engine = ScoreEngine::from_config(&AppConfig::default());
        let gene = seed_gene(&store, "HGNC:9008", "PKD1");
        store.replace_evidence(gene, &clingen(1.0), None).unwrap();
        store.refresh_scores(&engine).unwrap();

        let distribution = store.tier_distribution().unwrap();
        assert_eq!(distribution.values().sum::<u64>(), 1);
    }
}
