use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};

use crate::cache::{CacheManager, hashed_key};
use crate::config::ApiDefaults;
use crate::entities::SourceName;
use crate::entities::score::{EvidenceTier, GeneListItem};
use crate::error::NephroError;
use crate::store::Store;

const METADATA_NAMESPACE: &str = "annotations";
const METADATA_KEY: &str = "filter_metadata";
/// The id-restoration path changes rarely; cache it for an hour.
const ID_LIST_TTL: Duration = Duration::from_secs(3600);

/// Filter surface of the gene listing. All ranges are inclusive on both
/// endpoints; multi-valued filters use OR semantics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneFilters {
    /// Substring match on approved symbol or any alias.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_evidence_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_evidence_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceName>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tiers: Vec<EvidenceTier>,
    /// `None` falls back to the configured default (true).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hide_zero_scores: Option<bool>,
    /// Explicit id list for URL-state restoration. Capped.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    ApprovedSymbol,
    PercentageScore,
    EvidenceCount,
}

impl SortField {
    pub fn from_flag(value: &str) -> Result<Self, NephroError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "approved_symbol" | "symbol" => Ok(SortField::ApprovedSymbol),
            "percentage_score" | "score" => Ok(SortField::PercentageScore),
            "evidence_count" | "count" => Ok(SortField::EvidenceCount),
            other => Err(NephroError::InvalidArgument(format!(
                "Unknown sort field: {other}\n\nValid fields:\n- approved_symbol\n- percentage_score\n- evidence_count"
            ))),
        }
    }

    fn sql(self) -> &'static str {
        match self {
            SortField::ApprovedSymbol => "g.approved_symbol COLLATE NOCASE",
            SortField::PercentageScore => "score",
            SortField::EvidenceCount => "evidence_count",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Sort {
    pub field: SortField,
    pub descending: bool,
}

impl Default for Sort {
    fn default() -> Self {
        Sort {
            field: SortField::PercentageScore,
            descending: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneListResponse {
    pub items: Vec<GeneListItem>,
    /// Count of rows matching the filter (not just this page).
    pub total: u64,
    /// Rows excluded by `hide_zero_scores`; zero when the flag is off.
    pub hidden_zero_scores: u64,
    pub page: u32,
    pub page_size: u32,
}

/// Metadata the filter UI needs, cached with a short TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterMetadata {
    pub sources: Vec<String>,
    pub max_evidence_count: u32,
    pub tier_distribution: BTreeMap<String, u64>,
}

/// Read-only gene listing over the score projection.
///
/// The projection is LEFT-joined so genes without any evidence appear as
/// zero-score `insufficient` rows; the evidence table itself is never
/// joined — source membership reads the keys of the projected
/// `source_scores` document.
pub struct QueryService {
    store: Arc<Store>,
    cache: Arc<CacheManager>,
    defaults: ApiDefaults,
}

struct FilterSql {
    clauses: Vec<String>,
    params: Vec<SqlValue>,
}

impl QueryService {
    pub fn new(store: Arc<Store>, cache: Arc<CacheManager>, defaults: ApiDefaults) -> Self {
        QueryService {
            store,
            cache,
            defaults,
        }
    }

    pub fn list_genes(
        &self,
        filters: &GeneFilters,
        page: u32,
        page_size: Option<u32>,
        sort: Sort,
    ) -> Result<GeneListResponse, NephroError> {
        if filters.ids.len() > self.defaults.max_id_filter {
            return Err(NephroError::InvalidArgument(format!(
                "id filter accepts at most {} ids, got {}",
                self.defaults.max_id_filter,
                filters.ids.len()
            )));
        }
        let page = page.max(1);
        let page_size = page_size
            .unwrap_or(self.defaults.page_size)
            .clamp(1, self.defaults.max_page_size);

        // The id-restoration path is rare and stable; serve it from cache.
        let cache_key = if filters.ids.is_empty() {
            None
        } else {
            Some(hashed_key(&(filters, page, page_size, &sort)))
        };
        if let Some(key) = &cache_key
            && let Some(cached) = self.cache.get_json(METADATA_NAMESPACE, key)?
        {
            return Ok(cached);
        }

        let hide_zero = filters
            .hide_zero_scores
            .unwrap_or(self.defaults.hide_zero_scores);

        let filter = build_filter_sql(filters, hide_zero);
        let where_clause = if filter.clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", filter.clauses.join(" AND "))
        };

        let base = "FROM genes g LEFT JOIN gene_scores s ON s.gene_id = g.id";
        let total: u64 = self.store.with("list_genes_total", |conn| {
            Ok(conn.query_row(
                &format!("SELECT COUNT(*) {base} {where_clause}"),
                rusqlite::params_from_iter(filter.params.iter()),
                |row| row.get(0),
            )?)
        })?;

        // Rows the hide flag excluded: same filter, minus the hide
        // clause, restricted to the insufficient tier.
        let hidden_zero_scores = if hide_zero {
            let unhidden = build_filter_sql(filters, false);
            let mut clauses = unhidden.clauses;
            clauses.push("COALESCE(s.evidence_tier, 'insufficient') = 'insufficient'".into());
            let where_clause = format!("WHERE {}", clauses.join(" AND "));
            self.store.with("list_genes_hidden", |conn| {
                Ok(conn.query_row(
                    &format!("SELECT COUNT(*) {base} {where_clause}"),
                    rusqlite::params_from_iter(unhidden.params.iter()),
                    |row| row.get(0),
                )?)
            })?
        } else {
            0
        };

        let direction = if sort.descending { "DESC" } else { "ASC" };
        let offset = u64::from(page - 1) * u64::from(page_size);
        let items = self.store.with("list_genes_page", |conn| {
            let sql = format!(
                "SELECT g.id, g.hgnc_id, g.approved_symbol, g.aliases,
                        COALESCE(s.percentage_score, 0.0) AS score,
                        COALESCE(s.source_count, 0) AS evidence_count,
                        COALESCE(s.evidence_tier, 'insufficient') AS tier,
                        COALESCE(s.source_scores, '{{}}') AS source_scores
                 {base} {where_clause}
                 ORDER BY {} {direction}, g.id ASC
                 LIMIT {page_size} OFFSET {offset}",
                sort.field.sql()
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(filter.params.iter()), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, u32>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })?;
            let mut items = Vec::new();
            for row in rows {
                let (id, hgnc_id, symbol, aliases, score, evidence_count, tier, source_scores) =
                    row?;
                let source_scores: BTreeMap<String, f64> =
                    serde_json::from_str(&source_scores).unwrap_or_default();
                items.push(GeneListItem {
                    id,
                    approved_symbol: symbol,
                    hgnc_id,
                    aliases: serde_json::from_str(&aliases).unwrap_or_default(),
                    percentage_score: score,
                    evidence_count,
                    evidence_tier: EvidenceTier::from_flag(&tier)
                        .unwrap_or(EvidenceTier::Insufficient),
                    sources: source_scores.keys().cloned().collect(),
                    source_scores,
                });
            }
            Ok(items)
        })?;

        let response = GeneListResponse {
            items,
            total,
            hidden_zero_scores,
            page,
            page_size,
        };
        if let Some(key) = &cache_key {
            self.cache
                .put_json_with_ttl(METADATA_NAMESPACE, key, &response, ID_LIST_TTL)?;
        }
        Ok(response)
    }

    /// Gene ids matching a filter, in score-descending order, capped.
    /// The network engine bootstraps its gene set through this.
    pub fn filtered_gene_ids(
        &self,
        filters: &GeneFilters,
        cap: usize,
    ) -> Result<Vec<i64>, NephroError> {
        let hide_zero = filters
            .hide_zero_scores
            .unwrap_or(self.defaults.hide_zero_scores);
        let filter = build_filter_sql(filters, hide_zero);
        let where_clause = if filter.clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", filter.clauses.join(" AND "))
        };
        self.store.with("filtered_gene_ids", |conn| {
            let sql = format!(
                "SELECT g.id FROM genes g LEFT JOIN gene_scores s ON s.gene_id = g.id
                 {where_clause}
                 ORDER BY COALESCE(s.percentage_score, 0.0) DESC, g.id ASC
                 LIMIT {cap}"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(filter.params.iter()), |row| {
                row.get(0)
            })?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            Ok(ids)
        })
    }

    /// Sources present, maximum evidence count, and tier distribution.
    /// Served from the `annotations` namespace, which both the TTL and
    /// any evidence write invalidate.
    pub fn filter_metadata(&self) -> Result<FilterMetadata, NephroError> {
        if let Some(cached) = self.cache.get_json(METADATA_NAMESPACE, METADATA_KEY)? {
            return Ok(cached);
        }

        let tier_distribution = self.store.tier_distribution()?;
        let (sources, max_evidence_count) = self.store.with("filter_metadata", |conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT sc.key
                 FROM gene_scores s, json_each(s.source_scores) sc
                 ORDER BY sc.key",
            )?;
            let sources: Vec<String> = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<_, _>>()?;
            let max_count: u32 = conn.query_row(
                "SELECT COALESCE(MAX(source_count), 0) FROM gene_scores",
                [],
                |row| row.get(0),
            )?;
            Ok((sources, max_count))
        })?;

        let metadata = FilterMetadata {
            sources,
            max_evidence_count,
            tier_distribution,
        };
        self.cache
            .put_json(METADATA_NAMESPACE, METADATA_KEY, &metadata)?;
        Ok(metadata)
    }
}

fn build_filter_sql(filters: &GeneFilters, hide_zero: bool) -> FilterSql {
    let mut clauses = vec!["g.withdrawn = 0".to_string()];
    let mut params: Vec<SqlValue> = Vec::new();

    if let Some(search) = filters.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let pattern = format!("%{}%", search.to_uppercase());
        clauses.push(
            "(UPPER(g.approved_symbol) LIKE ?
              OR EXISTS (SELECT 1 FROM json_each(g.aliases) a WHERE UPPER(a.value) LIKE ?))"
                .to_string(),
        );
        params.push(SqlValue::Text(pattern.clone()));
        params.push(SqlValue::Text(pattern));
    }
    if let Some(min) = filters.min_score {
        clauses.push("COALESCE(s.percentage_score, 0.0) >= ?".into());
        params.push(SqlValue::Real(min));
    }
    if let Some(max) = filters.max_score {
        clauses.push("COALESCE(s.percentage_score, 0.0) <= ?".into());
        params.push(SqlValue::Real(max));
    }
    if let Some(min) = filters.min_evidence_count {
        clauses.push("COALESCE(s.source_count, 0) >= ?".into());
        params.push(SqlValue::Integer(i64::from(min)));
    }
    if let Some(max) = filters.max_evidence_count {
        clauses.push("COALESCE(s.source_count, 0) <= ?".into());
        params.push(SqlValue::Integer(i64::from(max)));
    }
    if !filters.sources.is_empty() {
        // Membership via the projected source_scores keys; the evidence
        // table never joins into the listing.
        let placeholders = vec!["?"; filters.sources.len()].join(",");
        clauses.push(format!(
            "EXISTS (SELECT 1 FROM json_each(COALESCE(s.source_scores, '{{}}')) sc
                     WHERE sc.key IN ({placeholders}))"
        ));
        for source in &filters.sources {
            params.push(SqlValue::Text(source.as_str().to_string()));
        }
    }
    if !filters.tiers.is_empty() {
        let placeholders = vec!["?"; filters.tiers.len()].join(",");
        clauses.push(format!(
            "COALESCE(s.evidence_tier, 'insufficient') IN ({placeholders})"
        ));
        for tier in &filters.tiers {
            params.push(SqlValue::Text(tier.as_str().to_string()));
        }
    }
    if !filters.ids.is_empty() {
        let placeholders = vec!["?"; filters.ids.len()].join(",");
        clauses.push(format!("g.id IN ({placeholders})"));
        for id in &filters.ids {
            params.push(SqlValue::Integer(*id));
        }
    }
    if hide_zero {
        clauses.push("COALESCE(s.evidence_tier, 'insufficient') != 'insufficient'".into());
    }

    FilterSql { clauses, params }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::entities::evidence::{ClinGenEvidence, EvidenceData, PanelAppEvidence, PanelMembership};
    use crate::score::ScoreEngine;
    use crate::sources::hgnc::HgncRecord;

    fn service() -> (QueryService, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let config = AppConfig::default();
        let cache = Arc::new(CacheManager::new(store.clone(), &config));
        (
            QueryService::new(store.clone(), cache, config.api_defaults.clone()),
            store,
        )
    }

    fn seed_gene(store: &Store, hgnc: &str, symbol: &str, aliases: &[&str]) -> i64 {
        store
            .upsert_gene(&HgncRecord {
                hgnc_id: hgnc.into(),
                approved_symbol: symbol.into(),
                name: String::new(),
                aliases: aliases.iter().map(|a| (*a).to_string()).collect(),
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

    fn panelapp_green() -> EvidenceData {
        EvidenceData::PanelApp(PanelAppEvidence {
            panels: vec![PanelMembership {
                panel_id: 1,
                panel_name: "Cystic kidney disease".into(),
                evidence_level: "3".into(),
            }],
            evidence_levels: vec!["3".into()],
            modes_of_inheritance: vec![],
            phenotypes: vec![],
            panel_count: 1,
        })
    }

    fn refresh(store: &Store) {
        let engine = ScoreEngine::from_config(&AppConfig::default());
        store.refresh_scores(&engine).unwrap();
    }

    #[test]
    fn default_listing_hides_insufficient_and_counts_them() {
        let (service, store) = service();
        let scored = seed_gene(&store, "HGNC:9008", "PKD1", &[]);
        seed_gene(&store, "HGNC:9009", "PKD2", &[]);
        seed_gene(&store, "HGNC:9010", "PKHD1", &[]);
        store.replace_evidence(scored, &clingen(1.0), None).unwrap();
        refresh(&store);

        let response = service
            .list_genes(&GeneFilters::default(), 1, None, Sort::default())
            .unwrap();
        assert_eq!(response.total, 1);
        assert_eq!(response.hidden_zero_scores, 2);

        let all = service
            .list_genes(
                &GeneFilters {
                    hide_zero_scores: Some(false),
                    ..Default::default()
                },
                1,
                None,
                Sort::default(),
            )
            .unwrap();
        assert_eq!(all.total, 3);
        assert_eq!(all.hidden_zero_scores, 0);
        // total - visible = hidden for the default listing.
        assert_eq!(all.total - response.total, response.hidden_zero_scores);
    }

    #[test]
    fn search_matches_symbol_and_alias_substrings() {
        let (service, store) = service();
        let gene = seed_gene(&store, "HGNC:9008", "PKD1", &["PBP"]);
        store.replace_evidence(gene, &clingen(1.0), None).unwrap();
        refresh(&store);

        for query in ["pkd", "PBP", "pb"] {
            let response = service
                .list_genes(
                    &GeneFilters {
                        search: Some(query.into()),
                        ..Default::default()
                    },
                    1,
                    None,
                    Sort::default(),
                )
                .unwrap();
            assert_eq!(response.total, 1, "query {query}");
        }
    }

    #[test]
    fn tier_filter_unions_selected_tiers() {
        let (service, store) = service();
        let strong = seed_gene(&store, "HGNC:9008", "PKD1", &[]);
        let weak = seed_gene(&store, "HGNC:9009", "PKD2", &[]);
        store.replace_evidence(strong, &clingen(1.0), None).unwrap();
        store
            .replace_evidence(strong, &panelapp_green(), None)
            .unwrap();
        store.replace_evidence(weak, &clingen(0.3), None).unwrap();
        refresh(&store);

        let strong_score = store.score_for_gene(strong).unwrap().unwrap();
        let weak_score = store.score_for_gene(weak).unwrap().unwrap();
        assert_ne!(strong_score.evidence_tier, weak_score.evidence_tier);

        let response = service
            .list_genes(
                &GeneFilters {
                    tiers: vec![strong_score.evidence_tier, weak_score.evidence_tier],
                    ..Default::default()
                },
                1,
                None,
                Sort::default(),
            )
            .unwrap();
        assert_eq!(response.total, 2);
    }

    #[test]
    fn score_range_is_inclusive_on_both_ends() {
        let (service, store) = service();
        let gene = seed_gene(&store, "HGNC:9008", "PKD1", &[]);
        store.replace_evidence(gene, &clingen(1.0), None).unwrap();
        refresh(&store);
        let score = store.score_for_gene(gene).unwrap().unwrap().percentage_score;

        let response = service
            .list_genes(
                &GeneFilters {
                    min_score: Some(score),
                    max_score: Some(score),
                    ..Default::default()
                },
                1,
                None,
                Sort::default(),
            )
            .unwrap();
        assert_eq!(response.total, 1);
    }

    #[test]
    fn oversized_id_filter_is_a_validation_error() {
        let (service, _store) = service();
        let err = service
            .list_genes(
                &GeneFilters {
                    ids: (0..1001).collect(),
                    ..Default::default()
                },
                1,
                None,
                Sort::default(),
            )
            .unwrap_err();
        assert!(matches!(err, NephroError::InvalidArgument(_)));
    }

    #[test]
    fn sort_is_total_via_gene_id_tiebreak() {
        let (service, store) = service();
        let a = seed_gene(&store, "HGNC:1", "AAA", &[]);
        let b = seed_gene(&store, "HGNC:2", "BBB", &[]);
        store.replace_evidence(a, &clingen(1.0), None).unwrap();
        store.replace_evidence(b, &clingen(1.0), None).unwrap();
        refresh(&store);

        let response = service
            .list_genes(
                &GeneFilters::default(),
                1,
                None,
                Sort {
                    field: SortField::PercentageScore,
                    descending: true,
                },
            )
            .unwrap();
        // Equal scores fall back to ascending gene id.
        let ids: Vec<i64> = response.items.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![a, b]);
    }

    #[test]
    fn source_membership_reads_projected_scores() {
        let (service, store) = service();
        let with_panel = seed_gene(&store, "HGNC:1", "PKD1", &[]);
        let without = seed_gene(&store, "HGNC:2", "PKD2", &[]);
        store
            .replace_evidence(with_panel, &panelapp_green(), None)
            .unwrap();
        store.replace_evidence(without, &clingen(1.0), None).unwrap();
        refresh(&store);

        let response = service
            .list_genes(
                &GeneFilters {
                    sources: vec![SourceName::PanelApp],
                    ..Default::default()
                },
                1,
                None,
                Sort::default(),
            )
            .unwrap();
        assert_eq!(response.total, 1);
        assert_eq!(response.items[0].id, with_panel);
    }

    #[test]
    fn filter_metadata_lists_sources_and_tiers() {
        let (service, store) = service();
        let gene = seed_gene(&store, "HGNC:1", "PKD1", &[]);
        store.replace_evidence(gene, &clingen(1.0), None).unwrap();
        store.replace_evidence(gene, &panelapp_green(), None).unwrap();
        refresh(&store);

        let metadata = service.filter_metadata().unwrap();
        assert_eq!(metadata.sources, vec!["clingen", "panelapp"]);
        assert_eq!(metadata.max_evidence_count, 2);
        assert_eq!(metadata.tier_distribution.values().sum::<u64>(), 1);
    }
}
