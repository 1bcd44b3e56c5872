//! Over-representation enrichment for gene clusters.
//!
//! HPO enrichment runs locally against persisted annotations. The
//! critical statistical rule: the background universe is the set of
//! genes *with* HPO annotations, never the whole gene table — a full
//! universe inflates the without-term cell and buries real signal.
//!
//! GO/KEGG enrichment calls the external Enrichr API, paced to one call
//! per two seconds process-wide, hard-capped at 120 s, and degraded to
//! an empty result on any upstream failure.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::entities::SourceName;
use crate::entities::evidence::EvidenceData;
use crate::error::NephroError;
use crate::network::stats::{benjamini_hochberg, fisher_exact_greater, odds_ratio};
use crate::store::Store;

const ENRICHR_BASE: &str = "https://maayanlab.cloud/Enrichr";
const ENRICHR_API: &str = "enrichr";
const ENRICHR_BASE_ENV: &str = "NEPHRODB_ENRICHR_BASE";

/// Minimum spacing between Enrichr calls, shared across the process.
const ENRICHR_CALLS_PER_SECOND: f64 = 0.5;
const ENRICHR_TIMEOUT: Duration = Duration::from_secs(120);

pub const DEFAULT_FDR_THRESHOLD: f64 = 0.05;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentRow {
    pub term_id: String,
    pub term_name: String,
    /// Cluster genes carrying the term.
    pub cluster_count: u64,
    /// Background genes carrying the term.
    pub background_count: u64,
    pub odds_ratio: f64,
    pub p_value: f64,
    pub fdr: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HpoEnrichment {
    pub rows: Vec<EnrichmentRow>,
    /// Size of the annotated-gene universe the test ran against.
    pub background_size: u64,
    pub cluster_size_in_background: u64,
    pub use_kidney_only: bool,
}

/// HPO over-representation for a gene set.
///
/// `use_kidney_only` (the default) tests against the kidney-filtered
/// phenotype subset, which keeps the multiple-testing burden focused on
/// domain terms; `false` switches to the full phenotype lists.
pub fn enrich_hpo(
    store: &Arc<Store>,
    gene_ids: &[i64],
    use_kidney_only: bool,
    fdr_threshold: f64,
) -> Result<HpoEnrichment, NephroError> {
    let annotations = store.annotations_by_source(SourceName::Hpo)?;

    // term id → (name, genes carrying it)
    let mut term_genes: HashMap<String, (String, HashSet<i64>)> = HashMap::new();
    let mut background: HashSet<i64> = HashSet::new();
    for (gene_id, data) in &annotations {
        let EvidenceData::Hpo(evidence) = data else {
            continue;
        };
        let terms = if use_kidney_only {
            &evidence.kidney_phenotypes
        } else {
            &evidence.hpo_terms
        };
        for term in terms {
            let entry = term_genes
                .entry(term.term_id.clone())
                .or_insert_with(|| (term.name.clone(), HashSet::new()));
            entry.1.insert(*gene_id);
            background.insert(*gene_id);
        }
    }

    let background_size = background.len() as u64;
    let cluster: HashSet<i64> = gene_ids
        .iter()
        .copied()
        .filter(|id| background.contains(id))
        .collect();
    let cluster_size = cluster.len() as u64;
    info!(
        background_size,
        cluster_size, use_kidney_only, "hpo enrichment universe"
    );

    // Deterministic term order for stable p-value vectors.
    let mut tested: Vec<(String, String, u64, u64, f64, f64)> = Vec::new();
    let ordered: BTreeMap<String, (String, HashSet<i64>)> = term_genes.into_iter().collect();
    for (term_id, (term_name, genes)) in ordered {
        let a = genes.intersection(&cluster).count() as u64;
        if a == 0 {
            continue;
        }
        let term_total = genes.len() as u64;
        let b = cluster_size - a;
        let c = term_total - a;
        let d = (background_size - term_total) - b;
        let p = fisher_exact_greater(a, b, c, d);
        let or = odds_ratio(a, b, c, d);
        tested.push((term_id, term_name, a, term_total, or, p));
    }

    let p_values: Vec<f64> = tested.iter().map(|t| t.5).collect();
    let fdrs = benjamini_hochberg(&p_values);

    let mut rows: Vec<EnrichmentRow> = tested
        .into_iter()
        .zip(fdrs)
        .filter(|(_, fdr)| *fdr < fdr_threshold)
        .map(
            |((term_id, term_name, cluster_count, background_count, or, p), fdr)| EnrichmentRow {
                term_id,
                term_name,
                cluster_count,
                background_count,
                odds_ratio: or,
                p_value: p,
                fdr,
            },
        )
        .collect();
    rows.sort_by(|x, y| {
        x.fdr
            .partial_cmp(&y.fdr)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(x.term_id.cmp(&y.term_id))
    });

    Ok(HpoEnrichment {
        rows,
        background_size,
        cluster_size_in_background: cluster_size,
        use_kidney_only,
    })
}

// ── External GO/KEGG enrichment ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalEnrichmentRow {
    pub library: String,
    pub term_name: String,
    pub p_value: f64,
    pub fdr: f64,
    pub genes: Vec<String>,
}

pub struct EnrichrClient {
    client: reqwest_middleware::ClientWithMiddleware,
    base: Cow<'static, str>,
}

#[derive(Debug, Deserialize)]
struct AddListResponse {
    #[serde(rename = "userListId")]
    user_list_id: u64,
}

impl EnrichrClient {
    pub fn new() -> Result<Self, NephroError> {
        crate::sources::rate_limit::set_rate(
            &crate::sources::rate_limit::host_of(ENRICHR_BASE),
            ENRICHR_CALLS_PER_SECOND,
        );
        Ok(Self {
            client: crate::sources::shared_client()?,
            base: crate::sources::env_base(ENRICHR_BASE, ENRICHR_BASE_ENV),
        })
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(base: String) -> Result<Self, NephroError> {
        Ok(Self {
            client: crate::sources::shared_client()?,
            base: Cow::Owned(base),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base.as_ref().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Runs one library's enrichment for a symbol list. Failures degrade
    /// to an empty list with a warning; the caller's request never
    /// fails on the external dependency.
    pub async fn enrich(&self, symbols: &[String], library: &str) -> Vec<ExternalEnrichmentRow> {
        match crate::sources::with_failsafe(
            ENRICHR_API,
            ENRICHR_TIMEOUT,
            self.enrich_inner(symbols, library),
        )
        .await
        {
            Ok(rows) => rows,
            Err(err) => {
                warn!(library, error = %err, "external enrichment degraded to empty");
                Vec::new()
            }
        }
    }

    async fn enrich_inner(
        &self,
        symbols: &[String],
        library: &str,
    ) -> Result<Vec<ExternalEnrichmentRow>, NephroError> {
        let add_url = self.endpoint("addList");
        crate::sources::rate_limit::wait_for_url_str(&add_url).await;
        let form = reqwest::multipart::Form::new()
            .text("list", symbols.join("\n"))
            .text("description", "nephrodb cluster");
        let resp = self.client.post(&add_url).multipart(form).send().await?;
        crate::sources::check_rate_limited(ENRICHR_API, &resp)?;
        let status = resp.status();
        let bytes = crate::sources::read_limited_body(resp, ENRICHR_API).await?;
        if !status.is_success() {
            return Err(NephroError::Api {
                api: ENRICHR_API.to_string(),
                message: format!("HTTP {status}: {}", crate::sources::body_excerpt(&bytes)),
            });
        }
        let added: AddListResponse =
            serde_json::from_slice(&bytes).map_err(|source| NephroError::ApiJson {
                api: ENRICHR_API.to_string(),
                source,
            })?;

        let enrich_url = self.endpoint("enrich");
        crate::sources::rate_limit::wait_for_url_str(&enrich_url).await;
        let resp = self
            .client
            .get(&enrich_url)
            .query(&[
                ("userListId", added.user_list_id.to_string()),
                ("backgroundType", library.to_string()),
            ])
            .send()
            .await?;
        crate::sources::check_rate_limited(ENRICHR_API, &resp)?;
        let status = resp.status();
        let bytes = crate::sources::read_limited_body(resp, ENRICHR_API).await?;
        if !status.is_success() {
            return Err(NephroError::Api {
                api: ENRICHR_API.to_string(),
                message: format!("HTTP {status}: {}", crate::sources::body_excerpt(&bytes)),
            });
        }

        // Response shape: {library: [[rank, term, p, z, combined, [genes], adj_p, ...], ...]}
        let parsed: HashMap<String, Vec<serde_json::Value>> =
            serde_json::from_slice(&bytes).map_err(|source| NephroError::ApiJson {
                api: ENRICHR_API.to_string(),
                source,
            })?;
        let mut rows = Vec::new();
        for entry in parsed.get(library).into_iter().flatten() {
            let Some(fields) = entry.as_array() else {
                continue;
            };
            let term_name = fields
                .get(1)
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string();
            let p_value = fields
                .get(2)
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(1.0);
            let fdr = fields
                .get(6)
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(1.0);
            let genes = fields
                .get(5)
                .and_then(serde_json::Value::as_array)
                .map(|list| {
                    list.iter()
                        .filter_map(|g| g.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            if term_name.is_empty() {
                continue;
            }
            rows.push(ExternalEnrichmentRow {
                library: library.to_string(),
                term_name,
                p_value,
                fdr,
                genes,
            });
        }
        Ok(rows)
    }
}
