//! HPO phenotype-annotation adapter.
//!
//! Downloads the `genes_to_phenotype` bulk table and aggregates per-gene
//! phenotype term lists, with the kidney/urinary subset split out. The
//! kidney subset is what enrichment consumes by default, and the full
//! term list is kept for the `use_kidney_only=false` contrast path.

use std::borrow::Cow;
use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::entities::SourceName;
use crate::entities::evidence::{EvidenceData, HpoEvidence, HpoTerm, RawEvidence};
use crate::error::NephroError;
use crate::sources::{BulkPager, FetchedPage, SourceAdapter};

const HPO_BASE: &str = "http://purl.obolibrary.org/obo/hp/hpoa/genes_to_phenotype.txt";
const HPO_API: &str = "hpo";
const HPO_BASE_ENV: &str = "NEPHRODB_HPO_BASE";

const RECORDS_PER_PAGE: usize = 500;

/// Term names matching any of these belong to the kidney subset.
const KIDNEY_TERM_PATTERNS: &[&str] = &[
    "kidney", "renal", "nephr", "glomerul", "tubul", "urinary", "ureter", "bladder", "urethra",
    "cyst",
];

pub struct HpoAdapter {
    client: reqwest_middleware::ClientWithMiddleware,
    base: Cow<'static, str>,
    pager: BulkPager,
}

impl HpoAdapter {
    pub fn new() -> Result<Self, NephroError> {
        Ok(Self {
            client: crate::sources::shared_client()?,
            base: crate::sources::env_base(HPO_BASE, HPO_BASE_ENV),
            pager: BulkPager::new(RECORDS_PER_PAGE),
        })
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(base: String) -> Result<Self, NephroError> {
        Ok(Self {
            client: crate::sources::shared_client()?,
            base: Cow::Owned(base),
            pager: BulkPager::new(RECORDS_PER_PAGE),
        })
    }

    async fn load_all(&self) -> Result<Vec<RawEvidence>, NephroError> {
        let url = self.base.as_ref().to_string();
        crate::sources::rate_limit::wait_for_url_str(&url).await;
        let req = self.client.get(&url);
        let resp = crate::sources::apply_cache_mode(req).send().await?;
        crate::sources::check_rate_limited(HPO_API, &resp)?;
        let status = resp.status();
        let bytes = crate::sources::read_limited_body(resp, HPO_API).await?;
        if !status.is_success() {
            let excerpt = crate::sources::body_excerpt(&bytes);
            return Err(NephroError::Api {
                api: HPO_API.to_string(),
                message: format!("HTTP {status}: {excerpt}"),
            });
        }
        parse_genes_to_phenotype(&String::from_utf8_lossy(&bytes))
    }
}

pub(crate) fn is_kidney_term(name: &str) -> bool {
    let name = name.to_lowercase();
    KIDNEY_TERM_PATTERNS.iter().any(|p| name.contains(p))
}

/// Parses the tab-separated `genes_to_phenotype` table. Recent releases
/// use the header `ncbi_gene_id\tgene_symbol\thpo_id\thpo_name\t...`.
pub(crate) fn parse_genes_to_phenotype(raw: &str) -> Result<Vec<RawEvidence>, NephroError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .quoting(false)
        .from_reader(raw.as_bytes());

    let headers = reader
        .headers()
        .map_err(|err| NephroError::Api {
            api: HPO_API.to_string(),
            message: format!("genes_to_phenotype has no header: {err}"),
        })?
        .clone();
    let col = |name: &str| {
        headers
            .iter()
            .position(|h| h.trim_start_matches('#').trim().eq_ignore_ascii_case(name))
    };
    let (Some(symbol_col), Some(term_id_col), Some(term_name_col)) =
        (col("gene_symbol"), col("hpo_id"), col("hpo_name"))
    else {
        return Err(NephroError::Api {
            api: HPO_API.to_string(),
            message: "genes_to_phenotype is missing gene_symbol/hpo_id/hpo_name columns".into(),
        });
    };

    let mut per_gene: BTreeMap<String, Vec<HpoTerm>> = BTreeMap::new();
    for row in reader.records() {
        let Ok(row) = row else { continue };
        let symbol = row.get(symbol_col).unwrap_or("").trim().to_uppercase();
        let term_id = row.get(term_id_col).unwrap_or("").trim();
        let name = row.get(term_name_col).unwrap_or("").trim();
        if symbol.is_empty() || term_id.is_empty() {
            continue;
        }
        let terms = per_gene.entry(symbol).or_default();
        if terms.iter().all(|t| t.term_id != term_id) {
            terms.push(HpoTerm {
                term_id: term_id.to_string(),
                name: name.to_string(),
            });
        }
    }

    Ok(per_gene
        .into_iter()
        .map(|(symbol, hpo_terms)| {
            let kidney_phenotypes: Vec<HpoTerm> = hpo_terms
                .iter()
                .filter(|t| is_kidney_term(&t.name))
                .cloned()
                .collect();
            let kidney_phenotype_count = kidney_phenotypes.len() as u32;
            let classification = match kidney_phenotype_count {
                0 => None,
                1..=2 => Some("limited_kidney_phenotype".to_string()),
                _ => Some("kidney_phenotype".to_string()),
            };
            RawEvidence {
                gene_identifier: symbol,
                evidence_data: EvidenceData::Hpo(HpoEvidence {
                    hpo_terms,
                    kidney_phenotypes,
                    kidney_phenotype_count,
                    classification,
                }),
            }
        })
        .collect())
}

#[async_trait]
impl SourceAdapter for HpoAdapter {
    fn name(&self) -> SourceName {
        SourceName::Hpo
    }

    fn rate_limit_hosts(&self) -> Vec<String> {
        vec![crate::sources::rate_limit::host_of(self.base.as_ref())]
    }

    /// Term arrays also land in `gene_annotations`; enrichment reads
    /// them from there.
    fn wants_annotation(&self) -> bool {
        true
    }

    async fn prepare_run(&self) -> Result<(), NephroError> {
        self.pager.reset().await;
        Ok(())
    }

    async fn fetch_page(&self, page: u64) -> Result<FetchedPage, NephroError> {
        self.pager.page(page, || self.load_all()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> String {
        [
            "ncbi_gene_id\tgene_symbol\thpo_id\thpo_name\tfrequency\tdisease_id",
            "5310\tPKD1\tHP:0000113\tPolycystic kidney dysplasia\t-\tOMIM:173900",
            "5310\tPKD1\tHP:0000822\tHypertension\t-\tOMIM:173900",
            "5310\tPKD1\tHP:0000113\tPolycystic kidney dysplasia\t-\tORPHA:730",
            "7827\tNPHS2\tHP:0000100\tNephrotic syndrome\t-\tOMIM:600995",
            "348\tAPOE\tHP:0003124\tHypercholesterolemia\t-\tOMIM:617347",
        ]
        .join("\n")
    }

    #[test]
    fn aggregates_unique_terms_and_splits_kidney_subset() {
        let records = parse_genes_to_phenotype(&fixture()).unwrap();
        assert_eq!(records.len(), 3);

        let pkd1 = records
            .iter()
            .find(|r| r.gene_identifier == "PKD1")
            .unwrap();
        let EvidenceData::Hpo(evidence) = &pkd1.evidence_data else {
            panic!("wrong variant");
        };
        // Duplicate HP:0000113 collapsed; hypertension kept out of the
        // kidney subset.
        assert_eq!(evidence.hpo_terms.len(), 2);
        assert_eq!(evidence.kidney_phenotype_count, 1);
        assert_eq!(evidence.kidney_phenotypes[0].term_id, "HP:0000113");
    }

    #[test]
    fn genes_without_kidney_terms_have_no_classification() {
        let records = parse_genes_to_phenotype(&fixture()).unwrap();
        let apoe = records
            .iter()
            .find(|r| r.gene_identifier == "APOE")
            .unwrap();
        let EvidenceData::Hpo(evidence) = &apoe.evidence_data else {
            panic!("wrong variant");
        };
        assert_eq!(evidence.kidney_phenotype_count, 0);
        assert_eq!(evidence.classification, None);
    }

    #[test]
    fn kidney_term_matcher_spans_branch_vocabulary() {
        assert!(is_kidney_term("Renal insufficiency"));
        assert!(is_kidney_term("Nephrotic syndrome"));
        assert!(is_kidney_term("Abnormality of the urinary system"));
        assert!(!is_kidney_term("Hypercholesterolemia"));
    }
}
