//! GenCC submissions adapter.
//!
//! Downloads the submissions CSV export and aggregates one record per
//! gene: every submitted classification with its disease and submitter.

use std::borrow::Cow;
use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::entities::SourceName;
use crate::entities::evidence::{EvidenceData, GenCcEvidence, GenCcSubmission, RawEvidence};
use crate::error::NephroError;
use crate::sources::{BulkPager, FetchedPage, SourceAdapter};

const GENCC_BASE: &str = "https://search.thegencc.org/download/action/submissions-export-csv";
const GENCC_API: &str = "gencc";
const GENCC_BASE_ENV: &str = "NEPHRODB_GENCC_BASE";

const RECORDS_PER_PAGE: usize = 200;

pub struct GenCcAdapter {
    client: reqwest_middleware::ClientWithMiddleware,
    base: Cow<'static, str>,
    pager: BulkPager,
}

impl GenCcAdapter {
    pub fn new() -> Result<Self, NephroError> {
        Ok(Self {
            client: crate::sources::shared_client()?,
            base: crate::sources::env_base(GENCC_BASE, GENCC_BASE_ENV),
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
        crate::sources::check_rate_limited(GENCC_API, &resp)?;
        let status = resp.status();
        let bytes = crate::sources::read_limited_body(resp, GENCC_API).await?;
        if !status.is_success() {
            let excerpt = crate::sources::body_excerpt(&bytes);
            return Err(NephroError::Api {
                api: GENCC_API.to_string(),
                message: format!("HTTP {status}: {excerpt}"),
            });
        }
        parse_submissions_csv(&bytes)
    }
}

pub(crate) fn parse_submissions_csv(raw: &[u8]) -> Result<Vec<RawEvidence>, NephroError> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(raw);
    let headers = reader
        .headers()
        .map_err(|err| NephroError::Api {
            api: GENCC_API.to_string(),
            message: format!("submissions export has no header: {err}"),
        })?
        .clone();
    let col = |name: &str| headers.iter().position(|h| h.eq_ignore_ascii_case(name));
    let (Some(symbol_col), Some(classification_col)) =
        (col("gene_symbol"), col("classification_title"))
    else {
        return Err(NephroError::Api {
            api: GENCC_API.to_string(),
            message: "submissions export is missing gene_symbol/classification_title".into(),
        });
    };
    let disease_col = col("disease_title");
    let submitter_col = col("submitter_title");

    let mut per_gene: BTreeMap<String, GenCcEvidence> = BTreeMap::new();
    for row in reader.records() {
        let Ok(row) = row else { continue };
        let get = |col: Option<usize>| col.and_then(|c| row.get(c)).unwrap_or("").trim();
        let symbol = get(Some(symbol_col)).to_uppercase();
        let classification = get(Some(classification_col)).to_string();
        if symbol.is_empty() || classification.is_empty() {
            continue;
        }

        let entry = per_gene.entry(symbol).or_insert_with(|| GenCcEvidence {
            classifications: Vec::new(),
            submissions: Vec::new(),
            submitters: Vec::new(),
            submission_count: 0,
        });
        if !entry.classifications.contains(&classification) {
            entry.classifications.push(classification.clone());
        }
        let submitter = get(submitter_col).to_string();
        if !submitter.is_empty() && !entry.submitters.contains(&submitter) {
            entry.submitters.push(submitter.clone());
        }
        entry.submissions.push(GenCcSubmission {
            disease: get(disease_col).to_string(),
            classification,
            submitter,
        });
    }

    Ok(per_gene
        .into_iter()
        .map(|(symbol, mut evidence)| {
            evidence.submission_count = evidence.submissions.len() as u32;
            RawEvidence {
                gene_identifier: symbol,
                evidence_data: EvidenceData::GenCc(evidence),
            }
        })
        .collect())
}

#[async_trait]
impl SourceAdapter for GenCcAdapter {
    fn name(&self) -> SourceName {
        SourceName::GenCc
    }

    fn rate_limit_hosts(&self) -> Vec<String> {
        vec![crate::sources::rate_limit::host_of(self.base.as_ref())]
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

    fn export_fixture() -> String {
        [
            "uuid,gene_curie,gene_symbol,disease_curie,disease_title,classification_curie,classification_title,submitter_curie,submitter_title",
            "GENCC_000101,HGNC:9008,PKD1,MONDO:0004691,polycystic kidney disease,GENCC:100001,Definitive,GENCC:000104,Genomics England PanelApp",
            "GENCC_000102,HGNC:9008,PKD1,MONDO:0004691,polycystic kidney disease,GENCC:100002,Strong,GENCC:000105,Orphanet",
            "GENCC_000103,HGNC:13394,NPHS2,MONDO:0019007,steroid-resistant nephrotic syndrome,GENCC:100001,Definitive,GENCC:000104,Genomics England PanelApp",
        ]
        .join("\n")
    }

    #[test]
    fn submissions_aggregate_per_gene_with_unique_submitters() {
        let records = parse_submissions_csv(export_fixture().as_bytes()).unwrap();
        assert_eq!(records.len(), 2);

        let pkd1 = records
            .iter()
            .find(|r| r.gene_identifier == "PKD1")
            .unwrap();
        let EvidenceData::GenCc(evidence) = &pkd1.evidence_data else {
            panic!("wrong variant");
        };
        assert_eq!(evidence.submission_count, 2);
        assert_eq!(evidence.classifications, vec!["Definitive", "Strong"]);
        assert_eq!(
            evidence.submitters,
            vec!["Genomics England PanelApp", "Orphanet"]
        );
        assert!((evidence.classification_strength() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rows_without_symbol_or_classification_are_dropped() {
        let raw = "gene_symbol,classification_title,disease_title,submitter_title\n,Definitive,x,y\nPKD1,,x,y\n";
        let records = parse_submissions_csv(raw.as_bytes()).unwrap();
        assert!(records.is_empty());
    }
}
