//! ClinGen gene-disease validity adapter.
//!
//! Downloads the gene-validity CSV export and aggregates one evidence
//! record per gene: every curated classification, the curating expert
//! panels, and the strongest classification mapped onto [0, 1].

use std::borrow::Cow;
use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::entities::SourceName;
use crate::entities::evidence::{
    ClinGenEvidence, ClinGenValidity, EvidenceData, RawEvidence, clingen_classification_score,
};
use crate::error::NephroError;
use crate::sources::{BulkPager, FetchedPage, SourceAdapter};

const CLINGEN_BASE: &str = "https://search.clinicalgenome.org/kb/gene-validity/download";
const CLINGEN_API: &str = "clingen";
const CLINGEN_BASE_ENV: &str = "NEPHRODB_CLINGEN_BASE";

const RECORDS_PER_PAGE: usize = 200;

pub struct ClinGenAdapter {
    client: reqwest_middleware::ClientWithMiddleware,
    base: Cow<'static, str>,
    pager: BulkPager,
}

impl ClinGenAdapter {
    pub fn new() -> Result<Self, NephroError> {
        Ok(Self {
            client: crate::sources::shared_client()?,
            base: crate::sources::env_base(CLINGEN_BASE, CLINGEN_BASE_ENV),
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
        crate::sources::check_rate_limited(CLINGEN_API, &resp)?;
        let status = resp.status();
        let bytes = crate::sources::read_limited_body(resp, CLINGEN_API).await?;
        if !status.is_success() {
            let excerpt = crate::sources::body_excerpt(&bytes);
            return Err(NephroError::Api {
                api: CLINGEN_API.to_string(),
                message: format!("HTTP {status}: {excerpt}"),
            });
        }
        parse_validity_csv(&String::from_utf8_lossy(&bytes))
    }
}

/// The export carries decorative preamble rows before the real header;
/// scan for the row naming the gene-symbol column, then parse from
/// there.
pub(crate) fn parse_validity_csv(raw: &str) -> Result<Vec<RawEvidence>, NephroError> {
    let mut lines = raw.lines();
    let mut header: Option<Vec<String>> = None;
    let mut body = String::new();
    for line in lines.by_ref() {
        if line.to_uppercase().contains("GENE SYMBOL") {
            header = Some(
                split_csv_line(line)
                    .into_iter()
                    .map(|c| c.trim().to_uppercase())
                    .collect(),
            );
            break;
        }
    }
    let Some(header) = header else {
        return Err(NephroError::Api {
            api: CLINGEN_API.to_string(),
            message: "gene-validity export has no GENE SYMBOL header".into(),
        });
    };
    for line in lines {
        // A second preamble block (+++++) closes the table.
        if line.starts_with("++++") {
            continue;
        }
        body.push_str(line);
        body.push('\n');
    }

    let col = |name: &str| header.iter().position(|h| h.contains(name));
    let (Some(symbol_col), Some(classification_col)) = (col("GENE SYMBOL"), col("CLASSIFICATION"))
    else {
        return Err(NephroError::Api {
            api: CLINGEN_API.to_string(),
            message: "gene-validity export is missing required columns".into(),
        });
    };
    let disease_col = col("DISEASE LABEL");
    let gcep_col = col("GCEP");

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(body.as_bytes());

    let mut per_gene: BTreeMap<String, ClinGenEvidence> = BTreeMap::new();
    for row in reader.records() {
        let Ok(row) = row else { continue };
        let get = |col: Option<usize>| col.and_then(|c| row.get(c)).unwrap_or("").trim();
        let symbol = get(Some(symbol_col)).to_uppercase();
        let classification = get(Some(classification_col)).to_string();
        if symbol.is_empty() || classification.is_empty() {
            continue;
        }

        let entry = per_gene.entry(symbol).or_insert_with(|| ClinGenEvidence {
            classifications: Vec::new(),
            validities: Vec::new(),
            expert_panels: Vec::new(),
            max_classification_score: 0.0,
        });
        let score = clingen_classification_score(&classification);
        entry.max_classification_score = entry.max_classification_score.max(score);
        if !entry.classifications.contains(&classification) {
            entry.classifications.push(classification.clone());
        }
        let expert_panel = match get(gcep_col) {
            "" => None,
            value => Some(value.to_string()),
        };
        if let Some(panel) = &expert_panel
            && !entry.expert_panels.contains(panel)
        {
            entry.expert_panels.push(panel.clone());
        }
        entry.validities.push(ClinGenValidity {
            disease: get(disease_col).to_string(),
            classification,
            expert_panel,
        });
    }

    Ok(per_gene
        .into_iter()
        .map(|(symbol, evidence)| RawEvidence {
            gene_identifier: symbol,
            evidence_data: EvidenceData::ClinGen(evidence),
        })
        .collect())
}

/// Minimal CSV field splitter for the single header row; the body goes
/// through the csv crate proper.
fn split_csv_line(line: &str) -> Vec<String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(line.as_bytes());
    reader
        .records()
        .next()
        .and_then(Result::ok)
        .map(|record| record.iter().map(str::to_string).collect())
        .unwrap_or_default()
}

#[async_trait]
impl SourceAdapter for ClinGenAdapter {
    fn name(&self) -> SourceName {
        SourceName::ClinGen
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
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn export_fixture() -> String {
        [
            "CLINGEN GENE VALIDITY CURATIONS",
            "FILE CREATED: 2024-05-01",
            "++++++++++++++++++++++++++++++++++++++++",
            "GENE SYMBOL,GENE ID (HGNC),DISEASE LABEL,DISEASE ID (MONDO),MOI,SOP,CLASSIFICATION,ONLINE REPORT,CLASSIFICATION DATE,GCEP",
            "++++++++++++++++++++++++++++++++++++++++",
            "PKD1,HGNC:9008,autosomal dominant polycystic kidney disease,MONDO:0004691,AD,SOP9,Definitive,https://example.org,2023-01-01,Kidney Cystic and Ciliopathy Disorders",
            "PKD1,HGNC:9008,another nephropathy,MONDO:0000001,AD,SOP9,Limited,https://example.org,2023-06-01,Kidney Cystic and Ciliopathy Disorders",
            "UMOD,HGNC:12559,tubulointerstitial kidney disease,MONDO:0018924,AD,SOP9,Strong,https://example.org,2022-10-10,Tubulopathy GCEP",
        ]
        .join("\n")
    }

    #[test]
    fn parser_skips_preamble_and_aggregates_per_gene() {
        let records = parse_validity_csv(&export_fixture()).unwrap();
        assert_eq!(records.len(), 2);

        let pkd1 = records
            .iter()
            .find(|r| r.gene_identifier == "PKD1")
            .unwrap();
        let EvidenceData::ClinGen(evidence) = &pkd1.evidence_data else {
            panic!("wrong variant");
        };
        assert_eq!(evidence.validities.len(), 2);
        assert_eq!(evidence.classifications, vec!["Definitive", "Limited"]);
        assert!((evidence.max_classification_score - 1.0).abs() < f64::EPSILON);
        assert_eq!(
            evidence.expert_panels,
            vec!["Kidney Cystic and Ciliopathy Disorders"]
        );
    }

    #[test]
    fn missing_header_is_an_api_error() {
        let err = parse_validity_csv("just,some,csv\n1,2,3\n").unwrap_err();
        assert!(format!("{err}").contains("GENE SYMBOL"));
    }

    #[tokio::test]
    async fn fetch_page_serves_deterministic_pseudo_pages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(export_fixture()))
            .mount(&server)
            .await;

        let adapter = ClinGenAdapter::new_for_test(server.uri()).unwrap();
        let page = adapter.fetch_page(0).await.unwrap();
        assert_eq!(page.total_pages, Some(1));
        let symbols: Vec<&str> = page
            .records
            .iter()
            .map(|r| r.gene_identifier.as_str())
            .collect();
        assert_eq!(symbols, vec!["PKD1", "UMOD"]);
    }
}
