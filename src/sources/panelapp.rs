//! PanelApp (Genomics England) adapter.
//!
//! Crawls the kidney-relevant panels, collects each panel's gene list,
//! and aggregates per gene: which panels it sits on, at which confidence
//! level, under which inheritance modes.

use std::borrow::Cow;
use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::entities::SourceName;
use crate::entities::evidence::{EvidenceData, PanelAppEvidence, PanelMembership, RawEvidence};
use crate::error::NephroError;
use crate::sources::{BulkPager, FetchedPage, SourceAdapter};

const PANELAPP_BASE: &str = "https://panelapp.genomics.england.ac.uk/api/v1";
const PANELAPP_API: &str = "panelapp";
const PANELAPP_BASE_ENV: &str = "NEPHRODB_PANELAPP_BASE";

const RECORDS_PER_PAGE: usize = 200;

/// Panels whose name or disease group matches one of these are in scope.
const KIDNEY_PATTERNS: &[&str] = &[
    "kidney", "renal", "nephro", "cystic", "cakut", "tubulo", "glomerul",
];

pub struct PanelAppAdapter {
    client: reqwest_middleware::ClientWithMiddleware,
    base: Cow<'static, str>,
    pager: BulkPager,
}

#[derive(Debug, Deserialize)]
struct PanelListResponse {
    #[serde(default)]
    results: Vec<PanelSummary>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PanelSummary {
    id: u32,
    name: String,
    #[serde(default)]
    disease_group: Option<String>,
    #[serde(default)]
    relevant_disorders: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PanelDetail {
    #[serde(default)]
    genes: Vec<PanelGene>,
}

#[derive(Debug, Deserialize)]
struct PanelGene {
    gene_data: GeneData,
    #[serde(default)]
    confidence_level: String,
    #[serde(default)]
    mode_of_inheritance: Option<String>,
    #[serde(default)]
    phenotypes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GeneData {
    gene_symbol: String,
}

impl PanelSummary {
    fn is_kidney_relevant(&self) -> bool {
        let mut haystacks = vec![self.name.to_lowercase()];
        if let Some(group) = &self.disease_group {
            haystacks.push(group.to_lowercase());
        }
        haystacks.extend(self.relevant_disorders.iter().map(|d| d.to_lowercase()));
        haystacks
            .iter()
            .any(|h| KIDNEY_PATTERNS.iter().any(|p| h.contains(p)))
    }
}

impl PanelAppAdapter {
    pub fn new() -> Result<Self, NephroError> {
        Ok(Self {
            client: crate::sources::shared_client()?,
            base: crate::sources::env_base(PANELAPP_BASE, PANELAPP_BASE_ENV),
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

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base.as_ref().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, NephroError> {
        crate::sources::rate_limit::wait_for_url_str(url).await;
        let req = self.client.get(url);
        let resp = crate::sources::apply_cache_mode(req).send().await?;
        crate::sources::check_rate_limited(PANELAPP_API, &resp)?;
        let status = resp.status();
        let bytes = crate::sources::read_limited_body(resp, PANELAPP_API).await?;
        if !status.is_success() {
            let excerpt = crate::sources::body_excerpt(&bytes);
            return Err(NephroError::Api {
                api: PANELAPP_API.to_string(),
                message: format!("HTTP {status}: {excerpt}"),
            });
        }
        serde_json::from_slice(&bytes).map_err(|source| NephroError::ApiJson {
            api: PANELAPP_API.to_string(),
            source,
        })
    }

    async fn kidney_panels(&self) -> Result<Vec<PanelSummary>, NephroError> {
        let mut panels = Vec::new();
        let mut url = Some(self.endpoint("panels/"));
        while let Some(current) = url {
            let page: PanelListResponse = self.get_json(&current).await?;
            panels.extend(page.results.into_iter().filter(PanelSummary::is_kidney_relevant));
            url = page.next;
        }
        Ok(panels)
    }

    async fn load_all(&self) -> Result<Vec<RawEvidence>, NephroError> {
        let panels = self.kidney_panels().await?;
        let mut per_gene: BTreeMap<String, PanelAppEvidence> = BTreeMap::new();

        for panel in &panels {
            let detail: PanelDetail = self
                .get_json(&self.endpoint(&format!("panels/{}/", panel.id)))
                .await?;
            for gene in detail.genes {
                let symbol = gene.gene_data.gene_symbol.trim().to_uppercase();
                if symbol.is_empty() {
                    continue;
                }
                let entry = per_gene.entry(symbol).or_insert_with(|| PanelAppEvidence {
                    panels: Vec::new(),
                    evidence_levels: Vec::new(),
                    modes_of_inheritance: Vec::new(),
                    phenotypes: Vec::new(),
                    panel_count: 0,
                });
                entry.panels.push(PanelMembership {
                    panel_id: panel.id,
                    panel_name: panel.name.clone(),
                    evidence_level: gene.confidence_level.clone(),
                });
                push_unique(&mut entry.evidence_levels, gene.confidence_level);
                if let Some(moi) = gene.mode_of_inheritance {
                    push_unique(&mut entry.modes_of_inheritance, moi);
                }
                for phenotype in gene.phenotypes {
                    push_unique(&mut entry.phenotypes, phenotype);
                }
            }
        }

        Ok(per_gene
            .into_iter()
            .map(|(symbol, mut evidence)| {
                evidence.panel_count = evidence.panels.len() as u32;
                RawEvidence {
                    gene_identifier: symbol,
                    evidence_data: EvidenceData::PanelApp(evidence),
                }
            })
            .collect())
    }
}

fn push_unique(values: &mut Vec<String>, value: String) {
    let value = value.trim().to_string();
    if !value.is_empty() && !values.contains(&value) {
        values.push(value);
    }
}

#[async_trait]
impl SourceAdapter for PanelAppAdapter {
    fn name(&self) -> SourceName {
        SourceName::PanelApp
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
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mock_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/panels/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "count": 2,
                "next": null,
                "results": [
                    {"id": 234, "name": "Cystic kidney disease", "disease_group": "Renal and urinary tract"},
                    {"id": 90, "name": "Cardiac arrhythmia", "disease_group": "Cardiovascular"}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/panels/234/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "genes": [
                    {
                        "gene_data": {"gene_symbol": "PKD1"},
                        "confidence_level": "3",
                        "mode_of_inheritance": "MONOALLELIC",
                        "phenotypes": ["Polycystic kidney disease"]
                    },
                    {
                        "gene_data": {"gene_symbol": "PKD2"},
                        "confidence_level": "2",
                        "mode_of_inheritance": "MONOALLELIC",
                        "phenotypes": []
                    }
                ]
            })))
            .mount(&server)
            .await;
        server
    }

    #[test]
    fn kidney_relevance_matches_name_and_disease_group() {
        let relevant = PanelSummary {
            id: 1,
            name: "CAKUT".into(),
            disease_group: None,
            relevant_disorders: vec![],
        };
        assert!(relevant.is_kidney_relevant());

        let by_group = PanelSummary {
            id: 2,
            name: "Something".into(),
            disease_group: Some("Renal and urinary tract disorders".into()),
            relevant_disorders: vec![],
        };
        assert!(by_group.is_kidney_relevant());

        let irrelevant = PanelSummary {
            id: 3,
            name: "Cardiac arrhythmia".into(),
            disease_group: Some("Cardiovascular".into()),
            relevant_disorders: vec![],
        };
        assert!(!irrelevant.is_kidney_relevant());
    }

    #[tokio::test]
    async fn aggregates_panel_memberships_per_gene() {
        let server = mock_server().await;
        let adapter = PanelAppAdapter::new_for_test(server.uri()).unwrap();
        let page = adapter.fetch_page(0).await.unwrap();

        assert_eq!(page.records.len(), 2);
        assert_eq!(page.total_pages, Some(1));
        assert!(!page.has_more);

        let pkd1 = page
            .records
            .iter()
            .find(|r| r.gene_identifier == "PKD1")
            .unwrap();
        let EvidenceData::PanelApp(evidence) = &pkd1.evidence_data else {
            panic!("wrong variant");
        };
        assert_eq!(evidence.panel_count, 1);
        assert_eq!(evidence.green_panel_count(), 1);
        assert_eq!(evidence.panels[0].panel_name, "Cystic kidney disease");
        assert_eq!(evidence.modes_of_inheritance, vec!["MONOALLELIC"]);
    }

    #[tokio::test]
    async fn out_of_scope_panels_are_never_fetched() {
        let server = mock_server().await;
        let adapter = PanelAppAdapter::new_for_test(server.uri()).unwrap();
        // Panel 90 has no mock; fetching it would 404 and fail the run.
        let page = adapter.fetch_page(0).await.unwrap();
        assert!(page.records.iter().all(|r| {
            let EvidenceData::PanelApp(e) = &r.evidence_data else {
                return false;
            };
            e.panels.iter().all(|p| p.panel_id == 234)
        }));
    }
}
