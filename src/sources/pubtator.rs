//! PubTator3 literature-mining adapter.
//!
//! Streams relevance-sorted publication pages for the kidney-disease
//! query, pulls gene annotations for each page via the BioC export, and
//! folds them into per-gene publication evidence. `full` and `smart`
//! runs walk the identical page sequence — the search API sorts by
//! relevance score descending — so an incremental run always visits a
//! prefix of what a full run persisted.

use std::borrow::Cow;
use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::entities::SourceName;
use crate::entities::evidence::{
    EvidenceData, PubTatorEvidence, PublicationMention, RawEvidence,
};
use crate::error::NephroError;
use crate::sources::{FetchedPage, SourceAdapter};

const PUBTATOR_BASE: &str = "https://www.ncbi.nlm.nih.gov/research/pubtator3-api";
const PUBTATOR_API: &str = "pubtator";
const PUBTATOR_BASE_ENV: &str = "NEPHRODB_PUBTATOR_BASE";
const PUBTATOR_QUERY_ENV: &str = "NEPHRODB_PUBTATOR_QUERY";

/// Entity-normalized disease query; relevance ordering is the API
/// default for text search.
const DEFAULT_QUERY: &str = "\"kidney disease\"";
const PAGE_SIZE: u32 = 100;

pub struct PubTatorAdapter {
    client: reqwest_middleware::ClientWithMiddleware,
    base: Cow<'static, str>,
    query: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
    #[serde(default)]
    total_pages: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    pmid: Value,
}

impl SearchResult {
    fn pmid_string(&self) -> Option<String> {
        match &self.pmid {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

impl PubTatorAdapter {
    pub fn new() -> Result<Self, NephroError> {
        Ok(Self {
            client: crate::sources::shared_client()?,
            base: crate::sources::env_base(PUBTATOR_BASE, PUBTATOR_BASE_ENV),
            query: std::env::var(PUBTATOR_QUERY_ENV).unwrap_or_else(|_| DEFAULT_QUERY.to_string()),
        })
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(base: String) -> Result<Self, NephroError> {
        Ok(Self {
            client: crate::sources::shared_client()?,
            base: Cow::Owned(base),
            query: DEFAULT_QUERY.to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base.as_ref().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, query: &[(&str, String)]) -> Result<T, NephroError> {
        crate::sources::rate_limit::wait_for_url_str(url).await;
        let req = self.client.get(url).query(query);
        let resp = crate::sources::apply_cache_mode(req).send().await?;
        crate::sources::check_rate_limited(PUBTATOR_API, &resp)?;
        let status = resp.status();
        let bytes = crate::sources::read_limited_body(resp, PUBTATOR_API).await?;
        if !status.is_success() {
            let excerpt = crate::sources::body_excerpt(&bytes);
            return Err(NephroError::Api {
                api: PUBTATOR_API.to_string(),
                message: format!("HTTP {status}: {excerpt}"),
            });
        }
        serde_json::from_slice(&bytes).map_err(|source| NephroError::ApiJson {
            api: PUBTATOR_API.to_string(),
            source,
        })
    }

    async fn search_page(&self, page: u64) -> Result<SearchResponse, NephroError> {
        let url = self.endpoint("search/");
        self.get_json(
            &url,
            &[
                ("text", self.query.clone()),
                // The API pages from 1.
                ("page", (page + 1).to_string()),
                ("page_size", PAGE_SIZE.to_string()),
            ],
        )
        .await
    }

    async fn export_annotations(&self, pmids: &[String]) -> Result<Value, NephroError> {
        let url = self.endpoint("publications/export/biocjson");
        self.get_json(&url, &[("pmids", pmids.join(","))]).await
    }
}

#[async_trait]
impl SourceAdapter for PubTatorAdapter {
    fn name(&self) -> SourceName {
        SourceName::PubTator
    }

    fn supports_incremental(&self) -> bool {
        true
    }

    fn rate_limit_hosts(&self) -> Vec<String> {
        vec![crate::sources::rate_limit::host_of(self.base.as_ref())]
    }

    async fn fetch_page(&self, page: u64) -> Result<FetchedPage, NephroError> {
        let search = self.search_page(page).await?;
        let pmids: Vec<String> = search
            .results
            .iter()
            .filter_map(SearchResult::pmid_string)
            .collect();

        let records = if pmids.is_empty() {
            Vec::new()
        } else {
            let export = self.export_annotations(&pmids).await?;
            gene_evidence_from_export(&export)
        };

        let has_more = match search.total_pages {
            Some(total) => page + 1 < total,
            None => !pmids.is_empty(),
        };
        Ok(FetchedPage {
            records,
            page,
            total_pages: search.total_pages,
            dedup_ids: pmids,
            has_more,
        })
    }

    /// Publication evidence accumulates across pages and runs: the new
    /// page's PMIDs union into whatever is already persisted.
    fn merge_existing(&self, new: EvidenceData, existing: EvidenceData) -> EvidenceData {
        match (new, existing) {
            (EvidenceData::PubTator(new), EvidenceData::PubTator(existing)) => {
                EvidenceData::PubTator(merge_pubtator(new, existing))
            }
            (new, _) => new,
        }
    }
}

pub(crate) fn merge_pubtator(new: PubTatorEvidence, existing: PubTatorEvidence) -> PubTatorEvidence {
    let mut mentions: BTreeMap<String, u32> = existing
        .mentions
        .into_iter()
        .map(|m| (m.pmid, m.mention_count))
        .collect();
    for pmid in &existing.pmids {
        mentions.entry(pmid.clone()).or_insert(0);
    }
    for mention in new.mentions {
        *mentions.entry(mention.pmid).or_insert(0) += mention.mention_count;
    }
    for pmid in &new.pmids {
        mentions.entry(pmid.clone()).or_insert(0);
    }

    let pmids: Vec<String> = mentions.keys().cloned().collect();
    let total_mentions = mentions.values().sum();
    PubTatorEvidence {
        publication_count: pmids.len() as u32,
        total_mentions,
        mentions: mentions
            .into_iter()
            .map(|(pmid, mention_count)| PublicationMention {
                pmid,
                mention_count,
            })
            .collect(),
        pmids,
    }
}

/// Walks a BioC export and produces one evidence record per gene symbol
/// annotated on the page. The export shape nests documents → passages →
/// annotations; gene annotations carry `infons.type == "Gene"`.
fn gene_evidence_from_export(export: &Value) -> Vec<RawEvidence> {
    let documents = export
        .get("PubTator3")
        .or_else(|| export.get("documents"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_else(|| match export {
            Value::Array(docs) => docs.clone(),
            _ => Vec::new(),
        });

    // gene symbol → (pmid → mention count)
    let mut per_gene: BTreeMap<String, BTreeMap<String, u32>> = BTreeMap::new();
    for doc in &documents {
        let Some(pmid) = doc
            .get("pmid")
            .map(pmid_value_to_string)
            .or_else(|| doc.get("id").map(pmid_value_to_string))
            .filter(|p| !p.is_empty())
        else {
            continue;
        };
        let passages = doc.get("passages").and_then(Value::as_array);
        for passage in passages.into_iter().flatten() {
            let annotations = passage.get("annotations").and_then(Value::as_array);
            for annotation in annotations.into_iter().flatten() {
                let is_gene = annotation
                    .pointer("/infons/type")
                    .and_then(Value::as_str)
                    .is_some_and(|t| t.eq_ignore_ascii_case("gene"));
                if !is_gene {
                    continue;
                }
                let Some(symbol) = annotation
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                else {
                    continue;
                };
                *per_gene
                    .entry(symbol.to_uppercase())
                    .or_default()
                    .entry(pmid.clone())
                    .or_insert(0) += 1;
            }
        }
    }

    per_gene
        .into_iter()
        .map(|(symbol, by_pmid)| {
            let pmids: Vec<String> = by_pmid.keys().cloned().collect();
            let total_mentions = by_pmid.values().sum();
            RawEvidence {
                gene_identifier: symbol,
                evidence_data: EvidenceData::PubTator(PubTatorEvidence {
                    publication_count: pmids.len() as u32,
                    total_mentions,
                    mentions: by_pmid
                        .into_iter()
                        .map(|(pmid, mention_count)| PublicationMention {
                            pmid,
                            mention_count,
                        })
                        .collect(),
                    pmids,
                }),
            }
        })
        .collect()
}

fn pmid_value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn export_fixture() -> Value {
        serde_json::json!({
            "PubTator3": [
                {
                    "pmid": 31394774,
                    "passages": [
                        {
                            "annotations": [
                                {"text": "PKD1", "infons": {"type": "Gene", "identifier": "5310"}},
                                {"text": "PKD1", "infons": {"type": "Gene", "identifier": "5310"}},
                                {"text": "cystic kidney", "infons": {"type": "Disease"}}
                            ]
                        }
                    ]
                },
                {
                    "pmid": 31394775,
                    "passages": [
                        {
                            "annotations": [
                                {"text": "pkd1", "infons": {"type": "Gene"}},
                                {"text": "UMOD", "infons": {"type": "Gene"}}
                            ]
                        }
                    ]
                }
            ]
        })
    }

    #[test]
    fn export_parses_gene_mentions_per_symbol() {
        let records = gene_evidence_from_export(&export_fixture());
        assert_eq!(records.len(), 2);

        let pkd1 = records
            .iter()
            .find(|r| r.gene_identifier == "PKD1")
            .unwrap();
        let EvidenceData::PubTator(evidence) = &pkd1.evidence_data else {
            panic!("wrong variant");
        };
        assert_eq!(evidence.publication_count, 2);
        assert_eq!(evidence.total_mentions, 3);
        assert_eq!(evidence.pmids, vec!["31394774", "31394775"]);
    }

    #[test]
    fn export_ignores_non_gene_annotations() {
        let records = gene_evidence_from_export(&export_fixture());
        assert!(records.iter().all(|r| r.gene_identifier != "CYSTIC KIDNEY"));
    }

    #[test]
    fn merge_unions_pmids_and_keeps_counts() {
        let existing = PubTatorEvidence {
            pmids: vec!["1".into(), "2".into()],
            publication_count: 2,
            total_mentions: 4,
            mentions: vec![
                PublicationMention { pmid: "1".into(), mention_count: 3 },
                PublicationMention { pmid: "2".into(), mention_count: 1 },
            ],
        };
        let new = PubTatorEvidence {
            pmids: vec!["2".into(), "3".into()],
            publication_count: 2,
            total_mentions: 3,
            mentions: vec![
                PublicationMention { pmid: "2".into(), mention_count: 2 },
                PublicationMention { pmid: "3".into(), mention_count: 1 },
            ],
        };
        let merged = merge_pubtator(new, existing);
        assert_eq!(merged.pmids, vec!["1", "2", "3"]);
        assert_eq!(merged.publication_count, 3);
        assert_eq!(merged.total_mentions, 7);
    }

    #[test]
    fn merge_is_idempotent_for_replayed_pages() {
        let page = PubTatorEvidence {
            pmids: vec!["1".into()],
            publication_count: 1,
            total_mentions: 0,
            mentions: vec![],
        };
        let once = merge_pubtator(page.clone(), page.clone());
        assert_eq!(once.pmids, vec!["1"]);
        assert_eq!(once.publication_count, 1);
    }

    #[tokio::test]
    async fn fetch_page_reports_dedup_ids_and_pagination() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search/"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [
                    {"pmid": 31394774, "score": 41.2},
                    {"pmid": 31394775, "score": 37.9}
                ],
                "total_pages": 3
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/publications/export/biocjson"))
            .respond_with(ResponseTemplate::new(200).set_body_json(export_fixture()))
            .mount(&server)
            .await;

        let adapter = PubTatorAdapter::new_for_test(server.uri()).unwrap();
        let page = adapter.fetch_page(0).await.unwrap();
        assert_eq!(page.dedup_ids, vec!["31394774", "31394775"]);
        assert_eq!(page.total_pages, Some(3));
        assert!(page.has_more);
        assert_eq!(page.records.len(), 2);
    }

    #[tokio::test]
    async fn upstream_error_is_surfaced_with_excerpt() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search/"))
            .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
            .mount(&server)
            .await;

        let adapter = PubTatorAdapter::new_for_test(server.uri()).unwrap();
        let err = adapter.fetch_page(0).await.unwrap_err();
        assert!(format!("{err}").contains("pubtator"));
    }
}
