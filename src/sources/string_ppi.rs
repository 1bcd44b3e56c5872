//! STRING protein-interaction adapter.
//!
//! Ingests the bulk human edge dump plus the protein-info table mapping
//! Ensembl protein ids to preferred symbols, and aggregates a per-gene
//! interaction list. The result is written to `gene_annotations` — the
//! network engine queries it there; scoring never reads it.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};

use async_trait::async_trait;
use flate2::read::GzDecoder;

use crate::entities::SourceName;
use crate::entities::evidence::{EvidenceData, PpiInteraction, RawEvidence, StringPpiEvidence};
use crate::error::NephroError;
use crate::sources::{BulkPager, FetchedPage, SourceAdapter};

const STRING_LINKS_BASE: &str =
    "https://stringdb-downloads.org/download/protein.links.v12.0/9606.protein.links.v12.0.txt.gz";
const STRING_INFO_BASE: &str =
    "https://stringdb-downloads.org/download/protein.info.v12.0/9606.protein.info.v12.0.txt.gz";
const STRING_API: &str = "string_ppi";
const STRING_LINKS_ENV: &str = "NEPHRODB_STRING_LINKS_BASE";
const STRING_INFO_ENV: &str = "NEPHRODB_STRING_INFO_BASE";

const RECORDS_PER_PAGE: usize = 500;
/// Edges below the lowest queryable confidence threshold are not worth
/// persisting.
const MIN_STORED_SCORE: u32 = 150;

pub struct StringPpiAdapter {
    client: reqwest::Client,
    links_url: Cow<'static, str>,
    info_url: Cow<'static, str>,
    pager: BulkPager,
}

impl StringPpiAdapter {
    pub fn new() -> Result<Self, NephroError> {
        Ok(Self {
            client: crate::sources::streaming_client()?,
            links_url: crate::sources::env_base(STRING_LINKS_BASE, STRING_LINKS_ENV),
            info_url: crate::sources::env_base(STRING_INFO_BASE, STRING_INFO_ENV),
            pager: BulkPager::new(RECORDS_PER_PAGE),
        })
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(links: String, info: String) -> Result<Self, NephroError> {
        Ok(Self {
            client: crate::sources::streaming_client()?,
            links_url: Cow::Owned(links),
            info_url: Cow::Owned(info),
            pager: BulkPager::new(RECORDS_PER_PAGE),
        })
    }

    async fn load_all(&self) -> Result<Vec<RawEvidence>, NephroError> {
        let info_path =
            crate::sources::download_to_temp(&self.client, self.info_url.as_ref(), STRING_API)
                .await?;
        let links_path =
            crate::sources::download_to_temp(&self.client, self.links_url.as_ref(), STRING_API)
                .await?;
        tokio::task::spawn_blocking(move || {
            let symbols = parse_protein_info(open_maybe_gz(info_path.to_path_buf())?)?;
            let edges = parse_links(open_maybe_gz(links_path.to_path_buf())?, &symbols)?;
            Ok(aggregate(edges))
        })
        .await
        .map_err(|err| NephroError::Api {
            api: STRING_API.to_string(),
            message: format!("edge dump parse task failed: {err}"),
        })?
    }
}

fn open_maybe_gz(path: std::path::PathBuf) -> Result<Box<dyn std::io::Read>, NephroError> {
    use std::io::{Read, Seek};
    let mut file = std::fs::File::open(&path)?;
    let mut magic = [0u8; 2];
    let is_gz = file.read_exact(&mut magic).is_ok() && magic == [0x1f, 0x8b];
    file.seek(std::io::SeekFrom::Start(0))?;
    Ok(if is_gz {
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    })
}

/// `protein.info`: tab-separated `#string_protein_id  preferred_name ...`.
pub(crate) fn parse_protein_info(
    reader: impl std::io::Read,
) -> Result<BTreeMap<String, String>, NephroError> {
    let mut map = BTreeMap::new();
    for line in BufReader::new(reader).lines() {
        let line = line?;
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split('\t');
        let (Some(protein_id), Some(symbol)) = (fields.next(), fields.next()) else {
            continue;
        };
        let symbol = symbol.trim().to_uppercase();
        if !symbol.is_empty() {
            map.insert(protein_id.trim().to_string(), symbol);
        }
    }
    Ok(map)
}

/// `protein.links`: space-separated `protein1 protein2 combined_score`,
/// one header line.
pub(crate) fn parse_links(
    reader: impl std::io::Read,
    symbols: &BTreeMap<String, String>,
) -> Result<Vec<(String, String, u32)>, NephroError> {
    let mut edges = Vec::new();
    for line in BufReader::new(reader).lines() {
        let line = line?;
        if line.starts_with("protein1") || line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split_ascii_whitespace();
        let (Some(a), Some(b), Some(score)) = (fields.next(), fields.next(), fields.next()) else {
            continue;
        };
        let Ok(score) = score.parse::<u32>() else {
            continue;
        };
        if score < MIN_STORED_SCORE {
            continue;
        }
        let (Some(a), Some(b)) = (symbols.get(a), symbols.get(b)) else {
            continue;
        };
        edges.push((a.clone(), b.clone(), score));
    }
    Ok(edges)
}

fn aggregate(edges: Vec<(String, String, u32)>) -> Vec<RawEvidence> {
    let mut per_gene: BTreeMap<String, Vec<PpiInteraction>> = BTreeMap::new();
    // The dump lists each edge in both directions; one pass covers both
    // endpoints.
    for (a, b, score) in edges {
        per_gene.entry(a).or_default().push(PpiInteraction {
            partner_symbol: b,
            string_score: score,
            partner_gene_id: None,
        });
    }

    let mut weighted: Vec<(String, Vec<PpiInteraction>, f64)> = per_gene
        .into_iter()
        .map(|(symbol, mut interactions)| {
            interactions.sort_by(|x, y| {
                y.string_score
                    .cmp(&x.string_score)
                    .then(x.partner_symbol.cmp(&y.partner_symbol))
            });
            let ppi_score =
                interactions.iter().map(|i| f64::from(i.string_score)).sum::<f64>() / 1000.0;
            (symbol, interactions, ppi_score)
        })
        .collect();

    // Percentile by weighted degree across all genes in the dump.
    let mut ranked: Vec<f64> = weighted.iter().map(|(_, _, s)| *s).collect();
    ranked.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = ranked.len().max(1) as f64;

    weighted
        .drain(..)
        .map(|(symbol, interactions, ppi_score)| {
            let below = ranked.partition_point(|s| *s < ppi_score);
            let percentile = 100.0 * below as f64 / n;
            RawEvidence {
                gene_identifier: symbol,
                evidence_data: EvidenceData::StringPpi(StringPpiEvidence {
                    interaction_count: interactions.len() as u32,
                    ppi_score,
                    percentile,
                    interactions,
                }),
            }
        })
        .collect()
}

#[async_trait]
impl SourceAdapter for StringPpiAdapter {
    fn name(&self) -> SourceName {
        SourceName::StringPpi
    }

    fn rate_limit_hosts(&self) -> Vec<String> {
        let mut hosts = vec![
            crate::sources::rate_limit::host_of(self.links_url.as_ref()),
            crate::sources::rate_limit::host_of(self.info_url.as_ref()),
        ];
        hosts.dedup();
        hosts
    }

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

    fn info_fixture() -> &'static str {
        "#string_protein_id\tpreferred_name\tprotein_size\tannotation\n\
         9606.ENSP00000262304\tPKD1\t4303\tpolycystin 1\n\
         9606.ENSP00000237596\tPKD2\t968\tpolycystin 2\n\
         9606.ENSP00000328911\tUMOD\t640\turomodulin\n"
    }

    fn links_fixture() -> &'static str {
        "protein1 protein2 combined_score\n\
         9606.ENSP00000262304 9606.ENSP00000237596 999\n\
         9606.ENSP00000237596 9606.ENSP00000262304 999\n\
         9606.ENSP00000262304 9606.ENSP00000328911 400\n\
         9606.ENSP00000328911 9606.ENSP00000262304 400\n\
         9606.ENSP00000237596 9606.ENSP00000328911 120\n"
    }

    #[test]
    fn info_maps_protein_ids_to_symbols() {
        let map = parse_protein_info(info_fixture().as_bytes()).unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map["9606.ENSP00000262304"], "PKD1");
    }

    #[test]
    fn links_below_minimum_score_are_dropped() {
        let symbols = parse_protein_info(info_fixture().as_bytes()).unwrap();
        let edges = parse_links(links_fixture().as_bytes(), &symbols).unwrap();
        // The 120-score edge is gone; both directions of the others stay.
        assert_eq!(edges.len(), 4);
    }

    #[test]
    fn aggregation_orders_interactions_by_score() {
        let symbols = parse_protein_info(info_fixture().as_bytes()).unwrap();
        let edges = parse_links(links_fixture().as_bytes(), &symbols).unwrap();
        let records = aggregate(edges);
        assert_eq!(records.len(), 3);

        let pkd1 = records
            .iter()
            .find(|r| r.gene_identifier == "PKD1")
            .unwrap();
        let EvidenceData::StringPpi(evidence) = &pkd1.evidence_data else {
            panic!("wrong variant");
        };
        assert_eq!(evidence.interaction_count, 2);
        assert_eq!(evidence.interactions[0].partner_symbol, "PKD2");
        assert_eq!(evidence.interactions[0].string_score, 999);
        assert!((evidence.ppi_score - 1.399).abs() < 1e-9);
        // Highest weighted degree sits at the top percentile band.
        let max_percentile = records
            .iter()
            .map(|r| {
                let EvidenceData::StringPpi(e) = &r.evidence_data else {
                    unreachable!()
                };
                e.percentile
            })
            .fold(0.0f64, f64::max);
        assert!((evidence.percentile - max_percentile).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn fetch_page_joins_both_dumps() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/links"))
            .respond_with(ResponseTemplate::new(200).set_body_string(links_fixture()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/info"))
            .respond_with(ResponseTemplate::new(200).set_body_string(info_fixture()))
            .mount(&server)
            .await;

        let adapter = StringPpiAdapter::new_for_test(
            format!("{}/links", server.uri()),
            format!("{}/info", server.uri()),
        )
        .unwrap();
        let page = adapter.fetch_page(0).await.unwrap();
        assert_eq!(page.records.len(), 3);
    }
}
