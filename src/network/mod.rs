//! Protein-interaction network analysis.
//!
//! Builds a weighted undirected graph for a selected gene set from the
//! persisted STRING annotations, clusters it, and runs enrichment. All
//! three operations cache under the `network_analysis` namespace with
//! keys derived from the sorted gene id list, so two requests differing
//! only in list order share one entry.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use petgraph::graph::{NodeIndex, UnGraph};
use serde::{Deserialize, Serialize};

use crate::cache::{CacheManager, hashed_key};
use crate::entities::SourceName;
use crate::entities::evidence::EvidenceData;
use crate::error::NephroError;
use crate::store::Store;

pub mod cluster;
pub mod enrich;
pub mod stats;

pub use cluster::{ClusterAlgorithm, ClusterOutcome};
pub use enrich::{EnrichmentRow, HpoEnrichment};

const NAMESPACE: &str = "network_analysis";
const BUILD_TTL: Duration = Duration::from_secs(3600);
const ENRICH_TTL: Duration = Duration::from_secs(1800);

pub const MAX_GENES: usize = 2000;
pub const MIN_STRING_SCORE: u32 = 150;
pub const MAX_STRING_SCORE: u32 = 999;

/// A network-build request. Gene ids are sorted and deduplicated on
/// construction so the cache key is order-independent by design.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkRequest {
    pub gene_ids: Vec<i64>,
    pub min_string_score: u32,
    #[serde(default)]
    pub cluster_algorithm: ClusterAlgorithm,
}

impl NetworkRequest {
    pub fn new(
        mut gene_ids: Vec<i64>,
        min_string_score: u32,
        cluster_algorithm: ClusterAlgorithm,
    ) -> Result<Self, NephroError> {
        gene_ids.sort_unstable();
        gene_ids.dedup();
        if gene_ids.is_empty() {
            return Err(NephroError::InvalidArgument(
                "network requests need at least one gene id".into(),
            ));
        }
        if gene_ids.len() > MAX_GENES {
            return Err(NephroError::InvalidArgument(format!(
                "network requests accept at most {MAX_GENES} genes, got {}",
                gene_ids.len()
            )));
        }
        if !(MIN_STRING_SCORE..=MAX_STRING_SCORE).contains(&min_string_score) {
            return Err(NephroError::InvalidArgument(format!(
                "min_string_score must lie in [{MIN_STRING_SCORE}, {MAX_STRING_SCORE}], got {min_string_score}"
            )));
        }
        Ok(NetworkRequest {
            gene_ids,
            min_string_score,
            cluster_algorithm,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkNode {
    pub gene_id: i64,
    pub symbol: String,
    pub degree: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkEdge {
    pub source: i64,
    pub target: i64,
    /// STRING combined score scaled to [0, 1].
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkGraph {
    pub nodes: Vec<NetworkNode>,
    pub edges: Vec<NetworkEdge>,
    pub min_string_score: u32,
}

impl NetworkGraph {
    /// Rebuilds the in-memory petgraph structure. The graph is built per
    /// request and never shared mutable.
    pub fn to_graph(&self) -> UnGraph<i64, f64> {
        let mut graph = UnGraph::new_undirected();
        let mut index: HashMap<i64, NodeIndex> = HashMap::new();
        for node in &self.nodes {
            index.insert(node.gene_id, graph.add_node(node.gene_id));
        }
        for edge in &self.edges {
            if let (Some(a), Some(b)) = (index.get(&edge.source), index.get(&edge.target)) {
                graph.add_edge(*a, *b, edge.weight);
            }
        }
        graph
    }
}

pub struct NetworkService {
    store: Arc<Store>,
    cache: Arc<CacheManager>,
}

impl NetworkService {
    pub fn new(store: Arc<Store>, cache: Arc<CacheManager>) -> Self {
        NetworkService { store, cache }
    }

    /// Builds the interaction graph for the request's gene set: STRING
    /// edges between selected genes at or above the confidence
    /// threshold, weight = score / 1000.
    pub fn build(&self, request: &NetworkRequest) -> Result<NetworkGraph, NephroError> {
        let key = hashed_key(&("build", &request.gene_ids, request.min_string_score));
        if let Some(cached) = self.cache.get_json(NAMESPACE, &key)? {
            return Ok(cached);
        }

        let selected: BTreeMap<i64, String> = request
            .gene_ids
            .iter()
            .filter_map(|id| {
                self.store
                    .gene_by_id(*id)
                    .ok()
                    .flatten()
                    .map(|gene| (*id, gene.approved_symbol))
            })
            .collect();
        let by_symbol: HashMap<String, i64> = selected
            .iter()
            .map(|(id, symbol)| (symbol.to_uppercase(), *id))
            .collect();

        let mut degree: BTreeMap<i64, u32> = selected.keys().map(|id| (*id, 0)).collect();
        let mut edges = Vec::new();
        for (gene_id, data) in self.store.annotations_by_source(SourceName::StringPpi)? {
            if !selected.contains_key(&gene_id) {
                continue;
            }
            let EvidenceData::StringPpi(evidence) = data else {
                continue;
            };
            for interaction in &evidence.interactions {
                if interaction.string_score < request.min_string_score {
                    continue;
                }
                let partner_id = interaction
                    .partner_gene_id
                    .filter(|id| selected.contains_key(id))
                    .or_else(|| {
                        by_symbol
                            .get(&interaction.partner_symbol.to_uppercase())
                            .copied()
                    });
                let Some(partner_id) = partner_id else {
                    continue;
                };
                // Each undirected pair appears once, from its smaller
                // endpoint.
                if partner_id <= gene_id {
                    continue;
                }
                edges.push(NetworkEdge {
                    source: gene_id,
                    target: partner_id,
                    weight: f64::from(interaction.string_score) / 1000.0,
                });
                *degree.entry(gene_id).or_insert(0) += 1;
                *degree.entry(partner_id).or_insert(0) += 1;
            }
        }
        edges.sort_by(|x, y| (x.source, x.target).cmp(&(y.source, y.target)));

        let nodes = selected
            .into_iter()
            .map(|(gene_id, symbol)| NetworkNode {
                gene_id,
                symbol,
                degree: degree.get(&gene_id).copied().unwrap_or(0),
            })
            .collect();

        let graph = NetworkGraph {
            nodes,
            edges,
            min_string_score: request.min_string_score,
        };
        self.cache
            .put_json_with_ttl(NAMESPACE, &key, &graph, BUILD_TTL)?;
        Ok(graph)
    }

    /// Clusters the built graph. The clustering itself is CPU-bound and
    /// runs on the blocking pool.
    pub async fn cluster(&self, request: &NetworkRequest) -> Result<ClusterOutcome, NephroError> {
        let key = hashed_key(&(
            "cluster",
            &request.gene_ids,
            request.min_string_score,
            request.cluster_algorithm.as_str(),
        ));
        if let Some(cached) = self.cache.get_json(NAMESPACE, &key)? {
            return Ok(cached);
        }

        let network = self.build(request)?;
        let algorithm = request.cluster_algorithm;
        let outcome = tokio::task::spawn_blocking(move || {
            let graph = network.to_graph();
            cluster::cluster(&graph, algorithm)
        })
        .await
        .map_err(|err| NephroError::Api {
            api: "network".into(),
            message: format!("clustering task failed: {err}"),
        })?;

        self.cache
            .put_json_with_ttl(NAMESPACE, &key, &outcome, BUILD_TTL)?;
        Ok(outcome)
    }

    /// HPO over-representation for the request's gene set.
    pub async fn enrich_hpo(
        &self,
        request: &NetworkRequest,
        use_kidney_only: bool,
        fdr_threshold: f64,
    ) -> Result<HpoEnrichment, NephroError> {
        let key = hashed_key(&(
            "enrich_hpo",
            &request.gene_ids,
            use_kidney_only,
            format!("{fdr_threshold:.4}"),
        ));
        if let Some(cached) = self.cache.get_json(NAMESPACE, &key)? {
            return Ok(cached);
        }

        let store = self.store.clone();
        let gene_ids = request.gene_ids.clone();
        let enrichment = tokio::task::spawn_blocking(move || {
            enrich::enrich_hpo(&store, &gene_ids, use_kidney_only, fdr_threshold)
        })
        .await
        .map_err(|err| NephroError::Api {
            api: "network".into(),
            message: format!("enrichment task failed: {err}"),
        })??;

        self.cache
            .put_json_with_ttl(NAMESPACE, &key, &enrichment, ENRICH_TTL)?;
        Ok(enrichment)
    }

    /// GO/KEGG enrichment through the external API. Upstream failures
    /// yield an empty list, never an error.
    pub async fn enrich_external(
        &self,
        request: &NetworkRequest,
        library: &str,
    ) -> Result<Vec<enrich::ExternalEnrichmentRow>, NephroError> {
        let key = hashed_key(&("enrich_external", &request.gene_ids, library));
        if let Some(cached) = self.cache.get_json(NAMESPACE, &key)? {
            return Ok(cached);
        }

        let mut symbols = Vec::new();
        for id in &request.gene_ids {
            if let Some(gene) = self.store.gene_by_id(*id)? {
                symbols.push(gene.approved_symbol);
            }
        }
        let client = enrich::EnrichrClient::new()?;
        let rows = client.enrich(&symbols, library).await;

        self.cache
            .put_json_with_ttl(NAMESPACE, &key, &rows, ENRICH_TTL)?;
        Ok(rows)
    }
}
