//! Top-level CLI parsing and command execution.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::cache::CacheManager;
use crate::config::AppConfig;
use crate::entities::{SourceName, StagingStatus};
use crate::entities::progress::{SourceProgress, UpdateMode};
use crate::entities::score::EvidenceTier;
use crate::error::NephroError;
use crate::network::{ClusterAlgorithm, NetworkRequest, NetworkService};
use crate::pipeline::Pipeline;
use crate::query::{GeneFilters, GeneListResponse, QueryService, Sort, SortField};
use crate::sources::SourceRegistry;
use crate::store::Store;

pub mod health;

#[derive(Parser, Debug)]
#[command(
    name = "nephrodb",
    about = "Kidney-genetics curation platform: ingest gene-disease evidence, score it, query it, and analyze interaction networks",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output as JSON instead of Markdown
    #[arg(short, long, global = true)]
    pub json: bool,

    /// Disable HTTP caching (always fetch fresh data)
    #[arg(long, global = true)]
    pub no_cache: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ingestion pipeline control
    Ingest {
        #[command(subcommand)]
        cmd: IngestCommand,
    },
    /// Gene listing and filter metadata
    Genes {
        #[command(subcommand)]
        cmd: GenesCommand,
    },
    /// Interaction-network analysis
    Network {
        #[command(subcommand)]
        cmd: NetworkCommand,
    },
    /// Cache administration
    Cache {
        #[command(subcommand)]
        cmd: CacheCommand,
    },
    /// Refresh the HGNC snapshot
    Hgnc {
        #[command(subcommand)]
        cmd: HgncCommand,
    },
    /// Resolve a gene identifier to its canonical gene
    Normalize {
        /// Symbol, alias, previous symbol, or HGNC id
        identifier: String,
    },
    /// Review normalization staging rows
    Staging {
        /// pending, resolved, or unresolvable
        #[arg(long, default_value = "pending")]
        status: String,
    },
    /// Check external API connectivity
    Health,
}

#[derive(Subcommand, Debug)]
pub enum IngestCommand {
    /// Trigger an ingestion run for one source
    Trigger {
        /// Source name (panelapp, clingen, gencc, hpo, clinvar, pubtator, string_ppi)
        source: String,
        /// full, smart, update_failed, update_new, or update_missing
        #[arg(long, default_value = "smart")]
        mode: String,
    },
    /// Request cooperative suspension of a running source
    Pause { source: String },
    /// Resume a paused source from its checkpoint
    Resume { source: String },
    /// Show per-source run state
    Status,
    /// Ingest an uploaded panels or literature file
    Upload {
        /// diagnostic_panels or literature
        kind: String,
        /// JSON, CSV, or TSV file
        file: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
pub enum GenesCommand {
    /// List genes with filters, sorting, and pagination
    List {
        /// Substring match on symbol or alias
        #[arg(short, long)]
        query: Option<String>,
        #[arg(long)]
        min_score: Option<f64>,
        #[arg(long)]
        max_score: Option<f64>,
        #[arg(long)]
        min_evidence: Option<u32>,
        #[arg(long)]
        max_evidence: Option<u32>,
        /// Filter to genes with evidence from these sources (repeatable)
        #[arg(long = "source")]
        sources: Vec<String>,
        /// Filter to these evidence tiers (repeatable, OR semantics)
        #[arg(long = "tier")]
        tiers: Vec<String>,
        /// Include zero-score (insufficient) genes
        #[arg(long)]
        include_zero: bool,
        /// Comma-separated explicit gene ids (capped at 1000)
        #[arg(long)]
        ids: Option<String>,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long)]
        page_size: Option<u32>,
        /// approved_symbol, percentage_score, or evidence_count
        #[arg(long, default_value = "percentage_score")]
        sort: String,
        /// Sort ascending instead of descending
        #[arg(long)]
        asc: bool,
    },
    /// Show filter metadata (sources, tiers, counts)
    Metadata,
}

#[derive(clap::Args, Debug)]
pub struct NetworkSelection {
    /// Comma-separated gene ids; omit to select genes by filter
    #[arg(long)]
    ids: Option<String>,
    /// Minimum composite score when selecting by filter
    #[arg(long)]
    min_score: Option<f64>,
    /// Tier filter when selecting by filter (repeatable)
    #[arg(long = "tier")]
    tiers: Vec<String>,
    /// STRING confidence threshold, 150..=999
    #[arg(long, default_value_t = 400)]
    min_string_score: u32,
}

#[derive(Subcommand, Debug)]
pub enum NetworkCommand {
    /// Build the interaction graph for a gene set
    Build {
        #[command(flatten)]
        selection: NetworkSelection,
    },
    /// Cluster the interaction graph
    Cluster {
        #[command(flatten)]
        selection: NetworkSelection,
        /// leiden, louvain, or walktrap
        #[arg(long, default_value = "leiden")]
        algorithm: String,
    },
    /// HPO over-representation for a gene set
    EnrichHpo {
        #[command(flatten)]
        selection: NetworkSelection,
        /// Test against the full phenotype lists instead of the kidney subset
        #[arg(long)]
        all_phenotypes: bool,
        #[arg(long, default_value_t = crate::network::enrich::DEFAULT_FDR_THRESHOLD)]
        fdr: f64,
    },
    /// GO/KEGG enrichment through the external API
    EnrichGo {
        #[command(flatten)]
        selection: NetworkSelection,
        /// Enrichr library name
        #[arg(long, default_value = "GO_Biological_Process_2025")]
        library: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    /// Per-namespace entry and access counters
    Stats {
        /// One namespace; omit for all registered namespaces
        namespace: Option<String>,
    },
    /// Drop cache entries
    Purge {
        namespace: Option<String>,
        /// Purge one hashed key within the namespace
        #[arg(long)]
        key: Option<String>,
        /// Purge every namespace
        #[arg(long)]
        all: bool,
    },
    /// List registered namespaces
    Health,
}

#[derive(Subcommand, Debug)]
pub enum HgncCommand {
    /// Download and apply the current HGNC complete set
    Refresh,
}

/// Everything a command needs, opened once per invocation.
struct AppContext {
    config: AppConfig,
    store: Arc<Store>,
    cache: Arc<CacheManager>,
}

impl AppContext {
    fn open() -> Result<Self, NephroError> {
        let config = AppConfig::load()?;
        let store = Arc::new(Store::open(
            &config.store.resolve_path(),
            config.store.slow_query_ms,
        )?);
        let cache = Arc::new(CacheManager::new(store.clone(), &config));
        Ok(AppContext {
            config,
            store,
            cache,
        })
    }

    fn registry(&self) -> Result<Arc<SourceRegistry>, NephroError> {
        let mut registry = SourceRegistry::new();
        registry.register(Arc::new(crate::sources::panelapp::PanelAppAdapter::new()?));
        registry.register(Arc::new(crate::sources::clingen::ClinGenAdapter::new()?));
        registry.register(Arc::new(crate::sources::gencc::GenCcAdapter::new()?));
        registry.register(Arc::new(crate::sources::hpo::HpoAdapter::new()?));
        registry.register(Arc::new(crate::sources::clinvar::ClinVarAdapter::new()?));
        registry.register(Arc::new(crate::sources::pubtator::PubTatorAdapter::new()?));
        registry.register(Arc::new(crate::sources::string_ppi::StringPpiAdapter::new()?));
        Ok(Arc::new(registry))
    }

    fn pipeline(&self) -> Result<Pipeline, NephroError> {
        Pipeline::new(
            self.store.clone(),
            self.cache.clone(),
            self.registry()?,
            self.config.clone(),
        )
    }

    fn query(&self) -> QueryService {
        QueryService::new(
            self.store.clone(),
            self.cache.clone(),
            self.config.api_defaults.clone(),
        )
    }

    fn network(&self) -> NetworkService {
        NetworkService::new(self.store.clone(), self.cache.clone())
    }

    fn network_request(
        &self,
        selection: &NetworkSelection,
        algorithm: ClusterAlgorithm,
    ) -> Result<NetworkRequest, NephroError> {
        let gene_ids = match &selection.ids {
            Some(raw) => parse_id_list(raw)?,
            None => {
                let mut filters = GeneFilters::default();
                filters.min_score = selection.min_score;
                filters.tiers = parse_tiers(&selection.tiers)?;
                self.query()
                    .filtered_gene_ids(&filters, crate::network::MAX_GENES)?
            }
        };
        NetworkRequest::new(gene_ids, selection.min_string_score, algorithm)
    }
}

fn parse_id_list(raw: &str) -> Result<Vec<i64>, NephroError> {
    raw.split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| {
            v.parse::<i64>().map_err(|_| {
                NephroError::InvalidArgument(format!("'{v}' is not a valid gene id"))
            })
        })
        .collect()
}

fn parse_tiers(raw: &[String]) -> Result<Vec<EvidenceTier>, NephroError> {
    raw.iter()
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(EvidenceTier::from_flag)
        .collect()
}

fn parse_sources(raw: &[String]) -> Result<Vec<SourceName>, NephroError> {
    raw.iter()
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(SourceName::from_flag)
        .collect()
}

fn render<T: serde::Serialize>(json: bool, value: &T, markdown: impl FnOnce() -> String) -> String {
    if json {
        serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
    } else {
        markdown()
    }
}

fn gene_list_markdown(response: &GeneListResponse) -> String {
    let mut out = String::new();
    out.push_str("| ID | Symbol | HGNC | Score | Evidence | Tier | Sources |\n");
    out.push_str("|----|--------|------|-------|----------|------|--------|\n");
    for item in &response.items {
        out.push_str(&format!(
            "| {} | {} | {} | {:.1} | {} | {} | {} |\n",
            item.id,
            item.approved_symbol,
            item.hgnc_id,
            item.percentage_score,
            item.evidence_count,
            item.evidence_tier,
            item.sources.join(", ")
        ));
    }
    out.push_str(&format!(
        "\nPage {} ({} per page), {} matching genes",
        response.page, response.page_size, response.total
    ));
    if response.hidden_zero_scores > 0 {
        out.push_str(&format!(
            ", {} zero-score genes hidden",
            response.hidden_zero_scores
        ));
    }
    out.push('\n');
    out
}

fn progress_markdown(progress: &[SourceProgress]) -> String {
    let mut out = String::new();
    out.push_str("| Source | Status | Page | Total | Items | Last heartbeat |\n");
    out.push_str("|--------|--------|------|-------|-------|----------------|\n");
    for row in progress {
        out.push_str(&format!(
            "| {} | {} | {} | {} | {} | {} |\n",
            row.source_name,
            row.status.as_str(),
            row.current_page,
            row.total_pages
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".into()),
            row.items_processed,
            row.last_heartbeat_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".into()),
        ));
    }
    for row in progress {
        if let Some(error) = &row.error_info {
            out.push_str(&format!(
                "\n{}: {} ({})\n",
                row.source_name, error.message, error.reason
            ));
        }
    }
    out
}

/// Parses raw arguments and runs the selected command.
///
/// # Errors
///
/// Returns an error when CLI args cannot be parsed or when command
/// execution fails.
pub async fn execute(mut args: Vec<String>) -> anyhow::Result<String> {
    if args.is_empty() {
        args.push("nephrodb".to_string());
    }
    let cli = Cli::try_parse_from(args)?;
    run(cli).await
}

async fn run(cli: Cli) -> anyhow::Result<String> {
    if cli.no_cache {
        crate::sources::set_no_cache(true);
    }
    let json = cli.json;

    match cli.command {
        Commands::Health => {
            let report = health::check().await?;
            Ok(render(json, &report, || report.to_markdown()))
        }
        Commands::Normalize { identifier } => {
            let ctx = AppContext::open()?;
            let normalizer = crate::normalize::HgncNormalizer::from_store(&ctx.store)?;
            let resolution = normalizer.resolve(&identifier);
            let markdown = match resolution.gene_id {
                Some(gene_id) => {
                    let gene = ctx.store.gene_by_id(gene_id)?;
                    match gene {
                        Some(gene) => format!(
                            "{identifier} -> {} ({}), confidence: {:?}\n",
                            gene.approved_symbol, gene.hgnc_id, resolution.confidence
                        ),
                        None => format!("{identifier} -> gene id {gene_id}\n"),
                    }
                }
                None => format!("{identifier}: unresolved ({:?})\n", resolution.reason),
            };
            Ok(render(json, &resolution, || markdown))
        }
        Commands::Staging { status } => {
            let ctx = AppContext::open()?;
            let status = StagingStatus::from_str(&status)?;
            let rows = ctx.store.staging_by_status(status)?;
            Ok(render(json, &rows, || {
                let mut out = String::new();
                out.push_str("| Identifier | Source | Attempts | Since |\n");
                out.push_str("|------------|--------|----------|-------|\n");
                for row in &rows {
                    out.push_str(&format!(
                        "| {} | {} | {} | {} |\n",
                        row.raw_identifier,
                        row.raw_source,
                        row.attempts,
                        row.created_at.to_rfc3339()
                    ));
                }
                out.push_str(&format!("\n{} rows\n", rows.len()));
                out
            }))
        }
        Commands::Hgnc { cmd: HgncCommand::Refresh } => {
            let ctx = AppContext::open()?;
            let outcome = crate::normalize::refresh_hgnc_snapshot(&ctx.store).await?;
            ctx.cache.purge_namespace("hgnc")?;
            Ok(render(json, &outcome, || {
                if outcome.unchanged {
                    "HGNC snapshot unchanged; no rows touched\n".to_string()
                } else {
                    format!(
                        "HGNC snapshot applied: {} created, {} updated, {} staging rows resolved\n",
                        outcome.created, outcome.updated, outcome.staging_resolved
                    )
                }
            }))
        }
        Commands::Ingest { cmd } => run_ingest(cmd, json).await,
        Commands::Genes { cmd } => run_genes(cmd, json),
        Commands::Network { cmd } => run_network(cmd, json).await,
        Commands::Cache { cmd } => run_cache(cmd, json),
    }
}

async fn run_ingest(cmd: IngestCommand, json: bool) -> anyhow::Result<String> {
    match cmd {
        IngestCommand::Trigger { source, mode } => {
            let source = SourceName::from_flag(&source)?;
            let mode = UpdateMode::from_flag(&mode)?;
            if !source.is_fetchable() {
                return Err(NephroError::InvalidArgument(format!(
                    "{source} has no upstream API; use `ingest upload`"
                ))
                .into());
            }
            let ctx = AppContext::open()?;
            let pipeline = Arc::new(ctx.pipeline()?);
            // Ctrl-C drains at the next page boundary; the run lands in
            // failed with reason cancelled.
            let watcher = tokio::spawn({
                let pipeline = pipeline.clone();
                async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        pipeline.cancel_all();
                    }
                }
            });
            let summary = pipeline.trigger(source, mode).await;
            watcher.abort();
            let summary = summary?;
            Ok(render(json, &summary, || {
                format!(
                    "{} {} run: {:?}, {} pages, {} items ({} created, {} merged, {} staged)\n",
                    summary.source,
                    summary.mode.as_str(),
                    summary.outcome,
                    summary.pages_fetched,
                    summary.items_processed,
                    summary.created,
                    summary.merged,
                    summary.staged
                )
            }))
        }
        IngestCommand::Pause { source } => {
            let source = SourceName::from_flag(&source)?;
            let ctx = AppContext::open()?;
            ctx.pipeline()?.pause(source)?;
            Ok(format!("{source} will pause at the next page boundary\n"))
        }
        IngestCommand::Resume { source } => {
            let source = SourceName::from_flag(&source)?;
            let ctx = AppContext::open()?;
            let pipeline = ctx.pipeline()?;
            let summary = pipeline.resume(source).await?;
            Ok(render(json, &summary, || {
                format!(
                    "{} resumed: {:?}, now {} items\n",
                    summary.source, summary.outcome, summary.items_processed
                )
            }))
        }
        IngestCommand::Status => {
            let ctx = AppContext::open()?;
            let pipeline = ctx.pipeline()?;
            let progress = pipeline.status_all()?;
            Ok(render(json, &progress, || progress_markdown(&progress)))
        }
        IngestCommand::Upload { kind, file } => {
            let kind = crate::sources::panels::UploadKind::from_flag(&kind)?;
            let format =
                crate::sources::panels::UploadFormat::from_path(&file.to_string_lossy());
            let raw = std::fs::read(&file)?;
            let ctx = AppContext::open()?;
            let pipeline = ctx.pipeline()?;
            let summary = pipeline.ingest_upload(kind, format, &raw)?;
            Ok(render(json, &summary, || {
                format!(
                    "Upload ingested: {} genes processed, {} created, {} merged, {} staged\n",
                    summary.genes_processed, summary.created, summary.merged, summary.staged
                )
            }))
        }
    }
}

fn run_genes(cmd: GenesCommand, json: bool) -> anyhow::Result<String> {
    let ctx = AppContext::open()?;
    match cmd {
        GenesCommand::List {
            query,
            min_score,
            max_score,
            min_evidence,
            max_evidence,
            sources,
            tiers,
            include_zero,
            ids,
            page,
            page_size,
            sort,
            asc,
        } => {
            let filters = GeneFilters {
                search: query,
                min_score,
                max_score,
                min_evidence_count: min_evidence,
                max_evidence_count: max_evidence,
                sources: parse_sources(&sources)?,
                tiers: parse_tiers(&tiers)?,
                hide_zero_scores: if include_zero { Some(false) } else { None },
                ids: ids.as_deref().map(parse_id_list).transpose()?.unwrap_or_default(),
            };
            let sort = Sort {
                field: SortField::from_flag(&sort)?,
                descending: !asc,
            };
            let response = ctx.query().list_genes(&filters, page, page_size, sort)?;
            Ok(render(json, &response, || gene_list_markdown(&response)))
        }
        GenesCommand::Metadata => {
            let metadata = ctx.query().filter_metadata()?;
            Ok(render(json, &metadata, || {
                let mut out = String::new();
                out.push_str(&format!("Sources: {}\n", metadata.sources.join(", ")));
                out.push_str(&format!(
                    "Max evidence count: {}\n\n| Tier | Genes |\n|------|-------|\n",
                    metadata.max_evidence_count
                ));
                for (tier, count) in &metadata.tier_distribution {
                    out.push_str(&format!("| {tier} | {count} |\n"));
                }
                out
            }))
        }
    }
}

async fn run_network(cmd: NetworkCommand, json: bool) -> anyhow::Result<String> {
    let ctx = AppContext::open()?;
    let network = ctx.network();
    match cmd {
        NetworkCommand::Build { selection } => {
            let request = ctx.network_request(&selection, ClusterAlgorithm::default())?;
            let graph = network.build(&request)?;
            Ok(render(json, &graph, || {
                format!(
                    "Network: {} nodes, {} edges at STRING >= {}\n",
                    graph.nodes.len(),
                    graph.edges.len(),
                    graph.min_string_score
                )
            }))
        }
        NetworkCommand::Cluster {
            selection,
            algorithm,
        } => {
            let algorithm = ClusterAlgorithm::from_flag(&algorithm)?;
            let request = ctx.network_request(&selection, algorithm)?;
            let outcome = network.cluster(&request).await?;
            Ok(render(json, &outcome, || {
                format!(
                    "{} found {} clusters, modularity {:.3}\n",
                    outcome.algorithm.as_str(),
                    outcome.cluster_count,
                    outcome.modularity
                )
            }))
        }
        NetworkCommand::EnrichHpo {
            selection,
            all_phenotypes,
            fdr,
        } => {
            let request = ctx.network_request(&selection, ClusterAlgorithm::default())?;
            let enrichment = network
                .enrich_hpo(&request, !all_phenotypes, fdr)
                .await?;
            Ok(render(json, &enrichment, || {
                let mut out = String::new();
                out.push_str(&format!(
                    "Background: {} annotated genes ({} of the cluster)\n\n",
                    enrichment.background_size, enrichment.cluster_size_in_background
                ));
                out.push_str("| Term | Name | Cluster | Background | OR | p | FDR |\n");
                out.push_str("|------|------|---------|------------|----|---|-----|\n");
                for row in &enrichment.rows {
                    out.push_str(&format!(
                        "| {} | {} | {} | {} | {:.2} | {:.2e} | {:.2e} |\n",
                        row.term_id,
                        row.term_name,
                        row.cluster_count,
                        row.background_count,
                        row.odds_ratio,
                        row.p_value,
                        row.fdr
                    ));
                }
                out
            }))
        }
        NetworkCommand::EnrichGo { selection, library } => {
            let request = ctx.network_request(&selection, ClusterAlgorithm::default())?;
            let rows = network.enrich_external(&request, &library).await?;
            Ok(render(json, &rows, || {
                let mut out = String::new();
                out.push_str(&format!("# {library}\n\n| Term | p | FDR | Genes |\n|------|---|-----|-------|\n"));
                for row in &rows {
                    out.push_str(&format!(
                        "| {} | {:.2e} | {:.2e} | {} |\n",
                        row.term_name,
                        row.p_value,
                        row.fdr,
                        row.genes.join(", ")
                    ));
                }
                if rows.is_empty() {
                    out.push_str("\nNo results (external API unavailable or nothing enriched)\n");
                }
                out
            }))
        }
    }
}

fn run_cache(cmd: CacheCommand, json: bool) -> anyhow::Result<String> {
    let ctx = AppContext::open()?;
    match cmd {
        CacheCommand::Stats { namespace } => match namespace {
            Some(namespace) => {
                let stats = ctx.cache.stats(&namespace)?;
                Ok(render(json, &stats, || {
                    format!(
                        "{namespace}: {} entries ({} active, {} expired), {} accesses, {} bytes\n",
                        stats.total_entries,
                        stats.active_entries,
                        stats.expired_entries,
                        stats.total_accesses,
                        stats.size_bytes
                    )
                }))
            }
            None => {
                let mut rows = Vec::new();
                for namespace in ctx.cache.health() {
                    let stats = ctx.cache.stats(&namespace)?;
                    rows.push((namespace, stats));
                }
                Ok(render(json, &rows, || {
                    let mut out = String::new();
                    out.push_str("| Namespace | Entries | Active | Expired | Accesses | Bytes |\n");
                    out.push_str("|-----------|---------|--------|---------|----------|-------|\n");
                    for (namespace, stats) in &rows {
                        out.push_str(&format!(
                            "| {namespace} | {} | {} | {} | {} | {} |\n",
                            stats.total_entries,
                            stats.active_entries,
                            stats.expired_entries,
                            stats.total_accesses,
                            stats.size_bytes
                        ));
                    }
                    out
                }))
            }
        },
        CacheCommand::Purge {
            namespace,
            key,
            all,
        } => {
            let removed = match (namespace, key, all) {
                (_, _, true) => ctx.cache.purge_all()?,
                (Some(namespace), Some(key), _) => ctx.cache.purge_key(&namespace, &key)?,
                (Some(namespace), None, _) => ctx.cache.purge_namespace(&namespace)?,
                (None, _, false) => {
                    return Err(NephroError::InvalidArgument(
                        "specify a namespace, or --all to purge everything".into(),
                    )
                    .into());
                }
            };
            ctx.store.record_audit("cache_purge", &format!("removed={removed}"))?;
            Ok(format!("Purged {removed} entries\n"))
        }
        CacheCommand::Health => {
            let namespaces = ctx.cache.health();
            Ok(render(json, &namespaces, || {
                format!("Registered namespaces:\n- {}\n", namespaces.join("\n- "))
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn trigger_parses_source_and_mode() {
        let cli = Cli::try_parse_from([
            "nephrodb", "ingest", "trigger", "pubtator", "--mode", "full",
        ])
        .expect("trigger should parse");
        match cli.command {
            Commands::Ingest {
                cmd: IngestCommand::Trigger { source, mode },
            } => {
                assert_eq!(source, "pubtator");
                assert_eq!(mode, "full");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn genes_list_parses_repeatable_tier_flags() {
        let cli = Cli::try_parse_from([
            "nephrodb",
            "genes",
            "list",
            "--tier",
            "comprehensive_support",
            "--tier",
            "multi_source_support",
            "--min-score",
            "50",
        ])
        .expect("genes list should parse");
        match cli.command {
            Commands::Genes {
                cmd: GenesCommand::List {
                    tiers, min_score, ..
                },
            } => {
                assert_eq!(tiers.len(), 2);
                assert_eq!(min_score, Some(50.0));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn network_cluster_defaults_to_leiden() {
        let cli = Cli::try_parse_from(["nephrodb", "network", "cluster", "--ids", "1,3,2"])
            .expect("network cluster should parse");
        match cli.command {
            Commands::Network {
                cmd: NetworkCommand::Cluster { algorithm, selection },
            } => {
                assert_eq!(algorithm, "leiden");
                assert_eq!(selection.min_string_score, 400);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn global_json_flag_applies_anywhere() {
        let cli = Cli::try_parse_from(["nephrodb", "cache", "health", "--json"])
            .expect("json flag should parse");
        assert!(cli.json);
    }

    #[test]
    fn id_list_parsing_rejects_garbage() {
        assert_eq!(parse_id_list("1, 2,3").unwrap(), vec![1, 2, 3]);
        assert!(parse_id_list("1,x").is_err());
    }

    #[test]
    fn tier_flags_accept_comma_separated_values() {
        let tiers = parse_tiers(&["comprehensive_support,multi_source_support".to_string()])
            .unwrap();
        assert_eq!(tiers.len(), 2);
        assert!(parse_tiers(&["gold".to_string()]).is_err());
    }

    #[tokio::test]
    async fn unknown_source_fails_with_listing() {
        let err = execute(
            ["nephrodb", "ingest", "trigger", "omim"]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        )
        .await
        .unwrap_err();
        assert!(format!("{err}").contains("Valid sources"));
    }
}
