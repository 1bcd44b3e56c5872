//! Ingestion pipeline orchestrator.
//!
//! Schedules source runs, enforces the per-source state machine, applies
//! the resource and failure circuit breakers, and checkpoints progress
//! at page granularity so any interrupted run resumes from where it
//! stopped rather than page zero.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::cache::CacheManager;
use crate::config::AppConfig;
use crate::entities::SourceName;
use crate::entities::evidence::EvidenceData;
use crate::entities::progress::{ErrorInfo, SourceProgress, SourceStatus, UpdateMode};
use crate::error::NephroError;
use crate::normalize::HgncNormalizer;
use crate::score::ScoreEngine;
use crate::sources::{FAILSAFE_TIMEOUT, SourceAdapter, SourceRegistry, with_failsafe};
use crate::store::Store;
use crate::store::evidence::WriteOutcome;

pub mod broadcast;
pub mod safeguards;

pub use broadcast::ProgressBroadcaster;

/// Heartbeats older than this mark a `running` row as dead at startup.
const STALE_HEARTBEAT_SECS: i64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    /// Incremental stop condition or a mode-specific no-op.
    StoppedEarly { reason: String },
    Paused,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub source: SourceName,
    pub mode: UpdateMode,
    pub pages_fetched: u64,
    pub items_processed: u64,
    pub created: u64,
    pub merged: u64,
    pub staged: u64,
    pub failed_records: u64,
    pub outcome: RunOutcome,
}

pub struct Pipeline {
    store: Arc<Store>,
    cache: Arc<CacheManager>,
    registry: Arc<SourceRegistry>,
    config: AppConfig,
    broadcaster: ProgressBroadcaster,
    pause_flags: Mutex<HashMap<SourceName, Arc<AtomicBool>>>,
    cancel_flag: Arc<AtomicBool>,
    active_modes: Mutex<HashMap<SourceName, UpdateMode>>,
}

impl Pipeline {
    /// Builds the orchestrator and reconciles persisted state: progress
    /// rows exist for every registered source, stale `running` rows are
    /// failed, orphaned rows are flagged for the operator, and each
    /// source's host pacer is configured.
    pub fn new(
        store: Arc<Store>,
        cache: Arc<CacheManager>,
        registry: Arc<SourceRegistry>,
        config: AppConfig,
    ) -> Result<Self, NephroError> {
        let sources = registry.sources();
        store.ensure_progress_rows(&sources)?;

        let reconciled = store.reconcile_stale_running(STALE_HEARTBEAT_SECS)?;
        for source in &reconciled {
            warn!(source, "stale running row reconciled to failed at startup");
        }
        for orphan in store.orphaned_progress_rows(&sources)? {
            warn!(
                source = orphan,
                "progress row for unregistered source; kept for operator review"
            );
        }

        for source in &sources {
            let rps = config.source(*source).rate_limit.requests_per_second;
            if let Ok(adapter) = registry.get(*source) {
                for host in adapter.rate_limit_hosts() {
                    crate::sources::rate_limit::set_rate(&host, rps);
                }
            }
        }

        Ok(Pipeline {
            store,
            cache,
            registry,
            config,
            broadcaster: ProgressBroadcaster::new(),
            pause_flags: Mutex::new(HashMap::new()),
            cancel_flag: Arc::new(AtomicBool::new(false)),
            active_modes: Mutex::new(HashMap::new()),
        })
    }

    pub fn broadcaster(&self) -> ProgressBroadcaster {
        self.broadcaster.clone()
    }

    /// Shutdown hook: in-flight runs stop at the next page boundary and
    /// are recorded as failed with reason `cancelled`.
    pub fn cancel_all(&self) {
        self.cancel_flag.store(true, Ordering::Relaxed);
    }

    pub fn status(&self, source: SourceName) -> Result<SourceProgress, NephroError> {
        self.store
            .progress(source)?
            .ok_or_else(|| NephroError::NotFound {
                entity: "source".into(),
                id: source.as_str().into(),
                suggestion: "Register the source and trigger a run first".into(),
            })
    }

    pub fn status_all(&self) -> Result<Vec<SourceProgress>, NephroError> {
        self.store.all_progress()
    }

    /// Requests cooperative suspension; the run parks at the next page
    /// boundary.
    pub fn pause(&self, source: SourceName) -> Result<(), NephroError> {
        let progress = self.status(source)?;
        if progress.status != SourceStatus::Running {
            return Err(NephroError::Constraint(format!(
                "{source} is {}, only running sources can pause",
                progress.status.as_str()
            )));
        }
        self.pause_flag(source).store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Resumes a paused source from its checkpoint, with the mode the
    /// paused run was using.
    pub async fn resume(&self, source: SourceName) -> Result<RunSummary, NephroError> {
        let progress = self.status(source)?;
        if progress.status != SourceStatus::Paused {
            return Err(NephroError::Constraint(format!(
                "{source} is {}, only paused sources can resume",
                progress.status.as_str()
            )));
        }
        let mode = self
            .active_modes
            .lock()
            .ok()
            .and_then(|m| m.get(&source).copied())
            .unwrap_or(UpdateMode::Smart);

        self.store.transition_status(source, SourceStatus::Running)?;
        self.run_to_completion(source, mode, progress.current_page, progress.items_processed)
            .await
    }

    /// Triggers an ingestion run. One run per source at a time; the
    /// state machine rejects a second trigger while one is active.
    pub async fn trigger(
        &self,
        source: SourceName,
        mode: UpdateMode,
    ) -> Result<RunSummary, NephroError> {
        let progress = self.status(source)?;

        if mode == UpdateMode::UpdateFailed && progress.status != SourceStatus::Failed {
            return Ok(RunSummary {
                source,
                mode,
                pages_fetched: 0,
                items_processed: 0,
                created: 0,
                merged: 0,
                staged: 0,
                failed_records: 0,
                outcome: RunOutcome::StoppedEarly {
                    reason: "previous run did not fail".into(),
                },
            });
        }

        // A re-trigger after a failure resumes from the checkpoint;
        // everything else starts over.
        let (start_page, start_items) =
            if progress.status == SourceStatus::Failed && mode != UpdateMode::Full {
                (progress.current_page, progress.items_processed)
            } else {
                (0, 0)
            };

        self.store.transition_status(source, SourceStatus::Running)?;
        if mode == UpdateMode::Full {
            // Delete as its own transaction; the repopulation streams in
            // afterwards with its own commit cadence.
            let purged = self.store.purge_source_evidence(source)?;
            info!(source = %source, purged, "full refresh purged existing evidence");
        }
        self.run_to_completion(source, mode, start_page, start_items)
            .await
    }

    async fn run_to_completion(
        &self,
        source: SourceName,
        mode: UpdateMode,
        start_page: u64,
        start_items: u64,
    ) -> Result<RunSummary, NephroError> {
        if let Ok(mut modes) = self.active_modes.lock() {
            modes.insert(source, mode);
        }
        self.pause_flag(source).store(false, Ordering::Relaxed);
        self.cancel_flag.store(false, Ordering::Relaxed);

        let adapter = self.registry.get(source)?;
        self.broadcaster.publish(
            source,
            SourceStatus::Running,
            start_page,
            None,
            start_items,
            format!("{mode} run started", mode = mode.as_str()),
        );

        let result = self
            .run_pages(adapter.clone(), mode, start_page, start_items)
            .await;

        match result {
            Ok(summary) => {
                if summary.outcome == RunOutcome::Paused {
                    return Ok(summary);
                }
                self.store.transition_status(source, SourceStatus::Succeeded)?;
                self.finish_run(source, adapter.wants_annotation())?;
                self.broadcaster.publish(
                    source,
                    SourceStatus::Succeeded,
                    summary.pages_fetched,
                    None,
                    summary.items_processed,
                    "run finished",
                );
                Ok(summary)
            }
            Err(err) => {
                let reason = match &err {
                    NephroError::Cancelled => "cancelled",
                    NephroError::ResourceLimit(_) => "resource_limit",
                    e if e.is_transport() => "consecutive_failures",
                    _ => "error",
                };
                self.store.fail_progress(
                    source,
                    &ErrorInfo {
                        reason: reason.into(),
                        message: err.to_string(),
                        failed_record_count: 0,
                    },
                )?;
                let progress = self
                    .store
                    .progress(source)?
                    .unwrap_or_else(|| SourceProgress::idle(source));
                self.broadcaster.publish(
                    source,
                    SourceStatus::Failed,
                    progress.current_page,
                    progress.total_pages,
                    progress.items_processed,
                    format!("run failed: {reason}"),
                );
                Err(err)
            }
        }
    }

    /// Post-run bookkeeping: re-materialize the score projection and
    /// fire dependency invalidation for the mutated tables.
    fn finish_run(&self, source: SourceName, wrote_annotations: bool) -> Result<(), NephroError> {
        let engine = ScoreEngine::from_config(&self.config);
        let scored = self.store.refresh_scores(&engine)?;
        info!(source = %source, scored, "score projection refreshed");

        self.cache.invalidate_for_table("gene_evidence")?;
        if wrote_annotations {
            self.cache.invalidate_for_table("gene_annotations")?;
        }
        Ok(())
    }

    async fn run_pages(
        &self,
        adapter: Arc<dyn SourceAdapter>,
        mode: UpdateMode,
        start_page: u64,
        start_items: u64,
    ) -> Result<RunSummary, NephroError> {
        let source = adapter.name();
        let source_cfg = self.config.source(source);
        let version = adapter.version();
        let normalizer = HgncNormalizer::from_store(&self.store)?;
        let pause_flag = self.pause_flag(source);

        if start_page == 0 {
            // Fresh run: bulk adapters discard any materialized dataset.
            // Resumed runs keep it so page boundaries stay aligned with
            // the checkpoint.
            adapter.prepare_run().await?;
        }

        let smart_active = matches!(mode, UpdateMode::Smart | UpdateMode::UpdateNew)
            && adapter.supports_incremental();
        let missing_only: Option<HashSet<i64>> = if mode == UpdateMode::UpdateMissing {
            Some(self.store.genes_missing_source(source)?.into_iter().collect())
        } else {
            None
        };

        let mut failures =
            safeguards::FailureTracker::new(safeguards::CONSECUTIVE_FAILURE_LIMIT);
        let mut summary = RunSummary {
            source,
            mode,
            pages_fetched: 0,
            items_processed: start_items,
            created: 0,
            merged: 0,
            staged: 0,
            failed_records: 0,
            outcome: RunOutcome::Completed,
        };
        let mut buffer: Vec<(i64, EvidenceData)> = Vec::new();
        let mut consecutive_dup_pages = 0u32;
        let mut page = start_page;

        loop {
            if self.cancel_flag.load(Ordering::Relaxed) {
                self.flush(&adapter, &mut buffer, version.as_deref(), &mut summary)?;
                self.store.checkpoint_progress(source, page, None, summary.items_processed)?;
                return Err(NephroError::Cancelled);
            }
            if pause_flag.swap(false, Ordering::Relaxed) {
                self.flush(&adapter, &mut buffer, version.as_deref(), &mut summary)?;
                self.store.checkpoint_progress(source, page, None, summary.items_processed)?;
                self.store.transition_status(source, SourceStatus::Paused)?;
                self.broadcaster.publish(
                    source,
                    SourceStatus::Paused,
                    page,
                    None,
                    summary.items_processed,
                    "run paused",
                );
                summary.outcome = RunOutcome::Paused;
                return Ok(summary);
            }
            if page > start_page && page % safeguards::CHECKPOINT_PAGE_INTERVAL == 0 {
                // Periodic commit plus the resource breaker.
                self.flush(&adapter, &mut buffer, version.as_deref(), &mut summary)?;
                if let Err(err) = safeguards::check_memory() {
                    self.store.checkpoint_progress(source, page, None, summary.items_processed)?;
                    return Err(err);
                }
            }

            // Up to `concurrency` consecutive pages fetch in flight at
            // once; the host pacer still spaces the requests. Results
            // are processed strictly in page order, so progress events
            // and checkpoints stay monotonic.
            let concurrency = source_cfg.rate_limit.concurrency.max(1) as u64;
            let batch: Vec<_> = (page..page + concurrency)
                .map(|p| {
                    let adapter = adapter.clone();
                    async move {
                        with_failsafe(source.as_str(), FAILSAFE_TIMEOUT, adapter.fetch_page(p))
                            .await
                    }
                })
                .collect();
            let results = futures::future::join_all(batch).await;

            let mut reached_end = false;
            for (offset, result) in results.into_iter().enumerate() {
                if reached_end {
                    break;
                }
                let current = page + offset as u64;
                let fetched = match result {
                    Ok(fetched) => {
                        failures.record_success();
                        fetched
                    }
                    Err(err) if err.is_transport() => {
                        warn!(source = %source, page = current, error = %err, "page fetch failed");
                        summary.failed_records += 1;
                        if failures.record_failure() {
                            self.flush(&adapter, &mut buffer, version.as_deref(), &mut summary)?;
                            self.store.checkpoint_progress(
                                source,
                                current,
                                None,
                                summary.items_processed,
                            )?;
                            return Err(err);
                        }
                        continue;
                    }
                    Err(err) => return Err(err),
                };

                summary.pages_fetched += 1;

                // Duplicate-rate stop condition, evaluated against the
                // store in bounded batches.
                if smart_active && !fetched.dedup_ids.is_empty() {
                    let known = self.store.existing_pmids(&fetched.dedup_ids)?;
                    let rate = known.len() as f64 / fetched.dedup_ids.len() as f64;
                    if rate > source_cfg.smart_update.duplicate_threshold {
                        consecutive_dup_pages += 1;
                    } else {
                        consecutive_dup_pages = 0;
                    }
                }

                for record in fetched.records {
                    match normalizer.resolve_or_stage(
                        &self.store,
                        &record.gene_identifier,
                        source.as_str(),
                    )? {
                        Some(gene_id) => {
                            if let Some(missing) = &missing_only
                                && !missing.contains(&gene_id)
                            {
                                continue;
                            }
                            self.buffer_record(
                                &adapter,
                                &mut buffer,
                                gene_id,
                                record.evidence_data,
                            );
                            summary.items_processed += 1;
                        }
                        None => {
                            summary.staged += 1;
                            summary.items_processed += 1;
                        }
                    }
                }
                if buffer.len() >= source_cfg.rate_limit.chunk_size {
                    self.flush(&adapter, &mut buffer, version.as_deref(), &mut summary)?;
                }

                self.store.checkpoint_progress(
                    source,
                    current + 1,
                    fetched.total_pages,
                    summary.items_processed,
                )?;
                self.broadcaster.publish(
                    source,
                    SourceStatus::Running,
                    current + 1,
                    fetched.total_pages,
                    summary.items_processed,
                    "page complete",
                );

                if smart_active {
                    if consecutive_dup_pages >= source_cfg.smart_update.consecutive_pages {
                        summary.outcome = RunOutcome::StoppedEarly {
                            reason: format!(
                                "{consecutive_dup_pages} consecutive pages above the duplicate threshold"
                            ),
                        };
                        reached_end = true;
                    } else if current + 1 >= source_cfg.smart_update.max_pages {
                        summary.outcome = RunOutcome::StoppedEarly {
                            reason: format!(
                                "page cap of {} reached",
                                source_cfg.smart_update.max_pages
                            ),
                        };
                        reached_end = true;
                    }
                }
                if !fetched.has_more {
                    reached_end = true;
                }
            }
            if reached_end {
                break;
            }
            page += concurrency;
        }

        self.flush(&adapter, &mut buffer, version.as_deref(), &mut summary)?;
        Ok(summary)
    }

    /// Folds a record into the write buffer, merging with an earlier
    /// record for the same gene so one flush never writes a gene twice.
    fn buffer_record(
        &self,
        adapter: &Arc<dyn SourceAdapter>,
        buffer: &mut Vec<(i64, EvidenceData)>,
        gene_id: i64,
        data: EvidenceData,
    ) {
        if let Some((_, existing)) = buffer.iter_mut().find(|(id, _)| *id == gene_id) {
            let merged = adapter.merge_existing(data, existing.clone());
            *existing = merged;
        } else {
            buffer.push((gene_id, data));
        }
    }

    fn flush(
        &self,
        adapter: &Arc<dyn SourceAdapter>,
        buffer: &mut Vec<(i64, EvidenceData)>,
        version: Option<&str>,
        summary: &mut RunSummary,
    ) -> Result<(), NephroError> {
        if buffer.is_empty() {
            return Ok(());
        }
        let source = adapter.name();

        // Accumulating sources fold the page's payload into whatever is
        // already persisted before the transactional replace.
        let mut rows = Vec::with_capacity(buffer.len());
        for (gene_id, data) in buffer.drain(..) {
            let merged = if adapter.supports_incremental() {
                match self
                    .store
                    .evidence_for_gene(gene_id)?
                    .into_iter()
                    .find(|row| row.source_name == source)
                {
                    Some(existing) => adapter.merge_existing(data, existing.evidence_data),
                    None => data,
                }
            } else {
                data
            };
            rows.push((gene_id, merged));
        }

        if adapter.wants_annotation() {
            for (gene_id, data) in &rows {
                self.store.replace_annotation(*gene_id, data)?;
            }
        }
        let (created, merged) = self.store.replace_evidence_chunk(&rows, version)?;
        summary.created += created;
        summary.merged += merged;
        Ok(())
    }

    /// Ingests an admin upload (diagnostic panels or curated literature):
    /// parse rows, resolve identifiers, persist evidence, refresh the
    /// projection. Literature rows fold into existing publication
    /// evidence; panel evidence replaces wholesale.
    pub fn ingest_upload(
        &self,
        kind: crate::sources::panels::UploadKind,
        format: crate::sources::panels::UploadFormat,
        raw: &[u8],
    ) -> Result<crate::sources::panels::UploadSummary, NephroError> {
        use crate::sources::panels::{UploadKind, UploadSummary};

        let records = crate::sources::panels::parse_upload(kind, format, raw)?;
        let normalizer = HgncNormalizer::from_store(&self.store)?;
        let source = match kind {
            UploadKind::DiagnosticPanels => SourceName::DiagnosticPanels,
            UploadKind::Literature => SourceName::PubTator,
        };

        let mut summary = UploadSummary::default();
        for record in records {
            summary.genes_processed += 1;
            let Some(gene_id) = normalizer.resolve_or_stage(
                &self.store,
                &record.gene_identifier,
                source.as_str(),
            )?
            else {
                summary.staged += 1;
                continue;
            };

            let data = match (kind, record.evidence_data) {
                (UploadKind::Literature, EvidenceData::PubTator(new)) => {
                    let existing = self
                        .store
                        .evidence_for_gene(gene_id)?
                        .into_iter()
                        .find(|row| row.source_name == SourceName::PubTator);
                    match existing {
                        Some(row) => match row.evidence_data {
                            EvidenceData::PubTator(old) => EvidenceData::PubTator(
                                crate::sources::pubtator::merge_pubtator(new, old),
                            ),
                            _ => EvidenceData::PubTator(new),
                        },
                        None => EvidenceData::PubTator(new),
                    }
                }
                (_, data) => data,
            };

            match self.store.replace_evidence(gene_id, &data, None)? {
                WriteOutcome::Created => summary.created += 1,
                WriteOutcome::Merged => summary.merged += 1,
            }
        }

        let engine = ScoreEngine::from_config(&self.config);
        self.store.refresh_scores(&engine)?;
        self.cache.invalidate_for_table("gene_evidence")?;
        self.store.record_audit(
            "upload",
            &format!(
                "kind={:?} genes={} created={} merged={} staged={}",
                kind, summary.genes_processed, summary.created, summary.merged, summary.staged
            ),
        )?;
        Ok(summary)
    }

    fn pause_flag(&self, source: SourceName) -> Arc<AtomicBool> {
        let mut flags = match self.pause_flags.lock() {
            Ok(flags) => flags,
            Err(poisoned) => poisoned.into_inner(),
        };
        flags
            .entry(source)
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::evidence::{
        EvidenceData, PubTatorEvidence, RawEvidence,
    };
    use crate::sources::{FetchedPage, SourceRegistry};
    use crate::store::Store;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU64;

    /// Serves a fixed relevance-ordered stream of single-gene pages,
    /// with PubTator-style merge semantics.
    struct ScriptedAdapter {
        pages: Vec<Vec<(&'static str, &'static str)>>, // (gene, pmid)
        fetches: AtomicU64,
    }

    impl ScriptedAdapter {
        fn new(pages: Vec<Vec<(&'static str, &'static str)>>) -> Self {
            ScriptedAdapter {
                pages,
                fetches: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl crate::sources::SourceAdapter for ScriptedAdapter {
        fn name(&self) -> SourceName {
            SourceName::PubTator
        }

        fn supports_incremental(&self) -> bool {
            true
        }

        async fn fetch_page(&self, page: u64) -> Result<FetchedPage, NephroError> {
            self.fetches.fetch_add(1, Ordering::Relaxed);
            let records = self
                .pages
                .get(page as usize)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .map(|(gene, pmid)| RawEvidence {
                    gene_identifier: gene.to_string(),
                    evidence_data: EvidenceData::PubTator(PubTatorEvidence {
                        pmids: vec![pmid.to_string()],
                        publication_count: 1,
                        total_mentions: 1,
                        mentions: vec![],
                    }),
                })
                .collect();
            let dedup_ids = self
                .pages
                .get(page as usize)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .map(|(_, pmid)| pmid.to_string())
                .collect();
            Ok(FetchedPage {
                records,
                page,
                total_pages: Some(self.pages.len() as u64),
                dedup_ids,
                has_more: (page as usize) + 1 < self.pages.len(),
            })
        }

        fn merge_existing(&self, new: EvidenceData, existing: EvidenceData) -> EvidenceData {
            match (new, existing) {
                (EvidenceData::PubTator(mut new), EvidenceData::PubTator(existing)) => {
                    for pmid in existing.pmids {
                        if !new.pmids.contains(&pmid) {
                            new.pmids.push(pmid);
                        }
                    }
                    new.pmids.sort();
                    new.publication_count = new.pmids.len() as u32;
                    EvidenceData::PubTator(new)
                }
                (new, _) => new,
            }
        }
    }

    fn pipeline_with(pages: Vec<Vec<(&'static str, &'static str)>>) -> (Pipeline, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        // Seed the genes the scripted pages reference.
        for (hgnc, symbol) in [
            ("HGNC:9008", "PKD1"),
            ("HGNC:9009", "PKD2"),
            ("HGNC:12559", "UMOD"),
        ] {
            store
                .upsert_gene(&crate::sources::hgnc::HgncRecord {
                    hgnc_id: hgnc.into(),
                    approved_symbol: symbol.into(),
                    name: String::new(),
                    aliases: vec![],
                    previous_symbols: vec![],
                    ensembl_gene_id: None,
                })
                .unwrap();
        }

        let mut registry = SourceRegistry::new();
        registry.register(Arc::new(ScriptedAdapter::new(pages)));
        let config = AppConfig::default();
        let cache = Arc::new(CacheManager::new(store.clone(), &config));
        let pipeline =
            Pipeline::new(store.clone(), cache, Arc::new(registry), config).unwrap();
        (pipeline, store)
    }

    #[tokio::test]
    async fn full_run_persists_evidence_and_refreshes_scores() {
        let (pipeline, store) = pipeline_with(vec![
            vec![("PKD1", "100"), ("PKD2", "101")],
            vec![("UMOD", "102")],
        ]);

        let summary = pipeline
            .trigger(SourceName::PubTator, UpdateMode::Full)
            .await
            .unwrap();
        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(summary.created, 3);
        assert_eq!(summary.staged, 0);

        let progress = pipeline.status(SourceName::PubTator).unwrap();
        assert_eq!(progress.status, SourceStatus::Succeeded);
        assert_eq!(store.scored_gene_count().unwrap(), 3);
    }

    #[tokio::test]
    async fn smart_after_full_writes_nothing_new() {
        let (pipeline, store) = pipeline_with(vec![
            vec![("PKD1", "100"), ("PKD2", "101")],
            vec![("UMOD", "102")],
        ]);
        pipeline
            .trigger(SourceName::PubTator, UpdateMode::Full)
            .await
            .unwrap();
        let evidence_before: Vec<_> = store
            .evidence_by_source(SourceName::PubTator)
            .unwrap()
            .into_iter()
            .collect();

        let summary = pipeline
            .trigger(SourceName::PubTator, UpdateMode::Smart)
            .await
            .unwrap();
        // Every page is already persisted: the duplicate-rate condition
        // stops the run and the evidence is unchanged.
        assert_eq!(summary.created, 0);
        let evidence_after: Vec<_> = store
            .evidence_by_source(SourceName::PubTator)
            .unwrap()
            .into_iter()
            .collect();
        assert_eq!(evidence_before, evidence_after);
    }

    #[tokio::test]
    async fn unknown_symbols_go_to_staging_and_run_succeeds() {
        let (pipeline, store) = pipeline_with(vec![vec![("PKD1", "100"), ("MYSTERY9", "101")]]);

        let summary = pipeline
            .trigger(SourceName::PubTator, UpdateMode::Full)
            .await
            .unwrap();
        assert_eq!(summary.created, 1);
        assert_eq!(summary.staged, 1);
        let staged = store
            .staging_by_status(crate::entities::StagingStatus::Pending)
            .unwrap();
        assert_eq!(staged[0].raw_identifier, "MYSTERY9");
    }

    #[tokio::test]
    async fn update_failed_is_a_noop_after_success() {
        let (pipeline, _store) = pipeline_with(vec![vec![("PKD1", "100")]]);
        pipeline
            .trigger(SourceName::PubTator, UpdateMode::Full)
            .await
            .unwrap();

        let summary = pipeline
            .trigger(SourceName::PubTator, UpdateMode::UpdateFailed)
            .await
            .unwrap();
        assert!(matches!(summary.outcome, RunOutcome::StoppedEarly { .. }));
        assert_eq!(summary.pages_fetched, 0);
    }

    #[tokio::test]
    async fn progress_events_arrive_in_page_order() {
        let (pipeline, _store) = pipeline_with(vec![
            vec![("PKD1", "100")],
            vec![("PKD2", "101")],
            vec![("UMOD", "102")],
        ]);
        let mut rx = pipeline.broadcaster().subscribe();

        pipeline
            .trigger(SourceName::PubTator, UpdateMode::Full)
            .await
            .unwrap();

        let mut last_page = 0;
        while let Ok(event) = rx.try_recv() {
            assert!(event.current_page >= last_page, "events regressed");
            last_page = event.current_page;
        }
        assert!(last_page >= 3);
    }

    #[tokio::test]
    async fn completed_run_invalidates_dependent_cache_namespaces() {
        let (pipeline, _store) = pipeline_with(vec![vec![("PKD1", "100")]]);
        pipeline
            .cache
            .put_raw("annotations", "filter_metadata", "stale")
            .unwrap();

        pipeline
            .trigger(SourceName::PubTator, UpdateMode::Full)
            .await
            .unwrap();

        // gene_evidence mutated; the dependent namespace must read as a
        // miss immediately after the run returns.
        assert_eq!(
            pipeline.cache.get_raw("annotations", "filter_metadata").unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn second_trigger_while_running_is_rejected() {
        let (pipeline, store) = pipeline_with(vec![vec![("PKD1", "100")]]);
        // Simulate an active run.
        store
            .transition_status(SourceName::PubTator, SourceStatus::Running)
            .unwrap();

        let err = pipeline
            .trigger(SourceName::PubTator, UpdateMode::Smart)
            .await
            .unwrap_err();
        assert!(matches!(err, NephroError::Constraint(_)));
    }
}
