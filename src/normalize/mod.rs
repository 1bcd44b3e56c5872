//! Canonical gene identifier resolution.
//!
//! Builds an in-memory lookup over the `genes` table mapping any known
//! label (approved symbol, HGNC id, alias, previous symbol) to the
//! canonical gene row. Resolution order: approved symbol, HGNC id, alias
//! (with ambiguity check), previous symbol (only when unique). Anything
//! unresolvable is staged for operator review, never dropped.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::entities::StagingStatus;
use crate::error::NephroError;
use crate::sources::hgnc::{HgncClient, HgncSnapshot};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchConfidence {
    /// Approved symbol or HGNC id.
    Exact,
    Alias,
    PreviousSymbol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveFailure {
    UnknownToHgnc,
    Withdrawn,
    AmbiguousAlias,
}

/// Outcome of one resolution attempt. Resolution is a pure function of
/// the loaded index: resolving the canonical symbol of a resolved gene
/// yields the same gene.
#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    pub gene_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<MatchConfidence>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<ResolveFailure>,
}

impl Resolution {
    fn hit(gene_id: i64, confidence: MatchConfidence) -> Self {
        Resolution {
            gene_id: Some(gene_id),
            confidence: Some(confidence),
            reason: None,
        }
    }

    fn miss(reason: ResolveFailure) -> Self {
        Resolution {
            gene_id: None,
            confidence: None,
            reason: Some(reason),
        }
    }
}

pub struct HgncNormalizer {
    by_symbol: HashMap<String, i64>,
    by_hgnc_id: HashMap<String, i64>,
    by_alias: HashMap<String, Vec<i64>>,
    by_previous: HashMap<String, Vec<i64>>,
    withdrawn_symbols: HashMap<String, i64>,
}

impl HgncNormalizer {
    /// Builds the lookup from the current gene table. Call again after a
    /// snapshot refresh; the index is immutable in between.
    pub fn from_store(store: &Store) -> Result<Self, NephroError> {
        let mut by_symbol = HashMap::new();
        let mut by_hgnc_id = HashMap::new();
        let mut by_alias: HashMap<String, Vec<i64>> = HashMap::new();
        let mut by_previous: HashMap<String, Vec<i64>> = HashMap::new();
        let mut withdrawn_symbols = HashMap::new();

        // all_genes excludes nothing; withdrawn genes are kept aside so
        // their symbols resolve to a categorized failure, not a silent
        // miss.
        let withdrawn_flags = store.withdrawn_flags()?;
        for gene in store.all_genes()? {
            let symbol_key = gene.approved_symbol.to_uppercase();
            if withdrawn_flags.get(&gene.id).copied().unwrap_or(false) {
                withdrawn_symbols.insert(symbol_key, gene.id);
                continue;
            }
            by_symbol.insert(symbol_key, gene.id);
            by_hgnc_id.insert(gene.hgnc_id.to_uppercase(), gene.id);
            for alias in &gene.aliases {
                by_alias
                    .entry(alias.to_uppercase())
                    .or_default()
                    .push(gene.id);
            }
            for previous in &gene.previous_symbols {
                by_previous
                    .entry(previous.to_uppercase())
                    .or_default()
                    .push(gene.id);
            }
        }

        info!(
            symbols = by_symbol.len(),
            aliases = by_alias.len(),
            "gene lookup index built"
        );
        Ok(HgncNormalizer {
            by_symbol,
            by_hgnc_id,
            by_alias,
            by_previous,
            withdrawn_symbols,
        })
    }

    /// Resolves a free-form identifier to a canonical gene id.
    pub fn resolve(&self, identifier: &str) -> Resolution {
        let key = identifier.trim().to_uppercase();
        if key.is_empty() {
            return Resolution::miss(ResolveFailure::UnknownToHgnc);
        }

        if let Some(id) = self.by_symbol.get(&key) {
            return Resolution::hit(*id, MatchConfidence::Exact);
        }
        if let Some(id) = self.by_hgnc_id.get(&key) {
            return Resolution::hit(*id, MatchConfidence::Exact);
        }
        // Bare numeric HGNC accessions ("9008" for "HGNC:9008").
        if key.chars().all(|c| c.is_ascii_digit())
            && let Some(id) = self.by_hgnc_id.get(&format!("HGNC:{key}"))
        {
            return Resolution::hit(*id, MatchConfidence::Exact);
        }

        if let Some(ids) = self.by_alias.get(&key) {
            let mut unique = ids.clone();
            unique.sort_unstable();
            unique.dedup();
            return match unique.as_slice() {
                [only] => Resolution::hit(*only, MatchConfidence::Alias),
                _ => Resolution::miss(ResolveFailure::AmbiguousAlias),
            };
        }

        // Previous symbols resolve only when they map to exactly one
        // current gene.
        if let Some(ids) = self.by_previous.get(&key) {
            let mut unique = ids.clone();
            unique.sort_unstable();
            unique.dedup();
            return match unique.as_slice() {
                [only] => Resolution::hit(*only, MatchConfidence::PreviousSymbol),
                _ => Resolution::miss(ResolveFailure::AmbiguousAlias),
            };
        }

        if self.withdrawn_symbols.contains_key(&key) {
            return Resolution::miss(ResolveFailure::Withdrawn);
        }
        Resolution::miss(ResolveFailure::UnknownToHgnc)
    }

    /// Resolves, staging the identifier on failure. The ingestion path
    /// goes through here so no upstream label is ever silently lost.
    pub fn resolve_or_stage(
        &self,
        store: &Store,
        identifier: &str,
        source: &str,
    ) -> Result<Option<i64>, NephroError> {
        let resolution = self.resolve(identifier);
        match resolution.gene_id {
            Some(id) => Ok(Some(id)),
            None => {
                store.stage_identifier(identifier.trim(), source)?;
                Ok(None)
            }
        }
    }

    /// Re-runs resolution over pending staging rows, typically after an
    /// HGNC refresh. Returns `(resolved, still_pending)`.
    pub fn resolve_pending_staging(&self, store: &Store) -> Result<(u64, u64), NephroError> {
        let pending = store.staging_by_status(StagingStatus::Pending)?;
        let mut resolved = 0u64;
        let mut remaining = 0u64;
        for row in pending {
            match self.resolve(&row.raw_identifier).gene_id {
                Some(gene_id) => {
                    store.resolve_staging(row.id, gene_id)?;
                    resolved += 1;
                }
                None => {
                    remaining += 1;
                }
            }
        }
        if resolved > 0 {
            info!(resolved, remaining, "staging rows resolved after refresh");
        }
        Ok((resolved, remaining))
    }
}

/// Summary of one snapshot refresh.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshOutcome {
    pub unchanged: bool,
    pub created: u64,
    pub updated: u64,
    pub staging_resolved: u64,
}

/// Pulls the current HGNC dump and applies it atomically: either the
/// whole snapshot lands or none of it does. Re-applying an identical
/// snapshot mutates nothing.
pub async fn refresh_hgnc_snapshot(store: &Arc<Store>) -> Result<RefreshOutcome, NephroError> {
    let client = HgncClient::new()?;
    let snapshot = client.fetch_snapshot().await?;
    apply_snapshot(store, &snapshot)
}

pub fn apply_snapshot(
    store: &Arc<Store>,
    snapshot: &HgncSnapshot,
) -> Result<RefreshOutcome, NephroError> {
    match store.apply_hgnc_snapshot(&snapshot.records, &snapshot.content_hash)? {
        None => {
            info!("HGNC snapshot unchanged; nothing applied");
            Ok(RefreshOutcome {
                unchanged: true,
                created: 0,
                updated: 0,
                staging_resolved: 0,
            })
        }
        Some((created, updated)) => {
            let normalizer = HgncNormalizer::from_store(store)?;
            let (staging_resolved, remaining) = normalizer.resolve_pending_staging(store)?;
            if remaining > 0 {
                warn!(remaining, "staging rows still unresolved after HGNC refresh");
            }
            Ok(RefreshOutcome {
                unchanged: false,
                created,
                updated,
                staging_resolved,
            })
        }
    }
}
