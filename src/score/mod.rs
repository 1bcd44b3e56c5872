use std::collections::BTreeMap;

use crate::config::{AppConfig, TierConfig};
use crate::entities::SourceName;
use crate::entities::evidence::EvidenceData;
use crate::entities::score::{EvidenceTier, GeneScore};

/// Saturation points for log-scaled count summaries. A source hitting its
/// cap contributes a raw score of 1.0.
const PANELAPP_CAP: f64 = 10.0;
const HPO_CAP: f64 = 20.0;
const CLINVAR_CAP: f64 = 100.0;
const PUBTATOR_CAP: f64 = 1000.0;
const PANELS_CAP: f64 = 10.0;

/// Deterministic aggregation over evidence rows.
///
/// The engine is a pure function of the configuration: identical evidence
/// plus identical configuration always produces identical scores and
/// tiers, which is what lets the projection be re-materialized at will.
pub struct ScoreEngine {
    weights: BTreeMap<SourceName, f64>,
    tiers: TierConfig,
}

impl ScoreEngine {
    pub fn from_config(config: &AppConfig) -> Self {
        let weights = SourceName::ALL
            .iter()
            .map(|source| (*source, config.source(*source).weight))
            .collect();
        ScoreEngine {
            weights,
            tiers: config.evidence_tiers.clone(),
        }
    }

    /// Per-source raw score on [0, 1]: log-scale for count summaries,
    /// categorical map for classification summaries. `None` for sources
    /// that do not participate in scoring (STRING).
    pub fn raw_score(&self, data: &EvidenceData) -> Option<f64> {
        let summary = data.scoring_summary()?;
        let raw = match data.source_name() {
            SourceName::PanelApp => log_norm(summary, PANELAPP_CAP),
            // ClinGen and GenCC summaries are already categorical maps
            // onto [0, 1].
            SourceName::ClinGen | SourceName::GenCc => summary.clamp(0.0, 1.0),
            SourceName::Hpo => log_norm(summary, HPO_CAP),
            SourceName::ClinVar => log_norm(summary, CLINVAR_CAP),
            SourceName::PubTator => log_norm(summary, PUBTATOR_CAP),
            SourceName::DiagnosticPanels => log_norm(summary, PANELS_CAP),
            SourceName::StringPpi => return None,
        };
        Some(raw)
    }

    /// Aggregates one gene's evidence rows into its composite score.
    pub fn score_gene(&self, gene_id: i64, evidence: &[EvidenceData]) -> GeneScore {
        // BTreeMap keyed by source keeps summation order fixed, so the
        // floating-point result is reproducible row-for-row.
        let mut source_scores: BTreeMap<String, f64> = BTreeMap::new();
        for data in evidence {
            if let Some(raw) = self.raw_score(data) {
                source_scores.insert(data.source_name().as_str().to_string(), raw);
            }
        }

        let mut percentage = 0.0;
        for (source, raw) in &source_scores {
            let weight = SourceName::from_flag(source)
                .ok()
                .and_then(|s| self.weights.get(&s).copied())
                .unwrap_or(0.0);
            percentage += 100.0 * weight * raw;
        }
        let percentage = percentage.clamp(0.0, 100.0);
        let source_count = source_scores.len() as u32;

        GeneScore {
            gene_id,
            percentage_score: percentage,
            source_count,
            evidence_tier: self.assign_tier(source_count, percentage),
            source_scores,
        }
    }

    /// First matching configured rule wins; genes above zero with no
    /// matching rule are `minimal_evidence`, zero-score genes are
    /// `insufficient`.
    pub fn assign_tier(&self, source_count: u32, percentage_score: f64) -> EvidenceTier {
        for rule in &self.tiers.rules {
            let by_sources = source_count >= rule.min_sources;
            let by_score = percentage_score >= rule.min_score;
            let matched = if rule.require_both {
                by_sources && by_score
            } else {
                by_sources || by_score
            };
            if matched {
                return rule.label;
            }
        }
        if percentage_score > 0.0 {
            EvidenceTier::MinimalEvidence
        } else {
            EvidenceTier::Insufficient
        }
    }
}

fn log_norm(value: f64, cap: f64) -> f64 {
    if value <= 0.0 {
        return 0.0;
    }
    ((1.0 + value).ln() / (1.0 + cap).ln()).clamp(0.0, 1.0)
}
