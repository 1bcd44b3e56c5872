use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::NephroError;

/// Categorical quality label derived from the composite aggregate.
///
/// Tiers partition scored genes disjointly: assignment walks the
/// configured rules top-down and the first match wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceTier {
    ComprehensiveSupport,
    MultiSourceSupport,
    EstablishedSupport,
    PreliminaryEvidence,
    MinimalEvidence,
    Insufficient,
}

impl EvidenceTier {
    pub const ALL: &'static [EvidenceTier] = &[
        EvidenceTier::ComprehensiveSupport,
        EvidenceTier::MultiSourceSupport,
        EvidenceTier::EstablishedSupport,
        EvidenceTier::PreliminaryEvidence,
        EvidenceTier::MinimalEvidence,
        EvidenceTier::Insufficient,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EvidenceTier::ComprehensiveSupport => "comprehensive_support",
            EvidenceTier::MultiSourceSupport => "multi_source_support",
            EvidenceTier::EstablishedSupport => "established_support",
            EvidenceTier::PreliminaryEvidence => "preliminary_evidence",
            EvidenceTier::MinimalEvidence => "minimal_evidence",
            EvidenceTier::Insufficient => "insufficient",
        }
    }

    pub fn from_flag(value: &str) -> Result<Self, NephroError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "comprehensive_support" => Ok(EvidenceTier::ComprehensiveSupport),
            "multi_source_support" => Ok(EvidenceTier::MultiSourceSupport),
            "established_support" => Ok(EvidenceTier::EstablishedSupport),
            "preliminary_evidence" => Ok(EvidenceTier::PreliminaryEvidence),
            "minimal_evidence" => Ok(EvidenceTier::MinimalEvidence),
            "insufficient" => Ok(EvidenceTier::Insufficient),
            other => Err(NephroError::InvalidArgument(format!(
                "Unknown evidence tier: {other}\n\nValid tiers:\n- comprehensive_support\n- multi_source_support\n- established_support\n- preliminary_evidence\n- minimal_evidence\n- insufficient"
            ))),
        }
    }
}

impl std::fmt::Display for EvidenceTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-gene aggregate, recomputed deterministically from evidence rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneScore {
    pub gene_id: i64,
    /// Weighted composite on [0, 100].
    pub percentage_score: f64,
    /// Number of sources contributing scoring evidence.
    pub source_count: u32,
    pub evidence_tier: EvidenceTier,
    /// Per-source normalized scores, keyed by source name.
    pub source_scores: BTreeMap<String, f64>,
}

/// One row of the gene listing response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneListItem {
    pub id: i64,
    pub approved_symbol: String,
    pub hgnc_id: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub percentage_score: f64,
    pub evidence_count: u32,
    pub evidence_tier: EvidenceTier,
    pub source_scores: BTreeMap<String, f64>,
    pub sources: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::EvidenceTier;

    #[test]
    fn tier_labels_round_trip() {
        for tier in EvidenceTier::ALL {
            assert_eq!(EvidenceTier::from_flag(tier.as_str()).unwrap(), *tier);
        }
    }

    #[test]
    fn tier_serde_uses_snake_case_labels() {
        let json = serde_json::to_string(&EvidenceTier::MultiSourceSupport).unwrap();
        assert_eq!(json, "\"multi_source_support\"");
    }
}
