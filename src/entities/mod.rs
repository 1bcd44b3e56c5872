use serde::{Deserialize, Serialize};

use crate::error::NephroError;

pub mod evidence;
pub mod progress;
pub mod score;

/// Canonical gene row, one per HGNC-approved gene.
///
/// Created by the normalizer on first confirmed encounter; alias sets are
/// replaced wholesale on each HGNC snapshot refresh. Never deleted while
/// evidence references it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gene {
    pub id: i64,
    pub hgnc_id: String,
    pub approved_symbol: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub previous_symbols: Vec<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Registered evidence sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceName {
    PanelApp,
    ClinGen,
    GenCc,
    Hpo,
    ClinVar,
    PubTator,
    StringPpi,
    DiagnosticPanels,
}

impl SourceName {
    pub const ALL: &'static [SourceName] = &[
        SourceName::PanelApp,
        SourceName::ClinGen,
        SourceName::GenCc,
        SourceName::Hpo,
        SourceName::ClinVar,
        SourceName::PubTator,
        SourceName::StringPpi,
        SourceName::DiagnosticPanels,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SourceName::PanelApp => "panelapp",
            SourceName::ClinGen => "clingen",
            SourceName::GenCc => "gencc",
            SourceName::Hpo => "hpo",
            SourceName::ClinVar => "clinvar",
            SourceName::PubTator => "pubtator",
            SourceName::StringPpi => "string_ppi",
            SourceName::DiagnosticPanels => "diagnostic_panels",
        }
    }

    pub fn from_flag(value: &str) -> Result<Self, NephroError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "panelapp" => Ok(SourceName::PanelApp),
            "clingen" => Ok(SourceName::ClinGen),
            "gencc" => Ok(SourceName::GenCc),
            "hpo" => Ok(SourceName::Hpo),
            "clinvar" => Ok(SourceName::ClinVar),
            "pubtator" => Ok(SourceName::PubTator),
            "string_ppi" | "string-ppi" | "string" => Ok(SourceName::StringPpi),
            "diagnostic_panels" | "diagnostic-panels" | "panels" => {
                Ok(SourceName::DiagnosticPanels)
            }
            other => Err(NephroError::InvalidArgument(format!(
                "Unknown source: {other}\n\nValid sources:\n- panelapp\n- clingen\n- gencc\n- hpo\n- clinvar\n- pubtator\n- string_ppi\n- diagnostic_panels"
            ))),
        }
    }

    /// Sources the orchestrator can fetch on its own. DiagnosticPanels
    /// rows only arrive through structured uploads.
    pub fn is_fetchable(self) -> bool {
        !matches!(self, SourceName::DiagnosticPanels)
    }
}

impl std::fmt::Display for SourceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Staging row for a gene identifier that could not be resolved inline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingRecord {
    pub id: i64,
    pub raw_identifier: String,
    pub raw_source: String,
    pub status: StagingStatus,
    pub normalized_gene_id: Option<i64>,
    pub attempts: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagingStatus {
    Pending,
    Resolved,
    Unresolvable,
}

impl StagingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StagingStatus::Pending => "pending",
            StagingStatus::Resolved => "resolved",
            StagingStatus::Unresolvable => "unresolvable",
        }
    }

    pub fn from_str(value: &str) -> Result<Self, NephroError> {
        match value {
            "pending" => Ok(StagingStatus::Pending),
            "resolved" => Ok(StagingStatus::Resolved),
            "unresolvable" => Ok(StagingStatus::Unresolvable),
            other => Err(NephroError::InvalidArgument(format!(
                "Unknown staging status: {other}"
            ))),
        }
    }
}
