use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::entities::SourceName;

/// Per-source structured evidence payload attached to a gene.
///
/// The `source` tag matches the `source_name` column of the evidence row,
/// so a stored document deserializes back into the right variant without
/// consulting the column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source")]
pub enum EvidenceData {
    #[serde(rename = "panelapp")]
    PanelApp(PanelAppEvidence),
    #[serde(rename = "clingen")]
    ClinGen(ClinGenEvidence),
    #[serde(rename = "gencc")]
    GenCc(GenCcEvidence),
    #[serde(rename = "hpo")]
    Hpo(HpoEvidence),
    #[serde(rename = "clinvar")]
    ClinVar(ClinVarEvidence),
    #[serde(rename = "pubtator")]
    PubTator(PubTatorEvidence),
    #[serde(rename = "string_ppi")]
    StringPpi(StringPpiEvidence),
    #[serde(rename = "diagnostic_panels")]
    DiagnosticPanels(DiagnosticPanelsEvidence),
}

impl EvidenceData {
    pub fn source_name(&self) -> SourceName {
        match self {
            EvidenceData::PanelApp(_) => SourceName::PanelApp,
            EvidenceData::ClinGen(_) => SourceName::ClinGen,
            EvidenceData::GenCc(_) => SourceName::GenCc,
            EvidenceData::Hpo(_) => SourceName::Hpo,
            EvidenceData::ClinVar(_) => SourceName::ClinVar,
            EvidenceData::PubTator(_) => SourceName::PubTator,
            EvidenceData::StringPpi(_) => SourceName::StringPpi,
            EvidenceData::DiagnosticPanels(_) => SourceName::DiagnosticPanels,
        }
    }

    /// Numeric summary the scoring engine normalizes (§ per-source shape).
    /// STRING evidence carries no scoring summary; it feeds the network
    /// engine instead.
    pub fn scoring_summary(&self) -> Option<f64> {
        match self {
            EvidenceData::PanelApp(e) => Some(f64::from(e.green_panel_count())),
            EvidenceData::ClinGen(e) => Some(e.max_classification_score),
            EvidenceData::GenCc(e) => Some(e.classification_strength()),
            EvidenceData::Hpo(e) => Some(f64::from(e.kidney_phenotype_count)),
            EvidenceData::ClinVar(e) => Some(e.weighted_variant_load()),
            EvidenceData::PubTator(e) => Some(f64::from(e.publication_count)),
            EvidenceData::StringPpi(_) => None,
            EvidenceData::DiagnosticPanels(e) => Some(f64::from(e.provider_count)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelAppEvidence {
    #[serde(default)]
    pub panels: Vec<PanelMembership>,
    /// Confidence levels as PanelApp reports them: "3" green, "2" amber, "1" red.
    #[serde(default)]
    pub evidence_levels: Vec<String>,
    #[serde(default)]
    pub modes_of_inheritance: Vec<String>,
    #[serde(default)]
    pub phenotypes: Vec<String>,
    pub panel_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelMembership {
    pub panel_id: u32,
    pub panel_name: String,
    pub evidence_level: String,
}

impl PanelAppEvidence {
    pub fn green_panel_count(&self) -> u32 {
        self.panels
            .iter()
            .filter(|p| p.evidence_level == "3")
            .count() as u32
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClinGenEvidence {
    #[serde(default)]
    pub classifications: Vec<String>,
    #[serde(default)]
    pub validities: Vec<ClinGenValidity>,
    #[serde(default)]
    pub expert_panels: Vec<String>,
    /// Strongest classification mapped onto [0, 1].
    pub max_classification_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClinGenValidity {
    pub disease: String,
    pub classification: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expert_panel: Option<String>,
}

/// ClinGen gene-disease validity classifications, strongest first.
pub const CLINGEN_CLASSIFICATIONS: &[(&str, f64)] = &[
    ("Definitive", 1.0),
    ("Strong", 0.8),
    ("Moderate", 0.6),
    ("Limited", 0.3),
    ("Disputed", 0.1),
    ("Animal Model Only", 0.1),
    ("No Known Disease Relationship", 0.0),
    ("Refuted", 0.0),
];

pub fn clingen_classification_score(classification: &str) -> f64 {
    CLINGEN_CLASSIFICATIONS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(classification.trim()))
        .map(|(_, score)| *score)
        .unwrap_or(0.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenCcEvidence {
    #[serde(default)]
    pub classifications: Vec<String>,
    #[serde(default)]
    pub submissions: Vec<GenCcSubmission>,
    #[serde(default)]
    pub submitters: Vec<String>,
    pub submission_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenCcSubmission {
    pub disease: String,
    pub classification: String,
    pub submitter: String,
}

impl GenCcEvidence {
    /// Strongest submitted classification mapped onto [0, 1]. GenCC reuses
    /// the ClinGen vocabulary plus "Supportive".
    pub fn classification_strength(&self) -> f64 {
        self.classifications
            .iter()
            .map(|c| {
                if c.eq_ignore_ascii_case("Supportive") {
                    0.4
                } else {
                    clingen_classification_score(c)
                }
            })
            .fold(0.0, f64::max)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HpoEvidence {
    #[serde(default)]
    pub hpo_terms: Vec<HpoTerm>,
    /// Subset of `hpo_terms` under the kidney/urinary branch.
    #[serde(default)]
    pub kidney_phenotypes: Vec<HpoTerm>,
    pub kidney_phenotype_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HpoTerm {
    pub term_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClinVarEvidence {
    #[serde(default)]
    pub variant_types: BTreeMap<String, u32>,
    #[serde(default)]
    pub molecular_consequences: BTreeMap<String, u32>,
    pub consequence_categories: ConsequenceCategories,
    #[serde(default)]
    pub top_molecular_consequences: Vec<String>,
    pub truncating_percentage: f64,
    pub total_variants: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsequenceCategories {
    pub truncating: u32,
    pub missense: u32,
    pub inframe: u32,
    pub splice: u32,
    pub regulatory: u32,
    pub intronic: u32,
    pub noncoding: u32,
    pub other: u32,
}

impl ClinVarEvidence {
    /// Category-weighted variant load with truncating variants boosted.
    pub fn weighted_variant_load(&self) -> f64 {
        let c = &self.consequence_categories;
        2.0 * f64::from(c.truncating)
            + 1.0 * f64::from(c.missense)
            + 0.8 * f64::from(c.inframe)
            + 1.0 * f64::from(c.splice)
            + 0.4 * f64::from(c.regulatory)
            + 0.2 * f64::from(c.intronic)
            + 0.2 * f64::from(c.noncoding)
            + 0.1 * f64::from(c.other)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PubTatorEvidence {
    #[serde(default)]
    pub pmids: Vec<String>,
    pub publication_count: u32,
    pub total_mentions: u32,
    #[serde(default)]
    pub mentions: Vec<PublicationMention>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicationMention {
    pub pmid: String,
    pub mention_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StringPpiEvidence {
    #[serde(default)]
    pub interactions: Vec<PpiInteraction>,
    pub ppi_score: f64,
    pub interaction_count: u32,
    pub percentile: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PpiInteraction {
    pub partner_symbol: String,
    /// STRING combined score, 0..=999.
    pub string_score: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partner_gene_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticPanelsEvidence {
    #[serde(default)]
    pub panels: Vec<String>,
    #[serde(default)]
    pub providers: Vec<String>,
    pub panel_count: u32,
    pub provider_count: u32,
}

/// A persisted evidence row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneEvidence {
    pub id: i64,
    pub gene_id: i64,
    pub source_name: SourceName,
    pub evidence_data: EvidenceData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Adapter output before normalization: the gene label as the upstream
/// spelled it, plus the parsed payload.
#[derive(Debug, Clone)]
pub struct RawEvidence {
    pub gene_identifier: String,
    pub evidence_data: EvidenceData,
}
