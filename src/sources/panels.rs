//! Structured uploads: commercial diagnostic panels and curated
//! literature lists.
//!
//! These sources have no upstream API; rows arrive as admin uploads in
//! JSON, CSV, or TSV. Parsing produces the same `RawEvidence` stream the
//! fetching adapters do, so persistence and normalization are shared.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::entities::evidence::{
    DiagnosticPanelsEvidence, EvidenceData, PubTatorEvidence, PublicationMention, RawEvidence,
};
use crate::error::NephroError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    DiagnosticPanels,
    Literature,
}

impl UploadKind {
    pub fn from_flag(value: &str) -> Result<Self, NephroError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "diagnostic_panels" | "diagnostic-panels" | "panels" => Ok(UploadKind::DiagnosticPanels),
            "literature" => Ok(UploadKind::Literature),
            other => Err(NephroError::InvalidArgument(format!(
                "Unknown upload kind: {other}\n\nValid kinds:\n- diagnostic_panels\n- literature"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadFormat {
    Json,
    Csv,
    Tsv,
}

impl UploadFormat {
    /// Picks the format from a file name, defaulting to CSV.
    pub fn from_path(path: &str) -> Self {
        let lowered = path.to_lowercase();
        if lowered.ends_with(".json") {
            UploadFormat::Json
        } else if lowered.ends_with(".tsv") || lowered.ends_with(".txt") {
            UploadFormat::Tsv
        } else {
            UploadFormat::Csv
        }
    }
}

/// One uploaded row, shared by both kinds: panels fill `panel`/
/// `provider`, literature fills `pmid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct UploadRow {
    gene: String,
    #[serde(default)]
    panel: Option<String>,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    pmid: Option<String>,
    #[serde(default)]
    mentions: Option<u32>,
}

/// Result reported back to the admin surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadSummary {
    pub genes_processed: u64,
    pub created: u64,
    pub merged: u64,
    /// Identifiers that went to normalization staging instead.
    pub staged: u64,
}

pub fn parse_upload(
    kind: UploadKind,
    format: UploadFormat,
    raw: &[u8],
) -> Result<Vec<RawEvidence>, NephroError> {
    let rows = parse_rows(format, raw)?;
    match kind {
        UploadKind::DiagnosticPanels => Ok(aggregate_panels(rows)),
        UploadKind::Literature => Ok(aggregate_literature(rows)),
    }
}

fn parse_rows(format: UploadFormat, raw: &[u8]) -> Result<Vec<UploadRow>, NephroError> {
    match format {
        UploadFormat::Json => serde_json::from_slice(raw).map_err(|err| {
            NephroError::InvalidArgument(format!("upload is not a JSON array of rows: {err}"))
        }),
        UploadFormat::Csv | UploadFormat::Tsv => {
            let delimiter = if format == UploadFormat::Tsv { b'\t' } else { b',' };
            let mut reader = csv::ReaderBuilder::new()
                .delimiter(delimiter)
                .flexible(true)
                .trim(csv::Trim::All)
                .from_reader(raw);
            let mut rows = Vec::new();
            for row in reader.deserialize::<UploadRow>() {
                rows.push(row.map_err(|err| {
                    NephroError::InvalidArgument(format!("malformed upload row: {err}"))
                })?);
            }
            Ok(rows)
        }
    }
}

fn aggregate_panels(rows: Vec<UploadRow>) -> Vec<RawEvidence> {
    let mut per_gene: BTreeMap<String, DiagnosticPanelsEvidence> = BTreeMap::new();
    for row in rows {
        let symbol = row.gene.trim().to_uppercase();
        if symbol.is_empty() {
            continue;
        }
        let entry = per_gene
            .entry(symbol)
            .or_insert_with(|| DiagnosticPanelsEvidence {
                panels: Vec::new(),
                providers: Vec::new(),
                panel_count: 0,
                provider_count: 0,
            });
        if let Some(panel) = row.panel.as_deref().map(str::trim).filter(|p| !p.is_empty())
            && !entry.panels.iter().any(|p| p == panel)
        {
            entry.panels.push(panel.to_string());
        }
        if let Some(provider) = row
            .provider
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            && !entry.providers.iter().any(|p| p == provider)
        {
            entry.providers.push(provider.to_string());
        }
    }

    per_gene
        .into_iter()
        .map(|(symbol, mut evidence)| {
            evidence.panel_count = evidence.panels.len() as u32;
            evidence.provider_count = evidence.providers.len() as u32;
            RawEvidence {
                gene_identifier: symbol,
                evidence_data: EvidenceData::DiagnosticPanels(evidence),
            }
        })
        .collect()
}

fn aggregate_literature(rows: Vec<UploadRow>) -> Vec<RawEvidence> {
    let mut per_gene: BTreeMap<String, BTreeMap<String, u32>> = BTreeMap::new();
    for row in rows {
        let symbol = row.gene.trim().to_uppercase();
        let Some(pmid) = row.pmid.as_deref().map(str::trim).filter(|p| !p.is_empty()) else {
            continue;
        };
        if symbol.is_empty() {
            continue;
        }
        *per_gene
            .entry(symbol)
            .or_default()
            .entry(pmid.to_string())
            .or_insert(0) += row.mentions.unwrap_or(1);
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_panels_aggregate_by_gene() {
        let raw = b"gene,panel,provider\n\
            PKD1,Renal Panel v4,Invitae\n\
            PKD1,Kidney Complete,Blueprint Genetics\n\
            PKD1,Renal Panel v4,Invitae\n\
            NPHS2,Nephrotic Syndrome,Invitae\n";
        let records =
            parse_upload(UploadKind::DiagnosticPanels, UploadFormat::Csv, raw).unwrap();
        assert_eq!(records.len(), 2);

        let pkd1 = records
            .iter()
            .find(|r| r.gene_identifier == "PKD1")
            .unwrap();
        let EvidenceData::DiagnosticPanels(evidence) = &pkd1.evidence_data else {
            panic!("wrong variant");
        };
        assert_eq!(evidence.panel_count, 2);
        assert_eq!(evidence.provider_count, 2);
    }

    #[test]
    fn tsv_and_json_parse_the_same_rows() {
        let tsv = b"gene\tpanel\tprovider\nPKD1\tRenal Panel\tInvitae\n";
        let json = br#"[{"gene": "PKD1", "panel": "Renal Panel", "provider": "Invitae"}]"#;

        let from_tsv =
            parse_upload(UploadKind::DiagnosticPanels, UploadFormat::Tsv, tsv).unwrap();
        let from_json =
            parse_upload(UploadKind::DiagnosticPanels, UploadFormat::Json, json).unwrap();
        assert_eq!(from_tsv.len(), from_json.len());
        assert_eq!(from_tsv[0].gene_identifier, from_json[0].gene_identifier);
    }

    #[test]
    fn literature_rows_become_publication_evidence() {
        let raw = b"gene,pmid,mentions\nPKD1,31394774,3\nPKD1,31394775,\nUMOD,29891569,2\n";
        let records = parse_upload(UploadKind::Literature, UploadFormat::Csv, raw).unwrap();
        assert_eq!(records.len(), 2);

        let pkd1 = records
            .iter()
            .find(|r| r.gene_identifier == "PKD1")
            .unwrap();
        let EvidenceData::PubTator(evidence) = &pkd1.evidence_data else {
            panic!("wrong variant");
        };
        assert_eq!(evidence.publication_count, 2);
        assert_eq!(evidence.total_mentions, 4);
    }

    #[test]
    fn malformed_rows_are_a_validation_error() {
        let raw = b"not json at all";
        let err = parse_upload(UploadKind::Literature, UploadFormat::Json, raw).unwrap_err();
        assert!(matches!(err, NephroError::InvalidArgument(_)));
    }

    #[test]
    fn format_detection_prefers_extension() {
        assert_eq!(UploadFormat::from_path("panels.JSON"), UploadFormat::Json);
        assert_eq!(UploadFormat::from_path("genes.tsv"), UploadFormat::Tsv);
        assert_eq!(UploadFormat::from_path("export.csv"), UploadFormat::Csv);
        assert_eq!(UploadFormat::from_path("unknown.bin"), UploadFormat::Csv);
    }
}
