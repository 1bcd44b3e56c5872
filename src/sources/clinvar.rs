//! ClinVar variant-summary adapter.
//!
//! Streams the `variant_summary.txt.gz` dump to disk, then parses it in
//! a blocking task: pathogenic and likely-pathogenic variants are
//! bucketed per gene into molecular-consequence categories, with
//! truncating variants tracked separately — their share is a scoring
//! signal of its own.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io::BufReader;
use std::sync::OnceLock;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use regex::Regex;

use crate::entities::SourceName;
use crate::entities::evidence::{
    ClinVarEvidence, ConsequenceCategories, EvidenceData, RawEvidence,
};
use crate::error::NephroError;
use crate::sources::{BulkPager, FetchedPage, SourceAdapter};

const CLINVAR_BASE: &str =
    "https://ftp.ncbi.nlm.nih.gov/pub/clinvar/tab_delimited/variant_summary.txt.gz";
const CLINVAR_API: &str = "clinvar";
const CLINVAR_BASE_ENV: &str = "NEPHRODB_CLINVAR_BASE";

const RECORDS_PER_PAGE: usize = 500;
/// One assembly is enough; rows are duplicated per assembly.
const ASSEMBLY: &str = "GRCh38";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Consequence {
    Truncating,
    Missense,
    Inframe,
    Splice,
    Regulatory,
    Intronic,
    Noncoding,
    Other,
}

impl Consequence {
    fn label(self) -> &'static str {
        match self {
            Consequence::Truncating => "truncating",
            Consequence::Missense => "missense",
            Consequence::Inframe => "inframe",
            Consequence::Splice => "splice",
            Consequence::Regulatory => "regulatory",
            Consequence::Intronic => "intronic",
            Consequence::Noncoding => "noncoding",
            Consequence::Other => "other",
        }
    }
}

fn protein_change_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\(p\.([A-Za-z]{3})\d+([A-Za-z]{3}|\*|=)\)").expect("valid regex")
    })
}

fn splice_site_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"c\.[\d*-]+[+-][12](?:[ACGT]|del|dup|_)").expect("valid regex")
    })
}

fn deep_intronic_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"c\.[\d*-]+[+-]\d{2,}").expect("valid regex"))
}

/// Buckets an HGVS variant name into a consequence category.
pub(crate) fn categorize(name: &str, variant_type: &str) -> Consequence {
    if let Some(caps) = protein_change_re().captures(name) {
        let to = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        return match to {
            "Ter" | "*" => Consequence::Truncating,
            "=" => Consequence::Noncoding,
            "del" | "dup" | "ins" => Consequence::Inframe,
            _ => Consequence::Missense,
        };
    }
    if name.contains("fs") && name.contains("(p.") {
        return Consequence::Truncating;
    }
    if splice_site_re().is_match(name) {
        return Consequence::Splice;
    }
    if deep_intronic_re().is_match(name) {
        return Consequence::Intronic;
    }
    if name.contains("c.-") {
        return Consequence::Regulatory;
    }
    if name.contains("c.*") {
        return Consequence::Noncoding;
    }
    let lowered = variant_type.to_lowercase();
    if (lowered.contains("deletion") || lowered.contains("duplication") || lowered.contains("indel"))
        && name.contains("(p.")
    {
        return Consequence::Inframe;
    }
    Consequence::Other
}

#[derive(Default)]
struct GeneTally {
    variant_types: BTreeMap<String, u32>,
    molecular_consequences: BTreeMap<String, u32>,
    categories: ConsequenceCategories,
    total: u32,
}

pub struct ClinVarAdapter {
    client: reqwest::Client,
    base: Cow<'static, str>,
    pager: BulkPager,
}

impl ClinVarAdapter {
    pub fn new() -> Result<Self, NephroError> {
        Ok(Self {
            client: crate::sources::streaming_client()?,
            base: crate::sources::env_base(CLINVAR_BASE, CLINVAR_BASE_ENV),
            pager: BulkPager::new(RECORDS_PER_PAGE),
        })
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(base: String) -> Result<Self, NephroError> {
        Ok(Self {
            client: crate::sources::streaming_client()?,
            base: Cow::Owned(base),
            pager: BulkPager::new(RECORDS_PER_PAGE),
        })
    }

    async fn load_all(&self) -> Result<Vec<RawEvidence>, NephroError> {
        let path =
            crate::sources::download_to_temp(&self.client, self.base.as_ref(), CLINVAR_API)
                .await?;
        tokio::task::spawn_blocking(move || parse_variant_summary_file(path.to_path_buf()))
            .await
            .map_err(|err| NephroError::Api {
                api: CLINVAR_API.to_string(),
                message: format!("variant summary parse task failed: {err}"),
            })?
    }
}

fn parse_variant_summary_file(
    path: std::path::PathBuf,
) -> Result<Vec<RawEvidence>, NephroError> {
    let file = std::fs::File::open(&path)?;
    let reader: Box<dyn std::io::Read> = {
        let mut magic = [0u8; 2];
        use std::io::{Read, Seek};
        let mut probe = std::fs::File::open(&path)?;
        let is_gz = probe.read_exact(&mut magic).is_ok() && magic == [0x1f, 0x8b];
        probe.seek(std::io::SeekFrom::Start(0))?;
        drop(probe);
        if is_gz {
            Box::new(GzDecoder::new(BufReader::new(file)))
        } else {
            Box::new(BufReader::new(file))
        }
    };
    parse_variant_summary(reader)
}

pub(crate) fn parse_variant_summary(
    reader: impl std::io::Read,
) -> Result<Vec<RawEvidence>, NephroError> {
    let mut csv = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .quoting(false)
        .from_reader(reader);

    let headers = csv
        .headers()
        .map_err(|err| NephroError::Api {
            api: CLINVAR_API.to_string(),
            message: format!("variant summary has no header: {err}"),
        })?
        .clone();
    let col = |name: &str| {
        headers
            .iter()
            .position(|h| h.trim_start_matches('#').eq_ignore_ascii_case(name))
    };
    let (Some(symbol_col), Some(name_col), Some(type_col), Some(sig_col), Some(assembly_col)) = (
        col("GeneSymbol"),
        col("Name"),
        col("Type"),
        col("ClinicalSignificance"),
        col("Assembly"),
    ) else {
        return Err(NephroError::Api {
            api: CLINVAR_API.to_string(),
            message: "variant summary is missing required columns".into(),
        });
    };

    let mut per_gene: BTreeMap<String, GeneTally> = BTreeMap::new();
    for row in csv.records() {
        let Ok(row) = row else { continue };
        let get = |c: usize| row.get(c).unwrap_or("").trim();
        if get(assembly_col) != ASSEMBLY {
            continue;
        }
        // Disease-relevant variants only.
        let significance = get(sig_col).to_lowercase();
        if !significance.contains("pathogenic") || significance.contains("conflicting") {
            continue;
        }
        let symbol = get(symbol_col).to_uppercase();
        if symbol.is_empty() || symbol == "-" || symbol.contains(';') {
            continue;
        }

        let name = get(name_col);
        let variant_type = get(type_col);
        let consequence = categorize(name, variant_type);

        let tally = per_gene.entry(symbol).or_default();
        tally.total += 1;
        *tally
            .variant_types
            .entry(variant_type.to_string())
            .or_insert(0) += 1;
        *tally
            .molecular_consequences
            .entry(consequence.label().to_string())
            .or_insert(0) += 1;
        let c = &mut tally.categories;
        match consequence {
            Consequence::Truncating => c.truncating += 1,
            Consequence::Missense => c.missense += 1,
            Consequence::Inframe => c.inframe += 1,
            Consequence::Splice => c.splice += 1,
            Consequence::Regulatory => c.regulatory += 1,
            Consequence::Intronic => c.intronic += 1,
            Consequence::Noncoding => c.noncoding += 1,
            Consequence::Other => c.other += 1,
        }
    }

    Ok(per_gene
        .into_iter()
        .map(|(symbol, tally)| {
            let mut top: Vec<(String, u32)> = tally
                .molecular_consequences
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect();
            top.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
            let truncating_percentage = if tally.total > 0 {
                100.0 * f64::from(tally.categories.truncating) / f64::from(tally.total)
            } else {
                0.0
            };
            RawEvidence {
                gene_identifier: symbol,
                evidence_data: EvidenceData::ClinVar(ClinVarEvidence {
                    variant_types: tally.variant_types,
                    molecular_consequences: tally.molecular_consequences,
                    consequence_categories: tally.categories,
                    top_molecular_consequences: top
                        .into_iter()
                        .take(3)
                        .map(|(label, _)| label)
                        .collect(),
                    truncating_percentage,
                    total_variants: tally.total,
                }),
            }
        })
        .collect())
}

#[async_trait]
impl SourceAdapter for ClinVarAdapter {
    fn name(&self) -> SourceName {
        SourceName::ClinVar
    }

    fn rate_limit_hosts(&self) -> Vec<String> {
        vec![crate::sources::rate_limit::host_of(self.base.as_ref())]
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

    #[test]
    fn hgvs_names_bucket_into_categories() {
        assert_eq!(
            categorize("NM_000296.4(PKD1):c.12136C>T (p.Arg4046Ter)", "single nucleotide variant"),
            Consequence::Truncating
        );
        assert_eq!(
            categorize("NM_000296.4(PKD1):c.8311G>A (p.Glu2771Lys)", "single nucleotide variant"),
            Consequence::Missense
        );
        assert_eq!(
            categorize("NM_000296.4(PKD1):c.7288_7290del (p.Thr2430del)", "Deletion"),
            Consequence::Inframe
        );
        assert_eq!(
            categorize("NM_000296.4(PKD1):c.2097+1G>A", "single nucleotide variant"),
            Consequence::Splice
        );
        assert_eq!(
            categorize("NM_000296.4(PKD1):c.2097+104A>G", "single nucleotide variant"),
            Consequence::Intronic
        );
        assert_eq!(
            categorize("NM_000296.4(PKD1):c.-29G>A", "single nucleotide variant"),
            Consequence::Regulatory
        );
        assert_eq!(
            categorize("NM_000296.4(PKD1):c.1521C>T (p.Ser507=)", "single nucleotide variant"),
            Consequence::Noncoding
        );
        assert_eq!(
            categorize("NM_000296.4(PKD1):c.9087dup (p.Glu3030Argfs)", "Duplication"),
            Consequence::Truncating
        );
    }

    fn fixture() -> String {
        let header = "#AlleleID\tType\tName\tGeneID\tGeneSymbol\tHGNC_ID\tClinicalSignificance\tClinSigSimple\tLastEvaluated\tRS# (dbSNP)\tnsv/esv (dbVar)\tRCVaccession\tPhenotypeIDS\tPhenotypeList\tOrigin\tOriginSimple\tAssembly";
        let rows = [
            "1\tsingle nucleotide variant\tNM_000296.4(PKD1):c.12136C>T (p.Arg4046Ter)\t5310\tPKD1\tHGNC:9008\tPathogenic\t1\t-\t-\t-\t-\t-\t-\tgermline\tgermline\tGRCh38",
            "1\tsingle nucleotide variant\tNM_000296.4(PKD1):c.12136C>T (p.Arg4046Ter)\t5310\tPKD1\tHGNC:9008\tPathogenic\t1\t-\t-\t-\t-\t-\t-\tgermline\tgermline\tGRCh37",
            "2\tsingle nucleotide variant\tNM_000296.4(PKD1):c.8311G>A (p.Glu2771Lys)\t5310\tPKD1\tHGNC:9008\tLikely pathogenic\t1\t-\t-\t-\t-\t-\t-\tgermline\tgermline\tGRCh38",
            "3\tsingle nucleotide variant\tNM_000296.4(PKD1):c.100A>G (p.Thr34Ala)\t5310\tPKD1\tHGNC:9008\tBenign\t0\t-\t-\t-\t-\t-\t-\tgermline\tgermline\tGRCh38",
            "4\tsingle nucleotide variant\tNM_004612.5(TGFBR1):c.1A>G (p.Met1Val)\t7046\tTGFBR1\tHGNC:11772\tConflicting interpretations of pathogenicity\t0\t-\t-\t-\t-\t-\t-\tgermline\tgermline\tGRCh38",
        ];
        format!("{header}\n{}\n", rows.join("\n"))
    }

    #[test]
    fn parse_filters_assembly_and_significance() {
        let records = parse_variant_summary(fixture().as_bytes()).unwrap();
        assert_eq!(records.len(), 1);

        let EvidenceData::ClinVar(evidence) = &records[0].evidence_data else {
            panic!("wrong variant");
        };
        // GRCh37 duplicate, benign, and conflicting rows all dropped.
        assert_eq!(evidence.total_variants, 2);
        assert_eq!(evidence.consequence_categories.truncating, 1);
        assert_eq!(evidence.consequence_categories.missense, 1);
        assert!((evidence.truncating_percentage - 50.0).abs() < f64::EPSILON);
        assert_eq!(evidence.top_molecular_consequences.len(), 2);
    }

    #[tokio::test]
    async fn load_all_round_trips_through_temp_file() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(fixture()))
            .mount(&server)
            .await;

        let adapter = ClinVarAdapter::new_for_test(server.uri()).unwrap();
        let page = adapter.fetch_page(0).await.unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].gene_identifier, "PKD1");
    }
}
