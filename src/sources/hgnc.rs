//! HGNC complete-set snapshot client.
//!
//! Downloads the bulk TSV of approved genes and parses it into
//! [`HgncRecord`]s. The raw document's md5 is kept alongside so a
//! re-applied identical snapshot can be detected without row diffing.

use std::borrow::Cow;
use std::io::Read;

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};

use crate::error::NephroError;

const HGNC_BASE: &str =
    "https://storage.googleapis.com/public-download-files/hgnc/tsv/tsv/hgnc_complete_set.txt";
const HGNC_API: &str = "hgnc";
const HGNC_BASE_ENV: &str = "NEPHRODB_HGNC_BASE";

/// One approved gene from the HGNC complete set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HgncRecord {
    /// HGNC accession, e.g. "HGNC:9008".
    pub hgnc_id: String,
    /// Approved symbol, e.g. "PKD1".
    pub approved_symbol: String,
    pub name: String,
    /// Pipe-separated in the TSV; split here.
    pub aliases: Vec<String>,
    pub previous_symbols: Vec<String>,
    pub ensembl_gene_id: Option<String>,
}

/// A parsed snapshot plus the content hash of the raw document.
#[derive(Debug, Clone)]
pub struct HgncSnapshot {
    pub records: Vec<HgncRecord>,
    pub content_hash: String,
}

pub struct HgncClient {
    client: reqwest::Client,
    base: Cow<'static, str>,
}

impl HgncClient {
    pub fn new() -> Result<Self, NephroError> {
        Ok(Self {
            client: crate::sources::streaming_client()?,
            base: crate::sources::env_base(HGNC_BASE, HGNC_BASE_ENV),
        })
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(base: String) -> Result<Self, NephroError> {
        Ok(Self {
            client: crate::sources::streaming_client()?,
            base: Cow::Owned(base),
        })
    }

    /// Downloads and parses the current complete set.
    pub async fn fetch_snapshot(&self) -> Result<HgncSnapshot, NephroError> {
        crate::sources::rate_limit::wait_for_url_str(self.base.as_ref()).await;
        let resp = self.client.get(self.base.as_ref()).send().await?;
        crate::sources::check_rate_limited(HGNC_API, &resp)?;
        let status = resp.status();
        let bytes = resp.bytes().await.map_err(|err| NephroError::Api {
            api: HGNC_API.to_string(),
            message: format!("failed to read snapshot body: {err}"),
        })?;
        if !status.is_success() {
            return Err(NephroError::Api {
                api: HGNC_API.to_string(),
                message: format!("HTTP {status}: {}", crate::sources::body_excerpt(&bytes)),
            });
        }

        let mut payload = bytes.to_vec();
        if payload.starts_with(&[0x1f, 0x8b]) {
            let mut decoder = GzDecoder::new(payload.as_slice());
            let mut decoded = Vec::new();
            decoder
                .read_to_end(&mut decoded)
                .map_err(|err| NephroError::Api {
                    api: HGNC_API.to_string(),
                    message: format!("failed to decode gzip snapshot: {err}"),
                })?;
            payload = decoded;
        }

        let content_hash = format!("{:x}", md5::compute(&payload));
        let text = String::from_utf8_lossy(&payload);
        let records = parse_complete_set(&text)?;
        Ok(HgncSnapshot {
            records,
            content_hash,
        })
    }
}

/// Parses the HGNC complete-set TSV, keeping approved entries only.
pub fn parse_complete_set(tsv: &str) -> Result<Vec<HgncRecord>, NephroError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .quoting(false)
        .from_reader(tsv.as_bytes());

    let headers = reader
        .headers()
        .map_err(|err| NephroError::Api {
            api: HGNC_API.to_string(),
            message: format!("snapshot has no header row: {err}"),
        })?
        .clone();
    let index = |name: &str| headers.iter().position(|h| h == name);
    let (Some(id_col), Some(symbol_col), Some(status_col)) = (
        index("hgnc_id"),
        index("symbol"),
        index("status"),
    ) else {
        return Err(NephroError::Api {
            api: HGNC_API.to_string(),
            message: "snapshot is missing hgnc_id/symbol/status columns".into(),
        });
    };
    let name_col = index("name");
    let alias_col = index("alias_symbol");
    let prev_col = index("prev_symbol");
    let ensembl_col = index("ensembl_gene_id");

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|err| NephroError::Api {
            api: HGNC_API.to_string(),
            message: format!("malformed snapshot row: {err}"),
        })?;
        let get = |col: Option<usize>| col.and_then(|c| row.get(c)).unwrap_or("").trim();

        if !get(Some(status_col)).contains("Approved") {
            continue;
        }
        let hgnc_id = get(Some(id_col));
        let symbol = get(Some(symbol_col));
        if hgnc_id.is_empty() || symbol.is_empty() {
            continue;
        }

        records.push(HgncRecord {
            hgnc_id: hgnc_id.to_string(),
            approved_symbol: symbol.to_string(),
            name: get(name_col).to_string(),
            aliases: split_pipe(get(alias_col)),
            previous_symbols: split_pipe(get(prev_col)),
            ensembl_gene_id: match get(ensembl_col) {
                "" => None,
                value => Some(value.to_string()),
            },
        });
    }
    Ok(records)
}

fn split_pipe(value: &str) -> Vec<String> {
    value
        .split('|')
        .map(str::trim)
        .map(|s| s.trim_matches('"'))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
pub(crate) fn sample_tsv() -> String {
    let header = "hgnc_id\tsymbol\tname\tlocus_group\tlocus_type\tstatus\tlocation\tlocation_sortable\talias_symbol\talias_name\tprev_symbol\tprev_name\tentrez_id\tensembl_gene_id";
    let pkd1 = "HGNC:9008\tPKD1\tpolycystin 1, transient receptor potential channel interacting\tprotein-coding gene\tgene with protein product\tApproved\t16p13.3\t16p13.3\tPBP\t\t\t\t5310\tENSG00000008710";
    let pkd2 = "HGNC:9009\tPKD2\tpolycystin 2, transient receptor potential cation channel\tprotein-coding gene\tgene with protein product\tApproved\t4q22.1\t4q22.1\tTRPP2|PC2\t\t\t\t5311\tENSG00000118762";
    let nphs2 = "HGNC:13394\tNPHS2\tNPHS2 stomatin family member, podocin\tprotein-coding gene\tgene with protein product\tApproved\t1q25.2\t1q25.2\t\t\tSRN1\t\t7827\tENSG00000116218";
    let withdrawn = "HGNC:99999\tOLDGENE\twithdrawn entry\tother\tunknown\tEntry Withdrawn\t\t\t\t\t\t\t\t";
    format!("{header}\n{pkd1}\n{pkd2}\n{nphs2}\n{withdrawn}\n")
}
