use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::error::NephroError;

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthRow {
    pub api: String,
    pub status: String,
    pub latency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affects: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthReport {
    pub healthy: usize,
    pub total: usize,
    pub rows: Vec<HealthRow>,
}

impl HealthReport {
    pub fn all_healthy(&self) -> bool {
        self.healthy == self.total
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        let show_affects = self.rows.iter().any(|row| row.affects.is_some());
        out.push_str("# Upstream Health Check\n\n");
        if show_affects {
            out.push_str("| API | Status | Latency | Affects |\n");
            out.push_str("|-----|--------|---------|---------|\n");
            for row in &self.rows {
                let affects = row.affects.as_deref().unwrap_or("-");
                out.push_str(&format!(
                    "| {} | {} | {} | {} |\n",
                    row.api, row.status, row.latency, affects
                ));
            }
        } else {
            out.push_str("| API | Status | Latency |\n");
            out.push_str("|-----|--------|---------|\n");
            for row in &self.rows {
                out.push_str(&format!(
                    "| {} | {} | {} |\n",
                    row.api, row.status, row.latency
                ));
            }
        }
        out.push_str(&format!(
            "\nStatus: {}/{} APIs healthy\n",
            self.healthy, self.total
        ));
        out
    }
}

fn affects_for_api(api: &str) -> Option<&'static str> {
    match api {
        "HGNC" => Some("identifier normalization and snapshot refresh"),
        "PanelApp" => Some("panel membership evidence"),
        "ClinGen" => Some("gene-disease validity evidence"),
        "GenCC" => Some("submitted classification evidence"),
        "HPO" => Some("phenotype evidence and enrichment annotations"),
        "ClinVar" => Some("variant consequence evidence"),
        "PubTator3" => Some("literature evidence and smart updates"),
        "STRING" => Some("interaction annotations and network builds"),
        "Enrichr" => Some("GO/KEGG enrichment sections"),
        _ => None,
    }
}

async fn check_one(client: reqwest::Client, api: &str, url: &str) -> HealthRow {
    let start = Instant::now();
    let resp = client
        .head(url)
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await;

    match resp {
        Ok(resp) => {
            let status = resp.status();
            let elapsed = start.elapsed().as_millis();
            // HEAD is not universally supported; 405 still proves the
            // host answers.
            if status.is_success() || status == reqwest::StatusCode::METHOD_NOT_ALLOWED {
                HealthRow {
                    api: api.to_string(),
                    status: "ok".into(),
                    latency: format!("{elapsed}ms"),
                    affects: None,
                }
            } else {
                HealthRow {
                    api: api.to_string(),
                    status: "error".into(),
                    latency: format!("{elapsed}ms (HTTP {})", status.as_u16()),
                    affects: affects_for_api(api).map(str::to_string),
                }
            }
        }
        Err(err) => {
            let reason = if err.is_timeout() {
                "timeout"
            } else if err.is_connect() {
                "connect"
            } else {
                "error"
            };
            HealthRow {
                api: api.to_string(),
                status: "error".into(),
                latency: reason.into(),
                affects: affects_for_api(api).map(str::to_string),
            }
        }
    }
}

fn health_http_client() -> Result<reqwest::Client, NephroError> {
    static HEALTH_HTTP_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

    if let Some(client) = HEALTH_HTTP_CLIENT.get() {
        return Ok(client.clone());
    }

    let client = reqwest::Client::builder()
        // Keep health checks snappy and deterministic for the CLI.
        .timeout(Duration::from_secs(10))
        .connect_timeout(Duration::from_secs(5))
        .user_agent(concat!("nephrodb/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(NephroError::HttpClientInit)?;

    match HEALTH_HTTP_CLIENT.set(client.clone()) {
        Ok(()) => Ok(client),
        Err(_) => HEALTH_HTTP_CLIENT
            .get()
            .cloned()
            .ok_or_else(|| NephroError::Api {
                api: "health".into(),
                message: "Health HTTP client initialization race".into(),
            }),
    }
}

/// Probes every upstream the adapters depend on.
///
/// # Errors
///
/// Returns an error when the shared HTTP client cannot be created.
pub async fn check() -> Result<HealthReport, NephroError> {
    let client = health_http_client()?;

    let (hgnc, panelapp, clingen, gencc, hpo, clinvar, pubtator, string, enrichr) = tokio::join!(
        check_one(
            client.clone(),
            "HGNC",
            "https://storage.googleapis.com/public-download-files/hgnc/tsv/tsv/hgnc_complete_set.txt"
        ),
        check_one(
            client.clone(),
            "PanelApp",
            "https://panelapp.genomics.england.ac.uk/api/v1/panels/?page=1"
        ),
        check_one(
            client.clone(),
            "ClinGen",
            "https://search.clinicalgenome.org/kb/gene-validity/download"
        ),
        check_one(
            client.clone(),
            "GenCC",
            "https://search.thegencc.org/download/action/submissions-export-csv"
        ),
        check_one(
            client.clone(),
            "HPO",
            "http://purl.obolibrary.org/obo/hp/hpoa/genes_to_phenotype.txt"
        ),
        check_one(
            client.clone(),
            "ClinVar",
            "https://ftp.ncbi.nlm.nih.gov/pub/clinvar/tab_delimited/variant_summary.txt.gz"
        ),
        check_one(
            client.clone(),
            "PubTator3",
            "https://www.ncbi.nlm.nih.gov/research/pubtator3-api/search/?text=kidney&page=1"
        ),
        check_one(
            client.clone(),
            "STRING",
            "https://stringdb-downloads.org/download/protein.info.v12.0/9606.protein.info.v12.0.txt.gz"
        ),
        check_one(
            client.clone(),
            "Enrichr",
            "https://maayanlab.cloud/Enrichr/datasetStatistics"
        ),
    );

    let rows = vec![
        hgnc, panelapp, clingen, gencc, hpo, clinvar, pubtator, string, enrichr,
    ];
    let healthy = rows.iter().filter(|r| r.status == "ok").count();
    Ok(HealthReport {
        healthy,
        total: rows.len(),
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::{HealthReport, HealthRow};

    #[test]
    fn markdown_shows_affects_column_when_present() {
        let report = HealthReport {
            healthy: 1,
            total: 2,
            rows: vec![
                HealthRow {
                    api: "HGNC".into(),
                    status: "ok".into(),
                    latency: "10ms".into(),
                    affects: None,
                },
                HealthRow {
                    api: "PubTator3".into(),
                    status: "error".into(),
                    latency: "timeout".into(),
                    affects: Some("literature evidence and smart updates".into()),
                },
            ],
        };
        let md = report.to_markdown();
        assert!(md.contains("| API | Status | Latency | Affects |"));
        assert!(md.contains("literature evidence"));
        assert!(!report.all_healthy());
    }

    #[test]
    fn markdown_omits_affects_column_when_all_healthy() {
        let report = HealthReport {
            healthy: 2,
            total: 2,
            rows: vec![
                HealthRow {
                    api: "HGNC".into(),
                    status: "ok".into(),
                    latency: "10ms".into(),
                    affects: None,
                },
                HealthRow {
                    api: "STRING".into(),
                    status: "ok".into(),
                    latency: "11ms".into(),
                    affects: None,
                },
            ],
        };
        let md = report.to_markdown();
        assert!(md.contains("| API | Status | Latency |"));
        assert!(!md.contains("| API | Status | Latency | Affects |"));
        assert!(report.all_healthy());
    }
}
