use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use http_cache_reqwest::{CACacheManager, Cache, CacheMode, HttpCache, HttpCacheOptions};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};

use crate::entities::SourceName;
use crate::entities::evidence::{EvidenceData, RawEvidence};
use crate::error::NephroError;

pub mod clingen;
pub mod clinvar;
pub mod gencc;
pub mod hgnc;
pub mod hpo;
pub mod panelapp;
pub mod panels;
pub mod pubtator;
pub mod rate_limit;
pub mod string_ppi;

/// Responses larger than this are refused; bulk dumps use the streaming
/// client instead.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;
const BODY_EXCERPT_CHARS: usize = 300;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const READ_TIMEOUT: Duration = Duration::from_secs(60);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Process-wide failsafe wrapping every page fetch, above the per-request
/// timeouts and the retry strategy.
pub const FAILSAFE_TIMEOUT: Duration = Duration::from_secs(120);

static NO_CACHE: AtomicBool = AtomicBool::new(false);

/// Disables the HTTP cache tier for this process (`--no-cache`).
pub fn set_no_cache(value: bool) {
    NO_CACHE.store(value, Ordering::Relaxed);
}

pub fn apply_cache_mode(req: reqwest_middleware::RequestBuilder) -> reqwest_middleware::RequestBuilder {
    if NO_CACHE.load(Ordering::Relaxed) {
        req.with_extension(CacheMode::NoStore)
    } else {
        req
    }
}

/// Shared middleware client: exponential-backoff retry around an on-disk
/// HTTP cache (the `http` tier of the cache subsystem). Built once per
/// process.
pub fn shared_client() -> Result<ClientWithMiddleware, NephroError> {
    static SHARED: OnceLock<ClientWithMiddleware> = OnceLock::new();

    if let Some(client) = SHARED.get() {
        return Ok(client.clone());
    }

    let base = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(READ_TIMEOUT)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .user_agent(concat!("nephrodb/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(NephroError::HttpClientInit)?;

    let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
    let client = ClientBuilder::new(base)
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .with(Cache(HttpCache {
            mode: CacheMode::Default,
            manager: CACacheManager::default(),
            options: HttpCacheOptions::default(),
        }))
        .build();

    match SHARED.set(client.clone()) {
        Ok(()) => Ok(client),
        Err(_) => SHARED.get().cloned().ok_or_else(|| NephroError::Api {
            api: "http".into(),
            message: "shared client initialization race".into(),
        }),
    }
}

/// Plain client for bulk downloads that must not round-trip through the
/// response cache (multi-hundred-megabyte dumps).
pub fn streaming_client() -> Result<reqwest::Client, NephroError> {
    static STREAMING: OnceLock<reqwest::Client> = OnceLock::new();

    if let Some(client) = STREAMING.get() {
        return Ok(client.clone());
    }

    let client = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        // Bulk dumps stream for minutes; cap only the connect phase.
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .user_agent(concat!("nephrodb/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(NephroError::HttpClientInit)?;

    match STREAMING.set(client.clone()) {
        Ok(()) => Ok(client),
        Err(_) => STREAMING.get().cloned().ok_or_else(|| NephroError::Api {
            api: "http".into(),
            message: "streaming client initialization race".into(),
        }),
    }
}

pub fn env_base(default: &'static str, env: &str) -> Cow<'static, str> {
    match std::env::var(env) {
        Ok(value) if !value.trim().is_empty() => Cow::Owned(value),
        _ => Cow::Borrowed(default),
    }
}

pub async fn read_limited_body(
    resp: reqwest::Response,
    api: &str,
) -> Result<Vec<u8>, NephroError> {
    let bytes = resp.bytes().await.map_err(|err| NephroError::Api {
        api: api.to_string(),
        message: format!("failed to read response body: {err}"),
    })?;
    if bytes.len() > MAX_BODY_BYTES {
        return Err(NephroError::Api {
            api: api.to_string(),
            message: format!(
                "response body of {} bytes exceeds the {MAX_BODY_BYTES} byte limit",
                bytes.len()
            ),
        });
    }
    Ok(bytes.to_vec())
}

pub fn body_excerpt(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim();
    if trimmed.chars().count() <= BODY_EXCERPT_CHARS {
        trimmed.to_string()
    } else {
        let excerpt: String = trimmed.chars().take(BODY_EXCERPT_CHARS).collect();
        format!("{excerpt}…")
    }
}

/// Wraps a page fetch in the hard failsafe timeout. The per-request
/// connect/read timeouts and the retry strategy live inside `fut`; this
/// is the outermost cancellation layer.
pub async fn with_failsafe<T>(
    api: &str,
    limit: Duration,
    fut: impl std::future::Future<Output = Result<T, NephroError>>,
) -> Result<T, NephroError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(NephroError::Timeout {
            api: api.to_string(),
            limit_secs: limit.as_secs(),
        }),
    }
}

/// Maps a 429 into the rate-limit error kind, honoring Retry-After.
pub fn check_rate_limited(api: &str, resp: &reqwest::Response) -> Result<(), NephroError> {
    if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        return Err(NephroError::RateLimited {
            api: api.to_string(),
            retry_after_secs,
        });
    }
    Ok(())
}

/// Streams a bulk download to a temp file, so multi-hundred-megabyte
/// dumps never sit in memory. The caller parses the file in a blocking
/// task.
pub async fn download_to_temp(
    client: &reqwest::Client,
    url: &str,
    api: &str,
) -> Result<tempfile::TempPath, NephroError> {
    use futures::StreamExt;
    use tokio::io::AsyncWriteExt;

    rate_limit::wait_for_url_str(url).await;
    let resp = client.get(url).send().await?;
    check_rate_limited(api, &resp)?;
    let status = resp.status();
    if !status.is_success() {
        let bytes = read_limited_body(resp, api).await.unwrap_or_default();
        return Err(NephroError::Api {
            api: api.to_string(),
            message: format!("HTTP {status}: {}", body_excerpt(&bytes)),
        });
    }

    let (std_file, path) = tempfile::NamedTempFile::new()?.into_parts();
    let mut file = tokio::fs::File::from_std(std_file);
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| NephroError::Api {
            api: api.to_string(),
            message: format!("download interrupted: {err}"),
        })?;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(path)
}

/// Lazily materialized record set for bulk-download sources.
///
/// These sources have no upstream pagination: the whole dataset is
/// fetched and aggregated once per run, then served as deterministic
/// pseudo-pages so checkpointing and pause work exactly as they do for
/// genuinely paginated sources.
pub struct BulkPager {
    records: tokio::sync::Mutex<Option<Arc<Vec<RawEvidence>>>>,
    page_size: usize,
}

impl BulkPager {
    pub fn new(page_size: usize) -> Self {
        BulkPager {
            records: tokio::sync::Mutex::new(None),
            page_size,
        }
    }

    pub async fn page<F, Fut>(&self, page: u64, load: F) -> Result<FetchedPage, NephroError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<RawEvidence>, NephroError>>,
    {
        let records = {
            let mut cell = self.records.lock().await;
            match cell.as_ref() {
                Some(records) => records.clone(),
                None => {
                    let mut loaded = load().await?;
                    // Stable order across runs: resumption must see the
                    // same pseudo-page boundaries.
                    loaded.sort_by(|a, b| a.gene_identifier.cmp(&b.gene_identifier));
                    let records = Arc::new(loaded);
                    *cell = Some(records.clone());
                    records
                }
            }
        };

        let total_pages = (records.len().max(1)).div_ceil(self.page_size) as u64;
        let start = (page as usize).saturating_mul(self.page_size);
        let end = start.saturating_add(self.page_size).min(records.len());
        let slice = if start >= records.len() {
            Vec::new()
        } else {
            records[start..end].to_vec()
        };
        Ok(FetchedPage {
            records: slice,
            page,
            total_pages: Some(total_pages),
            dedup_ids: Vec::new(),
            has_more: page + 1 < total_pages,
        })
    }

    /// Drops the materialized set so the next run reloads upstream.
    pub async fn reset(&self) {
        *self.records.lock().await = None;
    }
}

/// One page of adapter output.
///
/// `fetch_incremental` and `fetch_all` iterate the same page sequence in
/// the same order; incremental mode just stops early, so the incremental
/// prefix always equals the full run's prefix.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub records: Vec<RawEvidence>,
    pub page: u64,
    pub total_pages: Option<u64>,
    /// Identifiers the duplicate-rate stop condition checks against the
    /// store (PMIDs for PubTator). Empty for sources without incremental
    /// support.
    pub dedup_ids: Vec<String>,
    pub has_more: bool,
}

/// Common adapter contract. One implementation per upstream source,
/// registered by name and discovered by the orchestrator.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> SourceName;

    /// Dataset version recorded on evidence rows, when upstream has one.
    fn version(&self) -> Option<String> {
        None
    }

    /// Hosts this adapter talks to; the orchestrator configures the
    /// shared pacer for each at startup.
    fn rate_limit_hosts(&self) -> Vec<String> {
        Vec::new()
    }

    /// Whether the duplicate-rate stop condition applies (`smart` mode
    /// degrades to a plain full fetch when it does not).
    fn supports_incremental(&self) -> bool {
        false
    }

    /// Called once before the first page of a run. Bulk adapters drop
    /// their materialized dataset here so the run sees fresh upstream
    /// data.
    async fn prepare_run(&self) -> Result<(), NephroError> {
        Ok(())
    }

    /// Fetches one page, zero-based. Implementations must produce a
    /// stable ordering across runs: relevance-descending for PubTator,
    /// deterministic aggregation order for bulk sources.
    async fn fetch_page(&self, page: u64) -> Result<FetchedPage, NephroError>;

    /// Folds a freshly fetched record into the currently persisted
    /// payload. The default replaces; accumulating sources (PubTator)
    /// merge instead.
    fn merge_existing(&self, new: EvidenceData, _existing: EvidenceData) -> EvidenceData {
        new
    }

    /// Payloads that also belong in `gene_annotations` for indexed
    /// queries (STRING edges, HPO term arrays).
    fn wants_annotation(&self) -> bool {
        false
    }
}

/// Adapter registry keyed by source name.
#[derive(Default)]
pub struct SourceRegistry {
    adapters: HashMap<SourceName, Arc<dyn SourceAdapter>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        SourceRegistry::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.insert(adapter.name(), adapter);
    }

    pub fn get(&self, source: SourceName) -> Result<Arc<dyn SourceAdapter>, NephroError> {
        self.adapters
            .get(&source)
            .cloned()
            .ok_or_else(|| NephroError::NotFound {
                entity: "source adapter".into(),
                id: source.as_str().into(),
                suggestion: format!("Registered: {}", self.names().join(", ")),
            })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .adapters
            .keys()
            .map(|name| name.as_str().to_string())
            .collect();
        names.sort();
        names
    }

    pub fn sources(&self) -> Vec<SourceName> {
        let mut sources: Vec<SourceName> = self.adapters.keys().copied().collect();
        sources.sort();
        sources
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_excerpt_truncates_long_bodies() {
        let short = body_excerpt(b"  hello  ");
        assert_eq!(short, "hello");

        let long = "x".repeat(1000);
        let excerpt = body_excerpt(long.as_bytes());
        assert!(excerpt.chars().count() <= BODY_EXCERPT_CHARS + 1);
        assert!(excerpt.ends_with('…'));
    }

    #[test]
    fn env_base_prefers_non_empty_override() {
        // Unset variable falls through to the default.
        assert_eq!(
            env_base("https://example.org", "NEPHRODB_TEST_UNSET_BASE"),
            "https://example.org"
        );
    }

    #[tokio::test]
    async fn failsafe_cancels_overrunning_fetches() {
        let result: Result<(), _> = with_failsafe("slowapi", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        match result {
            Err(NephroError::Timeout { api, .. }) => assert_eq!(api, "slowapi"),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn registry_round_trips_and_reports_unknown() {
        struct Dummy;
        #[async_trait]
        impl SourceAdapter for Dummy {
            fn name(&self) -> SourceName {
                SourceName::PanelApp
            }
            async fn fetch_page(&self, _page: u64) -> Result<FetchedPage, NephroError> {
                unreachable!("not fetched in this test")
            }
        }

        let mut registry = SourceRegistry::new();
        registry.register(Arc::new(Dummy));
        assert!(registry.get(SourceName::PanelApp).is_ok());
        assert!(matches!(
            registry.get(SourceName::PubTator),
            Err(NephroError::NotFound { .. })
        ));
        assert_eq!(registry.names(), vec!["panelapp".to_string()]);
    }
}
