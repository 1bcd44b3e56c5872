use thiserror::Error;

/// Error type shared across the crate.
///
/// Variants map to the failure categories the pipeline distinguishes:
/// transient upstream problems are retried by the HTTP middleware and only
/// surface here once the retry budget is exhausted; validation and
/// ambiguity errors are terminal for a single record but never for a run.
#[derive(Debug, Error)]
pub enum NephroError {
    #[error("Failed to initialize HTTP client: {0}")]
    HttpClientInit(reqwest::Error),

    #[error("{api} API error: {message}")]
    Api { api: String, message: String },

    #[error("{api} API returned invalid JSON: {source}")]
    ApiJson {
        api: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{api} rate limited{}", retry_after_secs.map(|s| format!(" (retry after {s}s)")).unwrap_or_default())]
    RateLimited {
        api: String,
        retry_after_secs: Option<u64>,
    },

    #[error("{api} request exceeded the {limit_secs}s failsafe timeout")]
    Timeout { api: String, limit_secs: u64 },

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{entity} not found: {id}\n{suggestion}")]
    NotFound {
        entity: String,
        id: String,
        suggestion: String,
    },

    #[error("Ambiguous gene identifier '{identifier}': matches {}", candidates.join(", "))]
    AmbiguousIdentifier {
        identifier: String,
        candidates: Vec<String>,
    },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Resource limit reached: {0}")]
    ResourceLimit(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<reqwest_middleware::Error> for NephroError {
    fn from(err: reqwest_middleware::Error) -> Self {
        NephroError::Api {
            api: "http".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for NephroError {
    fn from(err: reqwest::Error) -> Self {
        NephroError::Api {
            api: "http".to_string(),
            message: err.to_string(),
        }
    }
}

impl NephroError {
    /// True for failures the ingestion circuit breaker counts as
    /// consecutive request failures.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            NephroError::Api { .. }
                | NephroError::ApiJson { .. }
                | NephroError::RateLimited { .. }
                | NephroError::Timeout { .. }
        )
    }
}
