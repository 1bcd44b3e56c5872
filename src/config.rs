use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::entities::SourceName;
use crate::entities::score::EvidenceTier;
use crate::error::NephroError;

const CONFIG_ENV: &str = "NEPHRODB_CONFIG";
const DB_PATH_ENV: &str = "NEPHRODB_DB";

/// Weight sums are accepted within this tolerance of 1.0.
const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Top-level configuration document.
///
/// Scoring weights and tier thresholds live here and only here; the
/// scoring engine and any UI read the same document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub sources: BTreeMap<String, SourceConfig>,
    pub evidence_tiers: TierConfig,
    pub api_defaults: ApiDefaults,
    pub cache: BTreeMap<String, NamespaceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file; `None` resolves to the XDG data directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Queries slower than this are logged at warning level.
    pub slow_query_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            path: None,
            slow_query_ms: 100,
        }
    }
}

impl StoreConfig {
    pub fn resolve_path(&self) -> PathBuf {
        if let Ok(path) = std::env::var(DB_PATH_ENV) {
            return PathBuf::from(path);
        }
        if let Some(path) = &self.path {
            return path.clone();
        }
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("nephrodb")
            .join("nephrodb.sqlite3")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub enabled: bool,
    /// Contribution to the composite score. Weights over enabled scoring
    /// sources must sum to 1.0.
    pub weight: f64,
    pub rate_limit: RateLimitConfig,
    pub smart_update: SmartUpdateConfig,
    pub timeouts: TimeoutConfig,
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig {
            enabled: true,
            weight: 0.0,
            rate_limit: RateLimitConfig::default(),
            smart_update: SmartUpdateConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_second: f64,
    /// Evidence rows written per chunk.
    pub chunk_size: usize,
    /// Records per committed transaction during streaming writes.
    pub transaction_size: usize,
    /// Concurrent page fetches per source. The host pacer still spaces
    /// the individual requests.
    pub concurrency: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            requests_per_second: 3.0,
            chunk_size: 300,
            transaction_size: 1000,
            concurrency: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmartUpdateConfig {
    pub max_pages: u64,
    /// Pages with a duplicate rate above this count toward the stop
    /// condition.
    pub duplicate_threshold: f64,
    /// Consecutive high-duplicate pages that end the run.
    pub consecutive_pages: u32,
}

impl Default for SmartUpdateConfig {
    fn default() -> Self {
        SmartUpdateConfig {
            max_pages: 500,
            duplicate_threshold: 0.9,
            consecutive_pages: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub connect_secs: u64,
    pub read_secs: u64,
    pub write_secs: u64,
    pub pool_secs: u64,
    /// Hard cancellation wrapping the whole retry strategy.
    pub failsafe_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            connect_secs: 30,
            read_secs: 60,
            write_secs: 30,
            pool_secs: 30,
            failsafe_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    /// Walked top-down; first matching rule assigns the tier. Genes with a
    /// zero score are `insufficient`, genes matching no rule but scoring
    /// above zero are `minimal_evidence`.
    pub rules: Vec<TierRule>,
    /// Label → score threshold map consumed by filter UIs.
    pub filter_thresholds: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierRule {
    pub label: EvidenceTier,
    pub min_sources: u32,
    pub min_score: f64,
    /// `true`: both conditions must hold. `false`: either suffices.
    pub require_both: bool,
    pub color: String,
}

impl Default for TierConfig {
    fn default() -> Self {
        let rules = vec![
            TierRule {
                label: EvidenceTier::ComprehensiveSupport,
                min_sources: 5,
                min_score: 70.0,
                require_both: true,
                color: "#1a7f37".to_string(),
            },
            TierRule {
                label: EvidenceTier::MultiSourceSupport,
                min_sources: 3,
                min_score: 50.0,
                require_both: true,
                color: "#2da44e".to_string(),
            },
            TierRule {
                label: EvidenceTier::EstablishedSupport,
                min_sources: 2,
                min_score: 30.0,
                require_both: true,
                color: "#bf8700".to_string(),
            },
            TierRule {
                label: EvidenceTier::PreliminaryEvidence,
                min_sources: 2,
                min_score: 20.0,
                require_both: false,
                color: "#d4a72c".to_string(),
            },
        ];
        let filter_thresholds = rules
            .iter()
            .map(|r| (r.label.as_str().to_string(), r.min_score))
            .collect();
        TierConfig {
            rules,
            filter_thresholds,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiDefaults {
    pub hide_zero_scores: bool,
    pub page_size: u32,
    pub max_page_size: u32,
    /// Hard cap on explicit id-list filters.
    pub max_id_filter: usize,
}

impl Default for ApiDefaults {
    fn default() -> Self {
        ApiDefaults {
            hide_zero_scores: true,
            page_size: 10,
            max_page_size: 100,
            max_id_filter: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    pub ttl_seconds: u64,
    pub l1_max_entries: usize,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        NamespaceConfig {
            ttl_seconds: 3600,
            l1_max_entries: 1000,
        }
    }
}

/// Cache namespaces registered at startup. An admin query against any of
/// these succeeds even when the namespace holds zero entries.
pub const CACHE_NAMESPACES: &[&str] = &[
    "annotations",
    "hgnc",
    "http",
    "files",
    "pubtator",
    "gencc",
    "panelapp",
    "hpo",
    "clingen",
    "network_analysis",
];

impl Default for AppConfig {
    fn default() -> Self {
        let mut sources = BTreeMap::new();
        let weights = [
            (SourceName::PanelApp, 0.20),
            (SourceName::ClinGen, 0.20),
            (SourceName::GenCc, 0.15),
            (SourceName::ClinVar, 0.15),
            (SourceName::Hpo, 0.10),
            (SourceName::PubTator, 0.10),
            (SourceName::DiagnosticPanels, 0.10),
            // STRING feeds the network engine, not the composite score.
            (SourceName::StringPpi, 0.0),
        ];
        for (source, weight) in weights {
            sources.insert(
                source.as_str().to_string(),
                SourceConfig {
                    weight,
                    ..SourceConfig::default()
                },
            );
        }

        let mut cache = BTreeMap::new();
        for namespace in CACHE_NAMESPACES {
            let ttl_seconds = match *namespace {
                "network_analysis" => 3600,
                "hgnc" | "files" => 86_400,
                // Filter metadata must go stale within five minutes.
                "annotations" => 300,
                _ => 3600,
            };
            cache.insert(
                (*namespace).to_string(),
                NamespaceConfig {
                    ttl_seconds,
                    l1_max_entries: 1000,
                },
            );
        }

        AppConfig {
            store: StoreConfig::default(),
            sources,
            evidence_tiers: TierConfig::default(),
            api_defaults: ApiDefaults::default(),
            cache,
        }
    }
}

impl AppConfig {
    /// Loads `NEPHRODB_CONFIG` if set, otherwise compiled defaults.
    pub fn load() -> Result<Self, NephroError> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_path(Path::new(&path)),
            _ => Ok(AppConfig::default()),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, NephroError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    /// Parses a TOML document and deep-merges it over the compiled
    /// defaults, so a file only needs to name the keys it changes.
    pub fn from_toml(raw: &str) -> Result<Self, NephroError> {
        let overlay: toml::Value = toml::from_str(raw)
            .map_err(|err| NephroError::Config(format!("invalid config: {err}")))?;
        let base = toml::Value::try_from(AppConfig::default())
            .map_err(|err| NephroError::Config(format!("default config: {err}")))?;
        let config: AppConfig = merge_toml(base, overlay)
            .try_into()
            .map_err(|err| NephroError::Config(format!("invalid config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), NephroError> {
        let weight_sum: f64 = self
            .sources
            .iter()
            .filter(|(_, cfg)| cfg.enabled)
            .map(|(_, cfg)| cfg.weight)
            .sum();
        if (weight_sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(NephroError::Config(format!(
                "source weights must sum to 1.0 over enabled sources, got {weight_sum:.6}"
            )));
        }
        for (name, cfg) in &self.sources {
            if cfg.rate_limit.requests_per_second <= 0.0 {
                return Err(NephroError::Config(format!(
                    "sources.{name}.rate_limit.requests_per_second must be positive"
                )));
            }
            if !(0.0..=1.0).contains(&cfg.smart_update.duplicate_threshold) {
                return Err(NephroError::Config(format!(
                    "sources.{name}.smart_update.duplicate_threshold must lie in [0, 1]"
                )));
            }
        }
        Ok(())
    }

    pub fn source(&self, source: SourceName) -> SourceConfig {
        self.sources
            .get(source.as_str())
            .cloned()
            .unwrap_or_default()
    }

    pub fn namespace(&self, namespace: &str) -> NamespaceConfig {
        self.cache.get(namespace).cloned().unwrap_or_default()
    }
}

fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => merge_toml(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            toml::Value::Table(base)
        }
        (_, overlay) => overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn default_weights_sum_to_one() {
        let config = AppConfig::default();
        let sum: f64 = config.sources.values().map(|s| s.weight).sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn toml_overrides_merge_over_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [api_defaults]
            page_size = 25

            [sources.pubtator.smart_update]
            max_pages = 200
            "#,
        )
        .unwrap();
        assert_eq!(config.api_defaults.page_size, 25);
        assert_eq!(
            config.source(SourceName::PubTator).smart_update.max_pages,
            200
        );
        // Untouched sections keep their defaults.
        assert!(config.api_defaults.hide_zero_scores);
    }

    #[test]
    fn skewed_weights_are_rejected() {
        let err = AppConfig::from_toml(
            r#"
            [sources.panelapp]
            weight = 0.9
            "#,
        )
        .unwrap_err();
        assert!(format!("{err}").contains("sum to 1.0"));
    }

    #[test]
    fn every_known_namespace_has_a_ttl() {
        let config = AppConfig::default();
        for namespace in CACHE_NAMESPACES {
            assert!(config.cache.contains_key(*namespace), "{namespace}");
        }
    }

    #[test]
    fn tier_rules_walk_strongest_first() {
        let config = TierConfig::default();
        assert_eq!(config.rules[0].label, EvidenceTier::ComprehensiveSupport);
        assert!(config.rules[0].min_score > config.rules.last().unwrap().min_score);
    }
}
