use serde::{Deserialize, Serialize};

use crate::entities::SourceName;
use crate::error::NephroError;

/// Per-source run status.
///
/// ```text
/// idle ──trigger──▶ running ──complete──▶ succeeded ──▶ idle
///                    │    │
///                    │    └─error──▶ failed ──trigger──▶ running
///                    │
///                    └─pause──▶ paused ──resume──▶ running
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Idle,
    Running,
    Paused,
    Failed,
    Succeeded,
}

impl SourceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceStatus::Idle => "idle",
            SourceStatus::Running => "running",
            SourceStatus::Paused => "paused",
            SourceStatus::Failed => "failed",
            SourceStatus::Succeeded => "succeeded",
        }
    }

    pub fn from_str(value: &str) -> Result<Self, NephroError> {
        match value {
            "idle" => Ok(SourceStatus::Idle),
            "running" => Ok(SourceStatus::Running),
            "paused" => Ok(SourceStatus::Paused),
            "failed" => Ok(SourceStatus::Failed),
            "succeeded" => Ok(SourceStatus::Succeeded),
            other => Err(NephroError::InvalidArgument(format!(
                "Unknown source status: {other}"
            ))),
        }
    }

    /// Whether the state machine admits `self -> next`. Terminal in-run
    /// states (`succeeded`, `failed`) return to `running` only through a
    /// fresh trigger.
    pub fn can_transition_to(self, next: SourceStatus) -> bool {
        use SourceStatus::*;
        matches!(
            (self, next),
            (Idle, Running)
                | (Running, Paused)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Paused, Running)
                | (Paused, Failed)
                | (Failed, Running)
                | (Succeeded, Running)
                | (Succeeded, Idle)
                | (Failed, Idle)
        )
    }

    pub fn is_active(self) -> bool {
        matches!(self, SourceStatus::Running | SourceStatus::Paused)
    }
}

/// Ingestion mode for a triggered run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// Purge and repopulate the source from scratch.
    Full,
    /// Incremental: stop once the duplicate rate shows the remainder is
    /// already persisted.
    Smart,
    /// Re-run only if the previous run failed.
    UpdateFailed,
    /// Fetch only records newer than the last successful run.
    UpdateNew,
    /// Fetch only genes with no evidence row for this source.
    UpdateMissing,
}

impl UpdateMode {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateMode::Full => "full",
            UpdateMode::Smart => "smart",
            UpdateMode::UpdateFailed => "update_failed",
            UpdateMode::UpdateNew => "update_new",
            UpdateMode::UpdateMissing => "update_missing",
        }
    }

    pub fn from_flag(value: &str) -> Result<Self, NephroError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(UpdateMode::Full),
            "smart" => Ok(UpdateMode::Smart),
            "update_failed" | "update-failed" => Ok(UpdateMode::UpdateFailed),
            "update_new" | "update-new" => Ok(UpdateMode::UpdateNew),
            "update_missing" | "update-missing" => Ok(UpdateMode::UpdateMissing),
            other => Err(NephroError::InvalidArgument(format!(
                "Unknown update mode: {other}\n\nValid modes:\n- full\n- smart\n- update_failed\n- update_new\n- update_missing"
            ))),
        }
    }
}

/// Structured failure detail preserved on a progress row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Machine-readable reason: `consecutive_failures`, `resource_limit`,
    /// `cancelled`, `transport`, ...
    pub reason: String,
    pub message: String,
    #[serde(default)]
    pub failed_record_count: u64,
}

/// Per-source run state. One row per registered source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceProgress {
    pub source_name: SourceName,
    pub status: SourceStatus,
    pub current_page: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_pages: Option<u64>,
    pub items_processed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_info: Option<ErrorInfo>,
}

impl SourceProgress {
    pub fn idle(source_name: SourceName) -> Self {
        SourceProgress {
            source_name,
            status: SourceStatus::Idle,
            current_page: 0,
            total_pages: None,
            items_processed: 0,
            started_at: None,
            last_heartbeat_at: None,
            error_info: None,
        }
    }
}

/// Event published to the progress broadcast channel. Fire-and-forget:
/// a full or closed channel never aborts the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub source_name: SourceName,
    pub status: SourceStatus,
    pub current_page: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_pages: Option<u64>,
    pub items_processed: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub operation_description: String,
}
