//! Resource and failure circuit breakers for long ingestion runs.

use procfs::Current;
use tracing::warn;

use crate::error::NephroError;

/// Resident-memory ceiling; runs stop gracefully above it.
pub const MEMORY_LIMIT_PERCENT: f64 = 85.0;

/// Pages between resource polls and checkpoint commits.
pub const CHECKPOINT_PAGE_INTERVAL: u64 = 50;

/// Consecutive request failures that abort a run.
pub const CONSECUTIVE_FAILURE_LIMIT: u32 = 3;

/// Resident set of this process as a share of system memory, via procfs.
/// `None` when the proc filesystem is unavailable (containers with
/// restricted /proc); the caller skips the check rather than guessing.
pub fn memory_usage_percent() -> Option<f64> {
    let me = procfs::process::Process::myself().ok()?;
    let statm = me.statm().ok()?;
    let page_size = procfs::page_size();
    let resident_bytes = statm.resident.saturating_mul(page_size);

    let meminfo = procfs::Meminfo::current().ok()?;
    let total_bytes = meminfo.mem_total;
    if total_bytes == 0 {
        return None;
    }
    Some(100.0 * resident_bytes as f64 / total_bytes as f64)
}

/// Polls memory; above the ceiling the run persists its progress and
/// stops with `resource_limit`.
pub fn check_memory() -> Result<(), NephroError> {
    let Some(percent) = memory_usage_percent() else {
        return Ok(());
    };
    if percent > MEMORY_LIMIT_PERCENT {
        warn!(percent = format!("{percent:.1}"), "memory ceiling reached; stopping run");
        return Err(NephroError::ResourceLimit(format!(
            "resident memory at {percent:.1}% exceeds the {MEMORY_LIMIT_PERCENT}% ceiling"
        )));
    }
    Ok(())
}

/// Counts consecutive request failures; a success resets the streak.
#[derive(Debug)]
pub struct FailureTracker {
    consecutive: u32,
    limit: u32,
}

impl FailureTracker {
    pub fn new(limit: u32) -> Self {
        FailureTracker {
            consecutive: 0,
            limit,
        }
    }

    /// Records a failure; `true` means the breaker tripped.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive >= self.limit
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_trips_on_the_configured_streak() {
        let mut tracker = FailureTracker::new(3);
        assert!(!tracker.record_failure());
        assert!(!tracker.record_failure());
        assert!(tracker.record_failure());
    }

    #[test]
    fn success_resets_the_streak() {
        let mut tracker = FailureTracker::new(3);
        tracker.record_failure();
        tracker.record_failure();
        tracker.record_success();
        assert!(!tracker.record_failure());
        assert_eq!(tracker.consecutive(), 1);
    }

    #[test]
    fn memory_poll_reports_a_sane_share_on_linux() {
        if let Some(percent) = memory_usage_percent() {
            assert!(percent > 0.0);
            assert!(percent < 100.0);
        }
    }
}
