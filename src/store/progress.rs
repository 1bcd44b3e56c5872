use rusqlite::{OptionalExtension, params};

use crate::entities::SourceName;
use crate::entities::progress::{ErrorInfo, SourceProgress, SourceStatus};
use crate::error::NephroError;
use crate::store::{Store, epoch_to_datetime, now_epoch};

fn row_to_progress(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, SourceProgressRaw)> {
    Ok((
        row.get(0)?,
        SourceProgressRaw {
            status: row.get(1)?,
            current_page: row.get(2)?,
            total_pages: row.get(3)?,
            items_processed: row.get(4)?,
            started_at: row.get(5)?,
            last_heartbeat_at: row.get(6)?,
            error_info: row.get(7)?,
        },
    ))
}

struct SourceProgressRaw {
    status: String,
    current_page: u64,
    total_pages: Option<u64>,
    items_processed: u64,
    started_at: Option<i64>,
    last_heartbeat_at: Option<i64>,
    error_info: Option<String>,
}

fn assemble(source: SourceName, raw: SourceProgressRaw) -> Result<SourceProgress, NephroError> {
    Ok(SourceProgress {
        source_name: source,
        status: SourceStatus::from_str(&raw.status)?,
        current_page: raw.current_page,
        total_pages: raw.total_pages,
        items_processed: raw.items_processed,
        started_at: raw.started_at.map(epoch_to_datetime),
        last_heartbeat_at: raw.last_heartbeat_at.map(epoch_to_datetime),
        error_info: raw
            .error_info
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok()),
    })
}

const PROGRESS_COLUMNS: &str = "source_name, status, current_page, total_pages, \
     items_processed, started_at, last_heartbeat_at, error_info";

impl Store {
    /// Ensures a progress row exists for every registered source.
    pub fn ensure_progress_rows(&self, sources: &[SourceName]) -> Result<(), NephroError> {
        self.with("ensure_progress_rows", |conn| {
            for source in sources {
                conn.execute(
                    "INSERT OR IGNORE INTO data_source_progress (source_name, status)
                     VALUES (?1, 'idle')",
                    [source.as_str()],
                )?;
            }
            Ok(())
        })
    }

    pub fn progress(&self, source: SourceName) -> Result<Option<SourceProgress>, NephroError> {
        let raw = self.with("progress", |conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {PROGRESS_COLUMNS} FROM data_source_progress WHERE source_name = ?1"
                    ),
                    [source.as_str()],
                    row_to_progress,
                )
                .optional()?)
        })?;
        raw.map(|(_, raw)| assemble(source, raw)).transpose()
    }

    pub fn all_progress(&self) -> Result<Vec<SourceProgress>, NephroError> {
        let raws = self.with("all_progress", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PROGRESS_COLUMNS} FROM data_source_progress ORDER BY source_name"
            ))?;
            let rows = stmt.query_map([], row_to_progress)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })?;
        let mut progress = Vec::new();
        for (name, raw) in raws {
            // Orphan rows (unregistered source names) are surfaced by
            // `orphaned_progress_rows`, not silently parsed here.
            if let Ok(source) = SourceName::from_flag(&name) {
                progress.push(assemble(source, raw)?);
            }
        }
        Ok(progress)
    }

    /// Applies a status transition, enforcing the per-source state
    /// machine. Fails with a constraint error on an illegal edge.
    pub fn transition_status(
        &self,
        source: SourceName,
        next: SourceStatus,
    ) -> Result<(), NephroError> {
        self.with_tx("transition_status", |tx| {
            let current: String = tx
                .query_row(
                    "SELECT status FROM data_source_progress WHERE source_name = ?1",
                    [source.as_str()],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| NephroError::NotFound {
                    entity: "source".into(),
                    id: source.as_str().into(),
                    suggestion: "Register the source before triggering it".into(),
                })?;
            let current = SourceStatus::from_str(&current)?;
            if !current.can_transition_to(next) {
                return Err(NephroError::Constraint(format!(
                    "illegal status transition for {source}: {} -> {}",
                    current.as_str(),
                    next.as_str()
                )));
            }
            let now = now_epoch();
            match next {
                SourceStatus::Running if !matches!(current, SourceStatus::Paused) => {
                    // Fresh trigger: reset run-scoped counters unless
                    // resuming a failed run from its checkpoint.
                    tx.execute(
                        "UPDATE data_source_progress
                         SET status = ?2, started_at = ?3, last_heartbeat_at = ?3,
                             error_info = NULL
                         WHERE source_name = ?1",
                        params![source.as_str(), next.as_str(), now],
                    )?;
                }
                _ => {
                    tx.execute(
                        "UPDATE data_source_progress
                         SET status = ?2, last_heartbeat_at = ?3
                         WHERE source_name = ?1",
                        params![source.as_str(), next.as_str(), now],
                    )?;
                }
            }
            Ok(())
        })
    }

    /// Page-boundary checkpoint: progress counters plus heartbeat.
    pub fn checkpoint_progress(
        &self,
        source: SourceName,
        current_page: u64,
        total_pages: Option<u64>,
        items_processed: u64,
    ) -> Result<(), NephroError> {
        self.with("checkpoint_progress", |conn| {
            conn.execute(
                "UPDATE data_source_progress
                 SET current_page = ?2, total_pages = ?3, items_processed = ?4,
                     last_heartbeat_at = ?5
                 WHERE source_name = ?1",
                params![
                    source.as_str(),
                    current_page,
                    total_pages,
                    items_processed,
                    now_epoch()
                ],
            )?;
            Ok(())
        })
    }

    /// Marks a run failed with its structured reason. Progress counters
    /// are kept so a re-trigger resumes from the checkpoint.
    pub fn fail_progress(&self, source: SourceName, info: &ErrorInfo) -> Result<(), NephroError> {
        let encoded = serde_json::to_string(info)
            .map_err(|err| NephroError::Constraint(format!("error_info encoding: {err}")))?;
        self.with("fail_progress", |conn| {
            conn.execute(
                "UPDATE data_source_progress
                 SET status = 'failed', error_info = ?2, last_heartbeat_at = ?3
                 WHERE source_name = ?1",
                params![source.as_str(), encoded, now_epoch()],
            )?;
            Ok(())
        })
    }

    /// Startup reconciliation: any `running` row whose heartbeat is older
    /// than `stale_after_secs` belongs to a dead process and is moved to
    /// `failed`. Returns the reconciled sources.
    pub fn reconcile_stale_running(
        &self,
        stale_after_secs: i64,
    ) -> Result<Vec<String>, NephroError> {
        self.with_tx("reconcile_stale_running", |tx| {
            let cutoff = now_epoch() - stale_after_secs;
            let mut stmt = tx.prepare(
                "SELECT source_name FROM data_source_progress
                 WHERE status = 'running'
                   AND (last_heartbeat_at IS NULL OR last_heartbeat_at < ?1)",
            )?;
            let stale: Vec<String> = stmt
                .query_map([cutoff], |row| row.get(0))?
                .collect::<Result<_, _>>()?;
            drop(stmt);

            let info = serde_json::to_string(&ErrorInfo {
                reason: "stale_heartbeat".into(),
                message: "run found in running state with no live heartbeat at startup".into(),
                failed_record_count: 0,
            })
            .map_err(|err| NephroError::Constraint(format!("error_info encoding: {err}")))?;
            for source in &stale {
                tx.execute(
                    "UPDATE data_source_progress
                     SET status = 'failed', error_info = ?2
                     WHERE source_name = ?1",
                    params![source, info],
                )?;
            }
            Ok(stale)
        })
    }

    /// Progress rows whose source is no longer registered. Flagged for
    /// the operator, never auto-deleted.
    pub fn orphaned_progress_rows(
        &self,
        registered: &[SourceName],
    ) -> Result<Vec<String>, NephroError> {
        let known: Vec<&str> = registered.iter().map(|s| s.as_str()).collect();
        self.with("orphaned_progress_rows", |conn| {
            let mut stmt =
                conn.prepare("SELECT source_name FROM data_source_progress ORDER BY source_name")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut orphans = Vec::new();
            for row in rows {
                let name = row?;
                if !known.contains(&name.as_str()) {
                    orphans.push(name);
                }
            }
            Ok(orphans)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_store() -> Store {
        let store = Store::open_in_memory().unwrap();
        store
            .ensure_progress_rows(&[SourceName::PubTator, SourceName::PanelApp])
            .unwrap();
        store
    }

    #[test]
    fn trigger_pause_resume_walks_the_state_machine() {
        let store = seeded_store();
        store
            .transition_status(SourceName::PubTator, SourceStatus::Running)
            .unwrap();
        store
            .transition_status(SourceName::PubTator, SourceStatus::Paused)
            .unwrap();
        store
            .transition_status(SourceName::PubTator, SourceStatus::Running)
            .unwrap();
        store
            .transition_status(SourceName::PubTator, SourceStatus::Succeeded)
            .unwrap();
    }

    #[test]
    fn pausing_an_idle_source_is_rejected() {
        let store = seeded_store();
        let err = store
            .transition_status(SourceName::PanelApp, SourceStatus::Paused)
            .unwrap_err();
        assert!(format!("{err}").contains("illegal status transition"));
    }

    #[test]
    fn second_concurrent_trigger_is_rejected() {
        let store = seeded_store();
        store
            .transition_status(SourceName::PubTator, SourceStatus::Running)
            .unwrap();
        // A second trigger would be running -> running.
        assert!(
            store
                .transition_status(SourceName::PubTator, SourceStatus::Running)
                .is_err()
        );
    }

    #[test]
    fn stale_running_rows_are_reconciled_to_failed() {
        let store = seeded_store();
        store
            .transition_status(SourceName::PubTator, SourceStatus::Running)
            .unwrap();

        // A fresh heartbeat survives reconciliation.
        assert!(store.reconcile_stale_running(300).unwrap().is_empty());

        // An old heartbeat does not.
        let stale = store.reconcile_stale_running(-1).unwrap();
        assert_eq!(stale, vec!["pubtator".to_string()]);
        let progress = store.progress(SourceName::PubTator).unwrap().unwrap();
        assert_eq!(progress.status, SourceStatus::Failed);
        assert_eq!(
            progress.error_info.as_ref().unwrap().reason,
            "stale_heartbeat"
        );
    }

    #[test]
    fn checkpoint_survives_failure_for_resumption() {
        let store = seeded_store();
        store
            .transition_status(SourceName::PubTator, SourceStatus::Running)
            .unwrap();
        store
            .checkpoint_progress(SourceName::PubTator, 200, Some(500), 60_000)
            .unwrap();
        store
            .fail_progress(
                SourceName::PubTator,
                &ErrorInfo {
                    reason: "consecutive_failures".into(),
                    message: "3 requests failed in a row".into(),
                    failed_record_count: 12,
                },
            )
            .unwrap();

        let progress = store.progress(SourceName::PubTator).unwrap().unwrap();
        assert_eq!(progress.status, SourceStatus::Failed);
        assert_eq!(progress.current_page, 200);
        assert_eq!(progress.items_processed, 60_000);
    }

    #[test]
    fn unregistered_rows_surface_as_orphans() {
        let store = seeded_store();
        store
            .with("seed_orphan", |conn| {
                conn.execute(
                    "INSERT INTO data_source_progress (source_name, status) VALUES ('omim', 'idle')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();
        let orphans = store
            .orphaned_progress_rows(&[SourceName::PubTator, SourceName::PanelApp])
            .unwrap();
        assert_eq!(orphans, vec!["omim".to_string()]);
    }
}
