use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::backup::BackupManager;
use super::health::{probe_database, CorruptionReport};
use super::live::LiveStore;
use super::repair::{prune_copies, run_soft_repair, RepairSummary};
use super::swap::quarantine_database;
use super::write_atomic;
use crate::config::with_suffix;
use crate::error::codes;
use crate::logging::LOG_TARGET;
use crate::{AppError, AppResult};

const STATUS_MARKER_SUFFIX: &str = ".status.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryState {
    Unknown,
    Probing,
    Healthy,
    Corrupted,
    Repairing,
    Unrepairable,
    ForceRebuilding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerStatus {
    Ok,
    Corrupted,
    Repairing,
}

/// Last recovery state persisted next to the live store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMarker {
    pub status: MarkerStatus,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildOutcome {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quarantined_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored_from: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_error: Option<AppError>,
}

/// Detects a damaged live store and brings it back to a usable state.
///
/// Runs before anything else touches the live store. Shares the
/// [`LiveStore`] slot with the other managers so a rebuild is visible to them.
pub struct RecoveryManager {
    live: LiveStore,
    backups: BackupManager,
    state: Mutex<RecoveryState>,
    last_report: Mutex<Option<CorruptionReport>>,
    last_repair: Mutex<Option<RepairSummary>>,
}

impl RecoveryManager {
    pub fn new(live: LiveStore, backups: BackupManager) -> Self {
        Self {
            live,
            backups,
            state: Mutex::new(RecoveryState::Unknown),
            last_report: Mutex::new(None),
            last_repair: Mutex::new(None),
        }
    }

    pub fn state(&self) -> RecoveryState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn last_report(&self) -> Option<CorruptionReport> {
        self.last_report
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn last_repair(&self) -> Option<RepairSummary> {
        self.last_repair
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn marker_path(&self) -> PathBuf {
        with_suffix(self.live.path(), STATUS_MARKER_SUFFIX)
    }

    pub fn read_marker(&self) -> Option<StatusMarker> {
        let bytes = std::fs::read(self.marker_path()).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(marker) => Some(marker),
            Err(err) => {
                tracing::warn!(
                    target: LOG_TARGET,
                    event = "status_marker_unreadable",
                    error = %err
                );
                None
            }
        }
    }

    fn transition(&self, next: RecoveryState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != next {
            tracing::info!(
                target: LOG_TARGET,
                event = "recovery_state",
                from = ?*state,
                to = ?next
            );
            *state = next;
        }
    }

    fn write_marker(&self, status: MarkerStatus, detail: Option<String>) {
        let marker = StatusMarker {
            status,
            updated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            detail,
        };
        let path = self.marker_path();
        let written = serde_json::to_vec_pretty(&marker)
            .map_err(AppError::from)
            .and_then(|payload| write_atomic(&path, &payload));
        if let Err(err) = written {
            tracing::warn!(
                target: LOG_TARGET,
                event = "status_marker_write_failed",
                path = %path.display(),
                error = %err
            );
        }
    }

    /// Check the live store file. Problems are reported, never returned as errors.
    pub fn probe(&self) -> CorruptionReport {
        self.transition(RecoveryState::Probing);
        let mut report = probe_database(self.live.path(), self.live.passphrase());
        if matches!(
            self.read_marker().map(|marker| marker.status),
            Some(MarkerStatus::Repairing)
        ) {
            report.mark_interrupted();
        }

        tracing::info!(
            target: LOG_TARGET,
            event = "probe_complete",
            corrupted = report.corrupted,
            kind = ?report.kind,
            failed_checks = report.failed_checks().count()
        );
        if report.corrupted {
            self.transition(RecoveryState::Corrupted);
            self.write_marker(
                MarkerStatus::Corrupted,
                report.kind.map(|kind| format!("{kind:?}")),
            );
        } else {
            self.transition(RecoveryState::Healthy);
            if self.live.path().exists() {
                self.write_marker(MarkerStatus::Ok, None);
            }
        }
        *self.last_report.lock().unwrap_or_else(|e| e.into_inner()) = Some(report.clone());
        report
    }

    /// Non-destructive repair. Returns whether the store is healthy afterwards.
    pub fn repair(&self) -> bool {
        self.transition(RecoveryState::Repairing);
        if let Err(err) = self.live.close() {
            tracing::warn!(target: LOG_TARGET, event = "live_close_failed", error = %err);
        }

        if !self.live.path().exists() {
            self.write_marker(MarkerStatus::Ok, Some("store absent".to_string()));
            self.transition(RecoveryState::Healthy);
            return true;
        }

        self.write_marker(MarkerStatus::Repairing, None);
        let summary = run_soft_repair(self.live.path(), self.live.passphrase());
        let repaired = summary.success;
        *self.last_repair.lock().unwrap_or_else(|e| e.into_inner()) = Some(summary);

        let healthy = repaired && {
            let report = probe_database(self.live.path(), self.live.passphrase());
            let healthy = !report.corrupted;
            *self.last_report.lock().unwrap_or_else(|e| e.into_inner()) = Some(report);
            healthy
        };

        if healthy {
            self.write_marker(MarkerStatus::Ok, Some("soft repair".to_string()));
            self.transition(RecoveryState::Healthy);
        } else {
            self.write_marker(MarkerStatus::Corrupted, Some("soft repair failed".to_string()));
            self.transition(RecoveryState::Unrepairable);
            tracing::warn!(
                target: LOG_TARGET,
                event = "repair_exhausted",
                code = codes::UNREPAIRABLE
            );
        }
        healthy
    }

    /// Discard the live file, recreate an empty store and reseed it from the
    /// newest snapshot that restores cleanly.
    ///
    /// Only failures to move the old file or create the new one are returned.
    pub fn force_repair(&self) -> AppResult<RebuildOutcome> {
        self.transition(RecoveryState::ForceRebuilding);
        tracing::warn!(
            target: LOG_TARGET,
            event = "force_rebuild",
            path = %self.live.path().display()
        );
        if let Err(err) = self.live.close() {
            tracing::warn!(target: LOG_TARGET, event = "live_close_failed", error = %err);
        }

        let mut outcome = RebuildOutcome {
            quarantined_path: self.quarantine()?,
            ..RebuildOutcome::default()
        };
        self.live.get().map_err(|err| {
            self.transition(RecoveryState::Unrepairable);
            AppError::new(codes::UNREPAIRABLE, "Forced rebuild could not recreate the live store")
                .with_context("path", self.live.path().display().to_string())
                .with_cause(err)
        })?;

        let snapshots = match self.backups.list_snapshots() {
            Ok(snapshots) => snapshots,
            Err(err) => {
                tracing::warn!(target: LOG_TARGET, event = "force_rebuild_list_failed", error = %err);
                outcome.restore_error = Some(err);
                Vec::new()
            }
        };
        for snapshot in snapshots {
            match self.backups.restore(&snapshot.path) {
                Ok(_) => {
                    outcome.restored_from = Some(snapshot.path);
                    outcome.restore_error = None;
                    break;
                }
                Err(err) => {
                    tracing::warn!(
                        target: LOG_TARGET,
                        event = "force_rebuild_restore_failed",
                        path = %snapshot.path.display(),
                        error = %err
                    );
                    outcome.restore_error = Some(err);
                }
            }
        }

        self.write_marker(
            MarkerStatus::Ok,
            Some(match &outcome.restored_from {
                Some(path) => format!("rebuilt from {}", file_label(path)),
                None => "rebuilt empty".to_string(),
            }),
        );
        self.transition(RecoveryState::Healthy);
        tracing::info!(
            target: LOG_TARGET,
            event = "force_rebuild_complete",
            restored = outcome.restored_from.is_some()
        );
        Ok(outcome)
    }

    fn quarantine(&self) -> AppResult<Option<PathBuf>> {
        let moved = quarantine_database(self.live.path(), Utc::now()).map_err(|err| {
            self.transition(RecoveryState::Unrepairable);
            AppError::new(codes::UNREPAIRABLE, "Unreadable store could not be moved aside")
                .with_cause(err)
        })?;
        prune_copies(self.live.path(), "corrupt");
        Ok(moved)
    }

    /// Probe, then repair, then rebuild as needed. Returns the final state.
    pub fn ensure_healthy(&self) -> AppResult<RecoveryState> {
        let report = self.probe();
        if !report.corrupted {
            return Ok(self.state());
        }
        if self.repair() {
            return Ok(self.state());
        }
        self.force_repair()?;
        Ok(self.state())
    }
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
