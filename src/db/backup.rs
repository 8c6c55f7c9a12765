use std::cmp::Ordering;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use fs2::available_space;
use serde::{Deserialize, Serialize};

use super::live::LiveStore;
use super::snapshot::{sha256_hex, SnapshotCounts, SnapshotDocument};
use super::write_atomic;
use crate::error::codes;
use crate::logging::LOG_TARGET;
use crate::{repo, time, AppError, AppResult};

pub const SCHEDULED_PREFIX: &str = "backup_";
pub const MANUAL_PREFIX: &str = "manual_backup_";
const SNAPSHOT_EXTENSION: &str = "json";
const NAME_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const REQUIRED_FREE_MULTIPLIER: f64 = 1.2;
const FAKE_FREE_BYTES_ENV: &str = "LEDGERKEEP_FAKE_FREE_BYTES";

/// A snapshot file on disk. `modified_at` is its creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSnapshot {
    pub path: PathBuf,
    pub file_name: String,
    pub size_bytes: u64,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionFailure {
    pub path: PathBuf,
    pub error: AppError,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionReport {
    pub kept: usize,
    pub removed: Vec<PathBuf>,
    pub failed: Vec<RetentionFailure>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSummary {
    pub source: PathBuf,
    pub format_version: u32,
    pub counts: SnapshotCounts,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotValidation {
    pub path: PathBuf,
    pub format_version: u32,
    pub export_time: i64,
    pub counts: SnapshotCounts,
    pub dangling_references: Vec<String>,
    pub sha256: String,
}

impl SnapshotValidation {
    pub fn is_consistent(&self) -> bool {
        self.dangling_references.is_empty()
    }
}

/// Writes, lists, prunes and restores JSON snapshots of the live store.
#[derive(Clone)]
pub struct BackupManager {
    live: LiveStore,
    dir: PathBuf,
    retention: usize,
}

impl BackupManager {
    pub fn new(live: LiveStore, dir: impl Into<PathBuf>, retention: usize) -> Self {
        Self {
            live,
            dir: dir.into(),
            retention,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    fn ensure_dir(&self) -> AppResult<()> {
        fs::create_dir_all(&self.dir).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "create_backups_dir")
                .with_context("path", self.dir.display().to_string())
        })
    }

    /// Export every live record to `<backups>/<target_name>` atomically.
    pub fn create_snapshot(&self, target_name: &str) -> AppResult<BackupSnapshot> {
        let file_name = sanitize_target_name(target_name)?;
        self.ensure_dir()?;

        let store = self.live.get()?;
        let doc = store
            .with_conn(|conn| SnapshotDocument::capture(conn, time::now_ms()))
            .map_err(|err| err.with_context("operation", "capture_snapshot"))?;
        let payload = doc.to_bytes()?;

        let required = required_free_bytes(payload.len() as u64);
        let available = free_disk_space(&self.dir)?;
        if available < required {
            return Err(AppError::new(
                codes::LOW_DISK,
                format!("Not enough disk space (need ~{required} bytes)."),
            )
            .with_context("available_bytes", available.to_string())
            .with_context("required_bytes", required.to_string()));
        }

        let path = self.dir.join(&file_name);
        write_atomic(&path, &payload).map_err(|err| {
            err.with_context("operation", "write_snapshot")
                .with_context("path", path.display().to_string())
        })?;
        let snapshot = load_snapshot(&path)?;

        tracing::info!(
            target: LOG_TARGET,
            event = "snapshot_created",
            path = %snapshot.path.display(),
            size_bytes = snapshot.size_bytes,
            transactions = doc.transactions.len()
        );
        Ok(snapshot)
    }

    /// Timestamp-named snapshot followed by retention cleanup.
    ///
    /// Cleanup problems are logged and never fail the snapshot itself.
    pub fn create_scheduled_snapshot(&self) -> AppResult<BackupSnapshot> {
        self.ensure_dir()?;
        let name = unique_snapshot_name(&self.dir, SCHEDULED_PREFIX, Utc::now())?;
        let snapshot = self.create_snapshot(&name)?;

        match self.enforce_retention(self.retention) {
            Ok(report) if !report.failed.is_empty() => {
                tracing::warn!(
                    target: LOG_TARGET,
                    event = "retention_incomplete",
                    code = codes::RETENTION_CLEANUP_FAILED,
                    failed = report.failed.len(),
                    removed = report.removed.len()
                );
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(
                    target: LOG_TARGET,
                    event = "retention_failed",
                    code = codes::RETENTION_CLEANUP_FAILED,
                    error = %err
                );
            }
        }
        Ok(snapshot)
    }

    /// Operator snapshot named `manual_backup_<timestamp>.json`.
    pub fn create_manual_snapshot(&self) -> AppResult<BackupSnapshot> {
        self.ensure_dir()?;
        let name = unique_snapshot_name(&self.dir, MANUAL_PREFIX, Utc::now())?;
        self.create_snapshot(&name)
    }

    /// Snapshots, newest first. Equal modification times fall back to the
    /// file name, also descending.
    pub fn list_snapshots(&self) -> AppResult<Vec<BackupSnapshot>> {
        let mut snapshots = collect_snapshots(&self.dir)?;
        snapshots.sort_by(compare_newest_first);
        Ok(snapshots)
    }

    /// Delete every snapshot past the first `keep` in list order.
    pub fn enforce_retention(&self, keep: usize) -> AppResult<RetentionReport> {
        let snapshots = self.list_snapshots()?;
        let mut report = RetentionReport {
            kept: snapshots.len().min(keep),
            ..RetentionReport::default()
        };

        for snapshot in snapshots.into_iter().skip(keep) {
            match fs::remove_file(&snapshot.path) {
                Ok(()) => report.removed.push(snapshot.path),
                Err(err) => {
                    tracing::warn!(
                        target: LOG_TARGET,
                        error = %err,
                        path = %snapshot.path.display(),
                        "failed_to_remove_old_snapshot"
                    );
                    let error = AppError::new(
                        codes::RETENTION_CLEANUP_FAILED,
                        "Failed to remove old snapshot",
                    )
                    .with_context("path", snapshot.path.display().to_string())
                    .with_cause(err);
                    report.failed.push(RetentionFailure {
                        path: snapshot.path,
                        error,
                    });
                }
            }
        }

        if !report.removed.is_empty() {
            tracing::info!(
                target: LOG_TARGET,
                event = "retention_applied",
                kept = report.kept,
                removed = report.removed.len()
            );
        }
        Ok(report)
    }

    /// Replace the live tables with the snapshot contents, all or nothing.
    pub fn restore(&self, snapshot: &Path) -> AppResult<RestoreSummary> {
        let doc = SnapshotDocument::read(snapshot).map_err(|err| {
            AppError::from(err).with_context("path", snapshot.display().to_string())
        })?;

        let store = self.live.get()?;
        store
            .run_in_tx(|tx| {
                repo::clear_all(tx)?;
                doc.insert_into(tx)
            })
            .map_err(|err| {
                AppError::new("BACKUP/RESTORE_FAILED", "Snapshot could not be restored")
                    .with_context("path", snapshot.display().to_string())
                    .with_cause(err)
            })?;

        let summary = RestoreSummary {
            source: snapshot.to_path_buf(),
            format_version: doc.format_version,
            counts: doc.counts(),
        };
        tracing::info!(
            target: LOG_TARGET,
            event = "snapshot_restored",
            path = %snapshot.display(),
            transactions = summary.counts.transactions
        );
        Ok(summary)
    }

    /// Restore the newest snapshot. `None` when there is nothing to restore.
    pub fn restore_latest(&self) -> AppResult<Option<RestoreSummary>> {
        match self.list_snapshots()?.into_iter().next() {
            Some(latest) => self.restore(&latest.path).map(Some),
            None => Ok(None),
        }
    }

    /// Remove one snapshot. Paths outside the backup directory are refused.
    pub fn delete_snapshot(&self, file: &Path) -> bool {
        let (Ok(root), Ok(target)) = (fs::canonicalize(&self.dir), fs::canonicalize(file)) else {
            return false;
        };
        if !target.starts_with(&root) || !is_snapshot_file(&target) {
            tracing::warn!(
                target: LOG_TARGET,
                event = "snapshot_delete_refused",
                code = codes::INVALID_SNAPSHOT_PATH,
                path = %file.display()
            );
            return false;
        }
        match fs::remove_file(&target) {
            Ok(()) => {
                tracing::info!(target: LOG_TARGET, event = "snapshot_deleted", path = %target.display());
                true
            }
            Err(err) => {
                tracing::warn!(
                    target: LOG_TARGET,
                    event = "snapshot_delete_failed",
                    path = %target.display(),
                    error = %err
                );
                false
            }
        }
    }

    /// Parse a snapshot and report what a restore would load, without writing.
    pub fn validate_snapshot(&self, file: &Path) -> AppResult<SnapshotValidation> {
        let bytes = fs::read(file).map_err(|err| {
            AppError::new(codes::SERIALIZATION_FAILED, "Snapshot could not be read")
                .with_context("path", file.display().to_string())
                .with_cause(err)
        })?;
        let doc = SnapshotDocument::parse(&bytes)
            .map_err(|err| AppError::from(err).with_context("path", file.display().to_string()))?;

        Ok(SnapshotValidation {
            path: file.to_path_buf(),
            format_version: doc.format_version,
            export_time: doc.metadata.export_time,
            counts: doc.counts(),
            dangling_references: doc.dangling_references(),
            sha256: sha256_hex(&bytes),
        })
    }
}

fn sanitize_target_name(target_name: &str) -> AppResult<String> {
    let base = Path::new(target_name.trim())
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    if base.is_empty() || base.starts_with('.') {
        return Err(
            AppError::new(codes::INVALID_SNAPSHOT_PATH, "Snapshot name is not usable")
                .with_context("name", target_name.to_string()),
        );
    }
    if Path::new(&base)
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case(SNAPSHOT_EXTENSION))
        .unwrap_or(false)
    {
        Ok(base)
    } else {
        Ok(format!("{base}.{SNAPSHOT_EXTENSION}"))
    }
}

/// `<prefix><yyyyMMdd_HHmmss>.json`, with `_NN` appended on collision.
fn unique_snapshot_name(dir: &Path, prefix: &str, at: DateTime<Utc>) -> AppResult<String> {
    let base = format!("{prefix}{}", at.format(NAME_TIMESTAMP_FORMAT));
    for suffix in 0..100 {
        let candidate = if suffix == 0 {
            format!("{base}.{SNAPSHOT_EXTENSION}")
        } else {
            format!("{base}_{suffix:02}.{SNAPSHOT_EXTENSION}")
        };
        if !dir.join(&candidate).exists() {
            return Ok(candidate);
        }
    }
    Err(AppError::new(
        "BACKUP/NAME_COLLISION",
        "Unable to allocate snapshot file name",
    ))
}

fn is_snapshot_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case(SNAPSHOT_EXTENSION))
        .unwrap_or(false)
}

fn compare_newest_first(a: &BackupSnapshot, b: &BackupSnapshot) -> Ordering {
    b.modified_at
        .cmp(&a.modified_at)
        .then_with(|| b.file_name.cmp(&a.file_name))
}

fn collect_snapshots(dir: &Path) -> AppResult<Vec<BackupSnapshot>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(AppError::from(err)
                .with_context("operation", "read_backups_dir")
                .with_context("path", dir.display().to_string()))
        }
    };

    let mut out = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(target: LOG_TARGET, error = %err, "skip_invalid_snapshot_entry");
                continue;
            }
        };
        let path = entry.path();
        if !path.is_file() || !is_snapshot_file(&path) {
            continue;
        }
        match load_snapshot(&path) {
            Ok(snapshot) => out.push(snapshot),
            Err(err) => {
                tracing::warn!(
                    target: LOG_TARGET,
                    error = %err,
                    path = %path.display(),
                    "skip_snapshot_unreadable"
                );
            }
        }
    }
    Ok(out)
}

fn load_snapshot(path: &Path) -> AppResult<BackupSnapshot> {
    let meta = fs::metadata(path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "snapshot_metadata")
            .with_context("path", path.display().to_string())
    })?;
    let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    Ok(BackupSnapshot {
        path: path.to_path_buf(),
        file_name: path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
        size_bytes: meta.len(),
        modified_at: DateTime::<Utc>::from(modified),
    })
}

fn required_free_bytes(payload_len: u64) -> u64 {
    ((payload_len as f64) * REQUIRED_FREE_MULTIPLIER).ceil() as u64
}

fn free_disk_space(path: &Path) -> AppResult<u64> {
    if let Ok(fake) = env::var(FAKE_FREE_BYTES_ENV) {
        if let Ok(value) = fake.parse::<u64>() {
            return Ok(value);
        }
    }
    available_space(path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "available_space")
            .with_context("path", path.display().to_string())
    })
}
