use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Utc;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::Serialize;

use super::health::foreign_key_offenders;
use super::store::open_keyed;
use super::swap::{existing_sidecars, prune_side_copies, swap_database, SIDE_COPY_KEEP};
use crate::config::{with_suffix, Passphrase};
use crate::logging::LOG_TARGET;
use crate::{AppError, AppResult};

/// Suffix of the copy the swap leaves behind.
pub const PRE_REPAIR_SUFFIX: &str = ".pre-repair";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStep {
    Backup,
    Checkpoint,
    Reindex,
    Orphans,
    Rebuild,
    Validate,
    Swap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStepState {
    Pending,
    Success,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairStepReport {
    pub step: RepairStep,
    pub status: RepairStepState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OrphanCleanup {
    pub categories_cleared: usize,
    pub transfers_cleared: usize,
    pub accounts_reassigned: usize,
    pub transactions_deleted: usize,
}

impl OrphanCleanup {
    pub fn total(&self) -> usize {
        self.categories_cleared
            + self.transfers_cleared
            + self.accounts_reassigned
            + self.transactions_deleted
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairSummary {
    pub success: bool,
    pub steps: Vec<RepairStepReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AppError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_repair_copy: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_db_path: Option<PathBuf>,
    pub orphans_fixed: OrphanCleanup,
    pub duration_ms: u64,
}

const REPAIR_STEPS: [RepairStep; 7] = [
    RepairStep::Backup,
    RepairStep::Checkpoint,
    RepairStep::Reindex,
    RepairStep::Orphans,
    RepairStep::Rebuild,
    RepairStep::Validate,
    RepairStep::Swap,
];

impl RepairSummary {
    fn new() -> Self {
        Self {
            success: false,
            steps: REPAIR_STEPS
                .iter()
                .map(|&step| RepairStepReport {
                    step,
                    status: RepairStepState::Pending,
                    message: None,
                })
                .collect(),
            error: None,
            pre_repair_copy: None,
            archived_db_path: None,
            orphans_fixed: OrphanCleanup::default(),
            duration_ms: 0,
        }
    }

    fn update_step(&mut self, step: RepairStep, status: RepairStepState, message: Option<String>) {
        tracing::info!(
            target: LOG_TARGET,
            event = "repair_step",
            step = ?step,
            status = ?status,
            message = message.as_deref().unwrap_or("")
        );
        if let Some(report) = self.steps.iter_mut().find(|report| report.step == step) {
            report.status = status;
            report.message = message;
        }
    }

    fn fail(&mut self, step: RepairStep, err: AppError) {
        self.update_step(step, RepairStepState::Failed, Some(err.to_string()));
        self.error = Some(err);
    }

    pub fn step(&self, step: RepairStep) -> Option<&RepairStepReport> {
        self.steps.iter().find(|report| report.step == step)
    }
}

/// Repair the store at `db_path` in place without losing readable rows.
///
/// No other connection to the file may be open. Every failure is reported in
/// the summary; the original file is untouched unless the swap step ran.
pub fn run_soft_repair(db_path: &Path, passphrase: &Passphrase) -> RepairSummary {
    let started = Instant::now();
    let mut summary = RepairSummary::new();
    tracing::info!(target: LOG_TARGET, event = "db_repair_start", path = %db_path.display());

    match copy_pre_repair_backup(db_path) {
        Ok(path) => {
            summary.update_step(
                RepairStep::Backup,
                RepairStepState::Success,
                Some(path.display().to_string()),
            );
            summary.pre_repair_copy = Some(path);
            prune_copies(db_path, "backup");
        }
        Err(err) => {
            summary.fail(RepairStep::Backup, err);
            return finish(summary, started);
        }
    }

    // CREATE lets `ATTACH ... KEY` create the rebuild target.
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI;
    let conn = match open_keyed(db_path, passphrase, flags) {
        Ok(conn) => conn,
        Err(err) => {
            summary.fail(
                RepairStep::Checkpoint,
                err.with_context("operation", "open_for_repair"),
            );
            return finish(summary, started);
        }
    };

    match checkpoint(&conn) {
        Ok(frames) => summary.update_step(
            RepairStep::Checkpoint,
            RepairStepState::Success,
            Some(format!("{frames} frame(s) checkpointed")),
        ),
        Err(err) => summary.update_step(
            RepairStep::Checkpoint,
            RepairStepState::Skipped,
            Some(err.to_string()),
        ),
    }

    if let Err(err) = conn.execute_batch("REINDEX;") {
        summary.fail(
            RepairStep::Reindex,
            AppError::from(err).with_context("operation", "reindex"),
        );
        return finish(summary, started);
    }
    summary.update_step(RepairStep::Reindex, RepairStepState::Success, None);

    match clear_orphans(&conn) {
        Ok(cleanup) => {
            let status = if cleanup.total() == 0 {
                RepairStepState::Skipped
            } else {
                RepairStepState::Success
            };
            summary.update_step(
                RepairStep::Orphans,
                status,
                Some(format!("{} reference(s) fixed", cleanup.total())),
            );
            summary.orphans_fixed = cleanup;
        }
        Err(err) => {
            summary.fail(RepairStep::Orphans, err);
            return finish(summary, started);
        }
    }

    let rebuilt = match rebuild_into(&conn, db_path, passphrase) {
        Ok(path) => path,
        Err(err) => {
            summary.fail(RepairStep::Rebuild, err);
            return finish(summary, started);
        }
    };
    summary.update_step(
        RepairStep::Rebuild,
        RepairStepState::Success,
        Some(rebuilt.display().to_string()),
    );
    drop(conn);

    if let Err(err) = validate_database(&rebuilt, passphrase) {
        let _ = fs::remove_file(&rebuilt);
        summary.fail(RepairStep::Validate, err);
        return finish(summary, started);
    }
    summary.update_step(RepairStep::Validate, RepairStepState::Success, None);

    let archive_path = with_suffix(db_path, PRE_REPAIR_SUFFIX);
    if let Err(err) = swap_database(db_path, &rebuilt, &archive_path) {
        let _ = fs::remove_file(&rebuilt);
        summary.fail(RepairStep::Swap, err);
        return finish(summary, started);
    }
    summary.update_step(
        RepairStep::Swap,
        RepairStepState::Success,
        Some(archive_path.display().to_string()),
    );
    summary.archived_db_path = Some(archive_path);
    summary.success = true;
    finish(summary, started)
}

fn finish(mut summary: RepairSummary, started: Instant) -> RepairSummary {
    summary.duration_ms = started.elapsed().as_millis() as u64;
    match &summary.error {
        None => tracing::info!(
            target: LOG_TARGET,
            event = "db_repair_complete",
            duration_ms = summary.duration_ms,
            orphans = summary.orphans_fixed.total()
        ),
        Some(err) => tracing::error!(
            target: LOG_TARGET,
            event = "db_repair_failed",
            duration_ms = summary.duration_ms,
            code = %err.code(),
            error = %err
        ),
    }
    summary
}

/// Drop older `<db>.<tag>-*` copies. Failures are logged and otherwise ignored.
pub(crate) fn prune_copies(db_path: &Path, tag: &str) {
    match prune_side_copies(db_path, tag, SIDE_COPY_KEEP) {
        Ok(removed) if !removed.is_empty() => tracing::info!(
            target: LOG_TARGET,
            event = "side_copies_pruned",
            tag = %tag,
            removed = removed.len()
        ),
        Ok(_) => {}
        Err(err) => tracing::warn!(
            target: LOG_TARGET,
            event = "side_copies_prune_failed",
            tag = %tag,
            error = %err
        ),
    }
}

/// Copy the store and its side files next to it before touching anything.
fn copy_pre_repair_backup(db_path: &Path) -> AppResult<PathBuf> {
    let stamp = Utc::now().format("%Y%m%d-%H%M%S").to_string();
    let mut target = with_suffix(db_path, &format!(".backup-{stamp}"));
    let mut attempt = 1;
    while target.exists() {
        target = with_suffix(db_path, &format!(".backup-{stamp}-{attempt:02}"));
        attempt += 1;
    }

    fs::copy(db_path, &target).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "copy_pre_repair_backup")
            .with_context("from", db_path.display().to_string())
            .with_context("to", target.display().to_string())
    })?;
    let db_name = db_path.as_os_str().to_string_lossy().into_owned();
    for sidecar in existing_sidecars(db_path) {
        let sidecar_name = sidecar.as_os_str().to_string_lossy().into_owned();
        let suffix = sidecar_name.trim_start_matches(&db_name);
        let copy_to = with_suffix(&target, suffix);
        fs::copy(&sidecar, &copy_to).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "copy_pre_repair_sidecar")
                .with_context("from", sidecar.display().to_string())
        })?;
    }
    Ok(target)
}

fn checkpoint(conn: &Connection) -> AppResult<i64> {
    let (busy, log, checkpointed): (i64, i64, i64) = conn
        .query_row("PRAGMA wal_checkpoint(TRUNCATE);", [], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })
        .map_err(|err| AppError::from(err).with_context("operation", "wal_checkpoint"))?;
    if busy != 0 {
        return Err(AppError::new("DB_REPAIR/CHECKPOINT_BUSY", "Checkpoint was blocked")
            .with_context("log_frames", log.to_string()));
    }
    Ok(checkpointed.max(0))
}

/// Null out optional dangling references and re-home or drop transactions
/// whose owning account is gone.
pub(crate) fn clear_orphans(conn: &Connection) -> AppResult<OrphanCleanup> {
    let tx = conn.unchecked_transaction()?;
    let mut cleanup = OrphanCleanup {
        categories_cleared: tx.execute(
            "UPDATE transactions SET category_id = NULL
             WHERE category_id IS NOT NULL
               AND category_id NOT IN (SELECT id FROM categories)",
            [],
        )?,
        transfers_cleared: tx.execute(
            "UPDATE transactions SET to_account_id = NULL
             WHERE to_account_id IS NOT NULL
               AND to_account_id NOT IN (SELECT id FROM accounts)",
            [],
        )?,
        ..OrphanCleanup::default()
    };

    let fallback: Option<i64> = tx
        .query_row(
            "SELECT id FROM accounts ORDER BY is_default DESC, id ASC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    match fallback {
        Some(account) => {
            cleanup.accounts_reassigned = tx.execute(
                "UPDATE transactions SET account_id = ?1
                 WHERE account_id NOT IN (SELECT id FROM accounts)",
                params![account],
            )?;
        }
        None => {
            cleanup.transactions_deleted = tx.execute(
                "DELETE FROM transactions WHERE account_id NOT IN (SELECT id FROM accounts)",
                [],
            )?;
        }
    }
    tx.commit()?;
    Ok(cleanup)
}

/// Export every page-reachable row into a fresh encrypted file beside the store.
fn rebuild_into(conn: &Connection, db_path: &Path, passphrase: &Passphrase) -> AppResult<PathBuf> {
    let target = with_suffix(db_path, ".rebuild");
    let stale_files = std::iter::once(target.clone())
        .filter(|path| path.exists())
        .chain(existing_sidecars(&target));
    for stale in stale_files {
        fs::remove_file(&stale).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "remove_stale_rebuild")
                .with_context("path", stale.display().to_string())
        })?;
    }

    let user_version: i64 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    let target_str = target.display().to_string();
    conn.execute(
        "ATTACH DATABASE ?1 AS rebuilt KEY ?2",
        params![target_str, passphrase.expose()],
    )
    .map_err(|err| AppError::from(err).with_context("operation", "attach_rebuild"))?;

    let exported = conn
        .query_row("SELECT sqlcipher_export('rebuilt');", [], |_| Ok(()))
        .and_then(|_| conn.execute_batch(&format!("PRAGMA rebuilt.user_version = {user_version};")));
    let detached = conn.execute_batch("DETACH DATABASE rebuilt;");
    exported.map_err(|err| {
        let _ = fs::remove_file(&target);
        AppError::from(err).with_context("operation", "sqlcipher_export")
    })?;
    detached.map_err(|err| AppError::from(err).with_context("operation", "detach_rebuild"))?;
    Ok(target)
}

fn validate_database(db_path: &Path, passphrase: &Passphrase) -> AppResult<()> {
    let conn = open_keyed(db_path, passphrase, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(|err| err.with_context("operation", "open_validation_db"))?;

    for pragma in ["quick_check", "integrity_check(1)"] {
        let verdict: String = conn
            .query_row(&format!("PRAGMA {pragma};"), [], |row| row.get(0))
            .map_err(|err| AppError::from(err).with_context("operation", pragma))?;
        if !verdict.eq_ignore_ascii_case("ok") {
            return Err(AppError::new(
                "DB_REPAIR/INTEGRITY_FAILED",
                format!("{pragma} reported: {verdict}"),
            ));
        }
    }

    let offenders = foreign_key_offenders(&conn)?;
    if let Some(first) = offenders.first() {
        return Err(AppError::new(
            "DB_REPAIR/FOREIGN_KEY_FAILED",
            format!(
                "Foreign key violation in {} at rowid {}: {}",
                first.table, first.rowid, first.message
            ),
        )
        .with_context("violations", offenders.len().to_string()));
    }
    Ok(())
}
