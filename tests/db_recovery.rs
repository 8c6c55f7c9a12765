#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::fs;
use std::path::Path;

use tempfile::tempdir;

use ledgerkeep_lib::db::health::{CorruptionKind, RecoveryAction};
use ledgerkeep_lib::db::recovery::{MarkerStatus, RecoveryState};
use ledgerkeep_lib::db::repair::{RepairStep, RepairStepState};
use ledgerkeep_lib::db::swap::SIDE_COPY_KEEP;
use ledgerkeep_lib::{repo, Ledger};

mod util;
use util::{count, insert_transactions, ms, open_ledger, seed_reference_data, transaction};

fn seeded(dir: &Path) -> Ledger {
    let ledger = open_ledger(dir);
    let live = ledger.live.get().unwrap();
    seed_reference_data(&live);
    insert_transactions(
        &live,
        &(1..=40)
            .map(|id| transaction(id, ms(2024, 2, (id % 28) as u32 + 1), Some(id % 4 + 1), id % 3 + 1))
            .collect::<Vec<_>>(),
    );
    ledger
}

fn scribble_over_live_file(ledger: &Ledger) {
    ledger.live.close().unwrap();
    fs::write(ledger.live.path(), vec![0x5a; 8192]).unwrap();
}

#[test]
fn unreadable_store_is_rebuilt_from_the_newest_snapshot() {
    let dir = tempdir().unwrap();
    let ledger = seeded(dir.path());
    ledger.backups.create_snapshot("before-damage").unwrap();
    scribble_over_live_file(&ledger);

    let report = ledger.recovery.probe();
    assert!(report.corrupted);
    assert_eq!(report.kind, Some(CorruptionKind::Unreadable));
    assert_eq!(report.recommended_action(), RecoveryAction::ForceRebuild);
    assert_eq!(
        ledger.recovery.read_marker().unwrap().status,
        MarkerStatus::Corrupted
    );

    assert!(!ledger.recovery.repair());
    assert_eq!(ledger.recovery.state(), RecoveryState::Unrepairable);
    let summary = ledger.recovery.last_repair().unwrap();
    assert!(!summary.success);
    assert!(summary.error.is_some());
    assert_ne!(
        summary.step(RepairStep::Swap).unwrap().status,
        RepairStepState::Success
    );

    let outcome = ledger.recovery.force_repair().unwrap();
    let quarantined = outcome.quarantined_path.unwrap();
    assert!(quarantined.exists());
    assert_eq!(fs::read(&quarantined).unwrap(), vec![0x5a; 8192]);
    assert!(outcome
        .restored_from
        .unwrap()
        .ends_with("before-damage.json"));

    assert!(!ledger.recovery.probe().corrupted);
    assert_eq!(ledger.recovery.state(), RecoveryState::Healthy);
    let live = ledger.live.get().unwrap();
    assert_eq!(count(&live, "transactions"), 40);
    assert_eq!(count(&live, "accounts"), 3);
}

#[test]
fn dangling_references_are_fixed_by_soft_repair() {
    let dir = tempdir().unwrap();
    let ledger = seeded(dir.path());
    ledger
        .live
        .get()
        .unwrap()
        .with_conn(|conn| {
            conn.execute_batch(
                "PRAGMA foreign_keys = OFF;
                 DELETE FROM accounts WHERE id = 2;
                 DELETE FROM categories WHERE id = 3;
                 PRAGMA foreign_keys = ON;",
            )?;
            Ok(())
        })
        .unwrap();
    ledger.live.close().unwrap();

    let report = ledger.recovery.probe();
    assert_eq!(report.kind, Some(CorruptionKind::ForeignKeyViolations));
    assert_eq!(report.recommended_action(), RecoveryAction::SoftRepair);
    assert!(!report.offenders.is_empty());
    assert!(report
        .offenders
        .iter()
        .all(|offender| offender.table == "transactions"));

    assert!(ledger.recovery.repair());
    assert_eq!(ledger.recovery.state(), RecoveryState::Healthy);
    let summary = ledger.recovery.last_repair().unwrap();
    assert!(summary.success);
    assert!(summary.orphans_fixed.accounts_reassigned > 0);
    assert!(summary.orphans_fixed.categories_cleared > 0);
    assert_eq!(summary.orphans_fixed.transactions_deleted, 0);
    assert!(summary.pre_repair_copy.as_ref().unwrap().exists());
    assert_eq!(
        summary.step(RepairStep::Rebuild).unwrap().status,
        RepairStepState::Success
    );

    let live = ledger.live.get().unwrap();
    assert_eq!(count(&live, "transactions"), 40);
    let records = live.with_conn(repo::list_transactions).unwrap();
    assert!(records.iter().all(|record| record.account_id != 2));
    assert!(records.iter().all(|record| record.category_id != Some(3)));
    assert!(!ledger.recovery.probe().corrupted);
}

#[test]
fn ensure_healthy_escalates_to_a_rebuild() {
    let dir = tempdir().unwrap();
    let ledger = seeded(dir.path());
    ledger.backups.create_snapshot("nightly").unwrap();
    scribble_over_live_file(&ledger);

    assert_eq!(
        ledger.recovery.ensure_healthy().unwrap(),
        RecoveryState::Healthy
    );
    assert!(!ledger.recovery.last_repair().unwrap().success);
    assert_eq!(count(&ledger.live.get().unwrap(), "transactions"), 40);
    assert_eq!(
        ledger.recovery.read_marker().unwrap().status,
        MarkerStatus::Ok
    );
}

#[test]
fn ensure_healthy_leaves_a_good_store_alone() {
    let dir = tempdir().unwrap();
    let ledger = seeded(dir.path());
    ledger.live.close().unwrap();

    assert_eq!(
        ledger.recovery.ensure_healthy().unwrap(),
        RecoveryState::Healthy
    );
    assert!(ledger.recovery.last_repair().is_none());
    assert_eq!(count(&ledger.live.get().unwrap(), "transactions"), 40);
    let report = ledger.recovery.last_report().unwrap();
    assert!(report.failed_checks().next().is_none(), "{report:?}");
    assert!(!dir
        .path()
        .read_dir()
        .unwrap()
        .any(|entry| entry.unwrap().file_name().to_string_lossy().contains(".corrupt-")));
}

#[test]
fn store_probes_clean_while_open_after_an_archive_pass() {
    let dir = tempdir().unwrap();
    let ledger = seeded(dir.path());
    let cutoff = chrono::DateTime::from_timestamp_millis(ms(2025, 1, 1)).unwrap();
    assert!(ledger.archive.archive_before(cutoff).success);

    let report = ledger.recovery.probe();
    let failed: Vec<&str> = report.failed_checks().map(|check| check.name.as_str()).collect();
    assert!(failed.is_empty(), "{failed:?}");
    assert!(!report.corrupted);
}

#[test]
fn damaged_pages_fall_through_to_a_rebuild() {
    let dir = tempdir().unwrap();
    let ledger = open_ledger(dir.path());
    let live = ledger.live.get().unwrap();
    seed_reference_data(&live);
    insert_transactions(
        &live,
        &(1..=3000)
            .map(|id| transaction(id, ms(2024, 3, (id % 28) as u32 + 1), Some(id % 4 + 1), 1))
            .collect::<Vec<_>>(),
    );
    drop(live);
    ledger.backups.create_snapshot("before-damage").unwrap();
    ledger.live.close().unwrap();

    // Flip 2 KiB in the middle of page 5.
    let mut bytes = fs::read(ledger.live.path()).unwrap();
    let start = 4 * 4096 + 1024;
    assert!(bytes.len() > start + 2048);
    for byte in &mut bytes[start..start + 2048] {
        *byte ^= 0xff;
    }
    fs::write(ledger.live.path(), &bytes).unwrap();

    let report = ledger.recovery.probe();
    assert!(report.corrupted);
    assert_eq!(report.kind, Some(CorruptionKind::IntegrityFailed));

    assert!(!ledger.recovery.repair());
    assert_eq!(ledger.recovery.state(), RecoveryState::Unrepairable);

    let outcome = ledger.recovery.force_repair().unwrap();
    assert!(outcome.restored_from.unwrap().ends_with("before-damage.json"));
    assert!(!ledger.recovery.probe().corrupted);
    assert_eq!(count(&ledger.live.get().unwrap(), "transactions"), 3000);
}

fn side_copies(dir: &Path, tag: &str) -> usize {
    dir.read_dir()
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains(&format!(".{tag}-")) && !name.ends_with("-wal") && !name.ends_with("-shm"))
        .count()
}

#[test]
fn repeated_repairs_and_rebuilds_keep_a_bounded_number_of_copies() {
    let dir = tempdir().unwrap();
    let ledger = seeded(dir.path());
    ledger.backups.create_snapshot("nightly").unwrap();
    ledger.live.close().unwrap();

    for _ in 0..5 {
        assert!(ledger.recovery.repair());
    }
    assert_eq!(side_copies(dir.path(), "backup"), SIDE_COPY_KEEP);

    for _ in 0..5 {
        scribble_over_live_file(&ledger);
        ledger.recovery.force_repair().unwrap();
    }
    assert_eq!(side_copies(dir.path(), "corrupt"), SIDE_COPY_KEEP);
    assert_eq!(count(&ledger.live.get().unwrap(), "transactions"), 40);
}

#[test]
fn rebuild_skips_a_snapshot_that_does_not_restore() {
    let dir = tempdir().unwrap();
    let ledger = seeded(dir.path());
    let good = ledger.backups.create_snapshot("aaa-good").unwrap();
    fs::write(ledger.backups.dir().join("zzz-broken.json"), b"{ not json").unwrap();
    scribble_over_live_file(&ledger);

    let outcome = ledger.recovery.force_repair().unwrap();
    assert_eq!(outcome.restored_from, Some(good.path));
    assert!(outcome.restore_error.is_none());
    assert_eq!(count(&ledger.live.get().unwrap(), "transactions"), 40);
}

#[test]
fn rebuild_with_only_broken_snapshots_reports_the_failure() {
    let dir = tempdir().unwrap();
    let ledger = seeded(dir.path());
    fs::write(ledger.backups.dir().join("broken.json"), b"[]").unwrap();
    scribble_over_live_file(&ledger);

    let outcome = ledger.recovery.force_repair().unwrap();
    assert!(outcome.restored_from.is_none());
    assert!(outcome.restore_error.is_some());
    assert_eq!(ledger.recovery.state(), RecoveryState::Healthy);
    assert_eq!(count(&ledger.live.get().unwrap(), "transactions"), 0);
}
