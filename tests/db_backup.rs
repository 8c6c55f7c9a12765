#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::fs;
use std::path::Path;

use proptest::prelude::*;
use serde_json::json;
use tempfile::tempdir;

use ledgerkeep_lib::db::backup::BackupManager;
use ledgerkeep_lib::db::snapshot::{SnapshotDocument, SNAPSHOT_FORMAT_VERSION};
use ledgerkeep_lib::error::codes;
use ledgerkeep_lib::{repo, Ledger};

mod util;
use util::{count, insert_transactions, ms, open_ledger, seed_reference_data, transaction};

fn seeded(dir: &Path) -> Ledger {
    let ledger = open_ledger(dir);
    let live = ledger.live.get().unwrap();
    seed_reference_data(&live);
    insert_transactions(
        &live,
        &(1..=25)
            .map(|id| transaction(id, ms(2024, 3, (id % 28) as u32 + 1), Some(id % 4 + 1), id % 3 + 1))
            .collect::<Vec<_>>(),
    );
    live.run_in_tx(|tx| {
        tx.execute(
            "INSERT INTO budgets (id, name, amount, start_date, end_date, category_ids)
             VALUES (1, 'Groceries', 400.0, 0, 1, '[1,3]')",
            [],
        )?;
        Ok(())
    })
    .unwrap();
    ledger
}

#[test]
fn snapshot_then_restore_round_trips_every_table() {
    let dir = tempdir().unwrap();
    let ledger = seeded(dir.path());
    let live = ledger.live.get().unwrap();
    let before = live.with_conn(repo::list_transactions).unwrap();

    let snapshot = ledger.backups.create_snapshot("before-trip").unwrap();
    assert_eq!(snapshot.file_name, "before-trip.json");
    assert!(snapshot.size_bytes > 0);

    let doc = SnapshotDocument::read(&snapshot.path).unwrap();
    assert_eq!(doc.format_version, SNAPSHOT_FORMAT_VERSION);
    assert_eq!(doc.counts().transactions, 25);
    assert_eq!(doc.budgets[0].category_ids, vec![1, 3]);

    live.run_in_tx(|tx| repo::clear_all(tx)).unwrap();
    assert_eq!(count(&live, "transactions"), 0);

    let summary = ledger.backups.restore(&snapshot.path).unwrap();
    assert_eq!(summary.counts.transactions, 25);
    assert_eq!(summary.counts.budgets, 1);
    assert_eq!(live.with_conn(repo::list_transactions).unwrap(), before);
    assert_eq!(count(&live, "categories"), 4);
    assert_eq!(count(&live, "accounts"), 3);
}

#[test]
fn malformed_snapshot_leaves_live_store_untouched() {
    let dir = tempdir().unwrap();
    let ledger = seeded(dir.path());
    let bad = ledger.backups.dir().join("broken.json");
    fs::write(&bad, br#"{"metadata": {"exportTime": 1}, "categories": ["#).unwrap();

    let err = ledger.backups.restore(&bad).expect_err("malformed snapshot");
    assert_eq!(err.code(), codes::SERIALIZATION_FAILED);
    let live = ledger.live.get().unwrap();
    assert_eq!(count(&live, "transactions"), 25);
    assert_eq!(count(&live, "budgets"), 1);
}

#[test]
fn newer_format_is_rejected_before_touching_the_store() {
    let dir = tempdir().unwrap();
    let ledger = seeded(dir.path());
    let future = ledger.backups.dir().join("future.json");
    let payload = json!({
        "formatVersion": SNAPSHOT_FORMAT_VERSION + 1,
        "metadata": {"exportTime": 1},
        "categories": [], "accounts": [], "transactions": []
    });
    fs::write(&future, serde_json::to_vec(&payload).unwrap()).unwrap();

    let err = ledger.backups.restore(&future).expect_err("future format");
    assert_eq!(err.code(), codes::UNSUPPORTED_VERSION);
    assert_eq!(count(&ledger.live.get().unwrap(), "transactions"), 25);
}

#[test]
fn restore_failing_midway_rolls_back() {
    let dir = tempdir().unwrap();
    let ledger = seeded(dir.path());
    let dangling = ledger.backups.dir().join("dangling.json");
    let payload = json!({
        "metadata": {"exportTime": 1},
        "categories": [{"id": 1, "name": "Food", "type": "EXPENSE"}],
        "accounts": [{"id": 1, "name": "Wallet", "type": "CASH"}],
        "transactions": [
            {"id": 1, "amount": 1.0, "accountId": 1, "date": 0},
            {"id": 2, "amount": 2.0, "accountId": 99, "date": 0}
        ]
    });
    fs::write(&dangling, serde_json::to_vec(&payload).unwrap()).unwrap();

    let validation = ledger.backups.validate_snapshot(&dangling).unwrap();
    assert!(!validation.is_consistent());
    assert_eq!(validation.format_version, 1);

    let err = ledger.backups.restore(&dangling).expect_err("foreign key failure");
    assert!(err.has_code("SQLITE/CONSTRAINT"), "{err}");
    let live = ledger.live.get().unwrap();
    assert_eq!(count(&live, "transactions"), 25);
    assert_eq!(count(&live, "categories"), 4);
}

#[test]
fn scheduled_snapshots_keep_the_newest_five() {
    let dir = tempdir().unwrap();
    let ledger = seeded(dir.path());

    let mut created = Vec::new();
    for _ in 0..10 {
        created.push(ledger.backups.create_scheduled_snapshot().unwrap().file_name);
    }

    let listed: Vec<String> = ledger
        .backups
        .list_snapshots()
        .unwrap()
        .into_iter()
        .map(|snapshot| snapshot.file_name)
        .collect();
    let mut expected: Vec<String> = created[5..].to_vec();
    expected.reverse();
    assert_eq!(listed, expected);
}

#[test]
fn restore_latest_uses_the_newest_snapshot() {
    let dir = tempdir().unwrap();
    let ledger = seeded(dir.path());
    assert!(ledger.backups.restore_latest().unwrap().is_none());

    ledger.backups.create_snapshot("aaa-older").unwrap();
    let live = ledger.live.get().unwrap();
    insert_transactions(&live, &[transaction(500, ms(2024, 4, 1), None, 1)]);
    let newest = ledger.backups.create_manual_snapshot().unwrap();

    live.run_in_tx(|tx| repo::clear_all(tx)).unwrap();
    let summary = ledger.backups.restore_latest().unwrap().unwrap();
    assert_eq!(summary.source, newest.path);
    assert_eq!(count(&live, "transactions"), 26);
}

#[test]
fn delete_refuses_paths_outside_the_backup_dir() {
    let dir = tempdir().unwrap();
    let ledger = seeded(dir.path());
    let snapshot = ledger.backups.create_snapshot("keep-me").unwrap();
    let outside = dir.path().join("outside.json");
    fs::write(&outside, b"{}").unwrap();

    assert!(!ledger.backups.delete_snapshot(&outside));
    assert!(outside.exists());
    assert!(!ledger.backups.delete_snapshot(&dir.path().join("absent.json")));

    assert!(ledger.backups.delete_snapshot(&snapshot.path));
    assert!(!snapshot.path.exists());
    assert!(!ledger.backups.delete_snapshot(&snapshot.path));
}

#[test]
fn validation_reports_counts_and_digest() {
    let dir = tempdir().unwrap();
    let ledger = seeded(dir.path());
    let snapshot = ledger.backups.create_snapshot("check").unwrap();

    let validation = ledger.backups.validate_snapshot(&snapshot.path).unwrap();
    assert!(validation.is_consistent());
    assert_eq!(validation.counts.transactions, 25);
    assert_eq!(validation.counts.accounts, 3);
    assert_eq!(validation.sha256.len(), 64);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn retention_keeps_exactly_the_first_keep(files in 0usize..12, keep in 0usize..8) {
        let dir = tempdir().unwrap();
        let live = ledgerkeep_lib::db::LiveStore::new(
            dir.path().join("ledgerkeep.sqlite3"),
            ledgerkeep_lib::config::Passphrase::new("k"),
        );
        let backups_dir = dir.path().join("backups");
        fs::create_dir_all(&backups_dir).unwrap();
        for index in 0..files {
            fs::write(backups_dir.join(format!("backup_{index:03}.json")), b"{}").unwrap();
        }
        fs::write(backups_dir.join("notes.txt"), b"not a snapshot").unwrap();
        let manager = BackupManager::new(live, &backups_dir, keep);

        let before: Vec<_> = manager.list_snapshots().unwrap();
        let report = manager.enforce_retention(keep).unwrap();
        let after: Vec<_> = manager.list_snapshots().unwrap();

        prop_assert_eq!(after.len(), files.min(keep));
        prop_assert_eq!(report.kept, files.min(keep));
        prop_assert_eq!(report.removed.len(), files.saturating_sub(keep));
        prop_assert!(report.failed.is_empty());
        let kept_names: Vec<_> = before.iter().take(keep).map(|s| s.file_name.clone()).collect();
        let after_names: Vec<_> = after.iter().map(|s| s.file_name.clone()).collect();
        prop_assert_eq!(after_names, kept_names);
        prop_assert!(backups_dir.join("notes.txt").exists());
    }
}
