#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::path::Path;

use chrono::{TimeZone, Utc};
use serde_json::json;

use ledgerkeep_lib::config::{LedgerConfig, StaticPassphrases};
use ledgerkeep_lib::db::EncryptedStore;
use ledgerkeep_lib::model::{Account, Category, Transaction};
use ledgerkeep_lib::{repo, Ledger};

pub const LIVE_KEY: &str = "live-test-key";
pub const ARCHIVE_KEY: &str = "archive-test-key";

pub fn keys() -> StaticPassphrases {
    StaticPassphrases::new(LIVE_KEY, ARCHIVE_KEY)
}

pub fn open_ledger(dir: &Path) -> Ledger {
    Ledger::open(LedgerConfig::for_data_dir(dir), &keys()).expect("open ledger")
}

pub fn ms(year: i32, month: u32, day: u32) -> i64 {
    Utc.with_ymd_and_hms(year, month, day, 12, 0, 0)
        .unwrap()
        .timestamp_millis()
}

pub fn category(id: i64) -> Category {
    serde_json::from_value(json!({
        "id": id,
        "name": format!("Category {id}"),
        "type": if id % 2 == 0 { "INCOME" } else { "EXPENSE" },
    }))
    .unwrap()
}

pub fn account(id: i64) -> Account {
    serde_json::from_value(json!({
        "id": id,
        "name": format!("Account {id}"),
        "type": "CASH",
        "isDefault": id == 1,
    }))
    .unwrap()
}

pub fn transaction(id: i64, date: i64, category_id: Option<i64>, account_id: i64) -> Transaction {
    serde_json::from_value(json!({
        "id": id,
        "amount": (id as f64) * 1.5,
        "categoryId": category_id,
        "accountId": account_id,
        "date": date,
        "note": format!("entry {id}"),
        "isIncome": id % 3 == 0,
    }))
    .unwrap()
}

/// Seeds categories 1..=4 and accounts 1..=3.
pub fn seed_reference_data(store: &EncryptedStore) {
    store
        .run_in_tx(|tx| {
            for id in 1..=4 {
                repo::upsert_category(tx, &category(id))?;
            }
            for id in 1..=3 {
                repo::upsert_account(tx, &account(id))?;
            }
            Ok(())
        })
        .unwrap();
}

pub fn insert_transactions(store: &EncryptedStore, records: &[Transaction]) {
    store
        .run_in_tx(|tx| {
            for record in records {
                repo::upsert_transaction(tx, record)?;
            }
            Ok(())
        })
        .unwrap();
}

pub fn count(store: &EncryptedStore, table: &str) -> i64 {
    store.with_conn(|conn| repo::count_rows(conn, table)).unwrap()
}
