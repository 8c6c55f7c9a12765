use rusqlite::Connection;

use crate::AppResult;

pub const SCHEMA_VERSION: i64 = 1;

const LIVE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS categories (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    type TEXT NOT NULL CHECK (type IN ('EXPENSE', 'INCOME')),
    icon TEXT NOT NULL DEFAULT '',
    color INTEGER NOT NULL DEFAULT 0,
    is_custom INTEGER NOT NULL DEFAULT 0,
    sort_order INTEGER NOT NULL DEFAULT 0,
    parent_id INTEGER,
    level INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS accounts (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    type TEXT NOT NULL,
    balance REAL NOT NULL DEFAULT 0,
    currency TEXT NOT NULL DEFAULT 'CNY',
    exchange_rate REAL NOT NULL DEFAULT 1,
    color INTEGER NOT NULL DEFAULT 0,
    icon TEXT NOT NULL DEFAULT '',
    is_default INTEGER NOT NULL DEFAULT 0,
    include_in_total INTEGER NOT NULL DEFAULT 1,
    credit_limit REAL NOT NULL DEFAULT 0,
    billing_day INTEGER NOT NULL DEFAULT 0,
    due_day INTEGER NOT NULL DEFAULT 0,
    display_order INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS budgets (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    amount REAL NOT NULL,
    start_date INTEGER NOT NULL,
    end_date INTEGER NOT NULL,
    period TEXT NOT NULL DEFAULT 'MONTHLY',
    category_ids TEXT NOT NULL DEFAULT '[]',
    is_active INTEGER NOT NULL DEFAULT 1,
    notify_enabled INTEGER NOT NULL DEFAULT 0,
    notify_threshold INTEGER NOT NULL DEFAULT 80
);

CREATE TABLE IF NOT EXISTS transactions (
    id INTEGER PRIMARY KEY,
    amount REAL NOT NULL,
    category_id INTEGER REFERENCES categories(id) ON DELETE SET NULL,
    account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
    date INTEGER NOT NULL,
    note TEXT NOT NULL DEFAULT '',
    is_income INTEGER NOT NULL DEFAULT 0,
    location TEXT NOT NULL DEFAULT '',
    image_uri TEXT,
    to_account_id INTEGER REFERENCES accounts(id) ON DELETE SET NULL,
    created_by INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL DEFAULT 0,
    is_private INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS transactions_date_idx ON transactions(date);
CREATE INDEX IF NOT EXISTS transactions_category_idx ON transactions(category_id);
CREATE INDEX IF NOT EXISTS transactions_account_idx ON transactions(account_id);
"#;

// Shards only ever receive upserts, so references carry no cascade actions.
const ARCHIVE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS categories (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    type TEXT NOT NULL,
    icon TEXT NOT NULL DEFAULT '',
    color INTEGER NOT NULL DEFAULT 0,
    is_custom INTEGER NOT NULL DEFAULT 0,
    sort_order INTEGER NOT NULL DEFAULT 0,
    parent_id INTEGER,
    level INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS accounts (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    type TEXT NOT NULL,
    balance REAL NOT NULL DEFAULT 0,
    currency TEXT NOT NULL DEFAULT 'CNY',
    exchange_rate REAL NOT NULL DEFAULT 1,
    color INTEGER NOT NULL DEFAULT 0,
    icon TEXT NOT NULL DEFAULT '',
    is_default INTEGER NOT NULL DEFAULT 0,
    include_in_total INTEGER NOT NULL DEFAULT 1,
    credit_limit REAL NOT NULL DEFAULT 0,
    billing_day INTEGER NOT NULL DEFAULT 0,
    due_day INTEGER NOT NULL DEFAULT 0,
    display_order INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS transactions (
    id INTEGER PRIMARY KEY,
    amount REAL NOT NULL,
    category_id INTEGER REFERENCES categories(id),
    account_id INTEGER NOT NULL REFERENCES accounts(id),
    date INTEGER NOT NULL,
    note TEXT NOT NULL DEFAULT '',
    is_income INTEGER NOT NULL DEFAULT 0,
    location TEXT NOT NULL DEFAULT '',
    image_uri TEXT,
    to_account_id INTEGER REFERENCES accounts(id),
    created_by INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL DEFAULT 0,
    is_private INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS transactions_date_idx ON transactions(date);
"#;

/// Which table set a store carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreSchema {
    Live,
    Archive,
}

impl StoreSchema {
    pub fn ddl(&self) -> &'static str {
        match self {
            StoreSchema::Live => LIVE_DDL,
            StoreSchema::Archive => ARCHIVE_DDL,
        }
    }

    pub fn tables(&self) -> &'static [&'static str] {
        match self {
            StoreSchema::Live => &["categories", "accounts", "budgets", "transactions"],
            StoreSchema::Archive => &["categories", "accounts", "transactions"],
        }
    }

    pub fn apply(&self, conn: &Connection) -> AppResult<()> {
        conn.execute_batch(self.ddl())?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap();
        stmt.query_map([], |row| row.get::<_, String>(0))
            .unwrap()
            .map(|row| row.unwrap())
            .collect()
    }

    #[test]
    fn live_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        StoreSchema::Live.apply(&conn).unwrap();
        StoreSchema::Live.apply(&conn).unwrap();
        assert_eq!(
            table_names(&conn),
            vec!["accounts", "budgets", "categories", "transactions"]
        );
        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn archive_schema_has_no_budgets() {
        let conn = Connection::open_in_memory().unwrap();
        StoreSchema::Archive.apply(&conn).unwrap();
        assert_eq!(
            table_names(&conn),
            vec!["accounts", "categories", "transactions"]
        );
    }
}
