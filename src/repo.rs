//! Row mapping and SQL for ledger entities.
//!
//! Every function takes a plain `&Connection`; a `rusqlite::Transaction`
//! derefs to one, so callers choose the transaction boundary.

use std::collections::BTreeSet;

use rusqlite::{params, params_from_iter, Connection, Row};

use crate::model::{Account, Budget, Category, CategoryType, Transaction};
use crate::{AppError, AppResult};

/// Bound parameters per `IN (...)` chunk.
const ID_CHUNK: usize = 500;

const CATEGORY_COLUMNS: &str =
    "id, name, type, icon, color, is_custom, sort_order, parent_id, level";
const ACCOUNT_COLUMNS: &str = "id, name, type, balance, currency, exchange_rate, color, icon, \
     is_default, include_in_total, credit_limit, billing_day, due_day, display_order";
pub(crate) const TRANSACTION_COLUMNS: &str = "id, amount, category_id, account_id, date, note, \
     is_income, location, image_uri, to_account_id, created_by, created_at, updated_at, is_private";
const BUDGET_COLUMNS: &str = "id, name, amount, start_date, end_date, period, category_ids, \
     is_active, notify_enabled, notify_threshold";

fn category_from_row(row: &Row<'_>) -> rusqlite::Result<Category> {
    let kind: String = row.get(2)?;
    Ok(Category {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: CategoryType::parse(&kind).unwrap_or(CategoryType::Expense),
        icon: row.get(3)?,
        color: row.get(4)?,
        is_custom: row.get(5)?,
        sort_order: row.get(6)?,
        parent_id: row.get(7)?,
        level: row.get(8)?,
    })
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: row.get(2)?,
        balance: row.get(3)?,
        currency: row.get(4)?,
        exchange_rate: row.get(5)?,
        color: row.get(6)?,
        icon: row.get(7)?,
        is_default: row.get(8)?,
        include_in_total: row.get(9)?,
        credit_limit: row.get(10)?,
        billing_day: row.get(11)?,
        due_day: row.get(12)?,
        display_order: row.get(13)?,
    })
}

pub(crate) fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    Ok(Transaction {
        id: row.get(0)?,
        amount: row.get(1)?,
        category_id: row.get(2)?,
        account_id: row.get(3)?,
        date: row.get(4)?,
        note: row.get(5)?,
        is_income: row.get(6)?,
        location: row.get(7)?,
        image_uri: row.get(8)?,
        to_account_id: row.get(9)?,
        created_by: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
        is_private: row.get(13)?,
    })
}

fn budget_from_row(row: &Row<'_>) -> rusqlite::Result<Budget> {
    let category_ids: String = row.get(6)?;
    Ok(Budget {
        id: row.get(0)?,
        name: row.get(1)?,
        amount: row.get(2)?,
        start_date: row.get(3)?,
        end_date: row.get(4)?,
        period: row.get(5)?,
        category_ids: serde_json::from_str(&category_ids).unwrap_or_default(),
        is_active: row.get(7)?,
        notify_enabled: row.get(8)?,
        notify_threshold: row.get(9)?,
    })
}

/// Insert or update by id. Never deletes, so no foreign-key action fires.
pub fn upsert_category(conn: &Connection, c: &Category) -> AppResult<()> {
    conn.prepare_cached(
        "INSERT INTO categories (id, name, type, icon, color, is_custom, sort_order, parent_id, level)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name, type = excluded.type, icon = excluded.icon,
            color = excluded.color, is_custom = excluded.is_custom,
            sort_order = excluded.sort_order, parent_id = excluded.parent_id,
            level = excluded.level",
    )?
    .execute(params![
        c.id,
        c.name,
        c.kind.as_str(),
        c.icon,
        c.color,
        c.is_custom,
        c.sort_order,
        c.parent_id,
        c.level
    ])?;
    Ok(())
}

pub fn upsert_account(conn: &Connection, a: &Account) -> AppResult<()> {
    conn.prepare_cached(
        "INSERT INTO accounts (id, name, type, balance, currency, exchange_rate, color, icon,
            is_default, include_in_total, credit_limit, billing_day, due_day, display_order)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name, type = excluded.type, balance = excluded.balance,
            currency = excluded.currency, exchange_rate = excluded.exchange_rate,
            color = excluded.color, icon = excluded.icon, is_default = excluded.is_default,
            include_in_total = excluded.include_in_total, credit_limit = excluded.credit_limit,
            billing_day = excluded.billing_day, due_day = excluded.due_day,
            display_order = excluded.display_order",
    )?
    .execute(params![
        a.id,
        a.name,
        a.kind,
        a.balance,
        a.currency,
        a.exchange_rate,
        a.color,
        a.icon,
        a.is_default,
        a.include_in_total,
        a.credit_limit,
        a.billing_day,
        a.due_day,
        a.display_order
    ])?;
    Ok(())
}

pub fn upsert_transaction(conn: &Connection, t: &Transaction) -> AppResult<()> {
    conn.prepare_cached(
        "INSERT INTO transactions (id, amount, category_id, account_id, date, note, is_income,
            location, image_uri, to_account_id, created_by, created_at, updated_at, is_private)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
         ON CONFLICT(id) DO UPDATE SET
            amount = excluded.amount, category_id = excluded.category_id,
            account_id = excluded.account_id, date = excluded.date, note = excluded.note,
            is_income = excluded.is_income, location = excluded.location,
            image_uri = excluded.image_uri, to_account_id = excluded.to_account_id,
            created_by = excluded.created_by, created_at = excluded.created_at,
            updated_at = excluded.updated_at, is_private = excluded.is_private",
    )?
    .execute(params![
        t.id,
        t.amount,
        t.category_id,
        t.account_id,
        t.date,
        t.note,
        t.is_income,
        t.location,
        t.image_uri,
        t.to_account_id,
        t.created_by,
        t.created_at,
        t.updated_at,
        t.is_private
    ])?;
    Ok(())
}

pub fn insert_budget(conn: &Connection, b: &Budget) -> AppResult<()> {
    let category_ids = serde_json::to_string(&b.category_ids)?;
    conn.prepare_cached(
        "INSERT INTO budgets (id, name, amount, start_date, end_date, period, category_ids,
            is_active, notify_enabled, notify_threshold)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    )?
    .execute(params![
        b.id,
        b.name,
        b.amount,
        b.start_date,
        b.end_date,
        b.period,
        category_ids,
        b.is_active,
        b.notify_enabled,
        b.notify_threshold
    ])?;
    Ok(())
}

fn query_all<T>(
    conn: &Connection,
    sql: &str,
    map: fn(&Row<'_>) -> rusqlite::Result<T>,
) -> AppResult<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], map)?;
    rows.collect::<rusqlite::Result<Vec<T>>>()
        .map_err(AppError::from)
}

pub fn list_categories(conn: &Connection) -> AppResult<Vec<Category>> {
    query_all(
        conn,
        &format!("SELECT {CATEGORY_COLUMNS} FROM categories ORDER BY id"),
        category_from_row,
    )
}

pub fn list_accounts(conn: &Connection) -> AppResult<Vec<Account>> {
    query_all(
        conn,
        &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY id"),
        account_from_row,
    )
}

pub fn list_transactions(conn: &Connection) -> AppResult<Vec<Transaction>> {
    query_all(
        conn,
        &format!("SELECT {TRANSACTION_COLUMNS} FROM transactions ORDER BY id"),
        transaction_from_row,
    )
}

pub fn list_budgets(conn: &Connection) -> AppResult<Vec<Budget>> {
    query_all(
        conn,
        &format!("SELECT {BUDGET_COLUMNS} FROM budgets ORDER BY id"),
        budget_from_row,
    )
}

/// Entries whose archival timestamp is strictly before `before_ms`.
pub fn transactions_before(conn: &Connection, before_ms: i64) -> AppResult<Vec<Transaction>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE date < ?1 ORDER BY date, id"
    ))?;
    let rows = stmt.query_map([before_ms], transaction_from_row)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(AppError::from)
}

fn by_ids<T>(
    conn: &Connection,
    table: &str,
    columns: &str,
    ids: &BTreeSet<i64>,
    map: fn(&Row<'_>) -> rusqlite::Result<T>,
) -> AppResult<Vec<T>> {
    let ids: Vec<i64> = ids.iter().copied().collect();
    let mut out = Vec::with_capacity(ids.len());
    for chunk in ids.chunks(ID_CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT {columns} FROM {table} WHERE id IN ({placeholders}) ORDER BY id"
        ))?;
        let rows = stmt.query_map(params_from_iter(chunk.iter()), map)?;
        for row in rows {
            out.push(row?);
        }
    }
    Ok(out)
}

pub fn categories_by_ids(conn: &Connection, ids: &BTreeSet<i64>) -> AppResult<Vec<Category>> {
    by_ids(conn, "categories", CATEGORY_COLUMNS, ids, category_from_row)
}

pub fn accounts_by_ids(conn: &Connection, ids: &BTreeSet<i64>) -> AppResult<Vec<Account>> {
    by_ids(conn, "accounts", ACCOUNT_COLUMNS, ids, account_from_row)
}

/// Delete entries by id in chunks. Returns the number of rows removed.
pub fn delete_transactions_by_ids(conn: &Connection, ids: &[i64]) -> AppResult<usize> {
    let mut removed = 0;
    for chunk in ids.chunks(ID_CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        removed += conn.execute(
            &format!("DELETE FROM transactions WHERE id IN ({placeholders})"),
            params_from_iter(chunk.iter()),
        )?;
    }
    Ok(removed)
}

/// Empty every live table, children first.
pub fn clear_all(conn: &Connection) -> AppResult<()> {
    conn.execute_batch(
        "DELETE FROM transactions;
         DELETE FROM budgets;
         DELETE FROM accounts;
         DELETE FROM categories;",
    )?;
    Ok(())
}

pub fn count_rows(conn: &Connection, table: &str) -> AppResult<i64> {
    let count = conn.query_row(&format!("SELECT count(*) FROM {table}"), [], |row| {
        row.get(0)
    })?;
    Ok(count)
}
