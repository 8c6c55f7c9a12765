use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use serde::Serialize;

use super::catalog::ArchiveCatalog;
use crate::config::{LedgerConfig, DEFAULT_ARCHIVE_INTERVAL_DAYS, DEFAULT_ARCHIVE_THRESHOLD_MONTHS};
use crate::db::{EncryptedStore, LiveStore};
use crate::error::codes;
use crate::logging::LOG_TARGET;
use crate::model::Transaction;
use crate::prefs::{PreferenceStore, LAST_ARCHIVE_RUN_KEY};
use crate::repo::{self, transaction_from_row, TRANSACTION_COLUMNS};
use crate::time::{months_before, PeriodKey};
use crate::{AppError, AppResult};

const DEFAULT_PAGE_SIZE: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchivePolicy {
    /// Entries older than this many months are moved out of the live store.
    pub threshold_months: u32,
    /// Minimum days between automatic passes.
    pub interval_days: u32,
}

impl Default for ArchivePolicy {
    fn default() -> Self {
        Self {
            threshold_months: DEFAULT_ARCHIVE_THRESHOLD_MONTHS,
            interval_days: DEFAULT_ARCHIVE_INTERVAL_DAYS,
        }
    }
}

impl From<&LedgerConfig> for ArchivePolicy {
    fn from(config: &LedgerConfig) -> Self {
        Self {
            threshold_months: config.archive_threshold_months,
            interval_days: config.archive_interval_days,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveResult {
    pub success: bool,
    pub archived_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<PeriodKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ArchiveResult {
    fn failed(period: PeriodKey, err: &AppError) -> Self {
        Self {
            success: false,
            archived_count: 0,
            period: Some(period),
            error: Some(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ArchivePass {
    /// The interval since the last completed pass has not elapsed.
    Skipped { last_run_ms: i64 },
    Completed(ArchiveResult),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Income,
    Expense,
}

/// Filters for reading a shard. Everything is optional.
#[derive(Debug, Clone, Default)]
pub struct ShardQuery {
    /// Inclusive lower bound on `date`, epoch millis.
    pub from_ms: Option<i64>,
    /// Exclusive upper bound on `date`, epoch millis.
    pub to_ms: Option<i64>,
    pub kind: Option<EntryKind>,
    pub category_id: Option<i64>,
    /// Matches the owning account or the transfer target.
    pub account_id: Option<i64>,
    pub note_contains: Option<String>,
    pub limit: Option<usize>,
    pub page_size: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardSummary {
    pub count: i64,
    pub total_amount: f64,
    pub income: f64,
    pub expense: f64,
}

/// Moves old ledger entries from the live store into per-year shards.
pub struct ArchiveManager {
    live: LiveStore,
    catalog: Arc<ArchiveCatalog>,
    prefs: Arc<dyn PreferenceStore>,
    policy: ArchivePolicy,
}

impl ArchiveManager {
    pub fn new(
        live: LiveStore,
        catalog: Arc<ArchiveCatalog>,
        prefs: Arc<dyn PreferenceStore>,
        policy: ArchivePolicy,
    ) -> Self {
        Self {
            live,
            catalog,
            prefs,
            policy,
        }
    }

    pub fn catalog(&self) -> &Arc<ArchiveCatalog> {
        &self.catalog
    }

    pub fn policy(&self) -> ArchivePolicy {
        self.policy
    }

    fn last_run_ms(&self) -> i64 {
        match self.prefs.get_i64(LAST_ARCHIVE_RUN_KEY) {
            Ok(value) => value.unwrap_or(0),
            Err(err) => {
                tracing::warn!(
                    target: LOG_TARGET,
                    event = "archive_last_run_unreadable",
                    error = %err
                );
                0
            }
        }
    }

    /// Due when no pass ever completed or the interval has elapsed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        let last = self.last_run_ms();
        if last <= 0 {
            return true;
        }
        let interval = Duration::days(i64::from(self.policy.interval_days)).num_milliseconds();
        now.timestamp_millis() - last > interval
    }

    pub fn check_and_archive(&self) -> ArchivePass {
        self.check_and_archive_at(Utc::now())
    }

    /// One automatic pass against the clock value `now`.
    pub fn check_and_archive_at(&self, now: DateTime<Utc>) -> ArchivePass {
        if !self.is_due(now) {
            let last_run_ms = self.last_run_ms();
            tracing::debug!(
                target: LOG_TARGET,
                event = "archive_pass_skipped",
                last_run_ms
            );
            return ArchivePass::Skipped { last_run_ms };
        }

        let threshold = months_before(now, self.policy.threshold_months);
        let result = self.archive_before(threshold);
        if result.success {
            if let Err(err) = self
                .prefs
                .set_i64(LAST_ARCHIVE_RUN_KEY, now.timestamp_millis())
            {
                tracing::warn!(
                    target: LOG_TARGET,
                    event = "archive_last_run_write_failed",
                    error = %err
                );
            }
        }
        ArchivePass::Completed(result)
    }

    /// Move every entry dated before `threshold` into the shard of the
    /// period containing `threshold`. All or nothing.
    pub fn archive_before(&self, threshold: DateTime<Utc>) -> ArchiveResult {
        let period = PeriodKey::containing_date(threshold);
        let archived = match self.migrate(threshold.timestamp_millis(), period) {
            Ok(count) => count,
            Err(err) => {
                tracing::error!(
                    target: LOG_TARGET,
                    event = "archive_failed",
                    period = %period,
                    code = %err.code(),
                    error = %err
                );
                return ArchiveResult::failed(period, &err);
            }
        };

        if archived == 0 {
            tracing::info!(target: LOG_TARGET, event = "archive_nothing_to_move");
            return ArchiveResult {
                success: true,
                archived_count: 0,
                period: None,
                error: None,
            };
        }

        tracing::info!(
            target: LOG_TARGET,
            event = "archive_migrated",
            period = %period,
            archived = archived
        );
        let compacted = self.live.get().and_then(|store| store.compact());
        if let Err(err) = compacted {
            tracing::warn!(target: LOG_TARGET, event = "compact_failed", error = %err);
        }
        ArchiveResult {
            success: true,
            archived_count: archived,
            period: Some(period),
            error: None,
        }
    }

    fn migrate(&self, threshold_ms: i64, period: PeriodKey) -> AppResult<usize> {
        let live = self.live.get()?;
        live.run_in_tx(|tx| {
            let records = repo::transactions_before(tx, threshold_ms)?;
            if records.is_empty() {
                return Ok(0);
            }

            let category_ids: BTreeSet<i64> =
                records.iter().filter_map(|record| record.category_id).collect();
            let account_ids: BTreeSet<i64> =
                records.iter().flat_map(Transaction::account_refs).collect();
            let categories = repo::categories_by_ids(tx, &category_ids)?;
            let accounts = repo::accounts_by_ids(tx, &account_ids)?;
            let ids: Vec<i64> = records.iter().map(|record| record.id).collect();

            let shard = self.catalog.shard_for(period)?;
            // The live delete runs inside the shard transaction so a failure
            // there rolls back the shard writes too.
            shard.run_in_tx(|shard_tx| {
                for category in &categories {
                    repo::upsert_category(shard_tx, category)?;
                }
                for account in &accounts {
                    repo::upsert_account(shard_tx, account)?;
                }
                for record in &records {
                    repo::upsert_transaction(shard_tx, record)?;
                }
                let removed = repo::delete_transactions_by_ids(tx, &ids)?;
                if removed != ids.len() {
                    return Err(AppError::new(
                        "ARCHIVE/DELETE_MISMATCH",
                        "Live store removed a different number of entries than were copied",
                    )
                    .with_context("copied", ids.len().to_string())
                    .with_context("removed", removed.to_string()));
                }
                Ok(removed)
            })
        })
        .map_err(|err| {
            AppError::new(codes::MIGRATION_FAILED, "Archiving pass was rolled back")
                .with_context("period", period.to_string())
                .with_cause(err)
        })
    }

    /// Periods with a shard on disk, oldest first.
    pub fn list_available_periods(&self) -> AppResult<Vec<PeriodKey>> {
        let mut periods: Vec<PeriodKey> = self
            .catalog
            .list_shards()?
            .into_iter()
            .map(|shard| shard.period)
            .collect();
        periods.sort();
        Ok(periods)
    }

    /// Lazy, newest-first reader over one shard. Re-opens the shard if needed.
    pub fn query_shard(&self, period: PeriodKey, query: ShardQuery) -> AppResult<ShardCursor> {
        let store = self.catalog.open_existing(period)?;
        Ok(ShardCursor::new(store, query))
    }

    pub fn shard_summary(&self, period: PeriodKey) -> AppResult<ShardSummary> {
        let store = self.catalog.open_existing(period)?;
        store.with_conn(|conn| {
            let summary = conn.query_row(
                "SELECT count(*),
                        COALESCE(SUM(amount), 0),
                        COALESCE(SUM(CASE WHEN is_income = 1 THEN amount ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN is_income = 0 THEN amount ELSE 0 END), 0)
                 FROM transactions",
                [],
                |row| {
                    Ok(ShardSummary {
                        count: row.get(0)?,
                        total_amount: row.get(1)?,
                        income: row.get(2)?,
                        expense: row.get(3)?,
                    })
                },
            )?;
            Ok(summary)
        })
    }

    pub fn delete_shard(&self, period: PeriodKey) -> AppResult<bool> {
        self.catalog.delete_shard(period)
    }
}

/// Pages through a shard by `(date, id)` descending, one query per page.
pub struct ShardCursor {
    store: Arc<EncryptedStore>,
    query: ShardQuery,
    after: Option<(i64, i64)>,
    buffer: VecDeque<Transaction>,
    yielded: usize,
    exhausted: bool,
}

impl ShardCursor {
    fn new(store: Arc<EncryptedStore>, query: ShardQuery) -> Self {
        Self {
            store,
            query,
            after: None,
            buffer: VecDeque::new(),
            yielded: 0,
            exhausted: false,
        }
    }

    fn page_size(&self) -> usize {
        let size = self.query.page_size.unwrap_or(DEFAULT_PAGE_SIZE).max(1);
        match self.query.limit {
            Some(limit) => size.min(limit.saturating_sub(self.yielded).max(1)),
            None => size,
        }
    }

    fn fetch_page(&mut self) -> AppResult<()> {
        let mut clauses = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        if let Some(from) = self.query.from_ms {
            clauses.push("date >= ?".to_string());
            values.push(Value::Integer(from));
        }
        if let Some(to) = self.query.to_ms {
            clauses.push("date < ?".to_string());
            values.push(Value::Integer(to));
        }
        match self.query.kind {
            Some(EntryKind::Income) => clauses.push("is_income = 1".to_string()),
            Some(EntryKind::Expense) => clauses.push("is_income = 0".to_string()),
            None => {}
        }
        if let Some(category) = self.query.category_id {
            clauses.push("category_id = ?".to_string());
            values.push(Value::Integer(category));
        }
        if let Some(account) = self.query.account_id {
            clauses.push("(account_id = ? OR to_account_id = ?)".to_string());
            values.push(Value::Integer(account));
            values.push(Value::Integer(account));
        }
        if let Some(needle) = self.query.note_contains.as_deref().filter(|n| !n.is_empty()) {
            clauses.push("instr(lower(note), lower(?)) > 0".to_string());
            values.push(Value::Text(needle.to_string()));
        }
        if let Some((date, id)) = self.after {
            clauses.push("(date < ? OR (date = ? AND id < ?))".to_string());
            values.push(Value::Integer(date));
            values.push(Value::Integer(date));
            values.push(Value::Integer(id));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions {where_sql} \
             ORDER BY date DESC, id DESC LIMIT {}",
            self.page_size()
        );

        let page = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values.iter()), transaction_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(AppError::from)
        })?;

        if page.len() < self.page_size() {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.after = Some((last.date, last.id));
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for ShardCursor {
    type Item = AppResult<Transaction>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.query.limit.is_some_and(|limit| self.yielded >= limit) {
            return None;
        }
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(err) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(err));
            }
        }
        let record = self.buffer.pop_front()?;
        self.yielded += 1;
        Some(Ok(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Passphrase;
    use crate::prefs::MemoryPreferenceStore;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn manager(dir: &std::path::Path) -> ArchiveManager {
        let live = LiveStore::new(dir.join("ledgerkeep.sqlite3"), Passphrase::new("live"));
        let catalog = Arc::new(ArchiveCatalog::new(
            dir.join("archives"),
            "archive",
            Passphrase::new("shards"),
        ));
        ArchiveManager::new(
            live,
            catalog,
            Arc::new(MemoryPreferenceStore::new()),
            ArchivePolicy::default(),
        )
    }

    #[test]
    fn due_when_never_run_then_waits_for_interval() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path());
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        assert!(manager.is_due(now));

        assert!(matches!(
            manager.check_and_archive_at(now),
            ArchivePass::Completed(ArchiveResult { success: true, archived_count: 0, .. })
        ));
        assert!(!manager.is_due(now + Duration::days(90)));
        assert!(matches!(
            manager.check_and_archive_at(now + Duration::days(30)),
            ArchivePass::Skipped { .. }
        ));
        assert!(manager.is_due(now + Duration::days(91)));
    }

    #[test]
    fn empty_pass_opens_no_shard() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path());
        let result = manager.archive_before(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap());
        assert!(result.success);
        assert_eq!(result.archived_count, 0);
        assert_eq!(result.period, None);
        assert!(manager.list_available_periods().unwrap().is_empty());
        assert!(!dir.path().join("archives").exists());
    }

    #[test]
    fn query_on_missing_period_is_not_found() {
        let dir = tempdir().unwrap();
        let err = manager(dir.path())
            .query_shard(PeriodKey::new(2001), ShardQuery::default())
            .err()
            .expect("missing shard");
        assert_eq!(err.code(), codes::SHARD_NOT_FOUND);
    }
}
