use std::path::Path;
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::store::open_keyed;
use crate::config::{with_suffix, Passphrase};

const EXPECTED_JOURNAL_MODE: &str = "wal";
pub const EXPECTED_PAGE_SIZE: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptionKind {
    /// Missing header, wrong key, garbled first page or a torn file length.
    Unreadable,
    IntegrityFailed,
    ForeignKeyViolations,
    /// A previous repair stopped before it finished.
    InterruptedRepair,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    None,
    SoftRepair,
    ForceRebuild,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeCheck {
    pub name: String,
    pub passed: bool,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offender {
    pub table: String,
    pub rowid: i64,
    pub message: String,
}

/// Transient probe result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorruptionReport {
    pub corrupted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<CorruptionKind>,
    pub checks: Vec<ProbeCheck>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub offenders: Vec<Offender>,
    pub schema_hash: String,
    pub app_version: String,
    pub generated_at: String,
}

impl CorruptionReport {
    fn new(checks: Vec<ProbeCheck>, offenders: Vec<Offender>, schema_hash: String) -> Self {
        let kind = classify(&checks);
        Self {
            corrupted: kind.is_some(),
            kind,
            checks,
            offenders,
            schema_hash,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    /// Flag the report as an interrupted repair, regardless of the checks.
    pub(crate) fn mark_interrupted(&mut self) {
        self.corrupted = true;
        self.kind = Some(CorruptionKind::InterruptedRepair);
        self.checks.push(ProbeCheck {
            name: "status_marker".to_string(),
            passed: false,
            duration_ms: 0,
            details: Some("previous repair did not complete".to_string()),
        });
    }

    pub fn recommended_action(&self) -> RecoveryAction {
        match self.kind {
            None => RecoveryAction::None,
            Some(CorruptionKind::Unreadable) => RecoveryAction::ForceRebuild,
            Some(_) => RecoveryAction::SoftRepair,
        }
    }

    pub fn failed_checks(&self) -> impl Iterator<Item = &ProbeCheck> {
        self.checks.iter().filter(|check| !check.passed)
    }
}

const UNREADABLE_CHECKS: [&str; 3] = ["file_header", "open", "page_count"];
const INTEGRITY_CHECKS: [&str; 3] = ["quick_check", "integrity_check", "storage_sanity"];

fn classify(checks: &[ProbeCheck]) -> Option<CorruptionKind> {
    let failed = |names: &[&str]| {
        checks
            .iter()
            .any(|check| !check.passed && names.contains(&check.name.as_str()))
    };
    if failed(&UNREADABLE_CHECKS) {
        Some(CorruptionKind::Unreadable)
    } else if failed(&INTEGRITY_CHECKS) {
        Some(CorruptionKind::IntegrityFailed)
    } else if failed(&["foreign_key_check"]) {
        Some(CorruptionKind::ForeignKeyViolations)
    } else {
        None
    }
}

fn timed<F>(name: &str, f: F) -> ProbeCheck
where
    F: FnOnce() -> Result<(), String>,
{
    let start = Instant::now();
    let outcome = f();
    ProbeCheck {
        name: name.to_string(),
        passed: outcome.is_ok(),
        duration_ms: start.elapsed().as_millis() as u64,
        details: outcome.err(),
    }
}

/// Probe the store at `path`. Never fails: every problem lands in the report.
///
/// A missing file is healthy; it will be created on first open.
pub fn probe_database(path: &Path, passphrase: &Passphrase) -> CorruptionReport {
    let mut checks = Vec::new();

    let header = timed("file_header", || match std::fs::metadata(path) {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(format!("metadata failed: {err}")),
        Ok(meta) if meta.len() == 0 => Err("file is empty".to_string()),
        Ok(meta) if meta.len() % EXPECTED_PAGE_SIZE != 0 => Err(format!(
            "page count mismatch: length {} is not a multiple of {EXPECTED_PAGE_SIZE}",
            meta.len()
        )),
        Ok(_) => Ok(()),
    });
    let header_ok = header.passed;
    checks.push(header);

    if !path.exists() {
        if let Some(check) = checks.last_mut() {
            check.details = Some("absent; will be created".to_string());
        }
        return CorruptionReport::new(checks, Vec::new(), String::new());
    }
    if !header_ok {
        return CorruptionReport::new(checks, Vec::new(), String::new());
    }

    let mut conn: Option<Connection> = None;
    checks.push(timed("open", || {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        open_keyed(path, passphrase, flags)
            .map(|opened| conn = Some(opened))
            .map_err(|err| format!("open failed: {err}"))
    }));
    let Some(conn) = conn else {
        return CorruptionReport::new(checks, Vec::new(), String::new());
    };

    checks.push(timed("quick_check", || pragma_ok(&conn, "PRAGMA quick_check;")));
    checks.push(timed("integrity_check", || {
        pragma_ok(&conn, "PRAGMA integrity_check(1);")
    }));

    let mut offenders = Vec::new();
    checks.push(timed("foreign_key_check", || {
        offenders = foreign_key_offenders(&conn).map_err(|err| format!("foreign_key_check failed: {err}"))?;
        if offenders.is_empty() {
            Ok(())
        } else {
            Err(format!("{} foreign key violation(s)", offenders.len()))
        }
    }));

    checks.push(timed("page_count", || page_count_consistent(&conn, path)));
    checks.push(timed("storage_sanity", || storage_sanity(&conn)));

    let schema_hash = compute_schema_hash(&conn).unwrap_or_default();
    drop(conn);
    CorruptionReport::new(checks, offenders, schema_hash)
}

fn pragma_ok(conn: &Connection, sql: &str) -> Result<(), String> {
    let mut stmt = conn.prepare(sql).map_err(|err| err.to_string())?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|err| err.to_string())?;
    let mut problems = Vec::new();
    for row in rows {
        let line = row.map_err(|err| err.to_string())?;
        if !line.eq_ignore_ascii_case("ok") {
            problems.push(line);
        }
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems.join("; "))
    }
}

pub(crate) fn foreign_key_offenders(conn: &Connection) -> rusqlite::Result<Vec<Offender>> {
    let mut stmt = conn.prepare("PRAGMA foreign_key_check;")?;
    let rows = stmt.query_map([], |row| {
        let table: String = row.get(0)?;
        let rowid: Option<i64> = row.get(1)?;
        let parent: String = row.get(2)?;
        let fkid: i64 = row.get(3)?;
        Ok(Offender {
            table,
            rowid: rowid.unwrap_or(-1),
            message: format!("missing parent '{parent}', constraint #{fkid}"),
        })
    })?;
    rows.collect()
}

/// With an empty write-ahead log the main file must hold exactly
/// `page_count` pages.
fn page_count_consistent(conn: &Connection, path: &Path) -> Result<(), String> {
    let wal_len = std::fs::metadata(with_suffix(path, "-wal"))
        .map(|meta| meta.len())
        .unwrap_or(0);
    if wal_len > 0 {
        return Ok(());
    }
    let page_count = pragma_u64(conn, "page_count")?;
    let page_size = pragma_u64(conn, "page_size")?;
    let file_len = std::fs::metadata(path)
        .map(|meta| meta.len())
        .map_err(|err| format!("metadata failed: {err}"))?;
    let expected = page_count * page_size;
    if expected == file_len {
        Ok(())
    } else {
        Err(format!(
            "page count mismatch: {page_count} pages of {page_size} bytes, file is {file_len} bytes"
        ))
    }
}

/// SQLCipher answers some pragmas (`page_size` among them) with a text
/// column, so accept either storage class.
fn pragma_u64(conn: &Connection, pragma: &str) -> Result<u64, String> {
    let value: Value = conn
        .query_row(&format!("PRAGMA {pragma};"), [], |row| row.get(0))
        .map_err(|err| format!("{pragma} query failed: {err}"))?;
    match value {
        Value::Integer(n) if n >= 0 => Ok(n as u64),
        Value::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| format!("{pragma} returned non-numeric value {text:?}")),
        other => Err(format!("{pragma} returned unexpected value {other:?}")),
    }
}

fn storage_sanity(conn: &Connection) -> Result<(), String> {
    let mode: String = conn
        .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
        .map_err(|err| format!("journal_mode query failed: {err}"))?;
    if !mode.eq_ignore_ascii_case(EXPECTED_JOURNAL_MODE) {
        tracing::warn!(
            target: crate::logging::LOG_TARGET,
            event = "journal_mode_unexpected",
            mode = %mode
        );
    }
    let size = pragma_u64(conn, "page_size")?;
    if size != EXPECTED_PAGE_SIZE {
        return Err(format!(
            "page_size mismatch: expected {EXPECTED_PAGE_SIZE}, got {size}"
        ));
    }
    Ok(())
}

pub(crate) fn compute_schema_hash(conn: &Connection) -> rusqlite::Result<String> {
    let mut stmt = conn.prepare(
        "SELECT type, name, COALESCE(sql, '') FROM sqlite_master \
         WHERE name NOT LIKE 'sqlite_%' ORDER BY type, name",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(format!(
            "{}|{}|{}",
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?
        ))
    })?;
    let mut hasher = Sha256::new();
    for row in rows {
        hasher.update(row?.as_bytes());
        hasher.update(b"\n");
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::StoreSchema;
    use crate::db::store::EncryptedStore;
    use tempfile::tempdir;

    fn key() -> Passphrase {
        Passphrase::new("probe-key")
    }

    fn make_store(path: &Path) {
        let store = EncryptedStore::open("live", path, &key(), StoreSchema::Live).unwrap();
        store
            .run_in_tx(|tx| {
                tx.execute(
                    "INSERT INTO accounts (id, name, type) VALUES (1, 'Wallet', 'CASH')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();
        store.close().unwrap();
    }

    #[test]
    fn missing_file_is_healthy() {
        let dir = tempdir().unwrap();
        let report = probe_database(&dir.path().join("absent.sqlite3"), &key());
        assert!(!report.corrupted);
        assert_eq!(report.recommended_action(), RecoveryAction::None);
    }

    #[test]
    fn page_size_reads_as_a_number_on_a_keyed_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("live.sqlite3");
        make_store(&path);
        let conn = open_keyed(&path, &key(), OpenFlags::SQLITE_OPEN_READ_ONLY).unwrap();
        assert_eq!(pragma_u64(&conn, "page_size").unwrap(), EXPECTED_PAGE_SIZE);
        assert!(pragma_u64(&conn, "page_count").unwrap() > 0);
        assert!(pragma_u64(&conn, "journal_mode").is_err());
    }

    #[test]
    fn healthy_store_passes_every_check() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("live.sqlite3");
        make_store(&path);
        let report = probe_database(&path, &key());
        assert!(!report.corrupted, "{report:?}");
        assert!(report.failed_checks().next().is_none());
        assert_eq!(report.schema_hash.len(), 64);
    }

    #[test]
    fn wrong_key_is_unreadable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("live.sqlite3");
        make_store(&path);
        let report = probe_database(&path, &Passphrase::new("other"));
        assert!(report.corrupted);
        assert_eq!(report.kind, Some(CorruptionKind::Unreadable));
        assert_eq!(report.recommended_action(), RecoveryAction::ForceRebuild);
    }

    #[test]
    fn torn_length_is_unreadable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("live.sqlite3");
        make_store(&path);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 100);
        std::fs::write(&path, bytes).unwrap();

        let report = probe_database(&path, &key());
        assert_eq!(report.kind, Some(CorruptionKind::Unreadable));
        let header = &report.checks[0];
        assert!(header.details.as_deref().unwrap().contains("page count mismatch"));
    }

    #[test]
    fn orphan_reference_is_soft_repairable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("live.sqlite3");
        make_store(&path);
        {
            let store = EncryptedStore::open("live", &path, &key(), StoreSchema::Live).unwrap();
            store
                .with_conn(|conn| {
                    conn.execute_batch(
                        "PRAGMA foreign_keys = OFF;
                         INSERT INTO transactions (id, amount, category_id, account_id, date)
                         VALUES (1, 5.0, 42, 1, 0);
                         PRAGMA foreign_keys = ON;",
                    )?;
                    Ok(())
                })
                .unwrap();
            store.close().unwrap();
        }

        let report = probe_database(&path, &key());
        assert_eq!(report.kind, Some(CorruptionKind::ForeignKeyViolations));
        assert_eq!(report.offenders.len(), 1);
        assert_eq!(report.offenders[0].table, "transactions");
        assert_eq!(report.recommended_action(), RecoveryAction::SoftRepair);
    }
}
