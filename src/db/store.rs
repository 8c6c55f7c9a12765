use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};
use zeroize::Zeroize;

use super::schema::StoreSchema;
use crate::config::Passphrase;
use crate::error::codes;
use crate::logging::LOG_TARGET;
use crate::{AppError, AppResult};

const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// A named, passphrase-protected SQLCipher database.
///
/// One connection serves as the single writer. All access goes through the
/// internal mutex, so a store can be shared behind an `Arc` between threads.
/// Closures passed to [`run_in_tx`](Self::run_in_tx) or
/// [`with_conn`](Self::with_conn) must not call back into the same store.
pub struct EncryptedStore {
    name: String,
    path: PathBuf,
    schema: StoreSchema,
    conn: Mutex<Option<Connection>>,
}

impl std::fmt::Debug for EncryptedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedStore")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("schema", &self.schema)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl EncryptedStore {
    /// Open or create the store at `path`, applying `schema`.
    ///
    /// A wrong passphrase or an unreadable file yields `STORE/OPEN_FAILED`.
    pub fn open(
        name: impl Into<String>,
        path: &Path,
        passphrase: &Passphrase,
        schema: StoreSchema,
    ) -> AppResult<Self> {
        let name = name.into();
        let conn = open_keyed(path, passphrase, OpenFlags::default())
            .map_err(|err| open_failure(&name, path, err))?;

        configure_connection(&conn).map_err(|err| open_failure(&name, path, err))?;
        schema
            .apply(&conn)
            .map_err(|err| err.with_context("operation", "apply_schema"))?;
        restrict_permissions(path);
        log_effective_pragmas(&conn, &name);

        Ok(Self {
            name,
            path: path.to_path_buf(),
            schema,
            conn: Mutex::new(Some(conn)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema(&self) -> StoreSchema {
        self.schema
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn closed_error(&self) -> AppError {
        AppError::new(codes::STORE_CLOSED, "Store has been closed")
            .with_context("store", self.name.clone())
    }

    /// Run `f` inside one immediate transaction. `Ok` commits, `Err` rolls back.
    pub fn run_in_tx<R, F>(&self, f: F) -> AppResult<R>
    where
        F: FnOnce(&Transaction<'_>) -> AppResult<R>,
    {
        let mut guard = self.lock();
        let conn = guard.as_mut().ok_or_else(|| self.closed_error())?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| AppError::from(err).with_context("operation", "begin_tx"))?;
        tracing::debug!(target: LOG_TARGET, event = "db_tx_begin", store = %self.name);

        match f(&tx) {
            Ok(value) => {
                tx.commit()
                    .map_err(|err| AppError::from(err).with_context("operation", "commit_tx"))?;
                tracing::debug!(target: LOG_TARGET, event = "db_tx_commit", store = %self.name);
                Ok(value)
            }
            Err(err) => {
                if let Err(rb) = tx.rollback() {
                    tracing::error!(
                        target: LOG_TARGET,
                        event = "db_tx_rollback_failed",
                        store = %self.name,
                        error = %rb
                    );
                } else {
                    tracing::warn!(
                        target: LOG_TARGET,
                        event = "db_tx_rollback",
                        store = %self.name,
                        error = %err
                    );
                }
                Err(err)
            }
        }
    }

    /// Borrow the connection for reads outside a transaction.
    pub fn with_conn<R, F>(&self, f: F) -> AppResult<R>
    where
        F: FnOnce(&Connection) -> AppResult<R>,
    {
        let guard = self.lock();
        let conn = guard.as_ref().ok_or_else(|| self.closed_error())?;
        f(conn)
    }

    /// Reclaim free pages with `VACUUM`. Refuses to run inside a transaction.
    pub fn compact(&self) -> AppResult<()> {
        let guard = self.lock();
        let conn = guard.as_ref().ok_or_else(|| self.closed_error())?;
        if !conn.is_autocommit() {
            return Err(AppError::new(
                codes::STORE_COMPACT_IN_TX,
                "Compaction cannot run inside an open transaction",
            )
            .with_context("store", self.name.clone()));
        }

        let before = file_len(&self.path);
        conn.execute_batch("VACUUM;")
            .map_err(|err| AppError::from(err).with_context("operation", "vacuum"))?;
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
            .map_err(|err| AppError::from(err).with_context("operation", "wal_checkpoint"))?;
        tracing::info!(
            target: LOG_TARGET,
            event = "store_compacted",
            store = %self.name,
            bytes_before = before,
            bytes_after = file_len(&self.path)
        );
        Ok(())
    }

    /// Release the connection. Calling it again is a no-op.
    pub fn close(&self) -> AppResult<()> {
        let mut guard = self.lock();
        let Some(conn) = guard.take() else {
            return Ok(());
        };
        conn.close().map_err(|(_, err)| {
            AppError::from(err)
                .with_context("operation", "close_store")
                .with_context("store", self.name.clone())
        })?;
        tracing::info!(target: LOG_TARGET, event = "store_closed", store = %self.name);
        Ok(())
    }
}

impl Drop for EncryptedStore {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Open a raw connection, apply the key and prove it decrypts the header.
pub(crate) fn open_keyed(
    path: &Path,
    passphrase: &Passphrase,
    flags: OpenFlags,
) -> AppResult<Connection> {
    if passphrase.is_empty() {
        return Err(AppError::new(
            "STORE/EMPTY_PASSPHRASE",
            "Refusing to open a store without a passphrase",
        ));
    }

    let conn = Connection::open_with_flags(path, flags)?;
    let mut key_pragma = format!("PRAGMA key = '{}';", passphrase.expose().replace('\'', "''"));
    let keyed = conn.execute_batch(&key_pragma);
    key_pragma.zeroize();
    keyed?;

    conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| {
        row.get::<_, i64>(0)
    })?;
    Ok(conn)
}

pub(crate) fn configure_connection(conn: &Connection) -> AppResult<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        tracing::warn!(target: LOG_TARGET, event = "journal_mode_fallback", mode = %mode);
    }
    conn.execute_batch("PRAGMA secure_delete = ON;")?;
    Ok(())
}

fn open_failure(name: &str, path: &Path, cause: AppError) -> AppError {
    tracing::error!(
        target: LOG_TARGET,
        event = "store_open_failed",
        store = %name,
        path = %path.display(),
        error = %cause
    );
    AppError::new(codes::STORE_OPEN_FAILED, "Failed to open encrypted store")
        .with_context("store", name.to_string())
        .with_context("path", path.display().to_string())
        .with_cause(cause)
}

fn restrict_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }
    #[cfg(not(unix))]
    let _ = path;
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|meta| meta.len()).unwrap_or(0)
}

fn log_effective_pragmas(conn: &Connection, name: &str) {
    let cipher: String = conn
        .query_row("PRAGMA cipher_version;", [], |row| row.get(0))
        .unwrap_or_else(|_| String::from("unknown"));
    let journal: String = conn
        .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
        .unwrap_or_else(|_| String::from("unknown"));
    let fks: i64 = conn
        .query_row("PRAGMA foreign_keys;", [], |row| row.get(0))
        .unwrap_or(i64::MIN);
    let busy: i64 = conn
        .query_row("PRAGMA busy_timeout;", [], |row| row.get(0))
        .unwrap_or(i64::MIN);

    tracing::info!(
        target: LOG_TARGET,
        event = "store_open",
        store = %name,
        cipher_version = %cipher,
        journal_mode = %journal,
        foreign_keys = fks,
        busy_timeout_ms = busy
    );
}
