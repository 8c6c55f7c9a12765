use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;

use anyhow::Error as AnyhowError;
use rusqlite::{Error as SqliteError, ErrorCode};
use serde::{Deserialize, Serialize};
use serde_json::Error as SerdeJsonError;
use std::io::Error as IoError;

/// Error codes for the lifecycle failure taxonomy.
pub mod codes {
    /// Wrong passphrase or unreadable file. Triggers the recovery path.
    pub const STORE_OPEN_FAILED: &str = "STORE/OPEN_FAILED";
    pub const STORE_CLOSED: &str = "STORE/CLOSED";
    pub const STORE_COMPACT_IN_TX: &str = "STORE/COMPACT_IN_TX";
    pub const MIGRATION_FAILED: &str = "ARCHIVE/MIGRATION_FAILED";
    pub const SHARD_NOT_FOUND: &str = "ARCHIVE/SHARD_NOT_FOUND";
    pub const SERIALIZATION_FAILED: &str = "BACKUP/SERIALIZATION";
    pub const UNSUPPORTED_VERSION: &str = "BACKUP/UNSUPPORTED_VERSION";
    pub const RETENTION_CLEANUP_FAILED: &str = "BACKUP/RETENTION_CLEANUP";
    pub const INVALID_SNAPSHOT_PATH: &str = "BACKUP/INVALID_PATH";
    pub const LOW_DISK: &str = "BACKUP/LOW_DISK";
    pub const UNREPAIRABLE: &str = "RECOVERY/UNREPAIRABLE";
    pub const MISSING_PASSPHRASE: &str = "CONFIG/MISSING_PASSPHRASE";
}

/// A structured error carrying a machine readable code and the cause chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    /// Machine readable error code.
    pub code: String,
    /// Human friendly message.
    pub message: String,
    /// Arbitrary key/value pairs that provide additional context.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
    /// Optional nested cause that preserves the error chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<AppError>>,
}

pub type AppResult<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Default code used when an upstream error does not expose a specific code.
    pub const UNKNOWN_CODE: &'static str = "APP/UNKNOWN";
    /// Code used for errors created from free-form messages.
    pub const GENERIC_CODE: &'static str = "APP/GENERIC";

    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        AppError {
            code: code.into(),
            message: message.into(),
            context: HashMap::new(),
            cause: None,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    pub fn cause(&self) -> Option<&AppError> {
        self.cause.as_deref()
    }

    /// Adds a contextual key/value pair to the error.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Sets the nested cause for the error.
    pub fn with_cause(mut self, cause: impl Into<AppError>) -> Self {
        self.cause = Some(Box::new(cause.into()));
        self
    }

    /// True when this error means the store could not be opened at all.
    pub fn is_open_failure(&self) -> bool {
        self.code == codes::STORE_OPEN_FAILED
    }

    /// Walks the cause chain looking for the given code.
    pub fn has_code(&self, code: &str) -> bool {
        let mut current = Some(self);
        while let Some(err) = current {
            if err.code == code {
                return true;
            }
            current = err.cause();
        }
        false
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "[{}] {}", self.code, self.message)
        } else {
            write!(f, "[{}] {} ({:?})", self.code, self.message, self.context)
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

impl From<&str> for AppError {
    fn from(message: &str) -> Self {
        AppError::new(AppError::GENERIC_CODE, message)
    }
}

impl From<String> for AppError {
    fn from(message: String) -> Self {
        AppError::new(AppError::GENERIC_CODE, message)
    }
}

impl From<AnyhowError> for AppError {
    fn from(error: AnyhowError) -> Self {
        fn convert(err: &(dyn StdError + 'static)) -> AppError {
            if let Some(app) = err.downcast_ref::<AppError>() {
                return app.clone();
            }

            let mut root = AppError::new(AppError::UNKNOWN_CODE, err.to_string());
            if let Some(source) = err.source() {
                root.cause = Some(Box::new(convert(source)));
            }
            root
        }

        convert(error.as_ref())
    }
}

impl From<IoError> for AppError {
    fn from(error: IoError) -> Self {
        let code = format!("IO/{:?}", error.kind());
        let mut app_error = AppError::new(code, error.to_string());
        if let Some(os_code) = error.raw_os_error() {
            app_error = app_error.with_context("os_code", os_code.to_string());
        }
        app_error
    }
}

impl From<SerdeJsonError> for AppError {
    fn from(error: SerdeJsonError) -> Self {
        let code = if error.is_data() {
            "JSON/DATA"
        } else if error.is_syntax() {
            "JSON/SYNTAX"
        } else if error.is_eof() {
            "JSON/EOF"
        } else if error.is_io() {
            "JSON/IO"
        } else {
            "JSON/ERROR"
        };

        let mut app_error = AppError::new(code, error.to_string());
        let line = error.line();
        if line > 0 {
            app_error = app_error.with_context("line", line.to_string());
        }
        let column = error.column();
        if column > 0 {
            app_error = app_error.with_context("column", column.to_string());
        }
        app_error
    }
}

impl From<SqliteError> for AppError {
    fn from(error: SqliteError) -> Self {
        match &error {
            SqliteError::SqliteFailure(ffi, message) => {
                let code = match ffi.code {
                    ErrorCode::NotADatabase => "SQLITE/NOT_A_DATABASE".to_string(),
                    ErrorCode::DatabaseCorrupt => "SQLITE/CORRUPT".to_string(),
                    ErrorCode::DatabaseBusy => "SQLITE/BUSY".to_string(),
                    ErrorCode::ConstraintViolation => "SQLITE/CONSTRAINT".to_string(),
                    other => format!("SQLITE/{other:?}"),
                };
                let message = message.clone().unwrap_or_else(|| error.to_string());
                AppError::new(code, message)
                    .with_context("extended_code", ffi.extended_code.to_string())
            }
            SqliteError::QueryReturnedNoRows => {
                AppError::new("SQLITE/NO_ROWS", "Record not found")
            }
            SqliteError::InvalidColumnType(index, name, _) => {
                AppError::new("SQLITE/COLUMN_TYPE", error.to_string())
                    .with_context("column", name.clone())
                    .with_context("column_index", index.to_string())
            }
            _ => AppError::new("SQLITE/ERROR", error.to_string()),
        }
    }
}
