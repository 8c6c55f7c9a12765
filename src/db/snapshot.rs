//! Portable JSON snapshot document.

use std::collections::BTreeSet;
use std::path::Path;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::codes;
use crate::model::{Account, Budget, Category, Transaction};
use crate::{repo, AppError, AppResult};

/// Format written by this build. Documents without the field are version 1.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

fn legacy_format_version() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    /// Epoch millis at export.
    pub export_time: i64,
    #[serde(default)]
    pub app_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDocument {
    #[serde(default = "legacy_format_version")]
    pub format_version: u32,
    pub metadata: SnapshotMetadata,
    pub categories: Vec<Category>,
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub budgets: Vec<Budget>,
    pub transactions: Vec<Transaction>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotCounts {
    pub categories: usize,
    pub accounts: usize,
    pub budgets: usize,
    pub transactions: usize,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot could not be read: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot is not valid JSON for this format: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("snapshot format version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
}

impl From<SnapshotError> for AppError {
    fn from(error: SnapshotError) -> Self {
        let message = error.to_string();
        match error {
            SnapshotError::Io(err) => AppError::new(codes::SERIALIZATION_FAILED, message)
                .with_cause(AppError::from(err)),
            SnapshotError::Malformed(err) => AppError::new(codes::SERIALIZATION_FAILED, message)
                .with_cause(AppError::from(err)),
            SnapshotError::UnsupportedVersion { found, supported } => {
                AppError::new(codes::UNSUPPORTED_VERSION, message)
                    .with_context("found", found.to_string())
                    .with_context("supported", supported.to_string())
            }
        }
    }
}

impl SnapshotDocument {
    /// Export every live table through `conn`.
    pub fn capture(conn: &Connection, export_time: i64) -> AppResult<Self> {
        Ok(Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            metadata: SnapshotMetadata {
                export_time,
                app_version: env!("CARGO_PKG_VERSION").to_string(),
            },
            categories: repo::list_categories(conn)?,
            accounts: repo::list_accounts(conn)?,
            budgets: repo::list_budgets(conn)?,
            transactions: repo::list_transactions(conn)?,
        })
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let doc: SnapshotDocument = serde_json::from_slice(bytes)?;
        if doc.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(SnapshotError::UnsupportedVersion {
                found: doc.format_version,
                supported: SNAPSHOT_FORMAT_VERSION,
            });
        }
        Ok(doc)
    }

    pub fn read(path: &Path) -> Result<Self, SnapshotError> {
        let bytes = std::fs::read(path)?;
        Self::parse(&bytes)
    }

    pub fn to_bytes(&self) -> AppResult<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|err| {
            AppError::new(codes::SERIALIZATION_FAILED, "Failed to serialize snapshot")
                .with_cause(AppError::from(err))
        })
    }

    pub fn counts(&self) -> SnapshotCounts {
        SnapshotCounts {
            categories: self.categories.len(),
            accounts: self.accounts.len(),
            budgets: self.budgets.len(),
            transactions: self.transactions.len(),
        }
    }

    /// References that point at entities missing from this document.
    pub fn dangling_references(&self) -> Vec<String> {
        let categories: BTreeSet<i64> = self.categories.iter().map(|c| c.id).collect();
        let accounts: BTreeSet<i64> = self.accounts.iter().map(|a| a.id).collect();
        let mut out = Vec::new();
        for tx in &self.transactions {
            if let Some(category) = tx.category_id {
                if !categories.contains(&category) {
                    out.push(format!("transaction {} -> category {category}", tx.id));
                }
            }
            for account in tx.account_refs() {
                if !accounts.contains(&account) {
                    out.push(format!("transaction {} -> account {account}", tx.id));
                }
            }
        }
        out
    }

    /// Insert every entity through `conn`, parents before children.
    pub fn insert_into(&self, conn: &Connection) -> AppResult<()> {
        for category in &self.categories {
            repo::upsert_category(conn, category)?;
        }
        for account in &self.accounts {
            repo::upsert_account(conn, account)?;
        }
        for budget in &self.budgets {
            repo::insert_budget(conn, budget)?;
        }
        for tx in &self.transactions {
            repo::upsert_transaction(conn, tx)?;
        }
        Ok(())
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
