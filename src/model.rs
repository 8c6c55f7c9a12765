//! Ledger entities shared by the live store, archive shards and snapshots.
//!
//! Field names serialize in camelCase and all dates are epoch milliseconds.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CategoryType {
    Expense,
    Income,
}

impl CategoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CategoryType::Expense => "EXPENSE",
            CategoryType::Income => "INCOME",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "EXPENSE" => Some(CategoryType::Expense),
            "INCOME" => Some(CategoryType::Income),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: CategoryType,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub color: i64,
    #[serde(default)]
    pub is_custom: bool,
    #[serde(default)]
    pub sort_order: i64,
    #[serde(default)]
    pub parent_id: Option<i64>,
    #[serde(default)]
    pub level: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: i64,
    pub name: String,
    /// Free-form account kind such as `CASH`, `DEBIT_CARD` or `CREDIT_CARD`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub balance: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_exchange_rate")]
    pub exchange_rate: f64,
    #[serde(default)]
    pub color: i64,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "default_true")]
    pub include_in_total: bool,
    #[serde(default)]
    pub credit_limit: f64,
    #[serde(default)]
    pub billing_day: i64,
    #[serde(default)]
    pub due_day: i64,
    #[serde(default)]
    pub display_order: i64,
}

/// A ledger entry. `date` is the archival timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: i64,
    pub amount: f64,
    #[serde(default)]
    pub category_id: Option<i64>,
    pub account_id: i64,
    pub date: i64,
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub is_income: bool,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub image_uri: Option<String>,
    #[serde(default)]
    pub to_account_id: Option<i64>,
    #[serde(default)]
    pub created_by: i64,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default)]
    pub is_private: bool,
}

impl Transaction {
    /// Account ids this entry points at, including the transfer target.
    pub fn account_refs(&self) -> impl Iterator<Item = i64> {
        std::iter::once(self.account_id).chain(self.to_account_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Budget {
    pub id: i64,
    pub name: String,
    pub amount: f64,
    pub start_date: i64,
    pub end_date: i64,
    #[serde(default = "default_budget_period")]
    pub period: String,
    #[serde(default)]
    pub category_ids: Vec<i64>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub notify_enabled: bool,
    #[serde(default = "default_notify_threshold")]
    pub notify_threshold: i64,
}

fn default_currency() -> String {
    "CNY".to_string()
}

fn default_exchange_rate() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_budget_period() -> String {
    "MONTHLY".to_string()
}

fn default_notify_threshold() -> i64 {
    80
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_serializes_camel_case_with_ms_dates() {
        let tx = Transaction {
            id: 7,
            amount: 12.5,
            category_id: Some(3),
            account_id: 1,
            date: 1_700_000_000_000,
            note: "lunch".into(),
            is_income: false,
            location: String::new(),
            image_uri: None,
            to_account_id: Some(2),
            created_by: 0,
            created_at: 1_700_000_000_000,
            updated_at: 1_700_000_000_000,
            is_private: false,
        };
        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["categoryId"], 3);
        assert_eq!(json["toAccountId"], 2);
        assert_eq!(json["date"], 1_700_000_000_000_i64);
        assert_eq!(tx.account_refs().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn category_type_uses_upper_case_names() {
        let json = r#"{"id":1,"name":"Food","type":"EXPENSE"}"#;
        let category: Category = serde_json::from_str(json).unwrap();
        assert_eq!(category.kind, CategoryType::Expense);
        assert_eq!(category.parent_id, None);
        assert_eq!(CategoryType::parse("INCOME"), Some(CategoryType::Income));
        assert_eq!(CategoryType::parse("other"), None);
    }

    #[test]
    fn account_defaults_fill_missing_fields() {
        let json = r#"{"id":1,"name":"Wallet","type":"CASH"}"#;
        let account: Account = serde_json::from_str(json).unwrap();
        assert_eq!(account.currency, "CNY");
        assert_eq!(account.exchange_rate, 1.0);
        assert!(account.include_in_total);
    }
}
