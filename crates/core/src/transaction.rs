use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::entity::{AccountId, CategoryId, RecipientId, TagId, TransactionId};
use super::money::Money;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Standard,
    Transfer,
}

impl TransactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionKind::Standard => "standard",
            TransactionKind::Transfer => "transfer",
        }
    }
}

impl std::str::FromStr for TransactionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(TransactionKind::Standard),
            "transfer" => Ok(TransactionKind::Transfer),
            _ => Err(format!("unknown transaction kind '{s}'")),
        }
    }
}

/// A persisted booking on one account. A transfer between two own accounts
/// is stored as two `Transfer` legs cross-linked via `counterpart_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub account_id: AccountId,
    pub date: NaiveDate,
    pub value_date: NaiveDate,
    pub amount: Money,
    pub note: String,
    pub recipient_id: Option<RecipientId>,
    pub category_id: Option<CategoryId>,
    pub tag_ids: Vec<TagId>,
    pub kind: TransactionKind,
    pub counterpart_id: Option<TransactionId>,
}

/// The insert shape: everything the store needs to create one booking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTransaction {
    pub account_id: AccountId,
    pub date: NaiveDate,
    pub value_date: NaiveDate,
    pub amount: Money,
    pub note: String,
    pub recipient_id: Option<RecipientId>,
    pub category_id: Option<CategoryId>,
    pub tag_ids: Vec<TagId>,
    pub kind: TransactionKind,
}

impl NewTransaction {
    pub fn standard(account_id: AccountId, date: NaiveDate, amount: Money) -> Self {
        NewTransaction {
            account_id,
            date,
            value_date: date,
            amount,
            note: String::new(),
            recipient_id: None,
            category_id: None,
            tag_ids: Vec::new(),
            kind: TransactionKind::Standard,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn standard_constructor_defaults() {
        let tx = NewTransaction::standard(AccountId(1), date(2024, 1, 15), Money::from_cents(-5000));
        assert_eq!(tx.value_date, tx.date);
        assert_eq!(tx.kind, TransactionKind::Standard);
        assert!(tx.recipient_id.is_none());
        assert!(tx.tag_ids.is_empty());
    }

    #[test]
    fn kind_serde_round_trip() {
        let json = serde_json::to_string(&TransactionKind::Transfer).unwrap();
        assert_eq!(json, "\"transfer\"");
        let back: TransactionKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, TransactionKind::Transfer);
    }
}
