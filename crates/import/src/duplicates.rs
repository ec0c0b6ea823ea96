use chrono::NaiveDate;

use collatio_core::{AccountId, Money, Transaction, TransactionId, TransactionKind};

use crate::dialect::DateFormat;
use crate::mapper::MappedColumns;
use crate::parser::{DuplicateFlag, DuplicateKind, ImportRow};
use crate::similarity::similarity;

/// A persisted transaction reduced to the fields duplicate detection looks
/// at, with the recipient name already resolved.
#[derive(Debug, Clone)]
pub struct ExistingTransaction {
    pub id: TransactionId,
    pub account_id: AccountId,
    pub date: NaiveDate,
    pub amount: Money,
    pub kind: TransactionKind,
    pub recipient_name: Option<String>,
}

impl ExistingTransaction {
    pub fn from_transaction(tx: &Transaction, recipient_name: Option<String>) -> Self {
        ExistingTransaction {
            id: tx.id,
            account_id: tx.account_id,
            date: tx.date,
            amount: tx.amount,
            kind: tx.kind,
            recipient_name,
        }
    }
}

/// Flags rows that probably duplicate persisted transactions. The text
/// similarity floor is deliberately far looser than the entity-matching
/// thresholds: duplicate detection wants to be permissive.
#[derive(Debug, Clone, Copy)]
pub struct DuplicateDetector {
    pub date_window_days: i64,
    pub amount_tolerance: Money,
    pub text_similarity_floor: f64,
}

impl Default for DuplicateDetector {
    fn default() -> Self {
        DuplicateDetector {
            date_window_days: 1,
            amount_tolerance: Money::from_cents(1),
            text_similarity_floor: 0.3,
        }
    }
}

const TRANSFER_CONFIDENCE: f64 = 0.95;
const STANDARD_CONFIDENCE: f64 = 0.8;

impl DuplicateDetector {
    /// Runs the duplicate pass over every selected row. Requires bound
    /// date and amount columns; rows whose date or amount does not parse
    /// are ineligible for import and skipped here too.
    pub fn flag_rows(
        &self,
        rows: &mut [ImportRow],
        cols: &MappedColumns,
        date_format: DateFormat,
        existing: &[ExistingTransaction],
    ) {
        let (Some(date_index), Some(amount_index)) = (cols.date, cols.amount) else {
            return;
        };

        for row in rows.iter_mut().filter(|r| r.meta.selected) {
            let Some(date) = date_format.parse_date(row.value(date_index)) else {
                continue;
            };
            let Some(amount) = Money::parse_str(row.value(amount_index)) else {
                continue;
            };
            row.meta.duplicate = self.flag_row(row, cols, date, amount, existing);
        }
    }

    fn flag_row(
        &self,
        row: &ImportRow,
        cols: &MappedColumns,
        date: NaiveDate,
        amount: Money,
        existing: &[ExistingTransaction],
    ) -> Option<DuplicateFlag> {
        // A row already recognised as a transfer leg is only checked
        // against persisted transfers running the opposite way: a transfer
        // booked on the row's target account, same absolute amount, within
        // the date window.
        if let Some(hint) = &row.meta.transfer {
            return existing
                .iter()
                .find(|tx| {
                    tx.kind == TransactionKind::Transfer
                        && tx.account_id == hint.account_id
                        && (tx.date - date).num_days().abs() <= self.date_window_days
                        && tx.amount.abs().approx_eq(amount.abs(), self.amount_tolerance)
                })
                .map(|tx| DuplicateFlag {
                    transaction_id: tx.id,
                    kind: DuplicateKind::AccountTransfer,
                    confidence: TRANSFER_CONFIDENCE,
                });
        }

        let text = cols
            .recipient
            .map(|i| row.value(i))
            .filter(|t| !t.is_empty())
            .or_else(|| cols.notes.map(|i| row.value(i)).filter(|t| !t.is_empty()))
            .unwrap_or("");

        existing
            .iter()
            .find(|tx| {
                if tx.date != date || !tx.amount.approx_eq(amount, self.amount_tolerance) {
                    return false;
                }
                if text.is_empty() {
                    // Nothing to compare: date+amount alone is enough.
                    return true;
                }
                tx.recipient_name
                    .as_deref()
                    .is_some_and(|name| similarity(text, name) > self.text_similarity_floor)
            })
            .map(|tx| DuplicateFlag {
                transaction_id: tx.id,
                kind: DuplicateKind::Standard,
                confidence: STANDARD_CONFIDENCE,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use collatio_core::{Account, AccountId, RecipientId};
    use crate::dialect::Dialect;
    use crate::mapper::infer_mapping;
    use crate::matcher::EntityMatcher;
    use crate::parser::parse_rows;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn existing(
        id: i64,
        account: i64,
        d: NaiveDate,
        cents: i64,
        kind: TransactionKind,
        recipient: Option<&str>,
    ) -> ExistingTransaction {
        ExistingTransaction {
            id: TransactionId(id),
            account_id: AccountId(account),
            date: d,
            amount: Money::from_cents(cents),
            kind,
            recipient_name: recipient.map(str::to_string),
        }
    }

    fn flagged(text: &str, accounts: &[Account], store: &[ExistingTransaction]) -> Vec<ImportRow> {
        let mut dialect = Dialect::default();
        dialect.detect(text);
        let parsed = parse_rows(text, &dialect).unwrap();
        let mapping = infer_mapping(&parsed.headers, &parsed.rows);
        let cols = mapping.resolve(&parsed.headers);
        let mut rows = parsed.rows;
        let matcher = EntityMatcher::default();
        for row in &mut rows {
            matcher.match_row(row, &cols, accounts, &[], &[]);
        }
        DuplicateDetector::default().flag_rows(&mut rows, &cols, dialect.date_format, store);
        rows
    }

    #[test]
    fn exact_duplicate_flagged_standard() {
        let store = vec![existing(
            100,
            1,
            date(2024, 1, 5),
            -5000,
            TransactionKind::Standard,
            Some("ACME Corp"),
        )];
        let rows = flagged("Date,Amount,Payee\n2024-01-05,-50.00,ACME Corp\n", &[], &store);
        let flag = rows[0].meta.duplicate.as_ref().expect("duplicate flag");
        assert_eq!(flag.kind, DuplicateKind::Standard);
        assert_eq!(flag.confidence, 0.8);
        assert_eq!(flag.transaction_id, TransactionId(100));
        // Advisory only: the row stays selected and importable.
        assert!(rows[0].meta.selected);
    }

    #[test]
    fn different_sign_is_not_a_duplicate() {
        let store = vec![existing(
            100,
            1,
            date(2024, 1, 5),
            5000,
            TransactionKind::Standard,
            Some("ACME Corp"),
        )];
        let rows = flagged("Date,Amount,Payee\n2024-01-05,-50.00,ACME Corp\n", &[], &store);
        assert!(rows[0].meta.duplicate.is_none());
    }

    #[test]
    fn dissimilar_recipient_is_not_a_duplicate() {
        let store = vec![existing(
            100,
            1,
            date(2024, 1, 5),
            -5000,
            TransactionKind::Standard,
            Some("Completely Different Vendor"),
        )];
        let rows = flagged("Date,Amount,Payee\n2024-01-05,-50.00,XY\n", &[], &store);
        assert!(rows[0].meta.duplicate.is_none());
    }

    #[test]
    fn no_row_text_matches_recipientless_transaction() {
        let store = vec![existing(
            100,
            1,
            date(2024, 1, 5),
            -5000,
            TransactionKind::Standard,
            None,
        )];
        let rows = flagged("Date,Amount\n2024-01-05,-50.00\n", &[], &store);
        let flag = rows[0].meta.duplicate.as_ref().expect("duplicate flag");
        assert_eq!(flag.kind, DuplicateKind::Standard);
    }

    #[test]
    fn row_text_against_recipientless_transaction_is_no_match() {
        let store = vec![existing(
            100,
            1,
            date(2024, 1, 5),
            -5000,
            TransactionKind::Standard,
            None,
        )];
        let rows = flagged("Date,Amount,Payee\n2024-01-05,-50.00,ACME Corp\n", &[], &store);
        assert!(rows[0].meta.duplicate.is_none());
    }

    #[test]
    fn transfer_row_matches_opposite_leg_within_window() {
        let accounts = vec![Account {
            id: AccountId(2),
            name: "Savings".to_string(),
            active: true,
        }];
        // The persisted leg lives on the target account, one day off.
        let store = vec![existing(
            200,
            2,
            date(2024, 1, 6),
            5000,
            TransactionKind::Transfer,
            None,
        )];
        let rows = flagged("Date,Amount,Payee\n2024-01-05,-50.00,Savings\n", &accounts, &store);
        let flag = rows[0].meta.duplicate.as_ref().expect("duplicate flag");
        assert_eq!(flag.kind, DuplicateKind::AccountTransfer);
        assert_eq!(flag.confidence, 0.95);
    }

    #[test]
    fn transfer_row_ignores_standard_transactions() {
        let accounts = vec![Account {
            id: AccountId(2),
            name: "Savings".to_string(),
            active: true,
        }];
        let store = vec![existing(
            200,
            2,
            date(2024, 1, 5),
            5000,
            TransactionKind::Standard,
            None,
        )];
        let rows = flagged("Date,Amount,Payee\n2024-01-05,-50.00,Savings\n", &accounts, &store);
        assert!(rows[0].meta.duplicate.is_none());
    }

    #[test]
    fn transfer_match_outside_window_is_no_match() {
        let accounts = vec![Account {
            id: AccountId(2),
            name: "Savings".to_string(),
            active: true,
        }];
        let store = vec![existing(
            200,
            2,
            date(2024, 1, 8),
            5000,
            TransactionKind::Transfer,
            None,
        )];
        let rows = flagged("Date,Amount,Payee\n2024-01-05,-50.00,Savings\n", &accounts, &store);
        assert!(rows[0].meta.duplicate.is_none());
    }

    #[test]
    fn unparseable_rows_are_skipped() {
        let store = vec![existing(
            100,
            1,
            date(2024, 1, 5),
            -5000,
            TransactionKind::Standard,
            Some("ACME Corp"),
        )];
        let rows = flagged(
            "Date,Amount,Payee\nnot-a-date,-50.00,ACME Corp\n2024-01-05,garbage,ACME Corp\n",
            &[],
            &store,
        );
        assert!(rows[0].meta.duplicate.is_none());
        assert!(rows[1].meta.duplicate.is_none());
    }
}
