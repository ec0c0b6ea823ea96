use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::dialect::looks_like_date;
use crate::parser::ImportRow;

/// Pure signed decimal, dot or comma fraction: `-50.00`, `+1200`, `3,5`.
static AMOUNT_SHAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[+-]?\d+([.,]\d+)?$").unwrap());

/// How many leading data rows the content pass samples.
const CONTENT_SAMPLE_ROWS: usize = 5;

const DATE_KEYWORDS: &[&str] = &["date", "datum", "valuta", "wert"];
const AMOUNT_KEYWORDS: &[&str] = &["amount", "betrag", "summe"];
const RECIPIENT_KEYWORDS: &[&str] = &["payee", "empfänger", "recipient", "zahler"];
const NOTES_KEYWORDS: &[&str] = &["note", "notiz", "verwendungszweck", "beschreibung"];
const CATEGORY_KEYWORDS: &[&str] = &["category", "kategorie", "cat", "kat"];

const RECIPIENT_MAX_AVG_LEN: usize = 60;
const CATEGORY_MAX_AVG_LEN: usize = 80;

/// Which source column feeds each of the five pipeline slots. A slot may be
/// unbound; rows are then excluded downstream when a mandatory field is
/// missing, so inference itself can never fail.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub date: Option<String>,
    pub amount: Option<String>,
    pub notes: Option<String>,
    pub recipient: Option<String>,
    pub category: Option<String>,
}

/// The mapping resolved to column indices against a concrete header list.
#[derive(Debug, Clone, Copy, Default)]
pub struct MappedColumns {
    pub date: Option<usize>,
    pub amount: Option<usize>,
    pub notes: Option<usize>,
    pub recipient: Option<usize>,
    pub category: Option<usize>,
}

impl ColumnMapping {
    pub fn resolve(&self, headers: &[String]) -> MappedColumns {
        let index_of = |name: &Option<String>| {
            name.as_deref()
                .and_then(|n| headers.iter().position(|h| h == n))
        };
        MappedColumns {
            date: index_of(&self.date),
            amount: index_of(&self.amount),
            notes: index_of(&self.notes),
            recipient: index_of(&self.recipient),
            category: index_of(&self.category),
        }
    }
}

#[derive(Default)]
struct SlotCandidates {
    date: Vec<String>,
    amount: Vec<String>,
    recipient: Vec<String>,
    notes: Vec<String>,
    category: Vec<String>,
}

fn push_unique(list: &mut Vec<String>, column: &str) {
    if !list.iter().any(|c| c == column) {
        list.push(column.to_string());
    }
}

/// Infers the column mapping from header names and a sample of row content.
/// Header-name hits take precedence; the content pass only adds candidates
/// a slot does not already have. Deterministic for identical input.
pub fn infer_mapping(headers: &[String], rows: &[ImportRow]) -> ColumnMapping {
    let mut candidates = SlotCandidates::default();

    // Header pass: lower-cased substring match against each slot's
    // vocabulary. One column may qualify for several slots.
    for header in headers {
        let lower = header.to_lowercase();
        if DATE_KEYWORDS.iter().any(|k| lower.contains(k)) {
            push_unique(&mut candidates.date, header);
        }
        if AMOUNT_KEYWORDS.iter().any(|k| lower.contains(k)) {
            push_unique(&mut candidates.amount, header);
        }
        if RECIPIENT_KEYWORDS.iter().any(|k| lower.contains(k)) {
            push_unique(&mut candidates.recipient, header);
        }
        if NOTES_KEYWORDS.iter().any(|k| lower.contains(k)) {
            push_unique(&mut candidates.notes, header);
        }
        if CATEGORY_KEYWORDS.iter().any(|k| lower.contains(k)) {
            push_unique(&mut candidates.category, header);
        }
    }

    // Content pass over the leading sample rows.
    let sample = &rows[..rows.len().min(CONTENT_SAMPLE_ROWS)];
    for (column_index, header) in headers.iter().enumerate() {
        let values: Vec<&str> = sample
            .iter()
            .map(|row| row.value(column_index))
            .filter(|v| !v.is_empty())
            .collect();
        if values.is_empty() {
            continue;
        }

        let any_date = values.iter().any(|v| looks_like_date(v));
        let any_amount = values.iter().any(|v| AMOUNT_SHAPE.is_match(v));
        let any_text = values
            .iter()
            .any(|v| !looks_like_date(v) && !AMOUNT_SHAPE.is_match(v));

        if any_date {
            push_unique(&mut candidates.date, header);
        }
        if any_amount {
            push_unique(&mut candidates.amount, header);
        }
        if any_text {
            let avg_len =
                values.iter().map(|v| v.chars().count()).sum::<usize>() / values.len();
            if avg_len < RECIPIENT_MAX_AVG_LEN {
                push_unique(&mut candidates.recipient, header);
            }
            if avg_len < CATEGORY_MAX_AVG_LEN {
                push_unique(&mut candidates.category, header);
            }
            push_unique(&mut candidates.notes, header);
        }
    }

    // Binding, in slot priority order date, amount, recipient, notes,
    // category: the first candidate carrying a slot keyword wins, else the
    // first candidate not consumed by a higher-priority slot.
    let mut consumed: Vec<String> = Vec::new();
    let date = bind(&candidates.date, DATE_KEYWORDS, &mut consumed);
    let amount = bind(&candidates.amount, AMOUNT_KEYWORDS, &mut consumed);
    let recipient = bind(&candidates.recipient, RECIPIENT_KEYWORDS, &mut consumed);
    let notes = bind(&candidates.notes, NOTES_KEYWORDS, &mut consumed);
    let category = bind(&candidates.category, CATEGORY_KEYWORDS, &mut consumed);

    ColumnMapping { date, amount, notes, recipient, category }
}

fn bind(candidates: &[String], keywords: &[&str], consumed: &mut Vec<String>) -> Option<String> {
    let chosen = candidates
        .iter()
        .find(|c| {
            let lower = c.to_lowercase();
            keywords.iter().any(|k| lower.contains(k))
        })
        .or_else(|| candidates.iter().find(|c| !consumed.contains(c)))
        .cloned();
    if let Some(column) = &chosen {
        consumed.push(column.clone());
    }
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::Dialect;
    use crate::parser::parse_rows;

    fn infer(text: &str) -> (Vec<String>, ColumnMapping) {
        let parsed = parse_rows(text, &Dialect::default()).unwrap();
        let mapping = infer_mapping(&parsed.headers, &parsed.rows);
        (parsed.headers, mapping)
    }

    #[test]
    fn maps_english_headers() {
        let (_, m) = infer("Date,Amount,Payee,Notes,Category\n2024-01-05,-50.00,ACME,ref 1,Food\n");
        assert_eq!(m.date.as_deref(), Some("Date"));
        assert_eq!(m.amount.as_deref(), Some("Amount"));
        assert_eq!(m.recipient.as_deref(), Some("Payee"));
        assert_eq!(m.notes.as_deref(), Some("Notes"));
        assert_eq!(m.category.as_deref(), Some("Category"));
    }

    #[test]
    fn maps_german_headers() {
        let (_, m) = infer(
            "Datum,Betrag,Empfänger,Verwendungszweck,Kategorie\n2024-01-05,-50.00,REWE,Einkauf,Lebensmittel\n",
        );
        assert_eq!(m.date.as_deref(), Some("Datum"));
        assert_eq!(m.amount.as_deref(), Some("Betrag"));
        assert_eq!(m.recipient.as_deref(), Some("Empfänger"));
        assert_eq!(m.notes.as_deref(), Some("Verwendungszweck"));
        assert_eq!(m.category.as_deref(), Some("Kategorie"));
    }

    #[test]
    fn content_pass_fills_unnamed_columns() {
        // No header keywords at all: content shape has to carry the mapping.
        let text = "Column 1,Column 2,Column 3\n2024-01-05,-50.00,ACME Corp\n2024-01-06,12.00,REWE\n";
        let (_, m) = infer(text);
        assert_eq!(m.date.as_deref(), Some("Column 1"));
        assert_eq!(m.amount.as_deref(), Some("Column 2"));
        assert_eq!(m.recipient.as_deref(), Some("Column 3"));
    }

    #[test]
    fn header_pass_wins_over_content_pass() {
        // "Wertstellung" names the date slot even though the amount column
        // also holds date-shaped content in no sampled row.
        let text = "Wertstellung,Betrag,Payee\n05.01.2024,-50.00,ACME\n";
        let (_, m) = infer(text);
        assert_eq!(m.date.as_deref(), Some("Wertstellung"));
        assert_eq!(m.amount.as_deref(), Some("Betrag"));
    }

    #[test]
    fn keyworded_candidate_preferred_over_first() {
        // Both columns hold amount-shaped content; the one whose name says
        // "Betrag" must win the amount slot.
        let text = "Saldo,Betrag\n100.00,-50.00\n";
        let (_, m) = infer(text);
        assert_eq!(m.amount.as_deref(), Some("Betrag"));
    }

    #[test]
    fn unbound_slots_stay_unbound() {
        let (_, m) = infer("Date,Amount\n2024-01-05,-50.00\n");
        assert_eq!(m.date.as_deref(), Some("Date"));
        assert_eq!(m.amount.as_deref(), Some("Amount"));
        assert!(m.recipient.is_none());
        assert!(m.notes.is_none());
        assert!(m.category.is_none());
    }

    #[test]
    fn inference_is_deterministic_and_idempotent() {
        let text = "Datum,Betrag,Zahler,Notiz\n05.01.2024,-50.00,ACME,Einkauf #food\n";
        let parsed = parse_rows(text, &Dialect::default()).unwrap();
        let first = infer_mapping(&parsed.headers, &parsed.rows);
        let second = infer_mapping(&parsed.headers, &parsed.rows);
        assert_eq!(first, second);
    }

    #[test]
    fn resolve_maps_names_to_indices() {
        let (headers, m) = infer("Date,Amount,Payee\n2024-01-05,-50.00,ACME\n");
        let cols = m.resolve(&headers);
        assert_eq!(cols.date, Some(0));
        assert_eq!(cols.amount, Some(1));
        assert_eq!(cols.recipient, Some(2));
        assert_eq!(cols.category, None);
    }

    #[test]
    fn empty_input_maps_nothing() {
        let m = infer_mapping(&[], &[]);
        assert_eq!(m, ColumnMapping::default());
    }
}
