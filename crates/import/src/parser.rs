use serde::{Deserialize, Serialize};
use thiserror::Error;

use collatio_core::{AccountId, CategoryId, Money, RecipientId, TransactionId};

use crate::dialect::Dialect;

/// Separator for the derived row identity. Unlikely to appear in field data
/// and survives row re-ordering and filtering, unlike the ordinal index.
const IDENTITY_SEPARATOR: &str = "|";

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("input contains no lines")]
    Empty,
    #[error("configured delimiter is empty")]
    NoDelimiter,
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Tri-state entity resolution: `Pending` means nothing decided yet, `None`
/// means "explicitly no entity", `Matched` carries the resolved id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution<T> {
    Pending,
    None,
    Matched(T),
}

impl<T: Copy> Resolution<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Resolution::Pending)
    }

    pub fn matched(&self) -> Option<T> {
        match self {
            Resolution::Matched(id) => Some(*id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate<T> {
    pub id: T,
    pub name: String,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateKind {
    Standard,
    AccountTransfer,
}

/// Advisory flag: the row is probably already in the store. The row stays
/// importable; callers decide whether to deselect it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateFlag {
    pub transaction_id: TransactionId,
    pub kind: DuplicateKind,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Incoming,
    Outgoing,
}

/// Set when the row's payee text names one of the user's own accounts:
/// the row is one leg of an account-to-account transfer, not a payment to
/// an external recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferHint {
    pub account_id: AccountId,
    pub account_name: String,
    pub amount: Money,
    pub direction: TransferDirection,
}

/// Pipeline state attached to a row. Kept apart from the raw column values
/// so user column headers can never collide with engine metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowMeta {
    pub selected: bool,
    pub recipient: Resolution<RecipientId>,
    pub category: Resolution<CategoryId>,
    pub recipient_candidates: Vec<MatchCandidate<RecipientId>>,
    pub category_candidates: Vec<MatchCandidate<CategoryId>>,
    pub duplicate: Option<DuplicateFlag>,
    pub tags: Vec<String>,
    pub transfer: Option<TransferHint>,
}

impl Default for RowMeta {
    fn default() -> Self {
        RowMeta {
            selected: true,
            recipient: Resolution::Pending,
            category: Resolution::Pending,
            recipient_candidates: Vec::new(),
            category_candidates: Vec::new(),
            duplicate: None,
            tags: Vec::new(),
            transfer: None,
        }
    }
}

/// One parsed source line. `values` is ordered and aligned with the
/// header list of the containing [`ParsedFile`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportRow {
    pub index: usize,
    pub identity: String,
    pub values: Vec<String>,
    pub meta: RowMeta,
}

impl ImportRow {
    pub fn value(&self, column_index: usize) -> &str {
        self.values.get(column_index).map(String::as_str).unwrap_or("")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedFile {
    pub headers: Vec<String>,
    pub rows: Vec<ImportRow>,
}

/// Splits the file into typed rows per the dialect. Rows whose field count
/// does not match the header count are dropped silently; only a file with
/// no lines at all, or an unusable delimiter, is an error.
pub fn parse_rows(text: &str, dialect: &Dialect) -> Result<ParsedFile, ParseError> {
    let separator = dialect.delimiter.as_str();
    if separator.is_empty() {
        return Err(ParseError::NoDelimiter);
    }
    if text.lines().next().is_none() {
        return Err(ParseError::Empty);
    }

    // Single-byte delimiters go through the csv crate so quoted fields with
    // embedded delimiters split correctly; multi-byte custom delimiters are
    // outside its model and fall back to a plain split.
    let records = if separator.len() == 1 {
        split_csv(text, separator.as_bytes()[0])?
    } else {
        split_plain(text, separator)
    };

    let mut records = records.into_iter();

    let headers: Vec<String> = if dialect.has_header_row {
        match records.next() {
            Some(first) => first,
            None => return Ok(ParsedFile { headers: Vec::new(), rows: Vec::new() }),
        }
    } else {
        // Synthesize names from the first line's field count; the line
        // itself stays in the data set.
        let width = records.clone().next().map(|r| r.len()).unwrap_or(0);
        (1..=width).map(|i| format!("Column {i}")).collect()
    };

    let rows = records
        .enumerate()
        .filter(|(_, values)| values.len() == headers.len())
        .map(|(index, values)| {
            let identity = values.join(IDENTITY_SEPARATOR).trim().to_string();
            ImportRow { index, identity, values, meta: RowMeta::default() }
        })
        .collect();

    Ok(ParsedFile { headers, rows })
}

fn split_csv(text: &str, delimiter: u8) -> Result<Vec<Vec<String>>, ParseError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let mut records = Vec::new();
    for result in reader.records() {
        let record = result?;
        if record.iter().all(|f| f.is_empty()) {
            continue;
        }
        records.push(record.iter().map(|f| f.to_string()).collect());
    }
    Ok(records)
}

fn split_plain(text: &str, separator: &str) -> Vec<Vec<String>> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            line.split(separator)
                .map(|field| field.trim().to_string())
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::Delimiter;

    fn dialect() -> Dialect {
        Dialect::default()
    }

    #[test]
    fn parses_header_and_rows() {
        let text = "date,amount,payee\n2024-01-05,-50.00,ACME Corp\n2024-01-06,12.00,REWE\n";
        let parsed = parse_rows(text, &dialect()).unwrap();
        assert_eq!(parsed.headers, vec!["date", "amount", "payee"]);
        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.rows[0].values[2], "ACME Corp");
        assert!(parsed.rows[0].meta.selected);
        assert!(parsed.rows[0].meta.recipient.is_pending());
    }

    #[test]
    fn synthesizes_column_names_without_header() {
        let text = "2024-01-05,-50.00,ACME\n2024-01-06,12.00,REWE\n";
        let d = Dialect { has_header_row: false, ..dialect() };
        let parsed = parse_rows(text, &d).unwrap();
        assert_eq!(parsed.headers, vec!["Column 1", "Column 2", "Column 3"]);
        assert_eq!(parsed.rows.len(), 2);
    }

    #[test]
    fn skips_rows_with_wrong_field_count() {
        let text = "a,b,c\n1,2,3\nonly,two\n4,5,6\n";
        let parsed = parse_rows(text, &dialect()).unwrap();
        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.rows[0].values, vec!["1", "2", "3"]);
        assert_eq!(parsed.rows[1].values, vec!["4", "5", "6"]);
    }

    #[test]
    fn skips_blank_lines() {
        let text = "a,b\n1,2\n\n\n3,4\n";
        let parsed = parse_rows(text, &dialect()).unwrap();
        assert_eq!(parsed.rows.len(), 2);
    }

    #[test]
    fn row_count_never_exceeds_data_lines() {
        let text = "a,b\n1,2\nbad\n3,4\n\n5,6,7\n";
        let non_blank_data_lines = 4;
        let parsed = parse_rows(text, &dialect()).unwrap();
        assert!(parsed.rows.len() <= non_blank_data_lines);
        assert_eq!(parsed.rows.len(), 2);
    }

    #[test]
    fn identity_joins_all_values() {
        let text = "date,amount\n2024-01-05,-50.00\n";
        let parsed = parse_rows(text, &dialect()).unwrap();
        assert_eq!(parsed.rows[0].identity, "2024-01-05|-50.00");
    }

    #[test]
    fn quoted_field_with_embedded_delimiter() {
        let text = "payee,amount\n\"Müller, Hans\",-50.00\n";
        let parsed = parse_rows(text, &dialect()).unwrap();
        assert_eq!(parsed.rows[0].values[0], "Müller, Hans");
    }

    #[test]
    fn semicolon_dialect() {
        let text = "Datum;Betrag\n05.01.2024;-50,00\n";
        let d = Dialect { delimiter: Delimiter::Semicolon, ..dialect() };
        let parsed = parse_rows(text, &d).unwrap();
        assert_eq!(parsed.headers, vec!["Datum", "Betrag"]);
        assert_eq!(parsed.rows[0].values[1], "-50,00");
    }

    #[test]
    fn custom_multibyte_delimiter_plain_split() {
        let text = "a||b\n1||2\n";
        let d = Dialect {
            delimiter: Delimiter::Custom("||".to_string()),
            ..dialect()
        };
        let parsed = parse_rows(text, &d).unwrap();
        assert_eq!(parsed.headers, vec!["a", "b"]);
        assert_eq!(parsed.rows[0].values, vec!["1", "2"]);
    }

    #[test]
    fn empty_input_is_an_error() {
        assert!(matches!(parse_rows("", &dialect()), Err(ParseError::Empty)));
    }

    #[test]
    fn empty_custom_delimiter_is_an_error() {
        let d = Dialect {
            delimiter: Delimiter::Custom(String::new()),
            ..dialect()
        };
        assert!(matches!(
            parse_rows("a,b\n", &d),
            Err(ParseError::NoDelimiter)
        ));
    }

    #[test]
    fn crlf_line_endings() {
        let text = "a,b\r\n1,2\r\n3,4\r\n";
        let parsed = parse_rows(text, &dialect()).unwrap();
        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.rows[1].values, vec!["3", "4"]);
    }
}
