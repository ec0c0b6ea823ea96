use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// How many leading characters of the file participate in delimiter
/// counting. Enough for several rows of any realistic export.
const DETECT_SAMPLE_CHARS: usize = 2048;

static YMD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}[-/.]\d{1,2}[-/.]\d{1,2}$").unwrap());
static DMY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,2}[-/.]\d{1,2}[-/.]\d{4}$").unwrap());
static DMY_SHORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,2}[-/.]\d{1,2}[-/.]\d{2}$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delimiter {
    Comma,
    Semicolon,
    Tab,
    Custom(String),
}

impl Delimiter {
    /// The effective separator string, empty for `Custom("")`.
    pub fn as_str(&self) -> &str {
        match self {
            Delimiter::Comma => ",",
            Delimiter::Semicolon => ";",
            Delimiter::Tab => "\t",
            Delimiter::Custom(s) => s,
        }
    }
}

/// The date layouts bank exports actually use. Only the first three are
/// auto-detected; the month-first forms exist for manual override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateFormat {
    YearMonthDay,
    DayMonthYear,
    DayMonthYearShort,
    MonthDayYear,
    MonthDayYearShort,
}

impl DateFormat {
    /// Parses `s` in this layout, accepting `-`, `/` and `.` separators.
    /// Two-digit years are pivoted at 50: `<50 → 20xx`, else `19xx`.
    pub fn parse_date(self, s: &str) -> Option<NaiveDate> {
        let parts: Vec<&str> = s.trim().split(['-', '/', '.']).collect();
        if parts.len() != 3 {
            return None;
        }
        let nums: Vec<i32> = parts
            .iter()
            .map(|p| p.trim().parse::<i32>())
            .collect::<Result<_, _>>()
            .ok()?;

        let (y, m, d) = match self {
            DateFormat::YearMonthDay => (nums[0], nums[1], nums[2]),
            DateFormat::DayMonthYear => (nums[2], nums[1], nums[0]),
            DateFormat::DayMonthYearShort => (infer_century(nums[2])?, nums[1], nums[0]),
            DateFormat::MonthDayYear => (nums[2], nums[0], nums[1]),
            DateFormat::MonthDayYearShort => (infer_century(nums[2])?, nums[0], nums[1]),
        };

        NaiveDate::from_ymd_opt(y, m as u32, d as u32)
    }

    pub fn format_date(self, date: NaiveDate) -> String {
        let fmt = match self {
            DateFormat::YearMonthDay => "%Y-%m-%d",
            DateFormat::DayMonthYear => "%d-%m-%Y",
            DateFormat::DayMonthYearShort => "%d-%m-%y",
            DateFormat::MonthDayYear => "%m-%d-%Y",
            DateFormat::MonthDayYearShort => "%m-%d-%y",
        };
        date.format(fmt).to_string()
    }
}

fn infer_century(yy: i32) -> Option<i32> {
    if !(0..=99).contains(&yy) {
        return None;
    }
    Some(if yy < 50 { 2000 + yy } else { 1900 + yy })
}

/// Parse configuration for one source file. Mutated by detection until the
/// caller confirms it, then treated as frozen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dialect {
    pub delimiter: Delimiter,
    pub has_header_row: bool,
    pub date_format: DateFormat,
}

impl Default for Dialect {
    fn default() -> Self {
        Dialect {
            delimiter: Delimiter::Comma,
            has_header_row: true,
            date_format: DateFormat::DayMonthYear,
        }
    }
}

impl Dialect {
    /// Infers delimiter and date format from the file text, in place.
    /// Pure over its inputs and idempotent; absence of usable data leaves
    /// the defaults standing.
    pub fn detect(&mut self, text: &str) {
        self.delimiter = detect_delimiter(text);
        self.date_format = self.detect_date_format(text);
    }

    fn detect_date_format(&self, text: &str) -> DateFormat {
        let data_line_index = usize::from(self.has_header_row);
        let Some(line) = text.lines().nth(data_line_index) else {
            return DateFormat::DayMonthYear;
        };

        for field in line.split(self.delimiter.as_str()) {
            let field = field.trim().trim_matches('"');
            if YMD.is_match(field) {
                return DateFormat::YearMonthDay;
            }
            if DMY.is_match(field) {
                return DateFormat::DayMonthYear;
            }
            if DMY_SHORT.is_match(field) {
                return DateFormat::DayMonthYearShort;
            }
        }

        DateFormat::DayMonthYear
    }
}

/// Shape probe shared with the column mapper: does this field look like a
/// date in any auto-detected layout?
pub(crate) fn looks_like_date(field: &str) -> bool {
    YMD.is_match(field) || DMY.is_match(field) || DMY_SHORT.is_match(field)
}

fn detect_delimiter(text: &str) -> Delimiter {
    let sample: String = text.chars().take(DETECT_SAMPLE_CHARS).collect();

    let commas = sample.matches(',').count();
    let semicolons = sample.matches(';').count();
    let tabs = sample.matches('\t').count();

    // Comma wins ties and the all-zero case.
    if semicolons > commas && semicolons >= tabs {
        Delimiter::Semicolon
    } else if tabs > commas && tabs > semicolons {
        Delimiter::Tab
    } else {
        Delimiter::Comma
    }
}
