use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Neg, Sub};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Money(Decimal);

impl Money {
    pub fn from_cents(cents: i64) -> Self {
        Money(Decimal::from(cents) / Decimal::from(100))
    }

    pub fn to_cents(self) -> i64 {
        (self.0 * Decimal::from(100)).round().to_i64().unwrap_or(0)
    }

    pub fn from_decimal(decimal: Decimal) -> Self {
        Money(decimal.round_dp(2))
    }

    pub fn zero() -> Self {
        Money(Decimal::ZERO)
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    pub fn is_negative(self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    pub fn abs(self) -> Self {
        Money(self.0.abs())
    }

    /// True when the two amounts differ by no more than `tolerance`.
    pub fn approx_eq(self, other: Money, tolerance: Money) -> bool {
        (self.0 - other.0).abs() <= tolerance.0.abs()
    }

    /// Parses a free-form amount string as it appears in bank exports:
    /// currency symbols and spaces are stripped, `(50.00)` is accounting
    /// notation for a negative, and both `1,234.56` and `1.234,56` /
    /// `-50,00` styles are accepted.
    pub fn parse_str(s: &str) -> Option<Money> {
        let s = s.trim();
        let (negative, s) = if s.starts_with('(') && s.ends_with(')') {
            (true, s[1..s.len() - 1].trim())
        } else {
            (false, s)
        };
        let s = s.replace(['$', '€', '£', ' ', '\u{a0}'], "");

        let normalized = match (s.rfind(','), s.rfind('.')) {
            // Both present: the rightmost one is the decimal separator.
            (Some(c), Some(p)) if c > p => s.replace('.', "").replace(',', "."),
            (Some(_), Some(_)) => s.replace(',', ""),
            // Comma only: decimal comma (`-50,00`) unless it reads like a
            // thousands group (`1,234`).
            (Some(c), None) => {
                if s.len() - c - 1 == 3 {
                    s.replace(',', "")
                } else {
                    s.replace(',', ".")
                }
            }
            _ => s,
        };

        let mut dec = Decimal::from_str(&normalized).ok()?;
        if negative {
            dec = -dec;
        }
        Some(Money(dec.round_dp(2)))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

impl Add for Money {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Money(self.0 + rhs.0)
    }
}

impl Sub for Money {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Money(self.0 - rhs.0)
    }
}

impl Neg for Money {
    type Output = Self;
    fn neg(self) -> Self {
        Money(-self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cents_round_trip() {
        assert_eq!(Money::from_cents(12345).to_cents(), 12345);
        assert_eq!(Money::from_cents(-5000).to_cents(), -5000);
        assert_eq!(Money::from_cents(0).to_cents(), 0);
    }

    #[test]
    fn parse_plain() {
        assert_eq!(Money::parse_str("123.45").unwrap().to_cents(), 12345);
        assert_eq!(Money::parse_str("-50.00").unwrap().to_cents(), -5000);
        assert_eq!(Money::parse_str("100").unwrap().to_cents(), 10000);
    }

    #[test]
    fn parse_decimal_comma() {
        assert_eq!(Money::parse_str("-50,00").unwrap().to_cents(), -5000);
        assert_eq!(Money::parse_str("3,5").unwrap().to_cents(), 350);
    }

    #[test]
    fn parse_thousands_separators() {
        assert_eq!(Money::parse_str("1,234.56").unwrap().to_cents(), 123456);
        assert_eq!(Money::parse_str("1.234,56").unwrap().to_cents(), 123456);
    }

    #[test]
    fn parse_accounting_parens() {
        assert_eq!(Money::parse_str("(75.25)").unwrap().to_cents(), -7525);
    }

    #[test]
    fn parse_currency_symbols() {
        assert_eq!(Money::parse_str("$99.99").unwrap().to_cents(), 9999);
        assert_eq!(Money::parse_str("€ 12,50").unwrap().to_cents(), 1250);
    }

    #[test]
    fn parse_invalid() {
        assert!(Money::parse_str("not_a_number").is_none());
        assert!(Money::parse_str("").is_none());
        assert!(Money::parse_str("ACME Corp").is_none());
    }

    #[test]
    fn approx_eq_within_tolerance() {
        let tol = Money::from_cents(1);
        assert!(Money::from_cents(5000).approx_eq(Money::from_cents(5001), tol));
        assert!(!Money::from_cents(5000).approx_eq(Money::from_cents(5002), tol));
    }

    #[test]
    fn negation_and_abs() {
        assert_eq!((-Money::from_cents(500)).to_cents(), -500);
        assert_eq!(Money::from_cents(-500).abs().to_cents(), 500);
    }
}
