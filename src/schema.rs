use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Regulator-assigned size/type tier. An institution may be reclassified
/// mid-history; the consolidated datasets always carry the resolved tier
/// (see `segments`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Segment {
    One,
    Two,
    Three,
    /// Mutual savings institutions report alongside segment 1 cooperatives
    /// but under their own label.
    MutualistaOne,
    Unknown,
}

impl Segment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Segment::One => "SEGMENTO 1",
            Segment::Two => "SEGMENTO 2",
            Segment::Three => "SEGMENTO 3",
            Segment::MutualistaOne => "SEGMENTO 1 MUTUALISTA",
            Segment::Unknown => "DESCONOCIDO",
        }
    }

    /// Parse a segment out of an in-file label or a file name. Matching is
    /// case-insensitive and tolerates `_` for ` `.
    pub fn from_label(label: &str) -> Segment {
        let lower = label.to_lowercase().replace('_', " ");
        if lower.contains("mutualista") {
            Segment::MutualistaOne
        } else if lower.contains("segmento 1") {
            Segment::One
        } else if lower.contains("segmento 2") {
            Segment::Two
        } else if lower.contains("segmento 3") {
            Segment::Three
        } else {
            Segment::Unknown
        }
    }

    pub fn is_mutualista(&self) -> bool {
        matches!(self, Segment::MutualistaOne)
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceFormat {
    /// Semicolon-delimited text, pre-2022 vintage.
    DelimitedSemicolon,
    /// Tab-delimited text with comma decimals, 2022 onwards.
    DelimitedTab,
    /// Wide spreadsheet layout, one column per institution.
    WideWorkbook,
}

/// One observation as emitted by the reader, before entity
/// canonicalization. Lives only within a pipeline run.
#[derive(Debug, Clone)]
pub struct RawRow {
    pub entity_raw: String,
    pub segment_raw: Segment,
    pub period: NaiveDate,
    pub account_code: String,
    pub account_desc: String,
    pub value: f64,
    pub source_format: SourceFormat,
}

/// A canonicalized balance or P&L observation. The canonical entity name
/// doubles as the entity identifier; datasets dictionary-encode it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub entity: String,
    pub segment: Segment,
    pub period: NaiveDate,
    pub account_code: String,
    pub value: f64,
}

/// Five-way regulatory rating grouping for pre-computed indicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CamelCategory {
    Capital,
    AssetQuality,
    Management,
    Earnings,
    Liquidity,
}

impl CamelCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            CamelCategory::Capital => "Capital",
            CamelCategory::AssetQuality => "Asset Quality",
            CamelCategory::Management => "Management",
            CamelCategory::Earnings => "Earnings",
            CamelCategory::Liquidity => "Liquidity",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<CamelCategory> {
        match s {
            "Capital" => Some(CamelCategory::Capital),
            "Asset Quality" => Some(CamelCategory::AssetQuality),
            "Management" => Some(CamelCategory::Management),
            "Earnings" => Some(CamelCategory::Earnings),
            "Liquidity" => Some(CamelCategory::Liquidity),
            _ => None,
        }
    }
}

impl fmt::Display for CamelCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pre-computed indicator observation recovered from a pivot cache.
/// `value_ratio` is the native unscaled ratio; multiplying by 100 is a
/// presentation concern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorRecord {
    pub entity: String,
    pub segment: Segment,
    pub period: NaiveDate,
    pub indicator_code: String,
    pub category: CamelCategory,
    pub value_ratio: f64,
}

/// Dataset payload for a pivot-cache indicator observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorValue {
    pub category: CamelCategory,
    pub ratio: f64,
}

/// Persisted P&L payload: the filed year-to-date cumulative plus the two
/// derived columns re-computed after every merge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PygValue {
    pub cumulative: f64,
    pub monthly: f64,
    pub trailing_12m: Option<f64>,
}

impl PygValue {
    pub fn cumulative(value: f64) -> Self {
        PygValue {
            cumulative: value,
            monthly: 0.0,
            trailing_12m: None,
        }
    }
}

/// Hierarchy depth of an account code in the regulator's chart of
/// accounts, derived from code length.
pub fn account_level(code: &str) -> u8 {
    match code.trim().len() {
        0 => 0,
        1 => 1,
        2 => 2,
        3 | 4 => 3,
        5 | 6 => 4,
        _ => 5,
    }
}

/// Income-statement accounts live under the `4` (expenses) and `5`
/// (income) roots of the chart of accounts.
pub fn is_income_statement_code(code: &str) -> bool {
    matches!(code.trim().as_bytes().first(), Some(b'4') | Some(b'5'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_from_label() {
        assert_eq!(Segment::from_label("SEGMENTO 1"), Segment::One);
        assert_eq!(Segment::from_label("segmento_3"), Segment::Three);
        assert_eq!(
            Segment::from_label("balance_mutualistas_2024.xlsx"),
            Segment::MutualistaOne
        );
        assert_eq!(
            Segment::from_label("SEGMENTO 1 MUTUALISTA"),
            Segment::MutualistaOne
        );
        assert_eq!(Segment::from_label("otros"), Segment::Unknown);
    }

    #[test]
    fn test_segment_roundtrip() {
        for seg in [
            Segment::One,
            Segment::Two,
            Segment::Three,
            Segment::MutualistaOne,
        ] {
            assert_eq!(Segment::from_label(seg.as_str()), seg);
        }
    }

    #[test]
    fn test_account_level() {
        assert_eq!(account_level("1"), 1);
        assert_eq!(account_level("14"), 2);
        assert_eq!(account_level("1401"), 3);
        assert_eq!(account_level("140105"), 4);
        assert_eq!(account_level("14010510"), 5);
        assert_eq!(account_level(""), 0);
    }

    #[test]
    fn test_income_statement_codes() {
        assert!(is_income_statement_code("4"));
        assert!(is_income_statement_code("51"));
        assert!(is_income_statement_code(" 45 "));
        assert!(!is_income_statement_code("14"));
        assert!(!is_income_statement_code("3"));
        assert!(!is_income_statement_code(""));
    }

    #[test]
    fn test_camel_category_roundtrip() {
        for cat in [
            CamelCategory::Capital,
            CamelCategory::AssetQuality,
            CamelCategory::Management,
            CamelCategory::Earnings,
            CamelCategory::Liquidity,
        ] {
            assert_eq!(CamelCategory::from_str_opt(cat.as_str()), Some(cat));
        }
        assert_eq!(CamelCategory::from_str_opt("Vulnerability"), None);
    }
}
