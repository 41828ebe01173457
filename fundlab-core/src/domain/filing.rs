//! Financial filings: one reporting period's statement for a ticker.
//!
//! Filings are immutable once fetched. Identity is `(symbol, period_end)`.
//! Line items are flattened to `statement.item` keys; an item the company did
//! not report is stored as `None` rather than omitted, so "reported as absent"
//! and "never heard of" stay distinguishable.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Well-known line item keys.
pub mod line_items {
    pub const BASIC_EPS: &str = "income_statement.basic_earnings_per_share";
    pub const DILUTED_EPS: &str = "income_statement.diluted_earnings_per_share";
    pub const REVENUES: &str = "income_statement.revenues";
    pub const NET_INCOME: &str = "income_statement.net_income_loss";
    pub const OPERATING_INCOME: &str = "income_statement.operating_income_loss";
    pub const ASSETS: &str = "balance_sheet.assets";
    pub const LIABILITIES: &str = "balance_sheet.liabilities";
    pub const EQUITY: &str = "balance_sheet.equity";
    pub const NET_CASH_FLOW: &str = "cash_flow_statement.net_cash_flow";
}

/// Identity of a filing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FilingKey {
    pub symbol: String,
    pub period_end: NaiveDate,
}

impl fmt::Display for FilingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.period_end)
    }
}

/// One quarterly or annual statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialFiling {
    pub symbol: String,
    pub period_end: NaiveDate,
    #[serde(default)]
    pub period_start: Option<NaiveDate>,
    /// Fiscal period id, e.g. `Q1`..`Q4` or `FY`.
    pub fiscal_period: String,
    #[serde(default)]
    pub fiscal_year: Option<i32>,
    #[serde(default)]
    pub filing_date: Option<NaiveDate>,
    #[serde(default)]
    pub line_items: BTreeMap<String, Option<f64>>,
}

impl FinancialFiling {
    pub fn new(symbol: impl Into<String>, period_end: NaiveDate, fiscal_period: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            period_end,
            period_start: None,
            fiscal_period: fiscal_period.into(),
            fiscal_year: None,
            filing_date: None,
            line_items: BTreeMap::new(),
        }
    }

    /// Builder-style setter for a line item (`None` = not reported).
    pub fn with_line_item(mut self, name: impl Into<String>, value: Option<f64>) -> Self {
        self.line_items.insert(name.into(), value);
        self
    }

    pub fn key(&self) -> FilingKey {
        FilingKey {
            symbol: self.symbol.clone(),
            period_end: self.period_end,
        }
    }

    /// Reported value of a line item. `None` if absent or unreported.
    pub fn line_item(&self, name: &str) -> Option<f64> {
        self.line_items.get(name).copied().flatten()
    }

    /// True if the filing carries a reported value for `name`.
    pub fn is_reported(&self, name: &str) -> bool {
        self.line_item(name).is_some()
    }
}

/// The `(current, last)` filing pair covering an as-of date.
///
/// `current` is the latest filing with `period_end <= as_of`; `last` is the
/// one immediately before it. Either may be absent (new listings).
#[derive(Debug, Clone, Default)]
pub struct FilingPair {
    pub current: Option<Arc<FinancialFiling>>,
    pub last: Option<Arc<FinancialFiling>>,
}

impl FilingPair {
    pub fn is_empty(&self) -> bool {
        self.current.is_none()
    }

    /// Index-based resolution over an ascending, strictly monotonic sequence.
    pub fn resolve(filings: &[Arc<FinancialFiling>], as_of: NaiveDate) -> Self {
        let idx = filings.partition_point(|f| f.period_end <= as_of);
        Self {
            current: idx.checked_sub(1).map(|i| Arc::clone(&filings[i])),
            last: idx.checked_sub(2).map(|i| Arc::clone(&filings[i])),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn seq(dates: &[NaiveDate]) -> Vec<Arc<FinancialFiling>> {
        dates
            .iter()
            .map(|&pe| Arc::new(FinancialFiling::new("AAPL", pe, "Q")))
            .collect()
    }

    #[test]
    fn unreported_line_item_is_none() {
        let f = FinancialFiling::new("AAPL", d(2020, 3, 31), "Q2")
            .with_line_item(line_items::BASIC_EPS, Some(2.58))
            .with_line_item(line_items::REVENUES, None);
        assert_eq!(f.line_item(line_items::BASIC_EPS), Some(2.58));
        assert_eq!(f.line_item(line_items::REVENUES), None);
        assert!(!f.is_reported(line_items::REVENUES));
        assert_eq!(f.line_item("missing.item"), None);
    }

    #[test]
    fn resolve_picks_latest_and_previous() {
        let filings = seq(&[d(2019, 6, 30), d(2019, 9, 30), d(2019, 12, 31)]);
        let pair = FilingPair::resolve(&filings, d(2020, 2, 1));
        assert_eq!(pair.current.unwrap().period_end, d(2019, 12, 31));
        assert_eq!(pair.last.unwrap().period_end, d(2019, 9, 30));
    }

    #[test]
    fn resolve_on_period_end_is_inclusive() {
        let filings = seq(&[d(2019, 9, 30), d(2019, 12, 31)]);
        let pair = FilingPair::resolve(&filings, d(2019, 12, 31));
        assert_eq!(pair.current.unwrap().period_end, d(2019, 12, 31));
    }

    #[test]
    fn resolve_before_first_filing_is_empty() {
        let filings = seq(&[d(2019, 12, 31)]);
        let pair = FilingPair::resolve(&filings, d(2019, 11, 1));
        assert!(pair.is_empty());
        assert!(pair.last.is_none());
    }

    #[test]
    fn resolve_single_filing_has_no_last() {
        let filings = seq(&[d(2019, 12, 31)]);
        let pair = FilingPair::resolve(&filings, d(2020, 1, 1));
        assert!(pair.current.is_some());
        assert!(pair.last.is_none());
    }
}
