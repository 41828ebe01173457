use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::filing::{FilingPair, FinancialFiling};
use super::ticker::Ticker;

/// Closing price observed on a trading day.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    /// The trading day the close belongs to (may precede the requested date).
    pub date: NaiveDate,
    pub close: f64,
}

/// Per-slice, per-ticker snapshot handed to the selector.
///
/// Built fresh for every slice. Missing financials mean "uncovered", not an
/// error: new listings legitimately have no filings yet.
#[derive(Debug, Clone)]
pub struct TickerDate {
    pub ticker: Ticker,
    /// The slice date.
    pub date: NaiveDate,
    pub price: f64,
    /// The trading day `price` was observed on.
    pub price_date: NaiveDate,
    pub current_financials: Option<Arc<FinancialFiling>>,
    pub last_financials: Option<Arc<FinancialFiling>>,
}

impl TickerDate {
    pub fn new(ticker: Ticker, date: NaiveDate, price: PricePoint, filings: FilingPair) -> Self {
        Self {
            ticker,
            date,
            price: price.close,
            price_date: price.date,
            current_financials: filings.current,
            last_financials: filings.last,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.ticker.symbol
    }

    pub fn sector(&self) -> &str {
        &self.ticker.sector
    }

    /// True when at least a current filing is available.
    pub fn is_covered(&self) -> bool {
        self.current_financials.is_some()
    }

    /// Reported value of a line item on the current filing.
    pub fn current_line_item(&self, name: &str) -> Option<f64> {
        self.current_financials
            .as_deref()
            .and_then(|f| f.line_item(name))
    }
}

impl fmt::Display for TickerDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TickerDate({}, {}, {}, {:.2})",
            self.ticker.symbol, self.ticker.sector, self.date, self.price
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::filing::line_items;

    #[test]
    fn uncovered_ticker_has_no_line_items() {
        let d = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let td = TickerDate::new(
            Ticker::new("NEW", "Technology"),
            d,
            PricePoint { date: d, close: 10.0 },
            FilingPair::default(),
        );
        assert!(!td.is_covered());
        assert_eq!(td.current_line_item(line_items::BASIC_EPS), None);
        assert_eq!(td.symbol(), "NEW");
        assert_eq!(td.sector(), "Technology");
    }

    #[test]
    fn price_date_may_precede_slice_date() {
        let slice = NaiveDate::from_ymd_opt(2020, 2, 1).unwrap();
        let friday = NaiveDate::from_ymd_opt(2020, 1, 31).unwrap();
        let td = TickerDate::new(
            Ticker::new("AAPL", "Technology"),
            slice,
            PricePoint { date: friday, close: 309.51 },
            FilingPair::default(),
        );
        assert_eq!(td.date, slice);
        assert_eq!(td.price_date, friday);
        assert!((td.price - 309.51).abs() < 1e-12);
    }
}
