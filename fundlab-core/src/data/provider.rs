//! Data provider trait and structured error types.
//!
//! The DataProvider trait abstracts over data sources (Polygon.io, in-memory
//! replay) so we can swap implementations and mock for tests. The fetcher and
//! the filing cache sit above this trait; providers know nothing about
//! retries, rate limits or caching.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::domain::FinancialFiling;

pub use crate::domain::PricePoint;

/// Structured error types for data operations.
///
/// Classification drives the fetcher: transient errors are retried with
/// backoff, everything else is surfaced immediately.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DataError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("provider server error (HTTP {status})")]
    ServerError { status: u16 },

    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("symbol not found: {symbol}")]
    SymbolNotFound { symbol: String },

    #[error("no price for {symbol} within {lookback_days} days of {date}")]
    PriceNotFound {
        symbol: String,
        date: NaiveDate,
        lookback_days: u32,
    },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("hard stop: data provider refused (circuit breaker tripped)")]
    CircuitBreakerTripped,

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<DataError> },
}

impl DataError {
    /// Timeout, network, 5xx and throttling: worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DataError::Timeout(_)
                | DataError::NetworkUnreachable(_)
                | DataError::ServerError { .. }
                | DataError::RateLimited { .. }
        )
    }

    /// Failures that affect every request to the provider, not one ticker.
    pub fn is_provider_wide(&self) -> bool {
        matches!(
            self,
            DataError::AuthenticationRequired(_) | DataError::CircuitBreakerTripped
        )
    }

    /// Provider-supplied minimum wait before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DataError::RateLimited { retry_after_secs } => {
                Some(Duration::from_secs(*retry_after_secs))
            }
            _ => None,
        }
    }
}

/// Kind of data a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataKind {
    Price,
    Filings,
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataKind::Price => write!(f, "price"),
            DataKind::Filings => write!(f, "filings"),
        }
    }
}

/// Period-end range of a filings request: `after < period_end <= through`.
///
/// With a `limit`, only the `limit` most recent filings in the range are
/// returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilingWindow {
    pub after: Option<NaiveDate>,
    pub through: NaiveDate,
    pub limit: Option<usize>,
}

impl FilingWindow {
    /// The `limit` most recent filings ending on or before `through`.
    pub fn latest(through: NaiveDate, limit: usize) -> Self {
        Self {
            after: None,
            through,
            limit: Some(limit),
        }
    }

    /// Every filing ending in `(after, through]`.
    pub fn between(after: NaiveDate, through: NaiveDate) -> Self {
        Self {
            after: Some(after),
            through,
            limit: None,
        }
    }

    /// Every filing ending on or before `through`.
    pub fn through(through: NaiveDate) -> Self {
        Self {
            after: None,
            through,
            limit: None,
        }
    }

    pub fn contains(&self, period_end: NaiveDate) -> bool {
        self.after.map_or(true, |a| period_end > a) && period_end <= self.through
    }
}

impl fmt::Display for FilingWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.after {
            Some(a) => write!(f, "({a}, {}]", self.through)?,
            None => write!(f, "(.., {}]", self.through)?,
        }
        if let Some(limit) = self.limit {
            write!(f, " limit {limit}")?;
        }
        Ok(())
    }
}

/// Trait for remote data providers (Polygon.io, in-memory replay, etc).
///
/// Implementations issue exactly one logical request per call. Authentication
/// is the implementation's business and supplied out of band.
#[async_trait]
pub trait DataProvider: Send + Sync {
    /// Human-readable name of this provider.
    fn name(&self) -> &str;

    /// Closing price on the latest trading day `d` with
    /// `date - lookback_days < d <= date`.
    async fn fetch_price(
        &self,
        symbol: &str,
        date: NaiveDate,
        lookback_days: u32,
    ) -> Result<PricePoint, DataError>;

    /// Filings whose period end falls in `window`, ascending by period end.
    async fn fetch_filings(
        &self,
        symbol: &str,
        window: FilingWindow,
    ) -> Result<Vec<FinancialFiling>, DataError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn classification() {
        assert!(DataError::Timeout(Duration::from_secs(10)).is_transient());
        assert!(DataError::ServerError { status: 503 }.is_transient());
        assert!(DataError::RateLimited { retry_after_secs: 1 }.is_transient());
        assert!(!DataError::AuthenticationRequired("bad key".into()).is_transient());
        assert!(DataError::AuthenticationRequired("bad key".into()).is_provider_wide());
        assert!(DataError::CircuitBreakerTripped.is_provider_wide());

        let missing = DataError::SymbolNotFound { symbol: "ZZZZ".into() };
        assert!(!missing.is_transient());
        assert!(!missing.is_provider_wide());

        let exhausted = DataError::RetriesExhausted {
            attempts: 4,
            last: Box::new(DataError::ServerError { status: 502 }),
        };
        assert!(!exhausted.is_transient());
    }

    #[test]
    fn retry_after_only_for_throttling() {
        assert_eq!(
            DataError::RateLimited { retry_after_secs: 7 }.retry_after(),
            Some(Duration::from_secs(7))
        );
        assert_eq!(DataError::ServerError { status: 500 }.retry_after(), None);
    }

    #[test]
    fn window_bounds() {
        let w = FilingWindow::between(d(2020, 1, 1), d(2020, 4, 1));
        assert!(!w.contains(d(2020, 1, 1)));
        assert!(w.contains(d(2020, 3, 31)));
        assert!(w.contains(d(2020, 4, 1)));
        assert!(!w.contains(d(2020, 4, 2)));

        let open = FilingWindow::latest(d(2020, 1, 1), 2);
        assert!(open.contains(d(1999, 12, 31)));
        assert_eq!(open.to_string(), "(.., 2020-01-01] limit 2");
    }
}
