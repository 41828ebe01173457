//! Time slice construction.
//!
//! For one rebalance date, every ticker's price fetch and filing lookup run
//! concurrently. The slice is ready once every ticker has finished. A price
//! failure drops the ticker; a filing failure leaves it uncovered. Only a
//! provider-wide failure (bad credentials, open breaker) fails the slice.

use std::sync::Arc;

use chrono::NaiveDate;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use fundlab_core::data::{
    DataError, FetchKey, FetchRequest, FetchResponse, FinancialFilingCache, RateLimitedFetcher,
};
use fundlab_core::domain::{FilingPair, Ticker, TickerDate, TimeSlice};

#[derive(Debug, Error)]
pub enum SliceError {
    #[error("universe is empty")]
    EmptyUniverse,

    #[error("provider unavailable: {0}")]
    ProviderUnavailable(DataError),
}

/// Per-ticker degradation recorded while building a slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SliceWarning {
    /// Dropped from the slice.
    PriceUnavailable { symbol: String, reason: String },
    /// Dropped from the slice.
    InvalidPrice { symbol: String, price: f64 },
    /// Kept, uncovered.
    FilingsUnavailable { symbol: String, reason: String },
}

impl SliceWarning {
    pub fn symbol(&self) -> &str {
        match self {
            SliceWarning::PriceUnavailable { symbol, .. }
            | SliceWarning::InvalidPrice { symbol, .. }
            | SliceWarning::FilingsUnavailable { symbol, .. } => symbol,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SliceWarning::PriceUnavailable { .. } => "price_unavailable",
            SliceWarning::InvalidPrice { .. } => "invalid_price",
            SliceWarning::FilingsUnavailable { .. } => "filings_unavailable",
        }
    }

    /// True when the ticker is absent from the slice.
    pub fn is_drop(&self) -> bool {
        !matches!(self, SliceWarning::FilingsUnavailable { .. })
    }
}

impl std::fmt::Display for SliceWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SliceWarning::PriceUnavailable { symbol, reason } => {
                write!(f, "{symbol} dropped, no price: {reason}")
            }
            SliceWarning::InvalidPrice { symbol, price } => {
                write!(f, "{symbol} dropped, invalid price {price}")
            }
            SliceWarning::FilingsUnavailable { symbol, reason } => {
                write!(f, "{symbol} uncovered, no filings: {reason}")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SliceBuild {
    pub slice: TimeSlice,
    pub warnings: Vec<SliceWarning>,
}

impl SliceBuild {
    pub fn dropped(&self) -> impl Iterator<Item = &str> {
        self.warnings.iter().filter(|w| w.is_drop()).map(|w| w.symbol())
    }
}

pub struct TimeSliceBuilder {
    fetcher: Arc<RateLimitedFetcher>,
    cache: Arc<FinancialFilingCache>,
}

impl TimeSliceBuilder {
    pub fn new(fetcher: Arc<RateLimitedFetcher>, cache: Arc<FinancialFilingCache>) -> Self {
        Self { fetcher, cache }
    }

    pub fn cache(&self) -> &FinancialFilingCache {
        &self.cache
    }

    pub fn fetcher(&self) -> &RateLimitedFetcher {
        &self.fetcher
    }

    /// Resolve every ticker of `universe` as of `date`.
    ///
    /// Entries keep universe order regardless of completion order.
    pub async fn build(&self, date: NaiveDate, universe: &[Ticker]) -> Result<SliceBuild, SliceError> {
        if universe.is_empty() {
            return Err(SliceError::EmptyUniverse);
        }

        // Prices go out as one keyed batch while filing lookups run beside it.
        let requests = universe
            .iter()
            .map(|ticker| FetchRequest::Price {
                symbol: ticker.symbol.clone(),
                date,
            })
            .collect();
        let lookups = join_all(
            universe
                .iter()
                .map(|ticker| self.cache.lookup(&ticker.symbol, date)),
        );
        let (mut prices, lookups) = tokio::join!(self.fetcher.fetch_batch(requests), lookups);

        let resolved: Vec<_> = universe
            .iter()
            .zip(lookups)
            .map(|(ticker, filings)| {
                let price = match prices.remove(&FetchKey::price(&ticker.symbol, date)) {
                    Some(Ok(FetchResponse::Price(p))) => Ok(p),
                    Some(Ok(FetchResponse::Filings(_))) => Err(DataError::MalformedResponse(
                        "filings returned for a price request".into(),
                    )),
                    Some(Err(e)) => Err(e),
                    None => Err(DataError::MalformedResponse(
                        "no result for price request".into(),
                    )),
                };
                (ticker, price, filings)
            })
            .collect();

        let mut entries = Vec::with_capacity(resolved.len());
        let mut warnings = Vec::new();
        let mut provider_failure = None;

        for (ticker, price, filings) in resolved {
            let symbol = ticker.symbol.clone();
            for err in [price.as_ref().err(), filings.as_ref().err()].into_iter().flatten() {
                if err.is_provider_wide() && provider_failure.is_none() {
                    provider_failure = Some(err.clone());
                }
            }

            let filings = match filings {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("{date}: {symbol} filings unavailable, treating as uncovered: {e}");
                    warnings.push(SliceWarning::FilingsUnavailable {
                        symbol: symbol.clone(),
                        reason: e.to_string(),
                    });
                    FilingPair::default()
                }
            };

            match price {
                Ok(p) if p.close.is_finite() && p.close > 0.0 => {
                    entries.push(TickerDate::new(ticker.clone(), date, p, filings));
                }
                Ok(p) => {
                    warn!("{date}: dropping {symbol}, unusable price {}", p.close);
                    warnings.push(SliceWarning::InvalidPrice {
                        symbol,
                        price: p.close,
                    });
                }
                Err(e) => {
                    warn!("{date}: dropping {symbol}, price unavailable: {e}");
                    warnings.push(SliceWarning::PriceUnavailable {
                        symbol,
                        reason: e.to_string(),
                    });
                }
            }
        }

        if let Some(err) = provider_failure {
            return Err(SliceError::ProviderUnavailable(err));
        }

        let slice = TimeSlice::new(date, entries);
        debug!(
            "{date}: slice built with {} of {} tickers ({} covered)",
            slice.len(),
            universe.len(),
            slice.covered_count()
        );
        Ok(SliceBuild { slice, warnings })
    }
}
