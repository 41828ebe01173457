//! In-memory data provider.
//!
//! Serves prices and filings from maps held in memory. Used for offline
//! replays and as the provider double in tests: failures can be scripted per
//! `(symbol, kind)`, an artificial latency can be injected, and every call is
//! counted so tests can assert how often the provider was actually queried.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::provider::{DataError, DataKind, DataProvider, FilingWindow, PricePoint};
use crate::domain::{FilingKey, FinancialFiling};

#[derive(Debug, Default)]
struct CallLog {
    /// Scripted errors, consumed one per call.
    failures: HashMap<(String, DataKind), VecDeque<DataError>>,
    /// How many times each filing was returned to a caller.
    served: HashMap<FilingKey, u32>,
}

/// Decrements the in-flight gauge when a call finishes or is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
pub struct InMemoryProvider {
    prices: HashMap<String, BTreeMap<NaiveDate, f64>>,
    filings: HashMap<String, Vec<FinancialFiling>>,
    latency: Option<Duration>,
    log: Mutex<CallLog>,
    price_calls: AtomicU64,
    filing_calls: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price(mut self, symbol: &str, date: NaiveDate, close: f64) -> Self {
        self.prices
            .entry(symbol.to_string())
            .or_default()
            .insert(date, close);
        self
    }

    pub fn with_prices<I>(mut self, symbol: &str, prices: I) -> Self
    where
        I: IntoIterator<Item = (NaiveDate, f64)>,
    {
        self.prices
            .entry(symbol.to_string())
            .or_default()
            .extend(prices);
        self
    }

    /// Add a filing; kept sorted by period end, replacing any filing with the
    /// same identity.
    pub fn with_filing(mut self, filing: FinancialFiling) -> Self {
        let list = self.filings.entry(filing.symbol.clone()).or_default();
        list.retain(|f| f.period_end != filing.period_end);
        list.push(filing);
        list.sort_by_key(|f| f.period_end);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the next `times` calls for `(symbol, kind)` with `error`.
    pub fn fail_times(mut self, symbol: &str, kind: DataKind, times: usize, error: DataError) -> Self {
        let queue = self
            .log
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .failures
            .entry((symbol.to_string(), kind))
            .or_default();
        queue.extend(std::iter::repeat(error).take(times));
        self
    }

    fn log(&self) -> MutexGuard<'_, CallLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn price_calls(&self) -> u64 {
        self.price_calls.load(Ordering::SeqCst)
    }

    pub fn filing_calls(&self) -> u64 {
        self.filing_calls.load(Ordering::SeqCst)
    }

    /// Number of times the filing `(symbol, period_end)` was served.
    pub fn times_served(&self, symbol: &str, period_end: NaiveDate) -> u32 {
        let key = FilingKey {
            symbol: symbol.to_string(),
            period_end,
        };
        self.log().served.get(&key).copied().unwrap_or(0)
    }

    /// Highest serve count over all filings (0 if none served).
    pub fn max_times_served(&self) -> u32 {
        self.log().served.values().copied().max().unwrap_or(0)
    }

    /// Highest number of concurrently executing calls observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Register a call: count it, track concurrency, pop a scripted failure.
    async fn begin(&self, symbol: &str, kind: DataKind) -> Result<InFlight<'_>, DataError> {
        match kind {
            DataKind::Price => self.price_calls.fetch_add(1, Ordering::SeqCst),
            DataKind::Filings => self.filing_calls.fetch_add(1, Ordering::SeqCst),
        };
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let scripted = self
            .log()
            .failures
            .get_mut(&(symbol.to_string(), kind))
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(err) => Err(err),
            None => Ok(guard),
        }
    }
}

#[async_trait]
impl DataProvider for InMemoryProvider {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn fetch_price(
        &self,
        symbol: &str,
        date: NaiveDate,
        lookback_days: u32,
    ) -> Result<PricePoint, DataError> {
        let _in_flight = self.begin(symbol, DataKind::Price).await?;

        let series = self.prices.get(symbol).ok_or_else(|| DataError::SymbolNotFound {
            symbol: symbol.to_string(),
        })?;
        let earliest = date - ChronoDuration::days(i64::from(lookback_days.max(1)) - 1);
        series
            .range(earliest..=date)
            .next_back()
            .map(|(&d, &close)| PricePoint { date: d, close })
            .ok_or_else(|| DataError::PriceNotFound {
                symbol: symbol.to_string(),
                date,
                lookback_days,
            })
    }

    async fn fetch_filings(
        &self,
        symbol: &str,
        window: FilingWindow,
    ) -> Result<Vec<FinancialFiling>, DataError> {
        let _in_flight = self.begin(symbol, DataKind::Filings).await?;

        let mut matched: Vec<FinancialFiling> = self
            .filings
            .get(symbol)
            .map(|list| {
                list.iter()
                    .filter(|f| window.contains(f.period_end))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if let Some(limit) = window.limit {
            let skip = matched.len().saturating_sub(limit);
            matched.drain(..skip);
        }

        let mut log = self.log();
        for f in &matched {
            *log.served.entry(f.key()).or_insert(0) += 1;
        }
        Ok(matched)
    }
}
