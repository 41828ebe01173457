//! Rate-limited fetcher: the only path from the engine to the provider.
//!
//! Every request passes through three gates, in order:
//! 1. the circuit breaker (refuses everything after an auth failure)
//! 2. a semaphore bounding in-flight requests (FIFO queueing, no rejection)
//! 3. an optional requests-per-minute spacing limiter
//!
//! Transient failures are retried with capped exponential backoff. The permit
//! is released while backing off so a throttled request does not starve its
//! siblings.

use chrono::NaiveDate;
use futures::future::join_all;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::circuit_breaker::CircuitBreaker;
use super::provider::{DataError, DataKind, DataProvider, FilingWindow, PricePoint};
use super::rate_limit::RateLimiter;
use crate::domain::FinancialFiling;

/// Capped exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Add up to 25% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows failed attempt number `attempt`
    /// (1-based). A provider hint raises the delay but never past the cap.
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let exp = attempt.saturating_sub(1).min(30);
        let mut delay = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);
        if let Some(hint) = hint {
            delay = delay.max(hint.min(self.max_delay));
        }
        if self.jitter && !delay.is_zero() {
            let factor = rand::thread_rng().gen_range(0.0..0.25);
            delay = delay.mul_f64(1.0 + factor).min(self.max_delay);
        }
        delay
    }
}

/// Fetcher knobs. Scoped to one run, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetcherConfig {
    pub max_in_flight: usize,
    pub requests_per_minute: Option<u32>,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    /// Trading days to walk back when the slice date has no close.
    pub price_lookback_days: u32,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 20,
            requests_per_minute: None,
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(10),
            price_lookback_days: 3,
        }
    }
}

/// Identity of a request; results are keyed by it, not by submission order.
///
/// A filings request is identified by its whole window, so two windows that
/// share an end date stay distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FetchKey {
    Price { symbol: String, date: NaiveDate },
    Filings { symbol: String, window: FilingWindow },
}

impl FetchKey {
    pub fn price(symbol: &str, date: NaiveDate) -> Self {
        FetchKey::Price {
            symbol: symbol.to_string(),
            date,
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            FetchKey::Price { symbol, .. } | FetchKey::Filings { symbol, .. } => symbol,
        }
    }

    pub fn kind(&self) -> DataKind {
        match self {
            FetchKey::Price { .. } => DataKind::Price,
            FetchKey::Filings { .. } => DataKind::Filings,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchRequest {
    Price { symbol: String, date: NaiveDate },
    Filings { symbol: String, window: FilingWindow },
}

impl FetchRequest {
    pub fn key(&self) -> FetchKey {
        match self {
            FetchRequest::Price { symbol, date } => FetchKey::Price {
                symbol: symbol.clone(),
                date: *date,
            },
            FetchRequest::Filings { symbol, window } => FetchKey::Filings {
                symbol: symbol.clone(),
                window: *window,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchResponse {
    Price(PricePoint),
    Filings(Vec<FinancialFiling>),
}

#[derive(Debug, Default)]
struct FetchStats {
    requests: AtomicU64,
    retries: AtomicU64,
    exhausted: AtomicU64,
    fatal: AtomicU64,
}

/// Point-in-time copy of the fetcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchStatsSnapshot {
    /// Attempts that reached the provider.
    pub requests: u64,
    pub retries: u64,
    /// Requests that failed after exhausting their retries.
    pub exhausted: u64,
    /// Requests that failed without retry.
    pub fatal: u64,
}

pub struct RateLimitedFetcher {
    provider: Arc<dyn DataProvider>,
    permits: Semaphore,
    limiter: Option<RateLimiter>,
    breaker: CircuitBreaker,
    config: FetcherConfig,
    stats: FetchStats,
}

impl RateLimitedFetcher {
    pub fn new(provider: Arc<dyn DataProvider>, config: FetcherConfig) -> Self {
        Self {
            provider,
            permits: Semaphore::new(config.max_in_flight.max(1)),
            limiter: config.requests_per_minute.map(RateLimiter::per_minute),
            breaker: CircuitBreaker::default_provider(),
            config,
            stats: FetchStats::default(),
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn stats(&self) -> FetchStatsSnapshot {
        FetchStatsSnapshot {
            requests: self.stats.requests.load(Ordering::Relaxed),
            retries: self.stats.retries.load(Ordering::Relaxed),
            exhausted: self.stats.exhausted.load(Ordering::Relaxed),
            fatal: self.stats.fatal.load(Ordering::Relaxed),
        }
    }

    pub async fn fetch_price(&self, symbol: &str, date: NaiveDate) -> Result<PricePoint, DataError> {
        let lookback = self.config.price_lookback_days;
        let label = format!("{symbol}/price@{date}");
        self.execute(&label, || self.provider.fetch_price(symbol, date, lookback))
            .await
    }

    pub async fn fetch_filings(
        &self,
        symbol: &str,
        window: FilingWindow,
    ) -> Result<Vec<FinancialFiling>, DataError> {
        let label = format!("{symbol}/filings{window}");
        self.execute(&label, || self.provider.fetch_filings(symbol, window))
            .await
    }

    pub async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, DataError> {
        match request {
            FetchRequest::Price { symbol, date } => {
                self.fetch_price(symbol, *date).await.map(FetchResponse::Price)
            }
            FetchRequest::Filings { symbol, window } => self
                .fetch_filings(symbol, *window)
                .await
                .map(FetchResponse::Filings),
        }
    }

    /// Run a batch concurrently under the fetcher's bounds.
    ///
    /// One failure never aborts its siblings. Only identical requests share
    /// a key; they collapse to the last result.
    pub async fn fetch_batch(
        &self,
        requests: Vec<FetchRequest>,
    ) -> HashMap<FetchKey, Result<FetchResponse, DataError>> {
        let futures = requests.iter().map(|req| async move {
            let result = self.fetch(req).await;
            (req.key(), result)
        });
        join_all(futures).await.into_iter().collect()
    }

    /// Execute a single logical request with breaker, permits, rate limit,
    /// timeout and retry.
    async fn execute<T, F, Fut>(&self, label: &str, mut call: F) -> Result<T, DataError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DataError>>,
    {
        let policy = &self.config.retry;
        let mut attempt = 0u32;

        loop {
            if !self.breaker.is_allowed() {
                self.stats.fatal.fetch_add(1, Ordering::Relaxed);
                return Err(DataError::CircuitBreakerTripped);
            }
            attempt += 1;

            let outcome = {
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|_| DataError::NetworkUnreachable("fetcher shut down".into()))?;
                if let Some(limiter) = &self.limiter {
                    limiter.acquire().await;
                }
                self.stats.requests.fetch_add(1, Ordering::Relaxed);
                match tokio::time::timeout(self.config.request_timeout, call()).await {
                    Ok(result) => result,
                    Err(_) => Err(DataError::Timeout(self.config.request_timeout)),
                }
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_transient() {
                if err.is_provider_wide() {
                    warn!("{label}: {err}; tripping circuit breaker");
                    self.breaker.trip();
                }
                self.stats.fatal.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }

            if attempt >= policy.max_attempts.max(1) {
                self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
                warn!("{label}: giving up after {attempt} attempts: {err}");
                return Err(DataError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = policy.delay_for(attempt, err.retry_after());
            self.stats.retries.fetch_add(1, Ordering::Relaxed);
            debug!(
                "{label}: attempt {attempt}/{} failed: {err}; retrying in {delay:?}",
                policy.max_attempts
            );
            tokio::time::sleep(delay).await;
        }
    }
}
