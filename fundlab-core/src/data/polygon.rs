//! Polygon.io data provider.
//!
//! Daily closes come from the aggregates endpoint, quarterly filings from
//! the financials reference endpoint. This provider performs exactly one HTTP
//! request per call: retries, throttling and the circuit breaker live in
//! [`RateLimitedFetcher`](super::fetcher::RateLimitedFetcher).

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::provider::{DataError, DataProvider, FilingWindow, PricePoint};
use crate::domain::FinancialFiling;

pub const DEFAULT_BASE_URL: &str = "https://api.polygon.io";

/// Page size used when a filing window has no limit of its own.
const MAX_FILINGS_PER_REQUEST: usize = 100;

/// `/v2/aggs/...` response.
#[derive(Debug, Deserialize)]
struct AggsResponse {
    #[serde(default)]
    results: Vec<AggBar>,
}

#[derive(Debug, Deserialize)]
struct AggBar {
    /// Close.
    c: f64,
    /// Bar start, Unix milliseconds.
    t: i64,
}

/// `/vX/reference/financials` response.
#[derive(Debug, Deserialize)]
struct FinancialsResponse {
    #[serde(default)]
    results: Vec<FinancialsResult>,
}

#[derive(Debug, Deserialize)]
struct FinancialsResult {
    end_date: NaiveDate,
    start_date: Option<NaiveDate>,
    filing_date: Option<NaiveDate>,
    #[serde(default)]
    fiscal_period: String,
    fiscal_year: Option<String>,
    #[serde(default)]
    financials: BTreeMap<String, BTreeMap<String, LineItemValue>>,
}

#[derive(Debug, Deserialize)]
struct LineItemValue {
    value: Option<f64>,
}

pub struct PolygonProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    timeout: Duration,
}

impl PolygonProvider {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Result<Self, DataError> {
        Self::with_base_url(api_key, DEFAULT_BASE_URL, timeout)
    }

    pub fn with_base_url(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, DataError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("fundlab/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DataError::NetworkUnreachable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn price_url(&self, symbol: &str, from: NaiveDate, to: NaiveDate) -> String {
        format!(
            "{}/v2/aggs/ticker/{symbol}/range/1/day/{from}/{to}\
             ?adjusted=true&sort=asc&apiKey={}",
            self.base_url, self.api_key
        )
    }

    fn filings_url(&self, symbol: &str, window: &FilingWindow) -> String {
        let limit = window.limit.unwrap_or(MAX_FILINGS_PER_REQUEST);
        let mut url = format!(
            "{}/vX/reference/financials?ticker={symbol}&timeframe=quarterly\
             &period_of_report_date.lte={}",
            self.base_url, window.through
        );
        if let Some(after) = window.after {
            url.push_str(&format!("&period_of_report_date.gt={after}"));
        }
        url.push_str(&format!(
            "&limit={limit}&sort=period_of_report_date&order=desc&apiKey={}",
            self.api_key
        ));
        url
    }

    async fn get_json<T: DeserializeOwned>(&self, symbol: &str, url: &str) -> Result<T, DataError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        if let Some(err) = classify_status(status, retry_after, symbol) {
            return Err(err);
        }

        let body = resp.text().await.map_err(|e| self.transport_error(e))?;
        serde_json::from_str(&body).map_err(|e| {
            DataError::MalformedResponse(format!("failed to parse response for {symbol}: {e}"))
        })
    }

    fn transport_error(&self, e: reqwest::Error) -> DataError {
        if e.is_timeout() {
            DataError::Timeout(self.timeout)
        } else {
            DataError::NetworkUnreachable(e.to_string())
        }
    }
}

/// Map a non-success HTTP status to its error class. `None` for 2xx.
fn classify_status(status: u16, retry_after_secs: Option<u64>, symbol: &str) -> Option<DataError> {
    match status {
        200..=299 => None,
        401 | 403 => Some(DataError::AuthenticationRequired(format!(
            "polygon rejected the API key (HTTP {status})"
        ))),
        404 => Some(DataError::SymbolNotFound {
            symbol: symbol.to_string(),
        }),
        429 => Some(DataError::RateLimited {
            retry_after_secs: retry_after_secs.unwrap_or(60),
        }),
        500..=599 => Some(DataError::ServerError { status }),
        _ => Some(DataError::MalformedResponse(format!(
            "unexpected HTTP {status} for {symbol}"
        ))),
    }
}

/// Last close in the aggregates response.
fn parse_price(
    symbol: &str,
    date: NaiveDate,
    lookback_days: u32,
    body: AggsResponse,
) -> Result<PricePoint, DataError> {
    let bar = body
        .results
        .into_iter()
        .filter(|b| b.c.is_finite())
        .max_by_key(|b| b.t)
        .ok_or_else(|| DataError::PriceNotFound {
            symbol: symbol.to_string(),
            date,
            lookback_days,
        })?;
    let bar_date = chrono::DateTime::from_timestamp_millis(bar.t)
        .map(|dt| dt.naive_utc().date())
        .ok_or_else(|| DataError::MalformedResponse(format!("invalid timestamp: {}", bar.t)))?;
    Ok(PricePoint {
        date: bar_date,
        close: bar.c,
    })
}

/// Filings in ascending period order, line items flattened to
/// `statement.item` keys.
fn parse_filings(
    symbol: &str,
    window: &FilingWindow,
    body: FinancialsResponse,
) -> Vec<FinancialFiling> {
    let mut filings: Vec<FinancialFiling> = body
        .results
        .into_iter()
        .filter(|r| {
            let inside = window.contains(r.end_date);
            if !inside {
                warn!("{symbol}: provider returned filing {} outside {window}", r.end_date);
            }
            inside
        })
        .map(|r| {
            let mut filing = FinancialFiling::new(symbol, r.end_date, r.fiscal_period);
            filing.period_start = r.start_date;
            filing.filing_date = r.filing_date;
            filing.fiscal_year = r.fiscal_year.and_then(|y| y.parse().ok());
            for (statement, items) in r.financials {
                for (item, v) in items {
                    filing
                        .line_items
                        .insert(format!("{statement}.{item}"), v.value);
                }
            }
            filing
        })
        .collect();
    filings.sort_by_key(|f| f.period_end);
    filings.dedup_by_key(|f| f.period_end);
    filings
}

#[async_trait]
impl DataProvider for PolygonProvider {
    fn name(&self) -> &str {
        "polygon"
    }

    async fn fetch_price(
        &self,
        symbol: &str,
        date: NaiveDate,
        lookback_days: u32,
    ) -> Result<PricePoint, DataError> {
        let from = date - ChronoDuration::days(i64::from(lookback_days.max(1)) - 1);
        let url = self.price_url(symbol, from, date);
        debug!("{symbol}: GET price {from}..={date}");
        let body: AggsResponse = self.get_json(symbol, &url).await?;
        parse_price(symbol, date, lookback_days, body)
    }

    async fn fetch_filings(
        &self,
        symbol: &str,
        window: FilingWindow,
    ) -> Result<Vec<FinancialFiling>, DataError> {
        let url = self.filings_url(symbol, &window);
        debug!("{symbol}: GET filings {window}");
        let body: FinancialsResponse = self.get_json(symbol, &url).await?;
        Ok(parse_filings(symbol, &window, body))
    }
}
