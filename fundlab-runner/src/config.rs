//! Serializable backtest configuration.
//!
//! A run is described by one TOML document:
//!
//! ```toml
//! [backtest]
//! start = "2020-01-01"
//! end = "2021-12-01"
//! num_stocks = 5
//!
//! [fetch]
//! max_in_flight = 20
//! requests_per_minute = 300
//!
//! [cache]
//! snapshot = "filings.json"
//!
//! [selector]
//! line_item = "income_statement.basic_earnings_per_share"
//! ```
//!
//! Every section except `[backtest]` is optional.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use fundlab_core::data::{CacheConfig, FetcherConfig, RetryPolicy};
use fundlab_core::domain::line_items;

use crate::engine::EngineConfig;

/// Unique identifier for a backtest run (content-addressable hash).
pub type RunId = String;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("parse config TOML: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub backtest: BacktestSection,
    #[serde(default)]
    pub fetch: FetchSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub selector: SelectorSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestSection {
    /// First slice date.
    pub start: NaiveDate,
    /// Last possible slice date (inclusive).
    pub end: NaiveDate,
    #[serde(default = "default_num_stocks")]
    pub num_stocks: usize,
    #[serde(default = "default_initial_capital")]
    pub initial_capital: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchSection {
    pub max_in_flight: usize,
    pub requests_per_minute: Option<u32>,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
    pub request_timeout_secs: u64,
    pub price_lookback_days: u32,
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            max_in_flight: 20,
            requests_per_minute: None,
            max_attempts: 4,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: true,
            request_timeout_secs: 10,
            price_lookback_days: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub initial_filings: usize,
    /// Opt-in fetch shortcut, off by default. A positive value hides any
    /// period that ends sooner than this after the previous one.
    pub min_period_gap_days: i64,
    pub snapshot: Option<PathBuf>,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            initial_filings: 2,
            min_period_gap_days: 0,
            snapshot: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorSection {
    pub line_item: String,
    pub per_sector: usize,
}

impl Default for SelectorSection {
    fn default() -> Self {
        Self {
            line_item: line_items::BASIC_EPS.to_string(),
            per_sector: 1,
        }
    }
}

fn default_num_stocks() -> usize {
    5
}

fn default_initial_capital() -> f64 {
    1.0
}

impl BacktestConfig {
    /// Defaults for everything but the date range.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            backtest: BacktestSection {
                start,
                end,
                num_stocks: default_num_stocks(),
                initial_capital: default_initial_capital(),
            },
            fetch: FetchSection::default(),
            cache: CacheSection::default(),
            selector: SelectorSection::default(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let b = &self.backtest;
        if b.start > b.end {
            return Err(ConfigError::Invalid(format!(
                "start {} is after end {}",
                b.start, b.end
            )));
        }
        if b.num_stocks == 0 {
            return Err(ConfigError::Invalid("num_stocks must be at least 1".into()));
        }
        if !(b.initial_capital.is_finite() && b.initial_capital > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "initial_capital must be positive, got {}",
                b.initial_capital
            )));
        }
        let f = &self.fetch;
        if f.max_in_flight == 0 {
            return Err(ConfigError::Invalid("max_in_flight must be at least 1".into()));
        }
        if f.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_secs must be at least 1".into(),
            ));
        }
        if f.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        if f.requests_per_minute == Some(0) {
            return Err(ConfigError::Invalid(
                "requests_per_minute must be at least 1 when set".into(),
            ));
        }
        if f.max_delay_ms < f.base_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "max_delay_ms ({}) is below base_delay_ms ({})",
                f.max_delay_ms, f.base_delay_ms
            )));
        }
        if self.cache.min_period_gap_days < 0 {
            return Err(ConfigError::Invalid(format!(
                "min_period_gap_days must not be negative, got {}",
                self.cache.min_period_gap_days
            )));
        }
        if self.selector.per_sector == 0 {
            return Err(ConfigError::Invalid("per_sector must be at least 1".into()));
        }
        Ok(())
    }

    /// Deterministic hash of the canonical JSON form.
    pub fn run_id(&self) -> Result<RunId, ConfigError> {
        let json = serde_json::to_string(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        let f = &self.fetch;
        FetcherConfig {
            max_in_flight: f.max_in_flight,
            requests_per_minute: f.requests_per_minute,
            retry: RetryPolicy {
                max_attempts: f.max_attempts,
                base_delay: Duration::from_millis(f.base_delay_ms),
                max_delay: Duration::from_millis(f.max_delay_ms),
                jitter: f.jitter,
            },
            request_timeout: Duration::from_secs(f.request_timeout_secs),
            price_lookback_days: f.price_lookback_days,
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            initial_filings: self.cache.initial_filings,
            min_period_gap_days: self.cache.min_period_gap_days,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            initial_capital: self.backtest.initial_capital,
        }
    }
}
