//! Backtest runner: wires fetcher, filing cache, slice builder and engine.
//!
//! `run_backtest()` is the entry point used by the CLI. The caller supplies
//! the provider, universe and selector; everything else comes from the
//! [`BacktestConfig`]. When the config names a cache snapshot it is loaded
//! before the first slice and written back after the run, whether the run
//! completed or failed.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use fundlab_core::data::{
    CacheError, CacheSnapshot, DataProvider, FetchStatsSnapshot, FinancialFilingCache,
    RateLimitedFetcher, UniverseSource,
};

use crate::builder::TimeSliceBuilder;
use crate::config::{BacktestConfig, ConfigError, RunId};
use crate::engine::{BacktestEngine, RunFailure, SliceReport};
use crate::metrics::TrajectorySummary;
use crate::selector::{LineItemScorer, SectorLeaders, Selector};
use crate::trajectory::PortfolioTrajectory;

/// Errors from the runner.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("filing cache: {0}")]
    Cache(#[from] CacheError),
    #[error("backtest failed: {0}")]
    Engine(#[from] RunFailure),
}

/// Current schema version for persisted artifacts.
pub const SCHEMA_VERSION: u32 = 1;

/// Complete result of one backtest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub run_id: RunId,
    pub config: BacktestConfig,
    pub provider: String,
    pub selector: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub universe_size: usize,
    pub summary: TrajectorySummary,
    pub trajectory: PortfolioTrajectory,
    /// BLAKE3 of the trajectory points; equal runs share a fingerprint.
    pub trajectory_fingerprint: String,
    pub reports: Vec<SliceReport>,
    pub fetch_stats: FetchStatsSnapshot,
    /// Highest number of times any single filing was requested.
    pub max_filing_fetches: u32,
    pub cached_filings: usize,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl BacktestResult {
    /// Warnings across all slices.
    pub fn warning_count(&self) -> usize {
        self.reports.iter().map(|r| r.warnings.len()).sum()
    }
}

/// The selector a config describes: top scorers per sector by one line item.
pub fn default_selector(config: &BacktestConfig) -> SectorLeaders {
    SectorLeaders::new(
        LineItemScorer::new(config.selector.line_item.clone()),
        config.selector.per_sector,
        config.backtest.num_stocks,
    )
}

/// Run one backtest end to end.
pub async fn run_backtest(
    config: &BacktestConfig,
    provider: Arc<dyn DataProvider>,
    universe: Arc<dyn UniverseSource>,
    selector: Arc<dyn Selector>,
) -> Result<BacktestResult, RunError> {
    config.validate()?;
    let run_id = config.run_id()?;
    let provider_name = provider.name().to_string();
    let selector_name = selector.name().to_string();

    let fetcher = Arc::new(RateLimitedFetcher::new(provider, config.fetcher_config()));
    let cache = Arc::new(open_cache(config, Arc::clone(&fetcher))?);
    let builder = TimeSliceBuilder::new(Arc::clone(&fetcher), Arc::clone(&cache));
    let mut engine = BacktestEngine::new(universe, builder, selector, config.engine_config());

    info!(
        run_id = %&run_id[..12],
        provider = %provider_name,
        selector = %selector_name,
        start = %config.backtest.start,
        end = %config.backtest.end,
        "starting backtest"
    );

    let outcome = engine
        .backtest(config.backtest.start, config.backtest.end)
        .await;

    let snapshot = cache.snapshot().await;
    let cached_filings = snapshot.filing_count();
    if let Some(path) = &config.cache.snapshot {
        match snapshot.write(path) {
            Ok(()) => info!(path = %path.display(), filings = cached_filings, "cache snapshot written"),
            Err(e) if outcome.is_err() => {
                warn!(path = %path.display(), error = %e, "cache snapshot not written")
            }
            Err(e) => return Err(e.into()),
        }
    }

    let run = outcome?;
    let trajectory_fingerprint = run.trajectory.fingerprint();
    Ok(BacktestResult {
        schema_version: SCHEMA_VERSION,
        run_id,
        config: config.clone(),
        provider: provider_name,
        selector: selector_name,
        start_date: config.backtest.start,
        end_date: config.backtest.end,
        universe_size: run.universe_size,
        summary: run.summary,
        trajectory: run.trajectory,
        trajectory_fingerprint,
        reports: run.reports,
        fetch_stats: run.fetch_stats,
        max_filing_fetches: cache.max_fetch_count(),
        cached_filings,
    })
}

fn open_cache(
    config: &BacktestConfig,
    fetcher: Arc<RateLimitedFetcher>,
) -> Result<FinancialFilingCache, RunError> {
    let cache_config = config.cache_config();
    match &config.cache.snapshot {
        Some(path) if path.exists() => {
            let snapshot = CacheSnapshot::read(path)?;
            info!(
                path = %path.display(),
                filings = snapshot.filing_count(),
                "restoring filing cache"
            );
            Ok(FinancialFilingCache::with_snapshot(fetcher, cache_config, snapshot)?)
        }
        _ => Ok(FinancialFilingCache::new(fetcher, cache_config)),
    }
}
