//! Backtest engine: the monthly rebalance loop.
//!
//! ```text
//! Initialized ──► Running ──► Completed
//!                    │
//!                    └──────► Failed
//! ```
//!
//! Per slice: build the slice, run the selector, validate and allocate,
//! realize the return of the holdings carried from the previous slice, then
//! rebalance into the new allocation and append to the trajectory. Slices
//! run strictly in sequence; fetches inside a slice run concurrently.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use fundlab_core::data::{FetchStatsSnapshot, UniverseError, UniverseSource};
use fundlab_core::domain::{monthly_schedule, ScheduleError, TimeSlice};

use crate::builder::{SliceError, SliceWarning, TimeSliceBuilder};
use crate::metrics::TrajectorySummary;
use crate::selector::{allocate, Selector, SelectorError};
use crate::trajectory::{Holding, PortfolioTrajectory, TrajectoryError, TrajectoryPoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EngineState {
    Initialized,
    Running { slice_index: usize, total: usize },
    Completed,
    Failed,
}

impl EngineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineState::Completed | EngineState::Failed)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("universe resolution failed: {0}")]
    Universe(#[from] UniverseError),

    #[error("invalid schedule: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("slice {date} failed: {source}")]
    Slice {
        date: NaiveDate,
        #[source]
        source: SliceError,
    },

    #[error("selector failed on {date}: {source}")]
    Selector {
        date: NaiveDate,
        #[source]
        source: SelectorError,
    },

    #[error(transparent)]
    Trajectory(#[from] TrajectoryError),

    #[error("engine already finished ({0:?})")]
    AlreadyFinished(EngineState),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub initial_capital: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_capital: 1.0,
        }
    }
}

/// What happened while processing one slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceReport {
    pub date: NaiveDate,
    pub tickers: usize,
    pub covered: usize,
    pub selected: usize,
    pub warnings: Vec<SliceWarning>,
}

#[derive(Debug, Clone)]
pub struct BacktestRun {
    /// Tickers in the loaded universe, before any per-slice drops.
    pub universe_size: usize,
    pub trajectory: PortfolioTrajectory,
    pub summary: TrajectorySummary,
    pub reports: Vec<SliceReport>,
    pub fetch_stats: FetchStatsSnapshot,
}

/// A failed run, with the trajectory up to the last completed slice.
#[derive(Debug)]
pub struct RunFailure {
    pub error: EngineError,
    pub trajectory: PortfolioTrajectory,
    pub reports: Vec<SliceReport>,
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (trajectory truncated at {} slices)",
            self.error,
            self.trajectory.len()
        )
    }
}

impl std::error::Error for RunFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Holdings carried between slices plus uninvested cash.
#[derive(Debug, Default)]
struct Book {
    holdings: Vec<Holding>,
    cash: f64,
}

impl Book {
    /// Mark to `slice` prices. Held symbols missing from the slice are valued
    /// at their entry price and returned as liquidated.
    fn mark(&self, slice: &TimeSlice) -> (f64, Vec<String>) {
        let mut value = self.cash;
        let mut liquidated = Vec::new();
        for h in &self.holdings {
            let price = match slice.price(&h.symbol) {
                Some(p) => p,
                None => {
                    liquidated.push(h.symbol.clone());
                    h.entry_price
                }
            };
            value += h.shares * price;
        }
        (value, liquidated)
    }

    /// Rebalance `value` into `allocation` at `slice` prices.
    fn rebalance(value: f64, allocation: &[(String, f64)], slice: &TimeSlice) -> Self {
        let holdings: Vec<Holding> = allocation
            .iter()
            .filter_map(|(symbol, weight)| {
                slice.price(symbol).map(|price| Holding {
                    symbol: symbol.clone(),
                    weight: *weight,
                    shares: value * weight / price,
                    entry_price: price,
                })
            })
            .collect();
        let invested: f64 = holdings.iter().map(|h| h.weight).sum();
        Self {
            holdings,
            cash: value * (1.0 - invested).max(0.0),
        }
    }
}

pub struct BacktestEngine {
    universe: Arc<dyn UniverseSource>,
    builder: TimeSliceBuilder,
    selector: Arc<dyn Selector>,
    config: EngineConfig,
    state: EngineState,
}

impl BacktestEngine {
    pub fn new(
        universe: Arc<dyn UniverseSource>,
        builder: TimeSliceBuilder,
        selector: Arc<dyn Selector>,
        config: EngineConfig,
    ) -> Self {
        Self {
            universe,
            builder,
            selector,
            config,
            state: EngineState::Initialized,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn builder(&self) -> &TimeSliceBuilder {
        &self.builder
    }

    /// Run monthly slices from `start` through `end` inclusive.
    ///
    /// The universe and schedule are resolved before any market data is
    /// requested. An engine runs once; a finished engine rejects re-runs.
    pub async fn backtest(
        &mut self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<BacktestRun, RunFailure> {
        if self.state != EngineState::Initialized {
            return Err(RunFailure {
                error: EngineError::AlreadyFinished(self.state),
                trajectory: PortfolioTrajectory::new(),
                reports: Vec::new(),
            });
        }

        let mut trajectory = PortfolioTrajectory::new();
        let mut reports = Vec::new();
        match self.run(start, end, &mut trajectory, &mut reports).await {
            Ok(universe_size) => {
                self.state = EngineState::Completed;
                let summary = TrajectorySummary::compute(&trajectory);
                info!(
                    "backtest completed: {} slices, total return {:.2}%",
                    trajectory.len(),
                    summary.total_return * 100.0
                );
                Ok(BacktestRun {
                    universe_size,
                    trajectory,
                    summary,
                    reports,
                    fetch_stats: self.builder.fetcher().stats(),
                })
            }
            Err(error) => {
                self.state = EngineState::Failed;
                warn!(
                    "backtest failed after {} slices: {error}",
                    trajectory.len()
                );
                Err(RunFailure {
                    error,
                    trajectory,
                    reports,
                })
            }
        }
    }

    async fn run(
        &mut self,
        start: NaiveDate,
        end: NaiveDate,
        trajectory: &mut PortfolioTrajectory,
        reports: &mut Vec<SliceReport>,
    ) -> Result<usize, EngineError> {
        let universe = self.universe.load().await?;
        if universe.is_empty() {
            return Err(UniverseError::Empty.into());
        }
        let dates = monthly_schedule(start, end)?;
        info!(
            "backtest {start}..={end}: {} slices over {} tickers with {}",
            dates.len(),
            universe.len(),
            self.selector.name()
        );

        let mut book = Book {
            holdings: Vec::new(),
            cash: self.config.initial_capital,
        };
        let total = dates.len();

        for (slice_index, date) in dates.into_iter().enumerate() {
            self.state = EngineState::Running { slice_index, total };

            let built = self
                .builder
                .build(date, &universe)
                .await
                .map_err(|source| EngineError::Slice { date, source })?;
            let slice = built.slice;

            let selection = self
                .selector
                .select(&slice)
                .await
                .map_err(|source| EngineError::Selector { date, source })?;
            let allocation = allocate(&selection, &slice)
                .map_err(|source| EngineError::Selector { date, source })?;

            let (value, liquidated) = book.mark(&slice);
            for symbol in &liquidated {
                warn!("{date}: {symbol} missing from slice, liquidated at entry price");
            }
            let period_return = match trajectory.last() {
                Some(prev) if prev.value > 0.0 => value / prev.value - 1.0,
                _ => 0.0,
            };

            book = Book::rebalance(value, &allocation, &slice);
            trajectory.push(TrajectoryPoint {
                date,
                period_return,
                value,
                holdings: book.holdings.clone(),
                liquidated,
            })?;

            info!(
                "slice {}/{total} {date}: {} tickers, {} covered, {} selected, value {value:.4}",
                slice_index + 1,
                slice.len(),
                slice.covered_count(),
                allocation.len()
            );
            reports.push(SliceReport {
                date,
                tickers: slice.len(),
                covered: slice.covered_count(),
                selected: allocation.len(),
                warnings: built.warnings,
            });
        }
        Ok(universe.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::Selection;
    use async_trait::async_trait;
    use fundlab_core::data::{
        CacheConfig, FetcherConfig, FinancialFilingCache, InMemoryProvider, RateLimitedFetcher,
        StaticUniverse,
    };
    use fundlab_core::domain::Ticker;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    struct HoldAll;

    #[async_trait]
    impl Selector for HoldAll {
        fn name(&self) -> &str {
            "hold_all"
        }

        async fn select(&self, slice: &TimeSlice) -> Result<Selection, SelectorError> {
            Ok(Selection::equal(slice.symbols()))
        }
    }

    struct PickMissing;

    #[async_trait]
    impl Selector for PickMissing {
        fn name(&self) -> &str {
            "pick_missing"
        }

        async fn select(&self, _slice: &TimeSlice) -> Result<Selection, SelectorError> {
            Ok(Selection::equal(["NOPE"]))
        }
    }

    fn engine(
        provider: InMemoryProvider,
        tickers: Vec<Ticker>,
        selector: Arc<dyn Selector>,
    ) -> (Arc<InMemoryProvider>, BacktestEngine) {
        let provider = Arc::new(provider);
        let fetcher = Arc::new(RateLimitedFetcher::new(
            provider.clone(),
            FetcherConfig::default(),
        ));
        let cache = Arc::new(FinancialFilingCache::new(
            fetcher.clone(),
            CacheConfig::default(),
        ));
        let engine = BacktestEngine::new(
            Arc::new(StaticUniverse(tickers)),
            TimeSliceBuilder::new(fetcher, cache),
            selector,
            EngineConfig::default(),
        );
        (provider, engine)
    }

    #[tokio::test(start_paused = true)]
    async fn returns_compound_over_slices() {
        let provider = InMemoryProvider::new()
            .with_price("A", d(2020, 1, 1), 10.0)
            .with_price("A", d(2020, 2, 1), 11.0)
            .with_price("A", d(2020, 3, 1), 12.1);
        let (_, mut engine) = engine(
            provider,
            vec![Ticker::new("A", "Technology")],
            Arc::new(HoldAll),
        );

        let run = engine.backtest(d(2020, 1, 1), d(2020, 3, 1)).await.unwrap();
        assert_eq!(engine.state(), EngineState::Completed);
        let values = run.trajectory.values();
        assert_eq!(values.len(), 3);
        assert!((values[1] - 1.1).abs() < 1e-12);
        assert!((values[2] - 1.21).abs() < 1e-12);
        assert!((run.summary.total_return - 0.21).abs() < 1e-12);
        assert_eq!(run.trajectory.points()[0].period_return, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_holding_is_valued_at_entry() {
        let provider = InMemoryProvider::new()
            .with_price("A", d(2020, 1, 1), 10.0)
            .with_price("B", d(2020, 1, 1), 10.0)
            .with_price("A", d(2020, 2, 1), 20.0);
        let (_, mut engine) = engine(
            provider,
            vec![Ticker::new("A", "Technology"), Ticker::new("B", "Energy")],
            Arc::new(HoldAll),
        );

        let run = engine.backtest(d(2020, 1, 1), d(2020, 2, 1)).await.unwrap();
        assert_eq!(run.universe_size, 2);
        assert_eq!(run.reports[1].tickers, 1);
        let feb = &run.trajectory.points()[1];
        // A doubled on half the book; B held flat at entry.
        assert!((feb.value - 1.5).abs() < 1e-12);
        assert_eq!(feb.liquidated, vec!["B".to_string()]);
        assert_eq!(feb.holdings.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_selection_fails_the_run() {
        let provider = InMemoryProvider::new().with_price("A", d(2020, 1, 1), 10.0);
        let (_, mut engine) = engine(
            provider,
            vec![Ticker::new("A", "Technology")],
            Arc::new(PickMissing),
        );
        let failure = engine
            .backtest(d(2020, 1, 1), d(2020, 3, 1))
            .await
            .unwrap_err();
        assert!(matches!(
            failure.error,
            EngineError::Selector {
                source: SelectorError::UnknownSymbol { .. },
                ..
            }
        ));
        assert!(failure.trajectory.is_empty());
        assert_eq!(engine.state(), EngineState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_engine_rejects_rerun() {
        let provider = InMemoryProvider::new().with_price("A", d(2020, 1, 1), 10.0);
        let (provider, mut engine) = engine(
            provider,
            vec![Ticker::new("A", "Technology")],
            Arc::new(HoldAll),
        );
        engine.backtest(d(2020, 1, 1), d(2020, 1, 1)).await.unwrap();
        let calls = provider.price_calls();

        let failure = engine
            .backtest(d(2020, 1, 1), d(2020, 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(
            failure.error,
            EngineError::AlreadyFinished(EngineState::Completed)
        ));
        assert_eq!(provider.price_calls(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn inverted_range_fails_before_fetching() {
        let (provider, mut engine) = engine(
            InMemoryProvider::new(),
            vec![Ticker::new("A", "Technology")],
            Arc::new(HoldAll),
        );
        let failure = engine
            .backtest(d(2021, 1, 1), d(2020, 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(failure.error, EngineError::Schedule(_)));
        assert_eq!(provider.price_calls() + provider.filing_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_selection_holds_cash() {
        let provider = InMemoryProvider::new()
            .with_price("A", d(2020, 1, 1), 10.0)
            .with_price("A", d(2020, 2, 1), 5.0);
        let (_, mut engine) = engine(
            provider,
            vec![Ticker::new("A", "Technology")],
            Arc::new(PickNothing),
        );
        let run = engine.backtest(d(2020, 1, 1), d(2020, 2, 1)).await.unwrap();
        assert_eq!(run.trajectory.values(), vec![1.0, 1.0]);
        assert!(run.trajectory.points().iter().all(|p| p.holdings.is_empty()));
    }

    struct PickNothing;

    #[async_trait]
    impl Selector for PickNothing {
        fn name(&self) -> &str {
            "pick_nothing"
        }

        async fn select(&self, _slice: &TimeSlice) -> Result<Selection, SelectorError> {
            Ok(Selection::default())
        }
    }
}
