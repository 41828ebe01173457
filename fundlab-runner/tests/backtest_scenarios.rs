//! End-to-end backtests against the in-memory provider.
//!
//! Each test wires the real fetcher, filing cache, slice builder and engine
//! through `run_backtest` and asserts on what the provider actually saw.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Months, NaiveDate};

use fundlab_core::data::{
    DataError, DataKind, FinancialFilingCache, InMemoryProvider, RateLimitedFetcher,
    StaticUniverse,
};
use fundlab_core::domain::{line_items, FinancialFiling, Ticker, TimeSlice};
use fundlab_runner::{
    default_selector, run_backtest, BacktestConfig, BacktestEngine, EngineConfig, EngineState,
    RunError, Selection, Selector, SelectorError, SliceWarning, TimeSliceBuilder,
};

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn months(start: NaiveDate, n: u32) -> Vec<NaiveDate> {
    (0..n)
        .map(|i| start.checked_add_months(Months::new(i)).unwrap())
        .collect()
}

fn quarter_ends(from_year: i32, to_year: i32) -> Vec<NaiveDate> {
    (from_year..=to_year)
        .flat_map(|y| [d(y, 3, 31), d(y, 6, 30), d(y, 9, 30), d(y, 12, 31)])
        .collect()
}

fn fast_config(start: NaiveDate, end: NaiveDate) -> BacktestConfig {
    let mut config = BacktestConfig::new(start, end);
    config.fetch.base_delay_ms = 1;
    config.fetch.max_delay_ms = 2;
    config.fetch.jitter = false;
    config
}

fn universe(symbols: &[&str]) -> Arc<StaticUniverse> {
    Arc::new(StaticUniverse(
        symbols.iter().map(|s| Ticker::new(*s, "Tech")).collect(),
    ))
}

#[derive(Debug, Clone, PartialEq)]
struct Seen {
    date: NaiveDate,
    symbol: String,
    current: Option<NaiveDate>,
    last: Option<NaiveDate>,
}

/// Holds every ticker in the slice, equal weight, and records what it saw.
#[derive(Default)]
struct HoldAll {
    seen: Mutex<Vec<Seen>>,
}

impl HoldAll {
    fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    fn on(&self, date: NaiveDate) -> Vec<Seen> {
        self.seen().into_iter().filter(|s| s.date == date).collect()
    }
}

#[async_trait]
impl Selector for HoldAll {
    fn name(&self) -> &str {
        "hold_all"
    }

    async fn select(&self, slice: &TimeSlice) -> Result<Selection, SelectorError> {
        {
            let mut seen = self.seen.lock().unwrap();
            for td in slice.ticker_dates() {
                seen.push(Seen {
                    date: slice.date(),
                    symbol: td.symbol().to_string(),
                    current: td.current_financials.as_ref().map(|f| f.period_end),
                    last: td.last_financials.as_ref().map(|f| f.period_end),
                });
            }
        }
        Ok(Selection::equal(slice.symbols()))
    }
}

#[tokio::test]
async fn current_filing_is_shared_across_slices_and_fetched_once() {
    let slices = months(d(2020, 1, 1), 3);
    let provider = Arc::new(
        InMemoryProvider::new()
            .with_prices("A", slices.iter().map(|&s| (s, 10.0)))
            .with_prices("B", slices.iter().map(|&s| (s, 20.0)))
            .with_prices("C", slices.iter().map(|&s| (s, 30.0)))
            .with_filing(FinancialFiling::new("A", d(2019, 12, 31), "Q4"))
            .with_filing(FinancialFiling::new("A", d(2020, 3, 31), "Q1")),
    );
    let selector = Arc::new(HoldAll::default());
    let config = fast_config(d(2020, 1, 1), d(2020, 3, 1));

    let result = run_backtest(
        &config,
        provider.clone(),
        universe(&["A", "B", "C"]),
        selector.clone(),
    )
    .await
    .unwrap();

    assert_eq!(result.trajectory.len(), 3);
    for date in [d(2020, 1, 1), d(2020, 2, 1)] {
        let a: Vec<Seen> = selector
            .on(date)
            .into_iter()
            .filter(|s| s.symbol == "A")
            .collect();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].current, Some(d(2019, 12, 31)));
        assert_eq!(a[0].last, None);
    }
    assert_eq!(provider.times_served("A", d(2019, 12, 31)), 1);
    assert_eq!(provider.max_times_served(), 1);
    assert_eq!(result.max_filing_fetches, 1);

    // B and C have no filings: present, uncovered, and not an error.
    for s in selector.seen().iter().filter(|s| s.symbol != "A") {
        assert_eq!(s.current, None);
    }
    assert_eq!(result.warning_count(), 0);
}

#[tokio::test]
async fn missing_price_drops_ticker_until_it_reappears() {
    let slices = months(d(2020, 1, 1), 3);
    let provider = Arc::new(
        InMemoryProvider::new()
            .with_prices("A", slices.iter().map(|&s| (s, 10.0)))
            .with_price("D", d(2020, 1, 1), 5.0)
            .with_price("D", d(2020, 3, 1), 6.0),
    );
    let selector = Arc::new(HoldAll::default());
    let config = fast_config(d(2020, 1, 1), d(2020, 3, 1));

    let result = run_backtest(&config, provider, universe(&["A", "D"]), selector.clone())
        .await
        .unwrap();

    let symbols_on = |date| -> Vec<String> {
        selector.on(date).into_iter().map(|s| s.symbol).collect()
    };
    assert_eq!(symbols_on(d(2020, 1, 1)), vec!["A", "D"]);
    assert_eq!(symbols_on(d(2020, 2, 1)), vec!["A"]);
    assert_eq!(symbols_on(d(2020, 3, 1)), vec!["A", "D"]);

    let february = &result.reports[1];
    assert_eq!(february.date, d(2020, 2, 1));
    assert_eq!(february.tickers, 1);
    assert!(matches!(
        february.warnings.as_slice(),
        [SliceWarning::PriceUnavailable { symbol, .. }] if symbol == "D"
    ));
}

#[tokio::test]
async fn disappearing_holding_is_liquidated_at_last_observed_price() {
    let provider = Arc::new(
        InMemoryProvider::new()
            .with_price("A", d(2020, 1, 1), 10.0)
            .with_price("A", d(2020, 2, 1), 11.0)
            .with_price("B", d(2020, 1, 1), 20.0),
    );
    let config = fast_config(d(2020, 1, 1), d(2020, 2, 1));

    let result = run_backtest(
        &config,
        provider,
        universe(&["A", "B"]),
        Arc::new(HoldAll::default()),
    )
    .await
    .unwrap();

    let points = result.trajectory.points();
    assert_eq!(points.len(), 2);
    assert!((points[1].period_return - 0.05).abs() < 1e-12);
    assert!((points[1].value - 1.05).abs() < 1e-12);
    assert_eq!(points[1].liquidated, vec!["B".to_string()]);
}

#[tokio::test]
async fn throttling_is_retried_without_surfacing() {
    let provider = Arc::new(
        InMemoryProvider::new()
            .with_price("A", d(2020, 1, 1), 10.0)
            .fail_times(
                "A",
                DataKind::Price,
                2,
                DataError::RateLimited {
                    retry_after_secs: 0,
                },
            ),
    );
    let config = fast_config(d(2020, 1, 1), d(2020, 1, 1));

    let result = run_backtest(&config, provider.clone(), universe(&["A"]), Arc::new(HoldAll::default()))
        .await
        .unwrap();

    assert_eq!(result.fetch_stats.retries, 2);
    assert_eq!(result.fetch_stats.exhausted, 0);
    assert_eq!(result.warning_count(), 0);
    assert_eq!(provider.price_calls(), 3);
    assert_eq!(result.trajectory.points()[0].holdings.len(), 1);
}

#[tokio::test]
async fn empty_universe_fails_before_any_fetch() {
    let provider = Arc::new(InMemoryProvider::new());
    let fetcher = Arc::new(RateLimitedFetcher::new(provider.clone(), Default::default()));
    let cache = Arc::new(FinancialFilingCache::new(
        Arc::clone(&fetcher),
        Default::default(),
    ));
    let mut engine = BacktestEngine::new(
        universe(&[]),
        TimeSliceBuilder::new(fetcher, cache),
        Arc::new(HoldAll::default()),
        EngineConfig::default(),
    );

    let failure = engine.backtest(d(2020, 1, 1), d(2020, 6, 1)).await.unwrap_err();

    assert_eq!(engine.state(), EngineState::Failed);
    assert!(failure.trajectory.is_empty());
    assert_eq!(provider.price_calls(), 0);
    assert_eq!(provider.filing_calls(), 0);
}

#[tokio::test]
async fn provider_wide_failure_fails_the_run() {
    let slices = months(d(2020, 1, 1), 3);
    let provider = Arc::new(
        InMemoryProvider::new()
            .with_prices("A", slices.iter().map(|&s| (s, 10.0)))
            .fail_times(
                "A",
                DataKind::Filings,
                1,
                DataError::AuthenticationRequired("key revoked".into()),
            ),
    );
    let config = fast_config(d(2020, 1, 1), d(2020, 3, 1));

    let err = run_backtest(&config, provider.clone(), universe(&["A"]), Arc::new(HoldAll::default()))
        .await
        .unwrap_err();

    match err {
        RunError::Engine(failure) => {
            assert!(failure.trajectory.is_empty());
            assert!(failure.to_string().contains("provider unavailable"));
        }
        other => panic!("unexpected error: {other}"),
    }
    // No slice after the first was attempted.
    assert_eq!(provider.price_calls(), 1);
    assert_eq!(provider.filing_calls(), 1);
}

#[tokio::test]
async fn filings_are_fetched_at_most_once_over_two_years() {
    let slices = months(d(2020, 1, 1), 24);
    let symbols = ["AAA", "BBB", "CCC", "DDD"];
    let mut provider = InMemoryProvider::new();
    for (i, symbol) in symbols.iter().enumerate() {
        provider = provider.with_prices(
            symbol,
            slices
                .iter()
                .enumerate()
                .map(|(m, &s)| (s, 10.0 + i as f64 + m as f64 * 0.1)),
        );
        for (q, pe) in quarter_ends(2018, 2021).into_iter().enumerate() {
            provider = provider.with_filing(
                FinancialFiling::new(*symbol, pe, format!("Q{}", q % 4 + 1))
                    .with_line_item(line_items::BASIC_EPS, Some(1.0 + q as f64)),
            );
        }
    }
    let provider = Arc::new(provider);
    let selector = Arc::new(HoldAll::default());
    let config = fast_config(d(2020, 1, 1), d(2021, 12, 1));

    let result = run_backtest(&config, provider.clone(), universe(&symbols), selector.clone())
        .await
        .unwrap();

    assert_eq!(provider.max_times_served(), 1);
    assert_eq!(result.max_filing_fetches, 1);

    let dates: Vec<NaiveDate> = result.trajectory.points().iter().map(|p| p.date).collect();
    assert_eq!(dates, slices);

    let seen = selector.seen();
    assert_eq!(seen.len(), 24 * symbols.len());
    for s in &seen {
        let (Some(current), Some(last)) = (s.current, s.last) else {
            panic!("{} uncovered on {}", s.symbol, s.date);
        };
        assert!(last < current);
        assert!(current <= s.date);
    }
}

#[tokio::test]
async fn prewarmed_cache_gives_identical_trajectories() {
    let slices = months(d(2020, 1, 1), 6);
    let build_provider = || {
        let mut p = InMemoryProvider::new();
        for (i, symbol) in ["AAA", "BBB", "CCC"].iter().enumerate() {
            p = p.with_prices(
                symbol,
                slices
                    .iter()
                    .enumerate()
                    .map(|(m, &s)| (s, 20.0 + (i * m) as f64)),
            );
            for (q, pe) in quarter_ends(2019, 2020).into_iter().enumerate() {
                p = p.with_filing(
                    FinancialFiling::new(*symbol, pe, "Q")
                        .with_line_item(line_items::BASIC_EPS, Some((i + q) as f64)),
                );
            }
        }
        Arc::new(p)
    };
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config(d(2020, 1, 1), d(2020, 6, 1));
    config.backtest.num_stocks = 2;
    config.selector.per_sector = 2;
    config.cache.snapshot = Some(dir.path().join("filings.json"));

    let cold_provider = build_provider();
    let cold = run_backtest(
        &config,
        cold_provider.clone(),
        universe(&["AAA", "BBB", "CCC"]),
        Arc::new(default_selector(&config)),
    )
    .await
    .unwrap();
    assert!(cold_provider.filing_calls() > 0);
    assert!(dir.path().join("filings.json").exists());

    let mut fingerprints = Vec::new();
    for _ in 0..2 {
        let warm_provider = build_provider();
        let warm = run_backtest(
            &config,
            warm_provider.clone(),
            universe(&["AAA", "BBB", "CCC"]),
            Arc::new(default_selector(&config)),
        )
        .await
        .unwrap();
        assert_eq!(warm_provider.filing_calls(), 0);
        assert_eq!(warm.trajectory, cold.trajectory);
        fingerprints.push(warm.trajectory_fingerprint);
    }
    assert_eq!(fingerprints[0], fingerprints[1]);
    assert_eq!(fingerprints[0], cold.trajectory_fingerprint);
}
