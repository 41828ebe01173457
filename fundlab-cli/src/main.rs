//! FundLab CLI: backtest, universe and cache commands.
//!
//! Commands:
//! - `run`: execute a monthly backtest from a TOML config against Polygon.io
//! - `show`: print the summary of a saved run
//! - `universe init`: write the default sector universe as TOML
//! - `universe show`: list the sectors and tickers of a universe file
//! - `cache status`: report what a filing cache snapshot holds
//!
//! Logs go to stderr and are filtered with `RUST_LOG` (default `info`).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use fundlab_core::data::{CacheSnapshot, PolygonProvider, Universe, UniverseFile};
use fundlab_runner::{
    default_selector, load_artifacts, run_backtest, save_artifacts, BacktestConfig,
    BacktestResult, RunError,
};

const API_KEY_ENV: &str = "POLYGON_API_KEY";

#[derive(Parser)]
#[command(
    name = "fundlab",
    about = "FundLab CLI: monthly fundamental backtests",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a backtest from a TOML config file.
    Run {
        /// Path to a TOML config file.
        #[arg(long)]
        config: PathBuf,

        /// Universe TOML (sector = [tickers]).
        #[arg(long, default_value = "universe.toml")]
        universe: PathBuf,

        /// Override the first slice date (YYYY-MM-DD).
        #[arg(long)]
        start: Option<String>,

        /// Override the last slice date (YYYY-MM-DD).
        #[arg(long)]
        end: Option<String>,

        /// Filing cache snapshot to restore from and save to.
        #[arg(long)]
        snapshot: Option<PathBuf>,

        /// Polygon-compatible API base URL.
        #[arg(long)]
        base_url: Option<String>,

        /// Output directory for run artifacts.
        #[arg(long, default_value = "results")]
        output_dir: PathBuf,
    },
    /// Print the summary of a saved run directory.
    Show {
        /// Artifact directory created by `run`.
        dir: PathBuf,
    },
    /// Universe file commands.
    Universe {
        #[command(subcommand)]
        action: UniverseAction,
    },
    /// Filing cache snapshot commands.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum UniverseAction {
    /// Write the default US sector universe.
    Init {
        #[arg(long, default_value = "universe.toml")]
        path: PathBuf,

        /// Overwrite an existing file.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// List sectors and tickers.
    Show {
        #[arg(long, default_value = "universe.toml")]
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Report tickers, filing counts and coverage in a snapshot.
    Status {
        #[arg(long)]
        snapshot: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            universe,
            start,
            end,
            snapshot,
            base_url,
            output_dir,
        } => {
            run_backtest_cmd(
                &config, universe, start, end, snapshot, base_url, &output_dir,
            )
            .await
        }
        Commands::Show { dir } => {
            let result = load_artifacts(&dir)?;
            print_summary(&result);
            Ok(())
        }
        Commands::Universe { action } => match action {
            UniverseAction::Init { path, force } => run_universe_init(&path, force),
            UniverseAction::Show { path } => run_universe_show(&path),
        },
        Commands::Cache { action } => match action {
            CacheAction::Status { snapshot } => run_cache_status(&snapshot),
        },
    }
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("invalid date '{s}'"))
}

async fn run_backtest_cmd(
    config_path: &Path,
    universe_path: PathBuf,
    start: Option<String>,
    end: Option<String>,
    snapshot: Option<PathBuf>,
    base_url: Option<String>,
    output_dir: &Path,
) -> Result<()> {
    let mut config = BacktestConfig::from_file(config_path)?;
    if let Some(start) = start.as_deref() {
        config.backtest.start = parse_date(start)?;
    }
    if let Some(end) = end.as_deref() {
        config.backtest.end = parse_date(end)?;
    }
    if snapshot.is_some() {
        config.cache.snapshot = snapshot;
    }
    config.validate()?;

    // Fail on a bad universe file before any request is made.
    let tickers = Universe::from_file(&universe_path)?.tickers()?;
    info!(
        "universe {}: {} tickers",
        universe_path.display(),
        tickers.len()
    );

    let api_key = match std::env::var(API_KEY_ENV) {
        Ok(key) if !key.trim().is_empty() => key,
        _ => bail!("{API_KEY_ENV} is not set"),
    };
    let timeout = Duration::from_secs(config.fetch.request_timeout_secs);
    let provider = match base_url {
        Some(url) => PolygonProvider::with_base_url(api_key, url, timeout)?,
        None => PolygonProvider::new(api_key, timeout)?,
    };

    let result = match run_backtest(
        &config,
        Arc::new(provider),
        Arc::new(UniverseFile(universe_path)),
        Arc::new(default_selector(&config)),
    )
    .await
    {
        Ok(result) => result,
        Err(RunError::Engine(failure)) => {
            eprintln!("Backtest failed: {}", failure.error);
            if let Some(last) = failure.trajectory.last() {
                eprintln!(
                    "Last completed slice: {} (value {:.4}, {} slices)",
                    last.date,
                    last.value,
                    failure.trajectory.len()
                );
            }
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    };

    print_summary(&result);

    let run_dir = save_artifacts(&result, output_dir)?;
    println!("Artifacts saved to: {}", run_dir.display());

    Ok(())
}

fn run_universe_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (pass --force to overwrite)", path.display());
    }
    let universe = Universe::default_us();
    std::fs::write(path, universe.to_toml()?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!(
        "Wrote {} tickers in {} sectors to {}",
        universe.ticker_count(),
        universe.sector_names().len(),
        path.display()
    );
    Ok(())
}

fn run_universe_show(path: &Path) -> Result<()> {
    let universe = Universe::from_file(path)?;
    // Validates duplicates and emptiness.
    let tickers = universe.tickers()?;
    println!("Universe: {} ({} tickers)", path.display(), tickers.len());
    println!();
    for sector in universe.sector_names() {
        let symbols = universe.sector_tickers(sector).unwrap_or_default();
        println!("{:<24} {}", sector, symbols.join(" "));
    }
    Ok(())
}

fn run_cache_status(path: &Path) -> Result<()> {
    if !path.exists() {
        println!("Snapshot does not exist: {}", path.display());
        return Ok(());
    }
    let snapshot = CacheSnapshot::read(path)?;
    if snapshot.tickers.is_empty() {
        println!("Snapshot is empty: {}", path.display());
        return Ok(());
    }

    println!("Snapshot: {}", path.display());
    println!("Tickers: {}", snapshot.tickers.len());
    println!("Filings: {}", snapshot.filing_count());
    println!();
    println!(
        "{:<8} {:>7} {:<25} {:<12}",
        "Symbol", "Filings", "Period Ends", "Covered"
    );
    println!("{}", "-".repeat(56));
    for (symbol, t) in &snapshot.tickers {
        let range = match (t.filings.first(), t.filings.last()) {
            (Some(first), Some(last)) => format!("{} to {}", first.period_end, last.period_end),
            _ => "(none)".into(),
        };
        let covered = t
            .covered_through
            .map_or_else(|| "-".to_string(), |d| d.to_string());
        println!(
            "{:<8} {:>7} {:<25} {:<12}",
            symbol,
            t.filings.len(),
            range,
            covered
        );
    }
    Ok(())
}

fn print_summary(result: &BacktestResult) {
    let s = &result.summary;
    let f = &result.fetch_stats;
    println!();
    println!("=== Backtest Result ===");
    println!("Run:            {}", &result.run_id[..12.min(result.run_id.len())]);
    println!(
        "Period:         {} to {}",
        result.start_date, result.end_date
    );
    println!("Selector:       {}", result.selector);
    println!("Universe:       {} tickers", result.universe_size);
    println!("Slices:         {}", s.slice_count);
    println!();
    println!("--- Performance ---");
    println!("Total Return:   {:.2}%", s.total_return * 100.0);
    println!("CAGR:           {:.2}%", s.cagr * 100.0);
    println!("Volatility:     {:.2}%", s.volatility * 100.0);
    println!("Sharpe:         {:.3}", s.sharpe);
    println!("Sortino:        {:.3}", s.sortino);
    println!("Max Drawdown:   {:.2}%", s.max_drawdown * 100.0);
    println!("Hit Rate:       {:.1}%", s.hit_rate * 100.0);
    println!("Avg Holdings:   {:.1}", s.avg_holdings);
    println!();
    println!("--- Data ---");
    println!(
        "Requests:       {} ({} retries, {} exhausted, {} fatal)",
        f.requests, f.retries, f.exhausted, f.fatal
    );
    println!("Cached Filings: {}", result.cached_filings);
    println!("Warnings:       {}", result.warning_count());
    println!();
}
