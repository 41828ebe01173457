//! Result export: JSON, CSV and Markdown artifacts.
//!
//! - **JSON**: full round-trip serialization with schema versioning
//! - **CSV**: the monthly trajectory and the per-slice warnings
//! - **Markdown**: a human-readable run report
//!
//! Persisted results carry a `schema_version`; newer versions are rejected
//! on load.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::engine::SliceReport;
use crate::runner::{BacktestResult, SCHEMA_VERSION};
use crate::trajectory::PortfolioTrajectory;

// ─── JSON export ────────────────────────────────────────────────────

pub fn export_json(result: &BacktestResult) -> Result<String> {
    serde_json::to_string_pretty(result).context("failed to serialize BacktestResult to JSON")
}

/// Deserialize a `BacktestResult`, rejecting unknown schema versions.
pub fn import_json(json: &str) -> Result<BacktestResult> {
    let result: BacktestResult =
        serde_json::from_str(json).context("failed to deserialize BacktestResult from JSON")?;
    if result.schema_version > SCHEMA_VERSION {
        bail!(
            "unsupported schema version {} (max supported: {})",
            result.schema_version,
            SCHEMA_VERSION
        );
    }
    Ok(result)
}

// ─── CSV export ─────────────────────────────────────────────────────

/// One row per slice: date, period_return, value, holdings, liquidated.
///
/// Holdings are `SYMBOL:weight` pairs joined with `;`.
pub fn export_trajectory_csv(trajectory: &PortfolioTrajectory) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record(["date", "period_return", "value", "holdings", "liquidated"])?;
    for p in trajectory.points() {
        let holdings: Vec<String> = p
            .holdings
            .iter()
            .map(|h| format!("{}:{:.4}", h.symbol, h.weight))
            .collect();
        wtr.write_record([
            &p.date.to_string(),
            &format!("{:.6}", p.period_return),
            &format!("{:.6}", p.value),
            &holdings.join(";"),
            &p.liquidated.join(";"),
        ])?;
    }
    let data = wtr.into_inner().context("failed to flush CSV writer")?;
    String::from_utf8(data).context("CSV output is not valid UTF-8")
}

/// One row per warning: date, symbol, kind, detail.
pub fn export_warnings_csv(reports: &[SliceReport]) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record(["date", "symbol", "kind", "detail"])?;
    for report in reports {
        for w in &report.warnings {
            wtr.write_record([
                report.date.to_string().as_str(),
                w.symbol(),
                w.kind(),
                w.to_string().as_str(),
            ])?;
        }
    }
    let data = wtr.into_inner().context("failed to flush CSV writer")?;
    String::from_utf8(data).context("CSV output is not valid UTF-8")
}

// ─── Artifact bundle ────────────────────────────────────────────────

/// Save the full artifact set for one run.
///
/// Creates `{run_id prefix}_{timestamp}/` under `output_dir` containing:
/// - `result.json`: the full `BacktestResult`
/// - `trajectory.csv`: the monthly trajectory
/// - `warnings.csv`: every degraded or dropped ticker
/// - `report.md`: the Markdown report
///
/// Returns the path to the created directory.
pub fn save_artifacts(result: &BacktestResult, output_dir: &Path) -> Result<PathBuf> {
    let prefix: String = result.run_id.chars().take(12).collect();
    let dirname = format!(
        "{}_{}",
        prefix,
        chrono::Local::now().format("%Y%m%d_%H%M%S")
    );
    let run_dir = output_dir.join(dirname);
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("failed to create artifact dir: {}", run_dir.display()))?;

    std::fs::write(run_dir.join("result.json"), export_json(result)?)?;
    std::fs::write(
        run_dir.join("trajectory.csv"),
        export_trajectory_csv(&result.trajectory)?,
    )?;
    std::fs::write(
        run_dir.join("warnings.csv"),
        export_warnings_csv(&result.reports)?,
    )?;
    std::fs::write(run_dir.join("report.md"), generate_report(result))?;

    Ok(run_dir)
}

/// Load a `BacktestResult` from an artifact directory's result.json.
pub fn load_artifacts(dir: &Path) -> Result<BacktestResult> {
    let result_path = dir.join("result.json");
    let json = std::fs::read_to_string(&result_path)
        .with_context(|| format!("failed to read {}", result_path.display()))?;
    import_json(&json)
}

// ─── Markdown report ────────────────────────────────────────────────

pub fn generate_report(result: &BacktestResult) -> String {
    let mut md = String::with_capacity(2048);

    md.push_str("# Backtest Report\n\n");

    md.push_str("## Metadata\n\n");
    md.push_str("| Field | Value |\n");
    md.push_str("| --- | --- |\n");
    md.push_str(&format!("| Run | `{}` |\n", result.run_id));
    md.push_str(&format!(
        "| Period | {} to {} |\n",
        result.start_date, result.end_date
    ));
    md.push_str(&format!("| Provider | {} |\n", result.provider));
    md.push_str(&format!("| Selector | {} |\n", result.selector));
    md.push_str(&format!("| Universe | {} tickers |\n", result.universe_size));
    md.push_str(&format!(
        "| Initial Capital | {:.2} |\n",
        result.config.backtest.initial_capital
    ));
    md.push_str(&format!(
        "| Fingerprint | `{}` |\n",
        result.trajectory_fingerprint
    ));
    md.push('\n');

    let s = &result.summary;
    md.push_str("## Performance Summary\n\n");
    md.push_str("| Metric | Value |\n");
    md.push_str("| --- | --- |\n");
    md.push_str(&format!("| Slices | {} |\n", s.slice_count));
    md.push_str(&format!(
        "| Total Return | {:.2}% |\n",
        s.total_return * 100.0
    ));
    md.push_str(&format!("| CAGR | {:.2}% |\n", s.cagr * 100.0));
    md.push_str(&format!("| Volatility | {:.2}% |\n", s.volatility * 100.0));
    md.push_str(&format!("| Sharpe | {:.3} |\n", s.sharpe));
    md.push_str(&format!("| Sortino | {:.3} |\n", s.sortino));
    md.push_str(&format!(
        "| Max Drawdown | {:.2}% |\n",
        s.max_drawdown * 100.0
    ));
    md.push_str(&format!("| Best Month | {:.2}% |\n", s.best_month * 100.0));
    md.push_str(&format!("| Worst Month | {:.2}% |\n", s.worst_month * 100.0));
    md.push_str(&format!("| Hit Rate | {:.1}% |\n", s.hit_rate * 100.0));
    md.push_str(&format!("| Avg Holdings | {:.1} |\n", s.avg_holdings));
    md.push('\n');

    let f = &result.fetch_stats;
    md.push_str("## Data Fetching\n\n");
    md.push_str("| Counter | Value |\n");
    md.push_str("| --- | --- |\n");
    md.push_str(&format!("| Provider Requests | {} |\n", f.requests));
    md.push_str(&format!("| Retries | {} |\n", f.retries));
    md.push_str(&format!("| Exhausted | {} |\n", f.exhausted));
    md.push_str(&format!("| Fatal | {} |\n", f.fatal));
    md.push_str(&format!("| Cached Filings | {} |\n", result.cached_filings));
    md.push_str(&format!(
        "| Max Fetches per Filing | {} |\n",
        result.max_filing_fetches
    ));
    md.push('\n');

    if result.warning_count() > 0 {
        md.push_str("## Data Quality\n\n");
        for report in &result.reports {
            for w in &report.warnings {
                md.push_str(&format!("- {}: {w}\n", report.date));
            }
        }
        md.push('\n');
    }

    md
}
