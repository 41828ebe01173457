//! Trajectory metrics: pure functions over monthly portfolio values.
//!
//! Every metric takes the value series (one entry per slice) and returns a
//! scalar. Annualization assumes 12 periods per year.

use serde::{Deserialize, Serialize};

use crate::trajectory::PortfolioTrajectory;

pub const PERIODS_PER_YEAR: f64 = 12.0;

/// Summary statistics for one backtest trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectorySummary {
    pub total_return: f64,
    pub cagr: f64,
    pub volatility: f64,
    pub sharpe: f64,
    pub sortino: f64,
    pub max_drawdown: f64,
    pub best_month: f64,
    pub worst_month: f64,
    pub hit_rate: f64,
    pub avg_holdings: f64,
    pub slice_count: usize,
}

impl TrajectorySummary {
    pub fn compute(trajectory: &PortfolioTrajectory) -> Self {
        let values = trajectory.values();
        let returns = period_returns(&values);
        let avg_holdings = if trajectory.is_empty() {
            0.0
        } else {
            trajectory
                .points()
                .iter()
                .map(|p| p.holdings.len())
                .sum::<usize>() as f64
                / trajectory.len() as f64
        };
        Self {
            total_return: total_return(&values),
            cagr: cagr(&values),
            volatility: volatility(&returns),
            sharpe: sharpe_ratio(&returns),
            sortino: sortino_ratio(&returns),
            max_drawdown: max_drawdown(&values),
            best_month: returns.iter().copied().reduce(f64::max).unwrap_or(0.0),
            worst_month: returns.iter().copied().reduce(f64::min).unwrap_or(0.0),
            hit_rate: hit_rate(&returns),
            avg_holdings,
            slice_count: trajectory.len(),
        }
    }
}

// ─── Individual metric functions ────────────────────────────────────

/// Total return as a fraction: (final - initial) / initial.
pub fn total_return(values: &[f64]) -> f64 {
    match (values.first(), values.last()) {
        (Some(&initial), Some(&final_value)) if values.len() >= 2 && initial > 0.0 => {
            (final_value - initial) / initial
        }
        _ => 0.0,
    }
}

/// Compound annual growth rate over `len - 1` monthly periods.
pub fn cagr(values: &[f64]) -> f64 {
    let (Some(&initial), Some(&final_value)) = (values.first(), values.last()) else {
        return 0.0;
    };
    if values.len() < 2 || initial <= 0.0 || final_value <= 0.0 {
        return 0.0;
    }
    let years = (values.len() - 1) as f64 / PERIODS_PER_YEAR;
    (final_value / initial).powf(1.0 / years) - 1.0
}

/// Annualized standard deviation of period returns.
pub fn volatility(returns: &[f64]) -> f64 {
    std_dev(returns) * PERIODS_PER_YEAR.sqrt()
}

/// Annualized Sharpe ratio (risk-free rate 0). Zero when variance is zero
/// or there are fewer than 2 periods.
pub fn sharpe_ratio(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let std = std_dev(returns);
    if std < 1e-15 {
        return 0.0;
    }
    mean_f64(returns) / std * PERIODS_PER_YEAR.sqrt()
}

/// Annualized Sortino ratio (downside deviation only, risk-free rate 0).
pub fn sortino_ratio(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let downside_sq: f64 = returns.iter().filter(|&&r| r < 0.0).map(|r| r * r).sum();
    if downside_sq == 0.0 {
        return 0.0;
    }
    let downside_std = (downside_sq / returns.len() as f64).sqrt();
    if downside_std < 1e-15 {
        return 0.0;
    }
    mean_f64(returns) / downside_std * PERIODS_PER_YEAR.sqrt()
}

/// Maximum drawdown as a negative fraction (e.g., -0.15 = 15% drawdown).
pub fn max_drawdown(values: &[f64]) -> f64 {
    let mut peak = f64::NEG_INFINITY;
    let mut max_dd = 0.0_f64;
    for &v in values {
        peak = peak.max(v);
        if peak > 0.0 {
            max_dd = max_dd.min((v - peak) / peak);
        }
    }
    max_dd
}

/// Share of periods with a positive return.
pub fn hit_rate(returns: &[f64]) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    returns.iter().filter(|&&r| r > 0.0).count() as f64 / returns.len() as f64
}

// ─── Helpers ────────────────────────────────────────────────────────

/// Simple returns between consecutive values.
pub fn period_returns(values: &[f64]) -> Vec<f64> {
    values
        .windows(2)
        .map(|w| if w[0] > 0.0 { (w[1] - w[0]) / w[0] } else { 0.0 })
        .collect()
}

pub(crate) fn mean_f64(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub(crate) fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = mean_f64(values);
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trajectory::{Holding, TrajectoryPoint};
    use chrono::{Months, NaiveDate};

    fn trajectory(values: &[f64], holdings: usize) -> PortfolioTrajectory {
        let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let mut t = PortfolioTrajectory::new();
        let mut prev: Option<f64> = None;
        for (i, &v) in values.iter().enumerate() {
            t.push(TrajectoryPoint {
                date: start.checked_add_months(Months::new(i as u32)).unwrap(),
                period_return: prev.map_or(0.0, |p| v / p - 1.0),
                value: v,
                holdings: (0..holdings)
                    .map(|h| Holding {
                        symbol: format!("S{h}"),
                        weight: 1.0 / holdings as f64,
                        shares: 1.0,
                        entry_price: 1.0,
                    })
                    .collect(),
                liquidated: vec![],
            })
            .unwrap();
            prev = Some(v);
        }
        t
    }

    // ── Total return ──

    #[test]
    fn total_return_positive() {
        assert!((total_return(&[1.0, 1.05, 1.1]) - 0.1).abs() < 1e-10);
    }

    #[test]
    fn total_return_single_slice() {
        assert_eq!(total_return(&[1.0]), 0.0);
        assert_eq!(total_return(&[]), 0.0);
    }

    // ── CAGR ──

    #[test]
    fn cagr_one_year_of_months() {
        // 13 values = 12 monthly periods = 1 year.
        let monthly = 1.1_f64.powf(1.0 / 12.0);
        let values: Vec<f64> = (0..13).map(|i| monthly.powi(i)).collect();
        assert!((cagr(&values) - 0.1).abs() < 1e-9);
    }

    #[test]
    fn cagr_constant_is_zero() {
        assert_eq!(cagr(&[1.0; 24]), 0.0);
    }

    // ── Risk ──

    #[test]
    fn sharpe_constant_is_zero() {
        assert_eq!(sharpe_ratio(&[0.0; 12]), 0.0);
        assert!(volatility(&[0.01; 12]) < 1e-12);
    }

    #[test]
    fn sortino_without_losses_is_zero() {
        assert_eq!(sortino_ratio(&[0.01, 0.02, 0.03]), 0.0);
        assert!(sortino_ratio(&[0.05, -0.01, 0.04]) > 0.0);
    }

    #[test]
    fn drawdown_from_peak() {
        let dd = max_drawdown(&[1.0, 1.2, 0.9, 1.3]);
        assert!((dd - (-0.25)).abs() < 1e-10);
        assert_eq!(max_drawdown(&[1.0, 1.1, 1.2]), 0.0);
    }

    #[test]
    fn hit_rate_counts_positive_periods() {
        assert_eq!(hit_rate(&[0.1, -0.1, 0.0, 0.2]), 0.5);
        assert_eq!(hit_rate(&[]), 0.0);
    }

    // ── Summary ──

    #[test]
    fn summary_of_known_trajectory() {
        let t = trajectory(&[1.0, 1.1, 0.99, 1.089], 2);
        let s = TrajectorySummary::compute(&t);
        assert_eq!(s.slice_count, 4);
        assert!((s.total_return - 0.089).abs() < 1e-10);
        assert!((s.best_month - 0.1).abs() < 1e-10);
        assert!((s.worst_month - (-0.1)).abs() < 1e-10);
        assert!((s.hit_rate - 2.0 / 3.0).abs() < 1e-10);
        assert!((s.max_drawdown - (-0.1)).abs() < 1e-10);
        assert_eq!(s.avg_holdings, 2.0);
    }

    #[test]
    fn summary_of_empty_trajectory() {
        let s = TrajectorySummary::compute(&PortfolioTrajectory::new());
        assert_eq!(s.slice_count, 0);
        assert_eq!(s.total_return, 0.0);
        assert_eq!(s.avg_holdings, 0.0);
    }
}
