//! Portfolio trajectory: the run's append-only output.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TrajectoryError {
    #[error("trajectory dates must strictly increase: {previous} then {next}")]
    NonIncreasingDate { previous: NaiveDate, next: NaiveDate },
}

/// A position held from one slice to the next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub symbol: String,
    pub weight: f64,
    pub shares: f64,
    pub entry_price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryPoint {
    pub date: NaiveDate,
    /// Return realized over the period ending at `date` (0 for the first).
    pub period_return: f64,
    /// Portfolio value at `date`, before rebalancing.
    pub value: f64,
    /// Holdings entered at `date` and carried to the next slice.
    pub holdings: Vec<Holding>,
    /// Previously held symbols missing from this slice, valued at entry.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub liquidated: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortfolioTrajectory {
    points: Vec<TrajectoryPoint>,
}

impl PortfolioTrajectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, point: TrajectoryPoint) -> Result<(), TrajectoryError> {
        if let Some(last) = self.points.last() {
            if point.date <= last.date {
                return Err(TrajectoryError::NonIncreasingDate {
                    previous: last.date,
                    next: point.date,
                });
            }
        }
        self.points.push(point);
        Ok(())
    }

    pub fn points(&self) -> &[TrajectoryPoint] {
        &self.points
    }

    pub fn last(&self) -> Option<&TrajectoryPoint> {
        self.points.last()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.value).collect()
    }

    /// Period returns excluding the first (always zero) entry.
    pub fn period_returns(&self) -> Vec<f64> {
        self.points.iter().skip(1).map(|p| p.period_return).collect()
    }

    /// BLAKE3 hash of the canonical JSON form of the points.
    pub fn fingerprint(&self) -> String {
        // Serializing plain data with string keys cannot fail.
        let json = serde_json::to_vec(&self.points).unwrap_or_default();
        blake3::hash(&json).to_hex().to_string()
    }
}
