//! Time slices and the monthly rebalance schedule.

use chrono::{Months, NaiveDate};
use std::collections::HashMap;
use thiserror::Error;

use super::ticker_date::TickerDate;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ScheduleError {
    #[error("start date {start} is after end date {end}")]
    InvertedRange { start: NaiveDate, end: NaiveDate },

    #[error("date arithmetic overflow at {0} + {1} months")]
    Overflow(NaiveDate, u32),
}

/// Rebalance dates from `start` to `end` inclusive, one calendar month apart.
///
/// Each date is computed as `start + n months` (never chained), so a
/// month-end start like Jan 31 maps to Feb 29 and then back to Mar 31.
pub fn monthly_schedule(start: NaiveDate, end: NaiveDate) -> Result<Vec<NaiveDate>, ScheduleError> {
    if start > end {
        return Err(ScheduleError::InvertedRange { start, end });
    }

    let mut dates = Vec::new();
    for n in 0u32.. {
        let date = start
            .checked_add_months(Months::new(n))
            .ok_or(ScheduleError::Overflow(start, n))?;
        if date > end {
            break;
        }
        dates.push(date);
    }
    Ok(dates)
}

/// One rebalance date plus its resolved per-ticker snapshots.
///
/// Immutable once built; ephemeral (dropped after the selector runs and
/// weights are applied).
#[derive(Debug, Clone)]
pub struct TimeSlice {
    date: NaiveDate,
    entries: Vec<TickerDate>,
    index: HashMap<String, usize>,
}

impl TimeSlice {
    pub fn new(date: NaiveDate, entries: Vec<TickerDate>) -> Self {
        let index = entries
            .iter()
            .enumerate()
            .map(|(i, td)| (td.ticker.symbol.clone(), i))
            .collect();
        Self {
            date,
            entries,
            index,
        }
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    /// Entries in universe order.
    pub fn ticker_dates(&self) -> &[TickerDate] {
        &self.entries
    }

    pub fn get(&self, symbol: &str) -> Option<&TickerDate> {
        self.index.get(symbol).map(|&i| &self.entries[i])
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.index.contains_key(symbol)
    }

    pub fn price(&self, symbol: &str) -> Option<f64> {
        self.get(symbol).map(|td| td.price)
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|td| td.ticker.symbol.as_str())
    }

    /// Number of entries carrying a current filing.
    pub fn covered_count(&self) -> usize {
        self.entries.iter().filter(|td| td.is_covered()).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
