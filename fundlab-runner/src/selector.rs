//! Selector capability: picks the holdings for one slice.
//!
//! A selector sees only the immutable slice. The engine validates what it
//! returns and turns it into an allocation with [`allocate`].

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use fundlab_core::domain::{line_items, TickerDate, TimeSlice};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SelectorError {
    #[error("selected {symbol} which is not in the {date} slice")]
    UnknownSymbol { symbol: String, date: NaiveDate },

    #[error("selected {symbol} more than once")]
    DuplicateSymbol { symbol: String },

    #[error("invalid weight {weight} for {symbol}")]
    InvalidWeight { symbol: String, weight: f64 },

    #[error("selection mixes weighted and unweighted picks")]
    MixedWeights,

    #[error("selection weights sum to zero")]
    ZeroTotalWeight,

    #[error("selector failed: {0}")]
    Failed(String),
}

/// One selected ticker, optionally with a relative weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pick {
    pub symbol: String,
    pub weight: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Selection(pub Vec<Pick>);

impl Selection {
    /// Equal-weight selection.
    pub fn equal<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(
            symbols
                .into_iter()
                .map(|s| Pick {
                    symbol: s.into(),
                    weight: None,
                })
                .collect(),
        )
    }

    pub fn weighted<I, S>(picks: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        Self(
            picks
                .into_iter()
                .map(|(s, w)| Pick {
                    symbol: s.into(),
                    weight: Some(w),
                })
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

#[async_trait]
pub trait Selector: Send + Sync {
    fn name(&self) -> &str;

    /// Choose holdings from `slice`. Every pick must be a symbol of the slice.
    async fn select(&self, slice: &TimeSlice) -> Result<Selection, SelectorError>;
}

/// Validate a selection against its slice and normalize weights to sum to 1.
///
/// Unweighted selections get equal weights. An empty selection allocates
/// nothing (the portfolio sits in cash).
pub fn allocate(
    selection: &Selection,
    slice: &TimeSlice,
) -> Result<Vec<(String, f64)>, SelectorError> {
    if selection.is_empty() {
        return Ok(Vec::new());
    }

    let mut seen = HashSet::new();
    for pick in &selection.0 {
        if !slice.contains(&pick.symbol) {
            return Err(SelectorError::UnknownSymbol {
                symbol: pick.symbol.clone(),
                date: slice.date(),
            });
        }
        if !seen.insert(pick.symbol.as_str()) {
            return Err(SelectorError::DuplicateSymbol {
                symbol: pick.symbol.clone(),
            });
        }
        if let Some(w) = pick.weight {
            if !w.is_finite() || w < 0.0 {
                return Err(SelectorError::InvalidWeight {
                    symbol: pick.symbol.clone(),
                    weight: w,
                });
            }
        }
    }

    let weighted = selection.0.iter().filter(|p| p.weight.is_some()).count();
    if weighted == 0 {
        let w = 1.0 / selection.len() as f64;
        return Ok(selection.0.iter().map(|p| (p.symbol.clone(), w)).collect());
    }
    if weighted != selection.len() {
        return Err(SelectorError::MixedWeights);
    }

    let total: f64 = selection.0.iter().filter_map(|p| p.weight).sum();
    if total <= 0.0 {
        return Err(SelectorError::ZeroTotalWeight);
    }
    Ok(selection
        .0
        .iter()
        .filter_map(|p| p.weight.map(|w| (p.symbol.clone(), w / total)))
        .collect())
}

// ─── Scoring ────────────────────────────────────────────────────────

/// Scores a ticker-date. `None` means "cannot score" and the ticker is
/// skipped.
pub trait Scorer: Send + Sync {
    fn score(&self, td: &TickerDate) -> Option<f64>;
}

impl<F> Scorer for F
where
    F: Fn(&TickerDate) -> Option<f64> + Send + Sync,
{
    fn score(&self, td: &TickerDate) -> Option<f64> {
        self(td)
    }
}

/// Scores by a line item of the current filing.
#[derive(Debug, Clone)]
pub struct LineItemScorer {
    pub line_item: String,
}

impl LineItemScorer {
    pub fn new(line_item: impl Into<String>) -> Self {
        Self {
            line_item: line_item.into(),
        }
    }
}

impl Default for LineItemScorer {
    fn default() -> Self {
        Self::new(line_items::BASIC_EPS)
    }
}

impl Scorer for LineItemScorer {
    fn score(&self, td: &TickerDate) -> Option<f64> {
        td.current_line_item(&self.line_item).filter(|v| v.is_finite())
    }
}

// ─── Sector leaders ─────────────────────────────────────────────────

/// Best `per_sector` tickers of each sector by score, then the overall top
/// `num_stocks` of those, equal-weighted.
pub struct SectorLeaders {
    scorer: Box<dyn Scorer>,
    per_sector: usize,
    num_stocks: usize,
}

impl SectorLeaders {
    pub fn new(scorer: impl Scorer + 'static, per_sector: usize, num_stocks: usize) -> Self {
        Self {
            scorer: Box::new(scorer),
            per_sector: per_sector.max(1),
            num_stocks,
        }
    }

    /// Ranked `(symbol, score)` leaders for a slice.
    pub fn rank<'a>(&self, slice: &'a TimeSlice) -> Vec<(&'a str, f64)> {
        let mut by_sector: BTreeMap<&str, Vec<(&str, f64)>> = BTreeMap::new();
        for td in slice.ticker_dates() {
            if let Some(score) = self.scorer.score(td) {
                by_sector
                    .entry(td.sector())
                    .or_default()
                    .push((td.symbol(), score));
            }
        }

        let mut leaders: Vec<(&str, f64)> = by_sector
            .into_values()
            .flat_map(|mut scored| {
                scored.sort_by(by_score_desc);
                scored.truncate(self.per_sector);
                scored
            })
            .collect();
        leaders.sort_by(by_score_desc);
        leaders.truncate(self.num_stocks);
        leaders
    }
}

fn by_score_desc(a: &(&str, f64), b: &(&str, f64)) -> std::cmp::Ordering {
    b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0))
}

#[async_trait]
impl Selector for SectorLeaders {
    fn name(&self) -> &str {
        "sector_leaders"
    }

    async fn select(&self, slice: &TimeSlice) -> Result<Selection, SelectorError> {
        Ok(Selection::equal(self.rank(slice).into_iter().map(|(s, _)| s)))
    }
}
