//! Financial filing cache.
//!
//! Per ticker, an append-only sequence of filings ordered by strictly
//! increasing period end, plus the date through which that sequence is known
//! to be complete. A lookup answers from the resident sequence when it
//! covers the as-of date and otherwise issues one forward fetch for the
//! uncovered range only. Fetch windows for a ticker never overlap, so a
//! filing that stays "current" for three monthly slices is fetched once.
//!
//! Lookups for the same ticker are single-flighted: the per-ticker state sits
//! behind an async mutex held across the fetch, so a concurrent lookup waits
//! for the in-flight fetch and then answers from what it brought in.

use chrono::{Duration as ChronoDuration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, warn};

use super::fetcher::RateLimitedFetcher;
use super::provider::{DataError, FilingWindow};
use crate::domain::{FilingKey, FilingPair, FinancialFiling};

/// Current snapshot schema version.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("snapshot I/O error: {0}")]
    Io(String),

    #[error("snapshot serialization error: {0}")]
    Serialization(String),

    #[error("snapshot checksum mismatch in {path}")]
    ChecksumMismatch { path: String },

    #[error("unsupported snapshot version {found} (max supported: {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("filings for {symbol} are not strictly increasing by period end")]
    NonMonotonic { symbol: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// How many filings the first lookup for a ticker asks for.
    pub initial_filings: usize,
    /// Opt-in fetch shortcut: while `as_of < tail.period_end + gap`, the
    /// tail is assumed current and no forward fetch is issued. Any period
    /// shorter than the gap (12-week quarters, fiscal-year transitions) stays
    /// hidden until the gap elapses. Zero, the default, always asks.
    pub min_period_gap_days: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            initial_filings: 2,
            min_period_gap_days: 0,
        }
    }
}

/// Resident state for one ticker.
#[derive(Debug, Default)]
struct TickerFilings {
    filings: Vec<Arc<FinancialFiling>>,
    /// Everything with `period_end <= covered_through` and newer than the
    /// first resident filing is resident. `None` until the first fetch.
    covered_through: Option<NaiveDate>,
    /// No filings exist before the first resident one.
    history_complete: bool,
}

/// What a lookup must fetch before it can answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gap {
    /// Nothing resident yet.
    Initial(FilingWindow),
    /// Newer periods may have ended since `covered_through`.
    Forward(FilingWindow),
    /// As-of date predates what the initial (limited) fetch brought in.
    History(FilingWindow),
}

impl TickerFilings {
    fn tail_covers(&self, as_of: NaiveDate, gap_days: i64) -> bool {
        match (self.covered_through, self.filings.last()) {
            (Some(through), _) if as_of <= through => true,
            (Some(_), Some(tail)) if gap_days > 0 => {
                as_of < tail.period_end + ChronoDuration::days(gap_days)
            }
            _ => false,
        }
    }

    fn gap(&self, as_of: NaiveDate, config: &CacheConfig) -> Option<Gap> {
        let Some(through) = self.covered_through else {
            return Some(Gap::Initial(FilingWindow::latest(
                as_of,
                config.initial_filings.max(2),
            )));
        };
        if !self.tail_covers(as_of, config.min_period_gap_days) {
            return Some(Gap::Forward(FilingWindow::between(through, as_of)));
        }
        let resident_at = self.filings.partition_point(|f| f.period_end <= as_of);
        if resident_at < 2 && !self.history_complete {
            if let Some(first) = self.filings.first() {
                let before_first = first.period_end - ChronoDuration::days(1);
                return Some(Gap::History(FilingWindow::through(before_first)));
            }
        }
        None
    }

    /// Append a forward or initial fetch, keeping period ends strictly
    /// increasing. Returns the number of filings kept.
    fn append(&mut self, symbol: &str, mut fetched: Vec<FinancialFiling>) -> usize {
        fetched.sort_by_key(|f| f.period_end);
        let mut kept = 0;
        for filing in fetched {
            if let Some(tail) = self.filings.last() {
                if filing.period_end <= tail.period_end {
                    warn!(
                        "{symbol}: discarding out-of-order filing {} (tail {})",
                        filing.period_end, tail.period_end
                    );
                    continue;
                }
            }
            self.filings.push(Arc::new(filing));
            kept += 1;
        }
        kept
    }

    /// Prepend filings older than the first resident one.
    fn prepend(&mut self, symbol: &str, mut fetched: Vec<FinancialFiling>) -> usize {
        let first = self.filings.first().map(|f| f.period_end);
        fetched.sort_by_key(|f| f.period_end);
        fetched.dedup_by_key(|f| f.period_end);
        let older: Vec<Arc<FinancialFiling>> = fetched
            .into_iter()
            .filter(|f| {
                let keep = first.map_or(true, |first| f.period_end < first);
                if !keep {
                    warn!("{symbol}: discarding overlapping history filing {}", f.period_end);
                }
                keep
            })
            .map(Arc::new)
            .collect();
        let kept = older.len();
        self.filings.splice(0..0, older);
        kept
    }
}

/// Single-flight, append-only cache of financial filings.
pub struct FinancialFilingCache {
    fetcher: Arc<RateLimitedFetcher>,
    config: CacheConfig,
    tickers: Mutex<HashMap<String, Arc<tokio::sync::Mutex<TickerFilings>>>>,
    fetch_counts: Mutex<HashMap<FilingKey, u32>>,
}

impl FinancialFilingCache {
    pub fn new(fetcher: Arc<RateLimitedFetcher>, config: CacheConfig) -> Self {
        Self {
            fetcher,
            config,
            tickers: Mutex::new(HashMap::new()),
            fetch_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Build a cache pre-warmed from a snapshot.
    pub fn with_snapshot(
        fetcher: Arc<RateLimitedFetcher>,
        config: CacheConfig,
        snapshot: CacheSnapshot,
    ) -> Result<Self, CacheError> {
        if snapshot.schema_version > SNAPSHOT_VERSION {
            return Err(CacheError::UnsupportedVersion {
                found: snapshot.schema_version,
                supported: SNAPSHOT_VERSION,
            });
        }
        let mut tickers = HashMap::new();
        for (symbol, entry) in snapshot.tickers {
            if entry
                .filings
                .windows(2)
                .any(|w| w[0].period_end >= w[1].period_end)
            {
                return Err(CacheError::NonMonotonic { symbol });
            }
            let state = TickerFilings {
                filings: entry.filings.into_iter().map(Arc::new).collect(),
                covered_through: entry.covered_through,
                history_complete: entry.history_complete,
            };
            tickers.insert(symbol, Arc::new(tokio::sync::Mutex::new(state)));
        }
        Ok(Self {
            fetcher,
            config,
            tickers: Mutex::new(tickers),
            fetch_counts: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn slot(&self, symbol: &str) -> Arc<tokio::sync::Mutex<TickerFilings>> {
        let mut tickers = self.tickers.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(tickers.entry(symbol.to_string()).or_default())
    }

    fn counts(&self) -> MutexGuard<'_, HashMap<FilingKey, u32>> {
        self.fetch_counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The `(current, last)` pair for `symbol` as of `as_of`, fetching only
    /// what is not resident. A failed fetch leaves resident state untouched.
    pub async fn lookup(&self, symbol: &str, as_of: NaiveDate) -> Result<FilingPair, DataError> {
        let slot = self.slot(symbol);
        let mut resident = slot.lock().await;

        // At most one forward step and one history step per lookup.
        for _ in 0..2 {
            let Some(gap) = resident.gap(as_of, &self.config) else {
                break;
            };
            match gap {
                Gap::Initial(window) => {
                    let fetched = self.fetch(symbol, window).await?;
                    resident.history_complete = fetched.len() < window.limit.unwrap_or(usize::MAX);
                    resident.append(symbol, fetched);
                    resident.covered_through = Some(as_of);
                }
                Gap::Forward(window) => {
                    let fetched = self.fetch(symbol, window).await?;
                    resident.append(symbol, fetched);
                    resident.covered_through = Some(as_of);
                }
                Gap::History(window) => {
                    let fetched = self.fetch(symbol, window).await?;
                    resident.prepend(symbol, fetched);
                    resident.history_complete = true;
                }
            }
        }

        Ok(FilingPair::resolve(&resident.filings, as_of))
    }

    async fn fetch(
        &self,
        symbol: &str,
        window: FilingWindow,
    ) -> Result<Vec<FinancialFiling>, DataError> {
        debug!("{symbol}: fetching filings {window}");
        let fetched = self.fetcher.fetch_filings(symbol, window).await?;
        let mut counts = self.counts();
        for f in fetched.iter().filter(|f| window.contains(f.period_end)) {
            *counts.entry(f.key()).or_insert(0) += 1;
        }
        Ok(fetched)
    }

    /// How many times the filing `(symbol, period_end)` came back from the
    /// provider during this cache's lifetime.
    pub fn fetch_count(&self, symbol: &str, period_end: NaiveDate) -> u32 {
        let key = FilingKey {
            symbol: symbol.to_string(),
            period_end,
        };
        self.counts().get(&key).copied().unwrap_or(0)
    }

    /// Highest per-filing fetch count (0 when nothing was fetched).
    pub fn max_fetch_count(&self) -> u32 {
        self.counts().values().copied().max().unwrap_or(0)
    }

    /// Number of resident filings for `symbol`.
    pub async fn resident_count(&self, symbol: &str) -> usize {
        let slot = {
            let tickers = self.tickers.lock().unwrap_or_else(PoisonError::into_inner);
            tickers.get(symbol).cloned()
        };
        match slot {
            Some(slot) => slot.lock().await.filings.len(),
            None => 0,
        }
    }

    /// Copy of the resident state, for persistence.
    pub async fn snapshot(&self) -> CacheSnapshot {
        let slots: Vec<(String, Arc<tokio::sync::Mutex<TickerFilings>>)> = {
            let tickers = self.tickers.lock().unwrap_or_else(PoisonError::into_inner);
            tickers
                .iter()
                .map(|(symbol, slot)| (symbol.clone(), Arc::clone(slot)))
                .collect()
        };
        let mut out = BTreeMap::new();
        for (symbol, slot) in slots {
            let state = slot.lock().await;
            if state.covered_through.is_none() {
                continue;
            }
            out.insert(
                symbol,
                TickerSnapshot {
                    filings: state.filings.iter().map(|f| f.as_ref().clone()).collect(),
                    covered_through: state.covered_through,
                    history_complete: state.history_complete,
                },
            );
        }
        CacheSnapshot {
            schema_version: SNAPSHOT_VERSION,
            tickers: out,
        }
    }
}

// ─── Snapshot persistence ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerSnapshot {
    pub filings: Vec<FinancialFiling>,
    pub covered_through: Option<NaiveDate>,
    #[serde(default)]
    pub history_complete: bool,
}

/// Serializable copy of the cache's resident state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub schema_version: u32,
    pub tickers: BTreeMap<String, TickerSnapshot>,
}

impl Default for CacheSnapshot {
    fn default() -> Self {
        Self {
            schema_version: SNAPSHOT_VERSION,
            tickers: BTreeMap::new(),
        }
    }
}

/// On-disk envelope: payload plus a BLAKE3 checksum of its JSON encoding.
#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    checksum: String,
    snapshot: CacheSnapshot,
}

impl CacheSnapshot {
    pub fn filing_count(&self) -> usize {
        self.tickers.values().map(|t| t.filings.len()).sum()
    }

    fn checksum(&self) -> Result<String, CacheError> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| CacheError::Serialization(format!("hash serialization: {e}")))?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }

    /// Write atomically: write to `.tmp` then rename into place.
    pub fn write(&self, path: &Path) -> Result<(), CacheError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| CacheError::Io(format!("failed to create dir: {e}")))?;
        }
        let envelope = SnapshotFile {
            checksum: self.checksum()?,
            snapshot: self.clone(),
        };
        let json = serde_json::to_string_pretty(&envelope)
            .map_err(|e| CacheError::Serialization(e.to_string()))?;

        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, json).map_err(|e| CacheError::Io(format!("write: {e}")))?;
        fs::rename(&tmp_path, path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            CacheError::Io(format!("atomic rename failed: {e}"))
        })
    }

    /// Read and verify a snapshot file.
    pub fn read(path: &Path) -> Result<Self, CacheError> {
        let content = fs::read_to_string(path).map_err(|e| CacheError::Io(format!("read: {e}")))?;
        let envelope: SnapshotFile = serde_json::from_str(&content)
            .map_err(|e| CacheError::Serialization(e.to_string()))?;
        if envelope.snapshot.checksum()? != envelope.checksum {
            return Err(CacheError::ChecksumMismatch {
                path: path.display().to_string(),
            });
        }
        if envelope.snapshot.schema_version > SNAPSHOT_VERSION {
            return Err(CacheError::UnsupportedVersion {
                found: envelope.snapshot.schema_version,
                supported: SNAPSHOT_VERSION,
            });
        }
        Ok(envelope.snapshot)
    }
}
