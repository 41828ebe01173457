//! Universe configuration: sector-organized ticker lists.
//!
//! The universe is stored as a TOML file mapping sector names to member
//! tickers. It is loaded once, before any market data is requested, and
//! flattened into the ticker list the engine iterates every slice.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::domain::Ticker;

#[derive(Debug, Error)]
pub enum UniverseError {
    #[error("read universe file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("parse universe TOML: {0}")]
    Parse(String),

    #[error("universe has no tickers")]
    Empty,

    #[error("ticker {symbol} listed in both {first} and {second}")]
    DuplicateTicker {
        symbol: String,
        first: String,
        second: String,
    },
}

/// Anything that can produce the ticker universe for a backtest.
#[async_trait]
pub trait UniverseSource: Send + Sync {
    async fn load(&self) -> Result<Vec<Ticker>, UniverseError>;
}

/// The complete universe configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Universe {
    pub sectors: BTreeMap<String, Vec<String>>,
}

impl Universe {
    /// Load a universe from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, UniverseError> {
        let content = std::fs::read_to_string(path).map_err(|e| UniverseError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// Parse a universe from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, UniverseError> {
        toml::from_str(content).map_err(|e| UniverseError::Parse(e.to_string()))
    }

    /// Flatten into tickers, sector by sector (sectors sorted by name,
    /// tickers in listing order). A symbol may belong to only one sector.
    pub fn tickers(&self) -> Result<Vec<Ticker>, UniverseError> {
        let mut seen: BTreeMap<&str, &str> = BTreeMap::new();
        let mut out = Vec::with_capacity(self.ticker_count());
        for (sector, symbols) in &self.sectors {
            for symbol in symbols {
                if let Some(first) = seen.insert(symbol.as_str(), sector.as_str()) {
                    if first == sector.as_str() {
                        continue;
                    }
                    return Err(UniverseError::DuplicateTicker {
                        symbol: symbol.clone(),
                        first: first.to_string(),
                        second: sector.clone(),
                    });
                }
                out.push(Ticker::new(symbol.clone(), sector.clone()));
            }
        }
        if out.is_empty() {
            return Err(UniverseError::Empty);
        }
        Ok(out)
    }

    /// Get tickers for a specific sector.
    pub fn sector_tickers(&self, sector: &str) -> Option<&[String]> {
        self.sectors.get(sector).map(|v| v.as_slice())
    }

    pub fn sector_names(&self) -> Vec<&str> {
        self.sectors.keys().map(|s| s.as_str()).collect()
    }

    /// Total number of listed tickers.
    pub fn ticker_count(&self) -> usize {
        self.sectors.values().map(|v| v.len()).sum()
    }

    /// A default US large-cap universe across major sectors.
    pub fn default_us() -> Self {
        let sector = |symbols: &[&str]| -> Vec<String> {
            symbols.iter().map(|s| s.to_string()).collect()
        };
        let mut sectors = BTreeMap::new();
        sectors.insert(
            "Technology".into(),
            sector(&["AAPL", "MSFT", "GOOGL", "NVDA", "META", "AVGO", "CRM", "ADBE", "ORCL"]),
        );
        sectors.insert(
            "Healthcare".into(),
            sector(&["JNJ", "UNH", "PFE", "ABBV", "MRK", "LLY", "TMO", "ABT"]),
        );
        sectors.insert(
            "Finance".into(),
            sector(&["JPM", "BAC", "WFC", "GS", "MS", "BLK", "SCHW", "C", "AXP"]),
        );
        sectors.insert(
            "Energy".into(),
            sector(&["XOM", "CVX", "COP", "SLB", "EOG", "MPC", "PSX", "VLO"]),
        );
        sectors.insert(
            "Consumer".into(),
            sector(&["AMZN", "WMT", "PG", "KO", "PEP", "COST", "HD", "MCD", "NKE"]),
        );
        Self { sectors }
    }

    /// Serialize the universe to TOML.
    pub fn to_toml(&self) -> Result<String, UniverseError> {
        toml::to_string_pretty(self).map_err(|e| UniverseError::Parse(e.to_string()))
    }
}

#[async_trait]
impl UniverseSource for Universe {
    async fn load(&self) -> Result<Vec<Ticker>, UniverseError> {
        self.tickers()
    }
}

/// A fixed, already-flattened ticker list.
#[derive(Debug, Clone, Default)]
pub struct StaticUniverse(pub Vec<Ticker>);

#[async_trait]
impl UniverseSource for StaticUniverse {
    async fn load(&self) -> Result<Vec<Ticker>, UniverseError> {
        let mut seen = HashSet::new();
        for t in &self.0 {
            if !seen.insert(t.symbol.as_str()) {
                return Err(UniverseError::DuplicateTicker {
                    symbol: t.symbol.clone(),
                    first: t.sector.clone(),
                    second: t.sector.clone(),
                });
            }
        }
        Ok(self.0.clone())
    }
}

/// A universe TOML file read at load time.
#[derive(Debug, Clone)]
pub struct UniverseFile(pub PathBuf);

#[async_trait]
impl UniverseSource for UniverseFile {
    async fn load(&self) -> Result<Vec<Ticker>, UniverseError> {
        Universe::from_file(&self.0)?.tickers()
    }
}
