//! Market data: provider seam, rate-limited fetching, filing cache, universe.

pub mod cache;
pub mod circuit_breaker;
pub mod fetcher;
pub mod memory;
pub mod polygon;
pub mod provider;
pub mod rate_limit;
pub mod universe;

pub use cache::{CacheConfig, CacheError, CacheSnapshot, FinancialFilingCache, TickerSnapshot};
pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use fetcher::{
    FetchKey, FetchRequest, FetchResponse, FetchStatsSnapshot, FetcherConfig, RateLimitedFetcher,
    RetryPolicy,
};
pub use memory::InMemoryProvider;
pub use polygon::PolygonProvider;
pub use provider::{DataError, DataKind, DataProvider, FilingWindow};
pub use rate_limit::RateLimiter;
pub use universe::{StaticUniverse, Universe, UniverseError, UniverseFile, UniverseSource};
