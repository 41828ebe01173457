//! FundLab Core: domain types and the market data layer.
//!
//! This crate contains:
//! - Domain types (tickers, financial filings, ticker-dates, time slices)
//! - The provider seam and its Polygon.io and in-memory implementations
//! - A rate-limited, retrying fetcher with a bounded number of in-flight requests
//! - An append-only, single-flight financial filing cache
//! - Universe configuration

pub mod data;
pub mod domain;
