//! FundLab Runner: monthly fundamental backtests over a ticker universe.
//!
//! This crate builds on `fundlab-core` to provide:
//! - Time slice construction with concurrent price and filing fetches
//! - The `Selector` capability and a sector-leaders implementation
//! - The backtest engine and its trajectory
//! - Trajectory metrics, run configuration and artifact export

pub mod builder;
pub mod config;
pub mod engine;
pub mod export;
pub mod metrics;
pub mod runner;
pub mod selector;
pub mod trajectory;

pub use builder::{SliceBuild, SliceError, SliceWarning, TimeSliceBuilder};
pub use config::{BacktestConfig, ConfigError, RunId};
pub use engine::{
    BacktestEngine, BacktestRun, EngineConfig, EngineError, EngineState, RunFailure, SliceReport,
};
pub use export::{export_json, import_json, load_artifacts, save_artifacts};
pub use metrics::TrajectorySummary;
pub use runner::{default_selector, run_backtest, BacktestResult, RunError, SCHEMA_VERSION};
pub use selector::{
    allocate, LineItemScorer, Pick, Scorer, SectorLeaders, Selection, Selector, SelectorError,
};
pub use trajectory::{Holding, PortfolioTrajectory, TrajectoryError, TrajectoryPoint};

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn backtest_result_is_send_sync() {
        assert_send::<BacktestResult>();
        assert_sync::<BacktestResult>();
    }

    #[test]
    fn config_types_are_send_sync() {
        assert_send::<BacktestConfig>();
        assert_sync::<BacktestConfig>();
        assert_send::<EngineConfig>();
        assert_sync::<EngineConfig>();
    }

    #[test]
    fn engine_is_send() {
        assert_send::<BacktestEngine>();
        assert_send::<TimeSliceBuilder>();
        assert_sync::<TimeSliceBuilder>();
    }

    #[test]
    fn selectors_are_send_sync() {
        assert_send::<SectorLeaders>();
        assert_sync::<SectorLeaders>();
        assert_send::<Selection>();
    }

    #[test]
    fn trajectory_is_send_sync() {
        assert_send::<PortfolioTrajectory>();
        assert_sync::<PortfolioTrajectory>();
        assert_send::<TrajectorySummary>();
    }

    #[test]
    fn errors_are_send_sync() {
        assert_send::<RunError>();
        assert_sync::<RunError>();
        assert_send::<SliceError>();
        assert_send::<SelectorError>();
    }
}
