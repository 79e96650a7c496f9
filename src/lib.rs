pub mod cache;
pub mod config;
pub mod engine;
pub mod executor;
pub mod models;
pub mod performance;
pub mod risk;
pub mod sizing;

pub use config::BacktestConfig;
pub use engine::Backtester;
pub use executor::{RejectReason, TradeExecutor};
pub use models::{
    BacktestResult, EquityPoint, MarketCondition, PerformanceSummary, Portfolio, Position,
    PriceBar, Signal, SignalAction, SignalSkip, TradeReason, TradeRecord,
};
pub use performance::MetricsAggregator;
pub use risk::{ExitDecision, RiskController};
