use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// Positions whose volume falls below this are treated as fully closed.
pub const VOLUME_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceBar {
    pub symbol: String,
    pub date: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume_shares: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl SignalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::Buy => "buy",
            SignalAction::Sell => "sell",
            SignalAction::Hold => "hold",
        }
    }
}

impl FromStr for SignalAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buy" => Ok(SignalAction::Buy),
            "sell" => Ok(SignalAction::Sell),
            "hold" => Ok(SignalAction::Hold),
            other => Err(anyhow!("Unknown signal action '{}'", other)),
        }
    }
}

/// Broad market regime attached to a signal by the upstream indicator layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketCondition {
    Bull,
    Sideways,
    Bear,
}

impl MarketCondition {
    /// Sizing multiplier for the regime. Bear markets halve the risk budget.
    pub fn score(&self) -> f64 {
        match self {
            MarketCondition::Bull => 1.0,
            MarketCondition::Sideways => 0.75,
            MarketCondition::Bear => 0.5,
        }
    }
}

/// Strategy recommendation for one bar, produced outside this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub date: DateTime<Utc>,
    pub symbol: String,
    pub action: SignalAction,
    pub price: f64,
    /// Signal quality in [0, 1]; scales the risk budget.
    pub quality: f64,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    pub condition: MarketCondition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub volume: f64,
    pub average_cost: f64,
    pub entry_price: f64,
    pub entry_date: DateTime<Utc>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

impl Position {
    pub fn cost_value(&self) -> f64 {
        self.volume * self.average_cost
    }
}

/// Account state mutated strictly sequentially by the executor.
///
/// A symbol appears in `positions` iff its volume exceeds `VOLUME_EPSILON`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Portfolio {
    pub initial_capital: f64,
    pub cash: f64,
    pub positions: HashMap<String, Position>,
    pub peak_equity: f64,
    pub current_drawdown: f64,
    pub consecutive_losses: u32,
}

impl Portfolio {
    pub fn new(initial_capital: f64) -> Self {
        Self {
            initial_capital,
            cash: initial_capital,
            positions: HashMap::new(),
            peak_equity: initial_capital,
            current_drawdown: 0.0,
            consecutive_losses: 0,
        }
    }

    pub fn open_volume(&self, symbol: &str) -> f64 {
        self.positions.get(symbol).map(|p| p.volume).unwrap_or(0.0)
    }

    /// Sum of open positions valued through `price_of`, falling back to the
    /// position's average cost when no mark is available.
    pub fn holdings_value<F>(&self, price_of: F) -> f64
    where
        F: Fn(&str) -> Option<f64>,
    {
        self.positions
            .iter()
            .map(|(symbol, position)| {
                let mark = price_of(symbol).unwrap_or(position.average_cost);
                position.volume * mark
            })
            .sum()
    }

    /// Records the current equity, maintaining `peak_equity >= equity` and
    /// `current_drawdown = peak_equity - equity >= 0`.
    pub fn record_equity(&mut self, equity: f64) {
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
        self.current_drawdown = self.peak_equity - equity;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeReason {
    Signal,
    StopLoss,
    TakeProfit,
    TrailingStop,
    TimeStop,
    EndOfBacktest,
}

impl TradeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeReason::Signal => "signal",
            TradeReason::StopLoss => "stop_loss",
            TradeReason::TakeProfit => "take_profit",
            TradeReason::TrailingStop => "trailing_stop",
            TradeReason::TimeStop => "time_stop",
            TradeReason::EndOfBacktest => "end_of_backtest",
        }
    }
}

/// Immutable record of one executed trade. Append-only: once emitted it is
/// never mutated and is the sole input to the metrics aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRecord {
    pub date: DateTime<Utc>,
    pub symbol: String,
    pub action: SignalAction,
    /// Effective (slippage-adjusted) execution price.
    pub price: f64,
    pub volume: f64,
    pub resulting_volume: f64,
    /// Set for sells only.
    pub realized_profit: Option<f64>,
    pub drawdown: f64,
    pub entry_price: Option<f64>,
    pub exit_price: Option<f64>,
    pub holding_days: Option<i64>,
    pub signal_quality: f64,
    pub reason: TradeReason,
}

/// One per trading day, recorded after all of that day's executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EquityPoint {
    pub date: DateTime<Utc>,
    pub equity: f64,
    pub cash: f64,
    pub positions_value: f64,
    pub open_positions: i32,
}

/// A signal the orchestrator could not act on, with the rejection reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalSkip {
    pub date: DateTime<Utc>,
    pub symbol: String,
    pub action: SignalAction,
    pub reason: String,
}

/// Aggregate statistics over a completed run. All ratios are derived from the
/// combined trade totals, never updated incrementally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSummary {
    pub total_trades: i32,
    pub winning_trades: i32,
    pub losing_trades: i32,
    pub win_rate: f64,
    pub total_profit: f64,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub profit_factor: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub best_trade: f64,
    pub worst_trade: f64,
    pub max_consecutive_wins: i32,
    pub max_consecutive_losses: i32,
    pub max_drawdown: f64,
    pub annualized_return: f64,
    pub annualized_volatility: f64,
    pub sharpe_ratio: f64,
    pub avg_holding_days: f64,
    pub max_holding_days: i64,
    pub matched_round_trips: i32,
}

impl PerformanceSummary {
    /// Documented zero-struct returned for empty trade lists.
    pub fn empty() -> Self {
        Self {
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            win_rate: 0.0,
            total_profit: 0.0,
            gross_profit: 0.0,
            gross_loss: 0.0,
            profit_factor: 0.0,
            avg_win: 0.0,
            avg_loss: 0.0,
            best_trade: 0.0,
            worst_trade: 0.0,
            max_consecutive_wins: 0,
            max_consecutive_losses: 0,
            max_drawdown: 0.0,
            annualized_return: 0.0,
            annualized_volatility: 0.0,
            sharpe_ratio: 0.0,
            avg_holding_days: 0.0,
            max_holding_days: 0,
            matched_round_trips: 0,
        }
    }
}

/// Full output of a run: the trade list, the aggregate metrics, and the
/// serializable equity/return series they were derived from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestResult {
    pub id: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub initial_capital: f64,
    pub final_equity: f64,
    pub performance: PerformanceSummary,
    pub equity_curve: Vec<EquityPoint>,
    pub daily_returns: Vec<f64>,
    pub trades: Vec<TradeRecord>,
    pub signal_skips: Vec<SignalSkip>,
    pub halted_symbols: Vec<String>,
    pub created_at: DateTime<Utc>,
}
