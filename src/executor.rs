use crate::models::{
    Portfolio, Position, SignalAction, TradeReason, TradeRecord, VOLUME_EPSILON,
};
use chrono::{DateTime, Utc};
use log::debug;
use thiserror::Error;

const CASH_EPSILON: f64 = 1e-9;

/// Why a trade intent was not executed. Business rejections are expected
/// during a run; precondition violations indicate a caller bug or corrupt
/// input and halt the offending symbol.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RejectReason {
    #[error("insufficient capital: need {required:.2}, have {available:.2}")]
    InsufficientCapital { required: f64, available: f64 },
    #[error("insufficient position: requested {requested}, held {held}")]
    InsufficientPosition { requested: f64, held: f64 },
    #[error("invalid action '{0}' for execution")]
    InvalidAction(&'static str),
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
}

impl RejectReason {
    /// Precondition violations are programmer/data errors, distinct from the
    /// business rejections the orchestrator logs and skips past.
    pub fn is_precondition(&self) -> bool {
        matches!(self, RejectReason::InvalidParameters(_))
    }
}

/// One buy/sell intent against the portfolio.
pub struct TradeRequest<'a> {
    pub date: DateTime<Utc>,
    pub symbol: &'a str,
    pub action: SignalAction,
    pub price: f64,
    pub volume: f64,
    pub signal_quality: f64,
    /// Stored on the position when opening; ignored for sells.
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub reason: TradeReason,
}

/// Applies single trade intents to the portfolio, sequentially. Expected
/// business conditions come back as `Err(RejectReason)`, never panics.
pub struct TradeExecutor {
    slippage: f64,
}

impl TradeExecutor {
    pub fn new(slippage: f64) -> Self {
        Self { slippage }
    }

    pub fn execute(
        &self,
        portfolio: &mut Portfolio,
        request: TradeRequest,
    ) -> Result<TradeRecord, RejectReason> {
        if !request.price.is_finite() || request.price <= 0.0 {
            return Err(RejectReason::InvalidParameters(format!(
                "price must be positive and finite (value: {})",
                request.price
            )));
        }
        if !request.volume.is_finite() || request.volume <= 0.0 {
            return Err(RejectReason::InvalidParameters(format!(
                "volume must be positive and finite (value: {})",
                request.volume
            )));
        }

        match request.action {
            SignalAction::Buy => self.execute_buy(portfolio, request),
            SignalAction::Sell => self.execute_sell(portfolio, request),
            SignalAction::Hold => Err(RejectReason::InvalidAction("hold")),
        }
    }

    fn execute_buy(
        &self,
        portfolio: &mut Portfolio,
        request: TradeRequest,
    ) -> Result<TradeRecord, RejectReason> {
        let effective_price = request.price * (1.0 + self.slippage);
        let cost = effective_price * request.volume;

        if cost > portfolio.cash + CASH_EPSILON {
            return Err(RejectReason::InsufficientCapital {
                required: cost,
                available: portfolio.cash,
            });
        }

        portfolio.cash -= cost;
        if portfolio.cash < 0.0 {
            // Float drift from the epsilon tolerance above.
            portfolio.cash = 0.0;
        }

        let resulting_volume = match portfolio.positions.get_mut(request.symbol) {
            Some(position) => {
                let merged_volume = position.volume + request.volume;
                position.average_cost = (position.cost_value() + cost) / merged_volume;
                position.volume = merged_volume;
                if let Some(stop) = request.stop_loss {
                    position.stop_loss = Some(stop);
                }
                if let Some(target) = request.take_profit {
                    position.take_profit = Some(target);
                }
                merged_volume
            }
            None => {
                portfolio.positions.insert(
                    request.symbol.to_string(),
                    Position {
                        volume: request.volume,
                        average_cost: effective_price,
                        entry_price: effective_price,
                        entry_date: request.date,
                        stop_loss: request.stop_loss,
                        take_profit: request.take_profit,
                    },
                );
                request.volume
            }
        };

        let equity = portfolio.cash
            + portfolio.holdings_value(|symbol| (symbol == request.symbol).then_some(effective_price));
        portfolio.record_equity(equity);

        debug!(
            "buy {} x{:.4} @ {:.4} (cash {:.2})",
            request.symbol, request.volume, effective_price, portfolio.cash
        );

        Ok(TradeRecord {
            date: request.date,
            symbol: request.symbol.to_string(),
            action: SignalAction::Buy,
            price: effective_price,
            volume: request.volume,
            resulting_volume,
            realized_profit: None,
            drawdown: portfolio.current_drawdown,
            entry_price: Some(effective_price),
            exit_price: None,
            holding_days: None,
            signal_quality: request.signal_quality,
            reason: request.reason,
        })
    }

    fn execute_sell(
        &self,
        portfolio: &mut Portfolio,
        request: TradeRequest,
    ) -> Result<TradeRecord, RejectReason> {
        let Some(position) = portfolio.positions.get_mut(request.symbol) else {
            return Err(RejectReason::InvalidParameters(format!(
                "sell for symbol '{}' with no open position",
                request.symbol
            )));
        };

        let held = position.volume;
        if request.volume > held + VOLUME_EPSILON {
            return Err(RejectReason::InsufficientPosition {
                requested: request.volume,
                held,
            });
        }
        // Sells within epsilon of the held volume close the position fully so
        // float drift cannot orphan dust.
        let sold_volume = request.volume.min(held);

        let average_cost = position.average_cost;
        let entry_date = position.entry_date;
        let remaining = held - sold_volume;
        let resulting_volume = if remaining <= VOLUME_EPSILON {
            portfolio.positions.remove(request.symbol);
            0.0
        } else {
            position.volume = remaining;
            remaining
        };

        let effective_price = request.price * (1.0 - self.slippage);
        let proceeds = effective_price * sold_volume;
        let realized_profit = (effective_price - average_cost) * sold_volume;

        portfolio.cash += proceeds;

        if realized_profit > 0.0 {
            portfolio.consecutive_losses = 0;
        } else {
            portfolio.consecutive_losses += 1;
        }

        let equity = portfolio.cash
            + portfolio.holdings_value(|symbol| (symbol == request.symbol).then_some(effective_price));
        portfolio.record_equity(equity);

        debug!(
            "sell {} x{:.4} @ {:.4} pnl {:.2} ({})",
            request.symbol,
            sold_volume,
            effective_price,
            realized_profit,
            request.reason.as_str()
        );

        Ok(TradeRecord {
            date: request.date,
            symbol: request.symbol.to_string(),
            action: SignalAction::Sell,
            price: effective_price,
            volume: sold_volume,
            resulting_volume,
            realized_profit: Some(realized_profit),
            drawdown: portfolio.current_drawdown,
            entry_price: Some(average_cost),
            exit_price: Some(effective_price),
            holding_days: Some((request.date - entry_date).num_days()),
            signal_quality: request.signal_quality,
            reason: request.reason,
        })
    }
}
