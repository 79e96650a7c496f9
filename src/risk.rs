use crate::config::BacktestConfig;
use crate::models::TradeReason;
use chrono::{DateTime, Utc};
use log::debug;
use std::collections::HashMap;

const STOP_EPSILON: f64 = 1e-9;

/// Outcome of evaluating one open position against the current bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDecision {
    Hold,
    StopLossHit,
    TakeProfitHit,
    TrailingStopHit,
    TimeStopHit,
}

impl ExitDecision {
    pub fn reason(&self) -> Option<TradeReason> {
        match self {
            ExitDecision::Hold => None,
            ExitDecision::StopLossHit => Some(TradeReason::StopLoss),
            ExitDecision::TakeProfitHit => Some(TradeReason::TakeProfit),
            ExitDecision::TrailingStopHit => Some(TradeReason::TrailingStop),
            ExitDecision::TimeStopHit => Some(TradeReason::TimeStop),
        }
    }
}

/// Stop/target state shadowing one open position. Created on open, discarded
/// on close.
#[derive(Debug, Clone)]
pub struct RiskState {
    pub active_stop_loss: f64,
    pub initial_stop_loss: f64,
    pub active_take_profit: Option<f64>,
    pub high_water_mark: f64,
    pub entry_price: f64,
    pub opened_at: DateTime<Utc>,
}

/// Decides forced exits independent of the strategy's own signals.
///
/// Evaluation priority is fixed: stop-loss/trailing-stop, then take-profit,
/// then time-stop. The first condition that fires wins.
pub struct RiskController {
    config: BacktestConfig,
    states: HashMap<String, RiskState>,
}

impl RiskController {
    pub fn new(config: &BacktestConfig) -> Self {
        Self {
            config: config.clone(),
            states: HashMap::new(),
        }
    }

    pub fn open(
        &mut self,
        symbol: &str,
        entry_price: f64,
        stop_loss: f64,
        take_profit: Option<f64>,
        opened_at: DateTime<Utc>,
    ) {
        self.states.insert(
            symbol.to_string(),
            RiskState {
                active_stop_loss: stop_loss,
                initial_stop_loss: stop_loss,
                active_take_profit: take_profit,
                high_water_mark: entry_price,
                entry_price,
                opened_at,
            },
        );
    }

    /// Ratchets the trailing stop and checks every forced-exit condition for
    /// a long position. Returns `Hold` for symbols with no tracked state.
    pub fn evaluate(&mut self, symbol: &str, price: f64, date: DateTime<Utc>) -> ExitDecision {
        let Some(state) = self.states.get_mut(symbol) else {
            return ExitDecision::Hold;
        };

        // The trailing stop only ratchets upward, and only while the position
        // is in profit.
        if self.config.use_trailing_stop && price > state.entry_price {
            let candidate = price * (1.0 - self.config.trailing_stop_pct);
            if candidate > state.active_stop_loss {
                debug!(
                    "{}: trailing stop {:.4} -> {:.4} at price {:.4}",
                    symbol, state.active_stop_loss, candidate, price
                );
                state.active_stop_loss = candidate;
            }
        }
        if price > state.high_water_mark {
            state.high_water_mark = price;
        }

        if price <= state.active_stop_loss {
            if state.active_stop_loss > state.initial_stop_loss + STOP_EPSILON {
                return ExitDecision::TrailingStopHit;
            }
            return ExitDecision::StopLossHit;
        }

        if let Some(target) = state.active_take_profit {
            if price >= target {
                return ExitDecision::TakeProfitHit;
            }
        }

        if self.config.use_time_stop {
            let held_days = (date - state.opened_at).num_days();
            if held_days >= self.config.max_holding_days {
                return ExitDecision::TimeStopHit;
            }
        }

        ExitDecision::Hold
    }

    /// Drops the state for a closed position. Must be called exactly once per
    /// close, whether strategy-driven or forced.
    pub fn close(&mut self, symbol: &str) {
        if self.states.remove(symbol).is_none() {
            debug!("close called for untracked symbol {}", symbol);
        }
    }

    pub fn state(&self, symbol: &str) -> Option<&RiskState> {
        self.states.get(symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn day(offset: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(offset)
    }

    fn controller() -> RiskController {
        let mut config = BacktestConfig::default();
        config.trailing_stop_pct = 0.05;
        config.max_holding_days = 10;
        RiskController::new(&config)
    }

    #[test]
    fn trailing_stop_only_rises() {
        let mut risk = controller();
        risk.open("AAA", 100.0, 99.75, None, day(0));

        assert_eq!(risk.evaluate("AAA", 105.0, day(1)), ExitDecision::Hold);
        assert!((risk.state("AAA").unwrap().active_stop_loss - 99.75).abs() < 1e-9);

        assert_eq!(risk.evaluate("AAA", 110.0, day(2)), ExitDecision::Hold);
        assert!((risk.state("AAA").unwrap().active_stop_loss - 104.5).abs() < 1e-9);

        // Price pulls back; the stop must not move down and 108 > 104.5 so no exit.
        assert_eq!(risk.evaluate("AAA", 108.0, day(3)), ExitDecision::Hold);
        assert!((risk.state("AAA").unwrap().active_stop_loss - 104.5).abs() < 1e-9);
    }

    #[test]
    fn trailing_stop_is_monotonic_under_rising_prices() {
        let mut risk = controller();
        risk.open("AAA", 100.0, 95.0, None, day(0));

        let mut last_stop = risk.state("AAA").unwrap().active_stop_loss;
        for (i, price) in [101.0, 103.0, 104.0, 108.0, 112.0, 120.0].iter().enumerate() {
            risk.evaluate("AAA", *price, day(i as i64 + 1));
            let stop = risk.state("AAA").unwrap().active_stop_loss;
            assert!(stop >= last_stop);
            last_stop = stop;
        }
    }

    #[test]
    fn ratcheted_stop_reports_trailing_exit() {
        let mut risk = controller();
        risk.open("AAA", 100.0, 95.0, None, day(0));

        risk.evaluate("AAA", 110.0, day(1)); // stop ratchets to 104.5
        assert_eq!(
            risk.evaluate("AAA", 104.0, day(2)),
            ExitDecision::TrailingStopHit
        );
    }

    #[test]
    fn untouched_stop_reports_plain_stop_loss() {
        let mut risk = controller();
        risk.open("AAA", 100.0, 95.0, None, day(0));
        assert_eq!(
            risk.evaluate("AAA", 94.0, day(1)),
            ExitDecision::StopLossHit
        );
    }

    #[test]
    fn take_profit_fires_at_or_above_target() {
        let mut risk = controller();
        risk.open("AAA", 100.0, 95.0, Some(101.0), day(0));
        assert_eq!(
            risk.evaluate("AAA", 101.0, day(1)),
            ExitDecision::TakeProfitHit
        );
    }

    #[test]
    fn time_stop_fires_at_or_after_max_holding() {
        let mut risk = controller();
        risk.open("AAA", 100.0, 95.0, None, day(0));

        assert_eq!(risk.evaluate("AAA", 100.0, day(9)), ExitDecision::Hold);
        assert_eq!(risk.evaluate("AAA", 100.0, day(10)), ExitDecision::TimeStopHit);

        // A position still open past the deadline triggers on first evaluation.
        let mut late = controller();
        late.open("BBB", 100.0, 95.0, None, day(0));
        assert_eq!(late.evaluate("BBB", 100.0, day(11)), ExitDecision::TimeStopHit);
    }

    #[test]
    fn stop_loss_wins_over_time_stop() {
        let mut risk = controller();
        risk.open("AAA", 100.0, 95.0, None, day(0));
        // Both conditions true on day 12; priority picks the stop.
        assert_eq!(
            risk.evaluate("AAA", 90.0, day(12)),
            ExitDecision::StopLossHit
        );
    }

    #[test]
    fn disabled_time_stop_never_fires() {
        let mut config = BacktestConfig::default();
        config.use_time_stop = false;
        config.max_holding_days = 10;
        let mut risk = RiskController::new(&config);
        risk.open("AAA", 100.0, 95.0, None, day(0));
        assert_eq!(risk.evaluate("AAA", 100.0, day(30)), ExitDecision::Hold);
    }

    #[test]
    fn close_discards_state_and_unknown_symbols_hold() {
        let mut risk = controller();
        risk.open("AAA", 100.0, 95.0, None, day(0));
        risk.close("AAA");
        assert!(risk.state("AAA").is_none());
        assert_eq!(risk.evaluate("AAA", 1.0, day(1)), ExitDecision::Hold);
    }
}
