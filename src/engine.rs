use crate::config::BacktestConfig;
use crate::executor::{RejectReason, TradeExecutor, TradeRequest};
use crate::models::{
    BacktestResult, EquityPoint, Portfolio, PriceBar, Signal, SignalAction, SignalSkip,
    TradeReason, TradeRecord,
};
use crate::performance::MetricsAggregator;
use crate::risk::RiskController;
use crate::sizing::{determine_volume, SizingOutcome, SizingParams};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

/// Drives one backtest: bars and signals in, a `BacktestResult` out.
///
/// The loop is strictly sequential per calendar day. For each day, every
/// symbol's open position is first checked for forced exits, then that day's
/// signals are applied, then equity is marked at the closes. Metrics over the
/// finished trade list are the only parallel stage.
pub struct Backtester {
    config: BacktestConfig,
    executor: TradeExecutor,
    aggregator: MetricsAggregator,
}

impl Backtester {
    pub fn new(config: BacktestConfig) -> Result<Self> {
        config.validate()?;
        let executor = TradeExecutor::new(config.slippage);
        let aggregator = MetricsAggregator::new(config.risk_free_rate);
        Ok(Self {
            config,
            executor,
            aggregator,
        })
    }

    pub fn run(&self, bars: &[PriceBar], signals: &[Signal]) -> Result<BacktestResult> {
        let mut bars_by_date: BTreeMap<DateTime<Utc>, Vec<&PriceBar>> = BTreeMap::new();
        for bar in bars {
            bars_by_date.entry(bar.date).or_default().push(bar);
        }
        if bars_by_date.is_empty() {
            return Err(anyhow!("no price bars supplied"));
        }
        // Symbol order within a day is fixed so runs are reproducible.
        for day_bars in bars_by_date.values_mut() {
            day_bars.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        }

        let mut pending_signals: HashMap<(DateTime<Utc>, String), &Signal> = HashMap::new();
        for signal in signals {
            if let Some(previous) =
                pending_signals.insert((signal.date, signal.symbol.clone()), signal)
            {
                warn!(
                    "duplicate signal for {} on {}, keeping the later one (was {})",
                    signal.symbol,
                    signal.date.date_naive(),
                    previous.action.as_str()
                );
            }
        }

        let start_date = *bars_by_date.keys().next().unwrap_or(&Utc::now());
        let end_date = *bars_by_date.keys().next_back().unwrap_or(&start_date);
        info!(
            "backtest over {} days, {} bars, {} signals, capital {:.2}",
            bars_by_date.len(),
            bars.len(),
            signals.len(),
            self.config.initial_capital
        );

        let mut portfolio = Portfolio::new(self.config.initial_capital);
        let mut risk = RiskController::new(&self.config);
        let mut trades: Vec<TradeRecord> = Vec::new();
        let mut skips: Vec<SignalSkip> = Vec::new();
        let mut halted: HashSet<String> = HashSet::new();
        let mut equity_curve: Vec<EquityPoint> = Vec::new();
        let mut daily_returns: Vec<f64> = Vec::new();

        let mut history: HashMap<String, Vec<&PriceBar>> = HashMap::new();
        let mut last_close: HashMap<String, f64> = HashMap::new();
        let mut previous_equity = self.config.initial_capital;

        for (&date, day_bars) in &bars_by_date {
            for &bar in day_bars {
                history.entry(bar.symbol.clone()).or_default().push(bar);
                last_close.insert(bar.symbol.clone(), bar.close);

                if halted.contains(&bar.symbol) {
                    if let Some(signal) = pending_signals.remove(&(date, bar.symbol.clone())) {
                        skips.push(SignalSkip {
                            date,
                            symbol: signal.symbol.clone(),
                            action: signal.action,
                            reason: "symbol halted".to_string(),
                        });
                    }
                    continue;
                }

                self.apply_forced_exit(
                    bar,
                    date,
                    &mut portfolio,
                    &mut risk,
                    &mut trades,
                    &mut halted,
                );

                if let Some(signal) = pending_signals.remove(&(date, bar.symbol.clone())) {
                    self.apply_signal(
                        signal,
                        &history,
                        &mut portfolio,
                        &mut risk,
                        &mut trades,
                        &mut skips,
                        &mut halted,
                    );
                }
            }

            if date == end_date {
                self.liquidate_open_positions(
                    date,
                    &last_close,
                    &mut portfolio,
                    &mut risk,
                    &mut trades,
                    &mut halted,
                );
            }

            let positions_value =
                portfolio.holdings_value(|symbol| last_close.get(symbol).copied());
            let equity = portfolio.cash + positions_value;
            portfolio.record_equity(equity);
            equity_curve.push(EquityPoint {
                date,
                equity,
                cash: portfolio.cash,
                positions_value,
                open_positions: portfolio.positions.len() as i32,
            });
            daily_returns.push(if previous_equity > 0.0 {
                equity / previous_equity - 1.0
            } else {
                0.0
            });
            previous_equity = equity;
        }

        // Signals that never met a price bar.
        for ((date, symbol), signal) in pending_signals {
            skips.push(SignalSkip {
                date,
                symbol,
                action: signal.action,
                reason: "no price bar for signal date".to_string(),
            });
        }

        let final_equity = previous_equity;
        let performance = self.aggregator.compute(&trades, &daily_returns);
        let mut halted_symbols: Vec<String> = halted.into_iter().collect();
        halted_symbols.sort();

        info!(
            "backtest finished: {} trades, {} skips, final equity {:.2}",
            trades.len(),
            skips.len(),
            final_equity
        );

        Ok(BacktestResult {
            id: Uuid::new_v4().to_string(),
            start_date,
            end_date,
            initial_capital: self.config.initial_capital,
            final_equity,
            performance,
            equity_curve,
            daily_returns,
            trades,
            signal_skips: skips,
            halted_symbols,
            created_at: Utc::now(),
        })
    }

    fn apply_forced_exit(
        &self,
        bar: &PriceBar,
        date: DateTime<Utc>,
        portfolio: &mut Portfolio,
        risk: &mut RiskController,
        trades: &mut Vec<TradeRecord>,
        halted: &mut HashSet<String>,
    ) {
        let volume = portfolio.open_volume(&bar.symbol);
        if volume <= 0.0 {
            return;
        }
        let decision = risk.evaluate(&bar.symbol, bar.close, date);
        let Some(reason) = decision.reason() else {
            return;
        };

        let request = TradeRequest {
            date,
            symbol: &bar.symbol,
            action: SignalAction::Sell,
            price: bar.close,
            volume,
            signal_quality: 0.0,
            stop_loss: None,
            take_profit: None,
            reason,
        };
        match self.executor.execute(portfolio, request) {
            Ok(record) => {
                debug!(
                    "forced exit {} x{:.4} ({})",
                    bar.symbol,
                    record.volume,
                    reason.as_str()
                );
                trades.push(record);
                risk.close(&bar.symbol);
            }
            Err(error) => self.handle_rejection(&bar.symbol, &error, halted),
        }
    }

    fn apply_signal(
        &self,
        signal: &Signal,
        history: &HashMap<String, Vec<&PriceBar>>,
        portfolio: &mut Portfolio,
        risk: &mut RiskController,
        trades: &mut Vec<TradeRecord>,
        skips: &mut Vec<SignalSkip>,
        halted: &mut HashSet<String>,
    ) {
        match signal.action {
            SignalAction::Hold => {}
            SignalAction::Buy => {
                if portfolio.open_volume(&signal.symbol) > 0.0 {
                    skips.push(SignalSkip {
                        date: signal.date,
                        symbol: signal.symbol.clone(),
                        action: signal.action,
                        reason: "position already open".to_string(),
                    });
                    return;
                }

                let stop_loss = signal
                    .stop_loss
                    .unwrap_or_else(|| self.derived_stop(signal, history));

                let outcome = determine_volume(SizingParams {
                    price: signal.price,
                    stop_loss,
                    quality: signal.quality,
                    market_score: signal.condition.score(),
                    portfolio,
                    config: &self.config,
                });
                let allocation = match outcome {
                    SizingOutcome::Sized(allocation) => allocation,
                    SizingOutcome::TooSmall => {
                        skips.push(SignalSkip {
                            date: signal.date,
                            symbol: signal.symbol.clone(),
                            action: signal.action,
                            reason: "position size below tradable minimum".to_string(),
                        });
                        return;
                    }
                };

                let request = TradeRequest {
                    date: signal.date,
                    symbol: &signal.symbol,
                    action: SignalAction::Buy,
                    price: signal.price,
                    volume: allocation.volume,
                    signal_quality: signal.quality,
                    stop_loss: Some(stop_loss),
                    take_profit: signal.take_profit,
                    reason: TradeReason::Signal,
                };
                match self.executor.execute(portfolio, request) {
                    Ok(record) => {
                        risk.open(
                            &signal.symbol,
                            record.price,
                            stop_loss,
                            signal.take_profit,
                            signal.date,
                        );
                        trades.push(record);
                    }
                    Err(error) => {
                        self.handle_rejection(&signal.symbol, &error, halted);
                        skips.push(SignalSkip {
                            date: signal.date,
                            symbol: signal.symbol.clone(),
                            action: signal.action,
                            reason: error.to_string(),
                        });
                    }
                }
            }
            SignalAction::Sell => {
                let volume = portfolio.open_volume(&signal.symbol);
                if volume <= 0.0 {
                    skips.push(SignalSkip {
                        date: signal.date,
                        symbol: signal.symbol.clone(),
                        action: signal.action,
                        reason: "no open position to sell".to_string(),
                    });
                    return;
                }

                let request = TradeRequest {
                    date: signal.date,
                    symbol: &signal.symbol,
                    action: SignalAction::Sell,
                    price: signal.price,
                    volume,
                    signal_quality: signal.quality,
                    stop_loss: None,
                    take_profit: None,
                    reason: TradeReason::Signal,
                };
                match self.executor.execute(portfolio, request) {
                    Ok(record) => {
                        trades.push(record);
                        risk.close(&signal.symbol);
                    }
                    Err(error) => {
                        self.handle_rejection(&signal.symbol, &error, halted);
                        skips.push(SignalSkip {
                            date: signal.date,
                            symbol: signal.symbol.clone(),
                            action: signal.action,
                            reason: error.to_string(),
                        });
                    }
                }
            }
        }
    }

    /// Stop distance when the signal carries none: average true range over the
    /// configured period, else a flat percent of the entry price while the
    /// history is still too short.
    fn derived_stop(&self, signal: &Signal, history: &HashMap<String, Vec<&PriceBar>>) -> f64 {
        let fallback = signal.price * (1.0 - self.config.fallback_stop_ratio);
        let Some(series) = history.get(&signal.symbol) else {
            return fallback;
        };
        let Some(atr) = average_true_range(series, self.config.atr_period) else {
            return fallback;
        };
        let stop = signal.price - self.config.atr_multiplier * atr;
        if stop > 0.0 {
            stop
        } else {
            fallback
        }
    }

    fn liquidate_open_positions(
        &self,
        date: DateTime<Utc>,
        last_close: &HashMap<String, f64>,
        portfolio: &mut Portfolio,
        risk: &mut RiskController,
        trades: &mut Vec<TradeRecord>,
        halted: &mut HashSet<String>,
    ) {
        let mut open: Vec<(String, f64)> = portfolio
            .positions
            .iter()
            .map(|(symbol, position)| (symbol.clone(), position.volume))
            .collect();
        open.sort_by(|a, b| a.0.cmp(&b.0));

        for (symbol, volume) in open {
            let Some(&price) = last_close.get(&symbol) else {
                warn!("no closing price to liquidate {}", symbol);
                continue;
            };
            let request = TradeRequest {
                date,
                symbol: &symbol,
                action: SignalAction::Sell,
                price,
                volume,
                signal_quality: 0.0,
                stop_loss: None,
                take_profit: None,
                reason: TradeReason::EndOfBacktest,
            };
            match self.executor.execute(portfolio, request) {
                Ok(record) => {
                    trades.push(record);
                    risk.close(&symbol);
                }
                Err(error) => self.handle_rejection(&symbol, &error, halted),
            }
        }
    }

    /// Business rejections are logged and skipped; precondition violations
    /// halt the symbol for the rest of the run.
    fn handle_rejection(&self, symbol: &str, error: &RejectReason, halted: &mut HashSet<String>) {
        if error.is_precondition() {
            warn!("halting {}: {}", symbol, error);
            halted.insert(symbol.to_string());
        } else {
            debug!("trade rejected for {}: {}", symbol, error);
        }
    }
}

/// Classic ATR over the trailing `period` true ranges. Needs `period + 1`
/// bars for the previous-close term; returns `None` until then.
fn average_true_range(series: &[&PriceBar], period: usize) -> Option<f64> {
    if period == 0 || series.len() < period + 1 {
        return None;
    }
    let window = &series[series.len() - (period + 1)..];
    let mut total = 0.0;
    for pair in window.windows(2) {
        let previous_close = pair[0].close;
        let bar = pair[1];
        let range = (bar.high - bar.low)
            .max((bar.high - previous_close).abs())
            .max((bar.low - previous_close).abs());
        total += range;
    }
    Some(total / period as f64)
}
