use crate::cache::{trade_list_key, MetricsCache};
use crate::models::{PerformanceSummary, SignalAction, TradeRecord, VOLUME_EPSILON};
use chrono::{DateTime, Utc};
use log::debug;
use rayon::prelude::*;
use statrs::statistics::Statistics;
use std::collections::{HashMap, VecDeque};

const TRADING_DAYS_PER_YEAR: f64 = 252.0;
const DEFAULT_BATCH_COUNT: usize = 4;

/// Computes aggregate statistics over an immutable trade list.
///
/// The trade list is split into batches computed in parallel; per-batch
/// partials are combined in batch index order with operations that are exact
/// (partial sums, maxima, associative segment merges), so the result does not
/// depend on batch count or scheduling. Results are cached by the
/// content-derived identity of the trade list.
pub struct MetricsAggregator {
    batch_count: usize,
    risk_free_rate: f64,
    cache: MetricsCache,
}

impl MetricsAggregator {
    pub fn new(risk_free_rate: f64) -> Self {
        Self::with_batch_count(risk_free_rate, DEFAULT_BATCH_COUNT.min(num_cpus::get().max(1)))
    }

    pub fn with_batch_count(risk_free_rate: f64, batch_count: usize) -> Self {
        Self {
            batch_count: batch_count.max(1),
            risk_free_rate,
            cache: MetricsCache::new(),
        }
    }

    pub fn compute(&self, trades: &[TradeRecord], daily_returns: &[f64]) -> PerformanceSummary {
        let key = trade_list_key(trades);
        if let Some(hit) = self.cache.get(key) {
            return hit;
        }

        let summary = compute_summary(trades, daily_returns, self.batch_count, self.risk_free_rate);
        self.cache.insert_if_absent(key, summary)
    }

    pub fn cached_results(&self) -> usize {
        self.cache.len()
    }
}

fn compute_summary(
    trades: &[TradeRecord],
    daily_returns: &[f64],
    batch_count: usize,
    risk_free_rate: f64,
) -> PerformanceSummary {
    if trades.is_empty() && daily_returns.is_empty() {
        return PerformanceSummary::empty();
    }

    let combined = if trades.is_empty() {
        BatchPartial::default()
    } else {
        let chunk_size = trades.len().div_ceil(batch_count).max(1);
        debug!(
            "aggregating {} trades in {} batches",
            trades.len(),
            trades.len().div_ceil(chunk_size)
        );
        // collect preserves chunk order, so the fold below always combines
        // batch 0..n left to right regardless of which thread finished first.
        let partials: Vec<BatchPartial> = trades
            .par_chunks(chunk_size)
            .map(BatchPartial::from_chunk)
            .collect();
        partials
            .into_iter()
            .fold(BatchPartial::default(), BatchPartial::merge)
    };

    let (annualized_return, annualized_volatility, sharpe_ratio) =
        return_statistics(daily_returns, risk_free_rate);

    let counted_sells = combined.wins + combined.losses;
    let win_rate = if counted_sells > 0 {
        combined.wins as f64 / counted_sells as f64
    } else {
        0.0
    };
    let profit_factor = if combined.gross_loss.abs() > f64::EPSILON {
        combined.gross_profit / combined.gross_loss.abs()
    } else {
        // No losing trades: fall back to the numerator alone.
        combined.gross_profit
    };
    let avg_win = if combined.wins > 0 {
        combined.gross_profit / combined.wins as f64
    } else {
        0.0
    };
    let avg_loss = if combined.losses > 0 {
        combined.gross_loss / combined.losses as f64
    } else {
        0.0
    };
    let avg_holding_days = if combined.holding.matched > 0 {
        combined.holding.sum_days / combined.holding.matched as f64
    } else {
        0.0
    };

    PerformanceSummary {
        total_trades: combined.records,
        winning_trades: combined.wins,
        losing_trades: combined.losses,
        win_rate,
        total_profit: combined.total_profit,
        gross_profit: combined.gross_profit,
        gross_loss: combined.gross_loss,
        profit_factor,
        avg_win,
        avg_loss,
        best_trade: combined.best.unwrap_or(0.0),
        worst_trade: combined.worst.unwrap_or(0.0),
        max_consecutive_wins: combined.win_runs.best,
        max_consecutive_losses: combined.loss_runs.best,
        max_drawdown: combined.max_drawdown,
        annualized_return,
        annualized_volatility,
        sharpe_ratio,
        avg_holding_days,
        max_holding_days: combined.holding.max_days,
        matched_round_trips: combined.holding.matched,
    }
}

fn return_statistics(daily_returns: &[f64], risk_free_rate: f64) -> (f64, f64, f64) {
    if daily_returns.len() < 2 {
        return (0.0, 0.0, 0.0);
    }

    let returns = daily_returns.to_vec();
    let mean_return = returns.clone().mean();
    let std_dev = returns.std_dev();
    if !mean_return.is_finite() || !std_dev.is_finite() {
        return (0.0, 0.0, 0.0);
    }

    let annualized_return = mean_return * TRADING_DAYS_PER_YEAR;
    let annualized_volatility = std_dev * TRADING_DAYS_PER_YEAR.sqrt();
    // Zero variance yields Sharpe 0 rather than NaN/Inf.
    let sharpe_ratio = if annualized_volatility > 0.0 {
        (annualized_return - risk_free_rate) / annualized_volatility
    } else {
        0.0
    };

    (annualized_return, annualized_volatility, sharpe_ratio)
}

/// Consecutive-outcome run lengths for one contiguous slice of sells,
/// mergeable with an adjacent slice. Tracking prefix and suffix runs makes
/// the merge exact across any batch boundary.
#[derive(Debug, Clone, Copy, Default)]
struct RunSegment {
    len: i32,
    prefix: i32,
    suffix: i32,
    best: i32,
}

impl RunSegment {
    fn unit(hit: bool) -> Self {
        let run = i32::from(hit);
        Self {
            len: 1,
            prefix: run,
            suffix: run,
            best: run,
        }
    }

    fn merge(a: Self, b: Self) -> Self {
        if a.len == 0 {
            return b;
        }
        if b.len == 0 {
            return a;
        }
        Self {
            len: a.len + b.len,
            prefix: if a.prefix == a.len {
                a.len + b.prefix
            } else {
                a.prefix
            },
            suffix: if b.suffix == b.len {
                b.len + a.suffix
            } else {
                b.suffix
            },
            best: a.best.max(b.best).max(a.suffix + b.prefix),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Lot {
    date: DateTime<Utc>,
    volume: f64,
}

/// FIFO buy->sell matching state for one batch. Buys left unmatched at the
/// end of the batch and sells arriving before any buy are carried so the
/// merge can pair them across the boundary.
#[derive(Debug, Clone, Default)]
struct HoldingSegment {
    matched: i32,
    sum_days: f64,
    max_days: i64,
    open_buys: HashMap<String, VecDeque<Lot>>,
    early_sells: HashMap<String, VecDeque<Lot>>,
}

impl HoldingSegment {
    fn push(&mut self, trade: &TradeRecord) {
        let lot = Lot {
            date: trade.date,
            volume: trade.volume,
        };
        match trade.action {
            SignalAction::Buy => {
                self.open_buys
                    .entry(trade.symbol.clone())
                    .or_default()
                    .push_back(lot);
            }
            SignalAction::Sell => {
                let buys = self.open_buys.entry(trade.symbol.clone()).or_default();
                if let Some(leftover) =
                    match_sell(buys, lot, &mut self.matched, &mut self.sum_days, &mut self.max_days)
                {
                    self.early_sells
                        .entry(trade.symbol.clone())
                        .or_default()
                        .push_back(leftover);
                }
            }
            SignalAction::Hold => {}
        }
    }

    fn merge(mut a: Self, b: Self) -> Self {
        for (symbol, sells) in b.early_sells {
            let buys = a.open_buys.entry(symbol.clone()).or_default();
            let mut leftovers = VecDeque::new();
            for sell in sells {
                if let Some(leftover) =
                    match_sell(buys, sell, &mut a.matched, &mut a.sum_days, &mut a.max_days)
                {
                    leftovers.push_back(leftover);
                }
            }
            if !leftovers.is_empty() {
                a.early_sells.entry(symbol).or_default().extend(leftovers);
            }
        }
        for (symbol, buys) in b.open_buys {
            a.open_buys.entry(symbol).or_default().extend(buys);
        }
        a.matched += b.matched;
        a.sum_days += b.sum_days;
        a.max_days = a.max_days.max(b.max_days);
        a
    }
}

/// Consumes open buys front-to-back until the sell volume is exhausted.
/// Returns the unmatched remainder, if any.
fn match_sell(
    buys: &mut VecDeque<Lot>,
    mut sell: Lot,
    matched: &mut i32,
    sum_days: &mut f64,
    max_days: &mut i64,
) -> Option<Lot> {
    while sell.volume > VOLUME_EPSILON {
        let Some(front) = buys.front_mut() else {
            return Some(sell);
        };
        let used = front.volume.min(sell.volume);
        let days = (sell.date - front.date).num_days();
        *matched += 1;
        *sum_days += days as f64;
        if days > *max_days {
            *max_days = days;
        }
        front.volume -= used;
        sell.volume -= used;
        if front.volume <= VOLUME_EPSILON {
            buys.pop_front();
        }
    }
    None
}

/// Everything one batch contributes: profit partial sums, drawdown maxima,
/// streak segments, and the FIFO holding-period state.
#[derive(Debug, Clone, Default)]
struct BatchPartial {
    records: i32,
    wins: i32,
    losses: i32,
    total_profit: f64,
    gross_profit: f64,
    gross_loss: f64,
    best: Option<f64>,
    worst: Option<f64>,
    max_drawdown: f64,
    win_runs: RunSegment,
    loss_runs: RunSegment,
    holding: HoldingSegment,
}

impl BatchPartial {
    fn from_chunk(chunk: &[TradeRecord]) -> Self {
        let mut partial = Self::default();
        for trade in chunk {
            partial.records += 1;
            partial.max_drawdown = partial.max_drawdown.max(trade.drawdown);
            partial.holding.push(trade);

            // Only completed sells carry realized P&L; a sell at exactly
            // break-even counts as a loss, mirroring the loss-streak rule.
            let Some(pnl) = trade.realized_profit else {
                continue;
            };
            partial.total_profit += pnl;
            let is_win = pnl > 0.0;
            if is_win {
                partial.wins += 1;
                partial.gross_profit += pnl;
            } else {
                partial.losses += 1;
                partial.gross_loss += pnl;
            }
            partial.best = Some(partial.best.map_or(pnl, |best| best.max(pnl)));
            partial.worst = Some(partial.worst.map_or(pnl, |worst| worst.min(pnl)));
            partial.win_runs = RunSegment::merge(partial.win_runs, RunSegment::unit(is_win));
            partial.loss_runs = RunSegment::merge(partial.loss_runs, RunSegment::unit(!is_win));
        }
        partial
    }

    fn merge(a: Self, b: Self) -> Self {
        Self {
            records: a.records + b.records,
            wins: a.wins + b.wins,
            losses: a.losses + b.losses,
            total_profit: a.total_profit + b.total_profit,
            gross_profit: a.gross_profit + b.gross_profit,
            gross_loss: a.gross_loss + b.gross_loss,
            best: merge_extreme(a.best, b.best, f64::max),
            worst: merge_extreme(a.worst, b.worst, f64::min),
            max_drawdown: a.max_drawdown.max(b.max_drawdown),
            win_runs: RunSegment::merge(a.win_runs, b.win_runs),
            loss_runs: RunSegment::merge(a.loss_runs, b.loss_runs),
            holding: HoldingSegment::merge(a.holding, b.holding),
        }
    }
}

fn merge_extreme(a: Option<f64>, b: Option<f64>, pick: fn(f64, f64) -> f64) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(pick(x, y)),
        (Some(x), None) => Some(x),
        (None, Some(y)) => Some(y),
        (None, None) => None,
    }
}
