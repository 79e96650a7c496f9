use crate::config::BacktestConfig;
use crate::models::Portfolio;

pub const PRICE_EPSILON: f64 = 1e-6;

/// Inputs to one sizing decision. Everything needed is passed in; the sizer
/// holds no state and never mutates the portfolio.
pub struct SizingParams<'a> {
    pub price: f64,
    pub stop_loss: f64,
    /// Signal quality in [0, 1].
    pub quality: f64,
    /// Market-regime multiplier, see `MarketCondition::score`.
    pub market_score: f64,
    pub portfolio: &'a Portfolio,
    pub config: &'a BacktestConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub volume: f64,
    pub cost: f64,
}

#[derive(Debug, PartialEq)]
pub enum SizingOutcome {
    Sized(Allocation),
    /// The caps or the risk budget left no tradable volume.
    TooSmall,
}

/// Converts a risk budget into a trade volume.
///
/// Dynamic mode: `cash × base_risk × quality × market × loss-streak decay ×
/// drawdown factor`, capped at `max_risk_fraction × cash`, divided by the
/// stop distance. Fixed mode skips the multipliers and allocates a flat
/// fraction of cash. Both modes apply the single-position and
/// portfolio-wide exposure caps.
pub fn determine_volume(params: SizingParams) -> SizingOutcome {
    let SizingParams {
        price,
        stop_loss,
        quality,
        market_score,
        portfolio,
        config,
    } = params;

    if !price.is_finite() || price <= 0.0 || !portfolio.cash.is_finite() {
        return SizingOutcome::TooSmall;
    }
    let cash = portfolio.cash.max(0.0);

    let mut volume = if config.use_dynamic_sizing {
        let quality_factor = quality.clamp(0.0, 1.0).max(0.3);
        let loss_streak_decay = config
            .loss_decay_base
            .powi(portfolio.consecutive_losses as i32)
            .max(config.sizing_floor);
        let drawdown_factor = (1.0
            - portfolio.current_drawdown
                / (config.max_drawdown_limit * portfolio.initial_capital))
            .max(config.sizing_floor);

        let budget = (cash
            * config.base_risk_fraction
            * quality_factor
            * market_score.clamp(0.0, 1.0)
            * loss_streak_decay
            * drawdown_factor)
            .min(cash * config.max_risk_fraction);

        let mut distance = (price - stop_loss).abs();
        if !distance.is_finite() || distance < PRICE_EPSILON {
            distance = price * config.default_stop_distance;
        }

        budget / distance
    } else {
        cash * config.base_risk_fraction / price
    };

    // Single-position cap.
    volume = volume.min(config.max_position_ratio * cash / price);

    // Portfolio-wide exposure cap across all open positions.
    let open_value: f64 = portfolio
        .positions
        .values()
        .map(|position| position.cost_value())
        .sum();
    let headroom = config.max_total_position * cash - open_value;
    volume = volume.min(headroom.max(0.0) / price);

    if !volume.is_finite() || volume * price < PRICE_EPSILON {
        return SizingOutcome::TooSmall;
    }

    SizingOutcome::Sized(Allocation {
        volume,
        cost: volume * price,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BacktestConfig {
        BacktestConfig::default()
    }

    fn sized(outcome: SizingOutcome) -> Allocation {
        match outcome {
            SizingOutcome::Sized(allocation) => allocation,
            SizingOutcome::TooSmall => panic!("expected sized allocation"),
        }
    }

    #[test]
    fn risk_budget_divided_by_stop_distance() {
        let config = config();
        let portfolio = Portfolio::new(100_000.0);
        // budget = 100_000 * 0.01 = 1_000; distance = 10 - 9.5 = 0.5
        let allocation = sized(determine_volume(SizingParams {
            price: 10.0,
            stop_loss: 9.5,
            quality: 1.0,
            market_score: 1.0,
            portfolio: &portfolio,
            config: &config,
        }));
        assert!((allocation.volume - 2_000.0).abs() < 1e-6);
        assert!((allocation.cost - 20_000.0).abs() < 1e-6);
    }

    #[test]
    fn stop_equal_to_price_falls_back_to_default_distance() {
        let config = config();
        let portfolio = Portfolio::new(100_000.0);
        let allocation = sized(determine_volume(SizingParams {
            price: 10.0,
            stop_loss: 10.0,
            quality: 1.0,
            market_score: 1.0,
            portfolio: &portfolio,
            config: &config,
        }));
        // distance falls back to 10 * 0.01 = 0.1 -> 1_000 / 0.1 = 10_000,
        // then the 20% single-position cap bites: 20_000 / 10 = 2_000.
        assert!((allocation.volume - 2_000.0).abs() < 1e-6);
    }

    #[test]
    fn loss_streak_shrinks_the_budget() {
        let config = config();
        let mut portfolio = Portfolio::new(100_000.0);
        let baseline = sized(determine_volume(SizingParams {
            price: 100.0,
            stop_loss: 95.0,
            quality: 1.0,
            market_score: 1.0,
            portfolio: &portfolio,
            config: &config,
        }));

        portfolio.consecutive_losses = 3;
        let throttled = sized(determine_volume(SizingParams {
            price: 100.0,
            stop_loss: 95.0,
            quality: 1.0,
            market_score: 1.0,
            portfolio: &portfolio,
            config: &config,
        }));
        // 0.8^3 = 0.512 of the baseline budget.
        assert!((throttled.volume - baseline.volume * 0.512).abs() < 1e-6);

        portfolio.consecutive_losses = 50;
        let floored = sized(determine_volume(SizingParams {
            price: 100.0,
            stop_loss: 95.0,
            quality: 1.0,
            market_score: 1.0,
            portfolio: &portfolio,
            config: &config,
        }));
        // Decay never drops below the sizing floor.
        assert!((floored.volume - baseline.volume * config.sizing_floor).abs() < 1e-6);
    }

    #[test]
    fn drawdown_throttles_sizing() {
        let config = config();
        let mut portfolio = Portfolio::new(100_000.0);
        portfolio.record_equity(110_000.0);
        portfolio.record_equity(100_000.0); // drawdown 10_000 of 20_000 limit

        let allocation = sized(determine_volume(SizingParams {
            price: 100.0,
            stop_loss: 95.0,
            quality: 1.0,
            market_score: 1.0,
            portfolio: &portfolio,
            config: &config,
        }));
        let baseline = sized(determine_volume(SizingParams {
            price: 100.0,
            stop_loss: 95.0,
            quality: 1.0,
            market_score: 1.0,
            portfolio: &Portfolio::new(100_000.0),
            config: &config,
        }));
        assert!((allocation.volume - baseline.volume * 0.5).abs() < 1e-6);
    }

    #[test]
    fn budget_capped_at_max_risk_fraction() {
        let mut config = config();
        config.base_risk_fraction = 0.05;
        config.max_risk_fraction = 0.05;
        let portfolio = Portfolio::new(100_000.0);

        // Tiny stop distance would explode the volume without the caps.
        let allocation = sized(determine_volume(SizingParams {
            price: 10.0,
            stop_loss: 9.999,
            quality: 1.0,
            market_score: 1.0,
            portfolio: &portfolio,
            config: &config,
        }));
        // Single-position cap: 0.2 * 100_000 / 10.
        assert!((allocation.volume - 2_000.0).abs() < 1e-6);
    }

    #[test]
    fn fixed_mode_ignores_quality_and_streaks() {
        let mut config = config();
        config.use_dynamic_sizing = false;
        let mut portfolio = Portfolio::new(100_000.0);
        portfolio.consecutive_losses = 5;

        let allocation = sized(determine_volume(SizingParams {
            price: 50.0,
            stop_loss: 45.0,
            quality: 0.1,
            market_score: 0.5,
            portfolio: &portfolio,
            config: &config,
        }));
        // Flat 1% of cash: 1_000 / 50 = 20 shares.
        assert!((allocation.volume - 20.0).abs() < 1e-9);
    }

    #[test]
    fn portfolio_wide_cap_limits_new_exposure() {
        let mut config = config();
        config.max_total_position = 0.5;
        config.use_dynamic_sizing = false;
        config.base_risk_fraction = 1.0;
        config.max_risk_fraction = 1.0;
        config.max_position_ratio = 1.0;

        let mut portfolio = Portfolio::new(100_000.0);
        portfolio.cash = 10_000.0;
        portfolio.positions.insert(
            "BBB".to_string(),
            crate::models::Position {
                volume: 40.0,
                average_cost: 100.0,
                entry_price: 100.0,
                entry_date: chrono::Utc::now(),
                stop_loss: None,
                take_profit: None,
            },
        );

        // Headroom = 0.5 * 10_000 - 4_000 = 1_000 -> at price 100: 10 shares.
        let allocation = sized(determine_volume(SizingParams {
            price: 100.0,
            stop_loss: 95.0,
            quality: 1.0,
            market_score: 1.0,
            portfolio: &portfolio,
            config: &config,
        }));
        assert!((allocation.volume - 10.0).abs() < 1e-9);
    }

    #[test]
    fn exhausted_headroom_is_too_small() {
        let mut config = config();
        config.max_total_position = 0.1;
        let mut portfolio = Portfolio::new(100_000.0);
        portfolio.cash = 1_000.0;
        portfolio.positions.insert(
            "BBB".to_string(),
            crate::models::Position {
                volume: 10.0,
                average_cost: 100.0,
                entry_price: 100.0,
                entry_date: chrono::Utc::now(),
                stop_loss: None,
                take_profit: None,
            },
        );

        let outcome = determine_volume(SizingParams {
            price: 100.0,
            stop_loss: 95.0,
            quality: 1.0,
            market_score: 1.0,
            portfolio: &portfolio,
            config: &config,
        });
        assert_eq!(outcome, SizingOutcome::TooSmall);
    }
}
