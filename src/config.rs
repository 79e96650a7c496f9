use anyhow::{anyhow, Result};
use std::collections::HashMap;

/// Engine configuration. Field names and defaults follow the recognized
/// option set; `validate` must pass before a backtest runs.
#[derive(Debug, Clone)]
pub struct BacktestConfig {
    pub initial_capital: f64,
    /// Annual risk-free rate used in the Sharpe ratio.
    pub risk_free_rate: f64,

    // Sizing
    pub base_risk_fraction: f64,
    /// Hard cap on the risk budget as a fraction of cash.
    pub max_risk_fraction: f64,
    pub max_position_ratio: f64,
    pub max_total_position: f64,
    /// Floor for the loss-streak and drawdown sizing multipliers.
    pub sizing_floor: f64,
    /// Base of the exponential loss-streak decay.
    pub loss_decay_base: f64,
    /// Fallback stop distance (fraction of price) when a stop equals the price.
    pub default_stop_distance: f64,

    // Risk control
    pub trailing_stop_pct: f64,
    pub max_holding_days: i64,
    pub max_drawdown_limit: f64,
    /// Percent stop used when no stop is suggested and history is too short
    /// for a volatility-derived one.
    pub fallback_stop_ratio: f64,
    pub atr_period: usize,
    pub atr_multiplier: f64,

    // Execution
    pub slippage: f64,

    // Feature flags
    pub use_trailing_stop: bool,
    pub use_time_stop: bool,
    pub use_dynamic_sizing: bool,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_capital: 100_000.0,
            risk_free_rate: 0.03,
            base_risk_fraction: 0.01,
            max_risk_fraction: 0.02,
            max_position_ratio: 0.2,
            max_total_position: 0.8,
            sizing_floor: 0.2,
            loss_decay_base: 0.8,
            default_stop_distance: 0.01,
            trailing_stop_pct: 0.05,
            max_holding_days: 30,
            max_drawdown_limit: 0.2,
            fallback_stop_ratio: 0.05,
            atr_period: 14,
            atr_multiplier: 2.0,
            slippage: 0.001,
            use_trailing_stop: true,
            use_time_stop: true,
            use_dynamic_sizing: true,
        }
    }
}

impl BacktestConfig {
    /// Builds a config from a flat parameter map, applying defaults for
    /// missing keys. Unknown keys are ignored.
    pub fn from_parameters(parameters: &HashMap<String, f64>) -> Self {
        let defaults = Self::default();
        Self {
            initial_capital: get_param(parameters, "initialCapital", defaults.initial_capital),
            risk_free_rate: get_param(parameters, "riskFreeRate", defaults.risk_free_rate),
            base_risk_fraction: get_param(
                parameters,
                "baseRiskFraction",
                defaults.base_risk_fraction,
            ),
            max_risk_fraction: get_param(parameters, "maxRiskFraction", defaults.max_risk_fraction),
            max_position_ratio: get_param(
                parameters,
                "maxPositionRatio",
                defaults.max_position_ratio,
            ),
            max_total_position: get_param(
                parameters,
                "maxTotalPosition",
                defaults.max_total_position,
            ),
            sizing_floor: get_param(parameters, "sizingFloor", defaults.sizing_floor),
            loss_decay_base: get_param(parameters, "lossDecayBase", defaults.loss_decay_base),
            default_stop_distance: get_param(
                parameters,
                "defaultStopDistance",
                defaults.default_stop_distance,
            ),
            trailing_stop_pct: get_param(parameters, "trailingStopPct", defaults.trailing_stop_pct),
            max_holding_days: get_rounded_param(
                parameters,
                "maxHoldingDays",
                defaults.max_holding_days,
            ),
            max_drawdown_limit: get_param(
                parameters,
                "maxDrawdownLimit",
                defaults.max_drawdown_limit,
            ),
            fallback_stop_ratio: get_param(
                parameters,
                "fallbackStopRatio",
                defaults.fallback_stop_ratio,
            ),
            atr_period: get_usize_param_min(parameters, "atrPeriod", defaults.atr_period, 1),
            atr_multiplier: get_param(parameters, "atrMultiplier", defaults.atr_multiplier),
            slippage: get_param(parameters, "slippage", defaults.slippage),
            use_trailing_stop: get_flag(parameters, "useTrailingStop", defaults.use_trailing_stop),
            use_time_stop: get_flag(parameters, "useTimeStop", defaults.use_time_stop),
            use_dynamic_sizing: get_flag(
                parameters,
                "useDynamicSizing",
                defaults.use_dynamic_sizing,
            ),
        }
    }

    pub fn validate(&self) -> Result<()> {
        require_positive("initialCapital", self.initial_capital)?;
        require_fraction("baseRiskFraction", self.base_risk_fraction)?;
        require_fraction("maxRiskFraction", self.max_risk_fraction)?;
        require_fraction("maxPositionRatio", self.max_position_ratio)?;
        require_fraction("maxTotalPosition", self.max_total_position)?;
        require_fraction("sizingFloor", self.sizing_floor)?;
        require_fraction("lossDecayBase", self.loss_decay_base)?;
        require_fraction("defaultStopDistance", self.default_stop_distance)?;
        require_fraction("trailingStopPct", self.trailing_stop_pct)?;
        require_fraction("maxDrawdownLimit", self.max_drawdown_limit)?;
        require_fraction("fallbackStopRatio", self.fallback_stop_ratio)?;
        require_in_range("slippage", self.slippage, 0.0, 0.1)?;
        require_in_range("riskFreeRate", self.risk_free_rate, 0.0, 1.0)?;

        if self.max_risk_fraction < self.base_risk_fraction {
            return Err(anyhow!(
                "maxRiskFraction ({}) must be >= baseRiskFraction ({})",
                self.max_risk_fraction,
                self.base_risk_fraction
            ));
        }
        if self.max_holding_days <= 0 {
            return Err(anyhow!(
                "maxHoldingDays must be > 0 (value: {})",
                self.max_holding_days
            ));
        }
        Ok(())
    }
}

fn get_param(parameters: &HashMap<String, f64>, key: &str, default: f64) -> f64 {
    parameters
        .get(key)
        .copied()
        .filter(|value| value.is_finite())
        .unwrap_or(default)
}

fn get_rounded_param(parameters: &HashMap<String, f64>, key: &str, default: i64) -> i64 {
    parameters
        .get(key)
        .copied()
        .filter(|value| value.is_finite())
        .map(|value| value.round() as i64)
        .unwrap_or(default)
}

fn get_usize_param_min(
    parameters: &HashMap<String, f64>,
    key: &str,
    default: usize,
    min: usize,
) -> usize {
    parameters
        .get(key)
        .copied()
        .filter(|value| value.is_finite() && *value >= min as f64)
        .map(|value| value.round() as usize)
        .unwrap_or(default)
}

fn get_flag(parameters: &HashMap<String, f64>, key: &str, default: bool) -> bool {
    parameters
        .get(key)
        .copied()
        .filter(|value| value.is_finite())
        .map(|value| value >= 0.5)
        .unwrap_or(default)
}

fn require_positive(key: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(anyhow!("{} must be a positive number (value: {})", key, value));
    }
    Ok(())
}

fn require_fraction(key: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 || value > 1.0 {
        return Err(anyhow!("{} must be in (0, 1] (value: {})", key, value));
    }
    Ok(())
}

fn require_in_range(key: &str, value: f64, min: f64, max: f64) -> Result<()> {
    if !value.is_finite() || value < min || value > max {
        return Err(anyhow!(
            "{} must be between {} and {} (value: {})",
            key,
            min,
            max,
            value
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        BacktestConfig::default().validate().unwrap();
    }

    #[test]
    fn from_parameters_applies_overrides_and_defaults() {
        let mut parameters = HashMap::new();
        parameters.insert("initialCapital".to_string(), 50_000.0);
        parameters.insert("slippage".to_string(), 0.002);
        parameters.insert("useTrailingStop".to_string(), 0.0);
        parameters.insert("maxHoldingDays".to_string(), 10.4);

        let config = BacktestConfig::from_parameters(&parameters);
        assert!((config.initial_capital - 50_000.0).abs() < 1e-9);
        assert!((config.slippage - 0.002).abs() < 1e-9);
        assert!(!config.use_trailing_stop);
        assert_eq!(config.max_holding_days, 10);
        // Untouched keys keep their defaults.
        assert!((config.risk_free_rate - 0.03).abs() < 1e-9);
        assert!(config.use_time_stop);
    }

    #[test]
    fn from_parameters_ignores_non_finite_values() {
        let mut parameters = HashMap::new();
        parameters.insert("initialCapital".to_string(), f64::NAN);
        let config = BacktestConfig::from_parameters(&parameters);
        assert!((config.initial_capital - 100_000.0).abs() < 1e-9);
    }

    #[test]
    fn validate_rejects_bad_ranges() {
        let mut config = BacktestConfig::default();
        config.slippage = 0.5;
        assert!(config.validate().is_err());

        let mut config = BacktestConfig::default();
        config.max_risk_fraction = 0.005;
        config.base_risk_fraction = 0.01;
        assert!(config.validate().is_err());

        let mut config = BacktestConfig::default();
        config.max_holding_days = 0;
        assert!(config.validate().is_err());
    }
}
