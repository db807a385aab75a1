use std::env;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::env_or;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config value: {0}")]
    Invalid(String),

    #[error("malformed config patch: {0}")]
    Patch(#[from] serde_json::Error),
}

/// Trading strategy variant. DCA additionally pre-places averaging legs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StrategyKind {
    Scalping,
    Dca,
}

impl StrategyKind {
    pub fn from_str(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "DCA" => StrategyKind::Dca,
            _ => StrategyKind::Scalping,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Scalping => "SCALPING",
            StrategyKind::Dca => "DCA",
        }
    }
}

/// How secondary indicators participate in the entry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryMode {
    /// Secondary indicators may set a signal on their own; filters are advisory.
    Recommendation,
    /// Filters must agree and confidence must reach the threshold.
    Requirement,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailingStopConfig {
    pub enabled: bool,
    /// Fraction of the take-profit PnL at which trailing activates.
    pub activation_ratio: Decimal,
    /// Stop distance from the current price, in percent.
    pub stop_distance_pct: Decimal,
}

impl Default for TrailingStopConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            activation_ratio: Decimal::new(4, 1),   // 0.4
            stop_distance_pct: Decimal::new(8, 2),  // 0.08
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialCloseConfig {
    pub enabled: bool,
    /// Leveraged PnL % that triggers the first partial close.
    pub level1_pnl_pct: Decimal,
    /// Share of the original size closed at level 1, in percent.
    pub level1_amount_pct: Decimal,
    pub level2_pnl_pct: Decimal,
    pub level2_amount_pct: Decimal,
}

impl Default for PartialCloseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level1_pnl_pct: Decimal::new(15, 2),  // 0.15
            level1_amount_pct: Decimal::from(30),
            level2_pnl_pct: Decimal::new(25, 2),  // 0.25
            level2_amount_pct: Decimal::from(50),
        }
    }
}

/// Upper bound on averaging legs per position.
pub const MAX_DCA_ORDERS: u32 = 20;
pub const MAX_DCA_MULTIPLIER: u32 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DcaConfig {
    pub max_orders: u32,
    pub price_step_pct: Decimal,
    pub multiplier: Decimal,
}

impl Default for DcaConfig {
    fn default() -> Self {
        Self {
            max_orders: 3,
            price_step_pct: Decimal::new(15, 1), // 1.5
            multiplier: Decimal::new(15, 1),     // 1.5
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Max drawdown from the day-start balance, in percent.
    pub daily_loss_limit_pct: Decimal,
    pub max_open_positions: usize,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            daily_loss_limit_pct: Decimal::from(10),
            max_open_positions: 1,
        }
    }
}

/// Profit withdrawal: once profit over the starting balance reaches the
/// threshold, a share of it is set aside and no longer sized into trades.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReinvestmentConfig {
    pub enabled: bool,
    /// Profit over the starting balance, in percent, that triggers a withdrawal.
    pub withdrawal_threshold_pct: Decimal,
    /// Share of the profit reserved per withdrawal, in percent.
    pub withdrawal_pct: Decimal,
}

impl Default for ReinvestmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            withdrawal_threshold_pct: Decimal::from(50),
            withdrawal_pct: Decimal::from(20),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RsiSettings {
    pub enabled: bool,
    pub period: usize,
    pub overbought: f64,
    pub oversold: f64,
}

impl Default for RsiSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            period: 5,
            overbought: 60.0,
            oversold: 40.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmaSettings {
    pub enabled: bool,
    pub fast_period: usize,
    pub slow_period: usize,
}

impl Default for EmaSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            fast_period: 5,
            slow_period: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandsSettings {
    pub enabled: bool,
    pub period: usize,
    pub deviation: f64,
}

impl Default for BandsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            period: 10,
            deviation: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSettings {
    pub enabled: bool,
    pub period: usize,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            period: 34,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdxSettings {
    pub enabled: bool,
    pub period: usize,
    pub min_value: f64,
}

impl Default for AdxSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            period: 14,
            min_value: 15.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeSettings {
    pub enabled: bool,
    pub period: usize,
    /// Current volume must reach this fraction of its moving average.
    pub min_ratio: f64,
}

impl Default for VolumeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            period: 20,
            min_ratio: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSettings {
    pub rsi: RsiSettings,
    pub ema: EmaSettings,
    pub bands: BandsSettings,
    pub channel: ChannelSettings,
    pub adx: AdxSettings,
    pub volume: VolumeSettings,
    pub atr_period: usize,
}

impl Default for IndicatorSettings {
    fn default() -> Self {
        Self {
            rsi: RsiSettings::default(),
            ema: EmaSettings::default(),
            bands: BandsSettings::default(),
            channel: ChannelSettings::default(),
            adx: AdxSettings::default(),
            volume: VolumeSettings::default(),
            atr_period: 14,
        }
    }
}

/// Per-indicator weights of the confidence score. Defaults sum to 100.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub channel: f64,
    pub ema: f64,
    pub rsi: f64,
    pub bands: f64,
    pub adx: f64,
    pub volume: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            channel: 30.0,
            ema: 25.0,
            rsi: 15.0,
            bands: 10.0,
            adx: 15.0,
            volume: 5.0,
        }
    }
}

impl ScoreWeights {
    pub fn total(&self) -> f64 {
        self.channel + self.ema + self.rsi + self.bands + self.adx + self.volume
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySettings {
    pub mode: EntryMode,
    pub confidence_threshold: u8,
    pub cooldown_secs: i64,
    pub weights: ScoreWeights,
}

impl Default for EntrySettings {
    fn default() -> Self {
        Self {
            mode: EntryMode::Recommendation,
            confidence_threshold: 60,
            cooldown_secs: 60,
            weights: ScoreWeights::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// BotConfig
// ---------------------------------------------------------------------------

/// Trading parameters. Swapped wholesale between engine cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotConfig {
    pub symbol: String,
    pub strategy: StrategyKind,
    pub leverage: u32,
    /// Share of the balance committed per position, in percent.
    pub position_size_pct: Decimal,
    pub take_profit_pct: Decimal,
    pub stop_loss_pct: Decimal,
    pub max_trade_duration_minutes: i64,
    pub timeframe: String,
    pub candle_limit: u32,
    pub trailing_stop: TrailingStopConfig,
    pub partial_close: PartialCloseConfig,
    pub dca: DcaConfig,
    pub risk: RiskConfig,
    pub reinvestment: ReinvestmentConfig,
    pub indicators: IndicatorSettings,
    pub entry: EntrySettings,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            symbol: "XRPUSDT".into(),
            strategy: StrategyKind::Scalping,
            leverage: 5,
            position_size_pct: Decimal::from(5),
            take_profit_pct: Decimal::new(25, 2), // 0.25
            stop_loss_pct: Decimal::new(15, 2),   // 0.15
            max_trade_duration_minutes: 3,
            timeframe: "1m".into(),
            candle_limit: 100,
            trailing_stop: TrailingStopConfig::default(),
            partial_close: PartialCloseConfig::default(),
            dca: DcaConfig::default(),
            risk: RiskConfig::default(),
            reinvestment: ReinvestmentConfig::default(),
            indicators: IndicatorSettings::default(),
            entry: EntrySettings::default(),
        }
    }
}

impl BotConfig {
    /// Defaults overridden by the handful of env vars operators tune most.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let mut config = Self {
            symbol: env::var("SYMBOL").unwrap_or(defaults.symbol.clone()),
            strategy: env::var("STRATEGY")
                .map(|s| StrategyKind::from_str(&s))
                .unwrap_or(defaults.strategy),
            leverage: env_or("LEVERAGE", defaults.leverage),
            position_size_pct: env_or("POSITION_SIZE_PCT", defaults.position_size_pct),
            take_profit_pct: env_or("TAKE_PROFIT_PCT", defaults.take_profit_pct),
            stop_loss_pct: env_or("STOP_LOSS_PCT", defaults.stop_loss_pct),
            max_trade_duration_minutes: env_or(
                "MAX_TRADE_DURATION_MINUTES",
                defaults.max_trade_duration_minutes,
            ),
            timeframe: env::var("TIMEFRAME").unwrap_or(defaults.timeframe.clone()),
            ..defaults
        };

        config.risk.daily_loss_limit_pct =
            env_or("DAILY_LOSS_LIMIT_PCT", config.risk.daily_loss_limit_pct);
        config.risk.max_open_positions =
            env_or("MAX_OPEN_POSITIONS", config.risk.max_open_positions);
        config.entry.confidence_threshold =
            env_or("CONFIDENCE_THRESHOLD", config.entry.confidence_threshold);
        config.reinvestment.enabled =
            env_or("PROFIT_WITHDRAWAL_ENABLED", config.reinvestment.enabled);
        if let Ok(mode) = env::var("ENTRY_MODE") {
            config.entry.mode = match mode.to_uppercase().as_str() {
                "REQUIREMENT" => EntryMode::Requirement,
                _ => EntryMode::Recommendation,
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Deep-merge a partial JSON document into this config.
    ///
    /// The merged result is validated before it replaces `self`; on error
    /// the current config is left untouched.
    pub fn merge(&mut self, patch: &Value) -> Result<(), ConfigError> {
        if !patch.is_object() {
            return Err(ConfigError::Invalid("patch must be a JSON object".into()));
        }

        let mut current = serde_json::to_value(&*self)?;
        deep_merge(&mut current, patch);
        let merged: BotConfig = serde_json::from_value(current)?;
        merged.validate()?;

        *self = merged;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let hundred = Decimal::ONE_HUNDRED;

        if self.symbol.trim().is_empty() {
            return Err(ConfigError::Invalid("symbol must not be empty".into()));
        }
        if self.leverage == 0 || self.leverage > 125 {
            return Err(ConfigError::Invalid(format!(
                "leverage {} outside 1..=125",
                self.leverage
            )));
        }
        if self.position_size_pct <= Decimal::ZERO || self.position_size_pct > hundred {
            return Err(ConfigError::Invalid(format!(
                "position_size_pct {} outside (0, 100]",
                self.position_size_pct
            )));
        }
        if self.take_profit_pct <= Decimal::ZERO || self.stop_loss_pct <= Decimal::ZERO {
            return Err(ConfigError::Invalid(
                "take_profit_pct and stop_loss_pct must be positive".into(),
            ));
        }
        if self.stop_loss_pct >= hundred {
            return Err(ConfigError::Invalid("stop_loss_pct must be below 100".into()));
        }
        if self.max_trade_duration_minutes <= 0 {
            return Err(ConfigError::Invalid(
                "max_trade_duration_minutes must be positive".into(),
            ));
        }

        let pc = &self.partial_close;
        for amount in [pc.level1_amount_pct, pc.level2_amount_pct] {
            if amount <= Decimal::ZERO || amount > hundred {
                return Err(ConfigError::Invalid(format!(
                    "partial close amount {amount} outside (0, 100]"
                )));
            }
        }
        if pc.level2_pnl_pct <= pc.level1_pnl_pct {
            return Err(ConfigError::Invalid(
                "partial close level 2 must trigger above level 1".into(),
            ));
        }

        if self.trailing_stop.stop_distance_pct <= Decimal::ZERO {
            return Err(ConfigError::Invalid(
                "trailing stop distance must be positive".into(),
            ));
        }
        let dca = &self.dca;
        if dca.max_orders == 0 || dca.max_orders > MAX_DCA_ORDERS {
            return Err(ConfigError::Invalid(format!(
                "dca max_orders {} outside 1..={MAX_DCA_ORDERS}",
                dca.max_orders
            )));
        }
        if dca.multiplier <= Decimal::ZERO || dca.multiplier > Decimal::from(MAX_DCA_MULTIPLIER) {
            return Err(ConfigError::Invalid(format!(
                "dca multiplier {} outside (0, {MAX_DCA_MULTIPLIER}]",
                dca.multiplier
            )));
        }
        if dca.price_step_pct <= Decimal::ZERO {
            return Err(ConfigError::Invalid("dca price step must be positive".into()));
        }
        // Deepest long leg must stay above zero.
        match dca.price_step_pct.checked_mul(Decimal::from(dca.max_orders)) {
            Some(depth) if depth < hundred => {}
            _ => return Err(ConfigError::Invalid("dca ladder reaches a zero price".into())),
        }

        let reinvest = &self.reinvestment;
        if reinvest.withdrawal_threshold_pct <= Decimal::ZERO {
            return Err(ConfigError::Invalid("withdrawal threshold must be positive".into()));
        }
        if reinvest.withdrawal_pct <= Decimal::ZERO || reinvest.withdrawal_pct > hundred {
            return Err(ConfigError::Invalid(format!(
                "withdrawal_pct {} outside (0, 100]",
                reinvest.withdrawal_pct
            )));
        }

        if self.risk.max_open_positions == 0 {
            return Err(ConfigError::Invalid("max_open_positions must be at least 1".into()));
        }
        if self.entry.confidence_threshold > 100 {
            return Err(ConfigError::Invalid("confidence_threshold above 100".into()));
        }
        if self.entry.cooldown_secs < 0 {
            return Err(ConfigError::Invalid("cooldown_secs must not be negative".into()));
        }

        let w = &self.entry.weights;
        let weights = [w.channel, w.ema, w.rsi, w.bands, w.adx, w.volume];
        if weights.iter().any(|v| !v.is_finite() || *v < 0.0) || w.total() <= 0.0 {
            return Err(ConfigError::Invalid(
                "score weights must be non-negative with a positive sum".into(),
            ));
        }

        let ind = &self.indicators;
        if ind.ema.enabled && ind.ema.fast_period >= ind.ema.slow_period {
            return Err(ConfigError::Invalid("ema fast period must be below slow".into()));
        }

        Ok(())
    }
}

fn deep_merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge(existing, value)
                    }
                    _ => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

// ---- Tests ----
