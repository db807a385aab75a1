pub mod adx;
pub mod provider;

pub use provider::{IndicatorProvider, TaIndicatorProvider, PULLBACK_LOOKBACK};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::IndicatorSettings;

/// Derived per-indicator state shown to operators and used by filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorStatus {
    Buy,
    Sell,
    Neutral,
    Ok,
    NotOk,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RsiReading {
    pub value: f64,
    pub previous: f64,
}

impl RsiReading {
    pub fn is_rising(&self) -> bool {
        self.value > self.previous
    }

    pub fn is_falling(&self) -> bool {
        self.value < self.previous
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmaReading {
    pub fast: f64,
    pub slow: f64,
    pub prev_fast: f64,
    pub prev_slow: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandsReading {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

/// Price-action channel: EMAs of high, close and low.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelReading {
    pub upper: f64,
    pub center: f64,
    pub lower: f64,
    /// Centre values aligned with `IndicatorSnapshot::recent_closes`, oldest first.
    pub recent_centers: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolumeReading {
    pub current: f64,
    pub average: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorStatuses {
    pub rsi: Option<IndicatorStatus>,
    pub ema: Option<IndicatorStatus>,
    pub bands: Option<IndicatorStatus>,
    pub channel: Option<IndicatorStatus>,
    pub adx: Option<IndicatorStatus>,
    pub volume: Option<IndicatorStatus>,
}

/// Indicator values for one slow cycle. Replaced wholesale, never patched.
///
/// A `None` reading means the indicator is disabled or the history was too
/// short for it; consumers skip it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub price: f64,
    pub rsi: Option<RsiReading>,
    pub ema: Option<EmaReading>,
    pub bands: Option<BandsReading>,
    pub channel: Option<ChannelReading>,
    pub adx: Option<f64>,
    pub atr: Option<f64>,
    pub volume: Option<VolumeReading>,
    /// Last closes, oldest first.
    pub recent_closes: Vec<f64>,
    pub statuses: IndicatorStatuses,
    pub computed_at: DateTime<Utc>,
}

impl IndicatorSnapshot {
    /// Snapshot with no readings, priced at `price`.
    pub fn empty(price: f64, computed_at: DateTime<Utc>) -> Self {
        Self {
            price,
            rsi: None,
            ema: None,
            bands: None,
            channel: None,
            adx: None,
            atr: None,
            volume: None,
            recent_closes: Vec::new(),
            statuses: IndicatorStatuses::default(),
            computed_at,
        }
    }

    /// Re-price against the latest ticker and refresh the derived statuses.
    pub fn repriced(mut self, price: f64, settings: &IndicatorSettings) -> Self {
        self.price = price;
        self.statuses = self.derive_statuses(settings);
        self
    }

    pub fn derive_statuses(&self, settings: &IndicatorSettings) -> IndicatorStatuses {
        let price = self.price;

        IndicatorStatuses {
            rsi: self.rsi.map(|r| {
                if r.value < settings.rsi.oversold {
                    IndicatorStatus::Buy
                } else if r.value > settings.rsi.overbought {
                    IndicatorStatus::Sell
                } else {
                    IndicatorStatus::Neutral
                }
            }),
            ema: self.ema.map(|e| {
                if e.fast > e.slow && e.prev_fast <= e.prev_slow {
                    IndicatorStatus::Buy
                } else if e.fast < e.slow && e.prev_fast >= e.prev_slow {
                    IndicatorStatus::Sell
                } else {
                    IndicatorStatus::Neutral
                }
            }),
            bands: self.bands.map(|b| {
                if price <= b.lower * 1.01 {
                    IndicatorStatus::Buy
                } else if price >= b.upper * 0.99 {
                    IndicatorStatus::Sell
                } else {
                    IndicatorStatus::Neutral
                }
            }),
            channel: self.channel.as_ref().map(|c| {
                if price > c.upper {
                    IndicatorStatus::Buy
                } else if price < c.lower {
                    IndicatorStatus::Sell
                } else {
                    IndicatorStatus::Neutral
                }
            }),
            adx: self.adx.map(|v| {
                if v >= settings.adx.min_value {
                    IndicatorStatus::Ok
                } else {
                    IndicatorStatus::NotOk
                }
            }),
            volume: self.volume.map(|v| {
                if v.average > 0.0 && v.current >= v.average * settings.volume.min_ratio {
                    IndicatorStatus::Ok
                } else {
                    IndicatorStatus::NotOk
                }
            }),
        }
    }
}
