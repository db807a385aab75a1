use chrono::{DateTime, Utc};
use ta::indicators::{
    AverageTrueRange, BollingerBands, ExponentialMovingAverage, RelativeStrengthIndex,
    SimpleMovingAverage,
};
use ta::{DataItem, Next};

use super::adx::adx;
use super::{
    BandsReading, ChannelReading, EmaReading, IndicatorSnapshot, RsiReading, VolumeReading,
};
use crate::config::IndicatorSettings;
use crate::errors::BotError;
use crate::exchange::Candle;

/// Closes kept for pullback detection.
pub const PULLBACK_LOOKBACK: usize = 10;

/// Turns a candle history into an [`IndicatorSnapshot`].
pub trait IndicatorProvider: Send + Sync {
    fn compute(
        &self,
        candles: &[Candle],
        settings: &IndicatorSettings,
        now: DateTime<Utc>,
    ) -> Result<IndicatorSnapshot, BotError>;
}

/// Provider backed by the `ta` crate, plus Wilder ADX.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaIndicatorProvider;

impl IndicatorProvider for TaIndicatorProvider {
    fn compute(
        &self,
        candles: &[Candle],
        settings: &IndicatorSettings,
        now: DateTime<Utc>,
    ) -> Result<IndicatorSnapshot, BotError> {
        // Components with too little history are skipped individually.
        if candles.is_empty() {
            return Err(BotError::Data("no candles to compute indicators from".into()));
        }

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let price = closes.last().copied().unwrap_or_default();
        let mut snapshot = IndicatorSnapshot::empty(price, now);
        snapshot.recent_closes = tail(&closes, PULLBACK_LOOKBACK);

        if settings.rsi.enabled {
            snapshot.rsi = rsi(&closes, settings.rsi.period)?;
        }
        if settings.ema.enabled {
            snapshot.ema = ema_cross(&closes, settings.ema.fast_period, settings.ema.slow_period)?;
        }
        if settings.bands.enabled {
            snapshot.bands = bands(&closes, settings.bands.period, settings.bands.deviation)?;
        }
        if settings.channel.enabled {
            snapshot.channel = channel(candles, settings.channel.period)?;
        }
        if settings.adx.enabled {
            snapshot.adx = adx(candles, settings.adx.period);
        }
        if settings.volume.enabled {
            snapshot.volume = volume(candles, settings.volume.period)?;
        }
        snapshot.atr = atr(candles, settings.atr_period);

        snapshot.statuses = snapshot.derive_statuses(settings);

        tracing::debug!(
            price,
            rsi = ?snapshot.rsi.map(|r| r.value),
            adx = ?snapshot.adx,
            atr = ?snapshot.atr,
            "Indicators computed"
        );
        Ok(snapshot)
    }
}

fn ta_err<E: std::fmt::Debug>(e: E) -> BotError {
    BotError::Data(format!("indicator setup failed: {e:?}"))
}

fn tail(values: &[f64], n: usize) -> Vec<f64> {
    values[values.len().saturating_sub(n)..].to_vec()
}

fn ema_series(values: &[f64], period: usize) -> Result<Vec<f64>, BotError> {
    let mut ema = ExponentialMovingAverage::new(period).map_err(ta_err)?;
    Ok(values.iter().map(|v| ema.next(*v)).collect())
}

fn rsi(closes: &[f64], period: usize) -> Result<Option<RsiReading>, BotError> {
    if closes.len() < period + 2 {
        return Ok(None);
    }
    let mut rsi = RelativeStrengthIndex::new(period).map_err(ta_err)?;
    let series: Vec<f64> = closes.iter().map(|c| rsi.next(*c)).collect();

    Ok(match series.as_slice() {
        [.., previous, value] => Some(RsiReading {
            value: *value,
            previous: *previous,
        }),
        _ => None,
    })
}

fn ema_cross(closes: &[f64], fast: usize, slow: usize) -> Result<Option<EmaReading>, BotError> {
    if closes.len() < slow + 1 {
        return Ok(None);
    }
    let fast = ema_series(closes, fast)?;
    let slow = ema_series(closes, slow)?;

    Ok(match (fast.as_slice(), slow.as_slice()) {
        ([.., prev_fast, fast], [.., prev_slow, slow]) => Some(EmaReading {
            fast: *fast,
            slow: *slow,
            prev_fast: *prev_fast,
            prev_slow: *prev_slow,
        }),
        _ => None,
    })
}

fn bands(closes: &[f64], period: usize, deviation: f64) -> Result<Option<BandsReading>, BotError> {
    if closes.len() < period {
        return Ok(None);
    }
    let mut bb = BollingerBands::new(period, deviation).map_err(ta_err)?;
    let last = closes.iter().map(|c| bb.next(*c)).last();

    Ok(last.map(|out| BandsReading {
        upper: out.upper,
        middle: out.average,
        lower: out.lower,
    }))
}

fn channel(candles: &[Candle], period: usize) -> Result<Option<ChannelReading>, BotError> {
    if candles.len() < period + 1 {
        return Ok(None);
    }
    let highs: Vec<f64> = candles.iter().map(|c| c.high).collect();
    let lows: Vec<f64> = candles.iter().map(|c| c.low).collect();
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

    let upper = ema_series(&highs, period)?;
    let lower = ema_series(&lows, period)?;
    let center = ema_series(&closes, period)?;

    Ok(match (upper.last(), center.last(), lower.last()) {
        (Some(&upper), Some(&c), Some(&lower)) => Some(ChannelReading {
            upper,
            center: c,
            lower,
            recent_centers: tail(&center, PULLBACK_LOOKBACK),
        }),
        _ => None,
    })
}

fn volume(candles: &[Candle], period: usize) -> Result<Option<VolumeReading>, BotError> {
    if candles.len() < period {
        return Ok(None);
    }
    let mut sma = SimpleMovingAverage::new(period).map_err(ta_err)?;
    let average = candles.iter().map(|c| sma.next(c.volume)).last();

    Ok(match (candles.last(), average) {
        (Some(last), Some(average)) => Some(VolumeReading {
            current: last.volume,
            average,
        }),
        _ => None,
    })
}

/// ATR is informational; malformed bars just leave it empty.
fn atr(candles: &[Candle], period: usize) -> Option<f64> {
    if candles.len() < period + 1 {
        return None;
    }
    let mut atr = AverageTrueRange::new(period).ok()?;
    let mut last = None;
    for c in candles {
        let item = match DataItem::builder()
            .open(c.open)
            .high(c.high)
            .low(c.low)
            .close(c.close)
            .volume(c.volume)
            .build()
        {
            Ok(item) => item,
            Err(e) => {
                tracing::debug!(timestamp = c.timestamp, error = ?e, "Skipping malformed candle for ATR");
                continue;
            }
        };
        last = Some(atr.next(&item));
    }
    last
}

// ---- Tests ----
