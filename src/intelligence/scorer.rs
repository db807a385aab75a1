use serde::{Deserialize, Serialize};

use crate::config::{IndicatorSettings, ScoreWeights};
use crate::indicators::{
    BandsReading, ChannelReading, EmaReading, IndicatorSnapshot, RsiReading, VolumeReading,
};
use crate::models::Direction;

/// One indicator's contribution to a confidence score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentScore {
    pub indicator: String,
    pub weight: f64,
    /// Points earned, within `[0, weight]`.
    pub earned: f64,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    /// 0-100.
    pub confidence: u8,
    pub components: Vec<ComponentScore>,
}

impl ScoreBreakdown {
    /// Notes of the components that earned anything.
    pub fn reasons(&self) -> Vec<String> {
        self.components
            .iter()
            .filter(|c| c.earned > 0.0)
            .map(|c| c.note.clone())
            .collect()
    }
}

/// Weighted agreement of the snapshot with `direction`.
///
/// Pure: the same snapshot, direction, weights and settings always give the
/// same result. Missing readings and zero weights are left out of the
/// denominator rather than counted as disagreement.
pub fn score(
    snapshot: &IndicatorSnapshot,
    direction: Direction,
    weights: &ScoreWeights,
    settings: &IndicatorSettings,
) -> ScoreBreakdown {
    let price = snapshot.price;
    let candidates: [(&str, f64, Option<(f64, String)>); 6] = [
        (
            "channel",
            weights.channel,
            snapshot.channel.as_ref().map(|c| channel_fraction(price, c, direction)),
        ),
        ("ema", weights.ema, snapshot.ema.map(|e| ema_fraction(&e, direction))),
        (
            "rsi",
            weights.rsi,
            snapshot
                .rsi
                .map(|r| rsi_fraction(&r, direction, settings.rsi.oversold, settings.rsi.overbought)),
        ),
        ("bands", weights.bands, snapshot.bands.map(|b| bands_fraction(price, &b, direction))),
        ("adx", weights.adx, snapshot.adx.map(adx_fraction)),
        (
            "volume",
            weights.volume,
            snapshot
                .volume
                .and_then(|v| volume_fraction(&v, settings.volume.min_ratio)),
        ),
    ];

    let components: Vec<ComponentScore> = candidates
        .into_iter()
        .filter(|(_, weight, _)| *weight > 0.0)
        .filter_map(|(name, weight, scored)| {
            scored.map(|(fraction, note)| ComponentScore {
                indicator: name.to_string(),
                weight,
                earned: weight * fraction.clamp(0.0, 1.0),
                note,
            })
        })
        .collect();

    let evaluated: f64 = components.iter().map(|c| c.weight).sum();
    let earned: f64 = components.iter().map(|c| c.earned).sum();

    let confidence = if evaluated > 0.0 {
        (earned / evaluated * 100.0).round().clamp(0.0, 100.0) as u8
    } else {
        0
    };

    ScoreBreakdown {
        confidence,
        components,
    }
}

// ---------------------------------------------------------------------------
// Components
// ---------------------------------------------------------------------------

/// Price on the right side of the channel centre, best when hugging it.
fn channel_fraction(price: f64, channel: &ChannelReading, direction: Direction) -> (f64, String) {
    if channel.center <= 0.0 {
        return (0.0, "channel centre unavailable".into());
    }
    let distance_pct = (price - channel.center) / channel.center * 100.0;
    let distance_pct = match direction {
        Direction::Long => distance_pct,
        Direction::Short => -distance_pct,
    };

    let fraction = if distance_pct <= 0.0 {
        0.0
    } else if distance_pct < 0.2 {
        1.0
    } else if distance_pct < 0.5 {
        0.8
    } else {
        0.5
    };
    (
        fraction,
        format!("price {distance_pct:.2}% on the {} side of channel centre", side_word(direction)),
    )
}

fn ema_fraction(ema: &EmaReading, direction: Direction) -> (f64, String) {
    let (crossed, turning) = match direction {
        Direction::Long => (ema.fast > ema.slow, ema.fast > ema.prev_fast),
        Direction::Short => (ema.fast < ema.slow, ema.fast < ema.prev_fast),
    };

    if crossed {
        (1.0, format!("fast EMA {} slow EMA", cmp_word(direction)))
    } else if turning {
        (0.5, format!("fast EMA turning {}", move_word(direction)))
    } else {
        (0.0, "EMA against direction".into())
    }
}

fn rsi_fraction(
    rsi: &RsiReading,
    direction: Direction,
    oversold: f64,
    overbought: f64,
) -> (f64, String) {
    let (extreme, turning, leaning) = match direction {
        Direction::Long => (rsi.value < oversold, rsi.is_rising(), rsi.value < 50.0),
        Direction::Short => (rsi.value > overbought, rsi.is_falling(), rsi.value > 50.0),
    };

    if extreme && turning {
        (1.0, format!("RSI {:.1} reversing {}", rsi.value, move_word(direction)))
    } else if leaning {
        (0.7, format!("RSI {:.1} leaning {}", rsi.value, move_word(direction)))
    } else {
        (0.0, format!("RSI {:.1} against direction", rsi.value))
    }
}

fn bands_fraction(price: f64, bands: &BandsReading, direction: Direction) -> (f64, String) {
    let (at_extreme, past_middle) = match direction {
        Direction::Long => (price <= bands.lower * 1.01, price < bands.middle),
        Direction::Short => (price >= bands.upper * 0.99, price > bands.middle),
    };

    if at_extreme {
        (1.0, format!("price at {} band", if direction == Direction::Long { "lower" } else { "upper" }))
    } else if past_middle {
        (0.5, "price on the reversal side of the middle band".into())
    } else {
        (0.0, "bands against direction".into())
    }
}

fn adx_fraction(adx: f64) -> (f64, String) {
    let fraction = if adx >= 25.0 {
        1.0
    } else if adx >= 20.0 {
        0.8
    } else if adx >= 15.0 {
        0.5
    } else {
        0.0
    };
    (fraction, format!("ADX {adx:.1}"))
}

/// Skipped entirely when there is no average to compare against.
fn volume_fraction(volume: &VolumeReading, min_ratio: f64) -> Option<(f64, String)> {
    if volume.average <= 0.0 {
        return None;
    }
    let ratio = volume.current / volume.average;
    let fraction = if ratio >= 1.5 {
        1.0
    } else if ratio >= min_ratio {
        0.6
    } else {
        0.0
    };
    Some((fraction, format!("volume {ratio:.2}x average")))
}

fn side_word(direction: Direction) -> &'static str {
    match direction {
        Direction::Long => "bullish",
        Direction::Short => "bearish",
    }
}

fn cmp_word(direction: Direction) -> &'static str {
    match direction {
        Direction::Long => "above",
        Direction::Short => "below",
    }
}

fn move_word(direction: Direction) -> &'static str {
    match direction {
        Direction::Long => "up",
        Direction::Short => "down",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
