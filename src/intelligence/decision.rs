use chrono::{DateTime, Duration, Utc};

use super::scorer::score;
use crate::config::{EntryMode, EntrySettings, IndicatorSettings};
use crate::indicators::{IndicatorSnapshot, PULLBACK_LOOKBACK};
use crate::models::{Direction, SignalResult};

/// Oscillator extremes that veto entries in requirement mode.
const RSI_VETO_OVERBOUGHT: f64 = 70.0;
const RSI_VETO_OVERSOLD: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionPhase {
    Cooldown,
    Ready,
}

/// Candidate directions before filters and scoring.
#[derive(Debug, Default)]
struct Bias {
    long: bool,
    short: bool,
    reasons: Vec<String>,
}

/// Turns indicator snapshots into entry signals, at most one per cooldown window.
#[derive(Debug, Clone, Default)]
pub struct EntryDecision {
    last_signal_at: Option<DateTime<Utc>>,
}

impl EntryDecision {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_signal_at(&self) -> Option<DateTime<Utc>> {
        self.last_signal_at
    }

    pub fn phase(&self, now: DateTime<Utc>, cooldown: Duration) -> DecisionPhase {
        match self.last_signal_at {
            Some(at) if now - at < cooldown => DecisionPhase::Cooldown,
            _ => DecisionPhase::Ready,
        }
    }

    /// Evaluate the snapshot. `None` is the normal "no entry" outcome.
    ///
    /// Emitting a signal starts the cooldown; a requirement-mode rejection
    /// for low confidence does not.
    pub fn evaluate(
        &mut self,
        snapshot: &IndicatorSnapshot,
        entry: &EntrySettings,
        indicators: &IndicatorSettings,
        now: DateTime<Utc>,
    ) -> Option<SignalResult> {
        let cooldown = Duration::seconds(entry.cooldown_secs);
        if self.phase(now, cooldown) == DecisionPhase::Cooldown {
            tracing::debug!(
                last_signal_at = ?self.last_signal_at,
                cooldown_secs = entry.cooldown_secs,
                "Entry decision cooling down"
            );
            return None;
        }

        let mut bias = primary_bias(snapshot)
            .or_else(|| fallback_bias(snapshot, indicators))
            .unwrap_or_default();

        match entry.mode {
            EntryMode::Recommendation => apply_recommendations(snapshot, indicators, &mut bias),
            EntryMode::Requirement => apply_requirements(snapshot, indicators, &mut bias),
        }

        let direction = if bias.long {
            Direction::Long
        } else if bias.short {
            Direction::Short
        } else {
            return None;
        };

        let breakdown = score(snapshot, direction, &entry.weights, indicators);
        if entry.mode == EntryMode::Requirement && breakdown.confidence < entry.confidence_threshold {
            tracing::info!(
                direction = %direction,
                confidence = breakdown.confidence,
                threshold = entry.confidence_threshold,
                "Signal below confidence threshold"
            );
            return None;
        }

        let mut reasons = bias.reasons;
        reasons.extend(breakdown.reasons());

        self.last_signal_at = Some(now);
        Some(SignalResult {
            direction,
            confidence: breakdown.confidence,
            reasons,
            timestamp: now,
        })
    }
}

/// Channel pullback: price back above (below) the centre after a recent cross.
fn primary_bias(snapshot: &IndicatorSnapshot) -> Option<Bias> {
    let channel = snapshot.channel.as_ref()?;
    let price = snapshot.price;
    let (crossed_up, crossed_down) = recent_crosses(&snapshot.recent_closes, &channel.recent_centers);

    let ema_allows_long = snapshot.ema.map_or(true, |e| e.fast >= e.slow);
    let ema_allows_short = snapshot.ema.map_or(true, |e| e.fast <= e.slow);

    let mut bias = Bias {
        long: price > channel.center && crossed_up && ema_allows_long,
        short: price < channel.center && crossed_down && ema_allows_short,
        reasons: Vec::new(),
    };
    if bias.long {
        bias.reasons.push("pullback to channel centre from below".into());
    }
    if bias.short {
        bias.reasons.push("pullback to channel centre from above".into());
    }
    Some(bias)
}

/// Momentum plus moving-average alignment when no channel is available.
fn fallback_bias(snapshot: &IndicatorSnapshot, indicators: &IndicatorSettings) -> Option<Bias> {
    let ema = snapshot.ema?;
    let rsi = snapshot.rsi?;

    let mut bias = Bias {
        long: ema.fast > ema.slow && rsi.value < indicators.rsi.oversold && rsi.is_rising(),
        short: ema.fast < ema.slow && rsi.value > indicators.rsi.overbought && rsi.is_falling(),
        reasons: Vec::new(),
    };
    if bias.long {
        bias.reasons.push(format!("EMA uptrend with RSI {:.1} turning up", rsi.value));
    }
    if bias.short {
        bias.reasons.push(format!("EMA downtrend with RSI {:.1} turning down", rsi.value));
    }
    Some(bias)
}

fn apply_recommendations(snapshot: &IndicatorSnapshot, indicators: &IndicatorSettings, bias: &mut Bias) {
    if let Some(bands) = snapshot.bands {
        if snapshot.price <= bands.lower * 1.01 {
            bias.long = true;
            bias.reasons.push("price at lower Bollinger band".into());
        } else if snapshot.price >= bands.upper * 0.99 {
            bias.short = true;
            bias.reasons.push("price at upper Bollinger band".into());
        }
    }

    if !(bias.long || bias.short) {
        return;
    }
    if let Some(adx) = snapshot.adx {
        if adx < indicators.adx.min_value {
            bias.reasons.push(format!("advisory: weak trend, ADX {adx:.1}"));
        }
    }
    if let Some(volume) = snapshot.volume {
        if volume.average > 0.0 && volume.current < volume.average * indicators.volume.min_ratio {
            bias.reasons.push("advisory: thin volume".into());
        }
    }
}

fn apply_requirements(snapshot: &IndicatorSnapshot, indicators: &IndicatorSettings, bias: &mut Bias) {
    if let Some(adx) = snapshot.adx {
        if adx < indicators.adx.min_value {
            bias.long = false;
            bias.short = false;
            return;
        }
    }
    if let Some(rsi) = snapshot.rsi {
        if rsi.value > RSI_VETO_OVERBOUGHT {
            bias.long = false;
        }
        if rsi.value < RSI_VETO_OVERSOLD {
            bias.short = false;
        }
    }
}

/// Whether closes crossed the centre upward / downward within the lookback.
/// Both series are aligned at their most recent value.
fn recent_crosses(closes: &[f64], centers: &[f64]) -> (bool, bool) {
    let n = closes.len().min(centers.len()).min(PULLBACK_LOOKBACK);
    let closes = &closes[closes.len() - n..];
    let centers = &centers[centers.len() - n..];

    let mut up = false;
    let mut down = false;
    for i in 0..n.saturating_sub(1) {
        if closes[i] < centers[i] && closes[i + 1] > centers[i + 1] {
            up = true;
        }
        if closes[i] > centers[i] && closes[i + 1] < centers[i + 1] {
            down = true;
        }
    }
    (up, down)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
