//! Average Directional Index (Wilder).
//!
//! 1. +DM / -DM and true range from consecutive bars
//! 2. Wilder-smooth all three over `period`
//! 3. DX = 100 × |+DI − −DI| / (+DI + −DI)
//! 4. ADX = Wilder-smoothed DX
//!
//! Needs `2 × period + 1` bars before the first value.

use crate::exchange::Candle;

/// Latest ADX value, or `None` when the history is too short.
pub fn adx(candles: &[Candle], period: usize) -> Option<f64> {
    adx_series(candles, period).last().copied()
}

/// ADX values aligned to the end of `candles` (shorter than the input).
pub fn adx_series(candles: &[Candle], period: usize) -> Vec<f64> {
    if period == 0 || candles.len() < 2 * period + 1 {
        return Vec::new();
    }

    let mut tr = Vec::with_capacity(candles.len() - 1);
    let mut plus_dm = Vec::with_capacity(candles.len() - 1);
    let mut minus_dm = Vec::with_capacity(candles.len() - 1);

    for pair in candles.windows(2) {
        let (prev, cur) = (&pair[0], &pair[1]);
        let up = cur.high - prev.high;
        let down = prev.low - cur.low;

        plus_dm.push(if up > down && up > 0.0 { up } else { 0.0 });
        minus_dm.push(if down > up && down > 0.0 { down } else { 0.0 });
        tr.push(
            (cur.high - cur.low)
                .max((cur.high - prev.close).abs())
                .max((cur.low - prev.close).abs()),
        );
    }

    let smooth_tr = wilder_smooth(&tr, period);
    let smooth_plus = wilder_smooth(&plus_dm, period);
    let smooth_minus = wilder_smooth(&minus_dm, period);

    let dx: Vec<f64> = smooth_tr
        .iter()
        .zip(smooth_plus.iter().zip(&smooth_minus))
        .map(|(&tr, (&plus, &minus))| {
            if tr == 0.0 {
                return 0.0;
            }
            let plus_di = 100.0 * plus / tr;
            let minus_di = 100.0 * minus / tr;
            let sum = plus_di + minus_di;
            if sum == 0.0 {
                0.0
            } else {
                100.0 * (plus_di - minus_di).abs() / sum
            }
        })
        .collect();

    wilder_smooth(&dx, period)
}

/// Seed with the mean of the first `period` values, then
/// `s = s + (x − s) / period`. Output starts at input index `period − 1`.
fn wilder_smooth(values: &[f64], period: usize) -> Vec<f64> {
    if values.len() < period {
        return Vec::new();
    }

    let p = period as f64;
    let mut current = values[..period].iter().sum::<f64>() / p;
    let mut out = Vec::with_capacity(values.len() - period + 1);
    out.push(current);

    for &v in &values[period..] {
        current += (v - current) / p;
        out.push(current);
    }
    out
}
