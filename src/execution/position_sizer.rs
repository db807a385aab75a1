use rust_decimal::{Decimal, RoundingStrategy};
use tracing::warn;

use crate::config::DcaConfig;
use crate::models::Direction;

/// Order sizes are floored to this many decimal places.
const SIZE_DECIMALS: u32 = 4;

/// Floor to 4 decimal places, so the committed size never exceeds the budget.
pub fn floor_size(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(SIZE_DECIMALS, RoundingStrategy::ToNegativeInfinity)
}

/// Size committed to a new position: `balance × pct / 100`, floored.
pub fn position_size(balance: Decimal, position_size_pct: Decimal) -> Decimal {
    floor_size(balance * position_size_pct / Decimal::ONE_HUNDRED)
}

/// Take-profit and stop-loss trigger prices for an entry.
pub fn protective_prices(
    direction: Direction,
    entry: Decimal,
    take_profit_pct: Decimal,
    stop_loss_pct: Decimal,
) -> (Decimal, Decimal) {
    let tp = take_profit_pct / Decimal::ONE_HUNDRED;
    let sl = stop_loss_pct / Decimal::ONE_HUNDRED;
    match direction {
        Direction::Long => (entry * (Decimal::ONE + tp), entry * (Decimal::ONE - sl)),
        Direction::Short => (entry * (Decimal::ONE - tp), entry * (Decimal::ONE + sl)),
    }
}

/// Signed price move relative to entry, in percent, scaled by leverage.
pub fn leveraged_pnl_pct(
    direction: Direction,
    entry: Decimal,
    price: Decimal,
    leverage: u32,
) -> Decimal {
    if entry.is_zero() {
        return Decimal::ZERO;
    }
    (price - entry) / entry * Decimal::ONE_HUNDRED * Decimal::from(leverage) * direction.sign()
}

/// Averaging legs as `(price, size)` pairs, nearest first.
///
/// Leg `i` (1-based) sits `price_step_pct × i` percent against the position
/// and is `multiplier^i` times the base size. The ladder stops at the first
/// leg whose size overflows or whose price is no longer positive.
pub fn dca_ladder(
    direction: Direction,
    entry: Decimal,
    base_size: Decimal,
    config: &DcaConfig,
) -> Vec<(Decimal, Decimal)> {
    let step = config.price_step_pct / Decimal::ONE_HUNDRED;
    let mut scale = Decimal::ONE;
    let mut legs = Vec::new();

    for i in 1..=config.max_orders {
        let leg = scale.checked_mul(config.multiplier).and_then(|next| {
            scale = next;
            let size = base_size.checked_mul(next)?;
            let offset = step.checked_mul(Decimal::from(i))?;
            let price = match direction {
                Direction::Long => entry.checked_mul(Decimal::ONE - offset)?,
                Direction::Short => entry.checked_mul(Decimal::ONE.checked_add(offset)?)?,
            };
            Some((price, floor_size(size)))
        });

        match leg {
            Some((price, size)) if price > Decimal::ZERO => legs.push((price, size)),
            _ => {
                warn!(leg = i, max_orders = config.max_orders, "DCA ladder truncated: leg out of range");
                break;
            }
        }
    }

    legs
}

/// PnL % at which the trailing stop arms.
pub fn trailing_activation_pnl(take_profit_pct: Decimal, activation_ratio: Decimal) -> Decimal {
    take_profit_pct * activation_ratio
}

/// Stop trigger `distance_pct` percent behind the current price.
pub fn trailing_stop_price(direction: Direction, price: Decimal, distance_pct: Decimal) -> Decimal {
    let distance = distance_pct / Decimal::ONE_HUNDRED;
    match direction {
        Direction::Long => price * (Decimal::ONE - distance),
        Direction::Short => price * (Decimal::ONE + distance),
    }
}

/// True when `candidate` locks in more than `current` for this direction.
pub fn is_tighter(direction: Direction, candidate: Decimal, current: Decimal) -> bool {
    match direction {
        Direction::Long => candidate > current,
        Direction::Short => candidate < current,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
