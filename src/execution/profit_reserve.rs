use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use super::position_sizer::floor_size;
use crate::config::ReinvestmentConfig;

/// Minimum spacing between two withdrawals.
const WITHDRAWAL_INTERVAL_HOURS: i64 = 24;

/// Profit set aside from trading.
///
/// Nothing is moved off the exchange account. Reserved funds are only
/// excluded from the balance that positions are sized from.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProfitReserve {
    pub total_withdrawn: Decimal,
    pub last_withdrawal: Option<DateTime<Utc>>,
}

impl ProfitReserve {
    /// Exchange balance minus everything reserved so far, never negative.
    pub fn tradable(&self, balance: Decimal) -> Decimal {
        (balance - self.total_withdrawn).max(Decimal::ZERO)
    }

    /// Reserve `withdrawal_pct` of the profit over `initial` once it reaches
    /// the threshold, at most once per day. Returns the amount reserved.
    pub fn check(
        &mut self,
        config: &ReinvestmentConfig,
        initial: Decimal,
        tradable: Decimal,
        now: DateTime<Utc>,
    ) -> Option<Decimal> {
        if !config.enabled || initial <= Decimal::ZERO {
            return None;
        }

        let profit = tradable - initial;
        let profit_pct = profit / initial * Decimal::ONE_HUNDRED;
        if profit_pct < config.withdrawal_threshold_pct {
            return None;
        }
        if let Some(last) = self.last_withdrawal {
            if now - last < Duration::hours(WITHDRAWAL_INTERVAL_HOURS) {
                return None;
            }
        }

        let amount = floor_size(profit * config.withdrawal_pct / Decimal::ONE_HUNDRED);
        if amount <= Decimal::ZERO {
            return None;
        }
        self.total_withdrawn += amount;
        self.last_withdrawal = Some(now);
        Some(amount)
    }
}

// ---- Tests ----
