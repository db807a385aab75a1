use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::RiskConfig;

/// Entry gates. They only ever block new positions; open ones keep being managed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    /// Max drawdown from the day-start balance, in percent (default 10).
    pub daily_loss_limit_pct: Decimal,
    /// Max concurrent open positions (default 1).
    pub max_open_positions: usize,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self::from(&RiskConfig::default())
    }
}

impl From<&RiskConfig> for RiskLimits {
    fn from(config: &RiskConfig) -> Self {
        Self {
            daily_loss_limit_pct: config.daily_loss_limit_pct,
            max_open_positions: config.max_open_positions,
        }
    }
}

/// Account state the gates are evaluated against.
#[derive(Debug, Clone)]
pub struct PortfolioSnapshot {
    pub day_start_balance: Decimal,
    pub current_balance: Decimal,
    pub open_positions: usize,
}

impl PortfolioSnapshot {
    /// Loss since the day started, in percent. Gains read as negative.
    pub fn daily_drawdown_pct(&self) -> Decimal {
        if self.day_start_balance <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (self.day_start_balance - self.current_balance) / self.day_start_balance
            * Decimal::ONE_HUNDRED
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RiskViolation {
    #[error("daily loss limit reached: drawdown {drawdown}% >= limit {limit}%")]
    DailyLossExceeded { drawdown: Decimal, limit: Decimal },

    #[error("too many open positions: {current}/{max}")]
    TooManyPositions { current: usize, max: usize },
}

/// Run the entry gates in order. Returns Ok(()) if a new position may open.
pub fn check_entry(
    portfolio: &PortfolioSnapshot,
    limits: &RiskLimits,
) -> Result<(), RiskViolation> {
    // 1. Daily loss
    let drawdown = portfolio.daily_drawdown_pct();
    if drawdown >= limits.daily_loss_limit_pct {
        return Err(RiskViolation::DailyLossExceeded {
            drawdown: drawdown.round_dp(2),
            limit: limits.daily_loss_limit_pct,
        });
    }

    // 2. Open position count
    if portfolio.open_positions >= limits.max_open_positions {
        return Err(RiskViolation::TooManyPositions {
            current: portfolio.open_positions,
            max: limits.max_open_positions,
        });
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn default_portfolio() -> PortfolioSnapshot {
        PortfolioSnapshot {
            day_start_balance: Decimal::from(1_000),
            current_balance: Decimal::from(1_000),
            open_positions: 0,
        }
    }

    #[test]
    fn test_risk_check_passes() {
        let result = check_entry(&default_portfolio(), &RiskLimits::default());
        assert!(result.is_ok());
    }

    #[test]
    fn test_daily_loss_exceeded() {
        let portfolio = PortfolioSnapshot {
            current_balance: Decimal::from(880), // 12% down
            ..default_portfolio()
        };
        let result = check_entry(&portfolio, &RiskLimits::default());
        assert_eq!(
            result,
            Err(RiskViolation::DailyLossExceeded {
                drawdown: Decimal::from(12),
                limit: Decimal::from(10),
            })
        );
    }

    #[test]
    fn test_loss_limit_is_inclusive() {
        let portfolio = PortfolioSnapshot {
            current_balance: Decimal::from(900),
            ..default_portfolio()
        };
        let result = check_entry(&portfolio, &RiskLimits::default());
        assert!(matches!(result, Err(RiskViolation::DailyLossExceeded { .. })));
    }

    #[test]
    fn test_gains_never_block() {
        let portfolio = PortfolioSnapshot {
            current_balance: Decimal::from(1_500),
            ..default_portfolio()
        };
        assert!(portfolio.daily_drawdown_pct() < Decimal::ZERO);
        assert!(check_entry(&portfolio, &RiskLimits::default()).is_ok());
    }

    #[test]
    fn test_too_many_positions() {
        let portfolio = PortfolioSnapshot {
            open_positions: 1,
            ..default_portfolio()
        };
        let result = check_entry(&portfolio, &RiskLimits::default());
        assert!(matches!(result, Err(RiskViolation::TooManyPositions { current: 1, max: 1 })));
    }

    #[test]
    fn test_zero_day_start_has_no_drawdown() {
        let portfolio = PortfolioSnapshot {
            day_start_balance: Decimal::ZERO,
            current_balance: Decimal::ZERO,
            open_positions: 0,
        };
        assert_eq!(portfolio.daily_drawdown_pct(), Decimal::ZERO);
    }
}
