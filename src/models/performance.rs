use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{PositionHistoryEntry, TradeOutcome};

/// Per-day trading record, rolled over at the calendar-day boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyPerformance {
    pub date: NaiveDate,
    pub start_balance: Decimal,
    pub end_balance: Decimal,
    pub trades: u32,
    pub win_count: u32,
    pub loss_count: u32,
}

impl DailyPerformance {
    pub fn new(date: NaiveDate, balance: Decimal) -> Self {
        Self {
            date,
            start_balance: balance,
            end_balance: balance,
            trades: 0,
            win_count: 0,
            loss_count: 0,
        }
    }

    /// Fold a finalized trade into the day's counters.
    pub fn record(&mut self, entry: &PositionHistoryEntry) {
        match entry.result {
            Some(TradeOutcome::Win) => self.win_count += 1,
            Some(TradeOutcome::Loss) => self.loss_count += 1,
            None => return,
        }
        self.trades += 1;
    }

    pub fn profit_pct(&self) -> Decimal {
        if self.start_balance.is_zero() {
            return Decimal::ZERO;
        }
        ((self.end_balance - self.start_balance) / self.start_balance * Decimal::ONE_HUNDRED)
            .round_dp(2)
    }
}
