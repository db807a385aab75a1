use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use super::{Position, PositionHistoryEntry};
use crate::indicators::IndicatorSnapshot;

#[derive(Debug, Clone, Serialize)]
pub struct PnlSummary {
    /// Balance change since the day started, in percent.
    pub daily: Decimal,
    /// Balance change since the engine started, in percent.
    pub total: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct TradeStats {
    pub win_rate: Decimal,
    pub total_trades: usize,
}

/// Profit withdrawal settings and what has been reserved so far.
#[derive(Debug, Clone, Serialize)]
pub struct ReinvestmentStatus {
    pub enabled: bool,
    pub withdrawal_pct: Decimal,
    pub withdrawal_threshold_pct: Decimal,
    pub total_withdrawn: Decimal,
    pub last_withdrawal: Option<DateTime<Utc>>,
}

/// Point-in-time view returned by the engine's status query.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub symbol: String,
    pub balance: Decimal,
    pub current_price: Decimal,
    pub pnl: PnlSummary,
    pub open_positions: Vec<Position>,
    /// Most recent trades first, at most ten.
    pub last_trades: Vec<PositionHistoryEntry>,
    pub indicators: Option<IndicatorSnapshot>,
    pub stats: TradeStats,
    pub reinvestment: ReinvestmentStatus,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
}
