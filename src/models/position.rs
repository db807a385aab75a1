use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Direction;
use crate::config::StrategyKind;
use crate::errors::BotError;
use crate::execution::position_sizer::{floor_size, leveraged_pnl_pct};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    PendingOpen,
    Open,
    PartiallyClosed,
    Closed,
}

// ---------------------------------------------------------------------------
// Protective orders
// ---------------------------------------------------------------------------

/// Conditional close order attached to a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectiveKind {
    TakeProfit,
    StopLoss,
    TrailingStop,
}

impl ProtectiveKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            ProtectiveKind::TakeProfit => "tp",
            ProtectiveKind::StopLoss => "sl",
            ProtectiveKind::TrailingStop => "ts",
        }
    }

    /// Client order id tagging the order with its position: `tp_{id}_{ts}`.
    pub fn client_oid(&self, position_id: &str, timestamp_ms: i64) -> String {
        format!("{}_{}_{}", self.prefix(), position_id, timestamp_ms)
    }

    /// Whether `client_oid` was produced by [`Self::client_oid`] for this position.
    pub fn tags(&self, client_oid: &str, position_id: &str) -> bool {
        client_oid
            .strip_prefix(self.prefix())
            .and_then(|rest| rest.strip_prefix('_'))
            .and_then(|rest| rest.strip_prefix(position_id))
            .is_some_and(|rest| rest.starts_with('_'))
    }

    /// Stop-type orders are the ones a trailing stop replaces.
    pub fn is_stop(&self) -> bool {
        matches!(self, ProtectiveKind::StopLoss | ProtectiveKind::TrailingStop)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectiveOrder {
    pub kind: ProtectiveKind,
    pub order_id: String,
    pub client_oid: String,
    pub trigger_price: Decimal,
}

/// Averaging leg pre-placed as a resting limit order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DcaLeg {
    pub order_id: String,
    pub price: Decimal,
    pub size: Decimal,
    pub created: DateTime<Utc>,
    pub executed: bool,
}

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// An open exposure owned by the position ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub direction: Direction,
    pub status: PositionStatus,
    pub entry_price: Decimal,
    /// Original size; closes are tracked as a percentage of it.
    pub size: Decimal,
    pub entry_time: DateTime<Utc>,
    pub take_profit_price: Decimal,
    pub stop_loss_price: Decimal,
    pub trailing_stop_active: bool,
    pub trailing_stop_price: Option<Decimal>,
    pub highest_pnl: Decimal,
    pub lowest_pnl: Decimal,
    pub current_pnl: Decimal,
    pub confidence_level: u8,
    pub partially_closed_pct: Decimal,
    pub level1_closed: bool,
    pub level2_closed: bool,
    pub dca_legs: Vec<DcaLeg>,
    pub protective_orders: Vec<ProtectiveOrder>,
    /// Exchange-side identity this position was matched to during reconciliation.
    pub exchange_key: Option<String>,
}

impl Position {
    /// A position whose opening order has not been confirmed yet.
    pub fn pending(
        client_oid: String,
        direction: Direction,
        price: Decimal,
        size: Decimal,
        confidence_level: u8,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: client_oid,
            direction,
            status: PositionStatus::PendingOpen,
            entry_price: price,
            size,
            entry_time: now,
            take_profit_price: Decimal::ZERO,
            stop_loss_price: Decimal::ZERO,
            trailing_stop_active: false,
            trailing_stop_price: None,
            highest_pnl: Decimal::ZERO,
            lowest_pnl: Decimal::ZERO,
            current_pnl: Decimal::ZERO,
            confidence_level,
            partially_closed_pct: Decimal::ZERO,
            level1_closed: false,
            level2_closed: false,
            dca_legs: Vec::new(),
            protective_orders: Vec::new(),
            exchange_key: None,
        }
    }

    /// Move PENDING_OPEN -> OPEN once the exchange acknowledged the order.
    pub fn confirm(&mut self, order_id: String) -> Result<(), BotError> {
        if self.status != PositionStatus::PendingOpen {
            return Err(BotError::InvalidRequest(format!(
                "position {} is not pending",
                self.id
            )));
        }
        self.id = order_id;
        self.status = PositionStatus::Open;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.status == PositionStatus::Closed
    }

    pub fn remaining_pct(&self) -> Decimal {
        (Decimal::ONE_HUNDRED - self.partially_closed_pct).max(Decimal::ZERO)
    }

    pub fn remaining_size(&self) -> Decimal {
        floor_size(self.size * self.remaining_pct() / Decimal::ONE_HUNDRED)
    }

    /// Record a confirmed close of `pct` percent of the original size.
    ///
    /// The closed share only grows and is capped at 100; reaching 100 closes
    /// the position for good.
    pub fn record_close(&mut self, pct: Decimal) -> Result<(), BotError> {
        if self.is_closed() {
            return Err(BotError::InvalidRequest(format!(
                "position {} is already closed",
                self.id
            )));
        }
        if pct <= Decimal::ZERO {
            return Err(BotError::InvalidRequest(format!(
                "close percentage {pct} must be positive"
            )));
        }

        self.partially_closed_pct = (self.partially_closed_pct + pct).min(Decimal::ONE_HUNDRED);
        self.status = if self.partially_closed_pct >= Decimal::ONE_HUNDRED {
            PositionStatus::Closed
        } else {
            PositionStatus::PartiallyClosed
        };
        Ok(())
    }

    pub fn pnl_at(&self, price: Decimal, leverage: u32) -> Decimal {
        leveraged_pnl_pct(self.direction, self.entry_price, price, leverage)
    }

    /// Refresh current PnL and the high/low watermarks.
    pub fn mark(&mut self, price: Decimal, leverage: u32) {
        let pnl = self.pnl_at(price, leverage);
        self.current_pnl = pnl;
        self.highest_pnl = self.highest_pnl.max(pnl);
        self.lowest_pnl = self.lowest_pnl.min(pnl);
    }

    pub fn age_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.entry_time).num_minutes()
    }

    pub fn protective(&self, kind: ProtectiveKind) -> impl Iterator<Item = &ProtectiveOrder> {
        self.protective_orders.iter().filter(move |o| o.kind == kind)
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeOutcome {
    Win,
    Loss,
}

impl TradeOutcome {
    pub fn from_pnl(pnl: Decimal) -> Self {
        if pnl >= Decimal::ZERO {
            TradeOutcome::Win
        } else {
            TradeOutcome::Loss
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeOutcome::Win => "win",
            TradeOutcome::Loss => "loss",
        }
    }
}

/// Trade record written when a position opens and amended once when it closes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionHistoryEntry {
    pub id: String,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub size: Decimal,
    pub entry_time: DateTime<Utc>,
    pub take_profit_price: Decimal,
    pub stop_loss_price: Decimal,
    pub confidence_level: u8,
    pub strategy: StrategyKind,
    pub reason: String,
    pub close_price: Option<Decimal>,
    pub close_time: Option<DateTime<Utc>>,
    pub pnl: Option<Decimal>,
    pub result: Option<TradeOutcome>,
    pub partially_closed_pct: Decimal,
}

impl PositionHistoryEntry {
    pub fn opened(position: &Position, strategy: StrategyKind, reason: &str) -> Self {
        Self {
            id: position.id.clone(),
            direction: position.direction,
            entry_price: position.entry_price,
            size: position.size,
            entry_time: position.entry_time,
            take_profit_price: position.take_profit_price,
            stop_loss_price: position.stop_loss_price,
            confidence_level: position.confidence_level,
            strategy,
            reason: reason.to_string(),
            close_price: None,
            close_time: None,
            pnl: None,
            result: None,
            partially_closed_pct: Decimal::ZERO,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.close_time.is_some()
    }

    /// Amend the entry with its closing data. Returns false if it was already closed.
    pub fn close(
        &mut self,
        close_price: Decimal,
        close_time: DateTime<Utc>,
        pnl: Decimal,
        partially_closed_pct: Decimal,
    ) -> bool {
        if self.is_closed() {
            return false;
        }
        self.close_price = Some(close_price);
        self.close_time = Some(close_time);
        self.pnl = Some(pnl.round_dp(4));
        self.result = Some(TradeOutcome::from_pnl(pnl));
        self.partially_closed_pct = partially_closed_pct;
        true
    }
}

// ---- Tests ----

#[cfg(test)]
mod tests {
    use super::*;

    fn open_long() -> Position {
        let mut p = Position::pending(
            "oid-1".into(),
            Direction::Long,
            Decimal::from(100),
            Decimal::from(10),
            70,
            Utc::now(),
        );
        p.confirm("ord-1".into()).unwrap();
        p
    }

    #[test]
    fn test_confirm_only_from_pending() {
        let mut p = open_long();
        assert_eq!(p.id, "ord-1");
        assert_eq!(p.status, PositionStatus::Open);
        assert!(p.confirm("ord-2".into()).is_err());
    }

    #[test]
    fn test_record_close_is_monotonic_and_capped() {
        let mut p = open_long();
        p.record_close(Decimal::from(30)).unwrap();
        assert_eq!(p.status, PositionStatus::PartiallyClosed);
        assert_eq!(p.remaining_size(), Decimal::from(7));

        p.record_close(Decimal::from(90)).unwrap();
        assert_eq!(p.partially_closed_pct, Decimal::ONE_HUNDRED);
        assert!(p.is_closed());

        // no resurrection
        assert!(p.record_close(Decimal::from(10)).is_err());
        assert_eq!(p.partially_closed_pct, Decimal::ONE_HUNDRED);
    }

    #[test]
    fn test_mark_tracks_watermarks() {
        let mut p = open_long();
        p.mark(Decimal::from(101), 5);
        assert_eq!(p.current_pnl, Decimal::from(5));
        p.mark(Decimal::from(99), 5);
        assert_eq!(p.current_pnl, Decimal::from(-5));
        assert_eq!(p.highest_pnl, Decimal::from(5));
        assert_eq!(p.lowest_pnl, Decimal::from(-5));
    }

    #[test]
    fn test_protective_tags() {
        let oid = ProtectiveKind::TakeProfit.client_oid("123", 1_700_000_000_000);
        assert_eq!(oid, "tp_123_1700000000000");
        assert!(ProtectiveKind::TakeProfit.tags(&oid, "123"));
        assert!(!ProtectiveKind::StopLoss.tags(&oid, "123"));
        // prefix of another id must not match
        assert!(!ProtectiveKind::TakeProfit.tags(&oid, "12"));
    }

    #[test]
    fn test_history_closes_once() {
        let p = open_long();
        let mut entry = PositionHistoryEntry::opened(&p, StrategyKind::Scalping, "signal");
        let now = Utc::now();
        assert!(entry.close(Decimal::from(99), now, Decimal::from(-5), Decimal::ZERO));
        assert_eq!(entry.result, Some(TradeOutcome::Loss));
        assert!(!entry.close(Decimal::from(120), now, Decimal::from(100), Decimal::ZERO));
        assert_eq!(entry.close_price, Some(Decimal::from(99)));
    }

    #[test]
    fn test_breakeven_counts_as_win() {
        assert_eq!(TradeOutcome::from_pnl(Decimal::ZERO), TradeOutcome::Win);
    }
}
