use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use metrics::{counter, gauge};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::position_sizer::{
    dca_ladder, floor_size, is_tighter, position_size, protective_prices, trailing_activation_pnl,
    trailing_stop_price,
};
use crate::config::{BotConfig, StrategyKind};
use crate::errors::BotError;
use crate::events::{EngineEvent, EventBus, LogCategory, LogLevel, PositionClosed};
use crate::exchange::{Exchange, ExchangePosition, OrderRequest, PlanOrderRequest};
use crate::models::{
    DcaLeg, Direction, Position, PositionHistoryEntry, PositionStatus, ProtectiveKind,
    ProtectiveOrder,
};

/// Trigger prices are sent with this many decimals.
const PRICE_DECIMALS: u32 = 6;

/// Size difference below which an exchange report and a DCA leg are considered equal.
const SIZE_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 4);

/// Trailing stop stays alive past the max duration while PnL holds this share of its high.
const TRAILING_HOLD_RATIO: Decimal = Decimal::from_parts(9, 0, 0, false, 1);

/// Sole owner of open positions and the trade history.
///
/// Every mutation that reflects an exchange action happens only after the
/// exchange confirmed it; a failed call leaves the ledger untouched.
pub struct PositionLedger {
    exchange: Arc<dyn Exchange>,
    config: BotConfig,
    events: EventBus,
    balance: Decimal,
    last_price: Decimal,
    positions: Vec<Position>,
    history: Vec<PositionHistoryEntry>,
    closed_ids: HashSet<String>,
    closed_keys: HashSet<String>,
    finalized: Vec<PositionHistoryEntry>,
}

impl PositionLedger {
    pub fn new(exchange: Arc<dyn Exchange>, config: BotConfig, events: EventBus) -> Self {
        Self {
            exchange,
            config,
            events,
            balance: Decimal::ZERO,
            last_price: Decimal::ZERO,
            positions: Vec::new(),
            history: Vec::new(),
            closed_ids: HashSet::new(),
            closed_keys: HashSet::new(),
            finalized: Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn position(&self, id: &str) -> Option<&Position> {
        self.positions.iter().find(|p| p.id == id)
    }

    pub fn open_count(&self) -> usize {
        self.positions.iter().filter(|p| !p.is_closed()).count()
    }

    pub fn history(&self) -> &[PositionHistoryEntry] {
        &self.history
    }

    /// Most recent entries first.
    pub fn recent_history(&self, limit: usize) -> Vec<PositionHistoryEntry> {
        self.history.iter().rev().take(limit).cloned().collect()
    }

    pub fn balance(&self) -> Decimal {
        self.balance
    }

    pub fn set_balance(&mut self, balance: Decimal) {
        self.balance = balance;
    }

    pub fn last_price(&self) -> Decimal {
        self.last_price
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    pub fn update_config(&mut self, config: BotConfig) {
        self.config = config;
    }

    /// Record the latest price and refresh every position's PnL watermarks.
    pub fn mark_price(&mut self, price: Decimal) {
        if price <= Decimal::ZERO {
            return;
        }
        self.last_price = price;
        let leverage = self.config.leverage;
        for position in &mut self.positions {
            position.mark(price, leverage);
        }
    }

    /// Finalized history entries not yet folded into the day's performance.
    pub fn drain_closed(&mut self) -> Vec<PositionHistoryEntry> {
        std::mem::take(&mut self.finalized)
    }

    /// Prepend history persisted by an earlier run. Closed ids are
    /// remembered so their exchange positions are never adopted again.
    pub fn seed_history(&mut self, mut entries: Vec<PositionHistoryEntry>) {
        for entry in entries.iter().filter(|e| e.is_closed()) {
            self.closed_ids.insert(entry.id.clone());
        }
        entries.append(&mut self.history);
        self.history = entries;
    }

    // -----------------------------------------------------------------------
    // Open
    // -----------------------------------------------------------------------

    /// Open a position at market. `Ok(None)` means the open was declined
    /// locally (position limit or zero size); nothing was sent.
    pub async fn open_position(
        &mut self,
        direction: Direction,
        price: Decimal,
        reason: &str,
        confidence: u8,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, BotError> {
        let max = self.config.risk.max_open_positions;
        if self.open_count() >= max {
            tracing::info!(open = self.open_count(), max, "Position limit reached, not opening");
            return Ok(None);
        }

        let size = position_size(self.balance, self.config.position_size_pct);
        if size <= Decimal::ZERO {
            tracing::warn!(balance = %self.balance, "Computed position size is zero, not opening");
            return Ok(None);
        }

        let client_oid = format!("open_{}", Uuid::new_v4().simple());
        let mut position = Position::pending(client_oid.clone(), direction, price, size, confidence, now);

        let placed = self
            .exchange
            .place_order(&OrderRequest::market_open(direction, size, client_oid))
            .await?;
        position.confirm(placed.order_id)?;

        let (tp, sl) = protective_prices(
            direction,
            price,
            self.config.take_profit_pct,
            self.config.stop_loss_pct,
        );
        position.take_profit_price = tp.round_dp(PRICE_DECIMALS);
        position.stop_loss_price = sl.round_dp(PRICE_DECIMALS);

        tracing::info!(
            position_id = %position.id,
            direction = %direction,
            price = %price,
            size = %size,
            confidence,
            reason,
            "Position opened"
        );

        let mut fatal = None;
        for (kind, trigger) in [
            (ProtectiveKind::TakeProfit, position.take_profit_price),
            (ProtectiveKind::StopLoss, position.stop_loss_price),
        ] {
            match self.place_protective(&position, kind, trigger, now).await {
                Ok(order) => position.protective_orders.push(order),
                Err(e) if e.is_fatal() => {
                    fatal = Some(e);
                    break;
                }
                Err(e) => {
                    tracing::error!(position_id = %position.id, kind = ?kind, error = %e, "Failed to place protective order");
                    self.events.log(
                        LogCategory::Trading,
                        LogLevel::Error,
                        format!("Failed to place {} order for {}: {e}", kind.prefix(), position.id),
                    );
                }
            }
        }

        if fatal.is_none() && self.config.strategy == StrategyKind::Dca {
            if let Err(e) = self.place_dca_legs(&mut position, now).await {
                fatal = Some(e);
            }
        }

        let entry = PositionHistoryEntry::opened(&position, self.config.strategy, reason);
        self.history.push(entry);
        let id = position.id.clone();
        self.events.log(
            LogCategory::Trading,
            LogLevel::Success,
            format!("Opened {direction} {size} @ {price} ({reason}, confidence {confidence}%)"),
        );
        self.events.publish(EngineEvent::PositionOpened(position.clone()));
        self.positions.push(position);

        counter!("positions_opened_total", "direction" => direction.to_string()).increment(1);
        gauge!("open_positions").set(self.open_count() as f64);

        match fatal {
            Some(e) => Err(e),
            None => Ok(Some(id)),
        }
    }

    async fn place_protective(
        &self,
        position: &Position,
        kind: ProtectiveKind,
        trigger: Decimal,
        now: DateTime<Utc>,
    ) -> Result<ProtectiveOrder, BotError> {
        let client_oid = kind.client_oid(&position.id, now.timestamp_millis());
        let trigger_price = trigger.round_dp(PRICE_DECIMALS);
        let placed = self
            .exchange
            .place_plan_order(&PlanOrderRequest {
                side: position.direction.close_side(),
                size: position.remaining_size(),
                trigger_price,
                client_oid: client_oid.clone(),
            })
            .await?;

        tracing::debug!(position_id = %position.id, kind = ?kind, trigger = %trigger_price, "Protective order placed");
        Ok(ProtectiveOrder {
            kind,
            order_id: placed.order_id,
            client_oid,
            trigger_price,
        })
    }

    /// Rest the averaging ladder as limit orders. Non-fatal failures skip the leg.
    async fn place_dca_legs(&self, position: &mut Position, now: DateTime<Utc>) -> Result<(), BotError> {
        let ladder = dca_ladder(position.direction, position.entry_price, position.size, &self.config.dca);
        for (i, (price, size)) in ladder.into_iter().enumerate() {
            let price = price.round_dp(PRICE_DECIMALS);
            let request = OrderRequest::limit_open(
                position.direction,
                size,
                price,
                format!("dca_{}_{}", position.id, i + 1),
            );
            match self.exchange.place_order(&request).await {
                Ok(placed) => position.dca_legs.push(DcaLeg {
                    order_id: placed.order_id,
                    price,
                    size,
                    created: now,
                    executed: false,
                }),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!(position_id = %position.id, leg = i + 1, error = %e, "Failed to place DCA leg");
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Close
    // -----------------------------------------------------------------------

    /// Close `percentage` percent of the original size at market.
    ///
    /// The actual share is capped at what is still open. Returns the share
    /// that was closed.
    pub async fn close_position(
        &mut self,
        id: &str,
        percentage: Decimal,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Decimal, BotError> {
        if percentage <= Decimal::ZERO || percentage > Decimal::ONE_HUNDRED {
            return Err(BotError::InvalidRequest(format!(
                "close percentage {percentage} outside (0, 100]"
            )));
        }
        let position = self
            .position(id)
            .ok_or_else(|| BotError::InvalidRequest(format!("unknown position {id}")))?;
        if position.is_closed() {
            return Err(BotError::InvalidRequest(format!("position {id} is already closed")));
        }

        let actual = percentage.min(position.remaining_pct());
        let close_size = floor_size(position.size * actual / Decimal::ONE_HUNDRED);
        if close_size <= Decimal::ZERO {
            return Err(BotError::InvalidRequest(format!(
                "closing {actual}% of position {id} rounds to zero"
            )));
        }
        let direction = position.direction;

        let client_oid = format!("close_{}_{}", id, now.timestamp_millis());
        self.exchange
            .place_order(&OrderRequest::market_close(direction, close_size, client_oid))
            .await?;

        let price = self.close_price(id);
        let leverage = self.config.leverage;
        let Some(position) = self.positions.iter_mut().find(|p| p.id == id) else {
            return Err(BotError::InvalidRequest(format!("unknown position {id}")));
        };
        position.record_close(actual)?;
        position.mark(price, leverage);
        let pnl = position.current_pnl;
        let remaining = position.remaining_pct();
        let fully_closed = position.is_closed();
        let snapshot = position.clone();

        tracing::info!(
            position_id = %id,
            percentage = %actual,
            remaining = %remaining,
            price = %price,
            pnl = %pnl,
            reason,
            "Position closed"
        );
        self.events.publish(EngineEvent::PositionClosed(PositionClosed {
            position_id: id.to_string(),
            percentage: actual,
            remaining,
            close_price: price,
            pnl,
        }));
        self.events.log(
            LogCategory::Trading,
            if pnl >= Decimal::ZERO { LogLevel::Success } else { LogLevel::Warning },
            format!("Closed {actual}% of {id} @ {price}, PnL {}% ({reason})", pnl.round_dp(2)),
        );

        if fully_closed {
            self.finalize(id, price, now).await?;
        } else {
            self.events.publish(EngineEvent::PositionUpdated(snapshot));
        }
        Ok(actual)
    }

    fn close_price(&self, id: &str) -> Decimal {
        if self.last_price > Decimal::ZERO {
            self.last_price
        } else {
            self.position(id).map(|p| p.entry_price).unwrap_or_default()
        }
    }

    /// Cancel what is left of a closed position, move it to history and
    /// remember its identity so reconciliation never brings it back.
    async fn finalize(&mut self, id: &str, close_price: Decimal, now: DateTime<Utc>) -> Result<(), BotError> {
        let Some(index) = self.positions.iter().position(|p| p.id == id) else {
            return Ok(());
        };
        let position = self.positions.remove(index);

        self.closed_ids.insert(position.id.clone());
        if let Some(key) = &position.exchange_key {
            // a netted report stays live while another position shares it
            let shared = self.positions.iter().any(|p| p.exchange_key.as_ref() == Some(key));
            if !shared {
                self.closed_keys.insert(key.clone());
            }
        }

        let pnl = position.pnl_at(close_price, self.config.leverage);
        if let Some(entry) = self.history.iter_mut().rev().find(|e| e.id == position.id) {
            if entry.close(close_price, now, pnl, position.partially_closed_pct) {
                self.finalized.push(entry.clone());
            }
        }

        counter!("positions_closed_total", "result" => if pnl >= Decimal::ZERO { "win" } else { "loss" })
            .increment(1);
        gauge!("open_positions").set(self.open_count() as f64);

        let cancelled = self.cancel_protective(&position, |_| true, None).await;
        let legs = self.cancel_dca_legs(&position).await;
        match (cancelled, legs) {
            (Err(e), _) | (_, Err(e)) => Err(e),
            _ => Ok(()),
        }
    }

    /// Cancel resting tagged plan orders of `position` whose kind passes
    /// `filter`, except `keep`. Best-effort: only auth failures propagate.
    ///
    /// The exchange listing is authoritative; when it cannot be fetched the
    /// locally known orders are cancelled instead.
    pub async fn cancel_protective(
        &self,
        position: &Position,
        filter: impl Fn(ProtectiveKind) -> bool,
        keep: Option<&str>,
    ) -> Result<Vec<String>, BotError> {
        let targets: Vec<String> = match self.exchange.open_plan_orders().await {
            Ok(orders) => orders
                .into_iter()
                .filter(|o| {
                    protective_kind_of(&o.client_oid, &position.id).is_some_and(&filter)
                })
                .map(|o| o.order_id)
                .collect(),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tracing::warn!(position_id = %position.id, error = %e, "Plan order listing failed, cancelling known orders");
                position
                    .protective_orders
                    .iter()
                    .filter(|o| filter(o.kind))
                    .map(|o| o.order_id.clone())
                    .collect()
            }
        };

        let mut cancelled = Vec::new();
        for order_id in targets.into_iter().filter(|o| Some(o.as_str()) != keep) {
            match self.exchange.cancel_plan_order(&order_id).await {
                Ok(()) => cancelled.push(order_id),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!(position_id = %position.id, order_id = %order_id, error = %e, "Failed to cancel plan order");
                }
            }
        }
        Ok(cancelled)
    }

    async fn cancel_dca_legs(&self, position: &Position) -> Result<(), BotError> {
        for leg in position.dca_legs.iter().filter(|l| !l.executed) {
            match self.exchange.cancel_order(&leg.order_id).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::debug!(position_id = %position.id, order_id = %leg.order_id, error = %e, "DCA leg cancel failed");
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Protective maintenance
    // -----------------------------------------------------------------------

    /// Take partial profits at the two configured PnL levels.
    ///
    /// Level 2 requires level 1 to have executed in an earlier tick.
    pub async fn check_partial_close_targets(&mut self, price: Decimal, now: DateTime<Utc>) -> Result<(), BotError> {
        let pc = self.config.partial_close.clone();
        if !pc.enabled {
            return Ok(());
        }
        let leverage = self.config.leverage;

        let candidates: Vec<(String, Decimal, bool, bool)> = self
            .positions
            .iter()
            .filter(|p| !p.is_closed())
            .map(|p| (p.id.clone(), p.pnl_at(price, leverage), p.level1_closed, p.level2_closed))
            .collect();

        for (id, pnl, level1, level2) in candidates {
            let (level, amount, threshold) = if !level1 {
                (1, pc.level1_amount_pct, pc.level1_pnl_pct)
            } else if !level2 {
                (2, pc.level2_amount_pct, pc.level2_pnl_pct)
            } else {
                continue;
            };
            if pnl < threshold {
                continue;
            }

            let reason = format!("partial close level {level} at {}% PnL", pnl.round_dp(3));
            match self.close_position(&id, amount, &reason, now).await {
                Ok(_) => {
                    if let Some(position) = self.positions.iter_mut().find(|p| p.id == id) {
                        if level == 1 {
                            position.level1_closed = true;
                        } else {
                            position.level2_closed = true;
                        }
                    }
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!(position_id = %id, level, error = %e, "Partial close failed");
                }
            }
        }
        Ok(())
    }

    /// Arm and ratchet trailing stops.
    ///
    /// A new stop is placed before the previous stop-type orders are
    /// cancelled, so the position is never left without one. Take-profit
    /// orders stay in place.
    pub async fn update_trailing_stops(&mut self, price: Decimal, now: DateTime<Utc>) -> Result<(), BotError> {
        let ts = self.config.trailing_stop.clone();
        if !ts.enabled || price <= Decimal::ZERO {
            return Ok(());
        }
        self.mark_price(price);
        let activation = trailing_activation_pnl(self.config.take_profit_pct, ts.activation_ratio);

        let ids: Vec<String> = self.positions.iter().filter(|p| !p.is_closed()).map(|p| p.id.clone()).collect();
        for id in ids {
            let Some(position) = self.position(&id).cloned() else {
                continue;
            };
            if !position.trailing_stop_active && position.current_pnl < activation {
                continue;
            }

            let candidate = trailing_stop_price(position.direction, price, ts.stop_distance_pct)
                .round_dp(PRICE_DECIMALS);
            if let Some(current) = position.trailing_stop_price {
                if !is_tighter(position.direction, candidate, current) {
                    continue;
                }
            }

            let order = match self.place_protective(&position, ProtectiveKind::TrailingStop, candidate, now).await {
                Ok(order) => order,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!(position_id = %id, trigger = %candidate, error = %e, "Failed to place trailing stop");
                    continue;
                }
            };

            let cancelled = self
                .cancel_protective(&position, |k| k.is_stop(), Some(&order.order_id))
                .await?;

            let Some(position) = self.positions.iter_mut().find(|p| p.id == id) else {
                continue;
            };
            let activated = !position.trailing_stop_active;
            position.trailing_stop_active = true;
            position.trailing_stop_price = Some(candidate);
            position
                .protective_orders
                .retain(|o| !(o.kind.is_stop() || cancelled.contains(&o.order_id)));
            position.protective_orders.push(order);
            let snapshot = position.clone();

            tracing::info!(position_id = %id, trigger = %candidate, pnl = %snapshot.current_pnl, activated, "Trailing stop moved");
            if activated {
                self.events.log(
                    LogCategory::Trading,
                    LogLevel::Info,
                    format!("Trailing stop activated for {id} at {candidate}"),
                );
            }
            self.events.publish(EngineEvent::PositionUpdated(snapshot));
        }
        Ok(())
    }

    /// Force-close positions older than the max duration. A trailing stop
    /// that still holds most of its gain keeps the position alive.
    pub async fn check_position_duration(&mut self, now: DateTime<Utc>) -> Result<Vec<String>, BotError> {
        let max_minutes = self.config.max_trade_duration_minutes;
        let expired: Vec<String> = self
            .positions
            .iter()
            .filter(|p| !p.is_closed() && p.age_minutes(now) >= max_minutes)
            .filter(|p| {
                let holding = p.trailing_stop_active
                    && p.current_pnl > Decimal::ZERO
                    && p.current_pnl >= p.highest_pnl * TRAILING_HOLD_RATIO;
                if holding {
                    tracing::debug!(position_id = %p.id, pnl = %p.current_pnl, "Over max duration but trailing in profit");
                }
                !holding
            })
            .map(|p| p.id.clone())
            .collect();

        let mut closed = Vec::new();
        for id in expired {
            match self.close_position(&id, Decimal::ONE_HUNDRED, "max duration reached", now).await {
                Ok(_) => closed.push(id),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => tracing::warn!(position_id = %id, error = %e, "Duration close failed"),
            }
        }
        Ok(closed)
    }

    /// Recompute TP and/or SL from the entry price and replace the orders.
    pub async fn update_protection(
        &mut self,
        id: &str,
        take_profit_pct: Option<Decimal>,
        stop_loss_pct: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> Result<(), BotError> {
        for pct in [take_profit_pct, stop_loss_pct].into_iter().flatten() {
            if pct <= Decimal::ZERO || pct >= Decimal::ONE_HUNDRED {
                return Err(BotError::InvalidRequest(format!("protection percentage {pct} outside (0, 100)")));
            }
        }
        let position = self
            .position(id)
            .cloned()
            .ok_or_else(|| BotError::InvalidRequest(format!("unknown position {id}")))?;

        let (tp, sl) = protective_prices(
            position.direction,
            position.entry_price,
            take_profit_pct.unwrap_or(self.config.take_profit_pct),
            stop_loss_pct.unwrap_or(self.config.stop_loss_pct),
        );

        let mut changes = Vec::new();
        if take_profit_pct.is_some() {
            changes.push((ProtectiveKind::TakeProfit, tp.round_dp(PRICE_DECIMALS)));
        }
        if stop_loss_pct.is_some() {
            changes.push((ProtectiveKind::StopLoss, sl.round_dp(PRICE_DECIMALS)));
        }

        for (kind, trigger) in changes {
            let order = self.place_protective(&position, kind, trigger, now).await?;
            let cancelled = self
                .cancel_protective(&position, |k| k == kind, Some(&order.order_id))
                .await?;

            if let Some(p) = self.positions.iter_mut().find(|p| p.id == id) {
                p.protective_orders
                    .retain(|o| o.kind != kind && !cancelled.contains(&o.order_id));
                p.protective_orders.push(order);
                match kind {
                    ProtectiveKind::TakeProfit => p.take_profit_price = trigger,
                    _ => p.stop_loss_price = trigger,
                }
            }
            tracing::info!(position_id = %id, kind = ?kind, trigger = %trigger, "Protection updated");
        }

        if let Some(p) = self.position(id) {
            self.events.publish(EngineEvent::PositionUpdated(p.clone()));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------------

    /// Align the ledger with the exchange's position report.
    ///
    /// The exchange decides which positions exist; the ledger keeps the
    /// strategy metadata. Matching is by remembered exchange key first,
    /// then by direction.
    pub async fn reconcile(&mut self, report: &[ExchangePosition], now: DateTime<Utc>) -> Result<(), BotError> {
        let live: Vec<&ExchangePosition> = report
            .iter()
            .filter(|p| {
                let key = p.key();
                !self.closed_keys.contains(&key) && !self.closed_ids.contains(&key)
            })
            .collect();

        // ledger index -> report index
        let mut assigned: Vec<Option<usize>> = self
            .positions
            .iter()
            .map(|position| {
                let key = position.exchange_key.as_ref()?;
                live.iter().position(|p| &p.key() == key)
            })
            .collect();

        // by direction, for positions never matched before; Bitget nets
        // same-side positions, so a claimed report may be shared
        for li in 0..self.positions.len() {
            let position = &self.positions[li];
            if position.exchange_key.is_some() || assigned[li].is_some() {
                continue;
            }
            let same_side = |ei: &usize| live[*ei].direction == position.direction;
            let unclaimed = (0..live.len()).find(|ei| same_side(ei) && !assigned.contains(&Some(*ei)));
            assigned[li] = unclaimed.or_else(|| (0..live.len()).find(|ei| same_side(ei)));
        }

        let mut matched: HashSet<usize> = HashSet::new();
        for (ei, exchange) in live.iter().enumerate() {
            let group: Vec<usize> = (0..self.positions.len())
                .filter(|li| assigned[*li] == Some(ei))
                .collect();
            match group.as_slice() {
                [] => {}
                [li] => {
                    absorb_report(&mut self.positions[*li], exchange);
                    matched.insert(*li);
                }
                _ => {
                    let kept = self.absorb_netted(&group, exchange);
                    matched.extend(kept);
                }
            }
        }

        let leverage = self.config.leverage;
        let price = self.last_price;
        if price > Decimal::ZERO {
            for li in &matched {
                self.positions[*li].mark(price, leverage);
            }
        }

        let vanished: Vec<String> = self
            .positions
            .iter()
            .enumerate()
            .filter(|(li, _)| !matched.contains(li))
            .map(|(_, p)| p.id.clone())
            .collect();
        for id in vanished {
            self.settle_vanished(&id, now).await?;
        }

        let adoptable: Vec<ExchangePosition> = live
            .iter()
            .enumerate()
            .filter(|(ei, _)| !assigned.contains(&Some(*ei)))
            .map(|(_, p)| (*p).clone())
            .collect();
        for exchange in adoptable {
            self.adopt(exchange, now);
        }

        gauge!("open_positions").set(self.open_count() as f64);
        Ok(())
    }

    /// Several ledger positions netted into one exchange report.
    ///
    /// Positions are kept oldest first while their remaining sizes fit the
    /// reported size; the rest count as closed on the exchange. Any surplus
    /// is attributed to DCA legs. Sizes and entry prices stay per position.
    fn absorb_netted(&mut self, group: &[usize], exchange: &ExchangePosition) -> Vec<usize> {
        let key = exchange.key();
        let mut budget = exchange.size + SIZE_TOLERANCE;
        let mut kept = Vec::new();
        for &li in group {
            let remaining = self.positions[li].remaining_size();
            if remaining <= budget {
                budget -= remaining;
                kept.push(li);
            }
        }

        let mut excess = budget - SIZE_TOLERANCE;
        for &li in &kept {
            let position = &mut self.positions[li];
            position.exchange_key = Some(key.clone());
            fill_dca_legs(position, &mut excess);
        }

        tracing::debug!(
            key = %key,
            reported = %exchange.size,
            positions = group.len(),
            kept = kept.len(),
            "Netted exchange position shared by ledger positions"
        );
        kept
    }

    /// The exchange no longer reports this position: a TP/SL or manual
    /// close happened there. Record the rest as closed at the last price.
    async fn settle_vanished(&mut self, id: &str, now: DateTime<Utc>) -> Result<(), BotError> {
        let price = self.close_price(id);
        let leverage = self.config.leverage;
        let Some(position) = self.positions.iter_mut().find(|p| p.id == id) else {
            return Ok(());
        };

        let remaining = position.remaining_pct();
        if remaining > Decimal::ZERO {
            position.record_close(remaining)?;
        }
        position.mark(price, leverage);
        let pnl = position.current_pnl;

        tracing::info!(position_id = %id, price = %price, pnl = %pnl, "Position closed on exchange");
        self.events.publish(EngineEvent::PositionClosed(PositionClosed {
            position_id: id.to_string(),
            percentage: remaining,
            remaining: Decimal::ZERO,
            close_price: price,
            pnl,
        }));
        self.events.log(
            LogCategory::Trading,
            LogLevel::Info,
            format!("Position {id} closed on exchange, PnL {}%", pnl.round_dp(2)),
        );
        self.finalize(id, price, now).await
    }

    fn adopt(&mut self, exchange: ExchangePosition, now: DateTime<Utc>) {
        let key = exchange.key();
        let entry_time = exchange
            .opened_at_ms
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or(now);

        let (tp, sl) = protective_prices(
            exchange.direction,
            exchange.entry_price,
            self.config.take_profit_pct,
            self.config.stop_loss_pct,
        );
        let mut position = Position {
            status: PositionStatus::Open,
            take_profit_price: tp.round_dp(PRICE_DECIMALS),
            stop_loss_price: sl.round_dp(PRICE_DECIMALS),
            exchange_key: Some(key.clone()),
            ..Position::pending(key.clone(), exchange.direction, exchange.entry_price, exchange.size, 0, entry_time)
        };
        if self.last_price > Decimal::ZERO {
            position.mark(self.last_price, self.config.leverage);
        }

        tracing::warn!(
            position_id = %key,
            direction = %exchange.direction,
            size = %exchange.size,
            entry = %exchange.entry_price,
            "Adopting position found on exchange"
        );
        self.events.log(
            LogCategory::Trading,
            LogLevel::Warning,
            format!("Adopted {} position {key} from exchange", exchange.direction),
        );
        self.history.push(PositionHistoryEntry::opened(
            &position,
            self.config.strategy,
            "adopted from exchange",
        ));
        self.events.publish(EngineEvent::PositionOpened(position.clone()));
        self.positions.push(position);
    }
}

/// Pull entry price and size from the exchange report into a matched
/// position, marking DCA legs filled as the reported size absorbs them.
fn absorb_report(position: &mut Position, exchange: &ExchangePosition) {
    position.exchange_key = Some(exchange.key());
    position.entry_price = exchange.entry_price;

    let mut excess = exchange.size - position.remaining_size();
    fill_dca_legs(position, &mut excess);

    // `size` stays the original-equivalent so close percentages keep their meaning.
    let remaining_pct = position.remaining_pct();
    if remaining_pct > Decimal::ZERO {
        position.size = floor_size(exchange.size * Decimal::ONE_HUNDRED / remaining_pct);
    }
}

/// Mark pending DCA legs filled in ladder order while `excess` covers them.
fn fill_dca_legs(position: &mut Position, excess: &mut Decimal) {
    for leg in position.dca_legs.iter_mut().filter(|l| !l.executed) {
        if leg.size > *excess + SIZE_TOLERANCE {
            break;
        }
        leg.executed = true;
        *excess -= leg.size;
        tracing::info!(position_id = %position.id, price = %leg.price, size = %leg.size, "DCA leg filled");
    }
}

fn protective_kind_of(client_oid: &str, position_id: &str) -> Option<ProtectiveKind> {
    [
        ProtectiveKind::TakeProfit,
        ProtectiveKind::StopLoss,
        ProtectiveKind::TrailingStop,
    ]
    .into_iter()
    .find(|k| k.tags(client_oid, position_id))
}

// ---- Tests ----
