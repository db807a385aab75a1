use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::config::BotConfig;
use crate::db::HistoryStore;
use crate::errors::BotError;
use crate::events::{EngineEvent, EventBus, LogCategory, LogLevel};
use crate::exchange::Exchange;
use crate::execution::{check_entry, PortfolioSnapshot, PositionLedger, ProfitReserve, RiskLimits};
use crate::indicators::{IndicatorProvider, IndicatorSnapshot};
use crate::intelligence::EntryDecision;
use crate::models::{
    DailyPerformance, EngineStatus, PnlSummary, ReinvestmentStatus, TradeOutcome, TradeStats,
};

/// History entries loaded from the store at startup.
const HISTORY_SEED_LIMIT: i64 = 100;

/// Trades listed in the status snapshot.
const STATUS_TRADES: usize = 10;

// ---------------------------------------------------------------------------
// Commands and handle
// ---------------------------------------------------------------------------

/// Requests accepted by the engine between cycles.
#[derive(Debug)]
pub enum EngineCommand {
    Status(oneshot::Sender<EngineStatus>),
    UpdateConfig(Value, oneshot::Sender<Result<BotConfig, BotError>>),
    ClosePosition {
        id: String,
        percentage: Decimal,
        reply: oneshot::Sender<Result<Decimal, BotError>>,
    },
    UpdateProtection {
        id: String,
        take_profit_pct: Option<Decimal>,
        stop_loss_pct: Option<Decimal>,
        reply: oneshot::Sender<Result<(), BotError>>,
    },
    Stop,
}

/// Caller-side API of a running engine. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    pub async fn status(&self) -> Result<EngineStatus, BotError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Status(reply)).await?;
        rx.await.map_err(|_| stopped())
    }

    /// Deep-merge `patch` into the running config. Returns the new config.
    pub async fn update_config(&self, patch: Value) -> Result<BotConfig, BotError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::UpdateConfig(patch, reply)).await?;
        rx.await.map_err(|_| stopped())?
    }

    /// Close `percentage` percent of a position. Returns the share actually closed.
    pub async fn close_position(&self, id: &str, percentage: Decimal) -> Result<Decimal, BotError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::ClosePosition {
            id: id.to_string(),
            percentage,
            reply,
        })
        .await?;
        rx.await.map_err(|_| stopped())?
    }

    pub async fn update_protection(
        &self,
        id: &str,
        take_profit_pct: Option<Decimal>,
        stop_loss_pct: Option<Decimal>,
    ) -> Result<(), BotError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::UpdateProtection {
            id: id.to_string(),
            take_profit_pct,
            stop_loss_pct,
            reply,
        })
        .await?;
        rx.await.map_err(|_| stopped())?
    }

    /// Ask the engine to stop after the current step. Idempotent.
    pub async fn stop(&self) {
        let _ = self.tx.send(EngineCommand::Stop).await;
    }

    async fn send(&self, command: EngineCommand) -> Result<(), BotError> {
        self.tx.send(command).await.map_err(|_| stopped())
    }
}

fn stopped() -> BotError {
    BotError::InvalidRequest("engine is not running".into())
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct EngineTimings {
    pub slow: Duration,
    pub fast: Duration,
    pub persist: Duration,
}

impl Default for EngineTimings {
    fn default() -> Self {
        Self {
            slow: Duration::from_secs(60),
            fast: Duration::from_secs(15),
            persist: Duration::from_secs(300),
        }
    }
}

/// Single-pair trading actor. One task owns all mutable state and runs
/// each tick or command to completion before taking the next.
pub struct Engine {
    exchange: Arc<dyn Exchange>,
    provider: Arc<dyn IndicatorProvider>,
    store: Option<Arc<dyn HistoryStore>>,
    events: EventBus,
    config: BotConfig,
    timings: EngineTimings,
    ledger: PositionLedger,
    decision: EntryDecision,
    snapshot: Option<IndicatorSnapshot>,
    last_price: Decimal,
    initial_balance: Decimal,
    reserve: ProfitReserve,
    day: DailyPerformance,
    persisted_closed: HashSet<String>,
    started_at: DateTime<Utc>,
    running: bool,
}

impl Engine {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        provider: Arc<dyn IndicatorProvider>,
        store: Option<Arc<dyn HistoryStore>>,
        events: EventBus,
        config: BotConfig,
        timings: EngineTimings,
    ) -> Self {
        let now = Utc::now();
        let ledger = PositionLedger::new(Arc::clone(&exchange), config.clone(), events.clone());
        Self {
            exchange,
            provider,
            store,
            events,
            config,
            timings,
            ledger,
            decision: EntryDecision::new(),
            snapshot: None,
            last_price: Decimal::ZERO,
            initial_balance: Decimal::ZERO,
            reserve: ProfitReserve::default(),
            day: DailyPerformance::new(now.date_naive(), Decimal::ZERO),
            persisted_closed: HashSet::new(),
            started_at: now,
            running: false,
        }
    }

    /// Run the engine on its own task.
    pub fn spawn(self) -> (EngineHandle, JoinHandle<Result<(), BotError>>) {
        let (tx, rx) = mpsc::channel(32);
        let task = tokio::spawn(self.run(rx));
        (EngineHandle { tx }, task)
    }

    pub fn ledger(&self) -> &PositionLedger {
        &self.ledger
    }

    pub fn day(&self) -> &DailyPerformance {
        &self.day
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Main loop. Returns `Err` only for fatal (authentication) failures.
    pub async fn run(mut self, mut commands: mpsc::Receiver<EngineCommand>) -> Result<(), BotError> {
        self.start(Utc::now()).await?;

        let mut slow = interval(self.timings.slow);
        let mut fast = interval(self.timings.fast);
        let mut persist = interval(self.timings.persist);
        for timer in [&mut slow, &mut fast, &mut persist] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
        // startup already refreshed everything
        slow.tick().await;
        fast.tick().await;
        persist.tick().await;

        let result = loop {
            let outcome = tokio::select! {
                _ = slow.tick() => self.slow_cycle(Utc::now()).await,
                _ = fast.tick() => self.fast_cycle(Utc::now()).await,
                _ = persist.tick() => {
                    self.persist().await;
                    Ok(())
                }
                command = commands.recv() => match command {
                    Some(EngineCommand::Stop) | None => break Ok(()),
                    Some(command) => self.handle(command, Utc::now()).await,
                },
            };
            if let Err(e) = outcome {
                break Err(e);
            }
        };

        self.running = false;
        self.persist().await;
        match &result {
            Ok(()) => {
                tracing::info!("Engine stopped");
                self.events.log(LogCategory::System, LogLevel::Info, "Engine stopped");
            }
            Err(e) => {
                tracing::error!(error = %e, "Engine halted on fatal error");
                self.events.log(LogCategory::System, LogLevel::Error, format!("Engine halted: {e}"));
            }
        }
        result
    }

    // -----------------------------------------------------------------------
    // Startup
    // -----------------------------------------------------------------------

    pub async fn start(&mut self, now: DateTime<Utc>) -> Result<(), BotError> {
        tracing::info!(symbol = %self.config.symbol, strategy = self.config.strategy.as_str(), "Starting engine");

        if let Some(server_ms) = tolerate(&self.events, "server time", self.exchange.server_time().await)? {
            tracing::info!(server_ms, drift_ms = now.timestamp_millis() - server_ms, "Exchange server time");
        }

        if let Some(balance) = tolerate(&self.events, "balance", self.exchange.account_balance().await)? {
            self.ledger.set_balance(balance);
            self.initial_balance = balance;
            self.day = DailyPerformance::new(now.date_naive(), balance);
            gauge!("account_balance").set(balance.to_f64().unwrap_or_default());
        }

        if let Some(listed) = tolerate(&self.events, "symbols", self.exchange.symbols().await)? {
            if listed.iter().any(|s| s.eq_ignore_ascii_case(&self.config.symbol)) {
                tracing::debug!(symbol = %self.config.symbol, contracts = listed.len(), "Symbol is listed");
            } else {
                tracing::warn!(symbol = %self.config.symbol, "Symbol not listed among USDT futures contracts");
                self.events.log(
                    LogCategory::System,
                    LogLevel::Warning,
                    format!("Symbol {} is not listed on the exchange", self.config.symbol),
                );
            }
        }

        match self.exchange.set_leverage(self.config.leverage).await {
            Ok(()) => tracing::info!(leverage = self.config.leverage, "Leverage set"),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tracing::warn!(error = %e, leverage = self.config.leverage, "Failed to set leverage");
                self.events.log(LogCategory::System, LogLevel::Warning, format!("Failed to set leverage: {e}"));
            }
        }

        if let Some(store) = &self.store {
            match store.load_history(HISTORY_SEED_LIMIT).await {
                Ok(entries) => {
                    tracing::info!(count = entries.len(), "Loaded trade history");
                    self.persisted_closed
                        .extend(entries.iter().filter(|e| e.is_closed()).map(|e| e.id.clone()));
                    self.ledger.seed_history(entries);
                }
                Err(e) => tracing::warn!(error = %e, "Failed to load trade history"),
            }
            match store.load_performance(self.day.date).await {
                Ok(Some(day)) => {
                    // keep today's counters and day-start balance across restarts
                    self.day = DailyPerformance {
                        end_balance: self.ledger.balance(),
                        ..day
                    };
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "Failed to load daily performance"),
            }
        }

        self.refresh_price().await?;
        self.reconcile(now).await?;
        self.refresh_indicators(now).await?;

        self.running = true;
        self.started_at = now;
        self.events.log(
            LogCategory::System,
            LogLevel::Success,
            format!("Engine started on {} with balance {}", self.config.symbol, self.ledger.balance()),
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Cycles
    // -----------------------------------------------------------------------

    /// Data refresh, reconcile, protective maintenance, duration check,
    /// risk gate, decision and dispatch, in that order.
    pub async fn slow_cycle(&mut self, now: DateTime<Utc>) -> Result<(), BotError> {
        let started = Instant::now();

        self.roll_day(now).await;
        self.refresh_price().await?;
        self.refresh_indicators(now).await?;
        if let Some(balance) = tolerate(&self.events, "balance", self.exchange.account_balance().await)? {
            let tradable = self.reserve.tradable(balance);
            self.ledger.set_balance(tradable);
            self.day.end_balance = tradable;
            gauge!("account_balance").set(balance.to_f64().unwrap_or_default());
        }
        self.check_profit_withdrawal(now);

        self.reconcile(now).await?;

        let price = self.last_price;
        if price > Decimal::ZERO {
            tolerate(&self.events, "partial close", self.ledger.check_partial_close_targets(price, now).await)?;
            tolerate(&self.events, "trailing stop", self.ledger.update_trailing_stops(price, now).await)?;
        }
        tolerate(&self.events, "duration check", self.ledger.check_position_duration(now).await)?;

        self.try_entry(now).await?;

        for entry in self.ledger.drain_closed() {
            self.day.record(&entry);
        }

        histogram!("slow_cycle_seconds").record(started.elapsed().as_secs_f64());
        Ok(())
    }

    /// Price refresh and trailing-stop maintenance between slow cycles.
    pub async fn fast_cycle(&mut self, now: DateTime<Utc>) -> Result<(), BotError> {
        self.refresh_price().await?;
        let price = self.last_price;
        if price > Decimal::ZERO {
            tolerate(&self.events, "trailing stop", self.ledger.update_trailing_stops(price, now).await)?;
        }
        for entry in self.ledger.drain_closed() {
            self.day.record(&entry);
        }
        Ok(())
    }

    /// Flush history and today's performance. Storage failures are never fatal.
    pub async fn persist(&mut self) {
        let Some(store) = &self.store else {
            tracing::debug!("No history store configured, skipping persistence");
            return;
        };

        let pending: Vec<_> = self
            .ledger
            .history()
            .iter()
            .filter(|e| !self.persisted_closed.contains(&e.id))
            .cloned()
            .collect();
        match store.save_history(&pending).await {
            Ok(()) => {
                self.persisted_closed
                    .extend(pending.iter().filter(|e| e.is_closed()).map(|e| e.id.clone()));
                tracing::debug!(count = pending.len(), "Trade history persisted");
            }
            Err(e) => tracing::warn!(error = %e, "Failed to persist trade history"),
        }

        if let Err(e) = store.save_performance(&self.day).await {
            tracing::warn!(error = %e, date = %self.day.date, "Failed to persist daily performance");
        }
    }

    async fn refresh_price(&mut self) -> Result<(), BotError> {
        if let Some(ticker) = tolerate(&self.events, "ticker", self.exchange.ticker().await)? {
            let price = ticker.data.last;
            if price > Decimal::ZERO {
                self.last_price = price;
                self.ledger.mark_price(price);
                gauge!("last_price").set(price.to_f64().unwrap_or_default());
            }
        }
        Ok(())
    }

    /// Rebuild the snapshot from fresh candles. Any failure leaves no
    /// snapshot, so entries wait for the next successful cycle.
    async fn refresh_indicators(&mut self, now: DateTime<Utc>) -> Result<(), BotError> {
        let fetched = self
            .exchange
            .candles(&self.config.timeframe, self.config.candle_limit)
            .await;
        let Some(candles) = tolerate(&self.events, "candles", fetched)? else {
            self.snapshot = None;
            return Ok(());
        };

        let computed = self.provider.compute(&candles, &self.config.indicators, now);
        self.snapshot = tolerate(&self.events, "indicators", computed)?.map(|snapshot| {
            match self.last_price.to_f64() {
                Some(price) if price > 0.0 => snapshot.repriced(price, &self.config.indicators),
                _ => snapshot,
            }
        });
        Ok(())
    }

    async fn reconcile(&mut self, now: DateTime<Utc>) -> Result<(), BotError> {
        if let Some(report) = tolerate(&self.events, "positions", self.exchange.open_positions().await)? {
            tolerate(&self.events, "reconcile", self.ledger.reconcile(&report, now).await)?;
        }
        Ok(())
    }

    /// Risk gate, then decision, then dispatch.
    async fn try_entry(&mut self, now: DateTime<Utc>) -> Result<(), BotError> {
        let portfolio = PortfolioSnapshot {
            day_start_balance: self.day.start_balance,
            current_balance: self.ledger.balance(),
            open_positions: self.ledger.open_count(),
        };
        if let Err(violation) = check_entry(&portfolio, &RiskLimits::from(&self.config.risk)) {
            tracing::info!(violation = %violation, "Entry blocked by risk gate");
            counter!("entries_blocked_total").increment(1);
            return Ok(());
        }

        let Some(snapshot) = &self.snapshot else {
            return Ok(());
        };
        let Some(signal) = self.decision.evaluate(
            snapshot,
            &self.config.entry,
            &self.config.indicators,
            now,
        ) else {
            return Ok(());
        };

        counter!("signals_emitted_total").increment(1);
        tracing::info!(
            direction = %signal.direction,
            confidence = signal.confidence,
            reasons = %signal.summary(),
            "Entry signal"
        );
        self.events.log(
            LogCategory::Indicators,
            LogLevel::Info,
            format!("{} signal, confidence {}%", signal.direction, signal.confidence),
        );

        if self.last_price <= Decimal::ZERO {
            tracing::warn!("No price available, signal dropped");
            return Ok(());
        }
        let opened = self
            .ledger
            .open_position(signal.direction, self.last_price, &signal.summary(), signal.confidence, now)
            .await;
        tolerate(&self.events, "open position", opened)?;
        Ok(())
    }

    /// Persist the finished day and start a new record at the date boundary.
    /// Set aside a share of the profit once it passes the threshold. The
    /// reserved amount stops counting toward the tradable balance.
    fn check_profit_withdrawal(&mut self, now: DateTime<Utc>) {
        let balance = self.ledger.balance();
        let Some(amount) = self
            .reserve
            .check(&self.config.reinvestment, self.initial_balance, balance, now)
        else {
            return;
        };

        let tradable = balance - amount;
        self.ledger.set_balance(tradable);
        // a withdrawal is not a trading loss
        self.day.start_balance -= amount;
        self.day.end_balance = tradable;

        tracing::info!(
            amount = %amount,
            total = %self.reserve.total_withdrawn,
            tradable = %tradable,
            "Profit withdrawal threshold reached"
        );
        counter!("profit_withdrawals_total").increment(1);
        gauge!("profit_reserved").set(self.reserve.total_withdrawn.to_f64().unwrap_or_default());
        self.events.log(
            LogCategory::Trading,
            LogLevel::Success,
            format!(
                "Reserved {}% of profit: {} USDT, {} USDT reserved in total",
                self.config.reinvestment.withdrawal_pct,
                amount.round_dp(2),
                self.reserve.total_withdrawn.round_dp(2)
            ),
        );
    }

    async fn roll_day(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today == self.day.date {
            return;
        }
        let finished = std::mem::replace(&mut self.day, DailyPerformance::new(today, self.ledger.balance()));
        tracing::info!(
            date = %finished.date,
            trades = finished.trades,
            profit_pct = %finished.profit_pct(),
            "Daily performance rolled over"
        );
        if let Some(store) = &self.store {
            if let Err(e) = store.save_performance(&finished).await {
                tracing::warn!(error = %e, date = %finished.date, "Failed to persist finished day");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    async fn handle(&mut self, command: EngineCommand, now: DateTime<Utc>) -> Result<(), BotError> {
        match command {
            EngineCommand::Status(reply) => {
                let status = self.status(now);
                self.events.publish(EngineEvent::Status(Box::new(status.clone())));
                let _ = reply.send(status);
            }
            EngineCommand::UpdateConfig(patch, reply) => {
                let result = self.apply_config(&patch).await;
                let fatal = match &result {
                    Err(e) if e.is_fatal() => Some(e.clone()),
                    _ => None,
                };
                let _ = reply.send(result);
                if let Some(e) = fatal {
                    return Err(e);
                }
            }
            EngineCommand::ClosePosition { id, percentage, reply } => {
                let result = self.ledger.close_position(&id, percentage, "manual close", now).await;
                for entry in self.ledger.drain_closed() {
                    self.day.record(&entry);
                }
                let fatal = result.as_ref().err().filter(|e| e.is_fatal()).cloned();
                let _ = reply.send(result);
                if let Some(e) = fatal {
                    return Err(e);
                }
            }
            EngineCommand::UpdateProtection { id, take_profit_pct, stop_loss_pct, reply } => {
                let result = self
                    .ledger
                    .update_protection(&id, take_profit_pct, stop_loss_pct, now)
                    .await;
                let fatal = result.as_ref().err().filter(|e| e.is_fatal()).cloned();
                let _ = reply.send(result);
                if let Some(e) = fatal {
                    return Err(e);
                }
            }
            EngineCommand::Stop => {}
        }
        Ok(())
    }

    async fn apply_config(&mut self, patch: &Value) -> Result<BotConfig, BotError> {
        let mut next = self.config.clone();
        next.merge(patch)
            .map_err(|e| BotError::InvalidRequest(e.to_string()))?;
        if next.symbol != self.config.symbol {
            return Err(BotError::InvalidRequest("symbol cannot change while running".into()));
        }

        let leverage_changed = next.leverage != self.config.leverage;
        self.config = next.clone();
        self.ledger.update_config(next.clone());
        tracing::info!(patch = %patch, "Config updated");
        self.events.log(LogCategory::System, LogLevel::Info, "Configuration updated");

        if leverage_changed {
            match self.exchange.set_leverage(next.leverage).await {
                Ok(()) => tracing::info!(leverage = next.leverage, "Leverage updated on exchange"),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!(error = %e, leverage = next.leverage, "Failed to push leverage change");
                    self.events.log(LogCategory::System, LogLevel::Warning, format!("Failed to set leverage: {e}"));
                }
            }
        }
        Ok(next)
    }

    pub fn status(&self, now: DateTime<Utc>) -> EngineStatus {
        let balance = self.ledger.balance();
        let closed: Vec<_> = self.ledger.history().iter().filter(|e| e.is_closed()).collect();
        let wins = closed.iter().filter(|e| e.result == Some(TradeOutcome::Win)).count();
        let win_rate = if closed.is_empty() {
            Decimal::ZERO
        } else {
            (Decimal::from(wins) / Decimal::from(closed.len()) * Decimal::ONE_HUNDRED).round_dp(2)
        };

        EngineStatus {
            running: self.running,
            symbol: self.config.symbol.clone(),
            balance,
            current_price: self.last_price,
            pnl: PnlSummary {
                daily: change_pct(self.day.start_balance, balance),
                total: change_pct(self.initial_balance, balance),
            },
            open_positions: self.ledger.positions().to_vec(),
            last_trades: self.ledger.recent_history(STATUS_TRADES),
            indicators: self.snapshot.clone(),
            stats: TradeStats {
                win_rate,
                total_trades: closed.len(),
            },
            reinvestment: ReinvestmentStatus {
                enabled: self.config.reinvestment.enabled,
                withdrawal_pct: self.config.reinvestment.withdrawal_pct,
                withdrawal_threshold_pct: self.config.reinvestment.withdrawal_threshold_pct,
                total_withdrawn: self.reserve.total_withdrawn,
                last_withdrawal: self.reserve.last_withdrawal,
            },
            started_at: self.started_at,
            uptime_secs: (now - self.started_at).num_seconds(),
        }
    }
}

fn change_pct(from: Decimal, to: Decimal) -> Decimal {
    if from <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    ((to - from) / from * Decimal::ONE_HUNDRED).round_dp(2)
}

/// Per-step error boundary: fatal errors propagate, everything else is
/// logged and the step yields nothing.
fn tolerate<T>(events: &EventBus, step: &'static str, result: Result<T, BotError>) -> Result<Option<T>, BotError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            tracing::warn!(step, kind = e.kind(), error = %e, "Engine step failed");
            counter!("engine_step_errors_total", "step" => step, "kind" => e.kind()).increment(1);
            events.log(LogCategory::System, LogLevel::Error, format!("{step} failed: {e}"));
            Ok(None)
        }
    }
}
