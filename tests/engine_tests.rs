mod common;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::json;

use common::{pullback_long_snapshot, FixedProvider, MockExchange};
use perpbot::config::{BotConfig, StrategyKind};
use perpbot::db::HistoryStore;
use perpbot::errors::BotError;
use perpbot::events::{EngineEvent, EventBus, LogLevel};
use perpbot::exchange::{Exchange, ExchangePosition};
use perpbot::models::{DailyPerformance, Direction, Position, PositionHistoryEntry};
use perpbot::services::{Engine, EngineTimings};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

fn price() -> Decimal {
    Decimal::new(1001, 1)
}

fn idle_timings() -> EngineTimings {
    let hour = tokio::time::Duration::from_secs(3600);
    EngineTimings {
        slow: hour,
        fast: hour,
        persist: hour,
    }
}

fn engine_with(exchange: &Arc<MockExchange>, store: Option<Arc<dyn HistoryStore>>) -> (Engine, EventBus) {
    let events = EventBus::default();
    let dyn_exchange: Arc<dyn Exchange> = exchange.clone();
    let engine = Engine::new(
        dyn_exchange,
        Arc::new(FixedProvider(pullback_long_snapshot())),
        store,
        events.clone(),
        BotConfig::default(),
        idle_timings(),
    );
    (engine, events)
}

fn engine(exchange: &Arc<MockExchange>) -> (Engine, EventBus) {
    engine_with(exchange, None)
}

fn filling_exchange() -> Arc<MockExchange> {
    let exchange = MockExchange::new(1000, price());
    exchange.state().simulate_fills = true;
    exchange
}

#[derive(Default)]
struct MemoryStore {
    saved: Mutex<Vec<PositionHistoryEntry>>,
    days: Mutex<Vec<DailyPerformance>>,
    seed: Vec<PositionHistoryEntry>,
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn save_history(&self, entries: &[PositionHistoryEntry]) -> anyhow::Result<()> {
        self.saved.lock().unwrap().extend_from_slice(entries);
        Ok(())
    }

    async fn save_performance(&self, day: &DailyPerformance) -> anyhow::Result<()> {
        self.days.lock().unwrap().push(day.clone());
        Ok(())
    }

    async fn load_history(&self, _limit: i64) -> anyhow::Result<Vec<PositionHistoryEntry>> {
        Ok(self.seed.clone())
    }

    async fn load_performance(&self, _date: NaiveDate) -> anyhow::Result<Option<DailyPerformance>> {
        Ok(None)
    }
}

// ---- Startup ----

#[tokio::test]
async fn test_start_sets_leverage_and_balance() {
    let exchange = MockExchange::new(1000, price());
    let (mut engine, _events) = engine(&exchange);

    engine.start(t0()).await.unwrap();

    assert!(engine.is_running());
    assert_eq!(exchange.state().leverage_calls, vec![5]);
    assert_eq!(engine.ledger().balance(), Decimal::from(1000));
    assert_eq!(engine.day().start_balance, Decimal::from(1000));

    let status = engine.status(t0() + Duration::seconds(90));
    assert!(status.running);
    assert_eq!(status.symbol, "XRPUSDT");
    assert_eq!(status.current_price, price());
    assert_eq!(status.uptime_secs, 90);
    assert!(status.indicators.is_some());
    assert_eq!(status.stats.total_trades, 0);
}

#[tokio::test]
async fn test_start_tolerates_leverage_rejection() {
    let exchange = MockExchange::new(1000, price());
    exchange.fail(
        "set_leverage",
        BotError::Exchange {
            code: "40797".into(),
            message: "leverage exceeds limit".into(),
        },
    );
    let (mut engine, events) = engine(&exchange);
    let mut rx = events.subscribe();

    engine.start(t0()).await.unwrap();

    assert!(engine.is_running());
    let warned = common::drain(&mut rx)
        .into_iter()
        .any(|e| matches!(e, EngineEvent::LogUpdate(log) if log.level == LogLevel::Warning));
    assert!(warned);
}

#[tokio::test]
async fn test_start_warns_on_unlisted_symbol() {
    let exchange = MockExchange::new(1000, price());
    exchange.state().listed = vec!["BTCUSDT".into(), "ETHUSDT".into()];
    let (mut engine, events) = engine(&exchange);
    let mut rx = events.subscribe();

    engine.start(t0()).await.unwrap();

    assert!(engine.is_running());
    let warned = common::drain(&mut rx).into_iter().any(|e| {
        matches!(e, EngineEvent::LogUpdate(log)
            if log.level == LogLevel::Warning && log.message.contains("XRPUSDT is not listed"))
    });
    assert!(warned);
}

#[tokio::test]
async fn test_start_adopts_existing_exchange_position() {
    let exchange = MockExchange::new(1000, price());
    exchange.state().positions.push(ExchangePosition {
        direction: Direction::Short,
        size: Decimal::from(30),
        entry_price: Decimal::from(100),
        margin: Decimal::ZERO,
        unrealized_pnl: Decimal::ZERO,
        leverage: Some(5),
        opened_at_ms: Some(t0().timestamp_millis()),
        pos_id: Some("p-7".into()),
    });
    let (mut engine, _events) = engine(&exchange);

    engine.start(t0()).await.unwrap();

    let positions = engine.ledger().positions();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].id, "p-7");
    assert_eq!(positions[0].direction, Direction::Short);
}

// ---- Slow cycle ----

#[tokio::test]
async fn test_slow_cycle_opens_on_signal_once() {
    let exchange = filling_exchange();
    let (mut engine, _events) = engine(&exchange);
    engine.start(t0()).await.unwrap();

    engine.slow_cycle(t0() + Duration::minutes(1)).await.unwrap();
    assert_eq!(engine.ledger().open_count(), 1);
    assert_eq!(exchange.market_orders().len(), 1);

    let position = &engine.ledger().positions()[0];
    assert_eq!(position.direction, Direction::Long);
    assert_eq!(position.entry_price, price());
    assert!(position.confidence_level > 0);

    // Position limit reached: the second cycle keeps the one position.
    engine.slow_cycle(t0() + Duration::minutes(2)).await.unwrap();
    assert_eq!(engine.ledger().open_count(), 1);
    assert_eq!(exchange.market_orders().len(), 1);
    assert_eq!(
        engine.ledger().positions()[0].exchange_key.as_deref(),
        Some("pos-long")
    );
}

#[tokio::test]
async fn test_daily_loss_blocks_entry_but_not_exits() {
    let exchange = filling_exchange();
    let (mut engine, _events) = engine(&exchange);
    engine.start(t0()).await.unwrap();
    engine.slow_cycle(t0() + Duration::minutes(1)).await.unwrap();
    assert_eq!(engine.ledger().open_count(), 1);

    // 12% below the day-start balance.
    exchange.state().balance = Decimal::from(880);
    engine.slow_cycle(t0() + Duration::minutes(4)).await.unwrap();

    assert_eq!(engine.ledger().open_count(), 0);
    let market = exchange.market_orders();
    assert_eq!(market.len(), 2);
    assert!(market[1].reduce_only);
    assert_eq!(engine.day().trades, 1);
    assert_eq!(engine.status(t0() + Duration::minutes(4)).pnl.daily, Decimal::from(-12));
}

#[tokio::test]
async fn test_profit_withdrawal_shrinks_tradable_balance_once_per_day() {
    let exchange = filling_exchange();
    let (mut engine, _events) = engine(&exchange);
    engine.start(t0()).await.unwrap();

    // 60% over the starting balance of 1000; 20% of the 600 profit is reserved.
    exchange.state().balance = Decimal::from(1600);
    let first = t0() + Duration::minutes(1);
    engine.slow_cycle(first).await.unwrap();

    assert_eq!(engine.ledger().balance(), Decimal::from(1480));
    assert_eq!(exchange.market_orders()[0].size, Decimal::from(74));
    let status = engine.status(first);
    assert!(status.reinvestment.enabled);
    assert_eq!(status.reinvestment.total_withdrawn, Decimal::from(120));
    assert_eq!(status.reinvestment.last_withdrawal, Some(first));
    assert_eq!(status.balance, Decimal::from(1480));

    // Still past the threshold, but the last withdrawal is under a day old.
    exchange.state().balance = Decimal::from(2000);
    engine.slow_cycle(t0() + Duration::hours(2)).await.unwrap();
    assert_eq!(engine.ledger().balance(), Decimal::from(1880));
    assert_eq!(engine.status(t0() + Duration::hours(2)).reinvestment.total_withdrawn, Decimal::from(120));

    // Next day: 20% of the 880 profit on the tradable balance.
    engine.slow_cycle(t0() + Duration::days(1) + Duration::minutes(2)).await.unwrap();
    assert_eq!(engine.ledger().balance(), Decimal::from(1704));
    let status = engine.status(t0() + Duration::days(1) + Duration::minutes(2));
    assert_eq!(status.reinvestment.total_withdrawn, Decimal::from(296));
}

#[tokio::test]
async fn test_disabled_profit_withdrawal_keeps_full_balance() {
    let exchange = MockExchange::new(1000, price());
    let mut config = BotConfig::default();
    config.reinvestment.enabled = false;
    let mut engine = Engine::new(
        exchange.clone(),
        Arc::new(FixedProvider(pullback_long_snapshot())),
        None,
        EventBus::default(),
        config,
        idle_timings(),
    );
    engine.start(t0()).await.unwrap();

    exchange.state().balance = Decimal::from(3000);
    engine.slow_cycle(t0() + Duration::minutes(1)).await.unwrap();

    assert_eq!(engine.ledger().balance(), Decimal::from(3000));
    let status = engine.status(t0() + Duration::minutes(1));
    assert!(!status.reinvestment.enabled);
    assert!(status.reinvestment.total_withdrawn.is_zero());
    assert_eq!(status.reinvestment.last_withdrawal, None);
}

#[tokio::test]
async fn test_auth_failure_halts_cycle() {
    let exchange = MockExchange::new(1000, price());
    let (mut engine, _events) = engine(&exchange);
    engine.start(t0()).await.unwrap();

    exchange.fail("ticker", BotError::Auth("40009: sign signature error".into()));
    let err = engine.slow_cycle(t0() + Duration::minutes(1)).await.unwrap_err();

    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_transient_failure_is_logged_and_skipped() {
    let exchange = MockExchange::new(1000, price());
    let (mut engine, events) = engine(&exchange);
    engine.start(t0()).await.unwrap();
    let mut rx = events.subscribe();

    exchange.fail("candles", BotError::Network("timeout".into()));
    engine.slow_cycle(t0() + Duration::minutes(1)).await.unwrap();

    let errors: Vec<String> = common::drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            EngineEvent::LogUpdate(log) if log.level == LogLevel::Error => Some(log.message),
            _ => None,
        })
        .collect();
    assert!(errors.iter().any(|m| m.starts_with("candles failed")));
}

#[tokio::test]
async fn test_failed_indicator_refresh_blocks_entry() {
    let exchange = filling_exchange();
    let (mut engine, _events) = engine(&exchange);
    engine.start(t0()).await.unwrap();
    assert!(engine.status(t0()).indicators.is_some());

    exchange.fail("candles", BotError::Network("timeout".into()));
    engine.slow_cycle(t0() + Duration::minutes(1)).await.unwrap();

    assert_eq!(engine.ledger().open_count(), 0);
    assert!(exchange.market_orders().is_empty());
    assert!(engine.status(t0() + Duration::minutes(1)).indicators.is_none());

    exchange.recover("candles");
    engine.slow_cycle(t0() + Duration::minutes(2)).await.unwrap();
    assert_eq!(engine.ledger().open_count(), 1);
}

#[tokio::test]
async fn test_fast_cycle_moves_trailing_stop() {
    let exchange = filling_exchange();
    let (mut engine, _events) = engine(&exchange);
    engine.start(t0()).await.unwrap();
    engine.slow_cycle(t0() + Duration::minutes(1)).await.unwrap();

    // +0.1% move at 5x is 0.5% PnL, past the 0.1% activation.
    exchange.set_price(Decimal::new(100_2001, 4));
    engine.fast_cycle(t0() + Duration::seconds(75)).await.unwrap();

    let position = &engine.ledger().positions()[0];
    assert!(position.trailing_stop_active);
    assert!(position.trailing_stop_price.is_some());
}

// ---- Persistence ----

#[tokio::test]
async fn test_persist_flushes_history_once_closed() {
    let exchange = filling_exchange();
    let mut old = PositionHistoryEntry::opened(
        &Position::pending("old-1".into(), Direction::Short, Decimal::from(99), Decimal::ONE, 55, t0() - Duration::days(1)),
        StrategyKind::Scalping,
        "earlier run",
    );
    old.close(Decimal::from(98), t0() - Duration::days(1), Decimal::from(5), Decimal::ONE_HUNDRED);
    let store = Arc::new(MemoryStore {
        seed: vec![old],
        ..MemoryStore::default()
    });
    let (mut engine, _events) = engine_with(&exchange, Some(store.clone() as Arc<dyn HistoryStore>));

    engine.start(t0()).await.unwrap();
    assert_eq!(engine.ledger().history().len(), 1);

    engine.slow_cycle(t0() + Duration::minutes(1)).await.unwrap();
    engine.persist().await;
    let saved: Vec<String> = store.saved.lock().unwrap().iter().map(|e| e.id.clone()).collect();
    assert_eq!(saved.len(), 1);
    assert_ne!(saved[0], "old-1");

    // Closed by the duration limit; persisted once more, then never again.
    engine.slow_cycle(t0() + Duration::minutes(4)).await.unwrap();
    engine.persist().await;
    engine.persist().await;
    let saved = store.saved.lock().unwrap();
    assert_eq!(saved.len(), 2);
    assert!(saved[1].is_closed());
    drop(saved);

    let days = store.days.lock().unwrap();
    assert_eq!(days.last().unwrap().trades, 1);
}

// ---- Actor and commands ----

#[tokio::test]
async fn test_spawned_engine_halts_on_auth_failure() {
    let exchange = MockExchange::new(1000, price());
    exchange.fail("server_time", BotError::Auth("40037: Apikey does not exist".into()));
    let (engine, _events) = engine(&exchange);

    let (handle, task) = engine.spawn();
    let result = task.await.unwrap();

    assert!(matches!(result, Err(BotError::Auth(_))));
    assert!(handle.status().await.is_err());
}

#[tokio::test]
async fn test_commands_update_config() {
    let exchange = MockExchange::new(1000, price());
    let (engine, _events) = engine(&exchange);
    let (handle, task) = engine.spawn();

    let config = handle.update_config(json!({ "leverage": 10 })).await.unwrap();
    assert_eq!(config.leverage, 10);
    assert_eq!(exchange.state().leverage_calls, vec![5, 10]);

    let config = handle
        .update_config(json!({ "trailing_stop": { "stop_distance_pct": "0.1" } }))
        .await
        .unwrap();
    assert_eq!(config.trailing_stop.stop_distance_pct, Decimal::new(1, 1));
    assert!(config.trailing_stop.enabled);

    let err = handle.update_config(json!({ "leverage": 0 })).await.unwrap_err();
    assert!(matches!(err, BotError::InvalidRequest(_)));

    let err = handle.update_config(json!({ "symbol": "BTCUSDT" })).await.unwrap_err();
    assert!(matches!(err, BotError::InvalidRequest(_)));

    let status = handle.status().await.unwrap();
    assert!(status.running);

    handle.stop().await;
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_manual_close_and_protection_via_handle() {
    let exchange = MockExchange::new(1000, Decimal::from(100));
    exchange.state().positions.push(ExchangePosition {
        direction: Direction::Long,
        size: Decimal::from(20),
        entry_price: Decimal::from(100),
        margin: Decimal::ZERO,
        unrealized_pnl: Decimal::ZERO,
        leverage: Some(5),
        opened_at_ms: Some(Utc::now().timestamp_millis()),
        pos_id: Some("p-7".into()),
    });
    let (engine, _events) = engine(&exchange);
    let (handle, task) = engine.spawn();

    handle
        .update_protection("p-7", Some(Decimal::new(5, 1)), None)
        .await
        .unwrap();
    let status = handle.status().await.unwrap();
    assert_eq!(status.open_positions[0].take_profit_price, Decimal::new(1005, 1));

    let err = handle.close_position("p-7", Decimal::from(150)).await.unwrap_err();
    assert!(matches!(err, BotError::InvalidRequest(_)));

    let closed = handle.close_position("p-7", Decimal::ONE_HUNDRED).await.unwrap();
    assert_eq!(closed, Decimal::ONE_HUNDRED);

    let status = handle.status().await.unwrap();
    assert!(status.open_positions.is_empty());
    assert_eq!(status.stats.total_trades, 1);
    assert_eq!(status.last_trades[0].id, "p-7");

    handle.stop().await;
    assert!(task.await.unwrap().is_ok());
}
