use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use perpbot::config::{BotConfig, IndicatorSettings};
use perpbot::errors::BotError;
use perpbot::events::{EngineEvent, EventBus};
use perpbot::exchange::{
    Candle, Exchange, ExchangePosition, OpenPlanOrder, OrderRequest, OrderType, PlacedOrder,
    PlanOrderRequest, TickerData, TickerResponse,
};
use perpbot::execution::PositionLedger;
use perpbot::indicators::{ChannelReading, EmaReading, IndicatorProvider, IndicatorSnapshot};
use perpbot::models::{Direction, OrderSide};

/// Everything the mock exchange has seen and will report.
#[derive(Debug, Default)]
pub struct MockState {
    pub balance: Decimal,
    pub price: Decimal,
    pub candles: Vec<Candle>,
    pub positions: Vec<ExchangePosition>,
    pub plan_orders: Vec<OpenPlanOrder>,
    pub orders: Vec<OrderRequest>,
    pub plan_requests: Vec<PlanOrderRequest>,
    pub cancelled_orders: Vec<String>,
    pub cancelled_plans: Vec<String>,
    pub leverage_calls: Vec<u32>,
    /// Contracts listed by `symbols`.
    pub listed: Vec<String>,
    /// Method name -> error returned on every call until removed.
    pub failures: HashMap<&'static str, BotError>,
    /// When false, market orders do not change `positions`.
    pub simulate_fills: bool,
    next_id: u64,
}

/// In-memory exchange. Market orders move the reported position when
/// `simulate_fills` is on; plan orders rest until cancelled.
#[derive(Debug, Default)]
pub struct MockExchange {
    state: Mutex<MockState>,
}

#[allow(dead_code)]
impl MockExchange {
    pub fn new(balance: i64, price: Decimal) -> Arc<Self> {
        let exchange = Self::default();
        {
            let mut state = exchange.state();
            state.balance = Decimal::from(balance);
            state.price = price;
            state.candles = flat_candles(60, 100.0);
            state.listed = vec!["XRPUSDT".into()];
        }
        Arc::new(exchange)
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn fail(&self, method: &'static str, error: BotError) {
        self.state().failures.insert(method, error);
    }

    pub fn recover(&self, method: &'static str) {
        self.state().failures.remove(method);
    }

    pub fn set_price(&self, price: Decimal) {
        self.state().price = price;
    }

    pub fn market_orders(&self) -> Vec<OrderRequest> {
        self.state()
            .orders
            .iter()
            .filter(|o| o.order_type == OrderType::Market)
            .cloned()
            .collect()
    }

    pub fn limit_orders(&self) -> Vec<OrderRequest> {
        self.state()
            .orders
            .iter()
            .filter(|o| matches!(o.order_type, OrderType::Limit { .. }))
            .cloned()
            .collect()
    }

    fn check(&self, method: &'static str) -> Result<(), BotError> {
        match self.state().failures.get(method) {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn next_id(state: &mut MockState) -> String {
        state.next_id += 1;
        format!("{}", 1000 + state.next_id)
    }
}

fn fill(state: &mut MockState, order: &OrderRequest) {
    let direction = match (order.side, order.reduce_only) {
        (OrderSide::Buy, false) | (OrderSide::Sell, true) => Direction::Long,
        (OrderSide::Sell, false) | (OrderSide::Buy, true) => Direction::Short,
    };
    let price = state.price;
    let existing = state.positions.iter_mut().find(|p| p.direction == direction);

    match (existing, order.reduce_only) {
        (Some(position), false) => position.size += order.size,
        (None, false) => state.positions.push(ExchangePosition {
            direction,
            size: order.size,
            entry_price: price,
            margin: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            leverage: None,
            opened_at_ms: Some(Utc::now().timestamp_millis()),
            pos_id: Some(format!("pos-{}", direction.as_hold_side())),
        }),
        (Some(position), true) => position.size -= order.size,
        (None, true) => {}
    }
    state.positions.retain(|p| p.size > Decimal::ZERO);
}

#[async_trait]
impl Exchange for MockExchange {
    async fn server_time(&self) -> Result<i64, BotError> {
        self.check("server_time")?;
        Ok(Utc::now().timestamp_millis())
    }

    async fn account_balance(&self) -> Result<Decimal, BotError> {
        self.check("account_balance")?;
        Ok(self.state().balance)
    }

    async fn set_leverage(&self, leverage: u32) -> Result<(), BotError> {
        self.check("set_leverage")?;
        self.state().leverage_calls.push(leverage);
        Ok(())
    }

    async fn open_positions(&self) -> Result<Vec<ExchangePosition>, BotError> {
        self.check("open_positions")?;
        Ok(self.state().positions.clone())
    }

    async fn open_plan_orders(&self) -> Result<Vec<OpenPlanOrder>, BotError> {
        self.check("open_plan_orders")?;
        Ok(self.state().plan_orders.clone())
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<PlacedOrder, BotError> {
        self.check("place_order")?;
        let mut state = self.state();
        let order_id = Self::next_id(&mut state);
        state.orders.push(order.clone());
        if state.simulate_fills && order.order_type == OrderType::Market {
            fill(&mut state, order);
        }
        Ok(PlacedOrder {
            order_id,
            client_oid: Some(order.client_oid.clone()),
        })
    }

    async fn place_plan_order(&self, order: &PlanOrderRequest) -> Result<PlacedOrder, BotError> {
        self.check("place_plan_order")?;
        let mut state = self.state();
        let order_id = Self::next_id(&mut state);
        state.plan_requests.push(order.clone());
        state.plan_orders.push(OpenPlanOrder {
            order_id: order_id.clone(),
            client_oid: order.client_oid.clone(),
            trigger_price: Some(order.trigger_price),
        });
        Ok(PlacedOrder {
            order_id,
            client_oid: Some(order.client_oid.clone()),
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BotError> {
        self.check("cancel_order")?;
        self.state().cancelled_orders.push(order_id.to_string());
        Ok(())
    }

    async fn cancel_plan_order(&self, order_id: &str) -> Result<(), BotError> {
        self.check("cancel_plan_order")?;
        let mut state = self.state();
        state.plan_orders.retain(|o| o.order_id != order_id);
        state.cancelled_plans.push(order_id.to_string());
        Ok(())
    }

    async fn candles(&self, _timeframe: &str, _limit: u32) -> Result<Vec<Candle>, BotError> {
        self.check("candles")?;
        Ok(self.state().candles.clone())
    }

    async fn ticker(&self) -> Result<TickerResponse, BotError> {
        self.check("ticker")?;
        Ok(TickerResponse {
            code: "00000".into(),
            data: TickerData {
                last: self.state().price,
                bid: None,
                ask: None,
                high_24h: None,
                low_24h: None,
                volume_24h: None,
            },
        })
    }

    async fn symbols(&self) -> Result<Vec<String>, BotError> {
        self.check("symbols")?;
        Ok(self.state().listed.clone())
    }
}

/// Provider that always returns the same snapshot, stamped with `now`.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct FixedProvider(pub IndicatorSnapshot);

impl IndicatorProvider for FixedProvider {
    fn compute(
        &self,
        _candles: &[Candle],
        _settings: &IndicatorSettings,
        now: DateTime<Utc>,
    ) -> Result<IndicatorSnapshot, BotError> {
        let mut snapshot = self.0.clone();
        snapshot.computed_at = now;
        Ok(snapshot)
    }
}

/// Price just crossed back above a flat channel centre at 100 with EMAs aligned.
#[allow(dead_code)]
pub fn pullback_long_snapshot() -> IndicatorSnapshot {
    let mut snap = IndicatorSnapshot::empty(100.1, Utc::now());
    snap.recent_closes = vec![100.5, 100.2, 99.8, 99.7, 100.1];
    snap.channel = Some(ChannelReading {
        upper: 101.0,
        center: 100.0,
        lower: 99.0,
        recent_centers: vec![100.0; 5],
    });
    snap.ema = Some(EmaReading {
        fast: 100.05,
        slow: 99.9,
        prev_fast: 99.95,
        prev_slow: 99.9,
    });
    snap.adx = Some(28.0);
    snap
}

#[allow(dead_code)]
pub fn flat_candles(n: usize, price: f64) -> Vec<Candle> {
    (0..n)
        .map(|i| Candle {
            timestamp: i as i64 * 60_000,
            open: price,
            high: price + 0.1,
            low: price - 0.1,
            close: price,
            volume: 1_000.0,
        })
        .collect()
}

/// Ledger over `exchange` with its balance loaded and price marked.
#[allow(dead_code)]
pub fn ledger(exchange: &Arc<MockExchange>, config: BotConfig) -> (PositionLedger, EventBus) {
    let events = EventBus::default();
    let dyn_exchange: Arc<dyn Exchange> = exchange.clone();
    let mut ledger = PositionLedger::new(dyn_exchange, config, events.clone());
    let (balance, price) = {
        let state = exchange.state();
        (state.balance, state.price)
    };
    ledger.set_balance(balance);
    ledger.mark_price(price);
    (ledger, events)
}

/// Events published so far, without waiting.
#[allow(dead_code)]
pub fn drain(rx: &mut tokio::sync::broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}
