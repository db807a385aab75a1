pub mod auth;
pub mod bitget;
pub mod client;
pub mod ticker;
pub mod types;

pub use auth::ExchangeAuth;
pub use bitget::BitgetClient;
pub use client::{RetryPolicy, SignedClient};
pub use ticker::{RawTickerResponse, TickerData, TickerResponse};
pub use types::{
    Candle, ExchangePosition, OpenPlanOrder, OrderRequest, OrderType, PlacedOrder,
    PlanOrderRequest,
};

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::errors::BotError;

/// Everything the engine needs from a futures venue for one trading pair.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Server clock, Unix milliseconds.
    async fn server_time(&self) -> Result<i64, BotError>;

    /// Available margin-coin balance.
    async fn account_balance(&self) -> Result<Decimal, BotError>;

    async fn set_leverage(&self, leverage: u32) -> Result<(), BotError>;

    async fn open_positions(&self) -> Result<Vec<ExchangePosition>, BotError>;

    /// Resting conditional orders for the pair.
    async fn open_plan_orders(&self) -> Result<Vec<OpenPlanOrder>, BotError>;

    async fn place_order(&self, order: &OrderRequest) -> Result<PlacedOrder, BotError>;

    async fn place_plan_order(&self, order: &PlanOrderRequest) -> Result<PlacedOrder, BotError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), BotError>;

    async fn cancel_plan_order(&self, order_id: &str) -> Result<(), BotError>;

    async fn candles(&self, timeframe: &str, limit: u32) -> Result<Vec<Candle>, BotError>;

    async fn ticker(&self) -> Result<TickerResponse, BotError>;

    /// Tradeable symbols of the product line.
    async fn symbols(&self) -> Result<Vec<String>, BotError>;
}
