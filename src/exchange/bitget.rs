use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{json, Value};

use super::client::SignedClient;
use super::ticker::{decimal_of, RawTickerResponse, TickerResponse};
use super::types::{
    granularity, Candle, ExchangePosition, OpenPlanOrder, OrderRequest, OrderType, PlacedOrder,
    PlanOrderRequest,
};
use super::Exchange;
use crate::errors::BotError;

const PRODUCT_TYPE: &str = "USDT-FUTURES";
const MARGIN_COIN: &str = "USDT";
const MARGIN_MODE: &str = "isolated";
const PLAN_TYPE: &str = "normal_plan";

/// USDT-margined futures on Bitget (v2 mix API), bound to one symbol.
#[derive(Debug, Clone)]
pub struct BitgetClient {
    client: SignedClient,
    symbol: String,
}

impl BitgetClient {
    pub fn new(client: SignedClient, symbol: impl Into<String>) -> Self {
        Self {
            client,
            symbol: symbol.into(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    fn order_body(&self, order: &OrderRequest) -> Value {
        let mut body = json!({
            "symbol": self.symbol,
            "productType": PRODUCT_TYPE,
            "marginMode": MARGIN_MODE,
            "marginCoin": MARGIN_COIN,
            "size": order.size.normalize().to_string(),
            "side": order.side.as_str(),
            "force": "gtc",
            "reduceOnly": if order.reduce_only { "YES" } else { "NO" },
            "clientOid": order.client_oid,
        });

        match order.order_type {
            OrderType::Market => body["orderType"] = json!("market"),
            OrderType::Limit { price } => {
                body["orderType"] = json!("limit");
                body["price"] = json!(price.round_dp(6).normalize().to_string());
            }
        }
        body
    }

    fn plan_body(&self, order: &PlanOrderRequest) -> Value {
        json!({
            "planType": PLAN_TYPE,
            "symbol": self.symbol,
            "productType": PRODUCT_TYPE,
            "marginMode": MARGIN_MODE,
            "marginCoin": MARGIN_COIN,
            "size": order.size.normalize().to_string(),
            "triggerPrice": order.trigger_price.round_dp(6).normalize().to_string(),
            "triggerType": "mark_price",
            "side": order.side.as_str(),
            "orderType": "market",
            "reduceOnly": "YES",
            "clientOid": order.client_oid,
        })
    }
}

fn data(body: &Value) -> Result<&Value, BotError> {
    body.get("data")
        .ok_or_else(|| BotError::Data("response has no data field".into()))
}

fn placed(body: &Value) -> Result<PlacedOrder, BotError> {
    PlacedOrder::from_value(data(body)?)
        .ok_or_else(|| BotError::Data("order response has no orderId".into()))
}

#[async_trait]
impl Exchange for BitgetClient {
    async fn server_time(&self) -> Result<i64, BotError> {
        let body = self.client.get("/api/v2/public/time", &[]).await?;
        let raw = match data(&body)? {
            Value::Object(map) => map.get("serverTime").cloned().unwrap_or(Value::Null),
            other => other.clone(),
        };
        decimal_of(&raw)
            .and_then(|d| d.trunc().to_string().parse().ok())
            .ok_or_else(|| BotError::Data(format!("unparseable server time: {raw}")))
    }

    async fn account_balance(&self) -> Result<Decimal, BotError> {
        let body = self
            .client
            .get(
                "/api/v2/mix/account/accounts",
                &[("productType", PRODUCT_TYPE), ("marginCoin", MARGIN_COIN)],
            )
            .await?;

        let accounts = data(&body)?
            .as_array()
            .ok_or_else(|| BotError::Data("accounts payload is not a list".into()))?;
        let account = accounts
            .iter()
            .find(|a| a.get("marginCoin").and_then(Value::as_str) == Some(MARGIN_COIN))
            .or_else(|| accounts.first())
            .ok_or_else(|| BotError::Data("no futures account returned".into()))?;

        account
            .get("available")
            .and_then(decimal_of)
            .ok_or_else(|| BotError::Data("account has no available balance".into()))
    }

    async fn set_leverage(&self, leverage: u32) -> Result<(), BotError> {
        let body = json!({
            "symbol": self.symbol,
            "productType": PRODUCT_TYPE,
            "marginCoin": MARGIN_COIN,
            "leverage": leverage.to_string(),
        });
        self.client.post("/api/v2/mix/account/set-leverage", &body).await?;
        Ok(())
    }

    async fn open_positions(&self) -> Result<Vec<ExchangePosition>, BotError> {
        let body = self
            .client
            .get(
                "/api/v2/mix/position/all-position",
                &[("productType", PRODUCT_TYPE), ("marginCoin", MARGIN_COIN)],
            )
            .await?;

        let rows = data(&body)?.as_array().cloned().unwrap_or_default();
        Ok(rows
            .iter()
            .filter(|row| row.get("symbol").and_then(Value::as_str).map_or(true, |s| s == self.symbol))
            .filter_map(ExchangePosition::from_value)
            .collect())
    }

    async fn open_plan_orders(&self) -> Result<Vec<OpenPlanOrder>, BotError> {
        let body = self
            .client
            .get(
                "/api/v2/mix/order/orders-plan-pending",
                &[
                    ("symbol", self.symbol.as_str()),
                    ("productType", PRODUCT_TYPE),
                    ("planType", PLAN_TYPE),
                ],
            )
            .await?;

        let payload = data(&body)?;
        let rows = payload
            .get("entrustedList")
            .or(Some(payload))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(rows.iter().filter_map(OpenPlanOrder::from_value).collect())
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<PlacedOrder, BotError> {
        let body = self
            .client
            .post("/api/v2/mix/order/place-order", &self.order_body(order))
            .await?;
        placed(&body)
    }

    async fn place_plan_order(&self, order: &PlanOrderRequest) -> Result<PlacedOrder, BotError> {
        let body = self
            .client
            .post("/api/v2/mix/order/place-plan-order", &self.plan_body(order))
            .await?;
        placed(&body)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BotError> {
        let body = json!({
            "symbol": self.symbol,
            "productType": PRODUCT_TYPE,
            "marginCoin": MARGIN_COIN,
            "orderId": order_id,
        });
        self.client.post("/api/v2/mix/order/cancel-order", &body).await?;
        Ok(())
    }

    async fn cancel_plan_order(&self, order_id: &str) -> Result<(), BotError> {
        let body = json!({
            "symbol": self.symbol,
            "productType": PRODUCT_TYPE,
            "marginCoin": MARGIN_COIN,
            "planType": PLAN_TYPE,
            "orderIdList": [{ "orderId": order_id }],
        });
        self.client
            .post("/api/v2/mix/order/cancel-plan-order", &body)
            .await?;
        Ok(())
    }

    async fn candles(&self, timeframe: &str, limit: u32) -> Result<Vec<Candle>, BotError> {
        let granularity = granularity(timeframe);
        let limit = limit.to_string();
        let body = self
            .client
            .get(
                "/api/v2/mix/market/candles",
                &[
                    ("symbol", self.symbol.as_str()),
                    ("productType", PRODUCT_TYPE),
                    ("granularity", granularity.as_str()),
                    ("limit", limit.as_str()),
                ],
            )
            .await?;

        let rows = data(&body)?
            .as_array()
            .ok_or_else(|| BotError::Data("candles payload is not a list".into()))?;
        let mut candles: Vec<Candle> = rows.iter().filter_map(Candle::from_row).collect();
        candles.sort_by_key(|c| c.timestamp);
        Ok(candles)
    }

    async fn ticker(&self) -> Result<TickerResponse, BotError> {
        let body = self
            .client
            .get(
                "/api/v2/mix/market/ticker",
                &[("symbol", self.symbol.as_str()), ("productType", PRODUCT_TYPE)],
            )
            .await?;
        RawTickerResponse::classify(body).normalize()
    }

    async fn symbols(&self) -> Result<Vec<String>, BotError> {
        let body = self
            .client
            .get("/api/v2/mix/market/contracts", &[("productType", PRODUCT_TYPE)])
            .await?;

        let rows = data(&body)?.as_array().cloned().unwrap_or_default();
        Ok(rows
            .iter()
            .filter_map(|c| c.get("symbol").and_then(Value::as_str))
            .map(String::from)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::auth::ExchangeAuth;
    use crate::models::Direction;
    use std::time::Duration;

    fn client() -> BitgetClient {
        let auth = ExchangeAuth::new("k".into(), "s".into(), "p".into());
        let signed = SignedClient::new(auth, "http://localhost", Duration::from_secs(1)).unwrap();
        BitgetClient::new(signed, "XRPUSDT")
    }

    #[test]
    fn test_close_order_body_is_reduce_only() {
        let order = OrderRequest::market_close(Direction::Long, Decimal::new(125, 1), "c1".into());
        let body = client().order_body(&order);

        assert_eq!(body["side"], "sell");
        assert_eq!(body["reduceOnly"], "YES");
        assert_eq!(body["orderType"], "market");
        assert_eq!(body["size"], "12.5");
        assert!(body.get("price").is_none());
    }

    #[test]
    fn test_limit_order_body_has_price() {
        let order = OrderRequest::limit_open(
            Direction::Short,
            Decimal::ONE,
            Decimal::new(5123456789, 10),
            "d1".into(),
        );
        let body = client().order_body(&order);

        assert_eq!(body["side"], "sell");
        assert_eq!(body["reduceOnly"], "NO");
        assert_eq!(body["orderType"], "limit");
        assert_eq!(body["price"], "0.512346");
    }

    #[test]
    fn test_plan_body_formats_trigger() {
        let order = PlanOrderRequest {
            side: Direction::Long.close_side(),
            size: Decimal::from(10),
            trigger_price: Decimal::new(10025, 2),
            client_oid: "tp_1_2".into(),
        };
        let body = client().plan_body(&order);

        assert_eq!(body["triggerPrice"], "100.25");
        assert_eq!(body["side"], "sell");
        assert_eq!(body["reduceOnly"], "YES");
        assert_eq!(body["clientOid"], "tp_1_2");
    }
}
