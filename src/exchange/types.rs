use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ticker::decimal_of;
use crate::models::{Direction, OrderSide};

/// One OHLCV bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Parse a `[ts, open, high, low, close, baseVolume, ...]` row of strings.
    pub fn from_row(row: &Value) -> Option<Self> {
        let cells = row.as_array()?;
        let num = |i: usize| -> Option<f64> {
            match cells.get(i)? {
                Value::String(s) => s.parse().ok(),
                Value::Number(n) => n.as_f64(),
                _ => None,
            }
        };

        Some(Self {
            timestamp: num(0)? as i64,
            open: num(1)?,
            high: num(2)?,
            low: num(3)?,
            close: num(4)?,
            volume: num(5).unwrap_or(0.0),
        })
    }
}

/// Candle interval in the exchange's casing: minutes lowercase, larger units upper.
pub fn granularity(timeframe: &str) -> String {
    let trimmed = timeframe.trim();
    match trimmed.char_indices().last() {
        Some((idx, unit @ ('h' | 'd' | 'w'))) => {
            format!("{}{}", &trimmed[..idx], unit.to_ascii_uppercase())
        }
        _ => trimmed.to_string(),
    }
}

/// A position as reported by the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub direction: Direction,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub margin: Decimal,
    pub unrealized_pnl: Decimal,
    pub leverage: Option<u32>,
    pub opened_at_ms: Option<i64>,
    pub pos_id: Option<String>,
}

impl ExchangePosition {
    pub fn from_value(value: &Value) -> Option<Self> {
        let direction = Direction::from_hold_side(value.get("holdSide")?.as_str()?)?;
        let dec = |names: &[&str]| -> Option<Decimal> {
            names.iter().find_map(|n| value.get(*n).and_then(decimal_of))
        };
        let text = |name: &str| -> Option<String> {
            match value.get(name)? {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            }
        };

        let size = dec(&["total", "size", "available"][..])?;
        if size <= Decimal::ZERO {
            return None;
        }

        Some(Self {
            direction,
            size,
            entry_price: dec(&["openPriceAvg", "averageOpenPrice", "openAvgPrice"][..])?,
            margin: dec(&["marginSize", "margin"][..]).unwrap_or_default(),
            unrealized_pnl: dec(&["unrealizedPL", "unrealizedPnl"][..]).unwrap_or_default(),
            leverage: text("leverage").and_then(|s| s.parse().ok()),
            opened_at_ms: text("cTime").and_then(|s| s.parse().ok()),
            pos_id: text("posId"),
        })
    }

    /// Stable identity of this exchange position.
    pub fn key(&self) -> String {
        match &self.pos_id {
            Some(id) => id.clone(),
            None => format!(
                "{}-{}",
                self.direction.as_hold_side(),
                self.opened_at_ms.unwrap_or_default()
            ),
        }
    }
}

/// A resting conditional order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPlanOrder {
    pub order_id: String,
    pub client_oid: String,
    pub trigger_price: Option<Decimal>,
}

impl OpenPlanOrder {
    pub fn from_value(value: &Value) -> Option<Self> {
        Some(Self {
            order_id: value.get("orderId")?.as_str()?.to_string(),
            client_oid: value
                .get("clientOid")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            trigger_price: value.get("triggerPrice").and_then(decimal_of),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit { price: Decimal },
}

/// A regular order. `side` is the trade direction; `reduce_only` marks closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub side: OrderSide,
    pub size: Decimal,
    pub order_type: OrderType,
    pub reduce_only: bool,
    pub client_oid: String,
}

impl OrderRequest {
    pub fn market_open(direction: Direction, size: Decimal, client_oid: String) -> Self {
        Self {
            side: direction.open_side(),
            size,
            order_type: OrderType::Market,
            reduce_only: false,
            client_oid,
        }
    }

    pub fn market_close(direction: Direction, size: Decimal, client_oid: String) -> Self {
        Self {
            side: direction.close_side(),
            size,
            order_type: OrderType::Market,
            reduce_only: true,
            client_oid,
        }
    }

    pub fn limit_open(direction: Direction, size: Decimal, price: Decimal, client_oid: String) -> Self {
        Self {
            side: direction.open_side(),
            size,
            order_type: OrderType::Limit { price },
            reduce_only: false,
            client_oid,
        }
    }
}

/// A reduce-only market order triggered when the mark price crosses `trigger_price`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanOrderRequest {
    pub side: OrderSide,
    pub size: Decimal,
    pub trigger_price: Decimal,
    pub client_oid: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacedOrder {
    pub order_id: String,
    pub client_oid: Option<String>,
}

impl PlacedOrder {
    pub fn from_value(value: &Value) -> Option<Self> {
        let order_id = match value.get("orderId")? {
            Value::String(s) if !s.is_empty() => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        Some(Self {
            order_id,
            client_oid: value.get("clientOid").and_then(Value::as_str).map(String::from),
        })
    }
}

// ---- Tests ----
