use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{Map, Value};

use super::client::{response_code, SUCCESS_CODE};
use crate::errors::BotError;

/// Field names that may carry the last traded price, in lookup order.
const LAST_PRICE_FIELDS: &[&str] = &["last", "lastPr", "price"];

/// Canonical ticker payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickerData {
    pub last: Decimal,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub high_24h: Option<Decimal>,
    pub low_24h: Option<Decimal>,
    pub volume_24h: Option<Decimal>,
}

/// Canonical `{code, data:{last,…}}` shape every ticker response is reduced to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickerResponse {
    pub code: String,
    pub data: TickerData,
}

/// The response layouts observed from the ticker endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum RawTickerResponse {
    /// Non-success business code.
    Error { code: String, message: String },
    /// `data` is a list of ticker objects; the first one is used.
    Array(Vec<Value>),
    /// `data` is a single ticker object.
    Object(Map<String, Value>),
    /// Legacy `ticker` / `tickers` field instead of `data`.
    Alternate(Value),
    /// A bare price at the top level or directly under `data`.
    Scalar(Value),
    Unrecognized(Value),
}

impl RawTickerResponse {
    /// Classify a decoded response body.
    pub fn classify(body: Value) -> Self {
        if let Some(code) = response_code(&body) {
            if code != SUCCESS_CODE {
                let message = body
                    .get("msg")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                return RawTickerResponse::Error { code, message };
            }
        }

        match body.get("data") {
            Some(Value::Array(items)) if !items.is_empty() => {
                return RawTickerResponse::Array(items.clone());
            }
            Some(Value::Object(map)) => return RawTickerResponse::Object(map.clone()),
            Some(scalar @ (Value::String(_) | Value::Number(_))) => {
                return RawTickerResponse::Scalar(scalar.clone());
            }
            _ => {}
        }

        if let Some(ticker) = body.get("ticker").filter(|v| v.is_object()) {
            return RawTickerResponse::Alternate(ticker.clone());
        }
        if let Some(first) = body
            .get("tickers")
            .and_then(Value::as_array)
            .and_then(|list| list.first())
        {
            return RawTickerResponse::Alternate(first.clone());
        }

        if let Some(price) = LAST_PRICE_FIELDS.iter().find_map(|f| body.get(*f)) {
            return RawTickerResponse::Scalar(price.clone());
        }

        RawTickerResponse::Unrecognized(body)
    }

    /// Reduce to the canonical shape, or fail if no price can be found.
    pub fn normalize(self) -> Result<TickerResponse, BotError> {
        let data = match self {
            RawTickerResponse::Error { code, message } => {
                return Err(BotError::from_exchange_code(&code, &message));
            }
            RawTickerResponse::Array(items) => items
                .first()
                .and_then(Value::as_object)
                .and_then(ticker_from_object),
            RawTickerResponse::Object(map) => ticker_from_object(&map),
            RawTickerResponse::Alternate(value) => value.as_object().and_then(ticker_from_object),
            RawTickerResponse::Scalar(value) => decimal_of(&value).map(|last| TickerData {
                last,
                bid: None,
                ask: None,
                high_24h: None,
                low_24h: None,
                volume_24h: None,
            }),
            RawTickerResponse::Unrecognized(value) => {
                tracing::warn!(body = %value, "Unrecognized ticker response shape");
                None
            }
        };

        data.map(|data| TickerResponse {
            code: SUCCESS_CODE.to_string(),
            data,
        })
        .ok_or_else(|| BotError::Data("ticker response has no recognizable price field".into()))
    }
}

fn ticker_from_object(map: &Map<String, Value>) -> Option<TickerData> {
    Some(TickerData {
        last: first_decimal(map, LAST_PRICE_FIELDS)?,
        bid: first_decimal(map, &["bidPr", "bestBid", "bid"]),
        ask: first_decimal(map, &["askPr", "bestAsk", "ask"]),
        high_24h: first_decimal(map, &["high24h", "high"]),
        low_24h: first_decimal(map, &["low24h", "low"]),
        volume_24h: first_decimal(map, &["baseVolume", "volume"]),
    })
}

fn first_decimal(map: &Map<String, Value>, names: &[&str]) -> Option<Decimal> {
    names.iter().find_map(|n| map.get(*n).and_then(decimal_of))
}

/// Prices arrive as JSON strings or numbers.
pub(crate) fn decimal_of(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.to_string().parse().ok(),
        _ => None,
    }
}

// ---- Tests ----
