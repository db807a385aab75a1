use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{EngineStatus, Position};

/// Events broadcast to every subscriber (notifier, dashboards, tests).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum EngineEvent {
    #[serde(rename = "position_opened")]
    PositionOpened(Position),

    #[serde(rename = "position_closed")]
    PositionClosed(PositionClosed),

    #[serde(rename = "position_updated")]
    PositionUpdated(Position),

    #[serde(rename = "log_update")]
    LogUpdate(LogUpdate),

    #[serde(rename = "status")]
    Status(Box<EngineStatus>),
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionClosed {
    pub position_id: String,
    /// Share of the original size closed by this fill, in percent.
    pub percentage: Decimal,
    /// Share still open afterwards, in percent.
    pub remaining: Decimal,
    pub close_price: Decimal,
    pub pnl: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogCategory {
    System,
    Trading,
    Indicators,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogUpdate {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub category: LogCategory,
    pub level: LogLevel,
}

/// Fan-out of [`EngineEvent`]s. Publishing never blocks and never fails;
/// with no subscribers the event is simply dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    /// Operator-facing log line.
    pub fn log(&self, category: LogCategory, level: LogLevel, message: impl Into<String>) {
        self.publish(EngineEvent::LogUpdate(LogUpdate {
            timestamp: Utc::now(),
            message: message.into(),
            category,
            level,
        }));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
