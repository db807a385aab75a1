use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::events::{EngineEvent, EventBus, LogLevel};
use crate::models::Position;

const TELEGRAM_API: &str = "https://api.telegram.org";

/// Telegram notification service. Failures are logged but never block the main flow.
#[derive(Debug, Clone)]
pub struct Notifier {
    http: reqwest::Client,
    base_url: String,
    bot_token: String,
    chat_id: String,
}

impl Notifier {
    pub fn new(bot_token: String, chat_id: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: TELEGRAM_API.to_string(),
            bot_token,
            chat_id,
        }
    }

    /// Point at a different Bot API host.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Send a Telegram message. Failures are logged as warnings.
    pub async fn send(&self, message: &str) {
        let url = format!("{}/bot{}/sendMessage", self.base_url, self.bot_token);

        let body = json!({
            "chat_id": self.chat_id,
            "text": message,
            "parse_mode": "Markdown",
        });

        match self.http.post(&url).json(&body).send().await {
            Ok(resp) => {
                if !resp.status().is_success() {
                    tracing::warn!(
                        status = %resp.status(),
                        "Telegram sendMessage returned non-2xx"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to send Telegram notification");
            }
        }
    }

    /// Forward open/close events and errors from `events` until the bus closes.
    pub fn spawn(self, events: &EventBus) -> JoinHandle<()> {
        let mut rx = events.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Some(message) = format_event(&event) {
                            self.send(&message).await;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Notifier lagged behind the event bus");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            tracing::debug!("Notifier stopped");
        })
    }
}

/// Message for the events worth a notification; `None` for the rest.
pub fn format_event(event: &EngineEvent) -> Option<String> {
    match event {
        EngineEvent::PositionOpened(position) => Some(format_opened(position)),
        EngineEvent::PositionClosed(closed) => Some(format!(
            "*Position Closed*\nId: `{}`\nClosed: {}%\nRemaining: {}%\nPrice: {}\nPnL: {}%",
            closed.position_id,
            closed.percentage.round_dp(2),
            closed.remaining.round_dp(2),
            closed.close_price,
            closed.pnl.round_dp(2),
        )),
        EngineEvent::LogUpdate(log) if log.level == LogLevel::Error => {
            Some(format!("*Error*\n{}", log.message))
        }
        _ => None,
    }
}

fn format_opened(position: &Position) -> String {
    format!(
        "*Position Opened*\nId: `{}`\nDirection: {}\nSize: {} @ {}\nTP: {}\nSL: {}\nConfidence: {}%",
        position.id,
        position.direction,
        position.size,
        position.entry_price,
        position.take_profit_price,
        position.stop_loss_price,
        position.confidence_level,
    )
}
