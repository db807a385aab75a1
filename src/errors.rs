use thiserror::Error;

/// Bitget business codes that mean the credentials or signature were rejected.
const AUTH_CODES: &[&str] = &["40006", "40009", "40012", "40037"];

/// Error taxonomy shared by the exchange client, ledger and engine loop.
///
/// Only [`BotError::Auth`] is fatal; everything else is logged and the
/// affected operation is abandoned for the current cycle.
#[derive(Debug, Clone, Error)]
pub enum BotError {
    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("network failure: {0}")]
    Network(String),

    #[error("exchange rejected request ({code}): {message}")]
    Exchange { code: String, message: String },

    #[error("unusable market data: {0}")]
    Data(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl BotError {
    /// Classify a non-success business code returned in a response body.
    pub fn from_exchange_code(code: &str, message: &str) -> Self {
        if AUTH_CODES.contains(&code) {
            BotError::Auth(format!("{code}: {message}"))
        } else {
            BotError::Exchange {
                code: code.to_string(),
                message: message.to_string(),
            }
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, BotError::Auth(_))
    }

    /// Short label used as a metrics dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            BotError::Auth(_) => "auth",
            BotError::Network(_) => "network",
            BotError::Exchange { .. } => "exchange",
            BotError::Data(_) => "data",
            BotError::InvalidRequest(_) => "invalid_request",
        }
    }
}

impl From<serde_json::Error> for BotError {
    fn from(e: serde_json::Error) -> Self {
        BotError::Data(e.to_string())
    }
}
