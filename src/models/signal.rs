use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Direction;

/// An entry signal emitted by the decision stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalResult {
    pub direction: Direction,
    /// Weighted indicator agreement, 0-100.
    pub confidence: u8,
    pub reasons: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl SignalResult {
    /// Reasons joined for logs and the trade history.
    pub fn summary(&self) -> String {
        if self.reasons.is_empty() {
            format!("{} signal", self.direction)
        } else {
            self.reasons.join("; ")
        }
    }
}
