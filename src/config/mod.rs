mod bot;

pub use bot::{
    AdxSettings, BandsSettings, BotConfig, ChannelSettings, ConfigError, DcaConfig, EmaSettings,
    EntryMode, EntrySettings, IndicatorSettings, PartialCloseConfig, ReinvestmentConfig,
    RiskConfig, RsiSettings, ScoreWeights, StrategyKind, TrailingStopConfig, VolumeSettings,
};

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_API_URL: &str = "https://api.bitget.com";

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Exchange credentials
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: String,
    pub api_base_url: String,
    pub demo_trading: bool,

    // Signed request policy
    pub request_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,

    // Engine cadences
    pub slow_cycle_secs: u64,
    pub fast_cycle_secs: u64,
    pub persist_cycle_secs: u64,

    // Optional collaborators
    pub database_url: Option<String>,
    pub metrics_addr: Option<SocketAddr>,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub json_logs: bool,

    pub bot: BotConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let metrics_addr = match env::var("METRICS_ADDR") {
            Ok(raw) if !raw.trim().is_empty() => Some(raw.trim().parse()?),
            _ => None,
        };

        Ok(Self {
            api_key: env::var("BITGET_API_KEY")
                .map_err(|_| anyhow::anyhow!("BITGET_API_KEY must be set"))?,
            api_secret: env::var("BITGET_API_SECRET")
                .map_err(|_| anyhow::anyhow!("BITGET_API_SECRET must be set"))?,
            passphrase: env::var("BITGET_PASSPHRASE")
                .map_err(|_| anyhow::anyhow!("BITGET_PASSPHRASE must be set"))?,
            api_base_url: env::var("BITGET_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.into()),
            demo_trading: env_or("BITGET_DEMO", false),

            request_timeout_ms: env_or("REQUEST_TIMEOUT_MS", 30_000),
            max_retries: env_or("REQUEST_MAX_RETRIES", 3),
            retry_delay_ms: env_or("REQUEST_RETRY_DELAY_MS", 1_000),

            slow_cycle_secs: env_or("SLOW_CYCLE_SECS", 60),
            fast_cycle_secs: env_or("FAST_CYCLE_SECS", 15),
            persist_cycle_secs: env_or("PERSIST_CYCLE_SECS", 300),

            database_url: env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            metrics_addr,
            telegram_bot_token: env::var("TELEGRAM_BOT_TOKEN").ok(),
            telegram_chat_id: env::var("TELEGRAM_CHAT_ID").ok(),
            json_logs: env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false),

            bot: BotConfig::from_env()?,
        })
    }

    /// Bot token and chat id, when both are configured.
    pub fn telegram(&self) -> Option<(String, String)> {
        match (&self.telegram_bot_token, &self.telegram_chat_id) {
            (Some(token), Some(chat_id)) if !token.is_empty() && !chat_id.is_empty() => {
                Some((token.clone(), chat_id.clone()))
            }
            _ => None,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Parse an env var, falling back to `default` when unset or malformed.
pub(crate) fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}
