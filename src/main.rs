use std::sync::Arc;

use tokio::time::Duration;

use perpbot::config::AppConfig;
use perpbot::db::{self, HistoryStore, PgHistoryStore};
use perpbot::events::EventBus;
use perpbot::exchange::{BitgetClient, Exchange, ExchangeAuth, RetryPolicy, SignedClient};
use perpbot::indicators::TaIndicatorProvider;
use perpbot::services::{Engine, EngineTimings, Notifier};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env()?;
    init_tracing(config.json_logs);

    if let Some(addr) = config.metrics_addr {
        perpbot::metrics::init_metrics(addr)?;
    }

    let auth = ExchangeAuth::new(
        config.api_key.clone(),
        config.api_secret.clone(),
        config.passphrase.clone(),
    );
    let client = SignedClient::new(auth, &config.api_base_url, config.request_timeout())?
        .with_retry(RetryPolicy {
            max_retries: config.max_retries,
            delay: config.retry_delay(),
        })
        .with_demo(config.demo_trading);
    let exchange: Arc<dyn Exchange> = Arc::new(BitgetClient::new(client, &config.bot.symbol));

    let store: Option<Arc<dyn HistoryStore>> = match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to database...");
            let pool = db::init_pool(url).await?;
            tracing::info!("Database connected");
            Some(Arc::new(PgHistoryStore::new(pool)))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, history will not be persisted");
            None
        }
    };

    let events = EventBus::default();

    if let Some((token, chat_id)) = config.telegram() {
        Notifier::new(token, chat_id).spawn(&events);
        tracing::info!("Telegram notifications enabled");
    }

    let timings = EngineTimings {
        slow: Duration::from_secs(config.slow_cycle_secs),
        fast: Duration::from_secs(config.fast_cycle_secs),
        persist: Duration::from_secs(config.persist_cycle_secs),
    };

    tracing::info!(
        symbol = %config.bot.symbol,
        strategy = config.bot.strategy.as_str(),
        leverage = config.bot.leverage,
        demo = config.demo_trading,
        "Launching engine"
    );

    let engine = Engine::new(
        exchange,
        Arc::new(TaIndicatorProvider),
        store,
        events,
        config.bot.clone(),
        timings,
    );
    let (handle, mut task) = engine.spawn();

    tokio::select! {
        result = &mut task => {
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown requested");
            handle.stop().await;
            task.await??;
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    use tracing_subscriber::{fmt, EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}
