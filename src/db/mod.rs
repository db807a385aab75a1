pub mod performance_repo;
pub mod trade_repo;

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::models::{DailyPerformance, PositionHistoryEntry};

pub async fn init_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;

    // Verify connectivity
    sqlx::query("SELECT 1").execute(&pool).await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Where the engine flushes trade history and daily performance.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn save_history(&self, entries: &[PositionHistoryEntry]) -> anyhow::Result<()>;

    async fn save_performance(&self, day: &DailyPerformance) -> anyhow::Result<()>;

    /// Most recent entries, oldest first.
    async fn load_history(&self, limit: i64) -> anyhow::Result<Vec<PositionHistoryEntry>>;

    async fn load_performance(&self, date: NaiveDate) -> anyhow::Result<Option<DailyPerformance>>;
}

/// Postgres-backed [`HistoryStore`].
#[derive(Debug, Clone)]
pub struct PgHistoryStore {
    pool: PgPool,
}

impl PgHistoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HistoryStore for PgHistoryStore {
    async fn save_history(&self, entries: &[PositionHistoryEntry]) -> anyhow::Result<()> {
        for entry in entries {
            trade_repo::upsert_trade(&self.pool, entry).await?;
        }
        Ok(())
    }

    async fn save_performance(&self, day: &DailyPerformance) -> anyhow::Result<()> {
        performance_repo::upsert_day(&self.pool, day).await
    }

    async fn load_history(&self, limit: i64) -> anyhow::Result<Vec<PositionHistoryEntry>> {
        trade_repo::recent_trades(&self.pool, limit).await
    }

    async fn load_performance(&self, date: NaiveDate) -> anyhow::Result<Option<DailyPerformance>> {
        performance_repo::get_day(&self.pool, date).await
    }
}
