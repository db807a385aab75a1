use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;

use crate::config::StrategyKind;
use crate::models::{Direction, PositionHistoryEntry, TradeOutcome};

#[derive(Debug, sqlx::FromRow)]
struct TradeRow {
    id: String,
    direction: String,
    entry_price: Decimal,
    size: Decimal,
    entry_time: DateTime<Utc>,
    take_profit_price: Decimal,
    stop_loss_price: Decimal,
    confidence_level: i16,
    strategy: String,
    reason: String,
    close_price: Option<Decimal>,
    close_time: Option<DateTime<Utc>>,
    pnl: Option<Decimal>,
    result: Option<String>,
    partially_closed_pct: Decimal,
}

impl TradeRow {
    fn into_entry(self) -> Option<PositionHistoryEntry> {
        let direction = match self.direction.as_str() {
            "LONG" => Direction::Long,
            "SHORT" => Direction::Short,
            other => {
                tracing::warn!(id = %self.id, direction = other, "Skipping trade row with unknown direction");
                return None;
            }
        };
        let result = match self.result.as_deref() {
            Some("win") => Some(TradeOutcome::Win),
            Some("loss") => Some(TradeOutcome::Loss),
            _ => None,
        };

        Some(PositionHistoryEntry {
            id: self.id,
            direction,
            entry_price: self.entry_price,
            size: self.size,
            entry_time: self.entry_time,
            take_profit_price: self.take_profit_price,
            stop_loss_price: self.stop_loss_price,
            confidence_level: self.confidence_level.clamp(0, 100) as u8,
            strategy: StrategyKind::from_str(&self.strategy),
            reason: self.reason,
            close_price: self.close_price,
            close_time: self.close_time,
            pnl: self.pnl,
            result,
            partially_closed_pct: self.partially_closed_pct,
        })
    }
}

/// Insert a history entry, or amend it with its closing data.
pub async fn upsert_trade(pool: &PgPool, entry: &PositionHistoryEntry) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO trade_history (
            id, direction, entry_price, size, entry_time, take_profit_price, stop_loss_price,
            confidence_level, strategy, reason, close_price, close_time, pnl, result,
            partially_closed_pct
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        ON CONFLICT (id) DO UPDATE
            SET close_price = EXCLUDED.close_price,
                close_time = EXCLUDED.close_time,
                pnl = EXCLUDED.pnl,
                result = EXCLUDED.result,
                partially_closed_pct = EXCLUDED.partially_closed_pct,
                updated_at = NOW()
        "#,
    )
    .bind(&entry.id)
    .bind(entry.direction.to_string())
    .bind(entry.entry_price)
    .bind(entry.size)
    .bind(entry.entry_time)
    .bind(entry.take_profit_price)
    .bind(entry.stop_loss_price)
    .bind(i16::from(entry.confidence_level))
    .bind(entry.strategy.as_str())
    .bind(&entry.reason)
    .bind(entry.close_price)
    .bind(entry.close_time)
    .bind(entry.pnl)
    .bind(entry.result.map(|r| r.as_str()))
    .bind(entry.partially_closed_pct)
    .execute(pool)
    .await?;

    Ok(())
}

/// The `limit` most recent entries, oldest first.
pub async fn recent_trades(pool: &PgPool, limit: i64) -> anyhow::Result<Vec<PositionHistoryEntry>> {
    let rows = sqlx::query_as::<_, TradeRow>(
        r#"
        SELECT id, direction, entry_price, size, entry_time, take_profit_price, stop_loss_price,
               confidence_level, strategy, reason, close_price, close_time, pnl, result,
               partially_closed_pct
        FROM trade_history
        ORDER BY entry_time DESC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut entries: Vec<PositionHistoryEntry> =
        rows.into_iter().filter_map(TradeRow::into_entry).collect();
    entries.reverse();
    Ok(entries)
}
