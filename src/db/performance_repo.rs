use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::PgPool;

use crate::models::DailyPerformance;

/// Insert or overwrite the row for `day.date`.
pub async fn upsert_day(pool: &PgPool, day: &DailyPerformance) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO daily_performance (date, start_balance, end_balance, trades, win_count, loss_count, profit_pct)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (date) DO UPDATE
            SET end_balance = EXCLUDED.end_balance,
                trades = EXCLUDED.trades,
                win_count = EXCLUDED.win_count,
                loss_count = EXCLUDED.loss_count,
                profit_pct = EXCLUDED.profit_pct,
                updated_at = NOW()
        "#,
    )
    .bind(day.date)
    .bind(day.start_balance)
    .bind(day.end_balance)
    .bind(day.trades as i32)
    .bind(day.win_count as i32)
    .bind(day.loss_count as i32)
    .bind(day.profit_pct())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_day(pool: &PgPool, date: NaiveDate) -> anyhow::Result<Option<DailyPerformance>> {
    let row: Option<(NaiveDate, Decimal, Decimal, i32, i32, i32)> = sqlx::query_as(
        r#"
        SELECT date, start_balance, end_balance, trades, win_count, loss_count
        FROM daily_performance
        WHERE date = $1
        "#,
    )
    .bind(date)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(date, start_balance, end_balance, trades, wins, losses)| DailyPerformance {
        date,
        start_balance,
        end_balance,
        trades: trades.max(0) as u32,
        win_count: wins.max(0) as u32,
        loss_count: losses.max(0) as u32,
    }))
}
