// =============================================================================
// Trade repository — immutable fill records
// =============================================================================
//
// One row per entry or exit. Entries carry realized_pnl = 0; exits carry the
// signed result. The daily trade limit counts entries only, which is why the
// counting query filters on realized_pnl = 0.
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::types::Side;

/// An atomic fill record. Immutable after creation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub bot_id: Uuid,
    pub position_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub fees: Decimal,
    /// Zero for entries, signed for exits.
    pub realized_pnl: Decimal,
    pub executed_at: DateTime<Utc>,
}

impl Trade {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        let side_raw: String = row.try_get("side")?;
        Ok(Self {
            id: row.try_get("id")?,
            bot_id: row.try_get("bot_id")?,
            position_id: row.try_get("position_id")?,
            symbol: row.try_get("symbol")?,
            side: side_raw
                .parse()
                .map_err(|e: String| sqlx::Error::Decode(e.into()))?,
            quantity: row.try_get("quantity")?,
            price: row.try_get("price")?,
            fees: row.try_get("fees")?,
            realized_pnl: row.try_get("realized_pnl")?,
            executed_at: row.try_get("executed_at")?,
        })
    }
}

/// Data access for trade rows.
#[derive(Clone)]
pub struct TradeRepo {
    pool: PgPool,
}

impl TradeRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Persist a fill inside the caller's transaction.
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        trade: &Trade,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO trades (id, bot_id, position_id, symbol, side, quantity, price, fees, \
             realized_pnl, executed_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(trade.id)
        .bind(trade.bot_id)
        .bind(trade.position_id)
        .bind(&trade.symbol)
        .bind(trade.side.to_string())
        .bind(trade.quantity)
        .bind(trade.price)
        .bind(trade.fees)
        .bind(trade.realized_pnl)
        .bind(trade.executed_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Entry trades (realized_pnl = 0) executed since UTC midnight. This is
    /// the number the daily trade limit applies to.
    pub async fn entries_today(&self, bot_id: Uuid) -> Result<u32, sqlx::Error> {
        let midnight = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .expect("midnight is a valid time")
            .and_utc();

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM trades \
             WHERE bot_id = $1 AND realized_pnl = 0 AND executed_at >= $2",
        )
        .bind(bot_id)
        .bind(midnight)
        .fetch_one(&self.pool)
        .await?;

        Ok(count as u32)
    }

    /// Sum of realized P&L on exits executed since UTC midnight.
    pub async fn realized_pnl_today(&self, bot_id: Uuid) -> Result<Decimal, sqlx::Error> {
        let midnight = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .expect("midnight is a valid time")
            .and_utc();

        let total: Option<Decimal> = sqlx::query_scalar(
            "SELECT SUM(realized_pnl) FROM trades WHERE bot_id = $1 AND executed_at >= $2",
        )
        .bind(bot_id)
        .bind(midnight)
        .fetch_one(&self.pool)
        .await?;

        Ok(total.unwrap_or_default())
    }

    /// All fills for one position, entry first.
    pub async fn for_position(&self, position_id: Uuid) -> Result<Vec<Trade>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT id, bot_id, position_id, symbol, side, quantity, price, fees, realized_pnl, \
             executed_at FROM trades WHERE position_id = $1 ORDER BY executed_at",
        )
        .bind(position_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Trade::from_row).collect()
    }
}
