// =============================================================================
// Position repository — open, mark, and close directional exposures
// =============================================================================
//
// Invariants enforced here and checked by callers:
//   - one open position per (bot, symbol)
//   - side / entry price / quantity immutable while open
//   - mark price persisted before equity is recomputed
// =============================================================================

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::types::{CloseReason, PositionStatus, Side};

/// An open or historical directional exposure.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub bot_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    /// Mark price, refreshed each cycle by the monitor.
    pub current_price: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    /// Signed and nonzero only once closed.
    pub realized_pnl: Decimal,
    pub status: PositionStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<CloseReason>,
}

impl Position {
    /// Notional at entry: quantity x entry price.
    pub fn entry_notional(&self) -> Decimal {
        self.quantity * self.entry_price
    }

    /// Mark value at the current price, side-signed for equity math.
    pub fn mark_value(&self) -> Decimal {
        // Longs contribute qty * price; shorts contribute the entry notional
        // plus the (inverted) price move.
        match self.side {
            Side::Long => self.quantity * self.current_price,
            Side::Short => {
                self.quantity * self.entry_price
                    + (self.entry_price - self.current_price) * self.quantity
            }
        }
    }

    /// Unrealized P&L at the current mark.
    pub fn unrealized_pnl(&self) -> Decimal {
        (self.current_price - self.entry_price) * self.quantity * self.side.sign()
    }

    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        let side_raw: String = row.try_get("side")?;
        let status_raw: String = row.try_get("status")?;
        let reason_raw: Option<String> = row.try_get("close_reason")?;

        let decode = |msg: String| sqlx::Error::Decode(msg.into());

        Ok(Self {
            id: row.try_get("id")?,
            bot_id: row.try_get("bot_id")?,
            symbol: row.try_get("symbol")?,
            side: Side::from_str(&side_raw).map_err(decode)?,
            quantity: row.try_get("quantity")?,
            entry_price: row.try_get("entry_price")?,
            current_price: row.try_get("current_price")?,
            stop_loss: row.try_get("stop_loss")?,
            take_profit: row.try_get("take_profit")?,
            realized_pnl: row.try_get("realized_pnl")?,
            status: PositionStatus::from_str(&status_raw).map_err(decode)?,
            opened_at: row.try_get("opened_at")?,
            closed_at: row.try_get("closed_at")?,
            close_reason: reason_raw
                .map(|r| CloseReason::from_str(&r).map_err(decode))
                .transpose()?,
        })
    }
}

const SELECT_POSITION: &str = "SELECT id, bot_id, symbol, side, quantity, entry_price, \
     current_price, stop_loss, take_profit, realized_pnl, status, opened_at, closed_at, \
     close_reason FROM positions";

/// Data access for position rows.
#[derive(Clone)]
pub struct PositionRepo {
    pool: PgPool,
}

impl PositionRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Persist a freshly opened position inside the caller's transaction.
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        position: &Position,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO positions (id, bot_id, symbol, side, quantity, entry_price, \
             current_price, stop_loss, take_profit, realized_pnl, status, opened_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(position.id)
        .bind(position.bot_id)
        .bind(&position.symbol)
        .bind(position.side.to_string())
        .bind(position.quantity)
        .bind(position.entry_price)
        .bind(position.current_price)
        .bind(position.stop_loss)
        .bind(position.take_profit)
        .bind(position.realized_pnl)
        .bind(position.status.to_string())
        .bind(position.opened_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Open positions for a bot, oldest first. Includes `close_pending` rows
    /// so the monitor retries them before anything else.
    pub async fn open_for_bot(&self, bot_id: Uuid) -> Result<Vec<Position>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            "{SELECT_POSITION} WHERE bot_id = $1 AND status IN ('open', 'close_pending') \
             ORDER BY opened_at"
        ))
        .bind(bot_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Position::from_row).collect()
    }

    /// The open position on (bot, symbol), if any.
    pub async fn find_open(
        &self,
        bot_id: Uuid,
        symbol: &str,
    ) -> Result<Option<Position>, sqlx::Error> {
        let row = sqlx::query(&format!(
            "{SELECT_POSITION} WHERE bot_id = $1 AND symbol = $2 AND status IN ('open', 'close_pending')"
        ))
        .bind(bot_id)
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| Position::from_row(&r)).transpose()
    }

    /// Locked read inside a transaction, for closing.
    pub async fn get_for_update(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<Option<Position>, sqlx::Error> {
        let row = sqlx::query(&format!("{SELECT_POSITION} WHERE id = $1 FOR UPDATE"))
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;
        row.map(|r| Position::from_row(&r)).transpose()
    }

    /// Persist the refreshed mark price. Must happen before equity is
    /// recomputed or summaries under-report P&L.
    pub async fn update_mark_price(&self, id: Uuid, price: Decimal) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE positions SET current_price = $2 WHERE id = $1")
            .bind(id)
            .bind(price)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Flag a position whose closing order failed after all retries. The
    /// last-known exit price is kept as the mark and the intended reason is
    /// recorded so the retry closes under the same tag.
    pub async fn mark_close_pending(
        &self,
        id: Uuid,
        last_price: Decimal,
        reason: CloseReason,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE positions SET status = 'close_pending', current_price = $2, close_reason = $3 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(last_price)
        .bind(reason.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Transition to closed inside the caller's transaction.
    pub async fn close(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
        reason: CloseReason,
        exit_price: Decimal,
        realized_pnl: Decimal,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE positions SET status = 'closed', current_price = $2, realized_pnl = $3, \
             closed_at = $4, close_reason = $5 WHERE id = $1",
        )
        .bind(id)
        .bind(exit_price)
        .bind(realized_pnl)
        .bind(Utc::now())
        .bind(reason.to_string())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}
