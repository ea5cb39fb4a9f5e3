// =============================================================================
// Bot repository — the capital-bearing row every cycle revolves around
// =============================================================================
//
// The bot row is re-read fresh at the start of every cycle (hot config
// reload) and again, FOR UPDATE, inside each execution transaction so that
// capital mutations serialise against concurrent administrative writes.
// =============================================================================

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::info;
use uuid::Uuid;

use crate::types::{BotStatus, DecisionMode};

// =============================================================================
// Risk parameters (embedded in the bot row as JSON)
// =============================================================================

fn default_max_position_pct() -> Decimal {
    dec!(0.15)
}

fn default_max_exposure_pct() -> Decimal {
    dec!(0.85)
}

fn default_max_drawdown_pct() -> Decimal {
    dec!(0.20)
}

fn default_max_trades_per_day() -> u32 {
    50
}

fn default_max_daily_loss_usd() -> Decimal {
    dec!(-100)
}

fn default_stop_loss_pct() -> Decimal {
    dec!(0.035)
}

fn default_take_profit_pct() -> Decimal {
    dec!(0.07)
}

fn default_min_risk_reward() -> Decimal {
    dec!(1.3)
}

fn default_min_notional_usd() -> Decimal {
    dec!(50)
}

/// Per-bot risk limits. Unknown keys in the stored JSON are ignored and
/// missing keys take the documented defaults, so older rows keep loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskParams {
    /// Fraction of capital allowed into a single position.
    #[serde(default = "default_max_position_pct")]
    pub max_position_pct: Decimal,

    /// Sum of open notionals over capital.
    #[serde(default = "default_max_exposure_pct")]
    pub max_exposure_pct: Decimal,

    /// Drawdown from initial capital at which the bot is paused.
    #[serde(default = "default_max_drawdown_pct")]
    pub max_drawdown_pct: Decimal,

    /// Daily cap on entry trades (exits are never rate-limited).
    #[serde(default = "default_max_trades_per_day")]
    pub max_trades_per_day: u32,

    /// Daily realized-loss circuit breaker (negative USD).
    #[serde(default = "default_max_daily_loss_usd")]
    pub max_daily_loss_usd: Decimal,

    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: Decimal,

    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: Decimal,

    /// Minimum reward-to-risk ratio for an entry.
    #[serde(default = "default_min_risk_reward")]
    pub min_risk_reward: Decimal,

    /// Smallest order the engine will bother placing.
    #[serde(default = "default_min_notional_usd")]
    pub min_notional_usd: Decimal,
}

impl Default for RiskParams {
    fn default() -> Self {
        serde_json::from_str("{}").expect("risk params deserialise from defaults")
    }
}

// =============================================================================
// Bot model
// =============================================================================

/// A long-lived trading agent owning capital, a watch-list, and risk limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bot {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub status: BotStatus,
    pub initial_capital: Decimal,
    /// Free cash; reduced by entry notionals, restored on exit.
    pub capital: Decimal,
    /// Realized P&L accumulator over the bot's lifetime.
    pub total_pnl: Decimal,
    pub model_name: Option<String>,
    pub decision_mode: DecisionMode,
    /// Ordered watch-list in "BTC/USDT" notation.
    pub symbols: Vec<String>,
    pub risk_params: RiskParams,
    pub paper_trading: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bot {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        let status_raw: String = row.try_get("status")?;
        let mode_raw: String = row.try_get("decision_mode")?;
        let symbols_raw: String = row.try_get("symbols")?;
        let risk_raw: String = row.try_get("risk_params")?;

        let decode = |msg: String| sqlx::Error::Decode(msg.into());

        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            name: row.try_get("name")?,
            status: BotStatus::from_str(&status_raw).map_err(decode)?,
            initial_capital: row.try_get("initial_capital")?,
            capital: row.try_get("capital")?,
            total_pnl: row.try_get("total_pnl")?,
            model_name: row.try_get("model_name")?,
            decision_mode: DecisionMode::from_str(&mode_raw).map_err(decode)?,
            symbols: serde_json::from_str(&symbols_raw)
                .map_err(|e| sqlx::Error::Decode(e.into()))?,
            risk_params: serde_json::from_str(&risk_raw)
                .map_err(|e| sqlx::Error::Decode(e.into()))?,
            paper_trading: row.try_get("paper_trading")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

// =============================================================================
// Repository
// =============================================================================

const SELECT_BOT: &str = "SELECT id, user_id, name, status, initial_capital, capital, total_pnl, \
     model_name, decision_mode, symbols, risk_params, paper_trading, created_at, updated_at \
     FROM bots";

/// Data access for bot rows.
#[derive(Clone)]
pub struct BotRepo {
    pool: PgPool,
}

impl BotRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Register a new bot.
    pub async fn create(&self, bot: &Bot) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO bots (id, user_id, name, status, initial_capital, capital, total_pnl, \
             model_name, decision_mode, symbols, risk_params, paper_trading, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(bot.id)
        .bind(bot.user_id)
        .bind(&bot.name)
        .bind(bot.status.to_string())
        .bind(bot.initial_capital)
        .bind(bot.capital)
        .bind(bot.total_pnl)
        .bind(&bot.model_name)
        .bind(bot.decision_mode.to_string())
        .bind(serde_json::to_string(&bot.symbols).expect("symbols serialise"))
        .bind(serde_json::to_string(&bot.risk_params).expect("risk params serialise"))
        .bind(bot.paper_trading)
        .bind(bot.created_at)
        .bind(bot.updated_at)
        .execute(&self.pool)
        .await?;

        info!(bot_id = %bot.id, name = %bot.name, "bot registered");
        Ok(())
    }

    /// Fresh read of one bot. `None` when the row does not exist.
    pub async fn get(&self, id: Uuid) -> Result<Option<Bot>, sqlx::Error> {
        let row = sqlx::query(&format!("{SELECT_BOT} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Bot::from_row(&r)).transpose()
    }

    /// Locked read inside a transaction; blocks concurrent capital writers.
    pub async fn get_for_update(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<Option<Bot>, sqlx::Error> {
        let row = sqlx::query(&format!("{SELECT_BOT} WHERE id = $1 FOR UPDATE"))
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;
        row.map(|r| Bot::from_row(&r)).transpose()
    }

    /// All bots the scheduler should be running.
    pub async fn list_active(&self) -> Result<Vec<Bot>, sqlx::Error> {
        let rows = sqlx::query(&format!("{SELECT_BOT} WHERE status = 'active' ORDER BY created_at"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Bot::from_row).collect()
    }

    /// Administrative status flip (drawdown halt, manual pause/resume).
    pub async fn set_status(&self, id: Uuid, status: BotStatus) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE bots SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(status.to_string())
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        info!(bot_id = %id, status = %status, "bot status changed");
        Ok(())
    }

    /// Rebind the decision mode. Takes effect on the next cycle.
    pub async fn set_decision_mode(&self, id: Uuid, mode: DecisionMode) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE bots SET decision_mode = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(mode.to_string())
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Debit capital by an entry notional, inside the caller's transaction.
    pub async fn debit_capital(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
        notional: Decimal,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE bots SET capital = capital - $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(notional)
            .bind(Utc::now())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Credit exit proceeds and accumulate realized P&L, inside the caller's
    /// transaction.
    pub async fn credit_close(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
        proceeds: Decimal,
        realized_pnl: Decimal,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE bots SET capital = capital + $2, total_pnl = total_pnl + $3, updated_at = $4 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(proceeds)
        .bind(realized_pnl)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}
