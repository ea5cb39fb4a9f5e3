// =============================================================================
// Database — pooled Postgres access and schema bootstrap
// =============================================================================
//
// All bot mutations run inside transactions; capital-bearing rows are read
// with SELECT ... FOR UPDATE so concurrent administrative writes cannot race
// a trading cycle. JSON-shaped columns (watch-list, risk parameters) are
// stored as TEXT and parsed at the repository boundary.
// =============================================================================

pub mod bots;
pub mod cycles;
pub mod llm_decisions;
pub mod positions;
pub mod trades;

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::config::Config;

pub use bots::{Bot, BotRepo, RiskParams};
pub use cycles::{CycleRecord, CycleRepo};
pub use llm_decisions::LlmDecisionRepo;
pub use positions::{Position, PositionRepo};
pub use trades::{Trade, TradeRepo};

/// Connect a pool sized from configuration (pool + overflow = max
/// connections, health-checked on checkout, recycled hourly by default).
pub async fn connect(config: &Config) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .min_connections(config.db_pool_size.min(5))
        .max_connections(config.db_pool_size + config.db_max_overflow)
        .test_before_acquire(true)
        .max_lifetime(Duration::from_secs(config.db_pool_recycle_secs))
        .connect(&config.database_url)
        .await?;

    info!(
        pool_size = config.db_pool_size,
        max_overflow = config.db_max_overflow,
        recycle_secs = config.db_pool_recycle_secs,
        "database pool connected"
    );

    Ok(pool)
}

/// Create the engine's tables and indices when missing. Schema evolution
/// beyond bootstrap is handled by external tooling.
pub async fn init_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    const DDL: &[&str] = &[
        r#"
        CREATE TABLE IF NOT EXISTS bots (
            id               UUID PRIMARY KEY,
            user_id          UUID NOT NULL,
            name             TEXT NOT NULL,
            status           TEXT NOT NULL,
            initial_capital  NUMERIC NOT NULL,
            capital          NUMERIC NOT NULL,
            total_pnl        NUMERIC NOT NULL DEFAULT 0,
            model_name       TEXT,
            decision_mode    TEXT NOT NULL,
            symbols          TEXT NOT NULL,
            risk_params      TEXT NOT NULL,
            paper_trading    BOOLEAN NOT NULL DEFAULT TRUE,
            created_at       TIMESTAMPTZ NOT NULL,
            updated_at       TIMESTAMPTZ NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS positions (
            id            UUID PRIMARY KEY,
            bot_id        UUID NOT NULL REFERENCES bots(id),
            symbol        TEXT NOT NULL,
            side          TEXT NOT NULL,
            quantity      NUMERIC NOT NULL,
            entry_price   NUMERIC NOT NULL,
            current_price NUMERIC NOT NULL,
            stop_loss     NUMERIC NOT NULL,
            take_profit   NUMERIC NOT NULL,
            realized_pnl  NUMERIC NOT NULL DEFAULT 0,
            status        TEXT NOT NULL,
            opened_at     TIMESTAMPTZ NOT NULL,
            closed_at     TIMESTAMPTZ,
            close_reason  TEXT
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS trades (
            id           UUID PRIMARY KEY,
            bot_id       UUID NOT NULL REFERENCES bots(id),
            position_id  UUID NOT NULL REFERENCES positions(id),
            symbol       TEXT NOT NULL,
            side         TEXT NOT NULL,
            quantity     NUMERIC NOT NULL,
            price        NUMERIC NOT NULL,
            fees         NUMERIC NOT NULL DEFAULT 0,
            realized_pnl NUMERIC NOT NULL DEFAULT 0,
            executed_at  TIMESTAMPTZ NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS llm_decisions (
            id          UUID PRIMARY KEY,
            bot_id      UUID NOT NULL REFERENCES bots(id),
            symbol      TEXT NOT NULL,
            prompt_hash TEXT NOT NULL,
            response    TEXT NOT NULL,
            tokens_in   BIGINT NOT NULL DEFAULT 0,
            tokens_out  BIGINT NOT NULL DEFAULT 0,
            cost        NUMERIC NOT NULL DEFAULT 0,
            created_at  TIMESTAMPTZ NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS cycle_records (
            id              UUID PRIMARY KEY,
            bot_id          UUID NOT NULL REFERENCES bots(id),
            started_at      TIMESTAMPTZ NOT NULL,
            finished_at     TIMESTAMPTZ NOT NULL,
            symbols_fetched INTEGER NOT NULL DEFAULT 0,
            signals_emitted INTEGER NOT NULL DEFAULT 0,
            orders_placed   INTEGER NOT NULL DEFAULT 0,
            positions_closed INTEGER NOT NULL DEFAULT 0,
            outcome         TEXT NOT NULL,
            detail          TEXT
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_positions_bot_status ON positions (bot_id, status)",
        "CREATE INDEX IF NOT EXISTS idx_trades_bot_executed ON trades (bot_id, executed_at)",
        "CREATE INDEX IF NOT EXISTS idx_trades_position ON trades (position_id)",
        "CREATE INDEX IF NOT EXISTS idx_cycles_bot ON cycle_records (bot_id, started_at)",
    ];

    for statement in DDL {
        sqlx::query(statement).execute(pool).await?;
    }

    info!("database schema verified");
    Ok(())
}
