// =============================================================================
// Cycle records — auditable outcome of every orchestrator cycle
// =============================================================================
//
// Normal cycles record their counts; abnormal terminations record the error
// kind in `outcome` plus a reason in `detail`, tying the cycle to its
// failure for later audit.
// =============================================================================

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

/// Outcome row for one bot-cycle.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CycleRecord {
    pub id: Uuid,
    pub bot_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub symbols_fetched: u32,
    pub signals_emitted: u32,
    pub orders_placed: u32,
    pub positions_closed: u32,
    /// "ok", "cycle_timeout", "empty_market_data", "fatal", ...
    pub outcome: String,
    pub detail: Option<String>,
}

impl CycleRecord {
    /// Start a record for a cycle beginning now.
    pub fn begin(bot_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            bot_id,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            symbols_fetched: 0,
            signals_emitted: 0,
            orders_placed: 0,
            positions_closed: 0,
            outcome: "ok".to_string(),
            detail: None,
        }
    }

    /// Stamp the finish time and the abnormal outcome, if any.
    pub fn finish(mut self, outcome: &str, detail: Option<String>) -> Self {
        self.finished_at = Utc::now();
        self.outcome = outcome.to_string();
        self.detail = detail;
        self
    }
}

/// Data access for cycle records.
#[derive(Clone)]
pub struct CycleRepo {
    pool: PgPool,
}

impl CycleRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Persist a finished cycle record. Audit-only.
    pub async fn insert(&self, record: &CycleRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO cycle_records (id, bot_id, started_at, finished_at, symbols_fetched, \
             signals_emitted, orders_placed, positions_closed, outcome, detail) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(record.id)
        .bind(record.bot_id)
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(record.symbols_fetched as i32)
        .bind(record.signals_emitted as i32)
        .bind(record.orders_placed as i32)
        .bind(record.positions_closed as i32)
        .bind(&record.outcome)
        .bind(&record.detail)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
