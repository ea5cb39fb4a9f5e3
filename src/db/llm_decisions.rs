// =============================================================================
// LLM decision audit rows
// =============================================================================
//
// One row per LLM invocation per symbol, keyed by the prompt fingerprint so
// cached responses can be traced back to the original call.
// =============================================================================

use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

/// Data access for the llm_decisions audit table.
#[derive(Clone)]
pub struct LlmDecisionRepo {
    pool: PgPool,
}

impl LlmDecisionRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record one invocation outcome. Audit-only; failures should be logged
    /// by the caller, never allowed to fail the cycle.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert(
        &self,
        bot_id: Uuid,
        symbol: &str,
        prompt_hash: &str,
        response: &str,
        tokens_in: i64,
        tokens_out: i64,
        cost: Decimal,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO llm_decisions (id, bot_id, symbol, prompt_hash, response, tokens_in, \
             tokens_out, cost, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(Uuid::new_v4())
        .bind(bot_id)
        .bind(symbol)
        .bind(prompt_hash)
        .bind(response)
        .bind(tokens_in)
        .bind(tokens_out)
        .bind(cost)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
