// =============================================================================
// Position Monitor — per-cycle exit pass, runs before decision generation
// =============================================================================
//
// For every open position:
//   1. Retry a pending close first (a prior cycle's close order failed).
//   2. Refresh and persist the mark price from this cycle's snapshot —
//      before equity is recomputed, or summaries under-report P&L.
//   3. Fire triggers in priority order: stop-loss, take-profit, time-stop.
//      Decision-block exit signals are the orchestrator's to act on after
//      the decision phase.
//
// A position whose symbol produced no snapshot this cycle keeps its last
// mark and is left alone.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::db::{Position, PositionRepo};
use crate::error::EngineError;
use crate::execution::{ExecutionBlock, TradeResult};
use crate::market_data::MarketSnapshot;
use crate::types::{CloseReason, PositionStatus, Side};

/// Scans open positions for exit triggers each cycle.
pub struct PositionMonitor {
    positions: PositionRepo,
    execution: Arc<ExecutionBlock>,
    max_hold_hours: i64,
}

impl PositionMonitor {
    pub fn new(positions: PositionRepo, execution: Arc<ExecutionBlock>, max_hold_hours: i64) -> Self {
        Self {
            positions,
            execution,
            max_hold_hours,
        }
    }

    /// Run the exit pass for one bot. Returns the number of positions
    /// closed (pending retries included).
    pub async fn run(
        &self,
        bot_id: uuid::Uuid,
        snapshots: &BTreeMap<String, MarketSnapshot>,
    ) -> Result<u32, EngineError> {
        let open = self.positions.open_for_bot(bot_id).await?;
        if open.is_empty() {
            return Ok(0);
        }

        let mut closed = 0u32;

        for position in &open {
            let Some(snapshot) = snapshots.get(&position.symbol) else {
                debug!(
                    position_id = %position.id,
                    symbol = %position.symbol,
                    "no snapshot this cycle, position untouched"
                );
                continue;
            };
            let price = snapshot.last_price;

            // --- 1. Pending close retry ----------------------------------
            if position.status == PositionStatus::ClosePending {
                let reason = position.close_reason.unwrap_or(CloseReason::Manual);
                match self.execution.close_position(position, reason, price).await {
                    Ok(TradeResult::Closed { .. }) => {
                        info!(position_id = %position.id, "pending close resolved");
                        closed += 1;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(position_id = %position.id, error = %e, "pending close retry failed"),
                }
                continue;
            }

            // --- 2. Mark refresh, persisted ------------------------------
            self.positions.update_mark_price(position.id, price).await?;

            // --- 3. Triggers in priority order ---------------------------
            if let Some(reason) = exit_trigger(position, price, self.max_hold_hours) {
                match self.execution.close_position(position, reason, price).await {
                    Ok(TradeResult::Closed { realized_pnl, .. }) => {
                        info!(
                            position_id = %position.id,
                            symbol = %position.symbol,
                            reason = %reason,
                            realized_pnl = %realized_pnl,
                            "monitor closed position"
                        );
                        closed += 1;
                    }
                    Ok(TradeResult::ClosePending { .. }) => {
                        warn!(position_id = %position.id, "close deferred to next cycle");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(position_id = %position.id, error = %e, "monitor close failed");
                    }
                }
            }
        }

        Ok(closed)
    }
}

/// First matching trigger: stop-loss, then take-profit, then time-stop.
fn exit_trigger(position: &Position, price: Decimal, max_hold_hours: i64) -> Option<CloseReason> {
    let is_long = position.side == Side::Long;

    let stop_hit = if is_long {
        price <= position.stop_loss
    } else {
        price >= position.stop_loss
    };
    if stop_hit {
        return Some(CloseReason::StopLoss);
    }

    let target_hit = if is_long {
        price >= position.take_profit
    } else {
        price <= position.take_profit
    };
    if target_hit {
        return Some(CloseReason::TakeProfit);
    }

    if Utc::now() - position.opened_at > Duration::hours(max_hold_hours) {
        return Some(CloseReason::Timeout);
    }

    None
}
