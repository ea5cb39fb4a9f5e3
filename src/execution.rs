// =============================================================================
// Execution Block — atomic position lifecycle against exchange and ledger
// =============================================================================
//
// Open: re-read the bot row FOR UPDATE inside the transaction, place (or
// simulate) the order, then persist position + entry trade + capital debit
// as one commit. Exchange failure on open aborts the transaction; nothing
// is recorded.
//
// Close: re-read bot and position FOR UPDATE, compute realized P&L, persist
// the exit trade, mark the position closed, credit the proceeds. Exchange
// failure on close retries 3x with exponential backoff; if all retries fail
// the position is flagged `close_pending` with the last-known exit price
// and re-attempted on subsequent cycles. A position already closed by a
// concurrent path is never closed twice.
//
// Paper mode never touches the exchange: fills simulate at snapshot price.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{BotRepo, Position, PositionRepo, Trade, TradeRepo};
use crate::decision::TradingSignal;
use crate::error::EngineError;
use crate::exchange::{Exchange, OrderRequest, OrderType};
use crate::memory::TradeMemory;
use crate::types::{CloseReason, PositionStatus, Side};

/// Taker fee applied to fills (paper mode simulates the same rate).
const FEE_RATE: Decimal = dec!(0.001);
/// Retry budget for closing orders.
const CLOSE_RETRIES: u32 = 3;
/// Base backoff between close retries.
const CLOSE_RETRY_BASE_MS: u64 = 500;

/// Outcome of an execution attempt.
#[derive(Debug, Clone)]
pub enum TradeResult {
    /// Position opened; capital debited by the entry notional.
    Opened {
        position_id: Uuid,
        notional: Decimal,
    },
    /// Position closed; proceeds credited.
    Closed {
        position_id: Uuid,
        realized_pnl: Decimal,
    },
    /// Closing order failed after retries; flagged for later cycles.
    ClosePending { position_id: Uuid },
}

impl std::fmt::Display for TradeResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Opened {
                position_id,
                notional,
            } => write!(f, "Opened({position_id}, notional={notional})"),
            Self::Closed {
                position_id,
                realized_pnl,
            } => write!(f, "Closed({position_id}, pnl={realized_pnl})"),
            Self::ClosePending { position_id } => write!(f, "ClosePending({position_id})"),
        }
    }
}

/// Executes validated signals and closes positions.
pub struct ExecutionBlock {
    pool: PgPool,
    bots: BotRepo,
    positions: PositionRepo,
    trades: TradeRepo,
    exchange: Arc<dyn Exchange>,
    memory: Arc<TradeMemory>,
}

impl ExecutionBlock {
    pub fn new(
        pool: PgPool,
        bots: BotRepo,
        positions: PositionRepo,
        trades: TradeRepo,
        exchange: Arc<dyn Exchange>,
        memory: Arc<TradeMemory>,
    ) -> Self {
        Self {
            pool,
            bots,
            positions,
            trades,
            exchange,
            memory,
        }
    }

    // -------------------------------------------------------------------------
    // Open
    // -------------------------------------------------------------------------

    /// Open a position from a risk-validated entry signal. `equity` is the
    /// portfolio equity the size fraction applies to.
    pub async fn open_position(
        &self,
        bot_id: Uuid,
        signal: &TradingSignal,
        equity: Decimal,
    ) -> Result<TradeResult, EngineError> {
        let side = signal
            .side
            .ok_or_else(|| EngineError::Invariant("entry signal without side".into()))?;
        let signal_price = signal
            .entry_price
            .ok_or_else(|| EngineError::Invariant("entry signal without price".into()))?;
        if signal_price <= Decimal::ZERO {
            return Err(EngineError::Invariant("entry price must be positive".into()));
        }

        let target_notional = signal.size_pct * equity;
        let quantity = target_notional / signal_price;

        let mut tx = self.pool.begin().await?;

        // Fresh, locked read: the capital we debit is the current one.
        let bot = self
            .bots
            .get_for_update(&mut tx, bot_id)
            .await?
            .ok_or_else(|| EngineError::Invariant(format!("bot {bot_id} vanished")))?;

        // Live mode places the order before any write; paper mode fills at
        // the signal price.
        let (fill_price, fill_qty) = if bot.paper_trading {
            (signal_price, quantity)
        } else {
            let fill = self
                .exchange
                .create_order(&OrderRequest {
                    symbol: signal.symbol.clone(),
                    side: side.order_side().to_string(),
                    order_type: OrderType::Market,
                    quantity,
                    price: None,
                })
                .await?; // abort: the transaction rolls back, nothing recorded
            let price = if fill.avg_price > Decimal::ZERO {
                fill.avg_price
            } else {
                signal_price
            };
            let qty = if fill.filled_qty > Decimal::ZERO {
                fill.filled_qty
            } else {
                quantity
            };
            (price, qty)
        };

        let notional = fill_qty * fill_price;
        if bot.capital < notional {
            return Err(EngineError::Invariant(format!(
                "capital {} cannot cover notional {notional}",
                bot.capital
            )));
        }

        let now = Utc::now();
        let position = Position {
            id: Uuid::new_v4(),
            bot_id,
            symbol: signal.symbol.clone(),
            side,
            quantity: fill_qty,
            entry_price: fill_price,
            current_price: fill_price,
            stop_loss: signal.stop_loss.unwrap_or_default(),
            take_profit: signal.take_profit.unwrap_or_default(),
            realized_pnl: Decimal::ZERO,
            status: PositionStatus::Open,
            opened_at: now,
            closed_at: None,
            close_reason: None,
        };

        let trade = Trade {
            id: Uuid::new_v4(),
            bot_id,
            position_id: position.id,
            symbol: signal.symbol.clone(),
            side,
            quantity: fill_qty,
            price: fill_price,
            fees: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            executed_at: now,
        };

        self.positions.insert(&mut tx, &position).await?;
        self.trades.insert(&mut tx, &trade).await?;
        self.bots.debit_capital(&mut tx, bot_id, notional).await?;
        tx.commit().await?;

        info!(
            bot_id = %bot_id,
            position_id = %position.id,
            symbol = %signal.symbol,
            side = %side,
            quantity = %fill_qty,
            price = %fill_price,
            notional = %notional,
            paper = bot.paper_trading,
            "position opened"
        );

        Ok(TradeResult::Opened {
            position_id: position.id,
            notional,
        })
    }

    // -------------------------------------------------------------------------
    // Close
    // -------------------------------------------------------------------------

    /// Close a position at `exit_price` for `reason`.
    pub async fn close_position(
        &self,
        position: &Position,
        reason: CloseReason,
        exit_price: Decimal,
    ) -> Result<TradeResult, EngineError> {
        // Live closing order first (with retries); the ledger write happens
        // only after the exchange accepted the order.
        let bot = self
            .bots
            .get(position.bot_id)
            .await?
            .ok_or_else(|| EngineError::Invariant(format!("bot {} vanished", position.bot_id)))?;

        let exit_price = if bot.paper_trading {
            exit_price
        } else {
            match self.submit_close_order(position).await {
                Ok(fill_price) => fill_price.max(Decimal::ZERO),
                Err(e) => {
                    warn!(
                        position_id = %position.id,
                        error = %e,
                        "closing order failed after retries, flagging close_pending"
                    );
                    self.positions
                        .mark_close_pending(position.id, exit_price, reason)
                        .await?;
                    return Ok(TradeResult::ClosePending {
                        position_id: position.id,
                    });
                }
            }
        };

        let mut tx = self.pool.begin().await?;

        let locked = self
            .positions
            .get_for_update(&mut tx, position.id)
            .await?
            .ok_or_else(|| {
                EngineError::Invariant(format!("position {} vanished", position.id))
            })?;

        // Never double-close: another path may have finished first.
        if locked.status == PositionStatus::Closed {
            warn!(position_id = %position.id, "position already closed, skipping");
            return Ok(TradeResult::Closed {
                position_id: position.id,
                realized_pnl: locked.realized_pnl,
            });
        }

        let exit_notional = locked.quantity * exit_price;
        let fees = exit_notional * FEE_RATE;
        let realized_pnl =
            (exit_price - locked.entry_price) * locked.quantity * locked.side.sign() - fees;
        let proceeds = locked.entry_notional() + realized_pnl;

        let trade = Trade {
            id: Uuid::new_v4(),
            bot_id: locked.bot_id,
            position_id: locked.id,
            symbol: locked.symbol.clone(),
            side: locked.side,
            quantity: locked.quantity,
            price: exit_price,
            fees,
            realized_pnl,
            executed_at: Utc::now(),
        };

        self.trades.insert(&mut tx, &trade).await?;
        self.positions
            .close(&mut tx, locked.id, reason, exit_price, realized_pnl)
            .await?;
        self.bots
            .credit_close(&mut tx, locked.bot_id, proceeds, realized_pnl)
            .await?;
        tx.commit().await?;

        info!(
            bot_id = %locked.bot_id,
            position_id = %locked.id,
            symbol = %locked.symbol,
            reason = %reason,
            exit_price = %exit_price,
            realized_pnl = %realized_pnl,
            "position closed"
        );

        // Feed the outcome back into memory for adaptive sizing.
        let entry_notional = locked.entry_notional();
        let pnl_pct = if entry_notional.is_zero() {
            0.0
        } else {
            (realized_pnl / entry_notional).to_f64().unwrap_or(0.0)
        };
        self.memory
            .record(locked.bot_id, &locked.symbol, realized_pnl, pnl_pct)
            .await;

        Ok(TradeResult::Closed {
            position_id: locked.id,
            realized_pnl,
        })
    }

    /// Submit the closing market order with exponential backoff. Returns
    /// the average fill price.
    async fn submit_close_order(&self, position: &Position) -> Result<Decimal, EngineError> {
        let request = OrderRequest {
            symbol: position.symbol.clone(),
            side: position.side.closing_order_side().to_string(),
            order_type: OrderType::Market,
            quantity: position.quantity,
            price: None,
        };

        let mut delay = Duration::from_millis(CLOSE_RETRY_BASE_MS);
        let mut last_err = None;

        for attempt in 1..=CLOSE_RETRIES {
            match self.exchange.create_order(&request).await {
                Ok(fill) => return Ok(fill.avg_price),
                Err(e) => {
                    warn!(
                        position_id = %position.id,
                        attempt,
                        error = %e,
                        "closing order attempt failed"
                    );
                    last_err = Some(e);
                    if attempt < CLOSE_RETRIES {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| EngineError::Exchange("close order failed".into())))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn realized_pnl_math_long_stop_loss() {
        // Scenario: long 0.01 BTC at 42000, stopped at 40900.
        let entry = dec!(42000);
        let exit = dec!(40900);
        let qty = dec!(0.01);

        let exit_notional = qty * exit;
        let fees = exit_notional * FEE_RATE;
        let pnl = (exit - entry) * qty * Side::Long.sign() - fees;
        let proceeds = qty * entry + pnl;

        assert_eq!(fees, dec!(0.409000));
        assert_eq!(pnl, dec!(-11.409000));
        // Capital credited with roughly the exit notional.
        assert_eq!(proceeds, dec!(408.591000));
    }

    #[test]
    fn realized_pnl_math_short_gain() {
        let entry = dec!(100);
        let exit = dec!(90);
        let qty = dec!(2);

        let fees = qty * exit * FEE_RATE;
        let pnl = (exit - entry) * qty * Side::Short.sign() - fees;
        // Short gains 20 minus 0.18 fees.
        assert_eq!(pnl, dec!(19.820));
    }

    #[test]
    fn trade_result_display() {
        let id = Uuid::nil();
        let opened = TradeResult::Opened {
            position_id: id,
            notional: dec!(300),
        };
        assert!(opened.to_string().contains("notional=300"));

        let pending = TradeResult::ClosePending { position_id: id };
        assert!(pending.to_string().starts_with("ClosePending"));
    }
}
