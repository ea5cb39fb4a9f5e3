// =============================================================================
// Orchestrator — the per-bot cycle state machine
// =============================================================================
//
// run_cycle(bot):
//   1. Reload the bot row (hot config; abort when not active).
//   2. MarketDataBlock.fetch_all (abort only when every symbol failed).
//   3. PortfolioBlock.get_state; enact the drawdown halt if breached.
//   4. PositionMonitor pass (may close; state reloaded afterwards so the
//      decision phase sees its effects).
//   5. The decision block selected by the bot's decision_mode.
//   6. Per signal, in deterministic symbol order: closes execute directly;
//      entries pass through RiskBlock — invalid signals are logged and
//      skipped with an explicit continue, never executed.
//   7. Persist the cycle record; every 12 cycles log a summary.
//
// Mode switching is a bot-row update: the next cycle picks up the new
// block, any in-flight cycle finishes under the old one.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{Bot, BotRepo, CycleRecord, CycleRepo};
use crate::decision::DecisionBlock;
use crate::error::EngineError;
use crate::execution::ExecutionBlock;
use crate::market_data::MarketDataBlock;
use crate::monitor::PositionMonitor;
use crate::portfolio::PortfolioBlock;
use crate::risk::RiskBlock;
use crate::types::{BotStatus, CloseReason, DecisionMode, SignalType};

/// A summary line is logged every this many cycles.
const SUMMARY_EVERY: u64 = 12;

/// Coordinates the blocks for every bot cycle.
pub struct Orchestrator {
    bots: BotRepo,
    market_data: MarketDataBlock,
    portfolio: PortfolioBlock,
    monitor: PositionMonitor,
    risk: RiskBlock,
    execution: Arc<ExecutionBlock>,
    cycles: CycleRepo,
    trinity: Arc<dyn DecisionBlock>,
    llm: Arc<dyn DecisionBlock>,
    indicator: Arc<dyn DecisionBlock>,
    cycle_counts: RwLock<HashMap<Uuid, u64>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bots: BotRepo,
        market_data: MarketDataBlock,
        portfolio: PortfolioBlock,
        monitor: PositionMonitor,
        risk: RiskBlock,
        execution: Arc<ExecutionBlock>,
        cycles: CycleRepo,
        trinity: Arc<dyn DecisionBlock>,
        llm: Arc<dyn DecisionBlock>,
        indicator: Arc<dyn DecisionBlock>,
    ) -> Self {
        Self {
            bots,
            market_data,
            portfolio,
            monitor,
            risk,
            execution,
            cycles,
            trinity,
            llm,
            indicator,
            cycle_counts: RwLock::new(HashMap::new()),
        }
    }

    /// The block bound to a decision mode.
    fn block_for(&self, mode: DecisionMode) -> &Arc<dyn DecisionBlock> {
        match mode {
            DecisionMode::Trinity => &self.trinity,
            DecisionMode::Llm => &self.llm,
            DecisionMode::Indicator => &self.indicator,
        }
    }

    /// Rebind a bot's decision mode. Idempotent; takes effect next cycle.
    pub async fn switch_decision_mode(
        &self,
        bot_id: Uuid,
        mode: DecisionMode,
    ) -> Result<(), EngineError> {
        self.bots.set_decision_mode(bot_id, mode).await?;
        info!(bot_id = %bot_id, mode = %mode, "decision mode switched");
        Ok(())
    }

    /// Run one full cycle for a bot. Errors are fatal for this cycle only.
    pub async fn run_cycle(&self, bot_id: Uuid) -> Result<(), EngineError> {
        let mut record = CycleRecord::begin(bot_id);
        let cycle_id = record.id;

        let outcome = self.run_cycle_inner(bot_id, &mut record).await;

        record = match &outcome {
            Ok(()) => record.finish("ok", None),
            Err(EngineError::EmptyMarketData) => {
                record.finish("empty_market_data", Some("all symbols failed".into()))
            }
            Err(e) => record.finish("fatal", Some(e.to_string())),
        };

        if let Err(e) = self.cycles.insert(&record).await {
            warn!(bot_id = %bot_id, cycle_id = %cycle_id, error = %e, "cycle record not persisted");
        }

        outcome
    }

    async fn run_cycle_inner(
        &self,
        bot_id: Uuid,
        record: &mut CycleRecord,
    ) -> Result<(), EngineError> {
        let cycle_id = record.id;

        // --- 1. Reload bot ------------------------------------------------
        let bot = self
            .bots
            .get(bot_id)
            .await?
            .ok_or_else(|| EngineError::Invariant(format!("bot {bot_id} missing")))?;
        if bot.status != BotStatus::Active {
            debug!(bot_id = %bot_id, status = %bot.status, "bot not active, cycle skipped");
            return Ok(());
        }

        // --- 2. Market data ----------------------------------------------
        let snapshots = self.market_data.fetch_all(&bot.symbols).await?;
        record.symbols_fetched = snapshots.len() as u32;

        // --- 3. Portfolio state + drawdown halt --------------------------
        let state = self.portfolio.get_state(bot_id).await?;
        if self.enact_drawdown_halt(&bot, state.equity).await? {
            return Ok(());
        }

        // --- 4. Monitor pass ---------------------------------------------
        record.positions_closed = self.monitor.run(bot_id, &snapshots).await?;

        // Monitor closes mutate capital and positions; the decision phase
        // must see the post-monitor state.
        let state = self.portfolio.get_state(bot_id).await?;

        // --- 5. Decision ---------------------------------------------------
        let block = self.block_for(bot.decision_mode);
        let signals = block.decide(&bot, &snapshots, &state).await;
        record.signals_emitted = signals.iter().filter(|(_, s)| !matches!(s.signal_type, SignalType::Hold)).count() as u32;

        // --- 6. Risk + execution, deterministic symbol order ---------------
        for (symbol, signal) in &signals {
            match signal.signal_type {
                SignalType::Hold => continue,
                SignalType::Close => {
                    let Some(position) = state.position_for(symbol) else {
                        debug!(bot_id = %bot_id, symbol = %symbol, "close signal without open position");
                        continue;
                    };
                    let price = snapshots
                        .get(symbol)
                        .map(|s| s.last_price)
                        .unwrap_or(position.current_price);
                    match self
                        .execution
                        .close_position(position, CloseReason::SignalExit, price)
                        .await
                    {
                        Ok(result) => {
                            debug!(bot_id = %bot_id, symbol = %symbol, result = %result, "signal exit executed");
                            record.positions_closed += 1;
                        }
                        Err(e) => warn!(
                            bot_id = %bot_id,
                            cycle_id = %cycle_id,
                            symbol = %symbol,
                            phase = "execution",
                            kind = "close_failed",
                            reason = %e,
                            "signal exit failed"
                        ),
                    }
                }
                SignalType::BuyToEnter | SignalType::SellToEnter => {
                    let verdict = self.risk.validate(signal, &state, &bot).await;
                    if !verdict.valid {
                        // Explicit skip: a rejected signal never reaches
                        // execution.
                        info!(
                            bot_id = %bot_id,
                            cycle_id = %cycle_id,
                            symbol = %symbol,
                            phase = "risk",
                            kind = "rejected",
                            reason = %verdict.reason,
                            "entry rejected"
                        );
                        continue;
                    }

                    match self
                        .execution
                        .open_position(bot_id, &verdict.signal, state.equity)
                        .await
                    {
                        Ok(result) => {
                            info!(bot_id = %bot_id, symbol = %symbol, result = %result, "entry executed");
                            record.orders_placed += 1;
                        }
                        Err(e) => warn!(
                            bot_id = %bot_id,
                            cycle_id = %cycle_id,
                            symbol = %symbol,
                            phase = "execution",
                            kind = "open_failed",
                            reason = %e,
                            "entry failed"
                        ),
                    }
                }
            }
        }

        // --- 7. Periodic summary -------------------------------------------
        let count = {
            let mut counts = self.cycle_counts.write();
            let counter = counts.entry(bot_id).or_insert(0);
            *counter += 1;
            *counter
        };
        if count % SUMMARY_EVERY == 0 {
            let state = self.portfolio.get_state(bot_id).await?;
            let utilization = if state.equity.is_zero() {
                Decimal::ZERO
            } else {
                state.open_exposure() / state.equity
            };
            info!(
                bot_id = %bot_id,
                cycle = count,
                equity = %state.equity,
                return_pct = %(state.return_pct * dec!(100)),
                trades_today = state.trades_today,
                capital_utilization = %utilization,
                "cycle summary"
            );
        }

        Ok(())
    }

    /// Pause the bot when equity has drawn down past the limit. Returns
    /// true when the halt fired (the cycle stops here).
    async fn enact_drawdown_halt(&self, bot: &Bot, equity: Decimal) -> Result<bool, EngineError> {
        if bot.initial_capital.is_zero() {
            return Ok(false);
        }
        let drawdown = (bot.initial_capital - equity) / bot.initial_capital;
        if drawdown < bot.risk_params.max_drawdown_pct {
            return Ok(false);
        }

        warn!(
            bot_id = %bot.id,
            drawdown = %(drawdown * dec!(100)),
            limit = %(bot.risk_params.max_drawdown_pct * dec!(100)),
            "drawdown limit breached, pausing bot"
        );
        self.bots.set_status(bot.id, BotStatus::Paused).await?;
        Ok(true)
    }
}
