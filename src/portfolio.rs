// =============================================================================
// PortfolioBlock — fresh per-cycle view of a bot's capital and exposure
// =============================================================================
//
// Reads the bot row fresh (never a cached copy) and eagerly loads open
// positions. Equity marks every open position at its current price; the
// daily trade counter counts entry trades only, so exits are never
// rate-limited.
// =============================================================================

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::db::{Bot, BotRepo, Position, PositionRepo, TradeRepo};
use crate::error::EngineError;

/// Snapshot of a bot's financial state at the top of a cycle.
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioState {
    pub bot_id: Uuid,
    /// Free cash.
    pub cash: Decimal,
    /// Cash plus marked value of open positions.
    pub equity: Decimal,
    /// (equity - initial) / initial.
    pub return_pct: Decimal,
    pub open_positions: Vec<Position>,
    /// Entry trades executed today (realized_pnl = 0 rows).
    pub trades_today: u32,
    pub realized_pnl_today: Decimal,
}

impl PortfolioState {
    /// Sum of entry notionals across open positions.
    pub fn open_exposure(&self) -> Decimal {
        self.open_positions.iter().map(|p| p.entry_notional()).sum()
    }

    /// The open position on `symbol`, if any.
    pub fn position_for(&self, symbol: &str) -> Option<&Position> {
        self.open_positions.iter().find(|p| p.symbol == symbol)
    }
}

/// Assembles [`PortfolioState`] from the repositories.
pub struct PortfolioBlock {
    bots: BotRepo,
    positions: PositionRepo,
    trades: TradeRepo,
}

impl PortfolioBlock {
    pub fn new(bots: BotRepo, positions: PositionRepo, trades: TradeRepo) -> Self {
        Self {
            bots,
            positions,
            trades,
        }
    }

    /// Load the bot fresh and compute its portfolio state.
    pub async fn get_state(&self, bot_id: Uuid) -> Result<PortfolioState, EngineError> {
        let bot = self
            .bots
            .get(bot_id)
            .await?
            .ok_or_else(|| EngineError::Invariant(format!("bot {bot_id} vanished")))?;

        let open_positions = self.positions.open_for_bot(bot_id).await?;
        let trades_today = self.trades.entries_today(bot_id).await?;
        let realized_pnl_today = self.trades.realized_pnl_today(bot_id).await?;

        let state = compute_state(&bot, open_positions, trades_today, realized_pnl_today);

        debug!(
            bot_id = %bot_id,
            cash = %state.cash,
            equity = %state.equity,
            open_positions = state.open_positions.len(),
            trades_today = state.trades_today,
            "portfolio state loaded"
        );

        Ok(state)
    }
}

/// Pure assembly of the state from already-loaded rows.
pub fn compute_state(
    bot: &Bot,
    open_positions: Vec<Position>,
    trades_today: u32,
    realized_pnl_today: Decimal,
) -> PortfolioState {
    let marked: Decimal = open_positions.iter().map(|p| p.mark_value()).sum();
    let equity = bot.capital + marked;

    let return_pct = if bot.initial_capital.is_zero() {
        Decimal::ZERO
    } else {
        (equity - bot.initial_capital) / bot.initial_capital
    };

    PortfolioState {
        bot_id: bot.id,
        cash: bot.capital,
        equity,
        return_pct,
        open_positions,
        trades_today,
        realized_pnl_today,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::RiskParams;
    use crate::types::{BotStatus, DecisionMode, PositionStatus, Side};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn bot(initial: Decimal, capital: Decimal) -> Bot {
        Bot {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "test".into(),
            status: BotStatus::Active,
            initial_capital: initial,
            capital,
            total_pnl: Decimal::ZERO,
            model_name: None,
            decision_mode: DecisionMode::Trinity,
            symbols: vec!["BTC/USDT".into()],
            risk_params: RiskParams::default(),
            paper_trading: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn open_position(entry: Decimal, current: Decimal, qty: Decimal) -> Position {
        Position {
            id: Uuid::new_v4(),
            bot_id: Uuid::new_v4(),
            symbol: "BTC/USDT".into(),
            side: Side::Long,
            quantity: qty,
            entry_price: entry,
            current_price: current,
            stop_loss: entry * dec!(0.97),
            take_profit: entry * dec!(1.07),
            realized_pnl: Decimal::ZERO,
            status: PositionStatus::Open,
            opened_at: Utc::now(),
            closed_at: None,
            close_reason: None,
        }
    }

    #[test]
    fn equity_is_cash_without_positions() {
        let state = compute_state(&bot(dec!(10000), dec!(10000)), vec![], 0, Decimal::ZERO);
        assert_eq!(state.equity, dec!(10000));
        assert_eq!(state.return_pct, Decimal::ZERO);
        assert_eq!(state.open_exposure(), Decimal::ZERO);
    }

    #[test]
    fn equity_marks_open_positions() {
        // $300 entered at 42000, now marked at 43000.
        let qty = dec!(300) / dec!(42000);
        let position = open_position(dec!(42000), dec!(43000), qty);
        let state = compute_state(&bot(dec!(10000), dec!(9700)), vec![position], 1, Decimal::ZERO);

        let expected_mark = qty * dec!(43000);
        assert_eq!(state.equity, dec!(9700) + expected_mark);
        assert!(state.return_pct > Decimal::ZERO);
    }

    #[test]
    fn return_pct_negative_on_drawdown() {
        let state = compute_state(&bot(dec!(10000), dec!(9000)), vec![], 0, dec!(-1000));
        assert_eq!(state.return_pct, dec!(-0.1));
    }

    #[test]
    fn zero_initial_capital_guard() {
        let state = compute_state(&bot(dec!(0), dec!(0)), vec![], 0, Decimal::ZERO);
        assert_eq!(state.return_pct, Decimal::ZERO);
    }

    #[test]
    fn position_lookup_by_symbol() {
        let position = open_position(dec!(100), dec!(100), dec!(1));
        let state = compute_state(&bot(dec!(1000), dec!(900)), vec![position], 0, Decimal::ZERO);
        assert!(state.position_for("BTC/USDT").is_some());
        assert!(state.position_for("ETH/USDT").is_none());
    }
}
