// =============================================================================
// Risk Block — ordered entry validation and Kelly-tempered sizing
// =============================================================================
//
// Ten checks run in a fixed order; the first failure short-circuits with a
// machine-readable reason and the orchestrator skips the trade (explicit
// continue, never fall-through into execution):
//
//    1. status gate          6. position cap (clamp inside 1.2x, else reject)
//    2. daily breakers       7. exposure cap
//    3. drawdown             8. SL/TP geometry
//    4. duplicate position   9. risk/reward floor
//    5. notional floor      10. leverage caps (5 long / 3 short)
//
// Sizing: base = size_pct x equity. With >= 20 recorded outcomes for the
// symbol a quarter-Kelly fraction is computed from the win rate and average
// win/loss magnitudes, clamped to [0.01, max_position_pct]; the final size
// is min(base, kelly).
// =============================================================================

use std::sync::Arc;

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info};

use crate::db::Bot;
use crate::decision::TradingSignal;
use crate::memory::{TradeMemory, MIN_OBSERVATIONS_FOR_KELLY};
use crate::portfolio::PortfolioState;
use crate::types::{BotStatus, Side};

/// Leverage ceilings per side.
const MAX_LEVERAGE_LONG: u32 = 5;
const MAX_LEVERAGE_SHORT: u32 = 3;
/// Oversize band inside which the position cap clamps instead of rejecting.
const CLAMP_BAND: Decimal = dec!(1.2);
/// Quarter-Kelly scaling.
const KELLY_FRACTION: f64 = 0.25;
/// Lower clamp for the Kelly fraction.
const KELLY_MIN: Decimal = dec!(0.01);

/// Outcome of risk validation.
#[derive(Debug, Clone)]
pub struct RiskVerdict {
    pub valid: bool,
    /// Machine-readable reason tag when invalid ("exposure_cap", ...).
    pub reason: String,
    /// The signal with any clamps and Kelly sizing applied.
    pub signal: TradingSignal,
}

impl RiskVerdict {
    fn reject(signal: &TradingSignal, reason: &str) -> Self {
        Self {
            valid: false,
            reason: reason.to_string(),
            signal: signal.clone(),
        }
    }

    fn accept(signal: TradingSignal) -> Self {
        Self {
            valid: true,
            reason: String::new(),
            signal,
        }
    }
}

/// Validates entry signals and computes final sizes.
pub struct RiskBlock {
    memory: Arc<TradeMemory>,
}

impl RiskBlock {
    pub fn new(memory: Arc<TradeMemory>) -> Self {
        Self { memory }
    }

    /// Run the ordered checks. Non-entry signals pass through untouched.
    pub async fn validate(
        &self,
        signal: &TradingSignal,
        portfolio: &PortfolioState,
        bot: &Bot,
    ) -> RiskVerdict {
        if !signal.is_entry() {
            return RiskVerdict::accept(signal.clone());
        }

        let params = &bot.risk_params;
        let equity = portfolio.equity;

        // --- 1. Status gate ---------------------------------------------
        if bot.status != BotStatus::Active {
            return RiskVerdict::reject(signal, "bot_inactive");
        }

        // --- 2. Daily circuit breakers -----------------------------------
        if portfolio.trades_today >= params.max_trades_per_day {
            return RiskVerdict::reject(signal, "daily_trade_limit");
        }
        if portfolio.realized_pnl_today <= params.max_daily_loss_usd {
            return RiskVerdict::reject(signal, "daily_loss_limit");
        }

        // --- 3. Drawdown --------------------------------------------------
        if !bot.initial_capital.is_zero() {
            let drawdown = (bot.initial_capital - equity) / bot.initial_capital;
            if drawdown >= params.max_drawdown_pct {
                return RiskVerdict::reject(signal, "drawdown_limit");
            }
        }

        // --- 4. Duplicate position ---------------------------------------
        if portfolio.position_for(&signal.symbol).is_some() {
            return RiskVerdict::reject(signal, "duplicate_position");
        }

        // --- 5. Notional floor --------------------------------------------
        let mut adjusted = signal.clone();
        let notional = adjusted.size_pct * equity;
        if notional < params.min_notional_usd {
            return RiskVerdict::reject(signal, "notional_floor");
        }

        // --- 6. Position cap (clamp inside the band) ----------------------
        if adjusted.size_pct > params.max_position_pct {
            if adjusted.size_pct <= params.max_position_pct * CLAMP_BAND {
                debug!(
                    symbol = %adjusted.symbol,
                    requested = %adjusted.size_pct,
                    cap = %params.max_position_pct,
                    "position size clamped to cap"
                );
                adjusted.size_pct = params.max_position_pct;
            } else {
                return RiskVerdict::reject(signal, "position_cap");
            }
        }

        // --- 7. Exposure cap ----------------------------------------------
        let new_notional = adjusted.size_pct * equity;
        let exposure = portfolio.open_exposure() + new_notional;
        if exposure > params.max_exposure_pct * equity {
            return RiskVerdict::reject(signal, "exposure_cap");
        }

        // --- 8. SL/TP geometry --------------------------------------------
        if !adjusted.geometry_ok() {
            return RiskVerdict::reject(signal, "sl_tp_geometry");
        }

        // --- 9. Risk/reward floor -----------------------------------------
        let (entry, sl, tp) = (
            adjusted.entry_price.expect("geometry checked"),
            adjusted.stop_loss.expect("geometry checked"),
            adjusted.take_profit.expect("geometry checked"),
        );
        let risk = (entry - sl).abs();
        let reward = (tp - entry).abs();
        if risk.is_zero() || reward / risk < params.min_risk_reward {
            return RiskVerdict::reject(signal, "risk_reward");
        }

        // --- 10. Leverage caps --------------------------------------------
        let leverage_cap = match adjusted.side {
            Some(Side::Short) => MAX_LEVERAGE_SHORT,
            _ => MAX_LEVERAGE_LONG,
        };
        if adjusted.leverage > leverage_cap {
            return RiskVerdict::reject(signal, "leverage_cap");
        }

        // --- Sizing --------------------------------------------------------
        let sized = self.apply_kelly(adjusted, bot).await;
        RiskVerdict::accept(sized)
    }

    /// Temper the base size with quarter-Kelly once the symbol has enough
    /// recorded history.
    async fn apply_kelly(&self, mut signal: TradingSignal, bot: &Bot) -> TradingSignal {
        let stats = self.memory.stats(bot.id, &signal.symbol).await;
        if stats.observations() < MIN_OBSERVATIONS_FOR_KELLY {
            return signal;
        }

        let Some(kelly) = kelly_fraction(
            stats.win_rate(),
            stats.avg_win_pct(),
            stats.avg_loss_pct(),
        ) else {
            return signal;
        };

        let quarter = kelly * KELLY_FRACTION;
        let clamped = Decimal::from_f64(quarter)
            .unwrap_or(KELLY_MIN)
            .clamp(KELLY_MIN, bot.risk_params.max_position_pct);

        if clamped < signal.size_pct {
            info!(
                symbol = %signal.symbol,
                base = %signal.size_pct,
                kelly = %clamped,
                win_rate = stats.win_rate(),
                "kelly sizing reduced position"
            );
            signal.size_pct = clamped;
        }
        signal
    }
}

/// Full Kelly fraction f* = (p*W - (1-p)*L) / W. `None` when the inputs
/// cannot support the formula (no winning history).
fn kelly_fraction(win_rate: f64, avg_win_pct: f64, avg_loss_pct: f64) -> Option<f64> {
    if avg_win_pct <= 0.0 {
        return None;
    }
    let f = (win_rate * avg_win_pct - (1.0 - win_rate) * avg_loss_pct) / avg_win_pct;
    f.is_finite().then_some(f)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::db::{Position, RiskParams};
    use crate::portfolio::compute_state;
    use crate::types::{DecisionMode, PositionStatus, SignalType};
    use chrono::Utc;
    use uuid::Uuid;

    fn bot_with(capital: Decimal) -> Bot {
        Bot {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "risk-test".into(),
            status: BotStatus::Active,
            initial_capital: capital,
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

    fn entry_signal(size_pct: Decimal) -> TradingSignal {
        TradingSignal {
            symbol: "BTC/USDT".into(),
            signal_type: SignalType::BuyToEnter,
            side: Some(Side::Long),
            confidence: 0.8,
            reasoning: "test".into(),
            entry_price: Some(dec!(42000)),
            stop_loss: Some(dec!(41000)),
            take_profit: Some(dec!(44940)),
            size_pct,
            leverage: 1,
        }
    }

    fn open_position(bot_id: Uuid, symbol: &str, notional: Decimal) -> Position {
        let entry = dec!(1000);
        Position {
            id: Uuid::new_v4(),
            bot_id,
            symbol: symbol.into(),
            side: Side::Long,
            quantity: notional / entry,
            entry_price: entry,
            current_price: entry,
            stop_loss: dec!(970),
            take_profit: dec!(1070),
            realized_pnl: Decimal::ZERO,
            status: PositionStatus::Open,
            opened_at: Utc::now(),
            closed_at: None,
            close_reason: None,
        }
    }

    fn risk_block() -> RiskBlock {
        RiskBlock::new(Arc::new(TradeMemory::new(Arc::new(MemoryCache::new()))))
    }

    #[tokio::test]
    async fn clean_entry_passes() {
        let bot = bot_with(dec!(10000));
        let portfolio = compute_state(&bot, vec![], 0, Decimal::ZERO);
        let verdict = risk_block()
            .validate(&entry_signal(dec!(0.03)), &portfolio, &bot)
            .await;
        assert!(verdict.valid, "rejected with: {}", verdict.reason);
        assert_eq!(verdict.signal.size_pct, dec!(0.03));
    }

    #[tokio::test]
    async fn non_entry_passes_through() {
        let bot = bot_with(dec!(10000));
        let portfolio = compute_state(&bot, vec![], 0, Decimal::ZERO);
        let hold = TradingSignal::hold("BTC/USDT", "nothing");
        let verdict = risk_block().validate(&hold, &portfolio, &bot).await;
        assert!(verdict.valid);
    }

    #[tokio::test]
    async fn paused_bot_rejected() {
        let mut bot = bot_with(dec!(10000));
        bot.status = BotStatus::Paused;
        let portfolio = compute_state(&bot, vec![], 0, Decimal::ZERO);
        let verdict = risk_block()
            .validate(&entry_signal(dec!(0.03)), &portfolio, &bot)
            .await;
        assert!(!verdict.valid);
        assert_eq!(verdict.reason, "bot_inactive");
    }

    #[tokio::test]
    async fn daily_trade_limit_rejects() {
        let bot = bot_with(dec!(10000));
        let portfolio = compute_state(&bot, vec![], 50, Decimal::ZERO);
        let verdict = risk_block()
            .validate(&entry_signal(dec!(0.03)), &portfolio, &bot)
            .await;
        assert_eq!(verdict.reason, "daily_trade_limit");
    }

    #[tokio::test]
    async fn zero_trade_limit_blocks_every_entry() {
        let mut bot = bot_with(dec!(10000));
        bot.risk_params.max_trades_per_day = 0;
        let portfolio = compute_state(&bot, vec![], 0, Decimal::ZERO);
        let verdict = risk_block()
            .validate(&entry_signal(dec!(0.03)), &portfolio, &bot)
            .await;
        assert_eq!(verdict.reason, "daily_trade_limit");
    }

    #[tokio::test]
    async fn daily_loss_breaker_rejects() {
        let bot = bot_with(dec!(10000));
        let portfolio = compute_state(&bot, vec![], 0, dec!(-150));
        let verdict = risk_block()
            .validate(&entry_signal(dec!(0.03)), &portfolio, &bot)
            .await;
        assert_eq!(verdict.reason, "daily_loss_limit");
    }

    #[tokio::test]
    async fn drawdown_rejects() {
        let mut bot = bot_with(dec!(10000));
        bot.capital = dec!(7500); // 25% below initial
        let portfolio = compute_state(&bot, vec![], 0, Decimal::ZERO);
        let verdict = risk_block()
            .validate(&entry_signal(dec!(0.03)), &portfolio, &bot)
            .await;
        assert_eq!(verdict.reason, "drawdown_limit");
    }

    #[tokio::test]
    async fn duplicate_position_rejects() {
        let bot = bot_with(dec!(10000));
        let position = open_position(bot.id, "BTC/USDT", dec!(300));
        let mut adjusted_bot = bot.clone();
        adjusted_bot.capital = dec!(9700);
        let portfolio = compute_state(&adjusted_bot, vec![position], 1, Decimal::ZERO);
        let verdict = risk_block()
            .validate(&entry_signal(dec!(0.03)), &portfolio, &adjusted_bot)
            .await;
        assert_eq!(verdict.reason, "duplicate_position");
    }

    #[tokio::test]
    async fn notional_floor_rejects_tiny_orders() {
        let bot = bot_with(dec!(1000));
        let portfolio = compute_state(&bot, vec![], 0, Decimal::ZERO);
        // 0.3% of $1000 = $3 < $50 floor.
        let verdict = risk_block()
            .validate(&entry_signal(dec!(0.003)), &portfolio, &bot)
            .await;
        assert_eq!(verdict.reason, "notional_floor");
    }

    #[tokio::test]
    async fn oversize_inside_band_clamps() {
        let bot = bot_with(dec!(10000));
        let portfolio = compute_state(&bot, vec![], 0, Decimal::ZERO);
        // 0.17 <= 0.15 * 1.2 = 0.18: clamp, not reject.
        let verdict = risk_block()
            .validate(&entry_signal(dec!(0.17)), &portfolio, &bot)
            .await;
        assert!(verdict.valid);
        assert_eq!(verdict.signal.size_pct, dec!(0.15));
    }

    #[tokio::test]
    async fn oversize_beyond_band_rejects() {
        let bot = bot_with(dec!(10000));
        let portfolio = compute_state(&bot, vec![], 0, Decimal::ZERO);
        let verdict = risk_block()
            .validate(&entry_signal(dec!(0.25)), &portfolio, &bot)
            .await;
        assert_eq!(verdict.reason, "position_cap");
    }

    #[tokio::test]
    async fn exposure_cap_rejects() {
        // $10,000 equity, $8,500 already deployed, new $300 breaches 85%.
        let bot = bot_with(dec!(10000));
        let position = open_position(bot.id, "ETH/USDT", dec!(8500));
        let mut adjusted_bot = bot.clone();
        adjusted_bot.capital = dec!(1500);
        let portfolio = compute_state(&adjusted_bot, vec![position], 1, Decimal::ZERO);
        assert_eq!(portfolio.equity, dec!(10000));

        let verdict = risk_block()
            .validate(&entry_signal(dec!(0.03)), &portfolio, &adjusted_bot)
            .await;
        assert!(!verdict.valid);
        assert_eq!(verdict.reason, "exposure_cap");
    }

    #[tokio::test]
    async fn bad_geometry_rejects() {
        let bot = bot_with(dec!(10000));
        let portfolio = compute_state(&bot, vec![], 0, Decimal::ZERO);
        let mut signal = entry_signal(dec!(0.03));
        signal.stop_loss = Some(dec!(43000)); // above entry on a long
        let verdict = risk_block().validate(&signal, &portfolio, &bot).await;
        assert_eq!(verdict.reason, "sl_tp_geometry");
    }

    #[tokio::test]
    async fn poor_risk_reward_rejects() {
        let bot = bot_with(dec!(10000));
        let portfolio = compute_state(&bot, vec![], 0, Decimal::ZERO);
        let mut signal = entry_signal(dec!(0.03));
        // Risk 1000, reward 500: ratio 0.5 < 1.3.
        signal.take_profit = Some(dec!(42500));
        let verdict = risk_block().validate(&signal, &portfolio, &bot).await;
        assert_eq!(verdict.reason, "risk_reward");
    }

    #[tokio::test]
    async fn leverage_caps_by_side() {
        let bot = bot_with(dec!(10000));
        let portfolio = compute_state(&bot, vec![], 0, Decimal::ZERO);

        let mut long = entry_signal(dec!(0.03));
        long.leverage = 6;
        let verdict = risk_block().validate(&long, &portfolio, &bot).await;
        assert_eq!(verdict.reason, "leverage_cap");

        let mut short = entry_signal(dec!(0.03));
        short.signal_type = SignalType::SellToEnter;
        short.side = Some(Side::Short);
        short.stop_loss = Some(dec!(43000));
        short.take_profit = Some(dec!(40000));
        short.leverage = 4;
        let verdict = risk_block().validate(&short, &portfolio, &bot).await;
        assert_eq!(verdict.reason, "leverage_cap");

        short.leverage = 3;
        let verdict = risk_block().validate(&short, &portfolio, &bot).await;
        assert!(verdict.valid, "rejected with: {}", verdict.reason);
    }

    #[tokio::test]
    async fn kelly_reduces_base_after_history() {
        let cache = Arc::new(MemoryCache::new());
        let memory = Arc::new(TradeMemory::new(cache));
        let bot = bot_with(dec!(10000));

        // Mediocre record: 40% winners at +2%, losers at -2%.
        for i in 0..25 {
            if i % 5 < 2 {
                memory.record(bot.id, "BTC/USDT", dec!(20), 0.02).await;
            } else {
                memory.record(bot.id, "BTC/USDT", dec!(-20), -0.02).await;
            }
        }

        let block = RiskBlock::new(memory);
        let portfolio = compute_state(&bot, vec![], 0, Decimal::ZERO);
        let verdict = block.validate(&entry_signal(dec!(0.03)), &portfolio, &bot).await;

        assert!(verdict.valid);
        // Negative-edge Kelly clamps to the 1% floor, below the 3% base.
        assert_eq!(verdict.signal.size_pct, dec!(0.01));
    }

    #[test]
    fn kelly_formula() {
        // p=0.6, W=0.04, L=0.02: f* = (0.024 - 0.008) / 0.04 = 0.4
        let f = kelly_fraction(0.6, 0.04, 0.02).unwrap();
        assert!((f - 0.4).abs() < 1e-12);
        // No winning history: undefined.
        assert!(kelly_fraction(0.5, 0.0, 0.02).is_none());
    }
}
