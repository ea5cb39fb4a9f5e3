// =============================================================================
// Decision layer — three interchangeable blocks behind one trait
// =============================================================================
//
// Every block turns (snapshots, portfolio state) into one canonical
// `TradingSignal` per symbol. The orchestrator picks the block from the
// bot's decision mode each cycle, so a mode switch on the bot row takes
// effect on the next cycle without a restart.
// =============================================================================

pub mod indicator;
pub mod llm;
pub mod parser;
pub mod prompt;
pub mod trinity;

use std::collections::BTreeMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::db::Bot;
use crate::market_data::MarketSnapshot;
use crate::portfolio::PortfolioState;
use crate::types::{DecisionMode, Side, SignalType};

pub use indicator::IndicatorDecisionBlock;
pub use llm::LlmDecisionBlock;
pub use trinity::TrinityDecisionBlock;

/// Canonical decision record consumed by Risk and Execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingSignal {
    pub symbol: String,
    pub signal_type: SignalType,
    /// `None` for holds.
    pub side: Option<Side>,
    /// Confidence in [0, 1].
    pub confidence: f64,
    pub reasoning: String,
    pub entry_price: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    /// Fraction of capital to commit, in [0, max_position_pct].
    pub size_pct: Decimal,
    pub leverage: u32,
}

impl TradingSignal {
    /// A hold with an explanatory reason.
    pub fn hold(symbol: impl Into<String>, reasoning: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            signal_type: SignalType::Hold,
            side: None,
            confidence: 0.0,
            reasoning: reasoning.into(),
            entry_price: None,
            stop_loss: None,
            take_profit: None,
            size_pct: Decimal::ZERO,
            leverage: 1,
        }
    }

    /// A hold at 0.5 confidence, used for parse failures and the budget
    /// short-circuit where the uncertainty is about us, not the market.
    pub fn neutral_hold(symbol: impl Into<String>, reasoning: impl Into<String>) -> Self {
        Self {
            confidence: 0.5,
            ..Self::hold(symbol, reasoning)
        }
    }

    pub fn is_entry(&self) -> bool {
        self.signal_type.is_entry()
    }

    /// Stop/target geometry consistent with the side: SL below entry below
    /// TP for longs, reversed for shorts. Holds and closes pass trivially.
    pub fn geometry_ok(&self) -> bool {
        if !self.is_entry() {
            return true;
        }
        let (Some(entry), Some(sl), Some(tp)) = (self.entry_price, self.stop_loss, self.take_profit)
        else {
            return false;
        };
        match self.side {
            Some(Side::Long) => sl < entry && entry < tp,
            Some(Side::Short) => tp < entry && entry < sl,
            None => false,
        }
    }
}

/// A decision block: one of trinity / llm / indicator.
#[async_trait]
pub trait DecisionBlock: Send + Sync {
    /// The mode tag this block answers to.
    fn mode(&self) -> DecisionMode;

    /// Produce one signal per snapshot symbol. Blocks must isolate failures
    /// per symbol; a block-level error means no signal could be produced at
    /// all (the orchestrator logs and skips the decision phase).
    async fn decide(
        &self,
        bot: &Bot,
        snapshots: &BTreeMap<String, MarketSnapshot>,
        portfolio: &PortfolioState,
    ) -> BTreeMap<String, TradingSignal>;
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn hold_constructors() {
        let hold = TradingSignal::hold("BTC/USDT", "no setup");
        assert_eq!(hold.signal_type, SignalType::Hold);
        assert_eq!(hold.confidence, 0.0);

        let neutral = TradingSignal::neutral_hold("ETH/USDT", "parse_error");
        assert_eq!(neutral.confidence, 0.5);
        assert_eq!(neutral.reasoning, "parse_error");
    }

    #[test]
    fn long_geometry() {
        let mut signal = TradingSignal::hold("BTC/USDT", "");
        signal.signal_type = SignalType::BuyToEnter;
        signal.side = Some(Side::Long);
        signal.entry_price = Some(dec!(42000));
        signal.stop_loss = Some(dec!(41000));
        signal.take_profit = Some(dec!(44940));
        assert!(signal.geometry_ok());

        // Inverted stop fails.
        signal.stop_loss = Some(dec!(43000));
        assert!(!signal.geometry_ok());
    }

    #[test]
    fn short_geometry_reversed() {
        let mut signal = TradingSignal::hold("BTC/USDT", "");
        signal.signal_type = SignalType::SellToEnter;
        signal.side = Some(Side::Short);
        signal.entry_price = Some(dec!(42000));
        signal.stop_loss = Some(dec!(43000));
        signal.take_profit = Some(dec!(40000));
        assert!(signal.geometry_ok());
    }

    #[test]
    fn hold_geometry_trivially_ok() {
        assert!(TradingSignal::hold("BTC/USDT", "").geometry_ok());
    }

    #[test]
    fn entry_without_levels_fails_geometry() {
        let mut signal = TradingSignal::hold("BTC/USDT", "");
        signal.signal_type = SignalType::BuyToEnter;
        signal.side = Some(Side::Long);
        assert!(!signal.geometry_ok());
    }
}
