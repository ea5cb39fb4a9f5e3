// =============================================================================
// Trinity decision block — deterministic five-condition confluence engine
// =============================================================================
//
// Entry conditions per symbol (evaluated by MarketDataBlock):
//   1. regime_ok     price > SMA-200
//   2. trend_strong  ADX > 25
//   3. bounce        price back above EMA-20 after a recent dip
//   4. oversold      RSI-14 < 40
//   5. volume_ok     volume > volume MA
//
// Emission: >= 4 met -> long at confidence met/5, 3% of capital;
//           exactly 3 -> long at 0.60, 2%; otherwise hold.
//
// Open longs exit on any of: Supertrend turns red, close below SMA-200,
// RSI-14 above 75 (close at confidence 0.7).
//
// Stops: max(Supertrend line, entry * (1 - stop_loss_pct)) — the tighter
// stop wins; target entry * (1 + take_profit_pct). Shorts stay in the type
// system but this block never emits them.
// =============================================================================

use std::collections::BTreeMap;

use async_trait::async_trait;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use crate::db::{Bot, RiskParams};
use crate::decision::{DecisionBlock, TradingSignal};
use crate::indicators::TrendColor;
use crate::market_data::MarketSnapshot;
use crate::portfolio::PortfolioState;
use crate::types::{DecisionMode, Side, SignalType};

/// Size fractions for the two entry tiers.
const SIZE_PCT_STRONG: Decimal = dec!(0.03);
const SIZE_PCT_MODERATE: Decimal = dec!(0.02);
/// Confidence for the three-signal tier and for exits.
const MODERATE_CONFIDENCE: f64 = 0.60;
const EXIT_CONFIDENCE: f64 = 0.7;
/// RSI level treated as overbought on an open long.
const EXIT_RSI: f64 = 75.0;

/// The default, indicator-only decision block.
#[derive(Debug, Default)]
pub struct TrinityDecisionBlock;

impl TrinityDecisionBlock {
    pub fn new() -> Self {
        Self
    }

    /// Exit check for an existing open long.
    fn exit_signal(snapshot: &MarketSnapshot) -> Option<String> {
        if let Some(st) = snapshot.indicators.supertrend {
            if st.color == TrendColor::Red {
                return Some("supertrend turned red".to_string());
            }
        }
        if let Some(sma) = snapshot.indicators.sma_200 {
            if snapshot.last_close() < sma {
                return Some("close below SMA-200".to_string());
            }
        }
        if let Some(rsi) = snapshot.indicators.rsi_14 {
            if rsi > EXIT_RSI {
                return Some(format!("RSI-14 overbought at {rsi:.1}"));
            }
        }
        None
    }

    /// Entry evaluation against the five conditions.
    fn entry_signal(snapshot: &MarketSnapshot, params: &RiskParams) -> TradingSignal {
        let met = snapshot.signals.met();
        let confluence = snapshot.confluence_score;

        let (confidence, size_pct) = match met {
            m if m >= 4 => (m as f64 / 5.0, SIZE_PCT_STRONG),
            3 => (MODERATE_CONFIDENCE, SIZE_PCT_MODERATE),
            _ => {
                return TradingSignal::hold(
                    &snapshot.symbol,
                    format!("{met}/5 signals, confluence {confluence:.0}"),
                );
            }
        };

        let entry = snapshot.last_price;
        let stop_loss = stop_for_long(entry, snapshot, params);
        let take_profit = entry * (Decimal::ONE + params.take_profit_pct);

        TradingSignal {
            symbol: snapshot.symbol.clone(),
            signal_type: SignalType::BuyToEnter,
            side: Some(Side::Long),
            confidence,
            reasoning: format!("{met}/5 signals met, confluence {confluence:.0}"),
            entry_price: Some(entry),
            stop_loss: Some(stop_loss),
            take_profit: Some(take_profit),
            size_pct,
            leverage: 1,
        }
    }
}

/// Long stop: the tighter of the Supertrend line and the percentage stop.
/// A Supertrend line at or above entry cannot be a stop and falls back to
/// the percentage.
fn stop_for_long(entry: Decimal, snapshot: &MarketSnapshot, params: &RiskParams) -> Decimal {
    let pct_stop = entry * (Decimal::ONE - params.stop_loss_pct);

    let supertrend_stop = snapshot
        .indicators
        .supertrend
        .and_then(|st| Decimal::from_f64(st.value))
        .filter(|line| *line < entry);

    match supertrend_stop {
        Some(line) => pct_stop.max(line),
        None => pct_stop,
    }
}

#[async_trait]
impl DecisionBlock for TrinityDecisionBlock {
    fn mode(&self) -> DecisionMode {
        DecisionMode::Trinity
    }

    async fn decide(
        &self,
        bot: &Bot,
        snapshots: &BTreeMap<String, MarketSnapshot>,
        portfolio: &PortfolioState,
    ) -> BTreeMap<String, TradingSignal> {
        let params = &bot.risk_params;
        let mut signals = BTreeMap::new();

        for (symbol, snapshot) in snapshots {
            let signal = match portfolio.position_for(symbol) {
                Some(position) if position.side == Side::Long => {
                    match Self::exit_signal(snapshot) {
                        Some(reason) => TradingSignal {
                            symbol: symbol.clone(),
                            signal_type: SignalType::Close,
                            side: Some(Side::Long),
                            confidence: EXIT_CONFIDENCE,
                            reasoning: reason,
                            entry_price: None,
                            stop_loss: None,
                            take_profit: None,
                            size_pct: Decimal::ZERO,
                            leverage: 1,
                        },
                        None => TradingSignal::hold(symbol, "holding open long"),
                    }
                }
                Some(_) => TradingSignal::hold(symbol, "open short managed by monitor"),
                None => Self::entry_signal(snapshot, params),
            };

            debug!(
                symbol = %symbol,
                signal = %signal.signal_type,
                confidence = signal.confidence,
                "trinity decision"
            );
            signals.insert(symbol.clone(), signal);
        }

        signals
    }
}
