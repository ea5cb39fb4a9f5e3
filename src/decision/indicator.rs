// =============================================================================
// Indicator decision block — legacy single-indicator rules
// =============================================================================
//
// Entries:
//   - pullback: price > EMA-50, EMA-9 > EMA-21, RSI-14 < 40,
//     volume > 0.8 x volume MA
//   - breakout: close > 20-period high, RSI-14 > 60, volume > volume MA
//
// Exits for open longs: hard stop -2.5% and target +5% are written onto the
// position at entry (the monitor enforces them); a 24 h time-stop and
// RSI-14 > 80 emit close signals here.
// =============================================================================

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use crate::db::Bot;
use crate::decision::{DecisionBlock, TradingSignal};
use crate::indicators::sma::rolling_high;
use crate::market_data::MarketSnapshot;
use crate::portfolio::PortfolioState;
use crate::types::{DecisionMode, Side, SignalType};

/// Hard stop distance for legacy entries.
const STOP_PCT: Decimal = dec!(0.025);
/// Profit target for legacy entries.
const TARGET_PCT: Decimal = dec!(0.05);
/// Size fraction for legacy entries.
const SIZE_PCT: Decimal = dec!(0.02);
/// Hours before the time-stop closes a position.
const TIME_STOP_HOURS: i64 = 24;
/// RSI level that forces an exit.
const EXIT_RSI: f64 = 80.0;

/// The legacy single-indicator scorer.
#[derive(Debug, Default)]
pub struct IndicatorDecisionBlock;

impl IndicatorDecisionBlock {
    pub fn new() -> Self {
        Self
    }

    fn entry_signal(snapshot: &MarketSnapshot) -> TradingSignal {
        let ind = &snapshot.indicators;
        let price = snapshot.last_close();
        let volume = snapshot.candles_1h.last().map(|c| c.volume).unwrap_or(0.0);

        let pullback = match (ind.ema_50, ind.ema_9, ind.ema_21, ind.rsi_14, ind.volume_ma) {
            (Some(e50), Some(e9), Some(e21), Some(rsi), Some(vol_ma)) => {
                price > e50 && e9 > e21 && rsi < 40.0 && volume > 0.8 * vol_ma
            }
            _ => false,
        };

        let closes: Vec<f64> = snapshot.candles_1h.iter().map(|c| c.close).collect();
        let breakout = match (rolling_high(&closes, 20), ind.rsi_14, ind.volume_ma) {
            (Some(high), Some(rsi), Some(vol_ma)) => price > high && rsi > 60.0 && volume > vol_ma,
            _ => false,
        };

        let setup = if pullback {
            "pullback"
        } else if breakout {
            "breakout"
        } else {
            return TradingSignal::hold(&snapshot.symbol, "no pullback or breakout setup");
        };

        let entry = snapshot.last_price;
        TradingSignal {
            symbol: snapshot.symbol.clone(),
            signal_type: SignalType::BuyToEnter,
            side: Some(Side::Long),
            confidence: if pullback { 0.6 } else { 0.7 },
            reasoning: format!("{setup} entry"),
            entry_price: Some(entry),
            stop_loss: Some(entry * (Decimal::ONE - STOP_PCT)),
            take_profit: Some(entry * (Decimal::ONE + TARGET_PCT)),
            size_pct: SIZE_PCT,
            leverage: 1,
        }
    }
}

#[async_trait]
impl DecisionBlock for IndicatorDecisionBlock {
    fn mode(&self) -> DecisionMode {
        DecisionMode::Indicator
    }

    async fn decide(
        &self,
        _bot: &Bot,
        snapshots: &BTreeMap<String, MarketSnapshot>,
        portfolio: &PortfolioState,
    ) -> BTreeMap<String, TradingSignal> {
        let mut signals = BTreeMap::new();

        for (symbol, snapshot) in snapshots {
            let signal = match portfolio.position_for(symbol) {
                Some(position) => {
                    let age = Utc::now() - position.opened_at;
                    let overbought = snapshot
                        .indicators
                        .rsi_14
                        .is_some_and(|rsi| rsi > EXIT_RSI);

                    if age > Duration::hours(TIME_STOP_HOURS) {
                        close_signal(symbol, "24h time-stop")
                    } else if overbought {
                        close_signal(symbol, "RSI-14 above 80")
                    } else {
                        TradingSignal::hold(symbol, "holding open position")
                    }
                }
                None => Self::entry_signal(snapshot),
            };

            debug!(symbol = %symbol, signal = %signal.signal_type, "indicator decision");
            signals.insert(symbol.clone(), signal);
        }

        signals
    }
}

fn close_signal(symbol: &str, reason: &str) -> TradingSignal {
    TradingSignal {
        symbol: symbol.to_string(),
        signal_type: SignalType::Close,
        side: Some(Side::Long),
        confidence: 0.7,
        reasoning: reason.to_string(),
        entry_price: None,
        stop_loss: None,
        take_profit: None,
        size_pct: Decimal::ZERO,
        leverage: 1,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Candle;
    use crate::market_data::{EntrySignals, IndicatorBundle};

    fn candle(close: f64, volume: f64) -> Candle {
        Candle {
            open_time: 0,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume,
        }
    }

    fn snapshot_with(ind: IndicatorBundle, candles: Vec<Candle>, last: Decimal) -> MarketSnapshot {
        MarketSnapshot {
            symbol: "ETH/USDT".into(),
            last_price: last,
            change_24h_pct: 0.0,
            volume_24h: 0.0,
            candles_1h: candles,
            candles_5m: Vec::new(),
            indicators: ind,
            signals: EntrySignals::default(),
            confluence_score: 0.0,
            closes_tail: Vec::new(),
            ema_tail: Vec::new(),
            rsi_tail: Vec::new(),
            funding_rate: None,
        }
    }

    #[test]
    fn pullback_entry_fires() {
        let mut candles: Vec<Candle> = (0..40).map(|_| candle(100.0, 50.0)).collect();
        candles.push(candle(105.0, 60.0));
        let ind = IndicatorBundle {
            ema_50: Some(100.0),
            ema_9: Some(104.0),
            ema_21: Some(102.0),
            rsi_14: Some(35.0),
            volume_ma: Some(50.0),
            ..IndicatorBundle::default()
        };
        let signal = IndicatorDecisionBlock::entry_signal(&snapshot_with(ind, candles, dec!(105)));
        assert_eq!(signal.signal_type, SignalType::BuyToEnter);
        assert_eq!(signal.reasoning, "pullback entry");
        assert_eq!(signal.stop_loss, Some(dec!(105) * dec!(0.975)));
        assert_eq!(signal.take_profit, Some(dec!(105) * dec!(1.05)));
        assert!(signal.geometry_ok());
    }

    #[test]
    fn breakout_entry_fires() {
        // Flat closes at 100, last close breaks to 110 on volume.
        let mut candles: Vec<Candle> = (0..40).map(|_| candle(100.0, 50.0)).collect();
        candles.push(candle(110.0, 120.0));
        let ind = IndicatorBundle {
            // Pullback preconditions broken (RSI high), breakout ones met.
            ema_50: Some(100.0),
            ema_9: Some(101.0),
            ema_21: Some(100.5),
            rsi_14: Some(65.0),
            volume_ma: Some(50.0),
            ..IndicatorBundle::default()
        };
        let signal = IndicatorDecisionBlock::entry_signal(&snapshot_with(ind, candles, dec!(110)));
        assert_eq!(signal.signal_type, SignalType::BuyToEnter);
        assert_eq!(signal.reasoning, "breakout entry");
    }

    #[test]
    fn no_setup_holds() {
        let candles: Vec<Candle> = (0..40).map(|_| candle(100.0, 50.0)).collect();
        let ind = IndicatorBundle {
            ema_50: Some(100.0),
            ema_9: Some(99.0), // EMA stack not aligned
            ema_21: Some(100.5),
            rsi_14: Some(50.0),
            volume_ma: Some(50.0),
            ..IndicatorBundle::default()
        };
        let signal = IndicatorDecisionBlock::entry_signal(&snapshot_with(ind, candles, dec!(100)));
        assert_eq!(signal.signal_type, SignalType::Hold);
    }

    #[test]
    fn missing_indicators_hold() {
        let signal = IndicatorDecisionBlock::entry_signal(&snapshot_with(
            IndicatorBundle::default(),
            Vec::new(),
            dec!(100),
        ));
        assert_eq!(signal.signal_type, SignalType::Hold);
    }
}
