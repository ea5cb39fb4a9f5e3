// =============================================================================
// Market snapshot — the per-symbol, per-cycle data bundle
// =============================================================================
//
// Ephemeral: built once per cycle, consumed by the monitor and the decision
// blocks, then dropped. Prices entering monetary math are Decimal; indicator
// values stay f64.
// =============================================================================

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::exchange::Candle;
use crate::indicators::macd::Macd;
use crate::indicators::{confluence_score, Supertrend};

/// Derived indicator bundle over the 1h series. Cached as one unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndicatorBundle {
    /// `None` when fewer than 200 candles were available.
    pub sma_200: Option<f64>,
    pub ema_9: Option<f64>,
    pub ema_20: Option<f64>,
    pub ema_21: Option<f64>,
    pub ema_50: Option<f64>,
    pub rsi_7: Option<f64>,
    pub rsi_14: Option<f64>,
    pub adx: Option<f64>,
    pub atr: Option<f64>,
    pub supertrend: Option<Supertrend>,
    pub volume_ma: Option<f64>,
    pub macd: Option<Macd>,
}

/// The five boolean entry conditions. `None` marks a condition that could
/// not be evaluated (insufficient data) and is excluded from the confluence
/// denominator.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EntrySignals {
    /// Price above SMA-200.
    pub regime_ok: Option<bool>,
    /// ADX above 25.
    pub trend_strong: Option<bool>,
    /// Price back above EMA-20 after a recent dip below it.
    pub bounce: Option<bool>,
    /// RSI-14 below 40.
    pub oversold: Option<bool>,
    /// Volume above its moving average.
    pub volume_ok: Option<bool>,
}

impl EntrySignals {
    /// Conditions in their canonical order.
    pub fn conditions(&self) -> [Option<bool>; 5] {
        [
            self.regime_ok,
            self.trend_strong,
            self.bounce,
            self.oversold,
            self.volume_ok,
        ]
    }

    /// Count of satisfied conditions.
    pub fn met(&self) -> usize {
        self.conditions().iter().filter(|s| **s == Some(true)).count()
    }

    /// Confluence score over the evaluated conditions.
    pub fn confluence(&self) -> f64 {
        confluence_score(&self.conditions())
    }
}

/// Per-symbol observation assembled each cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    /// Spot price from the ticker.
    pub last_price: Decimal,
    pub change_24h_pct: f64,
    pub volume_24h: f64,
    /// 1h window, oldest first (>= 250 candles when available).
    pub candles_1h: Vec<Candle>,
    /// 5m window, oldest first (~100 candles).
    pub candles_5m: Vec<Candle>,
    pub indicators: IndicatorBundle,
    pub signals: EntrySignals,
    /// met / evaluated * 100, in [0, 100].
    pub confluence_score: f64,
    /// Short tail series for prompt context (last 10 values each).
    pub closes_tail: Vec<f64>,
    pub ema_tail: Vec<f64>,
    pub rsi_tail: Vec<f64>,
    /// Perpetual funding rate when the venue has one.
    pub funding_rate: Option<Decimal>,
}

impl MarketSnapshot {
    /// Spot price as f64 for comparisons against indicator values.
    pub fn price_f64(&self) -> f64 {
        self.last_price.to_f64().unwrap_or(0.0)
    }

    /// Last 1h close, falling back to the ticker price.
    pub fn last_close(&self) -> f64 {
        self.candles_1h
            .last()
            .map(|c| c.close)
            .unwrap_or_else(|| self.price_f64())
    }
}
