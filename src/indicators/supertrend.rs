// =============================================================================
// Supertrend — ATR-based flip line with a regime colour
// =============================================================================
//
// Band construction per bar (mid = (H + L) / 2):
//
//   basic_upper = mid + multiplier * ATR
//   basic_lower = mid - multiplier * ATR
//
// Final bands ratchet: the upper band only moves down (unless price closed
// above it), the lower band only moves up (unless price closed below it).
// The trend flips when the close crosses the active band; the published
// Supertrend value is the lower band in an uptrend and the upper band in a
// downtrend.
//
// Colour: green = uptrend, red = downtrend, neutral = not yet determined.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::exchange::Candle;
use crate::indicators::atr::calculate_atr_series;

/// Default band multiplier.
pub const DEFAULT_MULTIPLIER: f64 = 3.0;

/// Regime colour of the flip line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendColor {
    Green,
    Red,
    Neutral,
}

impl std::fmt::Display for TrendColor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Green => write!(f, "green"),
            Self::Red => write!(f, "red"),
            Self::Neutral => write!(f, "neutral"),
        }
    }
}

/// Most recent Supertrend line and its colour.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Supertrend {
    pub value: f64,
    pub color: TrendColor,
}

/// Compute the most recent Supertrend value.
///
/// # Edge cases
/// - Needs at least `period + 2` candles (one ATR value plus a prior close
///   for the ratchet rules); otherwise `None`.
/// - Non-finite band values abort the calculation.
pub fn calculate_supertrend(
    candles: &[Candle],
    period: usize,
    multiplier: f64,
) -> Option<Supertrend> {
    if candles.len() < period + 2 {
        return None;
    }

    let atr_series = calculate_atr_series(candles, period);
    if atr_series.is_empty() {
        return None;
    }

    // ATR index 0 corresponds to candle index `period`.
    let start = period;

    let mut final_upper = f64::NAN;
    let mut final_lower = f64::NAN;
    let mut color = TrendColor::Neutral;
    let mut value = f64::NAN;

    for (offset, &atr) in atr_series.iter().enumerate() {
        let i = start + offset;
        let candle = &candles[i];
        let prev_close = candles[i - 1].close;

        let mid = (candle.high + candle.low) / 2.0;
        let basic_upper = mid + multiplier * atr;
        let basic_lower = mid - multiplier * atr;

        if !basic_upper.is_finite() || !basic_lower.is_finite() {
            return None;
        }

        // Ratchet rules.
        final_upper = if final_upper.is_nan() || basic_upper < final_upper || prev_close > final_upper
        {
            basic_upper
        } else {
            final_upper
        };
        final_lower = if final_lower.is_nan() || basic_lower > final_lower || prev_close < final_lower
        {
            basic_lower
        } else {
            final_lower
        };

        // Trend determination.
        color = match color {
            TrendColor::Neutral => {
                if candle.close >= mid {
                    TrendColor::Green
                } else {
                    TrendColor::Red
                }
            }
            TrendColor::Green if candle.close < final_lower => TrendColor::Red,
            TrendColor::Red if candle.close > final_upper => TrendColor::Green,
            unchanged => unchanged,
        };

        value = match color {
            TrendColor::Green => final_lower,
            TrendColor::Red => final_upper,
            TrendColor::Neutral => mid,
        };
    }

    value.is_finite().then_some(Supertrend { value, color })
}

/// Supertrend with the standard multiplier of 3.
pub fn calculate(candles: &[Candle], period: usize) -> Option<Supertrend> {
    calculate_supertrend(candles, period, DEFAULT_MULTIPLIER)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time: 0,
            open,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    fn rising(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 100.0 + i as f64 * 2.0;
                candle(base, base + 1.0, base - 1.0, base + 0.8)
            })
            .collect()
    }

    fn falling(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 200.0 - i as f64 * 2.0;
                candle(base, base + 1.0, base - 1.0, base - 0.8)
            })
            .collect()
    }

    #[test]
    fn supertrend_insufficient_data() {
        assert!(calculate(&rising(5), 10).is_none());
    }

    #[test]
    fn supertrend_uptrend_is_green_below_price() {
        let candles = rising(50);
        let st = calculate(&candles, 10).unwrap();
        assert_eq!(st.color, TrendColor::Green);
        assert!(
            st.value < candles.last().unwrap().close,
            "line {} should sit below price {}",
            st.value,
            candles.last().unwrap().close
        );
    }

    #[test]
    fn supertrend_downtrend_is_red_above_price() {
        let candles = falling(50);
        let st = calculate(&candles, 10).unwrap();
        assert_eq!(st.color, TrendColor::Red);
        assert!(
            st.value > candles.last().unwrap().close,
            "line {} should sit above price {}",
            st.value,
            candles.last().unwrap().close
        );
    }

    #[test]
    fn supertrend_flips_on_reversal() {
        // Long rise followed by a hard sell-off flips the colour to red.
        let mut candles = rising(40);
        let peak = candles.last().unwrap().close;
        for i in 0..25 {
            let base = peak - i as f64 * 6.0;
            candles.push(candle(base, base + 1.0, base - 1.0, base - 0.9));
        }
        let st = calculate(&candles, 10).unwrap();
        assert_eq!(st.color, TrendColor::Red);
    }

    #[test]
    fn supertrend_deterministic() {
        let candles = rising(60);
        assert_eq!(calculate(&candles, 10), calculate(&candles, 10));
    }
}
