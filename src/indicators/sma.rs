// =============================================================================
// Simple Moving Average (SMA) and Volume Moving Average
// =============================================================================
//
// SMA(period) is the arithmetic mean of the last `period` closes. The volume
// moving average applies the same kernel to candle volumes and backs the
// volume-confirmation entry signal.
// =============================================================================

use crate::exchange::Candle;

/// Mean of the last `period` values of `series`.
///
/// # Edge cases
/// - `period == 0` or `series.len() < period` => `None`
/// - Non-finite mean => `None`
pub fn calculate_sma(series: &[f64], period: usize) -> Option<f64> {
    if period == 0 || series.len() < period {
        return None;
    }

    let sum: f64 = series[series.len() - period..].iter().sum();
    let sma = sum / period as f64;
    sma.is_finite().then_some(sma)
}

/// Moving average of candle volume over the last `period` candles.
pub fn calculate_volume_ma(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period {
        return None;
    }

    let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();
    calculate_sma(&volumes, period)
}

/// Highest close over the last `period` candles, excluding the current one.
///
/// Used by the breakout rule: "close > 20-period high" compares the latest
/// close against the high-water mark of the preceding window.
pub fn rolling_high(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let window = &closes[closes.len() - 1 - period..closes.len() - 1];
    let high = window.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    high.is_finite().then_some(high)
}
