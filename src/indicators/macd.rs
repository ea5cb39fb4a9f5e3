// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
//   macd      = EMA(fast) - EMA(slow)
//   signal    = EMA(signal_period) of the macd line
//   histogram = macd - signal
//
// Standard parameters are 12 / 26 / 9.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::indicators::ema::calculate_ema;

/// Most recent MACD reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Macd {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Compute the latest MACD with explicit periods.
///
/// Returns `None` when the input is too short to produce a signal value
/// (needs `slow + signal_period - 1` closes).
pub fn calculate_macd(
    closes: &[f64],
    fast: usize,
    slow: usize,
    signal_period: usize,
) -> Option<Macd> {
    if fast == 0 || slow == 0 || signal_period == 0 || fast >= slow {
        return None;
    }

    let fast_series = calculate_ema(closes, fast);
    let slow_series = calculate_ema(closes, slow);
    if slow_series.is_empty() {
        return None;
    }

    // Align the two series on their tails: the slow series is shorter by
    // (slow - fast) leading values.
    let offset = fast_series.len().checked_sub(slow_series.len())?;
    let macd_line: Vec<f64> = slow_series
        .iter()
        .enumerate()
        .map(|(i, slow_v)| fast_series[i + offset] - slow_v)
        .collect();

    let signal_series = calculate_ema(&macd_line, signal_period);
    let signal = *signal_series.last()?;
    let macd = *macd_line.last()?;

    Some(Macd {
        macd,
        signal,
        histogram: macd - signal,
    })
}

/// MACD with the standard 12 / 26 / 9 parameters.
pub fn calculate(closes: &[f64]) -> Option<Macd> {
    calculate_macd(closes, 12, 26, 9)
}
