// =============================================================================
// Relative Strength Index (RSI) — Wilder's smoothing
// =============================================================================
//
// RSI tracks the speed and magnitude of price changes in [0, 100].
//
//   1. Deltas between consecutive closes split into gains and losses.
//   2. Average gain/loss seeded with the SMA of the first `period` deltas.
//   3. Wilder smoothing: avg = (prev_avg * (period - 1) + current) / period
//   4. RS = avg_gain / avg_loss; RSI = 100 - 100 / (1 + RS)
//
// Undefined with fewer than `period + 1` closes.
// =============================================================================

/// Compute the RSI series for `closes` with look-back `period`.
///
/// One output value per close from index `period` onward.
///
/// # Edge cases
/// - `period == 0` or `closes.len() < period + 1` => empty vec
/// - Zero average loss clamps RSI to 100; no movement at all yields 50.
/// - A non-finite intermediate value truncates the series.
pub fn calculate_rsi(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period + 1 {
        return Vec::new();
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();

    let mut sum_gain = 0.0;
    let mut sum_loss = 0.0;
    for &d in &deltas[..period] {
        if d > 0.0 {
            sum_gain += d;
        } else {
            sum_loss += -d;
        }
    }

    let period_f = period as f64;
    let mut avg_gain = sum_gain / period_f;
    let mut avg_loss = sum_loss / period_f;

    let mut series = Vec::with_capacity(deltas.len() - period + 1);
    match rsi_value(avg_gain, avg_loss) {
        Some(rsi) => series.push(rsi),
        None => return Vec::new(),
    }

    for &delta in &deltas[period..] {
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);

        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;

        match rsi_value(avg_gain, avg_loss) {
            Some(rsi) => series.push(rsi),
            None => break,
        }
    }

    series
}

/// Most recent RSI value, or `None` on insufficient data.
pub fn latest_rsi(closes: &[f64], period: usize) -> Option<f64> {
    calculate_rsi(closes, period).last().copied()
}

/// Convert average gain/loss into an RSI value in [0, 100].
fn rsi_value(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    let rsi = if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    };
    rsi.is_finite().then_some(rsi)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsi_rejects_bad_input() {
        assert!(calculate_rsi(&[], 14).is_empty());
        assert!(calculate_rsi(&[1.0, 2.0, 3.0], 0).is_empty());
        // 14 closes -> 13 deltas, need 14.
        let closes: Vec<f64> = (1..=14).map(|x| x as f64).collect();
        assert!(calculate_rsi(&closes, 14).is_empty());
    }

    #[test]
    fn rsi_all_gains_is_100() {
        let closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        for v in calculate_rsi(&closes, 14) {
            assert!((v - 100.0).abs() < 1e-10, "expected 100, got {v}");
        }
    }

    #[test]
    fn rsi_all_losses_is_0() {
        let closes: Vec<f64> = (1..=30).rev().map(|x| x as f64).collect();
        for v in calculate_rsi(&closes, 14) {
            assert!(v.abs() < 1e-10, "expected 0, got {v}");
        }
    }

    #[test]
    fn rsi_flat_is_50() {
        let closes = vec![100.0; 30];
        for v in calculate_rsi(&closes, 14) {
            assert!((v - 50.0).abs() < 1e-10, "expected 50, got {v}");
        }
    }

    #[test]
    fn rsi_stays_in_range() {
        let closes = vec![
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89, 46.03,
            44.18, 44.22, 44.57, 43.42, 42.66, 43.13, 44.01, 44.95,
        ];
        let series = calculate_rsi(&closes, 14);
        assert!(!series.is_empty());
        for v in series {
            assert!((0.0..=100.0).contains(&v), "RSI {v} out of range");
        }
    }

    #[test]
    fn rsi_identical_inputs_identical_outputs() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + (i as f64 * 0.3).cos() * 8.0).collect();
        assert_eq!(calculate_rsi(&closes, 14), calculate_rsi(&closes, 14));
    }

    #[test]
    fn latest_rsi_present_with_enough_data() {
        let closes: Vec<f64> = (1..=40).map(|x| x as f64).collect();
        assert!(latest_rsi(&closes, 14).is_some());
        assert!(latest_rsi(&closes[..10], 14).is_none());
    }
}
