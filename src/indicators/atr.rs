// =============================================================================
// Average True Range (ATR) — Wilder's smoothing
// =============================================================================
//
// True Range per bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR is the Wilder-smoothed average of TR:
//   ATR_0 = SMA of first `period` TR values
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
//
// The Supertrend kernel consumes the full series; everything else takes the
// latest value.
// =============================================================================

use crate::exchange::Candle;

/// Compute the full ATR series. One value per candle from index `period`
/// onward (the first candle has no predecessor for the TR calculation).
///
/// # Edge cases
/// - `period == 0` or fewer than `period + 1` candles => empty vec
/// - A non-finite intermediate value truncates the series.
pub fn calculate_atr_series(candles: &[Candle], period: usize) -> Vec<f64> {
    if period == 0 || candles.len() < period + 1 {
        return Vec::new();
    }

    let tr_values = true_ranges(candles);

    let seed: f64 = tr_values[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return Vec::new();
    }

    let period_f = period as f64;
    let mut series = Vec::with_capacity(tr_values.len() - period + 1);
    series.push(seed);

    let mut atr = seed;
    for &tr in &tr_values[period..] {
        atr = (atr * (period_f - 1.0) + tr) / period_f;
        if !atr.is_finite() {
            break;
        }
        series.push(atr);
    }

    series
}

/// Most recent ATR value.
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    calculate_atr_series(candles, period).last().copied()
}

/// True Range for each consecutive candle pair.
fn true_ranges(candles: &[Candle]) -> Vec<f64> {
    let mut tr = Vec::with_capacity(candles.len().saturating_sub(1));
    for pair in candles.windows(2) {
        let prev_close = pair[0].close;
        let high = pair[1].high;
        let low = pair[1].low;
        tr.push(
            (high - low)
                .max((high - prev_close).abs())
                .max((low - prev_close).abs()),
        );
    }
    tr
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
            volume: 100.0,
        }
    }

    #[test]
    fn atr_rejects_bad_input() {
        let candles = vec![candle(100.0, 105.0, 95.0, 102.0); 10];
        assert!(calculate_atr(&candles, 0).is_none());
        assert!(calculate_atr(&candles, 14).is_none());
    }

    #[test]
    fn atr_constant_range_converges() {
        let mut candles = Vec::new();
        for i in 0..40 {
            let base = 100.0 + i as f64 * 0.1;
            candles.push(candle(base, base + 5.0, base - 5.0, base));
        }
        let atr = calculate_atr(&candles, 14).unwrap();
        assert!((atr - 10.0).abs() < 1.0, "expected ATR near 10, got {atr}");
    }

    #[test]
    fn atr_gap_reflected_via_prev_close() {
        let candles = vec![
            candle(100.0, 105.0, 95.0, 95.0),
            candle(110.0, 115.0, 108.0, 112.0), // |115-95| = 20 dominates
            candle(112.0, 118.0, 110.0, 115.0),
            candle(115.0, 120.0, 113.0, 118.0),
        ];
        let atr = calculate_atr(&candles, 3).unwrap();
        assert!(atr > 7.0, "ATR should reflect the gap, got {atr}");
    }

    #[test]
    fn atr_series_length() {
        let candles: Vec<Candle> = (0..30)
            .map(|i| {
                let base = 100.0 + i as f64;
                candle(base, base + 2.0, base - 2.0, base + 1.0)
            })
            .collect();
        let series = calculate_atr_series(&candles, 14);
        // 29 TR values, smoothing starts after 14 -> 16 outputs.
        assert_eq!(series.len(), 16);
        assert!(series.iter().all(|v| *v > 0.0));
    }

    #[test]
    fn atr_nan_truncates() {
        let mut candles = vec![candle(100.0, 105.0, 95.0, 100.0); 6];
        candles.push(candle(100.0, f64::NAN, 95.0, 100.0));
        let series = calculate_atr_series(&candles, 3);
        // The NaN bar never enters the published series.
        assert!(series.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn atr_latest_equals_series_tail() {
        let candles: Vec<Candle> = (0..50)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.5).sin() * 10.0;
                candle(base - 0.5, base + 2.0, base - 2.0, base + 0.5)
            })
            .collect();
        assert_eq!(
            calculate_atr(&candles, 14),
            calculate_atr_series(&candles, 14).last().copied()
        );
    }
}
