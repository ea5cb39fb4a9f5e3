// =============================================================================
// Average Directional Index (ADX)
// =============================================================================
//
// ADX measures trend strength regardless of direction:
//
//   1. +DM / -DM (directional movement) and TR per bar.
//   2. Wilder-smooth +DM, -DM, TR over `period`.
//   3. +DI = smoothed(+DM) / smoothed(TR) * 100, -DI likewise.
//   4. DX = |+DI - -DI| / (+DI + -DI) * 100
//   5. ADX = Wilder-smoothed average of DX.
//
// ADX > 25 is read as a trending market.
// =============================================================================

use crate::exchange::Candle;

/// Compute the most recent ADX value.
///
/// Requires at least `2 * period + 1` candles: `period` bars to seed the
/// DM/TR smoothing, `period` DX values to seed the ADX average, plus the
/// first candle which has no predecessor.
pub fn calculate_adx(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < 2 * period + 1 {
        return None;
    }

    let period_f = period as f64;
    let transitions = candles.len() - 1;

    let mut plus_dm = Vec::with_capacity(transitions);
    let mut minus_dm = Vec::with_capacity(transitions);
    let mut tr_vals = Vec::with_capacity(transitions);

    for pair in candles.windows(2) {
        let (prev, cur) = (&pair[0], &pair[1]);

        let tr = (cur.high - cur.low)
            .max((cur.high - prev.close).abs())
            .max((cur.low - prev.close).abs());

        let up_move = cur.high - prev.high;
        let down_move = prev.low - cur.low;

        plus_dm.push(if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        });
        minus_dm.push(if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        });
        tr_vals.push(tr);
    }

    // Initial Wilder sums over the first `period` transitions.
    let mut smooth_plus: f64 = plus_dm[..period].iter().sum();
    let mut smooth_minus: f64 = minus_dm[..period].iter().sum();
    let mut smooth_tr: f64 = tr_vals[..period].iter().sum();

    let mut dx_values = Vec::with_capacity(transitions - period + 1);
    dx_values.push(compute_dx(smooth_plus, smooth_minus, smooth_tr)?);

    for i in period..transitions {
        smooth_plus = smooth_plus - smooth_plus / period_f + plus_dm[i];
        smooth_minus = smooth_minus - smooth_minus / period_f + minus_dm[i];
        smooth_tr = smooth_tr - smooth_tr / period_f + tr_vals[i];
        dx_values.push(compute_dx(smooth_plus, smooth_minus, smooth_tr)?);
    }

    if dx_values.len() < period {
        return None;
    }

    let mut adx = dx_values[..period].iter().sum::<f64>() / period_f;
    for &dx in &dx_values[period..] {
        adx = (adx * (period_f - 1.0) + dx) / period_f;
    }

    adx.is_finite().then_some(adx)
}

/// DX from smoothed directional movement and true range.
fn compute_dx(smooth_plus: f64, smooth_minus: f64, smooth_tr: f64) -> Option<f64> {
    if smooth_tr == 0.0 {
        return None;
    }

    let plus_di = smooth_plus / smooth_tr * 100.0;
    let minus_di = smooth_minus / smooth_tr * 100.0;

    let di_sum = plus_di + minus_di;
    if di_sum == 0.0 {
        // No directional movement either way.
        return Some(0.0);
    }

    let dx = (plus_di - minus_di).abs() / di_sum * 100.0;
    dx.is_finite().then_some(dx)
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

    #[test]
    fn adx_rejects_bad_input() {
        let candles = vec![candle(1.0, 2.0, 0.5, 1.5); 10];
        assert!(calculate_adx(&candles, 0).is_none());
        assert!(calculate_adx(&candles, 14).is_none());
    }

    #[test]
    fn adx_strong_uptrend_above_25() {
        let candles: Vec<Candle> = (0..60)
            .map(|i| {
                let base = 100.0 + i as f64 * 2.0;
                candle(base, base + 1.5, base - 0.5, base + 1.0)
            })
            .collect();
        let adx = calculate_adx(&candles, 14).unwrap();
        assert!(adx > 25.0, "expected ADX > 25 for strong trend, got {adx}");
    }

    #[test]
    fn adx_flat_market_near_zero() {
        let candles = vec![candle(100.0, 101.0, 99.0, 100.0); 60];
        let adx = calculate_adx(&candles, 14).unwrap();
        assert!(adx < 1.0, "expected ADX near 0 for flat market, got {adx}");
    }

    #[test]
    fn adx_in_range() {
        let candles: Vec<Candle> = (0..100)
            .map(|i| {
                let base = 50.0 + (i as f64 * 0.3).sin() * 10.0;
                candle(base - 0.5, base + 1.0, base - 1.0, base + 0.5)
            })
            .collect();
        if let Some(adx) = calculate_adx(&candles, 14) {
            assert!((0.0..=100.0).contains(&adx), "ADX {adx} out of range");
        }
    }

    #[test]
    fn adx_minimum_candle_count() {
        let period = 5;
        let min = 2 * period + 1;
        let candles: Vec<Candle> = (0..min)
            .map(|i| {
                let base = 100.0 + i as f64;
                candle(base, base + 1.0, base - 0.5, base + 0.5)
            })
            .collect();
        assert!(calculate_adx(&candles, period).is_some());
        assert!(calculate_adx(&candles[..min - 1], period).is_none());
    }
}
