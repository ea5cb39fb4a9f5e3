// =============================================================================
// Confluence score — fraction of satisfied entry conditions
// =============================================================================
//
// score = signals_met / signals_evaluated * 100, in [0, 100].
//
// When market data is short (no SMA-200, say) a condition is excluded from
// the evaluation entirely instead of counting as failed, so the score never
// exceeds what the available signals can support.
// =============================================================================

/// Score a set of evaluated boolean signals. `None` entries are conditions
/// that could not be evaluated and are excluded from the denominator.
pub fn confluence_score(signals: &[Option<bool>]) -> f64 {
    let evaluated = signals.iter().filter(|s| s.is_some()).count();
    if evaluated == 0 {
        return 0.0;
    }

    let met = signals.iter().filter(|s| **s == Some(true)).count();
    (met as f64 / evaluated as f64 * 100.0).clamp(0.0, 100.0)
}

/// Count the satisfied signals (the Trinity emission policy keys off this).
pub fn signals_met(signals: &[Option<bool>]) -> usize {
    signals.iter().filter(|s| **s == Some(true)).count()
}
