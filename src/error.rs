// =============================================================================
// Engine error type — one kind per block boundary
// =============================================================================
//
// Transient I/O failures are retried inside the owning block; what surfaces
// here is the post-retry outcome. Risk rejections and parse failures are not
// errors in the Result sense (they are recorded reasons), except where a
// whole cycle must abort.
// =============================================================================

use thiserror::Error;

/// Errors surfaced across block boundaries.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Exchange request failed after its retry budget.
    #[error("exchange error: {0}")]
    Exchange(String),

    /// Market data came back empty for every watched symbol; the cycle
    /// cannot proceed.
    #[error("no market data for any symbol")]
    EmptyMarketData,

    /// Database failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// LLM provider failure after retries.
    #[error("llm provider error: {0}")]
    Llm(String),

    /// A required row vanished mid-cycle (bot deleted, position missing).
    /// Fatal for the current cycle only.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// The cycle exceeded its deadline and was cancelled.
    #[error("cycle deadline exceeded")]
    CycleTimeout,

    /// Configuration is unusable (bad env value, missing credential).
    #[error("config error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        Self::Exchange(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind() {
        let e = EngineError::Exchange("timeout".into());
        assert_eq!(e.to_string(), "exchange error: timeout");
        assert_eq!(
            EngineError::EmptyMarketData.to_string(),
            "no market data for any symbol"
        );
        assert_eq!(EngineError::CycleTimeout.to_string(), "cycle deadline exceeded");
    }
}
