// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free numeric kernels over ordered candle/close series.
// No I/O, no hidden state: identical input series produce identical output,
// so results are cacheable and restart-safe. Public functions return
// `Option<T>` or an empty `Vec` so callers are forced to handle
// insufficient-data and numerical-edge-case scenarios.

pub mod adx;
pub mod atr;
pub mod confluence;
pub mod ema;
pub mod macd;
pub mod rsi;
pub mod sma;
pub mod supertrend;

pub use confluence::confluence_score;
pub use supertrend::{Supertrend, TrendColor};
