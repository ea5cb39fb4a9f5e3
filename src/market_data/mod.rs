pub mod block;
pub mod snapshot;

// Re-export the per-cycle types for convenient access
// (e.g. `use crate::market_data::MarketSnapshot`).
pub use block::MarketDataBlock;
pub use snapshot::{EntrySignals, IndicatorBundle, MarketSnapshot};
