// =============================================================================
// Exchange abstraction — the narrow capability set the engine needs
// =============================================================================
//
// The engine only requires four capabilities from an exchange: candles, a
// ticker, order placement, and (optionally) funding rates. Everything else a
// venue offers is out of scope. Concrete clients implement `Exchange`; the
// rest of the engine holds a trait object so paper tests can substitute a
// scripted double.
// =============================================================================

pub mod binance;
pub mod rate_limit;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

pub use binance::BinanceClient;
pub use rate_limit::RateLimitTracker;

/// One OHLCV candle. Indicator math runs on f64; precision loss here is
/// bounded and accepted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Open time, epoch milliseconds.
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Spot ticker snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    /// Last traded price. Monetary, so Decimal.
    pub last: Decimal,
    pub change_24h_pct: f64,
    pub volume_24h: f64,
    /// When the exchange produced this ticker.
    pub fetched_at: DateTime<Utc>,
}

impl Ticker {
    /// A ticker older than 60 seconds is considered stale. Stale tickers are
    /// logged and used anyway (§ data-quality policy).
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        (now - self.fetched_at).num_seconds() > 60
    }
}

/// Order type supported by `create_order`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

/// A request to place one order.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    /// "BUY" or "SELL".
    pub side: String,
    pub order_type: OrderType,
    pub quantity: Decimal,
    /// Required for limit orders, ignored for market orders.
    pub price: Option<Decimal>,
}

/// Exchange-reported outcome of an order. Fills are treated as atomic at the
/// reported average price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFill {
    pub order_id: String,
    pub status: String,
    pub filled_qty: Decimal,
    pub avg_price: Decimal,
}

/// The minimum exchange capability set (§ external interfaces).
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Ordered candles, oldest first. `limit` is a request, not a guarantee;
    /// callers must handle shorter series.
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, EngineError>;

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, EngineError>;

    async fn create_order(&self, request: &OrderRequest) -> Result<OrderFill, EngineError>;

    /// Current funding rate, when the venue exposes one for the symbol.
    async fn fetch_funding_rate(&self, symbol: &str) -> Result<Option<Decimal>, EngineError>;
}

/// Convert the engine's "BTC/USDT" notation to the venue's "BTCUSDT" form.
pub fn venue_symbol(symbol: &str) -> String {
    symbol.replace('/', "").to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    #[test]
    fn venue_symbol_strips_slash() {
        assert_eq!(venue_symbol("BTC/USDT"), "BTCUSDT");
        assert_eq!(venue_symbol("ethusdt"), "ETHUSDT");
    }

    #[test]
    fn ticker_staleness() {
        let now = Utc::now();
        let fresh = Ticker {
            symbol: "BTC/USDT".into(),
            last: dec!(42000),
            change_24h_pct: 1.2,
            volume_24h: 1000.0,
            fetched_at: now - Duration::seconds(10),
        };
        assert!(!fresh.is_stale(now));

        let stale = Ticker {
            fetched_at: now - Duration::seconds(120),
            ..fresh
        };
        assert!(stale.is_stale(now));
    }
}
