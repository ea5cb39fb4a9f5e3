// =============================================================================
// MarketDataBlock — fetch candles + ticker, derive indicators, assemble
// per-symbol snapshots
// =============================================================================
//
// Failure policy: soft per symbol (log and omit), hard only when every
// symbol fails — the caller aborts the cycle on an empty set.
//
// OHLCV responses are cached under `md:{symbol}:{tf}` (TTL 300 s) to absorb
// burst calls; derived indicators under `ind:{type}:{symbol}:{tf}` (TTL
// 900 s), one entry per indicator type so each can be fetched or
// invalidated on its own. Cache failures silently fall through to live
// fetches.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::cache::Cache;
use crate::error::EngineError;
use crate::exchange::{Candle, Exchange};
use crate::indicators::ema::{calculate_ema, latest_ema};
use crate::indicators::rsi::{calculate_rsi, latest_rsi};
use crate::indicators::sma::{calculate_sma, calculate_volume_ma};
use crate::indicators::{adx, atr, macd, supertrend};
use crate::market_data::snapshot::{EntrySignals, IndicatorBundle, MarketSnapshot};

/// Candles requested on the 1h timeframe; 250 covers the SMA-200 plus seed.
const OHLCV_1H_LIMIT: usize = 250;
/// Candles requested on the 5m timeframe.
const OHLCV_5M_LIMIT: usize = 100;
/// Candles needed before the SMA-200 (and the regime filter) activate.
const SMA_200_MIN_CANDLES: usize = 200;
/// Look-back window for the bounce detection.
const BOUNCE_LOOKBACK: usize = 5;
/// Tail length rendered into prompts.
const TAIL_LEN: usize = 10;

const OHLCV_CACHE_TTL: Duration = Duration::from_secs(300);
const INDICATOR_CACHE_TTL: Duration = Duration::from_secs(900);

/// Fetches market data and assembles [`MarketSnapshot`]s.
pub struct MarketDataBlock {
    exchange: Arc<dyn Exchange>,
    cache: Arc<dyn Cache>,
}

impl MarketDataBlock {
    pub fn new(exchange: Arc<dyn Exchange>, cache: Arc<dyn Cache>) -> Self {
        Self { exchange, cache }
    }

    /// Build snapshots for every symbol that yields data.
    ///
    /// Returns `EngineError::EmptyMarketData` only when *all* symbols fail;
    /// individual failures are logged and the symbol omitted.
    pub async fn fetch_all(
        &self,
        symbols: &[String],
    ) -> Result<BTreeMap<String, MarketSnapshot>, EngineError> {
        let mut snapshots = BTreeMap::new();

        for symbol in symbols {
            match self.fetch_symbol(symbol).await {
                Ok(snapshot) => {
                    snapshots.insert(symbol.clone(), snapshot);
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "snapshot failed, symbol omitted this cycle");
                }
            }
        }

        if snapshots.is_empty() && !symbols.is_empty() {
            return Err(EngineError::EmptyMarketData);
        }

        Ok(snapshots)
    }

    /// Assemble one symbol's snapshot.
    async fn fetch_symbol(&self, symbol: &str) -> Result<MarketSnapshot, EngineError> {
        let candles_1h = self.fetch_ohlcv_cached(symbol, "1h", OHLCV_1H_LIMIT).await?;
        if candles_1h.is_empty() {
            return Err(EngineError::Exchange(format!("empty 1h OHLCV for {symbol}")));
        }

        let candles_5m = match self.fetch_ohlcv_cached(symbol, "5m", OHLCV_5M_LIMIT).await {
            Ok(candles) => candles,
            Err(e) => {
                // The 5m window is supplementary; a miss does not drop the
                // symbol.
                debug!(symbol, error = %e, "5m OHLCV unavailable");
                Vec::new()
            }
        };

        let ticker = self.exchange.fetch_ticker(symbol).await?;
        if ticker.is_stale(Utc::now()) {
            warn!(symbol, fetched_at = %ticker.fetched_at, "ticker is stale (>60s), proceeding");
        }

        let indicators = self.indicators_cached(symbol, "1h", &candles_1h).await;
        let signals = derive_signals(&candles_1h, &indicators);
        let confluence = signals.confluence();

        let funding_rate = self.exchange.fetch_funding_rate(symbol).await.unwrap_or(None);

        let closes: Vec<f64> = candles_1h.iter().map(|c| c.close).collect();
        let ema_series = calculate_ema(&closes, 20);
        let rsi_series = calculate_rsi(&closes, 14);

        Ok(MarketSnapshot {
            symbol: symbol.to_string(),
            last_price: ticker.last,
            change_24h_pct: ticker.change_24h_pct,
            volume_24h: ticker.volume_24h,
            closes_tail: tail(&closes),
            ema_tail: tail(&ema_series),
            rsi_tail: tail(&rsi_series),
            candles_1h,
            candles_5m,
            indicators,
            signals,
            confluence_score: confluence,
            funding_rate,
        })
    }

    /// OHLCV through the cache.
    async fn fetch_ohlcv_cached(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, EngineError> {
        let key = format!("md:{symbol}:{timeframe}");

        if let Some(cached) = self.cache.get(&key).await {
            if let Ok(candles) = serde_json::from_str::<Vec<Candle>>(&cached) {
                debug!(symbol, timeframe, count = candles.len(), "OHLCV cache hit");
                return Ok(candles);
            }
        }

        let candles = self.exchange.fetch_ohlcv(symbol, timeframe, limit).await?;
        if let Ok(json) = serde_json::to_string(&candles) {
            self.cache.set_ex(&key, &json, OHLCV_CACHE_TTL).await;
        }
        Ok(candles)
    }

    /// Indicators through the cache, one entry per type.
    ///
    /// When every type is present the bundle assembles without touching the
    /// kernels; any missing or unreadable entry recomputes the full set and
    /// rewrites all the per-type keys.
    async fn indicators_cached(
        &self,
        symbol: &str,
        timeframe: &str,
        candles: &[Candle],
    ) -> IndicatorBundle {
        if let Some(bundle) = self.load_cached_indicators(symbol, timeframe).await {
            debug!(symbol, timeframe, "indicator cache hit");
            return bundle;
        }

        let bundle = compute_indicators(candles);
        self.store_indicators(symbol, timeframe, &bundle).await;
        bundle
    }

    /// Read one `ind:{type}:{symbol}:{tf}` entry. Outer `None` is a cache
    /// miss; a stored "null" round-trips as `Some(None)` for the inner
    /// option.
    async fn cached_value<T: serde::de::DeserializeOwned>(
        &self,
        indicator: &str,
        symbol: &str,
        timeframe: &str,
    ) -> Option<T> {
        let raw = self
            .cache
            .get(&format!("ind:{indicator}:{symbol}:{timeframe}"))
            .await?;
        serde_json::from_str(&raw).ok()
    }

    async fn store_value<T: serde::Serialize>(
        &self,
        indicator: &str,
        symbol: &str,
        timeframe: &str,
        value: &T,
    ) {
        if let Ok(json) = serde_json::to_string(value) {
            self.cache
                .set_ex(
                    &format!("ind:{indicator}:{symbol}:{timeframe}"),
                    &json,
                    INDICATOR_CACHE_TTL,
                )
                .await;
        }
    }

    /// Assemble the bundle from per-type entries; `None` when any type is
    /// absent.
    async fn load_cached_indicators(
        &self,
        symbol: &str,
        timeframe: &str,
    ) -> Option<IndicatorBundle> {
        Some(IndicatorBundle {
            sma_200: self.cached_value("sma200", symbol, timeframe).await?,
            ema_9: self.cached_value("ema9", symbol, timeframe).await?,
            ema_20: self.cached_value("ema20", symbol, timeframe).await?,
            ema_21: self.cached_value("ema21", symbol, timeframe).await?,
            ema_50: self.cached_value("ema50", symbol, timeframe).await?,
            rsi_7: self.cached_value("rsi7", symbol, timeframe).await?,
            rsi_14: self.cached_value("rsi14", symbol, timeframe).await?,
            adx: self.cached_value("adx", symbol, timeframe).await?,
            atr: self.cached_value("atr", symbol, timeframe).await?,
            supertrend: self.cached_value("supertrend", symbol, timeframe).await?,
            volume_ma: self.cached_value("volume_ma", symbol, timeframe).await?,
            macd: self.cached_value("macd", symbol, timeframe).await?,
        })
    }

    async fn store_indicators(&self, symbol: &str, timeframe: &str, bundle: &IndicatorBundle) {
        self.store_value("sma200", symbol, timeframe, &bundle.sma_200).await;
        self.store_value("ema9", symbol, timeframe, &bundle.ema_9).await;
        self.store_value("ema20", symbol, timeframe, &bundle.ema_20).await;
        self.store_value("ema21", symbol, timeframe, &bundle.ema_21).await;
        self.store_value("ema50", symbol, timeframe, &bundle.ema_50).await;
        self.store_value("rsi7", symbol, timeframe, &bundle.rsi_7).await;
        self.store_value("rsi14", symbol, timeframe, &bundle.rsi_14).await;
        self.store_value("adx", symbol, timeframe, &bundle.adx).await;
        self.store_value("atr", symbol, timeframe, &bundle.atr).await;
        self.store_value("supertrend", symbol, timeframe, &bundle.supertrend).await;
        self.store_value("volume_ma", symbol, timeframe, &bundle.volume_ma).await;
        self.store_value("macd", symbol, timeframe, &bundle.macd).await;
    }
}

/// Run every kernel over the 1h window.
fn compute_indicators(candles: &[Candle]) -> IndicatorBundle {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

    IndicatorBundle {
        // The regime filter stays dark until a full 200-candle history exists.
        sma_200: (closes.len() >= SMA_200_MIN_CANDLES)
            .then(|| calculate_sma(&closes, 200))
            .flatten(),
        ema_9: latest_ema(&closes, 9),
        ema_20: latest_ema(&closes, 20),
        ema_21: latest_ema(&closes, 21),
        ema_50: latest_ema(&closes, 50),
        rsi_7: latest_rsi(&closes, 7),
        rsi_14: latest_rsi(&closes, 14),
        adx: adx::calculate_adx(candles, 14),
        atr: atr::calculate_atr(candles, 14),
        supertrend: supertrend::calculate(candles, 10),
        volume_ma: calculate_volume_ma(candles, 20),
        macd: macd::calculate(&closes),
    }
}

/// Evaluate the five entry conditions against the latest bar.
fn derive_signals(candles: &[Candle], indicators: &IndicatorBundle) -> EntrySignals {
    let Some(last) = candles.last() else {
        return EntrySignals::default();
    };
    let price = last.close;

    let regime_ok = indicators.sma_200.map(|sma| price > sma);
    let trend_strong = indicators.adx.map(|adx| adx > 25.0);
    let oversold = indicators.rsi_14.map(|rsi| rsi < 40.0);
    let volume_ok = indicators.volume_ma.map(|ma| last.volume > ma);

    // Bounce: price back above EMA-20 after dipping below it within the
    // look-back window.
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let ema_series = calculate_ema(&closes, 20);
    let bounce = indicators.ema_20.map(|ema_now| {
        if price <= ema_now || ema_series.len() < 2 {
            return false;
        }
        let window = BOUNCE_LOOKBACK.min(ema_series.len() - 1);
        let close_tail = &closes[closes.len() - 1 - window..closes.len() - 1];
        let ema_tail = &ema_series[ema_series.len() - 1 - window..ema_series.len() - 1];
        close_tail
            .iter()
            .zip(ema_tail.iter())
            .any(|(close, ema)| close < ema)
    });

    EntrySignals {
        regime_ok,
        trend_strong,
        bounce,
        oversold,
        volume_ok,
    }
}

/// Last [`TAIL_LEN`] values of a series.
fn tail(series: &[f64]) -> Vec<f64> {
    series[series.len().saturating_sub(TAIL_LEN)..].to_vec()
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(close: f64, volume: f64) -> Candle {
        Candle {
            open_time: 0,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume,
        }
    }

    fn rising_candles(n: usize) -> Vec<Candle> {
        (0..n).map(|i| candle(100.0 + i as f64, 50.0)).collect()
    }

    #[test]
    fn indicators_without_sma200_under_200_candles() {
        let candles = rising_candles(120);
        let bundle = compute_indicators(&candles);
        assert!(bundle.sma_200.is_none());
        assert!(bundle.ema_20.is_some());
        assert!(bundle.rsi_14.is_some());
    }

    #[test]
    fn indicators_with_full_history() {
        let candles = rising_candles(250);
        let bundle = compute_indicators(&candles);
        assert!(bundle.sma_200.is_some());
        assert!(bundle.adx.is_some());
        assert!(bundle.supertrend.is_some());
        assert!(bundle.macd.is_some());
    }

    #[test]
    fn signals_exclude_missing_regime() {
        let candles = rising_candles(120);
        let bundle = compute_indicators(&candles);
        let signals = derive_signals(&candles, &bundle);
        // Regime filter unevaluated without SMA-200.
        assert!(signals.regime_ok.is_none());
        // The rest evaluated.
        assert!(signals.trend_strong.is_some());
        assert!(signals.oversold.is_some());
    }

    #[test]
    fn bounce_detected_after_dip() {
        // Steady closes just above EMA, a dip below, then recovery.
        let mut candles: Vec<Candle> = (0..60).map(|_| candle(100.0, 50.0)).collect();
        candles.push(candle(90.0, 50.0)); // dip
        candles.push(candle(91.0, 50.0));
        candles.push(candle(104.0, 50.0)); // recovery above EMA
        let bundle = compute_indicators(&candles);
        let signals = derive_signals(&candles, &bundle);
        assert_eq!(signals.bounce, Some(true));
    }

    #[test]
    fn no_bounce_without_dip() {
        let candles = rising_candles(80);
        let bundle = compute_indicators(&candles);
        let signals = derive_signals(&candles, &bundle);
        assert_eq!(signals.bounce, Some(false));
    }

    #[test]
    fn tail_caps_at_ten() {
        let series: Vec<f64> = (0..25).map(|i| i as f64).collect();
        let t = tail(&series);
        assert_eq!(t.len(), 10);
        assert_eq!(t[0], 15.0);
        assert_eq!(*t.last().unwrap(), 24.0);

        let short = vec![1.0, 2.0];
        assert_eq!(tail(&short), short);
    }

    // ---- fetch_all against a scripted exchange -----------------------------

    use crate::cache::MemoryCache;
    use crate::exchange::{Exchange, OrderFill, OrderRequest, Ticker};
    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Exchange double: configured symbols succeed, everything else errors.
    struct StubExchange {
        healthy: Vec<String>,
        ohlcv_calls: AtomicU32,
    }

    impl StubExchange {
        fn new(healthy: &[&str]) -> Self {
            Self {
                healthy: healthy.iter().map(|s| s.to_string()).collect(),
                ohlcv_calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Exchange for StubExchange {
        async fn fetch_ohlcv(
            &self,
            symbol: &str,
            _timeframe: &str,
            limit: usize,
        ) -> Result<Vec<Candle>, crate::error::EngineError> {
            self.ohlcv_calls.fetch_add(1, Ordering::SeqCst);
            if self.healthy.iter().any(|s| s == symbol) {
                Ok(rising_candles(limit))
            } else {
                Err(crate::error::EngineError::Exchange("scripted failure".into()))
            }
        }

        async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, crate::error::EngineError> {
            if self.healthy.iter().any(|s| s == symbol) {
                Ok(Ticker {
                    symbol: symbol.to_string(),
                    last: dec!(42000),
                    change_24h_pct: 1.0,
                    volume_24h: 100.0,
                    fetched_at: Utc::now(),
                })
            } else {
                Err(crate::error::EngineError::Exchange("scripted failure".into()))
            }
        }

        async fn create_order(
            &self,
            _request: &OrderRequest,
        ) -> Result<OrderFill, crate::error::EngineError> {
            unreachable!("market data block never places orders")
        }

        async fn fetch_funding_rate(
            &self,
            _symbol: &str,
        ) -> Result<Option<Decimal>, crate::error::EngineError> {
            Ok(None)
        }
    }

    fn block_with(exchange: StubExchange) -> (MarketDataBlock, Arc<StubExchange>, Arc<MemoryCache>) {
        let exchange = Arc::new(exchange);
        let cache = Arc::new(MemoryCache::new());
        let block = MarketDataBlock::new(exchange.clone(), cache.clone());
        (block, exchange, cache)
    }

    fn symbols(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn all_symbols_failing_aborts() {
        let (block, _, _) = block_with(StubExchange::new(&[]));
        let result = block.fetch_all(&symbols(&["BTC/USDT", "ETH/USDT"])).await;
        assert!(matches!(result, Err(EngineError::EmptyMarketData)));
    }

    #[tokio::test]
    async fn single_failure_continues() {
        let (block, _, _) = block_with(StubExchange::new(&["BTC/USDT"]));
        let snapshots = block
            .fetch_all(&symbols(&["BTC/USDT", "ETH/USDT"]))
            .await
            .unwrap();
        assert_eq!(snapshots.len(), 1);
        assert!(snapshots.contains_key("BTC/USDT"));
        assert!(!snapshots.contains_key("ETH/USDT"));
    }

    #[tokio::test]
    async fn snapshot_carries_indicators_and_tails() {
        let (block, _, _) = block_with(StubExchange::new(&["BTC/USDT"]));
        let snapshots = block.fetch_all(&symbols(&["BTC/USDT"])).await.unwrap();
        let snap = &snapshots["BTC/USDT"];
        assert_eq!(snap.last_price, dec!(42000));
        assert!(snap.indicators.sma_200.is_some());
        assert_eq!(snap.closes_tail.len(), 10);
        assert!((0.0..=100.0).contains(&snap.confluence_score));
    }

    #[tokio::test]
    async fn ohlcv_cache_absorbs_second_fetch() {
        let (block, exchange, _) = block_with(StubExchange::new(&["BTC/USDT"]));
        block.fetch_all(&symbols(&["BTC/USDT"])).await.unwrap();
        let first = exchange.ohlcv_calls.load(Ordering::SeqCst);
        block.fetch_all(&symbols(&["BTC/USDT"])).await.unwrap();
        let second = exchange.ohlcv_calls.load(Ordering::SeqCst);
        // Both timeframes were cached; no additional OHLCV requests.
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn empty_watchlist_is_empty_ok() {
        let (block, _, _) = block_with(StubExchange::new(&[]));
        let snapshots = block.fetch_all(&[]).await.unwrap();
        assert!(snapshots.is_empty());
    }

    #[tokio::test]
    async fn indicators_cached_one_key_per_type() {
        let (block, _, cache) = block_with(StubExchange::new(&["BTC/USDT"]));
        block.fetch_all(&symbols(&["BTC/USDT"])).await.unwrap();

        for key in [
            "ind:sma200:BTC/USDT:1h",
            "ind:ema20:BTC/USDT:1h",
            "ind:rsi14:BTC/USDT:1h",
            "ind:adx:BTC/USDT:1h",
            "ind:supertrend:BTC/USDT:1h",
            "ind:volume_ma:BTC/USDT:1h",
            "ind:macd:BTC/USDT:1h",
        ] {
            assert!(cache.get(key).await.is_some(), "missing cache entry {key}");
        }
        // The old single-bundle key is gone.
        assert!(cache.get("ind:bundle:BTC/USDT:1h").await.is_none());
    }
}
