// =============================================================================
// Binance REST client — HMAC-SHA256 signed requests behind the Exchange trait
// =============================================================================
//
// SECURITY: the secret key is never logged or serialised. Signed requests
// carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the engine and the venue.
//
// Transient network failures on public market-data endpoints are retried
// here with exponential backoff; order placement is NOT retried (the caller
// owns close-retry semantics and entries must never double-submit).
// =============================================================================

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use rust_decimal::Decimal;
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::error::EngineError;
use crate::exchange::rate_limit::{EndpointClass, RateLimitTracker};
use crate::exchange::{venue_symbol, Candle, Exchange, OrderFill, OrderRequest, OrderType, Ticker};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;
/// Retry budget for transient market-data failures.
const MARKET_DATA_RETRIES: u32 = 3;
/// Base backoff between retries.
const RETRY_BASE_MS: u64 = 500;

/// Binance REST client with HMAC-SHA256 request signing and weight tracking.
pub struct BinanceClient {
    api_key: String,
    secret: String,
    base_url: String,
    futures_base_url: String,
    client: reqwest::Client,
    rate_limits: RateLimitTracker,
}

impl BinanceClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new client.
    ///
    /// # Arguments
    /// * `api_key` — venue API key (sent as a header, never in query params).
    /// * `secret`  — secret key used exclusively for HMAC signing.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!("BinanceClient initialised (base_url=https://api.binance.com)");

        Self {
            api_key,
            secret,
            base_url: "https://api.binance.com".to_string(),
            futures_base_url: "https://fapi.binance.com".to_string(),
            client,
            rate_limits: RateLimitTracker::new(),
        }
    }

    /// Access the shared rate-limit counters.
    pub fn rate_limits(&self) -> &RateLimitTracker {
        &self.rate_limits
    }

    // -------------------------------------------------------------------------
    // Request signing
    // -------------------------------------------------------------------------

    /// Hex-encoded HMAC-SHA256 of `payload` under the account secret.
    fn hmac_hex(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Finalise the query string for a signed endpoint.
    ///
    /// The caller's parameters gain a millisecond timestamp and the
    /// recv-window; the venue verifies the HMAC over exactly that string,
    /// so `signature` must be the last parameter appended.
    fn signed_query(&self, params: &str) -> String {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis();

        let unsigned = if params.is_empty() {
            format!("timestamp={now_ms}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={now_ms}&recvWindow={RECV_WINDOW}")
        };

        let signature = self.hmac_hex(&unsigned);
        format!("{unsigned}&signature={signature}")
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    /// GET a JSON body, recording rate-limit headers for `class`.
    async fn get_json(&self, url: &str, class: EndpointClass) -> Result<serde_json::Value> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url} request failed"))?;

        self.rate_limits.update_from_headers(class, resp.headers());

        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse response body")?;

        if !status.is_success() {
            anyhow::bail!("Binance GET returned {status}: {body}");
        }
        Ok(body)
    }

    /// Retry a market-data fetch with exponential backoff. Only used for
    /// public endpoints where repeating the request is harmless.
    async fn get_json_with_retry(&self, url: &str) -> Result<serde_json::Value> {
        let mut delay = Duration::from_millis(RETRY_BASE_MS);
        let mut last_err = None;

        for attempt in 1..=MARKET_DATA_RETRIES {
            match self.get_json(url, EndpointClass::MarketData).await {
                Ok(body) => return Ok(body),
                Err(e) => {
                    warn!(attempt, error = %e, "market data request failed");
                    last_err = Some(e);
                    if attempt < MARKET_DATA_RETRIES {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        Err(last_err.expect("at least one attempt was made"))
    }

    // -------------------------------------------------------------------------
    // Parsing helpers
    // -------------------------------------------------------------------------

    /// Parse a JSON value that may be either a string or a number into `f64`.
    fn parse_f64(val: &serde_json::Value) -> Result<f64> {
        if let Some(s) = val.as_str() {
            s.parse::<f64>()
                .with_context(|| format!("failed to parse '{s}' as f64"))
        } else if let Some(n) = val.as_f64() {
            Ok(n)
        } else {
            anyhow::bail!("expected string or number, got: {val}")
        }
    }

    /// Parse a JSON value that may be either a string or a number into
    /// `Decimal` without a float round-trip for string payloads.
    fn parse_decimal(val: &serde_json::Value) -> Result<Decimal> {
        if let Some(s) = val.as_str() {
            s.parse::<Decimal>()
                .with_context(|| format!("failed to parse '{s}' as decimal"))
        } else if let Some(n) = val.as_f64() {
            Decimal::try_from(n).context("non-finite number in decimal field")
        } else {
            anyhow::bail!("expected string or number, got: {val}")
        }
    }

    /// Parse Binance's array-of-arrays kline payload.
    ///
    /// Array indices: [0] openTime, [1] open, [2] high, [3] low, [4] close,
    /// [5] volume (the remaining fields are unused here).
    fn parse_klines(body: &serde_json::Value) -> Result<Vec<Candle>> {
        let raw = body.as_array().context("klines response is not an array")?;
        let mut candles = Vec::with_capacity(raw.len());

        for entry in raw {
            let arr = entry.as_array().context("kline entry is not an array")?;
            if arr.len() < 6 {
                warn!("skipping malformed kline entry with {} elements", arr.len());
                continue;
            }

            candles.push(Candle {
                open_time: arr[0].as_i64().unwrap_or(0),
                open: Self::parse_f64(&arr[1])?,
                high: Self::parse_f64(&arr[2])?,
                low: Self::parse_f64(&arr[3])?,
                close: Self::parse_f64(&arr[4])?,
                volume: Self::parse_f64(&arr[5])?,
            });
        }

        Ok(candles)
    }
}

#[async_trait]
impl Exchange for BinanceClient {
    /// GET /api/v3/klines (public).
    #[instrument(skip(self), name = "binance::fetch_ohlcv")]
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, EngineError> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            venue_symbol(symbol),
            timeframe,
            limit
        );

        let body = self
            .get_json_with_retry(&url)
            .await
            .map_err(|e| EngineError::Exchange(e.to_string()))?;

        let candles = Self::parse_klines(&body).map_err(|e| EngineError::Exchange(e.to_string()))?;
        debug!(symbol, timeframe, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    /// GET /api/v3/ticker/24hr (public).
    #[instrument(skip(self), name = "binance::fetch_ticker")]
    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, EngineError> {
        let url = format!(
            "{}/api/v3/ticker/24hr?symbol={}",
            self.base_url,
            venue_symbol(symbol)
        );

        let body = self
            .get_json_with_retry(&url)
            .await
            .map_err(|e| EngineError::Exchange(e.to_string()))?;

        let last = Self::parse_decimal(&body["lastPrice"])
            .map_err(|e| EngineError::Exchange(e.to_string()))?;
        let change_24h_pct = Self::parse_f64(&body["priceChangePercent"]).unwrap_or(0.0);
        let volume_24h = Self::parse_f64(&body["quoteVolume"]).unwrap_or(0.0);
        let fetched_at = body["closeTime"]
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);

        Ok(Ticker {
            symbol: symbol.to_string(),
            last,
            change_24h_pct,
            volume_24h,
            fetched_at,
        })
    }

    /// POST /api/v3/order (signed). Not retried: duplicating an entry order
    /// is worse than failing one cycle.
    #[instrument(skip(self, request), name = "binance::create_order")]
    async fn create_order(&self, request: &OrderRequest) -> Result<OrderFill, EngineError> {
        if !self.rate_limits.can_place_order() {
            return Err(EngineError::Exchange("order rate limit reached".into()));
        }

        let symbol = venue_symbol(&request.symbol);
        let mut params = format!(
            "symbol={symbol}&side={}&type={}&quantity={}",
            request.side,
            match request.order_type {
                OrderType::Market => "MARKET",
                OrderType::Limit => "LIMIT",
            },
            request.quantity
        );
        if let Some(price) = request.price {
            params.push_str(&format!("&price={price}&timeInForce=GTC"));
        }

        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        debug!(symbol = %symbol, side = %request.side, quantity = %request.quantity, "placing order");
        self.rate_limits.record_order_sent();

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| EngineError::Exchange(format!("POST /api/v3/order failed: {e}")))?;

        self.rate_limits
            .update_from_headers(EndpointClass::Orders, resp.headers());

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EngineError::Exchange(format!("bad order response: {e}")))?;

        if !status.is_success() {
            return Err(EngineError::Exchange(format!(
                "order rejected ({status}): {body}"
            )));
        }

        // Average fill price: cummulativeQuoteQty / executedQty when filled,
        // else the requested price.
        let filled_qty =
            Self::parse_decimal(&body["executedQty"]).unwrap_or(request.quantity);
        let avg_price = match (
            Self::parse_decimal(&body["cummulativeQuoteQty"]),
            filled_qty.is_zero(),
        ) {
            (Ok(quote), false) => quote / filled_qty,
            _ => request.price.unwrap_or_default(),
        };

        Ok(OrderFill {
            order_id: body["orderId"]
                .as_u64()
                .map(|id| id.to_string())
                .unwrap_or_else(|| body["clientOrderId"].as_str().unwrap_or("").to_string()),
            status: body["status"].as_str().unwrap_or("UNKNOWN").to_string(),
            filled_qty,
            avg_price,
        })
    }

    /// GET /fapi/v1/premiumIndex (public, futures venue). Returns `None`
    /// when the symbol has no perpetual market.
    #[instrument(skip(self), name = "binance::fetch_funding_rate")]
    async fn fetch_funding_rate(&self, symbol: &str) -> Result<Option<Decimal>, EngineError> {
        let url = format!(
            "{}/fapi/v1/premiumIndex?symbol={}",
            self.futures_base_url,
            venue_symbol(symbol)
        );

        match self.get_json(&url, EndpointClass::MarketData).await {
            Ok(body) => Ok(Self::parse_decimal(&body["lastFundingRate"]).ok()),
            Err(e) => {
                debug!(symbol, error = %e, "funding rate unavailable");
                Ok(None)
            }
        }
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
