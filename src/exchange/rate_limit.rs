// =============================================================================
// Rate-Limit Tracker — request-weight accounting per endpoint class
// =============================================================================
//
// The venue enforces a request-weight budget per minute plus separate order
// placement limits. We keep one budget per endpoint class (market data vs.
// orders), feed the counters from the `X-MBX-USED-WEIGHT-1M` family of
// response headers, and refuse pre-flight when a request would cross the
// hard ceiling. Counters are atomics so any task may consult them lock-free.
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Hard ceiling at which we refuse to send additional requests.
const WEIGHT_HARD_LIMIT: u32 = 1000;
/// Soft warning threshold.
const WEIGHT_WARN_THRESHOLD: u32 = 800;
/// Maximum orders per 10-second window.
const ORDER_10S_LIMIT: u32 = 10;
/// Maximum orders per day.
const ORDER_1D_LIMIT: u32 = 200_000;

/// Endpoint classes with independent budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointClass {
    MarketData,
    Orders,
}

/// Thread-safe rate-limit tracker backed by atomic counters.
pub struct RateLimitTracker {
    market_weight_1m: AtomicU32,
    order_weight_1m: AtomicU32,
    order_count_10s: AtomicU32,
    order_count_1d: AtomicU32,
}

/// Immutable snapshot of the current counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub market_weight_1m: u32,
    pub order_weight_1m: u32,
    pub order_count_10s: u32,
    pub order_count_1d: u32,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            market_weight_1m: AtomicU32::new(0),
            order_weight_1m: AtomicU32::new(0),
            order_count_10s: AtomicU32::new(0),
            order_count_1d: AtomicU32::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Header-based updates
    // -------------------------------------------------------------------------

    /// Update the weight counter for `class` from the response headers.
    pub fn update_from_headers(&self, class: EndpointClass, headers: &reqwest::header::HeaderMap) {
        let Some(weight) = headers
            .get("X-MBX-USED-WEIGHT-1M")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
        else {
            return;
        };

        let counter = self.weight_counter(class);
        let prev = counter.swap(weight, Ordering::Relaxed);
        if weight >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
            warn!(
                ?class,
                used_weight = weight,
                hard_limit = WEIGHT_HARD_LIMIT,
                "rate-limit weight crossed warning threshold"
            );
        }
        debug!(?class, used_weight = weight, "rate-limit weight updated");

        if let Some(count) = headers
            .get("X-MBX-ORDER-COUNT-10S")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
        {
            self.order_count_10s.store(count, Ordering::Relaxed);
        }
        if let Some(count) = headers
            .get("X-MBX-ORDER-COUNT-1D")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
        {
            self.order_count_1d.store(count, Ordering::Relaxed);
        }
    }

    // -------------------------------------------------------------------------
    // Pre-flight checks
    // -------------------------------------------------------------------------

    /// True when spending `weight` more on `class` stays under the ceiling.
    pub fn can_send(&self, class: EndpointClass, weight: u32) -> bool {
        let current = self.weight_counter(class).load(Ordering::Relaxed);
        let allowed = current + weight <= WEIGHT_HARD_LIMIT;
        if !allowed {
            warn!(
                ?class,
                current_weight = current,
                requested_weight = weight,
                hard_limit = WEIGHT_HARD_LIMIT,
                "request blocked by rate-limit budget"
            );
        }
        allowed
    }

    /// True when another order may be placed within the 10 s and daily caps.
    pub fn can_place_order(&self) -> bool {
        let count_10s = self.order_count_10s.load(Ordering::Relaxed);
        if count_10s >= ORDER_10S_LIMIT {
            warn!(count_10s, limit = ORDER_10S_LIMIT, "order blocked: 10s order cap");
            return false;
        }
        let count_1d = self.order_count_1d.load(Ordering::Relaxed);
        if count_1d >= ORDER_1D_LIMIT {
            warn!(count_1d, limit = ORDER_1D_LIMIT, "order blocked: daily order cap");
            return false;
        }
        true
    }

    /// Increment the order counters locally before the exchange echoes them
    /// back in headers.
    pub fn record_order_sent(&self) {
        self.order_count_10s.fetch_add(1, Ordering::Relaxed);
        self.order_count_1d.fetch_add(1, Ordering::Relaxed);
    }

    /// Reset the 10-second order counter (periodic timer).
    pub fn reset_10s_counter(&self) {
        self.order_count_10s.store(0, Ordering::Relaxed);
    }

    /// Reset both per-minute weight counters (periodic timer).
    pub fn reset_1m_weights(&self) {
        self.market_weight_1m.store(0, Ordering::Relaxed);
        self.order_weight_1m.store(0, Ordering::Relaxed);
    }

    /// Reset the daily order counter (midnight UTC).
    pub fn reset_daily_counter(&self) {
        self.order_count_1d.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            market_weight_1m: self.market_weight_1m.load(Ordering::Relaxed),
            order_weight_1m: self.order_weight_1m.load(Ordering::Relaxed),
            order_count_10s: self.order_count_10s.load(Ordering::Relaxed),
            order_count_1d: self.order_count_1d.load(Ordering::Relaxed),
        }
    }

    fn weight_counter(&self, class: EndpointClass) -> &AtomicU32 {
        match class {
            EndpointClass::MarketData => &self.market_weight_1m,
            EndpointClass::Orders => &self.order_weight_1m,
        }
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.snapshot();
        f.debug_struct("RateLimitTracker")
            .field("market_weight_1m", &snap.market_weight_1m)
            .field("order_weight_1m", &snap.order_weight_1m)
            .field("order_count_10s", &snap.order_count_10s)
            .field("order_count_1d", &snap.order_count_1d)
            .finish()
    }
}
