// =============================================================================
// Trade Memory — per-(bot, symbol) performance stats driving adaptive sizing
// =============================================================================
//
// The in-process map is authoritative for the lifetime of the engine; every
// mutation is written through to the cache so stats survive a restart when
// the cache is reachable. A cold key rehydrates from the cache on first
// read; if the cache is down the subsystem degrades to neutral values
// (adjust = 1.0, min profit = 10 USD) rather than blocking trading.
//
// Daily counters reset automatically when the UTC date rolls over.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::Cache;

/// Outcomes kept in the rolling window.
const RECENT_WINDOW: usize = 20;
/// Observations needed before the stats are trusted for Kelly sizing.
pub const MIN_OBSERVATIONS_FOR_KELLY: usize = 20;
/// Cache TTL for persisted stats (7 days).
const STATS_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Running win/loss statistics for one (bot, symbol) pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolStats {
    pub wins: u32,
    pub losses: u32,
    /// Sum of winning P&L in USD (positive).
    pub sum_win: Decimal,
    /// Sum of losing P&L in USD (absolute value).
    pub sum_loss: Decimal,
    /// Sum of winning returns as fractions of entry notional.
    pub sum_win_pct: f64,
    /// Sum of losing returns, absolute fractions.
    pub sum_loss_pct: f64,
    /// Most recent outcomes, newest last. Positive = win.
    pub recent: VecDeque<f64>,
}

impl SymbolStats {
    pub fn observations(&self) -> usize {
        (self.wins + self.losses) as usize
    }

    /// Win rate in [0, 1]; 0.5 with no history.
    pub fn win_rate(&self) -> f64 {
        let total = self.wins + self.losses;
        if total == 0 {
            return 0.5;
        }
        self.wins as f64 / total as f64
    }

    /// Average winning return as a fraction of notional.
    pub fn avg_win_pct(&self) -> f64 {
        if self.wins == 0 {
            return 0.0;
        }
        self.sum_win_pct / self.wins as f64
    }

    /// Average losing return, absolute, as a fraction of notional.
    pub fn avg_loss_pct(&self) -> f64 {
        if self.losses == 0 {
            return 0.0;
        }
        self.sum_loss_pct / self.losses as f64
    }

    fn record(&mut self, pnl: Decimal, pnl_pct: f64) {
        if pnl >= Decimal::ZERO {
            self.wins += 1;
            self.sum_win += pnl;
            self.sum_win_pct += pnl_pct.max(0.0);
        } else {
            self.losses += 1;
            self.sum_loss += -pnl;
            self.sum_loss_pct += pnl_pct.abs();
        }
        self.recent.push_back(pnl_pct);
        while self.recent.len() > RECENT_WINDOW {
            self.recent.pop_front();
        }
    }
}

/// Per-bot daily counters, reset on UTC date change.
#[derive(Debug, Clone, Default)]
struct DailyCounters {
    date: String,
    trades: u32,
    realized_pnl: Decimal,
}

/// Keyed store of per-symbol performance statistics.
pub struct TradeMemory {
    cache: Arc<dyn Cache>,
    stats: RwLock<HashMap<(Uuid, String), SymbolStats>>,
    daily: RwLock<HashMap<Uuid, DailyCounters>>,
}

impl TradeMemory {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self {
            cache,
            stats: RwLock::new(HashMap::new()),
            daily: RwLock::new(HashMap::new()),
        }
    }

    fn cache_key(bot_id: Uuid, symbol: &str) -> String {
        format!("mem:{bot_id}:{symbol}")
    }

    // -------------------------------------------------------------------------
    // Recording
    // -------------------------------------------------------------------------

    /// Record a closed trade's result. `pnl_pct` is the signed return as a
    /// fraction of the entry notional.
    pub async fn record(&self, bot_id: Uuid, symbol: &str, pnl: Decimal, pnl_pct: f64) {
        self.ensure_loaded(bot_id, symbol).await;

        let snapshot = {
            let mut stats = self.stats.write();
            let entry = stats.entry((bot_id, symbol.to_string())).or_default();
            entry.record(pnl, pnl_pct);
            entry.clone()
        };

        self.bump_daily(bot_id, pnl);

        info!(
            bot_id = %bot_id,
            symbol,
            pnl = %pnl,
            wins = snapshot.wins,
            losses = snapshot.losses,
            win_rate = snapshot.win_rate(),
            "trade outcome recorded"
        );

        // Write-through, best-effort.
        if let Ok(json) = serde_json::to_string(&snapshot) {
            self.cache
                .set_ex(&Self::cache_key(bot_id, symbol), &json, STATS_TTL)
                .await;
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Current stats for the pair, rehydrating from the cache when cold.
    pub async fn stats(&self, bot_id: Uuid, symbol: &str) -> SymbolStats {
        self.ensure_loaded(bot_id, symbol).await;
        self.stats
            .read()
            .get(&(bot_id, symbol.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Confidence multiplier in [0.7, 1.3] derived from the win rate:
    /// 0.7 at wr <= 0.40, 1.0 at 0.50, 1.3 at wr >= 0.65, interpolated
    /// between the anchors. Neutral (1.0) without history.
    pub async fn confidence_adjust(&self, bot_id: Uuid, symbol: &str) -> f64 {
        let stats = self.stats(bot_id, symbol).await;
        if stats.observations() == 0 {
            return 1.0;
        }
        adjust_for_win_rate(stats.win_rate())
    }

    /// Dynamic minimum-profit floor in USD: 20 for losing symbols, 5 for
    /// proven ones, 10 otherwise (and 10 with too little history).
    pub async fn dynamic_min_profit_usd(&self, bot_id: Uuid, symbol: &str) -> Decimal {
        let stats = self.stats(bot_id, symbol).await;
        if stats.observations() < 10 {
            return dec!(10);
        }
        let wr = stats.win_rate();
        if wr >= 0.60 {
            dec!(5)
        } else if wr <= 0.40 {
            dec!(20)
        } else {
            dec!(10)
        }
    }

    /// Today's (trade count, realized P&L) for the bot.
    pub fn daily(&self, bot_id: Uuid) -> (u32, Decimal) {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let daily = self.daily.read();
        match daily.get(&bot_id) {
            Some(counters) if counters.date == today => (counters.trades, counters.realized_pnl),
            _ => (0, Decimal::ZERO),
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Pull a cold key from the cache into the in-process map.
    async fn ensure_loaded(&self, bot_id: Uuid, symbol: &str) {
        {
            let stats = self.stats.read();
            if stats.contains_key(&(bot_id, symbol.to_string())) {
                return;
            }
        }

        if let Some(json) = self.cache.get(&Self::cache_key(bot_id, symbol)).await {
            if let Ok(loaded) = serde_json::from_str::<SymbolStats>(&json) {
                debug!(bot_id = %bot_id, symbol, "trade memory rehydrated from cache");
                self.stats
                    .write()
                    .entry((bot_id, symbol.to_string()))
                    .or_insert(loaded);
            }
        }
    }

    /// Increment the daily counters, resetting on a UTC date change.
    fn bump_daily(&self, bot_id: Uuid, pnl: Decimal) {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let mut daily = self.daily.write();
        let counters = daily.entry(bot_id).or_default();
        if counters.date != today {
            *counters = DailyCounters {
                date: today,
                ..Default::default()
            };
        }
        counters.trades += 1;
        counters.realized_pnl += pnl;
    }
}

/// Piecewise-linear map from win rate to the confidence multiplier.
fn adjust_for_win_rate(win_rate: f64) -> f64 {
    if win_rate <= 0.40 {
        0.7
    } else if win_rate < 0.50 {
        0.7 + (win_rate - 0.40) / 0.10 * 0.3
    } else if win_rate < 0.65 {
        1.0 + (win_rate - 0.50) / 0.15 * 0.3
    } else {
        1.3
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;

    fn memory() -> TradeMemory {
        TradeMemory::new(Arc::new(MemoryCache::new()))
    }

    #[tokio::test]
    async fn record_updates_stats() {
        let mem = memory();
        let bot = Uuid::new_v4();

        mem.record(bot, "BTC/USDT", dec!(25), 0.05).await;
        mem.record(bot, "BTC/USDT", dec!(-10), -0.02).await;

        let stats = mem.stats(bot, "BTC/USDT").await;
        assert_eq!(stats.wins, 1);
        assert_eq!(stats.losses, 1);
        assert_eq!(stats.win_rate(), 0.5);
        assert_eq!(stats.sum_win, dec!(25));
        assert_eq!(stats.sum_loss, dec!(10));
        assert!((stats.avg_win_pct() - 0.05).abs() < 1e-12);
        assert!((stats.avg_loss_pct() - 0.02).abs() < 1e-12);
    }

    #[tokio::test]
    async fn recent_window_capped() {
        let mem = memory();
        let bot = Uuid::new_v4();
        for i in 0..30 {
            mem.record(bot, "ETH/USDT", dec!(1), 0.001 * i as f64).await;
        }
        let stats = mem.stats(bot, "ETH/USDT").await;
        assert_eq!(stats.recent.len(), RECENT_WINDOW);
        assert_eq!(stats.observations(), 30);
    }

    #[test]
    fn adjust_anchors() {
        assert_eq!(adjust_for_win_rate(0.30), 0.7);
        assert_eq!(adjust_for_win_rate(0.40), 0.7);
        assert!((adjust_for_win_rate(0.50) - 1.0).abs() < 1e-12);
        assert_eq!(adjust_for_win_rate(0.65), 1.3);
        assert_eq!(adjust_for_win_rate(0.90), 1.3);
        // Interpolated midpoints.
        assert!((adjust_for_win_rate(0.45) - 0.85).abs() < 1e-12);
        let mid = adjust_for_win_rate(0.575);
        assert!(mid > 1.0 && mid < 1.3);
    }

    #[tokio::test]
    async fn neutral_adjust_without_history() {
        let mem = memory();
        assert_eq!(mem.confidence_adjust(Uuid::new_v4(), "SOL/USDT").await, 1.0);
    }

    #[tokio::test]
    async fn min_profit_floor_tiers() {
        let mem = memory();
        let bot = Uuid::new_v4();

        // Too little history: neutral.
        assert_eq!(mem.dynamic_min_profit_usd(bot, "BTC/USDT").await, dec!(10));

        // Proven winner: relaxed floor.
        for _ in 0..12 {
            mem.record(bot, "BTC/USDT", dec!(5), 0.01).await;
        }
        assert_eq!(mem.dynamic_min_profit_usd(bot, "BTC/USDT").await, dec!(5));

        // Persistent loser: tight floor.
        for _ in 0..12 {
            mem.record(bot, "DOGE/USDT", dec!(-5), -0.01).await;
        }
        assert_eq!(mem.dynamic_min_profit_usd(bot, "DOGE/USDT").await, dec!(20));
    }

    #[tokio::test]
    async fn daily_counters_accumulate() {
        let mem = memory();
        let bot = Uuid::new_v4();
        mem.record(bot, "BTC/USDT", dec!(10), 0.01).await;
        mem.record(bot, "ETH/USDT", dec!(-4), -0.01).await;

        let (trades, pnl) = mem.daily(bot);
        assert_eq!(trades, 2);
        assert_eq!(pnl, dec!(6));

        // Another bot's counters are independent.
        assert_eq!(mem.daily(Uuid::new_v4()), (0, Decimal::ZERO));
    }

    #[tokio::test]
    async fn rehydrates_from_cache() {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let bot = Uuid::new_v4();

        let first = TradeMemory::new(cache.clone());
        first.record(bot, "BTC/USDT", dec!(30), 0.06).await;

        // A fresh instance sharing the cache sees the persisted stats.
        let second = TradeMemory::new(cache);
        let stats = second.stats(bot, "BTC/USDT").await;
        assert_eq!(stats.wins, 1);
    }
}
