// =============================================================================
// Engine Configuration — environment-derived settings with serde defaults
// =============================================================================
//
// Process-wide settings are read once at startup from the environment (after
// dotenv). Per-bot settings (watch-list, risk parameters, decision mode) live
// on the bot row and are reloaded every cycle, so those stay hot without a
// restart.
//
// Every field carries a serde default so that a `Config` can also be
// deserialised from JSON in tests with only the fields under test present.
// =============================================================================

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::DecisionMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_cycle_interval_secs() -> u64 {
    180
}

fn default_decision_mode() -> DecisionMode {
    DecisionMode::Trinity
}

fn default_llm_daily_cost_limit_usd() -> f64 {
    0.0
}

fn default_llm_cache_ttl_secs() -> u64 {
    180
}

fn default_true() -> bool {
    true
}

fn default_llm_max_tokens() -> u32 {
    2048
}

fn default_llm_max_tokens_discount_cap() -> u32 {
    8192
}

fn default_llm_temperature() -> f64 {
    0.3
}

fn default_prompt_max_positions() -> usize {
    8
}

fn default_prompt_max_context_symbols() -> usize {
    10
}

fn default_reasoner_min_chars() -> usize {
    6000
}

fn default_db_pool_size() -> u32 {
    20
}

fn default_db_max_overflow() -> u32 {
    80
}

fn default_db_pool_recycle_secs() -> u64 {
    3600
}

fn default_max_hold_hours() -> i64 {
    48
}

fn default_llm_model() -> String {
    "deepseek-chat".to_string()
}

fn default_llm_base_url() -> String {
    "https://api.deepseek.com/v1".to_string()
}

// =============================================================================
// Config
// =============================================================================

/// Process-wide engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // --- Cycle ----------------------------------------------------------------

    /// Seconds between cycles for a bot that does not override the interval.
    #[serde(default = "default_cycle_interval_secs")]
    pub cycle_interval_secs: u64,

    /// Decision mode assigned to bots whose row carries no mode.
    #[serde(default = "default_decision_mode")]
    pub decision_mode_default: DecisionMode,

    /// Hours an open position may age before the time-stop fires.
    #[serde(default = "default_max_hold_hours")]
    pub max_hold_hours: i64,

    // --- LLM budget & cache ---------------------------------------------------

    /// Daily provider spend ceiling in USD. Zero disables the gate.
    #[serde(default = "default_llm_daily_cost_limit_usd")]
    pub llm_daily_cost_limit_usd: f64,

    /// TTL for cached LLM responses.
    #[serde(default = "default_llm_cache_ttl_secs")]
    pub llm_cache_ttl_secs: u64,

    /// Response caching master switch.
    #[serde(default = "default_true")]
    pub llm_enable_cache: bool,

    /// Hard cap on completion tokens per call.
    #[serde(default = "default_llm_max_tokens")]
    pub llm_max_tokens_per_call: u32,

    /// Lifted token cap applied inside the provider discount window.
    #[serde(default = "default_llm_max_tokens_discount_cap")]
    pub llm_max_tokens_discount_cap: u32,

    /// Sampling temperature when the caller does not specify one.
    #[serde(default = "default_llm_temperature")]
    pub llm_temperature_default: f64,

    // --- Prompt shaping -------------------------------------------------------

    /// Maximum open positions rendered into the prompt.
    #[serde(default = "default_prompt_max_positions")]
    pub prompt_max_positions: usize,

    /// Maximum watch-list symbols rendered into the market-regime section.
    #[serde(default = "default_prompt_max_context_symbols")]
    pub prompt_max_context_symbols: usize,

    // --- DeepSeek routing -----------------------------------------------------

    /// Promote complex prompts to the reasoner model.
    #[serde(default = "default_true")]
    pub deepseek_use_reasoner_for_complex: bool,

    /// Prompt length beyond which the reasoner is preferred.
    #[serde(default = "default_reasoner_min_chars")]
    pub deepseek_reasoner_min_chars: usize,

    /// UTC discount window as "HH:MM-HH:MM", e.g. "16:30-00:30".
    #[serde(default)]
    pub deepseek_discount_utc_window: Option<String>,

    // --- Database pool --------------------------------------------------------

    #[serde(default = "default_db_pool_size")]
    pub db_pool_size: u32,

    #[serde(default = "default_db_max_overflow")]
    pub db_max_overflow: u32,

    #[serde(default = "default_db_pool_recycle_secs")]
    pub db_pool_recycle_secs: u64,

    // --- Credentials & endpoints (opaque) ------------------------------------

    #[serde(default)]
    pub database_url: String,

    #[serde(default)]
    pub redis_url: String,

    #[serde(default)]
    pub exchange_api_key: String,

    #[serde(default)]
    pub exchange_api_secret: String,

    #[serde(default)]
    pub llm_api_key: String,

    #[serde(default = "default_llm_base_url")]
    pub llm_base_url: String,

    #[serde(default = "default_llm_model")]
    pub llm_model_default: String,
}

impl Default for Config {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config deserialises from defaults")
    }
}

/// Read an environment variable and parse it, falling back to `default` on
/// absence or parse failure (parse failures are logged, not fatal).
fn env_parse<T: std::str::FromStr + std::fmt::Display>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, raw = %raw, fallback = %default, "unparseable env value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Self {
        let config = Self {
            cycle_interval_secs: env_parse("CYCLE_INTERVAL_SECONDS", default_cycle_interval_secs()),
            decision_mode_default: env_parse("DECISION_MODE_DEFAULT", default_decision_mode()),
            max_hold_hours: env_parse("MAX_HOLD_HOURS", default_max_hold_hours()),

            llm_daily_cost_limit_usd: env_parse(
                "LLM_DAILY_COST_LIMIT_USD",
                default_llm_daily_cost_limit_usd(),
            ),
            llm_cache_ttl_secs: env_parse("LLM_CACHE_TTL_SECONDS", default_llm_cache_ttl_secs()),
            llm_enable_cache: env_parse("LLM_ENABLE_CACHE", true),
            llm_max_tokens_per_call: env_parse("LLM_MAX_TOKENS_PER_CALL", default_llm_max_tokens()),
            llm_max_tokens_discount_cap: env_parse(
                "LLM_MAX_TOKENS_DISCOUNT_CAP",
                default_llm_max_tokens_discount_cap(),
            ),
            llm_temperature_default: env_parse(
                "LLM_TEMPERATURE_DEFAULT",
                default_llm_temperature(),
            ),

            prompt_max_positions: env_parse("PROMPT_MAX_POSITIONS", default_prompt_max_positions()),
            prompt_max_context_symbols: env_parse(
                "PROMPT_MAX_CONTEXT_SYMBOLS",
                default_prompt_max_context_symbols(),
            ),

            deepseek_use_reasoner_for_complex: env_parse("DEEPSEEK_USE_REASONER_FOR_COMPLEX", true),
            deepseek_reasoner_min_chars: env_parse(
                "DEEPSEEK_REASONER_MIN_CHARS",
                default_reasoner_min_chars(),
            ),
            deepseek_discount_utc_window: std::env::var("DEEPSEEK_DISCOUNT_UTC_WINDOW").ok(),

            db_pool_size: env_parse("DB_POOL_SIZE", default_db_pool_size()),
            db_max_overflow: env_parse("DB_MAX_OVERFLOW", default_db_max_overflow()),
            db_pool_recycle_secs: env_parse("DB_POOL_RECYCLE", default_db_pool_recycle_secs()),

            database_url: env_string("DATABASE_URL", ""),
            redis_url: env_string("REDIS_URL", "redis://127.0.0.1:6379"),
            exchange_api_key: env_string("EXCHANGE_API_KEY", ""),
            exchange_api_secret: env_string("EXCHANGE_API_SECRET", ""),
            llm_api_key: env_string("LLM_API_KEY", ""),
            llm_base_url: env_string("LLM_BASE_URL", &default_llm_base_url()),
            llm_model_default: env_string("LLM_MODEL_DEFAULT", &default_llm_model()),
        };

        info!(
            cycle_interval_secs = config.cycle_interval_secs,
            decision_mode = %config.decision_mode_default,
            llm_daily_cost_limit_usd = config.llm_daily_cost_limit_usd,
            db_pool_size = config.db_pool_size,
            "engine config loaded"
        );

        config
    }

    /// Parse the discount window into a pair of UTC times, if configured.
    ///
    /// The window may wrap midnight ("16:30-00:30").
    pub fn discount_window(&self) -> Option<(NaiveTime, NaiveTime)> {
        let raw = self.deepseek_discount_utc_window.as_deref()?;
        let (start, end) = raw.split_once('-')?;
        let start = NaiveTime::parse_from_str(start.trim(), "%H:%M").ok()?;
        let end = NaiveTime::parse_from_str(end.trim(), "%H:%M").ok()?;
        Some((start, end))
    }

    /// True when `now` falls inside the discount window (handles wrap).
    pub fn in_discount_window(&self, now: NaiveTime) -> bool {
        match self.discount_window() {
            Some((start, end)) if start <= end => now >= start && now < end,
            Some((start, end)) => now >= start || now < end,
            None => false,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = Config::default();
        assert_eq!(cfg.cycle_interval_secs, 180);
        assert_eq!(cfg.decision_mode_default, DecisionMode::Trinity);
        assert_eq!(cfg.llm_daily_cost_limit_usd, 0.0);
        assert_eq!(cfg.llm_cache_ttl_secs, 180);
        assert!(cfg.llm_enable_cache);
        assert_eq!(cfg.db_pool_size, 20);
        assert_eq!(cfg.db_max_overflow, 80);
        assert_eq!(cfg.db_pool_recycle_secs, 3600);
        assert_eq!(cfg.llm_model_default, "deepseek-chat");
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "cycle_interval_secs": 90, "llm_daily_cost_limit_usd": 1.5 }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.llm_daily_cost_limit_usd, 1.5);
        assert_eq!(cfg.cycle_interval_secs, 90);
        assert_eq!(cfg.prompt_max_positions, 8);
    }

    #[test]
    fn discount_window_simple() {
        let cfg = Config {
            deepseek_discount_utc_window: Some("02:00-08:00".to_string()),
            ..Config::default()
        };
        assert!(cfg.in_discount_window(NaiveTime::from_hms_opt(5, 0, 0).unwrap()));
        assert!(!cfg.in_discount_window(NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
    }

    #[test]
    fn discount_window_wraps_midnight() {
        let cfg = Config {
            deepseek_discount_utc_window: Some("16:30-00:30".to_string()),
            ..Config::default()
        };
        assert!(cfg.in_discount_window(NaiveTime::from_hms_opt(23, 0, 0).unwrap()));
        assert!(cfg.in_discount_window(NaiveTime::from_hms_opt(0, 15, 0).unwrap()));
        assert!(!cfg.in_discount_window(NaiveTime::from_hms_opt(10, 0, 0).unwrap()));
    }

    #[test]
    fn discount_window_absent_or_malformed() {
        let cfg = Config::default();
        assert!(cfg.discount_window().is_none());

        let bad = Config {
            deepseek_discount_utc_window: Some("not-a-window".to_string()),
            ..Config::default()
        };
        assert!(bad.discount_window().is_none());
        assert!(!bad.in_discount_window(NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
    }
}
