// =============================================================================
// LLM Client — cost-gated, cached chat-completion calls with JSON recovery
// =============================================================================
//
// Call path: budget gate -> response cache -> model routing -> provider.
//
//   - Budget gate: daily cost/token aggregates live in the cache under
//     `llm:cost:YYYYMMDD` / `llm:tokens:YYYYMMDD`. When a positive daily
//     limit would be exceeded the client returns a synthetic hold response
//     tagged `budget_exhausted` without touching the provider.
//   - Cache: responses keyed by sha256(model | max_tokens | temperature |
//     prompt); bypassed at temperature > 0.9 or when disabled.
//   - Routing: DeepSeek-family model hints pick `deepseek-chat` unless the
//     prompt is long/complex enough for `deepseek-reasoner`; the UTC
//     discount window lifts the completion-token cap.
//
// The provider speaks the OpenAI-compatible /chat/completions shape.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::cache::Cache;
use crate::config::Config;
use crate::error::EngineError;

/// Retry budget for transient provider failures.
const PROVIDER_RETRIES: u32 = 2;
/// Temperature above which responses are too random to cache.
const CACHE_MAX_TEMPERATURE: f64 = 0.9;
/// Rough chars-per-token estimate for pre-call cost projection.
const CHARS_PER_TOKEN: usize = 4;

/// Keywords that mark a prompt as complex enough for the reasoner model.
const COMPLEXITY_KEYWORDS: &[&str] = &["divergence", "correlation", "multi-timeframe", "regime shift"];

/// Per-million-token pricing (input, output) in USD.
fn model_pricing(model: &str) -> (f64, f64) {
    match model {
        "deepseek-reasoner" => (0.55, 2.19),
        "deepseek-chat" => (0.27, 1.10),
        _ => (0.50, 1.50),
    }
}

/// Outcome of a completion call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    pub model: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    /// True when the response came from the cache (no provider call).
    pub cached: bool,
    /// Set on synthetic responses ("budget_exhausted").
    pub short_circuit: Option<String>,
    /// Fingerprint of (model, params, prompt); keys the audit trail.
    pub prompt_hash: String,
}

impl LlmResponse {
    pub fn is_budget_exhausted(&self) -> bool {
        self.short_circuit.as_deref() == Some("budget_exhausted")
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Default, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Cost-gated, cached LLM client shared by all bots.
pub struct LlmClient {
    config: Config,
    cache: Arc<dyn Cache>,
    http: reqwest::Client,
    /// Day for which the budget-exhausted warning has been emitted already
    /// (the event is logged once per day, then gated silently).
    exhausted_logged_day: parking_lot::Mutex<String>,
}

impl LlmClient {
    pub fn new(config: Config, cache: Arc<dyn Cache>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("failed to build reqwest client");
        Self {
            config,
            cache,
            http,
            exhausted_logged_day: parking_lot::Mutex::new(String::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Public API
    // -------------------------------------------------------------------------

    /// Run one completion through the gate, cache, and provider.
    pub async fn complete(
        &self,
        prompt: &str,
        model_hint: Option<&str>,
        max_tokens: Option<u32>,
        temperature: Option<f64>,
    ) -> Result<LlmResponse, EngineError> {
        let temperature = temperature.unwrap_or(self.config.llm_temperature_default);
        let model = self.route_model(prompt, model_hint);
        let max_tokens = self.effective_max_tokens(max_tokens);
        let prompt_hash = fingerprint(&model, max_tokens, temperature, prompt);

        // --- Budget gate -------------------------------------------------
        if let Some(synthetic) = self.check_budget(prompt, max_tokens, &model, &prompt_hash).await {
            return Ok(synthetic);
        }

        // --- Response cache ----------------------------------------------
        let cacheable = self.config.llm_enable_cache && temperature <= CACHE_MAX_TEMPERATURE;
        let cache_key = format!("llm:resp:{prompt_hash}");
        if cacheable {
            if let Some(cached) = self.cache.get(&cache_key).await {
                if let Ok(mut response) = serde_json::from_str::<LlmResponse>(&cached) {
                    debug!(model = %model, "llm response cache hit");
                    response.cached = true;
                    response.cost_usd = 0.0;
                    return Ok(response);
                }
            }
        }

        // --- Provider call -----------------------------------------------
        let mut response = self
            .call_provider(prompt, &model, max_tokens, temperature)
            .await?;
        response.prompt_hash = prompt_hash;

        // --- Accounting --------------------------------------------------
        let day = Utc::now().format("%Y%m%d");
        self.cache
            .incr_f64(&format!("llm:cost:{day}"), response.cost_usd)
            .await;
        self.cache
            .incr_i64(
                &format!("llm:tokens:{day}"),
                (response.tokens_in + response.tokens_out) as i64,
            )
            .await;

        if cacheable {
            if let Ok(json) = serde_json::to_string(&response) {
                self.cache
                    .set_ex(
                        &cache_key,
                        &json,
                        Duration::from_secs(self.config.llm_cache_ttl_secs),
                    )
                    .await;
            }
        }

        Ok(response)
    }

    /// Today's accumulated provider spend, from the cache aggregate.
    pub async fn cost_today(&self) -> f64 {
        let key = format!("llm:cost:{}", Utc::now().format("%Y%m%d"));
        self.cache
            .get(&key)
            .await
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.0)
    }

    // -------------------------------------------------------------------------
    // Routing
    // -------------------------------------------------------------------------

    /// Pick the concrete model for this prompt.
    fn route_model(&self, prompt: &str, model_hint: Option<&str>) -> String {
        let hinted = model_hint
            .filter(|m| !m.is_empty())
            .unwrap_or(&self.config.llm_model_default);

        if !hinted.starts_with("deepseek") {
            return hinted.to_string();
        }

        // DeepSeek family: promote long or complex prompts to the reasoner.
        if self.config.deepseek_use_reasoner_for_complex {
            let long = prompt.len() > self.config.deepseek_reasoner_min_chars;
            let complex = {
                let lower = prompt.to_lowercase();
                COMPLEXITY_KEYWORDS.iter().any(|kw| lower.contains(kw))
            };
            if long || complex {
                return "deepseek-reasoner".to_string();
            }
        }

        if hinted == "deepseek-reasoner" {
            hinted.to_string()
        } else {
            "deepseek-chat".to_string()
        }
    }

    /// Apply the configured token cap, lifted inside the discount window.
    fn effective_max_tokens(&self, requested: Option<u32>) -> u32 {
        let cap = if self.config.in_discount_window(Utc::now().time()) {
            self.config.llm_max_tokens_discount_cap
        } else {
            self.config.llm_max_tokens_per_call
        };
        requested.unwrap_or(cap).min(cap)
    }

    // -------------------------------------------------------------------------
    // Budget gate
    // -------------------------------------------------------------------------

    /// Synthetic hold response when the daily budget would be exceeded.
    /// A zero limit disables the gate.
    async fn check_budget(
        &self,
        prompt: &str,
        max_tokens: u32,
        model: &str,
        prompt_hash: &str,
    ) -> Option<LlmResponse> {
        let limit = self.config.llm_daily_cost_limit_usd;
        if limit <= 0.0 {
            return None;
        }

        let spent = self.cost_today().await;
        let estimated = estimate_cost(model, prompt.len(), max_tokens);

        if spent + estimated <= limit {
            return None;
        }

        let today = Utc::now().format("%Y%m%d").to_string();
        {
            let mut logged = self.exhausted_logged_day.lock();
            if *logged != today {
                warn!(
                    spent_usd = spent,
                    estimated_usd = estimated,
                    limit_usd = limit,
                    "llm daily budget exhausted, returning synthetic holds for the rest of the day"
                );
                *logged = today;
            }
        }

        Some(LlmResponse {
            text: "{}".to_string(),
            model: model.to_string(),
            tokens_in: 0,
            tokens_out: 0,
            cost_usd: 0.0,
            cached: false,
            short_circuit: Some("budget_exhausted".to_string()),
            prompt_hash: prompt_hash.to_string(),
        })
    }

    // -------------------------------------------------------------------------
    // Provider
    // -------------------------------------------------------------------------

    async fn call_provider(
        &self,
        prompt: &str,
        model: &str,
        max_tokens: u32,
        temperature: f64,
    ) -> Result<LlmResponse, EngineError> {
        let url = format!("{}/chat/completions", self.config.llm_base_url);
        let body = serde_json::json!({
            "model": model,
            "messages": [{ "role": "user", "content": prompt }],
            "max_tokens": max_tokens,
            "temperature": temperature,
        });

        let mut delay = Duration::from_millis(500);
        let mut last_err = None;

        for attempt in 1..=PROVIDER_RETRIES + 1 {
            let result = self
                .http
                .post(&url)
                .bearer_auth(&self.config.llm_api_key)
                .json(&body)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => {
                    let parsed: ChatCompletionResponse = resp
                        .json()
                        .await
                        .map_err(|e| EngineError::Llm(format!("bad completion payload: {e}")))?;

                    let text = parsed
                        .choices
                        .first()
                        .map(|c| c.message.content.clone())
                        .ok_or_else(|| EngineError::Llm("completion had no choices".into()))?;

                    let usage = parsed.usage.unwrap_or_default();
                    let (in_per_m, out_per_m) = model_pricing(model);
                    let cost_usd = usage.prompt_tokens as f64 / 1_000_000.0 * in_per_m
                        + usage.completion_tokens as f64 / 1_000_000.0 * out_per_m;

                    info!(
                        model,
                        tokens_in = usage.prompt_tokens,
                        tokens_out = usage.completion_tokens,
                        cost_usd,
                        "llm completion"
                    );

                    return Ok(LlmResponse {
                        text: extract_json(&text),
                        model: model.to_string(),
                        tokens_in: usage.prompt_tokens,
                        tokens_out: usage.completion_tokens,
                        cost_usd,
                        cached: false,
                        short_circuit: None,
                        prompt_hash: String::new(),
                    });
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    last_err = Some(format!("provider returned {status}: {body}"));
                }
                Err(e) => {
                    last_err = Some(e.to_string());
                }
            }

            if attempt <= PROVIDER_RETRIES {
                warn!(attempt, error = ?last_err, "llm call failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }

        Err(EngineError::Llm(
            last_err.unwrap_or_else(|| "unknown provider failure".into()),
        ))
    }
}

// =============================================================================
// Free helpers
// =============================================================================

/// sha256 fingerprint of (model, max_tokens, temperature, prompt).
pub fn fingerprint(model: &str, max_tokens: u32, temperature: f64, prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update(b"|");
    hasher.update(max_tokens.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(format!("{temperature:.3}").as_bytes());
    hasher.update(b"|");
    hasher.update(prompt.as_bytes());
    hex::encode(hasher.finalize())
}

/// Pre-call cost projection from prompt length and the completion cap.
fn estimate_cost(model: &str, prompt_chars: usize, max_tokens: u32) -> f64 {
    let (in_per_m, out_per_m) = model_pricing(model);
    let tokens_in = (prompt_chars / CHARS_PER_TOKEN) as f64;
    tokens_in / 1_000_000.0 * in_per_m + max_tokens as f64 / 1_000_000.0 * out_per_m
}

/// Recover the JSON object from a possibly-wrapped provider response:
/// strip ```json fences, then take the outermost balanced `{...}` using a
/// bracket count that respects string literals. Returns the input trimmed
/// when no balanced object is found (the parser will fail it per symbol).
pub fn extract_json(text: &str) -> String {
    let mut body = text.trim();

    // Strip Markdown fences.
    if body.starts_with("```") {
        body = body.trim_start_matches("```json").trim_start_matches("```");
        if let Some(end) = body.rfind("```") {
            body = &body[..end];
        }
        body = body.trim();
    }

    // Outermost balanced braces.
    let start = match body.find('{') {
        Some(i) => i,
        None => return body.to_string(),
    };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in body[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return body[start..start + i + 1].to_string();
                }
            }
            _ => {}
        }
    }

    body.to_string()
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;

    fn client_with(config: Config) -> LlmClient {
        LlmClient::new(config, Arc::new(MemoryCache::new()))
    }

    // ---- extract_json ------------------------------------------------------

    #[test]
    fn extract_json_passthrough() {
        assert_eq!(extract_json(r#"{"a": 1}"#), r#"{"a": 1}"#);
    }

    #[test]
    fn extract_json_strips_fences() {
        let wrapped = "```json\n{\"a\": 1}\n```";
        assert_eq!(extract_json(wrapped), "{\"a\": 1}");
    }

    #[test]
    fn extract_json_takes_outermost_braces() {
        let noisy = "Here is my answer:\n{\"a\": {\"b\": 2}}\nHope this helps!";
        assert_eq!(extract_json(noisy), "{\"a\": {\"b\": 2}}");
    }

    #[test]
    fn extract_json_ignores_braces_in_strings() {
        let tricky = r#"{"reason": "uses { and } inside", "x": 1}"#;
        assert_eq!(extract_json(tricky), tricky);
    }

    #[test]
    fn extract_json_unbalanced_returns_input() {
        let broken = "{\"a\": 1";
        assert_eq!(extract_json(broken), broken);
    }

    // ---- fingerprint -------------------------------------------------------

    #[test]
    fn fingerprint_is_stable_and_sensitive() {
        let a = fingerprint("deepseek-chat", 1024, 0.3, "prompt");
        let b = fingerprint("deepseek-chat", 1024, 0.3, "prompt");
        let c = fingerprint("deepseek-chat", 1024, 0.3, "other prompt");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    // ---- routing -----------------------------------------------------------

    #[test]
    fn routing_defaults_to_chat_model() {
        let client = client_with(Config::default());
        assert_eq!(client.route_model("short prompt", None), "deepseek-chat");
    }

    #[test]
    fn routing_promotes_long_prompts() {
        let client = client_with(Config::default());
        let long_prompt = "x".repeat(7000);
        assert_eq!(client.route_model(&long_prompt, None), "deepseek-reasoner");
    }

    #[test]
    fn routing_promotes_complexity_keywords() {
        let client = client_with(Config::default());
        let prompt = "watch for bearish divergence across assets";
        assert_eq!(client.route_model(prompt, None), "deepseek-reasoner");
    }

    #[test]
    fn routing_respects_non_deepseek_hint() {
        let client = client_with(Config::default());
        assert_eq!(client.route_model("anything", Some("gpt-4o-mini")), "gpt-4o-mini");
    }

    #[test]
    fn routing_no_promotion_when_disabled() {
        let config = Config {
            deepseek_use_reasoner_for_complex: false,
            ..Config::default()
        };
        let client = client_with(config);
        let long_prompt = "x".repeat(7000);
        assert_eq!(client.route_model(&long_prompt, None), "deepseek-chat");
    }

    // ---- budget gate -------------------------------------------------------

    #[tokio::test]
    async fn budget_gate_disabled_at_zero() {
        let client = client_with(Config::default());
        assert!(client.check_budget("prompt", 1000, "deepseek-chat", "h").await.is_none());
    }

    #[tokio::test]
    async fn budget_gate_trips_over_limit() {
        let cache = Arc::new(MemoryCache::new());
        let config = Config {
            llm_daily_cost_limit_usd: 1.0,
            ..Config::default()
        };
        let client = LlmClient::new(config, cache.clone());

        // Pre-load today's spend past the limit.
        let key = format!("llm:cost:{}", Utc::now().format("%Y%m%d"));
        cache.incr_f64(&key, 1.05).await;

        let synthetic = client
            .check_budget("prompt", 1000, "deepseek-chat", "h")
            .await
            .expect("gate should trip");
        assert!(synthetic.is_budget_exhausted());
        assert_eq!(synthetic.cost_usd, 0.0);
    }

    #[tokio::test]
    async fn budget_gate_allows_under_limit() {
        let config = Config {
            llm_daily_cost_limit_usd: 5.0,
            ..Config::default()
        };
        let client = client_with(config);
        assert!(client.check_budget("tiny", 100, "deepseek-chat", "h").await.is_none());
    }

    // ---- token caps --------------------------------------------------------

    #[test]
    fn max_tokens_capped_outside_discount_window() {
        let client = client_with(Config::default());
        assert_eq!(client.effective_max_tokens(Some(100_000)), 2048);
        assert_eq!(client.effective_max_tokens(Some(512)), 512);
        assert_eq!(client.effective_max_tokens(None), 2048);
    }

    #[test]
    fn estimate_cost_scales_with_size() {
        let small = estimate_cost("deepseek-chat", 400, 500);
        let large = estimate_cost("deepseek-chat", 40_000, 4000);
        assert!(large > small);
        assert!(small > 0.0);
    }
}
