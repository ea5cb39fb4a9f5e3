// =============================================================================
// LLM decision block — one batched prompt per cycle, per-symbol isolation
// =============================================================================
//
// One provider call covers the whole watch-list. The response is parsed
// tolerantly; a symbol that fails to parse degrades to `hold @ 0.5` with
// reason "parse_error" while the rest of the batch proceeds. When the
// client short-circuits on the daily budget every symbol holds with reason
// "budget_exhausted".
//
// After parsing, TradeMemory scales each confidence by the symbol's
// historical win rate (factor in [0.7, 1.3]).
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::{Bot, LlmDecisionRepo};
use crate::decision::parser::parse_batch;
use crate::decision::prompt::{render_prompt, PromptLimits, SessionContext};
use crate::decision::{DecisionBlock, TradingSignal};
use crate::llm_client::LlmClient;
use crate::market_data::MarketSnapshot;
use crate::memory::TradeMemory;
use crate::portfolio::PortfolioState;
use crate::types::DecisionMode;

/// Per-bot session counters for the prompt's session-context section.
struct SessionCounters {
    started_at: DateTime<Utc>,
    invocations: u64,
}

/// The LLM-advised decision block.
pub struct LlmDecisionBlock {
    client: Arc<LlmClient>,
    memory: Arc<TradeMemory>,
    audit: Option<LlmDecisionRepo>,
    limits: PromptLimits,
    sessions: RwLock<HashMap<Uuid, SessionCounters>>,
}

impl LlmDecisionBlock {
    pub fn new(
        config: &Config,
        client: Arc<LlmClient>,
        memory: Arc<TradeMemory>,
        audit: Option<LlmDecisionRepo>,
    ) -> Self {
        Self {
            client,
            memory,
            audit,
            limits: PromptLimits {
                max_positions: config.prompt_max_positions,
                max_context_symbols: config.prompt_max_context_symbols,
            },
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Bump and read the session counters for this bot.
    fn session_context(&self, bot_id: Uuid) -> SessionContext {
        let now = Utc::now();
        let mut sessions = self.sessions.write();
        let counters = sessions.entry(bot_id).or_insert_with(|| SessionCounters {
            started_at: now,
            invocations: 0,
        });
        let context = SessionContext {
            started_at: counters.started_at,
            invocations: counters.invocations,
            now,
        };
        counters.invocations += 1;
        context
    }

    /// Every watched symbol holds with the given reason.
    fn hold_all(symbols: &[String], reason: &str) -> BTreeMap<String, TradingSignal> {
        symbols
            .iter()
            .map(|s| (s.clone(), TradingSignal::neutral_hold(s, reason)))
            .collect()
    }
}

#[async_trait]
impl DecisionBlock for LlmDecisionBlock {
    fn mode(&self) -> DecisionMode {
        DecisionMode::Llm
    }

    async fn decide(
        &self,
        bot: &Bot,
        snapshots: &BTreeMap<String, MarketSnapshot>,
        portfolio: &PortfolioState,
    ) -> BTreeMap<String, TradingSignal> {
        let symbols: Vec<String> = snapshots.keys().cloned().collect();
        if symbols.is_empty() {
            return BTreeMap::new();
        }

        let session = self.session_context(bot.id);
        let prompt = render_prompt(bot, snapshots, portfolio, &session, &self.limits);

        let response = match self
            .client
            .complete(&prompt, bot.model_name.as_deref(), None, None)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(bot_id = %bot.id, error = %e, "llm call failed, holding all symbols");
                return Self::hold_all(&symbols, "llm_error");
            }
        };

        if response.is_budget_exhausted() {
            return Self::hold_all(&symbols, "budget_exhausted");
        }

        let mut signals = parse_batch(&response.text, &symbols);

        // Memory-weighted confidence, applied post-parse.
        for (symbol, signal) in signals.iter_mut() {
            let factor = self.memory.confidence_adjust(bot.id, symbol).await;
            if factor != 1.0 {
                let adjusted = (signal.confidence * factor).clamp(0.0, 1.0);
                debug!(
                    symbol = %symbol,
                    raw = signal.confidence,
                    factor,
                    adjusted,
                    "memory confidence adjustment"
                );
                signal.confidence = adjusted;
            }
        }

        // Audit trail, best-effort: cost split evenly across the batch so
        // per-row sums match the call totals.
        if let Some(audit) = &self.audit {
            let share = symbols.len() as u64;
            let cost_share = rust_decimal::Decimal::from_f64_retain(response.cost_usd / share as f64)
                .unwrap_or_default();
            for symbol in &symbols {
                if let Err(e) = audit
                    .insert(
                        bot.id,
                        symbol,
                        &response.prompt_hash,
                        &response.text,
                        (response.tokens_in / share) as i64,
                        (response.tokens_out / share) as i64,
                        cost_share,
                    )
                    .await
                {
                    warn!(symbol = %symbol, error = %e, "llm audit row failed");
                }
            }
        }

        signals
    }
}
