// =============================================================================
// Container — the engine's dependency graph, wired once at startup
// =============================================================================
//
// Owns the shared collaborators (exchange client, database pool, cache, LLM
// client, trade memory) and hands each block its dependencies through the
// constructor. There is no other shared in-process state: the database and
// cache are the synchronisation points between bots.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::cache::{Cache, MemoryCache, RedisCache};
use crate::config::Config;
use crate::db::{self, BotRepo, CycleRepo, LlmDecisionRepo, PositionRepo, TradeRepo};
use crate::decision::{DecisionBlock, IndicatorDecisionBlock, LlmDecisionBlock, TrinityDecisionBlock};
use crate::exchange::{BinanceClient, Exchange};
use crate::execution::ExecutionBlock;
use crate::llm_client::LlmClient;
use crate::market_data::MarketDataBlock;
use crate::memory::TradeMemory;
use crate::monitor::PositionMonitor;
use crate::orchestrator::Orchestrator;
use crate::portfolio::PortfolioBlock;
use crate::risk::RiskBlock;
use crate::scheduler::Scheduler;

/// Fully wired engine.
pub struct Container {
    pub config: Config,
    pub pool: PgPool,
    pub cache: Arc<dyn Cache>,
    pub exchange: Arc<dyn Exchange>,
    pub memory: Arc<TradeMemory>,
    pub llm: Arc<LlmClient>,
    pub bots: BotRepo,
    pub orchestrator: Arc<Orchestrator>,
    pub scheduler: Arc<Scheduler>,
}

impl Container {
    /// Build the dependency graph from configuration.
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        // --- Persistence --------------------------------------------------
        let pool = db::connect(&config)
            .await
            .context("database connection failed")?;
        db::init_schema(&pool)
            .await
            .context("schema bootstrap failed")?;

        // --- Cache (best-effort: fall back to in-memory) ------------------
        let cache: Arc<dyn Cache> = match RedisCache::connect(&config.redis_url).await {
            Ok(redis) => Arc::new(redis),
            Err(e) => {
                warn!(error = %e, "redis unavailable, using in-process cache");
                Arc::new(MemoryCache::new())
            }
        };

        // --- Shared collaborators ----------------------------------------
        let exchange: Arc<dyn Exchange> = Arc::new(BinanceClient::new(
            config.exchange_api_key.clone(),
            config.exchange_api_secret.clone(),
        ));
        let memory = Arc::new(TradeMemory::new(cache.clone()));
        let llm = Arc::new(LlmClient::new(config.clone(), cache.clone()));

        // --- Repositories -------------------------------------------------
        let bots = BotRepo::new(pool.clone());
        let positions = PositionRepo::new(pool.clone());
        let trades = TradeRepo::new(pool.clone());
        let cycles = CycleRepo::new(pool.clone());
        let llm_audit = LlmDecisionRepo::new(pool.clone());

        // --- Blocks --------------------------------------------------------
        let market_data = MarketDataBlock::new(exchange.clone(), cache.clone());
        let portfolio = PortfolioBlock::new(bots.clone(), positions.clone(), trades.clone());
        let execution = Arc::new(ExecutionBlock::new(
            pool.clone(),
            bots.clone(),
            positions.clone(),
            trades.clone(),
            exchange.clone(),
            memory.clone(),
        ));
        let monitor = PositionMonitor::new(positions.clone(), execution.clone(), config.max_hold_hours);
        let risk = RiskBlock::new(memory.clone());

        let trinity: Arc<dyn DecisionBlock> = Arc::new(TrinityDecisionBlock::new());
        let llm_block: Arc<dyn DecisionBlock> = Arc::new(LlmDecisionBlock::new(
            &config,
            llm.clone(),
            memory.clone(),
            Some(llm_audit),
        ));
        let indicator: Arc<dyn DecisionBlock> = Arc::new(IndicatorDecisionBlock::new());

        let orchestrator = Arc::new(Orchestrator::new(
            bots.clone(),
            market_data,
            portfolio,
            monitor,
            risk,
            execution,
            cycles,
            trinity,
            llm_block,
            indicator,
        ));

        let scheduler = Arc::new(Scheduler::new(
            orchestrator.clone(),
            bots.clone(),
            Duration::from_secs(config.cycle_interval_secs),
        ));

        info!("engine container wired");

        Ok(Self {
            config,
            pool,
            cache,
            exchange,
            memory,
            llm,
            bots,
            orchestrator,
            scheduler,
        })
    }
}
