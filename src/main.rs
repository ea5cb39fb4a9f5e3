// =============================================================================
// Meridian — Main Entry Point
// =============================================================================
//
// Wires the container from the environment and runs the scheduler until a
// shutdown signal arrives. Bots start whatever status their rows carry;
// activation is an administrative write to the bots table.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod cache;
mod config;
mod container;
mod db;
mod decision;
mod error;
mod exchange;
mod execution;
mod indicators;
mod llm_client;
mod market_data;
mod memory;
mod monitor;
mod orchestrator;
mod portfolio;
mod risk;
mod scheduler;
mod types;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::container::Container;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Meridian trading engine starting");

    let config = Config::from_env();
    if config.database_url.is_empty() {
        anyhow::bail!("DATABASE_URL is required");
    }

    // ── 2. Build the dependency graph ────────────────────────────────────
    let container = Container::build(config).await?;

    // ── 3. Run the scheduler ─────────────────────────────────────────────
    let scheduler = container.scheduler.clone();
    let run_handle = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.run().await }
    });

    info!("all subsystems running, press Ctrl+C to stop");

    // ── 4. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    scheduler.shutdown().await;
    run_handle.abort();

    info!("Meridian shut down complete");
    Ok(())
}
