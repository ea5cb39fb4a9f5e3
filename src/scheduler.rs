// =============================================================================
// Scheduler — one periodic task per active bot, per-bot cycle serialisation
// =============================================================================
//
// A discovery loop polls the bot table and keeps exactly one ticker task
// alive per active bot. Each firing runs one orchestrator cycle under the
// bot's mutex (a cycle never overlaps itself) and under a deadline of 2x
// the interval; a blown deadline cancels the cycle's pending I/O, logs
// `cycle_timeout`, and releases the mutex.
//
// Shutdown: stop scheduling (no new cycles), wait up to 30 s for in-flight
// cycles, then abort the rest.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::BotRepo;
use crate::error::EngineError;
use crate::orchestrator::Orchestrator;

/// How often the discovery loop re-reads the active bot set.
const DISCOVERY_INTERVAL: Duration = Duration::from_secs(30);
/// Grace period for in-flight cycles at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Owns the per-bot tasks and the shutdown sequence.
pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    bots: BotRepo,
    cycle_interval: Duration,
    tasks: RwLock<HashMap<Uuid, JoinHandle<()>>>,
    locks: Arc<RwLock<HashMap<Uuid, Arc<Mutex<()>>>>>,
    in_flight: Arc<AtomicUsize>,
    shutdown_tx: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<Orchestrator>, bots: BotRepo, cycle_interval: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            orchestrator,
            bots,
            cycle_interval,
            tasks: RwLock::new(HashMap::new()),
            locks: Arc::new(RwLock::new(HashMap::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        }
    }

    /// Run the discovery loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            cycle_interval_secs = self.cycle_interval.as_secs(),
            "scheduler started"
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = interval(DISCOVERY_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile_tasks().await {
                        error!(error = %e, "bot discovery failed");
                    }
                }
            }
        }

        info!("scheduler loop stopped");
    }

    /// Align the running tasks with the active bot set.
    async fn reconcile_tasks(&self) -> Result<(), EngineError> {
        let active = self.bots.list_active().await?;
        let active_ids: Vec<Uuid> = active.iter().map(|b| b.id).collect();

        // Start tasks for new bots.
        for bot in &active {
            let mut tasks = self.tasks.write();
            if tasks.contains_key(&bot.id) {
                continue;
            }
            info!(bot_id = %bot.id, name = %bot.name, "starting bot cycle task");
            tasks.insert(bot.id, self.spawn_bot_task(bot.id));
        }

        // Drop tasks for retired bots (their next cycle would no-op anyway;
        // stopping the ticker frees the slot).
        let stale: Vec<Uuid> = {
            let tasks = self.tasks.read();
            tasks
                .keys()
                .filter(|id| !active_ids.contains(id))
                .copied()
                .collect()
        };
        for id in stale {
            if let Some(handle) = self.tasks.write().remove(&id) {
                info!(bot_id = %id, "stopping bot cycle task");
                handle.abort();
            }
        }

        Ok(())
    }

    /// Spawn the periodic cycle task for one bot.
    fn spawn_bot_task(&self, bot_id: Uuid) -> JoinHandle<()> {
        let orchestrator = self.orchestrator.clone();
        let locks = self.locks.clone();
        let in_flight = self.in_flight.clone();
        let cycle_interval = self.cycle_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(cycle_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The deadline is twice the interval.
            let deadline = cycle_interval * 2;

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {}
                }

                let lock = {
                    let mut locks = locks.write();
                    locks
                        .entry(bot_id)
                        .or_insert_with(|| Arc::new(Mutex::new(())))
                        .clone()
                };

                // A cycle for the same bot never overlaps itself.
                let Ok(_guard) = lock.try_lock() else {
                    warn!(bot_id = %bot_id, "previous cycle still running, tick skipped");
                    continue;
                };

                in_flight.fetch_add(1, Ordering::SeqCst);
                match timeout(deadline, orchestrator.run_cycle(bot_id)).await {
                    Ok(Ok(())) => debug!(bot_id = %bot_id, "cycle complete"),
                    Ok(Err(e)) => {
                        // Fatal for this cycle only; the ticker continues.
                        error!(
                            bot_id = %bot_id,
                            phase = "cycle",
                            kind = "fatal",
                            reason = %e,
                            "cycle failed"
                        );
                    }
                    Err(_) => {
                        error!(
                            bot_id = %bot_id,
                            phase = "cycle",
                            kind = "cycle_timeout",
                            deadline_secs = deadline.as_secs(),
                            "cycle deadline exceeded, pending I/O cancelled"
                        );
                    }
                }
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }

            debug!(bot_id = %bot_id, "bot cycle task exited");
        })
    }

    /// Graceful shutdown: no new cycles, bounded wait, then abort.
    pub async fn shutdown(&self) {
        info!("scheduler shutting down");
        let _ = self.shutdown_tx.send(true);

        let waited = timeout(SHUTDOWN_GRACE, async {
            while self.in_flight.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        })
        .await;

        if waited.is_err() {
            warn!(
                remaining = self.in_flight.load(Ordering::SeqCst),
                "grace period elapsed, aborting remaining cycles"
            );
        }

        for (_, handle) in self.tasks.write().drain() {
            handle.abort();
        }
        info!("scheduler stopped");
    }
}
