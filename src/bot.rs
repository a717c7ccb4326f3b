//! Bot runner: wires watchers, the worker pool and reconciliation together.
//!
//! Handles:
//! - One watcher task per leader feeding a bounded queue
//! - A fixed-size worker pool mirroring queued trades
//! - A health check and reconciliation at startup, reconciliation on a timer
//! - Graceful shutdown that lets in-flight mirrors settle

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::api::MarketClient;
use crate::db::Database;
use crate::error::MirrorResult;
use crate::health;
use crate::models::{FollowerPosition, LeaderTrade};
use crate::trading::{EventWatcher, MirrorConfig, MirrorCoordinator, ReconcileReport};

/// Trades buffered per worker between the watchers and the pool.
const QUEUE_DEPTH_PER_WORKER: usize = 16;

/// Main bot runner.
pub struct Bot {
    config: MirrorConfig,
    db: Database,
    venue: Arc<dyn MarketClient>,
    coordinator: Arc<MirrorCoordinator>,

    // Shutdown signal
    shutdown: Arc<watch::Sender<bool>>,
}

impl Bot {
    pub fn new(config: MirrorConfig, db: Database, venue: Arc<dyn MarketClient>) -> Self {
        let coordinator = Arc::new(MirrorCoordinator::new(
            db.clone(),
            venue.clone(),
            config.sizing.clone(),
            config.execution.clone(),
        ));
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            db,
            venue,
            coordinator,
            shutdown: Arc::new(shutdown),
        }
    }

    /// Sender that stops the run loop when set to `true`.
    pub fn shutdown_signal(&self) -> Arc<watch::Sender<bool>> {
        self.shutdown.clone()
    }

    /// One reconciliation pass over every non-terminal record.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport> {
        self.coordinator
            .reconcile_pass()
            .await
            .context("reconciliation pass failed")
    }

    /// Main run loop. Returns when shutdown is requested or a fatal
    /// storage error stops the pipeline.
    pub async fn run(&self) -> Result<()> {
        info!(
            venue = self.venue.name(),
            leaders = self.config.leaders.len(),
            workers = self.config.workers,
            dry_run = self.config.dry_run,
            "Starting mirror loop"
        );

        let health = health::check(&self.db, self.venue.as_ref(), &self.config).await;
        health.log();
        if health.database.is_error() {
            anyhow::bail!("state store failed the startup health check");
        }
        if !health.healthy() {
            warn!("Health check failed, continuing startup");
        }

        let report = self
            .reconcile_once()
            .await
            .context("startup reconciliation failed")?;
        info!(%report, "Startup reconciliation complete");

        // Register shutdown handler
        let shutdown = self.shutdown.clone();
        let ctrl_c = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                shutdown.send_replace(true);
            }
        });

        let (tx, mut rx) = mpsc::channel(self.config.workers * QUEUE_DEPTH_PER_WORKER);
        let mut watchers = self.spawn_watchers(tx);

        let permits = Arc::new(Semaphore::new(self.config.workers));
        let mut workers: JoinSet<MirrorResult<()>> = JoinSet::new();
        let mut reconciler: JoinSet<MirrorResult<ReconcileReport>> = JoinSet::new();

        let mut reconcile_timer = interval(self.config.reconcile_interval);
        reconcile_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        reconcile_timer.tick().await;

        let mut stop = self.shutdown.subscribe();
        let mut fatal: Option<anyhow::Error> = None;

        while !*stop.borrow() {
            tokio::select! {
                _ = stop.changed() => {}

                Some(joined) = watchers.join_next() => {
                    if let Err(e) = flatten(joined) {
                        fatal = Some(e.context("leader watcher stopped"));
                        break;
                    }
                }

                Some(joined) = workers.join_next() => {
                    if let Err(e) = flatten(joined) {
                        fatal = Some(e.context("mirror worker failed"));
                        break;
                    }
                }

                Some(joined) = reconciler.join_next() => {
                    match joined {
                        Ok(Ok(report)) => debug!(%report, "Periodic reconciliation"),
                        Ok(Err(e)) if e.is_fatal() => {
                            fatal = Some(anyhow::Error::new(e).context("reconciliation failed"));
                            break;
                        }
                        Ok(Err(e)) => warn!(error = %e, "Reconciliation pass failed"),
                        Err(e) => warn!(error = %e, "Reconciliation task aborted"),
                    }
                }

                _ = reconcile_timer.tick() => {
                    if reconciler.is_empty() {
                        let coordinator = self.coordinator.clone();
                        reconciler.spawn(async move { coordinator.reconcile_pass().await });
                    }
                }

                // A trade is only taken off the queue once a worker is free
                (permit, next) = async {
                    let permit = permits.clone().acquire_owned().await;
                    (permit, rx.recv().await)
                } => {
                    let Some(trade) = next else { break };
                    let permit = match permit {
                        Ok(permit) => permit,
                        Err(e) => {
                            fatal = Some(anyhow::Error::new(e).context("worker pool closed"));
                            break;
                        }
                    };
                    let coordinator = self.coordinator.clone();
                    workers.spawn(async move {
                        let _permit = permit;
                        mirror(&coordinator, trade).await
                    });
                }
            }
        }

        // Stop the watchers and let in-flight mirrors reach an outcome
        self.shutdown.send_replace(true);
        drop(rx);
        ctrl_c.abort();

        info!(in_flight = workers.len(), "Draining workers");
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = flatten(joined) {
                error!(error = %e, "Mirror worker failed during shutdown");
                fatal.get_or_insert(e);
            }
        }
        while let Some(joined) = reconciler.join_next().await {
            if let Ok(Err(e)) = joined {
                warn!(error = %e, "Reconciliation failed during shutdown");
            }
        }
        while let Some(joined) = watchers.join_next().await {
            if let Err(e) = flatten(joined) {
                debug!(error = %e, "Watcher error after shutdown");
            }
        }

        match fatal {
            Some(e) => {
                error!(error = %e, "Mirror loop stopped on fatal error");
                Err(e)
            }
            None => {
                info!("Mirror loop stopped");
                Ok(())
            }
        }
    }

    /// One task per leader, forwarding trades until shutdown.
    fn spawn_watchers(&self, tx: mpsc::Sender<LeaderTrade>) -> JoinSet<MirrorResult<()>> {
        let watcher = EventWatcher::new(
            self.venue.clone(),
            self.db.clone(),
            self.config.poll_interval,
        )
        .with_backoff(
            self.config.execution.backoff_base,
            self.config.execution.backoff_cap,
        );

        let mut tasks = JoinSet::new();
        for leader in &self.config.leaders {
            let mut trades = watcher.watch_account(leader.clone());
            let tx = tx.clone();
            let mut stop = self.shutdown.subscribe();
            let leader = leader.clone();

            tasks.spawn(async move {
                info!(leader = %leader, "Watching leader");
                loop {
                    tokio::select! {
                        _ = stop.changed() => return Ok(()),
                        next = trades.next() => match next {
                            Some(Ok(trade)) => {
                                if tx.send(trade).await.is_err() {
                                    return Ok(());
                                }
                            }
                            Some(Err(e)) => return Err(e),
                            None => return Ok(()),
                        },
                    }
                }
            });
        }
        tasks
    }

    /// Current state from the store.
    pub async fn get_stats(&self) -> Result<BotStats> {
        let counts = self.db.status_counts().await.context("failed to count records")?;
        let positions = self.db.get_positions().await.context("failed to load positions")?;
        let capital_in_use = self.db.capital_in_use().await.context("failed to sum capital")?;

        Ok(BotStats {
            leaders: self.config.leaders.len(),
            total_capital: self.config.sizing.total_capital,
            capital_in_use,
            realized_pnl: positions.iter().map(|p| p.realized_pnl).sum(),
            status_counts: counts,
            positions,
            dry_run: self.config.dry_run,
        })
    }
}

/// Mirror one trade; only fatal errors escape the worker.
async fn mirror(coordinator: &MirrorCoordinator, trade: LeaderTrade) -> MirrorResult<()> {
    let id = trade.id.clone();
    match coordinator.handle(trade).await {
        Ok(Some(status)) => {
            debug!(leader_trade_id = %id, status = %status, "Mirror settled");
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            error!(leader_trade_id = %id, error = %e, "Mirror failed");
            Ok(())
        }
    }
}

fn flatten(joined: std::result::Result<MirrorResult<()>, tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(anyhow::Error::new(e)),
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(anyhow!("task panicked: {e}")),
    }
}

/// Bot statistics.
#[derive(Debug, Clone)]
pub struct BotStats {
    pub leaders: usize,
    pub total_capital: Decimal,
    pub capital_in_use: Decimal,
    pub realized_pnl: Decimal,
    pub status_counts: Vec<(String, i64)>,
    pub positions: Vec<FollowerPosition>,
    pub dry_run: bool,
}

impl std::fmt::Display for BotStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Mirror Statistics ===")?;
        writeln!(f, "Leaders:         {}", self.leaders)?;
        writeln!(f, "Capital:         ${:.2}", self.total_capital)?;
        writeln!(f, "Capital In Use:  ${:.2}", self.capital_in_use)?;
        writeln!(f, "Realized P&L:    ${:.2}", self.realized_pnl)?;
        writeln!(f, "Open Positions:  {}", self.positions.iter().filter(|p| !p.is_closed()).count())?;
        for (status, count) in &self.status_counts {
            writeln!(f, "  {:<16} {}", status, count)?;
        }
        write!(f, "Mode:            {}", if self.dry_run { "Dry Run" } else { "Live" })
    }
}
