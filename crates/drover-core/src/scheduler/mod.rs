//! The scheduler loop: a single driver that ticks the assignment engine,
//! the liveness monitor, and the timeout sweeper on independent cadences.
//!
//! The three loops run cooperatively on one task, so exactly one pass
//! touches the store at a time -- the single-writer discipline is by
//! construction, not by locking. Pass failures are logged and retried on
//! the next tick, never propagated.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::AssignmentEngine;
use crate::ledger::ResourceLedger;
use crate::liveness::LivenessMonitor;
use crate::metrics::MetricsSink;
use crate::store::TaskStore;
use crate::sweeper::TimeoutSweeper;

/// Scheduler cadences and batch limits.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Assignment loop period. Lower means lower dispatch latency and
    /// higher store load.
    pub poll_interval: Duration,
    /// Worker-side heartbeat cadence hint; the stale threshold is twice
    /// this.
    pub heartbeat_interval: Duration,
    /// Ceiling on any task's wall-clock budget; the effective limit is the
    /// minimum of this and the task's own timeout.
    pub task_timeout: Duration,
    /// Per-tick assignment batch size.
    pub max_tasks: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(30),
            task_timeout: Duration::from_secs(30 * 60),
            max_tasks: 32,
        }
    }
}

impl SchedulerConfig {
    /// Staleness window: a worker whose heartbeat is older than this is
    /// considered lost. Also the freshness window for assignment
    /// eligibility.
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.heartbeat_interval * 2)
            .unwrap_or_else(|_| chrono::Duration::seconds(60))
    }

    /// Timeout sweep period: coarse, timeouts are minutes-scale.
    pub fn sweep_interval(&self) -> Duration {
        self.poll_interval * 10
    }
}

/// The single-writer scheduler driver.
pub struct Scheduler {
    engine: AssignmentEngine,
    liveness: LivenessMonitor,
    sweeper: TimeoutSweeper,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        ledger: Arc<ResourceLedger>,
        metrics: Arc<dyn MetricsSink>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            engine: AssignmentEngine::new(
                Arc::clone(&store),
                Arc::clone(&ledger),
                Arc::clone(&metrics),
                config.clone(),
            ),
            liveness: LivenessMonitor::new(
                Arc::clone(&store),
                Arc::clone(&ledger),
                Arc::clone(&metrics),
                config.clone(),
            ),
            sweeper: TimeoutSweeper::new(store, ledger, metrics, config.clone()),
            config,
        }
    }

    /// Drive the three loops until cancellation. The in-flight pass
    /// completes before the loop returns.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut assign_tick = tokio::time::interval(self.config.poll_interval);
        let mut liveness_tick = tokio::time::interval(self.config.heartbeat_interval);
        let mut sweep_tick = tokio::time::interval(self.config.sweep_interval());
        for tick in [&mut assign_tick, &mut liveness_tick, &mut sweep_tick] {
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        info!(
            poll_interval = ?self.config.poll_interval,
            heartbeat_interval = ?self.config.heartbeat_interval,
            "scheduler running"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("scheduler stopping");
                    return;
                }
                _ = assign_tick.tick() => {
                    match self.engine.run_once(Utc::now()).await {
                        Ok(0) => {}
                        Ok(n) => debug!(assigned = n, "assignment pass complete"),
                        Err(e) => {
                            warn!(error = %e, "assignment pass failed, retrying next tick");
                        }
                    }
                }
                _ = liveness_tick.tick() => {
                    match self.liveness.run_once(Utc::now()).await {
                        Ok(0) => {}
                        Ok(n) => debug!(expired = n, "liveness pass complete"),
                        Err(e) => {
                            warn!(error = %e, "liveness pass failed, retrying next tick");
                        }
                    }
                }
                _ = sweep_tick.tick() => {
                    match self.sweeper.run_once(Utc::now()).await {
                        Ok(0) => {}
                        Ok(n) => debug!(timed_out = n, "timeout sweep complete"),
                        Err(e) => {
                            warn!(error = %e, "timeout sweep failed, retrying next tick");
                        }
                    }
                }
            }
        }
    }
}
