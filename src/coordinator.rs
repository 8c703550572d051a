//! Periodic full-pool restart
//!
//! Every `interval` the coordinator compares the pool age with the
//! configured gutter time. An aged, non-empty pool is replaced as a whole,
//! but only while no job is running or queued; otherwise the restart waits
//! for a later tick.

use crate::{format_duration, PoolController, RenderError, TaskQueue};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

/// Outcome of one coordinator tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// The pool is younger than the gutter time, or empty.
    NotDue,
    /// A restart is due but jobs are running or waiting.
    Deferred,
    Restarted,
}

pub struct RestartCoordinator {
    pool: Arc<PoolController>,
    queue: Arc<TaskQueue>,
    gutter: Duration,
    interval: Duration,
}

impl RestartCoordinator {
    pub fn new(
        pool: Arc<PoolController>,
        queue: Arc<TaskQueue>,
        gutter: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            pool,
            queue,
            gutter,
            interval,
        }
    }

    /// Check the pool once and restart it when due and idle.
    pub async fn tick(&self) -> Result<RestartDecision, RenderError> {
        let age = self.pool.age();
        if age <= self.gutter || self.pool.size().await == 0 {
            return Ok(RestartDecision::NotDue);
        }

        info!("will restart all instances (pool age {})", format_duration(age));
        if !self.pool.begin_restart(self.queue.len()) {
            info!("delay restart all instances, {} jobs outstanding", self.queue.len());
            return Ok(RestartDecision::Deferred);
        }

        info!("restart all instances......");
        self.pool.teardown().await;

        match self.pool.warm_up().await {
            Ok(()) => {
                self.pool.end_restart(true);
                crate::metrics::record_pool_restart();
                info!("restart completed");
                Ok(RestartDecision::Restarted)
            }
            Err(e) => {
                self.pool.end_restart(false);
                error!(target: "render_pool::errors", "restart error: {}", e);
                Err(e)
            }
        }
    }

    /// Tick until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut timer = interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    match self.tick().await {
                        Ok(decision) => debug!("restart check: {:?}", decision),
                        Err(e) => error!("restart fail: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Restart coordinator stopped");
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
