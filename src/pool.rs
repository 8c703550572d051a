//! Browser pool management
//!
//! [`PoolController`] owns the ordered set of render handles, the rotation
//! cursor, and the lifecycle flags that gate job start against a full pool
//! restart. The pool is either empty or holds exactly `pool_size` handles;
//! a replacement is launched completely before it becomes visible.

use crate::{BrowserLauncher, RenderError, RenderHandle};
use futures::future::join_all;
use serde::Serialize;
use std::sync::{Arc, Mutex as SyncMutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// A handle taken from the pool together with the slot it occupies.
#[derive(Clone)]
pub struct AcquiredHandle {
    pub slot: usize,
    pub handle: Arc<dyn RenderHandle>,
}

struct PoolInner {
    handles: Vec<Arc<dyn RenderHandle>>,
    cursor: Option<usize>,
    acquisitions: u64,
}

struct Lifecycle {
    started_at: Instant,
    restarting: bool,
    active_jobs: usize,
    restarts: u64,
}

pub struct PoolController {
    launcher: Arc<dyn BrowserLauncher>,
    pool_size: usize,
    inner: Mutex<PoolInner>,
    lifecycle: SyncMutex<Lifecycle>,
    restart_tx: watch::Sender<bool>,
}

impl PoolController {
    pub fn new(launcher: Arc<dyn BrowserLauncher>, pool_size: usize) -> Self {
        let (restart_tx, _) = watch::channel(false);
        Self {
            launcher,
            pool_size,
            inner: Mutex::new(PoolInner {
                handles: Vec::new(),
                cursor: None,
                acquisitions: 0,
            }),
            lifecycle: SyncMutex::new(Lifecycle {
                started_at: Instant::now(),
                restarting: false,
                active_jobs: 0,
                restarts: 0,
            }),
            restart_tx,
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Launch a full pool and install it, closing whatever was there before.
    pub async fn warm_up(&self) -> Result<(), RenderError> {
        let mut inner = self.inner.lock().await;
        let fresh = self.launch_all().await?;
        let previous = std::mem::replace(&mut inner.handles, fresh);
        drop(inner);

        if !previous.is_empty() {
            close_handles(previous).await;
        }
        Ok(())
    }

    async fn launch_all(&self) -> Result<Vec<Arc<dyn RenderHandle>>, RenderError> {
        info!("start all chromium");
        let mut launched: Vec<Arc<dyn RenderHandle>> = Vec::with_capacity(self.pool_size);

        for slot in 0..self.pool_size {
            match self.launcher.launch(slot).await {
                Ok(handle) => launched.push(handle),
                Err(e) => {
                    error!("Failed to launch browser for slot {}: {}", slot, e);
                    close_handles(launched).await;
                    return Err(match e {
                        RenderError::PoolLaunchFailure(_) => e,
                        other => RenderError::PoolLaunchFailure(other.to_string()),
                    });
                }
            }
        }

        info!("chromium start completed, total: {}", launched.len());
        Ok(launched)
    }

    /// Hand out the next handle in rotation.
    ///
    /// An empty pool is warmed up first, which restarts its age. Handles are
    /// not checked out: two
    /// jobs may hold the same handle when the pool is smaller than the
    /// queue's concurrency.
    pub async fn acquire_next(&self) -> Result<AcquiredHandle, RenderError> {
        let mut inner = self.inner.lock().await;

        if inner.handles.is_empty() {
            warn!("Browser pool is empty, warming up before acquisition");
            inner.handles = self.launch_all().await?;
            self.lifecycle().started_at = Instant::now();
        }

        let len = inner.handles.len();
        let slot = match inner.cursor {
            Some(current) => (current + 1) % len,
            None => 0,
        };
        inner.cursor = Some(slot);
        inner.acquisitions += 1;

        debug!("chrome pool index: {}", slot);
        Ok(AcquiredHandle {
            slot,
            handle: inner.handles[slot].clone(),
        })
    }

    /// Close every handle and leave the pool empty.
    pub async fn teardown(&self) {
        let handles = {
            let mut inner = self.inner.lock().await;
            std::mem::take(&mut inner.handles)
        };
        close_handles(handles).await;
    }

    pub async fn size(&self) -> usize {
        self.inner.lock().await.handles.len()
    }

    /// Last slot handed out, if any.
    pub async fn cursor(&self) -> Option<usize> {
        self.inner.lock().await.cursor
    }

    /// Wait out any restart in progress, then register a running job.
    ///
    /// The returned guard unregisters the job when dropped.
    pub async fn enter_job(self: &Arc<Self>) -> JobGuard {
        let mut restart_rx = self.restart_tx.subscribe();
        loop {
            {
                let mut lifecycle = self.lifecycle();
                if !lifecycle.restarting {
                    lifecycle.active_jobs += 1;
                    return JobGuard {
                        pool: Arc::clone(self),
                    };
                }
            }

            debug!("waiting for browser restart to finish");
            // The sender lives as long as `self`, so this only fails if the
            // controller is being dropped; re-check the flag either way.
            if restart_rx.changed().await.is_err() {
                tokio::task::yield_now().await;
            }
        }
    }

    fn leave_job(&self) {
        let mut lifecycle = self.lifecycle();
        lifecycle.active_jobs = lifecycle.active_jobs.saturating_sub(1);
    }

    /// Set the restarting flag unless jobs are running or waiting.
    ///
    /// Returns `false` when the restart has to be deferred.
    pub fn begin_restart(&self, pending_jobs: usize) -> bool {
        let mut lifecycle = self.lifecycle();
        if lifecycle.restarting || lifecycle.active_jobs > 0 || pending_jobs > 0 {
            return false;
        }
        lifecycle.restarting = true;
        drop(lifecycle);

        self.restart_tx.send_replace(true);
        true
    }

    /// Clear the restarting flag and wake waiting jobs.
    ///
    /// The pool age is only reset when the relaunch succeeded.
    pub fn end_restart(&self, relaunched: bool) {
        let mut lifecycle = self.lifecycle();
        lifecycle.restarting = false;
        if relaunched {
            lifecycle.started_at = Instant::now();
            lifecycle.restarts += 1;
        }
        drop(lifecycle);

        self.restart_tx.send_replace(false);
    }

    /// Time since the pool was last (re)started.
    pub fn age(&self) -> Duration {
        self.lifecycle().started_at.elapsed()
    }

    pub fn is_restarting(&self) -> bool {
        self.lifecycle().restarting
    }

    pub fn is_busy(&self) -> bool {
        self.lifecycle().active_jobs > 0
    }

    pub fn restarts(&self) -> u64 {
        self.lifecycle().restarts
    }

    pub async fn stats(&self) -> PoolStats {
        let (size, cursor, acquisitions) = {
            let inner = self.inner.lock().await;
            (inner.handles.len(), inner.cursor, inner.acquisitions)
        };
        let lifecycle = self.lifecycle();

        PoolStats {
            size,
            target_size: self.pool_size,
            cursor,
            acquisitions,
            age_secs: lifecycle.started_at.elapsed().as_secs(),
            restarting: lifecycle.restarting,
            active_jobs: lifecycle.active_jobs,
            restarts: lifecycle.restarts,
        }
    }
}

async fn close_handles(handles: Vec<Arc<dyn RenderHandle>>) {
    let results = join_all(handles.iter().map(|handle| handle.close())).await;
    for (slot, result) in results.into_iter().enumerate() {
        if let Err(e) = result {
            error!("Failed to close browser in slot {}: {}", slot, e);
        }
    }
}

/// Marks a job as running for as long as it is held.
pub struct JobGuard {
    pool: Arc<PoolController>,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.pool.leave_job();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub target_size: usize,
    pub cursor: Option<usize>,
    pub acquisitions: u64,
    pub age_secs: u64,
    pub restarting: bool,
    pub active_jobs: usize,
    pub restarts: u64,
}
