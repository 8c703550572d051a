//! Render service wiring the pool, the queue and the worker together
//!
//! [`RenderService`] is what the HTTP layer and the CLI talk to: it owns the
//! [`PoolController`] and the [`TaskQueue`], performs the cold start, and
//! accepts jobs.

use crate::{
    format_duration, BrowserLauncher, Config, Job, JobHandle, PoolController, RenderError,
    RenderRequest, RenderResponse, RenderWorker, ResponseSink, TaskQueue,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Browser pool plus bounded job queue
///
/// # Examples
///
/// ```rust,no_run
/// use render_pool::{ChromiumLauncher, Config, OutputKind, RenderRequest, RenderService};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = Config::default();
///     let launcher = Arc::new(ChromiumLauncher::new(config.clone()));
///     let service = RenderService::new(config, launcher);
///     service.start().await?;
///
///     let request = RenderRequest::from_url("https://example.com", OutputKind::Image);
///     let response = service.render(request).await?;
///     println!("Rendered {} bytes", response.body.len());
///
///     service.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct RenderService {
    config: Config,
    pool: Arc<PoolController>,
    queue: Arc<TaskQueue>,
}

impl RenderService {
    pub fn new(config: Config, launcher: Arc<dyn BrowserLauncher>) -> Self {
        let pool = Arc::new(PoolController::new(launcher, config.pool_size));
        let worker = RenderWorker::new(
            pool.clone(),
            config.render_timeout,
            &config.default_out_name,
        );
        let queue = TaskQueue::new(config.max_queue, Arc::new(worker));
        queue.on_drain(|| info!("all task done!"));

        Self {
            config,
            pool,
            queue,
        }
    }

    /// Cold start: launch the whole pool. A failure here is fatal for the
    /// server.
    pub async fn start(&self) -> Result<(), RenderError> {
        info!(
            "render timeout: {}, chromium instances: {}, concurrency: {}, rate limit: {} per {}, restart cycle: {}",
            format_duration(self.config.render_timeout),
            self.config.pool_size,
            self.config.max_queue,
            self.config.rate_limit_max,
            format_duration(self.config.rate_limit_window),
            format_duration(self.config.restart_gutter),
        );

        if self.config.pool_size < self.config.max_queue {
            warn!(
                "pool size {} is below concurrency {}; concurrent jobs will share browser instances",
                self.config.pool_size, self.config.max_queue
            );
        }

        self.pool.warm_up().await
    }

    /// Admit a validated request. The response is written to `sink`.
    pub fn submit(&self, request: RenderRequest, sink: Box<dyn ResponseSink>) -> JobHandle {
        let job = Job::new(request, sink);
        info!(
            "enqueue job {} ({}), queue length: {}",
            job.id,
            job.request.describe(),
            self.queue.len() + 1
        );
        self.queue.push(job)
    }

    /// Render one request through the queue and wait for its response.
    pub async fn render(&self, request: RenderRequest) -> Result<RenderResponse, RenderError> {
        request.validate()?;
        let (job, rx) = Job::with_channel(request);
        let handle = self.queue.push(job);

        handle.wait().await?;
        rx.await.map_err(|_| RenderError::QueueClosed)
    }

    pub fn pool(&self) -> &Arc<PoolController> {
        &self.pool
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub async fn shutdown(&self) {
        info!("Shutting down render service...");
        self.pool.teardown().await;
        info!("Render service shutdown complete");
    }
}
