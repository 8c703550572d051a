use crate::{
    format_bytes, format_duration, sanitize_filename, Job, JobRunner, JobStatus, PoolController,
    RenderError, RenderResponse,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, error, info};

/// Runs queued jobs against the browser pool.
pub struct RenderWorker {
    pool: Arc<PoolController>,
    render_timeout: Duration,
    out_name: String,
}

impl RenderWorker {
    pub fn new(pool: Arc<PoolController>, render_timeout: Duration, out_name: &str) -> Self {
        Self {
            pool,
            render_timeout,
            out_name: sanitize_filename(out_name),
        }
    }

    async fn render(&self, job: &Job) -> Result<Vec<u8>, RenderError> {
        let acquired = self.pool.acquire_next().await?;
        debug!("job {} rendering on slot {}", job.id, acquired.slot);

        let started = Instant::now();
        // The handle enforces the same deadline; this bounds handles that ignore it.
        let result = timeout(
            self.render_timeout,
            acquired.handle.render(&job.request, self.render_timeout),
        )
        .await
        .unwrap_or(Err(RenderError::Timeout(self.render_timeout)));

        crate::metrics::record_render(started.elapsed(), &result);
        result
    }
}

#[async_trait]
impl JobRunner for RenderWorker {
    async fn run(&self, job: Job) -> Result<JobStatus, RenderError> {
        if job.sink.is_closed() {
            info!("socket destroyed, task cancel ({})", job.id);
            crate::metrics::record_skipped_job();
            return Ok(JobStatus::Skipped);
        }

        let _running = self.pool.enter_job().await;
        let waited = job.enqueued_at.elapsed();

        match self.render(&job).await {
            Ok(bytes) => {
                info!(
                    "job {} done: {} in {} (queued {})",
                    job.id,
                    format_bytes(bytes.len()),
                    format_duration(job.enqueued_at.elapsed()),
                    format_duration(waited),
                );
                job.sink.send(RenderResponse::attachment(
                    job.request.output,
                    &self.out_name,
                    bytes,
                ));
                Ok(JobStatus::Completed)
            }
            Err(e) => {
                error!(
                    target: "render_pool::errors",
                    job_id = %job.id,
                    params = ?job.request,
                    "render failed: {}",
                    e
                );
                job.sink.send(RenderResponse::failure(&e));
                Err(e)
            }
        }
    }
}
