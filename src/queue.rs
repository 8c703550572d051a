//! Bounded-concurrency FIFO of render jobs
//!
//! Jobs start in admission order. At most `concurrency` jobs run at once;
//! the rest wait in the queue until a running job finishes.

use crate::{Job, JobHandle, JobStatus, RenderError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::debug;

/// Executes one job taken from the queue.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: Job) -> Result<JobStatus, RenderError>;
}

type DrainCallback = Arc<dyn Fn() + Send + Sync>;
type Completion = oneshot::Sender<Result<JobStatus, RenderError>>;

struct QueueState {
    pending: VecDeque<(Job, Completion)>,
    in_flight: usize,
}

pub struct TaskQueue {
    concurrency: usize,
    runner: Arc<dyn JobRunner>,
    state: Mutex<QueueState>,
    drain_callbacks: Mutex<Vec<DrainCallback>>,
}

impl TaskQueue {
    pub fn new(concurrency: usize, runner: Arc<dyn JobRunner>) -> Arc<Self> {
        Arc::new(Self {
            concurrency: concurrency.max(1),
            runner,
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                in_flight: 0,
            }),
            drain_callbacks: Mutex::new(Vec::new()),
        })
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a job and start it right away if a slot is free.
    pub fn push(self: &Arc<Self>, job: Job) -> JobHandle {
        let (tx, rx) = oneshot::channel();
        let handle = JobHandle::new(rx);

        let mut state = self.state();
        state.pending.push_back((job, tx));
        self.dispatch(&mut state);
        crate::metrics::set_queue_depth(state.pending.len() + state.in_flight);

        handle
    }

    fn dispatch(self: &Arc<Self>, state: &mut QueueState) {
        while state.in_flight < self.concurrency {
            let Some((job, completion)) = state.pending.pop_front() else {
                break;
            };
            state.in_flight += 1;

            let slot = InFlight {
                queue: Arc::clone(self),
            };
            let runner = Arc::clone(&self.runner);
            tokio::spawn(async move {
                let job_id = job.id;
                let result = runner.run(job).await;
                debug!("job {} finished: {:?}", job_id, result);
                // Free the slot first so waiters observe the updated queue.
                drop(slot);
                let _ = completion.send(result);
            });
        }
    }

    fn finish(self: &Arc<Self>) {
        let drained = {
            let mut state = self.state();
            state.in_flight = state.in_flight.saturating_sub(1);
            self.dispatch(&mut state);
            crate::metrics::set_queue_depth(state.pending.len() + state.in_flight);
            state.in_flight == 0 && state.pending.is_empty()
        };

        if drained {
            let callbacks: Vec<DrainCallback> = self
                .drain_callbacks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            for callback in callbacks {
                callback();
            }
        }
    }

    /// Register a callback run each time the queue becomes fully empty.
    pub fn on_drain<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.drain_callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    /// Jobs waiting plus jobs running.
    pub fn len(&self) -> usize {
        let state = self.state();
        state.pending.len() + state.in_flight
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending(&self) -> usize {
        self.state().pending.len()
    }

    pub fn in_flight(&self) -> usize {
        self.state().in_flight
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }
}

/// Releases a concurrency slot when the job task ends, even by panic.
struct InFlight {
    queue: Arc<TaskQueue>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.queue.finish();
    }
}
