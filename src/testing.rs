//! In-process stand-ins for the Chromium launcher used by the unit tests.

use crate::{
    build_router, AppState, BrowserLauncher, Config, RenderError, RenderHandle, RenderRequest,
    RenderService,
};
use async_trait::async_trait;
use axum::extract::connect_info::MockConnectInfo;
use axum::Router;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone)]
pub enum FakeOutcome {
    Bytes(Vec<u8>),
    Fail(RenderError),
}

/// One render observed by a fake handle.
#[derive(Debug, Clone)]
pub struct RenderRecord {
    pub slot: usize,
    pub generation: usize,
    pub request: RenderRequest,
}

#[derive(Default)]
struct Counters {
    active: AtomicUsize,
    max_active: AtomicUsize,
    used_after_close: AtomicUsize,
}

pub struct FakeLauncher {
    pub launched: AtomicUsize,
    pub closed: Arc<AtomicUsize>,
    pub close_attempts: Arc<AtomicUsize>,
    pub renders: Arc<Mutex<Vec<RenderRecord>>>,
    counters: Arc<Counters>,
    fail_launch_at: Option<usize>,
    fail_close: bool,
    launch_delay: Duration,
    render_delay: Duration,
    outcome: FakeOutcome,
    launch_attempts: AtomicUsize,
    pool_size_hint: AtomicUsize,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self {
            launched: AtomicUsize::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
            close_attempts: Arc::new(AtomicUsize::new(0)),
            renders: Arc::new(Mutex::new(Vec::new())),
            counters: Arc::new(Counters::default()),
            fail_launch_at: None,
            fail_close: false,
            launch_delay: Duration::ZERO,
            render_delay: Duration::ZERO,
            outcome: FakeOutcome::Bytes(b"\x89PNG fake".to_vec()),
            launch_attempts: AtomicUsize::new(0),
            pool_size_hint: AtomicUsize::new(0),
        }
    }

    /// Fail the launch attempt with this zero-based index, counted across
    /// every warm-up.
    pub fn fail_launch_at(mut self, attempt: usize) -> Self {
        self.fail_launch_at = Some(attempt);
        self
    }

    pub fn fail_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    pub fn launch_delay(mut self, delay: Duration) -> Self {
        self.launch_delay = delay;
        self
    }

    pub fn render_delay(mut self, delay: Duration) -> Self {
        self.render_delay = delay;
        self
    }

    pub fn outcome(mut self, outcome: FakeOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    /// Pool size used to derive handle generations from the launch count.
    pub fn with_pool_size(self, size: usize) -> Self {
        self.pool_size_hint.store(size, Ordering::SeqCst);
        self
    }

    pub fn max_concurrent_renders(&self) -> usize {
        self.counters.max_active.load(Ordering::SeqCst)
    }

    pub fn renders_on_closed_handles(&self) -> usize {
        self.counters.used_after_close.load(Ordering::SeqCst)
    }

    pub fn render_records(&self) -> Vec<RenderRecord> {
        self.renders
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn launch(&self, slot: usize) -> Result<Arc<dyn RenderHandle>, RenderError> {
        let attempt = self.launch_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.launch_delay.is_zero() {
            tokio::time::sleep(self.launch_delay).await;
        }
        if self.fail_launch_at == Some(attempt) {
            return Err(RenderError::PoolLaunchFailure(format!(
                "fake launch {attempt} failed"
            )));
        }

        let launched = self.launched.fetch_add(1, Ordering::SeqCst);
        let per_generation = self.pool_size_hint.load(Ordering::SeqCst).max(1);

        Ok(Arc::new(FakeHandle {
            slot,
            generation: launched / per_generation,
            is_closed: AtomicBool::new(false),
            closed: self.closed.clone(),
            close_attempts: self.close_attempts.clone(),
            fail_close: self.fail_close,
            render_delay: self.render_delay,
            outcome: self.outcome.clone(),
            renders: self.renders.clone(),
            counters: self.counters.clone(),
        }))
    }
}

pub struct FakeHandle {
    slot: usize,
    generation: usize,
    is_closed: AtomicBool,
    closed: Arc<AtomicUsize>,
    close_attempts: Arc<AtomicUsize>,
    fail_close: bool,
    render_delay: Duration,
    outcome: FakeOutcome,
    renders: Arc<Mutex<Vec<RenderRecord>>>,
    counters: Arc<Counters>,
}

#[async_trait]
impl RenderHandle for FakeHandle {
    async fn render(
        &self,
        request: &RenderRequest,
        _timeout: Duration,
    ) -> Result<Vec<u8>, RenderError> {
        if self.is_closed.load(Ordering::SeqCst) {
            self.counters.used_after_close.fetch_add(1, Ordering::SeqCst);
        }
        if let Ok(mut records) = self.renders.lock() {
            records.push(RenderRecord {
                slot: self.slot,
                generation: self.generation,
                request: request.clone(),
            });
        }

        let active = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_active.fetch_max(active, Ordering::SeqCst);
        if !self.render_delay.is_zero() {
            tokio::time::sleep(self.render_delay).await;
        }
        self.counters.active.fetch_sub(1, Ordering::SeqCst);

        match &self.outcome {
            FakeOutcome::Bytes(bytes) => Ok(bytes.clone()),
            FakeOutcome::Fail(err) => Err(err.clone()),
        }
    }

    async fn close(&self) -> Result<(), RenderError> {
        self.close_attempts.fetch_add(1, Ordering::SeqCst);
        self.is_closed.store(true, Ordering::SeqCst);
        if self.fail_close {
            return Err(RenderError::Io(format!("slot {} refused to close", self.slot)));
        }
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A started service behind the HTTP router.
pub struct TestApp {
    pub service: Arc<RenderService>,
    pub launcher: Arc<FakeLauncher>,
    router: Router,
}

impl TestApp {
    /// Router whose requests appear to come from 127.0.0.1.
    pub fn router(&self) -> Router {
        self.client([127, 0, 0, 1])
    }

    pub fn client(&self, ip: [u8; 4]) -> Router {
        self.router
            .clone()
            .layer(MockConnectInfo(SocketAddr::from((ip, 40000))))
    }
}

pub async fn test_app(config: Config, launcher: FakeLauncher) -> TestApp {
    let launcher = Arc::new(launcher.with_pool_size(config.pool_size));
    let service = Arc::new(RenderService::new(config, launcher.clone()));
    service.start().await.expect("fake pool starts");

    TestApp {
        router: build_router(AppState::new(service.clone())),
        service,
        launcher,
    }
}
