//! # Render Pool
//!
//! A render service that turns a URL or an HTML fragment into a PNG
//! screenshot or an A4 PDF by driving a fixed pool of headless Chromium
//! instances.
//!
//! ## Architecture
//!
//! | Component | Type | Role |
//! |-----------|------|------|
//! | Instance pool | [`PoolController`] | Round-robin handle selection, bulk replacement |
//! | Task queue | [`TaskQueue`] | FIFO with a fixed concurrency ceiling and drain callbacks |
//! | Worker | [`RenderWorker`] | Per-job protocol: skip, wait out restarts, render, reply |
//! | Restart coordinator | [`RestartCoordinator`] | Replaces the aged pool while idle |
//! | Rate limiter | [`RateLimiter`] | Fixed-window counter per client IP |
//! | Gateway | [`build_router`] | `/api/screenshot` and `/health` over axum |
//!
//! A request flows through the rate limiter, is validated, queued, and run
//! by the worker on the next handle in rotation. Jobs that arrive during a
//! pool restart wait until the new pool is installed.
//!
//! ## Configuration
//!
//! Defaults are overridden by an optional JSON file, then by the
//! environment, then by command-line flags:
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `SCREENSHOT_TIMEOUT` | Render timeout (ms) | 10000 |
//! | `RESTART_HOUR` | Pool restart cycle (ms) | 43200000 |
//! | `CHROMIUM_NUM` | Chromium instances | 1 |
//! | `CONCURRENCY` | Concurrent jobs | 10 |
//! | `RATE_LIMIT` | Requests per minute per client | 100 |
//! | `PORT` | Listen port | 3030 |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use render_pool::{ChromiumLauncher, Config, OutputKind, RenderRequest, RenderService};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let launcher = Arc::new(ChromiumLauncher::new(config.clone()));
//!     let service = RenderService::new(config, launcher);
//!     service.start().await?;
//!
//!     let request = RenderRequest::from_url("https://example.com", OutputKind::Pdf);
//!     let response = service.render(request).await?;
//!     println!("Rendered {} bytes", response.body.len());
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! render-pool serve --port 3030 --pool-size 4 --concurrency 8
//! render-pool render --url https://example.com --output page.pdf --pdf
//! render-pool validate config.json
//! ```

/// Configuration, request model and Chromium launch settings
pub mod config;

/// Error types and client-facing messages
pub mod error;

/// Render capability traits and the Chromium implementation
pub mod browser;

/// Browser pool with rotation and restart gating
pub mod pool;

/// Jobs, response sinks and completion handles
pub mod job;

/// Bounded-concurrency job queue
pub mod queue;

/// Job runner executing renders against the pool
pub mod worker;

/// Service wiring pool, queue and worker
pub mod service;

/// Periodic full-pool restart
pub mod coordinator;

/// Per-client fixed-window rate limiting
pub mod rate_limit;

/// HTTP gateway
pub mod http;

/// Health report for the pool and queue
pub mod health;

/// Metrics recording and Prometheus export
pub mod metrics;

/// Command-line interface implementation
pub mod cli;

/// Utility functions and helpers
pub mod utils;

#[cfg(test)]
mod testing;


pub use browser::*;
pub use cli::*;
pub use config::*;
pub use coordinator::*;
pub use error::*;
pub use health::*;
pub use http::*;
pub use job::*;
pub use pool::*;
pub use queue::*;
pub use rate_limit::*;
pub use service::*;
pub use utils::*;
pub use worker::*;
