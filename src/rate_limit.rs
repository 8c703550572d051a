use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Result of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Requests still admitted in the current window.
    pub remaining: u32,
    /// Unix time, in seconds, at which the current window ends.
    pub reset_epoch_secs: i64,
    pub total: u32,
    /// Time until the window ends.
    pub retry_after: Duration,
}

impl RateDecision {
    /// `Retry-After` value, never below one second.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.retry_after.as_secs();
        if self.retry_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs.max(1)
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window request counter keyed by client.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    window: Duration,
    max_requests: u32,
    max_keys: usize,
    windows: Arc<DashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: u32, max_keys: usize) -> Self {
        Self {
            window,
            max_requests,
            max_keys,
            windows: Arc::new(DashMap::new()),
        }
    }

    pub fn check(&self, key: &str) -> RateDecision {
        self.check_at(key, Instant::now())
    }

    pub fn check_at(&self, key: &str, now: Instant) -> RateDecision {
        if !self.windows.contains_key(key) && self.windows.len() >= self.max_keys {
            self.sweep_expired_at(now);
        }

        let window_len = self.window;
        let mut entry = self.windows.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.saturating_duration_since(entry.started) >= window_len {
            *entry = Window {
                started: now,
                count: 0,
            };
        }

        let allowed = entry.count < self.max_requests;
        if allowed {
            entry.count += 1;
        }

        let retry_after = (entry.started + window_len).saturating_duration_since(now);
        let remaining = self.max_requests.saturating_sub(entry.count);
        drop(entry);

        let reset_epoch_secs = (Utc::now()
            + chrono::Duration::from_std(retry_after).unwrap_or_else(|_| chrono::Duration::zero()))
        .timestamp();

        RateDecision {
            allowed,
            remaining,
            reset_epoch_secs,
            total: self.max_requests,
            retry_after,
        }
    }

    /// Drop every window that has already ended.
    fn sweep_expired_at(&self, now: Instant) -> usize {
        let before = self.windows.len();
        let window_len = self.window;
        self.windows
            .retain(|_, window| now.saturating_duration_since(window.started) < window_len);
        let swept = before.saturating_sub(self.windows.len());
        if swept > 0 {
            debug!("swept {} expired rate-limit windows", swept);
        }
        swept
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}
