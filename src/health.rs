use crate::{PoolStats, RenderService};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
    pub concurrency: usize,
}

/// Snapshot served by `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub overall: HealthLevel,
    pub pool: PoolStats,
    pub queue: QueueStats,
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    pub async fn collect(service: &RenderService) -> Self {
        let pool = service.pool().stats().await;
        let queue = service.queue();
        let queue = QueueStats {
            pending: queue.pending(),
            in_flight: queue.in_flight(),
            concurrency: queue.concurrency(),
        };

        Self {
            overall: assess(&pool, &queue),
            pool,
            queue,
            timestamp: Utc::now(),
        }
    }
}

/// An empty pool outside a restart needs a fallback warm-up before the next
/// job, which is treated as critical. Restarts and a backlog are warnings.
fn assess(pool: &PoolStats, queue: &QueueStats) -> HealthLevel {
    if pool.size == 0 && !pool.restarting {
        HealthLevel::Critical
    } else if pool.restarting || queue.pending > 0 {
        HealthLevel::Warning
    } else {
        HealthLevel::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(size: usize, restarting: bool) -> PoolStats {
        PoolStats {
            size,
            target_size: 2,
            cursor: None,
            acquisitions: 0,
            age_secs: 0,
            restarting,
            active_jobs: 0,
            restarts: 0,
        }
    }

    fn queue(pending: usize) -> QueueStats {
        QueueStats {
            pending,
            in_flight: 0,
            concurrency: 2,
        }
    }

    #[test]
    fn test_assess_levels() {
        assert_eq!(assess(&pool(2, false), &queue(0)), HealthLevel::Healthy);
        assert_eq!(assess(&pool(2, false), &queue(3)), HealthLevel::Warning);
        assert_eq!(assess(&pool(0, true), &queue(0)), HealthLevel::Warning);
        assert_eq!(assess(&pool(0, false), &queue(0)), HealthLevel::Critical);
    }

    #[test]
    fn test_report_serializes_lowercase_level() {
        let report = HealthReport {
            overall: HealthLevel::Healthy,
            pool: pool(2, false),
            queue: queue(0),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["overall"], "healthy");
        assert_eq!(json["pool"]["size"], 2);
    }
}
