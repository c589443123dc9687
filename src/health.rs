use crate::{metrics, RenderWorker, WorkerPool, WorkerState};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WorkerHealth {
    pub id: usize,
    pub healthy: bool,
    pub state: WorkerState,
    pub served: usize,
    pub in_flight: usize,
}

impl WorkerHealth {
    pub async fn check(worker: &dyn RenderWorker) -> Self {
        Self {
            id: worker.id(),
            healthy: worker.is_healthy().await,
            state: worker.state(),
            served: worker.served_count(),
            in_flight: worker.in_flight_count(),
        }
    }
}

/// Liveness of the whole pool: healthy only when every worker is.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PoolHealth {
    pub healthy: bool,
    pub workers: Vec<WorkerHealth>,
}

impl PoolHealth {
    pub fn from_workers(workers: Vec<WorkerHealth>) -> Self {
        Self {
            healthy: !workers.is_empty() && workers.iter().all(|w| w.healthy),
            workers,
        }
    }

    pub fn healthy_count(&self) -> usize {
        self.workers.iter().filter(|w| w.healthy).count()
    }

    pub fn level(&self) -> HealthLevel {
        match self.healthy_count() {
            n if n == self.workers.len() && n > 0 => HealthLevel::Healthy,
            0 => HealthLevel::Critical,
            _ => HealthLevel::Degraded,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Critical,
}

/// Periodically logs cache and pool statistics
pub struct HealthMonitor {
    pool: Arc<WorkerPool>,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(pool: Arc<WorkerPool>, interval: Duration) -> Self {
        Self { pool, interval }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.sample().await,
                _ = shutdown.cancelled() => break,
            }
        }
    }

    pub async fn sample(&self) {
        self.pool.cache().log_stats();

        let health = self.pool.pool_health().await;
        metrics::set_healthy_workers(health.healthy_count(), health.workers.len());

        let served: usize = health.workers.iter().map(|w| w.served).sum();
        let in_flight: usize = health.workers.iter().map(|w| w.in_flight).sum();
        match health.level() {
            HealthLevel::Healthy => info!(
                "Pool healthy: {} workers, {} renders served, {} in flight",
                health.workers.len(),
                served,
                in_flight
            ),
            HealthLevel::Degraded => warn!(
                "Pool degraded: {}/{} workers healthy",
                health.healthy_count(),
                health.workers.len()
            ),
            HealthLevel::Critical => error!("Pool critical: no healthy workers"),
        }

        let timings = self.pool.timings();
        if timings.samples > 0 {
            info!(
                "Render timings: avg {:.0} ms, p95 {:.0} ms over {} samples",
                timings.average_ms, timings.p95_ms, timings.samples
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(id: usize, healthy: bool) -> WorkerHealth {
        WorkerHealth {
            id,
            healthy,
            state: if healthy {
                WorkerState::Ready
            } else {
                WorkerState::Crashed
            },
            served: 0,
            in_flight: 0,
        }
    }

    #[test]
    fn test_pool_health_requires_every_worker() {
        let health = PoolHealth::from_workers(vec![worker(0, true), worker(1, true)]);
        assert!(health.healthy);
        assert_eq!(health.level(), HealthLevel::Healthy);

        let health = PoolHealth::from_workers(vec![worker(0, true), worker(1, false)]);
        assert!(!health.healthy);
        assert_eq!(health.healthy_count(), 1);
        assert_eq!(health.level(), HealthLevel::Degraded);

        let health = PoolHealth::from_workers(vec![worker(0, false)]);
        assert_eq!(health.level(), HealthLevel::Critical);
    }

    #[test]
    fn test_empty_pool_is_unhealthy() {
        let health = PoolHealth::from_workers(Vec::new());
        assert!(!health.healthy);
        assert_eq!(health.level(), HealthLevel::Critical);
    }

    #[test]
    fn test_pool_health_json() {
        let health = PoolHealth::from_workers(vec![worker(0, true)]);
        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["healthy"], true);
        assert_eq!(json["workers"][0]["id"], 0);
        assert_eq!(json["workers"][0]["state"], "ready");
    }
}
