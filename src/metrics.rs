//! Render metrics recorded through the `metrics` facade
//!
//! No recorder is installed here; whatever the embedding process installs
//! receives these. [`RenderTimings`] keeps a small in-process sample window
//! so stats can be logged and reported without an exporter.

use crate::RenderError;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

pub fn record_render(code: u16, duration: Duration) {
    ::metrics::increment_counter!("rendergun_renders_total", "code" => code.to_string());
    ::metrics::histogram!("rendergun_render_duration_seconds", duration.as_secs_f64());
}

pub fn record_render_failure(error: &RenderError) {
    ::metrics::increment_counter!("rendergun_render_failures_total", "kind" => error.kind());
}

pub fn record_cache_lookup(hit: bool) {
    if hit {
        ::metrics::increment_counter!("rendergun_cache_hits_total");
    } else {
        ::metrics::increment_counter!("rendergun_cache_misses_total");
    }
}

pub fn record_cache_size(entries: usize, bytes: usize) {
    ::metrics::gauge!("rendergun_cache_entries", entries as f64);
    ::metrics::gauge!("rendergun_cache_bytes", bytes as f64);
}

pub fn record_worker_restart(worker: usize, reason: &'static str) {
    ::metrics::increment_counter!(
        "rendergun_worker_restarts_total",
        "worker" => worker.to_string(),
        "reason" => reason
    );
}

pub fn record_worker_crash(worker: usize) {
    ::metrics::increment_counter!("rendergun_worker_crashes_total", "worker" => worker.to_string());
}

pub fn record_intercepted_request(decision: &'static str) {
    ::metrics::increment_counter!("rendergun_intercepted_requests_total", "decision" => decision);
}

pub fn set_healthy_workers(healthy: usize, total: usize) {
    ::metrics::gauge!("rendergun_workers_healthy", healthy as f64);
    ::metrics::gauge!("rendergun_workers_total", total as f64);
}

/// Sliding window of recent render durations and failure counts
pub struct RenderTimings {
    durations: RwLock<VecDeque<Duration>>,
    failures: RwLock<HashMap<&'static str, usize>>,
    max_samples: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TimingStats {
    pub samples: usize,
    pub average_ms: f64,
    pub p95_ms: f64,
    pub failures: HashMap<&'static str, usize>,
}

impl RenderTimings {
    pub fn new(max_samples: usize) -> Self {
        Self {
            durations: RwLock::new(VecDeque::with_capacity(max_samples)),
            failures: RwLock::new(HashMap::new()),
            max_samples: max_samples.max(1),
        }
    }

    pub fn record_success(&self, code: u16, duration: Duration) {
        record_render(code, duration);
        let mut durations = self.durations.write();
        if durations.len() == self.max_samples {
            durations.pop_front();
        }
        durations.push_back(duration);
    }

    pub fn record_failure(&self, error: &RenderError) {
        record_render_failure(error);
        *self.failures.write().entry(error.kind()).or_insert(0) += 1;
    }

    pub fn stats(&self) -> TimingStats {
        let durations = self.durations.read();
        let samples = durations.len();
        if samples == 0 {
            return TimingStats {
                failures: self.failures.read().clone(),
                ..Default::default()
            };
        }

        let mut sorted: Vec<Duration> = durations.iter().copied().collect();
        sorted.sort();
        let total: Duration = sorted.iter().sum();
        let p95_index = ((samples as f64 * 0.95) as usize).min(samples - 1);

        TimingStats {
            samples,
            average_ms: total.as_secs_f64() * 1000.0 / samples as f64,
            p95_ms: sorted[p95_index].as_secs_f64() * 1000.0,
            failures: self.failures.read().clone(),
        }
    }
}

impl Default for RenderTimings {
    fn default() -> Self {
        Self::new(1000)
    }
}
