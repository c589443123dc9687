//! Health-gated round-robin dispatch over renderer workers
//!
//! The pool answers from the result cache when it can, otherwise hands the
//! request to the next healthy worker. Background tasks recycle idle workers
//! that served too many renders and log statistics.

use crate::metrics::{RenderTimings, TimingStats};
use crate::{
    is_valid_url, should_restart, BlockEvaluator, Config, ErrorSeverity, HealthMonitor,
    PoolHealth, RenderError, RenderRequest, RenderResult, RenderWorker, RendererWorker,
    ResultCache, WorkerHealth,
};
use futures::future::{join_all, try_join_all};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pool of renderer workers with a shared result cache
///
/// # Examples
///
/// ```rust,no_run
/// use rendergun::{Config, RenderRequest, WorkerPool};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let pool = WorkerPool::launch(Config::default()).await?;
///     pool.spawn_maintenance();
///
///     let result = pool.render(RenderRequest::new("https://example.com")).await?;
///     println!("{}: {} bytes", result.code, result.body.len());
///
///     pool.close().await;
///     Ok(())
/// }
/// ```
pub struct WorkerPool {
    workers: Vec<Arc<dyn RenderWorker>>,
    next: AtomicUsize,
    cache: ResultCache,
    config: Arc<Config>,
    timings: RenderTimings,
    closed: AtomicBool,
    shutdown: CancellationToken,
    maintenance: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Launches `config.pool_size` Chrome workers.
    pub async fn launch(config: Config) -> Result<Arc<Self>, RenderError> {
        config.validate()?;
        let config = Arc::new(config);
        let evaluator = Arc::new(BlockEvaluator::from_config(&config)?);

        info!("Launching {} renderer workers", config.pool_size);
        let workers: Vec<RendererWorker> = (0..config.pool_size)
            .map(|id| RendererWorker::new(id, config.clone(), evaluator.clone()))
            .collect();

        if let Err(e) = try_join_all(workers.iter().map(|w| w.initialize())).await {
            error!("Failed to launch renderer workers: {}", e);
            join_all(workers.iter().map(|w| w.finalize())).await;
            return Err(e);
        }

        let workers = workers
            .into_iter()
            .map(|w| Arc::new(w) as Arc<dyn RenderWorker>)
            .collect();
        Ok(Arc::new(Self::from_parts(workers, config)))
    }

    /// Builds a pool over already running workers.
    pub fn with_workers(workers: Vec<Arc<dyn RenderWorker>>, config: Config) -> Self {
        Self::from_parts(workers, Arc::new(config))
    }

    fn from_parts(workers: Vec<Arc<dyn RenderWorker>>, config: Arc<Config>) -> Self {
        Self {
            workers,
            next: AtomicUsize::new(0),
            cache: ResultCache::from_config(&config.cache),
            config,
            timings: RenderTimings::default(),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            maintenance: Mutex::new(Vec::new()),
        }
    }

    pub async fn render(&self, request: RenderRequest) -> Result<RenderResult, RenderError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RenderError::ShuttingDown);
        }
        if !is_valid_url(request.url.as_str()) {
            return Err(RenderError::InvalidUrl(request.url));
        }

        if let Some(cached) = self.cache.get(&request.url) {
            return Ok(cached);
        }

        let worker = self.get_healthy_worker().await?;
        debug!("Dispatching {} to worker {}", request.url, worker.id());

        let started = Instant::now();
        let outcome = match worker.render(&request).await {
            // A restart took the browser between the health check and the render.
            Err(RenderError::WorkerUnavailable) => {
                debug!("Worker {} lost its browser, rescanning for {}", worker.id(), request.url);
                let worker = self.get_healthy_worker().await?;
                worker.render(&request).await
            }
            outcome => outcome,
        };

        match outcome {
            Ok(result) => {
                self.timings.record_success(result.code, started.elapsed());
                if result.is_cacheable() {
                    self.cache.set(request.url.as_str(), result.clone());
                }
                Ok(result)
            }
            Err(e) => {
                self.timings.record_failure(&e);
                match e.severity() {
                    ErrorSeverity::Low => info!("Render of {} failed: {}", request.url, e),
                    ErrorSeverity::Medium => warn!("Render of {} failed: {}", request.url, e),
                    ErrorSeverity::High => error!("Render of {} failed: {}", request.url, e),
                }
                Err(e)
            }
        }
    }

    /// Next healthy worker in rotation, scanning each worker at most once.
    pub async fn get_healthy_worker(&self) -> Result<Arc<dyn RenderWorker>, RenderError> {
        let count = self.workers.len();
        if count == 0 {
            return Err(RenderError::WorkerUnavailable);
        }

        let start = self.next.fetch_add(1, Ordering::SeqCst) % count;
        for offset in 0..count {
            let worker = &self.workers[(start + offset) % count];
            if worker.is_healthy().await {
                if offset > 0 {
                    self.next.fetch_add(offset, Ordering::SeqCst);
                }
                return Ok(worker.clone());
            }
            debug!("Worker {} is unhealthy, skipping", worker.id());
        }

        error!("No healthy worker among {}", count);
        Err(RenderError::WorkerUnavailable)
    }

    pub async fn pool_health(&self) -> PoolHealth {
        let workers = join_all(self.workers.iter().map(|w| WorkerHealth::check(w.as_ref()))).await;
        PoolHealth::from_workers(workers)
    }

    /// Restarts every idle worker past the request threshold; returns how many restarted.
    pub async fn enforce_restart_policy(&self) -> usize {
        let threshold = self.config.restart.threshold;
        let mut restarted = 0;

        for worker in &self.workers {
            if !should_restart(worker.served_count(), worker.in_flight_count(), threshold) {
                continue;
            }
            match worker.restart().await {
                Ok(true) => restarted += 1,
                Ok(false) => debug!("Worker {} became busy, restart deferred", worker.id()),
                Err(e) => error!("Worker {} restart failed: {}", worker.id(), e),
            }
        }

        restarted
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn timings(&self) -> TimingStats {
        self.timings.stats()
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Starts the restart-policy timer and the stats sampler.
    pub fn spawn_maintenance(self: &Arc<Self>) {
        let restart_interval = self.config.restart.check_interval;
        let pool = self.clone();
        let restart_task = tokio::spawn(async move {
            let mut ticker = interval_at(
                tokio::time::Instant::now() + restart_interval,
                restart_interval,
            );
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let restarted = pool.enforce_restart_policy().await;
                        if restarted > 0 {
                            info!("Restarted {} worker(s) past the request threshold", restarted);
                        }
                    }
                    _ = pool.shutdown.cancelled() => break,
                }
            }
        });

        let monitor = HealthMonitor::new(self.clone(), self.config.stats_interval);
        let stats_task = tokio::spawn(monitor.run(self.shutdown.child_token()));

        self.maintenance.lock().extend([restart_task, stats_task]);
    }

    /// Stops maintenance, prunes the cache and finalizes every worker.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down renderer pool");
        self.shutdown.cancel();
        let tasks: Vec<_> = self.maintenance.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }

        self.cache.prune();
        join_all(self.workers.iter().map(|w| w.finalize())).await;
        info!("Renderer pool shut down");
    }
}
