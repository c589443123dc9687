//! Renderer workers, each supervising one Chrome process
//!
//! A worker launches its browser, serves renders on isolated pages, and
//! relaunches the browser whenever the process exits on its own. Every launch
//! is a numbered generation; the exit watch of a generation that was closed on
//! purpose (restart or finalize) stays silent.

use crate::render_pipeline::render_page;
use crate::{
    create_browser_config, metrics, user_data_dir, BlockEvaluator, Config, RenderError,
    RenderRequest, RenderResult,
};
use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::Page;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

const BROWSER_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Ready,
    Crashed,
    Finalized,
}

/// A worker the pool can dispatch renders to
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RenderWorker: Send + Sync {
    fn id(&self) -> usize;

    fn state(&self) -> WorkerState;

    /// Ready, connected, and answering a control-channel round trip.
    async fn is_healthy(&self) -> bool;

    async fn render(&self, request: &RenderRequest) -> Result<RenderResult, RenderError>;

    /// Renders started since the last launch.
    fn served_count(&self) -> usize;

    fn in_flight_count(&self) -> usize;

    /// Relaunches the browser if the worker is idle. `Ok(false)` means the
    /// restart was deferred because a render is in flight.
    async fn restart(&self) -> Result<bool, RenderError>;

    /// Terminates the browser for good.
    async fn finalize(&self);
}

/// Whether an idle worker has served enough renders to be recycled.
pub fn should_restart(served: usize, in_flight: usize, threshold: usize) -> bool {
    in_flight == 0 && served > threshold
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub id: usize,
    pub state: WorkerState,
    pub generation: u64,
    pub served: usize,
    pub in_flight: usize,
}

struct BrowserSession {
    generation: u64,
    browser: Mutex<Browser>,
    handler: JoinHandle<()>,
    /// Cancelled once the browser's event stream ends.
    exited: CancellationToken,
}

impl BrowserSession {
    async fn shutdown(&self) {
        let mut browser = self.browser.lock().await;
        if let Err(e) = browser.close().await {
            debug!("Browser close failed: {}", e);
        }
        if tokio::time::timeout(BROWSER_EXIT_TIMEOUT, browser.wait())
            .await
            .is_err()
        {
            warn!("Browser did not exit in time, killing it");
            if let Some(Err(e)) = browser.kill().await {
                warn!("Failed to kill browser: {}", e);
            }
        }
        self.handler.abort();
    }
}

struct WorkerInner {
    id: usize,
    config: Arc<Config>,
    evaluator: Arc<BlockEvaluator>,
    profile_dir: PathBuf,
    session: RwLock<Option<Arc<BrowserSession>>>,
    state: RwLock<WorkerState>,
    generation: AtomicU64,
    /// Serializes launch, restart and finalize.
    lifecycle: Mutex<()>,
    served: AtomicUsize,
    in_flight: AtomicUsize,
    shutdown: CancellationToken,
}

impl WorkerInner {
    fn set_state(&self, state: WorkerState) {
        *self.state.write() = state;
    }

    fn state(&self) -> WorkerState {
        *self.state.read()
    }

    fn current_generation(&self) -> Option<u64> {
        self.session.read().as_ref().map(|s| s.generation)
    }

    /// Launches a new browser generation. Callers hold `lifecycle`.
    async fn launch(self: &Arc<Self>) -> Result<(), RenderError> {
        self.set_state(WorkerState::Starting);
        let browser_config = create_browser_config(&self.config, &self.profile_dir)?;
        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| RenderError::BrowserLaunchFailed(e.to_string()))?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let exited = CancellationToken::new();
        let worker_id = self.id;

        // The handler stream drives the CDP connection and ends when the process goes away.
        let handler_task = tokio::spawn({
            let exited = exited.clone();
            async move {
                while let Some(event) = handler.next().await {
                    if let Err(e) = event {
                        debug!("Worker {} handler error: {}", worker_id, e);
                    }
                }
                exited.cancel();
            }
        });

        let version = browser.version().await.ok().map(|v| v.product);

        *self.session.write() = Some(Arc::new(BrowserSession {
            generation,
            browser: Mutex::new(browser),
            handler: handler_task,
            exited: exited.clone(),
        }));
        self.served.store(0, Ordering::SeqCst);
        self.in_flight.store(0, Ordering::SeqCst);
        self.set_state(WorkerState::Ready);

        info!(
            "Worker {} started Chrome (generation {}, {})",
            self.id,
            generation,
            version.as_deref().unwrap_or("unknown version")
        );

        tokio::spawn(watch_for_exit(Arc::downgrade(self), generation, exited));
        Ok(())
    }

    fn take_session(&self) -> Option<Arc<BrowserSession>> {
        self.session.write().take()
    }
}

// Boxed so the launch -> watch -> relaunch -> launch chain has a nameable type.
fn watch_for_exit(
    inner: Weak<WorkerInner>,
    generation: u64,
    exited: CancellationToken,
) -> BoxFuture<'static, ()> {
    async move {
        exited.cancelled().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if inner.current_generation() != Some(generation) {
            return;
        }

        error!(
            "Chrome of worker {} (generation {}) exited unexpectedly",
            inner.id, generation
        );
        inner.set_state(WorkerState::Crashed);
        metrics::record_worker_crash(inner.id);
        relaunch_until_ready(inner, Some(generation)).await;
    }
    .boxed()
}

/// Keeps relaunching until a browser is up or the worker is finalized.
async fn relaunch_until_ready(inner: Arc<WorkerInner>, crashed_generation: Option<u64>) {
    let mut attempt: u32 = 0;
    loop {
        {
            let _lifecycle = inner.lifecycle.lock().await;
            if inner.state() == WorkerState::Finalized {
                return;
            }

            match inner.current_generation() {
                Some(current) if Some(current) == crashed_generation => {
                    if let Some(dead) = inner.take_session() {
                        dead.shutdown().await;
                    }
                }
                // Someone else already brought a browser up.
                Some(_) => return,
                None => {}
            }

            attempt += 1;
            match inner.launch().await {
                Ok(()) => {
                    info!("Worker {} relaunched after {} attempt(s)", inner.id, attempt);
                    metrics::record_worker_restart(inner.id, "crash");
                    return;
                }
                Err(e) => {
                    inner.set_state(WorkerState::Crashed);
                    warn!("Worker {} relaunch attempt {} failed: {}", inner.id, attempt, e);
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(inner.config.relaunch_delay) => {}
            _ = inner.shutdown.cancelled() => return,
        }
    }
}

/// Decrements the in-flight counter on every exit path.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        // A relaunch resets the counter while old renders may still unwind.
        let _ = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
    }
}

/// Closes the page even when the render future is dropped.
struct PageGuard(Option<Page>);

impl PageGuard {
    fn page(&self) -> Option<&Page> {
        self.0.as_ref()
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        if let Some(page) = self.0.take() {
            tokio::spawn(async move {
                if let Err(e) = page.close().await {
                    debug!("Failed to close page: {}", e);
                }
            });
        }
    }
}

/// Chrome-backed [`RenderWorker`]
#[derive(Clone)]
pub struct RendererWorker {
    inner: Arc<WorkerInner>,
}

impl RendererWorker {
    pub fn new(id: usize, config: Arc<Config>, evaluator: Arc<BlockEvaluator>) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                id,
                config,
                evaluator,
                profile_dir: user_data_dir(id),
                session: RwLock::new(None),
                state: RwLock::new(WorkerState::Starting),
                generation: AtomicU64::new(0),
                lifecycle: Mutex::new(()),
                served: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Creates the worker and launches its first browser.
    pub async fn launch(
        id: usize,
        config: Arc<Config>,
        evaluator: Arc<BlockEvaluator>,
    ) -> Result<Self, RenderError> {
        let worker = Self::new(id, config, evaluator);
        worker.initialize().await?;
        Ok(worker)
    }

    /// Launches a fresh browser, replacing any running one.
    pub async fn initialize(&self) -> Result<(), RenderError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.inner.state() == WorkerState::Finalized {
            return Err(RenderError::ShuttingDown);
        }
        if let Some(old) = self.inner.take_session() {
            old.shutdown().await;
        }
        self.inner.launch().await
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            id: self.inner.id,
            state: self.inner.state(),
            generation: self.generation(),
            served: self.served_count(),
            in_flight: self.in_flight_count(),
        }
    }

    async fn probe(&self, session: &BrowserSession) -> bool {
        let probe = async { session.browser.lock().await.version().await };
        match tokio::time::timeout(self.inner.config.health_probe_timeout, probe).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Worker {} health probe failed: {}", self.inner.id, e);
                false
            }
            Err(_) => {
                warn!("Worker {} health probe timed out", self.inner.id);
                false
            }
        }
    }

    /// Kills the running Chrome process without going through the worker lifecycle.
    #[cfg(test)]
    pub(crate) async fn kill_browser(&self) {
        let Some(session) = self.inner.session.read().clone() else {
            return;
        };
        if let Some(Err(e)) = session.browser.lock().await.kill().await {
            warn!("Failed to kill browser: {}", e);
        };
    }
}

#[async_trait]
impl RenderWorker for RendererWorker {
    fn id(&self) -> usize {
        self.inner.id
    }

    fn state(&self) -> WorkerState {
        self.inner.state()
    }

    async fn is_healthy(&self) -> bool {
        if self.inner.state() != WorkerState::Ready {
            return false;
        }
        let Some(session) = self.inner.session.read().clone() else {
            return false;
        };
        if session.exited.is_cancelled() || session.handler.is_finished() {
            return false;
        }
        self.probe(&session).await
    }

    async fn render(&self, request: &RenderRequest) -> Result<RenderResult, RenderError> {
        let inner = &self.inner;

        // Counting under the session lock keeps restart from closing a browser
        // that has just picked up a render.
        let session = {
            let session = inner.session.read();
            let Some(session) = session.clone() else {
                return Err(RenderError::WorkerUnavailable);
            };
            inner.served.fetch_add(1, Ordering::SeqCst);
            inner.in_flight.fetch_add(1, Ordering::SeqCst);
            session
        };
        let _in_flight = InFlightGuard(&inner.in_flight);

        let span = tracing::info_span!("render", id = %request.id, url = %request.url, worker = inner.id);
        async {
            let policy = Arc::new(inner.evaluator.policy_for(request).await?);
            let timeout = request
                .timeout
                .unwrap_or(inner.config.request_timeout)
                .min(inner.config.max_request_timeout);

            let pipeline = async {
                let page = {
                    let browser = session.browser.lock().await;
                    browser
                        .new_page("about:blank")
                        .await
                        .map_err(|e| RenderError::Page(e.to_string()))?
                };
                let guard = PageGuard(Some(page));
                let page = guard.page().ok_or_else(|| RenderError::Page("page closed".into()))?;
                render_page(page, request, policy, timeout, &inner.config.user_agent).await
            };

            tokio::select! {
                biased;
                _ = session.exited.cancelled() => {
                    warn!("Browser exited while rendering {}", request.url);
                    Err(RenderError::BrowserCrashed { worker: inner.id })
                }
                result = pipeline => result,
            }
        }
        .instrument(span)
        .await
    }

    fn served_count(&self) -> usize {
        self.inner.served.load(Ordering::SeqCst)
    }

    fn in_flight_count(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    async fn restart(&self) -> Result<bool, RenderError> {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;
        if inner.state() == WorkerState::Finalized {
            return Err(RenderError::ShuttingDown);
        }

        let old = {
            let mut session = inner.session.write();
            if inner.in_flight.load(Ordering::SeqCst) > 0 {
                return Ok(false);
            }
            session.take()
        };

        let served = inner.served.load(Ordering::SeqCst);
        info!("Restarting worker {} after {} requests", inner.id, served);
        if let Some(old) = old {
            old.shutdown().await;
        }

        match inner.launch().await {
            Ok(()) => {
                metrics::record_worker_restart(inner.id, "request_count");
                Ok(true)
            }
            Err(e) => {
                error!("Worker {} failed to relaunch: {}", inner.id, e);
                inner.set_state(WorkerState::Crashed);
                tokio::spawn(relaunch_until_ready(inner.clone(), None));
                Err(e)
            }
        }
    }

    async fn finalize(&self) {
        let inner = &self.inner;
        inner.shutdown.cancel();
        let _lifecycle = inner.lifecycle.lock().await;
        inner.set_state(WorkerState::Finalized);

        if let Some(session) = inner.take_session() {
            session.shutdown().await;
        }
        if let Err(e) = tokio::fs::remove_dir_all(&inner.profile_dir).await {
            debug!("Could not remove profile of worker {}: {}", inner.id, e);
        }
        info!("Worker {} finalized", inner.id);
    }
}
