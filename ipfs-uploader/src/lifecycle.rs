//! Lifecycle management: the single owner of backend handles and of shutdown.
//!
//! ```text
//! Uninitialized ──initialize──▶ Ready ──shutdown──▶ ShuttingDown ──▶ Stopped
//!       └──────────────────────shutdown───────────────▲
//! ```
//!
//! [`Lifecycle::shutdown`] is idempotent. The first caller wins a compare-and-swap into
//! `ShuttingDown` and runs the sequence: stop admitting calls, drain in-flight calls for up to the
//! grace period, cancel whatever is left, release every backend handle, publish a
//! [`ShutdownReport`]. Every other caller, concurrent or later, waits for and returns that same
//! report.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use utoipa::ToSchema;

use crate::backends::BackendRegistry;
use crate::content::ContentInput;
use crate::errors::UploadError;
use crate::fanout::{AddOptions, AggregateResult, FanOut, IdentifierPolicy};

const UNINITIALIZED: u8 = 0;
const READY: u8 = 1;
const SHUTTING_DOWN: u8 = 2;
const STOPPED: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Uninitialized,
    Ready,
    ShuttingDown,
    Stopped,
}

impl From<u8> for LifecycleState {
    fn from(raw: u8) -> Self {
        match raw {
            UNINITIALIZED => LifecycleState::Uninitialized,
            READY => LifecycleState::Ready,
            SHUTTING_DOWN => LifecycleState::ShuttingDown,
            _ => LifecycleState::Stopped,
        }
    }
}

/// Outcome of the shutdown sequence, shared by every caller of [`Lifecycle::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Backend handles that had been created and were closed
    pub released_handles: usize,
    /// The grace period ran out and in-flight attempts were cancelled
    pub forced: bool,
}

pub struct Lifecycle {
    state: AtomicU8,
    grace_period: Duration,
    policy: IdentifierPolicy,
    fanout: OnceLock<FanOut>,
    /// Counts admitted upload calls so shutdown can wait for them
    tracker: TaskTracker,
    /// Fired when the grace period expires; cuts off in-flight attempts
    cancel: CancellationToken,
    /// Fired as soon as shutdown begins
    shutdown_started: CancellationToken,
    report: watch::Sender<Option<ShutdownReport>>,
}

impl Lifecycle {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            state: AtomicU8::new(UNINITIALIZED),
            grace_period,
            policy: IdentifierPolicy::default(),
            fanout: OnceLock::new(),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            shutdown_started: CancellationToken::new(),
            report: watch::channel(None).0,
        }
    }

    pub fn with_policy(mut self, policy: IdentifierPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from(self.state.load(Ordering::SeqCst))
    }

    /// Install the backend registry and become `Ready`.
    pub fn initialize(&self, registry: BackendRegistry) -> Result<(), UploadError> {
        match self.state() {
            LifecycleState::Uninitialized => {}
            LifecycleState::Ready => return Err(UploadError::AlreadyInitialized),
            LifecycleState::ShuttingDown | LifecycleState::Stopped => return Err(UploadError::ServiceShuttingDown),
        }

        let backends = registry.len();
        let fanout = FanOut::new(Arc::new(registry))
            .with_policy(self.policy)
            .with_cancellation(self.cancel.clone());
        self.fanout.set(fanout).map_err(|_| UploadError::AlreadyInitialized)?;

        // Shutdown may have started between the check above and here; no handle has been created
        // yet, so there is nothing to release.
        self.state
            .compare_exchange(UNINITIALIZED, READY, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| UploadError::ServiceShuttingDown)?;

        tracing::info!(backends, grace_period = ?self.grace_period, "Uploader ready");
        Ok(())
    }

    /// The registry, once initialized.
    pub fn registry(&self) -> Option<&BackendRegistry> {
        self.fanout.get().map(FanOut::registry)
    }

    /// Normalize `input` and add it to every backend.
    ///
    /// Fails only for lifecycle and input errors; backend failures are reported inside the results.
    pub async fn add(&self, input: ContentInput, options: AddOptions) -> Result<Vec<AggregateResult>, UploadError> {
        // Taken before the state check, so a call admitted here is always waited for by shutdown
        let _token = self.tracker.token();

        match self.state() {
            LifecycleState::Ready => {}
            LifecycleState::Uninitialized => return Err(UploadError::ServiceNotReady),
            LifecycleState::ShuttingDown | LifecycleState::Stopped => return Err(UploadError::ServiceShuttingDown),
        }
        let fanout = self.fanout.get().ok_or(UploadError::ServiceNotReady)?;

        let items = input.normalize()?;
        Ok(fanout.add(items, options).await)
    }

    /// Token cancelled as soon as shutdown begins. Used to stop accepting connections.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_started.clone()
    }

    /// Run the shutdown sequence, or wait for the one already running.
    pub async fn shutdown(&self) -> ShutdownReport {
        let mut report_rx = self.report.subscribe();

        if !self.begin_shutdown() {
            tracing::debug!("Shutdown already in progress, waiting for it to finish");
            return match report_rx.wait_for(Option::is_some).await {
                Ok(report) => report.clone().unwrap_or_default(),
                Err(_) => ShutdownReport::default(),
            };
        }

        tracing::info!(grace_period = ?self.grace_period, "Shutting down, no longer accepting uploads");
        self.shutdown_started.cancel();
        self.tracker.close();

        let forced = match tokio::time::timeout(self.grace_period, self.tracker.wait()).await {
            Ok(()) => false,
            Err(_) => {
                tracing::warn!(in_flight = self.tracker.len(), "Grace period elapsed, cancelling in-flight uploads");
                self.cancel.cancel();
                self.tracker.wait().await;
                true
            }
        };

        let released_handles = match self.fanout.get() {
            Some(fanout) => fanout.registry().release().await,
            None => 0,
        };

        self.state.store(STOPPED, Ordering::SeqCst);
        let report = ShutdownReport { released_handles, forced };
        tracing::info!(released_handles, forced, "Shutdown complete");

        self.report.send_replace(Some(report.clone()));
        report
    }

    /// Single atomic transition into `ShuttingDown`. Returns true for the one caller that made it.
    fn begin_shutdown(&self) -> bool {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if current != UNINITIALIZED && current != READY {
                return false;
            }
            match self
                .state
                .compare_exchange(current, SHUTTING_DOWN, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

/// Wire interrupt, terminate and quit to [`Lifecycle::shutdown`].
///
/// Each signal class triggers shutdown at most once; shutdown itself collapses concurrent triggers.
pub fn spawn_signal_handlers(lifecycle: Arc<Lifecycle>) -> std::io::Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::new();

    let ctrl_c_lifecycle = lifecycle.clone();
    handles.push(tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received Ctrl+C, shutting down gracefully...");
                ctrl_c_lifecycle.shutdown().await;
            }
            Err(e) => tracing::error!("Failed to listen for Ctrl+C: {}", e),
        }
    }));

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        for (kind, name) in [(SignalKind::terminate(), "SIGTERM"), (SignalKind::quit(), "SIGQUIT")] {
            let mut stream = signal(kind)?;
            let lifecycle = lifecycle.clone();
            handles.push(tokio::spawn(async move {
                if stream.recv().await.is_some() {
                    tracing::info!("Received {}, shutting down gracefully...", name);
                    lifecycle.shutdown().await;
                }
            }));
        }
    }

    Ok(handles)
}
