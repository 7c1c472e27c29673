//! Fan-out orchestration: one logical add becomes one attempt per backend.
//!
//! ```text
//! FanOut::add(items)
//!   ├─ group items into units (each blob alone, all path items as one tree)
//!   └─ for each unit, concurrently:
//!        ├─ for each backend, concurrently:
//!        │    ├─ wait for a permit from that backend's semaphore
//!        │    ├─ create the client handle on first use
//!        │    ├─ add blob / add tree (falling back to one add per path item)
//!        │    └─ bounded by the backend timeout, the call deadline and shutdown cancellation
//!        └─ once all N attempts settle: reconcile identifiers, tally, emit AggregateResult
//! ```
//!
//! Backend failures never escape an attempt: each one becomes a [`BackendOutcome`] and the call as
//! a whole always returns a full report.

mod outcome;
mod reconcile;

pub use outcome::{AggregateResult, AttemptStatus, BackendOutcome, FailureKind};
pub use reconcile::{IdentifierPolicy, Reconciled, reconcile};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use metrics::{counter, histogram};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backends::{Backend, BackendError, BackendRegistry};
use crate::content::ContentItem;

/// Per-call options.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddOptions {
    /// Applies to every attempt of the call. Attempts still waiting for a permit when it
    /// elapses are never started.
    pub deadline: Option<Duration>,
}

impl AddOptions {
    pub fn with_deadline(deadline: Duration) -> Self {
        Self { deadline: Some(deadline) }
    }
}

/// What one aggregate result is computed for.
enum Unit {
    Blob(ContentItem),
    Tree(Vec<ContentItem>),
}

impl Unit {
    fn kind(&self) -> &'static str {
        match self {
            Unit::Blob(_) => "blob",
            Unit::Tree(_) => "tree",
        }
    }
}

/// Split items into units, preserving order. Path-carrying items form a single tree unit placed
/// where the first of them appeared.
fn group(items: Vec<ContentItem>) -> Vec<Unit> {
    let mut units = Vec::new();
    let mut tree_slot: Option<usize> = None;

    for item in items {
        if item.path.is_none() {
            units.push(Unit::Blob(item));
            continue;
        }
        match tree_slot {
            Some(idx) => {
                if let Unit::Tree(tree) = &mut units[idx] {
                    tree.push(item);
                }
            }
            None => {
                tree_slot = Some(units.len());
                units.push(Unit::Tree(vec![item]));
            }
        }
    }

    units
}

/// A failed attempt, before it is stamped with backend name and duration.
struct Failure {
    kind: FailureKind,
    message: String,
}

impl From<BackendError> for Failure {
    fn from(e: BackendError) -> Self {
        Self {
            kind: FailureKind::from(&e),
            message: e.to_string(),
        }
    }
}

/// Dispatches content to every backend in a registry.
#[derive(Clone)]
pub struct FanOut {
    registry: Arc<BackendRegistry>,
    policy: IdentifierPolicy,
    cancel: CancellationToken,
}

impl FanOut {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self {
            registry,
            policy: IdentifierPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_policy(mut self, policy: IdentifierPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Attempts still running when `cancel` fires are recorded as [`FailureKind::Cancelled`].
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Add every item to every backend.
    ///
    /// Returns one [`AggregateResult`] per blob item, in input order. Items carrying a path are
    /// added together as one directory tree and produce a single result, positioned where the first
    /// of them appeared.
    pub async fn add(&self, items: Vec<ContentItem>, options: AddOptions) -> Vec<AggregateResult> {
        let deadline = options.deadline.map(|d| Instant::now() + d);
        let units = group(items);

        join_all(units.iter().map(|unit| self.add_unit(unit, deadline))).await
    }

    async fn add_unit(&self, unit: &Unit, deadline: Option<Instant>) -> AggregateResult {
        let total_nodes = self.registry.len();
        let outcomes = join_all((0..total_nodes).map(|idx| self.attempt(idx, unit, deadline))).await;

        let success_count = outcomes.iter().filter(|o| o.is_success()).count();
        let Reconciled { cid, mismatch } = reconcile(&outcomes, self.policy);

        if mismatch {
            tracing::warn!(
                cid = ?cid,
                policy = ?self.policy,
                "Backends reported different identifiers for the same content"
            );
        }
        tracing::info!(
            unit = unit.kind(),
            cid = ?cid,
            success_count,
            total_nodes,
            "Fan-out complete"
        );

        AggregateResult {
            success: cid.is_some(),
            cid,
            total_nodes,
            success_count,
            error_count: total_nodes - success_count,
            identifier_mismatch: mismatch,
            outcomes,
        }
    }

    async fn attempt(&self, idx: usize, unit: &Unit, deadline: Option<Instant>) -> BackendOutcome {
        let endpoint = self.registry.endpoint(idx);
        let start = Instant::now();
        let started = AtomicBool::new(false);

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Failure {
                kind: FailureKind::Cancelled,
                message: "shutdown grace period elapsed".to_string(),
            }),
            _ = sleep_until_deadline(deadline) => Err(Failure {
                kind: FailureKind::Timeout,
                message: if started.load(Ordering::Acquire) {
                    "call deadline elapsed".to_string()
                } else {
                    "call deadline elapsed before the attempt started".to_string()
                },
            }),
            result = self.run_attempt(idx, unit, &started) => result,
        };

        let elapsed = start.elapsed();
        let outcome = match result {
            Ok(cid) => BackendOutcome::succeeded(&endpoint.name, cid, elapsed),
            Err(Failure { kind, message }) => BackendOutcome::failed(&endpoint.name, kind, message, elapsed),
        };

        record_attempt(&outcome);
        outcome
    }

    async fn run_attempt(&self, idx: usize, unit: &Unit, started: &AtomicBool) -> Result<String, Failure> {
        let timeout = self.registry.endpoint(idx).timeout;
        let _permit = self
            .registry
            .permits(idx)
            .acquire_owned()
            .await
            .map_err(|_| BackendError::Unavailable("backend handles have been released".to_string()))?;
        let handle = self.registry.handle(idx)?;

        started.store(true, Ordering::Release);
        match tokio::time::timeout(timeout, add_unit_to(handle.as_ref(), unit)).await {
            Ok(result) => result,
            Err(_) => Err(Failure {
                kind: FailureKind::Timeout,
                message: format!("no response within {}", humantime::format_duration(timeout)),
            }),
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// One backend's contribution to a unit: the identifier it reported.
async fn add_unit_to(backend: &dyn Backend, unit: &Unit) -> Result<String, Failure> {
    match unit {
        Unit::Blob(item) => Ok(backend.add(item).await?.cid),
        Unit::Tree(items) => match backend.add_tree(items).await {
            Ok(added) => Ok(added.root.unwrap_or(added.cid)),
            Err(BackendError::TreeUnsupported) => add_individually(backend, items).await,
            Err(e) => Err(e.into()),
        },
    }
}

/// Tree fallback: add each path item on its own and use a tree identifier only if the backend
/// reports one.
async fn add_individually(backend: &dyn Backend, items: &[ContentItem]) -> Result<String, Failure> {
    let mut root = None;
    for item in items {
        let added = backend.add(item).await?;
        if added.root.is_some() {
            root = added.root;
        }
    }

    root.ok_or_else(|| Failure {
        kind: FailureKind::PartialTreeUnsupported,
        message: format!("added {} items individually; no tree identifier reported", items.len()),
    })
}

fn record_attempt(outcome: &BackendOutcome) {
    let elapsed_ms = outcome.elapsed.as_millis() as u64;
    match &outcome.status {
        AttemptStatus::Succeeded { cid } => {
            tracing::debug!(backend = %outcome.backend, cid = %cid, elapsed_ms, "Backend attempt succeeded");
        }
        AttemptStatus::Failed {
            kind: FailureKind::PartialTreeUnsupported,
            message,
        } => {
            tracing::info!(backend = %outcome.backend, elapsed_ms, "Backend has no tree support: {}", message);
        }
        AttemptStatus::Failed { kind, message } => {
            tracing::warn!(backend = %outcome.backend, kind = kind.as_str(), elapsed_ms, "Backend attempt failed: {}", message);
        }
    }

    counter!(
        "ipfs_uploader_backend_attempts_total",
        "backend" => outcome.backend.clone(),
        "outcome" => outcome.outcome_label()
    )
    .increment(1);
    histogram!("ipfs_uploader_backend_attempt_duration_seconds", "backend" => outcome.backend.clone())
        .record(outcome.elapsed.as_secs_f64());
}
