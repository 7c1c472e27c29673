use std::time::Duration;

use serde::{Serialize, Serializer};
use utoipa::ToSchema;

use crate::backends::BackendError;

/// Why an attempt against one backend did not produce an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The per-backend timeout or the call deadline elapsed
    Timeout,
    ConnectionRefused,
    /// The backend answered with a non-success status
    BackendRejected,
    /// Items were added one by one but no enclosing tree identifier came back
    PartialTreeUnsupported,
    /// The client handle could not be created
    Unavailable,
    /// Other I/O or protocol errors, including malformed responses
    Transport,
    /// The attempt was abandoned because shutdown's grace period ran out
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::ConnectionRefused => "connection_refused",
            FailureKind::BackendRejected => "backend_rejected",
            FailureKind::PartialTreeUnsupported => "partial_tree_unsupported",
            FailureKind::Unavailable => "unavailable",
            FailureKind::Transport => "transport",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

impl From<&BackendError> for FailureKind {
    fn from(e: &BackendError) -> Self {
        match e {
            BackendError::ConnectionRefused(_) => FailureKind::ConnectionRefused,
            BackendError::Rejected { .. } => FailureKind::BackendRejected,
            BackendError::Timeout(_) => FailureKind::Timeout,
            BackendError::Transport(_) | BackendError::InvalidResponse(_) => FailureKind::Transport,
            BackendError::TreeUnsupported => FailureKind::PartialTreeUnsupported,
            BackendError::Unavailable(_) => FailureKind::Unavailable,
        }
    }
}

/// Result of one attempt against one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptStatus {
    Succeeded { cid: String },
    Failed { kind: FailureKind, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackendOutcome {
    /// Backend name, as configured
    pub backend: String,
    #[serde(flatten)]
    pub status: AttemptStatus,
    #[serde(rename = "elapsedMs", serialize_with = "serialize_millis")]
    #[schema(value_type = u64)]
    pub elapsed: Duration,
}

fn serialize_millis<S: Serializer>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(elapsed.as_millis() as u64)
}

impl BackendOutcome {
    pub fn succeeded(backend: impl Into<String>, cid: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            backend: backend.into(),
            status: AttemptStatus::Succeeded { cid: cid.into() },
            elapsed,
        }
    }

    pub fn failed(backend: impl Into<String>, kind: FailureKind, message: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            backend: backend.into(),
            status: AttemptStatus::Failed {
                kind,
                message: message.into(),
            },
            elapsed,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, AttemptStatus::Succeeded { .. })
    }

    pub fn cid(&self) -> Option<&str> {
        match &self.status {
            AttemptStatus::Succeeded { cid } => Some(cid),
            AttemptStatus::Failed { .. } => None,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match &self.status {
            AttemptStatus::Succeeded { .. } => None,
            AttemptStatus::Failed { kind, .. } => Some(*kind),
        }
    }

    /// Label used for metrics and logs.
    pub fn outcome_label(&self) -> &'static str {
        match &self.status {
            AttemptStatus::Succeeded { .. } => "success",
            AttemptStatus::Failed { kind, .. } => kind.as_str(),
        }
    }
}

/// Per-call summary across every backend in the registry.
///
/// `success_count + error_count == total_nodes` always holds, and `outcomes` has one entry per
/// backend in registry order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AggregateResult {
    /// Reconciled identifier; absent only when no backend succeeded
    pub cid: Option<String>,
    /// True iff at least one backend succeeded
    pub success: bool,
    pub total_nodes: usize,
    pub success_count: usize,
    pub error_count: usize,
    /// Set when successful backends disagreed and no identifier won outright
    pub identifier_mismatch: bool,
    pub outcomes: Vec<BackendOutcome>,
}
