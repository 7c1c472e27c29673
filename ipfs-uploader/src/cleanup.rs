//! Removing local files, one isolated outcome per path.
//!
//! Every path is removed concurrently and classified on its own, so one failure never hides the
//! result for the others. Whether a missing path counts as a failure is decided by the caller.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use futures::future::join_all;

/// How to classify a path that does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingPolicy {
    /// Report it as [`CleanupStatus::SkippedMissing`]
    Ignore,
    /// Report it as [`CleanupStatus::Failed`]
    Strict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupStatus {
    Removed,
    SkippedMissing,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupOutcome {
    pub path: PathBuf,
    pub status: CleanupStatus,
}

impl CleanupOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self.status, CleanupStatus::Failed(_))
    }
}

/// Remove every path (directories recursively). Outcomes are in input order.
pub async fn remove_all<P: AsRef<Path>>(paths: &[P], policy: MissingPolicy) -> Vec<CleanupOutcome> {
    join_all(paths.iter().map(|path| remove_one(path.as_ref(), policy))).await
}

async fn remove_one(path: &Path, policy: MissingPolicy) -> CleanupOutcome {
    let result = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) => Err(e),
    };

    let status = match result {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "Removed");
            CleanupStatus::Removed
        }
        Err(e) if e.kind() == ErrorKind::NotFound && policy == MissingPolicy::Ignore => {
            tracing::debug!(path = %path.display(), "Nothing to remove");
            CleanupStatus::SkippedMissing
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), "Failed to remove: {}", e);
            CleanupStatus::Failed(e.to_string())
        }
    };

    CleanupOutcome {
        path: path.to_path_buf(),
        status,
    }
}
