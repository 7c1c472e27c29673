//! Content-addressable backends.
//!
//! A backend is treated as an opaque service that accepts content and answers with its content
//! identifier. The orchestrator only ever talks to the [`Backend`] trait; [`kubo`] provides the
//! HTTP implementation for IPFS Kubo RPC nodes, and tests plug in mocks through [`BackendFactory`].

pub mod kubo;
mod registry;

pub use registry::{BackendEndpoint, BackendRegistry, Credential};

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::content::ContentItem;

/// What a backend reported after accepting content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Added {
    /// Identifier of the content that was sent
    pub cid: String,
    /// Identifier of an enclosing tree, when the backend reports one
    pub root: Option<String>,
}

impl Added {
    pub fn new(cid: impl Into<String>) -> Self {
        Self { cid: cid.into(), root: None }
    }

    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.root = Some(root.into());
        self
    }
}

/// Failure of a single backend call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("backend rejected the request with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected response: {0}")]
    InvalidResponse(String),

    /// The backend cannot add a set of paths as one tree
    #[error("backend does not support directory trees")]
    TreeUnsupported,

    /// The client handle could not be created
    #[error("backend client unavailable: {0}")]
    Unavailable(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BackendError::Timeout(e.to_string())
        } else if e.is_connect() {
            BackendError::ConnectionRefused(e.to_string())
        } else if e.is_decode() {
            BackendError::InvalidResponse(e.to_string())
        } else {
            BackendError::Transport(e.to_string())
        }
    }
}

/// The "add content, return identifier" capability of a node.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Add a single item.
    async fn add(&self, item: &ContentItem) -> Result<Added, BackendError>;

    /// Add every item as one directory tree and return the tree's identifier.
    ///
    /// Backends that cannot do this return [`BackendError::TreeUnsupported`] and the orchestrator
    /// falls back to adding items one by one.
    async fn add_tree(&self, items: &[ContentItem]) -> Result<Added, BackendError> {
        let _ = items;
        Err(BackendError::TreeUnsupported)
    }

    /// Release any resources held by the handle. Called once, at shutdown.
    async fn close(&self) {}
}

/// Creates client handles for endpoints. Called lazily, on first use of each endpoint.
pub trait BackendFactory: Send + Sync {
    fn connect(&self, endpoint: &BackendEndpoint) -> Result<Arc<dyn Backend>, BackendError>;
}
