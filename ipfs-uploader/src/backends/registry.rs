use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use url::Url;

use super::{Backend, BackendError, BackendFactory};
use crate::errors::UploadError;

/// Credential sent as a header on every request to a backend.
#[derive(Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Credential {
    /// Header name (default: `X-API-Key`)
    #[serde(default = "Credential::default_header")]
    pub header: String,
    pub value: String,
}

impl Credential {
    fn default_header() -> String {
        "X-API-Key".to_string()
    }

    pub fn api_key(value: impl Into<String>) -> Self {
        Self {
            header: Self::default_header(),
            value: value.into(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("header", &self.header)
            .field("value", &"<redacted>")
            .finish()
    }
}

/// Immutable description of one backend node.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BackendEndpoint {
    /// Unique name, used in outcome reports and logs
    pub name: String,
    /// Base address of the node's RPC API (e.g. `http://127.0.0.1:5001`)
    pub url: Url,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<Credential>,
    /// Timeout for each individual call to this backend
    #[serde(default = "BackendEndpoint::default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Maximum number of calls in flight against this backend
    #[serde(default = "BackendEndpoint::default_max_concurrency")]
    pub max_concurrency: usize,
    /// Whether the node can add a set of paths as one directory tree
    #[serde(default = "BackendEndpoint::default_tree_uploads")]
    pub tree_uploads: bool,
    #[serde(default = "BackendEndpoint::default_cid_version")]
    pub cid_version: u8,
}

impl BackendEndpoint {
    pub fn new(name: impl Into<String>, url: Url) -> Self {
        Self {
            name: name.into(),
            url,
            credential: None,
            timeout: Self::default_timeout(),
            max_concurrency: Self::default_max_concurrency(),
            tree_uploads: Self::default_tree_uploads(),
            cid_version: Self::default_cid_version(),
        }
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_tree_uploads(mut self, tree_uploads: bool) -> Self {
        self.tree_uploads = tree_uploads;
        self
    }

    /// Check the settings the registry depends on.
    pub fn validate(&self) -> Result<(), UploadError> {
        let reason = if self.max_concurrency == 0 {
            "max_concurrency must be at least 1".to_string()
        } else if self.max_concurrency > Semaphore::MAX_PERMITS {
            format!("max_concurrency must be at most {}", Semaphore::MAX_PERMITS)
        } else if self.timeout.is_zero() {
            "timeout must be greater than zero".to_string()
        } else {
            return Ok(());
        };

        Err(UploadError::InvalidBackendSetting {
            name: self.name.clone(),
            reason,
        })
    }

    fn default_timeout() -> Duration {
        Duration::from_secs(60)
    }

    fn default_max_concurrency() -> usize {
        8
    }

    fn default_tree_uploads() -> bool {
        true
    }

    fn default_cid_version() -> u8 {
        1
    }
}

struct Slot {
    endpoint: BackendEndpoint,
    /// Created on first use, taken back on release
    handle: Mutex<Option<Arc<dyn Backend>>>,
    permits: Arc<Semaphore>,
}

/// The fixed set of backends, in configuration order.
///
/// Built once and never mutated afterwards, so any number of concurrent upload calls can share it
/// without locking. Client handles are created on first use: construction never touches the
/// network and never fails because a node is unreachable.
pub struct BackendRegistry {
    slots: Vec<Slot>,
    factory: Arc<dyn BackendFactory>,
    released: AtomicBool,
}

impl BackendRegistry {
    pub fn new(endpoints: Vec<BackendEndpoint>, factory: Arc<dyn BackendFactory>) -> Result<Self, UploadError> {
        if endpoints.is_empty() {
            return Err(UploadError::NoBackendsConfigured);
        }

        let mut slots: Vec<Slot> = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            if slots.iter().any(|s| s.endpoint.name == endpoint.name) {
                return Err(UploadError::DuplicateBackendName { name: endpoint.name });
            }
            endpoint.validate()?;
            let permits = Arc::new(Semaphore::new(endpoint.max_concurrency));
            slots.push(Slot {
                endpoint,
                handle: Mutex::new(None),
                permits,
            });
        }

        tracing::info!(backends = slots.len(), "Backend registry initialized");

        Ok(Self {
            slots,
            factory,
            released: AtomicBool::new(false),
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Always false: a registry holds at least one backend.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Endpoint descriptors in registry order.
    pub fn endpoints(&self) -> impl ExactSizeIterator<Item = &BackendEndpoint> {
        self.slots.iter().map(|s| &s.endpoint)
    }

    pub(crate) fn endpoint(&self, index: usize) -> &BackendEndpoint {
        &self.slots[index].endpoint
    }

    pub(crate) fn permits(&self, index: usize) -> Arc<Semaphore> {
        self.slots[index].permits.clone()
    }

    /// Client handle for the backend at `index`, created on first use.
    ///
    /// A failed creation is not cached; the next call tries again.
    pub(crate) fn handle(&self, index: usize) -> Result<Arc<dyn Backend>, BackendError> {
        let slot = &self.slots[index];
        let mut handle = slot.handle.lock().unwrap_or_else(PoisonError::into_inner);

        // Checked under the slot lock so release never misses a handle created concurrently
        if self.released.load(Ordering::Acquire) {
            return Err(BackendError::Unavailable("backend handles have been released".to_string()));
        }

        if let Some(existing) = handle.as_ref() {
            return Ok(existing.clone());
        }

        tracing::debug!(backend = %slot.endpoint.name, url = %slot.endpoint.url, "Creating backend client");
        let created = self.factory.connect(&slot.endpoint)?;
        *handle = Some(created.clone());
        Ok(created)
    }

    /// Close and drop every handle that was created, and refuse further use.
    ///
    /// Returns the number of handles closed. Only the first call does any work.
    pub async fn release(&self) -> usize {
        if self.released.swap(true, Ordering::AcqRel) {
            return 0;
        }

        let mut closed = 0;
        for slot in &self.slots {
            slot.permits.close();
            let taken = slot.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(handle) = taken {
                handle.close().await;
                closed += 1;
                tracing::debug!(backend = %slot.endpoint.name, "Backend client released");
            }
        }

        tracing::info!(closed, "Backend handles released");
        closed
    }
}
