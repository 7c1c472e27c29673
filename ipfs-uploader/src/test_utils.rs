//! Test utilities (available with the `test-utils` feature).
//!
//! [`MockBackend`] answers from a script instead of the network and counts what was asked of it,
//! so tests can assert both on results and on how many backend calls happened.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::backends::{Added, Backend, BackendEndpoint, BackendError, BackendFactory, BackendRegistry};
use crate::config::Config;
use crate::content::ContentItem;
#[cfg(test)]
use crate::{AppState, build_lifecycle, build_router, lifecycle::Lifecycle};

#[derive(Debug, Clone)]
enum Reply {
    Cid(String),
    /// `cid-{file name}`
    EchoName,
    Error(BackendError),
}

#[derive(Debug, Default)]
struct Counters {
    add_calls: AtomicUsize,
    tree_calls: AtomicUsize,
    close_calls: AtomicUsize,
}

/// Scripted backend. Clones share counters, so a test can keep one clone and hand another to a
/// [`MockFactory`].
#[derive(Debug, Clone)]
pub struct MockBackend {
    reply: Reply,
    tree_root: Option<String>,
    item_root: Option<String>,
    delay: Duration,
    counters: Arc<Counters>,
}

impl MockBackend {
    fn with_reply(reply: Reply) -> Self {
        Self {
            reply,
            tree_root: None,
            item_root: None,
            delay: Duration::ZERO,
            counters: Arc::default(),
        }
    }

    /// Every add succeeds with `cid`. Trees are unsupported unless [`with_tree_root`](Self::with_tree_root) is set.
    pub fn returning(cid: impl Into<String>) -> Self {
        Self::with_reply(Reply::Cid(cid.into()))
    }

    /// Every add succeeds with `cid-{file name}`.
    pub fn echoing_name() -> Self {
        Self::with_reply(Reply::EchoName)
    }

    /// Every call fails with `error`.
    pub fn failing(error: BackendError) -> Self {
        Self::with_reply(Reply::Error(error))
    }

    /// Tree adds succeed with `root`.
    pub fn with_tree_root(mut self, root: impl Into<String>) -> Self {
        self.tree_root = Some(root.into());
        self
    }

    /// Single adds report `root` as an enclosing tree.
    pub fn with_item_root(mut self, root: impl Into<String>) -> Self {
        self.item_root = Some(root.into());
        self
    }

    /// Every call sleeps for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn add_calls(&self) -> usize {
        self.counters.add_calls.load(Ordering::SeqCst)
    }

    pub fn tree_calls(&self) -> usize {
        self.counters.tree_calls.load(Ordering::SeqCst)
    }

    /// Calls of any kind that reached this backend.
    pub fn calls(&self) -> usize {
        self.add_calls() + self.tree_calls()
    }

    pub fn close_count(&self) -> usize {
        self.counters.close_calls.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn add(&self, item: &ContentItem) -> Result<Added, BackendError> {
        self.counters.add_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;

        let added = match &self.reply {
            Reply::Cid(cid) => Added::new(cid.clone()),
            Reply::EchoName => Added::new(format!("cid-{}", item.file_name())),
            Reply::Error(e) => return Err(e.clone()),
        };
        Ok(match &self.item_root {
            Some(root) => added.with_root(root.clone()),
            None => added,
        })
    }

    async fn add_tree(&self, _items: &[ContentItem]) -> Result<Added, BackendError> {
        self.counters.tree_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;

        if let Reply::Error(e) = &self.reply {
            return Err(e.clone());
        }
        match &self.tree_root {
            Some(root) => Ok(Added::new(root.clone()).with_root(root.clone())),
            None => Err(BackendError::TreeUnsupported),
        }
    }

    async fn close(&self) {
        self.counters.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out [`MockBackend`]s by endpoint name.
#[derive(Debug, Default)]
pub struct MockFactory {
    backends: HashMap<String, MockBackend>,
    failing: HashSet<String>,
    connects: AtomicUsize,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, name: impl Into<String>, backend: MockBackend) -> Self {
        self.backends.insert(name.into(), backend);
        self
    }

    /// Handle creation for `name` fails with [`BackendError::Unavailable`].
    pub fn failing_connect(mut self, name: impl Into<String>) -> Self {
        self.failing.insert(name.into());
        self
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl BackendFactory for MockFactory {
    fn connect(&self, endpoint: &BackendEndpoint) -> Result<Arc<dyn Backend>, BackendError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(&endpoint.name) {
            return Err(BackendError::Unavailable(format!("cannot create client for {}", endpoint.name)));
        }
        match self.backends.get(&endpoint.name) {
            Some(backend) => Ok(Arc::new(backend.clone())),
            None => Err(BackendError::Unavailable(format!("no mock configured for {}", endpoint.name))),
        }
    }
}

/// Endpoint with default settings and a placeholder address.
pub fn endpoint(name: &str) -> BackendEndpoint {
    let url = format!("http://{name}.test:5001").parse().expect("valid test url");
    BackendEndpoint::new(name, url)
}

/// Registry over the given mocks, in order, plus the factory that serves them.
pub fn registry_with(backends: Vec<(&str, MockBackend)>) -> (Arc<BackendRegistry>, Arc<MockFactory>) {
    let endpoints = backends.iter().map(|(name, _)| endpoint(name)).collect();
    let factory = Arc::new(mock_factory(backends));
    let registry = BackendRegistry::new(endpoints, factory.clone()).expect("valid test registry");
    (Arc::new(registry), factory)
}

fn mock_factory(backends: Vec<(&str, MockBackend)>) -> MockFactory {
    backends
        .into_iter()
        .fold(MockFactory::new(), |factory, (name, backend)| factory.with_backend(name, backend))
}

/// Configuration pointing at the given endpoints, with everything else at defaults.
pub fn create_test_config(endpoints: Vec<BackendEndpoint>) -> Config {
    Config {
        backends: endpoints,
        ..Config::default()
    }
}

/// Full router over the given mocks, with a `Ready` lifecycle the test can shut down.
#[cfg(test)]
pub fn create_test_app(backends: Vec<(&str, MockBackend)>) -> (axum_test::TestServer, Arc<Lifecycle>) {
    let config = create_test_config(backends.iter().map(|(name, _)| endpoint(name)).collect());
    let lifecycle = build_lifecycle(&config, Arc::new(mock_factory(backends))).expect("valid test lifecycle");

    let state = AppState {
        lifecycle: lifecycle.clone(),
        config: Arc::new(config),
    };
    let router = build_router(&state).expect("Failed to build router");
    let server = axum_test::TestServer::new(router).expect("Failed to create test server");
    (server, lifecycle)
}
