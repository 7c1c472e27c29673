//! # ipfs-uploader: add content to many IPFS nodes at once
//!
//! `ipfs-uploader` takes a piece of content (a file, several files, a string, a JSON document or a
//! directory tree), adds it to every configured IPFS node concurrently, and reports a single content
//! identifier (CID) together with a per-node breakdown of what happened. A node that is down or slow
//! never fails the whole upload: as long as one node accepted the content, the upload succeeded,
//! and the report says which nodes did not.
//!
//! ## Architecture
//!
//! Four pieces do the work, wired together by a thin transport layer (an axum server or the CLI):
//!
//! - The **content normalizer** ([`content`]) turns every input shape into an ordered list of
//!   [`ContentItem`](content::ContentItem)s, validating tree paths before anything touches the
//!   network.
//! - The **backend registry** ([`backends`]) holds the fixed, ordered set of nodes with their
//!   credentials, per-node timeout and concurrency limit. Client handles are created lazily, so an
//!   unreachable node never prevents startup.
//! - The **fan-out orchestrator** ([`fanout`]) runs one attempt per item per node, turns every
//!   node failure into a [`BackendOutcome`](fanout::BackendOutcome), and reconciles the reported
//!   identifiers into one [`AggregateResult`](fanout::AggregateResult) per item.
//! - The **lifecycle manager** ([`lifecycle`]) owns the registry, admits upload calls only while
//!   ready, and runs exactly one shutdown sequence however many signals arrive: stop admitting,
//!   drain for a grace period, cancel the rest, release every handle.
//!
//! ## Surfaces
//!
//! The HTTP server ([`api`]) exposes `/upload/{file,files,text,json,tree}`, `/ping` and `/backends`,
//! with OpenAPI docs at `/docs`. The CLI ([`commands`]) uploads files, text, JSON and directories
//! directly, writes a starter configuration, and removes local configuration.
//!
//! ## Configuration
//!
//! See [`config`]: a YAML file plus `IPFS_UPLOADER_*` environment overrides.

pub mod api;
pub mod backends;
pub mod cleanup;
pub mod commands;
pub mod config;
pub mod content;
pub mod errors;
pub mod fanout;
pub mod lifecycle;
pub mod openapi;
pub mod telemetry;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{self, HeaderValue},
    routing::{get, post},
};
use axum_prometheus::PrometheusMetricLayer;
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, info, instrument};
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

pub use config::Config;

use crate::backends::{BackendFactory, BackendRegistry, kubo::KuboFactory};
use crate::config::CorsOrigin;
use crate::lifecycle::{Lifecycle, ShutdownReport};
use crate::openapi::ApiDoc;

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<Lifecycle>,
    pub config: Arc<Config>,
}

/// Build a registry over `config.backends` and a lifecycle that is already `Ready`.
pub fn build_lifecycle(config: &Config, factory: Arc<dyn BackendFactory>) -> anyhow::Result<Arc<Lifecycle>> {
    let registry = BackendRegistry::new(config.backends.clone(), factory)?;
    let lifecycle = Lifecycle::new(config.shutdown_grace_period).with_policy(config.identifier_policy);
    lifecycle.initialize(registry)?;
    Ok(Arc::new(lifecycle))
}

fn create_cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    let allow_origin = if config.cors_allowed_origins.contains(&CorsOrigin::Wildcard) {
        AllowOrigin::any()
    } else {
        let mut origins = Vec::new();
        for origin in &config.cors_allowed_origins {
            if let CorsOrigin::Url(url) = origin {
                // Browsers send origins without a trailing slash
                origins.push(url.as_str().trim_end_matches('/').parse::<HeaderValue>()?);
            }
        }
        AllowOrigin::list(origins)
    };

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([http::Method::GET, http::Method::POST])
        .allow_headers(Any))
}

/// Build the application router: upload and status routes, OpenAPI docs, CORS, tracing and
/// (optionally) Prometheus metrics.
#[instrument(skip_all)]
pub fn build_router(state: &AppState) -> anyhow::Result<Router> {
    let uploads = Router::new()
        .route("/upload/file", post(api::handlers::uploads::upload_file))
        .route("/upload/files", post(api::handlers::uploads::upload_files))
        .route("/upload/text", post(api::handlers::uploads::upload_text))
        .route("/upload/json", post(api::handlers::uploads::upload_json))
        .route("/upload/tree", post(api::handlers::uploads::upload_tree))
        .layer(DefaultBodyLimit::max(state.config.max_upload_size));

    let router = Router::new()
        .merge(uploads)
        .route("/ping", get(api::handlers::status::ping))
        .route("/backends", get(api::handlers::status::list_backends))
        .with_state(state.clone())
        .merge(Scalar::with_url("/docs", ApiDoc::openapi()));

    let mut router = router.layer(create_cors_layer(&state.config)?);

    if state.config.enable_metrics {
        let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();
        router = router
            .route("/internal/metrics", get(|| async move { metric_handle.render() }))
            .layer(prometheus_layer);
    }

    let router = router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    Ok(router)
}

/// The upload server.
///
/// ```no_run
/// # async fn run(config: ipfs_uploader::Config) -> anyhow::Result<()> {
/// let app = ipfs_uploader::Application::new(config)?;
/// ipfs_uploader::lifecycle::spawn_signal_handlers(app.lifecycle())?;
/// app.serve().await?;
/// # Ok(())
/// # }
/// ```
pub struct Application {
    router: Router,
    lifecycle: Arc<Lifecycle>,
    config: Arc<Config>,
}

impl Application {
    /// Build the registry over Kubo nodes and the router. Does not touch the network.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        tracing::debug!("Starting uploader with configuration: {:#?}", config);

        let lifecycle = build_lifecycle(&config, Arc::new(KuboFactory))?;
        let config = Arc::new(config);
        let state = AppState {
            lifecycle: lifecycle.clone(),
            config: config.clone(),
        };
        let router = build_router(&state)?;

        Ok(Self {
            router,
            lifecycle,
            config,
        })
    }

    pub fn lifecycle(&self) -> Arc<Lifecycle> {
        self.lifecycle.clone()
    }

    /// Serve until the lifecycle starts shutting down, then finish the shutdown sequence.
    pub async fn serve(self) -> anyhow::Result<ShutdownReport> {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "Uploader listening on http://{}, available at http://localhost:{}",
            bind_addr, self.config.port
        );

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(self.lifecycle.shutdown_token().cancelled_owned())
            .await?;

        Ok(self.lifecycle.shutdown().await)
    }
}
