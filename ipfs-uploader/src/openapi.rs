//! OpenAPI documentation for the upload server, served at `/docs`.

use utoipa::OpenApi;

use crate::api;
use crate::errors::ErrorBody;
use crate::fanout::{AggregateResult, AttemptStatus, BackendOutcome, FailureKind};
use crate::lifecycle::LifecycleState;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "IPFS Uploader",
        description = "Adds content to every configured IPFS node at once and reports one content identifier plus a per-node breakdown."
    ),
    paths(
        api::handlers::uploads::upload_file,
        api::handlers::uploads::upload_files,
        api::handlers::uploads::upload_text,
        api::handlers::uploads::upload_json,
        api::handlers::uploads::upload_tree,
        api::handlers::status::ping,
        api::handlers::status::list_backends,
    ),
    components(
        schemas(
            AggregateResult,
            BackendOutcome,
            AttemptStatus,
            FailureKind,
            ErrorBody,
            LifecycleState,
            api::models::uploads::TreeEntryRequest,
            api::models::uploads::TreeUploadRequest,
            api::models::uploads::PingResponse,
            api::models::uploads::BackendSummary,
            api::models::uploads::BackendsResponse,
        )
    ),
    tags(
        (name = "uploads", description = "Fan-out uploads"),
        (name = "status", description = "Liveness and configuration"),
    )
)]
pub struct ApiDoc;
