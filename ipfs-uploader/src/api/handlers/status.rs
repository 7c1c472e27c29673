//! Liveness and configured nodes.

use axum::{Json, extract::State};

use crate::{
    AppState,
    api::models::uploads::{BackendSummary, BackendsResponse, PingResponse},
};

#[utoipa::path(
    get,
    path = "/ping",
    tag = "status",
    summary = "Liveness check",
    responses(
        (status = 200, description = "Server is up", body = PingResponse),
    )
)]
pub async fn ping() -> Json<PingResponse> {
    Json(PingResponse {
        message: "pong".to_string(),
    })
}

#[utoipa::path(
    get,
    path = "/backends",
    tag = "status",
    summary = "List configured nodes",
    description = "Lifecycle state and the nodes uploads fan out to, in configured order. Credentials are never included.",
    responses(
        (status = 200, description = "Configured nodes", body = BackendsResponse),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn list_backends(State(state): State<AppState>) -> Json<BackendsResponse> {
    // The server only runs over an initialized lifecycle, and the registry outlives shutdown
    let backends = state
        .lifecycle
        .registry()
        .map(|registry| registry.endpoints().map(BackendSummary::from).collect())
        .unwrap_or_default();

    Json(BackendsResponse {
        state: state.lifecycle.state(),
        backends,
    })
}
