use axum::{
    Json,
    extract::{
        Multipart, State,
        multipart::{Field, MultipartRejection},
        rejection::JsonRejection,
    },
};
use bytes::Bytes;

use crate::{
    AppState,
    api::models::uploads::TreeUploadRequest,
    content::{ContentInput, FileInput},
    errors::{Error, ErrorBody, Result},
    fanout::{AddOptions, AggregateResult},
};

fn options(state: &AppState) -> AddOptions {
    AddOptions {
        deadline: state.config.request_deadline,
    }
}

async fn add_one(state: &AppState, input: ContentInput) -> Result<AggregateResult> {
    let results = state.lifecycle.add(input, options(state)).await?;
    results
        .into_iter()
        .next()
        .ok_or_else(|| Error::Other(anyhow::anyhow!("fan-out produced no result")))
}

fn bad_request(message: impl Into<String>) -> Error {
    Error::BadRequest { message: message.into() }
}

async fn read_file_field(field: Field<'_>) -> Result<FileInput> {
    let name = field.file_name().unwrap_or("file").to_string();
    let media_type = field.content_type().map(str::to_string);
    let bytes: Bytes = field.bytes().await.map_err(|e| bad_request(e.body_text()))?;

    let file = FileInput::new(name, bytes);
    Ok(match media_type {
        Some(media_type) => file.with_media_type(media_type),
        None => file,
    })
}

/// Read every multipart field called `field_name`, in order.
async fn collect_files(multipart: std::result::Result<Multipart, MultipartRejection>, field_name: &str) -> Result<Vec<FileInput>> {
    let mut multipart = multipart.map_err(|e| bad_request(e.body_text()))?;
    let mut files = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(|e| bad_request(e.body_text()))? {
        if field.name() == Some(field_name) {
            files.push(read_file_field(field).await?);
        }
    }

    Ok(files)
}

#[utoipa::path(
    post,
    path = "/upload/file",
    tag = "uploads",
    summary = "Upload a file",
    description = "Adds the multipart field `file` to every configured node.",
    request_body(content_type = "multipart/form-data", description = "A single `file` field"),
    responses(
        (status = 200, description = "Per-node report (check `success`)", body = AggregateResult),
        (status = 400, description = "No file provided", body = ErrorBody),
        (status = 503, description = "Shutting down", body = ErrorBody)
    )
)]
#[tracing::instrument(skip_all)]
pub async fn upload_file(
    State(state): State<AppState>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<Json<AggregateResult>> {
    let file = collect_files(multipart, "file")
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| bad_request("File is required"))?;

    tracing::debug!(name = %file.name, bytes = file.bytes.len(), "Uploading file");
    Ok(Json(add_one(&state, ContentInput::File(file)).await?))
}

#[utoipa::path(
    post,
    path = "/upload/files",
    tag = "uploads",
    summary = "Upload several files",
    description = "Adds every multipart field named `files`; one report per file, in order.",
    request_body(content_type = "multipart/form-data", description = "One or more `files` fields"),
    responses(
        (status = 200, description = "One report per file", body = Vec<AggregateResult>),
        (status = 400, description = "No files provided", body = ErrorBody),
        (status = 503, description = "Shutting down", body = ErrorBody)
    )
)]
#[tracing::instrument(skip_all)]
pub async fn upload_files(
    State(state): State<AppState>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<Json<Vec<AggregateResult>>> {
    let files = collect_files(multipart, "files").await?;
    if files.is_empty() {
        return Err(bad_request("Files are required"));
    }

    tracing::debug!(count = files.len(), "Uploading files");
    let results = state.lifecycle.add(ContentInput::Files(files), options(&state)).await?;
    Ok(Json(results))
}

#[utoipa::path(
    post,
    path = "/upload/text",
    tag = "uploads",
    summary = "Upload text",
    request_body(content_type = "text/plain", description = "Text to upload"),
    responses(
        (status = 200, description = "Per-node report", body = AggregateResult),
        (status = 400, description = "Empty body", body = ErrorBody),
        (status = 503, description = "Shutting down", body = ErrorBody)
    )
)]
#[tracing::instrument(skip_all)]
pub async fn upload_text(State(state): State<AppState>, body: String) -> Result<Json<AggregateResult>> {
    if body.is_empty() {
        return Err(bad_request("Text content is required"));
    }
    Ok(Json(add_one(&state, ContentInput::Text(body)).await?))
}

#[utoipa::path(
    post,
    path = "/upload/json",
    tag = "uploads",
    summary = "Upload a JSON document",
    request_body(content_type = "application/json", description = "Any JSON object or array"),
    responses(
        (status = 200, description = "Per-node report", body = AggregateResult),
        (status = 400, description = "Body is not a JSON object or array", body = ErrorBody),
        (status = 503, description = "Shutting down", body = ErrorBody)
    )
)]
#[tracing::instrument(skip_all)]
pub async fn upload_json(
    State(state): State<AppState>,
    body: std::result::Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<Json<AggregateResult>> {
    let value = match body {
        Ok(Json(value)) if value.is_object() || value.is_array() => value,
        _ => return Err(bad_request("JSON content is required")),
    };
    Ok(Json(add_one(&state, ContentInput::Json(value)).await?))
}

#[utoipa::path(
    post,
    path = "/upload/tree",
    tag = "uploads",
    summary = "Upload a directory tree",
    description = "Adds every entry as one directory tree; the reported CID is the tree root.",
    request_body = TreeUploadRequest,
    responses(
        (status = 200, description = "Per-node report for the whole tree", body = AggregateResult),
        (status = 400, description = "Invalid or duplicate path", body = ErrorBody),
        (status = 503, description = "Shutting down", body = ErrorBody)
    )
)]
#[tracing::instrument(skip_all)]
pub async fn upload_tree(
    State(state): State<AppState>,
    body: std::result::Result<Json<TreeUploadRequest>, JsonRejection>,
) -> Result<Json<AggregateResult>> {
    let Json(request) = body.map_err(|e| bad_request(e.body_text()))?;

    tracing::debug!(entries = request.entries.len(), "Uploading tree");
    let entries = request.entries.into_iter().map(Into::into).collect();
    Ok(Json(add_one(&state, ContentInput::Tree(entries)).await?))
}

#[cfg(test)]
mod tests {
    use crate::backends::BackendError;
    use crate::test_utils::{MockBackend, create_test_app};
    use axum::http::StatusCode;
    use axum_test::multipart::{MultipartForm, Part};
    use serde_json::{Value, json};

    #[test_log::test(tokio::test)]
    async fn test_upload_text() {
        let (server, _) = create_test_app(vec![
            ("node-a", MockBackend::returning("bafy-text")),
            ("node-b", MockBackend::returning("bafy-text")),
        ]);

        let response = server.post("/upload/text").text("Hello, IPFS!").await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["cid"], "bafy-text");
        assert_eq!(body["success"], true);
        assert_eq!(body["totalNodes"], 2);
        assert_eq!(body["successCount"], 2);
        assert_eq!(body["errorCount"], 0);
        assert_eq!(body["outcomes"][0]["backend"], "node-a");
    }

    #[test_log::test(tokio::test)]
    async fn test_total_failure_is_still_a_report() {
        let (server, _) = create_test_app(vec![
            ("node-a", MockBackend::failing(BackendError::ConnectionRefused("refused".into()))),
            ("node-b", MockBackend::failing(BackendError::ConnectionRefused("refused".into()))),
        ]);

        let response = server.post("/upload/text").text("Hello").await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["cid"], Value::Null);
        assert_eq!(body["success"], false);
        assert_eq!(body["errorCount"], 2);
        assert_eq!(body["outcomes"][1]["kind"], "connection_refused");
    }

    #[test_log::test(tokio::test)]
    async fn test_upload_file() {
        let backend = MockBackend::echoing_name();
        let (server, _) = create_test_app(vec![("node-a", backend.clone())]);

        let form = MultipartForm::new().add_part(
            "file",
            Part::bytes(b"hello".to_vec()).file_name("hello.txt").mime_type("text/plain"),
        );
        let response = server.post("/upload/file").multipart(form).await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["cid"], "cid-hello.txt");
        assert_eq!(backend.add_calls(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_upload_file_requires_file() {
        let backend = MockBackend::returning("bafy");
        let (server, _) = create_test_app(vec![("node-a", backend.clone())]);

        let form = MultipartForm::new().add_text("other", "value");
        let response = server.post("/upload/file").multipart(form).await;

        response.assert_status(StatusCode::BAD_REQUEST);
        response.assert_json(&json!({"error": "File is required"}));
        assert_eq!(backend.calls(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_upload_files_one_report_each() {
        let (server, _) = create_test_app(vec![("node-a", MockBackend::echoing_name())]);

        let form = MultipartForm::new()
            .add_part("files", Part::bytes(b"1".to_vec()).file_name("one.txt"))
            .add_part("files", Part::bytes(b"2".to_vec()).file_name("two.txt"));
        let response = server.post("/upload/files").multipart(form).await;

        response.assert_status_ok();
        let body: Vec<Value> = response.json();
        assert_eq!(body.len(), 2);
        assert_eq!(body[0]["cid"], "cid-one.txt");
        assert_eq!(body[1]["cid"], "cid-two.txt");
    }

    #[test_log::test(tokio::test)]
    async fn test_upload_files_requires_files() {
        let (server, _) = create_test_app(vec![("node-a", MockBackend::returning("bafy"))]);

        let form = MultipartForm::new().add_text("file", "not the right field");
        let response = server.post("/upload/files").multipart(form).await;

        response.assert_status(StatusCode::BAD_REQUEST);
        response.assert_json(&json!({"error": "Files are required"}));
    }

    #[test_log::test(tokio::test)]
    async fn test_upload_json() {
        let (server, _) = create_test_app(vec![("node-a", MockBackend::returning("bafy-json"))]);

        let response = server.post("/upload/json").json(&json!({"message": "Hello from JSON!"})).await;
        response.assert_status_ok();
        assert_eq!(response.json::<Value>()["cid"], "bafy-json");

        let response = server.post("/upload/json").json(&json!("just a string")).await;
        response.assert_status(StatusCode::BAD_REQUEST);
        response.assert_json(&json!({"error": "JSON content is required"}));
    }

    #[test_log::test(tokio::test)]
    async fn test_upload_tree() {
        let backend = MockBackend::returning("unused").with_tree_root("bafy-root");
        let (server, _) = create_test_app(vec![("node-a", backend.clone())]);

        let response = server
            .post("/upload/tree")
            .json(&json!({
                "entries": [
                    {"path": "folder1/hello.txt", "content": "Hello from file 1!"},
                    {"path": "folder1/nested/world.txt", "content": "Hello from file 2!"},
                    {"path": "test.txt", "content": "Hello from the root"}
                ]
            }))
            .await;

        response.assert_status_ok();
        assert_eq!(response.json::<Value>()["cid"], "bafy-root");
        assert_eq!(backend.tree_calls(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_upload_tree_rejects_traversal_without_io() {
        let backend = MockBackend::returning("unused").with_tree_root("bafy-root");
        let (server, _) = create_test_app(vec![("node-a", backend.clone())]);

        let response = server
            .post("/upload/tree")
            .json(&json!({"entries": [{"path": "../secret", "content": "x"}]}))
            .await;

        response.assert_status(StatusCode::BAD_REQUEST);
        assert!(response.json::<Value>()["error"].as_str().unwrap().contains("../secret"));
        assert_eq!(backend.calls(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_uploads_rejected_after_shutdown() {
        let backend = MockBackend::returning("bafy");
        let (server, lifecycle) = create_test_app(vec![("node-a", backend.clone())]);

        lifecycle.shutdown().await;
        let response = server.post("/upload/text").text("late").await;

        response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
        response.assert_json(&json!({"error": "Service is shutting down"}));
        assert_eq!(backend.calls(), 0);
    }
}
