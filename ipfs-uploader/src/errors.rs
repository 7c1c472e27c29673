use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error as ThisError;
use utoipa::ToSchema;

/// Errors that abort an upload call before any backend is contacted.
///
/// Per-backend failures never show up here: they are recorded on the
/// [`BackendOutcome`](crate::fanout::BackendOutcome) of the attempt instead.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    /// A directory-tree path was absolute, escaped its root, or was otherwise malformed
    #[error("Invalid content path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    /// The same path appeared twice in one submission (after normalization)
    #[error("Duplicate content path {path:?}")]
    DuplicateContentPath { path: String },

    /// The submission had nothing to upload
    #[error("Nothing to upload")]
    EmptySubmission,

    /// The content could not be turned into bytes
    #[error("Invalid content: {message}")]
    InvalidContent { message: String },

    #[error("No backends configured")]
    NoBackendsConfigured,

    #[error("Backend name {name:?} is configured more than once")]
    DuplicateBackendName { name: String },

    /// A backend setting is outside the range the registry can honor
    #[error("Backend {name:?}: {reason}")]
    InvalidBackendSetting { name: String, reason: String },

    /// The lifecycle manager has begun (or finished) shutting down
    #[error("Service is shutting down")]
    ServiceShuttingDown,

    /// The lifecycle manager has not been initialized yet
    #[error("Service is not ready")]
    ServiceNotReady,

    #[error("Service is already initialized")]
    AlreadyInitialized,
}

impl UploadError {
    /// Input errors are the caller's fault and never reach a backend.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            UploadError::InvalidPath { .. }
                | UploadError::DuplicateContentPath { .. }
                | UploadError::EmptySubmission
                | UploadError::InvalidContent { .. }
        )
    }
}

/// Transport-facing error for the HTTP layer.
#[derive(ThisError, Debug)]
pub enum Error {
    /// Invalid request data
    #[error("{message}")]
    BadRequest { message: String },

    #[error(transparent)]
    Upload(#[from] UploadError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// JSON body returned for every error response.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::Upload(e) if e.is_input_error() => StatusCode::BAD_REQUEST,
            Error::Upload(UploadError::ServiceShuttingDown | UploadError::ServiceNotReady) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Upload(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::BadRequest { message } => message.clone(),
            Error::Upload(e) if e.is_input_error() => e.to_string(),
            Error::Upload(e @ (UploadError::ServiceShuttingDown | UploadError::ServiceNotReady)) => e.to_string(),
            Error::Upload(_) | Error::Other(_) => "Upload failed".to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::Other(_) => tracing::error!("Upload failed: {:#}", self),
            Error::Upload(e) if !e.is_input_error() => tracing::warn!("Upload rejected: {}", self),
            _ => tracing::debug!("Client error: {}", self),
        }

        let body = ErrorBody { error: self.user_message() };
        (self.status_code(), Json(body)).into_response()
    }
}

/// Type alias for handler results
pub type Result<T> = std::result::Result<T, Error>;
