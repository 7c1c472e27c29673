//! HTTP transport for the uploader.
//!
//! - **[`handlers`]**: Axum route handlers
//! - **[`models`]**: Request/response bodies
//!
//! # Routes
//!
//! - `POST /upload/file`, `/upload/files`, `/upload/text`, `/upload/json`, `/upload/tree`
//! - `GET /ping`, `GET /backends`
//!
//! Every upload route answers with the [`AggregateResult`](crate::fanout::AggregateResult) report
//! (or an array of them for `/upload/files`), even when every node failed. Errors are
//! `{"error": "..."}` with 400 for bad input and 503 while the service is shutting down.

pub mod handlers;
pub mod models;
