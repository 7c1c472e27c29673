//! HTTP request handlers.
//!
//! - [`uploads`]: content uploads fanned out to every configured node
//! - [`status`]: liveness and configured nodes
//!
//! Handlers return [`crate::errors::Error`], which converts to a status code and a
//! `{"error": "..."}` body.

pub mod status;
pub mod uploads;
