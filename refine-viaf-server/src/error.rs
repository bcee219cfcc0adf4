//! Mapping of engine errors onto HTTP responses.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use refine_viaf_core::{response, ReconcileError};

/// An engine error plus the callback the request asked for, so the error body
/// can be JSONP-wrapped like a successful one.
#[derive(Debug)]
pub struct AppError {
    pub error: ReconcileError,
    pub callback: Option<String>,
}

impl AppError {
    pub fn new(error: ReconcileError, callback: Option<String>) -> Self {
        Self { error, callback }
    }

    pub fn status(&self) -> StatusCode {
        if self.error.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.error, "Reconcile request failed");
        } else {
            tracing::warn!(error = %self.error, "Rejected reconcile request");
        }

        let json = serde_json::json!({ "error": self.error.to_string() }).to_string();
        // a rejected callback name is never echoed back as code
        let callback = self
            .callback
            .as_deref()
            .filter(|cb| !cb.is_empty() && response::validate_callback(Some(*cb)).is_ok());
        let body = match callback {
            Some(cb) => format!("{}({})", cb, json),
            None => json,
        };

        (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
    }
}
