//! Request handlers.
//!
//! `Form` reads the query string on GET and the urlencoded body on POST, so
//! one handler serves both methods.

use axum::extract::{Path, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::{Form, Json};
use refine_viaf_core::{ReconcileRequest, Reconciler};

use crate::error::AppError;

/// GET|POST /reconcile
pub async fn reconcile(
    State(engine): State<Reconciler>,
    Form(request): Form<ReconcileRequest>,
) -> Result<impl IntoResponse, AppError> {
    respond(&engine, request).await
}

/// GET|POST /reconcile/:source
pub async fn reconcile_source(
    State(engine): State<Reconciler>,
    Path(source): Path<String>,
    Form(request): Form<ReconcileRequest>,
) -> Result<impl IntoResponse, AppError> {
    respond(&engine, request.with_source(source)).await
}

/// GET|POST /reconcile/viafproxy/:source
pub async fn reconcile_proxy(
    State(engine): State<Reconciler>,
    Path(source): Path<String>,
    Form(request): Form<ReconcileRequest>,
) -> Result<impl IntoResponse, AppError> {
    respond(&engine, request.with_proxy_source(source)).await
}

/// GET /health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn respond(
    engine: &Reconciler,
    request: ReconcileRequest,
) -> Result<impl IntoResponse, AppError> {
    match engine.reconcile(&request).await {
        Ok(body) => Ok(([(header::CONTENT_TYPE, "application/json")], body)),
        Err(e) => Err(AppError::new(e, request.callback)),
    }
}
