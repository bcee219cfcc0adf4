//! Router construction for the reconciliation server.

use axum::routing::get;
use axum::Router;
use refine_viaf_core::Reconciler;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers;

/// Build the full axum router with all routes and middleware.
pub fn build_router(engine: Reconciler) -> Router {
    Router::new()
        .route(
            "/reconcile",
            get(handlers::reconcile).post(handlers::reconcile),
        )
        .route(
            "/reconcile/:source",
            get(handlers::reconcile_source).post(handlers::reconcile_source),
        )
        .route(
            "/reconcile/viafproxy/:source",
            get(handlers::reconcile_proxy).post(handlers::reconcile_proxy),
        )
        .route("/health", get(handlers::health))
        // reconciliation clients call from the browser, cross-origin
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(engine)
}
