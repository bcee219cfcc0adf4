//! refine-viaf-server - OpenRefine reconciliation service backed by VIAF.
//!
//! Reads config from env vars (a `.env` file is honoured):
//!   REFINE_VIAF_CONFIG     - optional YAML config file
//!   REFINE_VIAF_BIND_ADDR  - listen address (default: 0.0.0.0:8080)
//!   REFINE_VIAF_*          - per-setting overrides, applied on top of the file

use anyhow::Context;
use refine_viaf_core::{ReconcileConfig, Reconciler};
use refine_viaf_server::router::build_router;
use tokio::net::TcpListener;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "info,refine_viaf_core=debug,refine_viaf_server=debug".into()
            }),
        )
        .init();

    let config = match std::env::var("REFINE_VIAF_CONFIG") {
        Ok(path) => {
            tracing::info!("Loading config from {}", path);
            ReconcileConfig::from_file(&path)?
        }
        Err(_) => ReconcileConfig::default(),
    }
    .with_overrides(|name| std::env::var(name).ok())?;

    let bind_addr =
        std::env::var("REFINE_VIAF_BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.into());

    let engine = Reconciler::new(config)?;
    let app = build_router(engine);

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;
    tracing::info!("refine-viaf-server listening on {bind_addr}");

    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}
