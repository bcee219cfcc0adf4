//! OpenRefine reconciliation against the VIAF authority registry.
//!
//! Reconciliation clients send free-text names, optionally with a type hint;
//! the service searches VIAF, picks a display name for each candidate cluster
//! according to a preferred cataloging source, and reports whether the name
//! matched exactly.
//!
//! ```ignore
//! let engine = Reconciler::new(ReconcileConfig::from_env()?)?;
//! let body = engine
//!     .reconcile(&ReconcileRequest {
//!         query: Some("Nate Silver".into()),
//!         ..Default::default()
//!     })
//!     .await?;
//! ```
//!
//! The HTTP binding lives in `refine-viaf-server`; this crate has no
//! opinion on transport.

pub mod client;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod parser;
pub mod query;
pub mod response;
pub mod types;

pub use client::{RegistryClient, ViafClient};
pub use config::ReconcileConfig;
pub use dispatch::{BoundedExecutor, Executor, SequentialExecutor};
pub use engine::{ReconcileRequest, Reconciler};
pub use error::{ReconcileError, RegistryError, Result};
pub use parser::Match;
pub use query::Query;
pub use response::{BatchResult, QueryResult, ServiceMetadata};
pub use types::{NameType, TypeRef};
