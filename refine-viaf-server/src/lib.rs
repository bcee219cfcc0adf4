//! HTTP binding for the VIAF reconciliation engine.

pub mod error;
pub mod handlers;
pub mod router;
