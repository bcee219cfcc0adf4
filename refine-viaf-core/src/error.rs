//! Error types for the reconciliation engine.
//!
//! `RegistryError` covers the remote registry call and is always recovered
//! inside the engine (the affected query yields no matches). `ReconcileError`
//! is what callers of the engine see.

/// Failure talking to the remote authority registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),

    #[error("Registry returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Registry request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Errors surfaced by the reconciliation engine.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// A query named a type id that is not in the type registry.
    #[error("Unknown name type id: {0}")]
    UnknownType(String),

    /// A registry record carried a type code that is not in the type registry.
    #[error("Unknown registry name type code: {0}")]
    UnknownRegistryCode(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid JSONP callback name: {0}")]
    InvalidCallback(String),

    #[error("Invalid queries batch: {0}")]
    InvalidBatch(#[source] serde_json::Error),

    #[error("Batch entry '{key}' failed: {reason}")]
    WorkerFailed { key: String, reason: String },

    #[error("Failed to serialize response: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ReconcileError {
    /// True when the failure was caused by the request itself rather than by
    /// the service. HTTP bindings map these to 400.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownType(_)
                | Self::InvalidQuery(_)
                | Self::InvalidCallback(_)
                | Self::InvalidBatch(_)
        )
    }
}

pub type Result<T, E = ReconcileError> = std::result::Result<T, E>;
