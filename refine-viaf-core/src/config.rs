//! Service configuration
//!
//! An explicit value handed to the engine at construction. Every field has a
//! default; YAML files and `REFINE_VIAF_*` variables only need to name what
//! they change.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ReconcileError, Result};

pub const DEFAULT_SERVICE_NAME: &str = "VIAF Reconciliation Service";
pub const DEFAULT_SEARCH_URL: &str = "http://www.viaf.org/viaf/search";
pub const DEFAULT_VIEW_URL: &str = "http://viaf.org/viaf/{{id}}";

/// The registry refuses more than ~6 simultaneous requests; 3 leaves
/// headroom for other clients.
pub const DEFAULT_THREADPOOL_SIZE: usize = 3;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Prefix for environment variable overrides.
const ENV_PREFIX: &str = "REFINE_VIAF_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Display name advertised in service metadata
    pub service_name: String,
    /// Cataloging sources whose spelling of a name wins, in priority order
    pub preferred_sources: Vec<String>,
    /// Run batch entries concurrently
    pub threading_enabled: bool,
    /// Maximum batch entries in flight when threading is enabled
    pub threadpool_size: usize,
    /// Registry SRU search endpoint
    pub search_url: String,
    /// Entity view URL template advertised to clients
    pub view_url: String,
    /// Per-request deadline for registry calls
    pub request_timeout_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            preferred_sources: vec!["LC".to_string()],
            threading_enabled: false,
            threadpool_size: DEFAULT_THREADPOOL_SIZE,
            search_url: DEFAULT_SEARCH_URL.to_string(),
            view_url: DEFAULT_VIEW_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl ReconcileConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ReconcileError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Load configuration from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: ReconcileConfig =
            serde_yaml::from_str(content).map_err(|e| ReconcileError::Config(e.to_string()))?;
        let config = config.normalized();
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `REFINE_VIAF_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply `REFINE_VIAF_*` overrides supplied by `lookup` on top of `self`.
    ///
    /// Recognized names: `SERVICE_NAME`, `PREFERRED_SOURCES` (comma
    /// separated), `THREADING_ENABLED` (or `THREADING`), `THREADPOOL_SIZE`,
    /// `SEARCH_URL`, `VIEW_URL`, `REQUEST_TIMEOUT_SECS`.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = var("SERVICE_NAME") {
            self.service_name = v;
        }
        if let Some(v) = var("PREFERRED_SOURCES") {
            self.preferred_sources = v.split(',').map(str::to_string).collect();
        }
        if let Some(v) = var("THREADING_ENABLED").or_else(|| var("THREADING")) {
            self.threading_enabled = parse_bool(&v).ok_or_else(|| {
                ReconcileError::Config(format!(
                    "{ENV_PREFIX}THREADING_ENABLED: not a boolean: {v}"
                ))
            })?;
        }
        if let Some(v) = var("THREADPOOL_SIZE") {
            self.threadpool_size = v.trim().parse().map_err(|_| {
                ReconcileError::Config(format!("{ENV_PREFIX}THREADPOOL_SIZE: not a number: {v}"))
            })?;
        }
        if let Some(v) = var("SEARCH_URL") {
            self.search_url = v;
        }
        if let Some(v) = var("VIEW_URL") {
            self.view_url = v;
        }
        if let Some(v) = var("REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = v.trim().parse().map_err(|_| {
                ReconcileError::Config(format!(
                    "{ENV_PREFIX}REQUEST_TIMEOUT_SECS: not a number: {v}"
                ))
            })?;
        }

        let config = self.normalized();
        config.validate()?;
        Ok(config)
    }

    /// Source codes trimmed and uppercased to match the registry's codes;
    /// blank entries dropped.
    pub fn normalized(mut self) -> Self {
        self.preferred_sources = normalize_sources(&self.preferred_sources);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.threadpool_size == 0 {
            return Err(ReconcileError::Config(
                "threadpool_size must be at least 1".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(ReconcileError::Config(
                "request_timeout_secs must be at least 1".to_string(),
            ));
        }
        if normalize_sources(&self.preferred_sources).is_empty() {
            return Err(ReconcileError::Config(
                "preferred_sources must name at least one source".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn normalize_sources(sources: &[String]) -> Vec<String> {
    sources
        .iter()
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
