//! VIAF search client
//!
//! Thin HTTP client for the registry's SRU search endpoint. It reports
//! failures as [`RegistryError`]; deciding that a failed call means "no
//! matches" is the engine's job.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};

use crate::config::ReconcileConfig;
use crate::error::RegistryError;

/// Characters of an error body kept for logging.
const ERROR_BODY_MAX_CHARS: usize = 200;

/// Something that can run a registry search and hand back the raw XML.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Run a search. `query` must already be form-url-encoded CQL.
    async fn search(&self, query: &str, limit: u32) -> Result<String, RegistryError>;
}

/// HTTP client for the VIAF SRU API.
#[derive(Debug, Clone)]
pub struct ViafClient {
    http: Client,
    search_url: String,
}

impl ViafClient {
    pub fn new(search_url: impl Into<String>, timeout: Duration) -> Result<Self, RegistryError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(RegistryError::ClientBuild)?;

        Ok(Self {
            http,
            search_url: search_url.into(),
        })
    }

    pub fn from_config(config: &ReconcileConfig) -> Result<Self, RegistryError> {
        Self::new(config.search_url.clone(), config.request_timeout())
    }

    /// Full request URL for an encoded query.
    ///
    /// Sorting by holdings count puts the most widely held (and usually most
    /// relevant) clusters first.
    pub fn request_url(&self, query: &str, limit: u32) -> String {
        format!(
            "{}?query={}&sortKeys=holdingscount&maximumRecords={}&httpAccept=application/xml",
            self.search_url, query, limit
        )
    }
}

#[async_trait]
impl RegistryClient for ViafClient {
    async fn search(&self, query: &str, limit: u32) -> Result<String, RegistryError> {
        let url = self.request_url(query, limit);
        tracing::debug!(url = %url, "Requesting registry search");

        let response = self.http.get(&url).send().await?;

        let status = response.status();
        // SRU answers 200 with a body; anything else carries no records
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(RegistryError::Status {
                status: status.as_u16(),
                body: body.chars().take(ERROR_BODY_MAX_CHARS).collect(),
            });
        }

        Ok(response.text().await?)
    }
}
