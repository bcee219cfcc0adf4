//! Reconciliation engine
//!
//! [`Reconciler`] owns the configuration, the registry client and the batch
//! executor, and answers reconciliation requests end to end:
//!
//! ```text
//! ReconcileRequest ─┬─ query   ─> translate ─> search ─> parse ─> {"result": [...]}
//!                   ├─ queries ─> dispatch (per key: same pipeline) ─> {key: {"result": [...]}}
//!                   └─ neither ─> service metadata
//! ```
//!
//! In proxy mode the same pipeline answers with the named source's own
//! record ids instead of VIAF ids.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;

use crate::client::{RegistryClient, ViafClient};
use crate::config::ReconcileConfig;
use crate::dispatch::{self, Executor, Job};
use crate::error::{ReconcileError, Result};
use crate::parser::{self, Match};
use crate::query::{self, Query};
use crate::response::{self, BatchResult, QueryResult, ServiceMetadata};
use crate::types;

/// Transport-independent request parameters.
///
/// Empty strings count as absent, matching how form posts send blank fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ReconcileRequest {
    /// Plain text or a JSON query object
    #[serde(default)]
    pub query: Option<String>,
    /// JSON object of key -> query object
    #[serde(default)]
    pub queries: Option<String>,
    /// JSONP callback name
    #[serde(default)]
    pub callback: Option<String>,
    /// Cataloging source to reconcile against; set by the binding from the route
    #[serde(skip)]
    pub source: Option<String>,
    /// Report `source`'s record ids rather than VIAF ids
    #[serde(skip)]
    pub proxy: bool,
}

impl ReconcileRequest {
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_proxy_source(self, source: impl Into<String>) -> Self {
        Self {
            proxy: true,
            ..self.with_source(source)
        }
    }

    /// Only the empty string is absent; whitespace is a value and gets
    /// validated like one.
    fn param(value: &Option<String>) -> Option<&str> {
        value.as_deref().filter(|v| !v.is_empty())
    }

    /// Source code, trimmed and uppercased.
    pub fn normalized_source(&self) -> Option<String> {
        Self::param(&self.source)
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
    }
}

#[derive(Clone)]
pub struct Reconciler {
    config: Arc<ReconcileConfig>,
    client: Arc<dyn RegistryClient>,
    executor: Arc<dyn Executor>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .field("executor", &self.executor.name())
            .finish()
    }
}

impl Reconciler {
    /// Engine talking to the registry configured in `config`.
    pub fn new(config: ReconcileConfig) -> Result<Self> {
        let config = config.normalized();
        config.validate()?;
        let client = ViafClient::from_config(&config)?;
        Self::with_client(config, Arc::new(client))
    }

    /// Engine with a caller-supplied registry client.
    pub fn with_client(config: ReconcileConfig, client: Arc<dyn RegistryClient>) -> Result<Self> {
        let config = config.normalized();
        config.validate()?;
        let executor = dispatch::executor_for(&config)?;

        tracing::info!(
            service = %config.service_name,
            executor = executor.name(),
            preferred_sources = ?config.preferred_sources,
            "Reconciler initialized"
        );

        Ok(Self {
            config: Arc::new(config),
            client,
            executor,
        })
    }

    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Run one query against the registry.
    ///
    /// A failed registry call is logged and yields no matches. An unknown
    /// query type, or a record of an unknown type in an untyped search, is an
    /// error.
    pub async fn search(&self, query: &Query, source: Option<&str>) -> Result<Vec<Match>> {
        self.run_search(query, source, false).await
    }

    /// Run one query restricted to `source`, identifying matches by that
    /// source's record ids.
    pub async fn search_proxy(&self, query: &Query, source: &str) -> Result<Vec<Match>> {
        self.run_search(query, Some(source), true).await
    }

    async fn run_search(
        &self,
        query: &Query,
        source: Option<&str>,
        proxy: bool,
    ) -> Result<Vec<Match>> {
        query.validate()?;

        let query_type = query
            .name_type
            .as_deref()
            .map(types::lookup_by_id)
            .transpose()?;
        let encoded = query.translate(source)?;
        let limit = query.limit();

        tracing::debug!(query = %query.text, cql = %encoded, limit, "Translated query");

        let xml = match self.client.search(&encoded, limit).await {
            Ok(xml) => xml,
            Err(e) => {
                tracing::error!(query = %query.text, error = %e, "Registry search failed");
                return Ok(Vec::new());
            }
        };

        let mut matches = match source {
            Some(source) if proxy => {
                parser::parse_proxy_response(&xml, query_type, &query.text, source)?
            }
            Some(source) => {
                parser::parse_response(&xml, query_type, &query.text, &[source.to_string()])?
            }
            None => parser::parse_response(
                &xml,
                query_type,
                &query.text,
                &self.config.preferred_sources,
            )?,
        };
        matches.truncate(limit as usize);
        Ok(matches)
    }

    /// Run every query in a batch through [`search`](Self::search) on the
    /// configured executor.
    pub async fn search_batch(
        &self,
        queries: BTreeMap<String, Query>,
        source: Option<&str>,
    ) -> BatchResult {
        self.run_batch(queries, source, false).await
    }

    /// Batch counterpart of [`search_proxy`](Self::search_proxy).
    pub async fn search_proxy_batch(
        &self,
        queries: BTreeMap<String, Query>,
        source: &str,
    ) -> BatchResult {
        self.run_batch(queries, Some(source), true).await
    }

    async fn run_batch(
        &self,
        queries: BTreeMap<String, Query>,
        source: Option<&str>,
        proxy: bool,
    ) -> BatchResult {
        let engine = self.clone();
        let source = source.map(str::to_string);

        dispatch::dispatch(self.executor.as_ref(), queries, move |query| -> Job {
            let engine = engine.clone();
            let source = source.clone();
            Box::pin(async move { engine.run_search(&query, source.as_deref(), proxy).await })
        })
        .await
    }

    /// Service metadata, optionally for one source.
    pub fn metadata(&self, source: Option<&str>) -> ServiceMetadata {
        ServiceMetadata::new(&self.config, source)
    }

    /// Proxy-mode service metadata for `source`.
    pub fn proxy_metadata(&self, source: &str) -> ServiceMetadata {
        ServiceMetadata::proxy(&self.config, source)
    }

    /// Answer a request with JSON (or JSONP) text.
    ///
    /// A single `query` takes precedence over `queries`. Requests with
    /// neither get the service metadata. A proxy request without a source
    /// is an invalid query.
    pub async fn reconcile(&self, request: &ReconcileRequest) -> Result<String> {
        let callback = ReconcileRequest::param(&request.callback);
        response::validate_callback(callback)?;

        let source = request.normalized_source();
        let source = source.as_deref();
        let proxy = request.proxy;
        if proxy && source.is_none() {
            return Err(ReconcileError::InvalidQuery(
                "proxy mode needs a source".to_string(),
            ));
        }
        let start = Instant::now();

        if let Some(raw) = ReconcileRequest::param(&request.query) {
            let query = Query::parse_single(raw)?;
            let matches = self.run_search(&query, source, proxy).await?;
            log_timing(1, start);
            response::to_json(&QueryResult::new(matches), callback)
        } else if let Some(raw) = ReconcileRequest::param(&request.queries) {
            let queries = query::parse_batch(raw)?;
            let count = queries.len();
            let batch = self.run_batch(queries, source, proxy).await;
            log_timing(count, start);
            response::to_json(&batch, callback)
        } else {
            match source {
                Some(source) if proxy => response::to_json(&self.proxy_metadata(source), callback),
                _ => response::to_json(&self.metadata(source), callback),
            }
        }
    }
}

fn log_timing(count: usize, start: Instant) {
    let elapsed = start.elapsed().as_secs_f64();
    tracing::info!(
        queries = count,
        elapsed_secs = elapsed,
        "{} queries took {:.3}s",
        count,
        elapsed
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::error::RegistryError;

    const TWO_PEOPLE: &str = r#"<searchRetrieveResponse><records>
<record><recordData><ns2:VIAFCluster xmlns:ns2="http://viaf.org/viaf/terms#">
  <ns2:viafID>86064294</ns2:viafID><ns2:nameType>Personal</ns2:nameType>
  <ns2:sources><ns2:source nsid="n2008032484">LC|n  2008032484</ns2:source></ns2:sources>
  <ns2:mainHeadings>
    <ns2:data><ns2:text>Silver, Nate</ns2:text>
      <ns2:sources><ns2:s>LC</ns2:s><ns2:sid>LC|n  2008032484</ns2:sid></ns2:sources></ns2:data>
    <ns2:data><ns2:text>Nate Silver</ns2:text><ns2:sources><ns2:s>NDL</ns2:s></ns2:sources></ns2:data>
  </ns2:mainHeadings>
</ns2:VIAFCluster></recordData></record>
<record><recordData><ns3:VIAFCluster xmlns:ns3="http://viaf.org/viaf/terms#">
  <ns3:viafID>7153142</ns3:viafID><ns3:nameType>Personal</ns3:nameType>
  <ns3:mainHeadings>
    <ns3:data><ns3:text>Silver, Nathan</ns3:text>
      <ns3:sources><ns3:s>LC</ns3:s><ns3:sid>LC|no 2011000001</ns3:sid></ns3:sources></ns3:data>
  </ns3:mainHeadings>
</ns3:VIAFCluster></recordData></record>
</records></searchRetrieveResponse>"#;

    const WEIRD_TYPE: &str = r#"<searchRetrieveResponse><records>
<record><recordData><VIAFCluster><viafID>1</viafID><nameType>Meeting</nameType></VIAFCluster></recordData></record>
</records></searchRetrieveResponse>"#;

    /// Serves canned XML; queries containing "broken" fail, "weird" yields an
    /// unknown record type.
    #[derive(Default)]
    struct CannedRegistry {
        calls: Mutex<Vec<(String, u32)>>,
    }

    #[async_trait]
    impl RegistryClient for CannedRegistry {
        async fn search(&self, query: &str, limit: u32) -> Result<String, RegistryError> {
            self.calls
                .lock()
                .unwrap()
                .push((query.to_string(), limit));
            if query.contains("broken") {
                Err(RegistryError::Status {
                    status: 500,
                    body: "oops".into(),
                })
            } else if query.contains("weird") {
                Ok(WEIRD_TYPE.to_string())
            } else {
                Ok(TWO_PEOPLE.to_string())
            }
        }
    }

    fn engine_with(config: ReconcileConfig) -> (Reconciler, Arc<CannedRegistry>) {
        let registry = Arc::new(CannedRegistry::default());
        let engine = Reconciler::with_client(config, registry.clone()).unwrap();
        (engine, registry)
    }

    fn engine() -> (Reconciler, Arc<CannedRegistry>) {
        engine_with(ReconcileConfig::default())
    }

    #[tokio::test]
    async fn test_search_uses_preferred_sources() {
        let (engine, registry) = engine();
        let matches = engine.search(&Query::new("Nate Silver"), None).await.unwrap();

        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].name, "Silver, Nate");
        assert!(!matches[0].exact);

        let calls = registry.calls.lock().unwrap();
        assert_eq!(calls[0].0, "local.mainHeadingEl+all+%22Nate+Silver%22");
        assert_eq!(calls[0].1, 3);
    }

    #[tokio::test]
    async fn test_search_truncates_to_limit() {
        let (engine, registry) = engine();
        let matches = engine
            .search(&Query::new("Nate Silver").with_limit(1), None)
            .await
            .unwrap();

        assert_eq!(matches.len(), 1);
        assert_eq!(registry.calls.lock().unwrap()[0].1, 1);
    }

    #[tokio::test]
    async fn test_source_specific_search() {
        let (engine, registry) = engine();
        let matches = engine
            .search(&Query::new("Nate Silver"), Some("NDL"))
            .await
            .unwrap();

        assert_eq!(matches[0].name, "Nate Silver");
        assert!(matches[0].exact);
        // no NDL heading, falls back to the first source present
        assert_eq!(matches[1].name, "Silver, Nathan");
        assert!(registry.calls.lock().unwrap()[0]
            .0
            .ends_with("+and+local.sources+%3D+%22ndl%22"));
    }

    #[tokio::test]
    async fn test_registry_failure_yields_no_matches() {
        let (engine, _) = engine();
        let matches = engine.search(&Query::new("broken"), None).await.unwrap();
        assert!(matches.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_query_type_is_error() {
        let (engine, registry) = engine();
        let err = engine
            .search(&Query::new("x").with_type("/music/artist"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::UnknownType(_)));
        assert!(registry.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_contains_every_key() {
        for threading_enabled in [false, true] {
            let (engine, _) = engine_with(ReconcileConfig {
                threading_enabled,
                ..ReconcileConfig::default()
            });
            let queries = query::parse_batch(
                r#"{"q0": {"query": "Nate Silver"},
                    "q1": {"query": "broken"},
                    "q2": {"query": "weird"},
                    "q3": {"query": "x", "type": "/music/artist"}}"#,
            )
            .unwrap();

            let batch = engine.search_batch(queries, None).await;

            assert_eq!(
                batch.keys().collect::<Vec<_>>(),
                vec!["q0", "q1", "q2", "q3"]
            );
            assert_eq!(batch["q0"].result.len(), 2);
            assert!(batch["q1"].result.is_empty());
            assert!(batch["q2"].result.is_empty());
            assert!(batch["q3"].result.is_empty());
        }
    }

    #[tokio::test]
    async fn test_reconcile_single_plain_and_json() {
        let (engine, _) = engine();

        let plain = engine
            .reconcile(&ReconcileRequest {
                query: Some("Nate Silver".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let json = engine
            .reconcile(&ReconcileRequest {
                query: Some(r#"{"query": "Nate Silver"}"#.into()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(plain, json);
        let value: serde_json::Value = serde_json::from_str(&plain).unwrap();
        assert_eq!(value["result"][0]["id"], "86064294");
        assert_eq!(value["result"][0]["score"], 1);
    }

    #[tokio::test]
    async fn test_reconcile_single_is_idempotent() {
        let (engine, _) = engine();
        let request = ReconcileRequest {
            query: Some("Nate Silver".into()),
            ..Default::default()
        };
        let first = engine.reconcile(&request).await.unwrap();
        let second = engine.reconcile(&request).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_reconcile_prefers_query_over_queries() {
        let (engine, _) = engine();
        let body = engine
            .reconcile(&ReconcileRequest {
                query: Some("Nate Silver".into()),
                queries: Some(r#"{"q0": {"query": "Nate Silver"}}"#.into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(body.starts_with(r#"{"result":"#));
    }

    #[tokio::test]
    async fn test_reconcile_metadata_and_blank_params() {
        let (engine, registry) = engine();
        let body = engine
            .reconcile(&ReconcileRequest {
                query: Some("".into()),
                queries: Some("".into()),
                callback: Some("cb".into()),
                source: Some(" ndl ".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(body.starts_with("cb({"));
        assert!(body.contains(r#""name":"VIAF Reconciliation Service - NDL""#));
        assert!(registry.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_whitespace_query_is_invalid() {
        let (engine, registry) = engine();

        let err = engine
            .reconcile(&ReconcileRequest {
                query: Some("   ".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidQuery(_)));
        assert!(err.is_client_error());

        let err = engine
            .reconcile(&ReconcileRequest {
                queries: Some("  ".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidBatch(_)));

        assert!(registry.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lowercase_configured_source_still_selects_name() {
        let (engine, _) = engine_with(ReconcileConfig {
            preferred_sources: vec!["ndl".into()],
            ..ReconcileConfig::default()
        });
        assert_eq!(engine.config().preferred_sources, vec!["NDL"]);

        let matches = engine.search(&Query::new("Nate Silver"), None).await.unwrap();
        assert_eq!(matches[0].name, "Nate Silver");
        assert!(matches[0].exact);
    }

    #[tokio::test]
    async fn test_reconcile_rejects_bad_input_before_searching() {
        let (engine, registry) = engine();

        let err = engine
            .reconcile(&ReconcileRequest {
                queries: Some("{not json".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidBatch(_)));

        let err = engine
            .reconcile(&ReconcileRequest {
                query: Some("Nate Silver".into()),
                callback: Some("alert(1)".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidCallback(_)));

        assert!(registry.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_proxy_reconcile_reports_source_ids() {
        let (engine, registry) = engine();
        let request = ReconcileRequest {
            query: Some("Silver, Nate".into()),
            ..Default::default()
        }
        .with_proxy_source("lc");

        let body = engine.reconcile(&request).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["result"][0]["id"], "n2008032484");
        assert_eq!(value["result"][0]["name"], "Silver, Nate");
        assert_eq!(value["result"][0]["match"], true);
        // no cluster-level entry: the heading's sid, spaces removed
        assert_eq!(value["result"][1]["id"], "no2011000001");
        assert!(registry.calls.lock().unwrap()[0]
            .0
            .ends_with("+and+local.sources+%3D+%22lc%22"));

        let batch = engine
            .search_proxy_batch(
                query::parse_batch(r#"{"q0": {"query": "Silver, Nathan"}}"#).unwrap(),
                "LC",
            )
            .await;
        assert_eq!(batch["q0"].result[1].id, "no2011000001");
        assert!(batch["q0"].result[1].exact);
    }

    #[tokio::test]
    async fn test_proxy_metadata_and_missing_source() {
        let (engine, registry) = engine();

        let body = engine
            .reconcile(&ReconcileRequest::default().with_proxy_source("LC"))
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["name"], "VIAF Reconciliation Service - LC (by way of VIAF)");
        assert_eq!(value["view"]["url"], "http://id.loc.gov/authorities/names/{{id}}");

        let err = engine
            .reconcile(&ReconcileRequest::default().with_proxy_source(" "))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidQuery(_)));
        assert!(registry.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_single_unknown_record_type_surfaces() {
        let (engine, _) = engine();
        let err = engine
            .reconcile(&ReconcileRequest {
                query: Some("weird".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::UnknownRegistryCode(code) if code == "Meeting"));
        assert!(!ReconcileError::UnknownRegistryCode("Meeting".into()).is_client_error());
    }
}
