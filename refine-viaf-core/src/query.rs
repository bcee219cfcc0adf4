//! Reconciliation queries and their translation into registry CQL.
//!
//! Clients send either a bare string or a JSON object such as
//!
//! ```text
//! {"query": "Geoffrey Chaucer", "type": "/people/person", "type_strict": "should"}
//! ```
//!
//! The untyped form is what OpenRefine sends when it samples a column to guess
//! its type, or when the user reconciles "against no particular type".

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ReconcileError, Result};
use crate::types;

/// Number of candidates requested when the query does not say. OpenRefine
/// displays at most three.
pub const DEFAULT_LIMIT: u32 = 3;

/// CQL clause used when the query has no type.
const UNTYPED_TEMPLATE: &str = "local.mainHeadingEl all \"%s\"";

/// A single reconciliation query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    /// Free-text name to reconcile
    #[serde(rename = "query")]
    pub text: String,
    /// Optional name type id (see [`types::default_types`])
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub name_type: Option<String>,
    /// Maximum number of candidates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    /// Client hint on how strictly to apply the type; accepted but not enforced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_strict: Option<String>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            name_type: None,
            limit: None,
            type_strict: None,
        }
    }

    pub fn with_type(mut self, name_type: impl Into<String>) -> Self {
        self.name_type = Some(name_type.into());
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Effective candidate limit.
    pub fn limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_LIMIT)
    }

    /// Check the fields a query must carry before it is sent anywhere.
    pub fn validate(&self) -> Result<()> {
        if self.text.trim().is_empty() {
            return Err(ReconcileError::InvalidQuery(
                "query text must not be blank".to_string(),
            ));
        }
        if self.limit == Some(0) {
            return Err(ReconcileError::InvalidQuery(
                "limit must be a positive integer".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse the `query` request parameter: a JSON object when it starts with
    /// `{`, otherwise the plain query text.
    pub fn parse_single(raw: &str) -> Result<Self> {
        let query = if raw.trim_start().starts_with('{') {
            serde_json::from_str::<Query>(raw)
                .map_err(|e| ReconcileError::InvalidQuery(e.to_string()))?
        } else {
            Query::new(raw)
        };
        query.validate()?;
        Ok(query)
    }

    /// Build the form-url-encoded CQL for this query, ready to be placed in
    /// the registry request URL.
    ///
    /// `source` restricts results to clusters that include a record from
    /// that cataloging source.
    pub fn translate(&self, source: Option<&str>) -> Result<String> {
        let cql = self.to_cql(source)?;
        Ok(url::form_urlencoded::byte_serialize(cql.as_bytes()).collect())
    }

    /// The unencoded CQL for this query.
    pub fn to_cql(&self, source: Option<&str>) -> Result<String> {
        let mut cql = match self.name_type.as_deref() {
            Some(id) => types::lookup_by_id(id)?.render(&self.text),
            None => UNTYPED_TEMPLATE.replacen(types::TEMPLATE_SLOT, &self.text, 1),
        };

        // matches clusters that have an entry from this source; it does not
        // limit the search to that source's spelling of the name
        if let Some(source) = source {
            cql.push_str(&format!(
                " and local.sources = \"{}\"",
                source.to_lowercase()
            ));
        }

        Ok(cql)
    }
}

/// Parse the `queries` request parameter into key -> query.
///
/// Fails as a whole if the container is not valid JSON or any entry is
/// malformed; nothing is dispatched for a batch that does not parse.
pub fn parse_batch(raw: &str) -> Result<BTreeMap<String, Query>> {
    let queries: BTreeMap<String, Query> =
        serde_json::from_str(raw).map_err(ReconcileError::InvalidBatch)?;

    for (key, query) in &queries {
        query.validate().map_err(|e| match e {
            ReconcileError::InvalidQuery(reason) => {
                ReconcileError::InvalidQuery(format!("{}: {}", key, reason))
            }
            other => other,
        })?;
    }

    Ok(queries)
}
