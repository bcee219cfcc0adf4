//! Response envelopes and JSON/JSONP rendering.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::ReconcileConfig;
use crate::error::{ReconcileError, Result};
use crate::parser::Match;
use crate::types::{self, TypeRef};

pub const IDENTIFIER_SPACE: &str = "http://rdf.freebase.com/ns/user/hangy/viaf";
pub const SCHEMA_SPACE: &str = "http://rdf.freebase.com/ns/type.object.id";

/// Record view URL templates of the sources that publish one. Other
/// sources are viewed through VIAF's source-id redirect.
const SOURCE_VIEW_URLS: &[(&str, &str)] = &[
    (
        "BNE",
        "http://catalogo.bne.es/uhtbin/authoritybrowse.cgi?action=display&authority_id={{id}}",
    ),
    ("DNB", "http://d-nb.info/gnd/{{id}}"),
    ("ICCU", "http://id.sbn.it/af/{{id}}"),
    (
        "JPG",
        "http://www.getty.edu/vow/ULANFullDisplay?find=&role=&nation=&subjectid={{id}}",
    ),
    ("LC", "http://id.loc.gov/authorities/names/{{id}}"),
    ("NDL", "http://id.ndl.go.jp/auth/ndlna/{{id}}"),
    ("SELIBR", "http://libris.kb.se/resource/auth/{{id}}"),
    ("SUDOC", "http://www.idref.fr/{{id}}/id"),
    ("WKP", "http://www.wikidata.org/entity/{{id}}#sitelinks-wikipedia"),
];

/// View URL template for records of `source`.
pub fn source_view_url(source: &str) -> String {
    SOURCE_VIEW_URLS
        .iter()
        .find(|(code, _)| code.eq_ignore_ascii_case(source))
        .map(|(_, url)| url.to_string())
        .unwrap_or_else(|| format!("https://viaf.org/viaf/sourceID/{}|{{{{id}}}}", source))
}

/// `{"result": [...]}` envelope for one query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResult {
    pub result: Vec<Match>,
}

impl QueryResult {
    pub fn new(result: Vec<Match>) -> Self {
        Self { result }
    }
}

/// Caller key -> result. Serialized in key order.
pub type BatchResult = BTreeMap<String, QueryResult>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct View {
    pub url: String,
}

/// Service description returned when a request carries no query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMetadata {
    pub name: String,
    pub identifier_space: String,
    pub schema_space: String,
    pub view: View,
    pub default_types: Vec<TypeRef>,
}

impl ServiceMetadata {
    /// Metadata for the service, optionally scoped to one cataloging source.
    pub fn new(config: &ReconcileConfig, source: Option<&str>) -> Self {
        let name = match source {
            Some(source) => format!("{} - {}", config.service_name, source),
            None => config.service_name.clone(),
        };

        Self {
            name,
            identifier_space: IDENTIFIER_SPACE.to_string(),
            schema_space: SCHEMA_SPACE.to_string(),
            view: View {
                url: config.view_url.clone(),
            },
            default_types: types::default_types()
                .iter()
                .map(|nt| nt.type_ref())
                .collect(),
        }
    }
}

impl ServiceMetadata {
    /// Metadata for proxy mode: ids and view links belong to `source`.
    pub fn proxy(config: &ReconcileConfig, source: &str) -> Self {
        let mut metadata = Self::new(config, Some(source));
        metadata.name.push_str(" (by way of VIAF)");
        metadata.view.url = source_view_url(source);
        metadata
    }
}

/// Serialize `payload`, wrapping it as `callback(...)` when a callback is given.
pub fn to_json<T: Serialize>(payload: &T, callback: Option<&str>) -> Result<String> {
    let json = serde_json::to_string(payload).map_err(ReconcileError::Serialization)?;
    wrap_callback(json, callback)
}

/// JSONP wrapping. Callback names are limited to dotted JavaScript
/// identifiers so the response cannot smuggle script into the page.
pub fn wrap_callback(json: String, callback: Option<&str>) -> Result<String> {
    validate_callback(callback)?;
    match callback {
        Some(cb) => Ok(format!("{}({})", cb, json)),
        None => Ok(json),
    }
}

/// Reject a callback name before any work is done for the request.
pub fn validate_callback(callback: Option<&str>) -> Result<()> {
    match callback {
        Some(cb) if !is_valid_callback(cb) => {
            Err(ReconcileError::InvalidCallback(cb.to_string()))
        }
        _ => Ok(()),
    }
}

fn is_valid_callback(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        })
}
