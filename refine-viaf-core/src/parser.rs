//! VIAF search response parser
//!
//! The registry answers with an SRU `searchRetrieveResponse` whose records
//! each wrap a `VIAFCluster`. The cluster elements carry a namespace prefix
//! that changes from record to record (`ns2:`, `ns3:`, ...), and the markup
//! is not always well formed (bare `&` and `<` in names are common), so
//! parsing is a lenient streaming scan that matches elements by local name
//! only and recovers record by record.
//!
//! Parsing happens in two steps: [`scan_records`] pulls the raw fields out of
//! each record, then [`parse_response`] (or [`parse_proxy_response`]) turns
//! them into [`Match`]es.

use std::borrow::Cow;

use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::Reader;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{self, NameType, TypeRef};

/// Every match gets the same score; `match` carries the exact/inexact signal.
pub const MATCH_SCORE: u32 = 1;

/// Id reported in proxy mode when a cluster has no record from the source.
pub const UNKNOWN_SOURCE_ID: &str = "0";

/// Longest entity (`&...;`) worth trying to decode.
const MAX_ENTITY_LEN: usize = 32;

/// A reconciliation candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    /// Registry identifier (VIAF id, or the source's own id in proxy mode)
    pub id: String,
    /// Selected display name
    pub name: String,
    /// Always exactly one entry
    #[serde(rename = "type")]
    pub types: Vec<TypeRef>,
    pub score: u32,
    /// True iff `name` is byte-for-byte the query text
    #[serde(rename = "match")]
    pub exact: bool,
}

/// Raw fields pulled from one `record` element.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RegistryRecord {
    pub viaf_id: Option<String>,
    pub name_type_code: Option<String>,
    pub headings: Vec<NameHeading>,
    /// Cluster-level `source` entries as `(sid, nsid)`, e.g.
    /// `("LC|n  2008032484", "n2008032484")`. `nsid` may be empty.
    pub source_ids: Vec<(String, String)>,
}

/// One spelling of the name, with the sources that use it.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NameHeading {
    pub text: Option<String>,
    pub sources: Vec<String>,
    /// Source record ids (`CODE|id`) listed next to the sources
    pub sids: Vec<String>,
}

impl RegistryRecord {
    /// The id `source` gives this cluster in its own catalog.
    ///
    /// The heading's `sid` names the source record; the cluster-level entry
    /// for that sid carries the normalized id. A missing or URL-valued
    /// normalized id falls back to the sid's own id part, whitespace
    /// removed.
    pub fn source_record_id(&self, source: &str) -> Option<String> {
        let sid = self
            .headings
            .iter()
            .flat_map(|h| h.sids.iter())
            .chain(self.source_ids.iter().map(|(sid, _)| sid))
            .find(|sid| sid_for_source(sid, source).is_some())?;

        let nsid = self
            .source_ids
            .iter()
            .find(|(s, _)| s == sid)
            .map(|(_, nsid)| nsid.trim())
            .filter(|nsid| !nsid.is_empty() && !nsid.starts_with("http"));

        match nsid {
            Some(nsid) => Some(nsid.to_string()),
            None => sid_for_source(sid, source).map(|id| id.split_whitespace().collect()),
        }
    }
}

/// The id part of `CODE|id` when `CODE` is `source`.
fn sid_for_source<'a>(sid: &'a str, source: &str) -> Option<&'a str> {
    sid.split_once('|')
        .filter(|(code, _)| code.trim().eq_ignore_ascii_case(source))
        .map(|(_, id)| id)
}

/// Parse a registry response into matches identified by VIAF id.
///
/// When `query_type` is given every match gets that type; otherwise each
/// record's own type code is resolved and an unrecognized code is an error.
pub fn parse_response(
    xml: &str,
    query_type: Option<&'static NameType>,
    query_text: &str,
    preferred_sources: &[String],
) -> Result<Vec<Match>> {
    build_matches(xml, query_type, query_text, preferred_sources, |_, viaf_id| {
        viaf_id.to_string()
    })
}

/// Parse a registry response into matches identified by `source`'s own
/// record ids, named by that source.
pub fn parse_proxy_response(
    xml: &str,
    query_type: Option<&'static NameType>,
    query_text: &str,
    source: &str,
) -> Result<Vec<Match>> {
    let preferred = [source.to_string()];
    build_matches(xml, query_type, query_text, &preferred, |record, viaf_id| {
        record.source_record_id(source).unwrap_or_else(|| {
            tracing::warn!(viaf_id = %viaf_id, source = %source, "Cluster has no record from source");
            UNKNOWN_SOURCE_ID.to_string()
        })
    })
}

fn build_matches<F>(
    xml: &str,
    query_type: Option<&'static NameType>,
    query_text: &str,
    preferred_sources: &[String],
    id_for: F,
) -> Result<Vec<Match>>
where
    F: Fn(&RegistryRecord, &str) -> String,
{
    let mut matches = Vec::new();

    for record in scan_records(xml) {
        let Some(viaf_id) = record.viaf_id.as_deref() else {
            tracing::warn!("Skipping registry record without a viafID");
            continue;
        };

        let name_type = match (query_type, record.name_type_code.as_deref()) {
            (Some(nt), _) => nt,
            (None, Some(code)) => types::lookup_by_registry_code(code)?,
            (None, None) => {
                tracing::warn!(viaf_id = %viaf_id, "Skipping registry record without a nameType");
                continue;
            }
        };

        let name = select_name(&record.headings, preferred_sources);
        let m = Match {
            id: id_for(&record, viaf_id),
            exact: name == query_text,
            name,
            types: vec![name_type.type_ref()],
            score: MATCH_SCORE,
        };

        tracing::debug!(id = %m.id, name = %m.name, exact = m.exact, "Parsed match");
        matches.push(m);
    }

    Ok(matches)
}

/// Pick the display name for a record.
///
/// Each source maps to the last heading that lists it. The first preferred
/// source with a name wins; failing that, the name of the first source seen
/// in the document; failing that, the empty string.
pub fn select_name(headings: &[NameHeading], preferred_sources: &[String]) -> String {
    let mut by_source: Vec<(&str, &str)> = Vec::new();

    for heading in headings {
        let Some(name) = heading.text.as_deref() else {
            continue;
        };
        for source in &heading.sources {
            match by_source.iter_mut().find(|(s, _)| *s == source.as_str()) {
                Some(entry) => entry.1 = name,
                None => by_source.push((source.as_str(), name)),
            }
        }
    }

    preferred_sources
        .iter()
        .find_map(|preferred| {
            by_source
                .iter()
                .find(|(s, n)| *s == preferred.as_str() && !n.is_empty())
                .map(|(_, n)| *n)
        })
        .or_else(|| by_source.first().map(|(_, n)| *n))
        .unwrap_or_default()
        .to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Field {
    ViafId,
    NameType,
    HeadingText,
    Source,
    Sid,
    ClusterSource { nsid: String },
}

/// Open/closed state of a section that only counts the first time it appears.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    NotSeen,
    Open(usize),
    Done,
}

/// Text being collected for one leaf element.
struct Capture {
    field: Field,
    depth: usize,
    /// Local name of the element, to tell its end tag from stray markup
    name: Vec<u8>,
    text: String,
}

struct HeadingScan {
    depth: usize,
    sources: Section,
    heading: NameHeading,
}

struct RecordScan {
    depth: usize,
    record: RegistryRecord,
    main_headings: Section,
    heading: Option<HeadingScan>,
    capture: Option<Capture>,
}

impl RecordScan {
    fn new(depth: usize) -> Self {
        Self {
            depth,
            record: RegistryRecord::default(),
            main_headings: Section::NotSeen,
            heading: None,
            capture: None,
        }
    }

    fn capturing(&self) -> bool {
        self.capture.is_some()
    }

    fn begin(&mut self, field: Field, local: &[u8], depth: usize) {
        self.capture = Some(Capture {
            field,
            depth,
            name: local.to_vec(),
            text: String::new(),
        });
    }

    fn start(&mut self, e: &BytesStart<'_>, depth: usize) {
        let local_name = e.local_name();
        let local = local_name.as_ref();

        if is(local, b"viafID") && self.record.viaf_id.is_none() {
            self.begin(Field::ViafId, local, depth);
        } else if is(local, b"nameType") && self.record.name_type_code.is_none() {
            self.begin(Field::NameType, local, depth);
        } else if is(local, b"mainHeadings") && self.main_headings == Section::NotSeen {
            self.main_headings = Section::Open(depth);
        } else if is(local, b"source") && self.heading.is_none() {
            let nsid = attribute(e, b"nsid").unwrap_or_default();
            self.begin(Field::ClusterSource { nsid }, local, depth);
        } else if let Some(h) = self.heading.as_mut() {
            if is(local, b"text") && h.heading.text.is_none() {
                self.begin(Field::HeadingText, local, depth);
            } else if is(local, b"sources") && h.sources == Section::NotSeen {
                h.sources = Section::Open(depth);
            } else if is(local, b"s") && h.sources == Section::Open(depth - 1) {
                self.begin(Field::Source, local, depth);
            } else if is(local, b"sid") && h.sources == Section::Open(depth - 1) {
                self.begin(Field::Sid, local, depth);
            }
        } else if is(local, b"data") && self.main_headings == Section::Open(depth - 1) {
            self.heading = Some(HeadingScan {
                depth,
                sources: Section::NotSeen,
                heading: NameHeading::default(),
            });
        }
    }

    fn text(&mut self, text: &str) {
        if let Some(capture) = self.capture.as_mut() {
            capture.text.push_str(text);
        }
    }

    /// Markup inside a leaf's text (`Smith <John>`) is kept as written.
    fn literal_start(&mut self, e: &BytesStart<'_>) {
        if let Some(capture) = self.capture.as_mut() {
            capture.text.push('<');
            capture.text.push_str(&String::from_utf8_lossy(&**e));
            capture.text.push('>');
        }
    }

    fn literal_end(&mut self, e: &BytesEnd<'_>) {
        if let Some(capture) = self.capture.as_mut() {
            capture.text.push_str("</");
            capture.text.push_str(&String::from_utf8_lossy(e.name().as_ref()));
            capture.text.push('>');
        }
    }

    /// An end tag that closes neither the captured leaf nor the record.
    fn is_stray_end(&self, local: &[u8]) -> bool {
        self.capture
            .as_ref()
            .is_some_and(|c| !is(local, &c.name) && !is(local, b"record"))
    }

    fn end(&mut self, depth: usize) {
        if let Some(at) = self.capture.as_ref().map(|c| c.depth) {
            if at == depth {
                if let Some(capture) = self.capture.take() {
                    self.store(capture.field, capture.text);
                }
            }
            return;
        }

        if let Some(h) = self.heading.as_mut() {
            if h.sources == Section::Open(depth) {
                h.sources = Section::Done;
            } else if h.depth == depth {
                self.close_heading();
            }
        } else if self.main_headings == Section::Open(depth) {
            self.main_headings = Section::Done;
        }
    }

    fn store(&mut self, field: Field, value: String) {
        match field {
            Field::ViafId => self.record.viaf_id = Some(value.trim().to_string()),
            Field::NameType => self.record.name_type_code = Some(value.trim().to_string()),
            Field::HeadingText => {
                if let Some(h) = self.heading.as_mut() {
                    h.heading.text = Some(value);
                }
            }
            Field::Source => {
                if let Some(h) = self.heading.as_mut() {
                    push_trimmed(&mut h.heading.sources, &value);
                }
            }
            Field::Sid => {
                if let Some(h) = self.heading.as_mut() {
                    push_trimmed(&mut h.heading.sids, &value);
                }
            }
            Field::ClusterSource { nsid } => {
                let sid = value.trim();
                if sid.contains('|') {
                    self.record
                        .source_ids
                        .push((sid.to_string(), nsid.trim().to_string()));
                }
            }
        }
    }

    fn close_heading(&mut self) {
        if let Some(h) = self.heading.take() {
            self.record.headings.push(h.heading);
        }
    }

    /// Finish the record, keeping whatever was read of a half-open heading.
    fn finish(mut self) -> RegistryRecord {
        self.capture = None;
        self.close_heading();
        self.record
    }
}

fn push_trimmed(list: &mut Vec<String>, value: &str) {
    let value = value.trim();
    if !value.is_empty() {
        list.push(value.to_string());
    }
}

/// Pull the raw fields out of every `record` element in `xml`.
///
/// Never fails. Undecodable entities stay literal, bare `<` and stray tags
/// inside a name are kept as text, and mismatched end tags are accepted. A
/// `record` start or end tag always starts or closes a record, whatever came
/// before it. On a syntax error the record being read is kept as far as it
/// got and the scan resumes at the next `record` start tag.
pub fn scan_records(xml: &str) -> Vec<RegistryRecord> {
    let xml = escape_stray_lt(xml);
    let mut records = Vec::new();
    let mut from = 0;

    while let Some(stopped_at) = scan_from(&xml, from, &mut records) {
        match next_record_start(&xml, stopped_at.max(from + 1)) {
            Some(next) => {
                tracing::debug!(resume_at = next, "Resuming registry scan at next record");
                from = next;
            }
            None => break,
        }
    }

    records
}

/// Scan `xml[from..]`, pushing every record read. Returns the byte offset
/// of the syntax error that stopped the scan, if any.
fn scan_from(xml: &str, from: usize, records: &mut Vec<RegistryRecord>) -> Option<usize> {
    let mut reader = Reader::from_str(&xml[from..]);
    reader.config_mut().check_end_names = false;

    let mut current: Option<RecordScan> = None;
    let mut depth = 0usize;

    let stopped_at = loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if let Some(scan) = current.as_mut().filter(|s| s.capturing()) {
                    scan.literal_start(&e);
                    continue;
                }
                depth += 1;
                if is(e.local_name().as_ref(), b"record") {
                    if let Some(unclosed) = current.take() {
                        tracing::warn!("Registry record never closed, starting the next one");
                        records.push(unclosed.finish());
                    }
                    current = Some(RecordScan::new(depth));
                } else if let Some(scan) = current.as_mut() {
                    scan.start(&e, depth);
                }
            }
            Ok(Event::End(e)) => {
                let local_name = e.local_name();
                let local = local_name.as_ref();
                if let Some(scan) = current.as_mut() {
                    if scan.is_stray_end(local) {
                        scan.literal_end(&e);
                        continue;
                    }
                    if is(local, b"record") || scan.depth >= depth {
                        depth = scan.depth;
                        if let Some(done) = current.take() {
                            records.push(done.finish());
                        }
                    } else {
                        scan.end(depth);
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Text(t)) => {
                if let Some(scan) = current.as_mut() {
                    scan.text(&decode_text(&String::from_utf8_lossy(&t)));
                }
            }
            Ok(Event::CData(c)) => {
                if let Some(scan) = current.as_mut() {
                    scan.text(&String::from_utf8_lossy(&c));
                }
            }
            Ok(Event::Eof) => break None,
            Err(e) => {
                let at = from + usize::try_from(reader.buffer_position()).unwrap_or(0);
                tracing::warn!(
                    position = at,
                    error = %e,
                    "Malformed registry response, skipping to the next record"
                );
                break Some(at);
            }
            Ok(_) => {}
        }
    };

    if let Some(partial) = current.take() {
        records.push(partial.finish());
    }

    stopped_at
}

/// Escape every `<` that cannot open markup (`a < b`, `<3`).
fn escape_stray_lt(xml: &str) -> Cow<'_, str> {
    let opens_markup =
        |c: char| c.is_alphabetic() || matches!(c, '_' | ':' | '/' | '!' | '?');
    let stray: Vec<usize> = xml
        .match_indices('<')
        .map(|(i, _)| i)
        .filter(|&i| !xml[i + 1..].chars().next().is_some_and(opens_markup))
        .collect();

    if stray.is_empty() {
        return Cow::Borrowed(xml);
    }

    let mut escaped = String::with_capacity(xml.len() + stray.len() * 3);
    let mut last = 0;
    for i in stray {
        escaped.push_str(&xml[last..i]);
        escaped.push_str("&lt;");
        last = i + 1;
    }
    escaped.push_str(&xml[last..]);
    Cow::Owned(escaped)
}

/// Byte offset of the next `record` start tag (any prefix) at or after `from`.
fn next_record_start(xml: &str, from: usize) -> Option<usize> {
    let bytes = xml.as_bytes();
    let mut at = from;

    while at < bytes.len() {
        let lt = at + bytes[at..].iter().position(|&b| b == b'<')?;
        let rest = &bytes[lt + 1..];
        let name_len = rest
            .iter()
            .position(|&b| b.is_ascii_whitespace() || b == b'>' || b == b'/')
            .unwrap_or(rest.len());
        let name = &rest[..name_len];
        let local = name.rsplit(|&b| b == b':').next().unwrap_or(name);
        if is(local, b"record") {
            return Some(lt);
        }
        at = lt + 1;
    }

    None
}

/// Decode entities one at a time; anything that is not a decodable entity
/// (a bare `&`, `&unknown;`) stays as written.
fn decode_text(raw: &str) -> Cow<'_, str> {
    if !raw.contains('&') {
        return Cow::Borrowed(raw);
    }

    let mut decoded = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(amp) = rest.find('&') {
        decoded.push_str(&rest[..amp]);
        let tail = &rest[amp..];

        let entity = tail[1..]
            .find(|c: char| c == ';' || c == '&' || c == '<' || c.is_whitespace())
            .filter(|&end| end > 0 && end <= MAX_ENTITY_LEN && tail[1 + end..].starts_with(';'))
            .map(|end| &tail[..end + 2])
            .and_then(|entity| {
                quick_xml::escape::unescape(entity)
                    .ok()
                    .map(|text| (entity.len(), text))
            });

        match entity {
            Some((len, text)) => {
                decoded.push_str(&text);
                rest = &tail[len..];
            }
            None => {
                decoded.push('&');
                rest = &tail[1..];
            }
        }
    }

    decoded.push_str(rest);
    Cow::Owned(decoded)
}

/// Value of the attribute whose local name is `name`.
fn attribute(e: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    let mut attributes = e.attributes();
    attributes.with_checks(false);
    attributes
        .flatten()
        .find(|a| is(a.key.local_name().as_ref(), name))
        .map(|a| decode_text(&String::from_utf8_lossy(&a.value)).into_owned())
}

fn is(local: &[u8], name: &[u8]) -> bool {
    local.eq_ignore_ascii_case(name)
}
