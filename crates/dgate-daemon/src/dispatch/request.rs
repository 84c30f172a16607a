//! The gate's view of an incoming request.
//!
//! [`DispatchRequest`] owns the mutable parts of an HTTP request (method,
//! URI, headers, body) so the gate can rewrite them for a reroute and
//! restore them exactly if the rewrite fails. The body stays as raw
//! [`Bytes`]; [`DispatchRequestBody`] is a typed, lenient projection of the
//! JSON fields the gate cares about.

use axum::http::{HeaderMap, HeaderValue, Method, Uri, header};
use bytes::Bytes;
use dgate_core::clock::parse_version_ts;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Client's last-known memory version.
pub const MEMORY_VERSION_HEADER: &str = "x-memory-version";

/// Explicit monotonic baseline override, in milliseconds.
pub const MEMORY_BASELINE_TS_HEADER: &str = "x-memory-baseline-ts";

/// Mutable request state evaluated (and possibly rewritten) by the gate.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    /// HTTP method.
    pub method: Method,
    /// Request target.
    pub uri: Uri,
    /// Request headers.
    pub headers: HeaderMap,
    /// Raw request body.
    pub body: Bytes,
}

impl DispatchRequest {
    /// Creates a request.
    #[must_use]
    pub const fn new(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            method,
            uri,
            headers,
            body,
        }
    }

    /// Returns a header value if it is present and valid UTF-8.
    #[must_use]
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    /// The `x-memory-version` header.
    #[must_use]
    pub fn memory_version(&self) -> Option<&str> {
        self.header_str(MEMORY_VERSION_HEADER)
    }

    /// The `x-memory-baseline-ts` header, when it is a millisecond integer
    /// or a parseable version string.
    #[must_use]
    pub fn baseline_ts_ms(&self) -> Option<u64> {
        self.header_str(MEMORY_BASELINE_TS_HEADER)
            .and_then(parse_version_ts)
    }

    /// Parses the body as a JSON object. Anything else yields `None`.
    #[must_use]
    pub fn parsed_body(&self) -> Option<DispatchRequestBody> {
        if self.body.is_empty() {
            return None;
        }
        serde_json::from_slice(&self.body).ok()
    }
}

/// Typed projection of the JSON request body.
///
/// Every field is optional and lenient: a field with a non-string value is
/// treated as absent rather than failing the whole body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequestBody {
    #[serde(default, deserialize_with = "lenient_string")]
    pub message: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub prompt: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub user_input: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub content: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub text: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub query: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub domain: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub module: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub command: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub update_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub source: Option<String>,
}

impl DispatchRequestBody {
    /// Free-text prompt fields in priority order, with their wire names.
    #[must_use]
    pub fn prompt_fields(&self) -> [(&'static str, Option<&str>); 6] {
        [
            ("message", self.message.as_deref()),
            ("prompt", self.prompt.as_deref()),
            ("userInput", self.user_input.as_deref()),
            ("content", self.content.as_deref()),
            ("text", self.text.as_deref()),
            ("query", self.query.as_deref()),
        ]
    }

    /// Intent hint fields, with their hint prefixes.
    #[must_use]
    pub fn hint_fields(&self) -> [(&'static str, Option<&str>); 5] {
        [
            ("domain", self.domain.as_deref()),
            ("module", self.module.as_deref()),
            ("command", self.command.as_deref()),
            ("updateType", self.update_type.as_deref()),
            ("source", self.source.as_deref()),
        ]
    }

    /// First non-blank prompt field, and its wire name.
    #[must_use]
    pub fn best_prompt(&self) -> Option<(&'static str, &str)> {
        self.prompt_fields()
            .into_iter()
            .find_map(|(name, value)| value.filter(|v| !v.trim().is_empty()).map(|v| (name, v)))
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        _ => None,
    })
}

/// Exact copy of the fields a reroute rewrites.
///
/// The body is reference-counted, so capture cost does not depend on body
/// size.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSnapshot {
    method: Method,
    uri: Uri,
    body: Bytes,
    content_type: Option<HeaderValue>,
    content_length: Option<HeaderValue>,
}

impl RequestSnapshot {
    /// Captures the rewritable fields of `req`.
    #[must_use]
    pub fn capture(req: &DispatchRequest) -> Self {
        Self {
            method: req.method.clone(),
            uri: req.uri.clone(),
            body: req.body.clone(),
            content_type: req.headers.get(header::CONTENT_TYPE).cloned(),
            content_length: req.headers.get(header::CONTENT_LENGTH).cloned(),
        }
    }

    /// Puts the captured fields back.
    pub fn restore(self, req: &mut DispatchRequest) {
        req.method = self.method;
        req.uri = self.uri;
        req.body = self.body;
        restore_header(&mut req.headers, header::CONTENT_TYPE, self.content_type);
        restore_header(&mut req.headers, header::CONTENT_LENGTH, self.content_length);
    }
}

fn restore_header(headers: &mut HeaderMap, name: header::HeaderName, value: Option<HeaderValue>) {
    match value {
        Some(value) => {
            headers.insert(name, value);
        },
        None => {
            headers.remove(name);
        },
    }
}
