//! Attempt descriptors: the normalized description of one request.

use dgate_core::binding::ExemptRoute;
use serde::Serialize;

use super::request::{DispatchRequest, DispatchRequestBody};

/// Maximum length of one intent hint value, in characters.
pub const MAX_INTENT_HINT_CHARS: usize = 64;

/// Normalized description of an incoming request.
///
/// Lives only for the duration of the request; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchAttempt {
    /// Upper-case HTTP method.
    pub method: String,
    /// Normalized path (see [`normalize_path`]).
    pub path: String,
    /// `"<METHOD> <path>"`.
    pub route_attempted: String,
    /// `"<field>:<value>"` hints from the body, e.g. `"domain:memory"`.
    pub intent_hints: Vec<String>,
}

impl DispatchAttempt {
    /// Builds an attempt from a method, a raw path and an optional body.
    #[must_use]
    pub fn new(method: &str, raw_path: &str, body: Option<&DispatchRequestBody>) -> Self {
        let method = method.to_ascii_uppercase();
        let path = normalize_path(raw_path);
        let route_attempted = format!("{method} {path}");
        let intent_hints = body.map(intent_hints).unwrap_or_default();
        Self {
            method,
            path,
            route_attempted,
            intent_hints,
        }
    }

    /// Builds an attempt from a request.
    #[must_use]
    pub fn from_request(req: &DispatchRequest) -> Self {
        Self::new(
            req.method.as_str(),
            req.uri.path(),
            req.parsed_body().as_ref(),
        )
    }

    /// Returns `true` if any exempt rule admits this attempt.
    #[must_use]
    pub fn is_exempt(&self, rules: &[ExemptRoute]) -> bool {
        rules.iter().any(|rule| rule.matches(&self.method, &self.path))
    }
}

/// Normalizes a request path: collapses repeated slashes, resolves `.`
/// segments, and strips the trailing slash. An empty path becomes `/`.
///
/// `..` segments are kept verbatim so they can never widen a prefix match.
#[must_use]
pub fn normalize_path(raw: &str) -> String {
    let raw = raw.split(['?', '#']).next().unwrap_or_default();
    let segments: Vec<&str> = raw
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    if segments.is_empty() {
        return "/".to_string();
    }
    let mut path = String::with_capacity(raw.len() + 1);
    for segment in segments {
        path.push('/');
        path.push_str(segment);
    }
    path
}

fn intent_hints(body: &DispatchRequestBody) -> Vec<String> {
    body.hint_fields()
        .into_iter()
        .filter_map(|(name, value)| {
            let value = value?.trim();
            if value.is_empty() {
                return None;
            }
            let value: String = value
                .chars()
                .take(MAX_INTENT_HINT_CHARS)
                .collect::<String>()
                .to_lowercase();
            Some(format!("{name}:{value}"))
        })
        .collect()
}
