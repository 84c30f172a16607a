//! Dispatch bindings and exempt routes.
//!
//! A [`Binding`] ties a set of request paths to a sensitivity level, a
//! conflict policy and an optional reroute target. Bindings are product
//! configuration; the gate only consumes them.

use serde::{Deserialize, Serialize};

/// Binding id reported for requests admitted by an exempt route.
pub const EXEMPT_BINDING_ID: &str = "exempt-readonly";

/// Binding id reported for requests that matched no binding.
pub const UNBOUND_BINDING_ID: &str = "unbound";

/// Method wildcard accepted by [`ExemptRoute::method`] and
/// [`Binding::methods`].
pub const ANY_METHOD: &str = "*";

/// How sensitive the state behind a binding is to conflicting writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    /// Conflicts are tolerable.
    Low,
    /// Conflicts should not be silently admitted.
    #[default]
    Medium,
    /// Conflicts must never be admitted.
    High,
}

/// What to do with a request whose validation failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Reject with a 409.
    #[default]
    Block,
    /// Rewrite the request to the binding's reroute target.
    Reroute,
    /// Admit anyway (only honoured below [`Sensitivity::High`]).
    Allow,
}

/// Policy configuration for one class of requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Binding {
    /// Stable id reported in headers and response bodies.
    pub id: String,
    /// Sensitivity of the state behind the binding.
    #[serde(default)]
    pub sensitivity: Sensitivity,
    /// Reaction to failed validation.
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    /// Alternate handler path used when rerouting.
    #[serde(default)]
    pub reroute_target: Option<String>,
    /// Exact normalized paths this binding covers.
    #[serde(default)]
    pub exact_paths: Vec<String>,
    /// Path prefixes this binding covers, bounded by a slash.
    #[serde(default)]
    pub path_prefixes: Vec<String>,
    /// Methods this binding covers; empty means every method.
    #[serde(default)]
    pub methods: Vec<String>,
}

impl Binding {
    /// Returns `true` if the binding applies to `method`.
    #[must_use]
    pub fn covers_method(&self, method: &str) -> bool {
        self.methods.is_empty()
            || self
                .methods
                .iter()
                .any(|m| m == ANY_METHOD || m.eq_ignore_ascii_case(method))
    }

    /// Returns `true` if the binding applies to the normalized `path`.
    #[must_use]
    pub fn covers_path(&self, path: &str) -> bool {
        self.exact_paths.iter().any(|p| p == path)
            || self
                .path_prefixes
                .iter()
                .any(|prefix| path_has_prefix(path, prefix))
    }

    /// Returns `true` if `target` is one of the binding's exact paths.
    #[must_use]
    pub fn has_exact_path(&self, target: &str) -> bool {
        self.exact_paths.iter().any(|p| p == target)
    }
}

/// A route admitted without consistency checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExemptRoute {
    /// HTTP method, or `"*"` for every method.
    pub method: String,
    /// Normalized path.
    pub path: String,
    /// Match `path` as a slash-bounded prefix instead of exactly.
    #[serde(default)]
    pub prefix: bool,
}

impl ExemptRoute {
    /// Creates an exact-match rule.
    #[must_use]
    pub fn exact(method: &str, path: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            prefix: false,
        }
    }

    /// Creates a prefix rule.
    #[must_use]
    pub fn prefix(method: &str, path: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            prefix: true,
        }
    }

    /// Returns `true` if the rule admits `method` + normalized `path`.
    #[must_use]
    pub fn matches(&self, method: &str, path: &str) -> bool {
        let method_ok = self.method == ANY_METHOD || self.method.eq_ignore_ascii_case(method);
        if !method_ok {
            return false;
        }
        if self.prefix {
            path_has_prefix(path, &self.path)
        } else {
            path == self.path
        }
    }
}

/// Slash-bounded prefix match: `/api` matches `/api` and `/api/x` but not
/// `/apix`. The root prefix `/` matches every path.
#[must_use]
pub fn path_has_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return path.starts_with('/');
    }
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}
