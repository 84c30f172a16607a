//! Configuration parsing and validation.
//!
//! This module handles parsing of the daemon configuration file (TOML) that
//! defines the gate's timeouts and exemptions, the safety store's
//! persistence, supervisor thresholds, and the dispatch bindings.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::binding::{Binding, ConflictPolicy, ExemptRoute};

/// Default cap on distinct entity keys across the safety counter maps.
pub const DEFAULT_MAX_ENTITY_KEYS: usize = 1000;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration could not be serialized.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// The configuration is semantically invalid.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DgateConfig {
    /// HTTP listener settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Gate behaviour.
    #[serde(default)]
    pub gate: GateConfig,

    /// Safety runtime store persistence.
    #[serde(default)]
    pub safety: SafetyConfig,

    /// Interpreter supervisor thresholds.
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Reference policy evaluator tuning.
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Dispatch bindings, matched in order.
    #[serde(default)]
    pub bindings: Vec<Binding>,
}

impl DgateConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validates cross-field invariants.
    ///
    /// Missing reroute targets and unregistered targets are configuration
    /// errors, never silently defaulted.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gate.policy_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "gate.policy_timeout must be non-zero".into(),
            ));
        }
        if self.safety.max_entity_keys == 0 {
            return Err(ConfigError::Validation(
                "safety.max_entity_keys must be at least 1".into(),
            ));
        }
        if self.supervisor.worker_failure_threshold == 0
            || self.supervisor.heartbeat_miss_threshold == 0
        {
            return Err(ConfigError::Validation(
                "supervisor thresholds must be at least 1".into(),
            ));
        }
        for rule in &self.gate.exempt_routes {
            if !rule.path.starts_with('/') {
                return Err(ConfigError::Validation(format!(
                    "exempt route path '{}' must start with '/'",
                    rule.path
                )));
            }
        }

        let mut seen = HashSet::new();
        for binding in &self.bindings {
            if binding.id.trim().is_empty() {
                return Err(ConfigError::Validation("binding id must not be empty".into()));
            }
            if !seen.insert(binding.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate binding id '{}'",
                    binding.id
                )));
            }
            match (&binding.conflict_policy, &binding.reroute_target) {
                (ConflictPolicy::Reroute, None) => {
                    return Err(ConfigError::Validation(format!(
                        "binding '{}' reroutes but has no reroute_target",
                        binding.id
                    )));
                },
                (_, Some(target)) if !binding.has_exact_path(target) => {
                    return Err(ConfigError::Validation(format!(
                        "binding '{}' reroute_target '{target}' is not one of its exact_paths",
                        binding.id
                    )));
                },
                _ => {},
            }
        }
        Ok(())
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen address.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8787))
}

/// Gate behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GateConfig {
    /// Budget for a single snapshot load.
    #[serde(default = "default_policy_timeout", with = "humantime_serde")]
    pub policy_timeout: Duration,

    /// Compute and log decisions without enforcing them.
    #[serde(default)]
    pub shadow_mode: bool,

    /// Reject traffic while a blocking unsafe condition is active.
    #[serde(default = "default_true")]
    pub enforce_blocking_conditions: bool,

    /// Maximum request body size buffered by the gate.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Routes admitted without consistency checks.
    #[serde(default = "default_exempt_routes")]
    pub exempt_routes: Vec<ExemptRoute>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            policy_timeout: default_policy_timeout(),
            shadow_mode: false,
            enforce_blocking_conditions: true,
            max_body_bytes: default_max_body_bytes(),
            exempt_routes: default_exempt_routes(),
        }
    }
}

const fn default_policy_timeout() -> Duration {
    Duration::from_millis(1500)
}

const fn default_true() -> bool {
    true
}

const fn default_max_body_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_exempt_routes() -> Vec<ExemptRoute> {
    vec![
        ExemptRoute::exact("GET", "/health"),
        ExemptRoute::prefix("GET", "/status"),
    ]
}

/// Safety runtime store persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SafetyConfig {
    /// Path to the persisted JSON document.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Quiet period before a scheduled write is flushed.
    #[serde(default = "default_persist_debounce", with = "humantime_serde")]
    pub persist_debounce: Duration,

    /// Cap on distinct entity keys across the counter maps.
    #[serde(default = "default_max_entity_keys")]
    pub max_entity_keys: usize,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            persist_debounce: default_persist_debounce(),
            max_entity_keys: DEFAULT_MAX_ENTITY_KEYS,
        }
    }
}

fn default_state_file() -> PathBuf {
    PathBuf::from("dgate-safety.json")
}

const fn default_persist_debounce() -> Duration {
    Duration::from_millis(100)
}

const fn default_max_entity_keys() -> usize {
    DEFAULT_MAX_ENTITY_KEYS
}

/// Interpreter supervisor thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisorConfig {
    /// Entity id under which gate cycles are tracked.
    #[serde(default = "default_entity_id")]
    pub entity_id: String,

    /// Failures within `failure_window` that trigger a worker quarantine.
    #[serde(default = "default_worker_failure_threshold")]
    pub worker_failure_threshold: u64,

    /// Sliding window for worker failures.
    #[serde(default = "default_failure_window", with = "humantime_serde")]
    pub failure_window: Duration,

    /// Silence after which an in-flight cycle counts a heartbeat miss.
    #[serde(default = "default_heartbeat_timeout", with = "humantime_serde")]
    pub heartbeat_timeout: Duration,

    /// Heartbeat misses that trigger a heartbeat-loss quarantine.
    #[serde(default = "default_heartbeat_miss_threshold")]
    pub heartbeat_miss_threshold: u64,

    /// Healthy cycles required before auto-recovery releases quarantines.
    #[serde(default = "default_recovery_healthy_cycles")]
    pub recovery_healthy_cycles: u64,

    /// Interval of the stalled-cycle sweep.
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            entity_id: default_entity_id(),
            worker_failure_threshold: default_worker_failure_threshold(),
            failure_window: default_failure_window(),
            heartbeat_timeout: default_heartbeat_timeout(),
            heartbeat_miss_threshold: default_heartbeat_miss_threshold(),
            recovery_healthy_cycles: default_recovery_healthy_cycles(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

fn default_entity_id() -> String {
    "dispatch-gate".to_string()
}

const fn default_worker_failure_threshold() -> u64 {
    3
}

const fn default_failure_window() -> Duration {
    Duration::from_secs(60)
}

const fn default_heartbeat_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_heartbeat_miss_threshold() -> u64 {
    3
}

const fn default_recovery_healthy_cycles() -> u64 {
    5
}

const fn default_sweep_interval() -> Duration {
    Duration::from_secs(5)
}

/// Reference policy evaluator tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    /// How far a client baseline may trail the snapshot before it is stale.
    #[serde(default = "default_stale_tolerance", with = "humantime_serde")]
    pub stale_tolerance: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            stale_tolerance: default_stale_tolerance(),
        }
    }
}

const fn default_stale_tolerance() -> Duration {
    Duration::from_millis(250)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::Sensitivity;

    const FULL: &str = r#"
[server]
listen = "0.0.0.0:9000"

[gate]
policy_timeout = "750ms"
shadow_mode = true
max_body_bytes = 1024
[[gate.exempt_routes]]
method = "*"
path = "/metrics"
prefix = true

[safety]
state_file = "/var/lib/dgate/safety.json"
persist_debounce = "50ms"
max_entity_keys = 10

[supervisor]
worker_failure_threshold = 2
failure_window = "5s"

[policy]
stale_tolerance = "0s"

[[bindings]]
id = "memory-write"
sensitivity = "high"
conflict_policy = "reroute"
reroute_target = "/ask"
exact_paths = ["/memory/save", "/ask"]
methods = ["POST"]
"#;

    #[test]
    fn parses_full_config() {
        let config = DgateConfig::from_toml(FULL).unwrap();
        assert_eq!(config.server.listen.port(), 9000);
        assert_eq!(config.gate.policy_timeout, Duration::from_millis(750));
        assert!(config.gate.shadow_mode);
        assert!(config.gate.enforce_blocking_conditions);
        assert_eq!(config.gate.exempt_routes.len(), 1);
        assert_eq!(config.safety.max_entity_keys, 10);
        assert_eq!(config.supervisor.worker_failure_threshold, 2);
        assert_eq!(config.supervisor.heartbeat_miss_threshold, 3);
        assert_eq!(config.policy.stale_tolerance, Duration::ZERO);
        assert_eq!(config.bindings[0].sensitivity, Sensitivity::High);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = DgateConfig::from_toml("").unwrap();
        assert_eq!(config.gate.policy_timeout, Duration::from_millis(1500));
        assert_eq!(config.safety.persist_debounce, Duration::from_millis(100));
        assert_eq!(config.safety.max_entity_keys, DEFAULT_MAX_ENTITY_KEYS);
        assert_eq!(config.gate.exempt_routes.len(), 2);
        assert!(config.bindings.is_empty());
    }

    #[test]
    fn reroute_without_target_is_rejected() {
        let toml = r#"
[[bindings]]
id = "b"
conflict_policy = "reroute"
exact_paths = ["/x"]
"#;
        let err = DgateConfig::from_toml(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(msg) if msg.contains("no reroute_target")));
    }

    #[test]
    fn unregistered_reroute_target_is_rejected() {
        let toml = r#"
[[bindings]]
id = "b"
conflict_policy = "reroute"
reroute_target = "/elsewhere"
exact_paths = ["/x"]
"#;
        let err = DgateConfig::from_toml(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(msg) if msg.contains("not one of its exact_paths")));
    }

    #[test]
    fn duplicate_binding_ids_are_rejected() {
        let toml = r#"
[[bindings]]
id = "b"
[[bindings]]
id = "b"
"#;
        assert!(matches!(
            DgateConfig::from_toml(toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            DgateConfig::from_toml("[gate]\nshadow = true\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn serializes_back_to_toml() {
        let config = DgateConfig::from_toml(FULL).unwrap();
        let rendered = config.to_toml().unwrap();
        let reparsed = DgateConfig::from_toml(&rendered).unwrap();
        assert_eq!(reparsed.bindings, config.bindings);
        assert_eq!(reparsed.gate.policy_timeout, config.gate.policy_timeout);
    }
}
