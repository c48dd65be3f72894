// config.rs — Agent configuration.
//
// Loaded from `agent.toml`. Every field has a serde default so a partial
// file (or none at all) yields a working configuration. `for_dir()` lays
// out state under `<dir>/.appwall/`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use aw_rules::{Action, EvaluatorConfig, TieBreak};

use crate::error::AgentError;

/// Which firewall facility the enforcer drives.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveKind {
    /// Linux netfilter via the `iptables` and `ss` binaries.
    #[default]
    Iptables,
    /// In-process rule table; nothing reaches the kernel (dry runs, tests).
    Memory,
}

/// A locally known application, used to name executables at attribution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KnownApplication {
    pub path: PathBuf,
    pub name: String,
    #[serde(default)]
    pub publisher: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Configuration for the endpoint agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Stable endpoint identity reported to the authority.
    #[serde(default = "default_endpoint_id")]
    pub endpoint_id: String,

    /// Base URL of the authority. None runs the agent standalone on its cache.
    #[serde(default)]
    pub authority_url: Option<String>,

    /// Where the last applied rule set is persisted.
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,

    /// Append-only local audit log.
    #[serde(default = "default_audit_log")]
    pub audit_log: PathBuf,

    /// Upper bound on one attribution lookup.
    #[serde(default = "default_attribution_timeout_ms")]
    pub attribution_timeout_ms: u64,

    #[serde(default = "default_action")]
    pub default_action: Action,

    /// Action for unattributed flows; falls back to `default_action`.
    #[serde(default)]
    pub unattributed_action: Option<Action>,

    #[serde(default)]
    pub tie_break: TieBreak,

    /// Re-evaluate open flows after every applied delta.
    #[serde(default = "default_true")]
    pub sweep_on_push: bool,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,

    #[serde(default)]
    pub primitive: PrimitiveKind,

    /// How often the socket tables are scanned for new and closed flows.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Resolve domain rules to addresses so address-only flows match them.
    #[serde(default = "default_true")]
    pub resolve_domains: bool,

    /// How long resolved rule domains are trusted before a fresh lookup.
    #[serde(default = "default_domain_ttl_secs")]
    pub domain_ttl_secs: u64,

    /// Upper bound on one domain lookup.
    #[serde(default = "default_dns_timeout_ms")]
    pub dns_timeout_ms: u64,

    #[serde(default)]
    pub applications: Vec<KnownApplication>,
}

impl AgentConfig {
    /// Defaults with all state under `<dir>/.appwall/`.
    pub fn for_dir(dir: impl AsRef<Path>) -> Self {
        let aw_dir = dir.as_ref().join(".appwall");
        Self {
            cache_path: aw_dir.join("ruleset.json"),
            audit_log: aw_dir.join("audit.jsonl"),
            ..Self::default()
        }
    }

    /// Parse `agent.toml`.
    pub fn load(path: &Path) -> Result<Self, AgentError> {
        let content = std::fs::read_to_string(path).map_err(|e| AgentError::io(path, e))?;
        toml::from_str(&content).map_err(|e| AgentError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Load the file if it exists, otherwise use defaults rooted at `dir`.
    pub fn load_or_for_dir(path: &Path, dir: &Path) -> Result<Self, AgentError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::for_dir(dir))
        }
    }

    pub fn evaluator_config(&self) -> EvaluatorConfig {
        EvaluatorConfig {
            default_action: self.default_action,
            unattributed_action: self.unattributed_action,
            tie_break: self.tie_break,
        }
    }

    pub fn attribution_timeout(&self) -> Duration {
        Duration::from_millis(self.attribution_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms.max(1))
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn domain_ttl(&self) -> Duration {
        Duration::from_secs(self.domain_ttl_secs)
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_millis(self.dns_timeout_ms.max(1))
    }

    /// Runtime status file, next to the cached rule set.
    pub fn status_path(&self) -> PathBuf {
        self.cache_path.with_file_name("status.json")
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            endpoint_id: default_endpoint_id(),
            authority_url: None,
            cache_path: default_cache_path(),
            audit_log: default_audit_log(),
            attribution_timeout_ms: default_attribution_timeout_ms(),
            default_action: default_action(),
            unattributed_action: None,
            tie_break: TieBreak::default(),
            sweep_on_push: true,
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_secs: default_max_backoff_secs(),
            primitive: PrimitiveKind::default(),
            poll_interval_ms: default_poll_interval_ms(),
            resolve_domains: true,
            domain_ttl_secs: default_domain_ttl_secs(),
            dns_timeout_ms: default_dns_timeout_ms(),
            applications: Vec::new(),
        }
    }
}

// Serde default functions
fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join("appwall")
}

fn default_endpoint_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "endpoint-local".to_string())
}

fn default_cache_path() -> PathBuf {
    default_state_dir().join("ruleset.json")
}

fn default_audit_log() -> PathBuf {
    default_state_dir().join("audit.jsonl")
}

fn default_attribution_timeout_ms() -> u64 {
    250
}

fn default_action() -> Action {
    Action::Allow
}

fn default_true() -> bool {
    true
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_secs() -> u64 {
    60
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_domain_ttl_secs() -> u64 {
    300
}

fn default_dns_timeout_ms() -> u64 {
    2000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_dir_uses_appwall_layout() {
        let config = AgentConfig::for_dir("/tmp/proj");
        assert_eq!(config.cache_path, PathBuf::from("/tmp/proj/.appwall/ruleset.json"));
        assert_eq!(config.audit_log, PathBuf::from("/tmp/proj/.appwall/audit.jsonl"));
        assert!(config.sweep_on_push);
        assert_eq!(config.tie_break, TieBreak::NewestFirst);
        assert_eq!(
            config.status_path(),
            PathBuf::from("/tmp/proj/.appwall/status.json")
        );
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: AgentConfig = toml::from_str(
            r#"
            endpoint_id = "laptop-7"
            authority_url = "http://authority:7300"
            default_action = "deny"
            unattributed_action = "deny"
            tie_break = "rule_id"
            primitive = "memory"

            [[applications]]
            path = "/usr/bin/firefox"
            name = "Firefox"
            publisher = "Mozilla"
            "#,
        )
        .unwrap();
        assert_eq!(config.endpoint_id, "laptop-7");
        assert_eq!(config.default_action, Action::Deny);
        assert_eq!(config.tie_break, TieBreak::RuleId);
        assert_eq!(config.primitive, PrimitiveKind::Memory);
        assert_eq!(config.applications.len(), 1);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert!(config.resolve_domains);
        assert_eq!(config.domain_ttl(), Duration::from_secs(300));

        let evaluator = config.evaluator_config();
        assert_eq!(evaluator.unattributed(), Action::Deny);
    }

    #[test]
    fn bad_toml_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(&path, "attribution_timeout_ms = \"soon\"").unwrap();
        assert!(matches!(
            AgentConfig::load(&path),
            Err(AgentError::Config { .. })
        ));
    }

    #[test]
    fn missing_file_falls_back_to_dir_layout() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            AgentConfig::load_or_for_dir(&dir.path().join("agent.toml"), dir.path()).unwrap();
        assert!(config.cache_path.starts_with(dir.path()));
    }
}
