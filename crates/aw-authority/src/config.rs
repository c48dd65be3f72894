// config.rs — Authority configuration.
//
// Loaded from `authority.toml`; every field has a serde default. The
// `for_dir()` constructor lays state out under `<dir>/.appwall/`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use aw_rules::ApplicationIdentity;

use crate::error::ConfigError;

/// Configuration for the authority service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorityConfig {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Holds `store.json` and the central `audit.jsonl`.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// How long a search result stays committable.
    #[serde(default = "default_selection_ttl_secs")]
    pub selection_ttl_secs: u64,

    /// Deltas kept for incremental pulls; older agents get a full snapshot.
    #[serde(default = "default_change_log_retention")]
    pub change_log_retention: usize,

    /// Buffered push notices per subscriber before it is reported lagged.
    #[serde(default = "default_push_capacity")]
    pub push_capacity: usize,

    /// Applications known before any agent reports in.
    #[serde(default)]
    pub catalog: Vec<ApplicationIdentity>,
}

impl AuthorityConfig {
    /// Defaults with all state under `<dir>/.appwall/`.
    pub fn for_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            state_dir: dir.as_ref().join(".appwall"),
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Invalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn store_path(&self) -> PathBuf {
        self.state_dir.join("store.json")
    }

    pub fn audit_log(&self) -> PathBuf {
        self.state_dir.join("audit.jsonl")
    }

    pub fn selection_ttl(&self) -> Duration {
        Duration::from_secs(self.selection_ttl_secs)
    }
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            state_dir: default_state_dir(),
            selection_ttl_secs: default_selection_ttl_secs(),
            change_log_retention: default_change_log_retention(),
            push_capacity: default_push_capacity(),
            catalog: Vec::new(),
        }
    }
}

// Serde default functions
fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7300))
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".appwall")
}

fn default_selection_ttl_secs() -> u64 {
    300
}

fn default_change_log_retention() -> usize {
    1024
}

fn default_push_capacity() -> usize {
    256
}
