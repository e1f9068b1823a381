//! Scope configuration loaded once at startup from a YAML list.
//!
//! Keys keep the camelCase spelling operators already use:
//!
//! ```yaml
//! - namespace: kube-system
//!   watchEvent: { ADDED: true, MODIFIED: true, DELETED: false }
//!   fieldSelectors:
//!     - { key: type, value: Normal, type: exclude }
//!   channel: "#ops"
//!   logStream: kube-system
//!   extraFilter:
//!     type: drop
//!     filters:
//!       - { key: reason, value: "/^Pulled$/", condition: or }
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::info;

pub const DEFAULT_CONFIG_PATH: &str = "~/.kube-event-watcher/config.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("parsing config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("config error: set at least one scope")]
    Empty,
    #[error("invalid filter in scope {scope}: {reason}")]
    Filter { scope: String, reason: String },
}

/// One watched scope.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WatchConfig {
    /// Namespace to watch; empty means all namespaces.
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub watch_event: WatchEvent,
    #[serde(default)]
    pub field_selectors: Vec<FieldSelector>,
    /// Chat channel override for this scope.
    #[serde(default)]
    pub channel: Option<String>,
    /// Log stream override for this scope.
    #[serde(default)]
    pub log_stream: Option<String>,
    #[serde(default)]
    pub extra_filter: Option<ExtraFilterConfig>,
    /// Staleness window for MODIFIED notifications, in seconds.
    #[serde(default)]
    pub staleness_secs: Option<u64>,
}

impl WatchConfig {
    pub fn namespace(&self) -> Option<&str> {
        if self.namespace.is_empty() { None } else { Some(self.namespace.as_str()) }
    }

    pub fn channel_override(&self) -> Option<&str> {
        self.channel.as_deref().filter(|c| !c.is_empty())
    }

    pub fn log_stream_override(&self) -> Option<&str> {
        self.log_stream.as_deref().filter(|s| !s.is_empty())
    }

    /// Stable label for logs and metrics: `<index>:<namespace|all>`.
    pub fn scope_name(&self, index: usize) -> String {
        format!("{}:{}", index, self.namespace().unwrap_or("all"))
    }
}

/// Per change-type toggles. A type left out of the YAML is disabled.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchEvent {
    #[serde(rename = "ADDED", default)]
    pub added: bool,
    #[serde(rename = "MODIFIED", default)]
    pub modified: bool,
    #[serde(rename = "DELETED", default)]
    pub deleted: bool,
}

impl WatchEvent {
    pub fn enabled(&self, change: crate::ChangeType) -> bool {
        match change {
            crate::ChangeType::Added => self.added,
            crate::ChangeType::Modified => self.modified,
            crate::ChangeType::Deleted => self.deleted,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SelectorMode {
    Include,
    Exclude,
    #[serde(other)]
    Unknown,
}

/// Server-side field selector term, ANDed with the others of its scope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldSelector {
    pub key: String,
    pub value: String,
    #[serde(rename = "type")]
    pub mode: SelectorMode,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    Keep,
    Drop,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Conjunction {
    And,
    /// Anything other than `and` is independently decisive.
    #[default]
    #[serde(other)]
    Or,
}

/// One rule of an extra filter: `key` is a dotted field path, `value` a
/// substring or a `/regex/`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilterRule {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub condition: Conjunction,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtraFilterConfig {
    #[serde(rename = "type")]
    pub mode: FilterMode,
    #[serde(default)]
    pub filters: SmallVec<[FilterRule; 4]>,
}

/// Expand a leading `~` against `$HOME`.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = std::env::var_os("HOME") {
            let mut p = PathBuf::from(home);
            let rest = rest.trim_start_matches('/');
            if !rest.is_empty() { p.push(rest); }
            return p;
        }
    }
    PathBuf::from(path)
}

/// Parse scopes from YAML text.
pub fn parse_config(text: &str) -> Result<Vec<WatchConfig>, ConfigError> {
    let scopes: Vec<WatchConfig> = serde_yaml::from_str(text)?;
    if scopes.is_empty() {
        return Err(ConfigError::Empty);
    }
    Ok(scopes)
}

/// Read and parse the scope list at `path` (`~` expanded).
pub fn load_config(path: &str) -> Result<Vec<WatchConfig>, ConfigError> {
    let resolved = expand_home(path);
    let text = read(&resolved)?;
    let scopes = parse_config(&text)?;
    info!(path = %resolved.display(), scopes = scopes.len(), "config loaded");
    Ok(scopes)
}

fn read(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })
}
