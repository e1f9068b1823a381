//! kew core types: queue items, change kinds and the notification payload
//! handed from the decision engine to the sinks.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Event;
use serde::{Deserialize, Serialize};

pub mod config;

pub use config::{
    load_config, Conjunction, ConfigError, ExtraFilterConfig, FieldSelector, FilterMode, FilterRule,
    SelectorMode, WatchConfig, WatchEvent,
};

/// Kind of change observed by the watch source.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Added => "ADDED",
            ChangeType::Modified => "MODIFIED",
            ChangeType::Deleted => "DELETED",
        }
    }

    /// Action label attached to a delivered notification.
    pub fn action(&self) -> Action {
        match self {
            ChangeType::Added => Action::Created,
            ChangeType::Modified => Action::Updated,
            ChangeType::Deleted => Action::Deleted,
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// One unit of deferred work: a change to one object key.
///
/// `eligible` is computed at enqueue time from the scope's event toggles so
/// that disabled change types never touch the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueItem {
    pub key: String,
    pub change: ChangeType,
    pub eligible: bool,
}

impl QueueItem {
    pub fn new(key: impl Into<String>, change: ChangeType, eligible: bool) -> Self {
        Self { key: key.into(), change, eligible }
    }
}

impl fmt::Display for QueueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.change, self.key)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Created,
    Updated,
    Deleted,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Created => "created",
            Action::Updated => "updated",
            Action::Deleted => "deleted",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Status label used for deleted notices, which carry no event type.
pub const STATUS_DANGER: &str = "Danger";

/// A rendered, ready-to-dispatch notification. Built per queue item and
/// consumed immediately by the dispatcher.
#[derive(Debug, Clone)]
pub struct NotificationPayload {
    pub key: String,
    pub action: Action,
    /// Event `type` (`Normal`, `Warning`) or [`STATUS_DANGER`] for deletions.
    pub status: String,
    /// Chat body.
    pub text: String,
    /// Durable-log record body.
    pub record: String,
    /// Record timestamp in epoch milliseconds.
    pub timestamp_ms: i64,
    /// Cached object; `None` for deletions.
    pub event: Option<Arc<Event>>,
}

impl NotificationPayload {
    /// Title line shown above the chat body.
    pub fn title(&self) -> String { format!("kubernetes event : {}", self.action) }
}

/// Key used by the watch cache: `namespace/name`, or `name` when cluster scoped.
pub fn object_key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
        _ => name.to_string(),
    }
}

/// Split a cache key back into `(namespace, name)`.
pub fn split_key(key: &str) -> (Option<&str>, &str) {
    match key.split_once('/') {
        Some((ns, name)) => (Some(ns), name),
        None => (None, key),
    }
}
