//! kew controller: decision engine, per-scope worker loop and the
//! supervisor that runs one watch+queue+workers set per configured scope.

#![forbid(unsafe_code)]

pub mod decide;
pub mod supervisor;
pub mod worker;

pub use decide::{last_change_time, Decision, DecisionEngine, DecisionPolicy, Suppressed, DEFAULT_STALENESS};
pub use supervisor::{compile_scopes, enqueue_handler, run_all, run_scope, ScopeSpec};
pub use worker::{Controller, MAX_RETRIES};

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Event;
use kew_core::{Action, NotificationPayload, WatchConfig, STATUS_DANGER};
use kew_filter::{load_template, Template, TemplateError, DEFAULT_CHAT_TEMPLATE, DEFAULT_RECORD_TEMPLATE};
use kew_sinks::{ChatClient, ChatConfig, ChatError, ChatSink, Dispatcher, LogConfig, LogSink, RawOutput, SequenceTokenManager};

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("object {0} not found in cache")]
    NotFound(String),
    #[error(transparent)]
    Chat(#[from] ChatError),
}

/// Renders chat bodies and log records for delivered items.
#[derive(Debug, Clone)]
pub struct Renderer {
    chat: Template,
    record: Template,
}

impl Renderer {
    pub fn new(chat: Template, record: Template) -> Self { Self { chat, record } }

    /// Built-in templates, or the given files when they load.
    pub fn load(chat_file: Option<&Path>, record_file: Option<&Path>) -> Result<Self, TemplateError> {
        Ok(Self::new(load_template(chat_file, DEFAULT_CHAT_TEMPLATE)?, load_template(record_file, DEFAULT_RECORD_TEMPLATE)?))
    }

    pub fn payload(&self, key: &str, action: Action, event: Option<Arc<Event>>, now: DateTime<Utc>) -> NotificationPayload {
        match event {
            Some(ev) => {
                let ts = last_change_time(&ev).unwrap_or(now);
                NotificationPayload {
                    key: key.to_string(),
                    action,
                    status: ev.type_.clone().unwrap_or_default(),
                    text: self.chat.render(&ev, action),
                    record: self.record.render(&ev, action),
                    timestamp_ms: ts.timestamp() * 1000,
                    event: Some(ev),
                }
            }
            None => {
                let notice = format!("Event {} has been deleted.", key);
                NotificationPayload {
                    key: key.to_string(),
                    action,
                    status: STATUS_DANGER.to_string(),
                    text: notice.clone(),
                    record: notice,
                    timestamp_ms: now.timestamp() * 1000,
                    event: None,
                }
            }
        }
    }
}

/// Process-wide sink clients and defaults; builds each scope's dispatcher.
pub struct SinkSet {
    pub metrics: bool,
    pub chat: Option<Arc<dyn ChatClient>>,
    pub default_channel: String,
    pub log: Option<Arc<SequenceTokenManager>>,
    pub log_group: String,
    pub default_stream: String,
    pub raw: Option<Arc<RawOutput>>,
}

impl SinkSet {
    pub fn dispatcher_for(&self, cfg: &WatchConfig) -> Dispatcher {
        let chat = match &self.chat {
            Some(client) => ChatSink::new(
                client.clone(),
                ChatConfig {
                    enabled: true,
                    channel: cfg.channel_override().unwrap_or(&self.default_channel).to_string(),
                    default_channel: self.default_channel.clone(),
                },
            ),
            None => ChatSink::disabled(),
        };
        let log = match &self.log {
            Some(m) => LogSink::new(
                m.clone(),
                LogConfig {
                    enabled: true,
                    group: self.log_group.clone(),
                    stream: cfg.log_stream_override().unwrap_or(&self.default_stream).to_string(),
                },
            ),
            None => LogSink::disabled(),
        };
        Dispatcher::new(self.metrics, chat, log, self.raw.clone())
    }

    /// Dispatcher for process-level notices on the default channel and stream.
    pub fn default_dispatcher(&self) -> Dispatcher { self.dispatcher_for(&WatchConfig::default()) }
}
