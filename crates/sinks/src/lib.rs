//! kew sinks: delivery targets for event notifications.
//!
//! A [`Dispatcher`] fans one notification out to the metrics gauge, the chat
//! channel, the durable log, and the raw output, in that order. Only the chat
//! outcome is returned to the caller; the other sinks log their failures.

#![forbid(unsafe_code)]

pub mod cwclient;
pub mod cwlogs;
pub mod cwsdk;
pub mod prom;
pub mod slack;
pub mod stdout;

pub use cwclient::CwLogsClient;
pub use cwlogs::{LogBackend, LogConfig, LogError, LogRecord, LogSink, MemoryLogBackend, SequenceTokenManager, StreamInfo, TokenRetry};
pub use cwsdk::SdkLogsClient;
pub use slack::{color_for, ChatClient, ChatConfig, ChatError, ChatSink, SlackClient, DEFAULT_SLACK_API_URL};
pub use stdout::RawOutput;

use std::sync::Arc;

use kew_core::NotificationPayload;
use metrics::counter;
use tracing::{error, warn};

/// Per-scope fan-out over all sinks.
pub struct Dispatcher {
    metrics: bool,
    chat: ChatSink,
    log: LogSink,
    raw: Option<Arc<RawOutput>>,
}

impl Dispatcher {
    pub fn new(metrics: bool, chat: ChatSink, log: LogSink, raw: Option<Arc<RawOutput>>) -> Self { Self { metrics, chat, log, raw } }

    /// Dispatcher with every sink turned off.
    pub fn noop() -> Self { Self::new(false, ChatSink::disabled(), LogSink::disabled(), None) }

    pub fn chat(&self) -> &ChatSink { &self.chat }

    pub fn log(&self) -> &LogSink { &self.log }

    pub async fn dispatch(&self, payload: &NotificationPayload) -> Result<(), ChatError> {
        if self.metrics {
            if let Some(ev) = payload.event.as_deref() {
                prom::record_event(ev);
            }
        }

        let chat = self.chat.notify(payload).await;
        if let Err(e) = &chat {
            counter!("kew_sink_errors_total", 1u64, "sink" => "chat");
            warn!(key = %payload.key, channel = %self.chat.channel(), error = %e, "chat delivery failed");
        }

        if let Err(e) = self.log.write(payload).await {
            counter!("kew_sink_errors_total", 1u64, "sink" => "log");
            error!(key = %payload.key, stream = %self.log.stream(), error = %e, "log append failed");
        }

        if let (Some(raw), Some(ev)) = (self.raw.as_ref(), payload.event.as_deref()) {
            if let Err(e) = raw.write_event(ev) {
                counter!("kew_sink_errors_total", 1u64, "sink" => "raw");
                error!(key = %payload.key, error = %e, "raw output failed");
            }
        }

        chat
    }

    /// Send a process-level notice (startup, exit) to the chat and log sinks.
    /// Both outcomes are returned so callers can decide which are fatal.
    pub async fn announce(&self, title: &str, text: &str, status: &str) -> (Result<(), ChatError>, Result<(), LogError>) {
        let chat = self.chat.post(title, text, status).await;
        let log = self.log.write_line(text).await;
        (chat, log)
    }
}
