#![forbid(unsafe_code)]

use std::io::Write;
use std::sync::{Arc, Mutex};

use k8s_openapi::api::core::v1::Event;
use kew_core::{Action, NotificationPayload};
use kew_sinks::{
    ChatClient, ChatConfig, ChatError, ChatSink, Dispatcher, LogConfig, LogSink, MemoryLogBackend, RawOutput, SequenceTokenManager, TokenRetry,
};

struct FailingChat {
    calls: Mutex<usize>,
}

#[async_trait::async_trait]
impl ChatClient for FailingChat {
    async fn post_message(&self, _: &str, _: &str, _: &str, _: &str) -> Result<(), ChatError> {
        *self.calls.lock().unwrap() += 1;
        Err(ChatError::Api("rate_limited".into()))
    }
}

#[derive(Clone, Default)]
struct Buf(Arc<Mutex<Vec<u8>>>);

impl Write for Buf {
    fn write(&mut self, b: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(b);
        Ok(b.len())
    }
    fn flush(&mut self) -> std::io::Result<()> { Ok(()) }
}

fn payload() -> NotificationPayload {
    let mut ev = Event::default();
    ev.reason = Some("OOMKilling".into());
    NotificationPayload {
        key: "default/oom.1".into(),
        action: Action::Created,
        status: "Warning".into(),
        text: "reason: OOMKilling".into(),
        record: r#"{"reason":"OOMKilling"}"#.into(),
        timestamp_ms: 1_700_000_000_000,
        event: Some(Arc::new(ev)),
    }
}

#[tokio::test]
async fn chat_failure_does_not_block_other_sinks() {
    let chat = Arc::new(FailingChat { calls: Mutex::new(0) });
    let backend = Arc::new(MemoryLogBackend::new());
    let mgr = Arc::new(SequenceTokenManager::new(backend.clone(), TokenRetry::default()));
    let buf = Buf::default();
    let d = Dispatcher::new(
        true,
        ChatSink::new(chat.clone(), ChatConfig { enabled: true, channel: "#ops".into(), default_channel: "#ops".into() }),
        LogSink::new(mgr, LogConfig { enabled: true, group: "kube-event-watcher".into(), stream: "event".into() }),
        Some(Arc::new(RawOutput::new(Box::new(buf.clone())))),
    );

    let err = d.dispatch(&payload()).await.unwrap_err();
    assert!(matches!(err, ChatError::Api(_)));
    assert_eq!(*chat.calls.lock().unwrap(), 1);

    let records = backend.records("kube-event-watcher", "event");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].message, r#"{"reason":"OOMKilling"}"#);
    assert_eq!(records[0].timestamp_ms, 1_700_000_000_000);
    assert_eq!(String::from_utf8(buf.0.lock().unwrap().clone()).unwrap().lines().count(), 1);
}

#[tokio::test]
async fn log_failure_is_absorbed() {
    struct Broken;
    #[async_trait::async_trait]
    impl kew_sinks::LogBackend for Broken {
        async fn describe_groups(&self, _: &str) -> Result<Vec<String>, kew_sinks::LogError> {
            Err(kew_sinks::LogError::Api { code: "AccessDeniedException".into(), message: "no".into() })
        }
        async fn create_group(&self, _: &str) -> Result<(), kew_sinks::LogError> { Ok(()) }
        async fn describe_streams(&self, _: &str, _: &str) -> Result<Vec<kew_sinks::StreamInfo>, kew_sinks::LogError> { Ok(vec![]) }
        async fn create_stream(&self, _: &str, _: &str) -> Result<(), kew_sinks::LogError> { Ok(()) }
        async fn put_records(&self, _: &str, _: &str, _: Option<&str>, _: &[kew_sinks::LogRecord]) -> Result<Option<String>, kew_sinks::LogError> {
            Ok(None)
        }
    }
    let mgr = Arc::new(SequenceTokenManager::new(Arc::new(Broken), TokenRetry::default()));
    let d = Dispatcher::new(false, ChatSink::disabled(), LogSink::new(mgr, LogConfig { enabled: true, group: "g".into(), stream: "s".into() }), None);
    d.dispatch(&payload()).await.unwrap();
}

#[tokio::test]
async fn announce_reports_both_outcomes() {
    let backend = Arc::new(MemoryLogBackend::new());
    let mgr = Arc::new(SequenceTokenManager::new(backend.clone(), TokenRetry::default()));
    let d = Dispatcher::new(false, ChatSink::disabled(), LogSink::new(mgr, LogConfig { enabled: true, group: "g".into(), stream: "event".into() }), None);
    let (chat, log) = d.announce("kube-event-watcher", "application start", "Normal").await;
    chat.unwrap();
    log.unwrap();
    assert_eq!(backend.records("g", "event")[0].message, "application start");
}
