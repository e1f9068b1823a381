//! Durable-log sink and its sequence-token protocol.
//!
//! Appends to a `(group, stream)` pair must carry the stream's current
//! sequence token. Tokens are never cached: each append fetches the token,
//! creating the stream when it does not exist yet, and puts with it. Several
//! writers (threads or processes) may race for the same token; the backend
//! rejects the losers with [`LogError::InvalidSequenceToken`], and only that
//! rejection triggers a re-fetch and retry, bounded by [`TokenRetry`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use kew_core::NotificationPayload;
use metrics::counter;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub timestamp_ms: i64,
    pub message: String,
}

impl LogRecord {
    pub fn now(message: impl Into<String>) -> Self {
        Self { timestamp_ms: chrono::Utc::now().timestamp_millis(), message: message.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub name: String,
    pub token: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("invalid sequence token (expected {expected:?})")]
    InvalidSequenceToken { expected: Option<String> },
    #[error("resource already exists: {0}")]
    AlreadyExists(String),
    #[error("{code}: {message}")]
    Api { code: String, message: String },
    #[error("log http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("log response decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

impl LogError {
    /// Classify a service error code; codes other than the two the token
    /// protocol reacts to become [`LogError::Api`].
    pub fn from_service_code(code: &str, message: String, expected: Option<String>) -> Self {
        match code {
            "InvalidSequenceTokenException" => LogError::InvalidSequenceToken { expected },
            "ResourceAlreadyExistsException" => LogError::AlreadyExists(message),
            _ => LogError::Api { code: code.to_string(), message },
        }
    }
}

/// Request/response surface of the log storage service.
#[async_trait::async_trait]
pub trait LogBackend: Send + Sync {
    async fn describe_groups(&self, prefix: &str) -> Result<Vec<String>, LogError>;
    async fn create_group(&self, name: &str) -> Result<(), LogError>;
    async fn describe_streams(&self, group: &str, prefix: &str) -> Result<Vec<StreamInfo>, LogError>;
    async fn create_stream(&self, group: &str, name: &str) -> Result<(), LogError>;
    /// Append records; returns the next sequence token.
    async fn put_records(&self, group: &str, stream: &str, token: Option<&str>, records: &[LogRecord]) -> Result<Option<String>, LogError>;
}

/// Bound on stale-token retries.
#[derive(Debug, Clone, Copy)]
pub struct TokenRetry {
    /// Total put attempts, including the first.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for TokenRetry {
    fn default() -> Self {
        Self { max_attempts: 5, base_delay: Duration::from_millis(50), max_delay: Duration::from_secs(2) }
    }
}

impl TokenRetry {
    fn delay(&self, attempt: usize) -> Duration {
        let shift = attempt.saturating_sub(1).min(16) as u32;
        self.base_delay.saturating_mul(1u32 << shift).min(self.max_delay)
    }
}

pub struct SequenceTokenManager {
    backend: Arc<dyn LogBackend>,
    retry: TokenRetry,
    /// Groups already confirmed to exist.
    known_groups: Mutex<HashSet<String>>,
}

impl SequenceTokenManager {
    pub fn new(backend: Arc<dyn LogBackend>, retry: TokenRetry) -> Self {
        Self { backend, retry, known_groups: Mutex::new(HashSet::new()) }
    }

    /// Make sure `group` exists, creating it when the describe finds no exact match.
    pub async fn ensure_group(&self, group: &str) -> Result<(), LogError> {
        if self.known_groups.lock().unwrap_or_else(PoisonError::into_inner).contains(group) {
            return Ok(());
        }
        let groups = self.backend.describe_groups(group).await?;
        if !groups.iter().any(|g| g == group) {
            info!(group = %group, "creating log group");
            match self.backend.create_group(group).await {
                Ok(()) | Err(LogError::AlreadyExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.known_groups.lock().unwrap_or_else(PoisonError::into_inner).insert(group.to_string());
        Ok(())
    }

    /// Current token of `stream`; creates the stream (and returns `None`) when absent.
    pub async fn token(&self, group: &str, stream: &str) -> Result<Option<String>, LogError> {
        let streams = self.backend.describe_streams(group, stream).await?;
        if let Some(s) = streams.into_iter().find(|s| s.name == stream) {
            return Ok(s.token);
        }
        info!(group = %group, stream = %stream, "creating log stream");
        match self.backend.create_stream(group, stream).await {
            Ok(()) => Ok(None),
            // Another writer created it first; its token is what we need now.
            Err(LogError::AlreadyExists(_)) => {
                let streams = self.backend.describe_streams(group, stream).await?;
                Ok(streams.into_iter().find(|s| s.name == stream).and_then(|s| s.token))
            }
            Err(e) => Err(e),
        }
    }

    /// Append `records`, re-fetching the token on stale-token rejections.
    pub async fn append(&self, group: &str, stream: &str, records: &[LogRecord]) -> Result<(), LogError> {
        self.ensure_group(group).await?;
        let mut attempt = 1usize;
        loop {
            let token = self.token(group, stream).await?;
            match self.backend.put_records(group, stream, token.as_deref(), records).await {
                Ok(_) => {
                    counter!("kew_log_appends_total", 1u64);
                    return Ok(());
                }
                Err(LogError::InvalidSequenceToken { expected }) if attempt < self.retry.max_attempts => {
                    counter!("kew_log_token_retries_total", 1u64);
                    let delay = self.retry.delay(attempt);
                    info!(group = %group, stream = %stream, attempt, expected = ?expected, delay_ms = delay.as_millis() as u64, "stale sequence token; retrying with a fresh token");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Per-scope durable-log settings.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    pub enabled: bool,
    pub group: String,
    pub stream: String,
}

pub struct LogSink {
    manager: Option<Arc<SequenceTokenManager>>,
    cfg: LogConfig,
}

impl LogSink {
    pub fn new(manager: Arc<SequenceTokenManager>, cfg: LogConfig) -> Self { Self { manager: Some(manager), cfg } }

    pub fn disabled() -> Self { Self { manager: None, cfg: LogConfig::default() } }

    pub fn is_enabled(&self) -> bool { self.cfg.enabled && self.manager.is_some() }

    pub fn stream(&self) -> &str { &self.cfg.stream }

    async fn put(&self, record: LogRecord) -> Result<(), LogError> {
        let Some(m) = self.manager.as_ref().filter(|_| self.cfg.enabled) else { return Ok(()) };
        m.append(&self.cfg.group, &self.cfg.stream, std::slice::from_ref(&record)).await
    }

    pub async fn write(&self, payload: &NotificationPayload) -> Result<(), LogError> {
        debug!(key = %payload.key, stream = %self.cfg.stream, "log append");
        self.put(LogRecord { timestamp_ms: payload.timestamp_ms, message: payload.record.clone() }).await
    }

    /// Append a plain text line stamped with the current time.
    pub async fn write_line(&self, message: &str) -> Result<(), LogError> { self.put(LogRecord::now(message)).await }
}

#[derive(Debug, Default)]
struct MemStream {
    token: Option<String>,
    seq: u64,
    records: Vec<LogRecord>,
}

#[derive(Debug, Default)]
struct MemState {
    groups: HashSet<String>,
    streams: HashMap<(String, String), MemStream>,
    rejections: usize,
}

/// In-process backend with the same token rules as the real service.
/// Used for dry runs (`--cw-endpoint memory`) and tests.
#[derive(Debug, Default)]
pub struct MemoryLogBackend {
    state: Mutex<MemState>,
}

impl MemoryLogBackend {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemState> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    pub fn records(&self, group: &str, stream: &str) -> Vec<LogRecord> {
        self.lock().streams.get(&(group.to_string(), stream.to_string())).map(|s| s.records.clone()).unwrap_or_default()
    }

    /// Number of puts rejected for a stale token.
    pub fn rejections(&self) -> usize { self.lock().rejections }

    pub fn has_group(&self, group: &str) -> bool { self.lock().groups.contains(group) }
}

fn not_found(what: &str) -> LogError {
    LogError::Api { code: "ResourceNotFoundException".into(), message: format!("{} does not exist", what) }
}

#[async_trait::async_trait]
impl LogBackend for MemoryLogBackend {
    async fn describe_groups(&self, prefix: &str) -> Result<Vec<String>, LogError> {
        let mut out: Vec<String> = self.lock().groups.iter().filter(|g| g.starts_with(prefix)).cloned().collect();
        out.sort();
        Ok(out)
    }

    async fn create_group(&self, name: &str) -> Result<(), LogError> {
        if !self.lock().groups.insert(name.to_string()) {
            return Err(LogError::AlreadyExists(name.to_string()));
        }
        Ok(())
    }

    async fn describe_streams(&self, group: &str, prefix: &str) -> Result<Vec<StreamInfo>, LogError> {
        let st = self.lock();
        if !st.groups.contains(group) {
            return Err(not_found(group));
        }
        let mut out: Vec<StreamInfo> = st
            .streams
            .iter()
            .filter(|((g, s), _)| g == group && s.starts_with(prefix))
            .map(|((_, s), m)| StreamInfo { name: s.clone(), token: m.token.clone() })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn create_stream(&self, group: &str, name: &str) -> Result<(), LogError> {
        let mut st = self.lock();
        if !st.groups.contains(group) {
            return Err(not_found(group));
        }
        let key = (group.to_string(), name.to_string());
        if st.streams.contains_key(&key) {
            return Err(LogError::AlreadyExists(name.to_string()));
        }
        st.streams.insert(key, MemStream::default());
        Ok(())
    }

    async fn put_records(&self, group: &str, stream: &str, token: Option<&str>, records: &[LogRecord]) -> Result<Option<String>, LogError> {
        let mut st = self.lock();
        let key = (group.to_string(), stream.to_string());
        let expected = match st.streams.get(&key) {
            Some(s) => s.token.clone(),
            None => return Err(not_found(stream)),
        };
        if expected.as_deref() != token {
            st.rejections += 1;
            warn!(stream = %stream, "memory backend rejected stale token");
            return Err(LogError::InvalidSequenceToken { expected });
        }
        let Some(s) = st.streams.get_mut(&key) else { return Err(not_found(stream)) };
        s.records.extend_from_slice(records);
        s.seq += 1;
        s.token = Some(format!("{:020}", s.seq));
        Ok(s.token.clone())
    }
}
