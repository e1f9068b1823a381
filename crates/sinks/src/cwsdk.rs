//! CloudWatch Logs backend on the AWS SDK.
//!
//! Credentials and region come from the SDK's default provider chain
//! (environment, shared config/credentials files, web identity, IMDS), so the
//! process talks to CloudWatch directly without a signing proxy.

use aws_sdk_cloudwatchlogs::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_cloudwatchlogs::operation::create_log_group::CreateLogGroupError;
use aws_sdk_cloudwatchlogs::operation::create_log_stream::CreateLogStreamError;
use aws_sdk_cloudwatchlogs::operation::put_log_events::PutLogEventsError;
use aws_sdk_cloudwatchlogs::types::InputLogEvent;
use aws_sdk_cloudwatchlogs::Client;
use tracing::{debug, info};

use crate::cwlogs::{LogBackend, LogError, LogRecord, StreamInfo};

pub struct SdkLogsClient {
    client: Client,
}

impl SdkLogsClient {
    pub fn new(client: Client) -> Self { Self { client } }

    /// Client from the default AWS configuration chain.
    pub async fn from_env() -> Self {
        let cfg = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        info!(region = ?cfg.region().map(|r| r.as_ref().to_string()), "cloudwatch logs via aws sdk");
        Self::new(Client::new(&cfg))
    }
}

/// Any service error without a dedicated [`LogError`] variant.
fn service_error<E>(err: E) -> LogError
where
    E: ProvideErrorMetadata + std::error::Error,
{
    let message = err.message().map(str::to_string).unwrap_or_else(|| DisplayErrorContext(&err).to_string());
    LogError::from_service_code(err.code().unwrap_or("Unhandled"), message, None)
}

fn create_group_error(err: CreateLogGroupError) -> LogError {
    if err.is_resource_already_exists_exception() {
        return LogError::AlreadyExists(err.message().unwrap_or_default().to_string());
    }
    service_error(err)
}

fn create_stream_error(err: CreateLogStreamError) -> LogError {
    if err.is_resource_already_exists_exception() {
        return LogError::AlreadyExists(err.message().unwrap_or_default().to_string());
    }
    service_error(err)
}

fn put_error(err: PutLogEventsError) -> LogError {
    match &err {
        PutLogEventsError::InvalidSequenceTokenException(e) => {
            LogError::InvalidSequenceToken { expected: e.expected_sequence_token().map(str::to_string) }
        }
        _ => service_error(err),
    }
}

fn input_events(records: &[LogRecord]) -> Result<Vec<InputLogEvent>, LogError> {
    records
        .iter()
        .map(|r| {
            InputLogEvent::builder()
                .timestamp(r.timestamp_ms)
                .message(r.message.clone())
                .build()
                .map_err(|e| LogError::Api { code: "InvalidParameterException".into(), message: e.to_string() })
        })
        .collect()
}

#[async_trait::async_trait]
impl LogBackend for SdkLogsClient {
    async fn describe_groups(&self, prefix: &str) -> Result<Vec<String>, LogError> {
        let mut out = Vec::new();
        let mut next: Option<String> = None;
        loop {
            let page = self
                .client
                .describe_log_groups()
                .log_group_name_prefix(prefix)
                .set_next_token(next.take())
                .send()
                .await
                .map_err(|e| service_error(e.into_service_error()))?;
            out.extend(page.log_groups().iter().filter_map(|g| g.log_group_name().map(str::to_string)));
            match page.next_token() {
                Some(t) if !t.is_empty() => next = Some(t.to_string()),
                _ => return Ok(out),
            }
        }
    }

    async fn create_group(&self, name: &str) -> Result<(), LogError> {
        debug!(group = %name, "creating log group");
        self.client
            .create_log_group()
            .log_group_name(name)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| create_group_error(e.into_service_error()))
    }

    async fn describe_streams(&self, group: &str, prefix: &str) -> Result<Vec<StreamInfo>, LogError> {
        let mut out = Vec::new();
        let mut next: Option<String> = None;
        loop {
            let page = self
                .client
                .describe_log_streams()
                .log_group_name(group)
                .log_stream_name_prefix(prefix)
                .set_next_token(next.take())
                .send()
                .await
                .map_err(|e| service_error(e.into_service_error()))?;
            out.extend(page.log_streams().iter().filter_map(|s| {
                s.log_stream_name().map(|name| StreamInfo { name: name.to_string(), token: s.upload_sequence_token().map(str::to_string) })
            }));
            match page.next_token() {
                Some(t) if !t.is_empty() => next = Some(t.to_string()),
                _ => return Ok(out),
            }
        }
    }

    async fn create_stream(&self, group: &str, name: &str) -> Result<(), LogError> {
        debug!(group = %group, stream = %name, "creating log stream");
        self.client
            .create_log_stream()
            .log_group_name(group)
            .log_stream_name(name)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| create_stream_error(e.into_service_error()))
    }

    async fn put_records(&self, group: &str, stream: &str, token: Option<&str>, records: &[LogRecord]) -> Result<Option<String>, LogError> {
        let out = self
            .client
            .put_log_events()
            .log_group_name(group)
            .log_stream_name(stream)
            .set_sequence_token(token.map(str::to_string))
            .set_log_events(Some(input_events(records)?))
            .send()
            .await
            .map_err(|e| put_error(e.into_service_error()))?;
        Ok(out.next_sequence_token().map(str::to_string))
    }
}
