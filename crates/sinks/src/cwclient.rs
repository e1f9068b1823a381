//! HTTP client for the CloudWatch Logs JSON protocol (`Logs_20140328.*`).
//!
//! Requests are sent unsigned to the configured endpoint, which is a signing
//! proxy or a local emulator. Direct AWS access goes through
//! [`crate::cwsdk::SdkLogsClient`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::cwlogs::{LogBackend, LogError, LogRecord, StreamInfo};

const CONTENT_TYPE: &str = "application/x-amz-json-1.1";
const TARGET_PREFIX: &str = "Logs_20140328.";

pub struct CwLogsClient {
    http: reqwest::Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "__type", default)]
    kind: String,
    #[serde(alias = "Message", default)]
    message: String,
    #[serde(rename = "expectedSequenceToken", default)]
    expected: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupsPage {
    #[serde(default)]
    log_groups: Vec<GroupEntry>,
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupEntry {
    log_group_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamsPage {
    #[serde(default)]
    log_streams: Vec<StreamEntry>,
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamEntry {
    log_stream_name: String,
    upload_sequence_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct InputEvent<'a> {
    timestamp: i64,
    message: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PutRequest<'a> {
    log_group_name: &'a str,
    log_stream_name: &'a str,
    log_events: Vec<InputEvent<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sequence_token: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PutResponse {
    next_sequence_token: Option<String>,
}

/// Map a service error body to a [`LogError`]. `__type` may carry a
/// namespace prefix separated by `#`.
fn map_error(body: &str, status: reqwest::StatusCode) -> LogError {
    let parsed: ErrorBody = match serde_json::from_str(body) {
        Ok(b) => b,
        Err(_) => return LogError::Api { code: status.to_string(), message: body.to_string() },
    };
    let code = parsed.kind.rsplit('#').next().unwrap_or_default();
    LogError::from_service_code(code, parsed.message, parsed.expected)
}

impl CwLogsClient {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, LogError> {
        let http = reqwest::Client::builder().timeout(std::time::Duration::from_secs(30)).build()?;
        Ok(Self { http, endpoint: endpoint.into() })
    }

    async fn call<B: Serialize + ?Sized>(&self, op: &str, body: &B) -> Result<Value, LogError> {
        debug!(op, "cloudwatch logs request");
        let resp = self
            .http
            .post(&self.endpoint)
            .header("Content-Type", CONTENT_TYPE)
            .header("X-Amz-Target", format!("{}{}", TARGET_PREFIX, op))
            .body(serde_json::to_vec(body)?)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(map_error(&text, status));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait::async_trait]
impl LogBackend for CwLogsClient {
    async fn describe_groups(&self, prefix: &str) -> Result<Vec<String>, LogError> {
        let mut out = Vec::new();
        let mut next: Option<String> = None;
        loop {
            let mut req = serde_json::json!({ "logGroupNamePrefix": prefix });
            if let Some(t) = &next {
                req["nextToken"] = Value::String(t.clone());
            }
            let page: GroupsPage = serde_json::from_value(self.call("DescribeLogGroups", &req).await?)?;
            out.extend(page.log_groups.into_iter().map(|g| g.log_group_name));
            match page.next_token {
                Some(t) if !t.is_empty() => next = Some(t),
                _ => return Ok(out),
            }
        }
    }

    async fn create_group(&self, name: &str) -> Result<(), LogError> {
        self.call("CreateLogGroup", &serde_json::json!({ "logGroupName": name })).await.map(|_| ())
    }

    async fn describe_streams(&self, group: &str, prefix: &str) -> Result<Vec<StreamInfo>, LogError> {
        let mut out = Vec::new();
        let mut next: Option<String> = None;
        loop {
            let mut req = serde_json::json!({ "logGroupName": group, "logStreamNamePrefix": prefix });
            if let Some(t) = &next {
                req["nextToken"] = Value::String(t.clone());
            }
            let page: StreamsPage = serde_json::from_value(self.call("DescribeLogStreams", &req).await?)?;
            out.extend(page.log_streams.into_iter().map(|s| StreamInfo { name: s.log_stream_name, token: s.upload_sequence_token }));
            match page.next_token {
                Some(t) if !t.is_empty() => next = Some(t),
                _ => return Ok(out),
            }
        }
    }

    async fn create_stream(&self, group: &str, name: &str) -> Result<(), LogError> {
        self.call("CreateLogStream", &serde_json::json!({ "logGroupName": group, "logStreamName": name })).await.map(|_| ())
    }

    async fn put_records(&self, group: &str, stream: &str, token: Option<&str>, records: &[LogRecord]) -> Result<Option<String>, LogError> {
        let req = PutRequest {
            log_group_name: group,
            log_stream_name: stream,
            log_events: records.iter().map(|r| InputEvent { timestamp: r.timestamp_ms, message: &r.message }).collect(),
            sequence_token: token,
        };
        let v = self.call("PutLogEvents", &req).await?;
        if v.is_null() {
            return Ok(None);
        }
        let resp: PutResponse = serde_json::from_value(v)?;
        Ok(resp.next_sequence_token)
    }
}
