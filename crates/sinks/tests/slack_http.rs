#![forbid(unsafe_code)]

use std::sync::Arc;

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use kew_sinks::{ChatClient, ChatConfig, ChatError, ChatSink, SlackClient};

async fn slack(server: &MockServer) -> SlackClient { SlackClient::new("xoxb-test", server.uri()).unwrap() }

#[tokio::test]
async fn posts_attachment_with_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat.postMessage"))
        .and(header("authorization", "Bearer xoxb-test"))
        .and(body_partial_json(json!({
            "channel": "#ops",
            "as_user": true,
            "attachments": [{"color": "warning", "fields": [{"title": "kubernetes event : created", "value": "body"}]}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    slack(&server).await.post_message("#ops", "kubernetes event : created", "body", "warning").await.unwrap();
}

#[tokio::test]
async fn channel_not_found_is_distinguished() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": false, "error": "channel_not_found"})))
        .mount(&server)
        .await;
    let err = slack(&server).await.post_message("#nope", "t", "b", "good").await.unwrap_err();
    assert!(matches!(err, ChatError::ChannelNotFound(ref c) if c == "#nope"));
}

#[tokio::test]
async fn other_api_errors_are_plain() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": false, "error": "invalid_auth"})))
        .mount(&server)
        .await;
    let err = slack(&server).await.post_message("#ops", "t", "b", "good").await.unwrap_err();
    assert!(matches!(err, ChatError::Api(ref m) if m == "invalid_auth"));
}

#[tokio::test]
async fn sink_reroutes_to_default_channel() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"channel": "#team-gone"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": false, "error": "channel_not_found"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"channel": "#default", "attachments": [{"color": "danger"}]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let client: Arc<dyn ChatClient> = Arc::new(slack(&server).await);
    let sink = ChatSink::new(client, ChatConfig { enabled: true, channel: "#team-gone".into(), default_channel: "#default".into() });
    sink.post("kubernetes event : deleted", "Event a/b has been deleted.", "Danger").await.unwrap();
}
