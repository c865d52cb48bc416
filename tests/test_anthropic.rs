//! Integration tests for the Anthropic provider
//!
//! Drives the client against a mock Messages API and checks request shape,
//! response conversion and the mapping of HTTP failures onto `LlmError`.

use email_agent_pipeline::config::LlmSection;
use email_agent_pipeline::llm::{
    create_provider, AnthropicConfig, AnthropicProvider, CompletionRequest, FinishReason,
    LlmError, LlmProvider, Message, ResponseFormat,
};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config(base_url: &str) -> AnthropicConfig {
    AnthropicConfig {
        api_key: "test-api-key".to_string(),
        base_url: base_url.to_string(),
        timeout: Duration::from_secs(5),
        version: "2023-06-01".to_string(),
        health_check_model: "claude-3-5-haiku-20241022".to_string(),
    }
}

fn test_request() -> CompletionRequest {
    let mut request = CompletionRequest::new(
        "claude-3-5-haiku-20241022",
        vec![
            Message::system("You classify inbound email."),
            Message::user("Subject: Invoice #4821 is overdue"),
        ],
    );
    request.max_tokens = Some(200);
    request.temperature = Some(0.2);
    request
}

fn text_response(text: &str, stop_reason: &str) -> serde_json::Value {
    json!({
        "id": "msg_123",
        "type": "message",
        "role": "assistant",
        "content": [{ "type": "text", "text": text }],
        "model": "claude-3-5-haiku-20241022",
        "stop_reason": stop_reason,
        "usage": { "input_tokens": 12, "output_tokens": 8 }
    })
}

async fn provider_for(server: &MockServer) -> AnthropicProvider {
    AnthropicProvider::new(test_config(&server.uri())).unwrap()
}

#[tokio::test]
async fn test_successful_completion() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/messages"))
        .and(header("x-api-key", "test-api-key"))
        .and(header("anthropic-version", "2023-06-01"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(text_response("billing, 90% confident", "end_turn")),
        )
        .mount(&mock_server)
        .await;

    let provider = provider_for(&mock_server).await;
    let mut request = test_request();
    request
        .metadata
        .insert("stage_id".to_string(), "classify".to_string());

    let response = provider.complete(request).await.unwrap();

    assert_eq!(response.content.as_deref(), Some("billing, 90% confident"));
    assert_eq!(response.model, "claude-3-5-haiku-20241022");
    assert_eq!(response.usage.prompt_tokens, 12);
    assert_eq!(response.usage.completion_tokens, 8);
    assert_eq!(response.usage.total_tokens, 20);
    assert_eq!(response.finish_reason, FinishReason::Stop);
    assert_eq!(response.metadata["stage_id"], "classify");
}

#[tokio::test]
async fn test_system_message_sent_as_top_level_field() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/messages"))
        .and(body_partial_json(json!({
            "system": "You classify inbound email.",
            "max_tokens": 200,
            "messages": [{ "role": "user", "content": "Subject: Invoice #4821 is overdue" }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(text_response("ok", "end_turn")))
        .expect(1)
        .mount(&mock_server)
        .await;

    let provider = provider_for(&mock_server).await;
    assert!(provider.complete(test_request()).await.is_ok());
}

#[tokio::test]
async fn test_json_mode_extends_system_prompt() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/messages"))
        .and(body_partial_json(json!({
            "system": "You classify inbound email.\n\nRespond with a single JSON object and nothing else."
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(text_response(r#"{"category":"billing"}"#, "end_turn")),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let provider = provider_for(&mock_server).await;
    let mut request = test_request();
    request.response_format = Some(ResponseFormat::Json);

    let response = provider.complete(request).await.unwrap();
    assert_eq!(response.content.as_deref(), Some(r#"{"category":"billing"}"#));
}

#[tokio::test]
async fn test_multiple_text_blocks_are_joined() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [
                { "type": "text", "text": "First part. " },
                { "type": "tool_use", "id": "toolu_1" },
                { "type": "text", "text": "Second part." }
            ],
            "model": "claude-3-5-haiku-20241022",
            "stop_reason": "max_tokens",
            "usage": { "input_tokens": 10, "output_tokens": 20 }
        })))
        .mount(&mock_server)
        .await;

    let provider = provider_for(&mock_server).await;
    let response = provider.complete(test_request()).await.unwrap();

    assert_eq!(response.content.as_deref(), Some("First part. Second part."));
    assert_eq!(response.finish_reason, FinishReason::Length);
}

#[tokio::test]
async fn test_authentication_failure() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(ResponseTemplate::new(401).set_body_string("Invalid API key"))
        .mount(&mock_server)
        .await;

    let provider = provider_for(&mock_server).await;

    match provider.complete(test_request()).await {
        Err(LlmError::AuthenticationFailed(msg)) => {
            assert!(msg.contains("401"));
            assert!(msg.contains("Invalid API key"));
        }
        other => panic!("expected AuthenticationFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_rate_limit() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(ResponseTemplate::new(429).set_body_string("Rate limit exceeded"))
        .mount(&mock_server)
        .await;

    let provider = provider_for(&mock_server).await;

    assert!(matches!(
        provider.complete(test_request()).await,
        Err(LlmError::RateLimitExceeded(_))
    ));
}

#[tokio::test]
async fn test_unknown_model() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(ResponseTemplate::new(404).set_body_string("model: claude-nope"))
        .mount(&mock_server)
        .await;

    let provider = provider_for(&mock_server).await;

    match provider.complete(test_request()).await {
        Err(LlmError::ModelNotFound(msg)) => assert!(msg.contains("claude-nope")),
        other => panic!("expected ModelNotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn test_server_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(ResponseTemplate::new(500).set_body_string("overloaded"))
        .mount(&mock_server)
        .await;

    let provider = provider_for(&mock_server).await;

    match provider.complete(test_request()).await {
        Err(LlmError::ApiError(msg)) => {
            assert!(msg.contains("500"));
            assert!(msg.contains("overloaded"));
        }
        other => panic!("expected ApiError, got {other:?}"),
    }
}

#[tokio::test]
async fn test_empty_content_is_invalid() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [],
            "model": "claude-3-5-haiku-20241022",
            "stop_reason": "end_turn",
            "usage": { "input_tokens": 10, "output_tokens": 0 }
        })))
        .mount(&mock_server)
        .await;

    let provider = provider_for(&mock_server).await;

    assert!(matches!(
        provider.complete(test_request()).await,
        Err(LlmError::InvalidResponse(_))
    ));
}

#[tokio::test]
async fn test_malformed_body_is_invalid() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&mock_server)
        .await;

    let provider = provider_for(&mock_server).await;

    assert!(matches!(
        provider.complete(test_request()).await,
        Err(LlmError::InvalidResponse(_))
    ));
}

#[tokio::test]
async fn test_unreachable_server_is_network_error() {
    let mock_server = MockServer::start().await;
    let uri = mock_server.uri();
    drop(mock_server);

    let provider = AnthropicProvider::new(test_config(&uri)).unwrap();

    assert!(matches!(
        provider.complete(test_request()).await,
        Err(LlmError::NetworkError(_))
    ));
}

#[tokio::test]
async fn test_health_check() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/messages"))
        .and(body_partial_json(json!({
            "model": "claude-3-5-haiku-20241022",
            "max_tokens": 1
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(text_response("pong", "max_tokens")))
        .expect(1)
        .mount(&mock_server)
        .await;

    let provider = provider_for(&mock_server).await;
    assert!(provider.health_check().await.is_ok());
}

#[tokio::test]
async fn test_health_check_reports_auth_failure() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
        .mount(&mock_server)
        .await;

    let provider = provider_for(&mock_server).await;
    assert!(matches!(
        provider.health_check().await,
        Err(LlmError::AuthenticationFailed(_))
    ));
}

#[test]
fn test_provider_requires_api_key() {
    let mut config = test_config("http://localhost");
    config.api_key.clear();
    assert!(matches!(
        AnthropicProvider::new(config),
        Err(LlmError::NotConfigured(_))
    ));
}

#[tokio::test]
async fn test_create_provider_from_section() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/messages"))
        .and(header("x-api-key", "sk-from-env"))
        .respond_with(ResponseTemplate::new(200).set_body_json(text_response("ok", "end_turn")))
        .expect(1)
        .mount(&mock_server)
        .await;

    std::env::set_var("EMAIL_PIPELINE_ANTHROPIC_TEST_KEY", "sk-from-env");
    let section = LlmSection {
        provider: "Anthropic".to_string(),
        api_key_env: "EMAIL_PIPELINE_ANTHROPIC_TEST_KEY".to_string(),
        default_model: "claude-3-5-haiku-20241022".to_string(),
        base_url: Some(mock_server.uri()),
        timeout_secs: 5,
    };

    let provider = create_provider(&section).unwrap();

    assert_eq!(provider.name(), "anthropic");
    assert!(provider.complete(test_request()).await.is_ok());
}

#[test]
fn test_create_provider_rejects_unknown_or_unconfigured() {
    let mut section = LlmSection {
        provider: "anthropic".to_string(),
        api_key_env: "EMAIL_PIPELINE_ANTHROPIC_MISSING_KEY".to_string(),
        default_model: "claude-3-5-haiku-20241022".to_string(),
        base_url: None,
        timeout_secs: 5,
    };
    std::env::remove_var("EMAIL_PIPELINE_ANTHROPIC_MISSING_KEY");
    assert!(matches!(
        create_provider(&section),
        Err(LlmError::NotConfigured(_))
    ));

    section.provider = "carrier-pigeon".to_string();
    match create_provider(&section) {
        Err(LlmError::NotConfigured(msg)) => assert!(msg.contains("carrier-pigeon")),
        Err(other) => panic!("expected NotConfigured, got {other:?}"),
        Ok(_) => panic!("unknown provider accepted"),
    }
}
