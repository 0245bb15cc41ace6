//! End-to-end provider tests against a stubbed HTTP server, covering the scenarios from the
//! component design that exercise a full request/response or request/stream round trip
//! rather than pure data transforms (those are covered by the `#[cfg(test)]` unit tests next
//! to each provider).

use futures_util::StreamExt;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use llm_core::provider::{Provider, ProviderConfig};
use llm_core::providers::anthropic::AnthropicProvider;
use llm_core::providers::openai::OpenAiProvider;
use llm_core::{FinishReason, Message, Request};

#[tokio::test]
async fn openai_chat_returns_pong_for_say_pong() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "model": "gpt-4o-mini",
            "choices": [{"message": {"content": "pong"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 9, "completion_tokens": 1, "total_tokens": 10},
        })))
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new(
        ProviderConfig::new()
            .with_api_key("test-key")
            .with_base_url(server.uri()),
    );
    let req = Request::new("gpt-4o-mini", vec![Message::user("Say pong")]);
    let resp = provider.chat(&req).await.unwrap();

    assert_eq!(resp.content, "pong");
    assert_eq!(resp.finish_reason, FinishReason::Stop);
    assert_eq!(resp.usage.total_tokens, 10);
    assert_eq!(resp.provider, "openai");
}

#[tokio::test]
async fn openai_chat_maps_401_to_auth_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new(
        ProviderConfig::new()
            .with_api_key("bad-key")
            .with_base_url(server.uri()),
    );
    let req = Request::new("gpt-4o-mini", vec![Message::user("hi")]);
    let err = provider.chat(&req).await.unwrap_err();

    assert_eq!(err.kind, llm_core::ErrorKind::Auth);
    assert!(!err.retryable);
    assert_eq!(err.status_code, Some(401));
}

#[tokio::test]
async fn anthropic_stream_emits_content_then_finish_then_terminal_usage() {
    let server = MockServer::start().await;
    let body = concat!(
        "event: message_start\n",
        "data: {\"message\":{\"usage\":{\"input_tokens\":7,\"output_tokens\":0}}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n",
        "event: message_delta\n",
        "data: {\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":1}}\n\n",
        "event: message_stop\n",
        "data: {}\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(body.as_bytes().to_vec(), "text/event-stream")
                .insert_header("content-type", "text/event-stream"),
        )
        .mount(&server)
        .await;

    let provider = AnthropicProvider::new(
        ProviderConfig::new()
            .with_api_key("test-key")
            .with_base_url(server.uri()),
    );
    let req = Request::new("claude-3-7-sonnet", vec![Message::user("hi")]);
    let mut stream = provider.stream(&req).await.unwrap();

    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.content, "Hi");
    assert!(!first.done);

    let second = stream.next().await.unwrap().unwrap();
    assert_eq!(second.finish_reason, Some(FinishReason::Stop));

    let third = stream.next().await.unwrap().unwrap();
    assert!(third.done);
    let usage = third.usage.unwrap();
    assert_eq!(usage.prompt_tokens, 7);
    assert_eq!(usage.completion_tokens, 1);
    assert_eq!(usage.total_tokens, 8);

    assert!(stream.next().await.is_none());
}
