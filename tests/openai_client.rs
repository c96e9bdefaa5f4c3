//! Integration tests for OpenAiClient against a mock chat completions endpoint

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use curator::client::{ChatClient, OpenAiClient, RateBudget, RateLimiter, RetryingClient};
use curator::models::{ApiError, ChatMessage, Conversation, CuratorError, DispatchRequest, FailureKind};
use curator::Dispatcher;
use serde_json::json;
use wiremock::matchers::{body_partial_json, body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn completion_body(content: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "created": 1234567890,
        "model": "gpt-4o-mini-2024-07-18",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 20, "completion_tokens": 5, "total_tokens": 25}
    })
}

fn conversation(question: &str) -> Conversation {
    Conversation::prompt("You are terse.", question)
}

fn client(server: &MockServer) -> OpenAiClient {
    OpenAiClient::new("sk-test", Some(server.uri()), Some(5)).expect("client")
}

#[tokio::test]
async fn test_completion_request_and_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "model": "gpt-4o-mini",
            "messages": [
                {"role": "system", "content": "You are terse."},
                {"role": "user", "content": "2+2?"}
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("4")))
        .expect(1)
        .mount(&server)
        .await;

    let completion = client(&server)
        .complete("gpt-4o-mini", &conversation("2+2?"))
        .await
        .expect("completion");

    assert_eq!(completion.content, "4");
    assert_eq!(completion.model, "gpt-4o-mini-2024-07-18");
    let usage = completion.usage.expect("usage");
    assert_eq!(usage.total_tokens, 25);
}

#[tokio::test]
async fn test_rate_limited_is_transient_with_hint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "3"))
        .mount(&server)
        .await;

    let err = client(&server)
        .complete("gpt-4o-mini", &conversation("hi"))
        .await
        .unwrap_err();

    assert_eq!(err.retry_after(), Some(3.0));
    assert_eq!(err.kind(), FailureKind::Transient);
}

#[tokio::test]
async fn test_server_error_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(503)
                .set_body_json(json!({"error": {"message": "overloaded", "type": "server_error"}})),
        )
        .mount(&server)
        .await;

    let err = client(&server)
        .complete("gpt-4o-mini", &conversation("hi"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        CuratorError::Api(ApiError::Status { status: 503, ref message }) if message == "overloaded"
    ));
    assert_eq!(err.kind(), FailureKind::Transient);
}

#[tokio::test]
async fn test_auth_failure_is_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": {"message": "Incorrect API key provided", "type": "invalid_request_error"}
        })))
        .mount(&server)
        .await;

    let err = client(&server)
        .complete("gpt-4o-mini", &conversation("hi"))
        .await
        .unwrap_err();

    assert!(matches!(err, CuratorError::Api(ApiError::AuthenticationFailed)));
    assert_eq!(err.kind(), FailureKind::Permanent);
}

#[tokio::test]
async fn test_malformed_response_is_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
        .mount(&server)
        .await;

    let err = client(&server)
        .complete("gpt-4o-mini", &conversation("hi"))
        .await
        .unwrap_err();

    assert!(matches!(err, CuratorError::Api(ApiError::InvalidResponse(_))));
    assert_eq!(err.kind(), FailureKind::Permanent);
}

#[tokio::test]
async fn test_timeout_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion_body("late"))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let client = OpenAiClient::new("sk-test", Some(server.uri()), Some(1)).expect("client");
    let err = client
        .complete("gpt-4o-mini", &conversation("hi"))
        .await
        .unwrap_err();

    assert!(matches!(err, CuratorError::Timeout(_)));
    assert_eq!(err.kind(), FailureKind::Transient);
}

#[tokio::test]
async fn test_retrying_client_recovers_from_rate_limit() {
    let server = MockServer::start().await;
    let request_count = Arc::new(AtomicUsize::new(0));
    let counter = request_count.clone();

    // Throttles twice then succeeds
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(move |_req: &wiremock::Request| {
            let count = counter.fetch_add(1, Ordering::SeqCst);
            if count < 2 {
                ResponseTemplate::new(429).insert_header("retry-after", "0")
            } else {
                ResponseTemplate::new(200).set_body_json(completion_body("finally"))
            }
        })
        .expect(3)
        .mount(&server)
        .await;

    let retrying = RetryingClient::new(client(&server), 3);
    let completion = retrying
        .complete("gpt-4o-mini", &conversation("hi"))
        .await
        .expect("completion");

    assert_eq!(completion.content, "finally");
    assert_eq!(request_count.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_dispatch_against_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains(r#""content":"bad""#))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {"message": "invalid prompt", "type": "invalid_request_error"}
        })))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("ok")))
        .with_priority(2)
        .mount(&server)
        .await;

    let limiter = Arc::new(RateLimiter::new(RateBudget::new(
        100,
        100_000,
        Duration::from_secs(60),
    )));
    let dispatcher =
        Dispatcher::new(Arc::new(client(&server)), Arc::clone(&limiter), "gpt-4o-mini").expect("dispatcher");

    let requests = DispatchRequest::enumerate(vec![
        conversation("first"),
        conversation("bad"),
        Conversation::with_preamble(
            "You are terse.",
            vec![
                ChatMessage::user("q"),
                ChatMessage::assistant("a"),
                ChatMessage::user("third"),
            ],
        ),
    ]);
    let outcomes = dispatcher.dispatch(requests).await;

    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes[0].response(), Some("ok"));
    assert_eq!(outcomes[1].failure_kind(), Some(FailureKind::Permanent));
    assert_eq!(outcomes[2].response(), Some("ok"));
    assert_eq!(limiter.stats().total_grants, 3);
}
