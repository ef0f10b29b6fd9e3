use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use consensus_harness::gateway::openrouter::{ChatProvider, OpenRouterAdapter, OpenRouterSettings};
use consensus_harness::gateway::usage::{CallOutcome, UsageRecord};
use consensus_harness::gateway::{
    Attribution, ChatGateway, ChatRequest, FinishReason, Message, ProviderError, ProviderGateway,
    UsageLedger, UsageSink,
};
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn adapter(server: &MockServer) -> OpenRouterAdapter {
    OpenRouterAdapter::new(
        OpenRouterSettings::new("sk-test")
            .base_url(format!("{}/", server.uri()))
            .request_timeout(Duration::from_secs(5)),
    )
    .unwrap()
}

fn score_request(model: &str) -> ChatRequest {
    ChatRequest::new(
        model,
        vec![
            Message::system("You grade ranked lists."),
            Message::user("Rate this list from 0 to 10."),
        ],
        Attribution::new("test"),
    )
}

fn completion(body: serde_json::Value) -> Mock {
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
}

#[derive(Default)]
struct CollectingSink(Mutex<Vec<UsageRecord>>);

#[async_trait]
impl UsageSink for CollectingSink {
    async fn record(&self, record: UsageRecord) {
        self.0.lock().unwrap().push(record);
    }
}

#[tokio::test]
async fn json_mode_request_reaches_the_wire_and_reply_is_read() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "model": "openai/gpt-5-mini",
            "max_tokens": 768,
            "response_format": {"type": "json_object"}
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-request-id", "req-1")
                .set_body_json(json!({
                    "choices": [{
                        "message": { "content": "{\"score\": 7, \"rationale\": \"on topic\"}" },
                        "finish_reason": "stop"
                    }],
                    "usage": { "prompt_tokens": 120, "completion_tokens": 18 }
                })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let req = score_request("openai/gpt-5-mini").max_tokens(768).json();
    let resp = adapter(&server).chat(&req).await.unwrap();
    assert_eq!(resp.content, "{\"score\": 7, \"rationale\": \"on topic\"}");
    assert_eq!(resp.finish_reason, FinishReason::Stop);
    assert_eq!((resp.input_tokens, resp.output_tokens), (120, 18));
    assert_eq!(resp.request_id.as_deref(), Some("req-1"));
}

#[tokio::test]
async fn missing_usage_counts_as_zero_tokens() {
    let server = MockServer::start().await;
    completion(json!({
        "choices": [{ "message": { "content": "{\"score\": 3}" }, "finish_reason": "stop" }]
    }))
    .mount(&server)
    .await;

    let resp = adapter(&server)
        .chat(&score_request("x/judge"))
        .await
        .unwrap();
    assert_eq!((resp.input_tokens, resp.output_tokens), (0, 0));
}

#[tokio::test]
async fn score_object_delivered_as_tool_call_is_used() {
    let server = MockServer::start().await;
    let args = r#"{"score": 4, "rationale": "thin"}"#;
    completion(json!({
        "choices": [{
            "message": { "content": null, "tool_calls": [{"function": {"arguments": args}}] },
            "finish_reason": "tool_calls"
        }]
    }))
    .mount(&server)
    .await;

    let resp = adapter(&server)
        .chat(&score_request("x/judge").json())
        .await
        .unwrap();
    assert_eq!(resp.content, args);
    assert_eq!(resp.finish_reason, FinishReason::ToolCalls);
}

#[tokio::test]
async fn declining_replies_are_refusals() {
    let server = MockServer::start().await;
    completion(json!({
        "choices": [{
            "message": { "content": "I cannot evaluate this list." },
            "finish_reason": "stop"
        }]
    }))
    .up_to_n_times(1)
    .mount(&server)
    .await;
    completion(json!({
        "choices": [{ "message": { "content": "" }, "finish_reason": "content_filter" }]
    }))
    .mount(&server)
    .await;

    let adapter = adapter(&server);
    for _ in 0..2 {
        let err = adapter.chat(&score_request("x/judge")).await.unwrap_err();
        assert!(matches!(err, ProviderError::Refused(_)), "got {err:?}");
        assert_eq!(err.code(), "refused");
        assert!(!err.is_retryable());
    }
}

#[tokio::test]
async fn rate_limit_keeps_retry_after_and_provider_identifiers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("x-request-id", "abc123")
                .insert_header("retry-after", "7")
                .set_body_json(json!({
                    "error": { "message": "rate limited", "code": "rate_limit_exceeded" }
                })),
        )
        .mount(&server)
        .await;

    let err = adapter(&server)
        .chat(&score_request("x/judge"))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.code(), "rate_limited");
    assert_eq!(err.request_id(), Some("abc123"));
    match err {
        ProviderError::RateLimited {
            retry_after,
            context,
        } => {
            assert_eq!(retry_after, Duration::from_secs(7));
            assert_eq!(context.provider_code.as_deref(), Some("rate_limit_exceeded"));
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
}

#[tokio::test]
async fn server_errors_are_retryable_and_client_errors_are_not() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "message": "unknown model", "code": 400 }
        })))
        .mount(&server)
        .await;

    let adapter = adapter(&server);
    let first = adapter.chat(&score_request("x/judge")).await.unwrap_err();
    assert!(first.is_retryable());
    assert_eq!(first.code(), "unavailable");
    assert!(first.to_string().contains("upstream unavailable"));

    let second = adapter.chat(&score_request("x/judge")).await.unwrap_err();
    assert!(!second.is_retryable());
    match second {
        ProviderError::Rejected {
            status,
            message,
            context,
        } => {
            assert_eq!(status, 400);
            assert_eq!(message, "unknown model");
            assert_eq!(context.provider_code.as_deref(), Some("400"));
        }
        other => panic!("expected Rejected, got {other:?}"),
    }
}

#[tokio::test]
async fn oversized_input_never_leaves_the_process() {
    let server = MockServer::start().await;
    let req = ChatRequest::new(
        "x/judge",
        vec![Message::user("x".repeat(500_001))],
        Attribution::new("test"),
    );
    let err = adapter(&server).chat(&req).await.unwrap_err();
    assert!(matches!(err, ProviderError::TooLarge { chars: 500_001, .. }));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn gateway_makes_one_call_and_records_attributed_usage() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(500)
                .insert_header("x-request-id", "req-9")
                .set_body_json(json!({ "error": { "message": "transient", "code": 500 } })),
        )
        .mount(&server)
        .await;

    let sink = Arc::new(CollectingSink::default());
    let gateway = ProviderGateway::new(adapter(&server), sink.clone());
    let run_id = Uuid::new_v4();
    let req = ChatRequest::new(
        "anthropic/claude-haiku",
        vec![Message::user("rate")],
        Attribution::new("test").with_run(Some(run_id)).with_backend("haiku"),
    );

    let err = gateway.chat(req).await.unwrap_err();
    assert!(err.is_retryable());

    // Retries belong to the sampling orchestrator, not the gateway.
    assert_eq!(server.received_requests().await.unwrap().len(), 1);

    let records = sink.0.lock().unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.provider, "openrouter");
    assert_eq!(record.outcome, CallOutcome::Failed { code: "unavailable" });
    assert_eq!(record.request_id.as_deref(), Some("req-9"));
    assert_eq!(record.model, "anthropic/claude-haiku");
    assert_eq!(record.run_id, Some(run_id));
    assert_eq!(record.backend_id.as_deref(), Some("haiku"));
    assert_eq!(record.caller, "test");
}

#[tokio::test]
async fn ledger_totals_successful_calls_for_the_run() {
    let server = MockServer::start().await;
    completion(json!({
        "choices": [{ "message": { "content": "{\"score\": 6}" }, "finish_reason": "stop" }],
        "usage": { "prompt_tokens": 40, "completion_tokens": 6 }
    }))
    .mount(&server)
    .await;

    let ledger = Arc::new(UsageLedger::new());
    let gateway = ProviderGateway::new(adapter(&server), ledger.clone());
    let run_id = Uuid::new_v4();
    for _ in 0..2 {
        let req = score_request("x/judge");
        let req = ChatRequest {
            attribution: Attribution::new("test").with_run(Some(run_id)),
            ..req
        };
        assert_eq!(gateway.chat(req).await.unwrap().content, "{\"score\": 6}");
    }

    let usage = ledger.run(run_id);
    assert_eq!(usage.calls, 2);
    assert_eq!(usage.failed_calls, 0);
    assert_eq!((usage.input_tokens, usage.output_tokens), (80, 12));
}
