use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use ulid::Ulid;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use arbiter::engine::Engine;
use arbiter::model::{Reservation, ReservationStatus, Span};
use arbiter::notify::NotifyHub;
use arbiter::oracle::{LlmOracle, Oracle, OracleAdapter, OracleError};

// 2027-01-15 09:00 UTC
const JAN15_9AM: i64 = 1_800_003_600_000;
const HOUR: i64 = 3_600_000;

fn completion(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop"
        }]
    }))
}

fn oracle_for(server: &MockServer, api_key: Option<&str>, timeout: Duration) -> LlmOracle {
    LlmOracle::new(
        server.uri(),
        api_key.map(str::to_string),
        "test-model".to_string(),
        timeout,
        Arc::new(reqwest::Client::new()),
    )
}

fn reservation(purpose: &str, priority: u8) -> Reservation {
    Reservation {
        id: Ulid::new(),
        requester_id: "r".into(),
        server_id: Ulid::new(),
        request_text: purpose.into(),
        purpose: purpose.into(),
        span: Span::new(JAN15_9AM, JAN15_9AM + HOUR),
        priority,
        status: ReservationStatus::Confirmed,
        rejection_reason: None,
        judgment_reason: None,
        created_at: JAN15_9AM,
        updated_at: JAN15_9AM,
    }
}

#[tokio::test]
async fn parses_intent_from_chat_completion() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(completion(
            "Here is the JSON:\n{\"purpose\": \"fine-tune llama\", \
             \"start_time\": \"2027-01-15 09:00\", \"end_time\": \"2027-01-15 13:00\", \
             \"server_preference\": \"a100\"}",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let oracle = oracle_for(&server, Some("sk-test"), Duration::from_secs(5));
    let intent = oracle
        .parse_intent("fine-tune llama tomorrow 9-13 on the a100", JAN15_9AM - 24 * HOUR)
        .await
        .unwrap();
    assert_eq!(intent.purpose, "fine-tune llama");
    assert_eq!(intent.span, Span::new(JAN15_9AM, JAN15_9AM + 4 * HOUR));
    assert_eq!(intent.preference.as_deref(), Some("a100"));
}

#[tokio::test]
async fn parses_score_and_judgment() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("Rate the priority"))
        .respond_with(completion("85"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("Two GPU server reservations overlap"))
        .respond_with(completion(
            "{\"recommend_new\": true, \"reason\": \"conference deadline outranks a demo\"}",
        ))
        .mount(&server)
        .await;

    let oracle = oracle_for(&server, None, Duration::from_secs(5));
    assert_eq!(oracle.score_priority("paper deadline", 4.0).await.unwrap(), 85);
    let judgment = oracle
        .judge_conflict(&reservation("paper deadline", 85), &reservation("demo", 40))
        .await
        .unwrap();
    assert!(judgment.prefer_new);
    assert_eq!(judgment.reason, "conference deadline outranks a demo");
}

#[tokio::test]
async fn upstream_error_status_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let oracle = oracle_for(&server, None, Duration::from_secs(5));
    match oracle.score_priority("x", 1.0).await {
        Err(OracleError::Upstream { status, message }) => {
            assert_eq!(status, 503);
            assert_eq!(message, "overloaded");
        }
        other => panic!("expected upstream error, got {other:?}"),
    }
}

#[tokio::test]
async fn unusable_reply_is_invalid_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(completion("I would rather not say."))
        .mount(&server)
        .await;

    let oracle = oracle_for(&server, None, Duration::from_secs(5));
    assert!(matches!(
        oracle.parse_intent("train", JAN15_9AM).await,
        Err(OracleError::InvalidResponse(_))
    ));
    assert!(matches!(
        oracle.score_priority("train", 1.0).await,
        Err(OracleError::InvalidResponse(_))
    ));
}

#[tokio::test]
async fn slow_upstream_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(completion("50").set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let oracle = oracle_for(&server, None, Duration::from_millis(100));
    assert!(matches!(
        oracle.score_priority("x", 1.0).await,
        Err(OracleError::Timeout(100))
    ));
}

#[tokio::test]
async fn adapter_falls_back_when_upstream_is_down() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let adapter = OracleAdapter::new(
        Arc::new(oracle_for(&server, None, Duration::from_secs(5))),
        Duration::from_secs(5),
    );
    assert_eq!(adapter.score_priority("x", 1.0).await, 50);
    let intent = adapter.parse_intent("train", JAN15_9AM).await;
    assert_eq!(intent.span, Span::new(JAN15_9AM, JAN15_9AM + 2 * HOUR));
}

#[tokio::test]
async fn negative_score_reply_clamps_to_zero() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("Rate the priority"))
        .respond_with(completion("-40"))
        .mount(&server)
        .await;

    let oracle = oracle_for(&server, None, Duration::from_secs(5));
    assert_eq!(oracle.score_priority("idle notebook", 1.0).await.unwrap(), -40);

    let adapter = OracleAdapter::new(Arc::new(oracle), Duration::from_secs(5));
    assert_eq!(adapter.score_priority("idle notebook", 1.0).await, 0);
}

#[tokio::test]
async fn engine_arbitrates_through_http_oracle() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("inference demo"))
        .and(body_string_contains("Extract the GPU"))
        .respond_with(completion(
            "{\"purpose\": \"inference demo\", \"start_time\": \"2027-01-15 09:00\", \
             \"end_time\": \"2027-01-15 11:00\", \"server_preference\": null}",
        ))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("paper deadline"))
        .and(body_string_contains("Extract the GPU"))
        .respond_with(completion(
            "{\"purpose\": \"paper deadline\", \"start_time\": \"2027-01-15 10:00\", \
             \"end_time\": \"2027-01-15 14:00\", \"server_preference\": null}",
        ))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("Purpose: inference demo"))
        .respond_with(completion("30"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("Purpose: paper deadline"))
        .respond_with(completion("90"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("Two GPU server reservations overlap"))
        .respond_with(completion(
            "{\"recommend_new\": true, \"reason\": \"deadline work takes precedence\"}",
        ))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let adapter = OracleAdapter::new(
        Arc::new(oracle_for(&server, None, Duration::from_secs(5))),
        Duration::from_secs(5),
    );
    let engine = Engine::new(dir.path().join("arbiter.wal"), Arc::new(NotifyHub::new()), adapter)
        .unwrap();
    engine.create_server("gpu-a", None, None, 8).await.unwrap();

    let demo = engine
        .create_reservation_at("alice", "inference demo tomorrow morning", JAN15_9AM - 24 * HOUR)
        .await
        .unwrap();
    assert_eq!(demo.status, ReservationStatus::Confirmed);
    assert_eq!(demo.priority, 30);

    let deadline = engine
        .create_reservation_at("bob", "paper deadline 10 to 14", JAN15_9AM - 24 * HOUR)
        .await
        .unwrap();
    assert_eq!(deadline.status, ReservationStatus::Pending);
    assert_eq!(deadline.priority, 90);

    let demo = engine.get_reservation(demo.id).await.unwrap();
    assert_eq!(demo.status, ReservationStatus::PendingRejection);
    assert_eq!(
        demo.judgment_reason.as_deref(),
        Some("deadline work takes precedence")
    );
}
