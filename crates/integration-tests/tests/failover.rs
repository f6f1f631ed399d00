mod harness;

use conduit_core::{ErrorCode, MICROS_PER_UNIT};
use harness::config::ConfigBuilder;
use harness::gateway::{TestGateway, completion};
use serde_json::json;
use wiremock::matchers::path;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn overloaded() -> ResponseTemplate {
    ResponseTemplate::new(503).set_body_json(json!({
        "error": {"message": "overloaded", "type": "server_error"}
    }))
}

#[tokio::test]
async fn server_errors_retry_then_fall_back_to_the_next_candidate() {
    let primary = MockServer::start().await;
    let backup = MockServer::start().await;
    Mock::given(path("/primary/v1/chat/completions"))
        .respond_with(overloaded())
        .expect(2)
        .mount(&primary)
        .await;
    Mock::given(path("/backup/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("from backup", 4, 2)))
        .expect(1)
        .mount(&backup)
        .await;

    let config = ConfigBuilder::new()
        .with_chat_route("fast", &[("primary", &primary), ("backup", &backup)])
        .with_tenant("acme", 1.0)
        .build();
    let gateway = TestGateway::start(&config).await;

    let response = gateway.chat(Some("acme"), "fast", false).await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.upstream.candidate_id.as_deref(), Some("backup"));
    assert_eq!(response.billing.cost_micros, 8);

    // Only the candidate that answered is billed
    let quota = gateway.ledger().quota("acme").await.unwrap();
    assert_eq!(quota.balance, MICROS_PER_UNIT - 8);
}

#[tokio::test]
async fn last_upstream_error_is_reported_when_every_candidate_fails() {
    let primary = MockServer::start().await;
    let backup = MockServer::start().await;
    Mock::given(path("/primary/v1/chat/completions"))
        .respond_with(overloaded())
        .expect(2)
        .mount(&primary)
        .await;
    Mock::given(path("/backup/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(502))
        .expect(2)
        .mount(&backup)
        .await;

    let config = ConfigBuilder::new()
        .with_chat_route("fast", &[("primary", &primary), ("backup", &backup)])
        .build();
    let gateway = TestGateway::start(&config).await;

    let failed = gateway.chat(None, "fast", false).await.unwrap_err();

    assert_eq!(failed.error.code, ErrorCode::UpstreamServerError);
    assert_eq!(failed.error.upstream_status, Some(502));
    assert_eq!(failed.upstream.candidate_id.as_deref(), Some("backup"));
}

#[tokio::test]
async fn open_circuit_stops_calls_to_a_failing_upstream() {
    let server = MockServer::start().await;
    Mock::given(path("/primary/v1/chat/completions"))
        .respond_with(overloaded())
        .expect(2)
        .mount(&server)
        .await;

    let config = ConfigBuilder::new()
        .with_chat_route("fast", &[("primary", &server)])
        .with_failure_threshold(2)
        .build();
    let gateway = TestGateway::start(&config).await;

    let first = gateway.chat(None, "fast", false).await.unwrap_err();
    assert_eq!(first.error.code, ErrorCode::UpstreamServerError);

    let second = gateway.chat(None, "fast", false).await.unwrap_err();
    assert_eq!(second.error.code, ErrorCode::AllCandidatesExhausted);
}
