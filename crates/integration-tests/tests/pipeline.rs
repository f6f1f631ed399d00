mod harness;

use conduit_billing::TransactionStatus;
use conduit_core::{ErrorCode, ErrorSource, MICROS_PER_UNIT};
use conduit_workflow::ResponseBody;
use harness::config::ConfigBuilder;
use harness::gateway::{TestGateway, completion};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn buffered_completion_is_charged_from_reported_usage() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/primary/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({"model": "primary-model"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("Hi there", 10, 5)))
        .expect(1)
        .mount(&server)
        .await;

    let config = ConfigBuilder::new()
        .with_chat_route("fast", &[("primary", &server)])
        .with_tenant("acme", 1.0)
        .build();
    let gateway = TestGateway::start(&config).await;

    let response = gateway.chat(Some("acme"), "fast", false).await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.upstream.candidate_id.as_deref(), Some("primary"));
    let ResponseBody::Json(body) = &response.body else {
        panic!("expected a buffered body");
    };
    assert_eq!(body["choices"][0]["message"]["content"], "Hi there");

    assert_eq!((response.billing.input_tokens, response.billing.output_tokens), (10, 5));
    assert_eq!(response.billing.cost_micros, 20);
    assert!(!response.billing.estimated);

    let quota = gateway.ledger().quota("acme").await.unwrap();
    assert_eq!(quota.balance, MICROS_PER_UNIT - 20);
    let tx = gateway.ledger().transaction(&response.trace_id).await.unwrap().unwrap();
    assert_eq!(tx.status, TransactionStatus::Committed);
    assert_eq!(tx.amount, 20);
}

#[tokio::test]
async fn requests_without_a_tenant_are_not_metered() {
    let server = MockServer::start().await;
    Mock::given(path("/primary/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("ok", 3, 1)))
        .expect(1)
        .mount(&server)
        .await;

    let config = ConfigBuilder::new()
        .with_chat_route("fast", &[("primary", &server)])
        .build();
    let gateway = TestGateway::start(&config).await;

    let response = gateway.chat(None, "fast", false).await.unwrap();

    assert_eq!(response.billing.cost_micros, 0);
    assert!(gateway.ledger().transaction(&response.trace_id).await.unwrap().is_none());
}

#[tokio::test]
async fn upstream_client_errors_abort_without_fallback() {
    let primary = MockServer::start().await;
    let backup = MockServer::start().await;
    Mock::given(path("/primary/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {"message": "messages must not be empty", "code": "invalid_request_error"}
        })))
        .expect(1)
        .mount(&primary)
        .await;
    Mock::given(path("/backup/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("unused", 1, 1)))
        .expect(0)
        .mount(&backup)
        .await;

    let config = ConfigBuilder::new()
        .with_chat_route("fast", &[("primary", &primary), ("backup", &backup)])
        .with_tenant("acme", 1.0)
        .build();
    let gateway = TestGateway::start(&config).await;

    let failed = gateway.chat(Some("acme"), "fast", false).await.unwrap_err();

    assert_eq!(failed.error.code, ErrorCode::UpstreamClientError);
    assert_eq!(failed.error.source, ErrorSource::Upstream);
    assert_eq!(failed.error.upstream_status, Some(400));
    assert_eq!(failed.upstream.candidate_id.as_deref(), Some("primary"));

    let body = failed.to_json();
    assert_eq!(body["error"]["code"], "upstream_client_error");
    assert_eq!(body["error"]["trace_id"], failed.trace_id.as_str());

    let quota = gateway.ledger().quota("acme").await.unwrap();
    assert_eq!(quota.balance, MICROS_PER_UNIT);
}

#[tokio::test]
async fn empty_balance_is_rejected_before_any_upstream_call() {
    let server = MockServer::start().await;
    Mock::given(path("/primary/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("unused", 1, 1)))
        .expect(0)
        .mount(&server)
        .await;

    let config = ConfigBuilder::new()
        .with_chat_route("fast", &[("primary", &server)])
        .with_tenant("broke", 0.0)
        .build();
    let gateway = TestGateway::start(&config).await;

    let failed = gateway.chat(Some("broke"), "fast", false).await.unwrap_err();

    assert_eq!(failed.error.code, ErrorCode::InsufficientQuota);
    assert_eq!(failed.error.code.status_code().as_u16(), 402);
    assert!(failed.upstream.candidate_id.is_none());
}

#[tokio::test]
async fn unknown_models_have_no_candidates() {
    let server = MockServer::start().await;
    let config = ConfigBuilder::new()
        .with_chat_route("fast", &[("primary", &server)])
        .build();
    let gateway = TestGateway::start(&config).await;

    let failed = gateway.chat(None, "slow", false).await.unwrap_err();

    assert_eq!(failed.error.code, ErrorCode::NoCandidates);
    assert_eq!(failed.error.source, ErrorSource::Client);
}
