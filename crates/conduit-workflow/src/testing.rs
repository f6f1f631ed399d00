//! Fixtures shared by unit tests

use conduit_core::{
    AuthConfig, AuthScheme, Candidate, Capability, Channel, Context, Pricing, RequestIdentity, RequestPayload,
    RoutingParams, TransformConfig,
};
use serde_json::json;
use url::Url;

pub fn candidate(id: &str, url: &str) -> Candidate {
    Candidate {
        id: id.to_string(),
        provider: "openai".to_string(),
        model: format!("{id}-model"),
        upstream_url: Url::parse(url).unwrap(),
        credential_id: "primary".to_string(),
        auth: AuthConfig {
            secret_ref: Some("primary".to_string()),
            scheme: AuthScheme::Bearer,
        },
        transform: TransformConfig::default(),
        routing: RoutingParams::default(),
        pricing: Pricing::default(),
    }
}

pub fn chat_context(stream: bool) -> Context {
    Context::new(
        RequestIdentity::new(Channel::Internal, Capability::Chat),
        RequestPayload {
            model: "gpt-4o".to_string(),
            body: json!({"messages": [{"role": "user", "content": "hello"}]}),
            stream,
        },
    )
}
