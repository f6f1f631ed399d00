use serde_json::{Map, Value};

use crate::candidate::Candidate;
use crate::context::RequestPayload;
use crate::error::{ErrorCode, GatewayError};

/// Build the upstream request body for a candidate
///
/// The candidate's template is merged over the client body, template values
/// winning. `{{model}}` and `{{alias}}` placeholders in template strings are
/// replaced by the upstream model and the requested alias.
pub fn render_body(candidate: &Candidate, request: &RequestPayload) -> Result<Value, GatewayError> {
    let Value::Object(mut body) = request.body.clone() else {
        return Err(GatewayError::client(
            ErrorCode::InvalidRequest,
            "request body must be a JSON object",
        ));
    };

    body.insert("model".to_string(), Value::String(candidate.model.clone()));

    if let Some(template) = &candidate.transform.body_template {
        let Value::Object(template) = substitute(template, candidate, request) else {
            return Err(GatewayError::internal(format!(
                "body template for {} is not an object",
                candidate.id
            )));
        };
        merge(&mut body, template);
    }

    if request.stream {
        body.insert("stream".to_string(), Value::Bool(true));
        if candidate.provider == "openai" && !body.contains_key("stream_options") {
            body.insert(
                "stream_options".to_string(),
                serde_json::json!({ "include_usage": true }),
            );
        }
    } else {
        body.remove("stream");
    }

    Ok(Value::Object(body))
}

fn substitute(value: &Value, candidate: &Candidate, request: &RequestPayload) -> Value {
    match value {
        Value::String(s) => Value::String(
            s.replace("{{model}}", &candidate.model)
                .replace("{{alias}}", &request.model),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, candidate, request)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, candidate, request)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn merge(target: &mut Map<String, Value>, overlay: Map<String, Value>) {
    for (key, value) in overlay {
        match (target.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(nested)) => merge(existing, nested),
            (_, Value::Null) => {
                target.remove(&key);
            }
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use url::Url;

    use super::*;
    use crate::candidate::{AuthConfig, Pricing, RoutingParams, TransformConfig};

    fn candidate(provider: &str, template: Option<Value>) -> Candidate {
        Candidate {
            id: format!("{provider}/upstream-model/key"),
            provider: provider.to_string(),
            model: "upstream-model".to_string(),
            upstream_url: Url::parse("https://example.com/v1").unwrap(),
            credential_id: "key".to_string(),
            auth: AuthConfig::default(),
            transform: TransformConfig {
                body_template: template,
                async_task: None,
            },
            routing: RoutingParams::default(),
            pricing: Pricing::default(),
        }
    }

    fn request(body: Value, stream: bool) -> RequestPayload {
        RequestPayload {
            model: "alias".to_string(),
            body,
            stream,
        }
    }

    #[test]
    fn model_is_rewritten_to_upstream_name() {
        let body = render_body(&candidate("openai", None), &request(json!({"model": "alias"}), false)).unwrap();
        assert_eq!(body["model"], "upstream-model");
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn template_merges_and_substitutes() {
        let template = json!({
            "parameters": {"quality": "hd"},
            "tag": "{{alias}}->{{model}}",
            "user": null
        });
        let body = render_body(
            &candidate("imagegen", Some(template)),
            &request(json!({"prompt": "cat", "parameters": {"size": "1024"}, "user": "u1"}), false),
        )
        .unwrap();

        assert_eq!(body["parameters"], json!({"size": "1024", "quality": "hd"}));
        assert_eq!(body["tag"], "alias->upstream-model");
        assert!(body.get("user").is_none());
        assert_eq!(body["prompt"], "cat");
    }

    #[test]
    fn streaming_openai_requests_ask_for_usage() {
        let body = render_body(&candidate("openai", None), &request(json!({}), true)).unwrap();
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);

        let body = render_body(&candidate("anthropic", None), &request(json!({}), true)).unwrap();
        assert!(body.get("stream_options").is_none());
    }

    #[test]
    fn non_object_body_is_rejected() {
        let err = render_body(&candidate("openai", None), &request(json!([1, 2]), false)).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
    }
}
