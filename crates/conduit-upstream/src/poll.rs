//! Submit-then-poll protocol for asynchronous providers

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use conduit_core::{AsyncTaskConfig, ResultShape};
use http::HeaderMap;
use serde_json::{Value, json};
use tokio::time::Instant;
use url::Url;

use crate::client::{OutboundRequest, SafeClient};
use crate::error::UpstreamError;

/// Value at a dotted path. Numeric segments index into arrays.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').filter(|s| !s.is_empty()).try_fold(value, |current, segment| match current {
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        Value::Object(map) => map.get(segment),
        _ => None,
    })
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

enum TaskStatus {
    Succeeded(Value),
    Failed(String),
    Running,
}

fn classify(body: &Value, task: &AsyncTaskConfig) -> Result<TaskStatus, UpstreamError> {
    let Some(status) = lookup(body, &task.status_path).and_then(as_text) else {
        return Ok(TaskStatus::Running);
    };

    if task.success_values.iter().any(|v| v.eq_ignore_ascii_case(&status)) {
        let result = lookup(body, &task.result_path)
            .ok_or_else(|| UpstreamError::InvalidResponse(format!("task succeeded without {}", task.result_path)))?;
        return shape_result(result, task.result_shape).map(TaskStatus::Succeeded);
    }

    if task.failure_values.iter().any(|v| v.eq_ignore_ascii_case(&status)) {
        let message = task
            .error_path
            .as_deref()
            .and_then(|path| lookup(body, path))
            .and_then(as_text)
            .unwrap_or_else(|| format!("task ended with status {status}"));
        return Ok(TaskStatus::Failed(message));
    }

    Ok(TaskStatus::Running)
}

/// Normalize a task result into the configured shape
pub fn shape_result(value: &Value, shape: ResultShape) -> Result<Value, UpstreamError> {
    let items = || match value {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    };

    match shape {
        ResultShape::Raw => Ok(value.clone()),
        ResultShape::UrlList => {
            let data = items()
                .iter()
                .map(|item| {
                    let url = item.as_str().or_else(|| item.get("url").and_then(Value::as_str));
                    match url {
                        Some(u) if Url::parse(u).is_ok() => Ok(json!({"url": u})),
                        _ => Err(UpstreamError::InvalidResponse(format!("expected a URL, got {item}"))),
                    }
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(json!({"data": data}))
        }
        ResultShape::Base64List => {
            let data = items()
                .iter()
                .map(|item| {
                    let encoded = item
                        .as_str()
                        .or_else(|| item.get("b64_json").and_then(Value::as_str))
                        .or_else(|| item.get("data").and_then(Value::as_str));
                    match encoded {
                        Some(b64) if STANDARD.decode(b64).is_ok() => Ok(json!({"b64_json": b64})),
                        _ => Err(UpstreamError::InvalidResponse("expected base64 data".to_string())),
                    }
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(json!({"data": data}))
        }
    }
}

/// Poll a submitted task until it succeeds, fails or times out
///
/// A submit response that already carries a terminal status is returned
/// without polling.
pub async fn await_task(
    client: &SafeClient,
    submit_response: &Value,
    task: &AsyncTaskConfig,
    headers: &HeaderMap,
) -> Result<Value, UpstreamError> {
    match classify(submit_response, task)? {
        TaskStatus::Succeeded(result) => return Ok(result),
        TaskStatus::Failed(message) => return Err(UpstreamError::TaskFailed(message)),
        TaskStatus::Running => {}
    }

    let task_id = lookup(submit_response, &task.task_id_path)
        .and_then(as_text)
        .ok_or_else(|| UpstreamError::InvalidResponse(format!("submit response has no {}", task.task_id_path)))?;
    let status_url = Url::parse(&task.status_url.replace("{task_id}", &task_id))
        .map_err(|e| UpstreamError::InvalidResponse(format!("bad status URL for task {task_id}: {e}")))?;

    let deadline = Instant::now() + task.timeout;
    let interval = task.poll_interval.max(Duration::from_millis(10));

    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(UpstreamError::TaskTimeout(task_id));
        }
        tokio::time::sleep(interval.min(deadline - now)).await;

        let body = match poll_once(client, &status_url, headers).await {
            Ok(body) => body,
            Err(e) if e.is_transient() || e.is_breaker_failure() => {
                tracing::debug!(task_id = %task_id, error = %e, "task status poll failed, retrying");
                continue;
            }
            Err(e) => return Err(e),
        };

        match classify(&body, task)? {
            TaskStatus::Succeeded(result) => {
                tracing::debug!(task_id = %task_id, "async task succeeded");
                return Ok(result);
            }
            TaskStatus::Failed(message) => return Err(UpstreamError::TaskFailed(message)),
            TaskStatus::Running => {}
        }
    }
}

async fn poll_once(client: &SafeClient, url: &Url, headers: &HeaderMap) -> Result<Value, UpstreamError> {
    let response = client.send(&OutboundRequest::get(url.clone(), headers.clone())).await?;
    let status = response.status();
    let body = client.read_body(response).await?;

    if !status.is_success() {
        return Err(UpstreamError::from_status(status.as_u16(), &body));
    }
    serde_json::from_slice(&body).map_err(|e| UpstreamError::InvalidResponse(format!("task status is not JSON: {e}")))
}
