//! Metered pass-through for streamed upstream responses
//!
//! Bytes are forwarded to the client unchanged while an [`SseAccumulator`]
//! counts tokens. Whatever ends the stream (normal completion, upstream
//! error or silence, client cancellation or the consumer dropping it) the
//! completion hook runs exactly once with the final usage.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use conduit_config::UpstreamConfig;
use conduit_core::keys::{ByteStream, PendingCharge};
use conduit_core::{Capability, ErrorCode, GatewayError, Pricing};
use conduit_store::{SharedStore, StoreError};
use futures_util::{Stream, StreamExt};
use serde_json::json;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::sse::SseAccumulator;

/// Lifetime of a cancellation flag
const CANCEL_TTL: Duration = Duration::from_secs(600);

/// Bounds applied while a stream is read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamLimits {
    /// Longest wait for the next upstream chunk
    pub idle_timeout: Duration,
    /// Longest SSE line buffered before the stream is abandoned
    pub max_line_bytes: usize,
}

impl StreamLimits {
    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self {
            idle_timeout: config.stream_idle_timeout,
            max_line_bytes: usize::try_from(config.max_response_bytes).unwrap_or(usize::MAX),
        }
    }
}

/// Request details handed to the completion hook
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionContext {
    pub trace_id: String,
    pub capability: Capability,
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub candidate_id: String,
    pub provider: String,
    pub model: String,
    pub pricing: Pricing,
    /// Charge reserved before the call, settled by the hook
    pub pending: Option<PendingCharge>,
    /// Used when the provider never reports prompt tokens
    pub estimated_input_tokens: u64,
}

/// How a stream ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    /// Client asked for cancellation
    Cancelled,
    /// Consumer dropped the stream before it ended
    Disconnected,
    Failed(GatewayError),
}

impl StreamOutcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Disconnected => "disconnected",
            Self::Failed(_) => "failed",
        }
    }
}

/// Final accounting for a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// At least one count was estimated
    pub estimated: bool,
    /// Data events received
    pub events: u64,
    pub text: String,
    pub tool_calls: Vec<String>,
    pub finish_reason: Option<String>,
    pub outcome: StreamOutcome,
}

/// Called once per stream with its final usage
#[async_trait]
pub trait StreamCompletionHook: Send + Sync {
    async fn on_complete(&self, context: CompletionContext, usage: StreamUsage);
}

/// Cancellation flags shared across gateway instances
pub struct CancelRegistry {
    store: Arc<dyn SharedStore>,
}

impl CancelRegistry {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    pub fn key(capability: Capability, user_id: Option<&str>, request_id: &str) -> String {
        format!("cancel:{capability}:{}:{request_id}", user_id.unwrap_or("anonymous"))
    }

    /// Flag a request as cancelled
    pub async fn cancel(
        &self,
        capability: Capability,
        user_id: Option<&str>,
        request_id: &str,
    ) -> Result<(), StoreError> {
        let key = Self::key(capability, user_id, request_id);
        self.store.set(&key, "1", Some(CANCEL_TTL)).await
    }

    /// Whether the flag is set. Store errors read as not cancelled.
    pub async fn is_cancelled(&self, key: &str) -> bool {
        match self.store.get(key).await {
            Ok(value) => value.is_some(),
            Err(e) => {
                tracing::debug!(key, error = %e, "cancellation check failed");
                false
            }
        }
    }
}

impl std::fmt::Debug for CancelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelRegistry")
            .field("backend", &self.store.backend())
            .finish()
    }
}

/// Periodic cancellation check for one stream
pub struct CancelWatch {
    registry: Arc<CancelRegistry>,
    key: String,
    ticker: Interval,
}

impl CancelWatch {
    pub fn new(registry: Arc<CancelRegistry>, key: String, every: Duration) -> Self {
        let every = every.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { registry, key, ticker }
    }
}

/// Holds the hook until the stream's outcome is known
struct Meter {
    accumulator: SseAccumulator,
    pending: Option<(CompletionContext, Arc<dyn StreamCompletionHook>)>,
}

impl Meter {
    fn settle(&mut self, outcome: StreamOutcome) -> Option<(CompletionContext, Arc<dyn StreamCompletionHook>, StreamUsage)> {
        let (context, hook) = self.pending.take()?;

        self.accumulator.finish();
        let outcome = match (outcome, self.accumulator.error()) {
            (StreamOutcome::Completed, Some(message)) => {
                StreamOutcome::Failed(GatewayError::upstream(ErrorCode::UpstreamServerError, message))
            }
            (outcome, _) => outcome,
        };

        let reported = self.accumulator.reported();
        let (output_tokens, output_estimated) = self.accumulator.output_tokens();
        let input_tokens = reported.input_tokens.unwrap_or(context.estimated_input_tokens);
        let usage = StreamUsage {
            input_tokens,
            output_tokens,
            estimated: output_estimated || reported.input_tokens.is_none(),
            events: self.accumulator.events(),
            text: self.accumulator.text().to_string(),
            tool_calls: self.accumulator.tool_calls().to_vec(),
            finish_reason: self.accumulator.finish_reason().map(str::to_string),
            outcome,
        };

        conduit_telemetry::metrics::record_stream_completion(
            usage.outcome.as_str(),
            usage.input_tokens,
            usage.output_tokens,
            usage.estimated,
        );
        tracing::info!(
            trace_id = %context.trace_id,
            candidate = %context.candidate_id,
            outcome = usage.outcome.as_str(),
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            estimated = usage.estimated,
            "stream finished"
        );

        Some((context, hook, usage))
    }

    async fn finish(&mut self, outcome: StreamOutcome) {
        if let Some((context, hook, usage)) = self.settle(outcome) {
            hook.on_complete(context, usage).await;
        }
    }
}

impl Drop for Meter {
    fn drop(&mut self) {
        let Some((context, hook, usage)) = self.settle(StreamOutcome::Disconnected) else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { hook.on_complete(context, usage).await });
            }
            Err(_) => {
                tracing::warn!(trace_id = %context.trace_id, "stream dropped outside a runtime, completion not reported");
            }
        }
    }
}

type Upstream = Pin<Box<dyn Stream<Item = Result<Bytes, String>> + Send>>;

enum Event {
    Tick,
    Idle,
    Item(Option<Result<Bytes, String>>),
}

struct MeterState {
    upstream: Upstream,
    meter: Meter,
    cancel: Option<CancelWatch>,
    idle_timeout: Duration,
    idle_deadline: Instant,
    trace_id: String,
    finished: bool,
}

impl MeterState {
    async fn next_frame(&mut self) -> Option<Bytes> {
        loop {
            if self.finished {
                return None;
            }

            // the deadline survives cancellation ticks, only data moves it
            let deadline = self.idle_deadline;
            let event = match self.cancel.as_mut() {
                Some(watch) => tokio::select! {
                    biased;
                    _ = watch.ticker.tick() => Event::Tick,
                    item = tokio::time::timeout_at(deadline, self.upstream.next()) => {
                        item.map_or(Event::Idle, Event::Item)
                    }
                },
                None => tokio::time::timeout_at(deadline, self.upstream.next())
                    .await
                    .map_or(Event::Idle, Event::Item),
            };

            match event {
                Event::Tick => {
                    let Some(watch) = &self.cancel else { continue };
                    if watch.registry.is_cancelled(&watch.key).await {
                        let error = GatewayError::client(ErrorCode::ClientCancelled, "request cancelled by client");
                        return Some(self.terminate(StreamOutcome::Cancelled, &error).await);
                    }
                }
                Event::Idle => {
                    tracing::warn!(trace_id = %self.trace_id, idle = ?self.idle_timeout, "upstream stream stalled");
                    let error = GatewayError::upstream(
                        ErrorCode::UpstreamTimeout,
                        format!("no data from upstream for {:?}", self.idle_timeout),
                    );
                    return Some(self.terminate(StreamOutcome::Failed(error.clone()), &error).await);
                }
                Event::Item(Some(Ok(bytes))) => {
                    if let Err(e) = self.meter.accumulator.push(&bytes) {
                        tracing::warn!(trace_id = %self.trace_id, error = %e, "upstream stream rejected");
                        let error = GatewayError::upstream(ErrorCode::InvalidUpstreamResponse, e.to_string());
                        return Some(self.terminate(StreamOutcome::Failed(error.clone()), &error).await);
                    }
                    self.idle_deadline = Instant::now() + self.idle_timeout;
                    return Some(bytes);
                }
                Event::Item(Some(Err(e))) => {
                    tracing::warn!(trace_id = %self.trace_id, error = %e, "upstream stream interrupted");
                    let error = GatewayError::upstream(ErrorCode::UpstreamNetwork, format!("stream interrupted: {e}"));
                    return Some(self.terminate(StreamOutcome::Failed(error.clone()), &error).await);
                }
                Event::Item(None) => {
                    self.finished = true;
                    self.meter.finish(StreamOutcome::Completed).await;
                    return None;
                }
            }
        }
    }

    /// Finish the stream with an in-band error frame
    async fn terminate(&mut self, outcome: StreamOutcome, error: &GatewayError) -> Bytes {
        self.finished = true;
        self.meter.finish(outcome).await;
        error_frame(error, &self.trace_id)
    }
}

/// SSE frame describing a failure after the response started
pub fn error_frame(error: &GatewayError, trace_id: &str) -> Bytes {
    let payload = json!({
        "error": {
            "code": error.code.as_str(),
            "message": error.message,
            "source": error.source,
            "trace_id": trace_id,
        }
    });
    Bytes::from(format!("event: error\ndata: {payload}\n\n"))
}

/// Wrap an upstream byte stream with token metering and cancellation
pub fn meter_stream<S, E>(
    upstream: S,
    context: CompletionContext,
    hook: Arc<dyn StreamCompletionHook>,
    limits: StreamLimits,
    cancel: Option<CancelWatch>,
) -> ByteStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display,
{
    let state = MeterState {
        upstream: Box::pin(upstream.map(|item| item.map_err(|e| e.to_string()))),
        trace_id: context.trace_id.clone(),
        meter: Meter {
            accumulator: SseAccumulator::with_line_limit(limits.max_line_bytes),
            pending: Some((context, hook)),
        },
        cancel,
        idle_timeout: limits.idle_timeout,
        idle_deadline: Instant::now() + limits.idle_timeout,
        finished: false,
    };

    Box::pin(futures_util::stream::unfold(state, |mut state| async move {
        let frame = state.next_frame().await?;
        Some((frame, state))
    }))
}
