use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::error::ErrorCode;

/// Pipeline level an event describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStage {
    /// Whole request
    Request,
    /// Single step
    Step,
}

/// Progress state reported at a boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventState {
    Started,
    Succeeded,
    Degraded,
    Retrying,
    Failed,
    Skipped,
}

impl EventState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Succeeded => "succeeded",
            Self::Degraded => "degraded",
            Self::Retrying => "retrying",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for EventState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable progress of one request through the pipeline
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusEvent {
    pub trace_id: String,
    pub stage: EventStage,
    /// Step name, `None` for request-level events
    pub step: Option<&'static str>,
    pub state: EventState,
    pub code: Option<ErrorCode>,
    pub metadata: Map<String, Value>,
}

impl StatusEvent {
    pub fn request(trace_id: impl Into<String>, state: EventState) -> Self {
        Self {
            trace_id: trace_id.into(),
            stage: EventStage::Request,
            step: None,
            state,
            code: None,
            metadata: Map::new(),
        }
    }

    pub fn step(trace_id: impl Into<String>, step: &'static str, state: EventState) -> Self {
        Self {
            trace_id: trace_id.into(),
            stage: EventStage::Step,
            step: Some(step),
            state,
            code: None,
            metadata: Map::new(),
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: ErrorCode) -> Self {
        self.code = Some(code);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Consumer of status events
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn publish(&self, event: StatusEvent);
}

/// Sink that writes events to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatusSink;

#[async_trait]
impl StatusSink for LogStatusSink {
    async fn publish(&self, event: StatusEvent) {
        tracing::debug!(
            trace_id = %event.trace_id,
            step = event.step.unwrap_or("-"),
            state = %event.state,
            code = event.code.map(ErrorCode::as_str),
            "status event"
        );
    }
}

/// Fire-and-forget publisher of status events
///
/// Events are queued on an unbounded channel and handed to the sink by a
/// background task, so reporting never waits on the consumer.
#[derive(Clone)]
pub struct StatusReporter {
    tx: mpsc::UnboundedSender<StatusEvent>,
}

impl StatusReporter {
    /// Spawn the background consumer. Must be called within a Tokio runtime.
    pub fn new(sink: Arc<dyn StatusSink>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(forward_events(rx, sink));
        Self { tx }
    }

    pub fn report(&self, event: StatusEvent) {
        if self.tx.send(event).is_err() {
            tracing::warn!("failed to enqueue status event, channel closed");
        }
    }
}

impl fmt::Debug for StatusReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusReporter")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

async fn forward_events(mut rx: mpsc::UnboundedReceiver<StatusEvent>, sink: Arc<dyn StatusSink>) {
    while let Some(event) = rx.recv().await {
        sink.publish(event).await;
    }

    tracing::debug!("status reporter shutting down");
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    #[derive(Default)]
    struct Collect(Mutex<Vec<StatusEvent>>);

    #[async_trait]
    impl StatusSink for Collect {
        async fn publish(&self, event: StatusEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[tokio::test]
    async fn events_reach_the_sink_in_order() {
        let sink = Arc::new(Collect::default());
        let reporter = StatusReporter::new(sink.clone());

        reporter.report(StatusEvent::request("t1", EventState::Started));
        reporter.report(
            StatusEvent::step("t1", "routing", EventState::Failed).with_code(ErrorCode::NoCandidates),
        );

        for _ in 0..50 {
            if sink.0.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let events = sink.0.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].stage, EventStage::Request);
        assert_eq!(events[1].step, Some("routing"));
        assert_eq!(events[1].code, Some(ErrorCode::NoCandidates));
    }

    #[test]
    fn events_serialize_with_snake_case_states() {
        let event = StatusEvent::step("t1", "upstream_call", EventState::Retrying);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["state"], "retrying");
        assert_eq!(json["stage"], "step");
        assert_eq!(json["code"], Value::Null);
    }
}
