use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::context::Context;
use crate::error::GatewayError;

/// Outcome class of a step execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Success,
    /// Completed on a fallback path
    Degraded,
    Failed,
}

/// Result of running a step
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub status: StepStatus,
    pub message: Option<String>,
    pub metadata: Map<String, Value>,
}

impl StepResult {
    pub fn success() -> Self {
        Self {
            status: StepStatus::Success,
            message: None,
            metadata: Map::new(),
        }
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Degraded,
            message: Some(message.into()),
            metadata: Map::new(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Failed,
            message: Some(message.into()),
            metadata: Map::new(),
        }
    }

    /// Attach a metadata entry reported in status events
    #[must_use]
    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn is_failed(&self) -> bool {
        self.status == StepStatus::Failed
    }
}

/// What the orchestrator should do after a step raised an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Run the step again with the same inputs
    Retry,
    /// Switch to a fallback path via [`Step::on_degrade`]
    Degrade,
    /// Stop the pipeline with this error
    Abort,
}

/// One unit of work in the request pipeline
#[async_trait]
pub trait Step: Send + Sync {
    /// Unique step name, used for dependencies and status events
    fn name(&self) -> &'static str;

    /// Steps that must run before this one
    fn depends_on(&self) -> &'static [&'static str] {
        &[]
    }

    /// Whether the step still runs after an earlier step recorded an error
    ///
    /// Such steps must inspect `ctx.error()` and only clean up.
    fn runs_on_error(&self) -> bool {
        false
    }

    async fn execute(&self, ctx: &mut Context) -> Result<StepResult, GatewayError>;

    /// Decide how to react to an error raised by `execute`
    ///
    /// `attempt` counts executions of the step on the current path, starting at 0.
    fn on_failure(&self, _ctx: &Context, _error: &GatewayError, _attempt: u32) -> FailureAction {
        FailureAction::Abort
    }

    /// Prepare a fallback path
    ///
    /// Returning [`StepStatus::Degraded`] asks the orchestrator to execute the
    /// step again on the new path. Any other status is final.
    async fn on_degrade(&self, _ctx: &mut Context, error: &GatewayError) -> StepResult {
        StepResult::failed(error.message.clone())
    }
}
