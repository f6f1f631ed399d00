use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use conduit_core::{
    Context, ErrorCode, ErrorSource, EventState, FailureAction, GatewayError, StatusEvent, StatusReporter, Step,
    StepResult, StepStatus,
};
use conduit_telemetry::metrics::record_step;
use serde_json::Map;

use crate::error::WorkflowError;

/// Upper bound on fallback paths taken by one step
const MAX_DEGRADES: u32 = 32;

const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Runs steps in dependency order over one request context
///
/// Errors raised by a step go through the step's own failure policy. Retries
/// re-run the step on the same path, degrades switch to a fallback path and
/// reset the attempt counter. Once an error is recorded, only steps that
/// declare `runs_on_error` still run.
pub struct Orchestrator {
    steps: Vec<Arc<dyn Step>>,
    reporter: Option<StatusReporter>,
    retry_backoff: Duration,
}

impl Orchestrator {
    /// Order `steps` by their dependencies, keeping registration order among peers
    pub fn new(steps: Vec<Arc<dyn Step>>) -> Result<Self, WorkflowError> {
        Ok(Self {
            steps: order_steps(steps)?,
            reporter: None,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        })
    }

    #[must_use]
    pub fn with_status_reporter(mut self, reporter: StatusReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Base delay before a retry, multiplied by the attempt number
    #[must_use]
    pub const fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Step names in execution order
    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|step| step.name()).collect()
    }

    /// Run the pipeline. Returns the error recorded on the context, if any.
    pub async fn run(&self, ctx: &mut Context) -> Result<(), GatewayError> {
        self.emit(StatusEvent::request(ctx.trace_id(), EventState::Started));

        for step in &self.steps {
            if ctx.has_error() && !step.runs_on_error() {
                self.emit(StatusEvent::step(ctx.trace_id(), step.name(), EventState::Skipped));
                continue;
            }

            self.run_step(step.as_ref(), ctx).await;
        }

        match ctx.error() {
            None => {
                tracing::debug!(trace_id = %ctx.trace_id(), elapsed = ?ctx.elapsed(), "request completed");
                self.emit(StatusEvent::request(ctx.trace_id(), EventState::Succeeded));
                Ok(())
            }
            Some(error) => {
                tracing::debug!(
                    trace_id = %ctx.trace_id(),
                    source = %error.source,
                    code = %error.code,
                    "request failed"
                );
                self.emit(StatusEvent::request(ctx.trace_id(), EventState::Failed).with_code(error.code));
                Err(error.clone())
            }
        }
    }

    async fn run_step(&self, step: &dyn Step, ctx: &mut Context) {
        let name = step.name();
        let cleanup = ctx.has_error();
        let mut attempt = 0;
        let mut degrades = 0;

        self.emit(StatusEvent::step(ctx.trace_id(), name, EventState::Started));

        loop {
            let started = Instant::now();
            let error = match step.execute(ctx).await {
                Ok(result) => {
                    self.complete(ctx, name, result, started);
                    return;
                }
                Err(error) => error,
            };

            if cleanup {
                tracing::warn!(trace_id = %ctx.trace_id(), step = name, error = %error, "cleanup step failed");
                record_step(name, "failed", started);
                self.emit(StatusEvent::step(ctx.trace_id(), name, EventState::Failed).with_code(error.code));
                return;
            }

            match step.on_failure(ctx, &error, attempt) {
                FailureAction::Retry => {
                    attempt += 1;
                    record_step(name, "retry", started);
                    tracing::debug!(trace_id = %ctx.trace_id(), step = name, attempt, error = %error, "retrying step");
                    self.emit(StatusEvent::step(ctx.trace_id(), name, EventState::Retrying).with_code(error.code));

                    if !self.retry_backoff.is_zero() {
                        tokio::time::sleep(self.retry_backoff * attempt).await;
                    }
                }
                FailureAction::Degrade => {
                    record_step(name, "degraded", started);
                    let fallback = step.on_degrade(ctx, &error).await;

                    if fallback.status == StepStatus::Degraded && degrades < MAX_DEGRADES {
                        degrades += 1;
                        attempt = 0;
                        tracing::info!(
                            trace_id = %ctx.trace_id(),
                            step = name,
                            error = %error,
                            fallback = fallback.message.as_deref().unwrap_or(""),
                            "step degraded to fallback path"
                        );
                        self.emit(
                            StatusEvent::step(ctx.trace_id(), name, EventState::Degraded)
                                .with_code(error.code)
                                .with_metadata(fallback.metadata),
                        );
                        continue;
                    }

                    let terminal = exhausted(error, &fallback);
                    self.fail(ctx, name, terminal, fallback.metadata);
                    return;
                }
                FailureAction::Abort => {
                    record_step(name, "failed", started);
                    self.fail(ctx, name, error, Map::new());
                    return;
                }
            }
        }
    }

    fn complete(&self, ctx: &mut Context, name: &'static str, result: StepResult, started: Instant) {
        let state = match result.status {
            StepStatus::Success => EventState::Succeeded,
            StepStatus::Degraded => EventState::Degraded,
            StepStatus::Failed => {
                record_step(name, "failed", started);
                let message = result.message.unwrap_or_else(|| format!("step {name} failed"));
                self.fail(ctx, name, GatewayError::internal(message), result.metadata);
                return;
            }
        };

        record_step(name, if state == EventState::Succeeded { "success" } else { "degraded" }, started);
        self.emit(StatusEvent::step(ctx.trace_id(), name, state).with_metadata(result.metadata));
    }

    fn fail(&self, ctx: &mut Context, name: &'static str, error: GatewayError, metadata: Map<String, serde_json::Value>) {
        tracing::debug!(trace_id = %ctx.trace_id(), step = name, error = %error, "step failed");
        self.emit(
            StatusEvent::step(ctx.trace_id(), name, EventState::Failed)
                .with_code(error.code)
                .with_metadata(metadata),
        );
        ctx.set_error(error);
    }

    fn emit(&self, event: StatusEvent) {
        if let Some(reporter) = &self.reporter {
            reporter.report(event);
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("steps", &self.step_names())
            .field("retry_backoff", &self.retry_backoff)
            .finish_non_exhaustive()
    }
}

/// Error recorded once a step has no fallback left
///
/// Upstream failures are reported as-is so the client sees the provider's
/// status; anything else becomes an exhaustion error.
fn exhausted(error: GatewayError, fallback: &StepResult) -> GatewayError {
    if error.source == ErrorSource::Upstream {
        return error;
    }

    let message = fallback.message.clone().unwrap_or(error.message);
    GatewayError::gateway(ErrorCode::AllCandidatesExhausted, message)
}

/// Topologically sort steps, preferring earlier registration among ready steps
fn order_steps(steps: Vec<Arc<dyn Step>>) -> Result<Vec<Arc<dyn Step>>, WorkflowError> {
    let mut index = HashMap::with_capacity(steps.len());
    for (position, step) in steps.iter().enumerate() {
        if index.insert(step.name(), position).is_some() {
            return Err(WorkflowError::DuplicateStep(step.name()));
        }
    }

    let mut pending_deps = vec![0_usize; steps.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (position, step) in steps.iter().enumerate() {
        for &dependency in step.depends_on() {
            let Some(&target) = index.get(dependency) else {
                return Err(WorkflowError::UnknownDependency {
                    step: step.name(),
                    dependency,
                });
            };
            pending_deps[position] += 1;
            dependents[target].push(position);
        }
    }

    let mut ready: BTreeSet<usize> = (0..steps.len()).filter(|&i| pending_deps[i] == 0).collect();
    let mut order = Vec::with_capacity(steps.len());
    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &dependent in &dependents[next] {
            pending_deps[dependent] -= 1;
            if pending_deps[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() != steps.len() {
        let cycle = (0..steps.len())
            .filter(|&i| pending_deps[i] > 0)
            .map(|i| steps[i].name())
            .collect();
        return Err(WorkflowError::DependencyCycle(cycle));
    }

    let mut slots: Vec<Option<Arc<dyn Step>>> = steps.into_iter().map(Some).collect();
    Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
}
