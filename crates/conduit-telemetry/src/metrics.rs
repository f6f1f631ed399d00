//! Metric name constants and recording helpers
//!
//! Instruments are created from `global::meter("conduit")` on first use, so
//! [`crate::init`] must run before the first request to export anything.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::{KeyValue, global};

// Upstream metric names
pub const UPSTREAM_REQUEST_DURATION: &str = "conduit.upstream.request.duration";
pub const UPSTREAM_REQUEST_COUNT: &str = "conduit.upstream.request.count";
pub const CIRCUIT_TRANSITION_COUNT: &str = "conduit.circuit.transition.count";

// Billing metric names
pub const BILLING_OPERATION_COUNT: &str = "conduit.billing.operation.count";

// Streaming metric names
pub const STREAM_COMPLETION_COUNT: &str = "conduit.stream.completion.count";
pub const STREAM_TOKEN_USAGE: &str = "conduit.stream.token.usage";

// Pipeline metric names
pub const STEP_DURATION: &str = "conduit.step.duration";

struct Instruments {
    upstream_duration: Histogram<f64>,
    upstream_count: Counter<u64>,
    circuit_transitions: Counter<u64>,
    billing_operations: Counter<u64>,
    stream_completions: Counter<u64>,
    stream_tokens: Counter<u64>,
    step_duration: Histogram<f64>,
}

fn instruments() -> &'static Instruments {
    static INSTRUMENTS: OnceLock<Instruments> = OnceLock::new();

    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("conduit");
        Instruments {
            upstream_duration: meter
                .f64_histogram(UPSTREAM_REQUEST_DURATION)
                .with_unit("s")
                .with_description("Upstream call latency")
                .build(),
            upstream_count: meter.u64_counter(UPSTREAM_REQUEST_COUNT).build(),
            circuit_transitions: meter.u64_counter(CIRCUIT_TRANSITION_COUNT).build(),
            billing_operations: meter.u64_counter(BILLING_OPERATION_COUNT).build(),
            stream_completions: meter.u64_counter(STREAM_COMPLETION_COUNT).build(),
            stream_tokens: meter
                .u64_counter(STREAM_TOKEN_USAGE)
                .with_unit("{token}")
                .build(),
            step_duration: meter.f64_histogram(STEP_DURATION).with_unit("s").build(),
        }
    })
}

/// Record a duration measurement on a histogram
fn record_duration(histogram: &Histogram<f64>, start: Instant, attributes: &[KeyValue]) {
    histogram.record(start.elapsed().as_secs_f64(), attributes);
}

/// One finished upstream attempt
pub fn record_upstream_call(provider: &str, outcome: &'static str, status: Option<u16>, latency: Duration) {
    let mut attributes = vec![
        KeyValue::new("provider", provider.to_string()),
        KeyValue::new("outcome", outcome),
    ];
    if let Some(status) = status {
        attributes.push(KeyValue::new("http.response.status_code", i64::from(status)));
    }

    let instruments = instruments();
    instruments.upstream_duration.record(latency.as_secs_f64(), &attributes);
    instruments.upstream_count.add(1, &attributes);
}

/// Circuit breaker state change
pub fn record_circuit_transition(from: &'static str, to: &'static str) {
    instruments()
        .circuit_transitions
        .add(1, &[KeyValue::new("from", from), KeyValue::new("to", to)]);
}

/// Billing ledger call and how it ended
pub fn record_billing_operation(operation: &'static str, outcome: &'static str) {
    instruments().billing_operations.add(
        1,
        &[KeyValue::new("operation", operation), KeyValue::new("outcome", outcome)],
    );
}

/// Stream finished, with the tokens it was billed for
pub fn record_stream_completion(outcome: &'static str, input_tokens: u64, output_tokens: u64, estimated: bool) {
    let instruments = instruments();
    instruments.stream_completions.add(
        1,
        &[KeyValue::new("outcome", outcome), KeyValue::new("estimated", estimated)],
    );
    instruments
        .stream_tokens
        .add(input_tokens, &[KeyValue::new("token.type", "input")]);
    instruments
        .stream_tokens
        .add(output_tokens, &[KeyValue::new("token.type", "output")]);
}

/// Workflow step run
pub fn record_step(step: &'static str, status: &'static str, start: Instant) {
    record_duration(
        &instruments().step_duration,
        start,
        &[KeyValue::new("step", step), KeyValue::new("status", status)],
    );
}
