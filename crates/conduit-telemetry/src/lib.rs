//! Telemetry for conduit
//!
//! Installs the `tracing` subscriber and, when an exporter is configured,
//! OTLP trace and metric export.

#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

pub mod metrics;

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use conduit_config::{ExportProtocol, ExporterConfig, LogFormat, TelemetryConfig};
use opentelemetry::{KeyValue, global};
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::tonic_types::metadata::MetadataMap;
use opentelemetry_otlp::{WithExportConfig, WithHttpConfig, WithTonicConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_semantic_conventions::resource as semconv;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Interval between metric exports
const METRIC_EXPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Flushes and shuts down exporters when dropped
pub struct TelemetryGuard {
    meter_provider: Option<SdkMeterProvider>,
    tracer_provider: Option<SdkTracerProvider>,
}

impl TelemetryGuard {
    /// Force flush all pending metrics immediately
    pub fn force_flush(&self) -> anyhow::Result<()> {
        if let Some(provider) = &self.meter_provider {
            provider
                .force_flush()
                .map_err(|e| anyhow::anyhow!("failed to flush metrics: {e}"))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for TelemetryGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryGuard")
            .field("metrics", &self.meter_provider.is_some())
            .field("traces", &self.tracer_provider.is_some())
            .finish()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.meter_provider.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("failed to shutdown meter provider: {e}");
        }
        if let Some(provider) = self.tracer_provider.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("failed to shutdown tracer provider: {e}");
        }
    }
}

/// Initialize logging and optional OTLP export
///
/// `log_filter` uses `EnvFilter` syntax and falls back to `info` when it
/// does not parse. The returned guard must live as long as the process.
pub fn init(config: &TelemetryConfig, log_filter: &str) -> anyhow::Result<TelemetryGuard> {
    let filter = EnvFilter::try_new(log_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let mut guard = TelemetryGuard {
        meter_provider: None,
        tracer_provider: None,
    };

    let fmt_layer = match config.log_format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .boxed(),
    };

    let Some(exporter) = &config.exporter else {
        tracing_subscriber::registry().with(filter).with(fmt_layer).try_init()?;
        return Ok(guard);
    };

    let resource = build_resource(config);

    let meter_provider = SdkMeterProvider::builder()
        .with_resource(resource.clone())
        .with_reader(
            PeriodicReader::builder(build_metrics_exporter(exporter)?)
                .with_interval(METRIC_EXPORT_INTERVAL)
                .build(),
        )
        .build();
    global::set_meter_provider(meter_provider.clone());
    guard.meter_provider = Some(meter_provider);

    let tracer_provider = SdkTracerProvider::builder()
        .with_resource(resource)
        .with_batch_exporter(build_span_exporter(exporter)?)
        .build();
    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer_provider.tracer("conduit"));
    global::set_tracer_provider(tracer_provider.clone());
    guard.tracer_provider = Some(tracer_provider);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()?;

    tracing::debug!(endpoint = %exporter.endpoint, "otlp export enabled");
    Ok(guard)
}

/// Service identity attached to every exported span and metric
///
/// Configured attributes are applied in key order and cannot replace the
/// service name or version.
fn build_resource(config: &TelemetryConfig) -> Resource {
    let extra: BTreeMap<&String, &String> = config
        .resource_attributes
        .iter()
        .filter(|(key, _)| !matches!(key.as_str(), semconv::SERVICE_NAME | semconv::SERVICE_VERSION))
        .collect();

    let attrs = [
        KeyValue::new(semconv::SERVICE_NAME, config.service_name.clone()),
        KeyValue::new(semconv::SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
    ]
    .into_iter()
    .chain(extra.into_iter().map(|(key, value)| KeyValue::new(key.clone(), value.clone())));

    Resource::builder().with_attributes(attrs).build()
}

fn metadata_map(headers: &HashMap<String, String>) -> anyhow::Result<MetadataMap> {
    let mut map = http::HeaderMap::new();
    for (name, value) in headers {
        let name = http::HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| anyhow::anyhow!("invalid exporter header {name}: {e}"))?;
        let value = http::HeaderValue::from_str(value)
            .map_err(|e| anyhow::anyhow!("invalid exporter header value for {name}: {e}"))?;
        map.insert(name, value);
    }
    Ok(MetadataMap::from_headers(map))
}

fn build_metrics_exporter(config: &ExporterConfig) -> anyhow::Result<opentelemetry_otlp::MetricExporter> {
    use opentelemetry_otlp::MetricExporter;

    let exporter = match config.protocol {
        ExportProtocol::Grpc => MetricExporter::builder()
            .with_tonic()
            .with_endpoint(config.endpoint.as_str())
            .with_metadata(metadata_map(&config.headers)?)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build gRPC metrics exporter: {e}"))?,
        ExportProtocol::HttpProto => MetricExporter::builder()
            .with_http()
            .with_endpoint(config.endpoint.as_str())
            .with_headers(config.headers.clone())
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build HTTP metrics exporter: {e}"))?,
    };

    Ok(exporter)
}

fn build_span_exporter(config: &ExporterConfig) -> anyhow::Result<opentelemetry_otlp::SpanExporter> {
    use opentelemetry_otlp::SpanExporter;

    let exporter = match config.protocol {
        ExportProtocol::Grpc => SpanExporter::builder()
            .with_tonic()
            .with_endpoint(config.endpoint.as_str())
            .with_metadata(metadata_map(&config.headers)?)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build gRPC span exporter: {e}"))?,
        ExportProtocol::HttpProto => SpanExporter::builder()
            .with_http()
            .with_endpoint(config.endpoint.as_str())
            .with_headers(config.headers.clone())
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build HTTP span exporter: {e}"))?,
    };

    Ok(exporter)
}

#[cfg(test)]
mod tests {
    use opentelemetry::{Key, Value};

    use super::*;

    #[test]
    fn resource_keeps_the_configured_service_name() {
        let config = TelemetryConfig {
            service_name: "conduit-edge".to_string(),
            resource_attributes: HashMap::from([
                ("service.name".to_string(), "spoofed".to_string()),
                ("deployment.environment".to_string(), "staging".to_string()),
            ]),
            ..TelemetryConfig::default()
        };

        let resource = build_resource(&config);

        assert_eq!(
            resource.get(&Key::from_static_str(semconv::SERVICE_NAME)),
            Some(Value::from("conduit-edge"))
        );
        assert_eq!(
            resource.get(&Key::from_static_str("deployment.environment")),
            Some(Value::from("staging"))
        );
    }

    #[test]
    fn exporter_headers_must_be_valid() {
        let headers = HashMap::from([("x-api-key".to_string(), "secret".to_string())]);
        assert_eq!(metadata_map(&headers).unwrap().len(), 1);

        let headers = HashMap::from([("bad header".to_string(), "x".to_string())]);
        assert!(metadata_map(&headers).is_err());
    }
}
