//! Telemetry logic.
//! Support tracing, metrics and logging.
use std::error::Error;
use std::time::{Duration, Instant};

use axum::extract::{MatchedPath, Request};
use axum::middleware::Next;
use axum::response::IntoResponse;
use metrics::{Unit, gauge};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::trace::{Span, Tracer};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::{SdkLogger, SdkLoggerProvider};
use opentelemetry_sdk::trace::SdkTracerProvider;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::Telemetry;

const SERVICE_NAME: &str = "userdir";
const SYSTEM_REFRESH: Duration = Duration::from_secs(10);

fn resources() -> Resource {
    Resource::builder().with_service_name(SERVICE_NAME).build()
}

/// Install the global `tracing` subscriber.
///
/// Logs go to stdout, filtered by `RUST_LOG` (default `info`). When an OTLP
/// endpoint is configured, logs and spans are exported too; the returned
/// provider must be kept alive and shut down on exit.
pub fn init(
    config: Option<&Telemetry>,
) -> Result<Option<SdkTracerProvider>, Box<dyn Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    match config.and_then(|telemetry| telemetry.otlp_endpoint.as_deref()) {
        Some(endpoint) => {
            registry.with(setup_logging(endpoint)?).try_init()?;

            let provider = setup_tracer(endpoint)?;
            global::set_tracer_provider(provider.clone());
            tracing::info!(%endpoint, "opentelemetry export enabled");

            Ok(Some(provider))
        },
        None => {
            registry.try_init()?;
            Ok(None)
        },
    }
}

/// Create tracer for OTLP.
pub fn setup_tracer(
    endpoint: &str,
) -> Result<SdkTracerProvider, Box<dyn Error>> {
    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resources())
        .build())
}

/// Create OTLP exporter for logs.
pub fn setup_logging(
    endpoint: &str,
) -> Result<
    OpenTelemetryTracingBridge<SdkLoggerProvider, SdkLogger>,
    Box<dyn Error>,
> {
    let exporter = LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;
    let provider = SdkLoggerProvider::builder()
        .with_resource(resources())
        .with_batch_exporter(exporter)
        .build();

    Ok(OpenTelemetryTracingBridge::new(&provider))
}

/// Create recorder for Prometheus metrics.
///
/// Must be called from a Tokio runtime: process gauges are refreshed by a
/// background task.
pub fn setup_metrics_recorder()
-> Result<PrometheusHandle, Box<dyn Error>> {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("http_requests_duration_seconds".to_string()),
            EXPONENTIAL_SECONDS,
        )?
        .install_recorder()?;

    metrics::describe_gauge!(
        "process_cpu_usage",
        Unit::Percent,
        "CPU usage of the process in percentage."
    );
    metrics::describe_gauge!(
        "process_memory_used_bytes",
        Unit::Bytes,
        "Total process memory in bytes."
    );
    metrics::describe_counter!(
        "consumer_messages_total",
        Unit::Count,
        "Bus messages handled, by event kind and outcome."
    );
    metrics::describe_counter!(
        "authorization_checks_total",
        Unit::Count,
        "Token checks, by result."
    );

    let mut system = System::new_with_specifics(RefreshKind::nothing());
    let pid = Pid::from_u32(std::process::id());

    tokio::spawn(async move {
        loop {
            system.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[pid]),
                true,
                ProcessRefreshKind::nothing().with_memory().with_cpu(),
            );

            if let Some(process) = system.process(pid) {
                gauge!("process_memory_used_bytes").set(process.memory() as f64);
                gauge!("process_cpu_usage").set(process.cpu_usage() as f64);
            }

            sleep(SYSTEM_REFRESH).await;
        }
    });

    Ok(handle)
}

/// Record request count, latency and an OpenTelemetry span per request.
pub async fn track(req: Request, next: Next) -> impl IntoResponse {
    let tracer = global::tracer("tracing-http");
    let mut otel_span = tracer.start("http-request");

    let start = Instant::now();
    // Matched route keeps label cardinality bounded.
    let path = match req.extensions().get::<MatchedPath>() {
        Some(matched_path) => matched_path.as_str().to_owned(),
        None => req.uri().path().to_owned(),
    };
    let method = req.method().to_string();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    otel_span.set_attribute(KeyValue::new("path", path.clone()));
    otel_span.set_attribute(KeyValue::new("method", method.clone()));
    otel_span.set_attribute(KeyValue::new("status", status.clone()));

    let labels = [("method", method), ("path", path), ("status", status)];
    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    otel_span.end();

    response
}
