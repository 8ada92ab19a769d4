use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "beach-relay";
const OTEL_STDOUT_ENV: &str = "BEACH_RELAY_OTEL_STDOUT";

/// Counters the relay records, with their help text.
const COUNTERS: &[(&str, &str)] = &[
    ("signaling_sessions_total", "Sessions created"),
    ("signaling_connections_total", "Relay connections accepted"),
    ("signaling_messages_total", "Signaling messages routed, by kind"),
    (
        "signaling_candidates_total",
        "ICE candidates routed, by type, protocol and tcp type",
    ),
    (
        "signaling_protocol_violations_total",
        "Inbound frames dropped as malformed, by reason",
    ),
    (
        "signaling_control_delivery_failures_total",
        "Roster updates that could not be queued for a member",
    ),
    (
        "signaling_api_auth_failures_total",
        "Rejected sessions API requests, by reason",
    ),
    ("http_requests_total", "HTTP requests, by status code and method"),
];

const GAUGES: &[(&str, &str)] = &[
    ("signaling_active_sessions", "Sessions with at least one member"),
    ("signaling_active_connections", "Open relay connections"),
];

/// Process-wide logging, metrics recorder and optional span export.
pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init() -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;
        describe_metrics();

        let tracer_provider = if env_truthy(OTEL_STDOUT_ENV) {
            let provider = stdout_tracer_provider();
            global::set_tracer_provider(provider.clone());
            tracing_subscriber::registry()
                .with(env_filter())
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .with(tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME)))
                .try_init()
                .context("failed to initialise tracing subscriber")?;
            info!("relay spans exported to stdout ({OTEL_STDOUT_ENV} is set)");
            Some(provider)
        } else {
            tracing_subscriber::registry()
                .with(env_filter())
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .try_init()
                .context("failed to initialise tracing subscriber")?;
            None
        };

        Ok(Self {
            metrics_handle,
            tracer_provider,
        })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = &self.tracer_provider {
            if let Err(err) = provider.shutdown() {
                warn!(error = %err, "failed to shutdown OpenTelemetry tracer provider");
            }
        }
    }
}

/// Registers help text for the relay's metrics with the installed recorder.
pub fn describe_metrics() {
    for (name, help) in COUNTERS {
        describe_counter!((*name), Unit::Count, (*help));
    }
    for (name, help) in GAUGES {
        describe_gauge!((*name), Unit::Count, (*help));
    }
    describe_histogram!(
        "http_request_duration_seconds",
        Unit::Seconds,
        "HTTP request latency, by status code and method"
    );
}

fn stdout_tracer_provider() -> SdkTracerProvider {
    SdkTracerProvider::builder()
        .with_simple_exporter(SpanExporter::default())
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(
            Resource::builder()
                .with_attributes(vec![KeyValue::new("service.name", SERVICE_NAME)])
                .build(),
        )
        .build()
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn env_truthy(key: &str) -> bool {
    std::env::var(key)
        .map(|val| is_truthy(&val))
        .unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
