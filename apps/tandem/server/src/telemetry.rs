use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const SESSIONS_ACTIVE: &str = "tandem_sessions_active";
pub const SESSIONS_READY: &str = "tandem_sessions_ready_total";
pub const CONNECTIONS_TOTAL: &str = "tandem_connections_total";
pub const ENDPOINTS_REGISTERED: &str = "tandem_endpoints_registered_total";
pub const MESSAGES_RELAYED: &str = "tandem_messages_relayed_total";
pub const MESSAGES_DROPPED: &str = "tandem_messages_dropped_total";
pub const EVICTIONS: &str = "tandem_evictions_total";
pub const NEGOTIATIONS_COMPLETED: &str = "tandem_negotiations_completed_total";
pub const NEGOTIATION_TIMEOUTS: &str = "tandem_negotiation_timeouts_total";
pub const RECONNECT_ATTEMPTS: &str = "tandem_reconnect_attempts_total";
pub const RECONNECT_EXHAUSTED: &str = "tandem_reconnect_exhausted_total";

const OTEL_STDOUT_ENV: &str = "TANDEM_OTEL_STDOUT";
const SERVICE_NAME: &str = "tandem";

/// Every metric the relay records, with its Prometheus help text.
const METRICS: &[(&str, MetricKind, &str)] = &[
    (SESSIONS_ACTIVE, MetricKind::Gauge, "Sessions with a running task"),
    (SESSIONS_READY, MetricKind::Counter, "Times a session had both roles present"),
    (CONNECTIONS_TOTAL, MetricKind::Counter, "WebSocket connections accepted"),
    (ENDPOINTS_REGISTERED, MetricKind::Counter, "Successful role registrations, by role"),
    (MESSAGES_RELAYED, MetricKind::Counter, "Frames delivered to the peer, by event"),
    (MESSAGES_DROPPED, MetricKind::Counter, "Frames not delivered, by reason"),
    (EVICTIONS, MetricKind::Counter, "Endpoints displaced by a newer registration"),
    (NEGOTIATIONS_COMPLETED, MetricKind::Counter, "Negotiations that reached stable on both sides"),
    (NEGOTIATION_TIMEOUTS, MetricKind::Counter, "Negotiations abandoned at the deadline"),
    (RECONNECT_ATTEMPTS, MetricKind::Counter, "Reconnection attempts that lapsed, by role"),
    (RECONNECT_EXHAUSTED, MetricKind::Counter, "Sessions closed after reconnection gave up"),
];

#[derive(Clone, Copy)]
enum MetricKind {
    Counter,
    Gauge,
}

/// Process-wide observability: the Prometheus recorder behind `/metrics`, the
/// fmt subscriber and, when `TANDEM_OTEL_STDOUT` is set, span export to stdout.
/// Dropping it flushes pending spans.
pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init() -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;
        for &(name, kind, help) in METRICS {
            match kind {
                MetricKind::Counter => describe_counter!(name, help),
                MetricKind::Gauge => describe_gauge!(name, help),
            }
        }

        let tracer_provider = otel_stdout_requested().then(stdout_tracer_provider);
        let otel = tracer_provider.as_ref().map(|provider| {
            global::set_tracer_provider(provider.clone());
            tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME))
        });
        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .with(otel)
            .try_init()
            .context("failed to initialise tracing subscriber")?;
        if tracer_provider.is_some() {
            info!("exporting spans to stdout ({OTEL_STDOUT_ENV} is set)");
        }

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
        let Some(provider) = self.tracer_provider.take() else {
            return;
        };
        if let Err(err) = provider.shutdown() {
            warn!(error = %err, "span export did not shut down cleanly");
        }
    }
}

fn stdout_tracer_provider() -> SdkTracerProvider {
    let resource = Resource::builder()
        .with_attributes([KeyValue::new("service.name", SERVICE_NAME)])
        .build();
    SdkTracerProvider::builder()
        .with_simple_exporter(SpanExporter::default())
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(resource)
        .build()
}

fn otel_stdout_requested() -> bool {
    std::env::var(OTEL_STDOUT_ENV).is_ok_and(|value| flag_enabled(&value))
}

fn flag_enabled(value: &str) -> bool {
    ["1", "true", "yes", "on"]
        .iter()
        .any(|on| value.trim().eq_ignore_ascii_case(on))
}
