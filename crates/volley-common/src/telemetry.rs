//! Logging and OpenTelemetry export for the operator
//!
//! Logs are always JSON on stdout. Traces and metrics go to an OTLP collector
//! only when `OTEL_EXPORTER_OTLP_ENDPOINT` is set, tagged with the location
//! and namespace the controller serves so several regional operators can
//! share one collector.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{
    new_view, Aggregation, Instrument, PeriodicReader, SdkMeterProvider, Stream, View,
};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource as semconv;
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::metrics::{IGNITION_SKEW_NAME, QUEUE_BACKOFF_NAME, RECONCILE_DURATION_NAME};

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "info,volley=debug,kube=info,tower=warn,hyper=warn";

/// Namespace shared by every volley service in exported resources
pub const SERVICE_NAMESPACE: &str = "volley";

/// Errors raised while wiring up logging or export
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The OTLP span exporter couldn't be built
    #[error("failed to initialize tracer: {0}")]
    TracerInit(String),

    /// The OTLP metric exporter or a histogram view couldn't be built
    #[error("failed to initialize metrics exporter: {0}")]
    MetricsInit(String),

    /// A global subscriber was already installed
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Who is reporting
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// `service.name` of the process
    pub service_name: String,
    /// Location whose jobs this controller runs
    pub region: Option<String>,
    /// Namespace the workers are created in
    pub namespace: Option<String>,
    /// OTLP collector; `None` keeps everything local
    pub otlp_endpoint: Option<String>,
}

impl TelemetryConfig {
    /// Telemetry for the controller serving `region` in `namespace`
    pub fn controller(region: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            service_name: "volley-operator".to_string(),
            region: Some(region.into()),
            namespace: Some(namespace.into()),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
        }
    }

    fn resource(&self) -> Resource {
        let mut attributes = vec![
            KeyValue::new(semconv::SERVICE_NAME, self.service_name.clone()),
            KeyValue::new(semconv::SERVICE_NAMESPACE, SERVICE_NAMESPACE),
            KeyValue::new(semconv::SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
        ];
        if let Some(region) = &self.region {
            attributes.push(KeyValue::new("volley.region", region.clone()));
        }
        if let Some(namespace) = &self.namespace {
            attributes.push(KeyValue::new(semconv::K8S_NAMESPACE_NAME, namespace.clone()));
        }
        // Downward API, set in the operator's own pod spec
        if let Ok(pod) = std::env::var("POD_NAME") {
            attributes.push(KeyValue::new(semconv::K8S_POD_NAME, pod));
        }
        Resource::new(attributes)
    }
}

/// Bucket boundaries for the latency histograms, in seconds
///
/// Queue buckets step by four through the doubling backoff, 5ms up to 5 minutes.
pub fn histogram_buckets() -> [(&'static str, Vec<f64>); 3] {
    [
        (
            RECONCILE_DURATION_NAME,
            vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
        ),
        (
            IGNITION_SKEW_NAME,
            vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0],
        ),
        (
            QUEUE_BACKOFF_NAME,
            vec![0.005, 0.02, 0.08, 0.32, 1.28, 5.12, 20.48, 81.92, 300.0],
        ),
    ]
}

fn histogram_views() -> Result<Vec<Box<dyn View>>, TelemetryError> {
    histogram_buckets()
        .into_iter()
        .map(|(name, boundaries)| {
            new_view(
                Instrument::new().name(name),
                Stream::new().aggregation(Aggregation::ExplicitBucketHistogram {
                    boundaries,
                    record_min_max: true,
                }),
            )
            .map_err(|e| TelemetryError::MetricsInit(e.to_string()))
        })
        .collect()
}

/// Install the global subscriber, plus OTLP export when a collector is set
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            let resource = config.resource();
            install_meter_provider(endpoint, resource.clone())?;
            let tracer = install_tracer_provider(endpoint, resource)?
                .tracer(config.service_name.clone());
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .with_target(true),
        )
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))
}

fn install_tracer_provider(
    endpoint: &str,
    resource: Resource,
) -> Result<TracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::TracerInit(e.to_string()))?;
    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(resource)
        .build();
    global::set_tracer_provider(provider.clone());
    Ok(provider)
}

fn install_meter_provider(endpoint: &str, resource: Resource) -> Result<(), TelemetryError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    let mut builder = SdkMeterProvider::builder()
        .with_reader(PeriodicReader::builder(exporter, runtime::Tokio).build())
        .with_resource(resource);
    for view in histogram_views()? {
        builder = builder.with_view(view);
    }
    global::set_meter_provider(builder.build());
    Ok(())
}
