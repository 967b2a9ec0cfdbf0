use anyhow::Result;
use opentelemetry::trace::TracerProvider as _;
use tracing::subscriber::Subscriber;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Layer, Registry};

/// Whether span data should additionally be exported to an OpenTelemetry collector.
///
/// This is the deployment's optional observability sink. The exporter endpoint is configured via
/// the standard `OTEL_EXPORTER_OTLP_*` environment variables; an unreachable collector only
/// degrades span export and is reported by the exporter's own warnings, it never fails the
/// process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenTelemetry {
    Enabled,
    Disabled,
}

impl OpenTelemetry {
    fn is_enabled(self) -> bool {
        self == OpenTelemetry::Enabled
    }
}

/// Configures tracing and optionally enables an OpenTelemetry OTLP exporter.
///
/// The OTLP configuration is controlled via environment variables as defined in the
/// [specification](https://github.com/open-telemetry/opentelemetry-specification/blob/main/specification/protocol/exporter.md#opentelemetry-protocol-exporter).
pub fn setup_tracing(otel: OpenTelemetry) -> Result<()> {
    let otel_layer = if otel.is_enabled() {
        Some(open_telemetry_layer()?)
    } else {
        None
    };

    let subscriber = Registry::default().with(stdout_layer()).with(otel_layer);
    tracing::subscriber::set_global_default(subscriber).map_err(Into::into)
}

fn open_telemetry_layer<S>() -> Result<Box<dyn Layer<S> + Send + Sync + 'static>>
where
    S: Subscriber + Sync + Send,
    for<'a> S: tracing_subscriber::registry::LookupSpan<'a>,
{
    let exporter = opentelemetry_otlp::SpanExporter::builder().with_tonic().build()?;

    let tracer_provider = opentelemetry_sdk::trace::TracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .build();

    let tracer = tracer_provider.tracer("folio");
    Ok(OpenTelemetryLayer::new(tracer).boxed())
}

fn stdout_layer<S>() -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: Subscriber,
    for<'a> S: tracing_subscriber::registry::LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .compact()
        .with_level(true)
        .with_target(true)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .boxed()
}
