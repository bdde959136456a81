//! Log output and optional OTLP trace export.

use opentelemetry::trace::TracerProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::{
    EnvFilter, Registry,
    fmt::format::FmtSpan,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LoggingFormat, TelemetryConfig};

/// Target of the outbound request/response dumps. Always enabled at debug,
/// the dumps only exist while the diagnostic transport is installed.
const DIAGNOSTIC_TARGET: &str = "pkjwt::diagnostic";

/// Flushes and shuts down the trace exporter when dropped.
///
/// Hold it for the lifetime of `main`.
pub struct OtelGuard {
    tracer_provider: Option<SdkTracerProvider>,
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.as_mut()
            && let Err(err) = provider.shutdown()
        {
            eprintln!("trace exporter shutdown failed: {err:?}");
        }
    }
}

fn resource(name: String) -> opentelemetry_sdk::Resource {
    opentelemetry_sdk::Resource::builder()
        .with_service_name(name.clone())
        .with_schema_url(
            [
                opentelemetry::KeyValue::new(
                    opentelemetry_semantic_conventions::attribute::SERVICE_VERSION,
                    env!("CARGO_PKG_VERSION"),
                ),
                opentelemetry::KeyValue::new(
                    opentelemetry_semantic_conventions::attribute::SERVICE_NAME,
                    name,
                ),
            ],
            opentelemetry_semantic_conventions::SCHEMA_URL,
        )
        .build()
}

/// OTLP over gRPC, endpoint taken from the standard `OTEL_EXPORTER_OTLP_*`
/// variables. Sampling follows the caller's decision, otherwise everything.
fn otlp_provider(name: String) -> anyhow::Result<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .build()?;

    Ok(SdkTracerProvider::builder()
        .with_sampler(opentelemetry_sdk::trace::Sampler::ParentBased(Box::new(
            opentelemetry_sdk::trace::Sampler::AlwaysOn,
        )))
        .with_resource(resource(name))
        .with_batch_exporter(exporter)
        .build())
}

/// Filter directives used when `RUST_LOG` is unset.
fn directives(config: &TelemetryConfig) -> String {
    let http = tracing::Level::from(config.http_level);
    format!(
        "{},axum={},reqwest={http},hyper_util={http},{DIAGNOSTIC_TARGET}=debug",
        tracing::Level::from(config.level),
        tracing::Level::from(config.axum_level),
    )
}

fn fmt_layer(format: LoggingFormat) -> Box<dyn Layer<Registry> + Send + Sync> {
    let layer = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_file(true);

    match format {
        LoggingFormat::Json => layer.json().flatten_event(true).boxed(),
        LoggingFormat::Pretty => layer.pretty().boxed(),
    }
}

/// Installs the global subscriber. With `otlp_enabled`, spans are also
/// exported and W3C trace context is propagated.
///
/// # Errors
/// Fails when the exporter cannot be built or a global subscriber is
/// already set.
pub fn init(config: &TelemetryConfig) -> anyhow::Result<OtelGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directives(config)));

    let tracer_provider = if config.otlp_enabled {
        opentelemetry::global::set_text_map_propagator(
            opentelemetry_sdk::propagation::TraceContextPropagator::new(),
        );
        Some(otlp_provider(config.service_name.clone())?)
    } else {
        None
    };

    let otel_layer = tracer_provider.as_ref().map(|provider| {
        tracing_opentelemetry::OpenTelemetryLayer::new(provider.tracer(env!("CARGO_PKG_NAME")))
    });

    tracing_subscriber::registry()
        .with(fmt_layer(config.format))
        .with(otel_layer)
        .with(filter)
        .try_init()?;

    Ok(OtelGuard { tracer_provider })
}
