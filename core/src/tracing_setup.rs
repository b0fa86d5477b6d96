use crate::settings::TracingSettings;
use anyhow::Result;
use opentelemetry::{trace::TracerProvider as _, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace::TracerProvider, Resource};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

pub fn setup_tracing(tracing_settings: &TracingSettings) -> Result<()> {
  let otlp_exporter = opentelemetry_otlp::SpanExporter::builder()
    .with_tonic()
    .with_timeout(Duration::from_secs(3))
    .with_endpoint(&tracing_settings.otel_collector_endpoint)
    .build()?;

  let resource = Resource::new(vec![
    KeyValue::new("service.name", tracing_settings.service_name.clone()),
    KeyValue::new("host.name", tracing_settings.host_name.clone()),
  ]);

  let tracer_provider = TracerProvider::builder()
    .with_batch_exporter(otlp_exporter, runtime::Tokio)
    .with_resource(resource)
    .build();
  let tracer = tracer_provider.tracer("docmill");

  let registry = Registry::default()
    .with(tracing_opentelemetry::layer().with_tracer(tracer))
    .with(tracing_subscriber::fmt::layer().json())
    .with(EnvFilter::from_default_env());

  tracing::subscriber::set_global_default(registry).expect("setting default subscriber failed");

  info!("Tracing initialized");

  Ok(())
}
