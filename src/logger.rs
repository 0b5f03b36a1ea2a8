use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use opentelemetry::metrics::Counter;
use opentelemetry::{KeyValue, global};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, Protocol, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

static RESOURCE: OnceLock<Resource> = OnceLock::new();

fn get_resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name("leadflow").build())
        .clone()
}

/// Keeps the OTLP providers alive; flushes them on `shutdown`.
pub struct TelemetryGuard {
    logger_provider: Option<SdkLoggerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl TelemetryGuard {
    pub fn shutdown(self) {
        if let Some(provider) = self.logger_provider {
            let _ = provider.shutdown();
        }
        if let Some(provider) = self.meter_provider {
            let _ = provider.shutdown();
        }
    }
}

/// Installs the global `tracing` subscriber:
/// - stdout pretty-printer
/// - daily rolling text log at `root/log_file`
/// - OTLP/HTTP log + metric export when `otel_endpoint` is set
pub fn init_tracing(
    root: &Path,
    log_file: &str,
    log_level: &str,
    otel_endpoint: Option<&str>,
) -> Result<TelemetryGuard> {
    let log_path = root.join(log_file);
    let log_dir = log_path
        .parent()
        .with_context(|| format!("log file `{}` has no parent directory", log_path.display()))?;
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create {}", log_dir.display()))?;
    let file_name = log_path
        .file_name()
        .with_context(|| format!("log file `{}` has no file name", log_path.display()))?;

    let file_layer = fmt::layer()
        .with_writer(RollingFileAppender::new(Rotation::DAILY, log_dir, file_name))
        .with_ansi(false);
    let stdout_layer = fmt::layer().with_thread_names(true);

    let (otel_layer, logger_provider, meter_provider) = match otel_endpoint {
        Some(endpoint) => {
            let logger_provider = init_logs(endpoint)?;
            let meter_provider = init_metrics(endpoint)?;
            global::set_meter_provider(meter_provider.clone());

            let filter = EnvFilter::new(log_level)
                .add_directive("hyper=off".parse()?)
                .add_directive("tonic=off".parse()?)
                .add_directive("h2=off".parse()?)
                .add_directive("reqwest=off".parse()?);
            let layer = OpenTelemetryTracingBridge::new(&logger_provider).with_filter(filter);
            (Some(layer), Some(logger_provider), Some(meter_provider))
        }
        None => (None, None, None),
    };

    Registry::default()
        .with(EnvFilter::new(log_level))
        .with(stdout_layer)
        .with(file_layer)
        .with(otel_layer)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    Ok(TelemetryGuard { logger_provider, meter_provider })
}

fn init_logs(endpoint: &str) -> Result<SdkLoggerProvider> {
    let exporter = LogExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .context("could not build the OTLP log exporter")?;
    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

fn init_metrics(endpoint: &str) -> Result<SdkMeterProvider> {
    let exporter = MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .context("could not build the OTLP metric exporter")?;
    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

/// Routing counters. Backed by whatever meter provider is installed
/// globally (a no-op one unless `init_tracing` got an OTLP endpoint).
#[derive(Clone)]
pub struct DispatchMetrics {
    leads_ingested: Counter<u64>,
    messages_published: Counter<u64>,
    leads_completed: Counter<u64>,
    leads_dead_lettered: Counter<u64>,
    leads_retried: Counter<u64>,
}

impl std::fmt::Debug for DispatchMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DispatchMetrics")
    }
}

impl Default for DispatchMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchMetrics {
    pub fn new() -> Self {
        let meter = global::meter("leadflow");
        Self {
            leads_ingested: meter
                .u64_counter("leads_ingested")
                .with_description("Leads created by ingress")
                .build(),
            messages_published: meter
                .u64_counter("messages_published")
                .with_description("Task envelopes published to node queues")
                .build(),
            leads_completed: meter
                .u64_counter("leads_completed")
                .with_description("Leads that reached the end of their flow")
                .build(),
            leads_dead_lettered: meter.u64_counter("leads_dead_lettered").build(),
            leads_retried: meter.u64_counter("leads_retried").build(),
        }
    }

    pub fn ingested(&self, flow_id: &str, count: u64) {
        self.leads_ingested.add(count, &[flow_attr(flow_id)]);
    }

    pub fn published(&self, flow_id: &str, kind: &str) {
        self.messages_published
            .add(1, &[flow_attr(flow_id), KeyValue::new("node_kind", kind.to_string())]);
    }

    pub fn completed(&self, flow_id: &str) {
        self.leads_completed.add(1, &[flow_attr(flow_id)]);
    }

    pub fn dead_lettered(&self, flow_id: &str) {
        self.leads_dead_lettered.add(1, &[flow_attr(flow_id)]);
    }

    pub fn retried(&self, flow_id: &str) {
        self.leads_retried.add(1, &[flow_attr(flow_id)]);
    }
}

fn flow_attr(flow_id: &str) -> KeyValue {
    KeyValue::new("flow_id", flow_id.to_string())
}
