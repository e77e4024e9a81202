use std::future::Future;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Instant;

use anyhow::Result;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::{
    logs::SdkLoggerProvider, metrics::SdkMeterProvider, trace::SdkTracerProvider,
};
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};
use url::Url;

pub const SERVICE_NAME: &str = "omnigate";
pub const LOG_FILE: &str = "omnigate.log";
pub const REQUEST_FILE: &str = "requests.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info` or `omnigate=debug,info`.
    pub level: String,
    /// When set, logs go to daily rolling files in this directory instead
    /// of stdout.
    pub log_dir: Option<PathBuf>,
    /// OTLP/gRPC collector. Takes precedence over files.
    pub otel_endpoint: Option<Url>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            log_dir: None,
            otel_endpoint: None,
        }
    }
}

/// Keeps the installed telemetry alive. Call [`TelemetryGuard::shutdown`]
/// before exit so batched OTLP data is flushed.
pub enum TelemetryGuard {
    Stdout,
    Files,
    Otlp(Telemetry),
}

impl TelemetryGuard {
    pub fn shutdown(self) {
        if let TelemetryGuard::Otlp(telemetry) = self {
            telemetry.shutdown();
        }
    }
}

pub fn init_tracing(config: &LogConfig) -> Result<TelemetryGuard> {
    if let Some(endpoint) = &config.otel_endpoint {
        let telemetry = Telemetry::init(&config.level, endpoint.as_str())?;
        return Ok(TelemetryGuard::Otlp(telemetry));
    }
    if let Some(dir) = &config.log_dir {
        init_files(&config.level, dir.clone())?;
        return Ok(TelemetryGuard::Files);
    }
    Registry::default()
        .with(EnvFilter::new(&config.level))
        .with(fmt::layer().with_target(true))
        .try_init()?;
    Ok(TelemetryGuard::Stdout)
}

/// Plain text log plus a JSON line per request (target `request`), both
/// rolled daily.
fn init_files(log_level: &str, dir: PathBuf) -> Result<()> {
    std::fs::create_dir_all(&dir)?;

    let txt_appender = RollingFileAppender::new(Rotation::DAILY, &dir, LOG_FILE);
    let txt_layer = fmt::Layer::default()
        .with_writer(txt_appender)
        .with_ansi(false)
        .with_filter(EnvFilter::new(log_level));

    let json_appender = RollingFileAppender::new(Rotation::DAILY, &dir, REQUEST_FILE);
    let json_layer = fmt::layer()
        .json()
        .with_writer(json_appender)
        .with_target(true)
        .with_filter(EnvFilter::new("request=info"));

    Registry::default().with(txt_layer).with(json_layer).try_init()?;
    info!("logging to {}", dir.display());
    Ok(())
}

static RESOURCE: OnceLock<Resource> = OnceLock::new();

fn resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name(SERVICE_NAME).build())
        .clone()
}

/// OTLP/gRPC providers for logs, traces and metrics.
pub struct Telemetry {
    pub logger_provider: SdkLoggerProvider,
    pub tracer_provider: SdkTracerProvider,
    pub meter_provider: SdkMeterProvider,
}

impl Telemetry {
    pub fn init(log_level: &str, endpoint: &str) -> Result<Self> {
        let log_exporter = LogExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()?;
        let logger_provider = SdkLoggerProvider::builder()
            .with_batch_exporter(log_exporter)
            .with_resource(resource())
            .build();

        let span_exporter = SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()?;
        let tracer_provider = SdkTracerProvider::builder()
            .with_batch_exporter(span_exporter)
            .with_resource(resource())
            .build();

        let metric_exporter = MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()?;
        let meter_provider = SdkMeterProvider::builder()
            .with_periodic_exporter(metric_exporter)
            .with_resource(resource())
            .build();

        // the exporters' own transport must not feed back into the bridge
        let bridge_filter = EnvFilter::new(log_level)
            .add_directive("hyper=off".parse()?)
            .add_directive("tonic=off".parse()?)
            .add_directive("h2=off".parse()?);
        let otel_layer = OpenTelemetryTracingBridge::new(&logger_provider).with_filter(bridge_filter);

        let fmt_layer = fmt::layer()
            .with_thread_names(true)
            .with_filter(EnvFilter::new(log_level));

        Registry::default().with(otel_layer).with(fmt_layer).try_init()?;

        global::set_tracer_provider(tracer_provider.clone());
        global::set_meter_provider(meter_provider.clone());
        info!("exporting telemetry to {}", endpoint);

        Ok(Self {
            logger_provider,
            tracer_provider,
            meter_provider,
        })
    }

    pub fn shutdown(self) {
        if let Err(err) = self.tracer_provider.shutdown() {
            error!("tracer provider shutdown failed: {err}");
        }
        if let Err(err) = self.meter_provider.shutdown() {
            error!("meter provider shutdown failed: {err}");
        }
        if let Err(err) = self.logger_provider.shutdown() {
            eprintln!("logger provider shutdown failed: {err}");
        }
    }
}

/// Gateway counters. Recorded against the global meter, which is a no-op
/// until OTLP is configured.
#[derive(Clone)]
pub struct Metrics {
    pub messages_received: Counter<u64>,
    pub messages_sent: Counter<u64>,
    pub messages_failed: Counter<u64>,
    pub escalations: Counter<u64>,
    pub request_latency_ms: Histogram<f64>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let meter = global::meter(SERVICE_NAME);
        Self {
            messages_received: meter
                .u64_counter("messages_received")
                .with_description("Inbound messages persisted")
                .build(),
            messages_sent: meter.u64_counter("messages_sent").build(),
            messages_failed: meter.u64_counter("messages_failed").build(),
            escalations: meter
                .u64_counter("escalations")
                .with_description("Conversations escalated to a human")
                .build(),
            request_latency_ms: meter
                .f64_histogram("request_latency_ms")
                .with_description("Latency per request in ms")
                .with_unit("ms")
                .build(),
        }
    }

    /// Runs `handler`, records its latency and writes one JSON line with
    /// target `request`.
    pub async fn instrument_request<F, Fut, T, E>(&self, name: &str, handler: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let start = Instant::now();
        let result = handler().await;
        let elapsed = start.elapsed().as_secs_f64() * 1_000.0;

        let status = if result.is_ok() { "ok" } else { "error" };
        self.request_latency_ms.record(
            elapsed,
            &[
                KeyValue::new("request", name.to_string()),
                KeyValue::new("status", status),
            ],
        );
        if let Err(err) = &result {
            error!(error = %err, "request `{}` failed in {:.1} ms", name, elapsed);
        }
        tracing::event!(
            target: "request",
            tracing::Level::INFO,
            request = name,
            latency_ms = elapsed,
            status,
        );
        result
    }
}
