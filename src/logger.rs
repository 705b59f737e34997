use std::fmt;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Instant;

use anyhow::{Context, Result};
use opentelemetry::metrics::{Counter, Histogram, Meter, MeterProvider};
use opentelemetry::{KeyValue, global};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, Protocol, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt as tfmt};

const SERVICE_NAME: &str = "streamroute";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogConfig {
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
    pub log_file: String,
    pub json: bool,
    pub otel_endpoint: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            log_file: "streamroute.log".to_string(),
            json: false,
            otel_endpoint: None,
        }
    }
}

static RESOURCE: OnceLock<Resource> = OnceLock::new();

fn get_resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name(SERVICE_NAME).build())
        .clone()
}

fn init_logs(endpoint: &str) -> Result<SdkLoggerProvider> {
    let exporter = LogExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .context("building otlp log exporter")?;
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
        .context("building otlp metric exporter")?;
    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

/// Owns the OTLP providers installed by [`init_tracing`]. Dropping it
/// without calling [`TelemetryGuard::shutdown`] loses buffered exports.
#[derive(Debug, Default)]
pub struct TelemetryGuard {
    logger_provider: Option<SdkLoggerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl TelemetryGuard {
    pub fn shutdown(self) {
        if let Some(provider) = self.logger_provider {
            if let Err(e) = provider.shutdown() {
                error!(error = %e, "log provider shutdown failed");
            }
        }
        if let Some(provider) = self.meter_provider {
            if let Err(e) = provider.shutdown() {
                error!(error = %e, "meter provider shutdown failed");
            }
        }
    }
}

/// Installs the global `tracing` subscriber: stdout, an optional daily
/// rolling file, and an optional OTLP bridge for logs and metrics.
pub fn init_tracing(config: &LogConfig) -> Result<(Telemetry, TelemetryGuard)> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    let stdout: Box<dyn Layer<Registry> + Send + Sync> = if config.json {
        tfmt::layer().json().with_target(true).boxed()
    } else {
        tfmt::layer().with_thread_names(true).boxed()
    };
    layers.push(stdout.with_filter(EnvFilter::new(&config.log_level)).boxed());

    if let Some(dir) = &config.log_dir {
        std::fs::create_dir_all(dir).with_context(|| format!("creating log dir {}", dir.display()))?;
        let appender = RollingFileAppender::new(Rotation::DAILY, dir, &config.log_file);
        let file_layer = tfmt::layer()
            .with_writer(appender)
            .with_ansi(false)
            .with_filter(EnvFilter::new(&config.log_level));
        layers.push(file_layer.boxed());
    }

    let mut guard = TelemetryGuard::default();
    let meter = match &config.otel_endpoint {
        Some(endpoint) => {
            let logger_provider = init_logs(endpoint)?;
            let filter = EnvFilter::new(&config.log_level)
                .add_directive("hyper=off".parse()?)
                .add_directive("h2=off".parse()?)
                .add_directive("reqwest=off".parse()?);
            layers.push(
                OpenTelemetryTracingBridge::new(&logger_provider)
                    .with_filter(filter)
                    .boxed(),
            );
            let meter_provider = init_metrics(endpoint)?;
            global::set_meter_provider(meter_provider.clone());
            let meter = meter_provider.meter(SERVICE_NAME);
            guard.logger_provider = Some(logger_provider);
            guard.meter_provider = Some(meter_provider);
            meter
        }
        None => global::meter(SERVICE_NAME),
    };

    Registry::default()
        .with(layers)
        .try_init()
        .context("installing tracing subscriber")?;

    info!(level = %config.log_level, otel = config.otel_endpoint.is_some(), "tracing initialised");
    Ok((Telemetry::new(&meter), guard))
}

/// Pipeline counters, handed to the components that record them.
#[derive(Clone)]
pub struct Telemetry {
    inputs: Counter<u64>,
    frames: Counter<u64>,
    redirects: Counter<u64>,
    failures: Counter<u64>,
    latency_ms: Histogram<f64>,
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Telemetry")
    }
}

impl Telemetry {
    pub fn new(meter: &Meter) -> Self {
        Self {
            inputs: meter
                .u64_counter("pipeline_inputs")
                .with_description("Payloads pushed through a channel rule")
                .build(),
            frames: meter
                .u64_counter("pipeline_frames")
                .with_description("Frames run through processors and outputters")
                .build(),
            redirects: meter.u64_counter("pipeline_redirects").build(),
            failures: meter.u64_counter("pipeline_failures").build(),
            latency_ms: meter
                .f64_histogram("pipeline_latency_ms")
                .with_unit("ms")
                .build(),
        }
    }

    /// Backed by the global meter, which records nothing until a provider
    /// is installed.
    pub fn noop() -> Self {
        Self::new(&global::meter(SERVICE_NAME))
    }

    pub fn input(&self, org_id: i64) {
        self.inputs.add(1, &[KeyValue::new("org_id", org_id)]);
    }

    pub fn frame(&self, org_id: i64) {
        self.frames.add(1, &[KeyValue::new("org_id", org_id)]);
    }

    pub fn redirect(&self, org_id: i64) {
        self.redirects.add(1, &[KeyValue::new("org_id", org_id)]);
    }

    pub fn finish<T, E: fmt::Display>(&self, stage: &'static str, started: Instant, result: &Result<T, E>) {
        let elapsed = started.elapsed().as_secs_f64() * 1_000.0;
        self.latency_ms.record(elapsed, &[KeyValue::new("stage", stage)]);
        if let Err(e) = result {
            self.failures.add(1, &[KeyValue::new("stage", stage)]);
            error!(stage, error = %e, latency_ms = elapsed, "pipeline call failed");
        }
    }
}
