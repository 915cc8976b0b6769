//! Structured logging setup and replication counters.
//!
//! Counters can also be exported through OpenTelemetry with the
//! `observability` feature.
//!
//! All log events use explicit targets under `duroxide_xdc::` and carry the
//! workflow key fields (`namespace_id`, `workflow_id`, `run_id`), so a filter
//! such as `duroxide_xdc::replication=debug` shows every apply/discard
//! decision.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Log format options for structured logging
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Structured JSON output for log aggregators
    Json,
    /// Human-readable format for development (with all fields)
    Pretty,
    /// Compact single-line format
    #[default]
    Compact,
}

/// Logging configuration.
///
/// `RUST_LOG` takes precedence over `log_level` when set.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_format: LogFormat,
    /// Level for `duroxide_xdc` targets (e.g. "info", "debug")
    pub log_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Compact,
            log_level: "info".to_string(),
        }
    }
}

fn default_filter_expression(level: &str) -> String {
    format!("warn,duroxide_xdc={level}")
}

/// Install a global `tracing` subscriber.
///
/// Fails if a global subscriber is already installed; callers that may run
/// more than once (tests, embedded use) can ignore the error.
pub fn init_logging(config: &LoggingConfig) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter_expression(&config.log_level)));

    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| format!("Failed to initialize JSON logging: {e}")),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .map_err(|e| format!("Failed to initialize pretty logging: {e}")),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init()
            .map_err(|e| format!("Failed to initialize compact logging: {e}")),
    }
}

/// Metrics export configuration.
///
/// Counters are always kept in-process for [`ReplicationMetrics::snapshot`].
/// With the `observability` feature they are also recorded as OpenTelemetry
/// counters, pushed over OTLP when an endpoint is set and held by a manual
/// reader otherwise.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub service_name: String,
    pub service_version: Option<String>,
    /// OTLP collector endpoint (e.g. "http://localhost:4317")
    pub metrics_export_endpoint: Option<String>,
    pub metrics_export_interval_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            service_name: "duroxide-xdc".to_string(),
            service_version: None,
            metrics_export_endpoint: None,
            metrics_export_interval_ms: 60_000,
        }
    }
}

/// The replication counters, as exported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetricKind {
    ActivitiesApplied,
    ActivitiesDiscarded,
    ResendsRequested,
    DuplicateBatches,
    NotFoundDropped,
    Commits,
}

impl MetricKind {
    #[cfg_attr(not(feature = "observability"), allow(dead_code))]
    const ALL: [MetricKind; 6] = [
        MetricKind::ActivitiesApplied,
        MetricKind::ActivitiesDiscarded,
        MetricKind::ResendsRequested,
        MetricKind::DuplicateBatches,
        MetricKind::NotFoundDropped,
        MetricKind::Commits,
    ];

    #[cfg_attr(not(feature = "observability"), allow(dead_code))]
    fn name(self) -> &'static str {
        match self {
            MetricKind::ActivitiesApplied => "duroxide_xdc_activities_applied_total",
            MetricKind::ActivitiesDiscarded => "duroxide_xdc_activities_discarded_total",
            MetricKind::ResendsRequested => "duroxide_xdc_resends_requested_total",
            MetricKind::DuplicateBatches => "duroxide_xdc_duplicate_batches_total",
            MetricKind::NotFoundDropped => "duroxide_xdc_not_found_dropped_total",
            MetricKind::Commits => "duroxide_xdc_commits_total",
        }
    }

    #[cfg_attr(not(feature = "observability"), allow(dead_code))]
    fn description(self) -> &'static str {
        match self {
            MetricKind::ActivitiesApplied => "Replicated activity updates applied",
            MetricKind::ActivitiesDiscarded => "Replicated activity updates discarded as stale or duplicate",
            MetricKind::ResendsRequested => "Activity updates answered with a history resend request",
            MetricKind::DuplicateBatches => "Sync requests in which no update applied",
            MetricKind::NotFoundDropped => "Sync requests dropped for unknown workflow runs",
            MetricKind::Commits => "Passive workflow commits",
        }
    }
}

#[cfg(feature = "observability")]
mod otel_impl {
    use super::{MetricKind, MetricsConfig};
    use opentelemetry::KeyValue;
    use opentelemetry::metrics::{Counter, MeterProvider as _};
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::Resource;
    use opentelemetry_sdk::metrics::{ManualReader, PeriodicReader, SdkMeterProvider};
    use std::time::Duration;

    /// OpenTelemetry counters mirroring [`super::ReplicationMetrics`].
    pub(super) struct MetricsExporter {
        meter_provider: SdkMeterProvider,
        counters: [Counter<u64>; 6],
    }

    impl MetricsExporter {
        pub(super) fn new(config: &MetricsConfig) -> Result<Self, String> {
            let resource = Resource::new(vec![
                KeyValue::new("service.name", config.service_name.clone()),
                KeyValue::new(
                    "service.version",
                    config.service_version.clone().unwrap_or_else(|| "unknown".to_string()),
                ),
            ]);

            let meter_provider = if let Some(ref endpoint) = config.metrics_export_endpoint {
                let exporter = opentelemetry_otlp::MetricExporter::builder()
                    .with_tonic()
                    .with_endpoint(endpoint)
                    .build()
                    .map_err(|e| format!("Failed to create metrics exporter: {e}"))?;

                let reader = PeriodicReader::builder(exporter, opentelemetry_sdk::runtime::Tokio)
                    .with_interval(Duration::from_millis(config.metrics_export_interval_ms))
                    .build();

                SdkMeterProvider::builder()
                    .with_reader(reader)
                    .with_resource(resource)
                    .build()
            } else {
                SdkMeterProvider::builder()
                    .with_reader(ManualReader::builder().build())
                    .with_resource(resource)
                    .build()
            };

            let meter = meter_provider.meter("duroxide_xdc");
            let counters = MetricKind::ALL.map(|kind| {
                meter
                    .u64_counter(kind.name())
                    .with_description(kind.description())
                    .build()
            });
            Ok(Self {
                meter_provider,
                counters,
            })
        }

        #[inline]
        pub(super) fn add(&self, kind: MetricKind) {
            self.counters[kind as usize].add(1, &[]);
        }

        pub(super) fn shutdown(&self) -> Result<(), String> {
            self.meter_provider
                .shutdown()
                .map_err(|e| format!("Failed to shutdown metrics provider: {e}"))
        }
    }

    impl std::fmt::Debug for MetricsExporter {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MetricsExporter").finish_non_exhaustive()
        }
    }
}

#[cfg(not(feature = "observability"))]
mod stub_impl {
    use super::{MetricKind, MetricsConfig};

    /// Stub exporter when the observability feature is disabled
    #[derive(Debug)]
    pub(super) struct MetricsExporter;

    impl MetricsExporter {
        pub(super) fn new(_config: &MetricsConfig) -> Result<Self, String> {
            Ok(Self)
        }

        #[inline]
        pub(super) fn add(&self, _kind: MetricKind) {}

        pub(super) fn shutdown(&self) -> Result<(), String> {
            Ok(())
        }
    }
}

#[cfg(feature = "observability")]
use otel_impl::MetricsExporter;

#[cfg(not(feature = "observability"))]
use stub_impl::MetricsExporter;

/// Snapshot of replication counters for tests and diagnostics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplicationMetricsSnapshot {
    pub activities_applied: u64,
    pub activities_discarded: u64,
    pub resends_requested: u64,
    pub duplicate_batches: u64,
    pub not_found_dropped: u64,
    pub commits: u64,
}

/// Replication counters shared by everything running against one shard.
#[derive(Debug, Default)]
pub struct ReplicationMetrics {
    activities_applied: AtomicU64,
    activities_discarded: AtomicU64,
    resends_requested: AtomicU64,
    duplicate_batches: AtomicU64,
    not_found_dropped: AtomicU64,
    commits: AtomicU64,
    exporter: Option<MetricsExporter>,
}

impl ReplicationMetrics {
    /// Counters that are also exported as configured.
    pub fn with_exporter(config: &MetricsConfig) -> Result<Self, String> {
        Ok(Self {
            exporter: Some(MetricsExporter::new(config)?),
            ..Self::default()
        })
    }

    #[inline]
    fn export(&self, kind: MetricKind) {
        if let Some(exporter) = &self.exporter {
            exporter.add(kind);
        }
    }

    #[inline]
    pub fn record_activity_applied(&self) {
        self.activities_applied.fetch_add(1, Ordering::Relaxed);
        self.export(MetricKind::ActivitiesApplied);
    }

    #[inline]
    pub fn record_activity_discarded(&self) {
        self.activities_discarded.fetch_add(1, Ordering::Relaxed);
        self.export(MetricKind::ActivitiesDiscarded);
    }

    #[inline]
    pub fn record_resend_requested(&self) {
        self.resends_requested.fetch_add(1, Ordering::Relaxed);
        self.export(MetricKind::ResendsRequested);
    }

    #[inline]
    pub fn record_duplicate_batch(&self) {
        self.duplicate_batches.fetch_add(1, Ordering::Relaxed);
        self.export(MetricKind::DuplicateBatches);
    }

    #[inline]
    pub fn record_not_found_dropped(&self) {
        self.not_found_dropped.fetch_add(1, Ordering::Relaxed);
        self.export(MetricKind::NotFoundDropped);
    }

    #[inline]
    pub fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.export(MetricKind::Commits);
    }

    pub fn snapshot(&self) -> ReplicationMetricsSnapshot {
        ReplicationMetricsSnapshot {
            activities_applied: self.activities_applied.load(Ordering::Relaxed),
            activities_discarded: self.activities_discarded.load(Ordering::Relaxed),
            resends_requested: self.resends_requested.load(Ordering::Relaxed),
            duplicate_batches: self.duplicate_batches.load(Ordering::Relaxed),
            not_found_dropped: self.not_found_dropped.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
        }
    }

    /// Flush and stop the exporter, if any.
    pub fn shutdown(&self) -> Result<(), String> {
        match &self.exporter {
            Some(exporter) => exporter.shutdown(),
            None => Ok(()),
        }
    }
}
