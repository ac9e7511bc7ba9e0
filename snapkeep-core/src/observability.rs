/*!
Observability infrastructure for snapkeep.

This module provides:
- Structured logging setup (text or JSON) through `tracing-subscriber`
- Prometheus counters for snapshot activity behind the `metrics` feature
*/

#[cfg(feature = "metrics")]
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{Result, SnapshotError};

/// Global metrics instance; `None` when registration failed
#[cfg(feature = "metrics")]
static METRICS: OnceLock<Option<SnapkeepMetrics>> = OnceLock::new();

/// Metrics collection for snapshot operations
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct SnapkeepMetrics {
    pub snapshots_created_total: Counter,
    pub snapshot_failures_total: Counter,
    pub restores_total: Counter,
    pub retention_deleted_total: Counter,
    pub snapshot_size_bytes: Histogram,

    // Prometheus registry for scraping
    registry: Registry,
}

#[cfg(feature = "metrics")]
fn metric_error(name: &str, e: prometheus::Error) -> SnapshotError {
    SnapshotError::Scheduler(format!("Failed to set up metric {name}: {e}"))
}

#[cfg(feature = "metrics")]
impl SnapkeepMetrics {
    /// Initialize new metrics instance
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<Counter> {
            let counter = Counter::new(name, help).map_err(|e| metric_error(name, e))?;
            registry
                .register(Box::new(counter.clone()))
                .map_err(|e| metric_error(name, e))?;
            Ok(counter)
        };

        let snapshots_created_total = counter(
            "snapkeep_snapshots_created_total",
            "Snapshots successfully created",
        )?;
        let snapshot_failures_total = counter(
            "snapkeep_snapshot_failures_total",
            "Snapshot creations that failed",
        )?;
        let restores_total = counter("snapkeep_restores_total", "Completed restores")?;
        let retention_deleted_total = counter(
            "snapkeep_retention_deleted_total",
            "Snapshots removed by the retention policy",
        )?;

        let snapshot_size_bytes = Histogram::with_opts(
            HistogramOpts::new("snapkeep_snapshot_size_bytes", "Size of created snapshots in bytes")
                .buckets(prometheus::exponential_buckets(1024.0, 4.0, 12).map_err(|e| {
                    metric_error("snapkeep_snapshot_size_bytes", e)
                })?),
        )
        .map_err(|e| metric_error("snapkeep_snapshot_size_bytes", e))?;
        registry
            .register(Box::new(snapshot_size_bytes.clone()))
            .map_err(|e| metric_error("snapkeep_snapshot_size_bytes", e))?;

        Ok(Self {
            snapshots_created_total,
            snapshot_failures_total,
            restores_total,
            retention_deleted_total,
            snapshot_size_bytes,
            registry,
        })
    }

    /// Get or initialize the global metrics instance
    pub fn global() -> Option<&'static SnapkeepMetrics> {
        METRICS
            .get_or_init(|| match Self::new() {
                Ok(metrics) => Some(metrics),
                Err(e) => {
                    tracing::warn!(error = %e, "Metrics disabled");
                    None
                }
            })
            .as_ref()
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| metric_error("encoder", e))?;

        String::from_utf8(buffer)
            .map_err(|e| SnapshotError::Scheduler(format!("Metrics output was not UTF-8: {e}")))
    }
}

#[cfg(feature = "metrics")]
pub(crate) fn record_snapshot_created(size_bytes: u64) {
    if let Some(metrics) = SnapkeepMetrics::global() {
        metrics.snapshots_created_total.inc();
        metrics.snapshot_size_bytes.observe(size_bytes as f64);
    }
}

#[cfg(feature = "metrics")]
pub(crate) fn record_snapshot_failure() {
    if let Some(metrics) = SnapkeepMetrics::global() {
        metrics.snapshot_failures_total.inc();
    }
}

#[cfg(feature = "metrics")]
pub(crate) fn record_restore() {
    if let Some(metrics) = SnapkeepMetrics::global() {
        metrics.restores_total.inc();
    }
}

#[cfg(feature = "metrics")]
pub(crate) fn record_retention_deleted(count: usize) {
    if let Some(metrics) = SnapkeepMetrics::global() {
        metrics.retention_deleted_total.inc_by(count as f64);
    }
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn record_snapshot_created(_size_bytes: u64) {}

#[cfg(not(feature = "metrics"))]
pub(crate) fn record_snapshot_failure() {}

#[cfg(not(feature = "metrics"))]
pub(crate) fn record_restore() {}

#[cfg(not(feature = "metrics"))]
pub(crate) fn record_retention_deleted(_count: usize) {}

/// Log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Initialize the global tracing subscriber
///
/// `RUST_LOG` takes precedence; otherwise `default_directive` (for example
/// `snapkeep=info`) sets the level.
///
/// # Returns
/// An error if a global subscriber is already installed or the directive is invalid
pub fn init_observability(format: LogFormat, default_directive: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_directive).map_err(|e| {
            SnapshotError::config(format!("invalid log directive '{default_directive}': {e}"))
        })?,
    };

    let result = match format {
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_target(false)
                .with_current_span(false);
            set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
        }
        LogFormat::Text => {
            let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
            set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
        }
    };

    result.map_err(|e| {
        SnapshotError::Scheduler(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::debug!(?format, "snapkeep observability initialized");
    Ok(())
}

/// Initialize observability with text output at `snapkeep=info`
pub fn init_default_observability() -> Result<()> {
    init_observability(LogFormat::Text, "snapkeep=info,snapkeep_core=info")
}

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording_and_gathering() {
        record_snapshot_created(4096);
        record_snapshot_failure();
        record_restore();
        record_retention_deleted(2);

        let metrics = SnapkeepMetrics::global().expect("metrics registered");
        assert!(metrics.retention_deleted_total.get() >= 2.0);

        let text = metrics.gather_metrics().unwrap();
        assert!(text.contains("snapkeep_snapshots_created_total"));
        assert!(text.contains("snapkeep_snapshot_size_bytes"));
    }
}
