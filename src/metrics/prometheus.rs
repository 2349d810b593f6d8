//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by onto-forge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all onto-forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Finalized stage versions, labeled by stage and status.
pub static STAGE_VERSIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Wall-clock duration of a whole stage run, labeled by stage.
pub static STAGE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Content transform calls, labeled by call site and outcome.
pub static TRANSFORM_CALLS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Content transform latency in seconds, labeled by call site.
pub static TRANSFORM_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Documents rejected by the parse quality gate.
pub static QUALITY_REJECTIONS: OnceLock<Counter> = OnceLock::new();

/// Pipelines currently being driven by this process.
pub static ACTIVE_PIPELINES: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Safe to call more than once; later calls leave the first set of metrics
/// in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let stage_versions_total = CounterVec::new(
        Opts::new(
            "forge_stage_versions_total",
            "Total number of finalized stage versions",
        ),
        &["stage", "status"],
    )?;

    let stage_duration = HistogramVec::new(
        HistogramOpts::new(
            "forge_stage_duration_seconds",
            "Stage run duration in seconds",
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 900.0, 1800.0]),
        &["stage"],
    )?;

    let transform_calls_total = CounterVec::new(
        Opts::new(
            "forge_transform_calls_total",
            "Total content transform calls",
        ),
        &["call_site", "outcome"],
    )?;

    let transform_latency = HistogramVec::new(
        HistogramOpts::new(
            "forge_transform_latency_seconds",
            "Content transform latency in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]),
        &["call_site"],
    )?;

    let quality_rejections = Counter::new(
        "forge_quality_rejections_total",
        "Total documents rejected by the quality gate",
    )?;

    let active_pipelines = Gauge::new(
        "forge_active_pipelines",
        "Number of pipelines currently running",
    )?;

    registry.register(Box::new(stage_versions_total.clone()))?;
    registry.register(Box::new(stage_duration.clone()))?;
    registry.register(Box::new(transform_calls_total.clone()))?;
    registry.register(Box::new(transform_latency.clone()))?;
    registry.register(Box::new(quality_rejections.clone()))?;
    registry.register(Box::new(active_pipelines.clone()))?;

    // If any of these fail, metrics were already initialized
    let _ = REGISTRY.set(registry);
    let _ = STAGE_VERSIONS_TOTAL.set(stage_versions_total);
    let _ = STAGE_DURATION.set(stage_duration);
    let _ = TRANSFORM_CALLS_TOTAL.set(transform_calls_total);
    let _ = TRANSFORM_LATENCY.set(transform_latency);
    let _ = QUALITY_REJECTIONS.set(quality_rejections);
    let _ = ACTIVE_PIPELINES.set(active_pipelines);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead of failing when the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
