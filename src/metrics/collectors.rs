//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op when `init_metrics()` has not been called, so
//! library users and tests do not need a registry.

use std::time::Duration;

use super::prometheus::{
    ACTIVE_PIPELINES, QUALITY_REJECTIONS, STAGE_DURATION, STAGE_VERSIONS_TOTAL,
    TRANSFORM_CALLS_TOTAL, TRANSFORM_LATENCY,
};
use crate::registry::{Stage, VersionStatus};

/// Outcome label of a transform call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformOutcome {
    Success,
    Error,
    Timeout,
    /// The call returned, but its output failed schema validation.
    Invalid,
}

impl TransformOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransformOutcome::Success => "success",
            TransformOutcome::Error => "error",
            TransformOutcome::Timeout => "timeout",
            TransformOutcome::Invalid => "invalid",
        }
    }
}

/// Metrics collector for recording pipeline operational metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a finalized stage version.
    pub fn record_stage_version(&self, stage: Stage, status: VersionStatus) {
        if let Some(counter) = STAGE_VERSIONS_TOTAL.get() {
            counter
                .with_label_values(&[stage.as_str(), status.as_str()])
                .inc();
        }
    }

    /// Record how long a whole stage run took.
    pub fn record_stage_duration(&self, stage: Stage, elapsed: Duration) {
        if let Some(histogram) = STAGE_DURATION.get() {
            histogram
                .with_label_values(&[stage.as_str()])
                .observe(elapsed.as_secs_f64());
        }
    }

    /// Record one content transform call.
    pub fn record_transform(&self, call_site: &str, outcome: TransformOutcome, elapsed: Duration) {
        if let Some(counter) = TRANSFORM_CALLS_TOTAL.get() {
            counter
                .with_label_values(&[call_site, outcome.as_str()])
                .inc();
        }
        if let Some(histogram) = TRANSFORM_LATENCY.get() {
            histogram
                .with_label_values(&[call_site])
                .observe(elapsed.as_secs_f64());
        }

        tracing::trace!(
            call_site = call_site,
            outcome = outcome.as_str(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Recorded transform metric"
        );
    }

    pub fn record_quality_rejection(&self) {
        if let Some(counter) = QUALITY_REJECTIONS.get() {
            counter.inc();
        }
    }

    pub fn pipeline_started(&self) {
        if let Some(gauge) = ACTIVE_PIPELINES.get() {
            gauge.inc();
        }
    }

    pub fn pipeline_finished(&self) {
        if let Some(gauge) = ACTIVE_PIPELINES.get() {
            gauge.dec();
        }
    }
}
