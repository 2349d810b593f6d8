//! Metrics module for Prometheus-based monitoring.
//!
//! Tracks stage versions, stage durations, content transform calls and
//! quality-gate rejections.
//!
//! # Example
//!
//! ```ignore
//! use onto_forge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics()?;
//! let collector = MetricsCollector::new();
//! collector.record_quality_rejection();
//! println!("{}", export_metrics());
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{MetricsCollector, TransformOutcome};
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_PIPELINES, QUALITY_REJECTIONS, REGISTRY, STAGE_DURATION, STAGE_VERSIONS_TOTAL,
    TRANSFORM_CALLS_TOTAL, TRANSFORM_LATENCY,
};
