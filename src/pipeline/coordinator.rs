//! Fan-out/fan-in coordination.
//!
//! [`fan_out`] runs independent work items concurrently behind a semaphore,
//! collects them in completion order and returns them re-sorted by a stable
//! key, so aggregation never depends on scheduling. Panics inside a work item
//! are captured as failed results.
//!
//! [`FanOutCoordinator`] applies the same pattern to whole stage jobs: every
//! allocated version is processed, finalized in the version store exactly
//! once, and the results are reduced to a [`StageOutcome`].

use std::any::Any;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::error::StoreError;
use crate::metrics::MetricsCollector;
use crate::registry::{Stage, StageStatus, VersionStore};
use crate::stages::{ProcessResult, StageJob, StageProcessor};

/// Why a fanned-out work item did not produce a value.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskError<E> {
    Failed(E),
    Panicked(String),
}

impl<E: fmt::Display> fmt::Display for TaskError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Failed(e) => write!(f, "{}", e),
            TaskError::Panicked(msg) => write!(f, "Task panicked: {}", msg),
        }
    }
}

/// Result of one work item, tagged with its ordering key.
#[derive(Debug)]
pub struct TaskResult<K, R, E> {
    pub key: K,
    pub result: Result<R, TaskError<E>>,
}

/// Runs `work` over every item with at most `limit` in flight.
///
/// Results come back sorted by `key`, regardless of completion order.
pub async fn fan_out<T, K, R, E, KF, F, Fut>(
    items: Vec<T>,
    limit: usize,
    key: KF,
    work: F,
) -> Vec<TaskResult<K, R, E>>
where
    K: Ord,
    KF: Fn(&T) -> K,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let semaphore = Semaphore::new(limit.max(1));
    let semaphore = &semaphore;
    let work = &work;

    let mut pending: FuturesUnordered<_> = items
        .into_iter()
        .map(|item| {
            let key = key(&item);
            async move {
                // The semaphore is never closed.
                let _permit = semaphore.acquire().await.ok();
                let result = AssertUnwindSafe(async move { work(item).await })
                    .catch_unwind()
                    .await;
                let result = match result {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(TaskError::Failed(e)),
                    Err(panic) => Err(TaskError::Panicked(panic_message(panic))),
                };
                TaskResult { key, result }
            }
        })
        .collect();

    let mut results = Vec::with_capacity(pending.len());
    while let Some(done) = pending.next().await {
        results.push(done);
    }

    results.sort_by(|a, b| a.key.cmp(&b.key));
    results
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A stage version that finished as failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedTask {
    pub version_id: Uuid,
    pub version_number: u32,
    pub error: String,
}

/// Reduced result of running one stage attempt batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageOutcome {
    pub stage: Stage,
    /// Completed version ids, by version number.
    pub completed: Vec<Uuid>,
    /// Failed versions, by version number.
    pub failed: Vec<FailedTask>,
    pub status: StageStatus,
    pub error: Option<String>,
}

impl StageOutcome {
    /// Applies the partial-failure policy to per-version results.
    ///
    /// The stage completes when at least one version completed. When every
    /// version failed, a single input reports its own error and a larger
    /// batch reports the first failure by version number.
    pub fn reduce(stage: Stage, completed: Vec<Uuid>, failed: Vec<FailedTask>) -> Self {
        if !completed.is_empty() {
            return Self {
                stage,
                completed,
                failed,
                status: StageStatus::Completed,
                error: None,
            };
        }

        let error = match failed.as_slice() {
            [] => format!("No {} inputs to process", stage),
            [only] => only.error.clone(),
            [first, ..] => format!("All {} tasks failed: {}", stage, first.error),
        };

        Self {
            stage,
            completed,
            failed,
            status: StageStatus::Failed,
            error: Some(error),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == StageStatus::Completed
    }
}

/// Runs stage jobs concurrently and finalizes their versions.
pub struct FanOutCoordinator {
    store: Arc<dyn VersionStore>,
    metrics: MetricsCollector,
    concurrency: usize,
}

impl FanOutCoordinator {
    pub fn new(store: Arc<dyn VersionStore>, concurrency: usize) -> Self {
        Self {
            store,
            metrics: MetricsCollector::new(),
            concurrency,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    /// Processes every job and finalizes each version exactly once.
    ///
    /// Individual job failures (including panics) never fail this call; only
    /// version store errors do.
    pub async fn run_stage(
        &self,
        processor: &dyn StageProcessor,
        jobs: Vec<StageJob>,
    ) -> Result<StageOutcome, StoreError> {
        let stage = processor.stage();
        let started = Instant::now();

        tracing::info!(stage = %stage, jobs = jobs.len(), "Running stage");

        let results = fan_out(
            jobs,
            self.concurrency,
            |job| (job.version.version_number, job.version.id),
            |job| async move { Ok::<_, Infallible>(processor.process(job).await) },
        )
        .await;

        let mut completed = Vec::new();
        let mut failed = Vec::new();

        for TaskResult {
            key: (version_number, version_id),
            result,
        } in results
        {
            let result = match result {
                Ok(result) => result,
                Err(e) => ProcessResult::failed(e.to_string()),
            };

            let version = self
                .store
                .finish_version(version_id, result.into_outcome())
                .await?;
            self.metrics.record_stage_version(stage, version.status);

            if version.is_failed() {
                let error = version.error.unwrap_or_default();
                tracing::warn!(
                    stage = %stage,
                    version = version_number,
                    error = %error,
                    "Stage version failed"
                );
                failed.push(FailedTask {
                    version_id,
                    version_number,
                    error,
                });
            } else {
                tracing::debug!(stage = %stage, version = version_number, "Stage version completed");
                completed.push(version_id);
            }
        }

        self.metrics.record_stage_duration(stage, started.elapsed());

        let outcome = StageOutcome::reduce(stage, completed, failed);
        tracing::info!(
            stage = %stage,
            status = %outcome.status,
            completed = outcome.completed.len(),
            failed = outcome.failed.len(),
            "Stage finished"
        );
        Ok(outcome)
    }
}
