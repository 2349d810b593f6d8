//! Pipeline orchestrator.
//!
//! Drives a pipeline through PARSE, EXTRACT, MERGE, GROUP and ONTOLOGY in
//! order. Before each stage the gate is re-derived from the store. A stage
//! that is `COMPLETED` and was built from the current output of its
//! dependencies is reused as lineage; any other stage is (re)run with a fresh
//! attempt batch, which in turn makes everything downstream stale. A
//! `FAILED` stage stops the run and marks the pipeline failed.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use super::config::{ConfigError, PipelineConfig};
use super::coordinator::{FanOutCoordinator, StageOutcome};
use super::gate::GateView;
use crate::error::StoreError;
use crate::metrics::MetricsCollector;
use crate::registry::{
    NewVersion, Pipeline, PipelineStage, PipelineUpdate, SourceFile, Stage, StageStatus,
    VersionOutcome, VersionStore,
};
use crate::stages::{ProcessorSet, StageInput, StageJob};

/// Error recorded on versions left `processing` by a crashed run.
pub const INTERRUPTED_ERROR: &str = "Interrupted before completion";

/// Errors that can occur while driving a pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Version store error: {0}")]
    Store(#[from] StoreError),

    #[error("Pipeline '{0}' not found")]
    NotFound(Uuid),

    #[error("Pipeline '{0}' is already running")]
    AlreadyRunning(Uuid),

    #[error("Dependency not satisfied: {stage} requires {required}")]
    DependencyNotSatisfied { stage: Stage, required: String },

    #[error("Pipeline '{0}' has no source files to parse")]
    NoSources(Uuid),

    #[error("No processor registered for stage {0}")]
    MissingProcessor(Stage),
}

/// Summary of one orchestrator run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRunReport {
    pub pipeline_id: Uuid,
    pub status: StageStatus,
    pub stage: PipelineStage,
    pub error: Option<String>,
    /// Outcomes of the stages executed by this run, in order.
    pub stages: Vec<StageOutcome>,
}

impl PipelineRunReport {
    fn from_pipeline(pipeline: &Pipeline, stages: Vec<StageOutcome>) -> Self {
        Self {
            pipeline_id: pipeline.id,
            status: pipeline.status,
            stage: pipeline.stage,
            error: pipeline.error.clone(),
            stages,
        }
    }
}

/// Removes the pipeline from the active set when the run ends.
struct ActiveGuard<'a> {
    active: &'a Mutex<HashSet<Uuid>>,
    id: Uuid,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.id);
        }
    }
}

/// Coordinates stage execution for pipelines.
pub struct Orchestrator {
    store: Arc<dyn VersionStore>,
    processors: ProcessorSet,
    coordinator: FanOutCoordinator,
    metrics: MetricsCollector,
    active: Mutex<HashSet<Uuid>>,
}

impl Orchestrator {
    /// Creates an orchestrator.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Config` if the configuration is invalid.
    pub fn new(
        config: &PipelineConfig,
        store: Arc<dyn VersionStore>,
        processors: ProcessorSet,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let metrics = MetricsCollector::new();
        let coordinator = FanOutCoordinator::new(store.clone(), config.stage_concurrency)
            .with_metrics(metrics.clone());

        Ok(Self {
            store,
            processors,
            coordinator,
            metrics,
            active: Mutex::new(HashSet::new()),
        })
    }

    pub fn store(&self) -> &Arc<dyn VersionStore> {
        &self.store
    }

    /// Creates a pipeline for `domain` and runs it over `sources`.
    pub async fn start(
        &self,
        domain: &str,
        domain_version: u32,
        sources: Vec<SourceFile>,
    ) -> Result<PipelineRunReport, PipelineError> {
        let pipeline = self.store.create_pipeline(domain, domain_version).await?;
        tracing::info!(
            pipeline_id = %pipeline.id,
            domain = %domain,
            domain_version,
            sources = sources.len(),
            "Pipeline created"
        );
        self.run(pipeline.id, sources).await
    }

    /// Runs (or resumes) a pipeline until it completes or a stage fails.
    ///
    /// `sources` are only needed while parsing has not completed; when empty,
    /// the files consumed by earlier parse attempts are reused. Running a
    /// pipeline whose every stage is current is a no-op.
    pub async fn run(
        &self,
        pipeline_id: Uuid,
        sources: Vec<SourceFile>,
    ) -> Result<PipelineRunReport, PipelineError> {
        let _guard = self.acquire(pipeline_id)?;

        let pipeline = self.current(pipeline_id).await?;
        self.recover_interrupted(pipeline_id).await?;

        let view = GateView::load(self.store.as_ref(), pipeline_id).await?;
        if view.is_finished() {
            tracing::info!(pipeline_id = %pipeline_id, "Pipeline already completed");
            let pipeline = self.mark_completed(pipeline).await?;
            return Ok(PipelineRunReport::from_pipeline(&pipeline, Vec::new()));
        }

        self.metrics.pipeline_started();
        let result = self.drive(&pipeline, sources).await;
        self.metrics.pipeline_finished();
        result
    }

    async fn drive(
        &self,
        pipeline: &Pipeline,
        sources: Vec<SourceFile>,
    ) -> Result<PipelineRunReport, PipelineError> {
        let mut outcomes = Vec::new();

        for stage in Stage::ALL {
            let view = GateView::load(self.store.as_ref(), pipeline.id).await?;
            if view.is_current(stage) {
                tracing::debug!(pipeline_id = %pipeline.id, stage = %stage, "Reusing completed stage");
                continue;
            }
            if view.is_stale(stage) {
                tracing::info!(
                    pipeline_id = %pipeline.id,
                    stage = %stage,
                    "Upstream output changed, re-running stage"
                );
            }

            let outcome = self.execute_stage(pipeline, stage, &view, &sources).await?;
            let failed = !outcome.is_completed();
            outcomes.push(outcome);

            if failed {
                let current = self.current(pipeline.id).await?;
                return Ok(PipelineRunReport::from_pipeline(&current, outcomes));
            }
        }

        let finished = self.mark_completed(pipeline.clone()).await?;
        tracing::info!(pipeline_id = %pipeline.id, "Pipeline completed");
        Ok(PipelineRunReport::from_pipeline(&finished, outcomes))
    }

    /// Records the pipeline as completed at ONTOLOGY unless it already is.
    async fn mark_completed(&self, pipeline: Pipeline) -> Result<Pipeline, PipelineError> {
        if pipeline.stage == PipelineStage::Ontology && pipeline.status == StageStatus::Completed {
            return Ok(pipeline);
        }
        Ok(self
            .store
            .update_pipeline(
                pipeline.id,
                PipelineUpdate::new(Stage::Ontology, StageStatus::Completed),
            )
            .await?)
    }

    /// Runs a single stage of a pipeline after checking its dependencies.
    ///
    /// The pipeline record mirrors the stage's derived status afterwards.
    pub async fn run_stage(
        &self,
        pipeline_id: Uuid,
        stage: Stage,
        sources: Vec<SourceFile>,
    ) -> Result<StageOutcome, PipelineError> {
        let _guard = self.acquire(pipeline_id)?;
        let pipeline = self.current(pipeline_id).await?;
        self.recover_interrupted(pipeline_id).await?;

        let view = GateView::load(self.store.as_ref(), pipeline_id).await?;
        self.execute_stage(&pipeline, stage, &view, &sources).await
    }

    async fn execute_stage(
        &self,
        pipeline: &Pipeline,
        stage: Stage,
        view: &GateView,
        sources: &[SourceFile],
    ) -> Result<StageOutcome, PipelineError> {
        let unmet = view.unmet_dependencies(stage);
        if !unmet.is_empty() {
            let required = unmet
                .iter()
                .map(|(dep, status)| format!("{} COMPLETED (is {})", dep, status))
                .collect::<Vec<_>>()
                .join(", ");
            let err = PipelineError::DependencyNotSatisfied { stage, required };
            tracing::warn!(pipeline_id = %pipeline.id, stage = %stage, error = %err, "Stage blocked");
            self.store
                .update_pipeline(
                    pipeline.id,
                    PipelineUpdate::new(stage, StageStatus::Failed).with_error(err.to_string()),
                )
                .await?;
            return Err(err);
        }

        let processor = self
            .processors
            .get(stage)
            .ok_or(PipelineError::MissingProcessor(stage))?;

        let inputs = self.stage_inputs(pipeline, stage, view, sources)?;
        let batch = self.store.allocate_batch(pipeline.id, stage).await?;

        let mut jobs = Vec::with_capacity(inputs.len());
        for (new, input) in inputs {
            let version = self
                .store
                .begin_version(NewVersion { batch, ..new })
                .await?;
            jobs.push(StageJob::new(
                version,
                pipeline.domain.clone(),
                pipeline.domain_version,
                input,
            ));
        }

        self.store
            .update_pipeline(pipeline.id, PipelineUpdate::new(stage, StageStatus::Running))
            .await?;
        tracing::info!(
            pipeline_id = %pipeline.id,
            stage = %stage,
            batch,
            jobs = jobs.len(),
            "Stage started"
        );

        let outcome = self.coordinator.run_stage(processor.as_ref(), jobs).await?;

        let view = GateView::load(self.store.as_ref(), pipeline.id).await?;
        let status = view.status(stage);
        let mut update = PipelineUpdate::new(stage, status);
        if status == StageStatus::Failed {
            let error = outcome
                .error
                .clone()
                .or_else(|| view.first_error(stage))
                .unwrap_or_else(|| format!("{} failed", stage));
            tracing::warn!(pipeline_id = %pipeline.id, stage = %stage, error = %error, "Stage failed");
            update = update.with_error(error);
        }
        self.store.update_pipeline(pipeline.id, update).await?;

        Ok(outcome)
    }

    /// Builds the version requests and inputs for one attempt of `stage`.
    ///
    /// The batch number is filled in by the caller.
    fn stage_inputs(
        &self,
        pipeline: &Pipeline,
        stage: Stage,
        view: &GateView,
        sources: &[SourceFile],
    ) -> Result<Vec<(NewVersion, StageInput)>, PipelineError> {
        let new = |inputs: Vec<Uuid>| NewVersion::new(pipeline.id, stage, 0).with_inputs(inputs);

        let inputs = match stage {
            Stage::Parse => {
                let sources = if sources.is_empty() {
                    previous_sources(view)
                } else {
                    dedup_sources(sources)
                };
                if sources.is_empty() {
                    return Err(PipelineError::NoSources(pipeline.id));
                }
                sources
                    .into_iter()
                    .map(|source| {
                        (
                            new(Vec::new()).with_source(source.clone()),
                            StageInput::File(source),
                        )
                    })
                    .collect()
            }
            Stage::Extract => view
                .feedable_versions(Stage::Parse)
                .into_iter()
                .map(|parse| (new(vec![parse.id]), StageInput::Parse(parse.clone())))
                .collect(),
            Stage::Merge => {
                let extracts: Vec<_> = view
                    .feedable_versions(Stage::Extract)
                    .into_iter()
                    .cloned()
                    .collect();
                let ids = extracts.iter().map(|v| v.id).collect();
                vec![(new(ids), StageInput::Extracts(extracts))]
            }
            Stage::Group => view
                .feedable_versions(Stage::Merge)
                .into_iter()
                .map(|merge| (new(vec![merge.id]), StageInput::Merge(merge.clone())))
                .collect(),
            Stage::Ontology => {
                let merge = view.feedable_versions(Stage::Merge).into_iter().next();
                let group = view.feedable_versions(Stage::Group).into_iter().next();
                match (merge, group) {
                    (Some(merge), Some(group)) => vec![(
                        new(vec![merge.id, group.id]),
                        StageInput::MergeAndGroup {
                            merge: merge.clone(),
                            group: group.clone(),
                        },
                    )],
                    _ => Vec::new(),
                }
            }
        };
        Ok(inputs)
    }

    /// Fails versions left `processing` by a run that never finished them.
    async fn recover_interrupted(&self, pipeline_id: Uuid) -> Result<(), PipelineError> {
        let view = GateView::load(self.store.as_ref(), pipeline_id).await?;
        for version in view.processing() {
            tracing::warn!(
                pipeline_id = %pipeline_id,
                stage = %version.stage,
                version = version.version_number,
                "Recovering interrupted stage version"
            );
            self.store
                .finish_version(
                    version.id,
                    VersionOutcome::Failed {
                        error: INTERRUPTED_ERROR.to_string(),
                    },
                )
                .await?;
        }
        Ok(())
    }

    fn acquire(&self, pipeline_id: Uuid) -> Result<ActiveGuard<'_>, PipelineError> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| PipelineError::AlreadyRunning(pipeline_id))?;
        if !active.insert(pipeline_id) {
            return Err(PipelineError::AlreadyRunning(pipeline_id));
        }
        Ok(ActiveGuard {
            active: &self.active,
            id: pipeline_id,
        })
    }

    async fn current(&self, pipeline_id: Uuid) -> Result<Pipeline, PipelineError> {
        self.store
            .get_pipeline(pipeline_id)
            .await?
            .ok_or(PipelineError::NotFound(pipeline_id))
    }
}

/// Distinct source files, first occurrence wins.
fn dedup_sources(sources: &[SourceFile]) -> Vec<SourceFile> {
    let mut seen = HashSet::new();
    sources
        .iter()
        .filter(|s| seen.insert(s.id))
        .cloned()
        .collect()
}

/// Source files consumed by the pipeline's earlier parse attempts.
fn previous_sources(view: &GateView) -> Vec<SourceFile> {
    let sources: Vec<SourceFile> = view
        .versions(Stage::Parse)
        .iter()
        .filter_map(|v| v.source.clone())
        .collect();
    dedup_sources(&sources)
}
