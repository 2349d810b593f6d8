//! Stage processors.
//!
//! Every stage implements [`StageProcessor`]: it receives a [`StageJob`] for
//! one allocated stage version, writes exactly one `output.{ext}` artifact
//! into the version's directory, and reports a [`ProcessResult`]. Errors are
//! captured as [`ProcessorError`] and turned into a failed result; they never
//! escape `process`.
//!
//! Processors share a [`ProcessorContext`] carrying configuration, the content
//! transform, artifact storage, the document loader and metrics.

pub mod document;
pub mod extract;
pub mod group;
pub mod merge;
pub mod ontology;
pub mod parse;
pub mod schema;

pub use document::{is_page_directory, is_supported_file, DocumentLoader, FsDocumentLoader, Page};
pub use extract::{Entity, ExtractOutput, ExtractProcessor, FailedEntity};
pub use group::{GroupMetrics, GroupOutput, GroupProcessor};
pub use merge::{MergeOutput, MergeProcessor};
pub use ontology::{OntologyOutput, OntologyProcessor};
pub use parse::ParseProcessor;
pub use schema::ResponseSchema;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::{ArtifactError, DocumentError, TransformError};
use crate::llm::{transform_with_timeout, ContentTransform, TransformRequest};
use crate::metrics::{MetricsCollector, TransformOutcome};
use crate::pipeline::PipelineConfig;
use crate::prompts::StagePrompt;
use crate::registry::{SourceFile, Stage, StageVersion, VersionOutcome, VersionStatus};
use crate::storage::{ArtifactStore, WrittenArtifact};
use crate::utils::parse_json_response;

/// Errors raised inside a stage processor.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("Invalid '{call_site}' response: {message}")]
    Validation { call_site: String, message: String },

    #[error("Quality check failed: {problem}")]
    QualityRejected { confidence: f64, problem: String },

    #[error("Page {page} failed: {message}")]
    Page { page: usize, message: String },

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("{stage} processor cannot consume {found} input")]
    WrongInput { stage: Stage, found: &'static str },

    #[error("{stage} input version {version_number} has no output artifact")]
    MissingOutput { stage: Stage, version_number: u32 },
}

/// The typed inputs a stage version consumes.
#[derive(Debug, Clone)]
pub enum StageInput {
    File(SourceFile),
    Parse(StageVersion),
    Extracts(Vec<StageVersion>),
    Merge(StageVersion),
    MergeAndGroup {
        merge: StageVersion,
        group: StageVersion,
    },
}

impl StageInput {
    /// Short name of the input shape, for errors.
    pub fn kind(&self) -> &'static str {
        match self {
            StageInput::File(_) => "file",
            StageInput::Parse(_) => "parse",
            StageInput::Extracts(_) => "extracts",
            StageInput::Merge(_) => "merge",
            StageInput::MergeAndGroup { .. } => "merge+group",
        }
    }
}

/// One unit of work: produce the output of an allocated stage version.
#[derive(Debug, Clone)]
pub struct StageJob {
    pub version: StageVersion,
    pub domain: String,
    pub domain_version: u32,
    pub input: StageInput,
}

impl StageJob {
    pub fn new(
        version: StageVersion,
        domain: impl Into<String>,
        domain_version: u32,
        input: StageInput,
    ) -> Self {
        Self {
            version,
            domain: domain.into(),
            domain_version,
            input,
        }
    }

    fn wrong_input(&self) -> ProcessorError {
        ProcessorError::WrongInput {
            stage: self.version.stage,
            found: self.input.kind(),
        }
    }
}

/// Outcome reported by a processor for one stage version.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessResult {
    pub success: bool,
    pub status: VersionStatus,
    pub output_path: Option<PathBuf>,
    pub checksum: Option<String>,
    pub error: Option<String>,
}

impl ProcessResult {
    pub fn completed(artifact: WrittenArtifact) -> Self {
        Self {
            success: true,
            status: VersionStatus::Completed,
            output_path: Some(artifact.path),
            checksum: Some(artifact.checksum),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            status: VersionStatus::Failed,
            output_path: None,
            checksum: None,
            error: Some(error.into()),
        }
    }

    /// The version store finalization for this result.
    ///
    /// A success without an output path cannot be finalized as completed.
    pub fn into_outcome(self) -> VersionOutcome {
        match (self.success, self.output_path) {
            (true, Some(output_path)) => VersionOutcome::Completed {
                output_path,
                checksum: self.checksum,
            },
            (true, None) => VersionOutcome::Failed {
                error: "Processor reported success without an output".to_string(),
            },
            (false, _) => VersionOutcome::Failed {
                error: self
                    .error
                    .unwrap_or_else(|| "Unknown processing error".to_string()),
            },
        }
    }
}

impl From<Result<WrittenArtifact, ProcessorError>> for ProcessResult {
    fn from(result: Result<WrittenArtifact, ProcessorError>) -> Self {
        match result {
            Ok(artifact) => ProcessResult::completed(artifact),
            Err(e) => ProcessResult::failed(e.to_string()),
        }
    }
}

/// Uniform contract implemented by every stage.
#[async_trait]
pub trait StageProcessor: Send + Sync {
    fn stage(&self) -> Stage;

    /// Produces the job's output. Never fails: errors become a failed result.
    async fn process(&self, job: StageJob) -> ProcessResult;
}

/// Shared dependencies of the stage processors.
pub struct ProcessorContext {
    pub config: PipelineConfig,
    pub transform: Arc<dyn ContentTransform>,
    pub artifacts: ArtifactStore,
    pub documents: Arc<dyn DocumentLoader>,
    pub metrics: MetricsCollector,
}

impl ProcessorContext {
    /// Creates a context storing artifacts under `config.artifact_root` and
    /// reading documents from the filesystem.
    pub fn new(config: PipelineConfig, transform: Arc<dyn ContentTransform>) -> Self {
        let artifacts = ArtifactStore::new(config.artifact_root.clone());
        Self {
            config,
            transform,
            artifacts,
            documents: Arc::new(FsDocumentLoader::new()),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_document_loader(mut self, documents: Arc<dyn DocumentLoader>) -> Self {
        self.documents = documents;
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    /// Builds the request for a prompt and payload.
    pub fn request(&self, prompt: StagePrompt, content: impl Into<String>) -> TransformRequest {
        TransformRequest::new(prompt.call_site, prompt.system, prompt.instruction)
            .with_content(content)
    }

    /// Runs one transform call with the configured timeout and parses the
    /// response into `T`.
    pub async fn call<T: ResponseSchema>(
        &self,
        request: TransformRequest,
    ) -> Result<T, ProcessorError> {
        let call_site = request.call_site.clone();
        let started = Instant::now();

        let raw = transform_with_timeout(
            self.transform.as_ref(),
            request,
            self.config.transform_timeout,
        )
        .await;

        let raw = match raw {
            Ok(raw) => raw,
            Err(e) => {
                let outcome = match e {
                    TransformError::Timeout { .. } => TransformOutcome::Timeout,
                    _ => TransformOutcome::Error,
                };
                self.metrics
                    .record_transform(&call_site, outcome, started.elapsed());
                return Err(e.into());
            }
        };

        let parsed = parse_json_response::<T>(&raw)
            .map_err(|e| e.to_string())
            .and_then(|value| value.validate().map(|_| value));

        match parsed {
            Ok(value) => {
                self.metrics
                    .record_transform(&call_site, TransformOutcome::Success, started.elapsed());
                Ok(value)
            }
            Err(message) => {
                self.metrics
                    .record_transform(&call_site, TransformOutcome::Invalid, started.elapsed());
                Err(ProcessorError::Validation { call_site, message })
            }
        }
    }

    /// Loads the JSON output of a completed input version.
    pub(crate) async fn read_output<T: serde::de::DeserializeOwned>(
        &self,
        version: &StageVersion,
    ) -> Result<T, ProcessorError> {
        let path = version
            .output_path
            .as_ref()
            .ok_or(ProcessorError::MissingOutput {
                stage: version.stage,
                version_number: version.version_number,
            })?;
        Ok(self.artifacts.read_json(path).await?)
    }

    /// Path of a job's `output.{ext}` artifact.
    pub(crate) fn output_path(&self, job: &StageJob) -> PathBuf {
        self.artifacts.output_path(
            &job.domain,
            job.domain_version,
            job.version.stage,
            job.version.version_number,
        )
    }
}

/// The processor registered for each stage.
#[derive(Clone, Default)]
pub struct ProcessorSet {
    processors: HashMap<Stage, Arc<dyn StageProcessor>>,
}

impl ProcessorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The five standard processors sharing one context.
    pub fn standard(ctx: Arc<ProcessorContext>) -> Self {
        Self::new()
            .with_processor(Arc::new(ParseProcessor::new(ctx.clone())))
            .with_processor(Arc::new(ExtractProcessor::new(ctx.clone())))
            .with_processor(Arc::new(MergeProcessor::new(ctx.clone())))
            .with_processor(Arc::new(GroupProcessor::new(ctx.clone())))
            .with_processor(Arc::new(OntologyProcessor::new(ctx)))
    }

    /// Registers `processor` for its stage, replacing any previous one.
    pub fn with_processor(mut self, processor: Arc<dyn StageProcessor>) -> Self {
        self.processors.insert(processor.stage(), processor);
        self
    }

    pub fn get(&self, stage: Stage) -> Option<Arc<dyn StageProcessor>> {
        self.processors.get(&stage).cloned()
    }
}

/// Logs a finished job and converts its result.
fn finish(stage: Stage, job: &StageJob, result: Result<WrittenArtifact, ProcessorError>) -> ProcessResult {
    match &result {
        Ok(artifact) => tracing::info!(
            stage = %stage,
            version = job.version.version_number,
            path = %artifact.path.display(),
            "Stage output written"
        ),
        Err(e) => tracing::warn!(
            stage = %stage,
            version = job.version.version_number,
            error = %e,
            "Stage processing failed"
        ),
    }
    result.into()
}
