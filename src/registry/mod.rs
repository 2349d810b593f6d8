//! Version registry for pipelines and their stage versions.
//!
//! This module provides:
//! - The fixed set of pipeline stages and their dependency order
//! - Pipeline and stage-version records with lineage edges
//! - The `VersionStore` trait, with in-memory and SQLite implementations
//!
//! Stage versions are append-only. A version is created in the `processing`
//! state, finalized exactly once, and never deleted. Version numbers are
//! scoped to (pipeline, stage), start at 1, and are never reused, including
//! for failed attempts.

pub mod memory;
pub mod schema;
pub mod sqlite;

pub use memory::InMemoryVersionStore;
pub use sqlite::SqliteVersionStore;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::StoreError;

/// One of the five fixed pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Parse,
    Extract,
    Merge,
    Group,
    Ontology,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Stage; 5] = [
        Stage::Parse,
        Stage::Extract,
        Stage::Merge,
        Stage::Group,
        Stage::Ontology,
    ];

    /// Lowercase name used in paths, logs and the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Parse => "parse",
            Stage::Extract => "extract",
            Stage::Merge => "merge",
            Stage::Group => "group",
            Stage::Ontology => "ontology",
        }
    }

    /// Parses a stage from its lowercase name.
    pub fn parse(s: &str) -> Option<Stage> {
        match s.trim().to_lowercase().as_str() {
            "parse" => Some(Stage::Parse),
            "extract" => Some(Stage::Extract),
            "merge" => Some(Stage::Merge),
            "group" => Some(Stage::Group),
            "ontology" => Some(Stage::Ontology),
            _ => None,
        }
    }

    /// Batch stages create one version per input in an attempt batch.
    pub fn is_batch(&self) -> bool {
        matches!(self, Stage::Parse | Stage::Extract)
    }

    /// Extension of the stage's `output.*` artifact.
    pub fn output_extension(&self) -> &'static str {
        match self {
            Stage::Parse => "md",
            _ => "json",
        }
    }

    /// Stages that must be completed before this one can start.
    pub fn dependencies(&self) -> &'static [Stage] {
        match self {
            Stage::Parse => &[],
            Stage::Extract => &[Stage::Parse],
            Stage::Merge => &[Stage::Extract],
            Stage::Group => &[Stage::Merge],
            Stage::Ontology => &[Stage::Merge, Stage::Group],
        }
    }

    /// The stage that follows this one, if any.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Parse => Some(Stage::Extract),
            Stage::Extract => Some(Stage::Merge),
            Stage::Merge => Some(Stage::Group),
            Stage::Group => Some(Stage::Ontology),
            Stage::Ontology => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a single stage version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    Processing,
    Completed,
    Failed,
}

impl VersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionStatus::Processing => "processing",
            VersionStatus::Completed => "completed",
            VersionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<VersionStatus> {
        match s {
            "processing" => Some(VersionStatus::Processing),
            "completed" => Some(VersionStatus::Completed),
            "failed" => Some(VersionStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Aggregate status of a stage or a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Uninitialized,
    Running,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Uninitialized => "UNINITIALIZED",
            StageStatus::Running => "RUNNING",
            StageStatus::Completed => "COMPLETED",
            StageStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<StageStatus> {
        match s {
            "UNINITIALIZED" => Some(StageStatus::Uninitialized),
            "RUNNING" => Some(StageStatus::Running),
            "COMPLETED" => Some(StageStatus::Completed),
            "FAILED" => Some(StageStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Position of a pipeline in the stage sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStage {
    NotStarted,
    Parse,
    Extract,
    Merge,
    Group,
    Ontology,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::NotStarted => "NOT_STARTED",
            PipelineStage::Parse => "PARSE",
            PipelineStage::Extract => "EXTRACT",
            PipelineStage::Merge => "MERGE",
            PipelineStage::Group => "GROUP",
            PipelineStage::Ontology => "ONTOLOGY",
        }
    }

    pub fn parse(s: &str) -> Option<PipelineStage> {
        match s {
            "NOT_STARTED" => Some(PipelineStage::NotStarted),
            "PARSE" => Some(PipelineStage::Parse),
            "EXTRACT" => Some(PipelineStage::Extract),
            "MERGE" => Some(PipelineStage::Merge),
            "GROUP" => Some(PipelineStage::Group),
            "ONTOLOGY" => Some(PipelineStage::Ontology),
            _ => None,
        }
    }

    /// The concrete stage, or `None` before the first stage starts.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineStage::NotStarted => None,
            PipelineStage::Parse => Some(Stage::Parse),
            PipelineStage::Extract => Some(Stage::Extract),
            PipelineStage::Merge => Some(Stage::Merge),
            PipelineStage::Group => Some(Stage::Group),
            PipelineStage::Ontology => Some(Stage::Ontology),
        }
    }
}

impl From<Stage> for PipelineStage {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Parse => PipelineStage::Parse,
            Stage::Extract => PipelineStage::Extract,
            Stage::Merge => PipelineStage::Merge,
            Stage::Group => PipelineStage::Group,
            Stage::Ontology => PipelineStage::Ontology,
        }
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An external file version consumed by the parse stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    /// Identity of this file version.
    pub id: Uuid,
    /// Location of the file (or page-image directory) on disk.
    pub path: PathBuf,
    /// Display name, usually the file name.
    pub name: String,
}

impl SourceFile {
    pub fn new(id: Uuid, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        Self { id, path, name }
    }

    /// Derives a content-addressed file version id from the file's bytes.
    ///
    /// The same bytes always map to the same id, so re-submitting an
    /// unchanged file references the same file version.
    pub fn from_bytes(path: impl Into<PathBuf>, bytes: &[u8]) -> Self {
        let digest = hex::encode(Sha256::digest(bytes));
        let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, digest.as_bytes());
        Self::new(id, path)
    }

    /// Reads the file and derives its version id from the content.
    ///
    /// Directories of pre-rendered pages are identified by their path.
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        if path.is_dir() {
            let key = path.display().to_string();
            let id = Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes());
            return Ok(Self::new(id, path));
        }
        let bytes = std::fs::read(path)?;
        Ok(Self::from_bytes(path, &bytes))
    }
}

/// One document-ingestion run for a domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: Uuid,
    pub domain: String,
    pub domain_version: u32,
    pub stage: PipelineStage,
    pub status: StageStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pipeline {
    pub fn new(domain: impl Into<String>, domain_version: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            domain: domain.into(),
            domain_version,
            stage: PipelineStage::NotStarted,
            status: StageStatus::Uninitialized,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// New stage/status/error values for a pipeline record.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineUpdate {
    pub stage: PipelineStage,
    pub status: StageStatus,
    pub error: Option<String>,
}

impl PipelineUpdate {
    pub fn new(stage: impl Into<PipelineStage>, status: StageStatus) -> Self {
        Self {
            stage: stage.into(),
            status,
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// One immutable, numbered attempt record for a stage within a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageVersion {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub stage: Stage,
    pub version_number: u32,
    /// Attempt batch this version belongs to (scoped to pipeline and stage).
    pub batch: u32,
    /// Lineage edges: ids of the versions this one was produced from.
    pub inputs: Vec<Uuid>,
    /// External file version consumed by a parse version.
    pub source: Option<SourceFile>,
    pub status: VersionStatus,
    pub error: Option<String>,
    pub output_path: Option<PathBuf>,
    /// Hex sha256 of the output artifact.
    pub checksum: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StageVersion {
    pub fn is_completed(&self) -> bool {
        self.status == VersionStatus::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.status == VersionStatus::Failed
    }

    pub fn is_processing(&self) -> bool {
        self.status == VersionStatus::Processing
    }

    /// Applies a finalization outcome. Only valid while processing.
    pub(crate) fn finalize(&mut self, outcome: VersionOutcome) -> Result<(), StoreError> {
        if !self.is_processing() {
            return Err(StoreError::AlreadyFinalized {
                id: self.id,
                status: self.status.to_string(),
            });
        }
        match outcome {
            VersionOutcome::Completed {
                output_path,
                checksum,
            } => {
                self.status = VersionStatus::Completed;
                self.output_path = Some(output_path);
                self.checksum = checksum;
            }
            VersionOutcome::Failed { error } => {
                self.status = VersionStatus::Failed;
                self.error = Some(error);
            }
        }
        self.finished_at = Some(Utc::now());
        Ok(())
    }
}

/// Request to open a new stage version.
#[derive(Debug, Clone)]
pub struct NewVersion {
    pub pipeline_id: Uuid,
    pub stage: Stage,
    pub batch: u32,
    pub inputs: Vec<Uuid>,
    pub source: Option<SourceFile>,
}

impl NewVersion {
    pub fn new(pipeline_id: Uuid, stage: Stage, batch: u32) -> Self {
        Self {
            pipeline_id,
            stage,
            batch,
            inputs: Vec::new(),
            source: None,
        }
    }

    pub fn with_inputs(mut self, inputs: Vec<Uuid>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_source(mut self, source: SourceFile) -> Self {
        self.source = Some(source);
        self
    }

    /// Builds the processing record once a version number is allocated.
    pub(crate) fn into_version(self, version_number: u32) -> StageVersion {
        StageVersion {
            id: Uuid::new_v4(),
            pipeline_id: self.pipeline_id,
            stage: self.stage,
            version_number,
            batch: self.batch,
            inputs: self.inputs,
            source: self.source,
            status: VersionStatus::Processing,
            error: None,
            output_path: None,
            checksum: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// How a stage version was finalized.
#[derive(Debug, Clone, PartialEq)]
pub enum VersionOutcome {
    Completed {
        output_path: PathBuf,
        checksum: Option<String>,
    },
    Failed {
        error: String,
    },
}

/// Append-only registry of pipelines and stage versions.
///
/// Implementations must serialize version-number allocation so that
/// concurrent callers never observe duplicate or gapped numbers.
#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Creates a pipeline in `NOT_STARTED / UNINITIALIZED`.
    async fn create_pipeline(&self, domain: &str, domain_version: u32)
        -> Result<Pipeline, StoreError>;

    async fn get_pipeline(&self, id: Uuid) -> Result<Option<Pipeline>, StoreError>;

    async fn list_pipelines(&self) -> Result<Vec<Pipeline>, StoreError>;

    /// Overwrites the pipeline's stage, status and error.
    async fn update_pipeline(&self, id: Uuid, update: PipelineUpdate)
        -> Result<Pipeline, StoreError>;

    /// Reserves the next attempt batch number for (pipeline, stage).
    async fn allocate_batch(&self, pipeline_id: Uuid, stage: Stage) -> Result<u32, StoreError>;

    /// Validates lineage, allocates the next version number and inserts a
    /// `processing` version, atomically.
    async fn begin_version(&self, new: NewVersion) -> Result<StageVersion, StoreError>;

    /// Finalizes a `processing` version. Fails if it was already finalized.
    async fn finish_version(
        &self,
        id: Uuid,
        outcome: VersionOutcome,
    ) -> Result<StageVersion, StoreError>;

    async fn get_version(&self, id: Uuid) -> Result<Option<StageVersion>, StoreError>;

    /// Versions of a pipeline ordered by stage, then version number.
    async fn list_versions(
        &self,
        pipeline_id: Uuid,
        stage: Option<Stage>,
    ) -> Result<Vec<StageVersion>, StoreError>;
}

/// Checks the lineage rules for a new version against its resolved inputs.
///
/// `inputs` must hold the records for every id in `new.inputs`, in any order.
pub(crate) fn validate_lineage(
    new: &NewVersion,
    inputs: &[StageVersion],
) -> Result<(), StoreError> {
    if new.batch == 0 {
        return Err(StoreError::InvalidLineage(
            "batch numbers start at 1".to_string(),
        ));
    }

    for id in &new.inputs {
        let input = inputs.iter().find(|v| v.id == *id).ok_or_else(|| {
            StoreError::InvalidLineage(format!("input version '{}' does not exist", id))
        })?;
        if input.pipeline_id != new.pipeline_id {
            return Err(StoreError::InvalidLineage(format!(
                "input version '{}' belongs to another pipeline",
                id
            )));
        }
        if input.stage >= new.stage {
            return Err(StoreError::InvalidLineage(format!(
                "{} version cannot consume a {} version",
                new.stage, input.stage
            )));
        }
        if !input.is_completed() {
            return Err(StoreError::InvalidLineage(format!(
                "input {} version {} is {}, not completed",
                input.stage, input.version_number, input.status
            )));
        }
    }

    let count = |stage: Stage| inputs.iter().filter(|v| v.stage == stage).count();

    let shape_ok = match new.stage {
        Stage::Parse => new.inputs.is_empty() && new.source.is_some(),
        Stage::Extract => new.inputs.len() == 1 && count(Stage::Parse) == 1,
        Stage::Merge => !new.inputs.is_empty() && count(Stage::Extract) == new.inputs.len(),
        Stage::Group => new.inputs.len() == 1 && count(Stage::Merge) == 1,
        Stage::Ontology => {
            new.inputs.len() == 2 && count(Stage::Merge) == 1 && count(Stage::Group) == 1
        }
    };

    if !shape_ok {
        return Err(StoreError::InvalidLineage(format!(
            "{} version has an invalid input set ({} inputs, source: {})",
            new.stage,
            new.inputs.len(),
            new.source.is_some()
        )));
    }

    Ok(())
}
