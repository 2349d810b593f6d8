//! Pipeline orchestration for ontology extraction.
//!
//! A pipeline turns a set of source documents into a domain ontology by
//! running five stages in order:
//!
//! 1. **Parse**: quality-check each document and transcribe it to markdown
//! 2. **Extract**: pull entities and relationships out of each transcript
//! 3. **Merge**: reconcile the extracts into one deduplicated entity set
//! 4. **Group**: organize the merged entities into groups
//! 5. **Ontology**: render the result as a Mermaid diagram
//!
//! # Components
//!
//! - **Gate**: derives stage status and readiness from stored versions
//! - **Coordinator**: fans a stage's jobs out with bounded concurrency and
//!   reduces the results to one stage outcome
//! - **Orchestrator**: drives the stages, resumes from the first stage that
//!   is not completed, and records failures on the pipeline
//! - **Status**: read-only reports for pipelines and stages
//! - **Config**: tuning for every component, from YAML and `FORGE_*`
//!   environment variables
//!
//! # Example
//!
//! ```rust,ignore
//! use onto_forge::pipeline::{Orchestrator, PipelineConfig};
//!
//! let config = PipelineConfig::from_env()?;
//! let orchestrator = Orchestrator::new(&config, store, processors)?;
//!
//! let report = orchestrator.start("banking", 1, sources).await?;
//! println!("{} finished at {} with {}", report.pipeline_id, report.stage, report.status);
//! ```

pub mod config;
pub mod coordinator;
pub mod gate;
pub mod orchestrator;
pub mod status;

pub use config::{ConfigError, PipelineConfig, MAX_PAGE_CONCURRENCY};
pub use coordinator::{fan_out, FailedTask, FanOutCoordinator, StageOutcome, TaskError, TaskResult};
pub use gate::GateView;
pub use orchestrator::{Orchestrator, PipelineError, PipelineRunReport, INTERRUPTED_ERROR};
pub use status::{
    get_pipeline_status, get_stage_status, verify_artifacts, ArtifactCheck, PipelineStatusReport,
    StageStatusReport,
};
