//! onto-forge: versioned ontology extraction pipeline for document collections.
//!
//! This library provides the stage processors, version registry and
//! orchestration needed to turn documents into a domain ontology, with every
//! stage attempt recorded as an immutable, numbered version.

// Core modules
pub mod cli;
pub mod error;
pub mod llm;
pub mod metrics;
pub mod pipeline;
pub mod prompts;
pub mod registry;
pub mod stages;
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use error::{ArtifactError, DocumentError, StoreError, TransformError};
pub use pipeline::{Orchestrator, PipelineConfig, PipelineError, PipelineRunReport};
pub use registry::{Stage, StageStatus, VersionStore};
