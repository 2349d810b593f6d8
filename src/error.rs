//! Error types for onto-forge operations.
//!
//! Defines the error types shared across subsystems:
//! - Content transform (LLM) calls
//! - Version store persistence and lineage validation
//! - Artifact storage on the filesystem
//! - Document loading for the parse stage

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by a content transform call.
///
/// Every variant is recoverable at the batch level: the processor that made
/// the call turns it into a failed result for its own input only.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("Missing API base URL: LITELLM_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("Transform request failed: {0}")]
    Request(String),

    #[error("Transform '{call_site}' timed out after {seconds} seconds")]
    Timeout { call_site: String, seconds: u64 },

    #[error("Transform '{0}' returned an empty response")]
    EmptyResponse(String),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Rate limited: {0}")]
    RateLimited(String),
}

/// Errors that can occur in the version store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Pipeline '{0}' not found")]
    PipelineNotFound(Uuid),

    #[error("Pipeline '{existing}' already covers domain '{domain}' version {domain_version}; resume it or use another domain version")]
    DuplicatePipeline {
        domain: String,
        domain_version: u32,
        existing: Uuid,
    },

    #[error("Stage version '{0}' not found")]
    VersionNotFound(Uuid),

    #[error("Stage version '{id}' is already finalized as '{status}'")]
    AlreadyFinalized { id: Uuid, status: String },

    #[error("Invalid lineage: {0}")]
    InvalidLineage(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors that can occur while reading or writing stage artifacts.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("IO error at '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("Checksum mismatch for '{path}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },
}

impl ArtifactError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            return ArtifactError::NotFound(path.display().to_string());
        }
        ArtifactError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Errors that can occur while loading a source document into pages.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Unsupported document type '{extension}' for '{path}'")]
    Unsupported { path: String, extension: String },

    #[error("Document '{0}' has no pages")]
    Empty(String),

    #[error("Invalid PDF '{path}': {message}")]
    Pdf { path: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_transform_error_display() {
        let err = TransformError::Timeout {
            call_site: "quality".to_string(),
            seconds: 30,
        };
        assert!(err.to_string().contains("quality"));
        assert!(err.to_string().contains("30"));
    }

    #[test]
    fn test_artifact_not_found_mapping() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = ArtifactError::io(Path::new("/tmp/x/output.md"), io);
        assert!(matches!(err, ArtifactError::NotFound(_)));

        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err = ArtifactError::io(Path::new("/tmp/x/output.md"), io);
        assert!(matches!(err, ArtifactError::Io { .. }));
    }

    #[test]
    fn test_store_error_display() {
        let id = Uuid::new_v4();
        let err = StoreError::AlreadyFinalized {
            id,
            status: "completed".to_string(),
        };
        assert!(err.to_string().contains(&id.to_string()));
        assert!(err.to_string().contains("completed"));
    }
}
