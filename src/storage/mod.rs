//! Filesystem storage for stage artifacts.
//!
//! Version metadata lives in the [`crate::registry`] version store; the
//! artifacts themselves (markdown, page images, JSON outputs) are plain files
//! under a deterministic directory per stage version.
//!
//! ```rust,ignore
//! use onto_forge::storage::ArtifactStore;
//! use onto_forge::registry::Stage;
//!
//! let store = ArtifactStore::new("./artifacts");
//! let path = store.output_path("banking", 1, Stage::Parse, 1);
//! let written = store.write(&path, markdown.as_bytes()).await?;
//! ```

pub mod artifacts;

pub use artifacts::{ArtifactStore, WrittenArtifact};
