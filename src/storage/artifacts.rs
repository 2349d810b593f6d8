//! Artifact storage for stage outputs.
//!
//! Every stage version owns one directory:
//! `{base}/{domain}/{domain_version}/{stage}/{version_number}/`, holding
//! `output.{ext}` and, for parse, the per-page `page_N.md` and page image
//! files. Writes go to a temporary file that is renamed into place, and a
//! file whose content is already identical is left untouched, so repeating
//! a write is harmless.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::ArtifactError;
use crate::registry::Stage;

/// Result of writing one artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct WrittenArtifact {
    pub path: PathBuf,
    /// Hex sha256 of the content.
    pub checksum: String,
    pub size_bytes: u64,
    /// False when an identical file was already in place.
    pub written: bool,
}

/// Filesystem store for stage artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    base_path: PathBuf,
}

impl ArtifactStore {
    /// Creates a store rooted at `base_path`. Directories are created lazily.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Returns the base storage path.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Directory exclusively owned by one stage version.
    pub fn version_dir(
        &self,
        domain: &str,
        domain_version: u32,
        stage: Stage,
        version_number: u32,
    ) -> PathBuf {
        self.base_path
            .join(path_segment(domain))
            .join(domain_version.to_string())
            .join(stage.as_str())
            .join(version_number.to_string())
    }

    /// Path of the stage version's `output.{ext}` file.
    pub fn output_path(
        &self,
        domain: &str,
        domain_version: u32,
        stage: Stage,
        version_number: u32,
    ) -> PathBuf {
        self.version_dir(domain, domain_version, stage, version_number)
            .join(format!("output.{}", stage.output_extension()))
    }

    /// Computes the hex sha256 checksum of `data`.
    pub fn compute_checksum(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    /// Writes `data` to `path` atomically.
    ///
    /// If the file already holds exactly `data`, nothing is written.
    pub async fn write(&self, path: &Path, data: &[u8]) -> Result<WrittenArtifact, ArtifactError> {
        let checksum = Self::compute_checksum(data);
        let size_bytes = data.len() as u64;

        match fs::read(path).await {
            Ok(existing) if Self::compute_checksum(&existing) == checksum => {
                tracing::debug!(path = %path.display(), "Artifact unchanged, skipping write");
                return Ok(WrittenArtifact {
                    path: path.to_path_buf(),
                    checksum,
                    size_bytes,
                    written: false,
                });
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ArtifactError::io(path, e)),
        }

        let parent = path
            .parent()
            .ok_or_else(|| ArtifactError::NotFound(path.display().to_string()))?;
        fs::create_dir_all(parent)
            .await
            .map_err(|e| ArtifactError::io(parent, e))?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "artifact".to_string());
        let temp_path = parent.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

        let result = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, path).await
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(ArtifactError::io(path, e));
        }

        Ok(WrittenArtifact {
            path: path.to_path_buf(),
            checksum,
            size_bytes,
            written: true,
        })
    }

    /// Serializes `value` as pretty JSON and writes it.
    pub async fn write_json<T: Serialize>(
        &self,
        path: &Path,
        value: &T,
    ) -> Result<WrittenArtifact, ArtifactError> {
        let data = serde_json::to_vec_pretty(value).map_err(|e| ArtifactError::Io {
            path: path.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;
        self.write(path, &data).await
    }

    pub async fn read(&self, path: &Path) -> Result<Vec<u8>, ArtifactError> {
        fs::read(path).await.map_err(|e| ArtifactError::io(path, e))
    }

    pub async fn read_to_string(&self, path: &Path) -> Result<String, ArtifactError> {
        fs::read_to_string(path)
            .await
            .map_err(|e| ArtifactError::io(path, e))
    }

    /// Reads and deserializes a JSON artifact.
    pub async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<T, ArtifactError> {
        let data = self.read(path).await?;
        serde_json::from_slice(&data).map_err(|e| ArtifactError::Io {
            path: path.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })
    }

    /// Checks that the file at `path` still has the recorded checksum.
    pub async fn verify(&self, path: &Path, expected: &str) -> Result<(), ArtifactError> {
        let data = self.read(path).await?;
        let actual = Self::compute_checksum(&data);
        if actual != expected {
            return Err(ArtifactError::ChecksumMismatch {
                path: path.display().to_string(),
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(())
    }
}

/// Makes a domain name safe to use as a single path component.
fn path_segment(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "_".to_string(),
        s => s.to_string(),
    }
}
