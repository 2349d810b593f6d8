//! Read-only status queries for pipelines and stages.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;
use uuid::Uuid;

use super::gate::GateView;
use crate::error::StoreError;
use crate::registry::{PipelineStage, Stage, StageStatus, StageVersion, VersionStore};
use crate::storage::ArtifactStore;

/// Status of one stage of a pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct StageStatusReport {
    pub stage: Stage,
    pub status: StageStatus,
    pub can_start: bool,
    /// Every version of the stage, by version number.
    pub versions: Vec<StageVersion>,
    pub latest_version_id: Option<Uuid>,
}

/// Status of a pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatusReport {
    pub pipeline_id: Uuid,
    pub domain: String,
    pub domain_version: u32,
    pub stage: PipelineStage,
    pub status: StageStatus,
    pub error: Option<String>,
    /// Ids of the versions that decide each stage's status.
    pub latest_version_ids: BTreeMap<Stage, Vec<Uuid>>,
}

pub async fn get_stage_status(
    store: &dyn VersionStore,
    pipeline_id: Uuid,
    stage: Stage,
) -> Result<StageStatusReport, StoreError> {
    if store.get_pipeline(pipeline_id).await?.is_none() {
        return Err(StoreError::PipelineNotFound(pipeline_id));
    }
    let view = GateView::load(store, pipeline_id).await?;

    Ok(StageStatusReport {
        stage,
        status: view.status(stage),
        can_start: view.can_start(stage),
        versions: view.versions(stage).to_vec(),
        latest_version_id: view.versions(stage).last().map(|v| v.id),
    })
}

/// Derives the pipeline's position from its versions.
///
/// The stage is the latest one with any versions and the status is that
/// stage's derived status, except that a record marked failed (for example
/// by a dependency check that created no versions) always reports failed.
pub async fn get_pipeline_status(
    store: &dyn VersionStore,
    pipeline_id: Uuid,
) -> Result<PipelineStatusReport, StoreError> {
    let pipeline = store
        .get_pipeline(pipeline_id)
        .await?
        .ok_or(StoreError::PipelineNotFound(pipeline_id))?;
    let view = GateView::load(store, pipeline_id).await?;

    let latest = view.latest_stage();
    let (stage, mut status) = match latest {
        Some(stage) => (PipelineStage::from(stage), view.status(stage)),
        None => (PipelineStage::NotStarted, StageStatus::Uninitialized),
    };

    if pipeline.status == StageStatus::Failed {
        status = StageStatus::Failed;
    }

    let error = if status == StageStatus::Failed {
        pipeline
            .error
            .clone()
            .or_else(|| latest.and_then(|s| view.first_error(s)))
    } else {
        None
    };

    let latest_version_ids = Stage::ALL
        .iter()
        .map(|s| (*s, view.latest_versions(*s).iter().map(|v| v.id).collect::<Vec<_>>()))
        .filter(|(_, ids)| !ids.is_empty())
        .collect();

    Ok(PipelineStatusReport {
        pipeline_id,
        domain: pipeline.domain,
        domain_version: pipeline.domain_version,
        stage,
        status,
        error,
        latest_version_ids,
    })
}

/// Checksum check of one completed version's output.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactCheck {
    pub stage: Stage,
    pub version_id: Uuid,
    pub path: PathBuf,
    pub intact: bool,
    pub error: Option<String>,
}

/// Re-hashes the outputs of every stage's latest completed versions and
/// compares them with the checksums recorded when they were written.
///
/// Versions without a recorded checksum are skipped.
pub async fn verify_artifacts(
    store: &dyn VersionStore,
    artifacts: &ArtifactStore,
    pipeline_id: Uuid,
) -> Result<Vec<ArtifactCheck>, StoreError> {
    if store.get_pipeline(pipeline_id).await?.is_none() {
        return Err(StoreError::PipelineNotFound(pipeline_id));
    }
    let view = GateView::load(store, pipeline_id).await?;

    let mut checks = Vec::new();
    for stage in Stage::ALL {
        for version in view.latest_versions(stage) {
            let (Some(path), Some(checksum)) = (&version.output_path, &version.checksum) else {
                continue;
            };
            if !version.is_completed() {
                continue;
            }
            let error = artifacts.verify(path, checksum).await.err();
            if let Some(e) = &error {
                tracing::warn!(version_id = %version.id, stage = %stage, error = %e, "Artifact check failed");
            }
            checks.push(ArtifactCheck {
                stage,
                version_id: version.id,
                path: path.clone(),
                intact: error.is_none(),
                error: error.map(|e| e.to_string()),
            });
        }
    }
    Ok(checks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{InMemoryVersionStore, NewVersion, PipelineUpdate, SourceFile, VersionOutcome};
    use std::path::PathBuf;

    async fn parse_version(store: &InMemoryVersionStore, pipeline_id: Uuid, outcome: VersionOutcome) -> StageVersion {
        let batch = store.allocate_batch(pipeline_id, Stage::Parse).await.unwrap();
        let version = store
            .begin_version(
                NewVersion::new(pipeline_id, Stage::Parse, batch)
                    .with_source(SourceFile::from_bytes("/docs/a.txt", b"a")),
            )
            .await
            .unwrap();
        store.finish_version(version.id, outcome).await.unwrap()
    }

    #[tokio::test]
    async fn test_unknown_pipeline() {
        let store = InMemoryVersionStore::new();
        let err = get_pipeline_status(&store, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StoreError::PipelineNotFound(_)));
    }

    #[tokio::test]
    async fn test_fresh_pipeline_not_started() {
        let store = InMemoryVersionStore::new();
        let pipeline = store.create_pipeline("banking", 1).await.unwrap();

        let report = get_pipeline_status(&store, pipeline.id).await.unwrap();
        assert_eq!(report.stage, PipelineStage::NotStarted);
        assert_eq!(report.status, StageStatus::Uninitialized);
        assert!(report.latest_version_ids.is_empty());

        let stage = get_stage_status(&store, pipeline.id, Stage::Parse).await.unwrap();
        assert!(stage.can_start);
        assert!(stage.versions.is_empty());
    }

    #[tokio::test]
    async fn test_failed_parse_reports_version_error() {
        let store = InMemoryVersionStore::new();
        let pipeline = store.create_pipeline("banking", 1).await.unwrap();
        let version = parse_version(
            &store,
            pipeline.id,
            VersionOutcome::Failed {
                error: "Quality check failed: blurry".to_string(),
            },
        )
        .await;

        let report = get_pipeline_status(&store, pipeline.id).await.unwrap();
        assert_eq!(report.stage, PipelineStage::Parse);
        assert_eq!(report.status, StageStatus::Failed);
        assert_eq!(report.error.as_deref(), Some("Quality check failed: blurry"));
        assert_eq!(report.latest_version_ids[&Stage::Parse], vec![version.id]);

        let extract = get_stage_status(&store, pipeline.id, Stage::Extract).await.unwrap();
        assert_eq!(extract.status, StageStatus::Uninitialized);
        assert!(!extract.can_start);
    }

    #[tokio::test]
    async fn test_failed_record_wins_over_derived_status() {
        let store = InMemoryVersionStore::new();
        let pipeline = store.create_pipeline("banking", 1).await.unwrap();
        parse_version(
            &store,
            pipeline.id,
            VersionOutcome::Completed {
                output_path: PathBuf::from("/tmp/output.md"),
                checksum: None,
            },
        )
        .await;
        store
            .update_pipeline(
                pipeline.id,
                PipelineUpdate::new(Stage::Merge, StageStatus::Failed)
                    .with_error("Dependency not satisfied: merge requires extract"),
            )
            .await
            .unwrap();

        let report = get_pipeline_status(&store, pipeline.id).await.unwrap();
        assert_eq!(report.stage, PipelineStage::Parse);
        assert_eq!(report.status, StageStatus::Failed);
        assert_eq!(
            report.error.as_deref(),
            Some("Dependency not satisfied: merge requires extract")
        );

        let parse = get_stage_status(&store, pipeline.id, Stage::Parse).await.unwrap();
        assert_eq!(parse.status, StageStatus::Completed);
        assert_eq!(parse.latest_version_id, Some(parse.versions[0].id));
    }

    #[tokio::test]
    async fn test_verify_artifacts_detects_edits() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = ArtifactStore::new(dir.path());
        let store = InMemoryVersionStore::new();
        let pipeline = store.create_pipeline("banking", 1).await.unwrap();

        let path = artifacts.output_path("banking", 1, Stage::Parse, 1);
        let written = artifacts.write(&path, b"# Accounts").await.unwrap();
        let version = parse_version(
            &store,
            pipeline.id,
            VersionOutcome::Completed {
                output_path: path.clone(),
                checksum: Some(written.checksum),
            },
        )
        .await;

        let checks = verify_artifacts(&store, &artifacts, pipeline.id).await.unwrap();
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].version_id, version.id);
        assert!(checks[0].intact);

        std::fs::write(&path, "# Accounts, edited").unwrap();
        let checks = verify_artifacts(&store, &artifacts, pipeline.id).await.unwrap();
        assert!(!checks[0].intact);
        assert!(checks[0].error.as_deref().unwrap().starts_with("Checksum mismatch"));
    }
}
