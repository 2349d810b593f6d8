//! Stage gate: status and readiness derived from stored versions.
//!
//! Nothing here is persisted. A [`GateView`] is a snapshot of a pipeline's
//! versions; every query on it is a pure function of that snapshot, so the
//! same versions always yield the same answers.

use std::collections::{BTreeMap, HashSet};

use uuid::Uuid;

use crate::error::StoreError;
use crate::registry::{Stage, StageStatus, StageVersion, VersionStatus, VersionStore};

/// Snapshot of one pipeline's stage versions.
#[derive(Debug, Clone, Default)]
pub struct GateView {
    versions: BTreeMap<Stage, Vec<StageVersion>>,
}

impl GateView {
    /// Builds a view from versions of a single pipeline, in any order.
    pub fn new(versions: impl IntoIterator<Item = StageVersion>) -> Self {
        let mut by_stage: BTreeMap<Stage, Vec<StageVersion>> = BTreeMap::new();
        for version in versions {
            by_stage.entry(version.stage).or_default().push(version);
        }
        for list in by_stage.values_mut() {
            list.sort_by_key(|v| v.version_number);
        }
        Self { versions: by_stage }
    }

    /// Loads the current snapshot from the store.
    pub async fn load(store: &dyn VersionStore, pipeline_id: Uuid) -> Result<Self, StoreError> {
        Ok(Self::new(store.list_versions(pipeline_id, None).await?))
    }

    /// Every version of `stage`, by version number.
    pub fn versions(&self, stage: Stage) -> &[StageVersion] {
        self.versions.get(&stage).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The versions that decide the stage's status.
    ///
    /// Single-output stages: the highest-numbered version. Batch stages:
    /// every version of the most recent batch.
    pub fn latest_versions(&self, stage: Stage) -> Vec<&StageVersion> {
        let versions = self.versions(stage);
        if stage.is_batch() {
            let Some(batch) = versions.iter().map(|v| v.batch).max() else {
                return Vec::new();
            };
            versions.iter().filter(|v| v.batch == batch).collect()
        } else {
            versions.last().into_iter().collect()
        }
    }

    /// The completed subset of [`latest_versions`](Self::latest_versions):
    /// what the next stage may consume.
    pub fn feedable_versions(&self, stage: Stage) -> Vec<&StageVersion> {
        self.latest_versions(stage)
            .into_iter()
            .filter(|v| v.is_completed())
            .collect()
    }

    /// Derived status of a stage.
    pub fn status(&self, stage: Stage) -> StageStatus {
        let latest = self.latest_versions(stage);
        if latest.is_empty() {
            return StageStatus::Uninitialized;
        }

        if stage.is_batch() {
            if latest.iter().any(|v| v.is_processing()) {
                StageStatus::Running
            } else if latest.iter().any(|v| v.is_completed()) {
                StageStatus::Completed
            } else {
                StageStatus::Failed
            }
        } else {
            match latest[0].status {
                VersionStatus::Processing => StageStatus::Running,
                VersionStatus::Completed => StageStatus::Completed,
                VersionStatus::Failed => StageStatus::Failed,
            }
        }
    }

    /// Dependencies of `stage` that are not `COMPLETED`, with their status.
    pub fn unmet_dependencies(&self, stage: Stage) -> Vec<(Stage, StageStatus)> {
        stage
            .dependencies()
            .iter()
            .map(|dep| (*dep, self.status(*dep)))
            .filter(|(_, status)| *status != StageStatus::Completed)
            .collect()
    }

    /// Whether every dependency of `stage` is `COMPLETED`.
    pub fn can_start(&self, stage: Stage) -> bool {
        self.unmet_dependencies(stage).is_empty()
    }

    /// Whether the latest versions of `stage` consumed anything other than
    /// what its dependencies can feed now, e.g. after an upstream re-run.
    pub fn is_stale(&self, stage: Stage) -> bool {
        let upstream: HashSet<Uuid> = stage
            .dependencies()
            .iter()
            .flat_map(|dep| self.feedable_versions(*dep))
            .map(|v| v.id)
            .collect();
        self.latest_versions(stage)
            .iter()
            .any(|v| v.inputs.iter().any(|id| !upstream.contains(id)))
    }

    /// Whether `stage` is `COMPLETED` and built from current upstream output,
    /// so a run may reuse it.
    pub fn is_current(&self, stage: Stage) -> bool {
        self.status(stage) == StageStatus::Completed && !self.is_stale(stage)
    }

    /// Whether every stage is current and nothing is left to run.
    pub fn is_finished(&self) -> bool {
        Stage::ALL.iter().all(|stage| self.is_current(*stage))
    }

    /// The latest stage that has any versions.
    pub fn latest_stage(&self) -> Option<Stage> {
        self.versions.keys().next_back().copied()
    }

    /// First error among the failed latest versions of `stage`, by version
    /// number.
    pub fn first_error(&self, stage: Stage) -> Option<String> {
        self.latest_versions(stage)
            .into_iter()
            .filter(|v| v.is_failed())
            .find_map(|v| v.error.clone())
    }

    /// Versions of any stage still `processing`.
    pub fn processing(&self) -> Vec<&StageVersion> {
        self.versions
            .values()
            .flatten()
            .filter(|v| v.is_processing())
            .collect()
    }
}
