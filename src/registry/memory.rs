//! In-memory version store.
//!
//! Keeps pipelines and stage versions in an arena guarded by a single
//! `RwLock`. Allocation and insertion happen under one write guard, which
//! gives the single-writer discipline version numbering relies on.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    validate_lineage, NewVersion, Pipeline, PipelineUpdate, Stage, StageVersion, VersionOutcome,
    VersionStore,
};
use crate::error::StoreError;

#[derive(Default)]
struct Arena {
    pipelines: HashMap<Uuid, Pipeline>,
    versions: HashMap<Uuid, StageVersion>,
    /// Highest allocated batch per (pipeline, stage).
    batches: HashMap<(Uuid, Stage), u32>,
}

impl Arena {
    fn next_version_number(&self, pipeline_id: Uuid, stage: Stage) -> u32 {
        self.versions
            .values()
            .filter(|v| v.pipeline_id == pipeline_id && v.stage == stage)
            .map(|v| v.version_number)
            .max()
            .unwrap_or(0)
            + 1
    }
}

/// Version store that lives for the duration of the process.
#[derive(Default)]
pub struct InMemoryVersionStore {
    arena: RwLock<Arena>,
}

impl InMemoryVersionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VersionStore for InMemoryVersionStore {
    async fn create_pipeline(
        &self,
        domain: &str,
        domain_version: u32,
    ) -> Result<Pipeline, StoreError> {
        let mut arena = self.arena.write().await;
        if let Some(existing) = arena
            .pipelines
            .values()
            .find(|p| p.domain == domain && p.domain_version == domain_version)
        {
            return Err(StoreError::DuplicatePipeline {
                domain: domain.to_string(),
                domain_version,
                existing: existing.id,
            });
        }
        let pipeline = Pipeline::new(domain, domain_version);
        arena.pipelines.insert(pipeline.id, pipeline.clone());
        Ok(pipeline)
    }

    async fn get_pipeline(&self, id: Uuid) -> Result<Option<Pipeline>, StoreError> {
        Ok(self.arena.read().await.pipelines.get(&id).cloned())
    }

    async fn list_pipelines(&self) -> Result<Vec<Pipeline>, StoreError> {
        let arena = self.arena.read().await;
        let mut pipelines: Vec<Pipeline> = arena.pipelines.values().cloned().collect();
        pipelines.sort_by_key(|p| p.created_at);
        Ok(pipelines)
    }

    async fn update_pipeline(
        &self,
        id: Uuid,
        update: PipelineUpdate,
    ) -> Result<Pipeline, StoreError> {
        let mut arena = self.arena.write().await;
        let pipeline = arena
            .pipelines
            .get_mut(&id)
            .ok_or(StoreError::PipelineNotFound(id))?;
        pipeline.stage = update.stage;
        pipeline.status = update.status;
        pipeline.error = update.error;
        pipeline.updated_at = Utc::now();
        Ok(pipeline.clone())
    }

    async fn allocate_batch(&self, pipeline_id: Uuid, stage: Stage) -> Result<u32, StoreError> {
        let mut arena = self.arena.write().await;
        if !arena.pipelines.contains_key(&pipeline_id) {
            return Err(StoreError::PipelineNotFound(pipeline_id));
        }
        let from_versions = arena
            .versions
            .values()
            .filter(|v| v.pipeline_id == pipeline_id && v.stage == stage)
            .map(|v| v.batch)
            .max()
            .unwrap_or(0);
        let entry = arena.batches.entry((pipeline_id, stage)).or_insert(0);
        let next = (*entry).max(from_versions) + 1;
        *entry = next;
        Ok(next)
    }

    async fn begin_version(&self, new: NewVersion) -> Result<StageVersion, StoreError> {
        let mut arena = self.arena.write().await;
        if !arena.pipelines.contains_key(&new.pipeline_id) {
            return Err(StoreError::PipelineNotFound(new.pipeline_id));
        }

        let inputs: Vec<StageVersion> = new
            .inputs
            .iter()
            .filter_map(|id| arena.versions.get(id).cloned())
            .collect();
        validate_lineage(&new, &inputs)?;

        let number = arena.next_version_number(new.pipeline_id, new.stage);
        let version = new.into_version(number);
        arena.versions.insert(version.id, version.clone());
        Ok(version)
    }

    async fn finish_version(
        &self,
        id: Uuid,
        outcome: VersionOutcome,
    ) -> Result<StageVersion, StoreError> {
        let mut arena = self.arena.write().await;
        let version = arena
            .versions
            .get_mut(&id)
            .ok_or(StoreError::VersionNotFound(id))?;
        version.finalize(outcome)?;
        Ok(version.clone())
    }

    async fn get_version(&self, id: Uuid) -> Result<Option<StageVersion>, StoreError> {
        Ok(self.arena.read().await.versions.get(&id).cloned())
    }

    async fn list_versions(
        &self,
        pipeline_id: Uuid,
        stage: Option<Stage>,
    ) -> Result<Vec<StageVersion>, StoreError> {
        let arena = self.arena.read().await;
        let mut versions: Vec<StageVersion> = arena
            .versions
            .values()
            .filter(|v| v.pipeline_id == pipeline_id)
            .filter(|v| stage.map_or(true, |s| v.stage == s))
            .cloned()
            .collect();
        versions.sort_by_key(|v| (v.stage, v.version_number));
        Ok(versions)
    }
}
