//! Group stage: organize merged entities into groups.
//!
//! The transform proposes groups and relationships between them; coverage
//! metrics are computed locally from the validated response.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::merge::MergeOutput;
use super::schema::{CrossGroupRelationship, EntityGroup, GroupingResult};
use super::{finish, ProcessResult, ProcessorContext, ProcessorError, StageInput, StageJob, StageProcessor};
use crate::prompts::{call_sites, group_prompt};
use crate::registry::Stage;
use crate::storage::WrittenArtifact;

/// Summary figures of a grouping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMetrics {
    pub group_count: usize,
    pub entity_count: usize,
    /// Distinct entities that belong to at least one group.
    pub grouped_entity_count: usize,
    pub ungrouped_entity_count: usize,
    pub average_group_size: f64,
    pub cross_group_relationship_count: usize,
    /// Share of entities that are grouped, from 0.0 to 1.0.
    pub coverage: f64,
}

impl GroupMetrics {
    pub fn compute(grouping: &GroupingResult, entity_count: usize) -> Self {
        let grouped: HashSet<&str> = grouping
            .groups
            .iter()
            .flat_map(|g| g.members.iter().map(String::as_str))
            .collect();
        let group_count = grouping.groups.len();
        let total_members: usize = grouping.groups.iter().map(|g| g.members.len()).sum();

        let average_group_size = if group_count == 0 {
            0.0
        } else {
            total_members as f64 / group_count as f64
        };
        let coverage = if entity_count == 0 {
            0.0
        } else {
            grouped.len() as f64 / entity_count as f64
        };

        Self {
            group_count,
            entity_count,
            grouped_entity_count: grouped.len(),
            ungrouped_entity_count: entity_count.saturating_sub(grouped.len()),
            average_group_size,
            cross_group_relationship_count: grouping.cross_group_relationships.len(),
            coverage,
        }
    }
}

/// Content of a group version's `output.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupOutput {
    pub groups: Vec<EntityGroup>,
    pub cross_group_relationships: Vec<CrossGroupRelationship>,
    pub metrics: GroupMetrics,
}

/// Processor for the group stage.
pub struct GroupProcessor {
    ctx: Arc<ProcessorContext>,
}

impl GroupProcessor {
    pub fn new(ctx: Arc<ProcessorContext>) -> Self {
        Self { ctx }
    }

    async fn run(&self, job: &StageJob) -> Result<WrittenArtifact, ProcessorError> {
        let StageInput::Merge(merge) = &job.input else {
            return Err(job.wrong_input());
        };
        let merged: MergeOutput = self.ctx.read_output(merge).await?;
        let names = merged.entity_names();

        let content = serde_json::json!({
            "entities": merged
                .entities
                .iter()
                .map(|e| serde_json::json!({
                    "name": e.name,
                    "type": e.entity_type,
                    "description": e.description,
                }))
                .collect::<Vec<_>>(),
            "relationships": merged.relationships,
        })
        .to_string();

        let request = self.ctx.request(group_prompt(&job.domain), content);
        let grouping: GroupingResult = self.ctx.call(request).await?;
        grouping
            .validate_against(&names)
            .map_err(|message| ProcessorError::Validation {
                call_site: call_sites::GROUP.to_string(),
                message,
            })?;

        let metrics = GroupMetrics::compute(&grouping, names.len());
        tracing::info!(
            version = job.version.version_number,
            groups = metrics.group_count,
            coverage = metrics.coverage,
            "Entities grouped"
        );

        let output = GroupOutput {
            groups: grouping.groups,
            cross_group_relationships: grouping.cross_group_relationships,
            metrics,
        };
        let path = self.ctx.output_path(job);
        Ok(self.ctx.artifacts.write_json(&path, &output).await?)
    }
}

#[async_trait]
impl StageProcessor for GroupProcessor {
    fn stage(&self) -> Stage {
        Stage::Group
    }

    async fn process(&self, job: StageJob) -> ProcessResult {
        let result = self.run(&job).await;
        finish(Stage::Group, &job, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::extract::Entity;
    use crate::stages::test_support::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn group(name: &str, members: &[&str]) -> EntityGroup {
        EntityGroup {
            name: name.to_string(),
            description: String::new(),
            members: members.iter().map(|m| m.to_string()).collect(),
        }
    }

    #[test]
    fn test_metrics() {
        let grouping = GroupingResult {
            groups: vec![group("Core", &["A", "B", "C"]), group("Ops", &["C"])],
            cross_group_relationships: vec![CrossGroupRelationship {
                source_group: "Core".to_string(),
                target_group: "Ops".to_string(),
                relationship_type: "feeds".to_string(),
                description: String::new(),
            }],
        };
        let metrics = GroupMetrics::compute(&grouping, 5);
        assert_eq!(metrics.group_count, 2);
        assert_eq!(metrics.grouped_entity_count, 3);
        assert_eq!(metrics.ungrouped_entity_count, 2);
        assert_eq!(metrics.average_group_size, 2.0);
        assert_eq!(metrics.cross_group_relationship_count, 1);
        assert!((metrics.coverage - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_metrics_empty() {
        let grouping = GroupingResult {
            groups: vec![],
            cross_group_relationships: vec![],
        };
        let metrics = GroupMetrics::compute(&grouping, 0);
        assert_eq!(metrics.average_group_size, 0.0);
        assert_eq!(metrics.coverage, 0.0);
    }

    async fn merge_version(ctx: &ProcessorContext, names: &[&str]) -> crate::registry::StageVersion {
        let path = ctx.artifacts.output_path("banking", 1, Stage::Merge, 1);
        let output = MergeOutput {
            entities: names
                .iter()
                .map(|n| Entity {
                    name: n.to_string(),
                    entity_type: "Concept".to_string(),
                    description: String::new(),
                    attributes: BTreeMap::new(),
                    summary: None,
                    sources: vec![],
                })
                .collect(),
            relationships: vec![],
            merged_aliases: BTreeMap::new(),
            source_versions: vec![1],
        };
        ctx.artifacts.write_json(&path, &output).await.unwrap();
        completed_version(Stage::Merge, 1, path)
    }

    #[tokio::test]
    async fn test_group_output() {
        let dir = TempDir::new().unwrap();
        let transform = Arc::new(ScriptedTransform::new(|_| {
            Ok(json!({
                "groups": [{"name": "Core", "description": "Core banking", "members": ["Account", "Ledger"]}],
                "cross_group_relationships": []
            })
            .to_string())
        }));
        let ctx = context(dir.path(), transform);
        let merge = merge_version(&ctx, &["Account", "Ledger", "Teller"]).await;

        let job = StageJob::new(version(Stage::Group, 1), "banking", 1, StageInput::Merge(merge));
        let result = GroupProcessor::new(ctx.clone()).process(job).await;
        assert!(result.success, "{:?}", result.error);

        let output: GroupOutput = ctx.artifacts.read_json(&result.output_path.unwrap()).await.unwrap();
        assert_eq!(output.groups.len(), 1);
        assert_eq!(output.metrics.entity_count, 3);
        assert_eq!(output.metrics.ungrouped_entity_count, 1);
    }

    #[tokio::test]
    async fn test_unknown_member_fails_version() {
        let dir = TempDir::new().unwrap();
        let transform = Arc::new(ScriptedTransform::new(|_| {
            Ok(json!({"groups": [{"name": "Core", "members": ["Vault"]}]}).to_string())
        }));
        let ctx = context(dir.path(), transform);
        let merge = merge_version(&ctx, &["Account"]).await;

        let job = StageJob::new(version(Stage::Group, 1), "banking", 1, StageInput::Merge(merge));
        let result = GroupProcessor::new(ctx).process(job).await;
        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(error.starts_with("Invalid 'group' response"), "{}", error);
        assert!(error.contains("Vault"));
    }
}
