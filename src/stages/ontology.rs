//! Ontology stage: render the merged and grouped model as a Mermaid diagram.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::group::GroupOutput;
use super::merge::MergeOutput;
use super::schema::OntologyDiagram;
use super::{finish, ProcessResult, ProcessorContext, ProcessorError, StageInput, StageJob, StageProcessor};
use crate::prompts::ontology_prompt;
use crate::registry::Stage;
use crate::storage::WrittenArtifact;

/// Content of an ontology version's `output.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OntologyOutput {
    pub mermaid: String,
    /// Version number of the merge version drawn.
    pub merge_version: u32,
    /// Version number of the group version drawn.
    pub group_version: u32,
}

pub struct OntologyProcessor {
    ctx: Arc<ProcessorContext>,
}

impl OntologyProcessor {
    pub fn new(ctx: Arc<ProcessorContext>) -> Self {
        Self { ctx }
    }

    async fn run(&self, job: &StageJob) -> Result<WrittenArtifact, ProcessorError> {
        let StageInput::MergeAndGroup { merge, group } = &job.input else {
            return Err(job.wrong_input());
        };
        let merged: MergeOutput = self.ctx.read_output(merge).await?;
        let grouped: GroupOutput = self.ctx.read_output(group).await?;

        let content = serde_json::json!({
            "entities": merged.entities,
            "relationships": merged.relationships,
            "groups": grouped.groups,
            "cross_group_relationships": grouped.cross_group_relationships,
        })
        .to_string();

        let request = self
            .ctx
            .request(ontology_prompt(&job.domain, job.domain_version), content);
        let diagram: OntologyDiagram = self.ctx.call(request).await?;

        let output = OntologyOutput {
            mermaid: diagram.mermaid.trim().to_string(),
            merge_version: merge.version_number,
            group_version: group.version_number,
        };
        let path = self.ctx.output_path(job);
        Ok(self.ctx.artifacts.write_json(&path, &output).await?)
    }
}

#[async_trait]
impl StageProcessor for OntologyProcessor {
    fn stage(&self) -> Stage {
        Stage::Ontology
    }

    async fn process(&self, job: StageJob) -> ProcessResult {
        let result = self.run(&job).await;
        finish(Stage::Ontology, &job, result)
    }
}
