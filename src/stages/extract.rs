//! Extract stage: markdown to entities and relationships.
//!
//! Extraction runs a fixed number of sequential passes over the document;
//! every pass after the first is told which entity names are already known.
//! Entities are deduplicated by exact name and relationships by
//! `(source, target, type)`, keeping the first occurrence. Each entity is then
//! described by its own detail call. An entity whose detail call fails is
//! kept without details and listed in `failed_entities`; it does not fail the
//! version.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::schema::{EntityDetail, ExtractionPass, Relationship};
use super::{finish, ProcessResult, ProcessorContext, ProcessorError, StageInput, StageJob, StageProcessor};
use crate::pipeline::coordinator::{fan_out, TaskError};
use crate::prompts::{entity_detail_prompt, extract_prompt};
use crate::registry::Stage;
use crate::storage::WrittenArtifact;

/// A domain entity as stored in extract and merge outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Documents the entity was found in.
    #[serde(default)]
    pub sources: Vec<String>,
}

/// An entity whose detail call failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedEntity {
    pub name: String,
    pub error: String,
}

/// Content of an extract version's `output.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractOutput {
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
    #[serde(default)]
    pub failed_entities: Vec<FailedEntity>,
    pub iterations: u32,
}

/// Accumulates extraction passes, first occurrence wins.
#[derive(Debug, Default)]
pub(crate) struct ExtractionAccumulator {
    entities: Vec<Entity>,
    relationships: Vec<Relationship>,
    entity_names: HashSet<String>,
    relationship_keys: HashSet<(String, String, String)>,
}

impl ExtractionAccumulator {
    pub(crate) fn absorb(&mut self, pass: ExtractionPass, source: &str) {
        for found in pass.entities {
            let name = found.name.trim().to_string();
            if !self.entity_names.insert(name.clone()) {
                continue;
            }
            self.entities.push(Entity {
                name,
                entity_type: found.entity_type,
                description: found.description,
                attributes: BTreeMap::new(),
                summary: None,
                sources: vec![source.to_string()],
            });
        }

        for rel in pass.relationships {
            if self.relationship_keys.insert(rel.key()) {
                self.relationships.push(rel);
            }
        }
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.entities.iter().map(|e| e.name.clone()).collect()
    }
}

/// Processor for the extract stage.
pub struct ExtractProcessor {
    ctx: Arc<ProcessorContext>,
}

impl ExtractProcessor {
    pub fn new(ctx: Arc<ProcessorContext>) -> Self {
        Self { ctx }
    }

    async fn run(&self, job: &StageJob) -> Result<WrittenArtifact, ProcessorError> {
        let StageInput::Parse(parse) = &job.input else {
            return Err(job.wrong_input());
        };
        let markdown_path = parse.output_path.as_ref().ok_or(ProcessorError::MissingOutput {
            stage: parse.stage,
            version_number: parse.version_number,
        })?;
        let document = self.ctx.artifacts.read_to_string(markdown_path).await?;
        let source = parse
            .source
            .as_ref()
            .map(|s| s.name.clone())
            .unwrap_or_else(|| format!("parse v{}", parse.version_number));

        let iterations = self.ctx.config.extract_iterations;
        let mut acc = ExtractionAccumulator::default();
        for iteration in 1..=iterations {
            let known = if iteration == 1 { Vec::new() } else { acc.names() };
            let prompt = extract_prompt(&job.domain, iteration, &known);
            let pass: ExtractionPass = self.ctx.call(self.ctx.request(prompt, document.as_str())).await?;

            let before = acc.entities.len();
            acc.absorb(pass, &source);
            tracing::debug!(
                version = job.version.version_number,
                iteration,
                new_entities = acc.entities.len() - before,
                "Extraction pass finished"
            );
        }

        let (entities, failed_entities) = self.describe_entities(job, &document, acc.entities).await;

        let output = ExtractOutput {
            entities,
            relationships: acc.relationships,
            failed_entities,
            iterations,
        };
        let path = self.ctx.output_path(job);
        Ok(self.ctx.artifacts.write_json(&path, &output).await?)
    }

    /// Fans out one detail call per entity, preserving entity order.
    async fn describe_entities(
        &self,
        job: &StageJob,
        document: &str,
        entities: Vec<Entity>,
    ) -> (Vec<Entity>, Vec<FailedEntity>) {
        let indexed: Vec<(usize, Entity)> = entities.into_iter().enumerate().collect();

        let results = fan_out(
            indexed,
            self.ctx.config.entity_concurrency,
            |(idx, _)| *idx,
            move |(_, mut entity)| async move {
                let prompt = entity_detail_prompt(&job.domain, &entity.name, &entity.entity_type);
                let detail = self
                    .ctx
                    .call::<EntityDetail>(self.ctx.request(prompt, document))
                    .await;
                match detail {
                    Ok(detail) => {
                        entity.attributes = detail.attributes;
                        entity.summary = Some(detail.summary);
                        Ok(entity)
                    }
                    Err(e) => Err((entity, e)),
                }
            },
        )
        .await;

        let mut described = Vec::with_capacity(results.len());
        let mut failed = Vec::new();
        for task in results {
            match task.result {
                Ok(entity) => described.push(entity),
                Err(e) => {
                    let failure = match e {
                        TaskError::Failed((entity, err)) => {
                            let failure = FailedEntity {
                                name: entity.name.clone(),
                                error: err.to_string(),
                            };
                            described.push(entity);
                            failure
                        }
                        TaskError::Panicked(msg) => FailedEntity {
                            name: format!("#{}", task.key),
                            error: format!("Task panicked: {}", msg),
                        },
                    };
                    tracing::warn!(entity = %failure.name, error = %failure.error, "Entity detail failed");
                    failed.push(failure);
                }
            }
        }
        (described, failed)
    }
}

#[async_trait]
impl StageProcessor for ExtractProcessor {
    fn stage(&self) -> Stage {
        Stage::Extract
    }

    async fn process(&self, job: StageJob) -> ProcessResult {
        let result = self.run(&job).await;
        finish(Stage::Extract, &job, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransformError;
    use crate::registry::SourceFile;
    use crate::stages::schema::ExtractedEntity;
    use crate::stages::test_support::*;
    use serde_json::json;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn entity(name: &str) -> ExtractedEntity {
        ExtractedEntity {
            name: name.to_string(),
            entity_type: "Concept".to_string(),
            description: format!("{} description", name),
        }
    }

    fn rel(source: &str, target: &str, kind: &str) -> Relationship {
        Relationship {
            source: source.to_string(),
            target: target.to_string(),
            relationship_type: kind.to_string(),
            description: String::new(),
        }
    }

    #[test]
    fn test_accumulator_dedups_first_wins() {
        let mut acc = ExtractionAccumulator::default();
        acc.absorb(
            ExtractionPass {
                entities: vec![entity("A"), entity("B"), entity("C")],
                relationships: vec![rel("A", "B", "owns")],
            },
            "doc",
        );
        let mut later_c = entity("C");
        later_c.description = "changed".to_string();
        acc.absorb(
            ExtractionPass {
                entities: vec![later_c, entity("D")],
                relationships: vec![rel("A", "B", "owns"), rel("A", "B", "audits")],
            },
            "doc",
        );

        assert_eq!(acc.names(), vec!["A", "B", "C", "D"]);
        assert_eq!(acc.entities[2].description, "C description");
        assert_eq!(acc.relationships.len(), 2);
    }

    /// Answers the extraction pass by its number and details by entity name.
    fn extraction_script(fail_detail_for: &'static str) -> Arc<ScriptedTransform> {
        Arc::new(ScriptedTransform::new(move |req| match req.call_site.as_str() {
            "extract" if req.instruction_prompt.starts_with("Pass 2") => Ok(json!({
                "entities": [{"name": "C", "type": "Concept"}, {"name": "D", "type": "Role"}],
                "relationships": [{"source": "C", "target": "D", "type": "uses"}]
            })
            .to_string()),
            "extract" if req.instruction_prompt.starts_with("Pass 3") => Ok(json!({
                "entities": [{"name": "D", "type": "Role"}, {"name": "E", "type": "System"}],
                "relationships": [{"source": "C", "target": "D", "type": "uses"}]
            })
            .to_string()),
            "extract" => Ok(json!({
                "entities": [
                    {"name": "A", "type": "Concept"},
                    {"name": "B", "type": "Concept"},
                    {"name": "C", "type": "Concept"}
                ],
                "relationships": []
            })
            .to_string()),
            "entity_detail" if req.instruction_prompt.contains(&format!("'{}'", fail_detail_for)) => {
                Err(TransformError::Request("detail backend down".to_string()))
            }
            "entity_detail" => Ok(json!({"attributes": {"kind": "core"}, "summary": "An entity."}).to_string()),
            other => panic!("unexpected call site {}", other),
        }))
    }

    async fn parse_version(dir: &std::path::Path) -> crate::registry::StageVersion {
        let path = dir.join("parsed.md");
        tokio::fs::write(&path, "# Handbook\n\nA B C D E").await.unwrap();
        let mut parse = completed_version(Stage::Parse, 1, path);
        parse.source = Some(SourceFile::new(Uuid::new_v4(), "/in/handbook.pdf"));
        parse
    }

    #[tokio::test]
    async fn test_iterations_accumulate_entities() {
        let dir = TempDir::new().unwrap();
        let transform = extraction_script("nobody");
        let ctx = context(&dir.path().join("artifacts"), transform.clone());
        let parse = parse_version(dir.path()).await;

        let job = StageJob::new(version(Stage::Extract, 1), "banking", 1, StageInput::Parse(parse));
        let result = ExtractProcessor::new(ctx.clone()).process(job).await;
        assert!(result.success, "{:?}", result.error);

        let output: ExtractOutput = ctx
            .artifacts
            .read_json(&result.output_path.unwrap())
            .await
            .unwrap();
        let names: Vec<&str> = output.entities.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B", "C", "D", "E"]);
        assert_eq!(output.relationships.len(), 1);
        assert_eq!(output.iterations, 3);
        assert!(output.failed_entities.is_empty());
        assert_eq!(output.entities[0].sources, vec!["handbook.pdf"]);
        assert_eq!(output.entities[4].summary.as_deref(), Some("An entity."));

        // Passes run in order, later ones see the known names.
        let passes = transform.calls_for("extract");
        assert_eq!(passes.len(), 3);
        assert!(passes[1].instruction_prompt.contains("A, B, C"));
        assert!(passes[2].instruction_prompt.contains("A, B, C, D"));
        assert_eq!(transform.calls_for("entity_detail").len(), 5);
    }

    #[tokio::test]
    async fn test_failed_detail_is_recorded_not_fatal() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir.path().join("artifacts"), extraction_script("B"));
        let parse = parse_version(dir.path()).await;

        let job = StageJob::new(version(Stage::Extract, 2), "banking", 1, StageInput::Parse(parse));
        let result = ExtractProcessor::new(ctx.clone()).process(job).await;
        assert!(result.success);

        let output: ExtractOutput = ctx
            .artifacts
            .read_json(&result.output_path.unwrap())
            .await
            .unwrap();
        assert_eq!(output.entities.len(), 5);
        assert!(output.entities[1].summary.is_none());
        assert_eq!(output.failed_entities.len(), 1);
        assert_eq!(output.failed_entities[0].name, "B");
        assert!(output.failed_entities[0].error.contains("detail backend down"));
    }

    #[tokio::test]
    async fn test_malformed_pass_fails_version() {
        let dir = TempDir::new().unwrap();
        let transform = Arc::new(ScriptedTransform::new(|_| Ok("I could not find entities.".to_string())));
        let ctx = context(&dir.path().join("artifacts"), transform);
        let parse = parse_version(dir.path()).await;

        let job = StageJob::new(version(Stage::Extract, 1), "banking", 1, StageInput::Parse(parse));
        let result = ExtractProcessor::new(ctx).process(job).await;
        assert!(!result.success);
        assert!(result.error.unwrap().starts_with("Invalid 'extract' response"));
    }
}
