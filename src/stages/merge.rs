//! Merge stage: reconcile the extract outputs of one batch.
//!
//! Entities from every input are unioned by exact name. Names that look like
//! duplicates (equal after normalization, or one containing the other with
//! the same entity type) are clustered and sent to the transform in batches,
//! one call at a time. The confirmed merges rename aliases throughout the
//! entity and relationship lists. A batch with a single input is copied
//! through without any transform call.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::extract::{Entity, ExtractOutput};
use super::schema::{MergeDecision, MergeGroup, Relationship};
use super::{finish, ProcessResult, ProcessorContext, ProcessorError, StageInput, StageJob, StageProcessor};
use crate::prompts::{call_sites, merge_prompt};
use crate::registry::Stage;
use crate::storage::WrittenArtifact;

/// Content of a merge version's `output.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeOutput {
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
    /// Alias name to the canonical name it was folded into.
    #[serde(default)]
    pub merged_aliases: BTreeMap<String, String>,
    /// Version numbers of the extract versions this merge consumed.
    pub source_versions: Vec<u32>,
}

impl MergeOutput {
    pub fn entity_names(&self) -> Vec<String> {
        self.entities.iter().map(|e| e.name.clone()).collect()
    }
}

/// Processor for the merge stage.
pub struct MergeProcessor {
    ctx: Arc<ProcessorContext>,
}

impl MergeProcessor {
    pub fn new(ctx: Arc<ProcessorContext>) -> Self {
        Self { ctx }
    }

    async fn run(&self, job: &StageJob) -> Result<WrittenArtifact, ProcessorError> {
        let StageInput::Extracts(inputs) = &job.input else {
            return Err(job.wrong_input());
        };
        if inputs.is_empty() {
            return Err(job.wrong_input());
        }

        let mut inputs = inputs.clone();
        inputs.sort_by_key(|v| v.version_number);

        let mut outputs = Vec::with_capacity(inputs.len());
        for input in &inputs {
            outputs.push(self.ctx.read_output::<ExtractOutput>(input).await?);
        }
        let source_versions: Vec<u32> = inputs.iter().map(|v| v.version_number).collect();

        let output = if outputs.len() == 1 {
            tracing::debug!(version = job.version.version_number, "Single extract input, copying through");
            let only = outputs.remove(0);
            MergeOutput {
                entities: only.entities,
                relationships: only.relationships,
                merged_aliases: BTreeMap::new(),
                source_versions,
            }
        } else {
            let mut union = Reconciler::default();
            for output in outputs {
                for entity in output.entities {
                    union.add_entity(entity);
                }
                for rel in output.relationships {
                    union.add_relationship(rel);
                }
            }
            let (entities, relationships) = union.finish();

            let merges = self.confirm_duplicates(job, &entities).await?;
            let (entities, relationships, merged_aliases) =
                apply_merges(entities, relationships, &merges);

            MergeOutput {
                entities,
                relationships,
                merged_aliases,
                source_versions,
            }
        };

        let path = self.ctx.output_path(job);
        Ok(self.ctx.artifacts.write_json(&path, &output).await?)
    }

    /// Sends candidate clusters to the transform, one batch at a time.
    async fn confirm_duplicates(
        &self,
        job: &StageJob,
        entities: &[Entity],
    ) -> Result<Vec<MergeGroup>, ProcessorError> {
        let clusters = candidate_clusters(entities);
        let batches = pack_batches(clusters, self.ctx.config.merge_batch_size);
        let by_name: HashMap<&str, &Entity> = entities.iter().map(|e| (e.name.as_str(), e)).collect();

        let mut merges = Vec::new();
        for (idx, batch) in batches.iter().enumerate() {
            let listed: Vec<serde_json::Value> = batch
                .iter()
                .filter_map(|name| by_name.get(name.as_str()))
                .map(|e| {
                    serde_json::json!({
                        "name": e.name,
                        "type": e.entity_type,
                        "description": e.description,
                    })
                })
                .collect();
            let content = serde_json::json!({ "entities": listed }).to_string();

            let request = self.ctx.request(merge_prompt(&job.domain), content);
            let decision: MergeDecision = self.ctx.call(request).await?;
            decision
                .validate_against(batch)
                .map_err(|message| ProcessorError::Validation {
                    call_site: call_sites::MERGE.to_string(),
                    message,
                })?;

            tracing::debug!(
                batch = idx + 1,
                batches = batches.len(),
                merges = decision.merges.len(),
                "Merge batch reconciled"
            );
            merges.extend(decision.merges);
        }
        Ok(merges)
    }
}

#[async_trait]
impl StageProcessor for MergeProcessor {
    fn stage(&self) -> Stage {
        Stage::Merge
    }

    async fn process(&self, job: StageJob) -> ProcessResult {
        let result = self.run(&job).await;
        finish(Stage::Merge, &job, result)
    }
}

/// Order-preserving union of entities and relationships.
#[derive(Default)]
struct Reconciler {
    entities: Vec<Entity>,
    index: HashMap<String, usize>,
    relationships: Vec<Relationship>,
    relationship_keys: HashSet<(String, String, String)>,
}

impl Reconciler {
    /// Adds an entity, combining it into an existing one with the same name.
    fn add_entity(&mut self, entity: Entity) {
        match self.index.get(&entity.name) {
            Some(&pos) => {
                let existing = &mut self.entities[pos];
                for (key, value) in entity.attributes {
                    existing.attributes.entry(key).or_insert(value);
                }
                for source in entity.sources {
                    if !existing.sources.contains(&source) {
                        existing.sources.push(source);
                    }
                }
                if existing.description.is_empty() {
                    existing.description = entity.description;
                }
                if existing.summary.is_none() {
                    existing.summary = entity.summary;
                }
            }
            None => {
                self.index.insert(entity.name.clone(), self.entities.len());
                self.entities.push(entity);
            }
        }
    }

    fn add_relationship(&mut self, rel: Relationship) {
        if self.relationship_keys.insert(rel.key()) {
            self.relationships.push(rel);
        }
    }

    fn finish(self) -> (Vec<Entity>, Vec<Relationship>) {
        (self.entities, self.relationships)
    }
}

/// Lowercase alphanumeric form of a name.
fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn is_candidate_pair(a: &Entity, norm_a: &str, b: &Entity, norm_b: &str) -> bool {
    if norm_a.is_empty() || norm_b.is_empty() {
        return false;
    }
    if norm_a == norm_b {
        return true;
    }
    let shorter = norm_a.len().min(norm_b.len());
    shorter >= 3
        && a.entity_type.eq_ignore_ascii_case(&b.entity_type)
        && (norm_a.contains(norm_b) || norm_b.contains(norm_a))
}

/// Groups likely duplicates into clusters of two or more names, in entity
/// order.
fn candidate_clusters(entities: &[Entity]) -> Vec<Vec<String>> {
    let normalized: Vec<String> = entities.iter().map(|e| normalize(&e.name)).collect();
    let mut parent: Vec<usize> = (0..entities.len()).collect();

    fn root(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for i in 0..entities.len() {
        for j in (i + 1)..entities.len() {
            if is_candidate_pair(&entities[i], &normalized[i], &entities[j], &normalized[j]) {
                let (ri, rj) = (root(&mut parent, i), root(&mut parent, j));
                if ri != rj {
                    parent[ri.max(rj)] = ri.min(rj);
                }
            }
        }
    }

    let mut clusters: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    for (i, entity) in entities.iter().enumerate() {
        let r = root(&mut parent, i);
        clusters.entry(r).or_default().push(entity.name.clone());
    }
    clusters.into_values().filter(|c| c.len() > 1).collect()
}

/// Packs clusters into batches of at most `size` names. Clusters that fit
/// are never split across batches.
fn pack_batches(clusters: Vec<Vec<String>>, size: usize) -> Vec<Vec<String>> {
    let size = size.max(2);
    let mut batches = Vec::new();
    let mut current: Vec<String> = Vec::new();
    for cluster in clusters.into_iter().flat_map(|c| split_cluster(c, size)) {
        if !current.is_empty() && current.len() + cluster.len() > size {
            batches.push(std::mem::take(&mut current));
        }
        current.extend(cluster);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Splits a cluster larger than `size` into chunks that each start with the
/// cluster's first name, so every chunk can merge toward the same anchor.
fn split_cluster(cluster: Vec<String>, size: usize) -> Vec<Vec<String>> {
    if cluster.len() <= size {
        return vec![cluster];
    }
    let anchor = &cluster[0];
    cluster[1..]
        .chunks(size - 1)
        .map(|rest| {
            let mut chunk = Vec::with_capacity(rest.len() + 1);
            chunk.push(anchor.clone());
            chunk.extend_from_slice(rest);
            chunk
        })
        .collect()
}

/// Follows alias links to the final canonical name.
fn resolve<'a>(aliases: &'a BTreeMap<String, String>, name: &'a str) -> &'a str {
    let mut current = name;
    for _ in 0..=aliases.len() {
        match aliases.get(current) {
            Some(next) => current = next,
            None => break,
        }
    }
    current
}

/// Renames aliases to their canonical names and recombines the lists.
fn apply_merges(
    entities: Vec<Entity>,
    relationships: Vec<Relationship>,
    merges: &[MergeGroup],
) -> (Vec<Entity>, Vec<Relationship>, BTreeMap<String, String>) {
    let mut aliases: BTreeMap<String, String> = BTreeMap::new();
    let mut descriptions: HashMap<String, String> = HashMap::new();

    for merge in merges {
        for alias in &merge.aliases {
            if alias == &merge.canonical || aliases.contains_key(alias) {
                continue;
            }
            // Skip links that would form a cycle.
            if resolve(&aliases, &merge.canonical) == alias.as_str() {
                continue;
            }
            aliases.insert(alias.clone(), merge.canonical.clone());
        }
        if !merge.description.trim().is_empty() {
            descriptions
                .entry(merge.canonical.clone())
                .or_insert_with(|| merge.description.clone());
        }
    }

    let mut reconciler = Reconciler::default();
    for mut entity in entities {
        entity.name = resolve(&aliases, &entity.name).to_string();
        reconciler.add_entity(entity);
    }
    for mut rel in relationships {
        rel.source = resolve(&aliases, &rel.source).to_string();
        rel.target = resolve(&aliases, &rel.target).to_string();
        reconciler.add_relationship(rel);
    }
    let (mut entities, relationships) = reconciler.finish();

    for entity in &mut entities {
        if let Some(description) = descriptions.get(&entity.name) {
            entity.description = description.clone();
        }
    }

    let resolved = aliases
        .keys()
        .map(|alias| (alias.clone(), resolve(&aliases, alias).to_string()))
        .collect();

    (entities, relationships, resolved)
}
