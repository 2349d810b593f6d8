//! End-to-end pipeline scenarios with a scripted content transform.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;

use onto_forge::error::{StoreError, TransformError};
use onto_forge::llm::{ContentTransform, TransformRequest};
use onto_forge::pipeline::{get_pipeline_status, Orchestrator, PipelineConfig, PipelineError};
use onto_forge::registry::{
    InMemoryVersionStore, PipelineStage, SourceFile, Stage, StageStatus, VersionStore,
};
use onto_forge::stages::{
    ExtractOutput, MergeOutput, OntologyOutput, ProcessResult, ProcessorContext, ProcessorSet,
    StageJob, StageProcessor,
};

type Responder = dyn Fn(&TransformRequest) -> Result<String, TransformError> + Send + Sync;

/// Answers every request with a closure and records the call sites.
struct MockTransform {
    respond: Box<Responder>,
    calls: Mutex<Vec<String>>,
}

impl MockTransform {
    fn new(
        respond: impl Fn(&TransformRequest) -> Result<String, TransformError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            respond: Box::new(respond),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn count(&self, call_site: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == call_site)
            .count()
    }
}

#[async_trait]
impl ContentTransform for MockTransform {
    async fn transform(&self, request: TransformRequest) -> Result<String, TransformError> {
        self.calls.lock().unwrap().push(request.call_site.clone());
        (self.respond)(&request)
    }
}

/// Scripted answers for a healthy run. Documents whose name contains
/// `blurry` fail the quality check with the given confidence.
fn script(confidence: f64, blurry_confidence: f64) -> Arc<MockTransform> {
    MockTransform::new(move |req| {
        let body = match req.call_site.as_str() {
            "quality" if req.instruction_prompt.contains("blurry") => {
                json!({"confidence": blurry_confidence, "problem": "text is illegible"})
            }
            "quality" => json!({"confidence": confidence, "problem": "pages are skewed"}),
            "page" => json!({"markdown": format!("## Page\n\n{}", req.content)}),
            "extract" if req.instruction_prompt.starts_with("Pass 2") => json!({
                "entities": [{"name": "C", "type": "Concept"}, {"name": "D", "type": "Role"}],
                "relationships": [{"source": "C", "target": "D", "type": "uses"}]
            }),
            "extract" if req.instruction_prompt.starts_with("Pass 3") => json!({
                "entities": [{"name": "D", "type": "Role"}, {"name": "E", "type": "System"}],
                "relationships": []
            }),
            "extract" => json!({
                "entities": [
                    {"name": "A", "type": "Concept"},
                    {"name": "B", "type": "Concept"},
                    {"name": "C", "type": "Concept"}
                ],
                "relationships": [{"source": "A", "target": "B", "type": "owns"}]
            }),
            "entity_detail" => json!({"attributes": {"kind": "core"}, "summary": "An entity."}),
            "merge" => json!({"merges": []}),
            "group" => json!({
                "groups": [
                    {"name": "Core", "description": "Core concepts", "members": ["A", "B", "C"]},
                    {"name": "Operations", "description": "Who runs it", "members": ["D", "E"]}
                ],
                "cross_group_relationships": [
                    {"source_group": "Operations", "target_group": "Core", "type": "manages"}
                ]
            }),
            "ontology" => json!({"mermaid": "classDiagram\n  class A\n  class B\n  A --> B : owns"}),
            other => panic!("unexpected call site {}", other),
        };
        Ok(body.to_string())
    })
}

fn write_document(dir: &Path, name: &str, pages: &[&str]) -> SourceFile {
    let path = dir.join(name);
    std::fs::write(&path, pages.join("\u{000C}")).unwrap();
    SourceFile::from_path(&path).unwrap()
}

struct Harness {
    _dir: TempDir,
    docs: std::path::PathBuf,
    store: Arc<dyn VersionStore>,
    orchestrator: Orchestrator,
}

fn harness(transform: Arc<MockTransform>) -> Harness {
    harness_with(transform, |set| set)
}

fn harness_with(transform: Arc<MockTransform>, customize: fn(ProcessorSet) -> ProcessorSet) -> Harness {
    let dir = TempDir::new().unwrap();
    let docs = dir.path().join("docs");
    std::fs::create_dir_all(&docs).unwrap();

    let config = PipelineConfig::default().with_artifact_root(dir.path().join("artifacts"));
    let store: Arc<dyn VersionStore> = Arc::new(InMemoryVersionStore::new());
    let ctx = Arc::new(ProcessorContext::new(config.clone(), transform));
    let processors = customize(ProcessorSet::standard(ctx));
    let orchestrator = Orchestrator::new(&config, store.clone(), processors).unwrap();

    Harness {
        _dir: dir,
        docs,
        store,
        orchestrator,
    }
}

#[tokio::test]
async fn test_single_document_runs_to_completion() {
    let transform = script(80.0, 80.0);
    let h = harness(transform.clone());
    let source = write_document(&h.docs, "handbook.txt", &["one", "two", "three", "four"]);

    let report = h.orchestrator.start("banking", 1, vec![source]).await.unwrap();
    assert_eq!(report.status, StageStatus::Completed);
    assert_eq!(report.stage, PipelineStage::Ontology);
    assert!(report.error.is_none());

    assert_eq!(transform.count("quality"), 1);
    assert_eq!(transform.count("page"), 4);
    assert_eq!(transform.count("extract"), 3);
    assert_eq!(transform.count("entity_detail"), 5);
    // One extract input: merge copies it through without a transform call.
    assert_eq!(transform.count("merge"), 0);

    let extracts = h.store.list_versions(report.pipeline_id, Some(Stage::Extract)).await.unwrap();
    assert_eq!(extracts.len(), 1);
    let raw = std::fs::read_to_string(extracts[0].output_path.as_ref().unwrap()).unwrap();
    let extracted: ExtractOutput = serde_json::from_str(&raw).unwrap();
    let names: Vec<&str> = extracted.entities.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["A", "B", "C", "D", "E"]);

    let merges = h.store.list_versions(report.pipeline_id, Some(Stage::Merge)).await.unwrap();
    let raw = std::fs::read_to_string(merges[0].output_path.as_ref().unwrap()).unwrap();
    let merged: MergeOutput = serde_json::from_str(&raw).unwrap();
    assert_eq!(merged.entities, extracted.entities);

    for stage in [Stage::Group, Stage::Ontology] {
        let versions = h.store.list_versions(report.pipeline_id, Some(stage)).await.unwrap();
        assert_eq!(versions.len(), 1, "{} versions", stage);
        assert_eq!(versions[0].version_number, 1);
        assert!(versions[0].is_completed());
    }

    let ontology = h.store.list_versions(report.pipeline_id, Some(Stage::Ontology)).await.unwrap();
    let raw = std::fs::read_to_string(ontology[0].output_path.as_ref().unwrap()).unwrap();
    let diagram: OntologyOutput = serde_json::from_str(&raw).unwrap();
    assert!(diagram.mermaid.starts_with("classDiagram"));
    assert_eq!(ontology[0].inputs.len(), 2);

    let parses = h.store.list_versions(report.pipeline_id, Some(Stage::Parse)).await.unwrap();
    let markdown = std::fs::read_to_string(parses[0].output_path.as_ref().unwrap()).unwrap();
    let positions: Vec<usize> = ["one", "two", "three", "four"]
        .iter()
        .map(|p| markdown.find(p).unwrap())
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn test_low_quality_document_fails_pipeline() {
    let transform = script(60.0, 60.0);
    let h = harness(transform.clone());
    let source = write_document(&h.docs, "handbook.txt", &["one", "two"]);

    let report = h.orchestrator.start("banking", 1, vec![source]).await.unwrap();
    assert_eq!(report.status, StageStatus::Failed);
    assert_eq!(report.stage, PipelineStage::Parse);
    assert!(report.error.as_deref().unwrap().contains("pages are skewed"));

    assert_eq!(transform.count("page"), 0);
    assert_eq!(transform.count("extract"), 0);
    let extracts = h.store.list_versions(report.pipeline_id, Some(Stage::Extract)).await.unwrap();
    assert!(extracts.is_empty());

    let status = get_pipeline_status(h.store.as_ref(), report.pipeline_id).await.unwrap();
    assert_eq!(status.status, StageStatus::Failed);
    assert_eq!(status.stage, PipelineStage::Parse);
}

#[tokio::test]
async fn test_partial_parse_failure_still_completes() {
    let transform = script(90.0, 40.0);
    let h = harness(transform.clone());
    let sources = vec![
        write_document(&h.docs, "accounts.txt", &["accounts"]),
        write_document(&h.docs, "blurry-scan.txt", &["???"]),
        write_document(&h.docs, "ledger.txt", &["ledger"]),
    ];

    let report = h.orchestrator.start("banking", 1, sources).await.unwrap();
    assert_eq!(report.status, StageStatus::Completed);

    let parses = h.store.list_versions(report.pipeline_id, Some(Stage::Parse)).await.unwrap();
    assert_eq!(parses.len(), 3);
    assert_eq!(parses.iter().filter(|v| v.is_failed()).count(), 1);
    let failed = parses.iter().find(|v| v.is_failed()).unwrap();
    assert_eq!(
        failed.error.as_deref(),
        Some("Quality check failed: text is illegible")
    );

    let extracts = h.store.list_versions(report.pipeline_id, Some(Stage::Extract)).await.unwrap();
    assert_eq!(extracts.len(), 2);

    let merges = h.store.list_versions(report.pipeline_id, Some(Stage::Merge)).await.unwrap();
    assert_eq!(merges.len(), 1);
    assert_eq!(merges[0].inputs.len(), 2);
}

#[tokio::test]
async fn test_all_parse_inputs_failing_fails_pipeline() {
    let transform = script(30.0, 30.0);
    let h = harness(transform);
    let sources = vec![
        write_document(&h.docs, "a.txt", &["a"]),
        write_document(&h.docs, "b.txt", &["b"]),
    ];

    let report = h.orchestrator.start("banking", 1, sources).await.unwrap();
    assert_eq!(report.status, StageStatus::Failed);
    assert_eq!(
        report.error.as_deref(),
        Some("All parse tasks failed: Quality check failed: pages are skewed")
    );
    assert_eq!(report.stages.len(), 1);
    assert_eq!(report.stages[0].failed.len(), 2);
}

#[tokio::test]
async fn test_merge_requires_completed_extract() {
    let h = harness(script(80.0, 80.0));
    let pipeline = h.store.create_pipeline("banking", 1).await.unwrap();

    let err = h
        .orchestrator
        .run_stage(pipeline.id, Stage::Merge, Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::DependencyNotSatisfied { .. }));

    let status = get_pipeline_status(h.store.as_ref(), pipeline.id).await.unwrap();
    assert_eq!(status.status, StageStatus::Failed);
    assert!(status.error.unwrap().starts_with("Dependency not satisfied: merge requires extract"));
    assert!(h.store.list_versions(pipeline.id, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rerunning_completed_pipeline_creates_nothing() {
    let transform = script(80.0, 80.0);
    let h = harness(transform.clone());
    let source = write_document(&h.docs, "handbook.txt", &["one"]);

    let report = h.orchestrator.start("banking", 1, vec![source.clone()]).await.unwrap();
    assert_eq!(report.status, StageStatus::Completed);
    let before = h.store.list_versions(report.pipeline_id, None).await.unwrap();
    let calls = transform.calls.lock().unwrap().len();

    let again = h.orchestrator.run(report.pipeline_id, vec![source]).await.unwrap();
    assert_eq!(again.status, StageStatus::Completed);
    let after = h.store.list_versions(report.pipeline_id, None).await.unwrap();
    assert_eq!(before, after);
    assert_eq!(transform.calls.lock().unwrap().len(), calls);
}

#[tokio::test]
async fn test_same_domain_version_cannot_overwrite_artifacts() {
    let h = harness(script(80.0, 80.0));
    let alpha = write_document(&h.docs, "alpha.txt", &["ALPHA"]);
    let beta = write_document(&h.docs, "beta.txt", &["BETA"]);

    let first = h.orchestrator.start("banking", 1, vec![alpha]).await.unwrap();
    assert_eq!(first.status, StageStatus::Completed);
    let parses = h.store.list_versions(first.pipeline_id, Some(Stage::Parse)).await.unwrap();
    let parse_output = parses[0].output_path.clone().unwrap();
    let before = std::fs::read_to_string(&parse_output).unwrap();
    assert!(before.contains("ALPHA"));

    let err = h
        .orchestrator
        .start("banking", 1, vec![beta.clone()])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Store(StoreError::DuplicatePipeline { existing, .. }) if existing == first.pipeline_id
    ));
    assert_eq!(std::fs::read_to_string(&parse_output).unwrap(), before);
    assert_eq!(h.store.list_pipelines().await.unwrap().len(), 1);

    let second = h.orchestrator.start("banking", 2, vec![beta]).await.unwrap();
    assert_eq!(second.status, StageStatus::Completed);
    let parses = h.store.list_versions(second.pipeline_id, Some(Stage::Parse)).await.unwrap();
    let second_output = parses[0].output_path.clone().unwrap();
    assert_ne!(second_output, parse_output);
    assert!(std::fs::read_to_string(&second_output).unwrap().contains("BETA"));
    assert_eq!(std::fs::read_to_string(&parse_output).unwrap(), before);
}

/// Extract processor that panics on its first version.
struct PanickingExtract {
    inner: Arc<dyn StageProcessor>,
}

#[async_trait]
impl StageProcessor for PanickingExtract {
    fn stage(&self) -> Stage {
        Stage::Extract
    }

    async fn process(&self, job: StageJob) -> ProcessResult {
        if job.version.version_number == 1 {
            panic!("extractor crashed");
        }
        self.inner.process(job).await
    }
}

#[tokio::test]
async fn test_panicking_task_is_isolated() {
    let h = harness_with(script(80.0, 80.0), |set| {
        let inner = set.get(Stage::Extract).unwrap();
        set.with_processor(Arc::new(PanickingExtract { inner }))
    });
    let sources = vec![
        write_document(&h.docs, "a.txt", &["a"]),
        write_document(&h.docs, "b.txt", &["b"]),
    ];

    let report = h.orchestrator.start("banking", 1, sources).await.unwrap();
    assert_eq!(report.status, StageStatus::Completed);

    let extracts = h.store.list_versions(report.pipeline_id, Some(Stage::Extract)).await.unwrap();
    assert_eq!(extracts.len(), 2);
    assert!(extracts[0].is_failed());
    assert!(extracts[0].error.as_deref().unwrap().contains("extractor crashed"));
    assert!(extracts[1].is_completed());
}
