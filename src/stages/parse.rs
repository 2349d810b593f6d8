//! Parse stage: source document to markdown.
//!
//! A document first passes a readability gate over its leading pages. Pages
//! are then transcribed concurrently, written as `page_N.md` (plus the
//! page image as `page_N.png` or `page_N.jpg`), and joined in page order
//! into `output.md`.

use std::sync::Arc;

use async_trait::async_trait;

use super::document::Page;
use super::schema::{PageTranscription, QualityAssessment};
use super::{finish, ProcessResult, ProcessorContext, ProcessorError, StageInput, StageJob, StageProcessor};
use crate::llm::ImageInput;
use crate::pipeline::coordinator::fan_out;
use crate::prompts::{page_prompt, quality_prompt};
use crate::registry::{SourceFile, Stage};
use crate::storage::WrittenArtifact;

/// Processor for the parse stage.
pub struct ParseProcessor {
    ctx: Arc<ProcessorContext>,
}

impl ParseProcessor {
    pub fn new(ctx: Arc<ProcessorContext>) -> Self {
        Self { ctx }
    }

    async fn run(&self, job: &StageJob) -> Result<WrittenArtifact, ProcessorError> {
        let StageInput::File(source) = &job.input else {
            return Err(job.wrong_input());
        };

        let pages = self.ctx.documents.load(source).await?;
        self.check_quality(source, &pages).await?;

        let dir = self.ctx.artifacts.version_dir(
            &job.domain,
            job.domain_version,
            Stage::Parse,
            job.version.version_number,
        );
        let total = pages.len();

        let results = fan_out(
            pages,
            self.ctx.config.page_concurrency,
            |page| page.number,
            move |page| {
                let dir = dir.clone();
                async move {
                    let prompt = page_prompt(&source.name, page.number, total);
                    let image = page.image.clone().map(ImageInput::from_bytes);
                    let mut request = self.ctx.request(prompt, page.text.clone());
                    if let Some(image) = &image {
                        request = request.with_images(vec![image.clone()]);
                    }
                    let transcription: PageTranscription = self.ctx.call(request).await?;

                    let artifacts = &self.ctx.artifacts;
                    artifacts
                        .write(
                            &dir.join(format!("page_{}.md", page.number)),
                            transcription.markdown.as_bytes(),
                        )
                        .await?;
                    if let Some(image) = &image {
                        let name = format!("page_{}.{}", page.number, image.extension());
                        artifacts.write(&dir.join(name), &image.data).await?;
                    }

                    tracing::debug!(document = %source.name, page = page.number, "Page transcribed");
                    Ok::<String, ProcessorError>(transcription.markdown)
                }
            },
        )
        .await;

        let mut sections = Vec::with_capacity(results.len());
        for task in results {
            match task.result {
                Ok(markdown) => sections.push(markdown.trim().to_string()),
                Err(e) => {
                    return Err(ProcessorError::Page {
                        page: task.key,
                        message: e.to_string(),
                    })
                }
            }
        }

        let markdown = sections.join("\n\n");
        let path = self.ctx.output_path(job);
        Ok(self.ctx.artifacts.write(&path, markdown.as_bytes()).await?)
    }

    /// Rejects the document when the sampled pages are not readable enough.
    async fn check_quality(&self, source: &SourceFile, pages: &[Page]) -> Result<(), ProcessorError> {
        let sample = &pages[..pages.len().min(self.ctx.config.quality_sample_pages)];

        let content = sample
            .iter()
            .map(|p| format!("--- Page {} ---\n{}", p.number, p.text))
            .collect::<Vec<_>>()
            .join("\n\n");
        let images = sample
            .iter()
            .filter_map(|p| p.image.clone().map(ImageInput::from_bytes))
            .collect();

        let prompt = quality_prompt(&source.name, sample.len(), pages.len());
        let request = self.ctx.request(prompt, content).with_images(images);
        let verdict: QualityAssessment = self.ctx.call(request).await?;

        if verdict.confidence < self.ctx.config.quality_threshold {
            self.ctx.metrics.record_quality_rejection();
            tracing::warn!(
                document = %source.name,
                confidence = verdict.confidence,
                threshold = self.ctx.config.quality_threshold,
                problem = %verdict.problem,
                "Document rejected by quality check"
            );
            let problem = if verdict.problem.trim().is_empty() {
                format!("confidence {} is below {}", verdict.confidence, self.ctx.config.quality_threshold)
            } else {
                verdict.problem
            };
            return Err(ProcessorError::QualityRejected {
                confidence: verdict.confidence,
                problem,
            });
        }

        tracing::debug!(document = %source.name, confidence = verdict.confidence, "Quality check passed");
        Ok(())
    }
}

#[async_trait]
impl StageProcessor for ParseProcessor {
    fn stage(&self) -> Stage {
        Stage::Parse
    }

    async fn process(&self, job: StageJob) -> ProcessResult {
        let result = self.run(&job).await;
        finish(Stage::Parse, &job, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransformError;
    use crate::stages::test_support::*;
    use crate::registry::VersionStatus;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn write_document(dir: &std::path::Path, pages: &[&str]) -> SourceFile {
        let path = dir.join("handbook.txt");
        std::fs::write(&path, pages.join("\u{000C}")).unwrap();
        SourceFile::new(Uuid::new_v4(), path)
    }

    fn job(source: SourceFile, number: u32) -> StageJob {
        StageJob::new(version(Stage::Parse, number), "banking", 1, StageInput::File(source))
    }

    fn page_number_of(request: &crate::llm::TransformRequest) -> u64 {
        request
            .instruction_prompt
            .split_whitespace()
            .nth(2)
            .and_then(|n| n.parse().ok())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_parse_writes_pages_in_order() {
        let dir = TempDir::new().unwrap();
        let source = write_document(dir.path(), &["alpha", "beta", "gamma", "delta"]);

        let transform = Arc::new(ScriptedTransform::new(|req| match req.call_site.as_str() {
            "quality" => Ok(json!({"confidence": 80, "problem": ""}).to_string()),
            _ => {
                assert!(page_number_of(req) >= 1);
                Ok(json!({"markdown": format!("# {}", req.content)}).to_string())
            }
        }));
        let ctx = context(&dir.path().join("artifacts"), transform.clone());
        let processor = ParseProcessor::new(ctx.clone());

        let result = processor.process(job(source, 1)).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.status, VersionStatus::Completed);

        let output = result.output_path.unwrap();
        assert!(output.ends_with("banking/1/parse/1/output.md"));
        let markdown = std::fs::read_to_string(&output).unwrap();
        assert_eq!(markdown, "# alpha\n\n# beta\n\n# gamma\n\n# delta");

        let page_two = output.parent().unwrap().join("page_2.md");
        assert_eq!(std::fs::read_to_string(page_two).unwrap(), "# beta");
        assert_eq!(transform.calls_for("page").len(), 4);
    }

    #[tokio::test]
    async fn test_output_ignores_page_completion_order() {
        let texts: Vec<String> = (1..=6).map(|n| format!("section {}", n)).collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();

        let respond = |req: &crate::llm::TransformRequest| -> Result<String, TransformError> {
            match req.call_site.as_str() {
                "quality" => Ok(json!({"confidence": 95, "problem": ""}).to_string()),
                _ => Ok(json!({"markdown": format!("## {}", req.content)}).to_string()),
            }
        };

        let dir = TempDir::new().unwrap();
        let source = write_document(dir.path(), &refs);
        let immediate = Arc::new(ScriptedTransform::new(respond));
        let ctx = context(&dir.path().join("immediate"), immediate);
        let baseline = ParseProcessor::new(ctx).process(job(source.clone(), 1)).await;
        let baseline = std::fs::read(baseline.output_path.unwrap()).unwrap();

        // Earlier pages answer later, so completions arrive in reverse.
        let delayed = Arc::new(ScriptedTransform::new(respond).with_delay(|req| {
            let page = page_number_of(req);
            Duration::from_millis(if page == 0 { 0 } else { (7 - page) * 25 })
        }));
        let ctx = context(&dir.path().join("delayed"), delayed.clone());
        let result = ParseProcessor::new(ctx).process(job(source, 1)).await;
        assert!(result.success, "{:?}", result.error);

        let finished: Vec<u64> = delayed
            .finished_for("page")
            .iter()
            .map(page_number_of)
            .collect();
        assert_eq!(finished, vec![6, 5, 4, 3, 2, 1]);
        assert_eq!(std::fs::read(result.output_path.unwrap()).unwrap(), baseline);
    }

    #[tokio::test]
    async fn test_jpeg_page_keeps_its_format() {
        let dir = TempDir::new().unwrap();
        let pages = dir.path().join("scan");
        std::fs::create_dir_all(&pages).unwrap();
        let jpeg = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00];
        std::fs::write(pages.join("page_1.jpg"), &jpeg).unwrap();

        let transform = Arc::new(ScriptedTransform::new(|req| match req.call_site.as_str() {
            "quality" => Ok(json!({"confidence": 90, "problem": ""}).to_string()),
            _ => Ok(json!({"markdown": "scanned"}).to_string()),
        }));
        let ctx = context(&dir.path().join("artifacts"), transform.clone());
        let result = ParseProcessor::new(ctx)
            .process(job(SourceFile::new(Uuid::new_v4(), &pages), 1))
            .await;
        assert!(result.success, "{:?}", result.error);

        let page_calls = transform.calls_for("page");
        assert_eq!(page_calls[0].images[0].media_type, "image/jpeg");
        let written = result.output_path.unwrap().parent().unwrap().join("page_1.jpg");
        assert_eq!(std::fs::read(written).unwrap(), jpeg);
    }

    #[tokio::test]
    async fn test_quality_rejection_stops_before_pages() {
        let dir = TempDir::new().unwrap();
        let source = write_document(dir.path(), &["smudged", "smudged"]);

        let transform = Arc::new(ScriptedTransform::new(|req| match req.call_site.as_str() {
            "quality" => Ok(json!({"confidence": 60, "problem": "scan is illegible"}).to_string()),
            _ => Ok(json!({"markdown": "x"}).to_string()),
        }));
        let ctx = context(&dir.path().join("artifacts"), transform.clone());

        let result = ParseProcessor::new(ctx).process(job(source, 1)).await;
        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("Quality check failed: scan is illegible")
        );
        assert!(transform.calls_for("page").is_empty());
    }

    #[tokio::test]
    async fn test_quality_samples_leading_pages() {
        let dir = TempDir::new().unwrap();
        let pages: Vec<String> = (1..=8).map(|n| format!("page text {}", n)).collect();
        let refs: Vec<&str> = pages.iter().map(String::as_str).collect();
        let source = write_document(dir.path(), &refs);

        let transform = Arc::new(ScriptedTransform::new(|req| match req.call_site.as_str() {
            "quality" => Ok(json!({"confidence": 99, "problem": ""}).to_string()),
            _ => Ok(json!({"markdown": req.content.clone()}).to_string()),
        }));
        let ctx = context(&dir.path().join("artifacts"), transform.clone());
        let result = ParseProcessor::new(ctx).process(job(source, 1)).await;
        assert!(result.success);

        let quality = transform.calls_for("quality");
        assert_eq!(quality.len(), 1);
        assert!(quality[0].content.contains("page text 5"));
        assert!(!quality[0].content.contains("page text 6"));
    }

    #[tokio::test]
    async fn test_failed_page_fails_version() {
        let dir = TempDir::new().unwrap();
        let source = write_document(dir.path(), &["one", "two", "three"]);

        let transform = Arc::new(ScriptedTransform::new(|req| match req.call_site.as_str() {
            "quality" => Ok(json!({"confidence": 90, "problem": ""}).to_string()),
            _ if req.content == "two" => Err(TransformError::Request("upstream 502".to_string())),
            _ => Ok(json!({"markdown": req.content.clone()}).to_string()),
        }));
        let ctx = context(&dir.path().join("artifacts"), transform);

        let result = ParseProcessor::new(ctx).process(job(source, 3)).await;
        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(error.starts_with("Page 2 failed"), "{}", error);
        assert!(error.contains("upstream 502"));
    }

    #[tokio::test]
    async fn test_wrong_input_shape_fails() {
        let dir = TempDir::new().unwrap();
        let transform = Arc::new(ScriptedTransform::new(|_| Ok(String::new())));
        let ctx = context(dir.path(), transform);

        let bad = StageJob::new(
            version(Stage::Parse, 1),
            "banking",
            1,
            StageInput::Merge(version(Stage::Merge, 1)),
        );
        let result = ParseProcessor::new(ctx).process(bad).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("cannot consume merge input"));
    }
}
