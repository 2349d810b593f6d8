//! The content transform seam used by stage processors.
//!
//! A transform takes a system prompt, an instruction prompt and a content
//! payload (text, optionally with page images) and returns raw text. The
//! caller is responsible for validating that text against its own schema.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::litellm::{GenerationRequest, LlmProvider, Message};
use crate::error::TransformError;

/// An image attached to a transform request.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageInput {
    /// MIME type, e.g. `image/png`.
    pub media_type: String,
    pub data: Vec<u8>,
}

impl ImageInput {
    pub fn png(data: Vec<u8>) -> Self {
        Self {
            media_type: "image/png".to_string(),
            data,
        }
    }

    /// JPEG when the bytes carry the JPEG signature, PNG otherwise.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Self {
                media_type: "image/jpeg".to_string(),
                data,
            }
        } else {
            Self::png(data)
        }
    }

    /// File extension matching the media type.
    pub fn extension(&self) -> &'static str {
        match self.media_type.as_str() {
            "image/jpeg" => "jpg",
            _ => "png",
        }
    }
}

/// One call to the content transform.
#[derive(Debug, Clone)]
pub struct TransformRequest {
    /// Name of the calling site (`quality`, `page`, `extract`, ...).
    /// Used for logging, metrics and test scripting.
    pub call_site: String,
    pub system_prompt: String,
    pub instruction_prompt: String,
    pub content: String,
    pub images: Vec<ImageInput>,
}

impl TransformRequest {
    pub fn new(
        call_site: impl Into<String>,
        system_prompt: impl Into<String>,
        instruction_prompt: impl Into<String>,
    ) -> Self {
        Self {
            call_site: call_site.into(),
            system_prompt: system_prompt.into(),
            instruction_prompt: instruction_prompt.into(),
            content: String::new(),
            images: Vec::new(),
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_images(mut self, images: Vec<ImageInput>) -> Self {
        self.images = images;
        self
    }
}

/// External capability that turns prompts plus content into raw text.
#[async_trait]
pub trait ContentTransform: Send + Sync {
    async fn transform(&self, request: TransformRequest) -> Result<String, TransformError>;
}

/// Runs a transform with a caller-side timeout.
///
/// Expiry is reported as `TransformError::Timeout` so callers treat it like
/// any other transform failure.
pub async fn transform_with_timeout(
    transform: &dyn ContentTransform,
    request: TransformRequest,
    timeout: Duration,
) -> Result<String, TransformError> {
    let call_site = request.call_site.clone();
    match tokio::time::timeout(timeout, transform.transform(request)).await {
        Ok(result) => result,
        Err(_) => Err(TransformError::Timeout {
            call_site,
            seconds: timeout.as_secs(),
        }),
    }
}

/// [`ContentTransform`] backed by an [`LlmProvider`].
pub struct LlmTransform {
    provider: Arc<dyn LlmProvider>,
    model: String,
    temperature: f64,
    max_tokens: u32,
}

impl LlmTransform {
    /// Creates a transform that uses the provider's default model.
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            model: String::new(),
            temperature: 0.2,
            max_tokens: 8000,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[async_trait]
impl ContentTransform for LlmTransform {
    async fn transform(&self, request: TransformRequest) -> Result<String, TransformError> {
        let text = if request.content.is_empty() {
            request.instruction_prompt
        } else {
            format!("{}\n\n{}", request.instruction_prompt, request.content)
        };

        let user = Message::user_with_images(text, &request.images);

        let generation = GenerationRequest::new(
            self.model.clone(),
            vec![Message::system(request.system_prompt), user],
        )
        .with_temperature(self.temperature)
        .with_max_tokens(self.max_tokens);

        let response = self.provider.generate(generation).await?;
        if response.truncated() {
            warn!(call_site = %request.call_site, "transform output hit the token limit");
        }
        match response.content {
            Some(content) if !content.trim().is_empty() => Ok(content),
            _ => Err(TransformError::EmptyResponse(request.call_site)),
        }
    }
}
