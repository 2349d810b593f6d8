//! Chat-completions client used behind [`LlmTransform`](super::LlmTransform).
//!
//! Speaks the OpenAI-compatible `/chat/completions` protocol exposed by a
//! LiteLLM proxy. Page images travel inline as base64 data URLs so the parse
//! stage can send scans alongside their text layer.

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::debug;

use super::transform::ImageInput;
use crate::error::TransformError;

/// Model used when neither the request nor the environment names one.
pub const DEFAULT_MODEL: &str = "anthropic/claude-opus-4.5";

/// Upper bound on a single HTTP exchange. Stage timeouts are usually tighter.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: DataUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataUrl {
    pub url: String,
}

impl DataUrl {
    fn encode(image: &ImageInput) -> Self {
        let payload = base64::engine::general_purpose::STANDARD.encode(&image.data);
        Self {
            url: format!("data:{};base64,{}", image.media_type, payload),
        }
    }
}

/// Plain text serializes as a string; anything with images as a part list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Text carried by the message, image parts skipped.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => {
                let texts: Vec<&str> = parts
                    .iter()
                    .filter_map(|part| match part {
                        ContentPart::Text { text } => Some(text.as_str()),
                        ContentPart::ImageUrl { .. } => None,
                    })
                    .collect();
                texts.join("\n")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    /// User turn with page images after the text. Falls back to a plain text
    /// body when `images` is empty.
    pub fn user_with_images(text: impl Into<String>, images: &[ImageInput]) -> Self {
        if images.is_empty() {
            return Self::user(text);
        }
        let mut parts = Vec::with_capacity(images.len() + 1);
        parts.push(ContentPart::Text { text: text.into() });
        parts.extend(images.iter().map(|image| ContentPart::ImageUrl {
            image_url: DataUrl::encode(image),
        }));
        Self {
            role: Role::User,
            content: MessageContent::Parts(parts),
        }
    }
}

/// A chat completion call. An empty `model` selects the client default.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

impl GenerationRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// The first completion of a chat call. Additional choices are discarded.
#[derive(Debug, Clone, Default)]
pub struct GenerationResponse {
    pub model: String,
    pub content: Option<String>,
    pub finish_reason: Option<String>,
    pub usage: Usage,
}

impl GenerationResponse {
    pub fn text(&self) -> Option<&str> {
        self.content.as_deref()
    }

    /// True when the model stopped because it ran out of tokens.
    pub fn truncated(&self) -> bool {
        self.finish_reason.as_deref() == Some("length")
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate(&self, request: GenerationRequest)
        -> Result<GenerationResponse, TransformError>;
}

/// [`LlmProvider`] for a LiteLLM proxy or any OpenAI-compatible endpoint.
pub struct LiteLlmClient {
    completions_url: String,
    api_key: Option<String>,
    default_model: String,
    http: Client,
}

impl LiteLlmClient {
    /// `api_base` is the proxy root, e.g. `http://localhost:4000`.
    pub fn new(
        api_base: String,
        api_key: Option<String>,
        default_model: String,
    ) -> Result<Self, TransformError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TransformError::Request(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            completions_url: format!("{}/chat/completions", api_base.trim_end_matches('/')),
            api_key,
            default_model,
            http,
        })
    }

    /// Reads `LITELLM_API_BASE` (required), `LITELLM_API_KEY` and
    /// `LITELLM_DEFAULT_MODEL`.
    pub fn from_env() -> Result<Self, TransformError> {
        let api_base = env::var("LITELLM_API_BASE").map_err(|_| TransformError::MissingApiBase)?;
        let api_key = env::var("LITELLM_API_KEY").ok().filter(|k| !k.is_empty());
        let default_model =
            env::var("LITELLM_DEFAULT_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Self::new(api_base, api_key, default_model)
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireError {
    error: WireErrorDetail,
}

#[derive(Deserialize)]
struct WireErrorDetail {
    message: String,
}

/// Maps a non-success HTTP status and body to a transform error, preferring
/// the provider's own message when the body is a JSON error envelope.
fn status_error(code: u16, body: String) -> TransformError {
    let message = serde_json::from_str::<WireError>(&body)
        .map(|e| e.error.message)
        .unwrap_or(body);
    if code == 429 {
        TransformError::RateLimited(message)
    } else {
        TransformError::Api { code, message }
    }
}

impl From<WireResponse> for GenerationResponse {
    fn from(wire: WireResponse) -> Self {
        let first = wire.choices.into_iter().next();
        let (content, finish_reason) = match first {
            Some(choice) => (choice.message.content, choice.finish_reason),
            None => (None, None),
        };
        Self {
            model: wire.model,
            content,
            finish_reason,
            usage: wire.usage.unwrap_or_default(),
        }
    }
}

#[async_trait]
impl LlmProvider for LiteLlmClient {
    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResponse, TransformError> {
        let model = if request.model.is_empty() {
            self.default_model.as_str()
        } else {
            request.model.as_str()
        };
        let body = WireRequest {
            model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let mut call = self
            .http
            .post(&self.completions_url)
            .header("X-Title", "onto-forge")
            .json(&body);
        if let Some(key) = &self.api_key {
            call = call.bearer_auth(key);
        }

        let reply = call
            .send()
            .await
            .map_err(|e| TransformError::Request(e.to_string()))?;

        let status = reply.status();
        if !status.is_success() {
            let text = reply
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(status_error(status.as_u16(), text));
        }

        let wire: WireResponse = reply.json().await.map_err(|e| {
            TransformError::Request(format!("Failed to parse API response: {}", e))
        })?;
        let response = GenerationResponse::from(wire);
        debug!(
            model = %response.model,
            prompt_tokens = response.usage.prompt_tokens,
            completion_tokens = response.usage.completion_tokens,
            truncated = response.truncated(),
            "chat completion finished"
        );
        Ok(response)
    }
}
