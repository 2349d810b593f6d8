//! LLM integration for onto-forge.
//!
//! Stage processors never talk to an LLM directly. They go through the
//! [`ContentTransform`] seam; [`LlmTransform`] adapts any [`LlmProvider`]
//! (normally [`LiteLlmClient`]) to it.
//!
//! ```ignore
//! use onto_forge::llm::{LiteLlmClient, LlmTransform};
//! use std::sync::Arc;
//!
//! let client = LiteLlmClient::from_env()?;
//! let transform = LlmTransform::new(Arc::new(client)).with_temperature(0.2);
//! ```

pub mod litellm;
pub mod transform;

pub use litellm::{
    ContentPart, DataUrl, GenerationRequest, GenerationResponse, LiteLlmClient, LlmProvider,
    Message, MessageContent, Role, Usage, DEFAULT_MODEL,
};
pub use transform::{
    transform_with_timeout, ContentTransform, ImageInput, LlmTransform, TransformRequest,
};
