//! Language-model backends.
//!
//! The oracle only needs one thing from a model: turn a prompt into text.
//! `LlmBackend` is that seam; OpenRouter is the production implementation.

mod error;
mod openrouter;

pub use error::{classify_http_status, LlmError, LlmErrorKind, RetryConfig};
pub use openrouter::OpenRouterBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Role in a chat conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Backend/model name for logs.
    fn name(&self) -> &str;

    /// Complete a single prompt and return the raw text answer.
    async fn complete(&self, prompt: &str, temperature: f64) -> Result<String, LlmError>;
}
