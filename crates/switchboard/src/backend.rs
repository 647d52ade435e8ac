//! Backend client interface.
//!
//! The pool invokes local inference daemons through this trait. The wire
//! protocol is JSON over HTTP: a `generate` call returning either a final
//! response with token counts or a chunked delta stream, a `tags` call
//! listing loaded models, and a `pull` call loading a model by name. The
//! concrete client lives in `switchboard-ollama`; tests use in-process
//! fakes.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A generation request sent to one endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// Model name as known to the daemon.
    pub model: String,
    /// Fully constructed prompt.
    pub prompt: String,
    /// Optional system prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
}

impl GenerateRequest {
    /// Build a request.
    #[must_use]
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            system: None,
        }
    }

    /// Attach a system prompt.
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// A completed generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    /// Generated text.
    pub response: String,
    /// Prompt tokens consumed.
    pub prompt_tokens: u64,
    /// Completion tokens produced.
    pub completion_tokens: u64,
}

impl GenerateResponse {
    /// Total tokens for cost accounting.
    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// One chunk of a streamed generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateChunk {
    /// Text delta; may be empty on the terminal chunk.
    pub delta: String,
    /// Terminal marker.
    pub done: bool,
    /// Completion tokens, populated on the terminal chunk.
    #[serde(default)]
    pub completion_tokens: u64,
}

/// Boxed chunk stream returned by streaming generation.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<GenerateChunk>> + Send>>;

/// A client for one inference endpoint.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Run a buffered generation.
    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse>;

    /// Run a streaming generation.
    async fn generate_stream(&self, request: &GenerateRequest) -> Result<ChunkStream>;

    /// List models currently loaded on the endpoint (the health probe).
    async fn list_models(&self) -> Result<Vec<String>>;

    /// Load a model by name (warm-up).
    async fn load_model(&self, model: &str) -> Result<()>;

    /// The endpoint URL, used as its identity in logs and metrics.
    fn endpoint_url(&self) -> &str;
}
