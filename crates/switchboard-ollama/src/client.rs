//! HTTP client for one Ollama endpoint.

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use switchboard::backend::{
    BackendClient, ChunkStream, GenerateChunk, GenerateRequest, GenerateResponse,
};
use switchboard::error::{Error, Result};

/// Client for a single Ollama endpoint.
///
/// # Example
/// ```no_run
/// use switchboard_ollama::OllamaBackend;
///
/// let backend = OllamaBackend::new("http://localhost:11434")
///     .with_connect_timeout(std::time::Duration::from_secs(2));
/// ```
#[derive(Debug, Clone)]
pub struct OllamaBackend {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct GenerateBody<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateReply {
    #[serde(default)]
    response: String,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
}

#[derive(Deserialize)]
struct StreamLine {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    eval_count: u64,
}

#[derive(Deserialize)]
struct TagsReply {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
}

#[derive(Serialize)]
struct PullBody<'a> {
    name: &'a str,
    stream: bool,
}

impl OllamaBackend {
    /// Build a client for `base_url` (e.g. `http://localhost:11434`).
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    /// Rebuild the inner HTTP client with a connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait]
impl BackendClient for OllamaBackend {
    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse> {
        let body = GenerateBody {
            model: &request.model,
            prompt: &request.prompt,
            system: request.system.as_deref(),
            stream: false,
        };
        let response = self
            .client
            .post(self.url("/api/generate"))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Backend(format!("generate request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Backend(format!(
                "generate returned HTTP {}",
                response.status()
            )));
        }
        let reply: GenerateReply = response
            .json()
            .await
            .map_err(|e| Error::Backend(format!("generate body unreadable: {e}")))?;
        Ok(GenerateResponse {
            response: reply.response,
            prompt_tokens: reply.prompt_eval_count,
            completion_tokens: reply.eval_count,
        })
    }

    async fn generate_stream(&self, request: &GenerateRequest) -> Result<ChunkStream> {
        let body = GenerateBody {
            model: &request.model,
            prompt: &request.prompt,
            system: request.system.as_deref(),
            stream: true,
        };
        let response = self
            .client
            .post(self.url("/api/generate"))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Backend(format!("stream request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Backend(format!(
                "stream returned HTTP {}",
                response.status()
            )));
        }

        // The daemon sends one JSON object per line; frames may split
        // across network reads, so buffer until each newline.
        let mut bytes = response.bytes_stream();
        let chunks = stream! {
            let mut buffer = Vec::new();
            'outer: while let Some(piece) = bytes.next().await {
                let piece = match piece {
                    Ok(piece) => piece,
                    Err(e) => {
                        yield Err(Error::Backend(format!("stream read failed: {e}")));
                        break;
                    }
                };
                buffer.extend_from_slice(&piece);
                while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=newline).collect();
                    let line = &line[..line.len() - 1];
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_slice::<StreamLine>(line) {
                        Ok(parsed) => {
                            let done = parsed.done;
                            yield Ok(GenerateChunk {
                                delta: parsed.response,
                                done,
                                completion_tokens: parsed.eval_count,
                            });
                            if done {
                                break 'outer;
                            }
                        }
                        Err(e) => {
                            yield Err(Error::Backend(format!("stream frame unreadable: {e}")));
                            break 'outer;
                        }
                    }
                }
            }
        };
        Ok(Box::pin(chunks))
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .get(self.url("/api/tags"))
            .send()
            .await
            .map_err(|e| Error::Backend(format!("tags request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Backend(format!(
                "tags returned HTTP {}",
                response.status()
            )));
        }
        let reply: TagsReply = response
            .json()
            .await
            .map_err(|e| Error::Backend(format!("tags body unreadable: {e}")))?;
        Ok(reply.models.into_iter().map(|m| m.name).collect())
    }

    async fn load_model(&self, model: &str) -> Result<()> {
        let body = PullBody {
            name: model,
            stream: false,
        };
        let response = self
            .client
            .post(self.url("/api/pull"))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Backend(format!("pull request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Backend(format!(
                "pull returned HTTP {}",
                response.status()
            )));
        }
        tracing::info!(endpoint = %self.base_url, model, "model pulled");
        Ok(())
    }

    fn endpoint_url(&self) -> &str {
        &self.base_url
    }
}
