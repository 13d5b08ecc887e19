//! Chat, embedding and tokenize transport against an OpenAI-compatible
//! server, with retry, backoff and typed context-window detection.

use crate::config::LlmConfig;
use crate::error::{LlmError, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// Message role in a conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

/// Helper function to create a system message
pub fn system_message(content: impl Into<String>) -> Message {
    Message { role: Role::System, content: content.into() }
}

/// Helper function to create a user message
pub fn user_message(content: impl Into<String>) -> Message {
    Message { role: Role::User, content: content.into() }
}

/// Helper function to create an assistant message
pub fn assistant_message(content: impl Into<String>) -> Message {
    Message { role: Role::Assistant, content: content.into() }
}

/// Helper function to create a tool message
pub fn tool_message(content: impl Into<String>) -> Message {
    Message { role: Role::Tool, content: content.into() }
}

/// Trait for language model transport operations
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Non-streaming chat completion; returns the full assistant text
    async fn chat(&self, messages: &[Message]) -> Result<String>;

    /// Streaming chat completion; yields delta text chunks. Dropping the
    /// stream cancels generation.
    async fn chat_stream(&self, messages: &[Message]) -> Result<BoxStream<'static, Result<String>>>;

    /// Embed one text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of texts, preserving order
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Count tokens of a text; only the count is used
    async fn count_tokens(&self, text: &str) -> Result<usize>;
}

/// Substring the backend emits when a prompt cannot fit
const CONTEXT_WINDOW_MARKER: &str = "exceeds the available context size";

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChunk {
    choices: Vec<ChatStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChoice {
    delta: ChatStreamDelta,
}

#[derive(Debug, Deserialize, Default)]
struct ChatStreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct EmbedItem {
    embedding: Vec<Vec<f32>>,
}

#[derive(Debug, Serialize)]
struct TokenizeRequest<'a> {
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenizeResponse {
    tokens: Vec<i64>,
}

/// HTTP client for an OpenAI-compatible server
pub struct HttpLlmClient {
    client: reqwest::Client,
    config: LlmConfig,
}

impl HttpLlmClient {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| LlmError::ConnectionFailed(e.to_string()))?;

        Ok(Self { client, config })
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), endpoint)
    }

    /// Backoff for one attempt: base * 2^attempt capped, with symmetric jitter
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_base_ms.saturating_mul(1u64 << attempt.min(16));
        let capped = base.min(self.config.backoff_max_ms);
        let jitter_span = (capped as f64 * self.config.backoff_jitter_ratio) as i64;
        let jitter = if jitter_span > 0 {
            rand::rng().random_range(-jitter_span..=jitter_span)
        } else {
            0
        };
        Duration::from_millis((capped as i64 + jitter).max(0) as u64)
    }

    /// POST with the shared retry policy: 503 backs off exponentially, other
    /// transport failures retry immediately, non-retryable statuses fail fast.
    async fn post_with_retry<B: Serialize>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<reqwest::Response> {
        let mut last_error = String::new();

        for attempt in 0..self.config.max_retries.max(1) {
            match self.client.post(url).json(body).send().await {
                Ok(response) if response.status() == reqwest::StatusCode::SERVICE_UNAVAILABLE => {
                    let delay = self.backoff_delay(attempt);
                    warn!("503 from {url}, backing off {}ms", delay.as_millis());
                    last_error = "503 Service Unavailable".to_string();
                    tokio::time::sleep(delay).await;
                }
                Ok(response) => return Ok(response),
                Err(e) => {
                    last_error = e.to_string();
                    debug!("Transport error on attempt {attempt}: {last_error}");
                }
            }
        }

        Err(LlmError::RetriesExhausted {
            attempts: self.config.max_retries.max(1),
            last: last_error,
        }
        .into())
    }

    /// Map an error body, catching the context-window marker regardless of status
    async fn response_error(response: reqwest::Response) -> LlmError {
        let body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
        if body.contains(CONTEXT_WINDOW_MARKER) {
            return LlmError::ContextWindowExceeded;
        }
        error!("LLM API error: {body}");
        LlmError::GenerationFailed(body)
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn chat(&self, messages: &[Message]) -> Result<String> {
        debug!("Chat completion with {} messages", messages.len());

        let request = ChatRequest {
            model: &self.config.chat_model,
            messages,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            stream: false,
        };

        let response = self
            .post_with_retry(&self.api_url("v1/chat/completions"), &request)
            .await?;

        if !response.status().is_success() {
            return Err(Self::response_error(response).await.into());
        }

        let body = response
            .text()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        if body.contains(CONTEXT_WINDOW_MARKER) {
            return Err(LlmError::ContextWindowExceeded.into());
        }

        let parsed: ChatResponse =
            serde_json::from_str(&body).map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("no choices".to_string()))?;

        Ok(choice.message.content)
    }

    async fn chat_stream(
        &self,
        messages: &[Message],
    ) -> Result<BoxStream<'static, Result<String>>> {
        debug!("Streaming chat completion with {} messages", messages.len());

        let request = ChatRequest {
            model: &self.config.chat_model,
            messages,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            stream: true,
        };

        let response = self
            .post_with_retry(&self.api_url("v1/chat/completions"), &request)
            .await?;

        if !response.status().is_success() {
            return Err(Self::response_error(response).await.into());
        }

        // Parse `data:` lines out of the byte stream, tolerating chunk
        // boundaries that split lines.
        let stream = response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|b| b.to_vec())
                    .map_err(|e| crate::error::EngineError::from(LlmError::ConnectionFailed(e.to_string())))
            })
            .scan(String::new(), |buffer, chunk: Result<Vec<u8>>| {
                let out = match chunk {
                    Ok(bytes) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        let mut deltas = String::new();
                        while let Some(pos) = buffer.find('\n') {
                            let line = buffer[..pos].trim().to_string();
                            buffer.drain(..=pos);
                            let Some(payload) = line.strip_prefix("data:") else {
                                continue;
                            };
                            let payload = payload.trim();
                            if payload.is_empty() || payload == "[DONE]" {
                                continue;
                            }
                            if payload.contains(CONTEXT_WINDOW_MARKER) {
                                return futures::future::ready(Some(Err(
                                    LlmError::ContextWindowExceeded.into(),
                                )));
                            }
                            if let Ok(parsed) = serde_json::from_str::<ChatStreamChunk>(payload) {
                                if let Some(content) = parsed
                                    .choices
                                    .first()
                                    .and_then(|c| c.delta.content.as_deref())
                                {
                                    deltas.push_str(content);
                                }
                            }
                        }
                        Ok(deltas)
                    }
                    Err(e) => Err(e),
                };
                futures::future::ready(Some(out))
            })
            .filter(|item| {
                futures::future::ready(!matches!(item, Ok(ref s) if s.is_empty()))
            });

        Ok(stream.boxed())
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
        vectors
            .pop()
            .ok_or_else(|| LlmError::EmbeddingFailed("empty embedding response".to_string()).into())
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        debug!("Embedding batch of {} texts", texts.len());

        let request = EmbedRequest {
            model: &self.config.embedding_model,
            input: texts.iter().map(String::as_str).collect(),
        };

        let response = self
            .post_with_retry(&self.api_url("v1/embeddings"), &request)
            .await?;

        if !response.status().is_success() {
            return Err(Self::response_error(response).await.into());
        }

        let items: Vec<EmbedItem> = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        // each item carries a matrix; only the first vector is meaningful
        let mut vectors = Vec::with_capacity(items.len());
        for item in items {
            let first = item
                .embedding
                .into_iter()
                .next()
                .ok_or_else(|| LlmError::EmbeddingFailed("empty vector".to_string()))?;
            vectors.push(first);
        }
        Ok(vectors)
    }

    async fn count_tokens(&self, text: &str) -> Result<usize> {
        let request = TokenizeRequest { content: text };

        let response = timeout(
            Duration::from_secs(self.config.request_timeout_secs),
            self.post_with_retry(&self.api_url("tokenize"), &request),
        )
        .await
        .map_err(|_| LlmError::Timeout)??;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::TokenizeFailed(body).into());
        }

        let parsed: TokenizeResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        Ok(parsed.tokens.len())
    }
}
