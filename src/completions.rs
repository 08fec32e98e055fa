//! OpenAI-compatible chat completions client.
//!
//! The orchestrator talks to the upstream model service through the
//! [`CompletionClient`] trait so tests can script the token stream. The
//! production implementation speaks the chat-completions SSE protocol over
//! `reqwest` and honors the per-request cancellation token: once the token
//! fires, no further chunks are requested and the underlying connection is
//! dropped.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

// Per-chunk timeout for streaming reads
const STREAM_CHUNK_TIMEOUT_SECS: u64 = 120;
const CHUNK_CHANNEL_BUFFER: usize = 100;

#[derive(Error, Debug)]
pub enum CompletionError {
    #[error("completion request cancelled")]
    Cancelled,
    #[error("completions request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("completions API returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("malformed completions response: {0}")]
    Protocol(String),
}

/// A chunk from the completion stream
#[derive(Clone, Debug, PartialEq)]
pub enum CompletionChunk {
    /// One incremental fragment of assistant text
    Delta(String),
    /// Stream finished
    Done,
    /// Stream error occurred
    Error(String),
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Begin a streaming completion. Chunks arrive on the returned channel in
    /// upstream order; the reader stops requesting chunks once `cancel`
    /// fires.
    async fn stream_chat(
        &self,
        model: &str,
        messages: Vec<Value>,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<CompletionChunk>, CompletionError>;

    /// Non-streaming completion returning the assistant message content.
    async fn complete(
        &self,
        model: &str,
        messages: Vec<Value>,
        cancel: CancellationToken,
    ) -> Result<String, CompletionError>;
}

// ============================================================================
// reqwest implementation
// ============================================================================

pub struct OpenAiCompletionClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiCompletionClient {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl CompletionClient for OpenAiCompletionClient {
    async fn stream_chat(
        &self,
        model: &str,
        messages: Vec<Value>,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<CompletionChunk>, CompletionError> {
        let body = json!({
            "model": model,
            "messages": messages,
            "stream": true,
        });

        let request = self
            .http
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&body);

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(CompletionError::Cancelled),
            result = request.send() => result?,
        };

        if !response.status().is_success() {
            return Err(CompletionError::Status(response.status()));
        }

        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_BUFFER);

        tokio::spawn(async move {
            let mut body_stream = response.bytes_stream();
            let mut buffer = String::new();

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("completion stream cancelled, dropping upstream connection");
                        return;
                    }
                    next = timeout(
                        Duration::from_secs(STREAM_CHUNK_TIMEOUT_SECS),
                        body_stream.next(),
                    ) => next,
                };

                match next {
                    Ok(Some(Ok(bytes))) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));

                        while let Some(frame) = extract_sse_frame(&mut buffer) {
                            if frame == "[DONE]" {
                                let _ = tx.send(CompletionChunk::Done).await;
                                return;
                            }

                            match serde_json::from_str::<Value>(&frame) {
                                Ok(chunk_json) => {
                                    if let Some(content) = delta_content(&chunk_json) {
                                        if !content.is_empty()
                                            && tx
                                                .send(CompletionChunk::Delta(content.to_string()))
                                                .await
                                                .is_err()
                                        {
                                            // Consumer dropped, stop reading
                                            return;
                                        }
                                    }
                                }
                                Err(e) => {
                                    error!("non-JSON data frame from completions API: {:?}", e);
                                    let _ = tx
                                        .send(CompletionChunk::Error(
                                            "invalid upstream frame".to_string(),
                                        ))
                                        .await;
                                    return;
                                }
                            }
                        }
                    }
                    Ok(Some(Err(e))) => {
                        error!("completions stream read failed: {:?}", e);
                        let _ = tx.send(CompletionChunk::Error(e.to_string())).await;
                        return;
                    }
                    Ok(None) => {
                        // Stream ended without explicit [DONE]
                        let _ = tx.send(CompletionChunk::Done).await;
                        return;
                    }
                    Err(_) => {
                        error!(
                            "completions stream chunk timeout after {}s",
                            STREAM_CHUNK_TIMEOUT_SECS
                        );
                        let _ = tx
                            .send(CompletionChunk::Error("stream timeout".to_string()))
                            .await;
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn complete(
        &self,
        model: &str,
        messages: Vec<Value>,
        cancel: CancellationToken,
    ) -> Result<String, CompletionError> {
        let body = json!({
            "model": model,
            "messages": messages,
            "stream": false,
        });

        let request = self
            .http
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&body);

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(CompletionError::Cancelled),
            result = request.send() => result?,
        };

        if !response.status().is_success() {
            return Err(CompletionError::Status(response.status()));
        }

        let response_json: Value = tokio::select! {
            _ = cancel.cancelled() => return Err(CompletionError::Cancelled),
            result = response.json() => result?,
        };

        response_json
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.trim().to_string())
            .ok_or_else(|| CompletionError::Protocol("missing message content".to_string()))
    }
}

/// Helper to extract SSE frame from buffer
/// Returns the data portion of "data: <content>" frames, None if no complete frame available
fn extract_sse_frame(buffer: &mut String) -> Option<String> {
    loop {
        if let Some(pos) = buffer.find("\n\n") {
            let frame = buffer[..pos].to_string();
            *buffer = buffer[pos + 2..].to_string();

            // Skip empty frames
            if frame.trim().is_empty() {
                continue;
            }

            // Return data content if it's a data frame, otherwise keep looking
            if let Some(data) = frame.strip_prefix("data: ") {
                return Some(data.trim().to_string());
            }
            // Skip non-data frames (comments, etc.) and continue looking
            continue;
        }

        // No complete frame available
        return None;
    }
}

/// Content fragment of a streaming chunk, if it carries one
fn delta_content(chunk: &Value) -> Option<&str> {
    chunk
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|c| c.as_str())
}
