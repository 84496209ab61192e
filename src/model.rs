//! Ollama Client
//!
//! Concrete `ModelClient` for an Ollama-compatible `/api/chat` endpoint.
//! Non-streaming calls return the full message content; streaming calls
//! consume the NDJSON body line by line, checking the cancel flag between
//! chunks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};

use crate::error::ModelError;
use crate::types::{ChatTurn, ModelClient, StreamOutcome};

/// How long the backend keeps the model loaded after a call.
const KEEP_ALIVE: &str = "5m";

pub struct OllamaClient {
    base_url: String,
    http: reqwest::Client,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }

    fn request_body(model: &str, messages: &[ChatTurn], stream: bool, context_window: u32) -> Value {
        json!({
            "model": model,
            "messages": messages,
            "stream": stream,
            "keep_alive": KEEP_ALIVE,
            "options": { "num_ctx": context_window },
        })
    }

    fn map_error(err: reqwest::Error, timeout: Duration) -> ModelError {
        if err.is_timeout() {
            ModelError::Timeout(timeout)
        } else {
            ModelError::Unavailable(err.to_string())
        }
    }

    /// Probe the backend without loading a model.
    pub async fn is_reachable(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        matches!(
            self.http.get(&url).timeout(Duration::from_secs(3)).send().await,
            Ok(resp) if resp.status().is_success()
        )
    }
}

/// Pull the content fragment and done flag out of one NDJSON stream line.
fn parse_stream_line(line: &str) -> Option<(String, bool)> {
    let value: Value = serde_json::from_str(line).ok()?;
    let content = value
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let done = value.get("done").and_then(Value::as_bool).unwrap_or(false);
    Some((content, done))
}

#[async_trait]
impl ModelClient for OllamaClient {
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatTurn],
        timeout: Duration,
        context_window: u32,
    ) -> Result<String, ModelError> {
        let url = format!("{}/api/chat", self.base_url);
        let body = Self::request_body(model, messages, false, context_window);

        let response = self
            .http
            .post(&url)
            .json(&body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Self::map_error(e, timeout))?
            .error_for_status()
            .map_err(|e| ModelError::Unavailable(e.to_string()))?;

        let parsed: Value = response
            .json()
            .await
            .map_err(|e| Self::map_error(e, timeout))?;

        Ok(parsed
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    async fn complete_streaming(
        &self,
        model: &str,
        messages: &[ChatTurn],
        timeout: Duration,
        context_window: u32,
        cancel: &AtomicBool,
        on_fragment: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> Result<StreamOutcome, ModelError> {
        let url = format!("{}/api/chat", self.base_url);
        let body = Self::request_body(model, messages, true, context_window);

        let response = self
            .http
            .post(&url)
            .json(&body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Self::map_error(e, timeout))?
            .error_for_status()
            .map_err(|e| ModelError::Unavailable(e.to_string()))?;

        let mut stream = response.bytes_stream();
        let mut text = String::new();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            if cancel.load(Ordering::SeqCst) {
                return Ok(StreamOutcome { text, cancelled: true });
            }
            let chunk = chunk.map_err(|e| Self::map_error(e, timeout))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // NDJSON: complete lines only; a partial object stays buffered.
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer.drain(..=pos);
                if line.is_empty() {
                    continue;
                }
                if let Some((content, done)) = parse_stream_line(&line) {
                    if !content.is_empty() {
                        text.push_str(&content);
                        on_fragment(&content);
                    }
                    if done {
                        return Ok(StreamOutcome { text, cancelled: false });
                    }
                }
            }
        }

        Ok(StreamOutcome { text, cancelled: false })
    }
}
