//! Memory Service Client
//!
//! REST client for the long-term semantic memory service, plus the
//! heuristic deciding which exchanges are worth copying into the shared
//! pool. The service being down is never fatal; callers degrade to
//! no-memory operation.

use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde_json::{json, Value};

use crate::types::{MemoryHit, MemoryStore};

/// Owner id of the cross-agent memory pool.
pub const SHARED_OWNER: &str = "shared";

/// Messages at or below this length never reach the shared pool.
pub const MIN_SHARED_LEN: usize = 50;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

fn filler_prefix_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        RegexBuilder::new(
            r"^\s*(hi|hello|hey|yo|howdy|good (morning|afternoon|evening)|thanks|thank you|thx|ok|okay|yes|no|yeah|yep|nope|sure|got it|sounds good|great|cool|nice|perfect|alright)\b",
        )
        .case_insensitive(true)
        .build()
        .expect("filler-prefix pattern")
    })
}

/// Whether a user message carries enough substance to store in the shared
/// pool: long enough, and not opening with conversational filler.
pub fn is_worth_sharing(message: &str) -> bool {
    if message.len() <= MIN_SHARED_LEN {
        return false;
    }
    !filler_prefix_regex().is_match(message)
}

pub struct HttpMemoryStore {
    base_url: String,
    http: reqwest::Client,
}

impl HttpMemoryStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }
}

/// The service replies with either a bare list or `{"results": [...]}`.
fn normalize_results(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("results") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

/// Memory entries carry their text under `memory` or `text`.
fn hit_from_value(value: &Value) -> Option<MemoryHit> {
    let text = value
        .get("memory")
        .or_else(|| value.get("text"))
        .and_then(Value::as_str)?
        .to_string();
    if text.is_empty() {
        return None;
    }
    Some(MemoryHit {
        text,
        score: value.get("score").and_then(Value::as_f64),
        metadata: value.get("metadata").cloned(),
    })
}

#[async_trait]
impl MemoryStore for HttpMemoryStore {
    async fn store(&self, text: &str, owner: &str, metadata: Value) -> Result<()> {
        let url = format!("{}/memories", self.base_url);
        self.http
            .post(&url)
            .json(&json!({
                "text": text,
                "userId": owner,
                "metadata": metadata,
            }))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .context("memory store request failed")?
            .error_for_status()
            .context("memory store rejected")?;
        Ok(())
    }

    async fn search(&self, query: &str, owner: &str, limit: usize) -> Result<Vec<MemoryHit>> {
        let url = format!("{}/search", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&json!({
                "query": query,
                "userId": owner,
                "limit": limit,
            }))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .context("memory search request failed")?
            .error_for_status()
            .context("memory search rejected")?;

        let body: Value = response.json().await.context("memory search body unreadable")?;
        Ok(normalize_results(body)
            .iter()
            .filter_map(hit_from_value)
            .collect())
    }
}
