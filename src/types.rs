//! Lithos - Type Definitions
//!
//! Shared types for the multi-agent chat backend: agent profiles,
//! conversation turns, tool-call requests/results, and the traits the
//! external collaborators (model backend, memory service) implement.

use std::sync::atomic::AtomicBool;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ModelError;

// ─── Agents ──────────────────────────────────────────────────────

/// Static description of one agent. Loaded at startup, never mutated.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfile {
    pub id: String,
    pub role: String,
    pub description: String,
    /// Model identifier passed to the inference backend.
    pub model: String,
    /// Per-agent model call timeout, in seconds.
    pub timeout_secs: u64,
    /// Context window (num_ctx) requested from the backend.
    pub context_window: u32,
    /// Whether this agent may invoke filesystem and memory tools.
    pub tools_enabled: bool,
}

// ─── Conversation ────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One turn of a conversation. Ordering is significant; turns form an
/// append-only sequence per agent.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into() }
    }
}

// ─── Tool Calls ──────────────────────────────────────────────────

/// A structured action request parsed out of model output. Never persisted.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolCallRequest {
    pub action: String,
    pub args: serde_json::Map<String, Value>,
}

/// The outcome of executing one tool call. `result` is either the success
/// payload or an `{"error": ..., "kind": ...}` object; either way it is
/// serialized back into the conversation verbatim for the model to consume.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    pub action: String,
    pub result: Value,
}

impl ToolCallResult {
    pub fn is_error(&self) -> bool {
        self.result.get("error").is_some()
    }
}

// ─── Turn Outcome ────────────────────────────────────────────────

/// Result of one full agent turn (user message plus the bounded exchange of
/// model calls and tool executions it triggered).
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnOutcome {
    pub agent_id: String,
    pub response: String,
    pub model: String,
    pub iterations: u32,
    pub cancelled: bool,
    pub memories_used: usize,
}

// ─── Model Collaborator ──────────────────────────────────────────

/// What a streamed completion produced before it finished or was cancelled.
#[derive(Clone, Debug)]
pub struct StreamOutcome {
    pub text: String,
    pub cancelled: bool,
}

/// The language-model inference backend. Reachable over a local network
/// call; process lifecycle is someone else's problem.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatTurn],
        timeout: Duration,
        context_window: u32,
    ) -> Result<String, ModelError>;

    /// Streaming variant. `on_fragment` is invoked for each received text
    /// fragment; the cancel flag is checked between fragments and stops
    /// consumption early, returning whatever was received so far.
    async fn complete_streaming(
        &self,
        model: &str,
        messages: &[ChatTurn],
        timeout: Duration,
        context_window: u32,
        cancel: &AtomicBool,
        on_fragment: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> Result<StreamOutcome, ModelError>;
}

// ─── Memory Collaborator ─────────────────────────────────────────

/// One ranked snippet returned by the memory service.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryHit {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// The long-term semantic memory store. Unavailability is non-fatal
/// everywhere: callers degrade to no-memory operation.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn store(&self, text: &str, owner: &str, metadata: Value) -> anyhow::Result<()>;

    async fn search(
        &self,
        query: &str,
        owner: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<MemoryHit>>;
}
