//! Stdio IPC Server
//!
//! Line-delimited JSON over stdin/stdout. Each request carries an `id` and
//! a `command`; each response echoes the `id` with `status` `ok` or
//! `error`. Chat runs on its own task so `cancel` stays responsive while a
//! turn is in flight. Logs go to stderr; stdout carries frames only.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use crate::agent::AgentLoopController;
use crate::config::resolve_path;
use crate::history::ConversationHistory;
use crate::memory::SHARED_OWNER;
use crate::model::OllamaClient;
use crate::sandbox::SandboxPolicy;
use crate::tools::{FileAction, FileToolSet};
use crate::transcript::{TranscriptMessage, TranscriptStore};
use crate::types::MemoryStore;

pub struct Backend {
    controller: Arc<AgentLoopController>,
    tools: Arc<FileToolSet>,
    sandbox: Arc<SandboxPolicy>,
    history: Arc<ConversationHistory>,
    transcripts: Arc<TranscriptStore>,
    memory: Option<Arc<dyn MemoryStore>>,
    /// Shared with the model client for reachability probes only.
    probe: Arc<OllamaClient>,
    cancel: Arc<AtomicBool>,
}

fn ok(id: &str, data: Value) -> Value {
    let mut response = json!({"id": id, "status": "ok"});
    merge(&mut response, data);
    response
}

fn err(id: &str, message: impl Into<String>) -> Value {
    json!({"id": id, "status": "error", "message": message.into()})
}

fn merge(target: &mut Value, data: Value) {
    if let (Some(target), Value::Object(data)) = (target.as_object_mut(), data) {
        for (k, v) in data {
            target.insert(k, v);
        }
    }
}

fn str_arg<'a>(request: &'a Value, key: &str) -> &'a str {
    request.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn usize_arg(request: &Value, key: &str, default: usize) -> usize {
    request
        .get(key)
        .and_then(Value::as_u64)
        .map(|v| v as usize)
        .unwrap_or(default)
}

impl Backend {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        controller: Arc<AgentLoopController>,
        tools: Arc<FileToolSet>,
        sandbox: Arc<SandboxPolicy>,
        history: Arc<ConversationHistory>,
        transcripts: Arc<TranscriptStore>,
        memory: Option<Arc<dyn MemoryStore>>,
        probe: Arc<OllamaClient>,
    ) -> Self {
        Self {
            controller,
            tools,
            sandbox,
            history,
            transcripts,
            memory,
            probe,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn controller(&self) -> &Arc<AgentLoopController> {
        &self.controller
    }

    /// Main loop: read requests from stdin until EOF. Responses and
    /// streaming frames are serialized through one writer task.
    pub async fn run_stdio(self: Arc<Self>) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Value>();

        let writer = tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(frame) = rx.recv().await {
                let mut line = frame.to_string();
                line.push('\n');
                if stdout.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                let _ = stdout.flush().await;
            }
        });

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let request: Value = match serde_json::from_str(line) {
                Ok(v) => v,
                Err(e) => {
                    let _ = tx.send(json!({"status": "error", "message": format!("Invalid JSON: {}", e)}));
                    continue;
                }
            };

            let id = request
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            let command = str_arg(&request, "command").to_string();

            if command == "chat" {
                // Off the read loop so cancel can interrupt it.
                let backend = Arc::clone(&self);
                let tx = tx.clone();
                tokio::spawn(async move {
                    let response = backend.cmd_chat(&id, &request, &tx).await;
                    let _ = tx.send(response);
                });
            } else {
                let response = self.handle_request(&id, &command, &request).await;
                let _ = tx.send(response);
            }
        }

        drop(tx);
        let _ = writer.await;
        Ok(())
    }

    /// Dispatch every command except `chat`.
    pub async fn handle_request(&self, id: &str, command: &str, request: &Value) -> Value {
        match command {
            "status" => ok(id, self.cmd_status().await),
            "agents_list" => ok(id, self.cmd_agents_list()),
            "cancel" => {
                self.cancel.store(true, Ordering::SeqCst);
                info!("cancel requested");
                ok(id, json!({"message": "Cancelled"}))
            }
            "set_project_root" => match self.cmd_set_project_root(request) {
                Ok(data) => ok(id, data),
                Err(message) => err(id, message),
            },
            "read_file" => ok(id, self.run_tool(FileAction::Read, request)),
            "system_info" => ok(id, crate::tools::system_info()),
            "list_files" => ok(id, self.run_tool(FileAction::List, request)),
            "search_files" => ok(id, self.run_tool(FileAction::Search, request)),
            "clear_history" => ok(id, self.cmd_clear_history(request)),
            "search" => ok(id, self.cmd_search(request).await),
            "list_sessions" => ok(id, json!({"sessions": self.transcripts.list_sessions()})),
            "load_session" => match self.cmd_load_session(request) {
                Ok(data) => ok(id, data),
                Err(message) => err(id, message),
            },
            "new_session" => ok(id, self.cmd_new_session()),
            other => err(id, format!("Unknown command: {}", other)),
        }
    }

    async fn cmd_chat(&self, id: &str, request: &Value, tx: &mpsc::UnboundedSender<Value>) -> Value {
        let message = str_arg(request, "message").trim().to_string();
        if message.is_empty() {
            return err(id, "Empty message");
        }
        let agent_id = str_arg(request, "agent_id").to_string();
        if agent_id.is_empty() {
            return err(id, "Missing agent_id");
        }

        let frame_id = id.to_string();
        let stream_tx = tx.clone();
        let emit = move |chunk: &str| {
            let _ = stream_tx.send(json!({
                "id": frame_id,
                "status": "streaming",
                "chunk": chunk,
            }));
        };

        let outcome = match self
            .controller
            .run_turn(&agent_id, &message, &self.cancel, Some(&emit))
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => return err(id, e.to_string()),
        };

        let mut data = serde_json::to_value(&outcome).unwrap_or_else(|_| json!({}));

        if !outcome.cancelled {
            let sid = self
                .transcripts
                .current_session()
                .unwrap_or_else(|| self.transcripts.new_session());
            let now = chrono::Utc::now().timestamp_millis();
            self.transcripts.save_message(
                Some(&sid),
                TranscriptMessage {
                    kind: "user".to_string(),
                    content: message,
                    agent_id: None,
                    timestamp: now,
                    meta: None,
                },
            );
            self.transcripts.save_message(
                Some(&sid),
                TranscriptMessage {
                    kind: "agent".to_string(),
                    content: outcome.response.clone(),
                    agent_id: Some(outcome.agent_id.clone()),
                    timestamp: now,
                    meta: Some(json!({"model": outcome.model, "iterations": outcome.iterations})),
                },
            );
            merge(&mut data, json!({"sessionId": sid}));
        }

        ok(id, data)
    }

    async fn cmd_status(&self) -> Value {
        let model_ok = self.probe.is_reachable().await;
        let agents: Vec<&str> = self
            .controller
            .profiles()
            .iter()
            .map(|p| p.id.as_str())
            .collect();
        json!({
            "model": model_ok,
            "memoryConfigured": self.memory.is_some(),
            "projectRoot": self.sandbox.project_root().map(|p| p.to_string_lossy().to_string()),
            "agents": agents,
        })
    }

    fn cmd_agents_list(&self) -> Value {
        let agents: Vec<Value> = self
            .controller
            .profiles()
            .iter()
            .map(|p| {
                json!({
                    "id": p.id,
                    "role": p.role,
                    "description": p.description,
                    "model": p.model,
                    "toolsEnabled": p.tools_enabled,
                })
            })
            .collect();
        json!({"agents": agents})
    }

    fn cmd_set_project_root(&self, request: &Value) -> Result<Value, String> {
        let path = str_arg(request, "path").trim();
        if path.is_empty() {
            return Err("Empty path".to_string());
        }
        // The UI may hand over a tilde path; expand it before validation.
        let expanded = resolve_path(path);
        let resolved = self
            .sandbox
            .set_project_root(&expanded)
            .map_err(|e| e.to_string())?;
        let root = resolved.to_string_lossy().to_string();
        info!(root = %root, "project root set");
        Ok(json!({
            "projectRoot": root,
            "message": format!("Project opened: {}", root),
        }))
    }

    /// Direct tool invocation from the UI. Tool failures are forwarded as
    /// error payloads inside an `ok` envelope, matching in-loop behavior.
    fn run_tool(&self, action: FileAction, request: &Value) -> Value {
        let args: Map<String, Value> = request
            .as_object()
            .map(|obj| {
                obj.iter()
                    .filter(|(k, _)| *k != "id" && *k != "command")
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default();

        self.tools
            .dispatch(action, &args)
            .unwrap_or_else(|e| e.to_payload())
    }

    fn cmd_clear_history(&self, request: &Value) -> Value {
        let agent_id = request.get("agent_id").and_then(Value::as_str);
        self.history.clear(agent_id);
        let scope = agent_id.unwrap_or("all agents");
        json!({"message": format!("History cleared for {}", scope)})
    }

    async fn cmd_search(&self, request: &Value) -> Value {
        let query = str_arg(request, "query").trim();
        if query.is_empty() {
            return json!({"results": [], "message": "Empty query"});
        }
        let agent_id = str_arg(request, "agent_id");
        let owner = if agent_id.is_empty() { SHARED_OWNER } else { agent_id };

        let Some(memory) = &self.memory else {
            return json!({"results": [], "message": "Memory service not configured"});
        };
        match memory.search(query, owner, 5).await {
            Ok(hits) => json!({"results": hits, "query": query, "agentId": owner}),
            Err(e) => json!({"results": [], "message": format!("Search failed: {}", e)}),
        }
    }

    fn cmd_load_session(&self, request: &Value) -> Result<Value, String> {
        let session_id = str_arg(request, "session_id");
        if session_id.is_empty() {
            return Err("Missing session_id".to_string());
        }
        let messages = self.transcripts.load_session(session_id);
        Ok(json!({"sessionId": session_id, "messages": messages}))
    }

    fn cmd_new_session(&self) -> Value {
        let sid = self.transcripts.new_session();
        // A fresh session also resets the model's working context.
        self.history.clear(None);
        json!({"sessionId": sid, "message": "New session started"})
    }
}
