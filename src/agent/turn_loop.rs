//! The Agent Turn Loop
//!
//! One user message becomes one turn: recall memories, call the model,
//! extract tool calls, execute them, re-inject results, repeat until the
//! model stops asking or the iteration ceiling is reached. Turns are
//! strictly serialized by a process-wide lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::error::ToolError;
use crate::extract::{extract_tool_calls, strip_think_blocks};
use crate::history::ConversationHistory;
use crate::memory::{is_worth_sharing, SHARED_OWNER};
use crate::tools::{FileAction, FileToolSet};
use crate::types::{
    AgentProfile, ChatTurn, MemoryStore, ModelClient, ToolCallRequest, ToolCallResult, TurnOutcome,
};

use super::prompt::{build_system_prompt, format_memory_context, format_tool_results};

/// Memories recalled from the agent's own pool per turn.
const AGENT_RECALL_LIMIT: usize = 3;
/// Memories recalled from the shared pool per turn.
const SHARED_RECALL_LIMIT: usize = 2;
/// Results returned by the in-loop `search_memory` tool.
const TOOL_RECALL_LIMIT: usize = 5;

/// Text returned (and recorded) when the very first model call fails, so
/// the next turn's history still reads coherently.
const MODEL_DOWN_NOTICE: &str =
    "The model backend is not reachable right now, so I could not process that message.";

pub struct AgentLoopController {
    profiles: HashMap<String, AgentProfile>,
    history: Arc<ConversationHistory>,
    tools: Arc<FileToolSet>,
    model: Arc<dyn ModelClient>,
    memory: Option<Arc<dyn MemoryStore>>,
    /// Serializes turns process-wide. Held across the whole turn.
    turn_lock: tokio::sync::Mutex<()>,
    /// Background memory-store tasks, joined on shutdown.
    background: std::sync::Mutex<JoinSet<()>>,
    max_iterations: u32,
}

impl AgentLoopController {
    pub fn new(
        profiles: Vec<AgentProfile>,
        history: Arc<ConversationHistory>,
        tools: Arc<FileToolSet>,
        model: Arc<dyn ModelClient>,
        memory: Option<Arc<dyn MemoryStore>>,
        max_iterations: u32,
    ) -> Self {
        Self {
            profiles: profiles.into_iter().map(|p| (p.id.clone(), p)).collect(),
            history,
            tools,
            model,
            memory,
            turn_lock: tokio::sync::Mutex::new(()),
            background: std::sync::Mutex::new(JoinSet::new()),
            max_iterations,
        }
    }

    pub fn profiles(&self) -> Vec<&AgentProfile> {
        let mut profiles: Vec<&AgentProfile> = self.profiles.values().collect();
        profiles.sort_by(|a, b| a.id.cmp(&b.id));
        profiles
    }

    /// Run one full turn for `agent_id`. `on_fragment` enables streaming of
    /// the first model call; tool activity markers are also emitted through
    /// it. The cancel flag is reset once the turn lock is held, so a cancel
    /// aimed at a previous turn cannot leak into this one.
    pub async fn run_turn(
        &self,
        agent_id: &str,
        message: &str,
        cancel: &AtomicBool,
        on_fragment: Option<&(dyn Fn(&str) + Send + Sync)>,
    ) -> Result<TurnOutcome> {
        let Some(profile) = self.profiles.get(agent_id) else {
            bail!("unknown agent: {}", agent_id);
        };

        let _turn = self.turn_lock.lock().await;
        cancel.store(false, Ordering::SeqCst);

        info!(agent = agent_id, model = %profile.model, "turn start");

        // Memory recall degrades to empty context on any failure.
        let memories_used = self.recall_memories(message, agent_id).await;
        let memory_context = format_memory_context(&memories_used);

        let system_prompt = build_system_prompt(profile, &memory_context);
        let mut messages = vec![ChatTurn::system(system_prompt)];
        messages.extend(self.history.snapshot(agent_id));
        messages.push(ChatTurn::user(message));

        let timeout = Duration::from_secs(profile.timeout_secs);
        let mut parts: Vec<String> = Vec::new();
        let mut iteration: u32 = 0;
        let mut cancelled = false;

        while iteration < self.max_iterations {
            iteration += 1;

            if cancel.load(Ordering::SeqCst) {
                cancelled = true;
                break;
            }

            // Stream only the first call; follow-up calls after tool
            // execution are buffered so tool syntax never reaches the UI.
            let response = if iteration == 1 && on_fragment.is_some() {
                let emit = on_fragment.unwrap();
                match self
                    .model
                    .complete_streaming(
                        &profile.model,
                        &messages,
                        timeout,
                        profile.context_window,
                        cancel,
                        emit,
                    )
                    .await
                {
                    Ok(outcome) if outcome.cancelled => {
                        let partial = strip_think_blocks(&outcome.text);
                        if !partial.is_empty() {
                            parts.push(partial);
                        }
                        cancelled = true;
                        break;
                    }
                    Ok(outcome) => Ok(outcome.text),
                    Err(e) => Err(e),
                }
            } else {
                self.model
                    .complete(&profile.model, &messages, timeout, profile.context_window)
                    .await
            };

            let response = match response {
                Ok(text) => text,
                Err(e) => {
                    warn!(agent = agent_id, error = %e, "model call failed");
                    if parts.is_empty() {
                        parts.push(MODEL_DOWN_NOTICE.to_string());
                    }
                    break;
                }
            };

            let clean = strip_think_blocks(&response);

            if !profile.tools_enabled {
                parts.push(clean);
                break;
            }

            let (residual, calls) = extract_tool_calls(&clean);
            if !residual.is_empty() {
                parts.push(residual);
            }
            if calls.is_empty() {
                break;
            }

            messages.push(ChatTurn::assistant(clean));

            let mut results = Vec::with_capacity(calls.len());
            for call in &calls {
                if let Some(emit) = on_fragment {
                    emit(&format!("\n`[tool: {}]`\n", call.action));
                }
                let result = self.execute_call(call, agent_id).await;
                if let Some(emit) = on_fragment {
                    emit(&format!("\n`-> {}`\n", result_preview(&result.result)));
                }
                results.push(result);
            }

            messages.push(ChatTurn::user(format_tool_results(&results)));
        }

        let response_text = parts
            .iter()
            .filter(|p| !p.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join("\n\n");

        // A cancelled turn with nothing produced leaves no trace in history.
        if !cancelled || !response_text.is_empty() {
            self.history.append(agent_id, ChatTurn::user(message));
            if !response_text.is_empty() {
                self.history
                    .append(agent_id, ChatTurn::assistant(response_text.clone()));
            }
        }

        if !cancelled && !response_text.is_empty() {
            self.store_exchange(agent_id, message, &response_text);
        }

        info!(agent = agent_id, iterations = iteration, cancelled, "turn complete");

        Ok(TurnOutcome {
            agent_id: agent_id.to_string(),
            response: response_text,
            model: profile.model.clone(),
            iterations: iteration,
            cancelled,
            memories_used: memories_used.len(),
        })
    }

    /// Recall from the agent's own pool first, then top up from the shared
    /// pool, deduplicating on text.
    async fn recall_memories(&self, message: &str, agent_id: &str) -> Vec<String> {
        let Some(memory) = &self.memory else {
            return Vec::new();
        };

        let mut texts: Vec<String> = Vec::new();

        match memory.search(message, agent_id, AGENT_RECALL_LIMIT).await {
            Ok(hits) => texts.extend(hits.into_iter().map(|h| h.text)),
            Err(e) => warn!(agent = agent_id, error = %e, "agent memory search failed"),
        }

        if agent_id != SHARED_OWNER {
            match memory.search(message, SHARED_OWNER, SHARED_RECALL_LIMIT).await {
                Ok(hits) => {
                    for hit in hits {
                        if !texts.contains(&hit.text) {
                            texts.push(hit.text);
                        }
                    }
                }
                Err(e) => warn!(error = %e, "shared memory search failed"),
            }
        }

        texts
    }

    /// Execute one extracted call: filesystem actions go through the tool
    /// set, memory actions through the memory store. Failures become error
    /// payloads, never turn failures.
    async fn execute_call(&self, call: &ToolCallRequest, agent_id: &str) -> ToolCallResult {
        let result = match call.action.as_str() {
            "search_memory" => self.tool_search_memory(&call.args, agent_id).await,
            "save_memory" => self.tool_save_memory(&call.args, agent_id).await,
            "system_info" => crate::tools::system_info(),
            other => match FileAction::parse(other) {
                Some(action) => self
                    .tools
                    .dispatch(action, &call.args)
                    .unwrap_or_else(|e| e.to_payload()),
                None => ToolError::UnknownAction(other.to_string()).to_payload(),
            },
        };

        ToolCallResult { action: call.action.clone(), result }
    }

    async fn tool_search_memory(&self, args: &serde_json::Map<String, Value>, agent_id: &str) -> Value {
        let Some(memory) = &self.memory else {
            return json!({"error": "memory service not configured", "kind": "memory_unavailable"});
        };
        let query = args.get("query").and_then(Value::as_str).unwrap_or_default();
        if query.is_empty() {
            return ToolError::MissingArgument("query").to_payload();
        }
        match memory.search(query, agent_id, TOOL_RECALL_LIMIT).await {
            Ok(hits) => {
                let texts: Vec<String> = hits.into_iter().map(|h| h.text).collect();
                json!({"results": texts, "count": texts.len()})
            }
            Err(e) => json!({"error": e.to_string(), "kind": "memory_unavailable"}),
        }
    }

    async fn tool_save_memory(&self, args: &serde_json::Map<String, Value>, agent_id: &str) -> Value {
        let Some(memory) = &self.memory else {
            return json!({"error": "memory service not configured", "kind": "memory_unavailable"});
        };
        let content = args.get("content").and_then(Value::as_str).unwrap_or_default();
        if content.is_empty() {
            return ToolError::MissingArgument("content").to_payload();
        }
        let metadata = json!({"type": "agent_learned", "agentId": agent_id});
        match memory.store(content, agent_id, metadata).await {
            Ok(()) => json!({"message": "memory saved"}),
            Err(e) => json!({"error": e.to_string(), "kind": "memory_unavailable"}),
        }
    }

    /// Store the finished exchange in the background. The turn's latency is
    /// never extended by memory writes; tasks are tracked and joined on
    /// shutdown.
    fn store_exchange(&self, agent_id: &str, message: &str, response: &str) {
        let Some(memory) = &self.memory else {
            return;
        };
        let memory = Arc::clone(memory);
        let agent_id = agent_id.to_string();
        let message = message.to_string();
        let response = response.to_string();

        let mut background = self.background.lock().expect("background lock poisoned");
        background.spawn(async move {
            let timestamp = Utc::now().timestamp();
            let metadata = json!({
                "type": "conversation",
                "agentId": agent_id,
                "timestamp": timestamp,
            });

            let exchange = format!("User: {}\nAssistant: {}", message, response);
            if let Err(e) = memory.store(&exchange, &agent_id, metadata.clone()).await {
                warn!(agent = %agent_id, error = %e, "conversation store failed");
            }

            // Only substantive user messages reach the cross-agent pool.
            if is_worth_sharing(&message) {
                let entry = format!("User: {}", message);
                if let Err(e) = memory.store(&entry, SHARED_OWNER, metadata).await {
                    warn!(error = %e, "shared store failed");
                }
            }
        });
    }

    /// Wait for pending background stores, up to `grace`. Tasks still
    /// running after the deadline are dropped.
    pub async fn shutdown(&self, grace: Duration) {
        let mut background = {
            let mut guard = self.background.lock().expect("background lock poisoned");
            std::mem::take(&mut *guard)
        };
        if background.is_empty() {
            return;
        }
        info!(pending = background.len(), "draining background memory stores");
        let _ = tokio::time::timeout(grace, async {
            while background.join_next().await.is_some() {}
        })
        .await;
    }
}

/// Compact single-line preview of a tool result for streaming markers.
fn result_preview(result: &Value) -> String {
    let raw = result.to_string();
    if raw.chars().count() > 300 {
        let truncated: String = raw.chars().take(300).collect();
        format!("{}...", truncated)
    } else {
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::fs;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use crate::error::ModelError;
    use crate::sandbox::SandboxPolicy;
    use crate::types::{MemoryHit, StreamOutcome};

    // --- Scripted collaborators ---

    struct ScriptedModel {
        responses: Mutex<VecDeque<Result<String, ModelError>>>,
        requests: Mutex<Vec<Vec<ChatTurn>>>,
        /// When set, streaming calls report cancellation after emitting.
        cancel_stream: bool,
    }

    impl ScriptedModel {
        fn new(responses: Vec<Result<String, ModelError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
                cancel_stream: false,
            }
        }

        fn next(&self, messages: &[ChatTurn]) -> Result<String, ModelError> {
            self.requests.lock().unwrap().push(messages.to_vec());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ModelError::Unavailable("script exhausted".into())))
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedModel {
        async fn complete(
            &self,
            _model: &str,
            messages: &[ChatTurn],
            _timeout: Duration,
            _context_window: u32,
        ) -> Result<String, ModelError> {
            self.next(messages)
        }

        async fn complete_streaming(
            &self,
            _model: &str,
            messages: &[ChatTurn],
            _timeout: Duration,
            _context_window: u32,
            _cancel: &AtomicBool,
            on_fragment: &(dyn for<'a> Fn(&'a str) + Send + Sync),
        ) -> Result<StreamOutcome, ModelError> {
            let text = self.next(messages)?;
            on_fragment(&text);
            Ok(StreamOutcome { text, cancelled: self.cancel_stream })
        }
    }

    struct RecordingMemory {
        hits: Mutex<HashMap<String, Vec<MemoryHit>>>,
        stored: Mutex<Vec<(String, String)>>,
        fail_search: bool,
    }

    impl RecordingMemory {
        fn new() -> Self {
            Self {
                hits: Mutex::new(HashMap::new()),
                stored: Mutex::new(Vec::new()),
                fail_search: false,
            }
        }

        fn with_hits(owner: &str, texts: &[&str]) -> Self {
            let store = Self::new();
            store.hits.lock().unwrap().insert(
                owner.to_string(),
                texts
                    .iter()
                    .map(|t| MemoryHit { text: t.to_string(), score: None, metadata: None })
                    .collect(),
            );
            store
        }

        fn add_hits(&self, owner: &str, texts: &[&str]) {
            self.hits.lock().unwrap().insert(
                owner.to_string(),
                texts
                    .iter()
                    .map(|t| MemoryHit { text: t.to_string(), score: None, metadata: None })
                    .collect(),
            );
        }
    }

    #[async_trait]
    impl MemoryStore for RecordingMemory {
        async fn store(&self, text: &str, owner: &str, _metadata: Value) -> Result<()> {
            self.stored
                .lock()
                .unwrap()
                .push((owner.to_string(), text.to_string()));
            Ok(())
        }

        async fn search(&self, _query: &str, owner: &str, limit: usize) -> Result<Vec<MemoryHit>> {
            if self.fail_search {
                bail!("memory down");
            }
            let hits = self.hits.lock().unwrap();
            Ok(hits
                .get(owner)
                .map(|v| v.iter().take(limit).cloned().collect())
                .unwrap_or_default())
        }
    }

    // --- Fixture ---

    struct Fixture {
        _home: TempDir,
        _project: TempDir,
        project_path: std::path::PathBuf,
        controller: AgentLoopController,
        cancel: AtomicBool,
    }

    fn profile(id: &str, tools: bool) -> AgentProfile {
        AgentProfile {
            id: id.to_string(),
            role: "test".to_string(),
            description: "A test agent.".to_string(),
            model: "test-model".to_string(),
            timeout_secs: 5,
            context_window: 2048,
            tools_enabled: tools,
        }
    }

    fn fixture(
        model: Arc<dyn ModelClient>,
        memory: Option<Arc<dyn MemoryStore>>,
        max_iterations: u32,
    ) -> Fixture {
        let home = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        let sandbox = SandboxPolicy::new(home.path()).unwrap();
        sandbox
            .set_project_root(project.path().to_str().unwrap())
            .unwrap();
        let project_path = project.path().canonicalize().unwrap();

        let controller = AgentLoopController::new(
            vec![profile("atlas", true), profile("scribe", false)],
            Arc::new(ConversationHistory::default()),
            Arc::new(FileToolSet::new(Arc::new(sandbox))),
            model,
            memory,
            max_iterations,
        );

        Fixture {
            _home: home,
            _project: project,
            project_path,
            controller,
            cancel: AtomicBool::new(false),
        }
    }

    fn read_call(path: &str) -> String {
        format!("```json\n{{\"action\": \"read_file\", \"path\": \"{}\"}}\n```", path)
    }

    // --- Tests ---

    #[tokio::test]
    async fn test_plain_answer_single_iteration() {
        let model = Arc::new(ScriptedModel::new(vec![Ok("Just an answer.".to_string())]));
        let fx = fixture(model.clone(), None, 10);

        let outcome = fx
            .controller
            .run_turn("atlas", "hello", &fx.cancel, None)
            .await
            .unwrap();

        assert_eq!(outcome.response, "Just an answer.");
        assert_eq!(outcome.iterations, 1);
        assert!(!outcome.cancelled);
        assert_eq!(model.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_no_tools_agent_never_executes() {
        let response = format!("I would do this:\n{}", read_call("a.txt"));
        let model = Arc::new(ScriptedModel::new(vec![Ok(response.clone())]));
        let fx = fixture(model.clone(), None, 10);

        let outcome = fx
            .controller
            .run_turn("scribe", "read a.txt", &fx.cancel, None)
            .await
            .unwrap();

        // Tool syntax is returned verbatim, not extracted.
        assert!(outcome.response.contains("read_file"));
        assert_eq!(outcome.iterations, 1);
        assert_eq!(model.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_tool_call_executes_and_reinjects() {
        let model = Arc::new(ScriptedModel::new(vec![
            Ok(format!("Checking the file.\n{}", read_call("notes.txt"))),
            Ok("The file says: secret marker".to_string()),
        ]));
        let fx = fixture(model.clone(), None, 10);
        fs::write(fx.project_path.join("notes.txt"), "secret marker\n").unwrap();

        let outcome = fx
            .controller
            .run_turn("atlas", "what's in notes.txt?", &fx.cancel, None)
            .await
            .unwrap();

        assert_eq!(outcome.iterations, 2);
        assert_eq!(
            outcome.response,
            "Checking the file.\n\nThe file says: secret marker"
        );

        // The second request carries the tool result as a user turn.
        let requests = model.requests.lock().unwrap();
        let second = &requests[1];
        let last = second.last().unwrap();
        assert_eq!(last.role, crate::types::ChatRole::User);
        assert!(last.content.starts_with("[TOOL RESULTS"));
        assert!(last.content.contains("secret marker"));
    }

    #[tokio::test]
    async fn test_iteration_ceiling() {
        let responses: Vec<Result<String, ModelError>> =
            (0..20).map(|_| Ok(read_call("missing.txt"))).collect();
        let model = Arc::new(ScriptedModel::new(responses));
        let fx = fixture(model.clone(), None, 10);

        let outcome = fx
            .controller
            .run_turn("atlas", "loop forever", &fx.cancel, None)
            .await
            .unwrap();

        assert_eq!(outcome.iterations, 10);
        assert_eq!(model.requests.lock().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_tool_error_forwarded_not_fatal() {
        let model = Arc::new(ScriptedModel::new(vec![
            Ok(read_call("does_not_exist.txt")),
            Ok("It is not there.".to_string()),
        ]));
        let fx = fixture(model.clone(), None, 10);

        let outcome = fx
            .controller
            .run_turn("atlas", "read it", &fx.cancel, None)
            .await
            .unwrap();

        assert_eq!(outcome.response, "It is not there.");
        let requests = model.requests.lock().unwrap();
        let reinjected = &requests[1].last().unwrap().content;
        assert!(reinjected.contains("not_found"));
    }

    #[tokio::test]
    async fn test_unknown_action_payload() {
        let model = Arc::new(ScriptedModel::new(vec![
            Ok("{\"action\": \"explode\"}".to_string()),
            Ok("Sorry.".to_string()),
        ]));
        let fx = fixture(model.clone(), None, 10);

        fx.controller
            .run_turn("atlas", "boom", &fx.cancel, None)
            .await
            .unwrap();

        let requests = model.requests.lock().unwrap();
        let reinjected = &requests[1].last().unwrap().content;
        assert!(reinjected.contains("unknown_action"));
    }

    #[tokio::test]
    async fn test_system_info_reachable_from_loop() {
        let model = Arc::new(ScriptedModel::new(vec![
            Ok("{\"action\": \"system_info\"}".to_string()),
            Ok("The machine looks healthy.".to_string()),
        ]));
        let fx = fixture(model.clone(), None, 10);

        let outcome = fx
            .controller
            .run_turn("atlas", "what is running?", &fx.cancel, None)
            .await
            .unwrap();

        assert_eq!(outcome.response, "The machine looks healthy.");
        let requests = model.requests.lock().unwrap();
        let reinjected = &requests[1].last().unwrap().content;
        assert!(reinjected.contains("Result of system_info:"));
        assert!(reinjected.contains("totalProcesses"));
    }

    #[tokio::test]
    async fn test_model_unavailable_first_call() {
        let model = Arc::new(ScriptedModel::new(vec![Err(ModelError::Unavailable(
            "connection refused".into(),
        ))]));
        let fx = fixture(model, None, 10);

        let outcome = fx
            .controller
            .run_turn("atlas", "hello?", &fx.cancel, None)
            .await
            .unwrap();

        assert_eq!(outcome.response, MODEL_DOWN_NOTICE);
        assert!(!outcome.cancelled);

        // History records both turns so the next turn stays coherent.
        let turns = fx.controller.history.snapshot("atlas");
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].content, MODEL_DOWN_NOTICE);
    }

    #[tokio::test]
    async fn test_think_blocks_stripped() {
        let model = Arc::new(ScriptedModel::new(vec![Ok(
            "<think>hmm, tricky</think>The answer is 4.".to_string(),
        )]));
        let fx = fixture(model, None, 10);

        let outcome = fx
            .controller
            .run_turn("atlas", "2+2?", &fx.cancel, None)
            .await
            .unwrap();

        assert_eq!(outcome.response, "The answer is 4.");
    }

    #[tokio::test]
    async fn test_cancelled_mid_stream_keeps_partial() {
        let mut model = ScriptedModel::new(vec![Ok("partial answer".to_string())]);
        model.cancel_stream = true;
        let fx = fixture(Arc::new(model), None, 10);

        let fragments = Mutex::new(Vec::<String>::new());
        let emit = |s: &str| fragments.lock().unwrap().push(s.to_string());

        let outcome = fx
            .controller
            .run_turn("atlas", "tell me a story", &fx.cancel, Some(&emit))
            .await
            .unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.response, "partial answer");

        let turns = fx.controller.history.snapshot("atlas");
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].content, "partial answer");
    }

    #[tokio::test]
    async fn test_cancelled_with_nothing_leaves_no_trace() {
        let mut model = ScriptedModel::new(vec![Ok(String::new())]);
        model.cancel_stream = true;
        let memory = Arc::new(RecordingMemory::new());
        let fx = fixture(Arc::new(model), Some(memory.clone()), 10);

        let emit = |_: &str| {};
        let outcome = fx
            .controller
            .run_turn("atlas", "never mind", &fx.cancel, Some(&emit))
            .await
            .unwrap();

        assert!(outcome.cancelled);
        assert!(outcome.response.is_empty());
        assert!(fx.controller.history.snapshot("atlas").is_empty());

        fx.controller.shutdown(Duration::from_secs(1)).await;
        assert!(memory.stored.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_recall_dedupes_shared() {
        let memory = RecordingMemory::with_hits("atlas", &["fact a", "fact b", "fact c"]);
        memory.add_hits(SHARED_OWNER, &["fact a", "fact d"]);
        let model = Arc::new(ScriptedModel::new(vec![Ok("ok".to_string())]));
        let fx = fixture(model.clone(), Some(Arc::new(memory)), 10);

        let outcome = fx
            .controller
            .run_turn("atlas", "what do you know?", &fx.cancel, None)
            .await
            .unwrap();

        // 3 agent hits + 2 shared, one duplicate.
        assert_eq!(outcome.memories_used, 4);
        let requests = model.requests.lock().unwrap();
        let system = &requests[0][0].content;
        assert!(system.contains("  - fact a"));
        assert!(system.contains("  - fact d"));
    }

    #[tokio::test]
    async fn test_memory_failure_degrades() {
        let mut memory = RecordingMemory::new();
        memory.fail_search = true;
        let model = Arc::new(ScriptedModel::new(vec![Ok("still fine".to_string())]));
        let fx = fixture(model.clone(), Some(Arc::new(memory)), 10);

        let outcome = fx
            .controller
            .run_turn("atlas", "anything stored?", &fx.cancel, None)
            .await
            .unwrap();

        assert_eq!(outcome.response, "still fine");
        assert_eq!(outcome.memories_used, 0);
        let requests = model.requests.lock().unwrap();
        assert!(requests[0][0].content.contains("No relevant memories found."));
    }

    #[tokio::test]
    async fn test_exchange_stored_with_shared_gating() {
        let memory = Arc::new(RecordingMemory::new());
        let model = Arc::new(ScriptedModel::new(vec![Ok("noted".to_string())]));
        let fx = fixture(model, Some(memory.clone()), 10);

        let message =
            "I always deploy the staging environment from the release branch, never from main";
        fx.controller
            .run_turn("atlas", message, &fx.cancel, None)
            .await
            .unwrap();
        fx.controller.shutdown(Duration::from_secs(2)).await;

        let stored = memory.stored.lock().unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].0, "atlas");
        assert!(stored[0].1.contains("User: I always deploy"));
        assert!(stored[0].1.contains("Assistant: noted"));
        assert_eq!(stored[1].0, SHARED_OWNER);
    }

    #[tokio::test]
    async fn test_trivial_exchange_not_shared() {
        let memory = Arc::new(RecordingMemory::new());
        let model = Arc::new(ScriptedModel::new(vec![Ok("hi!".to_string())]));
        let fx = fixture(model, Some(memory.clone()), 10);

        fx.controller
            .run_turn("atlas", "hello", &fx.cancel, None)
            .await
            .unwrap();
        fx.controller.shutdown(Duration::from_secs(2)).await;

        let stored = memory.stored.lock().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].0, "atlas");
    }

    #[tokio::test]
    async fn test_save_memory_tool() {
        let memory = Arc::new(RecordingMemory::new());
        let model = Arc::new(ScriptedModel::new(vec![
            Ok("{\"action\": \"save_memory\", \"content\": \"user runs NixOS\"}".to_string()),
            Ok("Saved.".to_string()),
        ]));
        let fx = fixture(model.clone(), Some(memory.clone()), 10);

        fx.controller
            .run_turn("atlas", "remember that I run NixOS", &fx.cancel, None)
            .await
            .unwrap();

        let stored = memory.stored.lock().unwrap();
        assert!(stored.iter().any(|(owner, text)| owner == "atlas" && text == "user runs NixOS"));
        let requests = model.requests.lock().unwrap();
        assert!(requests[1].last().unwrap().content.contains("memory saved"));
    }

    #[tokio::test]
    async fn test_unknown_agent_rejected() {
        let model = Arc::new(ScriptedModel::new(vec![]));
        let fx = fixture(model, None, 10);
        let err = fx
            .controller
            .run_turn("nobody", "hi", &fx.cancel, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown agent"));
    }

    #[tokio::test]
    async fn test_cancel_flag_reset_at_turn_start() {
        let model = Arc::new(ScriptedModel::new(vec![Ok("fresh".to_string())]));
        let fx = fixture(model, None, 10);
        // A stale cancel from a previous turn must not cancel this one.
        fx.cancel.store(true, Ordering::SeqCst);

        let outcome = fx
            .controller
            .run_turn("atlas", "hi", &fx.cancel, None)
            .await
            .unwrap();

        assert!(!outcome.cancelled);
        assert_eq!(outcome.response, "fresh");
    }
}
