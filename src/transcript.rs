//! Session Transcripts
//!
//! Persists chat sessions as JSON documents under `~/.lithos/chats/`, one
//! file per session named by start time (`2026-08-29_14-30.json`). This is
//! the durable log shown in the UI, distinct from the bounded working
//! history the model sees.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

const SESSION_ID_FORMAT: &str = "%Y-%m-%d_%H-%M";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptMessage {
    /// "user" or "agent".
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub timestamp: i64,
    /// Extra UI payload (model name, iteration count).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct SessionDocument {
    session_id: String,
    messages: Vec<TranscriptMessage>,
    updated_at: i64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub message_count: usize,
    pub preview: String,
    pub updated_at: i64,
}

pub struct TranscriptStore {
    chats_dir: PathBuf,
    current: Mutex<Option<String>>,
}

impl TranscriptStore {
    pub fn new(chats_dir: impl Into<PathBuf>) -> Result<Self> {
        let chats_dir = chats_dir.into();
        fs::create_dir_all(&chats_dir).context("Failed to create chats directory")?;
        Ok(Self { chats_dir, current: Mutex::new(None) })
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.chats_dir.join(format!("{}.json", session_id))
    }

    fn fresh_session_id() -> String {
        Local::now().format(SESSION_ID_FORMAT).to_string()
    }

    pub fn current_session(&self) -> Option<String> {
        self.current.lock().expect("session lock poisoned").clone()
    }

    /// Start a new session and make it current.
    pub fn new_session(&self) -> String {
        let id = Self::fresh_session_id();
        *self.current.lock().expect("session lock poisoned") = Some(id.clone());
        id
    }

    fn ensure_session(&self) -> String {
        let mut current = self.current.lock().expect("session lock poisoned");
        current
            .get_or_insert_with(Self::fresh_session_id)
            .clone()
    }

    /// Append a message to a session (the current one when `session_id` is
    /// `None`), returning the session id used. Persistence failures are
    /// logged, never fatal to a turn.
    pub fn save_message(&self, session_id: Option<&str>, message: TranscriptMessage) -> String {
        let sid = match session_id {
            Some(id) => id.to_string(),
            None => self.ensure_session(),
        };
        let path = self.session_path(&sid);

        let mut doc = read_document(&path).unwrap_or_else(|| SessionDocument {
            session_id: sid.clone(),
            ..Default::default()
        });
        doc.messages.push(message);
        doc.updated_at = Utc::now().timestamp_millis();

        match serde_json::to_string_pretty(&doc) {
            Ok(json) => {
                if let Err(e) = fs::write(&path, json) {
                    warn!(session = %sid, error = %e, "transcript write failed");
                }
            }
            Err(e) => warn!(session = %sid, error = %e, "transcript serialize failed"),
        }

        sid
    }

    /// All messages of one session, empty when it does not exist.
    pub fn load_session(&self, session_id: &str) -> Vec<TranscriptMessage> {
        read_document(&self.session_path(session_id))
            .map(|doc| doc.messages)
            .unwrap_or_default()
    }

    /// Summaries of every stored session, newest first.
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let Ok(entries) = fs::read_dir(&self.chats_dir) else {
            return Vec::new();
        };

        let mut sessions: Vec<SessionSummary> = entries
            .flatten()
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
            .filter_map(|e| {
                let doc = read_document(&e.path())?;
                let session_id = e.path().file_stem()?.to_string_lossy().to_string();
                let preview = doc
                    .messages
                    .iter()
                    .find(|m| m.kind == "user")
                    .map(|m| m.content.chars().take(80).collect())
                    .unwrap_or_default();
                Some(SessionSummary {
                    session_id,
                    message_count: doc.messages.len(),
                    preview,
                    updated_at: doc.updated_at,
                })
            })
            .collect();

        sessions.sort_by(|a, b| b.session_id.cmp(&a.session_id));
        sessions
    }
}

fn read_document(path: &Path) -> Option<SessionDocument> {
    let contents = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&contents) {
        Ok(doc) => Some(doc),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "transcript unreadable");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn message(kind: &str, content: &str) -> TranscriptMessage {
        TranscriptMessage {
            kind: kind.to_string(),
            content: content.to_string(),
            agent_id: None,
            timestamp: 1_700_000_000_000,
            meta: None,
        }
    }

    #[test]
    fn test_save_creates_session_and_appends() {
        let dir = TempDir::new().unwrap();
        let store = TranscriptStore::new(dir.path()).unwrap();

        let sid = store.save_message(None, message("user", "first"));
        let same = store.save_message(None, message("agent", "second"));
        assert_eq!(sid, same);

        let messages = store.load_session(&sid);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "first");
        assert_eq!(messages[1].kind, "agent");
    }

    #[test]
    fn test_new_session_switches_current() {
        let dir = TempDir::new().unwrap();
        let store = TranscriptStore::new(dir.path()).unwrap();
        assert!(store.current_session().is_none());

        let sid = store.new_session();
        assert_eq!(store.current_session().as_deref(), Some(sid.as_str()));
    }

    #[test]
    fn test_explicit_session_id_respected() {
        let dir = TempDir::new().unwrap();
        let store = TranscriptStore::new(dir.path()).unwrap();

        let sid = store.save_message(Some("2026-01-01_09-00"), message("user", "hi"));
        assert_eq!(sid, "2026-01-01_09-00");
        assert_eq!(store.load_session("2026-01-01_09-00").len(), 1);
        // The current session pointer is untouched.
        assert!(store.current_session().is_none());
    }

    #[test]
    fn test_load_missing_session_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = TranscriptStore::new(dir.path()).unwrap();
        assert!(store.load_session("2020-01-01_00-00").is_empty());
    }

    #[test]
    fn test_list_sessions_newest_first_with_preview() {
        let dir = TempDir::new().unwrap();
        let store = TranscriptStore::new(dir.path()).unwrap();

        store.save_message(Some("2026-01-01_09-00"), message("user", "older session"));
        store.save_message(Some("2026-02-01_09-00"), message("agent", "no user yet"));
        store.save_message(Some("2026-02-01_09-00"), message("user", "newer session"));

        let sessions = store.list_sessions();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].session_id, "2026-02-01_09-00");
        assert_eq!(sessions[0].message_count, 2);
        assert_eq!(sessions[0].preview, "newer session");
        assert_eq!(sessions[1].preview, "older session");
    }

    #[test]
    fn test_corrupt_file_skipped() {
        let dir = TempDir::new().unwrap();
        let store = TranscriptStore::new(dir.path()).unwrap();
        fs::write(dir.path().join("2026-03-01_10-00.json"), "{broken").unwrap();
        store.save_message(Some("2026-03-02_10-00"), message("user", "fine"));

        let sessions = store.list_sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, "2026-03-02_10-00");
    }
}
