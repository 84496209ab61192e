//! Conversation History
//!
//! Bounded per-agent transcript of the working conversation. This is the
//! model's short-term context, not the persistent chat log; capacity
//! eviction drops the oldest turns silently.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::types::ChatTurn;

pub const DEFAULT_CAPACITY: usize = 20;

pub struct ConversationHistory {
    inner: Mutex<HashMap<String, VecDeque<ChatTurn>>>,
    capacity: usize,
}

impl ConversationHistory {
    pub fn new(capacity: usize) -> Self {
        Self { inner: Mutex::new(HashMap::new()), capacity }
    }

    /// Append one turn to an agent's transcript, evicting the oldest turn
    /// once the capacity is reached.
    pub fn append(&self, agent_id: &str, turn: ChatTurn) {
        let mut inner = self.inner.lock().expect("history lock poisoned");
        let turns = inner.entry(agent_id.to_string()).or_default();
        if turns.len() >= self.capacity {
            turns.pop_front();
        }
        turns.push_back(turn);
    }

    /// Point-in-time copy, oldest first. Turns appended after the snapshot
    /// is taken are not reflected in it.
    pub fn snapshot(&self, agent_id: &str) -> Vec<ChatTurn> {
        let inner = self.inner.lock().expect("history lock poisoned");
        inner
            .get(agent_id)
            .map(|turns| turns.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Clear one agent's transcript, or every transcript when `agent_id`
    /// is `None`.
    pub fn clear(&self, agent_id: Option<&str>) {
        let mut inner = self.inner.lock().expect("history lock poisoned");
        match agent_id {
            Some(id) => {
                inner.remove(id);
            }
            None => inner.clear(),
        }
    }
}

impl Default for ConversationHistory {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
