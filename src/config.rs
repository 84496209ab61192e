//! Backend Configuration
//!
//! Loads the backend configuration from `~/.lithos/config.json`, merging
//! missing fields with built-in defaults. Absence of the file is normal;
//! the defaults alone are a working setup.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::history::DEFAULT_CAPACITY;
use crate::types::AgentProfile;

const CONFIG_FILENAME: &str = "config.json";

pub const DEFAULT_MODEL_URL: &str = "http://127.0.0.1:11434";
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendConfig {
    /// Base URL of the Ollama-compatible inference backend.
    pub model_url: String,
    /// Base URL of the memory service; `None` disables memory entirely.
    pub memory_url: Option<String>,
    /// Turns kept per agent in working history.
    pub history_capacity: usize,
    /// Ceiling on model calls per agent turn.
    pub max_iterations: u32,
    pub agents: Vec<AgentProfile>,
}

/// The built-in agent roster, used when the config file defines none.
pub fn default_profiles() -> Vec<AgentProfile> {
    vec![
        AgentProfile {
            id: "atlas".to_string(),
            role: "generalist".to_string(),
            description: "Conversation, planning, and questions about the system. The default destination when no specialist fits.".to_string(),
            model: "qwen3:8b".to_string(),
            timeout_secs: 120,
            context_window: 8192,
            tools_enabled: true,
        },
        AgentProfile {
            id: "forge".to_string(),
            role: "code specialist".to_string(),
            description: "Writing, debugging, and reviewing code. Explores the project tree before answering.".to_string(),
            model: "qwen2.5-coder:14b".to_string(),
            timeout_secs: 600,
            context_window: 32768,
            tools_enabled: true,
        },
        AgentProfile {
            id: "scribe".to_string(),
            role: "writing assistant".to_string(),
            description: "Prose, documentation, and summaries. Works from the conversation only.".to_string(),
            model: "llama3.1:8b".to_string(),
            timeout_secs: 60,
            context_window: 4096,
            tools_enabled: false,
        },
    ]
}

pub fn default_config() -> BackendConfig {
    BackendConfig {
        model_url: DEFAULT_MODEL_URL.to_string(),
        memory_url: None,
        history_capacity: DEFAULT_CAPACITY,
        max_iterations: DEFAULT_MAX_ITERATIONS,
        agents: default_profiles(),
    }
}

/// Returns the backend's application directory: `~/.lithos`.
pub fn get_app_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/root"))
        .join(".lithos")
}

pub fn get_config_path() -> PathBuf {
    get_app_dir().join(CONFIG_FILENAME)
}

/// Load the config from disk, merging unset fields with defaults. A missing
/// or unparseable file yields the defaults.
pub fn load_config() -> BackendConfig {
    let path = get_config_path();
    let Ok(contents) = fs::read_to_string(&path) else {
        return default_config();
    };
    let Ok(config) = serde_json::from_str::<BackendConfig>(&contents) else {
        tracing::warn!(path = %path.display(), "config file unparseable, using defaults");
        return default_config();
    };
    merge_defaults(config)
}

fn merge_defaults(mut config: BackendConfig) -> BackendConfig {
    let defaults = default_config();

    if config.model_url.is_empty() {
        config.model_url = defaults.model_url;
    }
    if config.history_capacity == 0 {
        config.history_capacity = defaults.history_capacity;
    }
    if config.max_iterations == 0 {
        config.max_iterations = defaults.max_iterations;
    }
    if config.agents.is_empty() {
        config.agents = defaults.agents;
    }

    config
}

/// Save the config to `~/.lithos/config.json`, creating the directory if
/// needed.
pub fn save_config(config: &BackendConfig) -> Result<()> {
    let dir = get_app_dir();
    if !dir.exists() {
        fs::create_dir_all(&dir).context("Failed to create application directory")?;
    }

    let json = serde_json::to_string_pretty(config).context("Failed to serialize config")?;
    fs::write(get_config_path(), json).context("Failed to write config file")?;

    Ok(())
}

/// Resolve a path that may start with `~` to an absolute path.
pub fn resolve_path(p: &str) -> String {
    if let Some(rest) = p.strip_prefix('~') {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root"));
        let rest = rest.strip_prefix('/').unwrap_or(rest);
        home.join(rest).to_string_lossy().to_string()
    } else {
        p.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_usable() {
        let config = default_config();
        assert_eq!(config.model_url, DEFAULT_MODEL_URL);
        assert_eq!(config.max_iterations, 10);
        assert_eq!(config.history_capacity, 20);
        assert_eq!(config.agents.len(), 3);
        assert!(config.memory_url.is_none());
    }

    #[test]
    fn test_profiles_have_distinct_ids() {
        let profiles = default_profiles();
        let mut ids: Vec<&str> = profiles.iter().map(|p| p.id.as_str()).collect();
        ids.dedup();
        assert_eq!(ids.len(), profiles.len());
    }

    #[test]
    fn test_scribe_has_no_tools() {
        let profiles = default_profiles();
        let scribe = profiles.iter().find(|p| p.id == "scribe").unwrap();
        assert!(!scribe.tools_enabled);
    }

    #[test]
    fn test_merge_fills_empty_fields() {
        let partial: BackendConfig =
            serde_json::from_str(r#"{"memoryUrl": "http://127.0.0.1:8230"}"#).unwrap();
        let merged = merge_defaults(partial);
        assert_eq!(merged.model_url, DEFAULT_MODEL_URL);
        assert_eq!(merged.memory_url.as_deref(), Some("http://127.0.0.1:8230"));
        assert_eq!(merged.agents.len(), 3);
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let previous = fs::read_to_string(get_config_path()).ok();

        let mut config = default_config();
        config.model_url = "http://127.0.0.1:11500".to_string();
        save_config(&config).unwrap();
        let loaded = load_config();
        assert_eq!(loaded.model_url, "http://127.0.0.1:11500");
        assert_eq!(loaded.agents.len(), 3);

        match previous {
            Some(contents) => fs::write(get_config_path(), contents).unwrap(),
            None => fs::remove_file(get_config_path()).unwrap(),
        }
    }

    #[test]
    fn test_resolve_path_with_tilde() {
        let resolved = resolve_path("~/some/path");
        assert!(!resolved.starts_with('~'));
        assert!(resolved.ends_with("some/path"));
    }

    #[test]
    fn test_resolve_path_without_tilde() {
        let path = "/absolute/path/to/file";
        assert_eq!(resolve_path(path), path);
    }
}
