//! Error Taxonomy
//!
//! Every tool failure is data, not a fault: `ToolError` values are
//! serialized into the conversation so the model can self-correct.
//! `ModelError` covers the inference backend being unreachable or slow;
//! it ends a turn gracefully rather than propagating.

use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolError {
    /// The resolved path escapes every authorized root. Never suppressed,
    /// never retried; fatal to the single tool call only.
    #[error("sandbox violation: {0}")]
    SandboxViolation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported file type: {0}")]
    UnsupportedType(String),

    #[error("file too large ({size} bytes, max {max})")]
    TooLarge { size: u64, max: u64 },

    /// `old_string` must occur exactly once; 0 and >1 occurrences both land
    /// here so the model is forced to supply an unambiguous anchor.
    #[error("old_string occurs {0} times in the file (must occur exactly once; add more context)")]
    AmbiguousEdit(usize),

    #[error("invalid regex: {0}")]
    RegexError(String),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("missing argument '{0}'")]
    MissingArgument(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ToolError {
    /// Stable machine-readable tag included in the error payload.
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::SandboxViolation(_) => "sandbox_violation",
            ToolError::NotFound(_) => "not_found",
            ToolError::UnsupportedType(_) => "unsupported_type",
            ToolError::TooLarge { .. } => "too_large",
            ToolError::AmbiguousEdit(_) => "ambiguous_edit",
            ToolError::RegexError(_) => "regex_error",
            ToolError::UnknownAction(_) => "unknown_action",
            ToolError::MissingArgument(_) => "missing_argument",
            ToolError::Io(_) => "io_error",
        }
    }

    /// The structured form forwarded to the model verbatim.
    pub fn to_payload(&self) -> Value {
        json!({ "error": self.to_string(), "kind": self.kind() })
    }
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model backend unreachable: {0}")]
    Unavailable(String),

    #[error("model call timed out after {0:?}")]
    Timeout(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_carries_kind() {
        let err = ToolError::AmbiguousEdit(3);
        let payload = err.to_payload();
        assert_eq!(payload["kind"], "ambiguous_edit");
        assert!(payload["error"].as_str().unwrap().contains("3 times"));
    }

    #[test]
    fn test_sandbox_violation_distinct_from_not_found() {
        let violation = ToolError::SandboxViolation("../etc/passwd".into());
        let missing = ToolError::NotFound("src/lost.rs".into());
        assert_ne!(violation.kind(), missing.kind());
    }
}
