//! Tool-Call Extraction
//!
//! Pulls structured tool calls out of free-form model text. Two passes:
//! fenced ```json blocks first, then bare single-line JSON objects over
//! the remaining text. Anything that regex-matches but fails to parse as
//! JSON with an `action` key stays in the text as prose.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::types::ToolCallRequest;

fn fenced_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)```(?:json)?\s*\n(\{[^`]*?"action"\s*:\s*"[^"]+?"[^`]*?\})\s*\n```"#)
            .expect("fenced tool-call pattern")
    })
}

fn inline_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?m)^(\{"action"\s*:\s*"[^"]+?"[^\n]*\})\s*$"#)
            .expect("inline tool-call pattern")
    })
}

fn blank_run_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n{3,}").expect("blank-run pattern"))
}

fn think_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<think>.*?</think>").expect("think-block pattern"))
}

/// Remove reasoning `<think>...</think>` blocks emitted by some models.
pub fn strip_think_blocks(text: &str) -> String {
    think_regex().replace_all(text, "").trim().to_string()
}

fn parse_call(raw: &str) -> Option<(Value, ToolCallRequest)> {
    let value: Value = serde_json::from_str(raw).ok()?;
    let obj = value.as_object()?;
    let action = obj.get("action")?.as_str()?.to_string();
    let mut args = obj.clone();
    args.remove("action");
    Some((value, ToolCallRequest { action, args }))
}

/// Extract tool calls from `text`. Returns the residual text (calls removed,
/// blank runs collapsed, trimmed) and the calls in order of appearance.
/// Every fenced block yields a call; an inline line duplicating an already
/// extracted call (same JSON value) is skipped.
pub fn extract_tool_calls(text: &str) -> (String, Vec<ToolCallRequest>) {
    let mut calls: Vec<ToolCallRequest> = Vec::new();
    let mut seen: Vec<Value> = Vec::new();
    let mut clean = text.to_string();

    for caps in fenced_regex().captures_iter(text) {
        let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        let body = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        if let Some((value, call)) = parse_call(body) {
            if !seen.contains(&value) {
                seen.push(value);
            }
            calls.push(call);
            clean = clean.replace(whole, "");
        }
    }

    // Second pass runs over the already-cleaned text so fenced bodies are
    // not re-extracted as inline lines.
    let snapshot = clean.clone();
    for caps in inline_regex().captures_iter(&snapshot) {
        let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        let body = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        if let Some((value, call)) = parse_call(body) {
            if !seen.contains(&value) {
                seen.push(value);
                calls.push(call);
            }
            clean = clean.replace(whole, "");
        }
    }

    let clean = blank_run_regex().replace_all(&clean, "\n\n");
    (clean.trim().to_string(), calls)
}
