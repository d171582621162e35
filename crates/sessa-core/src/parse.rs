//! Record parser: one raw log line in, one [`Event`] or [`ParseFailure`] out.
//!
//! Pure: no I/O, no clock. The same [`RawEntry`] always yields the same
//! result, which is what makes `ingest --force` re-derivation safe.

use serde_json::{json, Value};

use crate::ts::normalize_ts;
use crate::types::{Event, EventKind, RawEntry};

/// A line that could not be projected into an Event. Never fatal to a batch.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("unparsable entry {uuid}: {reason}")]
pub struct ParseFailure {
    pub uuid: String,
    pub line: String,
    pub reason: String,
}

impl ParseFailure {
    fn new(raw: &RawEntry, reason: impl Into<String>) -> Self {
        Self {
            uuid: raw.uuid.clone(),
            line: raw.raw_text.clone(),
            reason: reason.into(),
        }
    }
}

/// Parse a stored or freshly read entry into its Event.
pub fn parse_entry(raw: &RawEntry) -> Result<Event, ParseFailure> {
    let value: Value = serde_json::from_str(&raw.raw_text)
        .map_err(|e| ParseFailure::new(raw, format!("invalid JSON: {e}")))?;
    if !value.is_object() {
        return Err(ParseFailure::new(raw, "record is not a JSON object"));
    }

    let mut timestamp_inferred = false;
    let timestamp = match value.get("timestamp") {
        None | Some(Value::Null) => {
            timestamp_inferred = true;
            raw.observed_at.clone()
        }
        Some(Value::String(s)) => normalize_ts(s)
            .ok_or_else(|| ParseFailure::new(raw, format!("unparsable timestamp {s:?}")))?,
        Some(other) => {
            return Err(ParseFailure::new(
                raw,
                format!("timestamp is not a string: {other}"),
            ))
        }
    };

    let record_type = value
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    let message = value.get("message");
    let blocks = content_blocks(message);

    let tool_uses: Vec<&Value> = blocks
        .iter()
        .copied()
        .filter(|b| block_type(b) == Some("tool_use"))
        .collect();
    let has_tool_result = blocks
        .iter()
        .any(|b| block_type(b) == Some("tool_result"));

    let kind = match record_type {
        "assistant" if !tool_uses.is_empty() => EventKind::ToolCall,
        "assistant" => EventKind::AssistantMessage,
        "user" if has_tool_result => EventKind::ToolResult,
        "user" => EventKind::UserMessage,
        "system" => EventKind::System,
        "summary" => EventKind::Summary,
        _ => EventKind::Unknown,
    };

    let tool_names: Vec<&str> = tool_uses
        .iter()
        .filter_map(|b| b.get("name").and_then(|v| v.as_str()))
        .collect();
    let tool_use_ids: Vec<&str> = tool_uses
        .iter()
        .filter_map(|b| b.get("id").and_then(|v| v.as_str()))
        .collect();
    let tool_name = tool_names.first().map(|s| s.to_string());

    let bash = tool_uses.iter().find_map(|b| bash_command(b));
    let (command, command_args) = match bash {
        Some((cmd, args)) => (Some(cmd), Some(args)),
        None => (None, None),
    };

    let usage = message.and_then(|m| m.get("usage"));
    let token = |key: &str| -> u64 {
        usage
            .and_then(|u| u.get(key))
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    };

    let session_id = Some(get_str(&value, "session_id"))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| raw.session_id.clone());

    let mut payload = json!({
        "type": record_type,
        "subtype": value.get("subtype").and_then(|v| v.as_str()),
        "parent_uuid": value.get("parentUuid").and_then(|v| v.as_str()),
        "is_sidechain": value.get("isSidechain").and_then(|v| v.as_bool()).unwrap_or(false),
        "tool_names": tool_names,
        "tool_use_ids": tool_use_ids,
        "command_args": command_args,
    });
    if timestamp_inferred {
        payload["timestamp_inferred"] = Value::Bool(true);
    }

    Ok(Event {
        uuid: raw.uuid.clone(),
        session_id,
        project_path: raw.project_path.clone(),
        kind,
        timestamp,
        tool_name,
        command,
        model: message
            .and_then(|m| m.get("model"))
            .and_then(|v| v.as_str())
            .map(str::to_string),
        input_tokens: token("input_tokens"),
        output_tokens: token("output_tokens"),
        cache_read_tokens: token("cache_read_input_tokens"),
        git_branch: non_empty(get_str(&value, "git_branch")),
        cwd: non_empty(get_str(&value, "cwd")),
        payload,
    })
}

/// Base command of the first `Bash` tool call in a raw line, if any.
pub fn extract_command(raw_text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(raw_text).ok()?;
    content_blocks(value.get("message"))
        .into_iter()
        .filter(|b| block_type(b) == Some("tool_use"))
        .find_map(bash_command)
        .map(|(cmd, _)| cmd)
}

/// Split a `Bash` tool_use block into (base command, remaining args).
/// Leading `VAR=value` assignments are skipped.
fn bash_command(block: &Value) -> Option<(String, String)> {
    if block.get("name").and_then(|v| v.as_str()) != Some("Bash") {
        return None;
    }
    let command = block
        .get("input")
        .and_then(|i| i.get("command"))
        .and_then(|v| v.as_str())?;
    let mut tokens = command
        .split_whitespace()
        .skip_while(|t| t.contains('=') && !t.starts_with('='));
    let base = tokens.next()?.to_string();
    let args = tokens.collect::<Vec<_>>().join(" ");
    Some((base, args))
}

fn content_blocks(message: Option<&Value>) -> Vec<&Value> {
    match message.and_then(|m| m.get("content")) {
        Some(Value::Array(items)) => items.iter().collect(),
        _ => Vec::new(),
    }
}

fn block_type(block: &Value) -> Option<&str> {
    block.get("type").and_then(|v| v.as_str())
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Get a string field from JSON, trying snake_case first then camelCase.
/// The agent runtime writes camelCase (`sessionId`), hand-written fixtures
/// and uploads sometimes use snake_case.
pub(crate) fn get_str(v: &Value, snake_key: &str) -> String {
    if let Some(s) = v.get(snake_key).and_then(|x| x.as_str()) {
        return s.to_string();
    }
    let camel = snake_to_camel(snake_key);
    v.get(&camel)
        .and_then(|x| x.as_str())
        .unwrap_or("")
        .to_string()
}

pub(crate) fn snake_to_camel(s: &str) -> String {
    let mut result = String::new();
    let mut capitalize_next = false;
    for ch in s.chars() {
        if ch == '_' {
            capitalize_next = true;
        } else if capitalize_next {
            result.extend(ch.to_uppercase());
            capitalize_next = false;
        } else {
            result.push(ch);
        }
    }
    result
}
