use serde::{Deserialize, Serialize};

use crate::hash::content_uuid;
use crate::parse::get_str;
use crate::ts::normalize_ts;

/// Session identifier as written by the agent runtime.
pub type SessionId = String;

/// Verbatim copy of one source log line, keyed by its global identity.
///
/// Never mutated or deleted once stored; events are re-derived from it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawEntry {
    pub uuid: String,
    pub session_id: SessionId,
    pub project_path: String,
    pub raw_text: String,
    pub observed_at: String,
}

/// Fallback values for fields a line may not carry.
#[derive(Debug, Clone)]
pub struct LineContext {
    pub session_id: SessionId,
    pub project_path: String,
    pub fallback_ts: String,
}

impl RawEntry {
    /// Derive identity and watermark fields from a raw line.
    ///
    /// Never fails: a line that is not JSON still becomes a RawEntry,
    /// identified by a hash of its content.
    pub fn from_line(line: &str, ctx: &LineContext) -> Self {
        let value = serde_json::from_str::<serde_json::Value>(line).ok();
        let value = value.as_ref();

        let uuid = value
            .and_then(|v| v.get("uuid"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| content_uuid(line));

        let session_id = value
            .map(|v| get_str(v, "session_id"))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| ctx.session_id.clone());

        let observed_at = value
            .and_then(|v| v.get("timestamp"))
            .and_then(|v| v.as_str())
            .and_then(normalize_ts)
            .unwrap_or_else(|| ctx.fallback_ts.clone());

        Self {
            uuid,
            session_id,
            project_path: ctx.project_path.clone(),
            raw_text: line.to_string(),
            observed_at,
        }
    }
}

/// Structural classification of a parsed record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    UserMessage,
    AssistantMessage,
    ToolCall,
    ToolResult,
    System,
    Summary,
    Unknown,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::UserMessage => "user_message",
            EventKind::AssistantMessage => "assistant_message",
            EventKind::ToolCall => "tool_call",
            EventKind::ToolResult => "tool_result",
            EventKind::System => "system",
            EventKind::Summary => "summary",
            EventKind::Unknown => "unknown",
        }
    }

    /// Inverse of [`EventKind::as_str`]; unrecognized names map to `Unknown`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "user_message" => EventKind::UserMessage,
            "assistant_message" => EventKind::AssistantMessage,
            "tool_call" => EventKind::ToolCall,
            "tool_result" => EventKind::ToolResult,
            "system" => EventKind::System,
            "summary" => EventKind::Summary,
            _ => EventKind::Unknown,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed projection of a [`RawEntry`]. Shares the entry's `uuid`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub uuid: String,
    pub session_id: SessionId,
    pub project_path: String,
    pub kind: EventKind,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Per-session rollup, refreshed incrementally after each batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub session_id: SessionId,
    pub project_path: String,
    pub first_seen: String,
    pub last_seen: String,
    pub entry_count: u64,
    pub event_count: u64,
    pub tool_call_count: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub parse_failures: u64,
    pub updated_at: String,
}

/// One row of the append-only schema ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationRecord {
    pub version: u32,
    pub name: String,
    pub applied_at: String,
}

/// A cached, fully recomputable insight row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pattern {
    pub pattern_type: String,
    pub pattern_key: String,
    pub count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub computed_at: String,
}

/// Well-known pattern types.
pub mod pattern_type {
    pub const TOOL_FREQUENCY: &str = "tool_frequency";
    pub const COMMAND_FREQUENCY: &str = "command_frequency";
    pub const TOOL_SEQUENCE: &str = "tool_sequence";
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> LineContext {
        LineContext {
            session_id: "from-file".into(),
            project_path: "-home-me-proj".into(),
            fallback_ts: "2025-02-02T00:00:00.000Z".into(),
        }
    }

    #[test]
    fn from_line_takes_source_identity() {
        let line = r#"{"uuid":"u-1","sessionId":"s-1","timestamp":"2025-01-01T12:00:00Z","type":"user"}"#;
        let raw = RawEntry::from_line(line, &ctx());
        assert_eq!(raw.uuid, "u-1");
        assert_eq!(raw.session_id, "s-1");
        assert_eq!(raw.observed_at, "2025-01-01T12:00:00.000Z");
        assert_eq!(raw.project_path, "-home-me-proj");
        assert_eq!(raw.raw_text, line);
    }

    #[test]
    fn from_line_falls_back_for_garbage() {
        let raw = RawEntry::from_line("{\"uuid\":\"trunc", &ctx());
        assert!(raw.uuid.starts_with("sha256:"));
        assert_eq!(raw.session_id, "from-file");
        assert_eq!(raw.observed_at, "2025-02-02T00:00:00.000Z");
    }

    #[test]
    fn empty_uuid_is_not_an_identity() {
        let raw = RawEntry::from_line(r#"{"uuid":"","type":"summary"}"#, &ctx());
        assert!(raw.uuid.starts_with("sha256:"));
    }

    #[test]
    fn kind_names_round_trip() {
        for kind in [
            EventKind::UserMessage,
            EventKind::AssistantMessage,
            EventKind::ToolCall,
            EventKind::ToolResult,
            EventKind::System,
            EventKind::Summary,
            EventKind::Unknown,
        ] {
            assert_eq!(EventKind::from_name(kind.as_str()), kind);
        }
        assert_eq!(EventKind::from_name("progress"), EventKind::Unknown);
    }
}
