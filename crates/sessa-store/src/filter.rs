//! Structured event predicate.
//!
//! Callers describe what they want as typed constraints; [`EventFilter::to_sql`]
//! is the only place that turns them into SQL, always with bound parameters.

use rusqlite::types::Value;
use sessa_core::EventKind;

#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    /// `timestamp >= ts`
    Since(String),
    /// `timestamp < ts`
    Until(String),
    SessionIn(Vec<String>),
    /// Substring match on `project_path`.
    ProjectContains(String),
    ToolName(String),
    KindIn(Vec<EventKind>),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub constraints: Vec<Constraint>,
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, c: Constraint) -> Self {
        self.constraints.push(c);
        self
    }

    pub fn since(self, ts: impl Into<String>) -> Self {
        self.with(Constraint::Since(ts.into()))
    }

    pub fn until(self, ts: impl Into<String>) -> Self {
        self.with(Constraint::Until(ts.into()))
    }

    pub fn sessions<I, S>(self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with(Constraint::SessionIn(
            ids.into_iter().map(Into::into).collect(),
        ))
    }

    pub fn project_contains(self, needle: impl Into<String>) -> Self {
        self.with(Constraint::ProjectContains(needle.into()))
    }

    pub fn tool(self, name: impl Into<String>) -> Self {
        self.with(Constraint::ToolName(name.into()))
    }

    pub fn kinds(self, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        self.with(Constraint::KindIn(kinds.into_iter().collect()))
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Render as a `WHERE ... ORDER BY ... LIMIT` suffix plus its parameters.
    pub(crate) fn to_sql(&self) -> (String, Vec<Value>) {
        let mut clauses = Vec::new();
        let mut params: Vec<Value> = Vec::new();

        for c in &self.constraints {
            match c {
                Constraint::Since(ts) => {
                    params.push(Value::Text(ts.clone()));
                    clauses.push(format!("timestamp >= ?{}", params.len()));
                }
                Constraint::Until(ts) => {
                    params.push(Value::Text(ts.clone()));
                    clauses.push(format!("timestamp < ?{}", params.len()));
                }
                Constraint::SessionIn(ids) => {
                    clauses.push(in_list("session_id", ids.iter().cloned(), &mut params));
                }
                Constraint::ProjectContains(needle) => {
                    params.push(Value::Text(needle.clone()));
                    clauses.push(format!("instr(project_path, ?{}) > 0", params.len()));
                }
                Constraint::ToolName(name) => {
                    params.push(Value::Text(name.clone()));
                    clauses.push(format!("tool_name = ?{}", params.len()));
                }
                Constraint::KindIn(kinds) => {
                    clauses.push(in_list(
                        "kind",
                        kinds.iter().map(|k| k.as_str().to_string()),
                        &mut params,
                    ));
                }
            }
        }

        let mut sql = String::new();
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY timestamp, uuid");
        if let Some(n) = self.limit {
            params.push(Value::Integer(n as i64));
            sql.push_str(&format!(" LIMIT ?{}", params.len()));
        }
        (sql, params)
    }
}

fn in_list(
    column: &str,
    items: impl Iterator<Item = String>,
    params: &mut Vec<Value>,
) -> String {
    let mut slots = Vec::new();
    for item in items {
        params.push(Value::Text(item));
        slots.push(format!("?{}", params.len()));
    }
    if slots.is_empty() {
        // An empty set matches nothing.
        return "0".to_string();
    }
    format!("{column} IN ({})", slots.join(", "))
}
