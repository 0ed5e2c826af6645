// Copyright (c) 2025-2026 Astrid Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Append-only archive of completed delegate executions.
//!
//! One row per delegate run, keyed by delegate id.  Complex fields
//! (message trace, tool-call counts) are embedded JSON strings; schema
//! evolution is additive and idempotent — columns are added only after
//! inspecting the live table's column list, so restarts re-run migrations
//! safely.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use tracing::warn;

use astrid_model::Message;

use crate::StoreError;

/// Why a delegate run stopped short of a clean answer.
///
/// `exhausted = true` on a [`DelegationRecord`] if and only if one of these
/// reasons is set — exhaustion is a distinguished success-with-reason
/// outcome, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustReason {
    MaxIterations,
    TokenBudget,
    WallClock,
    NoOutput,
    IllegalTool,
}

impl ExhaustReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MaxIterations => "max_iterations",
            Self::TokenBudget => "token_budget",
            Self::WallClock => "wall_clock",
            Self::NoOutput => "no_output",
            Self::IllegalTool => "illegal_tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "max_iterations" => Some(Self::MaxIterations),
            "token_budget" => Some(Self::TokenBudget),
            "wall_clock" => Some(Self::WallClock),
            "no_output" => Some(Self::NoOutput),
            "illegal_tool" => Some(Self::IllegalTool),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExhaustReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-iteration trace datum.  Iteration records ride to the archiver, not
/// the delegation table — the table keeps the run-level snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub index: u32,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tool_call_ids: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub has_tool_calls: bool,
    /// Empty on normal completion.
    #[serde(default)]
    pub break_reason: String,
}

/// Completion snapshot persisted once per delegate run.
/// Immutable after insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationRecord {
    pub id: String,
    pub conversation_id: String,
    pub parent_session_id: String,
    pub parent_tool_call_id: String,
    pub task: String,
    pub guidance: Option<String>,
    pub profile: String,
    pub model: String,
    pub iterations: u32,
    pub max_iterations: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub exhausted: bool,
    pub exhaust_reason: Option<ExhaustReason>,
    pub tools_called: Option<HashMap<String, u32>>,
    pub messages: Vec<Message>,
    pub result_content: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Build a tool-name → call-count map from a message trace.
///
/// Returns `None` — not an empty map — when the trace holds no tool calls,
/// so the stored column is NULL rather than `{}`.
pub fn extract_tools_called(messages: &[Message]) -> Option<HashMap<String, u32>> {
    let mut counts: HashMap<String, u32> = HashMap::new();
    for m in messages {
        for call in &m.tool_calls {
            *counts.entry(call.function.name.clone()).or_insert(0) += 1;
        }
    }
    if counts.is_empty() {
        None
    } else {
        Some(counts)
    }
}

pub struct DelegationStore {
    conn: Mutex<Connection>,
}

impl DelegationStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert one completed run.  Records are immutable after insertion;
    /// re-recording the same id is a caller bug and surfaces as a
    /// constraint error.
    pub fn record(&self, rec: &DelegationRecord) -> Result<(), StoreError> {
        let tools_called_json = rec
            .tools_called
            .as_ref()
            .map(|m| serde_json::to_string(m).unwrap_or_else(|_| "{}".into()));
        let messages_json =
            serde_json::to_string(&rec.messages).unwrap_or_else(|_| "[]".into());

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO delegations (
                id, conversation_id, task, guidance, profile, model,
                iterations, max_iterations, input_tokens, output_tokens,
                exhausted, exhaust_reason, tools_called, messages,
                result_content, started_at, completed_at, duration_ms, error,
                parent_session_id, parent_tool_call_id
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                       ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
            params![
                rec.id,
                rec.conversation_id,
                rec.task,
                rec.guidance,
                rec.profile,
                rec.model,
                rec.iterations,
                rec.max_iterations,
                rec.input_tokens as i64,
                rec.output_tokens as i64,
                rec.exhausted,
                rec.exhaust_reason.map(|r| r.as_str()),
                tools_called_json,
                messages_json,
                rec.result_content,
                to_rfc3339(rec.started_at),
                to_rfc3339(rec.completed_at),
                rec.duration_ms as i64,
                rec.error,
                rec.parent_session_id,
                rec.parent_tool_call_id,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<DelegationRecord, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE id = ?1"))?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(row_to_record(row)?),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    /// Newest runs first.  `limit = 0` returns all rows.
    pub fn list(&self, limit: usize) -> Result<Vec<DelegationRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let sql = if limit == 0 {
            format!("{SELECT_COLUMNS} ORDER BY started_at DESC")
        } else {
            format!("{SELECT_COLUMNS} ORDER BY started_at DESC LIMIT {limit}")
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| row_to_record(row))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Newest runs first for one conversation.  `limit = 0` returns all.
    pub fn recent_for_conversation(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<DelegationRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let sql = if limit == 0 {
            format!("{SELECT_COLUMNS} WHERE conversation_id = ?1 ORDER BY started_at DESC")
        } else {
            format!(
                "{SELECT_COLUMNS} WHERE conversation_id = ?1 \
                 ORDER BY started_at DESC LIMIT {limit}"
            )
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![conversation_id], |row| row_to_record(row))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

const SELECT_COLUMNS: &str = "SELECT id, conversation_id, task, guidance, profile, model, \
     iterations, max_iterations, input_tokens, output_tokens, exhausted, \
     exhaust_reason, tools_called, messages, result_content, started_at, \
     completed_at, duration_ms, error, parent_session_id, parent_tool_call_id \
     FROM delegations";

fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS delegations (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            task            TEXT NOT NULL,
            guidance        TEXT,
            profile         TEXT NOT NULL,
            model           TEXT NOT NULL,
            iterations      INTEGER NOT NULL,
            max_iterations  INTEGER NOT NULL,
            input_tokens    INTEGER NOT NULL,
            output_tokens   INTEGER NOT NULL,
            exhausted       INTEGER NOT NULL,
            exhaust_reason  TEXT,
            tools_called    TEXT,
            messages        TEXT NOT NULL,
            result_content  TEXT NOT NULL,
            started_at      TEXT NOT NULL,
            completed_at    TEXT NOT NULL,
            duration_ms     INTEGER NOT NULL,
            error           TEXT
         );
         CREATE INDEX IF NOT EXISTS idx_delegations_conversation
             ON delegations (conversation_id, started_at DESC);
         CREATE INDEX IF NOT EXISTS idx_delegations_profile
             ON delegations (profile);
         CREATE INDEX IF NOT EXISTS idx_delegations_model
             ON delegations (model);
         CREATE INDEX IF NOT EXISTS idx_delegations_started_at
             ON delegations (started_at DESC);",
    )?;
    // Columns added after the initial schema shipped.  Inspect the live
    // column list first so the ALTER is idempotent across restarts.
    add_column_if_missing(
        conn,
        "delegations",
        "parent_session_id",
        "TEXT NOT NULL DEFAULT ''",
    )?;
    add_column_if_missing(
        conn,
        "delegations",
        "parent_tool_call_id",
        "TEXT NOT NULL DEFAULT ''",
    )?;
    Ok(())
}

fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    decl: &str,
) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let existing: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<_>>()?;
    if !existing.iter().any(|c| c == column) {
        conn.execute(
            &format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"),
            [],
        )?;
    }
    Ok(())
}

fn to_rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse an RFC-3339 timestamp; failures yield zero time rather than
/// rejecting the row.
fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// Map one row, best-effort: scalar fields are returned as stored, nested
/// JSON fields degrade to zero values when corrupt.
fn row_to_record(row: &Row<'_>) -> rusqlite::Result<DelegationRecord> {
    let exhaust_reason: Option<String> = row.get(11)?;
    let tools_called_json: Option<String> = row.get(12)?;
    let messages_json: String = row.get(13)?;
    let started_at: String = row.get(15)?;
    let completed_at: String = row.get(16)?;

    let tools_called = tools_called_json.and_then(|j| {
        serde_json::from_str(&j)
            .map_err(|e| warn!("corrupt tools_called JSON: {e}"))
            .ok()
    });
    let messages: Vec<Message> = serde_json::from_str(&messages_json).unwrap_or_else(|e| {
        warn!("corrupt messages JSON: {e}");
        Vec::new()
    });

    Ok(DelegationRecord {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        task: row.get(2)?,
        guidance: row.get(3)?,
        profile: row.get(4)?,
        model: row.get(5)?,
        iterations: row.get(6)?,
        max_iterations: row.get(7)?,
        input_tokens: row.get::<_, i64>(8)? as u64,
        output_tokens: row.get::<_, i64>(9)? as u64,
        exhausted: row.get(10)?,
        exhaust_reason: exhaust_reason.as_deref().and_then(ExhaustReason::parse),
        tools_called,
        messages,
        result_content: row.get(14)?,
        started_at: parse_rfc3339(&started_at),
        completed_at: parse_rfc3339(&completed_at),
        duration_ms: row.get::<_, i64>(17)? as u64,
        error: row.get(18)?,
        parent_session_id: row.get(19)?,
        parent_tool_call_id: row.get(20)?,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use astrid_model::ToolCall;
    use serde_json::Map;

    fn sample(id: &str) -> DelegationRecord {
        let messages = vec![
            Message::system("You are a delegate."),
            Message::user("Check the office light"),
            Message::assistant_with_calls(
                "",
                vec![ToolCall {
                    id: "tool_get_state_0".into(),
                    function: astrid_model::FunctionCall {
                        name: "get_state".into(),
                        arguments: Map::new(),
                    },
                }],
            ),
            Message::tool_result("tool_get_state_0", "State: on"),
            Message::assistant("The office light is on."),
        ];
        DelegationRecord {
            id: id.into(),
            conversation_id: "delegate-abc123".into(),
            parent_session_id: "session-1".into(),
            parent_tool_call_id: "call-9".into(),
            task: "Check the office light".into(),
            guidance: Some("use get_state".into()),
            profile: "general".into(),
            model: "test-model".into(),
            iterations: 2,
            max_iterations: 15,
            input_tokens: 300,
            output_tokens: 55,
            exhausted: false,
            exhaust_reason: None,
            tools_called: extract_tools_called(&messages),
            messages,
            result_content: "The office light is on.".into(),
            started_at: Utc::now(),
            completed_at: Utc::now(),
            duration_ms: 412,
            error: None,
        }
    }

    #[test]
    fn record_then_get_round_trips() {
        let store = DelegationStore::open_in_memory().unwrap();
        let rec = sample("d-1");
        store.record(&rec).unwrap();
        let back = store.get("d-1").unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn get_unknown_id_is_not_found() {
        let store = DelegationStore::open_in_memory().unwrap();
        assert!(matches!(
            store.get("missing"),
            Err(StoreError::NotFound(id)) if id == "missing"
        ));
    }

    #[test]
    fn exhausted_record_round_trips_reason() {
        let store = DelegationStore::open_in_memory().unwrap();
        let mut rec = sample("d-2");
        rec.exhausted = true;
        rec.exhaust_reason = Some(ExhaustReason::MaxIterations);
        store.record(&rec).unwrap();
        let back = store.get("d-2").unwrap();
        assert!(back.exhausted);
        assert_eq!(back.exhaust_reason, Some(ExhaustReason::MaxIterations));
    }

    #[test]
    fn list_returns_newest_first_and_honours_limit() {
        let store = DelegationStore::open_in_memory().unwrap();
        for i in 0..5i64 {
            let mut rec = sample(&format!("d-{i}"));
            rec.started_at = Utc::now() + chrono::Duration::seconds(i);
            store.record(&rec).unwrap();
        }
        let all = store.list(0).unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].id, "d-4");
        assert_eq!(all[4].id, "d-0");

        let top2 = store.list(2).unwrap();
        assert_eq!(top2.len(), 2);
        assert_eq!(top2[0].id, "d-4");
    }

    #[test]
    fn recent_for_conversation_filters() {
        let store = DelegationStore::open_in_memory().unwrap();
        let mut a = sample("d-a");
        a.conversation_id = "delegate-aaa".into();
        let mut b = sample("d-b");
        b.conversation_id = "delegate-bbb".into();
        store.record(&a).unwrap();
        store.record(&b).unwrap();
        let got = store.recent_for_conversation("delegate-aaa", 0).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, "d-a");
    }

    #[test]
    fn migration_is_idempotent_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("delegations.db");
        {
            let store = DelegationStore::open(&path).unwrap();
            store.record(&sample("d-1")).unwrap();
        }
        // Reopen re-runs migrate(); the ALTERs must be skipped.
        let store = DelegationStore::open(&path).unwrap();
        let back = store.get("d-1").unwrap();
        assert_eq!(back.parent_session_id, "session-1");
    }

    #[test]
    fn legacy_schema_gains_parent_columns_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.db");
        {
            // Simulate a database created before the parent-linkage columns.
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE delegations (
                    id TEXT PRIMARY KEY, conversation_id TEXT NOT NULL,
                    task TEXT NOT NULL, guidance TEXT, profile TEXT NOT NULL,
                    model TEXT NOT NULL, iterations INTEGER NOT NULL,
                    max_iterations INTEGER NOT NULL, input_tokens INTEGER NOT NULL,
                    output_tokens INTEGER NOT NULL, exhausted INTEGER NOT NULL,
                    exhaust_reason TEXT, tools_called TEXT, messages TEXT NOT NULL,
                    result_content TEXT NOT NULL, started_at TEXT NOT NULL,
                    completed_at TEXT NOT NULL, duration_ms INTEGER NOT NULL,
                    error TEXT
                 );",
            )
            .unwrap();
        }
        let store = DelegationStore::open(&path).unwrap();
        store.record(&sample("d-1")).unwrap();
        assert_eq!(store.get("d-1").unwrap().parent_tool_call_id, "call-9");
    }

    #[test]
    fn corrupt_json_fields_degrade_without_dropping_the_row() {
        let store = DelegationStore::open_in_memory().unwrap();
        store.record(&sample("d-1")).unwrap();
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "UPDATE delegations SET messages = 'not json', tools_called = '{{{' WHERE id = 'd-1'",
                [],
            )
            .unwrap();
        }
        let back = store.get("d-1").unwrap();
        assert!(back.messages.is_empty());
        assert!(back.tools_called.is_none());
        assert_eq!(back.result_content, "The office light is on.");
    }

    #[test]
    fn bad_timestamp_yields_zero_time_not_an_error() {
        let store = DelegationStore::open_in_memory().unwrap();
        store.record(&sample("d-1")).unwrap();
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "UPDATE delegations SET started_at = 'yesterday-ish' WHERE id = 'd-1'",
                [],
            )
            .unwrap();
        }
        let back = store.get("d-1").unwrap();
        assert_eq!(back.started_at, DateTime::UNIX_EPOCH);
    }

    #[test]
    fn unknown_exhaust_reason_reads_as_none() {
        let store = DelegationStore::open_in_memory().unwrap();
        let mut rec = sample("d-1");
        rec.exhausted = true;
        rec.exhaust_reason = Some(ExhaustReason::WallClock);
        store.record(&rec).unwrap();
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "UPDATE delegations SET exhaust_reason = 'future_reason' WHERE id = 'd-1'",
                [],
            )
            .unwrap();
        }
        assert_eq!(store.get("d-1").unwrap().exhaust_reason, None);
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let store = DelegationStore::open_in_memory().unwrap();
        store.record(&sample("d-1")).unwrap();
        assert!(store.record(&sample("d-1")).is_err());
    }

    // ── extract_tools_called ──────────────────────────────────────────────────

    #[test]
    fn extract_counts_calls_across_the_trace() {
        let msgs = vec![
            Message::assistant_with_calls(
                "",
                vec![
                    ToolCall::new("get_state", Map::new()),
                    ToolCall::new("get_state", Map::new()),
                ],
            ),
            Message::tool_result("a", "x"),
            Message::assistant_with_calls("", vec![ToolCall::new("set_state", Map::new())]),
        ];
        let counts = extract_tools_called(&msgs).unwrap();
        assert_eq!(counts["get_state"], 2);
        assert_eq!(counts["set_state"], 1);
    }

    #[test]
    fn extract_returns_none_for_call_free_trace() {
        let msgs = vec![Message::user("hi"), Message::assistant("hello")];
        assert!(extract_tools_called(&msgs).is_none());
        assert!(extract_tools_called(&[]).is_none());
    }

    #[test]
    fn exhaust_reason_strings_round_trip() {
        for reason in [
            ExhaustReason::MaxIterations,
            ExhaustReason::TokenBudget,
            ExhaustReason::WallClock,
            ExhaustReason::NoOutput,
            ExhaustReason::IllegalTool,
        ] {
            assert_eq!(ExhaustReason::parse(reason.as_str()), Some(reason));
        }
        assert_eq!(ExhaustReason::parse("nonsense"), None);
    }
}
