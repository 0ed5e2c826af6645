// Copyright (c) 2025-2026 Astrid Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Per-call token accounting and cost attribution.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::warn;

use astrid_config::{ModelPricing, PricingConfig};

use crate::StoreError;

/// Which loop produced a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageRole {
    Agent,
    Delegate,
    Metacognitive,
}

impl UsageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Delegate => "delegate",
            Self::Metacognitive => "metacognitive",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "delegate" => Self::Delegate,
            "metacognitive" => Self::Metacognitive,
            _ => Self::Agent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub conversation_id: String,
    pub model: String,
    pub provider: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub role: UsageRole,
    pub task_name: Option<String>,
}

/// SQLite-backed usage ledger.
pub struct UsageStore {
    conn: Mutex<Connection>,
}

impl UsageStore {
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

    pub fn insert(&self, rec: &UsageRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO usage_records (
                timestamp, request_id, conversation_id, model, provider,
                input_tokens, output_tokens, cost_usd, role, task_name
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                rec.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
                rec.request_id,
                rec.conversation_id,
                rec.model,
                rec.provider,
                rec.input_tokens as i64,
                rec.output_tokens as i64,
                rec.cost_usd,
                rec.role.as_str(),
                rec.task_name,
            ],
        )?;
        Ok(())
    }

    /// Newest records first.  `limit = 0` returns all rows.
    pub fn list(&self, limit: usize) -> Result<Vec<UsageRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let sql = if limit == 0 {
            "SELECT timestamp, request_id, conversation_id, model, provider, \
             input_tokens, output_tokens, cost_usd, role, task_name \
             FROM usage_records ORDER BY timestamp DESC"
                .to_string()
        } else {
            format!(
                "SELECT timestamp, request_id, conversation_id, model, provider, \
                 input_tokens, output_tokens, cost_usd, role, task_name \
                 FROM usage_records ORDER BY timestamp DESC LIMIT {limit}"
            )
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            let ts: String = row.get(0)?;
            let role: String = row.get(8)?;
            Ok(UsageRecord {
                timestamp: DateTime::parse_from_rfc3339(&ts)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or(DateTime::UNIX_EPOCH),
                request_id: row.get(1)?,
                conversation_id: row.get(2)?,
                model: row.get(3)?,
                provider: row.get(4)?,
                input_tokens: row.get::<_, i64>(5)? as u64,
                output_tokens: row.get::<_, i64>(6)? as u64,
                cost_usd: row.get(7)?,
                role: UsageRole::parse(&role),
                task_name: row.get(9)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Total recorded cost since `since`, inclusive.
    pub fn total_cost_since(&self, since: DateTime<Utc>) -> Result<f64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let total: f64 = conn.query_row(
            "SELECT COALESCE(SUM(cost_usd), 0.0) FROM usage_records WHERE timestamp >= ?1",
            params![since.to_rfc3339_opts(SecondsFormat::Nanos, true)],
            |row| row.get(0),
        )?;
        Ok(total)
    }
}

fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS usage_records (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp       TEXT NOT NULL,
            request_id      TEXT NOT NULL,
            conversation_id TEXT NOT NULL,
            model           TEXT NOT NULL,
            provider        TEXT NOT NULL,
            input_tokens    INTEGER NOT NULL,
            output_tokens   INTEGER NOT NULL,
            cost_usd        REAL NOT NULL,
            role            TEXT NOT NULL,
            task_name       TEXT
         );
         CREATE INDEX IF NOT EXISTS idx_usage_timestamp
             ON usage_records (timestamp DESC);
         CREATE INDEX IF NOT EXISTS idx_usage_conversation
             ON usage_records (conversation_id);",
    )
}

/// Computes and persists cost-attributed usage records.
pub struct UsageRecorder {
    store: UsageStore,
    pricing: PricingConfig,
    /// Models already warned about missing pricing — one log line per
    /// unknown model, not one per call.
    warned: Mutex<HashSet<String>>,
}

impl UsageRecorder {
    pub fn new(store: UsageStore, pricing: PricingConfig) -> Self {
        Self {
            store,
            pricing,
            warned: Mutex::new(HashSet::new()),
        }
    }

    /// `cost = input·in_price + output·out_price`; models absent from the
    /// pricing map cost zero.
    pub fn cost_for(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        match self.pricing.models.get(model) {
            Some(ModelPricing {
                in_price,
                out_price,
            }) => input_tokens as f64 * in_price + output_tokens as f64 * out_price,
            None => {
                let mut warned = self.warned.lock().unwrap();
                if warned.insert(model.to_string()) {
                    warn!(model, "no pricing configured; recording cost 0");
                }
                0.0
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        request_id: &str,
        conversation_id: &str,
        model: &str,
        provider: &str,
        input_tokens: u64,
        output_tokens: u64,
        role: UsageRole,
        task_name: Option<String>,
    ) -> Result<UsageRecord, StoreError> {
        let rec = UsageRecord {
            timestamp: Utc::now(),
            request_id: request_id.to_string(),
            conversation_id: conversation_id.to_string(),
            model: model.to_string(),
            provider: provider.to_string(),
            input_tokens,
            output_tokens,
            cost_usd: self.cost_for(model, input_tokens, output_tokens),
            role,
            task_name,
        };
        self.store.insert(&rec)?;
        Ok(rec)
    }

    pub fn store(&self) -> &UsageStore {
        &self.store
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn pricing() -> PricingConfig {
        let mut models = HashMap::new();
        models.insert(
            "claude-sonnet-4-5".to_string(),
            ModelPricing {
                in_price: 3e-6,
                out_price: 15e-6,
            },
        );
        PricingConfig { models }
    }

    fn recorder() -> UsageRecorder {
        UsageRecorder::new(UsageStore::open_in_memory().unwrap(), pricing())
    }

    #[test]
    fn cost_uses_per_model_prices() {
        let r = recorder();
        let cost = r.cost_for("claude-sonnet-4-5", 1_000_000, 100_000);
        assert!((cost - (3.0 + 1.5)).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_costs_zero() {
        let r = recorder();
        assert_eq!(r.cost_for("mystery", 10_000, 10_000), 0.0);
        // Second call goes through the already-warned path.
        assert_eq!(r.cost_for("mystery", 1, 1), 0.0);
        assert_eq!(r.warned.lock().unwrap().len(), 1);
    }

    #[test]
    fn record_persists_and_lists_newest_first() {
        let r = recorder();
        r.record(
            "req-1",
            "delegate-abc",
            "claude-sonnet-4-5",
            "anthropic",
            100,
            20,
            UsageRole::Delegate,
            Some("Check the office light".into()),
        )
        .unwrap();
        r.record(
            "req-2",
            "metacog-1700000000000",
            "qwen2.5:14b",
            "ollama",
            500,
            80,
            UsageRole::Metacognitive,
            None,
        )
        .unwrap();

        let rows = r.store().list(0).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].request_id, "req-2");
        assert_eq!(rows[0].role, UsageRole::Metacognitive);
        assert_eq!(rows[1].task_name.as_deref(), Some("Check the office light"));
        assert!(rows[1].cost_usd > 0.0);
    }

    #[test]
    fn total_cost_since_sums_rows() {
        let r = recorder();
        let before = Utc::now() - chrono::Duration::seconds(1);
        r.record(
            "req-1",
            "c",
            "claude-sonnet-4-5",
            "anthropic",
            1_000_000,
            0,
            UsageRole::Agent,
            None,
        )
        .unwrap();
        let total = r.store().total_cost_since(before).unwrap();
        assert!((total - 3.0).abs() < 1e-9);
    }

    #[test]
    fn role_round_trips_through_storage() {
        let r = recorder();
        r.record("req", "c", "m", "p", 1, 1, UsageRole::Delegate, None)
            .unwrap();
        assert_eq!(r.store().list(1).unwrap()[0].role, UsageRole::Delegate);
    }
}
