// Copyright (c) 2025-2026 Astrid Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Durable accounting for agent runs: the append-only delegation archive
//! and the per-call usage/cost ledger, both on SQLite.

mod delegation;
mod usage;

pub use delegation::{
    extract_tools_called, DelegationRecord, DelegationStore, ExhaustReason, IterationRecord,
};
pub use usage::{UsageRecord, UsageRecorder, UsageRole, UsageStore};

/// Store-level failures.  Background writers treat these as log-and-continue;
/// only explicit reads surface them to callers.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}
