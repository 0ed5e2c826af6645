// Copyright (c) 2025-2026 Astrid Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Model router: pick a model from a scored catalog subject to hard
//! constraints, and keep a bounded audit of recent decisions.

mod router;

pub use astrid_config::ModelEntryConfig as ModelEntry;
pub use router::{hints, AuditEntry, Decision, Priority, Router, RouterRequest};
