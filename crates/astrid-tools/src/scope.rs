// Copyright (c) 2025-2026 Astrid Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Cancellation scope: deadline, cancel flag, and request-carried values.
//!
//! Every incoming request derives a scope; child scopes add deadlines (the
//! delegate wall clock, per-tool timeouts) or values (conversation and
//! session identifiers).  Cancelling a scope propagates to every descendant
//! and the cause — own deadline vs. external cancellation — stays
//! observable, because the two are handled very differently: a deadline is
//! an exhaustion outcome, an external cancel is an error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

/// Well-known value keys carried on scopes so handlers can stamp
/// persistence records without threading identifiers through every
/// signature.  Handlers treat absence as the empty string, never an error.
pub const KEY_CONVERSATION_ID: &str = "conversation_id";
pub const KEY_SESSION_ID: &str = "session_id";
pub const KEY_PARENT_TOOL_CALL_ID: &str = "parent_tool_call_id";
pub const KEY_REQUEST_ID: &str = "request_id";

/// Why a scope is no longer live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ScopeError {
    #[error("scope cancelled")]
    Cancelled,
    #[error("scope deadline exceeded")]
    DeadlineExceeded,
}

struct Inner {
    deadline: Option<Instant>,
    cancel_tx: watch::Sender<bool>,
    values: HashMap<String, String>,
    parent: Option<Arc<Inner>>,
}

/// A cancellation/deadline/value-carrying scope.  Cheap to clone; clones
/// share state.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<Inner>,
}

impl Scope {
    /// A root scope: no deadline, no values, not cancelled.
    pub fn new() -> Self {
        Self::build(None, HashMap::new(), None)
    }

    fn build(
        deadline: Option<Instant>,
        values: HashMap<String, String>,
        parent: Option<Arc<Inner>>,
    ) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                deadline,
                cancel_tx,
                values,
                parent,
            }),
        }
    }

    /// Child scope expiring at `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        Self::build(Some(deadline), HashMap::new(), Some(Arc::clone(&self.inner)))
    }

    /// Child scope expiring `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Child scope carrying one additional value.
    pub fn with_value(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut values = HashMap::new();
        values.insert(key.into(), value.into());
        Self::build(None, values, Some(Arc::clone(&self.inner)))
    }

    /// Cancel this scope and every scope derived from it.
    pub fn cancel(&self) {
        let _ = self.inner.cancel_tx.send(true);
    }

    fn chain(&self) -> impl Iterator<Item = &Inner> {
        std::iter::successors(Some(self.inner.as_ref()), |i| {
            i.parent.as_deref()
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.chain().any(|i| *i.cancel_tx.borrow())
    }

    /// Earliest deadline along the parent chain, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.chain().filter_map(|i| i.deadline).min()
    }

    /// Time remaining until the effective deadline.  `None` when no
    /// deadline is set; zero when already expired.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline()
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self.deadline(), Some(d) if Instant::now() >= d)
    }

    /// The cause of death, if the scope is no longer live.  External
    /// cancellation takes precedence over deadline expiry, matching how the
    /// two are checked at loop boundaries.
    pub fn err(&self) -> Option<ScopeError> {
        if self.is_cancelled() {
            Some(ScopeError::Cancelled)
        } else if self.is_deadline_exceeded() {
            Some(ScopeError::DeadlineExceeded)
        } else {
            None
        }
    }

    /// `Ok` while the scope is live.
    pub fn check(&self) -> Result<(), ScopeError> {
        match self.err() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Resolves when the scope dies, by cancellation or deadline.
    /// Cancel-safe; re-checks flags on entry so a prior cancel is never
    /// missed.
    pub async fn cancelled(&self) {
        if self.err().is_some() {
            return;
        }
        let deadline = self.deadline();
        let mut rxs: Vec<watch::Receiver<bool>> =
            self.chain().map(|i| i.cancel_tx.subscribe()).collect();
        let any_cancel = async move {
            let waits = rxs
                .iter_mut()
                .map(|rx| Box::pin(wait_true(rx)))
                .collect::<Vec<_>>();
            futures::future::select_all(waits).await;
        };
        match deadline {
            Some(d) => {
                tokio::select! {
                    _ = any_cancel => {}
                    _ = tokio::time::sleep_until(d.into()) => {}
                }
            }
            None => any_cancel.await,
        }
    }

    /// Look up a carried value along the parent chain.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.chain()
            .find_map(|i| i.values.get(key).map(String::as_str))
    }

    fn value_or_empty(&self, key: &str) -> String {
        self.value(key).unwrap_or_default().to_string()
    }

    pub fn conversation_id(&self) -> String {
        self.value_or_empty(KEY_CONVERSATION_ID)
    }

    pub fn session_id(&self) -> String {
        self.value_or_empty(KEY_SESSION_ID)
    }

    pub fn parent_tool_call_id(&self) -> String {
        self.value_or_empty(KEY_PARENT_TOOL_CALL_ID)
    }

    pub fn request_id(&self) -> String {
        self.value_or_empty(KEY_REQUEST_ID)
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("deadline", &self.inner.deadline)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

async fn wait_true(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone without ever cancelling: this link can no longer
            // fire.
            futures::future::pending::<()>().await;
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
