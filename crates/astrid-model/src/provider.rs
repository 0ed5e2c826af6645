// Copyright (c) 2025-2026 Astrid Contributors
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;

use crate::{ChatRequest, ChatResponse, StreamCallback};

/// A chat-capable language-model client.
///
/// Implementations speak one concrete wire protocol; the
/// [`MultiClient`](crate::MultiClient) composes several of them behind a
/// model-name routing table.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Provider name for status display and usage attribution.
    fn name(&self) -> &str;

    /// Provider a given model resolves to.  Routing clients override this;
    /// single-protocol clients are their own provider.
    fn provider_for(&self, _model: &str) -> &str {
        self.name()
    }

    /// One complete (non-streaming) chat exchange.
    async fn chat(&self, req: ChatRequest) -> anyhow::Result<ChatResponse>;

    /// Streaming chat exchange.  `callback` receives the tagged event
    /// stream; when `None` the provider may fall back to a single
    /// non-streaming request.  The returned response always reflects the
    /// fully accumulated terminal state.
    async fn chat_stream(
        &self,
        req: ChatRequest,
        callback: Option<StreamCallback<'_>>,
    ) -> anyhow::Result<ChatResponse>;

    /// Cheap reachability probe.
    async fn ping(&self) -> anyhow::Result<()>;
}

/// Maximum number of error-body bytes carried into an error message.
/// Provider error bodies can embed entire prompts; 4 KiB keeps logs useful
/// without flooding them.
pub(crate) const MAX_ERROR_BODY: usize = 4096;

/// Truncate an error body at a char boundary within [`MAX_ERROR_BODY`].
pub(crate) fn clip_error_body(body: &str) -> &str {
    if body.len() <= MAX_ERROR_BODY {
        return body;
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}
