// Copyright (c) 2025-2026 Astrid Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Model-name routing across several chat clients.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::bail;

use crate::{ChatClient, ChatRequest, ChatResponse, StreamCallback};

/// A routing client: forwards each request to the provider registered for
/// its model name.  Unknown models go to the fallback; without a fallback
/// the request fails.
pub struct MultiClient {
    /// model name → provider name
    routes: HashMap<String, String>,
    /// provider name → client
    providers: HashMap<String, Arc<dyn ChatClient>>,
    fallback: Option<Arc<dyn ChatClient>>,
}

impl MultiClient {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
            providers: HashMap::new(),
            fallback: None,
        }
    }

    pub fn with_provider(mut self, name: impl Into<String>, client: Arc<dyn ChatClient>) -> Self {
        self.providers.insert(name.into(), client);
        self
    }

    /// Route `model` to the provider registered under `provider`.
    pub fn route(mut self, model: impl Into<String>, provider: impl Into<String>) -> Self {
        self.routes.insert(model.into(), provider.into());
        self
    }

    pub fn with_fallback(mut self, client: Arc<dyn ChatClient>) -> Self {
        self.fallback = Some(client);
        self
    }

    fn resolve(&self, model: &str) -> anyhow::Result<Arc<dyn ChatClient>> {
        if let Some(provider) = self.routes.get(model) {
            if let Some(client) = self.providers.get(provider) {
                return Ok(Arc::clone(client));
            }
        }
        match &self.fallback {
            Some(client) => Ok(Arc::clone(client)),
            None => bail!("no provider for model {model}"),
        }
    }
}

impl Default for MultiClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ChatClient for MultiClient {
    fn name(&self) -> &str {
        "multi"
    }

    /// Provider name a model resolves to, for usage attribution.
    fn provider_for(&self, model: &str) -> &str {
        match self.routes.get(model) {
            Some(provider) => provider.as_str(),
            None => match &self.fallback {
                Some(client) => client.name(),
                None => self.name(),
            },
        }
    }

    async fn chat(&self, req: ChatRequest) -> anyhow::Result<ChatResponse> {
        self.resolve(&req.model)?.chat(req).await
    }

    async fn chat_stream(
        &self,
        req: ChatRequest,
        callback: Option<StreamCallback<'_>>,
    ) -> anyhow::Result<ChatResponse> {
        self.resolve(&req.model)?.chat_stream(req, callback).await
    }

    async fn ping(&self) -> anyhow::Result<()> {
        for client in self.providers.values() {
            client.ping().await?;
        }
        Ok(())
    }
}
