// crates/rlm-engine/src/llm/registry.rs
// Resolving a (provider, model) pair to a provider instance

use super::provider::{CompletionProvider, ProviderKind};
use crate::error::{Result, RlmError};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Resolves provider/model identifiers to a provider instance.
/// The orchestrator resolves once per execution.
pub trait ProviderResolver: Send + Sync {
    fn resolve(&self, provider: &str, model: &str) -> Result<Arc<dyn CompletionProvider>>;
}

/// Resolver that always hands out the same provider
pub struct StaticResolver {
    provider: Arc<dyn CompletionProvider>,
}

impl StaticResolver {
    pub fn new(provider: Arc<dyn CompletionProvider>) -> Self {
        Self { provider }
    }
}

impl ProviderResolver for StaticResolver {
    fn resolve(&self, _provider: &str, _model: &str) -> Result<Arc<dyn CompletionProvider>> {
        Ok(Arc::clone(&self.provider))
    }
}

/// Registry of providers keyed by kind, with a fallback chain for
/// identifiers that are unknown or not registered.
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn CompletionProvider>>,
    fallback_order: Vec<ProviderKind>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
            fallback_order: vec![
                ProviderKind::OpenAi,
                ProviderKind::Anthropic,
                ProviderKind::DeepSeek,
                ProviderKind::Gemini,
                ProviderKind::OpenRouter,
            ],
        }
    }

    pub fn register(mut self, kind: ProviderKind, provider: Arc<dyn CompletionProvider>) -> Self {
        self.providers.insert(kind, provider);
        self
    }

    pub fn with_fallback_order(mut self, order: Vec<ProviderKind>) -> Self {
        self.fallback_order = order;
        self
    }

    pub fn is_available(&self, kind: ProviderKind) -> bool {
        self.providers.contains_key(&kind)
    }

    pub fn available_providers(&self) -> Vec<ProviderKind> {
        self.providers.keys().copied().collect()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderResolver for ProviderRegistry {
    fn resolve(&self, provider: &str, model: &str) -> Result<Arc<dyn CompletionProvider>> {
        match ProviderKind::from_str(provider) {
            Ok(kind) => {
                if let Some(client) = self.providers.get(&kind) {
                    debug!(provider = %kind, model = model, "Resolved provider");
                    return Ok(Arc::clone(client));
                }
                warn!(provider = %kind, "Requested provider not registered, falling back");
            }
            Err(_) => warn!(provider = provider, "Unknown provider identifier, falling back"),
        }

        for kind in &self.fallback_order {
            if let Some(client) = self.providers.get(kind) {
                debug!(provider = %kind, model = model, "Using fallback provider");
                return Ok(Arc::clone(client));
            }
        }

        Err(RlmError::NoProvider {
            provider: provider.to_string(),
            model: model.to_string(),
        })
    }
}
