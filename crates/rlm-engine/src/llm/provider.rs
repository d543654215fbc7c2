// crates/rlm-engine/src/llm/provider.rs
// Provider-agnostic completion capability

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use strum::{AsRefStr, Display, EnumString};
use tokio_util::sync::CancellationToken;

/// Known provider families. The tag decides which stream mapping applies.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ProviderKind {
    OpenAi,
    DeepSeek,
    OpenRouter,
    Anthropic,
    Gemini,
}

impl ProviderKind {
    /// Providers that stream the shared OpenAI-compatible delta format
    pub fn is_openai_compatible(&self) -> bool {
        matches!(self, Self::OpenAi | Self::DeepSeek | Self::OpenRouter)
    }
}

/// Role-tagged chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// One completion request
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub cancel: Option<CancellationToken>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
            cancel: None,
        }
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Attach a cancellation token if one is configured
    pub fn with_optional_cancellation(mut self, token: Option<CancellationToken>) -> Self {
        self.cancel = token;
        self
    }

    /// Concatenated length of all message bodies, for estimates and logging
    pub fn prompt_len(&self) -> usize {
        self.messages.iter().map(|m| m.content.len()).sum()
    }
}

/// Complete (non-streaming) response
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    /// Total tokens billed for the call (prompt + completion)
    pub tokens: u64,
    pub finish_reason: Option<String>,
    /// Reasoning/thinking text, for providers that expose it
    pub reasoning: Option<String>,
}

impl Completion {
    pub fn new(content: impl Into<String>, tokens: u64) -> Self {
        Self {
            content: content.into(),
            tokens,
            finish_reason: Some("stop".into()),
            reasoning: None,
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }
}

/// Raw provider events, one JSON value per incremental event
pub type RawEventStream =
    Pin<Box<dyn Stream<Item = anyhow::Result<serde_json::Value>> + Send + 'static>>;

/// Trait for completion providers - the engine's only view of a model
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Provider tag used to pick a stream mapping (e.g. "openai", "anthropic")
    fn provider_tag(&self) -> &str;

    /// Send a completion request and wait for the full response
    async fn complete(&self, request: CompletionRequest) -> anyhow::Result<Completion>;

    /// Start a streaming completion
    async fn stream(&self, _request: CompletionRequest) -> anyhow::Result<RawEventStream> {
        Err(anyhow::anyhow!(
            "{} does not support streaming",
            self.provider_tag()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_provider_kind_parse() {
        assert_eq!(ProviderKind::from_str("openai").unwrap(), ProviderKind::OpenAi);
        assert_eq!(ProviderKind::from_str("DeepSeek").unwrap(), ProviderKind::DeepSeek);
        assert_eq!(ProviderKind::from_str("anthropic").unwrap(), ProviderKind::Anthropic);
        assert!(ProviderKind::from_str("acme").is_err());
    }

    #[test]
    fn test_provider_kind_display() {
        assert_eq!(ProviderKind::OpenRouter.to_string(), "openrouter");
        assert_eq!(ProviderKind::Gemini.as_ref(), "gemini");
    }

    #[test]
    fn test_openai_compatible_family() {
        assert!(ProviderKind::OpenAi.is_openai_compatible());
        assert!(ProviderKind::DeepSeek.is_openai_compatible());
        assert!(ProviderKind::OpenRouter.is_openai_compatible());
        assert!(!ProviderKind::Anthropic.is_openai_compatible());
        assert!(!ProviderKind::Gemini.is_openai_compatible());
    }

    #[test]
    fn test_request_builder() {
        let req = CompletionRequest::new("model", vec![Message::system("s"), Message::user("abc")])
            .with_max_tokens(1000)
            .with_temperature(Some(0.2));
        assert_eq!(req.max_tokens, Some(1000));
        assert_eq!(req.temperature, Some(0.2));
        assert_eq!(req.prompt_len(), 4);
        assert!(req.cancel.is_none());
    }
}
