// crates/rlm-engine/src/stream/normalize.rs
// Per-provider mapping of raw stream events into one canonical chunk

use crate::error::{Result, RlmError};
use crate::llm::ProviderKind;
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;
use tracing::warn;

/// Canonical incremental-output chunk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamChunk {
    pub text: String,
    pub is_thinking: bool,
    pub token_count: Option<u64>,
    pub is_complete: bool,
    pub stop_reason: Option<String>,
}

impl StreamChunk {
    fn text(text: String) -> Self {
        Self {
            text,
            ..Default::default()
        }
    }

    fn thinking(text: String) -> Self {
        Self {
            text,
            is_thinking: true,
            ..Default::default()
        }
    }

    /// Reasoning text (if any) followed by answer text (if any)
    fn split(thinking: String, text: String) -> Vec<Self> {
        let mut chunks = Vec::new();
        if !thinking.is_empty() {
            chunks.push(Self::thinking(thinking));
        }
        if !text.is_empty() {
            chunks.push(Self::text(text));
        }
        chunks
    }

    fn terminal(stop_reason: Option<String>, token_count: Option<u64>) -> Self {
        Self {
            is_complete: true,
            stop_reason,
            token_count,
            ..Default::default()
        }
    }
}

/// Map one raw event into zero or more chunks, in stream order. An empty
/// vec means the event carries nothing actionable. A single event may hold
/// both a thinking chunk and an answer chunk; thinking always comes first.
///
/// Unknown tags fall back to the OpenAI-compatible mapping.
pub fn normalize_event(provider_tag: &str, event: &Value) -> Result<Vec<StreamChunk>> {
    match ProviderKind::from_str(provider_tag) {
        Ok(ProviderKind::Anthropic) => normalize_anthropic(event),
        Ok(ProviderKind::Gemini) => normalize_gemini(event),
        Ok(_) => normalize_openai(event),
        Err(_) => {
            warn!(provider = provider_tag, "Unknown provider tag, using OpenAI-compatible stream mapping");
            normalize_openai(event)
        }
    }
}

// ============================================================================
// OpenAI-compatible (openai, deepseek, openrouter)
// ============================================================================

#[derive(Deserialize, Debug)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize, Debug)]
struct OpenAiStreamChoice {
    delta: Option<OpenAiStreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct OpenAiStreamDelta {
    content: Option<String>,
    /// DeepSeek reasoner channel
    reasoning_content: Option<String>,
    /// OpenRouter reasoning channel
    reasoning: Option<String>,
}

#[derive(Deserialize, Debug)]
struct OpenAiUsage {
    total_tokens: Option<u64>,
}

fn normalize_openai(event: &Value) -> Result<Vec<StreamChunk>> {
    if event.as_str() == Some("[DONE]") {
        return Ok(vec![StreamChunk::terminal(None, None)]);
    }
    if !event.is_object() {
        return Err(RlmError::Normalize(format!("expected object event, got {event}")));
    }

    let chunk: OpenAiStreamChunk =
        serde_json::from_value(event.clone()).map_err(|e| RlmError::Normalize(e.to_string()))?;
    let tokens = chunk.usage.and_then(|u| u.total_tokens);

    let Some(choice) = chunk.choices.into_iter().next() else {
        // Usage-only trailer
        return Ok(tokens
            .map(|t| StreamChunk {
                token_count: Some(t),
                ..Default::default()
            })
            .into_iter()
            .collect());
    };

    let (thinking, text) = match choice.delta {
        Some(delta) => (
            delta.reasoning_content.or(delta.reasoning).unwrap_or_default(),
            delta.content.unwrap_or_default(),
        ),
        None => (String::new(), String::new()),
    };

    match choice.finish_reason {
        Some(reason) => Ok(with_terminal(thinking, text, Some(reason), tokens)),
        None => Ok(StreamChunk::split(thinking, text)),
    }
}

/// Thinking (if any) then one terminal chunk carrying the final answer text
fn with_terminal(
    thinking: String,
    text: String,
    stop_reason: Option<String>,
    tokens: Option<u64>,
) -> Vec<StreamChunk> {
    let mut chunks = StreamChunk::split(thinking, String::new());
    let mut terminal = StreamChunk::terminal(stop_reason, tokens);
    terminal.text = text;
    chunks.push(terminal);
    chunks
}

// ============================================================================
// Anthropic (event-typed)
// ============================================================================

#[derive(Deserialize, Debug)]
struct AnthropicStreamEvent {
    #[serde(rename = "type")]
    event_type: String,
    delta: Option<AnthropicDelta>,
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize, Debug)]
struct AnthropicDelta {
    #[serde(rename = "type")]
    delta_type: Option<String>,
    text: Option<String>,
    thinking: Option<String>,
    stop_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct AnthropicUsage {
    output_tokens: Option<u64>,
}

fn normalize_anthropic(event: &Value) -> Result<Vec<StreamChunk>> {
    let event: AnthropicStreamEvent =
        serde_json::from_value(event.clone()).map_err(|e| RlmError::Normalize(e.to_string()))?;

    match event.event_type.as_str() {
        "content_block_delta" => {
            let Some(delta) = event.delta else {
                return Ok(Vec::new());
            };
            match delta.delta_type.as_deref() {
                Some("thinking_delta") => Ok(StreamChunk::split(
                    delta.thinking.unwrap_or_default(),
                    String::new(),
                )),
                Some("text_delta") => Ok(StreamChunk::split(
                    String::new(),
                    delta.text.unwrap_or_default(),
                )),
                _ => Ok(Vec::new()),
            }
        }
        "message_delta" => {
            let stop_reason = event.delta.and_then(|d| d.stop_reason);
            let tokens = event.usage.and_then(|u| u.output_tokens);
            match stop_reason {
                Some(reason) => Ok(vec![StreamChunk::terminal(Some(reason), tokens)]),
                None => Ok(Vec::new()),
            }
        }
        "message_stop" => Ok(vec![StreamChunk::terminal(None, None)]),
        // ping, message_start, content_block_start/stop
        _ => Ok(Vec::new()),
    }
}

// ============================================================================
// Gemini (candidate parts)
// ============================================================================

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GeminiStreamChunk {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Deserialize, Debug)]
struct GeminiPart {
    text: Option<String>,
    #[serde(default)]
    thought: bool,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    total_token_count: Option<u64>,
}

fn normalize_gemini(event: &Value) -> Result<Vec<StreamChunk>> {
    if !event.is_object() {
        return Err(RlmError::Normalize(format!("expected object event, got {event}")));
    }
    let chunk: GeminiStreamChunk =
        serde_json::from_value(event.clone()).map_err(|e| RlmError::Normalize(e.to_string()))?;
    let tokens = chunk.usage_metadata.and_then(|u| u.total_token_count);

    let Some(candidate) = chunk.candidates.into_iter().next() else {
        return Ok(Vec::new());
    };

    let mut thinking = String::new();
    let mut text = String::new();
    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
        let Some(part_text) = part.text else {
            continue;
        };
        if part.thought {
            thinking.push_str(&part_text);
        } else {
            text.push_str(&part_text);
        }
    }

    match candidate.finish_reason {
        Some(reason) => Ok(with_terminal(thinking, text, Some(reason), tokens)),
        None => Ok(StreamChunk::split(thinking, text)),
    }
}
