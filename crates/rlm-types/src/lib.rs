// crates/rlm-types/src/lib.rs
// Shared output types for the RLM engine
// Serde only; UI and API layers depend on this without pulling in tokio

use serde::{Deserialize, Serialize};
use std::fmt;

// ═══════════════════════════════════════
// EXECUTION MODE
// ═══════════════════════════════════════

/// How a query was (or should be) answered
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Single completion call, no decomposition
    #[default]
    Simple,
    /// Planner -> workers -> aggregator pipeline
    Full,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Full => "full",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════
// OUTPUT CONTRACT
// ═══════════════════════════════════════

/// Final answer body
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputContent {
    pub markdown: String,
}

/// Where a reasoning summary came from.
///
/// `Model` is an explanation produced by the synthesis call itself;
/// `Proxy` is generated mechanically by the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningType {
    Model,
    Proxy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReasoningSummary {
    pub summary: String,
    #[serde(rename = "type")]
    pub kind: ReasoningType,
}

impl ReasoningSummary {
    pub fn model(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            kind: ReasoningType::Model,
        }
    }

    pub fn proxy(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            kind: ReasoningType::Proxy,
        }
    }
}

/// Execution metadata consumed by callers for observability and billing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetadata {
    pub mode: ExecutionMode,
    pub depth_used: u32,
    pub sub_calls: u32,
    pub cache_hits: u32,
    pub tokens_used: u64,
}

impl ExecutionMetadata {
    pub fn simple(tokens_used: u64) -> Self {
        Self {
            mode: ExecutionMode::Simple,
            tokens_used,
            ..Default::default()
        }
    }
}

/// The only artifact returned to external callers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RlmOutput {
    pub content: OutputContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ExecutionMetadata>,
}

impl RlmOutput {
    pub fn new(markdown: impl Into<String>) -> Self {
        Self {
            content: OutputContent {
                markdown: markdown.into(),
            },
            reasoning: None,
            metadata: None,
        }
    }

    pub fn with_reasoning(mut self, reasoning: Option<ReasoningSummary>) -> Self {
        self.reasoning = reasoning;
        self
    }

    pub fn with_metadata(mut self, metadata: ExecutionMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn markdown(&self) -> &str {
        &self.content.markdown
    }
}
