// crates/rlm-engine/src/lib.rs
// RLM - recursive query orchestration over any LLM provider

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod aggregator;
pub mod budget;
pub mod cache;
pub mod config;
pub mod context;
pub mod environment;
pub mod error;
pub mod llm;
pub mod orchestrator;
pub mod planner;
pub mod prompts;
pub mod stream;
pub mod worker;

pub use aggregator::Aggregator;
pub use budget::BudgetManager;
pub use cache::{CacheStats, CachedResult, ResultCache};
pub use config::{CacheConfig, EnvironmentConfig, ExecutionConfig, RlmSettings};
pub use context::{ContextBundle, ContextItem, ContextRole, Distiller, TruncatingDistiller};
pub use environment::{ContextSlice, Delimiter, PromptEnvironment};
pub use error::{Result, RlmError};
pub use llm::{
    Completion, CompletionProvider, CompletionRequest, Message, ProviderKind, ProviderResolver,
    StaticResolver,
};
pub use orchestrator::{ExecutionState, Orchestrator, Phase, StopReason};
pub use planner::{PlanResult, Planner, SubQuery};
pub use stream::{StreamChunk, StreamOutcome, StreamProcessor, StreamStatus, StreamUpdate};
pub use worker::{Worker, WorkerOutcome, WorkerResult};

pub use rlm_types::{
    ExecutionMetadata, ExecutionMode, OutputContent, ReasoningSummary, ReasoningType, RlmOutput,
};
