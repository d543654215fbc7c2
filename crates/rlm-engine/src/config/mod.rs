// crates/rlm-engine/src/config/mod.rs
// Execution configuration and shared constants

pub mod env;
pub mod file;

pub use file::RlmSettings;

use rlm_types::ExecutionMode;
use std::time::Duration;

/// Hard ceiling on decomposition depth, regardless of caller input
pub const HARD_MAX_DEPTH: u32 = 3;
/// Hard ceiling on child calls per depth, regardless of caller input
pub const HARD_MAX_CHILD_CALLS: u32 = 5;

pub const DEFAULT_TOKEN_BUDGET: u64 = 16_000;
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_PROVIDER: &str = "openai";
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration for one execution. Depth and child-call ceilings are
/// clamped on construction and cannot be changed afterwards.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    mode: Option<ExecutionMode>,
    max_depth: u32,
    max_child_calls: u32,
    token_budget: u64,
    enable_cache: bool,
    expose_reasoning: bool,
    model: String,
    provider: String,
    call_timeout: Duration,
    temperature: Option<f32>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ExecutionConfig {
    pub fn builder() -> ExecutionConfigBuilder {
        ExecutionConfigBuilder::default()
    }

    /// Explicit mode override; `None` selects the mode heuristically
    pub fn mode(&self) -> Option<ExecutionMode> {
        self.mode
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    pub fn max_child_calls(&self) -> u32 {
        self.max_child_calls
    }

    /// Ceiling on total model calls for one execution
    pub fn max_total_calls(&self) -> u32 {
        self.max_child_calls * self.max_depth
    }

    pub fn token_budget(&self) -> u64 {
        self.token_budget
    }

    /// Token budget for one worker, reserving headroom for synthesis
    pub fn per_worker_budget(&self) -> u64 {
        self.token_budget / (u64::from(self.max_child_calls) + 1)
    }

    pub fn enable_cache(&self) -> bool {
        self.enable_cache
    }

    pub fn expose_reasoning(&self) -> bool {
        self.expose_reasoning
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub fn temperature(&self) -> Option<f32> {
        self.temperature
    }

    /// Format as human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "mode={}, depth={}, child_calls={}, budget={}, cache={}, reasoning={}, model={}/{}",
            self.mode.map(|m| m.as_str()).unwrap_or("auto"),
            self.max_depth,
            self.max_child_calls,
            self.token_budget,
            if self.enable_cache { "on" } else { "off" },
            if self.expose_reasoning { "on" } else { "off" },
            self.provider,
            self.model,
        )
    }
}

/// Builder for ExecutionConfig
#[derive(Debug, Clone)]
pub struct ExecutionConfigBuilder {
    mode: Option<ExecutionMode>,
    max_depth: u32,
    max_child_calls: u32,
    token_budget: u64,
    enable_cache: bool,
    expose_reasoning: bool,
    model: String,
    provider: String,
    call_timeout: Duration,
    temperature: Option<f32>,
}

impl Default for ExecutionConfigBuilder {
    fn default() -> Self {
        Self {
            mode: Some(ExecutionMode::Simple),
            max_depth: HARD_MAX_DEPTH,
            max_child_calls: HARD_MAX_CHILD_CALLS,
            token_budget: DEFAULT_TOKEN_BUDGET,
            enable_cache: true,
            expose_reasoning: false,
            model: DEFAULT_MODEL.to_string(),
            provider: DEFAULT_PROVIDER.to_string(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            temperature: None,
        }
    }
}

impl ExecutionConfigBuilder {
    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Let the orchestrator pick the mode from query and context size
    pub fn auto_mode(mut self) -> Self {
        self.mode = None;
        self
    }

    pub fn max_depth(mut self, depth: u32) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn max_child_calls(mut self, calls: u32) -> Self {
        self.max_child_calls = calls;
        self
    }

    pub fn token_budget(mut self, budget: u64) -> Self {
        self.token_budget = budget;
        self
    }

    pub fn enable_cache(mut self, enable: bool) -> Self {
        self.enable_cache = enable;
        self
    }

    pub fn expose_reasoning(mut self, expose: bool) -> Self {
        self.expose_reasoning = expose;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature.clamp(0.0, 2.0));
        self
    }

    pub fn build(self) -> ExecutionConfig {
        ExecutionConfig {
            mode: self.mode,
            max_depth: self.max_depth.clamp(1, HARD_MAX_DEPTH),
            max_child_calls: self.max_child_calls.clamp(1, HARD_MAX_CHILD_CALLS),
            token_budget: self.token_budget,
            enable_cache: self.enable_cache,
            expose_reasoning: self.expose_reasoning,
            model: self.model,
            provider: self.provider,
            call_timeout: self.call_timeout,
            temperature: self.temperature,
        }
    }
}

/// Prompt environment settings
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    /// Fixed window size for map-reduce chunks, in bytes of context text
    pub chunk_size: usize,
    /// Maximum slice queries in flight at once
    pub concurrency: usize,
    /// Margin on each side of a keyword hit for `filter`
    pub filter_context_chars: usize,
    /// Below this estimate, environment execution uses a single call
    pub simple_threshold_tokens: u64,
    /// Characters of a slice that feed its cache key
    pub cache_prefix_chars: usize,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            chunk_size: 4_000,
            concurrency: 3,
            filter_context_chars: 200,
            simple_threshold_tokens: 2_000,
            cache_prefix_chars: 1_000,
        }
    }
}

/// Result cache settings
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            ttl: Duration::from_secs(60 * 60),
        }
    }
}
