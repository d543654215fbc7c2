// crates/rlm-engine/src/budget.rs
// Token and call budget for one execution

use crate::config::ExecutionConfig;
use tracing::debug;

/// Any single slice larger than this should be summarized before use
pub const SUMMARIZE_THRESHOLD_TOKENS: u64 = 4_000;

/// Tracks token and call consumption against fixed ceilings.
///
/// Only answers questions; it never rejects a `consume`. Callers check
/// `can_afford` / `can_make_call` first and decide what to do with `false`.
#[derive(Debug, Clone)]
pub struct BudgetManager {
    tokens_used: u64,
    token_budget: u64,
    calls_made: u32,
    max_calls: u32,
    summarize_threshold: u64,
}

impl BudgetManager {
    pub fn new(token_budget: u64, max_calls: u32) -> Self {
        Self {
            tokens_used: 0,
            token_budget,
            calls_made: 0,
            max_calls,
            summarize_threshold: SUMMARIZE_THRESHOLD_TOKENS,
        }
    }

    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self::new(config.token_budget(), config.max_total_calls())
    }

    /// No token or call ceiling
    pub fn unlimited() -> Self {
        Self::new(u64::MAX, u32::MAX)
    }

    pub fn with_summarize_threshold(mut self, threshold: u64) -> Self {
        self.summarize_threshold = threshold;
        self
    }

    pub fn can_afford(&self, estimated_tokens: u64) -> bool {
        self.tokens_used.saturating_add(estimated_tokens) <= self.token_budget
    }

    pub fn can_make_call(&self) -> bool {
        self.calls_made < self.max_calls
    }

    /// Record one completed call
    pub fn consume(&mut self, actual_tokens: u64) {
        self.tokens_used = self.tokens_used.saturating_add(actual_tokens);
        self.calls_made += 1;
        debug!(
            tokens = actual_tokens,
            tokens_used = self.tokens_used,
            token_budget = self.token_budget,
            calls_made = self.calls_made,
            "Budget consumed"
        );
    }

    /// True if the slice is over the fixed threshold, or would eat more
    /// than half of what is left.
    pub fn should_summarize(&self, slice_tokens: u64) -> bool {
        slice_tokens > self.summarize_threshold || slice_tokens > self.remaining() / 2
    }

    pub fn reset(&mut self) {
        self.tokens_used = 0;
        self.calls_made = 0;
    }

    pub fn remaining(&self) -> u64 {
        self.token_budget.saturating_sub(self.tokens_used)
    }

    pub fn tokens_used(&self) -> u64 {
        self.tokens_used
    }

    pub fn calls_made(&self) -> u32 {
        self.calls_made
    }

    pub fn calls_remaining(&self) -> u32 {
        self.max_calls.saturating_sub(self.calls_made)
    }
}
