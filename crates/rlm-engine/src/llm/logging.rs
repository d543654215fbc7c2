// crates/rlm-engine/src/llm/logging.rs
// Shared LLM call logging so every stage logs the same fields

use super::provider::{Completion, CompletionRequest};
use tracing::{debug, info, warn};

/// Log an outbound call before it is issued
pub fn log_request(request_id: &str, stage: &str, provider: &str, request: &CompletionRequest) {
    debug!(
        request_id = %request_id,
        stage = stage,
        provider = provider,
        model = %request.model,
        message_count = request.messages.len(),
        prompt_chars = request.prompt_len(),
        "Issuing completion request"
    );
}

/// Log completion summary for a call
pub fn log_completion(request_id: &str, stage: &str, duration_ms: u64, completion: &Completion) {
    info!(
        request_id = %request_id,
        stage = stage,
        duration_ms = duration_ms,
        content_len = completion.content.len(),
        reasoning_len = completion.reasoning.as_ref().map(|r| r.len()).unwrap_or(0),
        tokens = completion.tokens,
        finish_reason = ?completion.finish_reason,
        "{} call complete", stage
    );
}

/// Log a failed call. Failures are converted into degraded results by the
/// caller, so this is a warning rather than an error.
pub fn log_failure(request_id: &str, stage: &str, error: &str) {
    warn!(
        request_id = %request_id,
        stage = stage,
        error = error,
        "{} call failed", stage
    );
}
