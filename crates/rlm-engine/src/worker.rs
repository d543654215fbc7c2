// crates/rlm-engine/src/worker.rs
// Answers one sub-question against a distilled context

use crate::cache::ResultCache;
use crate::config::ExecutionConfig;
use crate::context::{ContextBundle, Distiller};
use crate::llm::{self, CompletionProvider, CompletionRequest, Message};
use crate::prompts::WORKER_PROMPT;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Confidence assumed when the model reports none
pub const DEFAULT_CONFIDENCE: f64 = 0.5;

static STRUCTURED_RE: LazyLock<Regex> = LazyLock::new(|| {
    // SAFETY: static literal pattern; compilation cannot fail.
    #[allow(clippy::expect_used)]
    Regex::new(r"(?is)ANSWER:[\s*]*(.*?)[\s*]*CONFIDENCE:[\s*]*([0-9]*\.?[0-9]+)\s*(%)?")
        .expect("structured answer regex")
});

static TRAILING_CONFIDENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    // SAFETY: static literal pattern; compilation cannot fail.
    #[allow(clippy::expect_used)]
    Regex::new(r"(?i)[(*\s]*confidence\s*(?:level|score)?\s*[:=]?\s*\**\s*([0-9]*\.?[0-9]+)\s*(%)?[\s*).]*$")
        .expect("trailing confidence regex")
});

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerResult {
    pub answer: String,
    /// Self-reported, clamped to [0, 1]
    pub confidence: f64,
    pub sub_query: String,
    pub tokens_used: u64,
    pub from_cache: bool,
}

/// A worker either answered or failed; it never returns an error
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    Answered(WorkerResult),
    Failed { sub_query: String, reason: String },
}

impl WorkerOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Collapse to a result; failures become confidence 0, tokens 0
    pub fn into_result(self) -> WorkerResult {
        match self {
            Self::Answered(result) => result,
            Self::Failed { sub_query, reason } => WorkerResult {
                answer: format!("Unable to answer \"{sub_query}\": {reason}"),
                confidence: 0.0,
                sub_query,
                tokens_used: 0,
                from_cache: false,
            },
        }
    }
}

pub struct Worker {
    provider: Arc<dyn CompletionProvider>,
    distiller: Arc<dyn Distiller>,
    cache: Option<Arc<ResultCache>>,
    model: String,
    call_timeout: Duration,
    temperature: Option<f32>,
    budget_tokens: u64,
    cancel: Option<CancellationToken>,
}

impl Worker {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        distiller: Arc<dyn Distiller>,
        config: &ExecutionConfig,
    ) -> Self {
        Self {
            provider,
            distiller,
            cache: None,
            model: config.model().to_string(),
            call_timeout: config.call_timeout(),
            temperature: config.temperature(),
            budget_tokens: config.per_worker_budget(),
            cancel: None,
        }
    }

    pub fn with_cache(mut self, cache: Option<Arc<ResultCache>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_cancellation(mut self, token: Option<CancellationToken>) -> Self {
        self.cancel = token;
        self
    }

    pub fn budget_tokens(&self) -> u64 {
        self.budget_tokens
    }

    /// Cache key: the sub-question plus the context fingerprint
    pub fn cache_key(sub_query: &str, context: &ContextBundle) -> String {
        ResultCache::generate_hash(sub_query, &context.fingerprint())
    }

    pub async fn answer(&self, sub_query: &str, context: &ContextBundle) -> WorkerOutcome {
        let key = Self::cache_key(sub_query, context);
        if let Some(cache) = &self.cache {
            if let Some(mut hit) = cache.get(&key) {
                debug!(sub_query, "Worker answer served from cache");
                hit.tokens_used = 0;
                return WorkerOutcome::Answered(hit);
            }
        }

        let distilled = self.distiller.distill(context, self.budget_tokens);
        let user = if distilled.is_empty() {
            format!("Question: {sub_query}\n\nContext: (none provided)")
        } else {
            format!("Question: {sub_query}\n\nContext:\n{distilled}")
        };
        let request = CompletionRequest::new(
            self.model.clone(),
            vec![Message::system(WORKER_PROMPT), Message::user(user)],
        )
        .with_temperature(self.temperature)
        .with_optional_cancellation(self.cancel.clone());

        let completion =
            match llm::invoke(self.provider.as_ref(), request, self.call_timeout, "worker").await {
                Ok(c) => c,
                Err(e) => {
                    warn!(sub_query, error = %e, "Worker call failed");
                    return WorkerOutcome::Failed {
                        sub_query: sub_query.to_string(),
                        reason: e.to_string(),
                    };
                }
            };

        if completion.content.trim().is_empty() {
            return WorkerOutcome::Failed {
                sub_query: sub_query.to_string(),
                reason: "empty response".to_string(),
            };
        }

        let (answer, confidence) = parse_response(&completion.content);
        let result = WorkerResult {
            answer,
            confidence,
            sub_query: sub_query.to_string(),
            tokens_used: completion.tokens,
            from_cache: false,
        };

        if let Some(cache) = &self.cache {
            cache.set(&key, result.clone());
        }
        WorkerOutcome::Answered(result)
    }
}

/// Extract `(answer, confidence)` from a worker reply.
///
/// Tries `ANSWER:`/`CONFIDENCE:` first, then a trailing "confidence: N",
/// then gives up and returns the raw text at 0.5. Values above 1 are read
/// as percentages.
pub fn parse_response(raw: &str) -> (String, f64) {
    if let Some(caps) = STRUCTURED_RE.captures(raw) {
        let answer = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
        if !answer.is_empty() {
            let confidence = read_confidence(&caps[2], caps.get(3).is_some());
            return (answer.to_string(), confidence);
        }
    }

    if let Some(caps) = TRAILING_CONFIDENCE_RE.captures(raw.trim_end()) {
        let answer = raw[..caps.get(0).map(|m| m.start()).unwrap_or(raw.len())].trim();
        if !answer.is_empty() {
            let confidence = read_confidence(&caps[1], caps.get(2).is_some());
            return (answer.to_string(), confidence);
        }
    }

    (raw.trim().to_string(), DEFAULT_CONFIDENCE)
}

fn read_confidence(number: &str, percent: bool) -> f64 {
    let Ok(mut value) = number.parse::<f64>() else {
        return DEFAULT_CONFIDENCE;
    };
    if percent || value > 1.0 {
        value /= 100.0;
    }
    value.clamp(0.0, 1.0)
}
