// crates/rlm-engine/src/aggregator.rs
// Combines worker results into the final output

use crate::config::ExecutionConfig;
use crate::llm::{self, CompletionProvider, CompletionRequest, Message, estimate_tokens};
use crate::prompts::AGGREGATOR_PROMPT;
use crate::error::RlmError;
use crate::stream::{StreamProcessor, StreamStatus, StreamUpdate};
use crate::worker::WorkerResult;
use rlm_types::{ExecutionMetadata, ExecutionMode, ReasoningSummary, RlmOutput};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Results at or below this confidence are left out of synthesis
pub const CONFIDENCE_FLOOR: f64 = 0.1;

/// Output of one aggregation, plus what the synthesis call cost
#[derive(Debug, Clone)]
pub struct Aggregation {
    pub output: RlmOutput,
    /// A live synthesis call was issued (successful or not)
    pub synthesis_call: bool,
    pub synthesis_tokens: u64,
}

impl Aggregation {
    fn local(output: RlmOutput) -> Self {
        Self {
            output,
            synthesis_call: false,
            synthesis_tokens: 0,
        }
    }
}

enum Plan<'a> {
    Passthrough(&'a WorkerResult),
    Unusable,
    Synthesize(Vec<&'a WorkerResult>),
}

pub struct Aggregator {
    provider: Arc<dyn CompletionProvider>,
    model: String,
    call_timeout: Duration,
    temperature: Option<f32>,
    expose_reasoning: bool,
    cancel: Option<CancellationToken>,
}

impl Aggregator {
    pub fn new(provider: Arc<dyn CompletionProvider>, config: &ExecutionConfig) -> Self {
        Self {
            provider,
            model: config.model().to_string(),
            call_timeout: config.call_timeout(),
            temperature: config.temperature(),
            expose_reasoning: config.expose_reasoning(),
            cancel: None,
        }
    }

    pub fn with_cancellation(mut self, token: Option<CancellationToken>) -> Self {
        self.cancel = token;
        self
    }

    /// Rough prompt cost of synthesizing `results`, for budget guards
    pub fn estimate_cost(query: &str, results: &[WorkerResult]) -> u64 {
        estimate_tokens(AGGREGATOR_PROMPT)
            + estimate_tokens(query)
            + results.iter().map(|r| estimate_tokens(&r.answer)).sum::<u64>()
    }

    /// `allow_synthesis = false` skips straight to the deterministic fallback
    pub async fn aggregate(
        &self,
        query: &str,
        results: &[WorkerResult],
        allow_synthesis: bool,
    ) -> Aggregation {
        let usable = match classify(results) {
            Plan::Passthrough(result) => return Aggregation::local(self.passthrough(result)),
            Plan::Unusable => return Aggregation::local(self.unusable(results.len())),
            Plan::Synthesize(usable) => usable,
        };
        if !allow_synthesis {
            debug!("Budget exhausted, skipping synthesis");
            return Aggregation::local(self.concatenate(&usable, results.len()));
        }

        self.synthesize(query, &usable, results.len()).await
    }

    /// One non-streaming synthesis call, concatenating on failure
    async fn synthesize(&self, query: &str, usable: &[&WorkerResult], attempted: usize) -> Aggregation {
        let request = self.synthesis_request(query, usable);
        match llm::invoke(self.provider.as_ref(), request, self.call_timeout, "aggregator").await {
            Ok(completion) if !completion.content.trim().is_empty() => {
                let reasoning = completion
                    .reasoning
                    .filter(|r| !r.trim().is_empty())
                    .map(ReasoningSummary::model)
                    .unwrap_or_else(|| synthesis_proxy(usable, attempted));
                Aggregation {
                    output: self.finish(completion.content, reasoning, attempted),
                    synthesis_call: true,
                    synthesis_tokens: completion.tokens,
                }
            }
            Ok(completion) => {
                warn!("Synthesis returned no content, using concatenation");
                Aggregation {
                    output: self.concatenate(usable, attempted),
                    synthesis_call: true,
                    synthesis_tokens: completion.tokens,
                }
            }
            Err(e) => {
                warn!(error = %e, "Synthesis failed, using concatenation");
                Aggregation {
                    output: self.concatenate(usable, attempted),
                    synthesis_call: true,
                    synthesis_tokens: 0,
                }
            }
        }
    }

    /// Same branching as [`aggregate`](Self::aggregate); only the synthesis
    /// branch streams. A provider that cannot stream gets one blocking
    /// synthesis call and a single `Complete` update.
    pub async fn aggregate_streaming<F>(
        &self,
        query: &str,
        results: &[WorkerResult],
        allow_synthesis: bool,
        mut on_update: F,
    ) -> Aggregation
    where
        F: FnMut(StreamUpdate) + Send,
    {
        let usable = match classify(results) {
            Plan::Passthrough(result) => return Aggregation::local(self.passthrough(result)),
            Plan::Unusable => return Aggregation::local(self.unusable(results.len())),
            Plan::Synthesize(usable) => usable,
        };
        if !allow_synthesis {
            return Aggregation::local(self.concatenate(&usable, results.len()));
        }

        let request = self.synthesis_request(query, &usable);
        let events = match llm::open_stream(
            self.provider.as_ref(),
            request,
            self.call_timeout,
            "aggregator",
        )
        .await
        {
            Ok(events) => events,
            Err(RlmError::Cancelled) => {
                return Aggregation {
                    output: self.concatenate(&usable, results.len()),
                    synthesis_call: true,
                    synthesis_tokens: 0,
                };
            }
            Err(e) => {
                warn!(error = %e, "Synthesis stream unavailable, retrying without streaming");
                let aggregation = self.synthesize(query, &usable, results.len()).await;
                on_update(StreamUpdate {
                    status: StreamStatus::Complete,
                    text: aggregation.output.markdown().to_string(),
                    thinking: String::new(),
                });
                return aggregation;
            }
        };

        let outcome = StreamProcessor::new()
            .with_cancellation(self.cancel.clone())
            .process(self.provider.provider_tag(), events, &mut on_update)
            .await;

        if outcome.text.trim().is_empty() {
            warn!("Synthesis stream produced no text, using concatenation");
            return Aggregation {
                output: self.concatenate(&usable, results.len()),
                synthesis_call: true,
                synthesis_tokens: outcome.tokens,
            };
        }

        let reasoning = if outcome.thinking.trim().is_empty() {
            synthesis_proxy(&usable, results.len())
        } else {
            ReasoningSummary::model(outcome.thinking)
        };
        Aggregation {
            output: self.finish(outcome.text, reasoning, results.len()),
            synthesis_call: true,
            synthesis_tokens: outcome.tokens,
        }
    }

    fn synthesis_request(&self, query: &str, usable: &[&WorkerResult]) -> CompletionRequest {
        let mut prompt = format!(
            "Original question: {query}\n\nAnswers to sub-questions, highest confidence first:\n"
        );
        for (i, result) in usable.iter().enumerate() {
            prompt.push_str(&format!(
                "\n### Sub-question {}: {}\nConfidence: {:.2}\n{}\n",
                i + 1,
                result.sub_query,
                result.confidence,
                result.answer.trim()
            ));
        }
        prompt.push_str("\nWrite the final answer to the original question.");

        CompletionRequest::new(
            self.model.clone(),
            vec![Message::system(AGGREGATOR_PROMPT), Message::user(prompt)],
        )
        .with_temperature(self.temperature)
        .with_optional_cancellation(self.cancel.clone())
    }

    fn passthrough(&self, result: &WorkerResult) -> RlmOutput {
        let reasoning = ReasoningSummary::proxy(format!(
            "Answered by a single sub-query with confidence {:.2}.",
            result.confidence
        ));
        self.finish(result.answer.clone(), reasoning, 1)
    }

    fn unusable(&self, attempted: usize) -> RlmOutput {
        let reasoning = ReasoningSummary::proxy(format!(
            "All {attempted} sub-queries returned low-confidence answers or errors."
        ));
        self.finish(unable_message(attempted), reasoning, attempted)
    }

    /// Never fails: no calls, no parsing
    fn concatenate(&self, usable: &[&WorkerResult], attempted: usize) -> RlmOutput {
        let markdown = usable
            .iter()
            .map(|r| format!("## {}\n\n{}", r.sub_query, r.answer.trim()))
            .collect::<Vec<_>>()
            .join("\n\n");
        let reasoning = ReasoningSummary::proxy(format!(
            "Synthesis unavailable; combined {} of {attempted} sub-answers ordered by confidence.",
            usable.len()
        ));
        self.finish(markdown, reasoning, attempted)
    }

    fn finish(&self, markdown: String, reasoning: ReasoningSummary, sub_calls: usize) -> RlmOutput {
        RlmOutput::new(markdown)
            .with_reasoning(self.expose_reasoning.then_some(reasoning))
            .with_metadata(ExecutionMetadata {
                mode: ExecutionMode::Full,
                sub_calls: sub_calls as u32,
                ..Default::default()
            })
    }
}

/// The fixed worst-case answer
pub fn unable_message(attempted: usize) -> String {
    format!(
        "Unable to generate a complete response. Attempted {attempted} sub-queries, \
         but none produced a usable answer."
    )
}

fn classify(results: &[WorkerResult]) -> Plan<'_> {
    let mut usable: Vec<&WorkerResult> = results
        .iter()
        .filter(|r| r.confidence > CONFIDENCE_FLOOR)
        .collect();
    if usable.is_empty() {
        return Plan::Unusable;
    }
    if results.len() == 1 {
        return Plan::Passthrough(&results[0]);
    }
    usable.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });
    Plan::Synthesize(usable)
}

fn synthesis_proxy(usable: &[&WorkerResult], attempted: usize) -> ReasoningSummary {
    let top = usable.first().map(|r| r.confidence).unwrap_or_default();
    ReasoningSummary::proxy(format!(
        "Synthesized {} of {attempted} sub-answers; highest confidence {top:.2}.",
        usable.len()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Completion;
    use crate::llm::testing::ScriptedProvider;
    use async_trait::async_trait;
    use futures::stream;
    use rlm_types::ReasoningType;
    use serde_json::json;

    fn result(sub_query: &str, answer: &str, confidence: f64) -> WorkerResult {
        WorkerResult {
            answer: answer.into(),
            confidence,
            sub_query: sub_query.into(),
            tokens_used: 10,
            from_cache: false,
        }
    }

    fn aggregator(provider: Arc<dyn CompletionProvider>, expose: bool) -> Aggregator {
        let config = ExecutionConfig::builder().expose_reasoning(expose).build();
        Aggregator::new(provider, &config)
    }

    // ============================================================================
    // Decision table
    // ============================================================================

    #[tokio::test]
    async fn test_single_result_passthrough() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let agg = aggregator(provider.clone(), true)
            .aggregate("q", &[result("sq", "Exactly this text.", 0.8)], true)
            .await;

        assert_eq!(agg.output.markdown(), "Exactly this text.");
        assert!(!agg.synthesis_call);
        assert_eq!(provider.call_count(), 0);
        let reasoning = agg.output.reasoning.unwrap();
        assert_eq!(reasoning.kind, ReasoningType::Proxy);
        assert!(reasoning.summary.contains("0.80"));
    }

    #[tokio::test]
    async fn test_all_low_confidence() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let results = [result("a", "?", 0.1), result("b", "failed", 0.0), result("c", "meh", 0.05)];
        let agg = aggregator(provider.clone(), false).aggregate("q", &results, true).await;

        assert!(agg.output.markdown().starts_with("Unable to generate a complete response"));
        assert!(agg.output.markdown().contains("Attempted 3 sub-queries"));
        assert_eq!(agg.output.metadata.unwrap().sub_calls, 3);
        assert!(agg.output.reasoning.is_none());
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_single_low_confidence_result_is_unusable() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let agg = aggregator(provider, false)
            .aggregate("q", &[result("a", "Unable to answer", 0.0)], true)
            .await;
        assert!(agg.output.markdown().starts_with("Unable to generate"));
    }

    #[tokio::test]
    async fn test_synthesis_orders_by_confidence_and_drops_floor() {
        let provider = Arc::new(ScriptedProvider::new(vec!["Combined answer."]));
        let results = [
            result("low", "ignore me", 0.05),
            result("mid", "middle", 0.6),
            result("high", "top", 0.9),
        ];
        let agg = aggregator(provider.clone(), true).aggregate("q", &results, true).await;

        assert_eq!(agg.output.markdown(), "Combined answer.");
        assert!(agg.synthesis_call);
        assert_eq!(agg.synthesis_tokens, 10);
        assert_eq!(agg.output.reasoning.unwrap().kind, ReasoningType::Proxy);

        let requests = provider.requests.lock().unwrap();
        let prompt = &requests[0].messages[1].content;
        assert!(prompt.find("top").unwrap() < prompt.find("middle").unwrap());
        assert!(!prompt.contains("ignore me"));
    }

    #[tokio::test]
    async fn test_model_reasoning_is_tagged_model() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        provider.push_completion(Completion::new("final", 20).with_reasoning("weighed both"));
        let results = [result("a", "x", 0.7), result("b", "y", 0.6)];
        let agg = aggregator(provider, true).aggregate("q", &results, true).await;

        let reasoning = agg.output.reasoning.unwrap();
        assert_eq!(reasoning.kind, ReasoningType::Model);
        assert_eq!(reasoning.summary, "weighed both");
    }

    #[tokio::test]
    async fn test_synthesis_failure_concatenates() {
        let provider = Arc::new(ScriptedProvider::failing());
        let results = [result("First?", "one", 0.5), result("Second?", "two", 0.9)];
        let agg = aggregator(provider, false).aggregate("q", &results, true).await;

        let md = agg.output.markdown();
        assert!(md.starts_with("## Second?\n\ntwo"));
        assert!(md.contains("## First?\n\none"));
        assert!(agg.synthesis_call);
        assert_eq!(agg.synthesis_tokens, 0);
    }

    #[tokio::test]
    async fn test_synthesis_disallowed_by_budget() {
        let provider = Arc::new(ScriptedProvider::new(vec!["never"]));
        let results = [result("a", "x", 0.7), result("b", "y", 0.6)];
        let agg = aggregator(provider.clone(), false).aggregate("q", &results, false).await;

        assert!(!agg.synthesis_call);
        assert_eq!(provider.call_count(), 0);
        assert!(agg.output.markdown().contains("## a"));
    }

    // ============================================================================
    // Streaming
    // ============================================================================

    struct StreamingProvider;

    #[async_trait]
    impl CompletionProvider for StreamingProvider {
        fn provider_tag(&self) -> &str {
            "anthropic"
        }

        async fn complete(&self, _request: CompletionRequest) -> anyhow::Result<Completion> {
            Err(anyhow::anyhow!("streaming only"))
        }

        async fn stream(&self, _request: CompletionRequest) -> anyhow::Result<llm::RawEventStream> {
            let events: Vec<anyhow::Result<serde_json::Value>> = vec![
                Ok(json!({"type": "content_block_delta", "delta": {"type": "thinking_delta", "thinking": "compare"}})),
                Ok(json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": "Streamed "}})),
                Ok(json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": "answer"}})),
                Ok(json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 12}})),
            ];
            Ok(Box::pin(stream::iter(events)))
        }
    }

    #[tokio::test]
    async fn test_streaming_synthesis() {
        let results = [result("a", "x", 0.7), result("b", "y", 0.6)];
        let mut updates = Vec::new();
        let agg = aggregator(Arc::new(StreamingProvider), true)
            .aggregate_streaming("q", &results, true, |u| updates.push(u))
            .await;

        assert_eq!(agg.output.markdown(), "Streamed answer");
        assert_eq!(agg.synthesis_tokens, 12);
        assert_eq!(agg.output.reasoning.unwrap().kind, ReasoningType::Model);
        assert_eq!(updates.last().unwrap().status, StreamStatus::Complete);
    }

    #[tokio::test]
    async fn test_streaming_passthrough_emits_nothing() {
        let mut updates = Vec::new();
        let agg = aggregator(Arc::new(StreamingProvider), false)
            .aggregate_streaming("q", &[result("a", "only", 0.9)], true, |u| updates.push(u))
            .await;
        assert_eq!(agg.output.markdown(), "only");
        assert!(updates.is_empty());
    }

    #[tokio::test]
    async fn test_streaming_unsupported_uses_blocking_synthesis() {
        let provider = Arc::new(ScriptedProvider::new(vec!["Synthesized without a stream."]));
        let results = [result("a", "x", 0.7), result("b", "y", 0.6)];
        let mut updates = Vec::new();
        let agg = aggregator(provider.clone(), false)
            .aggregate_streaming("q", &results, true, |u| updates.push(u))
            .await;

        assert_eq!(agg.output.markdown(), "Synthesized without a stream.");
        assert!(agg.synthesis_call);
        assert_eq!(agg.synthesis_tokens, 10);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].status, StreamStatus::Complete);
        assert_eq!(updates[0].text, "Synthesized without a stream.");
        // The failed stream open never reaches complete()
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_streaming_unsupported_and_failing_concatenates() {
        let provider = Arc::new(ScriptedProvider::failing());
        let results = [result("a", "x", 0.7), result("b", "y", 0.6)];
        let agg = aggregator(provider, false)
            .aggregate_streaming("q", &results, true, |_| {})
            .await;
        assert!(agg.output.markdown().starts_with("## a"));
    }
}
