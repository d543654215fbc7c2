// crates/rlm-engine/src/orchestrator.rs
// Mode selection, budget-gated decomposition, and final output assembly

use crate::aggregator::{Aggregator, unable_message};
use crate::budget::BudgetManager;
use crate::cache::ResultCache;
use crate::config::{EnvironmentConfig, ExecutionConfig};
use crate::context::{ContextBundle, Distiller, TruncatingDistiller};
use crate::environment::PromptEnvironment;
use crate::llm::{self, CompletionProvider, CompletionRequest, Message, ProviderResolver, estimate_tokens};
use crate::planner::{MAX_SUB_QUERIES, Planner};
use crate::prompts::SIMPLE_PROMPT;
use crate::stream::StreamUpdate;
use crate::worker::{Worker, WorkerResult};
use rlm_types::{ExecutionMetadata, ExecutionMode, ReasoningSummary, RlmOutput};
use std::sync::Arc;
use strum::Display;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, info, instrument, warn};
use uuid::Uuid;

/// Auto mode picks Simple below this many context tokens...
pub const SIMPLE_CONTEXT_TOKENS: u64 = 2_000;
/// ...when there are at most this many items
pub const SIMPLE_MAX_ITEMS: usize = 5;
/// Queries shorter than this always go Simple in auto mode
pub const SHORT_QUERY_CHARS: usize = 40;
/// A live worker answer at or above this stops dispatch
pub const HIGH_CONFIDENCE: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Phase {
    Idle,
    ModeSelected,
    SimpleExecute,
    Planning,
    DispatchingWorkers,
    Aggregating,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum StopReason {
    #[strum(serialize = "budget")]
    Budget,
    #[strum(serialize = "high confidence")]
    HighConfidence,
}

/// Call-scoped state; one per execution, never shared
#[derive(Debug, Clone)]
pub struct ExecutionState {
    pub execution_id: String,
    pub phase: Phase,
    pub mode: Option<ExecutionMode>,
    pub depth: u32,
    pub results: Vec<WorkerResult>,
    pub cache_hits: u32,
    pub stopped_early: bool,
    pub stop_reason: Option<StopReason>,
}

impl ExecutionState {
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            phase: Phase::Idle,
            mode: None,
            depth: 0,
            results: Vec::new(),
            cache_hits: 0,
            stopped_early: false,
            stop_reason: None,
        }
    }

    pub fn transition(&mut self, next: Phase) {
        debug!(
            execution_id = %self.execution_id,
            from = %self.phase,
            to = %next,
            "Phase transition"
        );
        self.phase = next;
    }

    fn stop(&mut self, reason: StopReason) {
        info!(execution_id = %self.execution_id, reason = %reason, "Stopped early");
        self.stopped_early = true;
        self.stop_reason = Some(reason);
    }
}

type UpdateSink<'a> = Option<&'a mut (dyn FnMut(StreamUpdate) + Send)>;

/// Entry point. Construct once with a shared cache; every `execute*` call
/// gets its own budget and state.
pub struct Orchestrator {
    resolver: Arc<dyn ProviderResolver>,
    cache: Arc<ResultCache>,
    distiller: Arc<dyn Distiller>,
    env_config: EnvironmentConfig,
}

impl Orchestrator {
    pub fn new(resolver: Arc<dyn ProviderResolver>, cache: Arc<ResultCache>) -> Self {
        Self {
            resolver,
            cache,
            distiller: Arc::new(TruncatingDistiller),
            env_config: EnvironmentConfig::default(),
        }
    }

    pub fn with_distiller(mut self, distiller: Arc<dyn Distiller>) -> Self {
        self.distiller = distiller;
        self
    }

    pub fn with_environment_config(mut self, config: EnvironmentConfig) -> Self {
        self.env_config = config;
        self
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// Heuristic used when no mode is configured
    pub fn select_mode(query: &str, context: &ContextBundle) -> ExecutionMode {
        let small_context = context.estimated_tokens() < SIMPLE_CONTEXT_TOKENS
            && context.len() <= SIMPLE_MAX_ITEMS;
        let short_query = query.trim().chars().count() < SHORT_QUERY_CHARS;
        if small_context || short_query {
            ExecutionMode::Simple
        } else {
            ExecutionMode::Full
        }
    }

    /// Answer `query`. Never fails; the worst case is the fixed
    /// "Unable to generate" markdown.
    #[instrument(skip(self, context, config), fields(execution_id, query_len = query.len()))]
    pub async fn execute(
        &self,
        query: &str,
        context: &ContextBundle,
        config: &ExecutionConfig,
    ) -> RlmOutput {
        self.run(query, context, config, None, None).await
    }

    /// As [`execute`](Self::execute), aborting outstanding calls when `cancel` fires
    #[instrument(skip(self, context, config, cancel), fields(execution_id, query_len = query.len()))]
    pub async fn execute_cancellable(
        &self,
        query: &str,
        context: &ContextBundle,
        config: &ExecutionConfig,
        cancel: CancellationToken,
    ) -> RlmOutput {
        self.run(query, context, config, Some(cancel), None).await
    }

    /// As [`execute`](Self::execute), streaming the synthesis step through `on_update`
    #[instrument(skip(self, context, config, on_update), fields(execution_id, query_len = query.len()))]
    pub async fn execute_streaming<F>(
        &self,
        query: &str,
        context: &ContextBundle,
        config: &ExecutionConfig,
        mut on_update: F,
    ) -> RlmOutput
    where
        F: FnMut(StreamUpdate) + Send,
    {
        self.run(query, context, config, None, Some(&mut on_update)).await
    }

    /// Bypass planning for oversized contexts: map-reduce over fixed chunks.
    /// Map calls are approved against the execution budget; once it runs
    /// out the collected parts are reduced. Falls back to
    /// [`execute`](Self::execute) if map-reduce fails.
    #[instrument(skip(self, context, config), fields(execution_id, query_len = query.len()))]
    pub async fn execute_with_environment(
        &self,
        query: &str,
        context: &ContextBundle,
        config: &ExecutionConfig,
    ) -> RlmOutput {
        let execution_id = Uuid::new_v4().to_string();
        Span::current().record("execution_id", execution_id.as_str());

        let provider = match self.resolver.resolve(config.provider(), config.model()) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "No provider for environment execution");
                return unresolved_output();
            }
        };

        let env = PromptEnvironment::new(context, provider.clone(), self.env_config.clone())
            .with_cache(config.enable_cache().then(|| self.cache.clone()))
            .with_model(config.model())
            .with_call_timeout(config.call_timeout())
            .with_temperature(config.temperature());

        let estimated = env.estimated_tokens();
        if estimated < self.env_config.simple_threshold_tokens {
            debug!(estimated, "Environment small enough for a single call");
            let mut state = ExecutionState::new(execution_id);
            let mut budget = BudgetManager::from_config(config);
            state.mode = Some(ExecutionMode::Simple);
            state.transition(Phase::ModeSelected);
            return self
                .run_simple(query, context, &provider, config, &mut budget, &mut state, None)
                .await;
        }

        info!(estimated, chunk_size = self.env_config.chunk_size, "Running map-reduce over environment");
        let map_query = format!(
            "Extract everything in this section that helps answer the question: {query}"
        );
        let reduce_query = format!(
            "Using the partial findings below, answer the question: {query}"
        );

        let mut budget = BudgetManager::from_config(config);
        match env.map_reduce_within(&map_query, &reduce_query, None, &mut budget).await {
            Ok(outcome) => {
                let reasoning = ReasoningSummary::proxy(format!(
                    "Answered by map-reduce over {} context slices.",
                    outcome.parts
                ));
                info!(
                    parts = outcome.parts,
                    calls = budget.calls_made(),
                    tokens = budget.tokens_used(),
                    "Environment execution complete"
                );
                RlmOutput::new(outcome.answer)
                    .with_reasoning(config.expose_reasoning().then_some(reasoning))
                    .with_metadata(ExecutionMetadata {
                        mode: ExecutionMode::Full,
                        depth_used: 1,
                        // Map parts are slices, not planned sub-queries
                        sub_calls: 0,
                        cache_hits: outcome.cache_hits,
                        tokens_used: budget.tokens_used(),
                    })
            }
            Err(e) => {
                warn!(error = %e, "Map-reduce failed, falling back to standard execution");
                self.run(query, context, config, None, None).await
            }
        }
    }

    async fn run(
        &self,
        query: &str,
        context: &ContextBundle,
        config: &ExecutionConfig,
        cancel: Option<CancellationToken>,
        updates: UpdateSink<'_>,
    ) -> RlmOutput {
        let execution_id = Uuid::new_v4().to_string();
        Span::current().record("execution_id", execution_id.as_str());
        let mut state = ExecutionState::new(execution_id);
        let mut budget = BudgetManager::from_config(config);

        let provider = match self.resolver.resolve(config.provider(), config.model()) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Could not resolve a completion provider");
                return unresolved_output();
            }
        };

        let mode = config
            .mode()
            .unwrap_or_else(|| Self::select_mode(query, context));
        state.mode = Some(mode);
        state.transition(Phase::ModeSelected);
        info!(
            mode = %mode,
            context_items = context.len(),
            config = %config.summary(),
            "Execution started"
        );

        let output = match mode {
            ExecutionMode::Simple => {
                self.run_simple(query, context, &provider, config, &mut budget, &mut state, cancel)
                    .await
            }
            ExecutionMode::Full => {
                self.run_full(query, context, &provider, config, &mut budget, &mut state, cancel, updates)
                    .await
            }
        };

        info!(
            phase = %state.phase,
            tokens_used = budget.tokens_used(),
            calls = budget.calls_made(),
            cache_hits = state.cache_hits,
            "Execution finished"
        );
        output
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_simple(
        &self,
        query: &str,
        context: &ContextBundle,
        provider: &Arc<dyn CompletionProvider>,
        config: &ExecutionConfig,
        budget: &mut BudgetManager,
        state: &mut ExecutionState,
        cancel: Option<CancellationToken>,
    ) -> RlmOutput {
        state.transition(Phase::SimpleExecute);

        let context_tokens = context.estimated_tokens();
        let material = if context.is_empty() {
            String::new()
        } else if budget.should_summarize(context_tokens) {
            debug!(context_tokens, "Distilling context for simple execution");
            self.distiller.distill(context, budget.remaining() / 2)
        } else {
            context.to_text()
        };
        let user = if material.is_empty() {
            query.to_string()
        } else {
            format!("Context:\n{material}\n\nQuestion: {query}")
        };

        let request = CompletionRequest::new(
            config.model(),
            vec![Message::system(SIMPLE_PROMPT), Message::user(user)],
        )
        .with_temperature(config.temperature())
        .with_optional_cancellation(cancel);

        let output = match llm::invoke(provider.as_ref(), request, config.call_timeout(), "simple").await {
            Ok(completion) => {
                budget.consume(completion.tokens);
                let reasoning = completion.reasoning.map(ReasoningSummary::model);
                RlmOutput::new(completion.content)
                    .with_reasoning(reasoning.filter(|_| config.expose_reasoning()))
            }
            Err(e) => {
                warn!(error = %e, "Simple execution failed");
                RlmOutput::new(unable_message(0))
            }
        };

        state.transition(Phase::Done);
        output.with_metadata(ExecutionMetadata {
            mode: ExecutionMode::Simple,
            depth_used: state.depth,
            sub_calls: 0,
            cache_hits: 0,
            tokens_used: budget.tokens_used(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_full(
        &self,
        query: &str,
        context: &ContextBundle,
        provider: &Arc<dyn CompletionProvider>,
        config: &ExecutionConfig,
        budget: &mut BudgetManager,
        state: &mut ExecutionState,
        cancel: Option<CancellationToken>,
        updates: UpdateSink<'_>,
    ) -> RlmOutput {
        let planning_cost = Planner::estimate_cost(query, context);
        if state.depth >= config.max_depth()
            || !budget.can_make_call()
            || !budget.can_afford(planning_cost)
        {
            info!(
                depth = state.depth,
                remaining = budget.remaining(),
                "Full mode not affordable, degrading to simple"
            );
            return self
                .run_simple(query, context, provider, config, budget, state, cancel)
                .await;
        }

        state.transition(Phase::Planning);
        state.depth += 1;
        let plan = Planner::new(provider.clone(), config)
            .with_cancellation(cancel.clone())
            .plan(query, context)
            .await;
        budget.consume(plan.tokens_used);

        if plan.can_answer_directly {
            if let Some(answer) = plan.direct_answer {
                state.transition(Phase::Done);
                let reasoning = ReasoningSummary::proxy("Planner answered directly without sub-queries.");
                return RlmOutput::new(answer)
                    .with_reasoning(config.expose_reasoning().then_some(reasoning))
                    .with_metadata(ExecutionMetadata {
                        mode: ExecutionMode::Full,
                        depth_used: state.depth,
                        sub_calls: 0,
                        cache_hits: 0,
                        tokens_used: budget.tokens_used(),
                    });
            }
        }
        if !plan.needs_sub_queries {
            info!("Planner proposed no sub-queries, degrading to simple");
            return self
                .run_simple(query, context, provider, config, budget, state, cancel)
                .await;
        }

        state.transition(Phase::DispatchingWorkers);
        let worker = Worker::new(provider.clone(), self.distiller.clone(), config)
            .with_cache(config.enable_cache().then(|| self.cache.clone()))
            .with_cancellation(cancel.clone());
        let limit = (config.max_child_calls() as usize).min(MAX_SUB_QUERIES);
        let worker_context = context.estimated_tokens().min(worker.budget_tokens());

        for sub in plan.sub_queries.iter().take(limit) {
            let estimate = estimate_tokens(&sub.query) + worker_context;
            if !budget.can_make_call() || !budget.can_afford(estimate) {
                state.stop(StopReason::Budget);
                break;
            }

            let result = worker.answer(&sub.query, context).await.into_result();
            let confidence = result.confidence;
            let live = !result.from_cache;
            if live {
                budget.consume(result.tokens_used);
            } else {
                state.cache_hits += 1;
            }
            debug!(
                sub_query = %sub.query,
                priority = sub.priority,
                confidence,
                from_cache = !live,
                "Sub-query answered"
            );
            state.results.push(result);

            if live && confidence >= HIGH_CONFIDENCE {
                state.stop(StopReason::HighConfidence);
                break;
            }
        }

        state.transition(Phase::Aggregating);
        let aggregator = Aggregator::new(provider.clone(), config).with_cancellation(cancel);
        let allow_synthesis = budget.can_make_call()
            && budget.can_afford(Aggregator::estimate_cost(query, &state.results));
        let aggregation = match updates {
            Some(sink) => {
                aggregator
                    .aggregate_streaming(query, &state.results, allow_synthesis, sink)
                    .await
            }
            None => aggregator.aggregate(query, &state.results, allow_synthesis).await,
        };
        if aggregation.synthesis_call {
            budget.consume(aggregation.synthesis_tokens);
        }

        let mut output = aggregation.output;
        if let (Some(reason), Some(reasoning)) = (state.stop_reason, output.reasoning.as_mut()) {
            reasoning.summary.push_str(&format!(" Stopped early: {reason}."));
        }
        state.transition(Phase::Done);

        output.with_metadata(ExecutionMetadata {
            mode: ExecutionMode::Full,
            depth_used: state.depth,
            sub_calls: state.results.len() as u32,
            cache_hits: state.cache_hits,
            tokens_used: budget.tokens_used(),
        })
    }
}

fn unresolved_output() -> RlmOutput {
    RlmOutput::new(unable_message(0)).with_metadata(ExecutionMetadata::simple(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextItem;
    use crate::llm::StaticResolver;
    use crate::llm::testing::ScriptedProvider;

    fn orchestrator(provider: Arc<ScriptedProvider>) -> Orchestrator {
        Orchestrator::new(
            Arc::new(StaticResolver::new(provider)),
            Arc::new(ResultCache::default()),
        )
    }

    fn full_config() -> ExecutionConfig {
        ExecutionConfig::builder().mode(ExecutionMode::Full).build()
    }

    fn large_context() -> ContextBundle {
        (0..8)
            .map(|i| ContextItem::context(format!("Quarter {i}: {}", "revenue detail ".repeat(100))))
            .collect()
    }

    const TWO_STEP_PLAN: &str = r#"{"needsSubQueries": true, "subQueries": [
        {"query": "What happened first?", "rationale": "order", "priority": 1},
        {"query": "What happened next?", "rationale": "order", "priority": 2}
    ]}"#;

    #[test]
    fn test_select_mode_heuristics() {
        let tiny = ContextBundle::new(vec![ContextItem::context("small")]);
        assert_eq!(Orchestrator::select_mode("What is the capital of France?", &tiny), ExecutionMode::Simple);

        let long_query = "Compare the revenue trends across every quarter and explain the drivers";
        assert_eq!(Orchestrator::select_mode(long_query, &large_context()), ExecutionMode::Full);
        assert_eq!(Orchestrator::select_mode("Summarize", &large_context()), ExecutionMode::Simple);
        assert_eq!(Orchestrator::select_mode(long_query, &tiny), ExecutionMode::Simple);
    }

    #[test]
    fn test_phase_and_stop_reason_display() {
        assert_eq!(Phase::DispatchingWorkers.to_string(), "dispatching-workers");
        assert_eq!(StopReason::HighConfidence.to_string(), "high confidence");
        assert_eq!(StopReason::Budget.to_string(), "budget");
    }

    #[tokio::test]
    async fn test_simple_mode_single_call() {
        let provider = Arc::new(ScriptedProvider::new(vec!["Paris"]));
        let output = orchestrator(provider.clone())
            .execute("What is the capital of France?", &ContextBundle::default(), &ExecutionConfig::default())
            .await;

        assert_eq!(output.markdown(), "Paris");
        let meta = output.metadata.unwrap();
        assert_eq!(meta.mode, ExecutionMode::Simple);
        assert_eq!(meta.sub_calls, 0);
        assert_eq!(meta.tokens_used, 10);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_simple_failure_is_fixed_message() {
        let output = orchestrator(Arc::new(ScriptedProvider::failing()))
            .execute("q", &ContextBundle::default(), &ExecutionConfig::default())
            .await;
        assert!(output.markdown().starts_with("Unable to generate a complete response"));
    }

    #[tokio::test]
    async fn test_direct_answer_records_no_sub_calls() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            r#"{"canAnswerDirectly": true, "directAnswer": "42"}"#,
        ]));
        let output = orchestrator(provider.clone())
            .execute("q", &large_context(), &full_config())
            .await;

        assert_eq!(output.markdown(), "42");
        let meta = output.metadata.unwrap();
        assert_eq!(meta.mode, ExecutionMode::Full);
        assert_eq!(meta.sub_calls, 0);
        assert_eq!(meta.depth_used, 1);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_unparseable_plan_degrades_to_simple() {
        let provider = Arc::new(ScriptedProvider::new(vec!["not json", "simple answer"]));
        let output = orchestrator(provider.clone())
            .execute("q", &large_context(), &full_config())
            .await;

        assert_eq!(output.markdown(), "simple answer");
        let meta = output.metadata.unwrap();
        assert_eq!(meta.mode, ExecutionMode::Simple);
        assert_eq!(meta.tokens_used, 20);
    }

    #[tokio::test]
    async fn test_full_pipeline_synthesizes() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            TWO_STEP_PLAN,
            "ANSWER: first thing\nCONFIDENCE: 0.8",
            "ANSWER: second thing\nCONFIDENCE: 0.7",
            "Combined story.",
        ]));
        let config = ExecutionConfig::builder()
            .mode(ExecutionMode::Full)
            .expose_reasoning(true)
            .build();
        let output = orchestrator(provider.clone())
            .execute("Tell the story", &large_context(), &config)
            .await;

        assert_eq!(output.markdown(), "Combined story.");
        let meta = output.metadata.unwrap();
        assert_eq!(meta.sub_calls, 2);
        assert_eq!(meta.depth_used, 1);
        assert_eq!(meta.tokens_used, 40);
        assert!(output.reasoning.is_some());
        assert_eq!(provider.call_count(), 4);
    }

    #[tokio::test]
    async fn test_zero_budget_degrades_before_planning() {
        let provider = Arc::new(ScriptedProvider::new(vec!["fallback answer"]));
        let config = ExecutionConfig::builder()
            .mode(ExecutionMode::Full)
            .token_budget(0)
            .build();
        let output = orchestrator(provider.clone())
            .execute("q", &large_context(), &config)
            .await;

        assert_eq!(output.markdown(), "fallback answer");
        assert_eq!(output.metadata.unwrap().mode, ExecutionMode::Simple);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_streaming_without_stream_support_still_synthesizes() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            TWO_STEP_PLAN,
            "ANSWER: a\nCONFIDENCE: 0.8",
            "ANSWER: b\nCONFIDENCE: 0.7",
            "Combined story.",
        ]));
        let mut updates = 0;
        let output = orchestrator(provider.clone())
            .execute_streaming("q", &large_context(), &full_config(), |_| updates += 1)
            .await;

        assert_eq!(output.markdown(), "Combined story.");
        assert_eq!(updates, 1);
        assert_eq!(output.metadata.unwrap().tokens_used, 40);
        assert_eq!(provider.call_count(), 4);
    }

    #[tokio::test]
    async fn test_unresolvable_provider() {
        struct NoProviders;
        impl ProviderResolver for NoProviders {
            fn resolve(&self, provider: &str, model: &str) -> crate::error::Result<Arc<dyn CompletionProvider>> {
                Err(crate::error::RlmError::NoProvider {
                    provider: provider.into(),
                    model: model.into(),
                })
            }
        }
        let orch = Orchestrator::new(Arc::new(NoProviders), Arc::new(ResultCache::default()));
        let output = orch.execute("q", &ContextBundle::default(), &ExecutionConfig::default()).await;
        assert!(output.markdown().starts_with("Unable to generate"));
    }
}
