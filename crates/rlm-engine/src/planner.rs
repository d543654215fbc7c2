// crates/rlm-engine/src/planner.rs
// Single-shot decomposition proposal; never executes anything

use crate::config::ExecutionConfig;
use crate::context::ContextBundle;
use crate::error::{Result, RlmError};
use crate::llm::{self, CompletionProvider, CompletionRequest, Message, estimate_tokens};
use crate::prompts::PLANNER_PROMPT;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const MAX_SUB_QUERIES: usize = 5;

/// Per-item cap for the context summary shown to the planner
pub const SUMMARY_CHARS_PER_ITEM: usize = 500;

const DEFAULT_PRIORITY: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubQuery {
    pub query: String,
    pub rationale: String,
    /// 1 (most important) to 5
    pub priority: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanResult {
    pub needs_sub_queries: bool,
    pub sub_queries: Vec<SubQuery>,
    pub can_answer_directly: bool,
    pub direct_answer: Option<String>,
    /// Tokens the planning call consumed, even if its output was unusable
    pub tokens_used: u64,
}

impl PlanResult {
    /// Neither decompose nor answer: the caller degrades to Simple mode
    pub fn fallback(tokens_used: u64) -> Self {
        Self {
            tokens_used,
            ..Default::default()
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RawPlan {
    #[serde(default)]
    needs_sub_queries: bool,
    #[serde(default)]
    sub_queries: Vec<RawSubQuery>,
    #[serde(default)]
    can_answer_directly: bool,
    #[serde(default)]
    direct_answer: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RawSubQuery {
    query: String,
    #[serde(default)]
    rationale: String,
    /// Models emit 2, 2.0 or "2"
    #[serde(default)]
    priority: Option<Value>,
}

pub struct Planner {
    provider: Arc<dyn CompletionProvider>,
    model: String,
    call_timeout: Duration,
    temperature: Option<f32>,
    cancel: Option<CancellationToken>,
}

impl Planner {
    pub fn new(provider: Arc<dyn CompletionProvider>, config: &ExecutionConfig) -> Self {
        Self {
            provider,
            model: config.model().to_string(),
            call_timeout: config.call_timeout(),
            temperature: config.temperature(),
            cancel: None,
        }
    }

    pub fn with_cancellation(mut self, token: Option<CancellationToken>) -> Self {
        self.cancel = token;
        self
    }

    /// Rough prompt cost of a planning call, for budget guards
    pub fn estimate_cost(query: &str, context: &ContextBundle) -> u64 {
        estimate_tokens(PLANNER_PROMPT)
            + estimate_tokens(&Self::user_prompt(query, context))
    }

    fn user_prompt(query: &str, context: &ContextBundle) -> String {
        let summary = if context.is_empty() {
            "(no context provided)".to_string()
        } else {
            context.summary(SUMMARY_CHARS_PER_ITEM)
        };
        format!(
            "Question: {query}\n\nAvailable context ({} items):\n{summary}",
            context.len()
        )
    }

    /// Ask for a plan. Any failure yields [`PlanResult::fallback`].
    pub async fn plan(&self, query: &str, context: &ContextBundle) -> PlanResult {
        let request = CompletionRequest::new(
            self.model.clone(),
            vec![
                Message::system(PLANNER_PROMPT),
                Message::user(Self::user_prompt(query, context)),
            ],
        )
        .with_temperature(self.temperature)
        .with_optional_cancellation(self.cancel.clone());

        let completion =
            match llm::invoke(self.provider.as_ref(), request, self.call_timeout, "planner").await {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "Planner call failed, falling back to simple execution");
                    return PlanResult::fallback(0);
                }
            };

        match parse_plan(&completion.content) {
            Ok(mut plan) => {
                plan.tokens_used = completion.tokens;
                debug!(
                    needs_sub_queries = plan.needs_sub_queries,
                    proposals = plan.sub_queries.len(),
                    can_answer_directly = plan.can_answer_directly,
                    "Plan parsed"
                );
                plan
            }
            Err(e) => {
                warn!(error = %e, "Unparseable plan, falling back to simple execution");
                PlanResult::fallback(completion.tokens)
            }
        }
    }
}

/// Parse and normalize planner output: keep the first five proposals,
/// clamp priorities to 1..=5, then sort ascending (stable).
pub fn parse_plan(content: &str) -> Result<PlanResult> {
    let raw: RawPlan = parse_json_hardened(content)?;

    let mut sub_queries: Vec<SubQuery> = raw
        .sub_queries
        .into_iter()
        .filter(|s| !s.query.trim().is_empty())
        .take(MAX_SUB_QUERIES)
        .map(|s| SubQuery {
            query: s.query.trim().to_string(),
            rationale: s.rationale,
            priority: priority_of(s.priority.as_ref()),
        })
        .collect();
    sub_queries.sort_by_key(|s| s.priority);

    let direct_answer = raw.direct_answer.filter(|a| !a.trim().is_empty());
    let can_answer_directly = raw.can_answer_directly && direct_answer.is_some();

    Ok(PlanResult {
        needs_sub_queries: raw.needs_sub_queries && !sub_queries.is_empty(),
        sub_queries,
        can_answer_directly,
        direct_answer,
        tokens_used: 0,
    })
}

fn priority_of(value: Option<&Value>) -> u8 {
    let n = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match n {
        Some(n) if n.is_finite() => n.round().clamp(1.0, 5.0) as u8,
        _ => DEFAULT_PRIORITY,
    }
}

// ═══════════════════════════════════════
// TOLERANT JSON
// ═══════════════════════════════════════

/// Direct parse, then fence-stripped, then the first balanced `{...}` block
pub fn parse_json_hardened<T: DeserializeOwned>(content: &str) -> Result<T> {
    let trimmed = content.trim();
    if let Ok(v) = serde_json::from_str::<T>(trimmed) {
        return Ok(v);
    }

    let unfenced = strip_code_fences(trimmed);
    if unfenced != trimmed {
        if let Ok(v) = serde_json::from_str::<T>(unfenced) {
            return Ok(v);
        }
    }

    if let Some(block) = first_object(trimmed) {
        if let Ok(v) = serde_json::from_str::<T>(block) {
            return Ok(v);
        }
    }

    let preview: String = trimmed.chars().take(200).collect();
    Err(RlmError::Parse(format!("no usable JSON object in: {preview}")))
}

fn strip_code_fences(s: &str) -> &str {
    let Some(rest) = s.strip_prefix("```") else {
        return s;
    };
    let Some(body) = rest.trim_end().strip_suffix("```") else {
        return s;
    };
    // Drop an info string such as `json`
    match body.split_once('\n') {
        Some((lang, tail)) if !lang.trim_start().starts_with('{') => tail.trim(),
        _ => body.trim(),
    }
}

fn first_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in s[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextItem;
    use crate::llm::testing::ScriptedProvider;

    const PLAN: &str = r#"{
        "needsSubQueries": true,
        "subQueries": [
            {"query": "What was revenue in 2023?", "rationale": "baseline", "priority": 2},
            {"query": "What drove growth?", "rationale": "causes", "priority": 1}
        ],
        "canAnswerDirectly": false
    }"#;

    // ============================================================================
    // Parsing
    // ============================================================================

    #[test]
    fn test_parse_sorts_by_priority() {
        let plan = parse_plan(PLAN).unwrap();
        assert!(plan.needs_sub_queries);
        assert_eq!(plan.sub_queries.len(), 2);
        assert_eq!(plan.sub_queries[0].query, "What drove growth?");
        assert_eq!(plan.sub_queries[1].priority, 2);
    }

    #[test]
    fn test_parse_fenced_output() {
        let fenced = format!("```json\n{PLAN}\n```");
        assert_eq!(parse_plan(&fenced).unwrap().sub_queries.len(), 2);

        let bare = format!("```\n{PLAN}\n```");
        assert_eq!(parse_plan(&bare).unwrap().sub_queries.len(), 2);
    }

    #[test]
    fn test_parse_with_surrounding_prose() {
        let chatty = format!("Sure, here is the plan:\n{PLAN}\nLet me know if that helps {{}}.");
        assert_eq!(parse_plan(&chatty).unwrap().sub_queries.len(), 2);
    }

    #[test]
    fn test_parse_discards_beyond_five_before_sorting() {
        let subs: Vec<String> = (0..7)
            .map(|i| format!(r#"{{"query": "q{i}", "priority": {}}}"#, 7 - i))
            .collect();
        let json = format!(r#"{{"needsSubQueries": true, "subQueries": [{}]}}"#, subs.join(","));
        let plan = parse_plan(&json).unwrap();

        let queries: Vec<_> = plan.sub_queries.iter().map(|s| s.query.as_str()).collect();
        // q0, q1, q2 clamp to 5; q3 is 4; q4 is 3. q5 and q6 never survive.
        assert_eq!(queries, vec!["q4", "q3", "q0", "q1", "q2"]);
    }

    #[test]
    fn test_priority_tolerance() {
        assert_eq!(priority_of(Some(&Value::from(0))), 1);
        assert_eq!(priority_of(Some(&Value::from(2.4))), 2);
        assert_eq!(priority_of(Some(&Value::from("4"))), 4);
        assert_eq!(priority_of(Some(&Value::from("high"))), DEFAULT_PRIORITY);
        assert_eq!(priority_of(None), DEFAULT_PRIORITY);
    }

    #[test]
    fn test_direct_answer_requires_text() {
        let plan = parse_plan(r#"{"canAnswerDirectly": true, "directAnswer": "  "}"#).unwrap();
        assert!(!plan.can_answer_directly);

        let plan = parse_plan(r#"{"canAnswerDirectly": true, "directAnswer": "Paris"}"#).unwrap();
        assert!(plan.can_answer_directly);
        assert_eq!(plan.direct_answer.as_deref(), Some("Paris"));
    }

    #[test]
    fn test_needs_sub_queries_without_proposals() {
        let plan = parse_plan(r#"{"needsSubQueries": true, "subQueries": []}"#).unwrap();
        assert!(!plan.needs_sub_queries);
    }

    #[test]
    fn test_garbage_is_parse_error() {
        assert!(matches!(parse_plan("no json here"), Err(RlmError::Parse(_))));
    }

    #[test]
    fn test_first_object_skips_braces_in_strings() {
        let s = r#"x {"a": "}{", "b": {"c": 1}} y"#;
        assert_eq!(first_object(s), Some(r#"{"a": "}{", "b": {"c": 1}}"#));
    }

    // ============================================================================
    // Planner calls
    // ============================================================================

    #[tokio::test]
    async fn test_plan_records_tokens() {
        let provider = Arc::new(ScriptedProvider::new(vec![PLAN]));
        let planner = Planner::new(provider.clone(), &ExecutionConfig::default());
        let context = ContextBundle::new(vec![ContextItem::context("x".repeat(2_000))]);

        let plan = planner.plan("Explain the growth", &context).await;
        assert_eq!(plan.sub_queries.len(), 2);
        assert_eq!(plan.tokens_used, 10);

        let requests = provider.requests.lock().unwrap();
        let user = &requests[0].messages[1].content;
        assert!(user.contains("Explain the growth"));
        assert!(user.len() < 2_000, "context summary must be truncated");
    }

    #[tokio::test]
    async fn test_malformed_plan_falls_back() {
        let provider = Arc::new(ScriptedProvider::new(vec!["I think we should look at revenue."]));
        let plan = Planner::new(provider, &ExecutionConfig::default())
            .plan("q", &ContextBundle::default())
            .await;
        assert!(!plan.needs_sub_queries);
        assert!(!plan.can_answer_directly);
        assert_eq!(plan.tokens_used, 10);
    }

    #[tokio::test]
    async fn test_provider_failure_falls_back() {
        let plan = Planner::new(Arc::new(ScriptedProvider::failing()), &ExecutionConfig::default())
            .plan("q", &ContextBundle::default())
            .await;
        assert_eq!(plan, PlanResult::fallback(0));
    }
}
