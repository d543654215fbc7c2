// crates/rlm-engine/src/environment/mod.rs
// Addressable view over the context: slice it, query slices, map-reduce

mod pattern;

pub use pattern::{DEFAULT_SECTION_RE, MAX_PATTERN_LEN, compile_pattern, validate_pattern};

use crate::budget::BudgetManager;
use crate::cache::ResultCache;
use crate::config::{DEFAULT_CALL_TIMEOUT, DEFAULT_MODEL, EnvironmentConfig};
use crate::context::ContextBundle;
use crate::error::{Result, RlmError};
use crate::llm::{self, CompletionProvider, CompletionRequest, Message, estimate_tokens};
use crate::prompts::ENVIRONMENT_QUERY_PROMPT;
use crate::worker::WorkerResult;
use futures::{StreamExt, stream};
use regex::{Regex, RegexBuilder};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A window into the environment text. `start`/`end` are byte offsets into
/// the full text and always fall on char boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSlice {
    pub text: String,
    pub start: usize,
    pub end: usize,
}

impl ContextSlice {
    /// A slice not backed by the environment text (e.g. joined partial answers)
    pub fn detached(text: impl Into<String>) -> Self {
        let text = text.into();
        let end = text.len();
        Self { text, start: 0, end }
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Boundary used by [`PromptEnvironment::split`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delimiter {
    Literal(String),
    /// Regex, validated before compilation
    Pattern(String),
}

/// Answer to one slice query
#[derive(Debug, Clone, PartialEq)]
pub struct QueryAnswer {
    pub answer: String,
    pub tokens_used: u64,
    pub from_cache: bool,
}

impl From<WorkerResult> for QueryAnswer {
    fn from(result: WorkerResult) -> Self {
        Self {
            answer: result.answer,
            tokens_used: result.tokens_used,
            from_cache: result.from_cache,
        }
    }
}

/// Totals for a map-reduce run
#[derive(Debug, Clone, PartialEq)]
pub struct MapReduceOutcome {
    pub answer: String,
    pub tokens_used: u64,
    /// Live provider calls, map and reduce together
    pub live_calls: u32,
    pub cache_hits: u32,
    /// Map slices that produced a usable partial answer
    pub parts: usize,
}

pub struct PromptEnvironment {
    text: String,
    provider: Arc<dyn CompletionProvider>,
    cache: Option<Arc<ResultCache>>,
    config: EnvironmentConfig,
    model: String,
    call_timeout: Duration,
    temperature: Option<f32>,
    cancel: Option<CancellationToken>,
}

impl PromptEnvironment {
    pub fn new(
        context: &ContextBundle,
        provider: Arc<dyn CompletionProvider>,
        config: EnvironmentConfig,
    ) -> Self {
        Self::from_text(context.to_text(), provider, config)
    }

    pub fn from_text(
        text: impl Into<String>,
        provider: Arc<dyn CompletionProvider>,
        config: EnvironmentConfig,
    ) -> Self {
        Self {
            text: text.into(),
            provider,
            cache: None,
            config,
            model: DEFAULT_MODEL.to_string(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            temperature: None,
            cancel: None,
        }
    }

    pub fn with_cache(mut self, cache: Option<Arc<ResultCache>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_cancellation(mut self, token: Option<CancellationToken>) -> Self {
        self.cancel = token;
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn estimated_tokens(&self) -> u64 {
        estimate_tokens(&self.text)
    }

    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    // ═══════════════════════════════════════
    // ADDRESSING
    // ═══════════════════════════════════════

    /// Bytes `[start, end)`, clamped to the text and snapped back to char boundaries
    pub fn slice(&self, start: usize, end: usize) -> ContextSlice {
        let end = floor_boundary(&self.text, end.min(self.text.len()));
        let start = floor_boundary(&self.text, start.min(end));
        ContextSlice {
            text: self.text[start..end].to_string(),
            start,
            end,
        }
    }

    pub fn head(&self, n: usize) -> ContextSlice {
        self.slice(0, n)
    }

    pub fn tail(&self, n: usize) -> ContextSlice {
        let start = ceil_boundary(&self.text, self.text.len().saturating_sub(n));
        self.slice(start, self.text.len())
    }

    /// The `index`-th fixed window of `size` bytes, if it exists
    pub fn chunk(&self, index: usize, size: usize) -> Option<ContextSlice> {
        self.chunks(size).into_iter().nth(index)
    }

    /// Consecutive, non-overlapping windows covering the whole text
    pub fn chunks(&self, size: usize) -> Vec<ContextSlice> {
        let size = size.max(1);
        let mut out = Vec::new();
        let mut start = 0;
        while start < self.text.len() {
            let mut end = floor_boundary(&self.text, (start + size).min(self.text.len()));
            if end <= start {
                // A single char wider than `size`
                end = ceil_boundary(&self.text, start + 1);
            }
            out.push(self.slice(start, end));
            start = end;
        }
        out
    }

    /// Split on a literal or pattern boundary. Blank segments are dropped;
    /// offsets point back into the full text.
    pub fn split(&self, delimiter: &Delimiter) -> Result<Vec<ContextSlice>> {
        let boundaries: Vec<(usize, usize)> = match delimiter {
            Delimiter::Literal(lit) => {
                if lit.is_empty() {
                    return Err(RlmError::UnsafePattern("empty delimiter".into()));
                }
                self.text
                    .match_indices(lit.as_str())
                    .map(|(i, m)| (i, i + m.len()))
                    .collect()
            }
            Delimiter::Pattern(pattern) => {
                let re = compile_pattern(pattern)?;
                re.find_iter(&self.text)
                    .filter(|m| !m.is_empty())
                    .map(|m| (m.start(), m.end()))
                    .collect()
            }
        };

        let mut out = Vec::new();
        let mut cursor = 0;
        for (start, end) in boundaries {
            self.push_segment(&mut out, cursor, start);
            cursor = end;
        }
        self.push_segment(&mut out, cursor, self.text.len());
        Ok(out)
    }

    /// Split on a recurring marker; each section starts at its marker.
    /// Non-blank text before the first marker becomes its own section.
    pub fn split_by_sections(&self, pattern: &str) -> Result<Vec<ContextSlice>> {
        let re = compile_pattern(pattern)?;
        Ok(self.sections_with(&re))
    }

    fn sections_with(&self, re: &Regex) -> Vec<ContextSlice> {
        let mut starts: Vec<usize> = re.find_iter(&self.text).map(|m| m.start()).collect();
        if starts.first() != Some(&0) {
            starts.insert(0, 0);
        }
        starts.dedup();

        let mut out = Vec::new();
        for (i, &start) in starts.iter().enumerate() {
            let end = starts.get(i + 1).copied().unwrap_or(self.text.len());
            self.push_segment(&mut out, start, end);
        }
        out
    }

    /// Case-insensitive keyword windows with `margin` bytes either side.
    /// Overlapping windows are merged.
    pub fn filter(&self, keyword: &str, margin: usize) -> Vec<ContextSlice> {
        let Some(re) = keyword_regex(keyword) else {
            return Vec::new();
        };

        let mut windows: Vec<(usize, usize)> = Vec::new();
        for m in re.find_iter(&self.text) {
            let start = m.start().saturating_sub(margin);
            let end = (m.end() + margin).min(self.text.len());
            match windows.last_mut() {
                Some(last) if start <= last.1 => last.1 = last.1.max(end),
                _ => windows.push((start, end)),
            }
        }

        windows
            .into_iter()
            .map(|(start, end)| {
                self.slice(
                    floor_boundary(&self.text, start),
                    ceil_boundary(&self.text, end),
                )
            })
            .collect()
    }

    /// The section whose heading mentions `keyword`, else the first keyword window
    pub fn find_section(&self, keyword: &str) -> Option<ContextSlice> {
        let re = keyword_regex(keyword)?;
        let by_heading = self.sections_with(&DEFAULT_SECTION_RE).into_iter().find(|section| {
            let heading = section.text.lines().next().unwrap_or_default();
            DEFAULT_SECTION_RE.is_match(heading) && re.is_match(heading)
        });
        by_heading.or_else(|| {
            self.filter(keyword, self.config.filter_context_chars)
                .into_iter()
                .next()
        })
    }

    fn push_segment(&self, out: &mut Vec<ContextSlice>, start: usize, end: usize) {
        if start < end && !self.text[start..end].trim().is_empty() {
            out.push(self.slice(start, end));
        }
    }

    // ═══════════════════════════════════════
    // QUERYING
    // ═══════════════════════════════════════

    /// Answer `template` from `slice` only (the whole text when `None`).
    /// Cached by template plus a bounded prefix of the slice.
    pub async fn query(&self, template: &str, slice: Option<&ContextSlice>) -> Result<QueryAnswer> {
        let material = slice.map(|s| s.text.as_str()).unwrap_or(&self.text);
        let hash = self.cache_key(template, material);

        if let Some(cache) = &self.cache {
            if let Some(mut hit) = cache.get(&hash) {
                debug!(template_len = template.len(), "Environment query served from cache");
                hit.tokens_used = 0;
                return Ok(hit.into());
            }
        }

        let request = CompletionRequest::new(
            self.model.clone(),
            vec![
                Message::system(ENVIRONMENT_QUERY_PROMPT),
                Message::user(format!(
                    "{template}\n\n<context_slice>\n{material}\n</context_slice>"
                )),
            ],
        )
        .with_temperature(self.temperature)
        .with_optional_cancellation(self.cancel.clone());

        let completion =
            llm::invoke(self.provider.as_ref(), request, self.call_timeout, "environment").await?;

        let result = WorkerResult {
            answer: completion.content,
            confidence: 1.0,
            sub_query: template.to_string(),
            tokens_used: completion.tokens,
            from_cache: false,
        };
        if let Some(cache) = &self.cache {
            cache.set(&hash, result.clone());
        }
        Ok(result.into())
    }

    /// Query every slice with at most `concurrency` calls in flight.
    /// Results come back in slice order.
    pub async fn query_all(
        &self,
        template: &str,
        slices: &[ContextSlice],
        concurrency: usize,
    ) -> Vec<Result<QueryAnswer>> {
        stream::iter(slices.iter().map(|slice| self.query(template, Some(slice))))
            .buffered(concurrency.max(1))
            .collect()
            .await
    }

    /// Map `map_query` over slices (default: fixed chunks), then reduce the
    /// labeled partial answers with one more query. No budget applies.
    pub async fn map_reduce(
        &self,
        map_query: &str,
        reduce_query: &str,
        slices: Option<Vec<ContextSlice>>,
    ) -> Result<MapReduceOutcome> {
        self.map_reduce_within(map_query, reduce_query, slices, &mut BudgetManager::unlimited())
            .await
    }

    /// As [`map_reduce`](Self::map_reduce), with every live call approved by
    /// `budget` first. Map queries run in waves of `concurrency`; a slice is
    /// admitted only while its estimated cost fits alongside the rest of the
    /// wave and one reserved reduce call. Once nothing more fits, the parts
    /// collected so far are reduced.
    pub async fn map_reduce_within(
        &self,
        map_query: &str,
        reduce_query: &str,
        slices: Option<Vec<ContextSlice>>,
        budget: &mut BudgetManager,
    ) -> Result<MapReduceOutcome> {
        let slices = slices.unwrap_or_else(|| self.chunks(self.config.chunk_size));
        let wave_size = self.config.concurrency.max(1);
        let reduce_reserve = query_cost(reduce_query, "");
        info!(
            slices = slices.len(),
            concurrency = wave_size,
            remaining = budget.remaining(),
            "Starting map-reduce"
        );

        let mut outcome = MapReduceOutcome {
            answer: String::new(),
            tokens_used: 0,
            live_calls: 0,
            cache_hits: 0,
            parts: 0,
        };
        let mut partials = Vec::new();
        let mut attempted = 0;
        let mut next = 0;

        while next < slices.len() {
            let mut reserved = reduce_reserve;
            let mut wave_end = next;
            while wave_end < slices.len() && wave_end - next < wave_size {
                let cost = query_cost(map_query, &slices[wave_end].text);
                let calls_needed = (wave_end - next) as u32 + 2;
                if budget.calls_remaining() < calls_needed || !budget.can_afford(reserved + cost) {
                    break;
                }
                reserved += cost;
                wave_end += 1;
            }
            if wave_end == next {
                info!(
                    mapped = next,
                    skipped = slices.len() - next,
                    remaining = budget.remaining(),
                    "Budget exhausted, reducing collected parts"
                );
                break;
            }

            let wave = &slices[next..wave_end];
            let results = self.query_all(map_query, wave, wave_size).await;
            for (offset, result) in results.into_iter().enumerate() {
                let part = next + offset + 1;
                attempted += 1;
                match result {
                    Ok(answer) => {
                        if !answer.from_cache {
                            budget.consume(answer.tokens_used);
                        }
                        outcome.record(&answer);
                        partials.push(format!("### Part {part}\n{}", answer.answer.trim()));
                    }
                    Err(e) => {
                        budget.consume(0);
                        warn!(part, error = %e, "Map query failed, skipping part");
                    }
                }
            }
            next = wave_end;
        }

        if partials.is_empty() {
            return Err(RlmError::Provider(format!(
                "no usable map answers ({attempted} of {} slices attempted)",
                slices.len()
            )));
        }
        outcome.parts = partials.len();

        let combined = ContextSlice::detached(partials.join("\n\n"));
        if !budget.can_make_call() || !budget.can_afford(query_cost(reduce_query, &combined.text)) {
            warn!(parts = outcome.parts, "Reduce step not affordable, returning partial answers");
            outcome.answer = combined.text;
            return Ok(outcome);
        }

        let reduced = self.query(reduce_query, Some(&combined)).await;
        let reduced = match reduced {
            Ok(answer) => answer,
            Err(e) => {
                budget.consume(0);
                return Err(e);
            }
        };
        if !reduced.from_cache {
            budget.consume(reduced.tokens_used);
        }
        outcome.record(&reduced);
        outcome.answer = reduced.answer;

        info!(
            parts = outcome.parts,
            live_calls = outcome.live_calls,
            tokens = outcome.tokens_used,
            "Map-reduce complete"
        );
        Ok(outcome)
    }

    fn cache_key(&self, template: &str, material: &str) -> String {
        let end = ceil_boundary(material, self.config.cache_prefix_chars.min(material.len()));
        // Length keeps equal-prefix slices apart
        let key = format!("{}{}", &material[..end], material.len());
        ResultCache::generate_hash(template, &key)
    }
}

impl MapReduceOutcome {
    fn record(&mut self, answer: &QueryAnswer) {
        self.tokens_used += answer.tokens_used;
        if answer.from_cache {
            self.cache_hits += 1;
        } else {
            self.live_calls += 1;
        }
    }
}

/// Estimated prompt tokens of one environment query over `material`
fn query_cost(template: &str, material: &str) -> u64 {
    estimate_tokens(ENVIRONMENT_QUERY_PROMPT) + estimate_tokens(template) + estimate_tokens(material)
}

fn keyword_regex(keyword: &str) -> Option<Regex> {
    if keyword.trim().is_empty() {
        return None;
    }
    RegexBuilder::new(&regex::escape(keyword))
        .case_insensitive(true)
        .build()
        .ok()
}

fn floor_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}
