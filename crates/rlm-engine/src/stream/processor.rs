// crates/rlm-engine/src/stream/processor.rs
// Batched consumption of a normalized provider stream

use super::normalize::{StreamChunk, normalize_event};
use crate::llm::{RawEventStream, estimate_tokens};
use futures::StreamExt;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Thinking,
    Streaming,
    Complete,
}

/// Snapshot handed to the caller's callback. Text fields are cumulative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamUpdate {
    pub status: StreamStatus,
    pub text: String,
    pub thinking: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamOutcome {
    pub text: String,
    pub thinking: String,
    pub tokens: u64,
    pub stop_reason: Option<String>,
    /// Whether `tokens` came from the provider rather than the estimate
    pub reported_tokens: bool,
}

pub struct StreamProcessor {
    batch_size: usize,
    update_interval: Duration,
    cancel: Option<CancellationToken>,
}

impl Default for StreamProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamProcessor {
    pub fn new() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            cancel: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    pub fn with_cancellation(mut self, token: Option<CancellationToken>) -> Self {
        self.cancel = token;
        self
    }

    /// Drain `events`, calling `on_update` with batched snapshots.
    ///
    /// Updates arrive in order: one `Thinking`, at most one transition to
    /// `Streaming`, batched flushes, then exactly one `Complete`.
    pub async fn process<F>(
        &self,
        provider_tag: &str,
        mut events: RawEventStream,
        mut on_update: F,
    ) -> StreamOutcome
    where
        F: FnMut(StreamUpdate) + Send,
    {
        let mut state = BatchState::default();
        state.emit(&mut on_update);

        let mut ticker = tokio::time::interval(self.update_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let cancelled = async {
            match &self.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(cancelled);

        let mut terminal = false;
        loop {
            tokio::select! {
                biased;

                _ = &mut cancelled => {
                    debug!(provider = provider_tag, "Stream cancelled");
                    if state.stop_reason.is_none() {
                        state.stop_reason = Some("cancelled".to_string());
                    }
                    break;
                }

                next = events.next() => {
                    let event = match next {
                        None => break,
                        Some(Ok(event)) => event,
                        Some(Err(e)) => {
                            warn!(provider = provider_tag, error = %e, "Dropping stream transport error");
                            continue;
                        }
                    };
                    let chunks = match normalize_event(provider_tag, &event) {
                        Ok(chunks) => chunks,
                        Err(e) => {
                            warn!(provider = provider_tag, error = %e, "Dropping malformed stream chunk");
                            continue;
                        }
                    };
                    for chunk in chunks {
                        terminal |= chunk.is_complete;
                        state.apply(chunk, &mut on_update);
                    }
                    if state.pending >= self.batch_size {
                        state.emit(&mut on_update);
                    }
                    if terminal {
                        break;
                    }
                }

                _ = ticker.tick() => {
                    if state.pending > 0 {
                        state.emit(&mut on_update);
                    }
                }
            }
        }

        if terminal {
            self.read_usage_trailer(provider_tag, &mut events, &mut state).await;
        }

        state.status = StreamStatus::Complete;
        state.emit(&mut on_update);
        state.finish()
    }

    /// OpenAI-compatible streams report usage in a separate chunk after the
    /// finish chunk. Keep reading token counts until the stream ends or goes
    /// quiet for one update interval; any text after the terminal is ignored.
    async fn read_usage_trailer(
        &self,
        provider_tag: &str,
        events: &mut RawEventStream,
        state: &mut BatchState,
    ) {
        while let Ok(Some(next)) = tokio::time::timeout(self.update_interval, events.next()).await {
            let Ok(event) = next else {
                continue;
            };
            let Ok(chunks) = normalize_event(provider_tag, &event) else {
                continue;
            };
            for tokens in chunks.iter().filter_map(|c| c.token_count) {
                debug!(provider = provider_tag, tokens, "Usage reported after terminal chunk");
                state.reported_tokens = Some(tokens);
            }
        }
    }
}

struct BatchState {
    status: StreamStatus,
    text: String,
    thinking: String,
    pending: usize,
    reported_tokens: Option<u64>,
    stop_reason: Option<String>,
}

impl Default for BatchState {
    fn default() -> Self {
        Self {
            status: StreamStatus::Thinking,
            text: String::new(),
            thinking: String::new(),
            pending: 0,
            reported_tokens: None,
            stop_reason: None,
        }
    }
}

impl BatchState {
    fn apply<F: FnMut(StreamUpdate)>(&mut self, chunk: StreamChunk, on_update: &mut F) {
        if let Some(tokens) = chunk.token_count {
            self.reported_tokens = Some(tokens);
        }
        if chunk.stop_reason.is_some() {
            self.stop_reason = chunk.stop_reason;
        }
        if chunk.text.is_empty() {
            return;
        }

        if chunk.is_thinking {
            self.thinking.push_str(&chunk.text);
            self.pending += chunk.text.chars().count();
            return;
        }

        self.text.push_str(&chunk.text);
        if self.status == StreamStatus::Thinking {
            self.status = StreamStatus::Streaming;
            self.emit(on_update);
        } else {
            self.pending += chunk.text.chars().count();
        }
    }

    fn emit<F: FnMut(StreamUpdate)>(&mut self, on_update: &mut F) {
        self.pending = 0;
        on_update(StreamUpdate {
            status: self.status,
            text: self.text.clone(),
            thinking: self.thinking.clone(),
        });
    }

    fn finish(self) -> StreamOutcome {
        let (tokens, reported) = match self.reported_tokens {
            Some(tokens) => (tokens, true),
            None => (estimate_tokens(&self.text), false),
        };
        StreamOutcome {
            text: self.text,
            thinking: self.thinking,
            tokens,
            stop_reason: self.stop_reason,
            reported_tokens: reported,
        }
    }
}
