// crates/rlm-engine/src/context.rs
// Context bundle supplied by the caller, plus budget-bound distillation

use crate::llm::{estimate_tokens, truncate_to_tokens};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Characters of each item kept in the cache fingerprint
const FINGERPRINT_ITEM_CHARS: usize = 100;

const TRUNCATION_MARKER: &str = "\n[Context truncated to fit token budget]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextRole {
    System,
    User,
    Assistant,
    Context,
}

impl ContextRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Context => "context",
        }
    }
}

impl fmt::Display for ContextRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One role-tagged piece of context material
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextItem {
    pub role: ContextRole,
    pub content: String,
    /// Caller-provided token length, preferred over the estimate
    #[serde(default)]
    pub token_hint: Option<u64>,
}

impl ContextItem {
    pub fn new(role: ContextRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            token_hint: None,
        }
    }

    pub fn context(content: impl Into<String>) -> Self {
        Self::new(ContextRole::Context, content)
    }

    pub fn with_token_hint(mut self, tokens: u64) -> Self {
        self.token_hint = Some(tokens);
        self
    }

    pub fn tokens(&self) -> u64 {
        self.token_hint
            .unwrap_or_else(|| estimate_tokens(&self.content))
    }

    fn render(&self) -> String {
        format!("[{}]\n{}", self.role, self.content)
    }
}

/// Ordered, immutable context for one execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextBundle {
    items: Vec<ContextItem>,
}

impl ContextBundle {
    pub fn new(items: Vec<ContextItem>) -> Self {
        Self { items }
    }

    pub fn items(&self) -> &[ContextItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn estimated_tokens(&self) -> u64 {
        self.items.iter().map(ContextItem::tokens).sum()
    }

    /// Bounded representation for cache keys: each item's first 100 chars
    /// plus its full length, so equal prefixes with different lengths differ.
    pub fn fingerprint(&self) -> String {
        let mut fp = String::new();
        for item in &self.items {
            let prefix: String = item.content.chars().take(FINGERPRINT_ITEM_CHARS).collect();
            fp.push_str(&prefix);
            fp.push_str(&item.content.len().to_string());
        }
        fp
    }

    /// Planner-facing summary with each item truncated to `max_chars_per_item`
    pub fn summary(&self, max_chars_per_item: usize) -> String {
        self.items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let mut text: String = item.content.chars().take(max_chars_per_item).collect();
                if text.len() < item.content.len() {
                    text.push_str("...");
                }
                format!("[{}] ({}) {}", i + 1, item.role, text)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Full text of every item, in order
    pub fn to_text(&self) -> String {
        self.items
            .iter()
            .map(ContextItem::render)
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

impl FromIterator<ContextItem> for ContextBundle {
    fn from_iter<T: IntoIterator<Item = ContextItem>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Reduces a context bundle to fit a token budget
pub trait Distiller: Send + Sync {
    fn distill(&self, context: &ContextBundle, budget_tokens: u64) -> String;
}

/// Keeps items in order until the budget runs out, truncating the item
/// that crosses the line.
#[derive(Debug, Clone, Copy, Default)]
pub struct TruncatingDistiller;

impl Distiller for TruncatingDistiller {
    fn distill(&self, context: &ContextBundle, budget_tokens: u64) -> String {
        let mut out = String::new();
        let mut remaining = budget_tokens;

        for item in context.items() {
            let rendered = item.render();
            let cost = estimate_tokens(&rendered);
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            if cost <= remaining {
                out.push_str(&rendered);
                remaining -= cost;
                continue;
            }
            // Only bother with a partial item if a meaningful slice fits
            if remaining > 8 {
                out.push_str(truncate_to_tokens(&rendered, remaining));
            }
            out.push_str(TRUNCATION_MARKER);
            return out;
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(parts: &[&str]) -> ContextBundle {
        parts.iter().map(|p| ContextItem::context(*p)).collect()
    }

    #[test]
    fn test_estimated_tokens_prefers_hints() {
        let ctx = ContextBundle::new(vec![
            ContextItem::context("abcdefgh"),
            ContextItem::context("x").with_token_hint(500),
        ]);
        assert_eq!(ctx.estimated_tokens(), 2 + 500);
    }

    #[test]
    fn test_fingerprint_distinguishes_lengths() {
        let base = "a".repeat(150);
        let longer = "a".repeat(151);
        let fp1 = bundle(&[&base]).fingerprint();
        let fp2 = bundle(&[&longer]).fingerprint();
        assert_ne!(fp1, fp2);
        assert!(fp1.len() <= FINGERPRINT_ITEM_CHARS + 4);
    }

    #[test]
    fn test_fingerprint_distinguishes_prefixes() {
        assert_ne!(
            bundle(&["alpha content"]).fingerprint(),
            bundle(&["gamma content"]).fingerprint()
        );
    }

    #[test]
    fn test_summary_truncates_items() {
        let ctx = bundle(&["short", &"y".repeat(50)]);
        let summary = ctx.summary(10);
        assert!(summary.contains("[1] (context) short"));
        assert!(summary.contains(&format!("{}...", "y".repeat(10))));
    }

    #[test]
    fn test_distill_within_budget_keeps_everything() {
        let ctx = bundle(&["first", "second"]);
        let out = TruncatingDistiller.distill(&ctx, 1_000);
        assert!(out.contains("first"));
        assert!(out.contains("second"));
        assert!(!out.contains("truncated"));
    }

    #[test]
    fn test_distill_truncates_when_over_budget() {
        let ctx = bundle(&["keep me", &"z".repeat(4_000), "never reached"]);
        let out = TruncatingDistiller.distill(&ctx, 100);
        assert!(out.contains("keep me"));
        assert!(out.contains("[Context truncated"));
        assert!(!out.contains("never reached"));
        assert!(estimate_tokens(&out) <= 100 + estimate_tokens(TRUNCATION_MARKER) + 1);
    }

    #[test]
    fn test_empty_bundle() {
        let ctx = ContextBundle::default();
        assert!(ctx.is_empty());
        assert_eq!(ctx.estimated_tokens(), 0);
        assert_eq!(ctx.fingerprint(), "");
        assert_eq!(TruncatingDistiller.distill(&ctx, 10), "");
    }
}
