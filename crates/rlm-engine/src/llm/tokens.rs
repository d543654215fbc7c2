// crates/rlm-engine/src/llm/tokens.rs
// Character-based token estimation (~4 chars per token)

/// Estimate token count for a string
pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    (text.len() as u64).div_ceil(4)
}

/// Truncate text to roughly `max_tokens`, cutting on a char boundary
pub fn truncate_to_tokens(text: &str, max_tokens: u64) -> &str {
    let max_bytes = usize::try_from(max_tokens.saturating_mul(4)).unwrap_or(usize::MAX);
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
