// crates/rlm-engine/src/environment/pattern.rs
// Guard for caller-supplied split patterns

use crate::error::{Result, RlmError};
use regex::{Regex, RegexBuilder};
use std::sync::LazyLock;

pub const MAX_PATTERN_LEN: usize = 200;

/// Compiled program ceiling, well under the regex crate default
const COMPILED_SIZE_LIMIT: usize = 1 << 20;

/// Markdown headings and "Chapter N" markers at line start
pub static DEFAULT_SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    // SAFETY: static literal pattern; compilation cannot fail.
    #[allow(clippy::expect_used)]
    Regex::new(r"(?mi)^(?:#{1,6}\s|chapter\s+\w+)").expect("section regex")
});

/// Reject patterns that are too long or quantify an already-quantified group
/// such as `(a+)+` or `(\w*)*`.
pub fn validate_pattern(pattern: &str) -> Result<()> {
    if pattern.is_empty() {
        return Err(RlmError::UnsafePattern("empty pattern".into()));
    }
    if pattern.chars().count() > MAX_PATTERN_LEN {
        return Err(RlmError::UnsafePattern(format!(
            "pattern exceeds {MAX_PATTERN_LEN} characters"
        )));
    }

    // One flag per open group: does it contain a repeat?
    let mut groups: Vec<bool> = Vec::new();
    let mut in_class = false;
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\\' {
            chars.next();
            continue;
        }
        if in_class {
            if c == ']' {
                in_class = false;
            }
            continue;
        }
        match c {
            '[' => in_class = true,
            '(' => groups.push(false),
            ')' => {
                let inner_repeats = groups.pop().unwrap_or(false);
                let repeated = matches!(chars.peek(), Some('+' | '*' | '{'));
                if inner_repeats && repeated {
                    return Err(RlmError::UnsafePattern(format!(
                        "nested quantifier in {pattern:?}"
                    )));
                }
                if inner_repeats || repeated {
                    if let Some(parent) = groups.last_mut() {
                        *parent = true;
                    }
                }
            }
            '+' | '*' | '{' => {
                if let Some(group) = groups.last_mut() {
                    *group = true;
                }
            }
            _ => {}
        }
    }

    Ok(())
}

/// Validate, then compile under a size limit
pub fn compile_pattern(pattern: &str) -> Result<Regex> {
    validate_pattern(pattern)?;
    Ok(RegexBuilder::new(pattern)
        .size_limit(COMPILED_SIZE_LIMIT)
        .build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_ordinary_patterns() {
        for p in [r"\n\n", r"(?m)^## ", r"Chapter \d+", r"(ab)+", r"[(+*)]+", r"(\d{2})-(\d{2})"] {
            assert!(validate_pattern(p).is_ok(), "{p} should be accepted");
        }
    }

    #[test]
    fn test_rejects_nested_quantifiers() {
        for p in [r"(a+)+", r"(\w*)*", r"((ab)+)+", r"(x+y){2,}", r"(a|b+)*c"] {
            assert!(
                matches!(validate_pattern(p), Err(RlmError::UnsafePattern(_))),
                "{p} should be rejected"
            );
        }
    }

    #[test]
    fn test_rejects_long_and_empty() {
        assert!(validate_pattern(&"a".repeat(MAX_PATTERN_LEN + 1)).is_err());
        assert!(validate_pattern(&"a".repeat(MAX_PATTERN_LEN)).is_ok());
        assert!(validate_pattern("").is_err());
    }

    #[test]
    fn test_escaped_parens_are_literals() {
        assert!(validate_pattern(r"\(a+\)+").is_ok());
    }

    #[test]
    fn test_invalid_syntax_is_unsafe_pattern() {
        assert!(matches!(compile_pattern("(unclosed"), Err(RlmError::UnsafePattern(_))));
    }

    #[test]
    fn test_default_section_regex() {
        let text = "intro\n# One\nbody\nCHAPTER 2\nmore";
        assert_eq!(DEFAULT_SECTION_RE.find_iter(text).count(), 2);
    }
}
