// crates/rlm-engine/src/config/env.rs
// RLM_* environment overrides layered over the config file

use super::file::RlmSection;
use tracing::{debug, warn};

/// Apply environment overrides. `lookup` abstracts the environment so
/// callers (and tests) can supply their own source.
pub fn apply_overrides<F>(section: &mut RlmSection, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(mode) = read("RLM_MODE") {
        section.mode = Some(mode);
    }
    if let Some(depth) = read("RLM_MAX_DEPTH").and_then(|v| parse_number("RLM_MAX_DEPTH", &v)) {
        section.max_depth = Some(depth);
    }
    if let Some(calls) =
        read("RLM_MAX_CHILD_CALLS").and_then(|v| parse_number("RLM_MAX_CHILD_CALLS", &v))
    {
        section.max_child_calls = Some(calls);
    }
    if let Some(budget) =
        read("RLM_TOKEN_BUDGET").and_then(|v| parse_number("RLM_TOKEN_BUDGET", &v))
    {
        section.token_budget = Some(budget);
    }
    if let Some(enable) = read("RLM_ENABLE_CACHE").and_then(|v| parse_bool(&v)) {
        section.enable_cache = Some(enable);
    }
    if let Some(expose) = read("RLM_EXPOSE_REASONING").and_then(|v| parse_bool(&v)) {
        section.expose_reasoning = Some(expose);
    }
    if let Some(model) = read("RLM_MODEL") {
        section.model = Some(model);
    }
    if let Some(provider) = read("RLM_PROVIDER") {
        section.provider = Some(provider);
    }
    if let Some(secs) = read("RLM_TIMEOUT_SECS").and_then(|v| parse_number("RLM_TIMEOUT_SECS", &v))
    {
        section.timeout_secs = Some(secs);
    }
    debug!("Applied RLM environment overrides");
}

/// Parse a boolean flag ("1", "true", "yes", "on" and their negatives)
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        other => {
            warn!(value = other, "Unrecognized boolean value, ignoring");
            None
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Option<T> {
    match value.trim().parse() {
        Ok(n) => Some(n),
        Err(_) => {
            warn!(key = key, value = value, "Invalid numeric value, ignoring");
            None
        }
    }
}
