// crates/rlm-engine/src/config/file.rs
// File-based configuration from ~/.rlm/config.toml

use super::env;
use super::ExecutionConfig;
use crate::error::{Result, RlmError};
use rlm_types::ExecutionMode;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Top-level config structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RlmSettings {
    #[serde(default)]
    pub rlm: RlmSection,
}

/// `[rlm]` section. Every key is optional; missing keys keep the defaults.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RlmSection {
    /// "auto", "simple" or "full"
    pub mode: Option<String>,
    pub max_depth: Option<u32>,
    pub max_child_calls: Option<u32>,
    pub token_budget: Option<u64>,
    pub enable_cache: Option<bool>,
    pub expose_reasoning: Option<bool>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl RlmSettings {
    /// Load ~/.rlm/config.toml, then apply RLM_* environment overrides
    pub fn load() -> Self {
        let mut settings = Self::load_from(&Self::config_path());
        env::apply_overrides(&mut settings.rlm, |key| std::env::var(key).ok());
        settings
    }

    /// Load from a specific file, falling back to defaults on any problem
    pub fn load_from(path: &Path) -> Self {
        match Self::try_load_from(path) {
            Ok(settings) => {
                debug!(path = %path.display(), "Loaded config from file");
                settings
            }
            Err(RlmError::Io(_)) => {
                debug!(path = %path.display(), "Config file not found, using defaults");
                Self::default()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to parse config file");
                Self::default()
            }
        }
    }

    /// Load from a specific file, surfacing I/O and parse errors
    pub fn try_load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let settings: Self = toml::from_str(contents)?;
        if let Some(raw) = settings.rlm.mode.as_deref() {
            if parse_mode(raw).is_none() {
                return Err(RlmError::Config(format!(
                    "unknown rlm.mode \"{raw}\", expected auto, simple or full"
                )));
            }
        }
        Ok(settings)
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".rlm")
            .join("config.toml")
    }

    /// Mode override from the settings. `Some(None)` means "auto".
    pub fn mode(&self) -> Option<Option<ExecutionMode>> {
        let raw = self.rlm.mode.as_deref()?;
        let mode = parse_mode(raw);
        if mode.is_none() {
            warn!(value = raw, "Unknown rlm.mode, using default");
        }
        mode
    }

    /// Build a clamped execution config from these settings
    pub fn to_config(&self) -> ExecutionConfig {
        let section = &self.rlm;
        let mut builder = ExecutionConfig::builder();

        match self.mode() {
            Some(Some(mode)) => builder = builder.mode(mode),
            Some(None) => builder = builder.auto_mode(),
            None => {}
        }
        if let Some(depth) = section.max_depth {
            builder = builder.max_depth(depth);
        }
        if let Some(calls) = section.max_child_calls {
            builder = builder.max_child_calls(calls);
        }
        if let Some(budget) = section.token_budget {
            builder = builder.token_budget(budget);
        }
        if let Some(enable) = section.enable_cache {
            builder = builder.enable_cache(enable);
        }
        if let Some(expose) = section.expose_reasoning {
            builder = builder.expose_reasoning(expose);
        }
        if let Some(ref model) = section.model {
            builder = builder.model(model.clone());
        }
        if let Some(ref provider) = section.provider {
            builder = builder.provider(provider.clone());
        }
        if let Some(secs) = section.timeout_secs {
            builder = builder.call_timeout(Duration::from_secs(secs.max(1)));
        }

        builder.build()
    }
}

fn parse_mode(raw: &str) -> Option<Option<ExecutionMode>> {
    match raw.trim().to_lowercase().as_str() {
        "auto" => Some(None),
        "simple" => Some(Some(ExecutionMode::Simple)),
        "full" => Some(Some(ExecutionMode::Full)),
        _ => None,
    }
}
