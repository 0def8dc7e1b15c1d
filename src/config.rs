use std::str::FromStr;

use anyhow::{Context, Result};

use crate::llm::ModelParams;
use crate::rlm::prompts::PromptLanguage;

pub const DEFAULT_MAX_DEPTH: u32 = 5;
pub const DEFAULT_MAX_ITERATIONS: u32 = 30;
pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 2000;

/// Read-only configuration shared by a completion and all of its recursive
/// children.
#[derive(Debug, Clone)]
pub struct RlmConfig {
    /// Model used at depth 0.
    pub model: String,
    /// Model used at depth > 0. Falls back to `model`.
    pub recursive_model: Option<String>,
    pub max_depth: u32,
    /// Loop passes allowed per session.
    pub max_iterations: u32,
    /// Character budget for one execution observation.
    pub max_output_chars: usize,
    pub language: PromptLanguage,
    pub params: ModelParams,
}

impl Default for RlmConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            recursive_model: None,
            max_depth: DEFAULT_MAX_DEPTH,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_output_chars: DEFAULT_MAX_OUTPUT_CHARS,
            language: PromptLanguage::English,
            params: ModelParams::default(),
        }
    }
}

impl RlmConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_recursive_model(mut self, model: impl Into<String>) -> Self {
        self.recursive_model = Some(model.into());
        self
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_max_output_chars(mut self, chars: usize) -> Self {
        self.max_output_chars = chars;
        self
    }

    pub fn with_language(mut self, language: PromptLanguage) -> Self {
        self.language = language;
        self
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.params.api_base = Some(api_base.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.params.api_key = Some(api_key.into());
        self
    }

    pub fn with_params(mut self, params: ModelParams) -> Self {
        self.params = params;
        self
    }

    pub fn recursive_model(&self) -> &str {
        self.recursive_model.as_deref().unwrap_or(&self.model)
    }

    /// Model for a session at `depth`.
    pub fn model_for_depth(&self, depth: u32) -> &str {
        if depth == 0 {
            &self.model
        } else {
            self.recursive_model()
        }
    }

    /// Load from `.env` / process environment. Unset variables keep defaults.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv::dotenv();
        let mut config = Self::default();

        if let Ok(model) = dotenv::var("RLM_MODEL") {
            config.model = model;
        }
        config.recursive_model = dotenv::var("RLM_RECURSIVE_MODEL")
            .ok()
            .filter(|m| !m.is_empty());
        config.params.api_base = dotenv::var("RLM_API_BASE").ok().filter(|s| !s.is_empty());
        config.params.api_key = dotenv::var("RLM_API_KEY").ok().filter(|s| !s.is_empty());

        if let Some(v) = parse_var("RLM_MAX_DEPTH")? {
            config.max_depth = v;
        }
        if let Some(v) = parse_var("RLM_MAX_ITERATIONS")? {
            config.max_iterations = v;
        }
        if let Some(v) = parse_var("RLM_MAX_OUTPUT_CHARS")? {
            config.max_output_chars = v;
        }
        config.params.temperature = parse_var("RLM_TEMPERATURE")?;
        config.params.max_tokens = parse_var("RLM_MAX_TOKENS")?;
        config.params.timeout_secs = parse_var("RLM_TIMEOUT_SECS")?;
        config.params.num_retries = parse_var("RLM_NUM_RETRIES")?;
        if let Some(lang) = parse_var::<PromptLanguage>("RLM_LANGUAGE")? {
            config.language = lang;
        }

        Ok(config)
    }
}

fn parse_var<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match dotenv::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("invalid value for {}: {:?}", key, raw)),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RlmConfig::default();
        assert_eq!(config.max_depth, 5);
        assert_eq!(config.max_iterations, 30);
        assert_eq!(config.max_output_chars, 2000);
        assert_eq!(config.recursive_model(), config.model);
    }

    #[test]
    fn test_model_for_depth() {
        let config = RlmConfig::new("expensive-model").with_recursive_model("cheap-model");
        assert_eq!(config.model_for_depth(0), "expensive-model");
        assert_eq!(config.model_for_depth(1), "cheap-model");
        assert_eq!(config.model_for_depth(4), "cheap-model");
    }

    #[test]
    fn test_parse_var_rejects_garbage() {
        std::env::set_var("RLM_TEST_PARSE_VAR", "not-a-number");
        let parsed: Result<Option<u32>> = parse_var("RLM_TEST_PARSE_VAR");
        assert!(parsed.is_err());
        std::env::set_var("RLM_TEST_PARSE_VAR", " 12 ");
        assert_eq!(parse_var::<u32>("RLM_TEST_PARSE_VAR").unwrap(), Some(12));
        std::env::remove_var("RLM_TEST_PARSE_VAR");
    }
}
