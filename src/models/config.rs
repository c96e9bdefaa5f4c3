//! Configuration models for curator.
//!
//! All I^R (resolvable ignorance) is parameterized here.
//! The user resolves these unknowns at runtime via config file.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::client::{RateBudget, Replenish};

/// Top-level configuration for curator.
///
/// I^R resolved: All configurable parameters are explicit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Chat-completion endpoint configuration
    #[serde(default)]
    pub openai: OpenAiConfig,

    /// Budgeted curation settings
    #[serde(default)]
    pub curation: CurationConfig,

    /// Shared request/token allowance for dispatch
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Dispatch settings
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

/// Chat-completion endpoint configuration.
///
/// K_i: The endpoint speaks the OpenAI chat completions API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    /// API key (can also be set via OPENAI_API_KEY env var)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable name for API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Base URL for the API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Caller-directed retries of transient failures (0 disables)
    #[serde(default)]
    pub max_retries: u32,
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_timeout() -> u64 {
    180
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            timeout_secs: default_timeout(),
            max_retries: 0,
        }
    }
}

/// Budgeted curation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurationConfig {
    /// Model whose tokenizer and overhead constants price each conversation
    #[serde(default = "default_model")]
    pub model: String,

    /// Token ceiling in millions of tokens
    #[serde(default = "default_budget_millions")]
    pub budget_millions: f64,

    /// Path to the system preamble prepended to every conversation
    #[serde(default)]
    pub system_prompt: Option<PathBuf>,

    /// Inline system preamble, used when no path is given
    #[serde(default)]
    pub system_prompt_text: Option<String>,
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_budget_millions() -> f64 {
    1.0
}

impl Default for CurationConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            budget_millions: default_budget_millions(),
            system_prompt: None,
            system_prompt_text: None,
        }
    }
}

impl CurationConfig {
    /// Load the system preamble from file, or fall back to the inline text.
    ///
    /// B_i(file readable) → Result
    pub fn load_preamble(&self) -> Result<String, ConfigError> {
        if let Some(path) = &self.system_prompt {
            return std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
                path: path.clone(),
                source: e,
            });
        }
        self.system_prompt_text
            .clone()
            .ok_or(ConfigError::MissingPreamble)
    }
}

/// Rate limit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Calls admitted per window
    #[serde(default = "default_requests_per_window")]
    pub requests_per_window: u64,

    /// Tokens admitted per window
    #[serde(default = "default_tokens_per_window")]
    pub tokens_per_window: u64,

    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: f64,

    /// How consumed allowance comes back
    #[serde(default)]
    pub replenish: Replenish,
}

fn default_requests_per_window() -> u64 {
    500
}

fn default_tokens_per_window() -> u64 {
    200_000
}

fn default_window_secs() -> f64 {
    60.0
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_window: default_requests_per_window(),
            tokens_per_window: default_tokens_per_window(),
            window_secs: default_window_secs(),
            replenish: Replenish::default(),
        }
    }
}

impl RateLimitConfig {
    /// B_i(window is a positive, representable duration) → Result
    pub fn budget(&self) -> Result<RateBudget, ConfigError> {
        let window = Duration::try_from_secs_f64(self.window_secs)
            .ok()
            .filter(|w| !w.is_zero())
            .ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "rate_limit.window_secs must be positive, got {}",
                    self.window_secs
                ))
            })?;
        Ok(RateBudget {
            request_capacity: self.requests_per_window,
            token_capacity: self.tokens_per_window,
            window,
            replenish: self.replenish,
        })
    }
}

/// Dispatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Model requested from the endpoint
    #[serde(default = "default_model")]
    pub model: String,

    /// Tokens reserved per call for the completion, on top of the prompt estimate
    #[serde(default)]
    pub completion_reserve: u64,

    /// Wall-clock deadline after which outstanding requests are cancelled
    #[serde(default)]
    pub deadline_secs: Option<u64>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            completion_reserve: 0,
            deadline_secs: None,
        }
    }
}

impl DispatchConfig {
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// B_i(file exists) → Result
    /// B_i(file is valid TOML) → Result
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check numeric ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.curation.budget_millions.is_finite() || self.curation.budget_millions < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "curation.budget_millions must be a non-negative number, got {}",
                self.curation.budget_millions
            )));
        }
        if self.rate_limit.requests_per_window == 0 || self.rate_limit.tokens_per_window == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit capacities must be greater than zero".to_string(),
            ));
        }
        self.rate_limit.budget()?;
        Ok(())
    }

    /// Resolve API key from config or environment.
    ///
    /// B_i(api key available) → Result
    pub fn resolve_api_key(&self) -> Result<String, ConfigError> {
        // First check explicit api_key in config
        if let Some(key) = &self.openai.api_key {
            let key = expand_env_vars(key);
            if let Some(unset) = unresolved_env_var(&key) {
                return Err(ConfigError::MissingApiKey { env_var: unset });
            }
            if key.trim().is_empty() {
                return Err(ConfigError::MissingApiKey {
                    env_var: self.openai.api_key_env.clone(),
                });
            }
            return Ok(key);
        }

        // Then check environment variable
        std::env::var(&self.openai.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingApiKey {
                env_var: self.openai.api_key_env.clone(),
            })
    }
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let re = match regex::Regex::new(r"\$\{([^}]+)\}") {
        Ok(re) => re,
        Err(_) => return s.to_string(),
    };

    re.replace_all(s, |cap: &regex::Captures<'_>| {
        std::env::var(&cap[1]).unwrap_or_else(|_| cap[0].to_string())
    })
    .into_owned()
}

/// Name of the first `${VAR}` placeholder left in `s`, if any.
fn unresolved_env_var(s: &str) -> Option<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").ok()?;
    re.captures(s).map(|cap| cap[1].to_string())
}

/// Configuration errors.
///
/// Epistemic origin:
/// - B_i falsified: File not found, parse error
/// - I^B materialized: Missing required values
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Missing API key: set {env_var} env var or openai.api_key in config")]
    MissingApiKey { env_var: String },

    #[error("Missing system preamble: set curation.system_prompt or curation.system_prompt_text")]
    MissingPreamble,

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_file() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.openai.api_key_env, "OPENAI_API_KEY");
        assert_eq!(config.curation.model, "gpt-4o-mini");
        assert_eq!(config.rate_limit.requests_per_window, 500);
        assert_eq!(config.rate_limit.replenish, Replenish::Rolling);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let config: Config = toml::from_str(
            r#"
            [openai]
            api_key = "sk-test"
            max_retries = 2

            [curation]
            model = "gpt-4o-2024-08-06"
            budget_millions = 0.5
            system_prompt_text = "You are a helpful assistant."

            [rate_limit]
            requests_per_window = 10
            tokens_per_window = 1000
            window_secs = 1.5
            replenish = "continuous"

            [dispatch]
            completion_reserve = 256
            deadline_secs = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.openai.max_retries, 2);
        assert_eq!(config.curation.budget_millions, 0.5);
        assert_eq!(
            config.curation.load_preamble().unwrap(),
            "You are a helpful assistant."
        );

        let budget = config.rate_limit.budget().unwrap();
        assert_eq!(budget.request_capacity, 10);
        assert_eq!(budget.token_capacity, 1000);
        assert_eq!(budget.window, Duration::from_millis(1500));
        assert_eq!(budget.replenish, Replenish::Continuous);
        assert_eq!(config.dispatch.deadline(), Some(Duration::from_secs(30)));
        assert_eq!(config.resolve_api_key().unwrap(), "sk-test");
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = Config::default();
        config.rate_limit.tokens_per_window = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_negative_budget() {
        let mut config = Config::default();
        config.curation.budget_millions = -1.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_api_key() {
        let mut config = Config::default();
        config.openai.api_key_env = "CURATOR_TEST_KEY_THAT_IS_NEVER_SET".to_string();
        assert!(matches!(
            config.resolve_api_key(),
            Err(ConfigError::MissingApiKey { .. })
        ));
    }

    #[test]
    fn test_unresolved_api_key_placeholder() {
        let mut config = Config::default();
        config.openai.api_key = Some("${CURATOR_TEST_PLACEHOLDER_NEVER_SET}".to_string());
        match config.resolve_api_key() {
            Err(ConfigError::MissingApiKey { env_var }) => {
                assert_eq!(env_var, "CURATOR_TEST_PLACEHOLDER_NEVER_SET")
            }
            other => panic!("expected MissingApiKey, got {other:?}"),
        }
    }

    #[test]
    fn test_blank_api_key() {
        let mut config = Config::default();
        for key in ["", "   "] {
            config.openai.api_key = Some(key.to_string());
            assert!(matches!(
                config.resolve_api_key(),
                Err(ConfigError::MissingApiKey { .. })
            ));
        }
    }

    #[test]
    fn test_validate_rejects_unrepresentable_window() {
        let mut config = Config::default();
        config.rate_limit.window_secs = 1e30;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        assert!(matches!(config.rate_limit.budget(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_preamble() {
        let config = CurationConfig::default();
        assert!(matches!(
            config.load_preamble(),
            Err(ConfigError::MissingPreamble)
        ));
    }

    #[test]
    fn test_expand_env_vars_leaves_unknown_placeholder() {
        assert_eq!(
            expand_env_vars("Bearer ${CURATOR_TEST_UNSET_VAR}"),
            "Bearer ${CURATOR_TEST_UNSET_VAR}"
        );
        assert_eq!(expand_env_vars("plain"), "plain");
    }
}
