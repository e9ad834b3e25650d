use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    agents::RetryPolicy,
    providers::{
        openai::{OpenAIConfig, DEFAULT_BASE_URL},
        rate_limited::RateLimiter,
    },
    simulated_user::DEFAULT_SENTINEL,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("no API key configured for the provider")]
    MissingApiKey,
    #[error("invalid config value: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub organization: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            organization: None,
            request_timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantSettings {
    pub model: String,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
}

impl Default for AssistantSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            system_prompt: None,
            temperature: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterpartSettings {
    pub model: String,
    pub directive: Option<String>,
    pub sentinel: String,
    pub temperature: Option<f32>,
    pub fixed_responses: Vec<String>,
}

impl Default for CounterpartSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            directive: None,
            sentinel: DEFAULT_SENTINEL.to_string(),
            temperature: None,
            fixed_responses: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgeSettings {
    pub model: String,
    pub prompt: Option<String>,
}

impl Default for JudgeSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            prompt: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub call_timeout_ms: u64,
    pub backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_retries: policy.max_retries,
            call_timeout_ms: policy.call_timeout.as_millis() as u64,
            backoff_ms: policy.backoff.as_millis() as u64,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.call_timeout_ms))
            .with_backoff(Duration::from_millis(self.backoff_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub max_in_flight: usize,
    #[serde(default)]
    pub min_interval_ms: u64,
}

impl RateLimitSettings {
    pub fn limiter(&self) -> RateLimiter {
        RateLimiter::new(self.max_in_flight)
            .with_min_interval(Duration::from_millis(self.min_interval_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub provider: ProviderSettings,
    pub assistant: AssistantSettings,
    pub counterpart: CounterpartSettings,
    pub judge: JudgeSettings,
    pub retry: RetrySettings,
    pub rate_limit: Option<RateLimitSettings>,
    pub max_turns: usize,
    pub concurrency: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            provider: ProviderSettings::default(),
            assistant: AssistantSettings::default(),
            counterpart: CounterpartSettings::default(),
            judge: JudgeSettings::default(),
            retry: RetrySettings::default(),
            rate_limit: None,
            max_turns: 6,
            concurrency: 4,
        }
    }
}

impl SimulationConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_yaml_str(&fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1"));
        }
        if self.retry.call_timeout_ms == 0 {
            return Err(ConfigError::Invalid("retry.call_timeout_ms must be positive"));
        }
        if self.counterpart.sentinel.trim().is_empty() {
            return Err(ConfigError::Invalid("counterpart.sentinel must not be empty"));
        }
        if matches!(&self.rate_limit, Some(limit) if limit.max_in_flight == 0) {
            return Err(ConfigError::Invalid("rate_limit.max_in_flight must be at least 1"));
        }
        Ok(())
    }

    /// Provider connection settings; the key must already be resolved by the caller.
    pub fn openai_config(&self) -> Result<OpenAIConfig, ConfigError> {
        let api_key = self
            .provider
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or(ConfigError::MissingApiKey)?;

        let mut config = OpenAIConfig::new(api_key)
            .with_base_url(self.provider.base_url.clone())
            .with_timeout(Duration::from_millis(self.provider.request_timeout_ms));
        if let Some(organization) = &self.provider.organization {
            config = config.with_organization(organization.clone());
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = SimulationConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, SimulationConfig::default());
        assert_eq!(config.max_turns, 6);
        assert_eq!(config.counterpart.sentinel, "FINISHED");
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let config = SimulationConfig::from_yaml_str(
            "max_turns: 10\nretry:\n  max_retries: 5\nrate_limit:\n  max_in_flight: 2\ncounterpart:\n  fixed_responses: [\"hi\"]\n",
        )
        .unwrap();
        assert_eq!(config.max_turns, 10);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.call_timeout_ms, 60_000);
        assert_eq!(config.counterpart.fixed_responses, vec!["hi".to_string()]);
        assert_eq!(config.rate_limit.map(|limit| limit.min_interval_ms), Some(0));
    }

    #[test]
    fn rejects_zero_concurrency() {
        assert!(matches!(
            SimulationConfig::from_yaml_str("concurrency: 0"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn openai_config_requires_a_key() {
        let mut config = SimulationConfig::default();
        assert!(matches!(config.openai_config(), Err(ConfigError::MissingApiKey)));

        config.provider.api_key = Some("sk-test".to_string());
        config.provider.base_url = "http://localhost:4000/v1".to_string();
        let openai = config.openai_config().unwrap();
        assert_eq!(openai.base_url, "http://localhost:4000/v1");
        assert_eq!(openai.request_timeout, Duration::from_secs(60));
    }
}
