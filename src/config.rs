use serde::Deserialize;
use std::env;

use crate::error::AppError;
use crate::models::{LlmProvider, QueryLanguage, QueryMode};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub engine: EngineConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub data: DataConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub default_mode: QueryMode,
    pub max_reasoning_steps: usize,
    pub enable_caching: bool,
    pub cache_ttl_seconds: u64,
    pub cache_max_entries: usize,
    pub max_context_turns: usize,
    pub memory_max_size: usize,
    pub memory_max_age_seconds: u64,
    pub enable_schema_inference: bool,
    pub enable_optimization: bool,
    /// Advisory only. Plans are always executed step by step.
    pub parallel_execution: bool,
    pub max_rows: usize,
    pub timeout_seconds: u64,
    pub sanitize_queries: bool,
    pub max_prompt_length: usize,
    pub enable_typo_correction: bool,
    pub target_language: QueryLanguage,
    pub ssd_storage: bool,
    pub memory_gb: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_mode: QueryMode::Simple,
            max_reasoning_steps: 10,
            enable_caching: true,
            cache_ttl_seconds: 3600,
            cache_max_entries: 1000,
            max_context_turns: 50,
            memory_max_size: 10_000,
            memory_max_age_seconds: 3600,
            enable_schema_inference: true,
            enable_optimization: true,
            parallel_execution: false,
            max_rows: 10_000,
            timeout_seconds: 30,
            sanitize_queries: true,
            max_prompt_length: 4096,
            enable_typo_correction: false,
            target_language: QueryLanguage::Tql,
            ssd_storage: true,
            memory_gb: 16.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub gateway_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout_seconds: u64,
    pub rate_limit_rpm: u32,
    pub retry_attempts: u32,
    pub cache_enabled: bool,
    pub cache_ttl_seconds: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Local,
            gateway_url: "http://localhost:11434".to_string(),
            api_key: None,
            model: "llama3".to_string(),
            temperature: 0.1,
            max_tokens: 1024,
            timeout_seconds: 60,
            rate_limit_rpm: 60,
            retry_attempts: 3,
            cache_enabled: true,
            cache_ttl_seconds: 3600,
        }
    }
}

impl LlmConfig {
    /// Checks that a remote provider points at a parseable URL
    pub fn validate(&self) -> Result<(), AppError> {
        if self.rate_limit_rpm == 0 {
            return Err(AppError::Configuration(
                "llm.rate_limit_rpm must be greater than zero".to_string(),
            ));
        }
        if self.provider != LlmProvider::Custom {
            url::Url::parse(&self.gateway_url).map_err(|e| {
                AppError::Configuration(format!(
                    "Invalid LLM gateway URL '{}': {}",
                    self.gateway_url, e
                ))
            })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DataConfig {
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub style: String,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Try to load from .env file
        let _ = dotenv::dotenv();

        let mut builder = config::Config::builder()
            .set_default("engine.default_mode", "simple")?
            .set_default("engine.max_reasoning_steps", 10)?
            .set_default("engine.enable_caching", true)?
            .set_default("engine.cache_ttl_seconds", 3600)?
            .set_default("engine.cache_max_entries", 1000)?
            .set_default("engine.max_context_turns", 50)?
            .set_default("engine.memory_max_size", 10_000)?
            .set_default("engine.memory_max_age_seconds", 3600)?
            .set_default("engine.enable_schema_inference", true)?
            .set_default("engine.enable_optimization", true)?
            .set_default("engine.parallel_execution", false)?
            .set_default("engine.max_rows", 10_000)?
            .set_default("engine.timeout_seconds", 30)?
            .set_default("engine.sanitize_queries", true)?
            .set_default("engine.max_prompt_length", 4096)?
            .set_default("engine.enable_typo_correction", false)?
            .set_default("engine.target_language", "tql")?
            .set_default("engine.ssd_storage", true)?
            .set_default("engine.memory_gb", 16.0)?
            .set_default("llm.provider", "local")?
            .set_default("llm.gateway_url", "http://localhost:11434")?
            .set_default("llm.model", "llama3")?
            .set_default("llm.temperature", 0.1)?
            .set_default("llm.max_tokens", 1024)?
            .set_default("llm.timeout_seconds", 60)?
            .set_default("llm.rate_limit_rpm", 60)?
            .set_default("llm.retry_attempts", 3)?
            .set_default("llm.cache_enabled", true)?
            .set_default("llm.cache_ttl_seconds", 3600)?
            .set_default("logging.level", "info")?
            .set_default("logging.style", "auto")?;

        // Load from environment variables
        let overrides = [
            ("PROMPTQL_MODE", "engine.default_mode"),
            ("PROMPTQL_MAX_REASONING_STEPS", "engine.max_reasoning_steps"),
            ("PROMPTQL_ENABLE_CACHING", "engine.enable_caching"),
            ("PROMPTQL_CACHE_TTL", "engine.cache_ttl_seconds"),
            ("PROMPTQL_MAX_CONTEXT_TURNS", "engine.max_context_turns"),
            ("PROMPTQL_SCHEMA_INFERENCE", "engine.enable_schema_inference"),
            ("PROMPTQL_OPTIMIZATION", "engine.enable_optimization"),
            ("PROMPTQL_PARALLEL_EXECUTION", "engine.parallel_execution"),
            ("PROMPTQL_MAX_ROWS", "engine.max_rows"),
            ("PROMPTQL_TIMEOUT", "engine.timeout_seconds"),
            ("PROMPTQL_SANITIZE", "engine.sanitize_queries"),
            ("PROMPTQL_TYPO_CORRECTION", "engine.enable_typo_correction"),
            ("PROMPTQL_TARGET_LANGUAGE", "engine.target_language"),
            ("LLM_PROVIDER", "llm.provider"),
            ("LLM_GATEWAY_URL", "llm.gateway_url"),
            ("LLM_MODEL", "llm.model"),
            ("LLM_RATE_LIMIT_RPM", "llm.rate_limit_rpm"),
            ("LLM_RETRY_ATTEMPTS", "llm.retry_attempts"),
            ("PROMPTQL_DATA", "data.path"),
            ("RUST_LOG", "logging.level"),
            ("RUST_LOG_STYLE", "logging.style"),
        ];
        for (var, key) in overrides {
            if let Ok(value) = env::var(var) {
                builder = builder.set_override(key, value)?;
            }
        }

        if let Ok(api_key) = env::var("LLM_API_KEY") {
            builder = builder.set_override("llm.api_key", Some(api_key))?;
        }

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        env::remove_var("PROMPTQL_MODE");
        env::remove_var("PROMPTQL_TARGET_LANGUAGE");
        env::remove_var("LLM_PROVIDER");

        let config = Config::from_env();
        assert!(config.is_ok());

        let config = config.unwrap();
        assert_eq!(config.engine.default_mode, QueryMode::Simple);
        assert_eq!(config.engine.max_context_turns, 50);
        assert_eq!(config.engine.target_language, QueryLanguage::Tql);
        assert_eq!(config.llm.provider, LlmProvider::Local);
        assert!(!config.engine.parallel_execution);
    }

    #[test]
    fn test_unknown_enum_values_fail_fast() {
        let built = config::Config::builder()
            .set_override("mode", "telepathic")
            .unwrap()
            .build()
            .unwrap();

        #[derive(Debug, Deserialize)]
        struct ModeOnly {
            #[allow(dead_code)]
            mode: QueryMode,
        }
        assert!(built.try_deserialize::<ModeOnly>().is_err());
    }

    #[test]
    fn test_llm_config_validation() {
        let mut llm = LlmConfig::default();
        assert!(llm.validate().is_ok());

        llm.gateway_url = "not a url".to_string();
        assert!(matches!(llm.validate(), Err(AppError::Configuration(_))));

        llm.provider = LlmProvider::Custom;
        assert!(llm.validate().is_ok());
    }
}
