use thiserror::Error;

/// Application error types
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("LLM service error: {0}")]
    LlmService(String),

    /// Raised once the gateway has used up every retry. Callers treat this as fatal.
    #[error("LLM retries exhausted after {attempts} attempts: {message}")]
    LlmRetriesExhausted { attempts: u32, message: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable code for the error class
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Backend(_) => "BACKEND_ERROR",
            AppError::Timeout(_) => "TIMEOUT",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::InvalidQuery(_) => "INVALID_QUERY",
            AppError::LlmService(_) => "LLM_SERVICE_ERROR",
            AppError::LlmRetriesExhausted { .. } => "LLM_RETRIES_EXHAUSTED",
            AppError::Configuration(_) => "CONFIGURATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, AppError::LlmRetriesExhausted { .. })
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(format!("JSON error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Configuration(err.to_string())
    }
}
