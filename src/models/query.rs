use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use uuid::Uuid;

use super::optimization::{IndexRecommendation, OptimizationResult};
use super::plan::QueryPlan;
use super::reasoning::ReasoningChain;
use crate::error::AppError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    #[default]
    Simple,
    Reasoning,
    Conversational,
    Exploratory,
}

impl FromStr for QueryMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "simple" => Ok(QueryMode::Simple),
            "reasoning" => Ok(QueryMode::Reasoning),
            "conversational" => Ok(QueryMode::Conversational),
            "exploratory" => Ok(QueryMode::Exploratory),
            other => Err(AppError::Configuration(format!(
                "Unsupported query mode: {}",
                other
            ))),
        }
    }
}

/// Textual surface a plan can be rendered to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueryLanguage {
    /// SQL-like text
    #[default]
    Tql,
    /// Normalised natural language
    Nql,
    /// JSON query document
    Jql,
}

impl FromStr for QueryLanguage {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tql" => Ok(QueryLanguage::Tql),
            "nql" => Ok(QueryLanguage::Nql),
            "jql" => Ok(QueryLanguage::Jql),
            other => Err(AppError::Configuration(format!(
                "Unsupported target language: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryOptions {
    #[serde(default)]
    pub mode: Option<QueryMode>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Caller-supplied context, part of the result cache key
    #[serde(default)]
    pub context: Option<Value>,
    /// Ask the language model for parse hints when one is attached
    #[serde(default)]
    pub deep_understanding: bool,
}

impl QueryOptions {
    pub fn with_mode(mut self, mode: QueryMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub id: String,
    pub success: bool,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<QueryPlan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_chain: Option<Vec<String>>,
    pub execution_time_ms: f64,
    pub tokens_used: u64,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub row_count: usize,
    pub executed_at: DateTime<Utc>,
}

impl QueryResult {
    pub fn new(data: Value, row_count: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            success: true,
            data,
            plan: None,
            reasoning_chain: None,
            execution_time_ms: 0.0,
            tokens_used: 0,
            cached: false,
            error: None,
            error_code: None,
            suggestions: Vec::new(),
            warnings: Vec::new(),
            row_count,
            executed_at: Utc::now(),
        }
    }

    pub fn from_error(error: &AppError, execution_time_ms: f64) -> Self {
        let mut result = Self::new(Value::Null, 0);
        result.mark_failed(error);
        result.execution_time_ms = execution_time_ms;
        result
    }

    pub fn mark_failed(&mut self, error: &AppError) {
        self.success = false;
        self.error = Some(error.to_string());
        self.error_code = Some(error.code().to_string());
    }

    pub fn is_fatal(&self) -> bool {
        self.error_code.as_deref() == Some("LLM_RETRIES_EXHAUSTED")
    }
}

/// Output of `explain`: everything except execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Explanation {
    pub prompt: String,
    pub intent: String,
    pub intent_confidence: f64,
    pub plan: QueryPlan,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningChain>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimization: Option<OptimizationResult>,
    pub index_recommendations: Vec<IndexRecommendation>,
    pub target_language: QueryLanguage,
    pub rendered_query: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineStats {
    pub queries_processed: u64,
    pub failed_queries: u64,
    pub cache_hits: u64,
    pub total_reasoning_steps: u64,
    pub avg_execution_time_ms: f64,
    pub active_sessions: usize,
    pub cached_results: usize,
}

impl EngineStats {
    /// Folds one more execution time into the running mean
    pub fn record_execution(&mut self, execution_time_ms: f64) {
        let n = self.queries_processed as f64;
        if n <= 0.0 {
            self.avg_execution_time_ms = execution_time_ms;
        } else {
            self.avg_execution_time_ms = (self.avg_execution_time_ms * (n - 1.0)
                + execution_time_ms)
                / n;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_and_language_parse() {
        assert_eq!("Reasoning".parse::<QueryMode>().unwrap(), QueryMode::Reasoning);
        assert!("fast".parse::<QueryMode>().is_err());
        assert_eq!("jql".parse::<QueryLanguage>().unwrap(), QueryLanguage::Jql);
        assert!(matches!(
            "xql".parse::<QueryLanguage>(),
            Err(AppError::Configuration(_))
        ));
    }

    #[test]
    fn test_failed_result_carries_code() {
        let result = QueryResult::from_error(&AppError::Timeout("slow".into()), 12.0);
        assert!(!result.success);
        assert_eq!(result.error_code.as_deref(), Some("TIMEOUT"));
        assert!(!result.is_fatal());
    }

    #[test]
    fn test_running_average() {
        let mut stats = EngineStats::default();
        stats.queries_processed = 1;
        stats.record_execution(10.0);
        stats.queries_processed = 2;
        stats.record_execution(20.0);
        assert!((stats.avg_execution_time_ms - 15.0).abs() < 1e-9);
    }
}
