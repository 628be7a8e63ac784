use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::plan::QueryPlan;
use crate::error::AppError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Legal transitions: PENDING -> RUNNING -> terminal, or PENDING -> CANCELLED
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        match (self, next) {
            (ExecutionStatus::Pending, ExecutionStatus::Running) => true,
            (ExecutionStatus::Pending, ExecutionStatus::Cancelled) => true,
            (ExecutionStatus::Pending, ExecutionStatus::Failed) => true,
            (ExecutionStatus::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub plan: QueryPlan,
    #[serde(default)]
    pub parameters: serde_json::Map<String, Value>,
    pub timeout_ms: u64,
    pub max_rows: usize,
    #[serde(default = "default_true")]
    pub include_metadata: bool,
}

fn default_true() -> bool {
    true
}

impl ExecutionContext {
    pub fn new(plan: QueryPlan) -> Self {
        Self {
            plan,
            parameters: serde_json::Map::new(),
            timeout_ms: 30_000,
            max_rows: 10_000,
            include_metadata: true,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionMetadata {
    pub execution_id: String,
    pub steps_executed: usize,
    pub rows_scanned: usize,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_rows: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes_used: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub data: Value,
    pub row_count: usize,
    pub execution_time_ms: f64,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub metadata: ExecutionMetadata,
}

impl ExecutionResult {
    pub fn failed(
        status: ExecutionStatus,
        error: impl Into<String>,
        execution_time_ms: f64,
        metadata: ExecutionMetadata,
    ) -> Self {
        Self {
            success: false,
            data: Value::Null,
            row_count: 0,
            execution_time_ms,
            status,
            error: Some(error.into()),
            warnings: Vec::new(),
            metadata,
        }
    }

    /// Error class of a failed run; `None` when it succeeded
    pub fn to_error(&self) -> Option<AppError> {
        if self.success {
            return None;
        }
        let message = self
            .error
            .clone()
            .unwrap_or_else(|| "Execution failed".to_string());
        Some(match self.status {
            ExecutionStatus::Cancelled => AppError::Internal(message),
            _ if message.contains("timeout") => AppError::Timeout(message),
            _ => AppError::Backend(message),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(ExecutionStatus::Running));
            assert!(!terminal.can_transition_to(ExecutionStatus::Completed));
        }
        assert!(ExecutionStatus::Pending.can_transition_to(ExecutionStatus::Running));
        assert!(ExecutionStatus::Running.can_transition_to(ExecutionStatus::Cancelled));
        assert!(!ExecutionStatus::Running.can_transition_to(ExecutionStatus::Pending));
    }
}
