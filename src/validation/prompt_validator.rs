use crate::error::AppError;

/// Normalises raw prompts before they reach the planner
#[derive(Debug, Clone)]
pub struct PromptValidator {
    max_length: usize,
}

impl PromptValidator {
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Trims the prompt and replaces control characters with spaces.
    /// Empty prompts and prompts longer than `max_length` characters are rejected.
    pub fn sanitize(&self, prompt: &str) -> Result<String, AppError> {
        let cleaned: String = prompt
            .chars()
            .map(|c| if c.is_control() { ' ' } else { c })
            .collect();
        let cleaned = cleaned.trim();

        if cleaned.is_empty() {
            return Err(AppError::Validation("Prompt must not be empty".to_string()));
        }
        let length = cleaned.chars().count();
        if length > self.max_length {
            return Err(AppError::Validation(format!(
                "Prompt is {} characters long, the limit is {}",
                length, self.max_length
            )));
        }
        Ok(cleaned.to_string())
    }
}

impl Default for PromptValidator {
    fn default() -> Self {
        Self::new(4096)
    }
}
