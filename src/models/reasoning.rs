use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasoningStepType {
    Decompose,
    Clarify,
    Lookup,
    Compute,
    Compare,
    Infer,
    Validate,
    Synthesize,
}

impl ReasoningStepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningStepType::Decompose => "DECOMPOSE",
            ReasoningStepType::Clarify => "CLARIFY",
            ReasoningStepType::Lookup => "LOOKUP",
            ReasoningStepType::Compute => "COMPUTE",
            ReasoningStepType::Compare => "COMPARE",
            ReasoningStepType::Infer => "INFER",
            ReasoningStepType::Validate => "VALIDATE",
            ReasoningStepType::Synthesize => "SYNTHESIZE",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningStep {
    pub step_number: usize,
    pub step_type: ReasoningStepType,
    pub thought: String,
    pub action: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReasoningChain {
    pub query: String,
    pub steps: Vec<ReasoningStep>,
    pub conclusion: Option<String>,
    pub confidence: f64,
}

impl ReasoningChain {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            steps: Vec::new(),
            conclusion: None,
            confidence: 1.0,
        }
    }

    /// Appends a step; chain confidence is the minimum over all steps
    pub fn push(
        &mut self,
        step_type: ReasoningStepType,
        thought: impl Into<String>,
        action: impl Into<String>,
        confidence: f64,
        result: Option<serde_json::Value>,
    ) {
        let step = ReasoningStep {
            step_number: self.steps.len() + 1,
            step_type,
            thought: thought.into(),
            action: action.into(),
            confidence,
            result,
        };
        self.confidence = self.confidence.min(confidence);
        self.steps.push(step);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn count_of(&self, step_type: ReasoningStepType) -> usize {
        self.steps.iter().filter(|s| s.step_type == step_type).count()
    }

    /// Human-readable trace, one line per step
    pub fn to_trace(&self) -> Vec<String> {
        self.steps
            .iter()
            .map(|s| format!("Step {}: {} -> {}", s.step_number, s.thought, s.action))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_confidence_is_minimum() {
        let mut chain = ReasoningChain::new("q");
        chain.push(ReasoningStepType::Decompose, "split", "a", 0.9, None);
        chain.push(ReasoningStepType::Clarify, "clarify", "b", 0.6, None);
        chain.push(ReasoningStepType::Synthesize, "done", "c", 0.95, None);
        assert!((chain.confidence - 0.6).abs() < f64::EPSILON);
        assert_eq!(chain.to_trace()[1], "Step 2: clarify -> b");
    }
}
