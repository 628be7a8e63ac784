use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Intent classes recognised by the semantic parser
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticIntent {
    Select,
    Retrieve,
    Count,
    Sum,
    Average,
    Min,
    Max,
    Group,
    Compare,
    Trend,
    TopN,
    BottomN,
    Distinct,
    Exists,
    Search,
}

impl SemanticIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            SemanticIntent::Select => "select",
            SemanticIntent::Retrieve => "retrieve",
            SemanticIntent::Count => "count",
            SemanticIntent::Sum => "sum",
            SemanticIntent::Average => "average",
            SemanticIntent::Min => "min",
            SemanticIntent::Max => "max",
            SemanticIntent::Group => "group",
            SemanticIntent::Compare => "compare",
            SemanticIntent::Trend => "trend",
            SemanticIntent::TopN => "top_n",
            SemanticIntent::BottomN => "bottom_n",
            SemanticIntent::Distinct => "distinct",
            SemanticIntent::Exists => "exists",
            SemanticIntent::Search => "search",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Value,
    Collection,
    Field,
    Number,
    ProperNoun,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub text: String,
    pub kind: EntityKind,
    /// Byte offsets into the text the entity was extracted from
    pub start: usize,
    pub end: usize,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeExpression {
    pub text: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonType {
    GreaterThan,
    LessThan,
    Equal,
    Between,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantityExpression {
    pub text: String,
    pub operator: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticParseResult {
    pub original_query: String,
    pub normalized_query: String,
    pub intent: SemanticIntent,
    pub intent_confidence: f64,
    pub entities: Vec<ExtractedEntity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_expression: Option<TimeExpression>,
    pub negation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparison_type: Option<ComparisonType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity_expression: Option<QuantityExpression>,
}

impl SemanticParseResult {
    pub fn entities_of(&self, kind: EntityKind) -> impl Iterator<Item = &ExtractedEntity> {
        self.entities.iter().filter(move |e| e.kind == kind)
    }
}
