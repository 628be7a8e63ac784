// Query plan model
//
// A plan is an ordered list of typed steps. Each step names the steps it
// depends on; ids grow monotonically so dependencies always point backwards.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub u32);

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step_{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    Fetch,
    Filter,
    Join,
    Aggregate,
    Sort,
    Limit,
    Transform,
    Compute,
    Compare,
    Subquery,
}

impl StepType {
    pub fn base_cost(&self) -> f64 {
        match self {
            StepType::Fetch => 1.0,
            StepType::Filter => 0.5,
            StepType::Join => 3.0,
            StepType::Aggregate => 1.5,
            StepType::Sort => 1.0,
            StepType::Limit => 0.1,
            StepType::Compare => 2.0,
            StepType::Subquery => 2.0,
            StepType::Transform | StepType::Compute => 1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Fetch => "FETCH",
            StepType::Filter => "FILTER",
            StepType::Join => "JOIN",
            StepType::Aggregate => "AGGREGATE",
            StepType::Sort => "SORT",
            StepType::Limit => "LIMIT",
            StepType::Transform => "TRANSFORM",
            StepType::Compute => "COMPUTE",
            StepType::Compare => "COMPARE",
            StepType::Subquery => "SUBQUERY",
        }
    }
}

/// Coarse operation class detected by the planner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Retrieve,
    Count,
    Aggregate,
    Compare,
    Trend,
    Group,
    Filter,
    Join,
    Sort,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Retrieve => "retrieve",
            Intent::Count => "count",
            Intent::Aggregate => "aggregate",
            Intent::Compare => "compare",
            Intent::Trend => "trend",
            Intent::Group => "group",
            Intent::Filter => "filter",
            Intent::Join => "join",
            Intent::Sort => "sort",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Contains,
    StartsWith,
    EndsWith,
    IsNull,
    IsNotNull,
    Between,
}

impl ComparisonOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            ComparisonOp::Eq => "=",
            ComparisonOp::Ne => "!=",
            ComparisonOp::Lt => "<",
            ComparisonOp::Le => "<=",
            ComparisonOp::Gt => ">",
            ComparisonOp::Ge => ">=",
            ComparisonOp::In => "in",
            ComparisonOp::NotIn => "not_in",
            ComparisonOp::Contains => "contains",
            ComparisonOp::StartsWith => "starts_with",
            ComparisonOp::EndsWith => "ends_with",
            ComparisonOp::IsNull => "is_null",
            ComparisonOp::IsNotNull => "is_not_null",
            ComparisonOp::Between => "between",
        }
    }

    /// Operators an ordered index can serve
    pub fn is_index_friendly(&self) -> bool {
        matches!(
            self,
            ComparisonOp::Eq
                | ComparisonOp::Lt
                | ComparisonOp::Le
                | ComparisonOp::Gt
                | ComparisonOp::Ge
                | ComparisonOp::Between
                | ComparisonOp::In
        )
    }
}

impl FromStr for ComparisonOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let op = match s.trim().to_lowercase().as_str() {
            "=" | "==" | "eq" => ComparisonOp::Eq,
            "!=" | "<>" | "ne" => ComparisonOp::Ne,
            "<" | "lt" => ComparisonOp::Lt,
            "<=" | "le" => ComparisonOp::Le,
            ">" | "gt" => ComparisonOp::Gt,
            ">=" | "ge" => ComparisonOp::Ge,
            "in" => ComparisonOp::In,
            "not_in" | "not in" => ComparisonOp::NotIn,
            "contains" | "like" => ComparisonOp::Contains,
            "starts_with" => ComparisonOp::StartsWith,
            "ends_with" => ComparisonOp::EndsWith,
            "is_null" => ComparisonOp::IsNull,
            "is_not_null" => ComparisonOp::IsNotNull,
            "between" => ComparisonOp::Between,
            other => return Err(format!("Unsupported comparison operator: {}", other)),
        };
        Ok(op)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub op: ComparisonOp,
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    pub fn new(field: impl Into<String>, op: ComparisonOp, value: Value) -> Self {
        Self {
            field: field.into(),
            op,
            value,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.field, self.op.symbol(), self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    First,
    Last,
    Median,
}

impl AggregateFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateFunction::Count => "count",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
            AggregateFunction::First => "first",
            AggregateFunction::Last => "last",
            AggregateFunction::Median => "median",
        }
    }

    /// Functions whose partial results can be merged
    pub fn is_decomposable(&self) -> bool {
        matches!(
            self,
            AggregateFunction::Count
                | AggregateFunction::Sum
                | AggregateFunction::Min
                | AggregateFunction::Max
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSpec {
    pub function: AggregateFunction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub alias: String,
}

impl AggregateSpec {
    pub fn new(function: AggregateFunction, field: Option<String>) -> Self {
        let alias = format!(
            "{}_{}",
            function.as_str(),
            field.as_deref().unwrap_or("all")
        );
        Self {
            function,
            field,
            alias,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    pub order: SortOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinType {
    Inner,
    Left,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinOn {
    pub left: String,
    pub right: String,
}

/// Time window attached to a filter step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TimeConstraint {
    /// Offsets such as `now`, `7d`, `2w`, `1M`, `1y`, counted back from the current instant
    Relative { start: String, end: String },
    Absolute { date: String },
}

impl TimeConstraint {
    pub fn relative(start: &str, end: &str) -> Self {
        TimeConstraint::Relative {
            start: start.to_string(),
            end: end.to_string(),
        }
    }

    /// Resolves the constraint into a concrete `[from, to]` window
    pub fn resolve(&self, now: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        match self {
            TimeConstraint::Relative { start, end } => {
                // `start` is the more recent bound in the phrase table ("now", "1d")
                let recent = now - parse_offset(start)?;
                let older = now - parse_offset(end)?;
                if older <= recent {
                    Some((older, recent))
                } else {
                    Some((recent, older))
                }
            }
            TimeConstraint::Absolute { date } => {
                let day = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
                let from = day.and_hms_opt(0, 0, 0)?.and_utc();
                Some((from, from + Duration::days(1) - Duration::seconds(1)))
            }
        }
    }
}

impl fmt::Display for TimeConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeConstraint::Relative { start, end } => write!(f, "{}..{}", end, start),
            TimeConstraint::Absolute { date } => write!(f, "{}", date),
        }
    }
}

fn parse_offset(raw: &str) -> Option<Duration> {
    if raw == "now" {
        return Some(Duration::zero());
    }
    let split = raw.find(|c: char| !c.is_ascii_digit())?;
    let (amount, unit) = raw.split_at(split);
    let amount: i64 = amount.parse().ok()?;
    match unit {
        "h" => Some(Duration::hours(amount)),
        "d" => Some(Duration::days(amount)),
        "w" => Some(Duration::weeks(amount)),
        "M" => Some(Duration::days(30 * amount)),
        "y" => Some(Duration::days(365 * amount)),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub field: String,
    pub constraint: TimeConstraint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum TransformOp {
    Project { fields: Vec<String> },
    Distinct { fields: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Correlation {
    Simple,
    Complex,
}

/// Payload of a plan step, one variant per step type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKind {
    Fetch {
        collection: String,
        #[serde(default = "all_fields")]
        fields: Vec<String>,
    },
    Filter {
        #[serde(default)]
        conditions: Vec<Condition>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time: Option<TimeWindow>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<String>,
    },
    Join {
        collection: String,
        join_type: JoinType,
        on: JoinOn,
    },
    Aggregate {
        #[serde(default)]
        group_by: Vec<String>,
        #[serde(default)]
        aggregates: Vec<AggregateSpec>,
        #[serde(default)]
        partial: bool,
    },
    Sort {
        keys: Vec<SortKey>,
    },
    Limit {
        limit: usize,
        #[serde(default)]
        offset: usize,
    },
    Transform {
        op: TransformOp,
    },
    Compute {
        expression: String,
        alias: String,
    },
    Compare {
        fields: Vec<String>,
    },
    Subquery {
        collection: String,
        correlation: Correlation,
        on: JoinOn,
        #[serde(default)]
        flattened: bool,
    },
}

fn all_fields() -> Vec<String> {
    vec!["*".to_string()]
}

impl StepKind {
    pub fn step_type(&self) -> StepType {
        match self {
            StepKind::Fetch { .. } => StepType::Fetch,
            StepKind::Filter { .. } => StepType::Filter,
            StepKind::Join { .. } => StepType::Join,
            StepKind::Aggregate { .. } => StepType::Aggregate,
            StepKind::Sort { .. } => StepType::Sort,
            StepKind::Limit { .. } => StepType::Limit,
            StepKind::Transform { .. } => StepType::Transform,
            StepKind::Compute { .. } => StepType::Compute,
            StepKind::Compare { .. } => StepType::Compare,
            StepKind::Subquery { .. } => StepType::Subquery,
        }
    }

    /// Fields this step reads
    pub fn referenced_fields(&self) -> Vec<String> {
        match self {
            StepKind::Fetch { .. } | StepKind::Limit { .. } | StepKind::Compute { .. } => {
                Vec::new()
            }
            StepKind::Filter {
                conditions, time, ..
            } => {
                let mut fields: Vec<String> = conditions.iter().map(|c| c.field.clone()).collect();
                if let Some(window) = time {
                    fields.push(window.field.clone());
                }
                fields
            }
            StepKind::Join { on, .. } | StepKind::Subquery { on, .. } => vec![on.left.clone()],
            StepKind::Aggregate {
                group_by,
                aggregates,
                ..
            } => group_by
                .iter()
                .cloned()
                .chain(aggregates.iter().filter_map(|a| a.field.clone()))
                .collect(),
            StepKind::Sort { keys } => keys.iter().map(|k| k.field.clone()).collect(),
            StepKind::Transform { op } => match op {
                TransformOp::Project { fields } | TransformOp::Distinct { fields } => {
                    fields.clone()
                }
            },
            StepKind::Compare { fields } => fields.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryStep {
    pub id: StepId,
    pub kind: StepKind,
    pub description: String,
    pub dependencies: BTreeSet<StepId>,
    pub estimated_cost: f64,
}

impl QueryStep {
    pub fn new(id: StepId, kind: StepKind, description: impl Into<String>) -> Self {
        let estimated_cost = kind.step_type().base_cost();
        Self {
            id,
            kind,
            description: description.into(),
            dependencies: BTreeSet::new(),
            estimated_cost,
        }
    }

    pub fn depends_on(mut self, dependency: StepId) -> Self {
        self.dependencies.insert(dependency);
        self
    }

    pub fn step_type(&self) -> StepType {
        self.kind.step_type()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPlan {
    pub query: String,
    pub understanding: String,
    pub intents: Vec<Intent>,
    pub steps: Vec<QueryStep>,
    pub requires_reasoning: bool,
    pub can_parallelize: bool,
    pub estimated_cost: f64,
    pub target_collections: Vec<String>,
}

impl QueryPlan {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            understanding: String::new(),
            intents: Vec::new(),
            steps: Vec::new(),
            requires_reasoning: false,
            can_parallelize: false,
            estimated_cost: 0.0,
            target_collections: Vec::new(),
        }
    }

    /// Recomputes `estimated_cost` as the sum of step costs
    pub fn recompute_cost(&mut self) {
        self.estimated_cost = self.steps.iter().map(|s| s.estimated_cost).sum();
    }

    /// True when two or more steps share an identical dependency set
    pub fn detect_parallelism(&self) -> bool {
        let mut seen = HashSet::new();
        self.steps
            .iter()
            .any(|s| !seen.insert(s.dependencies.iter().copied().collect::<Vec<_>>()))
    }

    pub fn step(&self, id: StepId) -> Option<&QueryStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn primary_collection(&self) -> Option<&str> {
        self.steps.iter().find_map(|s| match &s.kind {
            StepKind::Fetch { collection, .. } => Some(collection.as_str()),
            _ => None,
        })
    }

    pub fn count_steps(&self, step_type: StepType) -> usize {
        self.steps.iter().filter(|s| s.step_type() == step_type).count()
    }

    pub fn has_intent(&self, intent: Intent) -> bool {
        self.intents.contains(&intent)
    }

    /// Shape of the plan independent of literal values
    pub fn signature(&self) -> String {
        let shape: Vec<String> = self
            .steps
            .iter()
            .map(|s| match &s.kind {
                StepKind::Fetch { collection, .. } => format!("FETCH({})", collection),
                StepKind::Join { collection, .. } => format!("JOIN({})", collection),
                other => other.step_type().as_str().to_string(),
            })
            .collect();
        shape.join(">")
    }

    /// Ids strictly increase and every dependency points at an earlier step
    pub fn is_well_formed(&self) -> bool {
        let mut emitted: HashSet<StepId> = HashSet::new();
        let mut previous: Option<StepId> = None;
        for step in &self.steps {
            if previous.map(|p| step.id <= p).unwrap_or(false) {
                return false;
            }
            if !step.dependencies.iter().all(|d| emitted.contains(d)) {
                return false;
            }
            emitted.insert(step.id);
            previous = Some(step.id);
        }
        true
    }

    /// Rewrites dependencies into a strict linear chain following step order
    pub fn relink_linear(&mut self) {
        let mut previous: Option<StepId> = None;
        for step in &mut self.steps {
            step.dependencies.clear();
            if let Some(prev) = previous {
                step.dependencies.insert(prev);
            }
            previous = Some(step.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn linear_plan() -> QueryPlan {
        let mut plan = QueryPlan::new("q");
        plan.steps.push(QueryStep::new(
            StepId(1),
            StepKind::Fetch {
                collection: "users".into(),
                fields: all_fields(),
            },
            "fetch",
        ));
        plan.steps.push(
            QueryStep::new(
                StepId(2),
                StepKind::Filter {
                    conditions: vec![Condition::new("age", ComparisonOp::Gt, json!(21))],
                    time: None,
                    index: None,
                },
                "filter",
            )
            .depends_on(StepId(1)),
        );
        plan.recompute_cost();
        plan
    }

    #[test]
    fn test_cost_is_sum_of_steps() {
        let plan = linear_plan();
        assert!((plan.estimated_cost - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_well_formed_detects_forward_dependency() {
        let mut plan = linear_plan();
        assert!(plan.is_well_formed());
        plan.steps[0].dependencies.insert(StepId(2));
        assert!(!plan.is_well_formed());
    }

    #[test]
    fn test_parallelism_detection() {
        let mut plan = linear_plan();
        assert!(!plan.detect_parallelism());
        plan.steps.push(
            QueryStep::new(
                StepId(3),
                StepKind::Sort {
                    keys: vec![SortKey {
                        field: "age".into(),
                        order: SortOrder::Asc,
                    }],
                },
                "sort",
            )
            .depends_on(StepId(1)),
        );
        assert!(plan.detect_parallelism());
    }

    #[test]
    fn test_relative_time_resolution() {
        let now = Utc::now();
        let (from, to) = TimeConstraint::relative("1d", "2d").resolve(now).unwrap();
        assert_eq!(to, now - Duration::days(1));
        assert_eq!(from, now - Duration::days(2));

        let (from, to) = TimeConstraint::relative("now", "7d").resolve(now).unwrap();
        assert_eq!(to, now);
        assert_eq!(from, now - Duration::days(7));
    }

    #[test]
    fn test_absolute_time_resolution() {
        let window = TimeConstraint::Absolute {
            date: "2024-03-01".into(),
        };
        let (from, to) = window.resolve(Utc::now()).unwrap();
        assert_eq!(from.to_rfc3339(), "2024-03-01T00:00:00+00:00");
        assert_eq!(to.to_rfc3339(), "2024-03-01T23:59:59+00:00");
    }

    #[test]
    fn test_step_kind_serialization_is_tagged() {
        let kind = StepKind::Limit {
            limit: 10,
            offset: 0,
        };
        let value = serde_json::to_value(&kind).unwrap();
        assert_eq!(value["type"], "LIMIT");
        assert_eq!(value["limit"], 10);
    }
}
