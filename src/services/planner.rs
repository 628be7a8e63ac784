// Query Planner Service
//
// Turns a prompt into a linear chain of typed steps. Stage order is fixed:
// FETCH, time FILTER, explicit FILTER, JOIN, GROUP, AGGREGATE, COMPARE, SORT, LIMIT.

use regex::Regex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::models::{
    AggregateFunction, AggregateSpec, ComparisonOp, Condition, Intent, JoinOn, JoinType,
    LlmQueryParse, QueryMode, QueryPlan, QueryStep, SchemaSnapshot, SortKey, SortOrder, StepId,
    StepKind, StepType, TimeConstraint, TimeWindow,
};
use crate::services::context::ConversationContext;
use crate::services::schema_inference::is_time_field;
use crate::services::semantic::{compile, compile_patterns, word_regex};

const DEFAULT_COLLECTION: &str = "default";
const DEFAULT_TIME_FIELD: &str = "created_at";
const MAX_COMPLETIONS: usize = 10;

static INTENT_PATTERNS: LazyLock<Vec<(Intent, Vec<Regex>)>> = LazyLock::new(|| {
    let table: &[(Intent, &[&str])] = &[
        (
            Intent::Retrieve,
            &[
                r"\b(show|get|find|list|display|fetch|retrieve|select)\b",
                r"\b(what|which|who)\b.*\?",
            ],
        ),
        (Intent::Count, &[r"\b(count|how many|number of|total)\b"]),
        (
            Intent::Aggregate,
            &[
                r"\b(sum|total|average|avg|mean|min|max|median)\b",
                r"\b(aggregate|summarize|statistics)\b",
            ],
        ),
        (
            Intent::Compare,
            &[
                r"\b(compare|versus|vs|difference|between)\b",
                r"\b(more than|less than|greater|smaller)\b.*\b(average|mean)\b",
            ],
        ),
        (
            Intent::Trend,
            &[
                r"\b(trend|over time|growth|change|progression)\b",
                r"\b(daily|weekly|monthly|yearly)\b.*\b(pattern|trend)\b",
            ],
        ),
        (
            Intent::Group,
            &[
                r"\b(group by|grouped|per|by each|breakdown)\b",
                r"\b(categorize|segment|partition)\b",
            ],
        ),
        (
            Intent::Filter,
            &[
                r"\b(where|filter|only|just|exclude|except|whose)\b",
                r"\b(last|past|recent|since|before|after)\b",
            ],
        ),
        (
            Intent::Join,
            &[
                r"\b(join|combine|merge|related|associated)\b",
                r"\b(and their|along with|including)\b",
            ],
        ),
        (
            Intent::Sort,
            &[r"\b(sort|sorted|order by|ordered|rank|top|bottom|highest|lowest)\b"],
        ),
    ];
    table
        .iter()
        .map(|(intent, patterns)| (*intent, compile_patterns(patterns)))
        .collect()
});

/// Phrase to (recent bound, older bound)
const TIME_PHRASES: &[(&str, &str, &str)] = &[
    ("today", "now", "1d"),
    ("yesterday", "1d", "2d"),
    ("this week", "now", "1w"),
    ("last week", "1w", "2w"),
    ("this month", "now", "1M"),
    ("last month", "1M", "2M"),
    ("this year", "now", "1y"),
    ("last year", "1y", "2y"),
    ("last 7 days", "now", "7d"),
    ("last 30 days", "now", "30d"),
    ("last 90 days", "now", "90d"),
];

static ABSOLUTE_DATE: LazyLock<Option<Regex>> =
    LazyLock::new(|| compile(r"\b(\d{4}-\d{2}-\d{2})\b"));
static QUOTED_VALUE: LazyLock<Option<Regex>> =
    LazyLock::new(|| compile(r#""([^"]+)"|'([^']+)'"#));
static NUMBER: LazyLock<Option<Regex>> = LazyLock::new(|| compile(r"\b(\d+(?:\.\d+)?)\b"));
static BY_FIELD: LazyLock<Option<Regex>> = LazyLock::new(|| compile(r"\bby\s+(\w+)"));
static LIMIT: LazyLock<Option<Regex>> =
    LazyLock::new(|| compile(r"\b(?:top|first|limit|bottom|last)\s+(\d+)\b"));
static LEADING_INT: LazyLock<Option<Regex>> = LazyLock::new(|| compile(r"\b(\d+)\b"));

// Longer operator phrases come first; alternation picks the leftmost branch.
const OPERATOR_PATTERN: &str = r"(>=|<=|!=|<>|==|=|>|<|greater than or equal to|less than or equal to|at least|at most|not equal to|is not|greater than|more than|above|over|less than|fewer than|below|under|equals|equal to|is|contains|like|starts with|ends with)";
const VALUE_PATTERN: &str = r#"("[^"]*"|'[^']*'|-?\d+(?:\.\d+)?|[\w@.\-]+)"#;

static AGGREGATIONS: LazyLock<Vec<(AggregateFunction, Regex)>> = LazyLock::new(|| {
    let table: &[(AggregateFunction, &str)] = &[
        (AggregateFunction::Count, r"\bcount\b|\bhow many\b|\bnumber of\b"),
        (AggregateFunction::Sum, r"\bsum\b|\btotal\b"),
        (AggregateFunction::Avg, r"\baverage\b|\bavg\b|\bmean\b"),
        (AggregateFunction::Min, r"\bmin\b|\bminimum\b|\blowest\b"),
        (AggregateFunction::Max, r"\bmax\b|\bmaximum\b|\bhighest\b"),
        (AggregateFunction::Median, r"\bmedian\b"),
    ];
    table
        .iter()
        .filter_map(|(function, pattern)| compile(pattern).map(|re| (*function, re)))
        .collect()
});

/// Entities the planner found in a prompt
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptEntities {
    pub collections: Vec<String>,
    pub fields: Vec<String>,
    pub values: Vec<String>,
}

/// Conversation state the planner may draw on
#[derive(Debug, Clone, Default)]
pub struct PlanningContext {
    pub active_collection: Option<String>,
    pub active_filters: BTreeMap<String, Value>,
    pub last_query: Option<String>,
}

impl From<&ConversationContext> for PlanningContext {
    fn from(ctx: &ConversationContext) -> Self {
        Self {
            active_collection: ctx.active_collection(),
            active_filters: ctx.active_filters().clone(),
            last_query: ctx.last_turn().map(|t| t.query.clone()),
        }
    }
}

/// Builds a strictly linear step chain with monotonically increasing ids
struct StepChain {
    next_id: u32,
    steps: Vec<QueryStep>,
}

impl StepChain {
    fn new() -> Self {
        Self {
            next_id: 1,
            steps: Vec::new(),
        }
    }

    fn push(&mut self, kind: StepKind, description: impl Into<String>) {
        let id = StepId(self.next_id);
        self.next_id += 1;
        let mut step = QueryStep::new(id, kind, description);
        if let Some(previous) = self.steps.last() {
            step = step.depends_on(previous.id);
        }
        self.steps.push(step);
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryPlanner;

impl QueryPlanner {
    pub fn new() -> Self {
        Self
    }

    pub fn create_plan(
        &self,
        prompt: &str,
        schema: &SchemaSnapshot,
        context: Option<&PlanningContext>,
        mode: QueryMode,
    ) -> QueryPlan {
        self.build_plan(prompt, schema, context, mode, None)
    }

    /// Same as [`create_plan`](Self::create_plan) with language-model hints merged in
    pub fn create_plan_with_hints(
        &self,
        prompt: &str,
        schema: &SchemaSnapshot,
        context: Option<&PlanningContext>,
        mode: QueryMode,
        hints: &LlmQueryParse,
    ) -> QueryPlan {
        self.build_plan(prompt, schema, context, mode, Some(hints))
    }

    fn build_plan(
        &self,
        prompt: &str,
        schema: &SchemaSnapshot,
        context: Option<&PlanningContext>,
        mode: QueryMode,
        hints: Option<&LlmQueryParse>,
    ) -> QueryPlan {
        let lower = prompt.to_lowercase();
        let intents = Self::detect_intents(&lower);
        let entities = Self::extract_entities(prompt, schema);
        let time = Self::extract_time_constraint(&lower);

        let primary = hints
            .and_then(|h| h.collection.clone())
            .filter(|c| schema.is_empty() || schema.has_collection(c))
            .or_else(|| entities.collections.first().cloned())
            .unwrap_or_else(|| Self::infer_collection(&lower, schema, context));

        let mut chain = StepChain::new();
        chain.push(
            StepKind::Fetch {
                collection: primary.clone(),
                fields: vec!["*".to_string()],
            },
            format!("Fetch data from {}", primary),
        );

        if let Some((phrase, constraint)) = time {
            let field = Self::time_field(schema, &primary);
            chain.push(
                StepKind::Filter {
                    conditions: Vec::new(),
                    time: Some(TimeWindow { field, constraint }),
                    index: None,
                },
                format!("Apply time filter: {}", phrase),
            );
        }

        let mut conditions = if intents.contains(&Intent::Filter) {
            Self::extract_conditions(prompt, &entities.fields)
        } else {
            Vec::new()
        };
        if mode == QueryMode::Conversational {
            if let Some(ctx) = context {
                for (field, value) in &ctx.active_filters {
                    if !conditions.iter().any(|c| &c.field == field) {
                        conditions.push(Condition::new(field.clone(), ComparisonOp::Eq, value.clone()));
                    }
                }
            }
        }
        if let Some(hints) = hints {
            for condition in &hints.filters {
                if !conditions.iter().any(|c| c.field == condition.field) {
                    conditions.push(condition.clone());
                }
            }
        }
        if !conditions.is_empty() {
            let rendered: Vec<String> = conditions.iter().map(|c| c.to_string()).collect();
            chain.push(
                StepKind::Filter {
                    conditions,
                    time: None,
                    index: None,
                },
                format!("Apply filters: {}", rendered.join(" AND ")),
            );
        }

        if intents.contains(&Intent::Join) && entities.collections.len() > 1 {
            for secondary in entities.collections.iter().filter(|c| **c != primary) {
                chain.push(
                    StepKind::Join {
                        collection: secondary.clone(),
                        join_type: JoinType::Inner,
                        on: Self::join_keys(schema, &primary, secondary),
                    },
                    format!("Join with {}", secondary),
                );
            }
        }

        let group_by = if intents.contains(&Intent::Group) {
            let fields = Self::extract_group_fields(&lower, &entities);
            chain.push(
                StepKind::Aggregate {
                    group_by: fields.clone(),
                    aggregates: Vec::new(),
                    partial: false,
                },
                format!("Group by {}", fields.join(", ")),
            );
            fields
        } else {
            Vec::new()
        };

        if intents.contains(&Intent::Aggregate) || intents.contains(&Intent::Count) {
            let function = Self::detect_aggregation(&lower);
            let field = match function {
                AggregateFunction::Count => None,
                _ => entities
                    .fields
                    .iter()
                    .find(|f| !group_by.contains(f))
                    .cloned(),
            };
            let spec = AggregateSpec::new(function, field);
            chain.push(
                StepKind::Aggregate {
                    group_by: Vec::new(),
                    aggregates: vec![spec],
                    partial: false,
                },
                format!("Calculate {}", function.as_str()),
            );
        }

        if intents.contains(&Intent::Compare) {
            chain.push(
                StepKind::Compare {
                    fields: entities.fields.clone(),
                },
                "Compare datasets",
            );
        }

        let hinted_sort = hints.and_then(|h| h.sort.clone());
        if intents.contains(&Intent::Sort) || hinted_sort.is_some() {
            let key = hinted_sort.unwrap_or_else(|| Self::extract_sort(&lower));
            let order = match key.order {
                SortOrder::Asc => "ASC",
                SortOrder::Desc => "DESC",
            };
            let description = format!("Sort by {} {}", key.field, order);
            chain.push(StepKind::Sort { keys: vec![key] }, description);
        }

        if let Some(limit) = Self::extract_limit(&lower).or_else(|| hints.and_then(|h| h.limit)) {
            chain.push(
                StepKind::Limit { limit, offset: 0 },
                format!("Limit to {} results", limit),
            );
        }

        let mut plan = QueryPlan::new(prompt);
        plan.understanding = Self::understand(prompt, &intents);
        plan.steps = chain.steps;
        plan.requires_reasoning = Self::requires_reasoning(&intents, &plan);
        plan.can_parallelize = plan.detect_parallelism();
        plan.recompute_cost();
        plan.target_collections = plan
            .steps
            .iter()
            .filter_map(|s| match &s.kind {
                StepKind::Fetch { collection, .. } | StepKind::Join { collection, .. } => {
                    Some(collection.clone())
                }
                _ => None,
            })
            .collect();
        plan.intents = intents;

        tracing::debug!(
            "Planned {} steps for '{}' (cost {:.2}, reasoning: {})",
            plan.steps.len(),
            prompt,
            plan.estimated_cost,
            plan.requires_reasoning
        );
        plan
    }

    /// Every intent with at least one pattern hit, `retrieve` when none match
    pub fn detect_intents(prompt: &str) -> Vec<Intent> {
        let lower = prompt.to_lowercase();
        let mut detected: Vec<Intent> = INTENT_PATTERNS
            .iter()
            .filter(|(_, patterns)| patterns.iter().any(|re| re.is_match(&lower)))
            .map(|(intent, _)| *intent)
            .collect();
        if detected.is_empty() {
            detected.push(Intent::Retrieve);
        }
        detected
    }

    pub fn extract_entities(prompt: &str, schema: &SchemaSnapshot) -> PromptEntities {
        let lower = prompt.to_lowercase();
        let mut entities = PromptEntities::default();

        for collection in &schema.collections {
            let name = collection.to_lowercase();
            let stem = name.trim_end_matches('s');
            let mentioned = [name.as_str(), stem]
                .iter()
                .filter(|w| !w.is_empty())
                .filter_map(|w| word_regex(w))
                .any(|re| re.is_match(&lower));
            if mentioned && !entities.collections.contains(collection) {
                entities.collections.push(collection.clone());
            }
        }

        for field in schema.all_fields() {
            let mentioned = word_regex(&field.to_lowercase())
                .map(|re| re.is_match(&lower))
                .unwrap_or(false);
            if mentioned && !entities.fields.contains(&field) {
                entities.fields.push(field);
            }
        }

        if let Some(re) = QUOTED_VALUE.as_ref() {
            for caps in re.captures_iter(prompt) {
                if let Some(m) = caps.get(1).or_else(|| caps.get(2)) {
                    entities.values.push(m.as_str().to_string());
                }
            }
        }
        if let Some(re) = NUMBER.as_ref() {
            entities
                .values
                .extend(re.captures_iter(prompt).filter_map(|c| c.get(1)).map(|m| m.as_str().to_string()));
        }
        entities
    }

    /// Phrase table first, then an absolute `YYYY-MM-DD` date
    pub fn extract_time_constraint(prompt: &str) -> Option<(String, TimeConstraint)> {
        let lower = prompt.to_lowercase();
        if let Some((phrase, start, end)) = TIME_PHRASES.iter().find(|(p, _, _)| lower.contains(p)) {
            return Some((phrase.to_string(), TimeConstraint::relative(start, end)));
        }
        ABSOLUTE_DATE
            .as_ref()
            .and_then(|re| re.captures(&lower))
            .and_then(|caps| caps.get(1))
            .map(|m| {
                (
                    m.as_str().to_string(),
                    TimeConstraint::Absolute {
                        date: m.as_str().to_string(),
                    },
                )
            })
    }

    fn infer_collection(
        lower: &str,
        schema: &SchemaSnapshot,
        context: Option<&PlanningContext>,
    ) -> String {
        let partial = schema.collections.iter().find(|collection| {
            collection
                .to_lowercase()
                .split('_')
                .filter(|part| part.len() >= 3)
                .any(|part| lower.contains(part))
        });
        if let Some(collection) = partial {
            return collection.clone();
        }

        if let Some(active) = context.and_then(|c| c.active_collection.as_ref()) {
            if schema.is_empty() || schema.has_collection(active) {
                return active.clone();
            }
        }

        schema
            .collections
            .first()
            .cloned()
            .unwrap_or_else(|| DEFAULT_COLLECTION.to_string())
    }

    fn time_field(schema: &SchemaSnapshot, collection: &str) -> String {
        schema
            .fields_of(collection)
            .iter()
            .find(|f| is_time_field(f))
            .cloned()
            .unwrap_or_else(|| DEFAULT_TIME_FIELD.to_string())
    }

    /// Conditions written next to a known field, e.g. `age > 21` or `status is "active"`
    pub fn extract_conditions(prompt: &str, fields: &[String]) -> Vec<Condition> {
        let mut ordered: Vec<&String> = fields.iter().collect();
        ordered.sort_by(|a, b| b.len().cmp(&a.len()));

        let mut conditions: Vec<Condition> = Vec::new();
        for field in ordered {
            if conditions.iter().any(|c| &c.field == field) {
                continue;
            }
            let escaped = regex::escape(field);

            let between = compile(&format!(
                r"(?i)\b{}\s+between\s+{}\s+and\s+{}",
                escaped, VALUE_PATTERN, VALUE_PATTERN
            ));
            if let Some(caps) = between.as_ref().and_then(|re| re.captures(prompt)) {
                let low = caps.get(1).map(|m| parse_value(m.as_str())).unwrap_or(Value::Null);
                let high = caps.get(2).map(|m| parse_value(m.as_str())).unwrap_or(Value::Null);
                conditions.push(Condition::new(
                    field.clone(),
                    ComparisonOp::Between,
                    json!([low, high]),
                ));
                continue;
            }

            let simple = compile(&format!(
                r"(?i)\b{}\s*{}\s*{}",
                escaped, OPERATOR_PATTERN, VALUE_PATTERN
            ));
            if let Some(caps) = simple.as_ref().and_then(|re| re.captures(prompt)) {
                let (Some(op), Some(raw)) = (caps.get(1), caps.get(2)) else {
                    continue;
                };
                let mut op = operator_from_phrase(op.as_str());
                let value = parse_value(raw.as_str());
                if value.is_null() {
                    op = match op {
                        ComparisonOp::Ne => ComparisonOp::IsNotNull,
                        _ => ComparisonOp::IsNull,
                    };
                }
                conditions.push(Condition::new(field.clone(), op, value));
            }
        }

        // Restore prompt order
        conditions.sort_by_key(|c| {
            prompt
                .to_lowercase()
                .find(&c.field.to_lowercase())
                .unwrap_or(usize::MAX)
        });
        conditions
    }

    fn join_keys(schema: &SchemaSnapshot, primary: &str, secondary: &str) -> JoinOn {
        let declared = schema.relationships.iter().find_map(|r| {
            if r.source_collection == primary && r.target_collection == secondary {
                Some(JoinOn {
                    left: r.source_field.clone(),
                    right: r.target_field.clone(),
                })
            } else if r.source_collection == secondary && r.target_collection == primary {
                Some(JoinOn {
                    left: r.target_field.clone(),
                    right: r.source_field.clone(),
                })
            } else {
                None
            }
        });
        if let Some(on) = declared {
            return on;
        }

        let secondary_fk = format!("{}_id", secondary.trim_end_matches('s'));
        if schema.fields_of(primary).contains(&secondary_fk) {
            return JoinOn {
                left: secondary_fk,
                right: "id".to_string(),
            };
        }
        JoinOn {
            left: "id".to_string(),
            right: format!("{}_id", primary.trim_end_matches('s')),
        }
    }

    fn extract_group_fields(lower: &str, entities: &PromptEntities) -> Vec<String> {
        if let Some(field) = BY_FIELD
            .as_ref()
            .and_then(|re| re.captures(lower))
            .and_then(|caps| caps.get(1))
        {
            let word = field.as_str();
            let known = entities
                .fields
                .iter()
                .find(|f| f.to_lowercase() == word)
                .cloned();
            return vec![known.unwrap_or_else(|| word.to_string())];
        }
        entities
            .fields
            .first()
            .map(|f| vec![f.clone()])
            .unwrap_or_else(|| vec!["id".to_string()])
    }

    /// First matching aggregation, `count` otherwise
    pub fn detect_aggregation(prompt: &str) -> AggregateFunction {
        let lower = prompt.to_lowercase();
        AGGREGATIONS
            .iter()
            .find(|(_, re)| re.is_match(&lower))
            .map(|(function, _)| *function)
            .unwrap_or(AggregateFunction::Count)
    }

    fn extract_sort(lower: &str) -> SortKey {
        let has = |words: &[&str]| {
            words
                .iter()
                .filter_map(|w| word_regex(w))
                .any(|re| re.is_match(lower))
        };
        let order = if has(&["top", "highest", "most", "desc", "descending"]) {
            SortOrder::Desc
        } else if has(&["bottom", "lowest", "least", "asc", "ascending"]) {
            SortOrder::Asc
        } else {
            SortOrder::Desc
        };
        let field = BY_FIELD
            .as_ref()
            .and_then(|re| re.captures(lower))
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| DEFAULT_TIME_FIELD.to_string());
        SortKey { field, order }
    }

    pub fn extract_limit(prompt: &str) -> Option<usize> {
        let lower = prompt.to_lowercase();
        if let Some(limit) = LIMIT
            .as_ref()
            .and_then(|re| re.captures(&lower))
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
        {
            return Some(limit);
        }
        let ranked = ["top", "first"]
            .iter()
            .filter_map(|w| word_regex(w))
            .any(|re| re.is_match(&lower));
        if ranked {
            return LEADING_INT
                .as_ref()
                .and_then(|re| re.captures(&lower))
                .and_then(|caps| caps.get(1))
                .and_then(|m| m.as_str().parse().ok());
        }
        None
    }

    fn requires_reasoning(intents: &[Intent], plan: &QueryPlan) -> bool {
        intents
            .iter()
            .any(|i| matches!(i, Intent::Compare | Intent::Trend | Intent::Join))
            || plan.steps.len() > 5
            || plan.count_steps(StepType::Subquery) > 0
    }

    fn understand(prompt: &str, intents: &[Intent]) -> String {
        let lead = if intents.contains(&Intent::Compare) {
            "Comparing data based on"
        } else if intents.contains(&Intent::Aggregate) {
            "Calculating aggregated metrics"
        } else if intents.contains(&Intent::Trend) {
            "Analyzing trends over time"
        } else if intents.contains(&Intent::Count) {
            "Counting records"
        } else if intents.contains(&Intent::Retrieve) {
            "Retrieving data"
        } else {
            "Processing query"
        };
        format!("{}: {}", lead, prompt)
    }

    /// Template completions for a partially typed prompt, at most ten
    pub fn suggest_completions(
        &self,
        partial: &str,
        schema: &SchemaSnapshot,
        context: Option<&PlanningContext>,
    ) -> Vec<String> {
        let lower = partial.trim().to_lowercase();
        let mut suggestions = Vec::new();

        for collection in &schema.collections {
            if partial.to_lowercase().ends_with("from ") || partial.to_lowercase().ends_with("in ") {
                suggestions.push(format!("{}{}", partial, collection));
            } else if lower.is_empty() {
                suggestions.push(format!("Show me all {}", collection));
                suggestions.push(format!("Count {}", collection));
            }
        }

        let templates: &[(&str, &[&str])] = &[
            ("show", &["Show me all [collection]", "Show top 10 [collection] by [field]"]),
            ("find", &["Find [collection] where [condition]", "Find all [collection]"]),
            ("count", &["Count [collection]", "How many [collection] are there?"]),
            ("compare", &["Compare [field] between [group1] and [group2]"]),
            ("trend", &["Show [field] trend over time", "What's the [field] pattern?"]),
        ];
        for (prefix, options) in templates {
            if !lower.is_empty() && lower.starts_with(prefix) {
                suggestions.extend(options.iter().map(|s| s.to_string()));
            }
        }

        if context.and_then(|c| c.last_query.as_ref()).is_some() {
            suggestions.push("Same as before but filtered by [condition]".to_string());
            suggestions.push("Group the previous results by [field]".to_string());
        }

        suggestions.truncate(MAX_COMPLETIONS);
        suggestions
    }
}

fn operator_from_phrase(phrase: &str) -> ComparisonOp {
    match phrase.to_lowercase().as_str() {
        ">=" | "greater than or equal to" | "at least" => ComparisonOp::Ge,
        "<=" | "less than or equal to" | "at most" => ComparisonOp::Le,
        "!=" | "<>" | "not equal to" | "is not" => ComparisonOp::Ne,
        ">" | "greater than" | "more than" | "above" | "over" => ComparisonOp::Gt,
        "<" | "less than" | "fewer than" | "below" | "under" => ComparisonOp::Lt,
        "contains" | "like" => ComparisonOp::Contains,
        "starts with" => ComparisonOp::StartsWith,
        "ends with" => ComparisonOp::EndsWith,
        _ => ComparisonOp::Eq,
    }
}

/// Quoted text stays a string; numbers, booleans and `null` become JSON scalars
fn parse_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.len() >= 2
        && ((trimmed.starts_with('"') && trimmed.ends_with('"'))
            || (trimmed.starts_with('\'') && trimmed.ends_with('\'')))
    {
        return Value::String(trimmed[1..trimmed.len() - 1].to_string());
    }
    if let Ok(int) = trimmed.parse::<i64>() {
        return json!(int);
    }
    if let Ok(float) = trimmed.parse::<f64>() {
        if float.is_finite() && trimmed.chars().any(|c| c.is_ascii_digit()) {
            return json!(float);
        }
    }
    match trimmed.to_lowercase().as_str() {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" => Value::Null,
        _ => Value::String(trimmed.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Relationship, RelationshipType};

    fn users_schema() -> SchemaSnapshot {
        SchemaSnapshot::new().with_collection("users", &["age"])
    }

    #[test]
    fn test_count_with_filter_scenario() {
        let planner = QueryPlanner::new();
        let plan = planner.create_plan(
            "count users where age > 21",
            &users_schema(),
            None,
            QueryMode::Simple,
        );

        let types: Vec<StepType> = plan.steps.iter().map(|s| s.step_type()).collect();
        assert_eq!(
            types,
            vec![StepType::Fetch, StepType::Filter, StepType::Aggregate]
        );
        assert_eq!(plan.primary_collection(), Some("users"));
        match &plan.steps[1].kind {
            StepKind::Filter { conditions, .. } => {
                assert_eq!(conditions, &vec![Condition::new("age", ComparisonOp::Gt, json!(21))]);
            }
            other => panic!("unexpected step {:?}", other),
        }
        match &plan.steps[2].kind {
            StepKind::Aggregate { aggregates, .. } => {
                assert_eq!(aggregates[0].function, AggregateFunction::Count);
                assert_eq!(aggregates[0].field, None);
            }
            other => panic!("unexpected step {:?}", other),
        }
        assert!((plan.estimated_cost - 3.0).abs() < 1e-9);
        assert!(plan.has_intent(Intent::Count));
        assert!(!plan.requires_reasoning);
    }

    #[test]
    fn test_plan_is_linear_and_cost_additive() {
        let schema = SchemaSnapshot::new()
            .with_collection("orders", &["total", "status", "created_at"]);
        let plan = QueryPlanner::new().create_plan(
            "show top 5 orders by total where status = 'paid' in the last 30 days",
            &schema,
            None,
            QueryMode::Simple,
        );

        assert!(plan.is_well_formed());
        for pair in plan.steps.windows(2) {
            assert_eq!(pair[1].dependencies.iter().copied().collect::<Vec<_>>(), vec![pair[0].id]);
        }
        let sum: f64 = plan.steps.iter().map(|s| s.estimated_cost).sum();
        assert!((plan.estimated_cost - sum).abs() < 1e-9);
        assert!(!plan.can_parallelize);

        let types: Vec<StepType> = plan.steps.iter().map(|s| s.step_type()).collect();
        assert_eq!(
            types,
            vec![
                StepType::Fetch,
                StepType::Filter,
                StepType::Filter,
                StepType::Aggregate,
                StepType::Sort,
                StepType::Limit
            ]
        );
        match &plan.steps[1].kind {
            StepKind::Filter { time: Some(window), .. } => {
                assert_eq!(window.field, "created_at");
                assert_eq!(window.constraint, TimeConstraint::relative("now", "30d"));
            }
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn test_unknown_collection_falls_back() {
        let planner = QueryPlanner::new();
        let plan = planner.create_plan("show everything", &SchemaSnapshot::new(), None, QueryMode::Simple);
        assert_eq!(plan.primary_collection(), Some("default"));

        let schema = SchemaSnapshot::new()
            .with_collection("accounts", &["id"])
            .with_collection("order_items", &["id"]);
        let plan = planner.create_plan("list the items", &schema, None, QueryMode::Simple);
        assert_eq!(plan.primary_collection(), Some("order_items"));

        let plan = planner.create_plan("list everything", &schema, None, QueryMode::Simple);
        assert_eq!(plan.primary_collection(), Some("accounts"));

        let ctx = PlanningContext {
            active_collection: Some("order_items".into()),
            ..Default::default()
        };
        let plan = planner.create_plan("list everything", &schema, Some(&ctx), QueryMode::Simple);
        assert_eq!(plan.primary_collection(), Some("order_items"));
    }

    #[test]
    fn test_join_uses_relationship_keys() {
        let mut schema = SchemaSnapshot::new()
            .with_collection("users", &["id", "name"])
            .with_collection("orders", &["id", "user_id", "total"]);
        schema.relationships.push(Relationship {
            source_collection: "orders".into(),
            source_field: "user_id".into(),
            target_collection: "users".into(),
            target_field: "id".into(),
            relationship_type: RelationshipType::ManyToOne,
            confidence: 0.8,
        });

        let plan = QueryPlanner::new().create_plan(
            "join users with orders",
            &schema,
            None,
            QueryMode::Simple,
        );
        let join = plan.steps.iter().find_map(|s| match &s.kind {
            StepKind::Join { collection, on, .. } => Some((collection.clone(), on.clone())),
            _ => None,
        });
        let (collection, on) = join.unwrap();
        assert_eq!(collection, "orders");
        assert_eq!(on.left, "id");
        assert_eq!(on.right, "user_id");
        assert!(plan.requires_reasoning);
        assert_eq!(plan.target_collections, vec!["users", "orders"]);
    }

    #[test]
    fn test_group_then_aggregate() {
        let schema = SchemaSnapshot::new().with_collection("orders", &["amount", "status"]);
        let plan = QueryPlanner::new().create_plan(
            "average amount per status, grouped by status",
            &schema,
            None,
            QueryMode::Simple,
        );
        let aggregates: Vec<&StepKind> = plan
            .steps
            .iter()
            .filter(|s| s.step_type() == StepType::Aggregate)
            .map(|s| &s.kind)
            .collect();
        assert_eq!(aggregates.len(), 2);
        match aggregates[0] {
            StepKind::Aggregate { group_by, aggregates, .. } => {
                assert_eq!(group_by, &vec!["status".to_string()]);
                assert!(aggregates.is_empty());
            }
            other => panic!("unexpected step {:?}", other),
        }
        match aggregates[1] {
            StepKind::Aggregate { aggregates, .. } => {
                assert_eq!(aggregates[0].function, AggregateFunction::Avg);
                assert_eq!(aggregates[0].field.as_deref(), Some("amount"));
            }
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn test_extract_conditions_variants() {
        let fields = vec!["status".to_string(), "age".to_string(), "name".to_string()];
        let conditions = QueryPlanner::extract_conditions(
            "users whose name is \"Ann Lee\" and age between 20 and 30 and status != null",
            &fields,
        );
        assert_eq!(
            conditions,
            vec![
                Condition::new("name", ComparisonOp::Eq, json!("Ann Lee")),
                Condition::new("age", ComparisonOp::Between, json!([20, 30])),
                Condition::new("status", ComparisonOp::IsNotNull, Value::Null),
            ]
        );

        let conditions =
            QueryPlanner::extract_conditions("age at least 18.5", &["age".to_string()]);
        assert_eq!(conditions, vec![Condition::new("age", ComparisonOp::Ge, json!(18.5))]);
    }

    #[test]
    fn test_conversational_mode_applies_active_filters() {
        let mut ctx = PlanningContext::default();
        ctx.active_filters.insert("status".into(), json!("active"));
        let planner = QueryPlanner::new();

        let plan = planner.create_plan("show users", &users_schema(), Some(&ctx), QueryMode::Conversational);
        assert_eq!(plan.count_steps(StepType::Filter), 1);

        let plan = planner.create_plan("show users", &users_schema(), Some(&ctx), QueryMode::Simple);
        assert_eq!(plan.count_steps(StepType::Filter), 0);
    }

    #[test]
    fn test_hints_are_merged() {
        let hints = LlmQueryParse {
            collection: Some("users".into()),
            filters: vec![Condition::new("age", ComparisonOp::Ge, json!(30))],
            limit: Some(3),
            sort: Some(SortKey {
                field: "age".into(),
                order: SortOrder::Asc,
            }),
            ..Default::default()
        };
        let plan = QueryPlanner::new().create_plan_with_hints(
            "the grown ups",
            &users_schema(),
            None,
            QueryMode::Simple,
            &hints,
        );
        let types: Vec<StepType> = plan.steps.iter().map(|s| s.step_type()).collect();
        assert_eq!(
            types,
            vec![StepType::Fetch, StepType::Filter, StepType::Sort, StepType::Limit]
        );
    }

    #[test]
    fn test_intents_and_limits() {
        assert_eq!(QueryPlanner::detect_intents("hello"), vec![Intent::Retrieve]);
        let intents = QueryPlanner::detect_intents("compare revenue trend");
        assert!(intents.contains(&Intent::Compare));
        assert!(intents.contains(&Intent::Trend));

        assert_eq!(QueryPlanner::extract_limit("top 10 users"), Some(10));
        assert_eq!(QueryPlanner::extract_limit("the top users, 7 of them"), Some(7));
        assert_eq!(QueryPlanner::extract_limit("users over 21"), None);
        assert_eq!(
            QueryPlanner::detect_aggregation("what is the average age"),
            AggregateFunction::Avg
        );
    }

    #[test]
    fn test_time_constraints() {
        let (phrase, constraint) =
            QueryPlanner::extract_time_constraint("orders from yesterday").unwrap();
        assert_eq!(phrase, "yesterday");
        assert_eq!(constraint, TimeConstraint::relative("1d", "2d"));

        let (_, constraint) = QueryPlanner::extract_time_constraint("orders on 2024-03-01").unwrap();
        assert_eq!(
            constraint,
            TimeConstraint::Absolute {
                date: "2024-03-01".into()
            }
        );
        assert!(QueryPlanner::extract_time_constraint("all orders").is_none());
    }

    #[test]
    fn test_suggest_completions() {
        let schema = SchemaSnapshot::new()
            .with_collection("users", &["id"])
            .with_collection("orders", &["id"]);
        let planner = QueryPlanner::new();

        let empty = planner.suggest_completions("", &schema, None);
        assert_eq!(
            empty,
            vec!["Show me all users", "Count users", "Show me all orders", "Count orders"]
        );

        let from = planner.suggest_completions("select name from ", &schema, None);
        assert_eq!(from, vec!["select name from users", "select name from orders"]);

        let ctx = PlanningContext {
            last_query: Some("count users".into()),
            ..Default::default()
        };
        let counted = planner.suggest_completions("count", &schema, Some(&ctx));
        assert_eq!(counted.len(), 4);
        assert!(counted.len() <= MAX_COMPLETIONS);
    }
}
