// Multi-Step Reasoner
//
// Builds a chain-of-thought trace for compound or ambiguous prompts:
// decompose, clarify, pick a strategy, fill its template, synthesize, validate.

use regex::Regex;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::LazyLock;

use crate::models::{QueryPlan, ReasoningChain, ReasoningStepType, SchemaSnapshot};
use crate::services::semantic::{compile, compile_patterns, word_regex};

const PRONOUNS: &[&str] = &["it", "they", "them", "these", "those", "this", "that"];

const VAGUE_TIMES: &[(&str, &str)] = &[
    ("recently", "last 7 days"),
    ("a while ago", "last 30 days"),
    ("some time", "last 90 days"),
    ("previously", "before now"),
];

const FIELD_SIMILARITY: f64 = 0.8;

static SPLITTER: LazyLock<Option<Regex>> = LazyLock::new(|| compile(r"\b(?:and|then|also)\b"));
static QUOTED: LazyLock<Option<Regex>> = LazyLock::new(|| compile(r#""([^"]+)""#));
static CAPITALIZED: LazyLock<Option<Regex>> = LazyLock::new(|| compile(r"\b([A-Z][a-z]+)\b"));
static TIME_RANGES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile_patterns(&[
        r"(last \d+ (?:days?|weeks?|months?|years?))",
        r"(this (?:week|month|year))",
        r"(since \w+)",
        r"(between .+ and .+)",
    ])
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubQueryKind {
    Count,
    Aggregation,
    Comparison,
    Trend,
    Ranking,
    Filter,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubQuery {
    pub text: String,
    pub kind: SubQueryKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Ambiguity {
    Pronoun { term: String, context: String },
    Field { term: String, alternatives: Vec<String> },
    Time { term: String },
}

impl Ambiguity {
    pub fn term(&self) -> &str {
        match self {
            Ambiguity::Pronoun { term, .. }
            | Ambiguity::Field { term, .. }
            | Ambiguity::Time { term } => term,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningStrategy {
    Compare,
    Trend,
    Aggregation,
    Subquery,
    ComplexFilter,
}

impl ReasoningStrategy {
    fn template(&self) -> [&'static str; 4] {
        match self {
            ReasoningStrategy::Compare => [
                "First, I need to understand what we're comparing: {entities}",
                "Then, I'll fetch data for each comparison group",
                "Next, I'll calculate the metrics for comparison",
                "Finally, I'll present the comparison results",
            ],
            ReasoningStrategy::Trend => [
                "First, I need to identify the time range: {time_range}",
                "Then, I'll group data by time intervals",
                "Next, I'll calculate the metric for each interval",
                "Finally, I'll identify the trend pattern",
            ],
            ReasoningStrategy::ComplexFilter => [
                "First, I need to understand all filter conditions",
                "Then, I'll identify which conditions can be applied first (most selective)",
                "Next, I'll apply filters in optimal order",
                "Finally, I'll validate the filtered results",
            ],
            ReasoningStrategy::Aggregation => [
                "First, I need to identify what to aggregate: {field}",
                "Then, I'll determine the aggregation function: {function}",
                "Next, I'll identify any grouping requirements",
                "Finally, I'll compute and return the aggregated result",
            ],
            ReasoningStrategy::Subquery => [
                "First, I need to identify the inner query requirement",
                "Then, I'll execute the inner query",
                "Next, I'll use the inner query result in the outer query",
                "Finally, I'll combine results appropriately",
            ],
        }
    }
}

impl fmt::Display for ReasoningStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReasoningStrategy::Compare => "compare",
            ReasoningStrategy::Trend => "trend",
            ReasoningStrategy::Aggregation => "aggregation",
            ReasoningStrategy::Subquery => "subquery",
            ReasoningStrategy::ComplexFilter => "complex_filter",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub issues: Vec<String>,
    pub confidence: f64,
    pub step_count: usize,
}

#[derive(Debug, Clone)]
pub struct MultiStepReasoner {
    max_steps: usize,
}

impl MultiStepReasoner {
    pub fn new(max_steps: usize) -> Self {
        Self {
            max_steps: max_steps.max(1),
        }
    }

    pub fn reason(
        &self,
        prompt: &str,
        plan: &QueryPlan,
        schema: &SchemaSnapshot,
        max_steps: usize,
    ) -> ReasoningChain {
        let mut chain = ReasoningChain::new(prompt);

        let sub_queries = Self::decompose(prompt);
        chain.push(
            ReasoningStepType::Decompose,
            "Breaking down the query into components",
            format!("Identified {} sub-queries", sub_queries.len()),
            0.9,
            Some(json!(sub_queries)),
        );

        let ambiguities = Self::identify_ambiguities(prompt, schema);
        if !ambiguities.is_empty() {
            let resolutions = Self::resolve_ambiguities(&ambiguities);
            let rendered: Vec<String> = resolutions
                .iter()
                .map(|(term, resolution)| format!("{} => {}", term, resolution))
                .collect();
            chain.push(
                ReasoningStepType::Clarify,
                format!("Found {} ambiguous terms", ambiguities.len()),
                format!("Resolved: {}", rendered.join(", ")),
                0.8,
                Some(json!(resolutions)),
            );
        }

        let strategy = Self::select_strategy(prompt, plan);
        chain.push(
            ReasoningStepType::Infer,
            format!("Selected reasoning strategy: {}", strategy),
            "Apply template-based reasoning",
            0.95,
            None,
        );

        for line in Self::apply_template(strategy, prompt, schema) {
            chain.push(
                ReasoningStepType::Compute,
                line,
                "Execute reasoning step",
                0.9,
                None,
            );
            if chain.len() >= max_steps {
                break;
            }
        }

        let confidence = chain.confidence;
        chain.push(
            ReasoningStepType::Synthesize,
            "Combining all reasoning steps",
            "Generate final query execution plan",
            confidence,
            None,
        );

        let report = self.validate(&chain);
        let status = if report.valid { "valid" } else { "warning" };
        chain.push(
            ReasoningStepType::Validate,
            "Validating reasoning chain",
            format!("Validation: {}", status),
            report.confidence,
            Some(json!(report)),
        );
        chain.conclusion = Some(format!(
            "{} strategy over {} sub-queries ({})",
            strategy,
            sub_queries.len(),
            status
        ));

        tracing::debug!(
            "Reasoned over '{}' in {} steps (confidence {:.2})",
            prompt,
            chain.len(),
            chain.confidence
        );
        chain
    }

    /// Splits on "and"/"then"/"also"; the whole prompt when nothing splits
    pub fn decompose(prompt: &str) -> Vec<SubQuery> {
        let lower = prompt.to_lowercase();
        let parts: Vec<String> = match SPLITTER.as_ref() {
            Some(re) => re.split(&lower).map(|p| p.trim().to_string()).collect(),
            None => vec![lower.clone()],
        };
        let sub_queries: Vec<SubQuery> = parts
            .into_iter()
            .filter(|p| !p.is_empty())
            .map(|text| SubQuery {
                kind: Self::classify(&text),
                text,
            })
            .collect();

        if sub_queries.is_empty() {
            vec![SubQuery {
                text: prompt.to_string(),
                kind: SubQueryKind::Filter,
            }]
        } else {
            sub_queries
        }
    }

    pub fn classify(text: &str) -> SubQueryKind {
        let lower = text.to_lowercase();
        let any = |words: &[&str]| words.iter().any(|w| lower.contains(w));
        if any(&["count", "how many", "number"]) {
            SubQueryKind::Count
        } else if any(&["average", "avg", "mean", "sum", "total"]) {
            SubQueryKind::Aggregation
        } else if any(&["compare", "versus", "vs", "difference"]) {
            SubQueryKind::Comparison
        } else if any(&["trend", "over time", "growth"]) {
            SubQueryKind::Trend
        } else if any(&["top", "bottom", "highest", "lowest"]) {
            SubQueryKind::Ranking
        } else {
            SubQueryKind::Filter
        }
    }

    pub fn identify_ambiguities(prompt: &str, schema: &SchemaSnapshot) -> Vec<Ambiguity> {
        let lower = prompt.to_lowercase();
        let mut ambiguities = Vec::new();

        for pronoun in PRONOUNS {
            let mentioned = word_regex(pronoun)
                .map(|re| re.is_match(&lower))
                .unwrap_or(false);
            if mentioned {
                ambiguities.push(Ambiguity::Pronoun {
                    term: pronoun.to_string(),
                    context: Self::surrounding_words(&lower, pronoun),
                });
            }
        }

        for group in Self::similar_field_groups(schema) {
            let mentioned = group.iter().find(|f| {
                word_regex(&f.to_lowercase())
                    .map(|re| re.is_match(&lower))
                    .unwrap_or(false)
            });
            if let Some(term) = mentioned {
                ambiguities.push(Ambiguity::Field {
                    term: term.clone(),
                    alternatives: group.clone(),
                });
            }
        }

        for (term, _) in VAGUE_TIMES {
            if lower.contains(term) {
                ambiguities.push(Ambiguity::Time {
                    term: term.to_string(),
                });
            }
        }
        ambiguities
    }

    /// Term to chosen resolution, deterministic order
    pub fn resolve_ambiguities(ambiguities: &[Ambiguity]) -> BTreeMap<String, String> {
        ambiguities
            .iter()
            .map(|ambiguity| {
                let resolution = match ambiguity {
                    Ambiguity::Pronoun { context, .. } => context.clone(),
                    Ambiguity::Field { term, alternatives } => alternatives
                        .first()
                        .cloned()
                        .unwrap_or_else(|| term.clone()),
                    Ambiguity::Time { term } => VAGUE_TIMES
                        .iter()
                        .find(|(t, _)| t == term)
                        .map(|(_, default)| default.to_string())
                        .unwrap_or_else(|| "last 30 days".to_string()),
                };
                (ambiguity.term().to_string(), resolution)
            })
            .collect()
    }

    fn surrounding_words(lower: &str, term: &str) -> String {
        let words: Vec<&str> = lower.split_whitespace().collect();
        match words
            .iter()
            .position(|w| w.trim_matches(|c: char| !c.is_alphanumeric()) == term)
        {
            Some(idx) => {
                let start = idx.saturating_sub(3);
                let end = (idx + 3).min(words.len());
                words[start..end].join(" ")
            }
            None => lower.chars().take(50).collect(),
        }
    }

    /// Groups of field names whose positional character overlap reaches 0.8
    pub fn similar_field_groups(schema: &SchemaSnapshot) -> Vec<Vec<String>> {
        let fields = schema.all_fields();
        let mut seen: HashSet<Vec<String>> = HashSet::new();
        let mut groups = Vec::new();

        for field in &fields {
            let similar: Vec<String> = fields
                .iter()
                .filter(|other| *other != field && Self::char_overlap(field, other) >= FIELD_SIMILARITY)
                .cloned()
                .collect();
            if similar.is_empty() {
                continue;
            }
            let mut group = vec![field.clone()];
            group.extend(similar);
            let mut key = group.clone();
            key.sort();
            if seen.insert(key) {
                groups.push(group);
            }
        }
        groups
    }

    /// Share of aligned positions holding the same character; 0 for strings shorter than 3
    pub fn char_overlap(a: &str, b: &str) -> f64 {
        let a = a.to_lowercase();
        let b = b.to_lowercase();
        let (la, lb) = (a.chars().count(), b.chars().count());
        if la < 3 || lb < 3 {
            return 0.0;
        }
        let common = a.chars().zip(b.chars()).filter(|(x, y)| x == y).count();
        common as f64 / la.max(lb) as f64
    }

    /// Keyword precedence: compare, trend, subquery, aggregation, complex filter
    pub fn select_strategy(prompt: &str, plan: &QueryPlan) -> ReasoningStrategy {
        let lower = prompt.to_lowercase();
        if lower.contains("compare") || lower.contains("versus") {
            ReasoningStrategy::Compare
        } else if lower.contains("trend") || lower.contains("over time") {
            ReasoningStrategy::Trend
        } else if lower.contains("than") && lower.contains("average") {
            ReasoningStrategy::Subquery
        } else if ["average", "sum", "count", "total"]
            .iter()
            .any(|w| lower.contains(w))
        {
            ReasoningStrategy::Aggregation
        } else if plan.steps.len() > 4 {
            ReasoningStrategy::ComplexFilter
        } else {
            ReasoningStrategy::Aggregation
        }
    }

    pub fn apply_template(
        strategy: ReasoningStrategy,
        prompt: &str,
        schema: &SchemaSnapshot,
    ) -> Vec<String> {
        let entities = Self::entities_text(prompt);
        let time_range = Self::time_text(prompt);
        let field = Self::field_text(prompt, schema);
        let function = Self::function_text(prompt);

        strategy
            .template()
            .iter()
            .map(|line| {
                line.replace("{entities}", &entities)
                    .replace("{time_range}", &time_range)
                    .replace("{field}", &field)
                    .replace("{function}", function)
            })
            .collect()
    }

    fn entities_text(prompt: &str) -> String {
        let quoted: Vec<&str> = QUOTED
            .as_ref()
            .map(|re| {
                re.captures_iter(prompt)
                    .filter_map(|c| c.get(1))
                    .map(|m| m.as_str())
                    .collect()
            })
            .unwrap_or_default();
        if !quoted.is_empty() {
            return quoted.join(", ");
        }

        let mut capitalized: Vec<&str> = Vec::new();
        if let Some(re) = CAPITALIZED.as_ref() {
            for m in re.captures_iter(prompt).filter_map(|c| c.get(1)) {
                if !capitalized.contains(&m.as_str()) {
                    capitalized.push(m.as_str());
                }
            }
        }
        if capitalized.is_empty() {
            "the data".to_string()
        } else {
            capitalized.join(", ")
        }
    }

    fn time_text(prompt: &str) -> String {
        let lower = prompt.to_lowercase();
        TIME_RANGES
            .iter()
            .find_map(|re| re.captures(&lower).and_then(|c| c.get(1)))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| "the specified time period".to_string())
    }

    fn field_text(prompt: &str, schema: &SchemaSnapshot) -> String {
        let lower = prompt.to_lowercase();
        schema
            .all_fields()
            .into_iter()
            .find(|f| lower.contains(&f.to_lowercase()))
            .unwrap_or_else(|| "the requested field".to_string())
    }

    fn function_text(prompt: &str) -> &'static str {
        let lower = prompt.to_lowercase();
        let table: &[(&str, &str)] = &[
            ("average", "AVG"),
            ("avg", "AVG"),
            ("mean", "AVG"),
            ("sum", "SUM"),
            ("total", "SUM"),
            ("count", "COUNT"),
            ("minimum", "MIN"),
            ("maximum", "MAX"),
            ("min", "MIN"),
            ("max", "MAX"),
        ];
        table
            .iter()
            .find(|(word, _)| lower.contains(word))
            .map(|(_, function)| *function)
            .unwrap_or("COUNT")
    }

    pub fn validate(&self, chain: &ReasoningChain) -> ValidationReport {
        let mut issues = Vec::new();

        if chain.len() > self.max_steps {
            issues.push("Reasoning chain too long".to_string());
        }
        if chain.confidence < 0.5 {
            issues.push("Low confidence in reasoning".to_string());
        }
        if chain.count_of(ReasoningStepType::Decompose) > 2 {
            issues.push("Possible circular decomposition".to_string());
        }
        if chain.count_of(ReasoningStepType::Decompose) == 0
            || chain.count_of(ReasoningStepType::Synthesize) == 0
        {
            issues.push("Missing required reasoning steps".to_string());
        }

        ValidationReport {
            valid: issues.is_empty(),
            confidence: if issues.is_empty() { 0.9 } else { 0.7 },
            step_count: chain.len(),
            issues,
        }
    }
}

impl Default for MultiStepReasoner {
    fn default() -> Self {
        Self::new(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QueryPlan;

    fn plan() -> QueryPlan {
        QueryPlan::new("q")
    }

    #[test]
    fn test_chain_order_without_ambiguity() {
        let reasoner = MultiStepReasoner::new(10);
        let schema = SchemaSnapshot::new().with_collection("orders", &["amount"]);
        let chain = reasoner.reason("sum amount of orders", &plan(), &schema, 10);

        let types: Vec<ReasoningStepType> = chain.steps.iter().map(|s| s.step_type).collect();
        assert_eq!(
            types,
            vec![
                ReasoningStepType::Decompose,
                ReasoningStepType::Infer,
                ReasoningStepType::Compute,
                ReasoningStepType::Compute,
                ReasoningStepType::Compute,
                ReasoningStepType::Compute,
                ReasoningStepType::Synthesize,
                ReasoningStepType::Validate,
            ]
        );
        assert_eq!(
            chain.steps[2].thought,
            "First, I need to identify what to aggregate: amount"
        );
        assert_eq!(
            chain.steps[3].thought,
            "Then, I'll determine the aggregation function: SUM"
        );
        assert!((chain.confidence - 0.9).abs() < 1e-9);

        let trace = chain.to_trace();
        assert_eq!(
            trace[0],
            "Step 1: Breaking down the query into components -> Identified 1 sub-queries"
        );
        assert_eq!(trace.last().unwrap(), "Step 8: Validating reasoning chain -> Validation: valid");
    }

    #[test]
    fn test_compute_steps_truncated_at_max() {
        let reasoner = MultiStepReasoner::new(4);
        let chain = reasoner.reason("compare a versus b", &plan(), &SchemaSnapshot::new(), 4);
        assert_eq!(chain.count_of(ReasoningStepType::Compute), 2);
        // Synthesize and validate still follow, so the validator flags the length
        let last = chain.steps.last().unwrap();
        assert_eq!(last.step_type, ReasoningStepType::Validate);
        assert_eq!(last.action, "Validation: warning");
        assert!((chain.confidence - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_clarify_step_for_vague_time_and_pronoun() {
        let reasoner = MultiStepReasoner::default();
        let chain = reasoner.reason("show what they bought recently", &plan(), &SchemaSnapshot::new(), 10);
        let clarify = &chain.steps[1];
        assert_eq!(clarify.step_type, ReasoningStepType::Clarify);
        assert_eq!(clarify.thought, "Found 2 ambiguous terms");
        let result = clarify.result.as_ref().unwrap();
        assert_eq!(result["recently"], "last 7 days");
        assert_eq!(result["they"], "show what they bought recently");
    }

    #[test]
    fn test_similar_fields_flagged_only_when_mentioned() {
        let schema = SchemaSnapshot::new().with_collection("users", &["user_name", "user_nam", "age"]);
        assert_eq!(
            MultiStepReasoner::similar_field_groups(&schema),
            vec![vec!["user_name".to_string(), "user_nam".to_string()]]
        );
        assert!(MultiStepReasoner::identify_ambiguities("show ages", &schema).is_empty());

        let found = MultiStepReasoner::identify_ambiguities("show user_nam values", &schema);
        assert_eq!(
            found,
            vec![Ambiguity::Field {
                term: "user_nam".into(),
                alternatives: vec!["user_name".into(), "user_nam".into()],
            }]
        );
    }

    #[test]
    fn test_char_overlap() {
        assert_eq!(MultiStepReasoner::char_overlap("ab", "ab"), 0.0);
        assert!((MultiStepReasoner::char_overlap("total", "totals") - 5.0 / 6.0).abs() < 1e-9);
        assert!(MultiStepReasoner::char_overlap("price", "prize") >= 0.8);
        assert!(MultiStepReasoner::char_overlap("name", "email") < 0.8);
    }

    #[test]
    fn test_strategy_precedence() {
        let p = plan();
        assert_eq!(
            MultiStepReasoner::select_strategy("compare the trend", &p),
            ReasoningStrategy::Compare
        );
        assert_eq!(
            MultiStepReasoner::select_strategy("revenue over time", &p),
            ReasoningStrategy::Trend
        );
        assert_eq!(
            MultiStepReasoner::select_strategy("users older than the average", &p),
            ReasoningStrategy::Subquery
        );
        assert_eq!(
            MultiStepReasoner::select_strategy("count users", &p),
            ReasoningStrategy::Aggregation
        );
        assert_eq!(
            MultiStepReasoner::select_strategy("show users", &p),
            ReasoningStrategy::Aggregation
        );
    }

    #[test]
    fn test_decompose_classifies_parts() {
        let parts = MultiStepReasoner::decompose("count users and then show top 5 orders also compare regions");
        let kinds: Vec<SubQueryKind> = parts.iter().map(|p| p.kind).collect();
        assert_eq!(
            kinds,
            vec![SubQueryKind::Count, SubQueryKind::Ranking, SubQueryKind::Comparison]
        );
        assert_eq!(parts[0].text, "count users");
    }

    #[test]
    fn test_validate_flags_missing_steps() {
        let reasoner = MultiStepReasoner::default();
        let mut chain = ReasoningChain::new("q");
        chain.push(ReasoningStepType::Infer, "t", "a", 0.4, None);
        let report = reasoner.validate(&chain);
        assert!(!report.valid);
        assert!(report.issues.contains(&"Low confidence in reasoning".to_string()));
        assert!(report.issues.contains(&"Missing required reasoning steps".to_string()));
    }
}
