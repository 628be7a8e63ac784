// Semantic Parser Service
//
// Pattern-based understanding of free-text questions: normalisation, intent
// scoring, entity extraction, time/quantity expressions, typo correction and
// synonym expansion. Heuristic by nature; every function is deterministic.

use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, LazyLock};

use crate::models::{
    ComparisonType, EntityKind, ExtractedEntity, QuantityExpression, SchemaSnapshot,
    SemanticIntent, SemanticParseResult, TimeExpression,
};
use crate::services::embedding::{cosine_similarity, EmbeddingProvider};

/// Compiles a literal pattern table. Patterns are static, so none are expected to fail.
pub(crate) fn compile_patterns(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| match Regex::new(p) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::error!("Invalid pattern {}: {}", p, e);
                None
            }
        })
        .collect()
}

pub(crate) fn compile(pattern: &str) -> Option<Regex> {
    compile_patterns(&[pattern]).into_iter().next()
}

/// Regex matching `word` as a whole word
pub(crate) fn word_regex(word: &str) -> Option<Regex> {
    compile(&format!(r"\b{}\b", regex::escape(word)))
}

const CONTRACTIONS: &[(&str, &str)] = &[
    ("don't", "do not"),
    ("doesn't", "does not"),
    ("didn't", "did not"),
    ("won't", "will not"),
    ("can't", "cannot"),
    ("isn't", "is not"),
    ("aren't", "are not"),
    ("wasn't", "was not"),
    ("weren't", "were not"),
    ("haven't", "have not"),
    ("hasn't", "has not"),
    ("hadn't", "had not"),
];

// Ties go to the earlier row.
static INTENT_PATTERNS: LazyLock<Vec<(SemanticIntent, Vec<Regex>)>> = LazyLock::new(|| {
    let table: &[(SemanticIntent, &[&str])] = &[
        (
            SemanticIntent::Count,
            &[r"\bhow many\b", r"\bcount\b", r"\bnumber of\b", r"\btotal\b.*\brecords?\b"],
        ),
        (
            SemanticIntent::Sum,
            &[r"\bsum\b", r"\btotal\b.*\bamount\b", r"\badd up\b"],
        ),
        (
            SemanticIntent::Average,
            &[r"\baverage\b", r"\bavg\b", r"\bmean\b"],
        ),
        (
            SemanticIntent::Min,
            &[r"\bminimum\b", r"\bmin\b", r"\blowest\b", r"\bsmallest\b"],
        ),
        (
            SemanticIntent::Max,
            &[r"\bmaximum\b", r"\bmax\b", r"\bhighest\b", r"\blargest\b", r"\bbiggest\b"],
        ),
        (
            SemanticIntent::Group,
            &[r"\bgroup(ed)? by\b", r"\bper\b", r"\bby\b.*\bcategory\b", r"\bfor each\b"],
        ),
        (
            SemanticIntent::Compare,
            &[r"\bcompare\b", r"\bversus\b", r"\bvs\b", r"\bdifference between\b"],
        ),
        (
            SemanticIntent::Trend,
            &[r"\btrends?\b", r"\bover time\b", r"\bgrowth\b", r"\bchange\b.*\btime\b"],
        ),
        (
            SemanticIntent::TopN,
            &[r"\btop\s+\d+", r"\bbest\b", r"\bhighest\s+\d+"],
        ),
        (
            SemanticIntent::BottomN,
            &[r"\bbottom\s+\d+", r"\bworst\b", r"\blowest\s+\d+"],
        ),
        (
            SemanticIntent::Distinct,
            &[r"\bunique\b", r"\bdistinct\b", r"\bdifferent\b"],
        ),
        (
            SemanticIntent::Exists,
            &[r"\bis there\b", r"\bare there\b", r"\bdoes\b.*\bexist", r"\bany\b"],
        ),
        (
            SemanticIntent::Search,
            &[r"\bsearch\b", r"\bfind\b.*\bcontaining\b", r"\blook for\b"],
        ),
        (
            SemanticIntent::Retrieve,
            &[r"\b(show|list|get|find|display|fetch|retrieve)\b"],
        ),
    ];
    table
        .iter()
        .map(|(intent, patterns)| (*intent, compile_patterns(patterns)))
        .collect()
});

static TIME_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    let table: &[(&str, &str)] = &[
        (
            "relative",
            r"\b(?:last|past|previous)\s+(\d+)\s+(hour|day|week|month|year)s?\b",
        ),
        ("relative", r"\b(?:last|past|previous)\s+()(hour|day|week|month|year)\b"),
        ("current", r"\bthis\s+()(week|month|year)\b"),
        ("yesterday", r"\byesterday\b"),
        ("today", r"\btoday\b"),
        ("tomorrow", r"\btomorrow\b"),
        ("between", r"\bbetween\s+(\d{4}-\d{2}-\d{2})\s+and\s+(\d{4}-\d{2}-\d{2})"),
        ("since", r"\bsince\s+(\S+)"),
        ("before", r"\bbefore\s+(\S+)"),
        ("after", r"\bafter\s+(\S+)"),
    ];
    table
        .iter()
        .filter_map(|(kind, p)| compile(p).map(|re| (*kind, re)))
        .collect()
});

static NEGATION: LazyLock<Option<Regex>> = LazyLock::new(|| {
    compile(r"\b(not|no|never|without|exclude|excluding|except)\b")
});

static COMPARISONS: LazyLock<Vec<(ComparisonType, Regex)>> = LazyLock::new(|| {
    let table: &[(ComparisonType, &str)] = &[
        (ComparisonType::Between, r"\bbetween\b.+\band\b"),
        (
            ComparisonType::GreaterThan,
            r"\b(more|greater|higher|larger|bigger)\s+than\b|>|\babove\b|\bover\s+\d",
        ),
        (
            ComparisonType::LessThan,
            r"\b(less|fewer|lower|smaller)\s+than\b|<|\bbelow\b|\bunder\s+\d",
        ),
        (ComparisonType::Equal, r"\b(equals?|equal to|exactly)\b|="),
    ];
    table
        .iter()
        .filter_map(|(kind, p)| compile(p).map(|re| (*kind, re)))
        .collect()
});

const NUM: &str = r"(?P<n>\d+(?:\.\d+)?)";

static QUANTITIES: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    let table: Vec<(&str, String)> = vec![
        (
            "between",
            format!(r"\bbetween\s+{}\s+and\s+(?P<hi>\d+(?:\.\d+)?)", NUM),
        ),
        (">", format!(r"\b(?:more than|greater than|over|above)\s+{}", NUM)),
        ("<", format!(r"\b(?:less than|fewer than|under|below)\s+{}", NUM)),
        (">=", format!(r"\bat least\s+{}", NUM)),
        ("<=", format!(r"\bat most\s+{}", NUM)),
        ("=", format!(r"\bexactly\s+{}", NUM)),
        (">=", format!(r"{}\s+or more\b", NUM)),
        ("<=", format!(r"{}\s+or (?:less|fewer)\b", NUM)),
    ];
    table
        .into_iter()
        .filter_map(|(op, p)| compile(&p).map(|re| (op, re)))
        .collect()
});

static QUOTED: LazyLock<Option<Regex>> =
    LazyLock::new(|| compile(r#""([^"]+)"|'([^']+)'"#));
static NUMBER: LazyLock<Option<Regex>> = LazyLock::new(|| compile(r"\b\d+(?:\.\d+)?\b"));
static PROPER_NOUN: LazyLock<Option<Regex>> =
    LazyLock::new(|| compile(r"\b[A-Z][a-z]+(?:\s+[A-Z][a-z]+)*\b"));

const PROPER_NOUN_STOP_WORDS: &[&str] = &[
    "the", "and", "or", "for", "with", "show", "list", "get", "find", "count", "how", "what",
    "which", "who", "give", "display",
];

/// Canonical word followed by its synonyms
pub const SYNONYMS: &[(&str, &[&str])] = &[
    ("show", &["display", "list", "get", "find", "retrieve", "fetch"]),
    ("all", &["every", "each", "entire"]),
    ("users", &["customers", "clients", "members", "accounts", "people"]),
    ("orders", &["purchases", "transactions", "sales"]),
    ("products", &["items", "goods", "merchandise"]),
    ("amount", &["value", "sum", "total", "price", "cost"]),
    ("date", &["time", "when", "timestamp"]),
    ("name", &["title", "label"]),
    ("delete", &["remove", "drop", "erase"]),
    ("update", &["modify", "change", "edit", "set"]),
    ("create", &["add", "insert", "new", "make"]),
];

const QUERY_WORDS: &[&str] = &[
    "count", "average", "where", "group", "sort", "order", "limit", "top", "bottom", "compare",
    "trend", "between", "maximum", "minimum", "distinct", "unique", "total", "many", "last",
    "this", "since", "before", "after", "greater", "less", "than", "equal",
];

pub fn normalize(query: &str) -> String {
    let mut text = query.to_lowercase();
    for (short, long) in CONTRACTIONS {
        if text.contains(short) {
            text = text.replace(short, long);
        }
    }
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Jaccard overlap of lowercased whitespace tokens
pub fn token_jaccard(a: &str, b: &str) -> f64 {
    let left: HashSet<String> = a.split_whitespace().map(|w| w.to_lowercase()).collect();
    let right: HashSet<String> = b.split_whitespace().map(|w| w.to_lowercase()).collect();
    if left.is_empty() && right.is_empty() {
        return 1.0;
    }
    let intersection = left.intersection(&right).count() as f64;
    let union = left.union(&right).count() as f64;
    intersection / union
}

fn parse_number(raw: &str) -> Option<Value> {
    if let Ok(i) = raw.parse::<i64>() {
        return Some(Value::from(i));
    }
    raw.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
}

pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            current[j + 1] = (previous[j + 1] + 1)
                .min(current[j] + 1)
                .min(previous[j] + cost);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

/// Bounded edit-distance correction against a fixed vocabulary
#[derive(Debug, Clone)]
pub struct TypoCorrector {
    vocabulary: Vec<String>,
    lookup: HashSet<String>,
    max_distance: usize,
}

impl TypoCorrector {
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut vocabulary = Vec::new();
        let mut lookup = HashSet::new();
        for word in words {
            let word = word.into().to_lowercase();
            if !word.is_empty() && lookup.insert(word.clone()) {
                vocabulary.push(word);
            }
        }
        Self {
            vocabulary,
            lookup,
            max_distance: 2,
        }
    }

    /// Vocabulary made of schema names, the synonym table and common query words
    pub fn from_schema(schema: &SchemaSnapshot) -> Self {
        let mut words: Vec<String> = schema.collections.clone();
        words.extend(schema.all_fields());
        for (canonical, synonyms) in SYNONYMS {
            words.push(canonical.to_string());
            words.extend(synonyms.iter().map(|s| s.to_string()));
        }
        words.extend(QUERY_WORDS.iter().map(|w| w.to_string()));
        Self::new(words)
    }

    pub fn contains(&self, word: &str) -> bool {
        self.lookup.contains(&word.to_lowercase())
    }

    /// Returns the best correction and its confidence `1 - distance / max(len)`
    pub fn correct(&self, word: &str) -> (String, f64) {
        let lower = word.to_lowercase();
        if self.lookup.contains(&lower) {
            return (word.to_string(), 1.0);
        }

        let len = lower.chars().count();
        let mut best: Option<(&str, usize)> = None;
        for candidate in &self.vocabulary {
            let candidate_len = candidate.chars().count();
            if candidate_len.abs_diff(len) > self.max_distance {
                continue;
            }
            let distance = levenshtein(&lower, candidate);
            if distance <= self.max_distance
                && best.map(|(_, d)| distance < d).unwrap_or(true)
            {
                best = Some((candidate.as_str(), distance));
            }
        }

        match best {
            Some((candidate, distance)) => {
                let max_len = len.max(candidate.chars().count()).max(1) as f64;
                (candidate.to_string(), 1.0 - distance as f64 / max_len)
            }
            None => (word.to_string(), 0.0),
        }
    }

    /// Corrects every token of length >= 3 whose correction confidence exceeds 0.5.
    /// Returns the corrected text and the `(from, to)` pairs that changed.
    pub fn correct_query(&self, query: &str) -> (String, Vec<(String, String)>) {
        let mut corrections = Vec::new();
        let tokens: Vec<String> = query
            .split_whitespace()
            .map(|token| {
                let start = token
                    .find(|c: char| c.is_alphanumeric())
                    .unwrap_or(token.len());
                let end = token
                    .rfind(|c: char| c.is_alphanumeric())
                    .map(|i| i + token[i..].chars().next().map(|c| c.len_utf8()).unwrap_or(1))
                    .unwrap_or(start);
                if start >= end {
                    return token.to_string();
                }
                let (prefix, core, suffix) = (&token[..start], &token[start..end], &token[end..]);
                if core.chars().count() < 3 || core.chars().any(|c| c.is_ascii_digit()) {
                    return token.to_string();
                }

                let (candidate, confidence) = self.correct(core);
                if confidence > 0.5 && !candidate.eq_ignore_ascii_case(core) {
                    let replaced = preserve_case(core, &candidate);
                    corrections.push((core.to_string(), replaced.clone()));
                    format!("{}{}{}", prefix, replaced, suffix)
                } else {
                    token.to_string()
                }
            })
            .collect();
        (tokens.join(" "), corrections)
    }
}

fn preserve_case(original: &str, replacement: &str) -> String {
    if original.chars().all(|c| !c.is_alphabetic() || c.is_uppercase()) {
        replacement.to_uppercase()
    } else if original.chars().next().map(|c| c.is_uppercase()).unwrap_or(false) {
        let mut chars = replacement.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    } else {
        replacement.to_string()
    }
}

/// Canonical-form lookup plus reverse multi-map for query variants
#[derive(Debug, Clone)]
pub struct SynonymExpander {
    canonical: HashMap<String, String>,
    reverse: HashMap<String, Vec<String>>,
}

impl Default for SynonymExpander {
    fn default() -> Self {
        Self::new(SYNONYMS)
    }
}

impl SynonymExpander {
    pub fn new(table: &[(&str, &[&str])]) -> Self {
        let mut canonical = HashMap::new();
        let mut reverse: HashMap<String, Vec<String>> = HashMap::new();
        for (word, synonyms) in table {
            canonical
                .entry(word.to_string())
                .or_insert_with(|| word.to_string());
            for synonym in *synonyms {
                // a synonym listed under two canonicals keeps the first
                canonical
                    .entry(synonym.to_string())
                    .or_insert_with(|| word.to_string());
                reverse
                    .entry(word.to_string())
                    .or_default()
                    .push(synonym.to_string());
            }
        }
        Self { canonical, reverse }
    }

    pub fn canonicalize(&self, word: &str) -> String {
        let lower = word.to_lowercase();
        self.canonical.get(&lower).cloned().unwrap_or(lower)
    }

    /// Canonical form followed by every synonym of it
    pub fn expand(&self, word: &str) -> Vec<String> {
        let canonical = self.canonicalize(word);
        let mut out = vec![canonical.clone()];
        if let Some(synonyms) = self.reverse.get(&canonical) {
            out.extend(synonyms.iter().cloned());
        }
        out
    }

    /// The query itself followed by single-word substitutions, at most `max_variants` total
    pub fn expand_query(&self, query: &str, max_variants: usize) -> Vec<String> {
        let tokens: Vec<&str> = query.split_whitespace().collect();
        let mut seen = BTreeSet::new();
        let mut variants = vec![query.to_string()];
        seen.insert(query.to_string());

        'outer: for (i, token) in tokens.iter().enumerate() {
            for alternative in self.expand(token) {
                if variants.len() >= max_variants {
                    break 'outer;
                }
                if alternative.eq_ignore_ascii_case(token) {
                    continue;
                }
                let mut replaced: Vec<&str> = tokens.clone();
                replaced[i] = alternative.as_str();
                let variant = replaced.join(" ");
                if seen.insert(variant.clone()) {
                    variants.push(variant);
                }
            }
        }
        variants
    }
}

/// Cosine similarity over embeddings, or token overlap when no provider is set
#[derive(Clone, Default)]
pub struct SemanticSimilarity {
    provider: Option<Arc<dyn EmbeddingProvider>>,
}

impl SemanticSimilarity {
    pub fn new(provider: Option<Arc<dyn EmbeddingProvider>>) -> Self {
        Self { provider }
    }

    pub async fn similarity(&self, a: &str, b: &str) -> f64 {
        if let Some(provider) = &self.provider {
            match provider.embed(&[a.to_string(), b.to_string()]).await {
                Ok(vectors) if vectors.len() == 2 => {
                    return cosine_similarity(&vectors[0], &vectors[1]);
                }
                Ok(_) => tracing::warn!("Embedding provider returned wrong vector count"),
                Err(e) => tracing::warn!("Embedding failed, using token overlap: {}", e),
            }
        }
        token_jaccard(a, b)
    }

    /// Scores every candidate against `query`, highest first; ties keep input order
    pub async fn rank(&self, query: &str, candidates: &[String]) -> Vec<(String, f64)> {
        let mut scored = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            scored.push((candidate.clone(), self.similarity(query, candidate).await));
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored
    }
}

/// Pattern-scoring parser bound to one schema snapshot
#[derive(Debug, Clone)]
pub struct SemanticParser {
    collections: Vec<String>,
    fields: Vec<String>,
    corrector: TypoCorrector,
    synonyms: SynonymExpander,
}

impl SemanticParser {
    pub fn new(schema: &SchemaSnapshot) -> Self {
        Self {
            collections: schema.collections.clone(),
            fields: schema.all_fields(),
            corrector: TypoCorrector::from_schema(schema),
            synonyms: SynonymExpander::default(),
        }
    }

    pub fn corrector(&self) -> &TypoCorrector {
        &self.corrector
    }

    pub fn parse(&self, query: &str) -> SemanticParseResult {
        let normalized = normalize(query);
        let (intent, intent_confidence) = Self::detect_intent(&normalized);

        SemanticParseResult {
            original_query: query.to_string(),
            intent,
            intent_confidence,
            entities: self.extract_entities(query, &normalized),
            time_expression: Self::extract_time(&normalized),
            negation: NEGATION
                .as_ref()
                .map(|re| re.is_match(&normalized))
                .unwrap_or(false),
            comparison_type: COMPARISONS
                .iter()
                .find(|(_, re)| re.is_match(&normalized))
                .map(|(kind, _)| *kind),
            quantity_expression: Self::extract_quantity(&normalized),
            normalized_query: normalized,
        }
    }

    /// Highest pattern-hit count wins; `select` at 0.5 when nothing matches
    pub fn detect_intent(normalized: &str) -> (SemanticIntent, f64) {
        let mut best: Option<(SemanticIntent, usize)> = None;
        for (intent, patterns) in INTENT_PATTERNS.iter() {
            let score = patterns.iter().filter(|re| re.is_match(normalized)).count();
            if score > 0 && best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((*intent, score));
            }
        }
        match best {
            Some((intent, score)) => (intent, (score as f64 / 2.0).min(1.0)),
            None => (SemanticIntent::Select, 0.5),
        }
    }

    fn extract_entities(&self, original: &str, normalized: &str) -> Vec<ExtractedEntity> {
        let mut entities = Vec::new();

        if let Some(re) = QUOTED.as_ref() {
            for caps in re.captures_iter(original) {
                if let Some(m) = caps.get(1).or_else(|| caps.get(2)) {
                    entities.push(ExtractedEntity {
                        text: m.as_str().to_string(),
                        kind: EntityKind::Value,
                        start: m.start(),
                        end: m.end(),
                        confidence: 1.0,
                        resolved_value: Some(Value::String(m.as_str().to_string())),
                    });
                }
            }
        }

        for collection in &self.collections {
            let lower = collection.to_lowercase();
            let singular = lower.strip_suffix('s').unwrap_or(&lower).to_string();
            // "customers" finds a users collection through the synonym table
            let mut words = vec![lower.clone(), singular];
            words.extend(self.synonyms.expand(&lower).into_iter().skip(1));
            let found = words
                .iter()
                .filter(|w| !w.is_empty())
                .find_map(|w| word_regex(w).and_then(|re| re.find(normalized)));
            if let Some(m) = found {
                entities.push(ExtractedEntity {
                    text: collection.clone(),
                    kind: EntityKind::Collection,
                    start: m.start(),
                    end: m.end(),
                    confidence: 0.9,
                    resolved_value: None,
                });
            }
        }

        for field in &self.fields {
            if self.collections.contains(field) {
                continue;
            }
            if let Some(m) = word_regex(&field.to_lowercase()).and_then(|re| re.find(normalized)) {
                entities.push(ExtractedEntity {
                    text: field.clone(),
                    kind: EntityKind::Field,
                    start: m.start(),
                    end: m.end(),
                    confidence: 0.9,
                    resolved_value: None,
                });
            }
        }

        if let Some(re) = NUMBER.as_ref() {
            for m in re.find_iter(normalized) {
                entities.push(ExtractedEntity {
                    text: m.as_str().to_string(),
                    kind: EntityKind::Number,
                    start: m.start(),
                    end: m.end(),
                    confidence: 1.0,
                    resolved_value: parse_number(m.as_str()),
                });
            }
        }

        if let Some(re) = PROPER_NOUN.as_ref() {
            for m in re.find_iter(original) {
                let text = m.as_str();
                if PROPER_NOUN_STOP_WORDS.contains(&text.to_lowercase().as_str()) {
                    continue;
                }
                entities.push(ExtractedEntity {
                    text: text.to_string(),
                    kind: EntityKind::ProperNoun,
                    start: m.start(),
                    end: m.end(),
                    confidence: 0.7,
                    resolved_value: None,
                });
            }
        }

        entities
    }

    pub fn extract_time(normalized: &str) -> Option<TimeExpression> {
        TIME_PATTERNS.iter().find_map(|(kind, re)| {
            re.captures(normalized).map(|caps| {
                let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
                let (amount, unit) = match *kind {
                    "relative" | "current" => {
                        let amount = caps
                            .get(1)
                            .and_then(|m| m.as_str().parse::<i64>().ok())
                            .or(Some(1));
                        (amount, caps.get(2).map(|m| m.as_str().to_string()))
                    }
                    _ => (None, None),
                };
                TimeExpression {
                    text: whole.to_string(),
                    kind: kind.to_string(),
                    amount,
                    unit,
                }
            })
        })
    }

    pub fn extract_quantity(normalized: &str) -> Option<QuantityExpression> {
        QUANTITIES.iter().find_map(|(op, re)| {
            let caps = re.captures(normalized)?;
            let value = caps.name("n")?.as_str().parse::<f64>().ok()?;
            Some(QuantityExpression {
                text: caps.get(0)?.as_str().to_string(),
                operator: op.to_string(),
                value,
                upper: caps.name("hi").and_then(|m| m.as_str().parse::<f64>().ok()),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::embedding::HashingEmbedder;

    fn schema() -> SchemaSnapshot {
        SchemaSnapshot::new()
            .with_collection("users", &["id", "name", "age", "email"])
            .with_collection("orders", &["id", "user_id", "amount", "status"])
    }

    #[test]
    fn test_normalize_expands_contractions() {
        assert_eq!(
            normalize("  Users who   DON'T  have orders "),
            "users who do not have orders"
        );
    }

    #[test]
    fn test_count_intent() {
        let parser = SemanticParser::new(&schema());
        let result = parser.parse("count users where age > 21");
        assert_eq!(result.intent, SemanticIntent::Count);
        assert!((result.intent_confidence - 0.5).abs() < f64::EPSILON);
        assert_eq!(result.comparison_type, Some(ComparisonType::GreaterThan));
    }

    #[test]
    fn test_multiple_hits_raise_confidence() {
        let (intent, confidence) = SemanticParser::detect_intent("how many orders, count them");
        assert_eq!(intent, SemanticIntent::Count);
        assert!((confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_no_match_defaults_to_select() {
        let (intent, confidence) = SemanticParser::detect_intent("users older than bob");
        assert_eq!(intent, SemanticIntent::Select);
        assert!((confidence - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_entity_extraction() {
        let parser = SemanticParser::new(&schema());
        let result = parser.parse("show orders with status \"shipped\" over 100 for Jane Doe");

        let values: Vec<_> = result.entities_of(EntityKind::Value).collect();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].text, "shipped");
        assert_eq!(values[0].confidence, 1.0);

        assert!(result
            .entities_of(EntityKind::Collection)
            .any(|e| e.text == "orders" && e.confidence == 0.9));
        assert!(result.entities_of(EntityKind::Field).any(|e| e.text == "status"));

        let numbers: Vec<_> = result.entities_of(EntityKind::Number).collect();
        assert_eq!(numbers[0].resolved_value, Some(serde_json::json!(100)));

        assert!(result
            .entities_of(EntityKind::ProperNoun)
            .any(|e| e.text == "Jane Doe" && e.confidence == 0.7));
    }

    #[test]
    fn test_collection_found_through_synonym() {
        let parser = SemanticParser::new(&schema());
        let result = parser.parse("list customers with purchases");
        let collections: Vec<_> = result
            .entities_of(EntityKind::Collection)
            .map(|e| e.text.as_str())
            .collect();
        assert_eq!(collections, vec!["users", "orders"]);
    }

    #[test]
    fn test_field_matching_uses_word_boundaries() {
        let parser = SemanticParser::new(&schema());
        let result = parser.parse("average amount");
        assert!(!result.entities_of(EntityKind::Field).any(|e| e.text == "age"));
    }

    #[test]
    fn test_time_and_quantity_and_negation() {
        let parser = SemanticParser::new(&schema());
        let result = parser.parse("orders not shipped in the last 30 days with at least 5 items");
        let time = result.time_expression.unwrap();
        assert_eq!(time.kind, "relative");
        assert_eq!(time.amount, Some(30));
        assert_eq!(time.unit.as_deref(), Some("day"));
        assert!(result.negation);
        let quantity = result.quantity_expression.unwrap();
        assert_eq!(quantity.operator, ">=");
        assert_eq!(quantity.value, 5.0);
    }

    #[test]
    fn test_between_quantity() {
        let quantity = SemanticParser::extract_quantity("age between 18 and 30").unwrap();
        assert_eq!(quantity.operator, "between");
        assert_eq!(quantity.upper, Some(30.0));
    }

    #[test]
    fn test_typo_identity_for_known_words() {
        let corrector = TypoCorrector::from_schema(&schema());
        assert_eq!(corrector.correct("users"), ("users".to_string(), 1.0));
        assert_eq!(corrector.correct("amount"), ("amount".to_string(), 1.0));
    }

    #[test]
    fn test_typo_correction() {
        let corrector = TypoCorrector::from_schema(&schema());
        let (word, confidence) = corrector.correct("usres");
        assert_eq!(word, "users");
        assert!((confidence - 0.6).abs() < 1e-9);

        let (text, corrections) = corrector.correct_query("Show Ordrs, by amonut!");
        assert_eq!(text, "Show Orders, by amount!");
        assert_eq!(corrections.len(), 2);
    }

    #[test]
    fn test_short_tokens_are_not_corrected() {
        let corrector = TypoCorrector::from_schema(&schema());
        let (text, corrections) = corrector.correct_query("id of xq");
        assert_eq!(text, "id of xq");
        assert!(corrections.is_empty());
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
    }

    #[test]
    fn test_synonym_expansion() {
        let expander = SynonymExpander::default();
        assert_eq!(expander.canonicalize("Customers"), "users");
        assert_eq!(expander.canonicalize("zebra"), "zebra");
        assert!(expander.expand("clients").contains(&"members".to_string()));

        let variants = expander.expand_query("show customers", 4);
        assert_eq!(variants[0], "show customers");
        assert_eq!(variants.len(), 4);
        assert!(variants.contains(&"display customers".to_string()));
    }

    #[test]
    fn test_token_jaccard() {
        assert!((token_jaccard("find users", "find all users") - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(token_jaccard("a b", "c d"), 0.0);
    }

    #[tokio::test]
    async fn test_similarity_falls_back_to_token_overlap() {
        let plain = SemanticSimilarity::default();
        let score = plain.similarity("show users", "show all users").await;
        assert!((score - 2.0 / 3.0).abs() < 1e-9);

        let embedded = SemanticSimilarity::new(Some(Arc::new(HashingEmbedder::default())));
        let score = embedded.similarity("show users", "show users").await;
        assert!((score - 1.0).abs() < 1e-6);
    }
}
