// Schema Inference Service
//
// Infers field data types, semantic types, statistics, primary keys and
// cross-collection relationships from sample records.

use chrono::Utc;
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::LazyLock;

use crate::models::{
    DataType, FieldInfo, FieldStats, InferredSchema, Record, Relationship, RelationshipType,
    SchemaSnapshot, SemanticType,
};
use crate::services::query_cache::ResultCache;
use crate::services::semantic::{compile, compile_patterns};

static NAME_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile_patterns(&[
        r"^name$",
        r"_name$",
        r"^title$",
        r"^first_?name$",
        r"^last_?name$",
        r"^full_?name$",
    ])
});

static TIMESTAMP_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile_patterns(&[
        r"^created",
        r"^updated",
        r"^modified",
        r"^deleted",
        r"_at$",
        r"_time$",
        r"_date$",
        r"^timestamp",
    ])
});

static EMAIL: LazyLock<Option<Regex>> =
    LazyLock::new(|| compile(r"^[a-zA-Z0-9_.+-]+@[a-zA-Z0-9-]+\.[a-zA-Z0-9-.]+$"));
static UUID: LazyLock<Option<Regex>> = LazyLock::new(|| {
    compile(r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$")
});
static URL: LazyLock<Option<Regex>> = LazyLock::new(|| compile(r"^https?://"));
static PHONE: LazyLock<Option<Regex>> = LazyLock::new(|| compile(r"^\+?[0-9]{10,15}$"));
static DATETIME: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile_patterns(&[r"^\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}", r"^\d{2}/\d{2}/\d{4} \d{2}:\d{2}"])
});
static DATE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile_patterns(&[r"^\d{4}-\d{2}-\d{2}$", r"^\d{2}/\d{2}/\d{4}$", r"^\d{2}-\d{2}-\d{4}$"])
});

fn pattern_match(re: &Option<Regex>, value: &str) -> bool {
    re.as_ref().map(|r| r.is_match(value)).unwrap_or(false)
}

/// String form used for uniqueness and overlap checks
fn value_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn classify_value(value: &Value) -> DataType {
    match value {
        Value::Null => DataType::Null,
        Value::Bool(_) => DataType::Boolean,
        Value::Number(n) if n.is_i64() || n.is_u64() => DataType::Integer,
        Value::Number(_) => DataType::Float,
        Value::String(s) => classify_string(s),
        Value::Array(_) => DataType::Array,
        Value::Object(_) => DataType::Json,
    }
}

fn classify_string(value: &str) -> DataType {
    let lower = value.to_lowercase();
    if matches!(lower.as_str(), "true" | "false" | "yes" | "no" | "1" | "0") {
        return DataType::Boolean;
    }
    if pattern_match(&UUID, &lower) {
        return DataType::Uuid;
    }
    if pattern_match(&EMAIL, value) {
        return DataType::Email;
    }
    if pattern_match(&URL, value) {
        return DataType::Url;
    }
    let digits: String = value
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '+')
        .collect();
    if value.chars().any(|c| c.is_ascii_digit())
        && value
            .chars()
            .all(|c| c.is_ascii_digit() || " +-().".contains(c))
        && pattern_match(&PHONE, &digits)
    {
        return DataType::Phone;
    }
    if DATETIME.iter().any(|re| re.is_match(value)) {
        return DataType::Datetime;
    }
    if DATE.iter().any(|re| re.is_match(value)) {
        return DataType::Date;
    }
    if value.parse::<i64>().is_ok() {
        return DataType::Integer;
    }
    if value.parse::<f64>().is_ok() {
        return DataType::Float;
    }
    DataType::String
}

/// Semantic meaning of a field, from its name first and its data type second
pub fn detect_semantic_type(name: &str, data_type: DataType) -> SemanticType {
    let lower = name.to_lowercase();

    if matches!(lower.as_str(), "id" | "uuid" | "guid" | "pk" | "key") {
        return SemanticType::Identifier;
    }
    if lower.ends_with("_id")
        || lower.ends_with("_key")
        || (name.len() > 2 && name.ends_with("Id"))
    {
        return SemanticType::ForeignKey;
    }
    if NAME_PATTERNS.iter().any(|re| re.is_match(&lower)) {
        return SemanticType::Name;
    }
    if TIMESTAMP_PATTERNS.iter().any(|re| re.is_match(&lower)) {
        if lower.contains("created") {
            return SemanticType::CreatedAt;
        }
        if lower.contains("updated") || lower.contains("modified") {
            return SemanticType::UpdatedAt;
        }
        return SemanticType::Timestamp;
    }

    match data_type {
        DataType::Email => return SemanticType::Email,
        DataType::Boolean => return SemanticType::Flag,
        _ => {}
    }

    let hints: &[(&[&str], SemanticType)] = &[
        (&["status", "state"], SemanticType::Status),
        (&["type", "category", "kind"], SemanticType::Category),
        (&["amount", "price", "cost", "total", "fee"], SemanticType::Amount),
        (&["count", "num", "quantity", "qty"], SemanticType::Count),
        (&["percent", "ratio", "rate"], SemanticType::Percentage),
        (&["score", "rating", "rank"], SemanticType::Score),
        (&["description", "desc", "comment", "note"], SemanticType::Description),
        (&["address", "street", "city", "zip"], SemanticType::Address),
        (&["lat", "lng", "longitude", "latitude"], SemanticType::Coordinate),
    ];
    hints
        .iter()
        .find(|(needles, _)| needles.iter().any(|n| lower.contains(n)))
        .map(|(_, semantic)| *semantic)
        .unwrap_or(SemanticType::Generic)
}

/// True for names the planner may treat as a time axis
pub fn is_time_field(name: &str) -> bool {
    matches!(
        detect_semantic_type(name, DataType::Unknown),
        SemanticType::CreatedAt | SemanticType::UpdatedAt | SemanticType::Timestamp
    )
}

fn field_stats(values: &[&Value], data_type: DataType) -> FieldStats {
    let mut stats = FieldStats::default();
    if values.is_empty() {
        return stats;
    }

    if data_type.is_numeric() {
        let numeric: Vec<f64> = values
            .iter()
            .filter_map(|v| match v {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.parse::<f64>().ok(),
                _ => None,
            })
            .collect();
        if !numeric.is_empty() {
            let n = numeric.len() as f64;
            let mean = numeric.iter().sum::<f64>() / n;
            stats.min = numeric.iter().copied().reduce(f64::min);
            stats.max = numeric.iter().copied().reduce(f64::max);
            stats.mean = Some(mean);
            if numeric.len() > 1 {
                let variance =
                    numeric.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
                stats.std_dev = Some(variance.sqrt());
            }
        }
    } else if data_type == DataType::String {
        let lengths: Vec<usize> = values
            .iter()
            .map(|v| value_key(v).chars().count())
            .collect();
        stats.min_length = lengths.iter().copied().min();
        stats.max_length = lengths.iter().copied().max();
        stats.avg_length = Some(lengths.iter().sum::<usize>() as f64 / lengths.len() as f64);
    }
    stats
}

/// Detects relationships by naming convention and by value overlap
#[derive(Debug, Clone)]
pub struct RelationshipDetector {
    min_confidence: f64,
}

impl Default for RelationshipDetector {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl RelationshipDetector {
    pub fn new(min_confidence: f64) -> Self {
        Self { min_confidence }
    }

    pub fn detect(
        &self,
        schemas: &BTreeMap<String, InferredSchema>,
        samples: Option<&HashMap<String, Vec<Record>>>,
    ) -> Vec<Relationship> {
        let mut relationships = self.detect_by_naming(schemas);

        if let Some(samples) = samples {
            let existing: HashSet<(String, String, String)> = relationships
                .iter()
                .map(|r| {
                    (
                        r.source_collection.clone(),
                        r.source_field.clone(),
                        r.target_collection.clone(),
                    )
                })
                .collect();
            for rel in self.detect_by_value_overlap(schemas, samples) {
                let key = (
                    rel.source_collection.clone(),
                    rel.source_field.clone(),
                    rel.target_collection.clone(),
                );
                if !existing.contains(&key) {
                    relationships.push(rel);
                }
            }
        }
        relationships
    }

    /// `user_id` in one collection pointing at `users`/`user` in another
    pub fn detect_by_naming(&self, schemas: &BTreeMap<String, InferredSchema>) -> Vec<Relationship> {
        let mut relationships = Vec::new();

        for (collection, schema) in schemas {
            for (field_name, info) in &schema.fields {
                if info.semantic_type != SemanticType::ForeignKey {
                    continue;
                }
                let reference = field_name
                    .strip_suffix("_id")
                    .or_else(|| field_name.strip_suffix("Id"))
                    .or_else(|| field_name.strip_suffix("_key"))
                    .unwrap_or(field_name)
                    .to_lowercase();

                let target = schemas.iter().find(|(target, _)| {
                    let target = target.to_lowercase();
                    target != collection.to_lowercase()
                        && (target == reference
                            || target == format!("{}s", reference)
                            || format!("{}s", target) == reference)
                });

                if let Some((target_collection, target_schema)) = target {
                    relationships.push(Relationship {
                        source_collection: collection.clone(),
                        source_field: field_name.clone(),
                        target_collection: target_collection.clone(),
                        target_field: target_schema
                            .primary_key
                            .clone()
                            .unwrap_or_else(|| "id".to_string()),
                        relationship_type: RelationshipType::ManyToOne,
                        confidence: 0.8,
                    });
                }
            }
        }
        relationships
    }

    pub fn detect_by_value_overlap(
        &self,
        schemas: &BTreeMap<String, InferredSchema>,
        samples: &HashMap<String, Vec<Record>>,
    ) -> Vec<Relationship> {
        let mut value_sets: BTreeMap<&str, BTreeMap<&str, HashSet<String>>> = BTreeMap::new();

        for (collection, schema) in schemas {
            let Some(records) = samples.get(collection) else {
                continue;
            };
            let fields = value_sets.entry(collection.as_str()).or_default();
            for (field_name, info) in &schema.fields {
                if !matches!(
                    info.semantic_type,
                    SemanticType::Identifier | SemanticType::ForeignKey
                ) {
                    continue;
                }
                let values: HashSet<String> = records
                    .iter()
                    .filter_map(|r| r.get(field_name))
                    .filter(|v| !v.is_null())
                    .map(value_key)
                    .collect();
                if !values.is_empty() {
                    fields.insert(field_name.as_str(), values);
                }
            }
        }

        let mut relationships = Vec::new();
        for (source_collection, source_fields) in &value_sets {
            for (source_field, source_values) in source_fields {
                for (target_collection, target_fields) in &value_sets {
                    if source_collection == target_collection {
                        continue;
                    }
                    for (target_field, target_values) in target_fields {
                        let overlap = source_values.intersection(target_values).count();
                        if overlap == 0 {
                            continue;
                        }
                        let source_ratio = overlap as f64 / source_values.len() as f64;
                        let target_ratio = overlap as f64 / target_values.len() as f64;
                        if source_ratio < self.min_confidence && target_ratio < self.min_confidence {
                            continue;
                        }

                        let relationship_type = if source_ratio > 0.9 && target_ratio > 0.9 {
                            RelationshipType::OneToOne
                        } else if source_ratio > 0.5 {
                            RelationshipType::ManyToOne
                        } else {
                            RelationshipType::OneToMany
                        };

                        relationships.push(Relationship {
                            source_collection: source_collection.to_string(),
                            source_field: source_field.to_string(),
                            target_collection: target_collection.to_string(),
                            target_field: target_field.to_string(),
                            relationship_type,
                            confidence: source_ratio.max(target_ratio),
                        });
                    }
                }
            }
        }
        relationships
    }

    /// Share of distinct source values present in the target, and whether it clears the threshold
    pub fn validate_relationship(
        &self,
        relationship: &Relationship,
        source: &[Record],
        target: &[Record],
    ) -> (bool, f64) {
        let collect = |records: &[Record], field: &str| -> HashSet<String> {
            records
                .iter()
                .filter_map(|r| r.get(field))
                .filter(|v| !v.is_null())
                .map(value_key)
                .collect()
        };
        let source_values = collect(source, &relationship.source_field);
        let target_values = collect(target, &relationship.target_field);
        if source_values.is_empty() || target_values.is_empty() {
            return (false, 0.0);
        }
        let coverage = source_values.intersection(&target_values).count() as f64
            / source_values.len() as f64;
        (coverage >= self.min_confidence, coverage)
    }
}

/// Infers schemas from samples and keeps them in a TTL cache
pub struct SchemaInference {
    sample_size: usize,
    cache: ResultCache<InferredSchema>,
    detector: RelationshipDetector,
}

impl Default for SchemaInference {
    fn default() -> Self {
        Self::new(1000, 3600)
    }
}

impl SchemaInference {
    pub fn new(sample_size: usize, cache_ttl_secs: u64) -> Self {
        Self {
            sample_size: sample_size.max(1),
            cache: ResultCache::new(1024, cache_ttl_secs),
            detector: RelationshipDetector::default(),
        }
    }

    pub fn sample_size(&self) -> usize {
        self.sample_size
    }

    pub fn detector(&self) -> &RelationshipDetector {
        &self.detector
    }

    pub fn cached(&self, collection: &str) -> Option<InferredSchema> {
        self.cache.get(collection)
    }

    pub fn invalidate(&self, collection: &str) {
        self.cache.remove(collection);
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Infers a schema from `data`, served from cache while fresh
    pub fn infer_collection(&self, collection: &str, data: &[Record]) -> InferredSchema {
        if let Some(schema) = self.cache.get(collection) {
            return schema;
        }
        let schema = self.infer_uncached(collection, data);
        self.cache.put(collection.to_string(), schema.clone(), None);
        schema
    }

    fn infer_uncached(&self, collection: &str, data: &[Record]) -> InferredSchema {
        let sample = &data[..data.len().min(self.sample_size)];

        let mut order: Vec<&str> = Vec::new();
        let mut values: HashMap<&str, Vec<&Value>> = HashMap::new();
        for record in sample {
            for (key, value) in record {
                let entry = values.entry(key.as_str()).or_insert_with(|| {
                    order.push(key.as_str());
                    Vec::new()
                });
                entry.push(value);
            }
        }

        let fields: BTreeMap<String, FieldInfo> = order
            .iter()
            .map(|name| {
                let info = Self::infer_field(name, &values[name], sample.len());
                (name.to_string(), info)
            })
            .collect();

        tracing::debug!(
            "Inferred {} fields for collection {} from {} records",
            fields.len(),
            collection,
            sample.len()
        );

        InferredSchema {
            collection: collection.to_string(),
            primary_key: Self::detect_primary_key(&fields),
            fields,
            relationships: Vec::new(),
            row_count: data.len() as u64,
            sample_size: sample.len(),
            inferred_at: Utc::now(),
        }
    }

    fn infer_field(name: &str, values: &[&Value], sample_len: usize) -> FieldInfo {
        let non_null: Vec<&Value> = values.iter().copied().filter(|v| !v.is_null()).collect();

        let data_type = if non_null.is_empty() {
            DataType::Null
        } else {
            // majority vote, first type seen wins ties
            let mut counts: Vec<(DataType, usize)> = Vec::new();
            for value in &non_null {
                let detected = classify_value(value);
                match counts.iter_mut().find(|(t, _)| *t == detected) {
                    Some((_, count)) => *count += 1,
                    None => counts.push((detected, 1)),
                }
            }
            counts
                .iter()
                .fold(None::<(DataType, usize)>, |best, &(t, c)| match best {
                    Some((_, bc)) if bc >= c => best,
                    _ => Some((t, c)),
                })
                .map(|(t, _)| t)
                .unwrap_or(DataType::Unknown)
        };

        let mut distinct = BTreeSet::new();
        let mut sample_values = Vec::new();
        for value in &non_null {
            if distinct.insert(value_key(value)) && sample_values.len() < 5 {
                sample_values.push((*value).clone());
            }
        }

        // missing keys count as nulls
        let null_count = sample_len.saturating_sub(non_null.len());

        FieldInfo {
            name: name.to_string(),
            data_type,
            semantic_type: detect_semantic_type(name, data_type),
            nullable: null_count > 0,
            unique: !non_null.is_empty() && distinct.len() == non_null.len(),
            null_count,
            distinct_count: distinct.len(),
            sample_values,
            stats: field_stats(&non_null, data_type),
        }
    }

    /// Highest scoring unique field; ties keep the earlier name
    fn detect_primary_key(fields: &BTreeMap<String, FieldInfo>) -> Option<String> {
        let mut best: Option<(&str, u32)> = None;
        for (name, info) in fields {
            if !info.unique {
                continue;
            }
            let mut score = 0;
            if !info.nullable {
                score += 2;
            }
            if info.semantic_type == SemanticType::Identifier {
                score += 5;
            }
            if matches!(info.data_type, DataType::Uuid | DataType::Integer) {
                score += 2;
            }
            if name.to_lowercase().contains("id") {
                score += 3;
            }
            if score > 0 && best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((name.as_str(), score));
            }
        }
        best.map(|(name, _)| name.to_string())
    }

    /// Schema built from field names alone, for collections without sample data
    pub fn from_field_names(collection: &str, fields: &[String]) -> InferredSchema {
        let fields = fields
            .iter()
            .map(|name| {
                let info = FieldInfo::new(
                    name.clone(),
                    DataType::Unknown,
                    detect_semantic_type(name, DataType::Unknown),
                );
                (name.clone(), info)
            })
            .collect();
        InferredSchema {
            collection: collection.to_string(),
            fields,
            primary_key: None,
            relationships: Vec::new(),
            row_count: 0,
            sample_size: 0,
            inferred_at: Utc::now(),
        }
    }

    pub fn infer_relationships(
        &self,
        schemas: &BTreeMap<String, InferredSchema>,
        samples: Option<&HashMap<String, Vec<Record>>>,
    ) -> Vec<Relationship> {
        self.detector.detect(schemas, samples)
    }

    /// Fills the inferred schemas, relationships, related tables and row counts of `snapshot`
    pub fn enrich(&self, snapshot: &mut SchemaSnapshot, samples: &HashMap<String, Vec<Record>>) {
        let mut schemas = BTreeMap::new();
        for collection in &snapshot.collections {
            let schema = match samples.get(collection) {
                Some(records) if !records.is_empty() => self.infer_collection(collection, records),
                _ => self
                    .cached(collection)
                    .unwrap_or_else(|| Self::from_field_names(collection, snapshot.fields_of(collection))),
            };
            schemas.insert(collection.clone(), schema);
        }

        let relationships = self.infer_relationships(&schemas, Some(samples));
        for schema in schemas.values_mut() {
            schema.relationships = relationships
                .iter()
                .filter(|r| r.source_collection == schema.collection)
                .cloned()
                .collect();
        }

        let mut related: Vec<String> = Vec::new();
        for rel in &relationships {
            for name in [&rel.source_collection, &rel.target_collection] {
                if !related.contains(name) {
                    related.push(name.clone());
                }
            }
        }

        for (name, schema) in &schemas {
            if schema.row_count > 0 {
                snapshot
                    .row_counts
                    .entry(name.clone())
                    .or_insert(schema.row_count);
            }
            let known = snapshot.fields.entry(name.clone()).or_default();
            if known.is_empty() {
                *known = schema.field_names();
            }
        }
        snapshot.relationships = relationships;
        snapshot.related_tables = related;
        snapshot.inferred = schemas;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn records(values: Vec<Value>) -> Vec<Record> {
        values
            .into_iter()
            .filter_map(|v| v.as_object().cloned())
            .collect()
    }

    #[test]
    fn test_string_classification() {
        assert_eq!(classify_value(&json!("a@b.com")), DataType::Email);
        assert_eq!(
            classify_value(&json!("123e4567-e89b-12d3-a456-426614174000")),
            DataType::Uuid
        );
        assert_eq!(classify_value(&json!("https://x.io")), DataType::Url);
        assert_eq!(classify_value(&json!("2024-01-05T10:00:00Z")), DataType::Datetime);
        assert_eq!(classify_value(&json!("2024-01-05")), DataType::Date);
        assert_eq!(classify_value(&json!("+14155550123")), DataType::Phone);
        assert_eq!(classify_value(&json!("yes")), DataType::Boolean);
        assert_eq!(classify_value(&json!("42")), DataType::Integer);
        assert_eq!(classify_value(&json!("4.2")), DataType::Float);
        assert_eq!(classify_value(&json!("hello")), DataType::String);
    }

    #[test]
    fn test_semantic_types_by_name() {
        assert_eq!(detect_semantic_type("id", DataType::Integer), SemanticType::Identifier);
        assert_eq!(detect_semantic_type("user_id", DataType::Integer), SemanticType::ForeignKey);
        assert_eq!(detect_semantic_type("created_at", DataType::Datetime), SemanticType::CreatedAt);
        assert_eq!(detect_semantic_type("first_name", DataType::String), SemanticType::Name);
        assert_eq!(detect_semantic_type("total_price", DataType::Float), SemanticType::Amount);
        assert_eq!(detect_semantic_type("contact", DataType::Email), SemanticType::Email);
        assert_eq!(detect_semantic_type("misc", DataType::String), SemanticType::Generic);
        assert!(is_time_field("shipped_at"));
        assert!(!is_time_field("status"));
    }

    #[test]
    fn test_infer_collection() {
        let inference = SchemaInference::default();
        let data = records(vec![
            json!({"id": 1, "name": "Ann", "age": 30, "email": "ann@x.io"}),
            json!({"id": 2, "name": "Bob", "age": null, "email": "bob@x.io"}),
            json!({"id": 3, "name": "Cid", "age": 40, "email": "cid@x.io"}),
        ]);
        let schema = inference.infer_collection("users", &data);

        assert_eq!(schema.primary_key.as_deref(), Some("id"));
        assert_eq!(schema.row_count, 3);

        let age = &schema.fields["age"];
        assert_eq!(age.data_type, DataType::Integer);
        assert!(age.nullable);
        assert_eq!(age.stats.min, Some(30.0));
        assert_eq!(age.stats.max, Some(40.0));
        assert_eq!(age.stats.mean, Some(35.0));

        assert_eq!(schema.fields["email"].semantic_type, SemanticType::Email);
        assert_eq!(schema.fields["name"].stats.max_length, Some(3));

        assert!(inference.cached("users").is_some());
        inference.invalidate("users");
        assert!(inference.cached("users").is_none());
    }

    #[test]
    fn test_naming_relationship_without_data() {
        let mut schemas = BTreeMap::new();
        schemas.insert(
            "users".to_string(),
            SchemaInference::from_field_names("users", &["id".to_string()]),
        );
        schemas.insert(
            "orders".to_string(),
            SchemaInference::from_field_names("orders", &["user_id".to_string()]),
        );

        let relationships = RelationshipDetector::default().detect(&schemas, None);
        assert_eq!(relationships.len(), 1);
        let rel = &relationships[0];
        assert_eq!(rel.source_collection, "orders");
        assert_eq!(rel.source_field, "user_id");
        assert_eq!(rel.target_collection, "users");
        assert_eq!(rel.target_field, "id");
        assert_eq!(rel.relationship_type, RelationshipType::ManyToOne);
        assert!((rel.confidence - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn test_value_overlap_relationship() {
        let inference = SchemaInference::default();
        let mut samples = HashMap::new();
        samples.insert(
            "accounts".to_string(),
            records(vec![json!({"id": 1}), json!({"id": 2}), json!({"id": 3})]),
        );
        samples.insert(
            "events".to_string(),
            records(vec![
                json!({"id": 10, "owner_key": 1}),
                json!({"id": 11, "owner_key": 2}),
                json!({"id": 12, "owner_key": 2}),
            ]),
        );
        let mut schemas = BTreeMap::new();
        for (name, data) in &samples {
            schemas.insert(name.clone(), inference.infer_collection(name, data));
        }

        let relationships = inference.infer_relationships(&schemas, Some(&samples));
        let rel = relationships
            .iter()
            .find(|r| r.source_collection == "events" && r.source_field == "owner_key")
            .unwrap();
        assert_eq!(rel.target_collection, "accounts");
        assert_eq!(rel.relationship_type, RelationshipType::ManyToOne);
        assert!((rel.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_validate_relationship() {
        let detector = RelationshipDetector::default();
        let rel = Relationship {
            source_collection: "orders".into(),
            source_field: "user_id".into(),
            target_collection: "users".into(),
            target_field: "id".into(),
            relationship_type: RelationshipType::ManyToOne,
            confidence: 0.8,
        };
        let orders = records(vec![json!({"user_id": 1}), json!({"user_id": 9})]);
        let users = records(vec![json!({"id": 1}), json!({"id": 2})]);
        let (valid, coverage) = detector.validate_relationship(&rel, &orders, &users);
        assert!(valid);
        assert!((coverage - 0.5).abs() < f64::EPSILON);

        let (valid, coverage) = detector.validate_relationship(&rel, &[], &users);
        assert!(!valid);
        assert_eq!(coverage, 0.0);
    }

    #[test]
    fn test_enrich_snapshot() {
        let inference = SchemaInference::default();
        let mut snapshot = SchemaSnapshot::new()
            .with_collection("users", &["id", "name"])
            .with_collection("orders", &["id", "user_id"]);
        inference.enrich(&mut snapshot, &HashMap::new());

        assert_eq!(snapshot.relationships.len(), 1);
        assert_eq!(snapshot.related_tables, vec!["orders", "users"]);
        assert_eq!(snapshot.inferred["orders"].relationships.len(), 1);
    }

    #[test]
    fn test_enrich_reuses_cached_schema() {
        let inference = SchemaInference::new(2, 3600);
        let users = records(vec![
            json!({"id": 1, "email": "a@example.com"}),
            json!({"id": 2, "email": "b@example.com"}),
        ]);
        let mut samples = HashMap::new();
        samples.insert("users".to_string(), users);

        let mut first = SchemaSnapshot::new().with_collection("users", &["id", "email"]);
        first.row_counts.insert("users".into(), 500);
        inference.enrich(&mut first, &samples);
        assert_eq!(first.row_counts["users"], 500);

        let mut second = SchemaSnapshot::new().with_collection("users", &["id", "email"]);
        inference.enrich(&mut second, &HashMap::new());
        assert_eq!(
            second.inferred["users"].field_names(),
            first.inferred["users"].field_names()
        );
        assert_eq!(second.inferred["users"].row_count, 2);
        assert_eq!(second.row_counts["users"], 2);
    }
}
