use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};

/// A single record as returned by a backend scan
pub type Record = serde_json::Map<String, Value>;

/// Index as reported by the schema provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    pub fields: Vec<String>,
}

/// Schema snapshot shared by every pipeline stage for the lifetime of one query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub collections: Vec<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub indexes: BTreeMap<String, IndexDefinition>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    #[serde(default)]
    pub related_tables: Vec<String>,
    #[serde(default)]
    pub row_counts: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inferred: BTreeMap<String, InferredSchema>,
}

impl SchemaSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(mut self, name: impl Into<String>, fields: &[&str]) -> Self {
        let name = name.into();
        if !self.collections.contains(&name) {
            self.collections.push(name.clone());
        }
        self.fields
            .insert(name, fields.iter().map(|f| f.to_string()).collect());
        self
    }

    pub fn with_index(
        mut self,
        name: impl Into<String>,
        collection: impl Into<String>,
        fields: &[&str],
    ) -> Self {
        self.indexes.insert(
            name.into(),
            IndexDefinition {
                collection: Some(collection.into()),
                fields: fields.iter().map(|f| f.to_string()).collect(),
            },
        );
        self
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    pub fn has_collection(&self, name: &str) -> bool {
        self.collections.iter().any(|c| c == name)
    }

    pub fn fields_of(&self, collection: &str) -> &[String] {
        self.fields
            .get(collection)
            .map(|f| f.as_slice())
            .unwrap_or(&[])
    }

    /// All field names across collections, first occurrence wins
    pub fn all_fields(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for collection in &self.collections {
            for field in self.fields_of(collection) {
                if seen.insert(field.clone()) {
                    out.push(field.clone());
                }
            }
        }
        out
    }

    /// Returns the name of an index whose leading field is `field`
    pub fn index_for(&self, collection: Option<&str>, field: &str) -> Option<&str> {
        self.indexes
            .iter()
            .find(|(_, idx)| {
                let collection_ok = match (collection, idx.collection.as_deref()) {
                    (Some(wanted), Some(actual)) => wanted == actual,
                    _ => true,
                };
                collection_ok && idx.fields.first().map(|f| f == field).unwrap_or(false)
            })
            .map(|(name, _)| name.as_str())
    }

    /// True when the field appears anywhere in an index definition
    pub fn is_indexed(&self, field: &str) -> bool {
        self.indexes
            .values()
            .any(|idx| idx.fields.iter().any(|f| f == field))
    }

    /// Stable hash over the structural parts of the snapshot
    pub fn schema_hash(&self) -> String {
        let structural = serde_json::json!({
            "collections": self.collections,
            "fields": self.fields,
            "indexes": self.indexes,
        });
        let mut hasher = Sha256::new();
        hasher.update(structural.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    String,
    Integer,
    Float,
    Boolean,
    Date,
    Datetime,
    Uuid,
    Email,
    Url,
    Phone,
    Json,
    Array,
    Null,
    Unknown,
}

impl DataType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, DataType::Integer | DataType::Float)
    }

    /// Rough width in bytes, used by the cost model
    pub fn estimated_width(&self) -> u32 {
        match self {
            DataType::Boolean => 1,
            DataType::Integer | DataType::Float => 8,
            DataType::Date => 4,
            DataType::Datetime => 8,
            DataType::Uuid => 16,
            DataType::Json | DataType::Array => 128,
            _ => 32,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SemanticType {
    Identifier,
    ForeignKey,
    Name,
    Email,
    CreatedAt,
    UpdatedAt,
    Timestamp,
    Flag,
    Status,
    Category,
    Amount,
    Count,
    Percentage,
    Score,
    Description,
    Address,
    Coordinate,
    Generic,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FieldStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub std_dev: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_length: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldInfo {
    pub name: String,
    pub data_type: DataType,
    pub semantic_type: SemanticType,
    pub nullable: bool,
    pub unique: bool,
    pub null_count: usize,
    pub distinct_count: usize,
    #[serde(default)]
    pub sample_values: Vec<Value>,
    #[serde(default)]
    pub stats: FieldStats,
}

impl FieldInfo {
    pub fn new(name: impl Into<String>, data_type: DataType, semantic_type: SemanticType) -> Self {
        Self {
            name: name.into(),
            data_type,
            semantic_type,
            nullable: true,
            unique: false,
            null_count: 0,
            distinct_count: 0,
            sample_values: Vec::new(),
            stats: FieldStats::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipType {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Relationship {
    pub source_collection: String,
    pub source_field: String,
    pub target_collection: String,
    pub target_field: String,
    pub relationship_type: RelationshipType,
    pub confidence: f64,
}

/// Schema of one collection as inferred from sample records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferredSchema {
    pub collection: String,
    pub fields: BTreeMap<String, FieldInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<String>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    pub row_count: u64,
    pub sample_size: usize,
    pub inferred_at: DateTime<Utc>,
}

impl InferredSchema {
    pub fn field_names(&self) -> Vec<String> {
        self.fields.keys().cloned().collect()
    }

    /// Average record width in bytes
    pub fn estimated_width(&self) -> u32 {
        let width: u32 = self
            .fields
            .values()
            .map(|f| f.data_type.estimated_width())
            .sum();
        width.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_hash_is_stable() {
        let a = SchemaSnapshot::new().with_collection("users", &["id", "age"]);
        let b = SchemaSnapshot::new().with_collection("users", &["id", "age"]);
        let c = SchemaSnapshot::new().with_collection("users", &["id"]);
        assert_eq!(a.schema_hash(), b.schema_hash());
        assert_ne!(a.schema_hash(), c.schema_hash());
    }

    #[test]
    fn test_index_lookup() {
        let schema = SchemaSnapshot::new()
            .with_collection("users", &["id", "email"])
            .with_index("idx_users_email", "users", &["email"]);
        assert_eq!(schema.index_for(Some("users"), "email"), Some("idx_users_email"));
        assert_eq!(schema.index_for(Some("orders"), "email"), None);
        assert!(schema.is_indexed("email"));
        assert!(!schema.is_indexed("id"));
    }

    #[test]
    fn test_all_fields_dedup() {
        let schema = SchemaSnapshot::new()
            .with_collection("users", &["id", "name"])
            .with_collection("orders", &["id", "user_id"]);
        assert_eq!(schema.all_fields(), vec!["id", "name", "user_id"]);
    }
}
