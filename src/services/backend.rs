// Data Backend
//
// Storage primitives consumed by the executor and the schema provider used to
// build snapshots. `InMemoryBackend` implements both over JSON records.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::sync::RwLock;

use crate::error::AppError;
use crate::models::{Condition, IndexDefinition, Record, SchemaSnapshot};
use crate::services::executor::evaluate_condition;

const INDEXES_KEY: &str = "_indexes";

/// Record source for scan and index-scan steps
#[async_trait]
pub trait DataBackend: Send + Sync {
    /// Every record of `collection`; unknown collections yield no records
    async fn scan(&self, collection: &str) -> Result<Vec<Record>, AppError>;

    /// At most `limit` records of `collection`, used for schema sampling
    async fn sample(&self, collection: &str, limit: usize) -> Result<Vec<Record>, AppError> {
        let mut records = self.scan(collection).await?;
        records.truncate(limit);
        Ok(records)
    }

    /// Records matching `conditions`, served through `index`.
    /// Backends without index support fall back to a filtered scan.
    async fn index_scan(
        &self,
        collection: &str,
        index: &str,
        conditions: &[Condition],
    ) -> Result<Vec<Record>, AppError> {
        tracing::debug!("No native index scan for {} ({}), filtering a full scan", collection, index);
        let records = self.scan(collection).await?;
        Ok(records
            .into_iter()
            .filter(|record| conditions.iter().all(|c| evaluate_condition(record, c)))
            .collect())
    }
}

#[async_trait]
pub trait SchemaProvider: Send + Sync {
    async fn infer(&self) -> Result<SchemaSnapshot, AppError>;
}

/// JSON-backed store: `{collection: [records], "_indexes": {name: {collection, fields}}}`
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    collections: RwLock<BTreeMap<String, Vec<Record>>>,
    indexes: RwLock<BTreeMap<String, IndexDefinition>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(document: Value) -> Result<Self, AppError> {
        let Value::Object(mut root) = document else {
            return Err(AppError::Validation(
                "Data document must be a JSON object of collections".to_string(),
            ));
        };

        let indexes: BTreeMap<String, IndexDefinition> = match root.remove(INDEXES_KEY) {
            Some(raw) => serde_json::from_value(raw)?,
            None => BTreeMap::new(),
        };

        let mut collections = BTreeMap::new();
        for (name, value) in root {
            let Value::Array(items) = value else {
                return Err(AppError::Validation(format!(
                    "Collection '{}' must be an array of records",
                    name
                )));
            };
            let records: Vec<Record> = items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(record) => Some(record),
                    _ => None,
                })
                .collect();
            collections.insert(name, records);
        }

        tracing::info!(
            "Loaded {} collections and {} indexes into memory",
            collections.len(),
            indexes.len()
        );

        Ok(Self {
            collections: RwLock::new(collections),
            indexes: RwLock::new(indexes),
        })
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            AppError::Configuration(format!("Cannot read data file {}: {}", path.display(), e))
        })?;
        let document: Value = serde_json::from_str(&raw)?;
        Self::from_json(document)
    }

    pub async fn insert_collection(&self, name: impl Into<String>, records: Vec<Record>) {
        self.collections.write().await.insert(name.into(), records);
    }

    pub async fn add_index(&self, name: impl Into<String>, collection: &str, fields: &[&str]) {
        self.indexes.write().await.insert(
            name.into(),
            IndexDefinition {
                collection: Some(collection.to_string()),
                fields: fields.iter().map(|f| f.to_string()).collect(),
            },
        );
    }

    pub async fn collection_names(&self) -> Vec<String> {
        self.collections.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl DataBackend for InMemoryBackend {
    async fn scan(&self, collection: &str) -> Result<Vec<Record>, AppError> {
        let collections = self.collections.read().await;
        Ok(collections.get(collection).cloned().unwrap_or_default())
    }

    async fn sample(&self, collection: &str, limit: usize) -> Result<Vec<Record>, AppError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|records| records.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn index_scan(
        &self,
        collection: &str,
        index: &str,
        conditions: &[Condition],
    ) -> Result<Vec<Record>, AppError> {
        let known = {
            let indexes = self.indexes.read().await;
            indexes
                .get(index)
                .map(|def| def.collection.as_deref().map(|c| c == collection).unwrap_or(true))
                .unwrap_or(false)
        };
        if !known {
            tracing::warn!("Index {} not defined on {}, scanning instead", index, collection);
        }

        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|records| {
                records
                    .iter()
                    .filter(|record| conditions.iter().all(|c| evaluate_condition(record, c)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl SchemaProvider for InMemoryBackend {
    async fn infer(&self) -> Result<SchemaSnapshot, AppError> {
        let collections = self.collections.read().await;
        let mut snapshot = SchemaSnapshot::new();

        for (name, records) in collections.iter() {
            let mut fields: Vec<String> = Vec::new();
            for record in records {
                for key in record.keys() {
                    if !fields.contains(key) {
                        fields.push(key.clone());
                    }
                }
            }
            snapshot.collections.push(name.clone());
            snapshot.fields.insert(name.clone(), fields);
            snapshot.row_counts.insert(name.clone(), records.len() as u64);
        }
        snapshot.indexes = self.indexes.read().await.clone();
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ComparisonOp;
    use serde_json::json;

    fn sample() -> InMemoryBackend {
        InMemoryBackend::from_json(json!({
            "users": [
                {"id": 1, "name": "Ann", "age": 34},
                {"id": 2, "name": "Bob", "age": 19, "email": "bob@example.com"}
            ],
            "orders": [{"id": 10, "user_id": 1, "total": 25.5}],
            "_indexes": {"idx_users_age": {"collection": "users", "fields": ["age"]}}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_scan_unknown_collection_is_empty() {
        let backend = sample();
        assert_eq!(backend.scan("users").await.unwrap().len(), 2);
        assert!(backend.scan("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sample_is_bounded() {
        let backend = sample();
        let records = backend.sample("users", 1).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["name"], "Ann");
        assert!(backend.sample("missing", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_index_scan_filters() {
        let backend = sample();
        let adults = backend
            .index_scan(
                "users",
                "idx_users_age",
                &[Condition::new("age", ComparisonOp::Ge, json!(21))],
            )
            .await
            .unwrap();
        assert_eq!(adults.len(), 1);
        assert_eq!(adults[0]["name"], "Ann");
    }

    #[tokio::test]
    async fn test_infer_snapshot() {
        let snapshot = sample().infer().await.unwrap();
        assert_eq!(snapshot.collections, vec!["orders", "users"]);
        let mut fields = snapshot.fields_of("users").to_vec();
        fields.sort();
        assert_eq!(fields, vec!["age", "email", "id", "name"]);
        assert_eq!(snapshot.row_counts.get("users"), Some(&2));
        assert_eq!(snapshot.index_for(Some("users"), "age"), Some("idx_users_age"));
    }

    #[test]
    fn test_rejects_malformed_documents() {
        let err = tokio_test::assert_err!(InMemoryBackend::from_json(json!([1, 2])));
        assert!(matches!(err, AppError::Validation(_)));
        assert!(InMemoryBackend::from_json(json!({"users": {"id": 1}})).is_err());

        let missing = tokio_test::block_on(InMemoryBackend::from_file("/nonexistent/data.json"));
        assert!(matches!(missing, Err(AppError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_runtime_inserts() {
        let backend = InMemoryBackend::new();
        let record = json!({"sku": "a1"}).as_object().cloned().unwrap();
        backend.insert_collection("products", vec![record]).await;
        backend.add_index("idx_sku", "products", &["sku"]).await;

        assert_eq!(backend.collection_names().await, vec!["products"]);
        let snapshot = backend.infer().await.unwrap();
        assert!(snapshot.is_indexed("sku"));
    }
}
