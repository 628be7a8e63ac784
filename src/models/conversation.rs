use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub turn_id: u64,
    pub timestamp: DateTime<Utc>,
    pub query: String,
    pub intent: String,
    /// Entity names keyed by entity type
    pub entities: BTreeMap<EntityType, Vec<String>>,
    pub result_summary: String,
    pub result_count: usize,
    pub execution_time_ms: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Collection,
    Field,
    Value,
    Function,
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityType::Collection => "collection",
            EntityType::Field => "field",
            EntityType::Value => "value",
            EntityType::Function => "function",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityReference {
    pub name: String,
    pub entity_type: EntityType,
    pub first_mention: u64,
    pub last_mention: u64,
    pub mention_count: u64,
    #[serde(default)]
    pub aliases: BTreeSet<String>,
}

impl EntityReference {
    pub fn new(name: impl Into<String>, entity_type: EntityType, turn: u64) -> Self {
        Self {
            name: name.into(),
            entity_type,
            first_mention: turn,
            last_mention: turn,
            mention_count: 1,
            aliases: BTreeSet::new(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.entity_type, self.name)
    }

    pub fn record_mention(&mut self, turn: u64) {
        self.last_mention = turn;
        self.mention_count += 1;
    }

    /// `0.6 * recency + 0.4 * frequency`
    pub fn relevance(&self, current_turn: u64) -> f64 {
        let turns_since = current_turn.saturating_sub(self.last_mention) as f64;
        let recency = 1.0 / (1.0 + turns_since);
        let frequency = (self.mention_count as f64 / 5.0).min(1.0);
        0.6 * recency + 0.4 * frequency
    }
}

/// Stored result for a previously answered query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub query: String,
    pub normalized_query: String,
    pub intent: String,
    pub result: Value,
    pub execution_time_ms: f64,
    pub schema_hash: String,
    pub created_at: DateTime<Utc>,
    pub access_count: u64,
    pub last_accessed: DateTime<Utc>,
    /// Monotonic access sequence, breaks ties between equal timestamps
    #[serde(skip)]
    pub(crate) access_seq: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relevance_formula() {
        let mut entity = EntityReference::new("users", EntityType::Collection, 1);
        // same turn, one mention: 0.6 * 1 + 0.4 * 0.2
        assert!((entity.relevance(1) - 0.68).abs() < 1e-9);
        for turn in 2..=6 {
            entity.record_mention(turn);
        }
        assert!((entity.relevance(6) - 1.0).abs() < 1e-9);
        // two turns later: 0.6 / 3 + 0.4
        assert!((entity.relevance(8) - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_entity_key() {
        let entity = EntityReference::new("age", EntityType::Field, 1);
        assert_eq!(entity.key(), "field:age");
    }
}
