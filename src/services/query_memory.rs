// Query Memory
//
// Long-term store of answered queries keyed by (normalized query, schema hash).
// Entries expire by age on recall and overflow evicts least recently accessed.

use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::{LazyLock, Mutex};
use std::time::Duration;

use crate::models::MemoryEntry;
use crate::services::semantic::compile;

static QUOTED_VALUE: LazyLock<Option<Regex>> = LazyLock::new(|| compile(r#""[^"]+""#));
static NUMBER: LazyLock<Option<Regex>> = LazyLock::new(|| compile(r"\b\d+\b"));
static HEX_ID: LazyLock<Option<Regex>> = LazyLock::new(|| compile(r"\b[a-f0-9]{8,}\b"));

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MemoryStats {
    pub total_entries: usize,
    pub total_patterns: usize,
    pub top_patterns: Vec<(String, u64)>,
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: HashMap<String, MemoryEntry>,
    patterns: HashMap<String, u64>,
    seq: u64,
}

pub struct QueryMemory {
    state: Mutex<MemoryState>,
    max_size: usize,
}

impl QueryMemory {
    pub fn new(max_size: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            max_size: max_size.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn make_key(normalized_query: &str, schema_hash: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{}:{}", normalized_query, schema_hash).as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Literal values replaced by placeholders
    pub fn extract_pattern(query: &str) -> String {
        let mut pattern = query.to_lowercase();
        if let Some(re) = QUOTED_VALUE.as_ref() {
            pattern = re.replace_all(&pattern, "\"VALUE\"").into_owned();
        }
        if let Some(re) = NUMBER.as_ref() {
            pattern = re.replace_all(&pattern, "NUM").into_owned();
        }
        if let Some(re) = HEX_ID.as_ref() {
            pattern = re.replace_all(&pattern, "ID").into_owned();
        }
        pattern
    }

    pub fn store(
        &self,
        query: &str,
        normalized_query: &str,
        intent: &str,
        result: Value,
        execution_time_ms: f64,
        schema_hash: &str,
    ) {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.seq += 1;
        let now = Utc::now();

        state.entries.insert(
            Self::make_key(normalized_query, schema_hash),
            MemoryEntry {
                query: query.to_string(),
                normalized_query: normalized_query.to_string(),
                intent: intent.to_string(),
                result,
                execution_time_ms,
                schema_hash: schema_hash.to_string(),
                created_at: now,
                access_count: 1,
                last_accessed: now,
                access_seq: state.seq,
            },
        );

        *state
            .patterns
            .entry(Self::extract_pattern(normalized_query))
            .or_insert(0) += 1;

        Self::evict_overflow(state, self.max_size);
    }

    fn evict_overflow(state: &mut MemoryState, max_size: usize) {
        if state.entries.len() <= max_size {
            return;
        }
        let mut by_age: Vec<(String, (chrono::DateTime<Utc>, u64))> = state
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), (entry.last_accessed, entry.access_seq)))
            .collect();
        by_age.sort_by(|a, b| a.1.cmp(&b.1));

        let to_remove = state.entries.len() - max_size;
        for (key, _) in by_age.into_iter().take(to_remove) {
            state.entries.remove(&key);
        }
        tracing::debug!("Evicted {} memory entries", to_remove);
    }

    /// Returns a fresh entry and bumps its access stats; stale entries are removed
    pub fn recall(
        &self,
        normalized_query: &str,
        schema_hash: &str,
        max_age: Duration,
    ) -> Option<MemoryEntry> {
        let key = Self::make_key(normalized_query, schema_hash);
        let mut guard = self.lock();
        let state = &mut *guard;
        state.seq += 1;
        let seq = state.seq;

        let now = Utc::now();
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let stale = match state.entries.get(&key) {
            None => return None,
            Some(entry) => now.signed_duration_since(entry.created_at) > max_age,
        };
        if stale {
            state.entries.remove(&key);
            tracing::debug!("Memory entry expired for query: {}", normalized_query);
            return None;
        }

        let entry = state.entries.get_mut(&key)?;
        entry.access_count += 1;
        entry.last_accessed = now;
        entry.access_seq = seq;
        Some(entry.clone())
    }

    /// Word-overlap matches sharing `intent` and younger than `max_age`, best first, at most five
    pub fn find_similar(
        &self,
        query: &str,
        intent: &str,
        threshold: f64,
        max_age: Duration,
    ) -> Vec<(MemoryEntry, f64)> {
        let query_words: HashSet<String> =
            query.split_whitespace().map(|w| w.to_lowercase()).collect();
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        let state = self.lock();

        let mut similar: Vec<(MemoryEntry, f64)> = state
            .entries
            .values()
            .filter(|entry| entry.intent == intent)
            .filter(|entry| now.signed_duration_since(entry.created_at) <= max_age)
            .filter_map(|entry| {
                let entry_words: HashSet<String> = entry
                    .query
                    .split_whitespace()
                    .map(|w| w.to_lowercase())
                    .collect();
                let union = query_words.union(&entry_words).count();
                if union == 0 {
                    return None;
                }
                let similarity = query_words.intersection(&entry_words).count() as f64 / union as f64;
                (similarity >= threshold).then(|| (entry.clone(), similarity))
            })
            .collect();

        similar.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.query.cmp(&b.0.query))
        });
        similar.truncate(5);
        similar
    }

    pub fn common_patterns(&self, n: usize) -> Vec<(String, u64)> {
        let state = self.lock();
        let mut patterns: Vec<(String, u64)> = state
            .patterns
            .iter()
            .map(|(p, c)| (p.clone(), *c))
            .collect();
        patterns.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        patterns.truncate(n);
        patterns
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.patterns.clear();
    }

    pub fn stats(&self) -> MemoryStats {
        let (total_entries, total_patterns) = {
            let state = self.lock();
            (state.entries.len(), state.patterns.len())
        };
        MemoryStats {
            total_entries,
            total_patterns,
            top_patterns: self.common_patterns(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_store_then_recall() {
        let memory = QueryMemory::new(10);
        memory.store("Count users", "count users", "count", json!(3), 1.5, "h1");

        let entry = memory
            .recall("count users", "h1", Duration::from_secs(60))
            .unwrap();
        assert_eq!(entry.result, json!(3));
        assert_eq!(entry.access_count, 2);

        assert!(memory.recall("count users", "h2", Duration::from_secs(60)).is_none());
    }

    #[test]
    fn test_recall_after_max_age_removes_entry() {
        let memory = QueryMemory::new(10);
        memory.store("q", "q", "count", json!(1), 1.0, "h");
        std::thread::sleep(Duration::from_millis(30));

        assert!(memory.recall("q", "h", Duration::from_millis(10)).is_none());
        assert!(memory.is_empty());
    }

    #[test]
    fn test_find_similar_threshold() {
        let memory = QueryMemory::new(10);
        memory.store("find all users", "find all users", "retrieve", json!([]), 1.0, "h");

        assert!(memory.find_similar("find users", "retrieve", 0.8, HOUR).is_empty());

        let found = memory.find_similar("find users", "retrieve", 0.4, HOUR);
        assert_eq!(found.len(), 1);
        assert!((found[0].1 - 2.0 / 3.0).abs() < 1e-9);

        assert!(memory.find_similar("find users", "count", 0.1, HOUR).is_empty());
    }

    #[test]
    fn test_find_similar_skips_old_entries() {
        let memory = QueryMemory::new(10);
        memory.store("find all users", "find all users", "retrieve", json!([]), 1.0, "h");
        std::thread::sleep(Duration::from_millis(30));

        assert!(memory
            .find_similar("find all users", "retrieve", 0.5, Duration::from_millis(10))
            .is_empty());
        assert_eq!(memory.find_similar("find all users", "retrieve", 0.5, HOUR).len(), 1);
    }

    #[test]
    fn test_find_similar_ranks_and_caps() {
        let memory = QueryMemory::new(20);
        for i in 0..7 {
            let q = format!("show users page {}", i);
            memory.store(&q, &q, "retrieve", json!(i), 1.0, "h");
        }
        memory.store("show users", "show users", "retrieve", json!(0), 1.0, "h");

        let found = memory.find_similar("show users", "retrieve", 0.1, HOUR);
        assert_eq!(found.len(), 5);
        assert_eq!(found[0].0.query, "show users");
        assert!(found.windows(2).all(|w| w[0].1 >= w[1].1));
    }

    #[test]
    fn test_overflow_evicts_least_recently_accessed() {
        let memory = QueryMemory::new(2);
        memory.store("a", "a", "x", json!(1), 1.0, "h");
        memory.store("b", "b", "x", json!(2), 1.0, "h");
        assert!(memory.recall("a", "h", Duration::from_secs(60)).is_some());
        memory.store("c", "c", "x", json!(3), 1.0, "h");

        assert_eq!(memory.len(), 2);
        assert!(memory.recall("b", "h", Duration::from_secs(60)).is_none());
        assert!(memory.recall("a", "h", Duration::from_secs(60)).is_some());
    }

    #[test]
    fn test_patterns() {
        assert_eq!(
            QueryMemory::extract_pattern("Users named \"Ann\" older than 30"),
            "users named \"VALUE\" older than NUM"
        );

        let memory = QueryMemory::new(10);
        memory.store("top 5 users", "top 5 users", "top_n", json!([]), 1.0, "h");
        memory.store("top 10 users", "top 10 users", "top_n", json!([]), 1.0, "h");
        let patterns = memory.common_patterns(1);
        assert_eq!(patterns, vec![("top NUM users".to_string(), 2)]);

        let stats = memory.stats();
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.total_patterns, 1);

        memory.clear();
        assert!(memory.is_empty());
        assert!(memory.common_patterns(5).is_empty());
    }
}
