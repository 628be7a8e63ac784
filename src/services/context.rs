// Conversation Context Service
//
// Per-session conversation state: a bounded ring of turns, tracked entity
// references with recency/frequency relevance, and pronoun resolution.
// ContextManager owns every session plus the shared query memory.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{ConversationTurn, EntityReference, EntityType};
use crate::services::query_memory::QueryMemory;

pub const DEFAULT_MAX_TURNS: usize = 50;

const SINGULAR_PRONOUNS: &[&str] = &["it", "that", "this"];
const PLURAL_PRONOUNS: &[&str] = &["they", "them", "those", "these"];

/// Everything recorded about one answered query
#[derive(Debug, Clone, Default)]
pub struct TurnInput {
    pub query: String,
    pub intent: String,
    pub entities: BTreeMap<EntityType, Vec<String>>,
    pub result_summary: String,
    pub result_count: usize,
    pub execution_time_ms: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub struct ConversationContext {
    session_id: String,
    created_at: DateTime<Utc>,
    max_turns: usize,
    turns: VecDeque<ConversationTurn>,
    current_turn: u64,
    entities: HashMap<String, EntityReference>,
    active_filters: BTreeMap<String, Value>,
    preferences: BTreeMap<String, Value>,
}

impl ConversationContext {
    pub fn new(session_id: impl Into<String>, max_turns: usize) -> Self {
        Self {
            session_id: session_id.into(),
            created_at: Utc::now(),
            max_turns: max_turns.max(1),
            turns: VecDeque::new(),
            current_turn: 0,
            entities: HashMap::new(),
            active_filters: BTreeMap::new(),
            preferences: BTreeMap::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn current_turn(&self) -> u64 {
        self.current_turn
    }

    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }

    pub fn add_turn(&mut self, input: TurnInput) -> &ConversationTurn {
        self.current_turn += 1;
        let turn_id = self.current_turn;

        for (entity_type, names) in &input.entities {
            for name in names {
                let key = format!("{}:{}", entity_type, name);
                self.entities
                    .entry(key)
                    .and_modify(|e| e.record_mention(turn_id))
                    .or_insert_with(|| EntityReference::new(name.clone(), *entity_type, turn_id));
            }
        }

        self.turns.push_back(ConversationTurn {
            turn_id,
            timestamp: Utc::now(),
            query: input.query,
            intent: input.intent,
            entities: input.entities,
            result_summary: input.result_summary,
            result_count: input.result_count,
            execution_time_ms: input.execution_time_ms,
            confidence: input.confidence,
        });
        while self.turns.len() > self.max_turns {
            self.turns.pop_front();
        }
        // Entities live only as long as a retained turn mentions them
        if let Some(oldest) = self.turns.front().map(|t| t.turn_id) {
            self.entities.retain(|_, e| e.last_mention >= oldest);
        }

        tracing::debug!(
            "Session {} turn {} recorded ({} entities tracked)",
            self.session_id,
            turn_id,
            self.entities.len()
        );
        &self.turns[self.turns.len() - 1]
    }

    /// Entities scoring at least `threshold`, most relevant first.
    /// Ties fall back to recency, then mention count, then name.
    pub fn get_relevant_entities(&self, threshold: f64) -> Vec<(EntityReference, f64)> {
        let mut scored: Vec<(EntityReference, f64)> = self
            .entities
            .values()
            .map(|e| (e.clone(), e.relevance(self.current_turn)))
            .filter(|(_, score)| *score >= threshold)
            .collect();
        scored.sort_by(|(a, sa), (b, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.last_mention.cmp(&a.last_mention))
                .then_with(|| b.mention_count.cmp(&a.mention_count))
                .then_with(|| a.name.cmp(&b.name))
        });
        scored
    }

    fn most_relevant(&self, entity_type: Option<EntityType>, threshold: f64) -> Option<String> {
        self.get_relevant_entities(threshold)
            .into_iter()
            .find(|(e, _)| entity_type.map(|t| e.entity_type == t).unwrap_or(true))
            .map(|(e, _)| e.name)
    }

    /// Maps a pronoun or vague reference onto a tracked entity name
    pub fn resolve_reference(&self, reference: &str) -> Option<String> {
        let lower = reference.trim().to_lowercase();

        if SINGULAR_PRONOUNS.contains(&lower.as_str()) {
            return self.most_relevant(None, 0.0);
        }
        if PLURAL_PRONOUNS.contains(&lower.as_str()) {
            return self.most_relevant(Some(EntityType::Collection), 0.3);
        }
        if lower.contains("field") || lower.contains("column") {
            return self.most_relevant(Some(EntityType::Field), 0.0);
        }
        if lower.contains("table") || lower.contains("collection") {
            return self.most_relevant(Some(EntityType::Collection), 0.0);
        }

        self.entities
            .values()
            .find(|e| e.aliases.contains(&lower))
            .map(|e| e.name.clone())
    }

    pub fn add_alias(&mut self, entity_type: EntityType, name: &str, alias: &str) -> bool {
        match self.entities.get_mut(&format!("{}:{}", entity_type, name)) {
            Some(entity) => {
                entity.aliases.insert(alias.to_lowercase());
                true
            }
            None => false,
        }
    }

    pub fn active_collection(&self) -> Option<String> {
        self.most_relevant(Some(EntityType::Collection), 0.0)
    }

    pub fn recent_turns(&self, n: usize) -> Vec<&ConversationTurn> {
        let skip = self.turns.len().saturating_sub(n);
        self.turns.iter().skip(skip).collect()
    }

    pub fn last_turn(&self) -> Option<&ConversationTurn> {
        self.turns.back()
    }

    pub fn history(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.turns.iter()
    }

    pub fn set_filter(&mut self, field: impl Into<String>, value: Value) {
        self.active_filters.insert(field.into(), value);
    }

    pub fn clear_filter(&mut self, field: &str) -> Option<Value> {
        self.active_filters.remove(field)
    }

    pub fn active_filters(&self) -> &BTreeMap<String, Value> {
        &self.active_filters
    }

    pub fn set_preference(&mut self, key: impl Into<String>, value: Value) {
        self.preferences.insert(key.into(), value);
    }

    pub fn preference(&self, key: &str) -> Option<&Value> {
        self.preferences.get(key)
    }

    /// Short textual summary used as prompt context for a language model
    pub fn compress(&self) -> String {
        let mut lines = Vec::new();

        let recent: Vec<&str> = self
            .recent_turns(3)
            .into_iter()
            .map(|t| t.query.as_str())
            .collect();
        if !recent.is_empty() {
            lines.push(format!("Recent queries: {}", recent.join("; ")));
        }

        let focus: Vec<String> = self
            .get_relevant_entities(0.5)
            .into_iter()
            .take(5)
            .map(|(e, _)| format!("{} ({})", e.name, e.entity_type))
            .collect();
        if !focus.is_empty() {
            lines.push(format!("Focus entities: {}", focus.join(", ")));
        }

        if !self.active_filters.is_empty() {
            let filters: Vec<String> = self
                .active_filters
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            lines.push(format!("Active filters: {}", filters.join(", ")));
        }

        lines.join("\n")
    }

    pub fn clear(&mut self) {
        self.turns.clear();
        self.entities.clear();
        self.active_filters.clear();
        self.current_turn = 0;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub turns: usize,
    pub created_at: DateTime<Utc>,
    pub active: bool,
}

pub type SharedContext = Arc<Mutex<ConversationContext>>;

#[derive(Default)]
struct Sessions {
    contexts: HashMap<String, SharedContext>,
    active: Option<String>,
}

/// Session registry; each session's context is only touched by that session's queries
pub struct ContextManager {
    sessions: Arc<RwLock<Sessions>>,
    memory: Arc<QueryMemory>,
    max_turns: usize,
}

impl ContextManager {
    pub fn new(max_turns: usize, memory_max_size: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(Sessions::default())),
            memory: Arc::new(QueryMemory::new(memory_max_size)),
            max_turns,
        }
    }

    pub fn memory(&self) -> Arc<QueryMemory> {
        Arc::clone(&self.memory)
    }

    /// Creates a context and makes it the active session
    pub async fn create_context(&self, session_id: Option<String>) -> (String, SharedContext) {
        let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let context = Arc::new(Mutex::new(ConversationContext::new(
            session_id.clone(),
            self.max_turns,
        )));

        let mut sessions = self.sessions.write().await;
        sessions
            .contexts
            .insert(session_id.clone(), Arc::clone(&context));
        sessions.active = Some(session_id.clone());
        tracing::info!("Created conversation context {}", session_id);
        (session_id, context)
    }

    pub async fn get_context(&self, session_id: &str) -> Option<SharedContext> {
        self.sessions.read().await.contexts.get(session_id).cloned()
    }

    pub async fn get_or_create_context(&self, session_id: &str) -> SharedContext {
        {
            let sessions = self.sessions.read().await;
            if let Some(context) = sessions.contexts.get(session_id) {
                return Arc::clone(context);
            }
        }

        let mut sessions = self.sessions.write().await;
        // Another task may have created it while we waited for the write lock
        if let Some(context) = sessions.contexts.get(session_id) {
            return Arc::clone(context);
        }
        let context = Arc::new(Mutex::new(ConversationContext::new(
            session_id,
            self.max_turns,
        )));
        sessions
            .contexts
            .insert(session_id.to_string(), Arc::clone(&context));
        tracing::info!("Created conversation context {}", session_id);
        context
    }

    pub async fn active_context(&self) -> Option<SharedContext> {
        let sessions = self.sessions.read().await;
        sessions
            .active
            .as_ref()
            .and_then(|id| sessions.contexts.get(id))
            .cloned()
    }

    pub async fn active_session(&self) -> Option<String> {
        self.sessions.read().await.active.clone()
    }

    pub async fn switch_context(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.contexts.contains_key(session_id) {
            sessions.active = Some(session_id.to_string());
            true
        } else {
            false
        }
    }

    pub async fn remove_context(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        let removed = sessions.contexts.remove(session_id).is_some();
        if sessions.active.as_deref() == Some(session_id) {
            sessions.active = None;
        }
        if removed {
            tracing::info!("Removed conversation context {}", session_id);
        }
        removed
    }

    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        let mut summaries: Vec<SessionSummary> = sessions
            .contexts
            .iter()
            .map(|(id, ctx)| {
                let ctx = ctx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                SessionSummary {
                    session_id: id.clone(),
                    turns: ctx.turn_count(),
                    created_at: ctx.created_at(),
                    active: sessions.active.as_deref() == Some(id.as_str()),
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.session_id.cmp(&b.session_id)));
        summaries
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.contexts.len()
    }

    /// Drops every session and the shared memory
    pub async fn clear(&self) {
        let mut sessions = self.sessions.write().await;
        sessions.contexts.clear();
        sessions.active = None;
        self.memory.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn turn(query: &str, entities: &[(EntityType, &str)]) -> TurnInput {
        let mut map: BTreeMap<EntityType, Vec<String>> = BTreeMap::new();
        for (entity_type, name) in entities {
            map.entry(*entity_type).or_default().push(name.to_string());
        }
        TurnInput {
            query: query.to_string(),
            intent: "retrieve".to_string(),
            entities: map,
            ..Default::default()
        }
    }

    #[test]
    fn test_ring_keeps_most_recent_turns() {
        let mut ctx = ConversationContext::new("s", 2);
        ctx.add_turn(turn("first", &[(EntityType::Collection, "users")]));
        ctx.add_turn(turn("second", &[(EntityType::Collection, "orders")]));
        ctx.add_turn(turn("third", &[(EntityType::Field, "total")]));

        let queries: Vec<&str> = ctx.history().map(|t| t.query.as_str()).collect();
        assert_eq!(queries, vec!["second", "third"]);
        assert_eq!(ctx.resolve_reference("it"), Some("total".to_string()));
    }

    #[test]
    fn test_entities_age_out_with_turns() {
        let mut ctx = ConversationContext::new("s", 2);
        for i in 0..50 {
            let name = format!("field_{}", i);
            ctx.add_turn(turn("q", &[(EntityType::Field, name.as_str())]));
        }
        let names: Vec<String> = ctx
            .get_relevant_entities(0.0)
            .into_iter()
            .map(|(e, _)| e.name)
            .collect();
        assert_eq!(names, vec!["field_49", "field_48"]);
    }

    #[test]
    fn test_entity_mentions_accumulate() {
        let mut ctx = ConversationContext::new("s", 10);
        ctx.add_turn(turn("a", &[(EntityType::Collection, "users")]));
        ctx.add_turn(turn("b", &[(EntityType::Collection, "users")]));

        let entities = ctx.get_relevant_entities(0.0);
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].0.mention_count, 2);
        assert_eq!(entities[0].0.first_mention, 1);
        assert_eq!(entities[0].0.last_mention, 2);
    }

    #[test]
    fn test_resolve_by_entity_type() {
        let mut ctx = ConversationContext::new("s", 10);
        ctx.add_turn(turn(
            "users by age",
            &[(EntityType::Collection, "users"), (EntityType::Field, "age")],
        ));
        ctx.add_turn(turn("value", &[(EntityType::Value, "gold")]));

        assert_eq!(ctx.resolve_reference("them"), Some("users".to_string()));
        assert_eq!(ctx.resolve_reference("that field"), Some("age".to_string()));
        assert_eq!(ctx.resolve_reference("the table"), Some("users".to_string()));
        assert_eq!(ctx.resolve_reference("this"), Some("gold".to_string()));
        assert_eq!(ctx.resolve_reference("bananas"), None);
    }

    #[test]
    fn test_resolve_without_entities() {
        let ctx = ConversationContext::new("s", 10);
        assert_eq!(ctx.resolve_reference("it"), None);
        assert_eq!(ctx.resolve_reference("they"), None);
        assert!(ctx.active_collection().is_none());
    }

    #[test]
    fn test_aliases_and_filters() {
        let mut ctx = ConversationContext::new("s", 10);
        ctx.add_turn(turn("customers", &[(EntityType::Collection, "users")]));
        assert!(ctx.add_alias(EntityType::Collection, "users", "Customers"));
        assert_eq!(ctx.resolve_reference("customers"), Some("users".to_string()));

        ctx.set_filter("status", json!("active"));
        ctx.set_preference("format", json!("table"));
        let summary = ctx.compress();
        assert!(summary.contains("Recent queries: customers"));
        assert!(summary.contains("users (collection)"));
        assert!(summary.contains("status=\"active\""));
        assert_eq!(ctx.preference("format"), Some(&json!("table")));

        assert_eq!(ctx.clear_filter("status"), Some(json!("active")));
        assert!(ctx.active_filters().is_empty());
    }

    #[tokio::test]
    async fn test_manager_get_or_create_is_idempotent() {
        let manager = ContextManager::new(10, 100);
        let a = manager.get_or_create_context("s1").await;
        let b = manager.get_or_create_context("s1").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_manager_switch_and_remove() {
        let manager = ContextManager::new(10, 100);
        let (first, _) = manager.create_context(Some("first".into())).await;
        let (second, _) = manager.create_context(None).await;
        assert_eq!(manager.active_session().await, Some(second.clone()));

        assert!(manager.switch_context(&first).await);
        assert!(!manager.switch_context("missing").await);
        assert_eq!(manager.active_session().await, Some(first.clone()));

        assert!(manager.remove_context(&first).await);
        assert!(manager.active_context().await.is_none());
        assert!(!manager.remove_context(&first).await);

        let sessions = manager.list_sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, second);
    }

    #[tokio::test]
    async fn test_manager_shares_memory() {
        let manager = ContextManager::new(10, 100);
        manager
            .memory()
            .store("q", "q", "count", json!(1), 1.0, "h");
        assert_eq!(manager.memory().len(), 1);
        manager.clear().await;
        assert!(manager.memory().is_empty());
    }
}
