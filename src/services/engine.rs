// PromptQL Engine
//
// Orchestrates one query end to end: result cache, schema snapshot, planning,
// optional reasoning, optimization, execution, formatting, conversation
// context and caching. Per-query failures come back as failed results.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::error::AppError;
use crate::models::{
    EngineStats, EntityType, ExecutionContext, Explanation, Intent, QueryLanguage, QueryMode,
    QueryOptions, QueryPlan, QueryResult, Record, SchemaSnapshot, StepKind,
};
use crate::services::backend::{DataBackend, InMemoryBackend, SchemaProvider};
use crate::services::context::{ContextManager, SharedContext, TurnInput};
use crate::services::embedding::EmbeddingProvider;
use crate::services::executor::QueryExecutor;
use crate::services::formatter::ResultFormatter;
use crate::services::llm_service::LlmGateway;
use crate::services::optimizer::{CostModel, QueryOptimizer};
use crate::services::planner::{PlanningContext, QueryPlanner};
use crate::services::query_cache::ResultCache;
use crate::services::reasoner::MultiStepReasoner;
use crate::services::schema_inference::SchemaInference;
use crate::services::semantic::{SemanticParser, SemanticSimilarity};
use crate::services::translator::QueryTranslator;
use crate::validation::{PromptValidator, TqlValidator};

const MAX_SUGGESTIONS: usize = 5;
const MAX_COMPLETIONS: usize = 10;
const SIMILAR_QUERY_THRESHOLD: f64 = 0.5;
const HISTORY_MATCH_THRESHOLD: f64 = 0.3;
const SCHEMA_SAMPLE_SIZE: usize = 100;
const DEFAULT_SESSION: &str = "default";

pub struct PromptQlEngine {
    config: EngineConfig,
    schema_provider: Option<Arc<dyn SchemaProvider>>,
    backend: Option<Arc<dyn DataBackend>>,
    executor: QueryExecutor,
    planner: QueryPlanner,
    reasoner: MultiStepReasoner,
    optimizer: QueryOptimizer,
    translator: QueryTranslator,
    formatter: ResultFormatter,
    prompt_validator: PromptValidator,
    schema_inference: SchemaInference,
    similarity: SemanticSimilarity,
    contexts: ContextManager,
    result_cache: ResultCache<QueryResult>,
    llm: Option<Arc<LlmGateway>>,
    stats: Mutex<EngineStats>,
}

impl PromptQlEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            schema_provider: None,
            backend: None,
            executor: QueryExecutor::new(None),
            planner: QueryPlanner::new(),
            reasoner: MultiStepReasoner::new(config.max_reasoning_steps),
            optimizer: QueryOptimizer::new(CostModel::new(config.memory_gb, config.ssd_storage)),
            translator: QueryTranslator::new(),
            formatter: ResultFormatter::new(),
            prompt_validator: PromptValidator::new(config.max_prompt_length),
            schema_inference: SchemaInference::new(SCHEMA_SAMPLE_SIZE, config.cache_ttl_seconds),
            similarity: SemanticSimilarity::new(None),
            contexts: ContextManager::new(config.max_context_turns, config.memory_max_size),
            result_cache: ResultCache::new(config.cache_max_entries, config.cache_ttl_seconds),
            llm: None,
            stats: Mutex::new(EngineStats::default()),
            config,
        }
    }

    /// Uses one in-memory store both as data backend and schema provider
    pub fn with_in_memory(self, store: Arc<InMemoryBackend>) -> Self {
        let backend: Arc<dyn DataBackend> = store.clone();
        self.with_backend(backend).with_schema_provider(store)
    }

    pub fn with_backend(mut self, backend: Arc<dyn DataBackend>) -> Self {
        self.executor = QueryExecutor::new(Some(Arc::clone(&backend)));
        self.backend = Some(backend);
        self
    }

    pub fn with_schema_provider(mut self, provider: Arc<dyn SchemaProvider>) -> Self {
        self.schema_provider = Some(provider);
        self
    }

    pub fn with_llm(mut self, gateway: Arc<LlmGateway>) -> Self {
        self.llm = Some(gateway);
        self
    }

    pub fn with_embedding_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.similarity = SemanticSimilarity::new(Some(provider));
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    pub fn optimizer(&self) -> &QueryOptimizer {
        &self.optimizer
    }

    pub fn contexts(&self) -> &ContextManager {
        &self.contexts
    }

    pub fn formatter(&self) -> &ResultFormatter {
        &self.formatter
    }

    fn stats_guard(&self) -> MutexGuard<'_, EngineStats> {
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn query(&self, prompt: &str, options: QueryOptions) -> QueryResult {
        let started = Instant::now();
        match self.run_query(prompt, &options, started).await {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!("Query failed ({}): {}", err.code(), err);
                self.stats_guard().failed_queries += 1;
                QueryResult::from_error(&err, elapsed_ms(started))
            }
        }
    }

    async fn run_query(
        &self,
        prompt: &str,
        options: &QueryOptions,
        started: Instant,
    ) -> Result<QueryResult, AppError> {
        let prompt = self.prepare_prompt(prompt)?;
        let mode = options.mode.unwrap_or(self.config.default_mode);

        let cache_key = self.cache_key(&prompt, options, mode)?;
        if self.config.enable_caching {
            if let Some(mut hit) = self.result_cache.get(&cache_key) {
                tracing::debug!("Result cache hit for '{}'", prompt);
                self.stats_guard().cache_hits += 1;
                hit.cached = true;
                return Ok(hit);
            }
        }

        let session = self.session(options.session_id.as_deref()).await;
        let schema = self.schema().await?;
        let parser = SemanticParser::new(&schema);
        let prompt = if self.config.enable_typo_correction {
            let (corrected, fixes) = parser.corrector().correct_query(&prompt);
            if !fixes.is_empty() {
                tracing::debug!("Corrected {} words: {:?}", fixes.len(), fixes);
            }
            corrected
        } else {
            prompt
        };
        let parsed = parser.parse(&prompt);

        let (planning, compressed) = {
            let ctx = lock_context(&session);
            (PlanningContext::from(&*ctx), ctx.compress())
        };

        let tokens_before = self.llm.as_ref().map(|l| l.total_tokens()).unwrap_or(0);
        let plan = self
            .build_plan(&prompt, &schema, &planning, &compressed, mode, options.deep_understanding)
            .await?;

        let reasoning = if mode == QueryMode::Reasoning && plan.requires_reasoning {
            let chain = self
                .reasoner
                .reason(&prompt, &plan, &schema, self.config.max_reasoning_steps);
            self.stats_guard().total_reasoning_steps += chain.len() as u64;
            Some(chain)
        } else {
            None
        };

        let plan = if self.config.enable_optimization {
            let optimization = self.optimizer.optimize(&plan, &schema);
            if !optimization.optimizations_applied.is_empty() {
                tracing::debug!(
                    "Applied {:?} (speedup {:.2}x)",
                    optimization.optimizations_applied,
                    optimization.estimated_speedup
                );
            }
            optimization.optimized_plan
        } else {
            plan
        };

        let intent = plan
            .intents
            .first()
            .map(Intent::as_str)
            .unwrap_or("retrieve")
            .to_string();
        let context = ExecutionContext::new(plan.clone())
            .with_timeout_ms(self.config.timeout_seconds.saturating_mul(1000))
            .with_max_rows(self.config.max_rows);
        let execution = self.executor.execute(context).await;
        if let Some(err) = execution.to_error() {
            return Err(err);
        }
        self.optimizer.learn_from_execution(
            &plan,
            execution.execution_time_ms,
            execution.row_count as u64,
        );
        // Memory feeds patterns and similar-query suggestions, never answers
        self.contexts.memory().store(
            &prompt,
            &parsed.normalized_query,
            &intent,
            execution.data.clone(),
            execution.execution_time_ms,
            &schema.schema_hash(),
        );

        let (data, row_count) = (execution.data, execution.row_count);
        let warnings = execution.warnings;
        let mut result = QueryResult::new(data, row_count);
        result.suggestions = self.generate_suggestions(&prompt, &intent, &result.data, &plan, &schema);
        result.reasoning_chain = reasoning.map(|chain| chain.to_trace());
        result.warnings = warnings;
        result.tokens_used = self
            .llm
            .as_ref()
            .map(|l| l.total_tokens().saturating_sub(tokens_before))
            .unwrap_or(0);
        result.execution_time_ms = elapsed_ms(started);

        {
            let mut ctx = lock_context(&session);
            ctx.add_turn(TurnInput {
                query: prompt.clone(),
                intent: intent.clone(),
                entities: self.turn_entities(&prompt, &plan, &schema),
                result_summary: self.formatter.summary(&result.data),
                result_count: result.row_count,
                execution_time_ms: result.execution_time_ms,
                confidence: parsed.intent_confidence,
            });
        }
        result.plan = Some(plan);

        if self.config.enable_caching {
            self.result_cache.put(cache_key, result.clone(), None);
        }

        {
            let mut stats = self.stats_guard();
            stats.queries_processed += 1;
            stats.record_execution(result.execution_time_ms);
        }
        tracing::info!(
            "Answered '{}' with {} rows in {:.1} ms",
            prompt,
            result.row_count,
            result.execution_time_ms
        );
        Ok(result)
    }

    fn prepare_prompt(&self, prompt: &str) -> Result<String, AppError> {
        if self.config.sanitize_queries {
            self.prompt_validator.sanitize(prompt)
        } else if prompt.trim().is_empty() {
            Err(AppError::Validation("Prompt must not be empty".to_string()))
        } else {
            Ok(prompt.trim().to_string())
        }
    }

    /// Prompt, caller context, mode and whether language-model hints shape the plan;
    /// the session joins the key in conversational mode
    fn cache_key(
        &self,
        prompt: &str,
        options: &QueryOptions,
        mode: QueryMode,
    ) -> Result<String, AppError> {
        let context = match &options.context {
            Some(value) => serde_json::to_string(value)?,
            None => String::new(),
        };
        let session = match mode {
            QueryMode::Conversational => options.session_id.clone().unwrap_or_default(),
            _ => String::new(),
        };
        let hinted = if options.deep_understanding && self.llm.is_some() {
            "hinted"
        } else {
            "patterns"
        };
        let mode = serde_json::to_string(&mode)?;
        Ok(ResultCache::<QueryResult>::generate_key(&[
            prompt,
            context.as_str(),
            mode.as_str(),
            session.as_str(),
            hinted,
        ]))
    }

    /// The named session, or the shared default one for sessionless calls
    async fn session(&self, session_id: Option<&str>) -> SharedContext {
        self.contexts
            .get_or_create_context(session_id.unwrap_or(DEFAULT_SESSION))
            .await
    }

    /// Snapshot from the schema provider, enriched from backend samples
    pub async fn schema(&self) -> Result<SchemaSnapshot, AppError> {
        if !self.config.enable_schema_inference {
            return Ok(SchemaSnapshot::new());
        }
        let Some(provider) = &self.schema_provider else {
            return Ok(SchemaSnapshot::new());
        };
        let mut snapshot = provider.infer().await?;

        let mut samples: HashMap<String, Vec<Record>> = HashMap::new();
        if let Some(backend) = &self.backend {
            let stale = snapshot
                .collections
                .iter()
                .filter(|c| self.schema_inference.cached(c).is_none());
            for collection in stale {
                match backend
                    .sample(collection, self.schema_inference.sample_size())
                    .await
                {
                    Ok(records) => {
                        samples.insert(collection.clone(), records);
                    }
                    Err(e) => tracing::warn!("Sampling {} failed: {}", collection, e),
                }
            }
        }
        self.schema_inference.enrich(&mut snapshot, &samples);
        Ok(snapshot)
    }

    async fn build_plan(
        &self,
        prompt: &str,
        schema: &SchemaSnapshot,
        planning: &PlanningContext,
        compressed_context: &str,
        mode: QueryMode,
        deep_understanding: bool,
    ) -> Result<QueryPlan, AppError> {
        if deep_understanding {
            if let Some(llm) = &self.llm {
                let context = (!compressed_context.is_empty()).then_some(compressed_context);
                match llm.parse_query(prompt, schema, context).await {
                    Ok(hints) => {
                        tracing::debug!("Merging LLM hints: {:?}", hints);
                        return Ok(self
                            .planner
                            .create_plan_with_hints(prompt, schema, Some(planning), mode, &hints));
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => tracing::warn!("LLM parse failed, planning from patterns: {}", e),
                }
            }
        }
        Ok(self.planner.create_plan(prompt, schema, Some(planning), mode))
    }

    fn turn_entities(
        &self,
        prompt: &str,
        plan: &QueryPlan,
        schema: &SchemaSnapshot,
    ) -> BTreeMap<EntityType, Vec<String>> {
        let found = QueryPlanner::extract_entities(prompt, schema);
        let mut entities = BTreeMap::new();

        let mut collections = found.collections;
        if collections.is_empty() {
            collections.extend(plan.primary_collection().map(str::to_string));
        }
        let functions: Vec<String> = plan
            .steps
            .iter()
            .filter_map(|s| match &s.kind {
                StepKind::Aggregate { aggregates, .. } => Some(aggregates),
                _ => None,
            })
            .flatten()
            .map(|a| a.function.as_str().to_string())
            .collect();

        for (entity_type, names) in [
            (EntityType::Collection, collections),
            (EntityType::Field, found.fields),
            (EntityType::Value, found.values),
            (EntityType::Function, functions),
        ] {
            if !names.is_empty() {
                entities.insert(entity_type, names);
            }
        }
        entities
    }

    /// Drill-down prompts, related collections and similar past queries
    fn generate_suggestions(
        &self,
        prompt: &str,
        intent: &str,
        data: &Value,
        plan: &QueryPlan,
        schema: &SchemaSnapshot,
    ) -> Vec<String> {
        let mut suggestions = Vec::new();
        let primary = plan.primary_collection().unwrap_or("results");

        if let Value::Array(items) = data {
            if !items.is_empty() {
                suggestions.push("Show me more details about the first result".to_string());
                let group_field = schema
                    .fields_of(primary)
                    .iter()
                    .find(|f| !f.ends_with("id"))
                    .cloned();
                suggestions.push(match group_field {
                    Some(field) => format!("Group these {} by {}", primary, field),
                    None => "Group these results by category".to_string(),
                });
                suggestions.push("What's the trend over time?".to_string());
            }
        }

        for table in schema
            .related_tables
            .iter()
            .filter(|t| t.as_str() != primary)
            .take(2)
        {
            suggestions.push(format!("Show me related {} data", table));
        }

        for (entry, _) in self
            .contexts
            .memory()
            .find_similar(
                prompt,
                intent,
                SIMILAR_QUERY_THRESHOLD,
                Duration::from_secs(self.config.memory_max_age_seconds),
            )
        {
            if entry.query != prompt && !suggestions.contains(&entry.query) {
                suggestions.push(entry.query);
            }
        }

        suggestions.truncate(MAX_SUGGESTIONS);
        suggestions
    }

    /// Plan, reasoning, optimization and rendered query without executing
    pub async fn explain(&self, prompt: &str) -> Result<Explanation, AppError> {
        let prompt = self.prepare_prompt(prompt)?;
        let schema = self.schema().await?;
        let parsed = SemanticParser::new(&schema).parse(&prompt);

        let planning = match self.contexts.get_context(DEFAULT_SESSION).await {
            Some(session) => {
                let ctx = lock_context(&session);
                PlanningContext::from(&*ctx)
            }
            None => PlanningContext::default(),
        };
        let plan = self
            .planner
            .create_plan(&prompt, &schema, Some(&planning), QueryMode::Reasoning);
        let reasoning = self
            .reasoner
            .reason(&prompt, &plan, &schema, self.config.max_reasoning_steps);

        let optimization = self
            .config
            .enable_optimization
            .then(|| self.optimizer.optimize(&plan, &schema));
        let final_plan = optimization
            .as_ref()
            .map(|o| o.optimized_plan.clone())
            .unwrap_or_else(|| plan.clone());
        let index_recommendations = self.optimizer.recommend_indexes(&final_plan, &schema);

        let language = self.config.target_language;
        let mut rendered_query = self.translator.render(&final_plan, language)?;
        if language == QueryLanguage::Tql {
            let (capped, limit_added) =
                TqlValidator::validate_and_prepare(&rendered_query, self.config.max_rows as u64)?;
            if limit_added {
                tracing::debug!("Capped rendered TQL at {} rows", self.config.max_rows);
            }
            rendered_query = capped;
        }

        Ok(Explanation {
            prompt,
            intent: parsed.intent.as_str().to_string(),
            intent_confidence: parsed.intent_confidence,
            plan: final_plan,
            reasoning: Some(reasoning),
            optimization,
            index_recommendations,
            target_language: language,
            rendered_query,
        })
    }

    /// Completions for a partial prompt followed by matching history from the session
    pub async fn suggest(&self, partial: &str, session_id: Option<&str>) -> Vec<String> {
        let schema = match self.schema().await {
            Ok(schema) => schema,
            Err(e) => {
                tracing::warn!("Schema unavailable for suggestions: {}", e);
                SchemaSnapshot::new()
            }
        };

        let session = match session_id {
            Some(id) => self.contexts.get_context(id).await,
            None => self.contexts.get_context(DEFAULT_SESSION).await,
        };
        let (planning, history) = match &session {
            Some(session) => {
                let ctx = lock_context(session);
                let history: Vec<String> = ctx.history().map(|t| t.query.clone()).collect();
                (Some(PlanningContext::from(&*ctx)), history)
            }
            None => (None, Vec::new()),
        };

        let mut suggestions = self
            .planner
            .suggest_completions(partial, &schema, planning.as_ref());

        if !partial.trim().is_empty() && !history.is_empty() {
            for (query, score) in self.similarity.rank(partial, &history).await {
                if score >= HISTORY_MATCH_THRESHOLD && !suggestions.contains(&query) {
                    suggestions.push(query);
                }
            }
        }
        suggestions.truncate(MAX_COMPLETIONS);
        suggestions
    }

    /// Natural-language account of a result; a plain summary without a language model
    pub async fn narrate(&self, prompt: &str, result: &QueryResult) -> Result<String, AppError> {
        let Some(llm) = &self.llm else {
            return Ok(self.formatter.summary(&result.data));
        };
        let rows: Vec<Value> = match &result.data {
            Value::Array(items) => items.clone(),
            Value::Null => Vec::new(),
            other => vec![other.clone()],
        };
        llm.explain_results(prompt, &rows, result.row_count).await
    }

    pub async fn stats(&self) -> EngineStats {
        let mut stats = self.stats_guard().clone();
        stats.active_sessions = self.contexts.session_count().await;
        stats.cached_results = self.result_cache.size();
        stats
    }

    pub fn clear_cache(&self) {
        self.result_cache.clear();
        self.schema_inference.clear_cache();
        if let Some(llm) = &self.llm {
            llm.clear_cache();
        }
        tracing::info!("Engine caches cleared");
    }

    /// Clears the given session, or the default one
    pub async fn clear_context(&self, session_id: Option<&str>) -> bool {
        let session = match session_id {
            Some(id) => self.contexts.get_context(id).await,
            None => self.contexts.get_context(DEFAULT_SESSION).await,
        };
        match session {
            Some(session) => {
                lock_context(&session).clear();
                true
            }
            None => false,
        }
    }

    /// Cancels running executions and drops every cache and session
    pub async fn teardown(&self) {
        for execution in self.executor.active_executions().await {
            self.executor.cancel(&execution.execution_id).await;
        }
        self.clear_cache();
        self.contexts.clear().await;
        *self.stats_guard() = EngineStats::default();
        tracing::info!("Engine torn down");
    }

    /// Renders a plan in the configured target language
    pub fn render(&self, plan: &QueryPlan) -> Result<String, AppError> {
        self.translator.render(plan, self.config.target_language)
    }
}

fn lock_context(
    session: &SharedContext,
) -> MutexGuard<'_, crate::services::context::ConversationContext> {
    session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}
