pub mod backend; // Record sources and schema providers
pub mod context; // Conversation sessions and entity tracking
pub mod embedding;
pub mod engine; // End-to-end query orchestration
pub mod executor;
pub mod formatter;
pub mod llm_service;
pub mod optimizer; // Cost-based plan rewriting
pub mod planner;
pub mod query_cache; // Result cache with LRU and TTL
pub mod query_memory;
pub mod rate_limiter;
pub mod reasoner;
pub mod schema_inference;
pub mod semantic;
pub mod translator; // TQL / NQL / JQL rendering

pub use backend::{DataBackend, InMemoryBackend, SchemaProvider};
pub use context::{ContextManager, ConversationContext, SessionSummary, SharedContext, TurnInput};
pub use embedding::{EmbeddingProvider, HashingEmbedder};
pub use engine::PromptQlEngine;
pub use executor::{ExecutionInfo, QueryExecutor};
pub use formatter::{OutputFormat, ResultFormatter};
pub use llm_service::{HttpLanguageModel, LanguageModel, LlmGateway};
pub use optimizer::{CostModel, QueryOptimizer};
pub use planner::{PlanningContext, PromptEntities, QueryPlanner};
pub use query_cache::{CacheStats, ResultCache};
pub use query_memory::{MemoryStats, QueryMemory};
pub use rate_limiter::RateLimiter;
pub use reasoner::MultiStepReasoner;
pub use schema_inference::SchemaInference;
pub use semantic::{SemanticParser, SemanticSimilarity, SynonymExpander, TypoCorrector};
pub use translator::QueryTranslator;
