// LLM Gateway Service
//
// Optional language-model support for deeper prompt understanding, result
// narration and query repair. Calls go through a TTL response cache and a
// token-bucket rate limiter and are retried with exponential backoff.

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client as HttpClient;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use crate::config::LlmConfig;
use crate::error::AppError;
use crate::models::{
    ChatMessage, ChatRole, ComparisonOp, Condition, LlmProvider, LlmQueryParse, LlmResponse,
    SchemaSnapshot, SortKey, SortOrder,
};
use crate::services::query_cache::ResultCache;
use crate::services::rate_limiter::RateLimiter;
use crate::services::semantic::compile;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const UNABLE_TO_FIX: &str = "UNABLE_TO_FIX";
const EXPLAIN_TEMPERATURE: f64 = 0.3;
const EXPLAIN_SAMPLE_ROWS: usize = 10;
const MAX_BACKOFF: Duration = Duration::from_secs(60);

static EMBEDDED_JSON: LazyLock<Option<Regex>> = LazyLock::new(|| compile(r"(?s)(\{.*\}|\[.*\])"));

/// Capability interface over a completion provider
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model(&self) -> &str;

    async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: u32,
    ) -> Result<LlmResponse, AppError>;

    async fn complete(
        &self,
        prompt: &str,
        temperature: f64,
        max_tokens: u32,
    ) -> Result<LlmResponse, AppError> {
        self.chat(&[ChatMessage::user(prompt)], temperature, max_tokens)
            .await
    }
}

/// HTTP client whose wire format is selected by the provider tag
pub struct HttpLanguageModel {
    provider: LlmProvider,
    base_url: String,
    api_key: Option<String>,
    model: String,
    http_client: HttpClient,
}

impl HttpLanguageModel {
    pub fn from_config(config: &LlmConfig) -> Result<Self, AppError> {
        config.validate()?;
        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| AppError::Configuration(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            provider: config.provider,
            base_url: config.gateway_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            http_client,
        })
    }

    pub fn provider(&self) -> LlmProvider {
        self.provider
    }

    /// Endpoint and JSON body for a chat request
    fn build_request(&self, messages: &[ChatMessage], temperature: f64, max_tokens: u32) -> (String, Value) {
        match self.provider {
            LlmProvider::Local => (
                format!("{}/api/chat", self.base_url),
                json!({
                    "model": self.model,
                    "messages": messages,
                    "stream": false,
                    "options": {"temperature": temperature},
                }),
            ),
            LlmProvider::OpenAi => (
                format!("{}/v1/chat/completions", self.base_url),
                json!({
                    "model": self.model,
                    "messages": messages,
                    "temperature": temperature,
                    "max_tokens": max_tokens,
                }),
            ),
            LlmProvider::Anthropic => {
                let system: Vec<&str> = messages
                    .iter()
                    .filter(|m| m.role == ChatRole::System)
                    .map(|m| m.content.as_str())
                    .collect();
                let turns: Vec<&ChatMessage> =
                    messages.iter().filter(|m| m.role != ChatRole::System).collect();
                let mut body = json!({
                    "model": self.model,
                    "messages": turns,
                    "temperature": temperature,
                    "max_tokens": max_tokens,
                });
                if !system.is_empty() {
                    body["system"] = Value::String(system.join("\n"));
                }
                (format!("{}/v1/messages", self.base_url), body)
            }
            LlmProvider::Custom => {
                let prompt: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
                (
                    self.base_url.clone(),
                    json!({
                        "prompt": prompt.join("\n\n"),
                        "max_tokens": max_tokens,
                        "temperature": temperature,
                    }),
                )
            }
        }
    }

    /// Pulls (content, model, tokens) out of a provider response
    fn parse_response(&self, body: &Value) -> Result<(String, String, u64), AppError> {
        let content = match self.provider {
            LlmProvider::Local => body["message"]["content"]
                .as_str()
                .or_else(|| body["response"].as_str()),
            LlmProvider::OpenAi => body["choices"][0]["message"]["content"].as_str(),
            LlmProvider::Anthropic => body["content"][0]["text"].as_str(),
            LlmProvider::Custom => body["text"]
                .as_str()
                .or_else(|| body["content"].as_str())
                .or_else(|| body["response"].as_str()),
        }
        .ok_or_else(|| AppError::LlmService("LLM response does not contain any content".to_string()))?;

        let tokens = match self.provider {
            LlmProvider::Local => body["eval_count"].as_u64(),
            LlmProvider::OpenAi => body["usage"]["total_tokens"].as_u64(),
            LlmProvider::Anthropic => Some(
                body["usage"]["input_tokens"].as_u64().unwrap_or(0)
                    + body["usage"]["output_tokens"].as_u64().unwrap_or(0),
            ),
            LlmProvider::Custom => body["tokens_used"].as_u64(),
        }
        .unwrap_or(0);

        let model = body["model"].as_str().unwrap_or(&self.model).to_string();
        Ok((content.to_string(), model, tokens))
    }
}

#[async_trait]
impl LanguageModel for HttpLanguageModel {
    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: u32,
    ) -> Result<LlmResponse, AppError> {
        let start = Instant::now();
        let (url, body) = self.build_request(messages, temperature, max_tokens);

        let mut request = self.http_client.post(&url).json(&body);
        if let Some(api_key) = &self.api_key {
            request = match self.provider {
                LlmProvider::Anthropic => request
                    .header("x-api-key", api_key)
                    .header("anthropic-version", ANTHROPIC_VERSION),
                _ => request.header("Authorization", format!("Bearer {}", api_key)),
            };
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::LlmService(format!("Failed to call LLM service: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AppError::LlmService(format!(
                "LLM service returned error {}: {}",
                status, error_text
            )));
        }

        let result: Value = response
            .json()
            .await
            .map_err(|e| AppError::LlmService(format!("Failed to parse LLM response: {}", e)))?;
        let (content, model, tokens_used) = self.parse_response(&result)?;

        Ok(LlmResponse {
            content,
            model,
            tokens_used,
            latency_ms: start.elapsed().as_secs_f64() * 1000.0,
            cached: false,
        })
    }
}

/// Cached, rate-limited and retried access to a language model
pub struct LlmGateway {
    model: Arc<dyn LanguageModel>,
    cache: Option<ResultCache<LlmResponse>>,
    rate_limiter: RateLimiter,
    retry_attempts: u32,
    temperature: f64,
    max_tokens: u32,
    backoff_base: Duration,
    tokens_used: AtomicU64,
}

impl LlmGateway {
    pub fn from_config(config: &LlmConfig) -> Result<Self, AppError> {
        let model = HttpLanguageModel::from_config(config)?;
        tracing::info!(
            "LLM gateway using provider {} with model {}",
            model.provider().as_str(),
            config.model
        );
        Ok(Self::with_model(Arc::new(model), config))
    }

    pub fn with_model(model: Arc<dyn LanguageModel>, config: &LlmConfig) -> Self {
        Self {
            model,
            cache: config
                .cache_enabled
                .then(|| ResultCache::new(1000, config.cache_ttl_seconds)),
            rate_limiter: RateLimiter::new(config.rate_limit_rpm),
            retry_attempts: config.retry_attempts.max(1),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            backoff_base: Duration::from_secs(1),
            tokens_used: AtomicU64::new(0),
        }
    }

    pub fn model_name(&self) -> &str {
        self.model.model()
    }

    /// Tokens consumed by uncached calls so far
    pub fn total_tokens(&self) -> u64 {
        self.tokens_used.load(Ordering::Relaxed)
    }

    pub fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.clear();
        }
    }

    /// Exponential delay before the retry following `attempt`, capped at one minute
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }

    pub async fn call(&self, prompt: &str, temperature: Option<f64>) -> Result<LlmResponse, AppError> {
        let temperature = temperature.unwrap_or(self.temperature);
        let key = ResultCache::<LlmResponse>::generate_key(&[
            prompt,
            self.model.model(),
            &temperature.to_string(),
        ]);

        if let Some(cache) = &self.cache {
            if let Some(mut hit) = cache.get(&key) {
                tracing::debug!("LLM cache hit");
                hit.cached = true;
                return Ok(hit);
            }
        }

        self.rate_limiter.acquire().await;

        let mut last_error = String::new();
        for attempt in 0..self.retry_attempts {
            match self.model.complete(prompt, temperature, self.max_tokens).await {
                Ok(response) => {
                    self.tokens_used
                        .fetch_add(response.tokens_used, Ordering::Relaxed);
                    if let Some(cache) = &self.cache {
                        cache.put(key, response.clone(), None);
                    }
                    return Ok(response);
                }
                Err(e) => {
                    tracing::warn!("LLM call attempt {} failed: {}", attempt + 1, e);
                    last_error = e.to_string();
                    if attempt + 1 < self.retry_attempts {
                        tokio::time::sleep(self.backoff(attempt)).await;
                    }
                }
            }
        }

        Err(AppError::LlmRetriesExhausted {
            attempts: self.retry_attempts,
            message: last_error,
        })
    }

    /// Structured reading of a prompt
    pub async fn parse_query(
        &self,
        query: &str,
        schema: &SchemaSnapshot,
        context: Option<&str>,
    ) -> Result<LlmQueryParse, AppError> {
        let prompt = format!(
            r#"You are a database query parser. Parse the following natural language query into a structured format.

Database Schema:
{schema}

User Query: "{query}"

Previous Context:
{context}

Output a JSON object with the following structure:
{{
    "intent": "<retrieve|count|aggregate|compare|trend|group|filter|join|sort>",
    "entities": {{"collection": "<main collection name>", "fields": ["<field>"]}},
    "filters": [{{"field": "<name>", "operator": "<eq|ne|gt|lt|gte|lte|in|contains>", "value": "<value>"}}],
    "sort": {{"field": "<name>", "order": "<asc|desc>"}},
    "limit": <number or null>
}}

Respond with only the JSON object, no additional text."#,
            schema = format_schema(schema),
            query = query,
            context = context.unwrap_or("None"),
        );

        let response = self.call(&prompt, None).await?;
        let parsed = extract_json(&response.content).unwrap_or(Value::Null);
        Ok(query_parse_from_json(&parsed))
    }

    pub async fn explain_results(
        &self,
        query: &str,
        results: &[Value],
        count: usize,
    ) -> Result<String, AppError> {
        let sample = &results[..results.len().min(EXPLAIN_SAMPLE_ROWS)];
        let prompt = format!(
            r#"You are a data analyst. Explain the following query results in natural language.

Original Question: "{}"

Query Results:
{}

Row Count: {}

Provide a clear, concise explanation of what the data shows. If there are notable patterns or insights, mention them."#,
            query,
            serde_json::to_string_pretty(sample)?,
            count
        );
        let response = self.call(&prompt, Some(EXPLAIN_TEMPERATURE)).await?;
        Ok(response.content.trim().to_string())
    }

    pub async fn suggest_queries(
        &self,
        schema: &SchemaSnapshot,
        context: Option<&str>,
    ) -> Result<Vec<String>, AppError> {
        let prompt = format!(
            r#"Based on the following database schema, suggest 5 useful queries a user might want to run.

Schema:
{}

Previous Context: {}

Output a JSON array of query strings, e.g., ["query 1", "query 2", ...]"#,
            format_schema(schema),
            context.unwrap_or("None")
        );
        let response = self.call(&prompt, None).await?;
        Ok(match extract_json(&response.content) {
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        })
    }

    /// A corrected query, or `None` when the model gives up
    pub async fn fix_query_error(
        &self,
        query: &str,
        error: &str,
        schema: &SchemaSnapshot,
    ) -> Result<Option<String>, AppError> {
        let prompt = format!(
            r#"The following query failed with an error. Suggest a corrected version.

Original Query: "{}"
Error: {}

Schema:
{}

Output only the corrected query, or "{}" if the query cannot be fixed."#,
            query,
            error,
            format_schema(schema),
            UNABLE_TO_FIX
        );
        let response = self.call(&prompt, None).await?;
        let fixed = response.content.trim();
        Ok((!fixed.is_empty() && fixed != UNABLE_TO_FIX).then(|| fixed.to_string()))
    }
}

pub fn format_schema(schema: &SchemaSnapshot) -> String {
    let mut lines = Vec::new();
    for collection in &schema.collections {
        lines.push(format!("Collection: {}", collection));
        for field in schema.fields_of(collection) {
            lines.push(format!("  - {}", field));
        }
    }
    if !schema.indexes.is_empty() {
        lines.push(String::new());
        lines.push("Indexes:".to_string());
        for (name, index) in &schema.indexes {
            lines.push(format!(
                "  - {}: {} ({})",
                name,
                index.collection.as_deref().unwrap_or("*"),
                index.fields.join(", ")
            ));
        }
    }
    if lines.is_empty() {
        "No schema available".to_string()
    } else {
        lines.join("\n")
    }
}

/// JSON from a response that may wrap it in a code fence or prose
pub fn extract_json(content: &str) -> Option<Value> {
    let mut text = content.trim();
    if text.starts_with("```") {
        text = text
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();
    }
    if let Ok(value) = serde_json::from_str(text) {
        return Some(value);
    }
    EMBEDDED_JSON
        .as_ref()
        .and_then(|re| re.captures(text))
        .and_then(|caps| caps.get(1))
        .and_then(|m| serde_json::from_str(m.as_str()).ok())
}

fn operator(raw: &str) -> Option<ComparisonOp> {
    match raw.trim().to_lowercase().as_str() {
        "gte" => Some(ComparisonOp::Ge),
        "lte" => Some(ComparisonOp::Le),
        other => ComparisonOp::from_str(other).ok(),
    }
}

fn query_parse_from_json(parsed: &Value) -> LlmQueryParse {
    let collection = parsed["entities"]["collection"]
        .as_str()
        .or_else(|| parsed["collection"].as_str())
        .filter(|c| !c.is_empty())
        .map(str::to_string);

    let filters = parsed["filters"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let field = item["field"].as_str()?;
                    let op = operator(item["operator"].as_str().or_else(|| item["op"].as_str())?)?;
                    Some(Condition::new(field, op, item["value"].clone()))
                })
                .collect()
        })
        .unwrap_or_default();

    let sort = parsed["sort"]["field"].as_str().map(|field| SortKey {
        field: field.to_string(),
        order: match parsed["sort"]["order"].as_str().map(str::to_lowercase).as_deref() {
            Some("asc") => SortOrder::Asc,
            _ => SortOrder::Desc,
        },
    });

    LlmQueryParse {
        intent: parsed["intent"].as_str().map(str::to_string),
        collection,
        filters,
        limit: parsed["limit"].as_u64().map(|l| l as usize),
        sort,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedModel {
        replies: Mutex<VecDeque<Result<String, AppError>>>,
        calls: AtomicU64,
    }

    impl ScriptedModel {
        fn new(replies: Vec<Result<String, AppError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicU64::new(0),
            })
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        fn model(&self) -> &str {
            "scripted"
        }

        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _temperature: f64,
            _max_tokens: u32,
        ) -> Result<LlmResponse, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(AppError::LlmService("no reply scripted".into())));
            next.map(|content| LlmResponse {
                content,
                model: "scripted".into(),
                tokens_used: 7,
                latency_ms: 1.0,
                cached: false,
            })
        }
    }

    fn gateway(model: Arc<ScriptedModel>) -> LlmGateway {
        LlmGateway::with_model(model, &LlmConfig::default())
    }

    #[tokio::test]
    async fn test_second_call_is_served_from_cache() {
        let model = ScriptedModel::new(vec![Ok("hello".into())]);
        let gateway = gateway(model.clone());

        let first = gateway.call("hi", None).await.unwrap();
        assert!(!first.cached);
        let second = gateway.call("hi", None).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.content, "hello");
        assert_eq!(model.calls(), 1);
        assert_eq!(gateway.total_tokens(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let model = ScriptedModel::new(vec![
            Err(AppError::LlmService("503".into())),
            Ok("ok".into()),
        ]);
        let gateway = gateway(model.clone());
        let response = gateway.call("q", None).await.unwrap();
        assert_eq!(response.content, "ok");
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_are_fatal() {
        let model = ScriptedModel::new(vec![]);
        let gateway = gateway(model.clone());
        let started = tokio::time::Instant::now();

        let err = gateway.call("q", None).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, AppError::LlmRetriesExhausted { attempts: 3, .. }));
        assert_eq!(model.calls(), 3);
        // 1s + 2s of backoff between the three attempts
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[test]
    fn test_backoff_is_capped() {
        let gateway = gateway(ScriptedModel::new(vec![]));
        assert_eq!(gateway.backoff(0), Duration::from_secs(1));
        assert_eq!(gateway.backoff(3), Duration::from_secs(8));
        assert_eq!(gateway.backoff(6), MAX_BACKOFF);
        assert_eq!(gateway.backoff(40), MAX_BACKOFF);
        assert_eq!(gateway.backoff(u32::MAX), MAX_BACKOFF);
    }

    #[test]
    fn test_extract_json_variants() {
        assert_eq!(extract_json("{\"a\": 1}"), Some(json!({"a": 1})));
        assert_eq!(
            extract_json("```json\n{\"a\": 2}\n```"),
            Some(json!({"a": 2}))
        );
        assert_eq!(
            extract_json("Sure! Here you go: [\"x\", \"y\"] hope it helps"),
            Some(json!(["x", "y"]))
        );
        assert_eq!(extract_json("no json here"), None);
    }

    #[tokio::test]
    async fn test_parse_query_maps_hints() {
        let reply = r#"```json
{"intent": "filter", "entities": {"collection": "users"},
 "filters": [{"field": "age", "operator": "gte", "value": 21},
             {"field": "x", "operator": "bogus", "value": 1}],
 "sort": {"field": "age", "order": "asc"}, "limit": 5}
```"#;
        let gateway = gateway(ScriptedModel::new(vec![Ok(reply.into())]));
        let schema = SchemaSnapshot::new().with_collection("users", &["age"]);
        let parsed = gateway.parse_query("adults", &schema, None).await.unwrap();

        assert_eq!(parsed.intent.as_deref(), Some("filter"));
        assert_eq!(parsed.collection.as_deref(), Some("users"));
        assert_eq!(parsed.filters, vec![Condition::new("age", ComparisonOp::Ge, json!(21))]);
        assert_eq!(parsed.sort.map(|s| s.order), Some(SortOrder::Asc));
        assert_eq!(parsed.limit, Some(5));
    }

    #[tokio::test]
    async fn test_helper_operations() {
        let gateway = gateway(ScriptedModel::new(vec![
            Ok("[\"count users\", \"top 5 orders\"]".into()),
            Ok(UNABLE_TO_FIX.into()),
            Ok("  Two users are adults.  ".into()),
        ]));
        let schema = SchemaSnapshot::new();

        let suggestions = gateway.suggest_queries(&schema, None).await.unwrap();
        assert_eq!(suggestions, vec!["count users", "top 5 orders"]);
        assert!(gateway
            .fix_query_error("cont users", "unknown", &schema)
            .await
            .unwrap()
            .is_none());
        let narration = gateway
            .explain_results("adults?", &[json!({"n": 2})], 1)
            .await
            .unwrap();
        assert_eq!(narration, "Two users are adults.");
    }

    #[test]
    fn test_provider_wire_formats() {
        let mut config = LlmConfig::default();
        config.provider = LlmProvider::Anthropic;
        config.gateway_url = "https://api.example.com/".into();
        let client = HttpLanguageModel::from_config(&config).unwrap();

        let (url, body) = client.build_request(
            &[ChatMessage::system("be terse"), ChatMessage::user("hi")],
            0.1,
            64,
        );
        assert_eq!(url, "https://api.example.com/v1/messages");
        assert_eq!(body["system"], "be terse");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);

        let (content, _, tokens) = client
            .parse_response(&json!({
                "content": [{"text": "hello"}],
                "usage": {"input_tokens": 3, "output_tokens": 4}
            }))
            .unwrap();
        assert_eq!(content, "hello");
        assert_eq!(tokens, 7);

        config.provider = LlmProvider::Local;
        let local = HttpLanguageModel::from_config(&config).unwrap();
        let (url, _) = local.build_request(&[ChatMessage::user("hi")], 0.1, 64);
        assert!(url.ends_with("/api/chat"));
        assert!(local.parse_response(&json!({"unexpected": true})).is_err());
    }

    #[test]
    fn test_format_schema() {
        assert_eq!(format_schema(&SchemaSnapshot::new()), "No schema available");
        let schema = SchemaSnapshot::new()
            .with_collection("users", &["id"])
            .with_index("idx_id", "users", &["id"]);
        let text = format_schema(&schema);
        assert!(text.contains("Collection: users\n  - id"));
        assert!(text.contains("idx_id: users (id)"));
    }
}
