// Query Executor Service
//
// Interprets plan steps in order against an in-memory working relation.
// Each run is tracked as PENDING -> RUNNING -> COMPLETED | FAILED | CANCELLED
// and raced against the context deadline.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use serde_json::{Number, Value};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{
    AggregateFunction, AggregateSpec, ComparisonOp, Condition, ExecutionContext,
    ExecutionMetadata, ExecutionResult, ExecutionStatus, JoinOn, JoinType, QueryPlan, Record,
    SortKey, SortOrder, StepKind, TimeWindow, TransformOp,
};
use crate::services::backend::DataBackend;

/// Working relation threaded through the steps
#[derive(Debug, Clone, PartialEq)]
pub enum Relation {
    Rows(Vec<Record>),
    Grouped(Vec<Group>),
    Scalar(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub key: Vec<(String, Value)>,
    pub rows: Vec<Record>,
}

impl Group {
    fn base_record(&self) -> Record {
        self.key.iter().cloned().collect()
    }
}

impl Relation {
    /// Groups without aggregates become one row per group carrying `count_all`
    fn into_rows(self) -> Result<Vec<Record>, Value> {
        match self {
            Relation::Rows(rows) => Ok(rows),
            Relation::Grouped(groups) => Ok(groups
                .into_iter()
                .map(|group| {
                    let mut record = group.base_record();
                    record.insert("count_all".to_string(), Value::from(group.rows.len()));
                    record
                })
                .collect()),
            Relation::Scalar(value) => Err(value),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionInfo {
    pub execution_id: String,
    pub query: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
}

struct ExecutionHandle {
    info: ExecutionInfo,
    cancelled: Arc<AtomicBool>,
}

enum RunError {
    Cancelled,
    Failed(AppError),
}

impl From<AppError> for RunError {
    fn from(err: AppError) -> Self {
        RunError::Failed(err)
    }
}

#[derive(Default)]
struct RunState {
    steps_executed: usize,
    rows_scanned: usize,
    indexes_used: Vec<String>,
    warnings: Vec<String>,
}

pub struct QueryExecutor {
    backend: Option<Arc<dyn DataBackend>>,
    executions: Arc<RwLock<HashMap<String, ExecutionHandle>>>,
}

impl QueryExecutor {
    pub fn new(backend: Option<Arc<dyn DataBackend>>) -> Self {
        Self {
            backend,
            executions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn execute(&self, context: ExecutionContext) -> ExecutionResult {
        let execution_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let cancelled = Arc::new(AtomicBool::new(false));

        {
            let mut executions = self.executions.write().await;
            executions.insert(
                execution_id.clone(),
                ExecutionHandle {
                    info: ExecutionInfo {
                        execution_id: execution_id.clone(),
                        query: context.plan.query.clone(),
                        status: ExecutionStatus::Pending,
                        started_at: Utc::now(),
                    },
                    cancelled: cancelled.clone(),
                },
            );
        }

        if !self.transition(&execution_id, ExecutionStatus::Running).await {
            self.executions.write().await.remove(&execution_id);
            let metadata = ExecutionMetadata {
                execution_id,
                ..Default::default()
            };
            return ExecutionResult::failed(
                ExecutionStatus::Cancelled,
                "Execution cancelled before start",
                elapsed_ms(started),
                metadata,
            );
        }

        tracing::debug!(
            "Executing plan with {} steps (execution {})",
            context.plan.steps.len(),
            execution_id
        );

        let mut state = RunState::default();
        let deadline = Duration::from_millis(context.timeout_ms);
        let outcome =
            tokio::time::timeout(deadline, self.run(&context.plan, &cancelled, &mut state)).await;

        let mut metadata = ExecutionMetadata {
            execution_id: execution_id.clone(),
            steps_executed: state.steps_executed,
            rows_scanned: state.rows_scanned,
            truncated: false,
            total_rows: None,
            indexes_used: state.indexes_used.clone(),
        };

        let outcome = match outcome {
            // a cancel that lands after the last step still wins
            Ok(Ok(relation)) => {
                if self.transition(&execution_id, ExecutionStatus::Completed).await {
                    Ok(Ok(relation))
                } else {
                    Ok(Err(RunError::Cancelled))
                }
            }
            other => other,
        };

        let result = match outcome {
            Ok(Ok(relation)) => {
                let (data, row_count, total, truncated) =
                    finalize(relation, context.max_rows, &mut state.warnings);
                metadata.total_rows = Some(total);
                metadata.truncated = truncated;
                if !context.include_metadata {
                    metadata = ExecutionMetadata {
                        execution_id: execution_id.clone(),
                        ..Default::default()
                    };
                }
                ExecutionResult {
                    success: true,
                    data,
                    row_count,
                    execution_time_ms: elapsed_ms(started),
                    status: ExecutionStatus::Completed,
                    error: None,
                    warnings: state.warnings,
                    metadata,
                }
            }
            Ok(Err(RunError::Cancelled)) => {
                tracing::info!("Execution {} cancelled", execution_id);
                ExecutionResult::failed(
                    ExecutionStatus::Cancelled,
                    "Execution cancelled",
                    elapsed_ms(started),
                    metadata,
                )
            }
            Ok(Err(RunError::Failed(err))) => {
                tracing::warn!("Execution {} failed: {}", execution_id, err);
                self.transition(&execution_id, ExecutionStatus::Failed).await;
                ExecutionResult::failed(
                    ExecutionStatus::Failed,
                    err.to_string(),
                    elapsed_ms(started),
                    metadata,
                )
            }
            Err(_) => {
                tracing::warn!(
                    "Execution {} timed out after {} ms",
                    execution_id,
                    context.timeout_ms
                );
                self.transition(&execution_id, ExecutionStatus::Failed).await;
                ExecutionResult::failed(
                    ExecutionStatus::Failed,
                    format!(
                        "Query execution timeout: plan did not complete within {} ms",
                        context.timeout_ms
                    ),
                    elapsed_ms(started),
                    metadata,
                )
            }
        };

        self.executions.write().await.remove(&execution_id);
        result
    }

    /// Runs the plan and re-chunks the completed rows into batches
    pub async fn stream_execute(
        &self,
        context: ExecutionContext,
        batch_size: usize,
    ) -> BoxStream<'static, Result<Vec<Value>, AppError>> {
        let result = self.execute(context).await;
        if let Some(err) = result.to_error() {
            return stream::iter(vec![Err(err)]).boxed();
        }

        let items = match result.data {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        };
        let batch_size = batch_size.max(1);
        let batches: Vec<Result<Vec<Value>, AppError>> = items
            .chunks(batch_size)
            .map(|chunk| Ok(chunk.to_vec()))
            .collect();
        stream::iter(batches).boxed()
    }

    pub async fn cancel(&self, execution_id: &str) -> bool {
        let mut executions = self.executions.write().await;
        match executions.get_mut(execution_id) {
            Some(handle) if handle.info.status.can_transition_to(ExecutionStatus::Cancelled) => {
                handle.info.status = ExecutionStatus::Cancelled;
                handle.cancelled.store(true, AtomicOrdering::SeqCst);
                true
            }
            _ => false,
        }
    }

    pub async fn active_executions(&self) -> Vec<ExecutionInfo> {
        let executions = self.executions.read().await;
        let mut active: Vec<ExecutionInfo> = executions
            .values()
            .filter(|h| !h.info.status.is_terminal())
            .map(|h| h.info.clone())
            .collect();
        active.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        active
    }

    async fn transition(&self, execution_id: &str, next: ExecutionStatus) -> bool {
        let mut executions = self.executions.write().await;
        match executions.get_mut(execution_id) {
            Some(handle) if handle.info.status.can_transition_to(next) => {
                handle.info.status = next;
                true
            }
            _ => false,
        }
    }

    async fn run(
        &self,
        plan: &QueryPlan,
        cancelled: &AtomicBool,
        state: &mut RunState,
    ) -> Result<Relation, RunError> {
        let mut relation = Relation::Rows(Vec::new());

        for (position, step) in plan.steps.iter().enumerate() {
            if cancelled.load(AtomicOrdering::SeqCst) {
                return Err(RunError::Cancelled);
            }

            relation = match &step.kind {
                StepKind::Fetch { collection, fields } => {
                    let indexed = match plan.steps.get(position + 1).map(|s| &s.kind) {
                        Some(StepKind::Filter {
                            conditions,
                            index: Some(index),
                            ..
                        }) => Some((index.as_str(), conditions.as_slice())),
                        _ => None,
                    };
                    let rows = self.fetch(collection, indexed, state).await?;
                    Relation::Rows(project(rows, fields))
                }
                StepKind::Join {
                    collection,
                    join_type,
                    on,
                } => match relation.into_rows() {
                    Ok(left) => {
                        let right = self.fetch(collection, None, state).await?;
                        Relation::Rows(hash_join(left, &right, collection, on, *join_type))
                    }
                    Err(scalar) => passthrough(scalar, "JOIN", state),
                },
                StepKind::Subquery {
                    collection, on, ..
                } => match relation.into_rows() {
                    Ok(left) => {
                        let inner = self.fetch(collection, None, state).await?;
                        Relation::Rows(semi_join(left, &inner, on))
                    }
                    Err(scalar) => passthrough(scalar, "SUBQUERY", state),
                },
                other => apply_step(other, relation, state),
            };

            state.steps_executed += 1;
            tracing::debug!("Step {} ({}) done", step.id, step.step_type().as_str());
            // Let the deadline fire between steps
            tokio::task::yield_now().await;
        }
        Ok(relation)
    }

    async fn fetch(
        &self,
        collection: &str,
        indexed: Option<(&str, &[Condition])>,
        state: &mut RunState,
    ) -> Result<Vec<Record>, AppError> {
        let Some(backend) = &self.backend else {
            state
                .warnings
                .push(format!("No backend attached; {} yielded no rows", collection));
            return Ok(Vec::new());
        };
        let rows = match indexed {
            Some((index, conditions)) => {
                if !state.indexes_used.iter().any(|i| i == index) {
                    state.indexes_used.push(index.to_string());
                }
                backend.index_scan(collection, index, conditions).await?
            }
            None => backend.scan(collection).await?,
        };
        state.rows_scanned += rows.len();
        Ok(rows)
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

fn passthrough(value: Value, step: &str, state: &mut RunState) -> Relation {
    tracing::warn!("{} step skipped on scalar input", step);
    state
        .warnings
        .push(format!("{} step ignored: input is a scalar", step));
    Relation::Scalar(value)
}

/// Applies a step that needs no backend access
fn apply_step(kind: &StepKind, relation: Relation, state: &mut RunState) -> Relation {
    match kind {
        StepKind::Aggregate {
            group_by,
            aggregates,
            ..
        } => aggregate_step(relation, group_by, aggregates, state),
        StepKind::Compute { expression, .. } => {
            tracing::warn!("COMPUTE step not evaluated: {}", expression);
            state
                .warnings
                .push(format!("COMPUTE step not evaluated: {}", expression));
            relation
        }
        StepKind::Compare { fields } => {
            state
                .warnings
                .push(format!("COMPARE step not evaluated for {:?}", fields));
            relation
        }
        row_step => {
            let rows = match relation.into_rows() {
                Ok(rows) => rows,
                Err(scalar) => return passthrough(scalar, row_step.step_type().as_str(), state),
            };
            Relation::Rows(match row_step {
                StepKind::Filter {
                    conditions, time, ..
                } => filter_rows(rows, conditions, time.as_ref()),
                StepKind::Sort { keys } => sort_rows(rows, keys),
                StepKind::Limit { limit, offset } => {
                    rows.into_iter().skip(*offset).take(*limit).collect()
                }
                StepKind::Transform {
                    op: TransformOp::Project { fields },
                } => project(rows, fields),
                StepKind::Transform {
                    op: TransformOp::Distinct { fields },
                } => distinct(rows, fields),
                _ => rows,
            })
        }
    }
}

fn aggregate_step(
    relation: Relation,
    group_by: &[String],
    aggregates: &[AggregateSpec],
    state: &mut RunState,
) -> Relation {
    let grouped = match relation {
        Relation::Scalar(value) => return passthrough(value, "AGGREGATE", state),
        Relation::Rows(rows) if !group_by.is_empty() => group_rows(rows, group_by),
        other => other,
    };

    match grouped {
        Relation::Grouped(groups) if aggregates.is_empty() => Relation::Grouped(groups),
        Relation::Grouped(groups) => Relation::Rows(
            groups
                .into_iter()
                .map(|group| {
                    let mut record = group.base_record();
                    for spec in aggregates {
                        record.insert(
                            spec.alias.clone(),
                            aggregate(&group.rows, spec.function, spec.field.as_deref()),
                        );
                    }
                    record
                })
                .collect(),
        ),
        Relation::Rows(rows) => match aggregates {
            [] => Relation::Rows(rows),
            [single] => Relation::Scalar(aggregate(&rows, single.function, single.field.as_deref())),
            many => {
                let record: Record = many
                    .iter()
                    .map(|spec| {
                        (
                            spec.alias.clone(),
                            aggregate(&rows, spec.function, spec.field.as_deref()),
                        )
                    })
                    .collect();
                Relation::Rows(vec![record])
            }
        },
        Relation::Scalar(value) => Relation::Scalar(value),
    }
}

/// Wraps up the relation and applies the row cap.
/// Returns (data, row_count, total_rows, truncated).
fn finalize(
    relation: Relation,
    max_rows: usize,
    warnings: &mut Vec<String>,
) -> (Value, usize, usize, bool) {
    match relation.into_rows() {
        Ok(mut rows) => {
            let total = rows.len();
            let truncated = total > max_rows;
            if truncated {
                rows.truncate(max_rows);
                warnings.push(format!("Result truncated to {} of {} rows", max_rows, total));
            }
            let count = rows.len();
            (
                Value::Array(rows.into_iter().map(Value::Object).collect()),
                count,
                total,
                truncated,
            )
        }
        Err(scalar) => (scalar, 1, 1, false),
    }
}

fn lookup<'a>(record: &'a Record, field: &str) -> &'a Value {
    record.get(field).unwrap_or(&Value::Null)
}

/// Case-insensitive for strings, numeric for numbers, false across types
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
        (Value::String(x), Value::String(y)) => x.to_lowercase() == y.to_lowercase(),
        (Value::Null, _) | (_, Value::Null) => false,
        _ => a == b,
    }
}

/// Ordering within one type class; `None` across classes or for nulls
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => match (parse_timestamp(a), parse_timestamp(b)) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => Some(x.cmp(y)),
        },
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                    .ok()
                    .map(|dt| dt.and_utc())
            })
            .or_else(|| {
                NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|dt| dt.and_utc())
            }),
        Value::Number(n) => n.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)),
        _ => None,
    }
}

fn string_test(value: &Value, needle: &Value, test: fn(&str, &str) -> bool) -> bool {
    match (value, needle) {
        (Value::String(hay), Value::String(needle)) => {
            test(&hay.to_lowercase(), &needle.to_lowercase())
        }
        _ => false,
    }
}

/// Evaluates one condition against a record; type mismatches evaluate to false
pub fn evaluate_condition(record: &Record, condition: &Condition) -> bool {
    let value = lookup(record, &condition.field);
    let target = &condition.value;
    let ordered = |accept: fn(Ordering) -> bool| compare_values(value, target).map(accept).unwrap_or(false);

    match condition.op {
        ComparisonOp::IsNull => value.is_null(),
        ComparisonOp::IsNotNull => !value.is_null(),
        ComparisonOp::Eq => values_equal(value, target),
        ComparisonOp::Ne => !value.is_null() && !target.is_null() && !values_equal(value, target),
        ComparisonOp::Lt => ordered(|o| o == Ordering::Less),
        ComparisonOp::Le => ordered(|o| o != Ordering::Greater),
        ComparisonOp::Gt => ordered(|o| o == Ordering::Greater),
        ComparisonOp::Ge => ordered(|o| o != Ordering::Less),
        ComparisonOp::In | ComparisonOp::NotIn => {
            let found = match target {
                Value::Array(options) => options.iter().any(|o| values_equal(value, o)),
                single => values_equal(value, single),
            };
            if condition.op == ComparisonOp::In {
                found
            } else {
                !value.is_null() && !found
            }
        }
        ComparisonOp::Contains => match value {
            Value::Array(items) => items.iter().any(|item| values_equal(item, target)),
            _ => string_test(value, target, |h, n| h.contains(n)),
        },
        ComparisonOp::StartsWith => string_test(value, target, |h, n| h.starts_with(n)),
        ComparisonOp::EndsWith => string_test(value, target, |h, n| h.ends_with(n)),
        ComparisonOp::Between => match target.as_array().map(|b| b.as_slice()) {
            Some([low, high]) => {
                matches!(compare_values(value, low), Some(Ordering::Greater | Ordering::Equal))
                    && matches!(compare_values(value, high), Some(Ordering::Less | Ordering::Equal))
            }
            _ => false,
        },
    }
}

fn in_window(record: &Record, window: &TimeWindow, now: DateTime<Utc>) -> bool {
    let Some((from, to)) = window.constraint.resolve(now) else {
        return false;
    };
    parse_timestamp(lookup(record, &window.field))
        .map(|ts| ts >= from && ts <= to)
        .unwrap_or(false)
}

pub fn filter_rows(
    rows: Vec<Record>,
    conditions: &[Condition],
    time: Option<&TimeWindow>,
) -> Vec<Record> {
    let now = Utc::now();
    rows.into_iter()
        .filter(|record| conditions.iter().all(|c| evaluate_condition(record, c)))
        .filter(|record| time.map(|w| in_window(record, w, now)).unwrap_or(true))
        .collect()
}

pub fn project(rows: Vec<Record>, fields: &[String]) -> Vec<Record> {
    if fields.is_empty() || fields.iter().any(|f| f == "*") {
        return rows;
    }
    rows.into_iter()
        .map(|record| {
            fields
                .iter()
                .map(|f| (f.clone(), lookup(&record, f).clone()))
                .collect()
        })
        .collect()
}

/// Stable multi-key sort; nulls go last in either direction
pub fn sort_rows(mut rows: Vec<Record>, keys: &[SortKey]) -> Vec<Record> {
    rows.sort_by(|a, b| {
        for key in keys {
            let (x, y) = (lookup(a, &key.field), lookup(b, &key.field));
            let ordering = match (x.is_null(), y.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => {
                    let natural = compare_values(x, y).unwrap_or(Ordering::Equal);
                    match key.order {
                        SortOrder::Asc => natural,
                        SortOrder::Desc => natural.reverse(),
                    }
                }
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
    rows
}

fn tuple_key(record: &Record, fields: &[String]) -> String {
    let values: Vec<&Value> = fields.iter().map(|f| lookup(record, f)).collect();
    serde_json::to_string(&values).unwrap_or_default()
}

/// Hash grouping by field tuple, groups in first-seen order
pub fn group_rows(rows: Vec<Record>, fields: &[String]) -> Relation {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<Group> = Vec::new();
    for record in rows {
        let key = tuple_key(&record, fields);
        let index = *positions.entry(key).or_insert_with(|| {
            groups.push(Group {
                key: fields
                    .iter()
                    .map(|f| (f.clone(), lookup(&record, f).clone()))
                    .collect(),
                rows: Vec::new(),
            });
            groups.len() - 1
        });
        groups[index].rows.push(record);
    }
    Relation::Grouped(groups)
}

pub fn distinct(rows: Vec<Record>, fields: &[String]) -> Vec<Record> {
    let mut seen = HashSet::new();
    rows.into_iter()
        .filter(|record| {
            let key = if fields.is_empty() {
                serde_json::to_string(record).unwrap_or_default()
            } else {
                tuple_key(record, fields)
            };
            seen.insert(key)
        })
        .collect()
}

fn join_key(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => n.as_f64().map(|f| f.to_string()),
        other => Some(other.to_string()),
    }
}

/// Equality hash join; right fields that clash with left ones are prefixed
pub fn hash_join(
    left: Vec<Record>,
    right: &[Record],
    right_name: &str,
    on: &JoinOn,
    join_type: JoinType,
) -> Vec<Record> {
    let mut table: HashMap<String, Vec<&Record>> = HashMap::new();
    for record in right {
        if let Some(key) = join_key(lookup(record, &on.right)) {
            table.entry(key).or_default().push(record);
        }
    }

    let mut joined = Vec::new();
    for record in left {
        let matches = join_key(lookup(&record, &on.left)).and_then(|k| table.get(&k));
        match matches {
            Some(partners) => {
                for partner in partners {
                    let mut merged = record.clone();
                    for (field, value) in partner.iter() {
                        if merged.contains_key(field) {
                            merged.insert(format!("{}.{}", right_name, field), value.clone());
                        } else {
                            merged.insert(field.clone(), value.clone());
                        }
                    }
                    joined.push(merged);
                }
            }
            None if join_type == JoinType::Left => joined.push(record),
            None => {}
        }
    }
    joined
}

/// Keeps left rows with at least one partner on the right
pub fn semi_join(left: Vec<Record>, right: &[Record], on: &JoinOn) -> Vec<Record> {
    let keys: HashSet<String> = right
        .iter()
        .filter_map(|r| join_key(lookup(r, &on.right)))
        .collect();
    left.into_iter()
        .filter(|r| join_key(lookup(r, &on.left)).map(|k| keys.contains(&k)).unwrap_or(false))
        .collect()
}

fn numbers(rows: &[Record], field: &str) -> Vec<f64> {
    rows.iter()
        .filter_map(|r| lookup(r, field).as_f64())
        .collect()
}

fn float_value(value: f64) -> Value {
    Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}

/// Null-safe aggregate; `count` without a field counts rows
pub fn aggregate(rows: &[Record], function: AggregateFunction, field: Option<&str>) -> Value {
    let Some(field) = field else {
        return match function {
            AggregateFunction::Count => Value::from(rows.len()),
            _ => Value::Null,
        };
    };

    match function {
        AggregateFunction::Count => {
            Value::from(rows.iter().filter(|r| !lookup(r, field).is_null()).count())
        }
        AggregateFunction::Sum => {
            let all_integers = rows
                .iter()
                .map(|r| lookup(r, field))
                .filter(|v| v.is_number())
                .all(|v| v.is_i64());
            let exact = if all_integers {
                rows.iter()
                    .filter_map(|r| lookup(r, field).as_i64())
                    .try_fold(0i64, |acc, v| acc.checked_add(v))
            } else {
                None
            };
            match exact {
                Some(total) => Value::from(total),
                // Mixed types or i64 overflow
                None => float_value(numbers(rows, field).iter().sum()),
            }
        }
        AggregateFunction::Avg => {
            let values = numbers(rows, field);
            if values.is_empty() {
                Value::Null
            } else {
                float_value(values.iter().sum::<f64>() / values.len() as f64)
            }
        }
        AggregateFunction::Min | AggregateFunction::Max => {
            let wanted = if function == AggregateFunction::Min {
                Ordering::Less
            } else {
                Ordering::Greater
            };
            rows.iter()
                .map(|r| lookup(r, field))
                .filter(|v| !v.is_null())
                .fold(None::<&Value>, |best, v| match best {
                    Some(b) if compare_values(v, b) != Some(wanted) => Some(b),
                    _ => Some(v),
                })
                .cloned()
                .unwrap_or(Value::Null)
        }
        AggregateFunction::First => rows
            .iter()
            .map(|r| lookup(r, field))
            .find(|v| !v.is_null())
            .cloned()
            .unwrap_or(Value::Null),
        AggregateFunction::Last => rows
            .iter()
            .rev()
            .map(|r| lookup(r, field))
            .find(|v| !v.is_null())
            .cloned()
            .unwrap_or(Value::Null),
        AggregateFunction::Median => {
            let mut values = numbers(rows, field);
            if values.is_empty() {
                return Value::Null;
            }
            values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
            let mid = values.len() / 2;
            let median = if values.len() % 2 == 0 {
                (values[mid - 1] + values[mid]) / 2.0
            } else {
                values[mid]
            };
            float_value(median)
        }
    }
}

/// Builds an object record from JSON, for callers that hold plain values
pub fn record_from(value: Value) -> Option<Record> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{QueryStep, StepId, TimeConstraint};
    use crate::services::backend::InMemoryBackend;
    use async_trait::async_trait;
    use serde_json::json;

    fn rows(values: Value) -> Vec<Record> {
        values
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(record_from)
            .collect()
    }

    fn plan(kinds: Vec<StepKind>) -> QueryPlan {
        let mut plan = QueryPlan::new("test");
        for (i, kind) in kinds.into_iter().enumerate() {
            let mut step = QueryStep::new(StepId(i as u32 + 1), kind, "step");
            if i > 0 {
                step = step.depends_on(StepId(i as u32));
            }
            plan.steps.push(step);
        }
        plan.recompute_cost();
        plan
    }

    fn fetch(collection: &str) -> StepKind {
        StepKind::Fetch {
            collection: collection.into(),
            fields: vec!["*".into()],
        }
    }

    fn users_backend() -> Arc<dyn DataBackend> {
        Arc::new(
            InMemoryBackend::from_json(json!({
                "users": [
                    {"id": 1, "name": "Ann", "age": 34, "status": "active"},
                    {"id": 2, "name": "Bob", "age": 19, "status": "inactive"},
                    {"id": 3, "name": "Cy", "age": 27, "status": "Active"},
                    {"id": 4, "name": "Di", "age": null, "status": "active"}
                ],
                "orders": [
                    {"id": 10, "user_id": 1, "total": 20},
                    {"id": 11, "user_id": 1, "total": 5},
                    {"id": 12, "user_id": 3, "total": 7}
                ],
                "_indexes": {"idx_users_age": {"collection": "users", "fields": ["age"]}}
            }))
            .unwrap(),
        )
    }

    struct SlowBackend;

    #[async_trait]
    impl DataBackend for SlowBackend {
        async fn scan(&self, _collection: &str) -> Result<Vec<Record>, AppError> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(Vec::new())
        }
    }

    struct BrokenBackend;

    #[async_trait]
    impl DataBackend for BrokenBackend {
        async fn scan(&self, collection: &str) -> Result<Vec<Record>, AppError> {
            Err(AppError::Backend(format!("disk read failed for {}", collection)))
        }
    }

    #[test]
    fn test_condition_operators() {
        let record = record_from(json!({
            "age": 30, "name": "Alice", "tags": ["a", "b"], "deleted_at": null
        }))
        .unwrap();
        let check = |field: &str, op, value| evaluate_condition(&record, &Condition::new(field, op, value));

        assert!(check("age", ComparisonOp::Eq, json!(30.0)));
        assert!(check("age", ComparisonOp::Gt, json!(21)));
        assert!(!check("age", ComparisonOp::Lt, json!(21)));
        assert!(check("age", ComparisonOp::Between, json!([18, 30])));
        assert!(check("age", ComparisonOp::In, json!([1, 30])));
        assert!(check("age", ComparisonOp::NotIn, json!([1, 2])));
        assert!(check("name", ComparisonOp::Eq, json!("alice")));
        assert!(check("name", ComparisonOp::StartsWith, json!("Al")));
        assert!(check("name", ComparisonOp::EndsWith, json!("ice")));
        assert!(check("tags", ComparisonOp::Contains, json!("b")));
        assert!(check("deleted_at", ComparisonOp::IsNull, Value::Null));
        assert!(check("missing", ComparisonOp::IsNull, Value::Null));
        assert!(!check("name", ComparisonOp::Gt, json!(5)));
        assert!(!check("missing", ComparisonOp::Ne, json!(1)));
    }

    #[test]
    fn test_integer_sum_overflow_falls_back_to_float() {
        let data = rows(json!([{"v": i64::MAX}, {"v": i64::MAX - 1}, {"v": 2}]));
        let total = aggregate(&data, AggregateFunction::Sum, Some("v"));
        assert!(total.is_f64());
        let expected = 2.0 * i64::MAX as f64;
        assert!((total.as_f64().unwrap() - expected).abs() / expected < 1e-12);

        let near = rows(json!([{"v": i64::MAX - 5}, {"v": 5}]));
        assert_eq!(aggregate(&near, AggregateFunction::Sum, Some("v")), json!(i64::MAX));
    }

    #[test]
    fn test_aggregates_are_null_safe() {
        let data = rows(json!([{"v": 1}, {"v": null}, {"v": 4}, {"w": 9}]));
        assert_eq!(aggregate(&data, AggregateFunction::Count, None), json!(4));
        assert_eq!(aggregate(&data, AggregateFunction::Count, Some("v")), json!(2));
        assert_eq!(aggregate(&data, AggregateFunction::Sum, Some("v")), json!(5));
        assert_eq!(aggregate(&data, AggregateFunction::Avg, Some("v")), json!(2.5));
        assert_eq!(aggregate(&data, AggregateFunction::Min, Some("v")), json!(1));
        assert_eq!(aggregate(&data, AggregateFunction::Max, Some("v")), json!(4));
        assert_eq!(aggregate(&data, AggregateFunction::First, Some("v")), json!(1));
        assert_eq!(aggregate(&data, AggregateFunction::Last, Some("v")), json!(4));
        assert_eq!(aggregate(&data, AggregateFunction::Median, Some("v")), json!(2.5));
        assert_eq!(aggregate(&data, AggregateFunction::Avg, Some("nope")), Value::Null);

        // same input, same answer
        assert_eq!(
            aggregate(&data, AggregateFunction::Sum, Some("v")),
            aggregate(&data, AggregateFunction::Sum, Some("v"))
        );
    }

    #[test]
    fn test_sort_puts_nulls_last_both_ways() {
        let data = rows(json!([{"a": 2}, {"a": null}, {"a": 1}, {"a": 3}]));
        let key = |order| SortKey {
            field: "a".into(),
            order,
        };

        let asc = sort_rows(data.clone(), &[key(SortOrder::Asc)]);
        let asc: Vec<Value> = asc.iter().map(|r| r["a"].clone()).collect();
        assert_eq!(asc, vec![json!(1), json!(2), json!(3), Value::Null]);

        let desc = sort_rows(data, &[key(SortOrder::Desc)]);
        let desc: Vec<Value> = desc.iter().map(|r| r["a"].clone()).collect();
        assert_eq!(desc, vec![json!(3), json!(2), json!(1), Value::Null]);
    }

    #[test]
    fn test_join_semantics() {
        let users = rows(json!([{"id": 1, "name": "Ann"}, {"id": 2, "name": "Bob"}]));
        let orders = rows(json!([{"id": 10, "user_id": 1}]));
        let on = JoinOn {
            left: "id".into(),
            right: "user_id".into(),
        };

        let inner = hash_join(users.clone(), &orders, "orders", &on, JoinType::Inner);
        assert_eq!(inner.len(), 1);
        assert_eq!(inner[0]["orders.id"], json!(10));
        assert_eq!(inner[0]["id"], json!(1));

        let left = hash_join(users, &orders, "orders", &on, JoinType::Left);
        assert_eq!(left.len(), 2);
        assert!(left[1].get("user_id").is_none());
    }

    #[test]
    fn test_distinct_and_project() {
        let data = rows(json!([
            {"a": 1, "b": 1}, {"a": 1, "b": 2}, {"a": 1, "b": 1}
        ]));
        assert_eq!(distinct(data.clone(), &[]).len(), 2);
        assert_eq!(distinct(data.clone(), &["a".to_string()]).len(), 1);

        let projected = project(data.clone(), &["b".to_string()]);
        assert!(projected[0].get("a").is_none());
        assert_eq!(project(data, &["*".to_string()])[0].len(), 2);
    }

    #[test]
    fn test_time_window_filter() {
        let now = Utc::now();
        let recent = (now - chrono::Duration::days(2)).to_rfc3339();
        let old = (now - chrono::Duration::days(40)).to_rfc3339();
        let data = rows(json!([
            {"created_at": recent}, {"created_at": old}, {"created_at": "garbage"}
        ]));
        let window = TimeWindow {
            field: "created_at".into(),
            constraint: TimeConstraint::relative("now", "7d"),
        };
        assert_eq!(filter_rows(data, &[], Some(&window)).len(), 1);
    }

    #[tokio::test]
    async fn test_execute_count_with_filter() {
        let executor = QueryExecutor::new(Some(users_backend()));
        let plan = plan(vec![
            fetch("users"),
            StepKind::Filter {
                conditions: vec![Condition::new("age", ComparisonOp::Gt, json!(21))],
                time: None,
                index: None,
            },
            StepKind::Aggregate {
                group_by: vec![],
                aggregates: vec![AggregateSpec::new(AggregateFunction::Count, None)],
                partial: false,
            },
        ]);
        let result = executor.execute(ExecutionContext::new(plan)).await;

        assert!(result.success);
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.data, json!(2));
        assert_eq!(result.metadata.steps_executed, 3);
        assert_eq!(result.metadata.rows_scanned, 4);
        assert!(executor.active_executions().await.is_empty());
    }

    #[tokio::test]
    async fn test_execute_uses_marked_index() {
        let executor = QueryExecutor::new(Some(users_backend()));
        let plan = plan(vec![
            fetch("users"),
            StepKind::Filter {
                conditions: vec![Condition::new("age", ComparisonOp::Ge, json!(27))],
                time: None,
                index: Some("idx_users_age".into()),
            },
        ]);
        let result = executor.execute(ExecutionContext::new(plan)).await;
        assert_eq!(result.row_count, 2);
        assert_eq!(result.metadata.indexes_used, vec!["idx_users_age"]);
        assert_eq!(result.metadata.rows_scanned, 2);
    }

    #[tokio::test]
    async fn test_group_then_aggregate_and_sort() {
        let executor = QueryExecutor::new(Some(users_backend()));
        let plan = plan(vec![
            fetch("orders"),
            StepKind::Aggregate {
                group_by: vec!["user_id".into()],
                aggregates: vec![],
                partial: false,
            },
            StepKind::Aggregate {
                group_by: vec![],
                aggregates: vec![AggregateSpec::new(AggregateFunction::Sum, Some("total".into()))],
                partial: false,
            },
            StepKind::Sort {
                keys: vec![SortKey {
                    field: "sum_total".into(),
                    order: SortOrder::Desc,
                }],
            },
        ]);
        let result = executor.execute(ExecutionContext::new(plan)).await;
        assert_eq!(
            result.data,
            json!([{"user_id": 1, "sum_total": 25}, {"user_id": 3, "sum_total": 7}])
        );
    }

    #[tokio::test]
    async fn test_bare_group_finalizes_with_counts() {
        let executor = QueryExecutor::new(Some(users_backend()));
        let plan = plan(vec![
            fetch("orders"),
            StepKind::Aggregate {
                group_by: vec!["user_id".into()],
                aggregates: vec![],
                partial: false,
            },
        ]);
        let result = executor.execute(ExecutionContext::new(plan)).await;
        assert_eq!(
            result.data,
            json!([{"user_id": 1, "count_all": 2}, {"user_id": 3, "count_all": 1}])
        );
    }

    #[tokio::test]
    async fn test_join_and_semi_join_steps() {
        let executor = QueryExecutor::new(Some(users_backend()));
        let on = JoinOn {
            left: "id".into(),
            right: "user_id".into(),
        };
        let joined = executor
            .execute(ExecutionContext::new(plan(vec![
                fetch("users"),
                StepKind::Join {
                    collection: "orders".into(),
                    join_type: JoinType::Inner,
                    on: on.clone(),
                },
            ])))
            .await;
        assert_eq!(joined.row_count, 3);

        let semi = executor
            .execute(ExecutionContext::new(plan(vec![
                fetch("users"),
                StepKind::Subquery {
                    collection: "orders".into(),
                    correlation: crate::models::Correlation::Simple,
                    on,
                    flattened: true,
                },
            ])))
            .await;
        assert_eq!(semi.row_count, 2);
    }

    #[tokio::test]
    async fn test_row_cap_truncates() {
        let executor = QueryExecutor::new(Some(users_backend()));
        let context = ExecutionContext::new(plan(vec![fetch("users")])).with_max_rows(3);
        let result = executor.execute(context).await;
        assert_eq!(result.row_count, 3);
        assert!(result.metadata.truncated);
        assert_eq!(result.metadata.total_rows, Some(4));
        assert!(!result.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_scalar_passthrough_warns() {
        let executor = QueryExecutor::new(Some(users_backend()));
        let plan = plan(vec![
            fetch("users"),
            StepKind::Aggregate {
                group_by: vec![],
                aggregates: vec![AggregateSpec::new(AggregateFunction::Count, None)],
                partial: false,
            },
            StepKind::Limit {
                limit: 1,
                offset: 0,
            },
        ]);
        let result = executor.execute(ExecutionContext::new(plan)).await;
        assert_eq!(result.data, json!(4));
        assert!(result.warnings.iter().any(|w| w.contains("LIMIT")));
    }

    #[tokio::test]
    async fn test_missing_backend_yields_empty() {
        let executor = QueryExecutor::new(None);
        let result = executor
            .execute(ExecutionContext::new(plan(vec![fetch("users")])))
            .await;
        assert!(result.success);
        assert_eq!(result.data, json!([]));
        assert_eq!(result.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_backend_error_fails_execution() {
        let executor = QueryExecutor::new(Some(Arc::new(BrokenBackend)));
        let result = executor
            .execute(ExecutionContext::new(plan(vec![fetch("users")])))
            .await;
        assert!(!result.success);
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(result.error.unwrap().contains("disk read failed for users"));
    }

    #[tokio::test]
    async fn test_timeout_marks_failed() {
        let executor = QueryExecutor::new(Some(Arc::new(SlowBackend)));
        let context = ExecutionContext::new(plan(vec![fetch("users")])).with_timeout_ms(20);
        let result = executor.execute(context).await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(result.error.unwrap().contains("timeout"));
        assert!(executor.active_executions().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_running_execution() {
        let executor = Arc::new(QueryExecutor::new(Some(Arc::new(SlowBackend))));
        let runner = executor.clone();
        let handle = tokio::spawn(async move {
            runner
                .execute(ExecutionContext::new(plan(vec![fetch("a"), fetch("b")])))
                .await
        });

        let mut active = Vec::new();
        for _ in 0..50 {
            active = executor.active_executions().await;
            if !active.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(active.len(), 1);
        assert!(executor.cancel(&active[0].execution_id).await);
        assert!(!executor.cancel("unknown").await);

        let result = handle.await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert_eq!(result.metadata.steps_executed, 1);
    }

    #[tokio::test]
    async fn test_stream_execute_batches() {
        let executor = QueryExecutor::new(Some(users_backend()));
        let batches: Vec<_> = executor
            .stream_execute(ExecutionContext::new(plan(vec![fetch("users")])), 3)
            .await
            .collect()
            .await;
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].as_ref().unwrap().len(), 3);
        assert_eq!(batches[1].as_ref().unwrap().len(), 1);
    }
}
