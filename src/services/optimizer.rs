// Query Optimizer Service
//
// Cost-based rewriting of query plans plus advisory index recommendations.
// Rewrite passes run in a fixed order and each one reports whether it changed
// the plan. Observed execution times calibrate future estimates.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::models::{
    CostEstimate, Correlation, IndexRecommendation, IndexType, OptimizationResult, QueryPlan,
    SchemaSnapshot, StepId, StepKind, StepType, TransformOp,
};

const PAGE_SIZE: f64 = 8192.0;
const DEFAULT_ROWS: u64 = 1000;
const DEFAULT_WIDTH: u32 = 100;
const FILTER_SELECTIVITY: f64 = 0.1;
const GROUP_REDUCTION: u64 = 10;
const LEARNING_RATE: f64 = 0.3;
const HISTORY_LIMIT: usize = 10_000;
const HISTORY_KEEP: usize = 5_000;
const OPTIMIZER_CONFIDENCE: f64 = 0.85;

/// Hardware-aware cost constants
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CostModel {
    pub seq_page_cost: f64,
    pub random_page_cost: f64,
    pub cpu_tuple_cost: f64,
    pub cpu_index_cost: f64,
    pub cpu_operator_cost: f64,
    /// Bytes of memory available before a sort spills to disk
    pub effective_cache_size: f64,
}

impl CostModel {
    pub fn new(memory_gb: f64, ssd: bool) -> Self {
        let random_page_cost = 4.0;
        Self {
            seq_page_cost: 1.0,
            random_page_cost: if ssd {
                random_page_cost * 0.25
            } else {
                random_page_cost
            },
            cpu_tuple_cost: 0.01,
            cpu_index_cost: 0.005,
            cpu_operator_cost: 0.0025,
            effective_cache_size: memory_gb * 1024.0 * 1024.0 * 1024.0 * 0.75,
        }
    }

    pub fn scan_cost(&self, pages: u64, rows: u64) -> f64 {
        self.seq_page_cost * pages as f64 + self.cpu_tuple_cost * rows as f64
    }

    pub fn index_scan_cost(&self, index_pages: u64, data_pages: u64, rows: u64) -> f64 {
        self.random_page_cost * index_pages as f64
            + self.random_page_cost * data_pages as f64
            + self.cpu_index_cost * rows as f64
    }

    /// `n log n` comparisons, plus a read and a write per page when the sort spills
    pub fn sort_cost(&self, rows: u64, width: u32) -> f64 {
        let memory_needed = rows as f64 * width as f64;
        let mut cost = self.cpu_tuple_cost * rows as f64 * (rows.max(2) as f64).log2();
        if memory_needed > self.effective_cache_size {
            let pages = (memory_needed / PAGE_SIZE).floor();
            cost += self.seq_page_cost * pages * 2.0;
        }
        cost
    }

    /// Hash join: build over the right side, look up from the left
    pub fn join_cost(&self, left_rows: u64, right_rows: u64) -> f64 {
        self.cpu_tuple_cost * (left_rows + right_rows) as f64
            + self.cpu_operator_cost * left_rows as f64
    }
}

impl Default for CostModel {
    fn default() -> Self {
        Self::new(16.0, true)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSample {
    pub signature: String,
    pub estimated_cost: f64,
    pub actual_time_ms: f64,
    pub actual_rows: u64,
}

#[derive(Debug, Default)]
struct LearningState {
    learned_costs: HashMap<String, f64>,
    history: Vec<ExecutionSample>,
}

pub struct QueryOptimizer {
    cost_model: CostModel,
    learning: Mutex<LearningState>,
}

impl QueryOptimizer {
    pub fn new(cost_model: CostModel) -> Self {
        Self {
            cost_model,
            learning: Mutex::new(LearningState::default()),
        }
    }

    fn learning(&self) -> std::sync::MutexGuard<'_, LearningState> {
        self.learning
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn optimize(&self, plan: &QueryPlan, schema: &SchemaSnapshot) -> OptimizationResult {
        let original_cost = self.estimate_cost(plan, schema);
        let mut optimized = plan.clone();
        let mut applied = Vec::new();

        let passes: [(&str, fn(&mut QueryPlan, &SchemaSnapshot) -> bool); 6] = [
            ("predicate_pushdown", pushdown_predicates),
            ("join_reorder", reorder_joins),
            ("projection_pruning", prune_projections),
            ("index_selection", select_indexes),
            ("aggregation_optimization", mark_partial_aggregations),
            ("subquery_flattening", flatten_subqueries),
        ];
        for (name, pass) in passes {
            if pass(&mut optimized, schema) {
                applied.push(name.to_string());
            }
        }
        optimized.recompute_cost();
        optimized.can_parallelize = optimized.detect_parallelism();

        let optimized_cost = self.estimate_cost(&optimized, schema);
        let cost_reduction = (original_cost.total_cost - optimized_cost.total_cost)
            / original_cost.total_cost.max(0.001);
        let estimated_speedup = original_cost.total_cost / optimized_cost.total_cost.max(0.001);

        tracing::debug!(
            "Optimized plan {} -> {:.3} (applied: {:?})",
            original_cost.total_cost,
            optimized_cost.total_cost,
            applied
        );

        OptimizationResult {
            original_cost: original_cost.total_cost,
            optimized_plan: optimized,
            cost_reduction,
            optimizations_applied: applied,
            index_recommendations: self.recommend_indexes(plan, schema),
            estimated_speedup,
            confidence: OPTIMIZER_CONFIDENCE,
        }
    }

    /// Walks the plan tracking estimated cardinality and width
    pub fn estimate_cost(&self, plan: &QueryPlan, schema: &SchemaSnapshot) -> CostEstimate {
        let model = &self.cost_model;
        let collection_rows = |collection: &str| {
            schema
                .row_counts
                .get(collection)
                .copied()
                .or_else(|| schema.inferred.get(collection).map(|s| s.row_count))
                .filter(|rows| *rows > 0)
                .unwrap_or(DEFAULT_ROWS)
        };

        let mut rows = DEFAULT_ROWS;
        let mut width = DEFAULT_WIDTH;
        let mut total = 0.0;
        let mut startup = 0.0;

        for step in &plan.steps {
            let cost = match &step.kind {
                StepKind::Fetch { collection, fields } => {
                    rows = collection_rows(collection);
                    width = schema
                        .inferred
                        .get(collection)
                        .map(|s| s.estimated_width())
                        .unwrap_or(DEFAULT_WIDTH);
                    if !fields.iter().any(|f| f == "*") {
                        width = (fields.len() as u32 * 8).clamp(1, width.max(1));
                    }
                    model.scan_cost(pages(rows, width), rows)
                }
                StepKind::Filter {
                    conditions, index, ..
                } => {
                    let input = rows;
                    rows = ((input as f64 * FILTER_SELECTIVITY) as u64).max(1);
                    match index {
                        Some(_) => model.index_scan_cost(1, pages(rows, width), rows),
                        None => {
                            (model.cpu_tuple_cost
                                + model.cpu_operator_cost * conditions.len().max(1) as f64)
                                * input as f64
                        }
                    }
                }
                StepKind::Join { collection, .. } => {
                    let right = collection_rows(collection);
                    width = width.saturating_add(DEFAULT_WIDTH);
                    model.join_cost(rows, right)
                }
                StepKind::Aggregate {
                    group_by,
                    aggregates,
                    partial,
                } => {
                    let per_row = model.cpu_tuple_cost
                        + model.cpu_operator_cost * aggregates.len().max(1) as f64;
                    let factor = if *partial { 0.5 } else { 1.0 };
                    let cost = per_row * rows as f64 * factor;
                    rows = if group_by.is_empty() {
                        1
                    } else {
                        (rows / GROUP_REDUCTION).max(1)
                    };
                    startup = total + cost;
                    cost
                }
                StepKind::Sort { .. } => {
                    let cost = model.sort_cost(rows, width);
                    startup = total + cost;
                    cost
                }
                StepKind::Limit { limit, offset } => {
                    rows = rows.min(limit.saturating_add(*offset) as u64);
                    model.cpu_tuple_cost * rows as f64
                }
                StepKind::Transform { op } => {
                    if let TransformOp::Project { fields } = op {
                        width = (fields.len() as u32 * 8).max(1);
                    }
                    model.cpu_tuple_cost * rows as f64
                }
                StepKind::Compute { .. } | StepKind::Compare { .. } => {
                    model.cpu_operator_cost * rows as f64
                }
                StepKind::Subquery {
                    collection,
                    flattened,
                    ..
                } => {
                    let inner = collection_rows(collection);
                    if *flattened {
                        model.join_cost(rows, inner)
                    } else {
                        model.cpu_operator_cost * rows as f64 * inner as f64
                    }
                }
            };
            total += cost.max(0.0);
        }

        CostEstimate::new(startup, total, rows.max(1), width)
    }

    /// Advisory only, derived from the plan as written
    pub fn recommend_indexes(
        &self,
        plan: &QueryPlan,
        schema: &SchemaSnapshot,
    ) -> Vec<IndexRecommendation> {
        let collection = plan
            .primary_collection()
            .unwrap_or("unknown")
            .to_string();
        let mut filter_fields: Vec<(String, usize)> = Vec::new();
        let mut sort_fields: Vec<String> = Vec::new();
        let mut group_fields: Vec<String> = Vec::new();

        for step in &plan.steps {
            match &step.kind {
                StepKind::Filter { conditions, .. } => {
                    for condition in conditions {
                        match filter_fields.iter_mut().find(|(f, _)| *f == condition.field) {
                            Some((_, count)) => *count += 1,
                            None => filter_fields.push((condition.field.clone(), 1)),
                        }
                    }
                }
                StepKind::Sort { keys } => {
                    sort_fields.extend(keys.iter().map(|k| k.field.clone()));
                }
                StepKind::Aggregate { group_by, .. } => {
                    group_fields.extend(group_by.iter().cloned());
                }
                _ => {}
            }
        }

        let mut recommendations = Vec::new();
        for (field, count) in &filter_fields {
            if !schema.is_indexed(field) {
                recommendations.push(IndexRecommendation {
                    collection: collection.clone(),
                    fields: vec![field.clone()],
                    index_type: IndexType::Btree,
                    estimated_benefit: 0.5 * *count as f64,
                    reason: format!("Field '{}' used in filter conditions", field),
                });
            }
        }

        if !sort_fields.is_empty() && !filter_fields.is_empty() {
            let mut composite: Vec<String> = filter_fields
                .iter()
                .take(2)
                .map(|(f, _)| f.clone())
                .collect();
            if let Some(sort) = sort_fields.first() {
                if !composite.contains(sort) {
                    composite.push(sort.clone());
                }
            }
            if composite.len() > 1 {
                recommendations.push(IndexRecommendation {
                    collection: collection.clone(),
                    fields: composite,
                    index_type: IndexType::Composite,
                    estimated_benefit: 0.7,
                    reason: "Composite index for filter + sort optimization".to_string(),
                });
            }
        }

        if !group_fields.is_empty() {
            recommendations.push(IndexRecommendation {
                collection,
                fields: group_fields,
                index_type: IndexType::Btree,
                estimated_benefit: 0.6,
                reason: "Index for GROUP BY optimization".to_string(),
            });
        }
        recommendations
    }

    /// Folds an observed run into the learned cost for the plan's shape
    pub fn learn_from_execution(&self, plan: &QueryPlan, actual_time_ms: f64, actual_rows: u64) {
        let signature = plan.signature();
        let estimated_cost = self
            .estimate_cost(plan, &SchemaSnapshot::default())
            .total_cost;

        let mut learning = self.learning();
        learning
            .learned_costs
            .entry(signature.clone())
            .and_modify(|cost| {
                *cost = LEARNING_RATE * actual_time_ms + (1.0 - LEARNING_RATE) * *cost
            })
            .or_insert(actual_time_ms);

        learning.history.push(ExecutionSample {
            signature,
            estimated_cost,
            actual_time_ms,
            actual_rows,
        });
        if learning.history.len() > HISTORY_LIMIT {
            let excess = learning.history.len() - HISTORY_KEEP;
            learning.history.drain(..excess);
        }
    }

    /// Learned cost for plans with the same shape, if any were observed
    pub fn calibrated_cost(&self, plan: &QueryPlan) -> Option<f64> {
        self.learning()
            .learned_costs
            .get(&plan.signature())
            .copied()
    }

    pub fn history_len(&self) -> usize {
        self.learning().history.len()
    }
}

impl Default for QueryOptimizer {
    fn default() -> Self {
        Self::new(CostModel::default())
    }
}

fn pages(rows: u64, width: u32) -> u64 {
    ((rows as f64 * width as f64) / PAGE_SIZE).ceil().max(1.0) as u64
}

/// Reassigns ids in step order and relinks the chain
fn renumber(plan: &mut QueryPlan) {
    for (i, step) in plan.steps.iter_mut().enumerate() {
        step.id = StepId(i as u32 + 1);
    }
    plan.relink_linear();
}

/// Moves each filter up towards the nearest preceding scan. A filter only
/// crosses steps that keep row identity, and crosses a join only when every
/// field it reads belongs to the scanned collection.
fn pushdown_predicates(plan: &mut QueryPlan, schema: &SchemaSnapshot) -> bool {
    let primary_fields: HashSet<String> = plan
        .primary_collection()
        .map(|c| schema.fields_of(c).iter().cloned().collect())
        .unwrap_or_default();

    let mut moved = false;
    let mut i = 0;
    while i < plan.steps.len() {
        if plan.steps[i].step_type() != StepType::Filter {
            i += 1;
            continue;
        }
        let fields = plan.steps[i].kind.referenced_fields();
        let mut target = i;
        while target > 0 {
            let crossable = match plan.steps[target - 1].step_type() {
                StepType::Sort | StepType::Compute | StepType::Compare => true,
                StepType::Join => {
                    !primary_fields.is_empty() && fields.iter().all(|f| primary_fields.contains(f))
                }
                _ => false,
            };
            if !crossable {
                break;
            }
            target -= 1;
        }
        if target < i {
            let step = plan.steps.remove(i);
            plan.steps.insert(target, step);
            moved = true;
        }
        i += 1;
    }

    if moved {
        renumber(plan);
    }
    moved
}

/// Orders runs of consecutive joins by ascending right-side cardinality
fn reorder_joins(plan: &mut QueryPlan, schema: &SchemaSnapshot) -> bool {
    if plan.count_steps(StepType::Join) < 2 {
        return false;
    }

    let rows_of = |kind: &StepKind| match kind {
        StepKind::Join { collection, .. } => schema.row_counts.get(collection).copied().unwrap_or(u64::MAX),
        _ => u64::MAX,
    };

    let mut start = 0;
    while start < plan.steps.len() {
        if plan.steps[start].step_type() != StepType::Join {
            start += 1;
            continue;
        }
        let mut end = start;
        while end < plan.steps.len() && plan.steps[end].step_type() == StepType::Join {
            end += 1;
        }
        plan.steps[start..end].sort_by_key(|s| rows_of(&s.kind));
        start = end;
    }
    renumber(plan);
    true
}

/// Drops projected fields that no later step reads. The last projection
/// defines the output and is never pruned.
fn prune_projections(plan: &mut QueryPlan, _schema: &SchemaSnapshot) -> bool {
    let mut pruned = false;
    // None means every field is still needed downstream
    let mut required: Option<HashSet<String>> = None;

    for step in plan.steps.iter_mut().rev() {
        match &mut step.kind {
            StepKind::Transform {
                op: TransformOp::Project { fields },
            } => {
                if let Some(needed) = &required {
                    let before = fields.len();
                    fields.retain(|f| f == "*" || needed.contains(f));
                    pruned |= fields.len() < before;
                }
                if !fields.iter().any(|f| f == "*") {
                    required = Some(fields.iter().cloned().collect());
                }
            }
            StepKind::Fetch { fields, .. } => {
                if let Some(needed) = &required {
                    if !fields.iter().any(|f| f == "*") {
                        let before = fields.len();
                        fields.retain(|f| needed.contains(f));
                        pruned |= fields.len() < before;
                    }
                }
            }
            StepKind::Aggregate {
                group_by,
                aggregates,
                ..
            } if !group_by.is_empty() || !aggregates.is_empty() => {
                let mut needed: HashSet<String> = group_by.iter().cloned().collect();
                needed.extend(aggregates.iter().filter_map(|a| a.field.clone()));
                required = Some(needed);
            }
            other => {
                if let Some(needed) = &mut required {
                    needed.extend(other.referenced_fields());
                }
            }
        }
    }
    pruned
}

/// Marks filters whose leading condition field has an index
fn select_indexes(plan: &mut QueryPlan, schema: &SchemaSnapshot) -> bool {
    let collection = plan.primary_collection().map(str::to_string);
    let mut indexed = false;

    for step in &mut plan.steps {
        if let StepKind::Filter {
            conditions,
            time,
            index,
        } = &mut step.kind
        {
            if index.is_some() {
                continue;
            }
            let candidate = conditions
                .iter()
                .filter(|c| c.op.is_index_friendly())
                .map(|c| c.field.as_str())
                .chain(time.iter().map(|t| t.field.as_str()))
                .find_map(|field| schema.index_for(collection.as_deref(), field));
            if let Some(name) = candidate {
                *index = Some(name.to_string());
                indexed = true;
            }
        }
    }
    indexed
}

/// count/sum/min/max can be computed from partial results
fn mark_partial_aggregations(plan: &mut QueryPlan, _schema: &SchemaSnapshot) -> bool {
    let mut marked = false;
    for step in &mut plan.steps {
        if let StepKind::Aggregate {
            aggregates,
            partial,
            ..
        } = &mut step.kind
        {
            if !*partial
                && !aggregates.is_empty()
                && aggregates.iter().all(|a| a.function.is_decomposable())
            {
                *partial = true;
                marked = true;
            }
        }
    }
    marked
}

/// Simple correlated subqueries become semi-joins
fn flatten_subqueries(plan: &mut QueryPlan, _schema: &SchemaSnapshot) -> bool {
    let mut flattened = false;
    for step in &mut plan.steps {
        if let StepKind::Subquery {
            correlation: Correlation::Simple,
            flattened: done,
            ..
        } = &mut step.kind
        {
            if !*done {
                *done = true;
                flattened = true;
            }
        }
    }
    flattened
}
