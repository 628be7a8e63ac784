// Query Translator Service
//
// Renders an executable plan into one of the three textual surfaces:
// TQL (SQL-like), NQL (normalised natural language) and JQL (JSON query).

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};

use crate::error::AppError;
use crate::models::{
    AggregateFunction, AggregateSpec, ComparisonOp, Condition, Intent, JoinType, QueryLanguage,
    QueryPlan, SortKey, SortOrder, StepKind, TimeWindow, TransformOp,
};
use crate::validation::TqlValidator;

const RESERVED: &[&str] = &[
    "select", "from", "where", "group", "order", "by", "limit", "offset", "join", "on", "and",
    "or", "not", "in", "is", "null", "table", "user", "having", "as", "distinct", "between",
    "like", "case", "when", "end", "union", "all", "desc", "asc", "count", "key", "index",
];

/// Clauses collected from a plan in step order
#[derive(Debug, Default)]
struct PlanShape {
    collection: String,
    fields: Option<Vec<String>>,
    distinct: bool,
    joins: Vec<(JoinType, String, String, String)>,
    semi_joins: Vec<(String, String, String)>,
    conditions: Vec<Condition>,
    windows: Vec<TimeWindow>,
    having: Vec<Condition>,
    group_by: Vec<String>,
    aggregates: Vec<AggregateSpec>,
    sort: Vec<SortKey>,
    limit: Option<usize>,
    offset: usize,
}

impl PlanShape {
    fn from_plan(plan: &QueryPlan) -> Self {
        let mut shape = PlanShape {
            collection: plan.primary_collection().unwrap_or("unknown").to_string(),
            ..Default::default()
        };

        for step in &plan.steps {
            match &step.kind {
                StepKind::Fetch { fields, .. } => {
                    if shape.fields.is_none() && !fields.iter().any(|f| f == "*") {
                        shape.fields = Some(fields.clone());
                    }
                }
                StepKind::Filter {
                    conditions, time, ..
                } => {
                    if shape.is_aggregated() {
                        shape.having.extend(conditions.iter().cloned());
                    } else {
                        shape.conditions.extend(conditions.iter().cloned());
                    }
                    if let Some(window) = time {
                        shape.windows.push(window.clone());
                    }
                }
                StepKind::Join {
                    collection,
                    join_type,
                    on,
                } => shape.joins.push((
                    *join_type,
                    collection.clone(),
                    on.left.clone(),
                    on.right.clone(),
                )),
                StepKind::Subquery { collection, on, .. } => {
                    shape
                        .semi_joins
                        .push((collection.clone(), on.left.clone(), on.right.clone()))
                }
                StepKind::Aggregate {
                    group_by,
                    aggregates,
                    ..
                } => {
                    shape.group_by.extend(group_by.iter().cloned());
                    shape.aggregates.extend(aggregates.iter().cloned());
                }
                StepKind::Sort { keys } => shape.sort = keys.clone(),
                StepKind::Limit { limit, offset } => {
                    shape.limit = Some(*limit);
                    shape.offset = *offset;
                }
                StepKind::Transform { op } => match op {
                    TransformOp::Project { fields } => shape.fields = Some(fields.clone()),
                    TransformOp::Distinct { fields } => {
                        shape.distinct = true;
                        if !fields.is_empty() {
                            shape.fields = Some(fields.clone());
                        }
                    }
                },
                StepKind::Compute { .. } | StepKind::Compare { .. } => {}
            }
        }

        // A bare grouping is finalised with a row count per group
        if !shape.group_by.is_empty() && shape.aggregates.is_empty() {
            shape
                .aggregates
                .push(AggregateSpec::new(AggregateFunction::Count, None));
        }
        shape
    }

    fn is_aggregated(&self) -> bool {
        !self.group_by.is_empty() || !self.aggregates.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryTranslator;

impl QueryTranslator {
    pub fn new() -> Self {
        Self
    }

    /// Renders the plan; TQL output is checked to be a single SELECT
    pub fn render(&self, plan: &QueryPlan, language: QueryLanguage) -> Result<String, AppError> {
        self.render_at(plan, language, Utc::now())
    }

    pub fn render_at(
        &self,
        plan: &QueryPlan,
        language: QueryLanguage,
        now: DateTime<Utc>,
    ) -> Result<String, AppError> {
        match language {
            QueryLanguage::Tql => {
                let tql = to_tql(plan, now);
                TqlValidator::validate_select_only(&tql)?;
                Ok(tql)
            }
            QueryLanguage::Nql => Ok(to_nql(plan)),
            QueryLanguage::Jql => Ok(serde_json::to_string_pretty(&to_jql(plan, now))?),
        }
    }
}

pub fn to_tql(plan: &QueryPlan, now: DateTime<Utc>) -> String {
    let shape = PlanShape::from_plan(plan);
    let qualify_left = !shape.joins.is_empty();

    let select = if shape.is_aggregated() {
        shape
            .group_by
            .iter()
            .map(|f| ident(f))
            .chain(shape.aggregates.iter().map(tql_aggregate))
            .collect::<Vec<_>>()
            .join(", ")
    } else {
        match &shape.fields {
            Some(fields) if !fields.is_empty() => {
                fields.iter().map(|f| ident(f)).collect::<Vec<_>>().join(", ")
            }
            _ => "*".to_string(),
        }
    };

    let mut sql = format!(
        "SELECT {}{} FROM {}",
        if shape.distinct && !shape.is_aggregated() { "DISTINCT " } else { "" },
        select,
        ident(&shape.collection)
    );

    for (join_type, collection, left, right) in &shape.joins {
        let left = if qualify_left && !left.contains('.') {
            format!("{}.{}", ident(&shape.collection), ident(left))
        } else {
            ident(left)
        };
        sql.push_str(&format!(
            " {} JOIN {} ON {} = {}.{}",
            match join_type {
                JoinType::Inner => "INNER",
                JoinType::Left => "LEFT",
            },
            ident(collection),
            left,
            ident(collection),
            ident(right)
        ));
    }

    let mut predicates: Vec<String> = shape.conditions.iter().map(tql_condition).collect();
    for window in &shape.windows {
        if let Some((from, to)) = window.constraint.resolve(now) {
            predicates.push(format!(
                "{} BETWEEN {} AND {}",
                ident(&window.field),
                quote(&timestamp(from)),
                quote(&timestamp(to))
            ));
        }
    }
    for (collection, left, right) in &shape.semi_joins {
        predicates.push(format!(
            "{} IN (SELECT {} FROM {})",
            ident(left),
            ident(right),
            ident(collection)
        ));
    }
    if !predicates.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&predicates.join(" AND "));
    }

    if !shape.group_by.is_empty() {
        let keys: Vec<String> = shape.group_by.iter().map(|f| ident(f)).collect();
        sql.push_str(&format!(" GROUP BY {}", keys.join(", ")));
    }
    if !shape.having.is_empty() {
        let having: Vec<String> = shape.having.iter().map(tql_condition).collect();
        sql.push_str(&format!(" HAVING {}", having.join(" AND ")));
    }
    if !shape.sort.is_empty() {
        let keys: Vec<String> = shape
            .sort
            .iter()
            .map(|k| {
                format!(
                    "{} {}",
                    ident(&k.field),
                    match k.order {
                        SortOrder::Asc => "ASC",
                        SortOrder::Desc => "DESC",
                    }
                )
            })
            .collect();
        sql.push_str(&format!(" ORDER BY {}", keys.join(", ")));
    }
    if let Some(limit) = shape.limit {
        sql.push_str(&format!(" LIMIT {}", limit));
        if shape.offset > 0 {
            sql.push_str(&format!(" OFFSET {}", shape.offset));
        }
    }
    sql
}

pub fn to_nql(plan: &QueryPlan) -> String {
    let shape = PlanShape::from_plan(plan);
    let counting = plan.has_intent(Intent::Count)
        && shape.group_by.is_empty()
        && shape.aggregates.len() == 1
        && shape.aggregates[0].function == AggregateFunction::Count;

    let mut parts = vec![if counting {
        format!("count {}", shape.collection)
    } else {
        match &shape.fields {
            Some(fields) if !fields.is_empty() && !shape.is_aggregated() => {
                format!("find {} of {}", fields.join(", "), shape.collection)
            }
            _ => format!("find {}", shape.collection),
        }
    }];

    for (join_type, collection, left, right) in &shape.joins {
        let kind = match join_type {
            JoinType::Inner => "joined with",
            JoinType::Left => "optionally joined with",
        };
        parts.push(format!("{} {} on {} = {}", kind, collection, left, right));
    }
    for (collection, left, right) in &shape.semi_joins {
        parts.push(format!("having {} in {}.{}", left, collection, right));
    }

    let mut predicates: Vec<String> = shape.conditions.iter().map(nql_condition).collect();
    predicates.extend(
        shape
            .windows
            .iter()
            .map(|w| format!("{} within {}", w.field, w.constraint)),
    );
    if !predicates.is_empty() {
        parts.push(format!("where {}", predicates.join(" and ")));
    }
    if !shape.group_by.is_empty() {
        parts.push(format!("grouped by {}", shape.group_by.join(", ")));
    }
    if shape.is_aggregated() && !counting {
        let computed: Vec<String> = shape
            .aggregates
            .iter()
            .map(|a| match &a.field {
                Some(field) => format!("{} of {}", a.function.as_str(), field),
                None => a.function.as_str().to_string(),
            })
            .collect();
        parts.push(format!("computing {}", computed.join(", ")));
    }
    if !shape.having.is_empty() {
        let having: Vec<String> = shape.having.iter().map(nql_condition).collect();
        parts.push(format!("keeping {}", having.join(" and ")));
    }
    if shape.distinct {
        parts.push("distinct".to_string());
    }
    if !shape.sort.is_empty() {
        let keys: Vec<String> = shape
            .sort
            .iter()
            .map(|k| match k.order {
                SortOrder::Asc => format!("{} ascending", k.field),
                SortOrder::Desc => format!("{} descending", k.field),
            })
            .collect();
        parts.push(format!("sorted by {}", keys.join(", ")));
    }
    if let Some(limit) = shape.limit {
        parts.push(format!("limit {}", limit));
        if shape.offset > 0 {
            parts.push(format!("skip {}", shape.offset));
        }
    }
    parts.join(" ")
}

pub fn to_jql(plan: &QueryPlan, now: DateTime<Utc>) -> Value {
    let shape = PlanShape::from_plan(plan);
    let mut doc = Map::new();
    doc.insert("find".into(), Value::String(shape.collection.clone()));

    let mut filter = Map::new();
    for condition in &shape.conditions {
        merge_filter(&mut filter, &condition.field, jql_predicate(condition));
    }
    for window in &shape.windows {
        if let Some((from, to)) = window.constraint.resolve(now) {
            merge_filter(
                &mut filter,
                &window.field,
                json!({"$gte": timestamp(from), "$lte": timestamp(to)}),
            );
        }
    }
    if !filter.is_empty() {
        doc.insert("filter".into(), Value::Object(filter));
    }

    if !shape.joins.is_empty() {
        let lookups: Vec<Value> = shape
            .joins
            .iter()
            .map(|(join_type, collection, left, right)| {
                json!({
                    "from": collection,
                    "localField": left,
                    "foreignField": right,
                    "type": match join_type {
                        JoinType::Inner => "inner",
                        JoinType::Left => "left",
                    },
                })
            })
            .collect();
        doc.insert("lookup".into(), Value::Array(lookups));
    }
    if !shape.semi_joins.is_empty() {
        let semi: Vec<Value> = shape
            .semi_joins
            .iter()
            .map(|(collection, left, right)| {
                json!({"from": collection, "localField": left, "foreignField": right})
            })
            .collect();
        doc.insert("semiJoin".into(), Value::Array(semi));
    }

    if shape.is_aggregated() {
        let mut aggregates = Map::new();
        for spec in &shape.aggregates {
            let operand = match &spec.field {
                Some(field) => Value::String(format!("${}", field)),
                None => json!(1),
            };
            let mut op = Map::new();
            op.insert(format!("${}", spec.function.as_str()), operand);
            aggregates.insert(spec.alias.clone(), Value::Object(op));
        }
        doc.insert(
            "group".into(),
            json!({"by": shape.group_by, "aggregates": aggregates}),
        );
        if !shape.having.is_empty() {
            let mut having = Map::new();
            for condition in &shape.having {
                merge_filter(&mut having, &condition.field, jql_predicate(condition));
            }
            doc.insert("having".into(), Value::Object(having));
        }
    } else if let Some(fields) = &shape.fields {
        let projection: Map<String, Value> =
            fields.iter().map(|f| (f.clone(), json!(1))).collect();
        doc.insert("projection".into(), Value::Object(projection));
    }
    if shape.distinct {
        doc.insert("distinct".into(), Value::Bool(true));
    }

    if !shape.sort.is_empty() {
        let sort: Map<String, Value> = shape
            .sort
            .iter()
            .map(|k| {
                let direction = match k.order {
                    SortOrder::Asc => 1,
                    SortOrder::Desc => -1,
                };
                (k.field.clone(), json!(direction))
            })
            .collect();
        doc.insert("sort".into(), Value::Object(sort));
    }
    if let Some(limit) = shape.limit {
        doc.insert("limit".into(), json!(limit));
    }
    if shape.offset > 0 {
        doc.insert("skip".into(), json!(shape.offset));
    }
    Value::Object(doc)
}

fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !RESERVED.contains(&name.to_lowercase().as_str())
}

/// Identifier, double-quoted when it is not a plain name; dotted paths are quoted per part
fn ident(name: &str) -> String {
    name.split('.')
        .map(|part| {
            if is_plain_identifier(part) {
                part.to_string()
            } else {
                format!("\"{}\"", part.replace('"', "\"\""))
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

fn quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote(s),
        other => quote(&other.to_string()),
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn list(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    }
}

fn tql_aggregate(spec: &AggregateSpec) -> String {
    let argument = spec.field.as_deref().map(ident).unwrap_or_else(|| "*".into());
    format!(
        "{}({}) AS {}",
        spec.function.as_str().to_uppercase(),
        argument,
        ident(&spec.alias)
    )
}

fn tql_condition(condition: &Condition) -> String {
    let field = ident(&condition.field);
    let value = &condition.value;
    match condition.op {
        ComparisonOp::Eq if value.is_null() => format!("{} IS NULL", field),
        ComparisonOp::Ne if value.is_null() => format!("{} IS NOT NULL", field),
        ComparisonOp::Eq => format!("{} = {}", field, literal(value)),
        ComparisonOp::Ne => format!("{} <> {}", field, literal(value)),
        ComparisonOp::Lt | ComparisonOp::Le | ComparisonOp::Gt | ComparisonOp::Ge => {
            format!("{} {} {}", field, condition.op.symbol(), literal(value))
        }
        ComparisonOp::In | ComparisonOp::NotIn => {
            let items: Vec<String> = list(value).iter().map(literal).collect();
            let keyword = if condition.op == ComparisonOp::In { "IN" } else { "NOT IN" };
            if items.is_empty() {
                // An empty set matches nothing, its negation everything
                if condition.op == ComparisonOp::In { "1 = 0".into() } else { "1 = 1".into() }
            } else {
                format!("{} {} ({})", field, keyword, items.join(", "))
            }
        }
        ComparisonOp::Contains => format!("{} LIKE {}", field, quote(&format!("%{}%", text_of(value)))),
        ComparisonOp::StartsWith => format!("{} LIKE {}", field, quote(&format!("{}%", text_of(value)))),
        ComparisonOp::EndsWith => format!("{} LIKE {}", field, quote(&format!("%{}", text_of(value)))),
        ComparisonOp::IsNull => format!("{} IS NULL", field),
        ComparisonOp::IsNotNull => format!("{} IS NOT NULL", field),
        ComparisonOp::Between => match value.as_array().map(Vec::as_slice) {
            Some([low, high]) => format!("{} BETWEEN {} AND {}", field, literal(low), literal(high)),
            _ => format!("{} = {}", field, literal(value)),
        },
    }
}

fn nql_condition(condition: &Condition) -> String {
    let value = &condition.value;
    match condition.op {
        ComparisonOp::IsNull => format!("{} is missing", condition.field),
        ComparisonOp::IsNotNull => format!("{} is present", condition.field),
        ComparisonOp::Between => match value.as_array().map(Vec::as_slice) {
            Some([low, high]) => format!("{} between {} and {}", condition.field, low, high),
            _ => format!("{} is {}", condition.field, value),
        },
        ComparisonOp::In | ComparisonOp::NotIn => {
            let items: Vec<String> = list(value).iter().map(|v| v.to_string()).collect();
            let keyword = if condition.op == ComparisonOp::In { "in" } else { "not in" };
            format!("{} {} ({})", condition.field, keyword, items.join(", "))
        }
        ComparisonOp::StartsWith => format!("{} starts with {}", condition.field, value),
        ComparisonOp::EndsWith => format!("{} ends with {}", condition.field, value),
        ComparisonOp::Contains => format!("{} contains {}", condition.field, value),
        _ => format!("{} {} {}", condition.field, condition.op.symbol(), value),
    }
}

fn jql_predicate(condition: &Condition) -> Value {
    let value = condition.value.clone();
    match condition.op {
        ComparisonOp::Eq => json!({"$eq": value}),
        ComparisonOp::Ne => json!({"$ne": value}),
        ComparisonOp::Lt => json!({"$lt": value}),
        ComparisonOp::Le => json!({"$lte": value}),
        ComparisonOp::Gt => json!({"$gt": value}),
        ComparisonOp::Ge => json!({"$gte": value}),
        ComparisonOp::In => json!({"$in": list(&value)}),
        ComparisonOp::NotIn => json!({"$nin": list(&value)}),
        ComparisonOp::Contains => json!({"$regex": regex::escape(&text_of(&value)), "$options": "i"}),
        ComparisonOp::StartsWith => {
            json!({"$regex": format!("^{}", regex::escape(&text_of(&value))), "$options": "i"})
        }
        ComparisonOp::EndsWith => {
            json!({"$regex": format!("{}$", regex::escape(&text_of(&value))), "$options": "i"})
        }
        ComparisonOp::IsNull => json!({"$eq": null}),
        ComparisonOp::IsNotNull => json!({"$ne": null}),
        ComparisonOp::Between => match value.as_array().map(Vec::as_slice) {
            Some([low, high]) => json!({"$gte": low, "$lte": high}),
            _ => json!({"$eq": value}),
        },
    }
}

/// Folds a predicate into the filter, combining operators on the same field
fn merge_filter(filter: &mut Map<String, Value>, field: &str, predicate: Value) {
    let Value::Object(ops) = predicate else {
        return;
    };
    match filter.get_mut(field) {
        Some(Value::Object(existing)) => existing.extend(ops),
        _ => {
            filter.insert(field.to_string(), Value::Object(ops));
        }
    }
}
