// Result Formatter
//
// Renders result data as a text table, markdown table, CSV, pretty JSON or a
// one-line summary. Rows are JSON objects; scalars render as a single cell.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use crate::error::AppError;

const SUMMARY_PREVIEW_FIELDS: usize = 3;
const MAX_CELL_WIDTH: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Table,
    Markdown,
    Csv,
    Json,
    Summary,
}

impl FromStr for OutputFormat {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(OutputFormat::Table),
            "markdown" | "md" => Ok(OutputFormat::Markdown),
            "csv" => Ok(OutputFormat::Csv),
            "json" => Ok(OutputFormat::Json),
            "summary" => Ok(OutputFormat::Summary),
            other => Err(AppError::Configuration(format!(
                "Unsupported output format: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResultFormatter;

impl ResultFormatter {
    pub fn new() -> Self {
        Self
    }

    pub fn format(&self, data: &Value, format: OutputFormat) -> String {
        match format {
            OutputFormat::Table => self.table(data),
            OutputFormat::Markdown => self.markdown(data),
            OutputFormat::Csv => self.csv(data),
            OutputFormat::Json => {
                serde_json::to_string_pretty(data).unwrap_or_else(|_| data.to_string())
            }
            OutputFormat::Summary => self.summary(data),
        }
    }

    pub fn table(&self, data: &Value) -> String {
        let (columns, rows) = tabulate(data);
        if columns.is_empty() {
            return "(no rows)".to_string();
        }
        let rows: Vec<Vec<String>> = rows
            .iter()
            .map(|row| row.iter().map(|cell| truncate(cell, MAX_CELL_WIDTH)).collect())
            .collect();

        let widths: Vec<usize> = columns
            .iter()
            .enumerate()
            .map(|(i, name)| {
                rows.iter()
                    .map(|row| row[i].chars().count())
                    .chain(std::iter::once(name.chars().count()))
                    .max()
                    .unwrap_or(0)
            })
            .collect();

        let line = |cells: &[String]| -> String {
            cells
                .iter()
                .zip(&widths)
                .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
                .collect::<Vec<_>>()
                .join(" | ")
                .trim_end()
                .to_string()
        };

        let mut out = vec![
            line(&columns),
            widths
                .iter()
                .map(|w| "-".repeat(*w))
                .collect::<Vec<_>>()
                .join("-+-"),
        ];
        out.extend(rows.iter().map(|row| line(row)));
        out.push(format!("({} {})", rows.len(), plural(rows.len(), "row")));
        out.join("\n")
    }

    pub fn markdown(&self, data: &Value) -> String {
        let (columns, rows) = tabulate(data);
        if columns.is_empty() {
            return "_No results_".to_string();
        }
        let escape = |cell: &String| cell.replace('|', "\\|");
        let mut out = vec![
            format!("| {} |", columns.iter().map(escape).collect::<Vec<_>>().join(" | ")),
            format!("|{}|", vec!["---"; columns.len()].join("|")),
        ];
        for row in &rows {
            out.push(format!("| {} |", row.iter().map(escape).collect::<Vec<_>>().join(" | ")));
        }
        out.join("\n")
    }

    pub fn csv(&self, data: &Value) -> String {
        let (columns, rows) = tabulate(data);
        if columns.is_empty() {
            return String::new();
        }
        let mut out = vec![columns.iter().map(|c| csv_field(c)).collect::<Vec<_>>().join(",")];
        for row in &rows {
            out.push(row.iter().map(|c| csv_field(c)).collect::<Vec<_>>().join(","));
        }
        out.join("\n")
    }

    /// One line describing the result, stored with each conversation turn
    pub fn summary(&self, data: &Value) -> String {
        match data {
            Value::Null => "No results".to_string(),
            Value::Array(items) if items.is_empty() => "No results".to_string(),
            Value::Array(items) => {
                let fields: Vec<String> = match &items[0] {
                    Value::Object(first) => first
                        .keys()
                        .take(SUMMARY_PREVIEW_FIELDS)
                        .cloned()
                        .collect(),
                    _ => Vec::new(),
                };
                if fields.is_empty() {
                    format!("{} {}", items.len(), plural(items.len(), "result"))
                } else {
                    format!(
                        "{} {} with fields {}",
                        items.len(),
                        plural(items.len(), "result"),
                        fields.join(", ")
                    )
                }
            }
            Value::Object(record) => {
                let pairs: Vec<String> = record
                    .iter()
                    .take(SUMMARY_PREVIEW_FIELDS)
                    .map(|(k, v)| format!("{}={}", k, cell(v)))
                    .collect();
                format!("1 result: {}", pairs.join(", "))
            }
            scalar => format!("Result: {}", cell(scalar)),
        }
    }
}

/// Column names in first-seen order and stringified cells
fn tabulate(data: &Value) -> (Vec<String>, Vec<Vec<String>>) {
    let items: Vec<&Value> = match data {
        Value::Null => return (Vec::new(), Vec::new()),
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    if items.is_empty() {
        return (Vec::new(), Vec::new());
    }

    let mut columns: Vec<String> = Vec::new();
    for item in &items {
        match item {
            Value::Object(record) => {
                for key in record.keys() {
                    if !columns.contains(key) {
                        columns.push(key.clone());
                    }
                }
            }
            _ if !columns.iter().any(|c| c == "value") => columns.push("value".to_string()),
            _ => {}
        }
    }

    let rows = items
        .iter()
        .map(|item| {
            columns
                .iter()
                .map(|column| match item {
                    Value::Object(record) => record.get(column).map(cell).unwrap_or_default(),
                    scalar if column == "value" => cell(scalar),
                    _ => String::new(),
                })
                .collect()
        })
        .collect();
    (columns, rows)
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let head: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

fn csv_field(text: &str) -> String {
    if text.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text.to_string()
    }
}

fn plural(n: usize, word: &str) -> String {
    if n == 1 {
        word.to_string()
    } else {
        format!("{}s", word)
    }
}
