use std::fmt;

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Text(String),
    Table(Table),
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text(content.into())
    }

    /// Maps a script return value onto an output: strings stay text, a
    /// non-empty array of objects becomes a table, null becomes empty text
    /// and anything else is rendered as JSON.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::String(text) => Self::Text(text),
            Value::Null => Self::Text(String::new()),
            Value::Array(items) if !items.is_empty() && items.iter().all(Value::is_object) => {
                Self::Table(Table::from_objects(&items))
            }
            other => Self::Text(other.to_string()),
        }
    }

    pub fn render(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Table(table) => table.render(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Text(text) => json!({ "type": "text", "text": text }),
            Self::Table(table) => json!({ "type": "table", "columns": table.columns, "rows": table.rows }),
        }
    }
}

impl fmt::Display for ToolOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

const MAX_COLUMN_WIDTH: usize = 48;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    /// Serializes each record to an object; columns follow field order.
    pub fn from_records<T: Serialize>(records: &[T]) -> Result<Self> {
        let values = records
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self::from_objects(&values))
    }

    /// Columns are the union of object keys in order of first appearance;
    /// missing cells are null. Non-object items are skipped.
    pub fn from_objects(items: &[Value]) -> Self {
        let objects: Vec<&Map<String, Value>> = items.iter().filter_map(Value::as_object).collect();

        let mut columns: Vec<String> = Vec::new();
        for object in &objects {
            for key in object.keys() {
                if !columns.contains(key) {
                    columns.push(key.clone());
                }
            }
        }

        let rows = objects
            .iter()
            .map(|object| {
                columns
                    .iter()
                    .map(|column| object.get(column).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect();

        Self { columns, rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Cell texts and the padded width of every column. Cells wider than
    /// `MAX_COLUMN_WIDTH` overflow their column instead of widening it.
    fn layout(&self) -> (Vec<Vec<String>>, Vec<usize>) {
        let cells: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|row| row.iter().map(cell_text).collect())
            .collect();

        let widths = self
            .columns
            .iter()
            .enumerate()
            .map(|(index, column)| {
                cells
                    .iter()
                    .filter_map(|row| row.get(index))
                    .map(|cell| cell.chars().count())
                    .chain(std::iter::once(column.chars().count()))
                    .max()
                    .unwrap_or(0)
                    .min(MAX_COLUMN_WIDTH)
            })
            .collect();
        (cells, widths)
    }

    /// Upper bound on the length of `render()` in bytes.
    pub fn rendered_len(&self) -> usize {
        if self.columns.is_empty() {
            return "(no rows)".len();
        }
        let (cells, widths) = self.layout();
        let text: usize = cells
            .iter()
            .flatten()
            .chain(&self.columns)
            .map(String::len)
            .sum();
        let per_line = widths.iter().sum::<usize>() + 3 * widths.len() + 1;
        text.saturating_add((cells.len() + 2).saturating_mul(per_line))
    }

    pub fn render(&self) -> String {
        if self.columns.is_empty() {
            return "(no rows)".to_owned();
        }

        let (cells, widths) = self.layout();

        let line = |values: Vec<&str>| -> String {
            values
                .iter()
                .zip(&widths)
                .map(|(value, &width)| format!("{value:<width$}"))
                .collect::<Vec<_>>()
                .join(" | ")
                .trim_end()
                .to_owned()
        };

        let mut out = Vec::with_capacity(cells.len() + 2);
        out.push(line(self.columns.iter().map(String::as_str).collect()));
        out.push(
            widths
                .iter()
                .map(|width| "-".repeat(*width))
                .collect::<Vec<_>>()
                .join("-+-"),
        );
        for row in &cells {
            out.push(line(row.iter().map(String::as_str).collect()));
        }
        out.join("\n")
    }
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => "-".to_owned(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
