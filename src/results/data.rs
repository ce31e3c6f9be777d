//! Data structures for accumulated result rows.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved field naming the experiment task. Matched case-insensitively.
pub const TASK_FIELD: &str = "task";

/// Renders a field value as a single output cell.
///
/// Strings are written verbatim, `null` as an empty cell, and everything
/// else in its compact JSON form.
#[must_use]
pub fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// One submitted result record: an ordered map of field name to value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultRow(BTreeMap<String, Value>);

impl ResultRow {
    /// Creates an empty row.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `field` to `value`, returning the row for chaining.
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    /// Sets `field` to `value`.
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(field.into(), value.into());
    }

    /// Value of `field`, if present.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Field names present in this row.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the row has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Rendered cell for `column`; empty if the row lacks it.
    #[must_use]
    pub fn cell(&self, column: &str) -> String {
        self.0.get(column).map(render_value).unwrap_or_default()
    }

    /// Removes every spelling of the reserved task field.
    ///
    /// Returns the first non-empty value in key order, rendered as a string.
    pub fn take_task(&mut self) -> Option<String> {
        let keys: Vec<String> = self
            .0
            .keys()
            .filter(|k| k.eq_ignore_ascii_case(TASK_FIELD))
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|k| self.0.remove(&k))
            .map(|v| render_value(&v))
            .filter(|s| !s.is_empty())
            .reduce(|first, _| first)
    }
}

impl From<BTreeMap<String, Value>> for ResultRow {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for ResultRow {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Everything accumulated for one session.
///
/// `columns` is the union of every field name seen in `rows`, kept sorted so
/// the flushed header order is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultBatch {
    /// Experiment task label, first seen wins.
    pub task: Option<String>,
    /// Every field name observed, excluding the task field.
    pub columns: BTreeSet<String>,
    /// Rows in submission order.
    pub rows: Vec<ResultRow>,
}

impl ResultBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the task label unless one is already recorded.
    pub fn seed_task(&mut self, task: &str) {
        if self.task.is_none() && !task.is_empty() {
            self.task = Some(task.to_string());
        }
    }

    /// Appends rows, stripping the task field and widening the column set.
    ///
    /// Returns the number of rows appended.
    pub fn append_rows<I>(&mut self, rows: I) -> usize
    where
        I: IntoIterator<Item = ResultRow>,
    {
        let mut appended = 0;
        for mut row in rows {
            if let Some(task) = row.take_task() {
                self.seed_task(&task);
            }
            for field in row.fields() {
                if !self.columns.contains(field) {
                    self.columns.insert(field.to_string());
                }
            }
            self.rows.push(row);
            appended += 1;
        }
        appended
    }

    /// Column names in header order.
    #[must_use]
    pub fn header(&self) -> Vec<&str> {
        self.columns.iter().map(String::as_str).collect()
    }

    /// Whether no rows have been submitted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Restores the column invariant after decoding a record that may
    /// predate it or have been edited by hand.
    pub(crate) fn repair_columns(&mut self) {
        for row in &self.rows {
            for field in row.fields() {
                if !self.columns.contains(field) {
                    self.columns.insert(field.to_string());
                }
            }
        }
    }
}

/// Upload body sent by the portal front end.
///
/// The header may carry the task label for rows that don't include one.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultSubmission {
    /// Free-form metadata; only the task field is used.
    #[serde(default, alias = "Header")]
    pub header: BTreeMap<String, Value>,
    /// The rows themselves.
    #[serde(default, alias = "Data")]
    pub data: Vec<ResultRow>,
}

impl ResultSubmission {
    /// Task label from the header, if any.
    #[must_use]
    pub fn task(&self) -> Option<String> {
        self.header
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(TASK_FIELD))
            .map(|(_, v)| render_value(v))
            .find(|s| !s.is_empty())
    }
}
