//! Decoded result rows.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{DecodeError, Error, Result};
use crate::value::Value;

/// Column-name metadata shared by every row of one result.
///
/// Wrapped in `Arc` so rows are cheap to clone and a large buffered result
/// stores the name table once.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    names: Vec<String>,
    by_name: HashMap<String, usize>,
}

impl ColumnInfo {
    pub fn new(names: Vec<String>) -> Self {
        let by_name = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self { names, by_name }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn name_at(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// A single decoded row.
///
/// Values are immutable once decoded; access is by position or by column
/// name.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<ColumnInfo>,
    values: Vec<Value>,
}

impl Row {
    /// Create a row sharing the result's column metadata.
    pub fn new(columns: Arc<ColumnInfo>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &Arc<ColumnInfo> {
        &self.columns
    }

    /// Number of values in this row (always the result's column count).
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get a value by position.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Get a value by column name.
    pub fn get_named(&self, name: &str) -> Option<&Value> {
        self.columns.index_of(name).and_then(|i| self.values.get(i))
    }

    /// Get a value by position, failing with a decode error when the index
    /// is out of range.
    pub fn try_get(&self, index: usize) -> Result<&Value> {
        self.values.get(index).ok_or_else(|| {
            Error::Decode(DecodeError {
                column: None,
                message: format!(
                    "column index {index} out of range (row has {} columns)",
                    self.values.len()
                ),
            })
        })
    }

    /// All values, in column order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Consume the row, yielding its values.
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row() -> Row {
        let cols = Arc::new(ColumnInfo::new(vec!["id".to_string(), "name".to_string()]));
        Row::new(cols, vec![Value::Int(7), Value::Text("ada".to_string())])
    }

    #[test]
    fn positional_and_named_access() {
        let row = sample_row();
        assert_eq!(row.get(0), Some(&Value::Int(7)));
        assert_eq!(row.get_named("name"), Some(&Value::Text("ada".to_string())));
        assert_eq!(row.get_named("missing"), None);
        assert_eq!(row.get(2), None);
    }

    #[test]
    fn try_get_out_of_range() {
        let row = sample_row();
        assert!(row.try_get(1).is_ok());
        assert!(matches!(row.try_get(5), Err(Error::Decode(_))));
    }

    #[test]
    fn shared_column_info() {
        let row = sample_row();
        let other = Row::new(Arc::clone(row.columns()), vec![Value::Null, Value::Null]);
        assert_eq!(other.columns().index_of("id"), Some(0));
        assert_eq!(other.columns().name_at(1), Some("name"));
        assert_eq!(row.columns().len(), other.len());
    }
}
