/*!
Defines the [Row] and [Batch] types produced by the source reader.
*/

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One source row: an ordered mapping from column name to scalar value.
/// Null is a distinct value. Column order reflects the source result set,
/// which the `preserve_order` map keeps intact through serialization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(transparent)]
pub struct Row(Map<String, Value>);

impl Row {
    /// An empty row, ready to be filled column by column.
    pub fn new() -> Self {
        Row(Map::new())
    }

    /// The value of a column, if the column is present.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    /// Append a column value, keeping insertion order.
    pub fn insert(&mut self, column: impl Into<String>, value: Value) {
        self.0.insert(column.into(), value);
    }

    /// Column names in source order.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(|k| k.as_str())
    }

    /// `(column, value)` pairs in source order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The row as a JSON object value, for format writers.
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

impl From<Map<String, Value>> for Row {
    fn from(map: Map<String, Value>) -> Self {
        Row(map)
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Row(iter.into_iter().collect())
    }
}

/// An ordered sequence of rows with a homogeneous column set, fetched in
/// one round trip. Row order reflects the underlying driver; callers must
/// not assume a specific ordering.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    rows: Vec<Row>,
}

impl Batch {
    /// Wrap the rows of one fetch round trip.
    pub fn new(rows: Vec<Row>) -> Self {
        Batch { rows }
    }

    /// Column names, projected from the first row.
    pub fn columns(&self) -> Vec<&str> {
        self.rows
            .first()
            .map(|row| row.columns().collect())
            .unwrap_or_default()
    }

    /// Iterate the rows of the batch.
    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.rows.iter()
    }

    /// Number of rows in the batch.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the batch holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl IntoIterator for Batch {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_column_order_preserved() {
        let row = row(&[("z", json!(1)), ("a", json!(2)), ("m", json!(3))]);
        let columns: Vec<&str> = row.columns().collect();
        assert_eq!(columns, vec!["z", "a", "m"]);

        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(json, r#"{"z":1,"a":2,"m":3}"#);
    }

    #[test]
    fn test_null_is_a_value() {
        let row = row(&[("id", json!(1)), ("note", Value::Null)]);
        assert_eq!(row.get("note"), Some(&Value::Null));
        assert_eq!(row.get("missing"), None);
    }

    #[test]
    fn test_batch_columns() {
        let batch = Batch::new(vec![
            row(&[("id", json!(1)), ("name", json!("a"))]),
            row(&[("id", json!(2)), ("name", json!("b"))]),
        ]);
        assert_eq!(batch.columns(), vec!["id", "name"]);
        assert_eq!(batch.len(), 2);
        assert!(Batch::new(vec![]).columns().is_empty());
    }
}
