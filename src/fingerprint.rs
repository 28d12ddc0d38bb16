/*!
Row fingerprinting.

A fingerprint is the MD5 of a canonical serialization of selected column
values, used for equality between runs, not authentication. Collisions
within a single table are accepted as negligible. The canonical form must
be byte-identical across runs and platforms, so every value class has one
fixed text rendering.
*/

use serde_json::Value;

use crate::model::row::Row;

/// The wildcard token selecting every column of a row.
pub static WILDCARD: &str = "*";

/// Which columns feed the fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnSelector {
    /// All columns, enumerated in ascending column-name order.
    Wildcard,
    /// The listed columns, in the order given. Absent columns are
    /// skipped.
    Columns(Vec<String>),
}

impl ColumnSelector {
    /// Build a selector from a configured `hash_columns` list. A list
    /// containing the wildcard token selects all columns.
    pub fn from_spec(columns: &[String]) -> Self {
        if columns.iter().any(|c| c == WILDCARD) {
            ColumnSelector::Wildcard
        } else {
            ColumnSelector::Columns(columns.to_vec())
        }
    }
}

/// Canonical text of one scalar value.
///
/// Null renders as the empty string, booleans as `true`/`false`, numbers
/// and strings in their natural form. Temporal values reach this function
/// already rendered to ISO-8601 text by the source reader.
pub fn canonical_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        // Not produced by the reader, but keep nested values
        // deterministic rather than unrepresentable.
        other => other.to_string(),
    }
}

/// Fingerprint a row: canonical values of the selected columns joined
/// with `|`, MD5-hashed, rendered as 32-char lowercase hex.
pub fn fingerprint(row: &Row, selector: &ColumnSelector) -> String {
    let values: Vec<String> = match selector {
        ColumnSelector::Wildcard => {
            let mut pairs: Vec<(&str, &Value)> =
                row.iter().map(|(k, v)| (k.as_str(), v)).collect();
            pairs.sort_by(|a, b| a.0.cmp(b.0));
            pairs.into_iter().map(|(_, v)| canonical_text(v)).collect()
        }
        ColumnSelector::Columns(columns) => columns
            .iter()
            .filter_map(|col| row.get(col))
            .map(canonical_text)
            .collect(),
    };
    let digest = md5::compute(values.join("|").as_bytes());
    format!("{:x}", digest)
}
