/*!
Defines the [ChangeSet] produced by one strategy run on one table.
*/

use serde::{Deserialize, Serialize};

use crate::model::row::Row;

/// A deleted row, identified by primary key only. The row image is gone
/// from the source by the time the deletion is observed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeletedKey {
    /// Name of the primary-key column.
    pub primary_key: String,
    /// Canonical string form of the deleted key.
    pub value: String,
}

/// The three disjoint buckets of one run: a primary-key value appears in
/// at most one of them. Added and modified carry the current row image;
/// deleted carries only the key.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChangeSet {
    /// Rows whose key was absent from the previous state.
    pub added: Vec<Row>,
    /// Rows whose fingerprint differs from the previous state.
    pub modified: Vec<Row>,
    /// Keys present in the previous state but absent from the scan.
    pub deleted: Vec<DeletedKey>,
}

/// Per-bucket counts, reported per table and embedded in the snapshot
/// summary manifest.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeCounts {
    /// Number of added rows.
    pub added: usize,
    /// Number of modified rows.
    pub modified: usize,
    /// Number of deleted keys.
    pub deleted: usize,
}

impl ChangeSet {
    /// Whether all three buckets are empty.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    /// The bucket sizes.
    pub fn counts(&self) -> ChangeCounts {
        ChangeCounts {
            added: self.added.len(),
            modified: self.modified.len(),
            deleted: self.deleted.len(),
        }
    }

    /// Append another change set, preserving bucket membership. Used by
    /// the hash-partition strategy to merge per-partition results; the
    /// partition predicates are disjoint so bucket disjointness survives
    /// the merge.
    pub fn extend(&mut self, other: ChangeSet) {
        self.added.extend(other.added);
        self.modified.extend(other.modified);
        self.deleted.extend(other.deleted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: i64) -> Row {
        [("id".to_string(), json!(id))].into_iter().collect()
    }

    #[test]
    fn test_counts() {
        let changes = ChangeSet {
            added: vec![row(1), row(2)],
            modified: vec![row(3)],
            deleted: vec![DeletedKey {
                primary_key: "id".to_string(),
                value: "4".to_string(),
            }],
        };
        let counts = changes.counts();
        assert_eq!(counts.added, 2);
        assert_eq!(counts.modified, 1);
        assert_eq!(counts.deleted, 1);
        assert!(!changes.is_empty());
    }

    #[test]
    fn test_empty() {
        assert!(ChangeSet::default().is_empty());
    }

    #[test]
    fn test_extend_keeps_buckets() {
        let mut changes = ChangeSet {
            added: vec![row(1)],
            ..Default::default()
        };
        changes.extend(ChangeSet {
            modified: vec![row(2)],
            deleted: vec![DeletedKey {
                primary_key: "id".to_string(),
                value: "3".to_string(),
            }],
            ..Default::default()
        });
        assert_eq!(changes.counts().added, 1);
        assert_eq!(changes.counts().modified, 1);
        assert_eq!(changes.counts().deleted, 1);
    }

    #[test]
    fn test_deleted_key_wire_format() {
        let deleted = DeletedKey {
            primary_key: "id".to_string(),
            value: "42".to_string(),
        };
        let json = serde_json::to_string(&deleted).unwrap();
        assert_eq!(json, r#"{"primary_key":"id","value":"42"}"#);
    }
}
