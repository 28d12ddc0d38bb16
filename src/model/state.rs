/*!
Persisted per-table state blobs and their slot keys.

For a given (datasource, table) exactly one slot is authoritative per
method. Blobs are JSON, UTF-8; `row_hashes` keys are primary-key values
rendered as canonical strings and values are 32-char lowercase hex.
*/

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of the timestamp strategy: the high watermark of the scanned
/// timestamp column.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimestampState {
    /// Largest timestamp value observed so far, in canonical text form.
    pub last_timestamp: String,
    /// When the run that produced this state finished its scan.
    pub processed_at: DateTime<Utc>,
}

/// State of the hash strategies: one fingerprint per primary key. The
/// hash-partition strategy persists one of these per partition slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct HashState {
    /// Primary key (canonical string) to row fingerprint (hex32).
    pub row_hashes: BTreeMap<String, String>,
    /// When the run that produced this state finished its scan.
    pub processed_at: Option<DateTime<Utc>>,
}

/// Slot key of the timestamp state: `<ds>/<tbl>/timestamp_state`.
pub fn timestamp_state_key(datasource: &str, table: &str) -> String {
    format!("{}/{}/timestamp_state", datasource, table)
}

/// Slot key of the whole-table hash state: `<ds>/<tbl>/hash_state`.
pub fn hash_state_key(datasource: &str, table: &str) -> String {
    format!("{}/{}/hash_state", datasource, table)
}

/// Slot key of one hash partition: `<ds>/<tbl>/partition_<i>_of_<N>`.
pub fn partition_state_key(datasource: &str, table: &str, partition: u64, total: u64) -> String {
    format!(
        "{}/{}/partition_{}_of_{}",
        datasource, table, partition, total
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_keys() {
        assert_eq!(
            timestamp_state_key("orders_db", "orders"),
            "orders_db/orders/timestamp_state"
        );
        assert_eq!(
            hash_state_key("orders_db", "orders"),
            "orders_db/orders/hash_state"
        );
        assert_eq!(
            partition_state_key("orders_db", "orders", 2, 3),
            "orders_db/orders/partition_2_of_3"
        );
    }

    #[test]
    fn test_hash_state_wire_format() {
        let data = r#"
            {
                "row_hashes": {"1": "9e107d9d372bb6826bd81d3542a419d6"},
                "processed_at": "2024-05-01T10:30:00Z"
            }
        "#;
        let state: HashState = serde_json::from_str(data).unwrap();
        assert_eq!(
            state.row_hashes.get("1").map(String::as_str),
            Some("9e107d9d372bb6826bd81d3542a419d6")
        );
        let round: HashState =
            serde_json::from_str(&serde_json::to_string(&state).unwrap()).unwrap();
        assert_eq!(round, state);
    }

    #[test]
    fn test_timestamp_state_wire_format() {
        let state = TimestampState {
            last_timestamp: "2024-05-01T10:30:00".to_string(),
            processed_at: Utc::now(),
        };
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"last_timestamp\":\"2024-05-01T10:30:00\""));
    }
}
