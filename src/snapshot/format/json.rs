use serde_json::json;

use super::{BucketContext, BucketEncoder, EncodedBucket};
use crate::error::{CdcError, Result};

/// Self-describing JSON artifacts; metadata is embedded in the payload,
/// so no sibling blob is produced.
pub struct JsonEncoder;

impl BucketEncoder for JsonEncoder {
    fn encode(
        &self,
        ctx: &BucketContext<'_>,
        records: &[serde_json::Value],
    ) -> Result<EncodedBucket> {
        let document = json!({
            "table_name": ctx.table,
            "datasource": ctx.datasource,
            "timestamp": ctx.timestamp,
            "operation": ctx.operation,
            "count": records.len(),
            "data": records,
        });
        let payload = serde_json::to_vec(&document)
            .map_err(|err| CdcError::SnapshotIo(err.to_string()))?;
        Ok(EncodedBucket {
            payload,
            metadata: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_payload_shape() {
        let ctx = BucketContext {
            table: "orders",
            datasource: "orders_db",
            timestamp: "2024-05-01T10:30:00+00:00",
            operation: "added",
        };
        let records = vec![serde_json::json!({"id": 1, "name": "A"})];
        let encoded = JsonEncoder.encode(&ctx, &records).unwrap();
        assert!(encoded.metadata.is_none());

        let document: Value = serde_json::from_slice(&encoded.payload).unwrap();
        assert_eq!(document["table_name"], "orders");
        assert_eq!(document["operation"], "added");
        assert_eq!(document["count"], 1);
        assert_eq!(document["data"][0]["name"], "A");
    }
}
