use itertools::Itertools;
use serde_json::Value;

use super::{with_metadata_columns, BucketContext, BucketEncoder, EncodedBucket};
use crate::error::{CdcError, Result};
use crate::fingerprint::canonical_text;

/// Flat CSV artifacts. The header is the union of columns across the
/// bucket in first-seen order, followed by the engine metadata columns;
/// cells use the canonical text rendering so nulls come out empty.
pub struct CsvEncoder;

impl BucketEncoder for CsvEncoder {
    fn encode(
        &self,
        ctx: &BucketContext<'_>,
        records: &[Value],
    ) -> Result<EncodedBucket> {
        let columns: Vec<String> = records
            .iter()
            .filter_map(Value::as_object)
            .flat_map(|object| object.keys())
            .unique()
            .cloned()
            .chain(super::METADATA_COLUMNS.iter().map(|c| c.to_string()))
            .collect();
        let records: Vec<Value> = records
            .iter()
            .map(|record| with_metadata_columns(record, ctx))
            .collect();

        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(&columns)
            .map_err(|err| CdcError::SnapshotIo(err.to_string()))?;
        for record in &records {
            let cells: Vec<String> = columns
                .iter()
                .map(|column| {
                    record
                        .get(column)
                        .map(canonical_text)
                        .unwrap_or_default()
                })
                .collect();
            writer
                .write_record(&cells)
                .map_err(|err| CdcError::SnapshotIo(err.to_string()))?;
        }
        let payload = writer
            .into_inner()
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
    use serde_json::json;

    #[test]
    fn test_header_is_column_union() {
        let ctx = BucketContext {
            table: "orders",
            datasource: "orders_db",
            timestamp: "2024-05-01T10:30:00+00:00",
            operation: "modified",
        };
        let records = vec![
            json!({"id": 1, "name": "A"}),
            json!({"id": 2, "note": null}),
        ];
        let encoded = CsvEncoder.encode(&ctx, &records).unwrap();
        let text = String::from_utf8(encoded.payload).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "id,name,note,_cdc_operation,_cdc_timestamp,_cdc_table,_cdc_datasource"
        );
        let first = lines.next().unwrap();
        assert!(first.starts_with("1,A,,modified,"));
        // null and absent both render as the empty cell
        let second = lines.next().unwrap();
        assert!(second.starts_with("2,,,modified,"));
    }
}
