use std::sync::Arc;

use arrow::json::reader::{infer_json_schema_from_iterator, Decoder, DecoderOptions};
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::file::properties::WriterProperties;
use serde_json::{json, Value};

use super::{with_metadata_columns, BucketContext, BucketEncoder, EncodedBucket};
use crate::error::{CdcError, Result};

/// Parquet artifacts: the bucket becomes one record batch written as a
/// single row group, with the engine metadata columns merged into every
/// record. Non-row metadata travels in the `<key>_metadata` JSON
/// sibling.
pub struct ParquetEncoder;

impl BucketEncoder for ParquetEncoder {
    fn encode(
        &self,
        ctx: &BucketContext<'_>,
        records: &[Value],
    ) -> Result<EncodedBucket> {
        let records: Vec<Value> = records
            .iter()
            .map(|record| with_metadata_columns(record, ctx))
            .collect();

        let schema = infer_json_schema_from_iterator(records.iter().map(|r| Ok(r.clone())))
            .map_err(|err| CdcError::SnapshotIo(err.to_string()))?;
        let schema = Arc::new(schema);
        let decoder = Decoder::new(
            Arc::clone(&schema),
            DecoderOptions::new().with_batch_size(records.len().max(1)),
        );
        let mut values = records.iter().map(|r| Ok(r.clone()));
        let batch = decoder
            .next_batch(&mut values)
            .map_err(|err| CdcError::SnapshotIo(err.to_string()))?
            .ok_or_else(|| CdcError::SnapshotIo("empty record batch".to_string()))?;

        let mut payload = Vec::new();
        let properties = WriterProperties::builder()
            .set_max_row_group_size(records.len().max(1))
            .build();
        let mut writer = ArrowWriter::try_new(&mut payload, schema, Some(properties))
            .map_err(|err| CdcError::SnapshotIo(err.to_string()))?;
        writer
            .write(&batch)
            .map_err(|err| CdcError::SnapshotIo(err.to_string()))?;
        writer
            .close()
            .map_err(|err| CdcError::SnapshotIo(err.to_string()))?;

        let metadata = json!({
            "table_name": ctx.table,
            "datasource": ctx.datasource,
            "timestamp": ctx.timestamp,
            "operation": ctx.operation,
            "count": records.len(),
        });
        Ok(EncodedBucket {
            payload,
            metadata: Some(
                serde_json::to_vec(&metadata)
                    .map_err(|err| CdcError::SnapshotIo(err.to_string()))?,
            ),
        })
    }
}
