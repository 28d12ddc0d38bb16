/*!
Artifact encoders for the snapshot formats.

Each change bucket is encoded independently; the encoder's contract is
the byte layout of the artifact, plus an optional sibling blob for
formats whose payload cannot embed the run metadata.
*/

mod csv;
mod json;
mod parquet;

use serde_json::Value;

use crate::error::{CdcError, Result};

/// Snapshot artifact format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotFormat {
    /// Self-describing JSON documents.
    Json,
    /// One-row-group parquet files with a JSON metadata sibling.
    Parquet,
    /// Flat CSV with a header of the bucket's column union.
    Csv,
}

impl SnapshotFormat {
    /// Parse a configured format name. Unknown names fail the table,
    /// not the run.
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_lowercase().as_str() {
            "json" => Ok(SnapshotFormat::Json),
            "parquet" => Ok(SnapshotFormat::Parquet),
            "csv" => Ok(SnapshotFormat::Csv),
            other => Err(CdcError::Config(format!(
                "unsupported snapshot format: {}",
                other
            ))),
        }
    }

    /// Artifact file extension.
    pub fn extension(&self) -> &'static str {
        match self {
            SnapshotFormat::Json => "json",
            SnapshotFormat::Parquet => "parquet",
            SnapshotFormat::Csv => "csv",
        }
    }

    /// Configured name of the format.
    pub fn name(&self) -> &'static str {
        match self {
            SnapshotFormat::Json => "json",
            SnapshotFormat::Parquet => "parquet",
            SnapshotFormat::Csv => "csv",
        }
    }

    /// The encoder for this format.
    pub fn encoder(&self) -> Box<dyn BucketEncoder> {
        match self {
            SnapshotFormat::Json => Box::new(json::JsonEncoder),
            SnapshotFormat::Parquet => Box::new(parquet::ParquetEncoder),
            SnapshotFormat::Csv => Box::new(csv::CsvEncoder),
        }
    }
}

/// Run metadata attached to every encoded bucket.
#[derive(Debug, Clone)]
pub struct BucketContext<'a> {
    /// Table the bucket belongs to.
    pub table: &'a str,
    /// Datasource the table lives in.
    pub datasource: &'a str,
    /// Run timestamp, ISO-8601.
    pub timestamp: &'a str,
    /// Bucket operation: `added`, `modified` or `deleted`.
    pub operation: &'a str,
}

/// One encoded artifact: the payload bytes plus, for formats that split
/// metadata from rows, the sibling blob.
pub struct EncodedBucket {
    /// Artifact payload.
    pub payload: Vec<u8>,
    /// Optional `<key>_metadata` sibling content.
    pub metadata: Option<Vec<u8>>,
}

/// Encodes one change bucket into artifact bytes.
pub trait BucketEncoder {
    /// Encode the bucket's records. Records are JSON objects; deleted
    /// buckets carry `{primary_key, value}` records instead of row
    /// images.
    fn encode(&self, ctx: &BucketContext<'_>, records: &[Value]) -> Result<EncodedBucket>;
}

/// Names of the engine-added metadata columns carried by the columnar
/// formats.
pub(crate) static METADATA_COLUMNS: [&str; 4] = [
    "_cdc_operation",
    "_cdc_timestamp",
    "_cdc_table",
    "_cdc_datasource",
];

/// A record with the four metadata columns appended.
pub(crate) fn with_metadata_columns(record: &Value, ctx: &BucketContext<'_>) -> Value {
    let mut object = record
        .as_object()
        .cloned()
        .unwrap_or_default();
    object.insert(
        METADATA_COLUMNS[0].to_string(),
        Value::from(ctx.operation),
    );
    object.insert(
        METADATA_COLUMNS[1].to_string(),
        Value::from(ctx.timestamp),
    );
    object.insert(METADATA_COLUMNS[2].to_string(), Value::from(ctx.table));
    object.insert(
        METADATA_COLUMNS[3].to_string(),
        Value::from(ctx.datasource),
    );
    Value::Object(object)
}
