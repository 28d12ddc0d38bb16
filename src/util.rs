/*!
Parsing helpers for object-store key schemes.
*/
use chrono::{DateTime, NaiveDateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref SNAPSHOT_KEY: Regex = Regex::new(
        r"^snapshots/(?P<ds>[^/]+)/(?P<tbl>[^/]+)/(?P<ts>\d{8}_\d{6})_(?P<op>[a-z]+)\.(?P<ext>\w+)$"
    )
    .unwrap();
    static ref PARTITION_SLOT: Regex =
        Regex::new(r"^partition_(?P<i>\d+)_of_(?P<n>\d+)$").unwrap();
}

/// Timestamp component of snapshot keys.
pub static SNAPSHOT_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Render the run timestamp as it appears in snapshot keys.
pub fn snapshot_timestamp(now: &DateTime<Utc>) -> String {
    now.format(SNAPSHOT_TIMESTAMP_FORMAT).to_string()
}

/// Components of a snapshot artifact key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotKeyParts {
    /// Datasource segment of the key.
    pub datasource: String,
    /// Table segment of the key.
    pub table: String,
    /// Run timestamp encoded in the key.
    pub timestamp: NaiveDateTime,
    /// Bucket operation: `added`, `modified`, `deleted` or `summary`.
    pub operation: String,
    /// Artifact file extension.
    pub extension: String,
}

/// Parse `snapshots/<ds>/<tbl>/<YYYYMMDD_HHMMSS>_<op>.<ext>`; `None` for
/// keys that do not follow the scheme.
pub fn parse_snapshot_key(key: &str) -> Option<SnapshotKeyParts> {
    let caps = SNAPSHOT_KEY.captures(key)?;
    let timestamp =
        NaiveDateTime::parse_from_str(&caps["ts"], SNAPSHOT_TIMESTAMP_FORMAT).ok()?;
    Some(SnapshotKeyParts {
        datasource: caps["ds"].to_string(),
        table: caps["tbl"].to_string(),
        timestamp,
        operation: caps["op"].to_string(),
        extension: caps["ext"].to_string(),
    })
}

/// Parse the basename of a hash-partition state slot,
/// `partition_<i>_of_<N>`, into `(i, N)`.
pub fn parse_partition_slot(basename: &str) -> Option<(u64, u64)> {
    let caps = PARTITION_SLOT.captures(basename)?;
    Some((caps["i"].parse().ok()?, caps["n"].parse().ok()?))
}
