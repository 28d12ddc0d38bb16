/*!
Streaming reader over the configured relational sources.

The reader issues only `SELECT *` (optionally with a `WHERE` clause) and
`SELECT COUNT(*)`; every per-row computation happens in the engine so the
load on the source stays predictable and the engine stays dialect-neutral.
Rows are pulled lazily and grouped into [Batch]es, so memory is bounded by
`batch_size` times the row size.
*/

use std::collections::BTreeMap;
use std::time::Duration;

use async_stream::try_stream;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use sqlx::any::{AnyPool, AnyPoolOptions, AnyRow};
use sqlx::{Column, Row as _, TypeInfo};

use crate::config::Config;
use crate::error::{CdcError, Result};
use crate::model::row::{Batch, Row};

/// The fully qualified table name: `<schema>.<name>` when a schema is
/// configured, else `<name>`.
pub fn qualified_table_name(schema: Option<&str>, name: &str) -> String {
    match schema {
        Some(schema) if !schema.is_empty() => format!("{}.{}", schema, name),
        _ => name.to_string(),
    }
}

/// Source dialect, derived from the connection URL scheme. Only used to
/// pick the catalog query in [SourceReader::table_info].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceKind {
    Postgres,
    MySql,
    Sqlite,
}

impl SourceKind {
    fn from_url(url: &str) -> Result<Self> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(SourceKind::Postgres)
        } else if url.starts_with("mysql://") || url.starts_with("mariadb://") {
            Ok(SourceKind::MySql)
        } else if url.starts_with("sqlite:") {
            Ok(SourceKind::Sqlite)
        } else {
            Err(CdcError::Config(format!(
                "unsupported datasource url: {}",
                url
            )))
        }
    }
}

/// One column of a source table, as reported by [SourceReader::table_info].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,
    /// Dialect-specific type name, uppercased.
    pub type_name: String,
}

impl ColumnInfo {
    /// Whether the column holds integers in every supported dialect.
    pub fn is_integer(&self) -> bool {
        self.type_name.contains("INT")
    }
}

/// Schema information for one table.
#[derive(Debug, Clone, Default)]
pub struct TableInfo {
    /// Columns in ordinal order.
    pub columns: Vec<ColumnInfo>,
    /// Primary-key column names.
    pub primary_keys: Vec<String>,
}

struct Datasource {
    pool: AnyPool,
    kind: SourceKind,
}

/// Handles to every configured datasource. Created once at process start
/// and dropped at shutdown; connections are established lazily so an
/// unreachable source fails its tables, not the process.
pub struct SourceReader {
    batch_size: usize,
    datasources: BTreeMap<String, Datasource>,
}

impl SourceReader {
    /// Build connection pools for all configured datasources.
    pub fn connect(config: &Config) -> Result<Self> {
        let pool_settings = &config.global_settings.connection_pool;
        let max_connections = pool_settings.pool_size + pool_settings.max_overflow;
        let mut datasources = BTreeMap::new();
        for (name, ds) in &config.datasources {
            tracing::info!(datasource = %name, "initializing connection pool");
            let kind = SourceKind::from_url(&ds.url)?;
            let pool = AnyPoolOptions::new()
                .max_connections(max_connections)
                .connect_timeout(Duration::from_secs(pool_settings.timeout))
                .connect_lazy(&ds.url)
                .map_err(|err| CdcError::SourceUnavailable(err.to_string()))?;
            datasources.insert(name.clone(), Datasource { pool, kind });
        }
        Ok(SourceReader {
            batch_size: config.global_settings.batch_size,
            datasources,
        })
    }

    /// Direct pool access for test fixtures that need to seed tables.
    #[cfg(test)]
    pub(crate) fn test_pool(&self, name: &str) -> &AnyPool {
        &self.datasources[name].pool
    }

    fn datasource(&self, name: &str) -> Result<&Datasource> {
        self.datasources
            .get(name)
            .ok_or_else(|| CdcError::Config(format!("unknown datasource: {}", name)))
    }

    /// Stream the table in batches of at most `batch_size` rows (the
    /// configured default when `None`), optionally filtered by a `WHERE`
    /// clause. The scan is a single `SELECT *`; batching happens on the
    /// client.
    pub fn fetch_batches(
        &self,
        datasource: &str,
        table: &str,
        batch_size: Option<usize>,
        where_clause: Option<&str>,
    ) -> Result<BoxStream<'static, Result<Batch>>> {
        let pool = self.datasource(datasource)?.pool.clone();
        let batch_size = batch_size.unwrap_or(self.batch_size).max(1);
        let mut sql = format!("SELECT * FROM {}", table);
        if let Some(clause) = where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(clause);
        }
        tracing::debug!(datasource, %sql, batch_size, "starting batched scan");
        let stream = try_stream! {
            let mut rows = sqlx::query(&sql).fetch(&pool);
            let mut batch: Vec<Row> = Vec::with_capacity(batch_size);
            while let Some(row) = rows.next().await {
                let row = row.map_err(map_query_error)?;
                batch.push(decode_row(&row));
                if batch.len() >= batch_size {
                    yield Batch::new(std::mem::replace(
                        &mut batch,
                        Vec::with_capacity(batch_size),
                    ));
                }
            }
            if !batch.is_empty() {
                yield Batch::new(batch);
            }
        };
        Ok(stream.boxed())
    }

    /// The `MOD(key, N) = i` partition predicate in the datasource's
    /// dialect; sqlite spells modulo with the `%` operator. The key is
    /// coerced to an integer, nulls counting as zero.
    pub fn partition_predicate(
        &self,
        datasource: &str,
        primary_key: &str,
        partitions: u64,
        partition: u64,
    ) -> Result<String> {
        let kind = self.datasource(datasource)?.kind;
        Ok(match kind {
            SourceKind::Sqlite => format!(
                "(ABS(CAST(COALESCE({}, 0) AS INTEGER)) % {}) = {}",
                primary_key, partitions, partition
            ),
            _ => format!(
                "MOD(ABS(CAST(COALESCE({}, 0) AS INTEGER)), {}) = {}",
                primary_key, partitions, partition
            ),
        })
    }

    /// Execute a scalar query; used only for `SELECT COUNT(*)`.
    pub async fn execute_scalar(&self, datasource: &str, sql: &str) -> Result<i64> {
        let pool = &self.datasource(datasource)?.pool;
        let row = sqlx::query(sql)
            .fetch_one(pool)
            .await
            .map_err(map_query_error)?;
        row.try_get::<i64, _>(0)
            .map_err(|err| CdcError::Query(err.to_string()))
    }

    /// Columns and primary keys of a table, read from the source catalog.
    pub async fn table_info(&self, datasource: &str, table: &str) -> Result<TableInfo> {
        let source = self.datasource(datasource)?;
        let (schema, name) = match table.split_once('.') {
            Some((schema, name)) => (Some(schema), name),
            None => (None, table),
        };
        match source.kind {
            SourceKind::Sqlite => self.sqlite_table_info(&source.pool, table).await,
            SourceKind::Postgres => {
                self.catalog_table_info(
                    &source.pool,
                    &format!(
                        "SELECT column_name, data_type, \
                         (SELECT COUNT(*) FROM information_schema.key_column_usage k \
                          JOIN information_schema.table_constraints t \
                            ON t.constraint_name = k.constraint_name \
                           AND t.table_schema = k.table_schema \
                          WHERE t.constraint_type = 'PRIMARY KEY' \
                            AND k.table_name = c.table_name \
                            AND k.table_schema = c.table_schema \
                            AND k.column_name = c.column_name) \
                         FROM information_schema.columns c \
                         WHERE table_name = '{}' AND table_schema = '{}' \
                         ORDER BY ordinal_position",
                        name,
                        schema.unwrap_or("public"),
                    ),
                )
                .await
            }
            SourceKind::MySql => {
                let schema_filter = match schema {
                    Some(schema) => format!("table_schema = '{}'", schema),
                    None => "table_schema = DATABASE()".to_string(),
                };
                self.catalog_table_info(
                    &source.pool,
                    &format!(
                        "SELECT column_name, data_type, \
                         CASE WHEN column_key = 'PRI' THEN 1 ELSE 0 END \
                         FROM information_schema.columns \
                         WHERE table_name = '{}' AND {} \
                         ORDER BY ordinal_position",
                        name, schema_filter,
                    ),
                )
                .await
            }
        }
    }

    async fn sqlite_table_info(&self, pool: &AnyPool, table: &str) -> Result<TableInfo> {
        let sql = format!("PRAGMA table_info('{}')", table);
        let rows = sqlx::query(&sql)
            .fetch_all(pool)
            .await
            .map_err(map_query_error)?;
        if rows.is_empty() {
            return Err(CdcError::Schema(format!("table not found: {}", table)));
        }
        let mut info = TableInfo::default();
        for row in rows {
            let name: String = row
                .try_get("name")
                .map_err(|err| CdcError::Query(err.to_string()))?;
            let type_name: String = row
                .try_get("type")
                .map_err(|err| CdcError::Query(err.to_string()))?;
            let pk: i64 = row.try_get("pk").unwrap_or(0);
            if pk > 0 {
                info.primary_keys.push(name.clone());
            }
            info.columns.push(ColumnInfo {
                name,
                type_name: type_name.to_uppercase(),
            });
        }
        Ok(info)
    }

    async fn catalog_table_info(&self, pool: &AnyPool, sql: &str) -> Result<TableInfo> {
        let rows = sqlx::query(sql)
            .fetch_all(pool)
            .await
            .map_err(map_query_error)?;
        if rows.is_empty() {
            return Err(CdcError::Schema("table not found in catalog".to_string()));
        }
        let mut info = TableInfo::default();
        for row in rows {
            let name: String = row
                .try_get(0)
                .map_err(|err| CdcError::Query(err.to_string()))?;
            let type_name: String = row
                .try_get(1)
                .map_err(|err| CdcError::Query(err.to_string()))?;
            let pk: i64 = row.try_get(2).unwrap_or(0);
            if pk > 0 {
                info.primary_keys.push(name.clone());
            }
            info.columns.push(ColumnInfo {
                name,
                type_name: type_name.to_uppercase(),
            });
        }
        Ok(info)
    }

    /// Close every pool. Called once at process shutdown.
    pub async fn close(&self) {
        for (name, source) in &self.datasources {
            tracing::info!(datasource = %name, "closing connection pool");
            source.pool.close().await;
        }
    }
}

/// Decode one driver row into an ordered [Row] of JSON scalars.
///
/// Decoding is guided by the column type name so that a given source
/// column renders identically on every run; anything the driver cannot
/// hand over as i64/f64/bool falls back to its text form, which also
/// covers temporal columns (ISO-8601 text in all supported dialects).
fn decode_row(row: &AnyRow) -> Row {
    let mut decoded = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        decoded.insert(column.name(), decode_value(row, idx));
    }
    decoded
}

fn decode_value(row: &AnyRow, idx: usize) -> Value {
    let type_name = row.columns()[idx].type_info().name().to_uppercase();
    if type_name.contains("INT") {
        if let Ok(value) = row.try_get::<Option<i64>, _>(idx) {
            return value.map(Value::from).unwrap_or(Value::Null);
        }
    }
    if type_name.contains("BOOL") {
        if let Ok(value) = row.try_get::<Option<bool>, _>(idx) {
            return value.map(Value::from).unwrap_or(Value::Null);
        }
    }
    if ["REAL", "FLOA", "DOUB", "NUMERIC", "DECIMAL"]
        .iter()
        .any(|t| type_name.contains(t))
    {
        if let Ok(value) = row.try_get::<Option<f64>, _>(idx) {
            return value.map(Value::from).unwrap_or(Value::Null);
        }
    }
    // Text, temporal and everything else: the driver's text form.
    if let Ok(value) = row.try_get::<Option<String>, _>(idx) {
        return value.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<i64>, _>(idx) {
        return value.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<f64>, _>(idx) {
        return value.map(Value::from).unwrap_or(Value::Null);
    }
    tracing::warn!(
        column = row.columns()[idx].name(),
        type_name = %type_name,
        "undecodable column value, treating as null"
    );
    Value::Null
}

fn map_query_error(err: sqlx::Error) -> CdcError {
    match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Configuration(_) => CdcError::SourceUnavailable(err.to_string()),
        sqlx::Error::Database(db) => {
            let message = db.message().to_lowercase();
            if message.contains("no such table") || message.contains("does not exist") {
                CdcError::Schema(db.message().to_string())
            } else {
                CdcError::Query(db.message().to_string())
            }
        }
        _ => CdcError::Query(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[test]
    fn test_qualified_table_name() {
        assert_eq!(qualified_table_name(Some("sales"), "orders"), "sales.orders");
        assert_eq!(qualified_table_name(None, "orders"), "orders");
        assert_eq!(qualified_table_name(Some(""), "orders"), "orders");
    }

    #[test]
    fn test_partition_predicate_dialects() {
        let sqlite = test_config("sqlite::memory:");
        let reader = SourceReader::connect(&sqlite).unwrap();
        assert_eq!(
            reader
                .partition_predicate("test_db", "id", 3, 1)
                .unwrap(),
            "(ABS(CAST(COALESCE(id, 0) AS INTEGER)) % 3) = 1"
        );

        let postgres = test_config("postgres://u@h/db");
        let reader = SourceReader::connect(&postgres).unwrap();
        assert_eq!(
            reader
                .partition_predicate("test_db", "id", 3, 1)
                .unwrap(),
            "MOD(ABS(CAST(COALESCE(id, 0) AS INTEGER)), 3) = 1"
        );
    }

    #[test]
    fn test_source_kind() {
        assert_eq!(
            SourceKind::from_url("postgres://u@h/db").unwrap(),
            SourceKind::Postgres
        );
        assert_eq!(
            SourceKind::from_url("sqlite::memory:").unwrap(),
            SourceKind::Sqlite
        );
        assert!(SourceKind::from_url("oracle://h/db").is_err());
    }

    fn test_config(url: &str) -> Config {
        Config::from_json(&format!(
            r#"{{"datasources": {{"test_db": {{"url": "{}"}}}}, "global_settings": {{"batch_size": 2, "connection_pool": {{"pool_size": 1, "max_overflow": 0, "timeout": 5}}}}}}"#,
            url
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_fetch_batches_bounded() {
        let config = test_config("sqlite::memory:");
        let reader = SourceReader::connect(&config).unwrap();
        let pool = &reader.datasource("test_db").unwrap().pool;
        sqlx::query("CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT)")
            .execute(pool)
            .await
            .unwrap();
        for i in 1..=5 {
            sqlx::query(&format!("INSERT INTO items VALUES ({}, 'n{}')", i, i))
                .execute(pool)
                .await
                .unwrap();
        }

        let batches: Vec<Batch> = reader
            .fetch_batches("test_db", "items", None, None)
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        // batch_size 2 over 5 rows: 2 + 2 + 1
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[2].len(), 1);
        assert_eq!(batches[0].columns(), vec!["id", "name"]);

        let count = reader
            .execute_scalar("test_db", "SELECT COUNT(*) FROM items")
            .await
            .unwrap();
        assert_eq!(count, 5);
    }

    #[tokio::test]
    async fn test_fetch_batches_where_clause() {
        let config = test_config("sqlite::memory:");
        let reader = SourceReader::connect(&config).unwrap();
        let pool = &reader.datasource("test_db").unwrap().pool;
        sqlx::query("CREATE TABLE events (id INTEGER PRIMARY KEY, updated_at TEXT)")
            .execute(pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO events VALUES (1, '2024-01-01T00:00:00'), (2, '2024-02-01T00:00:00')")
            .execute(pool)
            .await
            .unwrap();

        let batches: Vec<Batch> = reader
            .fetch_batches(
                "test_db",
                "events",
                None,
                Some("updated_at > '2024-01-15T00:00:00'"),
            )
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        let rows: Vec<_> = batches.into_iter().flatten().collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("id"), Some(&serde_json::json!(2)));
    }

    #[tokio::test]
    async fn test_table_info_sqlite() {
        let config = test_config("sqlite::memory:");
        let reader = SourceReader::connect(&config).unwrap();
        let pool = &reader.datasource("test_db").unwrap().pool;
        sqlx::query("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, score REAL)")
            .execute(pool)
            .await
            .unwrap();

        let info = reader.table_info("test_db", "users").await.unwrap();
        assert_eq!(info.primary_keys, vec!["id"]);
        assert_eq!(info.columns.len(), 3);
        assert!(info.columns[0].is_integer());
        assert!(!info.columns[1].is_integer());

        let missing = reader.table_info("test_db", "nope").await;
        assert!(matches!(missing, Err(CdcError::Schema(_))));
    }

    #[tokio::test]
    async fn test_unknown_datasource() {
        let config = test_config("sqlite::memory:");
        let reader = SourceReader::connect(&config).unwrap();
        let result = reader.fetch_batches("nope", "items", None, None);
        assert!(matches!(result, Err(CdcError::Config(_))));
    }
}
