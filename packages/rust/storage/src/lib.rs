//! libSQL storage layer for starload.
//!
//! The [`Store`] struct wraps an embedded libSQL database holding the staging,
//! dimension, fact, and view namespaces plus the pipeline run log. Stages get
//! the store handle passed in explicitly; nothing else holds a connection.
//!
//! **Access rules:**
//! - `starload run` / `starload validate`: read-write (sole writer) via [`Store::open`]
//! - `starload status` / `starload view`: read-only via [`Store::open_readonly`]

mod migrations;

use std::path::Path;

use chrono::Utc;
use libsql::{Connection, Database, Value, params};
use serde::Serialize;

use starload_shared::{Result, RunId, RunStatus, StageName, StarloadError};

/// Upper bound on bound parameters per statement (SQLite's default limit).
pub const MAX_BOUND_PARAMS: usize = 32_766;

/// Primary storage handle wrapping a libSQL database.
pub struct Store {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

/// Map a libSQL error into the storage variant.
fn db_err(e: libsql::Error) -> StarloadError {
    StarloadError::Storage(e.to_string())
}

impl Store {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StarloadError::io(parent, e))?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;

        let store = Self {
            db,
            conn,
            readonly: false,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(StarloadError::Storage(format!(
                "database not found at {}; run the pipeline first",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        StarloadError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    pub async fn schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(StarloadError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------------

    /// Execute a single statement with positional parameters.
    pub async fn execute(&self, sql: &str, values: Vec<Value>) -> Result<u64> {
        self.check_writable()?;
        self.conn
            .execute(sql, libsql::params::Params::Positional(values))
            .await
            .map_err(db_err)
    }

    /// Execute several `;`-separated statements without parameters.
    pub async fn execute_batch(&self, sql: &str) -> Result<()> {
        self.check_writable()?;
        self.conn.execute_batch(sql).await.map_err(db_err)?;
        Ok(())
    }

    /// Run a query and collect every row, with column names.
    pub async fn query(&self, sql: &str, values: Vec<Value>) -> Result<QueryRows> {
        let mut rows = self
            .conn
            .query(sql, libsql::params::Params::Positional(values))
            .await
            .map_err(db_err)?;

        let width = rows.column_count();
        let columns = (0..width)
            .map(|i| rows.column_name(i).unwrap_or_default().to_string())
            .collect();

        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let mut values = Vec::with_capacity(width.max(0) as usize);
            for i in 0..width {
                values.push(row.get_value(i).map_err(db_err)?);
            }
            out.push(values);
        }

        Ok(QueryRows { columns, rows: out })
    }

    /// Run a query returning a single integer (e.g. a `COUNT(*)`).
    /// Returns `None` for no rows or a NULL result.
    pub async fn query_i64(&self, sql: &str, values: Vec<Value>) -> Result<Option<i64>> {
        let mut rows = self
            .conn
            .query(sql, libsql::params::Params::Positional(values))
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => match row.get_value(0).map_err(db_err)? {
                Value::Integer(n) => Ok(Some(n)),
                Value::Null => Ok(None),
                other => Err(StarloadError::Storage(format!(
                    "expected integer result, got {other:?}"
                ))),
            },
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Stage transactions
    // -----------------------------------------------------------------------

    /// Start a write transaction scoped to one stage.
    pub async fn begin(&self) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute("BEGIN IMMEDIATE", params![])
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Commit the current stage transaction.
    pub async fn commit(&self) -> Result<()> {
        self.conn
            .execute("COMMIT", params![])
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Roll back the current stage transaction, if one is open.
    pub async fn rollback(&self) -> Result<()> {
        if self.conn.is_autocommit() {
            return Ok(());
        }
        self.conn
            .execute("ROLLBACK", params![])
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Whether a transaction is currently open on this handle.
    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    // -----------------------------------------------------------------------
    // Bulk insert
    // -----------------------------------------------------------------------

    /// Insert `rows` into `table` using multi-row `INSERT` statements of at
    /// most `batch_rows` rows each. Every row must have `columns.len()` values.
    pub async fn insert_rows(
        &self,
        table: &str,
        columns: &[String],
        rows: Vec<Vec<Value>>,
        batch_rows: usize,
    ) -> Result<u64> {
        self.check_writable()?;
        if rows.is_empty() {
            return Ok(0);
        }
        let width = columns.len();
        if width == 0 {
            return Err(StarloadError::Storage(format!("insert into {table}: no columns")));
        }

        let per_batch = batch_rows.clamp(1, (MAX_BOUND_PARAMS / width).max(1));
        let column_list = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        let prefix = format!("INSERT INTO {} ({column_list}) VALUES ", quote_ident(table)?);
        let placeholder = format!("({})", vec!["?"; width].join(", "));

        let mut inserted = 0u64;
        let mut iter = rows.into_iter().peekable();
        while iter.peek().is_some() {
            let chunk: Vec<Vec<Value>> = iter.by_ref().take(per_batch).collect();
            let mut values = Vec::with_capacity(chunk.len() * width);
            for row in chunk.iter() {
                if row.len() != width {
                    return Err(StarloadError::Storage(format!(
                        "insert into {table}: row has {} values, expected {width}",
                        row.len()
                    )));
                }
            }
            let sql = format!(
                "{prefix}{}",
                vec![placeholder.as_str(); chunk.len()].join(", ")
            );
            for row in chunk {
                values.extend(row);
            }
            inserted += self
                .conn
                .execute(&sql, libsql::params::Params::Positional(values))
                .await
                .map_err(db_err)?;
        }
        Ok(inserted)
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Columns of `table` in declaration order.
    pub async fn table_columns(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let result = self
            .query(&format!("PRAGMA table_info({})", quote_ident(table)?), vec![])
            .await?;

        let columns: Vec<ColumnInfo> = result
            .rows
            .iter()
            .filter_map(|row| match (row.get(1), row.get(2)) {
                (Some(Value::Text(name)), Some(Value::Text(decl))) => Some(ColumnInfo {
                    name: name.clone(),
                    affinity: ColumnAffinity::from_decl(decl),
                }),
                _ => None,
            })
            .collect();

        if columns.is_empty() {
            return Err(StarloadError::Storage(format!("no such table: {table}")));
        }
        Ok(columns)
    }

    /// Whether a table or view named `name` exists.
    pub async fn relation_exists(&self, name: &str) -> Result<bool> {
        let count = self
            .query_i64(
                "SELECT COUNT(*) FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1",
                vec![Value::Text(name.to_string())],
            )
            .await?;
        Ok(count.unwrap_or(0) > 0)
    }

    /// Row count of a table or view.
    pub async fn count_rows(&self, relation: &str) -> Result<u64> {
        let count = self
            .query_i64(
                &format!("SELECT COUNT(*) FROM {}", quote_ident(relation)?),
                vec![],
            )
            .await?;
        Ok(count.unwrap_or(0).max(0) as u64)
    }

    // -----------------------------------------------------------------------
    // Run log
    // -----------------------------------------------------------------------

    /// Record the start of a run. `kind` is `run` or `validate`.
    pub async fn insert_run(&self, id: &RunId, kind: &str) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO pipeline_runs (id, kind, started_at, status) VALUES (?1, ?2, ?3, ?4)",
                params![id.to_string(), kind, now.as_str(), RunStatus::Running.as_str()],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Record the outcome of a run.
    pub async fn finish_run(
        &self,
        id: &RunId,
        status: RunStatus,
        failed_stage: Option<StageName>,
        error: Option<&str>,
        stats_json: &str,
    ) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE pipeline_runs
                 SET finished_at = ?1, status = ?2, failed_stage = ?3, error = ?4, stats_json = ?5
                 WHERE id = ?6",
                params![
                    now.as_str(),
                    status.as_str(),
                    failed_stage.map(|s| s.as_str()),
                    error,
                    stats_json,
                    id.to_string()
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Runs still marked `running` (active, or crashed without finishing).
    pub async fn running_runs(&self) -> Result<Vec<RunRecord>> {
        self.select_runs("WHERE status = 'running' ORDER BY started_at", None)
            .await
    }

    /// Most recent runs, newest first.
    pub async fn recent_runs(&self, limit: u32) -> Result<Vec<RunRecord>> {
        self.select_runs("ORDER BY started_at DESC, id DESC", Some(limit))
            .await
    }

    /// Mark every `running` run as failed (used to clear crashed runs).
    pub async fn abandon_running_runs(&self) -> Result<u64> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE pipeline_runs SET status = 'failed', finished_at = ?1, error = 'abandoned'
                 WHERE status = 'running'",
                params![now.as_str()],
            )
            .await
            .map_err(db_err)
    }

    async fn select_runs(&self, clause: &str, limit: Option<u32>) -> Result<Vec<RunRecord>> {
        let sql = format!(
            "SELECT id, kind, started_at, finished_at, status, failed_stage, error, stats_json
             FROM pipeline_runs {clause}{}",
            limit.map(|n| format!(" LIMIT {n}")).unwrap_or_default()
        );
        let mut rows = self.conn.query(&sql, params![]).await.map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let status: String = row.get(4).map_err(db_err)?;
            results.push(RunRecord {
                id: row.get(0).map_err(db_err)?,
                kind: row.get(1).map_err(db_err)?,
                started_at: row.get(2).map_err(db_err)?,
                finished_at: row.get::<String>(3).ok(),
                status: status.parse()?,
                failed_stage: row.get::<String>(5).ok(),
                error: row.get::<String>(6).ok(),
                stats_json: row.get::<String>(7).ok(),
            });
        }
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Rows returned by [`Store::query`].
#[derive(Debug, Clone, Default)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryRows {
    /// Index of a column by name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

/// Storage class a column's declared type maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnAffinity {
    Text,
    Integer,
    Real,
}

impl ColumnAffinity {
    /// SQLite affinity rules, reduced to the three types staging uses.
    pub fn from_decl(decl: &str) -> Self {
        let upper = decl.to_ascii_uppercase();
        if upper.contains("INT") {
            Self::Integer
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            Self::Real
        } else {
            Self::Text
        }
    }
}

/// A column name and its affinity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub affinity: ColumnAffinity,
}

/// One entry of the run log.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub id: String,
    pub kind: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: RunStatus,
    pub failed_stage: Option<String>,
    pub error: Option<String>,
    pub stats_json: Option<String>,
}

/// Quote a table/column identifier, rejecting anything but `[A-Za-z0-9_]`.
pub fn quote_ident(name: &str) -> Result<String> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if !valid {
        return Err(StarloadError::validation(format!("invalid identifier '{name}'")));
    }
    Ok(format!("\"{name}\""))
}

/// Render a value for display (CLI tables, validator samples).
pub fn display_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".into(),
        Value::Integer(n) => n.to_string(),
        Value::Real(f) => format!("{f:.2}"),
        Value::Text(s) => s.clone(),
        Value::Blob(b) => format!("<{} bytes>", b.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use starload_shared::STAGING_TABLES;
    use uuid::Uuid;

    /// Create a temp file store for testing.
    async fn test_store() -> Store {
        let tmp = std::env::temp_dir().join(format!("starload_test_{}.db", Uuid::now_v7()));
        Store::open(&tmp).await.expect("open test db")
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let store = test_store().await;
        assert_eq!(store.schema_version().await, 2);
        for table in STAGING_TABLES {
            assert!(store.relation_exists(table).await.unwrap(), "{table} missing");
        }
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("starload_test_{}.db", Uuid::now_v7()));
        let s1 = Store::open(&tmp).await.expect("first open");
        drop(s1);
        let s2 = Store::open(&tmp).await.expect("second open");
        assert_eq!(s2.schema_version().await, 2);
    }

    #[tokio::test]
    async fn staging_columns_reflect_declared_types() {
        let store = test_store().await;
        let cols = store.table_columns("stg_order_items").await.unwrap();
        let names: Vec<&str> = cols.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "order_id",
                "order_item_id",
                "product_id",
                "seller_id",
                "shipping_limit_date",
                "price",
                "freight_value"
            ]
        );
        assert_eq!(cols[1].affinity, ColumnAffinity::Integer);
        assert_eq!(cols[5].affinity, ColumnAffinity::Real);
        assert_eq!(cols[0].affinity, ColumnAffinity::Text);

        assert!(store.table_columns("stg_nope").await.is_err());
    }

    #[tokio::test]
    async fn batched_insert_splits_statements() {
        let store = test_store().await;
        let columns = vec!["seller_id".to_string(), "seller_state".to_string()];
        let rows: Vec<Vec<Value>> = (0..7)
            .map(|i| vec![Value::Text(format!("s{i}")), Value::Text("SP".into())])
            .collect();

        let inserted = store
            .insert_rows("stg_sellers", &columns, rows, 3)
            .await
            .expect("insert");
        assert_eq!(inserted, 7);
        assert_eq!(store.count_rows("stg_sellers").await.unwrap(), 7);

        let bad = vec![vec![Value::Text("s9".into())]];
        assert!(store.insert_rows("stg_sellers", &columns, bad, 3).await.is_err());
    }

    #[tokio::test]
    async fn rollback_discards_stage_writes() {
        let store = test_store().await;
        store.begin().await.unwrap();
        assert!(store.in_transaction());
        store
            .execute(
                "INSERT INTO stg_sellers (seller_id) VALUES (?1)",
                vec![Value::Text("s1".into())],
            )
            .await
            .unwrap();
        store.rollback().await.unwrap();
        assert!(!store.in_transaction());
        assert_eq!(store.count_rows("stg_sellers").await.unwrap(), 0);

        store.begin().await.unwrap();
        store
            .execute(
                "INSERT INTO stg_sellers (seller_id) VALUES (?1)",
                vec![Value::Text("s2".into())],
            )
            .await
            .unwrap();
        store.commit().await.unwrap();
        assert_eq!(store.count_rows("stg_sellers").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn query_returns_columns_and_values() {
        let store = test_store().await;
        let rows = store
            .query("SELECT 1 AS one, 'x' AS letter, NULL AS nothing", vec![])
            .await
            .unwrap();
        assert_eq!(rows.columns, ["one", "letter", "nothing"]);
        assert_eq!(rows.rows.len(), 1);
        assert_eq!(rows.rows[0][0], Value::Integer(1));
        assert_eq!(rows.column_index("nothing"), Some(2));
        assert_eq!(display_value(&rows.rows[0][2]), "NULL");
    }

    #[tokio::test]
    async fn run_log_lifecycle() {
        let store = test_store().await;
        let id = RunId::new();
        store.insert_run(&id, "run").await.expect("insert run");
        assert_eq!(store.running_runs().await.unwrap().len(), 1);

        store
            .finish_run(
                &id,
                RunStatus::Failed,
                Some(StageName::Facts),
                Some("seller missing"),
                r#"{"stages": []}"#,
            )
            .await
            .expect("finish run");

        assert!(store.running_runs().await.unwrap().is_empty());
        let runs = store.recent_runs(5).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].failed_stage.as_deref(), Some("facts"));
    }

    #[tokio::test]
    async fn abandoned_runs_cleared() {
        let store = test_store().await;
        store.insert_run(&RunId::new(), "run").await.unwrap();
        assert_eq!(store.abandon_running_runs().await.unwrap(), 1);
        assert!(store.running_runs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("starload_test_{}.db", Uuid::now_v7()));
        let rw = Store::open(&tmp).await.unwrap();
        rw.insert_run(&RunId::new(), "run").await.unwrap();
        drop(rw);

        let ro = Store::open_readonly(&tmp).await.unwrap();
        let result = ro.insert_run(&RunId::new(), "run").await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
        assert_eq!(ro.recent_runs(10).await.unwrap().len(), 1);
    }

    #[test]
    fn identifiers_are_checked() {
        assert_eq!(quote_ident("dim_date").unwrap(), "\"dim_date\"");
        assert!(quote_ident("dim_date; DROP TABLE x").is_err());
        assert!(quote_ident("").is_err());
        assert!(quote_ident("1abc").is_err());
    }
}
