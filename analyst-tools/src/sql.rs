use crate::error::{Result, ToolError};
use crate::tabular::render_table;
use crate::traits::{Tool, ToolContext, ToolSpec, require_string};
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

pub const EXECUTE_SQL: &str = "execute_sql";

pub const DEFAULT_ROW_CAP: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    /// Byte length only; blobs are never rendered.
    Blob(usize),
}

impl CellValue {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Integer(n) => json!(n),
            Self::Real(f) => json!(f),
            Self::Text(s) => json!(s),
            Self::Blob(len) => json!(format!("<blob {len} bytes>")),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(n) => Some(*n as f64),
            Self::Real(f) => Some(*f),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSummary {
    pub name: String,
    pub row_count: i64,
}

/// Runs one SQL statement and returns every row it produced.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<QueryTable>;
}

/// Read-only SQLite access. A fresh connection is opened per call on the
/// blocking pool; `max_connections` bounds how many are open at once.
#[derive(Clone)]
pub struct SqliteExecutor {
    path: PathBuf,
    permits: Arc<Semaphore>,
}

impl SqliteExecutor {
    pub fn new(path: impl Into<PathBuf>, max_connections: usize) -> Self {
        Self {
            path: path.into(),
            permits: Arc::new(Semaphore::new(max_connections.max(1))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("connection pool closed: {e}")))?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_readonly(&path)?;
            f(&conn)
        })
        .await
        .map_err(|e| ToolError::ExecutionFailed(format!("join error: {e}")))?
    }

    /// Markdown description of every user table and its columns.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn describe_schema(&self) -> Result<String> {
        self.with_connection(|conn| {
            let mut out = String::from("# Database schema (SQLite)\n");
            for table in user_tables(conn)? {
                out.push_str(&format!("\n## {table}\n"));
                let mut stmt =
                    conn.prepare(&format!("PRAGMA table_info({})", quote_ident(&table)))?;
                let columns = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(5)?,
                    ))
                })?;
                for column in columns {
                    let (name, ty, pk) = column?;
                    let ty = if ty.is_empty() { "ANY".to_string() } else { ty };
                    if pk > 0 {
                        out.push_str(&format!("- {name} {ty} (primary key)\n"));
                    } else {
                        out.push_str(&format!("- {name} {ty}\n"));
                    }
                }
            }
            Ok(out)
        })
        .await
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn list_tables(&self) -> Result<Vec<TableSummary>> {
        self.with_connection(|conn| {
            user_tables(conn)?
                .into_iter()
                .map(|name| {
                    let row_count = conn.query_row(
                        &format!("SELECT COUNT(*) FROM {}", quote_ident(&name)),
                        [],
                        |row| row.get::<_, i64>(0),
                    )?;
                    Ok::<_, ToolError>(TableSummary { name, row_count })
                })
                .collect()
        })
        .await
    }
}

#[async_trait]
impl QueryExecutor for SqliteExecutor {
    async fn execute(&self, sql: &str) -> Result<QueryTable> {
        let sql = sql.trim().to_string();
        self.with_connection(move |conn| run_query(conn, &sql)).await
    }
}

fn open_readonly(path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
            | OpenFlags::SQLITE_OPEN_URI,
    )
    .map_err(|e| ToolError::ExecutionFailed(format!("open database {}: {e}", path.display())))?;
    conn.busy_timeout(Duration::from_millis(1000))
        .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
    Ok(conn)
}

fn run_query(conn: &Connection, sql: &str) -> Result<QueryTable> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let width = columns.len();
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut cells = Vec::with_capacity(width);
        for i in 0..width {
            cells.push(match row.get_ref(i)? {
                ValueRef::Null => CellValue::Null,
                ValueRef::Integer(n) => CellValue::Integer(n),
                ValueRef::Real(f) => CellValue::Real(f),
                ValueRef::Text(t) => CellValue::Text(String::from_utf8_lossy(t).into_owned()),
                ValueRef::Blob(b) => CellValue::Blob(b.len()),
            });
        }
        out.push(cells);
    }
    Ok(QueryTable { columns, rows: out })
}

fn user_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(names)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// The `execute_sql` tool. Failures come back as result text so the model can
/// correct itself.
pub struct SqlTool {
    executor: Arc<dyn QueryExecutor>,
    row_cap: usize,
}

impl SqlTool {
    pub fn new(executor: Arc<dyn QueryExecutor>, row_cap: usize) -> Self {
        Self {
            executor,
            row_cap: row_cap.max(1),
        }
    }

    /// Runs `sql` and renders the outcome as tool-result text.
    pub async fn run(&self, sql: &str) -> String {
        let started = Instant::now();
        match self.executor.execute(sql).await {
            Ok(table) => {
                tracing::info!(
                    rows = table.rows.len(),
                    latency_ms = started.elapsed().as_millis() as u64,
                    "query executed"
                );
                render_table(&table, self.row_cap)
            }
            Err(ToolError::Sql(msg)) => {
                tracing::warn!(error = %msg, "query rejected by database");
                format!("SQL Error: {msg}")
            }
            Err(e) => {
                tracing::error!(error = %e, "query execution failed");
                format!("Execution Error: {e}")
            }
        }
    }
}

#[async_trait]
impl Tool for SqlTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: EXECUTE_SQL.to_string(),
            description: "Execute one read-only SQL query against the analytics database and return the result rows as text.".to_string(),
            parameters_schema: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "A single SQLite SELECT statement."
                    }
                },
                "required": ["query"],
                "additionalProperties": false
            }),
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(tool_name = EXECUTE_SQL))]
    async fn execute(&self, arguments: serde_json::Value, _ctx: &ToolContext<'_>) -> Result<String> {
        let query = require_string(&arguments, "query")?;
        if query.trim().is_empty() {
            return Err(ToolError::InvalidArguments("query is empty".to_string()));
        }
        Ok(self.run(&query).await)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chart::ChartCollector;
    use crate::tabular::NO_ROWS_TEXT;

    pub(crate) fn seeded_db() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = Connection::open(dir.path().join("shop.sqlite")).expect("create db");
        conn.execute_batch(
            r#"
CREATE TABLE customers (customer_id TEXT PRIMARY KEY, customer_state TEXT);
CREATE TABLE orders (order_id TEXT PRIMARY KEY, month TEXT, revenue REAL);
INSERT INTO customers VALUES ('c1', 'SP'), ('c2', 'RJ'), ('c3', 'SP');
INSERT INTO orders VALUES ('o1', '2017-01', 120.5), ('o2', '2017-02', 98.0), ('o3', '2017-02', 10.0);
"#,
        )
        .expect("seed db");
        dir
    }

    fn executor(dir: &tempfile::TempDir) -> Arc<SqliteExecutor> {
        Arc::new(SqliteExecutor::new(dir.path().join("shop.sqlite"), 2))
    }

    async fn run_tool(tool: &SqlTool, args: serde_json::Value) -> Result<String> {
        let sink = ChartCollector::default();
        let ctx = ToolContext {
            history: &[],
            charts: &sink,
        };
        tool.execute(args, &ctx).await
    }

    #[tokio::test]
    async fn select_renders_tabular_text() {
        let dir = seeded_db();
        let tool = SqlTool::new(executor(&dir), DEFAULT_ROW_CAP);
        let out = run_tool(
            &tool,
            json!({"query": "SELECT month, SUM(revenue) AS revenue FROM orders GROUP BY month ORDER BY month"}),
        )
        .await
        .expect("tool runs");
        assert_eq!(
            out,
            "Columns: month, revenue\n\nRows (2 total):\n('2017-01', 120.5)\n('2017-02', 108.0)\n"
        );
    }

    #[tokio::test]
    async fn zero_rows_yield_literal_text() {
        let dir = seeded_db();
        let tool = SqlTool::new(executor(&dir), DEFAULT_ROW_CAP);
        let out = run_tool(
            &tool,
            json!({"query": "SELECT * FROM customers WHERE customer_state = 'AM'"}),
        )
        .await
        .expect("tool runs");
        assert_eq!(out, NO_ROWS_TEXT);
    }

    #[tokio::test]
    async fn syntax_errors_and_writes_come_back_as_sql_error_text() {
        let dir = seeded_db();
        let tool = SqlTool::new(executor(&dir), DEFAULT_ROW_CAP);
        let out = run_tool(&tool, json!({"query": "SELEC * FROM customers"}))
            .await
            .expect("tool runs");
        assert!(out.starts_with("SQL Error:"), "{out}");

        let out = run_tool(&tool, json!({"query": "DELETE FROM customers"}))
            .await
            .expect("tool runs");
        assert!(out.starts_with("SQL Error:"), "{out}");
        let table = tool
            .executor
            .execute("SELECT COUNT(*) FROM customers")
            .await
            .expect("count");
        assert_eq!(table.rows[0][0], CellValue::Integer(3));
    }

    #[tokio::test]
    async fn missing_database_is_an_execution_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tool = SqlTool::new(
            Arc::new(SqliteExecutor::new(dir.path().join("absent.sqlite"), 1)),
            DEFAULT_ROW_CAP,
        );
        let out = tool.run("SELECT 1").await;
        assert!(out.starts_with("Execution Error:"), "{out}");
    }

    #[tokio::test]
    async fn missing_query_argument_is_rejected() {
        let dir = seeded_db();
        let tool = SqlTool::new(executor(&dir), DEFAULT_ROW_CAP);
        let err = run_tool(&tool, json!({"sql": "SELECT 1"}))
            .await
            .expect_err("query is required");
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn schema_and_table_listing_cover_user_tables() {
        let dir = seeded_db();
        let exec = executor(&dir);
        let schema = exec.describe_schema().await.expect("schema");
        assert!(schema.contains("## customers"));
        assert!(schema.contains("- customer_id TEXT (primary key)"));
        assert!(schema.contains("- revenue REAL"));

        let tables = exec.list_tables().await.expect("tables");
        assert_eq!(
            tables,
            vec![
                TableSummary {
                    name: "customers".to_string(),
                    row_count: 3
                },
                TableSummary {
                    name: "orders".to_string(),
                    row_count: 3
                },
            ]
        );
    }
}
