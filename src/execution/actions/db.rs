//! `db_query` executor.
//!
//! Queries go through the [`Datastore`] trait so engine tests can swap the
//! SQL pools for in-memory fakes. [`SqlDatastore`] is the production
//! implementation over a lazily connected sqlx `AnyPool`.

use async_trait::async_trait;
use log::debug;
use serde_json::{json, Map, Value};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Column, Row};

use super::StepContext;
use crate::config::ConnectionConfig;
use crate::error::{ConfigError, ExecutorError, StepError};
use crate::pipeline::{Coercion, Template};
use crate::scope::{Scope, StepOutput};

/// What a statement produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOutput {
    /// Present for statements that return rows
    pub rows: Option<Vec<Map<String, Value>>>,
    pub rows_affected: u64,
    pub last_insert_id: Option<i64>,
}

impl QueryOutput {
    pub fn affected(rows_affected: u64, last_insert_id: Option<i64>) -> Self {
        Self {
            rows: None,
            rows_affected,
            last_insert_id,
        }
    }

    pub fn rows(rows: Vec<Map<String, Value>>) -> Self {
        Self {
            rows_affected: rows.len() as u64,
            rows: Some(rows),
            last_insert_id: None,
        }
    }

    /// `{id, rows_affected}` for writes; `{rows, id?}` for row queries,
    /// where `id` comes from the first row's `id` column.
    pub fn into_step_output(self) -> StepOutput {
        match self.rows {
            Some(rows) => {
                let count = rows.len();
                let mut result = Map::new();
                if let Some(id) = rows.first().and_then(|r| r.get("id")) {
                    result.insert("id".to_string(), id.clone());
                }
                result.insert(
                    "rows".to_string(),
                    Value::Array(rows.into_iter().map(Value::Object).collect()),
                );
                StepOutput::new(Value::Object(result), json!(count))
            }
            None => StepOutput::new(
                json!({
                    "id": self.last_insert_id,
                    "rows_affected": self.rows_affected,
                }),
                json!(self.rows_affected),
            ),
        }
    }
}

/// A named database the `db_query` step can talk to.
#[async_trait]
pub trait Datastore: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<QueryOutput, ExecutorError>;
}

/// A pooled SQL connection (Postgres or SQLite, chosen by URL scheme).
#[derive(Debug, Clone)]
pub struct SqlDatastore {
    name: String,
    pool: AnyPool,
}

impl SqlDatastore {
    /// Creates the pool without connecting.
    pub fn connect_lazy(name: &str, config: &ConnectionConfig) -> Result<Self, ConfigError> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_lazy(&config.url)
            .map_err(|e| ConfigError::InvalidValue {
                field: format!("connections.{}.url", name),
                message: e.to_string(),
            })?;
        debug!(
            "Connection '{}': pool of up to {} connections",
            name, config.max_connections
        );
        Ok(Self {
            name: name.to_string(),
            pool,
        })
    }

    fn map_error(&self, error: sqlx::Error) -> ExecutorError {
        match error {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Configuration(_) => ExecutorError::ConnectionUnavailable {
                connection: self.name.clone(),
                message: error.to_string(),
            },
            other => ExecutorError::Query(other.to_string()),
        }
    }
}

#[async_trait]
impl Datastore for SqlDatastore {
    async fn execute(&self, sql: &str) -> Result<QueryOutput, ExecutorError> {
        if returns_rows(sql) {
            let rows = sqlx::query(sql)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| self.map_error(e))?;
            Ok(QueryOutput::rows(rows.iter().map(row_to_json).collect()))
        } else {
            let done = sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| self.map_error(e))?;
            Ok(QueryOutput::affected(done.rows_affected(), done.last_insert_id()))
        }
    }
}

fn returns_rows(sql: &str) -> bool {
    let lowered = sql.trim_start().to_ascii_lowercase();
    ["select", "with", "values", "show", "pragma"]
        .iter()
        .any(|kw| lowered.starts_with(kw))
        || lowered
            .split(|c: char| c.is_whitespace() || c == '(' || c == ')' || c == ',' || c == ';')
            .any(|word| word == "returning")
}

fn row_to_json(row: &AnyRow) -> Map<String, Value> {
    let mut map = Map::new();
    for (index, column) in row.columns().iter().enumerate() {
        let value = if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
            v.map(Value::from)
        } else if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
            v.map(Value::from)
        } else if let Ok(v) = row.try_get::<Option<bool>, _>(index) {
            v.map(Value::from)
        } else if let Ok(v) = row.try_get::<Option<String>, _>(index) {
            v.map(Value::from)
        } else {
            None
        };
        map.insert(column.name().to_string(), value.unwrap_or(Value::Null));
    }
    map
}

pub(crate) async fn run_query(
    connection: &str,
    query: &Template,
    scope: &Scope,
    ctx: &StepContext<'_>,
) -> Result<StepOutput, StepError> {
    let sql = query.render(scope, Coercion::SqlLiteral)?;
    let store = ctx
        .integrations
        .datastore(connection)
        .ok_or_else(|| ExecutorError::ConnectionUnavailable {
            connection: connection.to_string(),
            message: "not configured".to_string(),
        })?;

    debug!(
        "[{}] {}: query on '{}' ({} chars)",
        ctx.run_id,
        ctx.step,
        connection,
        sql.len()
    );
    let output = store.execute(&sql).await?;
    Ok(output.into_step_output())
}


#[cfg(test)]
mod tests {
    use super::fakes::FakeDatastore;
    use super::*;
    use crate::compliance::ComplianceWindow;
    use crate::execution::actions::Integrations;
    use crate::run::RunId;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn scope() -> Scope {
        let mut params = BTreeMap::new();
        params.insert("full_name".to_string(), json!("D'Artagnan"));
        Scope::with_params(params)
    }

    async fn run(integrations: &Integrations, connection: &str, sql: &str) -> Result<StepOutput, StepError> {
        let cancel = CancellationToken::new();
        let ctx = StepContext {
            run_id: RunId::new(),
            step: "save_initial_state",
            cancel: &cancel,
            integrations,
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
        };
        run_query(connection, &Template::parse(sql).unwrap(), &scope(), &ctx).await
    }

    #[test]
    fn test_output_shapes() {
        let output = QueryOutput::affected(1, Some(42)).into_step_output();
        assert_eq!(output.result, json!({"id": 42, "rows_affected": 1}));
        assert_eq!(output.status, json!(1));

        let mut row = Map::new();
        row.insert("id".into(), json!(7));
        row.insert("name".into(), json!("Ivan"));
        let output = QueryOutput::rows(vec![row]).into_step_output();
        assert_eq!(output.result["id"], json!(7));
        assert_eq!(output.result["rows"][0]["name"], json!("Ivan"));
        assert_eq!(output.status, json!(1));
    }

    #[test]
    fn test_returns_rows() {
        assert!(returns_rows("  SELECT 1"));
        assert!(returns_rows("with x as (select 1) select * from x"));
        assert!(returns_rows("INSERT INTO t (a) VALUES (1) RETURNING id"));
        assert!(returns_rows("INSERT INTO t (a) VALUES (1) RETURNING\tid"));
        assert!(returns_rows("INSERT INTO t (a) VALUES (1)\r\nRETURNING *;"));
        assert!(returns_rows("DELETE FROM t WHERE a = 1 RETURNING(id)"));
        assert!(!returns_rows("UPDATE t SET a = 1"));
        assert!(!returns_rows("UPDATE t SET returning_customer = 1"));
    }

    #[tokio::test]
    async fn test_query_is_rendered_with_sql_quoting() {
        let store = Arc::new(FakeDatastore::new());
        let integrations = Integrations::new(ComplianceWindow::default())
            .with_datastore("postgres_main", store.clone());

        let output = run(
            &integrations,
            "postgres_main",
            "INSERT INTO debtors (name) VALUES ('{{ params.full_name }}')",
        )
        .await
        .unwrap();

        assert_eq!(
            store.statements(),
            vec!["INSERT INTO debtors (name) VALUES ('D''Artagnan')"]
        );
        assert_eq!(output.result["id"], json!(1));
    }

    #[tokio::test]
    async fn test_missing_insert_id_renders_as_null() {
        // Postgres reports no last insert id without RETURNING.
        let store = Arc::new(FakeDatastore::new());
        store.respond(Ok(QueryOutput::affected(1, None)));
        let integrations = Integrations::new(ComplianceWindow::default())
            .with_datastore("postgres_main", store.clone());

        let inserted = run(&integrations, "postgres_main", "INSERT INTO debtors (name) VALUES ('x')")
            .await
            .unwrap();
        assert_eq!(inserted.result["id"], Value::Null);

        let mut scope = scope();
        scope.bind("db_result", inserted);
        let cancel = CancellationToken::new();
        let ctx = StepContext {
            run_id: RunId::new(),
            step: "update_db_status",
            cancel: &cancel,
            integrations: &integrations,
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
        };
        let query = Template::parse("UPDATE debtors SET status = 'called' WHERE id = {{ actions.db_result.id }};").unwrap();
        run_query("postgres_main", &query, &scope, &ctx).await.unwrap();

        assert_eq!(
            store.statements()[1],
            "UPDATE debtors SET status = 'called' WHERE id = NULL;"
        );
    }

    #[tokio::test]
    async fn test_unknown_connection() {
        let integrations = Integrations::new(ComplianceWindow::default());
        let err = run(&integrations, "missing", "SELECT 1").await.unwrap_err();
        assert!(matches!(
            err,
            StepError::Executor(ExecutorError::ConnectionUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_sqlite_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("calls.db").display());
        let store = SqlDatastore::connect_lazy("local", &ConnectionConfig::new(url)).unwrap();
        let integrations = Integrations::new(ComplianceWindow::default())
            .with_datastore("local", Arc::new(store));

        run(
            &integrations,
            "local",
            "CREATE TABLE debtors (id INTEGER PRIMARY KEY, name TEXT NOT NULL, status TEXT)",
        )
        .await
        .unwrap();

        let inserted = run(
            &integrations,
            "local",
            "INSERT INTO debtors (name, status) VALUES ('{{ params.full_name }}', 'new')",
        )
        .await
        .unwrap();
        assert_eq!(inserted.result, json!({"id": 1, "rows_affected": 1}));

        let returned = run(
            &integrations,
            "local",
            "INSERT INTO debtors (name, status) VALUES ('Ivan', 'new') RETURNING\tid",
        )
        .await
        .unwrap();
        assert_eq!(returned.result["id"], json!(2));

        let selected = run(&integrations, "local", "SELECT id, name, status FROM debtors ORDER BY id")
            .await
            .unwrap();
        assert_eq!(selected.status, json!(2));
        assert_eq!(selected.result["id"], json!(1));
        assert_eq!(selected.result["rows"][0]["name"], json!("D'Artagnan"));

        let err = run(&integrations, "local", "SELECT * FROM nope").await.unwrap_err();
        assert!(matches!(err, StepError::Executor(ExecutorError::Query(_))));
    }
}
