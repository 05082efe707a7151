//! MySQL sessions backed by sqlx

use super::connection::{Connector, DatabaseSession, QueryResult};
use super::error::DbError;
use async_trait::async_trait;
use gatehouse_common::DatabaseSettings;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::{Column, ConnectOptions, Connection, Row};

/// Opens one `MySqlConnection` per call
pub struct MySqlConnector {
    options: MySqlConnectOptions,
    target: String,
}

impl MySqlConnector {
    pub fn from_settings(settings: &DatabaseSettings) -> Self {
        let options = MySqlConnectOptions::new()
            .host(&settings.host)
            .port(settings.port)
            .username(&settings.username)
            .password(&settings.password)
            .database(&settings.name);

        Self {
            options,
            target: format!(
                "mysql://{}@{}:{}/{}",
                settings.username, settings.host, settings.port, settings.name
            ),
        }
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    async fn connect(&self) -> Result<Box<dyn DatabaseSession>, DbError> {
        let conn = self
            .options
            .connect()
            .await
            .map_err(|e| DbError::Connect(e.to_string()))?;
        Ok(Box::new(MySqlSession {
            conn,
            healthy: true,
        }))
    }

    fn target(&self) -> String {
        self.target.clone()
    }
}

struct MySqlSession {
    conn: MySqlConnection,
    healthy: bool,
}

impl MySqlSession {
    async fn run(&mut self, sql: &str, params: &[String]) -> Result<QueryResult, DbError> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = query.bind(param.as_str());
        }

        let outcome = if returns_rows(sql) {
            query.fetch_all(&mut self.conn).await.map(|rows| rows_to_result(&rows))
        } else {
            query.execute(&mut self.conn).await.map(|done| QueryResult {
                rows_affected: done.rows_affected(),
                ..Default::default()
            })
        };

        outcome.map_err(|e| {
            if is_link_failure(&e) {
                self.healthy = false;
            }
            DbError::Query(e.to_string())
        })
    }
}

#[async_trait]
impl DatabaseSession for MySqlSession {
    async fn query(&mut self, sql: &str, params: &[String]) -> Result<QueryResult, DbError> {
        self.run(sql, params).await
    }

    async fn call_procedure(&mut self, name: &str, args: &[String]) -> Result<QueryResult, DbError> {
        if !is_identifier(name) {
            return Err(DbError::InvalidRequest(format!(
                "'{}' is not a valid procedure name",
                name
            )));
        }
        let placeholders = vec!["?"; args.len()].join(", ");
        let sql = format!("CALL {}({})", name, placeholders);
        self.run(&sql, args).await
    }

    fn is_connected(&self) -> bool {
        self.healthy
    }

    async fn close(self: Box<Self>) -> Result<(), DbError> {
        self.conn
            .close()
            .await
            .map_err(|e| DbError::Query(e.to_string()))
    }
}

/// Plain `[A-Za-z0-9_]+` names only; anything else would be spliced into SQL
pub fn is_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn returns_rows(sql: &str) -> bool {
    let head = sql
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    matches!(
        head.as_str(),
        "SELECT" | "SHOW" | "CALL" | "DESCRIBE" | "DESC" | "EXPLAIN" | "WITH" | "VALUES" | "TABLE"
    )
}

fn is_link_failure(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

fn rows_to_result(rows: &[MySqlRow]) -> QueryResult {
    let columns = rows
        .first()
        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();

    let rows = rows
        .iter()
        .map(|row| (0..row.len()).map(|idx| cell_text(row, idx)).collect())
        .collect();

    QueryResult {
        columns,
        rows,
        rows_affected: 0,
    }
}

/// Render one cell as text, trying the common MySQL types in turn
fn cell_text(row: &MySqlRow, idx: usize) -> Option<String> {
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v;
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(|v| v.to_string());
    }
    if let Ok(v) = row.try_get::<Option<u64>, _>(idx) {
        return v.map(|v| v.to_string());
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map(|v| v.to_string());
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
        return v.map(|v| v.to_string());
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
        return v.map(|v| v.to_string());
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveTime>, _>(idx) {
        return v.map(|v| v.to_string());
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return v.map(|v| String::from_utf8_lossy(&v).into_owned());
    }
    // DECIMAL and friends travel as text on the wire
    row.try_get_unchecked::<Option<String>, _>(idx).ok().flatten()
}
