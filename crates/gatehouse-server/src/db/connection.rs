//! One physical database session
//!
//! `SingleConnection` owns at most one live session produced by a
//! [`Connector`]. It connects lazily, bounds every connect and every
//! statement with the configured timeout, and releases the session once.

use super::error::DbError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Tabular result of a statement or procedure call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
    pub rows_affected: u64,
}

impl QueryResult {
    /// First cell of the first row, if any
    pub fn first_value(&self) -> Option<&str> {
        self.rows.first()?.first()?.as_deref()
    }
}

/// A unit of work for the database
///
/// The operation doubles as the request key inside a serializer, so two
/// identical operations submitted concurrently share one execution.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Operation {
    Sql { text: String, params: Vec<String> },
    Procedure { name: String, args: Vec<String> },
}

impl Operation {
    pub fn sql(text: impl Into<String>) -> Self {
        Operation::Sql {
            text: text.into(),
            params: Vec::new(),
        }
    }

    pub fn procedure(name: impl Into<String>, args: Vec<String>) -> Self {
        Operation::Procedure {
            name: name.into(),
            args,
        }
    }

    /// Bind a positional parameter (SQL only)
    pub fn bind(mut self, value: impl Into<String>) -> Self {
        if let Operation::Sql { params, .. } = &mut self {
            params.push(value.into());
        }
        self
    }
}

// Parameters may carry credentials, so they never reach the logs.
impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Sql { text, params } => f
                .debug_struct("Sql")
                .field("text", text)
                .field("params", &params.len())
                .finish(),
            Operation::Procedure { name, args } => f
                .debug_struct("Procedure")
                .field("name", name)
                .field("args", &args.len())
                .finish(),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Sql { text, .. } => write!(f, "{}", text),
            Operation::Procedure { name, args } => write!(f, "CALL {}({} args)", name, args.len()),
        }
    }
}

/// A live session with the backing database
#[async_trait]
pub trait DatabaseSession: Send {
    /// Run one statement with positional parameters
    async fn query(&mut self, sql: &str, params: &[String]) -> Result<QueryResult, DbError>;

    /// Call a stored procedure with positional arguments
    async fn call_procedure(&mut self, name: &str, args: &[String]) -> Result<QueryResult, DbError>;

    /// False once the link is known to be broken
    fn is_connected(&self) -> bool;

    /// Close the session gracefully
    async fn close(self: Box<Self>) -> Result<(), DbError>;
}

/// Factory for database sessions
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn DatabaseSession>, DbError>;

    /// Human readable target for logs (never includes the password)
    fn target(&self) -> String;
}

/// Exactly one database session, owned by one borrower at a time
pub struct SingleConnection {
    id: u64,
    connector: Arc<dyn Connector>,
    session: Option<Box<dyn DatabaseSession>>,
    timeout: Duration,
}

impl SingleConnection {
    /// Create an unconnected handle
    pub fn new(connector: Arc<dyn Connector>, timeout: Duration) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            connector,
            session: None,
            timeout,
        }
    }

    /// Create and connect in one step
    pub async fn open(connector: Arc<dyn Connector>, timeout: Duration) -> Result<Self, DbError> {
        let mut conn = Self::new(connector, timeout);
        conn.connect().await?;
        Ok(conn)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Connect unless already connected
    ///
    /// The attempt is abandoned once the timeout elapses.
    pub async fn connect(&mut self) -> Result<(), DbError> {
        if self.is_connected() {
            return Ok(());
        }
        // a broken session is dropped before reconnecting
        self.session = None;

        match tokio::time::timeout(self.timeout, self.connector.connect()).await {
            Ok(Ok(session)) => {
                debug!(
                    connection_id = self.id,
                    target = %self.connector.target(),
                    "Database connection established"
                );
                self.session = Some(session);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DbError::ConnectTimeout(self.timeout.as_millis() as u64)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.as_ref().map(|s| s.is_connected()).unwrap_or(false)
    }

    pub async fn execute_sql(&mut self, sql: &str, params: &[String]) -> Result<QueryResult, DbError> {
        self.connect().await?;
        let timeout = self.timeout;
        let outcome = {
            let session = self.session.as_mut().ok_or(DbError::NoConnection)?;
            tokio::time::timeout(timeout, session.query(sql, params)).await
        };
        self.settle(outcome)
    }

    pub async fn execute_procedure(&mut self, name: &str, args: &[String]) -> Result<QueryResult, DbError> {
        self.connect().await?;
        let timeout = self.timeout;
        let outcome = {
            let session = self.session.as_mut().ok_or(DbError::NoConnection)?;
            tokio::time::timeout(timeout, session.call_procedure(name, args)).await
        };
        self.settle(outcome)
    }

    pub async fn execute(&mut self, operation: &Operation) -> Result<QueryResult, DbError> {
        match operation {
            Operation::Sql { text, params } => self.execute_sql(text, params).await,
            Operation::Procedure { name, args } => self.execute_procedure(name, args).await,
        }
    }

    fn settle(
        &mut self,
        outcome: Result<Result<QueryResult, DbError>, tokio::time::error::Elapsed>,
    ) -> Result<QueryResult, DbError> {
        match outcome {
            Ok(result) => result,
            Err(_) => {
                // The wire state is unknown after an abandoned statement.
                warn!(connection_id = self.id, "Statement timed out, dropping session");
                self.session = None;
                Err(DbError::QueryTimeout(self.timeout.as_millis() as u64))
            }
        }
    }

    /// Release the session; later calls are no-ops
    pub async fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.close().await {
                warn!(connection_id = self.id, error = %e, "Error while closing database session");
            } else {
                debug!(connection_id = self.id, "Database connection closed");
            }
        }
    }
}

impl fmt::Debug for SingleConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleConnection")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .finish()
    }
}
