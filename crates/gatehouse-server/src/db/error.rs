//! Failures surfaced by the database subsystem
//!
//! `DbError` is `Clone` so one execution failure can be handed to every
//! waiter coalesced on the same request.

use gatehouse_common::GatehouseError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DbError {
    /// The physical connect did not finish inside the connect timeout
    #[error("connect attempt timed out after {0} ms")]
    ConnectTimeout(u64),

    /// The driver refused the connection
    #[error("connect failed: {0}")]
    Connect(String),

    /// The statement or call failed
    #[error("query failed: {0}")]
    Query(String),

    /// The statement did not finish inside the query timeout
    #[error("query timed out after {0} ms")]
    QueryTimeout(u64),

    /// The pool stayed empty for the whole wait
    #[error("no pooled connection available")]
    NoConnection,

    /// No result was delivered to the waiter in time
    #[error("no result within {0} ms")]
    WaitTimeout(u64),

    /// The subsystem (or the serializer) is not running
    #[error("database subsystem is not running")]
    Stopped,

    /// The worker died or restarted while the request was pending
    #[error("request interrupted by a worker restart")]
    Interrupted,

    /// The request does not fit the serializer or names an invalid object
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl DbError {
    /// Label used on metrics
    pub fn label(&self) -> &'static str {
        match self {
            DbError::ConnectTimeout(_) => "connect_timeout",
            DbError::Connect(_) => "connect",
            DbError::Query(_) => "query",
            DbError::QueryTimeout(_) => "query_timeout",
            DbError::NoConnection => "no_connection",
            DbError::WaitTimeout(_) => "wait_timeout",
            DbError::Stopped => "stopped",
            DbError::Interrupted => "interrupted",
            DbError::InvalidRequest(_) => "invalid_request",
        }
    }
}

impl From<DbError> for GatehouseError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::WaitTimeout(ms) | DbError::QueryTimeout(ms) | DbError::ConnectTimeout(ms) => {
                GatehouseError::DatabaseTimeout(ms)
            }
            DbError::Stopped | DbError::NoConnection => {
                GatehouseError::ServiceUnavailable(err.to_string())
            }
            DbError::InvalidRequest(msg) => GatehouseError::InvalidArgument(msg),
            other => GatehouseError::DatabaseError(other.to_string()),
        }
    }
}
