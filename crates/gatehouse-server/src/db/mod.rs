//! Database access subsystem
//!
//! ```text
//! session ──► RequestSerializer (sql)        ──┐
//!         └─► RequestSerializer (procedure)  ──┴─► ConnectionPool ──► SingleConnection ──► MySQL
//!                       │                               │
//!                       └──────── escalations ──────────┴──► supervisor
//! ```
//!
//! `Database` owns the pool and both serializers. Failures that the
//! components cannot handle locally are escalated to a supervisor task,
//! which restarts a serializer or stops the whole subsystem.

pub mod connection;
pub mod error;
pub mod mysql;
pub mod pool;
pub mod procedure;
pub mod serializer;

#[cfg(test)]
pub mod testing;

pub use connection::{Connector, Operation, QueryResult, SingleConnection};
pub use error::DbError;
pub use pool::{ConnectionPool, PoolConfig};
pub use procedure::{Procedure, ProcedureRegistry, ReturnType};
pub use serializer::{RequestKind, RequestSerializer};

use gatehouse_common::{DatabaseSettings, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Failures reported to the supervisor
#[derive(Debug, Clone)]
pub enum Escalation {
    /// The pool filler failed to connect too often and stopped the pool
    FillerGaveUp { error: DbError },
    /// An execution failed while fail-fast is configured
    ExecutionFailed { kind: RequestKind, error: DbError },
    /// A serializer worker died
    WorkerFatal { kind: RequestKind },
}

pub struct Database {
    settings: DatabaseSettings,
    pool: Arc<ConnectionPool>,
    sql: Arc<RequestSerializer>,
    procedures: Arc<RequestSerializer>,
    running: AtomicBool,
    escalations: Mutex<Option<mpsc::UnboundedReceiver<Escalation>>>,
}

impl Database {
    pub fn new(settings: &DatabaseSettings, connector: Arc<dyn Connector>) -> Result<Arc<Self>> {
        settings.validate()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let pool = ConnectionPool::new(PoolConfig::from_settings(settings), connector, tx.clone());
        let sql = RequestSerializer::new(RequestKind::Sql, pool.clone(), tx.clone());
        let procedures = RequestSerializer::new(RequestKind::Procedure, pool.clone(), tx);

        Ok(Arc::new(Self {
            settings: settings.clone(),
            pool,
            sql,
            procedures,
            running: AtomicBool::new(false),
            escalations: Mutex::new(Some(rx)),
        }))
    }

    /// Start the pool, both serializers and the supervisor
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Database subsystem already running");
            return;
        }
        info!("Starting database subsystem");

        self.pool.start();
        self.sql.start();
        self.procedures.start();

        if let Some(rx) = self.escalations.lock().take() {
            tokio::spawn(supervise(Arc::downgrade(self), rx));
        }
    }

    /// Stop both serializers, then the pool
    ///
    /// Returns once both workers have exited, so a later `start` never runs
    /// two workers of the same kind.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("Database subsystem already stopped");
            return;
        }
        info!("Stopping database subsystem");

        self.sql.stop().await;
        self.procedures.stop().await;
        if self.pool.is_running() {
            self.pool.stop().await;
        }
        info!("Database subsystem stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn serializer(&self, kind: RequestKind) -> &Arc<RequestSerializer> {
        match kind {
            RequestKind::Sql => &self.sql,
            RequestKind::Procedure => &self.procedures,
        }
    }

    /// Run direct SQL through the SQL serializer
    pub async fn execute_sql(&self, operation: Operation, want_result: bool) -> std::result::Result<Option<QueryResult>, DbError> {
        self.sql.submit(operation, want_result).await
    }

    /// Call a stored procedure through the procedure serializer
    pub async fn call_procedure(&self, operation: Operation, want_result: bool) -> std::result::Result<Option<QueryResult>, DbError> {
        self.procedures.submit(operation, want_result).await
    }

    /// Check credentials with the configured boolean SQL function
    pub async fn verify_password(&self, username: &str, password: &str) -> std::result::Result<bool, DbError> {
        let operation = Operation::sql(format!("SELECT {}(?, ?)", self.settings.auth_function))
            .bind(username)
            .bind(password);

        let result = self.execute_sql(operation, true).await?;
        let verdict = result
            .as_ref()
            .and_then(|r| r.first_value())
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        Ok(verdict)
    }

    async fn handle(&self, escalation: Escalation) {
        match escalation {
            Escalation::FillerGaveUp { error } => {
                error!(error = %error, "Connection pool gave up, stopping database subsystem");
                self.stop().await;
            }
            Escalation::ExecutionFailed { kind, error } => {
                error!(kind = %kind, error = %error, "Fail-fast execution error, stopping database subsystem");
                self.stop().await;
            }
            Escalation::WorkerFatal { kind } => {
                if !self.is_running() {
                    return;
                }
                if self.settings.restart_on_fatal {
                    self.serializer(kind).restart().await;
                } else {
                    error!(kind = %kind, "Worker failure, stopping database subsystem");
                    self.stop().await;
                }
            }
        }
    }
}

async fn supervise(database: Weak<Database>, mut rx: mpsc::UnboundedReceiver<Escalation>) {
    while let Some(escalation) = rx.recv().await {
        let Some(database) = database.upgrade() else {
            break;
        };
        database.handle(escalation).await;
    }
}
