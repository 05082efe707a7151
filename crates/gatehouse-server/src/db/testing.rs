//! Scripted in-memory database used by tests

use super::connection::{Connector, DatabaseSession, QueryResult};
use super::error::DbError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct MockState {
    connects: AtomicUsize,
    closes: AtomicUsize,
    fail_connects: AtomicUsize,
    always_fail: AtomicBool,
    broken_epoch: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    executed: AtomicUsize,
}

pub struct MockConnector {
    state: Arc<MockState>,
    users: Arc<HashMap<String, String>>,
    connect_delay: Duration,
    query_delay: Duration,
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState::default()),
            users: Arc::new(HashMap::new()),
            connect_delay: Duration::ZERO,
            query_delay: Duration::ZERO,
        }
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn with_query_delay(mut self, delay: Duration) -> Self {
        self.query_delay = delay;
        self
    }

    pub fn with_user(mut self, username: &str, password: &str) -> Self {
        let mut users = (*self.users).clone();
        users.insert(username.to_string(), password.to_string());
        self.users = Arc::new(users);
        self
    }

    /// Fail the next `n` connect attempts
    pub fn fail_next_connects(&self, n: usize) {
        self.state.fail_connects.store(n, Ordering::SeqCst);
    }

    pub fn fail_all_connects(&self) {
        self.state.always_fail.store(true, Ordering::SeqCst);
    }

    /// Mark every session opened so far as broken
    pub fn break_sessions(&self) {
        self.state.broken_epoch.fetch_add(1, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> usize {
        self.state.executed.load(Ordering::SeqCst)
    }

    /// Highest number of statements seen running at the same time
    pub fn max_concurrent(&self) -> usize {
        self.state.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn DatabaseSession>, DbError> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if self.state.always_fail.load(Ordering::SeqCst) {
            return Err(DbError::Connect("connection refused".into()));
        }
        let remaining = self.state.fail_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.state.fail_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(DbError::Connect("connection refused".into()));
        }

        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            state: self.state.clone(),
            users: self.users.clone(),
            query_delay: self.query_delay,
            epoch: self.state.broken_epoch.load(Ordering::SeqCst),
        }))
    }

    fn target(&self) -> String {
        "mock://memory".into()
    }
}

struct MockSession {
    state: Arc<MockState>,
    users: Arc<HashMap<String, String>>,
    query_delay: Duration,
    epoch: usize,
}

impl MockSession {
    async fn track<F>(&self, work: F) -> Result<QueryResult, DbError>
    where
        F: FnOnce() -> Result<QueryResult, DbError>,
    {
        let _active = ActiveGuard::enter(&self.state);
        if !self.query_delay.is_zero() {
            tokio::time::sleep(self.query_delay).await;
        }
        let result = work();
        self.state.executed.fetch_add(1, Ordering::SeqCst);
        result
    }
}

/// Counts a statement as running until dropped, including when cancelled mid-sleep
struct ActiveGuard<'a> {
    state: &'a MockState,
}

impl<'a> ActiveGuard<'a> {
    fn enter(state: &'a MockState) -> Self {
        let now_active = state.active.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_active.fetch_max(now_active, Ordering::SeqCst);
        Self { state }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.state.active.fetch_sub(1, Ordering::SeqCst);
    }
}

fn single_cell(column: &str, value: impl Into<String>) -> QueryResult {
    QueryResult {
        columns: vec![column.to_string()],
        rows: vec![vec![Some(value.into())]],
        rows_affected: 0,
    }
}

#[async_trait]
impl DatabaseSession for MockSession {
    async fn query(&mut self, sql: &str, params: &[String]) -> Result<QueryResult, DbError> {
        if sql == "PANIC" {
            panic!("scripted worker panic");
        }
        let users = self.users.clone();
        self.track(|| {
            if sql.contains("verify_password") {
                let ok = match (params.first(), params.get(1)) {
                    (Some(user), Some(password)) => users.get(user) == Some(password),
                    _ => false,
                };
                return Ok(single_cell("ok", if ok { "1" } else { "0" }));
            }
            if sql.starts_with("FAIL") {
                return Err(DbError::Query("scripted failure".into()));
            }
            Ok(single_cell("echo", sql))
        })
        .await
    }

    async fn call_procedure(&mut self, name: &str, args: &[String]) -> Result<QueryResult, DbError> {
        self.track(|| {
            if name == "fail_proc" {
                return Err(DbError::Query("procedure raised an error".into()));
            }
            Ok(QueryResult {
                columns: vec!["procedure".into(), "args".into()],
                rows: vec![vec![Some(name.to_string()), Some(args.join(","))]],
                rows_affected: 0,
            })
        })
        .await
    }

    fn is_connected(&self) -> bool {
        self.epoch == self.state.broken_epoch.load(Ordering::SeqCst)
    }

    async fn close(self: Box<Self>) -> Result<(), DbError> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
