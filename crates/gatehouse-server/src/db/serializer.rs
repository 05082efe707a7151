//! Single-worker request queue for one kind of database operation
//!
//! Requests are executed one at a time in arrival order. The operation is the
//! request key: while an identical operation is still pending, a new caller
//! joins the existing entry and receives the same result.

use super::connection::{Operation, QueryResult};
use super::error::DbError;
use super::pool::{self, ConnectionPool};
use super::Escalation;
use crate::metrics;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

type Outcome = Result<QueryResult, DbError>;

/// Which operations a serializer accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Sql,
    Procedure,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Sql => "sql",
            RequestKind::Procedure => "procedure",
        }
    }

    fn accepts(&self, operation: &Operation) -> bool {
        matches!(
            (self, operation),
            (RequestKind::Sql, Operation::Sql { .. })
                | (RequestKind::Procedure, Operation::Procedure { .. })
        )
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Default)]
struct Pending {
    waiters: Vec<(u64, oneshot::Sender<Outcome>)>,
}

#[derive(Default)]
struct QueueState {
    order: VecDeque<Operation>,
    pending: HashMap<Operation, Pending>,
}

impl QueueState {
    fn next(&mut self) -> Option<(Operation, Pending)> {
        while let Some(op) = self.order.pop_front() {
            if let Some(pending) = self.pending.remove(&op) {
                return Some((op, pending));
            }
        }
        None
    }

    fn drain(&mut self) -> Vec<oneshot::Sender<Outcome>> {
        self.order.clear();
        self.pending
            .drain()
            .flat_map(|(_, pending)| pending.waiters.into_iter().map(|(_, tx)| tx))
            .collect()
    }
}

/// The running worker and the task watching it for panics
struct WorkerHandles {
    worker: AbortHandle,
    monitor: JoinHandle<()>,
}

pub struct RequestSerializer {
    kind: RequestKind,
    pool: Arc<ConnectionPool>,
    state: Mutex<QueueState>,
    work: Notify,
    running: AtomicBool,
    timeout: Duration,
    fail_fast: bool,
    next_waiter: AtomicU64,
    executions: AtomicU64,
    escalations: mpsc::UnboundedSender<Escalation>,
    worker: Mutex<Option<WorkerHandles>>,
}

impl RequestSerializer {
    pub fn new(
        kind: RequestKind,
        pool: Arc<ConnectionPool>,
        escalations: mpsc::UnboundedSender<Escalation>,
    ) -> Arc<Self> {
        let timeout = pool.config().timeout;
        let fail_fast = pool.config().fail_fast;
        Arc::new(Self {
            kind,
            pool,
            state: Mutex::new(QueueState::default()),
            work: Notify::new(),
            running: AtomicBool::new(false),
            timeout,
            fail_fast,
            next_waiter: AtomicU64::new(1),
            executions: AtomicU64::new(0),
            escalations,
            worker: Mutex::new(None),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Launch the worker
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!(kind = %self.kind, "Request serializer already running");
            return;
        }
        info!(kind = %self.kind, "Starting request serializer");
        self.launch();
    }

    fn launch(self: &Arc<Self>) {
        let worker = tokio::spawn(self.clone().run_worker());
        let worker_abort = worker.abort_handle();
        let monitor_target = Arc::downgrade(self);
        let kind = self.kind;
        let escalations = self.escalations.clone();

        // The monitor owns the worker handle so a panic surfaces as an escalation.
        let monitor = tokio::spawn(async move {
            match worker.await {
                Ok(()) => {}
                Err(e) if e.is_panic() => {
                    error!(kind = %kind, "Request worker panicked");
                    if monitor_target.upgrade().is_some() {
                        let _ = escalations.send(Escalation::WorkerFatal { kind });
                    }
                }
                Err(_) => debug!(kind = %kind, "Request worker cancelled"),
            }
        });
        let previous = self.worker.lock().replace(WorkerHandles {
            worker: worker_abort,
            monitor,
        });
        if let Some(previous) = previous {
            previous.worker.abort();
            previous.monitor.abort();
        }
    }

    /// End the current worker and wait until it is gone
    ///
    /// An operation in flight is cancelled; its waiters see `Interrupted`.
    async fn halt_worker(&self) {
        let handles = self.worker.lock().take();
        if let Some(handles) = handles {
            handles.worker.abort();
            // the monitor returns only once the worker task has ended
            let _ = handles.monitor.await;
        }
    }

    /// Fail every waiter with `Interrupted` and relaunch the worker
    pub async fn restart(self: &Arc<Self>) {
        self.halt_worker().await;

        let interrupted = self.state.lock().drain();
        let count = interrupted.len();
        for tx in interrupted {
            let _ = tx.send(Err(DbError::Interrupted));
        }
        warn!(kind = %self.kind, interrupted = count, "Restarting request serializer");

        if self.is_running() {
            self.launch();
        }
    }

    /// Stop accepting work, end the worker and fail every waiter with `Stopped`
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!(kind = %self.kind, "Request serializer already stopped");
            return;
        }
        info!(kind = %self.kind, "Stopping request serializer");
        self.work.notify_one();
        self.halt_worker().await;

        let stranded = self.state.lock().drain();
        for tx in stranded {
            let _ = tx.send(Err(DbError::Stopped));
        }
        metrics::set_pending(self.kind.as_str(), 0);
    }

    /// Queue an operation and, when `want_result`, wait for its outcome
    ///
    /// Fire-and-forget submissions return `Ok(None)` as soon as they are queued.
    pub async fn submit(&self, operation: Operation, want_result: bool) -> Result<Option<QueryResult>, DbError> {
        if !self.kind.accepts(&operation) {
            return Err(DbError::InvalidRequest(format!(
                "{} serializer cannot run {}",
                self.kind, operation
            )));
        }
        if !self.is_running() {
            return Err(DbError::Stopped);
        }

        let (waiter_id, rx) = {
            let mut state = self.state.lock();
            let pending_len = state.pending.len();
            let entry = match state.pending.entry(operation.clone()) {
                std::collections::hash_map::Entry::Occupied(entry) => {
                    debug!(kind = %self.kind, "Joining identical pending request");
                    entry.into_mut()
                }
                std::collections::hash_map::Entry::Vacant(entry) => {
                    metrics::set_pending(self.kind.as_str(), pending_len + 1);
                    entry.insert(Pending::default())
                }
            };
            let waiter = if want_result {
                let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel();
                entry.waiters.push((id, tx));
                Some((id, rx))
            } else {
                None
            };
            if pending_len < state.pending.len() {
                state.order.push_back(operation.clone());
            }
            match waiter {
                Some(w) => w,
                None => {
                    drop(state);
                    self.work.notify_one();
                    return Ok(None);
                }
            }
        };
        self.work.notify_one();

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(outcome)) => outcome.map(Some),
            Ok(Err(_)) => Err(DbError::Interrupted),
            Err(_) => {
                self.remove_waiter(&operation, waiter_id);
                metrics::record_wait_timeout(self.kind.as_str());
                warn!(
                    kind = %self.kind,
                    operation = %operation,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Timed out waiting for database result"
                );
                Err(DbError::WaitTimeout(self.timeout.as_millis() as u64))
            }
        }
    }

    fn remove_waiter(&self, operation: &Operation, waiter_id: u64) {
        let mut state = self.state.lock();
        if let Some(pending) = state.pending.get_mut(operation) {
            pending.waiters.retain(|(id, _)| *id != waiter_id);
        }
    }

    /// Waiters registered on pending entries
    pub fn waiter_count(&self) -> usize {
        self.state.lock().pending.values().map(|p| p.waiters.len()).sum()
    }

    /// Operations executed since construction
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    // ═══════════════════════════════════════════════════════════════════
    // WORKER
    // ═══════════════════════════════════════════════════════════════════

    async fn run_worker(self: Arc<Self>) {
        debug!(kind = %self.kind, "Request worker started");
        loop {
            let notified = self.work.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_running() {
                break;
            }

            let next = {
                let mut state = self.state.lock();
                let next = state.next();
                metrics::set_pending(self.kind.as_str(), state.pending.len());
                next
            };
            match next {
                Some((operation, pending)) => self.process(operation, pending).await,
                None => notified.await,
            }
        }
        debug!(kind = %self.kind, "Request worker exited");
    }

    async fn process(&self, operation: Operation, pending: Pending) {
        let started = Instant::now();
        let outcome = self.execute(&operation).await;
        self.executions.fetch_add(1, Ordering::Relaxed);

        let status = if outcome.is_ok() { "ok" } else { "error" };
        metrics::record_execution(self.kind.as_str(), status, started.elapsed().as_secs_f64());

        for (_, tx) in pending.waiters {
            let _ = tx.send(outcome.clone());
        }

        if let Err(e) = outcome {
            error!(
                kind = %self.kind,
                operation = %operation,
                error = %e,
                "Database operation failed"
            );
            // waiters are served before escalating; the supervisor may abort this worker
            if self.fail_fast {
                let _ = self.escalations.send(Escalation::ExecutionFailed {
                    kind: self.kind,
                    error: e,
                });
            }
        }
    }

    async fn execute(&self, operation: &Operation) -> Outcome {
        let mut conn = pool::borrow(&self.pool).await?;
        let outcome = conn.execute(operation).await;
        self.pool.store_connection(conn).await;
        outcome
    }
}

impl Drop for RequestSerializer {
    fn drop(&mut self) {
        if let Some(handles) = self.worker.get_mut().take() {
            handles.worker.abort();
            handles.monitor.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::PoolConfig;
    use crate::db::testing::MockConnector;

    struct Harness {
        connector: Arc<MockConnector>,
        pool: Arc<ConnectionPool>,
        serializer: Arc<RequestSerializer>,
        escalations: mpsc::UnboundedReceiver<Escalation>,
    }

    fn harness(kind: RequestKind, connector: MockConnector, timeout: Duration, fail_fast: bool) -> Harness {
        let connector = Arc::new(connector);
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = ConnectionPool::new(
            PoolConfig {
                min: 1,
                target: 2,
                max: 4,
                timeout,
                fail_fast,
            },
            connector.clone(),
            tx.clone(),
        );
        pool.start();
        let serializer = RequestSerializer::new(kind, pool.clone(), tx);
        serializer.start();
        Harness {
            connector,
            pool,
            serializer,
            escalations: rx,
        }
    }

    #[tokio::test]
    async fn test_submit_returns_result() {
        let h = harness(RequestKind::Sql, MockConnector::new(), Duration::from_secs(2), false);
        let result = h
            .serializer
            .submit(Operation::sql("SELECT 1"), true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.first_value(), Some("SELECT 1"));
        assert_eq!(h.serializer.waiter_count(), 0);
        h.serializer.stop().await;
        h.pool.stop().await;
    }

    #[tokio::test]
    async fn test_rejects_wrong_kind() {
        let h = harness(RequestKind::Procedure, MockConnector::new(), Duration::from_secs(1), false);
        let err = h.serializer.submit(Operation::sql("SELECT 1"), true).await.unwrap_err();
        assert!(matches!(err, DbError::InvalidRequest(_)));
        h.serializer.stop().await;
        h.pool.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_executions_never_overlap() {
        let h = harness(
            RequestKind::Sql,
            MockConnector::new().with_query_delay(Duration::from_millis(10)),
            Duration::from_secs(5),
            false,
        );

        let mut handles = Vec::new();
        for i in 0..8 {
            let serializer = h.serializer.clone();
            handles.push(tokio::spawn(async move {
                serializer.submit(Operation::sql(format!("SELECT {}", i)), true).await
            }));
        }
        for handle in handles {
            let result = handle.await.unwrap().unwrap().unwrap();
            assert!(result.first_value().unwrap().starts_with("SELECT"));
        }

        assert_eq!(h.connector.max_concurrent(), 1);
        assert_eq!(h.serializer.executions(), 8);
        h.serializer.stop().await;
        h.pool.stop().await;
    }

    #[tokio::test]
    async fn test_identical_requests_share_one_execution() {
        let h = harness(
            RequestKind::Procedure,
            MockConnector::new().with_query_delay(Duration::from_millis(50)),
            Duration::from_secs(5),
            false,
        );

        // occupy the worker so the next two submissions queue up together
        let blocker = {
            let serializer = h.serializer.clone();
            tokio::spawn(async move {
                serializer
                    .submit(Operation::procedure("warm_up", vec![]), true)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let op = Operation::procedure("timetable", vec!["4a".into(), "mon".into()]);
        let (a, b) = tokio::join!(
            h.serializer.submit(op.clone(), true),
            h.serializer.submit(op.clone(), true)
        );
        blocker.await.unwrap().unwrap();

        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(h.serializer.executions(), 2);
        h.serializer.stop().await;
        h.pool.stop().await;
    }

    #[tokio::test]
    async fn test_fire_and_forget_returns_immediately() {
        let h = harness(
            RequestKind::Procedure,
            MockConnector::new().with_query_delay(Duration::from_millis(50)),
            Duration::from_secs(5),
            false,
        );

        let started = Instant::now();
        let result = h
            .serializer
            .submit(Operation::procedure("log_visit", vec!["alice".into()]), false)
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(started.elapsed() < Duration::from_millis(40));

        for _ in 0..50 {
            if h.connector.executed() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.connector.executed(), 1);
        h.serializer.stop().await;
        h.pool.stop().await;
    }

    #[tokio::test]
    async fn test_wait_timeout_removes_waiter() {
        // the worker stays busy past the queued waiter's deadline
        let h = harness(
            RequestKind::Sql,
            MockConnector::new().with_query_delay(Duration::from_millis(300)),
            Duration::from_millis(150),
            false,
        );

        let blocker = {
            let serializer = h.serializer.clone();
            tokio::spawn(async move { serializer.submit(Operation::sql("SELECT slow"), true).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = h
            .serializer
            .submit(Operation::sql("SELECT queued"), true)
            .await
            .unwrap_err();
        assert_eq!(err, DbError::WaitTimeout(150));
        assert_eq!(h.serializer.waiter_count(), 0);

        let _ = blocker.await;
        h.serializer.stop().await;
        h.pool.stop().await;
    }

    #[tokio::test]
    async fn test_execution_error_reaches_caller() {
        let h = harness(RequestKind::Sql, MockConnector::new(), Duration::from_secs(2), false);
        let err = h
            .serializer
            .submit(Operation::sql("FAIL please"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Query(_)));
        h.serializer.stop().await;
        h.pool.stop().await;
    }

    #[tokio::test]
    async fn test_fail_fast_escalates_execution_error() {
        let mut h = harness(RequestKind::Sql, MockConnector::new(), Duration::from_secs(2), true);
        let _ = h.serializer.submit(Operation::sql("FAIL now"), true).await;

        let escalation = tokio::time::timeout(Duration::from_secs(1), h.escalations.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            escalation,
            Escalation::ExecutionFailed { kind: RequestKind::Sql, .. }
        ));
        h.serializer.stop().await;
        h.pool.stop().await;
    }

    #[tokio::test]
    async fn test_worker_panic_escalates_and_restart_recovers() {
        let mut h = harness(RequestKind::Sql, MockConnector::new(), Duration::from_secs(2), false);

        let panicking = {
            let serializer = h.serializer.clone();
            tokio::spawn(async move { serializer.submit(Operation::sql("PANIC"), true).await })
        };

        let escalation = tokio::time::timeout(Duration::from_secs(1), h.escalations.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(escalation, Escalation::WorkerFatal { kind: RequestKind::Sql }));
        // the waiter's sender was dropped with the panicking task
        assert_eq!(panicking.await.unwrap().unwrap_err(), DbError::Interrupted);

        h.serializer.restart().await;
        let result = h
            .serializer
            .submit(Operation::sql("SELECT after"), true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.first_value(), Some("SELECT after"));
        h.serializer.stop().await;
        h.pool.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_restart_while_busy_keeps_single_worker() {
        let h = harness(
            RequestKind::Sql,
            MockConnector::new().with_query_delay(Duration::from_millis(100)),
            Duration::from_secs(5),
            false,
        );

        let in_flight = {
            let serializer = h.serializer.clone();
            tokio::spawn(async move { serializer.submit(Operation::sql("SELECT slow"), true).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        h.serializer.restart().await;
        assert_eq!(in_flight.await.unwrap().unwrap_err(), DbError::Interrupted);

        let mut handles = Vec::new();
        for i in 0..4 {
            let serializer = h.serializer.clone();
            handles.push(tokio::spawn(async move {
                serializer.submit(Operation::sql(format!("SELECT {}", i)), true).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().unwrap().is_some());
        }
        assert_eq!(h.connector.max_concurrent(), 1);
        h.serializer.stop().await;
        h.pool.stop().await;
    }

    #[tokio::test]
    async fn test_stop_then_start_runs_one_worker() {
        let h = harness(
            RequestKind::Sql,
            MockConnector::new().with_query_delay(Duration::from_millis(10)),
            Duration::from_secs(5),
            false,
        );
        h.serializer.stop().await;
        h.serializer.start();

        let (a, b, c) = tokio::join!(
            h.serializer.submit(Operation::sql("SELECT a"), true),
            h.serializer.submit(Operation::sql("SELECT b"), true),
            h.serializer.submit(Operation::sql("SELECT c"), true)
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(h.connector.max_concurrent(), 1);
        h.serializer.stop().await;
        h.pool.stop().await;
    }

    #[tokio::test]
    async fn test_stop_fails_waiters_and_rejects_new_work() {
        let h = harness(
            RequestKind::Sql,
            MockConnector::new().with_query_delay(Duration::from_millis(200)),
            Duration::from_secs(5),
            false,
        );

        let blocker = {
            let serializer = h.serializer.clone();
            tokio::spawn(async move { serializer.submit(Operation::sql("SELECT slow"), true).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let queued = {
            let serializer = h.serializer.clone();
            tokio::spawn(async move { serializer.submit(Operation::sql("SELECT queued"), true).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        h.serializer.stop().await;
        assert_eq!(queued.await.unwrap().unwrap_err(), DbError::Stopped);
        assert_eq!(
            h.serializer.submit(Operation::sql("SELECT 1"), true).await.unwrap_err(),
            DbError::Stopped
        );
        let _ = blocker.await;
        h.pool.stop().await;
    }
}
