//! Elastic pool of idle database connections
//!
//! A background filler keeps the idle set at `target` connections. Borrowing
//! removes a connection from the set, so a connection is never handed to two
//! callers. Returned connections are kept only while the set is below `max`
//! and the connection is still alive.
//!
//! ```text
//! filler ──open──► [idle: VecDeque] ──get_connection──► borrower
//!    ▲                    ▲                                 │
//!    └──── refill ◄───────┴──────── store_connection ◄──────┘
//! ```

use super::connection::{Connector, SingleConnection};
use super::error::DbError;
use super::Escalation;
use crate::metrics;
use gatehouse_common::DatabaseSettings;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

// ═══════════════════════════════════════════════════════════════════════════
// CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════

/// Consecutive connect failures after which the filler gives up
const MAX_CONSECUTIVE_FAILURES: u32 = 2;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min: usize,
    pub target: usize,
    pub max: usize,
    /// Connect timeout, borrow wait and retry backoff
    pub timeout: Duration,
    /// Give up on the first connect failure
    pub fail_fast: bool,
}

impl PoolConfig {
    pub fn from_settings(settings: &DatabaseSettings) -> Self {
        Self {
            min: settings.min_connections,
            target: settings.target_connections,
            max: settings.max_connections,
            timeout: settings.timeout(),
            fail_fast: settings.fail_fast,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CONNECTION POOL
// ═══════════════════════════════════════════════════════════════════════════

pub struct ConnectionPool {
    config: PoolConfig,
    connector: Arc<dyn Connector>,

    /// Idle connections, head is handed out first
    idle: Mutex<VecDeque<SingleConnection>>,

    /// Wakes the filler when a connection was consumed
    refill: Notify,

    /// Wakes borrowers waiting on an empty pool
    returned: Notify,

    running: AtomicBool,
    escalations: mpsc::UnboundedSender<Escalation>,
    filler: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    pub fn new(
        config: PoolConfig,
        connector: Arc<dyn Connector>,
        escalations: mpsc::UnboundedSender<Escalation>,
    ) -> Arc<Self> {
        Arc::new(Self {
            idle: Mutex::new(VecDeque::with_capacity(config.max)),
            config,
            connector,
            refill: Notify::new(),
            returned: Notify::new(),
            running: AtomicBool::new(false),
            escalations,
            filler: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn idle_len(&self) -> usize {
        self.idle.lock().len()
    }

    /// Launch the filler
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Connection pool already running");
            return;
        }
        info!(
            min = self.config.min,
            target = self.config.target,
            max = self.config.max,
            target_db = %self.connector.target(),
            "Starting connection pool"
        );
        let handle = tokio::spawn(self.clone().run_filler());
        *self.filler.lock() = Some(handle);
    }

    /// Disable the filler, release blocked borrowers, disconnect idle connections
    pub async fn stop(&self) {
        self.halt(true).await;
    }

    async fn halt(&self, abort_filler: bool) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("Connection pool already stopped");
            return;
        }
        info!("Stopping connection pool");

        self.refill.notify_one();
        self.returned.notify_waiters();
        let filler = self.filler.lock().take();
        if abort_filler {
            if let Some(handle) = filler {
                handle.abort();
            }
        }

        let drained: Vec<SingleConnection> = self.idle.lock().drain(..).collect();
        metrics::set_pool_idle(0);
        let count = drained.len();
        for mut conn in drained {
            conn.disconnect().await;
        }
        info!(disconnected = count, "Connection pool stopped");
    }

    // ═══════════════════════════════════════════════════════════════════
    // BORROW / RETURN
    // ═══════════════════════════════════════════════════════════════════

    /// Borrow a connection
    ///
    /// With `wait`, an empty pool is waited on for up to the pool timeout.
    pub async fn get_connection(&self, wait: bool) -> Option<SingleConnection> {
        if let Some(conn) = self.take_idle() {
            return Some(conn);
        }
        if !wait || !self.is_running() {
            return None;
        }

        let deadline = tokio::time::Instant::now() + self.config.timeout;
        loop {
            let notified = self.returned.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(conn) = self.take_idle() {
                return Some(conn);
            }
            if !self.is_running() {
                return None;
            }
            self.refill.notify_one();

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let last_try = self.take_idle();
                if last_try.is_none() {
                    debug!(
                        wait_ms = self.config.timeout.as_millis() as u64,
                        "No pooled connection became available"
                    );
                }
                return last_try;
            }
        }
    }

    fn take_idle(&self) -> Option<SingleConnection> {
        let (conn, remaining) = {
            let mut idle = self.idle.lock();
            let conn = idle.pop_front()?;
            (conn, idle.len())
        };
        metrics::set_pool_idle(remaining);
        if remaining <= self.config.min {
            self.refill.notify_one();
        }
        Some(conn)
    }

    /// Return a borrowed connection
    ///
    /// Over-capacity or dead connections are disconnected instead of kept.
    pub async fn store_connection(&self, conn: SingleConnection) {
        let rejected = {
            let mut idle = self.idle.lock();
            if self.is_running() && idle.len() < self.config.max && conn.is_connected() {
                idle.push_back(conn);
                metrics::set_pool_idle(idle.len());
                None
            } else {
                Some(conn)
            }
        };

        match rejected {
            None => self.returned.notify_one(),
            Some(mut conn) => {
                debug!(connection_id = conn.id(), "Discarding returned connection");
                conn.disconnect().await;
                self.refill.notify_one();
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // FILLER
    // ═══════════════════════════════════════════════════════════════════

    async fn run_filler(self: Arc<Self>) {
        let mut consecutive_failures = 0u32;

        while self.is_running() {
            if self.idle_len() >= self.config.target {
                self.refill.notified().await;
                continue;
            }

            match SingleConnection::open(self.connector.clone(), self.config.timeout).await {
                Ok(conn) => {
                    consecutive_failures = 0;
                    if let Some(mut surplus) = self.offer_filled(conn) {
                        surplus.disconnect().await;
                    }
                }
                Err(e) => {
                    consecutive_failures += 1;
                    metrics::record_pool_connect_failure();
                    error!(
                        error = %e,
                        consecutive_failures,
                        target_db = %self.connector.target(),
                        "Failed to open database connection"
                    );

                    if self.config.fail_fast || consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        error!("Connection filler giving up, stopping the pool");
                        self.halt(false).await;
                        let _ = self.escalations.send(Escalation::FillerGaveUp { error: e });
                        return;
                    }
                    tokio::time::sleep(self.config.timeout).await;
                }
            }
        }
        debug!("Connection filler exited");
    }

    /// Add a freshly opened connection unless that would overshoot `target`
    fn offer_filled(&self, conn: SingleConnection) -> Option<SingleConnection> {
        let mut idle = self.idle.lock();
        if self.is_running() && idle.len() < self.config.target {
            idle.push_back(conn);
            metrics::set_pool_idle(idle.len());
            drop(idle);
            self.returned.notify_one();
            None
        } else {
            Some(conn)
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        if let Some(handle) = self.filler.get_mut().take() {
            handle.abort();
        }
    }
}

/// Borrow outcome helper for callers that need an error rather than `None`
pub async fn borrow(pool: &ConnectionPool) -> Result<SingleConnection, DbError> {
    if !pool.is_running() {
        return Err(DbError::Stopped);
    }
    pool.get_connection(true).await.ok_or(DbError::NoConnection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::MockConnector;

    fn config(min: usize, target: usize, max: usize) -> PoolConfig {
        PoolConfig {
            min,
            target,
            max,
            timeout: Duration::from_millis(100),
            fail_fast: false,
        }
    }

    async fn wait_for_idle(pool: &ConnectionPool, expected: usize) {
        for _ in 0..100 {
            if pool.idle_len() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pool never reached {} idle connections (has {})", expected, pool.idle_len());
    }

    #[tokio::test]
    async fn test_filler_reaches_target_without_overshoot() {
        let connector = Arc::new(MockConnector::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let pool = ConnectionPool::new(config(1, 3, 5), connector.clone(), tx);
        pool.start();

        wait_for_idle(&pool, 3).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.idle_len(), 3);
        assert_eq!(connector.connects(), 3);

        pool.stop().await;
        assert_eq!(connector.closes(), 3);
    }

    #[tokio::test]
    async fn test_borrow_wakes_filler_at_min() {
        let connector = Arc::new(MockConnector::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let pool = ConnectionPool::new(config(2, 3, 4), connector.clone(), tx);
        pool.start();
        wait_for_idle(&pool, 3).await;

        let a = pool.get_connection(false).await.unwrap();
        let b = pool.get_connection(false).await.unwrap();
        assert_ne!(a.id(), b.id());

        // the filler tops the idle set back up to target
        wait_for_idle(&pool, 3).await;
        assert_eq!(connector.connects(), 5);

        pool.store_connection(a).await;
        assert_eq!(pool.idle_len(), 4);
        // at max: the extra connection is disconnected instead of kept
        pool.store_connection(b).await;
        assert_eq!(pool.idle_len(), 4);
        assert_eq!(connector.closes(), 1);

        pool.stop().await;
    }

    #[tokio::test]
    async fn test_idle_never_exceeds_max() {
        let connector = Arc::new(MockConnector::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let pool = ConnectionPool::new(config(0, 0, 2), connector.clone(), tx);
        pool.start();

        for _ in 0..6 {
            let conn = SingleConnection::open(connector.clone(), Duration::from_secs(1))
                .await
                .unwrap();
            pool.store_connection(conn).await;
            assert!(pool.idle_len() <= 2);
        }
        assert_eq!(pool.idle_len(), 2);
        assert_eq!(connector.closes(), 4);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_dead_connection_is_not_retained() {
        let connector = Arc::new(MockConnector::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let pool = ConnectionPool::new(config(0, 0, 4), connector.clone(), tx);
        pool.start();

        let conn = SingleConnection::open(connector.clone(), Duration::from_secs(1))
            .await
            .unwrap();
        connector.break_sessions();
        pool.store_connection(conn).await;
        assert_eq!(pool.idle_len(), 0);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_empty_pool_wait_times_out() {
        let connector = Arc::new(MockConnector::new());
        connector.fail_all_connects();
        let (tx, _rx) = mpsc::unbounded_channel();
        let pool = ConnectionPool::new(config(0, 0, 1), connector.clone(), tx);
        pool.start();

        assert!(pool.get_connection(false).await.is_none());

        let started = std::time::Instant::now();
        assert!(pool.get_connection(true).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(90));
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_waiting_borrower_gets_returned_connection() {
        let connector = Arc::new(MockConnector::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let pool = ConnectionPool::new(
            PoolConfig {
                timeout: Duration::from_secs(2),
                ..config(0, 0, 1)
            },
            connector.clone(),
            tx,
        );
        pool.start();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get_connection(true).await.map(|c| c.id()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let conn = SingleConnection::open(connector.clone(), Duration::from_secs(1))
            .await
            .unwrap();
        let id = conn.id();
        pool.store_connection(conn).await;

        assert_eq!(waiter.await.unwrap(), Some(id));
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_stop_releases_blocked_borrowers() {
        let connector = Arc::new(MockConnector::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let pool = ConnectionPool::new(
            PoolConfig {
                timeout: Duration::from_secs(10),
                ..config(0, 0, 1)
            },
            connector.clone(),
            tx,
        );
        pool.start();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get_connection(true).await.is_some() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        pool.stop().await;
        assert!(!waiter.await.unwrap());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(matches!(borrow(&pool).await, Err(DbError::Stopped)));
    }

    #[tokio::test]
    async fn test_filler_gives_up_after_second_failure() {
        let connector = Arc::new(MockConnector::new());
        connector.fail_all_connects();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pool = ConnectionPool::new(config(1, 2, 3), connector.clone(), tx);
        pool.start();

        let escalation = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(escalation, Escalation::FillerGaveUp { .. }));
        assert!(!pool.is_running());
    }

    #[tokio::test]
    async fn test_filler_recovers_from_single_failure() {
        let connector = Arc::new(MockConnector::new());
        connector.fail_next_connects(1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pool = ConnectionPool::new(config(0, 1, 1), connector.clone(), tx);
        pool.start();

        wait_for_idle(&pool, 1).await;
        assert!(pool.is_running());
        assert!(rx.try_recv().is_err());
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_fail_fast_gives_up_immediately() {
        let connector = Arc::new(MockConnector::new());
        connector.fail_next_connects(1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pool = ConnectionPool::new(
            PoolConfig {
                fail_fast: true,
                ..config(0, 1, 1)
            },
            connector.clone(),
            tx,
        );
        pool.start();

        let escalation = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert!(escalation.is_some());
        assert!(!pool.is_running());
    }
}
