//! TLS listener with admission control and flood protection
//!
//! ```text
//!            ┌────────────── accept loop ───────────────┐
//! client ──► │ purge stale ─► admission ─► accept ─► flood check │
//!            └───────────────────────┬───────────────────┬──────┘
//!                                    │ admitted          │ flooding
//!                                    ▼                   ▼
//!                        TLS handshake + Session   TLS handshake + ERR>>DDOS
//! ```
//!
//! The accept loop never waits on a client. Handshakes, sessions and flood
//! rejections all run on their own tasks.

pub mod admission;
pub mod flood;
pub mod socket;

use crate::db::{Database, ProcedureRegistry};
use crate::metrics;
use crate::protocol;
use crate::session::{Session, SessionContext};
use admission::{Admission, AdmissionPermit};
use flood::FloodGuard;
use gatehouse_common::{GatehouseError, ListenerSettings, Result, TlsConfig};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Bound on the whole flood rejection (handshake, token, close)
const FLOOD_REJECT_DEADLINE: Duration = Duration::from_secs(2);

/// Bound on joining the accept loop during stop
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerState {
    Idle,
    Running,
    Stopped,
}

pub struct Listener {
    settings: ListenerSettings,
    tls: TlsConfig,
    context: Arc<SessionContext>,
    admission: Arc<Admission>,
    flood: Arc<FloodGuard>,
    shutdown: watch::Sender<bool>,
    state: Mutex<ListenerState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Listener {
    pub fn new(
        settings: ListenerSettings,
        tls: TlsConfig,
        database: Arc<Database>,
        registry: Option<Arc<ProcedureRegistry>>,
    ) -> Self {
        let context = Arc::new(SessionContext {
            database,
            registry,
            read_timeout: settings.read_timeout(),
            max_line_bytes: settings.max_line_bytes,
            loopback_is_root: settings.loopback_is_root,
        });
        let (shutdown, _) = watch::channel(false);

        Self {
            admission: Admission::new(settings.max_connections),
            flood: Arc::new(FloodGuard::new(settings.flood_threshold, settings.flood_window())),
            settings,
            tls,
            context,
            shutdown,
            state: Mutex::new(ListenerState::Idle),
            worker: Mutex::new(None),
        }
    }

    /// Bind the TLS port and launch the accept loop
    ///
    /// Returns the bound address (useful when the configured port is 0).
    pub async fn start(&self) -> Result<SocketAddr> {
        {
            let state = self.state.lock();
            if *state != ListenerState::Idle {
                return Err(GatehouseError::internal(format!(
                    "listener cannot start from state {:?}",
                    *state
                )));
            }
        }

        let bind = (self.settings.bind_address.as_str(), self.settings.port);
        let listener = TcpListener::bind(bind).await.map_err(|e| {
            GatehouseError::Io(format!(
                "cannot bind {}:{}: {}",
                self.settings.bind_address, self.settings.port, e
            ))
        })?;
        let addr = listener.local_addr()?;

        let accept_loop = AcceptLoop {
            listener,
            acceptor: self.tls.acceptor(),
            context: self.context.clone(),
            admission: self.admission.clone(),
            flood: self.flood.clone(),
            keepalive_secs: self.settings.tcp_keepalive_secs,
            handshake_timeout: self.settings.read_timeout(),
            shutdown: self.shutdown.subscribe(),
        };

        *self.state.lock() = ListenerState::Running;
        *self.worker.lock() = Some(tokio::spawn(accept_loop.run()));

        info!(
            addr = %addr,
            max_connections = self.settings.max_connections,
            flood_threshold = self.settings.flood_threshold,
            "Listening for TLS clients"
        );
        Ok(addr)
    }

    /// Stop accepting, end sessions, then stop the database subsystem
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state == ListenerState::Stopped {
                warn!("Listener already stopped");
                return;
            }
            *state = ListenerState::Stopped;
        }
        info!("Stopping listener");

        self.shutdown.send_replace(true);
        self.admission.close();

        let worker = self.worker.lock().take();
        if let Some(mut handle) = worker {
            if tokio::time::timeout(STOP_JOIN_TIMEOUT, &mut handle).await.is_err() {
                warn!("Accept loop did not exit in time, aborting it");
                handle.abort();
            }
        }

        self.context.database.stop().await;
        info!("Listener stopped");
    }

    pub fn is_running(&self) -> bool {
        *self.state.lock() == ListenerState::Running
    }

    /// Sessions currently holding an admission slot
    pub fn active_sessions(&self) -> usize {
        self.admission.active()
    }
}

/// Resolves once shutdown is signalled; never resolves if the sender is gone
pub(crate) async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

struct AcceptLoop {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    context: Arc<SessionContext>,
    admission: Arc<Admission>,
    flood: Arc<FloodGuard>,
    keepalive_secs: u64,
    handshake_timeout: Duration,
    shutdown: watch::Receiver<bool>,
}

impl AcceptLoop {
    async fn run(mut self) {
        loop {
            let purged = self.flood.purge_stale();
            if purged > 0 {
                debug!(purged, "Purged stale flood entries");
            }

            let permit = tokio::select! {
                permit = self.admission.acquire() => match permit {
                    Some(permit) => permit,
                    None => break,
                },
                _ = shutdown_requested(&mut self.shutdown) => break,
            };

            let (stream, peer) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        drop(permit);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        continue;
                    }
                },
                _ = shutdown_requested(&mut self.shutdown) => break,
            };

            socket::configure_client_socket(&stream, self.keepalive_secs);

            if let Err(e) = self.flood.check(peer.ip()).into_result(peer.ip()) {
                drop(permit);
                metrics::record_connection("flood_rejected");
                debug!(peer = %peer, code = e.code(), error = %e, "Rejecting flooding peer");
                tokio::spawn(reject_flood(stream, self.acceptor.clone(), peer));
                continue;
            }

            metrics::record_connection("accepted");
            debug!(peer = %peer, active = self.admission.active(), "Accepted connection");

            let acceptor = self.acceptor.clone();
            let context = self.context.clone();
            let shutdown = self.shutdown.clone();
            let handshake_timeout = self.handshake_timeout;
            tokio::spawn(async move {
                if let Err(e) =
                    serve_connection(stream, peer, acceptor, permit, context, shutdown, handshake_timeout).await
                {
                    if e.is_session_scoped() {
                        debug!(peer = %peer, code = e.code(), error = %e, "Connection dropped");
                    } else {
                        warn!(peer = %peer, code = e.code(), error = %e, "Connection failed");
                    }
                }
            });
        }
        info!("Accept loop exited");
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    permit: AdmissionPermit,
    context: Arc<SessionContext>,
    shutdown: watch::Receiver<bool>,
    handshake_timeout: Duration,
) -> Result<()> {
    let tls_stream = match tokio::time::timeout(handshake_timeout, acceptor.accept(stream)).await {
        Ok(Ok(tls_stream)) => tls_stream,
        Ok(Err(e)) => {
            metrics::record_connection("handshake_failed");
            return Err(if socket::is_disconnect_error(&e) {
                GatehouseError::from(e)
            } else {
                GatehouseError::TlsError(e.to_string())
            });
        }
        Err(_) => {
            metrics::record_connection("handshake_failed");
            return Err(GatehouseError::TlsError(format!(
                "handshake not finished within {} ms",
                handshake_timeout.as_millis()
            )));
        }
    };

    Session::new(tls_stream, peer, Some(permit), context, shutdown)
        .run()
        .await;
    Ok(())
}

/// Complete the handshake just far enough to tell the peer why it is dropped
async fn reject_flood(stream: TcpStream, acceptor: TlsAcceptor, peer: SocketAddr) {
    let reject = async {
        let mut tls_stream = acceptor.accept(stream).await?;
        tls_stream
            .write_all(format!("{}\n", protocol::FLOOD_REJECTED).as_bytes())
            .await?;
        tls_stream.shutdown().await
    };

    match tokio::time::timeout(FLOOD_REJECT_DEADLINE, reject).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(peer = %peer, error = %e, "Flood rejection not delivered"),
        Err(_) => debug!(peer = %peer, "Flood rejection timed out"),
    }
}
