//! Per-client protocol state machine
//!
//! ```text
//! Connecting ──► Authenticating ──► Serving ──► Closing ──► Closed
//!                      │                           ▲
//!                      └───────────────────────────┘
//! ```
//!
//! Loopback peers are granted root without a challenge. Everyone else sends
//! one `AUTH` line, checked against the database. While serving, each line is
//! one command; any unknown command, execution failure, idle timeout or
//! shutdown ends the session.

use crate::db::mysql::is_identifier;
use crate::db::{Database, DbError, Operation, ProcedureRegistry, QueryResult};
use crate::listener::admission::AdmissionPermit;
use crate::listener::shutdown_requested;
use crate::listener::socket::is_disconnect_error;
use crate::metrics;
use crate::protocol::{self, AuthRequest, Command, Principal};
use gatehouse_common::GatehouseError;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared, read-only inputs for every session
pub struct SessionContext {
    pub database: Arc<Database>,
    pub registry: Option<Arc<ProcedureRegistry>>,
    pub read_timeout: Duration,
    pub max_line_bytes: usize,
    pub loopback_is_root: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Serving,
    Closing,
    Closed,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// No usable authentication line
    Unauthenticated,
    /// Credentials were refused
    AuthRejected,
    /// Nothing arrived within the read timeout
    Idle,
    ClientClosed,
    UnknownCommand,
    ExecutionError,
    Shutdown,
    Io,
}

impl SessionEnd {
    pub fn label(&self) -> &'static str {
        match self {
            SessionEnd::Unauthenticated => "unauthenticated",
            SessionEnd::AuthRejected => "auth_rejected",
            SessionEnd::Idle => "idle",
            SessionEnd::ClientClosed => "client_closed",
            SessionEnd::UnknownCommand => "unknown_command",
            SessionEnd::ExecutionError => "execution_error",
            SessionEnd::Shutdown => "shutdown",
            SessionEnd::Io => "io_error",
        }
    }
}

/// Outcome of dispatching one command
#[derive(Debug)]
pub enum Dispatch {
    Reply(String),
    UnknownCommand,
    ExecutionError(DbError),
}

enum ReadOutcome {
    Line(String),
    /// Over-long or not UTF-8
    Malformed,
    TimedOut,
    Closed,
    Stopped,
    Failed(std::io::Error),
}

pub struct Session<S> {
    id: u64,
    peer: SocketAddr,
    stream: Option<BufReader<S>>,
    principal: Option<Principal>,
    state: SessionState,
    permit: Option<AdmissionPermit>,
    context: Arc<SessionContext>,
    shutdown: watch::Receiver<bool>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        stream: S,
        peer: SocketAddr,
        permit: Option<AdmissionPermit>,
        context: Arc<SessionContext>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            stream: Some(BufReader::new(stream)),
            principal: None,
            state: SessionState::Connecting,
            permit,
            context,
            shutdown,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    /// Drive the session to completion
    pub async fn run(mut self) -> SessionEnd {
        metrics::session_opened();
        debug!(session_id = self.id, peer = %self.peer, "Session started");

        let end = match self.authenticate().await {
            Ok(()) => self.serve().await,
            Err(end) => end,
        };

        self.close().await;
        metrics::session_closed(end.label());
        info!(
            session_id = self.id,
            peer = %self.peer,
            user = self.principal.as_ref().map(|p| p.username.as_str()).unwrap_or("-"),
            reason = end.label(),
            "Session ended"
        );
        end
    }

    // ═══════════════════════════════════════════════════════════════════
    // AUTHENTICATION
    // ═══════════════════════════════════════════════════════════════════

    async fn authenticate(&mut self) -> Result<(), SessionEnd> {
        self.state = SessionState::Authenticating;

        if self.context.loopback_is_root && self.peer.ip().to_canonical().is_loopback() {
            self.grant(Principal::root(), protocol::AUTH_ROOT).await?;
            return Ok(());
        }

        let line = match self.read_line().await {
            ReadOutcome::Line(line) => line,
            other => return Err(self.end_for(other, "authentication")),
        };

        let request = match protocol::parse_auth_line(&line) {
            Some(request) => request,
            None => {
                debug!(session_id = self.id, "First line is not an authentication request");
                return Err(SessionEnd::Unauthenticated);
            }
        };

        match request {
            AuthRequest::Guest => self.grant(Principal::guest(), protocol::SUCCESS).await,
            AuthRequest::Credentials { username, password } => {
                if !self.context.database.is_running() {
                    warn!(
                        session_id = self.id,
                        user = %username,
                        "Database unavailable, downgrading to guest"
                    );
                    return self.grant(Principal::guest(), protocol::SUCCESS).await;
                }

                match self.context.database.verify_password(&username, &password).await {
                    Ok(true) => {
                        let ack = protocol::auth_ack(&username);
                        self.grant(Principal::standard(username), &ack).await
                    }
                    Ok(false) => self.refuse(&username, "bad credentials").await,
                    Err(DbError::Stopped) => {
                        warn!(session_id = self.id, user = %username, "Database stopped, downgrading to guest");
                        self.grant(Principal::guest(), protocol::SUCCESS).await
                    }
                    Err(e) => {
                        error!(session_id = self.id, user = %username, error = %e, "Password verification failed");
                        self.refuse(&username, "verification error").await
                    }
                }
            }
        }
    }

    async fn grant(&mut self, principal: Principal, ack: &str) -> Result<(), SessionEnd> {
        info!(
            session_id = self.id,
            peer = %self.peer,
            user = %principal.username,
            permission = %principal.permission,
            "Session authenticated"
        );
        self.principal = Some(principal);
        self.send(ack).await.map_err(|e| self.io_end(e))
    }

    async fn refuse(&mut self, username: &str, why: &str) -> Result<(), SessionEnd> {
        let err = GatehouseError::AuthenticationFailed(why.to_string());
        warn!(session_id = self.id, peer = %self.peer, user = %username, code = err.code(), "{}", err);
        metrics::record_auth_failure();
        if let Err(e) = self.send(protocol::UNKNOWN_USER).await {
            debug!(session_id = self.id, error = %e, "Could not deliver auth refusal");
        }
        Err(SessionEnd::AuthRejected)
    }

    // ═══════════════════════════════════════════════════════════════════
    // COMMAND LOOP
    // ═══════════════════════════════════════════════════════════════════

    async fn serve(&mut self) -> SessionEnd {
        self.state = SessionState::Serving;

        loop {
            let line = match self.read_line().await {
                ReadOutcome::Line(line) => line,
                ReadOutcome::Malformed => {
                    return self.stop_with(protocol::UNKNOWN_COMMAND, SessionEnd::UnknownCommand).await
                }
                other => return self.end_for(other, "command"),
            };

            match self.dispatch(&line).await {
                Dispatch::Reply(reply) => {
                    if let Err(e) = self.send(&reply).await {
                        return self.io_end(e);
                    }
                }
                Dispatch::UnknownCommand => {
                    debug!(session_id = self.id, "Unknown command");
                    return self.stop_with(protocol::UNKNOWN_COMMAND, SessionEnd::UnknownCommand).await;
                }
                Dispatch::ExecutionError(e) => {
                    let code = GatehouseError::from(e.clone()).code();
                    warn!(session_id = self.id, error = %e, code, "Command failed");
                    return self.stop_with(protocol::UNKNOWN_ERROR, SessionEnd::ExecutionError).await;
                }
            }
        }
    }

    async fn stop_with(&mut self, token: &str, end: SessionEnd) -> SessionEnd {
        match self.send(token).await {
            Ok(()) => end,
            Err(e) => self.io_end(e),
        }
    }

    /// Map one command line to its reply
    pub async fn dispatch(&self, line: &str) -> Dispatch {
        let Some(principal) = &self.principal else {
            return Dispatch::UnknownCommand;
        };

        let Some(command) = Command::parse(line) else {
            return Dispatch::UnknownCommand;
        };
        if let Err(e) = principal.authorize(&command) {
            debug!(session_id = self.id, code = e.code(), error = %e, "Command not permitted");
            return Dispatch::UnknownCommand;
        }

        match command {
            Command::Sql { text } => {
                debug!(session_id = self.id, "Direct SQL");
                let outcome = self.context.database.execute_sql(Operation::sql(text), true).await;
                reply_for(outcome)
            }
            Command::Procedure { name, args } => self.call_procedure(name, args).await,
        }
    }

    async fn call_procedure(&self, name: String, args: Vec<String>) -> Dispatch {
        let (name, want_result) = match &self.context.registry {
            Some(registry) => {
                let Some(procedure) = registry.lookup(&name) else {
                    return Dispatch::UnknownCommand;
                };
                if procedure.arity() != args.len() {
                    debug!(
                        session_id = self.id,
                        procedure = %procedure.name,
                        expected = procedure.arity(),
                        got = args.len(),
                        "Procedure called with wrong argument count"
                    );
                    return Dispatch::UnknownCommand;
                }
                (procedure.name.clone(), !procedure.return_type.is_fire_and_forget())
            }
            None if is_identifier(&name) => (name, true),
            None => return Dispatch::UnknownCommand,
        };

        let outcome = self
            .context
            .database
            .call_procedure(Operation::procedure(name, args), want_result)
            .await;
        reply_for(outcome)
    }

    // ═══════════════════════════════════════════════════════════════════
    // I/O
    // ═══════════════════════════════════════════════════════════════════

    async fn read_line(&mut self) -> ReadOutcome {
        let limit = self.context.max_line_bytes;
        let read_timeout = self.context.read_timeout;
        let mut shutdown = self.shutdown.clone();
        let Some(reader) = self.stream.as_mut() else {
            return ReadOutcome::Closed;
        };

        let mut buf = Vec::new();
        let read = async {
            // room for the longest line plus a CRLF terminator
            let mut limited = reader.take(limit as u64 + 2);
            limited.read_until(b'\n', &mut buf).await
        };

        let outcome = tokio::select! {
            res = tokio::time::timeout(read_timeout, read) => res,
            _ = shutdown_requested(&mut shutdown) => return ReadOutcome::Stopped,
        };

        match outcome {
            Err(_) => ReadOutcome::TimedOut,
            Ok(Ok(0)) => ReadOutcome::Closed,
            Ok(Ok(_)) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                if buf.len() > limit {
                    return ReadOutcome::Malformed;
                }
                match String::from_utf8(buf) {
                    Ok(line) => ReadOutcome::Line(line),
                    Err(_) => ReadOutcome::Malformed,
                }
            }
            Ok(Err(e)) if is_disconnect_error(&e) => ReadOutcome::Closed,
            Ok(Err(e)) => ReadOutcome::Failed(e),
        }
    }

    async fn send(&mut self, line: &str) -> std::io::Result<()> {
        let write_timeout = self.context.read_timeout;
        let Some(reader) = self.stream.as_mut() else {
            return Err(std::io::ErrorKind::NotConnected.into());
        };

        let mut message = String::with_capacity(line.len() + 1);
        message.push_str(line);
        message.push('\n');

        let stream = reader.get_mut();
        let write = async {
            stream.write_all(message.as_bytes()).await?;
            stream.flush().await
        };
        match tokio::time::timeout(write_timeout, write).await {
            Ok(res) => res,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "client did not accept the reply in time",
            )),
        }
    }

    fn end_for(&self, outcome: ReadOutcome, phase: &str) -> SessionEnd {
        match outcome {
            ReadOutcome::TimedOut => {
                debug!(session_id = self.id, phase, "Read timed out");
                SessionEnd::Idle
            }
            ReadOutcome::Closed => SessionEnd::ClientClosed,
            ReadOutcome::Stopped => SessionEnd::Shutdown,
            ReadOutcome::Failed(e) => self.io_end(e),
            ReadOutcome::Malformed => SessionEnd::Unauthenticated,
            // lines are consumed by the callers
            ReadOutcome::Line(_) => SessionEnd::Unauthenticated,
        }
    }

    fn io_end(&self, e: std::io::Error) -> SessionEnd {
        if is_disconnect_error(&e) {
            debug!(session_id = self.id, error = %e, "Client went away");
            SessionEnd::ClientClosed
        } else {
            let err = GatehouseError::from(e);
            warn!(session_id = self.id, peer = %self.peer, code = err.code(), "{}", err);
            SessionEnd::Io
        }
    }

    /// Tear the session down; only the first call has any effect
    pub async fn close(&mut self) -> bool {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            warn!(session_id = self.id, "Session already closed");
            return false;
        }
        self.state = SessionState::Closing;

        if let Some(mut reader) = self.stream.take() {
            match tokio::time::timeout(CLOSE_TIMEOUT, reader.get_mut().shutdown()).await {
                Ok(Err(e)) if !is_disconnect_error(&e) => {
                    debug!(session_id = self.id, error = %e, "Error while closing socket");
                }
                Err(_) => debug!(session_id = self.id, "Socket close timed out"),
                _ => {}
            }
        }
        // frees the admission slot and wakes a blocked accept loop
        self.permit.take();

        self.state = SessionState::Closed;
        true
    }
}

fn reply_for(outcome: Result<Option<QueryResult>, DbError>) -> Dispatch {
    match outcome {
        Ok(Some(result)) => match protocol::result_payload(&result) {
            Ok(payload) => Dispatch::Reply(payload),
            Err(e) => Dispatch::ExecutionError(DbError::Query(format!("cannot encode result: {}", e))),
        },
        Ok(None) => Dispatch::Reply(protocol::SUCCESS.to_string()),
        Err(e) => Dispatch::ExecutionError(e),
    }
}
