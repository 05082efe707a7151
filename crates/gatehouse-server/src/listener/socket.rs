//! TCP tuning for accepted client sockets

use socket2::{SockRef, TcpKeepalive};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Disable Nagle and enable keepalive so vanished clients are noticed
pub fn configure_client_socket(stream: &TcpStream, keepalive_secs: u64) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(error = %e, "Failed to set TCP_NODELAY");
    }
    if keepalive_secs == 0 {
        return;
    }

    let socket = SockRef::from(stream);
    if let Err(e) = socket.set_keepalive(true) {
        warn!(error = %e, "Failed to enable TCP keepalive");
        return;
    }
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(keepalive_secs))
        .with_interval(Duration::from_secs(keepalive_secs / 2 + 1));

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    let keepalive = keepalive.with_retries(3);

    match socket.set_tcp_keepalive(&keepalive) {
        Ok(()) => debug!(keepalive_secs, "TCP keepalive configured"),
        Err(e) => warn!(error = %e, "Failed to configure TCP keepalive"),
    }
}

/// Errors that only mean the peer went away
pub fn is_disconnect_error(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_configure_accepted_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (stream, _) = listener.accept().await.unwrap();

        configure_client_socket(&stream, 30);
        assert!(stream.nodelay().unwrap());
        assert!(SockRef::from(&stream).keepalive().unwrap());
        drop(client.await.unwrap());
    }

    #[test]
    fn test_disconnect_errors() {
        use std::io::{Error, ErrorKind};
        assert!(is_disconnect_error(&Error::from(ErrorKind::BrokenPipe)));
        assert!(is_disconnect_error(&Error::from(ErrorKind::UnexpectedEof)));
        assert!(!is_disconnect_error(&Error::from(ErrorKind::InvalidData)));
    }
}
