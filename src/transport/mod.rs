//! Transport plumbing shared by every listener and dialer
//!
//! - boxed stream type for TCP- and TLS-backed connections
//! - socket2-backed listener binding
//! - per-connection socket tuning
//! - accept/recv error recovery for long-lived listeners

pub mod tls;

use socket2::{SockRef, TcpKeepalive};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::logger::log;

/// Unified stream trait combining AsyncRead + AsyncWrite + Send + Unpin
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Type-erased stream: plain TCP, TLS, or an in-memory pipe in tests
pub type BoxStream = Pin<Box<dyn AsyncStream>>;

/// TCP keepalive interval. Dead peers are detected in ~45s (3 probes × 15s).
pub const TCP_KEEPALIVE_SECS: u64 = 15;

fn domain_for(addr: &SocketAddr) -> socket2::Domain {
    match addr {
        SocketAddr::V4(_) => socket2::Domain::IPV4,
        SocketAddr::V6(_) => socket2::Domain::IPV6,
    }
}

/// Bind a TCP listener with SO_REUSEADDR so restarts skip TIME_WAIT
pub fn bind_tcp(addr: SocketAddr, backlog: i32) -> Result<TcpListener> {
    let socket = socket2::Socket::new(
        domain_for(&addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(TcpListener::from_std(socket.into())?)
}

/// Bind a UDP socket on `addr`
pub fn bind_udp(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = socket2::Socket::new(
        domain_for(&addr),
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Unspecified local address of the same family as `peer`, for outbound sockets
pub fn unspecified_for(peer: &SocketAddr) -> SocketAddr {
    match peer {
        SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
    }
}

/// Apply TCP_NODELAY and keepalive to an accepted or dialed stream.
/// Failures are logged; the stream stays usable without the options.
pub fn tune_stream(stream: &TcpStream, nodelay: bool) {
    if nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!(error = %e, "failed to set TCP_NODELAY");
        }
    }
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(TCP_KEEPALIVE_SECS))
        .with_interval(Duration::from_secs(TCP_KEEPALIVE_SECS));
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        log::debug!(error = %e, "failed to set TCP keepalive");
    }
}

/// Pause after running out of descriptors or socket buffers
pub const EXHAUSTION_BACKOFF: Duration = Duration::from_millis(100);

/// What a listening socket does after an accept or recv error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Transient, per-peer failure: try again now
    Retry,
    /// Process or system is out of resources: wait, then try again
    Backoff(Duration),
    /// The socket itself is unusable
    Stop,
}

/// Classify an error returned by `accept` or `recv_from` on a listener
pub fn classify_error(err: &io::Error) -> ErrorAction {
    #[cfg(unix)]
    if let Some(code) = err.raw_os_error() {
        match code {
            libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM => {
                return ErrorAction::Backoff(EXHAUSTION_BACKOFF)
            }
            libc::EBADF | libc::ENOTSOCK | libc::EINVAL => return ErrorAction::Stop,
            _ => {}
        }
    }
    match err.kind() {
        io::ErrorKind::OutOfMemory => ErrorAction::Backoff(EXHAUSTION_BACKOFF),
        io::ErrorKind::InvalidInput | io::ErrorKind::Unsupported => ErrorAction::Stop,
        _ => ErrorAction::Retry,
    }
}

/// Log an accept/recv error and sit out any backoff. Returns false when the
/// socket is unusable or `cancel` fired while waiting.
pub async fn recover(err: &io::Error, what: &str, cancel: &CancellationToken) -> bool {
    match classify_error(err) {
        ErrorAction::Retry => {
            log::warn!(error = %err, "Failed to {}", what);
            true
        }
        ErrorAction::Backoff(delay) => {
            log::error!(error = %err, delay = ?delay, "Failed to {}, backing off", what);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                _ = tokio::time::sleep(delay) => true,
            }
        }
        ErrorAction::Stop => {
            log::error!(error = %err, "Failed to {}, socket unusable", what);
            false
        }
    }
}

/// Accept the next connection, riding out per-connection failures.
/// `Ok(None)` once `cancel` fires; `Err` only when the listener is unusable.
pub async fn accept_next<F, Fut, T>(cancel: &CancellationToken, mut accept: F) -> Result<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            res = accept() => res,
        };
        match res {
            Ok(conn) => return Ok(Some(conn)),
            Err(e) => {
                if !recover(&e, "accept connection", cancel).await {
                    if cancel.is_cancelled() {
                        return Ok(None);
                    }
                    return Err(e.into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_bind_tcp_ephemeral() {
        let listener = bind_tcp("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let local = listener.local_addr().unwrap();
        assert_ne!(local.port(), 0);

        let client = TcpStream::connect(local).await.unwrap();
        tune_stream(&client, true);
        assert!(client.nodelay().unwrap());
        assert!(SockRef::from(&client).keepalive().unwrap());
    }

    #[tokio::test]
    async fn test_bind_udp_ephemeral() {
        let socket = bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn test_unspecified_matches_family() {
        let v4: SocketAddr = "1.2.3.4:5".parse().unwrap();
        let v6: SocketAddr = "[::1]:5".parse().unwrap();
        assert!(unspecified_for(&v4).is_ipv4());
        assert!(unspecified_for(&v6).is_ipv6());
    }

    #[test]
    fn test_tcp_keepalive_interval() {
        let detection_time = TCP_KEEPALIVE_SECS * 3;
        assert!(detection_time <= 60);
    }

    #[cfg(unix)]
    #[test]
    fn test_classify_error() {
        let emfile = io::Error::from_raw_os_error(libc::EMFILE);
        assert_eq!(classify_error(&emfile), ErrorAction::Backoff(EXHAUSTION_BACKOFF));
        let enfile = io::Error::from_raw_os_error(libc::ENFILE);
        assert_eq!(classify_error(&enfile), ErrorAction::Backoff(EXHAUSTION_BACKOFF));
        let ebadf = io::Error::from_raw_os_error(libc::EBADF);
        assert_eq!(classify_error(&ebadf), ErrorAction::Stop);
        let aborted = io::Error::from(io::ErrorKind::ConnectionAborted);
        assert_eq!(classify_error(&aborted), ErrorAction::Retry);
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(classify_error(&refused), ErrorAction::Retry);
    }

    #[cfg(unix)]
    #[tokio::test(start_paused = true)]
    async fn test_accept_next_survives_failures() {
        let cancel = CancellationToken::new();
        let calls = AtomicUsize::new(0);
        let start = tokio::time::Instant::now();

        let accepted = accept_next(&cancel, || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                match call {
                    0 => Err(io::Error::from_raw_os_error(libc::EMFILE)),
                    1 => Err(io::Error::from(io::ErrorKind::ConnectionAborted)),
                    _ => Ok(call),
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(accepted, Some(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Only the descriptor exhaustion waited
        assert!(start.elapsed() >= EXHAUSTION_BACKOFF);
        assert!(start.elapsed() < EXHAUSTION_BACKOFF * 2);
    }

    #[cfg(unix)]
    #[tokio::test(start_paused = true)]
    async fn test_accept_next_cancel_during_backoff() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(250)).await;
                cancel.cancel();
            }
        });

        let accepted: Option<()> = accept_next(&cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(io::Error::from_raw_os_error(libc::ENFILE)) }
        })
        .await
        .unwrap();

        assert!(accepted.is_none());
        // One attempt per backoff period, not a busy loop
        let attempts = calls.load(Ordering::SeqCst);
        assert!((2..=4).contains(&attempts), "attempts = {attempts}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_accept_next_unusable_listener() {
        let cancel = CancellationToken::new();
        let res: Result<Option<()>> =
            accept_next(&cancel, || async { Err(io::Error::from_raw_os_error(libc::EBADF)) }).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_accept_next_real_listener() {
        let listener = bind_tcp("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let local = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();

        let _client = TcpStream::connect(local).await.unwrap();
        let (stream, _) = accept_next(&cancel, || listener.accept())
            .await
            .unwrap()
            .unwrap();
        tune_stream(&stream, true);
        assert!(stream.nodelay().unwrap());

        cancel.cancel();
        let next = accept_next(&cancel, || listener.accept()).await.unwrap();
        assert!(next.is_none());
    }
}
