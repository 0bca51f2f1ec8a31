//! Direct ("freedom") outbound: plain TCP and UDP sockets

use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

use super::Dialer;
use crate::core::{Address, PacketConn};
use crate::error::{ProxyError, Result};
use crate::logger::log;
use crate::transport::{self, BoxStream};

/// Dials destinations directly from this host
pub struct DirectDialer {
    connect_timeout: Duration,
    udp_timeout: Duration,
    nodelay: bool,
}

impl DirectDialer {
    pub fn new(connect_timeout: Duration, udp_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            udp_timeout,
            nodelay: true,
        }
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Connect to `target` and return the raw TCP stream
    pub async fn connect(&self, target: &Address) -> Result<TcpStream> {
        let host = target.host();
        let fut = TcpStream::connect((host.as_str(), target.port()));
        let stream = match tokio::time::timeout(self.connect_timeout, fut).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ProxyError::UpstreamDialFailed(format!("{}: {}", target, e)));
            }
            Err(_) => {
                return Err(ProxyError::UpstreamDialFailed(format!(
                    "{}: connect timed out after {:?}",
                    target, self.connect_timeout
                )));
            }
        };
        transport::tune_stream(&stream, self.nodelay);
        Ok(stream)
    }
}

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial_tcp(&self, target: &Address) -> Result<BoxStream> {
        let stream = self.connect(target).await?;
        log::debug!(dest = %target, "direct tcp connected");
        Ok(Box::pin(stream))
    }

    async fn dial_udp(&self) -> Result<Arc<dyn PacketConn>> {
        let socket = bind_dual_stack()?;
        Ok(Arc::new(
            UdpPacketConn::new(Arc::new(socket)).with_read_timeout(self.udp_timeout),
        ))
    }
}

/// Bind an ephemeral UDP socket that can reach both address families.
/// Falls back to IPv4-only where IPv6 is unavailable.
pub fn bind_dual_stack() -> Result<UdpSocket> {
    let v6 = || -> std::io::Result<UdpSocket> {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV6,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        socket.set_only_v6(false)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::from(([0u16; 8], 0)).into())?;
        UdpSocket::from_std(socket.into())
    };
    match v6() {
        Ok(socket) => Ok(socket),
        Err(_) => transport::bind_udp(SocketAddr::from(([0, 0, 0, 0], 0))),
    }
}

/// PacketConn over a UDP socket.
///
/// `recv_from` reports the sender; `send_to` resolves domain targets on
/// every call. Reads give up after the optional read timeout.
pub struct UdpPacketConn {
    socket: Arc<UdpSocket>,
    cancel: CancellationToken,
    read_timeout: Option<Duration>,
    is_v6: bool,
}

impl UdpPacketConn {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        let is_v6 = socket.local_addr().map(|a| a.is_ipv6()).unwrap_or(false);
        Self {
            socket,
            cancel: CancellationToken::new(),
            read_timeout: None,
            is_v6,
        }
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    /// Send to an already-resolved socket address
    pub async fn send_to_addr(&self, buf: &[u8], target: SocketAddr) -> Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(ProxyError::ConnectionClosed);
        }
        Ok(self.socket.send_to(buf, self.map_family(target)).await?)
    }

    /// A v6 socket needs v4 destinations in mapped form
    fn map_family(&self, addr: SocketAddr) -> SocketAddr {
        match (self.is_v6, addr.ip()) {
            (true, IpAddr::V4(v4)) => SocketAddr::new(IpAddr::V6(v4.to_ipv6_mapped()), addr.port()),
            _ => addr,
        }
    }
}

#[async_trait]
impl PacketConn for UdpPacketConn {
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Address)> {
        let recv = async {
            let res = match self.read_timeout {
                Some(t) => tokio::time::timeout(t, self.socket.recv_from(buf)).await?,
                None => self.socket.recv_from(buf).await,
            };
            res.map_err(ProxyError::from)
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ProxyError::ConnectionClosed),
            res = recv => {
                let (n, from) = res?;
                Ok((n, Address::from(from)))
            }
        }
    }

    async fn send_to(&self, buf: &[u8], target: &Address) -> Result<usize> {
        let addr = target.to_socket_addr().await?;
        self.send_to_addr(buf, addr).await
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn dialer() -> DirectDialer {
        DirectDialer::new(Duration::from_secs(2), Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_dial_tcp_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = Address::from(listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            s.read_exact(&mut buf).await.unwrap();
            s.write_all(&buf).await.unwrap();
        });

        let mut stream = dialer().dial_tcp(&target).await.unwrap();
        stream.write_all(b"echo").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"echo");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_tcp_refused() {
        // Bind then drop to get a port nothing listens on.
        let port = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let err = dialer()
            .dial_tcp(&Address::IPv4([127, 0, 0, 1], port))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProxyError::UpstreamDialFailed(_)));
    }

    #[tokio::test]
    async fn test_udp_packet_conn_round_trip() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = Address::from(echo.local_addr().unwrap());
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, from) = echo.recv_from(&mut buf).await.unwrap();
            echo.send_to(&buf[..n], from).await.unwrap();
        });

        let conn = dialer().dial_udp().await.unwrap();
        conn.send_to(b"ping", &echo_addr).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = conn.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, echo_addr);
    }

    #[tokio::test]
    async fn test_udp_read_timeout() {
        let conn = dialer().dial_udp().await.unwrap();
        let mut buf = [0u8; 16];
        let err = conn.recv_from(&mut buf).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_udp_close_is_idempotent() {
        let conn = dialer().dial_udp().await.unwrap();
        conn.close();
        conn.close();
        let mut buf = [0u8; 16];
        assert!(matches!(
            conn.recv_from(&mut buf).await,
            Err(ProxyError::ConnectionClosed)
        ));
        assert!(matches!(
            conn.send_to(b"x", &Address::IPv4([127, 0, 0, 1], 9)).await,
            Err(ProxyError::ConnectionClosed)
        ));
    }
}
