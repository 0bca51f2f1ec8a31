//! Connection abstractions handed from inbound servers to their consumer
//!
//! Stream connections are carried as [`InboundConn`] (TCP- or TLS-backed),
//! datagram flows as `Arc<dyn PacketConn>` (UDP socket, SOCKS demux queue or
//! Trojan envelope stream).

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::metadata::Metadata;
use super::Address;
use crate::error::Result;
use crate::transport::BoxStream;

/// Which front-end produced a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundKind {
    Socks,
    Http,
    /// Authenticated Trojan client, keyed by its password hash
    Trojan { password: String },
}

impl std::fmt::Display for InboundKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InboundKind::Socks => write!(f, "socks"),
            InboundKind::Http => write!(f, "http"),
            InboundKind::Trojan { .. } => write!(f, "trojan"),
        }
    }
}

/// A negotiated stream connection: handshake done, destination known.
pub struct InboundConn {
    stream: BoxStream,
    metadata: Metadata,
    peer: SocketAddr,
    kind: InboundKind,
    /// Bytes that must reach the upstream before anything read from `stream`
    payload: Bytes,
}

impl InboundConn {
    pub fn new(stream: BoxStream, metadata: Metadata, peer: SocketAddr, kind: InboundKind) -> Self {
        Self {
            stream,
            metadata,
            peer,
            kind,
            payload: Bytes::new(),
        }
    }

    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn kind(&self) -> &InboundKind {
        &self.kind
    }

    /// Take the initial payload, leaving it empty
    pub fn take_payload(&mut self) -> Bytes {
        std::mem::take(&mut self.payload)
    }

    pub fn into_stream(self) -> BoxStream {
        self.stream
    }
}

impl std::fmt::Debug for InboundConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundConn")
            .field("metadata", &self.metadata)
            .field("peer", &self.peer)
            .field("kind", &self.kind)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

impl AsyncRead for InboundConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.stream.as_mut().poll_read(cx, buf)
    }
}

impl AsyncWrite for InboundConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.stream.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.stream.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.stream.as_mut().poll_shutdown(cx)
    }
}

/// Datagram-oriented connection.
///
/// `recv_from` fills `buf` with one datagram and reports the address it is
/// associated with: the sender for sockets, the requested destination for
/// client-facing demux queues. `send_to` delivers one datagram toward
/// `target`. `close` must be idempotent; operations after close fail with
/// `ConnectionClosed`.
#[async_trait]
pub trait PacketConn: Send + Sync {
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Address)>;

    async fn send_to(&self, buf: &[u8], target: &Address) -> Result<usize>;

    fn close(&self);

    /// Metadata of the flow when the transport carries one
    fn metadata(&self) -> Option<Metadata> {
        None
    }

    /// Client-side transport address, used as the NAT key
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Listener that hands out negotiated connections and datagram flows
#[async_trait]
pub trait InboundServer: Send + Sync {
    /// Run the accept loops until `close` is called or the listener fails
    async fn listen_and_serve(&self) -> Result<()>;

    /// Next negotiated stream connection
    async fn accept_conn(&self) -> Result<InboundConn>;

    /// Next datagram flow
    async fn accept_packet(&self) -> Result<Arc<dyn PacketConn>>;

    /// Cancel every loop owned by this server
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_inbound_conn_delegates_io() {
        let (client, server) = tokio::io::duplex(64);
        let md = Metadata::connect(Address::IPv4([1, 2, 3, 4], 80));
        let mut conn = InboundConn::new(
            Box::pin(server),
            md.clone(),
            "127.0.0.1:9000".parse().unwrap(),
            InboundKind::Socks,
        )
        .with_payload(Bytes::from_static(b"hello"));

        assert_eq!(conn.metadata(), &md);
        assert_eq!(conn.take_payload(), Bytes::from_static(b"hello"));
        assert!(conn.take_payload().is_empty());

        let mut client = client;
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        conn.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn test_inbound_kind_display() {
        assert_eq!(InboundKind::Socks.to_string(), "socks");
        assert_eq!(
            InboundKind::Trojan {
                password: "x".into()
            }
            .to_string(),
            "trojan"
        );
    }
}
