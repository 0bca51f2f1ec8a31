//! Mixed SOCKS5 / HTTP inbound server
//!
//! TCP and UDP share one listen address. The first byte of a TCP connection
//! picks the protocol: 0x05 is SOCKS5, an ASCII letter starts an HTTP
//! request.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::handshake::{Handshake, ServerHandshake, SOCKS_VERSION};
use super::http::accept_http;
use super::udp::SocksUdpDemux;
use crate::config::ConnConfig;
use crate::core::{Address, InboundConn, InboundKind, InboundServer, Metadata, PacketConn};
use crate::error::{ProxyError, Result};
use crate::logger::log;
use crate::transport::{self, BoxStream};

/// Depth of the conn and packet handoff queues
const ACCEPT_QUEUE_DEPTH: usize = 32;

struct Shared {
    udp_port: u16,
    demux: Arc<SocksUdpDemux>,
    conn_config: ConnConfig,
    conn_tx: mpsc::Sender<InboundConn>,
    cancel: CancellationToken,
}

pub struct SocksServer {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    conn_rx: Mutex<mpsc::Receiver<InboundConn>>,
    packet_rx: Mutex<mpsc::Receiver<Arc<dyn PacketConn>>>,
}

impl SocksServer {
    /// Bind TCP and UDP on `addr`. With port 0 the UDP socket takes the
    /// port the TCP listener got.
    pub fn bind(addr: SocketAddr, conn_config: ConnConfig) -> Result<Self> {
        let listener = transport::bind_tcp(addr, conn_config.tcp_backlog)?;
        let local_addr = listener.local_addr()?;
        let udp = transport::bind_udp(local_addr)?;

        let cancel = CancellationToken::new();
        let (conn_tx, conn_rx) = mpsc::channel(ACCEPT_QUEUE_DEPTH);
        let (packet_tx, packet_rx) = mpsc::channel(ACCEPT_QUEUE_DEPTH);
        let demux = Arc::new(SocksUdpDemux::new(
            Arc::new(udp),
            packet_tx,
            conn_config.socks_session_timeout,
            cancel.clone(),
        ));

        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            shared: Arc::new(Shared {
                udp_port: local_addr.port(),
                demux,
                conn_config,
                conn_tx,
                cancel,
            }),
            conn_rx: Mutex::new(conn_rx),
            packet_rx: Mutex::new(packet_rx),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn accept_loop(&self, listener: TcpListener) -> Result<()> {
        loop {
            let Some((stream, peer)) =
                transport::accept_next(&self.shared.cancel, || listener.accept()).await?
            else {
                return Ok(());
            };
            log::connection(&peer.to_string(), "new");
            transport::tune_stream(&stream, self.shared.conn_config.tcp_nodelay);

            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                if let Err(e) = shared.handle(stream, peer).await {
                    log::debug!(peer = %peer, error = %e, "socks connection failed");
                }
            });
        }
    }
}

impl Shared {
    async fn handle(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        // Announce the UDP socket on the address the client reached us at.
        let udp_bind = SocketAddr::new(stream.local_addr()?.ip(), self.udp_port);
        let mut stream: BoxStream = Box::pin(stream);
        let timeout = self.conn_config.request_timeout;

        let first = tokio::time::timeout(timeout, stream.read_u8()).await??;
        let conn = if first == SOCKS_VERSION {
            let mut handshake = ServerHandshake::new(udp_bind);
            match tokio::time::timeout(timeout, handshake.run(&mut stream)).await?? {
                Handshake::Connect(metadata) => {
                    log::debug!(peer = %peer, flow = %metadata, "socks connect");
                    InboundConn::new(stream, metadata, peer, InboundKind::Socks)
                }
                Handshake::Associate(metadata) => {
                    log::debug!(peer = %peer, "socks udp associate");
                    self.hold_association(stream, peer, &metadata.address).await;
                    return Ok(());
                }
            }
        } else if first.is_ascii_alphabetic() {
            let accepted = tokio::time::timeout(timeout, accept_http(first, &mut stream)).await??;
            log::debug!(peer = %peer, target = %accepted.address, connect = accepted.is_connect, "http request");
            InboundConn::new(stream, Metadata::connect(accepted.address), peer, InboundKind::Http)
                .with_payload(accepted.payload)
        } else {
            log::protocol("unknown first byte", Some(&format!("{first:#04x}")));
            return Err(ProxyError::ProtocolVersionMismatch(first));
        };

        tokio::select! {
            _ = self.cancel.cancelled() => Err(ProxyError::ConnectionClosed),
            res = self.conn_tx.send(conn) => res.map_err(|_| ProxyError::ConnectionClosed),
        }
    }

    /// Keep the control connection open until the client drops it, then
    /// release its UDP sessions
    async fn hold_association(&self, mut stream: BoxStream, peer: SocketAddr, requested: &Address) {
        let mut buf = [0u8; 64];
        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = stream.read(&mut buf) => res,
            };
            match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
        self.demux.release(peer, requested);
        log::debug!(peer = %peer, "socks udp association ended");
    }
}

#[async_trait]
impl InboundServer for SocksServer {
    async fn listen_and_serve(&self) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or_else(|| ProxyError::Config("socks server already started".into()))?;
        log::info!(address = %self.local_addr, "SOCKS5/HTTP server started");

        let demux = Arc::clone(&self.shared.demux);
        tokio::try_join!(self.accept_loop(listener), demux.serve())?;
        Ok(())
    }

    async fn accept_conn(&self) -> Result<InboundConn> {
        let mut rx = self.conn_rx.lock().await;
        tokio::select! {
            _ = self.shared.cancel.cancelled() => Err(ProxyError::ConnectionClosed),
            conn = rx.recv() => conn.ok_or(ProxyError::ConnectionClosed),
        }
    }

    async fn accept_packet(&self) -> Result<Arc<dyn PacketConn>> {
        let mut rx = self.packet_rx.lock().await;
        tokio::select! {
            _ = self.shared.cancel.cancelled() => Err(ProxyError::ConnectionClosed),
            conn = rx.recv() => conn.ok_or(ProxyError::ConnectionClosed),
        }
    }

    fn close(&self) {
        self.shared.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Command;
    use crate::socks::handshake::client_handshake;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UdpSocket;

    async fn start() -> Arc<SocksServer> {
        let server = Arc::new(SocksServer::bind("127.0.0.1:0".parse().unwrap(), ConnConfig::default()).unwrap());
        let s = server.clone();
        tokio::spawn(async move { s.listen_and_serve().await });
        server
    }

    #[tokio::test]
    async fn test_socks_connect_is_queued() {
        let server = start().await;
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        let target = Address::Domain("example.com".into(), 80);
        client_handshake(&mut client, Command::Connect, &target).await.unwrap();
        client.write_all(b"hi").await.unwrap();

        let mut conn = server.accept_conn().await.unwrap();
        assert_eq!(conn.metadata(), &Metadata::connect(target));
        assert_eq!(conn.kind(), &InboundKind::Socks);
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_http_connect_is_queued() {
        let server = start().await;
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .await
            .unwrap();
        let conn = server.accept_conn().await.unwrap();
        assert_eq!(conn.kind(), &InboundKind::Http);
        assert_eq!(conn.metadata().address, Address::Domain("example.com".into(), 443));
    }

    #[tokio::test]
    async fn test_udp_associate_flow() {
        let server = start().await;
        let mut control = TcpStream::connect(server.local_addr()).await.unwrap();
        let bound = client_handshake(&mut control, Command::UdpAssociate, &Address::IPv4([0, 0, 0, 0], 0))
            .await
            .unwrap();
        assert_eq!(bound, Address::from(server.local_addr()));

        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest = Address::IPv4([8, 8, 4, 4], 53);
        let mut datagram = vec![0, 0, 0];
        dest.encode(&mut datagram).unwrap();
        datagram.extend_from_slice(b"ping");
        udp.send_to(&datagram, server.local_addr()).await.unwrap();

        let packets = server.accept_packet().await.unwrap();
        let mut buf = [0u8; 32];
        let (n, to) = packets.recv_from(&mut buf).await.unwrap();
        assert_eq!((&buf[..n], to), (&b"ping"[..], dest.clone()));

        packets.send_to(b"pong", &dest).await.unwrap();
        let (n, _) = udp.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[3 + 7..n], b"pong");

        // Dropping the control connection ends the association.
        drop(control);
        let res = tokio::time::timeout(Duration::from_secs(1), packets.recv_from(&mut buf))
            .await
            .unwrap();
        assert!(matches!(res, Err(ProxyError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_unknown_first_byte_is_dropped() {
        let server = start().await;
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        client.write_all(&[0x04]).await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_stops_accepting() {
        let server = start().await;
        server.close();
        assert!(matches!(server.accept_conn().await, Err(ProxyError::ConnectionClosed)));
    }
}
