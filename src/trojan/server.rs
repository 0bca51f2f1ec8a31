//! Trojan inbound server
//!
//! Accepts TCP (optionally TLS), authenticates the 56-byte hash and hands
//! authenticated flows to the consumer through two bounded queues. Anything
//! that does not look like an authenticated Trojan client is replayed to a
//! decoy backend so the listener behaves like an ordinary web server.

use async_trait::async_trait;
use bytes::BytesMut;
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use super::packet::TrojanPacketConn;
use super::protocol::{is_hash_byte, read_envelope, UdpEnvelope, CRLF, HASH_LEN};
use crate::config::{ConnConfig, DEFAULT_MAX_DECOY_SESSIONS};
use crate::core::{
    relay, Action, Address, Command, InboundConn, InboundKind, InboundServer, Metadata,
    PacketConn, TrojanHook,
};
use crate::error::{ProxyError, Result};
use crate::logger::log;
use crate::outbound::DirectDialer;
use crate::transport::{self, BoxStream};

/// Depth of the conn and packet handoff queues
pub const ACCEPT_QUEUE_DEPTH: usize = 32;

/// Outcome of reading the password hash
enum HashRead {
    /// Nothing arrived; there is nothing to replay
    Empty,
    /// Fewer than 56 hash bytes; the bytes are replayed to the decoy
    Partial(Vec<u8>),
    Complete(Vec<u8>),
}

struct Shared {
    hook: Option<Arc<dyn TrojanHook>>,
    front: Option<Address>,
    decoy: Arc<Semaphore>,
    dialer: DirectDialer,
    conn_config: ConnConfig,
    conn_tx: mpsc::Sender<InboundConn>,
    packet_tx: mpsc::Sender<Arc<dyn PacketConn>>,
    cancel: CancellationToken,
}

pub struct TrojanServer {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    shared: Arc<Shared>,
    conn_rx: Mutex<mpsc::Receiver<InboundConn>>,
    packet_rx: Mutex<mpsc::Receiver<Arc<dyn PacketConn>>>,
}

/// Builder for [`TrojanServer`]
pub struct TrojanServerBuilder {
    tls: Option<Arc<ServerConfig>>,
    hook: Option<Arc<dyn TrojanHook>>,
    front: Option<Address>,
    max_decoy_sessions: usize,
    conn_config: ConnConfig,
}

impl Default for TrojanServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TrojanServerBuilder {
    pub fn new() -> Self {
        Self {
            tls: None,
            hook: None,
            front: None,
            max_decoy_sessions: DEFAULT_MAX_DECOY_SESSIONS,
            conn_config: ConnConfig::default(),
        }
    }

    /// Terminate TLS on accepted connections
    pub fn tls(mut self, config: Arc<ServerConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    pub fn hook(mut self, hook: Arc<dyn TrojanHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Decoy backend for connections that fail authentication
    pub fn front(mut self, front: Address) -> Self {
        self.front = Some(front);
        self
    }

    pub fn max_decoy_sessions(mut self, max: usize) -> Self {
        self.max_decoy_sessions = max;
        self
    }

    pub fn conn_config(mut self, config: ConnConfig) -> Self {
        self.conn_config = config;
        self
    }

    /// Bind the listener; accepting starts with `listen_and_serve`
    pub fn bind(self, addr: SocketAddr) -> Result<TrojanServer> {
        let listener = transport::bind_tcp(addr, self.conn_config.tcp_backlog)?;
        let local_addr = listener.local_addr()?;
        let (conn_tx, conn_rx) = mpsc::channel(ACCEPT_QUEUE_DEPTH);
        let (packet_tx, packet_rx) = mpsc::channel(ACCEPT_QUEUE_DEPTH);
        let cfg = self.conn_config;
        Ok(TrojanServer {
            listener: Mutex::new(Some(listener)),
            local_addr,
            acceptor: self.tls.map(TlsAcceptor::from),
            shared: Arc::new(Shared {
                hook: self.hook,
                front: self.front,
                decoy: Arc::new(Semaphore::new(self.max_decoy_sessions)),
                dialer: DirectDialer::new(cfg.connect_timeout, cfg.udp_timeout)
                    .with_nodelay(cfg.tcp_nodelay),
                conn_config: cfg,
                conn_tx,
                packet_tx,
                cancel: CancellationToken::new(),
            }),
            conn_rx: Mutex::new(conn_rx),
            packet_rx: Mutex::new(packet_rx),
        })
    }
}

impl TrojanServer {
    pub fn builder() -> TrojanServerBuilder {
        TrojanServerBuilder::new()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the Trojan handshake on an already-accepted stream
    pub async fn serve_stream(&self, stream: BoxStream, peer: SocketAddr) -> Result<()> {
        self.shared.serve_stream(stream, peer).await
    }
}

impl Shared {
    async fn read_hash(&self, stream: &mut BoxStream) -> HashRead {
        let mut hash = [0u8; HASH_LEN];
        let mut filled = 0;
        let read = async {
            while filled < HASH_LEN {
                let n = stream.read(&mut hash[filled..]).await?;
                if n == 0 {
                    break;
                }
                let valid = hash[filled..filled + n].iter().all(|b| is_hash_byte(*b));
                filled += n;
                if !valid {
                    break;
                }
            }
            Ok::<_, std::io::Error>(())
        };
        let res = tokio::time::timeout(self.conn_config.request_timeout, read).await;
        match res {
            Ok(Err(e)) if filled == 0 => {
                log::debug!(error = %e, "read failed before any request bytes");
                return HashRead::Empty;
            }
            // Bytes read before the failure are still replayed.
            Ok(Err(e)) => log::debug!(error = %e, read = filled, "read failed mid-request"),
            Ok(Ok(())) | Err(_) => {}
        }

        let read = &hash[..filled];
        if filled == 0 {
            HashRead::Empty
        } else if filled < HASH_LEN || !read.iter().all(|b| is_hash_byte(*b)) {
            HashRead::Partial(read.to_vec())
        } else {
            HashRead::Complete(read.to_vec())
        }
    }

    async fn serve_stream(&self, mut stream: BoxStream, peer: SocketAddr) -> Result<()> {
        let raw = match self.read_hash(&mut stream).await {
            HashRead::Empty => {
                log::debug!(peer = %peer, "closed before sending a request");
                return Ok(());
            }
            HashRead::Partial(consumed) => {
                log::debug!(peer = %peer, read = consumed.len(), "not a trojan request");
                return self.fallback(stream, peer, &consumed).await;
            }
            HashRead::Complete(raw) => raw,
        };
        // Every byte is ASCII hex at this point.
        let password = String::from_utf8_lossy(&raw).to_ascii_lowercase();

        let hook = match &self.hook {
            Some(hook) if hook.auth(&password) => hook.clone(),
            _ => {
                log::authentication(&peer.to_string(), false);
                return self.fallback(stream, peer, &raw).await;
            }
        };
        log::authentication(&peer.to_string(), true);

        let header = tokio::time::timeout(
            self.conn_config.request_timeout,
            read_header(&mut stream),
        )
        .await
        .map_err(|_| ProxyError::Timeout)
        .and_then(|r| r);
        let header = match header {
            Ok(header) => header,
            Err(e) => {
                log::protocol("invalid trojan header", Some(&e.to_string()));
                return Err(e);
            }
        };
        let metadata = header.metadata();

        let action = hook.router(&password, &metadata);
        log::debug!(peer = %peer, flow = %metadata, action = ?action, "trojan request");
        match action {
            Action::Accept | Action::Proxy => self.enqueue(stream, header, password, peer).await,
            Action::Direct | Action::Reject => Ok(()),
            Action::Forward => {
                let mut upstream = hook.forward(&password, &metadata).await?;
                if let Header::Associate { first, buffered } = &header {
                    // The first envelope was consumed while parsing; pass it on.
                    upstream.write_all(&first.encode()?).await?;
                    upstream.write_all(buffered).await?;
                }
                let result = relay(stream, upstream, &self.cancel, self.conn_config.idle_timeout).await;
                log::debug!(peer = %peer, up = result.a_to_b, down = result.b_to_a, "forward finished");
                result.into_result().map(|_| ())
            }
        }
    }

    async fn enqueue(&self, stream: BoxStream, header: Header, password: String, peer: SocketAddr) -> Result<()> {
        match header {
            Header::Connect(address) => {
                let conn = InboundConn::new(
                    stream,
                    Metadata::connect(address),
                    peer,
                    InboundKind::Trojan { password },
                );
                tokio::select! {
                    _ = self.cancel.cancelled() => Err(ProxyError::ConnectionClosed),
                    res = self.conn_tx.send(conn) => res.map_err(|_| ProxyError::ConnectionClosed),
                }
            }
            Header::Associate { first, buffered } => {
                let metadata = Metadata::associate(first.address.clone());
                let conn: Arc<dyn PacketConn> = Arc::new(TrojanPacketConn::inbound(
                    stream, metadata, peer, first, buffered,
                ));
                tokio::select! {
                    _ = self.cancel.cancelled() => Err(ProxyError::ConnectionClosed),
                    res = self.packet_tx.send(conn) => res.map_err(|_| ProxyError::ConnectionClosed),
                }
            }
        }
    }

    /// Replay what was read to the decoy backend and relay the rest
    async fn fallback(&self, mut stream: BoxStream, peer: SocketAddr, consumed: &[u8]) -> Result<()> {
        let Some(front) = &self.front else {
            return Ok(());
        };
        let Ok(_permit) = self.decoy.clone().try_acquire_owned() else {
            log::warn!(peer = %peer, "decoy sessions exhausted, closing");
            return Ok(());
        };
        let mut upstream = match self.dialer.connect(front).await {
            Ok(upstream) => upstream,
            Err(e) => {
                log::debug!(peer = %peer, front = %front, error = %e, "decoy unreachable");
                let _ = stream.shutdown().await;
                return Ok(());
            }
        };
        upstream.write_all(consumed).await?;
        let result = relay(stream, upstream, &self.cancel, self.conn_config.idle_timeout).await;
        log::debug!(peer = %peer, up = result.a_to_b, down = result.b_to_a, "decoy finished");
        Ok(())
    }
}

enum Header {
    Connect(Address),
    Associate {
        first: UdpEnvelope,
        buffered: BytesMut,
    },
}

impl Header {
    fn metadata(&self) -> Metadata {
        match self {
            Header::Connect(address) => Metadata::connect(address.clone()),
            Header::Associate { first, .. } => Metadata::associate(first.address.clone()),
        }
    }
}

/// Read `CRLF CMD ADDR CRLF`, or `CRLF 03` plus the first envelope
async fn read_header(stream: &mut BoxStream) -> Result<Header> {
    let mut crlf = [0u8; 2];
    stream.read_exact(&mut crlf).await?;
    if &crlf != CRLF {
        return Err(ProxyError::MalformedRequest("missing CRLF after hash".into()));
    }
    match Command::try_from(stream.read_u8().await?)? {
        Command::Connect => {
            let address = Address::read_from(stream).await?;
            stream.read_exact(&mut crlf).await?;
            if &crlf != CRLF {
                return Err(ProxyError::MalformedRequest("missing CRLF after address".into()));
            }
            Ok(Header::Connect(address))
        }
        Command::UdpAssociate => {
            let mut buffered = BytesMut::new();
            let first = read_envelope(stream, &mut buffered).await?;
            Ok(Header::Associate { first, buffered })
        }
    }
}

#[async_trait]
impl InboundServer for TrojanServer {
    async fn listen_and_serve(&self) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or_else(|| ProxyError::Config("trojan server already started".into()))?;
        log::info!(
            address = %self.local_addr,
            tls = self.acceptor.is_some(),
            decoy = self.shared.front.is_some(),
            "Trojan server started"
        );

        loop {
            let Some((stream, peer)) =
                transport::accept_next(&self.shared.cancel, || listener.accept()).await?
            else {
                return Ok(());
            };
            log::connection(&peer.to_string(), "new");
            transport::tune_stream(&stream, self.shared.conn_config.tcp_nodelay);

            let shared = Arc::clone(&self.shared);
            let acceptor = self.acceptor.clone();
            tokio::spawn(async move {
                let stream: BoxStream = match acceptor {
                    Some(acceptor) => {
                        let handshake = acceptor.accept(stream);
                        match tokio::time::timeout(shared.conn_config.tls_handshake_timeout, handshake).await {
                            Ok(Ok(tls)) => Box::pin(tls),
                            Ok(Err(e)) => {
                                log::debug!(peer = %peer, error = %e, "TLS handshake failed");
                                return;
                            }
                            Err(_) => {
                                log::debug!(peer = %peer, "TLS handshake timeout");
                                return;
                            }
                        }
                    }
                    None => Box::pin(stream),
                };
                if let Err(e) = shared.serve_stream(stream, peer).await {
                    log::debug!(peer = %peer, error = %e, "trojan connection ended");
                }
                log::connection(&peer.to_string(), "closed");
            });
        }
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
