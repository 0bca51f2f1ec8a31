//! SOCKS5 UDP demultiplexer
//!
//! One UDP socket serves every association. Datagrams are keyed by their
//! source address; each source gets a [`SocksPacketConn`] fed through a
//! bounded queue, and replies are framed as `00 00 00 ADDR payload` by a
//! per-session writer task.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::{Address, DecodeResult, Metadata, PacketConn};
use crate::error::{ProxyError, Result};
use crate::logger::log;
use crate::transport;

/// Per-session queue depth, both directions
pub const SESSION_QUEUE_DEPTH: usize = 16;

/// Smallest datagram worth parsing: RSV RSV FRAG plus an IPv4 address
pub const MIN_DATAGRAM_LEN: usize = 10;

/// Default idle timeout of a session
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(10);

const RECV_BUF_SIZE: usize = 64 * 1024;

type Datagram = (Bytes, Address);

/// One client's view of the shared SOCKS UDP socket
pub struct SocksPacketConn {
    inbound: tokio::sync::Mutex<mpsc::Receiver<Datagram>>,
    outbound: mpsc::Sender<Datagram>,
    metadata: Metadata,
    peer: SocketAddr,
    last_active: Arc<Mutex<Instant>>,
    cancel: CancellationToken,
}

impl SocksPacketConn {
    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }
}

#[async_trait]
impl PacketConn for SocksPacketConn {
    /// Next datagram from the client, with the destination it asked for
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Address)> {
        let mut rx = self.inbound.lock().await;
        let (payload, dest) = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ProxyError::ConnectionClosed),
            msg = rx.recv() => msg.ok_or(ProxyError::ConnectionClosed)?,
        };
        let n = payload.len().min(buf.len());
        buf[..n].copy_from_slice(&payload[..n]);
        Ok((n, dest))
    }

    /// Queue a reply to the client; `target` is the address it came from
    async fn send_to(&self, buf: &[u8], target: &Address) -> Result<usize> {
        let msg = (Bytes::copy_from_slice(buf), target.clone());
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ProxyError::ConnectionClosed),
            res = self.outbound.send(msg) => {
                res.map_err(|_| ProxyError::ConnectionClosed)?;
                self.touch();
                Ok(buf.len())
            }
        }
    }

    fn close(&self) {
        self.cancel.cancel();
    }

    fn metadata(&self) -> Option<Metadata> {
        Some(self.metadata.clone())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }
}

/// Demux-side handle of a session
struct SessionEntry {
    inbound: mpsc::Sender<Datagram>,
    last_active: Arc<Mutex<Instant>>,
    cancel: CancellationToken,
}

pub struct SocksUdpDemux {
    socket: Arc<UdpSocket>,
    sessions: DashMap<SocketAddr, Arc<SessionEntry>>,
    packet_tx: mpsc::Sender<Arc<dyn PacketConn>>,
    timeout: Duration,
    cancel: CancellationToken,
}

impl SocksUdpDemux {
    pub fn new(
        socket: Arc<UdpSocket>,
        packet_tx: mpsc::Sender<Arc<dyn PacketConn>>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            socket,
            sessions: DashMap::new(),
            packet_tx,
            timeout,
            cancel,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Read datagrams until cancelled, routing each to its session
    pub async fn serve(self: &Arc<Self>) -> Result<()> {
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        loop {
            let res = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                res = self.socket.recv_from(&mut buf) => res,
            };
            let (n, src) = match res {
                Ok(received) => received,
                Err(e) => {
                    if transport::recover(&e, "receive socks datagram", &self.cancel).await {
                        continue;
                    }
                    if self.cancel.is_cancelled() {
                        return Ok(());
                    }
                    return Err(e.into());
                }
            };
            if n < MIN_DATAGRAM_LEN {
                log::debug!(peer = %src, len = n, "ignoring short socks datagram");
                continue;
            }
            if buf[2] != 0 {
                log::debug!(peer = %src, "dropping fragmented socks datagram");
                continue;
            }
            let (dest, consumed) = match Address::decode(&buf[3..n]) {
                DecodeResult::Ok(addr, len) => (addr, len),
                _ => {
                    log::debug!(peer = %src, "failed to parse socks datagram");
                    continue;
                }
            };
            let payload = Bytes::copy_from_slice(&buf[3 + consumed..n]);

            let entry = match self.sessions.get(&src).map(|e| e.value().clone()) {
                Some(entry) => entry,
                None => match self.open_session(src, &dest).await {
                    Some(entry) => entry,
                    None => return Ok(()),
                },
            };
            *entry.last_active.lock() = Instant::now();
            match entry.inbound.try_send((payload, dest)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!(peer = %src, "udp queue full");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.remove(&src, &entry);
                }
            }
        }
    }

    /// Create and publish a session; None when the server is shutting down
    async fn open_session(self: &Arc<Self>, src: SocketAddr, dest: &Address) -> Option<Arc<SessionEntry>> {
        let (in_tx, in_rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
        let (out_tx, out_rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
        let last_active = Arc::new(Mutex::new(Instant::now()));
        let cancel = self.cancel.child_token();

        let entry = Arc::new(SessionEntry {
            inbound: in_tx,
            last_active: last_active.clone(),
            cancel: cancel.clone(),
        });
        let conn = Arc::new(SocksPacketConn {
            inbound: tokio::sync::Mutex::new(in_rx),
            outbound: out_tx,
            metadata: Metadata::associate(dest.clone()),
            peer: src,
            last_active,
            cancel,
        });
        self.sessions.insert(src, entry.clone());
        log::debug!(peer = %src, flow = %conn.metadata, "new socks udp session");

        let demux = Arc::clone(self);
        let writer_entry = entry.clone();
        tokio::spawn(async move {
            // Unregister however the writer ends, including task abort.
            let _guard = scopeguard::guard((Arc::clone(&demux), writer_entry.clone()), move |(d, e)| {
                d.remove(&src, &e);
            });
            demux.write_loop(src, &writer_entry, out_rx).await;
        });

        tokio::select! {
            _ = self.cancel.cancelled() => None,
            res = self.packet_tx.send(conn) => res.ok().map(|_| entry),
        }
    }

    /// Frame replies for `src` until the session idles out or is closed
    async fn write_loop(&self, src: SocketAddr, entry: &SessionEntry, mut out_rx: mpsc::Receiver<Datagram>) {
        let mut frame = Vec::with_capacity(RECV_BUF_SIZE);
        loop {
            let deadline = *entry.last_active.lock() + self.timeout;
            let msg = tokio::select! {
                _ = entry.cancel.cancelled() => return,
                res = tokio::time::timeout_at(deadline, out_rx.recv()) => res,
            };
            let (payload, from) = match msg {
                Ok(Some(msg)) => msg,
                Ok(None) => return,
                Err(_) => {
                    // Inbound traffic may have moved the deadline.
                    if *entry.last_active.lock() + self.timeout > Instant::now() {
                        continue;
                    }
                    log::debug!(peer = %src, "socks udp session timeout");
                    return;
                }
            };

            frame.clear();
            frame.extend_from_slice(&[0, 0, 0]);
            if from.encode(&mut frame).is_err() {
                continue;
            }
            frame.extend_from_slice(&payload);
            if let Err(e) = self.socket.send_to(&frame, src).await {
                log::debug!(peer = %src, error = %e, "socks udp reply failed");
                return;
            }
        }
    }

    /// Drop `entry` if it is still the session registered for `src`
    fn remove(&self, src: &SocketAddr, entry: &Arc<SessionEntry>) {
        self.sessions.remove_if(src, |_, current| Arc::ptr_eq(current, entry));
        entry.cancel.cancel();
    }

    /// Tear down the sessions belonging to an association whose control
    /// connection came from `control_peer`. A concrete `requested` address
    /// selects exactly one session; otherwise every session from that host
    /// goes.
    pub fn release(&self, control_peer: SocketAddr, requested: &Address) {
        let exact = match requested {
            Address::IPv4(..) | Address::IPv6(..) if requested.port() != 0 => requested
                .ip()
                .filter(|ip| !ip.is_unspecified())
                .map(|ip| SocketAddr::new(ip, requested.port())),
            _ => None,
        };
        let host: IpAddr = control_peer.ip();
        self.sessions.retain(|peer, entry| {
            let matches = match exact {
                Some(addr) => *peer == addr,
                None => peer.ip() == host,
            };
            if matches {
                entry.cancel.cancel();
            }
            !matches
        });
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}
