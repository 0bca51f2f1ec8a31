//! Plain-UDP relay endpoints built on [`SessionTable`]
//!
//! Between client and server every datagram is `ADDR ++ payload`, where
//! ADDR is the destination (client to server) or the source (server to
//! client).
//!
//! ```text
//! user --UDP--> UdpRelayClient --ADDR+payload--> UdpRelayServer --payload--> target
//! user <--UDP-- UdpRelayClient <--ADDR+payload-- UdpRelayServer <--payload-- target
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use super::table::{Role, SessionTable, UDP_BUF_SIZE};
use crate::core::{Address, DecodeResult, PacketConn};
use crate::error::{ProxyError, Result};
use crate::logger::log;
use crate::outbound::{bind_dual_stack, UdpPacketConn};
use crate::transport;

/// Opens the outbound socket of a new session
pub type SessionSocketFn = Arc<dyn Fn() -> Result<UdpSocket> + Send + Sync>;

fn default_session_socket() -> SessionSocketFn {
    Arc::new(bind_dual_stack)
}

/// Receive the next datagram, riding out per-datagram errors. `None` once
/// `cancel` fires or the listener is closed; `Err` when it is unusable.
async fn next_datagram(
    conn: &UdpPacketConn,
    buf: &mut [u8],
    cancel: &CancellationToken,
) -> Option<Result<(usize, Address)>> {
    loop {
        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            res = conn.recv_from(buf) => res,
        };
        match res {
            Ok(received) => return Some(Ok(received)),
            Err(ProxyError::ConnectionClosed) => return None,
            Err(ProxyError::Io(e)) => {
                if !transport::recover(&e, "receive relay datagram", cancel).await {
                    return (!cancel.is_cancelled()).then(|| Err(e.into()));
                }
            }
            Err(e) => log::warn!(error = %e, "Failed to receive relay datagram"),
        }
    }
}

/// Look up the session of `peer`, opening one when missing. `None` when the
/// outbound socket cannot be opened; only this datagram is lost.
fn session_for(
    table: &Arc<SessionTable>,
    listener: &Arc<UdpPacketConn>,
    open: &SessionSocketFn,
    peer: &Address,
    role: Role,
) -> Option<Arc<dyn PacketConn>> {
    if let Some(conn) = table.get(&peer.to_string()) {
        return Some(conn);
    }
    let socket = match open() {
        Ok(socket) => socket,
        Err(e) => {
            log::warn!(peer = %peer, error = %e, "failed to open udp relay session");
            return None;
        }
    };
    let conn: Arc<dyn PacketConn> = Arc::new(UdpPacketConn::new(Arc::new(socket)));
    log::debug!(peer = %peer, role = ?role, "new udp relay session");
    table.add(peer.clone(), listener.clone(), conn.clone(), role);
    Some(conn)
}

/// Server end: unwraps `ADDR ++ payload` and sends the payload to ADDR
/// through a per-peer socket
pub struct UdpRelayServer {
    listener: Arc<UdpPacketConn>,
    table: Arc<SessionTable>,
    open_session: SessionSocketFn,
    cancel: CancellationToken,
}

impl UdpRelayServer {
    pub fn bind(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let socket = transport::bind_udp(addr)?;
        log::info!(address = %socket.local_addr()?, "udp relay server listening");
        Ok(Self {
            listener: Arc::new(UdpPacketConn::new(Arc::new(socket))),
            table: Arc::new(SessionTable::new(timeout)),
            open_session: default_session_socket(),
            cancel: CancellationToken::new(),
        })
    }

    /// Replace how per-peer outbound sockets are opened
    pub fn with_session_socket(mut self, open: SessionSocketFn) -> Self {
        self.open_session = open;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn sessions(&self) -> usize {
        self.table.len()
    }

    pub async fn serve(&self) -> Result<()> {
        let mut buf = vec![0u8; UDP_BUF_SIZE];
        loop {
            let Some(res) = next_datagram(&self.listener, &mut buf, &self.cancel).await else {
                return Ok(());
            };
            let (n, peer) = res?;
            let (target, consumed) = match Address::decode(&buf[..n]) {
                DecodeResult::Ok(addr, len) => (addr, len),
                _ => {
                    log::debug!(peer = %peer, "dropping datagram without target address");
                    continue;
                }
            };

            let Some(outbound) =
                session_for(&self.table, &self.listener, &self.open_session, &peer, Role::RemoteServer)
            else {
                continue;
            };
            if let Err(e) = outbound.send_to(&buf[consumed..n], &target).await {
                log::debug!(peer = %peer, target = %target, error = %e, "udp relay send failed");
            }
        }
    }

    pub fn close(&self) {
        self.cancel.cancel();
        self.table.close();
        self.listener.close();
    }
}

/// What the relay client reads from its users
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMode {
    /// SOCKS5 UDP datagrams: RSV RSV FRAG ADDR payload
    Socks,
    /// Bare payloads, all bound for one target
    Tunnel(Address),
}

/// Client end: turns user datagrams into `ADDR ++ payload` for the relay
/// server and rewrites replies on the way back
pub struct UdpRelayClient {
    listener: Arc<UdpPacketConn>,
    server: Address,
    mode: RelayMode,
    table: Arc<SessionTable>,
    open_session: SessionSocketFn,
    cancel: CancellationToken,
}

impl UdpRelayClient {
    pub async fn bind(
        addr: SocketAddr,
        server: &Address,
        mode: RelayMode,
        timeout: Duration,
    ) -> Result<Self> {
        let socket = transport::bind_udp(addr)?;
        // Resolve once; every session talks to the same server.
        let server = Address::from(server.to_socket_addr().await?);
        log::info!(address = %socket.local_addr()?, server = %server, mode = ?mode, "udp relay client listening");
        Ok(Self {
            listener: Arc::new(UdpPacketConn::new(Arc::new(socket))),
            server,
            mode,
            table: Arc::new(SessionTable::new(timeout)),
            open_session: default_session_socket(),
            cancel: CancellationToken::new(),
        })
    }

    /// Replace how per-user outbound sockets are opened
    pub fn with_session_socket(mut self, open: SessionSocketFn) -> Self {
        self.open_session = open;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn sessions(&self) -> usize {
        self.table.len()
    }

    fn role(&self) -> Role {
        match self.mode {
            RelayMode::Socks => Role::SocksClient,
            RelayMode::Tunnel(_) => Role::RelayClient,
        }
    }

    /// Build the relay datagram for one user datagram
    fn annotate(&self, datagram: &[u8], out: &mut Vec<u8>) -> Result<bool> {
        out.clear();
        match &self.mode {
            RelayMode::Socks => {
                // RSV RSV FRAG, then ADDR payload which passes through as is
                if datagram.len() < 3 || datagram[2] != 0 {
                    return Ok(false);
                }
                out.extend_from_slice(&datagram[3..]);
            }
            RelayMode::Tunnel(target) => {
                target.encode(out)?;
                out.extend_from_slice(datagram);
            }
        }
        Ok(true)
    }

    pub async fn serve(&self) -> Result<()> {
        let mut buf = vec![0u8; UDP_BUF_SIZE];
        let mut out = Vec::with_capacity(UDP_BUF_SIZE);
        loop {
            let Some(res) = next_datagram(&self.listener, &mut buf, &self.cancel).await else {
                return Ok(());
            };
            let (n, peer) = res?;
            match self.annotate(&buf[..n], &mut out) {
                Ok(true) => {}
                Ok(false) => {
                    log::debug!(peer = %peer, "dropping fragmented or short socks datagram");
                    continue;
                }
                Err(e) => {
                    log::debug!(peer = %peer, error = %e, "failed to frame relay datagram");
                    continue;
                }
            }

            let Some(outbound) =
                session_for(&self.table, &self.listener, &self.open_session, &peer, self.role())
            else {
                continue;
            };
            match outbound.send_to(&out, &self.server).await {
                Ok(_) => {}
                Err(ProxyError::ConnectionClosed) => {}
                Err(e) => log::debug!(peer = %peer, error = %e, "udp relay client send failed"),
            }
        }
    }

    pub fn close(&self) {
        self.cancel.cancel();
        self.table.close();
        self.listener.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WAIT: Duration = Duration::from_secs(5);

    async fn udp_echo() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&buf[..n], from).await;
            }
        });
        addr
    }

    /// Fails the first `failures` session opens, then binds normally
    fn flaky_session_socket(failures: usize) -> (SessionSocketFn, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let open: SessionSocketFn = Arc::new({
            let calls = calls.clone();
            move || {
                if calls.fetch_add(1, Ordering::SeqCst) < failures {
                    return Err(std::io::Error::from_raw_os_error(24).into());
                }
                transport::bind_udp("127.0.0.1:0".parse().unwrap())
            }
        });
        (open, calls)
    }

    #[tokio::test]
    async fn test_server_survives_failed_session_open() {
        let echo = udp_echo().await;
        let (open, calls) = flaky_session_socket(1);
        let server = Arc::new(
            UdpRelayServer::bind("127.0.0.1:0".parse().unwrap(), Duration::from_secs(5))
                .unwrap()
                .with_session_socket(open),
        );
        let server_addr = server.local_addr().unwrap();
        let task = tokio::spawn({
            let server = server.clone();
            async move { server.serve().await }
        });

        let user = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut datagram = Address::from(echo).to_bytes().unwrap();
        datagram.extend_from_slice(b"ping");

        // First datagram is lost with its session
        user.send_to(&datagram, server_addr).await.unwrap();
        let mut buf = [0u8; 64];
        let lost = tokio::time::timeout(Duration::from_millis(200), user.recv_from(&mut buf)).await;
        assert!(lost.is_err());
        assert_eq!(server.sessions(), 0);
        assert!(!task.is_finished());

        user.send_to(&datagram, server_addr).await.unwrap();
        let (n, _) = tokio::time::timeout(WAIT, user.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], &datagram[..]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(server.sessions(), 1);

        server.close();
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_client_survives_failed_session_open() {
        let echo = udp_echo().await;
        let server = Arc::new(UdpRelayServer::bind("127.0.0.1:0".parse().unwrap(), Duration::from_secs(5)).unwrap());
        let server_addr = Address::from(server.local_addr().unwrap());
        tokio::spawn({
            let server = server.clone();
            async move { server.serve().await }
        });

        let (open, _calls) = flaky_session_socket(1);
        let client = Arc::new(
            UdpRelayClient::bind(
                "127.0.0.1:0".parse().unwrap(),
                &server_addr,
                RelayMode::Tunnel(Address::from(echo)),
                Duration::from_secs(5),
            )
            .await
            .unwrap()
            .with_session_socket(open),
        );
        let client_addr = client.local_addr().unwrap();
        let task = tokio::spawn({
            let client = client.clone();
            async move { client.serve().await }
        });

        let user = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut buf = [0u8; 64];
        user.send_to(b"first", client_addr).await.unwrap();
        let lost = tokio::time::timeout(Duration::from_millis(200), user.recv_from(&mut buf)).await;
        assert!(lost.is_err());
        assert!(!task.is_finished());

        user.send_to(b"second", client_addr).await.unwrap();
        let (n, _) = tokio::time::timeout(WAIT, user.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"second");

        client.close();
        server.close();
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_client_drops_unframeable_datagram() {
        let server = Address::IPv4([127, 0, 0, 1], 9);
        let long = Address::Domain("a".repeat(300), 53);
        let client = Arc::new(
            UdpRelayClient::bind("127.0.0.1:0".parse().unwrap(), &server, RelayMode::Tunnel(long), Duration::from_secs(1))
                .await
                .unwrap(),
        );
        let client_addr = client.local_addr().unwrap();
        let task = tokio::spawn({
            let client = client.clone();
            async move { client.serve().await }
        });

        let user = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        user.send_to(b"x", client_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!task.is_finished());
        assert_eq!(client.sessions(), 0);

        client.close();
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_annotate_modes() {
        let server = Address::IPv4([127, 0, 0, 1], 9);
        let target = Address::IPv4([8, 8, 8, 8], 53);
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let timeout = Duration::from_secs(1);

        let socks = UdpRelayClient::bind(any, &server, RelayMode::Socks, timeout).await.unwrap();
        let mut out = Vec::new();
        let mut datagram = vec![0, 0, 0];
        datagram.extend_from_slice(&target.to_bytes().unwrap());
        datagram.extend_from_slice(b"q");
        assert!(socks.annotate(&datagram, &mut out).unwrap());
        assert_eq!(out, &datagram[3..]);

        datagram[2] = 1;
        assert!(!socks.annotate(&datagram, &mut out).unwrap());
        assert!(!socks.annotate(&[0, 0], &mut out).unwrap());
        assert_eq!(socks.role(), Role::SocksClient);

        let tunnel = UdpRelayClient::bind(any, &server, RelayMode::Tunnel(target.clone()), timeout)
            .await
            .unwrap();
        assert!(tunnel.annotate(b"q", &mut out).unwrap());
        assert_eq!(&out[..7], target.to_bytes().unwrap().as_slice());
        assert_eq!(&out[7..], b"q");
        assert_eq!(tunnel.role(), Role::RelayClient);
    }
}
