//! UDP NAT session table
//!
//! Maps a peer's transport address to the socket that carries its flow.
//! Each entry owns a copy loop that moves datagrams from that socket back
//! toward the peer, rewriting them according to a [`Role`].

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::{Address, DecodeResult, PacketConn};
use crate::error::Result;
use crate::logger::log;

/// Largest datagram the copy loop reads
pub const UDP_BUF_SIZE: usize = 64 * 1024;

/// Default idle timeout of an entry
pub const DEFAULT_NAT_TIMEOUT: Duration = Duration::from_secs(60);

/// How a datagram read from the session socket is rewritten
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Relay server to relay client: prepend the datagram's source address
    RemoteServer,
    /// Relay client to a bare-UDP user: strip the leading address
    RelayClient,
    /// Relay client to a SOCKS5 program: prepend RSV RSV FRAG
    SocksClient,
}

impl Role {
    /// Rewrite `payload` (received from `from`) into `out`.
    /// Returns false when the datagram must be dropped.
    pub fn transform(&self, payload: &[u8], from: &Address, out: &mut Vec<u8>) -> bool {
        out.clear();
        match self {
            Role::RemoteServer => {
                if from.encode(out).is_err() {
                    return false;
                }
                out.extend_from_slice(payload);
            }
            Role::RelayClient => match Address::decode(payload) {
                DecodeResult::Ok(_, consumed) => out.extend_from_slice(&payload[consumed..]),
                _ => return false,
            },
            Role::SocksClient => {
                out.extend_from_slice(&[0, 0, 0]);
                out.extend_from_slice(payload);
            }
        }
        true
    }
}

pub struct SessionTable {
    sessions: RwLock<HashMap<String, Arc<dyn PacketConn>>>,
    timeout: Duration,
    cancel: CancellationToken,
}

impl SessionTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn PacketConn>> {
        self.sessions.read().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, conn: Arc<dyn PacketConn>) {
        self.sessions.write().insert(key.into(), conn);
    }

    pub fn del(&self, key: &str) -> Option<Arc<dyn PacketConn>> {
        self.sessions.write().remove(key)
    }

    /// Remove `key` only while it still maps to `conn`
    pub fn del_if_current(&self, key: &str, conn: &Arc<dyn PacketConn>) -> Option<Arc<dyn PacketConn>> {
        let mut sessions = self.sessions.write();
        match sessions.get(key) {
            Some(current) if Arc::ptr_eq(current, conn) => sessions.remove(key),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Register `src` under `peer` and copy its datagrams to `dst`, addressed
    /// to `peer`. The entry is removed and `src` closed when the loop ends.
    /// A session already registered under `peer` is closed and replaced.
    pub fn add(
        self: &Arc<Self>,
        peer: Address,
        dst: Arc<dyn PacketConn>,
        src: Arc<dyn PacketConn>,
        role: Role,
    ) -> JoinHandle<()> {
        let key = peer.to_string();
        let displaced = self.sessions.write().insert(key.clone(), src.clone());
        if let Some(old) = displaced.filter(|old| !Arc::ptr_eq(old, &src)) {
            log::debug!(peer = %key, "replacing udp session");
            old.close();
        }

        let table = Arc::clone(self);
        tokio::spawn(async move {
            let result = table.timed_copy(&peer, dst.as_ref(), src.as_ref(), role).await;
            match result {
                Err(e) if e.is_timeout() || e.is_closed() => {
                    log::debug!(peer = %key, "udp session expired");
                }
                Err(e) => log::debug!(peer = %key, error = %e, "udp session ended"),
                Ok(()) => {}
            }
            // Only the loop that removes its own entry closes it.
            if let Some(conn) = table.del_if_current(&key, &src) {
                conn.close();
            }
        })
    }

    async fn timed_copy(
        &self,
        peer: &Address,
        dst: &dyn PacketConn,
        src: &dyn PacketConn,
        role: Role,
    ) -> Result<()> {
        let mut buf = vec![0u8; UDP_BUF_SIZE];
        let mut out = Vec::with_capacity(UDP_BUF_SIZE);
        loop {
            let (n, from) = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                res = tokio::time::timeout(self.timeout, src.recv_from(&mut buf)) => res??,
            };
            if !role.transform(&buf[..n], &from, &mut out) {
                log::debug!(from = %from, "dropping undecodable datagram");
                continue;
            }
            dst.send_to(&out, peer).await?;
        }
    }

    /// Stop every copy loop; entries close themselves as the loops exit
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new(DEFAULT_NAT_TIMEOUT)
    }
}

impl std::fmt::Debug for SessionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTable")
            .field("sessions", &self.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}
