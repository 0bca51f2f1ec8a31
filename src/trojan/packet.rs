//! Datagrams carried as UDP envelopes over a Trojan stream
//!
//! The same type serves both ends. On the server, `recv_from` yields the
//! destination a client asked for and `send_to` frames replies with their
//! source. On the client the roles swap: `send_to` frames the destination,
//! `recv_from` yields the source.

use async_trait::async_trait;
use bytes::BytesMut;
use std::net::SocketAddr;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::protocol::{read_envelope, UdpEnvelope, MAX_PACKET_SIZE};
use crate::core::{Address, Metadata, PacketConn};
use crate::error::{ProxyError, Result};
use crate::transport::BoxStream;

struct ReadState {
    reader: ReadHalf<BoxStream>,
    buffered: BytesMut,
    first: Option<UdpEnvelope>,
}

pub struct TrojanPacketConn {
    read: Mutex<ReadState>,
    write: Mutex<WriteHalf<BoxStream>>,
    metadata: Option<Metadata>,
    peer: Option<SocketAddr>,
    cancel: CancellationToken,
}

impl TrojanPacketConn {
    pub fn new(stream: BoxStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            read: Mutex::new(ReadState {
                reader,
                buffered: BytesMut::with_capacity(MAX_PACKET_SIZE),
                first: None,
            }),
            write: Mutex::new(writer),
            metadata: None,
            peer: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Server side: the request already carried the first envelope, plus any
    /// bytes read past it
    pub fn inbound(
        stream: BoxStream,
        metadata: Metadata,
        peer: SocketAddr,
        first: UdpEnvelope,
        buffered: BytesMut,
    ) -> Self {
        let mut conn = Self::new(stream);
        conn.metadata = Some(metadata);
        conn.peer = Some(peer);
        let state = conn.read.get_mut();
        state.first = Some(first);
        state.buffered = buffered;
        conn
    }

    async fn next_envelope(&self) -> Result<UdpEnvelope> {
        let mut state = self.read.lock().await;
        if let Some(first) = state.first.take() {
            return Ok(first);
        }
        let ReadState {
            reader, buffered, ..
        } = &mut *state;
        read_envelope(reader, buffered).await
    }
}

#[async_trait]
impl PacketConn for TrojanPacketConn {
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Address)> {
        let env = tokio::select! {
            _ = self.cancel.cancelled() => return Err(ProxyError::ConnectionClosed),
            env = self.next_envelope() => env?,
        };
        // Oversized datagrams are truncated, as a UDP socket would.
        let n = env.payload.len().min(buf.len());
        buf[..n].copy_from_slice(&env.payload[..n]);
        Ok((n, env.address))
    }

    async fn send_to(&self, buf: &[u8], target: &Address) -> Result<usize> {
        let mut frame = BytesMut::with_capacity(target.encoded_len() + 4 + buf.len());
        UdpEnvelope::encode_to(target, buf, &mut frame)?;
        let write = async {
            let mut writer = self.write.lock().await;
            writer.write_all(&frame).await?;
            writer.flush().await?;
            Ok::<_, ProxyError>(())
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ProxyError::ConnectionClosed),
            res = write => res.map(|_| buf.len()),
        }
    }

    fn close(&self) {
        self.cancel.cancel();
    }

    fn metadata(&self) -> Option<Metadata> {
        self.metadata.clone()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_send_frames_envelope() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let conn = TrojanPacketConn::new(Box::pin(local));
        let dest = Address::IPv4([8, 8, 4, 4], 53);
        assert_eq!(conn.send_to(b"query", &dest).await.unwrap(), 5);

        let expected = UdpEnvelope::new(dest, Bytes::from_static(b"query")).encode().unwrap();
        let mut buf = vec![0u8; expected.len()];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected.as_ref());
    }

    #[tokio::test]
    async fn test_inbound_yields_first_packet_then_stream() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let first = UdpEnvelope::new(Address::IPv4([1, 1, 1, 1], 53), Bytes::from_static(b"one"));
        let second = UdpEnvelope::new(Address::Domain("dns.google".into(), 53), Bytes::from_static(b"two"));
        let md = Metadata::associate(first.address.clone());

        // Half of the second envelope was already buffered by the header read.
        let wire = second.encode().unwrap();
        let (head, tail) = wire.split_at(5);
        let conn = TrojanPacketConn::inbound(
            Box::pin(local),
            md.clone(),
            "127.0.0.1:5000".parse().unwrap(),
            first.clone(),
            BytesMut::from(head),
        );
        assert_eq!(conn.metadata(), Some(md));
        remote.write_all(tail).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, addr) = conn.recv_from(&mut buf).await.unwrap();
        assert_eq!((&buf[..n], addr), (&b"one"[..], first.address));
        let (n, addr) = conn.recv_from(&mut buf).await.unwrap();
        assert_eq!((&buf[..n], addr), (&b"two"[..], second.address));
    }

    #[tokio::test]
    async fn test_recv_after_peer_close() {
        let (local, remote) = tokio::io::duplex(64);
        let conn = TrojanPacketConn::new(Box::pin(local));
        drop(remote);
        let mut buf = [0u8; 16];
        assert!(conn.recv_from(&mut buf).await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_close_unblocks_reader() {
        let (local, _remote) = tokio::io::duplex(64);
        let conn = std::sync::Arc::new(TrojanPacketConn::new(Box::pin(local)));
        let reader = {
            let conn = conn.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                conn.recv_from(&mut buf).await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        conn.close();
        assert!(matches!(
            reader.await.unwrap(),
            Err(ProxyError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_cancelled_recv_keeps_partial_envelope() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let conn = TrojanPacketConn::new(Box::pin(local));
        let env = UdpEnvelope::new(Address::IPv4([9, 9, 9, 9], 53), Bytes::from_static(b"answer"));
        let wire = env.encode().unwrap();
        let (head, tail) = wire.split_at(6);

        remote.write_all(head).await.unwrap();
        let mut buf = [0u8; 64];
        let res = tokio::time::timeout(std::time::Duration::from_millis(20), conn.recv_from(&mut buf)).await;
        assert!(res.is_err());

        remote.write_all(tail).await.unwrap();
        let (n, addr) = conn.recv_from(&mut buf).await.unwrap();
        assert_eq!((&buf[..n], addr), (&b"answer"[..], env.address));
    }
}
