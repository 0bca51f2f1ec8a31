//! Trojan client dialer: TLS to the remote server, then a one-shot header

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsConnector;

use super::outbound::OutboundConn;
use super::packet::TrojanPacketConn;
use super::protocol::HASH_LEN;
use crate::core::{Address, Metadata, PacketConn};
use crate::error::{ProxyError, Result};
use crate::logger::log;
use crate::outbound::{DirectDialer, Dialer};
use crate::transport::{tls, BoxStream};

struct TlsSettings {
    connector: TlsConnector,
    server_name: ServerName<'static>,
    handshake_timeout: Duration,
}

pub struct TrojanDialer {
    server: Address,
    password: String,
    tcp: DirectDialer,
    tls: Option<TlsSettings>,
}

impl TrojanDialer {
    /// `password` is the 56-byte hex hash, not the raw secret
    pub fn new(server: Address, password: String, connect_timeout: Duration) -> Result<Self> {
        if password.len() != HASH_LEN {
            return Err(ProxyError::Config(format!(
                "password hash must be {} characters",
                HASH_LEN
            )));
        }
        Ok(Self {
            server,
            password,
            // UDP reads never go through the TCP dialer.
            tcp: DirectDialer::new(connect_timeout, Duration::ZERO),
            tls: None,
        })
    }

    /// Wrap every connection in TLS with `sni` as server name
    pub fn with_tls(
        mut self,
        config: Arc<ClientConfig>,
        sni: &str,
        handshake_timeout: Duration,
    ) -> Result<Self> {
        self.tls = Some(TlsSettings {
            connector: TlsConnector::from(config),
            server_name: tls::server_name(sni)?,
            handshake_timeout,
        });
        Ok(self)
    }

    pub fn server(&self) -> &Address {
        &self.server
    }

    /// Connect to the remote server; TLS when configured
    async fn open(&self) -> Result<BoxStream> {
        let tcp = self.tcp.connect(&self.server).await?;
        let Some(settings) = &self.tls else {
            return Ok(Box::pin(tcp));
        };
        let handshake = settings
            .connector
            .connect(settings.server_name.clone(), tcp);
        match tokio::time::timeout(settings.handshake_timeout, handshake).await {
            Ok(Ok(stream)) => Ok(Box::pin(stream)),
            Ok(Err(e)) => Err(ProxyError::Tls(format!("handshake with {}: {}", self.server, e))),
            Err(_) => Err(ProxyError::Timeout),
        }
    }

    /// Open a Trojan stream for `metadata`; the header goes out with the first write
    pub async fn dial(&self, metadata: Metadata) -> Result<OutboundConn<BoxStream>> {
        let stream = self.open().await?;
        log::debug!(server = %self.server, flow = %metadata, "trojan upstream opened");
        OutboundConn::new(stream, &self.password, metadata)
    }
}

#[async_trait]
impl Dialer for TrojanDialer {
    async fn dial_tcp(&self, target: &Address) -> Result<BoxStream> {
        let conn = self.dial(Metadata::connect(target.clone())).await?;
        Ok(Box::pin(conn))
    }

    async fn dial_udp(&self) -> Result<Arc<dyn PacketConn>> {
        // The UDP header stops at the command byte; the address travels in
        // each envelope, so this placeholder is never sent.
        let metadata = Metadata::associate(Address::IPv4([0, 0, 0, 0], 0));
        let conn = self.dial(metadata).await?;
        Ok(Arc::new(TrojanPacketConn::new(Box::pin(conn))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DecodeResult;
    use crate::trojan::protocol::{password_hash, TrojanRequest, UdpEnvelope};
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_rejects_raw_secret() {
        let server = Address::IPv4([127, 0, 0, 1], 443);
        assert!(TrojanDialer::new(server, "secret".into(), Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_plain_dial_tcp_sends_request_with_payload() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = Address::from(listener.local_addr().unwrap());
        let dialer = TrojanDialer::new(server, password_hash("pw"), Duration::from_secs(2)).unwrap();

        let target = Address::Domain("example.net".into(), 80);
        let accept = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let mut len = 0;
            loop {
                len += s.read(&mut buf[len..]).await.unwrap();
                if let DecodeResult::Ok(req, _) = TrojanRequest::decode(&buf[..len]) {
                    if !req.payload.is_empty() {
                        return req;
                    }
                }
            }
        });

        let mut stream = dialer.dial_tcp(&target).await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        let req = accept.await.unwrap();
        assert_eq!(req.password, password_hash("pw"));
        assert_eq!(req.metadata, Metadata::connect(target));
        assert_eq!(req.payload.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn test_plain_dial_udp_first_envelope_completes_header() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = Address::from(listener.local_addr().unwrap());
        let dialer = TrojanDialer::new(server, password_hash("pw"), Duration::from_secs(2)).unwrap();

        let dest = Address::IPv4([9, 9, 9, 9], 53);
        let expected_len = TrojanRequest::new(
            password_hash("pw"),
            Metadata::associate(dest.clone()),
            Bytes::from_static(b"q"),
        )
        .encode()
        .unwrap()
        .len();

        let accept = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; expected_len];
            s.read_exact(&mut buf).await.unwrap();
            // Reply with one envelope.
            let reply = UdpEnvelope::new(Address::IPv4([9, 9, 9, 9], 53), Bytes::from_static(b"a"));
            s.write_all(&reply.encode().unwrap()).await.unwrap();
            buf
        });

        let conn = dialer.dial_udp().await.unwrap();
        conn.send_to(b"q", &dest).await.unwrap();
        let wire = accept.await.unwrap();
        match TrojanRequest::decode(&wire) {
            DecodeResult::Ok(req, n) => {
                assert_eq!(n, wire.len());
                assert_eq!(req.metadata, Metadata::associate(dest.clone()));
                assert_eq!(req.payload.as_ref(), b"q");
            }
            other => panic!("unexpected decode result {:?}", other),
        }

        let mut buf = [0u8; 16];
        let (n, from) = conn.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"a");
        assert_eq!(from, dest);
    }
}
