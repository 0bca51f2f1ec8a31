//! Glue between inbound servers and outbound dialers
//!
//! The client side drains a SOCKS/HTTP server, asks a [`Match`] where each
//! flow goes and relays it directly or through the Trojan dialer. The server
//! side drains a Trojan server and sends everything out directly.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::config::ConnConfig;
use crate::core::{relay, Adapter, Address, InboundConn, InboundServer, Match, Metadata, PacketConn};
use crate::error::{ProxyError, Result};
use crate::logger::log;
use crate::nat::UDP_BUF_SIZE;
use crate::outbound::Dialer;
use crate::transport::BoxStream;

/// How long to wait for a client's first bytes so they can share a packet
/// with the Trojan header
pub const FIRST_PAYLOAD_WAIT: Duration = Duration::from_millis(100);

const FIRST_READ_SIZE: usize = 16 * 1024;

/// Where a client-side flow goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Dial this address directly
    Direct(Address),
    /// Through the Trojan server
    Proxy,
    Reject,
}

/// Routing decision for one flow: port allow-list, hosts override, bypass,
/// then rules
pub fn decide(matcher: &dyn Match, metadata: &Metadata) -> Route {
    let port = metadata.port();
    if !matcher.match_port(port) {
        return Route::Reject;
    }
    let host = metadata.host();
    if let Some(mapped) = matcher.match_hosts(&host) {
        return Route::Direct(Address::from_host(&mapped, port));
    }
    if matcher.match_bypass(&host) {
        return Route::Direct(metadata.address.clone());
    }
    let rule = matcher.match_rule(metadata);
    log::debug!(flow = %metadata, rule = %rule, word = %rule.word, adapter = %rule.adapter, "rule matched");
    match rule.adapter {
        Adapter::Proxy => Route::Proxy,
        Adapter::Reject => Route::Reject,
        Adapter::Accept | Adapter::Direct => Route::Direct(metadata.address.clone()),
    }
}

/// Move datagrams both ways until either side fails, closes or stays quiet
/// for `timeout`. `a` faces the client: its `recv_from` yields destinations
/// and its `send_to` takes sources. Both ends are closed on return.
pub async fn pump_packets(
    a: Arc<dyn PacketConn>,
    b: Arc<dyn PacketConn>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let upload = copy_packets(a.as_ref(), b.as_ref(), timeout);
    let download = copy_packets(b.as_ref(), a.as_ref(), timeout);
    let result = tokio::select! {
        res = upload => res,
        res = download => res,
        _ = cancel.cancelled() => Ok(()),
    };
    a.close();
    b.close();
    match result {
        Err(e) if e.is_timeout() || e.is_closed() => Ok(()),
        other => other,
    }
}

async fn copy_packets(src: &dyn PacketConn, dst: &dyn PacketConn, timeout: Duration) -> Result<()> {
    let mut buf = vec![0u8; UDP_BUF_SIZE];
    loop {
        let (n, addr) = tokio::time::timeout(timeout, src.recv_from(&mut buf)).await??;
        dst.send_to(&buf[..n], &addr).await?;
    }
}

/// Client side: SOCKS/HTTP inbound, rules, direct or Trojan outbound
pub struct ClientDispatcher {
    inbound: Arc<dyn InboundServer>,
    matcher: Arc<dyn Match>,
    direct: Arc<dyn Dialer>,
    proxy: Arc<dyn Dialer>,
    conn_config: ConnConfig,
    cancel: CancellationToken,
}

impl ClientDispatcher {
    pub fn new(
        inbound: Arc<dyn InboundServer>,
        matcher: Arc<dyn Match>,
        direct: Arc<dyn Dialer>,
        proxy: Arc<dyn Dialer>,
        conn_config: ConnConfig,
    ) -> Self {
        Self {
            inbound,
            matcher,
            direct,
            proxy,
            conn_config,
            cancel: CancellationToken::new(),
        }
    }

    fn dialer_for(&self, route: &Route) -> Option<&Arc<dyn Dialer>> {
        match route {
            Route::Direct(_) => Some(&self.direct),
            Route::Proxy => Some(&self.proxy),
            Route::Reject => None,
        }
    }

    /// Drain the inbound server until it closes
    pub async fn run(self: Arc<Self>) -> Result<()> {
        match tokio::try_join!(self.accept_conns(), self.accept_packets()) {
            Err(ProxyError::ConnectionClosed) | Ok(_) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn accept_conns(self: &Arc<Self>) -> Result<()> {
        loop {
            let conn = self.inbound.accept_conn().await?;
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let peer = conn.peer_addr();
                if let Err(e) = this.handle_conn(conn).await {
                    log::debug!(peer = %peer, error = %e, "client flow failed");
                }
            });
        }
    }

    async fn accept_packets(self: &Arc<Self>) -> Result<()> {
        loop {
            let conn = self.inbound.accept_packet().await?;
            let this = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = this.handle_packets(conn).await {
                    log::debug!(error = %e, "client udp session failed");
                }
            });
        }
    }

    pub async fn handle_conn(&self, mut conn: InboundConn) -> Result<()> {
        let metadata = conn.metadata().clone();
        let peer = conn.peer_addr();
        let route = decide(self.matcher.as_ref(), &metadata);
        log::debug!(peer = %peer, flow = %metadata, route = ?route, inbound = %conn.kind(), "routing");

        let Some(dialer) = self.dialer_for(&route) else {
            return Ok(());
        };
        let target = match &route {
            Route::Direct(addr) => addr.clone(),
            _ => metadata.address.clone(),
        };
        let mut upstream: BoxStream = dialer.dial_tcp(&target).await?;

        let mut payload = conn.take_payload().to_vec();
        if payload.is_empty() {
            let mut buf = vec![0u8; FIRST_READ_SIZE];
            match tokio::time::timeout(FIRST_PAYLOAD_WAIT, conn.read(&mut buf)).await {
                Ok(Ok(0)) => return Ok(()),
                Ok(Ok(n)) => {
                    buf.truncate(n);
                    payload = buf;
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {}
            }
        }
        if !payload.is_empty() {
            upstream.write_all(&payload).await?;
        }

        let result = relay(conn, upstream, &self.cancel, self.conn_config.idle_timeout).await;
        log::debug!(peer = %peer, target = %target, up = result.a_to_b, down = result.b_to_a, end = ?result.end, "relay finished");
        result.into_result().map(|_| ())
    }

    /// Route a UDP session on its first datagram, then pump it
    pub async fn handle_packets(&self, conn: Arc<dyn PacketConn>) -> Result<()> {
        let mut buf = vec![0u8; UDP_BUF_SIZE];
        let first = tokio::time::timeout(self.conn_config.udp_timeout, conn.recv_from(&mut buf)).await;
        let (n, dest) = match first {
            Ok(Ok(first)) => first,
            Ok(Err(e)) => {
                conn.close();
                return Err(e);
            }
            Err(_) => {
                conn.close();
                return Ok(());
            }
        };

        let metadata = Metadata::associate(dest.clone());
        let route = decide(self.matcher.as_ref(), &metadata);
        log::debug!(peer = ?conn.peer_addr(), flow = %metadata, route = ?route, "udp routing");
        let Some(dialer) = self.dialer_for(&route) else {
            conn.close();
            return Ok(());
        };
        let upstream = match dialer.dial_udp().await {
            Ok(upstream) => upstream,
            Err(e) => {
                conn.close();
                return Err(e);
            }
        };

        // The first datagram goes out before pumping so a Trojan header
        // leaves together with it.
        let first_dest = match &route {
            Route::Direct(addr) => addr.clone(),
            _ => dest,
        };
        if let Err(e) = upstream.send_to(&buf[..n], &first_dest).await {
            conn.close();
            upstream.close();
            return Err(e);
        }
        pump_packets(conn, upstream, self.conn_config.udp_timeout, &self.cancel).await
    }

    pub fn close(&self) {
        self.cancel.cancel();
        self.inbound.close();
    }
}

/// Server side: every accepted Trojan flow is sent out directly
pub struct ServerDispatcher {
    inbound: Arc<dyn InboundServer>,
    direct: Arc<dyn Dialer>,
    conn_config: ConnConfig,
    cancel: CancellationToken,
}

impl ServerDispatcher {
    pub fn new(inbound: Arc<dyn InboundServer>, direct: Arc<dyn Dialer>, conn_config: ConnConfig) -> Self {
        Self {
            inbound,
            direct,
            conn_config,
            cancel: CancellationToken::new(),
        }
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        match tokio::try_join!(self.accept_conns(), self.accept_packets()) {
            Err(ProxyError::ConnectionClosed) | Ok(_) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn accept_conns(self: &Arc<Self>) -> Result<()> {
        loop {
            let conn = self.inbound.accept_conn().await?;
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let peer = conn.peer_addr();
                if let Err(e) = this.handle_conn(conn).await {
                    log::debug!(peer = %peer, error = %e, "trojan flow failed");
                }
            });
        }
    }

    async fn accept_packets(self: &Arc<Self>) -> Result<()> {
        loop {
            let conn = self.inbound.accept_packet().await?;
            let this = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = this.handle_packets(conn).await {
                    log::debug!(error = %e, "trojan udp session failed");
                }
            });
        }
    }

    pub async fn handle_conn(&self, conn: InboundConn) -> Result<()> {
        let target = conn.metadata().address.clone();
        let peer = conn.peer_addr();
        let upstream = self.direct.dial_tcp(&target).await?;
        log::debug!(peer = %peer, target = %target, "connected to remote (direct)");
        let result = relay(conn, upstream, &self.cancel, self.conn_config.idle_timeout).await;
        log::debug!(peer = %peer, up = result.a_to_b, down = result.b_to_a, end = ?result.end, "relay finished");
        result.into_result().map(|_| ())
    }

    pub async fn handle_packets(&self, conn: Arc<dyn PacketConn>) -> Result<()> {
        let upstream = match self.direct.dial_udp().await {
            Ok(upstream) => upstream,
            Err(e) => {
                conn.close();
                return Err(e);
            }
        };
        log::debug!(peer = ?conn.peer_addr(), flow = ?conn.metadata(), "udp session opened");
        pump_packets(conn, upstream, self.conn_config.udp_timeout, &self.cancel).await
    }

    pub fn close(&self) {
        self.cancel.cancel();
        self.inbound.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FixedMatch;
    use crate::nat::table::tests::MockConn;
    use crate::rules::RuleFilter;
    use std::sync::atomic::Ordering;

    fn md(host: &str, port: u16) -> Metadata {
        Metadata::connect(Address::from_host(host, port))
    }

    #[test]
    fn test_decide_order() {
        let mut rules = RuleFilter::from_rules(
            "domain-suffix,proxy.test,PROXY\n\
             domain,blocked.test,REJECT\n\
             final,DIRECT\n",
        )
        .unwrap();
        rules.add_hosts("10.0.0.5", "proxy.test");
        rules.add_bypass(["*.lan"]);

        // hosts override beats the rule
        assert_eq!(
            decide(&rules, &md("proxy.test", 443)),
            Route::Direct(Address::IPv4([10, 0, 0, 5], 443))
        );
        assert_eq!(decide(&rules, &md("www.proxy.test", 443)), Route::Proxy);
        assert_eq!(decide(&rules, &md("blocked.test", 80)), Route::Reject);
        assert_eq!(
            decide(&rules, &md("printer.lan", 631)),
            Route::Direct(Address::from_host("printer.lan", 631))
        );
        assert_eq!(
            decide(&rules, &md("other.test", 80)),
            Route::Direct(Address::from_host("other.test", 80))
        );

        rules.add_ports([443]);
        assert_eq!(decide(&rules, &md("www.proxy.test", 80)), Route::Reject);
    }

    #[test]
    fn test_decide_fixed() {
        let m = FixedMatch::new(Adapter::Proxy);
        assert_eq!(decide(&m, &md("a.test", 1)), Route::Proxy);
        let m = FixedMatch::new(Adapter::Accept);
        assert_eq!(
            decide(&m, &md("a.test", 1)),
            Route::Direct(Address::from_host("a.test", 1))
        );
    }

    #[tokio::test]
    async fn test_pump_packets_both_ways() {
        let (client, client_tx) = MockConn::new();
        let (upstream, upstream_tx) = MockConn::new();
        let cancel = CancellationToken::new();

        let dest = Address::IPv4([8, 8, 8, 8], 53);
        let pump = tokio::spawn({
            let (a, b) = (client.clone(), upstream.clone());
            let cancel = cancel.clone();
            async move { pump_packets(a, b, Duration::from_secs(5), &cancel).await }
        });

        client_tx.send((b"query".to_vec(), dest.clone())).await.unwrap();
        upstream_tx.send((b"answer".to_vec(), dest.clone())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(upstream.sent.lock().clone(), vec![(b"query".to_vec(), dest.clone())]);
        assert_eq!(client.sent.lock().clone(), vec![(b"answer".to_vec(), dest)]);

        cancel.cancel();
        pump.await.unwrap().unwrap();
        assert_eq!(client.closes.load(Ordering::SeqCst), 1);
        assert_eq!(upstream.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pump_packets_ends_on_idle() {
        let (a, _a_tx) = MockConn::new();
        let (b, _b_tx) = MockConn::new();
        let cancel = CancellationToken::new();
        let res = tokio::time::timeout(
            Duration::from_secs(1),
            pump_packets(a, b, Duration::from_millis(50), &cancel),
        )
        .await
        .unwrap();
        assert!(res.is_ok());
    }
}
