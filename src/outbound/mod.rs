//! Outbound dialers
//!
//! A [`Dialer`] opens the upstream side of a flow. Direct dialing goes
//! straight to the destination; the Trojan dialer tunnels through a remote
//! server (see [`crate::trojan::TrojanDialer`]).

mod direct;

pub use direct::{bind_dual_stack, DirectDialer, UdpPacketConn};

use async_trait::async_trait;
use std::sync::Arc;

use crate::core::{Address, PacketConn};
use crate::error::Result;
use crate::transport::BoxStream;

#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open a stream to `target`
    async fn dial_tcp(&self, target: &Address) -> Result<BoxStream>;

    /// Open a datagram flow; the destination travels with every `send_to`
    async fn dial_udp(&self) -> Result<Arc<dyn PacketConn>>;
}
