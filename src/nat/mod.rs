//! UDP NAT and the plain-UDP relay built on it

pub mod table;
pub mod udp;

pub use table::{Role, SessionTable, DEFAULT_NAT_TIMEOUT, UDP_BUF_SIZE};
pub use udp::{RelayMode, UdpRelayClient, UdpRelayServer};
