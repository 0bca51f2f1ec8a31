//! Trojan protocol: framing, the client dialer and the inbound server
//!
//! ```text
//! +-----------------------+---------+----------------+---------+----------+
//! | hex(SHA224(password)) |  CRLF   | Trojan Request |  CRLF   | Payload  |
//! +-----------------------+---------+----------------+---------+----------+
//! |          56           | X'0D0A' |    Variable    | X'0D0A' | Variable |
//! +-----------------------+---------+----------------+---------+----------+
//! ```

pub mod client;
pub mod outbound;
pub mod packet;
pub mod protocol;
pub mod server;

pub use client::TrojanDialer;
pub use outbound::OutboundConn;
pub use packet::TrojanPacketConn;
pub use protocol::{
    password_hash, read_envelope, request_prefix, TrojanRequest, UdpEnvelope, CRLF, HASH_LEN,
    MAX_PACKET_SIZE,
};
pub use server::{TrojanServer, TrojanServerBuilder, ACCEPT_QUEUE_DEPTH};
