//! SOCKS5 and HTTP inbound
//!
//! - `handshake`: SOCKS5 negotiation, server and client sides
//! - `http`: CONNECT and single-request pass-through
//! - `udp`: per-client demux of the shared SOCKS UDP socket
//! - `server`: the mixed listener tying them together

pub mod handshake;
pub mod http;
pub mod server;
pub mod udp;

pub use handshake::{client_handshake, Handshake, HandshakeState, ServerHandshake};
pub use http::{accept_http, HttpAccept};
pub use server::SocksServer;
pub use udp::{SocksPacketConn, SocksUdpDemux};
