//! Composable proxy and tunnel engine
//!
//! Layout:
//! - `core/`: address codec, flow metadata, connection traits, relay, hooks
//! - `socks/`: mixed SOCKS5 / HTTP-CONNECT inbound with UDP ASSOCIATE
//! - `trojan/`: Trojan wire protocol, client dialer and server with decoy fallback
//! - `nat/`: UDP NAT session table and the UDP relay client/server
//! - `outbound/`: dialers (direct)
//! - `dispatch`: glue between inbound servers and dialers
//! - `rules`: rule-based routing for the client side

pub mod config;
pub mod core;
pub mod dispatch;
pub mod error;
pub mod logger;
pub mod nat;
pub mod outbound;
pub mod rules;
pub mod socks;
pub mod transport;
pub mod trojan;

pub use error::{ProxyError, Result};
