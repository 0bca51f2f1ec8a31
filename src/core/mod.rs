//! Core proxy building blocks
//!
//! This module contains the pieces every front-end shares:
//! - Address codec and per-flow metadata
//! - Stream / datagram connection abstractions
//! - Bidirectional relay
//! - Hook traits for routing decisions

pub mod address;
pub mod conn;
pub mod hooks;
pub mod metadata;
pub mod relay;

pub use address::{split_host_port, Address, DecodeResult};
pub use conn::{InboundConn, InboundKind, InboundServer, PacketConn};
pub use hooks::{Action, Adapter, FixedMatch, Match, Rule, RuleType, StaticHook, TrojanHook};
pub use metadata::{Command, Metadata, Network};
pub use relay::{relay, CopyResult, RelayEnd};
