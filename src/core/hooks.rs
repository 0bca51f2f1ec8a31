//! Hook traits for routing decisions
//!
//! Listeners never decide policy themselves. Client-side connections consult
//! a [`Match`] implementation; authenticated Trojan connections consult a
//! [`TrojanHook`].

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

use super::metadata::Metadata;
use crate::error::{ProxyError, Result};
use crate::outbound::Dialer;
use crate::transport::BoxStream;

/// What to do with a matched connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Adapter {
    Accept,
    Proxy,
    Reject,
    Direct,
}

impl Adapter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Adapter::Accept => "ACCEPT",
            Adapter::Proxy => "PROXY",
            Adapter::Reject => "REJECT",
            Adapter::Direct => "DIRECT",
        }
    }
}

impl std::fmt::Display for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Adapter {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ACCEPT" => Ok(Adapter::Accept),
            "PROXY" => Ok(Adapter::Proxy),
            "REJECT" => Ok(Adapter::Reject),
            "DIRECT" => Ok(Adapter::Direct),
            other => Err(ProxyError::Config(format!("unknown adapter {:?}", other))),
        }
    }
}

/// Kind of rule that produced a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleType {
    Bypass,
    Hosts,
    Domain,
    DomainSuffix,
    DomainKeyword,
    UserAgent,
    IpCidr,
    GeoIp,
    Port,
    Final,
    Match,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::Bypass => "bypass",
            RuleType::Hosts => "hosts",
            RuleType::Domain => "domain",
            RuleType::DomainSuffix => "domain-suffix",
            RuleType::DomainKeyword => "domain-keyword",
            RuleType::UserAgent => "user-agent",
            RuleType::IpCidr => "ip-cidr",
            RuleType::GeoIp => "geoip",
            RuleType::Port => "port",
            RuleType::Final => "final",
            RuleType::Match => "match",
        }
    }
}

/// A routing decision and the rule that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub rule_type: RuleType,
    pub word: String,
    pub adapter: Adapter,
}

impl Rule {
    pub fn new(rule_type: RuleType, word: impl Into<String>, adapter: Adapter) -> Self {
        Self {
            rule_type,
            word: word.into(),
            adapter,
        }
    }

    /// Fallback when nothing matched and no final rule exists
    pub fn direct_fallback() -> Self {
        Self::new(RuleType::Match, "match", Adapter::Direct)
    }
}

impl std::fmt::Display for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.rule_type.as_str())
    }
}

/// Routing collaborator consulted for client-side connections
///
/// Synchronous: every method is an in-memory lookup.
pub trait Match: Send + Sync {
    /// Host should bypass the proxy entirely
    fn match_bypass(&self, host: &str) -> bool;
    /// Static host override, e.g. from a hosts file
    fn match_hosts(&self, host: &str) -> Option<String>;
    /// Port is allowed to be tunnelled
    fn match_port(&self, port: u16) -> bool;
    /// Rule for a flow; never fails, falls back to a final/DIRECT rule
    fn match_rule(&self, metadata: &Metadata) -> Rule;
}

/// Match implementation that sends everything one way
pub struct FixedMatch {
    adapter: Adapter,
}

impl FixedMatch {
    pub fn new(adapter: Adapter) -> Self {
        Self { adapter }
    }
}

impl Match for FixedMatch {
    fn match_bypass(&self, _host: &str) -> bool {
        false
    }

    fn match_hosts(&self, _host: &str) -> Option<String> {
        None
    }

    fn match_port(&self, _port: u16) -> bool {
        true
    }

    fn match_rule(&self, _metadata: &Metadata) -> Rule {
        Rule::new(RuleType::Final, "match", self.adapter)
    }
}

/// Server-side action for an authenticated Trojan flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Accept = 1,
    Proxy = 2,
    Reject = 3,
    Direct = 4,
    Forward = 5,
}

impl TryFrom<u8> for Action {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Action::Accept),
            2 => Ok(Action::Proxy),
            3 => Ok(Action::Reject),
            4 => Ok(Action::Direct),
            5 => Ok(Action::Forward),
            other => Err(ProxyError::Config(format!("unknown action {}", other))),
        }
    }
}

/// Collaborator for the Trojan server
#[async_trait]
pub trait TrojanHook: Send + Sync {
    /// Validate a 56-character hex password hash
    fn auth(&self, password: &str) -> bool;

    /// Decide what to do with an authenticated flow
    fn router(&self, password: &str, metadata: &Metadata) -> Action;

    /// Open the upstream for an [`Action::Forward`] decision
    async fn forward(&self, password: &str, metadata: &Metadata) -> Result<BoxStream>;
}

/// Hook backed by a fixed set of password hashes
pub struct StaticHook {
    passwords: HashSet<String>,
    action: Action,
    dialer: Arc<dyn Dialer>,
}

impl StaticHook {
    /// `passwords` are already-hashed 56-character hex strings
    pub fn new<I>(passwords: I, dialer: Arc<dyn Dialer>) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self {
            passwords: passwords
                .into_iter()
                .map(|p| p.to_ascii_lowercase())
                .collect(),
            action: Action::Accept,
            dialer,
        }
    }

    /// Route every authenticated flow with `action` instead of ACCEPT
    pub fn with_action(mut self, action: Action) -> Self {
        self.action = action;
        self
    }

    pub fn len(&self) -> usize {
        self.passwords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passwords.is_empty()
    }
}

#[async_trait]
impl TrojanHook for StaticHook {
    fn auth(&self, password: &str) -> bool {
        self.passwords.contains(password)
    }

    fn router(&self, _password: &str, _metadata: &Metadata) -> Action {
        self.action
    }

    async fn forward(&self, _password: &str, metadata: &Metadata) -> Result<BoxStream> {
        self.dialer.dial_tcp(&metadata.address).await
    }
}
