//! Rule-based routing for client-side connections
//!
//! Two input formats describe the same filter.
//!
//! Line format:
//! ```text
//! # comment
//! skip-proxy = 127.0.0.1, 192.168.0.0/16, *.local
//! domain,example.com,DIRECT
//! domain-suffix,google.com,PROXY
//! domain-keyword,ads,REJECT
//! ip-cidr,10.0.0.0/8,DIRECT
//! dst-port,443,ACCEPT
//! final,PROXY
//! ```
//!
//! TOML format (files ending in `.toml`):
//! ```toml
//! final = "PROXY"
//! skip_proxy = ["127.0.0.1", "*.local"]
//! ports = [80, 443]
//!
//! [[rules]]
//! type = "domain-suffix"
//! word = "google.com"
//! adapter = "PROXY"
//!
//! [hosts]
//! "router.lan" = "192.168.1.1"
//! ```

use ipnet::IpNet;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::path::Path;

use crate::core::{Adapter, Match, Metadata, Rule, RuleType};
use crate::error::{ProxyError, Result};
use crate::logger::log;

/// Bypass entry: exact IP, network, or host pattern with `*` wildcards
#[derive(Debug, Clone)]
enum BypassEntry {
    Ip(IpAddr),
    Net(IpNet),
    Pattern(String),
}

impl BypassEntry {
    fn parse(s: &str) -> Self {
        if let Ok(ip) = s.parse::<IpAddr>() {
            BypassEntry::Ip(ip)
        } else if let Ok(net) = s.parse::<IpNet>() {
            BypassEntry::Net(net)
        } else {
            BypassEntry::Pattern(s.to_ascii_lowercase())
        }
    }

    fn matches(&self, host: &str, ip: Option<IpAddr>) -> bool {
        match (self, ip) {
            (BypassEntry::Ip(want), Some(ip)) => *want == ip,
            (BypassEntry::Net(net), Some(ip)) => net.contains(&ip),
            (BypassEntry::Pattern(p), _) => wildcard_match(p, &host.to_ascii_lowercase()),
            _ => false,
        }
    }
}

/// Glob match where `*` spans any run of characters
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return text.is_empty();
    };
    let Some(mut rest) = text.strip_prefix(first) else {
        return false;
    };
    let parts: Vec<&str> = parts.collect();
    let Some((last, middle)) = parts.split_last() else {
        // No wildcard at all: exact match
        return rest.is_empty();
    };
    for part in middle {
        match rest.find(part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

#[derive(Debug, Deserialize)]
struct RulesFile {
    #[serde(default, rename = "final")]
    final_adapter: Option<String>,
    #[serde(default)]
    skip_proxy: Vec<String>,
    #[serde(default)]
    ports: Vec<u16>,
    #[serde(default)]
    rules: Vec<RuleEntry>,
    #[serde(default)]
    hosts: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RuleEntry {
    #[serde(rename = "type")]
    rule_type: String,
    word: String,
    adapter: String,
}

/// In-memory rule set implementing [`Match`]
#[derive(Debug, Default)]
pub struct RuleFilter {
    bypass: Vec<BypassEntry>,
    hosts: HashMap<String, String>,
    ports: HashSet<u16>,
    domains: HashMap<String, Rule>,
    suffixes: HashMap<String, Rule>,
    keywords: Vec<Rule>,
    user_agents: Vec<Rule>,
    cidrs: Vec<(IpNet, Rule)>,
    geoip: Vec<Rule>,
    final_rule: Option<Rule>,
}

impl RuleFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a file; `.toml` selects the TOML format
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let is_toml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("toml"));
        let filter = if is_toml {
            Self::from_toml(&content)?
        } else {
            Self::from_rules(&content)?
        };
        log::info!(path = %path.display(), rules = filter.rule_count(), "rules loaded");
        Ok(filter)
    }

    /// Parse the line-based rules text
    pub fn from_rules(text: &str) -> Result<Self> {
        let mut filter = Self::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with("//") || line.starts_with('#') {
                continue;
            }
            let lower = line.to_ascii_lowercase();
            if lower.starts_with("skip-proxy") || lower.starts_with("bypass-tun") {
                let Some((_, list)) = line.split_once('=') else {
                    return Err(ProxyError::Config(format!("line {}: missing '='", idx + 1)));
                };
                filter.add_bypass(list.split(',').map(str::trim));
                continue;
            }
            let items: Vec<&str> = line.split(',').map(str::trim).collect();
            filter
                .add_line(&items)
                .map_err(|e| ProxyError::Config(format!("line {}: {}", idx + 1, e)))?;
        }
        Ok(filter)
    }

    /// Parse the TOML document
    pub fn from_toml(text: &str) -> Result<Self> {
        let file: RulesFile = toml::from_str(text)?;
        let mut filter = Self::new();
        filter.add_bypass(file.skip_proxy.iter().map(String::as_str));
        filter.ports.extend(file.ports);
        for entry in &file.rules {
            filter.add_line(&[&entry.rule_type, &entry.word, &entry.adapter])?;
        }
        for (host, addr) in file.hosts {
            filter.add_hosts(&addr, &host);
        }
        if let Some(adapter) = file.final_adapter {
            filter.set_final(adapter.parse()?);
        }
        Ok(filter)
    }

    fn add_line(&mut self, items: &[&str]) -> Result<()> {
        let kind = items[0].to_ascii_lowercase();
        let field = |i: usize| -> Result<&str> {
            items
                .get(i)
                .copied()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| ProxyError::Config(format!("{} rule needs {} fields", kind, i + 1)))
        };
        match kind.as_str() {
            "final" | "match" => {
                self.set_final(field(1)?.parse()?);
            }
            "domain" => {
                let word = field(1)?.to_ascii_lowercase();
                let rule = Rule::new(RuleType::Domain, word.clone(), field(2)?.parse()?);
                self.domains.insert(word, rule);
            }
            "domain-suffix" => {
                let word = field(1)?.trim_start_matches('.').to_ascii_lowercase();
                let rule = Rule::new(RuleType::DomainSuffix, word.clone(), field(2)?.parse()?);
                self.suffixes.insert(word, rule);
            }
            "domain-keyword" => {
                let word = field(1)?.to_ascii_lowercase();
                self.keywords
                    .push(Rule::new(RuleType::DomainKeyword, word, field(2)?.parse()?));
            }
            "user-agent" => {
                let word = field(1)?.to_ascii_lowercase();
                self.user_agents
                    .push(Rule::new(RuleType::UserAgent, word, field(2)?.parse()?));
            }
            "ip-cidr" | "ip-cidr6" => {
                let word = field(1)?;
                let net: IpNet = word
                    .parse()
                    .map_err(|e| ProxyError::Config(format!("invalid CIDR {:?}: {}", word, e)))?;
                let rule = Rule::new(RuleType::IpCidr, word, field(2)?.parse()?);
                self.cidrs.push((net, rule));
            }
            "geoip" => {
                let word = field(1)?.to_ascii_uppercase();
                self.geoip
                    .push(Rule::new(RuleType::GeoIp, word, field(2)?.parse()?));
            }
            "dst-port" => {
                let word = field(1)?;
                let port: u16 = word
                    .parse()
                    .map_err(|_| ProxyError::Config(format!("invalid port {:?}", word)))?;
                self.ports.insert(port);
            }
            other => {
                log::debug!(rule = other, "ignoring unknown rule type");
            }
        }
        Ok(())
    }

    pub fn add_bypass<'a, I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.bypass.extend(
            entries
                .into_iter()
                .filter(|s| !s.is_empty())
                .map(BypassEntry::parse),
        );
    }

    /// Static override: `host` is dialed at `addr`
    pub fn add_hosts(&mut self, addr: &str, host: &str) {
        self.hosts
            .insert(host.to_ascii_lowercase(), addr.to_string());
    }

    /// Read `/etc/hosts`-style text: `ADDR HOST [HOST...]`
    pub fn add_hosts_text(&mut self, text: &str) {
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            let mut fields = line.split_whitespace();
            let Some(addr) = fields.next() else { continue };
            if addr.parse::<IpAddr>().is_err() {
                continue;
            }
            for host in fields {
                self.add_hosts(addr, host);
            }
        }
    }

    /// Ports allowed through; an empty list allows every port
    pub fn add_ports<I: IntoIterator<Item = u16>>(&mut self, ports: I) {
        self.ports.extend(ports);
    }

    pub fn set_final(&mut self, adapter: Adapter) {
        self.final_rule = Some(Rule::new(RuleType::Final, "match", adapter));
    }

    pub fn rule_count(&self) -> usize {
        self.domains.len()
            + self.suffixes.len()
            + self.keywords.len()
            + self.user_agents.len()
            + self.cidrs.len()
            + self.geoip.len()
            + usize::from(self.final_rule.is_some())
    }

    fn match_domain(&self, host: &str) -> Option<&Rule> {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        if let Some(rule) = self.domains.get(&host) {
            return Some(rule);
        }
        // Walk suffixes on label boundaries: a.b.c, b.c, c
        let mut rest = host.as_str();
        loop {
            if let Some(rule) = self.suffixes.get(rest) {
                return Some(rule);
            }
            match rest.split_once('.') {
                Some((_, tail)) => rest = tail,
                None => break,
            }
        }
        self.keywords.iter().find(|r| host.contains(&r.word))
    }

    fn match_ip(&self, ip: IpAddr) -> Option<&Rule> {
        // geoip rules need a country database, which is not loaded
        self.cidrs
            .iter()
            .find(|(net, _)| net.contains(&ip))
            .map(|(_, rule)| rule)
    }
}

impl Match for RuleFilter {
    fn match_bypass(&self, host: &str) -> bool {
        let ip = host.parse::<IpAddr>().ok();
        self.bypass.iter().any(|b| b.matches(host, ip))
    }

    fn match_hosts(&self, host: &str) -> Option<String> {
        self.hosts.get(&host.to_ascii_lowercase()).cloned()
    }

    fn match_port(&self, port: u16) -> bool {
        self.ports.is_empty() || self.ports.contains(&port)
    }

    fn match_rule(&self, metadata: &Metadata) -> Rule {
        let address = &metadata.address;
        let matched = match address.ip() {
            Some(ip) => self.match_ip(ip),
            None => self.match_domain(&address.host()),
        };
        matched
            .or(self.final_rule.as_ref())
            .cloned()
            .unwrap_or_else(Rule::direct_fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Address;
    use std::io::Write;

    const RULES: &str = "\
# sample
// also a comment
skip-proxy = 127.0.0.1, 192.168.0.0/16, *.local
domain,exact.example.com,REJECT
domain-suffix,google.com,PROXY
domain-keyword,tracker,REJECT
user-agent,curl*,DIRECT
ip-cidr,10.0.0.0/8,DIRECT
ip-cidr,2001:db8::/32,PROXY
geoip,CN,DIRECT
dst-port,443,ACCEPT
dst-port,80,ACCEPT
final,PROXY
";

    fn md(host: &str, port: u16) -> Metadata {
        Metadata::connect(Address::from_host(host, port))
    }

    #[test]
    fn test_domain_rules() {
        let f = RuleFilter::from_rules(RULES).unwrap();
        assert_eq!(f.match_rule(&md("exact.example.com", 80)).adapter, Adapter::Reject);
        assert_eq!(f.match_rule(&md("mail.google.com", 443)).rule_type, RuleType::DomainSuffix);
        assert_eq!(f.match_rule(&md("google.com", 443)).adapter, Adapter::Proxy);
        // Suffixes only match on label boundaries.
        assert_eq!(f.match_rule(&md("notgoogle.com", 443)).rule_type, RuleType::Final);
        assert_eq!(f.match_rule(&md("a.tracker-net.io", 443)).adapter, Adapter::Reject);
        assert_eq!(f.match_rule(&md("www.example.org", 443)).rule_type, RuleType::Final);
    }

    #[test]
    fn test_ip_rules() {
        let f = RuleFilter::from_rules(RULES).unwrap();
        assert_eq!(f.match_rule(&md("10.1.2.3", 22)).adapter, Adapter::Direct);
        assert_eq!(f.match_rule(&md("2001:db8::1", 443)).adapter, Adapter::Proxy);
        // geoip never matches; falls through to final
        assert_eq!(f.match_rule(&md("1.2.3.4", 443)).rule_type, RuleType::Final);
    }

    #[test]
    fn test_rule_display_names_type() {
        let f = RuleFilter::from_rules(RULES).unwrap();
        assert_eq!(f.match_rule(&md("10.0.0.1", 1)).to_string(), "ip-cidr");
    }

    #[test]
    fn test_fallback_is_direct() {
        let f = RuleFilter::from_rules("domain,a.com,PROXY").unwrap();
        let rule = f.match_rule(&md("b.com", 80));
        assert_eq!(rule.adapter, Adapter::Direct);
        assert_eq!(rule.rule_type, RuleType::Match);
    }

    #[test]
    fn test_bypass() {
        let f = RuleFilter::from_rules(RULES).unwrap();
        assert!(f.match_bypass("127.0.0.1"));
        assert!(f.match_bypass("192.168.3.4"));
        assert!(f.match_bypass("printer.local"));
        assert!(!f.match_bypass("local"));
        assert!(!f.match_bypass("8.8.8.8"));
    }

    #[test]
    fn test_ports() {
        let f = RuleFilter::from_rules(RULES).unwrap();
        assert!(f.match_port(443));
        assert!(!f.match_port(25));
        assert!(RuleFilter::new().match_port(25));
    }

    #[test]
    fn test_hosts() {
        let mut f = RuleFilter::new();
        f.add_hosts_text("127.0.0.1 localhost\n# skip\n10.0.0.5 nas nas.lan\nbogus line\n");
        assert_eq!(f.match_hosts("NAS.lan"), Some("10.0.0.5".to_string()));
        assert_eq!(f.match_hosts("localhost"), Some("127.0.0.1".to_string()));
        assert_eq!(f.match_hosts("bogus"), None);
    }

    #[test]
    fn test_bad_adapter_is_config_error() {
        let err = RuleFilter::from_rules("domain,a.com,BOUNCE").unwrap_err();
        assert!(matches!(err, ProxyError::Config(msg) if msg.starts_with("line 1")));
        assert!(RuleFilter::from_rules("ip-cidr,not-a-net,DIRECT").is_err());
        assert!(RuleFilter::from_rules("domain-suffix").is_err());
    }

    #[test]
    fn test_unknown_rule_ignored() {
        let f = RuleFilter::from_rules("process-name,curl,DIRECT\nfinal,REJECT").unwrap();
        assert_eq!(f.match_rule(&md("x.com", 1)).adapter, Adapter::Reject);
    }

    #[test]
    fn test_toml_format() {
        let text = r#"
final = "direct"
skip_proxy = ["*.corp"]
ports = [443]

[[rules]]
type = "domain-suffix"
word = "github.com"
adapter = "PROXY"

[hosts]
"router.lan" = "192.168.1.1"
"#;
        let f = RuleFilter::from_toml(text).unwrap();
        assert_eq!(f.match_rule(&md("api.github.com", 443)).adapter, Adapter::Proxy);
        assert_eq!(f.match_rule(&md("x.com", 443)).adapter, Adapter::Direct);
        assert!(f.match_bypass("wiki.corp"));
        assert!(!f.match_port(80));
        assert_eq!(f.match_hosts("router.lan"), Some("192.168.1.1".to_string()));
    }

    #[test]
    fn test_from_file_picks_format() {
        let mut toml_file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        toml_file.write_all(b"final = \"REJECT\"\n").unwrap();
        let f = RuleFilter::from_file(toml_file.path()).unwrap();
        assert_eq!(f.match_rule(&md("a.com", 1)).adapter, Adapter::Reject);

        let mut line_file = tempfile::NamedTempFile::new().unwrap();
        line_file.write_all(b"final,PROXY\n").unwrap();
        let f = RuleFilter::from_file(line_file.path()).unwrap();
        assert_eq!(f.match_rule(&md("a.com", 1)).adapter, Adapter::Proxy);
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("*.local", "a.b.local"));
        assert!(wildcard_match("10.*.1", "10.0.0.1"));
        assert!(wildcard_match("exact", "exact"));
        assert!(!wildcard_match("exact", "exactly"));
        assert!(wildcard_match("*", ""));
        assert!(!wildcard_match("a*a", "a"));
    }
}
