//! Configuration module
//!
//! CLI argument parsing with environment variable fallbacks (`VEILGATE_*`).
//! Routing rules live in a separate file, see [`crate::rules`].

use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::Address;
use crate::trojan::{password_hash, HASH_LEN};

/// Parse duration string (e.g., "60s", "2m", "1h") or plain seconds
fn parse_duration(s: &str) -> Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!(
            "Invalid duration '{}'. Use formats like '60s', '2m', '1h' or plain seconds",
            s
        )
    })
}

/// Default number of concurrent decoy relays
pub const DEFAULT_MAX_DECOY_SESSIONS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Local SOCKS5 / HTTP proxy that tunnels through a Trojan server
    Client,
    /// Trojan server with camouflage fallback
    Server,
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "SOCKS5 / HTTP-CONNECT / Trojan proxy and tunnel")]
#[command(rename_all = "snake_case")]
pub struct CliArgs {
    /// Run as local client or as remote server
    #[arg(long, env = "VEILGATE_MODE", value_enum, default_value = "client")]
    pub mode: Mode,

    /// Listen address (SOCKS5/HTTP in client mode, Trojan in server mode)
    #[arg(long, env = "VEILGATE_LISTEN", default_value = "127.0.0.1:1080")]
    pub listen: SocketAddr,

    /// Shared secret(s); comma separated. Server mode accepts any of them.
    #[arg(long, env = "VEILGATE_PASSWORD", value_delimiter = ',')]
    pub password: Vec<String>,

    /// Log mode: trace, debug, info, warn, error (default: info)
    #[arg(long, env = "VEILGATE_LOG_MODE", default_value = "info")]
    pub log_mode: String,

    // ==================== Client ====================
    /// Remote Trojan server "host:port"
    #[arg(long, env = "VEILGATE_REMOTE", help_heading = "Client")]
    pub remote: Option<String>,

    /// TLS server name; defaults to the remote host
    #[arg(long, env = "VEILGATE_SNI", help_heading = "Client")]
    pub sni: Option<String>,

    /// CA bundle to trust instead of the webpki roots
    #[arg(long, env = "VEILGATE_CA_FILE", help_heading = "Client")]
    pub ca_file: Option<PathBuf>,

    /// Talk to the remote server without TLS (e.g. behind a TLS terminator)
    #[arg(long, env = "VEILGATE_NO_TLS", default_value_t = false, help_heading = "Client")]
    pub no_tls: bool,

    /// Routing rules; `.toml` files use the TOML format, others the line format
    #[arg(long, env = "VEILGATE_RULES_FILE", help_heading = "Client")]
    pub rules_file: Option<PathBuf>,

    /// Remote UDP relay server "host:port"
    #[arg(long, env = "VEILGATE_UDP_RELAY_SERVER", help_heading = "Client")]
    pub udp_relay_server: Option<String>,

    /// UDP relay listen address (client: relay client, server: relay server)
    #[arg(long, env = "VEILGATE_UDP_RELAY_LISTEN")]
    pub udp_relay_listen: Option<SocketAddr>,

    /// Forward bare UDP payloads to this "host:port" instead of reading SOCKS5 datagrams
    #[arg(long, env = "VEILGATE_UDP_TUNNEL_TARGET", help_heading = "Client")]
    pub udp_tunnel_target: Option<String>,

    // ==================== Server ====================
    /// TLS certificate file path
    #[arg(long, env = "VEILGATE_CERT_FILE", help_heading = "Server")]
    pub cert_file: Option<PathBuf>,

    /// TLS private key file path
    #[arg(long, env = "VEILGATE_KEY_FILE", help_heading = "Server")]
    pub key_file: Option<PathBuf>,

    /// Decoy backend "host:port" that receives unauthenticated connections
    #[arg(long, env = "VEILGATE_FRONT", help_heading = "Server")]
    pub front: Option<String>,

    /// Maximum concurrent decoy relays; beyond this, probes are closed
    #[arg(long, env = "VEILGATE_MAX_DECOY_SESSIONS", default_value_t = DEFAULT_MAX_DECOY_SESSIONS, help_heading = "Server")]
    pub max_decoy_sessions: usize,

    // ==================== Performance Tuning ====================
    /// Connection idle timeout - disconnect if no data transferred (default: 5m)
    #[arg(long, env = "VEILGATE_CONN_IDLE_TIMEOUT", default_value = "5m", value_parser = parse_duration, help_heading = "Performance")]
    pub conn_idle_timeout: Duration,

    /// TCP connect timeout to target server (default: 5s)
    #[arg(long, env = "VEILGATE_TCP_CONNECT_TIMEOUT", default_value = "5s", value_parser = parse_duration, help_heading = "Performance")]
    pub tcp_connect_timeout: Duration,

    /// Timeout for reading a request header (default: 5s)
    #[arg(long, env = "VEILGATE_REQUEST_TIMEOUT", default_value = "5s", value_parser = parse_duration, help_heading = "Performance")]
    pub request_timeout: Duration,

    /// TLS handshake timeout (default: 10s)
    #[arg(long, env = "VEILGATE_TLS_HANDSHAKE_TIMEOUT", default_value = "10s", value_parser = parse_duration, help_heading = "Performance")]
    pub tls_handshake_timeout: Duration,

    /// Read timeout on direct UDP sockets (default: 10s)
    #[arg(long, env = "VEILGATE_UDP_TIMEOUT", default_value = "10s", value_parser = parse_duration, help_heading = "Performance")]
    pub udp_timeout: Duration,

    /// Idle timeout of a SOCKS5 UDP session (default: 10s)
    #[arg(long, env = "VEILGATE_SOCKS_SESSION_TIMEOUT", default_value = "10s", value_parser = parse_duration, help_heading = "Performance")]
    pub socks_session_timeout: Duration,

    /// Idle timeout of a UDP relay NAT entry (default: 60s)
    #[arg(long, env = "VEILGATE_NAT_TIMEOUT", default_value = "60s", value_parser = parse_duration, help_heading = "Performance")]
    pub nat_timeout: Duration,

    /// TCP listen backlog for pending connections (default: 1024)
    #[arg(
        long,
        env = "VEILGATE_TCP_BACKLOG",
        default_value_t = 1024,
        help_heading = "Performance"
    )]
    pub tcp_backlog: i32,

    /// Enable TCP_NODELAY for lower latency (default: true)
    #[arg(
        long,
        env = "VEILGATE_TCP_NODELAY",
        default_value_t = true,
        action = clap::ArgAction::Set,
        help_heading = "Performance"
    )]
    pub tcp_nodelay: bool,
}

fn check_file(path: &Path, what: &str) -> Result<()> {
    if !path.exists() {
        return Err(anyhow!("{} not found: {}", what, path.display()));
    }
    Ok(())
}

fn check_addr(s: &str, what: &str) -> Result<Address> {
    Address::parse(s).map_err(|e| anyhow!("invalid {} {:?}: {}", what, s, e))
}

impl CliArgs {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the CLI arguments
    pub fn validate(&self) -> Result<()> {
        if self.password.iter().all(|p| p.is_empty()) {
            return Err(anyhow!("at least one password is required (--password)"));
        }

        for (name, value) in [
            ("conn_idle_timeout", self.conn_idle_timeout),
            ("tcp_connect_timeout", self.tcp_connect_timeout),
            ("request_timeout", self.request_timeout),
            ("tls_handshake_timeout", self.tls_handshake_timeout),
            ("udp_timeout", self.udp_timeout),
            ("socks_session_timeout", self.socks_session_timeout),
            ("nat_timeout", self.nat_timeout),
        ] {
            if value.is_zero() {
                return Err(anyhow!("{} must be greater than 0", name));
            }
        }

        match self.mode {
            Mode::Client => self.validate_client(),
            Mode::Server => self.validate_server(),
        }
    }

    fn validate_client(&self) -> Result<()> {
        let remote = self
            .remote
            .as_deref()
            .ok_or_else(|| anyhow!("remote server is required in client mode (--remote)"))?;
        check_addr(remote, "remote")?;

        if let Some(ref path) = self.ca_file {
            check_file(path, "CA file")?;
        }
        if let Some(ref path) = self.rules_file {
            check_file(path, "rules file")?;
        }
        if let Some(ref target) = self.udp_tunnel_target {
            check_addr(target, "udp_tunnel_target")?;
        }
        match (&self.udp_relay_listen, &self.udp_relay_server) {
            (Some(_), Some(server)) => {
                check_addr(server, "udp_relay_server")?;
            }
            (Some(_), None) => {
                return Err(anyhow!("udp_relay_listen requires udp_relay_server in client mode"));
            }
            (None, _) if self.udp_tunnel_target.is_some() => {
                return Err(anyhow!("udp_tunnel_target requires udp_relay_listen"));
            }
            _ => {}
        }
        Ok(())
    }

    fn validate_server(&self) -> Result<()> {
        match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) => {
                check_file(cert, "TLS certificate file")?;
                check_file(key, "TLS private key file")?;
            }
            (None, None) => {}
            _ => {
                return Err(anyhow!("cert_file and key_file must be given together"));
            }
        }
        if let Some(ref front) = self.front {
            check_addr(front, "front")?;
        }
        if self.max_decoy_sessions == 0 {
            return Err(anyhow!("max_decoy_sessions must be greater than 0"));
        }
        Ok(())
    }

    /// Password hashes for the wire: raw secrets are hashed, values that
    /// already look like a hash are kept
    pub fn password_hashes(&self) -> Vec<String> {
        self.password
            .iter()
            .filter(|p| !p.is_empty())
            .map(|p| {
                if p.len() == HASH_LEN && p.bytes().all(|b| b.is_ascii_hexdigit()) {
                    p.to_ascii_lowercase()
                } else {
                    password_hash(p)
                }
            })
            .collect()
    }

    /// TLS server name for the remote: `--sni` or the remote host
    pub fn server_name(&self) -> Option<String> {
        self.sni.clone().or_else(|| {
            self.remote
                .as_deref()
                .and_then(|r| Address::parse(r).ok())
                .map(|a| a.host())
        })
    }
}

/// Connection performance configuration
#[derive(Debug, Clone, Copy)]
pub struct ConnConfig {
    /// Connection idle timeout
    pub idle_timeout: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Request header timeout
    pub request_timeout: Duration,
    /// TLS handshake timeout
    pub tls_handshake_timeout: Duration,
    /// Direct UDP read timeout
    pub udp_timeout: Duration,
    /// SOCKS5 UDP session idle timeout
    pub socks_session_timeout: Duration,
    /// UDP relay NAT entry idle timeout
    pub nat_timeout: Duration,
    /// TCP listen backlog
    pub tcp_backlog: i32,
    /// Enable TCP_NODELAY
    pub tcp_nodelay: bool,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            tls_handshake_timeout: Duration::from_secs(10),
            udp_timeout: Duration::from_secs(10),
            socks_session_timeout: Duration::from_secs(10),
            nat_timeout: Duration::from_secs(60),
            tcp_backlog: 1024,
            tcp_nodelay: true,
        }
    }
}

impl ConnConfig {
    /// Create from CLI args
    pub fn from_cli(cli: &CliArgs) -> Self {
        Self {
            idle_timeout: cli.conn_idle_timeout,
            connect_timeout: cli.tcp_connect_timeout,
            request_timeout: cli.request_timeout,
            tls_handshake_timeout: cli.tls_handshake_timeout,
            udp_timeout: cli.udp_timeout,
            socks_session_timeout: cli.socks_session_timeout,
            nat_timeout: cli.nat_timeout,
            tcp_backlog: cli.tcp_backlog,
            tcp_nodelay: cli.tcp_nodelay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        let mut argv = vec!["veilgate"];
        argv.extend_from_slice(args);
        CliArgs::try_parse_from(argv).unwrap()
    }

    fn client_args() -> CliArgs {
        parse(&["--password", "secret", "--remote", "proxy.example.com:443"])
    }

    fn create_server_args_with_temp_certs() -> (CliArgs, tempfile::TempDir) {
        let temp_dir = tempfile::tempdir().unwrap();
        let cert_path = temp_dir.path().join("cert.pem");
        let key_path = temp_dir.path().join("key.pem");
        std::fs::write(&cert_path, "dummy cert").unwrap();
        std::fs::write(&key_path, "dummy key").unwrap();

        let cli = parse(&[
            "--mode",
            "server",
            "--listen",
            "0.0.0.0:443",
            "--password",
            "a,b",
            "--cert_file",
            cert_path.to_str().unwrap(),
            "--key_file",
            key_path.to_str().unwrap(),
            "--front",
            "127.0.0.1:80",
        ]);
        (cli, temp_dir)
    }

    #[test]
    fn test_cli_args_defaults() {
        let cli = client_args();
        assert_eq!(cli.mode, Mode::Client);
        assert_eq!(cli.listen, "127.0.0.1:1080".parse::<SocketAddr>().unwrap());
        assert_eq!(cli.conn_idle_timeout, Duration::from_secs(300));
        assert_eq!(cli.socks_session_timeout, Duration::from_secs(10));
        assert_eq!(cli.nat_timeout, Duration::from_secs(60));
        assert_eq!(cli.max_decoy_sessions, DEFAULT_MAX_DECOY_SESSIONS);
        assert!(cli.tcp_nodelay);
    }

    #[test]
    fn test_client_validate() {
        assert!(client_args().validate().is_ok());

        let cli = parse(&["--password", "secret"]);
        assert!(cli.validate().is_err());

        let cli = parse(&["--remote", "a.com:443"]);
        assert!(cli.validate().is_err());

        let mut cli = client_args();
        cli.rules_file = Some(PathBuf::from("/nonexistent/rules.txt"));
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_client_udp_relay_validate() {
        let mut cli = client_args();
        cli.udp_relay_listen = Some("127.0.0.1:5300".parse().unwrap());
        assert!(cli.validate().is_err());

        cli.udp_relay_server = Some("relay.example.com:5301".to_string());
        assert!(cli.validate().is_ok());

        let mut cli = client_args();
        cli.udp_tunnel_target = Some("8.8.8.8:53".to_string());
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_server_validate() {
        let (cli, _temp_dir) = create_server_args_with_temp_certs();
        assert!(cli.validate().is_ok());
        assert_eq!(cli.password_hashes().len(), 2);

        let (mut cli, _temp_dir) = create_server_args_with_temp_certs();
        cli.key_file = None;
        assert!(cli.validate().is_err());

        let (mut cli, _temp_dir) = create_server_args_with_temp_certs();
        cli.cert_file = Some(PathBuf::from("/nonexistent/cert.pem"));
        assert!(cli.validate().is_err());

        let (mut cli, _temp_dir) = create_server_args_with_temp_certs();
        cli.max_decoy_sessions = 0;
        assert!(cli.validate().is_err());

        // Plain mode: no TLS material at all
        let (mut cli, _temp_dir) = create_server_args_with_temp_certs();
        cli.cert_file = None;
        cli.key_file = None;
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_timeout() {
        let mut cli = client_args();
        cli.request_timeout = Duration::ZERO;
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_password_hashes() {
        let hash = password_hash("secret");
        let cli = parse(&["--password", &format!("secret,{}", hash.to_uppercase())]);
        assert_eq!(cli.password_hashes(), vec![hash.clone(), hash]);
    }

    #[test]
    fn test_server_name_defaults_to_remote_host() {
        let cli = client_args();
        assert_eq!(cli.server_name().as_deref(), Some("proxy.example.com"));

        let cli = parse(&["--password", "x", "--remote", "1.2.3.4:443", "--sni", "cdn.example"]);
        assert_eq!(cli.server_name().as_deref(), Some("cdn.example"));
    }

    #[test]
    fn test_conn_config_from_cli() {
        let cli = parse(&["--password", "x", "--udp_timeout", "30", "--tcp_nodelay", "false"]);
        let conn = ConnConfig::from_cli(&cli);
        assert_eq!(conn.udp_timeout, Duration::from_secs(30));
        assert!(!conn.tcp_nodelay);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("60s").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("60").unwrap(), Duration::from_secs(60));
        assert!(parse_duration("invalid").is_err());
        assert!(parse_duration("").is_err());
    }
}
