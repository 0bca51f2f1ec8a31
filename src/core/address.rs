//! Shared endpoint codec
//!
//! Wire layout used by SOCKS5 and Trojan:
//! - ATYP (1 byte: IPv4=1, DOMAIN=3, IPv6=4)
//! - IPv4 (4 bytes) | LEN (1 byte) + DOMAIN | IPv6 (16 bytes)
//! - PORT (2 bytes, big-endian)

use bytes::BufMut;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::lookup_host;

use crate::error::{ProxyError, Result};

pub const ATYP_IPV4: u8 = 1;
pub const ATYP_DOMAIN: u8 = 3;
pub const ATYP_IPV6: u8 = 4;

/// Longest domain the one-byte length prefix can carry
pub const MAX_DOMAIN_LEN: usize = 255;

/// Network endpoint: IPv4, IPv6 or domain name plus port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    IPv4([u8; 4], u16),
    IPv6([u8; 16], u16),
    Domain(String, u16),
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::IPv4(ip, port) => write!(f, "{}:{}", Ipv4Addr::from(*ip), port),
            Address::IPv6(ip, port) => write!(f, "[{}]:{}", Ipv6Addr::from(*ip), port),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

/// Result of decoding from a partially filled buffer
#[derive(Debug)]
pub enum DecodeResult<T> {
    /// Successfully decoded, with the number of bytes consumed
    Ok(T, usize),
    /// Buffer ends before the value does
    NeedMoreData,
    /// Bytes can never form a valid value
    Invalid(&'static str),
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Address::IPv4(v4.ip().octets(), v4.port()),
            SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
                Some(v4) => Address::IPv4(v4.octets(), v6.port()),
                None => Address::IPv6(v6.ip().octets(), v6.port()),
            },
        }
    }
}

impl std::str::FromStr for Address {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        Address::parse(s)
    }
}

impl Address {
    /// Build from host and port, choosing the IP variants for IP literals.
    pub fn from_host(host: &str, port: u16) -> Self {
        match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => Address::IPv4(ip.octets(), port),
            Ok(IpAddr::V6(ip)) => Address::IPv6(ip.octets(), port),
            Err(_) => Address::Domain(host.to_string(), port),
        }
    }

    /// Parse "host:port" (IPv6 hosts in brackets)
    pub fn parse(s: &str) -> Result<Self> {
        let (host, port) = split_host_port(s)
            .ok_or_else(|| ProxyError::MalformedAddress(format!("missing port in {:?}", s)))?;
        if host.is_empty() {
            return Err(ProxyError::MalformedAddress(format!("missing host in {:?}", s)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| ProxyError::MalformedAddress(format!("invalid port in {:?}", s)))?;
        Ok(Address::from_host(host, port))
    }

    pub fn atyp(&self) -> u8 {
        match self {
            Address::IPv4(..) => ATYP_IPV4,
            Address::IPv6(..) => ATYP_IPV6,
            Address::Domain(..) => ATYP_DOMAIN,
        }
    }

    /// Number of bytes the wire form occupies
    pub fn encoded_len(&self) -> usize {
        match self {
            Address::IPv4(..) => 1 + 4 + 2,
            Address::IPv6(..) => 1 + 16 + 2,
            Address::Domain(domain, _) => 1 + 1 + domain.len() + 2,
        }
    }

    /// Decode address from buffer
    pub fn decode(buf: &[u8]) -> DecodeResult<Self> {
        if buf.is_empty() {
            return DecodeResult::NeedMoreData;
        }

        match buf[0] {
            ATYP_IPV4 => {
                if buf.len() < 7 {
                    return DecodeResult::NeedMoreData;
                }
                let mut ip = [0u8; 4];
                ip.copy_from_slice(&buf[1..5]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                DecodeResult::Ok(Address::IPv4(ip, port), 7)
            }
            ATYP_IPV6 => {
                if buf.len() < 19 {
                    return DecodeResult::NeedMoreData;
                }
                let mut ip = [0u8; 16];
                ip.copy_from_slice(&buf[1..17]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                DecodeResult::Ok(Address::IPv6(ip, port), 19)
            }
            ATYP_DOMAIN => {
                if buf.len() < 2 {
                    return DecodeResult::NeedMoreData;
                }
                let domain_len = buf[1] as usize;
                let total_len = 1 + 1 + domain_len + 2;
                if buf.len() < total_len {
                    return DecodeResult::NeedMoreData;
                }
                let domain = match std::str::from_utf8(&buf[2..2 + domain_len]) {
                    Ok(s) => s,
                    Err(_) => return DecodeResult::Invalid("invalid domain encoding"),
                };
                let port = u16::from_be_bytes([buf[2 + domain_len], buf[3 + domain_len]]);
                DecodeResult::Ok(Address::from_host(domain, port), total_len)
            }
            _ => DecodeResult::Invalid("invalid address type"),
        }
    }

    /// Decode one address from a stream.
    ///
    /// Reads exactly as many bytes as the address occupies; a short stream
    /// yields `UnexpectedEof`.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let atyp = reader.read_u8().await?;
        match atyp {
            ATYP_IPV4 => {
                let mut ip = [0u8; 4];
                reader.read_exact(&mut ip).await?;
                let port = reader.read_u16().await?;
                Ok(Address::IPv4(ip, port))
            }
            ATYP_IPV6 => {
                let mut ip = [0u8; 16];
                reader.read_exact(&mut ip).await?;
                let port = reader.read_u16().await?;
                Ok(Address::IPv6(ip, port))
            }
            ATYP_DOMAIN => {
                let len = reader.read_u8().await? as usize;
                let mut domain = vec![0u8; len];
                reader.read_exact(&mut domain).await?;
                let port = reader.read_u16().await?;
                let domain = String::from_utf8(domain).map_err(|_| {
                    ProxyError::MalformedAddress("invalid domain encoding".to_string())
                })?;
                Ok(Address::from_host(&domain, port))
            }
            other => Err(ProxyError::MalformedAddress(format!(
                "invalid address type {:#04x}",
                other
            ))),
        }
    }

    /// Append the wire form to `buf`, returning the number of bytes written.
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<usize> {
        match self {
            Address::IPv4(ip, port) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(ip);
                buf.put_u16(*port);
            }
            Address::IPv6(ip, port) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(ip);
                buf.put_u16(*port);
            }
            Address::Domain(domain, port) => {
                if domain.len() > MAX_DOMAIN_LEN {
                    return Err(ProxyError::MalformedAddress(format!(
                        "domain too long: {} bytes",
                        domain.len()
                    )));
                }
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
                buf.put_u16(*port);
            }
        }
        Ok(self.encoded_len())
    }

    /// Wire form as a fresh vector
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf)
    }

    /// Encode the address directly onto a stream
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let buf = self.to_bytes()?;
        writer.write_all(&buf).await?;
        Ok(())
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::IPv4(_, port) => *port,
            Address::IPv6(_, port) => *port,
            Address::Domain(_, port) => *port,
        }
    }

    /// Host part as a string (IP literal or domain)
    pub fn host(&self) -> String {
        match self {
            Address::IPv4(ip, _) => Ipv4Addr::from(*ip).to_string(),
            Address::IPv6(ip, _) => Ipv6Addr::from(*ip).to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    pub fn is_domain(&self) -> bool {
        matches!(self, Address::Domain(..))
    }

    /// IP address for the IP variants
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Address::IPv4(ip, _) => Some(IpAddr::V4(Ipv4Addr::from(*ip))),
            Address::IPv6(ip, _) => Some(IpAddr::V6(Ipv6Addr::from(*ip))),
            Address::Domain(..) => None,
        }
    }

    /// Same host, different port
    pub fn with_port(&self, port: u16) -> Self {
        match self {
            Address::IPv4(ip, _) => Address::IPv4(*ip, port),
            Address::IPv6(ip, _) => Address::IPv6(*ip, port),
            Address::Domain(domain, _) => Address::Domain(domain.clone(), port),
        }
    }

    /// Resolve to socket address
    pub async fn to_socket_addr(&self) -> Result<SocketAddr> {
        match self {
            Address::IPv4(ip, port) => Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(*ip)), *port)),
            Address::IPv6(ip, port) => Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(*ip)), *port)),
            Address::Domain(domain, port) => {
                let mut addrs = lookup_host((domain.as_str(), *port)).await?;
                addrs.next().ok_or_else(|| {
                    ProxyError::UpstreamDialFailed(format!("no addresses found for {}", domain))
                })
            }
        }
    }
}

/// Split "host:port", accepting "[v6]:port". The brackets are removed.
pub fn split_host_port(s: &str) -> Option<(&str, &str)> {
    if let Some(rest) = s.strip_prefix('[') {
        let end = rest.find(']')?;
        let host = &rest[..end];
        let port = rest[end + 1..].strip_prefix(':')?;
        return Some((host, port));
    }
    let idx = s.rfind(':')?;
    let host = &s[..idx];
    if host.contains(':') {
        // bare IPv6 without brackets is ambiguous
        return None;
    }
    Some((host, &s[idx + 1..]))
}
