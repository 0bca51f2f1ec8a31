//! Per-flow metadata: command plus destination address

use bytes::BufMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::address::Address;
use crate::error::{ProxyError, Result};

/// Command shared by SOCKS5 and Trojan requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// TCP connect
    Connect = 1,
    /// UDP associate
    UdpAssociate = 3,
}

impl TryFrom<u8> for Command {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Command::Connect),
            3 => Ok(Command::UdpAssociate),
            other => Err(ProxyError::CommandNotSupported(other)),
        }
    }
}

/// Transport network implied by a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub command: Command,
    pub address: Address,
}

impl Metadata {
    pub fn new(command: Command, address: Address) -> Self {
        Self { command, address }
    }

    pub fn connect(address: Address) -> Self {
        Self::new(Command::Connect, address)
    }

    pub fn associate(address: Address) -> Self {
        Self::new(Command::UdpAssociate, address)
    }

    pub fn network(&self) -> Network {
        match self.command {
            Command::Connect => Network::Tcp,
            Command::UdpAssociate => Network::Udp,
        }
    }

    pub fn host(&self) -> String {
        self.address.host()
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }

    /// Read `CMD ADDR` from a stream
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let command = Command::try_from(reader.read_u8().await?)?;
        let address = Address::read_from(reader).await?;
        Ok(Self { command, address })
    }

    /// Append `CMD ADDR`
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<usize> {
        buf.put_u8(self.command as u8);
        Ok(1 + self.address.encode(buf)?)
    }
}

impl std::fmt::Display for Metadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network(), self.address)
    }
}
