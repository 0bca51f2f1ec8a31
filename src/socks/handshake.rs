//! SOCKS5 handshake, server and client sides
//!
//! Only the no-authentication method is offered. The server side is an
//! explicit state machine:
//!
//! ```text
//! Start -> MethodsNegotiated -> CommandRead -> AddressRead
//!       -> ConnectReplySent | AssociateReplySent -> Terminal
//! ```

use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::{Address, Command, Metadata};
use crate::error::{ProxyError, Result};

pub const SOCKS_VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;

/// Reply to CONNECT: succeeded, bound to 0.0.0.0:0
pub const CONNECT_REPLY: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Version byte consumed; NMETHODS next
    Start,
    MethodsNegotiated,
    CommandRead,
    AddressRead,
    ConnectReplySent,
    AssociateReplySent,
    Terminal,
}

/// What a completed handshake asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    Connect(Metadata),
    /// The caller keeps the TCP connection open for the life of the association
    Associate(Metadata),
}

impl Handshake {
    pub fn metadata(&self) -> &Metadata {
        match self {
            Handshake::Connect(md) | Handshake::Associate(md) => md,
        }
    }
}

/// Server side of one SOCKS5 handshake
#[derive(Debug)]
pub struct ServerHandshake {
    state: HandshakeState,
    command: u8,
    address: Option<Address>,
    /// Address announced in the UDP ASSOCIATE reply
    udp_bind: SocketAddr,
}

impl ServerHandshake {
    pub fn new(udp_bind: SocketAddr) -> Self {
        Self {
            state: HandshakeState::Start,
            command: 0,
            address: None,
            udp_bind,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Drive the handshake to completion. The caller has already read the
    /// version byte while sniffing the protocol.
    pub async fn run<S>(&mut self, stream: &mut S) -> Result<Handshake>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            self.state = match self.state {
                HandshakeState::Start => {
                    let nmethods = stream.read_u8().await? as usize;
                    let mut methods = [0u8; 255];
                    stream.read_exact(&mut methods[..nmethods]).await?;
                    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;
                    HandshakeState::MethodsNegotiated
                }
                HandshakeState::MethodsNegotiated => {
                    let mut head = [0u8; 3];
                    stream.read_exact(&mut head).await?;
                    if head[0] != SOCKS_VERSION {
                        return Err(ProxyError::ProtocolVersionMismatch(head[0]));
                    }
                    self.command = head[1];
                    HandshakeState::CommandRead
                }
                HandshakeState::CommandRead => {
                    self.address = Some(Address::read_from(stream).await?);
                    HandshakeState::AddressRead
                }
                HandshakeState::AddressRead => match Command::try_from(self.command)? {
                    Command::Connect => {
                        stream.write_all(&CONNECT_REPLY).await?;
                        HandshakeState::ConnectReplySent
                    }
                    Command::UdpAssociate => {
                        let mut reply = vec![SOCKS_VERSION, 0x00, 0x00];
                        Address::from(self.udp_bind).encode(&mut reply)?;
                        stream.write_all(&reply).await?;
                        HandshakeState::AssociateReplySent
                    }
                },
                HandshakeState::ConnectReplySent | HandshakeState::AssociateReplySent => {
                    let command = Command::try_from(self.command)?;
                    let address = self.address.take().ok_or(ProxyError::UnexpectedEof)?;
                    let done = match self.state {
                        HandshakeState::ConnectReplySent => {
                            Handshake::Connect(Metadata::new(command, address))
                        }
                        _ => Handshake::Associate(Metadata::new(command, address)),
                    };
                    self.state = HandshakeState::Terminal;
                    return Ok(done);
                }
                HandshakeState::Terminal => {
                    return Err(ProxyError::ConnectionClosed);
                }
            };
        }
    }
}

/// Client side: negotiate no-auth, send `command` for `target` and return
/// the bound address from the reply
pub async fn client_handshake<S>(stream: &mut S, command: Command, target: &Address) -> Result<Address>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH]).await?;
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS_VERSION {
        return Err(ProxyError::ProtocolVersionMismatch(reply[0]));
    }
    if reply[1] != METHOD_NO_AUTH {
        return Err(ProxyError::AuthenticationFailed);
    }

    let mut request = vec![SOCKS_VERSION, command as u8, 0x00];
    target.encode(&mut request)?;
    stream.write_all(&request).await?;

    let mut head = [0u8; 3];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(ProxyError::ProtocolVersionMismatch(head[0]));
    }
    if head[1] != 0 {
        return Err(ProxyError::UpstreamDialFailed(format!(
            "socks reply {:#04x} for {}",
            head[1], target
        )));
    }
    Address::read_from(stream).await
}
