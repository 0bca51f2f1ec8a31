//! Trojan protocol framing
//!
//! Request:
//! - 56-byte password (SHA224, lowercase hex)
//! - CRLF
//! - Command (1 byte: CONNECT=1, UDP_ASSOCIATE=3)
//! - Address (ATYP + address + port)
//! - Length (2 bytes, UDP_ASSOCIATE only)
//! - CRLF
//! - Payload
//!
//! UDP envelope, repeated inside the TCP stream:
//! ATYP + DST.ADDR + DST.PORT + Length(2) + CRLF + Payload

use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha224};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::core::{Address, Command, DecodeResult, Metadata};
use crate::error::{ProxyError, Result};

pub const HASH_LEN: usize = 56;
pub const CRLF: &[u8; 2] = b"\r\n";

/// Largest UDP payload carried in one envelope
pub const MAX_PACKET_SIZE: usize = 8 * 1024;

/// Lowercase hex SHA-224 of a shared secret: the on-wire password
pub fn password_hash(secret: &str) -> String {
    hex::encode(Sha224::digest(secret.as_bytes()))
}

/// True for bytes that can appear in a password hash
pub fn is_hash_byte(b: u8) -> bool {
    b.is_ascii_digit() || (b'a'..=b'f').contains(&b)
}

/// A full Trojan request, as written by the client on a fresh connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrojanRequest {
    pub password: String,
    pub metadata: Metadata,
    /// Connect: first bytes of the tunnel. Associate: first datagram.
    pub payload: Bytes,
}

impl TrojanRequest {
    /// Minimum request size: 56 (password) + 2 (CRLF) + 1 (cmd) + 7 (min addr) + 2 (CRLF) = 68
    pub const MIN_SIZE: usize = 68;

    pub fn new(password: impl Into<String>, metadata: Metadata, payload: Bytes) -> Self {
        Self {
            password: password.into(),
            metadata,
            payload,
        }
    }

    /// Serialize header and payload into one buffer
    pub fn encode(&self) -> Result<BytesMut> {
        if self.password.len() != HASH_LEN {
            return Err(ProxyError::Config(format!(
                "password hash must be {} bytes, got {}",
                HASH_LEN,
                self.password.len()
            )));
        }
        let mut buf = BytesMut::with_capacity(
            HASH_LEN + 2 + 1 + self.metadata.address.encoded_len() + 4 + self.payload.len(),
        );
        buf.put_slice(self.password.as_bytes());
        buf.put_slice(CRLF);
        match self.metadata.command {
            Command::Connect => {
                self.metadata.encode(&mut buf)?;
                buf.put_slice(CRLF);
                buf.put_slice(&self.payload);
            }
            Command::UdpAssociate => {
                buf.put_u8(Command::UdpAssociate as u8);
                UdpEnvelope::encode_to(&self.metadata.address, &self.payload, &mut buf)?;
            }
        }
        Ok(buf)
    }

    /// Decode a request from the front of `buf`.
    ///
    /// For CONNECT everything after the header is payload. For UDP_ASSOCIATE
    /// the payload is the first datagram and the consumed length stops after
    /// it, leaving later envelopes in the buffer.
    pub fn decode(buf: &[u8]) -> DecodeResult<Self> {
        if buf.len() < Self::MIN_SIZE {
            return DecodeResult::NeedMoreData;
        }
        if !buf[..HASH_LEN].iter().copied().all(is_hash_byte) {
            return DecodeResult::Invalid("password is not a hex hash");
        }
        if &buf[HASH_LEN..HASH_LEN + 2] != CRLF {
            return DecodeResult::Invalid("missing CRLF after password");
        }
        // Validated as ASCII hex above.
        let password = String::from_utf8_lossy(&buf[..HASH_LEN]).into_owned();

        let command = match Command::try_from(buf[HASH_LEN + 2]) {
            Ok(cmd) => cmd,
            Err(_) => return DecodeResult::Invalid("invalid trojan command"),
        };
        let rest = &buf[HASH_LEN + 3..];

        match command {
            Command::Connect => {
                let (address, addr_len) = match Address::decode(rest) {
                    DecodeResult::Ok(addr, len) => (addr, len),
                    DecodeResult::NeedMoreData => return DecodeResult::NeedMoreData,
                    DecodeResult::Invalid(msg) => return DecodeResult::Invalid(msg),
                };
                if rest.len() < addr_len + 2 {
                    return DecodeResult::NeedMoreData;
                }
                if &rest[addr_len..addr_len + 2] != CRLF {
                    return DecodeResult::Invalid("missing CRLF after address");
                }
                let payload = Bytes::copy_from_slice(&rest[addr_len + 2..]);
                DecodeResult::Ok(
                    Self::new(password, Metadata::connect(address), payload),
                    buf.len(),
                )
            }
            Command::UdpAssociate => match UdpEnvelope::decode(rest) {
                DecodeResult::Ok(env, len) => DecodeResult::Ok(
                    Self::new(password, Metadata::associate(env.address), env.payload),
                    HASH_LEN + 3 + len,
                ),
                DecodeResult::NeedMoreData => DecodeResult::NeedMoreData,
                DecodeResult::Invalid(msg) => DecodeResult::Invalid(msg),
            },
        }
    }
}

/// Header bytes an outbound connection must send before its first payload.
///
/// For UDP_ASSOCIATE this stops after the command byte: the address, length
/// and CRLF come from the first envelope written through the connection.
pub fn request_prefix(password: &str, metadata: &Metadata) -> Result<BytesMut> {
    let mut buf = BytesMut::with_capacity(HASH_LEN + 2 + 1 + metadata.address.encoded_len() + 2);
    buf.put_slice(password.as_bytes());
    buf.put_slice(CRLF);
    match metadata.command {
        Command::Connect => {
            metadata.encode(&mut buf)?;
            buf.put_slice(CRLF);
        }
        Command::UdpAssociate => buf.put_u8(Command::UdpAssociate as u8),
    }
    Ok(buf)
}

/// One datagram inside a Trojan (or relayed SOCKS) stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpEnvelope {
    pub address: Address,
    pub payload: Bytes,
}

impl UdpEnvelope {
    /// Minimum envelope size: 7 (IPv4 addr) + 2 (length) + 2 (CRLF) = 11
    pub const MIN_SIZE: usize = 11;

    pub fn new(address: Address, payload: Bytes) -> Self {
        Self { address, payload }
    }

    /// Decode one envelope from the front of `buf`
    pub fn decode(buf: &[u8]) -> DecodeResult<Self> {
        let (address, addr_len) = match Address::decode(buf) {
            DecodeResult::Ok(addr, len) => (addr, len),
            DecodeResult::NeedMoreData => return DecodeResult::NeedMoreData,
            DecodeResult::Invalid(msg) => return DecodeResult::Invalid(msg),
        };

        if buf.len() < addr_len + 4 {
            return DecodeResult::NeedMoreData;
        }

        let payload_len = u16::from_be_bytes([buf[addr_len], buf[addr_len + 1]]) as usize;

        if &buf[addr_len + 2..addr_len + 4] != CRLF {
            return DecodeResult::Invalid("missing CRLF in UDP packet");
        }
        if payload_len > MAX_PACKET_SIZE {
            return DecodeResult::Invalid("UDP packet too large");
        }

        let total_len = addr_len + 4 + payload_len;
        if buf.len() < total_len {
            return DecodeResult::NeedMoreData;
        }

        let payload = Bytes::copy_from_slice(&buf[addr_len + 4..total_len]);
        DecodeResult::Ok(Self { address, payload }, total_len)
    }

    /// Append `ADDR LEN CRLF PAYLOAD` to `buf`
    pub fn encode_to<B: BufMut>(address: &Address, payload: &[u8], buf: &mut B) -> Result<usize> {
        if payload.len() > MAX_PACKET_SIZE {
            return Err(ProxyError::MalformedEnvelope(format!(
                "payload of {} bytes exceeds {}",
                payload.len(),
                MAX_PACKET_SIZE
            )));
        }
        let addr_len = address.encode(buf)?;
        buf.put_u16(payload.len() as u16);
        buf.put_slice(CRLF);
        buf.put_slice(payload);
        Ok(addr_len + 4 + payload.len())
    }

    pub fn encode(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::with_capacity(self.address.encoded_len() + 4 + self.payload.len());
        Self::encode_to(&self.address, &self.payload, &mut buf)?;
        Ok(buf)
    }
}

/// Read one envelope, starting from bytes a previous read left over.
///
/// Bytes that follow the envelope stay in `buffered` for the next call. The
/// buffer is only extended in place, so dropping this future between reads
/// loses nothing. A stream that ends cleanly between envelopes yields
/// `ConnectionClosed`; one that ends mid-envelope yields `UnexpectedEof`.
pub async fn read_envelope<R>(reader: &mut R, buffered: &mut BytesMut) -> Result<UdpEnvelope>
where
    R: AsyncRead + Unpin,
{
    loop {
        match UdpEnvelope::decode(&buffered[..]) {
            DecodeResult::Ok(env, consumed) => {
                buffered.advance(consumed);
                return Ok(env);
            }
            DecodeResult::Invalid(msg) => {
                return Err(ProxyError::MalformedEnvelope(msg.to_string()));
            }
            DecodeResult::NeedMoreData => {
                buffered.reserve(MAX_PACKET_SIZE);
                let n = reader.read_buf(buffered).await?;
                if n == 0 {
                    return Err(if buffered.is_empty() {
                        ProxyError::ConnectionClosed
                    } else {
                        ProxyError::UnexpectedEof
                    });
                }
            }
        }
    }
}
