use std::io;
use thiserror::Error;

/// Error type shared by every protocol and session component
#[derive(Error, Debug)]
pub enum ProxyError {
    /// SOCKS version byte was not 0x05
    #[error("protocol version mismatch: {0:#04x}")]
    ProtocolVersionMismatch(u8),

    /// SOCKS / Trojan command byte not understood
    #[error("command not supported: {0:#04x}")]
    CommandNotSupported(u8),

    #[error("malformed address: {0}")]
    MalformedAddress(String),

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// HTTP request head could not be parsed
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("authentication failed")]
    AuthenticationFailed,

    /// Read/write deadline exceeded
    #[error("operation timed out")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("upstream dial failed: {0}")]
    UpstreamDialFailed(String),

    #[error("unexpected end of stream")]
    UnexpectedEof,

    #[error("IO error: {0}")]
    Io(io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// Timeouts are expected on idle flows and logged quietly
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProxyError::Timeout)
    }

    /// End-of-stream style errors: peer went away, nothing to report
    pub fn is_closed(&self) -> bool {
        match self {
            ProxyError::ConnectionClosed | ProxyError::UnexpectedEof => true,
            ProxyError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

impl From<io::Error> for ProxyError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => ProxyError::UnexpectedEof,
            io::ErrorKind::TimedOut => ProxyError::Timeout,
            _ => ProxyError::Io(err),
        }
    }
}

impl From<tokio::time::error::Elapsed> for ProxyError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ProxyError::Timeout
    }
}

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::Tls(err.to_string())
    }
}

impl From<toml::de::Error> for ProxyError {
    fn from(err: toml::de::Error) -> Self {
        ProxyError::Config(format!("TOML parse error: {}", err))
    }
}

impl From<ProxyError> for io::Error {
    fn from(err: ProxyError) -> Self {
        match err {
            ProxyError::Io(e) => e,
            ProxyError::Timeout => io::Error::new(io::ErrorKind::TimedOut, err.to_string()),
            ProxyError::UnexpectedEof => {
                io::Error::new(io::ErrorKind::UnexpectedEof, err.to_string())
            }
            ProxyError::ConnectionClosed => {
                io::Error::new(io::ErrorKind::NotConnected, err.to_string())
            }
            other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
        }
    }
}
