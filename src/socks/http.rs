//! HTTP accept path for the mixed SOCKS/HTTP listener
//!
//! CONNECT becomes a tunnel; any other method is treated as a single
//! forward-proxy request whose rewritten head becomes the tunnel's first
//! payload.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::{split_host_port, Address};
use crate::error::{ProxyError, Result};

/// Upper bound on a request head
pub const MAX_HEAD_SIZE: usize = 8 * 1024;

pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Headers that only concern the hop between client and proxy
const HOP_HEADERS: [&str; 5] = [
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "connection",
    "accept-encoding",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpAccept {
    pub address: Address,
    /// Bytes to send upstream before relaying
    pub payload: Bytes,
    pub is_connect: bool,
}

struct RequestHead<'a> {
    method: &'a str,
    target: &'a str,
    version: &'a str,
    headers: Vec<(&'a str, &'a str)>,
}

impl<'a> RequestHead<'a> {
    fn parse(head: &'a str) -> Result<Self> {
        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split(' ').filter(|p| !p.is_empty());
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ProxyError::MalformedRequest(format!(
                "bad request line: {request_line}"
            )));
        };
        if !version.starts_with("HTTP/") {
            return Err(ProxyError::MalformedRequest(format!(
                "bad request line: {request_line}"
            )));
        }

        let mut headers = Vec::new();
        for line in lines.filter(|l| !l.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ProxyError::MalformedRequest(format!("bad header: {line}")))?;
            headers.push((name.trim(), value.trim()));
        }
        Ok(Self {
            method,
            target,
            version,
            headers,
        })
    }

    fn header(&self, name: &str) -> Option<&'a str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| *v)
    }

    fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Split the request target into (scheme, authority, origin-form path)
    fn split_target(&self) -> (Option<&'a str>, Option<&'a str>, &'a str) {
        if self.is_connect() {
            return (None, Some(self.target), "");
        }
        match self.target.split_once("://") {
            Some((scheme, rest)) => match rest.find('/') {
                Some(idx) => (Some(scheme), Some(&rest[..idx]), &rest[idx..]),
                None => (Some(scheme), Some(rest), "/"),
            },
            None => (None, None, self.target),
        }
    }
}

fn parse_authority(authority: &str, default_port: u16) -> Result<Address> {
    let (host, port) = match split_host_port(authority) {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| ProxyError::MalformedRequest(format!("bad port in {authority}")))?;
            (host, port)
        }
        None => (
            authority.trim_start_matches('[').trim_end_matches(']'),
            default_port,
        ),
    };
    if host.is_empty() {
        return Err(ProxyError::MalformedRequest("empty host".into()));
    }
    Ok(Address::from_host(host, port))
}

/// Read a request head whose first byte was consumed by the sniffer.
/// Returns the head (without the blank line) and any bytes after it.
async fn read_head<S>(first: u8, stream: &mut S) -> Result<(BytesMut, BytesMut)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    buf.extend_from_slice(&[first]);
    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let mut head = buf.split_to(end + 4);
            head.truncate(end);
            return Ok((head, buf));
        }
        if buf.len() >= MAX_HEAD_SIZE {
            return Err(ProxyError::MalformedRequest("request head too large".into()));
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(ProxyError::UnexpectedEof);
        }
    }
}

/// Accept one HTTP request: answer CONNECT, or rewrite a plain request into
/// the payload for the upstream
pub async fn accept_http<S>(first: u8, stream: &mut S) -> Result<HttpAccept>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (head, body) = read_head(first, stream).await?;
    let head = std::str::from_utf8(&head)
        .map_err(|_| ProxyError::MalformedRequest("request head is not UTF-8".into()))?;
    let req = RequestHead::parse(head)?;

    let (scheme, authority, path) = req.split_target();
    let authority = authority
        .or_else(|| req.header("Host"))
        .ok_or_else(|| ProxyError::MalformedRequest("no host in request".into()))?;
    let default_port = match scheme {
        Some(s) if s.eq_ignore_ascii_case("https") => 443,
        Some(_) => 80,
        // Origin-form requests to a proxy are plain HTTP.
        None if !req.is_connect() => 80,
        None => 443,
    };
    let address = parse_authority(authority, default_port)?;

    if req.is_connect() {
        stream.write_all(CONNECT_ESTABLISHED).await?;
        return Ok(HttpAccept {
            address,
            payload: body.freeze(),
            is_connect: true,
        });
    }

    let mut out = BytesMut::with_capacity(head.len() + body.len() + 32);
    out.extend_from_slice(format!("{} {} {}\r\n", req.method, path, req.version).as_bytes());
    if req.header("Host").is_none() {
        out.extend_from_slice(format!("Host: {authority}\r\n").as_bytes());
    }
    for (name, value) in &req.headers {
        if HOP_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&body);

    Ok(HttpAccept {
        address,
        payload: out.freeze(),
        is_connect: false,
    })
}
