//! Client-side Trojan stream with a one-shot request header
//!
//! The header is not written at construction. The first `poll_write` sends
//! header and payload as a single frame, so the request and the first bytes
//! of the tunnel leave in one TLS record. A read or flush issued before any
//! write sends the header alone.

use bytes::{Buf, BytesMut};
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::protocol::request_prefix;
use crate::core::Metadata;
use crate::error::Result;

#[derive(Debug)]
enum HeaderState {
    /// Header bytes not yet sent
    Pending(BytesMut),
    /// Frame partially written; `payload_len` is what the caller handed us
    Writing { frame: BytesMut, payload_len: usize },
    Written,
}

pin_project! {
    pub struct OutboundConn<S> {
        #[pin]
        inner: S,
        state: HeaderState,
        metadata: Metadata,
    }
}

impl<S> OutboundConn<S> {
    /// Wrap `inner`; `password` is the 56-byte hex hash
    pub fn new(inner: S, password: &str, metadata: Metadata) -> Result<Self> {
        let prefix = request_prefix(password, &metadata)?;
        Ok(Self {
            inner,
            state: HeaderState::Pending(prefix),
            metadata,
        })
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn is_header_written(&self) -> bool {
        matches!(self.state, HeaderState::Written)
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

/// Drive any pending header bytes onto `inner`. Resolves to the payload
/// length carried by the frame (0 when the header went out alone).
fn poll_header<S: AsyncWrite>(
    mut inner: Pin<&mut S>,
    state: &mut HeaderState,
    cx: &mut Context<'_>,
) -> Poll<io::Result<usize>> {
    loop {
        match state {
            HeaderState::Written => return Poll::Ready(Ok(0)),
            HeaderState::Pending(prefix) => {
                let frame = std::mem::take(prefix);
                *state = HeaderState::Writing {
                    frame,
                    payload_len: 0,
                };
            }
            HeaderState::Writing { frame, payload_len } => {
                while frame.has_remaining() {
                    let n = ready!(inner.as_mut().poll_write(cx, frame.chunk()))?;
                    if n == 0 {
                        return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                    }
                    frame.advance(n);
                }
                let len = *payload_len;
                *state = HeaderState::Written;
                return Poll::Ready(Ok(len));
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite> AsyncRead for OutboundConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut this = self.project();
        if !matches!(this.state, HeaderState::Written) {
            ready!(poll_header(this.inner.as_mut(), this.state, cx))?;
            ready!(this.inner.as_mut().poll_flush(cx))?;
        }
        this.inner.poll_read(cx, buf)
    }
}

impl<S: AsyncWrite> AsyncWrite for OutboundConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        match this.state {
            HeaderState::Written => this.inner.poll_write(cx, buf),
            HeaderState::Pending(prefix) => {
                let mut frame = std::mem::take(prefix);
                frame.extend_from_slice(buf);
                *this.state = HeaderState::Writing {
                    frame,
                    payload_len: buf.len(),
                };
                poll_header(this.inner, this.state, cx)
            }
            // A retry after Pending: the caller's bytes are already in the frame.
            HeaderState::Writing { .. } => poll_header(this.inner, this.state, cx),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();
        ready!(poll_header(this.inner.as_mut(), this.state, cx))?;
        this.inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}
