//! Bidirectional relay with idle detection and shared cancellation
//!
//! Both directions run concurrently; whichever finishes first (EOF, error,
//! idle timeout or cancellation) tears the pair down. Half-close is not
//! preserved.

use pin_project_lite::pin_project;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::error::{ProxyError, Result};

/// How a relay ended
#[derive(Debug)]
pub enum RelayEnd {
    /// One side reached end of stream
    Eof,
    /// No bytes moved in either direction for the idle window
    Timeout,
    /// The shared cancellation token fired
    Cancelled,
    /// A read or write failed
    Failed(ProxyError),
}

/// Bytes moved in each direction plus the reason the relay stopped
#[derive(Debug)]
pub struct CopyResult {
    pub a_to_b: u64,
    pub b_to_a: u64,
    pub end: RelayEnd,
}

impl CopyResult {
    /// True unless an unexpected error ended the relay
    pub fn is_quiet(&self) -> bool {
        !matches!(self.end, RelayEnd::Failed(_))
    }

    /// Surface only real failures; EOF, timeout and cancellation are `Ok`
    pub fn into_result(self) -> Result<(u64, u64)> {
        match self.end {
            RelayEnd::Failed(e) => Err(e),
            _ => Ok((self.a_to_b, self.b_to_a)),
        }
    }
}

pin_project! {
    /// A stream wrapper that tracks the last activity time and bytes read
    struct TimedStream<S> {
        #[pin]
        inner: S,
        start_time: Instant,
        last_activity: Arc<AtomicU64>,
        read_bytes: Arc<AtomicU64>,
    }
}

impl<S> TimedStream<S> {
    fn new(
        inner: S,
        start_time: Instant,
        last_activity: Arc<AtomicU64>,
        read_bytes: Arc<AtomicU64>,
    ) -> Self {
        Self {
            inner,
            start_time,
            last_activity,
            read_bytes,
        }
    }
}

fn touch(start_time: &Instant, last_activity: &AtomicU64) {
    last_activity.store(start_time.elapsed().as_millis() as u64, Ordering::Release);
}

impl<S: AsyncRead> AsyncRead for TimedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.project();
        let before_len = buf.filled().len();
        let result = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let bytes_read = buf.filled().len() - before_len;
            if bytes_read > 0 {
                touch(this.start_time, this.last_activity);
                this.read_bytes
                    .fetch_add(bytes_read as u64, Ordering::Relaxed);
            }
        }
        result
    }
}

impl<S: AsyncWrite> AsyncWrite for TimedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.project();
        let result = this.inner.poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            if *n > 0 {
                touch(this.start_time, this.last_activity);
            }
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// Watchdog tick for a given idle window
fn check_interval(idle: Duration) -> Duration {
    (idle / 4).clamp(Duration::from_millis(10), Duration::from_secs(30))
}

/// Relay bytes between `a` and `b` until one side ends, the pair has been
/// idle for `idle`, or `cancel` fires. Both streams are shut down and
/// dropped before returning.
pub async fn relay<A, B>(a: A, b: B, cancel: &CancellationToken, idle: Duration) -> CopyResult
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let start_time = Instant::now();
    let last_activity = Arc::new(AtomicU64::new(0));
    let a_to_b = Arc::new(AtomicU64::new(0));
    let b_to_a = Arc::new(AtomicU64::new(0));

    let stream_a = TimedStream::new(a, start_time, last_activity.clone(), a_to_b.clone());
    let stream_b = TimedStream::new(b, start_time, last_activity.clone(), b_to_a.clone());

    let (mut a_read, mut a_write) = tokio::io::split(stream_a);
    let (mut b_read, mut b_write) = tokio::io::split(stream_b);

    let upload = tokio::io::copy(&mut a_read, &mut b_write);
    let download = tokio::io::copy(&mut b_read, &mut a_write);

    let idle_millis = idle.as_millis() as u64;
    let watchdog = async {
        let mut interval = tokio::time::interval(check_interval(idle));
        interval.tick().await;
        loop {
            interval.tick().await;
            let last = last_activity.load(Ordering::Acquire);
            let now = start_time.elapsed().as_millis() as u64;
            if now.saturating_sub(last) >= idle_millis {
                return;
            }
        }
    };

    let end = tokio::select! {
        res = upload => match res {
            Ok(_) => RelayEnd::Eof,
            Err(e) => RelayEnd::Failed(e.into()),
        },
        res = download => match res {
            Ok(_) => RelayEnd::Eof,
            Err(e) => RelayEnd::Failed(e.into()),
        },
        _ = watchdog => RelayEnd::Timeout,
        _ = cancel.cancelled() => RelayEnd::Cancelled,
    };

    // The relay owns both ends; shut them down so peers observe the close.
    let _ = b_write.shutdown().await;
    let _ = a_write.shutdown().await;

    let end = match end {
        RelayEnd::Failed(e) if e.is_timeout() => RelayEnd::Timeout,
        RelayEnd::Failed(e) if e.is_closed() => RelayEnd::Eof,
        other => other,
    };

    CopyResult {
        a_to_b: a_to_b.load(Ordering::Relaxed),
        b_to_a: b_to_a.load(Ordering::Relaxed),
        end,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_timed_stream_read_counts_bytes() {
        let cursor = Cursor::new(b"hello world".to_vec());
        let last_activity = Arc::new(AtomicU64::new(0));
        let read_bytes = Arc::new(AtomicU64::new(0));

        let mut stream = TimedStream::new(
            cursor,
            Instant::now(),
            Arc::clone(&last_activity),
            read_bytes.clone(),
        );

        let mut buf = [0u8; 5];
        let n = stream.read(&mut buf).await.unwrap();

        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(read_bytes.load(Ordering::Relaxed), 5);
    }

    #[tokio::test]
    async fn test_timed_stream_write_updates_activity() {
        let start_time = Instant::now();
        let last_activity = Arc::new(AtomicU64::new(0));
        let mut stream = TimedStream::new(
            Cursor::new(Vec::new()),
            start_time,
            Arc::clone(&last_activity),
            Arc::new(AtomicU64::new(0)),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        stream.write_all(b"test").await.unwrap();
        assert!(last_activity.load(Ordering::Acquire) >= 20);
    }

    #[tokio::test]
    async fn test_relay_copies_both_directions() {
        let (mut client, relay_a) = tokio::io::duplex(1024);
        let (relay_b, mut upstream) = tokio::io::duplex(1024);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(async move {
            relay(relay_a, relay_b, &cancel, Duration::from_secs(5)).await
        });

        client.write_all(b"request").await.unwrap();
        let mut buf = [0u8; 7];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request");

        upstream.write_all(b"response!").await.unwrap();
        let mut buf = [0u8; 9];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"response!");

        drop(client);
        let result = handle.await.unwrap();
        assert_eq!(result.a_to_b, 7);
        assert_eq!(result.b_to_a, 9);
        assert!(result.is_quiet());

        // Upstream observes the teardown.
        let mut rest = Vec::new();
        upstream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_relay_cancellation_closes_both_ends() {
        let (mut client, relay_a) = tokio::io::duplex(64);
        let (relay_b, mut upstream) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        let relay_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            relay(relay_a, relay_b, &relay_cancel, Duration::from_secs(60)).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("relay must stop promptly")
            .unwrap();
        assert!(matches!(result.end, RelayEnd::Cancelled));

        let mut buf = Vec::new();
        assert_eq!(client.read_to_end(&mut buf).await.unwrap(), 0);
        assert_eq!(upstream.read_to_end(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_relay_idle_timeout_is_quiet() {
        let (_client, relay_a) = tokio::io::duplex(64);
        let (relay_b, _upstream) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();

        let result = relay(relay_a, relay_b, &cancel, Duration::from_millis(50)).await;
        assert!(matches!(result.end, RelayEnd::Timeout));
        assert!(result.into_result().is_ok());
    }

    #[test]
    fn test_check_interval_bounds() {
        assert_eq!(check_interval(Duration::from_millis(8)), Duration::from_millis(10));
        assert_eq!(check_interval(Duration::from_secs(20)), Duration::from_secs(5));
        assert_eq!(check_interval(Duration::from_secs(600)), Duration::from_secs(30));
    }
}
