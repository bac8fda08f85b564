//! Average-rate throttling for byte streams.
//!
//! [`RateLimitedReader`] does not gate every read. It counts bytes over a
//! window that closes after one second (or when the counter nears overflow)
//! and, if the window ran ahead of the limit, holds off the next read for as
//! long as it takes the average to come back down to the limit.

use std::future::Future;
use std::io;
use std::num::NonZeroU64;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, ReadBuf};
use tokio::time::{Instant, Sleep};

const WINDOW: Duration = Duration::from_secs(1);
const OVERFLOW_GUARD: u64 = u64::MAX / 2;

#[derive(Debug)]
struct Window {
    limit: NonZeroU64,
    started: Option<Instant>,
    read: u64,
}

impl Window {
    fn new(limit: NonZeroU64) -> Self {
        Self {
            limit,
            started: None,
            read: 0,
        }
    }

    fn begin(&mut self, now: Instant) {
        if self.started.is_none() {
            self.started = Some(now);
        }
    }

    /// Accounts for `n` bytes and returns the pause owed once the window closes.
    fn record(&mut self, n: u64, now: Instant) -> Option<Duration> {
        let started = *self.started.get_or_insert(now);
        self.read = self.read.saturating_add(n);
        let elapsed = now.saturating_duration_since(started);
        if elapsed < WINDOW && self.read <= OVERFLOW_GUARD {
            return None;
        }

        let limit = self.limit.get();
        let allowed = (elapsed.as_secs_f64() * limit as f64) as u64;
        let excess = self.read.saturating_sub(allowed);
        self.read = 0;
        self.started = None;
        if excess == 0 {
            return None;
        }
        let millis = (u128::from(excess) * 1000 / u128::from(limit)).min(u128::from(u64::MAX));
        Some(Duration::from_millis(millis as u64))
    }
}

/// Wraps a reader and keeps its average throughput at or below a byte rate.
///
/// Without a limit every call goes straight to the inner reader: no
/// accounting, no timers.
#[derive(Debug)]
pub struct RateLimitedReader<R> {
    inner: R,
    window: Option<Window>,
    pause: Option<Pin<Box<Sleep>>>,
}

impl<R> RateLimitedReader<R> {
    pub fn new(inner: R, limit: Option<NonZeroU64>) -> Self {
        Self {
            inner,
            window: limit.map(Window::new),
            pause: None,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for RateLimitedReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if let Some(pause) = this.pause.as_mut() {
            ready!(pause.as_mut().poll(cx));
            this.pause = None;
        }

        let Some(window) = this.window.as_mut() else {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        };

        window.begin(Instant::now());
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let n = buf.filled().len() - before;
        if n == 0 {
            return Poll::Ready(Ok(()));
        }

        if let Some(delay) = window.record(n as u64, Instant::now()) {
            this.pause = Some(Box::pin(tokio::time::sleep(delay)));
        }
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn limit(n: u64) -> Option<NonZeroU64> {
        NonZeroU64::new(n)
    }

    #[tokio::test(start_paused = true)]
    async fn window_stays_open_for_a_second() {
        let t0 = Instant::now();
        let mut window = Window::new(NonZeroU64::new(100).unwrap());
        window.begin(t0);
        assert_eq!(window.record(10_000, t0 + Duration::from_millis(500)), None);
        assert_eq!(window.read, 10_000);
    }

    #[tokio::test(start_paused = true)]
    async fn excess_becomes_pause_and_window_resets() {
        let t0 = Instant::now();
        let mut window = Window::new(NonZeroU64::new(1000).unwrap());
        window.begin(t0);
        window.record(2500, t0 + Duration::from_millis(200));
        let pause = window.record(1000, t0 + Duration::from_secs(2));
        // 3500 read against 2000 allowed: 1500 bytes at 1000 B/s.
        assert_eq!(pause, Some(Duration::from_millis(1500)));
        assert_eq!(window.read, 0);
        assert!(window.started.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn under_budget_window_owes_nothing() {
        let t0 = Instant::now();
        let mut window = Window::new(NonZeroU64::new(1000).unwrap());
        window.begin(t0);
        assert_eq!(window.record(900, t0 + Duration::from_secs(1)), None);
        assert_eq!(window.read, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_guard_closes_window_early() {
        let t0 = Instant::now();
        let mut window = Window::new(NonZeroU64::new(u64::MAX).unwrap());
        window.begin(t0);
        let pause = window.record(OVERFLOW_GUARD + 1, t0);
        assert!(pause.is_some());
        assert_eq!(window.read, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unlimited_reader_adds_no_latency() {
        let data = vec![7u8; 64 * 1024];
        let mut reader = RateLimitedReader::new(Cursor::new(data.clone()), None);
        let start = Instant::now();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(reader.window.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_byte_reads_are_not_accounted() {
        let mut reader = RateLimitedReader::new(Cursor::new(Vec::new()), limit(10));
        let mut buf = [0u8; 16];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
        assert_eq!(reader.window.as_ref().unwrap().read, 0);
    }

    /// Writes `chunks` x 1000 bytes, one chunk every 100ms, then closes.
    fn spawn_producer(chunks: usize) -> tokio::io::DuplexStream {
        let (reader, mut writer) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            for _ in 0..chunks {
                writer.write_all(&[1u8; 1000]).await.unwrap();
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        });
        reader
    }

    async fn drain(mut reader: impl AsyncRead + Unpin) -> usize {
        let mut buf = [0u8; 4096];
        let mut total = 0;
        loop {
            let n = reader.read(&mut buf).await.unwrap();
            if n == 0 {
                return total;
            }
            total += n;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_source_is_slowed_to_limit() {
        // 10 kB/s producer for 3s, reader capped at 2 kB/s.
        let start = Instant::now();
        let total = drain(RateLimitedReader::new(spawn_producer(30), limit(2000))).await;
        assert_eq!(total, 30_000);
        // The first window reads ~11 kB in 1s and owes a 4.5s pause.
        assert!(start.elapsed() >= Duration::from_millis(5_500), "{:?}", start.elapsed());
    }

    #[tokio::test(start_paused = true)]
    async fn unlimited_source_finishes_at_producer_pace() {
        let start = Instant::now();
        let total = drain(RateLimitedReader::new(spawn_producer(30), None)).await;
        assert_eq!(total, 30_000);
        assert!(start.elapsed() <= Duration::from_millis(3_100), "{:?}", start.elapsed());
    }
}
