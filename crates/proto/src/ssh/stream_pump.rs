//! One-directional byte pump between an async source and sink.
//!
//! A pump copies in fixed-size chunks, optionally stops after a byte limit,
//! reports cumulative progress after every chunk, and hands a terminal I/O
//! failure to an error callback exactly once. Two pumps make a duplex relay.
//!
//! # Example
//!
//! ```rust
//! use tern_proto::ssh::stream_pump::{self, FlushPolicy, PumpConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> tern_platform::TernResult<()> {
//! let mut source: &[u8] = b"hello, pump";
//! let mut sink = Vec::new();
//!
//! let config = PumpConfig::new()
//!     .with_buffer_size(4)
//!     .with_flush(FlushPolicy::Eager);
//! let copied = stream_pump::run(&mut source, &mut sink, config).await?;
//! assert_eq!(copied, 11);
//! assert_eq!(sink, b"hello, pump");
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tern_platform::{TernError, TernResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info};

/// When the sink is flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushPolicy {
    /// Once, after the copy finishes
    #[default]
    AtEnd,
    /// After every chunk (interactive channels)
    Eager,
}

/// Receives the cumulative byte count after every chunk.
pub type ProgressListener = Arc<dyn Fn(u64) + Send + Sync>;

/// Receives the error that ended a pump. Called at most once.
pub type ErrorCallback = Box<dyn FnOnce(&TernError) + Send>;

/// Settings for one pump run.
pub struct PumpConfig {
    buffer_size: usize,
    limit: Option<u64>,
    flush: FlushPolicy,
    progress: Option<ProgressListener>,
    on_error: Option<ErrorCallback>,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1,
            limit: None,
            flush: FlushPolicy::AtEnd,
            progress: None,
            on_error: None,
        }
    }
}

impl fmt::Debug for PumpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PumpConfig")
            .field("buffer_size", &self.buffer_size)
            .field("limit", &self.limit)
            .field("flush", &self.flush)
            .field("progress", &self.progress.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl PumpConfig {
    /// Defaults: 1-byte chunks, no limit, flush at end.
    pub fn new() -> Self {
        Self::default()
    }

    /// Chunk size in bytes. Zero is treated as one.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }

    /// Copy exactly `limit` bytes; fewer is a [`TernError::PrematureEof`].
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the flush policy.
    pub fn with_flush(mut self, flush: FlushPolicy) -> Self {
        self.flush = flush;
        self
    }

    /// Sets the progress listener.
    pub fn with_progress<F>(mut self, listener: F) -> Self
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(listener));
        self
    }

    /// Sets the error callback.
    pub fn with_error_callback<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&TernError) + Send + 'static,
    {
        self.on_error = Some(Box::new(callback));
        self
    }

    /// Chunk size in bytes.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Byte limit, if any.
    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    /// Flush policy.
    pub fn flush(&self) -> FlushPolicy {
        self.flush
    }
}

/// Copies `source` into `sink` and returns the number of bytes copied.
///
/// The sink is flushed before a successful return. On failure the error
/// callback, if any, receives the error before it is returned.
pub async fn run<R, W>(source: &mut R, sink: &mut W, config: PumpConfig) -> TernResult<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let PumpConfig {
        buffer_size,
        limit,
        flush,
        progress,
        on_error,
    } = config;
    let chunks = Chunks {
        buffer_size,
        limit,
        flush,
        progress,
    };
    match chunks.copy(source, sink).await {
        Ok(copied) => Ok(copied),
        Err(e) => {
            error!(error = %e, "Stream pump failed");
            if let Some(callback) = on_error {
                callback(&e);
            }
            Err(e)
        }
    }
}

/// The part of a [`PumpConfig`] the copy loop reads. Keeping the error
/// callback out of it lets the loop be borrowed across awaits in a `Send` task.
struct Chunks {
    buffer_size: usize,
    limit: Option<u64>,
    flush: FlushPolicy,
    progress: Option<ProgressListener>,
}

impl Chunks {
    async fn copy<R, W>(&self, source: &mut R, sink: &mut W) -> TernResult<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut buf = vec![0u8; self.buffer_size];
        let mut count: u64 = 0;
        let mut hit_eof = false;
        let started = Instant::now();

        loop {
            let want = match self.limit {
                Some(limit) if count >= limit => break,
                Some(limit) => buf.len().min((limit - count).min(usize::MAX as u64) as usize),
                None => buf.len(),
            };
            let read = source.read(&mut buf[..want]).await?;
            if read == 0 {
                hit_eof = true;
                break;
            }
            sink.write_all(&buf[..read]).await?;
            count += read as u64;
            if self.flush == FlushPolicy::Eager {
                sink.flush().await?;
            }
            if let Some(progress) = &self.progress {
                progress(count);
            }
        }

        if self.flush == FlushPolicy::AtEnd {
            sink.flush().await?;
        }

        let seconds = started.elapsed().as_secs_f64();
        let kib = count as f64 / 1024.0;
        info!(
            "{:.3} KiB transferred in {:.3} seconds ({:.3} KiB/s)",
            kib,
            seconds,
            kib / seconds.max(0.001)
        );

        match self.limit {
            Some(expected) if hit_eof && count < expected => Err(TernError::PrematureEof {
                copied: count,
                expected,
            }),
            _ => Ok(count),
        }
    }
}

/// Runs a pump as a background task.
pub fn spawn<R, W>(mut source: R, mut sink: W, config: PumpConfig) -> JoinHandle<TernResult<u64>>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        debug!("Stream pump started");
        let result = run(&mut source, &mut sink, config).await;
        if let Ok(copied) = &result {
            debug!(copied, "Stream pump reached end of input");
        }
        result
    })
}

/// Error callback that stops the given tasks, typically the other
/// direction of a relay.
pub fn close_on_error<I>(targets: I) -> impl FnOnce(&TernError) + Send + 'static
where
    I: IntoIterator<Item = AbortHandle>,
{
    let targets: Vec<AbortHandle> = targets.into_iter().collect();
    move |e: &TernError| {
        debug!(error = %e, count = targets.len(), "Closing relay peers after pump error");
        for target in targets {
            target.abort();
        }
    }
}

/// Reads `source` to the end into a string. Invalid UTF-8 sequences become
/// U+FFFD; only I/O errors fail.
pub async fn copy_to_string<R>(source: &mut R) -> TernResult<String>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut bytes = Vec::new();
    source.read_to_end(&mut bytes).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::task::{Context, Poll};

    /// Sink that counts flushes.
    #[derive(Default)]
    struct Recorder {
        data: Vec<u8>,
        flushes: usize,
    }

    impl AsyncWrite for Recorder {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.get_mut().data.extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.get_mut().flushes += 1;
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Sink that fails every write.
    struct Broken;

    impl AsyncWrite for Broken {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn payload(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_copies_whole_source_without_limit() {
        let data = payload(1000);
        let mut sink = Recorder::default();
        let copied = run(&mut data.as_slice(), &mut sink, PumpConfig::new().with_buffer_size(64))
            .await
            .unwrap();
        assert_eq!(copied, 1000);
        assert_eq!(sink.data, data);
        assert_eq!(sink.flushes, 1);
    }

    #[tokio::test]
    async fn test_limit_below_source_length() {
        let data = payload(100);
        let mut source = data.as_slice();
        let mut sink = Recorder::default();
        let copied = run(&mut source, &mut sink, PumpConfig::new().with_buffer_size(7).with_limit(99))
            .await
            .unwrap();
        assert_eq!(copied, 99);
        assert_eq!(sink.data, &data[..99]);
        assert_eq!(sink.flushes, 1);
        // The remaining byte is left unread.
        assert_eq!(source, &data[99..]);
    }

    #[tokio::test]
    async fn test_limit_equal_to_source_length() {
        let data = payload(100);
        let mut sink = Recorder::default();
        let copied = run(&mut data.as_slice(), &mut sink, PumpConfig::new().with_buffer_size(10).with_limit(100))
            .await
            .unwrap();
        assert_eq!(copied, 100);
    }

    #[tokio::test]
    async fn test_limit_beyond_source_is_premature_eof() {
        let data = payload(100);
        let mut sink = Recorder::default();
        let result = run(&mut data.as_slice(), &mut sink, PumpConfig::new().with_buffer_size(16).with_limit(101)).await;
        match result {
            Err(TernError::PrematureEof { copied, expected }) => {
                assert_eq!(copied, 100);
                assert_eq!(expected, 101);
            }
            other => panic!("expected premature EOF, got {:?}", other),
        }
        assert_eq!(sink.data, data);
    }

    #[tokio::test]
    async fn test_default_buffer_is_one_byte() {
        let config = PumpConfig::default();
        assert_eq!(config.buffer_size(), 1);
        assert_eq!(config.flush(), FlushPolicy::AtEnd);
        assert_eq!(config.limit(), None);
        assert_eq!(PumpConfig::new().with_buffer_size(0).buffer_size(), 1);

        let seen = Arc::new(AtomicUsize::new(0));
        let calls = seen.clone();
        let mut sink = Recorder::default();
        run(
            &mut &b"abc"[..],
            &mut sink,
            config.with_progress(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_ends_at_total() {
        let data = payload(1000);
        let counts = Arc::new(Mutex::new(Vec::new()));
        let sink_counts = counts.clone();
        let config = PumpConfig::new()
            .with_buffer_size(33)
            .with_progress(move |n| sink_counts.lock().unwrap().push(n));

        let copied = run(&mut data.as_slice(), &mut Recorder::default(), config)
            .await
            .unwrap();

        let counts = counts.lock().unwrap();
        assert!(!counts.is_empty());
        assert!(counts.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*counts.last().unwrap(), copied);
    }

    #[tokio::test]
    async fn test_eager_flush_after_every_chunk() {
        let data = payload(40);
        let mut sink = Recorder::default();
        let config = PumpConfig::new()
            .with_buffer_size(10)
            .with_flush(FlushPolicy::Eager);
        run(&mut data.as_slice(), &mut sink, config).await.unwrap();
        assert_eq!(sink.flushes, 4);
    }

    #[tokio::test]
    async fn test_error_callback_fires_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let config = PumpConfig::new()
            .with_buffer_size(8)
            .with_error_callback(move |e| {
                assert!(matches!(e, TernError::Io(_)));
                seen.fetch_add(1, Ordering::SeqCst);
            });

        let result = run(&mut &payload(64)[..], &mut Broken, config).await;
        assert!(matches!(result, Err(TernError::Io(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_error_callback_not_called_on_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let config = PumpConfig::new().with_error_callback(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        run(&mut &b"ok"[..], &mut Recorder::default(), config).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_spawn_over_duplex() {
        let (mut client, server) = tokio::io::duplex(64);
        let (server_read, _server_write) = tokio::io::split(server);
        let data = payload(5000);

        let pump = spawn(server_read, Vec::new(), PumpConfig::new().with_buffer_size(512));

        client.write_all(&data).await.unwrap();
        client.shutdown().await.unwrap();
        assert_eq!(pump.await.unwrap().unwrap(), 5000);
    }

    #[tokio::test]
    async fn test_run_with_error_callback_in_spawned_task() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let handle = tokio::spawn(async move {
            let config = PumpConfig::new()
                .with_buffer_size(4)
                .with_progress(|_| {})
                .with_error_callback(move |_| {
                    seen.fetch_add(1, Ordering::SeqCst);
                });
            run(&mut &payload(16)[..], &mut Broken, config).await
        });
        assert!(matches!(handle.await.unwrap(), Err(TernError::Io(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let (mut writer, reader) = tokio::io::duplex(64);
        let pump = spawn(
            reader,
            Recorder::default(),
            PumpConfig::new().with_error_callback(|_| {}),
        );
        writer.write_all(b"abc").await.unwrap();
        drop(writer);
        assert_eq!(pump.await.unwrap().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_close_on_error_aborts_peer() {
        let peer = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        });
        let config = PumpConfig::new().with_error_callback(close_on_error([peer.abort_handle()]));
        let _ = run(&mut &b"x"[..], &mut Broken, config).await;
        assert!(peer.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_copy_to_string() {
        let text = copy_to_string(&mut &b"line one\nline two\n"[..]).await.unwrap();
        assert_eq!(text, "line one\nline two\n");

        let lossy = copy_to_string(&mut &[b'o', 0xff, b'k'][..]).await.unwrap();
        assert_eq!(lossy, "o\u{fffd}k");
    }
}
