//! SSH channel handles.
//!
//! A [`Channel`] is one logical stream over a connection. It can be used
//! through its own async methods or as a tokio `AsyncRead + AsyncWrite`
//! byte stream, and can be split into independent read and write halves.

use crate::ssh::connection::{ChannelRequestType, ChannelType, EXTENDED_DATA_STDERR};
use crate::ssh::forwarding::Parameters;
use crate::ssh::multiplexer::Shared;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{ready, Context, Poll};
use tern_platform::{TernError, TernResult};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

/// How a remote command finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    /// `exit-status` with the process exit code
    Code(u32),
    /// `exit-signal`
    Signal {
        /// Signal name without the "SIG" prefix
        name: String,
        /// Whether a core was dumped
        core_dumped: bool,
        /// Error message from the server
        message: String,
    },
}

impl ExitStatus {
    /// True for exit code 0.
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Code(0))
    }
}

/// A chunk from one of the channel's two inbound streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOutput {
    /// Regular channel data
    Stdout(Vec<u8>),
    /// Extended data of type 1
    Stderr(Vec<u8>),
}

/// Releases the channel when both halves are gone.
struct ChannelRef {
    id: u32,
    shared: Arc<Shared>,
}

impl Drop for ChannelRef {
    fn drop(&mut self) {
        self.shared.release(self.id);
    }
}

type Inbound = mpsc::UnboundedReceiver<TernResult<Vec<u8>>>;
type PendingWrite = Pin<Box<dyn Future<Output = TernResult<usize>> + Send>>;
type PendingEof = Pin<Box<dyn Future<Output = TernResult<()>> + Send>>;

fn to_io(err: TernError) -> io::Error {
    let kind = match &err {
        TernError::Timeout(_) => io::ErrorKind::TimedOut,
        TernError::ChannelClosed(_) => io::ErrorKind::BrokenPipe,
        TernError::TransportClosed(_) => io::ErrorKind::ConnectionAborted,
        TernError::Io(e) => e.kind(),
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, err.to_string())
}

/// Receiving half of a channel.
pub struct ChannelReader {
    link: Arc<ChannelRef>,
    data: Inbound,
    stderr: Inbound,
    leftover: Vec<u8>,
    offset: usize,
}

impl ChannelReader {
    /// Local channel id.
    pub fn id(&self) -> u32 {
        self.link.id
    }

    /// Next chunk of channel data; `None` after the peer's EOF or CLOSE.
    pub async fn read(&mut self) -> TernResult<Option<Vec<u8>>> {
        if self.offset < self.leftover.len() {
            let rest = self.leftover.split_off(self.offset);
            self.leftover.clear();
            self.offset = 0;
            return Ok(Some(rest));
        }
        self.next(false).await
    }

    /// Next chunk of extended data (stderr).
    pub async fn read_stderr(&mut self) -> TernResult<Option<Vec<u8>>> {
        self.next(true).await
    }

    async fn next(&mut self, stderr: bool) -> TernResult<Option<Vec<u8>>> {
        let queue = if stderr { &mut self.stderr } else { &mut self.data };
        match queue.recv().await {
            Some(Ok(chunk)) => {
                self.link.shared.consume(self.link.id, chunk.len());
                Ok(Some(chunk))
            }
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// Next chunk from either stream; `None` once both have ended.
    pub async fn read_either(&mut self) -> TernResult<Option<ChannelOutput>> {
        if self.offset < self.leftover.len() {
            return Ok(self.read().await?.map(ChannelOutput::Stdout));
        }
        let mut data_open = true;
        let mut stderr_open = true;
        while data_open || stderr_open {
            let (item, stderr) = tokio::select! {
                biased;
                item = self.data.recv(), if data_open => (item, false),
                item = self.stderr.recv(), if stderr_open => (item, true),
            };
            match item {
                Some(Ok(chunk)) => {
                    self.link.shared.consume(self.link.id, chunk.len());
                    return Ok(Some(if stderr {
                        ChannelOutput::Stderr(chunk)
                    } else {
                        ChannelOutput::Stdout(chunk)
                    }));
                }
                Some(Err(e)) => return Err(e),
                None if stderr => stderr_open = false,
                None => data_open = false,
            }
        }
        Ok(None)
    }

    /// Reads until EOF.
    pub async fn read_to_end(&mut self) -> TernResult<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}

impl AsyncRead for ChannelReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.offset >= this.leftover.len() {
            match this.data.poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(to_io(e))),
                Poll::Ready(Some(Ok(chunk))) => {
                    this.link.shared.consume(this.link.id, chunk.len());
                    this.leftover = chunk;
                    this.offset = 0;
                }
            }
        }
        let available = &this.leftover[this.offset..];
        let n = available.len().min(buf.remaining());
        buf.put_slice(&available[..n]);
        this.offset += n;
        Poll::Ready(Ok(()))
    }
}

/// Sending half of a channel.
pub struct ChannelWriter {
    link: Arc<ChannelRef>,
    pending: Option<PendingWrite>,
    shutdown: Option<PendingEof>,
}

impl ChannelWriter {
    /// Local channel id.
    pub fn id(&self) -> u32 {
        self.link.id
    }

    /// Sends all of `data`, waiting for window space as needed.
    pub async fn write(&mut self, data: &[u8]) -> TernResult<()> {
        self.link.shared.write(self.link.id, data, None).await
    }

    /// Sends `data` as extended data (stderr).
    pub async fn write_stderr(&mut self, data: &[u8]) -> TernResult<()> {
        self.link
            .shared
            .write(self.link.id, data, Some(EXTENDED_DATA_STDERR))
            .await
    }

    /// Sends EOF. Further writes fail.
    pub async fn eof(&mut self) -> TernResult<()> {
        self.link.shared.send_eof(self.link.id).await
    }

    /// Resolves once the peer has closed the channel or the connection is
    /// gone. Does not borrow the writer, so it can race a pending write.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let link = self.link.clone();
        async move { link.shared.closed(link.id).await }
    }
}

impl AsyncWrite for ChannelWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let link = this.link.clone();
        let fut = this.pending.get_or_insert_with(|| -> PendingWrite {
            let data = buf.to_vec();
            Box::pin(async move {
                link.shared.write(link.id, &data, None).await?;
                Ok(data.len())
            })
        });
        match fut.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                this.pending = None;
                Poll::Ready(result.map_err(to_io))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(fut) = this.pending.as_mut() {
            let result = ready!(fut.as_mut().poll(cx));
            this.pending = None;
            result.map_err(to_io)?;
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.as_mut().poll_flush(cx))?;
        let this = self.get_mut();
        let link = this.link.clone();
        let fut = this
            .shutdown
            .get_or_insert_with(|| -> PendingEof {
                Box::pin(async move { link.shared.send_eof(link.id).await })
            });
        let result = ready!(fut.as_mut().poll(cx));
        this.shutdown = None;
        Poll::Ready(result.map_err(to_io))
    }
}

/// An open channel.
pub struct Channel {
    reader: ChannelReader,
    writer: ChannelWriter,
    channel_type: ChannelType,
    exit: Arc<OnceLock<ExitStatus>>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id())
            .field("type", &self.channel_type.name())
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(
        id: u32,
        channel_type: ChannelType,
        shared: Arc<Shared>,
        data: Inbound,
        stderr: Inbound,
        exit: Arc<OnceLock<ExitStatus>>,
    ) -> Self {
        let link = Arc::new(ChannelRef { id, shared });
        Self {
            reader: ChannelReader {
                link: link.clone(),
                data,
                stderr,
                leftover: Vec::new(),
                offset: 0,
            },
            writer: ChannelWriter {
                link,
                pending: None,
                shutdown: None,
            },
            channel_type,
            exit,
        }
    }

    /// Local channel id.
    pub fn id(&self) -> u32 {
        self.reader.id()
    }

    /// The type this channel was opened with.
    pub fn channel_type(&self) -> &ChannelType {
        &self.channel_type
    }

    /// Endpoint identity for `direct-tcpip` and `forwarded-tcpip` channels.
    pub fn parameters(&self) -> Option<&Parameters> {
        self.channel_type.parameters()
    }

    /// See [`ChannelReader::read`].
    pub async fn read(&mut self) -> TernResult<Option<Vec<u8>>> {
        self.reader.read().await
    }

    /// See [`ChannelReader::read_stderr`].
    pub async fn read_stderr(&mut self) -> TernResult<Option<Vec<u8>>> {
        self.reader.read_stderr().await
    }

    /// See [`ChannelReader::read_either`].
    pub async fn read_either(&mut self) -> TernResult<Option<ChannelOutput>> {
        self.reader.read_either().await
    }

    /// Reads until EOF.
    pub async fn read_to_end(&mut self) -> TernResult<Vec<u8>> {
        self.reader.read_to_end().await
    }

    /// See [`ChannelWriter::write`].
    pub async fn write(&mut self, data: &[u8]) -> TernResult<()> {
        self.writer.write(data).await
    }

    /// Sends EOF.
    pub async fn eof(&mut self) -> TernResult<()> {
        self.writer.eof().await
    }

    /// Sends a channel request and waits for the reply when `want_reply` is set.
    ///
    /// Returns whether the peer accepted it.
    pub async fn request(&mut self, request: ChannelRequestType, want_reply: bool) -> TernResult<bool> {
        self.reader
            .link
            .shared
            .request(self.id(), request, want_reply)
            .await
    }

    async fn required(&mut self, request: ChannelRequestType) -> TernResult<()> {
        let name = request.name().to_string();
        if self.request(request, true).await? {
            Ok(())
        } else {
            Err(TernError::RequestFailed(format!(
                "Channel {} request {} refused",
                self.id(),
                name
            )))
        }
    }

    /// Runs `command` on the server.
    pub async fn exec(&mut self, command: &str) -> TernResult<()> {
        self.required(ChannelRequestType::Exec {
            command: command.to_string(),
        })
        .await
    }

    /// Starts the user's login shell.
    pub async fn shell(&mut self) -> TernResult<()> {
        self.required(ChannelRequestType::Shell).await
    }

    /// Starts a subsystem such as `sftp`.
    pub async fn subsystem(&mut self, name: &str) -> TernResult<()> {
        self.required(ChannelRequestType::Subsystem {
            name: name.to_string(),
        })
        .await
    }

    /// Passes an environment variable. Servers commonly refuse these.
    pub async fn env(&mut self, name: &str, value: &str) -> TernResult<()> {
        self.required(ChannelRequestType::Env {
            name: name.to_string(),
            value: value.to_string(),
        })
        .await
    }

    /// Exit status reported by the server, once it has arrived.
    pub fn exit_status(&self) -> Option<&ExitStatus> {
        self.exit.get()
    }

    /// Closes the channel and waits for the peer to confirm.
    pub async fn close(self) -> TernResult<()> {
        let id = self.id();
        self.reader.link.shared.close(id).await
    }

    /// Closes the channel and returns the exit status the server reported
    /// before its CLOSE.
    pub async fn finish(self) -> TernResult<Option<ExitStatus>> {
        let exit = self.exit.clone();
        self.close().await?;
        Ok(exit.get().cloned())
    }

    /// Splits into independently owned halves.
    ///
    /// The channel is released once both halves are dropped.
    pub fn into_split(self) -> (ChannelReader, ChannelWriter) {
        (self.reader, self.writer)
    }
}

impl AsyncRead for Channel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for Channel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().writer).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_shutdown(cx)
    }
}
