//! SSH Port Forwarding
//!
//! - **Local Forward**: accept locally, open `direct-tcpip` to a target behind the server
//! - **Remote Forward**: ask the server to listen (`tcpip-forward`) and connect
//!   each `forwarded-tcpip` channel to a local target
//!
//! Every forwarded connection is identified by its [`Parameters`] and relayed
//! by two stream pumps, one per direction.
//!
//! # Local Forward Example
//!
//! ```rust,no_run
//! # async fn demo(client: &tern_proto::ssh::client::SshClient) -> tern_platform::TernResult<()> {
//! // Forward localhost:8080 to database.internal:3306
//! let forward = client.local_forward("localhost:8080", "database.internal:3306").await?;
//! forward.run().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Remote Forward Example
//!
//! ```rust,no_run
//! # async fn demo(client: &tern_proto::ssh::client::SshClient) -> tern_platform::TernResult<()> {
//! // Forward remote:8080 to localhost:3000
//! let forward = client.remote_forward("0.0.0.0:8080", "localhost:3000").await?;
//! forward.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod local;
pub mod parameters;
pub mod remote;
pub mod types;

pub use local::LocalForward;
pub use parameters::Parameters;
pub use remote::RemoteForward;
pub use types::{parse_forward_addr, ForwardAddr};

use crate::ssh::channel::Channel;
use crate::ssh::stream_pump::{self, FlushPolicy, PumpConfig};
use tern_platform::{TernError, TernResult};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinError;
use tracing::debug;

/// Chunk size for both relay directions.
pub const RELAY_BUFFER_SIZE: usize = 32 * 1024;

fn joined(result: Result<TernResult<u64>, JoinError>) -> TernResult<u64> {
    match result {
        Ok(copied) => copied,
        // Stopped because the other direction failed.
        Err(e) if e.is_cancelled() => Ok(0),
        Err(e) => Err(TernError::Protocol(format!("Relay task panicked: {}", e))),
    }
}

/// Relays bytes between a TCP connection and a channel until both
/// directions are done.
///
/// EOF in one direction is passed on as a half-close (channel EOF or TCP
/// write shutdown) and the other direction keeps running. A failure in
/// either direction stops the other one. The local direction also ends when
/// the peer closes the channel.
pub(crate) async fn relay(stream: TcpStream, channel: Channel) -> TernResult<()> {
    let id = channel.id();
    let (mut tcp_read, mut tcp_write) = stream.into_split();
    let (mut chan_read, mut chan_write) = channel.into_split();

    let downstream = tokio::spawn(async move {
        let config = PumpConfig::new()
            .with_buffer_size(RELAY_BUFFER_SIZE)
            .with_flush(FlushPolicy::Eager);
        let copied = stream_pump::run(&mut chan_read, &mut tcp_write, config).await?;
        let _ = tcp_write.shutdown().await;
        Ok::<u64, TernError>(copied)
    });

    let stop_downstream = stream_pump::close_on_error([downstream.abort_handle()]);
    let upstream = tokio::spawn(async move {
        let config = PumpConfig::new()
            .with_buffer_size(RELAY_BUFFER_SIZE)
            .with_error_callback(stop_downstream);
        let peer_closed = chan_write.closed();
        let copied = tokio::select! {
            copied = stream_pump::run(&mut tcp_read, &mut chan_write, config) => copied?,
            () = peer_closed => {
                debug!(channel = id, "Peer closed channel before local EOF");
                return Ok::<u64, TernError>(0);
            }
        };
        match chan_write.eof().await {
            Ok(()) | Err(TernError::ChannelClosed(_)) => Ok::<u64, TernError>(copied),
            Err(e) => Err(e),
        }
    });

    let received = joined(downstream.await);
    if received.is_err() {
        upstream.abort();
    }
    let sent = joined(upstream.await);

    debug!(
        channel = id,
        sent = *sent.as_ref().unwrap_or(&0),
        received = *received.as_ref().unwrap_or(&0),
        "Relay finished"
    );
    sent?;
    received?;
    Ok(())
}
