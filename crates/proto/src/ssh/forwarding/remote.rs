//! Remote port forwarding (tcpip-forward).
//!
//! The server listens on a bind address and opens a `forwarded-tcpip`
//! channel for every connection it accepts. The multiplexer matches those
//! channels to this forward by bind host and port; each one is connected
//! to the local target and relayed.

use super::types::ForwardAddr;
use crate::ssh::channel::Channel;
use crate::ssh::multiplexer::Multiplexer;
use tern_platform::TernResult;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Remote port forwarding handle.
///
/// Created by [`SshClient::remote_forward()`](crate::ssh::client::SshClient::remote_forward).
#[derive(Debug)]
pub struct RemoteForward {
    /// Address the server is listening on (actual port when 0 was requested)
    bind_addr: ForwardAddr,
    /// Local target address to forward to
    local_target: ForwardAddr,
    incoming: mpsc::UnboundedReceiver<Channel>,
    mux: Multiplexer,
}

impl RemoteForward {
    /// Sends `tcpip-forward` and registers the listener.
    ///
    /// # Errors
    ///
    /// [`TernError::RequestFailed`](tern_platform::TernError::RequestFailed)
    /// if the server refuses to listen.
    pub async fn establish(
        mux: Multiplexer,
        bind_addr: ForwardAddr,
        local_target: ForwardAddr,
    ) -> TernResult<Self> {
        let (port, incoming) = mux.tcpip_forward(&bind_addr.host, bind_addr.port).await?;
        Ok(Self {
            bind_addr: ForwardAddr::new(bind_addr.host, port),
            local_target,
            incoming,
            mux,
        })
    }

    /// Returns the remote bind address.
    pub fn bind_addr(&self) -> &ForwardAddr {
        &self.bind_addr
    }

    /// Returns the local target address.
    pub fn local_target(&self) -> &ForwardAddr {
        &self.local_target
    }

    /// Next forwarded channel, for callers that want to handle them directly.
    ///
    /// `None` once the connection is gone.
    pub async fn accept(&mut self) -> Option<Channel> {
        self.incoming.recv().await
    }

    /// Connects every forwarded channel to the local target until the
    /// connection closes.
    pub async fn run(mut self) -> TernResult<()> {
        info!("Remote forward active: {} -> {}", self.bind_addr, self.local_target);

        while let Some(channel) = self.incoming.recv().await {
            let target = self.local_target.clone();
            tokio::spawn(async move {
                let id = channel.id();
                if let Err(e) = Self::handle_channel(channel, &target).await {
                    warn!(channel = id, "Remote forward to {} failed: {}", target, e);
                }
            });
        }

        debug!("Remote forward {} stopped", self.bind_addr);
        Ok(())
    }

    async fn handle_channel(channel: Channel, target: &ForwardAddr) -> TernResult<()> {
        if let Some(params) = channel.parameters() {
            debug!(channel = channel.id(), "Forwarded connection {}", params);
        }
        let stream = match TcpStream::connect((target.host.as_str(), target.port)).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = channel.close().await;
                return Err(e.into());
            }
        };
        super::relay(stream, channel).await
    }

    /// Asks the server to stop listening.
    pub async fn cancel(self) -> TernResult<()> {
        self.mux
            .cancel_tcpip_forward(&self.bind_addr.host, self.bind_addr.port)
            .await
    }
}
