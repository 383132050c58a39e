//! Local port forwarding (`direct-tcpip`).
//!
//! A listener on this host accepts TCP connections; each one becomes a
//! `direct-tcpip` channel whose [`Parameters`] name the accepted peer and
//! the fixed target, and is relayed until either side finishes.

use super::parameters::Parameters;
use super::types::ForwardAddr;
use crate::ssh::multiplexer::Multiplexer;
use std::net::SocketAddr;
use tern_platform::TernResult;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn, Instrument};

/// A bound listener forwarding to one remote target.
///
/// Created by [`SshClient::local_forward()`](crate::ssh::client::SshClient::local_forward).
#[derive(Debug)]
pub struct LocalForward {
    listener: TcpListener,
    requested: ForwardAddr,
    target: ForwardAddr,
    mux: Multiplexer,
}

impl LocalForward {
    /// Binds `local_addr` and prepares to forward to `target`.
    pub async fn bind(mux: Multiplexer, local_addr: ForwardAddr, target: ForwardAddr) -> TernResult<Self> {
        let listener = TcpListener::bind((local_addr.host.as_str(), local_addr.port)).await?;
        Ok(Self {
            listener,
            requested: local_addr,
            target,
            mux,
        })
    }

    /// Address as passed to [`bind`](Self::bind).
    pub fn local_addr(&self) -> &ForwardAddr {
        &self.requested
    }

    /// Address the listener actually holds; differs from
    /// [`local_addr`](Self::local_addr) when port 0 was requested.
    pub fn bound_addr(&self) -> TernResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Remote end every connection is forwarded to.
    pub fn target_addr(&self) -> &ForwardAddr {
        &self.target
    }

    fn parameters_for(&self, peer: SocketAddr) -> Parameters {
        Parameters::new(
            peer.ip().to_string(),
            peer.port(),
            self.target.host.clone(),
            self.target.port,
        )
    }

    /// Accepts until the listener fails or the future is dropped.
    ///
    /// Connections are relayed on their own tasks; one failing leaves the
    /// others and the listener running.
    pub async fn run(self) -> TernResult<()> {
        info!(listen = %self.requested, target = %self.target, "Local forward started");

        let mut accepted: u64 = 0;
        loop {
            let (stream, peer) = self.listener.accept().await?;
            accepted += 1;
            let params = self.parameters_for(peer);
            let mux = self.mux.clone();
            let span = tracing::debug_span!("local_forward", conn = accepted, %peer);
            tokio::spawn(forward_one(stream, params, mux).instrument(span));
        }
    }
}

async fn forward_one(stream: TcpStream, params: Parameters, mux: Multiplexer) {
    debug!(%params, "Opening direct-tcpip");
    let result = match mux.open_direct_tcpip(params.clone()).await {
        Ok(channel) => super::relay(stream, channel).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => debug!(%params, "Forwarded connection closed"),
        Err(e) => warn!(%params, error = %e, "Forwarded connection failed"),
    }
}
