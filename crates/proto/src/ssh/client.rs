//! SSH Client implementation.
//!
//! Ties the layers together: TCP connect, transport handshake, the
//! `ssh-userauth` service hand-off to an [`Authenticator`], then channels
//! and forwarding over the [`Multiplexer`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tern_proto::ssh::client::{NoneAuthenticator, SshClient};
//! use tern_proto::ssh::hostkey::PinnedHostKeys;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let verifier = Arc::new(PinnedHostKeys::new([
//!     "SHA256:47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU",
//! ]));
//! let mut client = SshClient::connect("127.0.0.1:22", verifier).await?;
//! client.authenticate(&mut NoneAuthenticator::new("deploy")).await?;
//!
//! let output = client.exec("uname -a").await?;
//! println!("{}", String::from_utf8_lossy(&output.stdout));
//! client.disconnect().await?;
//! # Ok(())
//! # }
//! ```

use crate::ssh::channel::{Channel, ChannelOutput, ExitStatus};
use crate::ssh::connection::{DEFAULT_MAX_PACKET_SIZE, DEFAULT_WINDOW_SIZE};
use crate::ssh::connection_mgr::{PacketTransport, SshConnection};
use crate::ssh::forwarding::{parse_forward_addr, LocalForward, Parameters, RemoteForward};
use crate::ssh::hostkey::{HostKeyVerifier, PublicHostKey};
use crate::ssh::kex::NegotiatedAlgorithms;
use crate::ssh::message::{disconnect, MessageType};
use crate::ssh::multiplexer::{Multiplexer, MultiplexerConfig};
use crate::ssh::session::Keepalive;
use crate::ssh::transport::{State, TransportConfig};
use crate::ssh::version::Version;
use crate::ssh::wire::{read_string, write_string};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tern_platform::{TernError, TernResult};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Service name requested before user authentication.
pub const USERAUTH_SERVICE: &str = "ssh-userauth";

/// Runs user authentication (RFC 4252) over an established transport.
///
/// The client requests the `ssh-userauth` service and then hands the
/// transport over; the authenticator owns every message until it returns.
/// `session_id` is the exchange hash to sign for public key methods.
#[async_trait]
pub trait Authenticator: Send {
    /// Authenticates, returning once the server sent USERAUTH_SUCCESS.
    async fn authenticate(
        &mut self,
        transport: &dyn PacketTransport,
        session_id: &[u8],
    ) -> TernResult<()>;
}

/// The `none` method (RFC 4252 Section 5.2).
///
/// Succeeds only against servers that let the user in without credentials,
/// such as test servers and some embedded devices.
#[derive(Debug, Clone)]
pub struct NoneAuthenticator {
    username: String,
}

impl NoneAuthenticator {
    /// Authenticates as `username`.
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }
}

const USERAUTH_REQUEST: u8 = 50;
const USERAUTH_FAILURE: u8 = 51;
const USERAUTH_SUCCESS: u8 = 52;
const USERAUTH_BANNER: u8 = 53;

#[async_trait]
impl Authenticator for NoneAuthenticator {
    async fn authenticate(
        &mut self,
        transport: &dyn PacketTransport,
        _session_id: &[u8],
    ) -> TernResult<()> {
        let mut request = BytesMut::new();
        request.put_u8(USERAUTH_REQUEST);
        write_string(&mut request, &self.username);
        write_string(&mut request, "ssh-connection");
        write_string(&mut request, "none");
        transport.send_packet(request.to_vec()).await?;

        loop {
            let reply = transport.receive_packet().await?;
            match reply.first() {
                Some(&USERAUTH_SUCCESS) => return Ok(()),
                Some(&USERAUTH_BANNER) => continue,
                Some(&USERAUTH_FAILURE) => {
                    let mut offset = 1;
                    let methods = read_string(&reply, &mut offset).unwrap_or_default();
                    return Err(TernError::RequestFailed(format!(
                        "Authentication as {} refused; server offers: {}",
                        self.username, methods
                    )));
                }
                _ => {
                    return Err(TernError::Protocol(format!(
                        "Unexpected message {:?} during authentication",
                        reply.first()
                    )))
                }
            }
        }
    }
}

/// SSH client configuration.
#[derive(Debug, Clone)]
pub struct SshClientConfig {
    /// TCP connect timeout (default: 30 s)
    pub connect_timeout: Duration,
    /// Channel open timeout (default: 30 s)
    pub channel_open_timeout: Duration,
    /// Channel and global request reply timeout (default: 30 s)
    pub request_timeout: Duration,
    /// How long a write may wait for window space; `None` waits forever
    pub window_timeout: Option<Duration>,
    /// SSH_MSG_IGNORE heartbeat interval; `None` disables it
    pub keepalive_interval: Option<Duration>,
    /// Initial window advertised for our channels (default: 2 MiB)
    pub window_size: u32,
    /// Maximum data packet advertised for our channels (default: 32 KiB)
    pub max_packet_size: u32,
    /// Transport settings
    pub transport: TransportConfig,
}

impl Default for SshClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            channel_open_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            window_timeout: None,
            keepalive_interval: None,
            window_size: DEFAULT_WINDOW_SIZE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            transport: TransportConfig::default(),
        }
    }
}

impl SshClientConfig {
    /// Checks values that would otherwise fail later.
    pub fn validate(&self) -> TernResult<()> {
        if self.window_size == 0 || self.max_packet_size == 0 {
            return Err(TernError::Config(
                "Window size and max packet size must be non-zero".to_string(),
            ));
        }
        if self.keepalive_interval == Some(Duration::ZERO) {
            return Err(TernError::Config(
                "Keep-alive interval must be non-zero".to_string(),
            ));
        }
        self.transport.validate()
    }

    fn multiplexer_config(&self) -> MultiplexerConfig {
        MultiplexerConfig {
            window_size: self.window_size,
            max_packet_size: self.max_packet_size,
            open_timeout: self.channel_open_timeout,
            request_timeout: self.request_timeout,
            window_timeout: self.window_timeout,
            close_timeout: self.request_timeout,
        }
    }
}

/// Collected output of [`SshClient::exec`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Channel data
    pub stdout: Vec<u8>,
    /// Extended data (stderr)
    pub stderr: Vec<u8>,
    /// Exit status, if the server reported one
    pub exit_status: Option<ExitStatus>,
}

impl ExecOutput {
    /// True when the command exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_status.as_ref().is_some_and(ExitStatus::success)
    }
}

/// SSH Client.
pub struct SshClient {
    connection: Arc<SshConnection>,
    config: SshClientConfig,
    server_addr: String,
    mux: Option<Multiplexer>,
    keepalive: Option<Keepalive>,
}

impl std::fmt::Debug for SshClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshClient")
            .field("server_addr", &self.server_addr)
            .field("authenticated", &self.is_authenticated())
            .field("state", &self.state())
            .finish()
    }
}

impl SshClient {
    /// Connects to an SSH server with default settings.
    pub async fn connect(addr: &str, verifier: Arc<dyn HostKeyVerifier>) -> TernResult<Self> {
        Self::connect_with_config(addr, SshClientConfig::default(), verifier).await
    }

    /// Connects with custom configuration.
    ///
    /// Performs:
    /// 1. TCP connection (bounded by `connect_timeout`)
    /// 2. Version exchange
    /// 3. Key exchange, with `verifier` deciding on the host key
    pub async fn connect_with_config(
        addr: &str,
        config: SshClientConfig,
        verifier: Arc<dyn HostKeyVerifier>,
    ) -> TernResult<Self> {
        config.validate()?;
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                TernError::Timeout(format!(
                    "Connecting to {} took longer than {:?}",
                    addr, config.connect_timeout
                ))
            })??;
        stream.set_nodelay(true)?;
        debug!("TCP connection to {} established", addr);

        Self::connect_stream(stream, addr, config, verifier).await
    }

    /// Runs the handshake over an already connected stream.
    ///
    /// `identity` is passed to the host key verifier.
    pub async fn connect_stream<S>(
        stream: S,
        identity: &str,
        config: SshClientConfig,
        verifier: Arc<dyn HostKeyVerifier>,
    ) -> TernResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        config.validate()?;
        let connection = SshConnection::handshake(stream, &config.transport, verifier, identity).await?;
        Ok(Self {
            connection: Arc::new(connection),
            config,
            server_addr: identity.to_string(),
            mux: None,
            keepalive: None,
        })
    }

    /// Requests `ssh-userauth`, runs `authenticator`, then starts the
    /// channel layer.
    pub async fn authenticate(&mut self, authenticator: &mut dyn Authenticator) -> TernResult<()> {
        if self.mux.is_some() {
            return Err(TernError::Protocol("Already authenticated".to_string()));
        }

        let mut request = BytesMut::new();
        request.put_u8(MessageType::ServiceRequest as u8);
        write_string(&mut request, USERAUTH_SERVICE);
        self.connection.send_packet(request.to_vec()).await?;

        let reply = self.connection.receive_packet().await?;
        if reply.first() != Some(&(MessageType::ServiceAccept as u8)) {
            return Err(TernError::Protocol(format!(
                "Expected SERVICE_ACCEPT, got message {:?}",
                reply.first()
            )));
        }
        let mut offset = 1;
        let service = read_string(&reply, &mut offset)?;
        if service != USERAUTH_SERVICE {
            return Err(TernError::Protocol(format!(
                "Server accepted service {} instead of {}",
                service, USERAUTH_SERVICE
            )));
        }

        let session_id = self.connection.session_id().ok_or_else(|| {
            TernError::Protocol("No session identifier after key exchange".to_string())
        })?;
        authenticator
            .authenticate(self.connection.as_ref(), &session_id)
            .await?;
        info!("Authenticated to {}", self.server_addr);

        let transport: Arc<dyn PacketTransport> = self.connection.clone();
        self.mux = Some(Multiplexer::start(
            transport.clone(),
            self.config.multiplexer_config(),
        ));
        if let Some(interval) = self.config.keepalive_interval {
            self.keepalive = Some(Keepalive::start(transport, interval));
        }
        Ok(())
    }

    fn mux(&self) -> TernResult<&Multiplexer> {
        self.mux
            .as_ref()
            .ok_or_else(|| TernError::Protocol("Channels require authentication first".to_string()))
    }

    /// Opens a `session` channel.
    pub async fn open_session(&self) -> TernResult<Channel> {
        self.mux()?.open_session().await
    }

    /// Runs `command` and collects its output and exit status.
    pub async fn exec(&self, command: &str) -> TernResult<ExecOutput> {
        let mut channel = self.open_session().await?;
        channel.exec(command).await?;
        debug!(channel = channel.id(), "Executing {}", command);

        let mut output = ExecOutput::default();
        while let Some(chunk) = channel.read_either().await? {
            match chunk {
                ChannelOutput::Stdout(data) => output.stdout.extend_from_slice(&data),
                ChannelOutput::Stderr(data) => output.stderr.extend_from_slice(&data),
            }
        }
        output.exit_status = channel.finish().await?;
        Ok(output)
    }

    /// Opens a `direct-tcpip` channel to `params.remote_*`, reporting
    /// `params.local_*` as the originator.
    pub async fn open_direct_tcpip(&self, params: Parameters) -> TernResult<Channel> {
        self.mux()?.open_direct_tcpip(params).await
    }

    /// Listens on `local` and forwards each connection to `target` through the server.
    pub async fn local_forward(&self, local: &str, target: &str) -> TernResult<LocalForward> {
        let local = parse_forward_addr(local)?;
        let target = parse_forward_addr(target)?;
        LocalForward::bind(self.mux()?.clone(), local, target).await
    }

    /// Asks the server to listen on `bind` and forwards its connections to `local_target`.
    pub async fn remote_forward(&self, bind: &str, local_target: &str) -> TernResult<RemoteForward> {
        let bind = parse_forward_addr(bind)?;
        let local_target = parse_forward_addr(local_target)?;
        RemoteForward::establish(self.mux()?.clone(), bind, local_target).await
    }

    /// Starts a key re-exchange; traffic continues while it runs.
    pub fn rekey(&self) -> TernResult<()> {
        self.connection.rekey()
    }

    /// Sends DISCONNECT (by application) and closes the connection.
    pub async fn disconnect(&mut self) -> TernResult<()> {
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.stop();
        }
        self.connection
            .close(disconnect::BY_APPLICATION, "Client disconnect")
            .await
    }

    /// Server address or identity passed at connect time.
    pub fn server_address(&self) -> &str {
        &self.server_addr
    }

    /// Server identification.
    pub fn server_version(&self) -> &Version {
        self.connection.server_version()
    }

    /// Host key accepted during the first key exchange.
    pub fn server_host_key(&self) -> Option<PublicHostKey> {
        self.connection.host_key()
    }

    /// Session identifier.
    pub fn session_id(&self) -> Option<Vec<u8>> {
        self.connection.session_id()
    }

    /// Algorithms of the latest key exchange.
    pub fn negotiated(&self) -> Option<NegotiatedAlgorithms> {
        self.connection.negotiated()
    }

    /// Completed key exchanges, the first one included.
    pub fn key_exchanges(&self) -> u32 {
        self.connection.key_exchanges()
    }

    /// Transport state.
    pub fn state(&self) -> State {
        self.connection.state()
    }

    /// Whether authentication has completed.
    pub fn is_authenticated(&self) -> bool {
        self.mux.is_some()
    }

    /// The channel multiplexer, once authenticated.
    pub fn multiplexer(&self) -> Option<&Multiplexer> {
        self.mux.as_ref()
    }

    /// The underlying transport.
    pub fn connection(&self) -> &Arc<SshConnection> {
        &self.connection
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SshClientConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.channel_open_timeout, Duration::from_secs(30));
        assert_eq!(config.window_timeout, None);
        assert_eq!(config.keepalive_interval, None);
        assert_eq!(config.window_size, 2 * 1024 * 1024);
        assert_eq!(config.max_packet_size, 32 * 1024);
        config.validate().unwrap();
    }

    #[test]
    fn test_config_validation() {
        let config = SshClientConfig {
            window_size: 0,
            ..SshClientConfig::default()
        };
        assert!(matches!(config.validate(), Err(TernError::Config(_))));

        let config = SshClientConfig {
            keepalive_interval: Some(Duration::ZERO),
            ..SshClientConfig::default()
        };
        assert!(matches!(config.validate(), Err(TernError::Config(_))));
    }

    #[test]
    fn test_multiplexer_config_follows_client_config() {
        let config = SshClientConfig {
            channel_open_timeout: Duration::from_secs(5),
            window_timeout: Some(Duration::from_secs(7)),
            window_size: 4096,
            ..SshClientConfig::default()
        };
        let mux = config.multiplexer_config();
        assert_eq!(mux.open_timeout, Duration::from_secs(5));
        assert_eq!(mux.window_timeout, Some(Duration::from_secs(7)));
        assert_eq!(mux.window_size, 4096);
    }

    #[test]
    fn test_exec_output_success() {
        let mut output = ExecOutput::default();
        assert!(!output.success());
        output.exit_status = Some(ExitStatus::Code(0));
        assert!(output.success());
        output.exit_status = Some(ExitStatus::Code(2));
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let verifier: Arc<dyn HostKeyVerifier> = Arc::new(|_: &PublicHostKey, _: &str| true);
        let result = SshClient::connect(&addr, verifier).await;
        assert!(matches!(result, Err(TernError::Io(_))));
    }
}
