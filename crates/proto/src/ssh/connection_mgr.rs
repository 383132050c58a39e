//! SSH Connection Manager.
//!
//! Runs the transport over any byte stream: version exchange, the first key
//! exchange, then framed packet I/O with transparent rekeying. The channel
//! layer talks to it through [`PacketTransport`].
//!
//! # Tasks
//!
//! A single writer task owns the write half and the outbound packet sealer.
//! Every outbound payload goes through its queue, so packets reach the wire
//! in submission order. While a key exchange is in flight the writer holds
//! back everything except transport messages and releases the backlog under
//! the new keys once our NEWKEYS is out.
//!
//! The read half is driven by whoever calls [`PacketTransport::receive_packet`]
//! (normally the channel multiplexer). Key exchange messages are consumed
//! there and never surface to the caller.

use crate::ssh::crypto::DirectionKeys;
use crate::ssh::hostkey::{HostKeyVerifier, PublicHostKey};
use crate::ssh::kex::NegotiatedAlgorithms;
use crate::ssh::message::{disconnect, is_kex_message, MessageType};
use crate::ssh::packet::{PacketOpener, PacketSealer};
use crate::ssh::transport::{KexAction, KexDriver, RekeyReason, State, TransportConfig};
use crate::ssh::version::{self, Version};
use crate::ssh::wire::{read_string, read_u32, write_string};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tern_platform::{TernError, TernResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Longest gap between checks of the rekey time threshold.
const REKEY_CHECK_PERIOD: Duration = Duration::from_secs(60);

/// Packet-level view of an established transport.
#[async_trait]
pub trait PacketTransport: Send + Sync {
    /// Queues a payload and waits until it has been written.
    async fn send_packet(&self, payload: Vec<u8>) -> TernResult<()>;

    /// Queues a payload without waiting.
    ///
    /// Used from the receive path, which must never block on the writer.
    fn queue_packet(&self, payload: Vec<u8>) -> TernResult<()>;

    /// Returns the next non-transport payload.
    async fn receive_packet(&self) -> TernResult<Vec<u8>>;

    /// Sends SSH_MSG_DISCONNECT and closes the stream.
    async fn close(&self, reason: u32, description: &str) -> TernResult<()>;

    /// Whether the transport is gone.
    fn is_closed(&self) -> bool;
}

type Ack = oneshot::Sender<TernResult<()>>;

enum Outbound {
    Packet {
        payload: Vec<u8>,
        done: Option<Ack>,
    },
    NewKeys(DirectionKeys),
    StartKex(RekeyReason),
    Disconnect {
        reason: u32,
        description: String,
        done: Option<Ack>,
    },
}

enum Event {
    Payload(Vec<u8>),
    KexComplete,
}

struct ReadSide {
    half: Box<dyn AsyncRead + Send + Unpin>,
    opener: PacketOpener,
    buf: BytesMut,
}

impl ReadSide {
    async fn read_payload(&mut self) -> TernResult<Vec<u8>> {
        loop {
            if let Some(payload) = self.opener.open(&mut self.buf)? {
                return Ok(payload);
            }
            let n = self.half.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(TernError::TransportClosed(
                    "Connection closed by peer".to_string(),
                ));
            }
        }
    }
}

/// An SSH transport over a byte stream.
pub struct SshConnection {
    outbound: mpsc::UnboundedSender<Outbound>,
    reader: tokio::sync::Mutex<ReadSide>,
    driver: Arc<Mutex<KexDriver>>,
    closed: Arc<AtomicBool>,
    server_version: Version,
    identity: String,
}

impl std::fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnection")
            .field("identity", &self.identity)
            .field("server_version", &self.server_version)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl SshConnection {
    /// Runs the version exchange and the first key exchange over `stream`.
    ///
    /// `identity` names the peer for host key verification (usually
    /// `host:port`).
    ///
    /// # Errors
    ///
    /// - [`TernError::Config`] for invalid preferences
    /// - [`TernError::NoCommonAlgorithm`] if negotiation fails
    /// - [`TernError::HostKeyVerification`] if the host key is rejected
    /// - [`TernError::KeyExchangeFailed`] for a bad exchange signature
    /// - [`TernError::TransportClosed`] if the peer goes away
    pub async fn handshake<S>(
        mut stream: S,
        config: &TransportConfig,
        verifier: Arc<dyn HostKeyVerifier>,
        identity: impl Into<String>,
    ) -> TernResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        config.validate()?;
        let identity = identity.into();

        let (server_version, server_line) = version::exchange(&mut stream, &config.version).await?;
        info!(
            peer = %identity,
            server = %server_version.software(),
            "SSH version exchange complete"
        );

        let driver = Arc::new(Mutex::new(KexDriver::new(
            config,
            config.version.to_string(),
            server_line,
            verifier,
            identity.clone(),
        )));
        let closed = Arc::new(AtomicBool::new(false));
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();

        let writer = Writer {
            half: write_half,
            sealer: PacketSealer::new(),
            driver: driver.clone(),
            closed: closed.clone(),
            held: VecDeque::new(),
            kex_pending: false,
            rekey_check: config.rekey_time_limit.min(REKEY_CHECK_PERIOD),
        };
        tokio::spawn(writer.run(rx));

        let conn = Self {
            outbound: tx,
            reader: tokio::sync::Mutex::new(ReadSide {
                half: Box::new(read_half),
                opener: PacketOpener::new(),
                buf: BytesMut::with_capacity(64 * 1024),
            }),
            driver,
            closed,
            server_version,
            identity,
        };

        conn.submit(Outbound::StartKex(RekeyReason::Requested))?;
        loop {
            match conn.next_event().await? {
                Event::KexComplete => break,
                Event::Payload(payload) => {
                    let err = TernError::Protocol(format!(
                        "Message {} before first key exchange completed",
                        payload[0]
                    ));
                    conn.abort(&err);
                    return Err(err);
                }
            }
        }

        if let Some(suite) = conn.negotiated() {
            info!(peer = %conn.identity, suite = %suite, "SSH transport established");
        }
        if let Some(session_id) = conn.session_id() {
            debug!(session_id = %hex::encode(session_id), "Session identifier fixed");
        }
        Ok(conn)
    }

    /// Server identification.
    pub fn server_version(&self) -> &Version {
        &self.server_version
    }

    /// Peer identity used for host key verification.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Current transport state.
    pub fn state(&self) -> State {
        match self.driver() {
            Ok(driver) => driver.state(),
            Err(_) => State::Closed,
        }
    }

    /// Session identifier (exchange hash of the first key exchange).
    pub fn session_id(&self) -> Option<Vec<u8>> {
        self.driver().ok()?.session_id().map(<[u8]>::to_vec)
    }

    /// Host key accepted during the first key exchange.
    pub fn host_key(&self) -> Option<PublicHostKey> {
        self.driver().ok()?.host_key().cloned()
    }

    /// Algorithms of the most recent key exchange.
    pub fn negotiated(&self) -> Option<NegotiatedAlgorithms> {
        self.driver().ok()?.negotiated().copied()
    }

    /// Number of completed key exchanges, the first one included.
    pub fn key_exchanges(&self) -> u32 {
        self.driver().map(|d| d.exchanges()).unwrap_or(0)
    }

    /// Starts a key re-exchange.
    ///
    /// Returns immediately; the exchange completes in the background as
    /// packets are received. Has no effect while one is already running.
    pub fn rekey(&self) -> TernResult<()> {
        self.submit(Outbound::StartKex(RekeyReason::Requested))
    }

    fn driver(&self) -> TernResult<MutexGuard<'_, KexDriver>> {
        lock_driver(&self.driver)
    }

    fn submit(&self, item: Outbound) -> TernResult<()> {
        if self.is_closed() {
            return Err(TernError::TransportClosed("Connection is closed".to_string()));
        }
        self.outbound
            .send(item)
            .map_err(|_| TernError::TransportClosed("Writer task has stopped".to_string()))
    }

    /// Sends DISCONNECT for a fatal error and marks the transport closed.
    fn abort(&self, err: &TernError) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        match err {
            TernError::MacVerification { sequence } => {
                error!(peer = %self.identity, seq = sequence, "MAC verification failed, closing transport")
            }
            _ => warn!(peer = %self.identity, error = %err, "Closing transport after fatal error"),
        }
        if let Ok(mut driver) = self.driver() {
            driver.close(State::Closing);
        }
        if let Some(reason) = disconnect_reason(err) {
            // The writer may already be gone.
            let _ = self.outbound.send(Outbound::Disconnect {
                reason,
                description: err.to_string(),
                done: None,
            });
        }
    }

    async fn next_event(&self) -> TernResult<Event> {
        let mut reader = self.reader.lock().await;
        loop {
            if self.is_closed() {
                return Err(TernError::TransportClosed("Connection is closed".to_string()));
            }
            let payload = match reader.read_payload().await {
                Ok(payload) => payload,
                Err(e) => {
                    self.abort(&e);
                    return Err(e);
                }
            };
            match self.dispatch(&mut reader, payload) {
                Ok(Some(event)) => return Ok(event),
                Ok(None) => continue,
                Err(e) => {
                    self.abort(&e);
                    return Err(e);
                }
            }
        }
    }

    fn dispatch(&self, reader: &mut ReadSide, payload: Vec<u8>) -> TernResult<Option<Event>> {
        let msg_type = *payload
            .first()
            .ok_or_else(|| TernError::Protocol("Empty packet payload".to_string()))?;

        match MessageType::from_u8(msg_type) {
            Some(MessageType::Disconnect) => {
                let mut offset = 1;
                let reason = read_u32(&payload, &mut offset)?;
                let description = read_string(&payload, &mut offset).unwrap_or_default();
                info!(peer = %self.identity, reason, description = %description, "Peer disconnected");
                self.closed.store(true, Ordering::SeqCst);
                if let Ok(mut driver) = self.driver() {
                    driver.close(State::Closed);
                }
                return Err(TernError::TransportClosed(format!(
                    "Disconnected by peer (reason {}): {}",
                    reason, description
                )));
            }
            Some(MessageType::Ignore) | Some(MessageType::Debug) => return Ok(None),
            Some(MessageType::Unimplemented) => {
                let mut offset = 1;
                let sequence = read_u32(&payload, &mut offset)?;
                debug!(sequence, "Peer did not implement one of our messages");
                return Ok(None);
            }
            _ => {}
        }

        if (20..=49).contains(&msg_type) {
            let actions = self.driver()?.handle(&payload)?;
            let mut event = None;
            for action in actions {
                match action {
                    KexAction::Send(bytes) => self.submit(Outbound::Packet {
                        payload: bytes,
                        done: None,
                    })?,
                    KexAction::InstallOutbound(keys) => self.submit(Outbound::NewKeys(keys))?,
                    KexAction::InstallInbound(keys) => reader.opener.install(keys),
                    KexAction::Complete => event = Some(Event::KexComplete),
                }
            }
            return Ok(event);
        }

        let rekey = {
            let mut driver = self.driver()?;
            if !driver.accepts_application() {
                return Err(TernError::Protocol(format!(
                    "Message {} received during key exchange",
                    msg_type
                )));
            }
            driver.note_traffic(payload.len())
        };
        if let Some(reason) = rekey {
            self.submit(Outbound::StartKex(reason))?;
        }
        Ok(Some(Event::Payload(payload)))
    }
}

#[async_trait]
impl PacketTransport for SshConnection {
    async fn send_packet(&self, payload: Vec<u8>) -> TernResult<()> {
        let (done, written) = oneshot::channel();
        self.submit(Outbound::Packet {
            payload,
            done: Some(done),
        })?;
        written
            .await
            .map_err(|_| TernError::TransportClosed("Writer task has stopped".to_string()))?
    }

    fn queue_packet(&self, payload: Vec<u8>) -> TernResult<()> {
        self.submit(Outbound::Packet {
            payload,
            done: None,
        })
    }

    async fn receive_packet(&self) -> TernResult<Vec<u8>> {
        loop {
            match self.next_event().await? {
                Event::Payload(payload) => return Ok(payload),
                Event::KexComplete => continue,
            }
        }
    }

    async fn close(&self, reason: u32, description: &str) -> TernResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Ok(mut driver) = self.driver() {
            driver.close(State::Closing);
        }
        let (done, flushed) = oneshot::channel();
        let sent = self.outbound.send(Outbound::Disconnect {
            reason,
            description: description.to_string(),
            done: Some(done),
        });
        if sent.is_ok() {
            let _ = flushed.await;
        }
        if let Ok(mut driver) = self.driver() {
            driver.close(State::Closed);
        }
        info!(peer = %self.identity, reason, "Transport closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn lock_driver(driver: &Mutex<KexDriver>) -> TernResult<MutexGuard<'_, KexDriver>> {
    driver
        .lock()
        .map_err(|_| TernError::Protocol("Key exchange state poisoned".to_string()))
}

fn disconnect_reason(err: &TernError) -> Option<u32> {
    match err {
        TernError::Io(_) | TernError::TransportClosed(_) => None,
        TernError::MacVerification { .. } => Some(disconnect::MAC_ERROR),
        TernError::NoCommonAlgorithm { .. } | TernError::KeyExchangeFailed(_) => {
            Some(disconnect::KEY_EXCHANGE_FAILED)
        }
        TernError::HostKeyVerification(_) => Some(disconnect::HOST_KEY_NOT_VERIFIABLE),
        _ => Some(disconnect::PROTOCOL_ERROR),
    }
}

fn ack(done: Option<Ack>, result: TernResult<()>) {
    if let Some(done) = done {
        let _ = done.send(result);
    }
}

fn closed_error() -> TernError {
    TernError::TransportClosed("Connection closed before the packet was sent".to_string())
}

struct Writer<W> {
    half: W,
    sealer: PacketSealer,
    driver: Arc<Mutex<KexDriver>>,
    closed: Arc<AtomicBool>,
    held: VecDeque<(Vec<u8>, Option<Ack>)>,
    kex_pending: bool,
    rekey_check: Duration,
}

impl<W> Writer<W>
where
    W: AsyncWrite + Send + Unpin,
{
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Outbound>) {
        let mut rekey_timer = tokio::time::interval_at(
            tokio::time::Instant::now() + self.rekey_check,
            self.rekey_check,
        );
        rekey_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let item = tokio::select! {
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
                _ = rekey_timer.tick() => match lock_driver(&self.driver).map(|d| d.rekey_due()) {
                    Ok(Some(reason)) => Outbound::StartKex(reason),
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(error = %e, "SSH writer stopped");
                        break;
                    }
                },
            };
            let result = match item {
                Outbound::Packet { payload, done } => self.on_packet(payload, done).await,
                Outbound::NewKeys(keys) => self.on_new_keys(keys).await,
                Outbound::StartKex(reason) => self.start_kex(reason).await,
                Outbound::Disconnect {
                    reason,
                    description,
                    done,
                } => {
                    self.disconnect(reason, &description).await;
                    ack(done, Ok(()));
                    break;
                }
            };
            if let Err(e) = result {
                warn!(error = %e, "SSH writer stopped");
                break;
            }
        }

        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut driver) = lock_driver(&self.driver) {
            driver.close(State::Closed);
        }
        for (_, done) in self.held.drain(..) {
            ack(done, Err(closed_error()));
        }
        rx.close();
        while let Ok(item) = rx.try_recv() {
            match item {
                Outbound::Packet { done, .. } => ack(done, Err(closed_error())),
                Outbound::Disconnect { done, .. } => ack(done, Ok(())),
                Outbound::NewKeys(_) | Outbound::StartKex(_) => {}
            }
        }
        debug!("SSH writer finished");
    }

    async fn on_packet(&mut self, payload: Vec<u8>, done: Option<Ack>) -> TernResult<()> {
        let msg_type = payload.first().copied().unwrap_or(0);
        if self.kex_pending && !is_kex_message(msg_type) {
            self.held.push_back((payload, done));
            return Ok(());
        }
        if msg_type == MessageType::KexInit as u8 {
            self.kex_pending = true;
        }

        let sealed = match self.sealer.seal(&payload) {
            Ok(sealed) => sealed,
            Err(e) => {
                // Rejected before the sequence number advanced; the stream is intact.
                ack(done, Err(e));
                return Ok(());
            }
        };
        if let Err(e) = self.write_sealed(&sealed).await {
            ack(done, Err(closed_error()));
            return Err(e);
        }
        ack(done, Ok(()));

        if is_kex_message(msg_type) {
            return Ok(());
        }
        let due = lock_driver(&self.driver)?.note_traffic(sealed.len());
        match due {
            Some(reason) => self.start_kex(reason).await,
            None => Ok(()),
        }
    }

    async fn on_new_keys(&mut self, keys: DirectionKeys) -> TernResult<()> {
        self.sealer.install(keys);
        self.kex_pending = false;
        debug!(held = self.held.len(), "Outbound keys installed");

        while !self.kex_pending {
            let Some((payload, done)) = self.held.pop_front() else {
                break;
            };
            self.on_packet(payload, done).await?;
        }
        Ok(())
    }

    async fn start_kex(&mut self, reason: RekeyReason) -> TernResult<()> {
        let kexinit = lock_driver(&self.driver)?.start(reason)?;
        if let Some(kexinit) = kexinit {
            self.kex_pending = true;
            let sealed = self.sealer.seal(&kexinit)?;
            self.write_sealed(&sealed).await?;
        }
        Ok(())
    }

    async fn disconnect(&mut self, reason: u32, description: &str) {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::Disconnect as u8);
        buf.put_u32(reason);
        write_string(&mut buf, description);
        write_string(&mut buf, "");

        if let Ok(sealed) = self.sealer.seal(&buf) {
            if let Err(e) = self.write_sealed(&sealed).await {
                debug!(error = %e, "Failed to send disconnect");
            }
        }
        let _ = self.half.shutdown().await;
    }

    async fn write_sealed(&mut self, sealed: &[u8]) -> TernResult<()> {
        self.half.write_all(sealed).await?;
        self.half.flush().await?;
        Ok(())
    }
}
