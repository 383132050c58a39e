//! Channel multiplexer (RFC 4254 Sections 5-7).
//!
//! Routes inbound connection-protocol messages to channels, enforces flow
//! control in both directions, and serializes outbound channel messages
//! through the transport.
//!
//! # Architecture
//!
//! ```text
//!                 +---------------------------+
//! PacketTransport |  reader task (route)      |---> Channel data / stderr queues
//! --------------->|  Mutex<ChannelTable>      |---> open / request replies
//!                 |  id -> Slot arena         |---> forwarded-tcpip listeners
//!                 +---------------------------+
//!                      ^            |
//!   Channel::write ----+            +---> send_packet / queue_packet
//! ```
//!
//! The table lock is only held to look up or mutate slots, never across an
//! await. The reader task never waits on the writer: everything it sends
//! goes through [`PacketTransport::queue_packet`].

use crate::ssh::channel::{Channel, ExitStatus};
use crate::ssh::connection::{
    recipient_channel, ChannelClose, ChannelData, ChannelEof, ChannelExtendedData, ChannelFailure,
    ChannelOpen, ChannelOpenConfirmation, ChannelOpenFailure, ChannelOpenFailureReason,
    ChannelRequest, ChannelRequestType, ChannelType, ChannelWindowAdjust,
    GlobalRequest, GlobalRequestType, RequestSuccess, DEFAULT_MAX_PACKET_SIZE,
    DEFAULT_WINDOW_SIZE, EXTENDED_DATA_STDERR,
};
use crate::ssh::connection_mgr::PacketTransport;
use crate::ssh::forwarding::Parameters;
use crate::ssh::message::{disconnect, MessageType};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use tern_platform::{TernError, TernResult};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, trace, warn};

/// Multiplexer settings.
#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    /// Initial window advertised for new channels (default: 2 MiB)
    pub window_size: u32,
    /// Maximum data packet advertised for new channels (default: 32 KiB)
    pub max_packet_size: u32,
    /// How long to wait for an open confirmation (default: 30 s)
    pub open_timeout: Duration,
    /// How long to wait for a channel or global request reply (default: 30 s)
    pub request_timeout: Duration,
    /// How long a writer may wait for window space; `None` waits forever
    pub window_timeout: Option<Duration>,
    /// How long `close` waits for the peer's CLOSE (default: 30 s)
    pub close_timeout: Duration,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            open_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            window_timeout: None,
            close_timeout: Duration::from_secs(30),
        }
    }
}

type Inbound = mpsc::UnboundedSender<TernResult<Vec<u8>>>;

enum SlotState {
    /// Waiting for OPEN_CONFIRMATION or OPEN_FAILURE.
    Opening(oneshot::Sender<TernResult<()>>),
    Open,
}

struct Slot {
    state: SlotState,
    peer_id: u32,
    /// Bytes we may still send.
    remote_window: u32,
    peer_max_packet: u32,
    /// Bytes the peer may still send.
    local_window: u32,
    local_max_packet: u32,
    initial_window: u32,
    /// Bytes handed to the reader but not yet re-advertised.
    unacked: u32,
    data_tx: Option<Inbound>,
    stderr_tx: Option<Inbound>,
    window: Arc<Notify>,
    requests: VecDeque<oneshot::Sender<bool>>,
    exit: Arc<OnceLock<ExitStatus>>,
    close_waiters: Vec<oneshot::Sender<()>>,
    sent_eof: bool,
    sent_close: bool,
}

impl Slot {
    fn fail(&mut self, make: impl Fn() -> TernError) {
        if let SlotState::Opening(_) = self.state {
            if let SlotState::Opening(reply) = std::mem::replace(&mut self.state, SlotState::Open) {
                let _ = reply.send(Err(make()));
            }
        }
        if let Some(tx) = self.data_tx.take() {
            let _ = tx.send(Err(make()));
        }
        self.stderr_tx = None;
        self.requests.clear();
        self.close_waiters.clear();
        self.window.notify_one();
    }
}

#[derive(Default)]
struct ChannelTable {
    slots: HashMap<u32, Slot>,
    /// Ids released locally whose peer side may still send packets.
    retired: HashSet<u32>,
    next_id: u32,
    listeners: HashMap<(String, u16), mpsc::UnboundedSender<Channel>>,
    global_replies: VecDeque<oneshot::Sender<Option<RequestSuccess>>>,
    closed: Option<String>,
}

impl ChannelTable {
    fn allocate_id(&mut self) -> u32 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.slots.contains_key(&id) && !self.retired.contains(&id) {
                return id;
            }
        }
    }

    fn check_alive(&self) -> TernResult<()> {
        match &self.closed {
            Some(reason) => Err(TernError::TransportClosed(reason.clone())),
            None => Ok(()),
        }
    }

    fn open_slot(&mut self, id: u32) -> TernResult<&mut Slot> {
        self.check_alive()?;
        match self.slots.get_mut(&id) {
            Some(slot) if matches!(slot.state, SlotState::Open) && !slot.sent_close => Ok(slot),
            _ => Err(TernError::ChannelClosed(id)),
        }
    }
}

/// State shared by the multiplexer, its reader task, and every channel.
pub(crate) struct Shared {
    transport: Arc<dyn PacketTransport>,
    table: Mutex<ChannelTable>,
    config: MultiplexerConfig,
}

fn unknown_channel(id: u32) -> TernError {
    TernError::Protocol(format!("Message for unknown channel {}", id))
}

impl Shared {
    fn lock(&self) -> TernResult<MutexGuard<'_, ChannelTable>> {
        self.table
            .lock()
            .map_err(|_| TernError::Protocol("Channel table poisoned".to_string()))
    }

    /// Error for an operation whose reply channel was dropped.
    fn gone_error(&self, id: u32) -> TernError {
        match self.lock().ok().and_then(|t| t.closed.clone()) {
            Some(reason) => TernError::TransportClosed(reason),
            None => TernError::ChannelClosed(id),
        }
    }

    fn new_slot(
        self: &Arc<Self>,
        id: u32,
        channel_type: ChannelType,
        state: SlotState,
        initial_window: u32,
        max_packet: u32,
    ) -> (Channel, Slot) {
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        let exit = Arc::new(OnceLock::new());
        let channel = Channel::new(
            id,
            channel_type,
            self.clone(),
            data_rx,
            stderr_rx,
            exit.clone(),
        );
        let slot = Slot {
            state,
            peer_id: 0,
            remote_window: 0,
            peer_max_packet: 0,
            local_window: initial_window,
            local_max_packet: max_packet,
            initial_window,
            unacked: 0,
            data_tx: Some(data_tx),
            stderr_tx: Some(stderr_tx),
            window: Arc::new(Notify::new()),
            requests: VecDeque::new(),
            exit,
            close_waiters: Vec::new(),
            sent_eof: false,
            sent_close: false,
        };
        (channel, slot)
    }

    pub(crate) async fn open(
        self: &Arc<Self>,
        channel_type: ChannelType,
        initial_window: u32,
        max_packet: u32,
    ) -> TernResult<Channel> {
        let (id, channel, confirmed) = {
            let mut table = self.lock()?;
            table.check_alive()?;
            let id = table.allocate_id();
            let (reply_tx, reply_rx) = oneshot::channel();
            let (channel, slot) = self.new_slot(
                id,
                channel_type.clone(),
                SlotState::Opening(reply_tx),
                initial_window,
                max_packet,
            );
            table.slots.insert(id, slot);
            (id, channel, reply_rx)
        };

        debug!(channel = id, kind = channel_type.name(), "Opening channel");
        let open = ChannelOpen {
            channel_type,
            sender_channel: id,
            initial_window,
            max_packet,
        };
        self.transport.send_packet(open.to_bytes()).await?;

        // Dropping `channel` on any failure path releases the id.
        match timeout(self.config.open_timeout, confirmed).await {
            Ok(Ok(Ok(()))) => {
                debug!(channel = id, "Channel open confirmed");
                Ok(channel)
            }
            Ok(Ok(Err(e))) => {
                debug!(channel = id, error = %e, "Channel open refused");
                Err(e)
            }
            Ok(Err(_)) => Err(self.gone_error(id)),
            Err(_) => Err(TernError::Timeout(format!(
                "Channel {} open not confirmed within {:?}",
                id, self.config.open_timeout
            ))),
        }
    }

    /// Sends `data` as CHANNEL_DATA, or EXTENDED_DATA when `data_type` is set,
    /// waiting for window space as needed.
    pub(crate) async fn write(&self, id: u32, data: &[u8], data_type: Option<u32>) -> TernResult<()> {
        let mut offset = 0;
        while offset < data.len() {
            let (payload, sent) = loop {
                let window = {
                    let mut table = self.lock()?;
                    let slot = table.open_slot(id)?;
                    if slot.sent_eof {
                        return Err(TernError::ChannelClosed(id));
                    }
                    if slot.remote_window > 0 {
                        let n = (data.len() - offset)
                            .min(slot.remote_window as usize)
                            .min(slot.peer_max_packet.max(1) as usize);
                        slot.remote_window -= n as u32;
                        let chunk = data[offset..offset + n].to_vec();
                        let payload = match data_type {
                            None => ChannelData {
                                recipient_channel: slot.peer_id,
                                data: chunk,
                            }
                            .to_bytes(),
                            Some(code) => ChannelExtendedData {
                                recipient_channel: slot.peer_id,
                                data_type: code,
                                data: chunk,
                            }
                            .to_bytes(),
                        };
                        break (payload, n);
                    }
                    slot.window.clone()
                };

                trace!(channel = id, "Waiting for window space");
                match self.config.window_timeout {
                    None => window.notified().await,
                    Some(limit) => {
                        if timeout(limit, window.notified()).await.is_err() {
                            self.tear_down(id, || {
                                TernError::Timeout(format!("Channel {} window stayed closed", id))
                            });
                            return Err(TernError::Timeout(format!(
                                "Channel {} window stayed closed for {:?}",
                                id, limit
                            )));
                        }
                    }
                }
            };

            self.transport.send_packet(payload).await?;
            offset += sent;
        }
        Ok(())
    }

    pub(crate) async fn send_eof(&self, id: u32) -> TernResult<()> {
        let payload = {
            let mut table = self.lock()?;
            let slot = table.open_slot(id)?;
            if slot.sent_eof {
                return Ok(());
            }
            slot.sent_eof = true;
            ChannelEof {
                recipient_channel: slot.peer_id,
            }
            .to_bytes()
        };
        self.transport.send_packet(payload).await
    }

    pub(crate) async fn request(
        &self,
        id: u32,
        request: ChannelRequestType,
        want_reply: bool,
    ) -> TernResult<bool> {
        let name = request.name().to_string();
        let reply = {
            let mut table = self.lock()?;
            let slot = table.open_slot(id)?;
            let message = ChannelRequest {
                recipient_channel: slot.peer_id,
                want_reply,
                request,
            };
            let reply = if want_reply {
                let (tx, rx) = oneshot::channel();
                slot.requests.push_back(tx);
                Some(rx)
            } else {
                None
            };
            // Queued under the lock so replies line up with the request order.
            self.transport.queue_packet(message.to_bytes())?;
            reply
        };

        let Some(reply) = reply else {
            return Ok(true);
        };
        match timeout(self.config.request_timeout, reply).await {
            Ok(Ok(accepted)) => {
                debug!(channel = id, request = %name, accepted, "Channel request answered");
                Ok(accepted)
            }
            Ok(Err(_)) => Err(self.gone_error(id)),
            Err(_) => {
                self.tear_down(id, || {
                    TernError::Timeout(format!("Channel {} request {} timed out", id, name))
                });
                Err(TernError::Timeout(format!(
                    "Channel {} request {} not answered within {:?}",
                    id, name, self.config.request_timeout
                )))
            }
        }
    }

    /// Credits consumed bytes and re-advertises window once half is used.
    pub(crate) fn consume(&self, id: u32, bytes: usize) {
        let Ok(mut table) = self.table.lock() else {
            return;
        };
        if let Some(slot) = table.slots.get_mut(&id) {
            if let Err(e) = self.credit(slot, bytes as u32) {
                debug!(channel = id, error = %e, "Window adjust not sent");
            }
        }
    }

    fn credit(&self, slot: &mut Slot, bytes: u32) -> TernResult<()> {
        slot.unacked = slot.unacked.saturating_add(bytes);
        if slot.sent_close || slot.unacked < (slot.initial_window / 2).max(1) {
            return Ok(());
        }
        let adjust = ChannelWindowAdjust {
            recipient_channel: slot.peer_id,
            bytes_to_add: slot.unacked,
        };
        slot.local_window = slot.local_window.saturating_add(slot.unacked);
        slot.unacked = 0;
        self.transport.queue_packet(adjust.to_bytes())
    }

    /// Two-phase close: send CLOSE, then wait for the peer's.
    pub(crate) async fn close(&self, id: u32) -> TernResult<()> {
        let done = {
            let mut table = self.lock()?;
            if table.closed.is_some() {
                return Ok(());
            }
            let Some(slot) = table.slots.get_mut(&id) else {
                return Ok(());
            };
            if !matches!(slot.state, SlotState::Open) {
                return Ok(());
            }
            if !slot.sent_close {
                slot.sent_close = true;
                self.transport.queue_packet(
                    ChannelClose {
                        recipient_channel: slot.peer_id,
                    }
                    .to_bytes(),
                )?;
                debug!(channel = id, "Sent channel close");
            }
            let (tx, rx) = oneshot::channel();
            slot.close_waiters.push(tx);
            rx
        };

        if timeout(self.config.close_timeout, done).await.is_err() {
            warn!(channel = id, "Peer did not confirm channel close");
            self.release(id);
            return Err(TernError::Timeout(format!(
                "Channel {} close not confirmed within {:?}",
                id, self.config.close_timeout
            )));
        }
        Ok(())
    }

    /// Resolves once the channel is gone: the peer's CLOSE arrived, the
    /// channel was torn down, or the transport shut down.
    pub(crate) async fn closed(&self, id: u32) {
        let done = {
            let Ok(mut table) = self.lock() else {
                return;
            };
            let Some(slot) = table.slots.get_mut(&id) else {
                return;
            };
            let (tx, rx) = oneshot::channel();
            slot.close_waiters.push(tx);
            rx
        };
        let _ = done.await;
    }

    /// Called when the last handle to a channel goes away.
    pub(crate) fn release(&self, id: u32) {
        let Ok(mut table) = self.table.lock() else {
            return;
        };
        let Some(slot) = table.slots.remove(&id) else {
            return;
        };
        if table.closed.is_some() {
            return;
        }
        if matches!(slot.state, SlotState::Open) && !slot.sent_close {
            let close = ChannelClose {
                recipient_channel: slot.peer_id,
            };
            if let Err(e) = self.transport.queue_packet(close.to_bytes()) {
                debug!(channel = id, error = %e, "Close not sent");
            }
        }
        // The id stays reserved until the peer's CLOSE (or OPEN_FAILURE) arrives.
        table.retired.insert(id);
        debug!(channel = id, "Channel released");
    }

    /// Fails the channel's pending operations and releases it.
    fn tear_down(&self, id: u32, make: impl Fn() -> TernError) {
        if let Ok(mut table) = self.table.lock() {
            if let Some(slot) = table.slots.get_mut(&id) {
                slot.fail(&make);
            }
        }
        self.release(id);
    }

    async fn global_request(&self, request: GlobalRequestType) -> TernResult<RequestSuccess> {
        let name = request.name().to_string();
        let reply = {
            let mut table = self.lock()?;
            table.check_alive()?;
            let (tx, rx) = oneshot::channel();
            table.global_replies.push_back(tx);
            let message = GlobalRequest {
                want_reply: true,
                request,
            };
            self.transport.queue_packet(message.to_bytes())?;
            rx
        };

        match timeout(self.config.request_timeout, reply).await {
            Ok(Ok(Some(success))) => Ok(success),
            Ok(Ok(None)) => Err(TernError::RequestFailed(format!("Server refused {}", name))),
            Ok(Err(_)) => Err(TernError::TransportClosed(
                "Connection closed before global request reply".to_string(),
            )),
            Err(_) => Err(TernError::Timeout(format!(
                "Global request {} not answered within {:?}",
                name, self.config.request_timeout
            ))),
        }
    }

    /// Fails every pending operation after the transport went away.
    fn fail_all(&self, reason: &str) {
        let mut table = match self.table.lock() {
            Ok(table) => table,
            Err(poisoned) => poisoned.into_inner(),
        };
        if table.closed.is_some() {
            return;
        }
        table.closed = Some(reason.to_string());
        for (_, mut slot) in table.slots.drain() {
            slot.fail(|| TernError::TransportClosed(reason.to_string()));
        }
        table.retired.clear();
        table.listeners.clear();
        table.global_replies.clear();
    }

    fn route(self: &Arc<Self>, payload: &[u8]) -> TernResult<()> {
        let msg_type = *payload
            .first()
            .ok_or_else(|| TernError::Protocol("Empty packet payload".to_string()))?;

        match MessageType::from_u8(msg_type) {
            Some(MessageType::ChannelOpen) => self.on_open(ChannelOpen::from_bytes(payload)?),
            Some(MessageType::ChannelOpenConfirmation) => {
                self.on_confirmation(ChannelOpenConfirmation::from_bytes(payload)?)
            }
            Some(MessageType::ChannelOpenFailure) => {
                self.on_open_failure(ChannelOpenFailure::from_bytes(payload)?)
            }
            Some(MessageType::ChannelWindowAdjust) => {
                let adjust = ChannelWindowAdjust::from_bytes(payload)?;
                self.with_slot(adjust.recipient_channel, |slot| {
                    slot.remote_window = slot
                        .remote_window
                        .checked_add(adjust.bytes_to_add)
                        .ok_or_else(|| {
                            TernError::Protocol(format!(
                                "Channel {} window grew past 2^32-1",
                                adjust.recipient_channel
                            ))
                        })?;
                    slot.window.notify_one();
                    Ok(())
                })
            }
            Some(MessageType::ChannelData) => {
                let msg = ChannelData::from_bytes(payload)?;
                self.on_data(msg.recipient_channel, msg.data, false)
            }
            Some(MessageType::ChannelExtendedData) => {
                let msg = ChannelExtendedData::from_bytes(payload)?;
                if msg.data_type != EXTENDED_DATA_STDERR {
                    debug!(channel = msg.recipient_channel, code = msg.data_type, "Unknown extended data type");
                }
                self.on_data(msg.recipient_channel, msg.data, true)
            }
            Some(MessageType::ChannelEof) => {
                let eof = ChannelEof::from_bytes(payload)?;
                self.with_slot(eof.recipient_channel, |slot| {
                    slot.data_tx = None;
                    slot.stderr_tx = None;
                    Ok(())
                })
            }
            Some(MessageType::ChannelClose) => self.on_close(ChannelClose::from_bytes(payload)?),
            Some(MessageType::ChannelRequest) => self.on_request(ChannelRequest::from_bytes(payload)?),
            Some(MessageType::ChannelSuccess) | Some(MessageType::ChannelFailure) => {
                let id = recipient_channel(payload)?;
                let accepted = msg_type == MessageType::ChannelSuccess as u8;
                self.with_slot(id, |slot| {
                    match slot.requests.pop_front() {
                        Some(reply) => {
                            let _ = reply.send(accepted);
                        }
                        None => warn!(channel = id, "Unsolicited channel request reply"),
                    }
                    Ok(())
                })
            }
            Some(MessageType::GlobalRequest) => {
                let request = GlobalRequest::from_bytes(payload)?;
                debug!(request = request.request.name(), "Refusing global request");
                if request.want_reply {
                    self.transport
                        .queue_packet(vec![MessageType::RequestFailure as u8])?;
                }
                Ok(())
            }
            Some(MessageType::RequestSuccess) | Some(MessageType::RequestFailure) => {
                let reply = if msg_type == MessageType::RequestSuccess as u8 {
                    Some(RequestSuccess::from_bytes(payload)?)
                } else {
                    None
                };
                match self.lock()?.global_replies.pop_front() {
                    Some(waiter) => {
                        let _ = waiter.send(reply);
                    }
                    None => warn!("Unsolicited global request reply"),
                }
                Ok(())
            }
            _ => {
                debug!(msg_type, "Ignoring message outside the connection protocol");
                Ok(())
            }
        }
    }

    /// Runs `f` on a live slot. Retired ids are ignored, unknown ids are fatal.
    fn with_slot(&self, id: u32, f: impl FnOnce(&mut Slot) -> TernResult<()>) -> TernResult<()> {
        let mut table = self.lock()?;
        if table.retired.contains(&id) {
            trace!(channel = id, "Dropping message for released channel");
            return Ok(());
        }
        match table.slots.get_mut(&id) {
            Some(slot) => f(slot),
            None => {
                error!(channel = id, "Message for unknown channel");
                Err(unknown_channel(id))
            }
        }
    }

    fn on_open(self: &Arc<Self>, open: ChannelOpen) -> TernResult<()> {
        let refuse = |reason: ChannelOpenFailureReason| {
            debug!(kind = open.channel_type.name(), reason = %reason, "Refusing channel open");
            self.transport
                .queue_packet(ChannelOpenFailure::new(open.sender_channel, reason).to_bytes())
        };

        let params = match &open.channel_type {
            ChannelType::ForwardedTcpip(params) => params.clone(),
            ChannelType::Other(_) => return refuse(ChannelOpenFailureReason::UnknownChannelType),
            _ => return refuse(ChannelOpenFailureReason::AdministrativelyProhibited),
        };

        let (channel, listener) = {
            let mut table = self.lock()?;
            let key = (params.remote_host().to_string(), params.remote_port());
            let Some(listener) = table.listeners.get(&key).cloned() else {
                drop(table);
                warn!(forward = %params, "No listener for forwarded connection");
                return refuse(ChannelOpenFailureReason::AdministrativelyProhibited);
            };

            let id = table.allocate_id();
            let window = self.config.window_size;
            let max_packet = self.config.max_packet_size;
            let (channel, mut slot) = self.new_slot(
                id,
                open.channel_type.clone(),
                SlotState::Open,
                window,
                max_packet,
            );
            slot.peer_id = open.sender_channel;
            slot.remote_window = open.initial_window;
            slot.peer_max_packet = open.max_packet;
            table.slots.insert(id, slot);

            let confirmation = ChannelOpenConfirmation {
                recipient_channel: open.sender_channel,
                sender_channel: id,
                initial_window: window,
                max_packet,
            };
            self.transport.queue_packet(confirmation.to_bytes())?;
            debug!(channel = id, forward = %params, "Accepted forwarded connection");
            (channel, listener)
        };

        // Outside the lock: a refused delivery drops the channel, which locks the table.
        if let Err(undelivered) = listener.send(channel) {
            drop(undelivered);
        }
        Ok(())
    }

    fn on_confirmation(&self, confirm: ChannelOpenConfirmation) -> TernResult<()> {
        let id = confirm.recipient_channel;
        let mut table = self.lock()?;
        if table.retired.contains(&id) {
            // Opener gave up; close the peer's half right away.
            debug!(channel = id, "Closing channel confirmed after its opener gave up");
            return self.transport.queue_packet(
                ChannelClose {
                    recipient_channel: confirm.sender_channel,
                }
                .to_bytes(),
            );
        }
        let slot = table.slots.get_mut(&id).ok_or_else(|| unknown_channel(id))?;
        let SlotState::Opening(_) = slot.state else {
            return Err(TernError::Protocol(format!(
                "Duplicate open confirmation for channel {}",
                id
            )));
        };
        slot.peer_id = confirm.sender_channel;
        slot.remote_window = confirm.initial_window;
        slot.peer_max_packet = confirm.max_packet;
        if let SlotState::Opening(reply) = std::mem::replace(&mut slot.state, SlotState::Open) {
            let _ = reply.send(Ok(()));
        }
        Ok(())
    }

    fn on_open_failure(&self, failure: ChannelOpenFailure) -> TernResult<()> {
        let id = failure.recipient_channel;
        let mut table = self.lock()?;
        if table.retired.remove(&id) {
            return Ok(());
        }
        match table.slots.get(&id).map(|slot| &slot.state) {
            Some(SlotState::Opening(_)) => {}
            Some(SlotState::Open) => {
                return Err(TernError::Protocol(format!(
                    "Open failure for established channel {}",
                    id
                )))
            }
            None => return Err(unknown_channel(id)),
        }
        if let Some(slot) = table.slots.remove(&id) {
            if let SlotState::Opening(reply) = slot.state {
                let _ = reply.send(Err(failure.into_error()));
            }
        }
        Ok(())
    }

    fn on_data(&self, id: u32, data: Vec<u8>, stderr: bool) -> TernResult<()> {
        self.with_slot(id, |slot| {
            if !matches!(slot.state, SlotState::Open) {
                return Err(TernError::Protocol(format!(
                    "Data for channel {} before confirmation",
                    id
                )));
            }
            let len = data.len() as u32;
            if len > slot.local_window {
                return Err(TernError::Protocol(format!(
                    "Channel {} received {} bytes with {} bytes of window",
                    id, len, slot.local_window
                )));
            }
            if len > slot.local_max_packet {
                return Err(TernError::Protocol(format!(
                    "Channel {} received {} bytes, maximum packet is {}",
                    id, len, slot.local_max_packet
                )));
            }
            slot.local_window -= len;

            let target = if stderr {
                slot.stderr_tx.as_ref()
            } else {
                slot.data_tx.as_ref()
            };
            let delivered = match target {
                Some(tx) => tx.send(Ok(data)).is_ok(),
                None => false,
            };
            if !delivered {
                // Nobody will read it; keep the peer flowing.
                self.credit(slot, len)?;
            }
            Ok(())
        })
    }

    fn on_close(&self, close: ChannelClose) -> TernResult<()> {
        let id = close.recipient_channel;
        let mut table = self.lock()?;
        if table.retired.remove(&id) {
            debug!(channel = id, "Channel close confirmed");
            return Ok(());
        }
        let mut slot = table.slots.remove(&id).ok_or_else(|| unknown_channel(id))?;
        if !slot.sent_close {
            slot.sent_close = true;
            self.transport.queue_packet(
                ChannelClose {
                    recipient_channel: slot.peer_id,
                }
                .to_bytes(),
            )?;
        }
        slot.data_tx = None;
        slot.stderr_tx = None;
        slot.window.notify_one();
        for waiter in slot.close_waiters.drain(..) {
            let _ = waiter.send(());
        }
        debug!(channel = id, "Channel closed");
        Ok(())
    }

    fn on_request(&self, request: ChannelRequest) -> TernResult<()> {
        let id = request.recipient_channel;
        self.with_slot(id, |slot| {
            match request.request {
                ChannelRequestType::ExitStatus { exit_status } => {
                    let _ = slot.exit.set(ExitStatus::Code(exit_status));
                }
                ChannelRequestType::ExitSignal {
                    signal_name,
                    core_dumped,
                    error_message,
                } => {
                    let _ = slot.exit.set(ExitStatus::Signal {
                        name: signal_name,
                        core_dumped,
                        message: error_message,
                    });
                }
                ref other => debug!(channel = id, request = other.name(), "Ignoring channel request"),
            }
            if request.want_reply {
                self.transport.queue_packet(
                    ChannelFailure {
                        recipient_channel: slot.peer_id,
                    }
                    .to_bytes(),
                )?;
            }
            Ok(())
        })
    }
}

async fn run(shared: Arc<Shared>) {
    debug!("Channel multiplexer started");
    loop {
        let payload = match shared.transport.receive_packet().await {
            Ok(payload) => payload,
            Err(e) => {
                debug!(error = %e, "Transport receive ended");
                shared.fail_all(&e.to_string());
                break;
            }
        };
        if let Err(e) = shared.route(&payload) {
            error!(error = %e, "Connection protocol violation");
            let _ = shared
                .transport
                .close(disconnect::PROTOCOL_ERROR, &e.to_string())
                .await;
            shared.fail_all(&e.to_string());
            break;
        }
    }
    debug!("Channel multiplexer stopped");
}

struct Inner {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.task.abort();
        self.shared.fail_all("Multiplexer dropped");
    }
}

/// Multiplexes channels over one transport.
///
/// Cheap to clone; the reader task stops when the last clone is dropped or
/// the transport fails.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("channels", &self.channel_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Multiplexer {
    /// Starts routing packets from `transport`.
    pub fn start(transport: Arc<dyn PacketTransport>, config: MultiplexerConfig) -> Self {
        let shared = Arc::new(Shared {
            transport,
            table: Mutex::new(ChannelTable::default()),
            config,
        });
        let task = tokio::spawn(run(shared.clone()));
        Self {
            inner: Arc::new(Inner { shared, task }),
        }
    }

    fn shared(&self) -> &Arc<Shared> {
        &self.inner.shared
    }

    /// Opens a channel and waits for the peer's answer.
    ///
    /// # Errors
    ///
    /// - [`TernError::ChannelOpenFailure`] with the peer's reason code
    /// - [`TernError::Timeout`] if no answer arrives within the open timeout
    /// - [`TernError::TransportClosed`] if the connection goes away
    pub async fn open(
        &self,
        channel_type: ChannelType,
        initial_window: u32,
        max_packet: u32,
    ) -> TernResult<Channel> {
        self.shared().open(channel_type, initial_window, max_packet).await
    }

    /// Opens a `session` channel with the configured window.
    pub async fn open_session(&self) -> TernResult<Channel> {
        let config = &self.shared().config;
        self.open(ChannelType::Session, config.window_size, config.max_packet_size)
            .await
    }

    /// Opens a `direct-tcpip` channel for `params`.
    pub async fn open_direct_tcpip(&self, params: Parameters) -> TernResult<Channel> {
        let config = &self.shared().config;
        self.open(
            ChannelType::DirectTcpip(params),
            config.window_size,
            config.max_packet_size,
        )
        .await
    }

    /// Asks the server to listen on `bind_host:bind_port` and returns the
    /// port actually bound plus a queue of matching `forwarded-tcpip` channels.
    ///
    /// Port 0 lets the server pick.
    pub async fn tcpip_forward(
        &self,
        bind_host: &str,
        bind_port: u16,
    ) -> TernResult<(u16, mpsc::UnboundedReceiver<Channel>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        if bind_port != 0 {
            self.register_listener(bind_host, bind_port, tx.clone())?;
        }

        let reply = self
            .shared()
            .global_request(GlobalRequestType::TcpipForward {
                bind_host: bind_host.to_string(),
                bind_port: u32::from(bind_port),
            })
            .await;

        let success = match reply {
            Ok(success) => success,
            Err(e) => {
                self.unregister_listener(bind_host, bind_port);
                return Err(e);
            }
        };

        let port = if bind_port == 0 {
            let port = success
                .bound_port()
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| {
                    TernError::Protocol("tcpip-forward reply without a valid port".to_string())
                })?;
            self.register_listener(bind_host, port, tx)?;
            port
        } else {
            bind_port
        };
        debug!(bind_host, port, "Remote forward established");
        Ok((port, rx))
    }

    /// Cancels a remote forward and stops accepting its channels.
    pub async fn cancel_tcpip_forward(&self, bind_host: &str, bind_port: u16) -> TernResult<()> {
        self.unregister_listener(bind_host, bind_port);
        self.shared()
            .global_request(GlobalRequestType::CancelTcpipForward {
                bind_host: bind_host.to_string(),
                bind_port: u32::from(bind_port),
            })
            .await
            .map(|_| ())
    }

    fn register_listener(
        &self,
        bind_host: &str,
        bind_port: u16,
        tx: mpsc::UnboundedSender<Channel>,
    ) -> TernResult<()> {
        let mut table = self.shared().lock()?;
        table.check_alive()?;
        table.listeners.insert((bind_host.to_string(), bind_port), tx);
        Ok(())
    }

    fn unregister_listener(&self, bind_host: &str, bind_port: u16) {
        if let Ok(mut table) = self.shared().lock() {
            table.listeners.remove(&(bind_host.to_string(), bind_port));
        }
    }

    /// Number of channels in the table, opening ones included.
    pub fn channel_count(&self) -> usize {
        self.shared().lock().map(|t| t.slots.len()).unwrap_or(0)
    }

    /// Whether the transport under the multiplexer has failed or closed.
    pub fn is_closed(&self) -> bool {
        self.shared()
            .lock()
            .map(|t| t.closed.is_some())
            .unwrap_or(true)
    }

    /// The transport the multiplexer reads from.
    pub fn transport(&self) -> &Arc<dyn PacketTransport> {
        &self.shared().transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::connection::ChannelSuccess;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// In-memory transport; the test plays the server through [`Peer`].
    struct MockTransport {
        to_peer: mpsc::UnboundedSender<Vec<u8>>,
        from_peer: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
        closed: AtomicBool,
        close_reason: std::sync::Mutex<Option<u32>>,
    }

    #[async_trait]
    impl PacketTransport for MockTransport {
        async fn send_packet(&self, payload: Vec<u8>) -> TernResult<()> {
            self.queue_packet(payload)
        }

        fn queue_packet(&self, payload: Vec<u8>) -> TernResult<()> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(TernError::TransportClosed("mock closed".to_string()));
            }
            self.to_peer
                .send(payload)
                .map_err(|_| TernError::TransportClosed("peer gone".to_string()))
        }

        async fn receive_packet(&self) -> TernResult<Vec<u8>> {
            self.from_peer
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| TernError::TransportClosed("peer hung up".to_string()))
        }

        async fn close(&self, reason: u32, _description: &str) -> TernResult<()> {
            self.closed.store(true, Ordering::SeqCst);
            *self.close_reason.lock().unwrap() = Some(reason);
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    struct Peer {
        tx: mpsc::UnboundedSender<Vec<u8>>,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
        transport: Arc<MockTransport>,
    }

    impl Peer {
        fn send(&self, payload: Vec<u8>) {
            self.tx.send(payload).unwrap();
        }

        async fn next(&mut self) -> Vec<u8> {
            self.rx.recv().await.expect("client side hung up")
        }

        async fn accept_open(&mut self, peer_id: u32, window: u32, max_packet: u32) -> ChannelOpen {
            let open = ChannelOpen::from_bytes(&self.next().await).unwrap();
            self.send(
                ChannelOpenConfirmation {
                    recipient_channel: open.sender_channel,
                    sender_channel: peer_id,
                    initial_window: window,
                    max_packet,
                }
                .to_bytes(),
            );
            open
        }

        fn hang_up(&mut self) {
            let (tx, _) = mpsc::unbounded_channel();
            self.tx = tx;
        }
    }

    fn setup(config: MultiplexerConfig) -> (Multiplexer, Peer) {
        let (to_peer, rx) = mpsc::unbounded_channel();
        let (tx, from_peer) = mpsc::unbounded_channel();
        let transport = Arc::new(MockTransport {
            to_peer,
            from_peer: tokio::sync::Mutex::new(from_peer),
            closed: AtomicBool::new(false),
            close_reason: std::sync::Mutex::new(None),
        });
        let mux = Multiplexer::start(transport.clone(), config);
        (mux, Peer { tx, rx, transport })
    }

    async fn open_session(mux: &Multiplexer, peer: &mut Peer, window: u32, max: u32) -> Channel {
        let (channel, _) = tokio::join!(mux.open_session(), peer.accept_open(100, window, max));
        channel.unwrap()
    }

    #[tokio::test]
    async fn test_open_confirm_and_ids_are_unique() {
        let (mux, mut peer) = setup(MultiplexerConfig::default());
        let a = open_session(&mux, &mut peer, 1024, 512).await;
        let b = open_session(&mux, &mut peer, 1024, 512).await;
        assert_ne!(a.id(), b.id());
        assert_eq!(mux.channel_count(), 2);
    }

    #[tokio::test]
    async fn test_open_failure_is_local() {
        let (mux, mut peer) = setup(MultiplexerConfig::default());
        let mut ok = open_session(&mux, &mut peer, 1024, 512).await;

        let refuse = async {
            let open = ChannelOpen::from_bytes(&peer.next().await).unwrap();
            peer.send(
                ChannelOpenFailure::new(open.sender_channel, ChannelOpenFailureReason::ConnectFailed)
                    .to_bytes(),
            );
        };
        let params = Parameters::new("127.0.0.1", 4000, "nowhere", 9);
        let (result, _) = tokio::join!(mux.open_direct_tcpip(params), refuse);
        match result {
            Err(TernError::ChannelOpenFailure { reason_code, .. }) => assert_eq!(reason_code, 2),
            other => panic!("unexpected {:?}", other.map(|c| c.id())),
        }

        // The first channel still works.
        let (written, _) = tokio::join!(ok.write(b"ping"), peer.next());
        written.unwrap();
        assert!(!mux.is_closed());
    }

    #[tokio::test]
    async fn test_write_blocks_until_window_adjust() {
        let (mux, mut peer) = setup(MultiplexerConfig::default());
        let mut channel = open_session(&mux, &mut peer, 10, 8).await;

        let writer = tokio::spawn(async move {
            channel.write(&[7u8; 25]).await.unwrap();
            channel
        });

        let first = ChannelData::from_bytes(&peer.next().await).unwrap();
        let second = ChannelData::from_bytes(&peer.next().await).unwrap();
        assert_eq!(first.data.len(), 8);
        assert_eq!(second.data.len(), 2);
        tokio::task::yield_now().await;
        assert!(!writer.is_finished());

        peer.send(
            ChannelWindowAdjust {
                recipient_channel: 0,
                bytes_to_add: 100,
            }
            .to_bytes(),
        );
        let mut rest = 0;
        while rest < 15 {
            let data = ChannelData::from_bytes(&peer.next().await).unwrap();
            assert!(data.data.len() <= 8);
            rest += data.data.len();
        }
        assert_eq!(rest, 15);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_reading_sends_window_adjust_at_half() {
        let (mux, mut peer) = setup(MultiplexerConfig::default());
        let (channel, open) = tokio::join!(mux.open(ChannelType::Session, 100, 100), peer.accept_open(5, 1024, 512));
        let mut channel = channel.unwrap();
        assert_eq!(open.initial_window, 100);

        peer.send(ChannelData { recipient_channel: channel.id(), data: vec![1; 30] }.to_bytes());
        assert_eq!(channel.read().await.unwrap().unwrap().len(), 30);
        peer.send(ChannelData { recipient_channel: channel.id(), data: vec![2; 30] }.to_bytes());
        assert_eq!(channel.read().await.unwrap().unwrap().len(), 30);

        let adjust = ChannelWindowAdjust::from_bytes(&peer.next().await).unwrap();
        assert_eq!(adjust.recipient_channel, 5);
        assert_eq!(adjust.bytes_to_add, 60);

        // Window is back to 100, so a full-size packet is accepted.
        peer.send(ChannelData { recipient_channel: channel.id(), data: vec![3; 100] }.to_bytes());
        assert_eq!(channel.read().await.unwrap().unwrap().len(), 100);
    }

    #[tokio::test]
    async fn test_data_beyond_window_is_fatal() {
        let (mux, mut peer) = setup(MultiplexerConfig::default());
        let (channel, _) = tokio::join!(mux.open(ChannelType::Session, 16, 16), peer.accept_open(1, 1024, 512));
        let mut channel = channel.unwrap();

        peer.send(ChannelData { recipient_channel: channel.id(), data: vec![0; 17] }.to_bytes());
        assert!(matches!(channel.read().await, Err(TernError::TransportClosed(_))));
        assert_eq!(
            *peer.transport.close_reason.lock().unwrap(),
            Some(disconnect::PROTOCOL_ERROR)
        );
        assert!(mux.is_closed());
    }

    #[tokio::test]
    async fn test_unknown_channel_is_fatal() {
        let (mux, mut peer) = setup(MultiplexerConfig::default());
        let mut channel = open_session(&mux, &mut peer, 1024, 512).await;

        peer.send(ChannelEof { recipient_channel: 42 }.to_bytes());
        assert!(matches!(channel.read().await, Err(TernError::TransportClosed(_))));
        assert!(matches!(mux.open_session().await, Err(TernError::TransportClosed(_))));
    }

    #[tokio::test]
    async fn test_forwarded_tcpip_matching() {
        let (mux, mut peer) = setup(MultiplexerConfig::default());
        let reply = async {
            let request = GlobalRequest::from_bytes(&peer.next().await).unwrap();
            assert!(request.want_reply);
            assert_eq!(request.request.name(), "tcpip-forward");
            peer.send(vec![MessageType::RequestSuccess as u8]);
        };
        let (forward, _) = tokio::join!(mux.tcpip_forward("0.0.0.0", 8022), reply);
        let (port, mut incoming) = forward.unwrap();
        assert_eq!(port, 8022);

        let open = |bind_port| ChannelOpen {
            channel_type: ChannelType::ForwardedTcpip(Parameters::new("10.1.1.1", 51000, "0.0.0.0", bind_port)),
            sender_channel: 9,
            initial_window: 4096,
            max_packet: 1024,
        };

        peer.send(open(8023).to_bytes());
        let failure = ChannelOpenFailure::from_bytes(&peer.next().await).unwrap();
        assert_eq!(failure.recipient_channel, 9);
        assert_eq!(failure.reason(), Some(ChannelOpenFailureReason::AdministrativelyProhibited));

        peer.send(open(8022).to_bytes());
        let confirm = ChannelOpenConfirmation::from_bytes(&peer.next().await).unwrap();
        assert_eq!(confirm.recipient_channel, 9);
        let channel = incoming.recv().await.unwrap();
        assert_eq!(channel.id(), confirm.sender_channel);
        let params = channel.parameters().unwrap();
        assert_eq!(params.local_host(), "10.1.1.1");
        assert_eq!(params.remote_port(), 8022);
    }

    #[tokio::test]
    async fn test_tcpip_forward_refused() {
        let (mux, mut peer) = setup(MultiplexerConfig::default());
        let reply = async {
            peer.next().await;
            peer.send(vec![MessageType::RequestFailure as u8]);
        };
        let (forward, _) = tokio::join!(mux.tcpip_forward("localhost", 80), reply);
        assert!(matches!(forward, Err(TernError::RequestFailed(_))));
    }

    #[tokio::test]
    async fn test_two_phase_close_local_first() {
        let (mux, mut peer) = setup(MultiplexerConfig::default());
        let channel = open_session(&mux, &mut peer, 1024, 512).await;
        let id = channel.id();

        let server = async {
            let close = ChannelClose::from_bytes(&peer.next().await).unwrap();
            assert_eq!(close.recipient_channel, 100);
            assert_eq!(mux.channel_count(), 1);
            peer.send(ChannelClose { recipient_channel: id }.to_bytes());
        };
        let (closed, _) = tokio::join!(channel.close(), server);
        closed.unwrap();
        assert_eq!(mux.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_two_phase_close_peer_first() {
        let (mux, mut peer) = setup(MultiplexerConfig::default());
        let mut channel = open_session(&mux, &mut peer, 1024, 512).await;

        peer.send(ChannelData { recipient_channel: channel.id(), data: b"bye".to_vec() }.to_bytes());
        peer.send(ChannelClose { recipient_channel: channel.id() }.to_bytes());

        assert_eq!(channel.read().await.unwrap().unwrap(), b"bye");
        assert!(channel.read().await.unwrap().is_none());
        let answer = ChannelClose::from_bytes(&peer.next().await).unwrap();
        assert_eq!(answer.recipient_channel, 100);
        assert!(matches!(channel.write(b"late").await, Err(TernError::ChannelClosed(_))));
        assert_eq!(mux.channel_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_timeout_then_late_confirmation() {
        let config = MultiplexerConfig {
            open_timeout: Duration::from_secs(5),
            ..MultiplexerConfig::default()
        };
        let (mux, mut peer) = setup(config);

        let result = mux.open_session().await;
        assert!(matches!(result, Err(TernError::Timeout(_))));
        let open = ChannelOpen::from_bytes(&peer.next().await).unwrap();

        peer.send(
            ChannelOpenConfirmation {
                recipient_channel: open.sender_channel,
                sender_channel: 77,
                initial_window: 1024,
                max_packet: 512,
            }
            .to_bytes(),
        );
        let close = ChannelClose::from_bytes(&peer.next().await).unwrap();
        assert_eq!(close.recipient_channel, 77);
        assert!(!mux.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_timeout_tears_channel_down() {
        let config = MultiplexerConfig {
            window_timeout: Some(Duration::from_secs(2)),
            ..MultiplexerConfig::default()
        };
        let (mux, mut peer) = setup(config);
        let mut channel = open_session(&mux, &mut peer, 4, 512).await;

        let result = channel.write(b"more than four").await;
        assert!(matches!(result, Err(TernError::Timeout(_))));
        let _data = peer.next().await;
        let close = ChannelClose::from_bytes(&peer.next().await).unwrap();
        assert_eq!(close.recipient_channel, 100);
        assert_eq!(mux.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_transport_loss_fails_pending_operations() {
        let (mux, mut peer) = setup(MultiplexerConfig::default());
        let mut reader = open_session(&mux, &mut peer, 1024, 512).await;
        let mut writer = open_session(&mux, &mut peer, 0, 512).await;

        let blocked = tokio::spawn(async move { writer.write(b"stuck").await });
        tokio::task::yield_now().await;
        peer.hang_up();

        assert!(matches!(reader.read().await, Err(TernError::TransportClosed(_))));
        assert!(matches!(blocked.await.unwrap(), Err(TernError::TransportClosed(_))));
    }

    #[tokio::test]
    async fn test_exec_and_exit_status() {
        let (mux, mut peer) = setup(MultiplexerConfig::default());
        let mut channel = open_session(&mux, &mut peer, 1024, 512).await;
        let id = channel.id();

        let server = async {
            let request = ChannelRequest::from_bytes(&peer.next().await).unwrap();
            assert_eq!(
                request.request,
                ChannelRequestType::Exec { command: "true".to_string() }
            );
            peer.send(ChannelSuccess { recipient_channel: id }.to_bytes());
            peer.send(
                ChannelRequest {
                    recipient_channel: id,
                    want_reply: false,
                    request: ChannelRequestType::ExitStatus { exit_status: 3 },
                }
                .to_bytes(),
            );
            peer.send(ChannelEof { recipient_channel: id }.to_bytes());
        };
        let (exec, _) = tokio::join!(channel.exec("true"), server);
        exec.unwrap();
        assert!(channel.read().await.unwrap().is_none());
        assert_eq!(channel.exit_status(), Some(&ExitStatus::Code(3)));

        let refuse = async {
            peer.next().await;
            peer.send(ChannelFailure { recipient_channel: id }.to_bytes());
        };
        let (subsystem, _) = tokio::join!(channel.subsystem("sftp"), refuse);
        assert!(matches!(subsystem, Err(TernError::RequestFailed(_))));
    }

    #[tokio::test]
    async fn test_inbound_requests_get_failure() {
        let (mux, mut peer) = setup(MultiplexerConfig::default());
        let channel = open_session(&mux, &mut peer, 1024, 512).await;

        peer.send(
            ChannelRequest {
                recipient_channel: channel.id(),
                want_reply: true,
                request: ChannelRequestType::Other {
                    name: "keepalive@openssh.com".to_string(),
                    data: vec![],
                },
            }
            .to_bytes(),
        );
        let failure = ChannelFailure::from_bytes(&peer.next().await).unwrap();
        assert_eq!(failure.recipient_channel, 100);

        peer.send(
            GlobalRequest {
                want_reply: true,
                request: GlobalRequestType::Other {
                    name: "hostkeys-00@openssh.com".to_string(),
                    data: vec![],
                },
            }
            .to_bytes(),
        );
        assert_eq!(peer.next().await, vec![MessageType::RequestFailure as u8]);
    }

    #[tokio::test]
    async fn test_stderr_is_separate() {
        let (mux, mut peer) = setup(MultiplexerConfig::default());
        let mut channel = open_session(&mux, &mut peer, 1024, 512).await;

        peer.send(
            ChannelExtendedData {
                recipient_channel: channel.id(),
                data_type: EXTENDED_DATA_STDERR,
                data: b"warning".to_vec(),
            }
            .to_bytes(),
        );
        peer.send(ChannelData { recipient_channel: channel.id(), data: b"out".to_vec() }.to_bytes());

        assert_eq!(channel.read().await.unwrap().unwrap(), b"out");
        assert_eq!(channel.read_stderr().await.unwrap().unwrap(), b"warning");
    }

    #[tokio::test]
    async fn test_dropped_channel_sends_close_and_tolerates_late_data() {
        let (mux, mut peer) = setup(MultiplexerConfig::default());
        let channel = open_session(&mux, &mut peer, 1024, 512).await;
        let id = channel.id();
        drop(channel);

        let close = ChannelClose::from_bytes(&peer.next().await).unwrap();
        assert_eq!(close.recipient_channel, 100);

        // In flight before the peer saw our CLOSE.
        peer.send(ChannelData { recipient_channel: id, data: b"late".to_vec() }.to_bytes());
        peer.send(ChannelClose { recipient_channel: id }.to_bytes());

        // The id is free again and the connection survived.
        let next = open_session(&mux, &mut peer, 1024, 512).await;
        assert_ne!(next.id(), id);
        assert!(!mux.is_closed());
    }
}
