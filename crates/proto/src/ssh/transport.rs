//! SSH Transport Layer State Machine (RFC 4253).
//!
//! This module holds the synchronous half of the transport: the connection
//! lifecycle, rekey accounting, and the [`KexDriver`] that turns inbound key
//! exchange messages into outbound messages and key installations. The async
//! runtime in [`crate::ssh::connection_mgr`] feeds it packets and applies the
//! returned [`KexAction`]s in order.
//!
//! # Transport States
//!
//! ```text
//! Connecting -> AlgorithmNegotiation -> KeyExchange -> Established
//!                                                        |    ^
//!                                                        v    |
//!                                                      Rekeying
//! any -> Closing -> Closed
//! ```
//!
//! # Rekeying
//!
//! A new key exchange is started when:
//! - Data transferred since the last exchange reaches the byte limit (1 GiB by default)
//! - Time since the last exchange reaches the time limit (1 hour by default)
//! - The application asks for it
//! - The server sends SSH_MSG_KEXINIT
//!
//! # Example
//!
//! ```rust
//! use tern_proto::ssh::transport::{State, TransportConfig, TransportState};
//!
//! let mut state = TransportState::new(&TransportConfig::default());
//! assert_eq!(state.current(), State::Connecting);
//! state.transition(State::AlgorithmNegotiation).unwrap();
//! ```

use crate::ssh::crypto::DirectionKeys;
use crate::ssh::hostkey::{HostKeyVerifier, PublicHostKey};
use crate::ssh::kex::{AlgorithmPreferences, KexInit, NegotiatedAlgorithms, NewKeys};
use crate::ssh::kex_dh::{
    derive_direction_keys, exchange_hash, ExchangeHashInput, KexAgreement, KexdhInit, KexdhReply,
};
use crate::ssh::message::MessageType;
use crate::ssh::version::Version;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tern_platform::{TernError, TernResult};
use tracing::{debug, info};

/// SSH transport layer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// TCP connected, version exchange in progress.
    Connecting,
    /// First KEXINIT sent, waiting for the server's.
    AlgorithmNegotiation,
    /// First key exchange running.
    KeyExchange,
    /// Keys installed; application traffic flows.
    Established,
    /// A later key exchange is running. Application traffic already queued
    /// still drains under the old keys.
    Rekeying,
    /// Disconnect sent or being sent.
    Closing,
    /// Transport is gone.
    Closed,
}

/// Why a rekey started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RekeyReason {
    /// Byte threshold crossed.
    Bytes,
    /// Time threshold crossed.
    Time,
    /// Explicit request.
    Requested,
    /// Server sent KEXINIT.
    Peer,
}

/// Transport layer configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Our SSH version string.
    pub version: Version,

    /// Our algorithm preferences (KEXINIT).
    pub algorithms: AlgorithmPreferences,

    /// Bytes (both directions) before automatic rekey (default: 1 GiB).
    pub rekey_bytes_limit: u64,

    /// Time before automatic rekey (default: 1 hour).
    pub rekey_time_limit: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            version: Version::default_tern(),
            algorithms: AlgorithmPreferences::default(),
            rekey_bytes_limit: 1 << 30,
            rekey_time_limit: Duration::from_secs(3600),
        }
    }
}

impl TransportConfig {
    /// Checks algorithm lists and limits.
    pub fn validate(&self) -> TernResult<()> {
        if self.rekey_bytes_limit == 0 {
            return Err(TernError::Config(
                "rekey_bytes_limit must be positive".to_string(),
            ));
        }
        if self.rekey_time_limit.is_zero() {
            return Err(TernError::Config(
                "rekey_time_limit must be positive".to_string(),
            ));
        }
        self.algorithms.validate()
    }
}

/// Lifecycle state plus rekey accounting.
#[derive(Debug)]
pub struct TransportState {
    state: State,
    bytes_since_kex: u64,
    last_kex: Instant,
    rekey_bytes_limit: u64,
    rekey_time_limit: Duration,
}

impl TransportState {
    /// Creates a state machine in [`State::Connecting`].
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            state: State::Connecting,
            bytes_since_kex: 0,
            last_kex: Instant::now(),
            rekey_bytes_limit: config.rekey_bytes_limit,
            rekey_time_limit: config.rekey_time_limit,
        }
    }

    /// Returns the current state.
    pub fn current(&self) -> State {
        self.state
    }

    /// Transitions to the next state.
    ///
    /// # Errors
    ///
    /// Returns [`TernError::Protocol`] for a transition the lifecycle does
    /// not allow (e.g. `Connecting -> Established`).
    pub fn transition(&mut self, next: State) -> TernResult<()> {
        let valid = match (self.state, next) {
            (State::Connecting, State::AlgorithmNegotiation) => true,
            (State::AlgorithmNegotiation, State::KeyExchange) => true,
            (State::KeyExchange, State::Established) => true,
            (State::Established, State::Rekeying) => true,
            (State::Rekeying, State::Established) => true,
            (State::Closed, _) => false,
            (_, State::Closing) | (_, State::Closed) => true,
            (s1, s2) if s1 == s2 => true,
            _ => false,
        };

        if !valid {
            return Err(TernError::Protocol(format!(
                "Invalid state transition: {:?} -> {:?}",
                self.state, next
            )));
        }

        self.state = next;
        Ok(())
    }

    /// Records bytes sent or received.
    pub fn add_bytes(&mut self, bytes: u64) {
        self.bytes_since_kex = self.bytes_since_kex.saturating_add(bytes);
    }

    /// Returns why a rekey is due, if it is.
    ///
    /// Only reported in [`State::Established`].
    pub fn needs_rekey(&self, now: Instant) -> Option<RekeyReason> {
        if self.state != State::Established {
            return None;
        }
        if self.bytes_since_kex >= self.rekey_bytes_limit {
            return Some(RekeyReason::Bytes);
        }
        if now.saturating_duration_since(self.last_kex) >= self.rekey_time_limit {
            return Some(RekeyReason::Time);
        }
        None
    }

    /// Resets counters after a completed key exchange.
    pub fn reset_rekey_tracking(&mut self, now: Instant) {
        self.bytes_since_kex = 0;
        self.last_kex = now;
    }
}

/// Work the runtime must perform, in order, after feeding the driver.
#[derive(Debug)]
pub enum KexAction {
    /// Queue this payload on the outbound sequence.
    Send(Vec<u8>),
    /// Switch the outbound direction to new keys, right after the preceding
    /// NEWKEYS has been written.
    InstallOutbound(DirectionKeys),
    /// Switch the inbound direction before reading the next packet.
    InstallInbound(DirectionKeys),
    /// The exchange finished.
    Complete,
}

/// Inbound keys wait here until the server's NEWKEYS arrives.
struct KexRound {
    local_kexinit: Vec<u8>,
    peer_kexinit: Option<Vec<u8>>,
    suite: Option<NegotiatedAlgorithms>,
    agreement: Option<KexAgreement>,
    pending_inbound: Option<DirectionKeys>,
    ignore_guess: bool,
}

/// Client-side key exchange state machine.
///
/// Pure and synchronous: it never touches I/O, so the caller can hold it
/// under a plain mutex for the short time a message takes to process.
pub struct KexDriver {
    state: TransportState,
    algorithms: AlgorithmPreferences,
    client_version: String,
    server_version: String,
    verifier: Arc<dyn HostKeyVerifier>,
    identity: String,
    session_id: Option<Vec<u8>>,
    host_key: Option<PublicHostKey>,
    suite: Option<NegotiatedAlgorithms>,
    round: Option<KexRound>,
    exchanges: u32,
}

impl std::fmt::Debug for KexDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KexDriver")
            .field("state", &self.state.current())
            .field("identity", &self.identity)
            .field("exchanges", &self.exchanges)
            .finish_non_exhaustive()
    }
}

impl KexDriver {
    /// Creates a driver after the version exchange.
    ///
    /// `client_version` and `server_version` are the identification lines
    /// without CR LF, exactly as sent and received.
    pub fn new(
        config: &TransportConfig,
        client_version: String,
        server_version: String,
        verifier: Arc<dyn HostKeyVerifier>,
        identity: impl Into<String>,
    ) -> Self {
        Self {
            state: TransportState::new(config),
            algorithms: config.algorithms.clone(),
            client_version,
            server_version,
            verifier,
            identity: identity.into(),
            session_id: None,
            host_key: None,
            suite: None,
            round: None,
            exchanges: 0,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.state.current()
    }

    /// Session identifier (H of the first exchange).
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    /// Host key presented in the first exchange.
    pub fn host_key(&self) -> Option<&PublicHostKey> {
        self.host_key.as_ref()
    }

    /// Suite agreed by the most recent completed exchange.
    pub fn negotiated(&self) -> Option<&NegotiatedAlgorithms> {
        self.suite.as_ref()
    }

    /// Number of completed key exchanges.
    pub fn exchanges(&self) -> u32 {
        self.exchanges
    }

    /// Whether a key exchange round is open.
    pub fn in_progress(&self) -> bool {
        self.round.is_some()
    }

    /// Whether a non-kex inbound message is acceptable now.
    ///
    /// Once the server's KEXINIT has arrived, it may only send key exchange
    /// messages until its NEWKEYS.
    pub fn accepts_application(&self) -> bool {
        match &self.round {
            Some(round) => round.peer_kexinit.is_none() && self.exchanges > 0,
            None => self.state.current() == State::Established,
        }
    }

    /// Opens a new round by producing our KEXINIT.
    ///
    /// Returns `None` when a round is already open.
    pub fn start(&mut self, reason: RekeyReason) -> TernResult<Option<Vec<u8>>> {
        if self.round.is_some() {
            return Ok(None);
        }
        match self.state.current() {
            State::Connecting => self.state.transition(State::AlgorithmNegotiation)?,
            State::Established => {
                info!(reason = ?reason, "Starting key re-exchange");
                self.state.transition(State::Rekeying)?;
            }
            other => {
                return Err(TernError::Protocol(format!(
                    "Cannot start key exchange in state {:?}",
                    other
                )))
            }
        }

        let local_kexinit = KexInit::new(&self.algorithms).to_bytes();
        self.round = Some(KexRound {
            local_kexinit: local_kexinit.clone(),
            peer_kexinit: None,
            suite: None,
            agreement: None,
            pending_inbound: None,
            ignore_guess: false,
        });
        Ok(Some(local_kexinit))
    }

    /// Counts traffic and reports whether a rekey should start now.
    pub fn note_traffic(&mut self, bytes: usize) -> Option<RekeyReason> {
        self.state.add_bytes(bytes as u64);
        if self.round.is_some() {
            return None;
        }
        self.state.needs_rekey(Instant::now())
    }

    /// Reports a due rekey without counting traffic.
    ///
    /// Polled on a timer so an idle transport still rekeys on time; messages
    /// outside the traffic count (IGNORE keepalives among them) never reach
    /// [`note_traffic`](Self::note_traffic).
    pub fn rekey_due(&self) -> Option<RekeyReason> {
        if self.round.is_some() {
            return None;
        }
        self.state.needs_rekey(Instant::now())
    }

    /// Marks the transport as closing or closed.
    pub fn close(&mut self, next: State) {
        // Closing and Closed are reachable from every live state.
        let _ = self.state.transition(next);
    }

    /// Processes one inbound key exchange message (ids 20-49).
    pub fn handle(&mut self, payload: &[u8]) -> TernResult<Vec<KexAction>> {
        let msg_type = *payload
            .first()
            .ok_or_else(|| TernError::Protocol("Empty key exchange message".to_string()))?;

        match MessageType::from_u8(msg_type) {
            Some(MessageType::KexInit) => self.on_kexinit(payload),
            Some(MessageType::KexdhReply) => self.on_reply(payload),
            Some(MessageType::NewKeys) => self.on_newkeys(payload),
            _ => {
                // A wrongly guessed first packet from the server is skipped.
                if let Some(round) = self.round.as_mut() {
                    if round.ignore_guess {
                        round.ignore_guess = false;
                        debug!(msg_type, "Ignoring wrongly guessed key exchange packet");
                        return Ok(vec![]);
                    }
                }
                Err(TernError::Protocol(format!(
                    "Unexpected key exchange message {}",
                    msg_type
                )))
            }
        }
    }

    fn on_kexinit(&mut self, payload: &[u8]) -> TernResult<Vec<KexAction>> {
        let mut actions = Vec::new();

        if self.round.is_none() {
            if let Some(local) = self.start(RekeyReason::Peer)? {
                actions.push(KexAction::Send(local));
            }
        }
        let Some(round) = self.round.as_mut() else {
            return Err(TernError::Protocol("No key exchange round".to_string()));
        };
        if round.peer_kexinit.is_some() {
            return Err(TernError::Protocol(
                "Duplicate SSH_MSG_KEXINIT in one exchange".to_string(),
            ));
        }

        let peer = KexInit::from_bytes(payload)?;
        let client = KexInit::from_bytes(&round.local_kexinit)?;
        let suite = NegotiatedAlgorithms::negotiate(&client, &peer)?;
        info!(suite = %suite, "Negotiated algorithms");

        if peer.first_kex_packet_follows() {
            let guessed_right = peer.kex_algorithms().first() == client.kex_algorithms().first()
                && peer.server_host_key_algorithms().first()
                    == client.server_host_key_algorithms().first();
            round.ignore_guess = !guessed_right;
        }

        let agreement = KexAgreement::start(suite.kex)?;
        let init = KexdhInit {
            public: agreement.local_public(),
        };
        actions.push(KexAction::Send(init.to_bytes(agreement.uses_mpint())));

        round.peer_kexinit = Some(payload.to_vec());
        round.suite = Some(suite);
        round.agreement = Some(agreement);

        if self.state.current() == State::AlgorithmNegotiation {
            self.state.transition(State::KeyExchange)?;
        }
        debug!(kex = %suite.kex, "Sent key exchange init");
        Ok(actions)
    }

    fn on_reply(&mut self, payload: &[u8]) -> TernResult<Vec<KexAction>> {
        let round = self
            .round
            .as_mut()
            .ok_or_else(|| TernError::Protocol("Key exchange reply outside an exchange".to_string()))?;
        let (Some(suite), Some(agreement), Some(peer_kexinit)) = (
            round.suite,
            round.agreement.take(),
            round.peer_kexinit.as_deref(),
        ) else {
            return Err(TernError::Protocol(
                "Key exchange reply before KEXINIT".to_string(),
            ));
        };

        let mpint = agreement.uses_mpint();
        let reply = KexdhReply::from_bytes(payload, mpint)?;
        let host_key = PublicHostKey::parse(&reply.host_key)?;

        match &self.host_key {
            Some(first) if first.blob() != host_key.blob() => {
                return Err(TernError::HostKeyVerification(format!(
                    "Host key changed during rekey: was {}, now {}",
                    first.fingerprint(),
                    host_key.fingerprint()
                )));
            }
            Some(_) => {}
            None => {
                if !self.verifier.verify(&host_key, &self.identity) {
                    return Err(TernError::HostKeyVerification(format!(
                        "Host key {} {} rejected for {}",
                        host_key.key_type(),
                        host_key.fingerprint(),
                        self.identity
                    )));
                }
            }
        }

        let client_public = agreement.local_public();
        let shared_secret = agreement.finish(&reply.public)?;
        let hash = suite.kex.hash();
        let h = exchange_hash(
            hash,
            &ExchangeHashInput {
                client_version: &self.client_version,
                server_version: &self.server_version,
                client_kexinit: &round.local_kexinit,
                server_kexinit: peer_kexinit,
                host_key: &reply.host_key,
                client_public: &client_public,
                server_public: &reply.public,
                shared_secret: &shared_secret,
                public_as_mpint: mpint,
            },
        );

        if !host_key.verify(suite.host_key, &h, &reply.signature)? {
            return Err(TernError::KeyExchangeFailed(
                "Host key signature verification failed".to_string(),
            ));
        }

        let session_id = self.session_id.get_or_insert_with(|| h.clone()).clone();
        let outbound = derive_direction_keys(
            hash,
            &shared_secret,
            &h,
            &session_id,
            (b'A', b'C', b'E'),
            suite.cipher_c2s,
            suite.mac_c2s,
            suite.compression_c2s,
        )?;
        round.pending_inbound = Some(derive_direction_keys(
            hash,
            &shared_secret,
            &h,
            &session_id,
            (b'B', b'D', b'F'),
            suite.cipher_s2c,
            suite.mac_s2c,
            suite.compression_s2c,
        )?);

        if self.host_key.is_none() {
            self.host_key = Some(host_key);
        }
        debug!("Host key signature verified");

        Ok(vec![
            KexAction::Send(NewKeys::new().to_bytes()),
            KexAction::InstallOutbound(outbound),
        ])
    }

    fn on_newkeys(&mut self, payload: &[u8]) -> TernResult<Vec<KexAction>> {
        NewKeys::from_bytes(payload)?;
        let mut round = self
            .round
            .take()
            .ok_or_else(|| TernError::Protocol("NEWKEYS outside an exchange".to_string()))?;
        let inbound = round.pending_inbound.take().ok_or_else(|| {
            TernError::Protocol("NEWKEYS before key exchange reply".to_string())
        })?;

        self.suite = round.suite;
        self.exchanges += 1;
        self.state.transition(State::Established)?;
        self.state.reset_rekey_tracking(Instant::now());
        info!(exchanges = self.exchanges, "Key exchange complete");

        Ok(vec![KexAction::InstallInbound(inbound), KexAction::Complete])
    }
}
