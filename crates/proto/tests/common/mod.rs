//! In-process SSH server for integration tests.
//!
//! Speaks just enough of the server side to drive the client: version
//! exchange, ECDH key exchange signed with an Ed25519 host key (rekeys are
//! answered transparently), the `ssh-userauth` service with the `none`
//! method, and hand-scripted connection messages.

#![allow(dead_code)]

use bytes::{BufMut, BytesMut};
use ed25519_dalek::{Signer, SigningKey};
use std::collections::HashMap;
use std::sync::Arc;
use tern_proto::ssh::client::{NoneAuthenticator, SshClient, SshClientConfig};
use tern_proto::ssh::connection::{
    ChannelOpen, ChannelOpenConfirmation, ChannelRequest, ChannelRequestType, ChannelType,
};
use tern_proto::ssh::hostkey::{HostKeyVerifier, PublicHostKey};
use tern_proto::ssh::kex::{AlgorithmPreferences, KexInit, NegotiatedAlgorithms};
use tern_proto::ssh::kex_dh::{
    derive_direction_keys, exchange_hash, ExchangeHashInput, KexAgreement, KexdhInit, KexdhReply,
};
use tern_proto::ssh::packet::{PacketOpener, PacketSealer};
use tern_proto::ssh::version;
use tern_proto::ssh::wire::{read_string, write_bytes, write_string};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

pub const SERVER_VERSION: &str = "SSH-2.0-FakeServer_1.0";

/// Host key seed shared by every test server.
pub const HOST_SEED: [u8; 32] = [0x5a; 32];

pub fn host_key() -> SigningKey {
    SigningKey::from_bytes(&HOST_SEED)
}

pub fn host_blob(key: &SigningKey) -> Vec<u8> {
    let mut buf = BytesMut::new();
    write_string(&mut buf, "ssh-ed25519");
    write_bytes(&mut buf, key.verifying_key().as_bytes());
    buf.to_vec()
}

pub fn accept_all() -> Arc<dyn HostKeyVerifier> {
    Arc::new(|_: &PublicHostKey, _: &str| true)
}

/// Server preferences narrowed so the suite is predictable.
pub fn server_preferences(kex: &str) -> AlgorithmPreferences {
    AlgorithmPreferences {
        kex: vec![kex.to_string()],
        host_key: vec!["ssh-ed25519".to_string()],
        cipher: vec!["aes256-ctr".to_string(), "aes128-ctr".to_string()],
        mac: vec!["hmac-sha2-256".to_string()],
        ..AlgorithmPreferences::default()
    }
}

struct Round {
    client_kexinit: Vec<u8>,
    server_kexinit: Vec<u8>,
    suite: NegotiatedAlgorithms,
    pending_inbound: Option<tern_proto::ssh::crypto::DirectionKeys>,
}

/// Server end of one connection.
pub struct FakeServer {
    stream: DuplexStream,
    opener: PacketOpener,
    sealer: PacketSealer,
    buf: BytesMut,
    host: SigningKey,
    preferences: AlgorithmPreferences,
    client_version: String,
    session_id: Option<Vec<u8>>,
    round: Option<Round>,
    /// Our channel id to the client's, from confirmed opens.
    peers: HashMap<u32, u32>,
    /// Completed key exchanges.
    pub exchanges: u32,
}

impl FakeServer {
    /// Sends our identification and reads the client's.
    pub async fn start(stream: DuplexStream, preferences: AlgorithmPreferences) -> Self {
        let mut stream = stream;
        stream
            .write_all(format!("{}\r\n", SERVER_VERSION).as_bytes())
            .await
            .unwrap();
        let (_, client_version) = version::read_identification(&mut stream).await.unwrap();
        Self {
            stream,
            opener: PacketOpener::new(),
            sealer: PacketSealer::new(),
            buf: BytesMut::new(),
            host: host_key(),
            preferences,
            client_version,
            session_id: None,
            round: None,
            peers: HashMap::new(),
            exchanges: 0,
        }
    }

    /// Replaces the host key used for later exchanges.
    pub fn set_host_key(&mut self, host: SigningKey) {
        self.host = host;
    }

    async fn recv_raw(&mut self) -> Option<Vec<u8>> {
        loop {
            if let Some(payload) = self.opener.open(&mut self.buf).unwrap() {
                return Some(payload);
            }
            match self.stream.read_buf(&mut self.buf).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    pub async fn send(&mut self, payload: &[u8]) {
        let sealed = self.sealer.seal(payload).unwrap();
        self.stream.write_all(&sealed).await.unwrap();
    }

    /// Next payload that is not a transport message. Key exchanges the
    /// client starts are answered along the way; `None` once the client is gone.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        loop {
            let payload = self.recv_raw().await?;
            match payload[0] {
                2 | 4 => continue,
                20 | 30 | 21 => self.on_kex(&payload).await,
                _ => return Some(payload),
            }
        }
    }

    /// Runs the open key exchange to completion; returns application
    /// payloads that arrived before the client switched to it.
    pub async fn complete_rekey(&mut self) -> Vec<Vec<u8>> {
        let target = self.exchanges + 1;
        let mut held = Vec::new();
        while self.exchanges < target {
            let payload = self.recv_raw().await.expect("client left during rekey");
            match payload[0] {
                2 | 4 => {}
                20 | 30 | 21 => self.on_kex(&payload).await,
                _ => held.push(payload),
            }
        }
        held
    }

    /// Starts a key exchange from the server side.
    pub async fn start_rekey(&mut self) {
        let kexinit = KexInit::new(&self.preferences).to_bytes();
        self.send(&kexinit).await;
        self.round = Some(Round {
            client_kexinit: Vec::new(),
            server_kexinit: kexinit,
            suite: placeholder_suite(),
            pending_inbound: None,
        });
    }

    async fn on_kex(&mut self, payload: &[u8]) {
        match payload[0] {
            20 => {
                let server_kexinit = match self.round.take() {
                    Some(round) => round.server_kexinit,
                    None => {
                        let ours = KexInit::new(&self.preferences).to_bytes();
                        self.send(&ours).await;
                        ours
                    }
                };
                let client = KexInit::from_bytes(payload).unwrap();
                let server = KexInit::from_bytes(&server_kexinit).unwrap();
                let suite = NegotiatedAlgorithms::negotiate(&client, &server).unwrap();
                self.round = Some(Round {
                    client_kexinit: payload.to_vec(),
                    server_kexinit,
                    suite,
                    pending_inbound: None,
                });
            }
            30 => {
                let host_blob = host_blob(&self.host);
                let round = self.round.as_mut().expect("KEXDH_INIT before KEXINIT");
                let suite = round.suite;
                let agreement = KexAgreement::start(suite.kex).unwrap();
                let mpint = agreement.uses_mpint();
                let init = KexdhInit::from_bytes(payload, mpint).unwrap();
                let server_public = agreement.local_public();
                let shared = agreement.finish(&init.public).unwrap();

                let hash = suite.kex.hash();
                let h = exchange_hash(
                    hash,
                    &ExchangeHashInput {
                        client_version: &self.client_version,
                        server_version: SERVER_VERSION,
                        client_kexinit: &round.client_kexinit,
                        server_kexinit: &round.server_kexinit,
                        host_key: &host_blob,
                        client_public: &init.public,
                        server_public: &server_public,
                        shared_secret: &shared,
                        public_as_mpint: mpint,
                    },
                );
                let session_id = self.session_id.get_or_insert_with(|| h.clone()).clone();

                let mut signature = BytesMut::new();
                write_string(&mut signature, "ssh-ed25519");
                write_bytes(&mut signature, &self.host.sign(&h).to_bytes());

                let outbound = derive_direction_keys(
                    hash,
                    &shared,
                    &h,
                    &session_id,
                    (b'B', b'D', b'F'),
                    suite.cipher_s2c,
                    suite.mac_s2c,
                    suite.compression_s2c,
                )
                .unwrap();
                round.pending_inbound = Some(
                    derive_direction_keys(
                        hash,
                        &shared,
                        &h,
                        &session_id,
                        (b'A', b'C', b'E'),
                        suite.cipher_c2s,
                        suite.mac_c2s,
                        suite.compression_c2s,
                    )
                    .unwrap(),
                );

                let reply = KexdhReply {
                    host_key: host_blob,
                    public: server_public,
                    signature: signature.to_vec(),
                };
                self.send(&reply.to_bytes(mpint)).await;
                self.send(&[21]).await;
                self.sealer.install(outbound);
            }
            21 => {
                let mut round = self.round.take().expect("NEWKEYS outside an exchange");
                let inbound = round.pending_inbound.take().expect("NEWKEYS before reply");
                self.opener.install(inbound);
                self.exchanges += 1;
            }
            _ => unreachable!(),
        }
    }

    /// Accepts `ssh-userauth` and the `none` method.
    pub async fn accept_auth(&mut self) {
        let request = self.recv().await.unwrap();
        assert_eq!(request[0], 5);
        let mut offset = 1;
        assert_eq!(read_string(&request, &mut offset).unwrap(), "ssh-userauth");

        let mut accept = BytesMut::new();
        accept.put_u8(6);
        write_string(&mut accept, "ssh-userauth");
        self.send(&accept).await;

        let auth = self.recv().await.unwrap();
        assert_eq!(auth[0], 50);
        self.send(&[52]).await;
    }

    /// Confirms the next CHANNEL_OPEN with our id `server_id`; returns it.
    pub async fn accept_open(&mut self, server_id: u32, window: u32, max_packet: u32) -> ChannelOpen {
        let open = ChannelOpen::from_bytes(&self.recv().await.unwrap()).unwrap();
        let confirm = ChannelOpenConfirmation {
            recipient_channel: open.sender_channel,
            sender_channel: server_id,
            initial_window: window,
            max_packet,
        };
        self.send(&confirm.to_bytes()).await;
        self.peers.insert(server_id, open.sender_channel);
        open
    }

    /// Client channel id for one of our confirmed channels.
    pub fn client_channel(&self, server_id: u32) -> u32 {
        *self
            .peers
            .get(&server_id)
            .unwrap_or_else(|| panic!("no confirmed channel {}", server_id))
    }

    /// Reads a channel request and answers it when a reply is wanted.
    pub async fn answer_request(&mut self, success: bool) -> ChannelRequest {
        let request = ChannelRequest::from_bytes(&self.recv().await.unwrap()).unwrap();
        if request.want_reply {
            let mut reply = BytesMut::new();
            reply.put_u8(if success { 99 } else { 100 });
            reply.put_u32(self.client_channel(request.recipient_channel));
            self.send(&reply).await;
        }
        request
    }

    /// Sends CHANNEL_DATA (or EXTENDED_DATA for stderr).
    pub async fn data(&mut self, recipient: u32, stderr: bool, data: &[u8]) {
        let mut msg = BytesMut::new();
        if stderr {
            msg.put_u8(95);
            msg.put_u32(recipient);
            msg.put_u32(1);
        } else {
            msg.put_u8(94);
            msg.put_u32(recipient);
        }
        write_bytes(&mut msg, data);
        self.send(&msg).await;
    }

    /// Sends exit-status, EOF and CLOSE, then waits for the client's CLOSE.
    pub async fn finish_exec(&mut self, recipient: u32, exit_status: u32) {
        let status = ChannelRequest {
            recipient_channel: recipient,
            want_reply: false,
            request: ChannelRequestType::ExitStatus { exit_status },
        };
        self.send(&status.to_bytes()).await;
        self.send(&channel_msg(96, recipient)).await;
        self.send(&channel_msg(97, recipient)).await;
        loop {
            let msg = self.recv().await.unwrap();
            if msg[0] == 97 {
                break;
            }
        }
    }

    /// Opens a `forwarded-tcpip` channel towards the client.
    pub async fn open_forwarded(&mut self, server_id: u32, bind_host: &str, bind_port: u16) {
        let open = ChannelOpen {
            channel_type: ChannelType::ForwardedTcpip(
                tern_proto::ssh::Parameters::new("203.0.113.7", 40001, bind_host, bind_port),
            ),
            sender_channel: server_id,
            initial_window: 1 << 20,
            max_packet: 32 * 1024,
        };
        self.send(&open.to_bytes()).await;
    }
}

/// A message that carries only a recipient channel (EOF, CLOSE, ...).
pub fn channel_msg(msg_type: u8, recipient: u32) -> Vec<u8> {
    let mut msg = BytesMut::new();
    msg.put_u8(msg_type);
    msg.put_u32(recipient);
    msg.to_vec()
}

fn placeholder_suite() -> NegotiatedAlgorithms {
    let ours = KexInit::new_default();
    NegotiatedAlgorithms::negotiate(&ours, &ours).unwrap()
}

/// Installs a test subscriber; `RUST_LOG` overrides the default `warn`.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Client and server joined by an in-memory pipe, handshake and auth done.
pub async fn connected(
    config: SshClientConfig,
    preferences: AlgorithmPreferences,
) -> (SshClient, FakeServer) {
    init_tracing();
    let (client_end, server_end) = tokio::io::duplex(256 * 1024);
    let server = tokio::spawn(async move {
        let mut server = FakeServer::start(server_end, preferences).await;
        server.accept_auth().await;
        server
    });

    let mut client = SshClient::connect_stream(client_end, "fake-server:22", config, accept_all())
        .await
        .unwrap();
    client
        .authenticate(&mut NoneAuthenticator::new("tester"))
        .await
        .unwrap();
    (client, server.await.unwrap())
}
