//! Integration tests for the SSH client against an in-process server.
//!
//! These tests validate the complete client flow including:
//! - Version exchange and ECDH key exchange with signature verification
//! - Host key verification
//! - Authentication hand-off
//! - Command execution with stdout/stderr separation and exit status
//! - Client and server initiated rekeying under traffic
//! - Channel flow control

mod common;

use bytes::{BufMut, BytesMut};
use common::{connected, host_blob, host_key, server_preferences, FakeServer};
use std::sync::Arc;
use tern_platform::TernError;
use tern_proto::ssh::channel::ExitStatus;
use tern_proto::ssh::client::{SshClient, SshClientConfig};
use tern_proto::ssh::connection::{ChannelData, ChannelRequestType};
use tern_proto::ssh::hostkey::{HostKeyAlgorithm, HostKeyVerifier, PinnedHostKeys, PublicHostKey};
use tern_proto::ssh::kex::KexMethod;
use tern_proto::ssh::transport::State;
use tern_proto::ssh::wire::read_u32;
use tokio::time::{timeout, Duration};

const LIMIT: Duration = Duration::from_secs(10);

/// Plays one `exec` on the server: confirms the channel, accepts the
/// command, sends output and exit status.
async fn serve_exec(server: &mut FakeServer, stdout: &[u8], stderr: &[u8], code: u32) -> String {
    let open = server.accept_open(100, 1 << 20, 32 * 1024).await;
    let client_id = open.sender_channel;
    let request = server.answer_request(true).await;
    let command = match request.request {
        ChannelRequestType::Exec { command } => command,
        other => panic!("expected exec, got {:?}", other),
    };
    if !stdout.is_empty() {
        server.data(client_id, false, stdout).await;
    }
    if !stderr.is_empty() {
        server.data(client_id, true, stderr).await;
    }
    server.finish_exec(client_id, code).await;
    command
}

/// Test handshake results exposed by the client.
#[tokio::test]
async fn test_handshake_and_negotiated_suite() {
    let (client, _server) = timeout(
        LIMIT,
        connected(SshClientConfig::default(), server_preferences("ecdh-sha2-nistp256")),
    )
    .await
    .unwrap();

    assert_eq!(client.server_version().software(), "FakeServer_1.0");
    assert_eq!(client.state(), State::Established);
    assert_eq!(client.key_exchanges(), 1);
    assert!(client.is_authenticated());

    let suite = client.negotiated().unwrap();
    assert_eq!(suite.kex, KexMethod::EcdhSha2Nistp256);
    assert_eq!(suite.host_key, HostKeyAlgorithm::SshEd25519);

    let key = client.server_host_key().unwrap();
    assert_eq!(key.blob(), host_blob(&host_key()).as_slice());
    assert_eq!(client.session_id().unwrap().len(), 32);
}

/// Test every ECDH curve end to end.
#[tokio::test]
async fn test_ecdh_curves() {
    for (name, method, hash_len) in [
        ("ecdh-sha2-nistp256", KexMethod::EcdhSha2Nistp256, 32),
        ("ecdh-sha2-nistp384", KexMethod::EcdhSha2Nistp384, 48),
        ("ecdh-sha2-nistp521", KexMethod::EcdhSha2Nistp521, 64),
    ] {
        let (client, _server) = timeout(LIMIT, connected(SshClientConfig::default(), server_preferences(name)))
            .await
            .unwrap();
        assert_eq!(client.negotiated().unwrap().kex, method);
        assert_eq!(client.session_id().unwrap().len(), hash_len);
    }
}

/// Test that a rejected host key aborts the handshake.
#[tokio::test]
async fn test_host_key_rejected() {
    let (client_end, server_end) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn(async move {
        let mut server = FakeServer::start(server_end, server_preferences("ecdh-sha2-nistp256")).await;
        // Runs the exchange, then sees DISCONNECT.
        server.recv().await
    });

    let verifier = Arc::new(PinnedHostKeys::new(["SHA256:not-the-right-key"]));
    let err = SshClient::connect_stream(client_end, "fake:22", SshClientConfig::default(), verifier)
        .await
        .unwrap_err();
    assert!(matches!(err, TernError::HostKeyVerification(_)));

    let disconnect = timeout(LIMIT, server).await.unwrap().unwrap();
    if let Some(msg) = disconnect {
        assert_eq!(msg[0], 1);
        let mut offset = 1;
        assert_eq!(read_u32(&msg, &mut offset).unwrap(), 9);
    }
}

/// Test that the verifier sees the fingerprint and the identity.
#[tokio::test]
async fn test_verifier_receives_identity() {
    let expected = PublicHostKey::parse(&host_blob(&host_key())).unwrap().fingerprint();
    let (client_end, server_end) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        let mut server = FakeServer::start(server_end, server_preferences("ecdh-sha2-nistp256")).await;
        while server.recv().await.is_some() {}
    });

    let verifier: Arc<dyn HostKeyVerifier> = Arc::new(move |key: &PublicHostKey, identity: &str| {
        identity == "build-box:2222" && key.fingerprint() == expected
    });
    let client = SshClient::connect_stream(client_end, "build-box:2222", SshClientConfig::default(), verifier)
        .await
        .unwrap();
    assert_eq!(client.server_address(), "build-box:2222");
}

/// Test exec with stdout, stderr and exit status.
#[tokio::test]
async fn test_exec_collects_output() {
    let (client, mut server) = connected(SshClientConfig::default(), server_preferences("ecdh-sha2-nistp256")).await;
    let server = tokio::spawn(async move {
        let command = serve_exec(&mut server, b"hello\n", b"warning: none\n", 3).await;
        (server, command)
    });

    let output = timeout(LIMIT, client.exec("echo hello")).await.unwrap().unwrap();
    assert_eq!(output.stdout, b"hello\n");
    assert_eq!(output.stderr, b"warning: none\n");
    assert_eq!(output.exit_status, Some(ExitStatus::Code(3)));
    assert!(!output.success());

    let (_server, command) = server.await.unwrap();
    assert_eq!(command, "echo hello");
}

/// Test that a refused exec surfaces as RequestFailed.
#[tokio::test]
async fn test_exec_refused() {
    let (client, mut server) = connected(SshClientConfig::default(), server_preferences("ecdh-sha2-nistp256")).await;
    tokio::spawn(async move {
        server.accept_open(4, 1 << 20, 32 * 1024).await;
        server.answer_request(false).await;
        while server.recv().await.is_some() {}
    });

    let err = timeout(LIMIT, client.exec("rm -rf /")).await.unwrap().unwrap_err();
    assert!(matches!(err, TernError::RequestFailed(_)));
}

/// Test a client initiated rekey between two commands.
#[tokio::test]
async fn test_client_rekey_keeps_session_id() {
    let (client, mut server) = connected(SshClientConfig::default(), server_preferences("ecdh-sha2-nistp256")).await;
    let session_id = client.session_id();

    let server = tokio::spawn(async move {
        serve_exec(&mut server, b"one", b"", 0).await;
        serve_exec(&mut server, b"two", b"", 0).await;
        server
    });

    let first = timeout(LIMIT, client.exec("first")).await.unwrap().unwrap();
    assert_eq!(first.stdout, b"one");

    client.rekey().unwrap();
    // The open is held back until the new keys are in place.
    let second = timeout(LIMIT, client.exec("second")).await.unwrap().unwrap();
    assert_eq!(second.stdout, b"two");
    assert!(second.success());

    let server = server.await.unwrap();
    assert_eq!(server.exchanges, 2);
    assert_eq!(client.key_exchanges(), 2);
    assert_eq!(client.session_id(), session_id);
    assert_eq!(client.state(), State::Established);
}

/// Test a server initiated rekey while a channel is open.
#[tokio::test]
async fn test_server_rekey_mid_channel() {
    let (client, mut server) = connected(SshClientConfig::default(), server_preferences("ecdh-sha2-nistp384")).await;

    let server = tokio::spawn(async move {
        let open = server.accept_open(9, 1 << 20, 32 * 1024).await;
        let client_id = open.sender_channel;
        server.answer_request(true).await;
        server.data(client_id, false, b"before ").await;

        server.start_rekey().await;
        // Nothing but key exchange goes out until our NEWKEYS.
        let mut held = server.complete_rekey().await;
        if held.is_empty() {
            held.push(server.recv().await.unwrap());
        }
        let data = ChannelData::from_bytes(&held[0]).unwrap();
        assert_eq!(data.data, b"ping");

        server.data(client_id, false, b"after").await;
        server.finish_exec(client_id, 0).await;
        server
    });

    let mut channel = client.open_session().await.unwrap();
    channel.exec("cat").await.unwrap();
    channel.write(b"ping").await.unwrap();
    let output = timeout(LIMIT, channel.read_to_end()).await.unwrap().unwrap();
    assert_eq!(output, b"before after");
    assert_eq!(channel.finish().await.unwrap(), Some(ExitStatus::Code(0)));

    let server = server.await.unwrap();
    assert_eq!(server.exchanges, 2);
    assert_eq!(client.key_exchanges(), 2);
}

/// Test that writes respect the peer's window and packet size.
#[tokio::test]
async fn test_write_respects_remote_window() {
    let (client, mut server) = connected(SshClientConfig::default(), server_preferences("ecdh-sha2-nistp256")).await;

    let server = tokio::spawn(async move {
        let open = server.accept_open(1, 1000, 400).await;
        let client_id = open.sender_channel;

        let mut received = Vec::new();
        while received.len() < 1000 {
            let data = ChannelData::from_bytes(&server.recv().await.unwrap()).unwrap();
            assert!(data.data.len() <= 400);
            received.extend_from_slice(&data.data);
        }
        assert_eq!(received.len(), 1000);

        let mut adjust = BytesMut::new();
        adjust.put_u8(93);
        adjust.put_u32(client_id);
        adjust.put_u32(5000);
        server.send(&adjust).await;

        while received.len() < 2500 {
            let data = ChannelData::from_bytes(&server.recv().await.unwrap()).unwrap();
            assert!(data.data.len() <= 400);
            received.extend_from_slice(&data.data);
        }
        let eof = server.recv().await.unwrap();
        assert_eq!(eof[0], 96);
        received
    });

    let mut channel = client.open_session().await.unwrap();
    let payload: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
    timeout(LIMIT, channel.write(&payload)).await.unwrap().unwrap();
    channel.eof().await.unwrap();

    assert_eq!(server.await.unwrap(), payload);
}

/// Test that a window timeout fails a stalled write.
#[tokio::test]
async fn test_window_timeout() {
    let config = SshClientConfig {
        window_timeout: Some(Duration::from_millis(200)),
        ..SshClientConfig::default()
    };
    let (client, mut server) = connected(config, server_preferences("ecdh-sha2-nistp256")).await;
    tokio::spawn(async move {
        server.accept_open(1, 10, 10).await;
        while server.recv().await.is_some() {}
    });

    let mut channel = client.open_session().await.unwrap();
    let err = timeout(LIMIT, channel.write(&[0u8; 64])).await.unwrap().unwrap_err();
    assert!(matches!(err, TernError::Timeout(_)));
}

/// Test DISCONNECT on client shutdown.
#[tokio::test]
async fn test_disconnect() {
    let (mut client, mut server) = connected(SshClientConfig::default(), server_preferences("ecdh-sha2-nistp256")).await;
    let server = tokio::spawn(async move { server.recv().await });

    client.disconnect().await.unwrap();
    assert_eq!(client.state(), State::Closed);

    let msg = timeout(LIMIT, server).await.unwrap().unwrap().unwrap();
    assert_eq!(msg[0], 1);
    let mut offset = 1;
    assert_eq!(read_u32(&msg, &mut offset).unwrap(), 11);

    assert!(client.open_session().await.is_err());
}

/// Test that losing the connection fails pending reads.
#[tokio::test]
async fn test_connection_loss_fails_channels() {
    let (client, mut server) = connected(SshClientConfig::default(), server_preferences("ecdh-sha2-nistp256")).await;
    let server = tokio::spawn(async move {
        let open = server.accept_open(2, 1 << 20, 32 * 1024).await;
        server.data(open.sender_channel, false, b"partial").await;
        server
    });

    let mut channel = client.open_session().await.unwrap();
    assert_eq!(channel.read().await.unwrap().unwrap(), b"partial");
    drop(server.await.unwrap());

    let err = timeout(LIMIT, channel.read()).await.unwrap().unwrap_err();
    assert!(matches!(err, TernError::TransportClosed(_)));
    assert!(client.multiplexer().unwrap().is_closed());
}

/// Test that an unknown channel type from the server is refused.
#[tokio::test]
async fn test_server_open_of_unknown_type_refused() {
    let (_client, mut server) = connected(SshClientConfig::default(), server_preferences("ecdh-sha2-nistp256")).await;

    let mut open = BytesMut::new();
    open.put_u8(90);
    tern_proto::ssh::wire::write_string(&mut open, "x11");
    open.put_u32(5);
    open.put_u32(1024);
    open.put_u32(1024);
    tern_proto::ssh::wire::write_string(&mut open, "127.0.0.1");
    open.put_u32(6010);
    server.send(&open).await;

    let failure = timeout(LIMIT, server.recv()).await.unwrap().unwrap();
    assert_eq!(failure[0], 92);
    let mut offset = 1;
    assert_eq!(read_u32(&failure, &mut offset).unwrap(), 5);
    assert_eq!(read_u32(&failure, &mut offset).unwrap(), 3);
}

/// Test the pinned host key verifier against a real exchange.
#[tokio::test]
async fn test_pinned_host_key_accepts() {
    let fingerprint = PublicHostKey::parse(&host_blob(&host_key())).unwrap().fingerprint();
    let (client_end, server_end) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        let mut server = FakeServer::start(server_end, server_preferences("ecdh-sha2-nistp521")).await;
        while server.recv().await.is_some() {}
    });

    let verifier = Arc::new(PinnedHostKeys::new([fingerprint]));
    let client = SshClient::connect_stream(client_end, "fake:22", SshClientConfig::default(), verifier)
        .await
        .unwrap();
    assert_eq!(client.key_exchanges(), 1);
}
